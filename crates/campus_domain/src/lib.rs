#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Roles known to the college backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Superadmin,
	Admin,
	Accountant,
	Counsellor,
	Examceller,
	Teacher,
	Student,
}

impl Role {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Superadmin => "superadmin",
			Role::Admin => "admin",
			Role::Accountant => "accountant",
			Role::Counsellor => "counsellor",
			Role::Examceller => "examceller",
			Role::Teacher => "teacher",
			Role::Student => "student",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown role: {0}")]
	UnknownRole(String),
	#[error("unknown namespace: {0}")]
	UnknownNamespace(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"superadmin" => Ok(Role::Superadmin),
			"admin" => Ok(Role::Admin),
			"accountant" => Ok(Role::Accountant),
			"counsellor" => Ok(Role::Counsellor),
			"examceller" => Ok(Role::Examceller),
			"teacher" => Ok(Role::Teacher),
			"student" => Ok(Role::Student),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

macro_rules! string_id {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty identifier.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Institution (college) identifier; scopes every room and conversation.
	TenantId
);
string_id!(
	/// User identifier from the user directory.
	UserId
);
string_id!(
	/// Batch (class group) name, e.g. `CSE-2025`.
	BatchName
);
string_id!(
	/// Durable conversation identifier.
	ConversationId
);

/// Server-assigned message identifier, also the opaque pagination cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected a uuid cursor: {s}")))
	}
}

/// Identity attached to a connection after authentication.
///
/// Immutable for the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub id: UserId,
	pub role: Role,
	pub email: String,
	pub tenant: TenantId,
}

/// Durable conversation resolved by `(tenant, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
	pub id: ConversationId,
	pub name: String,
	pub tenant: TenantId,
}

/// The four chat surfaces multiplexed over one transport server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
	Announcement,
	Dropbox,
	Community,
	Classroom,
}

impl Namespace {
	pub const ALL: [Namespace; 4] = [
		Namespace::Announcement,
		Namespace::Dropbox,
		Namespace::Community,
		Namespace::Classroom,
	];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Namespace::Announcement => "announcement",
			Namespace::Dropbox => "dropbox",
			Namespace::Community => "community",
			Namespace::Classroom => "classroom",
		}
	}

	/// Inbound send event name for this namespace.
	pub const fn send_event(self) -> &'static str {
		match self {
			Namespace::Announcement => "send_announcement",
			Namespace::Dropbox => "send_dropbox",
			Namespace::Community => "send_community",
			Namespace::Classroom => "send_classroom",
		}
	}

	/// Broadcast event name fanned out to the room.
	pub const fn broadcast_event(self) -> &'static str {
		match self {
			Namespace::Announcement => "new_announcement",
			Namespace::Dropbox => "new_dropbox",
			Namespace::Community => "new_community",
			Namespace::Classroom => "new_classroom",
		}
	}

	/// Error event name answered to the sender only.
	pub const fn error_event(self) -> &'static str {
		match self {
			Namespace::Dropbox => "dropbox_error",
			_ => "error_occurred",
		}
	}

	/// Fixed role allow-list gating namespace entry.
	pub const fn allowed_roles(self) -> &'static [Role] {
		match self {
			Namespace::Announcement => &[Role::Admin, Role::Superadmin],
			Namespace::Dropbox => &[
				Role::Admin,
				Role::Superadmin,
				Role::Accountant,
				Role::Counsellor,
				Role::Examceller,
				Role::Student,
				Role::Teacher,
			],
			Namespace::Community => &[
				Role::Admin,
				Role::Superadmin,
				Role::Accountant,
				Role::Counsellor,
				Role::Examceller,
				Role::Teacher,
			],
			Namespace::Classroom => &[Role::Student, Role::Teacher],
		}
	}
}

impl fmt::Display for Namespace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Namespace {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"announcement" => Ok(Namespace::Announcement),
			"dropbox" => Ok(Namespace::Dropbox),
			"community" => Ok(Namespace::Community),
			"classroom" => Ok(Namespace::Classroom),
			other => Err(ParseIdError::UnknownNamespace(other.to_string())),
		}
	}
}

/// Typed room key.
///
/// Join-side and send-side code both derive names from this constructor, so
/// the two computations cannot drift. Rooms are ephemeral multicast groups;
/// equality of keys is room identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomKey {
	Announcement { tenant: TenantId },
	Dropbox { tenant: TenantId },
	Community { tenant: TenantId, role: Role },
	Classroom { tenant: TenantId, batch: BatchName },
}

/// Logical conversation name prefix for batch class groups.
pub const CLASSGROUP_PREFIX: &str = "classgroup_";

impl RoomKey {
	pub fn namespace(&self) -> Namespace {
		match self {
			RoomKey::Announcement { .. } => Namespace::Announcement,
			RoomKey::Dropbox { .. } => Namespace::Dropbox,
			RoomKey::Community { .. } => Namespace::Community,
			RoomKey::Classroom { .. } => Namespace::Classroom,
		}
	}

	pub fn tenant(&self) -> &TenantId {
		match self {
			RoomKey::Announcement { tenant }
			| RoomKey::Dropbox { tenant }
			| RoomKey::Community { tenant, .. }
			| RoomKey::Classroom { tenant, .. } => tenant,
		}
	}

	/// Room name on the wire.
	///
	/// The classroom segment is always `student`: a batch's teachers join the
	/// same room as its students.
	pub fn wire_name(&self) -> String {
		match self {
			RoomKey::Announcement { tenant } | RoomKey::Dropbox { tenant } => {
				format!("college_{tenant}")
			}
			RoomKey::Community { tenant, role } => format!("college_{tenant}_{role}"),
			RoomKey::Classroom { tenant, batch } => {
				format!("college_{tenant}_{}_{batch}", Role::Student.as_str())
			}
		}
	}

	/// Logical name the room's conversation is registered under in the
	/// directory, unique per tenant.
	pub fn conversation_name(&self) -> String {
		match self {
			RoomKey::Announcement { .. } => "announcement".to_string(),
			RoomKey::Dropbox { .. } => "dropbox".to_string(),
			RoomKey::Community { role, .. } => format!("community_{role}"),
			RoomKey::Classroom { batch, .. } => format!("{CLASSGROUP_PREFIX}{batch}"),
		}
	}
}

impl fmt::Display for RoomKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.wire_name())
	}
}

/// Reverse the classgroup naming convention: `classgroup_<batch>` -> batch.
pub fn batch_from_classgroup(conversation_name: &str) -> Option<BatchName> {
	let rest = conversation_name.strip_prefix(CLASSGROUP_PREFIX)?;
	BatchName::new(rest).ok()
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}
