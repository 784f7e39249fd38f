#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use campus_domain::{ConversationId, Identity, MessageId, Namespace, Role, RoomKey, batch_from_classgroup};
use campus_protocol::pb;
use campus_store::{ConversationDirectory, MessageStore, NewMessage, PageRequest, RosterDirectory, StoreError, StoredMessage};
use tracing::debug;

use crate::server::authz::NamespaceSpec;
use crate::server::room_hub::RoomHub;
use crate::util::time::unix_ms_now;

/// Per-connection lifecycle phase.
///
/// Authentication and authorization failures are fatal; once `Active`, every
/// failure is answered per event and the connection stays up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
	Connecting,
	Authenticated,
	Authorized,
	RoomJoined,
	Active,
	Disconnected,
}

impl SessionPhase {
	pub const fn as_str(self) -> &'static str {
		match self {
			SessionPhase::Connecting => "connecting",
			SessionPhase::Authenticated => "authenticated",
			SessionPhase::Authorized => "authorized",
			SessionPhase::RoomJoined => "room_joined",
			SessionPhase::Active => "active",
			SessionPhase::Disconnected => "disconnected",
		}
	}
}

/// Connection-fatal rejection, answered with a plain `error` event followed
/// by a close.
#[derive(Debug)]
pub enum FatalReject {
	AuthRequired,
	Unauthorized(String),
	UnknownNamespace(String),
	ForbiddenNamespace(Role),
	NotFound(String),
	Internal(String),
}

impl FatalReject {
	pub fn status(&self) -> u32 {
		match self {
			FatalReject::AuthRequired | FatalReject::Unauthorized(_) => 401,
			FatalReject::UnknownNamespace(_) => 400,
			FatalReject::ForbiddenNamespace(_) => 403,
			FatalReject::NotFound(_) => 404,
			FatalReject::Internal(_) => 500,
		}
	}

	pub fn message(&self) -> String {
		match self {
			FatalReject::AuthRequired => "authentication required".to_string(),
			FatalReject::Unauthorized(detail) => format!("unauthorized: {detail}"),
			FatalReject::UnknownNamespace(ns) => format!("unknown namespace: {ns}"),
			FatalReject::ForbiddenNamespace(role) => format!("role {role} is not allowed in this namespace"),
			FatalReject::NotFound(detail) => detail.clone(),
			FatalReject::Internal(detail) => format!("internal error: {detail}"),
		}
	}
}

/// Non-fatal rejection of a send or history event, answered on the
/// namespace's error event. The connection stays `Active`.
#[derive(Debug)]
pub enum SendReject {
	Validation(String),
	InvalidConversation,
	NotFound(String),
	Forbidden(String),
	RateLimited,
	Persistence(String),
}

impl SendReject {
	pub fn status(&self) -> u32 {
		match self {
			SendReject::Validation(_) | SendReject::InvalidConversation => 400,
			SendReject::Forbidden(_) => 403,
			SendReject::NotFound(_) => 404,
			SendReject::RateLimited => 429,
			SendReject::Persistence(_) => 500,
		}
	}

	pub fn message(&self) -> String {
		match self {
			SendReject::Validation(detail) => detail.clone(),
			SendReject::InvalidConversation => "invalid conversation".to_string(),
			SendReject::NotFound(detail) => detail.clone(),
			SendReject::Forbidden(detail) => detail.clone(),
			SendReject::RateLimited => "rate limited".to_string(),
			SendReject::Persistence(detail) => format!("message not saved: {detail}"),
		}
	}
}

fn store_reject(err: StoreError) -> SendReject {
	match err {
		StoreError::ConversationNotFound(id) => SendReject::NotFound(format!("conversation not found: {id}")),
		StoreError::SenderNotFound(id) => SendReject::NotFound(format!("sender not found: {id}")),
		other => SendReject::Persistence(other.to_string()),
	}
}

/// Compute the deterministic room set for an identity entering a namespace.
///
/// Classroom is the only namespace whose rooms depend on roster lookups;
/// lookup misses there reject the connection.
pub async fn compute_rooms(
	spec: &NamespaceSpec,
	identity: &Identity,
	roster: &dyn RosterDirectory,
) -> Result<Vec<RoomKey>, FatalReject> {
	let tenant = identity.tenant.clone();

	match spec.namespace {
		Namespace::Announcement => Ok(vec![RoomKey::Announcement { tenant }]),
		Namespace::Dropbox => Ok(vec![RoomKey::Dropbox { tenant }]),
		Namespace::Community => Ok(vec![RoomKey::Community {
			tenant,
			role: identity.role,
		}]),
		Namespace::Classroom => match identity.role {
			Role::Student => {
				let batch = roster
					.student_batch(&identity.id)
					.await
					.map_err(|e| FatalReject::Internal(e.to_string()))?
					.ok_or_else(|| FatalReject::NotFound("student batch not found".to_string()))?;

				Ok(vec![RoomKey::Classroom { tenant, batch }])
			}
			Role::Teacher => {
				let batches = roster
					.assigned_batches(&identity.id)
					.await
					.map_err(|e| FatalReject::Internal(e.to_string()))?;

				if batches.is_empty() {
					return Err(FatalReject::NotFound("not assigned any batches".to_string()));
				}

				Ok(batches
					.into_iter()
					.map(|batch| RoomKey::Classroom {
						tenant: tenant.clone(),
						batch,
					})
					.collect())
			}
			other => Err(FatalReject::ForbiddenNamespace(other)),
		},
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Send rate limits; zero disables a limiter.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
	pub per_conn_burst: u32,
	pub per_conn_per_minute: u32,
	pub per_room_burst: u32,
	pub per_room_per_minute: u32,
}

#[derive(Debug)]
struct SendRateLimiter {
	per_connection: Option<TokenBucket>,
	per_room: HashMap<RoomKey, TokenBucket>,
	per_room_burst: u32,
	per_room_per_minute: u32,
	max_rooms: usize,
}

impl SendRateLimiter {
	fn new(settings: RateLimitSettings) -> Self {
		Self {
			per_connection: TokenBucket::new(settings.per_conn_burst, settings.per_conn_per_minute),
			per_room: HashMap::new(),
			per_room_burst: settings.per_room_burst,
			per_room_per_minute: settings.per_room_per_minute,
			max_rooms: 1024,
		}
	}

	fn allow_connection(&mut self) -> bool {
		match self.per_connection.as_mut() {
			Some(bucket) => bucket.allow(),
			None => true,
		}
	}

	fn allow_room(&mut self, room: &RoomKey) -> bool {
		let Some(bucket) = TokenBucket::new(self.per_room_burst, self.per_room_per_minute) else {
			return true;
		};

		if self.per_room.len() >= self.max_rooms {
			self.per_room.clear();
		}

		let entry = self.per_room.entry(room.clone()).or_insert(bucket);
		entry.allow()
	}
}

/// The shared namespace controller; each of the four surfaces is a
/// `NamespaceSpec` value driving this one implementation.
///
/// Owns the send pipeline: resolve -> anti-spoof -> batch gate -> append ->
/// fan-out. `publish` below is the only broadcast point; a room never sees a
/// message the store did not persist first.
pub struct NamespaceController {
	spec: NamespaceSpec,
	identity: Identity,
	rooms: Vec<RoomKey>,
	directory: Arc<dyn ConversationDirectory>,
	messages: Arc<dyn MessageStore>,
	hub: RoomHub,
	rate_limiter: SendRateLimiter,
	max_content_bytes: usize,
}

impl NamespaceController {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		spec: NamespaceSpec,
		identity: Identity,
		rooms: Vec<RoomKey>,
		directory: Arc<dyn ConversationDirectory>,
		messages: Arc<dyn MessageStore>,
		hub: RoomHub,
		rate_limits: RateLimitSettings,
		max_content_bytes: usize,
	) -> Self {
		Self {
			spec,
			identity,
			rooms,
			directory,
			messages,
			hub,
			rate_limiter: SendRateLimiter::new(rate_limits),
			max_content_bytes,
		}
	}

	/// Error event name answered to this connection on non-fatal failures.
	pub fn error_event(&self) -> &'static str {
		self.spec.namespace.error_event()
	}

	/// Validate, persist and fan out one inbound send event.
	pub async fn handle_send(&mut self, send: &pb::Send) -> Result<StoredMessage, SendReject> {
		let namespace = self.spec.namespace;

		if send.event != namespace.send_event() {
			return Err(SendReject::Validation(format!(
				"unexpected event {:?} for the {namespace} namespace",
				send.event
			)));
		}

		if send.conversation_id.trim().is_empty() {
			return Err(SendReject::Validation("missing conversation id".to_string()));
		}

		if send.content.trim().is_empty() {
			return Err(SendReject::Validation("empty content".to_string()));
		}
		if send.content.len() > self.max_content_bytes {
			return Err(SendReject::Validation(format!(
				"content exceeds {} bytes",
				self.max_content_bytes
			)));
		}

		if !self.rate_limiter.allow_connection() {
			return Err(SendReject::RateLimited);
		}

		let room = self.target_room(send).await?;

		if !self.rate_limiter.allow_room(&room) {
			return Err(SendReject::RateLimited);
		}

		// Resolve the expected conversation from the deterministic name for
		// this room, never from the client-supplied id.
		let expected_name = room.conversation_name();
		let expected = self
			.directory
			.resolve_conversation(&self.identity.tenant, &expected_name)
			.await
			.map_err(store_reject)?
			.ok_or_else(|| SendReject::NotFound(format!("no conversation named {expected_name:?}")))?;

		if send.conversation_id != expected.id.as_str() {
			return Err(SendReject::InvalidConversation);
		}

		let stored = self
			.messages
			.append(NewMessage {
				conversation_id: expected.id,
				sender_id: self.identity.id.clone(),
				content: send.content.clone(),
			})
			.await
			.map_err(store_reject)?;

		metrics::counter!("campus_server_messages_persisted_total").increment(1);

		let event = pb::EventEnvelope {
			event: namespace.broadcast_event().to_string(),
			room: room.wire_name(),
			server_time_unix_ms: unix_ms_now(),
			message: Some(chat_message_to_pb(&stored)),
		};

		debug!(
			room = %room,
			conversation = %stored.conversation_id,
			message_id = %stored.id,
			"fanning out persisted message"
		);

		self.hub.publish_event(room, event).await;
		metrics::counter!("campus_server_fanout_events_total").increment(1);

		Ok(stored)
	}

	/// Pick the room a send is addressed to.
	///
	/// Teachers in the classroom namespace address one of several batch
	/// rooms; the target is derived by reversing the classgroup naming
	/// convention and gated on the assignment set captured at join. Every
	/// other connection has exactly one room.
	async fn target_room(&self, send: &pb::Send) -> Result<RoomKey, SendReject> {
		let batch_addressed = self.spec.namespace == Namespace::Classroom && self.identity.role == Role::Teacher;
		if !batch_addressed {
			return self
				.rooms
				.first()
				.cloned()
				.ok_or_else(|| SendReject::NotFound("no joined room".to_string()));
		}

		let target_id = ConversationId::new(send.conversation_id.clone())
			.map_err(|_| SendReject::Validation("missing conversation id".to_string()))?;

		let conversation = self
			.directory
			.conversation_by_id(&target_id)
			.await
			.map_err(store_reject)?
			.ok_or_else(|| SendReject::NotFound("conversation not found".to_string()))?;

		if conversation.tenant != self.identity.tenant {
			// Cross-tenant ids are indistinguishable from unknown ones.
			return Err(SendReject::NotFound("conversation not found".to_string()));
		}

		let Some(batch) = batch_from_classgroup(&conversation.name) else {
			return Err(SendReject::Validation(format!(
				"conversation {:?} is not a classroom group",
				conversation.name
			)));
		};

		let room = RoomKey::Classroom {
			tenant: self.identity.tenant.clone(),
			batch: batch.clone(),
		};
		if !self.rooms.contains(&room) {
			return Err(SendReject::Forbidden(format!("not assigned to batch {batch}")));
		}

		Ok(room)
	}

	/// Serve one history page for a conversation within this connection's rooms.
	pub async fn handle_history(&self, req: &pb::History) -> Result<pb::HistoryPage, SendReject> {
		let id = ConversationId::new(req.conversation_id.clone())
			.map_err(|_| SendReject::Validation("missing conversation id".to_string()))?;

		let conversation = self
			.directory
			.conversation_by_id(&id)
			.await
			.map_err(store_reject)?
			.ok_or_else(|| SendReject::NotFound("conversation not found".to_string()))?;

		let in_scope = conversation.tenant == self.identity.tenant
			&& self.rooms.iter().any(|room| room.conversation_name() == conversation.name);
		if !in_scope {
			return Err(SendReject::Forbidden("conversation outside your rooms".to_string()));
		}

		let cursor = if req.cursor.trim().is_empty() {
			None
		} else {
			Some(
				req.cursor
					.parse::<MessageId>()
					.map_err(|_| SendReject::Validation("invalid cursor".to_string()))?,
			)
		};

		let page = self
			.messages
			.page(PageRequest {
				conversation_id: id.clone(),
				cursor,
				limit: req.limit,
			})
			.await
			.map_err(store_reject)?;

		let next_cursor = page.last().map(|m| m.id.to_string()).unwrap_or_default();

		Ok(pb::HistoryPage {
			conversation_id: id.into_string(),
			messages: page.iter().map(chat_message_to_pb).collect(),
			next_cursor,
		})
	}
}

pub(crate) fn chat_message_to_pb(message: &StoredMessage) -> pb::ChatMessage {
	pb::ChatMessage {
		id: message.id.to_string(),
		conversation_id: message.conversation_id.as_str().to_string(),
		sender_id: message.sender_id.as_str().to_string(),
		sender_name: message.sender_name.clone(),
		sender_email: message.sender_email.clone(),
		content: message.content.clone(),
		created_at_unix_ms: message.created_at_unix_ms,
	}
}
