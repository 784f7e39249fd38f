#![forbid(unsafe_code)]

//! Collaborator interfaces consumed by the realtime core: the conversation
//! directory, the roster (student/teacher batch lookups), and the message
//! store. Conversations and participants are created by admission and
//! assignment workflows elsewhere; this crate only reads them, and only the
//! message store writes.

pub mod memory;
pub mod sql;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use campus_domain::{BatchName, Conversation, ConversationId, MessageId, TenantId, UserId};
use thiserror::Error;

pub(crate) fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as i64
}

/// Page size used when the client asks for 0.
pub const DEFAULT_PAGE_LIMIT: u32 = 15;

/// Hard cap on a single history page.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Persisted message with hydrated sender fields, ready for fan-out without
/// a second read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: MessageId,
	pub conversation_id: ConversationId,
	pub sender_id: UserId,
	pub sender_name: String,
	pub sender_email: String,
	pub content: String,
	pub created_at_unix_ms: i64,
}

/// Append request.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub conversation_id: ConversationId,
	pub sender_id: UserId,
	pub content: String,
}

/// Cursor-paginated read, newest-first.
#[derive(Debug, Clone)]
pub struct PageRequest {
	pub conversation_id: ConversationId,

	/// Read messages strictly older than this message; `None` starts at the
	/// newest.
	pub cursor: Option<MessageId>,

	/// Requested page size; 0 selects [`DEFAULT_PAGE_LIMIT`].
	pub limit: u32,
}

impl PageRequest {
	/// Effective page size after defaulting and capping.
	pub fn effective_limit(&self) -> u32 {
		if self.limit == 0 {
			DEFAULT_PAGE_LIMIT
		} else {
			self.limit.min(MAX_PAGE_LIMIT)
		}
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("sender not found: {0}")]
	SenderNotFound(UserId),

	#[error("conversation not found: {0}")]
	ConversationNotFound(ConversationId),

	#[error("corrupt row: {0}")]
	Corrupt(String),

	#[error("store unavailable: {0}")]
	Unavailable(String),

	#[error("unsupported database url")]
	UnsupportedUrl,
}

/// Tenant-scoped conversation lookups.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
	/// Resolve a conversation by its logical name within a tenant.
	async fn resolve_conversation(&self, tenant: &TenantId, name: &str) -> Result<Option<Conversation>, StoreError>;

	async fn conversation_by_id(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError>;
}

/// Student/teacher batch lookups.
#[async_trait]
pub trait RosterDirectory: Send + Sync {
	/// Batch a student belongs to, if enrolled.
	async fn student_batch(&self, user: &UserId) -> Result<Option<BatchName>, StoreError>;

	/// Batches a teacher is currently assigned to teach (possibly empty).
	async fn assigned_batches(&self, teacher: &UserId) -> Result<Vec<BatchName>, StoreError>;
}

/// Durable message log per conversation.
#[async_trait]
pub trait MessageStore: Send + Sync {
	/// Append a message and return the persisted row, sender hydrated.
	async fn append(&self, new: NewMessage) -> Result<StoredMessage, StoreError>;

	/// Read one page, newest-first. A stale or unknown cursor yields an
	/// empty page rather than an error.
	async fn page(&self, req: PageRequest) -> Result<Vec<StoredMessage>, StoreError>;
}
