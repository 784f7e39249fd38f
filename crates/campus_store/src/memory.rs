#![forbid(unsafe_code)]

//! In-memory backend for dev mode and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use campus_domain::{BatchName, Conversation, ConversationId, MessageId, TenantId, UserId};
use tokio::sync::Mutex;

use crate::{
	ConversationDirectory, MessageStore, NewMessage, PageRequest, RosterDirectory, StoreError, StoredMessage, unix_ms_now,
};

/// Directory entry for a known user.
#[derive(Debug, Clone)]
pub struct UserRecord {
	pub name: String,
	pub email: String,
}

#[derive(Debug, Default)]
struct Inner {
	conversations: Vec<Conversation>,
	users: HashMap<UserId, UserRecord>,
	student_batches: HashMap<UserId, BatchName>,
	teacher_batches: HashMap<UserId, Vec<BatchName>>,
	messages: HashMap<ConversationId, Vec<StoredMessage>>,

	/// Last issued timestamp; appends are strictly monotonic per store.
	last_created_ms: i64,
}

/// In-memory store implementing every collaborator interface.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
	fail_appends: AtomicBool,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn insert_conversation(&self, conversation: Conversation) {
		let mut inner = self.inner.lock().await;
		inner.conversations.push(conversation);
	}

	pub async fn insert_user(&self, id: UserId, name: impl Into<String>, email: impl Into<String>) {
		let mut inner = self.inner.lock().await;
		inner.users.insert(
			id,
			UserRecord {
				name: name.into(),
				email: email.into(),
			},
		);
	}

	pub async fn set_student_batch(&self, user: UserId, batch: BatchName) {
		let mut inner = self.inner.lock().await;
		inner.student_batches.insert(user, batch);
	}

	pub async fn assign_teacher_batch(&self, teacher: UserId, batch: BatchName) {
		let mut inner = self.inner.lock().await;
		let batches = inner.teacher_batches.entry(teacher).or_default();
		if !batches.contains(&batch) {
			batches.push(batch);
		}
	}

	/// Make subsequent appends fail, simulating an unavailable store.
	pub fn fail_appends(&self, enabled: bool) {
		self.fail_appends.store(enabled, Ordering::Relaxed);
	}
}

#[async_trait]
impl ConversationDirectory for MemoryStore {
	async fn resolve_conversation(&self, tenant: &TenantId, name: &str) -> Result<Option<Conversation>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner
			.conversations
			.iter()
			.find(|c| c.tenant == *tenant && c.name == name)
			.cloned())
	}

	async fn conversation_by_id(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.conversations.iter().find(|c| c.id == *id).cloned())
	}
}

#[async_trait]
impl RosterDirectory for MemoryStore {
	async fn student_batch(&self, user: &UserId) -> Result<Option<BatchName>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.student_batches.get(user).cloned())
	}

	async fn assigned_batches(&self, teacher: &UserId) -> Result<Vec<BatchName>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.teacher_batches.get(teacher).cloned().unwrap_or_default())
	}
}

#[async_trait]
impl MessageStore for MemoryStore {
	async fn append(&self, new: NewMessage) -> Result<StoredMessage, StoreError> {
		if self.fail_appends.load(Ordering::Relaxed) {
			return Err(StoreError::Unavailable("append disabled".to_string()));
		}

		let mut inner = self.inner.lock().await;

		if !inner.conversations.iter().any(|c| c.id == new.conversation_id) {
			return Err(StoreError::ConversationNotFound(new.conversation_id));
		}

		let sender = inner
			.users
			.get(&new.sender_id)
			.cloned()
			.ok_or_else(|| StoreError::SenderNotFound(new.sender_id.clone()))?;

		let created_at_unix_ms = unix_ms_now().max(inner.last_created_ms + 1);
		inner.last_created_ms = created_at_unix_ms;

		let message = StoredMessage {
			id: MessageId::new_v4(),
			conversation_id: new.conversation_id.clone(),
			sender_id: new.sender_id,
			sender_name: sender.name,
			sender_email: sender.email,
			content: new.content,
			created_at_unix_ms,
		};

		inner.messages.entry(new.conversation_id).or_default().push(message.clone());

		Ok(message)
	}

	async fn page(&self, req: PageRequest) -> Result<Vec<StoredMessage>, StoreError> {
		let inner = self.inner.lock().await;
		let Some(log) = inner.messages.get(&req.conversation_id) else {
			return Ok(Vec::new());
		};

		// Appends keep the log ascending by (created_at, id).
		let newest_first = log.iter().rev();

		let mut out = Vec::new();
		let mut past_cursor = req.cursor.is_none();
		for message in newest_first {
			if !past_cursor {
				if Some(message.id) == req.cursor {
					past_cursor = true;
				}
				continue;
			}

			out.push(message.clone());
			if out.len() as u32 >= req.effective_limit() {
				break;
			}
		}

		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn conversation(id: &str, name: &str, tenant: &str) -> Conversation {
		Conversation {
			id: ConversationId::new(id).expect("valid id"),
			name: name.to_string(),
			tenant: TenantId::new(tenant).expect("valid tenant"),
		}
	}

	async fn seeded() -> MemoryStore {
		let store = MemoryStore::new();
		store.insert_conversation(conversation("con-1", "announcement", "c1")).await;
		store.insert_conversation(conversation("con-2", "announcement", "c2")).await;
		store
			.insert_user(UserId::new("u1").unwrap(), "Alice Admin", "alice@example.edu")
			.await;
		store
	}

	#[tokio::test]
	async fn resolves_per_tenant() {
		let store = seeded().await;

		let tenant = TenantId::new("c1").unwrap();
		let found = store.resolve_conversation(&tenant, "announcement").await.unwrap().unwrap();
		assert_eq!(found.id.as_str(), "con-1");

		let other = TenantId::new("c2").unwrap();
		let found = store.resolve_conversation(&other, "announcement").await.unwrap().unwrap();
		assert_eq!(found.id.as_str(), "con-2");

		assert!(store.resolve_conversation(&tenant, "dropbox").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn append_hydrates_sender() {
		let store = seeded().await;

		let message = store
			.append(NewMessage {
				conversation_id: ConversationId::new("con-1").unwrap(),
				sender_id: UserId::new("u1").unwrap(),
				content: "hello".to_string(),
			})
			.await
			.unwrap();

		assert_eq!(message.sender_name, "Alice Admin");
		assert_eq!(message.sender_email, "alice@example.edu");
		assert_eq!(message.content, "hello");
	}

	#[tokio::test]
	async fn append_rejects_unknown_conversation_and_sender() {
		let store = seeded().await;

		let err = store
			.append(NewMessage {
				conversation_id: ConversationId::new("missing").unwrap(),
				sender_id: UserId::new("u1").unwrap(),
				content: "x".to_string(),
			})
			.await
			.unwrap_err();
		assert!(matches!(err, StoreError::ConversationNotFound(_)));

		let err = store
			.append(NewMessage {
				conversation_id: ConversationId::new("con-1").unwrap(),
				sender_id: UserId::new("ghost").unwrap(),
				content: "x".to_string(),
			})
			.await
			.unwrap_err();
		assert!(matches!(err, StoreError::SenderNotFound(_)));
	}

	#[tokio::test]
	async fn pagination_walks_backward_from_cursor() {
		let store = seeded().await;
		let con = ConversationId::new("con-1").unwrap();

		let mut ids = Vec::new();
		for i in 0..5 {
			let m = store
				.append(NewMessage {
					conversation_id: con.clone(),
					sender_id: UserId::new("u1").unwrap(),
					content: format!("m{i}"),
				})
				.await
				.unwrap();
			ids.push(m.id);
		}

		let first = store
			.page(PageRequest {
				conversation_id: con.clone(),
				cursor: None,
				limit: 2,
			})
			.await
			.unwrap();
		assert_eq!(first.len(), 2);
		assert_eq!(first[0].content, "m4");
		assert_eq!(first[1].content, "m3");

		let second = store
			.page(PageRequest {
				conversation_id: con.clone(),
				cursor: Some(first[1].id),
				limit: 2,
			})
			.await
			.unwrap();
		assert_eq!(second[0].content, "m2");
		assert_eq!(second[1].content, "m1");

		let stale = store
			.page(PageRequest {
				conversation_id: con,
				cursor: Some(MessageId::new_v4()),
				limit: 2,
			})
			.await
			.unwrap();
		assert!(stale.is_empty());
	}

	#[tokio::test]
	async fn failing_store_reports_unavailable() {
		let store = seeded().await;
		store.fail_appends(true);

		let err = store
			.append(NewMessage {
				conversation_id: ConversationId::new("con-1").unwrap(),
				sender_id: UserId::new("u1").unwrap(),
				content: "x".to_string(),
			})
			.await
			.unwrap_err();
		assert!(matches!(err, StoreError::Unavailable(_)));
	}
}
