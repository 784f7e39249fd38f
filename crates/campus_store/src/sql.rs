#![forbid(unsafe_code)]

//! `sqlx`-backed store over the backend's relational schema.
//!
//! Tables consumed (owned by the admission/assignment workflows):
//! `conversations(id, name, college_id)`, `users(id, name, email)`,
//! `students(user_id, batch_id)`, `batches(id, name)`,
//! `batch_teachers(batch_id, teacher_id)`. This crate writes only
//! `messages(id, conversation_id, sender_id, content, created_at)`.

use async_trait::async_trait;
use campus_domain::{BatchName, Conversation, ConversationId, MessageId, TenantId, UserId};
use sqlx::Row as _;

use crate::{
	ConversationDirectory, MessageStore, NewMessage, PageRequest, RosterDirectory, StoreError, StoredMessage, unix_ms_now,
};

/// SQL store; one pool per process.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await?;
			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await?;
			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(StoreError::UnsupportedUrl)
		}
	}

	#[cfg(test)]
	fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
		Self {
			backend: SqlBackend::Sqlite(pool),
		}
	}
}

fn conversation_from_parts(id: String, name: String, college_id: String) -> Result<Conversation, StoreError> {
	Ok(Conversation {
		id: ConversationId::new(id).map_err(|e| StoreError::Corrupt(format!("conversation id: {e}")))?,
		name,
		tenant: TenantId::new(college_id).map_err(|e| StoreError::Corrupt(format!("college id: {e}")))?,
	})
}

fn message_from_parts(
	id: String,
	conversation_id: String,
	sender_id: String,
	sender_name: String,
	sender_email: String,
	content: String,
	created_at_unix_ms: i64,
) -> Result<StoredMessage, StoreError> {
	Ok(StoredMessage {
		id: id
			.parse::<MessageId>()
			.map_err(|e| StoreError::Corrupt(format!("message id: {e}")))?,
		conversation_id: ConversationId::new(conversation_id)
			.map_err(|e| StoreError::Corrupt(format!("conversation id: {e}")))?,
		sender_id: UserId::new(sender_id).map_err(|e| StoreError::Corrupt(format!("sender id: {e}")))?,
		sender_name,
		sender_email,
		content,
		created_at_unix_ms,
	})
}

const PAGE_COLUMNS: &str = "m.id, m.conversation_id, m.sender_id, u.name AS sender_name, u.email AS sender_email, \
	m.content, m.created_at";

#[async_trait]
impl ConversationDirectory for SqlStore {
	async fn resolve_conversation(&self, tenant: &TenantId, name: &str) -> Result<Option<Conversation>, StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let row = sqlx::query("SELECT id, name, college_id FROM conversations WHERE college_id = ? AND name = ?")
					.bind(tenant.as_str())
					.bind(name)
					.fetch_optional(pool)
					.await?;

				row.map(|r| conversation_from_parts(r.try_get("id")?, r.try_get("name")?, r.try_get("college_id")?))
					.transpose()
			}
			SqlBackend::Postgres(pool) => {
				let row = sqlx::query("SELECT id, name, college_id FROM conversations WHERE college_id = $1 AND name = $2")
					.bind(tenant.as_str())
					.bind(name)
					.fetch_optional(pool)
					.await?;

				row.map(|r| conversation_from_parts(r.try_get("id")?, r.try_get("name")?, r.try_get("college_id")?))
					.transpose()
			}
		}
	}

	async fn conversation_by_id(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let row = sqlx::query("SELECT id, name, college_id FROM conversations WHERE id = ?")
					.bind(id.as_str())
					.fetch_optional(pool)
					.await?;

				row.map(|r| conversation_from_parts(r.try_get("id")?, r.try_get("name")?, r.try_get("college_id")?))
					.transpose()
			}
			SqlBackend::Postgres(pool) => {
				let row = sqlx::query("SELECT id, name, college_id FROM conversations WHERE id = $1")
					.bind(id.as_str())
					.fetch_optional(pool)
					.await?;

				row.map(|r| conversation_from_parts(r.try_get("id")?, r.try_get("name")?, r.try_get("college_id")?))
					.transpose()
			}
		}
	}
}

#[async_trait]
impl RosterDirectory for SqlStore {
	async fn student_batch(&self, user: &UserId) -> Result<Option<BatchName>, StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let row = sqlx::query(
					"SELECT b.name FROM students s JOIN batches b ON b.id = s.batch_id WHERE s.user_id = ?",
				)
				.bind(user.as_str())
				.fetch_optional(pool)
				.await?;

				row.map(|r| {
					BatchName::new(r.try_get::<String, _>("name")?)
						.map_err(|e| StoreError::Corrupt(format!("batch name: {e}")))
				})
				.transpose()
			}
			SqlBackend::Postgres(pool) => {
				let row = sqlx::query(
					"SELECT b.name FROM students s JOIN batches b ON b.id = s.batch_id WHERE s.user_id = $1",
				)
				.bind(user.as_str())
				.fetch_optional(pool)
				.await?;

				row.map(|r| {
					BatchName::new(r.try_get::<String, _>("name")?)
						.map_err(|e| StoreError::Corrupt(format!("batch name: {e}")))
				})
				.transpose()
			}
		}
	}

	async fn assigned_batches(&self, teacher: &UserId) -> Result<Vec<BatchName>, StoreError> {
		let rows = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"SELECT DISTINCT b.name FROM batch_teachers bt \
					JOIN batches b ON b.id = bt.batch_id WHERE bt.teacher_id = ? ORDER BY b.name",
				)
				.bind(teacher.as_str())
				.fetch_all(pool)
				.await?
				.into_iter()
				.map(|r| r.try_get::<String, _>("name"))
				.collect::<Result<Vec<_>, _>>()?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"SELECT DISTINCT b.name FROM batch_teachers bt \
					JOIN batches b ON b.id = bt.batch_id WHERE bt.teacher_id = $1 ORDER BY b.name",
				)
				.bind(teacher.as_str())
				.fetch_all(pool)
				.await?
				.into_iter()
				.map(|r| r.try_get::<String, _>("name"))
				.collect::<Result<Vec<_>, _>>()?
			}
		};

		rows.into_iter()
			.map(|name| BatchName::new(name).map_err(|e| StoreError::Corrupt(format!("batch name: {e}"))))
			.collect()
	}
}

#[async_trait]
impl MessageStore for SqlStore {
	async fn append(&self, new: NewMessage) -> Result<StoredMessage, StoreError> {
		let id = MessageId::new_v4();
		let created_at_unix_ms = unix_ms_now();

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let sender = sqlx::query("SELECT name, email FROM users WHERE id = ?")
					.bind(new.sender_id.as_str())
					.fetch_optional(pool)
					.await?
					.ok_or_else(|| StoreError::SenderNotFound(new.sender_id.clone()))?;

				sqlx::query(
					"INSERT INTO messages (id, conversation_id, sender_id, content, created_at) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(id.to_string())
				.bind(new.conversation_id.as_str())
				.bind(new.sender_id.as_str())
				.bind(&new.content)
				.bind(created_at_unix_ms)
				.execute(pool)
				.await?;

				Ok(StoredMessage {
					id,
					conversation_id: new.conversation_id,
					sender_id: new.sender_id,
					sender_name: sender.try_get("name")?,
					sender_email: sender.try_get("email")?,
					content: new.content,
					created_at_unix_ms,
				})
			}
			SqlBackend::Postgres(pool) => {
				let sender = sqlx::query("SELECT name, email FROM users WHERE id = $1")
					.bind(new.sender_id.as_str())
					.fetch_optional(pool)
					.await?
					.ok_or_else(|| StoreError::SenderNotFound(new.sender_id.clone()))?;

				sqlx::query(
					"INSERT INTO messages (id, conversation_id, sender_id, content, created_at) \
					VALUES ($1, $2, $3, $4, $5)",
				)
				.bind(id.to_string())
				.bind(new.conversation_id.as_str())
				.bind(new.sender_id.as_str())
				.bind(&new.content)
				.bind(created_at_unix_ms)
				.execute(pool)
				.await?;

				Ok(StoredMessage {
					id,
					conversation_id: new.conversation_id,
					sender_id: new.sender_id,
					sender_name: sender.try_get("name")?,
					sender_email: sender.try_get("email")?,
					content: new.content,
					created_at_unix_ms,
				})
			}
		}
	}

	async fn page(&self, req: PageRequest) -> Result<Vec<StoredMessage>, StoreError> {
		let limit = req.effective_limit() as i64;

		// Anchor the cursor to its (created_at, id) position first; a stale
		// cursor yields an empty page.
		let anchor = match (&self.backend, &req.cursor) {
			(_, None) => None,
			(SqlBackend::Sqlite(pool), Some(cursor)) => {
				let row = sqlx::query("SELECT created_at FROM messages WHERE id = ?")
					.bind(cursor.to_string())
					.fetch_optional(pool)
					.await?;
				match row {
					Some(r) => Some((r.try_get::<i64, _>("created_at")?, cursor.to_string())),
					None => return Ok(Vec::new()),
				}
			}
			(SqlBackend::Postgres(pool), Some(cursor)) => {
				let row = sqlx::query("SELECT created_at FROM messages WHERE id = $1")
					.bind(cursor.to_string())
					.fetch_optional(pool)
					.await?;
				match row {
					Some(r) => Some((r.try_get::<i64, _>("created_at")?, cursor.to_string())),
					None => return Ok(Vec::new()),
				}
			}
		};

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let rows = match &anchor {
					None => {
						sqlx::query(&format!(
							"SELECT {PAGE_COLUMNS} FROM messages m JOIN users u ON u.id = m.sender_id \
							WHERE m.conversation_id = ? ORDER BY m.created_at DESC, m.id DESC LIMIT ?"
						))
						.bind(req.conversation_id.as_str())
						.bind(limit)
						.fetch_all(pool)
						.await?
					}
					Some((created_at, id)) => {
						sqlx::query(&format!(
							"SELECT {PAGE_COLUMNS} FROM messages m JOIN users u ON u.id = m.sender_id \
							WHERE m.conversation_id = ? AND (m.created_at < ? OR (m.created_at = ? AND m.id < ?)) \
							ORDER BY m.created_at DESC, m.id DESC LIMIT ?"
						))
						.bind(req.conversation_id.as_str())
						.bind(created_at)
						.bind(created_at)
						.bind(id)
						.bind(limit)
						.fetch_all(pool)
						.await?
					}
				};

				rows.into_iter()
					.map(|r| {
						message_from_parts(
							r.try_get("id")?,
							r.try_get("conversation_id")?,
							r.try_get("sender_id")?,
							r.try_get("sender_name")?,
							r.try_get("sender_email")?,
							r.try_get("content")?,
							r.try_get("created_at")?,
						)
					})
					.collect()
			}
			SqlBackend::Postgres(pool) => {
				let rows = match &anchor {
					None => {
						sqlx::query(&format!(
							"SELECT {PAGE_COLUMNS} FROM messages m JOIN users u ON u.id = m.sender_id \
							WHERE m.conversation_id = $1 ORDER BY m.created_at DESC, m.id DESC LIMIT $2"
						))
						.bind(req.conversation_id.as_str())
						.bind(limit)
						.fetch_all(pool)
						.await?
					}
					Some((created_at, id)) => {
						sqlx::query(&format!(
							"SELECT {PAGE_COLUMNS} FROM messages m JOIN users u ON u.id = m.sender_id \
							WHERE m.conversation_id = $1 AND (m.created_at < $2 OR (m.created_at = $2 AND m.id < $3)) \
							ORDER BY m.created_at DESC, m.id DESC LIMIT $4"
						))
						.bind(req.conversation_id.as_str())
						.bind(created_at)
						.bind(id)
						.bind(limit)
						.fetch_all(pool)
						.await?
					}
				};

				rows.into_iter()
					.map(|r| {
						message_from_parts(
							r.try_get("id")?,
							r.try_get("conversation_id")?,
							r.try_get("sender_id")?,
							r.try_get("sender_name")?,
							r.try_get("sender_email")?,
							r.try_get("content")?,
							r.try_get("created_at")?,
						)
					})
					.collect()
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn sqlite_store() -> SqlStore {
		let pool = sqlx::sqlite::SqlitePoolOptions::new()
			.max_connections(1)
			.connect("sqlite::memory:")
			.await
			.expect("open sqlite memory db");

		for ddl in [
			"CREATE TABLE conversations (id TEXT PRIMARY KEY, name TEXT NOT NULL, college_id TEXT NOT NULL)",
			"CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT NOT NULL, email TEXT NOT NULL)",
			"CREATE TABLE students (user_id TEXT PRIMARY KEY, batch_id TEXT NOT NULL)",
			"CREATE TABLE batches (id TEXT PRIMARY KEY, name TEXT NOT NULL)",
			"CREATE TABLE batch_teachers (batch_id TEXT NOT NULL, teacher_id TEXT NOT NULL)",
			"CREATE TABLE messages (id TEXT PRIMARY KEY, conversation_id TEXT NOT NULL, sender_id TEXT NOT NULL, \
			content TEXT NOT NULL, created_at INTEGER NOT NULL)",
		] {
			sqlx::query(ddl).execute(&pool).await.expect("create table");
		}

		sqlx::query("INSERT INTO conversations VALUES ('con-1', 'announcement', 'c1')")
			.execute(&pool)
			.await
			.unwrap();
		sqlx::query("INSERT INTO users VALUES ('u1', 'Alice Admin', 'alice@example.edu')")
			.execute(&pool)
			.await
			.unwrap();
		sqlx::query("INSERT INTO batches VALUES ('b1', 'CSE-2025')").execute(&pool).await.unwrap();
		sqlx::query("INSERT INTO students VALUES ('u2', 'b1')").execute(&pool).await.unwrap();
		sqlx::query("INSERT INTO batch_teachers VALUES ('b1', 'u3')")
			.execute(&pool)
			.await
			.unwrap();

		SqlStore::from_sqlite(pool)
	}

	#[tokio::test]
	async fn resolves_and_fetches_conversations() {
		let store = sqlite_store().await;
		let tenant = TenantId::new("c1").unwrap();

		let conversation = store.resolve_conversation(&tenant, "announcement").await.unwrap().unwrap();
		assert_eq!(conversation.id.as_str(), "con-1");
		assert_eq!(conversation.tenant, tenant);

		let by_id = store
			.conversation_by_id(&ConversationId::new("con-1").unwrap())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(by_id.name, "announcement");

		assert!(store.resolve_conversation(&tenant, "dropbox").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn roster_lookups() {
		let store = sqlite_store().await;

		let batch = store.student_batch(&UserId::new("u2").unwrap()).await.unwrap().unwrap();
		assert_eq!(batch.as_str(), "CSE-2025");
		assert!(store.student_batch(&UserId::new("u1").unwrap()).await.unwrap().is_none());

		let batches = store.assigned_batches(&UserId::new("u3").unwrap()).await.unwrap();
		assert_eq!(batches, vec![BatchName::new("CSE-2025").unwrap()]);
		assert!(store.assigned_batches(&UserId::new("u1").unwrap()).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn append_then_page_newest_first() {
		let store = sqlite_store().await;
		let con = ConversationId::new("con-1").unwrap();

		for i in 0..3 {
			store
				.append(NewMessage {
					conversation_id: con.clone(),
					sender_id: UserId::new("u1").unwrap(),
					content: format!("m{i}"),
				})
				.await
				.unwrap();
		}

		let page = store
			.page(PageRequest {
				conversation_id: con.clone(),
				cursor: None,
				limit: 2,
			})
			.await
			.unwrap();
		assert_eq!(page.len(), 2);
		assert_eq!(page[0].sender_name, "Alice Admin");

		let rest = store
			.page(PageRequest {
				conversation_id: con,
				cursor: Some(page[1].id),
				limit: 10,
			})
			.await
			.unwrap();
		assert_eq!(rest.len(), 1);

		let mut contents: Vec<String> = page.into_iter().chain(rest).map(|m| m.content).collect();
		contents.sort();
		assert_eq!(contents, vec!["m0", "m1", "m2"]);
	}

	#[tokio::test]
	async fn append_requires_known_sender() {
		let store = sqlite_store().await;

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
}
