#![forbid(unsafe_code)]

//! Wire messages (`campus.v1`).
//!
//! Hand-written `prost` derives, wire-compatible with the equivalent proto3
//! schema. Event names travel as strings so the per-namespace contract
//! (`send_*` / `new_*` / error events) is visible on the wire.

/// Top-level frame payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,

	/// Correlates responses to client requests; empty for server-initiated frames.
	#[prost(string, tag = "2")]
	pub request_id: String,

	#[prost(oneof = "envelope::Msg", tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19")]
	pub msg: Option<envelope::Msg>,
}

/// Nested message types in `Envelope`.
pub mod envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		Welcome(super::Welcome),
		#[prost(message, tag = "12")]
		Send(super::Send),
		#[prost(message, tag = "13")]
		Event(super::EventEnvelope),
		#[prost(message, tag = "14")]
		Error(super::Error),
		#[prost(message, tag = "15")]
		History(super::History),
		#[prost(message, tag = "16")]
		HistoryPage(super::HistoryPage),
		#[prost(message, tag = "17")]
		Ping(super::Ping),
		#[prost(message, tag = "18")]
		Pong(super::Pong),
		#[prost(message, tag = "19")]
		Lagged(super::Lagged),
	}
}

/// First client frame: selects the namespace and presents the credential.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	/// One of `announcement`, `dropbox`, `community`, `classroom`.
	#[prost(string, tag = "1")]
	pub namespace: String,

	#[prost(string, tag = "2")]
	pub auth_token: String,

	#[prost(string, tag = "3")]
	pub client_name: String,
}

/// Server reply once the connection is joined to its room(s).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: String,

	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,

	#[prost(uint32, tag = "3")]
	pub max_frame_bytes: u32,

	/// Wire names of the rooms this connection was joined to.
	#[prost(string, repeated, tag = "4")]
	pub rooms: Vec<String>,
}

/// Inbound send event (`send_announcement`, `send_dropbox`, ...).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Send {
	#[prost(string, tag = "1")]
	pub event: String,

	/// Target conversation; must match the server-resolved conversation.
	#[prost(string, tag = "2")]
	pub conversation_id: String,

	#[prost(string, tag = "3")]
	pub content: String,
}

/// Broadcast fanned out to every connection in a room (`new_*`).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventEnvelope {
	#[prost(string, tag = "1")]
	pub event: String,

	/// Room wire name the event was published to.
	#[prost(string, tag = "2")]
	pub room: String,

	#[prost(int64, tag = "3")]
	pub server_time_unix_ms: i64,

	#[prost(message, optional, tag = "4")]
	pub message: Option<ChatMessage>,
}

/// Error answered to the triggering connection only, never the room.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	/// Namespace error event name (`error_occurred` or `dropbox_error`).
	#[prost(string, tag = "1")]
	pub event: String,

	#[prost(uint32, tag = "2")]
	pub status: u32,

	#[prost(string, tag = "3")]
	pub message: String,
}

/// Cursor-paginated history read for a joined conversation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct History {
	#[prost(string, tag = "1")]
	pub conversation_id: String,

	/// Opaque message-id boundary; empty reads from the newest message.
	#[prost(string, tag = "2")]
	pub cursor: String,

	/// Page size; 0 selects the server default.
	#[prost(uint32, tag = "3")]
	pub limit: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HistoryPage {
	#[prost(string, tag = "1")]
	pub conversation_id: String,

	/// Newest-first.
	#[prost(message, repeated, tag = "2")]
	pub messages: Vec<ChatMessage>,

	/// Cursor for the next (older) page; empty when exhausted.
	#[prost(string, tag = "3")]
	pub next_cursor: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,

	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
}

/// Tells a subscriber its room queue overflowed and events were dropped.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Lagged {
	#[prost(string, tag = "1")]
	pub room: String,

	#[prost(uint64, tag = "2")]
	pub dropped: u64,
}

/// Persisted message with hydrated sender fields.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
	#[prost(string, tag = "1")]
	pub id: String,

	#[prost(string, tag = "2")]
	pub conversation_id: String,

	#[prost(string, tag = "3")]
	pub sender_id: String,

	#[prost(string, tag = "4")]
	pub sender_name: String,

	#[prost(string, tag = "5")]
	pub sender_email: String,

	#[prost(string, tag = "6")]
	pub content: String,

	#[prost(int64, tag = "7")]
	pub created_at_unix_ms: i64,
}
