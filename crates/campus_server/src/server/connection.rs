#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use campus_domain::{Identity, Namespace, RoomKey, SecretString};
use campus_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use campus_protocol::pb;
use campus_store::{ConversationDirectory, MessageStore, RosterDirectory};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::server::auth::verify_hmac_token;
use crate::server::authz::{self, NamespaceSpec};
use crate::server::controller::{FatalReject, NamespaceController, RateLimitSettings, SessionPhase, compute_rooms};
use crate::server::room_hub::{RoomHub, RoomHubItem};
use crate::server::state::GlobalState;
use crate::util::time::unix_ms_now;

/// v1 protocol version written into `pb::Envelope.version`.
pub const PROTOCOL_VERSION: u32 = 1;

/// How long a connection may sit without a valid `Hello`.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: u32,

	pub fan_in_channel_capacity: usize,

	/// Secret the bearer tokens are signed with.
	pub auth_hmac_secret: SecretString,

	pub max_content_bytes: usize,

	pub send_rate_limit_per_conn_burst: u32,
	pub send_rate_limit_per_conn_per_minute: u32,
	pub send_rate_limit_per_room_burst: u32,
	pub send_rate_limit_per_room_per_minute: u32,
}

impl ConnectionSettings {
	pub fn new(auth_hmac_secret: SecretString) -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			fan_in_channel_capacity: 1024,
			auth_hmac_secret,
			max_content_bytes: 4096,
			send_rate_limit_per_conn_burst: 20,
			send_rate_limit_per_conn_per_minute: 120,
			send_rate_limit_per_room_burst: 10,
			send_rate_limit_per_room_per_minute: 60,
		}
	}

	fn rate_limits(&self) -> RateLimitSettings {
		RateLimitSettings {
			per_conn_burst: self.send_rate_limit_per_conn_burst,
			per_conn_per_minute: self.send_rate_limit_per_conn_per_minute,
			per_room_burst: self.send_rate_limit_per_room_burst,
			per_room_per_minute: self.send_rate_limit_per_room_per_minute,
		}
	}
}

/// Shared services a connection handler needs.
#[derive(Clone)]
pub struct ConnectionDeps {
	pub state: Arc<RwLock<GlobalState>>,
	pub hub: RoomHub,
	pub directory: Arc<dyn ConversationDirectory>,
	pub roster: Arc<dyn RosterDirectory>,
	pub messages: Arc<dyn MessageStore>,
}

pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	deps: ConnectionDeps,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("campus_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("campus_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let max_frame = settings.max_frame_bytes as usize;
	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("campus_server_control_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match campus_protocol::decode_frame::<pb::Envelope>(&buf, max_frame) {
					Ok((msg, used)) => {
						buf.drain(0..used);
						metrics::counter!("campus_server_envelopes_in_total").increment(1);

						if ctrl_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Err(campus_protocol::FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("campus_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let mut phase = SessionPhase::Connecting;

	let hello = match tokio::time::timeout(HELLO_TIMEOUT, wait_for_hello(&mut ctrl_rx)).await {
		Ok(hello) => hello?,
		Err(_) => {
			warn!(conn_id, "timed out waiting for Hello");
			connection.close(quinn::VarInt::from_u32(408), b"hello timeout");
			return Ok(());
		}
	};
	debug!(
		conn_id,
		phase = phase.as_str(),
		namespace = %hello.namespace,
		client_name = %hello.client_name,
		"received Hello"
	);
	metrics::counter!("campus_server_hello_total").increment(1);

	// Authentication precedes all namespace logic; authorization precedes
	// any room join. Failures here are fatal to the connection.
	let token = hello.auth_token.trim();
	if token.is_empty() {
		reject_and_close(conn_id, &mut control_send, &connection, FatalReject::AuthRequired).await;
		return Ok(());
	}

	let identity: Identity = match verify_hmac_token(token, settings.auth_hmac_secret.expose())
		.and_then(|claims| claims.identity())
	{
		Ok(identity) => identity,
		Err(e) => {
			metrics::counter!("campus_server_auth_failures_total").increment(1);
			reject_and_close(
				conn_id,
				&mut control_send,
				&connection,
				FatalReject::Unauthorized(e.to_string()),
			)
			.await;
			return Ok(());
		}
	};

	phase = SessionPhase::Authenticated;
	debug!(
		conn_id,
		phase = phase.as_str(),
		user = %identity.id,
		role = %identity.role,
		tenant = %identity.tenant,
		"authenticated"
	);

	let namespace: Namespace = match hello.namespace.parse() {
		Ok(ns) => ns,
		Err(_) => {
			reject_and_close(
				conn_id,
				&mut control_send,
				&connection,
				FatalReject::UnknownNamespace(hello.namespace.clone()),
			)
			.await;
			return Ok(());
		}
	};

	let spec = NamespaceSpec::of(namespace);
	if !authz::authorize(&spec, &identity) {
		metrics::counter!("campus_server_authz_failures_total").increment(1);
		reject_and_close(
			conn_id,
			&mut control_send,
			&connection,
			FatalReject::ForbiddenNamespace(identity.role),
		)
		.await;
		return Ok(());
	}

	phase = SessionPhase::Authorized;
	debug!(conn_id, phase = phase.as_str(), namespace = %namespace, "authorized");

	let rooms = match compute_rooms(&spec, &identity, deps.roster.as_ref()).await {
		Ok(rooms) => rooms,
		Err(reject) => {
			reject_and_close(conn_id, &mut control_send, &connection, reject).await;
			return Ok(());
		}
	};

	{
		let mut st = deps.state.write().await;
		st.join_rooms(conn_id, &rooms);
	}

	let (fan_in_tx, mut fan_in_rx) = mpsc::channel::<(RoomKey, RoomHubItem)>(settings.fan_in_channel_capacity);
	let mut room_tasks = Vec::with_capacity(rooms.len());
	for room in &rooms {
		let mut rx = deps.hub.subscribe_room(room.clone()).await;
		let tx = fan_in_tx.clone();
		let room = room.clone();
		room_tasks.push(tokio::spawn(async move {
			while let Some(item) = rx.recv().await {
				if tx.send((room.clone(), item)).await.is_err() {
					break;
				}
			}
		}));
	}

	phase = SessionPhase::RoomJoined;
	info!(
		conn_id,
		phase = phase.as_str(),
		namespace = %namespace,
		rooms = ?rooms.iter().map(|r| r.wire_name()).collect::<Vec<_>>(),
		"joined rooms"
	);
	metrics::gauge!("campus_server_rooms_active").set(deps.hub.room_subscriber_counts().await.len() as f64);

	let welcome = pb::Welcome {
		server_name: format!("campus-server/{}", env!("CARGO_PKG_VERSION")),
		server_time_unix_ms: unix_ms_now(),
		max_frame_bytes: settings.max_frame_bytes,
		rooms: rooms.iter().map(|r| r.wire_name()).collect(),
	};

	send_envelope(
		&mut control_send,
		pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::Welcome(welcome)),
		},
	)
	.await
	.context("send Welcome")?;

	let mut controller = NamespaceController::new(
		spec,
		identity.clone(),
		rooms.clone(),
		Arc::clone(&deps.directory),
		Arc::clone(&deps.messages),
		deps.hub.clone(),
		settings.rate_limits(),
		settings.max_content_bytes,
	);

	phase = SessionPhase::Active;
	debug!(conn_id, phase = phase.as_str(), "send handler registered");

	let loop_result = async {
		loop {
			tokio::select! {
				env = ctrl_rx.recv() => {
					let Some(env) = env else { break };
					let Some(msg) = env.msg else { continue };

					match msg {
						pb::envelope::Msg::Ping(ping) => {
							let pong = pb::Pong {
								client_time_unix_ms: ping.client_time_unix_ms,
								server_time_unix_ms: unix_ms_now(),
							};

							send_envelope(
								&mut control_send,
								pb::Envelope {
									version: PROTOCOL_VERSION,
									request_id: env.request_id,
									msg: Some(pb::envelope::Msg::Pong(pong)),
								},
							)
							.await?;
						}

						pb::envelope::Msg::Send(send) => {
							metrics::counter!("campus_server_send_events_total").increment(1);

							if let Err(reject) = controller.handle_send(&send).await {
								metrics::counter!("campus_server_send_events_rejected_total").increment(1);
								debug!(
									conn_id,
									status = reject.status(),
									reason = %reject.message(),
									"send rejected"
								);

								send_envelope(
									&mut control_send,
									pb::Envelope {
										version: PROTOCOL_VERSION,
										request_id: env.request_id,
										msg: Some(pb::envelope::Msg::Error(pb::Error {
											event: controller.error_event().to_string(),
											status: reject.status(),
											message: reject.message(),
										})),
									},
								)
								.await?;
							}
						}

						pb::envelope::Msg::History(history) => {
							match controller.handle_history(&history).await {
								Ok(page) => {
									send_envelope(
										&mut control_send,
										pb::Envelope {
											version: PROTOCOL_VERSION,
											request_id: env.request_id,
											msg: Some(pb::envelope::Msg::HistoryPage(page)),
										},
									)
									.await?;
								}
								Err(reject) => {
									send_envelope(
										&mut control_send,
										pb::Envelope {
											version: PROTOCOL_VERSION,
											request_id: env.request_id,
											msg: Some(pb::envelope::Msg::Error(pb::Error {
												event: controller.error_event().to_string(),
												status: reject.status(),
												message: reject.message(),
											})),
										},
									)
									.await?;
								}
							}
						}

						pb::envelope::Msg::Hello(_) => {
							debug!(conn_id, "ignoring duplicate Hello");
						}

						other => {
							warn!(conn_id, "unhandled control message: {:?}", other);
						}
					}
				}

				item = fan_in_rx.recv() => {
					let Some((room, item)) = item else { break };

					match item {
						RoomHubItem::Event(event) => {
							send_envelope(
								&mut control_send,
								pb::Envelope {
									version: PROTOCOL_VERSION,
									request_id: String::new(),
									msg: Some(pb::envelope::Msg::Event(*event)),
								},
							)
							.await?;
						}
						RoomHubItem::Lagged { dropped } => {
							warn!(conn_id, room = %room, dropped, "room subscription lagged; events were dropped");

							send_envelope(
								&mut control_send,
								pb::Envelope {
									version: PROTOCOL_VERSION,
									request_id: String::new(),
									msg: Some(pb::envelope::Msg::Lagged(pb::Lagged {
										room: room.wire_name(),
										dropped,
									})),
								},
							)
							.await?;
						}
					}
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	phase = SessionPhase::Disconnected;

	let left_rooms = {
		let mut st = deps.state.write().await;
		let joined = st.rooms_for_conn(conn_id);
		debug!(conn_id, rooms = ?joined.iter().map(|r| r.wire_name()).collect::<Vec<_>>(), "connection closing, leaving rooms");
		st.remove_conn(conn_id)
	};

	for task in &room_tasks {
		task.abort();
	}
	for task in room_tasks {
		let _ = task.await;
	}

	for room in &left_rooms {
		deps.hub.prune_room(room).await;
	}

	debug!(conn_id, phase = phase.as_str(), rooms = left_rooms.len(), "connection closed");

	let _ = reader_task.await;

	loop_result
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>) -> anyhow::Result<pb::Hello> {
	while let Some(env) = ctrl_rx.recv().await {
		let Some(msg) = env.msg else { continue };
		if let pb::envelope::Msg::Hello(h) = msg {
			return Ok(h);
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

/// Answer a connection-level failure with a plain `error` event, then close.
async fn reject_and_close(
	conn_id: u64,
	control_send: &mut quinn::SendStream,
	connection: &quinn::Connection,
	reject: FatalReject,
) {
	let status = reject.status();
	let message = reject.message();
	warn!(conn_id, status, reason = %message, "rejecting connection");
	metrics::counter!("campus_server_connections_rejected_total").increment(1);

	let env = pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id: String::new(),
		msg: Some(pb::envelope::Msg::Error(pb::Error {
			event: "error".to_string(),
			status,
			message: message.clone(),
		})),
	};
	let _ = send_envelope(control_send, env).await;
	let _ = control_send.finish();

	connection.close(quinn::VarInt::from_u32(status), message.as_bytes());
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	metrics::counter!("campus_server_envelopes_out_total").increment(1);
	metrics::counter!("campus_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
