#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use campus_domain::{BatchName, Conversation, ConversationId, Identity, Namespace, Role, RoomKey, TenantId, UserId};
use campus_protocol::pb;
use campus_store::memory::MemoryStore;
use tokio::time::timeout;

use crate::server::authz::NamespaceSpec;
use crate::server::controller::{FatalReject, NamespaceController, RateLimitSettings, SendReject, compute_rooms};
use crate::server::room_hub::{RoomHub, RoomHubConfig, RoomHubItem};

fn identity(id: &str, role: Role, tenant: &str) -> Identity {
	Identity {
		id: UserId::new(id).expect("valid user id"),
		role,
		email: format!("{id}@example.edu"),
		tenant: TenantId::new(tenant).expect("valid tenant"),
	}
}

fn conversation(id: &str, name: &str, tenant: &str) -> Conversation {
	Conversation {
		id: ConversationId::new(id).expect("valid id"),
		name: name.to_string(),
		tenant: TenantId::new(tenant).expect("valid tenant"),
	}
}

fn no_rate_limits() -> RateLimitSettings {
	RateLimitSettings {
		per_conn_burst: 0,
		per_conn_per_minute: 0,
		per_room_burst: 0,
		per_room_per_minute: 0,
	}
}

/// Two tenants, one of everything, a student in CSE-2025 and a teacher
/// assigned to CSE-2025 and EEE-2024 (but not MECH-2023).
async fn seeded_store() -> Arc<MemoryStore> {
	let store = Arc::new(MemoryStore::new());

	store.insert_conversation(conversation("con-ann-1", "announcement", "c1")).await;
	store.insert_conversation(conversation("con-drop-1", "dropbox", "c1")).await;
	store
		.insert_conversation(conversation("con-comm-teacher", "community_teacher", "c1"))
		.await;
	store.insert_conversation(conversation("con-cse", "classgroup_CSE-2025", "c1")).await;
	store.insert_conversation(conversation("con-eee", "classgroup_EEE-2024", "c1")).await;
	store.insert_conversation(conversation("con-mech", "classgroup_MECH-2023", "c1")).await;
	store.insert_conversation(conversation("con-ann-2", "announcement", "c2")).await;

	store
		.insert_user(UserId::new("u-admin").unwrap(), "Alice Admin", "u-admin@example.edu")
		.await;
	store
		.insert_user(UserId::new("u-student").unwrap(), "Sam Student", "u-student@example.edu")
		.await;
	store
		.insert_user(UserId::new("u-teacher").unwrap(), "Tina Teacher", "u-teacher@example.edu")
		.await;
	store
		.insert_user(UserId::new("u-admin-2").unwrap(), "Bob Admin", "u-admin-2@example.edu")
		.await;

	store
		.set_student_batch(UserId::new("u-student").unwrap(), BatchName::new("CSE-2025").unwrap())
		.await;
	store
		.assign_teacher_batch(UserId::new("u-teacher").unwrap(), BatchName::new("CSE-2025").unwrap())
		.await;
	store
		.assign_teacher_batch(UserId::new("u-teacher").unwrap(), BatchName::new("EEE-2024").unwrap())
		.await;

	store
}

async fn controller_for(
	namespace: Namespace,
	who: Identity,
	store: &Arc<MemoryStore>,
	hub: &RoomHub,
) -> NamespaceController {
	let spec = NamespaceSpec::of(namespace);
	let rooms = compute_rooms(&spec, &who, store.as_ref()).await.expect("compute rooms");

	NamespaceController::new(
		spec,
		who,
		rooms,
		Arc::clone(store) as Arc<dyn campus_store::ConversationDirectory>,
		Arc::clone(store) as Arc<dyn campus_store::MessageStore>,
		hub.clone(),
		no_rate_limits(),
		4096,
	)
}

fn send(namespace: Namespace, conversation_id: &str, content: &str) -> pb::Send {
	pb::Send {
		event: namespace.send_event().to_string(),
		conversation_id: conversation_id.to_string(),
		content: content.to_string(),
	}
}

async fn expect_event(rx: &mut tokio::sync::mpsc::Receiver<RoomHubItem>) -> pb::EventEnvelope {
	let item = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("channel open");
	match item {
		RoomHubItem::Event(ev) => *ev,
		other => panic!("expected Event, got: {other:?}"),
	}
}

async fn expect_silence(rx: &mut tokio::sync::mpsc::Receiver<RoomHubItem>) {
	let got = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(got.is_err(), "room unexpectedly received an event");
}

#[tokio::test]
async fn student_joins_exactly_one_deterministic_room() {
	let store = seeded_store().await;
	let spec = NamespaceSpec::of(Namespace::Classroom);
	let who = identity("u-student", Role::Student, "c1");

	let first = compute_rooms(&spec, &who, store.as_ref()).await.expect("rooms");
	let second = compute_rooms(&spec, &who, store.as_ref()).await.expect("rooms again");

	assert_eq!(first.len(), 1);
	assert_eq!(first, second);
	assert_eq!(first[0].wire_name(), "college_c1_student_CSE-2025");
}

#[tokio::test]
async fn classroom_join_rejects_unprovisioned_identities() {
	let store = seeded_store().await;
	let spec = NamespaceSpec::of(Namespace::Classroom);

	let unbatched = identity("u-admin", Role::Student, "c1");
	let err = compute_rooms(&spec, &unbatched, store.as_ref()).await.unwrap_err();
	assert!(matches!(err, FatalReject::NotFound(_)));
	assert_eq!(err.status(), 404);

	let unassigned = identity("u-admin", Role::Teacher, "c1");
	let err = compute_rooms(&spec, &unassigned, store.as_ref()).await.unwrap_err();
	assert!(err.message().contains("not assigned any batches"));
}

#[tokio::test]
async fn teacher_joins_one_room_per_assigned_batch() {
	let store = seeded_store().await;
	let spec = NamespaceSpec::of(Namespace::Classroom);
	let who = identity("u-teacher", Role::Teacher, "c1");

	let rooms = compute_rooms(&spec, &who, store.as_ref()).await.expect("rooms");
	let mut names: Vec<String> = rooms.iter().map(|r| r.wire_name()).collect();
	names.sort();
	assert_eq!(names, vec!["college_c1_student_CSE-2025", "college_c1_student_EEE-2024"]);
}

#[tokio::test]
async fn student_send_fans_out_hydrated_message() {
	let store = seeded_store().await;
	let hub = RoomHub::new(RoomHubConfig::default());

	let room = RoomKey::Classroom {
		tenant: TenantId::new("c1").unwrap(),
		batch: BatchName::new("CSE-2025").unwrap(),
	};
	let mut peer = hub.subscribe_room(room.clone()).await;

	let mut controller = controller_for(Namespace::Classroom, identity("u-student", Role::Student, "c1"), &store, &hub).await;

	let stored = controller
		.handle_send(&send(Namespace::Classroom, "con-cse", "hi"))
		.await
		.expect("send accepted");
	assert_eq!(stored.sender_name, "Sam Student");

	let event = expect_event(&mut peer).await;
	assert_eq!(event.event, "new_classroom");
	assert_eq!(event.room, "college_c1_student_CSE-2025");

	let message = event.message.expect("hydrated message");
	assert_eq!(message.content, "hi");
	assert_eq!(message.sender_id, "u-student");
	assert_eq!(message.sender_name, "Sam Student");
	assert_eq!(message.sender_email, "u-student@example.edu");
	assert_eq!(message.conversation_id, "con-cse");
}

#[tokio::test]
async fn spoofed_conversation_id_is_rejected_without_append_or_fanout() {
	let store = seeded_store().await;
	let hub = RoomHub::new(RoomHubConfig::default());

	let room = RoomKey::Announcement {
		tenant: TenantId::new("c1").unwrap(),
	};
	let mut peer = hub.subscribe_room(room).await;

	let mut controller =
		controller_for(Namespace::Announcement, identity("u-admin", Role::Admin, "c1"), &store, &hub).await;

	// A real conversation id, but belonging to another tenant's announcement.
	let err = controller
		.handle_send(&send(Namespace::Announcement, "con-ann-2", "spoofed"))
		.await
		.unwrap_err();
	assert!(matches!(err, SendReject::InvalidConversation));
	assert_eq!(err.status(), 400);

	expect_silence(&mut peer).await;

	let page = campus_store::MessageStore::page(
		store.as_ref(),
		campus_store::PageRequest {
			conversation_id: ConversationId::new("con-ann-1").unwrap(),
			cursor: None,
			limit: 10,
		},
	)
	.await
	.expect("page");
	assert!(page.is_empty(), "spoofed send must not be persisted");
}

#[tokio::test]
async fn no_persist_means_no_broadcast_and_vice_versa() {
	let store = seeded_store().await;
	let hub = RoomHub::new(RoomHubConfig::default());

	let room = RoomKey::Dropbox {
		tenant: TenantId::new("c1").unwrap(),
	};
	let mut peer = hub.subscribe_room(room).await;

	let mut controller = controller_for(Namespace::Dropbox, identity("u-student", Role::Student, "c1"), &store, &hub).await;

	store.fail_appends(true);
	let err = controller
		.handle_send(&send(Namespace::Dropbox, "con-drop-1", "lost"))
		.await
		.unwrap_err();
	assert!(matches!(err, SendReject::Persistence(_)));
	assert_eq!(err.status(), 500);
	expect_silence(&mut peer).await;

	store.fail_appends(false);
	controller
		.handle_send(&send(Namespace::Dropbox, "con-drop-1", "delivered"))
		.await
		.expect("send accepted");

	let event = expect_event(&mut peer).await;
	assert_eq!(event.event, "new_dropbox");
	assert_eq!(event.message.expect("message").content, "delivered");
}

#[tokio::test]
async fn teacher_cannot_send_to_unassigned_batch() {
	let store = seeded_store().await;
	let hub = RoomHub::new(RoomHubConfig::default());

	let mech_room = RoomKey::Classroom {
		tenant: TenantId::new("c1").unwrap(),
		batch: BatchName::new("MECH-2023").unwrap(),
	};
	let mut mech_peer = hub.subscribe_room(mech_room).await;

	let mut controller =
		controller_for(Namespace::Classroom, identity("u-teacher", Role::Teacher, "c1"), &store, &hub).await;

	let err = controller
		.handle_send(&send(Namespace::Classroom, "con-mech", "hello mech"))
		.await
		.unwrap_err();
	assert!(matches!(err, SendReject::Forbidden(_)));
	assert_eq!(err.status(), 403);
	assert!(err.message().contains("MECH-2023"));

	expect_silence(&mut mech_peer).await;
}

#[tokio::test]
async fn teacher_send_targets_only_the_addressed_batch_room() {
	let store = seeded_store().await;
	let hub = RoomHub::new(RoomHubConfig::default());

	let tenant = TenantId::new("c1").unwrap();
	let mut cse_peer = hub
		.subscribe_room(RoomKey::Classroom {
			tenant: tenant.clone(),
			batch: BatchName::new("CSE-2025").unwrap(),
		})
		.await;
	let mut eee_peer = hub
		.subscribe_room(RoomKey::Classroom {
			tenant,
			batch: BatchName::new("EEE-2024").unwrap(),
		})
		.await;

	let mut controller =
		controller_for(Namespace::Classroom, identity("u-teacher", Role::Teacher, "c1"), &store, &hub).await;

	controller
		.handle_send(&send(Namespace::Classroom, "con-eee", "eee only"))
		.await
		.expect("send accepted");

	let event = expect_event(&mut eee_peer).await;
	assert_eq!(event.room, "college_c1_student_EEE-2024");
	expect_silence(&mut cse_peer).await;
}

#[tokio::test]
async fn tenant_isolation_holds_across_equal_logical_names() {
	let store = seeded_store().await;
	let hub = RoomHub::new(RoomHubConfig::default());

	let c1_room = RoomKey::Announcement {
		tenant: TenantId::new("c1").unwrap(),
	};
	let mut c1_peer = hub.subscribe_room(c1_room).await;

	let mut c2_controller =
		controller_for(Namespace::Announcement, identity("u-admin-2", Role::Admin, "c2"), &store, &hub).await;

	c2_controller
		.handle_send(&send(Namespace::Announcement, "con-ann-2", "c2 news"))
		.await
		.expect("send accepted");

	expect_silence(&mut c1_peer).await;
}

#[tokio::test]
async fn cross_tenant_classgroup_id_reads_as_unknown() {
	let store = seeded_store().await;
	store.insert_conversation(conversation("con-cse-c2", "classgroup_CSE-2025", "c2")).await;
	let hub = RoomHub::new(RoomHubConfig::default());

	let mut controller =
		controller_for(Namespace::Classroom, identity("u-teacher", Role::Teacher, "c1"), &store, &hub).await;

	let err = controller
		.handle_send(&send(Namespace::Classroom, "con-cse-c2", "cross tenant"))
		.await
		.unwrap_err();
	assert!(matches!(err, SendReject::NotFound(_)));
}

#[tokio::test]
async fn rejects_wrong_event_name_and_bad_content() {
	let store = seeded_store().await;
	let hub = RoomHub::new(RoomHubConfig::default());

	let mut controller =
		controller_for(Namespace::Announcement, identity("u-admin", Role::Admin, "c1"), &store, &hub).await;

	let mut wrong_event = send(Namespace::Announcement, "con-ann-1", "hi");
	wrong_event.event = "send_community".to_string();
	let err = controller.handle_send(&wrong_event).await.unwrap_err();
	assert!(matches!(err, SendReject::Validation(_)));

	let err = controller
		.handle_send(&send(Namespace::Announcement, "con-ann-1", "   "))
		.await
		.unwrap_err();
	assert!(matches!(err, SendReject::Validation(_)));

	let oversized = "x".repeat(5000);
	let err = controller
		.handle_send(&send(Namespace::Announcement, "con-ann-1", &oversized))
		.await
		.unwrap_err();
	assert!(matches!(err, SendReject::Validation(_)));

	let err = controller
		.handle_send(&send(Namespace::Announcement, "", "hi"))
		.await
		.unwrap_err();
	assert!(matches!(err, SendReject::Validation(_)));
}

#[tokio::test]
async fn per_connection_rate_limit_applies() {
	let store = seeded_store().await;
	let hub = RoomHub::new(RoomHubConfig::default());

	let spec = NamespaceSpec::of(Namespace::Announcement);
	let who = identity("u-admin", Role::Admin, "c1");
	let rooms = compute_rooms(&spec, &who, store.as_ref()).await.expect("rooms");

	let mut controller = NamespaceController::new(
		spec,
		who,
		rooms,
		Arc::clone(&store) as Arc<dyn campus_store::ConversationDirectory>,
		Arc::clone(&store) as Arc<dyn campus_store::MessageStore>,
		hub,
		RateLimitSettings {
			per_conn_burst: 1,
			per_conn_per_minute: 1,
			per_room_burst: 0,
			per_room_per_minute: 0,
		},
		4096,
	);

	controller
		.handle_send(&send(Namespace::Announcement, "con-ann-1", "first"))
		.await
		.expect("first send accepted");

	let err = controller
		.handle_send(&send(Namespace::Announcement, "con-ann-1", "second"))
		.await
		.unwrap_err();
	assert!(matches!(err, SendReject::RateLimited));
	assert_eq!(err.status(), 429);
}

#[tokio::test]
async fn history_pages_newest_first_within_room_scope() {
	let store = seeded_store().await;
	let hub = RoomHub::new(RoomHubConfig::default());

	let mut controller =
		controller_for(Namespace::Announcement, identity("u-admin", Role::Admin, "c1"), &store, &hub).await;

	for i in 0..3 {
		controller
			.handle_send(&send(Namespace::Announcement, "con-ann-1", &format!("a{i}")))
			.await
			.expect("send accepted");
	}

	let first = controller
		.handle_history(&pb::History {
			conversation_id: "con-ann-1".to_string(),
			cursor: String::new(),
			limit: 2,
		})
		.await
		.expect("history");
	assert_eq!(first.messages.len(), 2);
	assert_eq!(first.messages[0].content, "a2");
	assert_eq!(first.messages[1].content, "a1");
	assert!(!first.next_cursor.is_empty());

	let second = controller
		.handle_history(&pb::History {
			conversation_id: "con-ann-1".to_string(),
			cursor: first.next_cursor.clone(),
			limit: 2,
		})
		.await
		.expect("second page");
	assert_eq!(second.messages.len(), 1);
	assert_eq!(second.messages[0].content, "a0");

	let err = controller
		.handle_history(&pb::History {
			conversation_id: "con-drop-1".to_string(),
			cursor: String::new(),
			limit: 2,
		})
		.await
		.unwrap_err();
	assert!(matches!(err, SendReject::Forbidden(_)));

	let err = controller
		.handle_history(&pb::History {
			conversation_id: "con-ann-1".to_string(),
			cursor: "not-a-cursor".to_string(),
			limit: 2,
		})
		.await
		.unwrap_err();
	assert!(matches!(err, SendReject::Validation(_)));
}
