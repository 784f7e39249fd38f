#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use campus_domain::RoomKey;

/// Shared server state: which rooms each connection joined.
///
/// Mutated only by the join transition and on disconnect.
#[derive(Debug, Default)]
pub struct GlobalState {
	rooms_by_conn: HashMap<u64, HashSet<RoomKey>>,
}

impl GlobalState {
	/// Record the rooms a connection was joined to.
	pub fn join_rooms(&mut self, conn_id: u64, rooms: &[RoomKey]) {
		let set = self.rooms_by_conn.entry(conn_id).or_default();
		for room in rooms {
			set.insert(room.clone());
		}
	}

	/// Returns a snapshot of joined rooms for the given connection id.
	pub fn rooms_for_conn(&self, conn_id: u64) -> HashSet<RoomKey> {
		self.rooms_by_conn.get(&conn_id).cloned().unwrap_or_default()
	}

	/// Removes state for a connection, returning the rooms it had joined.
	pub fn remove_conn(&mut self, conn_id: u64) -> Vec<RoomKey> {
		self.rooms_by_conn
			.remove(&conn_id)
			.map(|set| set.into_iter().collect())
			.unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use campus_domain::TenantId;

	use super::*;

	fn room(tenant: &str) -> RoomKey {
		RoomKey::Announcement {
			tenant: TenantId::new(tenant).unwrap(),
		}
	}

	#[test]
	fn join_is_idempotent_per_room() {
		let mut state = GlobalState::default();
		state.join_rooms(1, &[room("c1")]);
		state.join_rooms(1, &[room("c1")]);

		assert_eq!(state.rooms_for_conn(1).len(), 1);
	}

	#[test]
	fn remove_conn_returns_joined_rooms() {
		let mut state = GlobalState::default();
		state.join_rooms(1, &[room("c1"), room("c2")]);
		state.join_rooms(2, &[room("c1")]);

		let mut left = state.remove_conn(1);
		left.sort_by_key(|r| r.wire_name());
		assert_eq!(left.len(), 2);

		assert!(state.rooms_for_conn(1).is_empty());
		assert_eq!(state.rooms_for_conn(2).len(), 1);
		assert!(state.remove_conn(1).is_empty());
	}
}
