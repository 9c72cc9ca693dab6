//! Cluster membership view (`ClusterDataGroupInfo`). The actual
//! election of masters and propagation of server status is delegated to
//! an external relationship/heartbeat service; this module only
//! holds the resulting view and makes it safe to read concurrently.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::Notify;
use tracing::info;

pub type ServerId = u64;
pub type DataGroupId = u64;

/// A slave's replication status as seen by the master:
/// `Online` is the transient "catching up" state a recovering replica
/// passes through before a relationship-service `active_confirm` flips
/// it to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplicaStatus {
	Offline = 0,
	Online = 1,
	Active = 2,
}

impl ReplicaStatus {
	fn from_u8(v: u8) -> Self {
		match v {
			1 => ReplicaStatus::Online,
			2 => ReplicaStatus::Active,
			_ => ReplicaStatus::Offline,
		}
	}
}

/// One slave of a data group, with its own atomically-updated status
/// (`status` accessed with acquire/release atomics).
pub struct SlaveRef {
	pub server_id: ServerId,
	status: AtomicU8,
	status_notify: Notify,
}

impl SlaveRef {
	pub fn new(server_id: ServerId, status: ReplicaStatus) -> Self {
		Self {
			server_id,
			status: AtomicU8::new(status as u8),
			status_notify: Notify::new(),
		}
	}

	pub fn status(&self) -> ReplicaStatus {
		ReplicaStatus::from_u8(self.status.load(Ordering::Acquire))
	}

	pub fn set_status(&self, status: ReplicaStatus) {
		self.status.store(status as u8, Ordering::Release);
		self.status_notify.notify_waiters();
		info!(server_id = self.server_id, ?status, "slave status changed");
	}

	/// Blocks until this slave's status changes away from `Online`, or
	/// `run_flag` clears (`CONTINUE_FLAG`).
	pub async fn wait_while_online(&self, run_flag: &AtomicBool) {
		while self.status() == ReplicaStatus::Online && run_flag.load(Ordering::Acquire) {
			self.status_notify.notified().await;
		}
	}
}

/// `ClusterDataGroupInfo`: `id`, whether the local server is a
/// member, the current master (published by the relationship service and
/// read atomically via `ArcSwapOption`), and the slave list.
pub struct ClusterDataGroupInfo {
	pub id: DataGroupId,
	pub myself: ServerId,
	master: ArcSwapOption<ServerId>,
	pub slave_ds_array: Vec<Arc<SlaveRef>>,
}

impl ClusterDataGroupInfo {
	pub fn new(id: DataGroupId, myself: ServerId, slave_ds_array: Vec<Arc<SlaveRef>>) -> Self {
		Self {
			id,
			myself,
			master: ArcSwapOption::from(None),
			slave_ds_array,
		}
	}

	pub fn master(&self) -> Option<ServerId> {
		self.master.load().as_deref().copied()
	}

	/// Called by the external relationship module when a new master is
	/// elected for this group.
	pub fn set_master(&self, master: ServerId) {
		self.master.store(Some(Arc::new(master)));
		info!(group_id = self.id, master, "data group master elected");
	}

	pub fn clear_master(&self) {
		self.master.store(None);
		info!(group_id = self.id, "data group master cleared");
	}

	pub fn is_master(&self) -> bool {
		self.master() == Some(self.myself)
	}

	pub fn lane_for(&self, hash_code: u64) -> Option<&Arc<SlaveRef>> {
		let count = self.slave_ds_array.len();
		if count == 0 {
			None
		} else {
			self.slave_ds_array.get((hash_code as usize) % count)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn master_updates_are_visible_immediately() {
		let group = ClusterDataGroupInfo::new(1, 10, vec![]);
		assert_eq!(group.master(), None);
		group.set_master(10);
		assert!(group.is_master());
		group.set_master(20);
		assert!(!group.is_master());
	}

	#[test]
	fn slave_status_round_trips() {
		let slave = Arc::new(SlaveRef::new(5, ReplicaStatus::Offline));
		assert_eq!(slave.status(), ReplicaStatus::Offline);
		slave.set_status(ReplicaStatus::Online);
		assert_eq!(slave.status(), ReplicaStatus::Online);
		slave.set_status(ReplicaStatus::Active);
		assert_eq!(slave.status(), ReplicaStatus::Active);
	}

	#[test]
	fn lane_for_routes_by_modulus() {
		let slaves: Vec<_> = (0..3)
			.map(|i| Arc::new(SlaveRef::new(i, ReplicaStatus::Active)))
			.collect();
		let group = ClusterDataGroupInfo::new(1, 99, slaves);
		assert_eq!(group.lane_for(5).unwrap().server_id, 5 % 3);
	}
}
