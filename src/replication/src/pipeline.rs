//! Master-side replication fan-out. `push_to_slave_queues`
//! enqueues one mutation onto every active slave's lane queue; the
//! origin task's `waiting_rpc_count` tracks outstanding acks and wakes
//! the caller once every active slave has acknowledged (or none were
//! active to begin with).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{error, warn};

use dfs_rpc::cluster::{ClusterDataGroupInfo, ReplicaStatus};
use dfs_util::background::worker::{Worker, WorkerStatus};
use dfs_util::error::{Error, Result};

/// Tracks one master-side mutation's outstanding slave acknowledgments.
/// `waiting_rpc_count` starts at the number of slaves the entry was
/// actually enqueued to; reaching zero wakes whoever is waiting on
/// `done()` (normally the request handler that owes the client a reply).
pub struct OriginTask {
	pub task_version: u64,
	waiting_rpc_count: AtomicUsize,
	notify: Notify,
}

impl OriginTask {
	fn new(task_version: u64, initial_count: usize) -> Arc<Self> {
		Arc::new(Self {
			task_version,
			waiting_rpc_count: AtomicUsize::new(initial_count),
			notify: Notify::new(),
		})
	}

	/// Records one slave's acknowledgment if its `task_version` matches.
	/// Returns `true` exactly once, for the ack that brings the count to
	/// zero.
	pub fn ack(&self, task_version: u64) -> bool {
		if task_version != self.task_version {
			return false;
		}
		let became_zero = self.subtract(1);
		if became_zero {
			self.notify.notify_waiters();
		}
		became_zero
	}

	fn subtract(&self, n: usize) -> bool {
		let mut current = self.waiting_rpc_count.load(Ordering::Acquire);
		loop {
			let next = current.saturating_sub(n);
			match self.waiting_rpc_count.compare_exchange_weak(
				current,
				next,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => return next == 0 && current != 0,
				Err(observed) => current = observed,
			}
		}
	}

	pub fn remaining(&self) -> usize {
		self.waiting_rpc_count.load(Ordering::Acquire)
	}

	/// Waits until every expected ack has arrived. Returns immediately if
	/// it already has (e.g. every slave turned out to be inactive).
	pub async fn wait_done(&self) {
		while self.remaining() > 0 {
			self.notify.notified().await;
		}
	}
}

/// One mutation queued for one slave lane. Freed the moment the last
/// `Arc` clone (one per lane it was enqueued to) is dropped — Rust's own
/// ownership tracking stands in for a hand-rolled `reffer_count` that
/// frees when it reaches zero.
pub struct RpcEntry {
	pub origin: Arc<OriginTask>,
	pub hash_code: u64,
	pub body: Bytes,
	on_free: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Drop for RpcEntry {
	fn drop(&mut self) {
		if let Some(f) = &self.on_free {
			f();
		}
	}
}

pub type RpcEntryHandle = Arc<RpcEntry>;

/// One (slave, hash-partition) replication lane: an mpsc queue an I/O
/// worker drains, plus whether a live connection task is currently
/// attached (`Replication{task, rpc_queue, state}`).
pub struct ReplicationLane {
	tx: mpsc::UnboundedSender<RpcEntryHandle>,
	rx: Mutex<Option<mpsc::UnboundedReceiver<RpcEntryHandle>>>,
	has_task: AtomicBool,
}

impl ReplicationLane {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		Self {
			tx,
			rx: Mutex::new(Some(rx)),
			has_task: AtomicBool::new(false),
		}
	}

	pub fn attach_task(&self) {
		self.has_task.store(true, Ordering::Release);
	}

	pub fn detach_task(&self) {
		self.has_task.store(false, Ordering::Release);
	}

	fn has_task(&self) -> bool {
		self.has_task.load(Ordering::Acquire)
	}

	fn enqueue(&self, entry: RpcEntryHandle) -> Result<()> {
		self.tx.send(entry).map_err(|_| Error::ChannelInvalid)
	}

	/// Takes ownership of the receiving half so a single consumer worker
	/// can drain it; returns `None` if one already has.
	pub async fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<RpcEntryHandle>> {
		self.rx.lock().await.take()
	}
}

impl Default for ReplicationLane {
	fn default() -> Self {
		Self::new()
	}
}

/// All replication lanes owned by one slave server, routed by
/// `hash_code mod lanes.len()` (`repl_ptr_array`).
pub struct SlaveReplications {
	pub server_id: u64,
	pub lanes: Vec<ReplicationLane>,
}

impl SlaveReplications {
	pub fn new(server_id: u64, lane_count: usize) -> Self {
		Self {
			server_id,
			lanes: (0..lane_count.max(1)).map(|_| ReplicationLane::new()).collect(),
		}
	}

	fn lane_for(&self, hash_code: u64) -> &ReplicationLane {
		&self.lanes[(hash_code as usize) % self.lanes.len()]
	}
}

pub enum PushResult {
	Done,
	Continue(Arc<OriginTask>),
}

/// `push_to_slave_queues`. `slaves` must be index-aligned
/// with `group.slave_ds_array`.
pub async fn push_to_slave_queues(
	group: &ClusterDataGroupInfo,
	slaves: &[SlaveReplications],
	run_flag: &AtomicBool,
	hash_code: u64,
	task_version: u64,
	body: Bytes,
) -> Result<PushResult> {
	let slave_count = group.slave_ds_array.len();
	let origin = OriginTask::new(task_version, slave_count);

	let mut inactive_count = 0usize;
	for (i, slave_ref) in group.slave_ds_array.iter().enumerate() {
		slave_ref.wait_while_online(run_flag).await;

		if slave_ref.status() != ReplicaStatus::Active {
			inactive_count += 1;
			continue;
		}

		let lane = slaves[i].lane_for(hash_code);
		if !lane.has_task() {
			inactive_count += 1;
			continue;
		}

		let entry = Arc::new(RpcEntry {
			origin: origin.clone(),
			hash_code,
			body: body.clone(),
			on_free: None,
		});
		lane.enqueue(entry)?;
	}

	if inactive_count > 0 {
		origin.subtract(inactive_count);
		warn!(
			group_id = group.id,
			task_version,
			inactive_count,
			slave_count,
			"skipped inactive or untasked slaves during fan-out"
		);
	}

	if origin.remaining() == 0 {
		Ok(PushResult::Done)
	} else {
		Ok(PushResult::Continue(origin))
	}
}

/// Drains one slave lane's queue, handing each entry to the (abstracted)
/// connection for transmission and acking the origin task on success.
/// The actual network send is delegated to `send`, kept generic so this
/// worker can be tested without a connection manager.
pub struct LaneConsumer<F> {
	pub lane_index: usize,
	rx: mpsc::UnboundedReceiver<RpcEntryHandle>,
	send: F,
	next: Option<RpcEntryHandle>,
}

impl<F> LaneConsumer<F>
where
	F: FnMut(&RpcEntryHandle) -> Result<()> + Send,
{
	pub fn new(lane_index: usize, rx: mpsc::UnboundedReceiver<RpcEntryHandle>, send: F) -> Self {
		Self {
			lane_index,
			rx,
			send,
			next: None,
		}
	}
}

#[async_trait]
impl<F> Worker for LaneConsumer<F>
where
	F: FnMut(&RpcEntryHandle) -> Result<()> + Send,
{
	fn name(&self) -> String {
		format!("replication lane #{}", self.lane_index)
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> std::result::Result<WorkerStatus, Error> {
		match self.next.take() {
			None => Ok(WorkerStatus::Idle),
			Some(entry) => {
				if let Err(e) = (self.send)(&entry) {
					error!(lane = self.lane_index, task_version = entry.origin.task_version, error = %e, "lane send failed");
					return Err(e);
				}
				entry.origin.ack(entry.origin.task_version);
				Ok(WorkerStatus::Busy)
			}
		}
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		match self.rx.recv().await {
			Some(entry) => {
				self.next = Some(entry);
				WorkerStatus::Busy
			}
			None => WorkerStatus::Done,
		}
	}
}
