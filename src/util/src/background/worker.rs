use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::FutureExt;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::error::Error;

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum WorkerStatus {
	/// There is more work to do right away; call `work()` again immediately.
	Busy,
	/// No work available right now; call `wait_for_work()` next.
	Idle,
	/// This worker is finished for good and can be dropped.
	Done,
}

/// One independently-scheduled unit of background work: a trunk
/// preallocation loop, one replication lane's consumer, the recovery
/// scheduler for one data group, or the binlog writer itself.
#[async_trait]
pub trait Worker: Send {
	fn name(&self) -> String;

	/// Does one bounded unit of work. Implementations should not block for
	/// long; condition waits, disk fsyncs and brief network round-trips are
	/// the only permitted suspension points. Returning `Err`
	/// logs the error and retries after a short backoff; it does not stop
	/// the worker.
	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error>;

	/// Waits for more work to appear after `work()` returned `Idle`. May be
	/// interrupted at any point; does not need to watch `must_exit` itself.
	async fn wait_for_work(&mut self, must_exit: &watch::Receiver<bool>) -> WorkerStatus;
}

/// How long the supervisor gives registered workers to reach `Done` once
/// `stop_signal` flips before it cuts the drain short. Workers whose last
/// bounded unit of work is a disk fsync (the binlog writer) need a longer
/// budget than ones that only drop an in-memory queue (a replication lane
/// consumer), so this is a per-`BackgroundRunner` setting instead of a
/// fixed constant.
#[derive(Debug, Clone, Copy)]
pub struct DrainTimeouts {
	pub soft_deadline: Duration,
	pub hard_timeout: Duration,
}

impl Default for DrainTimeouts {
	fn default() -> Self {
		Self {
			soft_deadline: Duration::from_secs(5),
			hard_timeout: Duration::from_secs(9),
		}
	}
}

pub(crate) struct WorkerProcessor {
	stop_signal: watch::Receiver<bool>,
	worker_chan: mpsc::UnboundedReceiver<Box<dyn Worker>>,
	drain: DrainTimeouts,
}

impl WorkerProcessor {
	pub(crate) fn new(
		worker_chan: mpsc::UnboundedReceiver<Box<dyn Worker>>,
		stop_signal: watch::Receiver<bool>,
		drain: DrainTimeouts,
	) -> Self {
		Self {
			stop_signal,
			worker_chan,
			drain,
		}
	}

	pub(crate) async fn run(&mut self) {
		let mut running = FuturesUnordered::new();
		let mut next_id = 1usize;

		while !*self.stop_signal.borrow() {
			let await_next = async {
				if running.is_empty() {
					futures::future::pending().await
				} else {
					running.next().await
				}
			};
			select! {
				incoming = self.worker_chan.recv() => {
					if let Some(worker) = incoming {
						let id = next_id;
						next_id += 1;
						let stop_signal = self.stop_signal.clone();
						let stop_signal_for_wait = self.stop_signal.clone();
						running.push(async move {
							let mut handle = RunningWorker {
								id,
								stop_signal,
								stop_signal_for_wait,
								worker,
								status: WorkerStatus::Busy,
							};
							handle.step().await;
							handle
						}.boxed());
					}
				}
				finished = await_next => {
					if let Some(mut handle) = finished {
						if handle.status == WorkerStatus::Done {
							info!("worker '{}' (#{}) exited", handle.worker.name(), handle.id);
						} else {
							running.push(async move {
								handle.step().await;
								handle
							}.boxed());
						}
					}
				}
				_ = self.stop_signal.changed() => (),
			}
		}

		let drain_deadline = Instant::now() + self.drain.soft_deadline;
		let drain_all = async {
			while let Some(mut handle) = running.next().await {
				if handle.status == WorkerStatus::Done {
					info!("worker '{}' (#{}) exited", handle.worker.name(), handle.id);
				} else if Instant::now() > drain_deadline {
					warn!(
						"worker '{}' (#{}) interrupted mid-step while exiting",
						handle.worker.name(),
						handle.id
					);
				} else {
					running.push(async move {
						handle.step().await;
						handle
					}.boxed());
				}
			}
		};

		select! {
			_ = drain_all => {
				info!("all background workers drained cleanly");
			}
			_ = tokio::time::sleep(self.drain.hard_timeout) => {
				error!("some background workers did not drain in time; exiting anyway");
			}
		}
	}
}

struct RunningWorker {
	id: usize,
	stop_signal: watch::Receiver<bool>,
	stop_signal_for_wait: watch::Receiver<bool>,
	worker: Box<dyn Worker>,
	status: WorkerStatus,
}

impl RunningWorker {
	async fn step(&mut self) {
		match self.status {
			WorkerStatus::Busy => match self.worker.work(&mut self.stop_signal).await {
				Ok(s) => self.status = s,
				Err(e) => {
					error!("worker '{}' (#{}) failed: {}", self.worker.name(), self.id, e);
					tokio::time::sleep(Duration::from_secs(10)).await;
				}
			},
			WorkerStatus::Idle => {
				if *self.stop_signal.borrow() {
					select! {
						new_status = self.worker.wait_for_work(&self.stop_signal_for_wait) => {
							self.status = new_status;
						}
						_ = tokio::time::sleep(Duration::from_secs(1)) => {}
					}
				} else {
					select! {
						new_status = self.worker.wait_for_work(&self.stop_signal_for_wait) => {
							self.status = new_status;
						}
						_ = self.stop_signal.changed() => {}
					}
				}
			}
			WorkerStatus::Done => unreachable!("stepped a worker that already finished"),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	use super::*;

	/// Returns `Busy` `busy_calls` times, then `Done`.
	struct CountingWorker {
		calls: Arc<AtomicUsize>,
		remaining_busy: usize,
	}

	#[async_trait]
	impl Worker for CountingWorker {
		fn name(&self) -> String {
			"counting worker".to_string()
		}

		async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			if self.remaining_busy == 0 {
				return Ok(WorkerStatus::Done);
			}
			self.remaining_busy -= 1;
			Ok(WorkerStatus::Busy)
		}

		async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
			WorkerStatus::Done
		}
	}

	#[tokio::test]
	async fn processor_drains_a_registered_worker_to_done() {
		let calls = Arc::new(AtomicUsize::new(0));
		let (stop_tx, stop_rx) = watch::channel(false);
		let (send_worker, worker_out) = mpsc::unbounded_channel::<Box<dyn Worker>>();

		send_worker
			.send(Box::new(CountingWorker {
				calls: calls.clone(),
				remaining_busy: 3,
			}))
			.ok()
			.unwrap();
		drop(send_worker);

		let mut processor = WorkerProcessor::new(worker_out, stop_rx, DrainTimeouts::default());
		let handle = tokio::spawn(async move { processor.run().await });

		for _ in 0..20 {
			tokio::task::yield_now().await;
		}
		stop_tx.send(true).unwrap();
		handle.await.unwrap();

		// 3 Busy calls plus the final Done call.
		assert_eq!(calls.load(Ordering::SeqCst), 4);
	}

	/// A worker that is always `Idle` and only exits once `must_exit` flips,
	/// exercising the drain path's soft/hard timeout wiring.
	struct StubbornWorker;

	#[async_trait]
	impl Worker for StubbornWorker {
		fn name(&self) -> String {
			"stubborn worker".to_string()
		}

		async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
			Ok(WorkerStatus::Idle)
		}

		async fn wait_for_work(&mut self, must_exit: &watch::Receiver<bool>) -> WorkerStatus {
			let mut must_exit = must_exit.clone();
			let _ = must_exit.wait_for(|v| *v).await;
			WorkerStatus::Done
		}
	}

	#[tokio::test]
	async fn drain_completes_within_soft_deadline_when_worker_cooperates() {
		let (stop_tx, stop_rx) = watch::channel(false);
		let (send_worker, worker_out) = mpsc::unbounded_channel::<Box<dyn Worker>>();
		send_worker.send(Box::new(StubbornWorker)).ok().unwrap();
		drop(send_worker);

		let drain = DrainTimeouts {
			soft_deadline: Duration::from_millis(50),
			hard_timeout: Duration::from_millis(200),
		};
		let mut processor = WorkerProcessor::new(worker_out, stop_rx, drain);
		let handle = tokio::spawn(async move { processor.run().await });

		tokio::task::yield_now().await;
		stop_tx.send(true).unwrap();

		tokio::time::timeout(Duration::from_millis(200), handle)
			.await
			.expect("processor should drain within the hard timeout")
			.unwrap();
	}
}
