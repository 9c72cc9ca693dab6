//! Background task scheduling shared by every subsystem that runs a
//! long-lived loop: trunk preallocation, replication lane consumers,
//! the recovery scheduler and the binlog writer's fsync loop are all
//! `Worker` implementations driven by one `BackgroundRunner` per server
//! process, rather than bespoke `tokio::spawn` loops.

pub mod job_worker;
pub mod worker;

use core::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

use crate::error::Error;
use worker::{DrainTimeouts, Worker, WorkerProcessor};

pub(crate) type JobOutput = Result<(), Error>;
pub(crate) type Job = Pin<Box<dyn Future<Output = JobOutput> + Send>>;

/// Schedules one-off async jobs and long-lived `Worker`s onto a bounded
/// pool of job-runner tasks plus one supervisor task per worker.
pub struct BackgroundRunner {
	send_job: mpsc::UnboundedSender<(Job, bool)>,
	send_worker: mpsc::UnboundedSender<Box<dyn Worker>>,
}

impl BackgroundRunner {
	/// Creates a runner with `n_runners` job-processing slots. `stop_signal`
	/// going to `true` starts a graceful drain of all registered workers,
	/// using the default drain timeouts (see `with_drain_timeouts` for
	/// workers, such as the binlog writer, that need longer to flush).
	pub fn new(
		n_runners: usize,
		stop_signal: watch::Receiver<bool>,
	) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
		Self::with_drain_timeouts(n_runners, stop_signal, DrainTimeouts::default())
	}

	/// Like `new`, but lets the caller override how long the supervisor
	/// waits for registered workers to reach `Done` on shutdown.
	pub fn with_drain_timeouts(
		n_runners: usize,
		stop_signal: watch::Receiver<bool>,
		drain: DrainTimeouts,
	) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
		let (send_worker, worker_out) = mpsc::unbounded_channel::<Box<dyn Worker>>();

		let supervisor = tokio::spawn(async move {
			WorkerProcessor::new(worker_out, stop_signal, drain).run().await
		});

		let (send_job, queue_out) = mpsc::unbounded_channel();
		let queue_out = Arc::new(Mutex::new(queue_out));

		for i in 0..n_runners {
			send_worker
				.send(Box::new(job_worker::JobWorker {
					index: i,
					job_chan: queue_out.clone(),
					next_job: None,
				}))
				.ok()
				.expect("background runner supervisor channel closed at startup");
		}

		let runner = Arc::new(Self {
			send_job,
			send_worker,
		});
		(runner, supervisor)
	}

	/// Runs `job` on the next free job-runner slot.
	pub fn spawn<T>(&self, job: T)
	where
		T: Future<Output = JobOutput> + Send + 'static,
	{
		let boxed: Job = Box::pin(job);
		self.send_job
			.send((boxed, false))
			.ok()
			.expect("background runner queue closed");
	}

	/// Like `spawn`, but the job may be silently dropped if it is still
	/// queued when the runner starts shutting down.
	pub fn spawn_cancellable<T>(&self, job: T)
	where
		T: Future<Output = JobOutput> + Send + 'static,
	{
		let boxed: Job = Box::pin(job);
		self.send_job
			.send((boxed, true))
			.ok()
			.expect("background runner queue closed");
	}

	/// Registers a long-lived `Worker` with the supervisor.
	pub fn spawn_worker<W>(&self, worker: W)
	where
		W: Worker + 'static,
	{
		self.send_worker
			.send(Box::new(worker))
			.ok()
			.expect("background runner worker channel closed");
	}
}
