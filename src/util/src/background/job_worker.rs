//! A `Worker` that just drains a shared queue of one-off jobs; several of
//! these make up the `BackgroundRunner`'s fixed-size job pool.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use super::worker::{Worker, WorkerStatus};
use super::Job;
use crate::error::Error;

pub(crate) struct JobWorker {
	pub(crate) index: usize,
	pub(crate) job_chan: Arc<Mutex<mpsc::UnboundedReceiver<(Job, bool)>>>,
	pub(crate) next_job: Option<Job>,
}

#[async_trait]
impl Worker for JobWorker {
	fn name(&self) -> String {
		format!("job runner #{}", self.index)
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		match self.next_job.take() {
			None => Ok(WorkerStatus::Idle),
			Some(job) => {
				job.await?;
				Ok(WorkerStatus::Busy)
			}
		}
	}

	async fn wait_for_work(&mut self, must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		loop {
			match self.job_chan.lock().await.recv().await {
				Some((job, cancellable)) => {
					if cancellable && *must_exit.borrow() {
						continue;
					}
					self.next_job = Some(job);
					return WorkerStatus::Busy;
				}
				None => return WorkerStatus::Done,
			}
		}
	}
}
