//! Data recovery state machine: `FETCH → DEDUP → REPLAY →
//! (ACTIVE | retry-FETCH)`, checkpointed to disk after every stage
//! transition so a crash mid-recovery resumes from the last completed
//! stage instead of starting over.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use dfs_rpc::cluster::{ClusterDataGroupInfo, DataGroupId, ServerId};
use dfs_storage::binlog::{parse_line, BinlogRecord, SliceBinlog};
use dfs_storage::index::ObIndex;
use dfs_storage::trunk::{Flavor, TrunkAllocator};
use dfs_util::background::worker::{Worker, WorkerStatus};
use dfs_util::error::{Error, Result};

use crate::dedup::dedup;
use crate::state::{FetchCursor, RecoveryStage, SysData};

/// One record pulled from the master's binlog, tagged with the
/// per-mutation version counter the fetch cursor's `last_data_version` advances by.
#[derive(Debug, Clone)]
pub struct FetchedEntry {
	pub data_version: i64,
	pub record: BinlogRecord,
}

/// Abstracts everything this module needs from the master connection and
/// relationship service (both are external collaborators here).
#[async_trait]
pub trait MasterBinlogSource: Send + Sync {
	/// `NotFound` if the group currently has no master.
	async fn get_master(&self, group: DataGroupId) -> Result<ServerId>;

	/// Streams the master's binlog forward from `cursor`. An empty result
	/// means the replica is already caught up.
	async fn fetch_binlog_since(&self, group: DataGroupId, cursor: FetchCursor) -> Result<Vec<FetchedEntry>>;

	/// Tells the master this replica is caught up; `Err` maps to `Busy`
	/// ("failure is EBUSY").
	async fn active_confirm(&self, group: DataGroupId) -> Result<()>;
}

fn is_member(group: &ClusterDataGroupInfo) -> bool {
	group.is_master() || group.slave_ds_array.iter().any(|s| s.server_id == group.myself)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
	Continue,
	Active,
}

/// Drives one data group's catch-up. Holds the local storage this
/// replica applies REPLAY records into.
pub struct DataRecovery {
	pub group_id: DataGroupId,
	pub myself: ServerId,
	pub file_block_size: u64,
	base_dir: PathBuf,
	index: Arc<ObIndex>,
	trunk: Arc<TrunkAllocator>,
	local_binlog: Arc<SliceBinlog>,
}

impl DataRecovery {
	pub fn new(
		group_id: DataGroupId,
		myself: ServerId,
		file_block_size: u64,
		base_dir: impl Into<PathBuf>,
		index: Arc<ObIndex>,
		trunk: Arc<TrunkAllocator>,
		local_binlog: Arc<SliceBinlog>,
	) -> Self {
		Self {
			group_id,
			myself,
			file_block_size,
			base_dir: base_dir.into(),
			index,
			trunk,
			local_binlog,
		}
	}

	fn sys_data_path(&self) -> PathBuf {
		self.base_dir.join("data_recovery.dat")
	}

	fn fetch_segment_path(&self) -> PathBuf {
		self.base_dir.join("fetch").join("segment.log")
	}

	fn replay_segment_path(&self) -> PathBuf {
		self.base_dir.join("replay").join("segment.log")
	}

	/// Runs the state machine to completion: either the replica reaches
	/// `ACTIVE` (sys-data deleted, `Ok(())`), or a terminal error is
	/// returned. Calls `step` repeatedly, so membership is re-checked
	/// every stage transition rather than once up front.
	pub async fn run(&self, group: &ClusterDataGroupInfo, source: &dyn MasterBinlogSource) -> Result<()> {
		loop {
			if self.step(group, source).await? == StepOutcome::Active {
				return Ok(());
			}
		}
	}

	/// Advances the state machine by exactly one stage transition (or, on
	/// `RecoveryStage::Fetch` with nothing new to fetch, all the way to
	/// `ACTIVE`). Lets a scheduling `Worker` drive catch-up incrementally
	/// instead of blocking until the whole group is caught up.
	pub async fn step(&self, group: &ClusterDataGroupInfo, source: &dyn MasterBinlogSource) -> Result<StepOutcome> {
		if !is_member(group) {
			return Err(Error::NotFound);
		}

		let mut sys = SysData::load(&self.sys_data_path()).await?;
		match sys.stage {
			RecoveryStage::Fetch => {
				let master = source.get_master(self.group_id).await?;
				if master == self.myself {
					warn!(group_id = self.group_id, "recovery found self as master, bailing out busy");
					return Err(Error::Busy);
				}

				let fetched = source.fetch_binlog_since(self.group_id, sys.fetch).await?;
				if fetched.is_empty() {
					info!(group_id = self.group_id, "caught up with master, confirming active");
					self.finish(source).await?;
					return Ok(StepOutcome::Active);
				}

				self.write_fetch_segment(&fetched).await?;
				sys.fetch = advance_cursor(sys.fetch, &fetched);
				sys.stage = RecoveryStage::Dedup;
				sys.save(&self.sys_data_path()).await?;
				info!(
					group_id = self.group_id,
					fetched = fetched.len(),
					last_data_version = sys.fetch.last_data_version,
					"fetched master binlog, advancing to dedup"
				);
			}
			RecoveryStage::Dedup => {
				let fetched = self.read_fetch_segment().await?;
				let deduped = dedup(self.file_block_size, fetched).await?;
				if deduped.is_empty() {
					info!(group_id = self.group_id, "dedup found no net effect, returning to fetch");
					sys.stage = RecoveryStage::Fetch;
					sys.save(&self.sys_data_path()).await?;
					return Ok(StepOutcome::Continue);
				}

				self.write_replay_segment(sys.fetch.last_data_version, &deduped).await?;
				sys.stage = RecoveryStage::Replay;
				sys.save(&self.sys_data_path()).await?;
				info!(group_id = self.group_id, records = deduped.len(), "deduped segment, advancing to replay");
			}
			RecoveryStage::Replay => {
				let (target_version, deduped) = self.read_replay_segment().await?;
				for record in &deduped {
					self.apply(record.clone()).await?;
				}

				if !deduped.is_empty() && target_version > sys.applied_data_version {
					let ts = dfs_util::time::now_msec();
					self.local_binlog.append_noop(ts, target_version).await?;
					sys.applied_data_version = target_version;
				}

				sys.stage = RecoveryStage::Fetch;
				sys.save(&self.sys_data_path()).await?;
				info!(
					group_id = self.group_id,
					applied = deduped.len(),
					applied_data_version = sys.applied_data_version,
					"replay complete, returning to fetch"
				);
			}
		}

		Ok(StepOutcome::Continue)
	}

	async fn finish(&self, source: &dyn MasterBinlogSource) -> Result<()> {
		source
			.active_confirm(self.group_id)
			.await
			.map_err(|_| Error::Busy)?;
		SysData::delete(&self.sys_data_path()).await
	}

	async fn apply(&self, record: BinlogRecord) -> Result<()> {
		let ts = dfs_util::time::now_msec();
		match record {
			BinlogRecord::Add {
				block, ssize, slice_type, ..
			} => {
				let hash_code = block.hash_code(self.file_block_size);
				let spaces = self
					.trunk
					.alloc(hash_code, ssize.length as u64, Flavor::Normal, true)
					.await?;

				let mut cursor = ssize.offset;
				for space in spaces {
					let len = space.size as u32;
					let sub_range = dfs_storage::keys::SliceRange::new(cursor, len);
					self.index.add_slice(&self.trunk, block, sub_range, slice_type, space).await?;
					self.local_binlog.append_add(ts, block, sub_range, slice_type, &space).await?;
					cursor += len;
				}
				Ok(())
			}
			BinlogRecord::Delete { block, range } => {
				match self.index.delete_slices(&self.trunk, block, range).await {
					Ok(_) | Err(Error::NotFound) => {}
					Err(e) => return Err(e),
				}
				self.local_binlog.append_delete(ts, block, range).await
			}
			BinlogRecord::DeleteBlock { block } => {
				match self.index.delete_block(&self.trunk, block).await {
					Ok(_) | Err(Error::NotFound) => {}
					Err(e) => return Err(e),
				}
				self.local_binlog.append_delete_block(ts, block).await
			}
			BinlogRecord::NoOp { data_version } => self.local_binlog.append_noop(ts, data_version).await,
		}
	}

	async fn write_fetch_segment(&self, fetched: &[FetchedEntry]) -> Result<()> {
		let mut text = String::new();
		for entry in fetched {
			text.push_str(&render(&entry.record));
		}
		dfs_util::fileops::append_and_sync(&self.fetch_segment_path(), text.as_bytes()).await
	}

	async fn read_fetch_segment(&self) -> Result<Vec<BinlogRecord>> {
		read_segment(&self.fetch_segment_path()).await
	}

	/// Writes the replay segment with a `version=<data_version>` header
	/// line ahead of the records, so a crash between DEDUP and REPLAY
	/// completing doesn't lose track of the padding target.
	async fn write_replay_segment(&self, target_version: i64, records: &[BinlogRecord]) -> Result<()> {
		let mut text = format!("version={}\n", target_version);
		for record in records {
			text.push_str(&render(record));
		}
		dfs_util::fileops::atomic_write(&self.replay_segment_path(), text.as_bytes()).await
	}

	async fn read_replay_segment(&self) -> Result<(i64, Vec<BinlogRecord>)> {
		let path = self.replay_segment_path();
		let text = match tokio::fs::read_to_string(&path).await {
			Ok(t) => t,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((-1, Vec::new())),
			Err(e) => return Err(e.into()),
		};

		let mut lines = text.lines();
		let header = lines.next().unwrap_or("");
		let target_version = header
			.strip_prefix("version=")
			.ok_or_else(|| Error::Protocol("malformed replay segment header".into()))?
			.parse::<i64>()
			.map_err(|_| Error::Protocol("bad replay segment version".into()))?;

		let records = lines.filter(|l| !l.is_empty()).map(parse_line).collect::<Result<Vec<_>>>()?;
		Ok((target_version, records))
	}
}

/// Background `Worker` that drives one data group's `DataRecovery` one
/// stage transition at a time, rather than blocking the whole task on
/// `DataRecovery::run` until the group reaches `ACTIVE`. Idles once the
/// group is a member's own responsibility no more (`NotFound`) or has
/// reached `ACTIVE`, waking again on `poll_interval`.
pub struct RecoveryWorker {
	recovery: Arc<DataRecovery>,
	group: Arc<ClusterDataGroupInfo>,
	source: Arc<dyn MasterBinlogSource>,
	poll_interval: Duration,
}

impl RecoveryWorker {
	pub fn new(
		recovery: Arc<DataRecovery>,
		group: Arc<ClusterDataGroupInfo>,
		source: Arc<dyn MasterBinlogSource>,
		poll_interval: Duration,
	) -> Self {
		Self {
			recovery,
			group,
			source,
			poll_interval,
		}
	}
}

#[async_trait]
impl Worker for RecoveryWorker {
	fn name(&self) -> String {
		format!("recovery worker for group {}", self.recovery.group_id)
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> std::result::Result<WorkerStatus, Error> {
		match self.recovery.step(&self.group, self.source.as_ref()).await {
			Ok(StepOutcome::Continue) => Ok(WorkerStatus::Busy),
			Ok(StepOutcome::Active) => Ok(WorkerStatus::Idle),
			Err(Error::NotFound) | Err(Error::Busy) => Ok(WorkerStatus::Idle),
			Err(e) => {
				warn!(group_id = self.recovery.group_id, error = %e, "recovery step failed, will retry");
				Ok(WorkerStatus::Idle)
			}
		}
	}

	async fn wait_for_work(&mut self, must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		let mut must_exit = must_exit.clone();
		tokio::select! {
			_ = tokio::time::sleep(self.poll_interval) => WorkerStatus::Busy,
			_ = must_exit.wait_for(|v| *v) => WorkerStatus::Done,
		}
	}
}

fn render(record: &BinlogRecord) -> String {
	let ts = dfs_util::time::now_msec();
	match record {
		BinlogRecord::Add {
			block,
			ssize,
			slice_type,
			space,
		} => dfs_storage::binlog::format_add(ts, *block, *ssize, *slice_type, space),
		BinlogRecord::Delete { block, range } => dfs_storage::binlog::format_delete(ts, *block, *range),
		BinlogRecord::DeleteBlock { block } => dfs_storage::binlog::format_delete_block(ts, *block),
		BinlogRecord::NoOp { data_version } => dfs_storage::binlog::format_noop(ts, *data_version),
	}
}

async fn read_segment(path: &std::path::Path) -> Result<Vec<BinlogRecord>> {
	let text = match tokio::fs::read_to_string(path).await {
		Ok(t) => t,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
		Err(e) => return Err(e.into()),
	};
	text.lines().filter(|l| !l.is_empty()).map(parse_line).collect()
}

fn advance_cursor(current: FetchCursor, fetched: &[FetchedEntry]) -> FetchCursor {
	match fetched.last() {
		None => current,
		Some(last) => {
			let last_bkey = match &last.record {
				BinlogRecord::Add { block, .. } => Some((block.oid, block.offset)),
				BinlogRecord::Delete { block, .. } => Some((block.oid, block.offset)),
				BinlogRecord::DeleteBlock { block } => Some((block.oid, block.offset)),
				BinlogRecord::NoOp { .. } => current.last_bkey,
			};
			FetchCursor {
				last_data_version: last.data_version,
				last_bkey,
			}
		}
	}
}
