//! Slice binlog: an append-only, crash-durable log of index
//! mutations. Every `add`/`delete` must be written and fsynced before the
//! caller is told it succeeded; on restart the log is replayed to rebuild
//! the in-memory `ObIndex`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{error, info};

use dfs_util::background::worker::{Worker, WorkerStatus};
use dfs_util::error::{Error, Result};

use crate::index::{ObIndex, SliceType};
use crate::keys::{BlockKey, SliceRange};
use crate::trunk::{IdInfo, TrunkAllocator, TrunkSpaceInfo};

/// One parsed binlog line. Public because recovery's `fetch/`/`replay/`
/// segments are staged in this same text format.
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogRecord {
	Add {
		block: BlockKey,
		ssize: SliceRange,
		slice_type: SliceType,
		space: TrunkSpaceInfo,
	},
	Delete {
		block: BlockKey,
		range: SliceRange,
	},
	DeleteBlock {
		block: BlockKey,
	},
	/// Padding record emitted after REPLAY to carry the replica's newly
	/// applied `data_version` forward with no index effect.
	NoOp {
		data_version: i64,
	},
}

type Record = BinlogRecord;

fn slice_type_code(t: SliceType) -> u8 {
	match t {
		SliceType::File => 0,
		SliceType::Cache => 1,
	}
}

fn slice_type_from_code(c: u8) -> Result<SliceType> {
	match c {
		0 => Ok(SliceType::File),
		1 => Ok(SliceType::Cache),
		_ => Err(Error::Protocol("unknown slice type code in binlog record".into())),
	}
}

/// Renders one `add` record: `<ts> a <type> <oid> <boff> <soff> <slen> <spath> <tid> <sub> <spoff> <spsize>`.
pub fn format_add(ts: u64, block: BlockKey, ssize: SliceRange, slice_type: SliceType, space: &TrunkSpaceInfo) -> String {
	format!(
		"{} a {} {} {} {} {} {} {} {} {} {}\n",
		ts,
		slice_type_code(slice_type),
		block.oid,
		block.offset,
		ssize.offset,
		ssize.length,
		space.store_path_index,
		space.id_info.id,
		space.id_info.subdir,
		space.offset,
		space.size,
	)
}

/// `<ts> d <oid> <boff> <soff> <slen>`.
pub fn format_delete(ts: u64, block: BlockKey, range: SliceRange) -> String {
	format!("{} d {} {} {} {}\n", ts, block.oid, block.offset, range.offset, range.length)
}

/// `<ts> D <oid> <boff>`.
pub fn format_delete_block(ts: u64, block: BlockKey) -> String {
	format!("{} D {} {}\n", ts, block.oid, block.offset)
}

/// `<ts> n <data_version>`.
pub fn format_noop(ts: u64, data_version: i64) -> String {
	format!("{} n {}\n", ts, data_version)
}

pub fn parse_line(line: &str) -> Result<Record> {
	let mut fields = line.split_whitespace();
	let _ts: u64 = fields
		.next()
		.ok_or_else(|| Error::Protocol("empty binlog line".into()))?
		.parse()
		.map_err(|_| Error::Protocol("bad timestamp field".into()))?;
	let kind = fields.next().ok_or_else(|| Error::Protocol("missing record kind".into()))?;

	let parse_u64 = |s: Option<&str>| -> Result<u64> {
		s.ok_or_else(|| Error::Protocol("missing field".into()))?
			.parse()
			.map_err(|_| Error::Protocol("bad integer field".into()))
	};
	let parse_u32 = |s: Option<&str>| -> Result<u32> {
		s.ok_or_else(|| Error::Protocol("missing field".into()))?
			.parse()
			.map_err(|_| Error::Protocol("bad integer field".into()))
	};

	match kind {
		"a" => {
			let slice_type = slice_type_from_code(parse_u64(fields.next())? as u8)?;
			let oid = parse_u64(fields.next())?;
			let boff = parse_u64(fields.next())?;
			let soff = parse_u32(fields.next())?;
			let slen = parse_u32(fields.next())?;
			let spath = parse_u64(fields.next())? as usize;
			let tid = parse_u64(fields.next())?;
			let sub = parse_u32(fields.next())?;
			let spoff = parse_u64(fields.next())?;
			let spsize = parse_u64(fields.next())?;
			Ok(Record::Add {
				block: BlockKey::new(oid, boff),
				ssize: SliceRange::new(soff, slen),
				slice_type,
				space: TrunkSpaceInfo {
					store_path_index: spath,
					id_info: IdInfo { id: tid, subdir: sub },
					offset: spoff,
					size: spsize,
				},
			})
		}
		"d" => {
			let oid = parse_u64(fields.next())?;
			let boff = parse_u64(fields.next())?;
			let soff = parse_u32(fields.next())?;
			let slen = parse_u32(fields.next())?;
			Ok(Record::Delete {
				block: BlockKey::new(oid, boff),
				range: SliceRange::new(soff, slen),
			})
		}
		"D" => {
			let oid = parse_u64(fields.next())?;
			let boff = parse_u64(fields.next())?;
			Ok(Record::DeleteBlock {
				block: BlockKey::new(oid, boff),
			})
		}
		"n" => {
			let data_version: i64 = fields
				.next()
				.ok_or_else(|| Error::Protocol("missing field".into()))?
				.parse()
				.map_err(|_| Error::Protocol("bad data_version field".into()))?;
			Ok(Record::NoOp { data_version })
		}
		other => Err(Error::Protocol(format!("unknown binlog record kind '{}'", other).into())),
	}
}

/// Append-only log file for one storage path. Appends are serialized by
/// `lock` so two concurrent writers can't interleave a partial line.
pub struct SliceBinlog {
	path: PathBuf,
	lock: Mutex<()>,
}

impl SliceBinlog {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			lock: Mutex::new(()),
		}
	}

	pub async fn append_add(
		&self,
		ts: u64,
		block: BlockKey,
		ssize: SliceRange,
		slice_type: SliceType,
		space: &TrunkSpaceInfo,
	) -> Result<()> {
		let _guard = self.lock.lock().await;
		let line = format_add(ts, block, ssize, slice_type, space);
		self.write_line(&line).await
	}

	pub async fn append_delete(&self, ts: u64, block: BlockKey, range: SliceRange) -> Result<()> {
		let _guard = self.lock.lock().await;
		let line = format_delete(ts, block, range);
		self.write_line(&line).await
	}

	pub async fn append_delete_block(&self, ts: u64, block: BlockKey) -> Result<()> {
		let _guard = self.lock.lock().await;
		let line = format_delete_block(ts, block);
		self.write_line(&line).await
	}

	pub async fn append_noop(&self, ts: u64, data_version: i64) -> Result<()> {
		let _guard = self.lock.lock().await;
		let line = format_noop(ts, data_version);
		self.write_line(&line).await
	}

	async fn write_line(&self, line: &str) -> Result<()> {
		dfs_util::fileops::append_and_sync(&self.path, line.as_bytes())
			.await
			.map_err(|e| {
				error!(path = %self.path.display(), error = %e, "binlog append/fsync failed");
				e
			})
	}

	/// Replays every record in the log into `index`, then rebuilds trunk
	/// usage for every path in `trunks_by_path` from the final surviving
	/// state (see `ObIndex::rebuild_trunk_usage`). A missing log file is
	/// treated as an empty one, since a brand-new storage path has not
	/// written its first record yet.
	pub async fn load(path: &Path, index: &ObIndex, trunks_by_path: &[Arc<TrunkAllocator>]) -> Result<()> {
		let file = match fs::File::open(path).await {
			Ok(f) => f,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				info!(path = %path.display(), "no binlog to replay, starting empty");
				return Ok(());
			}
			Err(e) => return Err(e.into()),
		};
		let mut lines = BufReader::new(file).lines();
		let mut replayed = 0u64;

		while let Some(line) = lines.next_line().await? {
			if line.is_empty() {
				continue;
			}
			match parse_line(&line)? {
				Record::Add {
					block,
					ssize,
					slice_type,
					space,
				} => {
					index.add_slice_by_binlog(block, ssize, slice_type, space).await?;
				}
				Record::Delete { block, range } => {
					index.delete_slices_by_binlog(block, range).await?;
				}
				Record::DeleteBlock { block } => {
					index.delete_block_by_binlog(block).await?;
				}
				Record::NoOp { .. } => {}
			}
			replayed += 1;
		}

		info!(path = %path.display(), replayed, "binlog replay complete");
		index.rebuild_trunk_usage(trunks_by_path).await
	}
}

struct PendingAppend {
	line: String,
	done: oneshot::Sender<Result<()>>,
}

/// Producer side of the queued binlog writer: callers submit a
/// pre-rendered line and await the worker's fsync result instead of
/// taking the write lock themselves.
#[derive(Clone)]
pub struct BinlogWriterHandle {
	tx: mpsc::UnboundedSender<PendingAppend>,
}

impl BinlogWriterHandle {
	async fn submit(&self, line: String) -> Result<()> {
		let (done, done_rx) = oneshot::channel();
		self.tx
			.send(PendingAppend { line, done })
			.map_err(|_| Error::Cancelled)?;
		done_rx.await.map_err(|_| Error::Cancelled)?
	}

	pub async fn append_add(
		&self,
		ts: u64,
		block: BlockKey,
		ssize: SliceRange,
		slice_type: SliceType,
		space: &TrunkSpaceInfo,
	) -> Result<()> {
		self.submit(format_add(ts, block, ssize, slice_type, space)).await
	}

	pub async fn append_delete(&self, ts: u64, block: BlockKey, range: SliceRange) -> Result<()> {
		self.submit(format_delete(ts, block, range)).await
	}

	pub async fn append_delete_block(&self, ts: u64, block: BlockKey) -> Result<()> {
		self.submit(format_delete_block(ts, block)).await
	}
}

/// Background `Worker` that batches concurrently-submitted appends into
/// one write + fsync, amortizing fsync cost across callers instead of
/// paying for one fsync per append. Any append queued while a batch is
/// being flushed joins the next batch rather than blocking on today's.
pub struct BinlogWriter {
	path: PathBuf,
	rx: mpsc::UnboundedReceiver<PendingAppend>,
	pending: Vec<PendingAppend>,
}

impl BinlogWriter {
	pub fn new(path: impl Into<PathBuf>) -> (Self, BinlogWriterHandle) {
		let (tx, rx) = mpsc::unbounded_channel();
		(
			Self {
				path: path.into(),
				rx,
				pending: Vec::new(),
			},
			BinlogWriterHandle { tx },
		)
	}
}

#[async_trait]
impl Worker for BinlogWriter {
	fn name(&self) -> String {
		"binlog writer".to_string()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> std::result::Result<WorkerStatus, Error> {
		if self.pending.is_empty() {
			return Ok(WorkerStatus::Idle);
		}
		while let Ok(p) = self.rx.try_recv() {
			self.pending.push(p);
		}
		let batch = std::mem::take(&mut self.pending);

		let mut buf = String::new();
		for p in &batch {
			buf.push_str(&p.line);
		}
		let write_result = dfs_util::fileops::append_and_sync(&self.path, buf.as_bytes()).await;
		if let Err(e) = &write_result {
			error!(
				path = %self.path.display(),
				error = %e,
				batch_len = batch.len(),
				"binlog batch fsync failed"
			);
		}

		for p in batch {
			let result = match &write_result {
				Ok(()) => Ok(()),
				Err(e) => Err(Error::message(e.to_string())),
			};
			let _ = p.done.send(result);
		}

		Ok(WorkerStatus::Busy)
	}

	async fn wait_for_work(&mut self, must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		let mut must_exit = must_exit.clone();
		tokio::select! {
			incoming = self.rx.recv() => match incoming {
				Some(p) => {
					self.pending.push(p);
					WorkerStatus::Busy
				}
				None => WorkerStatus::Done,
			},
			_ = must_exit.wait_for(|v| *v) => WorkerStatus::Done,
		}
	}
}
