//! Slice write/read request path: chunking by the server's
//! negotiated buffer size, idempotency `req_id` issuance and the
//! master-rebind retry state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use dfs_rpc::cluster::DataGroupId;
use dfs_rpc::conn::{ChannelId, Connection, ConnectionManager};
use dfs_rpc::protocol::{Command, FsProtoHeader};
use dfs_storage::keys::{BlockKey, SliceRange};
use dfs_util::error::{Error, Result};

/// A client↔server idempotency session: a sequence-numbered `req_id`
/// source plus the receipt ring the server uses to deduplicate retried
/// requests ("idempotency channel").
pub struct IdempotencyChannel {
	channel_id: ChannelId,
	next_req_id: AtomicU64,
	receipts: Mutex<std::collections::VecDeque<u64>>,
	ring_capacity: usize,
}

impl IdempotencyChannel {
	pub fn new(channel_id: ChannelId, ring_capacity: usize) -> Self {
		Self {
			channel_id,
			next_req_id: AtomicU64::new(1),
			receipts: Mutex::new(std::collections::VecDeque::with_capacity(ring_capacity)),
			ring_capacity,
		}
	}

	pub fn channel_id(&self) -> ChannelId {
		self.channel_id
	}

	pub fn next_req_id(&self) -> u64 {
		self.next_req_id.fetch_add(1, Ordering::Relaxed)
	}

	async fn push_receipt(&self, req_id: u64) {
		let mut ring = self.receipts.lock().await;
		if ring.len() >= self.ring_capacity {
			ring.pop_front();
		}
		ring.push_back(req_id);
	}

	pub async fn receipts(&self) -> Vec<u64> {
		self.receipts.lock().await.iter().copied().collect()
	}
}

/// Bounded exponential back-off for the network-retry interval policy
/// ("apply the net-retry interval policy").
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub base_backoff: Duration,
	pub max_backoff: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			base_backoff: Duration::from_millis(100),
			max_backoff: Duration::from_secs(5),
		}
	}
}

impl RetryPolicy {
	pub fn backoff_for(&self, attempt: u32) -> Duration {
		let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
		self.base_backoff.saturating_mul(factor).min(self.max_backoff)
	}
}

/// The per-chunk retry state, modeled explicitly rather than left
/// implicit in a loop so the channel-changed-restart-chunk rule is
/// obvious and testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
	Sending,
	AwaitingAck,
	Rebinding,
	GivingUp,
}

fn is_retriable(e: &Error) -> bool {
	matches!(e, Error::ChannelInvalid | Error::Retriable(_) | Error::Again | Error::Cancelled)
}

enum ChunkOutcome {
	Written { inc_alloc: i64 },
	ReboundSameChunk,
}

fn encode_write_body(block: BlockKey, range: SliceRange, data: &[u8]) -> Vec<u8> {
	let mut buf = BytesMut::with_capacity(24 + data.len());
	buf.put_u64(block.oid);
	buf.put_u64(block.offset);
	buf.put_u32(range.offset);
	buf.put_u32(range.length);
	buf.extend_from_slice(data);
	buf.to_vec()
}

fn encode_read_request(block: BlockKey, range: SliceRange) -> Vec<u8> {
	let mut buf = BytesMut::with_capacity(24);
	buf.put_u64(block.oid);
	buf.put_u64(block.offset);
	buf.put_u32(range.offset);
	buf.put_u32(range.length);
	buf.to_vec()
}

async fn write_chunk_with_retry(
	conn_mgr: &dyn ConnectionManager,
	group: DataGroupId,
	idempotency: Option<&IdempotencyChannel>,
	retry: &RetryPolicy,
	conn: &mut Arc<dyn Connection>,
	block: BlockKey,
	range: SliceRange,
	data: &[u8],
) -> Result<ChunkOutcome> {
	let started_channel = conn.channel_id();
	let mut attempt = 0u32;
	let mut state = RetryState::Sending;

	loop {
		state = RetryState::Sending;
		let req_id = idempotency.map(|c| c.next_req_id()).unwrap_or(0);
		let body = encode_write_body(block, range, data);
		let header = FsProtoHeader::request(Command::SliceWrite, req_id, body.len() as u32);

		state = RetryState::AwaitingAck;
		debug!(?state, req_id, "awaiting slice_write ack");
		let result = conn.slice_write(req_id, header, &body).await;

		match result {
			Ok(inc_alloc) => {
				if let Some(c) = idempotency {
					c.push_receipt(req_id).await;
				}
				return Ok(ChunkOutcome::Written { inc_alloc });
			}
			Err(e) if is_retriable(&e) => {
				state = RetryState::Rebinding;
				if let (Some(c), Error::ChannelInvalid) = (idempotency, &e) {
					debug!(channel = ?c.channel_id(), "channel invalid, will reconnect");
				}

				if attempt >= retry.max_attempts {
					state = RetryState::GivingUp;
					warn!(?state, attempts = attempt, "giving up on chunk after retries");
					return Err(e);
				}

				tokio::time::sleep(retry.backoff_for(attempt)).await;
				attempt += 1;

				*conn = conn_mgr.get_master_connection(group).await?;
				if conn.channel_id() != started_channel {
					// Master changed mid-chunk: the caller must restart this
					// exact chunk from scratch (here, scenario S6).
					return Ok(ChunkOutcome::ReboundSameChunk);
				}
			}
			Err(e) => return Err(e),
		}
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOutcome {
	pub write_bytes: u32,
	pub inc_alloc: i64,
}

/// `fs_client_slice_write`: chunks `data` to the master's
/// negotiated buffer size and writes each chunk with retry.
pub async fn slice_write(
	conn_mgr: &dyn ConnectionManager,
	group: DataGroupId,
	idempotency: Option<&IdempotencyChannel>,
	retry: &RetryPolicy,
	block: BlockKey,
	range: SliceRange,
	data: &[u8],
) -> Result<WriteOutcome> {
	if data.len() != range.length as usize {
		return Err(Error::Invalid("data length does not match slice range".into()));
	}

	let mut conn = conn_mgr.get_master_connection(group).await?;
	let mut outcome = WriteOutcome::default();

	while outcome.write_bytes < range.length {
		let remaining = range.length - outcome.write_bytes;
		let chunk_len = remaining.min(conn.buffer_size());
		let chunk_range = SliceRange::new(range.offset + outcome.write_bytes, chunk_len);
		let chunk_data = &data[outcome.write_bytes as usize..(outcome.write_bytes + chunk_len) as usize];

		match write_chunk_with_retry(conn_mgr, group, idempotency, retry, &mut conn, block, chunk_range, chunk_data).await? {
			ChunkOutcome::Written { inc_alloc } => {
				outcome.write_bytes += chunk_len;
				outcome.inc_alloc += inc_alloc;
			}
			ChunkOutcome::ReboundSameChunk => continue,
		}
	}

	Ok(outcome)
}

enum ReadChunkOutcome {
	Read { bytes: usize },
	ReboundSameChunk,
}

async fn read_chunk_with_retry(
	conn_mgr: &dyn ConnectionManager,
	group: DataGroupId,
	retry: &RetryPolicy,
	conn: &mut Arc<dyn Connection>,
	block: BlockKey,
	range: SliceRange,
	out: &mut [u8],
) -> Result<ReadChunkOutcome> {
	let started_channel = conn.channel_id();
	let mut attempt = 0u32;

	loop {
		let req_id = 0; // reads carry no idempotency token
		let body = encode_read_request(block, range);
		let header = FsProtoHeader::request(Command::SliceRead, req_id, body.len() as u32);

		match conn.slice_read(req_id, header, &body, out).await {
			Ok(bytes) => return Ok(ReadChunkOutcome::Read { bytes }),
			Err(e) if is_retriable(&e) => {
				if attempt >= retry.max_attempts {
					warn!(attempts = attempt, "giving up on read chunk after retries");
					return Err(e);
				}
				tokio::time::sleep(retry.backoff_for(attempt)).await;
				attempt += 1;

				*conn = conn_mgr.get_readable_connection(group).await?;
				if conn.channel_id() != started_channel {
					return Ok(ReadChunkOutcome::ReboundSameChunk);
				}
			}
			Err(e) => return Err(e),
		}
	}
}

/// `fs_client_slice_read`: same chunking discipline as
/// `slice_write` against a readable (not necessarily master) connection,
/// with no idempotency token. Returns `NoData` if nothing was read.
pub async fn slice_read(
	conn_mgr: &dyn ConnectionManager,
	group: DataGroupId,
	retry: &RetryPolicy,
	block: BlockKey,
	range: SliceRange,
	out: &mut [u8],
) -> Result<usize> {
	if out.len() != range.length as usize {
		return Err(Error::Invalid("output buffer does not match slice range".into()));
	}

	let mut conn = conn_mgr.get_readable_connection(group).await?;
	let mut read_bytes: u32 = 0;

	while read_bytes < range.length {
		let remaining = range.length - read_bytes;
		let chunk_len = remaining.min(conn.buffer_size());
		let chunk_range = SliceRange::new(range.offset + read_bytes, chunk_len);
		let out_slice = &mut out[read_bytes as usize..(read_bytes + chunk_len) as usize];

		match read_chunk_with_retry(conn_mgr, group, retry, &mut conn, block, chunk_range, out_slice).await? {
			ReadChunkOutcome::Read { bytes } => {
				if bytes == 0 {
					break;
				}
				read_bytes += bytes as u32;
			}
			ReadChunkOutcome::ReboundSameChunk => continue,
		}
	}

	if read_bytes == 0 {
		Err(Error::NoData)
	} else {
		Ok(read_bytes as usize)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use std::sync::atomic::AtomicUsize;

	struct FakeConnection {
		channel: ChannelId,
		buffer_size: u32,
		write_calls: AtomicUsize,
		fail_first_n_writes: usize,
	}

	#[async_trait]
	impl Connection for FakeConnection {
		fn channel_id(&self) -> ChannelId {
			self.channel
		}

		fn buffer_size(&self) -> u32 {
			self.buffer_size
		}

		async fn slice_write(&self, _req_id: u64, _key: FsProtoHeader, body: &[u8]) -> Result<i64> {
			let call = self.write_calls.fetch_add(1, Ordering::SeqCst);
			if call < self.fail_first_n_writes {
				return Err(Error::ChannelInvalid);
			}
			Ok((body.len() - 24) as i64)
		}

		async fn slice_read(&self, _req_id: u64, _key: FsProtoHeader, _body: &[u8], out: &mut [u8]) -> Result<usize> {
			let n = out.len();
			out.fill(0xAB);
			Ok(n)
		}
	}

	struct FakeConnManager {
		connections: Mutex<Vec<Arc<FakeConnection>>>,
	}

	#[async_trait]
	impl ConnectionManager for FakeConnManager {
		async fn get_master_connection(&self, _group: DataGroupId) -> Result<Arc<dyn Connection>> {
			let mut conns = self.connections.lock().await;
			if conns.len() > 1 {
				Ok(conns.remove(0))
			} else {
				Ok(conns[0].clone())
			}
		}

		async fn get_readable_connection(&self, group: DataGroupId) -> Result<Arc<dyn Connection>> {
			self.get_master_connection(group).await
		}
	}

	fn block() -> BlockKey {
		BlockKey::new(1, 0)
	}

	#[tokio::test]
	async fn single_chunk_write_succeeds() {
		let conn = Arc::new(FakeConnection {
			channel: ChannelId(1),
			buffer_size: 4096,
			write_calls: AtomicUsize::new(0),
			fail_first_n_writes: 0,
		});
		let mgr = FakeConnManager {
			connections: Mutex::new(vec![conn]),
		};
		let retry = RetryPolicy::default();
		let data = vec![7u8; 1024];
		let outcome = slice_write(&mgr, 1, None, &retry, block(), SliceRange::new(0, 1024), &data)
			.await
			.unwrap();
		assert_eq!(outcome.write_bytes, 1024);
		assert_eq!(outcome.inc_alloc, 1024);
	}

	#[tokio::test]
	async fn write_chunks_at_buffer_size_boundary() {
		let conn = Arc::new(FakeConnection {
			channel: ChannelId(1),
			buffer_size: 512,
			write_calls: AtomicUsize::new(0),
			fail_first_n_writes: 0,
		});
		let mgr = FakeConnManager {
			connections: Mutex::new(vec![conn.clone()]),
		};
		let retry = RetryPolicy::default();
		let data = vec![1u8; 1200];
		let outcome = slice_write(&mgr, 1, None, &retry, block(), SliceRange::new(0, 1200), &data)
			.await
			.unwrap();
		assert_eq!(outcome.write_bytes, 1200);
		assert_eq!(conn.write_calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn master_change_mid_write_retries_same_chunk_from_scratch_s6() {
		let old_conn = Arc::new(FakeConnection {
			channel: ChannelId(1),
			buffer_size: 4096,
			write_calls: AtomicUsize::new(0),
			fail_first_n_writes: 1,
		});
		let new_conn = Arc::new(FakeConnection {
			channel: ChannelId(2),
			buffer_size: 4096,
			write_calls: AtomicUsize::new(0),
			fail_first_n_writes: 0,
		});
		let mgr = FakeConnManager {
			connections: Mutex::new(vec![old_conn.clone(), new_conn.clone()]),
		};
		let retry = RetryPolicy {
			max_attempts: 3,
			base_backoff: Duration::from_millis(1),
			max_backoff: Duration::from_millis(5),
		};
		let data = vec![9u8; 256];
		let outcome = slice_write(&mgr, 1, None, &retry, block(), SliceRange::new(0, 256), &data)
			.await
			.unwrap();

		assert_eq!(outcome.write_bytes, 256);
		// the failing old connection is never retried; the new one gets
		// exactly one call with the full, un-truncated chunk
		assert_eq!(old_conn.write_calls.load(Ordering::SeqCst), 1);
		assert_eq!(new_conn.write_calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn read_returns_no_data_when_nothing_available() {
		struct EmptyConn {
			channel: ChannelId,
		}
		#[async_trait]
		impl Connection for EmptyConn {
			fn channel_id(&self) -> ChannelId {
				self.channel
			}
			fn buffer_size(&self) -> u32 {
				4096
			}
			async fn slice_write(&self, _req_id: u64, _key: FsProtoHeader, _body: &[u8]) -> Result<i64> {
				unreachable!()
			}
			async fn slice_read(&self, _req_id: u64, _key: FsProtoHeader, _body: &[u8], _out: &mut [u8]) -> Result<usize> {
				Ok(0)
			}
		}

		struct EmptyMgr;
		#[async_trait]
		impl ConnectionManager for EmptyMgr {
			async fn get_master_connection(&self, _group: DataGroupId) -> Result<Arc<dyn Connection>> {
				Ok(Arc::new(EmptyConn { channel: ChannelId(1) }))
			}
			async fn get_readable_connection(&self, _group: DataGroupId) -> Result<Arc<dyn Connection>> {
				Ok(Arc::new(EmptyConn { channel: ChannelId(1) }))
			}
		}

		let mgr = EmptyMgr;
		let retry = RetryPolicy::default();
		let mut out = vec![0u8; 128];
		let res = slice_read(&mgr, 1, &retry, block(), SliceRange::new(0, 128), &mut out).await;
		assert!(matches!(res, Err(Error::NoData)));
	}

	#[tokio::test]
	async fn idempotency_channel_assigns_increasing_req_ids() {
		let chan = IdempotencyChannel::new(ChannelId(1), 8);
		let a = chan.next_req_id();
		let b = chan.next_req_id();
		assert!(b > a);
	}
}
