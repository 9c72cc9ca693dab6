//! Connection abstraction. TCP framing and connection pooling are out of
//! scope for the core — they are "external collaborators via
//! their interfaces only". This module defines that interface so the
//! client and replication pipeline can be written and tested against it
//! without a real network stack.

use async_trait::async_trait;

use dfs_util::error::Result;

use crate::cluster::DataGroupId;

/// Identifies one negotiated connection's idempotency channel.
/// A connection manager hands out a new id whenever it re-establishes a
/// channel after a `ChannelInvalid` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

/// One live connection to a server, already past channel negotiation.
#[async_trait]
pub trait Connection: Send + Sync {
	fn channel_id(&self) -> ChannelId;

	/// Server-negotiated max body size; client writes are chunked to this.
	fn buffer_size(&self) -> u32;

	/// Returns the server's reported `inc_alloc` for this chunk.
	async fn slice_write(&self, req_id: u64, key: crate::protocol::FsProtoHeader, body: &[u8]) -> Result<i64>;

	async fn slice_read(
		&self,
		req_id: u64,
		key: crate::protocol::FsProtoHeader,
		request_body: &[u8],
		out: &mut [u8],
	) -> Result<usize>;
}

/// Resolves data-group membership to live connections. A real
/// implementation pools TCP connections and re-resolves the master
/// pointer from `ClusterDataGroupInfo`; this trait is the seam the
/// client and replication pipeline are written against.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
	async fn get_master_connection(&self, group: DataGroupId) -> Result<std::sync::Arc<dyn Connection>>;

	async fn get_readable_connection(&self, group: DataGroupId) -> Result<std::sync::Arc<dyn Connection>>;
}
