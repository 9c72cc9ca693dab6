//! Client-side slice read/write path: chunking by server
//! buffer size, idempotency and master-rebind retry.
pub mod config;
pub mod request;
pub mod stat;

pub use config::ClientConfig;
pub use request::{slice_read, slice_write, IdempotencyChannel, RetryPolicy, RetryState, WriteOutcome};
pub use stat::{cluster_stat, ClusterStatSource, GroupStat};
