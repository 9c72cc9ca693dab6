//! Master-side replication fan-out: per-slave lane queues, refcounted
//! RPC entries and the origin-task ack countdown.

pub mod pipeline;
