//! Fetch/dedup/replay catch-up state machine for a data-group replica
//! rejoining after time offline.
pub mod dedup;
pub mod recovery;
pub mod state;

pub use recovery::{DataRecovery, FetchedEntry, MasterBinlogSource, RecoveryWorker, StepOutcome};
pub use state::{FetchCursor, RecoveryStage, SysData};
