//! SQLite-backed persistence: record store, checkpoint store, run ledger.

pub mod checkpoints;
pub mod run_ledger;
pub mod store;

pub use checkpoints::CheckpointStore;
pub use run_ledger::RunLedger;
pub use store::{DataQuery, NormalizedRow, RecordStore, SortBy, UpsertOutcome};
