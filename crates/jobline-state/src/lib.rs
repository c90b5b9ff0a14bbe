//! Jobline-State: run ledger persistence
//!
//! This crate stores the record of every job run: its identity, status,
//! summary, and the ordered stream of lifecycle events the engine emits.
//!
//! ## Key Components
//!
//! - `RunLedger`: backend-agnostic async trait
//! - `MemoryRunLedger`: in-memory fake used by tests
//! - `FsRunLedger`: JSON files under a state directory, used by the CLI

mod error;
pub mod fakes;
pub mod fs_ledger;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_ledger::FsRunLedger;
pub use storage_traits::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary,
    StorageResult,
};
