//! Materialization records for pipeline runs.
//!
//! A materialization is the recorded outcome of one node in one run: its
//! status, an opaque output reference and descriptive metadata. Runs
//! themselves are recorded as [`RunRecord`]s so that statuses can be listed
//! after the orchestrating process exits.

pub mod fs;
pub mod memory;
pub mod store;
pub mod types;

pub use fs::FsMaterializationStore;
pub use memory::MemoryMaterializationStore;
pub use store::{MaterializationStore, SharedMaterializationStore, StoreError, StoreResult};
pub use types::{
    Materialization, MaterializationRecord, MetadataMap, MetadataValue, NodeFailure, NodeName,
    NodeRunRecord, NodeStatus, OutputRef, RunId, RunRecord, RunStatus, timestamp_now,
};
