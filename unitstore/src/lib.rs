//! Persistent state machine for Lobster's workflows, units and tasks.
//!
//! Backed by SQLite via `rusqlite`. See [`UnitStore`] for the full
//! operation contract.

mod error;
mod model;
mod retry;
mod schema;
mod store;

pub use error::{StoreError, StoreResult};
pub use model::{
    Category, FileInfo, TaskBatch, TaskStatus, TaskType, TaskUpdate, UnitRecord, UnitState,
    UnitUpdate, FileUpdate, WorkLeft, Workflow, WorkflowStatus,
};
pub use store::UnitStore;
