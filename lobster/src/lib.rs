//! Lobster: a distributed task-provisioning controller for scientific
//! data-processing workflows.
//!
//! Lobster turns a declarative workflow graph into a stream of executor
//! task batches, tracking unit/task/file state in an embedded store and
//! provisioning new work to keep resource categories saturated without
//! overshooting their caps.
//!
//! # Modules
//!
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface
//! - [`checkpoint`] - Working-directory lock and checkpoint bookkeeping
//! - [`paths`] - Persisted working-directory layout
//! - [`facade`] - External-system trait boundaries (executor, storage, monitoring, dataset)
//! - [`task_handler`] - Per-task result classification
//! - [`merge_task_handler`] - Per-merge-task result classification
//! - [`task_provider`] - The scheduler

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod facade;
pub mod merge_task_handler;
pub mod paths;
pub mod release_summary;
pub mod task_handler;
pub mod task_provider;

pub use config::Config;
pub use release_summary::ReleaseSummary;
pub use task_provider::{TaskDescriptor, TaskProvider, TaskQueueState};
