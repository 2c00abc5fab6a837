//! Domain types for the unit store.
//!
//! State enums keep the exact numeric discriminants from the specification
//! because they are persisted in SQLite and must round-trip unchanged across
//! process restarts (see [`UnitState`] and [`TaskType`]).

use serde::{Deserialize, Serialize};

/// State of a single schedulable unit. Discriminants match the persisted
/// on-disk representation; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum UnitState {
    Unassigned = 0,
    Running = 1,
    Done = 2,
    Failed = 3,
    Paused = 4,
    Merging = 7,
    Merged = 8,
    Published = 6,
}

impl UnitState {
    pub fn from_i64(v: i64) -> Option<Self> {
        Some(match v {
            0 => UnitState::Unassigned,
            1 => UnitState::Running,
            2 => UnitState::Done,
            3 => UnitState::Failed,
            4 => UnitState::Paused,
            7 => UnitState::Merging,
            8 => UnitState::Merged,
            6 => UnitState::Published,
            _ => return None,
        })
    }

    /// Only these two states may be handed out by `pop_units` (invariant 1).
    pub fn is_poppable(self) -> bool {
        matches!(self, UnitState::Unassigned | UnitState::Failed)
    }
}

/// Kind of task. Discriminants persisted; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum TaskType {
    Process = 0,
    Merge = 1,
}

/// Outcome recorded for a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum TaskStatus {
    Running = 0,
    Done = 1,
    Failed = 2,
    Merged = 3,
    Cancelled = 4,
}

/// A named resource class shared across workflows. The pseudo-category
/// `"merge"` is reserved by convention and never receives a fair-share slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub runtime_s: u32,
    /// Cap on simultaneous in-flight (non-merge) tasks in this category.
    pub tasks_max: Option<u32>,
}

/// A pipeline stage: a dataset plus the category/prerequisite/merge policy
/// that governs how its units are scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub label: String,
    pub category: String,
    pub prerequisite: Option<String>,
    /// Target cumulative byte size for a merge bucket. `<= 0` disables merging.
    pub merge_size_bytes: i64,
    /// Units bundled per task batch before taper is applied.
    pub unit_chunk_size: u64,
    pub output_filename: String,
    pub total_events: u64,
    pub total_units: u64,
}

/// Per-file metadata, either from the original dataset or propagated from an
/// upstream workflow's task outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    pub events: u64,
    pub bytes: i64,
    pub skipped: bool,
    pub lumis: Vec<(i64, i64)>,
}

/// A single schedulable (run, lumi) quantum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: i64,
    pub workflow_label: String,
    pub file_id: String,
    pub run: i64,
    pub lumi: i64,
    pub state: UnitState,
    pub task_id: Option<i64>,
    pub retry_count: u32,
    pub events_processed: u64,
}

/// A task batch handed to the caller by `pop_units`/`pop_unmerged_tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBatch {
    pub task_id: i64,
    pub workflow_label: String,
    pub files: Vec<String>,
    pub units: Vec<i64>,
    pub unique_arg: i64,
    pub merge: bool,
    /// Populated only for merge batches: the component PROCESS task ids.
    pub components: Vec<i64>,
}

/// One unit's contribution to a batch `update_units` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitUpdate {
    pub unit_id: i64,
    pub done: bool,
    pub events_processed: u64,
}

/// One file's contribution to a batch `update_units` call (skipped files).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUpdate {
    pub file_id: String,
    pub workflow_label: String,
    pub skipped: bool,
}

/// The full per-task update bundle applied atomically by `update_units`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: i64,
    pub failed: bool,
    pub exit_code: i32,
    pub host: Option<String>,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub bytes_output: i64,
    pub unit_updates: Vec<UnitUpdate>,
    pub file_updates: Vec<FileUpdate>,
}

/// Result of `work_left`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkLeft {
    pub complete: bool,
    pub units_left: u64,
    pub tasks_left_estimate: f64,
}

/// Aggregate reporter for `workflow_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub label: String,
    pub unassigned: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
    pub paused: u64,
    pub merging: u64,
    pub merged: u64,
    pub published: u64,
}

impl WorkflowStatus {
    pub fn total(&self) -> u64 {
        self.unassigned
            + self.running
            + self.done
            + self.failed
            + self.paused
            + self.merging
            + self.merged
            + self.published
    }
}
