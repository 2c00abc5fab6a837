//! Persisted working-directory layout (spec §6).
//!
//! Grounded in `TaskProvider.get_taskids`/`util.taskdir` from the original
//! `source.py`: task directories are split into two path components so a
//! workflow with millions of tasks never produces a flat directory.

use std::path::{Path, PathBuf};

pub const CHECKPOINT_ID: &str = "id";
pub const CHECKPOINT_RESTARTED: &str = "RESTARTED";
pub const STATUS_FILE: &str = "status.yaml";

pub const BUCKET_RUNNING: &str = "running";
pub const BUCKET_SUCCESSFUL: &str = "successful";
pub const BUCKET_FAILED: &str = "failed";

pub fn store_path(workdir: &Path) -> PathBuf {
    workdir.join("store.db")
}

pub fn status_path(workdir: &Path) -> PathBuf {
    workdir.join(STATUS_FILE)
}

/// Splits a task id into a (prefix, suffix) directory pair.
fn id_to_dir(task_id: i64) -> PathBuf {
    let prefix = task_id / 1000;
    let suffix = task_id % 1000;
    PathBuf::from(prefix.to_string()).join(format!("{suffix:03}"))
}

pub fn task_dir(workdir: &Path, workflow_label: &str, bucket: &str, task_id: i64) -> PathBuf {
    workdir.join(workflow_label).join(bucket).join(id_to_dir(task_id))
}

pub fn running_dir(workdir: &Path, workflow_label: &str, task_id: i64) -> PathBuf {
    task_dir(workdir, workflow_label, BUCKET_RUNNING, task_id)
}

pub fn parameters_path(workdir: &Path, workflow_label: &str, task_id: i64) -> PathBuf {
    running_dir(workdir, workflow_label, task_id).join("parameters.json")
}

pub fn report_path(workdir: &Path, workflow_label: &str, bucket: &str, task_id: i64) -> PathBuf {
    task_dir(workdir, workflow_label, bucket, task_id).join("report.json")
}

/// Enumerates the task ids currently sitting in `workdir/label/bucket/*/*`.
pub fn get_task_ids(workdir: &Path, workflow_label: &str, bucket: &str) -> std::io::Result<Vec<i64>> {
    let parent = workdir.join(workflow_label).join(bucket);
    let pattern = parent.join("*").join("*");
    let mut ids = Vec::new();
    let entries = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    for entry in entries.flatten() {
        let Ok(relative) = entry.strip_prefix(&parent) else { continue };
        let mut components = relative.iter();
        let (Some(prefix_str), Some(suffix_str)) = (components.next(), components.next()) else { continue };
        let (Ok(prefix), Ok(suffix)) = (
            prefix_str.to_string_lossy().parse::<i64>(),
            suffix_str.to_string_lossy().parse::<i64>(),
        ) else {
            continue;
        };
        ids.push(prefix * 1000 + suffix);
    }
    Ok(ids)
}
