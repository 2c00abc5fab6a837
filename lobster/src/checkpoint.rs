//! Working-directory lock and checkpoint bookkeeping (spec §5, §6).
//!
//! Grounded in `TaskProvider.__init__`'s checkpoint dance in the original
//! `source.py`: a process-exclusive working directory, an opaque task-group
//! id created once and reused across restarts, and a `RESTARTED` marker
//! stamped every time the process re-enters through the recovery path.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use eyre::{Context, Result};
use fs2::FileExt;
use uuid::Uuid;

use crate::paths::{CHECKPOINT_ID, CHECKPOINT_RESTARTED};

/// Holds the exclusive lock on `workdir` for the life of the process (spec
/// §5: "the working directory is process-exclusive").
pub struct WorkdirLock {
    _file: fs::File,
}

impl WorkdirLock {
    pub fn acquire(workdir: &Path) -> Result<Self> {
        fs::create_dir_all(workdir).context("failed to create working directory")?;
        let lock_path = workdir.join(".lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .context("failed to open working-directory lock file")?;
        file.try_lock_exclusive()
            .context("working directory is already owned by another process")?;
        Ok(Self { _file: file })
    }
}

fn checkpoint_path(workdir: &Path, name: &str) -> PathBuf {
    workdir.join(".checkpoints").join(name)
}

pub fn read_checkpoint(workdir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(checkpoint_path(workdir, name))
        .ok()
        .map(|s| s.trim().to_string())
}

pub fn write_checkpoint(workdir: &Path, name: &str, value: &str) -> Result<()> {
    let path = checkpoint_path(workdir, name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("failed to create checkpoint directory")?;
    }
    let mut file = fs::File::create(&path).context("failed to create checkpoint file")?;
    write!(file, "{value}").context("failed to write checkpoint")?;
    Ok(())
}

/// Resolved checkpoint state for this run.
pub struct Checkpoint {
    /// Opaque id of the form `lobster_<label>_<hex16>` (spec §6).
    pub task_group_id: String,
    /// `true` if this run created the checkpoint; `false` if it recovered
    /// one from a previous run (the `RESTARTED` marker was just stamped).
    pub is_fresh: bool,
}

impl Checkpoint {
    pub fn load_or_create(workdir: &Path, label: &str) -> Result<Self> {
        if let Some(task_group_id) = read_checkpoint(workdir, CHECKPOINT_ID) {
            write_checkpoint(workdir, CHECKPOINT_RESTARTED, &Utc::now().to_rfc3339())?;
            Ok(Self { task_group_id, is_fresh: false })
        } else {
            let suffix = &Uuid::new_v4().simple().to_string()[..16];
            let task_group_id = format!("lobster_{label}_{suffix}");
            write_checkpoint(workdir, CHECKPOINT_ID, &task_group_id)?;
            Ok(Self { task_group_id, is_fresh: true })
        }
    }
}
