//! The unit store: the single source of truth for workflows, units and tasks.
//!
//! Backed by SQLite (`rusqlite`, bundled). All mutating operations run
//! inside a transaction so "commits all effects or none" is enforced by the
//! database rather than hand-rolled bookkeeping (spec §4.1). The store is
//! owned by a single controller thread (spec §5); nothing here is `Sync`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::model::{
    Category, FileInfo, TaskBatch, TaskUpdate, UnitState, Workflow, WorkflowStatus, WorkLeft,
};
use crate::retry::with_retry;
use crate::schema;

pub struct UnitStore {
    conn: Connection,
    retry_cap: u32,
}

impl UnitStore {
    /// Open (creating if absent) the SQLite database at `path`.
    pub fn open(path: &Path, retry_cap: u32) -> StoreResult<Self> {
        debug!(path = %path.display(), "opening unit store");
        let conn =
            Connection::open(path).map_err(|e| StoreError::from_sqlite("open", e))?;
        schema::create_tables(&conn)?;
        Ok(UnitStore { conn, retry_cap })
    }

    /// In-memory store, for tests.
    pub fn open_in_memory(retry_cap: u32) -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::from_sqlite("open", e))?;
        schema::create_tables(&conn)?;
        Ok(UnitStore { conn, retry_cap })
    }

    pub fn register_category(&mut self, category: &Category) -> StoreResult<()> {
        with_retry("register_category", || {
            self.conn.execute(
                "INSERT INTO categories(name, cores, memory_mb, runtime_s, tasks_max)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    cores = excluded.cores,
                    memory_mb = excluded.memory_mb,
                    runtime_s = excluded.runtime_s,
                    tasks_max = excluded.tasks_max",
                params![
                    category.name,
                    category.cores,
                    category.memory_mb,
                    category.runtime_s,
                    category.tasks_max,
                ],
            )?;
            Ok(())
        })
    }

    /// Idempotent per workflow label: a second call with identical topology
    /// no-ops; a second call with a different topology is an error.
    pub fn register_dataset(&mut self, workflow: &Workflow, files: &[FileInfo]) -> StoreResult<()> {
        let outcome = with_retry("register_dataset", || {
            let tx = self.conn.transaction()?;
            let existing: Option<(String, Option<String>, i64, i64, String, i64, i64)> = tx
                .query_row(
                    "SELECT category, prerequisite, merge_size_bytes, unit_chunk_size,
                            output_filename, total_events, total_units
                     FROM workflows WHERE label = ?1",
                    params![workflow.label],
                    |r| {
                        Ok((
                            r.get(0)?,
                            r.get(1)?,
                            r.get(2)?,
                            r.get(3)?,
                            r.get(4)?,
                            r.get(5)?,
                            r.get(6)?,
                        ))
                    },
                )
                .optional()?;

            if let Some((category, prerequisite, merge_size, chunk_size, output, events, units)) =
                existing
            {
                let matches = category == workflow.category
                    && prerequisite == workflow.prerequisite
                    && merge_size == workflow.merge_size_bytes
                    && chunk_size as u64 == workflow.unit_chunk_size
                    && output == workflow.output_filename
                    && events as u64 == workflow.total_events
                    && units as u64 == workflow.total_units;
                tx.commit()?;
                return Ok(matches);
            }

            tx.execute(
                "INSERT INTO workflows(label, category, prerequisite, merge_size_bytes,
                    unit_chunk_size, output_filename, total_events, total_units)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    workflow.label,
                    workflow.category,
                    workflow.prerequisite,
                    workflow.merge_size_bytes,
                    workflow.unit_chunk_size as i64,
                    workflow.output_filename,
                    workflow.total_events as i64,
                    workflow.total_units as i64,
                ],
            )?;

            insert_files(&tx, &workflow.label, files)?;
            tx.commit()?;
            Ok(true)
        })?;

        if outcome {
            Ok(())
        } else {
            Err(StoreError::TopologyMismatch {
                label: workflow.label.clone(),
            })
        }
    }

    /// Inserts a dependency edge; fails if it would create a cycle.
    pub fn register_dependency(
        &mut self,
        child_label: &str,
        parent_label: &str,
        units_expected: u64,
    ) -> StoreResult<()> {
        let cycle = with_retry("register_dependency", || {
            let tx = self.conn.transaction()?;

            // Walk the prerequisite chain upward from the parent; a DAG with
            // single-parent edges means finding `child_label` anywhere in
            // that chain indicates a cycle.
            let mut cursor = Some(parent_label.to_string());
            let mut cycle = false;
            while let Some(label) = cursor {
                if label == child_label {
                    cycle = true;
                    break;
                }
                cursor = tx
                    .query_row(
                        "SELECT prerequisite FROM workflows WHERE label = ?1",
                        params![label],
                        |r| r.get::<_, Option<String>>(0),
                    )
                    .optional()?
                    .flatten();
            }
            if cycle {
                tx.commit()?;
                return Ok(true);
            }

            tx.execute(
                "INSERT INTO dependencies(child_label, parent_label, units_expected)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(child_label, parent_label) DO UPDATE SET
                    units_expected = excluded.units_expected",
                params![child_label, parent_label, units_expected as i64],
            )?;
            tx.execute(
                "UPDATE workflows SET prerequisite = ?1 WHERE label = ?2",
                params![parent_label, child_label],
            )?;
            tx.commit()?;
            Ok(false)
        })?;

        if cycle {
            Err(StoreError::CyclicDependency {
                child: child_label.to_string(),
                parent: parent_label.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Flips any unit in RUNNING back to UNASSIGNED and returns the set of
    /// task ids that were in-flight, so the caller can mark them ABORTED
    /// upstream. Atomic: no window with a RUNNING unit and no owning task.
    pub fn reset_units(&mut self) -> StoreResult<Vec<i64>> {
        with_retry("reset_units", || {
            let tx = self.conn.transaction()?;
            let mut ids = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT DISTINCT task_id FROM units WHERE state = ?1 AND task_id IS NOT NULL",
                )?;
                let mut rows = stmt.query(params![UnitState::Running as i64])?;
                while let Some(row) = rows.next()? {
                    ids.push(row.get::<_, i64>(0)?);
                }
            }
            tx.execute(
                "UPDATE units SET state = ?1, task_id = NULL WHERE state = ?2",
                params![UnitState::Unassigned as i64, UnitState::Running as i64],
            )?;
            if !ids.is_empty() {
                let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                tx.execute(
                    &format!(
                        "UPDATE tasks SET status = 4 WHERE id IN ({placeholders})"
                    ),
                    rusqlite::params_from_iter(ids.iter()),
                )?;
            }
            tx.commit()?;
            Ok(ids)
        })
    }

    /// Chooses up to `n_tasks` fresh task batches for `workflow_label`.
    /// Previously-FAILED units are preferred over UNASSIGNED (bounds retry
    /// latency); ties broken ascending (file, run, lumi).
    pub fn pop_units(
        &mut self,
        workflow_label: &str,
        n_tasks: u32,
        taper: f64,
    ) -> StoreResult<Vec<TaskBatch>> {
        if n_tasks == 0 {
            return Ok(Vec::new());
        }
        let taper = taper.clamp(f64::MIN_POSITIVE, 1.0);
        with_retry("pop_units", || {
            let tx = self.conn.transaction()?;
            let (chunk_size, category): (i64, String) = tx.query_row(
                "SELECT unit_chunk_size, category FROM workflows WHERE label = ?1",
                params![workflow_label],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            let batch_size = ((chunk_size as f64) * taper).floor().max(1.0) as i64;
            let limit = batch_size * n_tasks as i64;

            let mut candidates: Vec<(i64, i64)> = Vec::new(); // (unit_id, file_row_id)
            {
                let mut stmt = tx.prepare(
                    "SELECT id, file_row_id FROM units
                     WHERE workflow_label = ?1 AND state IN (?2, ?3)
                     ORDER BY CASE WHEN state = ?3 THEN 0 ELSE 1 END, file_row_id, run, lumi
                     LIMIT ?4",
                )?;
                let mut rows = stmt.query(params![
                    workflow_label,
                    UnitState::Unassigned as i64,
                    UnitState::Failed as i64,
                    limit
                ])?;
                while let Some(row) = rows.next()? {
                    candidates.push((row.get(0)?, row.get(1)?));
                }
            }

            let mut batches = Vec::new();
            for chunk in candidates.chunks(batch_size as usize) {
                if batches.len() as u32 >= n_tasks || chunk.is_empty() {
                    break;
                }
                let unit_ids: Vec<i64> = chunk.iter().map(|(u, _)| *u).collect();
                let file_row_ids: HashSet<i64> = chunk.iter().map(|(_, f)| *f).collect();

                tx.execute(
                    "INSERT INTO tasks(workflow_label, category, type, status)
                     VALUES (?1, ?2, 0, 0)",
                    params![workflow_label, category],
                )?;
                let task_id = tx.last_insert_rowid();

                let placeholders = unit_ids
                    .iter()
                    .map(|_| "?")
                    .collect::<Vec<_>>()
                    .join(",");
                tx.execute(
                    &format!(
                        "UPDATE units SET state = {}, task_id = {} WHERE id IN ({})",
                        UnitState::Running as i64,
                        task_id,
                        placeholders
                    ),
                    rusqlite::params_from_iter(unit_ids.iter()),
                )?;
                for uid in &unit_ids {
                    tx.execute(
                        "INSERT INTO task_units(task_id, unit_id) VALUES (?1, ?2)",
                        params![task_id, uid],
                    )?;
                }

                let mut files = Vec::new();
                for frid in file_row_ids {
                    let file_id: String = tx.query_row(
                        "SELECT file_id FROM files WHERE row_id = ?1",
                        params![frid],
                        |r| r.get(0),
                    )?;
                    files.push(file_id);
                }
                files.sort();

                batches.push(TaskBatch {
                    task_id,
                    workflow_label: workflow_label.to_string(),
                    files,
                    units: unit_ids,
                    unique_arg: task_id,
                    merge: false,
                    components: Vec::new(),
                });
            }

            tx.commit()?;
            Ok(batches)
        })
    }

    /// Looks up the (file_id, run, lumi) each of `unit_ids` covers, for
    /// building the per-task mask a `TaskHandler::adjust` needs (spec §4.2,
    /// §4.4 step 5). Mirrors the lumi tuples `source.py`'s `pop_units`
    /// already carries alongside each popped task's unit list.
    pub fn unit_locations(&mut self, unit_ids: &[i64]) -> StoreResult<HashMap<i64, (String, i64, i64)>> {
        let mut out = HashMap::new();
        if unit_ids.is_empty() {
            return Ok(out);
        }
        let placeholders = unit_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT u.id, f.file_id, u.run, u.lumi
             FROM units u JOIN files f ON f.row_id = u.file_row_id
             WHERE u.id IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = unit_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let mut rows = stmt.query(params.as_slice())?;
        while let Some(row) = rows.next()? {
            let unit_id: i64 = row.get(0)?;
            let file_id: String = row.get(1)?;
            let run: i64 = row.get(2)?;
            let lumi: i64 = row.get(3)?;
            out.insert(unit_id, (file_id, run, lumi));
        }
        Ok(out)
    }

    /// Greedily packs successful PROCESS tasks not yet merged into buckets
    /// of cumulative byte-size <= `merge_size_bytes`, up to `max_tasks`
    /// buckets. A trailing singleton bucket is not turned into a MERGE task;
    /// its lone component is marked MERGED directly in the same transaction.
    pub fn pop_unmerged_tasks(
        &mut self,
        workflow_label: &str,
        merge_size_bytes: i64,
        max_tasks: u32,
    ) -> StoreResult<Vec<TaskBatch>> {
        if merge_size_bytes <= 0 || max_tasks == 0 {
            return Ok(Vec::new());
        }
        with_retry("pop_unmerged_tasks", || {
            let tx = self.conn.transaction()?;

            let mut candidates: Vec<(i64, i64)> = Vec::new(); // (task_id, bytes_output)
            {
                let mut stmt = tx.prepare(
                    "SELECT t.id, t.bytes_output FROM tasks t
                     WHERE t.workflow_label = ?1 AND t.type = 0 AND t.status = 1
                       AND NOT EXISTS (
                           SELECT 1 FROM merge_components mc
                           JOIN tasks mt ON mt.id = mc.merge_task_id
                           WHERE mc.component_task_id = t.id AND mt.status != 2
                       )
                     ORDER BY t.id",
                )?;
                let mut rows = stmt.query(params![workflow_label])?;
                while let Some(row) = rows.next()? {
                    candidates.push((row.get(0)?, row.get(1)?));
                }
            }

            let mut batches = Vec::new();
            let mut bucket: Vec<i64> = Vec::new();
            let mut bucket_bytes = 0i64;

            // Flushing always empties `bucket` (either into a merge batch or
            // a direct single-component resolution) so the caller can push
            // the next candidate onto it unconditionally afterwards,
            // without ever carrying an already-at-capacity bucket forward.
            let mut flush = |tx: &rusqlite::Transaction,
                              bucket: &mut Vec<i64>,
                              bucket_bytes: &mut i64|
             -> StoreResult<Option<TaskBatch>> {
                if bucket.is_empty() {
                    return Ok(None);
                }
                if bucket.len() == 1 {
                    // Resolve the single-component case by marking it
                    // merged directly instead of spinning up a merge task
                    // for it (spec §9 open question).
                    let component = bucket[0];
                    mark_units_for_tasks(tx, &[component], UnitState::Merged)?;
                    tx.execute(
                        "UPDATE tasks SET status = 3 WHERE id = ?1",
                        params![component],
                    )?;
                    bucket.clear();
                    *bucket_bytes = 0;
                    return Ok(None);
                }

                tx.execute(
                    "INSERT INTO tasks(workflow_label, category, type, status)
                     VALUES (?1, 'merge', 1, 0)",
                    params![workflow_label],
                )?;
                let merge_task_id = tx.last_insert_rowid();
                for component in bucket.iter() {
                    tx.execute(
                        "INSERT INTO merge_components(merge_task_id, component_task_id)
                         VALUES (?1, ?2)",
                        params![merge_task_id, component],
                    )?;
                }
                mark_units_for_tasks(tx, bucket, UnitState::Merging)?;

                let batch = TaskBatch {
                    task_id: merge_task_id,
                    workflow_label: workflow_label.to_string(),
                    files: Vec::new(),
                    units: Vec::new(),
                    unique_arg: merge_task_id,
                    merge: true,
                    components: bucket.clone(),
                };
                bucket.clear();
                *bucket_bytes = 0;
                Ok(Some(batch))
            };

            for (task_id, bytes) in candidates {
                if batches.len() as u32 >= max_tasks {
                    break;
                }
                if !bucket.is_empty() && bucket_bytes + bytes > merge_size_bytes {
                    if let Some(batch) = flush(&tx, &mut bucket, &mut bucket_bytes)? {
                        batches.push(batch);
                    }
                }
                bucket.push(task_id);
                bucket_bytes += bytes;
            }
            if batches.len() < max_tasks as usize {
                if let Some(batch) = flush(&tx, &mut bucket, &mut bucket_bytes)? {
                    batches.push(batch);
                }
            }

            tx.commit()?;
            Ok(batches)
        })
    }

    /// Atomically applies a batch of task/file/unit updates.
    pub fn update_units(&mut self, updates: &[TaskUpdate]) -> StoreResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let retry_cap = self.retry_cap;
        with_retry("update_units", || {
            let tx = self.conn.transaction()?;
            for update in updates {
                apply_task_update(&tx, update, retry_cap)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Mark tasks whose outputs vanished as failed (used by merge prep).
    pub fn update_missing(&mut self, task_ids: &[i64]) -> StoreResult<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let retry_cap = self.retry_cap;
        with_retry("update_missing", || {
            let tx = self.conn.transaction()?;
            for &task_id in task_ids {
                tx.execute(
                    "UPDATE tasks SET status = 2 WHERE id = ?1",
                    params![task_id],
                )?;
                let unit_ids = units_for_task(&tx, task_id)?;
                revert_units(&tx, &unit_ids, retry_cap)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Inserts files/units derived from a parent's output into `child_label`.
    /// Idempotent per (child, source file).
    pub fn register_files(&mut self, infos: &[FileInfo], child_label: &str) -> StoreResult<()> {
        if infos.is_empty() {
            return Ok(());
        }
        with_retry("register_files", || {
            let tx = self.conn.transaction()?;
            insert_files(&tx, child_label, infos)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn work_left(&mut self, workflow_label: &str) -> StoreResult<WorkLeft> {
        with_retry("work_left", || {
            let prerequisite: Option<String> = self
                .conn
                .query_row(
                    "SELECT prerequisite FROM workflows WHERE label = ?1",
                    params![workflow_label],
                    |r| r.get(0),
                )
                .optional()?
                .flatten();

            let complete = match &prerequisite {
                None => true,
                Some(parent) => {
                    let units_expected: i64 = self
                        .conn
                        .query_row(
                            "SELECT units_expected FROM dependencies
                             WHERE child_label = ?1 AND parent_label = ?2",
                            params![workflow_label, parent],
                            |r| r.get(0),
                        )
                        .unwrap_or(0);
                    let registered: i64 = self.conn.query_row(
                        "SELECT COUNT(*) FROM units WHERE workflow_label = ?1",
                        params![workflow_label],
                        |r| r.get(0),
                    )?;
                    registered >= units_expected
                }
            };

            let units_left: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM units WHERE workflow_label = ?1 AND state IN (?2, ?3)",
                params![
                    workflow_label,
                    UnitState::Unassigned as i64,
                    UnitState::Failed as i64
                ],
                |r| r.get(0),
            )?;

            let chunk_size: i64 = self.conn.query_row(
                "SELECT unit_chunk_size FROM workflows WHERE label = ?1",
                params![workflow_label],
                |r| r.get(0),
            )?;

            Ok(WorkLeft {
                complete,
                units_left: units_left as u64,
                tasks_left_estimate: units_left as f64 / chunk_size.max(1) as f64,
            })
        })
    }

    /// Count of units not yet in a terminal state. A DONE unit counts as
    /// unfinished only if its workflow still expects merging.
    pub fn unfinished_units(&mut self) -> StoreResult<u64> {
        with_retry("unfinished_units", || {
            let n: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM units u JOIN workflows w ON w.label = u.workflow_label
                 WHERE u.state NOT IN (?1, ?2)
                   AND NOT (u.state = ?3 AND w.merge_size_bytes <= 0)",
                params![
                    UnitState::Merged as i64,
                    UnitState::Published as i64,
                    UnitState::Done as i64
                ],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// True iff no workflow that expects merging still has outstanding
    /// DONE/MERGING units.
    pub fn merged(&mut self) -> StoreResult<bool> {
        with_retry("merged", || {
            let n: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM units u JOIN workflows w ON w.label = u.workflow_label
                 WHERE w.merge_size_bytes > 0 AND u.state IN (?1, ?2)",
                params![UnitState::Done as i64, UnitState::Merging as i64],
                |r| r.get(0),
            )?;
            Ok(n == 0)
        })
    }

    pub fn estimate_tasks_left(&mut self) -> StoreResult<f64> {
        let labels = self.workflow_labels()?;
        let mut total = 0.0;
        for label in labels {
            total += self.work_left(&label)?.tasks_left_estimate;
        }
        Ok(total)
    }

    /// Units currently FAILED or permanently PAUSED.
    pub fn failed_units(&mut self) -> StoreResult<u64> {
        with_retry("failed_units", || {
            let n: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM units WHERE state IN (?1, ?2)",
                params![UnitState::Failed as i64, UnitState::Paused as i64],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
    }

    pub fn skipped_files(&mut self) -> StoreResult<u64> {
        with_retry("skipped_files", || {
            let n: i64 =
                self.conn
                    .query_row("SELECT COUNT(*) FROM files WHERE skipped = 1", [], |r| {
                        r.get(0)
                    })?;
            Ok(n as u64)
        })
    }

    pub fn workflow_status(&mut self, workflow_label: &str) -> StoreResult<WorkflowStatus> {
        with_retry("workflow_status", || {
            let mut counts: HashMap<i64, u64> = HashMap::new();
            {
                let mut stmt = self.conn.prepare(
                    "SELECT state, COUNT(*) FROM units WHERE workflow_label = ?1 GROUP BY state",
                )?;
                let mut rows = stmt.query(params![workflow_label])?;
                while let Some(row) = rows.next()? {
                    counts.insert(row.get(0)?, row.get::<_, i64>(1)? as u64);
                }
            }
            let get = |s: UnitState| counts.get(&(s as i64)).copied().unwrap_or(0);
            Ok(WorkflowStatus {
                label: workflow_label.to_string(),
                unassigned: get(UnitState::Unassigned),
                running: get(UnitState::Running),
                done: get(UnitState::Done),
                failed: get(UnitState::Failed),
                paused: get(UnitState::Paused),
                merging: get(UnitState::Merging),
                merged: get(UnitState::Merged),
                published: get(UnitState::Published),
            })
        })
    }

    /// Workflow labels in stable, label-sorted order (spec §9: no hash-map
    /// enumeration order).
    pub fn workflow_labels(&mut self) -> StoreResult<Vec<String>> {
        with_retry("workflow_labels", || {
            let mut stmt = self
                .conn
                .prepare("SELECT label FROM workflows ORDER BY label")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            rows.collect()
        })
    }
}

fn insert_files(
    tx: &rusqlite::Transaction,
    workflow_label: &str,
    files: &[FileInfo],
) -> rusqlite::Result<()> {
    for file in files {
        let row_id: Option<i64> = tx
            .query_row(
                "SELECT row_id FROM files WHERE workflow_label = ?1 AND file_id = ?2",
                params![workflow_label, file.file_id],
                |r| r.get(0),
            )
            .optional()?;
        if row_id.is_some() {
            continue;
        }
        tx.execute(
            "INSERT INTO files(workflow_label, file_id, events, bytes, skipped)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                workflow_label,
                file.file_id,
                file.events as i64,
                file.bytes,
                file.skipped as i64
            ],
        )?;
        let row_id = tx.last_insert_rowid();
        for (run, lumi) in &file.lumis {
            tx.execute(
                "INSERT INTO units(workflow_label, file_row_id, run, lumi, state)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![workflow_label, row_id, run, lumi, UnitState::Unassigned as i64],
            )?;
        }
    }
    Ok(())
}

fn mark_units_for_tasks(
    tx: &rusqlite::Transaction,
    task_ids: &[i64],
    state: UnitState,
) -> rusqlite::Result<()> {
    for &task_id in task_ids {
        tx.execute(
            "UPDATE units SET state = ?1
             WHERE id IN (SELECT unit_id FROM task_units WHERE task_id = ?2)",
            params![state as i64, task_id],
        )?;
    }
    Ok(())
}

fn units_for_task(tx: &rusqlite::Transaction, task_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = tx.prepare("SELECT unit_id FROM task_units WHERE task_id = ?1")?;
    let rows = stmt.query_map(params![task_id], |r| r.get(0))?;
    rows.collect()
}

/// Reverts units to UNASSIGNED, bumping retry_count, unless the cap is
/// reached in which case they go to PAUSED instead.
fn revert_units(
    tx: &rusqlite::Transaction,
    unit_ids: &[i64],
    retry_cap: u32,
) -> rusqlite::Result<()> {
    for &unit_id in unit_ids {
        let retry_count: i64 = tx.query_row(
            "SELECT retry_count FROM units WHERE id = ?1",
            params![unit_id],
            |r| r.get(0),
        )?;
        let new_count = retry_count + 1;
        let new_state = if new_count as u32 >= retry_cap {
            UnitState::Paused
        } else {
            UnitState::Unassigned
        };
        tx.execute(
            "UPDATE units SET state = ?1, task_id = NULL, retry_count = ?2 WHERE id = ?3",
            params![new_state as i64, new_count, unit_id],
        )?;
    }
    Ok(())
}

fn apply_task_update(
    tx: &rusqlite::Transaction,
    update: &TaskUpdate,
    retry_cap: u32,
) -> rusqlite::Result<()> {
    let task_type: i64 = tx.query_row(
        "SELECT type FROM tasks WHERE id = ?1",
        params![update.task_id],
        |r| r.get(0),
    )?;

    if task_type == 1 {
        // MERGE task.
        let component_ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT component_task_id FROM merge_components WHERE merge_task_id = ?1",
            )?;
            let rows = stmt.query_map(params![update.task_id], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        if update.failed {
            tx.execute(
                "UPDATE tasks SET status = 2 WHERE id = ?1",
                params![update.task_id],
            )?;
            mark_units_for_tasks(tx, &component_ids, UnitState::Done)?;
        } else {
            tx.execute(
                "UPDATE tasks SET status = 1, exit_code = ?1, host = ?2,
                    bytes_sent = ?3, bytes_received = ?4, bytes_output = ?5
                 WHERE id = ?6",
                params![
                    update.exit_code,
                    update.host,
                    update.bytes_sent,
                    update.bytes_received,
                    update.bytes_output,
                    update.task_id
                ],
            )?;
            mark_units_for_tasks(tx, &component_ids, UnitState::Merged)?;
            for component in &component_ids {
                tx.execute(
                    "UPDATE tasks SET status = 3 WHERE id = ?1",
                    params![component],
                )?;
            }
        }
        return Ok(());
    }

    // PROCESS task.
    if update.failed {
        tx.execute(
            "UPDATE tasks SET status = 2, retry_count = retry_count + 1,
                exit_code = ?1, host = ?2, bytes_sent = ?3, bytes_received = ?4, bytes_output = ?5
             WHERE id = ?6",
            params![
                update.exit_code,
                update.host,
                update.bytes_sent,
                update.bytes_received,
                update.bytes_output,
                update.task_id
            ],
        )?;
        let unit_ids = units_for_task(tx, update.task_id)?;
        revert_units(tx, &unit_ids, retry_cap)?;
    } else {
        tx.execute(
            "UPDATE tasks SET status = 1, exit_code = ?1, host = ?2,
                bytes_sent = ?3, bytes_received = ?4, bytes_output = ?5
             WHERE id = ?6",
            params![
                update.exit_code,
                update.host,
                update.bytes_sent,
                update.bytes_received,
                update.bytes_output,
                update.task_id
            ],
        )?;
        let mut processed: HashSet<i64> = HashSet::new();
        for unit_update in &update.unit_updates {
            if unit_update.done {
                tx.execute(
                    "UPDATE units SET state = ?1, task_id = NULL, events_processed = ?2
                     WHERE id = ?3",
                    params![
                        UnitState::Done as i64,
                        unit_update.events_processed as i64,
                        unit_update.unit_id
                    ],
                )?;
                processed.insert(unit_update.unit_id);
            }
        }
        // Units in the request mask but absent from the processed mask
        // revert for retry (a single task can therefore emit both DONE
        // and FAILED per-unit updates).
        let requested = units_for_task(tx, update.task_id)?;
        let unfinished: Vec<i64> = requested
            .into_iter()
            .filter(|u| !processed.contains(u))
            .collect();
        revert_units(tx, &unfinished, retry_cap)?;

        for file_update in &update.file_updates {
            tx.execute(
                "UPDATE files SET skipped = ?1
                 WHERE workflow_label = ?2 AND file_id = ?3",
                params![
                    file_update.skipped as i64,
                    file_update.workflow_label,
                    file_update.file_id
                ],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskUpdate, UnitUpdate};

    fn lumis(n: i64) -> Vec<(i64, i64)> {
        (0..n).map(|l| (1, l)).collect()
    }

    fn workflow(label: &str, chunk_size: u64) -> Workflow {
        Workflow {
            label: label.to_string(),
            category: "default".to_string(),
            prerequisite: None,
            merge_size_bytes: 0,
            unit_chunk_size: chunk_size,
            output_filename: "output.root".to_string(),
            total_events: 0,
            total_units: 0,
        }
    }

    fn one_file(file_id: &str, units: i64) -> FileInfo {
        FileInfo {
            file_id: file_id.to_string(),
            events: units as u64 * 100,
            bytes: units * 1_000_000,
            skipped: false,
            lumis: lumis(units),
        }
    }

    #[test]
    fn register_dataset_is_idempotent() {
        let mut store = UnitStore::open_in_memory(3).unwrap();
        let wf = workflow("w1", 10);
        let files = vec![one_file("f1", 100)];
        store.register_dataset(&wf, &files).unwrap();
        store.register_dataset(&wf, &files).unwrap();
        let status = store.workflow_status("w1").unwrap();
        assert_eq!(status.unassigned, 100);
    }

    #[test]
    fn register_dataset_rejects_topology_change() {
        let mut store = UnitStore::open_in_memory(3).unwrap();
        let wf = workflow("w1", 10);
        store.register_dataset(&wf, &[one_file("f1", 100)]).unwrap();
        let mut other = wf.clone();
        other.unit_chunk_size = 20;
        let err = store.register_dataset(&other, &[]).unwrap_err();
        assert!(matches!(err, StoreError::TopologyMismatch { .. }));
    }

    // S1: 100 units, chunk size 10 -> obtain(10 tasks) covers all 100 units,
    // one owner per unit, and completing all of them reaches done().
    #[test]
    fn s1_full_cycle_to_completion() {
        let mut store = UnitStore::open_in_memory(3).unwrap();
        let wf = workflow("w1", 10);
        store.register_dataset(&wf, &[one_file("f1", 100)]).unwrap();

        let batches = store.pop_units("w1", 10, 1.0).unwrap();
        assert_eq!(batches.len(), 10);
        let mut seen = HashSet::new();
        for batch in &batches {
            assert_eq!(batch.units.len(), 10);
            for u in &batch.units {
                assert!(seen.insert(*u), "unit popped twice: at-most-one-owner violated");
            }
        }

        let updates: Vec<TaskUpdate> = batches
            .iter()
            .map(|b| TaskUpdate {
                task_id: b.task_id,
                failed: false,
                exit_code: 0,
                host: Some("worker1".into()),
                bytes_sent: 0,
                bytes_received: 0,
                bytes_output: 1_000_000,
                unit_updates: b
                    .units
                    .iter()
                    .map(|&unit_id| UnitUpdate {
                        unit_id,
                        done: true,
                        events_processed: 100,
                    })
                    .collect(),
                file_updates: vec![],
            })
            .collect();
        store.update_units(&updates).unwrap();

        assert_eq!(store.unfinished_units().unwrap(), 0);
        assert!(store.merged().unwrap());
    }

    // Round-trip law: pop_units followed by update_units(FAILED) restores
    // unit state (retry_count += 1) and frees the task for repopping.
    #[test]
    fn failed_task_reverts_units_with_retry_count() {
        let mut store = UnitStore::open_in_memory(3).unwrap();
        let wf = workflow("w1", 10);
        store.register_dataset(&wf, &[one_file("f1", 10)]).unwrap();

        let batch = &store.pop_units("w1", 1, 1.0).unwrap()[0];
        store
            .update_units(&[TaskUpdate {
                task_id: batch.task_id,
                failed: true,
                exit_code: 1,
                host: None,
                bytes_sent: 0,
                bytes_received: 0,
                bytes_output: 0,
                unit_updates: vec![],
                file_updates: vec![],
            }])
            .unwrap();

        let status = store.workflow_status("w1").unwrap();
        assert_eq!(status.unassigned, 10);
        assert_eq!(status.running, 0);

        // Repopping succeeds: the unit is schedulable again.
        let reclaimed = store.pop_units("w1", 1, 1.0).unwrap();
        assert_eq!(reclaimed[0].units.len(), 10);
    }

    // S4: retry_cap exhaustion parks a unit in PAUSED, and it is not re-popped.
    #[test]
    fn retry_cap_exhaustion_pauses_unit() {
        let mut store = UnitStore::open_in_memory(2).unwrap();
        let wf = workflow("w1", 1);
        store.register_dataset(&wf, &[one_file("f1", 1)]).unwrap();

        for _ in 0..2 {
            let batch = &store.pop_units("w1", 1, 1.0).unwrap()[0];
            store
                .update_units(&[TaskUpdate {
                    task_id: batch.task_id,
                    failed: true,
                    exit_code: 1,
                    host: None,
                    bytes_sent: 0,
                    bytes_received: 0,
                    bytes_output: 0,
                    unit_updates: vec![],
                    file_updates: vec![],
                }])
                .unwrap();
        }

        let status = store.workflow_status("w1").unwrap();
        assert_eq!(status.paused, 1);
        assert_eq!(status.unassigned, 0);
        assert!(store.pop_units("w1", 1, 1.0).unwrap().is_empty());
    }

    // Invariant 3 (recovery idempotence): two consecutive reset_units calls
    // yield identical states.
    #[test]
    fn reset_units_is_idempotent() {
        let mut store = UnitStore::open_in_memory(3).unwrap();
        let wf = workflow("w1", 10);
        store.register_dataset(&wf, &[one_file("f1", 30)]).unwrap();
        store.pop_units("w1", 3, 1.0).unwrap();

        let first = store.reset_units().unwrap();
        assert_eq!(first.len(), 3);
        let second = store.reset_units().unwrap();
        assert!(second.is_empty());

        let status = store.workflow_status("w1").unwrap();
        assert_eq!(status.unassigned, 30);
        assert_eq!(status.running, 0);
    }

    // S5: 20 successful tasks, merge_size groups them into buckets; success
    // moves components to MERGED, failure returns them to DONE.
    #[test]
    fn s5_merge_success_and_failure() {
        let mut store = UnitStore::open_in_memory(3).unwrap();
        let mut wf = workflow("w1", 1);
        wf.merge_size_bytes = 500_000_000;
        store.register_dataset(&wf, &[one_file("f1", 20)]).unwrap();

        let batches = store.pop_units("w1", 20, 1.0).unwrap();
        let updates: Vec<TaskUpdate> = batches
            .iter()
            .map(|b| TaskUpdate {
                task_id: b.task_id,
                failed: false,
                exit_code: 0,
                host: Some("w".into()),
                bytes_sent: 0,
                bytes_received: 0,
                bytes_output: 50_000_000,
                unit_updates: b
                    .units
                    .iter()
                    .map(|&unit_id| UnitUpdate {
                        unit_id,
                        done: true,
                        events_processed: 1,
                    })
                    .collect(),
                file_updates: vec![],
            })
            .collect();
        store.update_units(&updates).unwrap();

        let merge_batches = store
            .pop_unmerged_tasks("w1", wf.merge_size_bytes, 10)
            .unwrap();
        assert_eq!(merge_batches.len(), 2);
        for b in &merge_batches {
            assert_eq!(b.components.len(), 10);
            assert!(b.merge);
        }

        // Fail the first merge: its components return to DONE, re-eligible.
        store
            .update_units(&[TaskUpdate {
                task_id: merge_batches[0].task_id,
                failed: true,
                exit_code: 1,
                host: None,
                bytes_sent: 0,
                bytes_received: 0,
                bytes_output: 0,
                unit_updates: vec![],
                file_updates: vec![],
            }])
            .unwrap();

        // Succeed the second merge: its components become MERGED.
        store
            .update_units(&[TaskUpdate {
                task_id: merge_batches[1].task_id,
                failed: false,
                exit_code: 0,
                host: None,
                bytes_sent: 0,
                bytes_received: 0,
                bytes_output: 500_000_000,
                unit_updates: vec![],
                file_updates: vec![],
            }])
            .unwrap();

        let status = store.workflow_status("w1").unwrap();
        assert_eq!(status.done, 10); // failed merge's components
        assert_eq!(status.merged, 10); // succeeded merge's components

        let retry = store
            .pop_unmerged_tasks("w1", wf.merge_size_bytes, 10)
            .unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].components.len(), 10);
    }

    // Boundary: merge_size <= 0 never produces merge tasks.
    #[test]
    fn zero_merge_size_produces_no_merge_tasks() {
        let mut store = UnitStore::open_in_memory(3).unwrap();
        let wf = workflow("w1", 5);
        store.register_dataset(&wf, &[one_file("f1", 5)]).unwrap();
        store.pop_units("w1", 1, 1.0).unwrap();
        assert!(store
            .pop_unmerged_tasks("w1", 0, 10)
            .unwrap()
            .is_empty());
    }

    // Taper shrinks batch sizes relative to taper = 1.
    #[test]
    fn taper_produces_smaller_batches() {
        let mut store = UnitStore::open_in_memory(3).unwrap();
        let wf = workflow("w1", 10);
        store.register_dataset(&wf, &[one_file("f1", 10)]).unwrap();
        let full = store.pop_units("w1", 1, 1.0).unwrap();
        assert_eq!(full[0].units.len(), 10);

        let mut store2 = UnitStore::open_in_memory(3).unwrap();
        store2.register_dataset(&wf, &[one_file("f1", 10)]).unwrap();
        let tapered = store2.pop_units("w1", 1, 0.5).unwrap();
        assert!(tapered[0].units.len() < full[0].units.len());
    }

    // Open question resolution: a merge bucket with exactly one component
    // (no other work remains) is marked MERGED directly; no merge task is
    // created for it.
    #[test]
    fn single_component_merge_bucket_marks_merged_directly() {
        let mut store = UnitStore::open_in_memory(3).unwrap();
        let mut wf = workflow("w1", 1);
        wf.merge_size_bytes = 500_000_000;
        store.register_dataset(&wf, &[one_file("f1", 1)]).unwrap();

        let batch = &store.pop_units("w1", 1, 1.0).unwrap()[0];
        store
            .update_units(&[TaskUpdate {
                task_id: batch.task_id,
                failed: false,
                exit_code: 0,
                host: Some("w".into()),
                bytes_sent: 0,
                bytes_received: 0,
                bytes_output: 50_000_000,
                unit_updates: batch
                    .units
                    .iter()
                    .map(|&unit_id| UnitUpdate {
                        unit_id,
                        done: true,
                        events_processed: 1,
                    })
                    .collect(),
                file_updates: vec![],
            }])
            .unwrap();

        let merge_batches = store
            .pop_unmerged_tasks("w1", wf.merge_size_bytes, 10)
            .unwrap();
        assert!(merge_batches.is_empty(), "singleton must not become a merge task");

        let status = store.workflow_status("w1").unwrap();
        assert_eq!(status.merged, 1);
        assert_eq!(status.done, 0);
    }

    // Regression: three successive 300MB outputs against a 500MB cap don't
    // divide the cap evenly. No pair of them fits in one bucket, so each
    // must resolve as its own singleton; no emitted merge batch may ever
    // carry components whose bytes sum past merge_size_bytes.
    #[test]
    fn pop_unmerged_tasks_never_overflows_a_bucket_with_uneven_sizes() {
        let mut store = UnitStore::open_in_memory(3).unwrap();
        let mut wf = workflow("w1", 1);
        wf.merge_size_bytes = 500_000_000;
        store.register_dataset(&wf, &[one_file("f1", 3)]).unwrap();

        let batches = store.pop_units("w1", 3, 1.0).unwrap();
        let updates: Vec<TaskUpdate> = batches
            .iter()
            .map(|b| TaskUpdate {
                task_id: b.task_id,
                failed: false,
                exit_code: 0,
                host: Some("w".into()),
                bytes_sent: 0,
                bytes_received: 0,
                bytes_output: 300_000_000,
                unit_updates: b
                    .units
                    .iter()
                    .map(|&unit_id| UnitUpdate { unit_id, done: true, events_processed: 1 })
                    .collect(),
                file_updates: vec![],
            })
            .collect();
        store.update_units(&updates).unwrap();

        let merge_batches = store.pop_unmerged_tasks("w1", wf.merge_size_bytes, 10).unwrap();
        assert!(
            merge_batches.is_empty(),
            "no two 300MB tasks fit under a 500MB cap, so every component resolves as a singleton"
        );
        for batch in &merge_batches {
            let bytes: i64 = batch.components.len() as i64 * 300_000_000;
            assert!(bytes <= wf.merge_size_bytes, "bucket exceeded merge_size_bytes");
        }

        let status = store.workflow_status("w1").unwrap();
        assert_eq!(status.merged, 3, "all three components marked merged directly as singletons");
    }

    #[test]
    fn register_dependency_rejects_cycle() {
        let mut store = UnitStore::open_in_memory(3).unwrap();
        store.register_dataset(&workflow("a", 10), &[one_file("f1", 1)]).unwrap();
        store.register_dataset(&workflow("b", 10), &[one_file("f1", 1)]).unwrap();
        store.register_dependency("b", "a", 1).unwrap();
        let err = store.register_dependency("a", "b", 1).unwrap_err();
        assert!(matches!(err, StoreError::CyclicDependency { .. }));
    }
}
