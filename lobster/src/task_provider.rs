//! The scheduler: turns category caps and queue occupancy into task
//! batches, then turns completions back into store updates (spec §4.4).
//!
//! Grounded in `TaskProvider.obtain`/`release` in the original `source.py`:
//! the hunger formula, the capped-categories-first sort, and the
//! incomplete-before-complete taper are carried over unchanged; everything
//! about dashboards, sandboxes and the parrot binaries is left behind as
//! out of scope (spec §1).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use tracing::warn;

use crate::config::{CategoryConfig, Config, WorkflowConfig};
use crate::facade::{CompletedTask, MonitoringSink, StorageFacade};
use crate::merge_task_handler::MergeTaskHandler;
use crate::paths;
use crate::release_summary::ReleaseSummary;
use crate::task_handler::{ReportDocument, TaskAssignment, TaskHandler};
use unitstore::{FileInfo, TaskBatch, UnitStore};

/// One task batch handed to the caller for dispatch (spec §4.4 step 5).
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub task_id: i64,
    pub workflow_label: String,
    pub category: String,
    pub merge: bool,
    pub units: Vec<i64>,
    pub components: Vec<i64>,
}

/// The maximum number of merge-task batches requested per workflow per
/// cycle (spec §4.4 step 1: "up to 10 merge tasks").
const MAX_MERGE_TASKS_PER_CYCLE: u32 = 10;

pub struct TaskProvider;

impl TaskProvider {
    /// Spec §4.4: builds the next cycle's task batches from category caps
    /// and current queue occupancy.
    pub fn obtain(
        store: &mut UnitStore,
        config: &Config,
        total_cores: u32,
        in_queue_by_category: &HashMap<String, u32>,
    ) -> unitstore::StoreResult<Vec<TaskDescriptor>> {
        let mut descriptors = Vec::new();

        // Step 1: merge tasks bypass fair-sharing entirely.
        for workflow in &config.workflows {
            if workflow.merge_size_bytes <= 0 {
                continue;
            }
            let batches = store.pop_unmerged_tasks(
                &workflow.label,
                workflow.merge_size_bytes,
                MAX_MERGE_TASKS_PER_CYCLE,
            )?;
            descriptors.extend(batches.into_iter().map(|b| to_descriptor(&b, "merge")));
        }

        // Step 2/3: per-workflow residual work and the hunger target.
        let payload_floor = config.advanced.payload_floor;
        let need = total_cores + (total_cores as f64 * 0.1).ceil() as u32;
        let need = need.max(total_cores + payload_floor);
        let in_use: u32 = config
            .categories
            .iter()
            .map(|c| c.cores * in_queue_by_category.get(&c.name).copied().unwrap_or(0))
            .sum();
        let hunger = need.saturating_sub(in_use);
        if hunger == 0 {
            return Ok(descriptors);
        }

        let mut residuals: HashMap<String, (bool, u64, f64)> = HashMap::new();
        for workflow in &config.workflows {
            let left = store.work_left(&workflow.label)?;
            if left.tasks_left_estimate < 1.0 && left.complete {
                continue;
            }
            residuals.insert(workflow.label.clone(), (left.complete, left.units_left, left.tasks_left_estimate));
        }

        // Step 4: fair-share hunger across categories, smallest-cap
        // categories walked first -- the tightest bound has to be satisfied
        // precisely before looser or uncapped categories eat the shared
        // `remaining_hunger` budget (spec §4.4 step 4).
        let mut categories: Vec<&CategoryConfig> = config.categories.iter().collect();
        categories.sort_by_key(|c| {
            let cap_weight = c.tasks_max.map(|cap| cap as i64 * c.cores as i64);
            cap_weight.unwrap_or(i64::MAX)
        });

        let total_share: f64 = categories
            .iter()
            .map(|c| category_share(c, &config.workflows, &residuals))
            .sum();
        if total_share <= 0.0 {
            return Ok(descriptors);
        }

        let mut remaining_hunger = hunger as f64;
        for category in categories {
            if remaining_hunger <= 0.0 {
                break;
            }
            let share = category_share(category, &config.workflows, &residuals);
            if share <= 0.0 {
                continue;
            }
            let mut ccores = (remaining_hunger * share / total_share).ceil();
            if let Some(cap) = category.tasks_max {
                let in_queue = in_queue_by_category.get(&category.name).copied().unwrap_or(0);
                let cap_remaining = cap.saturating_sub(in_queue) as f64 * category.cores as f64;
                ccores = ccores.min(cap_remaining);
            }
            if ccores <= 0.0 {
                continue;
            }

            let mut workflows: Vec<&WorkflowConfig> = config
                .workflows
                .iter()
                .filter(|w| w.category == category.name && residuals.contains_key(&w.label))
                .collect();
            workflows.sort_by(|a, b| {
                let a_incomplete = !residuals[&a.label].0;
                let b_incomplete = !residuals[&b.label].0;
                b_incomplete.cmp(&a_incomplete).then_with(|| a.label.cmp(&b.label))
            });

            let category_total_units: u64 = workflows
                .iter()
                .map(|w| residuals[&w.label].1)
                .sum::<u64>()
                .max(1);

            for workflow in workflows {
                if ccores <= 0.0 {
                    break;
                }
                let (complete, units_left, _tasks_left) = residuals[&workflow.label];
                if units_left == 0 {
                    continue;
                }
                let ntasks = ((ccores * units_left as f64) / (category_total_units as f64 * category.cores as f64))
                    .ceil()
                    .max(1.0) as u32;
                let taper = if complete {
                    (units_left as f64 / (ntasks as f64 * category.cores as f64)).min(1.0)
                } else {
                    1.0
                };

                let batches = store.pop_units(&workflow.label, ntasks, taper)?;
                let popped_cores = batches.len() as f64 * category.cores as f64;
                ccores -= popped_cores;
                remaining_hunger -= popped_cores;

                descriptors.extend(batches.into_iter().map(|b| to_descriptor(&b, &category.name)));
            }
        }

        Ok(descriptors)
    }

    /// Spec §4.4 step 5: for each batch `obtain` produced this cycle,
    /// create its working directory, mint monitoring ids, adjust the
    /// per-task parameter document, and write it to that directory. Returns
    /// the `TaskAssignment`s `release` needs later to classify completions.
    #[allow(clippy::too_many_arguments)]
    pub async fn provision(
        store: &mut UnitStore,
        workdir: &Path,
        config: &Config,
        task_group_id: &str,
        descriptors: &[TaskDescriptor],
        sink: &dyn MonitoringSink,
        storage: &dyn StorageFacade,
    ) -> Result<HashMap<i64, TaskAssignment>> {
        let mut assignments = HashMap::new();

        for descriptor in descriptors {
            let dir = paths::running_dir(workdir, &descriptor.workflow_label, descriptor.task_id);
            fs::create_dir_all(&dir).context("failed to create task working directory")?;

            let (monitor_id, sync_id) = sink.register_task(descriptor.task_id).await;
            let output_filename = config
                .workflow(&descriptor.workflow_label)
                .map(|w| w.output_filename.clone())
                .unwrap_or_else(|| "output.root".to_string());
            let outputs = vec![
                (output_filename.clone(), output_filename),
                ("report.json".to_string(), "report.json".to_string()),
            ];

            let units = if descriptor.merge {
                HashMap::new()
            } else {
                store.unit_locations(&descriptor.units).context("failed to look up unit locations")?
            };

            let document = if descriptor.merge {
                let input_files =
                    descriptor.components.iter().map(|c| format!("task-{c}/output.root")).collect();
                MergeTaskHandler::adjust(task_group_id, monitor_id, sync_id, input_files, outputs, storage)
                    .await
                    .context("failed to adjust merge task parameter document")?
            } else {
                let assignment = TaskAssignment {
                    task_id: descriptor.task_id,
                    workflow_label: descriptor.workflow_label.clone(),
                    units: units.clone(),
                };
                TaskHandler::adjust(&assignment, task_group_id, monitor_id, sync_id, outputs, storage)
                    .await
                    .context("failed to adjust task parameter document")?
            };

            let json =
                serde_json::to_string_pretty(&document).context("failed to serialize parameter document")?;
            fs::write(paths::parameters_path(workdir, &descriptor.workflow_label, descriptor.task_id), json)
                .context("failed to write parameter document")?;

            assignments.insert(
                descriptor.task_id,
                TaskAssignment { task_id: descriptor.task_id, workflow_label: descriptor.workflow_label.clone(), units },
            );
        }

        Ok(assignments)
    }

    /// Spec §4.4 `release`: consumes completed tasks, updates the store,
    /// propagates outputs downstream, schedules cleanup.
    #[allow(clippy::too_many_arguments)]
    pub async fn release(
        store: &mut UnitStore,
        config: &Config,
        workdir: &Path,
        sink: &dyn MonitoringSink,
        assignments: &HashMap<i64, TaskAssignment>,
        completions: Vec<CompletedTask>,
        reports: &HashMap<i64, ReportDocument>,
    ) -> Result<ReleaseSummary> {
        let mut summary = ReleaseSummary::new();
        let mut updates = Vec::new();
        let mut removals = Vec::new();
        let mut propagations: HashMap<String, Vec<FileInfo>> = HashMap::new();

        for completed in &completions {
            sink.update_task(completed.task_id, "done").await;

            let Some(assignment) = assignments.get(&completed.task_id) else {
                warn!(task_id = completed.task_id, "release: no assignment on record, skipping");
                continue;
            };
            let report = reports.get(&completed.task_id);
            let update = TaskHandler::process(assignment, completed, report, &mut summary);

            let bucket = if update.failed { paths::BUCKET_FAILED } else { paths::BUCKET_SUCCESSFUL };
            let from = paths::running_dir(workdir, &assignment.workflow_label, completed.task_id);
            let to = paths::task_dir(workdir, &assignment.workflow_label, bucket, completed.task_id);
            if from.exists() {
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent).context("failed to create terminal task directory")?;
                }
                if let Err(e) = fs::rename(&from, &to) {
                    warn!(task_id = completed.task_id, error = %e, "failed to move task directory");
                }
            }
            summary.dir(completed.task_id, to.display().to_string());

            if update.failed {
                if let Some(report) = report {
                    removals.extend(report.files.iter().map(|f| f.file_id.clone()));
                }
            } else {
                let workflow = config.workflow(&assignment.workflow_label);
                let should_propagate = workflow.map(|w| w.merge_size_bytes <= 0).unwrap_or(true);
                if should_propagate {
                    if let Some(report) = report {
                        for dependent in config.workflows.iter().filter(|w| {
                            w.prerequisite.as_deref() == Some(assignment.workflow_label.as_str())
                        }) {
                            let infos = propagations.entry(dependent.label.clone()).or_default();
                            infos.extend(report.files.iter().map(|f| FileInfo {
                                file_id: f.file_id.clone(),
                                events: f.events_processed,
                                bytes: 0,
                                skipped: f.skipped,
                                lumis: f.lumis.clone(),
                            }));
                        }
                    }
                }
            }

            sink.update_task(completed.task_id, "retrieved").await;
            updates.push(update);
        }

        store.update_units(&updates)?;

        for file_id in removals {
            warn!(file = %file_id, "best-effort cleanup of removed task output (no-op without a storage facade)");
        }

        for (child_label, infos) in propagations {
            store.register_files(&infos, &child_label)?;
        }

        Ok(summary)
    }

    /// Spec §4.4 `terminate`: flags in-flight tasks CANCELLED upstream
    /// without mutating store state; `reset_units` repairs the store on the
    /// next restart.
    pub async fn terminate(workdir: &Path, config: &Config, sink: &dyn MonitoringSink) -> Result<()> {
        for workflow in &config.workflows {
            let running = paths::get_task_ids(workdir, &workflow.label, paths::BUCKET_RUNNING)
                .context("failed to enumerate running tasks")?;
            for task_id in running {
                sink.update_task(task_id, "cancelled").await;
            }
        }
        Ok(())
    }

    /// Spec §4.4 `done`: true iff every workflow has merged and no units
    /// remain unfinished.
    pub fn done(store: &mut UnitStore) -> unitstore::StoreResult<bool> {
        Ok(store.merged()? && store.unfinished_units()? == 0)
    }

    /// Spec §4.4 `update`: walks the executor's view of in-flight tasks and
    /// reconciles monitoring sink state for anything not already terminal.
    /// `DONE` and `WAITING_RETRIEVAL` are excluded: a done task is handled
    /// by `release` on its own terminal transition, and waiting-retrieval
    /// has no corresponding dashboard state to report.
    pub async fn update(queue_snapshot: &[(i64, TaskQueueState)], sink: &dyn MonitoringSink) {
        for &(task_id, state) in queue_snapshot {
            if matches!(state, TaskQueueState::Done | TaskQueueState::WaitingRetrieval) {
                continue;
            }
            sink.update_task(task_id, state.sink_label()).await;
        }
    }
}

/// The executor's coarse per-task state, as seen in one queue snapshot
/// (spec §4.4 `update`'s `queue_snapshot` argument).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskQueueState {
    Waiting,
    Running,
    WaitingRetrieval,
    Done,
}

impl TaskQueueState {
    fn sink_label(self) -> &'static str {
        match self {
            TaskQueueState::Waiting => "waiting",
            TaskQueueState::Running => "running",
            TaskQueueState::WaitingRetrieval => "waiting_retrieval",
            TaskQueueState::Done => "done",
        }
    }
}

fn category_share(
    category: &CategoryConfig,
    workflows: &[WorkflowConfig],
    residuals: &HashMap<String, (bool, u64, f64)>,
) -> f64 {
    workflows
        .iter()
        .filter(|w| w.category == category.name)
        .filter_map(|w| residuals.get(&w.label))
        .map(|(_, units_left, _)| *units_left as f64 * category.cores as f64)
        .sum()
}

fn to_descriptor(batch: &TaskBatch, category: &str) -> TaskDescriptor {
    TaskDescriptor {
        task_id: batch.task_id,
        workflow_label: batch.workflow_label.clone(),
        category: category.to_string(),
        merge: batch.merge,
        units: batch.units.clone(),
        components: batch.components.clone(),
    }
}

/// Sorts categories smallest-cap-first the same way `obtain` does (spec
/// §4.4 step 4), exposed for the property test below.
#[cfg(test)]
fn sorted_by_cap_weight(categories: &[CategoryConfig]) -> Vec<&CategoryConfig> {
    let mut sorted: Vec<&CategoryConfig> = categories.iter().collect();
    sorted.sort_by_key(|c| {
        let cap_weight = c.tasks_max.map(|cap| cap as i64 * c.cores as i64);
        cap_weight.unwrap_or(i64::MAX)
    });
    sorted
}
