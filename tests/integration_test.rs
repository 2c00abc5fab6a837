//! End-to-end tests exercising the obtain/release cycle across the
//! `unitstore` and `lobster` crates together.

use std::collections::HashMap;

use lobster::task_handler::{ReportDocument, ReportFileEntry, TaskAssignment, TaskHandler};
use lobster::release_summary::ReleaseSummary;
use unitstore::{Category, FileInfo, TaskUpdate, UnitStore, Workflow};

fn lumis(n: i64) -> Vec<(i64, i64)> {
    (0..n).map(|l| (1, l)).collect()
}

fn one_file(file_id: &str, units: i64) -> FileInfo {
    FileInfo {
        file_id: file_id.to_string(),
        events: units as u64 * 10,
        bytes: units * 1_000_000,
        skipped: false,
        lumis: lumis(units),
    }
}

fn seeded_store(chunk_size: u64, units: i64) -> UnitStore {
    let mut store = UnitStore::open_in_memory(3).unwrap();
    store
        .register_category(&Category {
            name: "process".to_string(),
            cores: 1,
            memory_mb: 2000,
            runtime_s: 3600,
            tasks_max: None,
        })
        .unwrap();
    store
        .register_dataset(
            &Workflow {
                label: "w1".to_string(),
                category: "process".to_string(),
                prerequisite: None,
                merge_size_bytes: 0,
                unit_chunk_size: chunk_size,
                output_filename: "output.root".to_string(),
                total_events: units as u64 * 10,
                total_units: units as u64,
            },
            &[one_file("f1", units)],
        )
        .unwrap();
    store
}

/// S1: a fully loaded category pops tasks covering every unit; completing
/// them all successfully drains the workflow.
#[test]
fn full_cycle_drains_every_unit() {
    let mut store = seeded_store(10, 100);

    let batches = store.pop_units("w1", 10, 1.0).unwrap();
    assert_eq!(batches.len(), 10);
    assert_eq!(batches.iter().map(|b| b.units.len()).sum::<usize>(), 100);

    let mut summary = ReleaseSummary::new();
    let mut updates = Vec::new();
    for batch in &batches {
        let mut units = HashMap::new();
        for unit_id in &batch.units {
            units.insert(*unit_id, ("f1".to_string(), 1, *unit_id));
        }
        let assignment = TaskAssignment { task_id: batch.task_id, workflow_label: "w1".to_string(), units };
        let completed = lobster::facade::CompletedTask { task_id: batch.task_id, exit_code: 0, ..Default::default() };
        let report = ReportDocument {
            files: vec![ReportFileEntry {
                file_id: "f1".to_string(),
                events_processed: 10,
                lumis: batch.units.iter().map(|&unit_id| (1, unit_id)).collect(),
                skipped: false,
            }],
            bytes_output: 1_000_000,
        };
        updates.push(TaskHandler::process(&assignment, &completed, Some(&report), &mut summary));
    }

    store.update_units(&updates).unwrap();

    assert_eq!(store.unfinished_units().unwrap(), 0);
    let status = store.workflow_status("w1").unwrap();
    assert_eq!(status.done, 100);
    assert_eq!(status.unassigned, 0);
}

/// S4: a task that keeps failing its work-queue flag reverts its units for
/// retry until the retry cap is hit, after which they go PAUSED.
#[test]
fn repeated_failures_pause_units_past_the_retry_cap() {
    let retry_cap = 2;
    let mut store = UnitStore::open_in_memory(retry_cap).unwrap();
    store
        .register_category(&Category {
            name: "process".to_string(),
            cores: 1,
            memory_mb: 2000,
            runtime_s: 3600,
            tasks_max: None,
        })
        .unwrap();
    store
        .register_dataset(
            &Workflow {
                label: "w1".to_string(),
                category: "process".to_string(),
                prerequisite: None,
                merge_size_bytes: 0,
                unit_chunk_size: 10,
                output_filename: "output.root".to_string(),
                total_events: 100,
                total_units: 10,
            },
            &[one_file("f1", 10)],
        )
        .unwrap();

    for _ in 0..retry_cap {
        let batches = store.pop_units("w1", 1, 1.0).unwrap();
        assert_eq!(batches.len(), 1);
        let task_id = batches[0].task_id;
        store
            .update_units(&[TaskUpdate {
                task_id,
                failed: true,
                exit_code: 1,
                host: None,
                bytes_sent: 0,
                bytes_received: 0,
                bytes_output: 0,
                unit_updates: Vec::new(),
                file_updates: Vec::new(),
            }])
            .unwrap();
    }

    let status = store.workflow_status("w1").unwrap();
    assert_eq!(status.paused, 10, "units should be paused once retry_count reaches the cap");
    assert_eq!(status.unassigned, 0);

    // A paused workflow has no further poppable work.
    let batches = store.pop_units("w1", 10, 1.0).unwrap();
    assert!(batches.is_empty());
}

/// S5: successful process tasks bucket into merge tasks once their
/// cumulative output crosses the merge-size threshold.
#[test]
fn successful_tasks_bucket_into_merge_tasks() {
    let mut store = UnitStore::open_in_memory(3).unwrap();
    store
        .register_category(&Category {
            name: "process".to_string(),
            cores: 1,
            memory_mb: 2000,
            runtime_s: 3600,
            tasks_max: None,
        })
        .unwrap();
    store
        .register_dataset(
            &Workflow {
                label: "w1".to_string(),
                category: "process".to_string(),
                prerequisite: None,
                merge_size_bytes: 500_000_000,
                unit_chunk_size: 5,
                output_filename: "output.root".to_string(),
                total_events: 1000,
                total_units: 100,
            },
            &[one_file("f1", 100)],
        )
        .unwrap();

    let batches = store.pop_units("w1", 20, 1.0).unwrap();
    assert_eq!(batches.len(), 20);

    let updates: Vec<TaskUpdate> = batches
        .iter()
        .map(|b| TaskUpdate {
            task_id: b.task_id,
            failed: false,
            exit_code: 0,
            host: None,
            bytes_sent: 0,
            bytes_received: 0,
            bytes_output: 50_000_000,
            unit_updates: b
                .units
                .iter()
                .map(|&unit_id| unitstore::UnitUpdate { unit_id, done: true, events_processed: 10 })
                .collect(),
            file_updates: Vec::new(),
        })
        .collect();
    store.update_units(&updates).unwrap();

    let merge_batches = store.pop_unmerged_tasks("w1", 500_000_000, 10).unwrap();
    assert_eq!(merge_batches.len(), 2, "20 tasks at 50MB should pack into two 500MB buckets");
    for batch in &merge_batches {
        assert!(batch.merge);
        assert_eq!(batch.components.len(), 10);
    }

    let status = store.workflow_status("w1").unwrap();
    assert_eq!(status.merging, 100);
}
