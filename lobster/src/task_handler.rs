//! Converts one executor result back into a [`unitstore::TaskUpdate`]
//! (spec §4.2).
//!
//! The per-unit "requested minus reported-done" diff already lives in
//! `unitstore::UnitStore::update_units` (it has the durable `task_units`
//! mapping); this handler only needs to report which units the executor
//! says it finished, not recompute the diff itself.

use std::collections::HashMap;

use eyre::Context;
use serde::Serialize;

use crate::facade::{CompletedTask, StorageFacade};
use crate::release_summary::ReleaseSummary;
use unitstore::{FileUpdate, TaskUpdate, UnitUpdate};

/// Exit code recorded when the executor's report document is missing or
/// cannot be parsed (spec §4.2 rule 2).
pub const EXIT_UNPARSEABLE: i32 = -1;

/// Per-file processed-events/lumis entry from `report.json`'s `files.info`
/// map (spec §6).
#[derive(Debug, Clone)]
pub struct ReportFileEntry {
    pub file_id: String,
    pub events_processed: u64,
    pub lumis: Vec<(i64, i64)>,
    pub skipped: bool,
}

/// Parsed `report.json` (spec §6). `None` from the caller signals a missing
/// or malformed document, which is itself a failure mode (rule 2).
#[derive(Debug, Clone, Default)]
pub struct ReportDocument {
    pub files: Vec<ReportFileEntry>,
    /// `b_output` from the report's timing/byte-count section.
    pub bytes_output: i64,
}

/// The unit-to-task mapping a TaskProvider built for one in-flight task.
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    pub task_id: i64,
    pub workflow_label: String,
    /// unit id -> (file_id, run, lumi)
    pub units: HashMap<i64, (String, i64, i64)>,
}

/// Per-task file mask: which files, which lumis within each, how many
/// events (spec §6 `parameters.json`'s `mask` object).
#[derive(Debug, Clone, Serialize)]
pub struct Mask {
    pub files: Vec<String>,
    pub lumis: HashMap<String, Vec<(i64, i64)>>,
    pub events: Option<u64>,
}

/// Monitoring identifiers minted for one task (spec §6 `parameters.json`'s
/// `monitoring` object).
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringIds {
    pub monitorid: String,
    pub syncid: String,
    pub taskid: String,
}

/// The per-task parameter document written to the task's working directory
/// before dispatch (spec §4.2 `adjust`, spec §6 `parameters.json`).
#[derive(Debug, Clone, Serialize)]
pub struct ParameterDocument {
    pub mask: Mask,
    pub monitoring: MonitoringIds,
    pub arguments: Option<Vec<String>>,
    #[serde(rename = "output files")]
    pub output_files: Vec<(String, String)>,
}

/// Converts one executor completion into a structured store update.
pub struct TaskHandler;

impl TaskHandler {
    /// Implements spec §4.2's `adjust`: fills the per-task mask from the
    /// unit assignment, resolves output URIs via the storage façade, and
    /// attaches the monitoring ids the caller minted via
    /// `MonitoringSink::register_task`.
    pub async fn adjust(
        assignment: &TaskAssignment,
        task_group_id: &str,
        monitor_id: String,
        sync_id: String,
        outputs: Vec<(String, String)>,
        storage: &dyn StorageFacade,
    ) -> eyre::Result<ParameterDocument> {
        storage
            .preprocess(false)
            .await
            .context("storage facade preprocess failed while adjusting task")?;

        let mut files: Vec<String> = Vec::new();
        let mut lumis: HashMap<String, Vec<(i64, i64)>> = HashMap::new();
        for (file_id, run, lumi) in assignment.units.values() {
            if !files.contains(file_id) {
                files.push(file_id.clone());
            }
            lumis.entry(file_id.clone()).or_default().push((*run, *lumi));
        }
        files.sort();
        for v in lumis.values_mut() {
            v.sort();
        }

        Ok(ParameterDocument {
            mask: Mask { files, lumis, events: None },
            monitoring: MonitoringIds { monitorid: monitor_id, syncid: sync_id, taskid: task_group_id.to_string() },
            arguments: None,
            output_files: outputs,
        })
    }

    /// Implements spec §4.2's ordered classification rules.
    pub fn process(
        assignment: &TaskAssignment,
        completed: &CompletedTask,
        report: Option<&ReportDocument>,
        summary: &mut ReleaseSummary,
    ) -> TaskUpdate {
        summary.exe(completed.exit_code, completed.task_id);
        if completed.result_flags != 0 {
            summary.wq(completed.result_flags, completed.task_id);
        }

        // Rule 1: a non-zero work-queue flag fails the task outright,
        // regardless of the report document or exit code.
        if completed.result_flags != 0 {
            return Self::failed_update(assignment, completed, completed.exit_code);
        }

        // Rule 2: missing or malformed report.
        let Some(report) = report else {
            return Self::failed_update(assignment, completed, EXIT_UNPARSEABLE);
        };

        // Rule 3: the document's exit code is authoritative.
        if completed.exit_code != 0 {
            return Self::failed_update(assignment, completed, completed.exit_code);
        }

        let mut processed_by_file: HashMap<&str, &ReportFileEntry> = HashMap::new();
        for entry in &report.files {
            processed_by_file.insert(entry.file_id.as_str(), entry);
        }

        let mut unit_updates = Vec::new();
        for (&unit_id, (file_id, run, lumi)) in &assignment.units {
            let entry = processed_by_file.get(file_id.as_str());
            let done = entry.map(|entry| entry.lumis.contains(&(*run, *lumi))).unwrap_or(false);
            let events_processed = entry.map(|entry| entry.events_processed).unwrap_or(0);
            unit_updates.push(UnitUpdate { unit_id, done, events_processed });
        }

        let file_updates = report
            .files
            .iter()
            .filter(|entry| entry.skipped)
            .map(|entry| FileUpdate {
                file_id: entry.file_id.clone(),
                workflow_label: assignment.workflow_label.clone(),
                skipped: true,
            })
            .collect();

        TaskUpdate {
            task_id: assignment.task_id,
            failed: false,
            exit_code: 0,
            host: completed.hostname.clone(),
            bytes_sent: completed.bytes_sent,
            bytes_received: completed.bytes_received,
            bytes_output: report.bytes_output,
            unit_updates,
            file_updates,
        }
    }

    fn failed_update(assignment: &TaskAssignment, completed: &CompletedTask, exit_code: i32) -> TaskUpdate {
        TaskUpdate {
            task_id: assignment.task_id,
            failed: true,
            exit_code,
            host: completed.hostname.clone(),
            bytes_sent: completed.bytes_sent,
            bytes_received: completed.bytes_received,
            bytes_output: 0,
            unit_updates: Vec::new(),
            file_updates: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment() -> TaskAssignment {
        let mut units = HashMap::new();
        units.insert(1, ("file-a".to_string(), 1, 0));
        units.insert(2, ("file-a".to_string(), 1, 1));
        TaskAssignment { task_id: 7, workflow_label: "w1".to_string(), units }
    }

    #[test]
    fn work_queue_flag_fails_regardless_of_exit_code() {
        let completed = CompletedTask { task_id: 7, result_flags: 16, exit_code: 0, ..Default::default() };
        let mut summary = ReleaseSummary::new();
        let update = TaskHandler::process(&assignment(), &completed, None, &mut summary);
        assert!(update.failed);
    }

    #[test]
    fn missing_report_fails_with_unparseable_code() {
        let completed = CompletedTask { task_id: 7, exit_code: 0, ..Default::default() };
        let mut summary = ReleaseSummary::new();
        let update = TaskHandler::process(&assignment(), &completed, None, &mut summary);
        assert!(update.failed);
        assert_eq!(update.exit_code, EXIT_UNPARSEABLE);
    }

    #[test]
    fn nonzero_exit_code_fails_even_with_report() {
        let completed = CompletedTask { task_id: 7, exit_code: 1, ..Default::default() };
        let report = ReportDocument { files: Vec::new(), bytes_output: 0 };
        let mut summary = ReleaseSummary::new();
        let update = TaskHandler::process(&assignment(), &completed, Some(&report), &mut summary);
        assert!(update.failed);
        assert_eq!(update.exit_code, 1);
    }

    #[test]
    fn success_marks_units_whose_files_appear_in_the_report_as_done() {
        let completed = CompletedTask { task_id: 7, exit_code: 0, ..Default::default() };
        let report = ReportDocument {
            files: vec![ReportFileEntry {
                file_id: "file-a".to_string(),
                events_processed: 200,
                lumis: vec![(1, 0), (1, 1)],
                skipped: false,
            }],
            bytes_output: 4096,
        };
        let mut summary = ReleaseSummary::new();
        let update = TaskHandler::process(&assignment(), &completed, Some(&report), &mut summary);
        assert!(!update.failed);
        assert_eq!(update.unit_updates.len(), 2);
        assert!(update.unit_updates.iter().all(|u| u.done));
    }

    #[test]
    fn lumis_missing_from_the_processed_mask_are_not_marked_done() {
        // file-a appears in the report, but only lumi (1,0) was actually
        // processed; unit 2 covers (1,1) and must revert for retry rather
        // than being marked done just because its file showed up at all.
        let completed = CompletedTask { task_id: 7, exit_code: 0, ..Default::default() };
        let report = ReportDocument {
            files: vec![ReportFileEntry {
                file_id: "file-a".to_string(),
                events_processed: 100,
                lumis: vec![(1, 0)],
                skipped: false,
            }],
            bytes_output: 2048,
        };
        let mut summary = ReleaseSummary::new();
        let update = TaskHandler::process(&assignment(), &completed, Some(&report), &mut summary);
        assert!(!update.failed);
        assert_eq!(update.unit_updates.len(), 2);
        let done_for = |unit_id: i64| update.unit_updates.iter().find(|u| u.unit_id == unit_id).unwrap().done;
        assert!(done_for(1), "unit 1 covers the reported lumi (1,0)");
        assert!(!done_for(2), "unit 2 covers lumi (1,1), which the report never lists");
    }

    #[tokio::test]
    async fn adjust_builds_a_mask_from_the_unit_assignment() {
        let storage = crate::facade::fakes::FakeStorage;
        let doc = TaskHandler::adjust(
            &assignment(),
            "group-1",
            "mon-7".to_string(),
            "sync-7".to_string(),
            vec![("report.json".to_string(), "report.json".to_string())],
            &storage,
        )
        .await
        .unwrap();

        assert_eq!(doc.mask.files, vec!["file-a".to_string()]);
        assert_eq!(doc.mask.lumis["file-a"], vec![(1, 0), (1, 1)]);
        assert_eq!(doc.monitoring.monitorid, "mon-7");
        assert_eq!(doc.monitoring.taskid, "group-1");
        assert_eq!(doc.output_files.len(), 1);
    }
}
