//! Converts one MERGE task's executor result into a [`unitstore::TaskUpdate`]
//! (spec §4.3).
//!
//! Component retirement (components -> MERGED on success, components stay
//! DONE on failure) is handled inside `unitstore::UnitStore::update_units`
//! once it sees `TaskType::Merge`; this handler only needs to classify the
//! merge task itself the same way `TaskHandler` classifies a PROCESS task.

use eyre::Context;

use crate::facade::{CompletedTask, StorageFacade};
use crate::release_summary::ReleaseSummary;
use crate::task_handler::{Mask, MonitoringIds, ParameterDocument, EXIT_UNPARSEABLE};
use std::collections::HashMap;
use unitstore::TaskUpdate;

/// Parsed merged `report.json`: just enough to know the merge succeeded and
/// how many bytes the merged output weighs.
#[derive(Debug, Clone, Default)]
pub struct MergeReportDocument {
    pub bytes_output: i64,
}

pub struct MergeTaskHandler;

impl MergeTaskHandler {
    /// Same ordered classification as `TaskHandler::process` (spec §4.2
    /// rules 1-3), but merge tasks have no per-unit mask of their own: the
    /// component PROCESS tasks' units follow whatever the store decides.
    pub fn process(
        merge_task_id: i64,
        completed: &CompletedTask,
        report: Option<&MergeReportDocument>,
        summary: &mut ReleaseSummary,
    ) -> TaskUpdate {
        summary.exe(completed.exit_code, merge_task_id);
        if completed.result_flags != 0 {
            summary.wq(completed.result_flags, merge_task_id);
        }

        if completed.result_flags != 0 {
            return Self::failed(merge_task_id, completed, completed.exit_code);
        }

        let Some(report) = report else {
            return Self::failed(merge_task_id, completed, EXIT_UNPARSEABLE);
        };

        if completed.exit_code != 0 {
            return Self::failed(merge_task_id, completed, completed.exit_code);
        }

        TaskUpdate {
            task_id: merge_task_id,
            failed: false,
            exit_code: 0,
            host: completed.hostname.clone(),
            bytes_sent: completed.bytes_sent,
            bytes_received: completed.bytes_received,
            bytes_output: report.bytes_output,
            unit_updates: Vec::new(),
            file_updates: Vec::new(),
        }
    }

    /// Implements spec §4.3's `adjust` for a merge task: the mask lists the
    /// component tasks' output files as its inputs (there is no per-lumi
    /// mask — a merge consumes whole component outputs, not unit slices).
    pub async fn adjust(
        task_group_id: &str,
        monitor_id: String,
        sync_id: String,
        component_input_files: Vec<String>,
        outputs: Vec<(String, String)>,
        storage: &dyn StorageFacade,
    ) -> eyre::Result<ParameterDocument> {
        storage
            .preprocess(true)
            .await
            .context("storage facade preprocess failed while adjusting merge task")?;

        let mut files = component_input_files;
        files.sort();

        Ok(ParameterDocument {
            mask: Mask { files, lumis: HashMap::new(), events: None },
            monitoring: MonitoringIds { monitorid: monitor_id, syncid: sync_id, taskid: task_group_id.to_string() },
            arguments: None,
            output_files: outputs,
        })
    }

    fn failed(merge_task_id: i64, completed: &CompletedTask, exit_code: i32) -> TaskUpdate {
        TaskUpdate {
            task_id: merge_task_id,
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

    #[test]
    fn successful_merge_carries_output_bytes() {
        let completed = CompletedTask { task_id: 99, exit_code: 0, ..Default::default() };
        let report = MergeReportDocument { bytes_output: 4096 };
        let mut summary = ReleaseSummary::new();
        let update = MergeTaskHandler::process(99, &completed, Some(&report), &mut summary);
        assert!(!update.failed);
        assert_eq!(update.bytes_output, 4096);
    }

    #[tokio::test]
    async fn adjust_lists_component_outputs_as_the_mask() {
        let storage = crate::facade::fakes::FakeStorage;
        let doc = MergeTaskHandler::adjust(
            "group-1",
            "mon-99".to_string(),
            "sync-99".to_string(),
            vec!["task-3/output.root".to_string(), "task-1/output.root".to_string()],
            vec![("output.root".to_string(), "output.root".to_string())],
            &storage,
        )
        .await
        .unwrap();
        assert_eq!(doc.mask.files, vec!["task-1/output.root".to_string(), "task-3/output.root".to_string()]);
        assert!(doc.mask.lumis.is_empty());
        assert_eq!(doc.monitoring.taskid, "group-1");
    }

    #[test]
    fn failed_merge_leaves_components_alone() {
        let completed = CompletedTask { task_id: 99, exit_code: 1, ..Default::default() };
        let mut summary = ReleaseSummary::new();
        let update = MergeTaskHandler::process(99, &completed, Some(&MergeReportDocument::default()), &mut summary);
        assert!(update.failed);
        assert!(update.unit_updates.is_empty());
    }

    #[test]
    fn missing_report_is_unparseable() {
        let completed = CompletedTask { task_id: 99, exit_code: 0, ..Default::default() };
        let mut summary = ReleaseSummary::new();
        let update = MergeTaskHandler::process(99, &completed, None, &mut summary);
        assert_eq!(update.exit_code, EXIT_UNPARSEABLE);
    }
}
