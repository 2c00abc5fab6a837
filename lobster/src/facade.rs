//! Façade traits at the system boundary (spec §6).
//!
//! A real, network-calling implementation of any façade is out of scope
//! (spec §1) — only the trait boundary and in-memory fakes ship here,
//! matching the teacher's `LlmClient` trait-plus-fake pattern.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

/// One task the executor façade hands back to the controller for dispatch.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub task_id: i64,
    pub category: String,
    pub command: String,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

/// A completed task as reported by the executor (spec §6).
#[derive(Debug, Clone, Default)]
pub struct CompletedTask {
    pub task_id: i64,
    pub result_flags: u32,
    pub exit_code: i32,
    pub hostname: Option<String>,
    pub bytes_sent: i64,
    pub bytes_received: i64,
}

#[async_trait]
pub trait ExecutorFacade: Send + Sync {
    async fn obtain(&self, total_cores: u32, queue_counts: &HashMap<String, u32>) -> Vec<TaskDescriptor>;
    async fn completed_tasks(&self) -> Vec<CompletedTask>;
    async fn cancel_all(&self);
}

#[async_trait]
pub trait StorageFacade: Send + Sync {
    async fn activate(&self) -> eyre::Result<()>;
    async fn preprocess(&self, pass_through: bool) -> eyre::Result<()>;
    async fn remove(&self, paths: &[PathBuf]) -> eyre::Result<()>;
}

#[async_trait]
pub trait MonitoringSink: Send + Sync {
    async fn register_run(&self);
    async fn register_task(&self, task_id: i64) -> (String, String);
    async fn update_task(&self, task_id: i64, state: &str);
    async fn free(&self);
}

#[derive(Debug, Clone, Default)]
pub struct DatasetFileInfo {
    pub id: String,
    pub events: u64,
    pub size: i64,
    pub lumis: Vec<(i64, i64)>,
}

#[derive(Debug, Clone, Default)]
pub struct DatasetInfo {
    pub files: Vec<DatasetFileInfo>,
    pub total_events: u64,
    pub total_units: u64,
}

#[async_trait]
pub trait DatasetBackend: Send + Sync {
    async fn get_info(&self) -> eyre::Result<DatasetInfo>;
}

/// In-memory fakes for the test suite (spec §6: "ships only the trait
/// boundary and the fakes").
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeExecutor {
        pub completions: Mutex<Vec<CompletedTask>>,
    }

    #[async_trait]
    impl ExecutorFacade for FakeExecutor {
        async fn obtain(&self, _total_cores: u32, _queue_counts: &HashMap<String, u32>) -> Vec<TaskDescriptor> {
            Vec::new()
        }

        async fn completed_tasks(&self) -> Vec<CompletedTask> {
            self.completions.lock().unwrap().drain(..).collect()
        }

        async fn cancel_all(&self) {}
    }

    #[derive(Default)]
    pub struct FakeStorage;

    #[async_trait]
    impl StorageFacade for FakeStorage {
        async fn activate(&self) -> eyre::Result<()> {
            Ok(())
        }

        async fn preprocess(&self, _pass_through: bool) -> eyre::Result<()> {
            Ok(())
        }

        async fn remove(&self, _paths: &[PathBuf]) -> eyre::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeMonitoringSink;

    #[async_trait]
    impl MonitoringSink for FakeMonitoringSink {
        async fn register_run(&self) {}

        async fn register_task(&self, task_id: i64) -> (String, String) {
            (format!("mon-{task_id}"), format!("sync-{task_id}"))
        }

        async fn update_task(&self, _task_id: i64, _state: &str) {}

        async fn free(&self) {}
    }

    #[derive(Default)]
    pub struct FakeDatasetBackend {
        pub info: DatasetInfo,
    }

    #[async_trait]
    impl DatasetBackend for FakeDatasetBackend {
        async fn get_info(&self) -> eyre::Result<DatasetInfo> {
            Ok(self.info.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    #[tokio::test]
    async fn fake_executor_returns_queued_completions() {
        let executor = FakeExecutor::default();
        executor.completions.lock().unwrap().push(CompletedTask {
            task_id: 1,
            exit_code: 0,
            ..Default::default()
        });
        let completed = executor.completed_tasks().await;
        assert_eq!(completed.len(), 1);
        assert!(executor.completed_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn fake_monitoring_sink_assigns_stable_ids() {
        let sink = FakeMonitoringSink;
        let (monitor_id, sync_id) = sink.register_task(42).await;
        assert_eq!(monitor_id, "mon-42");
        assert_eq!(sync_id, "sync-42");
    }
}
