//! Per-release diagnostics aggregator (spec §4.5).
//!
//! Carries the original work-queue result bitmask verbatim so operators
//! reading logs recognise the same vocabulary the executor reports.

use std::collections::BTreeMap;
use std::fmt;

/// A work-queue-style result flag. Raw completions may set more than one
/// bit; `wq()` fans a single completion out across every flag it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultFlag(pub u32);

impl ResultFlag {
    pub const INPUT_MISSING: ResultFlag = ResultFlag(1);
    pub const OUTPUT_MISSING: ResultFlag = ResultFlag(2);
    pub const STDOUT_MISSING: ResultFlag = ResultFlag(4);
    pub const SIGNAL: ResultFlag = ResultFlag(8);
    pub const RESOURCE_EXHAUSTION: ResultFlag = ResultFlag(16);
    pub const TASK_TIMEOUT: ResultFlag = ResultFlag(32);
    pub const UNKNOWN: ResultFlag = ResultFlag(64);
    pub const FORSAKEN: ResultFlag = ResultFlag(128);
    pub const MAX_RETRIES: ResultFlag = ResultFlag(256);
    pub const TASK_MAX_RUN_TIME: ResultFlag = ResultFlag(512);

    const ALL: [(ResultFlag, &'static str); 10] = [
        (Self::INPUT_MISSING, "missing input"),
        (Self::OUTPUT_MISSING, "missing output"),
        (Self::STDOUT_MISSING, "no stdout"),
        (Self::SIGNAL, "signal received"),
        (Self::RESOURCE_EXHAUSTION, "exhausted resources"),
        (Self::TASK_TIMEOUT, "time out"),
        (Self::UNKNOWN, "unclassified error"),
        (Self::FORSAKEN, "unrelated error"),
        (Self::MAX_RETRIES, "exceed # retries"),
        (Self::TASK_MAX_RUN_TIME, "exceeded runtime"),
    ];

    pub fn label(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(flag, _)| *flag == self)
            .map(|(_, label)| *label)
            .unwrap_or("unknown")
    }
}

/// Transient per-cycle aggregator (spec §4.5). A task id may be recorded
/// under both its exit status and one or more result flags.
#[derive(Debug, Default)]
pub struct ReleaseSummary {
    by_exit_status: BTreeMap<i32, Vec<i64>>,
    by_flag: BTreeMap<u32, Vec<i64>>,
    task_dirs: BTreeMap<i64, String>,
    monitor_unavailable: Vec<i64>,
}

impl ReleaseSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exe(&mut self, exit_status: i32, task_id: i64) {
        self.by_exit_status.entry(exit_status).or_default().push(task_id);
    }

    pub fn wq(&mut self, raw_flags: u32, task_id: i64) {
        for (flag, _) in ResultFlag::ALL {
            if raw_flags & flag.0 != 0 {
                self.by_flag.entry(flag.0).or_default().push(task_id);
            }
        }
    }

    pub fn dir(&mut self, task_id: i64, task_dir: impl Into<String>) {
        self.task_dirs.insert(task_id, task_dir.into());
    }

    pub fn monitor_unavailable(&mut self, task_id: i64) {
        self.monitor_unavailable.push(task_id);
    }

    pub fn is_empty(&self) -> bool {
        self.by_exit_status.is_empty() && self.by_flag.is_empty()
    }
}

impl fmt::Display for ReleaseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "received the following task(s):")?;
        for (status, ids) in &self.by_exit_status {
            let names: Vec<String> = ids.iter().map(i64::to_string).collect();
            writeln!(f, "returned with status {}: {}", status, names.join(", "))?;
            if *status != 0 {
                writeln!(f, "parameters and logs in:")?;
                for id in ids {
                    if let Some(dir) = self.task_dirs.get(id) {
                        writeln!(f, "\t{dir}")?;
                    }
                }
            }
        }
        for (flag, ids) in &self.by_flag {
            let label = ResultFlag(*flag).label();
            let names: Vec<String> = ids.iter().map(i64::to_string).collect();
            writeln!(f, "failed due to {}: {}", label, names.join(", "))?;
            writeln!(f, "parameters and logs in:")?;
            for id in ids {
                if let Some(dir) = self.task_dirs.get(id) {
                    writeln!(f, "\t{dir}")?;
                }
            }
        }
        if !self.monitor_unavailable.is_empty() {
            let names: Vec<String> = self.monitor_unavailable.iter().map(i64::to_string).collect();
            writeln!(f, "resource monitoring unavailable for the following tasks: {}", names.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_exit_status_and_flags() {
        let mut summary = ReleaseSummary::new();
        summary.exe(0, 1);
        summary.exe(1, 2);
        summary.wq(ResultFlag::RESOURCE_EXHAUSTION.0, 2);
        summary.dir(1, "w1/successful/0/001");
        summary.dir(2, "w1/failed/0/002");

        let rendered = summary.to_string();
        assert!(rendered.contains("returned with status 0: 1"));
        assert!(rendered.contains("exhausted resources"));
        assert!(rendered.contains("w1/failed/0/002"));
    }

    #[test]
    fn a_single_flag_bit_maps_to_its_label() {
        assert_eq!(ResultFlag::TASK_TIMEOUT.label(), "time out");
        assert_eq!(ResultFlag(999_999).label(), "unknown");
    }

    #[test]
    fn empty_summary_has_no_failures() {
        assert!(ReleaseSummary::new().is_empty());
    }
}
