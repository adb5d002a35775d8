use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

use crate::task::{TaskOutcome, TaskStatus};

/// Summary of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub outcomes: Vec<TaskOutcome>,
    /// Tasks never started, because the run was cancelled or aborted.
    pub skipped: usize,
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    run_id: String,
    index: usize,
    identifier: &'a str,
    status: &'static str,
    file: String,
    error_kind: String,
    detail: &'a str,
    duration_secs: f64,
}

impl RunReport {
    pub fn new(workflow: &str) -> Self {
        let now = Local::now();
        Self {
            run_id: Uuid::new_v4(),
            workflow: workflow.to_string(),
            started_at: now,
            finished_at: now,
            outcomes: Vec::new(),
            skipped: 0,
            cancelled: false,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Local::now();
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    pub fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            (self.succeeded() as f64 / self.outcomes.len() as f64) * 100.0
        }
    }

    fn format_duration(&self) -> String {
        let total_secs = self.duration_secs() as u64;
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    pub fn display(&self) {
        println!("\n╔══════════════════════════════════════════════════════════╗");
        println!("║              RUN REPORT                                  ║");
        println!("╠══════════════════════════════════════════════════════════╣");
        println!("║  Workflow:                {:>30} ║", self.workflow);
        println!("║  Tasks Attempted:         {:>30} ║", self.outcomes.len());
        println!("║  Successful:              {:>30} ║", self.succeeded());
        println!("║  Failed:                  {:>30} ║", self.failed());
        println!("║  Skipped:                 {:>30} ║", self.skipped);
        println!("║  Duration:                {:>30} ║", self.format_duration());
        println!("║  Success Rate:            {:>27.1}%   ║", self.success_rate());

        let status = if self.cancelled {
            "⏹️  CANCELLED"
        } else if self.failed() == 0 {
            "🟢 COMPLETE"
        } else if self.success_rate() >= 50.0 {
            "🟡 PARTIAL"
        } else {
            "🔴 MOSTLY FAILED"
        };
        println!("║  Status:                  {:>30}║", status);
        println!("╚══════════════════════════════════════════════════════════╝\n");

        for outcome in self.outcomes.iter().filter(|o| !o.is_success()) {
            if let TaskStatus::Failed { kind, detail } = &outcome.status {
                println!("  ❌ #{} {} [{}] {}", outcome.index + 1, outcome.identifier, kind, detail);
            }
        }
    }

    /// One row per attempted task.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;

        for outcome in &self.outcomes {
            let (status, file, error_kind, detail) = match &outcome.status {
                TaskStatus::Succeeded { file } => (
                    "succeeded",
                    file.as_ref()
                        .map(|f| f.display().to_string())
                        .unwrap_or_default(),
                    String::new(),
                    "",
                ),
                TaskStatus::Failed { kind, detail } => {
                    ("failed", String::new(), kind.to_string(), detail.as_str())
                }
            };
            writer.serialize(CsvRow {
                run_id: self.run_id.to_string(),
                index: outcome.index,
                identifier: &outcome.identifier,
                status,
                file,
                error_kind,
                detail,
                duration_secs: outcome.duration_secs,
            })?;
        }

        writer.flush().context("Failed to write report file")?;
        Ok(())
    }
}
