use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::ErrorKind;

const HEADER_KEYS: &[&str] = &["identifier", "identificador", "cnpj", "inscricao", "inscrição"];

/// One business record to process: who, and where its document goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub identifier: String,
    pub destination: PathBuf,
    pub display_name: Option<String>,
}

impl Task {
    pub fn new(identifier: &str, destination: impl Into<PathBuf>) -> Self {
        Self {
            identifier: identifier.trim().to_string(),
            destination: destination.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        let name = name.trim();
        self.display_name = (!name.is_empty()).then(|| name.to_string());
        self
    }

    /// Human-readable label for progress messages.
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) => format!("{} ({})", name, self.identifier),
            None => self.identifier.clone(),
        }
    }

    /// Last component of the destination path.
    pub fn folder_name(&self) -> String {
        self.destination
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Keeps only ASCII digits (CNPJ and registration numbers are typed unmasked).
pub fn digits_only(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Reads `identifier,destination[,name]` rows. A header row is detected by
/// its first column and skipped; rows without an identifier or destination
/// are skipped with a warning.
pub fn load_tasks_csv(path: &Path) -> Result<Vec<Task>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open task file: {}", path.display()))?;

    let mut tasks = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record
            .with_context(|| format!("Invalid CSV at line {} of {}", line + 1, path.display()))?;

        let identifier = record.get(0).unwrap_or_default();
        if line == 0 && HEADER_KEYS.contains(&identifier.to_lowercase().as_str()) {
            debug!("Skipping header row in {}", path.display());
            continue;
        }

        let destination = record.get(1).unwrap_or_default();
        if identifier.is_empty() || destination.is_empty() {
            warn!("Skipping incomplete row {} in {}", line + 1, path.display());
            continue;
        }

        let mut task = Task::new(identifier, destination);
        if let Some(name) = record.get(2) {
            task = task.with_display_name(name);
        }
        tasks.push(task);
    }

    Ok(tasks)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded { file: Option<PathBuf> },
    Failed { kind: ErrorKind, detail: String },
}

/// Final result of one attempted task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub index: usize,
    pub identifier: String,
    pub status: TaskStatus,
    pub duration_secs: f64,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded { .. })
    }
}
