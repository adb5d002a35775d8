use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::task::Task;
use crate::wait::{PollPolicy, Poller, WaitError};

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '\n', '\r', '\t'];
const PARTIAL_SUFFIXES: &[&str] = &["crdownload", "part", "tmp"];
const LAST_RESORT_NAME: &str = "documento";

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No finished PDF appeared in staging within {0:?}")]
    NoFile(Duration),

    #[error("Cancelled while waiting for the exported file")]
    Cancelled,
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StagingError + '_ {
    move |source| StagingError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The single shared directory exports land in before delivery.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StagingError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Where a surface that writes the export itself should put it.
    pub fn staged_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Removes every file in the staging directory. Returns how many were
    /// removed.
    pub fn clear(&self) -> Result<usize, StagingError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
            let path = entry.map_err(io_err(&self.dir))?.path();
            if path.is_file() {
                fs::remove_file(&path).map_err(io_err(&path))?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Cleared {} stale file(s) from {}", removed, self.dir.display());
        }
        Ok(removed)
    }

    /// Newest finished PDF currently staged, with its size.
    fn newest_pdf(&self) -> Result<Option<(PathBuf, u64)>, StagingError> {
        let mut newest: Option<(PathBuf, u64, SystemTime)> = None;
        for entry in fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
            let path = entry.map_err(io_err(&self.dir))?.path();
            if !is_finished_pdf(&path) {
                continue;
            }
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if newest.as_ref().map_or(true, |(_, _, m)| modified >= *m) {
                newest = Some((path, meta.len(), modified));
            }
        }
        Ok(newest.map(|(path, size, _)| (path, size)))
    }

    /// Polls until a PDF with a non-zero size that did not change between
    /// two consecutive polls is staged.
    pub async fn wait_for_file(
        &self,
        policy: PollPolicy,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, StagingError> {
        let mut poller = Poller::new(policy, cancel);
        let mut previous: Option<(PathBuf, u64)> = None;

        loop {
            match poller.tick().await {
                Ok(_) => {}
                Err(WaitError::Cancelled) => return Err(StagingError::Cancelled),
                Err(WaitError::Timeout(limit)) => return Err(StagingError::NoFile(limit)),
            }

            let current = self.newest_pdf()?;
            if let (Some((path, size)), Some((prev_path, prev_size))) = (&current, &previous) {
                if *size > 0 && path == prev_path && size == prev_size {
                    debug!("Staged file ready: {} ({} bytes)", path.display(), size);
                    return Ok(path.clone());
                }
            }
            previous = current;
        }
    }
}

fn is_finished_pdf(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if PARTIAL_SUFFIXES.iter().any(|s| ext.eq_ignore_ascii_case(s)) => false,
        Some(ext) => ext.eq_ignore_ascii_case("pdf"),
        None => false,
    }
}

/// Moves a staged file to `dest_dir/file_name`, replacing any existing file
/// of that name. Falls back to copy + remove when a rename is impossible
/// (staging and destination on different volumes).
pub fn deliver(staged: &Path, dest_dir: &Path, file_name: &str) -> Result<PathBuf, StagingError> {
    fs::create_dir_all(dest_dir).map_err(io_err(dest_dir))?;
    let target = dest_dir.join(file_name);

    if target.exists() {
        fs::remove_file(&target).map_err(io_err(&target))?;
        debug!("Replaced existing {}", target.display());
    }

    if let Err(rename_err) = fs::rename(staged, &target) {
        debug!(
            "Rename {} -> {} failed ({}), copying instead",
            staged.display(),
            target.display(),
            rename_err
        );
        if let Err(copy_err) = fs::copy(staged, &target) {
            if target.exists() {
                if let Err(e) = fs::remove_file(&target) {
                    warn!("Failed to remove partial copy {}: {}", target.display(), e);
                }
            }
            return Err(StagingError::Io {
                path: target,
                source: copy_err,
            });
        }
        fs::remove_file(staged).map_err(io_err(staged))?;
    }

    info!("📄 Delivered {}", target.display());
    Ok(target)
}

/// Turns an arbitrary label into a PDF file name that is valid on Windows.
///
/// Removes `< > : " / \ | ? *` and line/tab characters, NFC-normalizes, trims
/// surrounding whitespace and trailing dots. Falls back to `fallback` (itself
/// sanitized) and finally to a fixed name when nothing is left.
pub fn sanitize_file_name(raw: &str, fallback: &str) -> String {
    let stem = clean(raw);
    let stem = if stem.is_empty() { clean(fallback) } else { stem };
    let stem = if stem.is_empty() {
        LAST_RESORT_NAME.to_string()
    } else {
        stem
    };
    format!("{}.pdf", stem)
}

fn clean(raw: &str) -> String {
    let normalized: String = raw.nfc().filter(|c| !FORBIDDEN.contains(c)).collect();
    normalized
        .trim()
        .trim_end_matches('.')
        .trim_end()
        .to_string()
}

/// How the delivered file is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum NamingPolicy {
    /// Name of the task's destination folder (usually the company name).
    #[default]
    FolderName,
    /// The task identifier.
    Identifier,
    /// `<folder name> - <identifier>`.
    FolderAndIdentifier,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputNaming {
    pub policy: NamingPolicy,
    pub prefix: String,
}

impl OutputNaming {
    pub fn new(policy: NamingPolicy, prefix: &str) -> Self {
        Self {
            policy,
            prefix: prefix.to_string(),
        }
    }

    pub fn file_name(&self, task: &Task) -> String {
        let base = match self.policy {
            NamingPolicy::FolderName => task.folder_name(),
            NamingPolicy::Identifier => task.identifier.clone(),
            NamingPolicy::FolderAndIdentifier => {
                format!("{} - {}", task.folder_name(), task.identifier)
            }
        };
        let raw = if clean(&base).is_empty() {
            base
        } else {
            format!("{}{}", self.prefix, base)
        };
        sanitize_file_name(&raw, &task.identifier)
    }
}
