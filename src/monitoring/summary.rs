//! Run Summary
//!
//! What a finished run reports: counts, every fatal task with its attempt
//! count and exit status, every abandoned subtree, the branches a dry run
//! could not see past, and peak resource usage. Serialises to the JSON run
//! report.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local};
use colored::Colorize;
use serde::Serialize;

use super::resource::ResourcePeaks;
use crate::error::{RunError, StoreError};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every requested target is present
    Completed,
    /// Some tasks were fatal; independent branches still ran
    Failed,
    /// A checkpoint was fatal, so the graph could not be completed
    CheckpointFailed { task: String, attempts: u32 },
    /// Stopped by an abort request or a graph extension error
    Aborted { reason: String },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "one or more tasks failed"),
            Self::CheckpointFailed { task, attempts } => {
                write!(f, "checkpoint {} failed after {} attempt(s)", task, attempts)
            }
            Self::Aborted { reason } => write!(f, "aborted: {}", reason),
        }
    }
}

/// A task that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatalTask {
    pub task: String,
    pub attempts: u32,
    pub exit_status: Option<i32>,
    pub error: Option<String>,
}

/// Tasks abandoned because of one fatal task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbortedSubtree {
    pub root: String,
    pub cancelled: Vec<String>,
}

/// Final report of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub duration_ms: u64,
    pub targets: Vec<String>,
    pub dry_run: bool,
    pub outcome: RunOutcome,
    /// Tasks that ran and succeeded
    pub succeeded: usize,
    /// Tasks whose outputs were already up to date
    pub skipped: usize,
    /// Jobs a dry run would execute
    pub would_run: Vec<String>,
    pub fatal: Vec<FatalTask>,
    pub aborted_subtrees: Vec<AbortedSubtree>,
    /// Tasks cancelled by an abort rather than an upstream failure
    pub cancelled: Vec<String>,
    /// Checkpoints a dry run did not execute, so their consumers are unknown
    pub undetermined: Vec<String>,
    pub resources: Option<ResourcePeaks>,
}

impl RunSummary {
    /// Creates an empty summary for a run starting now.
    pub fn new(targets: Vec<String>, dry_run: bool) -> Self {
        let now = Local::now();
        Self {
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            targets,
            dry_run,
            outcome: RunOutcome::Completed,
            succeeded: 0,
            skipped: 0,
            would_run: Vec::new(),
            fatal: Vec::new(),
            aborted_subtrees: Vec::new(),
            cancelled: Vec::new(),
            undetermined: Vec::new(),
            resources: None,
        }
    }

    /// Stamps the finish time.
    pub fn finish(&mut self, elapsed: Duration) {
        self.finished_at = Local::now();
        self.duration_ms = elapsed.as_millis() as u64;
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// Converts a failed run into the matching [`RunError`].
    pub fn into_result(self) -> Result<Self, RunError> {
        match &self.outcome {
            RunOutcome::Completed => Ok(self),
            RunOutcome::Failed => Err(RunError::TasksFailed {
                fatal: self.fatal.len(),
                cancelled: self.aborted_subtrees.iter().map(|s| s.cancelled.len()).sum(),
            }),
            RunOutcome::CheckpointFailed { task, attempts } => Err(RunError::CheckpointFailed {
                task: task.clone(),
                attempts: *attempts,
            }),
            RunOutcome::Aborted { reason } => Err(RunError::Aborted(reason.clone())),
        }
    }

    /// Renders a coloured, human-readable report.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let status = if self.is_success() {
            "Run completed".green().bold()
        } else {
            format!("Run failed: {}", self.outcome).red().bold()
        };
        out.push_str(&format!("{}\n", status));
        out.push_str(&format!(
            "Total execution time: {:.2?}\n",
            Duration::from_millis(self.duration_ms)
        ));

        if self.dry_run {
            out.push_str(&format!("Would run: {} job(s)\n", self.would_run.len()));
            if !self.undetermined.is_empty() {
                out.push_str(&format!(
                    "{}\n",
                    format!(
                        "Waiting on checkpoints that have not run: {}",
                        self.undetermined.join(", ")
                    )
                    .yellow()
                ));
            }
        } else {
            out.push_str(&format!(
                "Succeeded: {}, up to date: {}\n",
                self.succeeded, self.skipped
            ));
        }

        for fatal in &self.fatal {
            let status = fatal
                .exit_status
                .map_or_else(|| "none".to_string(), |s| s.to_string());
            out.push_str(&format!(
                "  {} {} (attempts: {}, exit status: {})\n",
                "FATAL".red(),
                fatal.task,
                fatal.attempts,
                status
            ));
            if let Some(error) = &fatal.error {
                out.push_str(&format!("        {}\n", error));
            }
        }

        for subtree in &self.aborted_subtrees {
            out.push_str(&format!(
                "  {} {} task(s) behind {}\n",
                "ABANDONED".yellow(),
                subtree.cancelled.len(),
                subtree.root
            ));
        }

        if !self.cancelled.is_empty() {
            out.push_str(&format!(
                "  {} {} task(s) not started\n",
                "CANCELLED".yellow(),
                self.cancelled.len()
            ));
        }

        if let Some(peaks) = &self.resources {
            out.push_str(&format!(
                "Peak CPU: {:.1}%, peak memory: {} MB, peak threads: {}\n",
                peaks.peak_cpu, peaks.peak_memory_mb, peaks.peak_threads
            ));
        }
        out
    }

    /// Writes the summary as pretty JSON.
    pub fn write_report(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|e| {
            StoreError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }
        fs::write(path, json).map_err(|e| StoreError::io(path, e))
    }
}
