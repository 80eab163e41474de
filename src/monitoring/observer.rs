//! Run Observers
//!
//! Hooks the engine calls as tasks change state and once the run is over.

use std::time::Instant;

use log::{debug, error, info, warn};

use super::summary::RunSummary;
use crate::workflow::graph::TaskId;

/// What happened to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEventKind {
    /// An attempt started
    Started,
    /// The attempt succeeded and outputs were verified
    Succeeded,
    /// Outputs were already up to date
    Skipped,
    /// An attempt failed; `retrying` is false when the task went fatal
    Failed { retrying: bool },
    /// The task exhausted its attempts
    Fatal,
    /// An upstream failure or an abort abandoned the task
    Cancelled,
}

/// A state change of one task.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub id: TaskId,
    /// Display label, e.g. `fetch[sample=s1,unit=unit.0]`
    pub task: String,
    pub rule: String,
    pub kind: TaskEventKind,
    pub attempt: u32,
    pub exit_status: Option<i32>,
    pub message: Option<String>,
    pub timestamp: Instant,
}

impl TaskEvent {
    pub fn new(id: TaskId, task: impl Into<String>, rule: impl Into<String>, kind: TaskEventKind) -> Self {
        Self {
            id,
            task: task.into(),
            rule: rule.into(),
            kind,
            attempt: 0,
            exit_status: None,
            message: None,
            timestamp: Instant::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_exit_status(mut self, exit_status: Option<i32>) -> Self {
        self.exit_status = exit_status;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Receives task events and the final summary of a run.
pub trait RunObserver: Send {
    fn on_task(&mut self, event: &TaskEvent);

    fn on_run(&mut self, _summary: &RunSummary) {}
}

/// Writes every event through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RunObserver for LogObserver {
    fn on_task(&mut self, event: &TaskEvent) {
        let detail = event
            .message
            .as_deref()
            .map(|m| format!(": {}", m))
            .unwrap_or_default();

        match &event.kind {
            TaskEventKind::Started => info!("Starting {} (attempt {})", event.task, event.attempt),
            TaskEventKind::Succeeded => info!("Completed {}", event.task),
            TaskEventKind::Skipped => debug!("Skipping {}, outputs are up to date", event.task),
            TaskEventKind::Failed { retrying: true } => warn!(
                "{} failed on attempt {}{}; retrying",
                event.task, event.attempt, detail
            ),
            TaskEventKind::Failed { retrying: false } => error!(
                "{} failed on attempt {}{}",
                event.task, event.attempt, detail
            ),
            TaskEventKind::Fatal => error!(
                "{} is fatal after {} attempt(s){}",
                event.task, event.attempt, detail
            ),
            TaskEventKind::Cancelled => warn!("Cancelled {}{}", event.task, detail),
        }
    }

    fn on_run(&mut self, summary: &RunSummary) {
        if summary.is_success() {
            info!(
                "Run completed: {} succeeded, {} up to date",
                summary.succeeded, summary.skipped
            );
        } else {
            error!("Run failed: {}", summary.outcome);
        }
    }
}
