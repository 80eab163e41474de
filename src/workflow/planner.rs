//! Execution Planner
//!
//! Owns the task-state table for one run:
//! - State transitions and attempt counts
//! - Up-to-date detection for tasks whose outputs already exist
//! - Thread, memory and job-count budget
//! - Retry decisions and cancellation of dependents

use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use log::{debug, info, warn};
use serde::Serialize;

use super::graph::{TaskGraph, TaskId, TaskNode};
use crate::config::RunConfig;
use crate::error::TaskError;
use crate::store::StateStore;

/// Lifecycle state of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    /// Waiting for inputs or upstream tasks
    Pending,
    /// Runnable as soon as the budget allows
    Ready,
    /// Currently executing
    Running,
    /// Finished, outputs present
    Succeeded,
    /// Last attempt failed; will be retried
    Failed,
    /// Failed past its attempt ceiling
    Fatal,
    /// Abandoned because an upstream task became fatal or the run stopped
    Cancelled,
}

impl TaskState {
    /// True for states a task never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Fatal | Self::Cancelled)
    }
}

/// Execution metrics for a single task.
#[derive(Debug, Clone, Default)]
pub struct TaskMetrics {
    /// When the latest attempt started
    pub start_time: Option<Instant>,
    /// When the latest attempt finished
    pub end_time: Option<Instant>,
    /// Duration of the latest attempt in milliseconds
    pub duration_ms: Option<u128>,
}

/// Everything the planner knows about one task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub state: TaskState,
    /// Attempts started so far
    pub attempts: u32,
    /// Executed (or, in a dry run, would execute) during this run
    pub ran: bool,
    /// Outputs were already up to date
    pub skipped: bool,
    pub metrics: TaskMetrics,
    pub last_error: Option<String>,
    pub exit_status: Option<i32>,
    /// Fatal task that caused the cancellation
    pub cancelled_by: Option<TaskId>,
}

impl TaskRecord {
    fn new() -> Self {
        Self {
            state: TaskState::Pending,
            attempts: 0,
            ran: false,
            skipped: false,
            metrics: TaskMetrics::default(),
            last_error: None,
            exit_status: None,
            cancelled_by: None,
        }
    }
}

/// Tasks whose state changed during [`ExecutionPlanner::promote`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub ready: Vec<TaskId>,
    pub skipped: Vec<TaskId>,
    pub cancelled: Vec<TaskId>,
}

impl Promotion {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.skipped.is_empty() && self.cancelled.is_empty()
    }
}

/// A task chosen to run, with the resources granted to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub id: TaskId,
    pub attempt: u32,
    pub threads: usize,
    pub mem_mb: u64,
}

/// What happens after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The task will run again as `attempt`.
    Retry { attempt: u32 },
    /// The task is fatal; these dependents were cancelled.
    Fatal { cancelled: Vec<TaskId> },
}

/// Schedules tasks of a [`TaskGraph`] under a resource budget.
pub struct ExecutionPlanner {
    records: Vec<TaskRecord>,
    /// Thread budget
    cores: usize,
    max_mem_mb: Option<u64>,
    max_jobs: Option<usize>,
    max_attempts: u32,
    dry_run: bool,
    /// Resources granted to running tasks
    running: HashMap<TaskId, (usize, u64)>,
    threads_in_use: usize,
    mem_in_use: u64,
}

impl ExecutionPlanner {
    /// Creates a planner for the given settings.
    pub fn new(config: &RunConfig) -> Self {
        let cores = config.cores.max(1);
        info!(
            "Creating planner: {} cores, {} MB memory, {} max jobs, {} attempt(s)",
            cores,
            config
                .max_mem_mb
                .map_or_else(|| "unlimited".to_string(), |m| m.to_string()),
            config
                .max_jobs
                .map_or_else(|| "unlimited".to_string(), |j| j.to_string()),
            config.max_attempts.max(1)
        );

        Self {
            records: Vec::new(),
            cores,
            max_mem_mb: config.max_mem_mb,
            max_jobs: config.max_jobs,
            max_attempts: config.max_attempts.max(1),
            dry_run: config.dry_run,
            running: HashMap::new(),
            threads_in_use: 0,
            mem_in_use: 0,
        }
    }

    /// Adds records for tasks the graph gained since the last call.
    pub fn sync(&mut self, graph: &TaskGraph) {
        while self.records.len() < graph.len() {
            self.records.push(TaskRecord::new());
        }
    }

    /// Moves Pending tasks forward: to Cancelled if an upstream task is
    /// fatal, to Succeeded if their outputs are already up to date, or to
    /// Ready once every upstream task has succeeded.
    pub fn promote(&mut self, graph: &TaskGraph, store: &dyn StateStore) -> Promotion {
        self.sync(graph);
        let mut promotion = Promotion::default();

        loop {
            let mut changed = false;
            for node in graph.nodes() {
                if self.records[node.id].state != TaskState::Pending {
                    continue;
                }

                if let Some(&failed) = node.deps.iter().find(|&&d| {
                    matches!(self.records[d].state, TaskState::Fatal | TaskState::Cancelled)
                }) {
                    let root = self.records[failed].cancelled_by.unwrap_or(failed);
                    let record = &mut self.records[node.id];
                    record.state = TaskState::Cancelled;
                    record.cancelled_by = Some(root);
                    promotion.cancelled.push(node.id);
                    changed = true;
                    continue;
                }

                if !node.is_resolved()
                    || !node
                        .deps
                        .iter()
                        .all(|&d| self.records[d].state == TaskState::Succeeded)
                {
                    continue;
                }

                let upstream_ran = node.deps.iter().any(|&d| self.records[d].ran);
                if !upstream_ran && is_up_to_date(node, store) {
                    debug!("{} is up to date", node.key);
                    let record = &mut self.records[node.id];
                    record.state = TaskState::Succeeded;
                    record.skipped = true;
                    promotion.skipped.push(node.id);
                    changed = true;
                } else {
                    self.records[node.id].state = TaskState::Ready;
                    promotion.ready.push(node.id);
                }
            }
            if !changed {
                break;
            }
        }
        promotion
    }

    /// Picks the next task to start, if one fits the budget.
    ///
    /// Checkpoints go first so the graph can grow early. A task asking for
    /// more threads than the whole budget is clamped to it; one asking for
    /// more memory than the budget only starts when nothing else runs.
    pub fn next_dispatch(&self, graph: &TaskGraph) -> Option<Dispatch> {
        if let Some(max_jobs) = self.max_jobs {
            if self.running.len() >= max_jobs {
                return None;
            }
        }

        let mut candidates: Vec<&TaskNode> = graph
            .nodes()
            .iter()
            .filter(|n| {
                n.id < self.records.len()
                    && matches!(self.records[n.id].state, TaskState::Ready | TaskState::Failed)
            })
            .collect();
        candidates.sort_by_key(|n| (!n.is_checkpoint(), n.id));

        for node in candidates {
            let threads = node.rule.resources.threads.clamp(1, self.cores);
            let mem_mb = node.rule.resources.mem_total_mb(threads);

            if self.threads_in_use + threads > self.cores {
                debug!(
                    "{} needs {} threads but only {} available",
                    node.key,
                    threads,
                    self.cores - self.threads_in_use
                );
                continue;
            }

            if let Some(max_mem) = self.max_mem_mb {
                if self.mem_in_use + mem_mb > max_mem {
                    if !self.running.is_empty() {
                        debug!("{} needs {} MB, waiting for memory", node.key, mem_mb);
                        continue;
                    }
                    warn!(
                        "{} asks for {} MB, more than the {} MB budget; running it alone",
                        node.key, mem_mb, max_mem
                    );
                }
            }

            return Some(Dispatch {
                id: node.id,
                attempt: self.records[node.id].attempts + 1,
                threads,
                mem_mb,
            });
        }
        None
    }

    /// Marks a task as running and reserves its resources.
    pub fn mark_running(&mut self, dispatch: &Dispatch) {
        self.running
            .insert(dispatch.id, (dispatch.threads, dispatch.mem_mb));
        self.threads_in_use += dispatch.threads;
        self.mem_in_use += dispatch.mem_mb;
        debug!(
            "Task {} started using {} threads (total: {}/{})",
            dispatch.id, dispatch.threads, self.threads_in_use, self.cores
        );

        let record = &mut self.records[dispatch.id];
        record.state = TaskState::Running;
        record.attempts = dispatch.attempt;
        record.ran = true;
        record.metrics.start_time = Some(Instant::now());
        record.metrics.end_time = None;
        record.metrics.duration_ms = None;
    }

    /// Marks a running task as succeeded.
    pub fn mark_succeeded(&mut self, id: TaskId) {
        self.release(id);
        let record = &mut self.records[id];
        record.state = TaskState::Succeeded;
        record.last_error = None;
    }

    /// Records a failed attempt and decides between retry and fatal.
    ///
    /// Non-retryable errors go straight to fatal. A fatal task cancels its
    /// transitive dependents; siblings are unaffected.
    pub fn mark_failed(&mut self, graph: &TaskGraph, id: TaskId, error: &TaskError) -> FailureOutcome {
        self.release(id);
        let node = graph.node(id);
        let ceiling = node.rule.max_attempts.unwrap_or(self.max_attempts).max(1);

        let record = &mut self.records[id];
        record.last_error = Some(error.to_string());
        record.exit_status = error.exit_status();

        if error.is_retryable() && record.attempts < ceiling {
            record.state = TaskState::Failed;
            info!(
                "{} failed attempt {}/{}; retrying",
                node.key, record.attempts, ceiling
            );
            return FailureOutcome::Retry {
                attempt: record.attempts + 1,
            };
        }

        record.state = TaskState::Fatal;
        let mut cancelled = Vec::new();
        for dependent in graph.transitive_dependents(id) {
            let record = &mut self.records[dependent];
            if matches!(
                record.state,
                TaskState::Pending | TaskState::Ready | TaskState::Failed
            ) {
                record.state = TaskState::Cancelled;
                record.cancelled_by = Some(id);
                cancelled.push(dependent);
            }
        }
        FailureOutcome::Fatal { cancelled }
    }

    /// Cancels every task that has not started. Running tasks are left to
    /// finish.
    pub fn cancel_pending(&mut self) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for (id, record) in self.records.iter_mut().enumerate() {
            if matches!(
                record.state,
                TaskState::Pending | TaskState::Ready | TaskState::Failed
            ) {
                record.state = TaskState::Cancelled;
                cancelled.push(id);
            }
        }
        cancelled
    }

    fn release(&mut self, id: TaskId) {
        if let Some((threads, mem_mb)) = self.running.remove(&id) {
            self.threads_in_use = self.threads_in_use.saturating_sub(threads);
            self.mem_in_use = self.mem_in_use.saturating_sub(mem_mb);
            debug!(
                "Task {} released {} threads (total: {}/{})",
                id, threads, self.threads_in_use, self.cores
            );
        }

        let metrics = &mut self.records[id].metrics;
        metrics.end_time = Some(Instant::now());
        if let Some(start) = metrics.start_time {
            metrics.duration_ms = Some(start.elapsed().as_millis());
        }
    }

    pub fn state(&self, id: TaskId) -> TaskState {
        self.records[id].state
    }

    pub fn record(&self, id: TaskId) -> &TaskRecord {
        &self.records[id]
    }

    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn threads_in_use(&self) -> usize {
        self.threads_in_use
    }

    pub fn mem_in_use(&self) -> u64 {
        self.mem_in_use
    }

    /// Returns true if any task can still change state.
    pub fn has_work_remaining(&self) -> bool {
        self.records.iter().any(|r| !r.state.is_terminal())
    }

    /// Returns the current progress as (finished, total).
    pub fn progress(&self) -> (usize, usize) {
        let finished = self.records.iter().filter(|r| r.state.is_terminal()).count();
        (finished, self.records.len())
    }

    /// Returns whether this is a dry run.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Outputs all exist and none is older than the newest input.
fn is_up_to_date(node: &TaskNode, store: &dyn StateStore) -> bool {
    if node.outputs.is_empty() {
        return false;
    }

    let mut oldest_output: Option<SystemTime> = None;
    for output in &node.outputs {
        match store.modified(output) {
            Some(time) => {
                oldest_output = Some(oldest_output.map_or(time, |t: SystemTime| t.min(time)))
            }
            None => return false,
        }
    }

    let mut newest_input: Option<SystemTime> = None;
    for input in &node.inputs {
        match store.modified(input) {
            Some(time) => {
                newest_input = Some(newest_input.map_or(time, |t: SystemTime| t.max(time)))
            }
            None => return false,
        }
    }

    match (oldest_output, newest_input) {
        (Some(output), Some(input)) => output >= input,
        // Declared inputs that resolved to nothing must be re-checked by running
        (Some(_), None) => node.rule.inputs.is_empty(),
        _ => false,
    }
}
