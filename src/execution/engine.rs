//! Run Execution Engine
//!
//! The core engine that drives one run from requested targets to a
//! [`RunSummary`]:
//! - Graph construction and upfront validation of every job
//! - Parallel dispatch under the thread, memory and job budgets
//! - Graph extension after each checkpoint succeeds
//! - Retries, fatal subtrees and run-wide aborts
//! - Resource monitoring and per-task reporting

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::step::{ExecOutcome, ExecutionDelegate, Job, ShellDelegate};
use crate::config::RunConfig;
use crate::error::{GraphError, RunError, TaskError};
use crate::monitoring::{
    AbortedSubtree, ExecutionTimeline, FatalTask, ResourceMonitor, RunObserver, RunOutcome,
    RunSummary, TaskEvent, TaskEventKind,
};
use crate::store::StateStore;
use crate::workflow::graph::{GraphBuilder, TaskGraph, TaskId};
use crate::workflow::model::RuleBody;
use crate::workflow::planner::{Dispatch, ExecutionPlanner, FailureOutcome, TaskState};
use crate::workflow::registry::RuleRegistry;

/// How long the scheduler waits for a completion before re-checking for
/// an abort request.
const ABORT_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Interval for resource monitoring samples.
const MONITOR_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Requests that a run stop. Pending tasks are cancelled at once; running
/// tasks are allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Message a worker sends when an attempt finishes.
struct Completion {
    id: TaskId,
    attempt: u32,
    result: Result<ExecOutcome, TaskError>,
}

/// Rule-driven execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ruleflow::{Engine, FsStore, Rule, RuleRegistry, RunConfig};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut registry = RuleRegistry::new();
///     registry.register(Rule::shell("hello", "echo hi > {output}").with_output("hello.txt"))?;
///
///     let mut engine = Engine::new(registry, Arc::new(FsStore::new(".")), RunConfig::default())?;
///     let summary = engine.run(&["hello.txt"])?;
///     println!("{}", summary.render());
///     Ok(())
/// }
/// ```
pub struct Engine {
    builder: GraphBuilder,
    delegate: Arc<dyn ExecutionDelegate>,
    config: RunConfig,
    observers: Vec<Box<dyn RunObserver>>,
    timeline: ExecutionTimeline,
    abort: AbortHandle,
    stop_flag: Option<PathBuf>,
}

impl Engine {
    /// Creates an engine over `registry`, reading and writing through
    /// `store`. Commands run with [`ShellDelegate`] in the configured
    /// working directory unless another delegate is set.
    pub fn new(
        registry: RuleRegistry,
        store: Arc<dyn StateStore>,
        config: RunConfig,
    ) -> Result<Self, GraphError> {
        let config = config.normalized();
        let delegate = Arc::new(ShellDelegate::new(config.working_dir.clone()));
        Ok(Self {
            builder: GraphBuilder::new(registry, store)?,
            delegate,
            config,
            observers: Vec::new(),
            timeline: ExecutionTimeline::new(),
            abort: AbortHandle::default(),
            stop_flag: None,
        })
    }

    /// Replaces the execution delegate used for command bodies.
    pub fn with_delegate(mut self, delegate: Arc<dyn ExecutionDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Adds an observer for task events and the final summary.
    pub fn with_observer(mut self, observer: Box<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Sets a file whose appearance aborts the run.
    pub fn set_stop_flag(&mut self, path: impl Into<PathBuf>) {
        self.stop_flag = Some(path.into());
    }

    /// Returns a handle that can abort the run from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn graph(&self) -> &TaskGraph {
        self.builder.graph()
    }

    pub fn builder(&self) -> &GraphBuilder {
        &self.builder
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    /// Runs until every target is produced or nothing more can run.
    ///
    /// Construction errors (unresolvable targets, ambiguous rules, cycles,
    /// unbound placeholders) are returned before any task executes. Task
    /// failures, checkpoint failures and aborts are reported in the
    /// returned [`RunSummary`]; use [`RunSummary::into_result`] to turn them
    /// into an error.
    pub fn run<S: AsRef<str>>(&mut self, targets: &[S]) -> Result<RunSummary, RunError> {
        let start_time = Instant::now();
        let targets: Vec<String> = targets.iter().map(|t| t.as_ref().to_string()).collect();
        let mut summary = RunSummary::new(targets.clone(), self.config.dry_run);
        self.timeline = ExecutionTimeline::new();

        self.builder.resolve_targets(&targets)?;
        self.builder.graph().topological_order()?;
        self.check_jobs(0)?;

        info!(
            "Starting execution ({} task(s), {} cores, dry run: {})",
            self.graph().len(),
            self.config.cores,
            self.config.dry_run
        );

        let mut planner = ExecutionPlanner::new(&self.config);
        planner.sync(self.graph());

        // Start resource monitoring
        let threads_in_use = Arc::new(AtomicUsize::new(0));
        let monitor_running = Arc::new(AtomicBool::new(true));
        let monitor_handle = (self.config.monitor && !self.config.dry_run).then(|| {
            let flag = Arc::clone(&monitor_running);
            let threads = Arc::clone(&threads_in_use);
            thread::spawn(move || {
                let mut monitor = ResourceMonitor::new(threads);
                while flag.load(Ordering::Relaxed) {
                    monitor.sample();
                    thread::sleep(MONITOR_SAMPLE_INTERVAL);
                }
                monitor
            })
        });

        let (tx, rx): (Sender<Completion>, Receiver<Completion>) = channel();
        let mut stop: Option<RunOutcome> = None;

        loop {
            if stop.is_none() {
                if let Some(reason) = self.stop_requested() {
                    warn!("Stopping run: {}", reason);
                    self.cancel_all(&mut planner);
                    stop = Some(RunOutcome::Aborted { reason });
                }
            }

            let mut dispatched = 0;
            if stop.is_none() {
                match self.schedule(&mut planner, &tx, &mut summary) {
                    Ok(count) => dispatched = count,
                    Err(reason) => {
                        error!("Aborting run: {}", reason);
                        self.cancel_all(&mut planner);
                        stop = Some(RunOutcome::Aborted { reason });
                    }
                }
                threads_in_use.store(planner.threads_in_use(), Ordering::Relaxed);
            }

            if planner.running_count() == 0 {
                if dispatched > 0 {
                    // Dry-run dispatches finish immediately
                    continue;
                }
                break;
            }

            let completion = match rx.recv_timeout(ABORT_CHECK_INTERVAL) {
                Ok(completion) => completion,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    error!("Completion channel closed with tasks still running");
                    break;
                }
            };

            if let Some(outcome) = self.complete(&mut planner, completion, stop.is_some()) {
                self.cancel_all(&mut planner);
                stop = Some(outcome);
            }
            threads_in_use.store(planner.threads_in_use(), Ordering::Relaxed);
        }

        if stop.is_none() && !self.config.dry_run && planner.has_work_remaining() {
            warn!("Some tasks could never become ready; cancelling them");
            self.cancel_all(&mut planner);
        }

        // Stop monitoring
        monitor_running.store(false, Ordering::Relaxed);
        if let Some(handle) = monitor_handle {
            match handle.join() {
                Ok(monitor) => {
                    debug!("{}", monitor.get_summary());
                    summary.resources = Some(monitor.peaks());
                }
                Err(_) => warn!("Monitor thread panicked"),
            }
        }

        self.fill_summary(&planner, stop, &mut summary);
        summary.finish(start_time.elapsed());
        for observer in &mut self.observers {
            observer.on_run(&summary);
        }
        Ok(summary)
    }

    /// Promotes tasks and dispatches as many as the budget allows.
    ///
    /// Returns the number of dispatches, or an abort reason when the graph
    /// cannot be extended.
    fn schedule(
        &mut self,
        planner: &mut ExecutionPlanner,
        tx: &Sender<Completion>,
        summary: &mut RunSummary,
    ) -> Result<usize, String> {
        let store = Arc::clone(self.builder.store());

        // Up-to-date checkpoints extend the graph without running
        loop {
            let promotion = planner.promote(self.builder.graph(), &*store);
            for &id in &promotion.skipped {
                self.emit(id, TaskEventKind::Skipped, |e| e);
            }
            for &id in &promotion.cancelled {
                self.emit(id, TaskEventKind::Cancelled, |e| e);
            }

            let skipped_checkpoints: Vec<TaskId> = promotion
                .skipped
                .iter()
                .copied()
                .filter(|&id| self.graph().node(id).is_checkpoint())
                .collect();
            if skipped_checkpoints.is_empty() {
                break;
            }
            for id in skipped_checkpoints {
                self.extend(planner, id)?;
            }
        }

        let mut dispatched = 0;
        while let Some(dispatch) = planner.next_dispatch(self.builder.graph()) {
            let node = self.builder.graph().node(dispatch.id);
            let job = Job::build(node, dispatch.attempt, dispatch.threads, self.builder.registry().config())
                .map_err(|e| format!("{}: {}", node.key, e))?;

            dispatched += 1;
            planner.mark_running(&dispatch);
            self.emit(dispatch.id, TaskEventKind::Started, |e| e.with_attempt(dispatch.attempt));

            if self.config.dry_run {
                self.dry_run_job(planner, &dispatch, &job, summary);
                continue;
            }

            self.launch(job, tx);
        }
        Ok(dispatched)
    }

    /// Prints a job instead of running it.
    fn dry_run_job(
        &mut self,
        planner: &mut ExecutionPlanner,
        dispatch: &Dispatch,
        job: &Job,
        summary: &mut RunSummary,
    ) {
        let node = self.builder.graph().node(dispatch.id);
        println!();
        println!("[DRY RUN] {}", job.key);
        match &node.rule.body {
            RuleBody::Command(_) => {
                println!("  Command: {}", job.command.as_deref().unwrap_or_default())
            }
            RuleBody::Procedure(procedure) => println!("  Procedure: {}", procedure.name),
        }
        println!("  Input: {:?}", job.inputs);
        println!("  Output: {:?}", job.outputs);
        println!("  Threads: {}", job.threads);
        if let Some(runtime) = job.runtime {
            println!("  Runtime: {:?}", runtime);
        }

        summary.would_run.push(job.key.to_string());
        if node.is_checkpoint() {
            println!("  Checkpoint: downstream jobs are determined after it runs");
            for consumer in self.builder.graph().nodes() {
                if consumer.awaiting.contains(&dispatch.id) {
                    let label = consumer.key.to_string();
                    if !summary.undetermined.contains(&label) {
                        summary.undetermined.push(label);
                    }
                }
            }
        }

        planner.mark_succeeded(dispatch.id);
        self.emit(dispatch.id, TaskEventKind::Succeeded, |e| {
            e.with_attempt(dispatch.attempt).with_message("dry run")
        });
    }

    /// Spawns a worker thread for one attempt.
    fn launch(&self, job: Job, tx: &Sender<Completion>) {
        let store = Arc::clone(self.builder.store());
        let node = self.builder.graph().node(job.id);
        let body = node.rule.body.clone();

        // Outputs of an earlier attempt are stale
        for output in &job.outputs {
            if let Err(e) = store.remove(output) {
                warn!("Could not remove stale output {}: {}", output, e);
            }
        }

        let delegate = Arc::clone(&self.delegate);
        let tx = tx.clone();
        thread::spawn(move || {
            let result = match &body {
                RuleBody::Command(_) => delegate.execute(&job),
                RuleBody::Procedure(procedure) => procedure
                    .run(&job, &*store)
                    .map(|()| ExecOutcome::success()),
            };
            let completion = Completion {
                id: job.id,
                attempt: job.attempt,
                result,
            };
            if let Err(e) = tx.send(completion) {
                error!("Failed to send completion signal: {}", e);
            }
        });
    }

    /// Handles a finished attempt. Returns the outcome that ends the run,
    /// if this completion ends it.
    fn complete(
        &mut self,
        planner: &mut ExecutionPlanner,
        completion: Completion,
        stopping: bool,
    ) -> Option<RunOutcome> {
        let Completion {
            id,
            attempt,
            result,
        } = completion;
        let store = Arc::clone(self.builder.store());
        let node = self.builder.graph().node(id);
        let task = node.key.to_string();
        let is_checkpoint = node.is_checkpoint();

        let result = match result {
            Ok(outcome) if outcome.is_success() => {
                let missing: Vec<String> = node
                    .outputs
                    .iter()
                    .filter(|o| !store.exists(o))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else if is_checkpoint && node.outputs.first() == missing.first() {
                    Err(TaskError::from(GraphError::MissingCheckpointOutput {
                        checkpoint: task.clone(),
                        directory: missing[0].clone(),
                    }))
                } else {
                    Err(TaskError::MissingOutput {
                        task: task.clone(),
                        missing,
                    })
                }
            }
            Ok(outcome) => Err(TaskError::Execution {
                task: task.clone(),
                attempt,
                exit_status: outcome.exit_status,
                log: outcome.log,
            }),
            Err(e) => Err(e),
        };

        let error = match result {
            Ok(()) => {
                planner.mark_succeeded(id);
                self.emit(id, TaskEventKind::Succeeded, |e| e.with_attempt(attempt));
                if is_checkpoint && !stopping {
                    if let Err(reason) = self.extend(planner, id) {
                        error!("Aborting run: {}", reason);
                        return Some(RunOutcome::Aborted { reason });
                    }
                }
                return None;
            }
            Err(error) => error,
        };

        for output in &node.outputs {
            if let Err(e) = store.remove(output) {
                warn!("Could not remove output {} of failed attempt: {}", output, e);
            }
        }

        let message = error.to_string();
        let exit_status = error.exit_status();
        match planner.mark_failed(self.builder.graph(), id, &error) {
            FailureOutcome::Retry { .. } => {
                self.emit(id, TaskEventKind::Failed { retrying: true }, |e| {
                    e.with_attempt(attempt)
                        .with_exit_status(exit_status)
                        .with_message(message)
                });
                None
            }
            FailureOutcome::Fatal { cancelled } => {
                let fatal = TaskError::FatalAfterRetries {
                    task: task.clone(),
                    attempts: attempt,
                    exit_status,
                };
                self.emit(id, TaskEventKind::Failed { retrying: false }, |e| {
                    e.with_attempt(attempt)
                        .with_exit_status(exit_status)
                        .with_message(message)
                });
                self.emit(id, TaskEventKind::Fatal, |e| {
                    e.with_attempt(attempt)
                        .with_exit_status(exit_status)
                        .with_message(fatal.to_string())
                });
                for dependent in cancelled {
                    self.emit(dependent, TaskEventKind::Cancelled, |e| {
                        e.with_message(format!("upstream {} is fatal", task))
                    });
                }
                is_checkpoint.then(|| RunOutcome::CheckpointFailed {
                    task,
                    attempts: attempt,
                })
            }
        }
    }

    /// Re-resolves the tasks waiting on a succeeded checkpoint.
    fn extend(&mut self, planner: &mut ExecutionPlanner, checkpoint: TaskId) -> Result<(), String> {
        let before = self.graph().len();
        let describe = |e: GraphError| format!("extending the graph after checkpoint failed: {}", e);

        self.builder.checkpoint_succeeded(checkpoint).map_err(describe)?;
        self.builder.graph().topological_order().map_err(describe)?;
        self.check_jobs(before).map_err(describe)?;
        planner.sync(self.builder.graph());
        Ok(())
    }

    /// Renders every job from `from` onwards at its first attempt so
    /// unbound placeholders surface before anything runs.
    fn check_jobs(&self, from: TaskId) -> Result<(), GraphError> {
        let config = self.builder.registry().config();
        for node in &self.graph().nodes()[from..] {
            let threads = node.rule.resources.threads.clamp(1, self.config.cores.max(1));
            Job::build(node, 1, threads, config)?;
        }
        Ok(())
    }

    /// Cancels everything that has not started and reports it.
    fn cancel_all(&mut self, planner: &mut ExecutionPlanner) {
        for id in planner.cancel_pending() {
            self.emit(id, TaskEventKind::Cancelled, |e| e.with_message("run stopped"));
        }
    }

    fn stop_requested(&self) -> Option<String> {
        if self.abort.is_aborted() {
            return Some("abort requested".to_string());
        }
        match &self.stop_flag {
            Some(path) if path.exists() => Some(format!("stop flag {} found", path.display())),
            _ => None,
        }
    }

    fn emit<F>(&mut self, id: TaskId, kind: TaskEventKind, decorate: F)
    where
        F: FnOnce(TaskEvent) -> TaskEvent,
    {
        let node = self.builder.graph().node(id);
        let event = decorate(TaskEvent::new(
            id,
            node.key.to_string(),
            node.rule.id.clone(),
            kind,
        ));
        self.timeline.on_task(&event);
        for observer in &mut self.observers {
            observer.on_task(&event);
        }
    }

    fn fill_summary(
        &self,
        planner: &ExecutionPlanner,
        stop: Option<RunOutcome>,
        summary: &mut RunSummary,
    ) {
        let graph = self.graph();
        let mut subtrees: BTreeMap<TaskId, Vec<String>> = BTreeMap::new();

        for (id, record) in planner.records().iter().enumerate() {
            let label = graph.node(id).key.to_string();
            match record.state {
                TaskState::Succeeded if record.skipped => summary.skipped += 1,
                TaskState::Succeeded if !self.config.dry_run => summary.succeeded += 1,
                TaskState::Fatal => summary.fatal.push(FatalTask {
                    task: label,
                    attempts: record.attempts,
                    exit_status: record.exit_status,
                    error: record.last_error.clone(),
                }),
                TaskState::Cancelled => match record.cancelled_by {
                    Some(root) => subtrees.entry(root).or_default().push(label),
                    None => summary.cancelled.push(label),
                },
                _ => {}
            }
        }

        summary.aborted_subtrees = subtrees
            .into_iter()
            .map(|(root, cancelled)| AbortedSubtree {
                root: graph.node(root).key.to_string(),
                cancelled,
            })
            .collect();

        summary.outcome = match stop {
            Some(outcome) => outcome,
            None if !summary.fatal.is_empty() => RunOutcome::Failed,
            None => RunOutcome::Completed,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::workflow::model::{Procedure, Rule};
    use std::fs;
    use tempfile::tempdir;

    /// Procedure that writes "done" to each output.
    fn touch() -> Procedure {
        Procedure::new("touch", |job, store| {
            for output in &job.outputs {
                store.write(output, "done")?;
            }
            Ok(())
        })
    }

    fn chain_registry() -> RuleRegistry {
        let mut registry = RuleRegistry::new();
        registry
            .register(Rule::procedure("first", touch()).with_output("a.txt"))
            .unwrap();
        registry
            .register(
                Rule::procedure("second", touch())
                    .with_input("a.txt")
                    .with_output("b.txt"),
            )
            .unwrap();
        registry
    }

    fn config() -> RunConfig {
        RunConfig::default().with_cores(2).with_monitor(false)
    }

    #[test]
    fn test_runs_chain() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = Engine::new(chain_registry(), store.clone(), config()).unwrap();

        let summary = engine.run(&["b.txt"]).unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.succeeded, 2);
        assert_eq!(store.read("b.txt").unwrap(), "done");
        assert_eq!(engine.timeline().get_durations().len(), 2);
    }

    #[test]
    fn test_second_run_is_up_to_date() {
        let store = Arc::new(MemoryStore::new());
        Engine::new(chain_registry(), store.clone(), config())
            .unwrap()
            .run(&["b.txt"])
            .unwrap();

        let summary = Engine::new(chain_registry(), store, config())
            .unwrap()
            .run(&["b.txt"])
            .unwrap();
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.skipped, 2);
    }

    #[test]
    fn test_dry_run_executes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut engine =
            Engine::new(chain_registry(), store.clone(), config().with_dry_run(true)).unwrap();

        let summary = engine.run(&["b.txt"]).unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.would_run, vec!["first", "second"]);
        assert!(store.paths().is_empty());
    }

    #[test]
    fn test_unbound_placeholder_fails_before_execution() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = RuleRegistry::new();
        registry
            .register(Rule::shell("bad", "tool --x {params.missing} > {output}").with_output("x.txt"))
            .unwrap();
        let mut engine = Engine::new(registry, store.clone(), config()).unwrap();

        let result = engine.run(&["x.txt"]);
        assert!(matches!(
            result,
            Err(RunError::Graph(GraphError::Pattern(_)))
        ));
        assert!(store.paths().is_empty());
    }

    #[test]
    fn test_abort_handle_cancels_pending() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = Engine::new(chain_registry(), store.clone(), config()).unwrap();
        engine.abort_handle().abort();

        let summary = engine.run(&["b.txt"]).unwrap();

        assert!(matches!(summary.outcome, RunOutcome::Aborted { .. }));
        assert_eq!(summary.cancelled.len(), 2);
        assert!(store.paths().is_empty());
    }

    #[test]
    fn test_stop_flag_aborts() {
        let dir = tempdir().unwrap();
        let flag = dir.path().join("stop.flag");
        fs::write(&flag, "").unwrap();

        let store = Arc::new(MemoryStore::new());
        let mut engine = Engine::new(chain_registry(), store, config()).unwrap();
        engine.set_stop_flag(&flag);

        let summary = engine.run(&["b.txt"]).unwrap();
        assert!(summary.outcome.to_string().contains("stop flag"));
    }

    #[test]
    fn test_missing_output_is_a_failure() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = RuleRegistry::new();
        registry
            .register(
                Rule::procedure("lazy", Procedure::new("noop", |_, _| Ok(()))).with_output("x.txt"),
            )
            .unwrap();
        let mut engine = Engine::new(registry, store, config()).unwrap();

        let summary = engine.run(&["x.txt"]).unwrap();

        assert_eq!(summary.outcome, RunOutcome::Failed);
        assert_eq!(summary.fatal.len(), 1);
        assert!(summary.fatal[0]
            .error
            .as_deref()
            .unwrap()
            .contains("did not produce"));
    }
}
