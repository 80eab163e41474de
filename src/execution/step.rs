//! Job Construction and Command Execution
//!
//! A [`Job`] is one attempt of one task with every path, parameter and
//! resource made concrete. Command bodies are handed to an
//! [`ExecutionDelegate`]; the default [`ShellDelegate`] runs them as bash
//! scripts:
//! - Placeholder substitution happens when the job is built
//! - Output directories are created up front
//! - The wall-clock budget is enforced by killing the child
//! - stdout and stderr go to the rule's log file when one is declared

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use once_cell::sync::Lazy;

use crate::config::{config_value, UserConfig};
use crate::error::{PatternError, TaskError};
use crate::workflow::graph::{TaskId, TaskKey, TaskNode};
use crate::workflow::wildcards::Template;

/// Directory for generated job scripts.
static SCRIPT_DIR: Lazy<PathBuf> =
    Lazy::new(|| std::env::temp_dir().join(format!("ruleflow_scripts_{}", std::process::id())));

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One attempt of one task, fully rendered.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: TaskId,
    pub key: TaskKey,
    pub attempt: u32,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub log: Option<String>,
    pub params: BTreeMap<String, String>,
    pub threads: usize,
    /// Total memory for all threads
    pub mem_mb: u64,
    /// Wall-clock budget for this attempt
    pub runtime: Option<Duration>,
    /// Rendered command, for command rules
    pub command: Option<String>,
    pub checkpoint: bool,
}

impl Job {
    /// Builds the job for `attempt` of `node`, granted `threads` threads.
    ///
    /// Fails if the command uses a placeholder nothing can fill.
    pub fn build(
        node: &TaskNode,
        attempt: u32,
        threads: usize,
        config: &UserConfig,
    ) -> Result<Self, PatternError> {
        let rule = &node.rule;
        let mut job = Self {
            id: node.id,
            key: node.key.clone(),
            attempt,
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
            log: node.log.clone(),
            params: rule.param_values(&node.key.binding)?,
            threads,
            mem_mb: rule.resources.mem_total_mb(threads),
            runtime: rule.resources.runtime_for(attempt),
            command: None,
            checkpoint: rule.checkpoint,
        };
        if let Some(template) = rule.command() {
            job.command = Some(render_command(template, &job, config)?);
        }
        Ok(job)
    }
}

/// Fills a command template from a job.
///
/// Supported placeholders: `{input}`, `{output}`, `{input[i]}`,
/// `{output[i]}`, `{log}`, `{threads}`, `{attempt}`, `{wildcards.NAME}`,
/// `{params.NAME}`, `{config.KEY}`, `{resources.mem_mb}` and
/// `{resources.runtime}` (minutes).
pub fn render_command(template: &str, job: &Job, config: &UserConfig) -> Result<String, PatternError> {
    Template::parse(template)?.render_with(|name| lookup(name, job, config))
}

fn lookup(name: &str, job: &Job, config: &UserConfig) -> Option<String> {
    match name {
        "input" => return Some(job.inputs.join(" ")),
        "output" => return Some(job.outputs.join(" ")),
        "log" => return job.log.clone(),
        "threads" => return Some(job.threads.to_string()),
        "attempt" => return Some(job.attempt.to_string()),
        "resources.mem_mb" => return Some(job.mem_mb.to_string()),
        "resources.runtime" => return job.runtime.map(|r| (r.as_secs() / 60).to_string()),
        _ => {}
    }

    if let Some(index) = indexed(name, "input") {
        return job.inputs.get(index).cloned();
    }
    if let Some(index) = indexed(name, "output") {
        return job.outputs.get(index).cloned();
    }

    let (scope, key) = name.split_once('.')?;
    match scope {
        "wildcards" => job.key.binding.get(key).cloned(),
        "params" => job.params.get(key).cloned(),
        "config" => config_value(config, key),
        _ => None,
    }
}

/// Parses `input[3]` style names.
fn indexed(name: &str, base: &str) -> Option<usize> {
    name.strip_prefix(base)?
        .strip_prefix('[')?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Result of running a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Exit status; `None` if the process was killed by a signal
    pub exit_status: Option<i32>,
    /// Where stdout/stderr were captured
    pub log: Option<PathBuf>,
}

impl ExecOutcome {
    pub fn success() -> Self {
        Self {
            exit_status: Some(0),
            log: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Runs rendered commands.
pub trait ExecutionDelegate: Send + Sync {
    /// Runs `job.command`. A non-zero exit is reported in the outcome, not
    /// as an error; errors are for commands that could not run or timed out.
    fn execute(&self, job: &Job) -> Result<ExecOutcome, TaskError>;
}

/// Runs commands as bash scripts in a working directory.
#[derive(Debug, Clone, Default)]
pub struct ShellDelegate {
    working_dir: Option<PathBuf>,
}

impl ShellDelegate {
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self { working_dir }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.working_dir {
            Some(dir) => dir.join(path),
            None => PathBuf::from(path),
        }
    }
}

impl ExecutionDelegate for ShellDelegate {
    fn execute(&self, job: &Job) -> Result<ExecOutcome, TaskError> {
        let task = job.key.to_string();
        let launch = |source: std::io::Error| TaskError::Launch {
            task: task.clone(),
            source,
        };

        let command = job.command.as_deref().ok_or_else(|| TaskError::Procedure {
            task: task.clone(),
            message: "job has no command".to_string(),
        })?;

        ensure_output_directories(&job.outputs, &self.working_dir).map_err(launch)?;
        let script_path = create_execution_script(job, command).map_err(launch)?;

        let log_path = job.log.as_deref().map(|l| self.resolve(l));
        let (stdout, stderr) = match &log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(launch)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(launch)?;
                let err = file.try_clone().map_err(launch)?;
                (Stdio::from(file), Stdio::from(err))
            }
            None => (Stdio::piped(), Stdio::piped()),
        };

        let mut cmd = Command::new("bash");
        cmd.arg(&script_path).stdout(stdout).stderr(stderr);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
            debug!("Executing {} in directory: {}", task, dir.display());
        }

        let result = run_with_budget(&mut cmd, job, &task);

        if let Err(e) = fs::remove_file(&script_path) {
            warn!("Failed to clean up script {}: {}", script_path.display(), e);
        }

        let exit_status = result?;
        if exit_status != Some(0) {
            error!(
                "{} failed with exit code: {:?}{}",
                task,
                exit_status,
                log_path
                    .as_ref()
                    .map(|p| format!(" (log: {})", p.display()))
                    .unwrap_or_default()
            );
        }
        Ok(ExecOutcome {
            exit_status,
            log: log_path,
        })
    }
}

/// Spawns the command and waits for it, killing it past the job's budget.
fn run_with_budget(cmd: &mut Command, job: &Job, task: &str) -> Result<Option<i32>, TaskError> {
    let mut child = cmd.spawn().map_err(|source| TaskError::Launch {
        task: task.to_string(),
        source,
    })?;

    // Piped output is drained on threads so a chatty command can't block.
    let drain = |stream: Option<Box<dyn Read + Send>>, label: &'static str| {
        let task = task.to_string();
        stream.map(|mut s| {
            thread::spawn(move || {
                let mut text = String::new();
                if s.read_to_string(&mut text).is_ok() && !text.trim().is_empty() {
                    debug!("{} {}:\n{}", task, label, text);
                }
            })
        })
    };
    let stdout = drain(
        child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
        "stdout",
    );
    let stderr = drain(
        child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
        "stderr",
    );

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                return Err(TaskError::Launch {
                    task: task.to_string(),
                    source,
                })
            }
        }

        if let Some(budget) = job.runtime {
            if started.elapsed() > budget {
                warn!("{} exceeded its {:?} budget; killing it", task, budget);
                let _ = child.kill();
                let _ = child.wait();
                return Err(TaskError::Timeout {
                    task: task.to_string(),
                    attempt: job.attempt,
                    budget_secs: budget.as_secs(),
                });
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    for handle in [stdout, stderr].into_iter().flatten() {
        let _ = handle.join();
    }
    Ok(status.code())
}

/// Creates parent directories for output files.
fn ensure_output_directories(
    output_files: &[String],
    working_dir: &Option<PathBuf>,
) -> std::io::Result<()> {
    for output_file in output_files {
        if output_file.is_empty() {
            continue;
        }

        let output_path = match working_dir {
            Some(dir) => dir.join(output_file),
            None => PathBuf::from(output_file),
        };

        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }
    Ok(())
}

/// Writes the job's command into a bash script.
fn create_execution_script(job: &Job, command_text: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(SCRIPT_DIR.as_path())?;

    let script_path = script_path(SCRIPT_DIR.as_path(), job);
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -euo pipefail")?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

fn script_path(dir: &Path, job: &Job) -> PathBuf {
    dir.join(format!("task_{}_{}_{}.sh", job.key.rule, job.id, job.attempt))
}
