//! Run Configuration
//!
//! [`RunConfig`] holds engine settings: the resource budget, the retry
//! ceiling and run modes. It is read from the `settings:` section of a rule
//! file and then overridden from the command line.
//!
//! [`UserConfig`] is the free-form `config:` section. It belongs to the
//! pipeline, not the engine, and is handed to rules explicitly.

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::debug;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Free-form pipeline configuration, available to commands as `{config.KEY}`.
pub type UserConfig = BTreeMap<String, serde_yaml::Value>;

/// Engine settings for one run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Thread budget shared by all running tasks
    pub cores: usize,

    /// Memory budget in megabytes; `None` disables the check
    pub max_mem_mb: Option<u64>,

    /// Maximum concurrently running tasks; `None` means no limit
    pub max_jobs: Option<usize>,

    /// Attempts per task before it becomes fatal (1 = no retry)
    pub max_attempts: u32,

    /// List the jobs that would run without executing them
    pub dry_run: bool,

    /// Directory relative rule paths resolve against
    pub working_dir: Option<PathBuf>,

    /// Sample system CPU and memory while the run is active
    pub monitor: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cores: num_cpus::get(),
            max_mem_mb: None,
            max_jobs: None,
            max_attempts: 1,
            dry_run: false,
            working_dir: None,
            monitor: true,
        }
    }
}

impl RunConfig {
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    pub fn with_max_mem_mb(mut self, mem_mb: u64) -> Self {
        self.max_mem_mb = Some(mem_mb);
        self
    }

    pub fn with_max_jobs(mut self, jobs: usize) -> Self {
        self.max_jobs = Some(jobs);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_monitor(mut self, monitor: bool) -> Self {
        self.monitor = monitor;
        self
    }

    /// Fills in the memory budget from the machine's total memory if unset.
    pub fn with_detected_memory(mut self) -> Self {
        if self.max_mem_mb.is_none() {
            self.max_mem_mb = Some(detect_memory_mb());
        }
        self
    }

    /// Clamps nonsensical values: at least one core and one attempt.
    pub fn normalized(mut self) -> Self {
        self.cores = self.cores.max(1);
        self.max_attempts = self.max_attempts.max(1);
        if self.max_jobs == Some(0) {
            self.max_jobs = None;
        }
        self
    }
}

/// Total system memory in megabytes.
pub fn detect_memory_mb() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory() / (1024 * 1024);
    debug!("Detected {} MB of system memory", total);
    total
}

/// Looks up a possibly dotted key (`reference.fasta`) in the user config.
pub fn config_value(config: &UserConfig, key: &str) -> Option<String> {
    if let Some(value) = config.get(key) {
        return scalar_to_string(value);
    }

    let mut parts = key.split('.');
    let mut current = config.get(parts.next()?)?;
    for part in parts {
        current = match current {
            serde_yaml::Value::Mapping(map) => map.get(part)?,
            serde_yaml::Value::Sequence(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    scalar_to_string(current)
}

pub(crate) fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Sequence(items) => {
            let rendered: Option<Vec<String>> = items.iter().map(scalar_to_string).collect();
            rendered.map(|parts| parts.join(" "))
        }
        _ => None,
    }
}
