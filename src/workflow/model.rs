//! Rule Data Model
//!
//! A [`Rule`] is a task template: output path templates, inputs, parameters,
//! resources and a body. The graph builder instantiates one task per
//! distinct wildcard binding a requested path needs.
//!
//! # Example
//!
//! ```
//! use ruleflow::workflow::Rule;
//!
//! let scan = Rule::shell("scan", "scan-remote {wildcards.sample} --out {output}")
//!     .with_output("requests/{sample}")
//!     .as_checkpoint();
//!
//! let fetch = Rule::shell("fetch", "fetch --request {input} > {output}")
//!     .with_input("requests/{sample}/{unit}.request")
//!     .with_output("data/{sample}/{unit}.data")
//!     .with_threads(2);
//!
//! let fofn = Rule::manifest("fofn")
//!     .with_checkpoint_input("scan", "{unit}.request", "data/{sample}/{unit}.data")
//!     .with_output("manifests/{sample}.fofn");
//! # let _ = (scan, fetch, fofn);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PatternError, TaskError};
use crate::execution::step::Job;
use crate::store::StateStore;
use crate::workflow::manifest::write_manifest;
use crate::workflow::wildcards::{Binding, Template};

/// Function computing input paths from a binding.
pub type InputFn = dyn Fn(&Binding) -> Vec<String> + Send + Sync;

/// Function computing a parameter value from a binding.
pub type ParamFn = dyn Fn(&Binding) -> String + Send + Sync;

/// Function computing the wall-clock budget for an attempt (1-based).
pub type RuntimeFn = dyn Fn(u32) -> Option<Duration> + Send + Sync;

/// Typed rule body executed in-process.
pub type ProcedureFn = dyn Fn(&Job, &dyn StateStore) -> Result<(), TaskError> + Send + Sync;

/// An input evaluated when the graph is resolved rather than declared.
#[derive(Clone)]
pub struct LazyInput {
    pub label: String,
    func: Arc<InputFn>,
}

impl LazyInput {
    pub fn new<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Binding) -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            func: Arc::new(func),
        }
    }

    pub fn evaluate(&self, binding: &Binding) -> Vec<String> {
        (self.func)(binding)
    }
}

impl fmt::Debug for LazyInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LazyInput({})", self.label)
    }
}

/// Lazy input whose members are discovered from a checkpoint's footprint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInput {
    /// Id of the checkpoint rule. Its first output is the footprint directory.
    pub checkpoint: String,

    /// Sub-pattern matched against files inside the footprint directory.
    /// Placeholders bound by the consumer (e.g. a subfolder) are filled in
    /// first; the remaining ones are discovered.
    pub pattern: String,

    /// Path template of the per-unit artifact to depend on.
    pub materialize: String,
}

/// One declared input of a rule.
#[derive(Debug, Clone)]
pub enum InputSpec {
    /// Static path template rendered with the task's binding.
    Path(String),
    /// Function of the binding.
    Lazy(LazyInput),
    /// Function of the binding and a checkpoint's discovered footprint.
    Checkpoint(CheckpointInput),
}

/// A named rule parameter.
#[derive(Clone)]
pub enum Param {
    /// Used verbatim.
    Literal(String),
    /// Rendered with the task's binding.
    Template(String),
    /// Computed from the task's binding.
    Computed(Arc<ParamFn>),
}

impl Param {
    pub fn value(&self, binding: &Binding) -> Result<String, PatternError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Template(template) => Template::parse(template)?.render(binding),
            Self::Computed(func) => Ok(func(binding)),
        }
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "Literal({:?})", value),
            Self::Template(template) => write!(f, "Template({:?})", template),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// How the wall-clock budget grows with the attempt number.
#[derive(Clone, Default)]
pub enum RuntimeScaling {
    /// `base x attempt`
    #[default]
    Linear,
    /// `base` on every attempt
    Fixed,
    /// Rule-specific function of the attempt
    Custom(Arc<RuntimeFn>),
}

impl fmt::Debug for RuntimeScaling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => f.write_str("Linear"),
            Self::Fixed => f.write_str("Fixed"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Resources a rule asks for.
#[derive(Debug, Clone)]
pub struct Resources {
    /// Threads per task
    pub threads: usize,
    /// Memory per thread in megabytes (0 = not tracked)
    pub mem_mb: u64,
    /// Base wall-clock budget for the first attempt
    pub runtime: Option<Duration>,
    /// Growth of the budget over attempts
    pub scaling: RuntimeScaling,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            threads: 1,
            mem_mb: 0,
            runtime: None,
            scaling: RuntimeScaling::Linear,
        }
    }
}

impl Resources {
    /// Wall-clock budget for `attempt` (1-based).
    pub fn runtime_for(&self, attempt: u32) -> Option<Duration> {
        let attempt = attempt.max(1);
        match &self.scaling {
            RuntimeScaling::Linear => self.runtime.map(|base| base.saturating_mul(attempt)),
            RuntimeScaling::Fixed => self.runtime,
            RuntimeScaling::Custom(func) => func(attempt),
        }
    }

    /// Total memory for `threads` threads.
    pub fn mem_total_mb(&self, threads: usize) -> u64 {
        self.mem_mb.saturating_mul(threads as u64)
    }
}

/// A procedure run in-process instead of an external command.
#[derive(Clone)]
pub struct Procedure {
    pub name: String,
    func: Arc<ProcedureFn>,
}

impl Procedure {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Job, &dyn StateStore) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Writes the job's inputs as a sorted manifest to its first output.
    pub fn manifest() -> Self {
        Self::new("manifest", |job, store| {
            let output = job.outputs.first().ok_or_else(|| TaskError::Procedure {
                task: job.key.to_string(),
                message: "manifest rule has no output".to_string(),
            })?;
            write_manifest(store, &job.inputs, output)?;
            Ok(())
        })
    }

    pub fn run(&self, job: &Job, store: &dyn StateStore) -> Result<(), TaskError> {
        (self.func)(job, store)
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Procedure({})", self.name)
    }
}

/// What a task runs.
#[derive(Debug, Clone)]
pub enum RuleBody {
    /// Shell command template handed to the execution delegate.
    Command(String),
    /// Typed in-process procedure over resolved inputs and outputs.
    Procedure(Procedure),
}

/// A named, file-producing task template.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Unique identifier
    pub id: String,

    /// Output path templates; all share one wildcard set
    pub outputs: Vec<String>,

    /// Declared inputs
    pub inputs: Vec<InputSpec>,

    /// Named parameters available to the body as `{params.NAME}`
    pub params: BTreeMap<String, Param>,

    /// Requested resources
    pub resources: Resources,

    /// Executable body
    pub body: RuleBody,

    /// Whether the rule's footprint reshapes the graph once it has run
    pub checkpoint: bool,

    /// Optional log path template
    pub log: Option<String>,

    /// Attempt ceiling overriding the run-wide setting
    pub max_attempts: Option<u32>,
}

impl Rule {
    /// Creates a rule with the given body and nothing else.
    pub fn new(id: impl Into<String>, body: RuleBody) -> Self {
        Self {
            id: id.into().trim().to_string(),
            outputs: Vec::new(),
            inputs: Vec::new(),
            params: BTreeMap::new(),
            resources: Resources::default(),
            body,
            checkpoint: false,
            log: None,
            max_attempts: None,
        }
    }

    /// Creates a rule that runs a shell command template.
    pub fn shell(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(id, RuleBody::Command(command.into().trim().to_string()))
    }

    /// Creates a rule that runs an in-process procedure.
    pub fn procedure(id: impl Into<String>, procedure: Procedure) -> Self {
        Self::new(id, RuleBody::Procedure(procedure))
    }

    /// Creates a rule that aggregates its inputs into a manifest file.
    pub fn manifest(id: impl Into<String>) -> Self {
        Self::procedure(id, Procedure::manifest())
    }

    /// Adds an output template.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.outputs.push(output.into());
        self
    }

    /// Adds a static input template.
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(InputSpec::Path(input.into()));
        self
    }

    /// Adds an input computed from the binding at resolution time.
    pub fn with_lazy_input<F>(mut self, label: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Binding) -> Vec<String> + Send + Sync + 'static,
    {
        self.inputs.push(InputSpec::Lazy(LazyInput::new(label, func)));
        self
    }

    /// Adds an input discovered from a checkpoint's footprint.
    pub fn with_checkpoint_input(
        mut self,
        checkpoint: impl Into<String>,
        pattern: impl Into<String>,
        materialize: impl Into<String>,
    ) -> Self {
        self.inputs.push(InputSpec::Checkpoint(CheckpointInput {
            checkpoint: checkpoint.into(),
            pattern: pattern.into(),
            materialize: materialize.into(),
        }));
        self
    }

    /// Adds a parameter rendered with the binding.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params
            .insert(name.into(), Param::Template(value.into()));
        self
    }

    /// Adds a parameter computed from the binding.
    pub fn with_computed_param<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Binding) -> String + Send + Sync + 'static,
    {
        self.params
            .insert(name.into(), Param::Computed(Arc::new(func)));
        self
    }

    /// Sets the thread count.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.resources.threads = threads;
        self
    }

    /// Sets memory per thread in megabytes.
    pub fn with_mem_mb(mut self, mem_mb: u64) -> Self {
        self.resources.mem_mb = mem_mb;
        self
    }

    /// Sets the base wall-clock budget.
    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.resources.runtime = Some(runtime);
        self
    }

    /// Overrides how the wall-clock budget scales with attempts.
    pub fn with_runtime_scaling(mut self, scaling: RuntimeScaling) -> Self {
        self.resources.scaling = scaling;
        self
    }

    /// Sets the log path template.
    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    /// Overrides the attempt ceiling.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Flags the rule as a checkpoint.
    pub fn as_checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self
    }

    /// Returns the command template, if the body is a command.
    pub fn command(&self) -> Option<&str> {
        match &self.body {
            RuleBody::Command(command) => Some(command),
            RuleBody::Procedure(_) => None,
        }
    }

    /// Wildcard names of the first output template.
    pub fn wildcard_names(&self) -> Result<Vec<String>, PatternError> {
        match self.outputs.first() {
            Some(output) => Ok(Template::parse(output)?.names()),
            None => Ok(Vec::new()),
        }
    }

    /// Evaluates every parameter for a binding.
    pub fn param_values(&self, binding: &Binding) -> Result<BTreeMap<String, String>, PatternError> {
        self.params
            .iter()
            .map(|(name, param)| Ok((name.clone(), param.value(binding)?)))
            .collect()
    }
}
