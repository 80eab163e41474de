//! Rule File Parser
//!
//! Loads rule declarations from YAML. A rule file has three sections:
//! - `config`: free-form pipeline configuration, available as `{config.KEY}`
//! - `settings`: engine settings ([`RunConfig`])
//! - `rules`: the rule declarations themselves

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_yaml::Value;

use super::model::{CheckpointInput, InputSpec, Procedure, Rule, RuleBody, RuntimeScaling};
use super::registry::RuleRegistry;
use crate::config::{scalar_to_string, RunConfig, UserConfig};
use crate::error::{GraphError, RunError};

/// A parsed rule file.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct RuleFile {
    #[serde(default)]
    pub config: UserConfig,

    #[serde(default)]
    pub settings: RunConfig,

    #[serde(default)]
    pub rules: Vec<RuleDecl>,
}

/// Built-in procedures a rule can name instead of a shell command.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Builtin {
    /// Sorted, deduplicated list of the rule's inputs
    Manifest,
}

/// Runtime growth over attempts.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScalingDecl {
    Linear,
    Fixed,
}

/// One entry of a rule's `input` list.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum InputDecl {
    /// Static path template
    Path(String),
    /// Inputs discovered from a checkpoint's footprint
    Checkpoint(CheckpointInput),
}

/// A rule as written in the file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuleDecl {
    pub id: String,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub output: Vec<String>,

    #[serde(deserialize_with = "one_or_many", default)]
    pub input: Vec<InputDecl>,

    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default)]
    pub builtin: Option<Builtin>,

    #[serde(default)]
    pub params: BTreeMap<String, Value>,

    #[serde(default)]
    pub threads: Option<usize>,

    /// Memory per thread in megabytes
    #[serde(default)]
    pub mem_mb: Option<u64>,

    /// Wall-clock budget of the first attempt, in minutes
    #[serde(default)]
    pub runtime: Option<u64>,

    #[serde(default)]
    pub runtime_scaling: Option<ScalingDecl>,

    #[serde(default)]
    pub log: Option<String>,

    #[serde(default)]
    pub checkpoint: bool,

    /// Attempt ceiling for this rule
    #[serde(default)]
    pub attempts: Option<u32>,
}

/// Deserializes either a single string or a list of strings.
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Sequence(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in list")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or list of strings")),
    }
}

/// Deserializes either a single input or a list of inputs.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<InputDecl>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(InputDecl),
        Many(Vec<InputDecl>),
    }

    match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(OneOrMany::One(input)) => Ok(vec![input]),
        Some(OneOrMany::Many(inputs)) => Ok(inputs),
    }
}

impl RuleDecl {
    /// Converts the declaration into a [`Rule`].
    pub fn into_rule(self) -> Result<Rule, GraphError> {
        let invalid = |reason: &str| GraphError::InvalidRule {
            rule: self.id.clone(),
            reason: reason.to_string(),
        };

        let body = match (&self.shell, self.builtin) {
            (Some(command), None) => RuleBody::Command(command.trim().to_string()),
            (None, Some(Builtin::Manifest)) => RuleBody::Procedure(Procedure::manifest()),
            (Some(_), Some(_)) => return Err(invalid("declares both 'shell' and 'builtin'")),
            (None, None) => return Err(invalid("needs either 'shell' or 'builtin'")),
        };

        let mut rule = Rule::new(self.id.clone(), body);
        rule.outputs = self.output;
        rule.inputs = self
            .input
            .into_iter()
            .map(|input| match input {
                InputDecl::Path(path) => InputSpec::Path(path),
                InputDecl::Checkpoint(checkpoint) => InputSpec::Checkpoint(checkpoint),
            })
            .collect();

        for (name, value) in self.params {
            let value = scalar_to_string(&value).ok_or_else(|| GraphError::InvalidRule {
                rule: self.id.clone(),
                reason: format!("parameter '{}' must be a scalar or a list of scalars", name),
            })?;
            rule = rule.with_param(name, value);
        }

        if let Some(threads) = self.threads {
            rule = rule.with_threads(threads);
        }
        if let Some(mem_mb) = self.mem_mb {
            rule = rule.with_mem_mb(mem_mb);
        }
        if let Some(minutes) = self.runtime {
            let secs = minutes
                .checked_mul(60)
                .ok_or_else(|| invalid("'runtime' is too large"))?;
            rule = rule.with_runtime(Duration::from_secs(secs));
        }
        match self.runtime_scaling {
            Some(ScalingDecl::Fixed) => rule = rule.with_runtime_scaling(RuntimeScaling::Fixed),
            Some(ScalingDecl::Linear) | None => {}
        }
        if let Some(log) = self.log {
            rule = rule.with_log(log);
        }
        if let Some(attempts) = self.attempts {
            rule = rule.with_max_attempts(attempts);
        }
        if self.checkpoint {
            rule = rule.as_checkpoint();
        }
        Ok(rule)
    }
}

impl RuleFile {
    /// Registers every rule. Returns the registry and the file's settings.
    pub fn into_registry(self) -> Result<(RuleRegistry, RunConfig), GraphError> {
        let mut registry = RuleRegistry::with_config(self.config);
        for decl in self.rules {
            registry.register(decl.into_rule()?)?;
        }
        registry.check()?;
        Ok((registry, self.settings))
    }
}

/// Parses a rule file from YAML text.
pub fn parse_rules(yaml: &str) -> Result<RuleFile, serde_yaml::Error> {
    let file: RuleFile = serde_yaml::from_str(yaml)?;
    debug!(
        "Parsed {} rule(s), {} config key(s)",
        file.rules.len(),
        file.config.len()
    );
    Ok(file)
}

/// Loads a rule file from disk.
///
/// # Example
///
/// ```rust,no_run
/// use ruleflow::workflow::parser::load_rules;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (registry, settings) = load_rules("rules.yaml")?.into_registry()?;
///     println!("Loaded {} rules, {} cores", registry.len(), settings.cores);
///     Ok(())
/// }
/// ```
pub fn load_rules(path: impl AsRef<Path>) -> Result<RuleFile, RunError> {
    let path = path.as_ref();
    info!("Loading rules from: {}", path.display());

    let load_error = |reason: String| RunError::Load {
        path: path.display().to_string(),
        reason,
    };

    let yaml = fs::read_to_string(path).map_err(|e| {
        load_error(format!(
            "{}. Check that the file exists and is readable.",
            e
        ))
    })?;
    debug!("YAML content loaded ({} bytes)", yaml.len());

    parse_rules(&yaml).map_err(|e| load_error(e.to_string()))
}
