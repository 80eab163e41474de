//! Checkpoint Resolver
//!
//! A checkpoint-dependent input cannot be expanded until its checkpoint task
//! has succeeded. Afterwards the checkpoint's output directory is globbed
//! once per (checkpoint task, sub-pattern) and the resulting Discovery Set is
//! cached for the rest of the run. Consumers never see a partial footprint:
//! discovery only happens after success.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info};

use super::graph::{TaskId, TaskKey};
use super::wildcards::{glob, Binding, Template};
use crate::error::GraphError;
use crate::store::StateStore;

/// Cache key for a Discovery Set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryKey {
    pub checkpoint: TaskKey,
    pub pattern: String,
}

/// Outcome of asking for a checkpoint's discovered bindings.
#[derive(Debug, Clone, PartialEq)]
pub enum Discovery {
    /// The checkpoint has not succeeded yet; the branch must wait.
    Pending(TaskId),
    /// The discovered bindings, in sorted order.
    Ready(Arc<Vec<Binding>>),
}

/// Tracks succeeded checkpoints and their cached Discovery Sets.
#[derive(Debug, Default)]
pub struct CheckpointResolver {
    succeeded: HashSet<TaskId>,
    cache: HashMap<DiscoveryKey, Arc<Vec<Binding>>>,
    globs: usize,
}

impl CheckpointResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a checkpoint task succeeded.
    pub fn mark_succeeded(&mut self, task: TaskId) {
        self.succeeded.insert(task);
    }

    pub fn is_succeeded(&self, task: TaskId) -> bool {
        self.succeeded.contains(&task)
    }

    /// Number of directory globs performed so far.
    pub fn glob_count(&self) -> usize {
        self.globs
    }

    /// Cached Discovery Set for a key, if any.
    pub fn cached(&self, key: &DiscoveryKey) -> Option<Arc<Vec<Binding>>> {
        self.cache.get(key).cloned()
    }

    /// Returns the Discovery Set for `pattern` under the checkpoint's
    /// `directory`, globbing at most once per key.
    ///
    /// `pattern` must already have the consumer's bindings filled in.
    pub fn discover(
        &mut self,
        store: &dyn StateStore,
        task: TaskId,
        key: &TaskKey,
        directory: &str,
        pattern: &str,
    ) -> Result<Discovery, GraphError> {
        if !self.is_succeeded(task) {
            return Ok(Discovery::Pending(task));
        }

        let cache_key = DiscoveryKey {
            checkpoint: key.clone(),
            pattern: pattern.to_string(),
        };
        if let Some(bindings) = self.cache.get(&cache_key) {
            debug!("Discovery cache hit for {} '{}'", key, pattern);
            return Ok(Discovery::Ready(Arc::clone(bindings)));
        }

        if !store.exists(directory) {
            return Err(GraphError::MissingCheckpointOutput {
                checkpoint: key.to_string(),
                directory: directory.to_string(),
            });
        }

        let bindings = Arc::new(glob(store, pattern, directory)?);
        self.globs += 1;
        info!(
            "Checkpoint {} discovered {} unit(s) matching '{}' in {}",
            key,
            bindings.len(),
            pattern,
            directory
        );
        self.cache.insert(cache_key, Arc::clone(&bindings));
        Ok(Discovery::Ready(bindings))
    }
}

/// Renders `materialize` once per discovered binding, each merged with the
/// consumer's binding.
pub fn materialize(
    materialize: &str,
    consumer: &Binding,
    discovered: &[Binding],
) -> Result<Vec<String>, GraphError> {
    let template = Template::parse(materialize)?;
    let mut paths = Vec::with_capacity(discovered.len());
    for found in discovered {
        let mut merged = consumer.clone();
        merged.extend(found.iter().map(|(k, v)| (k.clone(), v.clone())));
        paths.push(template.render(&merged)?);
    }
    Ok(paths)
}
