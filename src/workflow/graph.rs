//! Task Graph and Graph Builder
//!
//! The graph is built backward from requested target paths. Each path is
//! matched against the registry's output templates; the matching rule and
//! binding become a task instance, whose inputs are resolved the same way.
//! Paths nobody produces but which already exist are source files.
//!
//! Inputs that depend on a checkpoint leave their task *awaiting* that
//! checkpoint. Once the checkpoint succeeds, [`GraphBuilder::checkpoint_succeeded`]
//! discovers its footprint and extends the graph in place.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use super::checkpoint::{materialize, CheckpointResolver, Discovery};
use super::model::{CheckpointInput, InputSpec, Rule};
use super::registry::RuleRegistry;
use super::wildcards::{Binding, Template};
use crate::error::GraphError;
use crate::store::StateStore;

/// Index of a task in its [`TaskGraph`].
pub type TaskId = usize;

/// Unique identity of a task instance: rule id plus wildcard binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskKey {
    pub rule: String,
    pub binding: Binding,
}

impl TaskKey {
    pub fn new(rule: impl Into<String>, binding: Binding) -> Self {
        Self {
            rule: rule.into(),
            binding,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rule)?;
        if !self.binding.is_empty() {
            let pairs: Vec<String> = self
                .binding
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "[{}]", pairs.join(","))?;
        }
        Ok(())
    }
}

/// A task instance in the graph.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub key: TaskKey,
    pub rule: Arc<Rule>,
    /// Concrete input paths resolved so far
    pub inputs: Vec<String>,
    /// Concrete output paths
    pub outputs: Vec<String>,
    /// Concrete log path, if the rule declares one
    pub log: Option<String>,
    /// Tasks that must succeed first
    pub deps: BTreeSet<TaskId>,
    /// Checkpoints whose discovery this task's inputs still wait on
    pub awaiting: BTreeSet<TaskId>,
}

impl TaskNode {
    /// True once every input is known.
    pub fn is_resolved(&self) -> bool {
        self.awaiting.is_empty()
    }

    pub fn is_checkpoint(&self) -> bool {
        self.rule.checkpoint
    }
}

/// Task instances and their dependency edges.
#[derive(Debug, Default)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    by_key: HashMap<TaskKey, TaskId>,
    producers: HashMap<String, TaskId>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: TaskId) -> &TaskNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn find(&self, key: &TaskKey) -> Option<TaskId> {
        self.by_key.get(key).copied()
    }

    /// Task that declares `path` as an output.
    pub fn producer_of(&self, path: &str) -> Option<TaskId> {
        self.producers.get(path).copied()
    }

    /// Task whose declared output is a directory containing `path`.
    pub fn enclosing_producer(&self, path: &str) -> Option<TaskId> {
        ancestors(path).find_map(|dir| self.producer_of(dir))
    }

    /// Tasks that list `id` as a direct dependency.
    pub fn dependents(&self, id: TaskId) -> Vec<TaskId> {
        self.nodes
            .iter()
            .filter(|n| n.deps.contains(&id))
            .map(|n| n.id)
            .collect()
    }

    /// Every task that depends on `id`, directly or not.
    pub fn transitive_dependents(&self, id: TaskId) -> BTreeSet<TaskId> {
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if found.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }
        found
    }

    /// True if `from` depends on `to`, directly or transitively.
    pub fn depends_on(&self, from: TaskId, to: TaskId) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            for &dep in &self.nodes[current].deps {
                if dep == to {
                    return true;
                }
                if seen.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        false
    }

    /// Orders tasks so dependencies come before dependents (Kahn's algorithm).
    pub fn topological_order(&self) -> Result<Vec<TaskId>, GraphError> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.deps.len()).collect();
        let mut dependents: Vec<Vec<TaskId>> = vec![Vec::new(); self.nodes.len()];
        for node in &self.nodes {
            for &dep in &node.deps {
                dependents[dep].push(node.id);
            }
        }

        let mut queue: VecDeque<TaskId> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(current) = queue.pop_front() {
            order.push(current);
            for &next in &dependents[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let chain = self
                .nodes
                .iter()
                .filter(|n| in_degree[n.id] > 0)
                .map(|n| n.key.to_string())
                .collect();
            return Err(GraphError::Cycle { chain });
        }
        Ok(order)
    }

    fn insert(&mut self, mut node: TaskNode) -> TaskId {
        let id = self.nodes.len();
        node.id = id;
        for output in &node.outputs {
            if let Some(previous) = self.producers.insert(output.clone(), id) {
                warn!(
                    "'{}' is declared by both {} and {}",
                    output, self.nodes[previous].key, node.key
                );
            }
        }
        self.by_key.insert(node.key.clone(), id);
        self.nodes.push(node);
        id
    }
}

/// Parent directories of `path`, deepest first.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut current = path.trim_end_matches('/');
    std::iter::from_fn(move || {
        let cut = current.rfind('/')?;
        current = &current[..cut];
        (!current.is_empty()).then_some(current)
    })
}

/// Tasks currently being resolved, with the path that requested each.
#[derive(Debug, Default)]
struct ResolutionStack {
    frames: Vec<(TaskId, String)>,
}

impl ResolutionStack {
    fn push(&mut self, id: TaskId, label: impl Into<String>) {
        self.frames.push((id, label.into()));
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn check(&self, id: TaskId, path: &str) -> Result<(), GraphError> {
        match self.frames.iter().position(|(frame, _)| *frame == id) {
            Some(start) => {
                let mut chain: Vec<String> =
                    self.frames[start..].iter().map(|(_, p)| p.clone()).collect();
                chain.push(path.to_string());
                Err(GraphError::Cycle { chain })
            }
            None => Ok(()),
        }
    }
}

/// Resolved inputs of one task.
#[derive(Debug, Default)]
struct Expansion {
    inputs: Vec<String>,
    deps: BTreeSet<TaskId>,
    awaiting: BTreeSet<TaskId>,
}

enum CheckpointPaths {
    Pending(TaskId),
    Ready(Vec<String>),
}

/// Resolves target paths into a [`TaskGraph`] and extends it after
/// checkpoints.
pub struct GraphBuilder {
    registry: RuleRegistry,
    store: Arc<dyn StateStore>,
    graph: TaskGraph,
    checkpoints: CheckpointResolver,
}

impl GraphBuilder {
    /// Creates a builder. Cross-rule references are checked here.
    pub fn new(registry: RuleRegistry, store: Arc<dyn StateStore>) -> Result<Self, GraphError> {
        registry.check()?;
        Ok(Self {
            registry,
            store,
            graph: TaskGraph::default(),
            checkpoints: CheckpointResolver::new(),
        })
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn checkpoints(&self) -> &CheckpointResolver {
        &self.checkpoints
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Resolves a requested path. `Ok(None)` means it is an existing source
    /// file that no task needs to produce.
    pub fn resolve_target(&mut self, path: &str) -> Result<Option<TaskId>, GraphError> {
        let mut stack = ResolutionStack::default();
        let id = self.resolve_path(path, &mut stack)?;
        match id {
            Some(id) => debug!("Target '{}' -> {}", path, self.graph.node(id).key),
            None => debug!("Target '{}' is a source file", path),
        }
        Ok(id)
    }

    /// Resolves every target, stopping at the first construction error.
    pub fn resolve_targets<S: AsRef<str>>(
        &mut self,
        paths: &[S],
    ) -> Result<Vec<Option<TaskId>>, GraphError> {
        let ids = paths
            .iter()
            .map(|p| self.resolve_target(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "Resolved {} target(s) into {} task(s)",
            paths.len(),
            self.graph.len()
        );
        Ok(ids)
    }

    /// Records a succeeded checkpoint and re-resolves every task waiting on
    /// it. Returns the re-resolved task ids.
    pub fn checkpoint_succeeded(&mut self, checkpoint: TaskId) -> Result<Vec<TaskId>, GraphError> {
        self.checkpoints.mark_succeeded(checkpoint);

        let waiting: Vec<TaskId> = self
            .graph
            .nodes
            .iter()
            .filter(|n| n.awaiting.contains(&checkpoint))
            .map(|n| n.id)
            .collect();

        let before = self.graph.len();
        for &id in &waiting {
            let mut stack = ResolutionStack::default();
            stack.push(id, self.graph.node(id).key.to_string());
            let expansion = self.expand_inputs(id, &mut stack)?;
            stack.pop();
            self.link(id, expansion)?;
        }

        if !waiting.is_empty() {
            info!(
                "Checkpoint {} resolved {} waiting task(s); graph grew by {}",
                self.graph.node(checkpoint).key,
                waiting.len(),
                self.graph.len() - before
            );
        }
        Ok(waiting)
    }

    fn resolve_path(
        &mut self,
        path: &str,
        stack: &mut ResolutionStack,
    ) -> Result<Option<TaskId>, GraphError> {
        let id = if let Some(producer) = self.registry.find_producer(path)? {
            Some(self.instantiate(producer.rule, producer.binding, path, stack)?)
        } else if let Some(id) = self.graph.enclosing_producer(path) {
            Some(id)
        } else if self.store.exists(path) {
            None
        } else {
            let mut found = None;
            for dir in ancestors(path) {
                if let Some(producer) = self.registry.find_producer(dir)? {
                    found = Some(self.instantiate(producer.rule, producer.binding, dir, stack)?);
                    break;
                }
            }
            match found {
                Some(id) => Some(id),
                None => {
                    return Err(GraphError::NoProducer {
                        path: path.to_string(),
                    })
                }
            }
        };

        if let Some(id) = id {
            stack.check(id, path)?;
        }
        Ok(id)
    }

    fn instantiate(
        &mut self,
        rule: Arc<Rule>,
        binding: Binding,
        path: &str,
        stack: &mut ResolutionStack,
    ) -> Result<TaskId, GraphError> {
        let key = TaskKey::new(rule.id.clone(), binding);
        if let Some(id) = self.graph.find(&key) {
            stack.check(id, path)?;
            return Ok(id);
        }

        let outputs = rule
            .outputs
            .iter()
            .map(|o| Template::parse(o)?.render(&key.binding))
            .collect::<Result<Vec<_>, _>>()?;
        let log = match &rule.log {
            Some(log) => Some(Template::parse(log)?.render(&key.binding)?),
            None => None,
        };

        let id = self.graph.insert(TaskNode {
            id: 0,
            key,
            rule,
            inputs: Vec::new(),
            outputs,
            log,
            deps: BTreeSet::new(),
            awaiting: BTreeSet::new(),
        });
        debug!("New task {} for '{}'", self.graph.node(id).key, path);

        stack.push(id, path);
        let expansion = self.expand_inputs(id, stack);
        stack.pop();
        self.link(id, expansion?)?;
        Ok(id)
    }

    fn expand_inputs(
        &mut self,
        id: TaskId,
        stack: &mut ResolutionStack,
    ) -> Result<Expansion, GraphError> {
        let rule = Arc::clone(&self.graph.node(id).rule);
        let binding = self.graph.node(id).key.binding.clone();
        let mut expansion = Expansion::default();

        for spec in &rule.inputs {
            let paths = match spec {
                InputSpec::Path(template) => vec![Template::parse(template)?.render(&binding)?],
                InputSpec::Lazy(lazy) => lazy.evaluate(&binding),
                InputSpec::Checkpoint(input) => match self.checkpoint_paths(input, &rule, &binding, stack)? {
                    CheckpointPaths::Pending(checkpoint) => {
                        expansion.awaiting.insert(checkpoint);
                        expansion.deps.insert(checkpoint);
                        continue;
                    }
                    CheckpointPaths::Ready(paths) => paths,
                },
            };

            for path in paths {
                if let Some(dep) = self.resolve_path(&path, stack)? {
                    expansion.deps.insert(dep);
                }
                expansion.inputs.push(path);
            }
        }
        Ok(expansion)
    }

    fn checkpoint_paths(
        &mut self,
        input: &CheckpointInput,
        consumer: &Rule,
        binding: &Binding,
        stack: &mut ResolutionStack,
    ) -> Result<CheckpointPaths, GraphError> {
        let checkpoint_rule = match self.registry.get(&input.checkpoint) {
            Some(rule) if rule.checkpoint => Arc::clone(rule),
            Some(_) => {
                return Err(GraphError::NotACheckpoint {
                    consumer: consumer.id.clone(),
                    rule: input.checkpoint.clone(),
                })
            }
            None => {
                return Err(GraphError::InvalidRule {
                    rule: consumer.id.clone(),
                    reason: format!("unknown checkpoint '{}'", input.checkpoint),
                })
            }
        };

        let footprint = checkpoint_rule.outputs.first().ok_or_else(|| GraphError::InvalidRule {
            rule: checkpoint_rule.id.clone(),
            reason: "checkpoint declares no output directory".to_string(),
        })?;
        let directory = Template::parse(footprint)?.render(binding)?;

        let checkpoint = self
            .resolve_path(&directory, stack)?
            .filter(|&id| self.graph.node(id).rule.id == checkpoint_rule.id)
            .ok_or_else(|| GraphError::InvalidRule {
                rule: consumer.id.clone(),
                reason: format!(
                    "'{}' is not produced by checkpoint '{}'",
                    directory, checkpoint_rule.id
                ),
            })?;

        let key = self.graph.node(checkpoint).key.clone();
        let pattern = Template::parse(&input.pattern)?.render_partial(binding);
        match self
            .checkpoints
            .discover(self.store.as_ref(), checkpoint, &key, &directory, &pattern)?
        {
            Discovery::Pending(id) => Ok(CheckpointPaths::Pending(id)),
            Discovery::Ready(found) => Ok(CheckpointPaths::Ready(materialize(
                &input.materialize,
                binding,
                &found,
            )?)),
        }
    }

    fn link(&mut self, id: TaskId, expansion: Expansion) -> Result<(), GraphError> {
        for &dep in &expansion.deps {
            if dep == id || self.graph.depends_on(dep, id) {
                let node = self.graph.node(id).key.to_string();
                return Err(GraphError::Cycle {
                    chain: vec![node.clone(), self.graph.node(dep).key.to_string(), node],
                });
            }
        }

        let node = &mut self.graph.nodes[id];
        node.inputs = expansion.inputs;
        node.deps.extend(expansion.deps);
        node.awaiting = expansion.awaiting;
        if !node.awaiting.is_empty() {
            debug!("{} waits on {} checkpoint(s)", node.key, node.awaiting.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn builder(rules: Vec<Rule>, store: Arc<MemoryStore>) -> GraphBuilder {
        let mut registry = RuleRegistry::new();
        registry.register_all(rules).unwrap();
        GraphBuilder::new(registry, store).unwrap()
    }

    fn checkpoint_rules() -> Vec<Rule> {
        vec![
            Rule::shell("scan", "scan {wildcards.sample} {output}")
                .with_output("requests/{sample}")
                .as_checkpoint(),
            Rule::shell("fetch", "fetch {input} > {output}")
                .with_input("requests/{sample}/{unit}.request")
                .with_output("data/{sample}/{unit}.data"),
            Rule::manifest("fofn")
                .with_checkpoint_input("scan", "{unit}.request", "data/{sample}/{unit}.data")
                .with_output("manifests/{sample}.fofn"),
        ]
    }

    #[test]
    fn test_task_key_display() {
        let mut binding = Binding::new();
        binding.insert("sample".to_string(), "s1".to_string());
        binding.insert("unit".to_string(), "u0".to_string());
        assert_eq!(TaskKey::new("fetch", binding).to_string(), "fetch[sample=s1,unit=u0]");
        assert_eq!(TaskKey::new("all", Binding::new()).to_string(), "all");
    }

    #[test]
    fn test_ancestors() {
        let dirs: Vec<&str> = ancestors("a/b/c.txt").collect();
        assert_eq!(dirs, vec!["a/b", "a"]);
        assert_eq!(ancestors("flat.txt").count(), 0);
    }

    #[test]
    fn test_static_chain_with_source() {
        let store = Arc::new(MemoryStore::new());
        store.write("reads/s1.fastq", "@r1").unwrap();
        let mut builder = builder(
            vec![
                Rule::shell("align", "align {input} > {output}")
                    .with_input("reads/{sample}.fastq")
                    .with_output("aln/{sample}.bam"),
                Rule::shell("call", "call {input} > {output}")
                    .with_input("aln/{sample}.bam")
                    .with_output("calls/{sample}.vcf"),
            ],
            store,
        );

        let call = builder.resolve_target("calls/s1.vcf").unwrap().unwrap();
        let graph = builder.graph();
        assert_eq!(graph.len(), 2);

        let align = graph.producer_of("aln/s1.bam").unwrap();
        assert_eq!(graph.node(call).deps, BTreeSet::from([align]));
        assert!(graph.node(align).deps.is_empty());
        assert_eq!(graph.node(align).inputs, vec!["reads/s1.fastq"]);
        assert_eq!(graph.topological_order().unwrap(), vec![align, call]);
        assert_eq!(graph.transitive_dependents(align), BTreeSet::from([call]));
    }

    #[test]
    fn test_task_instances_are_shared() {
        let store = Arc::new(MemoryStore::new());
        store.write("ref.fa", ">chr1").unwrap();
        let mut builder = builder(
            vec![
                Rule::shell("index", "index {input}")
                    .with_input("ref.fa")
                    .with_output("ref.fa.idx"),
                Rule::shell("align", "align")
                    .with_input("ref.fa.idx")
                    .with_output("aln/{sample}.bam"),
            ],
            store,
        );

        builder
            .resolve_targets(&["aln/a.bam", "aln/b.bam", "aln/a.bam"])
            .unwrap();
        assert_eq!(builder.graph().len(), 3);
    }

    #[test]
    fn test_no_producer() {
        let store = Arc::new(MemoryStore::new());
        let mut builder = builder(
            vec![Rule::shell("align", "align")
                .with_input("reads/{sample}.fastq")
                .with_output("aln/{sample}.bam")],
            store,
        );

        let result = builder.resolve_target("aln/s1.bam");
        assert!(matches!(result, Err(GraphError::NoProducer { path }) if path == "reads/s1.fastq"));
    }

    #[test]
    fn test_ambiguity_detected_during_construction() {
        let store = Arc::new(MemoryStore::new());
        let mut builder = builder(
            vec![
                Rule::shell("a", "true").with_output("out/{x}.txt"),
                Rule::shell("b", "true").with_output("out/{y}.txt"),
            ],
            store,
        );
        assert!(matches!(
            builder.resolve_target("out/1.txt"),
            Err(GraphError::AmbiguousRule { .. })
        ));
    }

    #[test]
    fn test_static_cycle() {
        let store = Arc::new(MemoryStore::new());
        let mut builder = builder(
            vec![
                Rule::shell("a", "true").with_input("{x}.b").with_output("{x}.a"),
                Rule::shell("b", "true").with_input("{x}.a").with_output("{x}.b"),
            ],
            store,
        );
        match builder.resolve_target("n.a") {
            Err(GraphError::Cycle { chain }) => assert_eq!(chain, vec!["n.a", "n.b", "n.a"]),
            other => panic!("expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_lazy_inputs_resolved_as_targets() {
        let store = Arc::new(MemoryStore::new());
        let mut builder = builder(
            vec![
                Rule::shell("chunk", "split {output}").with_output("chunks/{sample}.{n,[0-9]+}"),
                Rule::shell("merge", "cat {input} > {output}")
                    .with_lazy_input("chunks", |b| {
                        (0..3).map(|n| format!("chunks/{}.{}", b["sample"], n)).collect()
                    })
                    .with_output("merged/{sample}.txt"),
            ],
            store,
        );

        let merge = builder.resolve_target("merged/s1.txt").unwrap().unwrap();
        let node = builder.graph().node(merge);
        assert_eq!(node.deps.len(), 3);
        assert_eq!(node.inputs, vec!["chunks/s1.0", "chunks/s1.1", "chunks/s1.2"]);
    }

    #[test]
    fn test_checkpoint_consumer_waits_then_extends() {
        let store = Arc::new(MemoryStore::new());
        let mut builder = builder(checkpoint_rules(), Arc::clone(&store));

        let fofn = builder.resolve_target("manifests/s1.fofn").unwrap().unwrap();
        let scan = builder.graph().producer_of("requests/s1").unwrap();
        {
            let node = builder.graph().node(fofn);
            assert!(!node.is_resolved());
            assert_eq!(node.awaiting, BTreeSet::from([scan]));
            assert!(node.deps.contains(&scan));
            assert!(node.inputs.is_empty());
        }
        assert_eq!(builder.graph().len(), 2);

        for n in [2, 0, 1] {
            store
                .write(&format!("requests/s1/unit.{}.request", n), "")
                .unwrap();
        }
        let waiting = builder.checkpoint_succeeded(scan).unwrap();
        assert_eq!(waiting, vec![fofn]);

        let graph = builder.graph();
        let node = graph.node(fofn);
        assert!(node.is_resolved());
        assert_eq!(
            node.inputs,
            vec!["data/s1/unit.0.data", "data/s1/unit.1.data", "data/s1/unit.2.data"]
        );
        assert_eq!(graph.len(), 5);

        // Each fetch depends on the checkpoint through its output directory
        let fetch = graph.producer_of("data/s1/unit.1.data").unwrap();
        assert_eq!(graph.node(fetch).deps, BTreeSet::from([scan]));
        assert!(graph.depends_on(fofn, scan));
        assert_eq!(builder.checkpoints().glob_count(), 1);
    }

    #[test]
    fn test_discovery_shared_between_consumers() {
        let store = Arc::new(MemoryStore::new());
        let mut rules = checkpoint_rules();
        rules.push(
            Rule::shell("count", "wc -l {input} > {output}")
                .with_checkpoint_input("scan", "{unit}.request", "data/{sample}/{unit}.data")
                .with_output("counts/{sample}.txt"),
        );
        let mut builder = builder(rules, Arc::clone(&store));
        builder
            .resolve_targets(&["manifests/s1.fofn", "counts/s1.txt"])
            .unwrap();

        store.write("requests/s1/a.request", "").unwrap();
        store.write("requests/s1/b.request", "").unwrap();
        let scan = builder.graph().producer_of("requests/s1").unwrap();
        let waiting = builder.checkpoint_succeeded(scan).unwrap();

        assert_eq!(waiting.len(), 2);
        assert_eq!(builder.checkpoints().glob_count(), 1);
        let graph = builder.graph();
        let fofn = graph.producer_of("manifests/s1.fofn").unwrap();
        let count = graph.producer_of("counts/s1.txt").unwrap();
        assert_eq!(graph.node(fofn).inputs, graph.node(count).inputs);
        assert_eq!(graph.len(), 5);
    }

    #[test]
    fn test_missing_checkpoint_directory() {
        let store = Arc::new(MemoryStore::new());
        let mut builder = builder(checkpoint_rules(), store);
        builder.resolve_target("manifests/s1.fofn").unwrap();
        let scan = builder.graph().producer_of("requests/s1").unwrap();

        assert!(matches!(
            builder.checkpoint_succeeded(scan),
            Err(GraphError::MissingCheckpointOutput { .. })
        ));
    }

    #[test]
    fn test_subfolder_parameter_in_pattern() {
        let store = Arc::new(MemoryStore::new());
        let mut builder = builder(
            vec![
                Rule::shell("scan", "scan")
                    .with_output("requests/{sample}")
                    .as_checkpoint(),
                Rule::shell("fetch", "fetch")
                    .with_input("requests/{sample}/{kind}/{unit}.request")
                    .with_output("data/{sample}/{kind}/{unit}.data"),
                Rule::manifest("fofn")
                    .with_checkpoint_input(
                        "scan",
                        "{kind}/{unit}.request",
                        "data/{sample}/{kind}/{unit}.data",
                    )
                    .with_output("manifests/{sample}.{kind}.fofn"),
            ],
            Arc::clone(&store),
        );

        let fofn = builder.resolve_target("manifests/s1.hifi.fofn").unwrap().unwrap();
        store.write("requests/s1/hifi/u1.request", "").unwrap();
        store.write("requests/s1/ont/u2.request", "").unwrap();
        let scan = builder.graph().producer_of("requests/s1").unwrap();
        builder.checkpoint_succeeded(scan).unwrap();

        assert_eq!(builder.graph().node(fofn).inputs, vec!["data/s1/hifi/u1.data"]);
    }

    #[test]
    fn test_cycle_introduced_by_extension() {
        let store = Arc::new(MemoryStore::new());
        let mut builder = builder(
            vec![
                Rule::shell("scan", "scan").with_output("req/{s}").as_checkpoint(),
                Rule::shell("unit", "unit")
                    .with_input("agg/{s}.txt")
                    .with_output("units/{s}/{u}.txt"),
                Rule::shell("agg", "agg")
                    .with_checkpoint_input("scan", "{u}.r", "units/{s}/{u}.txt")
                    .with_output("agg/{s}.txt"),
            ],
            Arc::clone(&store),
        );

        builder.resolve_target("agg/x.txt").unwrap();
        store.write("req/x/1.r", "").unwrap();
        let scan = builder.graph().producer_of("req/x").unwrap();

        assert!(matches!(
            builder.checkpoint_succeeded(scan),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn test_not_a_checkpoint_rejected() {
        let mut registry = RuleRegistry::new();
        registry
            .register_all([
                Rule::shell("scan", "scan").with_output("requests/{sample}"),
                Rule::manifest("fofn")
                    .with_checkpoint_input("scan", "{unit}.request", "requests/{sample}/{unit}.request")
                    .with_output("manifests/{sample}.fofn"),
            ])
            .unwrap();
        let result = GraphBuilder::new(registry, Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(GraphError::NotACheckpoint { .. })));
    }
}
