//! Rule Registry
//!
//! Holds validated rules with their parsed output templates and answers the
//! one question the graph builder asks: which rule produces this path?

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};

use super::model::Rule;
use super::validator::{check_checkpoint_references, check_rule};
use super::wildcards::{Binding, Template};
use crate::config::UserConfig;
use crate::error::GraphError;

/// A rule matched against a requested path.
#[derive(Debug, Clone)]
pub struct Producer {
    pub rule: Arc<Rule>,
    pub binding: Binding,
}

/// Registered rules in declaration order.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: Vec<Arc<Rule>>,
    outputs: Vec<Vec<Template>>,
    index: HashMap<String, usize>,
    config: UserConfig,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry carrying the pipeline's user config.
    pub fn with_config(config: UserConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Validates and adds a rule.
    pub fn register(&mut self, rule: Rule) -> Result<(), GraphError> {
        check_rule(&rule)?;
        if self.index.contains_key(&rule.id) {
            return Err(GraphError::DuplicateRule(rule.id));
        }

        let outputs = rule
            .outputs
            .iter()
            .map(|o| Template::parse(o))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Registered rule '{}' ({} outputs{})",
            rule.id,
            outputs.len(),
            if rule.checkpoint { ", checkpoint" } else { "" }
        );
        self.index.insert(rule.id.clone(), self.rules.len());
        self.rules.push(Arc::new(rule));
        self.outputs.push(outputs);
        Ok(())
    }

    /// Registers several rules, stopping at the first invalid one.
    pub fn register_all<I: IntoIterator<Item = Rule>>(&mut self, rules: I) -> Result<(), GraphError> {
        for rule in rules {
            self.register(rule)?;
        }
        Ok(())
    }

    /// Checks references between rules. Run once all rules are registered.
    pub fn check(&self) -> Result<(), GraphError> {
        check_checkpoint_references(self.rules.iter().map(|r| r.as_ref()))?;
        info!("Rule registry validated: {} rules", self.rules.len());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Rule>> {
        self.index.get(id).map(|&i| &self.rules[i])
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn config(&self) -> &UserConfig {
        &self.config
    }

    /// Finds the unique rule with an output template matching `path`.
    ///
    /// Returns `Ok(None)` when no rule matches. Several rules matching is an
    /// [`GraphError::AmbiguousRule`].
    pub fn find_producer(&self, path: &str) -> Result<Option<Producer>, GraphError> {
        let mut found: Option<Producer> = None;
        let mut matching: Vec<String> = Vec::new();

        for (rule, templates) in self.rules.iter().zip(&self.outputs) {
            for template in templates {
                if let Some(binding) = template.candidate(path) {
                    matching.push(rule.id.clone());
                    if found.is_none() {
                        found = Some(Producer {
                            rule: Arc::clone(rule),
                            binding,
                        });
                    }
                    break;
                }
            }
        }

        if matching.len() > 1 {
            return Err(GraphError::AmbiguousRule {
                path: path.to_string(),
                rules: matching,
            });
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RuleRegistry {
        let mut registry = RuleRegistry::new();
        registry
            .register_all([
                Rule::shell("scan", "scan {output}")
                    .with_output("requests/{sample}")
                    .as_checkpoint(),
                Rule::shell("fetch", "fetch {input} > {output}")
                    .with_input("requests/{sample}/{unit}.request")
                    .with_output("data/{sample}/{unit}.data"),
                Rule::manifest("fofn")
                    .with_checkpoint_input("scan", "{unit}.request", "data/{sample}/{unit}.data")
                    .with_output("manifests/{sample}.fofn"),
            ])
            .unwrap();
        registry
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.get("fetch").is_some());
        assert!(registry.get("missing").is_none());
        assert!(registry.check().is_ok());
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let mut registry = registry();
        let result = registry.register(Rule::shell("fetch", "true").with_output("other/{x}"));
        assert!(matches!(result, Err(GraphError::DuplicateRule(id)) if id == "fetch"));
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let mut registry = RuleRegistry::new();
        let result = registry.register(Rule::shell("empty", "true"));
        assert!(matches!(result, Err(GraphError::InvalidRule { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_find_producer() {
        let registry = registry();

        let producer = registry.find_producer("data/s1/unit.0.data").unwrap().unwrap();
        assert_eq!(producer.rule.id, "fetch");
        assert_eq!(producer.binding["sample"], "s1");
        assert_eq!(producer.binding["unit"], "unit.0");

        assert!(registry.find_producer("reads/s1.fastq").unwrap().is_none());
    }

    #[test]
    fn test_ambiguous_producer() {
        let mut registry = RuleRegistry::new();
        registry
            .register(Rule::shell("by_sample", "true").with_output("out/{sample}.txt"))
            .unwrap();
        registry
            .register(Rule::shell("by_name", "true").with_output("out/{name}.txt"))
            .unwrap();

        match registry.find_producer("out/x.txt") {
            Err(GraphError::AmbiguousRule { path, rules }) => {
                assert_eq!(path, "out/x.txt");
                assert_eq!(rules, vec!["by_sample", "by_name"]);
            }
            other => panic!("expected AmbiguousRule, got {:?}", other),
        }
    }

    #[test]
    fn test_constraints_disambiguate() {
        let mut registry = RuleRegistry::new();
        registry
            .register(Rule::shell("numbered", "true").with_output("out/{n,[0-9]+}.txt"))
            .unwrap();
        registry
            .register(Rule::shell("named", "true").with_output("out/{name,[a-z]+}.txt"))
            .unwrap();

        assert_eq!(registry.find_producer("out/42.txt").unwrap().unwrap().rule.id, "numbered");
        assert_eq!(registry.find_producer("out/abc.txt").unwrap().unwrap().rule.id, "named");
    }

    #[test]
    fn test_repeated_placeholder_mismatch_is_not_a_match() {
        let mut registry = RuleRegistry::new();
        registry
            .register(Rule::shell("pair", "true").with_output("{s}/{s}.vcf"))
            .unwrap();
        registry
            .register(Rule::shell("raw", "true").with_output("raw/{name}.vcf"))
            .unwrap();

        let producer = registry.find_producer("raw/x.vcf").unwrap().unwrap();
        assert_eq!(producer.rule.id, "raw");
        assert_eq!(producer.binding["name"], "x");

        let producer = registry.find_producer("s1/s1.vcf").unwrap().unwrap();
        assert_eq!(producer.rule.id, "pair");
    }

    #[test]
    fn test_user_config_carried() {
        let mut config = UserConfig::new();
        config.insert("remote".to_string(), serde_yaml::Value::from("s3://bucket"));
        let registry = RuleRegistry::with_config(config);
        assert!(registry.config().contains_key("remote"));
    }
}
