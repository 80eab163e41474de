//! Rule Validation
//!
//! Static checks run when a rule is registered, before any target is
//! resolved:
//! - Rule field validation
//! - Template syntax and wildcard consistency
//! - Checkpoint references across the registry

use std::collections::BTreeSet;

use log::{debug, warn};

use super::model::{InputSpec, Rule, RuleBody};
use super::wildcards::{is_valid_wildcard_name, Template};
use crate::error::GraphError;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyRuleId,
    NoOutputs(String),
    EmptyCommand(String),
    InvalidTemplate { rule: String, reason: String },
    InvalidWildcardName { rule: String, name: String },
    OutputWildcardMismatch { rule: String, output: String },
    UnboundInputWildcard { rule: String, input: String, name: String },
    ZeroThreads(String),
    ZeroAttempts(String),
    UnknownCheckpoint { rule: String, checkpoint: String },
    NotACheckpoint { rule: String, checkpoint: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyRuleId => write!(f, "Rule has empty or whitespace-only ID"),
            Self::NoOutputs(rule) => write!(f, "Rule '{}' declares no outputs", rule),
            Self::EmptyCommand(rule) => write!(f, "Rule '{}' has an empty command", rule),
            Self::InvalidTemplate { rule, reason } => write!(f, "Rule '{}': {}", rule, reason),
            Self::InvalidWildcardName { rule, name } => {
                write!(f, "Rule '{}': '{}' is not a valid wildcard name", rule, name)
            }
            Self::OutputWildcardMismatch { rule, output } => write!(
                f,
                "Rule '{}': output '{}' does not use the same wildcards as the first output",
                rule, output
            ),
            Self::UnboundInputWildcard { rule, input, name } => write!(
                f,
                "Rule '{}': input '{}' uses {{{}}} which no output binds",
                rule, input, name
            ),
            Self::ZeroThreads(rule) => write!(f, "Rule '{}' requests zero threads", rule),
            Self::ZeroAttempts(rule) => write!(f, "Rule '{}' allows zero attempts", rule),
            Self::UnknownCheckpoint { rule, checkpoint } => {
                write!(f, "Rule '{}' references unknown checkpoint '{}'", rule, checkpoint)
            }
            Self::NotACheckpoint { rule, checkpoint } => {
                write!(f, "Rule '{}' depends on '{}', which is not a checkpoint", rule, checkpoint)
            }
        }
    }
}

fn parse(rule: &Rule, source: &str, errors: &mut Vec<ValidationError>) -> Option<Template> {
    match Template::parse(source) {
        Ok(template) => Some(template),
        Err(e) => {
            errors.push(ValidationError::InvalidTemplate {
                rule: rule.id.clone(),
                reason: e.to_string(),
            });
            None
        }
    }
}

/// Validates a single rule's fields and templates.
pub fn validate_rule(rule: &Rule) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if rule.id.trim().is_empty() {
        errors.push(ValidationError::EmptyRuleId);
        return errors;
    }

    if rule.outputs.is_empty() {
        errors.push(ValidationError::NoOutputs(rule.id.clone()));
    }

    // Every output must carry the same wildcard set, so one binding
    // determines all of them.
    let mut output_names: Option<BTreeSet<String>> = None;
    for output in &rule.outputs {
        let Some(template) = parse(rule, output, &mut errors) else {
            continue;
        };
        let names: BTreeSet<String> = template.names().into_iter().collect();
        for name in &names {
            if !is_valid_wildcard_name(name) {
                errors.push(ValidationError::InvalidWildcardName {
                    rule: rule.id.clone(),
                    name: name.clone(),
                });
            }
        }
        match &output_names {
            None => output_names = Some(names),
            Some(first) if *first != names => {
                errors.push(ValidationError::OutputWildcardMismatch {
                    rule: rule.id.clone(),
                    output: output.clone(),
                });
            }
            Some(_) => {}
        }
    }
    let output_names = output_names.unwrap_or_default();

    let unbound = |input: &str, template: &Template, extra: &BTreeSet<String>| {
        template
            .names()
            .into_iter()
            .filter(|name| !output_names.contains(name) && !extra.contains(name))
            .map(|name| ValidationError::UnboundInputWildcard {
                rule: rule.id.clone(),
                input: input.to_string(),
                name,
            })
            .collect::<Vec<_>>()
    };

    for input in &rule.inputs {
        match input {
            InputSpec::Path(source) => {
                if let Some(template) = parse(rule, source, &mut errors) {
                    errors.extend(unbound(source, &template, &BTreeSet::new()));
                }
            }
            InputSpec::Lazy(lazy) => {
                debug!("Rule '{}' has lazy input '{}'", rule.id, lazy.label);
            }
            InputSpec::Checkpoint(checkpoint) => {
                let pattern = parse(rule, &checkpoint.pattern, &mut errors);
                let materialize = parse(rule, &checkpoint.materialize, &mut errors);
                if let (Some(pattern), Some(materialize)) = (pattern, materialize) {
                    // The materialization template may use discovered wildcards.
                    let discovered: BTreeSet<String> = pattern.names().into_iter().collect();
                    errors.extend(unbound(&checkpoint.materialize, &materialize, &discovered));
                }
            }
        }
    }

    if let Some(log) = &rule.log {
        if let Some(template) = parse(rule, log, &mut errors) {
            errors.extend(unbound(log, &template, &BTreeSet::new()));
        }
    }

    match &rule.body {
        RuleBody::Command(command) => {
            if command.trim().is_empty() {
                errors.push(ValidationError::EmptyCommand(rule.id.clone()));
            } else {
                parse(rule, command, &mut errors);
            }

            if command.contains("{input}") && rule.inputs.is_empty() {
                warn!(
                    "Rule '{}': command uses {{input}} but no input specified",
                    rule.id
                );
            }
        }
        RuleBody::Procedure(procedure) => {
            debug!("Rule '{}' runs procedure '{}'", rule.id, procedure.name);
        }
    }

    if rule.resources.threads == 0 {
        errors.push(ValidationError::ZeroThreads(rule.id.clone()));
    }
    if rule.max_attempts == Some(0) {
        errors.push(ValidationError::ZeroAttempts(rule.id.clone()));
    }

    errors
}

/// Validates a rule, folding all problems into one [`GraphError::InvalidRule`].
pub fn check_rule(rule: &Rule) -> Result<(), GraphError> {
    let errors = validate_rule(rule);
    if errors.is_empty() {
        return Ok(());
    }
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    Err(GraphError::InvalidRule {
        rule: rule.id.clone(),
        reason: messages.join("; "),
    })
}

/// Checks that every checkpoint input names a registered checkpoint rule.
pub fn check_checkpoint_references<'a, I>(rules: I) -> Result<(), GraphError>
where
    I: IntoIterator<Item = &'a Rule> + Clone,
{
    for rule in rules.clone() {
        for input in &rule.inputs {
            let InputSpec::Checkpoint(checkpoint) = input else {
                continue;
            };
            match rules.clone().into_iter().find(|r| r.id == checkpoint.checkpoint) {
                None => {
                    return Err(GraphError::InvalidRule {
                        rule: rule.id.clone(),
                        reason: ValidationError::UnknownCheckpoint {
                            rule: rule.id.clone(),
                            checkpoint: checkpoint.checkpoint.clone(),
                        }
                        .to_string(),
                    })
                }
                Some(target) if !target.checkpoint => {
                    return Err(GraphError::NotACheckpoint {
                        consumer: rule.id.clone(),
                        rule: target.id.clone(),
                    })
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_rule() {
        let rule = Rule::shell("fetch", "fetch {input} > {output}")
            .with_input("requests/{sample}/{unit}.request")
            .with_output("data/{sample}/{unit}.data");
        assert!(validate_rule(&rule).is_empty());
        assert!(check_rule(&rule).is_ok());
    }

    #[test]
    fn test_empty_id() {
        let rule = Rule::shell("   ", "true").with_output("x");
        assert_eq!(validate_rule(&rule), vec![ValidationError::EmptyRuleId]);
    }

    #[test]
    fn test_no_outputs() {
        let rule = Rule::shell("lonely", "true");
        assert!(validate_rule(&rule).contains(&ValidationError::NoOutputs("lonely".to_string())));
    }

    #[test]
    fn test_empty_command() {
        let rule = Rule::shell("blank", "   ").with_output("x");
        assert!(validate_rule(&rule).contains(&ValidationError::EmptyCommand("blank".to_string())));
    }

    #[test]
    fn test_output_wildcard_mismatch() {
        let rule = Rule::shell("split", "true")
            .with_output("{sample}.a")
            .with_output("{sample}.{part}.b");
        let errors = validate_rule(&rule);
        assert!(matches!(
            errors.as_slice(),
            [ValidationError::OutputWildcardMismatch { output, .. }] if output == "{sample}.{part}.b"
        ));
    }

    #[test]
    fn test_multiple_outputs_under_prefix() {
        let rule = Rule::shell("bng", "process_bng_hybrid --prefix {wildcards.asm} {input}")
            .with_input("hybrid/{asm}.agp")
            .with_output("bng/{asm}/scaffolds.fa")
            .with_output("bng/{asm}/unscaffolded.fa")
            .with_output("bng/{asm}/report.tsv");
        assert!(validate_rule(&rule).is_empty());
    }

    #[test]
    fn test_unbound_input_wildcard() {
        let rule = Rule::shell("call", "true")
            .with_input("{sample}/{lane}.bam")
            .with_output("{sample}.vcf");
        let errors = validate_rule(&rule);
        assert_eq!(
            errors,
            vec![ValidationError::UnboundInputWildcard {
                rule: "call".to_string(),
                input: "{sample}/{lane}.bam".to_string(),
                name: "lane".to_string(),
            }]
        );
    }

    #[test]
    fn test_checkpoint_materialize_may_use_discovered_names() {
        let rule = Rule::manifest("fofn")
            .with_checkpoint_input("scan", "{unit}.request", "data/{sample}/{unit}.data")
            .with_output("manifests/{sample}.fofn");
        assert!(validate_rule(&rule).is_empty());

        let rule = Rule::manifest("fofn")
            .with_checkpoint_input("scan", "{unit}.request", "data/{sample}/{lane}.data")
            .with_output("manifests/{sample}.fofn");
        assert_eq!(validate_rule(&rule).len(), 1);
    }

    #[test]
    fn test_invalid_template() {
        let rule = Rule::shell("broken", "true").with_output("out/{sample");
        assert!(matches!(
            validate_rule(&rule).as_slice(),
            [ValidationError::InvalidTemplate { .. }]
        ));
    }

    #[test]
    fn test_invalid_wildcard_name() {
        let rule = Rule::shell("dotted", "true").with_output("out/{a.b}.txt");
        assert!(validate_rule(&rule)
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidWildcardName { name, .. } if name == "a.b")));
    }

    #[test]
    fn test_zero_threads_and_attempts() {
        let rule = Rule::shell("zero", "true")
            .with_output("z")
            .with_threads(0)
            .with_max_attempts(0);
        let errors = validate_rule(&rule);
        assert!(errors.contains(&ValidationError::ZeroThreads("zero".to_string())));
        assert!(errors.contains(&ValidationError::ZeroAttempts("zero".to_string())));
    }

    #[test]
    fn test_check_rule_folds_errors() {
        let rule = Rule::shell("bad", "").with_threads(0);
        match check_rule(&rule) {
            Err(GraphError::InvalidRule { rule, reason }) => {
                assert_eq!(rule, "bad");
                assert!(reason.contains("no outputs"));
                assert!(reason.contains("zero threads"));
            }
            other => panic!("expected InvalidRule, got {:?}", other),
        }
    }

    #[test]
    fn test_checkpoint_references() {
        let scan = Rule::shell("scan", "true").with_output("req/{s}").as_checkpoint();
        let plain = Rule::shell("plain", "true").with_output("plain/{s}");
        let fofn = Rule::manifest("fofn")
            .with_checkpoint_input("scan", "{u}.r", "d/{s}/{u}")
            .with_output("{s}.fofn");
        let bad = Rule::manifest("bad")
            .with_checkpoint_input("plain", "{u}.r", "d/{s}/{u}")
            .with_output("{s}.bad");
        let orphan = Rule::manifest("orphan")
            .with_checkpoint_input("nowhere", "{u}.r", "d/{s}/{u}")
            .with_output("{s}.orphan");

        assert!(check_checkpoint_references([&scan, &fofn]).is_ok());
        assert!(matches!(
            check_checkpoint_references([&scan, &plain, &bad]),
            Err(GraphError::NotACheckpoint { consumer, rule }) if consumer == "bad" && rule == "plain"
        ));
        assert!(matches!(
            check_checkpoint_references([&orphan]),
            Err(GraphError::InvalidRule { .. })
        ));
    }
}
