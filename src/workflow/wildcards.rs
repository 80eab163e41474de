//! Wildcard Path Templates
//!
//! Bidirectional templates such as `data/{sample}/unit.{n}.data`:
//! - [`Template::render`] fills placeholders from a [`Binding`]
//! - [`Template::extract`] recovers a [`Binding`] from a concrete path
//! - [`glob`] enumerates the bindings present under a directory
//!
//! A placeholder may carry a regex constraint, `{n,[0-9]+}`. Without one it
//! matches `[^/]+`, so a placeholder never crosses a path separator.
//! `{{` and `}}` stand for literal braces.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use regex::Regex;

use crate::error::{GraphError, PatternError};
use crate::store::StateStore;

/// Placeholder name -> value.
pub type Binding = BTreeMap<String, String>;

/// Constraint used for placeholders that don't declare one.
pub const DEFAULT_CONSTRAINT: &str = "[^/]+";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder {
        name: String,
        constraint: Option<String>,
    },
}

/// A parsed path template with its compiled matcher.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
    matcher: Regex,
    /// Placeholder name for each capture group, in order of appearance.
    groups: Vec<String>,
}

impl Template {
    /// Parses a template.
    ///
    /// # Example
    /// ```
    /// use ruleflow::workflow::wildcards::Template;
    ///
    /// let template = Template::parse("reads/{sample}.fastq").unwrap();
    /// assert_eq!(template.names(), vec!["sample"]);
    /// ```
    pub fn parse(source: &str) -> Result<Self, PatternError> {
        let segments = tokenize(source)?;

        let mut constraints: BTreeMap<&str, &str> = BTreeMap::new();
        for segment in &segments {
            if let Segment::Placeholder {
                name,
                constraint: Some(c),
            } = segment
            {
                constraints.entry(name.as_str()).or_insert(c.as_str());
            }
        }

        let mut pattern = String::from("^");
        let mut groups = Vec::new();
        for segment in &segments {
            match segment {
                Segment::Literal(text) => pattern.push_str(&regex::escape(text)),
                Segment::Placeholder { name, .. } => {
                    let constraint = constraints
                        .get(name.as_str())
                        .copied()
                        .unwrap_or(DEFAULT_CONSTRAINT);
                    pattern.push_str(&format!("(?P<g{}>{})", groups.len(), constraint));
                    groups.push(name.clone());
                }
            }
        }
        pattern.push('$');

        let matcher = Regex::new(&pattern).map_err(|e| PatternError::InvalidTemplate {
            template: source.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: source.to_string(),
            segments,
            matcher,
            groups,
        })
    }

    /// Returns the template text as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Unique placeholder names in order of first appearance.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in &self.groups {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Returns true if the template has at least one placeholder.
    pub fn has_wildcards(&self) -> bool {
        !self.groups.is_empty()
    }

    /// Substitutes every placeholder. Extra entries in `binding` are ignored.
    pub fn render(&self, binding: &Binding) -> Result<String, PatternError> {
        self.render_with(|name| binding.get(name).cloned())
    }

    /// Substitutes every placeholder using a lookup function.
    pub fn render_with<F>(&self, mut lookup: F) -> Result<String, PatternError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { name, .. } => {
                    let value = lookup(name).ok_or_else(|| PatternError::UnboundPlaceholder {
                        template: self.source.clone(),
                        placeholder: name.clone(),
                    })?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }

    /// Substitutes bound placeholders and keeps the others open.
    ///
    /// The result is again a valid template: literal braces are re-escaped
    /// and open placeholders keep their constraints.
    pub fn render_partial(&self, binding: &Binding) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(&text.replace('{', "{{").replace('}', "}}")),
                Segment::Placeholder { name, constraint } => match binding.get(name) {
                    Some(value) => out.push_str(&value.replace('{', "{{").replace('}', "}}")),
                    None => match constraint {
                        Some(c) => out.push_str(&format!("{{{},{}}}", name, c)),
                        None => out.push_str(&format!("{{{}}}", name)),
                    },
                },
            }
        }
        out
    }

    /// Matches a concrete path against the template.
    ///
    /// Returns `Ok(None)` when the path does not match. A placeholder that
    /// occurs more than once must capture the same value every time.
    pub fn extract(&self, path: &str) -> Result<Option<Binding>, PatternError> {
        let Some(captures) = self.matcher.captures(path) else {
            return Ok(None);
        };

        let mut binding = Binding::new();
        for (index, name) in self.groups.iter().enumerate() {
            let value = captures
                .name(&format!("g{}", index))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();

            match binding.get(name) {
                Some(existing) if *existing != value => {
                    return Err(PatternError::InconsistentBinding {
                        template: self.source.clone(),
                        placeholder: name.clone(),
                        first: existing.clone(),
                        second: value,
                    });
                }
                Some(_) => {}
                None => {
                    binding.insert(name.clone(), value);
                }
            }
        }
        Ok(Some(binding))
    }

    /// Returns true if `path` matches and binds consistently.
    pub fn is_match(&self, path: &str) -> bool {
        self.candidate(path).is_some()
    }

    /// Like [`Template::extract`], but an inconsistent repeated placeholder
    /// counts as no match. Used when scanning many candidates.
    pub fn candidate(&self, path: &str) -> Option<Binding> {
        match self.extract(path) {
            Ok(binding) => binding,
            Err(e) => {
                debug!("Skipping '{}': {}", path, e);
                None
            }
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Splits a template into literal and placeholder segments.
fn tokenize(source: &str) -> Result<Vec<Segment>, PatternError> {
    let invalid = |reason: &str| PatternError::InvalidTemplate {
        template: source.to_string(),
        reason: reason.to_string(),
    };

    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = source.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '}' => return Err(invalid("unmatched '}'")),
            '{' => {
                // Constraints may contain braces of their own, e.g. {n,\d{3}}
                let mut depth = 1;
                let mut body = String::new();
                for inner in chars.by_ref() {
                    match inner {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    body.push(inner);
                }
                if depth != 0 {
                    return Err(invalid("unclosed '{'"));
                }

                let (name, constraint) = match body.split_once(',') {
                    Some((name, constraint)) => (name.trim(), Some(constraint.trim().to_string())),
                    None => (body.trim(), None),
                };
                if name.is_empty() {
                    return Err(invalid("empty placeholder name"));
                }
                if constraint.as_deref() == Some("") {
                    return Err(invalid("empty placeholder constraint"));
                }

                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder {
                    name: name.to_string(),
                    constraint,
                });
            }
            _ => literal.push(ch),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Checks if a string contains wildcard syntax.
pub fn has_wildcards(text: &str) -> bool {
    Template::parse(text)
        .map(|t| t.has_wildcards())
        .unwrap_or(false)
}

/// Returns true if `name` is usable as a path placeholder.
pub fn is_valid_wildcard_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Renders `template` with `binding`.
///
/// # Example
/// ```
/// use ruleflow::workflow::wildcards::{render, Binding};
///
/// let mut binding = Binding::new();
/// binding.insert("n".to_string(), "0".to_string());
/// assert_eq!(render("unit.{n}.data", &binding).unwrap(), "unit.0.data");
/// ```
pub fn render(template: &str, binding: &Binding) -> Result<String, PatternError> {
    Template::parse(template)?.render(binding)
}

/// Extracts a binding from `path` matched against `template`.
pub fn extract(template: &str, path: &str) -> Result<Option<Binding>, PatternError> {
    Template::parse(template)?.extract(path)
}

/// Matches every entry of a directory listing against `template`.
///
/// Returns the distinct bindings in sorted order; nothing matching yields an
/// empty list.
pub fn glob_files(template: &Template, files: &[String]) -> Vec<Binding> {
    let mut bindings: Vec<Binding> = files.iter().filter_map(|file| template.candidate(file)).collect();
    bindings.sort();
    bindings.dedup();
    bindings
}

/// Globs `directory` in `store` against `template` (relative to the directory).
///
/// A missing directory is treated like an empty one; callers that must tell
/// the two apart check [`StateStore::exists`] first.
pub fn glob(
    store: &dyn StateStore,
    template: &str,
    directory: &str,
) -> Result<Vec<Binding>, GraphError> {
    let template = Template::parse(template)?;
    let files = store.list(directory)?.unwrap_or_default();
    let bindings = glob_files(&template, &files);
    debug!(
        "Glob '{}' in '{}': {} of {} files matched",
        template,
        directory,
        bindings.len(),
        files.len()
    );
    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn binding(pairs: &[(&str, &str)]) -> Binding {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render() {
        let result = render("reads/{sample}.fastq", &binding(&[("sample", "s1")]));
        assert_eq!(result.unwrap(), "reads/s1.fastq");
    }

    #[test]
    fn test_render_unbound_placeholder() {
        let err = render("reads/{sample}_{lane}.fastq", &binding(&[("sample", "s1")]))
            .unwrap_err();
        assert_eq!(
            err,
            PatternError::UnboundPlaceholder {
                template: "reads/{sample}_{lane}.fastq".to_string(),
                placeholder: "lane".to_string(),
            }
        );
    }

    #[test]
    fn test_extract() {
        let result = extract("data/{sample}/unit.{n}.data", "data/s1/unit.7.data").unwrap();
        assert_eq!(result, Some(binding(&[("sample", "s1"), ("n", "7")])));
    }

    #[test]
    fn test_extract_no_match() {
        assert_eq!(extract("{sample}.bam", "s1.sam").unwrap(), None);
        // Placeholders do not cross directory boundaries
        assert_eq!(extract("{sample}.bam", "dir/s1.bam").unwrap(), None);
    }

    #[test]
    fn test_extract_repeated_placeholder_consistent() {
        let result = extract("{sample}/{sample}.vcf", "s1/s1.vcf").unwrap();
        assert_eq!(result, Some(binding(&[("sample", "s1")])));
    }

    #[test]
    fn test_extract_repeated_placeholder_inconsistent() {
        let err = extract("{sample}/{sample}.vcf", "s1/s2.vcf").unwrap_err();
        assert!(matches!(
            err,
            PatternError::InconsistentBinding { ref placeholder, .. } if placeholder == "sample"
        ));
    }

    #[test]
    fn test_extract_greedy() {
        let result = extract("{name}.{ext}", "assembly.polished.fasta").unwrap();
        assert_eq!(
            result,
            Some(binding(&[("name", "assembly.polished"), ("ext", "fasta")]))
        );
    }

    #[test]
    fn test_constraint() {
        let template = Template::parse("unit.{n,[0-9]+}.request").unwrap();
        assert!(template.is_match("unit.12.request"));
        assert!(!template.is_match("unit.x.request"));
        assert_eq!(template.names(), vec!["n"]);
    }

    #[test]
    fn test_constraint_with_braces() {
        let template = Template::parse(r"chr{num,\d{2}}.fa").unwrap();
        assert!(template.is_match("chr07.fa"));
        assert!(!template.is_match("chr7.fa"));
    }

    #[test]
    fn test_literal_braces() {
        let template = Template::parse("awk '{{print $1}}' {input}").unwrap();
        assert_eq!(template.names(), vec!["input"]);
        let rendered = template.render(&binding(&[("input", "a.txt")])).unwrap();
        assert_eq!(rendered, "awk '{print $1}' a.txt");
    }

    #[test]
    fn test_invalid_templates() {
        assert!(Template::parse("{sample").is_err());
        assert!(Template::parse("sample}").is_err());
        assert!(Template::parse("{}.txt").is_err());
        assert!(Template::parse("{n,}.txt").is_err());
        assert!(Template::parse("{n,[}.txt").is_err());
    }

    #[test]
    fn test_round_trip() {
        let templates = [
            "unit.{n}.data",
            "data/{sample}/{lane}_{read}.fastq.gz",
            "{sample}/{sample}.{caller}.vcf",
            "results/{asm,[a-z]+}-{hap}/contigs.fa",
        ];
        let bindings = [
            binding(&[("n", "0")]),
            binding(&[("sample", "HG002"), ("lane", "L001"), ("read", "R1")]),
            binding(&[("sample", "NA12878"), ("caller", "deepvariant")]),
            binding(&[("asm", "hifiasm"), ("hap", "hap1")]),
        ];
        for (template, binding) in templates.iter().zip(bindings.iter()) {
            let rendered = render(template, binding).unwrap();
            let extracted = extract(template, &rendered).unwrap();
            assert_eq!(extracted.as_ref(), Some(binding), "template {}", template);
        }
    }

    #[test]
    fn test_render_partial() {
        let template = Template::parse("{subfolder}/unit.{n,[0-9]+}.request").unwrap();
        let partial = template.render_partial(&binding(&[("subfolder", "batch1")]));
        assert_eq!(partial, "batch1/unit.{n,[0-9]+}.request");

        let reparsed = Template::parse(&partial).unwrap();
        assert_eq!(reparsed.names(), vec!["n"]);
    }

    #[test]
    fn test_has_wildcards() {
        assert!(has_wildcards("{sample}.fastq"));
        assert!(has_wildcards("output/{id}.txt"));
        assert!(!has_wildcards("regular_file.txt"));
        assert!(!has_wildcards("escaped_{{braces}}.txt"));
    }

    #[test]
    fn test_is_valid_wildcard_name() {
        assert!(is_valid_wildcard_name("sample"));
        assert!(is_valid_wildcard_name("_n2"));
        assert!(!is_valid_wildcard_name("2n"));
        assert!(!is_valid_wildcard_name("wildcards.sample"));
    }

    #[test]
    fn test_glob_files_sorted_and_filtered() {
        let template = Template::parse("unit.{n}.request").unwrap();
        let files = vec![
            "unit.2.request".to_string(),
            "unit.0.request".to_string(),
            "notes.txt".to_string(),
            "unit.1.request".to_string(),
        ];
        let found = glob_files(&template, &files);
        assert_eq!(
            found,
            vec![
                binding(&[("n", "0")]),
                binding(&[("n", "1")]),
                binding(&[("n", "2")]),
            ]
        );
    }

    #[test]
    fn test_glob_skips_inconsistent_entries() {
        let template = Template::parse("{s}/{s}.vcf").unwrap();
        assert!(template.extract("a/b.vcf").is_err());
        assert!(template.candidate("a/b.vcf").is_none());

        let files = vec!["a/a.vcf".to_string(), "a/b.vcf".to_string(), "c/c.vcf".to_string()];
        let found = glob_files(&template, &files);
        assert_eq!(found, vec![binding(&[("s", "a")]), binding(&[("s", "c")])]);

        let store = MemoryStore::new();
        store.write("calls/a/a.vcf", "").unwrap();
        store.write("calls/stray/other.vcf", "").unwrap();
        assert_eq!(glob(&store, "{s}/{s}.vcf", "calls").unwrap().len(), 1);
    }

    #[test]
    fn test_glob_empty_and_missing() {
        let store = MemoryStore::new();
        assert!(glob(&store, "{n}.request", "missing").unwrap().is_empty());

        store.mkdir("empty");
        assert!(glob(&store, "{n}.request", "empty").unwrap().is_empty());
    }

    #[test]
    fn test_glob_store() {
        let store = MemoryStore::new();
        store.write("requests/s1/a.request", "").unwrap();
        store.write("requests/s1/b.request", "").unwrap();
        store.write("requests/s2/c.request", "").unwrap();

        let found = glob(&store, "{unit}.request", "requests/s1").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0]["unit"], "a");
    }
}
