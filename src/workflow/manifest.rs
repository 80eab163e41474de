//! Manifest Writer
//!
//! A manifest is a plain list file: one path per line, sorted
//! lexicographically, without duplicates, terminated by a newline. Its bytes
//! depend only on the set of paths, never on the order they were discovered.
//!
//! Aggregation is all-or-nothing: an empty input list is refused and no file
//! is written, and every listed path must exist.

use log::{debug, info};

use crate::error::ManifestError;
use crate::store::StateStore;

/// Sorts and deduplicates `paths`.
pub fn build_manifest<S: AsRef<str>>(paths: &[S]) -> Vec<String> {
    let mut entries: Vec<String> = paths.iter().map(|p| p.as_ref().to_string()).collect();
    entries.sort();
    entries.dedup();
    entries
}

/// Renders manifest entries as file contents.
pub fn render_manifest(entries: &[String]) -> String {
    let mut contents = String::with_capacity(entries.iter().map(|e| e.len() + 1).sum());
    for entry in entries {
        contents.push_str(entry);
        contents.push('\n');
    }
    contents
}

/// Validates `inputs` and writes them as a manifest to `output`.
///
/// Returns the number of entries written. On any error nothing is written.
pub fn write_manifest(
    store: &dyn StateStore,
    inputs: &[String],
    output: &str,
) -> Result<usize, ManifestError> {
    if inputs.is_empty() {
        return Err(ManifestError::EmptyInput {
            output: output.to_string(),
        });
    }

    let entries = build_manifest(inputs);
    if let Some(missing) = entries.iter().find(|path| !store.exists(path)) {
        return Err(ManifestError::MissingInput {
            output: output.to_string(),
            path: missing.clone(),
        });
    }

    store.write(output, &render_manifest(&entries))?;
    info!("Wrote manifest {} ({} entries)", output, entries.len());
    Ok(entries.len())
}

/// Reads a manifest back into its entries.
pub fn read_manifest(store: &dyn StateStore, path: &str) -> Result<Vec<String>, ManifestError> {
    let contents = store.read(path)?;
    let entries: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    debug!("Read {} entries from {}", entries.len(), path);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_manifest_sorts_and_dedups() {
        let entries = build_manifest(&["b.data", "a.data", "b.data", "c.data"]);
        assert_eq!(entries, vec!["a.data", "b.data", "c.data"]);
    }

    #[test]
    fn test_manifest_bytes_independent_of_order() {
        let forward = render_manifest(&build_manifest(&["u.0", "u.1", "u.2"]));
        let backward = render_manifest(&build_manifest(&["u.2", "u.1", "u.0", "u.1"]));
        assert_eq!(forward, backward);
        assert_eq!(forward, "u.0\nu.1\nu.2\n");
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render_manifest(&[]), "");
    }

    #[test]
    fn test_write_manifest() {
        let store = MemoryStore::new();
        for unit in ["unit.2.data", "unit.0.data", "unit.1.data"] {
            store.write(unit, "x").unwrap();
        }

        let count = write_manifest(
            &store,
            &strings(&["unit.2.data", "unit.0.data", "unit.1.data"]),
            "out/parts.fofn",
        )
        .unwrap();

        assert_eq!(count, 3);
        assert_eq!(
            store.read("out/parts.fofn").unwrap(),
            "unit.0.data\nunit.1.data\nunit.2.data\n"
        );
        assert_eq!(
            read_manifest(&store, "out/parts.fofn").unwrap(),
            vec!["unit.0.data", "unit.1.data", "unit.2.data"]
        );
    }

    #[test]
    fn test_write_manifest_refuses_empty_input() {
        let store = MemoryStore::new();
        let result = write_manifest(&store, &[], "parts.fofn");

        assert!(matches!(result, Err(ManifestError::EmptyInput { .. })));
        assert!(!store.exists("parts.fofn"));
    }

    #[test]
    fn test_write_manifest_refuses_missing_input() {
        let store = MemoryStore::new();
        store.write("a.data", "x").unwrap();

        let result = write_manifest(&store, &strings(&["a.data", "b.data"]), "parts.fofn");
        match result {
            Err(ManifestError::MissingInput { path, .. }) => assert_eq!(path, "b.data"),
            other => panic!("expected MissingInput, got {:?}", other),
        }
        assert!(!store.exists("parts.fofn"));
    }
}
