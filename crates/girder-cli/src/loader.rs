//! Definition file loading.

use anyhow::{Context, Result};
use girder_core::definition::DefinitionSet;
use girder_core::registry::Registry;
use std::path::{Path, PathBuf};

/// Read one definition file, or every YAML/JSON file in a directory, into a
/// single definition set.
pub fn read_definitions(path: &Path) -> Result<DefinitionSet> {
    if !path.is_dir() {
        return read_file(path);
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("Failed to read directory {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_definition_file(p))
        .collect();
    files.sort();

    let mut merged = DefinitionSet::default();
    for file in files {
        let set = read_file(&file)?;
        merged.projects.extend(set.projects);
        merged.vcs_roots.extend(set.vcs_roots);
        merged.templates.extend(set.templates);
        merged.build_types.extend(set.build_types);
    }
    Ok(merged)
}

/// Read definitions and build a validated registry.
pub fn load_registry(path: &Path) -> Result<Registry> {
    let set = read_definitions(path)?;
    Registry::load(set).with_context(|| format!("Invalid definitions in {}", path.display()))
}

fn read_file(path: &Path) -> Result<DefinitionSet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse(path, &content)
}

/// Parse by extension: `.json` as JSON, anything else as YAML.
pub fn parse<T: serde::de::DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    let parsed = if has_extension(path, &["json"]) {
        serde_json::from_str(content).map_err(anyhow::Error::from)
    } else {
        serde_yaml::from_str(content).map_err(anyhow::Error::from)
    };
    parsed.with_context(|| format!("Failed to parse {}", path.display()))
}

fn is_definition_file(path: &Path) -> bool {
    path.is_file() && has_extension(path, &["yaml", "yml", "json"])
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use girder_core::error::Error;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const PROJECT: &str = "projects:\n  - id: Root\n    name: Root\n";

    #[test]
    fn test_directory_merges_yaml_and_json() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.yaml"), PROJECT).unwrap();
        std::fs::write(
            dir.path().join("b.json"),
            r#"{"build_types": [{"id": "Lib", "project": "Root", "name": "Lib"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = load_registry(dir.path()).unwrap();
        let ids: Vec<&str> = registry.build_type_ids().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["Lib"]);
    }

    #[test]
    fn test_configuration_error_is_kept_as_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("girder.yaml");
        let build_type =
            "build_types:\n  - id: Lib\n    project: Root\n    name: Lib\n    template: Missing\n";
        std::fs::write(&path, format!("{PROJECT}{build_type}")).unwrap();

        let err = load_registry(&path).unwrap_err();
        let source = err.downcast_ref::<Error>().unwrap();
        assert!(matches!(source, Error::MissingTemplate { .. }));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "projects: [").unwrap();

        let err = read_definitions(&path).unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }
}
