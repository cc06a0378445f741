//! Declared dependencies of the codebase under remediation.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Normalises a package name for comparison (`Foo-Bar` and `foo_bar` match).
pub fn normalize_package_name(name: &str) -> String {
    name.trim().to_lowercase().replace(['-', '.'], "_")
}

/// Merged view of every dependency declaration found at the repository root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyManifest {
    /// Manifest files that contributed, e.g. `Cargo.toml`.
    pub sources: Vec<String>,
    /// Normalised package names.
    pub packages: BTreeSet<String>,
}

impl DependencyManifest {
    /// Loads every recognised manifest file under `root`.
    ///
    /// Unreadable or unparsable files are skipped with a warning.
    pub fn load(root: &Path) -> Self {
        let mut manifest = Self::default();

        let loaders: [(&str, fn(&str) -> Result<Vec<String>, String>); 4] = [
            ("Cargo.toml", parse_cargo_toml),
            ("requirements.txt", parse_requirements_txt),
            ("pyproject.toml", parse_pyproject_toml),
            ("package.json", parse_package_json),
        ];

        for (file, parse) in loaders {
            let path = root.join(file);
            if !path.is_file() {
                continue;
            }
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(file, error = %e, "failed to read dependency manifest");
                    continue;
                }
            };
            match parse(&text) {
                Ok(names) => manifest.extend(file, names),
                Err(e) => tracing::warn!(file, error = %e, "failed to parse dependency manifest"),
            }
        }

        manifest
    }

    /// Adds names declared by `source`.
    pub fn extend(&mut self, source: &str, names: impl IntoIterator<Item = String>) {
        self.sources.push(source.to_string());
        self.packages
            .extend(names.into_iter().map(|n| normalize_package_name(&n)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains(&normalize_package_name(name))
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Short text form for prompts.
    pub fn render(&self) -> String {
        if self.packages.is_empty() {
            return "(no declared dependencies)".to_string();
        }
        let names: Vec<&str> = self.packages.iter().map(String::as_str).collect();
        format!("from {}: {}", self.sources.join(", "), names.join(", "))
    }
}

fn table_keys(value: Option<&toml::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_table())
        .map(|t| t.keys().cloned().collect())
        .unwrap_or_default()
}

fn parse_cargo_toml(text: &str) -> Result<Vec<String>, String> {
    let doc: toml::Value = text.parse().map_err(|e: toml::de::Error| e.to_string())?;
    let mut names = Vec::new();

    for section in ["dependencies", "dev-dependencies", "build-dependencies"] {
        names.extend(table_keys(doc.get(section)));
    }
    names.extend(table_keys(
        doc.get("workspace").and_then(|w| w.get("dependencies")),
    ));
    // The crate itself is importable by its own name.
    if let Some(name) = doc
        .get("package")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
    {
        names.push(name.to_string());
    }
    if let Some(name) = doc
        .get("lib")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
    {
        names.push(name.to_string());
    }

    Ok(names)
}

/// Extracts the distribution name from a PEP 508 requirement string.
fn requirement_name(line: &str) -> Option<String> {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() || line.starts_with('-') {
        return None;
    }
    let end = line
        .find(|c: char| "<>=!~[;@ ".contains(c))
        .unwrap_or(line.len());
    let name = line[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn parse_requirements_txt(text: &str) -> Result<Vec<String>, String> {
    Ok(text.lines().filter_map(requirement_name).collect())
}

fn parse_pyproject_toml(text: &str) -> Result<Vec<String>, String> {
    let doc: toml::Value = text.parse().map_err(|e: toml::de::Error| e.to_string())?;
    let mut names = Vec::new();

    if let Some(deps) = doc
        .get("project")
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_array())
    {
        names.extend(deps.iter().filter_map(|d| d.as_str()).filter_map(requirement_name));
    }
    names.extend(
        table_keys(
            doc.get("tool")
                .and_then(|t| t.get("poetry"))
                .and_then(|p| p.get("dependencies")),
        )
        .into_iter()
        .filter(|n| n != "python"),
    );
    if let Some(name) = doc
        .get("project")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
    {
        names.push(name.to_string());
    }

    Ok(names)
}

fn parse_package_json(text: &str) -> Result<Vec<String>, String> {
    let doc: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let mut names = Vec::new();
    for section in ["dependencies", "devDependencies", "peerDependencies"] {
        if let Some(obj) = doc.get(section).and_then(|v| v.as_object()) {
            names.extend(obj.keys().cloned());
        }
    }
    Ok(names)
}
