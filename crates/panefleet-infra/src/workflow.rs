//! Workflow file discovery.
//!
//! Walks a directory tree for `.yaml`, `.yml` and `.toml` files and parses
//! each one. Files that fail to parse are logged and skipped so one broken
//! file does not hide the rest.

use std::path::{Path, PathBuf};

use anyhow::Context;
use panefleet_core::workflow::definition::parse_workflow;
use panefleet_types::workflow::Workflow;

/// A parsed workflow and the file it came from.
#[derive(Debug, Clone)]
pub struct DiscoveredWorkflow {
    pub path: PathBuf,
    pub workflow: Workflow,
}

fn workflow_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    matches!(ext.as_str(), "yaml" | "yml" | "toml").then_some(ext)
}

/// Discover every workflow under `dir`, sorted by path.
///
/// A missing directory yields an empty list.
pub async fn discover_workflows(dir: &Path) -> anyhow::Result<Vec<DiscoveredWorkflow>> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        tracing::debug!("Workflow directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .with_context(|| format!("failed to read directory {}", current.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            let Some(ext) = workflow_extension(&path) else {
                continue;
            };

            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(err) => {
                    tracing::warn!("Skipping {}: {err}", path.display());
                    continue;
                }
            };
            match parse_workflow(&content, &ext) {
                Ok(workflow) => found.push(DiscoveredWorkflow { path, workflow }),
                Err(err) => {
                    tracing::warn!(
                        "Skipping {}: {}",
                        path.display(),
                        err.with_file(path.display().to_string())
                    );
                }
            }
        }
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));
    tracing::debug!(count = found.len(), dir = %dir.display(), "discovered workflows");
    Ok(found)
}

/// Find a workflow by its declared name, falling back to the file stem.
pub async fn find_workflow(dir: &Path, name: &str) -> anyhow::Result<Option<DiscoveredWorkflow>> {
    let discovered = discover_workflows(dir).await?;
    if let Some(pos) = discovered.iter().position(|d| d.workflow.name == name) {
        return Ok(discovered.into_iter().nth(pos));
    }
    Ok(discovered
        .into_iter()
        .find(|d| d.path.file_stem().and_then(|s| s.to_str()) == Some(name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const YAML: &str = r#"
schema_version: "2.0"
name: build
steps:
  - id: compile
    prompt: "compile it"
"#;

    const TOML: &str = r#"
schema_version = "2.0"
name = "deploy"

[[steps]]
id = "ship"
prompt = "ship it"
"#;

    #[tokio::test]
    async fn discovers_nested_files_sorted() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("nested")).await.unwrap();
        tokio::fs::write(tmp.path().join("b.yaml"), YAML).await.unwrap();
        tokio::fs::write(tmp.path().join("nested/a.toml"), TOML).await.unwrap();
        tokio::fs::write(tmp.path().join("notes.md"), "ignored").await.unwrap();

        let found = discover_workflows(tmp.path()).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].path.ends_with("b.yaml"));
        assert_eq!(found[0].workflow.name, "build");
        assert_eq!(found[1].workflow.name, "deploy");
    }

    #[tokio::test]
    async fn unparseable_files_are_skipped() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("good.yml"), YAML).await.unwrap();
        tokio::fs::write(tmp.path().join("bad.yaml"), "steps: [unclosed").await.unwrap();

        let found = discover_workflows(tmp.path()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].workflow.name, "build");
    }

    #[tokio::test]
    async fn missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let found = discover_workflows(&tmp.path().join("absent")).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn find_by_name_or_stem() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("ci.yaml"), YAML).await.unwrap();

        let by_name = find_workflow(tmp.path(), "build").await.unwrap().unwrap();
        assert!(by_name.path.ends_with("ci.yaml"));
        let by_stem = find_workflow(tmp.path(), "ci").await.unwrap().unwrap();
        assert_eq!(by_stem.workflow.name, "build");
        assert!(find_workflow(tmp.path(), "nope").await.unwrap().is_none());
    }
}
