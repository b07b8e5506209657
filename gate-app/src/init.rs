//! Configuration scaffolding for `toolgate init`.
//!
//! Writes `~/.toolgate/config.toml` from the bundled template without
//! overwriting an existing file.

use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
struct TemplateFile {
    relative_path: &'static str,
    contents: &'static str,
}

const TEMPLATE_FILES: &[TemplateFile] = &[TemplateFile {
    relative_path: "config.toml",
    contents: include_str!("../../config-templates/config.toml"),
}];

pub async fn initialize_default() -> Result<InitReport> {
    let config_path = crate::config::default_config_path();
    let root = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid default config path: {}", config_path.display()))?
        .to_path_buf();
    initialize_at_root(&root).await
}

pub async fn initialize_at_root(root: &Path) -> Result<InitReport> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| anyhow::anyhow!("create config root {}: {e}", root.display()))?;

    let mut report = InitReport {
        root: root.to_path_buf(),
        ..InitReport::default()
    };

    for template in TEMPLATE_FILES {
        let target = root.join(template.relative_path);
        match tokio::fs::metadata(&target).await {
            Ok(_) => report.skipped.push(target),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(&target, template.contents)
                    .await
                    .map_err(|e| anyhow::anyhow!("write template {}: {e}", target.display()))?;
                tracing::info!(path = %target.display(), "config template written");
                report.created.push(target);
            }
            Err(err) => {
                return Err(anyhow::anyhow!("inspect {}: {err}", target.display()));
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::{TEMPLATE_FILES, initialize_at_root};
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("toolgate-init-{name}-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn init_writes_template_once() {
        let root = temp_root("once");
        let first = initialize_at_root(&root).await.expect("first init");
        assert_eq!(first.created.len(), TEMPLATE_FILES.len());
        assert!(root.join("config.toml").exists());

        let second = initialize_at_root(&root).await.expect("second init");
        assert!(second.created.is_empty());
        assert_eq!(second.skipped.len(), TEMPLATE_FILES.len());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn init_keeps_local_edits() {
        let root = temp_root("keep");
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(root.join("config.toml"), "# mine\n").expect("seed");

        initialize_at_root(&root).await.expect("init");
        let contents = std::fs::read_to_string(root.join("config.toml")).expect("read");
        assert_eq!(contents, "# mine\n");

        let _ = std::fs::remove_dir_all(root);
    }
}
