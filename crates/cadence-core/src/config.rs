use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::STATE_DIR_NAME;

const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// System-wide workflow variable defaults (layer 2 of resolution).
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    /// User overrides (layer 3 of resolution).
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub workflows_root: Option<String>,
    #[serde(default)]
    pub auto_commit: Option<bool>,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub tracked_dirs: Option<Vec<String>>,
    #[serde(default)]
    pub agent_command: Option<String>,
}

/// Layered project configuration: built-in defaults underneath
/// `.cadence/config.yaml`. The file is optional; a missing or empty file
/// yields the built-ins.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    project_root: PathBuf,
    file: ConfigFile,
}

impl ConfigStore {
    pub fn load(project_root: &Path) -> anyhow::Result<Self> {
        let path = project_root.join(STATE_DIR_NAME).join(CONFIG_FILE_NAME);
        let file = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_yaml::from_str(&raw)?
        } else {
            ConfigFile::default()
        };
        Ok(Self {
            project_root: project_root.to_path_buf(),
            file,
        })
    }

    pub fn from_file(project_root: &Path, file: ConfigFile) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            file,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Canonical document locations plus anything the config file adds.
    pub fn workflow_defaults(&self) -> BTreeMap<String, String> {
        let mut defaults = builtin_defaults();
        defaults.extend(self.file.defaults.clone());
        defaults
    }

    pub fn user_overrides(&self) -> BTreeMap<String, String> {
        self.file.overrides.clone()
    }

    pub fn workflows_root(&self) -> PathBuf {
        match &self.file.workflows_root {
            Some(root) => self.project_root.join(root),
            None => self.project_root.join("workflows"),
        }
    }

    pub fn auto_commit(&self) -> bool {
        self.file.auto_commit.unwrap_or(false)
    }

    pub fn max_connections(&self) -> usize {
        self.file.max_connections.unwrap_or(64)
    }

    pub fn tracked_dirs(&self) -> Vec<String> {
        self.file.tracked_dirs.clone().unwrap_or_else(|| {
            vec!["docs".to_string(), "src".to_string(), "crates".to_string()]
        })
    }

    pub fn agent_command(&self) -> Option<&str> {
        self.file.agent_command.as_deref()
    }
}

fn builtin_defaults() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("docs_location".to_string(), "docs".to_string()),
        ("prd_location".to_string(), "docs/PRD.md".to_string()),
        (
            "architecture_location".to_string(),
            "docs/ARCHITECTURE.md".to_string(),
        ),
        (
            "stories_location".to_string(),
            "docs/stories".to_string(),
        ),
    ])
}
