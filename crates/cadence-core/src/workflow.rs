use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Static workflow metadata loaded from a `workflow.yaml` next to its
/// `instructions.md` template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_phase")]
    pub phase: u8,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableSpec>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(skip)]
    pub installed_path: PathBuf,
}

fn default_phase() -> u8 {
    4
}

impl WorkflowDefinition {
    pub fn instructions(&self) -> String {
        let path = self.installed_path.join("instructions.md");
        std::fs::read_to_string(path).unwrap_or_default()
    }

    pub fn template(&self, name: &str) -> Option<String> {
        let file = self.templates.get(name)?;
        std::fs::read_to_string(self.installed_path.join(file)).ok()
    }
}

/// Loads every workflow definition under the workflows root at startup and
/// serves lookups by name.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, WorkflowDefinition>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        if !root.exists() {
            tracing::warn!(root = %root.display(), "workflows root missing; registry is empty");
            return Ok(registry);
        }
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let manifest = entry.path().join("workflow.yaml");
            if !manifest.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(&manifest)?;
            match serde_yaml::from_str::<WorkflowDefinition>(&raw) {
                Ok(mut definition) => {
                    definition.installed_path = entry.path();
                    tracing::debug!(workflow = definition.name, "workflow loaded");
                    registry.register(definition);
                }
                Err(error) => {
                    tracing::warn!(
                        manifest = %manifest.display(),
                        error = %error,
                        "skipping unparseable workflow definition"
                    );
                }
            }
        }
        tracing::info!(count = registry.len(), "workflow registry loaded");
        Ok(registry)
    }

    pub fn register(&mut self, definition: WorkflowDefinition) {
        self.workflows.insert(definition.name.clone(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_workflow(root: &Path, name: &str, body: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("workflow.yaml"), body).expect("manifest");
        std::fs::write(dir.join("instructions.md"), format!("Run {name} for {{{{project_name}}}}"))
            .expect("instructions");
    }

    #[test]
    fn registry_loads_definitions_from_disk() {
        let dir = TempDir::new().expect("tempdir");
        write_workflow(
            dir.path(),
            "tech-spec",
            "name: tech-spec\ndescription: Write the technical specification\nphase: 2\nvariables:\n  project_name:\n    required: true\n  output_folder:\n    default: docs\n",
        );
        write_workflow(dir.path(), "dev-story", "name: dev-story\nphase: 4\n");

        let registry = WorkflowRegistry::load(dir.path()).expect("load");
        assert_eq!(registry.len(), 2);

        let tech_spec = registry.get("tech-spec").expect("present");
        assert_eq!(tech_spec.phase, 2);
        assert!(tech_spec.variables.get("project_name").expect("var").required);
        assert!(tech_spec.instructions().contains("{{project_name}}"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn unparseable_manifests_are_skipped() {
        let dir = TempDir::new().expect("tempdir");
        write_workflow(dir.path(), "good", "name: good\n");
        let bad = dir.path().join("bad");
        std::fs::create_dir_all(&bad).expect("mkdir");
        std::fs::write(bad.join("workflow.yaml"), ":: not yaml ::").expect("write");

        let registry = WorkflowRegistry::load(dir.path()).expect("load");
        assert_eq!(registry.names(), vec!["good"]);
    }

    #[test]
    fn missing_root_yields_empty_registry() {
        let dir = TempDir::new().expect("tempdir");
        let registry =
            WorkflowRegistry::load(&dir.path().join("nope")).expect("load tolerates missing root");
        assert!(registry.is_empty());
    }
}
