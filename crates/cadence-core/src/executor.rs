use std::collections::BTreeMap;

use chrono::Utc;
use thiserror::Error;

use crate::config::ConfigStore;
use crate::feature_paths::{FeatureError, FeaturePathResolver, PathType};
use crate::workflow::WorkflowDefinition;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("required variable '{var}' not provided for workflow '{workflow}'")]
    MissingRequired { var: String, workflow: String },

    #[error(transparent)]
    Feature(#[from] FeatureError),
}

/// Resolves workflow variables and renders instruction templates.
///
/// Resolution precedence, lowest to highest: process defaults
/// (`date`/`timestamp`), system config defaults, user config overrides,
/// workflow-declared defaults, caller parameters, feature-name resolution
/// plus the feature-scoped path family.
pub struct WorkflowExecutor {
    config: ConfigStore,
    feature_resolver: Option<FeaturePathResolver>,
}

impl WorkflowExecutor {
    pub fn new(config: ConfigStore, feature_resolver: Option<FeaturePathResolver>) -> Self {
        Self {
            config,
            feature_resolver,
        }
    }

    pub async fn resolve_variables(
        &self,
        workflow: &WorkflowDefinition,
        params: &BTreeMap<String, String>,
        context_metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, String>, ResolveError> {
        let mut variables = BTreeMap::new();

        // Layer 1: process-wide defaults.
        let now = Utc::now();
        variables.insert("date".to_string(), now.format("%Y-%m-%d").to_string());
        variables.insert("timestamp".to_string(), now.to_rfc3339());

        // Layer 2: system config defaults.
        variables.extend(self.config.workflow_defaults());

        // Layer 3: user config overrides.
        variables.extend(self.config.user_overrides());

        // Layer 4: workflow-declared defaults.
        for (name, spec) in &workflow.variables {
            if let Some(default) = &spec.default {
                variables.insert(name.clone(), default.clone());
            }
        }

        // Layer 5: caller parameters.
        variables.extend(params.clone());

        // Layer 6: feature-name resolution and the path family.
        if let Some(resolver) = &self.feature_resolver {
            match resolver.resolve_feature_name(&variables, context_metadata).await {
                Ok(feature_name) => {
                    variables.insert("feature_name".to_string(), feature_name);
                    self.insert_feature_paths(resolver, &mut variables);
                }
                Err(error @ FeatureError::UnknownFeature { .. }) => {
                    // An explicitly named but unknown feature is always an error.
                    return Err(error.into());
                }
                Err(error) => {
                    if workflow_requires_feature(workflow) {
                        return Err(error.into());
                    }
                    tracing::warn!(
                        workflow = workflow.name,
                        error = %error,
                        "feature name unresolved; using legacy paths"
                    );
                }
            }
        }

        for (name, spec) in &workflow.variables {
            if spec.required && !variables.contains_key(name) {
                return Err(ResolveError::MissingRequired {
                    var: name.clone(),
                    workflow: workflow.name.clone(),
                });
            }
        }

        tracing::debug!(
            workflow = workflow.name,
            count = variables.len(),
            "variables resolved"
        );
        Ok(variables)
    }

    /// Literal `{{key}}` substitution. Unresolved placeholders pass through
    /// unchanged; replacement values are inserted verbatim, so backslashes
    /// in native paths survive rendering.
    pub fn render_template(&self, template: &str, variables: &BTreeMap<String, String>) -> String {
        let mut rendered = template.to_string();
        for (key, value) in variables {
            rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
        }
        rendered
    }

    pub fn render_output_file(
        &self,
        workflow: &WorkflowDefinition,
        variables: &BTreeMap<String, String>,
    ) -> Option<String> {
        workflow
            .output_file
            .as_deref()
            .map(|template| self.render_template(template, variables))
    }

    fn insert_feature_paths(
        &self,
        resolver: &FeaturePathResolver,
        variables: &mut BTreeMap<String, String>,
    ) {
        let feature = match variables.get("feature_name") {
            Some(name) => name.clone(),
            None => return,
        };
        let epic = variables.get("epic").cloned();
        let epic_name = variables.get("epic_name").cloned();
        let story = variables.get("story").cloned();

        for path_type in PathType::ALL {
            if path_type.needs_epic() && epic.is_none() {
                continue;
            }
            if path_type.needs_story() && story.is_none() {
                continue;
            }
            let path = resolver.generate_feature_path(
                &feature,
                path_type,
                epic.as_deref(),
                epic_name.as_deref(),
                story.as_deref(),
            );
            let var_name = feature_path_variable(path_type);
            variables.insert(var_name, path.to_string_lossy().to_string());
        }
    }
}

fn feature_path_variable(path_type: PathType) -> String {
    let name = path_type.as_str();
    if name.ends_with("_folder")
        || name.ends_with("_location")
        || name.ends_with("_overview")
        || name.ends_with("_dir")
    {
        name.to_string()
    } else {
        format!("{name}_location")
    }
}

fn workflow_requires_feature(workflow: &WorkflowDefinition) -> bool {
    if let Some(output_file) = &workflow.output_file {
        if output_file.contains("{{feature_name}}") {
            return true;
        }
    }
    for spec in workflow.variables.values() {
        if let Some(default) = &spec.default {
            if default.contains("{{feature_name}}") {
                return true;
            }
        }
    }
    workflow
        .variables
        .get("feature_name")
        .map(|spec| spec.required)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use crate::workflow::VariableSpec;
    use cadence_store::StateStore;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn workflow_with(
        name: &str,
        variables: &[(&str, Option<&str>, bool)],
        output_file: Option<&str>,
    ) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            description: String::new(),
            phase: 4,
            variables: variables
                .iter()
                .map(|(var, default, required)| {
                    (
                        var.to_string(),
                        VariableSpec {
                            default: default.map(str::to_string),
                            required: *required,
                            description: None,
                        },
                    )
                })
                .collect(),
            required_tools: Vec::new(),
            templates: BTreeMap::new(),
            output_file: output_file.map(str::to_string),
            installed_path: PathBuf::new(),
        }
    }

    fn bare_executor(root: &std::path::Path) -> WorkflowExecutor {
        WorkflowExecutor::new(ConfigStore::from_file(root, ConfigFile::default()), None)
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn precedence_highest_binding_layer_wins() {
        let dir = TempDir::new().expect("tempdir");
        let config = ConfigStore::from_file(
            dir.path(),
            ConfigFile {
                defaults: BTreeMap::from([
                    ("docs_location".to_string(), "system-docs".to_string()),
                    ("author".to_string(), "system".to_string()),
                ]),
                overrides: BTreeMap::from([("author".to_string(), "user".to_string())]),
                ..ConfigFile::default()
            },
        );
        let executor = WorkflowExecutor::new(config, None);
        let workflow = workflow_with(
            "tech-spec",
            &[
                ("author", Some("workflow"), false),
                ("output_folder", Some("docs"), false),
            ],
            None,
        );

        // No params: workflow default shadows user override and system default.
        let resolved = executor
            .resolve_variables(&workflow, &params(&[]), None)
            .await
            .expect("resolve");
        assert_eq!(resolved.get("author"), Some(&"workflow".to_string()));
        assert_eq!(resolved.get("docs_location"), Some(&"system-docs".to_string()));

        // Caller params beat everything below them.
        let resolved = executor
            .resolve_variables(&workflow, &params(&[("author", "caller")]), None)
            .await
            .expect("resolve");
        assert_eq!(resolved.get("author"), Some(&"caller".to_string()));

        // Process defaults always present.
        assert!(resolved.contains_key("date"));
        assert!(resolved.contains_key("timestamp"));
    }

    #[tokio::test]
    async fn missing_required_variable_fails() {
        let dir = TempDir::new().expect("tempdir");
        let executor = bare_executor(dir.path());
        let workflow = workflow_with("create-story", &[("story_title", None, true)], None);

        let err = executor
            .resolve_variables(&workflow, &params(&[]), None)
            .await
            .expect_err("missing required");
        match err {
            ResolveError::MissingRequired { var, workflow } => {
                assert_eq!(var, "story_title");
                assert_eq!(workflow, "create-story");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn rendering_declared_defaults_leaves_no_placeholders() {
        let dir = TempDir::new().expect("tempdir");
        let executor = bare_executor(dir.path());
        let workflow = workflow_with(
            "tech-spec",
            &[
                ("project_name", Some("cadence"), false),
                ("output_folder", Some("docs"), false),
            ],
            None,
        );
        let resolved = executor
            .resolve_variables(&workflow, &params(&[]), None)
            .await
            .expect("resolve");

        let rendered = executor.render_template(
            "Write {{project_name}} spec into {{output_folder}} on {{date}}",
            &resolved,
        );
        assert!(!rendered.contains("{{"));
        assert!(rendered.contains("cadence"));
    }

    #[test]
    fn unresolved_placeholders_pass_through() {
        let dir = TempDir::new().expect("tempdir");
        let executor = bare_executor(dir.path());
        let rendered = executor.render_template("hello {{missing}}", &BTreeMap::new());
        assert_eq!(rendered, "hello {{missing}}");
    }

    #[test]
    fn backslashes_in_values_survive_rendering() {
        let dir = TempDir::new().expect("tempdir");
        let executor = bare_executor(dir.path());
        let vars = params(&[("project_root", r"C:\Users\dev\project")]);
        let rendered = executor.render_template("root: {{project_root}}", &vars);
        assert_eq!(rendered, r"root: C:\Users\dev\project");
    }

    #[tokio::test]
    async fn feature_resolution_binds_name_and_path_family() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(
            StateStore::new(&dir.path().join("state.db"))
                .await
                .expect("store"),
        );
        store.upsert_feature("user-auth", None).await.expect("feature");
        let resolver = FeaturePathResolver::new(dir.path(), store);
        let executor = WorkflowExecutor::new(
            ConfigStore::from_file(dir.path(), ConfigFile::default()),
            Some(resolver),
        );
        let workflow = workflow_with("create-story", &[], None);

        let resolved = executor
            .resolve_variables(
                &workflow,
                &params(&[("epic", "2"), ("epic_name", "oauth"), ("story", "3")]),
                None,
            )
            .await
            .expect("resolve");

        assert_eq!(resolved.get("feature_name"), Some(&"user-auth".to_string()));
        assert_eq!(
            resolved.get("prd_location"),
            Some(&"docs/features/user-auth/PRD.md".to_string())
        );
        assert_eq!(
            resolved.get("story_location"),
            Some(&"docs/features/user-auth/epics/2-oauth/stories/story-2.3.md".to_string())
        );
    }

    #[tokio::test]
    async fn unresolvable_feature_is_fatal_only_when_required() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(
            StateStore::new(&dir.path().join("state.db"))
                .await
                .expect("store"),
        );
        store.upsert_feature("payments", None).await.expect("feature");
        store.upsert_feature("user-auth", None).await.expect("feature");

        let make_executor = || {
            WorkflowExecutor::new(
                ConfigStore::from_file(dir.path(), ConfigFile::default()),
                Some(FeaturePathResolver::new(dir.path(), store.clone())),
            )
        };

        // Ambiguity is tolerated for workflows that do not need a feature.
        let plain = workflow_with("dev-story", &[], None);
        let resolved = make_executor()
            .resolve_variables(&plain, &params(&[]), None)
            .await
            .expect("resolves without feature");
        assert!(!resolved.contains_key("feature_name"));

        // A feature-scoped output file makes the failure fatal.
        let scoped = workflow_with(
            "prd",
            &[],
            Some("docs/features/{{feature_name}}/PRD.md"),
        );
        let err = make_executor()
            .resolve_variables(&scoped, &params(&[]), None)
            .await
            .expect_err("ambiguous and required");
        assert!(matches!(
            err,
            ResolveError::Feature(FeatureError::AmbiguousFeature { .. })
        ));
    }
}
