use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use cadence_store::{StateStore, StoreError};

pub const MVP_FEATURE: &str = "mvp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    Prd,
    Architecture,
    Readme,
    EpicsOverview,
    QaFolder,
    RetrospectivesFolder,
    StandupsFolder,
    EpicFolder,
    EpicLocation,
    StoryFolder,
    StoryLocation,
    ContextXmlFolder,
    RetrospectiveLocation,
    StandupLocation,
    FeatureDir,
}

impl PathType {
    pub const ALL: [PathType; 15] = [
        PathType::Prd,
        PathType::Architecture,
        PathType::Readme,
        PathType::EpicsOverview,
        PathType::QaFolder,
        PathType::RetrospectivesFolder,
        PathType::StandupsFolder,
        PathType::EpicFolder,
        PathType::EpicLocation,
        PathType::StoryFolder,
        PathType::StoryLocation,
        PathType::ContextXmlFolder,
        PathType::RetrospectiveLocation,
        PathType::StandupLocation,
        PathType::FeatureDir,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PathType::Prd => "prd",
            PathType::Architecture => "architecture",
            PathType::Readme => "readme",
            PathType::EpicsOverview => "epics_overview",
            PathType::QaFolder => "qa_folder",
            PathType::RetrospectivesFolder => "retrospectives_folder",
            PathType::StandupsFolder => "standups_folder",
            PathType::EpicFolder => "epic_folder",
            PathType::EpicLocation => "epic_location",
            PathType::StoryFolder => "story_folder",
            PathType::StoryLocation => "story_location",
            PathType::ContextXmlFolder => "context_xml_folder",
            PathType::RetrospectiveLocation => "retrospective_location",
            PathType::StandupLocation => "standup_location",
            PathType::FeatureDir => "feature_dir",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }

    fn template(self) -> &'static str {
        match self {
            PathType::Prd => "docs/features/{feature_name}/PRD.md",
            PathType::Architecture => "docs/features/{feature_name}/ARCHITECTURE.md",
            PathType::Readme => "docs/features/{feature_name}/README.md",
            PathType::EpicsOverview => "docs/features/{feature_name}/EPICS.md",
            PathType::QaFolder => "docs/features/{feature_name}/QA",
            PathType::RetrospectivesFolder => "docs/features/{feature_name}/retrospectives",
            PathType::StandupsFolder => "docs/features/{feature_name}/standups",
            PathType::EpicFolder => "docs/features/{feature_name}/epics/{epic}-{epic_name}",
            PathType::EpicLocation => {
                "docs/features/{feature_name}/epics/{epic}-{epic_name}/README.md"
            }
            PathType::StoryFolder => {
                "docs/features/{feature_name}/epics/{epic}-{epic_name}/stories"
            }
            PathType::StoryLocation => {
                "docs/features/{feature_name}/epics/{epic}-{epic_name}/stories/story-{epic}.{story}.md"
            }
            PathType::ContextXmlFolder => {
                "docs/features/{feature_name}/epics/{epic}-{epic_name}/context"
            }
            PathType::RetrospectiveLocation => {
                "docs/features/{feature_name}/retrospectives/epic-{epic}-retro.md"
            }
            PathType::StandupLocation => {
                "docs/features/{feature_name}/standups/standup-{date}.md"
            }
            PathType::FeatureDir => "docs/features/{feature_name}",
        }
    }

    /// Which optional scope parts the template consumes.
    pub fn needs_epic(self) -> bool {
        matches!(
            self,
            PathType::EpicFolder
                | PathType::EpicLocation
                | PathType::StoryFolder
                | PathType::StoryLocation
                | PathType::ContextXmlFolder
                | PathType::RetrospectiveLocation
        )
    }

    pub fn needs_story(self) -> bool {
        matches!(self, PathType::StoryLocation)
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("feature '{name}' does not exist; available features: {}", .available.join(", "))]
    UnknownFeature { name: String, available: Vec<String> },

    #[error(
        "cannot resolve feature name; multiple features exist: {}; pass feature_name explicitly or run from docs/features/<name>",
        .candidates.join(", ")
    )]
    AmbiguousFeature { candidates: Vec<String> },

    #[error("no features exist in this project; create one first")]
    NoFeatures,

    #[error("unknown path type '{path_type}'; supported types: {}", .supported.join(", "))]
    UnknownPathType {
        path_type: String,
        supported: Vec<String>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves the feature a workflow is scoped to and generates the
/// co-located document paths under `docs/features/<name>/`.
pub struct FeaturePathResolver {
    features_dir: PathBuf,
    store: Arc<StateStore>,
}

impl FeaturePathResolver {
    pub fn new(project_root: &Path, store: Arc<StateStore>) -> Self {
        Self {
            features_dir: project_root.join("docs").join("features"),
            store,
        }
    }

    /// Six priorities, first match wins: explicit parameter, context
    /// metadata, current directory, single non-MVP feature, MVP only,
    /// otherwise ambiguous.
    pub async fn resolve_feature_name(
        &self,
        params: &BTreeMap<String, String>,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<String, FeatureError> {
        let cwd = std::env::current_dir().ok();
        self.resolve_with_cwd(params, metadata, cwd.as_deref()).await
    }

    async fn resolve_with_cwd(
        &self,
        params: &BTreeMap<String, String>,
        metadata: Option<&BTreeMap<String, String>>,
        cwd: Option<&Path>,
    ) -> Result<String, FeatureError> {
        // Priority 1: explicit parameter, validated against the store.
        if let Some(name) = params.get("feature_name") {
            if self.store.get_feature(name).await?.is_none() {
                return Err(FeatureError::UnknownFeature {
                    name: name.clone(),
                    available: self.feature_names(false).await?,
                });
            }
            tracing::info!(feature_name = %name, priority = 1, "feature resolved");
            return Ok(name.clone());
        }

        // Priority 2: workflow context metadata.
        if let Some(name) = metadata.and_then(|m| m.get("feature_name")) {
            tracing::info!(feature_name = %name, priority = 2, "feature resolved");
            return Ok(name.clone());
        }

        // Priority 3: working directory inside docs/features/<name>/.
        if let Some(cwd) = cwd {
            if let Some(name) = self.feature_from_cwd(cwd) {
                if self.store.get_feature(&name).await?.is_some() {
                    tracing::info!(feature_name = %name, priority = 3, "feature resolved");
                    return Ok(name);
                }
            }
        }

        // Priority 4: exactly one non-MVP feature.
        let non_mvp = self.feature_names(true).await?;
        if non_mvp.len() == 1 {
            let name = non_mvp.into_iter().next().unwrap_or_default();
            tracing::info!(feature_name = %name, priority = 4, "feature resolved");
            return Ok(name);
        }

        // Priority 5: only the MVP feature exists.
        let mvp_exists = self.store.get_feature(MVP_FEATURE).await?.is_some();
        if mvp_exists && non_mvp.is_empty() {
            tracing::info!(priority = 5, "feature resolved to mvp");
            return Ok(MVP_FEATURE.to_string());
        }

        // Priority 6: ambiguous (or nothing to resolve at all).
        let all = self.feature_names(false).await?;
        if all.is_empty() {
            return Err(FeatureError::NoFeatures);
        }
        Err(FeatureError::AmbiguousFeature { candidates: all })
    }

    pub fn generate_feature_path(
        &self,
        feature_name: &str,
        path_type: PathType,
        epic: Option<&str>,
        epic_name: Option<&str>,
        story: Option<&str>,
    ) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let rendered = path_type
            .template()
            .replace("{feature_name}", feature_name)
            .replace("{epic_name}", epic_name.unwrap_or(""))
            .replace("{epic}", epic.unwrap_or(""))
            .replace("{story}", story.unwrap_or(""))
            .replace("{date}", &date);
        PathBuf::from(rendered)
    }

    /// Lookup by name for callers driven by untyped input; unknown names
    /// fail with the supported list.
    pub fn generate_named_path(
        &self,
        feature_name: &str,
        path_type: &str,
        epic: Option<&str>,
        epic_name: Option<&str>,
        story: Option<&str>,
    ) -> Result<PathBuf, FeatureError> {
        let parsed = PathType::parse(path_type).ok_or_else(|| FeatureError::UnknownPathType {
            path_type: path_type.to_string(),
            supported: PathType::ALL.iter().map(|t| t.as_str().to_string()).collect(),
        })?;
        Ok(self.generate_feature_path(feature_name, parsed, epic, epic_name, story))
    }

    fn feature_from_cwd(&self, cwd: &Path) -> Option<String> {
        let features_dir = self
            .features_dir
            .canonicalize()
            .unwrap_or_else(|_| self.features_dir.clone());
        let relative = cwd.strip_prefix(&features_dir).ok()?;
        relative
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
    }

    async fn feature_names(&self, exclude_mvp: bool) -> Result<Vec<String>, FeatureError> {
        let mut names: Vec<String> = self
            .store
            .list_features()
            .await?
            .into_iter()
            .map(|f| f.name)
            .filter(|n| !exclude_mvp || n != MVP_FEATURE)
            .collect();
        names.sort();
        Ok(names)
    }
}
