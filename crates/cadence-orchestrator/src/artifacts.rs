use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use chrono::Utc;
use ignore::WalkBuilder;
use uuid::Uuid;

use cadence_store::StateStore;
use cadence_types::ArtifactRecord;

/// `(relative path, mtime in ms, size)` per tracked file.
pub type Snapshot = HashSet<(String, i64, u64)>;

const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".cadence",
    ".archive",
    ".cache",
    "node_modules",
    "target",
    "dist",
    "build",
    "venv",
    ".venv",
    "__pycache__",
];

/// Detects files created or modified during a workflow step by diffing
/// before/after snapshots of the tracked directories, and registers them
/// in the state store.
pub struct ArtifactManager {
    project_root: PathBuf,
    tracked_dirs: Vec<String>,
    store: Option<Arc<StateStore>>,
}

impl ArtifactManager {
    pub fn new(
        project_root: PathBuf,
        tracked_dirs: Vec<String>,
        store: Option<Arc<StateStore>>,
    ) -> Self {
        Self {
            project_root,
            tracked_dirs,
            store,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for dirname in &self.tracked_dirs {
            let tracked = self.project_root.join(dirname);
            if !tracked.exists() {
                continue;
            }
            let walker = WalkBuilder::new(&tracked)
                .standard_filters(false)
                .filter_entry(|entry| {
                    let name = entry.file_name().to_string_lossy();
                    !IGNORED_DIRS.contains(&name.as_ref())
                })
                .build();
            for entry in walker {
                let Ok(entry) = entry else { continue };
                if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                let Ok(metadata) = entry.metadata() else {
                    tracing::warn!(file = %entry.path().display(), "skipping unstatable file");
                    continue;
                };
                let mtime_ms = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                let Ok(relative) = entry.path().strip_prefix(&self.project_root) else {
                    continue;
                };
                snapshot.insert((
                    relative.to_string_lossy().to_string(),
                    mtime_ms,
                    metadata.len(),
                ));
            }
        }
        tracing::debug!(files = snapshot.len(), "filesystem snapshot complete");
        snapshot
    }

    /// New and modified files: everything in `after` that was not in
    /// `before`. Deletions are not artifacts.
    pub fn detect(&self, before: &Snapshot, after: &Snapshot) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = after
            .difference(before)
            .map(|(path, _, _)| PathBuf::from(path))
            .collect();
        paths.sort();
        if !paths.is_empty() {
            tracing::info!(count = paths.len(), "workflow artifacts detected");
        }
        paths
    }

    /// Workflow name first, path substrings second, `story` as the default.
    pub fn infer_type(&self, path: &Path, workflow_name: &str) -> &'static str {
        let workflow = workflow_name.to_lowercase();
        const WORKFLOW_MAPPING: &[(&str, &str)] = &[
            ("prd", "prd"),
            ("architecture", "architecture"),
            ("tech-spec", "architecture"),
            ("epic", "epic"),
            ("create-story", "story"),
            ("dev-story", "story"),
            ("story", "story"),
            ("implement", "story"),
            ("test", "test_report"),
            ("qa", "qa_report"),
            ("ux", "adr"),
            ("design", "adr"),
            ("research", "adr"),
            ("brief", "adr"),
            ("postmortem", "postmortem"),
            ("runbook", "runbook"),
        ];
        for (pattern, doc_type) in WORKFLOW_MAPPING {
            if workflow.contains(pattern) {
                return doc_type;
            }
        }

        let path = path.to_string_lossy().to_lowercase();
        const PATH_MAPPING: &[(&str, &str)] = &[
            ("prd", "prd"),
            ("architecture", "architecture"),
            ("arch", "architecture"),
            ("spec", "architecture"),
            ("epic", "epic"),
            ("story", "story"),
            ("test", "test_report"),
            ("qa", "qa_report"),
            ("adr", "adr"),
            ("decision", "adr"),
            ("postmortem", "postmortem"),
            ("runbook", "runbook"),
        ];
        for (pattern, doc_type) in PATH_MAPPING {
            if path.contains(pattern) {
                return doc_type;
            }
        }

        "story"
    }

    /// Registration failures are logged, never raised: losing artifact
    /// metadata must not fail the workflow that produced it.
    pub async fn register(
        &self,
        artifacts: &[PathBuf],
        workflow_name: &str,
        epic: i64,
        story: i64,
        agent: &str,
        phase: &str,
        variables: &BTreeMap<String, String>,
    ) {
        let Some(store) = &self.store else {
            tracing::warn!("artifact registration skipped: no store configured");
            return;
        };
        let variables_json = serde_json::to_value(variables).unwrap_or_default();
        for artifact in artifacts {
            let record = ArtifactRecord {
                id: Uuid::new_v4().to_string(),
                path: artifact.to_string_lossy().to_string(),
                doc_type: self.infer_type(artifact, workflow_name).to_string(),
                workflow_name: workflow_name.to_string(),
                epic_num: epic,
                story_num: story,
                agent: agent.to_lowercase(),
                phase: phase.to_string(),
                created_at: Utc::now(),
            };
            match store.insert_artifact(&record, &variables_json).await {
                Ok(()) => tracing::info!(
                    artifact = %record.path,
                    doc_type = record.doc_type,
                    agent = record.agent,
                    "artifact registered"
                ),
                Err(error) => tracing::warn!(
                    artifact = %record.path,
                    error = %error,
                    "artifact registration failed; continuing"
                ),
            }
        }
    }
}
