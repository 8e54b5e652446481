use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use cadence_core::{
    ConfigStore, EventBus, FeaturePathResolver, LockInterface, LockMode, SessionLock,
    WorkflowExecutor, WorkflowRegistry, STATE_DIR_NAME,
};
use cadence_store::StateStore;

use crate::artifacts::ArtifactManager;
use crate::ceremony::{
    CeremonyFailureHandler, CeremonyOrchestrator, CeremonyRunner, CeremonyTriggerEngine,
    GitStateManager,
};
use crate::coordinator::{AgentExecutor, CeremonySuite, WorkflowCoordinator};
use crate::planner::{AnalysisService, ScalePlanner};
use crate::quality_gate::QualityGateManager;

/// External collaborators injected into the runtime. The agent executor is
/// the only path to the agent runtime; the analysis service and ceremony
/// runner are its planning and ceremony faces.
pub struct RuntimeOptions {
    pub interface: LockInterface,
    pub lock_mode: LockMode,
    pub agent_executor: AgentExecutor,
    pub analysis: Arc<dyn AnalysisService>,
    pub ceremony_runner: Arc<dyn CeremonyRunner>,
    pub max_retries: u32,
}

/// The assembled core: every component built in dependency order and
/// wired together.
pub struct OrchestratorRuntime {
    pub config: ConfigStore,
    pub event_bus: EventBus,
    pub store: Arc<StateStore>,
    pub session_lock: Arc<SessionLock>,
    pub registry: Arc<WorkflowRegistry>,
    pub executor: Arc<WorkflowExecutor>,
    pub quality_gate: Arc<QualityGateManager>,
    pub artifacts: Arc<ArtifactManager>,
    pub planner: ScalePlanner,
    pub coordinator: Arc<WorkflowCoordinator>,
    pub cancel: CancellationToken,
}

/// Build the runtime: event bus, state store, session lock, registry,
/// executor, quality gate, artifact manager, planner, coordinator, then
/// the ceremony subsystem. Boot reclaims any stale session lock as part
/// of acquiring it.
pub async fn build_runtime(
    project_root: &Path,
    options: RuntimeOptions,
) -> anyhow::Result<OrchestratorRuntime> {
    let config = ConfigStore::load(project_root).context("loading project configuration")?;
    let event_bus = EventBus::new();

    let store = Arc::new(
        StateStore::new(&project_root.join(STATE_DIR_NAME).join("state.db"))
            .await
            .context("opening state store")?,
    );

    let session_lock = Arc::new(SessionLock::new(project_root));
    session_lock
        .acquire(options.interface, options.lock_mode)
        .context("acquiring session lock")?;

    let registry = Arc::new(
        WorkflowRegistry::load(&config.workflows_root()).context("loading workflow registry")?,
    );

    let resolver = FeaturePathResolver::new(project_root, store.clone());
    let executor = Arc::new(WorkflowExecutor::new(config.clone(), Some(resolver)));

    let quality_gate = Arc::new(QualityGateManager::new(
        project_root.to_path_buf(),
        event_bus.clone(),
        None,
    ));
    let artifacts = Arc::new(ArtifactManager::new(
        project_root.to_path_buf(),
        config.tracked_dirs(),
        Some(store.clone()),
    ));

    let planner = ScalePlanner::new(registry.clone(), options.analysis);

    let cancel = CancellationToken::new();
    let git = GitStateManager::new(project_root, config.auto_commit());
    let ceremony_suite = CeremonySuite {
        triggers: Arc::new(CeremonyTriggerEngine::new(store.clone())),
        orchestrator: Arc::new(CeremonyOrchestrator::new(
            store.clone(),
            options.ceremony_runner,
            event_bus.clone(),
            project_root,
            git,
        )),
        failures: Arc::new(CeremonyFailureHandler::new()),
    };

    let coordinator = Arc::new(
        WorkflowCoordinator::new(
            event_bus.clone(),
            options.agent_executor,
            executor.clone(),
            store.clone(),
            artifacts.clone(),
            quality_gate.clone(),
            cancel.clone(),
        )
        .with_retries(options.max_retries, std::time::Duration::from_secs(1))
        .with_ceremonies(ceremony_suite),
    );

    tracing::info!(
        project_root = %project_root.display(),
        workflows = registry.len(),
        "orchestrator runtime assembled"
    );

    Ok(OrchestratorRuntime {
        config,
        event_bus,
        store,
        session_lock,
        registry,
        executor,
        quality_gate,
        artifacts,
        planner,
        coordinator,
        cancel,
    })
}

impl OrchestratorRuntime {
    /// Tear down in reverse order: stop new work, then release the lock.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.session_lock.release();
        tracing::info!("orchestrator runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceremony::{CeremonyContext, CeremonyOutput};
    use crate::model::PromptAnalysis;
    use async_trait::async_trait;
    use futures::StreamExt;
    use tempfile::TempDir;

    struct NoAnalysis;

    #[async_trait]
    impl AnalysisService for NoAnalysis {
        async fn analyze_prompt(&self, _prompt: &str) -> anyhow::Result<PromptAnalysis> {
            anyhow::bail!("offline")
        }
    }

    struct NoCeremonies;

    #[async_trait]
    impl CeremonyRunner for NoCeremonies {
        async fn run(&self, _context: &CeremonyContext) -> anyhow::Result<CeremonyOutput> {
            Ok(CeremonyOutput::default())
        }
    }

    fn options() -> RuntimeOptions {
        RuntimeOptions {
            interface: LockInterface::Cli,
            lock_mode: LockMode::Write,
            agent_executor: Arc::new(|_task| {
                let items: Vec<anyhow::Result<String>> = vec![Ok("ok".to_string())];
                futures::stream::iter(items).boxed()
            }),
            analysis: Arc::new(NoAnalysis),
            ceremony_runner: Arc::new(NoCeremonies),
            max_retries: 1,
        }
    }

    #[tokio::test]
    async fn runtime_builds_and_holds_the_write_lock() {
        let dir = TempDir::new().expect("tempdir");
        let runtime = build_runtime(dir.path(), options()).await.expect("build");

        assert!(runtime.session_lock.lock_file_path().exists());
        assert!(!runtime.session_lock.is_write_locked_by_other());
        assert!(runtime.registry.is_empty());

        runtime.shutdown();
        assert!(!runtime.session_lock.lock_file_path().exists());
        assert!(runtime.cancel.is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn boot_reclaims_a_stale_lock() {
        let dir = TempDir::new().expect("tempdir");
        let state_dir = dir.path().join(STATE_DIR_NAME);
        std::fs::create_dir_all(&state_dir).expect("mkdir");
        std::fs::write(
            state_dir.join("session.lock"),
            format!(
                r#"{{"interface":"cli","mode":"write","pid":{},"timestamp":"2026-01-01T00:00:00Z"}}"#,
                i32::MAX as u32 - 11
            ),
        )
        .expect("stale lock");

        let runtime = build_runtime(dir.path(), options()).await.expect("build");
        assert!(!runtime.session_lock.is_write_locked_by_other());
        runtime.shutdown();
    }
}
