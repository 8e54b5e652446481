use std::sync::Arc;

use chrono::{DateTime, Utc};

use cadence_store::{StateStore, StoreResult};
use cadence_types::{CeremonyType, ProjectType, ScaleLevel};

/// Snapshot of epic progress the trigger rules are evaluated against.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub epic_num: i64,
    pub story_num: Option<i64>,
    pub scale_level: ScaleLevel,
    pub stories_completed: u32,
    pub total_stories: u32,
    pub quality_gates_passed: bool,
    pub failure_count: u32,
    pub project_type: ProjectType,
    pub last_standup: Option<DateTime<Utc>>,
}

/// Evaluates the per-scale-level trigger table and records executions so
/// the same trigger never fires twice.
pub struct CeremonyTriggerEngine {
    store: Arc<StateStore>,
}

impl CeremonyTriggerEngine {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Standup cadence per scale level. Levels 0-2 never hold standups.
    pub fn standup_interval(scale_level: ScaleLevel) -> Option<u32> {
        match scale_level {
            ScaleLevel::Level3 => Some(2),
            ScaleLevel::Level4 => Some(5),
            _ => None,
        }
    }

    pub async fn evaluate_all_triggers(
        &self,
        ctx: &TriggerContext,
    ) -> StoreResult<Vec<CeremonyType>> {
        let mut ceremonies = Vec::new();

        if self.should_fire_planning(ctx).await? {
            ceremonies.push(CeremonyType::Planning);
        }
        if self.should_fire_standup(ctx).await? {
            ceremonies.push(CeremonyType::Standup);
        }
        if self.should_fire_retrospective(ctx).await? {
            ceremonies.push(CeremonyType::Retrospective);
        }

        if !ceremonies.is_empty() {
            tracing::info!(
                epic_num = ctx.epic_num,
                ceremonies = ?ceremonies.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
                "ceremonies triggered"
            );
        }
        Ok(ceremonies)
    }

    /// Planning fires once at epic start, for scale >= 3.
    async fn should_fire_planning(&self, ctx: &TriggerContext) -> StoreResult<bool> {
        if ctx.scale_level < ScaleLevel::Level3 || ctx.stories_completed != 0 {
            return Ok(false);
        }
        let executions = self
            .store
            .ceremony_execution_count(ctx.epic_num, CeremonyType::Planning, false)
            .await?;
        Ok(executions == 0)
    }

    /// Standups fire every K completed stories; the execution count keeps a
    /// re-evaluation at the same progress point from firing again.
    async fn should_fire_standup(&self, ctx: &TriggerContext) -> StoreResult<bool> {
        let Some(interval) = Self::standup_interval(ctx.scale_level) else {
            return Ok(false);
        };
        if ctx.stories_completed == 0 || ctx.stories_completed % interval != 0 {
            return Ok(false);
        }
        let due = i64::from(ctx.stories_completed / interval);
        let held = self
            .store
            .ceremony_execution_count(ctx.epic_num, CeremonyType::Standup, false)
            .await?;
        Ok(held < due)
    }

    /// The retrospective fires when the epic's stories are all done.
    async fn should_fire_retrospective(&self, ctx: &TriggerContext) -> StoreResult<bool> {
        if ctx.total_stories == 0 || ctx.stories_completed != ctx.total_stories {
            return Ok(false);
        }
        let executions = self
            .store
            .ceremony_execution_count(ctx.epic_num, CeremonyType::Retrospective, false)
            .await?;
        Ok(executions == 0)
    }

    pub async fn record_ceremony_execution(
        &self,
        epic_num: i64,
        ceremony_type: CeremonyType,
        success: bool,
    ) -> StoreResult<()> {
        self.store
            .record_ceremony_execution(epic_num, ceremony_type, success)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn engine() -> (TempDir, CeremonyTriggerEngine) {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(
            StateStore::new(&dir.path().join("state.db"))
                .await
                .expect("store"),
        );
        (dir, CeremonyTriggerEngine::new(store))
    }

    fn ctx(scale_level: ScaleLevel, completed: u32, total: u32) -> TriggerContext {
        TriggerContext {
            epic_num: 1,
            story_num: None,
            scale_level,
            stories_completed: completed,
            total_stories: total,
            quality_gates_passed: true,
            failure_count: 0,
            project_type: ProjectType::Software,
            last_standup: None,
        }
    }

    #[tokio::test]
    async fn planning_fires_once_at_epic_start_for_large_scale() {
        let (_dir, engine) = engine().await;

        let fired = engine
            .evaluate_all_triggers(&ctx(ScaleLevel::Level3, 0, 10))
            .await
            .expect("evaluate");
        assert_eq!(fired, vec![CeremonyType::Planning]);

        engine
            .record_ceremony_execution(1, CeremonyType::Planning, true)
            .await
            .expect("record");
        let fired = engine
            .evaluate_all_triggers(&ctx(ScaleLevel::Level3, 0, 10))
            .await
            .expect("evaluate");
        assert!(fired.is_empty());

        // Small scales never plan.
        let fired = engine
            .evaluate_all_triggers(&ctx(ScaleLevel::Level2, 0, 10))
            .await
            .expect("evaluate");
        assert!(fired.is_empty());
    }

    #[tokio::test]
    async fn standup_cadence_follows_scale_level() {
        assert_eq!(
            CeremonyTriggerEngine::standup_interval(ScaleLevel::Level3),
            Some(2)
        );
        assert_eq!(
            CeremonyTriggerEngine::standup_interval(ScaleLevel::Level4),
            Some(5)
        );
        assert_eq!(CeremonyTriggerEngine::standup_interval(ScaleLevel::Level1), None);

        let (_dir, engine) = engine().await;
        let fired = engine
            .evaluate_all_triggers(&ctx(ScaleLevel::Level3, 2, 10))
            .await
            .expect("evaluate");
        assert_eq!(fired, vec![CeremonyType::Standup]);

        // An odd story count is between standups.
        let fired = engine
            .evaluate_all_triggers(&ctx(ScaleLevel::Level3, 3, 10))
            .await
            .expect("evaluate");
        assert!(fired.is_empty());
    }

    #[tokio::test]
    async fn standup_does_not_refire_for_the_same_progress() {
        let (_dir, engine) = engine().await;
        engine
            .record_ceremony_execution(1, CeremonyType::Standup, true)
            .await
            .expect("record");

        let fired = engine
            .evaluate_all_triggers(&ctx(ScaleLevel::Level3, 2, 10))
            .await
            .expect("evaluate");
        assert!(fired.is_empty());

        // The next interval is due again.
        let fired = engine
            .evaluate_all_triggers(&ctx(ScaleLevel::Level3, 4, 10))
            .await
            .expect("evaluate");
        assert_eq!(fired, vec![CeremonyType::Standup]);
    }

    #[tokio::test]
    async fn retrospective_fires_when_epic_completes() {
        let (_dir, engine) = engine().await;

        let fired = engine
            .evaluate_all_triggers(&ctx(ScaleLevel::Level1, 3, 3))
            .await
            .expect("evaluate");
        assert_eq!(fired, vec![CeremonyType::Retrospective]);

        let fired = engine
            .evaluate_all_triggers(&ctx(ScaleLevel::Level1, 2, 3))
            .await
            .expect("evaluate");
        assert!(fired.is_empty());

        engine
            .record_ceremony_execution(1, CeremonyType::Retrospective, true)
            .await
            .expect("record");
        let fired = engine
            .evaluate_all_triggers(&ctx(ScaleLevel::Level1, 3, 3))
            .await
            .expect("evaluate");
        assert!(fired.is_empty());
    }
}
