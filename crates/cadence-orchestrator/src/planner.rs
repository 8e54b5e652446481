use std::sync::Arc;

use async_trait::async_trait;

use cadence_core::{WorkflowDefinition, WorkflowRegistry};
use cadence_types::{ProjectType, ScaleLevel};

use crate::model::{Complexity, PromptAnalysis, WorkflowSequence};

/// Boundary to the external analysis service that classifies a request.
/// The planner never performs inference itself.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze_prompt(&self, prompt: &str) -> anyhow::Result<PromptAnalysis>;
}

/// Maps a request to an ordered workflow sequence using the scale-adaptive
/// routing table.
pub struct ScalePlanner {
    registry: Arc<WorkflowRegistry>,
    analysis: Arc<dyn AnalysisService>,
}

impl ScalePlanner {
    pub fn new(registry: Arc<WorkflowRegistry>, analysis: Arc<dyn AnalysisService>) -> Self {
        Self { registry, analysis }
    }

    pub async fn assess_and_select(
        &self,
        initial_prompt: &str,
        force_scale_level: Option<ScaleLevel>,
    ) -> WorkflowSequence {
        let preview: String = initial_prompt.chars().take(100).collect();
        tracing::info!(prompt_preview = preview, "analyzing prompt");

        let mut analysis = match self.analysis.analyze_prompt(initial_prompt).await {
            Ok(analysis) => analysis,
            Err(error) => {
                tracing::error!(error = %error, "analysis failed; using conservative default");
                conservative_default(&error.to_string())
            }
        };
        if let Some(forced) = force_scale_level {
            analysis.scale_level = forced;
        }

        tracing::info!(
            scale_level = analysis.scale_level.value(),
            project_type = analysis.project_type.as_str(),
            estimated_stories = analysis.estimated_stories,
            confidence = analysis.confidence,
            "assessment complete"
        );

        if analysis.needs_clarification {
            tracing::info!(
                questions = analysis.clarifying_questions.len(),
                "clarification needed; returning empty sequence"
            );
            return WorkflowSequence {
                scale_level: analysis.scale_level,
                project_type: analysis.project_type,
                workflows: Vec::new(),
                routing_rationale: format!("Clarification needed: {}", analysis.reasoning),
                phase_breakdown: Vec::new(),
                jit_tech_specs: false,
                estimated_stories: analysis.estimated_stories,
                estimated_epics: analysis.estimated_epics,
                clarifying_questions: analysis.clarifying_questions.clone(),
            };
        }

        let sequence = self.build_sequence(&analysis);
        tracing::info!(
            scale_level = analysis.scale_level.value(),
            total_workflows = sequence.workflows.len(),
            "workflow sequence built"
        );
        sequence
    }

    fn build_sequence(&self, analysis: &PromptAnalysis) -> WorkflowSequence {
        if analysis.is_game_project {
            return self.build_game_sequence(analysis);
        }

        let mut workflows = Vec::new();
        let mut phase_breakdown = Vec::new();

        // Brownfield always starts by documenting the existing system.
        if analysis.is_brownfield {
            workflows.extend(self.lookup(&["document-project"]));
            phase_breakdown.push((
                "Phase 1: Analysis".to_string(),
                vec!["document-project".to_string()],
            ));
        }

        let story_loop = ["create-story", "dev-story", "story-done"];
        let mut jit_tech_specs = false;

        let routing_rationale = match analysis.scale_level {
            ScaleLevel::Level0 => {
                workflows.extend(self.lookup(&["tech-spec"]));
                workflows.extend(self.lookup(&story_loop));
                phase_breakdown.push(planning_phase(&["tech-spec"]));
                phase_breakdown.push(implementation_phase(&story_loop));
                "Level 0 (atomic change): tech-spec, then a single story".to_string()
            }
            ScaleLevel::Level1 => {
                workflows.extend(self.lookup(&["tech-spec"]));
                workflows.extend(self.lookup(&story_loop));
                phase_breakdown.push(planning_phase(&["tech-spec"]));
                phase_breakdown.push(implementation_phase(&story_loop));
                format!(
                    "Level 1 (small feature): tech-spec, then {} stories",
                    analysis.estimated_stories
                )
            }
            ScaleLevel::Level2 => {
                workflows.extend(self.lookup(&["prd", "tech-spec"]));
                workflows.extend(self.lookup(&story_loop));
                phase_breakdown.push(planning_phase(&["prd", "tech-spec"]));
                phase_breakdown.push(implementation_phase(&story_loop));
                format!(
                    "Level 2 (medium project): PRD, tech-spec, then {} epics / {} stories",
                    analysis.estimated_epics, analysis.estimated_stories
                )
            }
            ScaleLevel::Level3 | ScaleLevel::Level4 => {
                workflows.extend(self.lookup(&["prd", "architecture", "tech-spec"]));
                workflows.extend(self.lookup(&story_loop));
                phase_breakdown.push(planning_phase(&["prd"]));
                phase_breakdown.push((
                    "Phase 3: Solutioning".to_string(),
                    vec!["architecture".to_string()],
                ));
                phase_breakdown.push(implementation_phase(&[
                    "tech-spec (JIT per epic)",
                    "create-story",
                    "dev-story",
                    "story-done",
                ]));
                jit_tech_specs = true;
                format!(
                    "Level {} ({}): PRD, architecture, JIT tech-specs, then {} epics / {} stories",
                    analysis.scale_level.value(),
                    if analysis.scale_level == ScaleLevel::Level3 {
                        "large"
                    } else {
                        "enterprise"
                    },
                    analysis.estimated_epics,
                    analysis.estimated_stories
                )
            }
        };

        WorkflowSequence {
            scale_level: analysis.scale_level,
            project_type: analysis.project_type,
            workflows,
            routing_rationale,
            phase_breakdown,
            jit_tech_specs,
            estimated_stories: analysis.estimated_stories,
            estimated_epics: analysis.estimated_epics,
            clarifying_questions: Vec::new(),
        }
    }

    /// Game projects take a parallel track: brief and design document first,
    /// architecture only at Level 3 and above.
    fn build_game_sequence(&self, analysis: &PromptAnalysis) -> WorkflowSequence {
        let mut names: Vec<&str> = vec!["game-brief", "gdd"];
        let complex = analysis.scale_level.value() >= 3;
        if complex {
            names.push("architecture");
        }
        names.extend(["create-story", "dev-story", "story-done"]);

        let workflows = self.lookup(&names);
        let mut phase_breakdown = vec![
            ("Phase 1: Analysis".to_string(), vec!["game-brief".to_string()]),
            ("Phase 2: Planning".to_string(), vec!["gdd".to_string()]),
        ];
        if complex {
            phase_breakdown.push((
                "Phase 3: Solutioning".to_string(),
                vec!["architecture".to_string()],
            ));
        }
        phase_breakdown.push(implementation_phase(&[
            "create-story",
            "dev-story",
            "story-done",
        ]));

        WorkflowSequence {
            scale_level: analysis.scale_level,
            project_type: ProjectType::Game,
            workflows,
            routing_rationale: format!(
                "Game project (Level {}): game-brief, gdd{}, then implementation",
                analysis.scale_level.value(),
                if complex { ", architecture" } else { "" }
            ),
            phase_breakdown,
            jit_tech_specs: false,
            estimated_stories: analysis.estimated_stories,
            estimated_epics: analysis.estimated_epics,
            clarifying_questions: Vec::new(),
        }
    }

    fn lookup(&self, names: &[&str]) -> Vec<WorkflowDefinition> {
        let mut workflows = Vec::new();
        for name in names {
            match self.registry.get(name) {
                Some(definition) => workflows.push(definition.clone()),
                None => tracing::warn!(workflow = name, "workflow not found in registry"),
            }
        }
        workflows
    }
}

fn planning_phase(names: &[&str]) -> (String, Vec<String>) {
    (
        "Phase 2: Planning".to_string(),
        names.iter().map(|n| n.to_string()).collect(),
    )
}

fn implementation_phase(names: &[&str]) -> (String, Vec<String>) {
    (
        "Phase 4: Implementation".to_string(),
        names.iter().map(|n| n.to_string()).collect(),
    )
}

fn conservative_default(error: &str) -> PromptAnalysis {
    PromptAnalysis {
        scale_level: ScaleLevel::Level2,
        project_type: ProjectType::Software,
        is_greenfield: true,
        is_brownfield: false,
        is_game_project: false,
        estimated_stories: 10,
        estimated_epics: 2,
        technical_complexity: Complexity::Medium,
        domain_complexity: Complexity::Medium,
        timeline_hint: None,
        confidence: 0.5,
        reasoning: format!("Analysis failed, using conservative default. Error: {error}"),
        needs_clarification: true,
        clarifying_questions: vec![
            "What is the approximate scope? (small feature, medium project, large system)"
                .to_string(),
            "Is this a new project or enhancing existing code?".to_string(),
            "What is the estimated timeline?".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::WorkflowDefinition;
    use std::path::PathBuf;

    struct FixedAnalysis(PromptAnalysis);

    #[async_trait]
    impl AnalysisService for FixedAnalysis {
        async fn analyze_prompt(&self, _prompt: &str) -> anyhow::Result<PromptAnalysis> {
            Ok(self.0.clone())
        }
    }

    struct FailingAnalysis;

    #[async_trait]
    impl AnalysisService for FailingAnalysis {
        async fn analyze_prompt(&self, _prompt: &str) -> anyhow::Result<PromptAnalysis> {
            anyhow::bail!("analysis backend unavailable")
        }
    }

    pub(crate) fn analysis(scale_level: ScaleLevel, stories: u32) -> PromptAnalysis {
        PromptAnalysis {
            scale_level,
            project_type: ProjectType::Software,
            is_greenfield: true,
            is_brownfield: false,
            is_game_project: false,
            estimated_stories: stories,
            estimated_epics: 1,
            technical_complexity: Complexity::Medium,
            domain_complexity: Complexity::Low,
            timeline_hint: None,
            confidence: 0.9,
            reasoning: "test".to_string(),
            needs_clarification: false,
            clarifying_questions: Vec::new(),
        }
    }

    pub(crate) fn registry_with(names: &[&str]) -> Arc<WorkflowRegistry> {
        let mut registry = WorkflowRegistry::new();
        for name in names {
            registry.register(WorkflowDefinition {
                name: name.to_string(),
                description: String::new(),
                phase: 4,
                variables: Default::default(),
                required_tools: Vec::new(),
                templates: Default::default(),
                output_file: None,
                installed_path: PathBuf::new(),
            });
        }
        Arc::new(registry)
    }

    const FULL_SET: &[&str] = &[
        "prd",
        "architecture",
        "tech-spec",
        "create-story",
        "dev-story",
        "story-done",
        "document-project",
        "game-brief",
        "gdd",
    ];

    fn names(sequence: &WorkflowSequence) -> Vec<&str> {
        sequence.workflows.iter().map(|w| w.name.as_str()).collect()
    }

    #[tokio::test]
    async fn routing_table_per_scale_level() {
        let registry = registry_with(FULL_SET);
        let cases: Vec<(ScaleLevel, Vec<&str>)> = vec![
            (
                ScaleLevel::Level0,
                vec!["tech-spec", "create-story", "dev-story", "story-done"],
            ),
            (
                ScaleLevel::Level1,
                vec!["tech-spec", "create-story", "dev-story", "story-done"],
            ),
            (
                ScaleLevel::Level2,
                vec!["prd", "tech-spec", "create-story", "dev-story", "story-done"],
            ),
            (
                ScaleLevel::Level3,
                vec![
                    "prd",
                    "architecture",
                    "tech-spec",
                    "create-story",
                    "dev-story",
                    "story-done",
                ],
            ),
            (
                ScaleLevel::Level4,
                vec![
                    "prd",
                    "architecture",
                    "tech-spec",
                    "create-story",
                    "dev-story",
                    "story-done",
                ],
            ),
        ];

        for (level, expected) in cases {
            let planner = ScalePlanner::new(
                registry.clone(),
                Arc::new(FixedAnalysis(analysis(level, 5))),
            );
            let sequence = planner.assess_and_select("build a thing", None).await;
            assert_eq!(names(&sequence), expected, "level {}", level.value());
            assert_eq!(
                sequence.jit_tech_specs,
                level >= ScaleLevel::Level3,
                "jit flag for level {}",
                level.value()
            );
        }
    }

    #[tokio::test]
    async fn brownfield_prepends_document_project() {
        let registry = registry_with(FULL_SET);
        let mut brownfield = analysis(ScaleLevel::Level2, 8);
        brownfield.is_brownfield = true;
        brownfield.project_type = ProjectType::Brownfield;

        let planner = ScalePlanner::new(registry, Arc::new(FixedAnalysis(brownfield)));
        let sequence = planner.assess_and_select("extend the old system", None).await;
        assert_eq!(names(&sequence)[0], "document-project");
    }

    #[tokio::test]
    async fn game_projects_take_the_parallel_track() {
        let registry = registry_with(FULL_SET);
        let mut game = analysis(ScaleLevel::Level3, 20);
        game.is_game_project = true;
        game.project_type = ProjectType::Game;

        let planner = ScalePlanner::new(registry, Arc::new(FixedAnalysis(game)));
        let sequence = planner.assess_and_select("make a roguelike", None).await;
        assert_eq!(
            names(&sequence),
            vec![
                "game-brief",
                "gdd",
                "architecture",
                "create-story",
                "dev-story",
                "story-done"
            ]
        );

        let mut small_game = analysis(ScaleLevel::Level1, 4);
        small_game.is_game_project = true;
        let planner = ScalePlanner::new(
            registry_with(FULL_SET),
            Arc::new(FixedAnalysis(small_game)),
        );
        let sequence = planner.assess_and_select("make pong", None).await;
        assert!(!names(&sequence).contains(&"architecture"));
    }

    #[tokio::test]
    async fn missing_workflows_are_filtered_out() {
        let registry = registry_with(&["tech-spec", "create-story", "dev-story"]);
        let planner = ScalePlanner::new(
            registry,
            Arc::new(FixedAnalysis(analysis(ScaleLevel::Level1, 3))),
        );
        let sequence = planner.assess_and_select("small feature", None).await;
        assert_eq!(names(&sequence), vec!["tech-spec", "create-story", "dev-story"]);
    }

    #[tokio::test]
    async fn analysis_failure_yields_conservative_default_with_questions() {
        let registry = registry_with(FULL_SET);
        let planner = ScalePlanner::new(registry, Arc::new(FailingAnalysis));
        let sequence = planner.assess_and_select("do something", None).await;

        assert!(sequence.needs_clarification());
        assert!(sequence.workflows.is_empty());
        assert_eq!(sequence.scale_level, ScaleLevel::Level2);
        assert_eq!(sequence.project_type, ProjectType::Software);
        assert_eq!(sequence.clarifying_questions.len(), 3);
    }

    #[tokio::test]
    async fn forced_scale_level_overrides_analysis() {
        let registry = registry_with(FULL_SET);
        let planner = ScalePlanner::new(
            registry,
            Arc::new(FixedAnalysis(analysis(ScaleLevel::Level1, 3))),
        );
        let sequence = planner
            .assess_and_select("small ask", Some(ScaleLevel::Level3))
            .await;
        assert!(names(&sequence).contains(&"architecture"));
    }
}
