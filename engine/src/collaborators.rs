use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use cadence_orchestrator::{
    AgentExecutor, AgentTask, AnalysisService, CeremonyContext, CeremonyOutput, CeremonyRunner,
    Complexity, PromptAnalysis,
};
use cadence_types::{ProjectType, ScaleLevel};

/// Agent runtime boundary backed by an external command. Each workflow
/// step spawns the configured command with the rendered instructions on
/// stdin and streams stdout lines back as output chunks.
pub fn process_agent_executor(project_root: PathBuf, command: String) -> AgentExecutor {
    Arc::new(move |task: AgentTask| {
        let command = command.clone();
        let project_root = project_root.clone();
        let stream = async_stream::try_stream! {
            let mut child = Command::new("sh")
                .arg("-c")
                .arg(&command)
                .env("CADENCE_WORKFLOW", &task.workflow.name)
                .env("CADENCE_EPIC", task.epic.to_string())
                .env("CADENCE_STORY", task.story.to_string())
                .current_dir(&project_root)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(task.instructions.as_bytes()).await?;
                drop(stdin);
            }
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| anyhow::anyhow!("agent process has no stdout"))?;
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                yield line;
            }

            let status = child.wait().await?;
            if !status.success() {
                Err(anyhow::anyhow!("agent process exited with {status}"))?;
            }
        };
        stream.boxed()
    })
}

/// Offline classification used when no analysis backend is reachable.
/// Deliberately coarse: keyword cues plus request length, always flagged
/// with moderate confidence.
pub struct KeywordAnalysis;

#[async_trait]
impl AnalysisService for KeywordAnalysis {
    async fn analyze_prompt(&self, prompt: &str) -> anyhow::Result<PromptAnalysis> {
        let lowered = prompt.to_lowercase();
        let words = prompt.split_whitespace().count();

        let is_game = lowered.contains("game") || lowered.contains("roguelike");
        let is_brownfield = ["existing", "refactor", "migrate", "legacy"]
            .iter()
            .any(|cue| lowered.contains(cue));
        let is_bug_fix = lowered.contains("fix") || lowered.contains("bug");

        let (scale_level, estimated_stories, estimated_epics) = if is_bug_fix {
            (ScaleLevel::Level0, 1, 1)
        } else if words < 12 {
            (ScaleLevel::Level1, 3, 1)
        } else if words < 40 {
            (ScaleLevel::Level2, 8, 2)
        } else if words < 120 {
            (ScaleLevel::Level3, 20, 3)
        } else {
            (ScaleLevel::Level4, 45, 6)
        };

        let project_type = if is_game {
            ProjectType::Game
        } else if is_bug_fix {
            ProjectType::BugFix
        } else if is_brownfield {
            ProjectType::Brownfield
        } else {
            ProjectType::Software
        };

        Ok(PromptAnalysis {
            scale_level,
            project_type,
            is_greenfield: !is_brownfield,
            is_brownfield,
            is_game_project: is_game,
            estimated_stories,
            estimated_epics,
            technical_complexity: Complexity::Medium,
            domain_complexity: Complexity::Medium,
            timeline_hint: None,
            confidence: 0.6,
            reasoning: "Heuristic classification (offline analysis backend)".to_string(),
            needs_clarification: false,
            clarifying_questions: Vec::new(),
        })
    }
}

/// Ceremony runtime that renders a structured transcript from the
/// prepared context instead of holding a model conversation. Stands in
/// for the hosted agent runtime in headless installs.
pub struct TranscriptCeremonyRunner;

#[async_trait]
impl CeremonyRunner for TranscriptCeremonyRunner {
    async fn run(&self, context: &CeremonyContext) -> anyhow::Result<CeremonyOutput> {
        let mut transcript = format!(
            "# {} — epic {}\n\nParticipants: {}\n\n",
            context.ceremony_type.as_str(),
            context.epic_num,
            context.participants.join(", "),
        );
        for item in &context.agenda {
            transcript.push_str(&format!("## {item}\n\n"));
        }
        transcript.push_str("## Stories\n\n");
        for story in &context.stories {
            transcript.push_str(&format!(
                "- {}.{} {} ({:?})\n",
                story.epic_num, story.story_num, story.title, story.status
            ));
        }

        Ok(CeremonyOutput {
            transcript,
            action_items: Vec::new(),
            learnings: Vec::new(),
            decisions: Vec::new(),
            metrics: serde_json::json!({
                "participants": context.participants.len(),
                "stories": context.stories.len(),
            }),
        })
    }
}
