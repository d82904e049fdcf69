//! Adversarial rounds - generator implements, critic attacks
//!
//! Each round pairs a generator instance with a critic instance inside its
//! own sub-group. A revise verdict rolls the critique into the next round's
//! generator prompt; an approve verdict (or an exhausted round budget) ends
//! the session. Earlier rounds collapse in the UI under a shared
//! previous-rounds container.

use eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifacts::{ArtifactPayload, ArtifactRequest, ArtifactStage, CritiqueVerdict};
use crate::orchestrator::Orchestrator;
use crate::session::{InstanceStatus, SessionType};

use super::{Coordinator, HostCtx, WorkflowKey, build_critic_prompt, build_generator_prompt};

/// Adversarial phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdversarialPhase {
    #[default]
    Generating,
    Critiquing,
    Complete,
    Failed,
}

/// One generator/critic round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdversarialRound {
    /// 1-based round number
    pub number: u32,
    pub sub_group_id: String,
    pub generator_id: String,
    #[serde(default)]
    pub critic_id: Option<String>,
    #[serde(default)]
    pub verdict: Option<CritiqueVerdict>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Persistent state of an adversarial session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdversarialSession {
    pub task: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub rounds: Vec<AdversarialRound>,
    #[serde(default)]
    pub phase: AdversarialPhase,
    #[serde(default)]
    pub max_rounds: u32,
}

impl AdversarialSession {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            group_id: String::new(),
            rounds: Vec::new(),
            phase: AdversarialPhase::Generating,
            max_rounds: 5,
        }
    }

    /// Every instance across all rounds (legacy-migration helper)
    pub fn instance_ids(&self) -> Vec<String> {
        self.rounds
            .iter()
            .flat_map(|r| {
                let mut ids = vec![r.generator_id.clone()];
                ids.extend(r.critic_id.clone());
                ids
            })
            .collect()
    }

    /// UI container id that previous rounds collapse under
    pub fn previous_rounds_container(&self, session_id: &str) -> String {
        if self.group_id.is_empty() {
            format!("{}-previous-rounds", session_id)
        } else {
            format!("{}-previous-rounds", self.group_id)
        }
    }

    pub fn current_round(&self) -> Option<&AdversarialRound> {
        self.rounds.last()
    }
}

/// Coordinator for one adversarial session
#[derive(Debug)]
pub struct AdversarialCoordinator {
    pub state: AdversarialSession,
}

impl AdversarialCoordinator {
    /// Start round 1
    pub fn start(ctx: &mut HostCtx, task: &str, max_rounds: u32) -> Result<Self> {
        let mut state = AdversarialSession::new(task);
        state.max_rounds = max_rounds.max(1);
        state.group_id = ctx.create_group(
            &format!("adversarial: {}", truncate(task, 40)),
            SessionType::Adversarial,
            task,
        );

        let mut coordinator = Self { state };
        coordinator.start_round(ctx, &[])?;
        ctx.info("Adversarial session started");
        Ok(coordinator)
    }

    pub fn from_state(state: AdversarialSession) -> Self {
        Self { state }
    }

    fn start_round(&mut self, ctx: &mut HostCtx, previous_issues: &[String]) -> Result<()> {
        let number = self.state.rounds.len() as u32 + 1;
        let sub_group_id = ctx.create_group(
            &format!("round {}", number),
            SessionType::Adversarial,
            &self.state.task.clone(),
        );

        let prompt = build_generator_prompt(&self.state.task, number, previous_issues);
        let generator_id = ctx.spawn_instance(&prompt, Some(sub_group_id.as_str()))?;

        info!(round = number, %generator_id, "adversarial: round started");
        self.state.rounds.push(AdversarialRound {
            number,
            sub_group_id,
            generator_id,
            critic_id: None,
            verdict: None,
            issues: Vec::new(),
        });
        self.state.phase = AdversarialPhase::Generating;
        Ok(())
    }

    fn spawn_critic(&mut self, ctx: &mut HostCtx) {
        let Some(round) = self.state.rounds.last() else { return };
        let number = round.number;
        let Some(branch) = ctx.branch_of(&round.generator_id) else {
            self.fail(ctx, "generator instance vanished before critique");
            return;
        };

        let prompt = build_critic_prompt(&self.state.task, &branch, number);
        let sub_group = round.sub_group_id.clone();
        match ctx.spawn_instance(&prompt, Some(sub_group.as_str())) {
            Ok(id) => {
                info!(round = number, critic = %id, "adversarial: critic spawned");
                ctx.info(format!("Round {}: critic reviewing", number));
                if let Some(round) = self.state.rounds.last_mut() {
                    round.critic_id = Some(id);
                }
                self.state.phase = AdversarialPhase::Critiquing;
            }
            Err(e) => self.fail(ctx, &format!("failed to spawn critic: {}", e)),
        }
    }

    fn fail(&mut self, ctx: &mut HostCtx, reason: &str) {
        warn!(group = %self.state.group_id, %reason, "adversarial failed");
        ctx.error(format!("Adversarial session failed: {}", reason));
        self.state.phase = AdversarialPhase::Failed;
    }
}

impl Coordinator for AdversarialCoordinator {
    fn key(&self) -> WorkflowKey {
        WorkflowKey::Adversarial(self.state.group_id.clone())
    }

    fn display_phase(&self) -> String {
        format!("{:?} (round {})", self.state.phase, self.state.rounds.len())
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state.phase, AdversarialPhase::Complete | AdversarialPhase::Failed)
    }

    fn tick(&mut self, _ctx: &mut HostCtx) {}

    fn on_instance_state_change(&mut self, id: &str, _old: InstanceStatus, new: InstanceStatus, ctx: &mut HostCtx) {
        let Some(round) = self.state.rounds.last() else { return };

        match self.state.phase {
            AdversarialPhase::Generating if round.generator_id == id => match new {
                InstanceStatus::Completed => self.spawn_critic(ctx),
                InstanceStatus::Error | InstanceStatus::Stuck | InstanceStatus::Timeout => {
                    self.fail(ctx, &format!("generator ended {:?}", new));
                }
                _ => {}
            },
            AdversarialPhase::Critiquing if round.critic_id.as_deref() == Some(id) => {
                if matches!(new, InstanceStatus::Error | InstanceStatus::Stuck | InstanceStatus::Timeout) {
                    self.fail(ctx, &format!("critic ended {:?}", new));
                }
            }
            _ => {}
        }
    }

    fn on_artifact(
        &mut self,
        stage: ArtifactStage,
        index: usize,
        result: Result<ArtifactPayload, String>,
        ctx: &mut HostCtx,
    ) {
        if self.state.phase != AdversarialPhase::Critiquing || stage != ArtifactStage::Critique {
            return;
        }
        // Only the current round's critique counts; stale polls are ignored
        let current_round = self.state.rounds.len();
        if index != current_round {
            return;
        }

        match result {
            Ok(ArtifactPayload::Critique(critique)) => {
                if let Some(round) = self.state.rounds.last_mut() {
                    round.verdict = Some(critique.verdict);
                    round.issues = critique.issues.clone();
                }
                match critique.verdict {
                    CritiqueVerdict::Approve => {
                        info!(rounds = current_round, "adversarial: approved");
                        ctx.info(format!("Critic approved after {} round(s)", current_round));
                        self.state.phase = AdversarialPhase::Complete;
                    }
                    CritiqueVerdict::Revise => {
                        if (current_round as u32) >= self.state.max_rounds {
                            ctx.info(format!(
                                "Round budget exhausted after {} rounds - finishing with open issues",
                                current_round
                            ));
                            self.state.phase = AdversarialPhase::Complete;
                            return;
                        }
                        ctx.info(format!("Critic requested revisions - starting round {}", current_round + 1));
                        let issues = critique.issues;
                        if let Err(e) = self.start_round(ctx, &issues) {
                            self.fail(ctx, &format!("failed to start next round: {}", e));
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(reason) => self.fail(ctx, &format!("critique unreadable: {}", reason)),
        }
    }

    fn pending_artifacts(&self, orch: &Orchestrator) -> Vec<ArtifactRequest> {
        if self.state.phase != AdversarialPhase::Critiquing {
            return Vec::new();
        }
        let Some(round) = self.state.rounds.last() else {
            return Vec::new();
        };
        round
            .critic_id
            .as_ref()
            .and_then(|id| orch.session.instance(id))
            .filter(|inst| inst.worktree_ready)
            .map(|inst| {
                vec![ArtifactRequest {
                    stage: ArtifactStage::Critique,
                    index: round.number as usize,
                    worktree: inst.worktree_path.clone(),
                }]
            })
            .unwrap_or_default()
    }

    fn cancel(&mut self, ctx: &mut HostCtx) {
        for id in self.state.instance_ids() {
            ctx.stop_instance(&id);
        }
        self.state.phase = AdversarialPhase::Failed;
        ctx.info("Adversarial session cancelled");
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
