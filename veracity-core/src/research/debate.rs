//! Contradiction debate.
//!
//! Each contradiction cluster is argued in staged rounds, the way a council
//! deliberates: round 1 every participant takes a position on the claim it
//! was assigned, later rounds rebut the others. Participants are assigned
//! round-robin over the debate agents. Resolution compares implied belief in
//! the cluster's reference claim (its first claim): an agent affirming a claim
//! with the reference's stance believes the reference with its confidence, an
//! agent affirming an opposite-stance claim disbelieves it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::agents::{AgentOutput, AgentTask, PositionBrief, ResearchAgent};
use super::graph::ContradictionCluster;
use super::sources::{Claim, Stance};
use crate::config::DebateConfig;

/// One argument made during a debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateArgument {
    pub round: u32,
    pub agent: String,
    pub claim_id: String,
    pub argument: String,
    /// Confidence in the agent's stance on its claim. Zero for fallbacks.
    pub confidence: f64,
    /// The agent failed and this is a placeholder.
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebateResult {
    Consensus,
    Disagreement,
}

/// Where a participant stood when the debate ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalPosition {
    pub agent: String,
    pub claim_id: String,
    pub position: String,
    /// `Positive` when the agent affirms its claim.
    pub stance: Stance,
    pub confidence: f64,
    /// Implied belief in the reference claim.
    pub belief: f64,
    pub failed: bool,
}

/// Mean implied belief for and against the reference claim.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceSplit {
    pub affirm: f64,
    pub deny: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateOutcome {
    pub claim_ids: Vec<String>,
    pub reference_claim_id: String,
    pub result: DebateResult,
    /// Confidence in the side the participants lean to.
    pub confidence: f64,
    pub split: ConfidenceSplit,
    pub rounds: u32,
    pub final_positions: Vec<FinalPosition>,
    pub arguments: Vec<DebateArgument>,
    pub summary: String,
}

impl DebateOutcome {
    pub fn is_consensus(&self) -> bool {
        self.result == DebateResult::Consensus
    }
}

struct Participant {
    agent: Arc<dyn ResearchAgent>,
    name: String,
    claim: Claim,
    position: String,
    stance: Stance,
    confidence: f64,
    failed: bool,
}

impl Participant {
    fn belief(&self, reference: Stance) -> f64 {
        let affirms_reference = (self.stance == Stance::Positive) == (self.claim.stance == reference);
        if affirms_reference {
            self.confidence
        } else {
            1.0 - self.confidence
        }
    }

    fn brief(&self) -> PositionBrief {
        PositionBrief {
            agent: self.name.clone(),
            claim_id: self.claim.id.clone(),
            position: self.position.clone(),
            confidence: self.confidence,
        }
    }
}

struct Resolution {
    result: DebateResult,
    confidence: f64,
    split: ConfidenceSplit,
}

pub struct DebateCoordinator {
    agents: Vec<Arc<dyn ResearchAgent>>,
    config: DebateConfig,
}

impl DebateCoordinator {
    pub fn new(agents: Vec<Arc<dyn ResearchAgent>>, config: DebateConfig) -> Self {
        Self { agents, config }
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Debate the strongest clusters, at most `max_clusters` of them.
    pub async fn debate_all<F>(
        &self,
        query: &str,
        clusters: &[ContradictionCluster],
        claims: &[Claim],
        max_rounds: u32,
        mut on_argument: F,
    ) -> Vec<DebateOutcome>
    where
        F: FnMut(&DebateArgument),
    {
        let mut outcomes = Vec::new();
        for cluster in clusters.iter().take(self.config.max_clusters) {
            if let Some(outcome) = self
                .debate(query, cluster, claims, max_rounds, &mut on_argument)
                .await
            {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Debate one cluster. `None` when fewer than two of its claims are known
    /// or there are no agents.
    pub async fn debate<F>(
        &self,
        query: &str,
        cluster: &ContradictionCluster,
        claims: &[Claim],
        max_rounds: u32,
        on_argument: &mut F,
    ) -> Option<DebateOutcome>
    where
        F: FnMut(&DebateArgument),
    {
        let by_id: HashMap<&str, &Claim> = claims.iter().map(|c| (c.id.as_str(), c)).collect();
        let members: Vec<&Claim> = cluster
            .claim_ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .take(self.config.max_claims_per_cluster)
            .collect();
        if members.len() < 2 || self.agents.is_empty() || max_rounds == 0 {
            debug!(cluster = ?cluster.claim_ids, max_rounds, "Skipping debate");
            return None;
        }
        let reference = members[0].clone();

        let mut participants: Vec<Participant> = members
            .iter()
            .enumerate()
            .map(|(i, claim)| {
                let agent = Arc::clone(&self.agents[i % self.agents.len()]);
                Participant {
                    name: agent.name(),
                    agent,
                    claim: (*claim).clone(),
                    position: String::new(),
                    stance: Stance::Positive,
                    confidence: 0.0,
                    failed: false,
                }
            })
            .collect();

        info!(
            claims = participants.len(),
            max_rounds,
            confidence = cluster.max_confidence,
            "Debating contradiction cluster"
        );

        let mut arguments = Vec::new();
        self.position_round(query, &mut participants, &mut arguments, on_argument)
            .await;
        let mut rounds = 1;
        let mut resolution = self.resolve(&participants, reference.stance);

        while rounds < max_rounds && resolution.result == DebateResult::Disagreement {
            rounds += 1;
            self.rebuttal_round(query, rounds, &mut participants, &mut arguments, on_argument)
                .await;
            resolution = self.resolve(&participants, reference.stance);
        }

        let summary = match resolution.result {
            DebateResult::Consensus => format!(
                "Consensus after {rounds} round(s): participants {} the claim \"{}\" with mean confidence {:.2}.",
                if resolution.split.affirm >= resolution.split.deny {
                    "affirm"
                } else {
                    "reject"
                },
                reference.text,
                resolution.confidence
            ),
            DebateResult::Disagreement => format!(
                "No consensus after {rounds} round(s); belief in \"{}\" split {:.2} / {:.2}.",
                reference.text, resolution.split.affirm, resolution.split.deny
            ),
        };
        info!(result = ?resolution.result, rounds, "Debate resolved");

        Some(DebateOutcome {
            claim_ids: participants.iter().map(|p| p.claim.id.clone()).collect(),
            reference_claim_id: reference.id.clone(),
            result: resolution.result,
            confidence: resolution.confidence,
            split: resolution.split,
            rounds,
            final_positions: participants
                .iter()
                .map(|p| FinalPosition {
                    agent: p.name.clone(),
                    claim_id: p.claim.id.clone(),
                    position: p.position.clone(),
                    stance: p.stance,
                    confidence: p.confidence,
                    belief: p.belief(reference.stance),
                    failed: p.failed,
                })
                .collect(),
            arguments,
            summary,
        })
    }

    async fn position_round<F>(
        &self,
        query: &str,
        participants: &mut [Participant],
        arguments: &mut Vec<DebateArgument>,
        on_argument: &mut F,
    ) where
        F: FnMut(&DebateArgument),
    {
        let tasks: Vec<AgentTask> = participants
            .iter()
            .map(|p| AgentTask::TakePosition {
                query: query.to_string(),
                claim_id: p.claim.id.clone(),
                claim: p.claim.text.clone(),
                opposing: participants
                    .iter()
                    .filter(|o| o.claim.id != p.claim.id)
                    .map(|o| o.claim.text.clone())
                    .collect(),
            })
            .collect();
        let results =
            futures::future::join_all(participants.iter().zip(&tasks).map(|(p, t)| p.agent.run(t))).await;

        for (participant, result) in participants.iter_mut().zip(results) {
            let argument = match result {
                Ok(AgentOutput::Position(position)) => {
                    participant.position = position.position.clone();
                    participant.stance = position.stance;
                    participant.confidence = position.confidence;
                    let argument = if position.reasoning.is_empty() {
                        position.position
                    } else {
                        format!("{} {}", position.position, position.reasoning)
                    };
                    DebateArgument {
                        round: 1,
                        agent: participant.name.clone(),
                        claim_id: participant.claim.id.clone(),
                        argument,
                        confidence: position.confidence,
                        fallback: false,
                    }
                }
                Ok(other) => fallback(participant, 1, format!("unexpected output {other:?}")),
                Err(e) => fallback(participant, 1, e.to_string()),
            };
            on_argument(&argument);
            arguments.push(argument);
        }
    }

    async fn rebuttal_round<F>(
        &self,
        query: &str,
        round: u32,
        participants: &mut [Participant],
        arguments: &mut Vec<DebateArgument>,
        on_argument: &mut F,
    ) where
        F: FnMut(&DebateArgument),
    {
        let briefs: Vec<PositionBrief> = participants.iter().map(Participant::brief).collect();
        // Failed participants sit out the remaining rounds.
        let tasks: Vec<Option<AgentTask>> = participants
            .iter()
            .enumerate()
            .map(|(i, p)| {
                (!p.failed).then(|| AgentTask::Rebut {
                    query: query.to_string(),
                    claim_id: p.claim.id.clone(),
                    claim: p.claim.text.clone(),
                    own: briefs[i].clone(),
                    others: briefs
                        .iter()
                        .enumerate()
                        .filter(|(j, b)| *j != i && !participants[*j].failed && !b.position.is_empty())
                        .map(|(_, b)| b.clone())
                        .collect(),
                })
            })
            .collect();
        let results = futures::future::join_all(participants.iter().zip(&tasks).map(|(p, t)| async move {
            match t {
                Some(task) => Some(p.agent.run(task).await),
                None => None,
            }
        }))
        .await;

        for (participant, result) in participants.iter_mut().zip(results) {
            let argument = match result {
                None => continue,
                Some(Ok(AgentOutput::Rebuttal(rebuttal))) => {
                    participant.confidence = rebuttal.new_confidence;
                    DebateArgument {
                        round,
                        agent: participant.name.clone(),
                        claim_id: participant.claim.id.clone(),
                        argument: rebuttal.rebuttal,
                        confidence: rebuttal.new_confidence,
                        fallback: false,
                    }
                }
                Some(Ok(other)) => fallback(participant, round, format!("unexpected output {other:?}")),
                Some(Err(e)) => fallback(participant, round, e.to_string()),
            };
            on_argument(&argument);
            arguments.push(argument);
        }
    }

    fn resolve(&self, participants: &[Participant], reference: Stance) -> Resolution {
        let beliefs: Vec<f64> = participants
            .iter()
            .filter(|p| !p.failed)
            .map(|p| p.belief(reference))
            .collect();
        if beliefs.is_empty() {
            return Resolution {
                result: DebateResult::Disagreement,
                confidence: 0.0,
                split: ConfidenceSplit {
                    affirm: 0.0,
                    deny: 0.0,
                },
            };
        }

        let mean = beliefs.iter().sum::<f64>() / beliefs.len() as f64;
        let spread = beliefs.iter().copied().fold(f64::MIN, f64::max)
            - beliefs.iter().copied().fold(f64::MAX, f64::min);
        let confidence = mean.max(1.0 - mean);
        let result = if beliefs.len() >= 2
            && spread < self.config.consensus_tolerance
            && confidence > self.config.min_consensus_confidence
        {
            DebateResult::Consensus
        } else {
            DebateResult::Disagreement
        };
        Resolution {
            result,
            confidence,
            split: ConfidenceSplit {
                affirm: mean,
                deny: 1.0 - mean,
            },
        }
    }
}

fn fallback(participant: &mut Participant, round: u32, error: String) -> DebateArgument {
    warn!(agent = %participant.name, claim = %participant.claim.id, round, error = %error, "Debate agent failed");
    participant.failed = true;
    participant.confidence = 0.0;
    DebateArgument {
        round,
        agent: participant.name.clone(),
        claim_id: participant.claim.id.clone(),
        argument: format!("No argument: {error}"),
        confidence: 0.0,
        fallback: true,
    }
}
