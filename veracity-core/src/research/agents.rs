//! Research agents.
//!
//! One [`ResearchAgent`] trait covers every role. A role changes the
//! instructions an agent works under, never the shape of its results: each
//! [`AgentTask`] variant has exactly one matching [`AgentOutput`] variant.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::sources::{ClaimCandidate, Stance};
use crate::error::AgentError;
use crate::llm::{CompletionRequest, LlmClient, extract_json};

/// Role tag of a research agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Broad first pass over the sources.
    Scout,
    /// Looks for caveats, limitations, and counter-evidence.
    Skeptic,
    /// Precise, quantitative reading.
    Analyst,
    /// Writes summaries.
    Synthesizer,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Scout => "scout",
            AgentRole::Skeptic => "skeptic",
            AgentRole::Analyst => "analyst",
            AgentRole::Synthesizer => "synthesizer",
        }
    }

    fn instructions(self) -> &'static str {
        match self {
            AgentRole::Scout => {
                "You are a research scout. Identify the main factual claims each source makes \
                 about the research question. Prefer breadth: cover every distinct assertion."
            }
            AgentRole::Skeptic => {
                "You are a skeptical reviewer. Focus on limitations, caveats, negative findings, \
                 and statements that cut against the popular view. Weigh evidence critically."
            }
            AgentRole::Analyst => {
                "You are a careful research analyst. Extract precise, checkable claims, keeping \
                 numbers, populations, and conditions exactly as the source states them."
            }
            AgentRole::Synthesizer => {
                "You are a research synthesizer. Combine findings into a neutral, well-organized \
                 summary that reflects the weight of evidence."
            }
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scout" => Ok(AgentRole::Scout),
            "skeptic" => Ok(AgentRole::Skeptic),
            "analyst" => Ok(AgentRole::Analyst),
            "synthesizer" => Ok(AgentRole::Synthesizer),
            other => Err(format!("unknown agent role '{other}'")),
        }
    }
}

/// Parse a list of role names, skipping (and logging) unknown ones.
pub fn parse_roles(names: &[String]) -> Vec<AgentRole> {
    names
        .iter()
        .filter_map(|name| match name.parse() {
            Ok(role) => Some(role),
            Err(e) => {
                warn!(error = %e, "Ignoring configured agent role");
                None
            }
        })
        .collect()
}

/// A source as shown to an agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceBrief {
    pub id: String,
    pub title: String,
    pub url: String,
    /// Already truncated to the configured length.
    pub text: String,
}

/// One side of a debate, as shown to the other agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionBrief {
    pub agent: String,
    pub claim_id: String,
    pub position: String,
    pub confidence: f64,
}

/// Work handed to an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentTask {
    ExtractClaims {
        query: String,
        sources: Vec<SourceBrief>,
        max_claims_per_source: usize,
    },
    /// Debate round 1: argue for or against a claim.
    TakePosition {
        query: String,
        claim_id: String,
        claim: String,
        /// The conflicting claims from the same contradiction cluster.
        opposing: Vec<String>,
    },
    /// Later debate rounds: answer the other positions.
    Rebut {
        query: String,
        claim_id: String,
        claim: String,
        own: PositionBrief,
        others: Vec<PositionBrief>,
    },
    Summarize {
        query: String,
        findings: String,
    },
}

impl AgentTask {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentTask::ExtractClaims { .. } => "extract_claims",
            AgentTask::TakePosition { .. } => "take_position",
            AgentTask::Rebut { .. } => "rebut",
            AgentTask::Summarize { .. } => "summarize",
        }
    }
}

/// Round-1 debate position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position: String,
    /// `Positive` when the agent affirms the claim.
    pub stance: Stance,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rebuttal {
    pub rebuttal: String,
    pub new_confidence: f64,
}

/// Typed result of an [`AgentTask`].
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    Claims(Vec<ClaimCandidate>),
    Position(Position),
    Rebuttal(Rebuttal),
    Summary(String),
}

#[async_trait]
pub trait ResearchAgent: Send + Sync {
    fn role(&self) -> AgentRole;

    /// Identity used in events and debate transcripts.
    fn name(&self) -> String {
        self.role().to_string()
    }

    async fn run(&self, task: &AgentTask) -> Result<AgentOutput, AgentError>;
}

const STRICT_SUFFIX: &str = "Your previous reply could not be parsed. Respond with ONLY a single \
     JSON object exactly matching the requested schema. No prose, no markdown, no code fences.";

/// A research agent backed by a language model.
pub struct LlmResearchAgent {
    role: AgentRole,
    llm: Arc<LlmClient>,
    model: Option<String>,
}

impl LlmResearchAgent {
    pub fn new(role: AgentRole, llm: Arc<LlmClient>) -> Self {
        Self {
            role,
            llm,
            model: None,
        }
    }

    /// Route this agent's requests to a specific model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// One agent per role, honoring per-role model overrides.
    pub fn for_roles(
        roles: &[AgentRole],
        llm: Arc<LlmClient>,
        role_models: &BTreeMap<String, String>,
    ) -> Vec<Arc<dyn ResearchAgent>> {
        roles
            .iter()
            .map(|role| {
                let mut agent = LlmResearchAgent::new(*role, Arc::clone(&llm));
                if let Some(model) = role_models.get(role.as_str()) {
                    agent = agent.with_model(model.clone());
                }
                Arc::new(agent) as Arc<dyn ResearchAgent>
            })
            .collect()
    }

    fn request(&self, task: &AgentTask, strict: bool) -> CompletionRequest {
        let mut system = self.role.instructions().to_string();
        if strict {
            system.push_str("\n\n");
            system.push_str(STRICT_SUFFIX);
        }
        let mut request = CompletionRequest::new(system, render_prompt(task));
        request.model = self.model.clone();
        if strict {
            request.temperature = Some(0.0);
        }
        request
    }
}

#[async_trait]
impl ResearchAgent for LlmResearchAgent {
    fn role(&self) -> AgentRole {
        self.role
    }

    async fn run(&self, task: &AgentTask) -> Result<AgentOutput, AgentError> {
        let reply = self.llm.complete(self.request(task, false)).await?;
        match parse_output(self.role, task, &reply) {
            Ok(output) => Ok(output),
            Err(first) => {
                debug!(agent = %self.role, task = task.kind(), error = %first, "Retrying with stricter instructions");
                let reply = self.llm.complete(self.request(task, true)).await?;
                parse_output(self.role, task, &reply)
            }
        }
    }
}

fn render_prompt(task: &AgentTask) -> String {
    match task {
        AgentTask::ExtractClaims {
            query,
            sources,
            max_claims_per_source,
        } => {
            let mut prompt = format!(
                "Research question: {query}\n\n\
                 Extract up to {max_claims_per_source} atomic factual claims per source that bear on \
                 the question. Quote claims as closely to the source wording as possible.\n\n"
            );
            for source in sources {
                prompt.push_str(&format!(
                    "Source [{}] {} ({})\n{}\n\n",
                    source.id, source.title, source.url, source.text
                ));
            }
            prompt.push_str(
                "Respond with JSON: {\"claims\": [{\"source_id\": \"<id from the brackets>\", \
                 \"text\": \"...\", \"confidence\": 0.0-1.0, \"entities\": [\"...\"], \
                 \"stance\": \"positive|negative\"}]}",
            );
            prompt
        }
        AgentTask::TakePosition {
            query,
            claim_id,
            claim,
            opposing,
        } => {
            let mut prompt = format!(
                "Research question: {query}\n\nClaim under debate [{claim_id}]: {claim}\n\n"
            );
            if !opposing.is_empty() {
                prompt.push_str("Conflicting claims from other sources:\n");
                for other in opposing {
                    prompt.push_str(&format!("- {other}\n"));
                }
                prompt.push('\n');
            }
            prompt.push_str(
                "State whether the claim is supported by the weight of evidence. Respond with JSON: \
                 {\"position\": \"...\", \"stance\": \"support|oppose\", \"confidence\": 0.0-1.0, \
                 \"reasoning\": \"...\"}",
            );
            prompt
        }
        AgentTask::Rebut {
            query,
            claim_id,
            claim,
            own,
            others,
        } => {
            let mut prompt = format!(
                "Research question: {query}\n\nClaim under debate [{claim_id}]: {claim}\n\n\
                 Your position (confidence {:.2}): {}\n\nOther positions:\n",
                own.confidence, own.position
            );
            for other in others {
                prompt.push_str(&format!(
                    "- {} on [{}] (confidence {:.2}): {}\n",
                    other.agent, other.claim_id, other.confidence, other.position
                ));
            }
            prompt.push_str(
                "\nRespond to the other positions and restate your confidence in your own. \
                 Respond with JSON: {\"rebuttal\": \"...\", \"new_confidence\": 0.0-1.0}",
            );
            prompt
        }
        AgentTask::Summarize { query, findings } => format!(
            "Research question: {query}\n\nFindings:\n{findings}\n\n\
             Write a concise executive summary (3-5 sentences). Cite sources only with the \
             [src-...] ids that appear in the findings. Respond with JSON: {{\"summary\": \"...\"}}"
        ),
    }
}

fn parse_error(role: AgentRole, message: impl Into<String>) -> AgentError {
    AgentError::OutputParse {
        agent: role.to_string(),
        message: message.into(),
    }
}

fn parse_output(role: AgentRole, task: &AgentTask, reply: &str) -> Result<AgentOutput, AgentError> {
    let json = || extract_json(reply).ok_or_else(|| parse_error(role, "no JSON in reply"));
    match task {
        AgentTask::ExtractClaims { .. } => parse_claims(role, &json()?).map(AgentOutput::Claims),
        AgentTask::TakePosition { .. } => parse_position(role, &json()?).map(AgentOutput::Position),
        AgentTask::Rebut { .. } => parse_rebuttal(role, &json()?).map(AgentOutput::Rebuttal),
        AgentTask::Summarize { .. } => parse_summary(role, reply).map(AgentOutput::Summary),
    }
}

fn unit_interval(value: Option<&Value>) -> Option<f64> {
    let v = value?;
    let n = v
        .as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))?;
    n.is_finite().then(|| n.clamp(0.0, 1.0))
}

fn parse_stance(value: Option<&Value>) -> Option<Stance> {
    match value?.as_str()?.trim().to_ascii_lowercase().as_str() {
        "positive" | "support" | "supports" | "for" | "agree" | "affirm" | "true" => {
            Some(Stance::Positive)
        }
        "negative" | "oppose" | "opposes" | "against" | "disagree" | "refute" | "false" => {
            Some(Stance::Negative)
        }
        _ => None,
    }
}

fn parse_claims(role: AgentRole, value: &Value) -> Result<Vec<ClaimCandidate>, AgentError> {
    let items = value
        .get("claims")
        .unwrap_or(value)
        .as_array()
        .ok_or_else(|| parse_error(role, "expected a \"claims\" array"))?;

    Ok(items
        .iter()
        .filter_map(|item| {
            let text = item.get("text")?.as_str()?.trim();
            if text.is_empty() {
                return None;
            }
            let entities = item
                .get("entities")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::trim)
                        .filter(|e| !e.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            Some(ClaimCandidate {
                source_id: item
                    .get("source_id")
                    .and_then(Value::as_str)
                    .map(|s| s.trim().trim_matches(['[', ']']).to_string()),
                text: text.to_string(),
                confidence: unit_interval(item.get("confidence")).unwrap_or(0.5),
                entities,
                stance: parse_stance(item.get("stance")),
            })
        })
        .collect())
}

fn parse_position(role: AgentRole, value: &Value) -> Result<Position, AgentError> {
    let position = value
        .get("position")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| parse_error(role, "missing \"position\""))?;
    let stance = parse_stance(value.get("stance"))
        .ok_or_else(|| parse_error(role, "missing or unknown \"stance\""))?;
    let confidence = unit_interval(value.get("confidence"))
        .ok_or_else(|| parse_error(role, "missing \"confidence\""))?;
    Ok(Position {
        position: position.to_string(),
        stance,
        confidence,
        reasoning: value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
    })
}

fn parse_rebuttal(role: AgentRole, value: &Value) -> Result<Rebuttal, AgentError> {
    let rebuttal = value
        .get("rebuttal")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| parse_error(role, "missing \"rebuttal\""))?;
    let new_confidence = unit_interval(value.get("new_confidence"))
        .ok_or_else(|| parse_error(role, "missing \"new_confidence\""))?;
    Ok(Rebuttal {
        rebuttal: rebuttal.to_string(),
        new_confidence,
    })
}

fn parse_summary(role: AgentRole, reply: &str) -> Result<String, AgentError> {
    if let Some(value) = extract_json(reply) {
        return value
            .get("summary")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .ok_or_else(|| parse_error(role, "missing \"summary\""));
    }
    let text = reply.trim();
    if text.is_empty() {
        Err(parse_error(role, "empty summary"))
    } else {
        Ok(text.to_string())
    }
}
