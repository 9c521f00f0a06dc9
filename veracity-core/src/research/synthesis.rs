//! Final report generation.
//!
//! The report body is assembled deterministically from curated sources,
//! verified claims, and debate outcomes. A synthesizer agent, when present,
//! only contributes the executive summary prose. The assembled markdown is
//! filtered once at the end, so citation-shaped text from any input (query,
//! claim text, debate positions, agent prose) can only cite curated sources.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::agents::{AgentOutput, AgentTask, ResearchAgent};
use super::curator::CurationStats;
use super::debate::{DebateOutcome, DebateResult};
use super::graph::GraphStatistics;
use super::sources::{Claim, Source, VerificationMethod};
use crate::text;

static CITATION: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\[(src-[0-9A-Za-z_-]+)\]").ok());

/// Source ids cited as `[src-...]` in `markdown`, in order of first use.
pub fn citations(markdown: &str) -> Vec<String> {
    let Some(re) = CITATION.as_ref() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.captures_iter(markdown)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Remove citations to sources outside `allowed`.
pub fn sanitize_citations(markdown: &str, allowed: &HashSet<&str>) -> String {
    let Some(re) = CITATION.as_ref() else {
        return markdown.to_string();
    };
    re.replace_all(markdown, |caps: &regex::Captures<'_>| {
        let id = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if allowed.contains(id) {
            caps[0].to_string()
        } else {
            String::new()
        }
    })
    .into_owned()
}

/// Everything the report is built from.
pub struct ReportInput<'a> {
    pub query: &'a str,
    pub sources: &'a [Source],
    pub claims: &'a [Claim],
    pub outcomes: &'a [DebateOutcome],
    pub graph: &'a GraphStatistics,
    pub curation: Option<&'a CurationStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub markdown: String,
    pub cited_sources: Vec<String>,
    pub claims_reported: usize,
    pub unresolved_disagreements: usize,
}

pub struct Synthesizer {
    agent: Option<Arc<dyn ResearchAgent>>,
    findings_per_topic: usize,
    max_topics: usize,
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Synthesizer {
    pub fn new() -> Self {
        Self {
            agent: None,
            findings_per_topic: 5,
            max_topics: 8,
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn ResearchAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub async fn synthesize(&self, input: &ReportInput<'_>) -> ResearchReport {
        let sources: HashMap<&str, &Source> = input.sources.iter().map(|s| (s.id.as_str(), s)).collect();
        let allowed: HashSet<&str> = sources.keys().copied().collect();
        let claims: Vec<&Claim> = input
            .claims
            .iter()
            .filter(|c| sources.contains_key(c.source_id.as_str()))
            .collect();
        let omitted = input.claims.len() - claims.len();
        if omitted > 0 {
            warn!(omitted, "Leaving out claims whose source was not curated");
        }

        let topics = self.topics(&claims);
        let mut out = format!("# Research Report: {}\n\n", input.query);

        out.push_str("## Executive Summary\n\n");
        let summary = match self.agent_summary(input.query, &topics).await {
            Some(summary) => summary,
            None => fallback_summary(input, &claims),
        };
        out.push_str(summary.trim());
        out.push_str("\n\n");

        out.push_str("## Findings\n\n");
        if topics.is_empty() {
            out.push_str("No claims could be extracted from the curated sources.\n\n");
        }
        for (topic, findings) in &topics {
            out.push_str(&format!("### {topic}\n\n"));
            for claim in findings {
                out.push_str(&format!("- {} [{}] {}\n", claim.text, claim.source_id, verification_tag(claim)));
            }
            out.push('\n');
        }

        let unresolved = self.write_debates(&mut out, input, &sources);
        write_quality(&mut out, input, &claims);

        out.push_str("## Sources\n\n");
        for source in input.sources {
            out.push_str(&format!(
                "- [{}] **{}** ({}, {}, credibility {:.2})\n  {}\n",
                source.id,
                if source.title.is_empty() { &source.domain } else { &source.title },
                source.domain,
                source.source_type.as_str(),
                source.credibility,
                source.url,
            ));
        }

        let out = sanitize_citations(&out, &allowed);
        let cited_sources = citations(&out);
        info!(
            cited = cited_sources.len(),
            claims = claims.len(),
            unresolved,
            "Report synthesized"
        );
        ResearchReport {
            markdown: out,
            cited_sources,
            claims_reported: claims.len(),
            unresolved_disagreements: unresolved,
        }
    }

    /// Claims grouped by their first entity, biggest topic first.
    fn topics<'c>(&self, claims: &[&'c Claim]) -> Vec<(String, Vec<&'c Claim>)> {
        let mut grouped: BTreeMap<String, (String, Vec<&'c Claim>)> = BTreeMap::new();
        for &claim in claims {
            let label = claim
                .entities
                .first()
                .cloned()
                .unwrap_or_else(|| "General".to_string());
            let key = text::normalize(&label);
            grouped
                .entry(key)
                .or_insert_with(|| (capitalize(&label), Vec::new()))
                .1
                .push(claim);
        }
        let mut topics: Vec<(String, Vec<&Claim>)> = grouped.into_values().collect();
        topics.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
        topics.truncate(self.max_topics);
        for (_, findings) in &mut topics {
            findings.sort_by(|a, b| {
                b.verified
                    .cmp(&a.verified)
                    .then_with(|| b.confidence.total_cmp(&a.confidence))
                    .then_with(|| a.id.cmp(&b.id))
            });
            findings.truncate(self.findings_per_topic);
        }
        topics
    }

    async fn agent_summary(&self, query: &str, topics: &[(String, Vec<&Claim>)]) -> Option<String> {
        let agent = self.agent.as_ref()?;
        if topics.is_empty() {
            return None;
        }
        let mut findings = String::new();
        for (topic, claims) in topics {
            findings.push_str(&format!("{topic}:\n"));
            for claim in claims {
                findings.push_str(&format!("- {} [{}]\n", claim.text, claim.source_id));
            }
        }
        let task = AgentTask::Summarize {
            query: query.to_string(),
            findings,
        };
        match agent.run(&task).await {
            Ok(AgentOutput::Summary(summary)) if !summary.trim().is_empty() => Some(summary),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Synthesizer agent failed, using the generated summary");
                None
            }
        }
    }

    fn write_debates(&self, out: &mut String, input: &ReportInput<'_>, sources: &HashMap<&str, &Source>) -> usize {
        out.push_str("## Agreements and Disagreements\n\n");
        out.push_str(&format!(
            "The knowledge graph links {} supporting and {} contradicting claim pairs.\n\n",
            input.graph.supports_edges, input.graph.contradicts_edges
        ));
        if input.outcomes.is_empty() {
            out.push_str("No contradiction was strong enough to require a debate.\n\n");
            return 0;
        }

        let claim_source: HashMap<&str, &str> = input
            .claims
            .iter()
            .filter(|c| sources.contains_key(c.source_id.as_str()))
            .map(|c| (c.id.as_str(), c.source_id.as_str()))
            .collect();
        let cite = |claim_id: &str| {
            claim_source
                .get(claim_id)
                .map(|s| format!(" [{s}]"))
                .unwrap_or_default()
        };

        let (agreed, unresolved): (Vec<&DebateOutcome>, Vec<&DebateOutcome>) =
            input.outcomes.iter().partition(|o| o.result == DebateResult::Consensus);

        if !agreed.is_empty() {
            out.push_str("### Resolved by Consensus\n\n");
            for outcome in &agreed {
                let cited: String = outcome.claim_ids.iter().map(|id| cite(id)).collect();
                out.push_str(&format!(
                    "- {} (confidence {:.0}%){cited}\n",
                    outcome.summary,
                    outcome.confidence * 100.0
                ));
            }
            out.push('\n');
        }

        if !unresolved.is_empty() {
            out.push_str("### Unresolved Disagreements\n\n");
            for outcome in &unresolved {
                out.push_str(&format!("- {}\n", outcome.summary));
                for position in &outcome.final_positions {
                    if position.failed {
                        continue;
                    }
                    out.push_str(&format!(
                        "  - **{}** on `{}`{} (confidence {:.2}): {}\n",
                        position.agent,
                        position.claim_id,
                        cite(&position.claim_id),
                        position.confidence,
                        position.position
                    ));
                }
            }
            out.push('\n');
        }
        unresolved.len()
    }
}

fn capitalize(label: &str) -> String {
    let mut chars = label.trim().chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn verification_tag(claim: &Claim) -> String {
    if claim.refuted {
        "_(contradicted by its own source)_".to_string()
    } else if claim.verified {
        format!(
            "_(verified: {}, {:.2})_",
            claim.verification_method.as_str(),
            claim.verification_confidence
        )
    } else {
        "_(unverified)_".to_string()
    }
}

fn fallback_summary(input: &ReportInput<'_>, claims: &[&Claim]) -> String {
    let verified = claims.iter().filter(|c| c.verified).count();
    let mut out = format!(
        "{} sources were curated and {} claims extracted, of which {} were verified against their sources.",
        input.sources.len(),
        claims.len(),
        verified
    );
    if !input.outcomes.is_empty() {
        let consensus = input.outcomes.iter().filter(|o| o.is_consensus()).count();
        out.push_str(&format!(
            " {} contradiction(s) were debated and {} reached consensus.",
            input.outcomes.len(),
            consensus
        ));
    }
    let mut top: Vec<&&Claim> = claims.iter().filter(|c| c.verified && !c.refuted).collect();
    top.sort_by(|a, b| b.confidence.total_cmp(&a.confidence).then_with(|| a.id.cmp(&b.id)));
    if !top.is_empty() {
        out.push_str("\n\nKey findings:\n\n");
        for claim in top.into_iter().take(3) {
            out.push_str(&format!("- {} [{}]\n", claim.text, claim.source_id));
        }
    }
    out
}

fn write_quality(out: &mut String, input: &ReportInput<'_>, claims: &[&Claim]) {
    out.push_str("## Evidence Quality\n\n");

    let (mut high, mut medium, mut low) = (0, 0, 0);
    for source in input.sources {
        match source.credibility {
            c if c >= 0.7 => high += 1,
            c if c >= 0.4 => medium += 1,
            _ => low += 1,
        }
    }
    let mean = if input.sources.is_empty() {
        0.0
    } else {
        input.sources.iter().map(|s| s.credibility).sum::<f64>() / input.sources.len() as f64
    };
    out.push_str(&format!(
        "- Source credibility: {high} high, {medium} medium, {low} low (mean {mean:.2})\n"
    ));

    let mut types: BTreeMap<&str, usize> = BTreeMap::new();
    for source in input.sources {
        *types.entry(source.source_type.as_str()).or_default() += 1;
    }
    if !types.is_empty() {
        let listed: Vec<String> = types.iter().map(|(t, n)| format!("{n} {t}")).collect();
        out.push_str(&format!("- Source types: {}\n", listed.join(", ")));
    }

    let total = claims.len().max(1) as f64;
    let count = |method: VerificationMethod| {
        claims
            .iter()
            .filter(|c| c.verified && c.verification_method == method)
            .count()
    };
    let (exact, semantic, nli) = (
        count(VerificationMethod::Exact),
        count(VerificationMethod::Semantic),
        count(VerificationMethod::Nli),
    );
    let unverified = claims.iter().filter(|c| !c.verified).count();
    let refuted = claims.iter().filter(|c| c.refuted).count();
    out.push_str(&format!(
        "- Verification: {exact} exact ({:.0}%), {semantic} semantic ({:.0}%), {nli} entailment ({:.0}%), {unverified} unverified ({:.0}%)\n",
        exact as f64 / total * 100.0,
        semantic as f64 / total * 100.0,
        nli as f64 / total * 100.0,
        unverified as f64 / total * 100.0,
    ));
    if refuted > 0 {
        out.push_str(&format!("- {refuted} claim(s) are contradicted by their own source\n"));
    }
    if let Some(stats) = input.curation {
        out.push_str(&format!(
            "- Curation kept {} of {} sources ({} exact and {} near duplicates, {} low credibility, {} off topic)\n",
            stats.output,
            stats.input,
            stats.exact_duplicates,
            stats.semantic_duplicates,
            stats.low_credibility,
            stats.irrelevant
        ));
    }
    out.push('\n');
}
