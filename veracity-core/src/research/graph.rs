//! Knowledge graph of sources, claims, and entities.
//!
//! Uses petgraph's `DiGraph` as the node arena with adjacency lists, plus an
//! id index. The graph only grows: every mutation returns a [`GraphDelta`]
//! holding exactly what was added, nodes before edges, so a consumer that
//! applies deltas in order never sees an edge whose endpoint is missing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::sources::{Claim, Source};
use crate::config::GraphConfig;
use crate::embeddings::{Embedder, cosine_similarity};
use crate::text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Claim,
    Entity,
    Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Relation {
    Supports,
    Contradicts,
    /// claim -> entity
    About,
    /// claim -> source
    From,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub node_type: NodeType,
    pub label: String,
    /// Display weight.
    pub weight: f64,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub relation: Relation,
    pub confidence: f64,
    /// Display thickness.
    pub weight: f64,
}

/// What one mutation added.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDelta {
    pub added_nodes: Vec<GraphNode>,
    pub added_edges: Vec<GraphEdge>,
}

impl GraphDelta {
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty() && self.added_edges.is_empty()
    }

    pub fn merge(&mut self, other: GraphDelta) {
        self.added_nodes.extend(other.added_nodes);
        self.added_edges.extend(other.added_edges);
    }
}

/// The whole graph, for inspection and persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub claim_nodes: usize,
    pub entity_nodes: usize,
    pub source_nodes: usize,
    pub supports_edges: usize,
    pub contradicts_edges: usize,
    pub connected_components: usize,
}

/// Claims joined by strong CONTRADICTS edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictionCluster {
    /// Sorted.
    pub claim_ids: Vec<String>,
    pub max_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedClaim {
    pub claim_id: String,
    pub label: String,
    pub confidence: f64,
}

/// Neighborhood of one claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimContext {
    pub claim: GraphNode,
    pub sources: Vec<GraphNode>,
    pub entities: Vec<GraphNode>,
    pub supports: Vec<RelatedClaim>,
    pub contradicts: Vec<RelatedClaim>,
}

const LABEL_CHARS: usize = 100;

pub fn source_node_id(source_id: &str) -> String {
    format!("source:{source_id}")
}

pub fn claim_node_id(claim_id: &str) -> String {
    format!("claim:{claim_id}")
}

/// Entity ids are idempotent by normalized label.
pub fn entity_node_id(label: &str) -> String {
    format!("entity:{}", text::normalize(label).replace(' ', "_"))
}

fn short_label(full: &str) -> String {
    if full.chars().count() > LABEL_CHARS {
        format!("{}...", text::truncate_chars(full, LABEL_CHARS))
    } else {
        full.to_string()
    }
}

fn edge_weight(confidence: f64) -> f64 {
    1.0 + confidence * 3.0
}

/// Arena-backed knowledge graph.
#[derive(Debug, Default)]
pub struct KnowledgeGraph {
    graph: DiGraph<GraphNode, GraphEdge>,
    index: HashMap<String, NodeIndex>,
    edge_keys: HashSet<(NodeIndex, NodeIndex, Relation)>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|idx| &self.graph[*idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Insert a node unless one with the same id exists. Returns whether it was added.
    fn insert_node(&mut self, node: GraphNode, delta: &mut GraphDelta) -> bool {
        if self.index.contains_key(&node.id) {
            return false;
        }
        let id = node.id.clone();
        let idx = self.graph.add_node(node.clone());
        self.index.insert(id, idx);
        delta.added_nodes.push(node);
        true
    }

    /// Insert an edge between existing nodes, once per (endpoints, relation).
    fn insert_edge(&mut self, edge: GraphEdge, delta: &mut GraphDelta) -> bool {
        let (Some(&from), Some(&to)) = (self.index.get(&edge.source), self.index.get(&edge.target)) else {
            warn!(source = %edge.source, target = %edge.target, "Refusing edge with a missing endpoint");
            return false;
        };
        if !self.edge_keys.insert((from, to, edge.relation)) {
            return false;
        }
        self.graph.add_edge(from, to, edge.clone());
        delta.added_edges.push(edge);
        true
    }

    fn bump_entity(&mut self, id: &str) {
        if let Some(&idx) = self.index.get(id) {
            let node = &mut self.graph[idx];
            let mentions = node
                .attributes
                .get("mentions")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                + 1;
            node.attributes.insert("mentions".into(), json!(mentions));
            node.weight = 10.0 + mentions as f64 * 2.0;
        }
    }

    /// CONTRADICTS edges with confidence above `threshold`.
    pub fn has_contradiction_above(&self, threshold: f64) -> bool {
        self.graph
            .edge_weights()
            .any(|e| e.relation == Relation::Contradicts && e.confidence > threshold)
    }

    /// Connected groups of claims joined by CONTRADICTS edges above
    /// `threshold`, strongest cluster first.
    pub fn contradiction_clusters(&self, threshold: f64) -> Vec<ContradictionCluster> {
        let mut sets = UnionFind::<usize>::new(self.graph.node_count());
        let mut involved: HashMap<usize, f64> = HashMap::new();
        for edge in self.graph.edge_references() {
            let data = edge.weight();
            if data.relation != Relation::Contradicts || data.confidence <= threshold {
                continue;
            }
            let (a, b) = (edge.source().index(), edge.target().index());
            sets.union(a, b);
            for n in [a, b] {
                let best = involved.entry(n).or_insert(0.0);
                *best = best.max(data.confidence);
            }
        }

        let mut groups: BTreeMap<usize, (Vec<String>, f64)> = BTreeMap::new();
        for (&n, &confidence) in &involved {
            let node = &self.graph[NodeIndex::new(n)];
            let Some(claim_id) = node.id.strip_prefix("claim:") else {
                continue;
            };
            let group = groups.entry(sets.find(n)).or_insert_with(|| (Vec::new(), 0.0));
            group.0.push(claim_id.to_string());
            group.1 = group.1.max(confidence);
        }

        let mut clusters: Vec<ContradictionCluster> = groups
            .into_values()
            .map(|(mut claim_ids, max_confidence)| {
                claim_ids.sort();
                ContradictionCluster {
                    claim_ids,
                    max_confidence,
                }
            })
            .collect();
        clusters.sort_by(|a, b| {
            b.max_confidence
                .total_cmp(&a.max_confidence)
                .then_with(|| a.claim_ids.cmp(&b.claim_ids))
        });
        clusters
    }

    pub fn statistics(&self) -> GraphStatistics {
        let mut stats = GraphStatistics {
            total_nodes: self.graph.node_count(),
            total_edges: self.graph.edge_count(),
            connected_components: petgraph::algo::connected_components(&self.graph),
            ..Default::default()
        };
        for node in self.graph.node_weights() {
            match node.node_type {
                NodeType::Claim => stats.claim_nodes += 1,
                NodeType::Entity => stats.entity_nodes += 1,
                NodeType::Source => stats.source_nodes += 1,
            }
        }
        for edge in self.graph.edge_weights() {
            match edge.relation {
                Relation::Supports => stats.supports_edges += 1,
                Relation::Contradicts => stats.contradicts_edges += 1,
                Relation::About | Relation::From => {}
            }
        }
        stats
    }

    pub fn claim_context(&self, claim_id: &str) -> Option<ClaimContext> {
        let idx = *self.index.get(&claim_node_id(claim_id))?;
        let mut context = ClaimContext {
            claim: self.graph[idx].clone(),
            sources: Vec::new(),
            entities: Vec::new(),
            supports: Vec::new(),
            contradicts: Vec::new(),
        };

        let outgoing = self.graph.edges(idx).map(|e| (e.target(), e.weight()));
        let incoming = self
            .graph
            .edges_directed(idx, petgraph::Direction::Incoming)
            .map(|e| (e.source(), e.weight()));
        for (other, edge) in outgoing.chain(incoming) {
            let node = &self.graph[other];
            let related = || RelatedClaim {
                claim_id: node.id.trim_start_matches("claim:").to_string(),
                label: node.label.clone(),
                confidence: edge.confidence,
            };
            match edge.relation {
                Relation::From => context.sources.push(node.clone()),
                Relation::About => context.entities.push(node.clone()),
                Relation::Supports => context.supports.push(related()),
                Relation::Contradicts => context.contradicts.push(related()),
            }
        }
        Some(context)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.graph.node_weights().cloned().collect(),
            edges: self.graph.edge_weights().cloned().collect(),
        }
    }

    /// Rebuild a graph from a snapshot. Edges with missing endpoints are skipped.
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Self {
        let mut graph = Self::new();
        let mut sink = GraphDelta::default();
        for node in &snapshot.nodes {
            graph.insert_node(node.clone(), &mut sink);
        }
        for edge in &snapshot.edges {
            graph.insert_edge(edge.clone(), &mut sink);
        }
        graph
    }
}

/// Feeds sources and claims into a [`KnowledgeGraph`] and relates claims.
pub struct GraphBuilder {
    config: GraphConfig,
    embedder: Arc<dyn Embedder>,
    graph: KnowledgeGraph,
    claim_embeddings: HashMap<String, Vec<f32>>,
}

impl GraphBuilder {
    pub fn new(config: GraphConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            embedder,
            graph: KnowledgeGraph::new(),
            claim_embeddings: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &KnowledgeGraph {
        &self.graph
    }

    pub fn into_graph(self) -> KnowledgeGraph {
        self.graph
    }

    pub fn add_source(&mut self, source: &Source) -> GraphDelta {
        let mut delta = GraphDelta::default();
        self.insert_source(source, &mut delta);
        delta
    }

    fn insert_source(&mut self, source: &Source, delta: &mut GraphDelta) {
        let label = if source.title.trim().is_empty() {
            source.domain.clone()
        } else {
            source.title.clone()
        };
        let mut attributes = BTreeMap::new();
        attributes.insert("source_id".into(), json!(source.id));
        attributes.insert("url".into(), json!(source.url));
        attributes.insert("domain".into(), json!(source.domain));
        attributes.insert("source_type".into(), json!(source.source_type));
        attributes.insert("credibility".into(), json!(source.credibility));
        self.graph.insert_node(
            GraphNode {
                id: source_node_id(&source.id),
                node_type: NodeType::Source,
                label: short_label(&label),
                weight: 15.0,
                attributes,
            },
            delta,
        );
    }

    /// Admit a claim with its FROM and ABOUT edges. Re-adding is a no-op.
    pub fn add_claim(&mut self, claim: &Claim, source: &Source) -> GraphDelta {
        let mut delta = GraphDelta::default();
        let claim_id = claim_node_id(&claim.id);
        if self.graph.contains(&claim_id) {
            return delta;
        }

        self.insert_source(source, &mut delta);

        let mut attributes = BTreeMap::new();
        attributes.insert("claim_id".into(), json!(claim.id));
        attributes.insert("text".into(), json!(claim.text));
        attributes.insert("confidence".into(), json!(claim.confidence));
        attributes.insert("stance".into(), json!(claim.stance));
        attributes.insert("agent".into(), json!(claim.agent));
        self.graph.insert_node(
            GraphNode {
                id: claim_id.clone(),
                node_type: NodeType::Claim,
                label: short_label(&claim.text),
                weight: 15.0,
                attributes,
            },
            &mut delta,
        );

        let mut entity_ids = Vec::new();
        for entity in &claim.entities {
            let entity_id = entity_node_id(entity);
            if entity_id == "entity:" || entity_ids.contains(&entity_id) {
                continue;
            }
            let mut attributes = BTreeMap::new();
            attributes.insert("name".into(), json!(entity));
            attributes.insert("mentions".into(), json!(1));
            let added = self.graph.insert_node(
                GraphNode {
                    id: entity_id.clone(),
                    node_type: NodeType::Entity,
                    label: entity.clone(),
                    weight: 12.0,
                    attributes,
                },
                &mut delta,
            );
            if !added {
                self.graph.bump_entity(&entity_id);
            }
            entity_ids.push(entity_id);
        }

        self.graph.insert_edge(
            GraphEdge {
                source: claim_id.clone(),
                target: source_node_id(&claim.source_id),
                relation: Relation::From,
                confidence: 1.0,
                weight: edge_weight(1.0),
            },
            &mut delta,
        );
        for entity_id in entity_ids {
            self.graph.insert_edge(
                GraphEdge {
                    source: claim_id.clone(),
                    target: entity_id,
                    relation: Relation::About,
                    confidence: claim.confidence,
                    weight: edge_weight(claim.confidence),
                },
                &mut delta,
            );
        }
        delta
    }

    /// Relate claim pairs that share an entity.
    ///
    /// Pairs at or above the relation threshold get SUPPORTS when their
    /// stances agree and CONTRADICTS when they differ, with the similarity as
    /// confidence. Claims missing from the graph or refuted by their own
    /// source (when so configured) are skipped.
    pub async fn relate_claims(&mut self, claims: &[Claim]) -> GraphDelta {
        let mut eligible: Vec<&Claim> = claims
            .iter()
            .filter(|c| self.graph.contains(&claim_node_id(&c.id)))
            .filter(|c| !(self.config.exclude_refuted && c.refuted))
            .collect();
        eligible.sort_by(|a, b| a.id.cmp(&b.id));
        eligible.dedup_by(|a, b| a.id == b.id);

        let missing: Vec<&Claim> = eligible
            .iter()
            .filter(|c| !self.claim_embeddings.contains_key(&c.id))
            .copied()
            .collect();
        let embedded = futures::future::join_all(missing.iter().map(|c| self.embedder.embed(&c.text))).await;
        for (claim, result) in missing.iter().zip(embedded) {
            match result {
                Ok(v) => {
                    self.claim_embeddings.insert(claim.id.clone(), v);
                }
                Err(e) => debug!(claim = %claim.id, error = %e, "Claim embedding failed, not relating it"),
            }
        }

        let entity_keys: Vec<HashSet<String>> = eligible
            .iter()
            .map(|c| c.entities.iter().map(|e| entity_node_id(e)).collect())
            .collect();

        let mut delta = GraphDelta::default();
        for i in 0..eligible.len() {
            for j in (i + 1)..eligible.len() {
                let (a, b) = (eligible[i], eligible[j]);
                if entity_keys[i].is_disjoint(&entity_keys[j]) {
                    continue;
                }
                let (Some(ea), Some(eb)) = (self.claim_embeddings.get(&a.id), self.claim_embeddings.get(&b.id))
                else {
                    continue;
                };
                let similarity = cosine_similarity(ea, eb);
                if similarity < self.config.relation_threshold {
                    continue;
                }
                let relation = if a.stance == b.stance {
                    Relation::Supports
                } else {
                    Relation::Contradicts
                };
                let confidence = similarity as f64;
                self.graph.insert_edge(
                    GraphEdge {
                        source: claim_node_id(&a.id),
                        target: claim_node_id(&b.id),
                        relation,
                        confidence,
                        weight: edge_weight(confidence),
                    },
                    &mut delta,
                );
            }
        }
        info!(
            claims = eligible.len(),
            edges = delta.added_edges.len(),
            "Related claims"
        );
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;
    use crate::research::agents::AgentRole;
    use crate::research::sources::{CredibilityBreakdown, SourceType, Stance, VerificationMethod};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn source(id: &str) -> Source {
        Source {
            id: id.into(),
            url: format!("https://example.org/{id}"),
            title: format!("Title {id}"),
            content_hash: id.into(),
            text: String::new(),
            word_count: 0,
            domain: "example.org".into(),
            source_type: SourceType::Webpage,
            credibility: 0.6,
            credibility_breakdown: CredibilityBreakdown::default(),
            has_citations: false,
            has_methodology: false,
            published_at: None,
            fetched_at: Utc::now(),
            relevance: 0.5,
            sub_query: "q".into(),
        }
    }

    fn claim(id: &str, source_id: &str, text: &str, entities: &[&str]) -> Claim {
        Claim {
            id: id.into(),
            source_id: source_id.into(),
            text: text.into(),
            confidence: 0.8,
            entities: entities.iter().map(|e| e.to_string()).collect(),
            keywords: text::keywords(text),
            stance: Stance::of(text),
            agent: AgentRole::Scout,
            verified: true,
            verification_method: VerificationMethod::Exact,
            verification_confidence: 1.0,
            excerpt: None,
            refuted: false,
        }
    }

    fn builder() -> GraphBuilder {
        GraphBuilder::new(GraphConfig::default(), Arc::new(LocalEmbedder::default()))
    }

    fn assert_self_consistent(graph: &KnowledgeGraph, delta: &GraphDelta) {
        let added: HashSet<&str> = delta.added_nodes.iter().map(|n| n.id.as_str()).collect();
        for edge in &delta.added_edges {
            for end in [&edge.source, &edge.target] {
                assert!(added.contains(end.as_str()) || graph.contains(end), "dangling endpoint {end}");
            }
        }
    }

    #[tokio::test]
    async fn test_contradicting_claims_form_a_cluster() {
        let mut b = builder();
        let (sa, sb) = (source("src-a"), source("src-b"));
        let ca = claim("c1", "src-a", "Coffee consumption raises heart disease risk.", &["Coffee"]);
        let cb = claim("c2", "src-b", "Coffee consumption never raises heart disease risk.", &["coffee"]);

        let d1 = b.add_claim(&ca, &sa);
        // source, claim, entity; FROM, ABOUT
        assert_eq!(d1.added_nodes.len(), 3);
        assert_eq!(d1.added_edges.len(), 2);
        assert_self_consistent(b.graph(), &d1);

        let d2 = b.add_claim(&cb, &sb);
        // The entity node already exists.
        assert_eq!(d2.added_nodes.len(), 2);
        assert_eq!(b.graph().node("entity:coffee").unwrap().weight, 14.0);

        let d3 = b.relate_claims(&[ca.clone(), cb.clone()]).await;
        assert_eq!(d3.added_nodes.len(), 0);
        assert_eq!(d3.added_edges.len(), 1);
        let edge = &d3.added_edges[0];
        assert_eq!(edge.relation, Relation::Contradicts);
        assert!(edge.confidence > 0.9);

        let clusters = b.graph().contradiction_clusters(0.7);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].claim_ids, vec!["c1".to_string(), "c2".to_string()]);
        assert!(b.graph().has_contradiction_above(0.7));

        let stats = b.graph().statistics();
        assert_eq!(stats.claim_nodes, 2);
        assert_eq!(stats.source_nodes, 2);
        assert_eq!(stats.contradicts_edges, 1);
        assert_eq!(stats.connected_components, 1);
    }

    #[tokio::test]
    async fn test_same_stance_supports_and_no_shared_entity_is_ignored() {
        let mut b = builder();
        let s = source("src-a");
        let c1 = claim("c1", "src-a", "Green tea lowers blood pressure in adults.", &["green tea"]);
        let c2 = claim("c2", "src-a", "Green tea lowers blood pressure in older adults.", &["Green  Tea"]);
        let c3 = claim("c3", "src-a", "Green tea lowers blood pressure in adults.", &["hypertension"]);
        for c in [&c1, &c2, &c3] {
            b.add_claim(c, &s);
        }
        let delta = b.relate_claims(&[c1, c2, c3]).await;
        assert_eq!(delta.added_edges.len(), 1);
        assert_eq!(delta.added_edges[0].relation, Relation::Supports);
        assert!(b.graph().contradiction_clusters(0.0).is_empty());
    }

    #[tokio::test]
    async fn test_refuted_claims_take_no_part() {
        let mut b = builder();
        let (sa, sb) = (source("src-a"), source("src-b"));
        let ca = claim("c1", "src-a", "Coffee consumption raises heart disease risk.", &["coffee"]);
        let mut cb = claim("c2", "src-b", "Coffee consumption never raises heart disease risk.", &["coffee"]);
        cb.refuted = true;
        b.add_claim(&ca, &sa);
        b.add_claim(&cb, &sb);
        assert!(b.relate_claims(&[ca, cb]).await.is_empty());
    }

    #[tokio::test]
    async fn test_add_claim_is_idempotent_and_context() {
        let mut b = builder();
        let s = source("src-a");
        let c = claim("c1", "src-a", &"word ".repeat(40), &["x"]);
        b.add_claim(&c, &s);
        assert!(b.add_claim(&c, &s).is_empty());

        let node = b.graph().node("claim:c1").unwrap();
        assert!(node.label.ends_with("..."));
        assert_eq!(node.label.chars().count(), LABEL_CHARS + 3);

        let context = b.graph().claim_context("c1").unwrap();
        assert_eq!(context.sources.len(), 1);
        assert_eq!(context.entities.len(), 1);
        assert!(b.graph().claim_context("nope").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let mut b = builder();
        let c = claim("c1", "src-a", "Coffee has caffeine.", &["coffee"]);
        b.add_claim(&c, &source("src-a"));
        let snapshot = b.graph().snapshot();
        let rebuilt = KnowledgeGraph::from_snapshot(&snapshot);
        assert_eq!(rebuilt.snapshot(), snapshot);
        assert_eq!(rebuilt.statistics(), b.graph().statistics());
    }
}
