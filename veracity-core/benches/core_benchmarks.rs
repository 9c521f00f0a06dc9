use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;
use veracity_core::config::VeracityConfig;
use veracity_core::embeddings::{Embedder, LocalEmbedder};
use veracity_core::research::agents::AgentRole;
use veracity_core::research::credibility::{CredibilityScorer, DomainCredibilityCache};
use veracity_core::research::curator::Curator;
use veracity_core::research::graph::GraphBuilder;
use veracity_core::research::sources::{Claim, RawSource, Source, Stance, VerificationMethod};

const TOPICS: &[&str] = &[
    "solar panel efficiency",
    "battery storage costs",
    "wind turbine output",
    "grid frequency regulation",
    "hydrogen electrolysis",
];

const HOSTS: &[&str] = &["energy.example.edu", "grid.example.gov", "blog.example.com", "news.example.org"];

fn raw_sources(count: usize) -> Vec<RawSource> {
    (0..count)
        .map(|i| {
            let topic = TOPICS[i % TOPICS.len()];
            let host = HOSTS[i % HOSTS.len()];
            let text = format!(
                "Report {i} on {topic}. Measurements from site {i} show {topic} improving by {} percent \
                 over the previous year. Methodology: field sensors sampled hourly across {} installations, \
                 with results compared against regional baselines and published references.",
                i % 17 + 3,
                i * 7 + 11
            );
            RawSource::new(format!("https://{host}/articles/{i}"), format!("{topic} #{i}"), text, topic)
        })
        .collect()
}

fn claims_for(sources: &[Source]) -> Vec<Claim> {
    sources
        .iter()
        .flat_map(|source| {
            let topic = source.sub_query.clone();
            [(Stance::Positive, "improves"), (Stance::Negative, "never improves")]
                .into_iter()
                .map(move |(stance, verb)| {
                    let text = format!("{topic} {verb} year over year");
                    Claim {
                        id: Claim::id_for(&source.id, &text),
                        source_id: source.id.clone(),
                        keywords: veracity_core::text::keywords(&text),
                        text,
                        confidence: 0.8,
                        entities: vec![topic.clone()],
                        stance,
                        agent: AgentRole::Scout,
                        verified: true,
                        verification_method: VerificationMethod::Exact,
                        verification_confidence: 1.0,
                        excerpt: None,
                        refuted: false,
                    }
                })
        })
        .collect()
}

fn bench_curation(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let config = VeracityConfig::default();
    let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::default());
    let curator = Curator::new(
        config.curation.clone(),
        CredibilityScorer::new(config.credibility.clone(), Arc::new(DomainCredibilityCache::new())),
        Arc::clone(&embedder),
    );
    let raw = raw_sources(60);

    c.bench_function("curate_60_sources", |b| {
        b.iter(|| {
            rt.block_on(curator.curate(black_box(raw.clone()), "renewable energy trends", 30))
                .expect("curation")
        })
    });
}

fn bench_graph_building(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let config = VeracityConfig::default();
    let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::default());
    let curator = Curator::new(
        config.curation.clone(),
        CredibilityScorer::new(config.credibility.clone(), Arc::new(DomainCredibilityCache::new())),
        Arc::clone(&embedder),
    );
    let sources = rt
        .block_on(curator.curate(raw_sources(30), "renewable energy trends", 30))
        .expect("curation")
        .sources;
    let claims = claims_for(&sources);

    c.bench_function("graph_build_and_relate", |b| {
        b.iter(|| {
            let mut builder = GraphBuilder::new(config.graph.clone(), Arc::clone(&embedder));
            for claim in &claims {
                if let Some(source) = sources.iter().find(|s| s.id == claim.source_id) {
                    builder.add_claim(claim, source);
                }
            }
            rt.block_on(builder.relate_claims(black_box(&claims)));
            builder.graph().statistics()
        })
    });

    let mut builder = GraphBuilder::new(config.graph.clone(), Arc::clone(&embedder));
    for claim in &claims {
        if let Some(source) = sources.iter().find(|s| s.id == claim.source_id) {
            builder.add_claim(claim, source);
        }
    }
    rt.block_on(builder.relate_claims(&claims));
    let graph = builder.into_graph();
    c.bench_function("graph_contradiction_clusters", |b| {
        b.iter(|| graph.contradiction_clusters(black_box(0.7)))
    });
}

criterion_group!(benches, bench_curation, bench_graph_building);
criterion_main!(benches);
