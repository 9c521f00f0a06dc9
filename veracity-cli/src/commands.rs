//! CLI subcommand handlers.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;
use veracity_core::events::ResearchEvent;
use veracity_core::research::ResearchEngine;
use veracity_core::{SessionStore, VeracityConfig};

use crate::Commands;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config: VeracityConfig) -> anyhow::Result<()> {
    match command {
        Commands::Research {
            query,
            mode,
            no_debate,
            json,
            output,
        } => {
            let debate = no_debate.then_some(false);
            let report = run_research(config, &query, mode, debate, json).await?;
            if let Some(path) = output {
                std::fs::write(&path, &report).with_context(|| format!("writing {}", path.display()))?;
                eprintln!("Report written to {}", path.display());
            }
            println!("{report}");
            Ok(())
        }
        Commands::Sessions => {
            let store = open_store(&config)?;
            let sessions = store.list();
            if sessions.is_empty() {
                println!("No sessions.");
                return Ok(());
            }
            for s in sessions {
                println!(
                    "{}  {:<13} {:>3}%  {:>3} src  {:>4} claims  {}  {}",
                    s.id,
                    s.phase,
                    s.progress_percent,
                    s.source_count,
                    s.claim_count,
                    s.created_at.format("%Y-%m-%d %H:%M"),
                    s.query
                );
            }
            let stats = store.stats();
            println!();
            println!(
                "{} sessions ({} unfinished), {} sources, {} claims, {} debate rounds",
                stats.total_sessions,
                stats.active_sessions,
                stats.total_sources,
                stats.total_claims,
                stats.total_debate_rounds
            );
            Ok(())
        }
        Commands::Show { id } => {
            let store = open_store(&config)?;
            let record = store.get(id).with_context(|| format!("Session not found: {id}"))?;
            let session = &record.session;
            println!("Session:   {}", session.id);
            println!("Query:     {}", session.query);
            println!("Mode:      {}", session.mode);
            println!("Phase:     {} ({}%)", session.phase, session.progress_percent);
            println!("Sources:   {}", session.source_count);
            println!("Claims:    {}", session.claim_count);
            println!("Debates:   {} round(s) over {} cluster(s)", session.debate_rounds, record.debates.len());
            if let Some(error) = &session.error {
                println!(
                    "Error:     {} [{}]",
                    error,
                    session.error_cause.as_deref().unwrap_or("unknown")
                );
            }
            if !session.sub_queries.is_empty() {
                println!("Sub-queries:");
                for q in &session.sub_queries {
                    println!("  - {q}");
                }
            }
            println!("Phases:");
            for entry in &session.phase_history {
                println!("  {}  {}", entry.entered_at.format("%H:%M:%S"), entry.phase);
            }
            Ok(())
        }
        Commands::Report { id } => {
            let store = open_store(&config)?;
            let session = store.session(id)?;
            match session.report {
                Some(report) => {
                    println!("{report}");
                    Ok(())
                }
                None => anyhow::bail!("Session {id} has no report (phase: {})", session.phase),
            }
        }
        Commands::Graph { id } => {
            let store = open_store(&config)?;
            let record = store.get(id).with_context(|| format!("Session not found: {id}"))?;
            let body = serde_json::json!({
                "statistics": record.graph_statistics(),
                "nodes": record.graph.nodes,
                "edges": record.graph.edges,
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Commands::Sources { id } => {
            let store = open_store(&config)?;
            for source in store.sources(id)? {
                println!(
                    "[{}] {:.2} {:<10} {}\n      {}",
                    source.id,
                    source.credibility,
                    source.source_type.as_str(),
                    source.title,
                    source.url
                );
            }
            Ok(())
        }
        Commands::Claims { id } => {
            let store = open_store(&config)?;
            for claim in store.claims(id)? {
                let status = if claim.refuted {
                    "refuted"
                } else if claim.verified {
                    claim.verification_method.as_str()
                } else {
                    "unverified"
                };
                println!(
                    "[{}] ({}, {}, {:.2}) {}",
                    claim.id, claim.source_id, status, claim.confidence, claim.text
                );
            }
            Ok(())
        }
        Commands::Delete { id } => {
            let store = open_store(&config)?;
            if store.delete(id)? {
                println!("Deleted session {id}");
                Ok(())
            } else {
                anyhow::bail!("Session not found: {id}")
            }
        }
        Commands::Serve { addr } => {
            let addr = addr.unwrap_or_else(|| config.server.bind.clone());
            let engine = Arc::new(ResearchEngine::from_config(config)?);
            veracity_core::gateway::serve(engine, &addr, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .with_context(|| format!("serving on {addr}"))
        }
    }
}

fn open_store(config: &VeracityConfig) -> anyhow::Result<SessionStore> {
    let dir = config.storage.resolve_data_dir();
    SessionStore::open(&dir).with_context(|| format!("opening session store at {}", dir.display()))
}

/// Run one session, printing progress to stderr. Returns the report.
async fn run_research(
    config: VeracityConfig,
    query: &str,
    mode: veracity_core::ResearchMode,
    debate: Option<bool>,
    json: bool,
) -> anyhow::Result<String> {
    let engine = ResearchEngine::from_config(config)?;
    let mut events = engine.events().subscribe();
    let session = engine.start(query, mode, debate)?;
    let id = session.id;
    eprintln!("Session {id}");

    let mut cancelled = false;
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(envelope) if envelope.session_id == id => {
                    if json {
                        println!("{}", serde_json::to_string(&envelope)?);
                    } else if let Some(line) = describe(&envelope.event) {
                        eprintln!("{line}");
                    }
                    if envelope.event.is_final() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Dropped progress events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                eprintln!("Cancelling...");
                engine.cancel(id);
                cancelled = true;
            }
        }
    }
    engine.wait_idle().await;

    let session = engine.store().session(id)?;
    match session.report {
        Some(report) => Ok(report),
        None => anyhow::bail!(
            "Research failed: {}",
            session.error.unwrap_or_else(|| format!("ended in {}", session.phase))
        ),
    }
}

/// One human-readable progress line per event. Reports are printed separately.
fn describe(event: &ResearchEvent) -> Option<String> {
    match event {
        ResearchEvent::SessionCreated { query, mode } => Some(format!("Researching \"{query}\" ({mode})")),
        ResearchEvent::Status {
            message,
            progress_percent,
            ..
        } => Some(format!("[{progress_percent:>3}%] {message}")),
        ResearchEvent::Source { source } => Some(format!(
            "  + source {} ({:.2}) {}",
            source.domain, source.credibility, source.title
        )),
        ResearchEvent::Claim { claim, agent } => Some(format!("  * {agent}: {}", claim.text)),
        ResearchEvent::Graph {
            added_nodes,
            added_edges,
        } => (!added_edges.is_empty() || added_nodes.len() > 1)
            .then(|| format!("  ~ graph +{} nodes, +{} edges", added_nodes.len(), added_edges.len())),
        ResearchEvent::Debate {
            round,
            agent,
            argument,
            confidence,
            ..
        } => Some(format!("  > round {round} {agent} ({confidence:.2}): {argument}")),
        ResearchEvent::Report { .. } => None,
        ResearchEvent::Error { message, details } => Some(match details {
            Some(cause) => format!("Error [{cause}]: {message}"),
            None => format!("Error: {message}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use veracity_core::ResearchPhase;

    #[test]
    fn test_describe_status_and_error() {
        let status = ResearchEvent::Status {
            phase: ResearchPhase::Curating,
            message: "Curating sources".into(),
            progress_percent: 30,
        };
        assert_eq!(describe(&status).as_deref(), Some("[ 30%] Curating sources"));

        let error = ResearchEvent::Error {
            message: "search failed".into(),
            details: Some("external_provider_unavailable".into()),
        };
        assert_eq!(
            describe(&error).as_deref(),
            Some("Error [external_provider_unavailable]: search failed")
        );
    }

    #[test]
    fn test_report_is_not_echoed_as_progress() {
        let report = ResearchEvent::Report {
            markdown: "# Research Report".into(),
            complete: true,
        };
        assert_eq!(describe(&report), None);
    }
}
