//! Event ingestion
//!
//! Maintains one long-lived WebSocket consumer per knot and spindle that any
//! indexed repo depends on, applying their append-only event logs to the
//! index with per-source cursors. Within a source events apply in receipt
//! order; across sources there is no ordering at all.

pub mod apply;
mod consumer;
pub mod events;

use crate::config::IngestConfig;
use crate::error::{AppError, AppResult};
use crate::index::{cursors, repos, Index};
use crate::services::validate_remote_host;
use dashmap::DashMap;
use std::fmt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Knot,
    Spindle,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Knot => "knot",
            SourceKind::Spindle => "spindle",
        }
    }

    fn from_str(raw: &str) -> SourceKind {
        match raw {
            "spindle" => SourceKind::Spindle,
            _ => SourceKind::Knot,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upstream event feed, keyed by host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSource {
    pub kind: SourceKind,
    pub host: String,
}

/// `ws[s]://<host>/events?cursor=<c>`, query omitted at cursor zero.
pub fn subscription_url(source: &EventSource, cursor: i64, allow_insecure: bool) -> String {
    let scheme = if allow_insecure { "ws" } else { "wss" };
    if cursor == 0 {
        format!("{scheme}://{}/events", source.host)
    } else {
        format!("{scheme}://{}/events?cursor={cursor}", source.host)
    }
}

struct SourceHandle {
    kind: SourceKind,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Ingestor {
    index: Index,
    cfg: IngestConfig,
    allow_insecure: bool,
    sources: DashMap<String, SourceHandle>,
}

impl Ingestor {
    pub fn new(index: Index, cfg: IngestConfig, allow_insecure: bool) -> Self {
        Self {
            index,
            cfg,
            allow_insecure,
            sources: DashMap::new(),
        }
    }

    /// Start consuming a source. Adding a source twice is a no-op.
    pub async fn add_source(&self, source: EventSource) -> AppResult<()> {
        if self.sources.contains_key(&source.host) {
            return Ok(());
        }
        validate_remote_host(&source.host, self.allow_insecure)?;
        cursors::register(self.index.pool(), &source.host, source.kind.as_str()).await?;

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(consumer::run_source(
            self.index.clone(),
            self.cfg.clone(),
            source.clone(),
            self.allow_insecure,
            rx,
        ));
        self.sources.insert(
            source.host.clone(),
            SourceHandle {
                kind: source.kind,
                shutdown,
                task,
            },
        );
        tracing::info!(host = %source.host, kind = %source.kind, "event source added");
        Ok(())
    }

    /// Drain a source: close its connection, await task exit, drop its
    /// cursor state.
    pub async fn remove_source(&self, host: &str) -> AppResult<()> {
        let (_, handle) = self
            .sources
            .remove(host)
            .ok_or_else(|| AppError::NotFound(format!("event source {host}")))?;
        let _ = handle.shutdown.send(true);
        if let Err(e) = handle.task.await {
            tracing::warn!(host, error = %e, "event consumer join failed");
        }
        cursors::remove(self.index.pool(), host).await?;
        tracing::info!(host, "event source removed");
        Ok(())
    }

    /// Spawn consumers for every source the index already knows about:
    /// persisted cursors first, then any knot/spindle a repo references.
    pub async fn run(&self) -> AppResult<()> {
        for stored in cursors::list(self.index.pool()).await? {
            self.add_source(EventSource {
                kind: SourceKind::from_str(&stored.kind),
                host: stored.host,
            })
            .await?;
        }
        for host in repos::distinct_knots(self.index.pool()).await? {
            self.add_source(EventSource {
                kind: SourceKind::Knot,
                host,
            })
            .await?;
        }
        for host in repos::distinct_spindles(self.index.pool()).await? {
            self.add_source(EventSource {
                kind: SourceKind::Spindle,
                host,
            })
            .await?;
        }
        Ok(())
    }

    /// Signal every consumer to drain. Tasks exit on their next wakeup.
    pub fn shutdown(&self) {
        for entry in self.sources.iter() {
            let _ = entry.value().shutdown.send(true);
        }
    }

    pub fn tracked_hosts(&self) -> Vec<(String, SourceKind)> {
        self.sources
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().kind))
            .collect()
    }
}
