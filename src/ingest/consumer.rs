//! Per-source WebSocket consumer
//!
//! One long-lived task per knot/spindle: connect at the stored cursor,
//! apply frames in receipt order, persist progress, and reconnect under
//! capped exponential backoff with jitter. A poisoned event is retried a
//! bounded number of times, then dead-lettered; whether the cursor advances
//! past it is a configuration decision.

use crate::config::IngestConfig;
use crate::error::{AppError, AppResult};
use crate::index::{cursors, Index};
use crate::ingest::events::{decode, Event, EventEnvelope};
use crate::ingest::{apply, subscription_url, EventSource};
use crate::metrics;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            current: min,
            min,
            max,
        }
    }

    /// Next delay, doubling up to the cap, with up to 50% jitter on top.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = if base.as_millis() > 0 {
            rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 2))
        } else {
            0
        };
        base + Duration::from_millis(jitter_ms)
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

pub(crate) async fn run_source(
    index: Index,
    cfg: IngestConfig,
    source: EventSource,
    allow_insecure: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(
        Duration::from_millis(cfg.backoff_min_ms),
        Duration::from_secs(cfg.backoff_max_secs),
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let cursor = match cursors::get(index.pool(), &source.host).await {
            Ok(Some(state)) => state.cursor,
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(host = %source.host, error = %e, "cursor load failed");
                0
            }
        };

        let url = subscription_url(&source, cursor, allow_insecure);
        tracing::debug!(host = %source.host, cursor, "connecting event feed");
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                metrics::record_ingest_connect(&source.host);
                backoff.reset();
                match consume(&index, &cfg, &source, cursor, stream, &mut shutdown).await {
                    Ok(()) => {}
                    Err(e) => {
                        tracing::warn!(host = %source.host, error = %e, "event feed dropped");
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(host = %source.host, error = %e, "event feed connect failed");
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!(host = %source.host, "event consumer drained");
}

async fn consume(
    index: &Index,
    cfg: &IngestConfig,
    source: &EventSource,
    mut cursor: i64,
    mut stream: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> AppResult<()> {
    let read_deadline = Duration::from_secs(cfg.keepalive_secs.max(1) * 3);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = stream.close(None).await;
                    return Ok(());
                }
            }
            next = tokio::time::timeout(read_deadline, stream.next()) => {
                let message = match next {
                    Err(_) => {
                        return Err(AppError::RemoteTransport(format!(
                            "{}: read deadline exceeded", source.host
                        )));
                    }
                    Ok(None) => {
                        return Err(AppError::RemoteTransport(format!(
                            "{}: connection closed", source.host
                        )));
                    }
                    Ok(Some(Err(e))) => {
                        return Err(AppError::RemoteTransport(format!("{}: {e}", source.host)));
                    }
                    Ok(Some(Ok(message))) => message,
                };

                match message {
                    Message::Text(text) => {
                        handle_frame(index, cfg, source, &mut cursor, text.as_str()).await?;
                    }
                    Message::Binary(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).to_string();
                        handle_frame(index, cfg, source, &mut cursor, &text).await?;
                    }
                    Message::Ping(payload) => {
                        let _ = stream.send(Message::Pong(payload)).await;
                    }
                    Message::Close(_) => {
                        return Err(AppError::RemoteTransport(format!(
                            "{}: server closed the feed", source.host
                        )));
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn handle_frame(
    index: &Index,
    cfg: &IngestConfig,
    source: &EventSource,
    cursor: &mut i64,
    frame: &str,
) -> AppResult<()> {
    let envelope: EventEnvelope = match serde_json::from_str(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(host = %source.host, error = %e, "undecodable event frame");
            return Ok(());
        }
    };

    // Replays under the stored cursor are already applied.
    if envelope.seq <= *cursor {
        tracing::debug!(host = %source.host, seq = envelope.seq, "skipping replayed event");
        return Ok(());
    }

    let event = match decode(&envelope) {
        Ok(event) => event,
        Err(e) => {
            // Structurally bad payload: no retry will fix it.
            dead_letter_and_advance(index, cfg, source, cursor, &envelope, &e.to_string()).await?;
            return Ok(());
        }
    };

    let mut attempt: u32 = 0;
    loop {
        match apply::apply_event(index, source, &event).await {
            Ok(()) => {
                apply::advance_cursor(index, &source.host, envelope.seq).await?;
                *cursor = envelope.seq;
                metrics::record_ingest_event(&envelope.kind, true);
                return Ok(());
            }
            Err(e) if attempt + 1 < cfg.max_event_attempts => {
                attempt += 1;
                tracing::warn!(
                    host = %source.host,
                    seq = envelope.seq,
                    attempt,
                    error = %e,
                    "event application failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            Err(e) => {
                metrics::record_ingest_event(&envelope.kind, false);
                dead_letter_and_advance(index, cfg, source, cursor, &envelope, &e.to_string())
                    .await?;
                return Ok(());
            }
        }
    }
}

/// Exhausted events land in the dead-letter table. By default the cursor
/// advances so one poisoned event cannot wedge the source; the halt mode
/// surfaces the stall instead.
async fn dead_letter_and_advance(
    index: &Index,
    cfg: &IngestConfig,
    source: &EventSource,
    cursor: &mut i64,
    envelope: &EventEnvelope,
    error: &str,
) -> AppResult<()> {
    cursors::dead_letter(
        index.pool(),
        &source.host,
        envelope.seq,
        &envelope.kind,
        &envelope.payload.to_string(),
        error,
    )
    .await?;
    tracing::error!(
        host = %source.host,
        seq = envelope.seq,
        kind = %envelope.kind,
        error,
        "event dead-lettered"
    );
    if cfg.halt_on_dead_letter {
        return Err(AppError::Internal(format!(
            "{}: halted on dead-lettered event {}",
            source.host, envelope.seq
        )));
    }
    apply::advance_cursor(index, &source.host, envelope.seq).await?;
    *cursor = envelope.seq;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200) && second < Duration::from_millis(400));
        for _ in 0..10 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped <= Duration::from_millis(1500));
        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_millis(200));
    }
}
