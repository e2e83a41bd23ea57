//! Resumable stream client.
//!
//! [`ObserverClient`] drives a [`RunState`] from an [`EventSource`],
//! reconnecting with a resume cursor whenever the source drops before a
//! terminal event.  The reducer's idempotence makes overlap on resume
//! harmless; the client's job is the connection lifecycle.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{debug, info, warn};

use tiller_core::Event;

use crate::codec;
use crate::error::{ObserverError, Result};
use crate::reducer::RunState;

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// A (re)connectable stream of run events.
///
/// After `connect(since)` the source must yield only events with
/// `seq > since`.  `next` returning `Ok(None)` means the stream closed.
#[async_trait]
pub trait EventSource: Send {
    async fn connect(&mut self, since: u64) -> Result<()>;
    async fn next(&mut self) -> Result<Option<Event>>;
}

/// Replays a recorded stream from memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    events: Vec<Event>,
    cursor: usize,
}

impl MemorySource {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events, cursor: 0 }
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn connect(&mut self, since: u64) -> Result<()> {
        self.cursor = self.events.iter().position(|e| e.seq > since).unwrap_or(self.events.len());
        debug!(since, cursor = self.cursor, "memory source positioned");
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<Event>> {
        let event = self.events.get(self.cursor).cloned();
        if event.is_some() {
            self.cursor += 1;
        }
        Ok(event)
    }
}

/// Reads NDJSON events from any async buffered reader.
///
/// The reader is forward-only, so `connect` moves the filter cursor
/// rather than seeking: events at or below it are dropped on read.
pub struct ReaderSource<R> {
    lines: Lines<R>,
    since: u64,
}

impl<R: AsyncBufRead + Unpin + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            since: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EventSource for ReaderSource<R> {
    async fn connect(&mut self, since: u64) -> Result<()> {
        self.since = since;
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<Event>> {
        while let Some(line) = self.lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match codec::decode_line(trimmed) {
                Ok(event) if event.seq > self.since => return Ok(Some(event)),
                Ok(_) => continue,
                Err(err) => {
                    warn!(error = %err, "skipping undecodable event line");
                }
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Connection lifecycle of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Disconnected,
}

/// Delay between reconnect attempts.  Fixed by default; injected so
/// tests run without waiting.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
        }
    }
}

/// Folds a source into a [`RunState`], resuming across disconnects.
pub struct ObserverClient<S> {
    source: S,
    state: RunState,
    connection: ConnectionState,
    backoff: Backoff,
    /// `None` retries forever while the run is non-terminal.
    max_reconnects: Option<u32>,
}

impl<S: EventSource> ObserverClient<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: RunState::new(),
            connection: ConnectionState::Disconnected,
            backoff: Backoff::default(),
            max_reconnects: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_reconnect_limit(mut self, limit: u32) -> Self {
        self.max_reconnects = Some(limit);
        self
    }

    /// Resume an existing snapshot instead of starting empty.
    pub fn with_state(mut self, state: RunState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Drive the fold until a terminal event.  Consumes the client and
    /// releases the source on return; once terminal, the client never
    /// reconnects.
    pub async fn run_to_end(mut self) -> Result<RunState> {
        self.source.connect(self.state.last_seq).await?;
        self.connection = ConnectionState::Connected;
        let mut reconnects: u32 = 0;

        loop {
            match self.source.next().await {
                Ok(Some(event)) => {
                    self.state.apply(&event);
                    if self.state.is_terminal() {
                        self.connection = ConnectionState::Disconnected;
                        info!(last_seq = self.state.last_seq, "run reached terminal state");
                        return Ok(self.state);
                    }
                }
                outcome => {
                    if let Err(err) = outcome {
                        warn!(error = %err, "event source failed mid-stream");
                    }
                    if self.max_reconnects.is_some_and(|limit| reconnects >= limit) {
                        self.connection = ConnectionState::Disconnected;
                        return Err(ObserverError::StreamClosed);
                    }
                    reconnects += 1;
                    self.connection = ConnectionState::Reconnecting;
                    debug!(
                        attempt = reconnects,
                        since = self.state.last_seq,
                        "reconnecting with resume cursor"
                    );
                    tokio::time::sleep(self.backoff.delay).await;
                    self.source.connect(self.state.last_seq).await?;
                    self.connection = ConnectionState::Connected;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tiller_core::{Actor, EventKind, EventLevel, PolicySummary, RiskTolerance};
    use uuid::Uuid;

    fn event(seq: u64, kind: EventKind) -> Event {
        Event {
            id: Uuid::now_v7(),
            seq,
            ts: Utc::now(),
            run_id: Uuid::nil(),
            trace_id: Uuid::nil(),
            span_id: None,
            parent_span_id: None,
            actor: Actor::orchestrator(),
            level: EventLevel::Info,
            candidate_id: None,
            message: "test".to_string(),
            kind,
        }
    }

    fn summary() -> PolicySummary {
        PolicySummary {
            risk_tolerance: RiskTolerance::Moderate,
            max_volatility_pct: None,
            max_drawdown_pct: None,
            esg: false,
            themes: Vec::new(),
            target_return_pct: None,
        }
    }

    fn tiny_run() -> Vec<Event> {
        vec![
            event(1, EventKind::RunStarted { policy_summary: summary() }),
            event(
                2,
                EventKind::RunCompleted {
                    decision_count: 0,
                    event_count: 2,
                },
            ),
        ]
    }

    #[tokio::test]
    async fn memory_source_resumes_strictly_after_cursor() {
        let mut source = MemorySource::new(tiny_run());
        source.connect(1).await.unwrap();
        let next = source.next().await.unwrap().unwrap();
        assert_eq!(next.seq, 2);
    }

    #[tokio::test]
    async fn client_stops_at_terminal_event() {
        let client = ObserverClient::new(MemorySource::new(tiny_run()))
            .with_backoff(Backoff { delay: Duration::ZERO });
        let state = client.run_to_end().await.unwrap();
        assert!(state.is_terminal());
        assert_eq!(state.last_seq, 2);
    }

    #[tokio::test]
    async fn truncated_stream_exhausts_reconnect_limit() {
        let truncated = vec![event(1, EventKind::RunStarted { policy_summary: summary() })];
        let client = ObserverClient::new(MemorySource::new(truncated))
            .with_backoff(Backoff { delay: Duration::ZERO })
            .with_reconnect_limit(2);
        let err = client.run_to_end().await.unwrap_err();
        assert!(matches!(err, ObserverError::StreamClosed));
    }

    #[tokio::test]
    async fn reader_source_decodes_ndjson() {
        let events = tiny_run();
        let mut buffer = Vec::new();
        codec::write_stream(&mut buffer, &events).unwrap();
        let reader = tokio::io::BufReader::new(buffer.as_slice());
        let client = ObserverClient::new(ReaderSource::new(reader));
        let state = client.run_to_end().await.unwrap();
        assert!(state.is_terminal());
    }
}
