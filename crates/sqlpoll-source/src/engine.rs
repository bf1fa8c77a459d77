//! # Polling engine
//!
//! Drives one source through repeated cycles:
//!
//! ```text
//! Idle -> Polling -> Converting -> Emitting -> Advancing -> Sleeping -> Polling ...
//! ```
//!
//! A cycle builds the statement from the current watermark, fetches at most
//! `maxRows` rows, converts them, emits them in batches of `batchSize`, moves
//! the watermark to the last row's incrementing-column value and persists it.
//! The watermark only moves after every batch has been accepted, so a failed
//! cycle re-reads the same rows on the next poll.

use sqlpoll_rdbc::connection::Connection;
use sqlpoll_rdbc::types::Row;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::SourceConfig;
use crate::convert::{RawRow, RowConverter};
use crate::emit::RecordEmitter;
use crate::error::Result;
use crate::query::QueryBuilder;
use crate::watermark::{Watermark, WatermarkStore};

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Between cycles, or not yet started
    Idle,
    /// Executing the poll statement
    Polling,
    /// Turning rows into records
    Converting,
    /// Handing batches downstream
    Emitting,
    /// Moving and persisting the watermark
    Advancing,
    /// Waiting for the next poll
    Sleeping,
    /// Stopped on an unrecoverable error
    Failed,
    /// Stopped by the host
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Polling => write!(f, "polling"),
            Self::Converting => write!(f, "converting"),
            Self::Emitting => write!(f, "emitting"),
            Self::Advancing => write!(f, "advancing"),
            Self::Sleeping => write!(f, "sleeping"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// What a single successful cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Rows returned by the query
    pub rows: usize,
    /// Batches accepted downstream
    pub batches: usize,
    /// Records accepted downstream
    pub records: usize,
    /// Watermark the statement was built from
    pub watermark_before: Watermark,
    /// Watermark after the cycle
    pub watermark_after: Watermark,
}

impl CycleOutcome {
    /// Whether the watermark moved
    pub fn advanced(&self) -> bool {
        self.watermark_before != self.watermark_after
    }
}

/// Engine statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Completed cycles
    pub cycles: u64,
    /// Completed cycles that returned no rows
    pub empty_cycles: u64,
    /// Rows fetched across all completed cycles
    pub rows_polled: u64,
    /// Records accepted downstream
    pub records_emitted: u64,
    /// Cycles aborted by an error
    pub failed_cycles: u64,
}

/// Lock-free counters behind [`EngineStats`]
#[derive(Debug, Default)]
pub struct AtomicEngineStats {
    cycles: AtomicU64,
    empty_cycles: AtomicU64,
    rows_polled: AtomicU64,
    records_emitted: AtomicU64,
    failed_cycles: AtomicU64,
}

impl AtomicEngineStats {
    /// Record a completed cycle
    pub fn record_cycle(&self, rows: u64, records: u64) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.rows_polled.fetch_add(rows, Ordering::Relaxed);
        self.records_emitted.fetch_add(records, Ordering::Relaxed);
        if rows == 0 {
            self.empty_cycles.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an aborted cycle
    pub fn record_failure(&self) {
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            empty_cycles: self.empty_cycles.load(Ordering::Relaxed),
            rows_polled: self.rows_polled.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
        }
    }
}

/// Single-worker polling loop for one source
pub struct PollingEngine {
    config: Arc<SourceConfig>,
    query: QueryBuilder,
    store: WatermarkStore,
    connection: Box<dyn Connection>,
    emitter: Arc<dyn RecordEmitter>,
    state: EngineState,
    stats: Arc<AtomicEngineStats>,
}

impl PollingEngine {
    /// Create an engine over an opened store and an acquired connection
    pub fn new(
        config: Arc<SourceConfig>,
        store: WatermarkStore,
        connection: Box<dyn Connection>,
        emitter: Arc<dyn RecordEmitter>,
    ) -> Self {
        Self {
            query: QueryBuilder::new(config.query_template.as_str()),
            config,
            store,
            connection,
            emitter,
            state: EngineState::Idle,
            stats: Arc::new(AtomicEngineStats::default()),
        }
    }

    /// Current state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Statistics snapshot
    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    /// In-memory watermark
    pub fn watermark(&self) -> &Watermark {
        self.store.current_value()
    }

    /// The backing watermark store
    pub fn store(&self) -> &WatermarkStore {
        &self.store
    }

    fn source_name(&self) -> &str {
        self.store.source_name()
    }

    /// Run exactly one cycle.
    ///
    /// Query and emission failures leave the watermark untouched. They are
    /// recoverable unless the execution layer reports a configuration error.
    /// A persist failure keeps the advanced in-memory value and returns a
    /// storage error.
    pub async fn poll_once(&mut self) -> Result<CycleOutcome> {
        match self.cycle().await {
            Ok(outcome) => {
                self.state = EngineState::Idle;
                Ok(outcome)
            }
            Err(e) => {
                self.stats.record_failure();
                self.state = if e.is_recoverable() {
                    EngineState::Idle
                } else {
                    EngineState::Failed
                };
                Err(e)
            }
        }
    }

    async fn cycle(&mut self) -> Result<CycleOutcome> {
        let watermark_before = self.store.current_value().clone();

        self.state = EngineState::Polling;
        let sql = self.query.build(&watermark_before);
        debug!(source = %self.source_name(), sql = %sql, "Executing poll");

        let rows = self
            .connection
            .query_limited(&sql, self.config.max_rows)
            .await?;
        let row_count = rows.len();
        debug!(source = %self.source_name(), rows = row_count, "Poll returned rows");

        self.state = EngineState::Converting;
        let next = self.next_watermark(&rows);
        let raw: Vec<RawRow> = rows
            .into_iter()
            .map(|row| RawRow::from_row(row, self.config.output_format))
            .collect();
        let records = RowConverter::convert(&raw);

        self.state = EngineState::Emitting;
        let mut batches = 0;
        for batch in records.chunks(self.config.batch_size.max(1)) {
            self.emitter.emit(batch).await?;
            batches += 1;
        }

        self.state = EngineState::Advancing;
        if let Some(next) = next {
            self.store.advance(next);
        }
        self.store.persist().await?;

        self.stats
            .record_cycle(row_count as u64, records.len() as u64);

        let outcome = CycleOutcome {
            rows: row_count,
            batches,
            records: records.len(),
            watermark_before,
            watermark_after: self.store.current_value().clone(),
        };
        debug!(
            source = %self.source_name(),
            rows = outcome.rows,
            batches = outcome.batches,
            watermark = %outcome.watermark_after,
            "Cycle complete"
        );
        Ok(outcome)
    }

    /// Value of the incrementing column in the last row that has one
    fn next_watermark(&self, rows: &[Row]) -> Option<Watermark> {
        let column = self.config.incremental_column.as_deref();
        let next = rows.iter().rev().find_map(|row| {
            let value = match column {
                Some(name) => row.get_by_name(name),
                None => row.get(0),
            }?;
            value.to_text().map(Watermark::from)
        });

        if next.is_none() && !rows.is_empty() {
            warn!(
                source = %self.source_name(),
                column = column.unwrap_or("<first column>"),
                "No non-null incrementing value in result, watermark unchanged"
            );
        }
        next
    }

    /// Poll until `shutdown` fires.
    ///
    /// Recoverable cycle errors are logged and retried after the poll delay.
    /// Storage and configuration errors end the loop and are returned. A shutdown signal
    /// interrupts the sleep; an in-flight cycle always completes first.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(
            source = %self.source_name(),
            watermark = %self.watermark(),
            poll_delay_ms = self.config.poll_delay.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_rows = self.config.max_rows,
            "Starting polling engine"
        );

        loop {
            match self.poll_once().await {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!(
                        source = %self.source_name(),
                        watermark = %self.watermark(),
                        error = %e,
                        "Poll cycle failed, retrying after delay"
                    );
                }
                Err(e) if e.is_recoverable() => {
                    error!(
                        source = %self.source_name(),
                        watermark = %self.watermark(),
                        error = %e,
                        "Poll cycle failed and will keep failing until the statement or data changes"
                    );
                }
                Err(e) => {
                    error!(source = %self.source_name(), error = %e, "Polling engine failed");
                    self.state = EngineState::Failed;
                    return Err(e);
                }
            }

            self.state = EngineState::Sleeping;
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(source = %self.source_name(), "Shutdown signal received");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_delay) => {}
            }
        }

        self.state = EngineState::Stopped;
        Ok(())
    }

    /// Flush an unpersisted watermark and close the connection.
    ///
    /// The connection is released even when the flush fails. A failed engine
    /// stays failed.
    pub async fn close(&mut self) -> Result<()> {
        let flushed = if self.store.is_dirty() {
            self.store.persist().await
        } else {
            Ok(())
        };
        if let Err(e) = self.connection.close().await {
            warn!(source = %self.source_name(), error = %e, "Error closing connection");
        }
        if let Err(e) = flushed {
            self.state = EngineState::Failed;
            return Err(e);
        }

        if self.state != EngineState::Failed {
            self.state = EngineState::Stopped;
        }
        info!(
            source = %self.source_name(),
            watermark = %self.watermark(),
            "Polling engine stopped"
        );
        Ok(())
    }
}

impl fmt::Debug for PollingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingEngine")
            .field("source", &self.source_name())
            .field("state", &self.state)
            .field("watermark", self.watermark())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_stats() {
        let stats = AtomicEngineStats::default();

        stats.record_cycle(100, 100);
        stats.record_cycle(0, 0);
        stats.record_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cycles, 2);
        assert_eq!(snapshot.empty_cycles, 1);
        assert_eq!(snapshot.rows_polled, 100);
        assert_eq!(snapshot.records_emitted, 100);
        assert_eq!(snapshot.failed_cycles, 1);
    }

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Sleeping.to_string(), "sleeping");
        assert_eq!(EngineState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_cycle_outcome_advanced() {
        let outcome = CycleOutcome {
            rows: 0,
            batches: 0,
            records: 0,
            watermark_before: Watermark::new("1"),
            watermark_after: Watermark::new("1"),
        };
        assert!(!outcome.advanced());
    }
}
