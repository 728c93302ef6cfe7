//! # Table sync
//!
//! Per table, one invocation runs this state machine:
//!
//! ```text
//! SELECT_METHOD ─┬─ FULL_TABLE ───────────────────────────────┬─ DONE
//!                └─ LOG_BASED ─ (bootstrap full scan) ─ stream ┘
//! ```
//!
//! - a replication method change discards the table's checkpoint first
//! - a change-stream checkpoint older than the retention window is dropped and
//!   the table is bootstrapped again with a full scan
//! - a success timestamp is written after every completed table
//!
//! ## Example
//!
//! ```rust,ignore
//! use rivven_dynamodb::prelude::*;
//!
//! let ctx = SyncContext::new(tables, streams, Arc::new(JsonLinesSink::stdout()))
//!     .with_settings(SyncSettings::from(&config));
//! let orchestrator = SyncOrchestrator::new(ctx);
//!
//! let catalog = Catalog::from_file("catalog.json")?;
//! let mut state = State::from_json(&previous_state)?;
//! orchestrator.sync_catalog(&catalog.selected_tables()?, &mut state).await?;
//! ```

pub mod full_table;
pub mod log_based;

use crate::catalog::{ReplicationMethod, TableStream};
use crate::client::{StreamsClient, TableClient};
use crate::config::TapConfig;
use crate::error::Result;
use crate::message::{MessageSink, SyncMessage};
use crate::retry::RetryConfig;
use crate::state::State;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Tunables shared by both drivers
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub retry: RetryConfig,
    /// Items per scan page
    pub scan_page_size: u32,
    /// Records per change-log read
    pub stream_batch_size: u32,
    /// Emit state every this many change records
    pub state_flush_interval: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            scan_page_size: 1000,
            stream_batch_size: 1000,
            state_flush_interval: 100,
        }
    }
}

impl From<&TapConfig> for SyncSettings {
    fn from(config: &TapConfig) -> Self {
        Self {
            retry: RetryConfig::from(&config.retry),
            scan_page_size: config.scan_page_size,
            stream_batch_size: config.stream_batch_size,
            state_flush_interval: config.state_flush_interval.max(1),
        }
    }
}

/// Everything a driver needs: the clients, the sink and the tunables
#[derive(Clone)]
pub struct SyncContext {
    pub tables: Arc<dyn TableClient>,
    pub streams: Arc<dyn StreamsClient>,
    pub sink: Arc<dyn MessageSink>,
    pub settings: SyncSettings,
}

impl SyncContext {
    pub fn new(
        tables: Arc<dyn TableClient>,
        streams: Arc<dyn StreamsClient>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            tables,
            streams,
            sink,
            settings: SyncSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn emit(&self, message: SyncMessage) -> Result<()> {
        self.sink.write(message).await
    }

    /// Emit the full state document
    pub async fn emit_state(&self, state: &State) -> Result<()> {
        self.sink.write(SyncMessage::state(state)?).await
    }
}

/// Pick a table version: the current time in milliseconds, but never a value
/// at or below the previous one
pub fn next_version(prior: Option<i64>) -> i64 {
    let now = Utc::now().timestamp_millis();
    match prior {
        Some(prior) => now.max(prior + 1),
        None => now,
    }
}

/// Runs selected tables one after another
pub struct SyncOrchestrator {
    ctx: SyncContext,
}

impl SyncOrchestrator {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Sync every selected table in order and return the number of records
    /// emitted. Stops at the first failing table.
    pub async fn sync_catalog(&self, tables: &[TableStream], state: &mut State) -> Result<u64> {
        let mut total = 0;
        for table in tables.iter().filter(|t| t.selected) {
            total += self.sync_stream(table, state).await?;
        }

        state.currently_syncing = None;
        self.ctx.emit_state(state).await?;
        self.ctx.sink.flush().await?;

        info!(tables = tables.len(), records = total, "Catalog sync complete");
        Ok(total)
    }

    /// Sync one table. Errors come back wrapped with the table name.
    pub async fn sync_stream(&self, table: &TableStream, state: &mut State) -> Result<u64> {
        let started = Instant::now();
        info!(table = %table.tap_stream_id, "Starting table sync");

        match self.run_stream(table, state).await {
            Ok(records) => {
                info!(
                    table = %table.tap_stream_id,
                    records,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Table sync complete"
                );
                Ok(records)
            }
            Err(e) => {
                error!(table = %table.tap_stream_id, error = %e, "Table sync failed");
                Err(e.in_table(table.tap_stream_id.clone()))
            }
        }
    }

    async fn run_stream(&self, table: &TableStream, state: &mut State) -> Result<u64> {
        let stream_id = table.tap_stream_id.as_str();
        let method = table.method()?;
        // surface projection errors before any request goes out
        table.parsed_projection()?;

        clear_state_on_replication_change(stream_id, method, state);
        state.currently_syncing = Some(stream_id.to_string());
        self.ctx.emit_state(state).await?;
        self.ctx.emit(SyncMessage::schema(table)).await?;

        let records = match method {
            ReplicationMethod::FullTable => {
                info!(table = %stream_id, "Syncing full table");
                full_table::sync_full_table(&self.ctx, table, state).await?
            }
            ReplicationMethod::LogBased => {
                info!(table = %stream_id, "Syncing from change stream");
                self.sync_log_based(table, state).await?
            }
        };

        state.checkpoint_mut(stream_id).success_timestamp = Some(Utc::now());
        self.ctx.emit_state(state).await?;
        Ok(records)
    }

    async fn sync_log_based(&self, table: &TableStream, state: &mut State) -> Result<u64> {
        let stream_id = table.tap_stream_id.as_str();
        let mut records = 0;

        let aged_out = state
            .checkpoint(stream_id)
            .is_some_and(|cp| cp.has_stream_aged_out(Utc::now()));
        if aged_out {
            warn!(
                table = %stream_id,
                "Stream checkpoint has aged out, clearing it and starting over with a full scan"
            );
            state.checkpoint_mut(stream_id).reset_stream();
        }

        let checkpoint = state.checkpoint_mut(stream_id);
        if !checkpoint.is_initial_load_complete() {
            info!(
                table = %stream_id,
                "Must complete full table sync before replicating from the change stream"
            );
            // an interrupted bootstrap keeps the shard set it started with
            if checkpoint.last_evaluated_key.is_none() {
                log_based::initial_bookmarks(&self.ctx, table, state).await?;
                self.ctx.emit_state(state).await?;
            }
            records += full_table::sync_full_table(&self.ctx, table, state).await?;
        }

        records += log_based::sync_log_based(&self.ctx, table, state).await?;
        Ok(records)
    }
}

/// Reset the table's checkpoint when its replication method changed since the
/// last run, then remember the current method
pub fn clear_state_on_replication_change(
    stream_id: &str,
    method: ReplicationMethod,
    state: &mut State,
) {
    let checkpoint = state.checkpoint_mut(stream_id);
    if let Some(last) = checkpoint.last_replication_method {
        if last != method {
            info!(
                table = %stream_id,
                from = %last,
                to = %method,
                "Replication method changed, will re-replicate entire table"
            );
            checkpoint.reset();
        }
    }
    checkpoint.last_replication_method = Some(method);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_version_never_repeats() {
        let far_future = Utc::now().timestamp_millis() + 1_000_000;
        assert_eq!(next_version(Some(far_future)), far_future + 1);

        let now = Utc::now().timestamp_millis();
        assert!(next_version(Some(1)) >= now);
        assert!(next_version(None) >= now);
    }

    #[test]
    fn test_method_change_resets_checkpoint() {
        let mut state = State::new();
        {
            let cp = state.checkpoint_mut("t");
            cp.version = Some(5);
            cp.initial_full_table_complete = Some(true);
            cp.last_replication_method = Some(ReplicationMethod::LogBased);
            cp.finish_shard("s1");
        }

        clear_state_on_replication_change("t", ReplicationMethod::FullTable, &mut state);

        let cp = state.checkpoint("t").unwrap();
        assert_eq!(cp.version, None);
        assert!(cp.finished_shards.is_empty());
        assert_eq!(cp.last_replication_method, Some(ReplicationMethod::FullTable));
    }

    #[test]
    fn test_same_method_keeps_checkpoint() {
        let mut state = State::new();
        state.checkpoint_mut("t").version = Some(5);

        clear_state_on_replication_change("t", ReplicationMethod::FullTable, &mut state);
        clear_state_on_replication_change("t", ReplicationMethod::FullTable, &mut state);

        assert_eq!(state.checkpoint("t").unwrap().version, Some(5));
    }

    #[test]
    fn test_settings_from_config() {
        let config = TapConfig {
            scan_page_size: 10,
            state_flush_interval: 0,
            ..Default::default()
        };
        let settings = SyncSettings::from(&config);
        assert_eq!(settings.scan_page_size, 10);
        assert_eq!(settings.state_flush_interval, 1);
        assert_eq!(settings.retry.max_attempts, 5);
    }
}
