//! Checkpoint state
//!
//! The state document is owned by the host: it hands the last persisted
//! document in at start and stores every `STATE` message that comes out.
//! Each table owns one [`TableCheckpoint`] under `bookmarks.<stream id>`.

use crate::catalog::ReplicationMethod;
use crate::error::Result;
use crate::types::Item;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Minutes after the last successful sync during which stream checkpoints
/// stay usable.
///
/// Records stay in the change log for 24 hours and shards close about every
/// 4 hours, so anything older than this may already have been trimmed.
pub const STREAM_RETENTION_MINUTES: i64 = 19 * 60 + 30;

/// Full state document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currently_syncing: Option<String>,

    #[serde(default)]
    pub bookmarks: BTreeMap<String, TableCheckpoint>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn checkpoint(&self, stream: &str) -> Option<&TableCheckpoint> {
        self.bookmarks.get(stream)
    }

    /// Checkpoint of `stream`, created empty on first use
    pub fn checkpoint_mut(&mut self, stream: &str) -> &mut TableCheckpoint {
        self.bookmarks.entry(stream.to_string()).or_default()
    }
}

/// Per-table checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableCheckpoint {
    /// Version stamped on records of the current full load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,

    /// Cursor of the next scan page; present only while a scan is interrupted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluated_key: Option<Item>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_full_table_complete: Option<bool>,

    /// Last consumed sequence number per shard being read
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shard_seq_numbers: BTreeMap<String, String>,

    /// Closed shards that were read to the end
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub finished_shards: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_replication_method: Option<ReplicationMethod>,
}

impl TableCheckpoint {
    pub fn is_initial_load_complete(&self) -> bool {
        self.initial_full_table_complete.unwrap_or(false)
    }

    /// Drop everything except the replication method marker
    pub fn reset(&mut self) {
        let method = self.last_replication_method.take();
        *self = Self {
            last_replication_method: method,
            ..Self::default()
        };
    }

    /// Drop change-stream progress and force a new initial load
    pub fn reset_stream(&mut self) {
        self.shard_seq_numbers.clear();
        self.finished_shards.clear();
        self.initial_full_table_complete = None;
        self.last_evaluated_key = None;
    }

    /// Record the last consumed sequence number of an unfinished shard
    pub fn record_sequence(&mut self, shard_id: &str, sequence_number: &str) {
        self.shard_seq_numbers
            .insert(shard_id.to_string(), sequence_number.to_string());
    }

    /// Move a fully drained shard into the finished set
    pub fn finish_shard(&mut self, shard_id: &str) {
        self.shard_seq_numbers.remove(shard_id);
        self.finished_shards.insert(shard_id.to_string());
    }

    pub fn is_finished(&self, shard_id: &str) -> bool {
        self.finished_shards.contains(shard_id)
    }

    /// Forget finished shards the change log no longer reports.
    /// Returns the pruned ids.
    pub fn prune_finished(&mut self, seen: &BTreeSet<String>) -> Vec<String> {
        let expired: Vec<String> = self.finished_shards.difference(seen).cloned().collect();
        for shard_id in &expired {
            self.finished_shards.remove(shard_id);
        }
        expired
    }

    /// Whether the last success is too old to trust stream checkpoints
    pub fn has_stream_aged_out(&self, now: DateTime<Utc>) -> bool {
        match self.success_timestamp {
            Some(last) => now - last > ChronoDuration::minutes(STREAM_RETENTION_MINUTES),
            None => false,
        }
    }
}
