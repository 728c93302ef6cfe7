//! Request/response contract of the table store and its change log
//!
//! Client construction (credentials, role assumption, endpoints, timeouts) is
//! the host's job. The sync engine only talks to these traits, so any SDK can
//! sit behind them.

use crate::error::Result;
use crate::types::Item;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Paged scan request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanRequest {
    pub table_name: String,
    pub limit: u32,
    pub projection_expression: Option<String>,
    pub expression_attribute_names: Option<BTreeMap<String, String>>,
    pub exclusive_start_key: Option<Item>,
}

/// One page of a scan
#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    pub items: Vec<Item>,
    /// Cursor of the next page, absent on the last page
    pub last_evaluated_key: Option<Item>,
}

/// Role of a key attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Partition key
    Hash,
    /// Sort key
    Range,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchemaElement {
    pub attribute_name: String,
    pub key_type: KeyType,
}

/// Table metadata
#[derive(Debug, Clone, Default)]
pub struct TableDescription {
    pub table_name: String,
    pub key_schema: Vec<KeySchemaElement>,
    pub item_count: u64,
    /// Identifier of the enabled change stream, if any
    pub latest_stream_arn: Option<String>,
}

impl TableDescription {
    /// Key attribute names, partition key first
    pub fn key_names(&self) -> Vec<String> {
        let mut keys: Vec<&KeySchemaElement> = self.key_schema.iter().collect();
        keys.sort_by_key(|k| k.key_type != KeyType::Hash);
        keys.into_iter().map(|k| k.attribute_name.clone()).collect()
    }
}

/// Store read API
#[async_trait]
pub trait TableClient: Send + Sync {
    async fn scan(&self, request: ScanRequest) -> Result<ScanOutput>;

    async fn describe_table(&self, table_name: &str) -> Result<TableDescription>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceNumberRange {
    pub starting_sequence_number: Option<String>,
    /// Present once the shard is closed
    pub ending_sequence_number: Option<String>,
}

/// A node of the change log's shard tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub shard_id: String,
    pub parent_shard_id: Option<String>,
    pub sequence_number_range: SequenceNumberRange,
}

impl Shard {
    /// A closed shard has a finite record set
    pub fn is_closed(&self) -> bool {
        self.sequence_number_range.ending_sequence_number.is_some()
    }
}

/// One page of the shard listing
#[derive(Debug, Clone, Default)]
pub struct StreamDescription {
    pub shards: Vec<Shard>,
    /// Continuation token of the listing
    pub last_evaluated_shard_id: Option<String>,
}

/// Where a shard iterator starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardIteratorType {
    /// Oldest record still in the shard
    TrimHorizon,
    /// Right after a given sequence number
    AfterSequenceNumber,
}

impl fmt::Display for ShardIteratorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TrimHorizon => "TRIM_HORIZON",
            Self::AfterSequenceNumber => "AFTER_SEQUENCE_NUMBER",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardIteratorRequest {
    pub stream_arn: String,
    pub shard_id: String,
    pub iterator_type: ShardIteratorType,
    pub sequence_number: Option<String>,
}

/// Kind of change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    Insert,
    Modify,
    Remove,
}

/// One change record
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub event_name: EventName,
    pub keys: Item,
    pub new_image: Option<Item>,
    pub old_image: Option<Item>,
    pub approximate_creation_date_time: DateTime<Utc>,
    pub sequence_number: String,
}

/// One batch of change records
#[derive(Debug, Clone, Default)]
pub struct GetRecordsOutput {
    pub records: Vec<StreamRecord>,
    /// Absent once a closed shard is exhausted
    pub next_shard_iterator: Option<String>,
}

/// Change-log read API
#[async_trait]
pub trait StreamsClient: Send + Sync {
    async fn describe_stream(
        &self,
        stream_arn: &str,
        exclusive_start_shard_id: Option<&str>,
    ) -> Result<StreamDescription>;

    async fn get_shard_iterator(&self, request: ShardIteratorRequest) -> Result<String>;

    async fn get_records(&self, shard_iterator: &str, limit: u32) -> Result<GetRecordsOutput>;
}
