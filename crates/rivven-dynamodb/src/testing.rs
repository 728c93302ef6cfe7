//! Testing utilities
//!
//! In-memory stand-ins for the table store, its change log and the message
//! sink, so the sync drivers can be exercised without a live service.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_dynamodb::testing::*;
//!
//! let dynamo = Arc::new(MockDynamo::new());
//! dynamo.create_table("users", &["id"]);
//! dynamo.enable_stream("users");
//! dynamo.put_item("users", item(json!({"id": 1, "name": "a"})));
//!
//! let sink = Arc::new(MemorySink::new());
//! let ctx = SyncContext::new(dynamo.clone(), dynamo.clone(), sink.clone());
//! ```

use crate::client::{
    EventName, GetRecordsOutput, KeySchemaElement, KeyType, ScanOutput, ScanRequest,
    SequenceNumberRange, Shard, ShardIteratorRequest, ShardIteratorType, StreamDescription,
    StreamRecord, StreamsClient, TableClient, TableDescription,
};
use crate::codec;
use crate::error::{DynamoError, Result};
use crate::message::{MessageSink, SyncMessage};
use crate::projection::{Path, Projection, Segment};
use crate::state::State;
use crate::types::{AttributeValue, Item};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Build an item from a JSON object
pub fn item(value: Value) -> Item {
    codec::encode_item(&value)
}

// ============================================================================
// Mock store
// ============================================================================

/// Error to inject into a mock call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Timeout,
    Connection,
    Throttled,
    AccessDenied,
}

impl Fault {
    fn to_error(self, operation: &str, table: &str) -> DynamoError {
        match self {
            Self::Timeout => DynamoError::timeout(format!("{operation} timed out")),
            Self::Connection => DynamoError::connection(format!("{operation}: connection reset")),
            Self::Throttled => DynamoError::Throttled(format!("{operation}: rate exceeded")),
            Self::AccessDenied => DynamoError::AccessDenied {
                table: table.to_string(),
                message: format!("{operation} not authorized"),
            },
        }
    }
}

/// Request observed by [`MockDynamo`]
#[derive(Debug, Clone, PartialEq)]
pub enum MockRequest {
    Scan(ScanRequest),
    DescribeTable(String),
    DescribeStream {
        stream_arn: String,
        exclusive_start_shard_id: Option<String>,
    },
    GetShardIterator(ShardIteratorRequest),
    GetRecords { shard_id: String, limit: u32 },
}

#[derive(Debug)]
struct FaultPlan {
    operation: &'static str,
    skip: u32,
    remaining: u32,
    fault: Fault,
}

#[derive(Debug)]
struct MockShard {
    shard_id: String,
    parent_shard_id: Option<String>,
    starting_sequence_number: String,
    ending_sequence_number: Option<String>,
    records: Vec<StreamRecord>,
    expired: bool,
}

impl MockShard {
    fn describe(&self) -> Shard {
        Shard {
            shard_id: self.shard_id.clone(),
            parent_shard_id: self.parent_shard_id.clone(),
            sequence_number_range: SequenceNumberRange {
                starting_sequence_number: Some(self.starting_sequence_number.clone()),
                ending_sequence_number: self.ending_sequence_number.clone(),
            },
        }
    }
}

#[derive(Debug)]
struct MockStream {
    arn: String,
    shards: Vec<MockShard>,
    new_images: bool,
}

#[derive(Debug)]
struct MockTable {
    key_names: Vec<String>,
    items: Vec<Item>,
    stream: Option<MockStream>,
}

impl MockTable {
    fn key_of(&self, item: &Item) -> Item {
        self.key_names
            .iter()
            .filter_map(|k| item.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    fn position(&self, key: &Item) -> Option<usize> {
        self.items.iter().position(|i| &self.key_of(i) == key)
    }
}

#[derive(Debug)]
struct Cursor {
    table: String,
    shard_id: String,
    position: usize,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, MockTable>,
    faults: Vec<FaultPlan>,
    requests: Vec<MockRequest>,
    iterators: HashMap<String, Cursor>,
    next_iterator: u64,
    next_sequence: u64,
    next_shard: u64,
    clock: Option<DateTime<Utc>>,
    describe_page_size: Option<usize>,
    reverse_listing: bool,
}

impl Inner {
    fn check_fault(&mut self, operation: &str, table: &str) -> Result<()> {
        let Some(plan) = self
            .faults
            .iter_mut()
            .find(|p| p.operation == operation && p.remaining > 0)
        else {
            return Ok(());
        };
        if plan.skip > 0 {
            plan.skip -= 1;
            return Ok(());
        }
        plan.remaining -= 1;
        Err(plan.fault.to_error(operation, table))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MockTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DynamoError::NotFound(format!("table '{name}'")))
    }

    fn table_of_arn(&self, arn: &str) -> Result<&str> {
        self.tables
            .iter()
            .find(|(_, t)| t.stream.as_ref().is_some_and(|s| s.arn == arn))
            .map(|(name, _)| name.as_str())
            .ok_or_else(|| DynamoError::NotFound(format!("stream '{arn}'")))
    }

    fn sequence_number(&mut self) -> String {
        self.next_sequence += 1;
        format!("{:021}", self.next_sequence * 100)
    }

    fn shard_id(&mut self) -> String {
        self.next_shard += 1;
        format!("shardId-{:08}", self.next_shard)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    fn new_open_shard(&mut self, parent: Option<String>) -> MockShard {
        MockShard {
            shard_id: self.shard_id(),
            parent_shard_id: parent,
            starting_sequence_number: self.sequence_number(),
            ending_sequence_number: None,
            records: Vec::new(),
            expired: false,
        }
    }

    fn append_change(&mut self, table: &str, event_name: EventName, keys: Item, new_image: Option<Item>, old_image: Option<Item>) {
        let sequence_number = self.sequence_number();
        let at = self.now();
        let Some(stream) = self.tables.get_mut(table).and_then(|t| t.stream.as_mut()) else {
            return;
        };
        let new_image = if stream.new_images { new_image } else { None };
        let Some(shard) = stream
            .shards
            .iter_mut()
            .find(|s| s.ending_sequence_number.is_none())
        else {
            return;
        };
        shard.records.push(StreamRecord {
            event_name,
            keys,
            new_image,
            old_image,
            approximate_creation_date_time: at,
            sequence_number,
        });
    }

    fn new_iterator(&mut self, cursor: Cursor) -> String {
        self.next_iterator += 1;
        let handle = format!("iterator-{}", self.next_iterator);
        self.iterators.insert(handle.clone(), cursor);
        handle
    }
}

/// In-memory table store and change log.
///
/// Items are scanned in insertion order. Every write is appended to the
/// table's open shard when a stream is enabled. Shards only close through
/// [`MockDynamo::rotate_shard`].
#[derive(Debug, Default)]
pub struct MockDynamo {
    inner: Mutex<Inner>,
}

impl MockDynamo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table; the first key is the partition key, the second
    /// (if any) the sort key
    pub fn create_table(&self, name: &str, key_names: &[&str]) {
        self.inner.lock().tables.insert(
            name.to_string(),
            MockTable {
                key_names: key_names.iter().map(|k| k.to_string()).collect(),
                items: Vec::new(),
                stream: None,
            },
        );
    }

    /// Enable a change stream with new images and return its identifier
    pub fn enable_stream(&self, table: &str) -> String {
        let mut inner = self.inner.lock();
        let shard = inner.new_open_shard(None);
        let arn = format!("arn:aws:dynamodb:us-east-1:123456789012:table/{table}/stream/1");
        if let Some(t) = inner.tables.get_mut(table) {
            t.stream = Some(MockStream {
                arn: arn.clone(),
                shards: vec![shard],
                new_images: true,
            });
        }
        arn
    }

    /// Switch the stream to a keys-only view
    pub fn disable_new_images(&self, table: &str) {
        if let Some(stream) = self.inner.lock().tables.get_mut(table).and_then(|t| t.stream.as_mut()) {
            stream.new_images = false;
        }
    }

    /// Insert or replace an item
    pub fn put_item(&self, table: &str, item: Item) {
        let mut inner = self.inner.lock();
        let Ok(t) = inner.table_mut(table) else {
            return;
        };
        let key = t.key_of(&item);
        let (event, old) = match t.position(&key) {
            Some(pos) => (EventName::Modify, Some(std::mem::replace(&mut t.items[pos], item.clone()))),
            None => {
                t.items.push(item.clone());
                (EventName::Insert, None)
            }
        };
        inner.append_change(table, event, key, Some(item), old);
    }

    /// Insert items without recording changes
    pub fn load_items(&self, table: &str, items: impl IntoIterator<Item = Item>) {
        if let Ok(t) = self.inner.lock().table_mut(table) {
            t.items.extend(items);
        }
    }

    /// Delete the item with `key`
    pub fn delete_item(&self, table: &str, key: Item) {
        let mut inner = self.inner.lock();
        let Ok(t) = inner.table_mut(table) else {
            return;
        };
        if let Some(pos) = t.position(&key) {
            let old = t.items.remove(pos);
            inner.append_change(table, EventName::Remove, key, None, Some(old));
        }
    }

    /// Close the open shard and open a child of it. Returns the closed id.
    pub fn rotate_shard(&self, table: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let ending = inner.sequence_number();
        let stream = inner.tables.get_mut(table)?.stream.as_mut()?;
        let open = stream
            .shards
            .iter_mut()
            .find(|s| s.ending_sequence_number.is_none())?;
        open.ending_sequence_number = Some(
            open.records
                .last()
                .map(|r| r.sequence_number.clone())
                .unwrap_or(ending),
        );
        let closed = open.shard_id.clone();

        let child = inner.new_open_shard(Some(closed.clone()));
        inner.tables.get_mut(table)?.stream.as_mut()?.shards.push(child);
        Some(closed)
    }

    /// Drop a shard from the listing, as the log does after retention
    pub fn expire_shard(&self, table: &str, shard_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.tables.get_mut(table).and_then(|t| t.stream.as_mut()) {
            for shard in stream.shards.iter_mut().filter(|s| s.shard_id == shard_id) {
                shard.expired = true;
            }
        }
    }

    /// Current shard ids in creation order
    pub fn shard_ids(&self, table: &str) -> Vec<String> {
        self.inner
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.stream.as_ref())
            .map(|s| s.shards.iter().filter(|s| !s.expired).map(|s| s.shard_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Id of the open shard
    pub fn open_shard(&self, table: &str) -> Option<String> {
        self.inner
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.stream.as_ref())
            .and_then(|s| s.shards.iter().find(|s| s.ending_sequence_number.is_none()))
            .map(|s| s.shard_id.clone())
    }

    /// Sequence numbers of the records in a shard
    pub fn shard_sequence_numbers(&self, table: &str, shard_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.stream.as_ref())
            .and_then(|s| s.shards.iter().find(|s| s.shard_id == shard_id))
            .map(|s| s.records.iter().map(|r| r.sequence_number.clone()).collect())
            .unwrap_or_default()
    }

    /// Stamp change records with a fixed time instead of now
    pub fn set_clock(&self, at: DateTime<Utc>) {
        self.inner.lock().clock = Some(at);
    }

    /// Page the shard listing
    pub fn set_describe_page_size(&self, size: usize) {
        self.inner.lock().describe_page_size = Some(size.max(1));
    }

    /// List shards newest first
    pub fn reverse_shard_listing(&self) {
        self.inner.lock().reverse_listing = true;
    }

    /// Fail the next `count` calls of `operation`
    pub fn fail_next(&self, operation: &'static str, count: u32, fault: Fault) {
        self.fail_after(operation, 0, count, fault);
    }

    /// Let `skip` calls of `operation` succeed, then fail the next `count`
    pub fn fail_after(&self, operation: &'static str, skip: u32, count: u32, fault: Fault) {
        self.inner.lock().faults.push(FaultPlan {
            operation,
            skip,
            remaining: count,
            fault,
        });
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.inner.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.inner.lock().requests.clear();
    }

    pub fn scan_requests(&self) -> Vec<ScanRequest> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                MockRequest::Scan(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    /// Shards an iterator was requested for, in request order
    pub fn shards_read(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                MockRequest::GetShardIterator(req) => Some(req.shard_id),
                _ => None,
            })
            .collect()
    }
}

fn scan_projection(
    expression: &str,
    names: Option<&BTreeMap<String, String>>,
) -> Result<Projection> {
    let names = names.map(serde_json::to_string).transpose()?;
    Projection::parse(expression, names.as_deref())
}

/// Projected part of an item, with list elements keyed by their source index
enum Picked {
    Value(AttributeValue),
    Map(BTreeMap<String, Picked>),
    List(BTreeMap<usize, Picked>),
}

impl Picked {
    fn into_value(self) -> AttributeValue {
        match self {
            Self::Value(value) => value,
            Self::Map(fields) => AttributeValue::M(
                fields
                    .into_iter()
                    .map(|(name, picked)| (name, picked.into_value()))
                    .collect(),
            ),
            Self::List(elements) => {
                AttributeValue::L(elements.into_values().map(Picked::into_value).collect())
            }
        }
    }
}

/// Reduce an item the way the store answers a projected scan: paths that do
/// not resolve are left out, and the selected elements of a list come back
/// compacted in index order.
fn store_project(item: &Item, paths: &[Path]) -> Item {
    let mut picked = BTreeMap::new();
    for path in paths {
        if let Some(leaf) = resolve(item, path) {
            pick(&mut picked, path, leaf.clone());
        }
    }
    picked
        .into_iter()
        .map(|(name, picked)| (name, picked.into_value()))
        .collect()
}

fn resolve<'a>(item: &'a Item, path: &[Segment]) -> Option<&'a AttributeValue> {
    let (first, rest) = path.split_first()?;
    let mut value = step(item, first)?;
    for segment in rest {
        let AttributeValue::M(fields) = value else {
            return None;
        };
        value = step(fields, segment)?;
    }
    Some(value)
}

fn step<'a>(fields: &'a HashMap<String, AttributeValue>, segment: &Segment) -> Option<&'a AttributeValue> {
    let value = fields.get(&segment.name)?;
    match (segment.index, value) {
        (None, value) => Some(value),
        (Some(index), AttributeValue::L(list)) => list.get(index),
        (Some(_), _) => None,
    }
}

fn pick(out: &mut BTreeMap<String, Picked>, path: &[Segment], leaf: AttributeValue) {
    let Some((segment, rest)) = path.split_first() else {
        return;
    };
    let slot = out.entry(segment.name.clone()).or_insert_with(|| match segment.index {
        Some(_) => Picked::List(BTreeMap::new()),
        None => Picked::Map(BTreeMap::new()),
    });
    let slot = match (segment.index, slot) {
        (None, slot) => slot,
        (Some(index), Picked::List(elements)) => elements
            .entry(index)
            .or_insert_with(|| Picked::Map(BTreeMap::new())),
        (Some(_), _) => return,
    };
    if rest.is_empty() {
        *slot = Picked::Value(leaf);
    } else if let Picked::Map(nested) = slot {
        pick(nested, rest, leaf);
    }
}

#[async_trait]
impl TableClient for MockDynamo {
    async fn scan(&self, request: ScanRequest) -> Result<ScanOutput> {
        let mut inner = self.inner.lock();
        inner.requests.push(MockRequest::Scan(request.clone()));
        inner.check_fault("scan", &request.table_name)?;

        let table = inner.table_mut(&request.table_name)?;
        let start = match &request.exclusive_start_key {
            Some(key) => table
                .position(key)
                .map(|p| p + 1)
                .ok_or_else(|| DynamoError::malformed("exclusive start key matches no item"))?,
            None => 0,
        };
        let limit = (request.limit.max(1)) as usize;
        let end = (start + limit).min(table.items.len());
        let page = &table.items[start.min(end)..end];

        let last_evaluated_key = if end < table.items.len() {
            page.last().map(|i| table.key_of(i))
        } else {
            None
        };

        let items = match &request.projection_expression {
            Some(expression) => {
                let projection = scan_projection(expression, request.expression_attribute_names.as_ref())?;
                page.iter().map(|i| store_project(i, projection.paths())).collect()
            }
            None => page.to_vec(),
        };

        Ok(ScanOutput {
            items,
            last_evaluated_key,
        })
    }

    async fn describe_table(&self, table_name: &str) -> Result<TableDescription> {
        let mut inner = self.inner.lock();
        inner.requests.push(MockRequest::DescribeTable(table_name.to_string()));
        inner.check_fault("describe_table", table_name)?;

        let table = inner.table_mut(table_name)?;
        let key_schema = table
            .key_names
            .iter()
            .enumerate()
            .map(|(i, name)| KeySchemaElement {
                attribute_name: name.clone(),
                key_type: if i == 0 { KeyType::Hash } else { KeyType::Range },
            })
            .collect();

        Ok(TableDescription {
            table_name: table_name.to_string(),
            key_schema,
            item_count: table.items.len() as u64,
            latest_stream_arn: table.stream.as_ref().map(|s| s.arn.clone()),
        })
    }
}

#[async_trait]
impl StreamsClient for MockDynamo {
    async fn describe_stream(
        &self,
        stream_arn: &str,
        exclusive_start_shard_id: Option<&str>,
    ) -> Result<StreamDescription> {
        let mut inner = self.inner.lock();
        inner.requests.push(MockRequest::DescribeStream {
            stream_arn: stream_arn.to_string(),
            exclusive_start_shard_id: exclusive_start_shard_id.map(str::to_string),
        });
        let table_name = inner.table_of_arn(stream_arn)?.to_string();
        inner.check_fault("describe_stream", &table_name)?;

        let mut listing: Vec<Shard> = inner
            .tables
            .get(&table_name)
            .and_then(|t| t.stream.as_ref())
            .map(|s| s.shards.iter().filter(|s| !s.expired).map(MockShard::describe).collect())
            .unwrap_or_default();
        if inner.reverse_listing {
            listing.reverse();
        }

        let start = match exclusive_start_shard_id {
            Some(id) => listing
                .iter()
                .position(|s| s.shard_id == id)
                .map(|p| p + 1)
                .unwrap_or(listing.len()),
            None => 0,
        };
        let page_size = inner.describe_page_size.unwrap_or(usize::MAX);
        let end = start.saturating_add(page_size).min(listing.len());
        let shards: Vec<Shard> = listing[start..end].to_vec();
        let last_evaluated_shard_id = if end < listing.len() {
            shards.last().map(|s| s.shard_id.clone())
        } else {
            None
        };

        Ok(StreamDescription {
            shards,
            last_evaluated_shard_id,
        })
    }

    async fn get_shard_iterator(&self, request: ShardIteratorRequest) -> Result<String> {
        let mut inner = self.inner.lock();
        inner.requests.push(MockRequest::GetShardIterator(request.clone()));
        let table_name = inner.table_of_arn(&request.stream_arn)?.to_string();
        inner.check_fault("get_shard_iterator", &table_name)?;

        let shard = inner
            .tables
            .get(&table_name)
            .and_then(|t| t.stream.as_ref())
            .and_then(|s| s.shards.iter().find(|s| s.shard_id == request.shard_id && !s.expired))
            .ok_or_else(|| DynamoError::NotFound(format!("shard '{}'", request.shard_id)))?;

        let position = match (request.iterator_type, &request.sequence_number) {
            (ShardIteratorType::TrimHorizon, _) => 0,
            (ShardIteratorType::AfterSequenceNumber, Some(after)) => shard
                .records
                .iter()
                .position(|r| r.sequence_number.as_str() > after.as_str())
                .unwrap_or(shard.records.len()),
            (ShardIteratorType::AfterSequenceNumber, None) => {
                return Err(DynamoError::malformed(
                    "AFTER_SEQUENCE_NUMBER requires a sequence number",
                ))
            }
        };

        Ok(inner.new_iterator(Cursor {
            table: table_name,
            shard_id: request.shard_id,
            position,
        }))
    }

    async fn get_records(&self, shard_iterator: &str, limit: u32) -> Result<GetRecordsOutput> {
        let mut inner = self.inner.lock();
        let cursor = inner
            .iterators
            .remove(shard_iterator)
            .ok_or_else(|| DynamoError::NotFound(format!("iterator '{shard_iterator}'")))?;
        inner.requests.push(MockRequest::GetRecords {
            shard_id: cursor.shard_id.clone(),
            limit,
        });
        if let Err(e) = inner.check_fault("get_records", &cursor.table) {
            // the handle stays valid for a retry
            inner.iterators.insert(shard_iterator.to_string(), cursor);
            return Err(e);
        }

        let shard = inner
            .tables
            .get(&cursor.table)
            .and_then(|t| t.stream.as_ref())
            .and_then(|s| s.shards.iter().find(|s| s.shard_id == cursor.shard_id))
            .ok_or_else(|| DynamoError::NotFound(format!("shard '{}'", cursor.shard_id)))?;

        let end = (cursor.position + limit.max(1) as usize).min(shard.records.len());
        let records = shard.records[cursor.position.min(end)..end].to_vec();
        let exhausted = end >= shard.records.len() && shard.ending_sequence_number.is_some();

        let next_shard_iterator = if exhausted {
            None
        } else {
            Some(inner.new_iterator(Cursor {
                position: end,
                ..cursor
            }))
        };

        Ok(GetRecordsOutput {
            records,
            next_shard_iterator,
        })
    }
}

// ============================================================================
// Memory sink
// ============================================================================

/// Sink keeping every message in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<SyncMessage>>>,
    fail_after: Mutex<Option<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `count` more messages, then reject everything
    pub fn fail_after(&self, count: usize) {
        *self.fail_after.lock() = Some(count);
    }

    pub fn messages(&self) -> Vec<SyncMessage> {
        self.messages.lock().clone()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    /// Message type names in emission order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.messages
            .lock()
            .iter()
            .map(|m| match m {
                SyncMessage::Schema { .. } => "SCHEMA",
                SyncMessage::Record { .. } => "RECORD",
                SyncMessage::ActivateVersion { .. } => "ACTIVATE_VERSION",
                SyncMessage::State { .. } => "STATE",
            })
            .collect()
    }

    /// Record payloads of `stream`
    pub fn records(&self, stream: &str) -> Vec<Value> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                SyncMessage::Record { stream: s, record, .. } if s == stream => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    /// Versions stamped on the records of `stream`
    pub fn record_versions(&self, stream: &str) -> Vec<i64> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                SyncMessage::Record { stream: s, version, .. } if s == stream => Some(*version),
                _ => None,
            })
            .collect()
    }

    pub fn activate_versions(&self, stream: &str) -> Vec<i64> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                SyncMessage::ActivateVersion { stream: s, version } if s == stream => Some(*version),
                _ => None,
            })
            .collect()
    }

    /// Every emitted state document, in order
    pub fn states(&self) -> Vec<State> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                SyncMessage::State { value } => State::from_value(value.clone()).ok(),
                _ => None,
            })
            .collect()
    }

    /// The state a host would have persisted last
    pub fn last_state(&self) -> Option<State> {
        self.states().pop()
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn write(&self, message: SyncMessage) -> Result<()> {
        {
            let mut fail_after = self.fail_after.lock();
            if let Some(remaining) = fail_after.as_mut() {
                if *remaining == 0 {
                    return Err(DynamoError::sink("sink closed"));
                }
                *remaining -= 1;
            }
        }
        self.messages.lock().push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scan_pages_with_cursor() {
        let dynamo = MockDynamo::new();
        dynamo.create_table("t", &["id"]);
        dynamo.load_items("t", (0..5).map(|i| item(json!({"id": i}))));

        let first = dynamo
            .scan(ScanRequest {
                table_name: "t".to_string(),
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let key = first.last_evaluated_key.unwrap();
        assert_eq!(key, item(json!({"id": 1})));

        let rest = dynamo
            .scan(ScanRequest {
                table_name: "t".to_string(),
                limit: 10,
                exclusive_start_key: Some(key),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 3);
        assert!(rest.last_evaluated_key.is_none());
    }

    #[tokio::test]
    async fn test_projected_scan_compacts_list_elements() {
        let dynamo = MockDynamo::new();
        dynamo.create_table("t", &["id"]);
        dynamo.load_items(
            "t",
            [item(json!({
                "id": 1,
                "tests": [10, 11, 12, 13],
                "map_field": {"list_entry": [1, 2, 3], "other": true}
            }))],
        );

        let page = dynamo
            .scan(ScanRequest {
                table_name: "t".to_string(),
                limit: 10,
                projection_expression: Some(
                    "tests[1], tests[3], map_field.list_entry[2], not_here, map_field.gone[0]".to_string(),
                ),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            codec::decode_item(&page.items[0]).unwrap(),
            json!({"tests": [11, 13], "map_field": {"list_entry": [3]}})
        );
    }

    #[tokio::test]
    async fn test_changes_land_in_open_shard() {
        let dynamo = MockDynamo::new();
        dynamo.create_table("t", &["id"]);
        dynamo.enable_stream("t");
        dynamo.put_item("t", item(json!({"id": 1})));
        dynamo.put_item("t", item(json!({"id": 1, "v": 2})));
        dynamo.delete_item("t", item(json!({"id": 1})));

        let open = dynamo.open_shard("t").unwrap();
        assert_eq!(dynamo.shard_sequence_numbers("t", &open).len(), 3);

        let closed = dynamo.rotate_shard("t").unwrap();
        assert_eq!(closed, open);
        assert_eq!(dynamo.shard_ids("t").len(), 2);
        assert_ne!(dynamo.open_shard("t").unwrap(), closed);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let dynamo = MockDynamo::new();
        dynamo.create_table("t", &["id"]);
        dynamo.fail_after("describe_table", 1, 1, Fault::Timeout);

        assert!(dynamo.describe_table("t").await.is_ok());
        assert!(dynamo.describe_table("t").await.unwrap_err().is_retryable());
        assert!(dynamo.describe_table("t").await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_sink_failure() {
        let sink = MemorySink::new();
        sink.fail_after(1);
        sink.write(SyncMessage::activate_version("t", 1)).await.unwrap();
        assert!(sink.write(SyncMessage::activate_version("t", 2)).await.is_err());
        assert_eq!(sink.activate_versions("t"), vec![1]);
    }
}
