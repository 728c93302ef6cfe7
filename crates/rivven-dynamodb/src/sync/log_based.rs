//! Change-stream driver
//!
//! Reads the table's change log shard by shard. Only closed shards are read:
//! their record set is final, so a read always terminates. Open shards are
//! picked up on a later run, once the log has closed them.
//!
//! Progress lives in two places of the table checkpoint:
//!
//! - `shard_seq_numbers`: last consumed sequence number of a shard being read
//! - `finished_shards`: shards read to the end, never read again
//!
//! Finished shards the log no longer reports are pruned after each run.

use super::{next_version, SyncContext};
use crate::catalog::TableStream;
use crate::client::{EventName, Shard, ShardIteratorRequest, ShardIteratorType, StreamRecord};
use crate::codec;
use crate::error::{DynamoError, Result};
use crate::message::{format_deleted_at, SyncMessage, DELETED_AT};
use crate::projection::Projection;
use crate::retry::retry;
use crate::state::State;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::time::Instant;
use tracing::{debug, info};

/// Replay every unfinished closed shard and return the number of records emitted
pub async fn sync_log_based(ctx: &SyncContext, table: &TableStream, state: &mut State) -> Result<u64> {
    let stream_id = table.tap_stream_id.as_str();
    let projection = table.parsed_projection()?;

    let checkpoint = state.checkpoint_mut(stream_id);
    let version = match checkpoint.version {
        Some(version) => version,
        None => {
            let version = next_version(None);
            checkpoint.version = Some(version);
            version
        }
    };
    ctx.emit(SyncMessage::activate_version(stream_id, version)).await?;

    let stream_arn = latest_stream_arn(ctx, table).await?;
    let shards = list_shards(ctx, &stream_arn).await?;
    let seen: BTreeSet<String> = shards.iter().map(|s| s.shard_id.clone()).collect();

    let started = Instant::now();
    let mut rows: u64 = 0;

    for shard in order_closed_shards(shards) {
        if state.checkpoint_mut(stream_id).is_finished(&shard.shard_id) {
            debug!(table = %stream_id, shard_id = %shard.shard_id, "Skipping finished shard");
            continue;
        }

        rows += sync_shard(ctx, table, &stream_arn, &shard, projection.as_ref(), version, state).await?;

        state.checkpoint_mut(stream_id).finish_shard(&shard.shard_id);
        ctx.emit_state(state).await?;
        debug!(table = %stream_id, shard_id = %shard.shard_id, "Shard finished");
    }

    let expired = state.checkpoint_mut(stream_id).prune_finished(&seen);
    if !expired.is_empty() {
        debug!(table = %stream_id, shards = ?expired, "Pruned expired shards");
    }
    ctx.emit_state(state).await?;

    info!(
        table = %stream_id,
        rows,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Change stream sync complete"
    );
    Ok(rows)
}

/// Prepare stream checkpoints before the bootstrap scan.
///
/// Every shard closed right now only holds changes that the scan will already
/// see, so all of them are marked finished. Shards still open get no bookmark
/// and are read from their start once they close, which replays the changes
/// they took before the scan.
pub async fn initial_bookmarks(ctx: &SyncContext, table: &TableStream, state: &mut State) -> Result<()> {
    let stream_arn = latest_stream_arn(ctx, table).await?;
    let (closed, open): (Vec<Shard>, Vec<Shard>) = list_shards(ctx, &stream_arn)
        .await?
        .into_iter()
        .partition(Shard::is_closed);

    let checkpoint = state.checkpoint_mut(&table.tap_stream_id);
    checkpoint.shard_seq_numbers.clear();
    checkpoint.finished_shards = closed.into_iter().map(|s| s.shard_id).collect();

    debug!(
        table = %table.tap_stream_id,
        finished = checkpoint.finished_shards.len(),
        unbookmarked_open = open.len(),
        "Recorded initial stream bookmarks"
    );
    Ok(())
}

async fn latest_stream_arn(ctx: &SyncContext, table: &TableStream) -> Result<String> {
    let description = retry(&ctx.settings.retry, "describe_table", || {
        ctx.tables.describe_table(&table.table_name)
    })
    .await?;

    description.latest_stream_arn.ok_or_else(|| {
        DynamoError::config(format!(
            "table '{}' has no change stream enabled",
            table.table_name
        ))
    })
}

/// Every shard the log reports, following the listing's continuation token
async fn list_shards(ctx: &SyncContext, stream_arn: &str) -> Result<Vec<Shard>> {
    let mut shards = Vec::new();
    let mut start: Option<String> = None;

    loop {
        let page = retry(&ctx.settings.retry, "describe_stream", || {
            ctx.streams.describe_stream(stream_arn, start.as_deref())
        })
        .await?;
        shards.extend(page.shards);

        match page.last_evaluated_shard_id {
            Some(next) => start = Some(next),
            None => break,
        }
    }

    Ok(shards)
}

/// Closed shards, parents before children.
///
/// Shards whose parent is not among the closed ones are roots. Among shards
/// that are ready at the same time the earlier starting sequence number goes
/// first, then the lower id.
pub fn order_closed_shards(shards: Vec<Shard>) -> Vec<Shard> {
    let closed: HashMap<String, Shard> = shards
        .into_iter()
        .filter(Shard::is_closed)
        .map(|s| (s.shard_id.clone(), s))
        .collect();

    let mut children: HashMap<&str, Vec<&Shard>> = HashMap::new();
    let mut ready = BinaryHeap::new();
    for shard in closed.values() {
        match shard.parent_shard_id.as_deref() {
            Some(parent) if closed.contains_key(parent) => {
                children.entry(parent).or_default().push(shard);
            }
            _ => ready.push(Reverse(ShardKey::of(shard))),
        }
    }

    let mut ordered: Vec<Shard> = Vec::with_capacity(closed.len());
    let mut emitted: BTreeSet<&str> = BTreeSet::new();
    while let Some(Reverse(key)) = ready.pop() {
        let Some(shard) = closed.get(&key.shard_id) else {
            continue;
        };
        emitted.insert(shard.shard_id.as_str());
        for child in children.get(shard.shard_id.as_str()).into_iter().flatten() {
            ready.push(Reverse(ShardKey::of(child)));
        }
        ordered.push(shard.clone());
    }

    // parent links that form a cycle never become ready
    if ordered.len() < closed.len() {
        let mut rest: Vec<&Shard> = closed
            .values()
            .filter(|s| !emitted.contains(s.shard_id.as_str()))
            .collect();
        rest.sort_by_key(|s| ShardKey::of(s));
        ordered.extend(rest.into_iter().cloned());
    }

    ordered
}

/// Sort key of a shard: numeric starting sequence number, then id
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ShardKey {
    seq_len: usize,
    seq: String,
    shard_id: String,
}

impl ShardKey {
    fn of(shard: &Shard) -> Self {
        // sequence numbers are decimal strings of arbitrary length
        let seq = shard
            .sequence_number_range
            .starting_sequence_number
            .as_deref()
            .unwrap_or("")
            .trim_start_matches('0')
            .to_string();
        Self {
            seq_len: seq.len(),
            seq,
            shard_id: shard.shard_id.clone(),
        }
    }
}

async fn sync_shard(
    ctx: &SyncContext,
    table: &TableStream,
    stream_arn: &str,
    shard: &Shard,
    projection: Option<&Projection>,
    version: i64,
    state: &mut State,
) -> Result<u64> {
    let stream_id = table.tap_stream_id.as_str();
    let resume_after = state
        .checkpoint_mut(stream_id)
        .shard_seq_numbers
        .get(&shard.shard_id)
        .cloned();

    let request = ShardIteratorRequest {
        stream_arn: stream_arn.to_string(),
        shard_id: shard.shard_id.clone(),
        iterator_type: if resume_after.is_some() {
            ShardIteratorType::AfterSequenceNumber
        } else {
            ShardIteratorType::TrimHorizon
        },
        sequence_number: resume_after,
    };
    debug!(
        table = %stream_id,
        shard_id = %shard.shard_id,
        iterator_type = %request.iterator_type,
        "Reading shard"
    );

    let mut iterator = Some(
        retry(&ctx.settings.retry, "get_shard_iterator", || {
            ctx.streams.get_shard_iterator(request.clone())
        })
        .await?,
    );

    let flush_interval = ctx.settings.state_flush_interval.max(1);
    let mut rows: u64 = 0;

    while let Some(current) = iterator.take() {
        let batch = retry(&ctx.settings.retry, "get_records", || {
            ctx.streams.get_records(&current, ctx.settings.stream_batch_size)
        })
        .await?;

        for record in &batch.records {
            let payload = record_payload(table, record, projection)?;
            ctx.emit(SyncMessage::record(stream_id, payload, version)).await?;
            rows += 1;

            state
                .checkpoint_mut(stream_id)
                .record_sequence(&shard.shard_id, &record.sequence_number);
            if rows % flush_interval == 0 {
                ctx.emit_state(state).await?;
            }
        }

        iterator = batch.next_shard_iterator;
    }

    debug!(table = %stream_id, shard_id = %shard.shard_id, rows, "Shard drained");
    Ok(rows)
}

/// Record emitted for one change: a deletion marker for removals, otherwise
/// the (projected) new image
fn record_payload(table: &TableStream, record: &StreamRecord, projection: Option<&Projection>) -> Result<Value> {
    if record.event_name == EventName::Remove {
        let mut marker = codec::decode_item(&record.keys)?;
        if let Value::Object(map) = &mut marker {
            map.insert(
                DELETED_AT.to_string(),
                Value::String(format_deleted_at(record.approximate_creation_date_time)),
            );
        }
        return Ok(marker);
    }

    let image = record
        .new_image
        .as_ref()
        .ok_or_else(|| DynamoError::StreamView(table.table_name.clone()))?;
    let decoded = codec::decode_item(image)?;

    Ok(match projection {
        Some(projection) => projection.apply(&decoded),
        None => decoded,
    })
}
