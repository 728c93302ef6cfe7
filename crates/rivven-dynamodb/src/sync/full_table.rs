//! Bulk scan driver
//!
//! Pages through a table with `Scan`, emitting every item as a `RECORD`
//! stamped with the table version. The scan cursor is written to state after
//! every page, so an interrupted run resumes at the page it was on and keeps
//! its version.
//!
//! A projection is evaluated by the store only. Scanned items already carry
//! the projected shape (selected list elements come back compacted), so they
//! are decoded as they are.

use super::{next_version, SyncContext};
use crate::catalog::TableStream;
use crate::client::ScanRequest;
use crate::codec;
use crate::error::Result;
use crate::message::SyncMessage;
use crate::retry::retry;
use crate::state::State;
use std::time::Instant;
use tracing::{debug, info};

/// Scan `table` to the end and return the number of records emitted
pub async fn sync_full_table(ctx: &SyncContext, table: &TableStream, state: &mut State) -> Result<u64> {
    let stream_id = table.tap_stream_id.as_str();
    let projection = table.parsed_projection()?;

    let checkpoint = state.checkpoint_mut(stream_id);
    let first_run = checkpoint.version.is_none();
    let resuming = checkpoint.last_evaluated_key.is_some();

    let version = match checkpoint.version {
        Some(version) if resuming => version,
        prior => next_version(prior),
    };
    checkpoint.version = Some(version);
    let mut cursor = checkpoint.last_evaluated_key.clone();
    ctx.emit_state(state).await?;

    if first_run {
        ctx.emit(SyncMessage::activate_version(stream_id, version)).await?;
    }

    if resuming {
        info!(table = %stream_id, version, "Resuming interrupted scan");
    } else {
        info!(table = %stream_id, version, "Starting table scan");
    }

    let (projection_expression, expression_attribute_names) = match &projection {
        Some(p) => (Some(p.expression().to_string()), p.attribute_names().cloned()),
        None => (None, None),
    };

    let started = Instant::now();
    let mut rows: u64 = 0;
    let mut pages: u64 = 0;

    loop {
        let request = ScanRequest {
            table_name: table.table_name.clone(),
            limit: ctx.settings.scan_page_size,
            projection_expression: projection_expression.clone(),
            expression_attribute_names: expression_attribute_names.clone(),
            exclusive_start_key: cursor.clone(),
        };

        debug!(
            table = %stream_id,
            page_size = request.limit,
            projected = request.projection_expression.is_some(),
            resumed = request.exclusive_start_key.is_some(),
            "Requesting scan page"
        );
        let page = retry(&ctx.settings.retry, "scan", || ctx.tables.scan(request.clone())).await?;
        pages += 1;

        for item in &page.items {
            let record = codec::decode_item(item)?;
            ctx.emit(SyncMessage::record(stream_id, record, version)).await?;
            rows += 1;
        }

        debug!(table = %stream_id, page = pages, items = page.items.len(), rows, "Scanned page");

        match page.last_evaluated_key {
            Some(key) => {
                state.checkpoint_mut(stream_id).last_evaluated_key = Some(key.clone());
                ctx.emit_state(state).await?;
                cursor = Some(key);
            }
            None => break,
        }
    }

    let checkpoint = state.checkpoint_mut(stream_id);
    checkpoint.last_evaluated_key = None;
    checkpoint.initial_full_table_complete = Some(true);

    ctx.emit(SyncMessage::activate_version(stream_id, version)).await?;
    ctx.emit_state(state).await?;

    info!(
        table = %stream_id,
        rows,
        pages,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Table scan complete"
    );
    Ok(rows)
}
