//! Outbound messages and the sink they are written to
//!
//! Messages follow the Singer layout, one JSON object per line:
//! `SCHEMA`, `RECORD`, `ACTIVATE_VERSION` and `STATE`.

use crate::catalog::TableStream;
use crate::error::Result;
use crate::state::State;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;

/// Attribute added to records synthesized from a removal event
pub const DELETED_AT: &str = "_sdc_deleted_at";

/// Format a removal timestamp for [`DELETED_AT`]
pub fn format_deleted_at(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// One outbound message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMessage {
    Schema {
        stream: String,
        schema: Value,
        key_properties: Vec<String>,
    },
    Record {
        stream: String,
        record: Value,
        version: i64,
        time_extracted: DateTime<Utc>,
    },
    ActivateVersion {
        stream: String,
        version: i64,
    },
    State {
        value: Value,
    },
}

impl SyncMessage {
    pub fn schema(table: &TableStream) -> Self {
        Self::Schema {
            stream: table.tap_stream_id.clone(),
            schema: table.schema.clone(),
            key_properties: table.key_properties.clone(),
        }
    }

    pub fn record(stream: &str, record: Value, version: i64) -> Self {
        Self::Record {
            stream: stream.to_string(),
            record,
            version,
            time_extracted: Utc::now(),
        }
    }

    pub fn activate_version(stream: &str, version: i64) -> Self {
        Self::ActivateVersion {
            stream: stream.to_string(),
            version,
        }
    }

    /// Snapshot of the full state document
    pub fn state(state: &State) -> Result<Self> {
        Ok(Self::State {
            value: state.to_value()?,
        })
    }

    /// Stream the message belongs to (`None` for state)
    pub fn stream(&self) -> Option<&str> {
        match self {
            Self::Schema { stream, .. }
            | Self::Record { stream, .. }
            | Self::ActivateVersion { stream, .. } => Some(stream.as_str()),
            Self::State { .. } => None,
        }
    }
}

/// Destination of outbound messages
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Write one message; a `STATE` message must be durable once this returns
    async fn write(&self, message: SyncMessage) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Sink writing one JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

#[async_trait]
impl<W: Write + Send> MessageSink for JsonLinesSink<W> {
    async fn write(&self, message: SyncMessage) -> Result<()> {
        let line = serde_json::to_string(&message)?;
        let mut out = self.out.lock();
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        if matches!(message, SyncMessage::State { .. }) {
            out.flush()?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.out.lock().flush()?;
        Ok(())
    }
}
