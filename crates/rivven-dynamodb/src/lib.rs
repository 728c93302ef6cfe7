//! # rivven-dynamodb - DynamoDB source for Rivven
//!
//! Replicates DynamoDB tables as an ordered stream of Singer-style messages,
//! either by scanning the whole table every run (`FULL_TABLE`) or by one
//! bootstrap scan followed by change capture from the table's stream
//! (`LOG_BASED`).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      ┌───────────────┐
//! │ TableClient  │      │ StreamsClient │
//! │    (Scan)    │      │   (shards)    │
//! └──────┬───────┘      └───────┬───────┘
//!        │                      │
//!        ▼                      ▼
//! ┌──────────────┐      ┌───────────────┐
//! │  full_table  │      │   log_based   │
//! └──────┬───────┘      └───────┬───────┘
//!        │   codec → projection │
//!        ▼                      ▼
//! ┌─────────────────────────────────────┐
//! │   SyncOrchestrator + State          │
//! └─────────────────┬───────────────────┘
//!                   ▼
//!             MessageSink
//!   SCHEMA / RECORD / ACTIVATE_VERSION / STATE
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_dynamodb::prelude::*;
//! use std::sync::Arc;
//!
//! let config = TapConfig::from_file("config.yaml")?;
//! let catalog = Catalog::from_file("catalog.json")?;
//! let mut state = State::from_json(&std::fs::read_to_string("state.json")?)?;
//!
//! // `tables` and `streams` wrap whatever SDK client the host builds
//! let ctx = SyncContext::new(tables, streams, Arc::new(JsonLinesSink::stdout()))
//!     .with_settings(SyncSettings::from(&config));
//!
//! SyncOrchestrator::new(ctx)
//!     .sync_catalog(&catalog.selected_tables()?, &mut state)
//!     .await?;
//! ```
//!
//! Client construction, discovery and the command line live outside this
//! crate; [`config::TapConfig`] carries the settings a host needs for them.

pub mod catalog;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod projection;
pub mod reserved;
pub mod retry;
pub mod state;
pub mod sync;
pub mod testing;
pub mod types;

pub use catalog::{Catalog, ReplicationMethod, TableStream};
pub use config::TapConfig;
pub use error::{DynamoError, Result};
pub use message::{JsonLinesSink, MessageSink, SyncMessage};
pub use projection::{MissingParent, Projection};
pub use state::{State, TableCheckpoint};
pub use sync::{SyncContext, SyncOrchestrator, SyncSettings};
pub use types::{AttributeValue, Item};

/// Prelude for common imports
pub mod prelude {
    pub use crate::catalog::{Catalog, ReplicationMethod, TableStream};
    pub use crate::client::{StreamsClient, TableClient};
    pub use crate::config::TapConfig;
    pub use crate::error::{DynamoError, Result};
    pub use crate::message::{JsonLinesSink, MessageSink, SyncMessage};
    pub use crate::retry::RetryConfig;
    pub use crate::state::State;
    pub use crate::sync::{SyncContext, SyncOrchestrator, SyncSettings};
    pub use crate::types::{AttributeValue, Item};
}
