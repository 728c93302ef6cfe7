//! Shared setup for the sync scenario tests
#![allow(dead_code)]

use rivven_dynamodb::retry::RetryConfig;
use rivven_dynamodb::testing::{item, MemorySink, MockDynamo};
use rivven_dynamodb::{Item, SyncContext, SyncSettings};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_dynamodb=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Mock store, memory sink and a context wired to both
pub struct TestEnv {
    pub dynamo: Arc<MockDynamo>,
    pub sink: Arc<MemorySink>,
    pub ctx: SyncContext,
}

impl TestEnv {
    pub fn new() -> Self {
        init_test_logging();
        let dynamo = Arc::new(MockDynamo::new());
        let sink = Arc::new(MemorySink::new());
        let ctx = context(&dynamo, &sink);
        Self { dynamo, sink, ctx }
    }

    /// Fresh sink, same store; what a new process run looks like
    pub fn next_run(&mut self) {
        self.sink = Arc::new(MemorySink::new());
        self.ctx = context(&self.dynamo, &self.sink);
    }
}

fn context(dynamo: &Arc<MockDynamo>, sink: &Arc<MemorySink>) -> SyncContext {
    let settings = SyncSettings {
        retry: RetryConfig::new()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100)),
        ..Default::default()
    };
    SyncContext::new(dynamo.clone(), dynamo.clone(), sink.clone()).with_settings(settings)
}

/// Item `{"id": i, "name": "item-i"}`
pub fn numbered_item(i: u64) -> Item {
    item(json!({"id": i, "name": format!("item-{i}")}))
}

pub fn id_key(i: u64) -> Item {
    item(json!({"id": i}))
}

/// The `id` values of a list of records
pub fn ids(records: &[Value]) -> Vec<u64> {
    records.iter().filter_map(|r| r["id"].as_u64()).collect()
}

pub fn id_set(records: &[Value]) -> BTreeSet<u64> {
    ids(records).into_iter().collect()
}
