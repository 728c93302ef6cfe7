//! Per-table state machine and catalog runs

mod harness;

use chrono::{Duration as ChronoDuration, Utc};
use harness::*;
use rivven_dynamodb::testing::Fault;
use rivven_dynamodb::{
    Catalog, DynamoError, ReplicationMethod, State, SyncOrchestrator, SyncSettings, TableStream,
    TapConfig,
};

const VERSION: i64 = 1_571_000_000_000;

fn orchestrator(env: &TestEnv) -> SyncOrchestrator {
    SyncOrchestrator::new(env.ctx.clone())
}

#[tokio::test]
async fn test_full_table_message_order() {
    let env = TestEnv::new();
    env.dynamo.create_table("users", &["id"]);
    env.dynamo.load_items("users", (0..3).map(numbered_item));

    let table = TableStream::new("users", ReplicationMethod::FullTable).with_key_properties(&["id"]);
    let mut state = State::new();
    let rows = orchestrator(&env).sync_stream(&table, &mut state).await.unwrap();
    assert_eq!(rows, 3);

    assert_eq!(
        env.sink.kinds(),
        vec![
            "STATE",
            "SCHEMA",
            "STATE",
            "ACTIVATE_VERSION",
            "RECORD",
            "RECORD",
            "RECORD",
            "ACTIVATE_VERSION",
            "STATE",
            "STATE",
        ]
    );

    let states = env.sink.states();
    assert_eq!(states[0].currently_syncing.as_deref(), Some("users"));

    let cp = state.checkpoint("users").unwrap();
    assert!(cp.success_timestamp.is_some());
    assert_eq!(cp.last_replication_method, Some(ReplicationMethod::FullTable));
}

#[tokio::test]
async fn test_replication_method_change_resets_checkpoint() {
    let env = TestEnv::new();
    env.dynamo.create_table("users", &["id"]);
    env.dynamo.load_items("users", (0..5).map(numbered_item));

    let mut state = State::new();
    {
        let cp = state.checkpoint_mut("users");
        cp.version = Some(VERSION);
        cp.initial_full_table_complete = Some(true);
        cp.finish_shard("shardId-00000001");
        cp.last_replication_method = Some(ReplicationMethod::LogBased);
    }

    let table = TableStream::new("users", ReplicationMethod::FullTable);
    orchestrator(&env).sync_stream(&table, &mut state).await.unwrap();

    let cp = state.checkpoint("users").unwrap();
    assert!(cp.finished_shards.is_empty());
    assert_eq!(cp.last_replication_method, Some(ReplicationMethod::FullTable));

    // the old version is gone, so this counts as a first run
    let versions = env.sink.activate_versions("users");
    assert_eq!(versions.len(), 2);
    assert_ne!(versions[0], VERSION);
    assert_eq!(cp.version, Some(versions[0]));
}

#[tokio::test]
async fn test_log_based_bootstrap_then_stream() {
    let mut env = TestEnv::new();
    env.dynamo.create_table("users", &["id"]);
    env.dynamo.enable_stream("users");
    for i in 0..20 {
        env.dynamo.put_item("users", numbered_item(i));
    }
    let before_scan = env.dynamo.rotate_shard("users").unwrap();

    let table = TableStream::new("users", ReplicationMethod::LogBased);
    let mut state = State::new();
    let rows = orchestrator(&env).sync_stream(&table, &mut state).await.unwrap();
    assert_eq!(rows, 20);

    // changes already in closed shards are covered by the scan
    assert!(env.dynamo.shards_read().is_empty());
    let cp = state.checkpoint("users").unwrap();
    assert!(cp.is_finished(&before_scan));
    assert!(cp.is_initial_load_complete());

    env.dynamo.put_item("users", numbered_item(20));
    let after_scan = env.dynamo.rotate_shard("users").unwrap();

    env.next_run();
    let rows = orchestrator(&env).sync_stream(&table, &mut state).await.unwrap();
    assert_eq!(rows, 1);
    assert_eq!(ids(&env.sink.records("users")), vec![20]);
    assert!(state.checkpoint("users").unwrap().is_finished(&after_scan));
}

#[tokio::test]
async fn test_open_shard_at_bootstrap_is_replayed_once_closed() {
    let mut env = TestEnv::new();
    env.dynamo.create_table("users", &["id"]);
    env.dynamo.enable_stream("users");
    for i in 0..5 {
        env.dynamo.put_item("users", numbered_item(i));
    }
    let open_at_scan = env.dynamo.open_shard("users").unwrap();

    let table = TableStream::new("users", ReplicationMethod::LogBased);
    let mut state = State::new();
    let rows = orchestrator(&env).sync_stream(&table, &mut state).await.unwrap();
    assert_eq!(rows, 5);

    let cp = state.checkpoint("users").unwrap();
    assert!(cp.finished_shards.is_empty());
    assert!(cp.shard_seq_numbers.is_empty());
    let version = cp.version.unwrap();

    env.dynamo.put_item("users", numbered_item(5));
    assert_eq!(env.dynamo.rotate_shard("users").as_deref(), Some(open_at_scan.as_str()));

    // changes taken before the scan come around again, from the shard start
    env.next_run();
    let rows = orchestrator(&env).sync_stream(&table, &mut state).await.unwrap();
    assert_eq!(rows, 6);
    assert_eq!(ids(&env.sink.records("users")), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(env.dynamo.shards_read(), vec![open_at_scan.clone()]);
    assert_eq!(env.sink.activate_versions("users"), vec![version]);
    assert!(state.checkpoint("users").unwrap().is_finished(&open_at_scan));
}

#[tokio::test]
async fn test_aged_out_stream_checkpoint_triggers_rescan() {
    let env = TestEnv::new();
    env.dynamo.create_table("users", &["id"]);
    env.dynamo.enable_stream("users");
    env.dynamo.load_items("users", (0..50).map(numbered_item));
    env.dynamo.put_item("users", numbered_item(50));
    let stale = env.dynamo.rotate_shard("users").unwrap();

    let mut state = State::new();
    {
        let cp = state.checkpoint_mut("users");
        cp.version = Some(VERSION);
        cp.initial_full_table_complete = Some(true);
        cp.record_sequence(&stale, "000000000000000000001");
        cp.success_timestamp = Some(Utc::now() - ChronoDuration::hours(20));
        cp.last_replication_method = Some(ReplicationMethod::LogBased);
    }

    let table = TableStream::new("users", ReplicationMethod::LogBased);
    let rows = orchestrator(&env).sync_stream(&table, &mut state).await.unwrap();

    // full rescan, and the stale shard predates it
    assert_eq!(rows, 51);
    assert_eq!(id_set(&env.sink.records("users")).len(), 51);
    assert!(env.dynamo.shards_read().is_empty());

    let cp = state.checkpoint("users").unwrap();
    assert!(cp.shard_seq_numbers.is_empty());
    assert!(cp.is_finished(&stale));
    assert!(cp.is_initial_load_complete());
    let version = cp.version.unwrap();
    assert!(version > VERSION);

    // a kept version is not a first run: no activate before the records
    let kinds = env.sink.kinds();
    let first_record = kinds.iter().position(|k| *k == "RECORD").unwrap();
    assert!(!kinds[..first_record].contains(&"ACTIVATE_VERSION"));
    assert_eq!(env.sink.activate_versions("users"), vec![version, version]);
}

#[tokio::test]
async fn test_interrupted_bootstrap_keeps_its_shard_bookmarks() {
    let mut env = TestEnv::new();
    env.dynamo.create_table("users", &["id"]);
    env.dynamo.enable_stream("users");
    env.dynamo.load_items("users", (0..1500).map(numbered_item));
    env.dynamo.put_item("users", numbered_item(1500));
    let before_scan = env.dynamo.rotate_shard("users").unwrap();
    env.dynamo.fail_after("scan", 1, 1, Fault::AccessDenied);

    let table = TableStream::new("users", ReplicationMethod::LogBased);
    let mut state = State::new();
    let err = orchestrator(&env)
        .sync_stream(&table, &mut state)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), DynamoError::AccessDenied { .. }));
    let mut persisted = env.sink.last_state().unwrap();

    // a change lands while the bootstrap is paused
    env.dynamo.put_item("users", numbered_item(1501));
    let during_scan = env.dynamo.rotate_shard("users").unwrap();

    env.next_run();
    orchestrator(&env)
        .sync_stream(&table, &mut persisted)
        .await
        .unwrap();

    assert_eq!(env.dynamo.shards_read(), vec![during_scan.clone()]);
    let cp = persisted.checkpoint("users").unwrap();
    assert!(cp.is_finished(&before_scan));
    assert!(cp.is_finished(&during_scan));
}

#[tokio::test]
async fn test_sync_catalog_runs_selected_tables_in_order() {
    let env = TestEnv::new();
    for name in ["a", "b", "c"] {
        env.dynamo.create_table(name, &["id"]);
        env.dynamo.load_items(name, (0..2).map(numbered_item));
    }

    let catalog = Catalog::from_json(
        r#"{"streams": [
            {"tap_stream_id": "a", "metadata": [{"breadcrumb": [], "metadata": {"selected": true, "replication-method": "FULL_TABLE"}}]},
            {"tap_stream_id": "b", "metadata": [{"breadcrumb": [], "metadata": {"selected": false}}]},
            {"tap_stream_id": "c", "metadata": [{"breadcrumb": [], "metadata": {"selected": true, "replication-method": "FULL_TABLE"}}]}
        ]}"#,
    )
    .unwrap();
    let tables = catalog.selected_tables().unwrap();

    let mut state = State::new();
    let total = orchestrator(&env).sync_catalog(&tables, &mut state).await.unwrap();
    assert_eq!(total, 4);

    let streams: Vec<String> = env
        .sink
        .messages()
        .iter()
        .filter_map(|m| m.stream().map(str::to_string))
        .collect();
    let first_c = streams.iter().position(|s| s == "c").unwrap();
    assert!(streams[..first_c].iter().all(|s| s == "a"));
    assert!(!streams.iter().any(|s| s == "b"));

    let last = env.sink.last_state().unwrap();
    assert!(last.currently_syncing.is_none());
    assert!(last.checkpoint("a").unwrap().success_timestamp.is_some());
    assert!(last.checkpoint("c").unwrap().success_timestamp.is_some());
}

#[tokio::test]
async fn test_sync_catalog_stops_at_first_failure() {
    let env = TestEnv::new();
    env.dynamo.create_table("b", &["id"]);

    let tables = vec![
        TableStream::new("missing", ReplicationMethod::FullTable),
        TableStream::new("b", ReplicationMethod::FullTable),
    ];
    let mut state = State::new();
    let err = orchestrator(&env)
        .sync_catalog(&tables, &mut state)
        .await
        .unwrap_err();

    match &err {
        DynamoError::Table { table, source } => {
            assert_eq!(table, "missing");
            assert!(matches!(**source, DynamoError::NotFound(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(env.sink.messages().iter().all(|m| m.stream() != Some("b")));
    assert_eq!(state.currently_syncing.as_deref(), Some("missing"));
}

#[tokio::test]
async fn test_settings_from_yaml_config() {
    let config = TapConfig::parse(
        r#"
region_name: us-east-1
scan_page_size: 2
state_flush_interval: 10
retry:
  max_attempts: 2
"#,
    )
    .unwrap();
    let settings = SyncSettings::from(&config);
    assert_eq!(settings.retry.max_attempts, 2);

    let env = TestEnv::new();
    env.dynamo.create_table("users", &["id"]);
    env.dynamo.load_items("users", (0..5).map(numbered_item));
    let orchestrator = SyncOrchestrator::new(env.ctx.clone().with_settings(settings));

    let mut state = State::new();
    orchestrator
        .sync_stream(&TableStream::new("users", ReplicationMethod::FullTable), &mut state)
        .await
        .unwrap();
    assert_eq!(env.dynamo.scan_requests().len(), 3);
    assert!(env.dynamo.scan_requests().iter().all(|r| r.limit == 2));
}
