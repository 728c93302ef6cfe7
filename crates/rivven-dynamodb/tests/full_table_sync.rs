//! Bulk scan driver scenarios against the in-memory store

mod harness;

use harness::*;
use rivven_dynamodb::client::ScanRequest;
use rivven_dynamodb::sync::full_table::sync_full_table;
use rivven_dynamodb::testing::Fault;
use rivven_dynamodb::{DynamoError, ReplicationMethod, State, TableStream};
use serde_json::json;
use std::collections::BTreeMap;

const VERSION: i64 = 1_571_000_000_000;

fn docs_table(env: &TestEnv, count: u64) -> TableStream {
    env.dynamo.create_table("GoogleDocs", &["id"]);
    env.dynamo
        .load_items("GoogleDocs", (0..count).map(numbered_item));
    TableStream::new("GoogleDocs", ReplicationMethod::FullTable).with_key_properties(&["id"])
}

#[tokio::test]
async fn test_resumed_scan_emits_only_remaining_items() {
    let env = TestEnv::new();
    let table = docs_table(&env, 3531);

    let mut state = State::new();
    {
        let cp = state.checkpoint_mut("GoogleDocs");
        cp.version = Some(VERSION);
        cp.last_evaluated_key = Some(id_key(999));
    }

    let rows = sync_full_table(&env.ctx, &table, &mut state).await.unwrap();
    assert_eq!(rows, 2531);

    let records = env.sink.records("GoogleDocs");
    assert_eq!(ids(&records), (1000..3531).collect::<Vec<_>>());
    assert!(env
        .sink
        .record_versions("GoogleDocs")
        .iter()
        .all(|v| *v == VERSION));

    // no activate at start, exactly one at the end
    assert_eq!(env.sink.activate_versions("GoogleDocs"), vec![VERSION]);
    let kinds = env.sink.kinds();
    let last_record = kinds.iter().rposition(|k| *k == "RECORD").unwrap();
    let activate = kinds.iter().position(|k| *k == "ACTIVATE_VERSION").unwrap();
    assert!(activate > last_record);

    let cp = state.checkpoint("GoogleDocs").unwrap();
    assert_eq!(cp.version, Some(VERSION));
    assert!(cp.last_evaluated_key.is_none());
    assert!(cp.is_initial_load_complete());
}

#[tokio::test]
async fn test_first_run_activates_at_start_and_end() {
    let env = TestEnv::new();
    let table = docs_table(&env, 2500);
    let mut state = State::new();

    let rows = sync_full_table(&env.ctx, &table, &mut state).await.unwrap();
    assert_eq!(rows, 2500);

    let versions = env.sink.activate_versions("GoogleDocs");
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0], versions[1]);

    let kinds = env.sink.kinds();
    assert_eq!(&kinds[..3], &["STATE", "ACTIVATE_VERSION", "RECORD"]);
    assert_eq!(kinds.last(), Some(&"STATE"));

    // one cursor per page that has a successor
    let cursors: Vec<_> = env
        .sink
        .states()
        .into_iter()
        .filter_map(|s| s.checkpoint("GoogleDocs")?.last_evaluated_key.clone())
        .collect();
    assert_eq!(cursors, vec![id_key(999), id_key(1999)]);

    let final_state = env.sink.last_state().unwrap();
    let cp = final_state.checkpoint("GoogleDocs").unwrap();
    assert!(cp.last_evaluated_key.is_none());
    assert_eq!(cp.initial_full_table_complete, Some(true));
    assert_eq!(cp.version, Some(versions[0]));
}

#[tokio::test]
async fn test_rerun_after_completion_picks_new_version() {
    let mut env = TestEnv::new();
    let table = docs_table(&env, 10);
    let mut state = State::new();

    sync_full_table(&env.ctx, &table, &mut state).await.unwrap();
    let first = state.checkpoint("GoogleDocs").unwrap().version.unwrap();

    env.next_run();
    sync_full_table(&env.ctx, &table, &mut state).await.unwrap();
    let second = state.checkpoint("GoogleDocs").unwrap().version.unwrap();

    assert!(second > first);
    // not a first run any more: only the terminal activate
    assert_eq!(env.sink.activate_versions("GoogleDocs"), vec![second]);
    assert_eq!(env.sink.records("GoogleDocs").len(), 10);
}

#[tokio::test]
async fn test_interrupted_scan_resumes_without_gaps_or_duplicates() {
    let mut env = TestEnv::new();
    let table = docs_table(&env, 2500);
    env.dynamo.fail_after("scan", 1, 1, Fault::AccessDenied);

    let mut state = State::new();
    let err = sync_full_table(&env.ctx, &table, &mut state)
        .await
        .unwrap_err();
    assert!(matches!(err, DynamoError::AccessDenied { .. }));

    let first_records = env.sink.records("GoogleDocs");
    assert_eq!(first_records.len(), 1000);
    let first_version = env.sink.record_versions("GoogleDocs")[0];

    // the host persisted the last STATE it saw
    let mut persisted = env.sink.last_state().unwrap();
    assert_eq!(
        persisted.checkpoint("GoogleDocs").unwrap().last_evaluated_key,
        Some(id_key(999))
    );

    env.next_run();
    let rows = sync_full_table(&env.ctx, &table, &mut persisted)
        .await
        .unwrap();
    assert_eq!(rows, 1500);

    let second_records = env.sink.records("GoogleDocs");
    assert!(env
        .sink
        .record_versions("GoogleDocs")
        .iter()
        .all(|v| *v == first_version));

    let mut all = ids(&first_records);
    all.extend(ids(&second_records));
    assert_eq!(all, (0..2500).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_transient_scan_errors_are_retried() {
    let env = TestEnv::new();
    let table = docs_table(&env, 1500);
    env.dynamo.fail_after("scan", 1, 3, Fault::Timeout);

    let mut state = State::new();
    let rows = sync_full_table(&env.ctx, &table, &mut state).await.unwrap();
    assert_eq!(rows, 1500);
    assert_eq!(id_set(&env.sink.records("GoogleDocs")).len(), 1500);
    // 1 good page, 3 timeouts, 1 good page
    assert_eq!(env.dynamo.scan_requests().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_leaves_checkpoint_resumable() {
    let env = TestEnv::new();
    let table = docs_table(&env, 1500);
    env.dynamo.fail_after("scan", 1, 5, Fault::Connection);

    let mut state = State::new();
    let err = sync_full_table(&env.ctx, &table, &mut state)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(env.dynamo.scan_requests().len(), 6);

    let persisted = env.sink.last_state().unwrap();
    let cp = persisted.checkpoint("GoogleDocs").unwrap();
    assert_eq!(cp.last_evaluated_key, Some(id_key(999)));
    assert!(!cp.is_initial_load_complete());
    assert_eq!(env.sink.records("GoogleDocs").len(), 1000);
}

#[tokio::test]
async fn test_reserved_word_projection_uses_supplied_aliases() {
    let env = TestEnv::new();
    env.dynamo.create_table("Docs", &["id"]);
    env.dynamo.load_items(
        "Docs",
        [rivven_dynamodb::testing::item(
            json!({"id": 1, "Comment": "hello", "Sheet": "s1"}),
        )],
    );
    let table = TableStream::new("Docs", ReplicationMethod::FullTable)
        .with_projection("#cmt", Some(r##"{"#cmt": "Comment"}"##));

    let mut state = State::new();
    sync_full_table(&env.ctx, &table, &mut state).await.unwrap();

    let request = &env.dynamo.scan_requests()[0];
    assert_eq!(request.projection_expression.as_deref(), Some("#cmt"));
    let expected: BTreeMap<String, String> =
        [("#cmt".to_string(), "Comment".to_string())].into();
    assert_eq!(request.expression_attribute_names.as_ref(), Some(&expected));

    assert_eq!(env.sink.records("Docs"), vec![json!({"Comment": "hello"})]);
}

#[tokio::test]
async fn test_reserved_word_projection_without_aliases_is_aliased() {
    let env = TestEnv::new();
    env.dynamo.create_table("Docs", &["id"]);
    let table = TableStream::new("Docs", ReplicationMethod::FullTable).with_projection("Comment, Sheet", None);

    let mut state = State::new();
    sync_full_table(&env.ctx, &table, &mut state).await.unwrap();

    let requests = env.dynamo.scan_requests();
    assert_eq!(
        requests[0],
        ScanRequest {
            table_name: "Docs".to_string(),
            limit: 1000,
            projection_expression: Some("#Comment,Sheet".to_string()),
            expression_attribute_names: Some([("#Comment".to_string(), "Comment".to_string())].into()),
            exclusive_start_key: None,
        }
    );
}

#[tokio::test]
async fn test_undefined_alias_fails_before_any_request() {
    let env = TestEnv::new();
    env.dynamo.create_table("Docs", &["id"]);
    let table = TableStream::new("Docs", ReplicationMethod::FullTable)
        .with_projection("#cmt, Sheet", Some(r##"{"#c": "Comment"}"##));

    let mut state = State::new();
    let err = sync_full_table(&env.ctx, &table, &mut state)
        .await
        .unwrap_err();
    assert!(matches!(err, DynamoError::Config(_)));
    assert!(err.to_string().contains("#cmt"), "{err}");
    assert!(env.dynamo.requests().is_empty());
    assert!(env.sink.messages().is_empty());
}

#[tokio::test]
async fn test_nested_projection_on_scanned_items() {
    let env = TestEnv::new();
    env.dynamo.create_table("Songs", &["id"]);
    env.dynamo.load_items(
        "Songs",
        [
            rivven_dynamodb::testing::item(json!({
                "id": 1,
                "Artist": "a",
                "metadata": [{"Age": 30, "x": 1}, {"Age": 40}]
            })),
            rivven_dynamodb::testing::item(json!({"id": 2})),
        ],
    );
    let table = TableStream::new("Songs", ReplicationMethod::FullTable)
        .with_projection("Artist, metadata[0].Age", None);

    let mut state = State::new();
    sync_full_table(&env.ctx, &table, &mut state).await.unwrap();

    assert_eq!(
        env.sink.records("Songs"),
        vec![
            json!({"Artist": "a", "metadata": [{"Age": 30}]}),
            json!({}),
        ]
    );
}

#[tokio::test]
async fn test_indexed_projection_keeps_store_selected_elements() {
    let env = TestEnv::new();
    env.dynamo.create_table("Results", &["id"]);
    env.dynamo.load_items(
        "Results",
        [rivven_dynamodb::testing::item(json!({
            "id": 1,
            "tests": [10, 11, 12, 13],
            "map_field": {"list_entry": [1, 2, 3], "flag": true},
            "metadata": [{"Age": 30}, {"Age": 40, "x": 1}]
        }))],
    );
    let table = TableStream::new("Results", ReplicationMethod::FullTable)
        .with_projection("tests[2], map_field.list_entry[2], metadata[1].Age", None);

    let mut state = State::new();
    sync_full_table(&env.ctx, &table, &mut state).await.unwrap();

    assert_eq!(
        env.sink.records("Results"),
        vec![json!({
            "tests": [12],
            "map_field": {"list_entry": [3]},
            "metadata": [{"Age": 40}]
        })]
    );
}
