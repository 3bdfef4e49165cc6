//! Integration test: scripted cursor conversations against a mock host.
//!
//! Drives `MockServerInstance` and `HostRouter` the way a database under test
//! would: initiating query, continuations, cancellations, plan exchange.

use search_mock::{
    CursorState, DeadReason, HostRouter, InstanceOptions, MockError, MockServerInstance, PlanStep,
    ScriptedResponse, ScriptedStep, StreamKind, WireEnvelope,
};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn instance(host: &str) -> MockServerInstance {
    MockServerInstance::new(host, InstanceOptions::default())
}

fn search_request() -> Value {
    json!({
        "search": "movies",
        "collectionUUID": "5f1c",
        "query": {"text": {"query": "space", "path": "plot"}},
    })
}

fn continue_request(handle: u64) -> Value {
    json!({"continue": handle, "collection": "movies"})
}

fn docs(ids: std::ops::Range<u64>) -> Vec<Value> {
    ids.map(|i| json!({"_id": i, "$searchScore": 1.0})).collect()
}

fn batch_of(env: &WireEnvelope) -> Vec<Value> {
    env.batch().map(|b| b.to_vec()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Single-stream conversations
// ---------------------------------------------------------------------------

#[test]
fn initiating_query_then_continuation() {
    let host = instance("shard0");
    host.register(
        123,
        vec![
            ScriptedStep::new(search_request(), ScriptedResponse::batch("db.movies", docs(0..3))),
            ScriptedStep::new(continue_request(123), ScriptedResponse::batch("db.movies", docs(3..4))),
        ],
        StreamKind::Unspecified,
    )
    .unwrap();

    let first = host.handle(&search_request()).unwrap();
    assert_eq!(batch_of(&first).len(), 3);
    assert_eq!(first.cursor_id(), Some(123));

    let second = host.handle(&continue_request(123)).unwrap();
    assert_eq!(batch_of(&second), docs(3..4));
    assert_eq!(second.cursor_id(), Some(0));

    assert!(host.check_unused().is_ok());
    host.with_ledger(|ledger| assert_eq!(ledger.state(123), Some(CursorState::Exhausted)));
}

#[test]
fn continuation_for_unregistered_handle_is_unknown_cursor() {
    let host = instance("shard0");
    let err = host.handle(&continue_request(404)).unwrap_err();
    assert!(matches!(err, MockError::UnknownCursor { handle: 404, reason: DeadReason::NeverRegistered }));
    assert_eq!(host.info().violations, 1);
}

#[test]
fn request_after_exhaustion_is_unknown_cursor() {
    let host = instance("shard0");
    host.register(
        7,
        vec![ScriptedStep::new(search_request(), ScriptedResponse::batch("db.movies", docs(0..1)))],
        StreamKind::Unspecified,
    )
    .unwrap();

    let reply = host.handle(&search_request()).unwrap();
    assert_eq!(reply.cursor_id(), Some(0));

    let err = host.handle(&continue_request(7)).unwrap_err();
    assert!(matches!(err, MockError::UnknownCursor { handle: 7, reason: DeadReason::Exhausted }));

    // Cancelling a drained handle stays acceptable
    let killed = host.handle(&json!({"cancel": [7]})).unwrap();
    assert_eq!(killed.to_document().unwrap(), json!({"cursorsKilled": [7], "ok": 1}));
}

#[test]
fn mismatched_continuation_is_protocol_violation() {
    let host = instance("shard0");
    host.register(
        9,
        vec![
            ScriptedStep::new(search_request(), ScriptedResponse::batch("db.movies", docs(0..2))),
            ScriptedStep::new(
                json!({"continue": 9, "collection": "movies", "cursorOptions": {"batchSize": 50}}),
                ScriptedResponse::batch("db.movies", docs(2..3)),
            ),
        ],
        StreamKind::Unspecified,
    )
    .unwrap();
    host.handle(&search_request()).unwrap();

    let err = host.handle(&continue_request(9)).unwrap_err();
    match err {
        MockError::ProtocolViolation { handle, diff } => {
            assert_eq!(handle, 9);
            assert!(diff.contains("cursorOptions"), "diff was: {}", diff);
        }
        e => panic!("Expected ProtocolViolation, got: {:?}", e),
    }

    // Step was not consumed; the correct request still succeeds
    let reply = host
        .handle(&json!({"collection": "movies", "cursorOptions": {"batchSize": 50}, "continue": 9}))
        .unwrap();
    assert_eq!(reply.cursor_id(), Some(0));
}

#[test]
fn unconsumed_mandatory_step_fails_teardown() {
    let host = instance("shard0");
    host.register(
        11,
        vec![
            ScriptedStep::new(search_request(), ScriptedResponse::batch("db.movies", docs(0..2))),
            ScriptedStep::new(continue_request(11), ScriptedResponse::batch("db.movies", docs(2..3))),
        ],
        StreamKind::Unspecified,
    )
    .unwrap();
    host.handle(&search_request()).unwrap();

    let err = host.check_unused().unwrap_err();
    assert!(matches!(err, MockError::UnusedHistory(_)));
    assert!(err.to_string().contains("cursor 11"));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[test]
fn cancel_tolerant_step_before_it_is_requested() {
    let host = instance("shard0");
    host.register(
        200,
        vec![ScriptedStep::new(continue_request(200), ScriptedResponse::batch("db.movies", docs(0..1))).tolerant()],
        StreamKind::Metadata,
    )
    .unwrap();

    let reply = host.handle(&json!({"cancel": [200], "collection": "movies"})).unwrap();
    assert!(reply.is_ok());
    host.with_ledger(|ledger| {
        assert!(ledger.state(200).unwrap().is_exhausted());
        assert!(ledger.peek_exhausted(200));
    });
    assert!(host.check_unused().is_ok());
}

#[test]
fn cancel_with_mandatory_step_is_premature() {
    let host = instance("shard0");
    host.register(
        201,
        vec![ScriptedStep::new(continue_request(201), ScriptedResponse::batch("db.movies", docs(0..1)))],
        StreamKind::Unspecified,
    )
    .unwrap();

    let err = host.handle(&json!({"cancel": [201]})).unwrap_err();
    assert!(matches!(err, MockError::PrematureCancellation { handle: 201, remaining: 1 }));
    host.with_ledger(|ledger| assert_eq!(ledger.state(201), Some(CursorState::Open)));
}

// ---------------------------------------------------------------------------
// Dual streams
// ---------------------------------------------------------------------------

fn register_dual(host: &MockServerInstance) {
    host.register(
        123,
        vec![
            ScriptedStep::new(
                search_request(),
                ScriptedResponse::dual("db.movies", docs(0..2), 456, vec![json!({"count": {"lowerBound": 3}})]),
            ),
            ScriptedStep::new(continue_request(123), ScriptedResponse::batch("db.movies", docs(2..3))),
        ],
        StreamKind::Results,
    )
    .unwrap();
    host.register(
        456,
        vec![ScriptedStep::new(continue_request(456), ScriptedResponse::batch("db.movies", vec![]))],
        StreamKind::Metadata,
    )
    .unwrap();
}

#[test]
fn dual_stream_reply_announces_both_handles() {
    let host = instance("shard0");
    register_dual(&host);

    let doc = host.handle(&search_request()).unwrap().to_document().unwrap();
    assert_eq!(doc["cursors"][0]["cursor"]["id"], json!(123));
    assert_eq!(doc["cursors"][0]["cursor"]["kind"], json!("results"));
    assert_eq!(doc["cursors"][1]["cursor"]["id"], json!(456));
    assert_eq!(doc["cursors"][1]["cursor"]["kind"], json!("metadata"));
    assert_eq!(doc["cursors"][1]["cursor"]["batch"], json!([{"count": {"lowerBound": 3}}]));
}

#[test]
fn draining_one_stream_leaves_the_other_untouched() {
    let host = instance("shard0");
    register_dual(&host);
    host.handle(&search_request()).unwrap();

    let meta = host.handle(&continue_request(456)).unwrap().to_document().unwrap();
    assert_eq!(meta["cursor"]["id"], json!(0));
    assert_eq!(meta["cursor"]["kind"], json!("metadata"));

    host.with_ledger(|ledger| {
        assert_eq!(ledger.state(456), Some(CursorState::Exhausted));
        assert_eq!(ledger.state(123), Some(CursorState::Open));
        assert_eq!(ledger.entry(123).unwrap().remaining(), 1);
    });

    let results = host.handle(&continue_request(123)).unwrap();
    assert_eq!(results.cursor_id(), Some(0));
    assert_eq!(batch_of(&results), docs(2..3));
}

#[test]
fn unneeded_metadata_stream_cancelled_after_results() {
    let host = instance("shard0");
    host.register(
        123,
        vec![ScriptedStep::new(
            search_request(),
            ScriptedResponse::dual("db.movies", docs(0..1), 456, vec![]),
        )],
        StreamKind::Results,
    )
    .unwrap();
    host.register(
        456,
        vec![ScriptedStep::new(continue_request(456), ScriptedResponse::batch("db.movies", vec![])).tolerant()],
        StreamKind::Metadata,
    )
    .unwrap();

    let doc = host.handle(&search_request()).unwrap().to_document().unwrap();
    assert_eq!(doc["cursors"][0]["cursor"]["id"], json!(0));
    assert_eq!(doc["cursors"][1]["cursor"]["id"], json!(456));

    host.handle(&json!({"cancel": [456]})).unwrap();
    assert!(host.check_unused().is_ok());
}

// ---------------------------------------------------------------------------
// Sharded fan-out
// ---------------------------------------------------------------------------

#[test]
fn plan_then_per_shard_cursors() {
    let router = HostRouter::new(InstanceOptions::default());
    let mongos = router.create_host("mongos").unwrap();
    mongos
        .register_plan(vec![PlanStep {
            expected_request: json!({"planShardedSearch": "movies"}),
            response: json!({"protocolVersion": 1, "sortSpec": {"$searchScore": -1}}),
            tolerate_skip: false,
        }])
        .unwrap();

    for shard in ["shard0", "shard1"] {
        let host = router.create_host(shard).unwrap();
        host.register(
            123,
            vec![ScriptedStep::new(search_request(), ScriptedResponse::batch("db.movies", docs(0..1)))],
            StreamKind::Unspecified,
        )
        .unwrap();
    }

    let plan = router
        .dispatch("mongos", &json!({"planShardedSearch": "movies", "query": {}}))
        .unwrap()
        .to_document()
        .unwrap();
    assert_eq!(plan["protocolVersion"], json!(1));
    assert_eq!(plan["ok"], json!(1));

    assert_eq!(router.dispatch("shard0", &search_request()).unwrap().cursor_id(), Some(0));
    assert_eq!(router.get_host("shard1").unwrap().queued_responses(), 1);
    assert_eq!(router.check_all_unused().len(), 1);

    router.dispatch("shard1", &search_request()).unwrap();
    assert!(router.check_all_unused().is_empty());
}
