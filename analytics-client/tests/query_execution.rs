//! End-to-end behavior of the query engine over a scripted transport:
//! streaming delivery, retry/backoff under the deadline, connection
//! eviction, and the failure taxonomy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use analytics_client::{
    Cluster, ClusterOptions, Credential, Error, HttpTransport, QueryOptions, TransportRequest,
    TransportResponse,
};

struct ScriptedResponse {
    status: u16,
    body: Vec<u8>,
    /// Body chunk size, to exercise arbitrary chunk boundaries.
    chunk: usize,
    /// Simulated server latency before the response lands.
    delay: Option<Duration>,
}

impl ScriptedResponse {
    fn ok(body: Value) -> Self {
        ScriptedResponse {
            status: 200,
            body: body.to_string().into_bytes(),
            chunk: 7,
            delay: None,
        }
    }

    fn status(status: u16, body: &str) -> Self {
        ScriptedResponse {
            status,
            body: body.as_bytes().to_vec(),
            chunk: 7,
            delay: None,
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Transport that replays a script and records what the engine sent.
#[derive(Default)]
struct MockTransport {
    script: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<Value>>,
    evictions: AtomicUsize,
}

impl MockTransport {
    fn new(script: Vec<ScriptedResponse>) -> Arc<Self> {
        Arc::new(MockTransport {
            script: Mutex::new(script.into()),
            ..MockTransport::default()
        })
    }

    fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    fn evictions(&self) -> usize {
        self.evictions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(
        &self,
        request: TransportRequest,
        cancel: &CancellationToken,
    ) -> analytics_client::Result<TransportResponse> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let scripted = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .expect("engine dispatched more requests than the script allows");
        self.requests
            .lock()
            .unwrap()
            .push(serde_json::from_slice(&request.body).unwrap());
        if let Some(delay) = scripted.delay {
            tokio::time::sleep(delay).await;
        }
        let chunks: Vec<analytics_client::Result<Bytes>> = scripted
            .body
            .chunks(scripted.chunk.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(TransportResponse {
            status: scripted.status,
            body: Box::pin(futures::stream::iter(chunks)),
        })
    }

    fn evict_pooled_connections(&self) {
        self.evictions.fetch_add(1, Ordering::SeqCst);
    }
}

fn make_cluster(transport: Arc<MockTransport>) -> Cluster {
    Cluster::with_transport(
        transport,
        Credential::basic("Administrator", "password"),
        ClusterOptions::default(),
    )
}

fn success_body(request_id: &str, rows: Vec<Value>) -> Value {
    let count = rows.len();
    json!({
        "requestID": request_id,
        "results": rows,
        "status": "success",
        "metrics": {"resultCount": count},
    })
}

fn retriable_error_body(code: i64) -> Value {
    json!({
        "requestID": "err",
        "errors": [{"code": code, "msg": "temporary failure", "retriable": true}],
        "status": "errors",
    })
}

#[tokio::test(start_paused = true)]
async fn buffered_select_returns_rows_and_metadata() -> anyhow::Result<()> {
    let transport = MockTransport::new(vec![ScriptedResponse::ok(success_body(
        "r1",
        vec![json!({"g": "hello world"})],
    ))]);
    let cluster = make_cluster(transport.clone());

    let result = cluster
        .execute_query(
            "SELECT ? AS g",
            QueryOptions::new().positional_parameters(vec![json!("hello world")]),
        )
        .await?;

    assert_eq!(result.rows().len(), 1);
    let row: Value = result.rows().next().unwrap().as_type()?;
    assert_eq!(row["g"], json!("hello world"));
    assert_eq!(result.metadata().request_id(), "r1");
    assert_eq!(result.metadata().metrics()?.result_count, 1);

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["statement"], json!("SELECT ? AS g"));
    assert_eq!(requests[0]["args"], json!(["hello world"]));
    // Cluster default timeout (75 s) plus the 5 s server padding.
    assert_eq!(requests[0]["timeout"], json!("80000ms"));
    assert_eq!(transport.evictions(), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn streaming_rows_arrive_in_wire_order() -> anyhow::Result<()> {
    let rows: Vec<Value> = (0..10).map(Value::from).collect();
    let transport = MockTransport::new(vec![ScriptedResponse::ok(success_body("r2", rows))]);
    let cluster = make_cluster(transport);

    let mut seen = Vec::new();
    let metadata = cluster
        .execute_streaming_query(
            "SELECT RAW i FROM ARRAY_RANGE(0,10) AS i",
            |row| {
                seen.push(row.as_type::<i64>().unwrap());
                Ok(())
            },
            QueryOptions::new(),
        )
        .await?;

    assert_eq!(seen, (0..10).collect::<Vec<i64>>());
    // Metadata is only observable after the last row.
    assert_eq!(metadata.request_id(), "r2");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retriable_error_is_retried_once_with_backoff() -> anyhow::Result<()> {
    let transport = MockTransport::new(vec![
        ScriptedResponse::ok(retriable_error_body(23003)),
        ScriptedResponse::ok(success_body("r3", vec![json!(42)])),
    ]);
    let cluster = make_cluster(transport.clone());

    let started = Instant::now();
    let result = cluster.execute_query("SELECT 42", QueryOptions::new()).await?;
    let elapsed = started.elapsed();

    let seen: Vec<i64> = result
        .rows()
        .map(|row| row.as_type::<i64>().unwrap())
        .collect();
    assert_eq!(seen, vec![42]);

    // Exactly one backoff sleep: attempt 0 draws from [50 ms, 100 ms].
    assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(100), "{elapsed:?}");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_ne!(
        requests[0]["client_context_id"], requests[1]["client_context_id"],
        "each attempt must mint a fresh client context id"
    );
    // The first attempt's connection was evicted, the second's kept.
    assert_eq!(transport.evictions(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn backoff_never_sleeps_past_the_deadline() {
    let transport = MockTransport::new(vec![
        ScriptedResponse::ok(retriable_error_body(23003)).delayed(Duration::from_millis(180)),
    ]);
    let cluster = make_cluster(transport.clone());

    let started = Instant::now();
    let err = cluster
        .execute_query(
            "SELECT 1",
            QueryOptions::new().timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        Error::Timeout { last_error } => {
            let last = last_error.expect("retriable error must ride along");
            assert_eq!(last.code(), 23003);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    // Only 20 ms remained; the >= 50 ms backoff must not have been slept.
    assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");
    assert_eq!(transport.requests().len(), 1, "no second HTTP call");
}

#[tokio::test(start_paused = true)]
async fn callback_errors_propagate_verbatim_and_keep_the_connection() {
    #[derive(Debug)]
    struct Boom;
    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }
    impl std::error::Error for Boom {}

    let transport = MockTransport::new(vec![ScriptedResponse::ok(success_body(
        "r4",
        vec![json!(1), json!(2), json!(3)],
    ))]);
    let cluster = make_cluster(transport.clone());

    let mut calls = 0;
    let err = cluster
        .execute_streaming_query(
            "SELECT RAW i FROM ARRAY_RANGE(0,3) AS i",
            |_row| {
                calls += 1;
                if calls == 2 {
                    return Err(Box::new(Boom) as analytics_client::BoxError);
                }
                Ok(())
            },
            QueryOptions::new(),
        )
        .await
        .unwrap_err();

    match err {
        Error::RowCallback(source) => {
            source.downcast_ref::<Boom>().expect("original error");
        }
        other => panic!("expected row-callback error, got {other:?}"),
    }
    assert_eq!(calls, 2, "no callbacks after the failing one");
    assert_eq!(transport.evictions(), 0, "connection stays reusable");
    assert_eq!(transport.requests().len(), 1, "callback errors never retry");
}

#[tokio::test(start_paused = true)]
async fn null_rows_need_the_nullable_accessor() -> anyhow::Result<()> {
    let transport = MockTransport::new(vec![ScriptedResponse::ok(success_body(
        "r5",
        vec![json!(null)],
    ))]);
    let cluster = make_cluster(transport);

    let result = cluster
        .execute_query("SELECT RAW null", QueryOptions::new())
        .await?;
    let row = result.rows().next().unwrap();

    let err = row.as_type::<String>().unwrap_err();
    assert!(matches!(err, Error::DataConversion { .. }), "{err:?}");
    assert_eq!(row.as_nullable::<String>()?, None);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn http_401_is_an_invalid_credential_error() {
    let transport = MockTransport::new(vec![ScriptedResponse::status(401, "Unauthorized")]);
    let cluster = make_cluster(transport.clone());

    let err = cluster
        .execute_query("SELECT 1", QueryOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCredentials), "{err:?}");
    assert_eq!(transport.evictions(), 1);
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn http_503_with_unparseable_body_is_retried() -> anyhow::Result<()> {
    let transport = MockTransport::new(vec![
        ScriptedResponse::status(503, ""),
        ScriptedResponse::status(503, "<html>Service Unavailable</html>"),
        ScriptedResponse::ok(success_body("r6", vec![json!("ok")])),
    ]);
    let cluster = make_cluster(transport.clone());

    let result = cluster.execute_query("SELECT 'ok'", QueryOptions::new()).await?;
    assert_eq!(result.metadata().request_id(), "r6");
    assert_eq!(transport.requests().len(), 3);
    assert_eq!(transport.evictions(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn http_503_with_structured_errors_is_classified_from_them() {
    let transport = MockTransport::new(vec![ScriptedResponse::status(
        503,
        r#"{"errors": [{"code": 24000, "msg": "syntax error"}]}"#,
    )]);
    let cluster = make_cluster(transport.clone());

    let err = cluster
        .execute_query("SELEC 1", QueryOptions::new())
        .await
        .unwrap_err();
    match err {
        Error::Query(q) => {
            assert_eq!(q.code(), 24000);
            assert!(!q.is_retriable());
        }
        other => panic!("expected query error, got {other:?}"),
    }
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn plaintext_error_bodies_surface_as_server_errors() {
    let transport = MockTransport::new(vec![ScriptedResponse::status(
        400,
        "Bad Request: statement missing",
    )]);
    let cluster = make_cluster(transport.clone());

    let err = cluster
        .execute_query("", QueryOptions::new())
        .await
        .unwrap_err();
    assert!(!err.is_retriable());
    match err {
        Error::Query(q) => {
            assert_eq!(q.code(), 0);
            assert_eq!(q.message(), "Bad Request: statement missing");
        }
        other => panic!("expected query error, got {other:?}"),
    }
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn truncated_and_malformed_responses_are_protocol_errors() {
    for body in [
        r#"{"requestID":"r","results":[1"#,
        r#"{"results":[],"status":"success"}"#,
        "not json at all",
    ] {
        let transport = MockTransport::new(vec![ScriptedResponse::status(200, body)]);
        let cluster = make_cluster(transport.clone());
        let err = cluster
            .execute_query("SELECT 1", QueryOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }), "body {body:?}: {err:?}");
        assert_eq!(transport.evictions(), 1, "body {body:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn retriable_error_after_rows_commits_the_attempt() {
    let transport = MockTransport::new(vec![ScriptedResponse::status(
        200,
        r#"{"results":[1,2],"errors":[{"code":23003,"msg":"x","retriable":true}]}"#,
    )]);
    let cluster = make_cluster(transport.clone());

    let mut seen = 0;
    let err = cluster
        .execute_streaming_query(
            "SELECT 1",
            |_| {
                seen += 1;
                Ok(())
            },
            QueryOptions::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Query(ref q) if q.is_retriable()), "{err:?}");
    assert_eq!(seen, 2);
    assert_eq!(
        transport.requests().len(),
        1,
        "rows already reached the caller, so the attempt must not be retried"
    );
}

#[tokio::test(start_paused = true)]
async fn every_retry_attempt_gets_a_fresh_context_id() -> anyhow::Result<()> {
    let transport = MockTransport::new(vec![
        ScriptedResponse::ok(retriable_error_body(23003)),
        ScriptedResponse::ok(retriable_error_body(23003)),
        ScriptedResponse::ok(retriable_error_body(23003)),
        ScriptedResponse::ok(success_body("r7", vec![])),
    ]);
    let cluster = make_cluster(transport.clone());

    cluster.execute_query("SELECT 1", QueryOptions::new()).await?;

    let ids: std::collections::HashSet<String> = transport
        .requests()
        .iter()
        .map(|r| r["client_context_id"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(ids.len(), 4, "N retries mean N+1 distinct context ids");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn total_wall_time_is_bounded_by_timeout_plus_one_backoff_step() {
    let script: Vec<ScriptedResponse> = (0..8)
        .map(|_| ScriptedResponse::ok(retriable_error_body(23003)))
        .collect();
    let transport = MockTransport::new(script);
    let cluster = make_cluster(transport);

    let timeout = Duration::from_millis(300);
    let started = Instant::now();
    let err = cluster
        .execute_query("SELECT 1", QueryOptions::new().timeout(timeout))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
    // The loop only sleeps delays that fit the deadline, so overshoot is
    // impossible; allow the assertion itself no slack.
    assert!(elapsed <= timeout, "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn scope_queries_carry_the_query_context() -> anyhow::Result<()> {
    let transport = MockTransport::new(vec![ScriptedResponse::ok(success_body("r8", vec![]))]);
    let cluster = make_cluster(transport.clone());

    cluster
        .database("travel")
        .scope("inventory")
        .execute_query("SELECT COUNT(*) FROM airline", QueryOptions::new())
        .await?;

    let requests = transport.requests();
    assert_eq!(
        requests[0]["query_context"],
        json!("default:`travel`.`inventory`")
    );

    // Cluster-level queries send no context.
    let transport = MockTransport::new(vec![ScriptedResponse::ok(success_body("r9", vec![]))]);
    let cluster = make_cluster(transport.clone());
    cluster.execute_query("SELECT 1", QueryOptions::new()).await?;
    assert!(transport.requests()[0].get("query_context").is_none());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn backticked_scope_names_are_rejected_before_dispatch() {
    let transport = MockTransport::new(vec![]);
    let cluster = make_cluster(transport.clone());

    let err = cluster
        .database("trav`el")
        .scope("inventory")
        .execute_query("SELECT 1", QueryOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }), "{err:?}");
    assert!(transport.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn closed_clusters_cancel_queries() {
    let transport = MockTransport::new(vec![]);
    let cluster = make_cluster(transport);

    cluster.close();
    let err = cluster
        .execute_query("SELECT 1", QueryOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn per_query_deserializer_overrides_the_cluster_default() -> anyhow::Result<()> {
    /// Wraps every decoded value in an envelope, the way annotating
    /// deserializers in test suites do.
    #[derive(Debug)]
    struct Annotating;
    impl analytics_client::Deserializer for Annotating {
        fn decode(&self, bytes: &[u8]) -> analytics_client::Result<Value> {
            let inner: Value = serde_json::from_slice(bytes).unwrap();
            Ok(json!({"annotated": inner}))
        }
    }

    let transport = MockTransport::new(vec![ScriptedResponse::ok(success_body(
        "r10",
        vec![json!(7)],
    ))]);
    let cluster = make_cluster(transport);

    let result = cluster
        .execute_query(
            "SELECT RAW 7",
            QueryOptions::new().deserializer(Arc::new(Annotating)),
        )
        .await?;
    let row: Value = result.rows().next().unwrap().as_type()?;
    assert_eq!(row, json!({"annotated": 7}));
    Ok(())
}
