//! Per-query options and request-body assembly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::row::Deserializer;

/// Read visibility for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanConsistency {
    /// Results may lag ingestion; the fastest option.
    NotBounded,
    /// The query waits until everything ingested before the request is
    /// visible.
    RequestPlus,
}

impl ScanConsistency {
    fn wire_name(&self) -> &'static str {
        match self {
            ScanConsistency::NotBounded => "not_bounded",
            ScanConsistency::RequestPlus => "request_plus",
        }
    }
}

/// Namespace a query runs in: `default:`db`.`scope``.
#[derive(Debug, Clone)]
pub struct QueryContext {
    database: String,
    scope: String,
}

impl QueryContext {
    /// Backticks cannot be escaped inside the rendered context, so names
    /// containing them are rejected outright.
    pub(crate) fn new(database: impl Into<String>, scope: impl Into<String>) -> Result<Self> {
        let database = database.into();
        let scope = scope.into();
        for name in [&database, &scope] {
            if name.contains('`') {
                return Err(Error::invalid_argument(format!(
                    "database and scope names must not contain backticks: {name:?}"
                )));
            }
        }
        Ok(QueryContext { database, scope })
    }

    fn render(&self) -> String {
        format!("default:`{}`.`{}`", self.database, self.scope)
    }
}

/// Options for a single query. Build one with the `with_*` methods and pass
/// it by reference; the executor treats it as an immutable snapshot.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub(crate) timeout: Option<Duration>,
    pub(crate) deserializer: Option<Arc<dyn Deserializer>>,
    client_context_id: Option<String>,
    scan_consistency: Option<ScanConsistency>,
    scan_wait: Option<Duration>,
    positional_parameters: Vec<Value>,
    named_parameters: BTreeMap<String, Value>,
    readonly: Option<bool>,
    raw: BTreeMap<String, Value>,
}

impl QueryOptions {
    pub fn new() -> Self {
        QueryOptions::default()
    }

    /// Overall timeout for this query, retries included. Defaults to the
    /// cluster-wide query timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fixed client context id. When unset a fresh UUID is minted for every
    /// attempt, which is what you want for retry observability.
    pub fn client_context_id(mut self, id: impl Into<String>) -> Self {
        self.client_context_id = Some(id.into());
        self
    }

    pub fn scan_consistency(mut self, consistency: ScanConsistency) -> Self {
        self.scan_consistency = Some(consistency);
        self
    }

    /// Maximum staleness wait; only sent when the scan consistency requires
    /// the server to wait.
    pub fn scan_wait(mut self, wait: Duration) -> Self {
        self.scan_wait = Some(wait);
        self
    }

    pub fn positional_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.positional_parameters = parameters;
        self
    }

    /// Named parameter; `$` is prepended to the name unless already there.
    pub fn named_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.named_parameters.insert(name.into(), value);
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = Some(readonly);
        self
    }

    /// Escape hatch: merged verbatim into the top level of the request
    /// body, after everything else.
    pub fn raw(mut self, name: impl Into<String>, value: Value) -> Self {
        self.raw.insert(name.into(), value);
        self
    }

    /// Deserializer for this query's rows, overriding the cluster default.
    pub fn deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.deserializer = Some(deserializer);
        self
    }
}

/// Extra room granted to the server so it can return a structured timeout
/// error before the client-side deadline fires.
const SERVER_TIMEOUT_PADDING: Duration = Duration::from_secs(5);

pub(crate) struct BuiltRequest {
    pub body: Bytes,
    pub client_context_id: String,
}

/// Assemble the request body for one attempt. Called once per attempt so
/// that auto-generated client context ids are fresh on every retry.
pub(crate) fn build_request_body(
    statement: &str,
    context: Option<&QueryContext>,
    options: &QueryOptions,
    attempt_timeout: Duration,
) -> BuiltRequest {
    let mut body = Map::new();
    body.insert("statement".to_owned(), Value::from(statement));

    let server_timeout = attempt_timeout + SERVER_TIMEOUT_PADDING;
    body.insert(
        "timeout".to_owned(),
        Value::from(format!("{}ms", server_timeout.as_millis())),
    );

    if let Some(context) = context {
        body.insert("query_context".to_owned(), Value::from(context.render()));
    }

    let client_context_id = options
        .client_context_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    body.insert(
        "client_context_id".to_owned(),
        Value::from(client_context_id.clone()),
    );

    if let Some(consistency) = options.scan_consistency {
        body.insert(
            "scan_consistency".to_owned(),
            Value::from(consistency.wire_name()),
        );
        if consistency != ScanConsistency::NotBounded {
            if let Some(wait) = options.scan_wait {
                body.insert(
                    "scan_wait".to_owned(),
                    Value::from(format!("{}ms", wait.as_millis())),
                );
            }
        }
    }

    if !options.positional_parameters.is_empty() {
        body.insert(
            "args".to_owned(),
            Value::Array(options.positional_parameters.clone()),
        );
    }

    for (name, value) in &options.named_parameters {
        let key = if name.starts_with('$') {
            name.clone()
        } else {
            format!("${name}")
        };
        body.insert(key, value.clone());
    }

    if let Some(readonly) = options.readonly {
        body.insert("readonly".to_owned(), Value::from(readonly));
    }

    for (name, value) in &options.raw {
        body.insert(name.clone(), value.clone());
    }

    let body = serde_json::to_vec(&Value::Object(body))
        .expect("json serialization should not fail");
    BuiltRequest {
        body: Bytes::from(body),
        client_context_id,
    }
}
