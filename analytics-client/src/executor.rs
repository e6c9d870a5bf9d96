//! Attempt orchestration and the retry loop.
//!
//! One [`QueryExecutor::execute`] call makes one or more attempts. Each
//! attempt builds a fresh request body, dispatches it, stream-parses the
//! response, and classifies the outcome; the loop retries retriable server
//! errors with exponential backoff while the caller's deadline allows and
//! no row has reached the caller yet.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::backoff::{BackoffCalculator, Deadline};
use crate::credentials::Credential;
use crate::error::{parse_error_body, BoxError, Error, ErrorRecord, QueryError, Result};
use crate::parser::ResponseParser;
use crate::request::{build_request_body, QueryContext, QueryOptions};
use crate::result::QueryMetadata;
use crate::row::{Deserializer, Row};
use crate::transport::{BodyStream, HttpTransport, TransportRequest};

/// Reading an error body is bounded; nothing legitimate comes close.
const MAX_ERROR_BODY: usize = 256 * 1024;

pub(crate) struct QueryExecutor {
    transport: Arc<dyn HttpTransport>,
    credential: Arc<ArcSwap<Credential>>,
    deserializer: Arc<dyn Deserializer>,
    default_timeout: Duration,
    backoff: BackoffCalculator,
    cancel: CancellationToken,
}

impl QueryExecutor {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credential: Arc<ArcSwap<Credential>>,
        deserializer: Arc<dyn Deserializer>,
        default_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        QueryExecutor {
            transport,
            credential,
            deserializer,
            default_timeout,
            backoff: BackoffCalculator::default(),
            cancel,
        }
    }

    pub fn default_deserializer(&self) -> Arc<dyn Deserializer> {
        self.deserializer.clone()
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// Run the query, delivering rows to `on_row` in wire order as they
    /// arrive, and return the metadata once the response is complete.
    #[instrument(name = "analytics_query", skip_all)]
    pub async fn execute<F>(
        &self,
        context: Option<&QueryContext>,
        statement: &str,
        options: &QueryOptions,
        mut on_row: F,
    ) -> Result<QueryMetadata>
    where
        F: FnMut(Row<'_>) -> std::result::Result<(), BoxError>,
    {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let deadline = Deadline::after(timeout);
        let deserializer = options
            .deserializer
            .clone()
            .unwrap_or_else(|| self.deserializer.clone());

        let mut attempt: u32 = 0;
        let mut last_retriable: Option<QueryError> = None;
        loop {
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    last_error: last_retriable,
                });
            }

            let mut rows_delivered = 0u64;
            let outcome = self
                .execute_once(
                    context,
                    statement,
                    options,
                    remaining,
                    &deserializer,
                    &mut rows_delivered,
                    &mut on_row,
                )
                .await;

            match outcome {
                Ok(metadata) => return Ok(metadata),
                // Retries must never redeliver a row, so an attempt that
                // already handed rows to the caller is committed: even a
                // retriable error surfaces.
                Err(Error::Query(e)) if e.is_retriable() && rows_delivered == 0 => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    if !deadline.has_remaining(delay) {
                        debug!(attempt, ?delay, "backoff would sleep past the deadline");
                        return Err(Error::Timeout {
                            last_error: Some(e),
                        });
                    }
                    debug!(
                        code = e.code(),
                        attempt,
                        ?delay,
                        "retrying analytics query after retriable server error"
                    );
                    last_retriable = Some(e);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                // A transport-level timeout ends the whole operation; the
                // most recent retriable error rides along for diagnosis.
                Err(Error::Timeout { last_error: None }) => {
                    return Err(Error::Timeout {
                        last_error: last_retriable,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt: build, dispatch, stream-parse, classify. Pool eviction
    /// happens here, on every outcome except clean success and row-callback
    /// failure: the connection that carried a failed exchange may sit on a
    /// degraded node, and there is no per-connection poison API.
    #[allow(clippy::too_many_arguments)]
    async fn execute_once<F>(
        &self,
        context: Option<&QueryContext>,
        statement: &str,
        options: &QueryOptions,
        attempt_timeout: Duration,
        deserializer: &Arc<dyn Deserializer>,
        rows_delivered: &mut u64,
        on_row: &mut F,
    ) -> Result<QueryMetadata>
    where
        F: FnMut(Row<'_>) -> std::result::Result<(), BoxError>,
    {
        let built = build_request_body(statement, context, options, attempt_timeout);
        debug!(
            client_context_id = %built.client_context_id,
            "dispatching analytics request"
        );
        let authorization = self.credential.load().authorization_header()?;
        let request = TransportRequest {
            body: built.body,
            authorization,
            timeout: attempt_timeout,
        };

        let result = self
            .run_attempt(request, deserializer, rows_delivered, on_row)
            .await;

        let reuse_connection = matches!(&result, Ok(_) | Err(Error::RowCallback(_)));
        if !reuse_connection {
            self.transport.evict_pooled_connections();
        }
        result
    }

    async fn run_attempt<F>(
        &self,
        request: TransportRequest,
        deserializer: &Arc<dyn Deserializer>,
        rows_delivered: &mut u64,
        on_row: &mut F,
    ) -> Result<QueryMetadata>
    where
        F: FnMut(Row<'_>) -> std::result::Result<(), BoxError>,
    {
        let response = self.transport.execute(request, &self.cancel).await?;
        match response.status {
            200 => {}
            401 => return Err(Error::InvalidCredentials),
            status => return Err(self.non_success(status, response.body).await),
        }

        let mut body = response.body;
        let mut parser = ResponseParser::new(|bytes: &[u8]| {
            *rows_delivered += 1;
            on_row(Row::new(bytes, deserializer.as_ref())).map_err(Error::RowCallback)
        });
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => parser.feed(&bytes)?,
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        let mut fields = parser.finish()?;

        let Some(request_id) = fields.request_id.take() else {
            return Err(Error::protocol(
                "response did not match expected format: requestID missing",
            ));
        };
        Ok(QueryMetadata::new(request_id, fields))
    }

    /// Classify a non-200, non-401 response from its (bounded) body.
    async fn non_success(&self, status: u16, mut body: BodyStream) -> Error {
        let mut buf = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Error::Cancelled,
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    if buf.len() > MAX_ERROR_BODY {
                        break;
                    }
                }
                Some(Err(_)) | None => break,
            }
        }

        if let Some(records) = parse_error_body(&buf) {
            if let Some(err) = QueryError::from_records(records) {
                return Error::Query(err);
            }
        }
        if status == 503 {
            // An intermediary answered for the service; retriable by
            // definition.
            return Error::Query(QueryError::service_unavailable());
        }
        // Plaintext error bodies (reverse proxies tend to produce them)
        // still surface as server errors rather than parse failures.
        if let Ok(text) = std::str::from_utf8(&buf) {
            if !text.trim().is_empty() {
                let record = ErrorRecord::from_plaintext(text);
                if let Some(err) = QueryError::from_records(vec![record]) {
                    return Error::Query(err);
                }
            }
        }
        Error::protocol(format!(
            "unexpected HTTP status {status} from analytics endpoint"
        ))
    }
}
