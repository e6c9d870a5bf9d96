//! Failure taxonomy for analytics operations.
//!
//! Every failure a caller can observe is classified into exactly one
//! [`Error`] variant. Server-reported failures carry the parsed
//! [`ErrorRecord`]s; everything else is classified from where in the
//! request lifecycle it happened.

use serde::Deserialize;
use serde_json::{Map, Value};

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Opaque error type handed back from user callbacks and wrapped sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server answered with one or more error records.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// The server rejected the request with HTTP 401.
    #[error("invalid credentials: analytics endpoint returned HTTP 401")]
    InvalidCredentials,

    /// The caller's timeout expired, either mid-attempt or because the next
    /// backoff delay would have slept past the deadline.
    #[error("analytics operation timed out")]
    Timeout {
        /// The most recent retriable server error, when the retry loop ran
        /// out of time while backing off.
        #[source]
        last_error: Option<QueryError>,
    },

    /// Cooperative cancellation was observed at an I/O or sleep point.
    #[error("analytics operation was cancelled")]
    Cancelled,

    /// The TLS handshake with the endpoint failed.
    #[error("TLS handshake failed: {guidance}")]
    TlsHandshake {
        guidance: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Connect/read failures not otherwise classified.
    #[error("transport failure")]
    Transport {
        #[source]
        source: BoxError,
    },

    /// Truncated or malformed response JSON, or a well-formed response that
    /// does not look like a query response at all.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// A row or metadata value could not be decoded into the requested type.
    #[error("data conversion failed")]
    DataConversion {
        #[source]
        source: BoxError,
    },

    /// The caller's row callback returned an error. The original error is
    /// preserved as the source; the query is never retried because of it.
    #[error("row callback failed")]
    RowCallback(#[source] BoxError),

    /// Invalid caller input: malformed connection string, backticked names,
    /// credential rotation across variants, and the like.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

impl Error {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(source: impl Into<BoxError>) -> Self {
        Error::Transport {
            source: source.into(),
        }
    }

    pub(crate) fn data_conversion(source: impl Into<BoxError>) -> Self {
        Error::DataConversion {
            source: source.into(),
        }
    }

    /// True iff the retry loop may re-dispatch the request.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Query(e) if e.is_retriable())
    }
}

/// One entry of the server's `errors` (or `warnings`) array.
///
/// Analytics responses mark retriable entries with `retriable` while some
/// query-service responses use `retry`; both spellings are accepted.
/// Sibling fields we do not model are gathered into `context`.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorRecord {
    #[serde(default)]
    pub code: i64,
    #[serde(default, alias = "msg")]
    pub message: String,
    #[serde(default, alias = "retry")]
    pub retriable: bool,
    #[serde(default)]
    pub reason: Map<String, Value>,
    #[serde(flatten)]
    pub context: Map<String, Value>,
}

impl ErrorRecord {
    /// Fallback for bodies that are not JSON at all.
    pub(crate) fn from_plaintext(body: &str) -> Self {
        ErrorRecord {
            code: 0,
            message: body.trim().to_owned(),
            retriable: false,
            reason: Map::new(),
            context: Map::new(),
        }
    }
}

/// A failed query: the primary server error record plus any additional
/// records that arrived with it.
///
/// The primary record is the first non-retriable one, or the first record
/// when all of them are retriable. The query is retriable iff the primary
/// record is.
#[derive(Debug, Clone, thiserror::Error)]
#[error("analytics server error {}: {}", .primary.code, .primary.message)]
pub struct QueryError {
    primary: ErrorRecord,
    others: Vec<ErrorRecord>,
}

/// Error code the analytics service uses for "service unavailable".
const SERVICE_UNAVAILABLE_CODE: i64 = 23000;

impl QueryError {
    /// Returns `None` when `records` is empty.
    pub(crate) fn from_records(mut records: Vec<ErrorRecord>) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        let primary_idx = records.iter().position(|r| !r.retriable).unwrap_or(0);
        let primary = records.remove(primary_idx);
        Some(QueryError {
            primary,
            others: records,
        })
    }

    /// Synthesized for HTTP 503 responses whose body is not a query
    /// response: an intermediary answered for the service, so report it the
    /// way the server itself would, retriably.
    pub(crate) fn service_unavailable() -> Self {
        QueryError {
            primary: ErrorRecord {
                code: SERVICE_UNAVAILABLE_CODE,
                message: "service not available from intermediary".to_owned(),
                retriable: true,
                reason: Map::new(),
                context: Map::new(),
            },
            others: Vec::new(),
        }
    }

    pub fn code(&self) -> i64 {
        self.primary.code
    }

    pub fn message(&self) -> &str {
        &self.primary.message
    }

    pub fn is_retriable(&self) -> bool {
        self.primary.retriable
    }

    pub fn primary(&self) -> &ErrorRecord {
        &self.primary
    }

    /// The non-primary records that accompanied the failure.
    pub fn other_records(&self) -> &[ErrorRecord] {
        &self.others
    }
}

/// Parse a complete (non-streamed) error body of the form
/// `{"errors": [...]}`. Returns `None` if the body does not conform.
pub(crate) fn parse_error_body(body: &[u8]) -> Option<Vec<ErrorRecord>> {
    #[derive(Deserialize)]
    struct ErrorBody {
        errors: Vec<ErrorRecord>,
    }

    serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .map(|b| b.errors)
        .filter(|errors| !errors.is_empty())
}
