//! Buffered query results and post-hoc metadata decoding.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

use crate::error::{Error, ErrorRecord, Result};
use crate::parser::ResponseFields;
use crate::row::{Deserializer, Row};

/// Everything the server said about a completed query, minus the rows.
///
/// The raw `metrics` and `warnings` bytes are kept verbatim and decoded on
/// access.
#[derive(Debug, Clone)]
pub struct QueryMetadata {
    request_id: String,
    client_context_id: Option<String>,
    status: Option<String>,
    signature: Option<Bytes>,
    plans: Option<Bytes>,
    metrics: Option<Bytes>,
    warnings: Option<Bytes>,
}

impl QueryMetadata {
    pub(crate) fn new(request_id: String, fields: ResponseFields) -> Self {
        QueryMetadata {
            request_id,
            client_context_id: fields.client_context_id,
            status: fields.status,
            signature: fields.signature,
            plans: fields.plans,
            metrics: fields.metrics,
            warnings: fields.warnings,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn client_context_id(&self) -> Option<&str> {
        self.client_context_id.as_deref()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Raw JSON of the result signature, if the server sent one.
    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Raw JSON of the optimizer plans, if requested and sent.
    pub fn plans(&self) -> Option<&[u8]> {
        self.plans.as_deref()
    }

    /// Decode the execution metrics. Fields the server omitted are zero.
    pub fn metrics(&self) -> Result<QueryMetrics> {
        let Some(raw) = &self.metrics else {
            return Ok(QueryMetrics::default());
        };
        let wire: MetricsWire = serde_json::from_slice(raw).map_err(Error::data_conversion)?;
        Ok(QueryMetrics {
            elapsed_time: wire
                .elapsed_time
                .as_deref()
                .map(parse_go_duration)
                .transpose()?
                .unwrap_or_default(),
            execution_time: wire
                .execution_time
                .as_deref()
                .map(parse_go_duration)
                .transpose()?
                .unwrap_or_default(),
            result_count: wire.result_count.unwrap_or_default(),
            result_size: wire.result_size.unwrap_or_default(),
            processed_objects: wire.processed_objects.unwrap_or_default(),
        })
    }

    /// Decode the warnings that accompanied a successful response.
    pub fn warnings(&self) -> Result<Vec<QueryWarning>> {
        let Some(raw) = &self.warnings else {
            return Ok(Vec::new());
        };
        let records: Vec<ErrorRecord> =
            serde_json::from_slice(raw).map_err(Error::data_conversion)?;
        Ok(records
            .into_iter()
            .map(|r| QueryWarning {
                code: r.code,
                message: r.message,
            })
            .collect())
    }
}

/// Execution metrics reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMetrics {
    pub elapsed_time: Duration,
    pub execution_time: Duration,
    pub result_count: u64,
    pub result_size: u64,
    pub processed_objects: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricsWire {
    #[serde(default)]
    elapsed_time: Option<String>,
    #[serde(default)]
    execution_time: Option<String>,
    #[serde(default)]
    result_count: Option<u64>,
    #[serde(default)]
    result_size: Option<u64>,
    #[serde(default)]
    processed_objects: Option<u64>,
}

/// A non-fatal warning attached to an otherwise successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryWarning {
    pub code: i64,
    pub message: String,
}

/// A fully buffered query: the rows plus the metadata.
#[derive(Debug)]
pub struct QueryResult {
    rows: Vec<Bytes>,
    metadata: QueryMetadata,
    deserializer: Arc<dyn Deserializer>,
}

impl QueryResult {
    pub(crate) fn new(
        rows: Vec<Bytes>,
        metadata: QueryMetadata,
        deserializer: Arc<dyn Deserializer>,
    ) -> Self {
        QueryResult {
            rows,
            metadata,
            deserializer,
        }
    }

    pub fn rows(&self) -> impl ExactSizeIterator<Item = Row<'_>> {
        self.rows
            .iter()
            .map(|bytes| Row::new(bytes, self.deserializer.as_ref()))
    }

    pub fn metadata(&self) -> &QueryMetadata {
        &self.metadata
    }
}

/// Parse a Go-style duration string: `65000ms`, `1.5s`, `1m30.25s`,
/// `262.115µs`. The server reports elapsed/execution times in this format.
pub(crate) fn parse_go_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let malformed = || Error::data_conversion(format!("malformed duration string {input:?}"));
    if s.is_empty() {
        return Err(malformed());
    }

    let bytes = s.as_bytes();
    let mut total = Duration::ZERO;
    let mut i = 0;
    while i < bytes.len() {
        let number_start = i;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        let number: f64 = s[number_start..i].parse().map_err(|_| malformed())?;

        let unit_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_digit() && bytes[i] != b'.' {
            i += 1;
        }
        let scale_ns = match &s[unit_start..i] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 6e10,
            "h" => 3.6e12,
            _ => return Err(malformed()),
        };
        total += Duration::from_nanos((number * scale_ns).round() as u64);
    }
    Ok(total)
}
