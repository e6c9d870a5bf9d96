//! Incremental parser for the streaming query response document.
//!
//! The response is a single JSON object whose `results` field is an
//! unbounded array. Each element is handed to the row callback as a raw
//! byte slice the moment it is complete; the sibling fields are captured
//! whether they appear before or after `results`. An `errors` sibling
//! aborts the parse with the decoded server error. The document is never
//! materialized: memory is bounded by the largest single value.

use bytes::Bytes;

use crate::error::{Error, ErrorRecord, QueryError, Result};

/// Root-object fields captured while streaming; everything except the rows.
#[derive(Debug, Default)]
pub(crate) struct ResponseFields {
    pub request_id: Option<String>,
    pub client_context_id: Option<String>,
    pub status: Option<String>,
    pub signature: Option<Bytes>,
    pub plans: Option<Bytes>,
    pub metrics: Option<Bytes>,
    pub warnings: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting the opening `{` of the root object.
    Start,
    /// Inside the root object, expecting a key or `}`.
    BeforeKey,
    /// Accumulating a key string.
    InKey,
    /// Key complete, expecting `:`.
    AfterKey,
    /// Expecting the first byte of a sibling value.
    BeforeValue,
    /// Accumulating a string sibling.
    StringValue,
    /// Accumulating a bare scalar sibling (number, bool, null).
    ScalarValue,
    /// Accumulating an object/array sibling, tracking nesting.
    ContainerValue,
    /// Sibling complete, expecting `,` or `}`.
    AfterValue,
    /// Inside the `results` array, expecting an element or `]`.
    BeforeElement,
    /// Accumulating a string element.
    ElementString,
    /// Accumulating a bare scalar element.
    ElementScalar,
    /// Accumulating an object/array element, tracking nesting.
    ElementContainer,
    /// Element emitted, expecting `,` or `]`.
    AfterElement,
    /// Root object closed; only trailing whitespace is legal.
    Done,
}

pub(crate) struct ResponseParser<F> {
    state: State,
    key: Vec<u8>,
    buf: Vec<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    fields: ResponseFields,
    on_row: F,
}

fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

impl<F> ResponseParser<F>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    pub fn new(on_row: F) -> Self {
        ResponseParser {
            state: State::Start,
            key: Vec::new(),
            buf: Vec::new(),
            depth: 0,
            in_string: false,
            escaped: false,
            fields: ResponseFields::default(),
            on_row,
        }
    }

    /// Consume the next chunk of the response body. Raises on malformed
    /// JSON, on a completed `errors` sibling, and on row-callback failure.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        let mut i = 0;
        while i < chunk.len() {
            if self.step(chunk[i])? {
                i += 1;
            }
        }
        Ok(())
    }

    /// Signal end-of-input. Truncated documents are a protocol error.
    pub fn finish(self) -> Result<ResponseFields> {
        if self.state != State::Done {
            return Err(Error::protocol("analytics response ended unexpectedly"));
        }
        Ok(self.fields)
    }

    #[cfg(test)]
    fn buffered_capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Handle one byte; returns whether it was consumed. Scalar values have
    /// no terminator of their own, so their delimiter byte is replayed in
    /// the follow-up state.
    fn step(&mut self, b: u8) -> Result<bool> {
        match self.state {
            State::Start => match b {
                _ if is_ws(b) => {}
                b'{' => self.state = State::BeforeKey,
                _ => return Err(Error::protocol("analytics response is not a JSON object")),
            },
            State::BeforeKey => match b {
                _ if is_ws(b) => {}
                b'"' => {
                    self.key.clear();
                    self.escaped = false;
                    self.state = State::InKey;
                }
                b'}' => self.state = State::Done,
                _ => return Err(Error::protocol("malformed analytics response: expected key")),
            },
            State::InKey => {
                if self.escaped {
                    self.key.push(b);
                    self.escaped = false;
                } else if b == b'\\' {
                    self.key.push(b);
                    self.escaped = true;
                } else if b == b'"' {
                    self.state = State::AfterKey;
                } else {
                    self.key.push(b);
                }
            }
            State::AfterKey => match b {
                _ if is_ws(b) => {}
                b':' => self.state = State::BeforeValue,
                _ => return Err(Error::protocol("malformed analytics response: expected ':'")),
            },
            State::BeforeValue => match b {
                _ if is_ws(b) => {}
                b'[' if self.key == b"results" => self.state = State::BeforeElement,
                _ if self.key == b"results" => {
                    return Err(Error::protocol("results field is not an array"));
                }
                b'{' | b'[' => {
                    self.begin_value(b);
                    self.depth = 1;
                    self.state = State::ContainerValue;
                }
                b'"' => {
                    self.begin_value(b);
                    self.state = State::StringValue;
                }
                _ => {
                    self.begin_value(b);
                    self.state = State::ScalarValue;
                }
            },
            State::StringValue => {
                self.buf.push(b);
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.complete_value()?;
                    self.state = State::AfterValue;
                }
            }
            State::ScalarValue => {
                if is_ws(b) || b == b',' || b == b'}' {
                    self.complete_value()?;
                    self.state = State::AfterValue;
                    return Ok(is_ws(b));
                }
                self.buf.push(b);
            }
            State::ContainerValue => {
                self.buf.push(b);
                if self.in_string {
                    if self.escaped {
                        self.escaped = false;
                    } else if b == b'\\' {
                        self.escaped = true;
                    } else if b == b'"' {
                        self.in_string = false;
                    }
                } else {
                    match b {
                        b'"' => self.in_string = true,
                        b'{' | b'[' => self.depth += 1,
                        b'}' | b']' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                self.complete_value()?;
                                self.state = State::AfterValue;
                            }
                        }
                        _ => {}
                    }
                }
            }
            State::AfterValue => match b {
                _ if is_ws(b) => {}
                b',' => self.state = State::BeforeKey,
                b'}' => self.state = State::Done,
                _ => {
                    return Err(Error::protocol(
                        "malformed analytics response: expected ',' or '}'",
                    ))
                }
            },
            State::BeforeElement => match b {
                _ if is_ws(b) => {}
                b']' => self.state = State::AfterValue,
                b'{' | b'[' => {
                    self.begin_value(b);
                    self.depth = 1;
                    self.state = State::ElementContainer;
                }
                b'"' => {
                    self.begin_value(b);
                    self.state = State::ElementString;
                }
                _ => {
                    self.begin_value(b);
                    self.state = State::ElementScalar;
                }
            },
            State::ElementString => {
                self.buf.push(b);
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.emit_row()?;
                    self.state = State::AfterElement;
                }
            }
            State::ElementScalar => {
                if is_ws(b) || b == b',' || b == b']' {
                    self.emit_row()?;
                    self.state = State::AfterElement;
                    return Ok(is_ws(b));
                }
                self.buf.push(b);
            }
            State::ElementContainer => {
                self.buf.push(b);
                if self.in_string {
                    if self.escaped {
                        self.escaped = false;
                    } else if b == b'\\' {
                        self.escaped = true;
                    } else if b == b'"' {
                        self.in_string = false;
                    }
                } else {
                    match b {
                        b'"' => self.in_string = true,
                        b'{' | b'[' => self.depth += 1,
                        b'}' | b']' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                self.emit_row()?;
                                self.state = State::AfterElement;
                            }
                        }
                        _ => {}
                    }
                }
            }
            State::AfterElement => match b {
                _ if is_ws(b) => {}
                b',' => self.state = State::BeforeElement,
                b']' => self.state = State::AfterValue,
                _ => {
                    return Err(Error::protocol(
                        "malformed analytics response: expected ',' or ']'",
                    ))
                }
            },
            State::Done => {
                if !is_ws(b) {
                    return Err(Error::protocol(
                        "trailing data after analytics response document",
                    ));
                }
            }
        }
        Ok(true)
    }

    fn begin_value(&mut self, b: u8) {
        self.buf.clear();
        self.buf.push(b);
        self.in_string = false;
        self.escaped = false;
    }

    fn emit_row(&mut self) -> Result<()> {
        (self.on_row)(&self.buf)?;
        self.buf.clear();
        Ok(())
    }

    /// A sibling value is complete; dispatch it by key.
    fn complete_value(&mut self) -> Result<()> {
        // A literal null is treated the same as an absent field.
        if self.buf != b"null" {
            match self.key.as_slice() {
                b"requestID" => self.fields.request_id = Some(self.string_value("requestID")?),
                b"clientContextID" => {
                    self.fields.client_context_id = Some(self.string_value("clientContextID")?)
                }
                b"status" => self.fields.status = Some(self.string_value("status")?),
                b"signature" => self.fields.signature = Some(Bytes::copy_from_slice(&self.buf)),
                b"plans" => self.fields.plans = Some(Bytes::copy_from_slice(&self.buf)),
                b"metrics" => self.fields.metrics = Some(Bytes::copy_from_slice(&self.buf)),
                b"warnings" => self.fields.warnings = Some(Bytes::copy_from_slice(&self.buf)),
                b"errors" => {
                    let records: Vec<ErrorRecord> =
                        serde_json::from_slice(&self.buf).map_err(|e| {
                            Error::protocol(format!("undecodable errors field: {e}"))
                        })?;
                    self.buf.clear();
                    return match QueryError::from_records(records) {
                        Some(err) => Err(Error::Query(err)),
                        None => Err(Error::protocol("errors field was empty")),
                    };
                }
                _ => {}
            }
        }
        self.buf.clear();
        Ok(())
    }

    fn string_value(&self, field: &str) -> Result<String> {
        serde_json::from_slice(&self.buf)
            .map_err(|_| Error::protocol(format!("{field} field is not a string")))
    }
}
