//! Row values and pluggable deserialization.

use std::fmt;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Converts raw row bytes into JSON values before they are mapped onto the
/// caller's type.
///
/// The default is [`JsonDeserializer`]; a per-request deserializer set via
/// query options overrides the per-cluster one. Implementations that wrap
/// or annotate the raw bytes (test fixtures do) hook in here.
pub trait Deserializer: Send + Sync + fmt::Debug {
    /// Decode one raw JSON value into an owned [`serde_json::Value`].
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// Default deserializer backed by serde_json.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDeserializer;

impl Deserializer for JsonDeserializer {
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(Error::data_conversion)
    }
}

/// One element of the `results` array: raw JSON bytes plus the
/// deserializer chosen for the request.
///
/// In streaming mode the byte slice is only valid for the duration of the
/// row callback; buffered results copy the bytes and hand out rows that
/// borrow from the buffer.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    bytes: &'a [u8],
    deserializer: &'a dyn Deserializer,
}

impl<'a> Row<'a> {
    pub(crate) fn new(bytes: &'a [u8], deserializer: &'a dyn Deserializer) -> Self {
        Row {
            bytes,
            deserializer,
        }
    }

    /// The row's raw JSON.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Decode the row into `T`. A JSON `null` row is a conversion error;
    /// use [`Row::as_nullable`] when null is an expected value.
    pub fn as_type<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.deserializer.decode(self.bytes)?;
        if value.is_null() {
            return Err(Error::data_conversion(
                "row is JSON null; use as_nullable to permit it".to_owned(),
            ));
        }
        serde_json::from_value(value).map_err(Error::data_conversion)
    }

    /// Decode the row into `T`, mapping a JSON `null` row to `None`.
    pub fn as_nullable<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let value = self.deserializer.decode(self.bytes)?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(Error::data_conversion)
    }
}
