//! Content marshalling registry.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use riptide_core::{HttpError, HttpResult, Marshaller, Response};

/// JSON bodies (`application/json`).
#[derive(Debug, Default)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn media_types(&self) -> &[&str] {
        &["application/json"]
    }

    fn unmarshal(&self, body: &[u8]) -> HttpResult<Value> {
        serde_json::from_slice(body).map_err(HttpError::from)
    }

    fn marshal(&self, value: &Value) -> HttpResult<(&'static str, Bytes)> {
        let bytes = serde_json::to_vec(value)?;
        Ok(("application/json", Bytes::from(bytes)))
    }
}

/// Plain text bodies (`text/plain`).
#[derive(Debug, Default)]
pub struct TextMarshaller;

impl Marshaller for TextMarshaller {
    fn media_types(&self) -> &[&str] {
        &["text/plain"]
    }

    fn unmarshal(&self, body: &[u8]) -> HttpResult<Value> {
        Ok(Value::String(String::from_utf8_lossy(body).into_owned()))
    }

    fn marshal(&self, value: &Value) -> HttpResult<(&'static str, Bytes)> {
        match value {
            Value::String(text) => Ok(("text/plain", Bytes::from(text.clone().into_bytes()))),
            other => Err(HttpError::Marshal(format!(
                "text marshaller cannot encode {other:?}"
            ))),
        }
    }
}

/// Registry mapping media types to marshallers.
///
/// Later registrations take precedence, so user marshallers can shadow
/// the built-ins.
#[derive(Clone)]
pub struct MarshallerRegistry {
    entries: Vec<Arc<dyn Marshaller>>,
}

impl MarshallerRegistry {
    /// Creates a registry with the JSON and text built-ins.
    pub fn with_defaults() -> Self {
        Self {
            entries: vec![Arc::new(JsonMarshaller), Arc::new(TextMarshaller)],
        }
    }

    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers a marshaller, shadowing earlier claims on the same
    /// media types.
    pub fn register(&mut self, marshaller: Arc<dyn Marshaller>) {
        self.entries.push(marshaller);
    }

    /// The marshaller claiming `content_type`, parameters ignored.
    pub fn for_media_type(&self, content_type: &str) -> Option<Arc<dyn Marshaller>> {
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        self.entries
            .iter()
            .rev()
            .find(|m| {
                m.media_types()
                    .iter()
                    .any(|claimed| claimed.eq_ignore_ascii_case(&media_type))
            })
            .cloned()
    }

    /// Decodes an aggregated response body by its `Content-Type`,
    /// defaulting to JSON when the header is absent.
    pub fn unmarshal_response(&self, response: &Response) -> HttpResult<Value> {
        let content_type = response
            .headers()
            .get("Content-Type")
            .unwrap_or("application/json");
        let marshaller = self.for_media_type(content_type).ok_or_else(|| {
            HttpError::Marshal(format!("no marshaller registered for {content_type:?}"))
        })?;
        marshaller.unmarshal(&response.body)
    }
}

impl fmt::Debug for MarshallerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarshallerRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}
