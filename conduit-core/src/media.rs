//! Media-type body converters
//!
//! Bodies are decoded into a `serde_json::Value` tree first; typed targets
//! are then deserialized from that tree, so every converter works with every
//! `DeserializeOwned` target.

use crate::http::media_type_essence;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_PLAIN: &str = "text/plain";
pub const APPLICATION_FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub const MULTIPART_FORM_DATA: &str = "multipart/form-data";
pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";
pub const WILDCARD: &str = "*/*";

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("url-encoded decode error: {0}")]
    UrlDecode(#[from] serde_urlencoded::de::Error),

    #[error("url-encoded encode error: {0}")]
    UrlEncode(#[from] serde_urlencoded::ser::Error),

    #[error("body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("{media_type} cannot represent {value}")]
    Unrepresentable { media_type: &'static str, value: String },
}

/// Converts between a body of one media type and a value tree
pub trait MediaTypeConverter: Send + Sync {
    fn media_type(&self) -> &'static str;

    fn to_value(&self, body: &[u8]) -> Result<Value, MediaError>;

    fn to_bytes(&self, value: &Value) -> Result<Bytes, MediaError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonConverter;

impl MediaTypeConverter for JsonConverter {
    fn media_type(&self) -> &'static str {
        APPLICATION_JSON
    }

    fn to_value(&self, body: &[u8]) -> Result<Value, MediaError> {
        Ok(serde_json::from_slice(body)?)
    }

    fn to_bytes(&self, value: &Value) -> Result<Bytes, MediaError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TextConverter;

impl MediaTypeConverter for TextConverter {
    fn media_type(&self) -> &'static str {
        TEXT_PLAIN
    }

    fn to_value(&self, body: &[u8]) -> Result<Value, MediaError> {
        Ok(Value::String(std::str::from_utf8(body)?.to_owned()))
    }

    fn to_bytes(&self, value: &Value) -> Result<Bytes, MediaError> {
        Ok(match value {
            Value::String(s) => Bytes::from(s.clone()),
            other => Bytes::from(other.to_string()),
        })
    }
}

/// `application/x-www-form-urlencoded`; repeated keys become arrays
#[derive(Debug, Default, Clone, Copy)]
pub struct FormUrlEncodedConverter;

impl MediaTypeConverter for FormUrlEncodedConverter {
    fn media_type(&self) -> &'static str {
        APPLICATION_FORM_URLENCODED
    }

    fn to_value(&self, body: &[u8]) -> Result<Value, MediaError> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)?;
        let mut map = Map::new();
        for (key, value) in pairs {
            match map.get_mut(&key) {
                Some(Value::Array(values)) => values.push(Value::String(value)),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, Value::String(value)]);
                }
                None => {
                    map.insert(key, Value::String(value));
                }
            }
        }
        Ok(Value::Object(map))
    }

    fn to_bytes(&self, value: &Value) -> Result<Bytes, MediaError> {
        let Value::Object(map) = value else {
            return Err(MediaError::Unrepresentable {
                media_type: APPLICATION_FORM_URLENCODED,
                value: value.to_string(),
            });
        };
        let mut pairs = Vec::with_capacity(map.len());
        for (key, value) in map {
            match value {
                Value::Array(values) => {
                    pairs.extend(values.iter().map(|v| (key.as_str(), scalar_text(v))))
                }
                other => pairs.push((key.as_str(), scalar_text(other))),
            }
        }
        Ok(Bytes::from(serde_urlencoded::to_string(pairs)?))
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fallback used when no converter matches: JSON when the body parses as
/// JSON, plain text otherwise
#[derive(Debug, Default, Clone, Copy)]
pub struct WildcardConverter;

impl MediaTypeConverter for WildcardConverter {
    fn media_type(&self) -> &'static str {
        WILDCARD
    }

    fn to_value(&self, body: &[u8]) -> Result<Value, MediaError> {
        match serde_json::from_slice(body) {
            Ok(value) => Ok(value),
            Err(_) => TextConverter.to_value(body),
        }
    }

    fn to_bytes(&self, value: &Value) -> Result<Bytes, MediaError> {
        match value {
            Value::String(_) => TextConverter.to_bytes(value),
            other => JsonConverter.to_bytes(other),
        }
    }
}

/// Media-type → converter table with a wildcard fallback
#[derive(Clone)]
pub struct ConverterRegistry {
    converters: HashMap<String, Arc<dyn MediaTypeConverter>>,
    fallback: Arc<dyn MediaTypeConverter>,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ConverterRegistry {
    /// Only the wildcard fallback
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
            fallback: Arc::new(WildcardConverter),
        }
    }

    /// JSON, plain text and url-encoded converters plus the wildcard fallback
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(JsonConverter));
        registry.register(Arc::new(TextConverter));
        registry.register(Arc::new(FormUrlEncodedConverter));
        registry
    }

    /// Register a converter, replacing any converter for the same media type.
    ///
    /// A converter for `*/*` replaces the fallback.
    pub fn register(&mut self, converter: Arc<dyn MediaTypeConverter>) {
        let media_type = converter.media_type().to_ascii_lowercase();
        if media_type == WILDCARD {
            self.fallback = converter;
        } else {
            self.converters.insert(media_type, converter);
        }
    }

    pub fn get(&self, media_type: &str) -> Option<Arc<dyn MediaTypeConverter>> {
        self.converters.get(&media_type_essence(media_type)).cloned()
    }

    /// Converter for a content type: exact media type, then `type/*`,
    /// then the wildcard fallback
    pub fn select(&self, content_type: Option<&str>) -> Arc<dyn MediaTypeConverter> {
        let Some(content_type) = content_type else {
            return self.fallback.clone();
        };
        let essence = media_type_essence(content_type);
        if let Some(converter) = self.converters.get(&essence) {
            return converter.clone();
        }
        if let Some((top, _)) = essence.split_once('/')
            && let Some(converter) = self.converters.get(&format!("{top}/*"))
        {
            return converter.clone();
        }
        self.fallback.clone()
    }

    pub fn media_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.converters.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("media_types", &self.media_types())
            .field("fallback", &self.fallback.media_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_by_content_type() {
        let registry = ConverterRegistry::with_defaults();
        assert_eq!(
            registry.select(Some("application/json; charset=utf-8")).media_type(),
            APPLICATION_JSON
        );
        assert_eq!(registry.select(Some("TEXT/PLAIN")).media_type(), TEXT_PLAIN);
        assert_eq!(registry.select(Some("image/png")).media_type(), WILDCARD);
        assert_eq!(registry.select(None).media_type(), WILDCARD);
    }

    #[test]
    fn test_urlencoded_repeated_keys() {
        let value = FormUrlEncodedConverter
            .to_value(b"tag=a&tag=b&name=Alice+Smith")
            .unwrap();
        assert_eq!(value, json!({"tag": ["a", "b"], "name": "Alice Smith"}));

        let bytes = FormUrlEncodedConverter.to_bytes(&json!({"q": "x y"})).unwrap();
        assert_eq!(&bytes[..], b"q=x+y");
    }

    #[test]
    fn test_wildcard_falls_back_to_text() {
        assert_eq!(WildcardConverter.to_value(b"{\"a\":1}").unwrap(), json!({"a": 1}));
        assert_eq!(WildcardConverter.to_value(b"hello").unwrap(), json!("hello"));
    }

    #[test]
    fn test_text_rejects_invalid_utf8() {
        assert!(matches!(
            TextConverter.to_value(&[0xff, 0xfe]),
            Err(MediaError::Utf8(_))
        ));
    }
}
