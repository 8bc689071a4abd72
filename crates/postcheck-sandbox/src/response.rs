//! The mocked HTTP response a script inspects.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Response body: raw text or an already-parsed JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    /// Body text as received.
    Text(String),
    /// Structured body.
    Json(serde_json::Value),
}

impl Default for ResponseBody {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// Declared content type of the body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// `application/json`.
    #[default]
    Json,
    /// `text/html`.
    Html,
}

/// Ordered header list with case-insensitive lookup.
///
/// Serializes as a JSON object in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header. Existing entries with the same name are kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of header names to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
                let mut headers = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    headers.push((k, v));
                }
                Ok(Headers(headers))
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

/// A mocked HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockResponse {
    /// Response body.
    #[serde(default)]
    pub body: ResponseBody,
    /// Declared content type.
    #[serde(default)]
    pub content_type: ContentType,
    /// Response headers.
    #[serde(default)]
    pub headers: Headers,
    /// Raw `Set-Cookie` style cookie strings (`name=value; attrs`).
    #[serde(default)]
    pub cookies: Vec<String>,
    /// HTTP status code.
    #[serde(default = "default_status")]
    pub status_code: u16,
    /// Round-trip time in milliseconds.
    #[serde(default)]
    pub response_time_ms: u64,
}

fn default_status() -> u16 {
    200
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            body: ResponseBody::default(),
            content_type: ContentType::default(),
            headers: Headers::default(),
            cookies: Vec::new(),
            status_code: default_status(),
            response_time_ms: 0,
        }
    }
}

impl MockResponse {
    /// A 200 response with a JSON body.
    pub fn json(body: serde_json::Value) -> Self {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/json");
        Self {
            body: ResponseBody::Json(body),
            content_type: ContentType::Json,
            headers,
            ..Self::default()
        }
    }

    /// A 200 response with an HTML body.
    pub fn html(markup: impl Into<String>) -> Self {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/html; charset=utf-8");
        Self {
            body: ResponseBody::Text(markup.into()),
            content_type: ContentType::Html,
            headers,
            ..Self::default()
        }
    }

    /// Build a response from raw body bytes. Invalid UTF-8 is replaced.
    pub fn from_bytes(status_code: u16, content_type: ContentType, bytes: &[u8]) -> Self {
        Self {
            body: ResponseBody::Text(String::from_utf8_lossy(bytes).into_owned()),
            content_type,
            status_code,
            ..Self::default()
        }
    }

    /// Set the status code.
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Append a cookie string.
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookies.push(cookie.into());
        self
    }

    /// Set the response time.
    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = ms;
        self
    }

    /// Body as text. JSON bodies are serialized compactly.
    pub fn body_text(&self) -> String {
        match &self.body {
            ResponseBody::Text(text) => text.clone(),
            ResponseBody::Json(value) => value.to_string(),
        }
    }

    /// Body parsed as JSON.
    pub fn body_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match &self.body {
            ResponseBody::Json(value) => Ok(value.clone()),
            ResponseBody::Text(text) => serde_json::from_str(text),
        }
    }

    /// Reason phrase for the status code (`"OK"` for 200).
    pub fn status_text(&self) -> &'static str {
        reason_phrase(self.status_code)
    }
}

/// Standard reason phrase for an HTTP status code, or `""` if unknown.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
