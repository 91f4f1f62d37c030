//! Recorded responses and their stored representation.
//!
//! A [`CachedResponse`] is written to the store as JSON. Two shapes are read back:
//!
//! - the canonical envelope written by this crate:
//!   `{"cached_response": {"body": "<base64>", "status": 200, "headers": {"name": ["<base64>"]}, "path": "/x", "original_key": "k"}}`
//! - the legacy flat map written by earlier deployments, with a plain-text
//!   body and a camel-cased `originalKey`:
//!   `{"body": "...", "status": 200, "headers": {...}, "path": "x", "originalKey": "k"}`
//!
//! A legacy map is only accepted when all five keys are present. Missing keys
//! or values of the wrong JSON type are reported as
//! [`ErrorKind::CorruptedCacheData`](crate::ErrorKind::CorruptedCacheData);
//! well-formed but invalid values (status below 1, empty path) as
//! [`ErrorKind::InvalidCachedValue`](crate::ErrorKind::InvalidCachedValue).

use {
    crate::{Error, Result},
    axum::{body::Body, body::Bytes, response::Response},
    base64::{Engine, engine::general_purpose::STANDARD as BASE64},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    std::collections::BTreeMap,
};

/// Header added to every replayed response, carrying the original idempotency key.
pub const RELAYED_HEADER: HeaderName = HeaderName::from_static("idempotency-relayed");

/// Header name → raw values, in name order.
pub type CachedHeaders = BTreeMap<String, Vec<HeaderValue>>;

const LEGACY_KEYS: [&str; 5] = ["body", "status", "headers", "path", "originalKey"];

/// Snapshot of a response produced for an idempotency key.
///
/// Constructed once after the downstream handler responds and never mutated
/// afterwards; every constructor enforces a non-empty body, path and key and a
/// valid HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    body: Bytes,
    status: StatusCode,
    headers: CachedHeaders,
    path: String,
    original_key: String,
}

impl CachedResponse {
    /// Creates a validated snapshot.
    ///
    /// ```rust
    /// use axum_idempotency::CachedResponse;
    ///
    /// let cached = CachedResponse::new("{\"ok\":true}", 200, Default::default(), "/account", "K").unwrap();
    /// assert_eq!(cached.path(), "/account");
    ///
    /// assert!(CachedResponse::new("", 200, Default::default(), "/account", "K").is_err());
    /// ```
    pub fn new(
        body: impl Into<Bytes>,
        status: u16,
        headers: CachedHeaders,
        path: impl Into<String>,
        original_key: impl Into<String>,
    ) -> Result<Self> {
        Self::build(
            body.into(),
            i64::from(status),
            headers,
            path.into(),
            original_key.into(),
        )
    }

    fn build(
        body: Bytes,
        status: i64,
        headers: CachedHeaders,
        path: String,
        original_key: String,
    ) -> Result<Self> {
        if body.is_empty() {
            return Err(Error::invalid_value("Cached response body cannot be empty."));
        }

        let status = u16::try_from(status)
            .ok()
            .filter(|code| *code >= 1)
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| {
                Error::invalid_value(format!(
                    "Invalid HTTP status code provided for cached response. Status: {status}"
                ))
            })?;

        if path.is_empty() {
            return Err(Error::invalid_value("Cached response path cannot be empty."));
        }

        if original_key.is_empty() {
            return Err(Error::invalid_value(
                "Cached response original key cannot be empty.",
            ));
        }

        Ok(Self {
            body,
            status,
            headers,
            path,
            original_key,
        })
    }

    /// Snapshots a response that was just produced by the downstream handler.
    pub fn from_response_parts(
        status: StatusCode,
        headers: &HeaderMap,
        body: Bytes,
        path: impl Into<String>,
        original_key: impl Into<String>,
    ) -> Result<Self> {
        let mut cached_headers = CachedHeaders::new();
        for name in headers.keys() {
            let values = headers.get_all(name).iter().cloned().collect();
            cached_headers.insert(name.as_str().to_string(), values);
        }

        Self::new(body, status.as_u16(), cached_headers, path, original_key)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &CachedHeaders {
        &self.headers
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn original_key(&self) -> &str {
        &self.original_key
    }

    /// Rebuilds the recorded response and marks it with [`RELAYED_HEADER`].
    pub fn to_replay_response(&self) -> Result<Response> {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (name, values) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                Error::invalid_value(format!("Cached header name '{name}' is invalid: {e}"))
            })?;
            for value in values {
                headers.append(name.clone(), value.clone());
            }
        }

        let relayed = HeaderValue::from_bytes(self.original_key.as_bytes()).map_err(|e| {
            Error::invalid_value(format!("Cached original key cannot be sent as a header: {e}"))
        })?;
        headers.insert(RELAYED_HEADER, relayed);

        Ok(response)
    }

    /// Serializes to the canonical stored form.
    pub fn encode(&self) -> Result<Bytes> {
        let envelope = CanonicalEnvelope {
            cached_response: CanonicalEntry {
                body: BASE64.encode(&self.body),
                status: self.status.as_u16(),
                headers: self
                    .headers
                    .iter()
                    .map(|(name, values)| {
                        let encoded = values.iter().map(|v| BASE64.encode(v.as_bytes())).collect();
                        (name.clone(), encoded)
                    })
                    .collect(),
                path: self.path.clone(),
                original_key: self.original_key.clone(),
            },
        };
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| Error::internal(format!("Failed to encode cached response: {e}")))
    }

    /// Decodes a stored payload in canonical or legacy form.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let stored: StoredPayload = serde_json::from_slice(payload).map_err(|_| {
            Error::corrupted(
                "Unexpected cache payload found. Expected a cached response or legacy map.",
            )
        })?;

        match stored {
            StoredPayload::Canonical(envelope) => envelope.cached_response.try_into(),
            StoredPayload::Legacy(map) => decode_legacy(map),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredPayload {
    Canonical(CanonicalEnvelope),
    Legacy(Map<String, Value>),
}

#[derive(Serialize, Deserialize)]
struct CanonicalEnvelope {
    cached_response: CanonicalEntry,
}

/// Body and header values are base64 so arbitrary bytes survive the round trip.
#[derive(Serialize, Deserialize)]
struct CanonicalEntry {
    body: String,
    status: u16,
    headers: BTreeMap<String, Vec<String>>,
    path: String,
    original_key: String,
}

impl TryFrom<CanonicalEntry> for CachedResponse {
    type Error = Error;

    fn try_from(entry: CanonicalEntry) -> Result<Self> {
        let body = BASE64
            .decode(entry.body.as_bytes())
            .map_err(|e| Error::corrupted(format!("Cached response body is not base64: {e}")))?;

        let mut headers = CachedHeaders::new();
        for (name, values) in entry.headers {
            let values = values
                .iter()
                .map(|value| {
                    let raw = BASE64.decode(value.as_bytes()).map_err(|e| {
                        Error::corrupted(format!("Cached value of header '{name}' is not base64: {e}"))
                    })?;
                    HeaderValue::from_bytes(&raw).map_err(|e| {
                        Error::invalid_value(format!("Cached value of header '{name}' is invalid: {e}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            headers.insert(name, values);
        }

        CachedResponse::new(body, entry.status, headers, entry.path, entry.original_key)
    }
}

fn decode_legacy(map: Map<String, Value>) -> Result<CachedResponse> {
    if let Some(missing) = LEGACY_KEYS.iter().find(|key| !map.contains_key(**key)) {
        return Err(Error::corrupted(format!(
            "Legacy cached map is missing key: {missing}"
        )));
    }

    let body = legacy_text(&map, "body")?;
    let status = legacy_status(&map["status"])?;
    let headers = legacy_headers(&map["headers"])?;
    let path = legacy_text(&map, "path")?;
    let original_key = legacy_text(&map, "originalKey")?;

    CachedResponse::build(Bytes::from(body), status, headers, path, original_key)
}

fn legacy_text(map: &Map<String, Value>, key: &str) -> Result<String> {
    match &map[key] {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(Error::corrupted(format!(
            "Legacy cached field '{key}' must be text, found {other}"
        ))),
    }
}

fn legacy_status(value: &Value) -> Result<i64> {
    let status = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    status.ok_or_else(|| {
        Error::corrupted(format!(
            "Legacy cached field 'status' must be an integer, found {value}"
        ))
    })
}

fn legacy_headers(value: &Value) -> Result<CachedHeaders> {
    let corrupted = || {
        Error::corrupted(format!(
            "Legacy cached field 'headers' must map names to values, found {value}"
        ))
    };

    match value {
        Value::Object(entries) => {
            let mut headers = CachedHeaders::new();
            for (name, values) in entries {
                let texts = match values {
                    Value::String(s) => vec![s.clone()],
                    Value::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => Ok(s.clone()),
                            Value::Number(n) => Ok(n.to_string()),
                            _ => Err(corrupted()),
                        })
                        .collect::<Result<Vec<_>>>()?,
                    _ => return Err(corrupted()),
                };
                let values = texts
                    .iter()
                    .map(|text| {
                        HeaderValue::from_str(text).map_err(|e| {
                            Error::invalid_value(format!(
                                "Cached value of header '{name}' is invalid: {e}"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                headers.insert(name.clone(), values);
            }
            Ok(headers)
        }
        // An empty header list was historically written as an empty array.
        Value::Array(items) if items.is_empty() => Ok(CachedHeaders::new()),
        Value::Null => Ok(CachedHeaders::new()),
        _ => Err(corrupted()),
    }
}
