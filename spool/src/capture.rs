//! Building request and response records from `http` types.

use std::collections::BTreeMap;

use base64::Engine;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Request, Response, Uri};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::masking::{Masker, CLEANSED_SUBSTITUTE};
use crate::schema::{RequestRecord, ResponseRecord};
use crate::Config;

/// Raw body stored in place of multipart uploads.
pub const MULTIPART_NOTICE: &str =
    "Raw body not available for multipart_form data, spool is not showing file uploads.";

const JSON_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/x-javascript",
    "text/javascript",
    "text/x-javascript",
    "text/x-json",
];
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const MULTIPART_CONTENT_TYPE: &str = "multipart/form-data";

/// Handler name, inserted into request extensions by the host router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewName(pub String);

/// Split a content-type header into media type and charset.
pub fn parse_content_type(value: &str) -> (String, Option<String>) {
    let mut parts = value.split(';');
    let media = parts.next().unwrap_or_default().trim().to_lowercase();
    let charset = parts.find_map(|p| {
        let (key, val) = p.trim().split_once('=')?;
        (key.trim().eq_ignore_ascii_case("charset"))
            .then(|| val.trim().trim_matches('"').to_lowercase())
    });
    (media, charset)
}

fn content_type(headers: &HeaderMap) -> (String, Option<String>) {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(parse_content_type)
        .unwrap_or_default()
}

/// Decode body bytes. UTF-8 is used for every charset; bodies that are not
/// valid UTF-8 yield `None`.
pub fn decode_body(bytes: &[u8], charset: Option<&str>) -> Option<String> {
    match charset {
        None | Some("utf-8") | Some("utf8") | Some("us-ascii") | Some("ascii") => {}
        Some(other) => tracing::debug!(charset = other, "unsupported charset, decoding as UTF-8"),
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => Some(s.to_string()),
        Err(e) => {
            tracing::debug!(error = %e, "body is not valid UTF-8, ignoring it");
            None
        }
    }
}

/// Pretty JSON with sorted keys and four-space indents.
fn pretty_json(value: &Value) -> Option<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut ser).ok()?;
    String::from_utf8(out).ok()
}

/// `k=v&k=v` pairs, percent-decoded. Later duplicates win.
fn decode_pairs(encoded: &str) -> BTreeMap<String, String> {
    let mut pairs = BTreeMap::new();
    for pair in encoded.split('&').filter(|p| !p.is_empty()) {
        let (key, val) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            let s = s.replace('+', " ");
            urlencoding::decode(&s)
                .map(|c| c.into_owned())
                .unwrap_or(s)
        };
        pairs.insert(decode(key), decode(val));
    }
    pairs
}

/// JSON object of the query string, or empty when there is none.
pub fn encode_query_params(uri: &Uri) -> String {
    let pairs = uri.query().map(decode_pairs).unwrap_or_default();
    if pairs.is_empty() {
        return String::new();
    }
    serde_json::to_string(&pairs).unwrap_or_default()
}

/// Body re-encoded for display: form bodies as a sorted JSON object, JSON
/// bodies pretty-printed, anything else empty.
fn display_body(raw: &str, media: &str) -> String {
    if media == FORM_CONTENT_TYPE {
        let pairs: serde_json::Map<String, Value> = decode_pairs(raw)
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        return pretty_json(&Value::Object(pairs)).unwrap_or_default();
    }
    if JSON_CONTENT_TYPES.contains(&media) {
        return match serde_json::from_str::<Value>(raw) {
            Ok(value) => pretty_json(&value).unwrap_or_else(|| raw.to_string()),
            Err(e) => {
                tracing::debug!(error = %e, "request declared JSON but did not parse");
                raw.to_string()
            }
        };
    }
    String::new()
}

fn over_limit(len: usize, max: i64) -> bool {
    max > -1 && len as i64 > max
}

/// Captures request and response data according to a config.
#[derive(Debug, Clone)]
pub struct Capture {
    masker: Masker,
    sensitive_headers: Vec<String>,
    max_request_body_size: i64,
    max_response_body_size: i64,
}

impl Capture {
    pub fn new(config: &Config) -> Self {
        let mut sensitive_headers: Vec<String> =
            config.sensitive_keys.iter().map(|k| k.to_lowercase()).collect();
        sensitive_headers.push("authorization".to_string());
        if config.hide_cookies {
            sensitive_headers.push("cookie".to_string());
        }
        Self {
            masker: Masker::new(&config.sensitive_keys),
            sensitive_headers,
            max_request_body_size: config.max_request_body_size,
            max_response_body_size: config.max_response_body_size,
        }
    }

    /// JSON object of lowercased header names, sensitive ones masked.
    pub fn encode_headers(&self, headers: &HeaderMap) -> String {
        let mut encoded = BTreeMap::new();
        for (name, value) in headers {
            let key = name.as_str().to_lowercase();
            let value = if self.sensitive_headers.contains(&key) {
                CLEANSED_SUBSTITUTE.to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            encoded.insert(key, value);
        }
        serde_json::to_string(&encoded).unwrap_or_default()
    }

    /// `(body, raw_body)` for a request, masked and size-checked.
    pub fn request_bodies(&self, headers: &HeaderMap, bytes: &[u8], path: &str) -> (String, String) {
        let (media, charset) = content_type(headers);
        if media == MULTIPART_CONTENT_TYPE {
            return (String::new(), MULTIPART_NOTICE.to_string());
        }

        let raw = decode_body(bytes, charset.as_deref()).unwrap_or_default();
        if raw.is_empty() {
            return (String::new(), String::new());
        }
        if over_limit(raw.len(), self.max_request_body_size) {
            tracing::debug!(
                path,
                size = raw.len(),
                max = self.max_request_body_size,
                "request body over limit, dropping it"
            );
            return (String::new(), String::new());
        }

        let raw = self.masker.mask_body(&raw);
        (display_body(&raw, &media), raw)
    }

    /// Build the record for an incoming request.
    pub fn request<B: AsRef<[u8]>>(&self, req: &Request<B>) -> RequestRecord {
        let path = req.uri().path().to_string();
        let mut record = RequestRecord::new(req.method().as_str(), path.as_str());
        let (body, raw_body) = self.request_bodies(req.headers(), req.body().as_ref(), &path);
        record.body = body;
        record.raw_body = raw_body;
        record.query_params = encode_query_params(req.uri());
        record.encoded_headers = self.encode_headers(req.headers());
        record.view_name = req.extensions().get::<ViewName>().map(|v| v.0.clone());
        tracing::debug!(request_id = %record.id, path = %record.path, "captured request");
        record
    }

    /// Build the record for the response to `request_id`.
    pub fn response<B: AsRef<[u8]>>(&self, request_id: Uuid, resp: &Response<B>) -> ResponseRecord {
        let (media, _) = content_type(resp.headers());
        let mut content = resp.body().as_ref();
        if over_limit(content.len(), self.max_response_body_size) {
            tracing::debug!(
                %request_id,
                size = content.len(),
                max = self.max_response_body_size,
                "response body over limit, dropping it"
            );
            content = &[];
        }

        let mut body = String::new();
        if !content.is_empty() && JSON_CONTENT_TYPES.contains(&media.as_str()) {
            match serde_json::from_slice::<Value>(content) {
                Ok(value) => body = pretty_json(&value).unwrap_or_default(),
                Err(e) => tracing::debug!(
                    %request_id,
                    error = %e,
                    "response declared JSON but did not parse"
                ),
            }
        }

        let mut headers = BTreeMap::new();
        for (name, value) in resp.headers() {
            headers.insert(
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }

        ResponseRecord {
            id: Uuid::now_v7(),
            request_id,
            status_code: resp.status().as_u16(),
            raw_body: base64::engine::general_purpose::STANDARD.encode(content),
            body,
            encoded_headers: serde_json::to_string(&headers).unwrap_or_default(),
        }
    }
}
