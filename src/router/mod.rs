//! Request path helpers
//!
//! Resolves upload identifiers from paths and query strings, and builds the
//! `Location` URLs handed back to clients after creation.

use hyper::header::HeaderMap;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashMap;

/// Characters escaped in generated query values
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Query parameter carrying the upload id in X-header URLs
pub const UPLOAD_ID_PARAM: &str = "upload_id";

/// Parse a query string into decoded key/value pairs
pub fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(q) = query {
        for pair in q.split('&').filter(|p| !p.is_empty()) {
            let mut kv = pair.splitn(2, '=');
            if let Some(key) = kv.next() {
                let value = kv.next().unwrap_or("");
                params.insert(decode(key), decode(value));
            }
        }
    }
    params
}

fn decode(s: &str) -> String {
    let s = s.replace('+', " ");
    percent_decode_str(&s).decode_utf8_lossy().into_owned()
}

/// Whether `path` lies under `prefix` on a segment boundary.
///
/// `/uploads2/x` is not under `/uploads`.
pub fn matches_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Extract the upload id from the part of `path` after the mount `prefix`.
///
/// Returns `None` when the path is outside the prefix or nothing follows it.
pub fn id_from_path(path: &str, prefix: &str) -> Option<String> {
    if !matches_prefix(path, prefix) {
        return None;
    }
    let prefix = prefix.trim_end_matches('/');
    let suffix = path[prefix.len()..].trim_matches('/');
    if suffix.is_empty() {
        return None;
    }
    Some(percent_decode_str(suffix).decode_utf8_lossy().into_owned())
}

/// Resolve an id, preferring explicit `name` / `upload_id` query parameters
/// over the path suffix.
pub fn id_from_request(path: &str, query: Option<&str>, prefix: &str) -> Option<String> {
    let params = parse_query(query);
    params
        .get("name")
        .or_else(|| params.get(UPLOAD_ID_PARAM))
        .filter(|v| !v.is_empty())
        .cloned()
        .or_else(|| id_from_path(path, prefix))
}

/// Scheme and authority the client used, e.g. `https://uploads.example.com`.
///
/// Honors `X-Forwarded-Proto` / `X-Forwarded-Host`; `None` without a host.
pub fn base_url(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let proto = header("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = header("x-forwarded-host").or_else(|| header("host"))?;
    Some(format!("{}://{}", proto, host))
}

fn with_base(headers: &HeaderMap, relative: bool, path: String) -> String {
    if relative {
        return path;
    }
    match base_url(headers) {
        Some(base) => format!("{}{}", base, path),
        None => path,
    }
}

/// `Location` for a tus upload: the collection path with the id appended,
/// keeping the original query.
pub fn upload_location(
    headers: &HeaderMap,
    path: &str,
    query: Option<&str>,
    id: &str,
    relative: bool,
) -> String {
    let mut location = format!(
        "{}/{}",
        path.trim_end_matches('/'),
        utf8_percent_encode(id, QUERY_VALUE)
    );
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        location.push('?');
        location.push_str(q);
    }
    with_base(headers, relative, location)
}

/// `Location` for an X-header upload: the request path with the id set as
/// the `upload_id` query parameter.
pub fn upload_id_location(
    headers: &HeaderMap,
    path: &str,
    query: Option<&str>,
    id: &str,
    relative: bool,
) -> String {
    let mut pairs: Vec<String> = query
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty())
        .filter(|p| p.split('=').next() != Some(UPLOAD_ID_PARAM))
        .map(str::to_string)
        .collect();
    pairs.push(format!(
        "{}={}",
        UPLOAD_ID_PARAM,
        utf8_percent_encode(id, QUERY_VALUE)
    ));

    with_base(headers, relative, format!("{}?{}", path, pairs.join("&")))
}
