//! Concrete storage backends and the helpers they share.

pub mod azure;
pub mod local;
pub mod oss;
pub mod swift;
pub mod xml;

use crate::{
    errors::{StorageError, StorageResult},
    models::metadata::Metadata,
};
use http::HeaderMap;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

const MAX_OBJECT_NAME_LEN: usize = 1024;

/// Characters left as-is in a single path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Object names keep their `/` so pseudo-folders stay readable on the wire.
const OBJECT_NAME: &AsciiSet = &SEGMENT.remove(b'/');

pub(crate) fn container_path(container: &str) -> String {
    format!("/{}", utf8_percent_encode(container, SEGMENT))
}

pub(crate) fn object_path(container: &str, object: &str) -> String {
    format!(
        "/{}/{}",
        utf8_percent_encode(container, SEGMENT),
        utf8_percent_encode(object, OBJECT_NAME)
    )
}

/// Reject object names no backend can address.
pub(crate) fn ensure_object_name(name: &str) -> StorageResult<()> {
    if name.is_empty()
        || name.len() > MAX_OBJECT_NAME_LEN
        || name.starts_with('/')
        || name.bytes().any(|b| b.is_ascii_control())
    {
        return Err(StorageError::InvalidObjectName(name.to_string()));
    }
    Ok(())
}

/// User metadata as `{prefix}{key}` request headers.
pub(crate) fn meta_headers(prefix: &str, meta: &Metadata) -> Vec<(String, String)> {
    meta.iter()
        .map(|(k, v)| (format!("{}{}", prefix, k.to_ascii_lowercase()), v.to_string()))
        .collect()
}

/// Collect `{prefix}*` response headers back into user metadata.
pub(crate) fn meta_from_headers(prefix: &str, headers: &HeaderMap) -> Metadata {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(prefix)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `Content-Length` of a HEAD/GET response.
pub(crate) fn content_length(headers: &HeaderMap) -> StorageResult<u64> {
    header_str(headers, "content-length")
        .ok_or_else(|| StorageError::MalformedResponse("missing Content-Length".into()))?
        .parse()
        .map_err(|_| StorageError::MalformedResponse("invalid Content-Length".into()))
}

/// Copy the listed response headers into provider metadata under new keys.
pub(crate) fn extra_from_headers(headers: &HeaderMap, mapping: &[(&str, &str)]) -> Metadata {
    mapping
        .iter()
        .filter_map(|(header, key)| header_str(headers, header).map(|v| (*key, v.to_string())))
        .collect()
}
