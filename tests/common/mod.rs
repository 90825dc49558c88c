//! Shared fixtures for the driver integration tests: a tracing hook, an
//! in-memory OSS service and a connection that replays scripted responses.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use multicloud_storage::{
    Connection, Request, RequestBody, Response, StorageResult,
    transfer::chunks::exhaust,
};
use percent_encoding::percent_decode_str;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
};
use tracing_subscriber::EnvFilter;

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a fake connection saw.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k == name)
    }
}

/// Drain a request body the way a real transport would.
async fn record(request: Request) -> StorageResult<RecordedRequest> {
    let body = match request.body {
        RequestBody::Empty => Bytes::new(),
        RequestBody::Full(bytes) => bytes,
        RequestBody::Stream { stream, .. } => exhaust(stream).await?,
    };
    Ok(RecordedRequest {
        method: request.method,
        path: request.path,
        params: request.params,
        headers: request.headers,
        body,
    })
}

fn response(
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: impl Into<Bytes>,
) -> Response {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            map.insert(name, value);
        }
    }
    Response::new(status, map, body.into())
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response {
    response(status, Vec::new(), body)
}

fn etag_header(etag: &str) -> Vec<(String, String)> {
    vec![("etag".to_string(), format!("\"{}\"", etag))]
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
    pub content_type: String,
    pub meta: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    bucket: String,
    key: String,
    content_type: String,
    meta: Vec<(String, String)>,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct OssState {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u32,
    log: Vec<RecordedRequest>,
    fail_part: Option<u32>,
    fail_commit: bool,
    ignore_range: bool,
    corrupt_etag: bool,
}

/// In-memory OSS endpoint. Clones share state, so a test can keep a handle
/// while the driver owns another.
#[derive(Clone, Default)]
pub struct FakeOss {
    state: Arc<Mutex<OssState>>,
}

impl FakeOss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(self, name: &str) -> Self {
        self.state.lock().unwrap().buckets.entry(name.to_string()).or_default();
        self
    }

    /// Reject the part with this number with a 500.
    pub fn fail_part(self, part_number: u32) -> Self {
        self.state.lock().unwrap().fail_part = Some(part_number);
        self
    }

    pub fn fail_commit(self) -> Self {
        self.state.lock().unwrap().fail_commit = true;
        self
    }

    /// Answer ranged GETs with the whole object and `200 OK`.
    pub fn ignore_range(self) -> Self {
        self.state.lock().unwrap().ignore_range = true;
        self
    }

    /// Return ETags that do not match the uploaded bytes.
    pub fn corrupt_etags(self) -> Self {
        self.state.lock().unwrap().corrupt_etag = true;
        self
    }

    pub fn put_raw(&self, bucket: &str, key: &str, data: &[u8]) {
        let object = StoredObject {
            data: Bytes::copy_from_slice(data),
            etag: md5_hex(data),
            content_type: "application/octet-stream".into(),
            meta: Vec::new(),
        };
        self.state
            .lock()
            .unwrap()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().log.clone()
    }

    /// Upload ids of every abort request received.
    pub fn aborted_uploads(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter(|r| r.method == Method::DELETE && r.has_param("uploadId"))
            .filter_map(|r| r.param("uploadId").map(str::to_string))
            .collect()
    }

    /// Part numbers of every part upload received, in arrival order.
    pub fn uploaded_parts(&self) -> Vec<(u32, usize)> {
        self.requests()
            .iter()
            .filter(|r| r.method == Method::PUT && r.has_param("partNumber"))
            .filter_map(|r| Some((r.param("partNumber")?.parse().ok()?, r.body.len())))
            .collect()
    }

    pub fn pending_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    fn handle(&self, req: &RecordedRequest) -> Response {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let decoded = percent_decode_str(&req.path).decode_utf8_lossy().into_owned();
        let trimmed = decoded.trim_start_matches('/');
        let (bucket, key) = match trimmed.split_once('/') {
            Some((bucket, key)) => (bucket.to_string(), Some(key.to_string())),
            None => (trimmed.to_string(), None),
        };

        match (req.method.as_str(), bucket.is_empty(), key) {
            ("GET", true, _) => {
                let mut xml = String::from("<ListAllMyBucketsResult><Buckets>");
                for name in state.buckets.keys() {
                    xml.push_str(&format!(
                        "<Bucket><Name>{}</Name><CreationDate>2024-01-01T00:00:00.000Z</CreationDate></Bucket>",
                        name
                    ));
                }
                xml.push_str("</Buckets></ListAllMyBucketsResult>");
                plain(StatusCode::OK, xml)
            }
            ("PUT", false, None) => {
                if state.buckets.contains_key(&bucket) {
                    return plain(StatusCode::CONFLICT, "BucketAlreadyExists");
                }
                state.buckets.insert(bucket, BTreeMap::new());
                plain(StatusCode::OK, "")
            }
            ("DELETE", false, None) => match state.buckets.get(&bucket).map(BTreeMap::len) {
                None => plain(StatusCode::NOT_FOUND, "NoSuchBucket"),
                Some(count) if count > 0 => plain(StatusCode::CONFLICT, "BucketNotEmpty"),
                Some(_) => {
                    state.buckets.remove(&bucket);
                    plain(StatusCode::NO_CONTENT, "")
                }
            },
            ("GET", false, None) => {
                let Some(objects) = state.buckets.get(&bucket) else {
                    return plain(StatusCode::NOT_FOUND, "NoSuchBucket");
                };
                let prefix = req.param("prefix").unwrap_or("");
                let marker = req.param("marker").unwrap_or("");
                let max_keys: usize = req
                    .param("max-keys")
                    .and_then(|m| m.parse().ok())
                    .unwrap_or(1000);
                let matching: Vec<(&String, &StoredObject)> = objects
                    .iter()
                    .filter(|(k, _)| k.starts_with(prefix) && k.as_str() > marker)
                    .collect();
                let truncated = matching.len() > max_keys;
                let mut xml = String::from("<ListBucketResult>");
                xml.push_str(&format!("<IsTruncated>{}</IsTruncated>", truncated));
                let page = &matching[..matching.len().min(max_keys)];
                if truncated {
                    if let Some((last, _)) = page.last() {
                        xml.push_str(&format!("<NextMarker>{}</NextMarker>", last));
                    }
                }
                for (k, obj) in page {
                    xml.push_str(&format!(
                        "<Contents><Key>{}</Key><Size>{}</Size><ETag>\"{}\"</ETag><StorageClass>Standard</StorageClass></Contents>",
                        k,
                        obj.data.len(),
                        obj.etag
                    ));
                }
                xml.push_str("</ListBucketResult>");
                plain(StatusCode::OK, xml)
            }
            ("HEAD", false, Some(key)) => {
                match state.buckets.get(&bucket).and_then(|b| b.get(&key)) {
                    None => plain(StatusCode::NOT_FOUND, ""),
                    Some(obj) => {
                        let mut headers = vec![
                            ("content-length".to_string(), obj.data.len().to_string()),
                            ("etag".to_string(), format!("\"{}\"", obj.etag)),
                            ("content-type".to_string(), obj.content_type.clone()),
                        ];
                        headers.extend(obj.meta.iter().cloned());
                        response(StatusCode::OK, headers, "")
                    }
                }
            }
            ("GET", false, Some(key)) => {
                let ignore_range = state.ignore_range;
                let Some(obj) = state.buckets.get(&bucket).and_then(|b| b.get(&key)) else {
                    return plain(StatusCode::NOT_FOUND, "NoSuchKey");
                };
                match req.header("range").filter(|_| !ignore_range) {
                    Some(range) => {
                        let spec = range.trim_start_matches("bytes=");
                        let (start, end) = spec.split_once('-').unwrap_or((spec, ""));
                        let start: usize = start.parse().unwrap_or(0);
                        let end: usize = end
                            .parse()
                            .map(|e: usize| e + 1)
                            .unwrap_or(obj.data.len())
                            .min(obj.data.len());
                        plain(StatusCode::PARTIAL_CONTENT, obj.data.slice(start..end))
                    }
                    None => plain(StatusCode::OK, obj.data.clone()),
                }
            }
            ("POST", false, Some(key)) if req.has_param("uploads") => {
                if !state.buckets.contains_key(&bucket) {
                    return plain(StatusCode::NOT_FOUND, "NoSuchBucket");
                }
                state.next_upload += 1;
                let upload_id = format!("upload-{}", state.next_upload);
                let meta = req
                    .headers
                    .iter()
                    .filter(|(k, _)| k.starts_with("x-oss-meta-"))
                    .cloned()
                    .collect();
                state.uploads.insert(
                    upload_id.clone(),
                    PendingUpload {
                        bucket,
                        key,
                        content_type: req.header("content-type").unwrap_or_default().to_string(),
                        meta,
                        parts: BTreeMap::new(),
                    },
                );
                let xml = format!(
                    "<InitiateMultipartUploadResult><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                    upload_id
                );
                plain(StatusCode::OK, xml)
            }
            ("PUT", false, Some(_)) if req.has_param("partNumber") => {
                let number: u32 = req.param("partNumber").and_then(|n| n.parse().ok()).unwrap_or(0);
                if state.fail_part == Some(number) {
                    return plain(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
                }
                let corrupt = state.corrupt_etag;
                let upload_id = req.param("uploadId").unwrap_or_default().to_string();
                let Some(upload) = state.uploads.get_mut(&upload_id) else {
                    return plain(StatusCode::NOT_FOUND, "NoSuchUpload");
                };
                let etag = if corrupt {
                    "deadbeef".to_string()
                } else {
                    md5_hex(&req.body)
                };
                upload.parts.insert(number, (etag.clone(), req.body.clone()));
                response(StatusCode::OK, etag_header(&etag.to_uppercase()), "")
            }
            ("POST", false, Some(_)) if req.has_param("uploadId") => {
                if state.fail_commit {
                    return plain(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
                }
                let upload_id = req.param("uploadId").unwrap_or_default().to_string();
                let Some(upload) = state.uploads.remove(&upload_id) else {
                    return plain(StatusCode::NOT_FOUND, "NoSuchUpload");
                };
                let manifest = String::from_utf8_lossy(&req.body).into_owned();
                let mut data = Vec::new();
                let mut count = 0;
                for part in manifest.split("<Part>").skip(1) {
                    let number: u32 = between(part, "<PartNumber>", "</PartNumber>")
                        .and_then(|n| n.parse().ok())
                        .unwrap_or(0);
                    let Some((etag, bytes)) = upload.parts.get(&number) else {
                        return plain(StatusCode::BAD_REQUEST, "InvalidPart");
                    };
                    let listed = between(part, "<ETag>", "</ETag>")
                        .unwrap_or_default()
                        .replace("&quot;", "\"");
                    if listed.trim_matches('"').to_lowercase() != *etag {
                        return plain(StatusCode::BAD_REQUEST, "InvalidPart");
                    }
                    data.extend_from_slice(bytes);
                    count += 1;
                }
                let etag = format!("{}-{}", md5_hex(&data), count);
                state.buckets.entry(upload.bucket).or_default().insert(
                    upload.key,
                    StoredObject {
                        data: Bytes::from(data),
                        etag: etag.clone(),
                        content_type: upload.content_type,
                        meta: upload.meta,
                    },
                );
                let xml = format!(
                    "<CompleteMultipartUploadResult><ETag>\"{}\"</ETag></CompleteMultipartUploadResult>",
                    etag
                );
                plain(StatusCode::OK, xml)
            }
            ("DELETE", false, Some(_)) if req.has_param("uploadId") => {
                let upload_id = req.param("uploadId").unwrap_or_default();
                match state.uploads.remove(upload_id) {
                    Some(_) => plain(StatusCode::NO_CONTENT, ""),
                    None => plain(StatusCode::NOT_FOUND, "NoSuchUpload"),
                }
            }
            ("PUT", false, Some(key)) => {
                let corrupt = state.corrupt_etag;
                let Some(objects) = state.buckets.get_mut(&bucket) else {
                    return plain(StatusCode::NOT_FOUND, "NoSuchBucket");
                };
                let etag = md5_hex(&req.body);
                let meta = req
                    .headers
                    .iter()
                    .filter(|(k, _)| k.starts_with("x-oss-meta-"))
                    .cloned()
                    .collect();
                objects.insert(
                    key,
                    StoredObject {
                        data: req.body.clone(),
                        etag: etag.clone(),
                        content_type: req.header("content-type").unwrap_or_default().to_string(),
                        meta,
                    },
                );
                let reported = if corrupt { "deadbeef".to_string() } else { etag };
                response(StatusCode::OK, etag_header(&reported), "")
            }
            ("DELETE", false, Some(key)) => {
                match state.buckets.get_mut(&bucket).and_then(|b| b.remove(&key)) {
                    Some(_) => plain(StatusCode::NO_CONTENT, ""),
                    None => plain(StatusCode::NOT_FOUND, "NoSuchKey"),
                }
            }
            _ => plain(StatusCode::METHOD_NOT_ALLOWED, "unsupported"),
        }
    }
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}

#[async_trait]
impl Connection for FakeOss {
    async fn request(&self, request: Request) -> StorageResult<Response> {
        let recorded = record(request).await?;
        let response = self.handle(&recorded);
        self.state.lock().unwrap().log.push(recorded);
        Ok(response)
    }
}

/// Canned reply for [`ScriptedConnection`].
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Reply>,
    log: Vec<RecordedRequest>,
}

/// Connection that answers with queued replies in order and records every
/// request. Runs out with `500 unscripted`.
#[derive(Clone)]
pub struct ScriptedConnection {
    script: Arc<Mutex<Script>>,
    frames_chunks: bool,
}

impl ScriptedConnection {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                replies: replies.into_iter().collect(),
                log: Vec::new(),
            })),
            frames_chunks: true,
        }
    }

    /// Behave like a raw transport that sends bodies byte for byte.
    pub fn without_chunk_framing(mut self) -> Self {
        self.frames_chunks = false;
        self
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().replies.push_back(reply);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.script.lock().unwrap().log.clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().replies.len()
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn request(&self, request: Request) -> StorageResult<Response> {
        let recorded = record(request).await?;
        let reply = {
            let mut script = self.script.lock().unwrap();
            script.log.push(recorded);
            script.replies.pop_front()
        };
        let Some(reply) = reply else {
            return Ok(plain(StatusCode::INTERNAL_SERVER_ERROR, "unscripted"));
        };
        Ok(response(reply.status, reply.headers, reply.body))
    }

    fn handles_chunked_framing(&self) -> bool {
        self.frames_chunks
    }
}
