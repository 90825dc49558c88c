//! The narrow HTTP contract every remote driver talks through.
//!
//! A [`Connection`] issues one [`Request`] and hands back a [`Response`] with
//! a status, headers and either a buffered or a streaming body. Signing,
//! addressing and credentials are the connection's business; drivers only
//! build paths, query parameters, headers and bodies.

use crate::{
    errors::{StorageError, StorageResult},
    transfer::chunks::{ByteStream, exhaust},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use http::{HeaderMap, Method, StatusCode};
use std::{fmt, io, sync::Arc};
use tracing::debug;

/// Body of an outgoing request.
pub enum RequestBody {
    Empty,
    Full(Bytes),
    /// A streamed body. `length` is sent as `Content-Length` when known;
    /// otherwise the body goes out with chunked transfer encoding.
    Stream {
        stream: ByteStream,
        length: Option<u64>,
    },
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            RequestBody::Stream { length, .. } => write!(f, "Stream(length: {:?})", length),
        }
    }
}

/// One outgoing request, relative to the connection's endpoint.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Already percent-encoded path, starting with `/`.
    pub path: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Case-insensitive lookup of the first header named `name`.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Value of the first query parameter named `key`.
    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

enum ResponseBody {
    Full(Bytes),
    Stream(ByteStream),
}

/// A response whose body has not necessarily been read yet.
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Full(body),
        }
    }

    pub fn streaming(status: StatusCode, headers: HeaderMap, body: ByteStream) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Stream(body),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Read the whole body.
    pub async fn bytes(self) -> StorageResult<Bytes> {
        match self.body {
            ResponseBody::Full(bytes) => Ok(bytes),
            ResponseBody::Stream(stream) => Ok(exhaust(stream).await?),
        }
    }

    /// Read the whole body as text, replacing invalid UTF-8.
    pub async fn text(self) -> StorageResult<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Hand the body over as a chunk stream without buffering it.
    pub fn into_stream(self) -> ByteStream {
        match self.body {
            ResponseBody::Full(bytes) if bytes.is_empty() => stream::empty().boxed(),
            ResponseBody::Full(bytes) => stream::iter([Ok(bytes)]).boxed(),
            ResponseBody::Stream(stream) => stream,
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Transport used by remote drivers.
///
/// Implementations must be usable from several tasks at once; drivers keep
/// one connection and share it across concurrent part uploads.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn request(&self, request: Request) -> StorageResult<Response>;

    /// Whether the transport frames bodies of unknown length itself. When it
    /// does not, the chunked upload path writes the chunk framing into the
    /// body.
    fn handles_chunked_framing(&self) -> bool {
        true
    }
}

#[async_trait]
impl<C: Connection + ?Sized> Connection for Arc<C> {
    async fn request(&self, request: Request) -> StorageResult<Response> {
        (**self).request(request).await
    }

    fn handles_chunked_framing(&self) -> bool {
        (**self).handles_chunked_framing()
    }
}

/// [`Connection`] over a `reqwest` client and a fixed endpoint.
#[derive(Clone, Debug)]
pub struct HttpConnection {
    client: reqwest::Client,
    base_url: String,
    default_headers: Vec<(String, String)>,
}

impl HttpConnection {
    pub fn new(base_url: impl Into<String>) -> StorageResult<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_headers: Vec::new(),
        }
    }

    /// Send `name: value` on every request (e.g. a pre-issued auth token).
    pub fn with_default_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn request(&self, request: Request) -> StorageResult<Response> {
        let url = format!("{}{}", self.base_url, request.path);
        debug!(method = %request.method, %url, "sending request");

        let mut builder = self.client.request(request.method, &url);
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        for (name, value) in self.default_headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Full(bytes) => builder.body(bytes),
            RequestBody::Stream { stream, length } => {
                let builder = match length {
                    Some(length) => builder.header(http::header::CONTENT_LENGTH, length),
                    None => builder,
                };
                builder.body(reqwest::Body::wrap_stream(stream))
            }
        };

        let response = builder.send().await.map_err(|err| {
            if err.is_builder() {
                StorageError::Library(format!("could not build request for {}: {}", url, err))
            } else {
                StorageError::Http(err)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(io::Error::other).boxed();
        Ok(Response::streaming(status, headers, body))
    }
}
