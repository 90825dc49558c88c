//! Single-request upload strategies and the rules for picking a strategy.

use crate::{
    config::TransferConfig,
    connection::{Connection, Request, RequestBody, Response},
    errors::{StorageError, StorageResult},
    transfer::{
        chunks::{ByteStream, StreamTally, chunked, exhaust, frame_chunked},
        hashing::{HashType, normalize_etag},
    },
};
use tracing::{debug, warn};

/// How an upload is carried to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One request with a known `Content-Length`.
    Direct,
    /// One request with chunked transfer encoding.
    Chunked,
    /// Initiate, upload parts, commit.
    Multipart,
}

impl UploadStrategy {
    /// Strategy for a stream of unknown length.
    ///
    /// Chunked encoding wins when available; multipart is the fallback for
    /// backends that need a known length per request. Otherwise the stream is
    /// drained first and sent directly.
    pub fn for_stream(supports_chunked: bool, supports_multipart: bool) -> Self {
        if supports_chunked {
            UploadStrategy::Chunked
        } else if supports_multipart {
            UploadStrategy::Multipart
        } else {
            UploadStrategy::Direct
        }
    }

    /// Strategy for a file whose size is known from `stat`.
    pub fn for_file(size: u64, config: &TransferConfig, supports_multipart: bool) -> Self {
        if supports_multipart && size >= config.multipart_threshold {
            UploadStrategy::Multipart
        } else {
            UploadStrategy::Direct
        }
    }
}

/// Server response plus what was actually sent.
#[derive(Debug)]
pub struct UploadResponse {
    pub response: Response,
    pub bytes: u64,
    /// Hex digest of the bytes sent, in the driver's hash type.
    pub hash: String,
}

/// Send `source` in a single request with a known length.
///
/// With `content_length` the body is streamed as-is; without it the source
/// is drained into memory first so the length can be sent up front.
pub async fn direct_upload<C: Connection + ?Sized>(
    conn: &C,
    request: Request,
    source: ByteStream,
    content_length: Option<u64>,
    hash_type: HashType,
) -> StorageResult<UploadResponse> {
    let tally = StreamTally::new(hash_type);
    let body = match content_length {
        Some(length) => RequestBody::Stream {
            stream: tally.observe(source),
            length: Some(length),
        },
        None => {
            let data = exhaust(tally.observe(source)).await?;
            debug!(bytes = data.len(), "drained stream for direct upload");
            RequestBody::Full(data)
        }
    };

    let response = conn.request(request.with_body(body)).await?;
    if let Some(err) = tally.failure() {
        return Err(StorageError::Io(err));
    }
    let (hash, bytes) = tally.snapshot();

    if let Some(expected) = content_length {
        if bytes != expected {
            return Err(StorageError::Library(format!(
                "source produced {} bytes but {} were announced",
                bytes, expected
            )));
        }
    }

    Ok(UploadResponse {
        response,
        bytes,
        hash,
    })
}

/// Send `source` with chunked transfer encoding, `chunk_size` bytes at a
/// time.
///
/// A read error on the source aborts the request; the error is returned and
/// no object record is produced.
pub async fn chunked_upload<C: Connection + ?Sized>(
    conn: &C,
    request: Request,
    source: ByteStream,
    chunk_size: usize,
    hash_type: HashType,
) -> StorageResult<UploadResponse> {
    let tally = StreamTally::new(hash_type);
    let mut body = tally.observe(chunked(source, chunk_size, false));
    if !conn.handles_chunked_framing() {
        body = frame_chunked(body);
    }

    let request = request
        .header("Transfer-Encoding", "chunked")
        .with_body(RequestBody::Stream {
            stream: body,
            length: None,
        });
    let response = conn.request(request).await?;
    // A transport may end the body early on a source error and still get a
    // reply for what it sent.
    if let Some(err) = tally.failure() {
        warn!(error = %err, "source failed during chunked upload");
        return Err(StorageError::Io(err));
    }
    let (hash, bytes) = tally.snapshot();

    Ok(UploadResponse {
        response,
        bytes,
        hash,
    })
}

/// Compare a locally computed digest with the checksum the server reported.
///
/// A missing server checksum cannot be checked and passes.
pub fn verify_checksum(object_name: &str, local: &str, server: Option<&str>) -> StorageResult<()> {
    let Some(server) = server else {
        debug!(object = object_name, "server returned no checksum, skipping verification");
        return Ok(());
    };
    let server = normalize_etag(server);
    if server != local.to_ascii_lowercase() {
        warn!(object = object_name, local, server = %server, "checksum mismatch after upload");
        return Err(StorageError::ObjectHashMismatch {
            object: object_name.to_string(),
            expected: local.to_string(),
            actual: server,
        });
    }
    Ok(())
}

/// Content type for an upload: the caller's choice, else a guess from the
/// object name's extension.
pub fn content_type_for(object_name: &str, explicit: Option<&str>) -> String {
    if let Some(explicit) = explicit {
        return explicit.to_string();
    }
    let extension = object_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let guessed = match extension.as_str() {
        "txt" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    };
    guessed.to_string()
}
