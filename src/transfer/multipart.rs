//! Multipart upload orchestration: initiate, upload parts, commit, and abort
//! on any failure.
//!
//! Each backend supplies the four protocol steps through
//! [`MultipartProtocol`]; the ordering, hashing, concurrency and failure
//! recovery live here and are shared by every driver.

use crate::{
    config::TransferConfig,
    errors::{StorageError, StorageResult},
    models::multipart::{CompletedPart, MultipartUpload},
    transfer::{
        chunks::{ByteStream, chunked},
        hashing::{HashType, normalize_etag},
        session::{PartPayload, TransferSession},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::FuturesUnordered};
use tracing::{debug, info, warn};

/// Totals handed to the commit step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub total_bytes: u64,
    /// Hex digest of the whole object in the driver's hash type.
    pub hash_hex: String,
}

/// The backend half of a multipart upload, bound to one target object.
#[async_trait]
pub trait MultipartProtocol: Send + Sync {
    /// Start an upload and return its id.
    async fn initiate(&self) -> StorageResult<String>;

    async fn upload_part(&self, upload_id: &str, part: PartPayload) -> StorageResult<CompletedPart>;

    /// Commit `parts` (sorted by part number). Returns the composite ETag if
    /// the backend reports one.
    async fn commit(
        &self,
        upload_id: &str,
        parts: &[CompletedPart],
        summary: &UploadSummary,
    ) -> StorageResult<Option<String>>;

    /// Discard the upload and every part sent so far.
    async fn abort(&self, upload_id: &str) -> StorageResult<()>;

    /// Whether part ETags are the md5 of the part body and can be checked.
    fn part_etag_is_md5(&self) -> bool {
        true
    }
}

/// Result of a committed multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartOutcome {
    pub upload: MultipartUpload,
    pub parts: Vec<CompletedPart>,
    pub bytes: u64,
    /// Hex digest of the source bytes.
    pub hash: String,
    pub etag: Option<String>,
}

/// Run a complete multipart upload of `source`.
///
/// Parts are cut at `config.chunk_size` (every part but the last is exactly
/// that long), numbered from 1 in source order and uploaded with at most
/// `config.max_in_flight` in flight. An empty source still commits one
/// empty part. Any failure after initiation aborts the upload exactly once
/// and the original error is returned.
pub async fn multipart_upload<P: MultipartProtocol + ?Sized>(
    protocol: &P,
    source: ByteStream,
    container_name: &str,
    object_name: &str,
    config: &TransferConfig,
    hash_type: HashType,
    verify_parts: bool,
) -> StorageResult<MultipartOutcome> {
    let upload_id = protocol.initiate().await?;
    let upload = MultipartUpload::new(upload_id, container_name, object_name);
    info!(
        upload_id = %upload.upload_id,
        container = container_name,
        object = object_name,
        "multipart upload initiated"
    );

    let mut session = TransferSession::new(hash_type);

    let result =
        send_and_commit(protocol, &mut session, &upload, source, config, verify_parts).await;
    match result {
        Ok(etag) => {
            let parts = session.manifest();
            info!(
                upload_id = %upload.upload_id,
                parts = parts.len(),
                bytes = session.bytes_transferred(),
                "multipart upload committed"
            );
            Ok(MultipartOutcome {
                bytes: session.bytes_transferred(),
                hash: session.digest_hex(),
                upload,
                parts,
                etag,
            })
        }
        Err(err) => {
            warn!(upload_id = %upload.upload_id, error = %err, "multipart upload failed, aborting");
            if let Err(abort_err) = protocol.abort(&upload.upload_id).await {
                warn!(upload_id = %upload.upload_id, error = %abort_err, "abort failed");
            }
            Err(err)
        }
    }
}

async fn send_and_commit<P: MultipartProtocol + ?Sized>(
    protocol: &P,
    session: &mut TransferSession,
    upload: &MultipartUpload,
    source: ByteStream,
    config: &TransferConfig,
    verify_parts: bool,
) -> StorageResult<Option<String>> {
    let upload_id = upload.upload_id.as_str();
    let verify = verify_parts && protocol.part_etag_is_md5();
    let mut parts = chunked(source, config.chunk_size, true);
    let mut in_flight = FuturesUnordered::new();
    let mut exhausted = false;

    loop {
        while !exhausted && in_flight.len() < config.max_in_flight {
            match parts.try_next().await? {
                Some(data) => {
                    let payload = session.prepare_part(data);
                    in_flight.push(send_part(
                        protocol,
                        upload_id,
                        &upload.object_name,
                        payload,
                        verify,
                    ));
                }
                None => {
                    exhausted = true;
                    if session.parts_prepared() == 0 {
                        let payload = session.prepare_part(Bytes::new());
                        in_flight.push(send_part(
                            protocol,
                            upload_id,
                            &upload.object_name,
                            payload,
                            verify,
                        ));
                    }
                }
            }
        }
        match in_flight.next().await {
            Some(part) => session.push_completed(part?),
            None => break,
        }
    }

    let manifest = session.manifest();
    let summary = UploadSummary {
        total_bytes: session.bytes_transferred(),
        hash_hex: session.digest_hex(),
    };
    debug!(upload_id, parts = manifest.len(), "committing multipart upload");
    protocol.commit(upload_id, &manifest, &summary).await
}

async fn send_part<P: MultipartProtocol + ?Sized>(
    protocol: &P,
    upload_id: &str,
    object_name: &str,
    payload: PartPayload,
    verify: bool,
) -> StorageResult<CompletedPart> {
    let number = payload.part_number;
    let size = payload.data.len();
    let expected = payload.md5_hex.clone();

    let part = protocol.upload_part(upload_id, payload).await?;
    if verify {
        let actual = normalize_etag(&part.etag);
        if actual != expected {
            return Err(StorageError::ObjectHashMismatch {
                object: format!("{} (part {})", object_name, number),
                expected,
                actual,
            });
        }
    }
    debug!(upload_id, part = number, size, "part uploaded");
    Ok(part)
}
