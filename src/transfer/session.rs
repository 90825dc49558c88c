//! Ephemeral per-transfer state.

use crate::{
    models::multipart::CompletedPart,
    transfer::hashing::{HashType, Hasher, content_md5},
};
use bytes::Bytes;

/// One part ready to be sent: numbered in source order and carrying its own
/// integrity header value.
#[derive(Debug, Clone)]
pub struct PartPayload {
    pub part_number: u32,
    pub data: Bytes,
    /// Base64 md5 of `data`, for `Content-MD5`-style headers.
    pub content_md5: String,
    /// Hex md5 of `data`, for comparing with md5-style part ETags.
    pub md5_hex: String,
}

/// State of one upload or download: running digest, bytes moved, and for
/// multipart uploads the parts committed so far.
///
/// Lives for the duration of a single transfer call and is dropped with it.
#[derive(Debug)]
pub struct TransferSession {
    hasher: Hasher,
    bytes_transferred: u64,
    next_part_number: u32,
    parts: Vec<CompletedPart>,
}

impl TransferSession {
    pub fn new(hash_type: HashType) -> Self {
        Self {
            hasher: Hasher::new(hash_type),
            bytes_transferred: 0,
            next_part_number: 1,
            parts: Vec::new(),
        }
    }

    /// Feed a chunk into the running digest and byte count.
    pub fn record(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes_transferred += chunk.len() as u64;
    }

    /// Record `data` and assign it the next part number.
    pub fn prepare_part(&mut self, data: Bytes) -> PartPayload {
        self.record(&data);
        let part_number = self.next_part_number;
        self.next_part_number += 1;
        PartPayload {
            part_number,
            content_md5: content_md5(&data),
            md5_hex: format!("{:x}", md5::compute(&data)),
            data,
        }
    }

    /// Number of parts handed out so far.
    pub fn parts_prepared(&self) -> u32 {
        self.next_part_number - 1
    }

    pub fn push_completed(&mut self, part: CompletedPart) {
        self.parts.push(part);
    }

    /// Completed parts ordered by part number, whatever order they finished in.
    pub fn manifest(&self) -> Vec<CompletedPart> {
        let mut parts = self.parts.clone();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Hex digest of everything recorded so far.
    pub fn digest_hex(&self) -> String {
        self.hasher.clone().finalize_hex()
    }
}
