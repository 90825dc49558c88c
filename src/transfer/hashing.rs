//! Incremental digests used for integrity checks.

use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use sha1::Digest as _;
use std::fmt;

/// Digest algorithm a driver reports checksums in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    #[default]
    Md5,
    Sha1,
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashType::Md5 => write!(f, "md5"),
            HashType::Sha1 => write!(f, "sha1"),
        }
    }
}

/// Running digest over a byte sequence.
#[derive(Clone)]
pub enum Hasher {
    Md5(md5::Context),
    Sha1(sha1::Sha1),
}

impl Hasher {
    pub fn new(hash_type: HashType) -> Self {
        match hash_type {
            HashType::Md5 => Hasher::Md5(md5::Context::new()),
            HashType::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha1(ctx) => ctx.update(data),
        }
    }

    /// Raw digest bytes.
    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Md5(ctx) => ctx.compute().0.to_vec(),
            Hasher::Sha1(ctx) => ctx.finalize().to_vec(),
        }
    }

    /// Lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.finalize())
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hasher::Md5(_) => f.write_str("Hasher::Md5"),
            Hasher::Sha1(_) => f.write_str("Hasher::Sha1"),
        }
    }
}

/// One-shot hex digest of `data`.
pub fn digest_hex(hash_type: HashType, data: &[u8]) -> String {
    let mut hasher = Hasher::new(hash_type);
    hasher.update(data);
    hasher.finalize_hex()
}

/// Base64 md5 as used by `Content-MD5` headers.
pub fn content_md5(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(md5::compute(data).0)
}

/// Convert a hex digest to the base64 form carried in headers.
pub fn hex_to_base64(hex_digest: &str) -> Option<String> {
    hex::decode(hex_digest)
        .ok()
        .map(|raw| general_purpose::STANDARD.encode(raw))
}

/// Convert a base64 header digest (e.g. `Content-MD5`) to lowercase hex.
pub fn base64_to_hex(b64_digest: &str) -> Option<String> {
    general_purpose::STANDARD
        .decode(b64_digest.trim())
        .ok()
        .map(hex::encode)
}

/// Normalise a server ETag for comparison with a hex digest: strip quotes
/// and weak markers, lowercase.
pub fn normalize_etag(etag: &str) -> String {
    etag.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .to_ascii_lowercase()
}
