use crate::errors::{StorageError, StorageResult};
use anyhow::{Context, Result};
use std::{env, str::FromStr, time::Duration};

/// Default chunk size for streamed transfers and multipart parts (5 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;
/// Default lower bound for every multipart part except the last (100 KiB).
pub const DEFAULT_MIN_PART_SIZE: usize = 100 * 1024;
/// Files at or above this size go through multipart upload when supported.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 5 * 1024 * 1024;

const MIN_LEASE_SECS: u64 = 15;
const MAX_LEASE_SECS: u64 = 60;

/// Tunables handed to the transfer engine when a driver is constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    /// Upload/download chunk size in bytes; also the multipart part size.
    pub chunk_size: usize,
    /// Provider minimum for every part but the last.
    pub min_part_size: usize,
    /// File uploads at or above this size use multipart when available.
    pub multipart_threshold: u64,
    /// Parts uploaded concurrently within one multipart upload.
    pub max_in_flight: usize,
    /// Exclusive-access lease held on the target while uploading, if any.
    pub lease_period: Option<Duration>,
    /// Compare local digests with server checksums after uploads.
    pub verify_hash: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_part_size: DEFAULT_MIN_PART_SIZE,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            max_in_flight: 1,
            lease_period: None,
            verify_hash: true,
        }
    }
}

impl TransferConfig {
    /// Read overrides from `STORAGE_*` environment variables on top of the
    /// defaults, then validate the result.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let lease_secs: Option<u64> = env_value("STORAGE_LEASE_PERIOD_SECS")?;

        let cfg = Self {
            chunk_size: env_value("STORAGE_CHUNK_SIZE")?.unwrap_or(defaults.chunk_size),
            min_part_size: env_value("STORAGE_MIN_PART_SIZE")?
                .unwrap_or(defaults.min_part_size),
            multipart_threshold: env_value("STORAGE_MULTIPART_THRESHOLD")?
                .unwrap_or(defaults.multipart_threshold),
            max_in_flight: env_value("STORAGE_MAX_IN_FLIGHT")?.unwrap_or(defaults.max_in_flight),
            lease_period: lease_secs.map(Duration::from_secs),
            verify_hash: env_value("STORAGE_VERIFY_HASH")?.unwrap_or(defaults.verify_hash),
        };

        cfg.validate().context("validating STORAGE_* configuration")?;
        Ok(cfg)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_min_part_size(mut self, min_part_size: usize) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    pub fn with_multipart_threshold(mut self, threshold: u64) -> Self {
        self.multipart_threshold = threshold;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_lease_period(mut self, period: Duration) -> Self {
        self.lease_period = Some(period);
        self
    }

    pub fn with_verify_hash(mut self, verify_hash: bool) -> Self {
        self.verify_hash = verify_hash;
        self
    }

    /// Reject combinations the engine cannot honour.
    pub fn validate(&self) -> StorageResult<()> {
        if self.chunk_size == 0 {
            return Err(StorageError::InvalidConfig(
                "chunk_size must be greater than zero".into(),
            ));
        }
        if self.chunk_size < self.min_part_size {
            return Err(StorageError::InvalidConfig(format!(
                "chunk_size {} is below the minimum part size {}",
                self.chunk_size, self.min_part_size
            )));
        }
        if self.max_in_flight == 0 {
            return Err(StorageError::InvalidConfig(
                "max_in_flight must be >= 1".into(),
            ));
        }
        if let Some(period) = self.lease_period {
            let secs = period.as_secs();
            if !(MIN_LEASE_SECS..=MAX_LEASE_SECS).contains(&secs) {
                return Err(StorageError::InvalidConfig(format!(
                    "lease_period must be between {} and {} seconds, got {}",
                    MIN_LEASE_SECS, MAX_LEASE_SECS, secs
                )));
            }
        }
        Ok(())
    }
}

/// Parse an optional environment variable, naming the variable on failure.
fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
