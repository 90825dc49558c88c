//! Represents an object (blob) stored in a container.

use crate::{
    driver::StorageDriver,
    errors::{StorageError, StorageResult},
    models::{container::Container, metadata::Metadata},
    transfer::chunks::ByteStream,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A single stored blob.
///
/// The record describes the blob; it does not hold its bytes. Downloads and
/// deletion are delegated to the driver that produced it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Object {
    /// Object name, unique within the container. May contain `/`.
    pub name: String,

    /// Size in bytes.
    pub size: u64,

    /// Hex content digest; the algorithm is the driver's `hash_type`.
    pub hash: String,

    /// Provider metadata (content type, ETag, last modified, lease state).
    pub extra: Metadata,

    /// User-supplied key/value pairs.
    pub meta_data: Metadata,

    /// Parent container.
    pub container: Container,

    /// Name of the driver that produced this record.
    pub driver: String,
}

impl Object {
    pub fn new(
        name: impl Into<String>,
        size: u64,
        hash: impl Into<String>,
        extra: Metadata,
        meta_data: Metadata,
        container: &Container,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            hash: hash.into(),
            extra,
            meta_data,
            container: container.clone(),
            driver: container.driver.clone(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.extra.get("content_type")
    }

    pub fn etag(&self) -> Option<&str> {
        self.extra.get("etag")
    }

    fn check_driver<D: StorageDriver + ?Sized>(&self, driver: &D) -> StorageResult<()> {
        if self.driver != driver.name() {
            return Err(StorageError::Library(format!(
                "object `{}` belongs to driver `{}`, not `{}`",
                self.name,
                self.driver,
                driver.name()
            )));
        }
        Ok(())
    }

    pub async fn download<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        destination: &Path,
        overwrite_existing: bool,
        delete_on_failure: bool,
    ) -> StorageResult<bool> {
        self.check_driver(driver)?;
        driver
            .download_object(self, destination, overwrite_existing, delete_on_failure)
            .await
    }

    pub async fn as_stream<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        chunk_size: Option<usize>,
    ) -> StorageResult<ByteStream> {
        self.check_driver(driver)?;
        driver.download_object_as_stream(self, chunk_size).await
    }

    pub async fn download_range<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        destination: &Path,
        start_bytes: u64,
        end_bytes: Option<u64>,
        overwrite_existing: bool,
        delete_on_failure: bool,
    ) -> StorageResult<bool> {
        self.check_driver(driver)?;
        driver
            .download_object_range(
                self,
                destination,
                start_bytes,
                end_bytes,
                overwrite_existing,
                delete_on_failure,
            )
            .await
    }

    pub async fn range_as_stream<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        start_bytes: u64,
        end_bytes: Option<u64>,
        chunk_size: Option<usize>,
    ) -> StorageResult<ByteStream> {
        self.check_driver(driver)?;
        driver
            .download_object_range_as_stream(self, start_bytes, end_bytes, chunk_size)
            .await
    }

    pub async fn delete<D: StorageDriver + ?Sized>(&self, driver: &D) -> StorageResult<bool> {
        self.check_driver(driver)?;
        driver.delete_object(self).await
    }
}
