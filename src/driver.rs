//! The contract every storage backend implements.

use crate::{
    errors::StorageResult,
    models::{container::Container, metadata::Metadata, object::Object},
    transfer::{
        chunks::{ByteSource, ByteStream},
        download::{ByteRange, resolve_destination, save_to_file},
        hashing::HashType,
    },
};
use async_trait::async_trait;
use futures::{TryStreamExt, stream::BoxStream};
use std::path::Path;
use tracing::debug;

/// Per-upload options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Provider-specific settings (e.g. storage class, ACL).
    pub extra: Metadata,
    /// Explicit content type; guessed from the object name when absent.
    pub content_type: Option<String>,
    /// User metadata stored with the object.
    pub meta_data: Metadata,
    /// Override the driver's `verify_hash` setting for this upload.
    pub verify_hash: Option<bool>,
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta_data = self.meta_data.with(key, value);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra = self.extra.with(key, value);
        self
    }

    pub fn with_verify_hash(mut self, verify: bool) -> Self {
        self.verify_hash = Some(verify);
        self
    }
}

/// A storage backend.
///
/// Remote state is only ever changed through a driver; [`Container`] and
/// [`Object`] records carry the driver's [`name`](StorageDriver::name) and
/// delegate back to it.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Short identifier stored in every record this driver produces.
    fn name(&self) -> &'static str;

    /// Digest algorithm of [`Object::hash`].
    fn hash_type(&self) -> HashType;

    /// Whether bodies of unknown length can be sent with chunked encoding.
    fn supports_chunked_encoding(&self) -> bool;

    /// Whether the backend offers initiate / part / commit / abort.
    fn supports_multipart_upload(&self) -> bool;

    async fn list_containers(&self) -> StorageResult<Vec<Container>>;

    async fn get_container(&self, name: &str) -> StorageResult<Container>;

    async fn create_container(&self, name: &str) -> StorageResult<Container>;

    /// Delete an empty container.
    async fn delete_container(&self, container: &Container) -> StorageResult<bool>;

    /// Lazily list the objects of `container`, fetching pages as the
    /// stream is polled.
    fn iterate_container_objects<'a>(
        &'a self,
        container: &'a Container,
        prefix: Option<&'a str>,
    ) -> BoxStream<'a, StorageResult<Object>>;

    async fn list_container_objects(&self, container: &Container) -> StorageResult<Vec<Object>> {
        self.iterate_container_objects(container, None)
            .try_collect()
            .await
    }

    async fn get_object(&self, container_name: &str, object_name: &str) -> StorageResult<Object>;

    async fn delete_object(&self, object: &Object) -> StorageResult<bool>;

    async fn upload_object(
        &self,
        file_path: &Path,
        container: &Container,
        object_name: &str,
        options: UploadOptions,
    ) -> StorageResult<Object>;

    async fn upload_object_via_stream(
        &self,
        source: ByteSource,
        container: &Container,
        object_name: &str,
        options: UploadOptions,
    ) -> StorageResult<Object>;

    async fn download_object_as_stream(
        &self,
        object: &Object,
        chunk_size: Option<usize>,
    ) -> StorageResult<ByteStream>;

    /// Stream bytes `start_bytes..=end_bytes` of `object`.
    async fn download_object_range_as_stream(
        &self,
        object: &Object,
        start_bytes: u64,
        end_bytes: Option<u64>,
        chunk_size: Option<usize>,
    ) -> StorageResult<ByteStream>;

    /// Save `object` to `destination`.
    ///
    /// Returns `Ok(false)` when the bytes written do not match the object's
    /// size or the local write fails; other failures are errors.
    async fn download_object(
        &self,
        object: &Object,
        destination: &Path,
        overwrite_existing: bool,
        delete_on_failure: bool,
    ) -> StorageResult<bool> {
        let target = resolve_destination(&object.name, destination, overwrite_existing).await?;
        debug!(object = %object.name, path = %target.display(), "downloading object");
        let stream = self.download_object_as_stream(object, None).await?;
        save_to_file(stream, &target, object.size, delete_on_failure).await
    }

    /// Save bytes `start_bytes..=end_bytes` of `object` to `destination`.
    async fn download_object_range(
        &self,
        object: &Object,
        destination: &Path,
        start_bytes: u64,
        end_bytes: Option<u64>,
        overwrite_existing: bool,
        delete_on_failure: bool,
    ) -> StorageResult<bool> {
        let range = ByteRange::new(start_bytes, end_bytes, object.size)?;
        let target = resolve_destination(&object.name, destination, overwrite_existing).await?;
        let stream = self
            .download_object_range_as_stream(object, start_bytes, end_bytes, None)
            .await?;
        save_to_file(stream, &target, range.len(), delete_on_failure).await
    }
}
