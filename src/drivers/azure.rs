//! Azure Blob Storage driver: block blobs, block-list commits and optional
//! exclusive leases while an upload is in progress.

use crate::{
    config::TransferConfig,
    connection::{Connection, Request, RequestBody},
    driver::{StorageDriver, UploadOptions},
    drivers::{
        container_path, content_length, ensure_object_name, extra_from_headers, header_str,
        meta_from_headers, meta_headers, object_path, xml,
    },
    errors::{StorageError, StorageResult},
    models::{
        container::{Container, validate_azure_name},
        metadata::Metadata,
        multipart::CompletedPart,
        object::Object,
    },
    transfer::{
        chunks::{ByteSource, ByteStream},
        download::{ByteRange, range_stream, rechunk},
        hashing::{HashType, base64_to_hex, hex_to_base64},
        multipart::{MultipartProtocol, UploadSummary, multipart_upload},
        session::PartPayload,
        upload::{UploadStrategy, content_type_for, direct_upload, verify_checksum},
    },
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use futures::{StreamExt, TryStreamExt, stream::{self, BoxStream}};
use http::StatusCode;
use std::{
    path::Path,
    time::{Duration, Instant},
};
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const AZURE_DRIVER_NAME: &str = "azure_blobs";

/// Service version sent with every request.
pub const API_VERSION: &str = "2020-04-08";

const META_PREFIX: &str = "x-ms-meta-";
const LIST_PAGE_SIZE: usize = 5000;

const CONTAINER_HEADERS: &[(&str, &str)] = &[
    ("etag", "etag"),
    ("last-modified", "last_modified"),
    ("x-ms-lease-status", "lease_status"),
    ("x-ms-lease-state", "lease_state"),
    ("x-ms-blob-public-access", "public_access"),
];

const BLOB_HEADERS: &[(&str, &str)] = &[
    ("content-type", "content_type"),
    ("etag", "etag"),
    ("last-modified", "last_modified"),
    ("x-ms-blob-type", "blob_type"),
    ("x-ms-lease-status", "lease_status"),
    ("x-ms-lease-state", "lease_state"),
];

/// Block id for a part number: base64 of the zero-padded decimal number,
/// so every id in one blob has the same length.
pub fn block_id(part_number: u32) -> String {
    general_purpose::STANDARD.encode(format!("{:010}", part_number))
}

/// Driver for Azure Blob Storage.
pub struct AzureBlobsDriver<C> {
    conn: C,
    config: TransferConfig,
}

impl<C: Connection> AzureBlobsDriver<C> {
    pub fn new(conn: C, config: TransferConfig) -> StorageResult<Self> {
        config.validate()?;
        Ok(Self { conn, config })
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    async fn send(&self, request: Request) -> StorageResult<crate::connection::Response> {
        self.conn
            .request(request.header("x-ms-version", API_VERSION))
            .await
    }

    fn container_record(&self, name: &str, extra: Metadata) -> Container {
        Container::new(name, extra, AZURE_DRIVER_NAME)
    }

    async fn list_page(
        &self,
        container: &Container,
        prefix: Option<&str>,
        marker: Option<&str>,
        max_results: usize,
    ) -> StorageResult<(Vec<Object>, Option<String>)> {
        let mut request = Request::get(container_path(&container.name))
            .param("restype", "container")
            .param("comp", "list")
            .param("include", "metadata")
            .param("maxresults", max_results.to_string());
        if let Some(prefix) = prefix {
            request = request.param("prefix", prefix);
        }
        if let Some(marker) = marker {
            request = request.param("marker", marker);
        }

        let response = self.send(request).await?;
        match response.status {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(StorageError::ContainerDoesNotExist(container.name.clone()));
            }
            _ => return Err(StorageError::unexpected(response).await),
        }
        let body = response.text().await?;

        let mut objects = Vec::new();
        for blob in xml::elements(&body, "Blob") {
            let name = xml::child_text(blob, "Name")
                .ok_or_else(|| StorageError::MalformedResponse("blob without Name".into()))?;
            let properties = xml::elements(blob, "Properties").first().copied().unwrap_or_default();
            let size = xml::child_text(properties, "Content-Length")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    StorageError::MalformedResponse(format!("bad Content-Length for `{}`", name))
                })?;
            let hash = xml::child_text(properties, "Content-MD5")
                .and_then(|b64| base64_to_hex(&b64))
                .unwrap_or_default();
            let extra = Metadata::new()
                .with_opt("content_type", xml::child_text(properties, "Content-Type"))
                .with_opt("etag", xml::child_text(properties, "Etag"))
                .with_opt("last_modified", xml::child_text(properties, "Last-Modified"))
                .with_opt("blob_type", xml::child_text(properties, "BlobType"))
                .with_opt("lease_status", xml::child_text(properties, "LeaseStatus"))
                .with_opt("lease_state", xml::child_text(properties, "LeaseState"));
            let meta_data = xml::elements(blob, "Metadata")
                .first()
                .map(|m| xml::child_elements(m).into_iter().collect())
                .unwrap_or_default();
            objects.push(Object::new(name, size, hash, extra, meta_data, container));
        }

        let next = xml::child_text(&body, "NextMarker").filter(|m| !m.is_empty());
        Ok((objects, next))
    }

    fn uploaded_object(
        container: &Container,
        name: &str,
        bytes: u64,
        hash: String,
        etag: Option<String>,
        content_type: String,
        options: &UploadOptions,
    ) -> Object {
        let extra = options
            .extra
            .clone()
            .with("content_type", content_type)
            .with("blob_type", "BlockBlob")
            .with_opt("etag", etag);
        Object::new(name, bytes, hash, extra, options.meta_data.clone(), container)
    }

    async fn upload(
        &self,
        source: ByteStream,
        length: Option<u64>,
        strategy: UploadStrategy,
        container: &Container,
        object_name: &str,
        options: UploadOptions,
    ) -> StorageResult<Object> {
        ensure_object_name(object_name)?;
        let content_type = content_type_for(object_name, options.content_type.as_deref());
        let verify = options.verify_hash.unwrap_or(self.config.verify_hash);
        debug!(container = %container.name, object = object_name, ?strategy, "uploading blob");

        if strategy == UploadStrategy::Multipart {
            let blocks = AzureBlocks {
                driver: self,
                container: &container.name,
                path: object_path(&container.name, object_name),
                content_type: content_type.clone(),
                meta: meta_headers(META_PREFIX, &options.meta_data),
                verify,
                lease: Mutex::new(None),
            };
            let outcome = multipart_upload(
                &blocks,
                source,
                &container.name,
                object_name,
                &self.config,
                self.hash_type(),
                verify,
            )
            .await?;
            return Ok(Self::uploaded_object(
                container,
                object_name,
                outcome.bytes,
                outcome.hash,
                outcome.etag,
                content_type,
                &options,
            ));
        }

        let mut request = Request::put(object_path(&container.name, object_name))
            .header("x-ms-version", API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header("Content-Type", content_type.clone());
        for (k, v) in meta_headers(META_PREFIX, &options.meta_data) {
            request = request.header(k, v);
        }
        let uploaded = direct_upload(&self.conn, request, source, length, self.hash_type()).await?;
        match uploaded.response.status {
            StatusCode::CREATED | StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(StorageError::ContainerDoesNotExist(container.name.clone()));
            }
            _ => return Err(StorageError::unexpected(uploaded.response).await),
        }
        if verify {
            let server = uploaded
                .response
                .header_str("content-md5")
                .and_then(base64_to_hex);
            verify_checksum(object_name, &uploaded.hash, server.as_deref())?;
        }
        let etag = uploaded.response.header_str("etag").map(str::to_string);
        Ok(Self::uploaded_object(
            container,
            object_name,
            uploaded.bytes,
            uploaded.hash,
            etag,
            content_type,
            &options,
        ))
    }

    async fn get(&self, object: &Object, range: Option<&ByteRange>) -> StorageResult<ByteStream> {
        let mut request = Request::get(object_path(&object.container.name, &object.name));
        if let Some(range) = range {
            request = request.header("x-ms-range", range.header_value());
        }
        let response = self.send(request).await?;
        if response.status == StatusCode::NOT_FOUND {
            return Err(StorageError::object_not_found(&object.container.name, &object.name));
        }
        match range {
            Some(range) => range_stream(response, range).await,
            None if response.status == StatusCode::OK => Ok(response.into_stream()),
            None => Err(StorageError::unexpected(response).await),
        }
    }
}

#[async_trait]
impl<C: Connection> StorageDriver for AzureBlobsDriver<C> {
    fn name(&self) -> &'static str {
        AZURE_DRIVER_NAME
    }

    fn hash_type(&self) -> HashType {
        HashType::Md5
    }

    fn supports_chunked_encoding(&self) -> bool {
        false
    }

    fn supports_multipart_upload(&self) -> bool {
        true
    }

    async fn list_containers(&self) -> StorageResult<Vec<Container>> {
        let mut containers = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut request = Request::get("/").param("comp", "list");
            if let Some(marker) = &marker {
                request = request.param("marker", marker.clone());
            }
            let response = self.send(request).await?;
            if response.status != StatusCode::OK {
                return Err(StorageError::unexpected(response).await);
            }
            let body = response.text().await?;
            for entry in xml::elements(&body, "Container") {
                let name = xml::child_text(entry, "Name")
                    .ok_or_else(|| {
                        StorageError::MalformedResponse("container without Name".into())
                    })?;
                let extra = Metadata::new()
                    .with_opt("etag", xml::child_text(entry, "Etag"))
                    .with_opt("last_modified", xml::child_text(entry, "Last-Modified"))
                    .with_opt("lease_status", xml::child_text(entry, "LeaseStatus"));
                containers.push(self.container_record(&name, extra));
            }
            marker = xml::child_text(&body, "NextMarker").filter(|m| !m.is_empty());
            if marker.is_none() {
                return Ok(containers);
            }
        }
    }

    async fn get_container(&self, name: &str) -> StorageResult<Container> {
        let request = Request::head(container_path(name)).param("restype", "container");
        let response = self.send(request).await?;
        match response.status {
            StatusCode::OK => Ok(self.container_record(
                name,
                extra_from_headers(&response.headers, CONTAINER_HEADERS),
            )),
            StatusCode::NOT_FOUND => Err(StorageError::ContainerDoesNotExist(name.to_string())),
            _ => Err(StorageError::unexpected(response).await),
        }
    }

    async fn create_container(&self, name: &str) -> StorageResult<Container> {
        validate_azure_name(name)?;
        let request = Request::put(container_path(name)).param("restype", "container");
        let response = self.send(request).await?;
        match response.status {
            StatusCode::CREATED | StatusCode::OK => {
                info!(container = name, "container created");
                Ok(self.container_record(
                    name,
                    extra_from_headers(&response.headers, CONTAINER_HEADERS),
                ))
            }
            StatusCode::CONFLICT => Err(StorageError::ContainerAlreadyExists(name.to_string())),
            StatusCode::BAD_REQUEST => {
                Err(StorageError::invalid_name(name, "rejected by the service"))
            }
            _ => Err(StorageError::unexpected(response).await),
        }
    }

    async fn delete_container(&self, container: &Container) -> StorageResult<bool> {
        // The service deletes non-empty containers, so check first.
        let (objects, _) = self.list_page(container, None, None, 1).await?;
        if !objects.is_empty() {
            return Err(StorageError::ContainerIsNotEmpty(container.name.clone()));
        }

        let request =
            Request::delete(container_path(&container.name)).param("restype", "container");
        let response = self.send(request).await?;
        match response.status {
            StatusCode::ACCEPTED | StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => {
                Err(StorageError::ContainerDoesNotExist(container.name.clone()))
            }
            _ => Err(StorageError::unexpected(response).await),
        }
    }

    fn iterate_container_objects<'a>(
        &'a self,
        container: &'a Container,
        prefix: Option<&'a str>,
    ) -> BoxStream<'a, StorageResult<Object>> {
        stream::try_unfold(Some(None::<String>), move |marker| async move {
            let Some(marker) = marker else {
                return Ok(None);
            };
            let (page, next) = self
                .list_page(container, prefix, marker.as_deref(), LIST_PAGE_SIZE)
                .await?;
            Ok::<_, StorageError>(Some((page, next.map(Some))))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn get_object(&self, container_name: &str, object_name: &str) -> StorageResult<Object> {
        let response = self
            .send(Request::head(object_path(container_name, object_name)))
            .await?;
        match response.status {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(StorageError::object_not_found(container_name, object_name));
            }
            _ => return Err(StorageError::unexpected(response).await),
        }
        let size = content_length(&response.headers)?;
        let hash = header_str(&response.headers, "content-md5")
            .and_then(base64_to_hex)
            .unwrap_or_default();
        let container = self.container_record(container_name, Metadata::new());
        Ok(Object::new(
            object_name,
            size,
            hash,
            extra_from_headers(&response.headers, BLOB_HEADERS),
            meta_from_headers(META_PREFIX, &response.headers),
            &container,
        ))
    }

    async fn delete_object(&self, object: &Object) -> StorageResult<bool> {
        let response = self
            .send(Request::delete(object_path(&object.container.name, &object.name)))
            .await?;
        match response.status {
            StatusCode::ACCEPTED | StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => {
                Err(StorageError::object_not_found(&object.container.name, &object.name))
            }
            _ => Err(StorageError::unexpected(response).await),
        }
    }

    async fn upload_object(
        &self,
        file_path: &Path,
        container: &Container,
        object_name: &str,
        options: UploadOptions,
    ) -> StorageResult<Object> {
        let size = fs::metadata(file_path).await?.len();
        let strategy =
            UploadStrategy::for_file(size, &self.config, self.supports_multipart_upload());
        let source = ByteSource::from_file(file_path).await?;
        self.upload(source.into_stream(), Some(size), strategy, container, object_name, options)
            .await
    }

    async fn upload_object_via_stream(
        &self,
        source: ByteSource,
        container: &Container,
        object_name: &str,
        options: UploadOptions,
    ) -> StorageResult<Object> {
        let strategy =
            UploadStrategy::for_stream(
                self.supports_chunked_encoding(),
                self.supports_multipart_upload(),
            );
        self.upload(source.into_stream(), None, strategy, container, object_name, options)
            .await
    }

    async fn download_object_as_stream(
        &self,
        object: &Object,
        chunk_size: Option<usize>,
    ) -> StorageResult<ByteStream> {
        Ok(rechunk(self.get(object, None).await?, chunk_size))
    }

    async fn download_object_range_as_stream(
        &self,
        object: &Object,
        start_bytes: u64,
        end_bytes: Option<u64>,
        chunk_size: Option<usize>,
    ) -> StorageResult<ByteStream> {
        let range = ByteRange::new(start_bytes, end_bytes, object.size)?;
        Ok(rechunk(self.get(object, Some(&range)).await?, chunk_size))
    }
}

#[derive(Debug, Clone)]
struct Lease {
    id: String,
    renewed_at: Instant,
}

/// Block upload of one blob. The "upload id" is local only: the service
/// keys uncommitted blocks by blob, and discards them if never committed.
struct AzureBlocks<'a, C> {
    driver: &'a AzureBlobsDriver<C>,
    container: &'a str,
    path: String,
    content_type: String,
    meta: Vec<(String, String)>,
    verify: bool,
    lease: Mutex<Option<Lease>>,
}

impl<'a, C: Connection> AzureBlocks<'a, C> {
    fn lease_period(&self) -> Option<Duration> {
        self.driver.config.lease_period
    }

    fn lease_request(&self, action: &str) -> Request {
        Request::put(self.path.clone())
            .param("comp", "lease")
            .header("x-ms-lease-action", action)
    }

    async fn acquire_lease(&self) -> StorageResult<()> {
        let Some(period) = self.lease_period() else {
            return Ok(());
        };
        let request = self
            .lease_request("acquire")
            .header("x-ms-lease-duration", period.as_secs().to_string());
        let response = self.driver.send(request).await?;
        match response.status {
            StatusCode::CREATED | StatusCode::OK => {
                let id = response
                    .header_str("x-ms-lease-id")
                    .ok_or_else(|| {
                        StorageError::MalformedResponse(
                            "lease response without x-ms-lease-id".into(),
                        )
                    })?
                    .to_string();
                debug!(path = %self.path, lease = %id, "lease acquired");
                *self.lease.lock().await = Some(Lease {
                    id,
                    renewed_at: Instant::now(),
                });
                Ok(())
            }
            // Nothing to lease until the blob exists.
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(StorageError::unexpected(response).await),
        }
    }

    /// Current lease id, renewing first once half the period has elapsed.
    async fn lease_id(&self) -> StorageResult<Option<String>> {
        let Some(period) = self.lease_period() else {
            return Ok(None);
        };
        let mut guard = self.lease.lock().await;
        let Some(lease) = guard.as_mut() else {
            return Ok(None);
        };
        if lease.renewed_at.elapsed() >= period / 2 {
            let request = self
                .lease_request("renew")
                .header("x-ms-lease-id", lease.id.clone());
            let response = self.driver.send(request).await?;
            if response.status != StatusCode::OK {
                return Err(StorageError::unexpected(response).await);
            }
            debug!(path = %self.path, lease = %lease.id, "lease renewed");
            lease.renewed_at = Instant::now();
        }
        Ok(Some(lease.id.clone()))
    }

    async fn release_lease(&self) {
        let Some(lease) = self.lease.lock().await.take() else {
            return;
        };
        let request = self
            .lease_request("release")
            .header("x-ms-lease-id", lease.id.clone());
        match self.driver.send(request).await {
            Ok(response) if response.status == StatusCode::OK => {
                debug!(path = %self.path, lease = %lease.id, "lease released");
            }
            Ok(response) => {
                warn!(path = %self.path, status = %response.status, "lease release refused")
            }
            Err(err) => warn!(path = %self.path, error = %err, "lease release failed"),
        }
    }
}

#[async_trait]
impl<'a, C: Connection> MultipartProtocol for AzureBlocks<'a, C> {
    async fn initiate(&self) -> StorageResult<String> {
        self.acquire_lease().await?;
        Ok(Uuid::new_v4().to_string())
    }

    async fn upload_part(
        &self,
        _upload_id: &str,
        part: PartPayload,
    ) -> StorageResult<CompletedPart> {
        let id = block_id(part.part_number);
        let size = part.data.len() as u64;
        let mut request = Request::put(self.path.clone())
            .param("comp", "block")
            .param("blockid", id.clone())
            .header("Content-MD5", part.content_md5.clone());
        if let Some(lease) = self.lease_id().await? {
            request = request.header("x-ms-lease-id", lease);
        }
        let response = self
            .driver
            .send(request.with_body(RequestBody::Full(part.data)))
            .await?;
        match response.status {
            StatusCode::CREATED => {}
            StatusCode::NOT_FOUND => {
                return Err(StorageError::ContainerDoesNotExist(self.container.to_string()));
            }
            _ => return Err(StorageError::unexpected(response).await),
        }
        let server = response.header_str("content-md5").and_then(base64_to_hex);
        if let Some(server) = server.filter(|_| self.verify) {
            if server != part.md5_hex {
                return Err(StorageError::ObjectHashMismatch {
                    object: format!("{} (block {})", self.path, part.part_number),
                    expected: part.md5_hex,
                    actual: server,
                });
            }
        }
        Ok(CompletedPart {
            part_number: part.part_number,
            etag: id,
            size,
        })
    }

    async fn commit(
        &self,
        _upload_id: &str,
        parts: &[CompletedPart],
        summary: &UploadSummary,
    ) -> StorageResult<Option<String>> {
        let mut body = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
        for part in parts {
            body.push_str(&format!("<Latest>{}</Latest>", xml::escape(&part.etag)));
        }
        body.push_str("</BlockList>");

        let mut request = Request::put(self.path.clone())
            .param("comp", "blocklist")
            .header("Content-Type", "application/xml")
            .header("x-ms-blob-content-type", self.content_type.clone());
        if let Some(md5) = hex_to_base64(&summary.hash_hex) {
            request = request.header("x-ms-blob-content-md5", md5);
        }
        for (k, v) in &self.meta {
            request = request.header(k.clone(), v.clone());
        }
        if let Some(lease) = self.lease_id().await? {
            request = request.header("x-ms-lease-id", lease);
        }

        let response = self
            .driver
            .send(request.with_body(RequestBody::Full(body.into())))
            .await?;
        if response.status != StatusCode::CREATED {
            return Err(StorageError::unexpected(response).await);
        }
        let etag = response.header_str("etag").map(str::to_string);
        self.release_lease().await;
        Ok(etag)
    }

    async fn abort(&self, _upload_id: &str) -> StorageResult<()> {
        self.release_lease().await;
        Ok(())
    }

    fn part_etag_is_md5(&self) -> bool {
        false
    }
}
