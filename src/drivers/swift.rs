//! OpenStack Swift driver: flat containers, JSON listings and streamed
//! uploads with chunked transfer encoding.

use crate::{
    config::TransferConfig,
    connection::{Connection, Request, Response},
    driver::{StorageDriver, UploadOptions},
    drivers::{
        container_path, content_length, ensure_object_name, extra_from_headers, header_str,
        meta_from_headers, meta_headers, object_path,
    },
    errors::{StorageError, StorageResult},
    models::{
        container::{Container, validate_flat_name},
        metadata::Metadata,
        object::Object,
    },
    transfer::{
        chunks::{ByteSource, ByteStream},
        download::{ByteRange, range_stream, rechunk},
        hashing::{HashType, normalize_etag},
        upload::{
            UploadResponse, UploadStrategy, chunked_upload, content_type_for, direct_upload,
            verify_checksum,
        },
    },
};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream::{self, BoxStream}};
use http::StatusCode;
use serde::{Deserialize, de::DeserializeOwned};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

pub const SWIFT_DRIVER_NAME: &str = "swift";

const META_PREFIX: &str = "x-object-meta-";
const MAX_CONTAINER_NAME_LEN: usize = 256;
const LIST_PAGE_SIZE: usize = 10_000;

const CONTAINER_HEADERS: &[(&str, &str)] = &[
    ("x-container-object-count", "object_count"),
    ("x-container-bytes-used", "bytes_used"),
];

const OBJECT_HEADERS: &[(&str, &str)] = &[
    ("content-type", "content_type"),
    ("etag", "etag"),
    ("last-modified", "last_modified"),
];

#[derive(Debug, Deserialize)]
struct ContainerEntry {
    name: String,
    #[serde(default)]
    count: u64,
    #[serde(default)]
    bytes: u64,
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    name: String,
    bytes: u64,
    #[serde(default)]
    hash: String,
    content_type: Option<String>,
    last_modified: Option<String>,
}

/// Driver for Swift object storage.
pub struct SwiftDriver<C> {
    conn: C,
    config: TransferConfig,
}

impl<C: Connection> SwiftDriver<C> {
    pub fn new(conn: C, config: TransferConfig) -> StorageResult<Self> {
        config.validate()?;
        Ok(Self { conn, config })
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    fn container_record(&self, name: &str, extra: Metadata) -> Container {
        Container::new(name, extra, SWIFT_DRIVER_NAME)
    }

    /// Decode a JSON listing; `204 No Content` is an empty page.
    async fn listing<T: DeserializeOwned>(response: Response) -> StorageResult<Vec<T>> {
        if response.status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&body)
            .map_err(|err| StorageError::MalformedResponse(format!("invalid listing: {}", err)))
    }

    async fn list_page(
        &self,
        container: &Container,
        prefix: Option<&str>,
        marker: Option<&str>,
    ) -> StorageResult<(Vec<Object>, Option<String>)> {
        let mut request = Request::get(container_path(&container.name))
            .param("format", "json")
            .param("limit", LIST_PAGE_SIZE.to_string());
        if let Some(prefix) = prefix {
            request = request.param("prefix", prefix);
        }
        if let Some(marker) = marker {
            request = request.param("marker", marker);
        }

        let response = self.conn.request(request).await?;
        match response.status {
            StatusCode::OK | StatusCode::NO_CONTENT => {}
            StatusCode::NOT_FOUND => {
                return Err(StorageError::ContainerDoesNotExist(container.name.clone()));
            }
            _ => return Err(StorageError::unexpected(response).await),
        }
        let entries: Vec<ObjectEntry> = Self::listing(response).await?;
        let next = if entries.len() >= LIST_PAGE_SIZE {
            entries.last().map(|e| e.name.clone())
        } else {
            None
        };

        let objects = entries
            .into_iter()
            .map(|entry| {
                let extra = Metadata::new()
                    .with("etag", entry.hash.clone())
                    .with_opt("content_type", entry.content_type)
                    .with_opt("last_modified", entry.last_modified);
                Object::new(entry.name, entry.bytes, entry.hash, extra, Metadata::new(), container)
            })
            .collect();
        Ok((objects, next))
    }

    fn put_request(
        &self,
        container: &Container,
        name: &str,
        content_type: &str,
        options: &UploadOptions,
    ) -> Request {
        let mut request =
            Request::put(object_path(&container.name, name)).header("Content-Type", content_type);
        for (k, v) in meta_headers(META_PREFIX, &options.meta_data) {
            request = request.header(k, v);
        }
        request
    }

    async fn finish_upload(
        &self,
        uploaded: UploadResponse,
        container: &Container,
        object_name: &str,
        content_type: String,
        options: &UploadOptions,
    ) -> StorageResult<Object> {
        match uploaded.response.status {
            StatusCode::CREATED | StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(StorageError::ContainerDoesNotExist(container.name.clone()));
            }
            _ => return Err(StorageError::unexpected(uploaded.response).await),
        }
        let etag = uploaded.response.header_str("etag").map(str::to_string);
        if options.verify_hash.unwrap_or(self.config.verify_hash) {
            verify_checksum(object_name, &uploaded.hash, etag.as_deref())?;
        }
        let extra = options
            .extra
            .clone()
            .with("content_type", content_type)
            .with_opt("etag", etag);
        Ok(Object::new(
            object_name,
            uploaded.bytes,
            uploaded.hash,
            extra,
            options.meta_data.clone(),
            container,
        ))
    }

    async fn get(&self, object: &Object, range: Option<&ByteRange>) -> StorageResult<ByteStream> {
        let mut request = Request::get(object_path(&object.container.name, &object.name));
        if let Some(range) = range {
            request = request.header("Range", range.header_value());
        }
        let response = self.conn.request(request).await?;
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
impl<C: Connection> StorageDriver for SwiftDriver<C> {
    fn name(&self) -> &'static str {
        SWIFT_DRIVER_NAME
    }

    fn hash_type(&self) -> HashType {
        HashType::Md5
    }

    fn supports_chunked_encoding(&self) -> bool {
        true
    }

    fn supports_multipart_upload(&self) -> bool {
        false
    }

    async fn list_containers(&self) -> StorageResult<Vec<Container>> {
        let mut containers = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut request = Request::get("/")
                .param("format", "json")
                .param("limit", LIST_PAGE_SIZE.to_string());
            if let Some(marker) = &marker {
                request = request.param("marker", marker.clone());
            }
            let response = self.conn.request(request).await?;
            if !response.is_success() {
                return Err(StorageError::unexpected(response).await);
            }
            let page: Vec<ContainerEntry> = Self::listing(response).await?;
            let full_page = page.len() >= LIST_PAGE_SIZE;
            marker = page.last().map(|c| c.name.clone());
            for entry in page {
                let extra = Metadata::new()
                    .with("object_count", entry.count.to_string())
                    .with("bytes_used", entry.bytes.to_string());
                containers.push(self.container_record(&entry.name, extra));
            }
            if !full_page {
                return Ok(containers);
            }
        }
    }

    async fn get_container(&self, name: &str) -> StorageResult<Container> {
        let response = self.conn.request(Request::head(container_path(name))).await?;
        match response.status {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(self.container_record(
                name,
                extra_from_headers(&response.headers, CONTAINER_HEADERS),
            )),
            StatusCode::NOT_FOUND => Err(StorageError::ContainerDoesNotExist(name.to_string())),
            _ => Err(StorageError::unexpected(response).await),
        }
    }

    async fn create_container(&self, name: &str) -> StorageResult<Container> {
        validate_flat_name(name, MAX_CONTAINER_NAME_LEN)?;
        let response = self.conn.request(Request::put(container_path(name))).await?;
        match response.status {
            StatusCode::CREATED => {
                info!(container = name, "container created");
                Ok(self.container_record(name, Metadata::new()))
            }
            // Swift answers 202 when the container was already there.
            StatusCode::ACCEPTED => Err(StorageError::ContainerAlreadyExists(name.to_string())),
            _ => Err(StorageError::unexpected(response).await),
        }
    }

    async fn delete_container(&self, container: &Container) -> StorageResult<bool> {
        let response = self
            .conn
            .request(Request::delete(container_path(&container.name)))
            .await?;
        match response.status {
            StatusCode::NO_CONTENT => Ok(true),
            StatusCode::NOT_FOUND => {
                Err(StorageError::ContainerDoesNotExist(container.name.clone()))
            }
            StatusCode::CONFLICT => Err(StorageError::ContainerIsNotEmpty(container.name.clone())),
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
            let (page, next) = self.list_page(container, prefix, marker.as_deref()).await?;
            Ok::<_, StorageError>(Some((page, next.map(Some))))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn get_object(&self, container_name: &str, object_name: &str) -> StorageResult<Object> {
        let response = self
            .conn
            .request(Request::head(object_path(container_name, object_name)))
            .await?;
        match response.status {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(StorageError::object_not_found(container_name, object_name));
            }
            _ => return Err(StorageError::unexpected(response).await),
        }
        let size = content_length(&response.headers)?;
        let hash = header_str(&response.headers, "etag")
            .map(normalize_etag)
            .unwrap_or_default();
        let container = self.container_record(container_name, Metadata::new());
        Ok(Object::new(
            object_name,
            size,
            hash,
            extra_from_headers(&response.headers, OBJECT_HEADERS),
            meta_from_headers(META_PREFIX, &response.headers),
            &container,
        ))
    }

    async fn delete_object(&self, object: &Object) -> StorageResult<bool> {
        let response = self
            .conn
            .request(Request::delete(object_path(&object.container.name, &object.name)))
            .await?;
        match response.status {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(true),
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
        ensure_object_name(object_name)?;
        let size = fs::metadata(file_path).await?.len();
        let content_type = content_type_for(object_name, options.content_type.as_deref());
        let source = ByteSource::from_file(file_path).await?;
        debug!(container = %container.name, object = object_name, size, "uploading file");

        let request = self.put_request(container, object_name, &content_type, &options);
        let uploaded = direct_upload(
            &self.conn,
            request,
            source.into_stream(),
            Some(size),
            self.hash_type(),
        )
        .await?;
        self.finish_upload(uploaded, container, object_name, content_type, &options)
            .await
    }

    async fn upload_object_via_stream(
        &self,
        source: ByteSource,
        container: &Container,
        object_name: &str,
        options: UploadOptions,
    ) -> StorageResult<Object> {
        ensure_object_name(object_name)?;
        let content_type = content_type_for(object_name, options.content_type.as_deref());
        let request = self.put_request(container, object_name, &content_type, &options);
        let strategy =
            UploadStrategy::for_stream(
                self.supports_chunked_encoding(),
                self.supports_multipart_upload(),
            );
        debug!(container = %container.name, object = object_name, ?strategy, "uploading stream");

        let uploaded = match strategy {
            UploadStrategy::Chunked => {
                chunked_upload(
                    &self.conn,
                    request,
                    source.into_stream(),
                    self.config.chunk_size,
                    self.hash_type(),
                )
                .await?
            }
            _ => {
                direct_upload(&self.conn, request, source.into_stream(), None, self.hash_type())
                    .await?
            }
        };
        self.finish_upload(uploaded, container, object_name, content_type, &options)
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
