//! Object Storage Service driver: object-name addressed buckets with an XML
//! dialect and initiate / part / complete / abort multipart uploads.

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
        container::{Container, validate_dns_name},
        metadata::Metadata,
        multipart::CompletedPart,
        object::Object,
    },
    transfer::{
        chunks::{ByteSource, ByteStream},
        download::{ByteRange, range_stream, rechunk},
        hashing::{HashType, normalize_etag},
        multipart::{MultipartProtocol, UploadSummary, multipart_upload},
        session::PartPayload,
        upload::{UploadStrategy, content_type_for, direct_upload, verify_checksum},
    },
};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream::{self, BoxStream}};
use http::StatusCode;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

pub const OSS_DRIVER_NAME: &str = "oss";

const META_PREFIX: &str = "x-oss-meta-";
const LIST_PAGE_SIZE: usize = 1000;

/// Headers copied into `Object::extra` on HEAD/GET.
const OBJECT_HEADERS: &[(&str, &str)] = &[
    ("content-type", "content_type"),
    ("etag", "etag"),
    ("last-modified", "last_modified"),
    ("x-oss-object-type", "object_type"),
    ("x-oss-storage-class", "storage_class"),
];

/// Driver for OSS-style object storage.
pub struct OssDriver<C> {
    conn: C,
    config: TransferConfig,
    list_page_size: usize,
}

impl<C: Connection> OssDriver<C> {
    pub fn new(conn: C, config: TransferConfig) -> StorageResult<Self> {
        config.validate()?;
        Ok(Self {
            conn,
            config,
            list_page_size: LIST_PAGE_SIZE,
        })
    }

    /// Entries requested per listing call (`max-keys`), at least 1.
    pub fn with_list_page_size(mut self, size: usize) -> Self {
        self.list_page_size = size.max(1);
        self
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn container_record(&self, name: &str, extra: Metadata) -> Container {
        Container::new(name, extra, OSS_DRIVER_NAME)
    }

    /// One page of a bucket listing plus the marker for the next page.
    async fn list_page(
        &self,
        container: &Container,
        prefix: Option<&str>,
        marker: Option<&str>,
    ) -> StorageResult<(Vec<Object>, Option<String>)> {
        let mut request = Request::get(container_path(&container.name))
            .param("max-keys", self.list_page_size.to_string());
        if let Some(prefix) = prefix {
            request = request.param("prefix", prefix);
        }
        if let Some(marker) = marker {
            request = request.param("marker", marker);
        }

        let response = self.conn.request(request).await?;
        match response.status {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(StorageError::ContainerDoesNotExist(container.name.clone()));
            }
            _ => return Err(StorageError::unexpected(response).await),
        }
        let body = response.text().await?;

        let mut objects = Vec::new();
        for entry in xml::elements(&body, "Contents") {
            let name = xml::child_text(entry, "Key")
                .ok_or_else(|| {
                    StorageError::MalformedResponse("listing entry without Key".into())
                })?;
            let size = xml::child_text(entry, "Size")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    StorageError::MalformedResponse(format!("bad Size for `{}`", name))
                })?;
            let etag = xml::child_text(entry, "ETag").unwrap_or_default();
            let extra = Metadata::new()
                .with("etag", etag.clone())
                .with_opt("last_modified", xml::child_text(entry, "LastModified"))
                .with_opt("storage_class", xml::child_text(entry, "StorageClass"))
                .with_opt("object_type", xml::child_text(entry, "Type"));
            objects.push(Object::new(
                name,
                size,
                normalize_etag(&etag),
                extra,
                Metadata::new(),
                container,
            ));
        }

        let truncated = xml::child_text(&body, "IsTruncated").as_deref() == Some("true");
        let next = if truncated {
            xml::child_text(&body, "NextMarker")
                .filter(|m| !m.is_empty())
                .or_else(|| objects.last().map(|o| o.name.clone()))
        } else {
            None
        };
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
            .with_opt("etag", etag);
        Object::new(name, bytes, hash, extra, options.meta_data.clone(), container)
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
        debug!(container = %container.name, object = object_name, ?strategy, "uploading object");

        match strategy {
            UploadStrategy::Multipart => {
                let protocol = OssMultipart {
                    conn: &self.conn,
                    container: &container.name,
                    path: object_path(&container.name, object_name),
                    content_type: content_type.clone(),
                    meta: meta_headers(META_PREFIX, &options.meta_data),
                };
                let outcome = multipart_upload(
                    &protocol,
                    source,
                    &container.name,
                    object_name,
                    &self.config,
                    self.hash_type(),
                    verify,
                )
                .await?;
                Ok(Self::uploaded_object(
                    container,
                    object_name,
                    outcome.bytes,
                    outcome.hash,
                    outcome.etag,
                    content_type,
                    &options,
                ))
            }
            UploadStrategy::Direct | UploadStrategy::Chunked => {
                let request = self.put_request(container, object_name, &content_type, &options);
                let uploaded =
                    direct_upload(&self.conn, request, source, length, self.hash_type()).await?;
                match uploaded.response.status {
                    StatusCode::OK | StatusCode::CREATED => {}
                    StatusCode::NOT_FOUND => {
                        return Err(StorageError::ContainerDoesNotExist(container.name.clone()));
                    }
                    _ => return Err(StorageError::unexpected(uploaded.response).await),
                }
                let etag = uploaded.response.header_str("etag").map(str::to_string);
                if verify {
                    verify_checksum(object_name, &uploaded.hash, etag.as_deref())?;
                }
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
        }
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
impl<C: Connection> StorageDriver for OssDriver<C> {
    fn name(&self) -> &'static str {
        OSS_DRIVER_NAME
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
        let response = self.conn.request(Request::get("/")).await?;
        if response.status != StatusCode::OK {
            return Err(StorageError::unexpected(response).await);
        }
        let body = response.text().await?;
        xml::elements(&body, "Bucket")
            .into_iter()
            .map(|entry| {
                let name = xml::child_text(entry, "Name")
                    .ok_or_else(|| StorageError::MalformedResponse("bucket without Name".into()))?;
                let extra = Metadata::new()
                    .with_opt("creation_date", xml::child_text(entry, "CreationDate"))
                    .with_opt("location", xml::child_text(entry, "Location"));
                Ok(self.container_record(&name, extra))
            })
            .collect()
    }

    async fn get_container(&self, name: &str) -> StorageResult<Container> {
        self.list_containers()
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| StorageError::ContainerDoesNotExist(name.to_string()))
    }

    async fn create_container(&self, name: &str) -> StorageResult<Container> {
        validate_dns_name(name)?;
        let response = self.conn.request(Request::put(container_path(name))).await?;
        match response.status {
            StatusCode::OK | StatusCode::CREATED => {
                info!(container = name, "container created");
                Ok(self.container_record(name, Metadata::new()))
            }
            StatusCode::CONFLICT => Err(StorageError::ContainerAlreadyExists(name.to_string())),
            StatusCode::BAD_REQUEST => {
                Err(StorageError::invalid_name(name, "rejected by the service"))
            }
            _ => Err(StorageError::unexpected(response).await),
        }
    }

    async fn delete_container(&self, container: &Container) -> StorageResult<bool> {
        let response = self
            .conn
            .request(Request::delete(container_path(&container.name)))
            .await?;
        match response.status {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(true),
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

/// OSS multipart calls bound to one target object.
struct OssMultipart<'a, C> {
    conn: &'a C,
    container: &'a str,
    path: String,
    content_type: String,
    meta: Vec<(String, String)>,
}

#[async_trait]
impl<'a, C: Connection> MultipartProtocol for OssMultipart<'a, C> {
    async fn initiate(&self) -> StorageResult<String> {
        let mut request = Request::post(self.path.clone())
            .param("uploads", "")
            .header("Content-Type", self.content_type.clone());
        for (k, v) in &self.meta {
            request = request.header(k.clone(), v.clone());
        }
        let response = self.conn.request(request).await?;
        match response.status {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(StorageError::ContainerDoesNotExist(self.container.to_string()));
            }
            _ => return Err(StorageError::unexpected(response).await),
        }
        let body = response.text().await?;
        xml::child_text(&body, "UploadId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                StorageError::MalformedResponse("initiate response without UploadId".into())
            })
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part: PartPayload,
    ) -> StorageResult<CompletedPart> {
        let size = part.data.len() as u64;
        let request = Request::put(self.path.clone())
            .param("partNumber", part.part_number.to_string())
            .param("uploadId", upload_id)
            .header("Content-MD5", part.content_md5)
            .with_body(RequestBody::Full(part.data));
        let response = self.conn.request(request).await?;
        if response.status != StatusCode::OK {
            return Err(StorageError::unexpected(response).await);
        }
        let etag = response
            .header_str("etag")
            .ok_or_else(|| StorageError::MalformedResponse("part response without ETag".into()))?
            .to_string();
        Ok(CompletedPart {
            part_number: part.part_number,
            etag,
            size,
        })
    }

    async fn commit(
        &self,
        upload_id: &str,
        parts: &[CompletedPart],
        _summary: &UploadSummary,
    ) -> StorageResult<Option<String>> {
        let mut manifest = String::from("<CompleteMultipartUpload>");
        for part in parts {
            manifest.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                part.part_number,
                xml::escape(&part.etag)
            ));
        }
        manifest.push_str("</CompleteMultipartUpload>");

        let request = Request::post(self.path.clone())
            .param("uploadId", upload_id)
            .header("Content-Type", "application/xml")
            .with_body(RequestBody::Full(manifest.into()));
        let response = self.conn.request(request).await?;
        if response.status != StatusCode::OK {
            return Err(StorageError::unexpected(response).await);
        }
        let body = response.text().await?;
        Ok(xml::child_text(&body, "ETag"))
    }

    async fn abort(&self, upload_id: &str) -> StorageResult<()> {
        let request = Request::delete(self.path.clone()).param("uploadId", upload_id);
        let response = self.conn.request(request).await?;
        match response.status {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            _ => Err(StorageError::unexpected(response).await),
        }
    }
}
