//! Local filesystem driver.
//!
//! Payloads live on disk sharded beneath
//! `base_path/{container}/{shard}/{shard}/{name}`; container and object
//! metadata live in SQLite. Writes go to a temporary file that is fsynced
//! and renamed into place, so readers never observe a half-written object.

use crate::{
    config::TransferConfig,
    driver::{StorageDriver, UploadOptions},
    drivers::ensure_object_name,
    errors::{StorageError, StorageResult},
    models::{
        container::{Container, validate_dns_name},
        metadata::Metadata,
        object::Object,
    },
    transfer::{
        chunks::{ByteSource, ByteStream, chunked},
        download::{ByteRange, rechunk},
        hashing::{HashType, Hasher},
        upload::content_type_for,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream::{self, BoxStream}};
use sqlx::{
    FromRow, QueryBuilder, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const LOCAL_DRIVER_NAME: &str = "local";

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");
const INDEX_FILE: &str = ".index.sqlite";
const LIST_PAGE_SIZE: i64 = 500;
const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, FromRow)]
struct ContainerRow {
    name: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ObjectRow {
    id: Uuid,
    name: String,
    size_bytes: i64,
    hash: String,
    hash_type: String,
    content_type: String,
    meta_data: String,
    extra: String,
    last_modified: DateTime<Utc>,
}

impl ObjectRow {
    fn into_object(self, container: &Container) -> StorageResult<Object> {
        let meta_data = decode_metadata(&self.meta_data)?;
        let extra = decode_metadata(&self.extra)?
            .with("id", self.id.to_string())
            .with("content_type", self.content_type)
            .with("hash_type", self.hash_type)
            .with("last_modified", self.last_modified.to_rfc3339());
        Ok(Object::new(
            self.name,
            self.size_bytes.max(0) as u64,
            self.hash,
            extra,
            meta_data,
            container,
        ))
    }
}

const OBJECT_COLUMNS: &str =
    "id, name, size_bytes, hash, hash_type, content_type, meta_data, extra, last_modified";

/// Driver storing objects on the local filesystem.
#[derive(Clone)]
pub struct LocalStorageDriver {
    /// Shared SQLite connection pool used for metadata operations.
    db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,

    config: TransferConfig,
    hash_type: HashType,
}

impl LocalStorageDriver {
    /// Use an existing pool. The schema must already be applied (see
    /// [`run_migrations`](Self::run_migrations)).
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        config: TransferConfig,
    ) -> StorageResult<Self> {
        config.validate()?;
        Ok(Self {
            db,
            base_path: base_path.into(),
            config,
            hash_type: HashType::Md5,
        })
    }

    /// Open (or create) a store rooted at `base_path`, with its index in
    /// `base_path/.index.sqlite`.
    pub async fn open(
        base_path: impl Into<PathBuf>,
        config: TransferConfig,
    ) -> StorageResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;
        let options = SqliteConnectOptions::new()
            .filename(base_path.join(INDEX_FILE))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let driver = Self::new(Arc::new(pool), base_path, config)?;
        driver.run_migrations().await?;
        Ok(driver)
    }

    /// Report hashes in `hash_type` instead of md5.
    pub fn with_hash_type(mut self, hash_type: HashType) -> Self {
        self.hash_type = hash_type;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn run_migrations(&self) -> StorageResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        debug!("running {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Reject names that could escape the container directory.
    fn ensure_key_safe(name: &str) -> StorageResult<()> {
        ensure_object_name(name)?;
        if name.split('/').any(|segment| segment == ".." || segment == ".")
            || name.contains('\\')
            || name.ends_with('/')
        {
            return Err(StorageError::InvalidObjectName(name.to_string()));
        }
        Ok(())
    }

    fn container_root(&self, container: &str) -> PathBuf {
        self.base_path.join(container)
    }

    /// Two-level shard directories from md5(container/name), reducing the
    /// file count per directory.
    fn object_shards(container: &str, name: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", container, name));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, container: &str, name: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(container, name);
        let mut path = self.container_root(container);
        path.push(shard_a);
        path.push(shard_b);
        path.push(name);
        path
    }

    fn container_record(row: ContainerRow) -> Container {
        let extra = Metadata::new().with("created_at", row.created_at.to_rfc3339());
        Container::new(row.name, extra, LOCAL_DRIVER_NAME)
    }

    async fn fetch_container(&self, name: &str) -> StorageResult<Container> {
        sqlx::query_as::<_, ContainerRow>("SELECT name, created_at FROM containers WHERE name = ?")
            .bind(name)
            .fetch_one(&*self.db)
            .await
            .map(Self::container_record)
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StorageError::ContainerDoesNotExist(name.to_string()),
                other => StorageError::Sqlx(other),
            })
    }

    async fn fetch_object(&self, container: &Container, name: &str) -> StorageResult<Object> {
        let row = sqlx::query_as::<_, ObjectRow>(&format!(
            "SELECT {} FROM objects WHERE container = ? AND name = ?",
            OBJECT_COLUMNS
        ))
        .bind(&container.name)
        .bind(name)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::object_not_found(&container.name, name),
            other => StorageError::Sqlx(other),
        })?;
        row.into_object(container)
    }

    async fn list_page(
        &self,
        container: &Container,
        prefix: Option<&str>,
        after: Option<&str>,
    ) -> StorageResult<Vec<Object>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM objects WHERE container = ",
            OBJECT_COLUMNS
        ));
        builder.push_bind(&container.name);
        if let Some(prefix) = prefix {
            // `LIKE` folds ASCII case, so compare the leading characters directly.
            builder.push(" AND substr(name, 1, length(");
            builder.push_bind(prefix);
            builder.push(")) = ");
            builder.push_bind(prefix);
        }
        if let Some(after) = after {
            builder.push(" AND name > ");
            builder.push_bind(after);
        }
        builder.push(" ORDER BY name ASC LIMIT ");
        builder.push_bind(LIST_PAGE_SIZE);

        let rows: Vec<ObjectRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        rows.into_iter().map(|row| row.into_object(container)).collect()
    }

    /// Stream `source` into place for `container/name`, returning the size
    /// and hex digest of what was written.
    async fn write_payload(
        &self,
        container: &str,
        name: &str,
        source: ByteStream,
    ) -> StorageResult<(u64, String)> {
        let file_path = self.object_path(container, name);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: u64 = 0;
        let mut hasher = Hasher::new(self.hash_type);
        let mut chunks = chunked(source, self.config.chunk_size, false);
        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size += chunk.len() as u64;
            hasher.update(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        Ok((size, hasher.finalize_hex()))
    }

    /// Digest of the payload currently stored for `container/name`.
    async fn stored_digest(&self, container: &str, name: &str) -> StorageResult<String> {
        let mut stream = ReaderStream::with_capacity(
            File::open(self.object_path(container, name)).await?,
            READ_BUFFER_SIZE,
        );
        let mut hasher = Hasher::new(self.hash_type);
        while let Some(chunk) = stream.try_next().await? {
            hasher.update(&chunk);
        }
        Ok(hasher.finalize_hex())
    }

    async fn store(
        &self,
        source: ByteStream,
        container: &Container,
        object_name: &str,
        options: UploadOptions,
    ) -> StorageResult<Object> {
        Self::ensure_key_safe(object_name)?;
        let container = self.fetch_container(&container.name).await?;
        let content_type = content_type_for(object_name, options.content_type.as_deref());

        let (size, hash) = self.write_payload(&container.name, object_name, source).await?;
        if options.verify_hash.unwrap_or(self.config.verify_hash) {
            let stored = self.stored_digest(&container.name, object_name).await?;
            if stored != hash {
                warn!(
                    container = %container.name,
                    object = object_name,
                    "stored payload digest differs"
                );
                return Err(StorageError::ObjectHashMismatch {
                    object: object_name.to_string(),
                    expected: hash,
                    actual: stored,
                });
            }
        }

        let meta_json = encode_metadata(&options.meta_data)?;
        let extra_json = encode_metadata(&options.extra)?;
        let insert_result = sqlx::query_as::<_, ObjectRow>(&format!(
            r#"
            INSERT INTO objects (
                id, container, name, size_bytes, hash, hash_type,
                content_type, meta_data, extra, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(container, name) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                hash = excluded.hash,
                hash_type = excluded.hash_type,
                content_type = excluded.content_type,
                meta_data = excluded.meta_data,
                extra = excluded.extra,
                last_modified = excluded.last_modified
            RETURNING {}
            "#,
            OBJECT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&container.name)
        .bind(object_name)
        .bind(size as i64)
        .bind(&hash)
        .bind(self.hash_type.to_string())
        .bind(&content_type)
        .bind(meta_json)
        .bind(extra_json)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(row) => {
                debug!(container = %container.name, object = object_name, size, "object stored");
                row.into_object(&container)
            }
            Err(err) => {
                let _ = fs::remove_file(self.object_path(&container.name, object_name)).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    async fn open_payload(&self, object: &Object) -> StorageResult<File> {
        let path = self.object_path(&object.container.name, &object.name);
        File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::object_not_found(&object.container.name, &object.name)
            } else {
                StorageError::Io(err)
            }
        })
    }

    /// Remove empty directories from `start` up to, not including, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageDriver for LocalStorageDriver {
    fn name(&self) -> &'static str {
        LOCAL_DRIVER_NAME
    }

    fn hash_type(&self) -> HashType {
        self.hash_type
    }

    fn supports_chunked_encoding(&self) -> bool {
        true
    }

    fn supports_multipart_upload(&self) -> bool {
        false
    }

    async fn list_containers(&self) -> StorageResult<Vec<Container>> {
        let rows = sqlx::query_as::<_, ContainerRow>(
            "SELECT name, created_at FROM containers ORDER BY name",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(Self::container_record).collect())
    }

    async fn get_container(&self, name: &str) -> StorageResult<Container> {
        self.fetch_container(name).await
    }

    async fn create_container(&self, name: &str) -> StorageResult<Container> {
        validate_dns_name(name)?;
        let created_at = Utc::now();
        match sqlx::query("INSERT INTO containers (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(created_at)
            .execute(&*self.db)
            .await
        {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StorageError::ContainerAlreadyExists(name.to_string()));
            }
            Err(err) => return Err(StorageError::Sqlx(err)),
        }
        fs::create_dir_all(self.container_root(name)).await?;
        info!(container = name, "container created");
        Ok(Self::container_record(ContainerRow {
            name: name.to_string(),
            created_at,
        }))
    }

    async fn delete_container(&self, container: &Container) -> StorageResult<bool> {
        let container = self.fetch_container(&container.name).await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM objects WHERE container = ?")
            .bind(&container.name)
            .fetch_one(&*self.db)
            .await?;
        if count > 0 {
            return Err(StorageError::ContainerIsNotEmpty(container.name.clone()));
        }

        sqlx::query("DELETE FROM containers WHERE name = ?")
            .bind(&container.name)
            .execute(&*self.db)
            .await?;

        let root = self.container_root(&container.name);
        if let Err(err) = fs::remove_dir_all(&root).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove container directory {} after delete: {}",
                    root.display(),
                    err
                );
            }
        }
        info!(container = %container.name, "container deleted");
        Ok(true)
    }

    fn iterate_container_objects<'a>(
        &'a self,
        container: &'a Container,
        prefix: Option<&'a str>,
    ) -> BoxStream<'a, StorageResult<Object>> {
        stream::try_unfold(Some(None::<String>), move |after| async move {
            let Some(after) = after else {
                return Ok(None);
            };
            if after.is_none() {
                // Surface a missing container instead of an empty listing.
                self.fetch_container(&container.name).await?;
            }
            let page = self.list_page(container, prefix, after.as_deref()).await?;
            let next = if page.len() as i64 == LIST_PAGE_SIZE {
                page.last().map(|o| Some(o.name.clone()))
            } else {
                None
            };
            Ok::<_, StorageError>(Some((page, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn get_object(&self, container_name: &str, object_name: &str) -> StorageResult<Object> {
        let container = self.fetch_container(container_name).await?;
        self.fetch_object(&container, object_name).await
    }

    async fn delete_object(&self, object: &Object) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM objects WHERE container = ? AND name = ?")
            .bind(&object.container.name)
            .bind(&object.name)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::object_not_found(&object.container.name, &object.name));
        }

        let file_path = self.object_path(&object.container.name, &object.name);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let root = self.container_root(&object.container.name);
            self.prune_empty_dirs(parent, &root).await;
        }
        Ok(true)
    }

    async fn upload_object(
        &self,
        file_path: &Path,
        container: &Container,
        object_name: &str,
        options: UploadOptions,
    ) -> StorageResult<Object> {
        let source = ByteSource::from_file(file_path).await?;
        self.store(source.into_stream(), container, object_name, options)
            .await
    }

    async fn upload_object_via_stream(
        &self,
        source: ByteSource,
        container: &Container,
        object_name: &str,
        options: UploadOptions,
    ) -> StorageResult<Object> {
        self.store(source.into_stream(), container, object_name, options)
            .await
    }

    async fn download_object_as_stream(
        &self,
        object: &Object,
        chunk_size: Option<usize>,
    ) -> StorageResult<ByteStream> {
        let file = self.open_payload(object).await?;
        let stream = ReaderStream::with_capacity(file, READ_BUFFER_SIZE).boxed();
        Ok(rechunk(stream, chunk_size))
    }

    async fn download_object_range_as_stream(
        &self,
        object: &Object,
        start_bytes: u64,
        end_bytes: Option<u64>,
        chunk_size: Option<usize>,
    ) -> StorageResult<ByteStream> {
        let range = ByteRange::new(start_bytes, end_bytes, object.size)?;
        let mut file = self.open_payload(object).await?;
        file.seek(SeekFrom::Start(range.start)).await?;
        let stream = ReaderStream::with_capacity(file.take(range.len()), READ_BUFFER_SIZE).boxed();
        Ok(rechunk(stream, chunk_size))
    }
}

fn encode_metadata(meta: &Metadata) -> StorageResult<String> {
    serde_json::to_string(meta)
        .map_err(|err| StorageError::Library(format!("encoding metadata: {}", err)))
}

fn decode_metadata(raw: &str) -> StorageResult<Metadata> {
    serde_json::from_str(raw)
        .map_err(|err| StorageError::MalformedResponse(format!("stored metadata: {}", err)))
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsafe_keys_are_rejected() {
        for bad in ["../escape", "a/../b", "a\\b", "dir/", "./x", ""] {
            assert!(LocalStorageDriver::ensure_key_safe(bad).is_err(), "{bad} should be rejected");
        }
        assert!(LocalStorageDriver::ensure_key_safe("a/b/c.txt").is_ok());
        assert!(LocalStorageDriver::ensure_key_safe("v1..2.txt").is_ok());
    }

    #[test]
    fn shards_are_stable_hex_pairs() {
        let (a, b) = LocalStorageDriver::object_shards("photos", "cat.png");
        assert_eq!((a.len(), b.len()), (2, 2));
        assert_eq!(LocalStorageDriver::object_shards("photos", "cat.png"), (a, b));
    }
}
