//! Uniform object storage across providers.
//!
//! A [`StorageDriver`] exposes containers and objects for one backend; the
//! shared transfer engine in [`transfer`] implements the upload strategies
//! (direct, chunked streaming, multipart with abort on failure) and the
//! download paths (full, streamed, ranged) every driver builds on.
//!
//! ```no_run
//! use multicloud_storage::{
//!     ByteSource, LocalStorageDriver, StorageDriver, TransferConfig, UploadOptions,
//! };
//!
//! # async fn demo() -> multicloud_storage::StorageResult<()> {
//! let driver = LocalStorageDriver::open("/var/lib/blobs", TransferConfig::default()).await?;
//! let container = driver.create_container("backups").await?;
//! let object = driver
//!     .upload_object_via_stream(
//!         ByteSource::from_bytes("hello"),
//!         &container,
//!         "greeting.txt",
//!         UploadOptions::new(),
//!     )
//!     .await?;
//! assert_eq!(object.size, 5);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod driver;
pub mod drivers;
pub mod errors;
pub mod models;
pub mod transfer;

pub use config::TransferConfig;
pub use connection::{Connection, HttpConnection, Request, RequestBody, Response};
pub use driver::{StorageDriver, UploadOptions};
pub use drivers::{
    azure::AzureBlobsDriver, local::LocalStorageDriver, oss::OssDriver, swift::SwiftDriver,
};
pub use errors::{StorageError, StorageResult};
pub use models::{container::Container, metadata::Metadata, object::Object};
pub use transfer::{
    chunks::{ByteSource, ByteStream},
    hashing::HashType,
};
