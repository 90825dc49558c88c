//! Represents a container (bucket), the named namespace holding objects.

use crate::{
    driver::{StorageDriver, UploadOptions},
    errors::{StorageError, StorageResult},
    models::{metadata::Metadata, object::Object},
    transfer::chunks::ByteSource,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

const DNS_NAME_MIN_LEN: usize = 3;
const DNS_NAME_MAX_LEN: usize = 63;

/// A container as reported by its driver.
///
/// Holds no connection: every remote operation goes through the driver
/// named in `driver`, passed explicitly to the delegation helpers below.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Container {
    /// Name, unique within the account.
    pub name: String,

    /// Provider metadata (creation time, ETag, object count...).
    pub extra: Metadata,

    /// Name of the driver that produced this record.
    pub driver: String,
}

impl Container {
    pub fn new(name: impl Into<String>, extra: Metadata, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra,
            driver: driver.into(),
        }
    }

    fn check_driver<D: StorageDriver + ?Sized>(&self, driver: &D) -> StorageResult<()> {
        if self.driver != driver.name() {
            return Err(StorageError::Library(format!(
                "container `{}` belongs to driver `{}`, not `{}`",
                self.name,
                self.driver,
                driver.name()
            )));
        }
        Ok(())
    }

    pub async fn list_objects<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
    ) -> StorageResult<Vec<Object>> {
        self.check_driver(driver)?;
        driver.list_container_objects(self).await
    }

    pub async fn get_object<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        object_name: &str,
    ) -> StorageResult<Object> {
        self.check_driver(driver)?;
        driver.get_object(&self.name, object_name).await
    }

    pub async fn upload_object<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        file_path: &Path,
        object_name: &str,
        options: UploadOptions,
    ) -> StorageResult<Object> {
        self.check_driver(driver)?;
        driver
            .upload_object(file_path, self, object_name, options)
            .await
    }

    pub async fn upload_object_via_stream<D: StorageDriver + ?Sized>(
        &self,
        driver: &D,
        source: ByteSource,
        object_name: &str,
        options: UploadOptions,
    ) -> StorageResult<Object> {
        self.check_driver(driver)?;
        driver
            .upload_object_via_stream(source, self, object_name, options)
            .await
    }

    pub async fn delete<D: StorageDriver + ?Sized>(&self, driver: &D) -> StorageResult<bool> {
        self.check_driver(driver)?;
        driver.delete_container(self).await
    }
}

/// Validate a DNS-style container name (OSS buckets, local containers).
///
/// Rules:
/// - 3 to 63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn validate_dns_name(name: &str) -> StorageResult<()> {
    if name.trim() != name {
        return Err(StorageError::invalid_name(
            name,
            "cannot begin or end with whitespace",
        ));
    }

    let len = name.len();
    if !(DNS_NAME_MIN_LEN..=DNS_NAME_MAX_LEN).contains(&len) {
        return Err(StorageError::invalid_name(
            name,
            "must be between 3 and 63 characters",
        ));
    }

    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(StorageError::invalid_name(
            name,
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }

    if name.starts_with('.') || name.ends_with('.') || name.starts_with('-') || name.ends_with('-')
    {
        return Err(StorageError::invalid_name(
            name,
            "must start and end with a lowercase letter or digit",
        ));
    }

    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(StorageError::invalid_name(
            name,
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }

    if is_ipv4_like(name) {
        return Err(StorageError::invalid_name(
            name,
            "must not be formatted like an IP address",
        ));
    }

    Ok(())
}

/// Validate an Azure container name: 3 to 63 chars of lowercase letters,
/// digits and single hyphens, starting and ending alphanumeric.
pub fn validate_azure_name(name: &str) -> StorageResult<()> {
    let len = name.len();
    if !(DNS_NAME_MIN_LEN..=DNS_NAME_MAX_LEN).contains(&len) {
        return Err(StorageError::invalid_name(
            name,
            "must be between 3 and 63 characters",
        ));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-'))
    {
        return Err(StorageError::invalid_name(
            name,
            "allowed characters are lowercase letters, digits, and hyphens",
        ));
    }
    if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
        return Err(StorageError::invalid_name(
            name,
            "hyphens must be single and surrounded by letters or digits",
        ));
    }
    Ok(())
}

/// Validate a flat container name: non-empty, no `/`, bounded length.
pub fn validate_flat_name(name: &str, max_len: usize) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::invalid_name(name, "must not be empty"));
    }
    if name.contains('/') {
        return Err(StorageError::invalid_name(name, "must not contain `/`"));
    }
    if name.len() > max_len {
        return Err(StorageError::invalid_name(
            name,
            format!("must be at most {} bytes", max_len),
        ));
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}
