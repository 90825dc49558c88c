//! Error taxonomy surfaced by every driver and by the transfer engine.
//!
//! Drivers translate provider status codes into these variants at their
//! boundary; callers match on the typed variants and never see a raw vendor
//! error envelope.

use crate::connection::Response;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Longest response body kept inside [`StorageError::UnexpectedResponse`].
const MAX_ERROR_BODY_LEN: usize = 2048;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("container `{0}` does not exist")]
    ContainerDoesNotExist(String),
    #[error("container `{0}` already exists")]
    ContainerAlreadyExists(String),
    #[error("container `{0}` is not empty")]
    ContainerIsNotEmpty(String),
    #[error("container name `{name}` invalid: {reason}")]
    InvalidContainerName { name: String, reason: String },
    #[error("object `{object}` does not exist in container `{container}`")]
    ObjectDoesNotExist { container: String, object: String },
    #[error("hash mismatch for object `{object}`: expected {expected}, got {actual}")]
    ObjectHashMismatch {
        object: String,
        expected: String,
        actual: String,
    },
    #[error("invalid object name `{0}`")]
    InvalidObjectName(String),
    #[error("invalid byte range: {0}")]
    InvalidRange(String),
    #[error("invalid destination {}: {reason}", path.display())]
    InvalidDestination { path: PathBuf, reason: String },
    #[error("invalid transfer configuration: {0}")]
    InvalidConfig(String),
    #[error("unexpected response status {status}: {body}")]
    UnexpectedResponse { status: u16, body: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("{0}")]
    Library(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Build the generic error for a response no driver rule matched.
    ///
    /// The body is drained (streamed bodies included) and truncated so the
    /// error stays printable.
    pub async fn unexpected(response: Response) -> Self {
        let status = response.status.as_u16();
        let body = match response.text().await {
            Ok(text) => truncate(text),
            Err(err) => format!("<unreadable body: {}>", err),
        };
        StorageError::UnexpectedResponse { status, body }
    }

    pub fn object_not_found(container: &str, object: &str) -> Self {
        StorageError::ObjectDoesNotExist {
            container: container.to_string(),
            object: object.to_string(),
        }
    }

    pub fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
        StorageError::InvalidContainerName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_ERROR_BODY_LEN {
        let mut cut = MAX_ERROR_BODY_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}
