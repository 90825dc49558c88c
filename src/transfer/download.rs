//! Download side of the transfer engine: range validation, response
//! handling and saving streams to disk.

use crate::{
    connection::Response,
    errors::{StorageError, StorageResult},
    transfer::chunks::{ByteStream, chunked},
};
use futures::{StreamExt, TryStreamExt, stream};
use http::StatusCode;
use std::{
    io::ErrorKind,
    path::{MAIN_SEPARATOR, Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// A validated, end-inclusive byte range of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Last byte index requested; `None` reads to the end of the object.
    pub end: Option<u64>,
    object_size: u64,
}

impl ByteRange {
    /// Validate `start..=end` against an object of `object_size` bytes.
    ///
    /// `end == object_size` is accepted and read as "to the end", so callers
    /// passing an exclusive end for the whole tail get what they meant.
    pub fn new(start: u64, end: Option<u64>, object_size: u64) -> StorageResult<Self> {
        if start >= object_size {
            return Err(StorageError::InvalidRange(format!(
                "start {} is beyond the object size {}",
                start, object_size
            )));
        }
        let end = match end {
            None => None,
            Some(end) if end == start => {
                return Err(StorageError::InvalidRange(
                    "start_bytes and end_bytes can't be the same".into(),
                ));
            }
            Some(end) if end < start => {
                return Err(StorageError::InvalidRange(format!(
                    "start_bytes {} must be smaller than end_bytes {}",
                    start, end
                )));
            }
            Some(end) if end > object_size => {
                return Err(StorageError::InvalidRange(format!(
                    "end_bytes {} is larger than the object size {}",
                    end, object_size
                )));
            }
            Some(end) if end == object_size => None,
            Some(end) => Some(end),
        };
        Ok(Self {
            start,
            end,
            object_size,
        })
    }

    /// Last byte index the range covers.
    pub fn last(&self) -> u64 {
        self.end.unwrap_or(self.object_size - 1)
    }

    /// Number of bytes the range covers; never zero.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.last() - self.start + 1
    }

    /// `bytes=<start>-<end>` header value (HTTP ranges are end-inclusive).
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Turn a range response into a stream of exactly the requested bytes.
///
/// `206` is passed through; `200` means the backend ignored the range and
/// sent the whole object, so the window is cut out locally.
pub async fn range_stream(response: Response, range: &ByteRange) -> StorageResult<ByteStream> {
    match response.status {
        StatusCode::PARTIAL_CONTENT => Ok(response.into_stream()),
        StatusCode::OK => {
            debug!(
                start = range.start,
                len = range.len(),
                "range ignored by backend, slicing locally"
            );
            Ok(slice_stream(response.into_stream(), range.start, range.len()))
        }
        StatusCode::RANGE_NOT_SATISFIABLE => Err(StorageError::InvalidRange(range.header_value())),
        _ => Err(StorageError::unexpected(response).await),
    }
}

/// Skip `skip` bytes of `source`, then yield at most `take` bytes.
pub fn slice_stream(source: ByteStream, skip: u64, take: u64) -> ByteStream {
    stream::try_unfold(
        (source, skip, take),
        |(mut source, mut skip, mut take)| async move {
            while take > 0 {
                let Some(mut chunk) = source.try_next().await? else {
                    return Ok(None);
                };
                if skip > 0 {
                    if chunk.len() as u64 <= skip {
                        skip -= chunk.len() as u64;
                        continue;
                    }
                    chunk = chunk.slice(skip as usize..);
                    skip = 0;
                }
                if chunk.len() as u64 > take {
                    chunk.truncate(take as usize);
                }
                take -= chunk.len() as u64;
                if !chunk.is_empty() {
                    return Ok(Some((chunk, (source, skip, take))));
                }
            }
            Ok(None)
        },
    )
    .boxed()
}

/// Re-chunk transport output to at most `chunk_size` bytes when asked to.
pub fn rechunk(source: ByteStream, chunk_size: Option<usize>) -> ByteStream {
    match chunk_size {
        Some(size) => chunked(source, size, false),
        None => source,
    }
}

/// Work out the file a download should end up in.
///
/// A destination naming a directory (or ending in a separator) gets the
/// object's base name appended. The parent directory must already exist and
/// an existing file is only accepted with `overwrite_existing`.
pub async fn resolve_destination(
    object_name: &str,
    destination: &Path,
    overwrite_existing: bool,
) -> StorageResult<PathBuf> {
    let as_text = destination.to_string_lossy();
    let names_directory = as_text.ends_with('/')
        || as_text.ends_with(MAIN_SEPARATOR)
        || fs::metadata(destination)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);

    let target = if names_directory {
        let base = object_name
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .ok_or_else(|| StorageError::InvalidObjectName(object_name.to_string()))?;
        destination.join(base)
    } else {
        destination.to_path_buf()
    };

    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let parent_is_dir = fs::metadata(&parent)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !parent_is_dir {
        return Err(StorageError::InvalidDestination {
            path: target,
            reason: "parent directory does not exist".into(),
        });
    }

    match fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => Err(StorageError::InvalidDestination {
            path: target,
            reason: "is a directory".into(),
        }),
        Ok(_) if !overwrite_existing => Err(StorageError::InvalidDestination {
            path: target,
            reason: "file already exists and overwrite_existing is false".into(),
        }),
        Ok(_) => Ok(target),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(target),
        Err(err) => Err(StorageError::Io(err)),
    }
}

/// Write `stream` to `target` and check that `expected_size` bytes arrived.
///
/// Bytes go to a temporary sibling first and are renamed into place, so an
/// existing file is only replaced by a complete download. A short or long
/// download, or a local write error, returns `Ok(false)`: the temporary file
/// is removed when `delete_on_failure` is set and otherwise left at `target`.
/// A transport error while reading is returned as an error after cleanup.
pub async fn save_to_file(
    mut stream: ByteStream,
    target: &Path,
    expected_size: u64,
    delete_on_failure: bool,
) -> StorageResult<bool> {
    let tmp_path = temp_sibling(target);
    let mut file = File::create(&tmp_path).await?;
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };
        if let Err(err) = file.write_all(&chunk).await {
            warn!(path = %target.display(), error = %err, "write failed during download");
            drop(file);
            finish_failed(&tmp_path, target, delete_on_failure).await;
            return Ok(false);
        }
        written += chunk.len() as u64;
    }

    let flushed = match file.flush().await {
        Ok(()) => file.sync_all().await,
        Err(err) => Err(err),
    };
    drop(file);
    if let Err(err) = flushed {
        warn!(path = %target.display(), error = %err, "flush failed during download");
        finish_failed(&tmp_path, target, delete_on_failure).await;
        return Ok(false);
    }

    if written != expected_size {
        warn!(
            path = %target.display(),
            written,
            expected = expected_size,
            "downloaded size does not match object size"
        );
        finish_failed(&tmp_path, target, delete_on_failure).await;
        return Ok(false);
    }

    if let Err(err) = fs::rename(&tmp_path, target).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StorageError::Io(err));
    }
    debug!(path = %target.display(), bytes = written, "download saved");
    Ok(true)
}

fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}.part", name, Uuid::new_v4()))
}

async fn finish_failed(tmp_path: &Path, target: &Path, delete_on_failure: bool) {
    if delete_on_failure {
        if let Err(err) = fs::remove_file(tmp_path).await {
            debug!(path = %tmp_path.display(), error = %err, "could not remove partial download");
        }
    } else if let Err(err) = fs::rename(tmp_path, target).await {
        debug!(path = %target.display(), error = %err, "could not keep partial download");
    }
}
