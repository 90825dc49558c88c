//! Byte sources and chunk iteration.
//!
//! Everything that moves payload bytes speaks [`ByteStream`]: a finite,
//! forward-only stream of `io::Result<Bytes>`. [`ByteSource`] is the upload
//! input built on top of it; it is consumed by value, so a source can be read
//! at most once.

use crate::transfer::hashing::{HashType, Hasher};
use bytes::{Bytes, BytesMut};
use futures::{
    Stream, StreamExt, TryStreamExt, future,
    stream::{self, BoxStream},
};
use std::{
    io,
    path::Path,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use tokio::{fs::File, io::AsyncRead};
use tokio_util::io::ReaderStream;

/// Owned, sendable stream of payload chunks.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Read buffer used when adapting files and readers.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Upload input: a single-use source of sequential byte chunks.
pub struct ByteSource {
    inner: ByteStream,
}

impl ByteSource {
    /// A source yielding one in-memory buffer.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::from_stream(stream::iter([Ok(data)]))
    }

    /// A source yielding the given buffers in order.
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        I::IntoIter: Send + 'static,
        B: Into<Bytes>,
    {
        Self::from_stream(stream::iter(chunks.into_iter().map(|c| Ok(c.into()))))
    }

    /// A source with no bytes at all.
    pub fn empty() -> Self {
        Self::from_stream(stream::empty())
    }

    /// Wrap an arbitrary chunk stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    /// Stream any async reader in `READ_BUFFER_SIZE` pieces.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::from_stream(ReaderStream::with_capacity(reader, READ_BUFFER_SIZE))
    }

    /// Open `path` and stream its contents.
    pub async fn from_file(path: &Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self::from_reader(file))
    }

    pub fn into_stream(self) -> ByteStream {
        self.inner
    }
}

impl Stream for ByteSource {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

struct ChunkState {
    source: ByteStream,
    buf: BytesMut,
    done: bool,
}

/// Re-chunk `source` into pieces of at most `chunk_size` bytes.
///
/// Without `fill`, upstream pieces are only split, never merged. With
/// `fill`, short upstream reads are coalesced so every chunk except the last
/// is exactly `chunk_size` bytes. Empty chunks are never produced, so an
/// empty source yields an empty stream.
pub fn chunked(source: ByteStream, chunk_size: usize, fill: bool) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    let state = ChunkState {
        source,
        buf: BytesMut::new(),
        done: false,
    };

    stream::try_unfold(state, move |mut st| async move {
        loop {
            if st.buf.len() >= chunk_size {
                let chunk = st.buf.split_to(chunk_size).freeze();
                return Ok(Some((chunk, st)));
            }
            if !st.buf.is_empty() && (st.done || !fill) {
                let chunk = st.buf.split().freeze();
                return Ok(Some((chunk, st)));
            }
            if st.done {
                return Ok(None);
            }
            match st.source.next().await {
                Some(Ok(piece)) => st.buf.extend_from_slice(&piece),
                Some(Err(err)) => return Err(err),
                None => st.done = true,
            }
        }
    })
    .boxed()
}

/// Drain a stream into one buffer. Only for transports that need the total
/// length before the first byte is sent.
pub async fn exhaust(source: ByteStream) -> io::Result<Bytes> {
    let buf = source
        .try_fold(BytesMut::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await?;
    Ok(buf.freeze())
}

/// Wrap each chunk in HTTP/1.1 chunked-encoding framing and append the
/// zero-length terminator. Input chunks must be non-empty.
///
/// The stream ends at the first error, so a failed body is never closed
/// with a terminator the server would accept as complete.
pub fn frame_chunked(source: ByteStream) -> ByteStream {
    let framed = source.map_ok(|chunk| {
        let header = format!("{:X}\r\n", chunk.len());
        let mut out = BytesMut::with_capacity(header.len() + chunk.len() + 2);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&chunk);
        out.extend_from_slice(b"\r\n");
        out.freeze()
    });
    framed
        .chain(stream::once(async { Ok(Bytes::from_static(b"0\r\n\r\n")) }))
        .scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            *failed = item.is_err();
            future::ready(Some(item))
        })
        .boxed()
}

/// Running digest and byte count shared with a stream that is consumed
/// elsewhere (e.g. by a connection sending a request body).
#[derive(Clone, Debug)]
pub struct StreamTally {
    inner: Arc<Mutex<TallyState>>,
}

#[derive(Debug)]
struct TallyState {
    hasher: Hasher,
    bytes: u64,
    failure: Option<(io::ErrorKind, String)>,
}

impl StreamTally {
    pub fn new(hash_type: HashType) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TallyState {
                hasher: Hasher::new(hash_type),
                bytes: 0,
                failure: None,
            })),
        }
    }

    /// Pass `source` through unchanged while feeding every chunk to the tally.
    /// The first source error is remembered for [`StreamTally::failure`].
    pub fn observe(&self, source: ByteStream) -> ByteStream {
        let on_chunk = self.inner.clone();
        let on_error = self.inner.clone();
        source
            .inspect_ok(move |chunk| {
                if let Ok(mut state) = on_chunk.lock() {
                    state.hasher.update(chunk);
                    state.bytes += chunk.len() as u64;
                }
            })
            .inspect_err(move |err| {
                if let Ok(mut state) = on_error.lock() {
                    state
                        .failure
                        .get_or_insert_with(|| (err.kind(), err.to_string()));
                }
            })
            .boxed()
    }

    /// Digest and byte count of everything observed so far.
    pub fn snapshot(&self) -> (String, u64) {
        let state = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        (state.hasher.clone().finalize_hex(), state.bytes)
    }

    /// The error the observed source failed with, if any.
    pub fn failure(&self) -> Option<io::Error> {
        let state = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state
            .failure
            .as_ref()
            .map(|(kind, message)| io::Error::new(*kind, message.clone()))
    }
}
