//! Bounded-memory batch processing.
//!
//! Each chunk is moved into the processing function and dropped when that
//! call returns, before the next chunk is assembled. Peak working memory is
//! one chunk plus whatever the function itself keeps.

use std::future::Future;

use futures::{Stream, StreamExt};
use tracing::debug;

use crate::error::{GuardError, GuardResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedProcessor {
    chunk_size: usize,
}

impl ChunkedProcessor {
    pub fn new(chunk_size: usize) -> GuardResult<Self> {
        if chunk_size == 0 {
            return Err(GuardError::InvalidArgument(
                "chunk size must be at least 1".to_string(),
            ));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `items` into contiguous chunks and concatenate `f`'s outputs in
    /// order. `f` may filter or aggregate, so the output length is free.
    /// Empty input returns empty without calling `f`.
    pub fn process_in_chunks<T, U, F>(&self, items: Vec<T>, mut f: F) -> Vec<U>
    where
        F: FnMut(Vec<T>) -> Vec<U>,
    {
        let mut output = Vec::new();
        let mut source = items.into_iter();
        let mut index = 0usize;
        loop {
            let chunk: Vec<T> = source.by_ref().take(self.chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            debug!(chunk = index, size = chunk.len(), "Processing chunk");
            output.extend(f(chunk));
            index += 1;
        }
        output
    }

    /// Chunk a possibly unbounded stream and run an async, fallible `f` per
    /// chunk. Stops at the first error.
    pub async fn process_stream<S, T, U, E, F, Fut>(&self, stream: S, mut f: F) -> Result<Vec<U>, E>
    where
        S: Stream<Item = T>,
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = Result<Vec<U>, E>>,
    {
        let mut output = Vec::new();
        let chunks = stream.chunks(self.chunk_size);
        futures::pin_mut!(chunks);
        let mut index = 0usize;
        while let Some(chunk) = chunks.next().await {
            debug!(chunk = index, size = chunk.len(), "Processing stream chunk");
            output.extend(f(chunk).await?);
            index += 1;
        }
        Ok(output)
    }

    /// Like [`process_stream`](Self::process_stream) but keeps no output, for
    /// sinks such as persisting crawled pages. Returns the number of items seen.
    pub async fn drain_stream<S, T, E, F, Fut>(&self, stream: S, mut f: F) -> Result<usize, E>
    where
        S: Stream<Item = T>,
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let chunks = stream.chunks(self.chunk_size);
        futures::pin_mut!(chunks);
        let mut seen = 0usize;
        while let Some(chunk) = chunks.next().await {
            seen += chunk.len();
            f(chunk).await?;
        }
        Ok(seen)
    }
}
