//! Scoped Buffer Manager
//!
//! Stages host bytes into guest memory and guarantees each reservation is
//! released exactly once: on normal return, on error, and when a future or
//! stream holding it is dropped half way.

use futures::Stream;
use futures::stream::FusedStream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, error};

use crate::error::{OcrError, OcrResult};
use crate::guest::{GuestBuffer, RegionAllocator};

/// One staged region, released when dropped
pub struct ScopedBuffer<A: RegionAllocator + ?Sized> {
    allocator: Arc<A>,
    region: GuestBuffer,
    released: bool,
}

impl<A: RegionAllocator + ?Sized> ScopedBuffer<A> {
    /// Reserve a region sized to `bytes` and copy `bytes` into it.
    pub fn stage(allocator: Arc<A>, bytes: &[u8]) -> OcrResult<Self> {
        if bytes.is_empty() {
            return Err(OcrError::EmptyBuffer);
        }
        let length = u32::try_from(bytes.len()).map_err(|_| OcrError::Allocation {
            size: bytes.len() as u64,
        })?;

        let address = allocator.reserve(length)?;
        let buffer = Self {
            allocator,
            region: GuestBuffer::new(address, length),
            released: false,
        };
        // a failed copy drops `buffer`, which releases the reservation
        buffer.allocator.write(address, bytes)?;

        debug!("Staged {} bytes at {:#x}", length, address.0);
        Ok(buffer)
    }

    pub fn region(&self) -> GuestBuffer {
        self.region
    }

    /// Release now and report the outcome instead of logging it.
    pub fn release(mut self) -> OcrResult<()> {
        self.released = true;
        self.allocator
            .release(self.region.address, self.region.length)
    }
}

impl<A: RegionAllocator + ?Sized + 'static> ScopedBuffer<A> {
    /// Run the blocking guest call `call` against this region on tokio's
    /// blocking pool.
    ///
    /// The buffer travels with the call and comes back beside its result, so
    /// it is released only after `call` has returned, even when the awaiting
    /// future is dropped first.
    pub async fn run_blocking<F, T>(self, call: F) -> OcrResult<(Self, T)>
    where
        F: FnOnce(GuestBuffer) -> OcrResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (buffer, result) = tokio::task::spawn_blocking(move || {
            let result = call(self.region);
            (self, result)
        })
        .await?;
        Ok((buffer, result?))
    }
}

impl<A: RegionAllocator + ?Sized> Drop for ScopedBuffer<A> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self
            .allocator
            .release(self.region.address, self.region.length)
        {
            error!(
                "Failed to release guest buffer {:#x} ({} bytes): {}",
                self.region.address.0, self.region.length, e
            );
        }
    }
}

/// Several staged regions, released in reverse acquisition order
pub struct ScopedBuffers<A: RegionAllocator + ?Sized> {
    buffers: Vec<ScopedBuffer<A>>,
}

impl<A: RegionAllocator + ?Sized> ScopedBuffers<A> {
    /// Stage every blob in order. If one fails, the ones already staged are
    /// released before the error is returned.
    pub fn stage_all(allocator: Arc<A>, blobs: &[&[u8]]) -> OcrResult<Self> {
        let mut staged = Self {
            buffers: Vec::with_capacity(blobs.len()),
        };
        for blob in blobs {
            staged
                .buffers
                .push(ScopedBuffer::stage(Arc::clone(&allocator), blob)?);
        }
        Ok(staged)
    }

    pub fn regions(&self) -> Vec<GuestBuffer> {
        self.buffers.iter().map(ScopedBuffer::region).collect()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Release every region; all are attempted and the first failure is
    /// returned.
    pub fn release(mut self) -> OcrResult<()> {
        let mut first_error = None;
        while let Some(buffer) = self.buffers.pop() {
            if let Err(e) = buffer.release() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<A: RegionAllocator + ?Sized + 'static> ScopedBuffers<A> {
    /// Batch form of [`ScopedBuffer::run_blocking`]: every region stays
    /// reserved until `call` has returned.
    pub async fn run_blocking<F, T>(self, call: F) -> OcrResult<(Self, T)>
    where
        F: FnOnce(Vec<GuestBuffer>) -> OcrResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let regions = self.regions();
        let (buffers, result) = tokio::task::spawn_blocking(move || {
            let result = call(regions);
            (self, result)
        })
        .await?;
        Ok((buffers, result?))
    }
}

impl<A: RegionAllocator + ?Sized> Drop for ScopedBuffers<A> {
    fn drop(&mut self) {
        while let Some(buffer) = self.buffers.pop() {
            drop(buffer);
        }
    }
}

fn settle<T>(result: OcrResult<T>, released: OcrResult<()>) -> OcrResult<T> {
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), _) | (Ok(_), Err(e)) => Err(e),
    }
}

/// Stage `bytes`, run `body` with the region, then release it.
pub async fn with_buffer<A, F, Fut, T>(allocator: &Arc<A>, bytes: &[u8], body: F) -> OcrResult<T>
where
    A: RegionAllocator + ?Sized,
    F: FnOnce(GuestBuffer) -> Fut,
    Fut: Future<Output = OcrResult<T>>,
{
    let buffer = ScopedBuffer::stage(Arc::clone(allocator), bytes)?;
    let result = body(buffer.region()).await;
    settle(result, buffer.release())
}

/// Stage every blob, run `body` with all regions (in blob order), then
/// release them in reverse order.
pub async fn with_buffers<A, F, Fut, T>(
    allocator: &Arc<A>,
    blobs: &[&[u8]],
    body: F,
) -> OcrResult<T>
where
    A: RegionAllocator + ?Sized,
    F: FnOnce(Vec<GuestBuffer>) -> Fut,
    Fut: Future<Output = OcrResult<T>>,
{
    let buffers = ScopedBuffers::stage_all(Arc::clone(allocator), blobs)?;
    let result = body(buffers.regions()).await;
    settle(result, buffers.release())
}

/// Stage `bytes` and keep the region alive for as long as the stream
/// `body` produces.
///
/// The region is released once the stream is exhausted, yields an error,
/// or is dropped.
pub async fn with_buffer_stream<A, F, Fut, S, T>(
    allocator: &Arc<A>,
    bytes: &[u8],
    body: F,
) -> OcrResult<StagedStream<A, S>>
where
    A: RegionAllocator + ?Sized,
    F: FnOnce(GuestBuffer) -> Fut,
    Fut: Future<Output = OcrResult<S>>,
    S: FusedStream<Item = OcrResult<T>> + Unpin,
{
    let buffer = ScopedBuffer::stage(Arc::clone(allocator), bytes)?;
    let stream = body(buffer.region()).await?;
    Ok(StagedStream::new(buffer, stream))
}

/// A stream that owns the guest region its items are computed from
pub struct StagedStream<A: RegionAllocator + ?Sized, S> {
    // declared first: the region goes before the inner stream's own state
    buffer: Option<ScopedBuffer<A>>,
    stream: S,
    /// Release failure observed alongside the final item
    deferred: Option<OcrError>,
}

impl<A: RegionAllocator + ?Sized, S> StagedStream<A, S> {
    /// Tie `buffer` to `stream`: it is released when the stream ends
    pub fn new(buffer: ScopedBuffer<A>, stream: S) -> Self {
        Self {
            buffer: Some(buffer),
            stream,
            deferred: None,
        }
    }

    /// Region still held, if any
    pub fn region(&self) -> Option<GuestBuffer> {
        self.buffer.as_ref().map(ScopedBuffer::region)
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    fn release(&mut self) -> OcrResult<()> {
        match self.buffer.take() {
            Some(buffer) => buffer.release(),
            None => Ok(()),
        }
    }
}

impl<A, S, T> Stream for StagedStream<A, S>
where
    A: RegionAllocator + ?Sized,
    S: FusedStream<Item = OcrResult<T>> + Unpin,
{
    type Item = OcrResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(e) = this.deferred.take() {
            return Poll::Ready(Some(Err(e)));
        }
        if this.buffer.is_none() {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.stream).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => match this.release() {
                Ok(()) => Poll::Ready(None),
                Err(e) => Poll::Ready(Some(Err(e))),
            },
            Poll::Ready(Some(Err(e))) => {
                if let Err(release_err) = this.release() {
                    error!("Failed to release guest buffer after stream error: {}", release_err);
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(Ok(item))) => {
                if this.stream.is_terminated() {
                    if let Err(e) = this.release() {
                        this.deferred = Some(e);
                    }
                }
                Poll::Ready(Some(Ok(item)))
            }
        }
    }
}

impl<A, S, T> FusedStream for StagedStream<A, S>
where
    A: RegionAllocator + ?Sized,
    S: FusedStream<Item = OcrResult<T>> + Unpin,
{
    fn is_terminated(&self) -> bool {
        self.buffer.is_none() && self.deferred.is_none()
    }
}
