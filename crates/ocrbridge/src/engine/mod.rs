//! Engine Lifecycle Manager
//!
//! Owns the loaded guest and exposes the caller-facing operations:
//! - [`load`] / [`EngineCell::load`]: one instance per cell, shared by
//!   concurrent callers
//! - [`EngineHandle::init`]: embedded or caller-supplied weights
//! - [`EngineHandle::submit`]: bytes in, three staged results out
//!
//! # Submission flow
//!
//! ```text
//!  submit(bytes)
//!    │  wait for the submission lock
//!    ▼
//!  ScopedBuffer ── stage input ──▶ guest.submit(ptr, len) ──▶ token
//!    │            (blocking pool; buffer and lock ride along)
//!    │                                   │
//!    │                    notify(token, detection | ...)
//!    │                                   ▼
//!    │                           SessionCorrelator
//!    ▼                                   │
//!  StageSequence ◀── await_stage(token, stage) × 3
//!    │
//!    └─ drained, failed or dropped: input released, token forgotten,
//!       submission lock handed on
//! ```

mod lifecycle;
mod loader;

pub use lifecycle::{EngineCell, LifecycleState, configure, load, state};
pub use loader::{GuestLoader, ModuleSource, ProgressCallback, WasmtimeLoader, read_with_progress};

use futures::stream::FusedStream;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::{ScopedBuffer, ScopedBuffers, StagedStream};
use crate::config::SessionConfig;
use crate::error::{OcrError, OcrResult};
use crate::guest::{GuestModule, WeightRegions};
use crate::model::ModelBundle;
use crate::session::{SessionCorrelator, SessionToken, StageWaiter};
use crate::stage::{RecognitionOutcome, StageKind, StageResult};

/// Staged results of one submission, holding its input buffer
pub type StageSequence = StagedStream<dyn GuestModule, StageStream>;

struct EngineInner {
    id: Uuid,
    guest: Arc<dyn GuestModule>,
    correlator: Arc<SessionCorrelator>,
    initialized: Arc<Mutex<bool>>,
    /// Held by a submission from staging until its sequence ends
    submissions: Arc<Mutex<()>>,
    stage_timeout: Option<Duration>,
}

/// Shared handle to a loaded engine
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

impl EngineHandle {
    pub fn new(
        guest: Arc<dyn GuestModule>,
        correlator: Arc<SessionCorrelator>,
        session: &SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                id: Uuid::now_v7(),
                guest,
                correlator,
                initialized: Arc::new(Mutex::new(false)),
                submissions: Arc::new(Mutex::new(())),
                stage_timeout: session.stage_timeout(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub async fn is_initialized(&self) -> bool {
        *self.inner.initialized.lock().await
    }

    /// Live correlator slots; zero when no submission is in flight
    pub fn pending_notifications(&self) -> usize {
        self.inner.correlator.pending()
    }

    /// Initialize the guest.
    ///
    /// A guest that embeds its weights ignores `bundle`. Otherwise the
    /// bundle is required and its four blobs are staged for the duration of
    /// the init call. Calling again after success is a no-op.
    pub async fn init(&self, bundle: Option<&ModelBundle>) -> OcrResult<()> {
        let mut initialized = Arc::clone(&self.inner.initialized).lock_owned().await;
        if *initialized {
            debug!("Engine {} already initialized", self.inner.id);
            return Ok(());
        }

        // the init lock goes into the guest call: an abandoned init still
        // keeps the next one waiting until the guest returns
        let guest = Arc::clone(&self.inner.guest);
        if guest.embeds_weights() {
            if bundle.is_some() {
                warn!("Guest embeds its weights; ignoring the supplied model bundle");
            }
            tokio::task::spawn_blocking(move || {
                guest.init_embedded()?;
                *initialized = true;
                Ok::<_, OcrError>(())
            })
            .await??;
        } else {
            let bundle = bundle.ok_or(OcrError::MissingModel)?;
            let weights = ScopedBuffers::stage_all(Arc::clone(&guest), &bundle.blobs())?;
            let (weights, initialized) = weights
                .run_blocking(move |regions| {
                    guest.init_with_weights(&WeightRegions::from_regions(&regions)?)?;
                    *initialized = true;
                    Ok(initialized)
                })
                .await?;
            weights.release()?;
            drop(initialized);
        }

        info!("Engine {} initialized", self.inner.id);
        Ok(())
    }

    /// Submit one input and get its three stages, in pipeline order.
    ///
    /// Fails before producing anything if the engine is not initialized, the
    /// input is empty, staging fails, or the guest call fails. Submissions
    /// are serialized: the next one starts once this sequence is drained,
    /// fails or is dropped.
    pub async fn submit(&self, bytes: &[u8]) -> OcrResult<StageSequence> {
        if !*self.inner.initialized.lock().await {
            return Err(OcrError::NotInitialized);
        }
        if bytes.is_empty() {
            return Err(OcrError::EmptyBuffer);
        }

        let permit = Arc::clone(&self.inner.submissions).lock_owned().await;
        let guest = Arc::clone(&self.inner.guest);
        let correlator = Arc::clone(&self.inner.correlator);
        let timeout = self.inner.stage_timeout;

        // the session stream holds the submission lock, so it is built next
        // to the guest call: an abandoned submit forgets its session and
        // hands the lock on only after the guest has returned
        let input = ScopedBuffer::stage(Arc::clone(&self.inner.guest), bytes)?;
        let (input, stages) = input
            .run_blocking(move |region| {
                let token = guest.submit(region)?;
                debug!("Session {} started", token);
                Ok(StageStream::new(token, correlator, timeout, permit))
            })
            .await?;
        Ok(StagedStream::new(input, stages))
    }

    /// Submit and collect all three stages.
    pub async fn recognize(&self, bytes: &[u8]) -> OcrResult<RecognitionOutcome> {
        let mut stages = self.submit(bytes).await?;
        let mut outcome = RecognitionOutcome::default();
        while let Some(stage) = stages.next().await {
            outcome.absorb(stage?);
        }
        Ok(outcome)
    }
}

impl PartialEq for EngineHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EngineHandle {}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.inner.id)
            .field("embeds_weights", &self.inner.guest.embeds_weights())
            .finish()
    }
}

/// Awaits the stages of one session in order.
///
/// Ends after recognition, after the first error, or on timeout. Ending or
/// dropping it forgets the session and releases the submission lock.
pub struct StageStream {
    token: SessionToken,
    correlator: Arc<SessionCorrelator>,
    next: Option<StageKind>,
    waiter: Option<StageWaiter>,
    deadline: Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    permit: Option<OwnedMutexGuard<()>>,
}

impl StageStream {
    fn new(
        token: SessionToken,
        correlator: Arc<SessionCorrelator>,
        timeout: Option<Duration>,
        permit: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            token,
            correlator,
            next: Some(StageKind::first()),
            waiter: None,
            deadline: None,
            timeout,
            permit: Some(permit),
        }
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    /// Stage the stream will yield next
    pub fn next_stage(&self) -> Option<StageKind> {
        self.next
    }

    fn finish(&mut self) {
        self.next = None;
        self.waiter = None;
        self.deadline = None;
        let dropped = self.correlator.forget(&self.token);
        if dropped > 0 {
            debug!("Session {} closed with {} unclaimed stages", self.token, dropped);
        }
        self.permit = None;
    }

    fn complete(&mut self, stage: StageKind, result: OcrResult<StageResult>) -> OcrResult<StageResult> {
        self.waiter = None;
        self.deadline = None;
        match result {
            Ok(value) => {
                self.next = stage.next();
                if self.next.is_none() {
                    self.finish();
                }
                Ok(value)
            }
            Err(e) => {
                self.finish();
                Err(e)
            }
        }
    }
}

impl Stream for StageStream {
    type Item = OcrResult<StageResult>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(stage) = this.next else {
            return Poll::Ready(None);
        };

        if this.waiter.is_none() {
            this.waiter = Some(this.correlator.await_stage(&this.token, stage));
            this.deadline = this.timeout.map(|t| Box::pin(tokio::time::sleep(t)));
        }

        if let Some(waiter) = this.waiter.as_mut() {
            if let Poll::Ready(result) = Pin::new(waiter).poll(cx) {
                return Poll::Ready(Some(this.complete(stage, result)));
            }
        }

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                let timeout_ms = this.timeout.map_or(0, |t| t.as_millis() as u64);
                warn!("Session {}: {} stage timed out after {}ms", this.token, stage, timeout_ms);
                this.finish();
                return Poll::Ready(Some(Err(OcrError::StageTimeout { stage, timeout_ms })));
            }
        }

        Poll::Pending
    }
}

impl FusedStream for StageStream {
    fn is_terminated(&self) -> bool {
        self.next.is_none()
    }
}

impl Drop for StageStream {
    fn drop(&mut self) {
        if self.next.is_some() {
            debug!("Session {} abandoned before recognition", self.token);
            self.finish();
        }
    }
}
