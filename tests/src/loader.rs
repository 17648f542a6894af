use async_trait::async_trait;
use ocrbridge::{GuestLoader, GuestModule, OcrError, OcrResult, ProgressCallback, SessionCorrelator};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::guest::{NotificationMode, StubGuest};

/// A [`GuestLoader`] producing [`StubGuest`]s.
///
/// Reports progress `0.5` then `1.0` per load attempt.
pub struct StubLoader {
    instantiations: AtomicUsize,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Duration,
    embeds_weights: bool,
    mode: NotificationMode,
    last: Mutex<Option<Arc<StubGuest>>>,
}

impl StubLoader {
    pub fn new() -> Self {
        Self {
            instantiations: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            delay: Duration::ZERO,
            embeds_weights: false,
            mode: NotificationMode::Immediate,
            last: Mutex::new(None),
        }
    }

    /// Hold every load attempt for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `n` load attempts with a module load error
    pub fn failing(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_embedded_weights(mut self, embedded: bool) -> Self {
        self.embeds_weights = embedded;
        self
    }

    pub fn with_mode(mut self, mode: NotificationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Guests successfully instantiated
    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }

    /// Load attempts, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The most recently instantiated guest
    pub fn last_guest(&self) -> Option<Arc<StubGuest>> {
        self.last.lock().clone()
    }
}

impl Default for StubLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GuestLoader for StubLoader {
    async fn load(
        &self,
        correlator: Arc<SessionCorrelator>,
        progress: Option<ProgressCallback>,
    ) -> OcrResult<Arc<dyn GuestModule>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(report) = &progress {
            report(0.5);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(OcrError::ModuleLoad("stub module rejected".to_string()));
        }

        let guest = Arc::new(
            StubGuest::new(correlator)
                .with_embedded_weights(self.embeds_weights)
                .with_mode(self.mode),
        );
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(Arc::clone(&guest));
        if let Some(report) = &progress {
            report(1.0);
        }
        Ok(guest)
    }
}
