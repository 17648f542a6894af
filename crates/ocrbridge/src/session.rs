//! Session Correlator
//!
//! Turns the guest's per-stage notification callbacks into one-shot
//! awaitables keyed by `(session token, stage)`.
//!
//! A synchronous guest may emit every notification of a submission before
//! the submit call has even returned the token, so a notification with no
//! registered waiter is parked until someone claims it. Parked results are
//! bounded; the oldest is evicted once the bound is exceeded.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{OcrError, OcrResult};
use crate::stage::{StageKind, StageResult};

/// Opaque correlation key minted by the guest per submission
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionToken {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SessionToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

type SlotKey = (SessionToken, StageKind);
type Delivery = OcrResult<StageResult>;

enum Slot {
    /// A consumer is waiting for this stage
    Waiting {
        id: u64,
        tx: oneshot::Sender<Delivery>,
    },
    /// The stage arrived before anyone asked for it
    Parked(Delivery),
}

/// Correlator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelatorStats {
    /// Notifications handed to a waiting consumer
    pub delivered: u64,
    /// Notifications parked without a waiter
    pub parked: u64,
    /// Parked notifications dropped to respect the bound
    pub evicted: u64,
    /// Second notification for the same token and stage
    pub duplicates: u64,
    /// Payloads that failed to parse
    pub malformed: u64,
}

#[derive(Default)]
struct SlotTable {
    slots: HashMap<SlotKey, Slot>,
    /// Keys of parked slots, oldest first
    parked_order: VecDeque<SlotKey>,
    parked: usize,
    next_id: u64,
    stats: CorrelatorStats,
}

impl SlotTable {
    fn claim_parked(&mut self, key: &SlotKey) {
        self.parked -= 1;
        if let Some(pos) = self.parked_order.iter().position(|k| k == key) {
            self.parked_order.remove(pos);
        }
    }

    fn evict_over(&mut self, bound: usize) {
        while self.parked > bound {
            let Some(key) = self.parked_order.pop_front() else {
                break;
            };
            if matches!(self.slots.get(&key), Some(Slot::Parked(_))) {
                self.slots.remove(&key);
                self.parked -= 1;
                self.stats.evicted += 1;
                warn!(token = %key.0, stage = %key.1, "evicted unclaimed stage notification");
            }
        }
    }
}

/// Routes stage notifications to the consumer awaiting them
pub struct SessionCorrelator {
    table: Mutex<SlotTable>,
    max_unclaimed: usize,
}

impl SessionCorrelator {
    pub fn new(max_unclaimed: usize) -> Self {
        Self {
            table: Mutex::new(SlotTable::default()),
            max_unclaimed,
        }
    }

    /// Entry point of the three global notification handlers: parse
    /// `payload` as the body of `stage` and route it under `(token, stage)`.
    ///
    /// A payload that fails to parse is routed as a
    /// [`OcrError::MalformedNotification`] so the waiter fails instead of
    /// hanging.
    pub fn notify(&self, token: &SessionToken, stage: StageKind, payload: &str) {
        let delivery = StageResult::decode(stage, payload).map_err(|e| {
            OcrError::MalformedNotification {
                token: token.to_string(),
                stage,
                reason: e.to_string(),
            }
        });
        self.deliver(token, stage, delivery);
    }

    /// Route a notification whose payload could not be read at all.
    pub fn notify_malformed(&self, token: &SessionToken, stage: StageKind, reason: &str) {
        self.deliver(
            token,
            stage,
            Err(OcrError::MalformedNotification {
                token: token.to_string(),
                stage,
                reason: reason.to_string(),
            }),
        );
    }

    fn deliver(&self, token: &SessionToken, stage: StageKind, delivery: Delivery) {
        let key = (token.clone(), stage);
        let mut table = self.table.lock();
        if delivery.is_err() {
            table.stats.malformed += 1;
        }

        match table.slots.remove(&key) {
            Some(Slot::Waiting { tx, .. }) => {
                table.stats.delivered += 1;
                if tx.send(delivery).is_err() {
                    warn!(%token, %stage, "stage waiter went away before delivery");
                } else {
                    debug!(%token, %stage, "stage delivered");
                }
            }
            Some(parked @ Slot::Parked(_)) => {
                table.slots.insert(key, parked);
                table.stats.duplicates += 1;
                warn!(%token, %stage, "duplicate stage notification dropped");
            }
            None => {
                table.slots.insert(key.clone(), Slot::Parked(delivery));
                table.parked_order.push_back(key);
                table.parked += 1;
                table.stats.parked += 1;
                debug!(%token, %stage, "stage parked until awaited");
                let bound = self.max_unclaimed;
                table.evict_over(bound);
            }
        }
    }

    /// Register a one-shot listener for `(token, stage)`.
    ///
    /// Resolves immediately if the stage was already parked. Dropping the
    /// returned waiter before it fires deregisters it.
    pub fn await_stage(self: &Arc<Self>, token: &SessionToken, stage: StageKind) -> StageWaiter {
        let key = (token.clone(), stage);
        let mut table = self.table.lock();

        match table.slots.remove(&key) {
            Some(Slot::Parked(delivery)) => {
                table.claim_parked(&key);
                StageWaiter::ready(delivery)
            }
            Some(waiting @ Slot::Waiting { .. }) => {
                table.slots.insert(key, waiting);
                StageWaiter::ready(Err(OcrError::Internal(format!(
                    "{} stage of session {} is already awaited",
                    stage, token
                ))))
            }
            None => {
                let id = table.next_id;
                table.next_id += 1;
                let (tx, rx) = oneshot::channel();
                table.slots.insert(key.clone(), Slot::Waiting { id, tx });
                StageWaiter {
                    state: WaiterState::Waiting {
                        rx,
                        key,
                        id,
                        correlator: Arc::clone(self),
                    },
                }
            }
        }
    }

    fn deregister(&self, key: &SlotKey, id: u64) {
        let mut table = self.table.lock();
        if matches!(table.slots.get(key), Some(Slot::Waiting { id: current, .. }) if *current == id)
        {
            table.slots.remove(key);
            debug!(token = %key.0, stage = %key.1, "stage waiter deregistered");
        }
    }

    /// Drop every slot of `token`. Registered waiters observe
    /// [`OcrError::SessionClosed`]. Returns the number of slots removed.
    pub fn forget(&self, token: &SessionToken) -> usize {
        let mut table = self.table.lock();
        let before = table.slots.len();
        let mut parked_removed = 0;
        table.slots.retain(|(t, _), slot| {
            let keep = t != token;
            if !keep && matches!(slot, Slot::Parked(_)) {
                parked_removed += 1;
            }
            keep
        });
        table.parked -= parked_removed;
        table.parked_order.retain(|(t, _)| t != token);
        before - table.slots.len()
    }

    /// Live slots, waiting or parked
    pub fn pending(&self) -> usize {
        self.table.lock().slots.len()
    }

    /// Whether a consumer is currently waiting on `(token, stage)`
    pub fn is_waiting(&self, token: &SessionToken, stage: StageKind) -> bool {
        matches!(
            self.table.lock().slots.get(&(token.clone(), stage)),
            Some(Slot::Waiting { .. })
        )
    }

    pub fn stats(&self) -> CorrelatorStats {
        self.table.lock().stats.clone()
    }
}

impl Default for SessionCorrelator {
    fn default() -> Self {
        Self::new(64)
    }
}

enum WaiterState {
    Ready(Option<Delivery>),
    Waiting {
        rx: oneshot::Receiver<Delivery>,
        key: SlotKey,
        id: u64,
        correlator: Arc<SessionCorrelator>,
    },
    Done,
}

/// Future of one stage of one session
pub struct StageWaiter {
    state: WaiterState,
}

impl StageWaiter {
    fn ready(delivery: Delivery) -> Self {
        Self {
            state: WaiterState::Ready(Some(delivery)),
        }
    }
}

impl Future for StageWaiter {
    type Output = Delivery;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let delivery = match &mut this.state {
            WaiterState::Ready(delivery) => delivery.take().unwrap_or_else(|| {
                Err(OcrError::Internal("stage waiter polled twice".to_string()))
            }),
            WaiterState::Waiting { rx, key, .. } => match Pin::new(rx).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(delivery)) => delivery,
                Poll::Ready(Err(_)) => Err(OcrError::SessionClosed(key.0.to_string())),
            },
            WaiterState::Done => Err(OcrError::Internal(
                "stage waiter polled after completion".to_string(),
            )),
        };
        this.state = WaiterState::Done;
        Poll::Ready(delivery)
    }
}

impl Drop for StageWaiter {
    fn drop(&mut self) {
        if let WaiterState::Waiting {
            key,
            id,
            correlator,
            ..
        } = &self.state
        {
            correlator.deregister(key, *id);
        }
    }
}
