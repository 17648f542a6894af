//! Engine lifecycle: `Unloaded → Loading → Ready`

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

use super::EngineHandle;
use super::loader::{GuestLoader, ProgressCallback, WasmtimeLoader};
use crate::config::{EngineConfig, SessionConfig};
use crate::error::{OcrError, OcrResult};
use crate::session::SessionCorrelator;

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unloaded,
    Loading,
    Ready,
}

type SharedLoad = Shared<BoxFuture<'static, OcrResult<EngineHandle>>>;

enum Slot {
    Unloaded,
    Loading { generation: u64, load: SharedLoad },
    Ready(EngineHandle),
}

struct CellState {
    slot: Slot,
    generation: u64,
}

/// Lazily loaded engine.
///
/// Concurrent [`load`](EngineCell::load) calls during `Loading` share one
/// in-flight load and resolve to the same handle. A failed load returns the
/// cell to `Unloaded` so a later call can retry; once `Ready` the cell
/// never changes again.
pub struct EngineCell {
    loader: Arc<dyn GuestLoader>,
    session: SessionConfig,
    state: Mutex<CellState>,
}

impl EngineCell {
    pub fn new(loader: Arc<dyn GuestLoader>, session: SessionConfig) -> Self {
        Self {
            loader,
            session,
            state: Mutex::new(CellState {
                slot: Slot::Unloaded,
                generation: 0,
            }),
        }
    }

    /// Cell backed by the wasmtime loader
    pub fn wasmtime(config: EngineConfig) -> Self {
        let session = config.session.clone();
        Self::new(Arc::new(WasmtimeLoader::new(config)), session)
    }

    pub fn state(&self) -> LifecycleState {
        match self.state.lock().slot {
            Slot::Unloaded => LifecycleState::Unloaded,
            Slot::Loading { .. } => LifecycleState::Loading,
            Slot::Ready(_) => LifecycleState::Ready,
        }
    }

    /// Load the engine, or join the load already in flight.
    ///
    /// `on_progress` is used only by the call that starts the load.
    pub async fn load(&self, on_progress: Option<ProgressCallback>) -> OcrResult<EngineHandle> {
        let (generation, load) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match &state.slot {
                Slot::Ready(handle) => return Ok(handle.clone()),
                Slot::Loading { generation, load } => (*generation, load.clone()),
                Slot::Unloaded => {
                    state.generation += 1;
                    let generation = state.generation;
                    let load = self.start(on_progress);
                    state.slot = Slot::Loading {
                        generation,
                        load: load.clone(),
                    };
                    info!("Engine loading (attempt {})", generation);
                    (generation, load)
                }
            }
        };

        let result = load.await;

        let mut state = self.state.lock();
        let current = matches!(&state.slot, Slot::Loading { generation: g, .. } if *g == generation);
        if current {
            state.slot = match &result {
                Ok(handle) => {
                    info!("Engine {} ready", handle.id());
                    Slot::Ready(handle.clone())
                }
                Err(e) => {
                    warn!("Engine load failed, state reset: {}", e);
                    Slot::Unloaded
                }
            };
        }
        result
    }

    fn start(&self, on_progress: Option<ProgressCallback>) -> SharedLoad {
        let loader = Arc::clone(&self.loader);
        let session = self.session.clone();

        async move {
            let correlator = Arc::new(SessionCorrelator::new(
                session.max_unclaimed_notifications,
            ));
            let guest = loader.load(Arc::clone(&correlator), on_progress).await?;
            Ok::<_, OcrError>(EngineHandle::new(guest, correlator, &session))
        }
        .boxed()
        .shared()
    }
}

static ENGINE: OnceLock<EngineCell> = OnceLock::new();
static PENDING_CONFIG: Mutex<Option<EngineConfig>> = parking_lot::const_mutex(None);

/// Install the configuration of the process-wide engine.
///
/// Must run before the first [`load`]; afterwards it fails.
pub fn configure(config: EngineConfig) -> OcrResult<()> {
    config.validate()?;
    let mut pending = PENDING_CONFIG.lock();
    if ENGINE.get().is_some() {
        return Err(OcrError::Config(
            "engine already created; configure must run before the first load".to_string(),
        ));
    }
    *pending = Some(config);
    Ok(())
}

fn engine_cell() -> OcrResult<&'static EngineCell> {
    let mut pending = PENDING_CONFIG.lock();
    if let Some(cell) = ENGINE.get() {
        return Ok(cell);
    }
    let config = match pending.take() {
        Some(config) => config,
        None => EngineConfig::from_env()?,
    };
    Ok(ENGINE.get_or_init(|| EngineCell::wasmtime(config)))
}

/// Load the process-wide engine.
pub async fn load(on_progress: Option<ProgressCallback>) -> OcrResult<EngineHandle> {
    engine_cell()?.load(on_progress).await
}

/// Lifecycle state of the process-wide engine
pub fn state() -> LifecycleState {
    ENGINE
        .get()
        .map_or(LifecycleState::Unloaded, EngineCell::state)
}
