//! Wasmtime-backed guest instance

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use wasmtime::*;

use super::abi::GuestAbi;
use super::memory::{GuestBuffer, GuestPtr, RegionAllocator, read_c_string};
use super::runtime::GuestRuntime;
use super::{GuestModule, WeightRegions};
use crate::config::{EngineConfig, WeightsMode};
use crate::error::{OcrError, OcrResult};
use crate::session::{SessionCorrelator, SessionToken};
use crate::stage::StageKind;

/// Store limits for resource control
struct StoreLimits {
    max_memory_bytes: u64,
    max_table_elements: u32,
}

impl ResourceLimiter for StoreLimits {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> Result<bool> {
        let max = maximum.unwrap_or(self.max_memory_bytes as usize);
        Ok(desired <= max && desired as u64 <= self.max_memory_bytes)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> Result<bool> {
        let max = maximum.unwrap_or(self.max_table_elements as usize);
        Ok(desired <= max && desired <= self.max_table_elements as usize)
    }
}

/// Per-store host state
struct GuestState {
    correlator: Arc<SessionCorrelator>,
    limits: StoreLimits,
}

/// Upper bounds for strings read out of guest memory
#[derive(Clone, Copy)]
struct ReadLimits {
    token: usize,
    payload: usize,
}

type InitFn = TypedFunc<(u32, u32, u32, u32, u32, u32, u32, u32), ()>;

struct GuestInner {
    store: Store<GuestState>,
    memory: Memory,
    reserve: TypedFunc<u32, u32>,
    release: TypedFunc<(u32, u32), ()>,
    submit: TypedFunc<(u32, u32), u32>,
    init: Option<InitFn>,
    embedded_init: Option<TypedFunc<(), ()>>,
    fuel: Option<u64>,
}

impl GuestInner {
    fn refuel(&mut self) -> OcrResult<()> {
        if let Some(fuel) = self.fuel {
            self.store
                .set_fuel(fuel)
                .map_err(|e| OcrError::Internal(e.to_string()))?;
        }
        Ok(())
    }
}

/// One instantiated OCR guest: a single store, used by one caller at a time
pub struct WasmGuest {
    inner: Mutex<GuestInner>,
    embeds_weights: bool,
    max_token_len: usize,
}

impl WasmGuest {
    /// Instantiate `module`, installing the stage notification imports that
    /// feed `correlator`.
    pub fn instantiate(
        runtime: &GuestRuntime,
        module: &Module,
        config: &EngineConfig,
        correlator: Arc<SessionCorrelator>,
    ) -> OcrResult<Self> {
        let start = Instant::now();
        let engine = runtime.engine();
        let limits = StoreLimits {
            max_memory_bytes: runtime.config().max_memory_bytes(),
            max_table_elements: runtime.config().max_table_elements,
        };

        let mut store = Store::new(engine, GuestState { correlator, limits });
        store.limiter(|state| &mut state.limits);

        let fuel = runtime.config().max_fuel;
        if let Some(fuel) = fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| OcrError::Internal(e.to_string()))?;
        }

        let mut linker = Linker::new(engine);
        let read_limits = ReadLimits {
            token: config.session.max_token_len,
            payload: config.session.max_payload_len,
        };
        for stage in StageKind::ORDER {
            Self::add_notification(&mut linker, &config.abi, stage, read_limits)?;
        }
        if runtime.config().trap_unknown_imports {
            linker
                .define_unknown_imports_as_traps(module)
                .map_err(|e| OcrError::ModuleLoad(e.to_string()))?;
        }

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| OcrError::ModuleLoad(format!("Instantiation failed: {}", e)))?;

        let abi = &config.abi;
        let memory = instance
            .get_memory(&mut store, &abi.memory)
            .ok_or_else(|| OcrError::ExportNotFound(abi.memory.clone()))?;
        let reserve = required_export(&instance, &mut store, &abi.reserve)?;
        let release = required_export(&instance, &mut store, &abi.release)?;
        let submit = required_export(&instance, &mut store, &abi.submit)?;
        let init: Option<InitFn> = optional_export(&instance, &mut store, &abi.init)?;
        let embedded_init = optional_export(&instance, &mut store, &abi.embedded_init)?;

        let embeds_weights = match config.module.weights {
            WeightsMode::Auto => embedded_init.is_some(),
            WeightsMode::Embedded => true,
            WeightsMode::External => false,
        };
        if embeds_weights && embedded_init.is_none() {
            return Err(OcrError::ExportNotFound(abi.embedded_init.clone()));
        }
        if !embeds_weights && init.is_none() {
            return Err(OcrError::ExportNotFound(abi.init.clone()));
        }

        info!(
            "Guest instantiated in {}ms (embedded weights: {})",
            start.elapsed().as_millis(),
            embeds_weights
        );

        Ok(Self {
            inner: Mutex::new(GuestInner {
                store,
                memory,
                reserve,
                release,
                submit,
                init,
                embedded_init,
                fuel,
            }),
            embeds_weights,
            max_token_len: config.session.max_token_len,
        })
    }

    /// Install the import the guest calls when `stage` completes.
    ///
    /// Both arguments point at NUL-terminated strings. An unreadable token
    /// cannot be routed anywhere, so it traps; an unreadable payload is
    /// routed to its session as a malformed notification.
    fn add_notification(
        linker: &mut Linker<GuestState>,
        abi: &GuestAbi,
        stage: StageKind,
        limits: ReadLimits,
    ) -> OcrResult<()> {
        let memory_name = abi.memory.clone();
        linker
            .func_wrap(
                &abi.import_module,
                abi.notification(stage),
                move |mut caller: Caller<'_, GuestState>, token_ptr: u32, payload_ptr: u32| -> Result<()> {
                    let Some(Extern::Memory(memory)) = caller.get_export(&memory_name) else {
                        return Err(Error::msg(format!(
                            "{} notification: guest exports no memory `{}`",
                            stage, memory_name
                        )));
                    };
                    let data = memory.data(&caller);

                    let token = read_c_string(data, GuestPtr(token_ptr), limits.token)
                        .map_err(|e| {
                            Error::msg(format!("unroutable {} notification: {}", stage, e))
                        })?;
                    let token = SessionToken::from(token);
                    let correlator = &caller.data().correlator;

                    match read_c_string(data, GuestPtr(payload_ptr), limits.payload) {
                        Ok(payload) => correlator.notify(&token, stage, &payload),
                        Err(e) => correlator.notify_malformed(&token, stage, &e.to_string()),
                    }
                    Ok(())
                },
            )
            .map_err(|e| OcrError::ModuleLoad(e.to_string()))?;
        Ok(())
    }

    /// Copy `len` bytes out of guest memory
    pub fn read(&self, address: GuestPtr, len: u32) -> OcrResult<Vec<u8>> {
        let inner = self.inner.lock();
        let mut buf = vec![0u8; len as usize];
        inner
            .memory
            .read(&inner.store, address.as_usize(), &mut buf)
            .map_err(|_| OcrError::MemoryOutOfBounds {
                offset: address.0,
                size: u64::from(len),
            })?;
        Ok(buf)
    }

    /// Current linear memory size in bytes
    pub fn memory_size(&self) -> usize {
        let inner = self.inner.lock();
        inner.memory.data_size(&inner.store)
    }
}

fn required_export<P, R>(
    instance: &Instance,
    store: &mut Store<GuestState>,
    name: &str,
) -> OcrResult<TypedFunc<P, R>>
where
    P: WasmParams,
    R: WasmResults,
{
    optional_export(instance, store, name)?.ok_or_else(|| OcrError::ExportNotFound(name.to_string()))
}

fn optional_export<P, R>(
    instance: &Instance,
    store: &mut Store<GuestState>,
    name: &str,
) -> OcrResult<Option<TypedFunc<P, R>>>
where
    P: WasmParams,
    R: WasmResults,
{
    match instance.get_func(&mut *store, name) {
        None => Ok(None),
        Some(func) => func.typed::<P, R>(&*store).map(Some).map_err(|e| {
            OcrError::ModuleLoad(format!("export {} has an unexpected signature: {}", name, e))
        }),
    }
}

impl RegionAllocator for WasmGuest {
    fn reserve(&self, length: u32) -> OcrResult<GuestPtr> {
        let mut inner = self.inner.lock();
        inner.refuel()?;
        let reserve = inner.reserve.clone();
        let ptr = reserve
            .call(&mut inner.store, length)
            .map_err(|e| OcrError::Execution(e.to_string()))?;
        if ptr == 0 {
            return Err(OcrError::Allocation {
                size: u64::from(length),
            });
        }
        debug!("Reserved {} guest bytes at {:#x}", length, ptr);
        Ok(GuestPtr(ptr))
    }

    fn release(&self, address: GuestPtr, length: u32) -> OcrResult<()> {
        let mut inner = self.inner.lock();
        inner.refuel()?;
        let release = inner.release.clone();
        release
            .call(&mut inner.store, (address.0, length))
            .map_err(|e| OcrError::Execution(e.to_string()))?;
        debug!("Released {} guest bytes at {:#x}", length, address.0);
        Ok(())
    }

    fn write(&self, address: GuestPtr, bytes: &[u8]) -> OcrResult<()> {
        let mut inner = self.inner.lock();
        let memory = inner.memory;
        memory
            .write(&mut inner.store, address.as_usize(), bytes)
            .map_err(|_| OcrError::MemoryOutOfBounds {
                offset: address.0,
                size: bytes.len() as u64,
            })
    }
}

impl GuestModule for WasmGuest {
    fn embeds_weights(&self) -> bool {
        self.embeds_weights
    }

    fn init_with_weights(&self, weights: &WeightRegions) -> OcrResult<()> {
        let mut inner = self.inner.lock();
        let init = inner
            .init
            .clone()
            .ok_or_else(|| OcrError::ExportNotFound("init".to_string()))?;
        inner.refuel()?;

        let start = Instant::now();
        init.call(&mut inner.store, weights.as_args())
            .map_err(|e| OcrError::Execution(e.to_string()))?;
        info!("Guest initialized from staged weights in {}ms", start.elapsed().as_millis());
        Ok(())
    }

    fn init_embedded(&self) -> OcrResult<()> {
        let mut inner = self.inner.lock();
        let init = inner
            .embedded_init
            .clone()
            .ok_or_else(|| OcrError::ExportNotFound("embedded init".to_string()))?;
        inner.refuel()?;

        let start = Instant::now();
        init.call(&mut inner.store, ())
            .map_err(|e| OcrError::Execution(e.to_string()))?;
        info!("Guest initialized from embedded weights in {}ms", start.elapsed().as_millis());
        Ok(())
    }

    fn submit(&self, input: GuestBuffer) -> OcrResult<SessionToken> {
        let mut inner = self.inner.lock();
        inner.refuel()?;
        let submit = inner.submit.clone();
        let token_ptr = submit
            .call(&mut inner.store, (input.address.0, input.length))
            .map_err(|e| OcrError::Execution(e.to_string()))?;
        if token_ptr == 0 {
            return Err(OcrError::Execution(
                "guest returned a null session token".to_string(),
            ));
        }

        let data = inner.memory.data(&inner.store);
        let token = read_c_string(data, GuestPtr(token_ptr), self.max_token_len)?;
        debug!("Submitted {} bytes as session {}", input.length, token);
        Ok(SessionToken::from(token))
    }
}
