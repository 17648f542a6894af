//! Guest Module Binding
//!
//! The host side of the sandboxed OCR guest contract:
//! - Region allocation over the guest's own `reserve`/`release` exports
//! - Weight staging and the two init paths (external or embedded weights)
//! - Recognition submission returning a session token
//! - The three stage notification imports, routed into the correlator
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Host                              │
//! │  ┌─────────────┐   reserve/write/release  ┌───────────┐  │
//! │  │ ScopedBuffer│ ───────────────────────▶ │           │  │
//! │  └─────────────┘                          │           │  │
//! │  ┌─────────────┐   init / submit          │ WasmGuest │  │
//! │  │ EngineHandle│ ───────────────────────▶ │  (Store)  │  │
//! │  └─────────────┘                          │           │  │
//! │  ┌─────────────┐   notify(token, stage)   │           │  │
//! │  │ Correlator  │ ◀─────────────────────── │           │  │
//! │  └─────────────┘                          └───────────┘  │
//! │                                                 │        │
//! │  ┌──────────────────────────────────────────────▼─────┐  │
//! │  │                  WASM Sandbox                      │  │
//! │  │   linear memory │ alloc │ dealloc │ init │ rec     │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod abi;
mod instance;
mod memory;
mod runtime;

pub use abi::GuestAbi;
pub use instance::WasmGuest;
pub use memory::{GuestBuffer, GuestPtr, RegionAllocator, SimulatedMemory, read_c_string};
pub use runtime::{GuestRuntime, OptimizationLevel, RuntimeConfig};

use crate::error::{OcrError, OcrResult};
use crate::session::SessionToken;

/// Weight blobs staged in guest memory, in init argument order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightRegions {
    pub detector: GuestBuffer,
    pub classifier: GuestBuffer,
    pub recognizer: GuestBuffer,
    pub dictionary: GuestBuffer,
}

impl WeightRegions {
    pub fn from_regions(regions: &[GuestBuffer]) -> OcrResult<Self> {
        match *regions {
            [detector, classifier, recognizer, dictionary] => Ok(Self {
                detector,
                classifier,
                recognizer,
                dictionary,
            }),
            _ => Err(OcrError::Internal(format!(
                "expected 4 weight regions, got {}",
                regions.len()
            ))),
        }
    }

    /// Flattened `(ptr, len)` pairs
    pub fn as_args(&self) -> (u32, u32, u32, u32, u32, u32, u32, u32) {
        (
            self.detector.address.0,
            self.detector.length,
            self.classifier.address.0,
            self.classifier.length,
            self.recognizer.address.0,
            self.recognizer.length,
            self.dictionary.address.0,
            self.dictionary.length,
        )
    }
}

/// Entry points of an instantiated OCR guest.
///
/// All calls are synchronous and may run for a long time; the engine drives
/// them from tokio's blocking pool. Stage notifications emitted during
/// [`submit`](GuestModule::submit) go to the correlator the guest was
/// created with.
pub trait GuestModule: RegionAllocator {
    /// Whether this build carries its weights internally
    fn embeds_weights(&self) -> bool;

    /// Initialize from weights already staged in guest memory
    fn init_with_weights(&self, weights: &WeightRegions) -> OcrResult<()>;

    /// Initialize from the weights compiled into the guest
    fn init_embedded(&self) -> OcrResult<()>;

    /// Start recognition of `input` and return its session token
    fn submit(&self, input: GuestBuffer) -> OcrResult<SessionToken>;
}
