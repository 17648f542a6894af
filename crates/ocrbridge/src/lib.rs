//! Host-side binding for a sandboxed three-stage OCR guest module.
//!
//! The guest (a WebAssembly build of a detection / classification /
//! recognition pipeline) is reachable only through its exported functions
//! and its linear memory. This crate provides:
//! - Scoped staging of host bytes into guest memory with guaranteed release
//! - Correlation of the guest's per-stage notifications back to the
//!   submission that caused them
//! - A lazily loaded, shared engine with `init` and `submit`
//!
//! ```no_run
//! use futures::StreamExt;
//!
//! # async fn run(image: &[u8]) -> ocrbridge::OcrResult<()> {
//! let engine = ocrbridge::load(None).await?;
//! engine.init(None).await?;
//!
//! let mut stages = engine.submit(image).await?;
//! while let Some(stage) = stages.next().await {
//!     println!("{:?}", stage?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod guest;
pub mod model;
pub mod session;
pub mod stage;

pub use buffer::{ScopedBuffer, ScopedBuffers, StagedStream, with_buffer, with_buffer_stream, with_buffers};
pub use config::{EngineConfig, ModuleConfig, SessionConfig, WeightsMode};
pub use engine::{
    EngineCell, EngineHandle, GuestLoader, LifecycleState, ModuleSource, ProgressCallback,
    StageSequence, StageStream, WasmtimeLoader, configure, load,
};
pub use error::{OcrError, OcrResult};
pub use guest::{GuestBuffer, GuestModule, GuestPtr, RegionAllocator, WasmGuest, WeightRegions};
pub use model::{ModelBundle, ModelFiles};
pub use session::{CorrelatorStats, SessionCorrelator, SessionToken, StageWaiter};
pub use stage::{
    BoundingBox, ClassificationItem, ClassificationResult, DetectionItem, DetectionResult, Point,
    RecognitionItem, RecognitionOutcome, RecognitionResult, StageKind, StageResult,
};
