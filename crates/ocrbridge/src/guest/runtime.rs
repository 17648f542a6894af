//! Guest Runtime
//!
//! Wasmtime engine construction and module compilation for the guest.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;
use wasmtime::{Config, Engine, Module, OptLevel};

use crate::error::{OcrError, OcrResult};

/// Optimization level for compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    None,
    Speed,
    SpeedAndSize,
}

/// Wasmtime settings and store limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Cranelift optimization level
    pub optimization_level: OptimizationLevel,
    /// Enable parallel compilation
    pub parallel_compilation: bool,
    /// Instruction budget per guest call; `None` disables fuel metering
    pub max_fuel: Option<u64>,
    /// Maximum linear memory pages (64KB each)
    pub max_memory_pages: u32,
    /// Maximum table elements
    pub max_table_elements: u32,
    /// Define imports the host does not provide as trapping stubs
    pub trap_unknown_imports: bool,
    /// Enable debug info
    pub debug_info: bool,
    /// Enable SIMD
    pub simd: bool,
    /// Enable bulk memory operations
    pub bulk_memory: bool,
    /// Enable multi-value returns
    pub multi_value: bool,
    /// Enable reference types
    pub reference_types: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            optimization_level: OptimizationLevel::Speed,
            parallel_compilation: true,
            max_fuel: None,
            // inference weights live in guest memory: 1GB
            max_memory_pages: 16384,
            max_table_elements: 100_000,
            trap_unknown_imports: true,
            debug_info: false,
            simd: true,
            bulk_memory: true,
            multi_value: true,
            reference_types: true,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimization(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    pub fn with_max_memory_pages(mut self, pages: u32) -> Self {
        self.max_memory_pages = pages;
        self
    }

    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = Some(fuel);
        self
    }

    pub fn max_memory_bytes(&self) -> u64 {
        u64::from(self.max_memory_pages) * 65536
    }

    fn to_wasmtime_config(&self) -> Config {
        let mut config = Config::new();
        config
            .consume_fuel(self.max_fuel.is_some())
            .debug_info(self.debug_info)
            .wasm_simd(self.simd)
            .wasm_bulk_memory(self.bulk_memory)
            .wasm_multi_value(self.multi_value)
            .wasm_reference_types(self.reference_types)
            .cranelift_opt_level(self.optimization_level.into())
            .parallel_compilation(self.parallel_compilation);
        config
    }
}

impl From<OptimizationLevel> for OptLevel {
    fn from(level: OptimizationLevel) -> Self {
        match level {
            OptimizationLevel::None => OptLevel::None,
            OptimizationLevel::Speed => OptLevel::Speed,
            OptimizationLevel::SpeedAndSize => OptLevel::SpeedAndSize,
        }
    }
}

/// Wasmtime engine plus the settings it was built from
pub struct GuestRuntime {
    config: RuntimeConfig,
    engine: Engine,
}

impl GuestRuntime {
    pub fn new(config: RuntimeConfig) -> OcrResult<Self> {
        let engine = Engine::new(&config.to_wasmtime_config())
            .map_err(|e| OcrError::ModuleLoad(format!("Failed to create engine: {}", e)))?;

        info!(
            "Guest runtime created with optimization {:?}",
            config.optimization_level
        );

        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Compile module bytes; WAT text is accepted as well as binary.
    pub fn compile(&self, name: &str, bytes: &[u8]) -> OcrResult<Module> {
        let start = Instant::now();
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| OcrError::ModuleLoad(format!("Failed to compile {}: {}", name, e)))?;

        info!(
            "Compiled guest {} in {}ms ({} bytes)",
            name,
            start.elapsed().as_millis(),
            bytes.len()
        );
        Ok(module)
    }
}
