//! Guest loading: module bytes in, instantiated guest out

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{OcrError, OcrResult};
use crate::guest::{GuestModule, GuestRuntime, WasmGuest};
use crate::session::SessionCorrelator;

/// Load progress callback, invoked with a ratio in `[0, 1]`
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Produces an instantiated guest whose notifications feed `correlator`
#[async_trait]
pub trait GuestLoader: Send + Sync {
    async fn load(
        &self,
        correlator: Arc<SessionCorrelator>,
        progress: Option<ProgressCallback>,
    ) -> OcrResult<Arc<dyn GuestModule>>;
}

/// Where compiled guest bytes come from
#[derive(Clone)]
pub enum ModuleSource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl ModuleSource {
    fn name(&self) -> String {
        match self {
            ModuleSource::Path(path) => path.display().to_string(),
            ModuleSource::Bytes(_) => "<memory>".to_string(),
        }
    }
}

impl fmt::Debug for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            ModuleSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

/// Read `reader` to the end in `chunk`-sized reads, reporting
/// `bytes_read / total` after each one. Without a known total nothing is
/// reported.
pub async fn read_with_progress<R>(
    mut reader: R,
    total: Option<u64>,
    chunk: usize,
    progress: Option<&ProgressCallback>,
) -> OcrResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let total = total.filter(|&t| t > 0);
    let mut bytes = Vec::with_capacity(total.unwrap_or(0) as usize);
    let mut buf = vec![0u8; chunk.max(1)];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&buf[..n]);
        if let (Some(total), Some(report)) = (total, progress) {
            report((bytes.len() as f64 / total as f64).min(1.0));
        }
    }
    Ok(bytes)
}

/// Compiles and instantiates the guest with wasmtime
pub struct WasmtimeLoader {
    config: EngineConfig,
    source: ModuleSource,
}

impl WasmtimeLoader {
    /// Load from the module path named in `config`
    pub fn new(config: EngineConfig) -> Self {
        let source = ModuleSource::Path(config.module.path.clone());
        Self { config, source }
    }

    pub fn with_source(config: EngineConfig, source: ModuleSource) -> Self {
        Self { config, source }
    }

    pub fn source(&self) -> &ModuleSource {
        &self.source
    }

    async fn fetch(&self, progress: Option<&ProgressCallback>) -> OcrResult<Arc<[u8]>> {
        match &self.source {
            ModuleSource::Bytes(bytes) => {
                if let Some(report) = progress {
                    report(1.0);
                }
                Ok(Arc::clone(bytes))
            }
            ModuleSource::Path(path) => {
                let unreadable =
                    |e: std::io::Error| OcrError::ModuleLoad(format!("{}: {}", path.display(), e));
                let file = tokio::fs::File::open(path).await.map_err(unreadable)?;
                let total = file.metadata().await.ok().map(|m| m.len());
                debug!("Reading guest module {} ({:?} bytes)", path.display(), total);

                let bytes = read_with_progress(
                    file,
                    total,
                    self.config.module.read_chunk_bytes,
                    progress,
                )
                .await
                .map_err(|e| OcrError::ModuleLoad(format!("{}: {}", path.display(), e)))?;
                Ok(bytes.into())
            }
        }
    }
}

#[async_trait]
impl GuestLoader for WasmtimeLoader {
    async fn load(
        &self,
        correlator: Arc<SessionCorrelator>,
        progress: Option<ProgressCallback>,
    ) -> OcrResult<Arc<dyn GuestModule>> {
        let bytes = self.fetch(progress.as_ref()).await?;
        let name = self.source.name();
        let config = self.config.clone();

        let guest = tokio::task::spawn_blocking(move || {
            let runtime = GuestRuntime::new(config.runtime.clone())?;
            let module = runtime.compile(&name, &bytes)?;
            WasmGuest::instantiate(&runtime, &module, &config, correlator)
        })
        .await
        .map_err(OcrError::from)
        .and_then(|instantiated| instantiated)
        .map_err(load_error)?;

        info!("Guest module {} ready", self.source.name());
        Ok(Arc::new(guest))
    }
}

/// Any failure to produce a guest fails the whole load
fn load_error(err: OcrError) -> OcrError {
    match err {
        OcrError::ModuleLoad(_) => err,
        other => OcrError::ModuleLoad(other.to_string()),
    }
}
