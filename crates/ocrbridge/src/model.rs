//! Model bundle: the four weight blobs an external-weights guest needs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{OcrError, OcrResult};

/// File names of the four blobs inside a model directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelFiles {
    pub detector: String,
    pub classifier: String,
    pub recognizer: String,
    pub dictionary: String,
}

impl Default for ModelFiles {
    fn default() -> Self {
        Self {
            detector: "ch_PP-OCRv4_det_infer.onnx".to_string(),
            classifier: "ch_ppocr_mobile_v2.0_cls_infer.onnx".to_string(),
            recognizer: "ch_PP-OCRv4_rec_infer.onnx".to_string(),
            dictionary: "ppocr_keys_v1.txt".to_string(),
        }
    }
}

/// Detector, classifier and recognizer weights plus the recognizer
/// dictionary. Immutable and cheap to clone.
#[derive(Clone)]
pub struct ModelBundle {
    detector: Arc<[u8]>,
    classifier: Arc<[u8]>,
    recognizer: Arc<[u8]>,
    dictionary: Arc<[u8]>,
}

impl ModelBundle {
    pub fn new(
        detector: impl Into<Arc<[u8]>>,
        classifier: impl Into<Arc<[u8]>>,
        recognizer: impl Into<Arc<[u8]>>,
        dictionary: impl Into<Arc<[u8]>>,
    ) -> OcrResult<Self> {
        let bundle = Self {
            detector: detector.into(),
            classifier: classifier.into(),
            recognizer: recognizer.into(),
            dictionary: dictionary.into(),
        };

        for (name, blob) in Self::NAMES.iter().zip(bundle.blobs()) {
            if blob.is_empty() {
                return Err(OcrError::InvalidModel(format!("{} blob is empty", name)));
            }
        }
        Ok(bundle)
    }

    const NAMES: [&'static str; 4] = ["detector", "classifier", "recognizer", "dictionary"];

    /// Read the four blobs from `dir`.
    pub async fn from_dir(dir: impl AsRef<Path>, files: &ModelFiles) -> OcrResult<Self> {
        let dir = dir.as_ref();
        let read = |name: &str| {
            let path: PathBuf = dir.join(name);
            async move {
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    OcrError::InvalidModel(format!("{}: {}", path.display(), e))
                })?;
                debug!("Read {} bytes from {}", bytes.len(), path.display());
                Ok::<_, OcrError>(bytes)
            }
        };

        let (detector, classifier, recognizer, dictionary) = tokio::try_join!(
            read(files.detector.as_str()),
            read(files.classifier.as_str()),
            read(files.recognizer.as_str()),
            read(files.dictionary.as_str()),
        )?;
        Self::new(detector, classifier, recognizer, dictionary)
    }

    /// Blobs in guest init order: detector, classifier, recognizer,
    /// dictionary
    pub fn blobs(&self) -> [&[u8]; 4] {
        [
            &self.detector[..],
            &self.classifier[..],
            &self.recognizer[..],
            &self.dictionary[..],
        ]
    }

    pub fn total_bytes(&self) -> usize {
        self.blobs().iter().map(|b| b.len()).sum()
    }
}

impl std::fmt::Debug for ModelBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBundle")
            .field("detector", &self.detector.len())
            .field("classifier", &self.classifier.len())
            .field("recognizer", &self.recognizer.len())
            .field("dictionary", &self.dictionary.len())
            .finish()
    }
}
