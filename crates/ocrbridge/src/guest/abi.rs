//! Guest ABI names
//!
//! Export and import names of the guest contract. Defaults match the
//! upstream OCR guest build.

use serde::{Deserialize, Serialize};

use crate::stage::StageKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestAbi {
    /// Exported linear memory
    pub memory: String,
    /// `reserve(n) -> ptr`
    pub reserve: String,
    /// `release(ptr, n)`
    pub release: String,
    /// `init(det_ptr, det_len, cls_ptr, cls_len, rec_ptr, rec_len, dict_ptr, dict_len)`
    pub init: String,
    /// `embedded_init()`, present only in builds with compiled-in weights
    pub embedded_init: String,
    /// `submit(ptr, len) -> token_ptr`
    pub submit: String,
    /// Module name the notification imports live under
    pub import_module: String,
    pub on_detection_done: String,
    pub on_classification_done: String,
    pub on_recognition_done: String,
}

impl Default for GuestAbi {
    fn default() -> Self {
        Self {
            memory: "memory".to_string(),
            reserve: "alloc".to_string(),
            release: "dealloc".to_string(),
            init: "retto_init".to_string(),
            embedded_init: "retto_embed_init".to_string(),
            submit: "retto_rec".to_string(),
            import_module: "env".to_string(),
            on_detection_done: "retto_notify_det_done".to_string(),
            on_classification_done: "retto_notify_cls_done".to_string(),
            on_recognition_done: "retto_notify_rec_done".to_string(),
        }
    }
}

impl GuestAbi {
    /// Import name of the notification for `stage`
    pub fn notification(&self, stage: StageKind) -> &str {
        match stage {
            StageKind::Detection => &self.on_detection_done,
            StageKind::Classification => &self.on_classification_done,
            StageKind::Recognition => &self.on_recognition_done,
        }
    }
}
