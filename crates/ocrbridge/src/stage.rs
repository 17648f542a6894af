//! Stage result types
//!
//! The guest pipeline reports three stages per submission, always in the
//! order detection, classification, recognition. Each stage payload is a
//! JSON document with camelCase keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Detection,
    Classification,
    Recognition,
}

impl StageKind {
    /// Stages in pipeline order
    pub const ORDER: [StageKind; 3] = [
        StageKind::Detection,
        StageKind::Classification,
        StageKind::Recognition,
    ];

    pub fn first() -> Self {
        StageKind::Detection
    }

    /// The stage that follows this one, `None` after recognition.
    pub fn next(self) -> Option<Self> {
        match self {
            StageKind::Detection => Some(StageKind::Classification),
            StageKind::Classification => Some(StageKind::Recognition),
            StageKind::Recognition => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Detection => "detection",
            StageKind::Classification => "classification",
            StageKind::Recognition => "recognition",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel coordinate in the submitted image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned text region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub top_left: Point,
    pub bottom_right: Point,
}

impl BoundingBox {
    pub fn new(top_left: Point, bottom_right: Point) -> Self {
        Self {
            top_left,
            bottom_right,
        }
    }

    pub fn width(&self) -> i32 {
        self.bottom_right.x - self.top_left.x
    }

    pub fn height(&self) -> i32 {
        self.bottom_right.y - self.top_left.y
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionItem {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub items: Vec<DetectionItem>,
}

/// Orientation label for one detected region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationItem {
    pub label: u32,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub items: Vec<ClassificationItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionItem {
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub items: Vec<RecognitionItem>,
}

/// One staged result of a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageResult {
    Detection(DetectionResult),
    Classification(ClassificationResult),
    Recognition(RecognitionResult),
}

impl StageResult {
    pub fn kind(&self) -> StageKind {
        match self {
            StageResult::Detection(_) => StageKind::Detection,
            StageResult::Classification(_) => StageKind::Classification,
            StageResult::Recognition(_) => StageKind::Recognition,
        }
    }

    /// Parse a notification payload as the body of the given stage.
    pub fn decode(kind: StageKind, payload: &str) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            StageKind::Detection => StageResult::Detection(serde_json::from_str(payload)?),
            StageKind::Classification => {
                StageResult::Classification(serde_json::from_str(payload)?)
            }
            StageKind::Recognition => StageResult::Recognition(serde_json::from_str(payload)?),
        })
    }

    /// Number of items carried by this stage
    pub fn len(&self) -> usize {
        match self {
            StageResult::Detection(r) => r.items.len(),
            StageResult::Classification(r) => r.items.len(),
            StageResult::Recognition(r) => r.items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All three stages of one submission, collected
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionOutcome {
    pub detection: DetectionResult,
    pub classification: ClassificationResult,
    pub recognition: RecognitionResult,
}

impl RecognitionOutcome {
    /// Recognized lines in detection order
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.recognition.items.iter().map(|item| item.text.as_str())
    }

    pub(crate) fn absorb(&mut self, stage: StageResult) {
        match stage {
            StageResult::Detection(r) => self.detection = r,
            StageResult::Classification(r) => self.classification = r,
            StageResult::Recognition(r) => self.recognition = r,
        }
    }
}
