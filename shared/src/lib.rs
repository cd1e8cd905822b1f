use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// The five face shapes the remote classifier is trained on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumIter,
    EnumString,
)]
pub enum FaceShape {
    Heart,
    Oblong,
    Oval,
    Round,
    Square,
}

/// Position of a photo inside a multi-image request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumIter,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Orientation {
    Front,
    Left,
    Right,
}

impl Orientation {
    /// Orientation for the n-th image of a batch, if n is in range.
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Orientation::Front),
            1 => Some(Orientation::Left),
            2 => Some(Orientation::Right),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Orientation::Front => 0,
            Orientation::Left => 1,
            Orientation::Right => 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PredictionResult {
    pub label: String,
    /// Top confidence scaled to 0..=100.
    pub percentage: f64,
    /// Per-label confidence in 0..=1. Always carries every `FaceShape`.
    pub probabilities: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FusionDecision {
    pub shape: String,
    pub confidence: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PredictResponse {
    pub predictions: Vec<PredictionResult>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retry_after: None,
        }
    }
}
