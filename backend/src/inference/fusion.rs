//! Multi-photo fusion: one decision from up to three orientations.

use serde_json::Value;
use shared::{FusionDecision, Orientation, PredictionResult};
use std::collections::HashMap;
use strum::IntoEnumIterator;

use super::error::PredictError;
use super::resilient::{InvokeError, ResilientInvoker};
use super::response::{normalize_batch_payload, normalize_payload};
use crate::gateway::InferenceGateway;
use crate::imaging::ensure_jpeg;

pub const MAX_SAMPLES: usize = 3;

#[derive(Debug, Clone)]
pub struct OrientationSample {
    pub orientation: Orientation,
    pub image: Vec<u8>,
}

/// Client-reported `overallScore` per orientation. Only consulted to break
/// exact confidence ties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TieBreakScores {
    scores: HashMap<Orientation, f64>,
}

impl TieBreakScores {
    /// Accepts an object or a JSON-encoded string of one. Anything else is
    /// ignored.
    pub fn from_value(raw: &Value) -> Option<Self> {
        let parsed;
        let object = match raw {
            Value::String(s) => {
                parsed = serde_json::from_str::<Value>(s).ok()?;
                parsed.as_object()?
            }
            Value::Object(map) => map,
            _ => return None,
        };

        let scores = Orientation::iter()
            .filter_map(|orientation| {
                let score = object.get(orientation.as_ref())?.get("overallScore")?;
                let score = match score {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }?;
                score.is_finite().then_some((orientation, score))
            })
            .collect();

        Some(Self { scores })
    }

    pub fn score(&self, orientation: Orientation) -> Option<f64> {
        self.scores.get(&orientation).copied()
    }

    fn prefers(&self, challenger: Orientation, incumbent: Orientation) -> bool {
        match (self.score(challenger), self.score(incumbent)) {
            (Some(c), Some(i)) => c > i,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub orientation: Orientation,
    pub predictions: Vec<PredictionResult>,
}

/// Picks the candidate whose first prediction has the highest confidence.
/// Equal confidences keep the earlier candidate unless both orientations
/// carry a score and the later one's is strictly higher.
pub fn select_best(candidates: &[Candidate], scores: Option<&TieBreakScores>) -> Option<FusionDecision> {
    let mut best: Option<(FusionDecision, Orientation)> = None;

    for candidate in candidates {
        let Some(first) = candidate.predictions.first() else {
            continue;
        };
        if first.label.is_empty() || !first.percentage.is_finite() {
            continue;
        }
        let confidence = (first.percentage / 100.0).clamp(0.0, 1.0);

        let replace = match &best {
            None => confidence > 0.0,
            Some((current, incumbent)) => {
                confidence > current.confidence
                    || (confidence == current.confidence
                        && scores.is_some_and(|s| s.prefers(candidate.orientation, *incumbent)))
            }
        };

        if replace {
            best = Some((
                FusionDecision {
                    shape: first.label.clone(),
                    confidence,
                },
                candidate.orientation,
            ));
        }
    }

    best.map(|(decision, _)| decision)
}

pub struct FusionController<'a> {
    gateway: &'a dyn InferenceGateway,
    invoker: &'a ResilientInvoker,
}

impl<'a> FusionController<'a> {
    pub fn new(gateway: &'a dyn InferenceGateway, invoker: &'a ResilientInvoker) -> Self {
        Self { gateway, invoker }
    }

    pub async fn decide(
        &self,
        samples: &[OrientationSample],
        scores: Option<&TieBreakScores>,
    ) -> Result<FusionDecision, PredictError> {
        let Some(first) = samples.first() else {
            return Err(PredictError::InvalidInput(
                "Provide images via multipart (image_1..3) or JSON imagesBase64".to_string(),
            ));
        };

        let mut images: Vec<Vec<u8>> = Vec::with_capacity(samples.len());
        for sample in samples {
            images.push(ensure_jpeg(&sample.image).await.into_owned());
        }

        // A native batch answer is final, even when it carries no usable label.
        if let Some(payload) = self.native_batch(&images).await {
            let candidates: Vec<Candidate> = normalize_batch_payload(&payload)
                .map(|prediction| Candidate {
                    orientation: first.orientation,
                    predictions: vec![prediction],
                })
                .into_iter()
                .collect();
            return select_best(&candidates, scores).ok_or(PredictError::EmptyPredictions);
        }

        let (candidates, last_error) = self.per_image(samples, &images).await;
        match select_best(&candidates, scores) {
            Some(decision) => Ok(decision),
            None => match last_error {
                Some(err) => Err(err.into()),
                None => Err(PredictError::EmptyPredictions),
            },
        }
    }

    /// One timed attempt on the batch route; `None` means fall back.
    async fn native_batch(&self, images: &[Vec<u8>]) -> Option<Value> {
        match self.invoker.attempt(self.gateway.predict_batch(images)).await {
            Ok(payload) => Some(payload),
            Err(e) => {
                log::warn!(
                    "{}Native batch failed ({}); falling back to per-image calls",
                    self.invoker.log_tag(),
                    e
                );
                None
            }
        }
    }

    /// Full retry sequence per image, in orientation order.
    async fn per_image(
        &self,
        samples: &[OrientationSample],
        images: &[Vec<u8>],
    ) -> (Vec<Candidate>, Option<InvokeError>) {
        let mut candidates = Vec::with_capacity(samples.len());
        let mut last_error = None;

        for (sample, image) in samples.iter().zip(images) {
            let gateway = self.gateway;
            match self.invoker.invoke(|| gateway.predict(image)).await {
                Ok(payload) => candidates.push(Candidate {
                    orientation: sample.orientation,
                    predictions: normalize_payload(&payload),
                }),
                Err(e) => {
                    log::warn!(
                        "{}Prediction for {} image failed: {}",
                        self.invoker.log_tag(),
                        sample.orientation,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        (candidates, last_error)
    }
}
