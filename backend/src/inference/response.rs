//! Maps the remote classifier's loosely specified payloads onto
//! `PredictionResult`.
//!
//! The service answers with either a flat `label -> probability` object or a
//! `{label, confidences: [{label, confidence}]}` object, alone or inside an
//! array. The shape is detected per object: mostly-numeric objects are
//! probability maps, everything else is read as a confidence list.

use serde_json::{Map, Value};
use shared::{FaceShape, PredictionResult};
use std::collections::BTreeMap;
use strum::IntoEnumIterator;

#[derive(Debug, Clone, PartialEq)]
pub enum RawPrediction {
    ProbabilityMap(Vec<(String, Option<f64>)>),
    ConfidenceList {
        label: String,
        confidences: Vec<(String, Option<f64>)>,
    },
}

impl RawPrediction {
    /// Non-object values have no recognised shape.
    pub fn decode(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if is_probability_map(map) {
            let entries = map.iter().map(|(k, v)| (k.clone(), v.as_f64())).collect();
            return Some(RawPrediction::ProbabilityMap(entries));
        }

        let label = map.get("label").map(label_text).unwrap_or_default();
        let confidences = map
            .get("confidences")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| {
                        let label = item.get("label").map(label_text).unwrap_or_default();
                        let confidence = item.get("confidence").and_then(Value::as_f64);
                        (label, confidence)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(RawPrediction::ConfidenceList { label, confidences })
    }

    pub fn into_prediction(self) -> PredictionResult {
        match self {
            RawPrediction::ProbabilityMap(entries) => from_probability_map(entries),
            RawPrediction::ConfidenceList { label, confidences } => {
                from_confidence_list(label, confidences)
            }
        }
    }
}

/// At least one key, and at least 60% (rounded up) of the values numeric.
pub fn is_probability_map(map: &Map<String, Value>) -> bool {
    if map.is_empty() {
        return false;
    }
    let numeric = map.values().filter(|v| v.is_number()).count();
    let required = (map.len() * 3).div_ceil(5).max(1);
    numeric >= required
}

/// Normalizes a single-call payload: one object or an array of them.
pub fn normalize_payload(payload: &Value) -> Vec<PredictionResult> {
    match payload {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().filter_map(normalize_item).collect(),
        single => normalize_item(single).into_iter().collect(),
    }
}

/// Normalizes a native batch payload, which carries one fused result.
pub fn normalize_batch_payload(payload: &Value) -> Option<PredictionResult> {
    match payload {
        Value::Array(items) => items.first().and_then(normalize_item),
        single => normalize_item(single),
    }
}

fn normalize_item(item: &Value) -> Option<PredictionResult> {
    RawPrediction::decode(item).map(RawPrediction::into_prediction)
}

fn clamp01(n: f64) -> f64 {
    if n.is_finite() { n.clamp(0.0, 1.0) } else { 0.0 }
}

fn label_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Known shapes first, in declaration order, then any extra labels.
fn seeded_entries() -> Vec<(String, f64)> {
    FaceShape::iter().map(|s| (s.to_string(), 0.0)).collect()
}

fn upsert(entries: &mut Vec<(String, f64)>, key: String, value: f64) {
    match entries.iter_mut().find(|(k, _)| *k == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key, value)),
    }
}

fn from_probability_map(raw: Vec<(String, Option<f64>)>) -> PredictionResult {
    let mut entries = seeded_entries();
    for (key, value) in raw {
        upsert(&mut entries, key, clamp01(value.unwrap_or(0.0)));
    }

    let mut label = String::new();
    let mut best = 0.0;
    for (key, value) in &entries {
        if *value > best {
            best = *value;
            label = key.clone();
        }
    }

    PredictionResult {
        label,
        percentage: best * 100.0,
        probabilities: entries.into_iter().collect::<BTreeMap<_, _>>(),
    }
}

fn from_confidence_list(label: String, confidences: Vec<(String, Option<f64>)>) -> PredictionResult {
    let mut entries = seeded_entries();
    let mut top = 0.0_f64;
    for (key, confidence) in confidences {
        let raw = confidence.unwrap_or(0.0);
        if raw > top {
            top = raw;
        }
        if !key.is_empty() {
            upsert(&mut entries, key, clamp01(raw));
        }
    }

    PredictionResult {
        label,
        percentage: clamp01(top) * 100.0,
        probabilities: entries.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KNOWN: [&str; 5] = ["Heart", "Oblong", "Oval", "Round", "Square"];

    fn assert_known_keys(result: &PredictionResult) {
        for key in KNOWN {
            assert!(result.probabilities.contains_key(key), "missing {}", key);
        }
    }

    #[test]
    fn confidence_list_seeds_every_known_shape() {
        let payload = json!([{
            "label": "Oval",
            "confidences": [
                { "label": "Oval", "confidence": 0.82 },
                { "label": "Round", "confidence": 0.11 }
            ]
        }]);

        let results = normalize_payload(&payload);
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_known_keys(result);
        assert_eq!(result.label, "Oval");
        assert!((result.percentage - 82.0).abs() < 1e-9);
        assert_eq!(result.probabilities["Heart"], 0.0);
        assert_eq!(result.probabilities["Round"], 0.11);
    }

    #[test]
    fn confidence_list_percentage_is_independent_of_label() {
        let payload = json!({
            "label": "Square",
            "confidences": [
                { "label": "Square", "confidence": 0.3 },
                { "label": "Heart", "confidence": 0.6 }
            ]
        });

        let result = &normalize_payload(&payload)[0];
        assert_eq!(result.label, "Square");
        assert!((result.percentage - 60.0).abs() < 1e-9);
    }

    #[test]
    fn confidence_list_clamps_and_keeps_unknown_labels() {
        let payload = json!({
            "label": 3,
            "confidences": [
                { "label": "Diamond", "confidence": 1.7 },
                { "label": null, "confidence": 0.5 },
                { "label": "Oval", "confidence": -0.2 }
            ]
        });

        let result = &normalize_payload(&payload)[0];
        assert_eq!(result.label, "3");
        assert_eq!(result.probabilities.len(), 6);
        assert_eq!(result.probabilities["Diamond"], 1.0);
        assert_eq!(result.probabilities["Oval"], 0.0);
        assert_eq!(result.percentage, 100.0);
    }

    #[test]
    fn probability_map_picks_argmax() {
        let payload = json!({ "Heart": 0.1, "Oval": 0.7, "Round": 0.2 });

        let result = &normalize_payload(&payload)[0];
        assert_known_keys(result);
        assert_eq!(result.label, "Oval");
        assert_eq!(result.percentage, result.probabilities["Oval"] * 100.0);
    }

    #[test]
    fn probability_map_ties_resolve_in_known_order() {
        let payload = json!({ "Square": 0.4, "Oblong": 0.4, "Heart": 0.2 });

        let result = &normalize_payload(&payload)[0];
        assert_eq!(result.label, "Oblong");
        assert!((result.percentage - 40.0).abs() < 1e-9);
    }

    #[test]
    fn probability_map_clamps_values() {
        let payload = json!({ "Round": 3.5, "Oval": -1.0 });

        let result = &normalize_payload(&payload)[0];
        assert_eq!(result.label, "Round");
        assert_eq!(result.probabilities["Round"], 1.0);
        assert_eq!(result.probabilities["Oval"], 0.0);
        assert_eq!(result.percentage, 100.0);
    }

    #[test]
    fn numeric_threshold_rounds_up() {
        // 3 of 5 numeric meets ceil(3.0); 1 of 2 misses ceil(1.2)
        let mostly = json!({ "a": 1, "b": 2, "c": 3, "d": "x", "e": null });
        let half = json!({ "label": "Oval", "confidence": 0.9 });
        assert!(is_probability_map(mostly.as_object().unwrap()));
        assert!(!is_probability_map(half.as_object().unwrap()));
        assert!(!is_probability_map(&Map::new()));
    }

    #[test]
    fn empty_and_unrecognised_payloads_yield_nothing() {
        assert!(normalize_payload(&Value::Null).is_empty());
        assert!(normalize_payload(&json!([])).is_empty());
        assert!(normalize_payload(&json!("Oval")).is_empty());
        assert!(normalize_payload(&json!([null, 4])).is_empty());
        assert!(normalize_batch_payload(&json!([])).is_none());
    }

    #[test]
    fn batch_payload_uses_first_entry() {
        let payload = json!([
            { "label": "Heart", "confidences": [{ "label": "Heart", "confidence": 0.9 }] },
            { "label": "Oval", "confidences": [{ "label": "Oval", "confidence": 0.95 }] }
        ]);

        let result = normalize_batch_payload(&payload).unwrap();
        assert_eq!(result.label, "Heart");
    }
}
