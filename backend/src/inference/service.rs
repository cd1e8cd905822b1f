use shared::{FusionDecision, PredictionResult};
use std::sync::Arc;
use uuid::Uuid;

use super::error::PredictError;
use super::fusion::{FusionController, OrientationSample, TieBreakScores};
use super::resilient::ResilientInvoker;
use super::response::normalize_payload;
use crate::gateway::InferenceGateway;
use crate::imaging::ensure_jpeg;

#[derive(Clone)]
pub struct PredictService {
    gateway: Arc<dyn InferenceGateway>,
    invoker: ResilientInvoker,
}

impl PredictService {
    pub fn new(gateway: Arc<dyn InferenceGateway>, invoker: ResilientInvoker) -> Self {
        Self { gateway, invoker }
    }

    pub async fn predict(
        &self,
        image: &[u8],
        request_id: Uuid,
    ) -> Result<Vec<PredictionResult>, PredictError> {
        let normalized = ensure_jpeg(image).await;
        let bytes: &[u8] = &normalized;
        let gateway = self.gateway.as_ref();
        let invoker = self.invoker.for_request(request_id);

        let payload = invoker.invoke(|| gateway.predict(bytes)).await?;
        let predictions = normalize_payload(&payload);

        if predictions.first().is_none_or(|p| p.label.is_empty()) {
            return Err(PredictError::EmptyPredictions);
        }
        Ok(predictions)
    }

    pub async fn predict_batch(
        &self,
        samples: &[OrientationSample],
        scores: Option<&TieBreakScores>,
        request_id: Uuid,
    ) -> Result<FusionDecision, PredictError> {
        let invoker = self.invoker.for_request(request_id);
        FusionController::new(self.gateway.as_ref(), &invoker)
            .decide(samples, scores)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use crate::inference::resilient::RetrySchedule;
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedGateway {
        answer: fn() -> Result<Value, GatewayError>,
        calls: AtomicUsize,
    }

    impl InferenceGateway for FixedGateway {
        fn predict<'a>(&'a self, image: &'a [u8]) -> BoxFuture<'a, Result<Value, GatewayError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(crate::imaging::normalizer::is_jpeg(image));
            let answer = (self.answer)();
            async move { answer }.boxed()
        }

        fn predict_batch<'a>(&'a self, _images: &'a [Vec<u8>]) -> BoxFuture<'a, Result<Value, GatewayError>> {
            async { Err(GatewayError::Remote("unused".into())) }.boxed()
        }
    }

    fn service(answer: fn() -> Result<Value, GatewayError>) -> (PredictService, Arc<FixedGateway>) {
        let gateway = Arc::new(FixedGateway {
            answer,
            calls: AtomicUsize::new(0),
        });
        let invoker = ResilientInvoker::new(RetrySchedule::new(vec![0, 5, 5]), Duration::from_secs(1));
        (PredictService::new(gateway.clone(), invoker), gateway)
    }

    const JPEG: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];

    #[tokio::test(start_paused = true)]
    async fn returns_normalized_predictions() {
        let (service, gateway) = service(|| {
            Ok(json!([{ "label": "Round", "confidences": [{ "label": "Round", "confidence": 0.7 }] }]))
        });

        let predictions = service.predict(&JPEG, Uuid::new_v4()).await.unwrap();
        assert_eq!(predictions[0].label, "Round");
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_label_is_not_retried() {
        let (service, gateway) = service(|| Ok(json!([{ "label": null, "confidences": [] }])));

        let err = service.predict(&JPEG, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PredictError::EmptyPredictions));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_uses_whole_schedule() {
        let (service, gateway) = service(|| Err(GatewayError::Remote("503".into())));

        let err = service.predict(&JPEG, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PredictError::Upstream(_)));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
    }
}
