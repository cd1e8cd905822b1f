use actix_web::{HttpRequest, HttpResponse, web};
use log::{error, info};
use serde_json::json;
use shared::{FusionDecision, PredictResponse, PredictionResult};
use uuid::Uuid;

use crate::inference::{PredictError, PredictService};
use crate::intake::{self, ImageFetcher};
use crate::middleware::RateLimiter;

pub fn configure_routes(cfg: &mut web::ServiceConfig, rate_limiter: RateLimiter) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(
            web::scope("/predict")
                .wrap(rate_limiter)
                .service(web::resource("").route(web::post().to(predict)))
                .service(web::resource("/batch").route(web::post().to(predict_batch))),
        );
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

async fn predict(
    req: HttpRequest,
    payload: web::Payload,
    service: web::Data<PredictService>,
    fetcher: web::Data<ImageFetcher>,
) -> Result<HttpResponse, PredictError> {
    let request_id = Uuid::new_v4();

    match classify_single(&req, payload, &service, &fetcher, request_id).await {
        Ok(predictions) => {
            if let Some(top) = predictions.first() {
                info!("[{}] /predict top label: {}", request_id, top.label);
            }
            Ok(HttpResponse::Ok().json(PredictResponse { predictions }))
        }
        Err(e) => {
            error!("[{}] /predict error: {}", request_id, e);
            Err(e)
        }
    }
}

async fn classify_single(
    req: &HttpRequest,
    payload: web::Payload,
    service: &PredictService,
    fetcher: &ImageFetcher,
    request_id: Uuid,
) -> Result<Vec<PredictionResult>, PredictError> {
    let fields = intake::read_request(req, payload).await?;
    let image = intake::single_image(fields, fetcher).await?;
    info!("[{}] /predict received {} byte image", request_id, image.len());
    service.predict(&image, request_id).await
}

async fn predict_batch(
    req: HttpRequest,
    payload: web::Payload,
    service: web::Data<PredictService>,
) -> Result<HttpResponse, PredictError> {
    let request_id = Uuid::new_v4();

    match classify_batch(&req, payload, &service, request_id).await {
        Ok(decision) => {
            info!(
                "[{}] /predict/batch selected {} ({:.3})",
                request_id, decision.shape, decision.confidence
            );
            Ok(HttpResponse::Ok().json(decision))
        }
        Err(e) => {
            error!("[{}] /predict/batch error: {}", request_id, e);
            Err(e)
        }
    }
}

async fn classify_batch(
    req: &HttpRequest,
    payload: web::Payload,
    service: &PredictService,
    request_id: Uuid,
) -> Result<FusionDecision, PredictError> {
    let mut fields = intake::read_request(req, payload).await?;
    let samples = intake::batch_samples(&mut fields)?;
    let metrics = fields.metrics();
    info!(
        "[{}] /predict/batch received {} image(s), metrics: {}",
        request_id,
        samples.len(),
        metrics.is_some()
    );
    service.predict_batch(&samples, metrics.as_ref(), request_id).await
}
