mod config;
mod gateway;
mod imaging;
mod inference;
mod intake;
mod middleware;
mod routes;

use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{App, HttpServer, web};
use config::AppConfig;
use gateway::GradioClient;
use inference::{PredictService, ResilientInvoker};
use intake::ImageFetcher;
use middleware::{RateLimiter, security_headers};
use routes::configure_routes;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::other(format!("Configuration failed: {}", e))
    })?;

    let gateway = GradioClient::new(&config.gradio).map_err(|e| {
        log::error!("Invalid remote classifier target: {}", e);
        std::io::Error::other(format!("Gateway setup failed: {}", e))
    })?;
    log::info!("Remote classifier: {}", gateway.base_url());
    if config.gradio.hf_token.is_some() {
        log::info!("Using access token for remote classifier");
    }

    let invoker = ResilientInvoker::new(
        config.inference.retry_schedule(),
        config.inference.attempt_timeout(),
    );
    log::info!(
        "Per-attempt timeout {}ms, retry delays {:?}ms",
        config.inference.timeout_ms,
        invoker.schedule().delays_ms()
    );

    let predict_service = PredictService::new(Arc::new(gateway), invoker);
    let image_fetcher = ImageFetcher::new();
    let rate_limiter = RateLimiter::new(&config.rate_limit);
    let frontend_origin = config.frontend_origin.clone();

    let bind_address = format!("0.0.0.0:{}", config.port);
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(cors(frontend_origin.as_deref()))
            .wrap(security_headers())
            .wrap(Logger::default())
            .app_data(web::Data::new(predict_service.clone()))
            .app_data(web::Data::new(image_fetcher.clone()))
            .configure(|cfg| configure_routes(cfg, rate_limiter.clone()))
    })
    .bind(&bind_address)?
    .run()
    .await
}

fn cors(frontend_origin: Option<&str>) -> Cors {
    let cors = match frontend_origin {
        Some(origin) => Cors::default().allowed_origin(origin),
        None => Cors::default().allow_any_origin(),
    };
    cors.allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![
            actix_web::http::header::AUTHORIZATION,
            actix_web::http::header::ACCEPT,
            actix_web::http::header::CONTENT_TYPE,
        ])
        .supports_credentials()
        .max_age(3600)
}
