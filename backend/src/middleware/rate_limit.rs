use actix_web::http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::{
    Error, HttpResponse,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use futures::future::{Ready, ok};
use shared::ErrorResponse;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

const RATELIMIT_LIMIT: &str = "ratelimit-limit";
const RATELIMIT_REMAINING: &str = "ratelimit-remaining";
const RATELIMIT_RESET: &str = "ratelimit-reset";
// Stale windows are swept once the table grows past this.
const SWEEP_THRESHOLD: usize = 10_000;

struct WindowCounter {
    started: Instant,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32, reset_secs: u64 },
    Limited { reset_secs: u64 },
}

/// Fixed-window request limiter keyed by peer IP address.
#[derive(Clone)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    clients: Arc<Mutex<HashMap<String, WindowCounter>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: Duration::from_millis(config.window_ms.max(1)),
            max_requests: config.max_requests,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn check(&self, client: &str, now: Instant) -> RateDecision {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());

        if clients.len() > SWEEP_THRESHOLD {
            let window = self.window;
            clients.retain(|_, c| now.duration_since(c.started) < window);
        }

        let counter = clients.entry(client.to_string()).or_insert(WindowCounter {
            started: now,
            count: 0,
        });
        if now.duration_since(counter.started) >= self.window {
            counter.started = now;
            counter.count = 0;
        }

        let elapsed = now.duration_since(counter.started);
        let reset_secs = self.window.saturating_sub(elapsed).as_secs_f64().ceil() as u64;

        if counter.count >= self.max_requests {
            return RateDecision::Limited { reset_secs };
        }
        counter.count += 1;
        RateDecision::Allowed {
            remaining: self.max_requests - counter.count,
            reset_secs,
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimiter
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<actix_web::body::EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimiterService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterService {
            service: Arc::new(service),
            limiter: self.clone(),
        })
    }
}

pub struct RateLimiterService<S> {
    service: Arc<S>,
    limiter: RateLimiter,
}

impl<S, B> Service<ServiceRequest> for RateLimiterService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<actix_web::body::EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let limit = self.limiter.max_requests;
        // Socket address only; forwarding headers are client controlled.
        let client = req
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let decision = self.limiter.check(&client, Instant::now());

        Box::pin(async move {
            match decision {
                RateDecision::Allowed {
                    remaining,
                    reset_secs,
                } => {
                    let mut res = service.call(req).await?;
                    let headers = res.headers_mut();
                    headers.insert(HeaderName::from_static(RATELIMIT_LIMIT), HeaderValue::from(limit));
                    headers.insert(
                        HeaderName::from_static(RATELIMIT_REMAINING),
                        HeaderValue::from(remaining),
                    );
                    headers.insert(HeaderName::from_static(RATELIMIT_RESET), HeaderValue::from(reset_secs));
                    Ok(res.map_into_left_body())
                }
                RateDecision::Limited { reset_secs } => {
                    log::warn!("Rate limit exceeded for {} on {}", client, req.path());

                    let (http_req, _payload) = req.into_parts();
                    let response = HttpResponse::TooManyRequests()
                        .insert_header((RETRY_AFTER, reset_secs.to_string()))
                        .insert_header((RATELIMIT_LIMIT, limit.to_string()))
                        .insert_header((RATELIMIT_REMAINING, "0"))
                        .insert_header((RATELIMIT_RESET, reset_secs.to_string()))
                        .json(ErrorResponse::new("Too many requests"))
                        .map_into_right_body();
                    Ok(ServiceResponse::new(http_req, response))
                }
            }
        })
    }
}
