pub mod gradio;

use futures::future::BoxFuture;
use serde_json::Value;

pub use gradio::GradioClient;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("URL parsing failed: {0}")]
    Url(#[from] url::ParseError),
    #[error("Remote service error: {0}")]
    Remote(String),
    #[error("Unexpected response: {0}")]
    Protocol(String),
}

/// Transport to the remote face-shape classifier. Implementations do not
/// retry or time out on their own.
pub trait InferenceGateway: Send + Sync {
    /// Classifies one image on the default route.
    fn predict<'a>(&'a self, image: &'a [u8]) -> BoxFuture<'a, Result<Value, GatewayError>>;

    /// Classifies several images in one call on the batch route.
    fn predict_batch<'a>(
        &'a self,
        images: &'a [Vec<u8>],
    ) -> BoxFuture<'a, Result<Value, GatewayError>>;
}
