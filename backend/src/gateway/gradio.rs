use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::multipart::{Form, Part};
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use url::Url;

use super::{GatewayError, InferenceGateway};
use crate::config::{DEFAULT_SPACE_ID, GradioConfig};
use crate::imaging::sniff_mime;

const DEFAULT_ENDPOINT: &str = "/predict";
const BATCH_ENDPOINT: &str = "/predict_batch";

#[derive(Debug, Deserialize)]
struct AppConfigResponse {
    #[serde(default)]
    api_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Debug, Clone)]
struct Session {
    api_root: String,
}

impl Session {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_root, path)
    }
}

/// Client for a Gradio app exposing `/predict` and `/predict_batch`.
///
/// The API prefix is discovered once from `/config` and reused for the life
/// of the client; a failed discovery is retried on the next call.
pub struct GradioClient {
    http_client: HttpClient,
    base_url: String,
    hf_token: Option<String>,
    session: OnceCell<Session>,
}

impl GradioClient {
    pub fn new(config: &GradioConfig) -> Result<Self, GatewayError> {
        let base_url = resolve_base_url(config)?;
        Ok(Self {
            http_client: HttpClient::new(),
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            hf_token: config.hf_token.clone().filter(|t| !t.trim().is_empty()),
            session: OnceCell::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.hf_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn session(&self) -> Result<&Session, GatewayError> {
        self.session.get_or_try_init(|| self.connect()).await
    }

    async fn connect(&self) -> Result<Session, GatewayError> {
        let response = self
            .authorized(self.http_client.get(format!("{}/config", self.base_url)))
            .send()
            .await?;
        let response = ensure_success(response, "Config request").await?;
        let config: AppConfigResponse = response.json().await?;

        let prefix = config
            .api_prefix
            .map(|p| p.trim().trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .map(|p| if p.starts_with('/') { p } else { format!("/{}", p) })
            .unwrap_or_default();

        log::info!("Connected to Gradio app at {} (api prefix '{}')", self.base_url, prefix);
        Ok(Session {
            api_root: format!("{}{}", self.base_url, prefix),
        })
    }

    async fn upload(&self, session: &Session, images: &[&[u8]]) -> Result<Vec<String>, GatewayError> {
        let mut form = Form::new();
        for (i, image) in images.iter().enumerate() {
            let mime = sniff_mime(image);
            let part = Part::bytes(image.to_vec())
                .file_name(format!("image_{}.{}", i + 1, extension_for(mime)))
                .mime_str(mime)?;
            form = form.part("files", part);
        }

        let response = self
            .authorized(self.http_client.post(session.url("/upload")))
            .multipart(form)
            .send()
            .await?;
        let response = ensure_success(response, "Upload").await?;
        let paths: Vec<String> = response.json().await?;

        if paths.len() != images.len() {
            return Err(GatewayError::Protocol(format!(
                "uploaded {} file(s) but received {} path(s)",
                images.len(),
                paths.len()
            )));
        }
        Ok(paths)
    }

    async fn call(&self, session: &Session, endpoint: &str, data: Value) -> Result<Value, GatewayError> {
        let api_name = endpoint.trim_start_matches('/');

        let response = self
            .authorized(self.http_client.post(session.url(&format!("/call/{}", api_name))))
            .json(&json!({ "data": data }))
            .send()
            .await?;
        let response = ensure_success(response, "Prediction request").await?;
        let EventIdResponse { event_id } = response.json().await?;
        log::debug!("Gradio call {} queued as event {}", api_name, event_id);

        let response = self
            .authorized(
                self.http_client
                    .get(session.url(&format!("/call/{}/{}", api_name, event_id))),
            )
            .send()
            .await?;
        let response = ensure_success(response, "Prediction result").await?;
        let body = response.text().await?;
        parse_event_stream(&body)
    }
}

impl InferenceGateway for GradioClient {
    fn predict<'a>(&'a self, image: &'a [u8]) -> BoxFuture<'a, Result<Value, GatewayError>> {
        async move {
            let session = self.session().await?;
            let paths = self.upload(session, &[image]).await?;
            let files: Vec<Value> = paths.iter().map(|p| file_data(p)).collect();
            self.call(session, DEFAULT_ENDPOINT, Value::Array(files)).await
        }
        .boxed()
    }

    fn predict_batch<'a>(
        &'a self,
        images: &'a [Vec<u8>],
    ) -> BoxFuture<'a, Result<Value, GatewayError>> {
        async move {
            let session = self.session().await?;
            let slices: Vec<&[u8]> = images.iter().map(Vec::as_slice).collect();
            let paths = self.upload(session, &slices).await?;
            let files: Vec<Value> = paths.iter().map(|p| file_data(p)).collect();
            self.call(session, BATCH_ENDPOINT, json!([files])).await
        }
        .boxed()
    }
}

async fn ensure_success(response: Response, what: &str) -> Result<Response, GatewayError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_text = response.text().await.unwrap_or_default();
    Err(GatewayError::Remote(format!("{} failed ({}): {}", what, status, error_text)))
}

fn file_data(path: &str) -> Value {
    json!({ "path": path, "meta": { "_type": "gradio.FileData" } })
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}

/// Explicit URL, else space id, else the built-in space id.
pub fn resolve_base_url(config: &GradioConfig) -> Result<Url, GatewayError> {
    let non_blank = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    if let Some(url) = non_blank(&config.url) {
        return Ok(Url::parse(&url)?);
    }

    let space_id = non_blank(&config.space_id).unwrap_or_else(|| DEFAULT_SPACE_ID.to_string());
    if space_id.starts_with("http://") || space_id.starts_with("https://") {
        return Ok(Url::parse(&space_id)?);
    }
    Ok(Url::parse(&format!("https://{}.hf.space", space_subdomain(&space_id)))?)
}

/// `Owner/My_Space.v2` -> `owner-my-space-v2`
fn space_subdomain(space_id: &str) -> String {
    space_id
        .trim_matches('/')
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '/' | '.' | '_' => '-',
            other => other,
        })
        .collect()
}

/// Extracts the payload of the `complete` event from a server-sent event
/// stream. An `error` event is reported as a remote failure.
pub fn parse_event_stream(body: &str) -> Result<Value, GatewayError> {
    let normalized = body.replace("\r\n", "\n");
    for block in normalized.split("\n\n") {
        let mut event = None;
        let mut data_lines = Vec::new();
        for line in block.lines() {
            if let Some(name) = line.strip_prefix("event:") {
                event = Some(name.trim());
            } else if let Some(data) = line.strip_prefix("data:") {
                data_lines.push(data.trim());
            }
        }
        let data = data_lines.join("\n");

        match event {
            Some("complete") => return Ok(serde_json::from_str(&data)?),
            Some("error") => {
                let message = if data.is_empty() || data == "null" {
                    "remote app reported an error".to_string()
                } else {
                    data
                };
                return Err(GatewayError::Remote(message));
            }
            _ => continue,
        }
    }
    Err(GatewayError::Protocol(
        "event stream ended without a result".to_string(),
    ))
}
