//! Turns an inbound predict request (multipart or JSON) into image bytes.

use actix_multipart::Multipart;
use actix_web::HttpRequest;
use actix_web::http::header::CONTENT_TYPE;
use actix_web::web;
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use futures::{StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use shared::Orientation;
use std::time::Duration;

use crate::inference::fusion::MAX_SAMPLES;
use crate::inference::{OrientationSample, PredictError, TieBreakScores};

pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_BODY_BYTES: usize = 15 * 1024 * 1024;
const ACCEPTED_MIME_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Provide multipart 'image', 'imageBase64', or 'imageUrl'.")]
    MissingImage,
    #[error("Provide images via multipart (image_1..3) or JSON imagesBase64")]
    MissingImages,
    #[error("Invalid base64 image payload")]
    InvalidBase64,
    #[error("fetch image failed")]
    FetchFailed,
    #[error("Upload exceeds the {0} byte limit")]
    TooLarge(usize),
    #[error("Invalid multipart body: {0}")]
    Multipart(String),
    #[error("Failed to read request body: {0}")]
    Payload(String),
}

impl From<IntakeError> for PredictError {
    fn from(err: IntakeError) -> Self {
        PredictError::InvalidInput(err.to_string())
    }
}

/// Accepted file parts and text fields of a request. JSON bodies only
/// populate `text`.
#[derive(Debug, Default)]
pub struct RequestFields {
    pub files: Vec<(String, Vec<u8>)>,
    pub text: Map<String, Value>,
}

impl RequestFields {
    fn take_file(&mut self, name: &str) -> Option<Vec<u8>> {
        let index = self
            .files
            .iter()
            .position(|(n, data)| n == name && !data.is_empty())?;
        Some(self.files.swap_remove(index).1)
    }

    fn text_value(&self, key: &str) -> Option<&str> {
        self.text
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn metrics(&self) -> Option<TieBreakScores> {
        self.text.get("metrics").and_then(TieBreakScores::from_value)
    }
}

pub async fn read_request(req: &HttpRequest, payload: web::Payload) -> Result<RequestFields, IntakeError> {
    let is_multipart = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("multipart/form-data"));

    if is_multipart {
        read_multipart(Multipart::new(req.headers(), payload)).await
    } else {
        read_json(payload).await
    }
}

async fn read_multipart(mut multipart: Multipart) -> Result<RequestFields, IntakeError> {
    let mut fields = RequestFields::default();

    while let Some(mut field) = multipart
        .try_next()
        .await
        .map_err(|e| IntakeError::Multipart(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let is_file = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .is_some();
        let mime = field.content_type().map(|m| m.essence_str().to_string());
        let limit = if is_file { MAX_FILE_BYTES } else { MAX_BODY_BYTES };

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| IntakeError::Multipart(e.to_string()))?;
            if data.len() + chunk.len() > limit {
                return Err(IntakeError::TooLarge(limit));
            }
            data.extend_from_slice(&chunk);
        }

        if !is_file {
            let value = String::from_utf8_lossy(&data).into_owned();
            fields.text.insert(name, Value::String(value));
        } else if mime
            .as_deref()
            .is_some_and(|m| ACCEPTED_MIME_TYPES.contains(&m))
        {
            fields.files.push((name, data));
        } else {
            log::debug!("Skipping upload '{}' with unsupported type {:?}", name, mime);
        }
    }

    Ok(fields)
}

async fn read_json(mut payload: web::Payload) -> Result<RequestFields, IntakeError> {
    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| IntakeError::Payload(e.to_string()))?;
        if body.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(IntakeError::TooLarge(MAX_BODY_BYTES));
        }
        body.extend_from_slice(&chunk);
    }

    let mut fields = RequestFields::default();
    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(&body) {
        fields.text = map;
    } else if !body.is_empty() {
        log::debug!("Ignoring non-object request body of {} bytes", body.len());
    }
    Ok(fields)
}

/// Strips a `data:...;base64,` header if present.
pub fn extract_base64_payload(value: &str) -> &str {
    match value.find(',') {
        Some(i) => &value[i + 1..],
        None => value,
    }
}

pub fn decode_base64_image(value: &str) -> Result<Vec<u8>, IntakeError> {
    let payload: String = extract_base64_payload(value.trim())
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    BASE64.decode(payload).map_err(|_| IntakeError::InvalidBase64)
}

/// Fetches images referenced by `imageUrl`.
#[derive(Clone, Default)]
pub struct ImageFetcher {
    http_client: reqwest::Client,
}

impl ImageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, IntakeError> {
        let url = url::Url::parse(url).map_err(|_| IntakeError::FetchFailed)?;
        let response = self
            .http_client
            .get(url.clone())
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                log::warn!("Fetching {} failed: {}", url, e);
                IntakeError::FetchFailed
            })?;

        if !response.status().is_success() {
            log::warn!("Fetching {} returned {}", url, response.status());
            return Err(IntakeError::FetchFailed);
        }

        if response.content_length().is_some_and(|len| len > MAX_FILE_BYTES as u64) {
            log::warn!("Fetching {} refused: declared body exceeds {} bytes", url, MAX_FILE_BYTES);
            return Err(IntakeError::TooLarge(MAX_FILE_BYTES));
        }

        read_limited(response.bytes_stream(), MAX_FILE_BYTES).await
    }
}

/// Collects a byte stream, giving up as soon as it grows past `limit`.
async fn read_limited<S, B, E>(stream: S, limit: usize) -> Result<Vec<u8>, IntakeError>
where
    S: futures::Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            log::warn!("Reading fetched image failed: {}", e);
            IntakeError::FetchFailed
        })?;
        let chunk = chunk.as_ref();
        if data.len() + chunk.len() > limit {
            return Err(IntakeError::TooLarge(limit));
        }
        data.extend_from_slice(chunk);
    }
    Ok(data)
}

/// Resolves the single image of a `/predict` request: uploaded `image`
/// file, then `imageBase64`, then `image` text, then `imageUrl`.
pub async fn single_image(mut fields: RequestFields, fetcher: &ImageFetcher) -> Result<Vec<u8>, IntakeError> {
    if let Some(data) = fields.take_file("image") {
        return Ok(data);
    }

    let inline = fields
        .text
        .get("imageBase64")
        .filter(|v| !v.is_null())
        .or_else(|| fields.text.get("image"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(encoded) = inline {
        return decode_base64_image(encoded);
    }

    if let Some(url) = fields.text_value("imageUrl") {
        return fetcher.fetch(url).await;
    }

    Err(IntakeError::MissingImage)
}

/// Resolves the images of a `/predict/batch` request, each tagged with the
/// orientation of its slot.
pub fn batch_samples(fields: &mut RequestFields) -> Result<Vec<OrientationSample>, IntakeError> {
    let mut samples: Vec<OrientationSample> = Vec::new();

    for (name, data) in fields.files.drain(..) {
        let slot = name
            .strip_prefix("image_")
            .and_then(|n| n.parse::<usize>().ok())
            .and_then(|n| n.checked_sub(1))
            .and_then(Orientation::from_index);
        match slot {
            Some(orientation) if !data.is_empty() => {
                if samples.iter().any(|s| s.orientation == orientation) {
                    log::warn!("Duplicate upload for {} ignored", orientation);
                    continue;
                }
                samples.push(OrientationSample { orientation, image: data });
            }
            _ => log::debug!("Ignoring upload field '{}'", name),
        }
    }

    if samples.is_empty() {
        if let Some(encoded) = fields.text.get("imagesBase64").and_then(Value::as_array) {
            let usable: Vec<&str> = encoded
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            if usable.len() > MAX_SAMPLES {
                log::warn!("Received {} images, only the first {} are used", usable.len(), MAX_SAMPLES);
            }
            for (index, value) in usable.into_iter().take(MAX_SAMPLES).enumerate() {
                if let Some(orientation) = Orientation::from_index(index) {
                    samples.push(OrientationSample {
                        orientation,
                        image: decode_base64_image(value)?,
                    });
                }
            }
        }
    }

    if samples.is_empty() {
        return Err(IntakeError::MissingImages);
    }
    samples.sort_by_key(|s| s.orientation.index());
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn json_fields(value: Value) -> RequestFields {
        RequestFields {
            files: Vec::new(),
            text: value.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn data_uri_header_is_stripped() {
        assert_eq!(extract_base64_payload("data:image/png;base64,AAAA"), "AAAA");
        assert_eq!(extract_base64_payload("AAAA"), "AAAA");
        assert_eq!(decode_base64_image("data:image/jpeg;base64,/9j/").unwrap(), vec![0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn unpadded_and_wrapped_base64_is_accepted() {
        assert_eq!(decode_base64_image("aGk").unwrap(), b"hi");
        assert_eq!(decode_base64_image("aG\nk=").unwrap(), b"hi");
        assert!(matches!(decode_base64_image("***"), Err(IntakeError::InvalidBase64)));
    }

    #[actix_web::test]
    async fn uploaded_file_wins_over_inline_fields() {
        let mut fields = json_fields(json!({ "imageBase64": "aGk=" }));
        fields.files.push(("image".into(), vec![1, 2, 3]));

        let image = single_image(fields, &ImageFetcher::new()).await.unwrap();
        assert_eq!(image, vec![1, 2, 3]);
    }

    #[actix_web::test]
    async fn image_field_is_used_when_base64_absent() {
        let fields = json_fields(json!({ "image": "data:;base64,aGk=" }));
        assert_eq!(single_image(fields, &ImageFetcher::new()).await.unwrap(), b"hi");
    }

    #[actix_web::test]
    async fn missing_sources_are_rejected() {
        let fields = json_fields(json!({ "imageUrl": "   " }));
        let err = single_image(fields, &ImageFetcher::new()).await.unwrap_err();
        assert!(matches!(err, IntakeError::MissingImage));
    }

    #[actix_web::test]
    async fn malformed_url_fails_without_request() {
        let fields = json_fields(json!({ "imageUrl": "not a url" }));
        let err = single_image(fields, &ImageFetcher::new()).await.unwrap_err();
        assert!(matches!(err, IntakeError::FetchFailed));
    }

    #[actix_web::test]
    async fn fetched_body_stops_at_the_limit() {
        let chunks = vec![Ok::<_, std::io::Error>(vec![0u8; 6]), Ok(vec![0u8; 6]), Ok(vec![0u8; 6])];
        let err = read_limited(futures::stream::iter(chunks), 10).await.unwrap_err();
        assert!(matches!(err, IntakeError::TooLarge(10)));

        let chunks = vec![Ok::<_, std::io::Error>(vec![1u8; 4]), Ok(vec![2u8; 6])];
        let body = read_limited(futures::stream::iter(chunks), 10).await.unwrap();
        assert_eq!(body.len(), 10);
    }

    #[actix_web::test]
    async fn broken_fetch_stream_is_a_fetch_failure() {
        let chunks = vec![
            Ok(vec![1u8; 2]),
            Err(std::io::Error::other("connection reset")),
        ];
        let err = read_limited(futures::stream::iter(chunks), 10).await.unwrap_err();
        assert!(matches!(err, IntakeError::FetchFailed));
    }

    #[test]
    fn multipart_slots_map_to_orientations() {
        let mut fields = RequestFields::default();
        fields.files.push(("image_3".into(), vec![3]));
        fields.files.push(("image_1".into(), vec![1]));
        fields.files.push(("image_9".into(), vec![9]));
        fields.files.push(("avatar".into(), vec![0]));

        let samples = batch_samples(&mut fields).unwrap();
        let got: Vec<_> = samples.iter().map(|s| (s.orientation, s.image[0])).collect();
        assert_eq!(got, vec![(Orientation::Front, 1), (Orientation::Right, 3)]);
    }

    #[test]
    fn base64_batch_is_positional_and_capped() {
        let mut fields = json_fields(json!({ "imagesBase64": ["AQ==", "Ag==", "Aw==", "BA=="] }));

        let samples = batch_samples(&mut fields).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[1].orientation, Orientation::Left);
        assert_eq!(samples[2].image, vec![3]);
    }

    #[test]
    fn empty_batch_is_rejected() {
        let mut fields = json_fields(json!({ "imagesBase64": [] }));
        assert!(matches!(batch_samples(&mut fields), Err(IntakeError::MissingImages)));
    }

    #[test]
    fn metrics_read_from_text_field() {
        let fields = json_fields(json!({ "metrics": "{\"left\":{\"overallScore\":0.5}}" }));
        assert_eq!(fields.metrics().unwrap().score(Orientation::Left), Some(0.5));
    }
}
