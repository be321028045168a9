use super::{check_status, decode_json, transport_error, VisionBackend};
use crate::types::{ErrorKind, ImageBlob, VisionFinding};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    image_base64: &'a str,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    label: String,
    confidence: f64,
}

/// Image classifier reached over HTTP.
///
/// `POST {endpoint}` with `{"image_base64": ...}`, answered by
/// `{"label": ..., "confidence": ...}`.
pub struct HttpVisionBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpVisionBackend {
    pub fn new(client: reqwest::Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl VisionBackend for HttpVisionBackend {
    async fn classify(&self, image: &ImageBlob) -> Result<VisionFinding, ErrorKind> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ClassifyRequest {
                image_base64: image.as_str(),
            })
            .send()
            .await
            .map_err(transport_error)?;

        let body: ClassifyResponse = decode_json(check_status(response).await?).await?;

        if !(0.0..=1.0).contains(&body.confidence) {
            return Err(ErrorKind::Malformed(format!(
                "confidence {} outside [0, 1]",
                body.confidence
            )));
        }
        if body.label.trim().is_empty() {
            return Err(ErrorKind::Malformed("empty label".into()));
        }

        Ok(VisionFinding {
            label: body.label.trim().to_string(),
            confidence: body.confidence,
        })
    }

    fn name(&self) -> &str {
        "http-vision"
    }
}
