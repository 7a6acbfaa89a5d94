//! Recognition sidecar OCR provider.
//!
//! The sidecar wraps a Korean/English text recognizer (preprocessing
//! included) behind `POST {url}/ocr` and answers `{"lines": [...]}`.

use super::{OcrImage, OcrProvider};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
struct SidecarResponse {
    lines: Vec<String>,
}

pub struct SidecarProvider {
    url: String,
    client: reqwest::Client,
}

impl SidecarProvider {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl OcrProvider for SidecarProvider {
    fn name(&self) -> &str {
        "sidecar"
    }

    async fn recognize(&self, image: &OcrImage) -> anyhow::Result<Vec<String>> {
        let part = Part::bytes(image.data.clone())
            .file_name(image.filename.clone())
            .mime_str(image.mime_type()?)?;

        let form = Form::new().part("image", part);

        let response = self
            .client
            .post(format!("{}/ocr", self.url))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("OCR sidecar error ({}): {}", status, error_text);
        }

        let sidecar: SidecarResponse = response.json().await?;
        info!(
            "SidecarProvider: {} lines from {}",
            sidecar.lines.len(),
            image.filename
        );
        Ok(sidecar.lines)
    }
}
