//! Mistral OCR provider (uses Mistral's OCR API).

use super::{markdown_to_lines, OcrImage, OcrProvider};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub struct MistralOcrProvider {
    api_key: String,
    client: reqwest::Client,
}

impl MistralOcrProvider {
    pub fn from_env(client: reqwest::Client) -> anyhow::Result<Self> {
        let api_key = std::env::var("MISTRAL_API_KEY")
            .map_err(|_| anyhow::anyhow!("MISTRAL_API_KEY not set"))?;
        Ok(Self { api_key, client })
    }
}

// ── Mistral API request/response types ──────────────────────────────────────

#[derive(Serialize)]
struct OcrRequest {
    model: String,
    document: DocumentSource,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum DocumentSource {
    #[serde(rename = "image_url")]
    Image { image_url: String },
}

#[derive(Deserialize)]
struct OcrResponse {
    pages: Vec<MistralPage>,
}

#[derive(Deserialize)]
struct MistralPage {
    markdown: String,
}

fn data_url(image: &OcrImage) -> anyhow::Result<String> {
    Ok(format!(
        "data:{};base64,{}",
        image.mime_type()?,
        BASE64.encode(&image.data)
    ))
}

// ── Provider implementation ─────────────────────────────────────────────────

#[async_trait::async_trait]
impl OcrProvider for MistralOcrProvider {
    fn name(&self) -> &str {
        "mistral"
    }

    async fn recognize(&self, image: &OcrImage) -> anyhow::Result<Vec<String>> {
        let body = OcrRequest {
            model: "mistral-ocr-latest".to_string(),
            document: DocumentSource::Image {
                image_url: data_url(image)?,
            },
        };

        info!(
            "MistralOcrProvider: calling OCR API for {} ({} bytes)",
            image.filename,
            image.data.len()
        );

        let resp = self
            .client
            .post("https://api.mistral.ai/v1/ocr")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Mistral OCR API error ({}): {}", status, text);
        }

        let raw_text = resp.text().await?;
        debug!(
            "MistralOcrProvider: raw response ({} bytes): {}",
            raw_text.len(),
            raw_text.chars().take(500).collect::<String>()
        );
        let ocr: OcrResponse = serde_json::from_str(&raw_text)?;

        Ok(ocr
            .pages
            .iter()
            .flat_map(|p| markdown_to_lines(&p.markdown))
            .collect())
    }
}
