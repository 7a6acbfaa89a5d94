//! Image-to-text providers.
//!
//! Defines the [`OcrProvider`] trait so different OCR backends (the
//! recognition sidecar, Mistral OCR) can be swapped via query parameter.
//! Every provider hands back recognized text lines in reading order.

pub mod mistral;
pub mod sidecar;

use anyhow::{bail, Result};
use image::ImageFormat;

/// An uploaded label photo.
pub struct OcrImage {
    pub filename: String,
    pub data: Vec<u8>,
}

impl OcrImage {
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            data,
        }
    }

    /// MIME type sniffed from the image bytes; rejects non-images.
    pub fn mime_type(&self) -> Result<&'static str> {
        let format = image::guess_format(&self.data)
            .map_err(|e| anyhow::anyhow!("'{}' is not a recognizable image: {}", self.filename, e))?;
        Ok(match format {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::WebP => "image/webp",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Tiff => "image/tiff",
            other => bail!("Unsupported image format {:?} for '{}'", other, self.filename),
        })
    }
}

/// Async trait implemented by each OCR backend.
#[async_trait::async_trait]
pub trait OcrProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn recognize(&self, image: &OcrImage) -> Result<Vec<String>>;
}

/// Known provider identifiers used for registry lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OcrProviderKind {
    Sidecar,
    Mistral,
}

impl OcrProviderKind {
    /// Parse a query-parameter string into a provider kind.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sidecar" | "easyocr" => Some(Self::Sidecar),
            "mistral" | "mistral_ocr" => Some(Self::Mistral),
            _ => None,
        }
    }
}

/// Flatten OCR markdown into text lines: table pipes become spaces,
/// separator rows and heading/emphasis markers are dropped.
pub fn markdown_to_lines(markdown: &str) -> Vec<String> {
    markdown
        .lines()
        .map(str::trim)
        .filter(|line| !is_separator(line))
        .map(|line| {
            let line = line.replace('|', " ");
            let line = line.trim_start_matches('#').replace("**", "").replace('*', "");
            line.split_whitespace().collect::<Vec<_>>().join(" ")
        })
        .filter(|line| !line.is_empty())
        .collect()
}

/// `---`, `| --- | :-: |` and friends.
fn is_separator(line: &str) -> bool {
    !line.is_empty() && line.chars().all(|c| matches!(c, '-' | '|' | ':' | ' ')) && line.contains('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_table_becomes_lines() {
        let md = "# 영양정보\n\n| 나트륨 | 250mg |\n|---|---|\n| **단백질** | 8.2g |\n\n---\n";
        assert_eq!(
            markdown_to_lines(md),
            vec!["영양정보", "나트륨 250mg", "단백질 8.2g"]
        );
    }

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(markdown_to_lines("열량 150kcal\n\n당류 5g"), vec!["열량 150kcal", "당류 5g"]);
    }

    #[test]
    fn test_negative_number_line_is_not_separator() {
        assert!(!is_separator("-5"));
        assert!(is_separator("| :-- | --: |"));
    }

    #[test]
    fn test_mime_type_sniffed() {
        let png = OcrImage::new("a.png", vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]);
        assert_eq!(png.mime_type().unwrap(), "image/png");
        let jpeg = OcrImage::new("a.jpg", vec![0xFF, 0xD8, 0xFF, 0xE0, 0, 0]);
        assert_eq!(jpeg.mime_type().unwrap(), "image/jpeg");
        let text = OcrImage::new("a.txt", b"hello world".to_vec());
        assert!(text.mime_type().is_err());
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!(OcrProviderKind::from_str("sidecar"), Some(OcrProviderKind::Sidecar));
        assert_eq!(OcrProviderKind::from_str("mistral_ocr"), Some(OcrProviderKind::Mistral));
        assert_eq!(OcrProviderKind::from_str("tesseract"), None);
    }
}
