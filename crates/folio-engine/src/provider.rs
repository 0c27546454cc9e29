use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use folio_contracts::settings::{AspectRatio, ImageSize};
use folio_contracts::usage::TokenUsage;
use serde_json::Value;

/// One typed part of an outbound generation request. Order is significant.
#[derive(Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    Image {
        mime_type: String,
        bytes: Vec<u8>,
        /// Where the bytes came from, for logs and receipts.
        label: String,
    },
}

impl Part {
    pub fn text(value: impl Into<String>) -> Self {
        Part::Text(value.into())
    }

    pub fn image_from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Part::Image {
            mime_type: mime_for_path(path).unwrap_or("image/png").to_string(),
            bytes,
            label: path.display().to_string(),
        })
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Part::Image { .. })
    }
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Part::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Part::Image {
                mime_type,
                bytes,
                label,
            } => f
                .debug_struct("Image")
                .field("mime_type", mime_type)
                .field("bytes", &bytes.len())
                .field("label", label)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub parts: Vec<Part>,
    pub aspect_ratio: AspectRatio,
    pub image_size: ImageSize,
    pub top_p: f32,
    pub temperature: f32,
}

/// Usage figures as the provider reported them; any may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderUsage {
    pub prompt_tokens: Option<u64>,
    pub candidate_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl ProviderUsage {
    /// `None` when the response carried no usage at all. A missing total is
    /// derived from the prompt and candidate counts.
    pub fn to_token_usage(&self) -> Option<TokenUsage> {
        if self.prompt_tokens.is_none()
            && self.candidate_tokens.is_none()
            && self.total_tokens.is_none()
        {
            return None;
        }
        let prompt = self.prompt_tokens.unwrap_or(0);
        let candidates = self.candidate_tokens.unwrap_or(0);
        let total = self
            .total_tokens
            .unwrap_or_else(|| prompt.saturating_add(candidates));
        Some(TokenUsage::new(prompt, candidates, total))
    }
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub image: Vec<u8>,
    pub mime_type: Option<String>,
    pub usage: ProviderUsage,
    /// Model that actually served the call, when the provider says.
    pub model_name: Option<String>,
    /// JSON sent to the provider, stored in the receipt after sanitizing.
    pub provider_request: Value,
    pub notes: Vec<String>,
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse>;
}

pub(crate) fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

pub(crate) fn extension_for_mime(mime: Option<&str>) -> &'static str {
    let lowered = mime.unwrap_or_default().to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    "png"
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().is_some_and(|last| last == trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::{error_chain_text, extension_for_mime, Part, ProviderUsage};
    use folio_contracts::usage::TokenUsage;

    #[test]
    fn missing_total_is_derived() {
        let usage = ProviderUsage {
            prompt_tokens: Some(40),
            candidate_tokens: Some(1290),
            total_tokens: None,
        };
        assert_eq!(usage.to_token_usage(), Some(TokenUsage::new(40, 1290, 1330)));
        assert_eq!(ProviderUsage::default().to_token_usage(), None);
    }

    #[test]
    fn reported_total_is_kept() {
        let usage = ProviderUsage {
            prompt_tokens: Some(1),
            candidate_tokens: Some(2),
            total_tokens: Some(10),
        };
        assert_eq!(usage.to_token_usage(), Some(TokenUsage::new(1, 2, 10)));
    }

    #[test]
    fn chain_text_joins_distinct_causes() {
        let err = anyhow!("connection reset").context("Gemini request failed");
        assert_eq!(
            error_chain_text(&err, 200),
            "Gemini request failed | caused by: connection reset"
        );
        assert_eq!(error_chain_text(&err, 7), "Gemini …");
    }

    #[test]
    fn image_debug_hides_bytes() {
        let part = Part::Image {
            mime_type: "image/png".to_string(),
            bytes: vec![0; 2048],
            label: "pages/page_003.png".to_string(),
        };
        let rendered = format!("{part:?}");
        assert!(rendered.contains("2048"));
        assert!(!rendered.contains("0, 0"));
    }

    #[test]
    fn extension_follows_mime() {
        assert_eq!(extension_for_mime(Some("image/jpeg")), "jpg");
        assert_eq!(extension_for_mime(Some("image/webp")), "webp");
        assert_eq!(extension_for_mime(None), "png");
    }
}
