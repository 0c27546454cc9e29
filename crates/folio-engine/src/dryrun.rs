use std::io::Cursor;

use anyhow::{Context, Result};
use async_trait::async_trait;
use folio_contracts::settings::AspectRatio;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::provider::{ImageProvider, Part, ProviderRequest, ProviderResponse, ProviderUsage};

const LONG_EDGE: u32 = 512;
/// Output tokens Gemini bills per generated image.
const IMAGE_OUTPUT_TOKENS: u64 = 1290;
const IMAGE_INPUT_TOKENS: u64 = 258;

/// Offline provider: a solid-colour PNG whose colour is derived from the
/// request text, plus plausible usage figures.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryrunProvider;

#[async_trait]
impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let text: String = request
            .parts
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.as_str()),
                Part::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        let images = request.parts.iter().filter(|part| part.is_image()).count() as u64;
        let (width, height) = dims_for_ratio(request.aspect_ratio);
        let image = render_solid_png(width, height, color_from_prompt(&text))?;

        Ok(ProviderResponse {
            image,
            mime_type: Some("image/png".to_string()),
            usage: ProviderUsage {
                prompt_tokens: Some(estimate_tokens(&text) + images * IMAGE_INPUT_TOKENS),
                candidate_tokens: Some(IMAGE_OUTPUT_TOKENS),
                total_tokens: None,
            },
            model_name: Some(request.model.clone()),
            provider_request: json!({
                "endpoint": "dryrun-native",
                "payload": {
                    "model": request.model,
                    "text": text,
                    "images": images,
                    "aspect_ratio": request.aspect_ratio.as_str(),
                    "image_size": request.image_size.as_str(),
                }
            }),
            notes: Vec::new(),
        })
    }
}

pub(crate) fn dims_for_ratio(ratio: AspectRatio) -> (u32, u32) {
    let (w, h) = match ratio {
        AspectRatio::Square => (1, 1),
        AspectRatio::Portrait => (3, 4),
        AspectRatio::Landscape => (4, 3),
        AspectRatio::Wide => (16, 9),
        AspectRatio::Tall => (9, 16),
    };
    if w >= h {
        (LONG_EDGE, LONG_EDGE * h / w)
    } else {
        (LONG_EDGE * w / h, LONG_EDGE)
    }
}

pub(crate) fn render_solid_png(width: u32, height: u32, (r, g, b): (u8, u8, u8)) -> Result<Vec<u8>> {
    let mut image = RgbImage::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut encoded = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut encoded, ImageFormat::Png)
        .context("failed to encode dryrun image")?;
    Ok(encoded.into_inner())
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}

fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use folio_contracts::settings::{AspectRatio, ImageSize};
    use image::GenericImageView;

    use super::{dims_for_ratio, DryrunProvider};
    use crate::provider::{ImageProvider, Part, ProviderRequest};

    fn request(prompt: &str, ratio: AspectRatio) -> ProviderRequest {
        ProviderRequest {
            model: "gemini-3-pro-image-preview".to_string(),
            parts: vec![Part::text(prompt)],
            aspect_ratio: ratio,
            image_size: ImageSize::OneK,
            top_p: 0.95,
            temperature: 1.0,
        }
    }

    #[test]
    fn dims_follow_the_ratio() {
        assert_eq!(dims_for_ratio(AspectRatio::Portrait), (384, 512));
        assert_eq!(dims_for_ratio(AspectRatio::Wide), (512, 288));
        assert_eq!(dims_for_ratio(AspectRatio::Square), (512, 512));
    }

    #[tokio::test]
    async fn same_prompt_same_pixels() -> anyhow::Result<()> {
        let provider = DryrunProvider;
        let first = provider
            .generate(&request("a fox in a forest", AspectRatio::Portrait))
            .await?;
        let second = provider
            .generate(&request("a fox in a forest", AspectRatio::Portrait))
            .await?;
        let other = provider
            .generate(&request("a heron at dusk", AspectRatio::Portrait))
            .await?;
        assert_eq!(first.image, second.image);
        assert_ne!(first.image, other.image);

        let decoded = image::load_from_memory(&first.image)?;
        assert_eq!(decoded.dimensions(), (384, 512));
        assert_eq!(first.usage.candidate_tokens, Some(1290));
        assert!(first.usage.to_token_usage().is_some());
        Ok(())
    }
}
