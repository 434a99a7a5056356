//! Token estimation for budget pre-checks.
//!
//! Explicitly approximate: text uses a character-ratio heuristic, images use
//! the tile formula when dimensions are known and a conservative fallback
//! otherwise. Only the context engineer consumes these numbers.

use super::content::{ContentBlock, ImageDetail, ImageUrl, MessageContent};
use super::Message;

/// Character-ratio and image-tile token estimator.
#[derive(Clone, Debug)]
pub struct TokenEstimator {
    /// Average characters per text token.
    pub chars_per_token: f32,
    /// Fixed cost per image at `detail=low`, and base cost otherwise.
    pub image_base_tokens: u32,
    /// Cost per 512x512 tile for images with known dimensions.
    pub tokens_per_tile: u32,
    /// Fallback per image with unknown dimensions at `detail=high`.
    pub high_detail_fallback: u32,
    /// Fallback per image with unknown dimensions at `detail=auto`.
    pub auto_detail_fallback: u32,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
            image_base_tokens: 85,
            tokens_per_tile: 170,
            high_detail_fallback: 1105,
            auto_detail_fallback: 425,
        }
    }
}

impl TokenEstimator {
    pub fn estimate_text(&self, text: &str) -> u32 {
        (text.chars().count() as f32 / self.chars_per_token).ceil() as u32
    }

    fn estimate_image(&self, image: &ImageUrl) -> u32 {
        match image.detail {
            ImageDetail::Low => self.image_base_tokens,
            detail => match (image.width, image.height) {
                (Some(w), Some(h)) => {
                    let tiles = w.div_ceil(512) * h.div_ceil(512);
                    self.image_base_tokens + self.tokens_per_tile * tiles
                }
                _ => match detail {
                    ImageDetail::High => self.high_detail_fallback,
                    _ => self.auto_detail_fallback,
                },
            },
        }
    }

    /// Estimated tokens for one message, content plus tool-call arguments.
    pub fn estimate_message(&self, message: &Message) -> u32 {
        let content = match &message.content {
            MessageContent::Text(s) => self.estimate_text(s),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => self.estimate_text(text),
                    ContentBlock::ImageUrl { image_url } => self.estimate_image(image_url),
                })
                .sum(),
        };
        let tool_calls = message
            .tool_calls
            .iter()
            .flatten()
            .map(|tc| self.estimate_text(&tc.arguments) + self.estimate_text(&tc.name))
            .sum::<u32>();
        content + tool_calls
    }

    /// Sum over a slice of messages.
    pub fn estimate_messages(&self, messages: &[Message]) -> u32 {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageContent};

    #[test]
    fn text_uses_char_ratio() {
        let est = TokenEstimator::default();
        assert_eq!(est.estimate_text(""), 0);
        assert_eq!(est.estimate_text("abcd"), 1);
        assert_eq!(est.estimate_text("abcde"), 2);
    }

    #[test]
    fn low_detail_image_is_flat() {
        let est = TokenEstimator::default();
        let m = Message {
            content: MessageContent::Blocks(vec![ContentBlock::ImageUrl {
                image_url: ImageUrl::new("https://e.com/i.png").with_detail(ImageDetail::Low),
            }]),
            ..Message::user("")
        };
        assert_eq!(est.estimate_message(&m), 85);
    }

    #[test]
    fn known_dimensions_use_tile_formula() {
        let est = TokenEstimator::default();
        let image = ImageUrl::new("https://e.com/i.png")
            .with_detail(ImageDetail::High)
            .with_dimensions(1024, 768);
        let m = Message {
            content: MessageContent::Blocks(vec![ContentBlock::ImageUrl { image_url: image }]),
            ..Message::user("")
        };
        // ceil(1024/512)=2, ceil(768/512)=2 -> 4 tiles
        assert_eq!(est.estimate_message(&m), 85 + 170 * 4);
    }

    #[test]
    fn unknown_dimensions_fall_back_by_detail() {
        let est = TokenEstimator::default();
        let high = Message {
            content: MessageContent::Blocks(vec![ContentBlock::ImageUrl {
                image_url: ImageUrl::new("https://e.com/i.png").with_detail(ImageDetail::High),
            }]),
            ..Message::user("")
        };
        let auto = Message {
            content: MessageContent::Blocks(vec![ContentBlock::ImageUrl {
                image_url: ImageUrl::new("https://e.com/i.png"),
            }]),
            ..Message::user("")
        };
        assert_eq!(est.estimate_message(&high), 1105);
        assert_eq!(est.estimate_message(&auto), 425);
    }
}
