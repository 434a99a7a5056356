//! Content blocks and the text-or-blocks union, with safe normalization.

use serde::{Deserialize, Serialize};

use super::MessageError;

/// Detail hint for image blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    #[default]
    Auto,
    Low,
    High,
}

impl ImageDetail {
    pub fn parse(s: &str) -> Result<Self, MessageError> {
        match s {
            "auto" => Ok(ImageDetail::Auto),
            "low" => Ok(ImageDetail::Low),
            "high" => Ok(ImageDetail::High),
            other => Err(MessageError::InvalidDetail(other.to_string())),
        }
    }
}

/// Image reference: URL plus detail hint and optional known dimensions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default)]
    pub detail: ImageDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl ImageUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            detail: ImageDetail::Auto,
            width: None,
            height: None,
        }
    }

    pub fn with_detail(mut self, detail: ImageDetail) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }
}

/// One content block. Unknown kinds fail deserialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Message content: a plain string or an ordered block list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

/// URL scheme policy for image blocks. Defaults to `https` only.
#[derive(Clone, Debug)]
pub struct UrlPolicy {
    /// Whether bounded `data:` URLs are accepted.
    pub allow_data_urls: bool,
    /// Byte cap for accepted `data:` URLs.
    pub max_data_url_bytes: usize,
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self {
            allow_data_urls: false,
            max_data_url_bytes: 1024 * 1024,
        }
    }
}

/// Wraps a string as a single text block; block lists pass through unchanged.
/// Idempotent.
pub fn normalize(content: &MessageContent) -> Vec<ContentBlock> {
    match content {
        MessageContent::Text(s) => vec![ContentBlock::Text { text: s.clone() }],
        MessageContent::Blocks(blocks) => blocks.clone(),
    }
}

/// Concatenates text blocks; image blocks are ignored.
pub fn extract_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(s) => s.clone(),
        MessageContent::Blocks(blocks) => {
            let mut out = String::new();
            for block in blocks {
                if let ContentBlock::Text { text } = block {
                    out.push_str(text);
                }
            }
            out
        }
    }
}

/// Appends `new` onto `base` without changing role or re-ordering blocks:
/// str+str concatenates, mixed shapes promote the string side to a text block.
pub fn append_content(base: MessageContent, new: MessageContent) -> MessageContent {
    match (base, new) {
        (MessageContent::Text(a), MessageContent::Text(b)) => MessageContent::Text(a + &b),
        (MessageContent::Text(a), MessageContent::Blocks(b)) => {
            let mut blocks = if a.is_empty() {
                Vec::new()
            } else {
                vec![ContentBlock::Text { text: a }]
            };
            blocks.extend(b);
            MessageContent::Blocks(blocks)
        }
        (MessageContent::Blocks(mut a), MessageContent::Text(b)) => {
            if !b.is_empty() {
                a.push(ContentBlock::Text { text: b });
            }
            MessageContent::Blocks(a)
        }
        (MessageContent::Blocks(mut a), MessageContent::Blocks(b)) => {
            a.extend(b);
            MessageContent::Blocks(a)
        }
    }
}

/// Validates block shape and URL policy.
pub fn validate(content: &MessageContent, policy: &UrlPolicy) -> Result<(), MessageError> {
    let MessageContent::Blocks(blocks) = content else {
        return Ok(());
    };
    if blocks.is_empty() {
        return Err(MessageError::EmptyContent);
    }
    for block in blocks {
        if let ContentBlock::ImageUrl { image_url } = block {
            validate_url(&image_url.url, policy)?;
        }
    }
    Ok(())
}

fn validate_url(url: &str, policy: &UrlPolicy) -> Result<(), MessageError> {
    if url.starts_with("https://") {
        return Ok(());
    }
    if url.starts_with("data:") {
        if !policy.allow_data_urls {
            return Err(MessageError::InvalidUrlScheme("data".to_string()));
        }
        if url.len() > policy.max_data_url_bytes {
            return Err(MessageError::DataUrlTooLarge {
                limit: policy.max_data_url_bytes,
            });
        }
        return Ok(());
    }
    let scheme = url.split(':').next().unwrap_or("").to_string();
    Err(MessageError::InvalidUrlScheme(scheme))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let content = MessageContent::Text("hi".into());
        let once = normalize(&content);
        let twice = normalize(&MessageContent::Blocks(once.clone()));
        assert_eq!(once, twice);
        assert_eq!(
            once,
            vec![ContentBlock::Text {
                text: "hi".to_string()
            }]
        );
    }

    #[test]
    fn append_empty_string_is_identity() {
        let text = MessageContent::Text("hello".into());
        assert_eq!(
            append_content(text.clone(), MessageContent::Text(String::new())),
            text
        );
        let blocks = MessageContent::Blocks(vec![ContentBlock::Text { text: "a".into() }]);
        assert_eq!(
            append_content(blocks.clone(), MessageContent::Text(String::new())),
            blocks
        );
    }

    #[test]
    fn append_covers_all_four_shape_combinations() {
        // str + str
        assert_eq!(
            append_content("a".into(), "b".into()),
            MessageContent::Text("ab".into())
        );
        // str + list: original text promoted to a text block, order preserved
        let img = ContentBlock::ImageUrl {
            image_url: ImageUrl::new("https://example.com/i.png"),
        };
        let out = append_content("a".into(), MessageContent::Blocks(vec![img.clone()]));
        assert_eq!(
            out,
            MessageContent::Blocks(vec![ContentBlock::Text { text: "a".into() }, img.clone()])
        );
        // list + str
        let out = append_content(MessageContent::Blocks(vec![img.clone()]), "b".into());
        assert_eq!(
            out,
            MessageContent::Blocks(vec![img.clone(), ContentBlock::Text { text: "b".into() }])
        );
        // list + list
        let out = append_content(
            MessageContent::Blocks(vec![img.clone()]),
            MessageContent::Blocks(vec![ContentBlock::Text { text: "c".into() }]),
        );
        assert_eq!(
            out,
            MessageContent::Blocks(vec![img, ContentBlock::Text { text: "c".into() }])
        );
    }

    #[test]
    fn extract_text_ignores_images() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text { text: "a".into() },
            ContentBlock::ImageUrl {
                image_url: ImageUrl::new("https://example.com/i.png"),
            },
            ContentBlock::Text { text: "b".into() },
        ]);
        assert_eq!(extract_text(&content), "ab");
    }

    #[test]
    fn empty_block_list_is_invalid() {
        let content = MessageContent::Blocks(vec![]);
        assert_eq!(
            validate(&content, &UrlPolicy::default()),
            Err(MessageError::EmptyContent)
        );
    }

    #[test]
    fn url_policy_rejects_http_and_unbounded_data() {
        let policy = UrlPolicy::default();
        let http = MessageContent::Blocks(vec![ContentBlock::ImageUrl {
            image_url: ImageUrl::new("http://example.com/i.png"),
        }]);
        assert_eq!(
            validate(&http, &policy),
            Err(MessageError::InvalidUrlScheme("http".into()))
        );

        let data = MessageContent::Blocks(vec![ContentBlock::ImageUrl {
            image_url: ImageUrl::new("data:image/png;base64,AAAA"),
        }]);
        assert_eq!(
            validate(&data, &policy),
            Err(MessageError::InvalidUrlScheme("data".into()))
        );

        let permissive = UrlPolicy {
            allow_data_urls: true,
            max_data_url_bytes: 8,
        };
        assert_eq!(
            validate(&data, &permissive),
            Err(MessageError::DataUrlTooLarge { limit: 8 })
        );
    }

    #[test]
    fn unknown_block_kind_fails_deserialization() {
        let raw = r#"[{"type": "video", "url": "https://example.com/v.mp4"}]"#;
        assert!(serde_json::from_str::<Vec<ContentBlock>>(raw).is_err());
    }

    #[test]
    fn invalid_detail_is_rejected() {
        assert_eq!(
            ImageDetail::parse("medium"),
            Err(MessageError::InvalidDetail("medium".into()))
        );
        assert_eq!(ImageDetail::parse("low"), Ok(ImageDetail::Low));
    }
}
