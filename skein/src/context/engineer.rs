//! Budget-aware context assembly.
//!
//! Assembly concatenates buckets in their canonical order and, when the
//! estimate exceeds the budget, applies multimodal degradation followed by
//! the configured compression strategy. Two rules hold for every strategy:
//! messages with `metadata.pinned=true` are inviolate, and only text blocks
//! are ever truncated (image blocks are dropped whole or kept whole).

use serde::{Deserialize, Serialize};

use crate::message::{ContentBlock, Message, MessageContent, TokenEstimator};

use super::bucket::{BucketName, MessageStore};

/// Compression strategy applied when the assembled context exceeds budget.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    /// Drop or shorten oldest entries until under budget.
    #[default]
    Truncation,
    /// Keep the most recent N messages per bucket.
    SlidingWindow,
    /// Hierarchical: compress `history` first, then `scratchpad`, never `system`.
    Level,
}

/// How multimodal messages degrade under pressure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultimodalMode {
    /// Drop the whole multimodal message.
    Atomic,
    /// Degrade to extracted text, then truncate as text.
    #[default]
    TextOnly,
    /// Retain the last K image blocks, drop older ones, keep text.
    LatestImage,
}

/// Context-engineer configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub strategy: CompressionStrategy,
    pub max_context_tokens: u32,
    pub reserve_tokens: u32,
    /// Per-bucket window for `sliding_window`.
    pub window: usize,
    /// K for `latest_image`.
    pub latest_images: usize,
    pub multimodal: MultimodalMode,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            strategy: CompressionStrategy::Truncation,
            max_context_tokens: 128_000,
            reserve_tokens: 4096,
            window: 40,
            latest_images: 2,
            multimodal: MultimodalMode::TextOnly,
        }
    }
}

/// Assembles under budget and fails with a typed error when compression
/// cannot get there (e.g. pinned plus system content alone overflow).
pub fn assemble_checked(
    store: &MessageStore,
    config: &CompressionConfig,
    estimator: &TokenEstimator,
) -> Result<Vec<Message>, crate::error::RuntimeError> {
    let messages = assemble(store, config, estimator);
    let budget = config
        .max_context_tokens
        .saturating_sub(config.reserve_tokens);
    let estimated = estimator.estimate_messages(&messages);
    if estimated > budget {
        return Err(crate::error::RuntimeError::BudgetExceeded { estimated, budget });
    }
    Ok(messages)
}

/// Assembles a flat message list for an LLM request.
pub fn assemble(
    store: &MessageStore,
    config: &CompressionConfig,
    estimator: &TokenEstimator,
) -> Vec<Message> {
    let mut buckets = store.by_bucket();
    let budget = config
        .max_context_tokens
        .saturating_sub(config.reserve_tokens);

    if total_tokens(&buckets, estimator) > budget {
        degrade_multimodal(&mut buckets, config, estimator, budget);
    }
    if total_tokens(&buckets, estimator) > budget {
        match config.strategy {
            CompressionStrategy::Truncation => truncate(&mut buckets, estimator, budget),
            CompressionStrategy::SlidingWindow => sliding_window(&mut buckets, config.window),
            CompressionStrategy::Level => level(&mut buckets, estimator, budget),
        }
    }

    buckets.into_iter().flat_map(|(_, msgs)| msgs).collect()
}

fn total_tokens(buckets: &[(BucketName, Vec<Message>)], estimator: &TokenEstimator) -> u32 {
    buckets
        .iter()
        .map(|(_, msgs)| estimator.estimate_messages(msgs))
        .sum()
}

fn is_multimodal(message: &Message) -> bool {
    matches!(&message.content, MessageContent::Blocks(blocks)
        if blocks.iter().any(|b| matches!(b, ContentBlock::ImageUrl { .. })))
}

fn compressible(bucket: BucketName, message: &Message) -> bool {
    bucket != BucketName::System && !message.is_pinned()
}

/// Applies the multimodal mode to image-carrying messages, oldest first.
fn degrade_multimodal(
    buckets: &mut [(BucketName, Vec<Message>)],
    config: &CompressionConfig,
    estimator: &TokenEstimator,
    budget: u32,
) {
    match config.multimodal {
        MultimodalMode::Atomic => {
            // Drop whole multimodal messages, oldest first, until under budget.
            for bucket_idx in 0..buckets.len() {
                let name = buckets[bucket_idx].0;
                let mut msg_idx = 0;
                while msg_idx < buckets[bucket_idx].1.len() {
                    if total_tokens(buckets, estimator) <= budget {
                        return;
                    }
                    let msg = &buckets[bucket_idx].1[msg_idx];
                    if compressible(name, msg) && is_multimodal(msg) {
                        buckets[bucket_idx].1.remove(msg_idx);
                    } else {
                        msg_idx += 1;
                    }
                }
            }
        }
        MultimodalMode::TextOnly => {
            for (bucket, msgs) in buckets.iter_mut() {
                for m in msgs.iter_mut() {
                    if compressible(*bucket, m) && is_multimodal(m) {
                        m.content = MessageContent::Text(m.text_content());
                    }
                }
            }
        }
        MultimodalMode::LatestImage => {
            // Count images newest-first across all buckets; keep the last K.
            let mut budget_left = config.latest_images;
            for (bucket, msgs) in buckets.iter_mut().rev() {
                for m in msgs.iter_mut().rev() {
                    if !compressible(*bucket, m) || !is_multimodal(m) {
                        continue;
                    }
                    if let MessageContent::Blocks(blocks) = &mut m.content {
                        let mut kept = Vec::with_capacity(blocks.len());
                        for block in blocks.drain(..).rev() {
                            match block {
                                ContentBlock::ImageUrl { .. } if budget_left > 0 => {
                                    budget_left -= 1;
                                    kept.push(block);
                                }
                                ContentBlock::ImageUrl { .. } => {}
                                text => kept.push(text),
                            }
                        }
                        kept.reverse();
                        if kept.is_empty() {
                            m.content = MessageContent::Text(String::new());
                        } else {
                            m.content = MessageContent::Blocks(kept);
                        }
                    }
                }
            }
        }
    }
}

/// Drops (or text-truncates) oldest compressible entries until under budget.
fn truncate(buckets: &mut [(BucketName, Vec<Message>)], estimator: &TokenEstimator, budget: u32) {
    // Oldest first across buckets in assembly order, system excluded.
    for bucket_idx in 0..buckets.len() {
        let name = buckets[bucket_idx].0;
        if name == BucketName::System {
            continue;
        }
        let mut msg_idx = 0;
        while msg_idx < buckets[bucket_idx].1.len() {
            let total = total_tokens(buckets, estimator);
            if total <= budget {
                return;
            }
            let overage = total - budget;
            let msg = &buckets[bucket_idx].1[msg_idx];
            if msg.is_pinned() {
                msg_idx += 1;
                continue;
            }
            let msg_tokens = estimator.estimate_message(msg);
            if msg_tokens > overage && !is_multimodal(msg) {
                // Shortening this one message is enough; keep its tail.
                let text = msg.text_content();
                let keep_tokens = msg_tokens - overage;
                let keep_chars =
                    (keep_tokens as f32 * estimator.chars_per_token) as usize;
                let chars: Vec<char> = text.chars().collect();
                let tail: String = chars[chars.len().saturating_sub(keep_chars)..]
                    .iter()
                    .collect();
                buckets[bucket_idx].1[msg_idx].content = MessageContent::Text(tail);
                return;
            }
            buckets[bucket_idx].1.remove(msg_idx);
        }
    }
}

/// Keeps the most recent `window` messages per non-system bucket; pinned
/// messages are kept on top of the window.
fn sliding_window(buckets: &mut [(BucketName, Vec<Message>)], window: usize) {
    for (name, msgs) in buckets.iter_mut() {
        if *name == BucketName::System || msgs.len() <= window {
            continue;
        }
        let cut = msgs.len() - window;
        let mut kept: Vec<Message> = Vec::with_capacity(window);
        for (i, m) in msgs.drain(..).enumerate() {
            if i >= cut || m.is_pinned() {
                kept.push(m);
            }
        }
        *msgs = kept;
    }
}

/// Hierarchical: drop oldest from `history`, then `scratchpad`; never `system`.
fn level(buckets: &mut [(BucketName, Vec<Message>)], estimator: &TokenEstimator, budget: u32) {
    for target in [BucketName::History, BucketName::Scratchpad] {
        let Some(bucket_idx) = buckets.iter().position(|(n, _)| *n == target) else {
            continue;
        };
        let mut msg_idx = 0;
        while msg_idx < buckets[bucket_idx].1.len() {
            if total_tokens(buckets, estimator) <= budget {
                return;
            }
            if buckets[bucket_idx].1[msg_idx].is_pinned() {
                msg_idx += 1;
                continue;
            }
            buckets[bucket_idx].1.remove(msg_idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentBlock, ImageUrl, Message, MessageContent};
    use serde_json::{Map, Value};

    fn pinned(mut m: Message) -> Message {
        let mut meta = Map::new();
        meta.insert("pinned".into(), Value::Bool(true));
        m.metadata = Some(meta);
        m
    }

    fn tiny_config(strategy: CompressionStrategy, max: u32) -> CompressionConfig {
        CompressionConfig {
            strategy,
            max_context_tokens: max,
            reserve_tokens: 0,
            window: 2,
            latest_images: 1,
            multimodal: MultimodalMode::TextOnly,
        }
    }

    fn image_message(text: &str, url: &str) -> Message {
        Message {
            content: MessageContent::Blocks(vec![
                ContentBlock::Text { text: text.into() },
                ContentBlock::ImageUrl {
                    image_url: ImageUrl::new(url),
                },
            ]),
            ..Message::user("")
        }
    }

    #[test]
    fn under_budget_assembly_is_identity_in_order() {
        let store = MessageStore::new();
        store.add(BucketName::System, Message::system("sys"));
        store.add(BucketName::History, Message::user("hi"));
        let out = assemble(
            &store,
            &CompressionConfig::default(),
            &TokenEstimator::default(),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text_content(), "sys");
    }

    #[test]
    fn truncation_drops_oldest_and_keeps_pinned() {
        let store = MessageStore::new();
        store.add(BucketName::System, Message::system("sys"));
        store.add(BucketName::History, Message::user("a".repeat(400)));
        store.add(BucketName::History, pinned(Message::user("b".repeat(400))));
        store.add(BucketName::History, Message::user("c".repeat(40)));
        let out = assemble(
            &store,
            &tiny_config(CompressionStrategy::Truncation, 120),
            &TokenEstimator::default(),
        );
        let texts: Vec<String> = out.iter().map(Message::text_content).collect();
        // Oldest unpinned history entry dropped; pinned survives untouched.
        assert!(texts.iter().any(|t| t.starts_with('b') && t.len() == 400));
        assert!(!texts.iter().any(|t| t.starts_with('a') && t.len() == 400));
    }

    #[test]
    fn truncation_shortens_a_single_long_text_keeping_tail() {
        let store = MessageStore::new();
        let long = format!("{}{}", "x".repeat(900), "tail");
        store.add(BucketName::History, Message::user(long));
        let out = assemble(
            &store,
            &tiny_config(CompressionStrategy::Truncation, 100),
            &TokenEstimator::default(),
        );
        assert_eq!(out.len(), 1);
        let text = out[0].text_content();
        assert!(text.len() < 904);
        assert!(text.ends_with("tail"));
    }

    #[test]
    fn sliding_window_keeps_most_recent_per_bucket() {
        let store = MessageStore::new();
        for i in 0..5 {
            store.add(BucketName::History, Message::user(format!("m{i}{}", "x".repeat(100))));
        }
        let out = assemble(
            &store,
            &tiny_config(CompressionStrategy::SlidingWindow, 10),
            &TokenEstimator::default(),
        );
        let texts: Vec<String> = out.iter().map(Message::text_content).collect();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].starts_with("m3"));
        assert!(texts[1].starts_with("m4"));
    }

    #[test]
    fn sliding_window_keeps_pinned_outside_window() {
        let store = MessageStore::new();
        store.add(BucketName::History, pinned(Message::user(format!("p{}", "x".repeat(100)))));
        for i in 0..4 {
            store.add(BucketName::History, Message::user(format!("m{i}{}", "x".repeat(100))));
        }
        let out = assemble(
            &store,
            &tiny_config(CompressionStrategy::SlidingWindow, 10),
            &TokenEstimator::default(),
        );
        let texts: Vec<String> = out.iter().map(Message::text_content).collect();
        assert_eq!(texts.len(), 3);
        assert!(texts[0].starts_with('p'));
    }

    #[test]
    fn level_compresses_history_before_scratchpad_and_never_system() {
        let store = MessageStore::new();
        store.add(BucketName::System, Message::system("s".repeat(100)));
        store.add(BucketName::History, Message::user("h".repeat(400)));
        store.add(BucketName::Scratchpad, Message::user("p".repeat(100)));
        let out = assemble(
            &store,
            &tiny_config(CompressionStrategy::Level, 60),
            &TokenEstimator::default(),
        );
        let texts: Vec<String> = out.iter().map(Message::text_content).collect();
        // History gone, scratchpad survived, system untouched.
        assert_eq!(texts.len(), 2);
        assert!(texts[0].starts_with('s'));
        assert!(texts[1].starts_with('p'));
    }

    #[test]
    fn text_only_mode_degrades_images_to_text() {
        let store = MessageStore::new();
        store.add(
            BucketName::History,
            image_message("caption", "https://e.com/big.png"),
        );
        store.add(BucketName::History, Message::user("x".repeat(400)));
        let mut cfg = tiny_config(CompressionStrategy::Truncation, 110);
        cfg.multimodal = MultimodalMode::TextOnly;
        let out = assemble(&store, &cfg, &TokenEstimator::default());
        assert!(out
            .iter()
            .all(|m| matches!(m.content, MessageContent::Text(_))));
        assert!(out.iter().any(|m| m.text_content() == "caption"));
    }

    #[test]
    fn atomic_mode_drops_whole_multimodal_messages() {
        let store = MessageStore::new();
        store.add(
            BucketName::History,
            image_message("caption", "https://e.com/big.png"),
        );
        store.add(BucketName::History, Message::user("keep"));
        let mut cfg = tiny_config(CompressionStrategy::Truncation, 100);
        cfg.multimodal = MultimodalMode::Atomic;
        let out = assemble(&store, &cfg, &TokenEstimator::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text_content(), "keep");
    }

    #[test]
    fn latest_image_mode_keeps_only_newest_k_images() {
        let store = MessageStore::new();
        store.add(
            BucketName::History,
            image_message("old", "https://e.com/old.png"),
        );
        store.add(
            BucketName::History,
            image_message("new", "https://e.com/new.png"),
        );
        let mut cfg = tiny_config(CompressionStrategy::Truncation, 500);
        cfg.multimodal = MultimodalMode::LatestImage;
        cfg.latest_images = 1;
        let out = assemble(&store, &cfg, &TokenEstimator::default());
        let has_image = |m: &Message| is_multimodal(m);
        assert!(!has_image(&out[0]));
        assert!(has_image(&out[1]));
        // Text blocks always survive image dropping.
        assert_eq!(out[0].text_content(), "old");
    }

    #[test]
    fn pinned_multimodal_messages_are_never_degraded() {
        let store = MessageStore::new();
        store.add(
            BucketName::History,
            pinned(image_message("keep", "https://e.com/pin.png")),
        );
        store.add(BucketName::History, Message::user("x".repeat(4000)));
        let mut cfg = tiny_config(CompressionStrategy::Truncation, 100);
        cfg.multimodal = MultimodalMode::Atomic;
        let out = assemble(&store, &cfg, &TokenEstimator::default());
        assert!(out.iter().any(is_multimodal));
    }
}
