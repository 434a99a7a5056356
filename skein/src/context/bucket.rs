//! Bucketed message store: the unit of context assembly and compression.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Canonical buckets, in assembly order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketName {
    System,
    Playbook,
    History,
    Scratchpad,
    Control,
}

/// Assembly order: system, playbook, history, scratchpad, control.
pub const ASSEMBLY_ORDER: [BucketName; 5] = [
    BucketName::System,
    BucketName::Playbook,
    BucketName::History,
    BucketName::Scratchpad,
    BucketName::Control,
];

impl BucketName {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketName::System => "system",
            BucketName::Playbook => "playbook",
            BucketName::History => "history",
            BucketName::Scratchpad => "scratchpad",
            BucketName::Control => "control",
        }
    }

    fn index(&self) -> usize {
        ASSEMBLY_ORDER
            .iter()
            .position(|b| b == self)
            .unwrap_or(0)
    }
}

/// Serializable capture of every bucket.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot(pub Vec<Vec<Message>>);

/// Ordered, bucketed message store.
#[derive(Default)]
pub struct MessageStore {
    buckets: RwLock<[Vec<Message>; 5]>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one message to a bucket.
    pub fn add(&self, bucket: BucketName, message: Message) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        buckets[bucket.index()].push(message);
    }

    /// Owned copy of one bucket.
    pub fn bucket(&self, bucket: BucketName) -> Vec<Message> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets[bucket.index()].clone()
    }

    /// All buckets flattened in assembly order, uncompressed.
    pub fn all(&self) -> Vec<Message> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        ASSEMBLY_ORDER
            .iter()
            .flat_map(|b| buckets[b.index()].iter().cloned())
            .collect()
    }

    /// Per-bucket owned copies in assembly order.
    pub fn by_bucket(&self) -> Vec<(BucketName, Vec<Message>)> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        ASSEMBLY_ORDER
            .iter()
            .map(|b| (*b, buckets[b.index()].clone()))
            .collect()
    }

    pub fn clear(&self, bucket: BucketName) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        buckets[bucket.index()].clear();
    }

    pub fn len(&self) -> usize {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> MessageSnapshot {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        MessageSnapshot(buckets.iter().cloned().collect())
    }

    pub fn restore(&self, snapshot: &MessageSnapshot) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        for (i, bucket) in buckets.iter_mut().enumerate() {
            *bucket = snapshot.0.get(i).cloned().unwrap_or_default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_flatten_in_assembly_order() {
        let store = MessageStore::new();
        store.add(BucketName::History, Message::user("h"));
        store.add(BucketName::System, Message::system("s"));
        store.add(BucketName::Control, Message::system("c"));
        store.add(BucketName::Scratchpad, Message::user("sp"));
        store.add(BucketName::Playbook, Message::system("p"));

        let texts: Vec<String> = store.all().iter().map(Message::text_content).collect();
        assert_eq!(texts, vec!["s", "p", "h", "sp", "c"]);
    }

    #[test]
    fn snapshot_restore_roundtrips() {
        let store = MessageStore::new();
        store.add(BucketName::History, Message::user("one"));
        store.add(BucketName::Scratchpad, Message::assistant("two"));
        let snap = store.snapshot();

        let other = MessageStore::new();
        other.restore(&snap);
        assert_eq!(other.snapshot(), snap);
        assert_eq!(other.len(), 2);
    }

    #[test]
    fn snapshot_roundtrips_through_serde() {
        let store = MessageStore::new();
        store.add(BucketName::History, Message::tool("call_1", "out"));
        let snap = store.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: MessageSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
