//! Duplicate suppression for the receive path.
//!
//! Two structures work together: a per-topic id set as the fast path and a
//! global insertion-ordered set of composite keys as the backstop across
//! topics. Both are bounded by the same configured capacity.

use std::collections::{HashMap, HashSet, VecDeque};

/// Bounded insertion-ordered set of composite keys.
///
/// The oldest key is evicted at capacity. Re-inserting a known key does not
/// refresh its position.
#[derive(Debug)]
pub struct SeenSet {
    cap: usize,
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl SeenSet {
    pub fn new(cap: usize) -> SeenSet {
        SeenSet {
            cap: cap.max(1),
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.set.contains(key)
    }

    pub fn insert(&mut self, key: &str) {
        if self.set.contains(key) {
            return;
        }
        if self.order.len() >= self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.order.push_back(key.to_owned());
        self.set.insert(key.to_owned());
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-topic bounded message-id sets.
///
/// On overflow one arbitrary element is dropped; strict LRU is not required
/// here because the global set backstops cross-topic replays.
#[derive(Debug)]
pub struct TopicDedup {
    cap: usize,
    by_topic: HashMap<String, HashSet<i64>>,
}

impl TopicDedup {
    pub fn new(cap: usize) -> TopicDedup {
        TopicDedup {
            cap: cap.max(1),
            by_topic: HashMap::new(),
        }
    }

    /// Returns false when `message_id` was already seen for `topic`.
    pub fn check_and_insert(&mut self, topic: &str, message_id: i64) -> bool {
        let set = self.by_topic.entry(topic.to_owned()).or_default();
        if set.contains(&message_id) {
            return false;
        }
        set.insert(message_id);
        if set.len() > self.cap {
            if let Some(&victim) = set.iter().next() {
                set.remove(&victim);
            }
        }
        true
    }

    pub fn topic_len(&self, topic: &str) -> usize {
        self.by_topic.get(topic).map_or(0, HashSet::len)
    }
}

/// Composite key for the global set.
pub fn composite_key(publisher: &str, topic: &str, message_id: i64) -> String {
    format!("{}:{}:{}", publisher, topic, message_id)
}

/// Combined dedup state consulted by the receive path.
#[derive(Debug)]
pub struct DedupState {
    seen: SeenSet,
    per_topic: TopicDedup,
}

impl DedupState {
    pub fn new(cap: usize) -> DedupState {
        DedupState {
            seen: SeenSet::new(cap),
            per_topic: TopicDedup::new(cap),
        }
    }

    /// Record an observation. Returns true when the message is fresh; a hit
    /// in either structure suppresses it. Inserts as it checks, per-topic
    /// first.
    pub fn observe(&mut self, publisher: &str, topic: &str, message_id: i64) -> bool {
        if !self.per_topic.check_and_insert(topic, message_id) {
            return false;
        }
        let key = composite_key(publisher, topic, message_id);
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(&key);
        true
    }

    pub fn global_len(&self) -> usize {
        self.seen.len()
    }
}
