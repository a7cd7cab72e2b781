//! Memory tagging boundary.
//!
//! The task loop never looks inside a tagger's state. A background analysis
//! hands the full history to [`MemoryTagger::process_messages`], along with the
//! messages added since the previous pass, and persists whatever
//! [`MemoryTagger::state`] returns. The loop also asks the tagger to shrink the
//! history before a request grows too large.
//!
//! Each task gets its own tagger instance, so state never crosses tasks.

use crate::agent::compaction::{estimate_history_tokens, strip_orphaned_tool_results};
use crate::providers::base::Message;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Output of one tagging pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaggingResult {
    #[serde(rename = "messagesProcessed")]
    pub messages_processed: usize,
    /// Tags found in the new messages, strongest first.
    pub tags: Vec<String>,
}

#[async_trait]
pub trait MemoryTagger: Send + Sync {
    /// Tag the conversation. `history` is the whole task history at launch
    /// time; `new_messages` is the part of it not seen by an earlier pass.
    async fn process_messages(
        &self,
        history: &[Message],
        new_messages: &[Message],
    ) -> Result<TaggingResult>;

    /// Serializable snapshot of the tagger's topic state.
    fn state(&self) -> Value;

    fn restore_state(&self, state: Value) -> Result<()>;

    /// Return a reduced history. Only called when [`check_compact`](Self::check_compact) says so.
    async fn compact(&self, messages: &[Message]) -> Result<Vec<Message>>;

    fn check_compact(&self, messages: &[Message]) -> bool;
}

#[async_trait]
impl<T: MemoryTagger + ?Sized> MemoryTagger for Arc<T> {
    async fn process_messages(
        &self,
        history: &[Message],
        new_messages: &[Message],
    ) -> Result<TaggingResult> {
        (**self).process_messages(history, new_messages).await
    }

    fn state(&self) -> Value {
        (**self).state()
    }

    fn restore_state(&self, state: Value) -> Result<()> {
        (**self).restore_state(state)
    }

    async fn compact(&self, messages: &[Message]) -> Result<Vec<Message>> {
        (**self).compact(messages).await
    }

    fn check_compact(&self, messages: &[Message]) -> bool {
        (**self).check_compact(messages)
    }
}

const STOPWORDS: &[&str] = &[
    "about", "after", "again", "also", "been", "before", "being", "could", "does", "done",
    "each", "from", "have", "here", "into", "just", "like", "more", "most", "need", "only",
    "other", "over", "should", "some", "such", "than", "that", "their", "them", "then",
    "there", "these", "they", "this", "those", "very", "want", "were", "what", "when",
    "where", "which", "while", "will", "with", "would", "your",
];

#[derive(Debug, Clone)]
pub struct KeywordTaggerConfig {
    /// Words shorter than this are ignored.
    pub min_word_len: usize,
    /// Tags reported per batch.
    pub tags_per_batch: usize,
    /// Topics retained in state; weakest are evicted first.
    pub max_topics: usize,
    /// Estimated token count above which the history is compacted.
    pub compact_threshold_tokens: usize,
    /// Trailing messages kept verbatim by compaction.
    pub keep_recent: usize,
}

impl Default for KeywordTaggerConfig {
    fn default() -> Self {
        Self {
            min_word_len: 4,
            tags_per_batch: 5,
            max_topics: 64,
            compact_threshold_tokens: 8000,
            keep_recent: 20,
        }
    }
}

/// Frequency-based tagger: counts content words across messages and keeps the
/// strongest as running topics.
pub struct KeywordTagger {
    config: KeywordTaggerConfig,
    topics: Mutex<BTreeMap<String, u64>>,
}

impl KeywordTagger {
    pub fn new(config: KeywordTaggerConfig) -> Self {
        Self {
            config,
            topics: Mutex::new(BTreeMap::new()),
        }
    }

    fn topics(&self) -> MutexGuard<'_, BTreeMap<String, u64>> {
        self.topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn words<'a>(&self, text: &'a str) -> impl Iterator<Item = String> + 'a {
        let min_len = self.config.min_word_len;
        text.split(|c: char| !c.is_alphanumeric())
            .filter(move |w| w.chars().count() >= min_len)
            .map(str::to_lowercase)
            .filter(|w| !STOPWORDS.contains(&w.as_str()) && !w.chars().all(|c| c.is_numeric()))
    }

    fn count_words(&self, messages: &[Message]) -> BTreeMap<String, u64> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for message in messages.iter().filter(|m| m.role != "system") {
            for word in self.words(&message.content) {
                *counts.entry(word).or_default() += 1;
            }
        }
        counts
    }

    /// Current topics, strongest first (ties broken alphabetically).
    pub fn top_topics(&self, n: usize) -> Vec<String> {
        rank(&self.topics(), n)
    }
}

impl Default for KeywordTagger {
    fn default() -> Self {
        Self::new(KeywordTaggerConfig::default())
    }
}

fn rank(counts: &BTreeMap<String, u64>, n: usize) -> Vec<String> {
    let mut entries: Vec<(&String, &u64)> = counts.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    entries.into_iter().take(n).map(|(k, _)| k.clone()).collect()
}

#[async_trait]
impl MemoryTagger for KeywordTagger {
    async fn process_messages(
        &self,
        history: &[Message],
        new_messages: &[Message],
    ) -> Result<TaggingResult> {
        let batch = self.count_words(new_messages);

        let mut topics = self.topics();
        if topics.is_empty() {
            // First pass for this task, or a resume without tagger state:
            // build the topics from everything said so far.
            *topics = self.count_words(history);
        } else {
            for (word, count) in &batch {
                *topics.entry(word.clone()).or_default() += count;
            }
        }
        if topics.len() > self.config.max_topics {
            let keep: HashSet<String> = rank(&topics, self.config.max_topics).into_iter().collect();
            topics.retain(|k, _| keep.contains(k));
        }
        drop(topics);

        let tags = rank(&batch, self.config.tags_per_batch);
        debug!(
            "tagged {} new of {} messages: [{}]",
            new_messages.len(),
            history.len(),
            tags.join(", ")
        );
        Ok(TaggingResult {
            messages_processed: new_messages.len(),
            tags,
        })
    }

    fn state(&self) -> Value {
        serde_json::json!({ "topics": *self.topics() })
    }

    fn restore_state(&self, state: Value) -> Result<()> {
        let restored: BTreeMap<String, u64> = if state.is_null() {
            BTreeMap::new()
        } else {
            serde_json::from_value(state.get("topics").cloned().unwrap_or(Value::Null))
                .context("invalid keyword tagger state")?
        };
        *self.topics() = restored;
        Ok(())
    }

    async fn compact(&self, messages: &[Message]) -> Result<Vec<Message>> {
        let lead = messages.iter().take_while(|m| m.role == "system").count();
        let tail_start = messages.len().saturating_sub(self.config.keep_recent).max(lead);
        let folded = &messages[lead..tail_start];
        if folded.is_empty() {
            return Ok(messages.to_vec());
        }

        let topics = self.top_topics(self.config.tags_per_batch);
        let summary = Message::system(format!(
            "[Compacted {} earlier messages] Topics so far: {}",
            folded.len(),
            if topics.is_empty() {
                "(none)".to_string()
            } else {
                topics.join(", ")
            }
        ));

        let mut compacted = Vec::with_capacity(lead + 1 + messages.len() - tail_start);
        compacted.extend_from_slice(&messages[..lead]);
        compacted.push(summary);
        compacted.extend_from_slice(&messages[tail_start..]);
        strip_orphaned_tool_results(&mut compacted);
        debug!(
            "compacted history from {} to {} messages",
            messages.len(),
            compacted.len()
        );
        Ok(compacted)
    }

    fn check_compact(&self, messages: &[Message]) -> bool {
        estimate_history_tokens(messages) > self.config.compact_threshold_tokens
    }
}
