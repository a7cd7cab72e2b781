use crate::providers::base::Message;
use std::collections::HashSet;
use tracing::debug;

const CHARS_PER_TOKEN_ESTIMATE: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    // Use char count for better accuracy with non-ASCII text
    text.chars().count() / CHARS_PER_TOKEN_ESTIMATE
}

pub fn estimate_history_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Remove tool results whose originating tool call is no longer in `messages`.
///
/// After compaction folds older entries into a summary, a `role = "tool"` entry
/// may point at an assistant tool call that was folded away. Results with no
/// `tool_call_id` at all are kept, since the model stream does not always
/// announce the call first.
///
/// Returns the number of entries removed.
pub fn strip_orphaned_tool_results(messages: &mut Vec<Message>) -> usize {
    let call_ids: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == "assistant")
        .flat_map(|m| m.tool_calls.iter().flatten())
        .map(|tc| tc.id.clone())
        .collect();

    let before_len = messages.len();
    messages.retain(|m| {
        if m.role != "tool" {
            return true;
        }
        match &m.tool_call_id {
            Some(id) => call_ids.contains(id),
            None => true,
        }
    });
    let removed = before_len - messages.len();
    if removed > 0 {
        debug!("stripped {} orphaned tool result message(s)", removed);
    }
    removed
}
