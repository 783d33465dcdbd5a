//! Conversation history compression and truncation.
//!
//! When prior turns do not fit the history budget, the oldest turns are
//! folded into one [`Role::SystemSummary`] message and the most recent
//! `keep_recent` turns are kept verbatim. Truncation then walks backward
//! from the newest message keeping whole messages, and returns them in
//! chronological order.

use chrono::Utc;

use crate::models::{ConversationMessage, Role};
use crate::tokenizer::Tokenizer;

/// Folds a run of older messages into a short text.
pub trait Summarizer: Send + Sync {
    /// Summarize `messages` in at most `max_tokens`. May return an empty
    /// string when there is nothing worth keeping.
    fn summarize(&self, messages: &[ConversationMessage], max_tokens: usize) -> String;
}

/// Keeps the opening sentence of each message, newest lines first to survive
/// the final cut.
pub struct ExtractiveSummarizer {
    tokenizer: Tokenizer,
    per_message_tokens: usize,
}

impl ExtractiveSummarizer {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self {
            tokenizer,
            per_message_tokens: 60,
        }
    }
}

impl Summarizer for ExtractiveSummarizer {
    fn summarize(&self, messages: &[ConversationMessage], max_tokens: usize) -> String {
        let lines: Vec<String> = messages
            .iter()
            .filter_map(|m| {
                let gist = first_sentence(m.content.trim());
                if gist.is_empty() {
                    return None;
                }
                let gist = self
                    .tokenizer
                    .truncate(gist, self.per_message_tokens, false);
                Some(format!("- {}: {}", role_label(m.role), gist.trim()))
            })
            .collect();

        if lines.is_empty() || max_tokens == 0 {
            return String::new();
        }

        let body = lines.join("\n");
        let header = "Earlier in this conversation:";
        let body_budget = max_tokens.saturating_sub(self.tokenizer.count(header) + 1);
        if body_budget == 0 {
            return String::new();
        }
        // The tail holds the most recent of the old turns.
        let body = self.tokenizer.truncate(&body, body_budget, true);
        format!("{}\n{}", header, body.trim_start())
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::SystemSummary => "summary",
    }
}

fn first_sentence(text: &str) -> &str {
    let end = text
        .char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(text.len());
    text[..end].trim_end_matches('\n')
}

/// Keep the last `keep_recent` messages and replace the rest with a summary.
/// If the summary comes back empty the older messages are simply dropped.
pub fn compress_history(
    prior: &[ConversationMessage],
    keep_recent: usize,
    summarizer: &dyn Summarizer,
    summary_budget: usize,
) -> Vec<ConversationMessage> {
    if prior.len() <= keep_recent {
        return prior.to_vec();
    }
    let split = prior.len() - keep_recent;
    let (older, recent) = prior.split_at(split);

    let summary = summarizer.summarize(older, summary_budget);
    let mut out = Vec::with_capacity(recent.len() + 1);
    if !summary.trim().is_empty() {
        let timestamp = older.last().map(|m| m.timestamp).unwrap_or_else(Utc::now);
        out.push(ConversationMessage {
            role: Role::SystemSummary,
            content: summary,
            timestamp,
        });
    }
    out.extend_from_slice(recent);
    tracing::debug!(
        summarized = older.len(),
        kept = recent.len(),
        "compressed conversation history"
    );
    out
}

/// Keep whole messages, newest first, until `budget` tokens are used; the
/// result is in chronological order.
pub fn truncate_history(
    messages: &[ConversationMessage],
    budget: usize,
    tokenizer: &Tokenizer,
) -> Vec<ConversationMessage> {
    let mut remaining = budget;
    let mut kept = Vec::new();
    for message in messages.iter().rev() {
        let cost = tokenizer.count(&message.content);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        kept.push(message.clone());
    }
    kept.reverse();
    kept
}

pub fn count_messages(messages: &[ConversationMessage], tokenizer: &Tokenizer) -> usize {
    messages.iter().map(|m| tokenizer.count(&m.content)).sum()
}
