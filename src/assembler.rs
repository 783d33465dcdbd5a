//! Request assembly.
//!
//! Turns a conversation into a size-bounded request for the backend:
//!
//! 1. Split off the **current message** (the last user turn).
//! 2. Fail with [`Error::Oversize`] if it alone exceeds the history budget.
//!    It is never truncated.
//! 3. Build the instruction block (facts first, then the preamble) and
//!    truncate it, keeping its start, to the instruction budget.
//! 4. Optionally retrieve chunks for the current message, pick greedily
//!    within the retrieval budget, and render them as a separate message.
//! 5. Compress prior history if it does not fit, then keep whole messages
//!    newest-first within what the current message leaves over.
//! 6. Cap the response at `min(response budget, backend max output)`.
//!
//! All state is local to one [`ContextAssembler::assemble`] call.

use serde::Serialize;

use crate::budget::{
    select_chunks_with_budget, sort_by_relevance, BudgetAllocation, BudgetAllocator,
    BudgetRatios, ModelLimits,
};
use crate::config::AssemblyConfig;
use crate::error::{Error, Result};
use crate::facts::render_facts;
use crate::history::{
    compress_history, count_messages, truncate_history, ExtractiveSummarizer, Summarizer,
};
use crate::index::SearchIndex;
use crate::models::{ContextChunk, ConversationMessage, Role};
use crate::tokenizer::Tokenizer;

/// Response cap used when neither the budget nor the backend gives one.
pub const DEFAULT_RESPONSE_CAP: usize = 1024;

/// Share of the leftover history budget a summary may take.
const SUMMARY_SHARE: f64 = 0.25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrievalMode {
    Disabled,
    All,
    /// Only chunks of this source type.
    SourceType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestRole {
    System,
    User,
    Assistant,
}

/// Where a request message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Instructions,
    Retrieval,
    Summary,
    History,
    Current,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMessage {
    pub role: RequestRole,
    pub kind: MessageKind,
    pub content: String,
}

impl RequestMessage {
    fn new(role: RequestRole, kind: MessageKind, content: String) -> Self {
        Self {
            role,
            kind,
            content,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssembledRequest {
    pub messages: Vec<RequestMessage>,
    pub response_cap: usize,
    pub budget: BudgetAllocation,
    /// Chunks that made it into the retrieval block.
    pub retrieved: Vec<ContextChunk>,
}

impl AssembledRequest {
    pub fn current(&self) -> Option<&RequestMessage> {
        self.messages.iter().find(|m| m.kind == MessageKind::Current)
    }
}

/// Per-request knobs. Plain values; `with_*` returns a modified copy.
#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    pub preamble: String,
    pub facts: Vec<String>,
    pub keep_recent: usize,
    pub retrieval_limit: i64,
    pub format_reserve: usize,
    pub safety_margin: f64,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self::from_config(&AssemblyConfig::default(), Vec::new())
    }
}

impl AssemblyOptions {
    pub fn from_config(config: &AssemblyConfig, facts: Vec<String>) -> Self {
        Self {
            preamble: config.preamble.clone(),
            facts,
            keep_recent: config.keep_recent,
            retrieval_limit: config.retrieval_limit,
            format_reserve: config.format_reserve,
            safety_margin: config.safety_margin,
        }
    }

    pub fn with_preamble(self, preamble: impl Into<String>) -> Self {
        Self {
            preamble: preamble.into(),
            ..self
        }
    }

    pub fn with_facts(self, facts: Vec<String>) -> Self {
        Self { facts, ..self }
    }

    pub fn with_keep_recent(self, keep_recent: usize) -> Self {
        Self {
            keep_recent,
            ..self
        }
    }

    pub fn with_retrieval_limit(self, retrieval_limit: i64) -> Self {
        Self {
            retrieval_limit,
            ..self
        }
    }

    pub fn with_format_reserve(self, format_reserve: usize) -> Self {
        Self {
            format_reserve,
            ..self
        }
    }
}

pub struct ContextAssembler<'a> {
    tokenizer: Tokenizer,
    allocator: BudgetAllocator,
    limits: ModelLimits,
    index: Option<&'a SearchIndex>,
    summarizer: Box<dyn Summarizer + 'a>,
    options: AssemblyOptions,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(tokenizer: Tokenizer, limits: ModelLimits, ratios: BudgetRatios) -> Self {
        Self {
            summarizer: Box::new(ExtractiveSummarizer::new(tokenizer.clone())),
            allocator: BudgetAllocator::new(limits.max_context_tokens, ratios),
            tokenizer,
            limits,
            index: None,
            options: AssemblyOptions::default(),
        }
    }

    pub fn with_index(mut self, index: &'a SearchIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_options(mut self, options: AssemblyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Box<dyn Summarizer + 'a>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn budget(&self) -> BudgetAllocation {
        self.allocator.budget()
    }

    pub async fn assemble(
        &self,
        conversation: &[ConversationMessage],
        mode: RetrievalMode,
    ) -> Result<AssembledRequest> {
        let (current, prior) = split_current(conversation)?;
        let budget = self.allocator.budget();

        let current_tokens = self.tokenizer.count(&current.content);
        if current_tokens > budget.history {
            return Err(Error::Oversize {
                tokens: current_tokens,
                budget: budget.history,
            });
        }

        let mut messages = Vec::new();

        let instructions = self.instruction_block(budget.instructions);
        let instruction_tokens = self.tokenizer.count(&instructions);
        if !instructions.is_empty() {
            messages.push(RequestMessage::new(
                RequestRole::System,
                MessageKind::Instructions,
                instructions,
            ));
        }

        let (retrieval_block, retrieved) = self
            .retrieval_block(&current.content, &mode, budget.retrieval)
            .await?;
        let retrieval_tokens = self.tokenizer.count(&retrieval_block);
        if !retrieval_block.is_empty() {
            messages.push(RequestMessage::new(
                RequestRole::System,
                MessageKind::Retrieval,
                retrieval_block,
            ));
        }

        let history = self.fit_history(&prior, current_tokens, budget.history);
        let history_tokens = count_messages(&history, &self.tokenizer) + current_tokens;
        for message in history {
            let (role, kind) = match message.role {
                Role::User => (RequestRole::User, MessageKind::History),
                Role::Assistant => (RequestRole::Assistant, MessageKind::History),
                Role::SystemSummary => (RequestRole::System, MessageKind::Summary),
            };
            messages.push(RequestMessage::new(role, kind, message.content));
        }
        messages.push(RequestMessage::new(
            RequestRole::User,
            MessageKind::Current,
            current.content.clone(),
        ));

        if !self.allocator.can_fit_with_margin(
            instruction_tokens,
            retrieval_tokens,
            history_tokens,
            self.options.safety_margin,
        ) {
            tracing::warn!(
                instruction_tokens,
                retrieval_tokens,
                history_tokens,
                "assembled request is within category budgets but inside the safety margin"
            );
        }

        let response_cap = resolve_response_cap(budget.response, self.limits.max_output_tokens);
        tracing::debug!(
            messages = messages.len(),
            instruction_tokens,
            retrieval_tokens,
            history_tokens,
            retrieved = retrieved.len(),
            response_cap,
            "assembled request"
        );

        Ok(AssembledRequest {
            messages,
            response_cap,
            budget,
            retrieved,
        })
    }

    fn instruction_block(&self, budget: usize) -> String {
        let mut block = render_facts(&self.options.facts);
        if !block.is_empty() && !self.options.preamble.is_empty() {
            block.push('\n');
        }
        block.push_str(&self.options.preamble);
        self.tokenizer.truncate(&block, budget, false)
    }

    async fn retrieval_block(
        &self,
        query: &str,
        mode: &RetrievalMode,
        budget: usize,
    ) -> Result<(String, Vec<ContextChunk>)> {
        let results = match (mode, self.index) {
            (RetrievalMode::Disabled, _) => return Ok((String::new(), Vec::new())),
            (_, None) => {
                return Err(Error::Validation(
                    "retrieval requested but no search index is attached".to_string(),
                ))
            }
            (RetrievalMode::All, Some(index)) => {
                index.search(query, self.options.retrieval_limit).await?
            }
            (RetrievalMode::SourceType(st), Some(index)) => {
                index
                    .search_with_filter(query, st, self.options.retrieval_limit)
                    .await?
            }
        };

        let mut candidates: Vec<ContextChunk> = results.into_iter().map(Into::into).collect();
        sort_by_relevance(&mut candidates);

        let selectable = budget.saturating_sub(self.options.format_reserve);
        let selected = select_chunks_with_budget(&candidates, selectable);
        if selected.is_empty() {
            return Ok((String::new(), selected));
        }

        let block = render_retrieval(&selected);
        Ok((self.tokenizer.truncate(&block, budget, false), selected))
    }

    fn fit_history(
        &self,
        prior: &[ConversationMessage],
        current_tokens: usize,
        history_budget: usize,
    ) -> Vec<ConversationMessage> {
        let available = history_budget.saturating_sub(current_tokens);
        let prior_tokens = count_messages(prior, &self.tokenizer);

        let candidates = if prior_tokens + current_tokens > history_budget {
            let summary_budget = (available as f64 * SUMMARY_SHARE).floor() as usize;
            compress_history(
                prior,
                self.options.keep_recent,
                self.summarizer.as_ref(),
                summary_budget,
            )
        } else {
            prior.to_vec()
        };

        truncate_history(&candidates, available, &self.tokenizer)
    }
}

/// Split off the last user message. Everything else, in order, is prior
/// history.
fn split_current(
    conversation: &[ConversationMessage],
) -> Result<(&ConversationMessage, Vec<ConversationMessage>)> {
    let idx = conversation
        .iter()
        .rposition(|m| m.role == Role::User)
        .ok_or_else(|| Error::Validation("conversation has no user message".to_string()))?;

    let prior = conversation
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != idx)
        .map(|(_, m)| m.clone())
        .collect();
    Ok((&conversation[idx], prior))
}

fn render_retrieval(chunks: &[ContextChunk]) -> String {
    let mut out = String::from("Reference material:\n");
    for chunk in chunks {
        out.push_str(&format!(
            "\n[{}: {}]\n{}\n",
            chunk.source_type,
            chunk.source_path,
            chunk.content.trim()
        ));
    }
    out
}

/// `min(response_budget, max_output)` over the positive values, or
/// [`DEFAULT_RESPONSE_CAP`] when neither is positive.
pub fn resolve_response_cap(response_budget: usize, max_output: usize) -> usize {
    match (response_budget, max_output) {
        (0, 0) => DEFAULT_RESPONSE_CAP,
        (0, m) => m,
        (r, 0) => r,
        (r, m) => r.min(m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_id;
    use crate::models::Chunk;
    use tempfile::TempDir;

    fn limits(max_context: usize) -> ModelLimits {
        ModelLimits {
            max_context_tokens: max_context,
            max_output_tokens: 4096,
        }
    }

    fn assembler<'a>(max_context: usize) -> ContextAssembler<'a> {
        ContextAssembler::new(
            Tokenizer::cl100k().unwrap(),
            limits(max_context),
            BudgetRatios::default(),
        )
    }

    async fn index_with(docs: &[(&str, &str, &str)]) -> (TempDir, SearchIndex) {
        let tmp = TempDir::new().unwrap();
        let index = SearchIndex::open_path(&tmp.path().join("loom.sqlite"))
            .await
            .unwrap()
            .with_source_types(vec!["characters".into(), "chapters".into()]);
        let tok = Tokenizer::cl100k().unwrap();
        for (path, source_type, content) in docs {
            index
                .index(&Chunk {
                    id: chunk_id(path, 0),
                    content: content.to_string(),
                    source_type: source_type.to_string(),
                    source_path: path.to_string(),
                    chunk_index: 0,
                    token_count: tok.count(content),
                    modified_time: 1,
                    metadata_json: "{}".to_string(),
                })
                .await
                .unwrap();
        }
        (tmp, index)
    }

    #[test]
    fn test_response_cap() {
        assert_eq!(resolve_response_cap(819, 4096), 819);
        assert_eq!(resolve_response_cap(8000, 4096), 4096);
        assert_eq!(resolve_response_cap(0, 512), 512);
        assert_eq!(resolve_response_cap(300, 0), 300);
        assert_eq!(resolve_response_cap(0, 0), DEFAULT_RESPONSE_CAP);
    }

    #[tokio::test]
    async fn test_oversize_current_message_fails() {
        let asm = assembler(1000); // history budget 300
        let huge = "word ".repeat(400);
        let convo = vec![ConversationMessage::user(huge)];
        match asm.assemble(&convo, RetrievalMode::Disabled).await {
            Err(Error::Oversize { tokens, budget }) => {
                assert!(tokens > budget);
                assert_eq!(budget, 300);
            }
            other => panic!("expected Oversize, got {:?}", other.map(|r| r.messages.len())),
        }
    }

    #[tokio::test]
    async fn test_no_user_message_is_validation_error() {
        let asm = assembler(1000);
        let convo = vec![ConversationMessage::assistant("hello")];
        assert!(matches!(
            asm.assemble(&convo, RetrievalMode::Disabled).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_message_order_and_current_last() {
        let asm = assembler(8192);
        let convo = vec![
            ConversationMessage::user("first question"),
            ConversationMessage::assistant("first answer"),
            ConversationMessage::user("second question"),
        ];
        let req = asm.assemble(&convo, RetrievalMode::Disabled).await.unwrap();
        let kinds: Vec<MessageKind> = req.messages.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::Instructions,
                MessageKind::History,
                MessageKind::History,
                MessageKind::Current
            ]
        );
        assert_eq!(req.messages[1].content, "first question");
        assert_eq!(req.messages[2].role, RequestRole::Assistant);
        assert_eq!(req.current().unwrap().content, "second question");
        assert_eq!(req.budget.total, 8192);
        assert_eq!(req.response_cap, 819);
    }

    #[tokio::test]
    async fn test_facts_lead_and_survive_truncation() {
        let tok = Tokenizer::cl100k().unwrap();
        let options = AssemblyOptions::default()
            .with_facts(vec!["The hero has green eyes.".to_string()])
            .with_preamble("Be helpful. ".repeat(200));
        let asm = assembler(1000).with_options(options); // instruction budget 200
        let convo = vec![ConversationMessage::user("what color are the hero's eyes?")];
        let req = asm.assemble(&convo, RetrievalMode::Disabled).await.unwrap();
        let instructions = &req.messages[0];
        assert_eq!(instructions.kind, MessageKind::Instructions);
        assert!(instructions.content.starts_with("Established facts:\n- The hero has green eyes."));
        assert!(tok.count(&instructions.content) <= 200);
    }

    #[tokio::test]
    async fn test_retrieval_block_injected_separately() {
        let (_tmp, index) = index_with(&[
            ("characters/hero.md", "characters", "The hero is brave and carries a lantern."),
            ("chapters/one.md", "chapters", "The storm reached the harbor at dawn."),
        ])
        .await;
        let asm = assembler(8192).with_index(&index);
        let convo = vec![ConversationMessage::user("Is the hero brave?")];
        let req = asm.assemble(&convo, RetrievalMode::All).await.unwrap();

        let retrieval = req
            .messages
            .iter()
            .find(|m| m.kind == MessageKind::Retrieval)
            .expect("retrieval message");
        assert_eq!(retrieval.role, RequestRole::System);
        assert!(retrieval.content.contains("characters/hero.md"));
        assert!(req.retrieved.iter().any(|c| c.source_path == "characters/hero.md"));
        assert_eq!(req.messages[1].kind, MessageKind::Retrieval);
        assert_eq!(req.messages.last().unwrap().kind, MessageKind::Current);
    }

    #[tokio::test]
    async fn test_retrieval_filter_and_disabled() {
        let (_tmp, index) = index_with(&[
            ("characters/hero.md", "characters", "The hero watches the storm."),
            ("chapters/one.md", "chapters", "The storm reached the harbor."),
        ])
        .await;
        let asm = assembler(8192).with_index(&index);
        let convo = vec![ConversationMessage::user("storm")];

        let filtered = asm
            .assemble(&convo, RetrievalMode::SourceType("chapters".into()))
            .await
            .unwrap();
        assert_eq!(filtered.retrieved.len(), 1);
        assert_eq!(filtered.retrieved[0].source_type, "chapters");

        let disabled = asm.assemble(&convo, RetrievalMode::Disabled).await.unwrap();
        assert!(disabled.retrieved.is_empty());
        assert!(disabled
            .messages
            .iter()
            .all(|m| m.kind != MessageKind::Retrieval));

        assert!(matches!(
            asm.assemble(&convo, RetrievalMode::SourceType("spells".into()))
                .await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_retrieval_respects_budget() {
        let long = "lantern ".repeat(300);
        let (_tmp, index) = index_with(&[
            ("characters/a.md", "characters", long.as_str()),
            ("characters/b.md", "characters", "A short lantern note."),
        ])
        .await;
        // retrieval budget = 400, minus reserve 50 → 350 selectable
        let asm = assembler(1000).with_index(&index);
        let convo = vec![ConversationMessage::user("lantern")];
        let req = asm.assemble(&convo, RetrievalMode::All).await.unwrap();
        let used: usize = req.retrieved.iter().map(|c| c.token_count).sum();
        assert!(used <= 350);
        assert!(req.retrieved.iter().any(|c| c.source_path == "characters/b.md"));
        let tok = Tokenizer::cl100k().unwrap();
        let block = req
            .messages
            .iter()
            .find(|m| m.kind == MessageKind::Retrieval)
            .unwrap();
        assert!(tok.count(&block.content) <= 400);
    }

    #[tokio::test]
    async fn test_long_history_compressed_current_intact() {
        let tok = Tokenizer::cl100k().unwrap();
        let asm = assembler(2000).with_options(AssemblyOptions::default().with_keep_recent(2));
        let history_budget = asm.budget().history;

        let mut convo = Vec::new();
        for i in 0..30 {
            convo.push(ConversationMessage::user(format!(
                "Question {} about the old lighthouse. It has many details to share.",
                i
            )));
            convo.push(ConversationMessage::assistant(format!(
                "Answer {} about the keeper. There is more to tell about the keeper.",
                i
            )));
        }
        let current = "And what happened to the keeper in the end?";
        convo.push(ConversationMessage::user(current));

        let req = asm.assemble(&convo, RetrievalMode::Disabled).await.unwrap();
        assert_eq!(req.current().unwrap().content, current);

        let history: Vec<&RequestMessage> = req
            .messages
            .iter()
            .filter(|m| matches!(m.kind, MessageKind::History | MessageKind::Summary | MessageKind::Current))
            .collect();
        let used: usize = history.iter().map(|m| tok.count(&m.content)).sum();
        assert!(used <= history_budget);
        assert!(req.messages.iter().any(|m| m.kind == MessageKind::Summary));
        // The two most recent prior turns are kept verbatim, in order.
        let verbatim: Vec<&str> = req
            .messages
            .iter()
            .filter(|m| m.kind == MessageKind::History)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(verbatim.len(), 2);
        assert!(verbatim[0].starts_with("Question 29"));
        assert!(verbatim[1].starts_with("Answer 29"));
    }
}
