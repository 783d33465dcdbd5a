//! `loom assemble` and `loom ask`.
//!
//! Both commands build a conversation from an optional history file plus
//! the new message and run it through the [`ContextAssembler`]. `assemble`
//! prints the resulting request as JSON; `ask` streams it to the configured
//! backend and writes the answer to stdout as it arrives. Ctrl-C cancels
//! the stream.
//!
//! History files are JSON arrays of `{"role", "content"}` objects with
//! roles `user`, `assistant`, or `system_summary`.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::assembler::{AssembledRequest, AssemblyOptions, ContextAssembler, RetrievalMode};
use crate::backend::{Backend, ChatRequest, OpenAiBackend};
use crate::budget::ModelLimits;
use crate::config::Config;
use crate::facts::load_facts;
use crate::index::SearchIndex;
use crate::models::ConversationMessage;
use crate::retry::{stream_with_retry, RetryableStream};
use crate::stream::{StreamController, StreamEvent};
use crate::tokenizer::Tokenizer;

pub fn load_history(path: &Path) -> Result<Vec<ConversationMessage>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history file: {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse history file: {}", path.display()))
}

pub fn save_history(path: &Path, messages: &[ConversationMessage]) -> Result<()> {
    let json = serde_json::to_string_pretty(messages)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write history file: {}", path.display()))
}

pub fn retrieval_mode(no_retrieval: bool, source: Option<String>) -> RetrievalMode {
    match (no_retrieval, source) {
        (true, _) => RetrievalMode::Disabled,
        (false, Some(st)) => RetrievalMode::SourceType(st),
        (false, None) => RetrievalMode::All,
    }
}

fn conversation(history: Option<&Path>, message: &str) -> Result<Vec<ConversationMessage>> {
    let mut messages = match history {
        Some(path) => load_history(path)?,
        None => Vec::new(),
    };
    messages.push(ConversationMessage::user(message));
    Ok(messages)
}

async fn assemble_for(
    config: &Config,
    index: &SearchIndex,
    tokenizer: Tokenizer,
    limits: ModelLimits,
    messages: &[ConversationMessage],
    mode: RetrievalMode,
) -> Result<AssembledRequest> {
    let facts = match &config.assembly.facts_file {
        Some(path) => load_facts(path)
            .with_context(|| format!("Failed to read facts file: {}", path.display()))?,
        None => Vec::new(),
    };
    let assembler = ContextAssembler::new(tokenizer, limits, config.budget)
        .with_index(index)
        .with_options(AssemblyOptions::from_config(&config.assembly, facts));
    Ok(assembler.assemble(messages, mode).await?)
}

pub async fn run_assemble(
    config: &Config,
    message: &str,
    history: Option<&Path>,
    mode: RetrievalMode,
) -> Result<()> {
    let messages = conversation(history, message)?;
    let index = SearchIndex::open(config)
        .await
        .context("Failed to open index")?;
    let tokenizer = Tokenizer::new(&config.model.tokenizer)?;

    let request = assemble_for(
        config,
        &index,
        tokenizer,
        config.model.limits(),
        &messages,
        mode,
    )
    .await;
    index.close().await;

    println!("{}", serde_json::to_string_pretty(&request?)?);
    Ok(())
}

pub async fn run_ask(
    config: &Config,
    message: &str,
    history: Option<&Path>,
    mode: RetrievalMode,
) -> Result<()> {
    let backend = OpenAiBackend::from_config(config)?;
    let caps = backend.capabilities();
    let limits = ModelLimits {
        max_context_tokens: caps.max_context_tokens,
        max_output_tokens: caps.max_output_tokens,
    };

    let mut messages = conversation(history, message)?;
    let index = SearchIndex::open(config)
        .await
        .context("Failed to open index")?;
    let tokenizer = Tokenizer::new(&caps.tokenizer)?;
    let request = assemble_for(config, &index, tokenizer, limits, &messages, mode).await;
    index.close().await;
    let request = ChatRequest::from(&request?);

    let controller = StreamController::new(Duration::from_secs(config.stream.timeout_secs));
    let (handler, mut reader) = controller.session();
    let mut policy = RetryableStream::from_config(&config.stream);

    let canceller = controller.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let producer = stream_with_retry(&backend, &request, &handler, &mut policy);
    let consumer = async {
        let mut answer = String::new();
        let mut stdout = std::io::stdout();
        while let Some(event) = reader.recv().await {
            match event {
                StreamEvent::Content(text) => {
                    let _ = stdout.write_all(text.as_bytes());
                    let _ = stdout.flush();
                    answer.push_str(&text);
                }
                StreamEvent::ToolCalls(calls) => {
                    for call in calls {
                        eprintln!("tool call: {} {}", call.name, call.arguments);
                    }
                }
                StreamEvent::Retrying { attempt, error } => {
                    eprintln!("\nretrying (attempt {}): {}", attempt, error);
                    answer.clear();
                }
                StreamEvent::Done { .. } => return Ok(answer),
                StreamEvent::Error(e) => return Err(e),
            }
        }
        Ok(answer)
    };

    let (_, answer) = tokio::join!(producer, consumer);
    ctrl_c.abort();
    println!();

    let answer = answer.context("Streaming failed")?;
    if let Some(path) = history {
        messages.push(ConversationMessage::assistant(answer));
        save_history(path, &messages)?;
    }
    Ok(())
}
