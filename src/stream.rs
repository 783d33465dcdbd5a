//! Streaming sessions.
//!
//! A session pairs one producer ([`StreamHandler`]) with one consumer
//! ([`StreamReader`]) around a [`StreamController`] that carries the
//! cancellation signal and the deadline. The consumer always sees exactly
//! one terminal event ([`StreamEvent::Done`] or [`StreamEvent::Error`])
//! and then `None`, whichever way the session ends.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, ChatRequest, ToolCallDelta};
use crate::error::StreamError;

/// Events buffered between producer and consumer.
const CHUNK_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    /// Completed tool calls, in call-index order.
    ToolCalls(Vec<ToolCall>),
    /// The previous attempt failed; anything streamed since the last
    /// `Retrying` belongs to a discarded attempt.
    Retrying { attempt: u32, error: StreamError },
    Done { finish_reason: Option<String> },
    Error(StreamError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolCall {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Collects interleaved tool-call fragments by call index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, ToolCall>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, delta: &ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_insert_with(|| ToolCall {
            index: delta.index,
            ..ToolCall::default()
        });
        if let Some(id) = delta.id.as_deref().filter(|s| !s.is_empty()) {
            call.id = id.to_string();
        }
        if let Some(name) = delta.name.as_deref().filter(|s| !s.is_empty()) {
            call.name = name.to_string();
        }
        call.arguments.push_str(&delta.arguments);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn finish(self) -> Vec<ToolCall> {
        self.calls.into_values().collect()
    }
}

/// How a session ended. Set once; whichever happens first sticks.
#[derive(Debug)]
enum Outcome {
    Completed,
    Stopped(StreamError),
}

struct ControllerState {
    token: CancellationToken,
    deadline: Instant,
    timeout: Duration,
    outcome: OnceLock<Outcome>,
}

/// Cancellation and deadline for one session. Clones share state.
#[derive(Clone)]
pub struct StreamController {
    state: Arc<ControllerState>,
}

impl StreamController {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(ControllerState {
                token: CancellationToken::new(),
                deadline: Instant::now() + timeout,
                timeout,
                outcome: OnceLock::new(),
            }),
        }
    }

    /// Open a producer/consumer pair bound to this controller.
    pub fn session(&self) -> (StreamHandler, StreamReader) {
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let terminal = Arc::new(Mutex::new(None));
        (
            StreamHandler {
                controller: self.clone(),
                tx: Mutex::new(Some(tx)),
                terminal: Arc::clone(&terminal),
            },
            StreamReader {
                controller: self.clone(),
                rx,
                terminal,
                finished: false,
            },
        )
    }

    /// Idempotent. Has no effect on the outcome once the session completed
    /// or already stopped.
    pub fn cancel(&self) {
        if self
            .state
            .outcome
            .set(Outcome::Stopped(StreamError::Cancelled))
            .is_ok()
        {
            tracing::debug!("stream cancelled");
        }
        self.state.token.cancel();
    }

    fn expire(&self) {
        let timeout_ms = self.state.timeout.as_millis() as u64;
        if self
            .state
            .outcome
            .set(Outcome::Stopped(StreamError::DeadlineExceeded { timeout_ms }))
            .is_ok()
        {
            tracing::debug!(timeout_ms, "stream deadline exceeded");
        }
        self.state.token.cancel();
    }

    /// Record completion unless the session already stopped. Returns the
    /// stop reason when it did.
    fn mark_completed(&self) -> Option<StreamError> {
        if let Some(stop) = self.err() {
            return Some(stop);
        }
        let _ = self.state.outcome.set(Outcome::Completed);
        self.err()
    }

    /// Why the session stopped, or `None` while it is live or after it
    /// completed.
    pub fn err(&self) -> Option<StreamError> {
        if self.state.outcome.get().is_none() && Instant::now() >= self.state.deadline {
            self.expire();
        }
        match self.state.outcome.get() {
            Some(Outcome::Stopped(e)) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The producer finalized the session before any stop.
    pub fn is_completed(&self) -> bool {
        matches!(self.state.outcome.get(), Some(Outcome::Completed))
    }

    /// Resolves once the session is cancelled or its deadline passes.
    pub async fn done(&self) {
        tokio::select! {
            _ = self.state.token.cancelled() => {}
            _ = tokio::time::sleep_until(self.state.deadline) => self.expire(),
        }
    }
}

/// Producer side of a session.
pub struct StreamHandler {
    controller: StreamController,
    tx: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    terminal: Arc<Mutex<Option<StreamEvent>>>,
}

impl StreamHandler {
    pub fn controller(&self) -> &StreamController {
        &self.controller
    }

    fn sender(&self) -> Option<mpsc::Sender<StreamEvent>> {
        self.tx.lock().ok().and_then(|guard| guard.clone())
    }

    /// Deliver a non-terminal event. Returns `false` without waiting when
    /// the session is stopped, completed, or the consumer went away.
    pub async fn send_chunk(&self, event: StreamEvent) -> bool {
        if self.controller.is_done() {
            return false;
        }
        let Some(tx) = self.sender() else {
            return false;
        };
        tokio::select! {
            biased;
            _ = self.controller.done() => false,
            sent = tx.send(event) => sent.is_ok(),
        }
    }

    /// Finalize the session. Only the first call has an effect; it returns
    /// whether this call was the one that finalized. A stop recorded before
    /// this call takes precedence over `result`; a later one is ignored.
    ///
    /// Never waits on the consumer: the terminal event is parked beside the
    /// channel and handed out once the buffered chunks are read.
    pub async fn complete(
        &self,
        result: std::result::Result<Option<String>, StreamError>,
    ) -> bool {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(tx) = tx else {
            tracing::debug!("stream already completed");
            return false;
        };

        let terminal = match (self.controller.mark_completed(), result) {
            (Some(stop), _) => StreamEvent::Error(stop),
            (None, Ok(finish_reason)) => StreamEvent::Done { finish_reason },
            (None, Err(e)) => StreamEvent::Error(e),
        };
        if let StreamEvent::Error(e) = &terminal {
            tracing::debug!(error = %e, "stream completed with error");
        }

        if let Ok(mut slot) = self.terminal.lock() {
            *slot = Some(terminal);
        }
        drop(tx);
        true
    }
}

/// Consumer side of a session.
pub struct StreamReader {
    controller: StreamController,
    rx: mpsc::Receiver<StreamEvent>,
    terminal: Arc<Mutex<Option<StreamEvent>>>,
    finished: bool,
}

impl StreamReader {
    pub fn controller(&self) -> &StreamController {
        &self.controller
    }

    /// Next event. After the terminal event this returns `None`.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = loop {
            if self.controller.is_completed() {
                // Completed before any stop: everything buffered is delivered.
                match self.rx.recv().await {
                    Some(event) if event.is_terminal() => break event,
                    Some(event) => return Some(event),
                    None => break self.terminal_event(),
                }
            }
            if self.controller.is_done() {
                // Stopped: buffered chunks are dropped.
                break self.stop_event();
            }
            tokio::select! {
                biased;
                next = self.rx.recv() => match next {
                    Some(event) if event.is_terminal() => break event,
                    Some(_) if self.controller.is_done() => break self.stop_event(),
                    Some(event) => return Some(event),
                    None => break self.terminal_event(),
                },
                _ = self.controller.done() => continue,
            }
        };
        self.finished = true;
        self.rx.close();
        Some(event)
    }

    fn terminal_event(&self) -> StreamEvent {
        let parked = self.terminal.lock().ok().and_then(|mut slot| slot.take());
        parked.unwrap_or_else(|| self.stop_event())
    }

    fn stop_event(&self) -> StreamEvent {
        StreamEvent::Error(self.controller.err().unwrap_or_else(|| StreamError::Transient {
            message: "stream closed before completion".to_string(),
        }))
    }

    /// Drain to the end and collect the final attempt's output.
    pub async fn drain(mut self) -> std::result::Result<StreamOutput, StreamError> {
        let mut output = StreamOutput::default();
        while let Some(event) = self.recv().await {
            match event {
                StreamEvent::Content(text) => output.text.push_str(&text),
                StreamEvent::ToolCalls(calls) => output.tool_calls = calls,
                StreamEvent::Retrying { .. } => {
                    output.text.clear();
                    output.tool_calls.clear();
                }
                StreamEvent::Done { finish_reason } => output.finish_reason = finish_reason,
                StreamEvent::Error(e) => return Err(e),
            }
        }
        Ok(output)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

/// Run one backend call, forwarding content as it arrives. Tool calls are
/// forwarded once the backend signals the end of the stream. Does not
/// complete the session.
pub async fn run_attempt(
    backend: &dyn Backend,
    request: &ChatRequest,
    handler: &StreamHandler,
) -> std::result::Result<Option<String>, StreamError> {
    let controller = handler.controller().clone();
    let stopped = || controller.err().unwrap_or(StreamError::Cancelled);

    let mut events = tokio::select! {
        biased;
        _ = controller.done() => return Err(stopped()),
        opened = backend.stream(request) => opened?,
    };

    let mut tools = ToolCallAccumulator::default();
    let mut finish_reason = None;
    loop {
        let next = tokio::select! {
            biased;
            _ = controller.done() => return Err(stopped()),
            next = events.next() => next,
        };
        let Some(item) = next else { break };
        let event = item?;

        if let Some(message) = event.error {
            return Err(StreamError::Transient { message });
        }
        if let Some(text) = event.content_delta {
            if !handler.send_chunk(StreamEvent::Content(text)).await {
                return Err(stopped());
            }
        }
        for delta in &event.tool_call_deltas {
            tools.push(delta);
        }
        if event.finish_reason.is_some() {
            finish_reason = event.finish_reason;
        }
        if event.done {
            break;
        }
    }

    if !tools.is_empty() && !handler.send_chunk(StreamEvent::ToolCalls(tools.finish())).await {
        return Err(stopped());
    }
    Ok(finish_reason)
}

/// Run one backend call and complete the session with its outcome.
pub async fn stream_once(
    backend: &dyn Backend,
    request: &ChatRequest,
    handler: &StreamHandler,
) -> std::result::Result<Option<String>, StreamError> {
    let outcome = run_attempt(backend, request, handler).await;
    handler.complete(outcome.clone()).await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{request, Attempt, ScriptedBackend};
    use crate::backend::BackendEvent;

    fn delta(index: usize, id: Option<&str>, name: Option<&str>, args: &str) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            arguments: args.to_string(),
        }
    }

    #[tokio::test]
    async fn test_cancelled_controller_is_done_immediately() {
        let controller = StreamController::new(Duration::from_secs(60));
        assert!(!controller.is_done());
        assert!(controller.err().is_none());

        controller.cancel();
        controller.cancel();
        tokio::time::timeout(Duration::from_millis(50), controller.done())
            .await
            .expect("done should resolve at once");
        assert_eq!(controller.err(), Some(StreamError::Cancelled));
    }

    #[tokio::test]
    async fn test_deadline_distinct_from_cancel() {
        let controller = StreamController::new(Duration::from_millis(20));
        controller.done().await;
        assert_eq!(
            controller.err(),
            Some(StreamError::DeadlineExceeded { timeout_ms: 20 })
        );
        // A later cancel does not rewrite the reason.
        controller.cancel();
        assert!(matches!(
            controller.err(),
            Some(StreamError::DeadlineExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_chunks_then_single_terminal() {
        let controller = StreamController::new(Duration::from_secs(5));
        let (handler, mut reader) = controller.session();

        assert!(handler.send_chunk(StreamEvent::Content("Hel".into())).await);
        assert!(handler.send_chunk(StreamEvent::Content("lo".into())).await);
        assert!(handler.complete(Ok(Some("stop".into()))).await);
        assert!(!handler.complete(Err(StreamError::Cancelled)).await);

        assert_eq!(reader.recv().await, Some(StreamEvent::Content("Hel".into())));
        assert_eq!(reader.recv().await, Some(StreamEvent::Content("lo".into())));
        assert_eq!(
            reader.recv().await,
            Some(StreamEvent::Done {
                finish_reason: Some("stop".into())
            })
        );
        assert_eq!(reader.recv().await, None);
        assert_eq!(reader.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_after_cancel_is_noop() {
        let controller = StreamController::new(Duration::from_secs(5));
        let (handler, mut reader) = controller.session();
        controller.cancel();

        let sent = tokio::time::timeout(
            Duration::from_millis(50),
            handler.send_chunk(StreamEvent::Content("late".into())),
        )
        .await
        .expect("send must not block");
        assert!(!sent);

        assert_eq!(
            reader.recv().await,
            Some(StreamEvent::Error(StreamError::Cancelled))
        );
        assert_eq!(reader.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_does_not_block_on_full_buffer_after_cancel() {
        let controller = StreamController::new(Duration::from_secs(5));
        let (handler, _reader) = controller.session();
        for i in 0..CHUNK_BUFFER {
            assert!(handler.send_chunk(StreamEvent::Content(i.to_string())).await);
        }
        let c = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c.cancel();
        });
        let sent = tokio::time::timeout(
            Duration::from_secs(1),
            handler.send_chunk(StreamEvent::Content("blocked".into())),
        )
        .await
        .expect("cancel must release a blocked send");
        assert!(!sent);
    }

    #[tokio::test]
    async fn test_reader_terminal_when_producer_dropped() {
        let controller = StreamController::new(Duration::from_secs(5));
        let (handler, mut reader) = controller.session();
        drop(handler);
        assert!(matches!(
            reader.recv().await,
            Some(StreamEvent::Error(StreamError::Transient { .. }))
        ));
        assert_eq!(reader.recv().await, None);
    }

    #[tokio::test]
    async fn test_completion_survives_later_deadline() {
        let controller = StreamController::new(Duration::from_millis(30));
        let (handler, mut reader) = controller.session();

        assert!(handler.send_chunk(StreamEvent::Content("answer".into())).await);
        assert!(handler.complete(Ok(Some("stop".into()))).await);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(controller.is_completed());
        assert!(controller.err().is_none());
        assert_eq!(
            reader.recv().await,
            Some(StreamEvent::Content("answer".into()))
        );
        assert_eq!(
            reader.recv().await,
            Some(StreamEvent::Done {
                finish_reason: Some("stop".into())
            })
        );
        assert_eq!(reader.recv().await, None);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_keeps_output() {
        let controller = StreamController::new(Duration::from_secs(5));
        let (handler, reader) = controller.session();

        assert!(handler.send_chunk(StreamEvent::Content("Hel".into())).await);
        assert!(handler.send_chunk(StreamEvent::Content("lo".into())).await);
        assert!(handler.complete(Ok(Some("stop".into()))).await);
        controller.cancel();

        let output = reader.drain().await.unwrap();
        assert_eq!(output.text, "Hello");
        assert_eq!(output.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_complete_after_cancel_reports_cancel() {
        let controller = StreamController::new(Duration::from_secs(5));
        let (handler, mut reader) = controller.session();

        assert!(handler.send_chunk(StreamEvent::Content("partial".into())).await);
        controller.cancel();
        assert!(handler.complete(Ok(Some("stop".into()))).await);

        assert!(!controller.is_completed());
        assert_eq!(
            reader.recv().await,
            Some(StreamEvent::Error(StreamError::Cancelled))
        );
        assert_eq!(reader.recv().await, None);
    }

    #[tokio::test]
    async fn test_complete_does_not_wait_on_full_buffer() {
        let controller = StreamController::new(Duration::from_secs(5));
        let (handler, reader) = controller.session();
        for i in 0..CHUNK_BUFFER {
            assert!(handler.send_chunk(StreamEvent::Content(i.to_string())).await);
        }
        tokio::time::timeout(Duration::from_millis(50), handler.complete(Ok(None)))
            .await
            .expect("complete must not block");

        let output = reader.drain().await.unwrap();
        assert!(output.text.starts_with("0123"));
        assert!(output.text.ends_with(&(CHUNK_BUFFER - 1).to_string()));
    }

    #[test]
    fn test_accumulator_keys_by_index() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(&delta(1, Some("call_b"), Some("lookup"), "{\"q\":"));
        acc.push(&delta(0, Some("call_a"), Some("search"), "{\"t\":"));
        acc.push(&delta(1, None, None, "\"hero\"}"));
        acc.push(&delta(0, None, None, "\"storm\"}"));

        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments, "{\"t\":\"storm\"}");
        assert_eq!(calls[1].id, "call_b");
        assert_eq!(calls[1].arguments, "{\"q\":\"hero\"}");
    }

    #[tokio::test]
    async fn test_stream_once_forwards_content_and_tools() {
        let tool_event = BackendEvent {
            tool_call_deltas: vec![delta(0, Some("call_a"), Some("search"), "{}")],
            finish_reason: Some("tool_calls".into()),
            ..BackendEvent::default()
        };
        let backend = ScriptedBackend::new(vec![Attempt::Events(vec![
            Ok(BackendEvent::content("Hi ")),
            Ok(BackendEvent::content("there")),
            Ok(tool_event),
            Ok(BackendEvent::done()),
        ])]);
        let controller = StreamController::new(Duration::from_secs(5));
        let (handler, reader) = controller.session();

        let req = request();
        let (outcome, output) = tokio::join!(stream_once(&backend, &req, &handler), reader.drain());
        assert_eq!(outcome, Ok(Some("tool_calls".into())));
        let output = output.unwrap();
        assert_eq!(output.text, "Hi there");
        assert_eq!(output.tool_calls.len(), 1);
        assert_eq!(output.tool_calls[0].name, "search");
        assert_eq!(output.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[tokio::test]
    async fn test_stream_once_deadline_on_hung_backend() {
        let backend = ScriptedBackend::new(vec![Attempt::Hang]);
        let controller = StreamController::new(Duration::from_millis(30));
        let (handler, reader) = controller.session();

        let req = request();
        let (outcome, output) = tokio::join!(stream_once(&backend, &req, &handler), reader.drain());
        assert_eq!(
            outcome,
            Err(StreamError::DeadlineExceeded { timeout_ms: 30 })
        );
        assert_eq!(
            output,
            Err(StreamError::DeadlineExceeded { timeout_ms: 30 })
        );
    }
}
