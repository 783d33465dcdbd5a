//! Bounded retry over streaming calls.

use std::time::Duration;

use crate::backend::{Backend, ChatRequest};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::stream::{run_attempt, StreamEvent, StreamHandler};

/// Fixed-delay retry policy with an attempt counter.
///
/// Cancellation and deadline errors are never retried and leave the
/// counter alone. Every other error counts as an attempt, including the
/// one that finally exhausts the policy.
#[derive(Debug, Clone)]
pub struct RetryableStream {
    max_attempts: u32,
    delay: Duration,
    attempts: u32,
}

impl RetryableStream {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            attempts: 0,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            config.retry_attempts,
            Duration::from_millis(config.retry_delay_ms),
        )
    }

    pub fn should_retry(&mut self, err: Option<&StreamError>) -> bool {
        let Some(err) = err else {
            return false;
        };
        if err.is_terminal() {
            return false;
        }
        let retry = self.attempts < self.max_attempts;
        self.attempts += 1;
        retry
    }

    pub async fn wait_for_retry(&self) {
        tokio::time::sleep(self.delay).await;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Run `request` against `backend`, retrying per `policy`, and complete
/// the session with the final outcome. The consumer sees a
/// [`StreamEvent::Retrying`] before each new attempt.
pub async fn stream_with_retry(
    backend: &dyn Backend,
    request: &ChatRequest,
    handler: &StreamHandler,
    policy: &mut RetryableStream,
) -> Result<Option<String>, StreamError> {
    loop {
        let err = match run_attempt(backend, request, handler).await {
            Ok(finish_reason) => {
                handler.complete(Ok(finish_reason.clone())).await;
                return Ok(finish_reason);
            }
            Err(err) => err,
        };

        if !policy.should_retry(Some(&err)) {
            tracing::warn!(attempts = policy.attempts(), error = %err, "stream failed");
            handler.complete(Err(err.clone())).await;
            return Err(err);
        }

        tracing::warn!(
            attempt = policy.attempts(),
            max = policy.max_attempts(),
            delay_ms = policy.delay.as_millis() as u64,
            error = %err,
            "retrying stream after error"
        );
        handler
            .send_chunk(StreamEvent::Retrying {
                attempt: policy.attempts(),
                error: err,
            })
            .await;

        let controller = handler.controller();
        tokio::select! {
            _ = policy.wait_for_retry() => {}
            _ = controller.done() => {}
        }
        if let Some(stop) = controller.err() {
            handler.complete(Err(stop.clone())).await;
            return Err(stop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{request, Attempt, ScriptedBackend};
    use crate::backend::BackendEvent;
    use crate::stream::StreamController;
    use std::time::Instant;

    fn transient() -> StreamError {
        StreamError::Transient {
            message: "connection reset".into(),
        }
    }

    #[test]
    fn test_should_retry_counts_to_exhaustion() {
        let mut policy = RetryableStream::new(3, Duration::from_millis(1));
        let err = transient();
        let answers: Vec<bool> = (0..4).map(|_| policy.should_retry(Some(&err))).collect();
        assert_eq!(answers, vec![true, true, true, false]);
        assert_eq!(policy.attempts(), 4);
    }

    #[test]
    fn test_terminal_errors_not_retried() {
        let mut policy = RetryableStream::new(3, Duration::from_millis(1));
        assert!(!policy.should_retry(Some(&StreamError::Cancelled)));
        assert_eq!(policy.attempts(), 0);
        assert!(!policy.should_retry(Some(&StreamError::DeadlineExceeded { timeout_ms: 5 })));
        assert_eq!(policy.attempts(), 0);
    }

    #[test]
    fn test_success_not_counted_and_reset() {
        let mut policy = RetryableStream::new(2, Duration::from_millis(1));
        assert!(!policy.should_retry(None));
        assert_eq!(policy.attempts(), 0);

        let backend_err = StreamError::Backend {
            status: 400,
            message: "bad request".into(),
        };
        assert!(policy.should_retry(Some(&backend_err)));
        policy.reset();
        assert_eq!(policy.attempts(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_retry_sleeps_delay() {
        let policy = RetryableStream::new(1, Duration::from_millis(25));
        let start = Instant::now();
        policy.wait_for_retry().await;
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        let backend = ScriptedBackend::new(vec![
            Attempt::Events(vec![Ok(BackendEvent::content("par")), Err(transient())]),
            Attempt::Refuse(transient()),
            Attempt::Events(vec![
                Ok(BackendEvent::content("Hello")),
                Ok(BackendEvent::done()),
            ]),
        ]);
        let controller = StreamController::new(Duration::from_secs(5));
        let (handler, reader) = controller.session();
        let mut policy = RetryableStream::new(3, Duration::from_millis(1));

        let req = request();
        let (outcome, output) = tokio::join!(
            stream_with_retry(&backend, &req, &handler, &mut policy),
            reader.drain()
        );
        assert_eq!(outcome, Ok(None));
        assert_eq!(output.unwrap().text, "Hello");
        assert_eq!(policy.attempts(), 2);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_last_error() {
        let backend = ScriptedBackend::new(vec![
            Attempt::Refuse(transient()),
            Attempt::Refuse(transient()),
            Attempt::Refuse(transient()),
        ]);
        let controller = StreamController::new(Duration::from_secs(5));
        let (handler, reader) = controller.session();
        let mut policy = RetryableStream::new(2, Duration::from_millis(1));

        let req = request();
        let (outcome, output) = tokio::join!(
            stream_with_retry(&backend, &req, &handler, &mut policy),
            reader.drain()
        );
        assert_eq!(outcome, Err(transient()));
        assert_eq!(output, Err(transient()));
        assert_eq!(backend.calls(), 3);
        assert_eq!(policy.attempts(), 3);
    }

    #[tokio::test]
    async fn test_cancel_is_never_retried() {
        let backend = ScriptedBackend::new(vec![Attempt::Hang, Attempt::Hang]);
        let controller = StreamController::new(Duration::from_secs(5));
        let (handler, reader) = controller.session();
        let mut policy = RetryableStream::new(3, Duration::from_millis(1));

        let canceller = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let req = request();
        let (outcome, output) = tokio::join!(
            stream_with_retry(&backend, &req, &handler, &mut policy),
            reader.drain()
        );
        assert_eq!(outcome, Err(StreamError::Cancelled));
        assert_eq!(output, Err(StreamError::Cancelled));
        assert_eq!(policy.attempts(), 0);
        assert_eq!(backend.calls(), 1);
    }
}
