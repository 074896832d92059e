//! Mock engine implementation for testing.
//!
//! Returns scripted behaviours in sequence, cycling through them, without
//! launching any subprocess. Registered in real processes only when the
//! mock-engine env flag is set; in tests it is the backbone of the engine
//! and workflow suites.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_stream::stream;
use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::monitor::AgentTelemetry;

use super::{Engine, EngineStream, RunChunk, RunOptions, RunResult};

/// One scripted behaviour of a [`MockEngine`] run.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Stream `text` as data, then succeed with it as stdout.
    Respond {
        /// The response text.
        text: String,
        /// Telemetry to stream before the result, when present.
        telemetry: Option<AgentTelemetry>,
    },
    /// Report quota exhaustion with a retry hint.
    RateLimit {
        /// Seconds until the pretend quota resets.
        retry_after_secs: u64,
    },
    /// Fail synchronously from `run` itself.
    Fail {
        /// Error detail.
        message: String,
    },
    /// Stream `partial` then stay silent until cancelled; the stream ends
    /// without a result.
    Hang {
        /// Data streamed before hanging.
        partial: String,
    },
}

/// A scripted engine for tests.
///
/// Behaviours are served in order, cycling. Prompts and auth probes are
/// recorded for assertions.
#[derive(Debug)]
pub struct MockEngine {
    id: String,
    name: String,
    order: u32,
    default_model: String,
    behaviors: Vec<MockBehavior>,
    cursor: AtomicUsize,
    authenticated: AtomicBool,
    auth_probes: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockEngine {
    /// A mock cycling through `behaviors`.
    #[must_use]
    pub fn new(id: impl Into<String>, behaviors: Vec<MockBehavior>) -> Self {
        let id = id.into();
        Self {
            name: format!("Mock ({id})"),
            id,
            order: 100,
            default_model: "mock-model".to_string(),
            behaviors,
            cursor: AtomicUsize::new(0),
            authenticated: AtomicBool::new(true),
            auth_probes: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A mock that always succeeds with `text`.
    #[must_use]
    pub fn responding(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            id,
            vec![MockBehavior::Respond {
                text: text.into(),
                telemetry: None,
            }],
        )
    }

    /// A mock that always reports a rate limit.
    #[must_use]
    pub fn rate_limited(id: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::new(id, vec![MockBehavior::RateLimit { retry_after_secs }])
    }

    /// Sets the display order.
    #[must_use]
    pub const fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    /// Sets the initial auth state.
    #[must_use]
    pub fn with_authenticated(self, authenticated: bool) -> Self {
        self.authenticated.store(authenticated, Ordering::SeqCst);
        self
    }

    /// Prompts received so far, in arrival order.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// How many times `is_authenticated` was probed.
    #[must_use]
    pub fn auth_probes(&self) -> usize {
        self.auth_probes.load(Ordering::SeqCst)
    }

    /// How many runs were launched.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> MockBehavior {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.behaviors
            .get(index % self.behaviors.len().max(1))
            .cloned()
            .unwrap_or(MockBehavior::Respond {
                text: String::new(),
                telemetry: None,
            })
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> u32 {
        self.order
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn is_authenticated(&self) -> Result<bool> {
        self.auth_probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.authenticated.load(Ordering::SeqCst))
    }

    async fn ensure_auth(&self) -> Result<()> {
        self.authenticated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_auth(&self) -> Result<()> {
        self.authenticated.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn run(&self, options: RunOptions) -> Result<EngineStream> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(options.prompt.clone());

        match self.next_behavior() {
            MockBehavior::Respond { text, telemetry } => Ok(Box::pin(stream! {
                yield RunChunk::Data(text.clone());
                if let Some(t) = telemetry {
                    yield RunChunk::Telemetry(t);
                }
                yield RunChunk::Result(RunResult::ok(text));
            })),
            MockBehavior::RateLimit { retry_after_secs } => Ok(Box::pin(stream! {
                yield RunChunk::Result(RunResult::rate_limited(Some(retry_after_secs)));
            })),
            MockBehavior::Fail { message } => Err(EngineError::ExecutionFailed {
                engine: self.id.clone(),
                message,
            }
            .into()),
            MockBehavior::Hang { partial } => {
                let cancel = options.cancel.clone();
                Ok(Box::pin(stream! {
                    yield RunChunk::Data(partial);
                    cancel.cancelled().await;
                    // cancelled before completion: no result chunk
                }))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn drain(mut stream: EngineStream) -> Vec<RunChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn respond_streams_data_then_result() {
        let mock = MockEngine::responding("m", "OK");
        let chunks = drain(mock.run(RunOptions::new("hi")).await.unwrap()).await;

        assert!(matches!(&chunks[0], RunChunk::Data(t) if t == "OK"));
        match chunks.last().unwrap() {
            RunChunk::Result(r) => {
                assert_eq!(r.stdout, "OK");
                assert!(!r.is_rate_limit_error);
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn behaviors_cycle() {
        let mock = MockEngine::new(
            "m",
            vec![
                MockBehavior::Respond {
                    text: "first".into(),
                    telemetry: None,
                },
                MockBehavior::RateLimit {
                    retry_after_secs: 30,
                },
            ],
        );

        let first = drain(mock.run(RunOptions::new("a")).await.unwrap()).await;
        assert!(matches!(
            first.last().unwrap(),
            RunChunk::Result(r) if !r.is_rate_limit_error
        ));

        let second = drain(mock.run(RunOptions::new("b")).await.unwrap()).await;
        assert!(matches!(
            second.last().unwrap(),
            RunChunk::Result(r) if r.is_rate_limit_error && r.retry_after_seconds == Some(30)
        ));

        // third wraps around
        let third = drain(mock.run(RunOptions::new("c")).await.unwrap()).await;
        assert!(matches!(
            third.last().unwrap(),
            RunChunk::Result(r) if r.stdout == "first"
        ));
    }

    #[tokio::test]
    async fn fail_is_synchronous() {
        let mock = MockEngine::new(
            "m",
            vec![MockBehavior::Fail {
                message: "boom".into(),
            }],
        );
        let err = match mock.run(RunOptions::new("x")).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.code(), "engine.execution_failed");
    }

    #[tokio::test]
    async fn hang_ends_without_result_on_cancel() {
        let mock = MockEngine::new(
            "m",
            vec![MockBehavior::Hang {
                partial: "partial output".into(),
            }],
        );
        let options = RunOptions::new("x");
        let cancel = options.cancel.clone();
        let mut stream = mock.run(options).await.unwrap();

        let first = stream.next().await.unwrap();
        assert!(matches!(first, RunChunk::Data(t) if t == "partial output"));

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn prompts_are_recorded() {
        let mock = MockEngine::responding("m", "OK");
        let _ = mock.run(RunOptions::new("one")).await.unwrap();
        let _ = mock.run(RunOptions::new("two")).await.unwrap();
        assert_eq!(mock.prompts(), vec!["one", "two"]);
    }
}
