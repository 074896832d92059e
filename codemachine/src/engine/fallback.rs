//! Cross-engine fallback.
//!
//! [`FallbackRunner`] serves one prompt by trying the primary engine, then
//! its configured chain, then any other registered engine in display
//! order — skipping engines that are rate-limited or unauthenticated,
//! recording fresh rate limits as it discovers them, and announcing each
//! switch to the caller's observer.
//!
//! Exactly one engine runs at a time per call; attempts are strictly
//! sequential. Chunks from a failed attempt are still forwarded to the
//! observer (they aid debugging), but the caller receives one canonical
//! [`RunResult`]: the final one.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Error, Result, WorkflowError, is_rate_limit_marker};

use super::rate_limit::RateLimitManager;
use super::registry::EngineRegistry;
use super::{EngineStream, RunChunk, RunObserver, RunOptions, RunResult};

/// Input to one fallback run.
#[derive(Debug, Clone)]
pub struct FallbackRequest {
    /// Engine tried first.
    pub primary_engine: String,
    /// Options forwarded to each attempt.
    pub run_options: RunOptions,
    /// Engines tried after the primary, in order.
    pub chain: Vec<String>,
    /// Upper bound on run invocations; defaults to the candidate count.
    pub max_attempts: Option<usize>,
    /// Engines never attempted.
    pub exclude_engines: Vec<String>,
}

impl FallbackRequest {
    /// A request for `primary_engine` with `run_options` and no chain.
    #[must_use]
    pub fn new(primary_engine: impl Into<String>, run_options: RunOptions) -> Self {
        Self {
            primary_engine: primary_engine.into(),
            run_options,
            chain: Vec::new(),
            max_attempts: None,
            exclude_engines: Vec::new(),
        }
    }

    /// Sets the fallback chain.
    #[must_use]
    pub fn with_chain(mut self, chain: Vec<String>) -> Self {
        self.chain = chain;
        self
    }

    /// Sets the attempt bound.
    #[must_use]
    pub const fn with_max_attempts(mut self, max: usize) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Sets the exclusion set.
    #[must_use]
    pub fn with_excluded(mut self, exclude: Vec<String>) -> Self {
        self.exclude_engines = exclude;
        self
    }
}

/// Outcome of a fallback run.
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    /// The canonical result (the final attempt's).
    pub result: RunResult,
    /// The engine that produced [`FallbackOutcome::result`].
    pub engine_used: String,
    /// Whether the serving engine differs from the primary (on success),
    /// or whether any switch occurred (on exhaustion).
    pub fell_back: bool,
    /// Engines found rate-limited along the way.
    pub rate_limited_engines: Vec<String>,
}

impl FallbackOutcome {
    /// Whether every candidate was exhausted by rate limits.
    #[must_use]
    pub fn is_rate_limit_exhaustion(&self) -> bool {
        self.result.is_rate_limit_error
    }
}

/// Serves prompts with transparent cross-engine failover.
#[derive(Debug, Clone)]
pub struct FallbackRunner {
    registry: Arc<EngineRegistry>,
    rate_limits: Arc<RateLimitManager>,
}

impl FallbackRunner {
    /// A runner over `registry`, consulting `rate_limits` before and after
    /// every attempt.
    #[must_use]
    pub fn new(registry: Arc<EngineRegistry>, rate_limits: Arc<RateLimitManager>) -> Self {
        Self {
            registry,
            rate_limits,
        }
    }

    /// The rate-limit manager this runner records into.
    #[must_use]
    pub fn rate_limits(&self) -> &Arc<RateLimitManager> {
        &self.rate_limits
    }

    /// The engine registry this runner draws candidates from.
    #[must_use]
    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Runs `request`, failing over until an engine succeeds or every
    /// candidate is exhausted.
    ///
    /// Rate-limit failures (streamed or thrown) are absorbed: the engine is
    /// recorded into the rate-limit manager and the next candidate is
    /// tried. Any other failure propagates. On exhaustion the outcome
    /// carries the last result with `stderr` explaining that no engine is
    /// available — the caller decides whether to wait.
    pub async fn run(
        &self,
        request: FallbackRequest,
        observer: &dyn RunObserver,
    ) -> Result<FallbackOutcome> {
        let candidates = self.candidates(&request);
        if candidates.is_empty() {
            return Err(EngineError::NoneRegistered.into());
        }

        let max_attempts = request.max_attempts.unwrap_or(candidates.len());
        let mut rate_limited_engines: Vec<String> = Vec::new();
        let mut last_result: Option<RunResult> = None;
        let mut last_engine: Option<String> = None;
        let mut switch_from: Option<String> = None;
        let mut switched = false;
        let mut attempts = 0usize;

        for candidate in &candidates {
            if attempts >= max_attempts {
                break;
            }
            if !self.rate_limits.is_engine_available(candidate).await {
                debug!(engine = %candidate, "skipping rate-limited engine");
                if !rate_limited_engines.contains(candidate) {
                    rate_limited_engines.push(candidate.clone());
                }
                continue;
            }
            match self.registry.is_authenticated(candidate).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(engine = %candidate, "skipping unauthenticated engine");
                    continue;
                }
                Err(e) => {
                    warn!(engine = %candidate, error = %e, "auth probe failed, skipping engine");
                    continue;
                }
            }

            if let Some(from) = switch_from.take() {
                info!(from = %from, to = %candidate, "falling back to next engine");
                observer.on_engine_switch(&from, candidate);
                switched = true;
            }

            attempts += 1;
            last_engine = Some(candidate.clone());

            // Each attempt gets its own child token so a timeout can end
            // this attempt without cancelling the workflow.
            let attempt_options = {
                let mut opts = request.run_options.clone();
                opts.cancel = request.run_options.cancel.child_token();
                opts
            };

            let engine = self.registry.get(candidate)?;
            let stream = match engine.run(attempt_options.clone()).await {
                Ok(stream) => stream,
                Err(e) if matches_rate_limit(&e) => {
                    self.absorb_rate_limit(candidate, &e, &mut rate_limited_engines)
                        .await?;
                    switch_from = Some(candidate.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            let drained = drain(stream, &attempt_options, observer).await;
            let result = match drained {
                Some(result) => result,
                None => {
                    if request.run_options.cancel.is_cancelled() {
                        return Err(WorkflowError::Aborted("run cancelled".to_string()).into());
                    }
                    if let Some(timeout) = attempt_options.timeout {
                        return Err(EngineError::Timeout {
                            engine: candidate.clone(),
                            timeout_ms: timeout.as_millis() as u64,
                        }
                        .into());
                    }
                    return Err(EngineError::ExecutionFailed {
                        engine: candidate.clone(),
                        message: "stream ended without a result".to_string(),
                    }
                    .into());
                }
            };

            if result.is_rate_limit_error {
                if !rate_limited_engines.contains(candidate) {
                    rate_limited_engines.push(candidate.clone());
                }
                self.rate_limits
                    .mark_rate_limited(
                        candidate,
                        result.rate_limit_resets_at,
                        result.retry_after_seconds,
                    )
                    .await?;
                switch_from = Some(candidate.clone());
                last_result = Some(result);
                continue;
            }

            return Ok(FallbackOutcome {
                result,
                engine_used: candidate.clone(),
                fell_back: *candidate != request.primary_engine,
                rate_limited_engines,
            });
        }

        let mut result = last_result.unwrap_or_default();
        if !result.stderr.is_empty() {
            result.stderr.push('\n');
        }
        result.stderr.push_str(&format!(
            "no engine available (tried {} of {} candidates)",
            attempts,
            candidates.len()
        ));
        Ok(FallbackOutcome {
            result,
            engine_used: last_engine.unwrap_or(request.primary_engine),
            fell_back: switched,
            rate_limited_engines,
        })
    }

    /// `[primary, ...chain, ...rest-by-order]`, de-duplicated in that
    /// order, minus exclusions.
    fn candidates(&self, request: &FallbackRequest) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |id: &str| {
            if !out.iter().any(|seen| seen == id) && !request.exclude_engines.iter().any(|e| e == id)
            {
                out.push(id.to_string());
            }
        };

        push(&request.primary_engine);
        for id in &request.chain {
            push(id);
        }
        for engine in self.registry.all() {
            push(engine.id());
        }

        // The primary lands in the list even when unregistered; drop it so
        // attempts only touch real engines.
        out.retain(|id| self.registry.contains(id));
        out
    }

    async fn absorb_rate_limit(
        &self,
        engine_id: &str,
        error: &Error,
        rate_limited: &mut Vec<String>,
    ) -> Result<()> {
        if !rate_limited.iter().any(|e| e == engine_id) {
            rate_limited.push(engine_id.to_string());
        }
        let retry_after = match error {
            Error::Engine(EngineError::RateLimited {
                retry_after_secs, ..
            }) => *retry_after_secs,
            _ => None,
        };
        self.rate_limits
            .mark_rate_limited(engine_id, None, retry_after)
            .await?;
        Ok(())
    }
}

/// Whether `error` signals quota exhaustion, either as a typed rate-limit
/// error or through a recognisable marker in its text.
fn matches_rate_limit(error: &Error) -> bool {
    matches!(error, Error::Engine(EngineError::RateLimited { .. }))
        || is_rate_limit_marker(&error.to_string())
}

/// Drains `stream`, forwarding chunks to `observer`, until the terminal
/// result arrives or the timeout elapses. Returns `None` when the stream
/// ends (or is timed out) without a result.
async fn drain(
    mut stream: EngineStream,
    options: &RunOptions,
    observer: &dyn RunObserver,
) -> Option<RunResult> {
    let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);

    loop {
        let next = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        // Timed out: cancel this attempt's producer so any
                        // subprocess dies, then stop consuming.
                        options.cancel.cancel();
                        return None;
                    }
                }
            }
            None => stream.next().await,
        };

        match next {
            Some(RunChunk::Data(text)) => observer.on_data(&text),
            Some(RunChunk::ErrorData(text)) => observer.on_error_data(&text),
            Some(RunChunk::Telemetry(t)) => observer.on_telemetry(&t),
            Some(RunChunk::Result(result)) => return Some(result),
            None => return None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::engine::{Engine, MockBehavior, MockEngine, NoopObserver};
    use std::sync::Mutex;

    struct Harness {
        runner: FallbackRunner,
    }

    async fn harness(engines: Vec<Arc<dyn Engine>>) -> (Harness, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = EngineRegistry::builder();
        for e in engines {
            builder = builder.register(e);
        }
        let registry = Arc::new(builder.build());
        let rate_limits = Arc::new(
            RateLimitManager::initialize(dir.path().join("rate-limits.json"))
                .await
                .unwrap(),
        );
        (
            Harness {
                runner: FallbackRunner::new(registry, rate_limits),
            },
            dir,
        )
    }

    /// Observer capturing engine switches.
    #[derive(Default)]
    struct SwitchRecorder {
        switches: Mutex<Vec<(String, String)>>,
    }

    impl RunObserver for SwitchRecorder {
        fn on_engine_switch(&self, from: &str, to: &str) {
            self.switches
                .lock()
                .unwrap()
                .push((from.to_string(), to.to_string()));
        }
    }

    #[tokio::test]
    async fn single_primary_succeeds() {
        let mock: Arc<dyn Engine> = Arc::new(MockEngine::responding("mock", "OK"));
        let (h, _dir) = harness(vec![mock]).await;

        let outcome = h
            .runner
            .run(
                FallbackRequest::new("mock", RunOptions::new("hello")),
                &NoopObserver,
            )
            .await
            .unwrap();

        assert_eq!(outcome.engine_used, "mock");
        assert!(!outcome.fell_back);
        assert_eq!(outcome.result.stdout, "OK");
        assert!(outcome.rate_limited_engines.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_triggers_fallback() {
        let m1: Arc<dyn Engine> = Arc::new(MockEngine::rate_limited("m1", 60).with_order(1));
        let m2: Arc<dyn Engine> = Arc::new(MockEngine::responding("m2", "OK").with_order(2));
        let (h, _dir) = harness(vec![m1, m2]).await;

        let recorder = SwitchRecorder::default();
        let outcome = h
            .runner
            .run(FallbackRequest::new("m1", RunOptions::new("go")), &recorder)
            .await
            .unwrap();

        assert_eq!(outcome.engine_used, "m2");
        assert!(outcome.fell_back);
        assert_eq!(outcome.result.stdout, "OK");
        assert_eq!(outcome.rate_limited_engines, vec!["m1"]);

        assert!(!h.runner.rate_limits().is_engine_available("m1").await);
        let wait = h.runner.rate_limits().time_until_available("m1").await;
        assert!((50..=60).contains(&wait), "wait {wait} out of range");

        assert_eq!(
            *recorder.switches.lock().unwrap(),
            vec![("m1".to_string(), "m2".to_string())]
        );
    }

    #[tokio::test]
    async fn synchronous_rate_limit_marker_also_falls_back() {
        let m1: Arc<dyn Engine> = Arc::new(
            MockEngine::new(
                "m1",
                vec![MockBehavior::Fail {
                    message: "HTTP 429: quota exceeded".into(),
                }],
            )
            .with_order(1),
        );
        let m2: Arc<dyn Engine> = Arc::new(MockEngine::responding("m2", "OK").with_order(2));
        let (h, _dir) = harness(vec![m1, m2]).await;

        let outcome = h
            .runner
            .run(
                FallbackRequest::new("m1", RunOptions::new("go")),
                &NoopObserver,
            )
            .await
            .unwrap();

        assert_eq!(outcome.engine_used, "m2");
        assert_eq!(outcome.rate_limited_engines, vec!["m1"]);
    }

    #[tokio::test]
    async fn non_rate_limit_failure_propagates() {
        let m1: Arc<dyn Engine> = Arc::new(MockEngine::new(
            "m1",
            vec![MockBehavior::Fail {
                message: "segfault".into(),
            }],
        ));
        let m2: Arc<dyn Engine> = Arc::new(MockEngine::responding("m2", "OK"));
        let (h, _dir) = harness(vec![m1, m2]).await;

        let err = h
            .runner
            .run(
                FallbackRequest::new("m1", RunOptions::new("go")),
                &NoopObserver,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "engine.execution_failed");
    }

    #[tokio::test]
    async fn excluded_engines_are_never_used() {
        let m1: Arc<dyn Engine> = Arc::new(MockEngine::rate_limited("m1", 60).with_order(1));
        let m2: Arc<dyn Engine> = Arc::new(MockEngine::responding("m2", "from-m2").with_order(2));
        let m3: Arc<dyn Engine> = Arc::new(MockEngine::responding("m3", "from-m3").with_order(3));
        let (h, _dir) = harness(vec![m1, m2, m3]).await;

        let outcome = h
            .runner
            .run(
                FallbackRequest::new("m1", RunOptions::new("go"))
                    .with_excluded(vec!["m2".to_string()]),
                &NoopObserver,
            )
            .await
            .unwrap();

        assert_eq!(outcome.engine_used, "m3");
        assert_ne!(outcome.engine_used, "m2");
    }

    #[tokio::test]
    async fn unauthenticated_engines_are_skipped() {
        let m1: Arc<dyn Engine> =
            Arc::new(MockEngine::responding("m1", "nope").with_authenticated(false));
        let m2: Arc<dyn Engine> = Arc::new(MockEngine::responding("m2", "OK").with_order(2));
        let (h, _dir) = harness(vec![m1, m2]).await;

        let outcome = h
            .runner
            .run(
                FallbackRequest::new("m1", RunOptions::new("go")),
                &NoopObserver,
            )
            .await
            .unwrap();
        assert_eq!(outcome.engine_used, "m2");
    }

    #[tokio::test]
    async fn chain_order_is_respected_over_registry_order() {
        let m1: Arc<dyn Engine> = Arc::new(MockEngine::rate_limited("m1", 60).with_order(1));
        // m2 sorts before m3 by order, but the chain says m3 first.
        let m2: Arc<dyn Engine> = Arc::new(MockEngine::responding("m2", "from-m2").with_order(2));
        let m3: Arc<dyn Engine> = Arc::new(MockEngine::responding("m3", "from-m3").with_order(3));
        let (h, _dir) = harness(vec![m1, m2, m3]).await;

        let outcome = h
            .runner
            .run(
                FallbackRequest::new("m1", RunOptions::new("go"))
                    .with_chain(vec!["m3".to_string()]),
                &NoopObserver,
            )
            .await
            .unwrap();
        assert_eq!(outcome.engine_used, "m3");
    }

    #[tokio::test]
    async fn exhaustion_returns_rate_limited_outcome() {
        let m1: Arc<dyn Engine> = Arc::new(MockEngine::rate_limited("m1", 60).with_order(1));
        let m2: Arc<dyn Engine> = Arc::new(MockEngine::rate_limited("m2", 30).with_order(2));
        let (h, _dir) = harness(vec![m1, m2]).await;

        let outcome = h
            .runner
            .run(
                FallbackRequest::new("m1", RunOptions::new("go")),
                &NoopObserver,
            )
            .await
            .unwrap();

        assert!(outcome.is_rate_limit_exhaustion());
        assert!(outcome.result.stderr.contains("no engine available"));
        assert_eq!(outcome.rate_limited_engines, vec!["m1", "m2"]);
        assert!(outcome.fell_back);
    }

    #[tokio::test]
    async fn unregistered_primary_falls_through_to_registered_engines() {
        let m2: Arc<dyn Engine> = Arc::new(MockEngine::responding("m2", "OK"));
        let (h, _dir) = harness(vec![m2]).await;

        let outcome = h
            .runner
            .run(
                FallbackRequest::new("ghost", RunOptions::new("go")),
                &NoopObserver,
            )
            .await
            .unwrap();
        assert_eq!(outcome.engine_used, "m2");
        assert!(outcome.fell_back);
    }

    #[tokio::test]
    async fn max_attempts_bounds_invocations() {
        let m1: Arc<dyn Engine> = Arc::new(MockEngine::rate_limited("m1", 60).with_order(1));
        let m2: Arc<dyn Engine> = Arc::new(MockEngine::rate_limited("m2", 60).with_order(2));
        let m3 = Arc::new(MockEngine::responding("m3", "OK").with_order(3));
        let (h, _dir) = harness(vec![
            m1,
            m2,
            Arc::clone(&m3) as Arc<dyn Engine>,
        ])
        .await;

        let outcome = h
            .runner
            .run(
                FallbackRequest::new("m1", RunOptions::new("go")).with_max_attempts(2),
                &NoopObserver,
            )
            .await
            .unwrap();

        assert!(outcome.is_rate_limit_exhaustion());
        assert_eq!(m3.run_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_run_aborts() {
        let m1: Arc<dyn Engine> = Arc::new(MockEngine::new(
            "m1",
            vec![MockBehavior::Hang {
                partial: "...".into(),
            }],
        ));
        let (h, _dir) = harness(vec![m1]).await;

        let options = RunOptions::new("go");
        let cancel = options.cancel.clone();
        let run = h.runner.run(FallbackRequest::new("m1", options), &NoopObserver);

        let (result, ()) = tokio::join!(run, async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });

        assert_eq!(result.unwrap_err().code(), "workflow.aborted");
    }

    #[tokio::test]
    async fn timeout_surfaces_as_timeout_error() {
        let m1: Arc<dyn Engine> = Arc::new(MockEngine::new(
            "m1",
            vec![MockBehavior::Hang {
                partial: "...".into(),
            }],
        ));
        let (h, _dir) = harness(vec![m1]).await;

        let options =
            RunOptions::new("go").with_timeout(std::time::Duration::from_millis(30));
        let err = h
            .runner
            .run(FallbackRequest::new("m1", options), &NoopObserver)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "engine.timeout");
    }
}
