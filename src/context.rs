//! Execution contexts.
//!
//! A [`Context`] is one evaluation session over a compiled rule set. It is
//! what a request handler holds for the lifetime of a request: every run
//! feeds it more addresses, and the engine remembers across runs which rules
//! already matched so that a rule reports at most once per context.
//!
//! ## One run
//!
//! ```text
//! inputs (address -> value) ──> Encoder::encode_entries ──> Object
//!                                                            │ to_raw
//!                                                            v
//!                      remaining budget ──> EngineContext::run (catch_unwind)
//!                                                            │
//!                           RawRunResult { timeout, data, actions, runtime }
//!                                                            │
//!                     decode_strings(actions), record RunMetrics
//!                                                            v
//!                                                       RunOutcome
//! ```
//!
//! ## Concurrency
//!
//! Runs on one context are serialized behind a mutex; a context is `Send +
//! Sync` and may be shared, but parallel workers should each open their own.
//! The cumulative counters are atomics and can be read while a run is in
//! flight.

use crate::abi::EngineContext;
use crate::decoder::decode_strings;
use crate::metrics::Counters;
use crate::{ContextMetrics, Encoder, Limits, RunError, RunMetrics};
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// What a run produced.
///
/// A run that matched nothing has an empty `matches` payload and no actions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// JSON array of match events, as produced by the engine. Empty when nothing matched.
    pub matches: Vec<u8>,
    /// De-duplicated actions of the rules that matched.
    pub actions: Vec<String>,
    pub metrics: RunMetrics,
}

impl RunOutcome {
    pub fn is_match(&self) -> bool {
        !self.matches.is_empty()
    }

    /// The match events, parsed.
    pub fn events(&self) -> serde_json::Result<Vec<serde_json::Value>> {
        if self.matches.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&self.matches)
    }
}

/// An evaluation session bound to a [`Handle`](crate::Handle).
///
/// Obtained from [`Handle::new_context`](crate::Handle::new_context). The
/// context keeps the compiled rules alive on its own, so it stays usable
/// after its handle is closed, until it is closed itself.
pub struct Context {
    engine: Mutex<Option<Box<dyn EngineContext>>>,
    encoder: Encoder,
    counters: Counters,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("open", &self.is_open())
            .field("limits", &self.encoder.limits())
            .field("metrics", &self.counters.snapshot())
            .finish()
    }
}

impl Context {
    pub(crate) fn new(engine: Box<dyn EngineContext>, limits: Limits) -> Self {
        tracing::debug!(?limits, "context opened");
        Context { engine: Mutex::new(Some(engine)), encoder: Encoder::new(limits), counters: Counters::default() }
    }

    /// Evaluate `inputs`, one `(address, value)` pair per entry, within `timeout`.
    ///
    /// The budget covers waiting for a concurrent run on this context,
    /// encoding and evaluation. A run on a closed context, or with no
    /// inputs, does nothing and returns an empty outcome.
    pub fn run<I, K, V>(&self, inputs: I, timeout: Duration) -> Result<RunOutcome, RunError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Serialize,
    {
        let start = Instant::now();
        let mut inputs = inputs.into_iter().peekable();
        if inputs.peek().is_none() {
            return Ok(RunOutcome::default());
        }

        let mut guard = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(engine) = guard.as_mut() else {
            tracing::debug!("run on a closed context");
            return Ok(RunOutcome::default());
        };
        if timeout.is_zero() {
            return Err(self.timed_out("no budget"));
        }

        let encoded = self.encoder.encode_entries(inputs);
        let encode = start.elapsed();
        let remaining = match timeout.checked_sub(encode) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => return Err(self.timed_out("budget consumed before evaluation")),
        };

        let raw = encoded.to_raw();
        let result = match catch_unwind(AssertUnwindSafe(|| engine.run(&raw, remaining))) {
            Ok(Ok(result)) => result,
            Ok(Err(code)) => return Err(code.run_error()),
            Err(_) => {
                tracing::warn!("waf engine panicked during a run");
                return Err(RunError::Internal);
            }
        };
        if result.timeout {
            return Err(self.timed_out("engine deadline reached"));
        }

        let actions = decode_strings(&result.actions).map_err(|err| {
            tracing::warn!(%err, "malformed action list");
            RunError::InvalidObject
        })?;
        let metrics = RunMetrics { total: start.elapsed(), encode, engine: Duration::from_nanos(result.total_runtime_ns) };
        self.counters.record_run(&metrics);

        Ok(RunOutcome { matches: result.data.unwrap_or_default(), actions, metrics })
    }

    /// Cumulative `(overall, internal)` runtime in nanoseconds.
    pub fn total_runtime(&self) -> (u64, u64) {
        let metrics = self.counters.snapshot();
        (saturating_ns(metrics.overall), saturating_ns(metrics.internal))
    }

    /// Runs that ended with [`RunError::Timeout`].
    pub fn total_timeouts(&self) -> u64 {
        self.counters.snapshot().timeouts
    }

    pub fn metrics(&self) -> ContextMetrics {
        self.counters.snapshot()
    }

    pub fn is_open(&self) -> bool {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Release the engine-side session. Later runs return empty outcomes.
    pub fn close(&self) {
        if self.engine.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            tracing::debug!(metrics = ?self.counters.snapshot(), "context closed");
        }
    }

    fn timed_out(&self, reason: &'static str) -> RunError {
        let count = self.counters.record_timeout();
        tracing::debug!(reason, count, "run timed out");
        RunError::Timeout
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}

fn saturating_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{RawObject, RawRunResult, ReturnCode};
    use serde_json::json;

    /// Replays a fixed result and counts calls.
    struct Scripted {
        result: Result<RawRunResult, ReturnCode>,
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl EngineContext for Scripted {
        fn run(&mut self, data: &RawObject<'_>, _timeout: Duration) -> Result<RawRunResult, ReturnCode> {
            assert_eq!(data.kind(), Some(crate::abi::ObjectKind::MAP));
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn context(result: Result<RawRunResult, ReturnCode>) -> (Context, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        let calls = std::sync::Arc::default();
        let engine = Scripted { result, calls: std::sync::Arc::clone(&calls) };
        (Context::new(Box::new(engine), Limits::default()), calls)
    }

    fn calls(counter: &std::sync::atomic::AtomicUsize) -> usize {
        counter.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn input() -> [(&'static str, serde_json::Value); 1] {
        [("my.input", json!("Arachni"))]
    }

    #[test]
    fn empty_input_skips_the_engine() {
        let (ctx, counter) = context(Err(ReturnCode::ERR_INTERNAL));
        let none: [(&str, u8); 0] = [];
        assert_eq!(ctx.run(none, Duration::ZERO), Ok(RunOutcome::default()));
        assert_eq!(calls(&counter), 0);
        assert_eq!(ctx.total_timeouts(), 0);
    }

    #[test]
    fn zero_budget_times_out_without_evaluating() {
        let (ctx, counter) = context(Ok(RawRunResult::default()));
        assert_eq!(ctx.run(input(), Duration::ZERO), Err(RunError::Timeout));
        assert_eq!(ctx.run(input(), Duration::ZERO), Err(RunError::Timeout));
        assert_eq!(calls(&counter), 0);
        assert_eq!(ctx.total_timeouts(), 2);
        assert_eq!(ctx.metrics().runs, 0);
    }

    #[test]
    fn engine_timeout_is_counted() {
        let (ctx, counter) = context(Ok(RawRunResult { timeout: true, ..RawRunResult::default() }));
        assert_eq!(ctx.run(input(), Duration::from_secs(1)), Err(RunError::Timeout));
        assert_eq!(calls(&counter), 1);
        assert_eq!(ctx.total_timeouts(), 1);
    }

    #[test]
    fn engine_codes_become_run_errors() {
        let (ctx, _) = context(Err(ReturnCode::ERR_INVALID_ARGUMENT));
        assert_eq!(ctx.run(input(), Duration::from_secs(1)), Err(RunError::InvalidArgument));
        let (ctx, _) = context(Err(ReturnCode(-42)));
        assert_eq!(ctx.run(input(), Duration::from_secs(1)), Err(RunError::Internal));
        assert_eq!(ctx.total_timeouts(), 0);
    }

    #[test]
    fn successful_run_reports_payload_and_metrics() {
        let result = RawRunResult {
            timeout: false,
            data: Some(br#"[{"rule":{"id":"r"}}]"#.to_vec()),
            actions: RawObject::array(vec![RawObject::string(&b"block"[..])]).into_owned(),
            total_runtime_ns: 1_000,
        };
        let (ctx, _) = context(Ok(result));
        let outcome = ctx.run(input(), Duration::from_secs(1)).unwrap();

        assert!(outcome.is_match());
        assert_eq!(outcome.actions, vec!["block"]);
        assert_eq!(outcome.events().unwrap()[0]["rule"]["id"], "r");
        assert_eq!(outcome.metrics.engine, Duration::from_nanos(1_000));

        let (overall, internal) = ctx.total_runtime();
        assert_eq!(internal, 1_000);
        assert!(overall >= internal);
        assert_eq!(ctx.metrics().runs, 1);
    }

    #[test]
    fn malformed_actions_are_invalid_objects() {
        let result = RawRunResult { actions: RawObject::signed(3), ..RawRunResult::default() };
        let (ctx, _) = context(Ok(result));
        assert_eq!(ctx.run(input(), Duration::from_secs(1)), Err(RunError::InvalidObject));
    }

    #[test]
    fn closed_context_is_a_no_op() {
        let (ctx, counter) = context(Ok(RawRunResult::default()));
        assert!(ctx.is_open());
        ctx.close();
        ctx.close();
        assert!(!ctx.is_open());
        assert_eq!(ctx.run(input(), Duration::ZERO), Ok(RunOutcome::default()));
        assert_eq!(calls(&counter), 0);
    }

    #[test]
    fn no_match_outcome_has_no_events() {
        let outcome = RunOutcome::default();
        assert!(!outcome.is_match());
        assert!(outcome.events().unwrap().is_empty());
    }

    #[test]
    fn contexts_are_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Context>();
    }
}
