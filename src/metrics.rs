//! Run metrics.
//!
//! Two views of the same timings:
//!
//! - [`RunMetrics`] describes a single successful run and comes back with its
//!   [`RunOutcome`](crate::RunOutcome).
//! - [`ContextMetrics`] is a snapshot of what a [`Context`](crate::Context)
//!   has accumulated over its whole life, timed-out runs included.
//!
//! ## Design notes
//!
//! - The cumulative counters are atomics so they can be read while another
//!   thread holds the context's run lock.
//! - `overall` is charged with `max(wall, engine)` per run, so
//!   `overall >= internal` holds even when the engine reports more time than
//!   was measured around it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// --- Metrics -----------------------------------------------------------------

/// Timings for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunMetrics {
    /// Wall-clock time of the whole run, encoding and decoding included.
    pub total: Duration,
    /// Time spent encoding the inputs.
    pub encode: Duration,
    /// Evaluation time as reported by the engine.
    pub engine: Duration,
}

/// Cumulative totals of one context.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ContextMetrics {
    /// Wall-clock time charged to runs that reached the engine.
    pub overall: Duration,
    /// Engine-reported evaluation time.
    pub internal: Duration,
    /// Runs that ended with a timeout.
    pub timeouts: u64,
    /// Runs that completed.
    pub runs: u64,
}

// --- Counters ----------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct Counters {
    overall_ns: AtomicU64,
    internal_ns: AtomicU64,
    timeouts: AtomicU64,
    runs: AtomicU64,
}

impl Counters {
    pub(crate) fn record_run(&self, metrics: &RunMetrics) {
        let internal = saturating_ns(metrics.engine);
        let overall = saturating_ns(metrics.total).max(internal);
        self.overall_ns.fetch_add(overall, Ordering::Relaxed);
        self.internal_ns.fetch_add(internal, Ordering::Relaxed);
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) -> u64 {
        self.timeouts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn snapshot(&self) -> ContextMetrics {
        ContextMetrics {
            overall: Duration::from_nanos(self.overall_ns.load(Ordering::Relaxed)),
            internal: Duration::from_nanos(self.internal_ns.load(Ordering::Relaxed)),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            runs: self.runs.load(Ordering::Relaxed),
        }
    }
}

fn saturating_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
