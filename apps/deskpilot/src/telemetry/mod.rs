//! Stage timings for the agent and the pilot loop, plus logging setup.
//!
//! Timings are off unless `DESKPILOT_PERF` is truthy. Each label keeps a
//! running summary that is logged under `deskpilot::perf` every few samples.

pub mod logging;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Commands and inference calls are slow, so summaries come often.
const SUMMARY_EVERY: u64 = 10;

static PERF: Lazy<bool> = Lazy::new(|| flag("DESKPILOT_PERF").unwrap_or(false));

static STAGES: Lazy<Mutex<BTreeMap<&'static str, StageSummary>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

pub(crate) fn flag(var: &str) -> Option<bool> {
    let raw = std::env::var(var).ok()?;
    let raw = raw.trim();
    Some(!(raw.is_empty() || raw == "0" || raw.eq_ignore_ascii_case("false")))
}

pub fn enabled() -> bool {
    *PERF
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageSummary {
    pub samples: u64,
    pub total: Duration,
    pub fastest: Duration,
    pub slowest: Duration,
}

impl StageSummary {
    fn add(&mut self, elapsed: Duration) {
        if self.samples == 0 || elapsed < self.fastest {
            self.fastest = elapsed;
        }
        self.slowest = self.slowest.max(elapsed);
        self.total += elapsed;
        self.samples += 1;
    }

    pub fn mean(&self) -> Duration {
        match u32::try_from(self.samples) {
            Ok(0) => Duration::ZERO,
            Ok(samples) => self.total / samples,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.samples as f64),
        }
    }
}

/// Adds one sample for `stage`. No-op while timings are disabled.
pub fn record_duration(stage: &'static str, elapsed: Duration) {
    if enabled() {
        record(stage, elapsed);
    }
}

fn record(stage: &'static str, elapsed: Duration) -> StageSummary {
    let mut stages = STAGES.lock();
    let summary = stages.entry(stage).or_default();
    summary.add(elapsed);
    let summary = *summary;
    drop(stages);

    if summary.samples % SUMMARY_EVERY == 0 {
        tracing::info!(
            target: "deskpilot::perf",
            stage,
            samples = summary.samples,
            mean_ms = summary.mean().as_secs_f64() * 1_000.0,
            fastest_ms = summary.fastest.as_secs_f64() * 1_000.0,
            slowest_ms = summary.slowest.as_secs_f64() * 1_000.0,
            "stage timing"
        );
    }
    summary
}

pub fn summary(stage: &str) -> Option<StageSummary> {
    STAGES.lock().get(stage).copied()
}

/// Times a scope and records it on drop.
pub struct PerfGuard {
    stage: &'static str,
    started: Instant,
}

impl PerfGuard {
    pub fn new(stage: &'static str) -> Option<Self> {
        enabled().then(|| Self {
            stage,
            started: Instant::now(),
        })
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        record_duration(self.stage, self.started.elapsed());
    }
}
