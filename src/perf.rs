//! # Performance Statistics
//!
//! Every test method gets a fresh set of timing metrics. The runner records an `initialization`
//! event around sandbox preparation and a `test` event around the method's lifecycle, then
//! hands the metrics, together with a metadata record, to every registered reporter.
//!
//! Reporters are best-effort: a failing reporter is logged and ignored.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::sandbox::panic_message;

pub const INITIALIZATION_EVENT: &str = "initialization";
pub const TEST_EVENT: &str = "test";

pub type ReporterError = Box<dyn std::error::Error + Send + Sync>;

/// Free-form description of what was measured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Aggregated timings of one named event, split by outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metric {
    pub name: String,
    pub success: bool,
    pub count: u32,
    pub elapsed_nanos: u64,
}

/// Collects metrics for the method currently running.
#[derive(Debug, Default)]
pub struct PerfStatsCollector {
    metrics: Mutex<BTreeMap<(String, bool), Metric>>,
}

/// An event that has started but not finished.
#[derive(Debug)]
#[must_use = "an event is only recorded when it is finished"]
pub struct Event {
    name: String,
    started: Instant,
}

impl Event {
    pub fn finished(self, collector: &PerfStatsCollector, success: bool) {
        collector.record(&self.name, success, self.started.elapsed());
    }
}

impl PerfStatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_event(&self, name: impl Into<String>) -> Event {
        Event {
            name: name.into(),
            started: Instant::now(),
        }
    }

    /// Times `f`, recording success when it returns `Ok`.
    pub fn measure<T, E>(&self, name: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let event = self.start_event(name);
        let result = f();
        event.finished(self, result.is_ok());
        result
    }

    pub fn record(&self, name: &str, success: bool, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        let mut metrics = self.metrics.lock();
        let metric = metrics
            .entry((name.to_string(), success))
            .or_insert_with(|| Metric {
                name: name.to_string(),
                success,
                count: 0,
                elapsed_nanos: 0,
            });
        metric.count += 1;
        metric.elapsed_nanos = metric.elapsed_nanos.saturating_add(nanos);
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.metrics.lock().values().cloned().collect()
    }

    /// Takes the collected metrics, leaving the collector empty for the next method.
    pub fn drain(&self) -> Vec<Metric> {
        std::mem::take(&mut *self.metrics.lock())
            .into_values()
            .collect()
    }
}

pub trait PerfStatsReporter: Send + Sync {
    fn report(&self, metadata: &Metadata, metrics: &[Metric]) -> Result<(), ReporterError>;
}

/// Hands the metrics to every reporter. Reporter failures, panics included, are logged and
/// discarded.
pub fn report_all(reporters: &[Arc<dyn PerfStatsReporter>], metadata: &Metadata, metrics: &[Metric]) {
    for reporter in reporters {
        match panic::catch_unwind(AssertUnwindSafe(|| reporter.report(metadata, metrics))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::warn!(%error, "performance stats reporter failed"),
            Err(payload) => tracing::warn!(
                panic = %panic_message(payload.as_ref()),
                "performance stats reporter panicked"
            ),
        }
    }
}

#[derive(Serialize)]
struct Record<'a> {
    metadata: &'a Metadata,
    metrics: &'a [Metric],
}

/// Writes one JSON object per reported method.
pub struct JsonLinesReporter<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl JsonLinesReporter<BufWriter<File>> {
    /// Appends to the file at `path`, creating it if needed.
    pub fn append_to(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> PerfStatsReporter for JsonLinesReporter<W> {
    fn report(&self, metadata: &Metadata, metrics: &[Metric]) -> Result<(), ReporterError> {
        let line = serde_json::to_string(&Record { metadata, metrics })?;
        let mut out = self.out.lock();
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}
