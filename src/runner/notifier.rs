//! Run notifications: the per-method event stream and the summary derived from it.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use super::model::Description;
use crate::diagnostics::Fault;

/// Receives the outcome of every test method.
///
/// For each method: `test_started`, at most one `test_failure`, then `test_finished`; or a
/// single `test_ignored`. A failure against a class description reports a fault outside any
/// method, such as a failing before-class hook.
pub trait RunNotifier: Send + Sync {
    fn test_started(&self, description: &Description);
    fn test_failure(&self, description: &Description, fault: &Fault);
    fn test_ignored(&self, description: &Description);
    fn test_finished(&self, description: &Description);
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Started(Description),
    Failed(Description, Fault),
    Ignored(Description),
    Finished(Description),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Passed,
    Failed(Fault),
    Ignored,
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    /// The outcome of the method named `method`, if it finished or was ignored.
    pub fn outcome(&self, method: &str) -> Option<Outcome> {
        let events = self.events.lock();
        let mut failure = None;
        for event in events.iter() {
            match event {
                RunEvent::Ignored(d) if d.method.as_deref() == Some(method) => {
                    return Some(Outcome::Ignored)
                }
                RunEvent::Failed(d, fault) if d.method.as_deref() == Some(method) => {
                    failure = Some(fault.clone());
                }
                RunEvent::Finished(d) if d.method.as_deref() == Some(method) => {
                    return Some(match failure {
                        Some(fault) => Outcome::Failed(fault),
                        None => Outcome::Passed,
                    });
                }
                _ => {}
            }
        }
        None
    }

    pub fn failure(&self, method: &str) -> Option<Fault> {
        match self.outcome(method)? {
            Outcome::Failed(fault) => Some(fault),
            _ => None,
        }
    }

    /// Faults reported against the class rather than a method.
    pub fn class_failures(&self) -> Vec<Fault> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                RunEvent::Failed(d, fault) if !d.is_method() => Some(fault.clone()),
                _ => None,
            })
            .collect()
    }

    /// Method names in the order they started.
    pub fn started(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                RunEvent::Started(d) => d.method.clone(),
                _ => None,
            })
            .collect()
    }
}

impl RunNotifier for RecordingNotifier {
    fn test_started(&self, description: &Description) {
        self.events
            .lock()
            .push(RunEvent::Started(description.clone()));
    }

    fn test_failure(&self, description: &Description, fault: &Fault) {
        self.events
            .lock()
            .push(RunEvent::Failed(description.clone(), fault.clone()));
    }

    fn test_ignored(&self, description: &Description) {
        self.events
            .lock()
            .push(RunEvent::Ignored(description.clone()));
    }

    fn test_finished(&self, description: &Description) {
        self.events
            .lock()
            .push(RunEvent::Finished(description.clone()));
    }
}

/// Totals of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub ignored: usize,
    /// Faults reported against a class rather than a method.
    pub class_failures: usize,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.class_failures > 0
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.ignored
    }

    /// Passed methods as a percentage of methods that ran.
    pub fn success_rate(&self) -> f64 {
        let ran = self.passed + self.failed;
        if ran == 0 {
            0.0
        } else {
            (self.passed as f64 / ran as f64) * 100.0
        }
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.ignored += other.ignored;
        self.class_failures += other.class_failures;
    }
}

/// Forwards events to another notifier while counting outcomes.
pub(crate) struct SummaryNotifier {
    inner: Arc<dyn RunNotifier>,
    state: Mutex<SummaryState>,
}

#[derive(Default)]
struct SummaryState {
    summary: RunSummary,
    failing: HashSet<Description>,
}

impl SummaryNotifier {
    pub(crate) fn new(inner: Arc<dyn RunNotifier>) -> Self {
        Self {
            inner,
            state: Mutex::new(SummaryState::default()),
        }
    }

    pub(crate) fn summary(&self) -> RunSummary {
        self.state.lock().summary
    }
}

impl RunNotifier for SummaryNotifier {
    fn test_started(&self, description: &Description) {
        self.inner.test_started(description);
    }

    fn test_failure(&self, description: &Description, fault: &Fault) {
        {
            let mut state = self.state.lock();
            if description.is_method() {
                state.failing.insert(description.clone());
            } else {
                state.summary.class_failures += 1;
            }
        }
        self.inner.test_failure(description, fault);
    }

    fn test_ignored(&self, description: &Description) {
        self.state.lock().summary.ignored += 1;
        self.inner.test_ignored(description);
    }

    fn test_finished(&self, description: &Description) {
        {
            let mut state = self.state.lock();
            if state.failing.remove(description) {
                state.summary.failed += 1;
            } else {
                state.summary.passed += 1;
            }
        }
        self.inner.test_finished(description);
    }
}

/// Prints one coloured line per method.
pub struct ConsoleNotifier {
    out: Mutex<StandardStream>,
    failures: Mutex<HashSet<Description>>,
    verbose: bool,
}

impl ConsoleNotifier {
    pub fn new(choice: ColorChoice, verbose: bool) -> Self {
        Self {
            out: Mutex::new(StandardStream::stdout(choice)),
            failures: Mutex::new(HashSet::new()),
            verbose,
        }
    }

    fn line(&self, color: Color, label: &str, description: &Description, detail: Option<String>) {
        let mut out = self.out.lock();
        let _ = out.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true));
        let _ = write!(out, "{label:>7}");
        let _ = out.reset();
        let _ = writeln!(out, " {description}");
        if let Some(detail) = detail {
            for line in detail.lines() {
                let _ = writeln!(out, "          {line}");
            }
        }
    }
}

impl RunNotifier for ConsoleNotifier {
    fn test_started(&self, description: &Description) {
        if self.verbose {
            self.line(Color::Cyan, "RUN", description, None);
        }
    }

    fn test_failure(&self, description: &Description, fault: &Fault) {
        self.failures.lock().insert(description.clone());
        let detail = format!("{fault}");
        self.line(Color::Red, "FAIL", description, Some(detail));
    }

    fn test_ignored(&self, description: &Description) {
        self.line(Color::Yellow, "SKIP", description, None);
    }

    fn test_finished(&self, description: &Description) {
        if !self.failures.lock().remove(description) {
            self.line(Color::Green, "PASS", description, None);
        }
    }
}
