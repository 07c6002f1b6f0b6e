mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use shadowbox::perf::{Metadata, Metric, PerfStatsReporter, ReporterError};
use shadowbox::runner::{
    Description, Outcome, RecordingNotifier, RunEvent, SandboxLifecycle, SandboxTestRunner,
    Statement, TestClass, TestContext, TestMethod, TestRule,
};
use shadowbox::Fault;

use common::run;

fn two_passing(class: &str) -> TestClass {
    TestClass::new(class)
        .test(TestMethod::new("one", |_| Ok(())))
        .test(TestMethod::new("two", |_| Ok(())))
}

/// Every method must finish exactly once.
fn assert_one_outcome_each(recording: &RecordingNotifier, methods: &[&str]) {
    let events = recording.events();
    for method in methods {
        let finished = events
            .iter()
            .filter(|event| matches!(event, RunEvent::Finished(d) if d.method.as_deref() == Some(*method)))
            .count();
        assert_eq!(finished, 1, "{method}: {events:?}");
    }
    assert!(recording.class_failures().is_empty(), "{events:?}");
}

fn panicked(fault: Option<Fault>, expected: &str) -> bool {
    matches!(fault.as_ref().map(Fault::primary), Some(Fault::Panicked { message }) if message == expected)
}

struct ExplodingReporter;

impl PerfStatsReporter for ExplodingReporter {
    fn report(&self, _: &Metadata, _: &[Metric]) -> Result<(), ReporterError> {
        panic!("reporter exploded");
    }
}

#[test]
fn panicking_reporter_leaves_outcomes_untouched() {
    let runner = SandboxTestRunner::builder(two_passing("app.ReportedTest"), common::classpath(vec![]))
        .providers(common::no_providers())
        .reporter(Arc::new(ExplodingReporter))
        .build()
        .unwrap();
    let (summary, recording) = run(&runner);

    assert_one_outcome_each(&recording, &["one", "two"]);
    assert_eq!(recording.outcome("one"), Some(Outcome::Passed));
    assert_eq!(recording.outcome("two"), Some(Outcome::Passed));
    assert_eq!(summary.passed, 2);
    assert_eq!(summary.class_failures, 0);
}

/// Panics while wrapping the method named `victim`.
struct ExplodingRule {
    victim: &'static str,
}

impl TestRule for ExplodingRule {
    fn apply<'a>(&'a self, base: Statement<'a>, description: &'a Description) -> Statement<'a> {
        if description.method.as_deref() == Some(self.victim) {
            panic!("rule exploded");
        }
        base
    }
}

/// Panics from inside the statement it returns.
struct ExplodingStatement;

impl TestRule for ExplodingStatement {
    fn apply<'a>(&'a self, base: Statement<'a>, description: &'a Description) -> Statement<'a> {
        Box::new(move || {
            base()?;
            if description.method.as_deref() == Some("two") {
                panic!("statement exploded");
            }
            Ok(())
        })
    }
}

#[test]
fn panicking_rule_fails_only_the_wrapped_method() {
    let class = two_passing("app.RuledTest").rule(Arc::new(ExplodingRule { victim: "one" }));
    let runner = common::runner(class, vec![]);
    let (summary, recording) = run(&runner);

    assert_one_outcome_each(&recording, &["one", "two"]);
    assert!(panicked(recording.failure("one"), "rule exploded"));
    assert_eq!(recording.outcome("two"), Some(Outcome::Passed));
    assert_eq!((summary.passed, summary.failed), (1, 1));
}

#[test]
fn panicking_rule_statement_fails_only_its_method() {
    let class = two_passing("app.RuledTest").rule(Arc::new(ExplodingStatement));
    let runner = common::runner(class, vec![]);
    let (summary, recording) = run(&runner);

    assert_one_outcome_each(&recording, &["one", "two"]);
    assert_eq!(recording.outcome("one"), Some(Outcome::Passed));
    assert!(panicked(recording.failure("two"), "statement exploded"));
    assert_eq!((summary.passed, summary.failed), (1, 1));
}

/// Panics in one lifecycle stage for the method named `victim`, and logs every stage it reaches.
struct ExplodingLifecycle {
    stage: &'static str,
    victim: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl ExplodingLifecycle {
    fn enter(&self, stage: &str, description: &Description) -> Result<(), Fault> {
        let method = description.method.clone().unwrap_or_default();
        self.log.lock().push(format!("{stage}:{method}"));
        if stage == self.stage && method == self.victim {
            panic!("{stage} exploded");
        }
        Ok(())
    }
}

impl SandboxLifecycle for ExplodingLifecycle {
    fn before_test(&self, ctx: &TestContext<'_>) -> Result<(), Fault> {
        self.enter("before_test", ctx.description())
    }

    fn after_test(&self, ctx: &TestContext<'_>) -> Result<(), Fault> {
        self.enter("after_test", ctx.description())
    }

    fn finally_after_test(&self, description: &Description) -> Result<(), Fault> {
        self.enter("finally_after_test", description)
    }
}

#[test]
fn panicking_lifecycle_stage_fails_its_method_and_later_stages_still_run() {
    for stage in ["before_test", "after_test", "finally_after_test"] {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner =
            SandboxTestRunner::builder(two_passing("app.LifecycleTest"), common::classpath(vec![]))
                .providers(common::no_providers())
                .lifecycle(Arc::new(ExplodingLifecycle {
                    stage,
                    victim: "one",
                    log: Arc::clone(&log),
                }))
                .build()
                .unwrap();
        let (summary, recording) = run(&runner);

        assert_one_outcome_each(&recording, &["one", "two"]);
        assert!(
            panicked(recording.failure("one"), &format!("{stage} exploded")),
            "{stage}: {:?}",
            recording.events()
        );
        assert_eq!(recording.outcome("two"), Some(Outcome::Passed), "{stage}");
        assert_eq!((summary.passed, summary.failed), (1, 1), "{stage}");

        let log = log.lock().clone();
        for later in ["after_test:one", "finally_after_test:one", "finally_after_test:two"] {
            assert!(log.iter().any(|entry| entry == later), "{stage}: {log:?}");
        }
    }
}
