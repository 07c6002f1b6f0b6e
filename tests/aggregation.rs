mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use shadowbox::runner::{
    Description, SandboxLifecycle, SandboxTestRunner, Statement, TestClass, TestContext,
    TestMethod, TestRule,
};
use shadowbox::Fault;

use common::run;

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn note(log: &Log, entry: &str) -> Result<(), Fault> {
    log.lock().push(entry.to_string());
    Ok(())
}

struct RecordingLifecycle {
    log: Log,
    fail_before: bool,
}

impl SandboxLifecycle for RecordingLifecycle {
    fn before_test(&self, ctx: &TestContext<'_>) -> Result<(), Fault> {
        note(&self.log, "before_test")?;
        if self.fail_before {
            return Err(Fault::failed(format!("cannot set up {}", ctx.description())));
        }
        Ok(())
    }

    fn after_test(&self, _ctx: &TestContext<'_>) -> Result<(), Fault> {
        note(&self.log, "after_test")
    }

    fn finally_after_test(&self, _description: &Description) -> Result<(), Fault> {
        note(&self.log, "finally_after_test")
    }
}

struct Around(Log);

impl TestRule for Around {
    fn apply<'a>(&'a self, base: Statement<'a>, _description: &'a Description) -> Statement<'a> {
        Box::new(move || {
            note(&self.0, "rule:enter")?;
            let result = base();
            note(&self.0, "rule:exit")?;
            result
        })
    }
}

fn hooked_class(log: &Log) -> TestClass {
    let (before, after) = (Arc::clone(log), Arc::clone(log));
    let body = Arc::clone(log);
    TestClass::new("app.HookTest")
        .before_each(move |_| note(&before, "before_each"))
        .after_each(move |_| note(&after, "after_each"))
        .rule(Arc::new(Around(Arc::clone(log))))
        .test(TestMethod::new("body", move |_| note(&body, "body")))
}

fn runner_with(class: TestClass, log: &Log, fail_before: bool) -> SandboxTestRunner {
    SandboxTestRunner::builder(class, common::classpath(vec![]))
        .providers(common::no_providers())
        .lifecycle(Arc::new(RecordingLifecycle {
            log: Arc::clone(log),
            fail_before,
        }))
        .build()
        .unwrap()
}

#[test]
fn lifecycle_wraps_rules_which_wrap_hooks() {
    let log = log();
    let runner = runner_with(hooked_class(&log), &log, false);
    let (summary, recording) = run(&runner);

    assert_eq!(summary.passed, 1, "{:?}", recording.events());
    assert_eq!(
        *log.lock(),
        vec![
            "before_test",
            "rule:enter",
            "before_each",
            "body",
            "after_each",
            "rule:exit",
            "after_test",
            "finally_after_test",
        ]
    );
}

#[test]
fn failed_setup_skips_the_method_block_but_not_teardown() {
    let log = log();
    let runner = runner_with(hooked_class(&log), &log, true);
    let (summary, recording) = run(&runner);

    assert_eq!(summary.failed, 1);
    assert_eq!(
        *log.lock(),
        vec!["before_test", "after_test", "finally_after_test"]
    );
    let fault = recording.failure("body").unwrap();
    assert_eq!(
        fault.to_string(),
        "cannot set up body(app.HookTest)"
    );
}

#[test]
fn failing_body_still_runs_every_teardown_stage() {
    let log = log();
    let (body, after) = (Arc::clone(&log), Arc::clone(&log));
    let class = TestClass::new("app.HookTest")
        .after_each(move |_| note(&after, "after_each"))
        .rule(Arc::new(Around(Arc::clone(&log))))
        .test(TestMethod::new("body", move |_| {
            note(&body, "body")?;
            Err(Fault::failed("A"))
        }));
    let runner = runner_with(class, &log, false);
    let (summary, recording) = run(&runner);

    assert_eq!(summary.failed, 1);
    assert_eq!(recording.failure("body"), Some(Fault::failed("A")));
    assert_eq!(
        *log.lock(),
        vec![
            "before_test",
            "rule:enter",
            "body",
            "after_each",
            "rule:exit",
            "after_test",
            "finally_after_test",
        ]
    );
}

#[test]
fn timed_out_body_still_runs_every_teardown_stage() {
    let log = log();
    let after = Arc::clone(&log);
    let class = TestClass::new("app.HookTest")
        .after_each(move |_| note(&after, "after_each"))
        .test(
            TestMethod::new("slow", |_| {
                thread::sleep(Duration::from_millis(50));
                Ok(())
            })
            .with_timeout(Duration::from_millis(10)),
        );
    let runner = runner_with(class, &log, false);
    let (summary, recording) = run(&runner);

    assert_eq!(summary.failed, 1);
    assert!(matches!(
        recording.failure("slow"),
        Some(Fault::Timeout { timeout_ms: 10 })
    ));
    assert_eq!(
        *log.lock(),
        vec!["before_test", "after_each", "after_test", "finally_after_test"]
    );
}

#[test]
fn body_fault_is_primary_and_teardown_faults_are_suppressed() {
    let class = TestClass::new("app.FailingTest")
        .after_each(|_| Err(Fault::failed("B")))
        .test(TestMethod::new("fails", |_| Err(Fault::failed("A"))));

    let runner = common::runner(class, vec![]);
    let (_, recording) = run(&runner);

    let fault = recording.failure("fails").unwrap();
    assert_eq!(fault.primary(), &Fault::failed("A"));
    assert_eq!(fault.suppressed(), &[Fault::failed("B")]);
}

#[test]
fn after_class_runs_after_failures_and_reports_at_class_level() {
    let log = log();
    let (before, after) = (Arc::clone(&log), Arc::clone(&log));
    let class = TestClass::new("app.ClassHookTest")
        .before_class(move |_| note(&before, "before_class"))
        .after_class(move |_| {
            note(&after, "after_class")?;
            Err(Fault::failed("teardown failed"))
        })
        .test(TestMethod::new("fails", |_| Err(Fault::failed("A"))))
        .test(TestMethod::new("passes", |_| Ok(())));

    let runner = common::runner(class, vec![]);
    let (summary, recording) = run(&runner);

    assert_eq!((summary.passed, summary.failed), (1, 1));
    assert_eq!(*log.lock(), vec!["before_class", "after_class"]);
    assert_eq!(recording.class_failures(), vec![Fault::failed("teardown failed")]);
}

#[test]
fn panics_in_test_code_become_faults() {
    let class = TestClass::new("app.PanicTest")
        .test(TestMethod::new("panics", |_| panic!("boom")))
        .test(TestMethod::new("survives", |_| Ok(())));

    let runner = common::runner(class, vec![]);
    let (summary, recording) = run(&runner);

    assert!(matches!(
        recording.failure("panics"),
        Some(Fault::Panicked { ref message }) if message == "boom"
    ));
    assert_eq!(summary.passed, 1);
}
