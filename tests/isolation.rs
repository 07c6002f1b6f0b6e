mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use shadowbox::classes::{ClassDef, ClassName, Value};
use shadowbox::config::SandboxConfig;
use shadowbox::runner::{
    check_eq, Outcome, RunnerOptions, SandboxTestRunner, TestClass, TestContext, TestMethod,
};
use shadowbox::sandbox::{ClassId, ClassOrigin};

use common::{clock, clock_substitute, counter, providers, run};

#[test]
fn sandboxes_do_not_share_static_state_with_each_other_or_the_host() {
    let seen: Arc<Mutex<Vec<ClassId>>> = Arc::new(Mutex::new(Vec::new()));
    let record = |seen: &Arc<Mutex<Vec<ClassId>>>| {
        let seen = Arc::clone(seen);
        move |ctx: &TestContext<'_>| {
            seen.lock().push(ctx.load("app.Counter")?.id());
            check_eq(ctx.invoke("app.Counter.bump", vec![])?, Value::Int(1))
        }
    };

    let class = TestClass::new("app.IsolationTest")
        .test(
            TestMethod::new("in_first_sandbox", record(&seen))
                .with_config(SandboxConfig::new().instrument_package("app.")),
        )
        .test(
            TestMethod::new("in_second_sandbox", record(&seen))
                .with_config(SandboxConfig::new().instrument_package("lib.")),
        );

    let runner = common::runner(class, vec![counter()]);
    let (summary, recording) = run(&runner);

    assert_eq!(summary.passed, 2, "{:?}", recording.events());
    assert_eq!(runner.cache().constructions(), 2);
    let ids = seen.lock().clone();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    let host_copy = runner
        .cache()
        .host()
        .load(&ClassName::new("app.Counter"))
        .unwrap();
    assert_eq!(host_copy.get_static("count"), Value::Int(0));
    assert!(!ids.contains(&host_copy.id()));
}

#[test]
fn provided_substitutes_replace_real_classes_only_inside_the_sandbox() {
    let class = TestClass::new("app.ClockTest").test(TestMethod::new("reads_clock", |ctx| {
        check_eq(ctx.invoke("platform.time.Clock.now", vec![])?, Value::Int(42))
    }));

    let runner = SandboxTestRunner::builder(class, common::classpath(vec![clock()]))
        .providers(providers(vec![clock_substitute("shadows.ShadowClock", 42)]))
        .build()
        .unwrap();
    let (_, recording) = run(&runner);

    assert_eq!(
        recording.outcome("reads_clock"),
        Some(Outcome::Passed),
        "{:?}",
        recording.events()
    );

    let host_clock = runner
        .cache()
        .host()
        .load(&ClassName::new("platform.time.Clock"))
        .unwrap();
    assert!(host_clock.method("now").is_some());
    assert!(!host_clock.definition().instrumented);
}

#[test]
fn excluded_packages_resolve_to_the_host_copy() {
    let class = TestClass::new("app.SharedTest")
        .with_config(SandboxConfig::new().instrument_package("app."))
        .test(TestMethod::new("shares_counter", |ctx| {
            let shared = ctx.load("vendor.Shared")?;
            check_eq(shared.origin(), ClassOrigin::Host)
        }));

    let mut options = RunnerOptions::default();
    options.environment.packages_to_not_acquire = vec!["vendor.".into()];
    let runner = SandboxTestRunner::builder(
        class,
        common::classpath(vec![ClassDef::new("vendor.Shared")]),
    )
    .options(options)
    .providers(common::no_providers())
    .build()
    .unwrap();
    let (summary, recording) = run(&runner);
    assert_eq!(summary.passed, 1, "{:?}", recording.events());
}
