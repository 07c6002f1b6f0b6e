mod common;

use shadowbox::classes::Value;
use shadowbox::config::SandboxConfig;
use shadowbox::runner::{check_eq, RunnerOptions, SandboxTestRunner, TestClass, TestMethod};
use shadowbox::{Configuration, Fault};

use common::{counter, run};

fn bump_once(name: &str, package: &str) -> TestMethod {
    TestMethod::new(name, |ctx| {
        check_eq(ctx.invoke("app.Counter.bump", vec![])?, Value::Int(1))
    })
    .with_config(SandboxConfig::new().instrument_package(package))
}

#[test]
fn groups_whose_sandbox_was_evicted_get_a_fresh_one() {
    let class = TestClass::new("app.EvictionTest")
        .test(bump_once("in_app", "app."))
        .test(bump_once("in_lib", "lib."));

    let mut options = RunnerOptions::default();
    options.max_sandboxes = 1;
    let runner = SandboxTestRunner::builder(class, common::classpath(vec![counter()]))
        .options(options)
        .providers(common::no_providers())
        .build()
        .unwrap();
    let (summary, recording) = run(&runner);

    assert_eq!(summary.passed, 2, "{:?}", recording.events());
    assert!(recording.class_failures().is_empty());
    assert!(runner.cache().constructions() >= 3);
    assert_eq!(runner.cache().len(), 1);
}

#[test]
fn shut_down_sandbox_rejects_work_and_is_replaced_on_access() {
    let class = TestClass::new("app.Unused");
    let runner = common::runner(class, vec![counter()]);
    let config = Configuration::builder().build();

    let first = runner.cache().obtain(&config);
    first.shutdown();
    assert!(first.is_shut_down());
    assert!(matches!(
        first.run_on_owning_thread(|| Ok(())),
        Err(Fault::SandboxShutDown { .. })
    ));

    let second = runner.cache().obtain(&config);
    assert_ne!(first.id(), second.id());
    assert!(!second.is_shut_down());
}
