//! # Lifecycle Orchestrator
//!
//! [`SandboxTestRunner`] runs the methods of one [`TestClass`]. Methods are grouped by the
//! sandbox their configuration requires; each group is configured once and then executed, hooks
//! and all, on its sandbox's owning thread.
//!
//! ## Per-group flow
//!
//! 1. Re-obtain the sandbox if it was shut down since grouping.
//! 2. Build the group registry and configure the sandbox. This happens on the calling thread,
//!    before the sandbox becomes ambient.
//! 3. On the owning thread: load the isolated test class, then evaluate
//!    `class rules(after-class(before-class(children)))`.
//!
//! ## Per-method flow
//!
//! `before_test`, then `rules(after-each(before-each(timeout(body))))`, then `after_test`, then
//! `finally_after_test`, then the perf report and provider reset. Faults from every stage are
//! collected; the first is primary and the rest are suppressed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{group_by_required_sandbox, SandboxCache, SandboxGroup};
use crate::classes::{ClassDef, ClassPath, ClassSource, SourceChain};
use crate::config::Configuration;
use crate::diagnostics::{ConfigurationError, Fault};
use crate::perf::{
    report_all, JsonLinesReporter, Metadata, PerfStatsCollector, PerfStatsReporter,
    INITIALIZATION_EVENT, TEST_EVENT,
};
use crate::registry::{SubstituteProviders, SubstitutionRegistry};
use crate::sandbox::{ClassId, Deadline, Interceptors, LoadedClass, Sandbox};

pub mod lifecycle;
pub mod linkage;
pub mod model;
pub mod notifier;
pub mod options;

pub use lifecycle::{NoopLifecycle, SandboxLifecycle};
pub use linkage::LinkageFaultCache;
pub use model::{
    check, check_eq, Description, HookFn, Statement, TestClass, TestContext, TestMethod, TestRule,
};
pub use notifier::{
    ConsoleNotifier, Outcome, RecordingNotifier, RunEvent, RunNotifier, RunSummary,
};
pub use options::RunnerOptions;

use model::{guarded, run_hook};
use notifier::SummaryNotifier;

/// State shared by every group a runner executes.
struct RunnerShared {
    lifecycle: Arc<dyn SandboxLifecycle>,
    reporters: Vec<Arc<dyn PerfStatsReporter>>,
    providers: Arc<SubstituteProviders>,
    linkage_faults: LinkageFaultCache,
    invoked_before_classes: Mutex<HashSet<ClassId>>,
}

pub struct RunnerBuilder {
    test_class: TestClass,
    classpath: Arc<dyn ClassSource>,
    options: RunnerOptions,
    providers: Option<Arc<SubstituteProviders>>,
    interceptors: Interceptors,
    lifecycle: Arc<dyn SandboxLifecycle>,
    reporters: Vec<Arc<dyn PerfStatsReporter>>,
}

impl RunnerBuilder {
    pub fn options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    /// Substitute providers to use instead of the process-wide set.
    pub fn providers(mut self, providers: Arc<SubstituteProviders>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn interceptors(mut self, interceptors: Interceptors) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn lifecycle(mut self, lifecycle: Arc<dyn SandboxLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn PerfStatsReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    /// Discovers substitute providers and prepares the sandbox cache.
    ///
    /// Must not be called from a sandbox's owning thread.
    pub fn build(self) -> Result<SandboxTestRunner, Fault> {
        let providers = self.providers.unwrap_or_else(SubstituteProviders::global);
        let base_packages = providers.provided_packages()?.to_vec();

        let name = self.test_class.name().clone();
        let mut overlay = ClassPath::new();
        match self.test_class.definition() {
            Some(def) => {
                overlay.define(def.clone())?;
            }
            None if self.classpath.find(&name).is_none() => {
                overlay.define(ClassDef::new(name))?;
            }
            None => {}
        }
        let source: Arc<dyn ClassSource> = Arc::new(
            SourceChain::new()
                .then(Arc::new(overlay))
                .then(self.classpath)
                .then(providers.clone()),
        );

        let mut reporters = self.reporters;
        if let Some(path) = &self.options.perf_stats {
            reporters.push(Arc::new(JsonLinesReporter::append_to(path)?));
        }

        let cache = SandboxCache::new(self.options.max_sandboxes, Arc::clone(&source));
        Ok(SandboxTestRunner {
            test_class: Arc::new(self.test_class),
            options: self.options,
            interceptors: self.interceptors,
            source,
            base_packages,
            cache,
            shared: Arc::new(RunnerShared {
                lifecycle: self.lifecycle,
                reporters,
                providers,
                linkage_faults: LinkageFaultCache::new(),
                invoked_before_classes: Mutex::new(HashSet::new()),
            }),
        })
    }
}

/// Runs one test class, grouping its methods by required sandbox.
pub struct SandboxTestRunner {
    test_class: Arc<TestClass>,
    options: RunnerOptions,
    interceptors: Interceptors,
    source: Arc<dyn ClassSource>,
    base_packages: Vec<String>,
    cache: SandboxCache,
    shared: Arc<RunnerShared>,
}

impl SandboxTestRunner {
    /// Starts a runner for `test_class`, loading classes from `classpath`.
    pub fn builder(test_class: TestClass, classpath: Arc<dyn ClassSource>) -> RunnerBuilder {
        RunnerBuilder {
            test_class,
            classpath,
            options: RunnerOptions::default(),
            providers: None,
            interceptors: Interceptors::new(),
            lifecycle: Arc::new(NoopLifecycle),
            reporters: Vec::new(),
        }
    }

    pub fn test_class(&self) -> &TestClass {
        &self.test_class
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn cache(&self) -> &SandboxCache {
        &self.cache
    }

    pub fn linkage_faults(&self) -> &LinkageFaultCache {
        &self.shared.linkage_faults
    }

    /// The configuration `method` runs under.
    pub fn configuration_for(&self, method: &TestMethod) -> Result<Configuration, ConfigurationError> {
        let configuration = Configuration::build(
            self.test_class.config(),
            method.config(),
            &self.options.environment,
            &self.base_packages,
            &*self.source,
        )?;
        Ok(configuration.with_instrumented_classes(self.interceptors.classes().cloned()))
    }

    /// Runs every method and reports each outcome to `notifier`.
    pub fn run(&self, notifier: Arc<dyn RunNotifier>) -> RunSummary {
        let notifier = Arc::new(SummaryNotifier::new(notifier));
        let class = &self.test_class;
        let span = tracing::info_span!("run", class = %class.name());
        let _enter = span.enter();

        let mut runnable = Vec::new();
        for (index, method) in class.methods().iter().enumerate() {
            if method.is_ignored() {
                notifier.test_ignored(&class.describe(method));
            } else {
                runnable.push(index);
            }
        }

        let grouping = group_by_required_sandbox(&self.cache, runnable, |&index| {
            self.configuration_for(&class.methods()[index])
        });
        for (index, error) in grouping.rejected {
            let description = class.describe(&class.methods()[index]);
            tracing::warn!(%description, %error, "invalid sandbox configuration");
            notifier.test_started(&description);
            notifier.test_failure(&description, &Fault::Configuration(error));
            notifier.test_finished(&description);
        }

        for group in grouping.groups {
            self.run_group(group, &notifier);
        }

        let summary = notifier.summary();
        tracing::info!(
            passed = summary.passed,
            failed = summary.failed,
            ignored = summary.ignored,
            "test class finished"
        );
        summary
    }

    fn group_registry(&self, configuration: &Configuration) -> Result<SubstitutionRegistry, Fault> {
        let mut extras = Vec::new();
        for class in configuration.extra_substitutes() {
            let def = self
                .source
                .definition(class)
                .ok_or_else(|| ConfigurationError::UnknownSubstitute {
                    class: class.clone(),
                })?;
            extras.push(def);
        }
        let base = self.shared.providers.base_registry()?;
        Ok(base.new_builder().add_substitutes(extras).build()?)
    }

    fn run_group(&self, group: SandboxGroup<usize>, notifier: &Arc<SummaryNotifier>) {
        let SandboxGroup {
            mut sandbox,
            configuration,
            methods,
        } = group;
        let span = tracing::debug_span!("group", methods = methods.len());
        let _enter = span.enter();

        let registry = match self.group_registry(&configuration) {
            Ok(registry) => registry,
            Err(fault) => return self.fail_methods(&methods, &fault, notifier),
        };

        let mut retried = false;
        loop {
            if sandbox.is_shut_down() {
                tracing::debug!(sandbox = %sandbox.id(), "re-obtaining shut-down sandbox");
                sandbox = self.cache.obtain(&configuration);
            }
            let started = Arc::new(AtomicBool::new(false));
            let result = sandbox
                .configure(
                    registry.clone(),
                    self.interceptors.clone(),
                    self.options.picker_context(),
                )
                .and_then(|()| {
                    let execution = GroupExecution {
                        test_class: Arc::clone(&self.test_class),
                        sandbox: Arc::clone(&sandbox),
                        methods: methods.clone(),
                        notifier: Arc::clone(notifier) as Arc<dyn RunNotifier>,
                        shared: Arc::clone(&self.shared),
                    };
                    let flag = Arc::clone(&started);
                    sandbox.run_on_owning_thread(move || {
                        flag.store(true, Ordering::SeqCst);
                        execution.evaluate()
                    })
                });

            let started = started.load(Ordering::SeqCst);
            match result {
                Ok(()) => return,
                Err(Fault::SandboxShutDown { sandbox: id }) if !started && !retried => {
                    tracing::debug!(sandbox = %id, "sandbox shut down before the group started");
                    retried = true;
                }
                Err(fault) if started => {
                    notifier.test_failure(&self.test_class.description(), &fault);
                    return;
                }
                Err(fault) => return self.fail_methods(&methods, &fault, notifier),
            }
        }
    }

    /// Reports `fault` for every method of a group that could not start.
    fn fail_methods(&self, methods: &[usize], fault: &Fault, notifier: &Arc<SummaryNotifier>) {
        for &index in methods {
            let description = self.test_class.describe(&self.test_class.methods()[index]);
            notifier.test_started(&description);
            notifier.test_failure(&description, fault);
            notifier.test_finished(&description);
        }
    }
}

/// One group, evaluated on its sandbox's owning thread.
struct GroupExecution {
    test_class: Arc<TestClass>,
    sandbox: Arc<Sandbox>,
    methods: Vec<usize>,
    notifier: Arc<dyn RunNotifier>,
    shared: Arc<RunnerShared>,
}

impl GroupExecution {
    fn evaluate(self) -> Result<(), Fault> {
        let class_description = self.test_class.description();
        let test_class = self.sandbox.load_isolated(self.test_class.name())?;
        let ctx = TestContext::new(&self.sandbox, &test_class, &class_description);

        let children: Statement<'_> = Box::new(|| {
            for &index in &self.methods {
                self.run_child(&test_class, index);
            }
            Ok(())
        });

        let before_classes: Statement<'_> = Box::new(|| {
            if self
                .shared
                .invoked_before_classes
                .lock()
                .insert(test_class.id())
            {
                for hook in self.test_class.before_class_hooks() {
                    run_hook(hook, &ctx)?;
                }
            }
            children()
        });

        let after_classes: Statement<'_> = Box::new(|| {
            let mut faults: Vec<Fault> = before_classes().err().into_iter().collect();
            for hook in self.test_class.after_class_hooks() {
                if let Err(fault) = run_hook(hook, &ctx) {
                    faults.push(fault);
                }
            }
            Fault::aggregate(faults).map_or(Ok(()), Err)
        });

        let statement = self
            .test_class
            .class_rules()
            .iter()
            .fold(after_classes, |base, rule| {
                rule.apply(base, &class_description)
            });
        statement()
    }

    fn run_child(&self, test_class: &Arc<LoadedClass>, index: usize) {
        let method = &self.test_class.methods()[index];
        let description = self.test_class.describe(method);
        let span = tracing::debug_span!("test", method = method.name());
        let _enter = span.enter();

        self.notifier.test_started(&description);
        if let Err(fault) = self.execute_in_sandbox(test_class, method, &description) {
            tracing::debug!(%fault, "test failed");
            self.notifier.test_failure(&description, &fault);
        }
        self.notifier.test_finished(&description);
    }

    fn execute_in_sandbox(
        &self,
        test_class: &Arc<LoadedClass>,
        method: &TestMethod,
        description: &Description,
    ) -> Result<(), Fault> {
        let perf = PerfStatsCollector::new();
        let initialization = perf.start_event(INITIALIZATION_EVENT);
        let lifecycle = &self.shared.lifecycle;
        let ctx = TestContext::new(&self.sandbox, test_class, description);
        let mut thrown = Vec::new();

        let outcome = match guarded(|| lifecycle.before_test(&ctx)) {
            Ok(()) => {
                initialization.finished(&perf, true);
                perf.measure(TEST_EVENT, || guarded(|| self.method_block(&ctx, method)))
            }
            Err(fault) => {
                initialization.finished(&perf, false);
                Err(fault)
            }
        };
        thrown.extend(outcome.err());
        thrown.extend(guarded(|| lifecycle.after_test(&ctx)).err());
        thrown.extend(guarded(|| lifecycle.finally_after_test(description)).err());

        let metadata = Metadata::new()
            .with("class", &description.class)
            .with("method", method.name())
            .with("sandbox", self.sandbox.id())
            .with("configuration", self.sandbox.configuration().fingerprint());
        report_all(&self.shared.reporters, &metadata, &perf.drain());
        if let Err(fault) = guarded(|| {
            self.shared.providers.reset_all();
            Ok(())
        }) {
            tracing::warn!(%fault, "substitute provider reset failed");
        }

        match Fault::aggregate(thrown) {
            None => Ok(()),
            Some(fault) => Err(fault.map_primary(|primary| {
                self.shared.linkage_faults.stabilize(&self.sandbox, primary)
            })),
        }
    }

    fn method_block(&self, ctx: &TestContext<'_>, method: &TestMethod) -> Result<(), Fault> {
        let class = &*self.test_class;

        let body: Statement<'_> = Box::new(|| invoke_body(ctx, method));
        let before_each: Statement<'_> = Box::new(|| {
            for hook in class.before_each_hooks() {
                run_hook(hook, ctx)?;
            }
            body()
        });
        let after_each: Statement<'_> = Box::new(|| {
            let mut faults: Vec<Fault> = before_each().err().into_iter().collect();
            for hook in class.after_each_hooks() {
                if let Err(fault) = run_hook(hook, ctx) {
                    faults.push(fault);
                }
            }
            Fault::aggregate(faults).map_or(Ok(()), Err)
        });

        let description = ctx.description();
        let statement = class
            .rules()
            .iter()
            .fold(after_each, |base, rule| rule.apply(base, description));
        statement()
    }
}

/// Runs the body, under a deadline when the method has a timeout.
fn invoke_body(ctx: &TestContext<'_>, method: &TestMethod) -> Result<(), Fault> {
    let Some(timeout) = method.timeout() else {
        return run_hook(method.body(), ctx);
    };
    let deadline = Deadline::after(timeout);
    match ctx.with_deadline(deadline, || run_hook(method.body(), ctx)) {
        Err(Fault::Timeout { .. }) => Err(deadline.fault()),
        _ if deadline.expired() => Err(deadline.fault()),
        other => other,
    }
}
