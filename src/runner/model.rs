//! Test classes, test methods, rules, and the context test code runs with.

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::classes::{ClassDef, ClassName, MethodRef, Value};
use crate::config::SandboxConfig;
use crate::diagnostics::{Fault, StackFrame};
use crate::sandbox::{panic_message, Deadline, LoadedClass, Machine, Sandbox};

/// Test code: a hook, or the body of a test method.
pub type HookFn = Arc<dyn Fn(&TestContext<'_>) -> Result<(), Fault> + Send + Sync>;

/// A deferred piece of lifecycle work.
pub type Statement<'a> = Box<dyn FnOnce() -> Result<(), Fault> + 'a>;

/// Wraps a statement with extra behaviour, like a JUnit rule.
///
/// Rules listed later wrap rules listed earlier, so the last rule is outermost.
pub trait TestRule: Send + Sync {
    fn apply<'a>(&'a self, base: Statement<'a>, description: &'a Description) -> Statement<'a>;
}

/// Names a test class, or one method of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Description {
    pub class: ClassName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl Description {
    pub fn for_class(class: ClassName) -> Self {
        Self {
            class,
            method: None,
        }
    }

    pub fn for_method(class: ClassName, method: impl Into<String>) -> Self {
        Self {
            class,
            method: Some(method.into()),
        }
    }

    pub fn is_method(&self) -> bool {
        self.method.is_some()
    }

    fn frame(&self) -> StackFrame {
        StackFrame::new(
            self.class.clone(),
            self.method.as_deref().unwrap_or("<class>"),
        )
    }
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(method) => write!(f, "{}({})", method, self.class),
            None => write!(f, "{}", self.class),
        }
    }
}

#[derive(Clone)]
pub struct TestMethod {
    name: String,
    config: Option<SandboxConfig>,
    timeout: Option<Duration>,
    ignored: bool,
    body: HookFn,
}

impl TestMethod {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&TestContext<'_>) -> Result<(), Fault> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            config: None,
            timeout: None,
            ignored: false,
            body: Arc::new(body),
        }
    }

    pub fn with_config(mut self, config: SandboxConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Fails the method if its body runs longer than `timeout`. Hooks are not timed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn ignored(mut self) -> Self {
        self.ignored = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> Option<&SandboxConfig> {
        self.config.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    pub(crate) fn body(&self) -> &HookFn {
        &self.body
    }
}

impl fmt::Debug for TestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestMethod")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("ignored", &self.ignored)
            .finish_non_exhaustive()
    }
}

/// A test class: its sandbox declaration, hooks, rules and methods.
///
/// The class itself is loaded inside every sandbox it runs in. If no definition is supplied and
/// the classpath has none, an empty definition is used.
#[derive(Clone)]
pub struct TestClass {
    name: ClassName,
    config: Option<SandboxConfig>,
    definition: Option<ClassDef>,
    before_class: Vec<HookFn>,
    after_class: Vec<HookFn>,
    before_each: Vec<HookFn>,
    after_each: Vec<HookFn>,
    class_rules: Vec<Arc<dyn TestRule>>,
    rules: Vec<Arc<dyn TestRule>>,
    methods: Vec<TestMethod>,
}

impl TestClass {
    pub fn new(name: impl Into<ClassName>) -> Self {
        Self {
            name: name.into(),
            config: None,
            definition: None,
            before_class: Vec::new(),
            after_class: Vec::new(),
            before_each: Vec::new(),
            after_each: Vec::new(),
            class_rules: Vec::new(),
            rules: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: SandboxConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Supplies the definition loaded for this class, overriding the classpath.
    pub fn with_definition(mut self, definition: ClassDef) -> Self {
        self.definition = Some(definition);
        self
    }

    pub fn before_class<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TestContext<'_>) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.before_class.push(Arc::new(hook));
        self
    }

    pub fn after_class<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TestContext<'_>) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.after_class.push(Arc::new(hook));
        self
    }

    pub fn before_each<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TestContext<'_>) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.before_each.push(Arc::new(hook));
        self
    }

    pub fn after_each<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TestContext<'_>) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.after_each.push(Arc::new(hook));
        self
    }

    pub fn class_rule(mut self, rule: Arc<dyn TestRule>) -> Self {
        self.class_rules.push(rule);
        self
    }

    pub fn rule(mut self, rule: Arc<dyn TestRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn test(mut self, method: TestMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn name(&self) -> &ClassName {
        &self.name
    }

    pub fn config(&self) -> Option<&SandboxConfig> {
        self.config.as_ref()
    }

    pub fn definition(&self) -> Option<&ClassDef> {
        self.definition.as_ref()
    }

    pub fn methods(&self) -> &[TestMethod] {
        &self.methods
    }

    pub fn description(&self) -> Description {
        Description::for_class(self.name.clone())
    }

    pub fn describe(&self, method: &TestMethod) -> Description {
        Description::for_method(self.name.clone(), method.name())
    }

    pub(crate) fn before_class_hooks(&self) -> &[HookFn] {
        &self.before_class
    }

    pub(crate) fn after_class_hooks(&self) -> &[HookFn] {
        &self.after_class
    }

    pub(crate) fn before_each_hooks(&self) -> &[HookFn] {
        &self.before_each
    }

    pub(crate) fn after_each_hooks(&self) -> &[HookFn] {
        &self.after_each
    }

    pub(crate) fn class_rules(&self) -> &[Arc<dyn TestRule>] {
        &self.class_rules
    }

    pub(crate) fn rules(&self) -> &[Arc<dyn TestRule>] {
        &self.rules
    }
}

impl fmt::Debug for TestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestClass")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

/// What test code sees while it runs inside a sandbox.
///
/// Calls made through the context behave like call sites in the isolated copy of the test
/// class: calls into intercepted classes go through the sandbox's dispatch handler.
pub struct TestContext<'a> {
    sandbox: &'a Arc<Sandbox>,
    test_class: &'a Arc<LoadedClass>,
    description: &'a Description,
    deadline: Cell<Option<Deadline>>,
}

impl<'a> TestContext<'a> {
    pub(crate) fn new(
        sandbox: &'a Arc<Sandbox>,
        test_class: &'a Arc<LoadedClass>,
        description: &'a Description,
    ) -> Self {
        Self {
            sandbox,
            test_class,
            description,
            deadline: Cell::new(None),
        }
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        self.sandbox
    }

    /// The isolated copy of the test class.
    pub fn test_class(&self) -> &Arc<LoadedClass> {
        self.test_class
    }

    pub fn description(&self) -> &Description {
        self.description
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline.get()
    }

    /// Fails with a timeout fault once the body's deadline has passed.
    pub fn checkpoint(&self) -> Result<(), Fault> {
        match self.deadline.get() {
            Some(deadline) => deadline.check(),
            None => Ok(()),
        }
    }

    fn machine(&self) -> Result<Machine<'a>, Fault> {
        Ok(self
            .sandbox
            .machine()?
            .with_deadline(self.deadline.get())
            .with_caller(self.description.frame()))
    }

    /// Loads a class in the sandbox.
    pub fn load(&self, class: &str) -> Result<Arc<LoadedClass>, Fault> {
        self.machine()?.link(&ClassName::new(class))
    }

    /// Calls a method given as `package.Class.method`.
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, Fault> {
        let target = MethodRef::parse(method)
            .ok_or_else(|| Fault::failed(format!("malformed method reference {method:?}")))?;
        self.call(&target, args)
    }

    pub fn call(&self, target: &MethodRef, args: Vec<Value>) -> Result<Value, Fault> {
        self.machine()?.call_site(target, args)
    }

    pub fn get_static(&self, class: &str, field: &str) -> Result<Value, Fault> {
        Ok(self.load(class)?.get_static(field))
    }

    pub fn put_static(&self, class: &str, field: &str, value: Value) -> Result<(), Fault> {
        self.load(class)?.put_static(field, value);
        Ok(())
    }

    /// Runs `f` with `deadline` applied to every call made through this context.
    pub(crate) fn with_deadline<T>(&self, deadline: Deadline, f: impl FnOnce() -> T) -> T {
        let prior = self.deadline.replace(Some(deadline));
        let out = f();
        self.deadline.set(prior);
        out
    }
}

/// Runs `f`, turning a panic into [`Fault::Panicked`].
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T, Fault>) -> Result<T, Fault> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(Fault::Panicked {
            message: panic_message(payload.as_ref()),
        })
    })
}

/// Runs test code, turning a panic into [`Fault::Panicked`].
pub(crate) fn run_hook(hook: &HookFn, ctx: &TestContext<'_>) -> Result<(), Fault> {
    guarded(|| hook(ctx))
}

/// Helper for asserting inside test code.
pub fn check(condition: bool, message: impl Into<String>) -> Result<(), Fault> {
    if condition {
        Ok(())
    } else {
        Err(Fault::failed(message))
    }
}

/// Asserts equality inside test code.
pub fn check_eq<T: PartialEq + fmt::Debug>(actual: T, expected: T) -> Result<(), Fault> {
    if actual == expected {
        Ok(())
    } else {
        Err(Fault::failed(format!(
            "expected {expected:?} but was {actual:?}"
        )))
    }
}
