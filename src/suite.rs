//! # Declarative Suites
//!
//! A suite is a YAML file describing one test class whose hooks and methods invoke classpath
//! methods. Suites let the harness be driven without writing Rust:
//!
//! ```yaml
//! class: app.CounterTest
//! config:
//!   instrumented_packages: [app.]
//! before_class:
//!   - invoke: app.Counter.reset
//! tests:
//!   - name: bumps
//!     invoke: app.Counter.bump
//!     expect: 1
//!   - name: rejects_negative
//!     invoke: app.Counter.add
//!     args: [-1]
//!     expect_fault: thrown
//!   - name: too_slow
//!     invoke: app.Counter.slow
//!     timeout_ms: 10
//!     expect_fault: timeout
//!   - name: later
//!     invoke: app.Counter.bump
//!     skip: true
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::classes::{ClassDef, ClassName, Value};
use crate::config::SandboxConfig;
use crate::diagnostics::{Fault, FaultKind};
use crate::runner::{check_eq, Description, Statement, TestClass, TestContext, TestMethod, TestRule};

#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum SuiteError {
    #[error("cannot read suite {path}: {message}")]
    #[diagnostic(code(shadowbox::suite::io))]
    Io { path: PathBuf, message: String },

    #[error("malformed suite {path}: {reason}")]
    #[diagnostic(
        code(shadowbox::suite::malformed),
        help("a suite needs a `class` and a list of `tests`, each with a `name` and an `invoke`")
    )]
    Malformed { path: PathBuf, reason: String },
}

/// A method call written as `package.Class.method` with literal arguments.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Call {
    pub invoke: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteTest {
    pub name: String,
    pub invoke: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// The value the call must return.
    #[serde(default)]
    pub expect: Option<Value>,
    /// The kind of fault the test must fail with.
    #[serde(default)]
    pub expect_fault: Option<FaultKind>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub config: Option<SandboxConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Suite {
    pub class: ClassName,
    #[serde(default)]
    pub config: Option<SandboxConfig>,
    /// Definition of the test class itself, e.g. to give it a static initialiser.
    #[serde(default)]
    pub definition: Option<ClassDef>,
    #[serde(default)]
    pub before_class: Vec<Call>,
    #[serde(default)]
    pub after_class: Vec<Call>,
    #[serde(default)]
    pub before_each: Vec<Call>,
    #[serde(default)]
    pub after_each: Vec<Call>,
    pub tests: Vec<SuiteTest>,
}

impl Suite {
    pub fn from_yaml_str(yaml: &str, path: &Path) -> Result<Self, SuiteError> {
        serde_yaml::from_str(yaml).map_err(|e| SuiteError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Builds the test class this suite describes.
    pub fn to_test_class(&self) -> TestClass {
        let mut class = TestClass::new(self.class.clone());
        if let Some(config) = &self.config {
            class = class.with_config(config.clone());
        }
        if let Some(definition) = &self.definition {
            class = class.with_definition(definition.clone());
        }
        for call in &self.before_class {
            class = class.before_class(call_hook(call));
        }
        for call in &self.after_class {
            class = class.after_class(call_hook(call));
        }
        for call in &self.before_each {
            class = class.before_each(call_hook(call));
        }
        for call in &self.after_each {
            class = class.after_each(call_hook(call));
        }

        let expectations: HashMap<String, FaultKind> = self
            .tests
            .iter()
            .filter_map(|test| Some((test.name.clone(), test.expect_fault?)))
            .collect();
        if !expectations.is_empty() {
            class = class.rule(Arc::new(ExpectFault { expectations }));
        }

        for test in &self.tests {
            class = class.test(test_method(test));
        }
        class
    }
}

fn call_hook(call: &Call) -> impl Fn(&TestContext<'_>) -> Result<(), Fault> + Send + Sync {
    let Call { invoke, args } = call.clone();
    move |ctx| ctx.invoke(&invoke, args.clone()).map(|_| ())
}

fn test_method(test: &SuiteTest) -> TestMethod {
    let invoke = test.invoke.clone();
    let args = test.args.clone();
    let expect = test.expect.clone();
    let mut method = TestMethod::new(test.name.clone(), move |ctx| {
        let actual = ctx.invoke(&invoke, args.clone())?;
        match &expect {
            Some(expected) => check_eq(actual, expected.clone()),
            None => Ok(()),
        }
    });
    if let Some(config) = &test.config {
        method = method.with_config(config.clone());
    }
    if let Some(timeout_ms) = test.timeout_ms {
        method = method.with_timeout(Duration::from_millis(timeout_ms));
    }
    if test.skip {
        method = method.ignored();
    }
    method
}

/// Turns an expected fault into a pass, and its absence into a failure.
///
/// Applied as a method rule so it also sees timeouts and hook faults.
struct ExpectFault {
    expectations: HashMap<String, FaultKind>,
}

impl TestRule for ExpectFault {
    fn apply<'a>(&'a self, base: Statement<'a>, description: &'a Description) -> Statement<'a> {
        let Some(expected) = description
            .method
            .as_ref()
            .and_then(|method| self.expectations.get(method))
            .copied()
        else {
            return base;
        };
        Box::new(move || match base() {
            Err(fault) if fault.kind() == expected => Ok(()),
            Err(fault) => Err(Fault::failed(format!(
                "expected a {expected} fault but got {}: {fault}",
                fault.kind()
            ))),
            Ok(()) => Err(Fault::failed(format!(
                "expected a {expected} fault but the test passed"
            ))),
        })
    }
}

/// Every `.yaml`/`.yml` file under `root`, sorted.
pub fn discover_suite_files<P: AsRef<Path>>(root: P) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file()
                && e.path()
                    .extension()
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}

pub fn load_suite(path: &Path) -> Result<Suite, SuiteError> {
    let text = fs::read_to_string(path).map_err(|e| SuiteError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Suite::from_yaml_str(&text, path)
}
