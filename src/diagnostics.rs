//! # Shadowbox Fault Taxonomy
//!
//! Every failure the harness can observe while configuring, loading or running a test is a
//! [`Fault`]. Faults are plain data (`Clone + PartialEq`) so the runner can cache the first
//! linkage fault of a sandbox and hand it back verbatim later, and so tests can compare faults
//! structurally.
//!
//! ## Taxonomy
//!
//! - [`ConfigurationError`]: malformed inclusion/exclusion input. Fails the affected method only.
//! - [`TransformationError`]: a class cannot be rewritten to satisfy its configuration.
//! - [`LinkageFault`]: a sandboxed class failed to initialise, or a reference to it cannot be
//!   linked.
//! - [`Fault::Timeout`]: the test body ran past its deadline.
//! - [`Fault::Aggregate`]: several lifecycle stages faulted; the first is primary.
//!
//! All faults implement [`miette::Diagnostic`] so the CLI can render them with codes and help.

use std::fmt;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::classes::ClassName;
use crate::sandbox::SandboxId;

/// One frame of a sandboxed call stack, innermost first when part of a trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StackFrame {
    pub class: ClassName,
    pub method: String,
}

impl StackFrame {
    pub fn new(class: ClassName, method: impl Into<String>) -> Self {
        Self {
            class,
            method: method.into(),
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}.{}", self.class, self.method)
    }
}

/// Malformed sandbox declarations or process-wide overrides.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum ConfigurationError {
    #[error("malformed package name {package:?} in {origin}")]
    #[diagnostic(
        code(shadowbox::config::package),
        help("package prefixes are dotted identifiers such as `com.example.`")
    )]
    MalformedPackage { package: String, origin: String },

    #[error("malformed class exclusion pattern {pattern:?}: {reason}")]
    #[diagnostic(code(shadowbox::config::pattern))]
    MalformedPattern { pattern: String, reason: String },

    #[error("substitute class {class} could not be found")]
    #[diagnostic(
        code(shadowbox::config::unknown_substitute),
        help("substitute classes must be present on the classpath or provided by a substitute provider")
    )]
    UnknownSubstitute { class: ClassName },

    #[error("{class} is not a substitute: it does not declare which class it replaces")]
    #[diagnostic(
        code(shadowbox::config::not_a_substitute),
        help("add a `substitute.replaces` entry to the class definition")
    )]
    NotASubstitute { class: ClassName },

    #[error("malformed runner option {option}: {reason}")]
    #[diagnostic(code(shadowbox::config::option))]
    MalformedOption { option: String, reason: String },
}

/// A class definition that cannot be rewritten for its configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum TransformationError {
    #[error("definition of {class} cannot be decoded: {reason}")]
    #[diagnostic(code(shadowbox::transform::decode))]
    Undecodable { class: ClassName, reason: String },

    #[error("requested {expected} but the definition declares {found}")]
    #[diagnostic(code(shadowbox::transform::name_mismatch))]
    NameMismatch { expected: ClassName, found: ClassName },

    #[error("{class} dispatches to {target}, which this configuration does not intercept")]
    #[diagnostic(
        code(shadowbox::transform::conflicting_dispatch),
        help("the definition was instrumented under a different configuration")
    )]
    ConflictingDispatch { class: ClassName, target: ClassName },

    #[error("transformed definition of {class} cannot be encoded: {reason}")]
    #[diagnostic(code(shadowbox::transform::encode))]
    Unencodable { class: ClassName, reason: String },
}

/// Failures to link or initialise a class inside a sandbox.
#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
pub enum LinkageFault {
    /// The static initialiser of `class` failed. This is the detailed, first-occurrence form.
    #[error("error initializing {class}: {cause}")]
    #[diagnostic(code(shadowbox::linkage::initializer))]
    Initializer {
        class: ClassName,
        cause: Box<Fault>,
        trace: Vec<StackFrame>,
    },

    /// A later reference to a class whose initialiser already failed in this sandbox.
    #[error("could not initialize class {class}")]
    #[diagnostic(
        code(shadowbox::linkage::no_class_def),
        help("an earlier static initialization of this class failed in the same sandbox")
    )]
    NoClassDef {
        class: ClassName,
        trace: Vec<StackFrame>,
    },

    #[error("{class}.{method} does not exist")]
    #[diagnostic(code(shadowbox::linkage::no_such_method))]
    NoSuchMethod {
        class: ClassName,
        method: String,
        trace: Vec<StackFrame>,
    },
}

impl LinkageFault {
    pub fn class(&self) -> &ClassName {
        match self {
            LinkageFault::Initializer { class, .. }
            | LinkageFault::NoClassDef { class, .. }
            | LinkageFault::NoSuchMethod { class, .. } => class,
        }
    }

    pub fn trace(&self) -> &[StackFrame] {
        match self {
            LinkageFault::Initializer { trace, .. }
            | LinkageFault::NoClassDef { trace, .. }
            | LinkageFault::NoSuchMethod { trace, .. } => trace,
        }
    }

    pub fn is_shallow(&self) -> bool {
        matches!(self, LinkageFault::NoClassDef { .. })
    }
}

/// Unified fault type for everything that can go wrong inside the harness.
#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
pub enum Fault {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transformation(#[from] TransformationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Linkage(#[from] LinkageFault),

    /// Raised by sandboxed code or by test code.
    #[error("{message}")]
    #[diagnostic(code(shadowbox::thrown))]
    Thrown {
        message: String,
        trace: Vec<StackFrame>,
    },

    #[error("class {class} not found")]
    #[diagnostic(code(shadowbox::class_not_found))]
    ClassNotFound {
        class: ClassName,
        trace: Vec<StackFrame>,
    },

    #[error("test timed out after {timeout_ms} milliseconds")]
    #[diagnostic(code(shadowbox::timeout))]
    Timeout { timeout_ms: u64 },

    #[error("test code panicked: {message}")]
    #[diagnostic(code(shadowbox::panicked))]
    Panicked { message: String },

    #[error("sandbox {sandbox} has been shut down")]
    #[diagnostic(
        code(shadowbox::sandbox::shut_down),
        help("obtain a replacement sandbox from the sandbox cache")
    )]
    SandboxShutDown { sandbox: SandboxId },

    #[error("sandbox {sandbox} is unavailable: {reason}")]
    #[diagnostic(code(shadowbox::sandbox::unavailable))]
    SandboxUnavailable { sandbox: SandboxId, reason: String },

    #[error("substitute providers cannot be discovered while sandbox {sandbox} is ambient")]
    #[diagnostic(
        code(shadowbox::sandbox::discovery),
        help("query the base registry before entering the sandbox's owning thread")
    )]
    DiscoveryWhileAmbient { sandbox: SandboxId },

    #[error("I/O error: {message}")]
    #[diagnostic(code(shadowbox::io))]
    Io { message: String },

    #[error("{primary}{}", render_suppressed(.suppressed))]
    #[diagnostic(code(shadowbox::aggregate))]
    Aggregate {
        primary: Box<Fault>,
        suppressed: Vec<Fault>,
    },
}

fn render_suppressed(suppressed: &[Fault]) -> String {
    suppressed
        .iter()
        .map(|fault| format!("\n  suppressed: {fault}"))
        .collect()
}

impl Fault {
    /// A plain failure raised by test code, e.g. a failed check.
    pub fn failed(message: impl Into<String>) -> Self {
        Fault::Thrown {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Combines faults collected from successive lifecycle stages.
    ///
    /// The first fault becomes primary and every other fault is attached as suppressed. Nested
    /// aggregates are flattened so suppressed faults are never lost or buried.
    pub fn aggregate(faults: Vec<Fault>) -> Option<Fault> {
        let mut flat = Vec::with_capacity(faults.len());
        for fault in faults {
            match fault {
                Fault::Aggregate {
                    primary,
                    suppressed,
                } => {
                    flat.push(*primary);
                    flat.extend(suppressed);
                }
                other => flat.push(other),
            }
        }
        let mut iter = flat.into_iter();
        let primary = iter.next()?;
        let suppressed: Vec<Fault> = iter.collect();
        if suppressed.is_empty() {
            Some(primary)
        } else {
            Some(Fault::Aggregate {
                primary: Box::new(primary),
                suppressed,
            })
        }
    }

    pub fn primary(&self) -> &Fault {
        match self {
            Fault::Aggregate { primary, .. } => primary,
            other => other,
        }
    }

    pub fn suppressed(&self) -> &[Fault] {
        match self {
            Fault::Aggregate { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Replaces the primary fault while keeping the suppressed ones.
    pub fn map_primary(self, f: impl FnOnce(Fault) -> Fault) -> Fault {
        match self {
            Fault::Aggregate {
                primary,
                suppressed,
            } => Fault::Aggregate {
                primary: Box::new(f(*primary)),
                suppressed,
            },
            other => f(other),
        }
    }

    pub fn as_linkage(&self) -> Option<&LinkageFault> {
        match self.primary() {
            Fault::Linkage(linkage) => Some(linkage),
            _ => None,
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self.primary() {
            Fault::Configuration(_) => FaultKind::Configuration,
            Fault::Transformation(_) => FaultKind::Transformation,
            Fault::Linkage(_) => FaultKind::Linkage,
            Fault::Thrown { .. } => FaultKind::Thrown,
            Fault::ClassNotFound { .. } => FaultKind::ClassNotFound,
            Fault::Timeout { .. } => FaultKind::Timeout,
            Fault::Panicked { .. } => FaultKind::Panicked,
            Fault::SandboxShutDown { .. }
            | Fault::SandboxUnavailable { .. }
            | Fault::DiscoveryWhileAmbient { .. } => FaultKind::Sandbox,
            Fault::Io { .. } => FaultKind::Io,
            Fault::Aggregate { .. } => FaultKind::Thrown,
        }
    }
}

impl From<std::io::Error> for Fault {
    fn from(error: std::io::Error) -> Self {
        Fault::Io {
            message: error.to_string(),
        }
    }
}

/// Type-safe fault classification, used by suite expectations and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Configuration,
    Transformation,
    Linkage,
    Thrown,
    ClassNotFound,
    Timeout,
    Panicked,
    Sandbox,
    Io,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Configuration => "configuration",
            FaultKind::Transformation => "transformation",
            FaultKind::Linkage => "linkage",
            FaultKind::Thrown => "thrown",
            FaultKind::ClassNotFound => "class_not_found",
            FaultKind::Timeout => "timeout",
            FaultKind::Panicked => "panicked",
            FaultKind::Sandbox => "sandbox",
            FaultKind::Io => "io",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
