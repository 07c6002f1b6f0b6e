//! # Shadowbox
//!
//! Runs every test method inside an isolated sandbox: a class-loading context with its own copy
//! of every class it acquires, where calls into intercepted classes are routed to substitutes
//! and interceptors instead of the real implementation.
//!
//! ## Layout
//!
//! - [`classes`]: the class model, its encoded form, and class sources.
//! - [`config`]: per-method sandbox configurations and process-wide overrides.
//! - [`registry`]: substitution registries, pickers, and substitute-provider discovery.
//! - [`transform`]: rewrites call sites of intercepted classes into dispatch sites.
//! - [`sandbox`]: isolated loading contexts, the dispatch handler, and owning threads.
//! - [`cache`]: the bounded sandbox cache and grouping of methods by sandbox.
//! - [`runner`]: the lifecycle orchestrator, notifiers, and runner options.
//! - [`perf`]: per-method timing collection and reporters.
//! - [`suite`]: declarative YAML suites.
//! - [`cli`]: the `shadowbox` binary.

pub mod cache;
pub mod classes;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod perf;
pub mod registry;
pub mod runner;
pub mod sandbox;
pub mod suite;
pub mod transform;

pub use cache::{group_by_required_sandbox, SandboxCache};
pub use classes::{ClassDef, ClassName, ClassPath, ClassSource, Instr, MethodRef, Value};
pub use config::{Configuration, SandboxConfig};
pub use diagnostics::{Fault, FaultKind};
pub use registry::{SubstituteProviders, SubstitutionRegistry};
pub use runner::{SandboxTestRunner, TestClass, TestMethod};
pub use sandbox::Sandbox;
