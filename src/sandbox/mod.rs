//! # Isolated Environment
//!
//! A [`Sandbox`] owns one isolated loading context built from a [`Configuration`]: a class table
//! whose copies (and static state) are distinct from the host's and from every other sandbox's.
//!
//! ## State machine
//!
//! ```text
//! Configured --configure--> Active --shutdown--> ShutDown
//!     ^                        |
//!     +-- (failed configure) --+  (configure again swaps registry and handler)
//! ```
//!
//! Construction yields a `Configured` sandbox with nothing loaded. [`Sandbox::configure`]
//! installs a substitution registry, builds the dispatch handler and starts the owning thread;
//! only then can classes be loaded or tasks run. Any failure leaves the sandbox `Configured`.
//!
//! ## Owning thread
//!
//! Every task submitted through [`Sandbox::run_on_owning_thread`] runs on the sandbox's single
//! worker with the sandbox installed as the thread's ambient context ([`ambient`]). Tasks are
//! serialised by the worker, so at most one task occupies a sandbox at a time.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::bounded;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::classes::{ClassName, ClassSource, MethodRef, Value};
use crate::config::Configuration;
use crate::diagnostics::Fault;
use crate::registry::{PickerContext, SubstitutionRegistry};
use crate::transform::ClassTransformer;

pub mod ambient;
pub mod dispatch;
pub mod loader;
pub mod machine;
mod worker;

pub use dispatch::{DispatchHandler, Interceptor, Interceptors};
pub use loader::{ClassId, ClassOrigin, HostContext, LoadedClass};
pub use machine::{Deadline, Machine};
pub(crate) use worker::panic_message;

use loader::ClassTable;
use worker::OwningThread;

static NEXT_SANDBOX_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SandboxId(u64);

impl SandboxId {
    fn next() -> Self {
        Self(NEXT_SANDBOX_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Configured,
    Active,
    ShutDown,
}

pub struct Sandbox {
    id: SandboxId,
    configuration: Configuration,
    source: Arc<dyn ClassSource>,
    host: Arc<HostContext>,
    transformer: ClassTransformer,
    table: ClassTable,
    state: Mutex<SandboxState>,
    handler: RwLock<Option<Arc<DispatchHandler>>>,
    worker: Mutex<Option<OwningThread>>,
}

impl Sandbox {
    /// A `Configured` sandbox. Classes come from `source`; classes it does not acquire come from
    /// `host`.
    pub fn new(
        configuration: Configuration,
        source: Arc<dyn ClassSource>,
        host: Arc<HostContext>,
    ) -> Self {
        let id = SandboxId::next();
        tracing::debug!(sandbox = %id, config = %configuration.fingerprint(), "created sandbox");
        Self {
            id,
            configuration,
            source,
            host,
            transformer: ClassTransformer::new(),
            table: ClassTable::default(),
            state: Mutex::new(SandboxState::Configured),
            handler: RwLock::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn state(&self) -> SandboxState {
        *self.state.lock()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state() == SandboxState::ShutDown
    }

    pub fn host(&self) -> &HostContext {
        &self.host
    }

    /// The installed dispatch handler, once configured.
    pub fn handler(&self) -> Option<Arc<DispatchHandler>> {
        self.handler.read().clone()
    }

    pub fn loaded_classes(&self) -> usize {
        self.table.len()
    }

    /// Installs `registry` and builds the dispatch handler from it.
    ///
    /// Must be called before the sandbox becomes ambient, and never from inside its own owning
    /// thread. On failure the sandbox stays in its previous state.
    pub fn configure(
        &self,
        registry: SubstitutionRegistry,
        interceptors: Interceptors,
        picker_context: PickerContext,
    ) -> Result<(), Fault> {
        if ambient::is_ambient(self) {
            return Err(Fault::SandboxUnavailable {
                sandbox: self.id,
                reason: "a sandbox cannot be configured from its own ambient context".into(),
            });
        }
        let mut state = self.state.lock();
        if *state == SandboxState::ShutDown {
            return Err(Fault::SandboxShutDown { sandbox: self.id });
        }

        let mut worker = self.worker.lock();
        if worker.is_none() {
            let spawned = OwningThread::spawn(format!("sandbox-{}", self.id)).map_err(|e| {
                Fault::SandboxUnavailable {
                    sandbox: self.id,
                    reason: format!("failed to start owning thread: {e}"),
                }
            })?;
            *worker = Some(spawned);
        }

        let substitutes = registry.len();
        let handler = Arc::new(DispatchHandler::new(registry, interceptors, picker_context));
        *self.handler.write() = Some(handler);
        let previous = std::mem::replace(&mut *state, SandboxState::Active);
        tracing::debug!(sandbox = %self.id, ?previous, substitutes, "sandbox active");
        Ok(())
    }

    fn active_handler(&self) -> Result<Arc<DispatchHandler>, Fault> {
        match self.state() {
            SandboxState::Active => self.handler().ok_or(Fault::SandboxUnavailable {
                sandbox: self.id,
                reason: "no dispatch handler installed".into(),
            }),
            SandboxState::Configured => Err(Fault::SandboxUnavailable {
                sandbox: self.id,
                reason: "the sandbox has not been configured".into(),
            }),
            SandboxState::ShutDown => Err(Fault::SandboxShutDown { sandbox: self.id }),
        }
    }

    /// A machine executing in this sandbox with the current dispatch handler.
    pub fn machine(&self) -> Result<Machine<'_>, Fault> {
        Ok(Machine::for_sandbox(self, self.active_handler()?))
    }

    /// Loads, transforms and initialises `name` in this sandbox's own context, or returns the
    /// copy loaded earlier. Classes the configuration does not acquire resolve to the host copy.
    pub fn load_isolated(&self, name: &ClassName) -> Result<Arc<LoadedClass>, Fault> {
        self.machine()?.link(name)
    }

    /// Calls `target` as sandboxed code would.
    pub fn invoke(&self, target: &MethodRef, args: Vec<Value>) -> Result<Value, Fault> {
        self.machine()?.call_site(target, args)
    }

    pub(crate) fn link(
        &self,
        name: &ClassName,
        machine: &mut Machine<'_>,
    ) -> Result<Arc<LoadedClass>, Fault> {
        if !self.configuration.should_acquire(name) {
            return self.host.link(name, machine);
        }
        self.table
            .load(name, ClassOrigin::Isolated(self.id), machine, || {
                let Some(raw) = self.source.find(name) else {
                    return Ok(None);
                };
                let (def, _) = self
                    .transformer
                    .transform_def(name, &raw, &self.configuration)?;
                Ok(Some(def))
            })
    }

    /// Whether the caller is running on this sandbox's owning thread.
    pub fn on_owning_thread(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(OwningThread::is_current)
    }

    /// Runs `task` on the owning thread with this sandbox ambient, and waits for its result.
    ///
    /// Calls made from the owning thread itself run inline. A panic in `task` becomes
    /// [`Fault::Panicked`]. Fails fast with [`Fault::SandboxShutDown`] once shut down.
    pub fn run_on_owning_thread<T, F>(self: &Arc<Self>, task: F) -> Result<T, Fault>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Fault> + Send + 'static,
    {
        if self.on_owning_thread() {
            return run_ambient(Arc::clone(self), task);
        }
        self.active_handler()?;
        let sender = self
            .worker
            .lock()
            .as_ref()
            .map(OwningThread::sender)
            .ok_or(Fault::SandboxShutDown { sandbox: self.id })?;

        let (done_tx, done_rx) = bounded(1);
        let sandbox = Arc::clone(self);
        sender
            .send(Box::new(move || {
                let _ = done_tx.send(run_ambient(sandbox, task));
            }))
            .map_err(|_| Fault::SandboxShutDown { sandbox: self.id })?;
        drop(sender);
        done_rx
            .recv()
            .map_err(|_| Fault::SandboxShutDown { sandbox: self.id })?
    }

    /// Marks the sandbox shut down and stops its owning thread once queued tasks finish.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == SandboxState::ShutDown {
                return;
            }
            *state = SandboxState::ShutDown;
        }
        self.handler.write().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
        }
        tracing::debug!(sandbox = %self.id, "sandbox shut down");
    }
}

fn run_ambient<T, F>(sandbox: Arc<Sandbox>, task: F) -> Result<T, Fault>
where
    F: FnOnce() -> Result<T, Fault>,
{
    let _guard = ambient::enter(sandbox);
    panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| {
        Err(Fault::Panicked {
            message: panic_message(payload.as_ref()),
        })
    })
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("loaded", &self.table.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::{ClassDef, ClassPath, Instr, SubstituteInfo};

    fn classpath() -> Arc<ClassPath> {
        Arc::new(
            ClassPath::new()
                .with(ClassDef::new("app.State").with_method(
                    "bump",
                    vec![
                        Instr::GetStatic { field: "n".into() },
                        Instr::Push { value: Value::Int(1) },
                        Instr::Add,
                        Instr::PutStatic { field: "n".into() },
                        Instr::GetStatic { field: "n".into() },
                    ],
                ))
                .unwrap()
                .with(ClassDef::new("platform.Clock").with_method(
                    "now",
                    vec![Instr::Push { value: Value::Int(1) }],
                ))
                .unwrap()
                .with(
                    ClassDef::new("shadows.ShadowClock")
                        .substituting(SubstituteInfo::replacing("platform.Clock"))
                        .with_method("now", vec![Instr::Push { value: Value::Int(99) }]),
                )
                .unwrap(),
        )
    }

    fn config() -> Configuration {
        Configuration::builder()
            .instrument_package("platform", "test")
            .unwrap()
            .build()
    }

    fn active(source: Arc<ClassPath>, host: Arc<HostContext>) -> Arc<Sandbox> {
        let sandbox = Arc::new(Sandbox::new(config(), source.clone(), host));
        let registry = SubstitutionRegistry::empty()
            .new_builder()
            .add_substitutes(source.definition(&ClassName::new("shadows.ShadowClock")))
            .build()
            .unwrap();
        sandbox
            .configure(registry, Interceptors::new(), PickerContext::default())
            .unwrap();
        sandbox
    }

    #[test]
    fn test_state_transitions() {
        let source = classpath();
        let host = Arc::new(HostContext::new(source.clone()));
        let sandbox = Arc::new(Sandbox::new(config(), source, host));
        assert_eq!(sandbox.state(), SandboxState::Configured);
        assert!(matches!(
            sandbox.load_isolated(&ClassName::new("app.State")),
            Err(Fault::SandboxUnavailable { .. })
        ));
        sandbox
            .configure(SubstitutionRegistry::empty(), Interceptors::new(), PickerContext::default())
            .unwrap();
        assert_eq!(sandbox.state(), SandboxState::Active);
        sandbox.shutdown();
        assert_eq!(sandbox.state(), SandboxState::ShutDown);
        let err = sandbox.run_on_owning_thread(|| Ok(())).unwrap_err();
        assert_eq!(err, Fault::SandboxShutDown { sandbox: sandbox.id() });
        assert!(sandbox
            .configure(SubstitutionRegistry::empty(), Interceptors::new(), PickerContext::default())
            .is_err());
    }

    #[test]
    fn test_isolated_copies_are_distinct_from_host() {
        let source = classpath();
        let host = Arc::new(HostContext::new(source.clone()));
        let a = active(source.clone(), host.clone());
        let b = active(source, host.clone());
        let bump = MethodRef::new("app.State", "bump");

        assert_eq!(a.invoke(&bump, vec![]).unwrap(), Value::Int(1));
        assert_eq!(a.invoke(&bump, vec![]).unwrap(), Value::Int(2));
        assert_eq!(b.invoke(&bump, vec![]).unwrap(), Value::Int(1));

        let in_a = a.load_isolated(&ClassName::new("app.State")).unwrap();
        let in_host = host.load(&ClassName::new("app.State")).unwrap();
        assert_ne!(in_a.id(), in_host.id());
        assert_eq!(in_host.get_static("n"), Value::Nil);
        assert_eq!(in_a.origin(), ClassOrigin::Isolated(a.id()));
    }

    #[test]
    fn test_intercepted_calls_reach_substitute() {
        let source = classpath();
        let sandbox = active(source.clone(), Arc::new(HostContext::new(source)));
        let now = MethodRef::new("platform.Clock", "now");
        assert_eq!(sandbox.invoke(&now, vec![]).unwrap(), Value::Int(99));

        sandbox
            .configure(
                SubstitutionRegistry::empty(),
                Interceptors::new().returning(now.clone(), Value::Int(7)),
                PickerContext::default(),
            )
            .unwrap();
        assert_eq!(sandbox.invoke(&now, vec![]).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_tasks_run_on_one_thread_with_sandbox_ambient() {
        let source = classpath();
        let sandbox = active(source.clone(), Arc::new(HostContext::new(source)));
        assert!(ambient::current().is_none());

        let expected = sandbox.id();
        let (first_thread, saw_ambient) = sandbox
            .run_on_owning_thread(move || {
                let ambient_id = ambient::current().map(|s| s.id());
                Ok((std::thread::current().id(), ambient_id == Some(expected)))
            })
            .unwrap();
        assert!(saw_ambient);
        assert_ne!(first_thread, std::thread::current().id());

        let inner = Arc::clone(&sandbox);
        let nested_thread = sandbox
            .run_on_owning_thread(move || {
                inner.run_on_owning_thread(|| Ok(std::thread::current().id()))
            })
            .unwrap();
        assert_eq!(first_thread, nested_thread);
        assert!(ambient::current().is_none());
    }

    #[test]
    fn test_panics_become_faults_and_context_is_restored() {
        let source = classpath();
        let sandbox = active(source.clone(), Arc::new(HostContext::new(source)));
        let err = sandbox
            .run_on_owning_thread(|| -> Result<(), Fault> { panic!("exploded") })
            .unwrap_err();
        assert_eq!(
            err,
            Fault::Panicked {
                message: "exploded".into()
            }
        );
        let after = sandbox
            .run_on_owning_thread(|| Ok(ambient::current().is_some()))
            .unwrap();
        assert!(after);
    }

    #[test]
    fn test_configure_is_rejected_from_own_ambient_context() {
        let source = classpath();
        let sandbox = active(source.clone(), Arc::new(HostContext::new(source)));
        let inner = Arc::clone(&sandbox);
        let err = sandbox
            .run_on_owning_thread(move || {
                Ok(inner.configure(
                    SubstitutionRegistry::empty(),
                    Interceptors::new(),
                    PickerContext::default(),
                ))
            })
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Fault::SandboxUnavailable { .. }));
        assert_eq!(sandbox.state(), SandboxState::Active);
    }
}
