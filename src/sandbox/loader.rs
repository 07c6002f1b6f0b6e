//! Loaded classes and the per-context class tables that own them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::machine::Machine;
use super::SandboxId;
use crate::classes::{ClassDef, ClassName, ClassSource, MethodDef, Value, STATIC_INIT};
use crate::diagnostics::{Fault, LinkageFault, TransformationError};

static NEXT_CLASS_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one loaded copy of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u64);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

/// Which loading context owns a loaded class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassOrigin {
    Host,
    Isolated(SandboxId),
}

/// One copy of a class in one loading context, with its own static fields.
pub struct LoadedClass {
    id: ClassId,
    name: ClassName,
    def: Arc<ClassDef>,
    origin: ClassOrigin,
    statics: Mutex<BTreeMap<String, Value>>,
}

impl LoadedClass {
    fn new(name: ClassName, def: ClassDef, origin: ClassOrigin) -> Self {
        Self {
            id: ClassId(NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            def: Arc::new(def),
            origin,
            statics: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &ClassName {
        &self.name
    }

    pub fn origin(&self) -> ClassOrigin {
        self.origin
    }

    pub fn definition(&self) -> &ClassDef {
        &self.def
    }

    pub(crate) fn shared_definition(&self) -> Arc<ClassDef> {
        Arc::clone(&self.def)
    }

    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.def.method(name)
    }

    /// Reads a static field; unset fields read as nil.
    pub fn get_static(&self, field: &str) -> Value {
        self.statics.lock().get(field).cloned().unwrap_or_default()
    }

    pub fn put_static(&self, field: impl Into<String>, value: Value) {
        self.statics.lock().insert(field.into(), value);
    }
}

impl fmt::Debug for LoadedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedClass")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

enum Slot {
    /// Static initialiser in progress. Recursive references see the partial class.
    Initializing(Arc<LoadedClass>),
    Ready(Arc<LoadedClass>),
    /// Static initialiser failed; the class can never be used in this context.
    Erroneous,
}

/// The classes loaded by one context, keyed by name.
#[derive(Default)]
pub(crate) struct ClassTable {
    slots: Mutex<HashMap<ClassName, Slot>>,
}

impl ClassTable {
    pub(crate) fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    fn lookup(&self, name: &ClassName, machine: &Machine<'_>) -> Option<Result<Arc<LoadedClass>, Fault>> {
        match self.slots.lock().get(name)? {
            Slot::Ready(class) | Slot::Initializing(class) => Some(Ok(Arc::clone(class))),
            Slot::Erroneous => Some(Err(LinkageFault::NoClassDef {
                class: name.clone(),
                trace: machine.trace(),
            }
            .into())),
        }
    }

    /// Returns the loaded class, loading and initialising it on first use.
    ///
    /// `fetch` produces the definition to load, or `None` if the class does not exist. The static
    /// initialiser runs on `machine`, so its failures carry the caller's trace. A failed
    /// initialiser marks the class erroneous, except when it was cut short by a deadline.
    pub(crate) fn load(
        &self,
        name: &ClassName,
        origin: ClassOrigin,
        machine: &mut Machine<'_>,
        fetch: impl FnOnce() -> Result<Option<ClassDef>, Fault>,
    ) -> Result<Arc<LoadedClass>, Fault> {
        if let Some(found) = self.lookup(name, machine) {
            return found;
        }
        let Some(def) = fetch()? else {
            return Err(Fault::ClassNotFound {
                class: name.clone(),
                trace: machine.trace(),
            });
        };
        let class = Arc::new(LoadedClass::new(name.clone(), def, origin));
        {
            let mut slots = self.slots.lock();
            match slots.get(name) {
                Some(Slot::Ready(existing)) | Some(Slot::Initializing(existing)) => {
                    return Ok(Arc::clone(existing));
                }
                Some(Slot::Erroneous) => {
                    return Err(LinkageFault::NoClassDef {
                        class: name.clone(),
                        trace: machine.trace(),
                    }
                    .into());
                }
                None => {
                    slots.insert(name.clone(), Slot::Initializing(Arc::clone(&class)));
                }
            }
        }

        if class.definition().static_init().is_some() {
            if let Err(fault) = machine.invoke(&class, STATIC_INIT, Vec::new()) {
                let mut slots = self.slots.lock();
                if matches!(fault, Fault::Timeout { .. }) {
                    slots.remove(name);
                    return Err(fault);
                }
                slots.insert(name.clone(), Slot::Erroneous);
                drop(slots);
                tracing::debug!(class = %name, ?origin, %fault, "static initialization failed");
                return Err(match fault {
                    linkage @ Fault::Linkage(_) => linkage,
                    cause => LinkageFault::Initializer {
                        class: name.clone(),
                        cause: Box::new(cause),
                        trace: machine.trace(),
                    }
                    .into(),
                });
            }
        }
        self.slots
            .lock()
            .insert(name.clone(), Slot::Ready(Arc::clone(&class)));
        Ok(class)
    }
}

/// The host's own loading context: the copy of every class that no sandbox acquires.
pub struct HostContext {
    source: Arc<dyn ClassSource>,
    table: ClassTable,
}

impl HostContext {
    pub fn new(source: Arc<dyn ClassSource>) -> Self {
        Self {
            source,
            table: ClassTable::default(),
        }
    }

    /// Loads the host copy of `name`, untransformed.
    pub fn load(&self, name: &ClassName) -> Result<Arc<LoadedClass>, Fault> {
        let mut machine = Machine::for_host(self);
        self.link(name, &mut machine)
    }

    pub fn loaded_classes(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn link(
        &self,
        name: &ClassName,
        machine: &mut Machine<'_>,
    ) -> Result<Arc<LoadedClass>, Fault> {
        self.table.load(name, ClassOrigin::Host, machine, || {
            let Some(raw) = self.source.find(name) else {
                return Ok(None);
            };
            let def = raw.decode(name)?;
            if &def.name != name {
                return Err(TransformationError::NameMismatch {
                    expected: name.clone(),
                    found: def.name,
                }
                .into());
            }
            Ok(Some(def))
        })
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("loaded", &self.table.len())
            .finish_non_exhaustive()
    }
}
