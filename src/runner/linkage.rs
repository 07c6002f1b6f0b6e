//! Stabilises linkage faults across the methods of one sandbox.
//!
//! Once a static initialiser fails, every later reference to the class in the same sandbox only
//! reports a terse "could not initialize" fault. The first linkage fault seen in a sandbox is
//! kept; a later shallow fault whose top frame appears in the kept trace is replaced by it, so
//! every affected method reports the detailed cause.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::diagnostics::{Fault, LinkageFault};
use crate::sandbox::{Sandbox, SandboxId};

#[derive(Default)]
pub struct LinkageFaultCache {
    first: Mutex<HashMap<SandboxId, (Weak<Sandbox>, LinkageFault)>>,
}

impl LinkageFaultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fault to report for `fault`, raised by a method run in `sandbox`.
    pub fn stabilize(&self, sandbox: &Arc<Sandbox>, fault: Fault) -> Fault {
        let Fault::Linkage(linkage) = fault else {
            return fault;
        };
        let mut first = self.first.lock();
        first.retain(|_, (owner, _)| owner.strong_count() > 0);

        let Some((_, cached)) = first.get(&sandbox.id()) else {
            first.insert(sandbox.id(), (Arc::downgrade(sandbox), linkage.clone()));
            return Fault::Linkage(linkage);
        };

        if linkage.is_shallow() {
            if let Some(top) = linkage.trace().first() {
                if cached.trace().contains(top) {
                    tracing::debug!(
                        sandbox = %sandbox.id(),
                        class = %linkage.class(),
                        "replacing shallow linkage fault with the first one seen"
                    );
                    return Fault::Linkage(cached.clone());
                }
            }
        }
        Fault::Linkage(linkage)
    }

    /// The first linkage fault recorded for `sandbox`.
    pub fn first_fault(&self, sandbox: SandboxId) -> Option<LinkageFault> {
        self.first.lock().get(&sandbox).map(|(_, fault)| fault.clone())
    }

    /// Sandboxes with a recorded fault that are still alive.
    pub fn len(&self) -> usize {
        self.first
            .lock()
            .values()
            .filter(|(owner, _)| owner.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
