//! The dispatch handler every rewritten call site goes through.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::classes::{ClassName, MethodRef, Value};
use crate::diagnostics::Fault;
use crate::registry::{PickerContext, SubstitutionRegistry};

/// Replaces a single method at every intercepted call site, ahead of any substitute.
pub type Interceptor = Arc<dyn Fn(&[Value]) -> Result<Value, Fault> + Send + Sync>;

/// Method interceptors keyed by the intercepted method.
#[derive(Clone, Default)]
pub struct Interceptors {
    by_method: BTreeMap<MethodRef, Interceptor>,
}

impl Interceptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, method: MethodRef, interceptor: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        self.by_method.insert(method, Arc::new(interceptor));
        self
    }

    /// Intercepts `method` with a function that always returns `value`.
    pub fn returning(self, method: MethodRef, value: Value) -> Self {
        self.with(method, move |_| Ok(value.clone()))
    }

    pub fn get(&self, method: &MethodRef) -> Option<&Interceptor> {
        self.by_method.get(method)
    }

    /// Classes with at least one intercepted method.
    pub fn classes(&self) -> impl Iterator<Item = &ClassName> {
        self.by_method.keys().map(|method| &method.class)
    }

    pub fn len(&self) -> usize {
        self.by_method.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_method.is_empty()
    }
}

impl fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.by_method.keys()).finish()
    }
}

/// Routes intercepted calls: interceptors first, then the resolved substitute, then the real
/// class. Built from one registry snapshot and never changed afterwards.
pub struct DispatchHandler {
    registry: SubstitutionRegistry,
    interceptors: Interceptors,
    picker_context: PickerContext,
    resolved: Mutex<HashMap<ClassName, Option<ClassName>>>,
}

impl DispatchHandler {
    pub fn new(
        registry: SubstitutionRegistry,
        interceptors: Interceptors,
        picker_context: PickerContext,
    ) -> Self {
        Self {
            registry,
            interceptors,
            picker_context,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &SubstitutionRegistry {
        &self.registry
    }

    pub fn picker_context(&self) -> &PickerContext {
        &self.picker_context
    }

    pub fn interceptor(&self, method: &MethodRef) -> Option<Interceptor> {
        self.interceptors.get(method).cloned()
    }

    /// The substitute for `real`, memoised per handler.
    pub fn substitute_for(&self, real: &ClassName) -> Option<ClassName> {
        if let Some(resolved) = self.resolved.lock().get(real) {
            return resolved.clone();
        }
        let resolved = self.registry.resolve(real, &self.picker_context);
        self.resolved.lock().insert(real.clone(), resolved.clone());
        resolved
    }
}

impl fmt::Debug for DispatchHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchHandler")
            .field("substitutes", &self.registry.len())
            .field("interceptors", &self.interceptors)
            .field("picker_context", &self.picker_context)
            .finish()
    }
}
