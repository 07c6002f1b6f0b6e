//! The ambient sandbox of the current thread.
//!
//! A sandbox becomes ambient only through [`enter`]; the returned guard restores whatever was
//! ambient before when it is dropped, including during unwinding.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use super::Sandbox;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Sandbox>>> = const { RefCell::new(None) };
}

/// The sandbox that is ambient on this thread, if any.
pub fn current() -> Option<Arc<Sandbox>> {
    CURRENT.with(|current| current.borrow().clone())
}

pub fn is_ambient(sandbox: &Sandbox) -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|ambient| ambient.id() == sandbox.id())
    })
}

/// Restores the previous ambient sandbox on drop. Bound to the thread that created it.
#[must_use = "the sandbox stops being ambient as soon as the guard is dropped"]
pub struct AmbientGuard {
    prior: Option<Arc<Sandbox>>,
    _thread_bound: PhantomData<*const ()>,
}

pub fn enter(sandbox: Arc<Sandbox>) -> AmbientGuard {
    let prior = CURRENT.with(|current| current.replace(Some(sandbox)));
    AmbientGuard {
        prior,
        _thread_bound: PhantomData,
    }
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        let prior = self.prior.take();
        // The thread-local may already be gone during thread teardown.
        let _ = CURRENT.try_with(|current| *current.borrow_mut() = prior);
    }
}
