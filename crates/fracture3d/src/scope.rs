//! Physics-thread scope guard.
//!
//! Rewind and desync APIs only make sense on the thread that owns the solver while it
//! is not stepping concurrently. Callers open a `PhysicsThreadScope` around them; the
//! solver handles do this automatically for closures they run.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// RAII marker that the current thread acts as the physics thread. Nests.
pub struct PhysicsThreadScope {
    _not_send: PhantomData<*const ()>,
}

impl PhysicsThreadScope {
    pub fn enter() -> Self {
        DEPTH.with(|d| d.set(d.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }

    pub fn is_active() -> bool {
        DEPTH.with(|d| d.get() > 0)
    }
}

impl Drop for PhysicsThreadScope {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Panics unless a `PhysicsThreadScope` is open on this thread.
#[track_caller]
pub fn assert_physics_scope(api: &str) {
    assert!(
        PhysicsThreadScope::is_active(),
        "{api} called outside a PhysicsThreadScope"
    );
}
