//! Process-wide slot holding the active callback.
//!
//! Rewritten code reads its callback from one fixed location. This is that
//! location on the Rust side: initialised lazily to a [`FilterTracingCallback`]
//! over a [`LogTracingCallback`], and replaceable with [`install`] before
//! (or while) traced code runs.
//!
//! Rewritten bytecode reads its callback with `getstatic` on the configured
//! holder field and never calls into this registry. The runtime types model
//! the callback contract that the Java side implements, for tests and for
//! hosts that embed traced code and route notifications to Rust.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::runtime::{FilterTracingCallback, LogTracingCallback, TracingCallback};

static CURRENT: OnceLock<RwLock<Arc<dyn TracingCallback>>> = OnceLock::new();

fn slot() -> &'static RwLock<Arc<dyn TracingCallback>> {
    CURRENT.get_or_init(|| RwLock::new(default_callback()))
}

/// The callback used when nothing was installed.
pub fn default_callback() -> Arc<dyn TracingCallback> {
    Arc::new(FilterTracingCallback::new(Arc::new(LogTracingCallback::new())))
}

/// The active callback.
pub fn current() -> Arc<dyn TracingCallback> {
    slot().read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Replaces the active callback, returning the previous one.
pub fn install(callback: Arc<dyn TracingCallback>) -> Arc<dyn TracingCallback> {
    let mut guard = slot().write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *guard, callback)
}
