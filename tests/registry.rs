use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use jdbc_tracing::runtime::{registry, CallbackError, MethodRef, ObjectRef, TracingCallback, Value};

#[derive(Default)]
struct Counter {
    enters: AtomicUsize,
}

impl TracingCallback for Counter {
    fn enter(&self, _args: &[Value], _receiver: Option<&ObjectRef>, _method: &MethodRef) -> Result<(), CallbackError> {
        self.enters.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// Single test: the registry is process-wide.
#[test]
fn installed_callback_becomes_current() {
    let method = MethodRef::new("java/sql/Connection", "close", "()V");

    // the default accepts notifications without any setup
    registry::current().enter(&[], None, &method).unwrap();
    registry::current().exit_return_void(None, &method).unwrap();

    let counter = Arc::new(Counter::default());
    registry::install(counter.clone());
    registry::current().enter(&[], None, &method).unwrap();
    registry::current().enter(&[Value::Int(3)], None, &method).unwrap();
    assert_eq!(counter.enters.load(Ordering::SeqCst), 2);

    let previous = registry::install(registry::default_callback());
    previous.enter(&[], None, &method).unwrap();
    assert_eq!(counter.enters.load(Ordering::SeqCst), 3);
    registry::current().enter(&[], None, &method).unwrap();
    assert_eq!(counter.enters.load(Ordering::SeqCst), 3);
}
