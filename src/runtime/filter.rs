//! Call-site normalisation in front of a user callback.
//!
//! JDBC pools commonly hand out dynamic proxies whose every call funnels
//! through `InvocationHandler.invoke(proxy, method, args)`. When such a
//! dispatch is the outermost traced call on a thread, the filter reports it
//! as the call it stands for: receiver, declaring type, name and signature
//! are rebuilt from the reflected method. Traced calls nested inside an
//! outer traced call on the same thread are not forwarded at all.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::families::{
    CALLABLE_STATEMENT, CONNECTION, INVOCATION_HANDLER, POOLED_CONNECTION, PREPARED_STATEMENT, STATEMENT,
    XA_CONNECTION,
};
use crate::hierarchy::OBJECT;
use crate::runtime::{CallbackError, MethodLookup, MethodRef, ObjectRef, ReflectedMethod, TracingCallback, Value};

/// Descriptor of `InvocationHandler.invoke`.
pub const DISPATCH_SIGNATURE: &str = "(Ljava/lang/Object;Ljava/lang/reflect/Method;[Ljava/lang/Object;)Ljava/lang/Object;";

static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity substituted for a proxy dispatch, recorded on entry and reused
/// by the matching exit.
#[derive(Debug, Clone)]
struct Frame {
    receiver: Option<ObjectRef>,
    method: MethodRef,
    void: bool,
}

#[derive(Debug, Default)]
struct CallContext {
    depth: u32,
    /// `None` entries are sentinels for dispatches that are not reported.
    frames: Vec<Option<Frame>>,
}

thread_local! {
    static CONTEXTS: RefCell<HashMap<u64, CallContext>> = RefCell::new(HashMap::new());
}

struct Dispatch<'a> {
    target: Option<&'a ObjectRef>,
    method: &'a ReflectedMethod,
    args: &'a [Value],
}

impl<'a> Dispatch<'a> {
    fn parse(args: &'a [Value]) -> Result<Self, CallbackError> {
        let [target, method, call_args] = args else {
            return Err(CallbackError::MalformedDispatch("expected (proxy, method, args)"));
        };
        let target = match target {
            Value::Object(o) => Some(o),
            Value::Null => None,
            _ => return Err(CallbackError::MalformedDispatch("proxy is not an object")),
        };
        let Value::Method(method) = method else {
            return Err(CallbackError::MalformedDispatch("second argument is not a method"));
        };
        let args: &[Value] = match call_args {
            Value::Array(items) => items,
            Value::Null => &[],
            _ => return Err(CallbackError::MalformedDispatch("third argument is not an array")),
        };
        Ok(Self { target, method, args })
    }
}

pub struct FilterTracingCallback {
    id: u64,
    next: Arc<dyn TracingCallback>,
    lookup: Option<Arc<dyn MethodLookup>>,
}

impl FilterTracingCallback {
    /// Proxied methods are reported with the identity of the reflected
    /// method itself.
    pub fn new(next: Arc<dyn TracingCallback>) -> Self {
        Self { id: NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed), next, lookup: None }
    }

    /// Proxied methods are re-resolved through `lookup` against the family
    /// type the proxy target implements.
    pub fn with_lookup(mut self, lookup: Arc<dyn MethodLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Current nesting depth on this thread.
    pub fn depth(&self) -> u32 {
        CONTEXTS.with(|c| c.borrow().get(&self.id).map_or(0, |cx| cx.depth))
    }

    fn with_context<R>(&self, f: impl FnOnce(&mut CallContext) -> R) -> R {
        CONTEXTS.with(|contexts| {
            let mut contexts = contexts.borrow_mut();
            let cx = contexts.entry(self.id).or_default();
            let result = f(cx);
            if cx.depth == 0 && cx.frames.is_empty() {
                contexts.remove(&self.id);
            }
            result
        })
    }

    fn is_dispatch(receiver: Option<&ObjectRef>, method: &MethodRef) -> bool {
        receiver.map_or(false, |r| r.instance_of(INVOCATION_HANDLER))
            && method.name == "invoke"
            && method.signature == DISPATCH_SIGNATURE
    }

    /// Picks the most specific family type the target implements.
    fn family_type(dispatch: &Dispatch<'_>) -> Result<Option<&'static str>, CallbackError> {
        let choose = |family: &'static str, candidates: &[&'static str]| {
            let target = dispatch.target;
            candidates
                .iter()
                .copied()
                .find(|c| target.map_or(false, |t| t.instance_of(c)))
                .map(Some)
                .ok_or_else(|| CallbackError::UnresolvedFamily {
                    family,
                    class: target.map_or_else(|| "null".to_string(), |t| t.class_name().to_string()),
                })
        };
        match dispatch.method.declaring_type.as_str() {
            CONNECTION => Ok(Some(CONNECTION)),
            XA_CONNECTION | POOLED_CONNECTION => choose("pooled connection", &[XA_CONNECTION, POOLED_CONNECTION]),
            CALLABLE_STATEMENT | PREPARED_STATEMENT | STATEMENT => {
                choose("statement", &[CALLABLE_STATEMENT, PREPARED_STATEMENT, STATEMENT])
            }
            OBJECT => Ok(None),
            other => Err(CallbackError::UntracedDeclaringType(other.to_string())),
        }
    }

    /// `Ok(None)` means the dispatch is observed but not reported.
    fn resolve(&self, dispatch: &Dispatch<'_>) -> Result<Option<Frame>, CallbackError> {
        let Some(family) = Self::family_type(dispatch)? else {
            return Ok(None);
        };
        let reflected = dispatch.method;
        let resolved = self.lookup.as_ref().and_then(|l| l.find_method(family, &reflected.name, &reflected.params));
        let (declaring_type, method_type) = match resolved {
            Some(r) => (r.declaring_type, r.method_type),
            None => (reflected.declaring_type.clone(), reflected.method_type()),
        };
        Ok(Some(Frame {
            receiver: dispatch.target.cloned(),
            method: MethodRef { owner: declaring_type, name: reflected.name.clone(), signature: method_type.to_string() },
            void: method_type.is_void(),
        }))
    }

    /// Decrements the depth. Returns `None` when nothing should be forwarded,
    /// otherwise the frame popped for a dispatch (`Some(None)` for a plain call).
    fn leave(&self, dispatch: bool) -> Option<Option<Frame>> {
        self.with_context(|cx| {
            if cx.depth == 0 {
                warn!(filter = self.id, "exit notification without matching enter");
                return None;
            }
            cx.depth -= 1;
            if cx.depth != 0 {
                return None;
            }
            if !dispatch {
                return Some(None);
            }
            match cx.frames.pop() {
                Some(Some(frame)) => Some(Some(frame)),
                Some(None) => None,
                None => {
                    warn!(filter = self.id, "proxy exit without recorded frame");
                    Some(None)
                }
            }
        })
    }
}

impl TracingCallback for FilterTracingCallback {
    fn init_enter(&self, args: &[Value], method: &MethodRef) -> Result<(), CallbackError> {
        if self.depth() == 0 {
            self.next.init_enter(args, method)?;
        }
        Ok(())
    }

    fn init_exit_exception(&self, error: &Value, method: &MethodRef) -> Result<(), CallbackError> {
        if self.depth() == 0 {
            self.next.init_exit_exception(error, method)?;
        }
        Ok(())
    }

    fn enter(&self, args: &[Value], receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        let level = self.with_context(|cx| {
            cx.depth += 1;
            cx.depth - 1
        });
        if level != 0 {
            return Ok(());
        }

        let result = if Self::is_dispatch(receiver, method) {
            self.enter_dispatch(args)
        } else {
            self.next.enter(args, receiver, method)
        };
        if result.is_err() {
            // the entry advice sits outside the protected region, so no exit follows
            let dispatch = Self::is_dispatch(receiver, method);
            self.with_context(|cx| {
                cx.depth = cx.depth.saturating_sub(1);
                if dispatch {
                    cx.frames.pop();
                }
            });
        }
        result
    }

    fn exit_return(&self, value: &Value, receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        match self.leave(Self::is_dispatch(receiver, method)) {
            None => Ok(()),
            Some(Some(frame)) if frame.void => self.next.exit_return_void(frame.receiver.as_ref(), &frame.method),
            Some(Some(frame)) => self.next.exit_return(value, frame.receiver.as_ref(), &frame.method),
            Some(None) => self.next.exit_return(value, receiver, method),
        }
    }

    fn exit_return_void(&self, receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        match self.leave(Self::is_dispatch(receiver, method)) {
            None => Ok(()),
            Some(Some(frame)) => self.next.exit_return_void(frame.receiver.as_ref(), &frame.method),
            Some(None) => self.next.exit_return_void(receiver, method),
        }
    }

    fn exit_throw(&self, error: &Value, receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        let dispatch = Self::is_dispatch(receiver, method);
        let peeked = self.with_context(|cx| {
            if cx.depth != 1 {
                return None;
            }
            if !dispatch {
                return Some(None);
            }
            match cx.frames.last() {
                Some(Some(frame)) => Some(Some(frame.clone())),
                Some(None) => None,
                None => {
                    warn!(filter = self.id, "proxy throw without recorded frame");
                    Some(None)
                }
            }
        });
        match peeked {
            None => Ok(()),
            Some(Some(frame)) => self.next.exit_throw(error, frame.receiver.as_ref(), &frame.method),
            Some(None) => self.next.exit_throw(error, receiver, method),
        }
    }

    fn exit_exception(&self, error: &Value, receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        match self.leave(Self::is_dispatch(receiver, method)) {
            None => Ok(()),
            Some(Some(frame)) => self.next.exit_exception(error, frame.receiver.as_ref(), &frame.method),
            Some(None) => self.next.exit_exception(error, receiver, method),
        }
    }
}

impl FilterTracingCallback {
    fn enter_dispatch(&self, args: &[Value]) -> Result<(), CallbackError> {
        let dispatch = Dispatch::parse(args)?;
        match self.resolve(&dispatch)? {
            None => {
                self.with_context(|cx| cx.frames.push(None));
                Ok(())
            }
            Some(frame) => {
                self.with_context(|cx| cx.frames.push(Some(frame.clone())));
                self.next.enter(dispatch.args, frame.receiver.as_ref(), &frame.method)
            }
        }
    }
}
