//! The in-process side of the tracing contract.
//!
//! Rewritten methods report to a [`TracingCallback`]. This module models the
//! values those notifications carry, provides the proxy-unwrapping
//! [`FilterTracingCallback`](filter::FilterTracingCallback), a
//! [`LogTracingCallback`](log::LogTracingCallback) sink, and the process-wide
//! [`registry`] that holds the active callback.

pub mod filter;
pub mod log;
pub mod registry;

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::descriptor::{FieldType, MethodType};

pub use filter::FilterTracingCallback;
pub use log::LogTracingCallback;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("cannot tell which {family} type {class} implements")]
    UnresolvedFamily { family: &'static str, class: String },
    #[error("proxied method declared by untraced type {0}")]
    UntracedDeclaringType(String),
    #[error("malformed proxy dispatch arguments: {0}")]
    MalformedDispatch(&'static str),
    #[error("callback failed: {0}")]
    Sink(String),
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct ObjectData {
    id: u64,
    class_name: String,
    types: BTreeSet<String>,
}

/// Handle to a live object. Equality is identity.
#[derive(Debug, Clone)]
pub struct ObjectRef(Arc<ObjectData>);

impl ObjectRef {
    /// `types` lists every class and interface the object is assignable to
    /// besides its own class.
    pub fn new<I, S>(class_name: &str, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Arc::new(ObjectData {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            class_name: class_name.to_string(),
            types: types.into_iter().map(Into::into).collect(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn class_name(&self) -> &str {
        &self.0.class_name
    }

    pub fn instance_of(&self, ty: &str) -> bool {
        self.0.class_name == ty || self.0.types.contains(ty)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:x}", self.0.class_name, self.0.id)
    }
}

/// A `java.lang.reflect.Method` as seen by a proxy's `invoke`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedMethod {
    pub declaring_type: String,
    pub name: String,
    pub params: Vec<FieldType>,
    pub ret: Option<FieldType>,
}

impl ReflectedMethod {
    pub fn method_type(&self) -> MethodType {
        MethodType::new(self.params.clone(), self.ret.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Method(ReflectedMethod),
    Object(ObjectRef),
}

impl Value {
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Byte(v) => write!(f, "{v}"),
            Value::Char(v) => match char::from_u32(*v as u32) {
                Some(c) => write!(f, "'{c}'"),
                None => write!(f, "'\\u{v:04x}'"),
            },
            Value::Short(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Method(m) => write!(f, "{}.{}{}", m.declaring_type, m.name, m.method_type()),
            Value::Object(o) => write!(f, "{o}"),
        }
    }
}

/// Static identity of a traced method as emitted into the rewritten code:
/// the mark label, the method name and its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub owner: String,
    pub name: String,
    pub signature: String,
}

impl MethodRef {
    pub fn new(owner: &str, name: &str, signature: &str) -> Self {
        Self { owner: owner.to_string(), name: name.to_string(), signature: signature.to_string() }
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.signature)
    }
}

/// Receiver of trace notifications.
///
/// Rewritten code calls these in program order on the thread running the
/// traced method. All methods default to doing nothing, so implementors only
/// override what they need. An `Err` propagates into the traced method
/// exactly like an exception it raised itself.
///
/// # Thread Safety
///
/// Notifications arrive concurrently from every thread that runs traced
/// code, hence the `Sync + Send` bound.
pub trait TracingCallback: Sync + Send {
    /// A constructor was entered, before it delegates to another constructor.
    /// There is no receiver yet; [`enter`](Self::enter) follows once the
    /// delegated call returns.
    fn init_enter(&self, _args: &[Value], _method: &MethodRef) -> Result<(), CallbackError> {
        Ok(())
    }

    /// The code evaluating the delegated constructor call's arguments raised.
    ///
    /// Not raised when the delegated constructor itself throws: the verifier
    /// does not allow the call that initialises `this` to be covered by a
    /// handler, so that exception reaches the caller unreported.
    fn init_exit_exception(&self, _error: &Value, _method: &MethodRef) -> Result<(), CallbackError> {
        Ok(())
    }

    /// A method was entered. For constructors this fires after the delegated
    /// constructor returned. `receiver` is `None` for static methods.
    fn enter(&self, _args: &[Value], _receiver: Option<&ObjectRef>, _method: &MethodRef) -> Result<(), CallbackError> {
        Ok(())
    }

    /// A value-returning method is about to return `value`. Primitives
    /// arrive boxed.
    fn exit_return(&self, _value: &Value, _receiver: Option<&ObjectRef>, _method: &MethodRef) -> Result<(), CallbackError> {
        Ok(())
    }

    /// A `void` method is about to return.
    fn exit_return_void(&self, _receiver: Option<&ObjectRef>, _method: &MethodRef) -> Result<(), CallbackError> {
        Ok(())
    }

    /// The method itself executes a `throw`. Fires once per `throw` executed,
    /// so a rethrow from a `catch` or `finally` block reports again for the
    /// same call. Followed by [`exit_exception`](Self::exit_exception) once
    /// the exception leaves the method.
    fn exit_throw(&self, _error: &Value, _receiver: Option<&ObjectRef>, _method: &MethodRef) -> Result<(), CallbackError> {
        Ok(())
    }

    /// The method is completing abruptly, whether it threw itself or a callee did.
    fn exit_exception(&self, _error: &Value, _receiver: Option<&ObjectRef>, _method: &MethodRef) -> Result<(), CallbackError> {
        Ok(())
    }
}

/// Result of re-resolving a proxied method against a family type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMethod {
    pub declaring_type: String,
    pub method_type: MethodType,
}

/// Type shape lookup used to find where a method is declared as seen from a
/// given type.
pub trait MethodLookup: Sync + Send {
    fn find_method(&self, owner: &str, name: &str, params: &[FieldType]) -> Option<ResolvedMethod>;
}
