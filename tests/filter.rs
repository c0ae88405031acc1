mod common;

use std::sync::{Arc, Mutex};

use jdbc_tracing::descriptor::FieldType;
use jdbc_tracing::families::{
    CALLABLE_STATEMENT, CONNECTION, INVOCATION_HANDLER, POOLED_CONNECTION, PREPARED_STATEMENT, STATEMENT,
    XA_CONNECTION,
};
use jdbc_tracing::hierarchy::OBJECT;
use jdbc_tracing::runtime::filter::DISPATCH_SIGNATURE;
use jdbc_tracing::runtime::{
    CallbackError, FilterTracingCallback, MethodLookup, MethodRef, ObjectRef, ReflectedMethod, TracingCallback, Value,
};

/// Records every notification as one line.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    fail_enter: bool,
}

impl Recorder {
    fn failing() -> Self {
        Self { fail_enter: true, ..Self::default() }
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

fn who(receiver: Option<&ObjectRef>) -> &str {
    receiver.map_or("-", ObjectRef::class_name)
}

impl TracingCallback for Recorder {
    fn init_enter(&self, args: &[Value], method: &MethodRef) -> Result<(), CallbackError> {
        self.push(format!("init {method} {}", args.len()));
        Ok(())
    }

    fn init_exit_exception(&self, error: &Value, method: &MethodRef) -> Result<(), CallbackError> {
        self.push(format!("init-exception {method} {error}"));
        Ok(())
    }

    fn enter(&self, args: &[Value], receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        if self.fail_enter {
            return Err(CallbackError::Sink("refused".into()));
        }
        self.push(format!("enter {method} {} {}", who(receiver), Value::Array(args.to_vec())));
        Ok(())
    }

    fn exit_return(&self, value: &Value, receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        self.push(format!("return {method} {} {value}", who(receiver)));
        Ok(())
    }

    fn exit_return_void(&self, receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        self.push(format!("void {method} {}", who(receiver)));
        Ok(())
    }

    fn exit_throw(&self, error: &Value, receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        self.push(format!("throw {method} {} {error}", who(receiver)));
        Ok(())
    }

    fn exit_exception(&self, error: &Value, receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        self.push(format!("exception {method} {} {error}", who(receiver)));
        Ok(())
    }
}

fn filter() -> (Arc<Recorder>, FilterTracingCallback) {
    let recorder = Arc::new(Recorder::default());
    let filter = FilterTracingCallback::new(recorder.clone());
    (recorder, filter)
}

fn handler() -> ObjectRef {
    ObjectRef::new("drv/ProxyHandler", [INVOCATION_HANDLER])
}

fn invoke() -> MethodRef {
    MethodRef::new("drv/ProxyHandler", "invoke", DISPATCH_SIGNATURE)
}

fn reflected(declaring_type: &str, name: &str, params: Vec<FieldType>, ret: Option<FieldType>) -> Value {
    Value::Method(ReflectedMethod { declaring_type: declaring_type.into(), name: name.into(), params, ret })
}

fn dispatch_args(target: &ObjectRef, method: Value, args: Vec<Value>) -> Vec<Value> {
    vec![Value::Object(target.clone()), method, Value::Array(args)]
}

fn error() -> Value {
    Value::Object(ObjectRef::new("java/sql/SQLException", ["java/lang/Throwable"]))
}

#[test]
fn only_the_outermost_call_is_forwarded() {
    let (recorder, filter) = filter();
    let conn = ObjectRef::new("drv/Conn", [CONNECTION]);
    let outer = MethodRef::new(CONNECTION, "close", "()V");
    let inner = MethodRef::new(STATEMENT, "close", "()V");

    filter.enter(&[], Some(&conn), &outer).unwrap();
    assert_eq!(filter.depth(), 1);
    filter.enter(&[], Some(&conn), &inner).unwrap();
    filter.init_enter(&[Value::Int(1)], &MethodRef::new("drv/Ds", "<init>", "(I)V")).unwrap();
    filter.exit_return_void(Some(&conn), &inner).unwrap();
    filter.exit_return_void(Some(&conn), &outer).unwrap();

    assert_eq!(filter.depth(), 0);
    assert_eq!(
        recorder.events(),
        ["enter java/sql/Connection.close()V drv/Conn []", "void java/sql/Connection.close()V drv/Conn"]
    );
}

#[test]
fn constructor_notifications_pass_through_at_the_top_level() {
    let (recorder, filter) = filter();
    let init = MethodRef::new("drv/Ds", "<init>", "(I)V");
    filter.init_enter(&[Value::Int(7)], &init).unwrap();
    filter.init_exit_exception(&error(), &init).unwrap();
    let events = recorder.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], "init drv/Ds.<init>(I)V 1");
    assert!(events[1].starts_with("init-exception drv/Ds.<init>(I)V java/sql/SQLException@"));
}

#[test]
fn proxy_dispatch_is_reported_as_the_proxied_call() {
    let (recorder, filter) = filter();
    let handler = handler();
    let target = ObjectRef::new("drv/XaConn", [XA_CONNECTION, POOLED_CONNECTION]);
    let connection = Some(FieldType::Object(CONNECTION.into()));
    let args = dispatch_args(&target, reflected(POOLED_CONNECTION, "getConnection", Vec::new(), connection), Vec::new());

    filter.enter(&args, Some(&handler), &invoke()).unwrap();
    filter.exit_return(&Value::Null, Some(&handler), &invoke()).unwrap();

    assert_eq!(
        recorder.events(),
        [
            "enter javax/sql/PooledConnection.getConnection()Ljava/sql/Connection; drv/XaConn []",
            "return javax/sql/PooledConnection.getConnection()Ljava/sql/Connection; drv/XaConn null",
        ]
    );
    assert_eq!(filter.depth(), 0);
}

#[test]
fn calls_made_inside_a_proxy_dispatch_are_silent() {
    let (recorder, filter) = filter();
    let handler = handler();
    let target = ObjectRef::new("drv/PooledConn", [CONNECTION]);
    let commit = reflected(CONNECTION, "commit", Vec::new(), None);
    let args = dispatch_args(&target, commit, Vec::new());
    let delegate = ObjectRef::new("drv/Conn", [CONNECTION]);
    let inner = MethodRef::new(CONNECTION, "commit", "()V");
    let nested_args = dispatch_args(&delegate, reflected(CONNECTION, "close", Vec::new(), None), Vec::new());

    filter.enter(&args, Some(&handler), &invoke()).unwrap();
    // the handler forwards to the real connection, which is traced too
    filter.enter(&[], Some(&delegate), &inner).unwrap();
    assert_eq!(filter.depth(), 2);
    filter.exit_return_void(Some(&delegate), &inner).unwrap();
    // as is a second proxy layer
    filter.enter(&nested_args, Some(&handler), &invoke()).unwrap();
    filter.exit_return(&Value::Null, Some(&handler), &invoke()).unwrap();
    assert_eq!(filter.depth(), 1);
    filter.exit_return(&Value::Null, Some(&handler), &invoke()).unwrap();

    assert_eq!(filter.depth(), 0);
    assert_eq!(
        recorder.events(),
        ["enter java/sql/Connection.commit()V drv/PooledConn []", "void java/sql/Connection.commit()V drv/PooledConn"]
    );
}

#[test]
fn lookup_finds_the_declaring_family_type() {
    let lookup: Arc<dyn MethodLookup> = Arc::new(common::library_hierarchy());
    let recorder = Arc::new(Recorder::default());
    let filter = FilterTracingCallback::new(recorder.clone()).with_lookup(lookup);
    let handler = handler();
    let target = ObjectRef::new("drv/Callable", [CALLABLE_STATEMENT, PREPARED_STATEMENT, STATEMENT]);
    let args = dispatch_args(&target, reflected(CALLABLE_STATEMENT, "close", Vec::new(), None), Vec::new());

    filter.enter(&args, Some(&handler), &invoke()).unwrap();
    // a void proxied method still exits through the generic return path
    filter.exit_return(&Value::Null, Some(&handler), &invoke()).unwrap();

    assert_eq!(
        recorder.events(),
        ["enter java/sql/Statement.close()V drv/Callable []", "void java/sql/Statement.close()V drv/Callable"]
    );
}

#[test]
fn proxied_arguments_are_unpacked() {
    let (recorder, filter) = filter();
    let handler = handler();
    let target = ObjectRef::new("drv/Prepared", [PREPARED_STATEMENT, STATEMENT]);
    let params = vec![FieldType::Int, FieldType::Double];
    let args = dispatch_args(
        &target,
        reflected(PREPARED_STATEMENT, "setDouble", params, None),
        vec![Value::Int(1), Value::Double(2.5)],
    );
    filter.enter(&args, Some(&handler), &invoke()).unwrap();
    assert_eq!(recorder.events(), ["enter java/sql/PreparedStatement.setDouble(ID)V drv/Prepared [1, 2.5]"]);
}

#[test]
fn object_methods_on_proxies_are_silent() {
    let (recorder, filter) = filter();
    let handler = handler();
    let target = ObjectRef::new("drv/Conn", [CONNECTION]);
    let string = Some(FieldType::Object("java/lang/String".into()));
    let args = dispatch_args(&target, reflected(OBJECT, "toString", Vec::new(), string), Vec::new());

    filter.enter(&args, Some(&handler), &invoke()).unwrap();
    filter.enter(&[], Some(&target), &MethodRef::new(CONNECTION, "close", "()V")).unwrap();
    assert_eq!(filter.depth(), 2);
    filter.exit_return_void(Some(&target), &MethodRef::new(CONNECTION, "close", "()V")).unwrap();
    assert_eq!(filter.depth(), 1);
    filter.exit_throw(&error(), Some(&handler), &invoke()).unwrap();
    filter.exit_exception(&error(), Some(&handler), &invoke()).unwrap();

    assert!(recorder.events().is_empty());
    assert_eq!(filter.depth(), 0);
}

#[test]
fn throw_is_reported_without_leaving_the_call() {
    let (recorder, filter) = filter();
    let stmt = ObjectRef::new("drv/Stmt", [STATEMENT]);
    let close = MethodRef::new(STATEMENT, "close", "()V");
    let nested = MethodRef::new(CONNECTION, "close", "()V");

    filter.enter(&[], Some(&stmt), &close).unwrap();
    filter.enter(&[], Some(&stmt), &nested).unwrap();
    filter.exit_throw(&error(), Some(&stmt), &nested).unwrap();
    filter.exit_exception(&error(), Some(&stmt), &nested).unwrap();
    filter.exit_throw(&error(), Some(&stmt), &close).unwrap();
    assert_eq!(filter.depth(), 1);
    filter.exit_exception(&error(), Some(&stmt), &close).unwrap();
    assert_eq!(filter.depth(), 0);

    let events = recorder.events();
    assert_eq!(events.len(), 3);
    assert!(events[1].starts_with("throw java/sql/Statement.close()V drv/Stmt "));
    assert!(events[2].starts_with("exception java/sql/Statement.close()V drv/Stmt "));
}

#[test]
fn proxy_throw_uses_the_recorded_identity() {
    let (recorder, filter) = filter();
    let handler = handler();
    let target = ObjectRef::new("drv/Conn", [CONNECTION]);
    let args = dispatch_args(&target, reflected(CONNECTION, "close", Vec::new(), None), Vec::new());

    filter.enter(&args, Some(&handler), &invoke()).unwrap();
    filter.exit_throw(&error(), Some(&handler), &invoke()).unwrap();
    filter.exit_exception(&error(), Some(&handler), &invoke()).unwrap();

    let events = recorder.events();
    assert_eq!(events.len(), 3);
    assert!(events[1].starts_with("throw java/sql/Connection.close()V drv/Conn "));
    assert!(events[2].starts_with("exception java/sql/Connection.close()V drv/Conn "));
}

#[test]
fn unbalanced_exits_are_dropped() {
    let (recorder, filter) = filter();
    let close = MethodRef::new(CONNECTION, "close", "()V");
    filter.exit_return_void(None, &close).unwrap();
    filter.exit_exception(&error(), None, &close).unwrap();
    assert!(recorder.events().is_empty());
    assert_eq!(filter.depth(), 0);
}

#[test]
fn failed_entry_leaves_no_state_behind() {
    let recorder = Arc::new(Recorder::failing());
    let filter = FilterTracingCallback::new(recorder.clone());
    let conn = ObjectRef::new("drv/Conn", [CONNECTION]);
    let close = MethodRef::new(CONNECTION, "close", "()V");

    assert_eq!(filter.enter(&[], Some(&conn), &close), Err(CallbackError::Sink("refused".into())));
    assert_eq!(filter.depth(), 0);

    let handler = handler();
    let args = dispatch_args(&conn, reflected(CONNECTION, "close", Vec::new(), None), Vec::new());
    assert!(filter.enter(&args, Some(&handler), &invoke()).is_err());
    assert_eq!(filter.depth(), 0);
}

#[test]
fn dispatch_errors() {
    let (_, filter) = filter();
    let handler = handler();
    let plain = ObjectRef::new("drv/Thing", ["java/lang/Runnable"]);

    let untraced = dispatch_args(&plain, reflected("java/lang/Runnable", "run", Vec::new(), None), Vec::new());
    assert_eq!(
        filter.enter(&untraced, Some(&handler), &invoke()),
        Err(CallbackError::UntracedDeclaringType("java/lang/Runnable".into()))
    );

    let unresolved = dispatch_args(&plain, reflected(STATEMENT, "close", Vec::new(), None), Vec::new());
    assert_eq!(
        filter.enter(&unresolved, Some(&handler), &invoke()),
        Err(CallbackError::UnresolvedFamily { family: "statement", class: "drv/Thing".into() })
    );

    assert!(matches!(
        filter.enter(&[Value::Null], Some(&handler), &invoke()),
        Err(CallbackError::MalformedDispatch(_))
    ));
    assert_eq!(filter.depth(), 0);
}

#[test]
fn non_handlers_named_invoke_are_plain_calls() {
    let (recorder, filter) = filter();
    let thing = ObjectRef::new("drv/Thing", Vec::<String>::new());
    let invoke = MethodRef::new("drv/Thing", "invoke", DISPATCH_SIGNATURE);
    filter.enter(&[Value::Null, Value::Null, Value::Null], Some(&thing), &invoke).unwrap();
    assert_eq!(recorder.events().len(), 1);
    assert!(recorder.events()[0].starts_with("enter drv/Thing.invoke("));
}
