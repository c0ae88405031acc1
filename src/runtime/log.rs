//! A sink that turns every notification into one `tracing` event.

use tracing::info;

use crate::runtime::{CallbackError, MethodRef, ObjectRef, TracingCallback, Value};

#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracingCallback;

impl LogTracingCallback {
    pub fn new() -> Self {
        Self
    }
}

fn render_args(args: &[Value]) -> String {
    args.iter().map(Value::to_string).collect::<Vec<_>>().join(", ")
}

fn receiver_id(receiver: Option<&ObjectRef>) -> u64 {
    receiver.map_or(0, ObjectRef::id)
}

impl TracingCallback for LogTracingCallback {
    fn init_enter(&self, args: &[Value], method: &MethodRef) -> Result<(), CallbackError> {
        info!(owner = %method.owner, method = %method.name, signature = %method.signature, args = %render_args(args), "INIT");
        Ok(())
    }

    fn init_exit_exception(&self, error: &Value, method: &MethodRef) -> Result<(), CallbackError> {
        info!(owner = %method.owner, method = %method.name, signature = %method.signature, error = %error, "INIT-EXCEPTION");
        Ok(())
    }

    fn enter(&self, args: &[Value], receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        info!(
            owner = %method.owner,
            method = %method.name,
            signature = %method.signature,
            receiver = receiver_id(receiver),
            args = %render_args(args),
            "ENTER"
        );
        Ok(())
    }

    fn exit_return(&self, value: &Value, receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        info!(
            owner = %method.owner,
            method = %method.name,
            signature = %method.signature,
            receiver = receiver_id(receiver),
            value = %value,
            "RETURN"
        );
        Ok(())
    }

    fn exit_return_void(&self, receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        info!(owner = %method.owner, method = %method.name, signature = %method.signature, receiver = receiver_id(receiver), "RETURN");
        Ok(())
    }

    fn exit_throw(&self, error: &Value, receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        info!(
            owner = %method.owner,
            method = %method.name,
            signature = %method.signature,
            receiver = receiver_id(receiver),
            error = %error,
            "THROW"
        );
        Ok(())
    }

    fn exit_exception(&self, error: &Value, receiver: Option<&ObjectRef>, method: &MethodRef) -> Result<(), CallbackError> {
        info!(
            owner = %method.owner,
            method = %method.name,
            signature = %method.signature,
            receiver = receiver_id(receiver),
            error = %error,
            "EXCEPTION"
        );
        Ok(())
    }
}
