//! Method body rewriting.
//!
//! A marked method is rebuilt as
//!
//! ```text
//! [initEnter advice]                       constructors only
//! <original code up to the delegating invokespecial>
//! [store receiver] [enter advice]
//! <original code, each return/athrow preceded by its exit advice>
//! main handler:  exitException advice; athrow
//! pre handler:   initExitException advice; athrow   constructors only
//! ```
//!
//! The main handler catches `Throwable` over the whole body after the entry
//! advice and is appended after the original exception table entries, so the
//! method's own handlers keep precedence. The receiver is copied into a fresh
//! local slot once it exists, so advice still sees it if the body overwrites
//! local 0.
//!
//! Exit advice sits in front of every `athrow` in the body, so a method that
//! rethrows from a `catch` or `finally` block reports `exitThrow` once per
//! `athrow` executed. Callbacks should expect repeated throw notifications
//! for one call.
//!
//! The pre handler covers only the code before the delegating
//! `invokespecial`, never the call itself: the verifier rejects a handler
//! whose range includes the instruction that initialises `this`. An exception
//! thrown by the delegated constructor therefore reaches the caller without
//! `initExitException`. With javac output the pre region only evaluates the
//! delegated call's arguments.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::bytecode::{self, opcodes::*, Assembly, BytecodeError, CodeWriter, Instruction, Item, Label};
use crate::classfile::{
    AttributeInfo, ClassFile, ClassFileError, CodeAttribute, ConstantPool, ExceptionTableEntry, MethodInfo,
    VerificationTypeInfo, ACC_FINAL, ACC_PUBLIC, ACC_STATIC, STACK_MAP_MAJOR_VERSION,
};
use crate::config::CallbackLocator;
use crate::descriptor::{DescriptorError, FieldType, MethodType};
use crate::hierarchy::MethodSignature;
use crate::stackmap::{self, Frame};

pub const ENTER: &str = "enter";
pub const EXIT_RETURN: &str = "exitReturn";
pub const EXIT_THROW: &str = "exitThrow";
pub const EXIT_EXCEPTION: &str = "exitException";
pub const INIT_ENTER: &str = "initEnter";
pub const INIT_EXIT_EXCEPTION: &str = "initExitException";

const IDENTITY: &str = "Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;";
const THROWABLE: &str = "java/lang/Throwable";
const OBJECT: &str = "java/lang/Object";

/// Extra operand stack the advice needs on top of the original method.
const ADVICE_STACK: u16 = 8;

const MAIN_HANDLER: Label = Label::Synthetic(0);
const PRE_HANDLER: Label = Label::Synthetic(1);

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("{class}: marked method {signature} is not declared here")]
    MissingMethod { class: String, signature: MethodSignature },
    #[error("{class}.{method}: no delegating constructor call")]
    NoDelegatingCall { class: String, method: String },
    #[error("{class}.{method}: return instruction does not match the declared return type")]
    ReturnMismatch { class: String, method: String },
    #[error("{class}: callback holder already defines {member}")]
    HolderInitialised { class: String, member: String },
    #[error("{class}.{method}: {source}")]
    Bytecode { class: String, method: String, #[source] source: BytecodeError },
    #[error("{class}.{method}: {source}")]
    Descriptor { class: String, method: String, #[source] source: DescriptorError },
    #[error("{class}: {source}")]
    ClassFile { class: String, #[source] source: ClassFileError },
}

pub struct Rewriter<'a> {
    locator: &'a CallbackLocator,
}

/// Constant pool indices shared by all advice in one method.
struct AdviceRefs {
    callback: u16,
    enter: u16,
    exit_value: u16,
    exit_void: u16,
    exit_throw: u16,
    exit_exception: u16,
    init_enter: u16,
    init_exit_exception: u16,
    owner: u16,
    name: u16,
    descriptor: u16,
    object_class: u16,
}

impl AdviceRefs {
    fn new(cp: &mut ConstantPool, locator: &CallbackLocator, mark: &str, name: &str, descriptor: &str) -> Result<Self, ClassFileError> {
        let iface = locator.callback_interface.as_str();
        let m = |cp: &mut ConstantPool, method: &str, first: &str| {
            cp.interface_methodref(iface, method, &format!("({first}Ljava/lang/Object;{IDENTITY})V"))
        };
        Ok(Self {
            callback: cp.fieldref(&locator.holder, &locator.field, &locator.field_descriptor())?,
            enter: m(cp, ENTER, "[Ljava/lang/Object;")?,
            exit_value: m(cp, EXIT_RETURN, "Ljava/lang/Object;")?,
            exit_void: m(cp, EXIT_RETURN, "")?,
            exit_throw: m(cp, EXIT_THROW, "Ljava/lang/Throwable;")?,
            exit_exception: m(cp, EXIT_EXCEPTION, "Ljava/lang/Throwable;")?,
            init_enter: cp.interface_methodref(iface, INIT_ENTER, &format!("([Ljava/lang/Object;{IDENTITY})V"))?,
            init_exit_exception: cp.interface_methodref(
                iface,
                INIT_EXIT_EXCEPTION,
                &format!("(Ljava/lang/Throwable;{IDENTITY})V"),
            )?,
            owner: cp.string(mark)?,
            name: cp.string(name)?,
            descriptor: cp.string(descriptor)?,
            object_class: cp.class(OBJECT)?,
        })
    }
}

/// Builds advice snippets for one method.
struct Advice<'a> {
    cp: &'a mut ConstantPool,
    refs: AdviceRefs,
    method_type: &'a MethodType,
    is_static: bool,
    receiver: Option<u16>,
}

impl Advice<'_> {
    fn identity(&self, w: &mut CodeWriter, with_receiver: bool) {
        if with_receiver {
            match self.receiver {
                Some(slot) => w.load(ALOAD, slot),
                None => w.op(ACONST_NULL),
            };
        }
        w.ldc(self.refs.owner).ldc(self.refs.name).ldc(self.refs.descriptor);
    }

    fn boxed(&mut self, w: &mut CodeWriter, ty: &FieldType) -> Result<(), ClassFileError> {
        if let Some((wrapper, descriptor)) = ty.boxing() {
            let index = self.cp.methodref(wrapper, "valueOf", descriptor)?;
            w.op_u2(INVOKESTATIC, index);
        }
        Ok(())
    }

    fn arg_array(&mut self, w: &mut CodeWriter) -> Result<(), ClassFileError> {
        let params = self.method_type.params.clone();
        w.iconst(params.len() as i32).op_u2(ANEWARRAY, self.refs.object_class);
        let mut slot: u16 = if self.is_static { 0 } else { 1 };
        for (i, param) in params.iter().enumerate() {
            w.op(DUP).iconst(i as i32).load(param.load_opcode(), slot);
            self.boxed(w, param)?;
            w.op(AASTORE);
            slot += param.slots();
        }
        Ok(())
    }

    fn init_enter(&mut self) -> Result<Vec<u8>, ClassFileError> {
        let mut w = CodeWriter::new();
        w.op_u2(GETSTATIC, self.refs.callback);
        self.arg_array(&mut w)?;
        self.identity(&mut w, false);
        w.invokeinterface(self.refs.init_enter, 5);
        Ok(w.into_bytes())
    }

    fn enter(&mut self, store_receiver: bool) -> Result<Vec<u8>, ClassFileError> {
        let mut w = CodeWriter::new();
        if let (true, Some(slot)) = (store_receiver, self.receiver) {
            w.op(ALOAD_0).store(ASTORE, slot);
        }
        w.op_u2(GETSTATIC, self.refs.callback);
        self.arg_array(&mut w)?;
        self.identity(&mut w, true);
        w.invokeinterface(self.refs.enter, 6);
        Ok(w.into_bytes())
    }

    /// Advice placed before `opcode`, which returns or throws. Every `athrow`
    /// gets its own `exitThrow`, rethrows included.
    fn exit(&mut self, opcode: u8) -> Result<Option<Vec<u8>>, ClassFileError> {
        let mut w = CodeWriter::new();
        let (method, count) = match opcode {
            RETURN => {
                w.op_u2(GETSTATIC, self.refs.callback);
                (self.refs.exit_void, 5)
            }
            ARETURN => {
                w.op(DUP).op_u2(GETSTATIC, self.refs.callback).op(SWAP);
                (self.refs.exit_value, 6)
            }
            ATHROW => {
                w.op(DUP).op_u2(GETSTATIC, self.refs.callback).op(SWAP);
                (self.refs.exit_throw, 6)
            }
            IRETURN | LRETURN | FRETURN | DRETURN => {
                let Some(ret) = self.method_type.ret.clone().filter(FieldType::is_primitive) else {
                    return Ok(None);
                };
                w.op(if ret.slots() == 2 { DUP2 } else { DUP });
                self.boxed(&mut w, &ret)?;
                w.op_u2(GETSTATIC, self.refs.callback).op(SWAP);
                (self.refs.exit_value, 6)
            }
            _ => return Ok(Some(Vec::new())),
        };
        self.identity(&mut w, true);
        w.invokeinterface(method, count);
        Ok(Some(w.into_bytes()))
    }

    fn main_handler(&mut self) -> Vec<u8> {
        let mut w = CodeWriter::new();
        w.op(DUP).op_u2(GETSTATIC, self.refs.callback).op(SWAP);
        self.identity(&mut w, true);
        w.invokeinterface(self.refs.exit_exception, 6).op(ATHROW);
        w.into_bytes()
    }

    fn pre_handler(&mut self) -> Vec<u8> {
        let mut w = CodeWriter::new();
        w.op(DUP).op_u2(GETSTATIC, self.refs.callback).op(SWAP);
        self.identity(&mut w, false);
        w.invokeinterface(self.refs.init_exit_exception, 5).op(ATHROW);
        w.into_bytes()
    }
}

fn is_exit(opcode: u8) -> bool {
    matches!(opcode, IRETURN..=RETURN | ATHROW)
}

/// Index of the `invokespecial <init>` that initialises `this`: the first one
/// not paired with a preceding `new`.
fn delegating_call(cp: &ConstantPool, insns: &[Instruction]) -> Result<Option<usize>, ClassFileError> {
    let mut pending_new = 0usize;
    for (i, insn) in insns.iter().enumerate() {
        match insn.opcode {
            NEW => pending_new += 1,
            INVOKESPECIAL => {
                let Some(index) = insn.cp_index() else { continue };
                if cp.get_member_ref(index)?.name != "<init>" {
                    continue;
                }
                if pending_new == 0 {
                    return Ok(Some(i));
                }
                pending_new -= 1;
            }
            _ => {}
        }
    }
    Ok(None)
}

impl<'a> Rewriter<'a> {
    pub fn new(locator: &'a CallbackLocator) -> Self {
        Self { locator }
    }

    /// Wraps every method named in `marks`. Returns the number of methods
    /// rewritten; abstract and native methods are skipped.
    pub fn rewrite_class(
        &self,
        class: &mut ClassFile,
        marks: &BTreeMap<MethodSignature, String>,
    ) -> Result<usize, RewriteError> {
        let class_name = class.name().map_err(|source| RewriteError::ClassFile { class: "?".into(), source })?.to_string();
        let cf_err = |source| RewriteError::ClassFile { class: class_name.clone(), source };

        let mut present = Vec::with_capacity(class.methods.len());
        for method in &class.methods {
            let cp = &class.constant_pool;
            present.push(MethodSignature::new(method.name(cp).map_err(cf_err)?, method.descriptor(cp).map_err(cf_err)?));
        }
        if let Some(missing) = marks.keys().find(|s| !present.contains(*s)) {
            return Err(RewriteError::MissingMethod { class: class_name, signature: missing.clone() });
        }

        let this_class = class.this_class;
        let major = class.major_version;
        let mut rewritten = 0;
        for (method, signature) in class.methods.iter_mut().zip(present) {
            let Some(mark) = marks.get(&signature) else { continue };
            if method.code().is_none() {
                debug!(class = %class_name, method = %signature, "no code, skipped");
                continue;
            }
            let target = MethodTarget { class_name: &class_name, this_class, major, signature: &signature, mark };
            self.wrap_method(&mut class.constant_pool, method, &target)?;
            rewritten += 1;
        }
        debug!(class = %class_name, methods = rewritten, "rewritten");
        Ok(rewritten)
    }

    /// Adds the static callback field and the `<clinit>` that fills it.
    pub fn augment_holder(&self, class: &mut ClassFile) -> Result<(), RewriteError> {
        let locator = self.locator;
        let class_name = class.name().map_err(|source| RewriteError::ClassFile { class: "?".into(), source })?.to_string();
        let cf_err = |source| RewriteError::ClassFile { class: class_name.clone(), source };

        if class.has_field(&locator.field).map_err(cf_err)? {
            return Err(RewriteError::HolderInitialised { class: class_name, member: locator.field.clone() });
        }
        if class.has_method_named("<clinit>").map_err(cf_err)? {
            return Err(RewriteError::HolderInitialised { class: class_name, member: "<clinit>".into() });
        }

        let field_descriptor = locator.field_descriptor();
        class.add_field(ACC_PUBLIC | ACC_STATIC | ACC_FINAL, &locator.field, &field_descriptor).map_err(cf_err)?;

        let cp = &mut class.constant_pool;
        let impl_class = cp.class(&locator.default_impl).map_err(cf_err)?;
        let constructor = cp.methodref(&locator.default_impl, "<init>", "()V").map_err(cf_err)?;
        let field = cp.fieldref(&locator.holder, &locator.field, &field_descriptor).map_err(cf_err)?;
        let mut w = CodeWriter::new();
        w.op_u2(NEW, impl_class).op(DUP).op_u2(INVOKESPECIAL, constructor).op_u2(PUTSTATIC, field).op(RETURN);
        let code = CodeAttribute::new(2, 0, w.into_bytes());
        class.add_method(ACC_STATIC, "<clinit>", "()V", Some(code)).map_err(cf_err)?;
        debug!(class = %class_name, field = %locator.field, default = %locator.default_impl, "callback holder initialised");
        Ok(())
    }

    fn wrap_method(&self, cp: &mut ConstantPool, method: &mut MethodInfo, target: &MethodTarget<'_>) -> Result<(), RewriteError> {
        let class = target.class_name;
        let name = target.signature.name.as_str();
        let descriptor = target.signature.descriptor.as_str();
        let cf_err = |source| RewriteError::ClassFile { class: class.to_string(), source };
        let bc_err = |source| RewriteError::Bytecode { class: class.to_string(), method: name.to_string(), source };

        let method_type = MethodType::parse(descriptor)
            .map_err(|source| RewriteError::Descriptor { class: class.to_string(), method: name.to_string(), source })?;
        let is_static = method.is_static();
        let is_constructor = name == "<init>" && !is_static;
        let Some(code) = method.code_mut() else { return Ok(()) };

        let insns = bytecode::decode(&code.code).map_err(bc_err)?;
        if insns.iter().any(Instruction::is_subroutine) {
            return Err(bc_err(BytecodeError::Subroutine));
        }
        let code_len = code.code.len() as u32;
        let original_max_locals = code.max_locals;
        let receiver = (!is_static).then_some(original_max_locals);

        // Instructions up to and including this index run before `this` exists.
        let split = if is_constructor {
            match delegating_call(cp, &insns).map_err(cf_err)? {
                Some(i) => Some(i),
                None => return Err(RewriteError::NoDelegatingCall { class: class.to_string(), method: name.to_string() }),
            }
        } else {
            None
        };

        let refs = AdviceRefs::new(cp, self.locator, target.mark, name, descriptor).map_err(cf_err)?;
        let mut advice = Advice { cp: &mut *cp, refs, method_type: &method_type, is_static, receiver };

        let mut items = Vec::with_capacity(insns.len() * 2 + 8);
        let body_start;
        match split {
            Some(split) => {
                items.push(Item::Advice(advice.init_enter().map_err(cf_err)?));
                for insn in &insns[..=split] {
                    items.push(Item::Bind(Label::Original(insn.offset)));
                    items.push(Item::Original(insn.clone()));
                }
                items.push(Item::Advice(advice.enter(true).map_err(cf_err)?));
                body_start = insns.get(split + 1).map_or(code_len, |i| i.offset);
            }
            None => {
                items.push(Item::Advice(advice.enter(true).map_err(cf_err)?));
                body_start = 0;
            }
        }
        let body = split.map_or(0, |s| s + 1);
        for insn in &insns[body..] {
            items.push(Item::Bind(Label::Original(insn.offset)));
            if is_exit(insn.opcode) {
                let exit = advice
                    .exit(insn.opcode)
                    .map_err(cf_err)?
                    .ok_or_else(|| RewriteError::ReturnMismatch { class: class.to_string(), method: name.to_string() })?;
                items.push(Item::Advice(exit));
            }
            items.push(Item::Original(insn.clone()));
        }
        items.push(Item::Bind(Label::Original(code_len)));
        items.push(Item::Bind(MAIN_HANDLER));
        items.push(Item::Advice(advice.main_handler()));
        let pre_range = split.map(|s| (insns[0].offset, insns[s].offset)).filter(|(start, end)| start < end);
        if pre_range.is_some() {
            items.push(Item::Bind(PRE_HANDLER));
            items.push(Item::Advice(advice.pre_handler()));
        }

        let asm = bytecode::assemble(&items).map_err(bc_err)?;
        let at = |label: Label| asm.offset(label).map_err(bc_err);
        let pc = |label: Label| at(label).map(|o| o as u16);

        let throwable = cp.class(THROWABLE).map_err(cf_err)?;
        let mut exception_table = Vec::with_capacity(code.exception_table.len() + 2);
        for entry in &code.exception_table {
            exception_table.push(ExceptionTableEntry {
                start_pc: pc(Label::Original(entry.start_pc as u32))?,
                end_pc: pc(Label::Original(entry.end_pc as u32))?,
                handler_pc: pc(Label::Original(entry.handler_pc as u32))?,
                catch_type: entry.catch_type,
            });
        }
        exception_table.push(ExceptionTableEntry {
            start_pc: pc(Label::Original(body_start))?,
            end_pc: pc(Label::Original(code_len))?,
            handler_pc: pc(MAIN_HANDLER)?,
            catch_type: throwable,
        });
        if let Some((start, end)) = pre_range {
            exception_table.push(ExceptionTableEntry {
                start_pc: pc(Label::Original(start))?,
                end_pc: pc(Label::Original(end))?,
                handler_pc: pc(PRE_HANDLER)?,
                catch_type: throwable,
            });
        }

        let mut attributes = Vec::with_capacity(code.attributes.len() + 1);
        let mut original_frames = None;
        for attr in std::mem::take(&mut code.attributes) {
            match attr {
                AttributeInfo::StackMapTable(table) => original_frames = Some(table),
                AttributeInfo::LineNumberTable { mut entries } => {
                    for e in &mut entries {
                        e.start_pc = pc(Label::Original(e.start_pc as u32))?;
                    }
                    attributes.push(AttributeInfo::LineNumberTable { entries });
                }
                AttributeInfo::LocalVariableTable { mut entries } => {
                    for e in &mut entries {
                        (e.start_pc, e.length) = relocate_range(&asm, e.start_pc, e.length).map_err(bc_err)?;
                    }
                    attributes.push(AttributeInfo::LocalVariableTable { entries });
                }
                AttributeInfo::LocalVariableTypeTable { mut entries } => {
                    for e in &mut entries {
                        (e.start_pc, e.length) = relocate_range(&asm, e.start_pc, e.length).map_err(bc_err)?;
                    }
                    attributes.push(AttributeInfo::LocalVariableTypeTable { entries });
                }
                AttributeInfo::Raw { name_index, info } => {
                    let attr_name = cp.get_utf8(name_index).map_err(cf_err)?;
                    if attr_name.ends_with("TypeAnnotations") {
                        debug!(class, method = name, attribute = attr_name, "dropped offset-bearing attribute");
                        continue;
                    }
                    attributes.push(AttributeInfo::Raw { name_index, info });
                }
                other => attributes.push(other),
            }
        }

        if target.major >= STACK_MAP_MAJOR_VERSION {
            let initial = stackmap::initial_locals(cp, class, target.this_class, name, &method_type, is_static)
                .map_err(cf_err)?;
            let expanded = match &original_frames {
                Some(table) => stackmap::expand(initial, table).map_err(cf_err)?,
                None => Vec::new(),
            };
            let this_type = VerificationTypeInfo::Object(target.this_class);
            let receiver_stored_after = split.map(|s| insns[s].offset);
            let mut frames = Vec::with_capacity(expanded.len() + 2);
            for frame in expanded {
                let relocate = |v: VerificationTypeInfo| match v {
                    VerificationTypeInfo::Uninitialized(o) => {
                        asm.instruction_offset(o as u32).map(|n| VerificationTypeInfo::Uninitialized(n as u16))
                    }
                    other => Ok(other),
                };
                let mut locals = frame.locals.into_iter().map(relocate).collect::<Result<Vec<_>, _>>().map_err(bc_err)?;
                let stack = frame.stack.into_iter().map(relocate).collect::<Result<Vec<_>, _>>().map_err(bc_err)?;
                let after_store = receiver_stored_after.map_or(true, |s| frame.offset > s);
                if receiver.is_some() && after_store {
                    stackmap::extend_locals(&mut locals, original_max_locals, this_type.clone());
                }
                frames.push(Frame { offset: at(Label::Original(frame.offset))?, locals, stack });
            }

            let throwable_type = VerificationTypeInfo::Object(throwable);
            let mut handler_locals = Vec::new();
            if receiver.is_some() {
                stackmap::extend_locals(&mut handler_locals, original_max_locals, this_type);
            }
            frames.push(Frame { offset: at(MAIN_HANDLER)?, locals: handler_locals, stack: vec![throwable_type.clone()] });
            if pre_range.is_some() {
                frames.push(Frame {
                    offset: at(PRE_HANDLER)?,
                    locals: vec![VerificationTypeInfo::UninitializedThis],
                    stack: vec![throwable_type],
                });
            }
            cp.utf8("StackMapTable").map_err(cf_err)?;
            attributes.push(AttributeInfo::StackMapTable(stackmap::encode(&frames).map_err(cf_err)?));
        }

        code.code = asm.code;
        code.exception_table = exception_table;
        code.attributes = attributes;
        code.max_stack = code.max_stack.saturating_add(ADVICE_STACK);
        if receiver.is_some() {
            code.max_locals = original_max_locals.saturating_add(1);
        }
        Ok(())
    }
}

struct MethodTarget<'a> {
    class_name: &'a str,
    this_class: u16,
    major: u16,
    signature: &'a MethodSignature,
    mark: &'a str,
}

fn relocate_range(asm: &Assembly, start: u16, length: u16) -> Result<(u16, u16), BytecodeError> {
    let new_start = asm.offset(Label::Original(start as u32))?;
    let new_end = asm.offset(Label::Original(start as u32 + length as u32))?;
    Ok((new_start as u16, (new_end - new_start) as u16))
}
