//! StackMapTable expansion and re-encoding.
//!
//! Compressed frames are only meaningful relative to their predecessor, so the
//! rewriter works on absolute [`Frame`]s: each one carries its code offset and
//! complete locals/stack. Locals are kept as verification entries (a `long`
//! is one entry covering two slots), which is the unit `chop` and `append`
//! count in.

use crate::classfile::{
    ClassFileError, ConstantPool, StackMapFrame, StackMapTableAttribute, VerificationTypeInfo,
};
use crate::descriptor::{FieldType, MethodType};
use crate::hierarchy::OBJECT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub offset: u32,
    pub locals: Vec<VerificationTypeInfo>,
    pub stack: Vec<VerificationTypeInfo>,
}

fn malformed() -> ClassFileError {
    ClassFileError::InvalidAttribute("StackMapTable".to_string())
}

pub fn verification_type(cp: &mut ConstantPool, ty: &FieldType) -> Result<VerificationTypeInfo, ClassFileError> {
    Ok(match ty {
        FieldType::Byte | FieldType::Char | FieldType::Int | FieldType::Short | FieldType::Boolean => {
            VerificationTypeInfo::Integer
        }
        FieldType::Float => VerificationTypeInfo::Float,
        FieldType::Long => VerificationTypeInfo::Long,
        FieldType::Double => VerificationTypeInfo::Double,
        FieldType::Object(name) => VerificationTypeInfo::Object(cp.class(name)?),
        FieldType::Array(_) => VerificationTypeInfo::Object(cp.class(&ty.to_string())?),
    })
}

/// Locals the verifier assumes at offset 0: the receiver (uninitialised in
/// constructors other than `Object`'s), then one entry per parameter.
pub fn initial_locals(
    cp: &mut ConstantPool,
    class_name: &str,
    this_class: u16,
    method_name: &str,
    method_type: &MethodType,
    is_static: bool,
) -> Result<Vec<VerificationTypeInfo>, ClassFileError> {
    let mut locals = Vec::with_capacity(method_type.params.len() + 1);
    if !is_static {
        if method_name == "<init>" && class_name != OBJECT {
            locals.push(VerificationTypeInfo::UninitializedThis);
        } else {
            locals.push(VerificationTypeInfo::Object(this_class));
        }
    }
    for param in &method_type.params {
        locals.push(verification_type(cp, param)?);
    }
    Ok(locals)
}

/// Expands a compressed table into absolute frames.
pub fn expand(initial: Vec<VerificationTypeInfo>, table: &StackMapTableAttribute) -> Result<Vec<Frame>, ClassFileError> {
    let mut frames = Vec::with_capacity(table.entries.len());
    let mut locals = initial;
    let mut offset: Option<u32> = None;

    for entry in &table.entries {
        let delta = entry.offset_delta() as u32;
        let at = match offset {
            None => delta,
            Some(prev) => prev + delta + 1,
        };
        offset = Some(at);

        let stack = match entry {
            StackMapFrame::Same { .. } | StackMapFrame::SameExtended { .. } => Vec::new(),
            StackMapFrame::SameLocals1StackItem { stack, .. }
            | StackMapFrame::SameLocals1StackItemExtended { stack, .. } => vec![stack.clone()],
            StackMapFrame::Chop { k, .. } => {
                let k = *k as usize;
                if k > locals.len() {
                    return Err(malformed());
                }
                locals.truncate(locals.len() - k);
                Vec::new()
            }
            StackMapFrame::Append { locals: more, .. } => {
                locals.extend(more.iter().cloned());
                Vec::new()
            }
            StackMapFrame::Full { locals: full, stack, .. } => {
                locals = full.clone();
                stack.clone()
            }
        };
        frames.push(Frame { offset: at, locals: locals.clone(), stack });
    }
    Ok(frames)
}

/// Slots covered by a run of verification entries.
pub fn slot_count(locals: &[VerificationTypeInfo]) -> u16 {
    locals.iter().map(VerificationTypeInfo::slots).sum()
}

/// Pads `locals` with `Top` up to `slots` and appends `extra`.
pub fn extend_locals(locals: &mut Vec<VerificationTypeInfo>, slots: u16, extra: VerificationTypeInfo) {
    let used = slot_count(locals);
    for _ in used..slots {
        locals.push(VerificationTypeInfo::Top);
    }
    locals.push(extra);
}

/// Encodes absolute frames, which must be sorted by strictly increasing
/// offset, as a table of full frames.
pub fn encode(frames: &[Frame]) -> Result<StackMapTableAttribute, ClassFileError> {
    let mut entries = Vec::with_capacity(frames.len());
    let mut prev: Option<u32> = None;
    for frame in frames {
        let delta = match prev {
            None => frame.offset,
            Some(p) if frame.offset > p => frame.offset - p - 1,
            Some(_) => return Err(malformed()),
        };
        let offset_delta = u16::try_from(delta).map_err(|_| malformed())?;
        entries.push(StackMapFrame::Full { offset_delta, locals: frame.locals.clone(), stack: frame.stack.clone() });
        prev = Some(frame.offset);
    }
    Ok(StackMapTableAttribute { entries })
}
