//! Field and method descriptors (`I`, `Ljava/lang/String;`, `([BI)V`, ...).

use std::fmt;

use thiserror::Error;

use crate::bytecode::opcodes;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid descriptor: {0}")]
pub struct DescriptorError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    /// Internal name, e.g. `java/lang/String`.
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let (ty, rest) = Self::parse_prefix(descriptor)?;
        if !rest.is_empty() {
            return Err(DescriptorError(descriptor.to_string()));
        }
        Ok(ty)
    }

    fn parse_prefix(input: &str) -> Result<(Self, &str), DescriptorError> {
        let invalid = || DescriptorError(input.to_string());
        let mut chars = input.chars();
        let ty = match chars.next().ok_or_else(invalid)? {
            'B' => FieldType::Byte,
            'C' => FieldType::Char,
            'D' => FieldType::Double,
            'F' => FieldType::Float,
            'I' => FieldType::Int,
            'J' => FieldType::Long,
            'S' => FieldType::Short,
            'Z' => FieldType::Boolean,
            'L' => {
                let end = input.find(';').ok_or_else(invalid)?;
                let name = &input[1..end];
                if name.is_empty() {
                    return Err(invalid());
                }
                return Ok((FieldType::Object(name.to_string()), &input[end + 1..]));
            }
            '[' => {
                let (component, rest) = Self::parse_prefix(&input[1..])?;
                return Ok((FieldType::Array(Box::new(component)), rest));
            }
            _ => return Err(invalid()),
        };
        Ok((ty, chars.as_str()))
    }

    /// Local variable / operand stack slots taken by a value of this type.
    pub fn slots(&self) -> u16 {
        match self {
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self, FieldType::Object(_) | FieldType::Array(_))
    }

    /// The `xload` opcode that pushes a local of this type.
    pub fn load_opcode(&self) -> u8 {
        match self {
            FieldType::Long => opcodes::LLOAD,
            FieldType::Float => opcodes::FLOAD,
            FieldType::Double => opcodes::DLOAD,
            FieldType::Object(_) | FieldType::Array(_) => opcodes::ALOAD,
            _ => opcodes::ILOAD,
        }
    }

    /// Wrapper class and `valueOf` descriptor used to box a primitive.
    pub fn boxing(&self) -> Option<(&'static str, &'static str)> {
        Some(match self {
            FieldType::Byte => ("java/lang/Byte", "(B)Ljava/lang/Byte;"),
            FieldType::Char => ("java/lang/Character", "(C)Ljava/lang/Character;"),
            FieldType::Double => ("java/lang/Double", "(D)Ljava/lang/Double;"),
            FieldType::Float => ("java/lang/Float", "(F)Ljava/lang/Float;"),
            FieldType::Int => ("java/lang/Integer", "(I)Ljava/lang/Integer;"),
            FieldType::Long => ("java/lang/Long", "(J)Ljava/lang/Long;"),
            FieldType::Short => ("java/lang/Short", "(S)Ljava/lang/Short;"),
            FieldType::Boolean => ("java/lang/Boolean", "(Z)Ljava/lang/Boolean;"),
            FieldType::Object(_) | FieldType::Array(_) => return None,
        })
    }

    /// Name used in a `CONSTANT_Class` entry: the internal name for objects,
    /// the full descriptor for arrays.
    pub fn class_name(&self) -> Option<String> {
        match self {
            FieldType::Object(name) => Some(name.clone()),
            FieldType::Array(_) => Some(self.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Byte => f.write_str("B"),
            FieldType::Char => f.write_str("C"),
            FieldType::Double => f.write_str("D"),
            FieldType::Float => f.write_str("F"),
            FieldType::Int => f.write_str("I"),
            FieldType::Long => f.write_str("J"),
            FieldType::Short => f.write_str("S"),
            FieldType::Boolean => f.write_str("Z"),
            FieldType::Object(name) => write!(f, "L{name};"),
            FieldType::Array(component) => write!(f, "[{component}"),
        }
    }
}

/// Parameter list plus return type; `ret == None` is `V`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodType {
    pub params: Vec<FieldType>,
    pub ret: Option<FieldType>,
}

impl MethodType {
    pub fn new(params: Vec<FieldType>, ret: Option<FieldType>) -> Self {
        Self { params, ret }
    }

    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let invalid = || DescriptorError(descriptor.to_string());
        let mut rest = descriptor.strip_prefix('(').ok_or_else(invalid)?;
        let mut params = Vec::new();
        while !rest.starts_with(')') {
            if rest.is_empty() {
                return Err(invalid());
            }
            let (ty, tail) = FieldType::parse_prefix(rest).map_err(|_| invalid())?;
            params.push(ty);
            rest = tail;
        }
        let ret = match &rest[1..] {
            "V" => None,
            other => Some(FieldType::parse(other).map_err(|_| invalid())?),
        };
        Ok(Self { params, ret })
    }

    pub fn is_void(&self) -> bool {
        self.ret.is_none()
    }

    /// Slots taken by the parameters, not counting the receiver.
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(FieldType::slots).sum()
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for p in &self.params {
            write!(f, "{p}")?;
        }
        f.write_str(")")?;
        match &self.ret {
            Some(ret) => write!(f, "{ret}"),
            None => f.write_str("V"),
        }
    }
}
