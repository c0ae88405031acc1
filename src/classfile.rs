//! Class file codec for Java 1.1 through 25.
//!
//! This module reads `.class` files into an editable model and writes them back.
//! Only the attributes the rewriter has to relocate are decoded structurally
//! (`Code`, `StackMapTable`, `LineNumberTable`, `LocalVariableTable`,
//! `LocalVariableTypeTable`). Every other attribute is carried as raw bytes and
//! re-emitted untouched, which is sound because the constant pool is only ever
//! appended to.

use std::collections::HashMap;

use thiserror::Error;

pub const MAGIC: u32 = 0xCAFE_BABE;

/// Highest class file major version the codec accepts (Java 25).
pub const MAX_MAJOR_VERSION: u16 = 69;

/// First class file version whose verifier requires a `StackMapTable`.
pub const STACK_MAP_MAJOR_VERSION: u16 = 50;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

impl MethodInfo {
    pub fn name<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        cp.get_utf8(self.name_index)
    }

    pub fn descriptor<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        cp.get_utf8(self.descriptor_index)
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn code(&self) -> Option<&CodeAttribute> {
        self.attributes.iter().find_map(|a| match a {
            AttributeInfo::Code(code) => Some(code),
            _ => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut CodeAttribute> {
        self.attributes.iter_mut().find_map(|a| match a {
            AttributeInfo::Code(code) => Some(code),
            _ => None,
        })
    }
}

/// Symbolic reference resolved out of a `Fieldref`, `Methodref` or
/// `InterfaceMethodref` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef<'a> {
    pub class_name: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CpKey {
    Utf8(String),
    Class(u16),
    String(u16),
    NameAndType(u16, u16),
    Fieldref(u16, u16),
    Methodref(u16, u16),
    InterfaceMethodref(u16, u16),
}

impl CpKey {
    fn of(info: &CpInfo) -> Option<Self> {
        Some(match info {
            CpInfo::Utf8(s) => CpKey::Utf8(s.clone()),
            CpInfo::Class { name_index } => CpKey::Class(*name_index),
            CpInfo::String { string_index } => CpKey::String(*string_index),
            CpInfo::NameAndType { name_index, descriptor_index } => CpKey::NameAndType(*name_index, *descriptor_index),
            CpInfo::Fieldref { class_index, name_and_type_index } => CpKey::Fieldref(*class_index, *name_and_type_index),
            CpInfo::Methodref { class_index, name_and_type_index } => CpKey::Methodref(*class_index, *name_and_type_index),
            CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
                CpKey::InterfaceMethodref(*class_index, *name_and_type_index)
            }
            _ => return None,
        })
    }
}

/// Constant pool with append-only interning.
///
/// Index 0 is unused, and the slot following a `Long` or `Double` is a
/// phantom `None` entry, mirroring the on-disk numbering.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Option<CpInfo>>,
    index: HashMap<CpKey, u16>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self { entries: vec![None], index: HashMap::new() }
    }

    /// The `constant_pool_count` value: number of slots including slot 0.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, index: u16) -> Result<&CpInfo, ClassFileError> {
        if index == 0 {
            return Err(ClassFileError::InvalidConstantPoolIndex(index));
        }
        self.entries
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(ClassFileError::InvalidConstantPoolIndex(index))
    }

    pub fn get_utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Utf8(s) => Ok(s.as_str()),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn get_class_name(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Class { name_index } => self.get_utf8(*name_index),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn get_member_ref(&self, index: u16) -> Result<MemberRef<'_>, ClassFileError> {
        let (class_index, nat_index) = match self.get(index)? {
            CpInfo::Fieldref { class_index, name_and_type_index }
            | CpInfo::Methodref { class_index, name_and_type_index }
            | CpInfo::InterfaceMethodref { class_index, name_and_type_index } => (*class_index, *name_and_type_index),
            _ => return Err(ClassFileError::InvalidConstantPoolIndex(index)),
        };
        let (name_index, descriptor_index) = match self.get(nat_index)? {
            CpInfo::NameAndType { name_index, descriptor_index } => (*name_index, *descriptor_index),
            _ => return Err(ClassFileError::InvalidConstantPoolIndex(nat_index)),
        };
        Ok(MemberRef {
            class_name: self.get_class_name(class_index)?,
            name: self.get_utf8(name_index)?,
            descriptor: self.get_utf8(descriptor_index)?,
        })
    }

    /// Looks up an existing `Utf8` entry without appending.
    pub fn find_utf8(&self, value: &str) -> Option<u16> {
        self.index.get(&CpKey::Utf8(value.to_string())).copied()
    }

    fn insert(&mut self, info: CpInfo) -> Result<u16, ClassFileError> {
        let key = CpKey::of(&info);
        if let Some(existing) = key.as_ref().and_then(|k| self.index.get(k)) {
            return Ok(*existing);
        }
        let width = if matches!(info, CpInfo::Long(_) | CpInfo::Double(_)) { 2 } else { 1 };
        if self.entries.len() + width > u16::MAX as usize {
            return Err(ClassFileError::ConstantPoolOverflow);
        }
        let index = self.entries.len() as u16;
        self.entries.push(Some(info));
        if width == 2 {
            self.entries.push(None);
        }
        if let Some(key) = key {
            self.index.insert(key, index);
        }
        Ok(index)
    }

    pub fn utf8(&mut self, value: &str) -> Result<u16, ClassFileError> {
        self.insert(CpInfo::Utf8(value.to_string()))
    }

    pub fn class(&mut self, name: &str) -> Result<u16, ClassFileError> {
        let name_index = self.utf8(name)?;
        self.insert(CpInfo::Class { name_index })
    }

    pub fn string(&mut self, value: &str) -> Result<u16, ClassFileError> {
        let string_index = self.utf8(value)?;
        self.insert(CpInfo::String { string_index })
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let name_index = self.utf8(name)?;
        let descriptor_index = self.utf8(descriptor)?;
        self.insert(CpInfo::NameAndType { name_index, descriptor_index })
    }

    pub fn fieldref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.class(owner)?;
        let name_and_type_index = self.name_and_type(name, descriptor)?;
        self.insert(CpInfo::Fieldref { class_index, name_and_type_index })
    }

    pub fn methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.class(owner)?;
        let name_and_type_index = self.name_and_type(name, descriptor)?;
        self.insert(CpInfo::Methodref { class_index, name_and_type_index })
    }

    pub fn interface_methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.class(owner)?;
        let name_and_type_index = self.name_and_type(name, descriptor)?;
        self.insert(CpInfo::InterfaceMethodref { class_index, name_and_type_index })
    }

    pub fn integer(&mut self, value: i32) -> Result<u16, ClassFileError> {
        self.insert(CpInfo::Integer(value))
    }
}

#[derive(Debug, Clone)]
pub enum CpInfo {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

#[derive(Debug, Clone)]
pub enum AttributeInfo {
    Code(CodeAttribute),
    StackMapTable(StackMapTableAttribute),
    LineNumberTable { entries: Vec<LineNumberEntry> },
    LocalVariableTable { entries: Vec<LocalVariableTableEntry> },
    LocalVariableTypeTable { entries: Vec<LocalVariableTypeTableEntry> },
    /// Any attribute the rewriter does not need to look inside.
    Raw { name_index: u16, info: Vec<u8> },
}

impl AttributeInfo {
    /// The attribute name as it appears in the constant pool.
    pub fn name<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        match self {
            AttributeInfo::Code(_) => Ok("Code"),
            AttributeInfo::StackMapTable(_) => Ok("StackMapTable"),
            AttributeInfo::LineNumberTable { .. } => Ok("LineNumberTable"),
            AttributeInfo::LocalVariableTable { .. } => Ok("LocalVariableTable"),
            AttributeInfo::LocalVariableTypeTable { .. } => Ok("LocalVariableTypeTable"),
            AttributeInfo::Raw { name_index, .. } => cp.get_utf8(*name_index),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<AttributeInfo>,
}

impl CodeAttribute {
    pub fn new(max_stack: u16, max_locals: u16, code: Vec<u8>) -> Self {
        Self { max_stack, max_locals, code, exception_table: Vec::new(), attributes: Vec::new() }
    }

    pub fn stack_map_table(&self) -> Option<&StackMapTableAttribute> {
        self.attributes.iter().find_map(|a| match a {
            AttributeInfo::StackMapTable(table) => Some(table),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone, Default)]
pub struct StackMapTableAttribute {
    pub entries: Vec<StackMapFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    Same { offset_delta: u16 },
    SameLocals1StackItem { offset_delta: u16, stack: VerificationTypeInfo },
    SameLocals1StackItemExtended { offset_delta: u16, stack: VerificationTypeInfo },
    Chop { offset_delta: u16, k: u8 },
    SameExtended { offset_delta: u16 },
    Append { offset_delta: u16, locals: Vec<VerificationTypeInfo> },
    Full { offset_delta: u16, locals: Vec<VerificationTypeInfo>, stack: Vec<VerificationTypeInfo> },
}

impl StackMapFrame {
    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { offset_delta }
            | StackMapFrame::SameLocals1StackItem { offset_delta, .. }
            | StackMapFrame::SameLocals1StackItemExtended { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::SameExtended { offset_delta }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationTypeInfo {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    Uninitialized(u16),
}

impl VerificationTypeInfo {
    /// Number of local variable slots the type occupies.
    pub fn slots(&self) -> u16 {
        match self {
            VerificationTypeInfo::Long | VerificationTypeInfo::Double => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariableTableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariableTypeTableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub signature_index: u16,
    pub index: u16,
}

#[derive(Debug, Clone, Error)]
pub enum ClassFileError {
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid magic: {0:#x}")]
    InvalidMagic(u32),
    #[error("unsupported class file version {0}")]
    UnsupportedVersion(u16),
    #[error("invalid constant pool index: {0}")]
    InvalidConstantPoolIndex(u16),
    #[error("invalid constant pool tag: {0}")]
    InvalidConstantPoolTag(u8),
    #[error("invalid modified UTF-8")]
    InvalidUtf8,
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
    #[error("constant pool exceeds 65535 entries")]
    ConstantPoolOverflow,
    #[error("{what} too large to encode: {len}")]
    TooLarge { what: &'static str, len: usize },
    #[error("attribute name {0} missing from constant pool")]
    MissingAttributeName(&'static str),
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u1(&mut self) -> Result<u8, ClassFileError> {
        if self.remaining() < 1 {
            return Err(ClassFileError::UnexpectedEof);
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u2(&mut self) -> Result<u16, ClassFileError> {
        if self.remaining() < 2 {
            return Err(ClassFileError::UnexpectedEof);
        }
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn read_u4(&mut self) -> Result<u32, ClassFileError> {
        if self.remaining() < 4 {
            return Err(ClassFileError::UnexpectedEof);
        }
        let v = u32::from_be_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        if self.remaining() < len {
            return Err(ClassFileError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u4()?;
        if magic != MAGIC {
            return Err(ClassFileError::InvalidMagic(magic));
        }

        let minor_version = r.read_u2()?;
        let major_version = r.read_u2()?;
        if !(45..=MAX_MAJOR_VERSION).contains(&major_version) {
            return Err(ClassFileError::UnsupportedVersion(major_version));
        }

        let constant_pool = parse_constant_pool(&mut r)?;

        let access_flags = r.read_u2()?;
        let this_class = r.read_u2()?;
        let super_class = r.read_u2()?;

        let interfaces_count = r.read_u2()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(r.read_u2()?);
        }

        let fields_count = r.read_u2()?;
        let mut fields = Vec::with_capacity(fields_count as usize);
        for _ in 0..fields_count {
            let (access_flags, name_index, descriptor_index, attributes) = parse_member(&mut r, &constant_pool)?;
            fields.push(FieldInfo { access_flags, name_index, descriptor_index, attributes });
        }

        let methods_count = r.read_u2()?;
        let mut methods = Vec::with_capacity(methods_count as usize);
        for _ in 0..methods_count {
            let (access_flags, name_index, descriptor_index, attributes) = parse_member(&mut r, &constant_pool)?;
            methods.push(MethodInfo { access_flags, name_index, descriptor_index, attributes });
        }

        let attributes = parse_attributes(&mut r, &constant_pool)?;
        if r.remaining() != 0 {
            return Err(ClassFileError::InvalidAttribute("trailing bytes after class".to_string()));
        }

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    /// Creates an empty Java 8 class with the given shape.
    pub fn new(access_flags: u16, name: &str, super_name: Option<&str>, interfaces: &[&str]) -> Result<Self, ClassFileError> {
        let mut constant_pool = ConstantPool::new();
        let this_class = constant_pool.class(name)?;
        let super_class = match super_name {
            Some(s) => constant_pool.class(s)?,
            None => 0,
        };
        let interfaces = interfaces
            .iter()
            .map(|i| constant_pool.class(i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            minor_version: 0,
            major_version: 52,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        })
    }

    pub fn name(&self) -> Result<&str, ClassFileError> {
        self.constant_pool.get_class_name(self.this_class)
    }

    pub fn super_name(&self) -> Result<Option<&str>, ClassFileError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool.get_class_name(self.super_class).map(Some)
    }

    pub fn interface_names(&self) -> Result<Vec<&str>, ClassFileError> {
        self.interfaces.iter().map(|i| self.constant_pool.get_class_name(*i)).collect()
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub fn add_field(&mut self, access_flags: u16, name: &str, descriptor: &str) -> Result<(), ClassFileError> {
        let name_index = self.constant_pool.utf8(name)?;
        let descriptor_index = self.constant_pool.utf8(descriptor)?;
        self.fields.push(FieldInfo { access_flags, name_index, descriptor_index, attributes: Vec::new() });
        Ok(())
    }

    pub fn add_method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        code: Option<CodeAttribute>,
    ) -> Result<(), ClassFileError> {
        let name_index = self.constant_pool.utf8(name)?;
        let descriptor_index = self.constant_pool.utf8(descriptor)?;
        let mut attributes = Vec::new();
        if let Some(code) = code {
            self.constant_pool.utf8("Code")?;
            if code.stack_map_table().is_some() {
                self.constant_pool.utf8("StackMapTable")?;
            }
            attributes.push(AttributeInfo::Code(code));
        }
        self.methods.push(MethodInfo { access_flags, name_index, descriptor_index, attributes });
        Ok(())
    }

    pub fn has_field(&self, name: &str) -> Result<bool, ClassFileError> {
        for field in &self.fields {
            if self.constant_pool.get_utf8(field.name_index)? == name {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn has_method_named(&self, name: &str) -> Result<bool, ClassFileError> {
        for method in &self.methods {
            if method.name(&self.constant_pool)? == name {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassFileError> {
        let cp = &self.constant_pool;
        let mut out = Vec::with_capacity(1024);
        put_u4(&mut out, MAGIC);
        put_u2(&mut out, self.minor_version);
        put_u2(&mut out, self.major_version);

        put_u2(&mut out, cp.entries.len() as u16);
        for entry in cp.entries.iter().skip(1).flatten() {
            write_cp_entry(&mut out, entry)?;
        }

        put_u2(&mut out, self.access_flags);
        put_u2(&mut out, self.this_class);
        put_u2(&mut out, self.super_class);

        put_count(&mut out, self.interfaces.len(), "interfaces")?;
        for i in &self.interfaces {
            put_u2(&mut out, *i);
        }

        put_count(&mut out, self.fields.len(), "fields")?;
        for f in &self.fields {
            put_u2(&mut out, f.access_flags);
            put_u2(&mut out, f.name_index);
            put_u2(&mut out, f.descriptor_index);
            write_attributes(&mut out, &f.attributes, cp)?;
        }

        put_count(&mut out, self.methods.len(), "methods")?;
        for m in &self.methods {
            put_u2(&mut out, m.access_flags);
            put_u2(&mut out, m.name_index);
            put_u2(&mut out, m.descriptor_index);
            write_attributes(&mut out, &m.attributes, cp)?;
        }

        write_attributes(&mut out, &self.attributes, cp)?;
        Ok(out)
    }
}

fn parse_constant_pool(r: &mut Reader) -> Result<ConstantPool, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut pool = ConstantPool { entries: Vec::with_capacity(count), index: HashMap::new() };
    pool.entries.push(None); // index 0 is unused

    let mut i = 1;
    while i < count {
        let tag = r.read_u1()?;
        let entry = match tag {
            1 => {
                let len = r.read_u2()? as usize;
                let bytes = r.read_bytes(len)?;
                CpInfo::Utf8(decode_modified_utf8(bytes)?)
            }
            3 => CpInfo::Integer(r.read_u4()? as i32),
            4 => CpInfo::Float(f32::from_bits(r.read_u4()?)),
            5 | 6 => {
                let high = r.read_u4()? as u64;
                let low = r.read_u4()? as u64;
                let bits = (high << 32) | low;
                let value = if tag == 5 { CpInfo::Long(bits as i64) } else { CpInfo::Double(f64::from_bits(bits)) };
                pool.entries.push(Some(value));
                pool.entries.push(None);
                i += 2;
                continue;
            }
            7 => CpInfo::Class { name_index: r.read_u2()? },
            8 => CpInfo::String { string_index: r.read_u2()? },
            9 => CpInfo::Fieldref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            10 => CpInfo::Methodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            11 => CpInfo::InterfaceMethodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            12 => CpInfo::NameAndType { name_index: r.read_u2()?, descriptor_index: r.read_u2()? },
            15 => CpInfo::MethodHandle { reference_kind: r.read_u1()?, reference_index: r.read_u2()? },
            16 => CpInfo::MethodType { descriptor_index: r.read_u2()? },
            17 => CpInfo::Dynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            18 => CpInfo::InvokeDynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            19 => CpInfo::Module { name_index: r.read_u2()? },
            20 => CpInfo::Package { name_index: r.read_u2()? },
            _ => return Err(ClassFileError::InvalidConstantPoolTag(tag)),
        };

        // first occurrence wins, so interning never aliases a later duplicate
        if let Some(key) = CpKey::of(&entry) {
            pool.index.entry(key).or_insert(i as u16);
        }
        pool.entries.push(Some(entry));
        i += 1;
    }

    Ok(pool)
}

type Member = (u16, u16, u16, Vec<AttributeInfo>);

fn parse_member(r: &mut Reader, cp: &ConstantPool) -> Result<Member, ClassFileError> {
    let access_flags = r.read_u2()?;
    let name_index = r.read_u2()?;
    let descriptor_index = r.read_u2()?;
    let attributes = parse_attributes(r, cp)?;
    Ok((access_flags, name_index, descriptor_index, attributes))
}

fn parse_attributes(r: &mut Reader, cp: &ConstantPool) -> Result<Vec<AttributeInfo>, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut attrs = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = r.read_u2()?;
        let length = r.read_u4()? as usize;
        let name = cp.get_utf8(name_index)?;
        let info_bytes = r.read_bytes(length)?;
        let mut sub = Reader::new(info_bytes);

        let attr = match name {
            "Code" => AttributeInfo::Code(parse_code_attribute(&mut sub, cp)?),
            "StackMapTable" => AttributeInfo::StackMapTable(parse_stack_map_table(&mut sub)?),
            "LineNumberTable" => {
                let num = sub.read_u2()? as usize;
                let mut entries = Vec::with_capacity(num);
                for _ in 0..num {
                    entries.push(LineNumberEntry { start_pc: sub.read_u2()?, line_number: sub.read_u2()? });
                }
                AttributeInfo::LineNumberTable { entries }
            }
            "LocalVariableTable" => {
                let num = sub.read_u2()? as usize;
                let mut entries = Vec::with_capacity(num);
                for _ in 0..num {
                    entries.push(LocalVariableTableEntry {
                        start_pc: sub.read_u2()?,
                        length: sub.read_u2()?,
                        name_index: sub.read_u2()?,
                        descriptor_index: sub.read_u2()?,
                        index: sub.read_u2()?,
                    });
                }
                AttributeInfo::LocalVariableTable { entries }
            }
            "LocalVariableTypeTable" => {
                let num = sub.read_u2()? as usize;
                let mut entries = Vec::with_capacity(num);
                for _ in 0..num {
                    entries.push(LocalVariableTypeTableEntry {
                        start_pc: sub.read_u2()?,
                        length: sub.read_u2()?,
                        name_index: sub.read_u2()?,
                        signature_index: sub.read_u2()?,
                        index: sub.read_u2()?,
                    });
                }
                AttributeInfo::LocalVariableTypeTable { entries }
            }
            _ => {
                let _ = sub.read_bytes(sub.remaining())?;
                AttributeInfo::Raw { name_index, info: info_bytes.to_vec() }
            }
        };

        if sub.remaining() != 0 {
            return Err(ClassFileError::InvalidAttribute(name.to_string()));
        }

        attrs.push(attr);
    }
    Ok(attrs)
}

fn parse_code_attribute(r: &mut Reader, cp: &ConstantPool) -> Result<CodeAttribute, ClassFileError> {
    let max_stack = r.read_u2()?;
    let max_locals = r.read_u2()?;
    let code_length = r.read_u4()? as usize;
    let code = r.read_bytes(code_length)?.to_vec();
    let exception_table_length = r.read_u2()? as usize;
    let mut exception_table = Vec::with_capacity(exception_table_length);
    for _ in 0..exception_table_length {
        exception_table.push(ExceptionTableEntry {
            start_pc: r.read_u2()?,
            end_pc: r.read_u2()?,
            handler_pc: r.read_u2()?,
            catch_type: r.read_u2()?,
        });
    }
    let attributes = parse_attributes(r, cp)?;
    Ok(CodeAttribute { max_stack, max_locals, code, exception_table, attributes })
}

fn parse_stack_map_table(r: &mut Reader) -> Result<StackMapTableAttribute, ClassFileError> {
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);
    for _ in 0..num {
        let frame_type = r.read_u1()?;
        let frame = match frame_type {
            0..=63 => StackMapFrame::Same { offset_delta: frame_type as u16 },
            64..=127 => {
                let stack = parse_verification_type_info(r)?;
                StackMapFrame::SameLocals1StackItem { offset_delta: (frame_type - 64) as u16, stack }
            }
            247 => {
                let offset_delta = r.read_u2()?;
                let stack = parse_verification_type_info(r)?;
                StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack }
            }
            248..=250 => {
                let offset_delta = r.read_u2()?;
                StackMapFrame::Chop { offset_delta, k: 251u8 - frame_type }
            }
            251 => {
                let offset_delta = r.read_u2()?;
                StackMapFrame::SameExtended { offset_delta }
            }
            252..=254 => {
                let offset_delta = r.read_u2()?;
                let count = (frame_type - 251) as usize;
                let mut locals = Vec::with_capacity(count);
                for _ in 0..count { locals.push(parse_verification_type_info(r)?); }
                StackMapFrame::Append { offset_delta, locals }
            }
            255 => {
                let offset_delta = r.read_u2()?;
                let num_locals = r.read_u2()? as usize;
                let mut locals = Vec::with_capacity(num_locals);
                for _ in 0..num_locals { locals.push(parse_verification_type_info(r)?); }
                let num_stack = r.read_u2()? as usize;
                let mut stack = Vec::with_capacity(num_stack);
                for _ in 0..num_stack { stack.push(parse_verification_type_info(r)?); }
                StackMapFrame::Full { offset_delta, locals, stack }
            }
            _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
        };
        entries.push(frame);
    }
    Ok(StackMapTableAttribute { entries })
}

fn parse_verification_type_info(r: &mut Reader) -> Result<VerificationTypeInfo, ClassFileError> {
    let tag = r.read_u1()?;
    let info = match tag {
        0 => VerificationTypeInfo::Top,
        1 => VerificationTypeInfo::Integer,
        2 => VerificationTypeInfo::Float,
        3 => VerificationTypeInfo::Double,
        4 => VerificationTypeInfo::Long,
        5 => VerificationTypeInfo::Null,
        6 => VerificationTypeInfo::UninitializedThis,
        7 => VerificationTypeInfo::Object(r.read_u2()?),
        8 => VerificationTypeInfo::Uninitialized(r.read_u2()?),
        _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
    };
    Ok(info)
}

/// Decodes the JVM's modified UTF-8 (`\0` as two bytes, supplementary
/// characters as surrogate pairs of three bytes each).
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, ClassFileError> {
    if bytes.iter().all(|&b| b != 0 && b < 0x80) {
        return String::from_utf8(bytes.to_vec()).map_err(|_| ClassFileError::InvalidUtf8);
    }
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let continuation = |b: Option<&u8>| match b {
        Some(&b) if b & 0xC0 == 0x80 => Ok((b & 0x3F) as u16),
        _ => Err(ClassFileError::InvalidUtf8),
    };
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != 0 && b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            units.push(((b & 0x1F) as u16) << 6 | continuation(bytes.get(i + 1))?);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            let hi = continuation(bytes.get(i + 1))?;
            let lo = continuation(bytes.get(i + 2))?;
            units.push(((b & 0x0F) as u16) << 12 | hi << 6 | lo);
            i += 3;
        } else {
            return Err(ClassFileError::InvalidUtf8);
        }
    }
    String::from_utf16(&units).map_err(|_| ClassFileError::InvalidUtf8)
}

pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x01..=0x7F => out.push(unit as u8),
            0x00 | 0x80..=0x7FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

fn put_u1(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

fn put_u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_count(out: &mut Vec<u8>, len: usize, what: &'static str) -> Result<(), ClassFileError> {
    let count = u16::try_from(len).map_err(|_| ClassFileError::TooLarge { what, len })?;
    put_u2(out, count);
    Ok(())
}

fn write_cp_entry(out: &mut Vec<u8>, entry: &CpInfo) -> Result<(), ClassFileError> {
    match entry {
        CpInfo::Utf8(s) => {
            let bytes = encode_modified_utf8(s);
            put_u1(out, 1);
            put_count(out, bytes.len(), "utf8 constant")?;
            out.extend_from_slice(&bytes);
        }
        CpInfo::Integer(v) => {
            put_u1(out, 3);
            put_u4(out, *v as u32);
        }
        CpInfo::Float(v) => {
            put_u1(out, 4);
            put_u4(out, v.to_bits());
        }
        CpInfo::Long(v) => {
            put_u1(out, 5);
            out.extend_from_slice(&v.to_be_bytes());
        }
        CpInfo::Double(v) => {
            put_u1(out, 6);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        CpInfo::Class { name_index } => {
            put_u1(out, 7);
            put_u2(out, *name_index);
        }
        CpInfo::String { string_index } => {
            put_u1(out, 8);
            put_u2(out, *string_index);
        }
        CpInfo::Fieldref { class_index, name_and_type_index } => {
            put_u1(out, 9);
            put_u2(out, *class_index);
            put_u2(out, *name_and_type_index);
        }
        CpInfo::Methodref { class_index, name_and_type_index } => {
            put_u1(out, 10);
            put_u2(out, *class_index);
            put_u2(out, *name_and_type_index);
        }
        CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
            put_u1(out, 11);
            put_u2(out, *class_index);
            put_u2(out, *name_and_type_index);
        }
        CpInfo::NameAndType { name_index, descriptor_index } => {
            put_u1(out, 12);
            put_u2(out, *name_index);
            put_u2(out, *descriptor_index);
        }
        CpInfo::MethodHandle { reference_kind, reference_index } => {
            put_u1(out, 15);
            put_u1(out, *reference_kind);
            put_u2(out, *reference_index);
        }
        CpInfo::MethodType { descriptor_index } => {
            put_u1(out, 16);
            put_u2(out, *descriptor_index);
        }
        CpInfo::Dynamic { bootstrap_method_attr_index, name_and_type_index } => {
            put_u1(out, 17);
            put_u2(out, *bootstrap_method_attr_index);
            put_u2(out, *name_and_type_index);
        }
        CpInfo::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
            put_u1(out, 18);
            put_u2(out, *bootstrap_method_attr_index);
            put_u2(out, *name_and_type_index);
        }
        CpInfo::Module { name_index } => {
            put_u1(out, 19);
            put_u2(out, *name_index);
        }
        CpInfo::Package { name_index } => {
            put_u1(out, 20);
            put_u2(out, *name_index);
        }
    }
    Ok(())
}

fn attribute_name_index(attr: &AttributeInfo, cp: &ConstantPool) -> Result<u16, ClassFileError> {
    let name: &'static str = match attr {
        AttributeInfo::Raw { name_index, .. } => return Ok(*name_index),
        AttributeInfo::Code(_) => "Code",
        AttributeInfo::StackMapTable(_) => "StackMapTable",
        AttributeInfo::LineNumberTable { .. } => "LineNumberTable",
        AttributeInfo::LocalVariableTable { .. } => "LocalVariableTable",
        AttributeInfo::LocalVariableTypeTable { .. } => "LocalVariableTypeTable",
    };
    cp.find_utf8(name).ok_or(ClassFileError::MissingAttributeName(name))
}

fn write_attributes(out: &mut Vec<u8>, attrs: &[AttributeInfo], cp: &ConstantPool) -> Result<(), ClassFileError> {
    put_count(out, attrs.len(), "attributes")?;
    for attr in attrs {
        put_u2(out, attribute_name_index(attr, cp)?);
        let mut body = Vec::new();
        match attr {
            AttributeInfo::Code(code) => write_code_attribute(&mut body, code, cp)?,
            AttributeInfo::StackMapTable(table) => write_stack_map_table(&mut body, table)?,
            AttributeInfo::LineNumberTable { entries } => {
                put_count(&mut body, entries.len(), "line number table")?;
                for e in entries {
                    put_u2(&mut body, e.start_pc);
                    put_u2(&mut body, e.line_number);
                }
            }
            AttributeInfo::LocalVariableTable { entries } => {
                put_count(&mut body, entries.len(), "local variable table")?;
                for e in entries {
                    put_u2(&mut body, e.start_pc);
                    put_u2(&mut body, e.length);
                    put_u2(&mut body, e.name_index);
                    put_u2(&mut body, e.descriptor_index);
                    put_u2(&mut body, e.index);
                }
            }
            AttributeInfo::LocalVariableTypeTable { entries } => {
                put_count(&mut body, entries.len(), "local variable type table")?;
                for e in entries {
                    put_u2(&mut body, e.start_pc);
                    put_u2(&mut body, e.length);
                    put_u2(&mut body, e.name_index);
                    put_u2(&mut body, e.signature_index);
                    put_u2(&mut body, e.index);
                }
            }
            AttributeInfo::Raw { info, .. } => body.extend_from_slice(info),
        }
        let len = u32::try_from(body.len()).map_err(|_| ClassFileError::TooLarge { what: "attribute", len: body.len() })?;
        put_u4(out, len);
        out.extend_from_slice(&body);
    }
    Ok(())
}

fn write_code_attribute(out: &mut Vec<u8>, code: &CodeAttribute, cp: &ConstantPool) -> Result<(), ClassFileError> {
    if code.code.is_empty() || code.code.len() > u16::MAX as usize {
        return Err(ClassFileError::TooLarge { what: "code", len: code.code.len() });
    }
    put_u2(out, code.max_stack);
    put_u2(out, code.max_locals);
    put_u4(out, code.code.len() as u32);
    out.extend_from_slice(&code.code);
    put_count(out, code.exception_table.len(), "exception table")?;
    for e in &code.exception_table {
        put_u2(out, e.start_pc);
        put_u2(out, e.end_pc);
        put_u2(out, e.handler_pc);
        put_u2(out, e.catch_type);
    }
    write_attributes(out, &code.attributes, cp)
}

fn write_stack_map_table(out: &mut Vec<u8>, table: &StackMapTableAttribute) -> Result<(), ClassFileError> {
    put_count(out, table.entries.len(), "stack map table")?;
    for frame in &table.entries {
        match frame {
            StackMapFrame::Same { offset_delta } => put_u1(out, *offset_delta as u8),
            StackMapFrame::SameLocals1StackItem { offset_delta, stack } => {
                put_u1(out, 64 + *offset_delta as u8);
                write_verification_type_info(out, stack);
            }
            StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack } => {
                put_u1(out, 247);
                put_u2(out, *offset_delta);
                write_verification_type_info(out, stack);
            }
            StackMapFrame::Chop { offset_delta, k } => {
                put_u1(out, 251 - *k);
                put_u2(out, *offset_delta);
            }
            StackMapFrame::SameExtended { offset_delta } => {
                put_u1(out, 251);
                put_u2(out, *offset_delta);
            }
            StackMapFrame::Append { offset_delta, locals } => {
                put_u1(out, 251 + locals.len() as u8);
                put_u2(out, *offset_delta);
                for l in locals {
                    write_verification_type_info(out, l);
                }
            }
            StackMapFrame::Full { offset_delta, locals, stack } => {
                put_u1(out, 255);
                put_u2(out, *offset_delta);
                put_count(out, locals.len(), "frame locals")?;
                for l in locals {
                    write_verification_type_info(out, l);
                }
                put_count(out, stack.len(), "frame stack")?;
                for s in stack {
                    write_verification_type_info(out, s);
                }
            }
        }
    }
    Ok(())
}

fn write_verification_type_info(out: &mut Vec<u8>, info: &VerificationTypeInfo) {
    match info {
        VerificationTypeInfo::Top => put_u1(out, 0),
        VerificationTypeInfo::Integer => put_u1(out, 1),
        VerificationTypeInfo::Float => put_u1(out, 2),
        VerificationTypeInfo::Double => put_u1(out, 3),
        VerificationTypeInfo::Long => put_u1(out, 4),
        VerificationTypeInfo::Null => put_u1(out, 5),
        VerificationTypeInfo::UninitializedThis => put_u1(out, 6),
        VerificationTypeInfo::Object(index) => {
            put_u1(out, 7);
            put_u2(out, *index);
        }
        VerificationTypeInfo::Uninitialized(offset) => {
            put_u1(out, 8);
            put_u2(out, *offset);
        }
    }
}
