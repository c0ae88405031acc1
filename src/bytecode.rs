//! Instruction-level view of a `Code` array.
//!
//! [`decode`] turns raw bytecode into [`Instruction`]s whose branch operands are
//! absolute offsets into the original array. [`assemble`] lays out a mix of
//! original instructions, straight-line advice and [`Label`]s, recomputing
//! switch padding and branch displacements for the new positions.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

/// Upper bound on the length of a method's code array.
pub const MAX_CODE_LENGTH: usize = 65535;

pub mod opcodes {
    pub const ACONST_NULL: u8 = 0x01;
    pub const ICONST_M1: u8 = 0x02;
    pub const ICONST_0: u8 = 0x03;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const ILOAD: u8 = 0x15;
    pub const LLOAD: u8 = 0x16;
    pub const FLOAD: u8 = 0x17;
    pub const DLOAD: u8 = 0x18;
    pub const ALOAD: u8 = 0x19;
    pub const ILOAD_0: u8 = 0x1a;
    pub const ALOAD_0: u8 = 0x2a;
    pub const ISTORE: u8 = 0x36;
    pub const ASTORE: u8 = 0x3a;
    pub const ISTORE_0: u8 = 0x3b;
    pub const ASTORE_0: u8 = 0x4b;
    pub const AASTORE: u8 = 0x53;
    pub const POP: u8 = 0x57;
    pub const DUP: u8 = 0x59;
    pub const DUP2: u8 = 0x5c;
    pub const SWAP: u8 = 0x5f;
    pub const IINC: u8 = 0x84;
    pub const IFEQ: u8 = 0x99;
    pub const GOTO: u8 = 0xa7;
    pub const JSR: u8 = 0xa8;
    pub const RET: u8 = 0xa9;
    pub const TABLESWITCH: u8 = 0xaa;
    pub const LOOKUPSWITCH: u8 = 0xab;
    pub const IRETURN: u8 = 0xac;
    pub const LRETURN: u8 = 0xad;
    pub const FRETURN: u8 = 0xae;
    pub const DRETURN: u8 = 0xaf;
    pub const ARETURN: u8 = 0xb0;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const PUTSTATIC: u8 = 0xb3;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const INVOKEINTERFACE: u8 = 0xb9;
    pub const NEW: u8 = 0xbb;
    pub const ANEWARRAY: u8 = 0xbd;
    pub const ATHROW: u8 = 0xbf;
    pub const WIDE: u8 = 0xc4;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;
}

use opcodes::*;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("unknown opcode {opcode:#04x} at {offset}")]
    UnknownOpcode { opcode: u8, offset: u32 },
    #[error("truncated instruction at {0}")]
    Truncated(u32),
    #[error("branch at {offset} targets {target}, which is not an instruction boundary")]
    InvalidBranchTarget { offset: u32, target: i64 },
    /// A conditional branch moved out of 16-bit range once advice was
    /// inserted. Only `goto` is widened; the method cannot be rewritten.
    #[error("branch displacement {0} does not fit in 16 bits")]
    BranchOverflow(i64),
    #[error("code length {0} exceeds 65535 bytes")]
    CodeTooLarge(usize),
    #[error("jsr/ret subroutines are not supported")]
    Subroutine,
    #[error("label {0:?} was never bound")]
    UnboundLabel(Label),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Operand bytes copied verbatim (empty for zero-operand instructions).
    /// For `wide` this includes the modified opcode.
    Fixed(Vec<u8>),
    Branch(u32),
    WideBranch(u32),
    TableSwitch { default: u32, low: i32, high: i32, targets: Vec<u32> },
    LookupSwitch { default: u32, pairs: Vec<(i32, u32)> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub offset: u32,
    pub opcode: u8,
    pub operand: Operand,
}

impl Instruction {
    pub fn is_subroutine(&self) -> bool {
        match (&self.operand, self.opcode) {
            (_, JSR | JSR_W | RET) => true,
            (Operand::Fixed(bytes), WIDE) => bytes.first() == Some(&RET),
            _ => false,
        }
    }

    /// Constant pool index of instructions that carry one as their first
    /// two operand bytes (`invokespecial`, `new`, `getstatic`, ...).
    pub fn cp_index(&self) -> Option<u16> {
        match (&self.operand, self.opcode) {
            (Operand::Fixed(bytes), GETSTATIC..=INVOKEINTERFACE | NEW | ANEWARRAY) if bytes.len() >= 2 => {
                Some(u16::from_be_bytes([bytes[0], bytes[1]]))
            }
            _ => None,
        }
    }
}

/// Length of the operand bytes that follow a fixed-size opcode, or `None`
/// for opcodes that need special handling (or do not exist).
fn fixed_operand_len(opcode: u8) -> Option<usize> {
    Some(match opcode {
        0x00..=0x0f => 0,
        BIPUSH | LDC => 1,
        SIPUSH | LDC_W | 0x14 => 2,
        ILOAD..=ALOAD => 1,
        0x1a..=0x35 => 0,
        ISTORE..=ASTORE => 1,
        0x3b..=0x83 => 0,
        IINC => 2,
        0x85..=0x98 => 0,
        RET => 1,
        IRETURN..=RETURN => 0,
        GETSTATIC..=INVOKESTATIC => 2,
        INVOKEINTERFACE | 0xba => 4,
        NEW => 2,
        0xbc => 1,
        ANEWARRAY => 2,
        0xbe | ATHROW => 0,
        0xc0 | 0xc1 => 2,
        0xc2 | 0xc3 => 0,
        0xc5 => 3,
        _ => return None,
    })
}

fn is_branch(opcode: u8) -> bool {
    matches!(opcode, IFEQ..=JSR | IFNULL | IFNONNULL)
}

struct CodeReader<'a> {
    code: &'a [u8],
    pos: usize,
    start: u32,
}

impl<'a> CodeReader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], BytecodeError> {
        let end = self.pos.checked_add(len).filter(|e| *e <= self.code.len()).ok_or(BytecodeError::Truncated(self.start))?;
        let slice = &self.code[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn i16(&mut self) -> Result<i16, BytecodeError> {
        let b = self.bytes(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, BytecodeError> {
        let b = self.bytes(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn target(&self, displacement: i64) -> Result<u32, BytecodeError> {
        let target = self.start as i64 + displacement;
        if target < 0 || target >= self.code.len() as i64 {
            return Err(BytecodeError::InvalidBranchTarget { offset: self.start, target });
        }
        Ok(target as u32)
    }
}

/// Decodes a code array. Branch targets are validated against the set of
/// instruction start offsets.
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>, BytecodeError> {
    if code.len() > MAX_CODE_LENGTH {
        return Err(BytecodeError::CodeTooLarge(code.len()));
    }
    let mut out = Vec::new();
    let mut r = CodeReader { code, pos: 0, start: 0 };

    while r.pos < code.len() {
        r.start = r.pos as u32;
        let opcode = code[r.pos];
        r.pos += 1;

        let operand = if is_branch(opcode) {
            let d = r.i16()? as i64;
            Operand::Branch(r.target(d)?)
        } else if opcode == GOTO_W || opcode == JSR_W {
            let d = r.i32()? as i64;
            Operand::WideBranch(r.target(d)?)
        } else if opcode == TABLESWITCH || opcode == LOOKUPSWITCH {
            let pad = (4 - (r.pos % 4)) % 4;
            r.bytes(pad)?;
            let d = r.i32()? as i64;
            let default = r.target(d)?;
            if opcode == TABLESWITCH {
                let low = r.i32()?;
                let high = r.i32()?;
                if high < low {
                    return Err(BytecodeError::Truncated(r.start));
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                let mut targets = Vec::with_capacity(count.min(code.len()));
                for _ in 0..count {
                    let d = r.i32()? as i64;
                    targets.push(r.target(d)?);
                }
                Operand::TableSwitch { default, low, high, targets }
            } else {
                let npairs = r.i32()?;
                if npairs < 0 {
                    return Err(BytecodeError::Truncated(r.start));
                }
                let mut pairs = Vec::with_capacity((npairs as usize).min(code.len()));
                for _ in 0..npairs {
                    let key = r.i32()?;
                    let d = r.i32()? as i64;
                    pairs.push((key, r.target(d)?));
                }
                Operand::LookupSwitch { default, pairs }
            }
        } else if opcode == WIDE {
            let modified = *r.bytes(1)?.first().ok_or(BytecodeError::Truncated(r.start))?;
            let len = match modified {
                IINC => 4,
                ILOAD..=ALOAD | ISTORE..=ASTORE | RET => 2,
                _ => return Err(BytecodeError::UnknownOpcode { opcode: modified, offset: r.start }),
            };
            let mut bytes = vec![modified];
            bytes.extend_from_slice(r.bytes(len)?);
            Operand::Fixed(bytes)
        } else {
            let len = fixed_operand_len(opcode).ok_or(BytecodeError::UnknownOpcode { opcode, offset: r.start })?;
            Operand::Fixed(r.bytes(len)?.to_vec())
        };

        out.push(Instruction { offset: r.start, opcode, operand });
    }

    let starts: HashSet<u32> = out.iter().map(|i| i.offset).collect();
    for insn in &out {
        let check = |t: u32| {
            if starts.contains(&t) {
                Ok(())
            } else {
                Err(BytecodeError::InvalidBranchTarget { offset: insn.offset, target: t as i64 })
            }
        };
        match &insn.operand {
            Operand::Branch(t) | Operand::WideBranch(t) => check(*t)?,
            Operand::TableSwitch { default, targets, .. } => {
                check(*default)?;
                targets.iter().try_for_each(|t| check(*t))?;
            }
            Operand::LookupSwitch { default, pairs } => {
                check(*default)?;
                pairs.iter().try_for_each(|(_, t)| check(*t))?;
            }
            Operand::Fixed(_) => {}
        }
    }

    Ok(out)
}

/// A position in assembled code. `Original(n)` names the start of the block
/// emitted for the original instruction at offset `n` (or the end of the
/// original code when `n` equals its length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Original(u32),
    Synthetic(u16),
}

#[derive(Debug, Clone)]
pub enum Item {
    Bind(Label),
    /// Straight-line code without branches.
    Advice(Vec<u8>),
    Original(Instruction),
}

#[derive(Debug, Clone)]
pub struct Assembly {
    pub code: Vec<u8>,
    labels: HashMap<Label, u32>,
    instructions: HashMap<u32, u32>,
}

impl Assembly {
    pub fn offset(&self, label: Label) -> Result<u32, BytecodeError> {
        self.labels.get(&label).copied().ok_or(BytecodeError::UnboundLabel(label))
    }

    /// New offset of the original instruction that started at `original`
    /// (which may differ from its label when advice precedes it).
    pub fn instruction_offset(&self, original: u32) -> Result<u32, BytecodeError> {
        self.instructions
            .get(&original)
            .copied()
            .ok_or(BytecodeError::UnboundLabel(Label::Original(original)))
    }
}

fn switch_padding(pos: usize) -> usize {
    (4 - ((pos + 1) % 4)) % 4
}

fn encoded_len(item: &Item, pos: usize, widened: bool) -> usize {
    match item {
        Item::Bind(_) => 0,
        Item::Advice(bytes) => bytes.len(),
        Item::Original(insn) => match &insn.operand {
            Operand::Fixed(bytes) => 1 + bytes.len(),
            Operand::Branch(_) if widened => 5,
            Operand::Branch(_) => 3,
            Operand::WideBranch(_) => 5,
            Operand::TableSwitch { targets, .. } => 1 + switch_padding(pos) + 12 + 4 * targets.len(),
            Operand::LookupSwitch { pairs, .. } => 1 + switch_padding(pos) + 8 + 8 * pairs.len(),
        },
    }
}

/// Positions of labels and original instructions for one layout of `items`.
struct Layout {
    labels: HashMap<Label, u32>,
    instructions: HashMap<u32, u32>,
    len: usize,
}

impl Layout {
    fn compute(items: &[Item], widened: &HashSet<usize>) -> Self {
        let mut labels = HashMap::new();
        let mut instructions = HashMap::new();
        let mut pos = 0usize;
        for (i, item) in items.iter().enumerate() {
            match item {
                Item::Bind(label) => {
                    labels.insert(*label, pos as u32);
                }
                Item::Original(insn) => {
                    instructions.insert(insn.offset, pos as u32);
                }
                Item::Advice(_) => {}
            }
            pos += encoded_len(item, pos, widened.contains(&i));
        }
        Self { labels, instructions, len: pos }
    }

    fn target(&self, target: u32) -> Result<i64, BytecodeError> {
        self.labels
            .get(&Label::Original(target))
            .map(|p| *p as i64)
            .ok_or(BytecodeError::UnboundLabel(Label::Original(target)))
    }
}

/// Lays out and encodes `items`.
///
/// A `goto` whose displacement no longer fits in 16 bits is widened to
/// `goto_w`, repeating the layout until it is stable. Conditional branches are
/// never widened: an out-of-range one fails with
/// [`BytecodeError::BranchOverflow`].
pub fn assemble(items: &[Item]) -> Result<Assembly, BytecodeError> {
    let mut widened = HashSet::new();
    let layout = loop {
        let layout = Layout::compute(items, &widened);
        let mut grew = false;
        let mut pos = 0usize;
        for (i, item) in items.iter().enumerate() {
            if let Item::Original(Instruction { opcode: GOTO, operand: Operand::Branch(t), .. }) = item {
                if !widened.contains(&i) && i16::try_from(layout.target(*t)? - pos as i64).is_err() {
                    widened.insert(i);
                    grew = true;
                }
            }
            pos += encoded_len(item, pos, widened.contains(&i));
        }
        if !grew {
            break layout;
        }
    };
    if layout.len > MAX_CODE_LENGTH {
        return Err(BytecodeError::CodeTooLarge(layout.len));
    }

    let mut code = Vec::with_capacity(layout.len);
    for (i, item) in items.iter().enumerate() {
        let here = code.len() as i64;
        match item {
            Item::Bind(_) => {}
            Item::Advice(bytes) => code.extend_from_slice(bytes),
            Item::Original(insn) => {
                if widened.contains(&i) {
                    code.push(GOTO_W);
                } else {
                    code.push(insn.opcode);
                }
                let lookup = |t: u32| layout.target(t);
                match &insn.operand {
                    Operand::Fixed(bytes) => code.extend_from_slice(bytes),
                    Operand::Branch(t) if widened.contains(&i) => {
                        let d = (lookup(*t)? - here) as i32;
                        code.extend_from_slice(&d.to_be_bytes());
                    }
                    Operand::Branch(t) => {
                        let d = lookup(*t)? - here;
                        let d = i16::try_from(d).map_err(|_| BytecodeError::BranchOverflow(d))?;
                        code.extend_from_slice(&d.to_be_bytes());
                    }
                    Operand::WideBranch(t) => {
                        let d = (lookup(*t)? - here) as i32;
                        code.extend_from_slice(&d.to_be_bytes());
                    }
                    Operand::TableSwitch { default, low, high, targets } => {
                        code.resize(code.len() + switch_padding(here as usize), 0);
                        code.extend_from_slice(&((lookup(*default)? - here) as i32).to_be_bytes());
                        code.extend_from_slice(&low.to_be_bytes());
                        code.extend_from_slice(&high.to_be_bytes());
                        for t in targets {
                            code.extend_from_slice(&((lookup(*t)? - here) as i32).to_be_bytes());
                        }
                    }
                    Operand::LookupSwitch { default, pairs } => {
                        code.resize(code.len() + switch_padding(here as usize), 0);
                        code.extend_from_slice(&((lookup(*default)? - here) as i32).to_be_bytes());
                        code.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
                        for (key, t) in pairs {
                            code.extend_from_slice(&key.to_be_bytes());
                            code.extend_from_slice(&((lookup(*t)? - here) as i32).to_be_bytes());
                        }
                    }
                }
            }
        }
    }

    Ok(Assembly { code, labels: layout.labels, instructions: layout.instructions })
}

/// Emits straight-line advice code.
#[derive(Debug, Default, Clone)]
pub struct CodeWriter {
    bytes: Vec<u8>,
}

impl CodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.bytes.push(opcode);
        self
    }

    pub fn op_u2(&mut self, opcode: u8, operand: u16) -> &mut Self {
        self.bytes.push(opcode);
        self.bytes.extend_from_slice(&operand.to_be_bytes());
        self
    }

    pub fn ldc(&mut self, index: u16) -> &mut Self {
        match u8::try_from(index) {
            Ok(small) => {
                self.bytes.push(LDC);
                self.bytes.push(small);
                self
            }
            Err(_) => self.op_u2(LDC_W, index),
        }
    }

    pub fn iconst(&mut self, value: i32) -> &mut Self {
        match value {
            -1..=5 => self.op((ICONST_0 as i32 + value) as u8),
            -128..=127 => {
                self.bytes.push(BIPUSH);
                self.bytes.push(value as i8 as u8);
                self
            }
            _ => self.op_u2(SIPUSH, value as i16 as u16),
        }
    }

    /// `xload` with the compact form for slots 0..=3 and `wide` above 255.
    pub fn load(&mut self, opcode: u8, slot: u16) -> &mut Self {
        self.local(opcode, ILOAD, ILOAD_0, slot)
    }

    pub fn store(&mut self, opcode: u8, slot: u16) -> &mut Self {
        self.local(opcode, ISTORE, ISTORE_0, slot)
    }

    fn local(&mut self, opcode: u8, base: u8, short_base: u8, slot: u16) -> &mut Self {
        let kind = opcode - base;
        if slot <= 3 {
            self.op(short_base + kind * 4 + slot as u8)
        } else if slot <= 255 {
            self.bytes.push(opcode);
            self.bytes.push(slot as u8);
            self
        } else {
            self.bytes.push(WIDE);
            self.op_u2(opcode, slot)
        }
    }

    pub fn invokeinterface(&mut self, index: u16, count: u8) -> &mut Self {
        self.op_u2(INVOKEINTERFACE, index);
        self.bytes.push(count);
        self.bytes.push(0);
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
