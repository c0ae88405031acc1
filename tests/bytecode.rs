use jdbc_tracing::bytecode::opcodes::*;
use jdbc_tracing::bytecode::{assemble, decode, BytecodeError, CodeWriter, Item, Label, Operand};

const NOP: u8 = 0x00;

#[test]
fn decodes_branches_as_absolute_targets() {
    // 0: iload_1  1: ifeq +6 (-> 7)  4: iconst_1  5: ireturn  6: nop  7: iconst_0  8: ireturn
    let code = [0x1b, IFEQ, 0x00, 0x06, 0x04, IRETURN, 0x00, ICONST_0, IRETURN];
    let insns = decode(&code).unwrap();
    let offsets: Vec<u32> = insns.iter().map(|i| i.offset).collect();
    assert_eq!(offsets, [0, 1, 4, 5, 6, 7, 8]);
    assert_eq!(insns[1].operand, Operand::Branch(7));
}

#[test]
fn rejects_targets_inside_an_instruction() {
    // goto lands in the middle of sipush
    let code = [GOTO, 0x00, 0x04, SIPUSH, 0x00, 0x01, RETURN];
    assert!(matches!(decode(&code), Err(BytecodeError::InvalidBranchTarget { offset: 0, .. })));

    let code = [GOTO, 0x00, 0x10, RETURN];
    assert!(matches!(decode(&code), Err(BytecodeError::InvalidBranchTarget { offset: 0, target: 16 })));
}

#[test]
fn rejects_unknown_and_truncated() {
    assert!(matches!(decode(&[0xcb]), Err(BytecodeError::UnknownOpcode { opcode: 0xcb, offset: 0 })));
    assert!(matches!(decode(&[NOP, SIPUSH, 0x01]), Err(BytecodeError::Truncated(1))));
}

#[test]
fn decodes_wide_and_switches() {
    // 0: wide iload 300   4: tableswitch (pad 3) default/low/high/1 target   28: lookupswitch
    let mut code = vec![WIDE, ILOAD, 0x01, 0x2c];
    code.push(TABLESWITCH);
    code.extend_from_slice(&[0, 0, 0]);
    let table_at = 4i32;
    let end = 4 + 1 + 3 + 12 + 4;
    code.extend_from_slice(&(end - table_at).to_be_bytes());
    code.extend_from_slice(&0i32.to_be_bytes());
    code.extend_from_slice(&0i32.to_be_bytes());
    code.extend_from_slice(&(end - table_at).to_be_bytes());
    code.push(RETURN);
    assert_eq!(code.len() as i32, end + 1);

    let insns = decode(&code).unwrap();
    assert_eq!(insns[0].operand, Operand::Fixed(vec![ILOAD, 0x01, 0x2c]));
    assert_eq!(
        insns[1].operand,
        Operand::TableSwitch { default: end as u32, low: 0, high: 0, targets: vec![end as u32] }
    );
    assert!(!insns[0].is_subroutine());
}

#[test]
fn flags_subroutines() {
    let insns = decode(&[JSR, 0x00, 0x03, RETURN]).unwrap();
    assert!(insns[0].is_subroutine());
    let insns = decode(&[WIDE, RET, 0x01, 0x00]).unwrap();
    assert!(insns[0].is_subroutine());
}

#[test]
fn assembly_relocates_branches_around_advice() {
    // 0: iload_1  1: ifeq -> 5  4: return  5: return
    let code = [0x1b, IFEQ, 0x00, 0x04, RETURN, RETURN];
    let insns = decode(&code).unwrap();

    let mut items = vec![Item::Advice(vec![NOP; 3])];
    for insn in insns {
        items.push(Item::Bind(Label::Original(insn.offset)));
        if insn.opcode == RETURN {
            items.push(Item::Advice(vec![NOP; 2]));
        }
        items.push(Item::Original(insn));
    }
    items.push(Item::Bind(Label::Original(code.len() as u32)));
    items.push(Item::Bind(Label::Synthetic(0)));
    items.push(Item::Advice(vec![ATHROW]));

    let asm = assemble(&items).unwrap();
    // 3 advice + iload_1 + ifeq(3) + [2 advice + return] + [2 advice + return] + athrow
    assert_eq!(asm.code.len(), 3 + 1 + 3 + 3 + 3 + 1);
    assert_eq!(asm.offset(Label::Original(0)).unwrap(), 3);
    assert_eq!(asm.offset(Label::Original(5)).unwrap(), 10);
    // the label sits before the exit advice, the instruction after it
    assert_eq!(asm.instruction_offset(5).unwrap(), 12);
    assert_eq!(asm.offset(Label::Synthetic(0)).unwrap(), 13);

    // ifeq at 4 now jumps to the block for offset 5
    assert_eq!(asm.code[4], IFEQ);
    assert_eq!(i16::from_be_bytes([asm.code[5], asm.code[6]]), 6);
    assert!(matches!(asm.offset(Label::Synthetic(1)), Err(BytecodeError::UnboundLabel(_))));
}

#[test]
fn assembly_repads_switches() {
    // lookupswitch at 0 has 3 padding bytes; after one byte of advice it needs 2
    let mut code = vec![LOOKUPSWITCH, 0, 0, 0];
    code.extend_from_slice(&20i32.to_be_bytes());
    code.extend_from_slice(&1i32.to_be_bytes());
    code.extend_from_slice(&7i32.to_be_bytes());
    code.extend_from_slice(&20i32.to_be_bytes());
    code.push(RETURN);
    assert_eq!(code.len(), 21);
    let insns = decode(&code).unwrap();
    assert_eq!(insns[0].operand, Operand::LookupSwitch { default: 20, pairs: vec![(7, 20)] });

    let mut items = vec![Item::Advice(vec![NOP])];
    for insn in insns {
        items.push(Item::Bind(Label::Original(insn.offset)));
        items.push(Item::Original(insn));
    }
    let asm = assemble(&items).unwrap();
    assert_eq!(asm.code.len(), 21);
    assert_eq!(&asm.code[1..4], &[LOOKUPSWITCH, 0, 0]);
    assert_eq!(i32::from_be_bytes(asm.code[4..8].try_into().unwrap()), 19);

    let relocated = decode(&asm.code).unwrap();
    assert_eq!(relocated[1].operand, Operand::LookupSwitch { default: 20, pairs: vec![(7, 20)] });
}

/// Items for `code` with `padding` bytes of advice in front of the
/// instruction at `before`.
fn padded(code: &[u8], before: u32, padding: usize) -> Vec<Item> {
    let mut items = Vec::new();
    for insn in decode(code).unwrap() {
        items.push(Item::Bind(Label::Original(insn.offset)));
        if insn.offset == before {
            items.push(Item::Advice(vec![NOP; padding]));
        }
        items.push(Item::Original(insn));
    }
    items
}

#[test]
fn long_gotos_are_widened() {
    // 0: goto -> 4  3: nop  4: return
    let items = padded(&[GOTO, 0x00, 0x04, NOP, RETURN], 3, 40_000);
    let asm = assemble(&items).unwrap();

    assert_eq!(asm.code[0], GOTO_W);
    assert_eq!(i32::from_be_bytes(asm.code[1..5].try_into().unwrap()), 40_006);
    assert_eq!(asm.code.len(), 5 + 40_000 + 1 + 1);
    assert_eq!(asm.offset(Label::Original(3)).unwrap(), 5);
    assert_eq!(asm.instruction_offset(3).unwrap(), 40_005);
    assert_eq!(asm.offset(Label::Original(4)).unwrap(), 40_006);

    let relocated = decode(&asm.code).unwrap();
    assert_eq!(relocated[0].operand, Operand::WideBranch(40_006));
}

#[test]
fn short_gotos_stay_short() {
    let items = padded(&[GOTO, 0x00, 0x04, NOP, RETURN], 3, 100);
    let asm = assemble(&items).unwrap();
    assert_eq!(asm.code[0], GOTO);
    assert_eq!(i16::from_be_bytes([asm.code[1], asm.code[2]]), 104);
}

#[test]
fn long_conditional_branches_are_rejected() {
    // 0: iload_1  1: ifeq -> 5  4: return  5: return
    let items = padded(&[0x1b, IFEQ, 0x00, 0x04, RETURN, RETURN], 4, 40_000);
    assert!(matches!(assemble(&items), Err(BytecodeError::BranchOverflow(40_004))));
}

#[test]
fn code_writer_picks_compact_forms() {
    let mut w = CodeWriter::new();
    w.iconst(-1).iconst(5).iconst(6).iconst(-129).iconst(200);
    assert_eq!(w.into_bytes(), [ICONST_M1, 0x08, BIPUSH, 6, SIPUSH, 0xff, 0x7f, SIPUSH, 0x00, 0xc8]);

    let mut w = CodeWriter::new();
    w.load(ALOAD, 0).load(DLOAD, 3).load(ILOAD, 4).store(ASTORE, 2).store(ASTORE, 300);
    assert_eq!(w.into_bytes(), [ALOAD_0, 0x29, ILOAD, 4, 0x4d, WIDE, ASTORE, 0x01, 0x2c]);

    let mut w = CodeWriter::new();
    w.ldc(3).ldc(0x1234).invokeinterface(0x0102, 6);
    assert_eq!(w.into_bytes(), [LDC, 3, LDC_W, 0x12, 0x34, INVOKEINTERFACE, 0x01, 0x02, 6, 0]);
}
