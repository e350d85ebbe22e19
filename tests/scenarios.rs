//! Integration tests for Scenarios A-F (spec-level testable properties),
//! driven entirely through the public `emit_unit` entry point rather than
//! any single component, mirroring `tests/test_bitcode_reader.rs`'s
//! whole-pipeline style.

use hbc_emit::index::TableIndex;
use hbc_emit::model::{
    Block, BlockId, ExnInfo, ExnNode, Function, Param, Section, Unit,
};
use hbc_emit::opcode::{Immediate, Instruction, Opcode};
use hbc_emit::{emit_unit, EmitOptions};

fn marker(op: Opcode, imm: Immediate) -> Instruction {
    Instruction { op, imm, srcloc: None }
}

fn iter_free(id: u32) -> Instruction {
    marker(Opcode::IterFree, Immediate::Iter(id))
}

fn empty_block(id: u32, fallthrough: Option<u32>) -> Block {
    Block {
        id: BlockId(id),
        instructions: Vec::new(),
        section: Section::Main,
        fallthrough: fallthrough.map(BlockId),
        fallthrough_ns: false,
        factored_exits: Vec::new(),
        exn_node: None,
    }
}

fn trivial_pseudomain() -> Function {
    Function {
        blocks: vec![empty_block(0, None)],
        main_entry: BlockId(0),
        top_level: true,
        ..Function::default()
    }
}

fn unit_with_function(f: Function) -> Unit {
    Unit {
        pseudomain: trivial_pseudomain(),
        functions: vec![f],
        ..Unit::default()
    }
}

fn init() {
    let _ = env_logger::try_init();
}

#[test]
fn scenario_a_straight_line_fallthrough() {
    init();
    let mut f = Function {
        blocks: vec![
            empty_block(0, Some(1)),
            empty_block(1, Some(2)),
            empty_block(2, None),
        ],
        main_entry: BlockId(0),
        top_level: true,
        ..Function::default()
    };
    f.blocks[0].instructions.push(iter_free(10));
    f.blocks[1].instructions.push(iter_free(20));
    f.blocks[2].instructions.push(iter_free(30));

    let unit = unit_with_function(f);
    let index = TableIndex::default();
    let sink = emit_unit(&unit, &index, EmitOptions::default()).unwrap();

    let func = &sink.functions[0];
    // Each IterFree is one opcode byte + a one-byte IVA; no synthesized
    // Jmp was inserted between any of the three blocks since each is
    // already next in layout order, so the body is exactly 6 bytes.
    assert_eq!(func.end_offset - func.start_offset, 6);
    let body = &sink.bytecode[func.start_offset as usize..func.end_offset as usize];
    assert_eq!(body, &[Opcode::IterFree as u8, 10, Opcode::IterFree as u8, 20, Opcode::IterFree as u8, 30]);
    assert!(func.eh_table.is_empty());
    assert!(func.fpi_table.is_empty());
}

#[test]
fn scenario_b_forward_branch_patches_to_the_resolved_offset() {
    init();
    let mut f = Function {
        blocks: vec![
            empty_block(0, Some(1)),
            empty_block(1, Some(2)),
            empty_block(2, None),
        ],
        main_entry: BlockId(0),
        top_level: true,
        ..Function::default()
    };
    f.blocks[0].instructions = vec![
        marker(Opcode::Int, Immediate::Int64(1)),
        marker(Opcode::JmpZ, Immediate::Branch(BlockId(2))),
    ];
    f.blocks[1].instructions = vec![iter_free(99)];

    let unit = unit_with_function(f);
    let index = TableIndex::default();
    let sink = emit_unit(&unit, &index, EmitOptions::default()).unwrap();

    let func = &sink.functions[0];
    // Int: 1 (op) + 8 (i64) = 9 bytes. JmpZ opcode sits at byte 9; its
    // branch immediate starts at byte 10.
    let jmpz_op_start = func.start_offset + 9;
    let immed_off = (jmpz_op_start + 1) as usize;
    let patched = i32::from_le_bytes(sink.bytecode[immed_off..immed_off + 4].try_into().unwrap());

    // Block 1 is one IterFree (2 bytes) placed immediately after block 0,
    // so block 2 starts 2 bytes after block 1's start.
    let block1_start = jmpz_op_start + 1 + 4;
    let block2_start = block1_start + 2;
    assert_eq!(patched, block2_start as i32 - jmpz_op_start as i32);
}

#[test]
fn scenario_c_entry_nop_is_rewritten() {
    init();
    let mut f = Function {
        blocks: vec![empty_block(0, Some(1)), empty_block(1, None)],
        main_entry: BlockId(0),
        top_level: true,
        ..Function::default()
    };
    f.blocks[0].instructions = vec![marker(Opcode::Nop, Immediate::None)];

    let unit = unit_with_function(f);
    let index = TableIndex::default();
    let sink = emit_unit(&unit, &index, EmitOptions::default()).unwrap();

    let func = &sink.functions[0];
    assert_eq!(sink.bytecode[func.start_offset as usize], Opcode::EntryNop as u8);
}

#[test]
fn scenario_d_fpi_region_survives_a_terminal_jmp() {
    init();
    let mut f = Function {
        blocks: vec![empty_block(0, None), empty_block(1, None)],
        main_entry: BlockId(0),
        top_level: true,
        ..Function::default()
    };
    f.blocks[0].instructions = vec![
        marker(Opcode::FPushFuncD, Immediate::UInt(0)),
        marker(Opcode::Jmp, Immediate::Branch(BlockId(1))),
    ];
    f.blocks[1].instructions = vec![marker(Opcode::FCall, Immediate::SubOp(0))];

    let unit = unit_with_function(f);
    let index = TableIndex::default();
    let sink = emit_unit(&unit, &index, EmitOptions::default()).unwrap();

    let func = &sink.functions[0];
    assert_eq!(func.fpi_table.len(), 1);
    assert_eq!(func.fpi_table[0].fpush_off, func.start_offset);
    assert!(func.contains_calls);
}

#[test]
fn scenario_e_catch_region_spans_its_blocks() {
    init();
    let mut f = Function {
        blocks: vec![
            empty_block(0, None),
            empty_block(1, None),
            empty_block(2, None),
            empty_block(3, None),
        ],
        main_entry: BlockId(0),
        top_level: true,
        ..Function::default()
    };
    f.exn_nodes.push(ExnNode {
        depth: 1,
        parent: None,
        info: ExnInfo::Catch {
            catch_entry: BlockId(3),
            iter_id: None,
            it_ref: false,
        },
    });
    let n0 = hbc_emit::model::ExnNodeId(0);
    f.blocks[0].exn_node = Some(n0);
    f.blocks[1].exn_node = Some(n0);
    f.blocks[0].instructions = vec![iter_free(1)];
    f.blocks[1].instructions = vec![iter_free(2)];
    f.blocks[2].instructions = vec![iter_free(3)];
    f.blocks[3].instructions = vec![iter_free(4)];

    let unit = unit_with_function(f);
    let index = TableIndex::default();
    let sink = emit_unit(&unit, &index, EmitOptions::default()).unwrap();

    let func = &sink.functions[0];
    assert_eq!(func.eh_table.len(), 1);
    let region = &func.eh_table[0];
    assert_eq!(region.parent_index, -1);
    assert_eq!(region.start, func.start_offset);
    // block0 and block1 are each 2 bytes (op + 1-byte IVA), so the region
    // closes at the start of block2.
    assert_eq!(region.past, func.start_offset + 4);
    match &region.kind {
        hbc_emit::sink::EhKind::Catch { handler, .. } => {
            assert_eq!(*handler, func.start_offset + 6);
        }
        hbc_emit::sink::EhKind::Fault { .. } => panic!("expected a Catch region"),
    }
}

#[test]
fn scenario_f_dv_initializer_funclet_offset() {
    init();
    let mut f = Function {
        blocks: vec![
            empty_block(0, Some(1)),
            empty_block(1, None),
            empty_block(2, None),
        ],
        main_entry: BlockId(0),
        top_level: true,
        ..Function::default()
    };
    f.blocks[0].instructions = vec![iter_free(1)];
    f.blocks[1].instructions = vec![iter_free(2)];
    f.params.push(Param {
        dv_entry: Some(BlockId(2)),
        type_constraint: None,
        user_type: None,
        default_expr: None,
        attributes: Vec::new(),
        by_ref: false,
        variadic: false,
        builtin_type: None,
    });

    let unit = unit_with_function(f);
    let index = TableIndex::default();
    let sink = emit_unit(&unit, &index, EmitOptions::default()).unwrap();

    let func = &sink.functions[0];
    assert_eq!(func.params.len(), 1);
    // M0 and M1 are each 2 bytes; D0 is laid out right after both.
    assert_eq!(func.params[0].funclet_off, Some(func.start_offset + 4));
}
