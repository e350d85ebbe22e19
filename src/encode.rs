//! C2: instruction encoder (§4.2).
//!
//! Grounded on a record-to-bytes writer direction: one function per payload
//! shape, dispatched on a tag. Here the tag is `Opcode`/`Immediate` instead
//! of a bitstream abbreviation id, and every write additionally threads the
//! running stack-depth and FPI-region state a plain bitstream codec has no
//! equivalent of.

use crate::depth::{ClosedFpi, DepthTracker};
use crate::error::{Context, Error, Result};
use crate::fixup::{self, BlockInfo, DepthMismatch};
use crate::model::{BlockId, Function, KILLED_LOCAL_SENTINEL};
use crate::opcode::{Immediate, Instruction, IterKind, MemberKey, MemberKeyBase, Opcode, RepoAuthType};
use crate::sink::VecSink;
use std::collections::HashMap;

/// Side effects of encoding one instruction that the unit driver must file
/// into the function's metadata tables (§4.6): a closed FPI region from an
/// `fcall`, or a freshly recorded `defClsMap` entry.
#[derive(Debug, Default)]
pub struct InstrOutcome {
    pub fpi_closed: Option<ClosedFpi>,
}

fn checked_map_local(function: &Function, raw_id: u32, ctx: &Context) -> Result<u32> {
    let mapped = function.map_local(raw_id);
    if mapped == KILLED_LOCAL_SENTINEL {
        return Err(Error::KilledLocalReferenced {
            raw_id,
            ctx: ctx.clone(),
        });
    }
    Ok(mapped)
}

fn emit_repo_auth_type(sink: &mut VecSink, rat: &RepoAuthType) {
    match &rat.class_name {
        Some(name) => {
            sink.emit_byte(1);
            let id = sink.merge_litstr(name);
            sink.emit_iva(u64::from(id));
        }
        None => sink.emit_byte(0),
    }
    sink.emit_iva(rat.bits.len() as u64);
    for byte in &rat.bits {
        sink.emit_byte(*byte);
    }
}

fn member_key_base_tag(base: &MemberKeyBase) -> u8 {
    match base {
        MemberKeyBase::CellOnStack(_) => 0,
        MemberKeyBase::Local(_) => 1,
        MemberKeyBase::String(_) => 2,
        MemberKeyBase::Int(_) => 3,
        MemberKeyBase::NewElem => 4,
    }
}

fn emit_member_key_base(
    sink: &mut VecSink,
    function: &Function,
    base: &MemberKeyBase,
    ctx: &Context,
) -> Result<()> {
    sink.emit_byte(member_key_base_tag(base));
    match base {
        MemberKeyBase::CellOnStack(slot) => sink.emit_iva(u64::from(*slot)),
        MemberKeyBase::Local(raw) => {
            let mapped = checked_map_local(function, *raw, ctx)?;
            sink.emit_iva(u64::from(mapped));
        }
        MemberKeyBase::String(s) => {
            let id = sink.merge_litstr(s);
            sink.emit_i32(id as i32);
        }
        MemberKeyBase::Int(v) => sink.emit_i64(*v),
        MemberKeyBase::NewElem => {}
    }
    Ok(())
}

fn emit_member_key(sink: &mut VecSink, function: &Function, key: &MemberKey, ctx: &Context) -> Result<()> {
    match key {
        MemberKey::Elem(base) => {
            sink.emit_byte(0);
            emit_member_key_base(sink, function, base, ctx)
        }
        MemberKey::Prop(base) => {
            sink.emit_byte(1);
            emit_member_key_base(sink, function, base, ctx)
        }
    }
}

/// A local range's raw ids must compact to a contiguous mapped range
/// (`first + restCount < |locals|`, §3 "Local mapping"); overrun is a fatal
/// malformation, but post-compaction contiguity is trusted rather than
/// re-checked (§1 Non-goals: no IR validation).
fn emit_local_range(
    sink: &mut VecSink,
    function: &Function,
    first: u32,
    count: u32,
    ctx: &Context,
) -> Result<()> {
    let num_locals = function.locals.len() as u32;
    if first.saturating_add(count) > num_locals {
        return Err(Error::LocalRangeOverrun {
            first,
            count,
            num_locals,
            ctx: ctx.clone(),
        });
    }
    let mapped_first = if count == 0 {
        0
    } else {
        checked_map_local(function, first, ctx)?
    };
    sink.emit_iva(u64::from(mapped_first));
    sink.emit_iva(u64::from(count));
    Ok(())
}

fn emit_immediate(sink: &mut VecSink, function: &Function, imm: &Immediate, ctx: &Context) -> Result<()> {
    match imm {
        Immediate::None => {}
        Immediate::UInt(v) => sink.emit_iva(*v),
        Immediate::Int64(v) => sink.emit_i64(*v),
        Immediate::Double(v) => sink.emit_f64(*v),
        Immediate::Str(s) => {
            let id = sink.merge_litstr(s);
            sink.emit_i32(id as i32);
        }
        Immediate::Arr(arr) => {
            let id = sink.merge_array(&arr.0);
            sink.emit_i32(id as i32);
        }
        Immediate::Rat(rat) => emit_repo_auth_type(sink, rat),
        Immediate::Local(raw) => {
            let mapped = checked_map_local(function, *raw, ctx)?;
            sink.emit_iva(u64::from(mapped));
        }
        Immediate::Iter(id) => sink.emit_iva(u64::from(*id)),
        Immediate::ClsRefSlot(id) => sink.emit_iva(u64::from(*id)),
        Immediate::SubOp(n) => sink.emit_byte(*n),
        Immediate::IterTable(entries) => {
            sink.emit_i32(entries.len() as i32);
            for (kind, id) in entries {
                let kind_int = match kind {
                    IterKind::Normal => 0,
                    IterKind::KeyValue => 1,
                };
                sink.emit_i32(kind_int);
                sink.emit_i32(*id as i32);
            }
        }
        Immediate::MemberKey(key) => emit_member_key(sink, function, key, ctx)?,
        Immediate::LocalRange { first, count } => emit_local_range(sink, function, *first, *count, ctx)?,
        Immediate::StrVec(items) => {
            sink.emit_i32(items.len() as i32);
            for item in items {
                let id = sink.merge_litstr(item);
                sink.emit_i32(id as i32);
            }
        }
        Immediate::Branch(_) | Immediate::BranchTable(_) | Immediate::StringSwitch { .. } => {
            unreachable!("branch immediates are written by encode_instruction, not emit_immediate")
        }
    }
    Ok(())
}

/// Sentinel marking the fallback arm of a string-switch table; distinct
/// from any valid `u32` literal-string id, which `emit_iva` never produces
/// this way (§9 "string-switch sentinel" decision: always emitted, even
/// for a single-case switch).
const STRING_SWITCH_SENTINEL: i32 = -1;

/// Turn a rejected expected-depth mismatch into the crate's `Error`,
/// projecting whichever of (stack, FPI) disagreed into the single
/// `ExpectedDepthMismatch` shape (§7 only tracks the stack-depth case
/// in its diagnostic payload; an FPI-depth mismatch is equally fatal
/// but reported with the same variant).
pub(crate) fn depth_mismatch_err(target: BlockId, mismatch: DepthMismatch, ctx: &Context) -> Error {
    let (expected, actual) = match mismatch {
        DepthMismatch::Stack { expected, actual } => (expected, actual),
        DepthMismatch::Fpi { expected, actual } => (expected as i64, actual as i64),
    };
    Error::ExpectedDepthMismatch {
        block: target,
        expected,
        actual,
        ctx: ctx.clone(),
    }
}

/// Encode one instruction: its opcode byte, immediate payload, and every
/// depth/FPI/defCls post-effect named in §4.2. `current_block` and
/// `op_offset` (recorded here) give branch targets the "relative to the
/// branch opcode's start" anchor the back-patching protocol needs.
pub fn encode_instruction(
    sink: &mut VecSink,
    block_infos: &mut [BlockInfo],
    depth: &mut DepthTracker,
    function: &Function,
    defcls_map: &mut HashMap<u32, u32>,
    contains_calls: &mut bool,
    current_block: BlockId,
    inst: &Instruction,
    class_name: Option<&str>,
) -> Result<InstrOutcome> {
    let ctx = Context::for_function(&function.name).with_block(current_block);
    let ctx = match class_name {
        Some(class) => ctx.with_class(class),
        None => ctx,
    };
    let op_offset = sink.emit_op(inst.op);
    let ctx = ctx.with_offset(op_offset);

    if let Some(loc) = inst.srcloc {
        sink.record_source_location(loc, op_offset);
    }

    let flags = inst.op.flags();
    if flags.ret && depth.current() != 1 {
        return Err(Error::BadReturnDepth {
            depth: depth.current(),
            ctx,
        });
    }

    let (pop, push) = inst.stack_effect();
    if !depth.apply(pop, push) {
        return Err(Error::StackUnderflow { ctx });
    }

    let mut outcome = InstrOutcome::default();

    match &inst.imm {
        Immediate::Branch(target) => {
            fixup::set_expected_depth(block_infos, *target, depth.current(), depth.fpi_depth())
                .map_err(|e| depth_mismatch_err(*target, e, &ctx))?;
            fixup::emit_branch_offset(sink, block_infos, *target, op_offset);
        }
        Immediate::BranchTable(targets) => {
            sink.emit_i32(targets.len() as i32);
            for target in targets {
                fixup::set_expected_depth(block_infos, *target, depth.current(), depth.fpi_depth())
                    .map_err(|e| depth_mismatch_err(*target, e, &ctx))?;
                fixup::emit_branch_offset(sink, block_infos, *target, op_offset);
            }
        }
        Immediate::StringSwitch { cases, default } => {
            // N = all cases plus the default entry, per the ISA's string-switch
            // table shape (§4.2): N-1 ⟨string,offset⟩ pairs, then the `-1`
            // sentinel, then one final offset for the default.
            sink.emit_i32(cases.len() as i32 + 1);
            for (s, target) in cases {
                let id = sink.merge_litstr(s);
                sink.emit_i32(id as i32);
                fixup::set_expected_depth(block_infos, *target, depth.current(), depth.fpi_depth())
                    .map_err(|e| depth_mismatch_err(*target, e, &ctx))?;
                fixup::emit_branch_offset(sink, block_infos, *target, op_offset);
            }
            sink.emit_i32(STRING_SWITCH_SENTINEL);
            fixup::set_expected_depth(block_infos, *default, depth.current(), depth.fpi_depth())
                .map_err(|e| depth_mismatch_err(*default, e, &ctx))?;
            fixup::emit_branch_offset(sink, block_infos, *default, op_offset);
        }
        other => emit_immediate(sink, function, other, &ctx)?,
    }

    if flags.fpush {
        depth.open_fpi(op_offset);
    }
    if flags.fcall {
        *contains_calls = true;
        outcome.fpi_closed = depth.close_top_fpi(sink.bc_pos());
    }
    if flags.defcls {
        let id = match &inst.imm {
            Immediate::UInt(v) => *v as u32,
            _ => 0,
        };
        if defcls_map.insert(id, op_offset).is_some() {
            return Err(Error::DuplicateDefCls { id, ctx });
        }
    }
    if flags.terminal {
        depth.reset_terminal();
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, Local, Section, SourceLocRange};

    fn function_with_one_local() -> Function {
        Function {
            locals: vec![Local {
                id: 0,
                name: None,
                killed: false,
            }],
            blocks: vec![
                Block {
                    id: BlockId(0),
                    instructions: Vec::new(),
                    section: Section::Main,
                    fallthrough: None,
                    fallthrough_ns: false,
                    factored_exits: Vec::new(),
                    exn_node: None,
                },
                Block {
                    id: BlockId(1),
                    instructions: Vec::new(),
                    section: Section::Main,
                    fallthrough: None,
                    fallthrough_ns: false,
                    factored_exits: Vec::new(),
                    exn_node: None,
                },
            ],
            ..Function::default()
        }
    }

    #[test]
    fn return_with_wrong_depth_is_rejected_before_its_pop() {
        let function = function_with_one_local();
        let mut sink = VecSink::new(0, "t".into());
        let mut infos = vec![BlockInfo::default(); 2];
        let mut depth = DepthTracker::new();
        let mut defcls = HashMap::new();
        let mut calls = false;

        let inst = Instruction {
            op: Opcode::RetC,
            imm: Immediate::None,
            srcloc: None,
        };
        let err = encode_instruction(
            &mut sink, &mut infos, &mut depth, &function, &mut defcls, &mut calls, BlockId(0), &inst, None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadReturnDepth { depth: 0, .. }));
    }

    #[test]
    fn killed_local_reference_is_rejected() {
        let mut function = function_with_one_local();
        function.locals[0].killed = true;
        function.locals[0].id = KILLED_LOCAL_SENTINEL;
        let mut sink = VecSink::new(0, "t".into());
        let mut infos = vec![BlockInfo::default(); 2];
        let mut depth = DepthTracker::new();
        let mut defcls = HashMap::new();
        let mut calls = false;

        let inst = Instruction {
            op: Opcode::CGetL,
            imm: Immediate::Local(0),
            srcloc: None,
        };
        let err = encode_instruction(
            &mut sink, &mut infos, &mut depth, &function, &mut defcls, &mut calls, BlockId(0), &inst, None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::KilledLocalReferenced { raw_id: 0, .. }));
    }

    #[test]
    fn fpush_then_fcall_closes_the_region_it_opened() {
        let function = function_with_one_local();
        let mut sink = VecSink::new(0, "t".into());
        let mut infos = vec![BlockInfo::default(); 2];
        let mut depth = DepthTracker::new();
        let mut defcls = HashMap::new();
        let mut calls = false;

        let fpush = Instruction {
            op: Opcode::FPushFuncD,
            imm: Immediate::UInt(0),
            srcloc: None,
        };
        encode_instruction(
            &mut sink, &mut infos, &mut depth, &function, &mut defcls, &mut calls, BlockId(0), &fpush, None,
        )
        .unwrap();
        assert_eq!(depth.fpi_depth(), 1);

        let fcall = Instruction {
            op: Opcode::FCall,
            imm: Immediate::SubOp(0),
            srcloc: None,
        };
        let outcome = encode_instruction(
            &mut sink, &mut infos, &mut depth, &function, &mut defcls, &mut calls, BlockId(0), &fcall, None,
        )
        .unwrap();
        assert!(outcome.fpi_closed.is_some());
        assert_eq!(depth.fpi_depth(), 0);
        assert!(calls);
    }

    #[test]
    fn duplicate_defcls_for_the_same_class_id_is_rejected() {
        let function = function_with_one_local();
        let mut sink = VecSink::new(0, "t".into());
        let mut infos = vec![BlockInfo::default(); 2];
        let mut depth = DepthTracker::new();
        let mut defcls = HashMap::new();
        let mut calls = false;

        let inst = Instruction {
            op: Opcode::DefCls,
            imm: Immediate::UInt(7),
            srcloc: None,
        };
        encode_instruction(
            &mut sink, &mut infos, &mut depth, &function, &mut defcls, &mut calls, BlockId(0), &inst, None,
        )
        .unwrap();
        let err = encode_instruction(
            &mut sink, &mut infos, &mut depth, &function, &mut defcls, &mut calls, BlockId(1), &inst, None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateDefCls { id: 7, .. }));
    }

    #[test]
    fn string_switch_always_emits_the_sentinel_default_arm() {
        let function = function_with_one_local();
        let mut sink = VecSink::new(0, "t".into());
        let mut infos = vec![BlockInfo::default(); 2];
        infos[0].offset = Some(0);
        infos[1].offset = Some(0);
        let mut depth = DepthTracker::new();
        depth.apply(0, 1);
        let mut defcls = HashMap::new();
        let mut calls = false;

        let inst = Instruction {
            op: Opcode::SSwitch,
            imm: Immediate::StringSwitch {
                cases: vec![("only".to_string(), BlockId(0))],
                default: BlockId(1),
            },
            srcloc: Some(SourceLocRange::default()),
        };
        encode_instruction(
            &mut sink, &mut infos, &mut depth, &function, &mut defcls, &mut calls, BlockId(0), &inst, None,
        )
        .unwrap();

        // op byte + i32(count=2) + i32(litstr id) + i32 branch + i32 sentinel + i32 branch
        assert_eq!(sink.bytecode.len(), 1 + 4 + 4 + 4 + 4 + 4);
    }
}
