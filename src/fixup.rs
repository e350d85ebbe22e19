//! C3: branch-fixup engine (§4.3).
//!
//! Grounded on `bitstream.rs::Abbreviation`/`AbbreviationId`: small
//! per-entity state records keyed by a stable id, with named constants for
//! reserved/sentinel values. `BlockInfo` here plays the same role, keyed by
//! `BlockId`, holding the per-block bookkeeping the back-patching protocol
//! needs.

use crate::depth::DepthTracker;
use crate::model::BlockId;
use crate::sink::VecSink;

#[derive(Debug, Clone, Copy)]
pub struct ForwardJump {
    pub instr_off: u32,
    pub jmp_immed_off: u32,
}

/// Per-block bookkeeping for the back-patching protocol (§4.3).
#[derive(Debug, Clone, Default)]
pub struct BlockInfo {
    pub offset: Option<u32>,
    pub past: Option<u32>,
    pub regions_to_pop: u32,
    pub forward_jumps: Vec<ForwardJump>,
    pub expected_stack_depth: Option<i64>,
    pub expected_fpi_depth: Option<usize>,
}

/// A branch into a block disagreed with that block's already-recorded
/// expected depth (§4.3 step 1: "if set it must equal current depth").
#[derive(Debug, Clone, Copy)]
pub enum DepthMismatch {
    Stack { expected: i64, actual: i64 },
    Fpi { expected: usize, actual: usize },
}

/// Record (or check) the depth expected on entry to `target`, called both
/// when emitting a branch to it and when synthesizing its fall-through.
pub fn set_expected_depth(
    block_infos: &mut [BlockInfo],
    target: BlockId,
    current_stack_depth: i64,
    current_fpi_depth: usize,
) -> Result<(), DepthMismatch> {
    let info = &mut block_infos[target.index()];
    match info.expected_stack_depth {
        Some(expected) if expected != current_stack_depth => {
            return Err(DepthMismatch::Stack {
                expected,
                actual: current_stack_depth,
            });
        }
        Some(_) => {}
        None => info.expected_stack_depth = Some(current_stack_depth),
    }
    match info.expected_fpi_depth {
        Some(expected) if expected != current_fpi_depth => {
            return Err(DepthMismatch::Fpi {
                expected,
                actual: current_fpi_depth,
            });
        }
        Some(_) => {}
        None => info.expected_fpi_depth = Some(current_fpi_depth),
    }
    Ok(())
}

/// Emit a branch immediate targeting `target`: a resolved 32-bit relative
/// offset if `target` has already been laid out, otherwise a zero
/// placeholder recorded in `target`'s `forward_jumps` for later patching.
pub fn emit_branch_offset(
    sink: &mut VecSink,
    block_infos: &mut [BlockInfo],
    target: BlockId,
    branch_site_start: u32,
) {
    let placeholder_pos = sink.bc_pos();
    let info = &mut block_infos[target.index()];
    match info.offset {
        Some(resolved) => {
            let rel = resolved as i64 - branch_site_start as i64;
            sink.emit_i32(rel as i32);
        }
        None => {
            sink.emit_i32(0);
            info.forward_jumps.push(ForwardJump {
                instr_off: branch_site_start,
                jmp_immed_off: placeholder_pos,
            });
        }
    }
}

/// Drive entry into block `id`: records its offset, patches every pending
/// forward jump targeting it, establishes the depth trackers' current
/// values from whatever was recorded as expected, and closes any FPI
/// regions left open by a terminal instruction earlier in the layout
/// (§4.3 step 2).
pub fn enter_block(
    sink: &mut VecSink,
    block_infos: &mut [BlockInfo],
    depth: &mut DepthTracker,
    id: BlockId,
) -> Vec<crate::sink::FpiEnt> {
    let offset = sink.bc_pos();
    let jumps = std::mem::take(&mut block_infos[id.index()].forward_jumps);
    for jump in jumps {
        let rel = offset as i64 - jump.instr_off as i64;
        sink.emit_i32_at(rel as i32, jump.jmp_immed_off);
    }

    let info = &block_infos[id.index()];
    let expected_stack = info.expected_stack_depth.unwrap_or(0);
    let expected_fpi = info.expected_fpi_depth.unwrap_or(0);
    block_infos[id.index()].offset = Some(offset);

    depth.set_current(expected_stack);

    let mut closed = Vec::new();
    while depth.fpi_depth() > expected_fpi {
        if let Some(region) = depth.close_top_fpi(offset) {
            closed.push(crate::sink::FpiEnt {
                fpush_off: region.fpush_off,
                fpi_end_off: region.fpi_end_off,
                fp_delta: region.fp_delta,
            });
        } else {
            break;
        }
    }
    closed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jump_patches_to_the_resolved_offset() {
        let mut sink = VecSink::new(0, "t".into());
        let mut infos = vec![BlockInfo::default(); 2];

        let branch_site = sink.bc_pos();
        emit_branch_offset(&mut sink, &mut infos, BlockId(1), branch_site);
        assert_eq!(&sink.bytecode, &[0, 0, 0, 0]);

        let mut depth = DepthTracker::new();
        let block1_offset = sink.bc_pos() + 3; // pretend 3 bytes of other code first
        sink.emit_byte(0);
        sink.emit_byte(0);
        sink.emit_byte(0);
        let _ = enter_block(&mut sink, &mut infos, &mut depth, BlockId(1));

        let patched = i32::from_le_bytes(sink.bytecode[0..4].try_into().unwrap());
        assert_eq!(patched, block1_offset as i32 - branch_site as i32);
    }

    #[test]
    fn resolved_target_emits_directly_without_deferral() {
        let mut sink = VecSink::new(0, "t".into());
        let mut infos = vec![BlockInfo::default(); 1];
        infos[0].offset = Some(100);
        let branch_site = 50;
        emit_branch_offset(&mut sink, &mut infos, BlockId(0), branch_site);
        let value = i32::from_le_bytes(sink.bytecode[0..4].try_into().unwrap());
        assert_eq!(value, 50);
        assert!(infos[0].forward_jumps.is_empty());
    }
}
