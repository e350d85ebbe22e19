//! C6: unit driver (§4.6).
//!
//! Grounded on `bitcode.rs::Bitcode::new`/`Bitcode::read`: the single
//! top-level entry point that constructs the reader, drives the whole
//! nested-block walk, and hands back one owned result. `emit_unit` plays
//! the same orchestrating role for the write side, driving C1 through C5
//! per declaration and assembling the sink's final tables.

use std::collections::HashMap;

use log::{debug, trace};

use crate::depth::DepthTracker;
use crate::eh::{self, BlockSpan};
use crate::error::{Context, Error, Result};
use crate::fixup::{self, BlockInfo};
use crate::index::{Index, InferredType};
use crate::layout;
use crate::model::{Class, Function, KILLED_LOCAL_SENTINEL, Unit};
use crate::opcode::RepoAuthType;
use crate::sink::{ParamEntry, VecSink};

/// Runtime-ABI constants used by the §4.4 peak-cell formula. Fixed by the
/// target ISA, not configurable per unit.
const NUM_ITER_CELLS: u32 = 1;
const NUM_ACT_REC_CELLS: u32 = 3;

fn cls_ref_count_to_cells(num_cls_ref_slots: u32) -> u32 {
    num_cls_ref_slots
}

/// Build a function-level diagnostic context, attaching the owning class
/// name when emission is happening on behalf of a method (§7: "function and
/// class names, block id, byte offset").
fn ctx_for(function_name: &str, class_name: Option<&str>) -> Context {
    let ctx = Context::for_function(function_name);
    match class_name {
        Some(class) => ctx.with_class(class),
        None => ctx,
    }
}

/// Per-unit configuration (SPEC_FULL.md §2): the flags already named in
/// §3 plus the `systemlib` switch that drives the §4.6 step-3 sink-ABI
/// split.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitOptions {
    pub strict_types: bool,
    pub strict_types_decl: bool,
    pub preload_priority: bool,
    pub systemlib: bool,
}

/// Global emission state threaded by value through the unit (§9 "Global
/// emit state"): the Index oracle plus the `defClsMap` it and the driver
/// both need to see once emission finishes.
pub struct EmitUnitState<'a> {
    pub index: &'a dyn Index,
    pub def_cls_map: HashMap<u32, u32>,
}

/// Assign post-DCE local ids (§3 "Local mapping"): killed locals get the
/// sentinel, survivors get a dense `[0, survivors)` id, in declaration
/// order.
fn compact_locals(function: &mut Function) {
    let mut next = 0u32;
    for local in &mut function.locals {
        local.id = if local.killed {
            KILLED_LOCAL_SENTINEL
        } else {
            let id = next;
            next += 1;
            id
        };
    }
}

/// Drive C1→C2→(C3/C4) over one function's body, returning the resolved
/// `BlockInfo` table (carrying final offsets, used by C5 and by DV-entry
/// funclet-offset lookups) plus the running depth tracker and per-function
/// side tables accumulated along the way.
struct BodyResult {
    block_infos: Vec<BlockInfo>,
    depth: DepthTracker,
    fpi_table: Vec<crate::sink::FpiEnt>,
    def_cls_map: HashMap<u32, u32>,
    contains_calls: bool,
}

fn emit_body(
    sink: &mut VecSink,
    function: &Function,
    ordered: &[crate::model::BlockId],
    class_name: Option<&str>,
) -> Result<BodyResult> {
    debug!(
        "emit_body: {} block(s) ordered for `{}`",
        ordered.len(),
        function.name
    );

    let mut block_infos = vec![BlockInfo::default(); function.blocks.len()];
    let mut depth = DepthTracker::new();
    let mut fpi_table = Vec::new();
    let mut def_cls_map = HashMap::new();
    let mut contains_calls = false;

    for (pos, &block_id) in ordered.iter().enumerate() {
        let closed = fixup::enter_block(sink, &mut block_infos, &mut depth, block_id);
        fpi_table.extend(closed);
        trace!("block {} entered at offset {}", block_id.0, sink.bc_pos());

        let block = function.block(block_id);
        for inst in &block.instructions {
            let outcome = crate::encode::encode_instruction(
                sink,
                &mut block_infos,
                &mut depth,
                function,
                &mut def_cls_map,
                &mut contains_calls,
                block_id,
                inst,
                class_name,
            )?;
            if let Some(closed) = outcome.fpi_closed {
                fpi_table.push(crate::sink::FpiEnt {
                    fpush_off: closed.fpush_off,
                    fpi_end_off: closed.fpi_end_off,
                    fp_delta: closed.fp_delta,
                });
            }
        }

        if let Some(target) = block.fallthrough {
            let fallthrough_ctx = ctx_for(&function.name, class_name)
                .with_block(block_id)
                .with_offset(sink.bc_pos());
            fixup::set_expected_depth(&mut block_infos, target, depth.current(), depth.fpi_depth())
                .map_err(|e| crate::encode::depth_mismatch_err(target, e, &fallthrough_ctx))?;

            let next_in_layout = ordered.get(pos + 1).copied();
            if next_in_layout != Some(target) {
                let jmp_op = if block.fallthrough_ns {
                    crate::opcode::Opcode::JmpNS
                } else {
                    crate::opcode::Opcode::Jmp
                };
                let jmp_inst = crate::opcode::Instruction {
                    op: jmp_op,
                    imm: crate::opcode::Immediate::Branch(target),
                    srcloc: None,
                };
                crate::encode::encode_instruction(
                    sink,
                    &mut block_infos,
                    &mut depth,
                    function,
                    &mut def_cls_map,
                    &mut contains_calls,
                    block_id,
                    &jmp_inst,
                    class_name,
                )?;

                let target_exn_node = function.block(target).exn_node;
                let common = eh::common_parent(function, block.exn_node, target_exn_node);
                let from_depth = block.exn_node.map_or(0, |n| function.exn_node(n).depth);
                let to_depth = common.map_or(0, |n| function.exn_node(n).depth);
                block_infos[block_id.index()].regions_to_pop = from_depth.saturating_sub(to_depth);
            }
        }

        block_infos[block_id.index()].past = Some(sink.bc_pos());
    }

    let end = sink.bc_pos();
    for (idx, info) in block_infos.iter().enumerate() {
        if !info.forward_jumps.is_empty() {
            return Err(Error::UnresolvedForwardJump {
                block: crate::model::BlockId(idx as u32),
                ctx: ctx_for(&function.name, class_name),
            });
        }
    }
    while depth.fpi_depth() > 0 {
        if let Some(closed) = depth.close_top_fpi(end) {
            fpi_table.push(crate::sink::FpiEnt {
                fpush_off: closed.fpush_off,
                fpi_end_off: closed.fpi_end_off,
                fp_delta: closed.fp_delta,
            });
        }
    }

    Ok(BodyResult {
        block_infos,
        depth,
        fpi_table,
        def_cls_map,
        contains_calls,
    })
}

fn run_eh_flattener(function: &Function, ordered: &[crate::model::BlockId], block_infos: &[BlockInfo]) -> Vec<crate::sink::EhEnt> {
    let spans: Vec<BlockSpan> = ordered
        .iter()
        .map(|&id| {
            let info = &block_infos[id.index()];
            BlockSpan {
                exn_node: function.block(id).exn_node,
                start: info.offset.unwrap_or(0),
                past: info.past.unwrap_or(0),
                regions_to_pop: info.regions_to_pop,
            }
        })
        .collect();

    let regions = eh::flatten(function, &spans);
    let mut order: Vec<usize> = (0..regions.len()).collect();
    order.sort_by(|&a, &b| {
        if eh::sort_key_less(function, &regions, a, b) {
            std::cmp::Ordering::Less
        } else if eh::sort_key_less(function, &regions, b, a) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    });

    let mut new_index_of = vec![0usize; regions.len()];
    for (new_idx, &old_idx) in order.iter().enumerate() {
        new_index_of[old_idx] = new_idx;
    }

    let mut ents = Vec::with_capacity(regions.len());
    for &old_idx in &order {
        let region = &regions[old_idx];
        let parent_index = region
            .parent
            .map(|p| new_index_of[p] as i32)
            .unwrap_or(-1);
        let node = function.exn_node(region.node);
        let kind = match node.info {
            crate::model::ExnInfo::Catch {
                catch_entry,
                iter_id,
                it_ref,
            } => crate::sink::EhKind::Catch {
                handler: block_infos[catch_entry.index()].offset.unwrap_or(0),
                iter_id,
                it_ref,
            },
            crate::model::ExnInfo::Fault {
                fault_entry,
                iter_id,
                it_ref,
            } => crate::sink::EhKind::Fault {
                handler: block_infos[fault_entry.index()].offset.unwrap_or(0),
                iter_id,
                it_ref,
            },
        };
        ents.push(crate::sink::EhEnt {
            start: region.start,
            past: region.past,
            parent_index,
            kind,
        });
    }
    ents
}

/// §4.6 "Per-function": drive one function's full emission and finalize
/// its metadata into the sink.
fn emit_func(
    sink: &mut VecSink,
    state: &mut EmitUnitState,
    function: &Function,
    is_main: bool,
    class_name: Option<&str>,
) -> Result<()> {
    let mut function = function.clone();
    compact_locals(&mut function);

    let mut emitter = if is_main {
        sink.new_func_emitter(
            &function.name,
            function.source_info.clone(),
            function.attributes.clone(),
            function.top_level,
            function.doc_comment.clone(),
        )
    } else if function.top_level {
        sink.new_func_emitter(
            &function.name,
            function.source_info.clone(),
            function.attributes.clone(),
            true,
            function.doc_comment.clone(),
        )
    } else {
        sink.new_method_emitter(
            &function.name,
            function.source_info.clone(),
            function.attributes.clone(),
            function.doc_comment.clone(),
        )
    };

    let ordered = layout::order_blocks(&function);
    layout::rewrite_entry_nop(&mut function, &ordered);

    let body = emit_body(sink, &function, &ordered, class_name)?;

    for ent in body.fpi_table {
        emitter.add_fpi_ent(ent);
    }

    for param in &function.params {
        let funclet_off = param
            .dv_entry
            .and_then(|dv| body.block_infos[dv.index()].offset);
        emitter.params.push(ParamEntry {
            by_ref: param.by_ref,
            variadic: param.variadic,
            user_type: param.user_type.clone(),
            builtin_type: param.builtin_type.clone(),
            funclet_off,
        });
    }

    emitter.static_locals = function.static_locals.clone();

    for ent in run_eh_flattener(&function, &ordered, &body.block_infos) {
        emitter.add_eh_ent(ent);
    }

    emitter.return_user_type = function.return_user_type.clone();
    emitter.original_filename = function.source_info.file.clone();
    emitter.flags = function.flags;
    emitter.contains_calls = body.contains_calls;

    let return_type = state.index.lookup_return_type_raw(&function.name);
    emitter.repo_return_type = repo_auth_type_for(sink, &return_type);
    if let InferredType::WaitHandle(awaited) = &return_type {
        emitter.awaited_return_type = repo_auth_type_for(sink, awaited);
    }

    let max_stack_cells = body.depth.max_stack_cells(
        function.locals.len() as u32,
        function.num_iters,
        NUM_ITER_CELLS,
        cls_ref_count_to_cells(function.num_cls_ref_slots),
        NUM_ACT_REC_CELLS,
    );
    emitter.max_stack_cells = max_stack_cells;

    for (id, offset) in body.def_cls_map {
        state.def_cls_map.insert(id, offset);
    }

    sink.finish_func(emitter, is_main);
    Ok(())
}

fn repo_auth_type_for(sink: &mut VecSink, ty: &InferredType) -> Option<RepoAuthType> {
    match ty {
        InferredType::Bottom => None,
        InferredType::Known(rat) => {
            if let Some(name) = &rat.class_name {
                sink.merge_litstr(name);
            }
            Some(rat.clone())
        }
        InferredType::WaitHandle(inner) => repo_auth_type_for(sink, inner),
    }
}

/// A property's repo-auth-type, built empty whenever the inferred type
/// could be a class (§4.6: "empty if the type could be a class") — a
/// concrete class-typed property may be overridden by a sealed/unsealed
/// subclass, so the emitter declines to bake in a class name here.
fn property_repo_auth_type(ty: &InferredType) -> Option<RepoAuthType> {
    match ty {
        InferredType::Bottom => None,
        InferredType::Known(rat) if rat.class_name.is_some() => Some(RepoAuthType {
            class_name: None,
            bits: Vec::new(),
        }),
        InferredType::Known(rat) => Some(rat.clone()),
        InferredType::WaitHandle(inner) => property_repo_auth_type(inner),
    }
}

/// §4.6 "Per-class": build a pre-class entry and emit every method.
fn emit_class(sink: &mut VecSink, state: &mut EmitUnitState, class: &Class) -> Result<()> {
    let mut pce = sink.new_pre_class_emitter(
        &class.name,
        class.source_info.clone(),
        class.attributes.clone(),
        class.parent_name.clone(),
        class.doc_comment.clone(),
    );
    pce.interfaces = class.interfaces.clone();
    pce.used_traits = class.used_traits.clone();
    pce.requirements = class.requirements.clone();
    pce.trait_precedence_rules = class.trait_precedence_rules.clone();
    pce.trait_alias_rules = class.trait_alias_rules.clone();
    pce.iface_vtable_slot = state.index.lookup_iface_vtable_slot(&class.name);

    let mut needs_86cinit = false;
    for constant in &class.constants {
        if constant.value.is_none() {
            // Abstract constant; carries its type constraint only.
        } else if constant.value.as_deref() == Some("Uninit") {
            needs_86cinit = true;
        }
        pce.constants.push(constant.clone());
    }
    pce.needs_86cinit = needs_86cinit;

    for method in &class.methods {
        if method.name == "86cinit" && !needs_86cinit {
            continue;
        }
        pce.methods.push(method.name.clone());
    }
    pce.declared_method_count = pce.methods.len() as u32;

    let use_vars = if class.is_closure {
        state.index.lookup_closure_use_vars(&class.name)
    } else {
        Vec::new()
    };

    for (idx, property) in class.properties.iter().enumerate() {
        let inferred = if property.is_closure_use_var {
            use_vars.get(idx).cloned().unwrap_or(InferredType::Bottom)
        } else if property.is_private && property.is_static {
            state
                .index
                .lookup_private_statics(&class.name)
                .get(&property.name)
                .cloned()
                .unwrap_or(InferredType::Bottom)
        } else if property.is_private {
            state
                .index
                .lookup_private_props(&class.name)
                .get(&property.name)
                .cloned()
                .unwrap_or(InferredType::Bottom)
        } else if property.is_static {
            state.index.lookup_public_static(&class.name, &property.name)
        } else {
            InferredType::Bottom
        };
        pce.properties.push(crate::sink::PropertyEntry {
            property: property.clone(),
            type_info: property_repo_auth_type(&inferred),
        });
    }

    let preclass_idx = sink.finish_class(pce);

    for method in &class.methods {
        if method.name == "86cinit" && !needs_86cinit {
            continue;
        }
        emit_func(sink, state, method, false, Some(&class.name))?;
    }

    trace!("class `{}` filed as preclass {}", class.name, preclass_idx);
    Ok(())
}

fn emit_typealias(sink: &mut VecSink, typealias: &crate::model::TypeAlias) {
    sink.add_type_alias(&typealias.name, &typealias.kind);
    sink.push_mergeable_type_alias(&typealias.name);
}

/// §4.6 "Emission order per unit": the crate's single public entry point.
pub fn emit_unit(unit: &Unit, index: &dyn Index, options: EmitOptions) -> Result<VecSink> {
    let mut sink = VecSink::new(unit.content_hash, unit.file.clone());

    sink.configure_systemlib_abi(options.systemlib);

    let mut state = EmitUnitState {
        index,
        def_cls_map: HashMap::new(),
    };

    emit_func(&mut sink, &mut state, &unit.pseudomain, true, None)?;

    for class in &unit.classes {
        emit_class(&mut sink, &mut state, class)?;
    }
    for function in &unit.functions {
        emit_func(&mut sink, &mut state, function, false, None)?;
    }
    for typealias in &unit.typealiases {
        emit_typealias(&mut sink, typealias);
    }

    for (class_id, offset) in &state.def_cls_map {
        if let Some(preclass) = sink.preclasses.get_mut(*class_id as usize) {
            preclass.defcls_offset = Some(*offset);
        }
    }

    sink.mark_eh_table_sorted();
    Ok(sink)
}
