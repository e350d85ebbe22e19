//! Input data model: the IR this crate's emitter consumes.
//!
//! Shaped the way a `Block { id, elements }` / `BitcodeElement::{Block,Record}`
//! pair models a nested container: a stable numeric id plus an ordered
//! payload. Here the payload is a function's blocks and a block's
//! instructions rather than a bitstream's elements.

use bitflags::bitflags;

/// Stable, dense block id. Invariant 1: ids are dense over `[0, |blocks|)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Sentinel local id assigned to killed locals; must never appear in an
/// emitted instruction (§3 Local mapping).
pub const KILLED_LOCAL_SENTINEL: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct Local {
    pub id: u32,
    pub name: Option<String>,
    pub killed: bool,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub dv_entry: Option<BlockId>,
    pub type_constraint: Option<String>,
    pub user_type: Option<String>,
    pub default_expr: Option<String>,
    pub attributes: Vec<String>,
    pub by_ref: bool,
    pub variadic: bool,
    pub builtin_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StaticLocalDescriptor {
    pub name: String,
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceLoc {
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceLocRange {
    pub start: SourceLoc,
    pub end: SourceLoc,
}

#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    pub file: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct NativeInfo {
    pub shim_name: String,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FuncFlags: u32 {
        const CLOSURE_BODY    = 1 << 0;
        const ASYNC           = 1 << 1;
        const GENERATOR       = 1 << 2;
        const PAIR_GENERATOR  = 1 << 3;
        const MEMOIZE_WRAPPER = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnitFlags: u32 {
        const STRICT_TYPES      = 1 << 0;
        const STRICT_TYPES_DECL = 1 << 1;
        const SYSTEMLIB         = 1 << 2;
        const PRELOAD_PRIORITY  = 1 << 3;
    }
}

/// A block's placement category. `Main < Fault` under the §4.1 stable sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    Main,
    Fault,
}

/// Index into a function's exception-node arena (`Function::exn_nodes`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExnNodeId(pub u32);

#[derive(Debug, Clone)]
pub enum ExnInfo {
    Catch {
        catch_entry: BlockId,
        iter_id: Option<u32>,
        it_ref: bool,
    },
    Fault {
        fault_entry: BlockId,
        iter_id: Option<u32>,
        it_ref: bool,
    },
}

/// A node in the exception-region tree (§3 "Exception node").
///
/// Nodes are arena-allocated in `Function::exn_nodes` and referenced by
/// index (`ExnNodeId`) rather than by owning pointer, so the tree can be
/// acyclic-by-construction: a node can only reference a parent that was
/// allocated earlier.
#[derive(Debug, Clone)]
pub struct ExnNode {
    pub depth: u32,
    pub parent: Option<ExnNodeId>,
    pub info: ExnInfo,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub instructions: Vec<super::opcode::Instruction>,
    pub section: Section,
    pub fallthrough: Option<BlockId>,
    pub fallthrough_ns: bool,
    pub factored_exits: Vec<BlockId>,
    pub exn_node: Option<ExnNodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct Function {
    pub name: String,
    pub locals: Vec<Local>,
    pub params: Vec<Param>,
    pub static_locals: Vec<StaticLocalDescriptor>,
    pub blocks: Vec<Block>,
    pub main_entry: BlockId,
    pub num_iters: u32,
    pub num_cls_ref_slots: u32,
    pub source_info: SourceInfo,
    pub native_info: Option<NativeInfo>,
    pub flags: FuncFlags,
    pub exn_nodes: Vec<ExnNode>,
    pub attributes: Vec<String>,
    pub return_user_type: Option<String>,
    pub doc_comment: Option<String>,
    pub top_level: bool,
}

impl Default for BlockId {
    fn default() -> Self {
        BlockId(0)
    }
}

impl Function {
    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn exn_node(&self, id: ExnNodeId) -> &ExnNode {
        &self.exn_nodes[id.0 as usize]
    }

    /// Rewrite a raw local reference through the id mapping built by DCE
    /// compaction (§3 "Local mapping"). Idempotent after `locals` is fixed.
    pub fn map_local(&self, raw_id: u32) -> u32 {
        self.locals[raw_id as usize].id
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassConstant {
    pub name: String,
    pub value: Option<String>,
    pub php_source: Option<String>,
    pub type_constraint: Option<String>,
    pub is_type_constant: bool,
    pub is_abstract: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Property {
    pub name: String,
    pub is_private: bool,
    pub is_static: bool,
    pub is_closure_use_var: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Class {
    pub name: String,
    pub parent_name: Option<String>,
    pub interfaces: Vec<String>,
    pub used_traits: Vec<String>,
    pub requirements: Vec<String>,
    pub trait_precedence_rules: Vec<String>,
    pub trait_alias_rules: Vec<String>,
    pub constants: Vec<ClassConstant>,
    pub properties: Vec<Property>,
    pub methods: Vec<Function>,
    pub attributes: Vec<String>,
    pub is_closure: bool,
    pub source_info: SourceInfo,
    pub doc_comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TypeAlias {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default)]
pub struct Unit {
    pub classes: Vec<Class>,
    pub functions: Vec<Function>,
    pub pseudomain: Function,
    pub typealiases: Vec<TypeAlias>,
    pub file: String,
    pub content_hash: u64,
    pub flags: UnitFlags,
}
