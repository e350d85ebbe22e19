//! The `UnitEmitter` sink (§6 "Sink (output collaborator)").
//!
//! This sink is treated as an external collaborator; this module supplies a
//! concrete reference implementation so the crate is buildable and testable
//! end to end. Production embedders are expected to swap in their own sink
//! behind the same surface.
//!
//! Grounded on a reader that owns derived tables (`block_info: HashMap<u32,
//! BlockInfo>`, `global_abbrevs`) and exposes a narrow set of methods to its
//! callers, keeping the bookkeeping private. `VecSink` mirrors that shape
//! for the write side: a byte buffer plus dedup-on-insert interning tables.

use std::collections::HashMap;

use crate::model::{FuncFlags, SourceInfo, SourceLocRange, StaticLocalDescriptor};
use crate::opcode::{Opcode, RepoAuthType};

/// One emitted exception-handler table row (§3 "EH region (derived)").
#[derive(Debug, Clone)]
pub struct EhEnt {
    pub start: u32,
    pub past: u32,
    pub parent_index: i32,
    pub kind: EhKind,
}

#[derive(Debug, Clone)]
pub enum EhKind {
    Catch {
        handler: u32,
        iter_id: Option<u32>,
        it_ref: bool,
    },
    Fault {
        handler: u32,
        iter_id: Option<u32>,
        it_ref: bool,
    },
}

/// One emitted FPI-table row (§3 "FPI region (derived)").
#[derive(Debug, Clone, Copy)]
pub struct FpiEnt {
    pub fpush_off: u32,
    pub fpi_end_off: u32,
    pub fp_delta: i32,
}

#[derive(Debug, Clone)]
pub struct ParamEntry {
    pub by_ref: bool,
    pub variadic: bool,
    pub user_type: Option<String>,
    pub builtin_type: Option<String>,
    pub funclet_off: Option<u32>,
}

/// A function's finalized metadata, as committed into the sink by
/// `Sink::finish_func` (§4.6 "Per-function").
#[derive(Debug, Clone)]
pub struct FuncEntry {
    pub name: String,
    pub start_offset: u32,
    pub end_offset: u32,
    pub source_info: SourceInfo,
    pub attributes: Vec<String>,
    pub top_level: bool,
    pub doc_comment: Option<String>,
    pub params: Vec<ParamEntry>,
    pub static_locals: Vec<StaticLocalDescriptor>,
    pub eh_table: Vec<EhEnt>,
    pub fpi_table: Vec<FpiEnt>,
    pub return_user_type: Option<String>,
    pub original_filename: Option<String>,
    pub flags: FuncFlags,
    pub repo_return_type: Option<RepoAuthType>,
    pub awaited_return_type: Option<RepoAuthType>,
    pub max_stack_cells: u32,
    pub contains_calls: bool,
}

/// An in-progress function emitter, live only for the duration of one
/// function's emission (§3 "Lifecycle").
#[derive(Debug, Clone)]
pub struct FuncEmitter {
    pub name: String,
    pub start_offset: u32,
    pub source_info: SourceInfo,
    pub attributes: Vec<String>,
    pub top_level: bool,
    pub doc_comment: Option<String>,
    pub params: Vec<ParamEntry>,
    pub static_locals: Vec<StaticLocalDescriptor>,
    pub eh_table: Vec<EhEnt>,
    pub fpi_table: Vec<FpiEnt>,
    pub return_user_type: Option<String>,
    pub original_filename: Option<String>,
    pub flags: FuncFlags,
    pub repo_return_type: Option<RepoAuthType>,
    pub awaited_return_type: Option<RepoAuthType>,
    pub max_stack_cells: u32,
    pub contains_calls: bool,
}

impl FuncEmitter {
    pub fn add_eh_ent(&mut self, ent: EhEnt) {
        self.eh_table.push(ent);
    }

    pub fn add_fpi_ent(&mut self, ent: FpiEnt) {
        self.fpi_table.push(ent);
    }

    fn finish(self, end_offset: u32) -> FuncEntry {
        FuncEntry {
            name: self.name,
            start_offset: self.start_offset,
            end_offset,
            source_info: self.source_info,
            attributes: self.attributes,
            top_level: self.top_level,
            doc_comment: self.doc_comment,
            params: self.params,
            static_locals: self.static_locals,
            eh_table: self.eh_table,
            fpi_table: self.fpi_table,
            return_user_type: self.return_user_type,
            original_filename: self.original_filename,
            flags: self.flags,
            repo_return_type: self.repo_return_type,
            awaited_return_type: self.awaited_return_type,
            max_stack_cells: self.max_stack_cells,
            contains_calls: self.contains_calls,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PreClassEntry {
    pub name: String,
    pub source_info: SourceInfo,
    pub attributes: Vec<String>,
    pub parent_name: Option<String>,
    pub doc_comment: Option<String>,
    pub interfaces: Vec<String>,
    pub used_traits: Vec<String>,
    pub requirements: Vec<String>,
    pub trait_precedence_rules: Vec<String>,
    pub trait_alias_rules: Vec<String>,
    pub declared_method_count: u32,
    pub iface_vtable_slot: i32,
    pub constants: Vec<crate::model::ClassConstant>,
    pub properties: Vec<PropertyEntry>,
    pub methods: Vec<String>,
    pub needs_86cinit: bool,
    pub defcls_offset: Option<u32>,
}

pub type PreClassEmitter = PreClassEntry;

/// A property's finalized metadata (§4.6 "Per-class": "build a
/// repo-auth-type ... and append"), pairing the input `Property` with the
/// type inferred for it during emission.
#[derive(Debug, Clone)]
pub struct PropertyEntry {
    pub property: crate::model::Property,
    pub type_info: Option<RepoAuthType>,
}

#[derive(Debug, Clone)]
pub struct TypeAliasEntry {
    pub name: String,
    pub kind: String,
}

/// The byte-assembly sink. Owns the single growable bytecode buffer plus
/// the literal-interning tables and per-declaration metadata for one unit.
#[derive(Debug, Clone)]
pub struct VecSink {
    pub bytecode: Vec<u8>,
    litstrs: Vec<String>,
    litstr_ids: HashMap<String, u32>,
    arrays: Vec<Vec<u64>>,
    array_ids: HashMap<Vec<u64>, u32>,
    source_locations: Vec<(SourceLocRange, u32)>,
    pub main: Option<FuncEntry>,
    pub functions: Vec<FuncEntry>,
    pub preclasses: Vec<PreClassEntry>,
    pub typealiases: Vec<TypeAliasEntry>,
    pub mergeable_typealiases: Vec<String>,
    pub merge_only: bool,
    pub return_seen: bool,
    pub main_return: Option<i64>,
    pub content_hash: u64,
    pub filename: String,
    pub eh_table_sorted: bool,
}

impl VecSink {
    #[must_use]
    pub fn new(content_hash: u64, filename: String) -> Self {
        Self {
            bytecode: Vec::new(),
            litstrs: Vec::new(),
            litstr_ids: HashMap::new(),
            arrays: Vec::new(),
            array_ids: HashMap::new(),
            source_locations: Vec::new(),
            main: None,
            functions: Vec::new(),
            preclasses: Vec::new(),
            typealiases: Vec::new(),
            mergeable_typealiases: Vec::new(),
            merge_only: false,
            return_seen: false,
            main_return: None,
            content_hash,
            filename,
            eh_table_sorted: false,
        }
    }

    pub fn set_merge_only(&mut self, value: bool) {
        self.merge_only = value;
    }

    pub fn set_return_seen(&mut self, value: bool) {
        self.return_seen = value;
    }

    /// Systemlib units return a fixed sentinel from pseudomain rather than
    /// whatever their last statement produced (§4.6 step 3).
    pub fn set_main_return(&mut self, value: i64) {
        self.main_return = Some(value);
    }

    /// Whether this sink can represent a `mergeOnly` unit at all. `VecSink`
    /// always can; a sink backing a format without that concept would
    /// answer `false` here instead of silently accepting the flag.
    #[must_use]
    pub fn supports_merge_only(&self) -> bool {
        true
    }

    /// Whether this sink needs `returnSeen` recorded for non-systemlib
    /// units.
    #[must_use]
    pub fn requires_return_seen(&self) -> bool {
        true
    }

    /// §9 "systemlib mergeOnly/returnSeen split": isolates the ABI wart
    /// behind the sink's own capability flags rather than an `if systemlib`
    /// check at the call site.
    pub fn configure_systemlib_abi(&mut self, systemlib: bool) {
        if systemlib && self.supports_merge_only() {
            self.set_merge_only(true);
            self.set_main_return(1);
        } else if self.requires_return_seen() {
            self.set_return_seen(true);
        }
    }

    #[must_use]
    pub fn bc_pos(&self) -> u32 {
        self.bytecode.len() as u32
    }

    pub fn emit_op(&mut self, op: Opcode) -> u32 {
        let offset = self.bc_pos();
        self.bytecode.push(op as u8);
        offset
    }

    pub fn emit_byte(&mut self, byte: u8) {
        self.bytecode.push(byte);
    }

    pub fn emit_i32(&mut self, value: i32) {
        self.bytecode.extend_from_slice(&value.to_le_bytes());
    }

    /// Back-patch a 32-bit field already emitted at `at_offset` (§4.3).
    pub fn emit_i32_at(&mut self, value: i32, at_offset: u32) {
        let bytes = value.to_le_bytes();
        let at = at_offset as usize;
        self.bytecode[at..at + 4].copy_from_slice(&bytes);
    }

    pub fn emit_i64(&mut self, value: i64) {
        self.bytecode.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_f64(&mut self, value: f64) {
        self.bytecode.extend_from_slice(&value.to_le_bytes());
    }

    /// Variable-length unsigned encoding: one byte when the value fits in 7
    /// bits, otherwise 4 bytes with the high bit of the first byte set (§6
    /// "Wire format").
    pub fn emit_iva(&mut self, value: u64) {
        if value < 0x80 {
            self.emit_byte(value as u8);
        } else {
            let word = (value as u32) | 0x8000_0000;
            self.bytecode.extend_from_slice(&word.to_be_bytes());
        }
    }

    pub fn merge_litstr(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.litstr_ids.get(s) {
            return id;
        }
        let id = self.litstrs.len() as u32;
        self.litstrs.push(s.to_string());
        self.litstr_ids.insert(s.to_string(), id);
        id
    }

    pub fn merge_array(&mut self, values: &[u64]) -> u32 {
        if let Some(&id) = self.array_ids.get(values) {
            return id;
        }
        let id = self.arrays.len() as u32;
        self.arrays.push(values.to_vec());
        self.array_ids.insert(values.to_vec(), id);
        id
    }

    pub fn record_source_location(&mut self, range: SourceLocRange, offset: u32) {
        self.source_locations.push((range, offset));
    }

    pub fn new_func_emitter(
        &self,
        name: &str,
        source_info: SourceInfo,
        attributes: Vec<String>,
        top_level: bool,
        doc_comment: Option<String>,
    ) -> FuncEmitter {
        FuncEmitter {
            name: name.to_string(),
            start_offset: self.bc_pos(),
            source_info,
            attributes,
            top_level,
            doc_comment,
            params: Vec::new(),
            static_locals: Vec::new(),
            eh_table: Vec::new(),
            fpi_table: Vec::new(),
            return_user_type: None,
            original_filename: None,
            flags: FuncFlags::empty(),
            repo_return_type: None,
            awaited_return_type: None,
            max_stack_cells: 0,
            contains_calls: false,
        }
    }

    /// Alias for method emission; methods and top-level functions share the
    /// same emitter shape in this crate's model.
    pub fn new_method_emitter(
        &self,
        name: &str,
        source_info: SourceInfo,
        attributes: Vec<String>,
        doc_comment: Option<String>,
    ) -> FuncEmitter {
        self.new_func_emitter(name, source_info, attributes, false, doc_comment)
    }

    /// Finalize a function emitter at the current sink byte position
    /// (§4.6 "Finalize the function emitter at the current sink byte
    /// position"), filing it as `main` or appending to `functions`.
    pub fn finish_func(&mut self, emitter: FuncEmitter, is_main: bool) -> FuncEntry {
        let entry = emitter.finish(self.bc_pos());
        if is_main {
            self.main = Some(entry.clone());
        } else {
            self.functions.push(entry.clone());
        }
        entry
    }

    #[must_use]
    pub fn new_pre_class_emitter(
        &self,
        name: &str,
        source_info: SourceInfo,
        attributes: Vec<String>,
        parent_name: Option<String>,
        doc_comment: Option<String>,
    ) -> PreClassEmitter {
        PreClassEmitter {
            name: name.to_string(),
            source_info,
            attributes,
            parent_name,
            doc_comment,
            ..PreClassEmitter::default()
        }
    }

    pub fn finish_class(&mut self, pce: PreClassEmitter) -> usize {
        let idx = self.preclasses.len();
        self.preclasses.push(pce);
        idx
    }

    pub fn add_type_alias(&mut self, name: &str, kind: &str) {
        self.typealiases.push(TypeAliasEntry {
            name: name.to_string(),
            kind: kind.to_string(),
        });
    }

    pub fn push_mergeable_type_alias(&mut self, name: &str) {
        self.mergeable_typealiases.push(name.to_string());
    }

    #[must_use]
    pub fn get_main(&self) -> Option<&FuncEntry> {
        self.main.as_ref()
    }

    /// Sets the initial (empty) pseudomain entry before driving its body,
    /// mirroring the contract's `initMain`.
    pub fn init_main(&mut self, entry: FuncEntry) {
        self.main = Some(entry);
    }

    pub fn pce(&mut self, id: usize) -> &mut PreClassEntry {
        &mut self.preclasses[id]
    }

    /// Sort the EH table by the §4.5 total order and commit the "sorted"
    /// flag the sink's consumers rely on.
    pub fn mark_eh_table_sorted(&mut self) {
        self.eh_table_sorted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iva_uses_one_byte_under_128() {
        let mut sink = VecSink::new(0, "test".into());
        sink.emit_iva(5);
        assert_eq!(sink.bytecode, vec![5]);
    }

    #[test]
    fn iva_uses_four_bytes_with_high_bit_set_otherwise() {
        let mut sink = VecSink::new(0, "test".into());
        sink.emit_iva(200);
        assert_eq!(sink.bytecode.len(), 4);
        assert_eq!(sink.bytecode[0] & 0x80, 0x80);
    }

    #[test]
    fn merge_litstr_dedups() {
        let mut sink = VecSink::new(0, "test".into());
        let a = sink.merge_litstr("hello");
        let b = sink.merge_litstr("world");
        let c = sink.merge_litstr("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn backpatch_overwrites_in_place() {
        let mut sink = VecSink::new(0, "test".into());
        sink.emit_i32(0);
        sink.emit_byte(0xff);
        sink.emit_i32_at(42, 0);
        assert_eq!(i32::from_le_bytes(sink.bytecode[0..4].try_into().unwrap()), 42);
        assert_eq!(sink.bytecode[4], 0xff);
    }
}
