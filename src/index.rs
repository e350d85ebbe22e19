//! The typed-analysis `Index` oracle (§6 "Input").
//!
//! Out of scope per §1 ("the typed-analysis `Index`... consulted as an
//! oracle"): this crate never recomputes what the index answers, only
//! queries it. `TableIndex` is a reference implementation over plain
//! in-memory tables, sufficient for unit tests; production callers supply
//! their own `Index` over the real analysis results.
//!
//! Grounded on `read.rs::BitStreamReader`'s `block_info` / `global_abbrevs`
//! maps: plain `HashMap`-backed lookup tables owned by a small struct, no
//! trait object indirection beyond what's needed at the call site.

use std::collections::HashMap;

use crate::opcode::RepoAuthType;

/// A type as reported by the external type-inference pass. `Bottom` means
/// "no information" (§4.6: "if not bottom, construct a repo-auth-type").
#[derive(Debug, Clone, PartialEq)]
pub enum InferredType {
    Bottom,
    Known(RepoAuthType),
    /// A specialized wait-handle; `WaitHandle(awaited)` carries the type
    /// awaited once the handle resolves (§4.6 "awaited-return type").
    WaitHandle(Box<InferredType>),
}

pub type PropMap = HashMap<String, InferredType>;

/// A thin handle standing in for the sink's array-literal interning table,
/// surfaced through the Index per §6 but otherwise untouched by this
/// crate's emission pipeline (literal interning itself is the sink's job).
#[derive(Debug, Default)]
pub struct ArrayTableBuilder;

pub trait Index {
    fn lookup_return_type_raw(&self, func_name: &str) -> InferredType;
    fn array_table_builder(&self) -> ArrayTableBuilder {
        ArrayTableBuilder
    }
    fn lookup_iface_vtable_slot(&self, class_name: &str) -> i32;
    fn lookup_closure_use_vars(&self, func_name: &str) -> Vec<InferredType>;
    fn lookup_private_props(&self, class_name: &str) -> PropMap;
    fn lookup_private_statics(&self, class_name: &str) -> PropMap;
    fn lookup_public_static(&self, class_name: &str, prop_name: &str) -> InferredType;
}

/// An in-memory reference `Index`, populated by tests (or small embedders)
/// with whatever the surrounding analysis pass already computed.
#[derive(Debug, Default)]
pub struct TableIndex {
    pub return_types: HashMap<String, InferredType>,
    pub iface_vtable_slots: HashMap<String, i32>,
    pub closure_use_vars: HashMap<String, Vec<InferredType>>,
    pub private_props: HashMap<String, PropMap>,
    pub private_statics: HashMap<String, PropMap>,
    pub public_statics: HashMap<(String, String), InferredType>,
}

impl Index for TableIndex {
    fn lookup_return_type_raw(&self, func_name: &str) -> InferredType {
        self.return_types
            .get(func_name)
            .cloned()
            .unwrap_or(InferredType::Bottom)
    }

    fn lookup_iface_vtable_slot(&self, class_name: &str) -> i32 {
        self.iface_vtable_slots.get(class_name).copied().unwrap_or(-1)
    }

    fn lookup_closure_use_vars(&self, func_name: &str) -> Vec<InferredType> {
        self.closure_use_vars.get(func_name).cloned().unwrap_or_default()
    }

    fn lookup_private_props(&self, class_name: &str) -> PropMap {
        self.private_props.get(class_name).cloned().unwrap_or_default()
    }

    fn lookup_private_statics(&self, class_name: &str) -> PropMap {
        self.private_statics.get(class_name).cloned().unwrap_or_default()
    }

    fn lookup_public_static(&self, class_name: &str, prop_name: &str) -> InferredType {
        self.public_statics
            .get(&(class_name.to_string(), prop_name.to_string()))
            .cloned()
            .unwrap_or(InferredType::Bottom)
    }
}
