//! Bytecode emission core for an optimizing AOT compiler backend.
//!
//! Six components, each its own module, driven end to end by [`driver::emit_unit`]:
//! block layout (`layout`), instruction encoding (`encode`), branch fixup
//! (`fixup`), stack/FPI depth tracking (`depth`), exception-region
//! flattening (`eh`), and unit-level orchestration (`driver`). `model` holds
//! the input IR shapes, `opcode` the instruction schema, `sink`/`index` the
//! output and oracle contracts (plus reference implementations), and
//! `error` the crate-wide error type.

pub mod depth;
pub mod driver;
pub mod eh;
pub mod encode;
pub mod error;
pub mod fixup;
pub mod index;
pub mod layout;
pub mod model;
pub mod opcode;
pub mod sink;

pub use crate::driver::{emit_unit, EmitOptions, EmitUnitState};
pub use crate::error::{Context, Error, Result};
pub use crate::index::Index;
pub use crate::sink::VecSink;
