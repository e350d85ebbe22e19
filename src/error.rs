//! Crate-wide error type.
//!
//! Every variant here is a fatal programmer-contract violation (§7): IR
//! malformation, ABI mismatch, or internal inconsistency. None of these are
//! meant to be recovered from; the unit driver propagates with `?` and the
//! only caller-visible behavior is an abort carrying diagnostic context.
//!
//! Grounded on `bits.rs::Error` / `read.rs::Error`: hand-written `Display`
//! plus `impl std::error::Error`, no `thiserror` macro, with a `From`
//! conversion bridging a lower-level error into a higher-level one (there,
//! `bits::Error -> read::Error`; here, nothing below this crate's own
//! `Error` needs wrapping, so the single enum plays both roles).

use std::{error, fmt};

use crate::model::BlockId;

/// Diagnostic context attached to a fatal error (§7: "function and class
/// names, block id, byte offset").
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub function: Option<String>,
    pub class: Option<String>,
    pub block: Option<BlockId>,
    pub byte_offset: Option<u32>,
}

impl Context {
    #[must_use]
    pub fn for_function(name: &str) -> Self {
        Self {
            function: Some(name.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_block(mut self, block: BlockId) -> Self {
        self.block = Some(block);
        self
    }

    #[must_use]
    pub fn with_class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.byte_offset = Some(offset);
        self
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(func) = &self.function {
            write!(f, " in function `{func}`")?;
        }
        if let Some(class) = &self.class {
            write!(f, " (class `{class}`)")?;
        }
        if let Some(block) = &self.block {
            write!(f, " at block {}", block.0)?;
        }
        if let Some(offset) = &self.byte_offset {
            write!(f, " (byte offset {offset})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Error {
    /// A second `DefCls`/`DefClsNop` recorded the same class id.
    DuplicateDefCls { id: u32, ctx: Context },
    /// A killed local's sentinel id reached the encoder.
    KilledLocalReferenced { raw_id: u32, ctx: Context },
    /// A pop would have driven the running stack depth negative.
    StackUnderflow { ctx: Context },
    /// A return-family opcode fired with stack depth != 1.
    BadReturnDepth { depth: i64, ctx: Context },
    /// Two branches into the same block disagree on entry depth.
    ExpectedDepthMismatch {
        block: BlockId,
        expected: i64,
        actual: i64,
        ctx: Context,
    },
    /// A local range's `first + restCount` reached past the locals vector.
    LocalRangeOverrun {
        first: u32,
        count: u32,
        num_locals: u32,
        ctx: Context,
    },
    /// A forward jump was never resolved by function end.
    UnresolvedForwardJump { block: BlockId, ctx: Context },
}

impl Error {
    fn context(&self) -> &Context {
        match self {
            Error::DuplicateDefCls { ctx, .. }
            | Error::KilledLocalReferenced { ctx, .. }
            | Error::StackUnderflow { ctx }
            | Error::BadReturnDepth { ctx, .. }
            | Error::ExpectedDepthMismatch { ctx, .. }
            | Error::LocalRangeOverrun { ctx, .. }
            | Error::UnresolvedForwardJump { ctx, .. } => ctx,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateDefCls { id, .. } => {
                write!(f, "duplicate DefCls for class id {id}")?
            }
            Error::KilledLocalReferenced { raw_id, .. } => {
                write!(f, "killed local {raw_id} referenced by an instruction")?
            }
            Error::StackUnderflow { .. } => write!(f, "stack depth would go negative")?,
            Error::BadReturnDepth { depth, .. } => {
                write!(f, "return opcode with stack depth {depth}, expected 1")?
            }
            Error::ExpectedDepthMismatch {
                block,
                expected,
                actual,
                ..
            } => write!(
                f,
                "block {} entry depth mismatch: expected {expected}, got {actual}",
                block.0
            )?,
            Error::LocalRangeOverrun {
                first,
                count,
                num_locals,
                ..
            } => write!(
                f,
                "local range [{first}, {first}+{count}) extends past {num_locals} locals"
            )?,
            Error::UnresolvedForwardJump { block, .. } => {
                write!(f, "unresolved forward jump targeting block {}", block.0)?
            }
        }
        write!(f, "{}", self.context())
    }
}

impl error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
