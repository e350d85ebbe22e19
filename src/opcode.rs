//! The opcode schema: one row per opcode naming its immediate kind(s),
//! static stack effect, and post-effect flags (§3 "Instruction", §4.2).
//!
//! Grounded on the `#[derive(TryFromPrimitive)] #[repr(u8)]` data-table enums
//! this crate's dependency stack is built around: doc-commented per variant
//! with its on-the-wire field layout. Those enums describe how to *read* a
//! field list for a given code; `Opcode` here describes how to *write* one,
//! reusing the same "the enum variant names the layout" idiom.

use num_enum::TryFromPrimitive;

use crate::model::BlockId;

/// Runtime-ISA opcode. Each variant's doc comment records its immediate
/// schema, matching the density of a data-table enum's per-variant field-list
/// comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// No immediate. Laid out first in a function only as `EntryNop`.
    Nop = 0,
    /// No immediate. Rewrite of a lone `Nop` entry block (§4.1 step 5).
    EntryNop = 1,
    /// No immediate. Pops and discards the top of stack.
    PopC = 2,
    /// No immediate. Pushes a copy of the top of stack.
    Dup = 3,
    /// `Int64`.
    Int = 4,
    /// `Double`.
    Double = 5,
    /// Interned string.
    String = 6,
    /// Interned array literal.
    Array = 7,
    /// `unsigned` count; pops `count` values and pushes one array.
    NewPackedArray = 8,
    /// No immediate. `[a, b] -> [a + b]`.
    Add = 9,
    /// No immediate. `[a, b] -> [a . b]`.
    Concat = 10,
    /// `local`. Reads a local onto the stack.
    CGetL = 11,
    /// `local`. Pops the stack and stores into a local, then pushes it back.
    SetL = 12,
    /// `local`. No stack effect.
    UnsetL = 13,
    /// member-key. Pushes the looked-up value.
    QueryM = 14,
    /// member-key. Pops the value to store, pushes it back.
    SetM = 15,
    /// No immediate. Pushes a freshly allocated object.
    NewObj = 16,
    /// `unsigned` (arg count) + interned string (callee name). Opens an FPI
    /// region (§4.2 "fpush" post-effect).
    FPushFuncD = 17,
    /// sub-opcode (numArgs). Closes the nearest open FPI region and pushes
    /// the call's single return value.
    FCall = 18,
    /// sub-opcode (numArgs) + interned string (callee name, direct call).
    FCallD = 19,
    /// branch target. Pops the condition; jumps if falsy.
    JmpZ = 20,
    /// branch target. Pops the condition; jumps if truthy.
    JmpNZ = 21,
    /// branch target, unconditional. Terminal.
    Jmp = 22,
    /// branch target, unconditional, no surprise-check. Terminal.
    JmpNS = 23,
    /// branch table. Pops the selector. Terminal.
    Switch = 24,
    /// string-switch table. Pops the selector. Terminal.
    SSwitch = 25,
    /// iterator (raw id). No stack effect.
    IterFree = 26,
    /// iterator table. No stack effect.
    IterTab = 27,
    /// class-ref slot. Pops the class value into the slot.
    ClassRefGetC = 28,
    /// local range (`first`, `restCount`). No stack effect.
    CheckLocalRange = 29,
    /// repo-auth-type blob. No stack effect; asserts the stack-top type.
    AssertRATStk = 30,
    /// vector of interned string keys. No stack effect.
    StringKeys = 31,
    /// `unsigned` (closure class id) + local range (captured use-vars).
    /// Pops the use-vars, pushes the closure.
    CreateCl = 32,
    /// No immediate. Pops the thrown value. Terminal.
    Throw = 33,
    /// No immediate. Pops the return value; asserts depth == 1. Terminal.
    RetC = 34,
    /// `unsigned` (class id being defined). Records `defClsMap[id]`.
    DefCls = 35,
    /// `unsigned` (class id, read from the same immediate slot as
    /// `DefCls` per the §9 open question). Records `defClsMap[id]`.
    DefClsNop = 36,
}

/// Opcode post-effect flags (§4.2 "Post-effects").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpFlags {
    /// Terminal (`TF`): throw/return/unconditional-jmp. Resets current
    /// stack depth to 0 for subsequent instructions.
    pub terminal: bool,
    /// Opens an FPI region.
    pub fpush: bool,
    /// Closes the nearest open FPI region.
    pub fcall: bool,
    /// Records a `defClsMap` entry.
    pub defcls: bool,
    /// Is a return-family opcode; stack depth must equal 1 at emission.
    pub ret: bool,
}

impl Opcode {
    #[must_use]
    pub fn flags(self) -> OpFlags {
        use Opcode::*;
        match self {
            Jmp | JmpNS | Switch | SSwitch | Throw | RetC => OpFlags {
                terminal: true,
                ret: matches!(self, RetC),
                ..OpFlags::default()
            },
            FPushFuncD => OpFlags {
                fpush: true,
                ..OpFlags::default()
            },
            FCall | FCallD => OpFlags {
                fcall: true,
                ..OpFlags::default()
            },
            DefCls | DefClsNop => OpFlags {
                defcls: true,
                ..OpFlags::default()
            },
            _ => OpFlags::default(),
        }
    }

    /// Static stack effect `(pop, push)`. Some opcodes have a dynamic pop
    /// count that depends on their immediate; those are resolved by
    /// `Instruction::stack_effect` instead and return `None` here.
    #[must_use]
    pub fn static_effect(self) -> Option<(u16, u16)> {
        use Opcode::*;
        Some(match self {
            Nop | EntryNop => (0, 0),
            PopC => (1, 0),
            Dup => (0, 1),
            Int | Double | String | Array => (0, 1),
            NewPackedArray => return None,
            Add | Concat => (2, 1),
            CGetL => (0, 1),
            SetL => (1, 1),
            UnsetL => (0, 0),
            QueryM => (0, 1),
            SetM => (1, 1),
            NewObj => (0, 1),
            FPushFuncD => (0, 0),
            FCall | FCallD => return None,
            JmpZ | JmpNZ => (1, 0),
            Jmp | JmpNS => (0, 0),
            Switch | SSwitch => (1, 0),
            IterFree | IterTab => (0, 0),
            ClassRefGetC => (1, 0),
            CheckLocalRange => (0, 0),
            AssertRATStk => (0, 0),
            StringKeys => (0, 0),
            CreateCl => return None,
            Throw => (1, 0),
            RetC => (1, 0),
            DefCls | DefClsNop => (0, 0),
        })
    }
}

/// A kind tag for entries in an iterator table immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterKind {
    Normal,
    KeyValue,
}

/// One base of a member-key (§3 "member-key"): the sub-tag describing how
/// the element or property is addressed.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberKeyBase {
    /// Value already sitting in a VM cell, addressed by slot.
    CellOnStack(u32),
    /// Raw (unmapped) local id; remapped via `map_local` at encode time.
    Local(u32),
    /// String literal key, interned at encode time.
    String(String),
    /// Integer literal key.
    Int(i64),
    /// `elem[]` append; no payload. Only valid on `Elem`.
    NewElem,
}

/// A member-key is a tagged union over element-access and property-access,
/// each carrying one of the `MemberKeyBase` sub-tags.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberKey {
    Elem(MemberKeyBase),
    Prop(MemberKeyBase),
}

/// An opaque, sink-codec-serialized type descriptor (§3 "repo-auth-type").
/// `class_name`, if present, is interned as a literal string the way
/// `merge_repo_auth_type` does in §4.6.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoAuthType {
    pub class_name: Option<String>,
    pub bits: Vec<u8>,
}

/// An owned, uninterned array literal; interned into the sink's array
/// table at encode time.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayLit(pub Vec<u64>);

/// Tagged immediate payload (§3 "Instruction").
#[derive(Debug, Clone, PartialEq)]
pub enum Immediate {
    None,
    UInt(u64),
    Int64(i64),
    Double(f64),
    Str(String),
    Arr(ArrayLit),
    Rat(RepoAuthType),
    /// Raw (unmapped) local id.
    Local(u32),
    /// Raw iterator id.
    Iter(u32),
    /// Raw class-ref slot id.
    ClsRefSlot(u32),
    SubOp(u8),
    Branch(BlockId),
    BranchTable(Vec<BlockId>),
    /// `(string, target)` pairs; `default` is the fallback target.
    StringSwitch {
        cases: Vec<(String, BlockId)>,
        default: BlockId,
    },
    IterTable(Vec<(IterKind, u32)>),
    MemberKey(MemberKey),
    LocalRange {
        first: u32,
        count: u32,
    },
    StrVec(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Opcode,
    pub imm: Immediate,
    pub srcloc: Option<super::model::SourceLocRange>,
}

impl Instruction {
    /// Resolves this instruction's `(pop, push)` stack effect, consulting
    /// the immediate for opcodes whose effect is dynamic (§4.2).
    pub fn stack_effect(&self) -> (u16, u16) {
        if let Some(effect) = self.op.static_effect() {
            return effect;
        }
        match (self.op, &self.imm) {
            (Opcode::NewPackedArray, Immediate::UInt(n)) => (*n as u16, 1),
            (Opcode::FCall, Immediate::SubOp(n)) => (u16::from(*n), 1),
            (Opcode::FCallD, Immediate::SubOp(n)) => (u16::from(*n), 1),
            (Opcode::CreateCl, Immediate::LocalRange { count, .. }) => (*count as u16, 1),
            _ => (0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_flags_cover_control_flow_exits() {
        assert!(Opcode::Jmp.flags().terminal);
        assert!(Opcode::JmpNS.flags().terminal);
        assert!(Opcode::Switch.flags().terminal);
        assert!(Opcode::SSwitch.flags().terminal);
        assert!(Opcode::Throw.flags().terminal);
        assert!(Opcode::RetC.flags().terminal);
        assert!(Opcode::RetC.flags().ret);
        assert!(!Opcode::Jmp.flags().ret);
    }

    #[test]
    fn dynamic_effects_consult_the_immediate() {
        let inst = Instruction {
            op: Opcode::NewPackedArray,
            imm: Immediate::UInt(3),
            srcloc: None,
        };
        assert_eq!(inst.stack_effect(), (3, 1));
    }

    #[test]
    fn opcode_roundtrips_through_its_discriminant() {
        for raw in 0u8..=36 {
            assert!(Opcode::try_from(raw).is_ok(), "missing opcode {raw}");
        }
    }
}
