//! The match/action rule language.
//!
//! A rule pairs a boolean match expression over instruction attributes with
//! an action describing how matching instructions are rewritten.  This module
//! holds the abstract syntax; `lexer` and `parser` build it from the strings
//! given on the command line.

pub mod lexer;
pub mod parser;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use regex::Regex;

use crate::csv::CsvRecord;
use crate::plugin::PluginId;
use crate::regs::Register;
use crate::{Access, OpKind};

/// The attribute a match test extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    True,
    False,
    Plugin,
    Assembly,
    Address,
    Call,
    Jump,
    Mnemonic,
    Offset,
    Random,
    Return,
    Size,
    Op,
    Src,
    Dst,
    Imm,
    Reg,
    Mem,
    Regs,
    Reads,
    Writes,
}

/// Sub-field selector for operand attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchField {
    None,
    Type,
    Access,
    Size,
    Segment,
    Displ,
    Base,
    Index,
    Scale,
}

impl fmt::Display for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchField::None => "",
            MatchField::Type => "type",
            MatchField::Access => "access",
            MatchField::Size => "size",
            MatchField::Segment => "seg",
            MatchField::Displ => "displ",
            MatchField::Base => "base",
            MatchField::Index => "index",
            MatchField::Scale => "scale",
        };
        write!(f, "{name}")
    }
}

/// Comparison operator of a match test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCmp {
    Defined,
    EqZero,
    NeqZero,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    In,
}

/// Type bits used by the parser to restrict which literals a value list of a
/// given attribute accepts.
pub mod ty {
    pub const NIL: u8 = 0x01;
    pub const INTEGER: u8 = 0x02;
    pub const OPERAND: u8 = 0x04;
    pub const ACCESS: u8 = 0x08;
    pub const REGISTER: u8 = 0x10;
    pub const STRING: u8 = 0x40;
}

/// A typed attribute value.
///
/// Variant order defines the total order used by `<`/`<=`/`>`/`>=` tests:
/// values compare first by type tag, then by payload.  `Undefined` is
/// special: it participates in the storage order but fails every comparison
/// at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchValue {
    Undefined,
    Nil,
    Integer(i64),
    Operand(OpKind),
    Access(Access),
    Register(Register),
    Memory,
}

impl MatchValue {
    pub fn is_undefined(self) -> bool {
        self == MatchValue::Undefined
    }

    /// Type bit of this value (see [`ty`]).
    pub fn type_bit(self) -> u8 {
        match self {
            MatchValue::Undefined => 0,
            MatchValue::Nil => ty::NIL,
            MatchValue::Integer(_) => ty::INTEGER,
            MatchValue::Operand(_) => ty::OPERAND,
            MatchValue::Access(_) => ty::ACCESS,
            MatchValue::Register(_) => ty::REGISTER,
            MatchValue::Memory => 0x20,
        }
    }

    /// Compare for evaluation: `None` whenever either side is undefined.
    pub fn compare(self, other: MatchValue) -> Option<Ordering> {
        if self.is_undefined() || other.is_undefined() {
            return None;
        }
        Some(self.cmp(&other))
    }
}

impl fmt::Display for MatchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchValue::Undefined => write!(f, "undefined"),
            MatchValue::Nil => write!(f, "nil"),
            MatchValue::Integer(i) => write!(f, "{i}"),
            MatchValue::Operand(kind) => write!(f, "{kind}"),
            MatchValue::Access(access) => write!(f, "{access}"),
            MatchValue::Register(reg) => write!(f, "{reg}"),
            MatchValue::Memory => write!(f, "mem"),
        }
    }
}

/// Ordered value set of an equality/relational test.  Values built from a
/// CSV column carry the source record for later binding.
pub type ValueIndex = BTreeMap<MatchValue, Option<Rc<CsvRecord>>>;

/// The comparison payload of a test.
#[derive(Debug)]
pub enum TestPayload {
    /// `defined(...)`, `==0`, `!=0` need no payload
    None,
    /// Compiled regex for assembly/mnemonic tests
    Regex(Regex),
    /// Ordered value set; `basename` is set when built from a CSV file
    Values {
        basename: Option<String>,
        index: ValueIndex,
    },
    /// Register set of an `in` test
    Registers(BTreeSet<Register>),
}

/// A single match predicate.
#[derive(Debug)]
pub struct MatchTest {
    pub kind: MatchKind,
    /// Operand index (`op[3]`), when given
    pub idx: Option<u8>,
    pub field: MatchField,
    pub cmp: MatchCmp,
    /// Plugin supplying the value of a `plugin(...).match()` test
    pub plugin: Option<PluginId>,
    pub payload: TestPayload,
}

/// A match expression tree.
#[derive(Debug)]
pub enum MatchExpr {
    Test(MatchTest),
    Not(Box<MatchExpr>),
    And(Box<MatchExpr>, Box<MatchExpr>),
    Or(Box<MatchExpr>, Box<MatchExpr>),
}

/// Where a call trampoline runs relative to the patched instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallSite {
    #[default]
    Before,
    After,
    Replace,
    Conditional,
    ConditionalJump,
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallSite::Before => "before",
            CallSite::After => "after",
            CallSite::Replace => "replace",
            CallSite::Conditional => "conditional",
            CallSite::ConditionalJump => "jump",
        };
        write!(f, "{name}")
    }
}

/// A call-argument kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentKind {
    Asm,
    AsmLen,
    AsmSize,
    Addr,
    Base,
    Bytes,
    BytesSize,
    Dst,
    Id,
    Imm,
    Mem,
    MemOp,
    Next,
    Offset,
    Op,
    Random,
    Reg,
    Src,
    State,
    StaticAddr,
    Target,
    Trampoline,
    Register,
    Integer,
    Symbol,
    User,
}

/// A `mem8..mem64<seg:disp(base,index,scale)>` literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOpLiteral {
    /// Access size in bytes (1, 2, 4 or 8)
    pub size: u8,
    pub segment: Option<Register>,
    pub disp: i32,
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub scale: u8,
}

impl fmt::Display for MemOpLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn reg(r: Option<Register>) -> &'static str {
            r.map(Register::name).unwrap_or("nil")
        }
        write!(f, "mem{}<", self.size as u32 * 8)?;
        if let Some(seg) = self.segment {
            write!(f, "{seg}:")?;
        }
        write!(
            f,
            "{}({},{},{})>",
            self.disp,
            reg(self.base),
            reg(self.index),
            self.scale
        )
    }
}

/// One typed call argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub kind: ArgumentKind,
    pub field: MatchField,
    /// Pass by pointer (`&`)
    pub ptr: bool,
    /// An earlier argument of this rule has the same kind
    pub duplicate: bool,
    /// Operand index, integer literal, register ordinal, or user column
    pub value: i64,
    pub memop: Option<MemOpLiteral>,
    /// Symbol or CSV basename for `Symbol`/`User` arguments
    pub name: Option<String>,
    /// Register of a `Register` argument
    pub register: Option<Register>,
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ptr {
            write!(f, "&")?;
        }
        match self.kind {
            ArgumentKind::Asm => write!(f, "asm"),
            ArgumentKind::AsmLen => write!(f, "asm.len"),
            ArgumentKind::AsmSize => write!(f, "asm.size"),
            ArgumentKind::Addr => write!(f, "addr"),
            ArgumentKind::Base => write!(f, "base"),
            ArgumentKind::Bytes => write!(f, "instr"),
            ArgumentKind::BytesSize => write!(f, "size"),
            ArgumentKind::Id => write!(f, "id"),
            ArgumentKind::MemOp => write!(f, "{}", self.memop.expect("memop literal")),
            ArgumentKind::Next => write!(f, "next"),
            ArgumentKind::Offset => write!(f, "offset"),
            ArgumentKind::Random => write!(f, "random"),
            ArgumentKind::State => write!(f, "state"),
            ArgumentKind::StaticAddr => write!(f, "staticAddr"),
            ArgumentKind::Target => write!(f, "target"),
            ArgumentKind::Trampoline => write!(f, "trampoline"),
            ArgumentKind::Register => {
                write!(f, "{}", self.register.expect("register argument"))
            }
            ArgumentKind::Integer => write!(f, "{}", self.value),
            ArgumentKind::Symbol => write!(f, "{}", self.name.as_deref().unwrap_or("")),
            ArgumentKind::User => {
                write!(f, "{}[{}]", self.name.as_deref().unwrap_or(""), self.value)
            }
            ArgumentKind::Op
            | ArgumentKind::Src
            | ArgumentKind::Dst
            | ArgumentKind::Imm
            | ArgumentKind::Reg
            | ArgumentKind::Mem => {
                let name = match self.kind {
                    ArgumentKind::Op => "op",
                    ArgumentKind::Src => "src",
                    ArgumentKind::Dst => "dst",
                    ArgumentKind::Imm => "imm",
                    ArgumentKind::Reg => "reg",
                    _ => "mem",
                };
                write!(f, "{name}[{}]", self.value)?;
                if self.field != MatchField::None {
                    write!(f, ".{}", self.field)?;
                }
                Ok(())
            }
        }
    }
}

/// Action-specific data.
#[derive(Debug)]
pub enum ActionKind {
    Call {
        symbol: String,
        filename: String,
        args: Vec<Argument>,
        clean: bool,
        site: CallSite,
    },
    Exit(u8),
    Plugin(PluginId),
    Trap,
    Print,
    Passthru,
}

/// A parsed action with its trampoline name and original source text.
#[derive(Debug)]
pub struct Action {
    pub kind: ActionKind,
    pub name: String,
    pub source: String,
}

/// One rewriting rule: a match expression paired with an action.
#[derive(Debug)]
pub struct Rule {
    pub matching: MatchExpr,
    pub action: Action,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_order_by_type_tag() {
        // nil < integer < operand-kind < access < register < memory-marker
        assert!(MatchValue::Nil < MatchValue::Integer(i64::MIN));
        assert!(MatchValue::Integer(i64::MAX) < MatchValue::Operand(OpKind::Imm));
        assert!(MatchValue::Operand(OpKind::Mem) < MatchValue::Access(Access::NONE));
        assert!(MatchValue::Access(Access::RW) < MatchValue::Register(Register::Es));
        assert!(MatchValue::Register(Register::Eflags) < MatchValue::Memory);
    }

    #[test]
    fn test_value_order_by_payload() {
        assert!(MatchValue::Integer(-1) < MatchValue::Integer(0));
        assert!(MatchValue::Operand(OpKind::Imm) < MatchValue::Operand(OpKind::Reg));
        assert!(
            MatchValue::Register(Register::Rax) != MatchValue::Register(Register::Eax),
            "sub-registers are distinct values"
        );
    }

    #[test]
    fn test_undefined_fails_comparisons() {
        assert_eq!(MatchValue::Undefined.compare(MatchValue::Integer(0)), None);
        assert_eq!(MatchValue::Integer(0).compare(MatchValue::Undefined), None);
        assert_eq!(
            MatchValue::Integer(1).compare(MatchValue::Integer(2)),
            Some(std::cmp::Ordering::Less)
        );
    }

    #[test]
    fn test_memop_literal_display() {
        let memop = MemOpLiteral {
            size: 4,
            segment: Some(Register::Fs),
            disp: -8,
            base: Some(Register::Rax),
            index: None,
            scale: 1,
        };
        assert_eq!(memop.to_string(), "mem32<fs:-8(rax,nil,1)>");
    }

    #[test]
    fn test_argument_display() {
        let arg = Argument {
            kind: ArgumentKind::Op,
            field: MatchField::Base,
            ptr: true,
            duplicate: false,
            value: 2,
            memop: None,
            name: None,
            register: None,
        };
        assert_eq!(arg.to_string(), "&op[2].base");
    }
}
