//! Core IR, error types, and pipeline modules for the Graft binary rewriter
//! frontend.
//!
//! Graft consumes an x86-64 ELF file, disassembles its text section, and
//! evaluates a small declarative language of match/action rules against every
//! instruction.  Matching instructions are reported to an external patch
//! backend as a stream of JSON messages; the backend performs the actual code
//! splicing and emits the rewritten binary.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use graft::rewrite::{Options, Rewriter};
//!
//! let mut opts = Options::default();
//! opts.input = "path/to/binary".into();
//!
//! // One rule: insert a trap at every call instruction.
//! let rules = vec![(vec!["call".to_string()], "trap".to_string())];
//!
//! let rewriter = Rewriter::new(opts, rules).unwrap();
//! rewriter.run().unwrap();
//! ```

pub mod backend;
pub mod csv;
pub mod decode;
pub mod elf;
pub mod lang;
pub mod matcher;
pub mod metadata;
pub mod plugin;
pub mod regs;
pub mod rewrite;

use std::fmt;

use crate::regs::Register;

/// Represents an address in memory
pub type Address = u64;

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// Maximum number of match/action rules
pub const MAX_RULES: usize = 1 << 10;

/// One decoded instruction.
///
/// Operand, group, and register-set detail is only populated when the rule
/// set requires it; undetailed instructions carry empty lists.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Instruction {
    /// Address of the instruction
    pub address: Address,
    /// Size of the instruction in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "add")
    pub mnemonic: String,
    /// Instruction operands as string representation
    pub op_str: String,
    /// Raw bytes of the instruction (up to MAX_INSTRUCTION_SIZE)
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
    /// Instruction is in the call group
    pub call: bool,
    /// Instruction is in the jump group
    pub jump: bool,
    /// Instruction is in the return group
    pub ret: bool,
    /// Typed operand list
    pub operands: Vec<Operand>,
    /// Registers read by this instruction (implicit and explicit)
    pub regs_read: Vec<Register>,
    /// Registers written by this instruction (implicit and explicit)
    pub regs_write: Vec<Register>,
}

impl Instruction {
    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Full assembly string ("mnemonic operands").
    pub fn assembly(&self) -> String {
        if self.op_str.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.op_str)
        }
    }

    /// Address of the next instruction.
    pub fn next_address(&self) -> Address {
        self.address + self.size as Address
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.mnemonic, self.op_str)
    }
}

/// Operand kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpKind {
    /// Immediate operand
    Imm,
    /// Register operand
    Reg,
    /// Memory operand
    Mem,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Imm => write!(f, "imm"),
            OpKind::Reg => write!(f, "reg"),
            OpKind::Mem => write!(f, "mem"),
        }
    }
}

/// Operand access mask (read and/or write bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Access(u8);

impl Access {
    pub const NONE: Access = Access(0);
    pub const READ: Access = Access(0x1);
    pub const WRITE: Access = Access(0x2);
    pub const RW: Access = Access(0x3);

    pub fn new(read: bool, write: bool) -> Self {
        Access((read as u8) | ((write as u8) << 1))
    }

    pub fn is_read(self) -> bool {
        self.0 & 0x1 != 0
    }

    pub fn is_write(self) -> bool {
        self.0 & 0x2 != 0
    }

    /// True if any bit of `other` is present in `self`.
    pub fn intersects(self, other: Access) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Access) -> Access {
        Access(self.0 | rhs.0)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_read(), self.is_write()) {
            (false, false) => write!(f, "none"),
            (true, false) => write!(f, "r"),
            (false, true) => write!(f, "w"),
            (true, true) => write!(f, "rw"),
        }
    }
}

/// A decoded memory reference (segment, base, index, scale, displacement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemRef {
    pub segment: Option<Register>,
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub scale: u8,
    pub disp: i32,
}

/// The value half of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandValue {
    Imm(i64),
    Reg(Register),
    Mem(MemRef),
}

/// One typed instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub value: OperandValue,
    pub access: Access,
    /// Operand size in bytes
    pub size: u8,
}

impl Operand {
    pub fn kind(&self) -> OpKind {
        match self.value {
            OperandValue::Imm(_) => OpKind::Imm,
            OperandValue::Reg(_) => OpKind::Reg,
            OperandValue::Mem(_) => OpKind::Mem,
        }
    }

    pub fn mem(&self) -> Option<&MemRef> {
        match &self.value {
            OperandValue::Mem(m) => Some(m),
            _ => None,
        }
    }
}

/// Error type for the rewriting pipeline
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rule language parse error, tagged with the parser mode
    #[error("failed to parse {mode}; {msg}")]
    Parse { mode: &'static str, msg: String },

    /// ELF-level error
    #[error("failed to parse ELF file \"{path}\"; {msg}")]
    Elf { path: String, msg: String },

    /// Goblin error
    #[error(transparent)]
    Goblin(#[from] goblin::error::Error),

    /// Capstone error
    #[error("disassembler error: {0}")]
    Capstone(#[from] capstone::Error),

    /// Single-instruction decode failure
    #[error("failed to disassemble instruction at address {addr:#x}")]
    Decode { addr: Address },

    /// Plugin API violation or load failure
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Dynamic loader error
    #[error(transparent)]
    Dylib(#[from] libloading::Error),

    /// CSV reader error
    #[error(transparent)]
    Csv(#[from] ::csv::Error),

    /// Two distinct CSV records matched one evaluation
    #[error("failed to lookup value from file \"{basename}.csv\"; matching is ambiguous")]
    AmbiguousRecord { basename: String },

    /// Regex compile error
    #[error(transparent)]
    Regex(#[from] regex::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message encoding error
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Command-line or configuration error
    #[error("{0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_bytes() {
        let insn = Instruction {
            address: 0x1000,
            size: 3,
            mnemonic: "add".to_string(),
            op_str: "eax, ebx".to_string(),
            bytes: [0x01, 0xd8, 0x90, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            ..Instruction::default()
        };

        assert_eq!(insn.bytes(), &[0x01, 0xd8, 0x90]);
        assert_eq!(insn.next_address(), 0x1003);
        assert_eq!(insn.assembly(), "add eax, ebx");
    }

    #[test]
    fn test_access_bits() {
        assert!(Access::READ.is_read());
        assert!(!Access::READ.is_write());
        assert!(Access::RW.is_read() && Access::RW.is_write());
        assert_eq!(Access::READ | Access::WRITE, Access::RW);
        assert!(Access::RW.intersects(Access::WRITE));
        assert!(!Access::NONE.intersects(Access::RW));
        assert_eq!(Access::new(true, false), Access::READ);
    }

    #[test]
    fn test_access_order_matches_bits() {
        // none < r < w < rw, by bit pattern
        assert!(Access::NONE < Access::READ);
        assert!(Access::READ < Access::WRITE);
        assert!(Access::WRITE < Access::RW);
    }

    #[test]
    fn test_operand_kind() {
        let op = Operand {
            value: OperandValue::Imm(42),
            access: Access::READ,
            size: 4,
        };
        assert_eq!(op.kind(), OpKind::Imm);
        assert!(op.mem().is_none());
    }
}
