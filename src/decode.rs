//! Capstone-based x86-64 instruction decoder.
//!
//! Decodes one instruction at a time from the mapped image, translating the
//! engine's operand and register detail into the crate IR.  Detail mode is
//! only enabled when some rule or call argument actually inspects operands,
//! instruction groups, or register sets.

use std::fmt;
use std::str::FromStr;

use capstone::arch::x86::{
    ArchMode as X86Mode, ArchSyntax as X86Syntax, X86Operand, X86OperandType,
};
use capstone::arch::{BuildsCapstone, BuildsCapstoneSyntax, DetailsArchInsn};
use capstone::{Capstone, InsnGroupType, RegId};

use crate::regs::Register;
use crate::{Access, Address, Instruction, MemRef, Operand, OperandValue, Result};
use crate::MAX_INSTRUCTION_SIZE;

/// Assembly syntax for mnemonic/operand text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Syntax {
    #[default]
    Att,
    Intel,
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Syntax::Att => write!(f, "ATT"),
            Syntax::Intel => write!(f, "intel"),
        }
    }
}

impl FromStr for Syntax {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ATT" => Ok(Syntax::Att),
            "intel" => Ok(Syntax::Intel),
            _ => Err(format!(
                "bad value \"{s}\" for `--syntax' option; expected \"ATT\" or \"intel\""
            )),
        }
    }
}

/// An x86-64 decoder.
pub struct Decoder {
    cs: Capstone,
    detail: bool,
}

impl Decoder {
    /// Build a decoder.  `detail` enables operand/group/register extraction.
    pub fn new(syntax: Syntax, detail: bool) -> Result<Self> {
        let cs = Capstone::new()
            .x86()
            .mode(X86Mode::Mode64)
            .syntax(match syntax {
                Syntax::Att => X86Syntax::Att,
                Syntax::Intel => X86Syntax::Intel,
            })
            .detail(detail)
            .build()?;
        Ok(Decoder { cs, detail })
    }

    /// Decode the single instruction at `offset` into the image, reported at
    /// virtual address `address`.  Returns `None` for undecodable bytes.
    pub fn decode(&self, image: &[u8], offset: usize, address: Address) -> Option<Instruction> {
        if offset >= image.len() {
            return None;
        }
        let end = std::cmp::min(offset + MAX_INSTRUCTION_SIZE, image.len());
        let decoded = self.cs.disasm_count(&image[offset..end], address, 1).ok()?;
        let insn = decoded.iter().next()?;

        let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
        let size = insn.bytes().len().min(MAX_INSTRUCTION_SIZE);
        bytes[..size].copy_from_slice(&insn.bytes()[..size]);

        let mut out = Instruction {
            address: insn.address(),
            size: size as u8,
            mnemonic: insn.mnemonic().unwrap_or("").to_string(),
            op_str: insn.op_str().unwrap_or("").to_string(),
            bytes,
            ..Instruction::default()
        };

        if self.detail {
            let detail = self.cs.insn_detail(&insn).ok()?;
            for group in detail.groups() {
                match u32::from(group.0) {
                    InsnGroupType::CS_GRP_CALL => out.call = true,
                    InsnGroupType::CS_GRP_JUMP => out.jump = true,
                    InsnGroupType::CS_GRP_RET => out.ret = true,
                    _ => {}
                }
            }

            for reg in detail.regs_read() {
                if let Some(r) = self.register(*reg) {
                    push_unique(&mut out.regs_read, r);
                }
            }
            for reg in detail.regs_write() {
                if let Some(r) = self.register(*reg) {
                    push_unique(&mut out.regs_write, r);
                }
            }

            if let Some(x86) = detail.arch_detail().x86() {
                for op in x86.operands() {
                    // Operands over registers outside the table (x87 state,
                    // control/debug registers) are dropped, not fatal.
                    let Some(operand) = self.operand(&op) else {
                        continue;
                    };
                    // Fold explicit operand registers into the access sets.
                    match operand.value {
                        OperandValue::Reg(r) => {
                            if operand.access.is_read() {
                                push_unique(&mut out.regs_read, r);
                            }
                            if operand.access.is_write() {
                                push_unique(&mut out.regs_write, r);
                            }
                        }
                        OperandValue::Mem(m) => {
                            for r in [m.base, m.index].into_iter().flatten() {
                                push_unique(&mut out.regs_read, r);
                            }
                        }
                        OperandValue::Imm(_) => {}
                    }
                    out.operands.push(operand);
                }
            }
        }

        Some(out)
    }

    fn operand(&self, op: &X86Operand) -> Option<Operand> {
        let value = match op.op_type {
            X86OperandType::Imm(imm) => OperandValue::Imm(imm),
            X86OperandType::Reg(reg) => OperandValue::Reg(self.register(reg)?),
            X86OperandType::Mem(mem) => OperandValue::Mem(MemRef {
                segment: self.register(mem.segment()),
                base: self.register(mem.base()),
                index: self.register(mem.index()),
                scale: mem.scale() as u8,
                disp: mem.disp() as i32,
            }),
            _ => return None,
        };
        let access = match op.access {
            Some(access) => Access::new(access.is_readable(), access.is_writable()),
            None => Access::NONE,
        };
        Some(Operand {
            value,
            access,
            size: op.size,
        })
    }

    /// Map an engine register id to the crate register table.
    fn register(&self, reg: RegId) -> Option<Register> {
        if reg.0 == 0 {
            return None;
        }
        let name = self.cs.reg_name(reg)?;
        Register::from_name(&name)
    }
}

fn push_unique(regs: &mut Vec<Register>, reg: Register) {
    if !regs.contains(&reg) {
        regs.push(reg);
    }
}
