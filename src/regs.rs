//! Fixed x86-64 register table used by the rule language and the decoder.

use std::fmt;

macro_rules! registers {
    ($(($variant:ident, $name:literal)),* $(,)?) => {
        /// An x86-64 register.
        ///
        /// Sub-registers are distinct values ("eax" is not "rax"); the rule
        /// evaluator compares registers exactly as the disassembler reports
        /// them.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Register {
            $($variant),*
        }

        impl Register {
            /// Canonical lower-case name.
            pub fn name(self) -> &'static str {
                match self {
                    $(Register::$variant => $name),*
                }
            }

            /// Look up a register by name.  A leading `%` is accepted.
            pub fn from_name(name: &str) -> Option<Register> {
                let name = name.strip_prefix('%').unwrap_or(name);
                match name {
                    $($name => Some(Register::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

registers! {
    // Segment registers
    (Es, "es"), (Cs, "cs"), (Ss, "ss"), (Ds, "ds"), (Fs, "fs"), (Gs, "gs"),
    // 8-bit registers
    (Al, "al"), (Ah, "ah"), (Bl, "bl"), (Bh, "bh"),
    (Cl, "cl"), (Ch, "ch"), (Dl, "dl"), (Dh, "dh"),
    (Spl, "spl"), (Bpl, "bpl"), (Sil, "sil"), (Dil, "dil"),
    (R8b, "r8b"), (R9b, "r9b"), (R10b, "r10b"), (R11b, "r11b"),
    (R12b, "r12b"), (R13b, "r13b"), (R14b, "r14b"), (R15b, "r15b"),
    // 16-bit registers
    (Ax, "ax"), (Bx, "bx"), (Cx, "cx"), (Dx, "dx"),
    (Sp, "sp"), (Bp, "bp"), (Si, "si"), (Di, "di"),
    (R8w, "r8w"), (R9w, "r9w"), (R10w, "r10w"), (R11w, "r11w"),
    (R12w, "r12w"), (R13w, "r13w"), (R14w, "r14w"), (R15w, "r15w"),
    // 32-bit registers
    (Eax, "eax"), (Ebx, "ebx"), (Ecx, "ecx"), (Edx, "edx"),
    (Esp, "esp"), (Ebp, "ebp"), (Esi, "esi"), (Edi, "edi"),
    (R8d, "r8d"), (R9d, "r9d"), (R10d, "r10d"), (R11d, "r11d"),
    (R12d, "r12d"), (R13d, "r13d"), (R14d, "r14d"), (R15d, "r15d"),
    // 64-bit registers
    (Rax, "rax"), (Rbx, "rbx"), (Rcx, "rcx"), (Rdx, "rdx"),
    (Rsp, "rsp"), (Rbp, "rbp"), (Rsi, "rsi"), (Rdi, "rdi"),
    (R8, "r8"), (R9, "r9"), (R10, "r10"), (R11, "r11"),
    (R12, "r12"), (R13, "r13"), (R14, "r14"), (R15, "r15"),
    (Rip, "rip"),
    // Flags
    (Eflags, "eflags"),
    // MMX / x87
    (Mm0, "mm0"), (Mm1, "mm1"), (Mm2, "mm2"), (Mm3, "mm3"),
    (Mm4, "mm4"), (Mm5, "mm5"), (Mm6, "mm6"), (Mm7, "mm7"),
    (St0, "st(0)"), (St1, "st(1)"), (St2, "st(2)"), (St3, "st(3)"),
    (St4, "st(4)"), (St5, "st(5)"), (St6, "st(6)"), (St7, "st(7)"),
    // Vector registers
    (Xmm0, "xmm0"), (Xmm1, "xmm1"), (Xmm2, "xmm2"), (Xmm3, "xmm3"),
    (Xmm4, "xmm4"), (Xmm5, "xmm5"), (Xmm6, "xmm6"), (Xmm7, "xmm7"),
    (Xmm8, "xmm8"), (Xmm9, "xmm9"), (Xmm10, "xmm10"), (Xmm11, "xmm11"),
    (Xmm12, "xmm12"), (Xmm13, "xmm13"), (Xmm14, "xmm14"), (Xmm15, "xmm15"),
    (Ymm0, "ymm0"), (Ymm1, "ymm1"), (Ymm2, "ymm2"), (Ymm3, "ymm3"),
    (Ymm4, "ymm4"), (Ymm5, "ymm5"), (Ymm6, "ymm6"), (Ymm7, "ymm7"),
    (Ymm8, "ymm8"), (Ymm9, "ymm9"), (Ymm10, "ymm10"), (Ymm11, "ymm11"),
    (Ymm12, "ymm12"), (Ymm13, "ymm13"), (Ymm14, "ymm14"), (Ymm15, "ymm15"),
    (Zmm0, "zmm0"), (Zmm1, "zmm1"), (Zmm2, "zmm2"), (Zmm3, "zmm3"),
    (Zmm4, "zmm4"), (Zmm5, "zmm5"), (Zmm6, "zmm6"), (Zmm7, "zmm7"),
    (Zmm8, "zmm8"), (Zmm9, "zmm9"), (Zmm10, "zmm10"), (Zmm11, "zmm11"),
    (Zmm12, "zmm12"), (Zmm13, "zmm13"), (Zmm14, "zmm14"), (Zmm15, "zmm15"),
}

impl Register {
    /// True for segment registers.
    pub fn is_segment(self) -> bool {
        matches!(
            self,
            Register::Es
                | Register::Cs
                | Register::Ss
                | Register::Ds
                | Register::Fs
                | Register::Gs
        )
    }

    /// True for registers usable as a memory-operand base (32/64-bit GPRs
    /// and rip).
    pub fn is_base(self) -> bool {
        self == Register::Rip || self.is_gpr()
    }

    /// True for registers usable as a memory-operand index (32/64-bit GPRs
    /// excluding the stack pointer; rip is not an index register).
    pub fn is_index(self) -> bool {
        self.is_gpr() && !matches!(self, Register::Rsp | Register::Esp)
    }

    fn is_gpr(self) -> bool {
        use Register::*;
        matches!(
            self,
            Eax | Ebx | Ecx | Edx | Esp | Ebp | Esi | Edi | R8d | R9d | R10d | R11d | R12d
                | R13d | R14d | R15d | Rax | Rbx | Rcx | Rdx | Rsp | Rbp | Rsi | Rdi | R8 | R9
                | R10 | R11 | R12 | R13 | R14 | R15
        )
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        for reg in [Register::Rax, Register::R13d, Register::Ah, Register::Fs] {
            assert_eq!(Register::from_name(reg.name()), Some(reg));
        }
    }

    #[test]
    fn test_percent_prefix() {
        assert_eq!(Register::from_name("%rip"), Some(Register::Rip));
        assert_eq!(Register::from_name("rip"), Some(Register::Rip));
        assert_eq!(Register::from_name("%bogus"), None);
    }

    #[test]
    fn test_classes() {
        assert!(Register::Fs.is_segment());
        assert!(!Register::Rax.is_segment());
        assert!(Register::Rip.is_base());
        assert!(!Register::Rip.is_index());
        assert!(!Register::Rsp.is_index());
        assert!(Register::Rbp.is_index());
        assert!(!Register::Ax.is_base());
    }
}
