// Wed Jan 14 2026 - Alex

use std::fmt;

/// The x86-64 register namespace, canonicalized from raw decoder ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Register {
    None,
    // 8-bit legacy high/low
    Ah,
    Ch,
    Dh,
    Bh,
    Al,
    Cl,
    Dl,
    Bl,
    Spl,
    Bpl,
    Sil,
    Dil,
    R8b,
    R9b,
    R10b,
    R11b,
    R12b,
    R13b,
    R14b,
    R15b,
    // 16-bit
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
    R8w,
    R9w,
    R10w,
    R11w,
    R12w,
    R13w,
    R14w,
    R15w,
    // 32-bit
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
    R8d,
    R9d,
    R10d,
    R11d,
    R12d,
    R13d,
    R14d,
    R15d,
    // 64-bit
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    // Segment
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    // x87 / SSE
    St0,
    St1,
    St2,
    St3,
    St4,
    St5,
    St6,
    St7,
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
    Ymm0,
    Ymm1,
    Ymm2,
    Ymm3,
    Ymm4,
    Ymm5,
    Ymm6,
    Ymm7,
    Ymm8,
    Ymm9,
    Ymm10,
    Ymm11,
    Ymm12,
    Ymm13,
    Ymm14,
    Ymm15,
    Zmm0,
    Zmm1,
    Zmm2,
    Zmm3,
    Zmm4,
    Zmm5,
    Zmm6,
    Zmm7,
    Zmm8,
    Zmm9,
    Zmm10,
    Zmm11,
    Zmm12,
    Zmm13,
    Zmm14,
    Zmm15,
    /// A decoder register with no counterpart in this namespace.
    Invalid,
}

const NAMES: &[(&str, Register)] = &[
    ("ah", Register::Ah),
    ("ch", Register::Ch),
    ("dh", Register::Dh),
    ("bh", Register::Bh),
    ("al", Register::Al),
    ("cl", Register::Cl),
    ("dl", Register::Dl),
    ("bl", Register::Bl),
    ("spl", Register::Spl),
    ("bpl", Register::Bpl),
    ("sil", Register::Sil),
    ("dil", Register::Dil),
    ("r8b", Register::R8b),
    ("r9b", Register::R9b),
    ("r10b", Register::R10b),
    ("r11b", Register::R11b),
    ("r12b", Register::R12b),
    ("r13b", Register::R13b),
    ("r14b", Register::R14b),
    ("r15b", Register::R15b),
    ("ax", Register::Ax),
    ("cx", Register::Cx),
    ("dx", Register::Dx),
    ("bx", Register::Bx),
    ("sp", Register::Sp),
    ("bp", Register::Bp),
    ("si", Register::Si),
    ("di", Register::Di),
    ("r8w", Register::R8w),
    ("r9w", Register::R9w),
    ("r10w", Register::R10w),
    ("r11w", Register::R11w),
    ("r12w", Register::R12w),
    ("r13w", Register::R13w),
    ("r14w", Register::R14w),
    ("r15w", Register::R15w),
    ("eax", Register::Eax),
    ("ecx", Register::Ecx),
    ("edx", Register::Edx),
    ("ebx", Register::Ebx),
    ("esp", Register::Esp),
    ("ebp", Register::Ebp),
    ("esi", Register::Esi),
    ("edi", Register::Edi),
    ("r8d", Register::R8d),
    ("r9d", Register::R9d),
    ("r10d", Register::R10d),
    ("r11d", Register::R11d),
    ("r12d", Register::R12d),
    ("r13d", Register::R13d),
    ("r14d", Register::R14d),
    ("r15d", Register::R15d),
    ("rax", Register::Rax),
    ("rcx", Register::Rcx),
    ("rdx", Register::Rdx),
    ("rbx", Register::Rbx),
    ("rsp", Register::Rsp),
    ("rbp", Register::Rbp),
    ("rsi", Register::Rsi),
    ("rdi", Register::Rdi),
    ("r8", Register::R8),
    ("r9", Register::R9),
    ("r10", Register::R10),
    ("r11", Register::R11),
    ("r12", Register::R12),
    ("r13", Register::R13),
    ("r14", Register::R14),
    ("r15", Register::R15),
    ("rip", Register::Rip),
    ("rflags", Register::Eflags),
    ("eflags", Register::Eflags),
    ("flags", Register::Eflags),
    ("es", Register::Es),
    ("cs", Register::Cs),
    ("ss", Register::Ss),
    ("ds", Register::Ds),
    ("fs", Register::Fs),
    ("gs", Register::Gs),
    ("st(0)", Register::St0),
    ("st(1)", Register::St1),
    ("st(2)", Register::St2),
    ("st(3)", Register::St3),
    ("st(4)", Register::St4),
    ("st(5)", Register::St5),
    ("st(6)", Register::St6),
    ("st(7)", Register::St7),
    ("st0", Register::St0),
    ("st1", Register::St1),
    ("st2", Register::St2),
    ("st3", Register::St3),
    ("st4", Register::St4),
    ("st5", Register::St5),
    ("st6", Register::St6),
    ("st7", Register::St7),
    ("xmm0", Register::Xmm0),
    ("xmm1", Register::Xmm1),
    ("xmm2", Register::Xmm2),
    ("xmm3", Register::Xmm3),
    ("xmm4", Register::Xmm4),
    ("xmm5", Register::Xmm5),
    ("xmm6", Register::Xmm6),
    ("xmm7", Register::Xmm7),
    ("xmm8", Register::Xmm8),
    ("xmm9", Register::Xmm9),
    ("xmm10", Register::Xmm10),
    ("xmm11", Register::Xmm11),
    ("xmm12", Register::Xmm12),
    ("xmm13", Register::Xmm13),
    ("xmm14", Register::Xmm14),
    ("xmm15", Register::Xmm15),
    ("ymm0", Register::Ymm0),
    ("ymm1", Register::Ymm1),
    ("ymm2", Register::Ymm2),
    ("ymm3", Register::Ymm3),
    ("ymm4", Register::Ymm4),
    ("ymm5", Register::Ymm5),
    ("ymm6", Register::Ymm6),
    ("ymm7", Register::Ymm7),
    ("ymm8", Register::Ymm8),
    ("ymm9", Register::Ymm9),
    ("ymm10", Register::Ymm10),
    ("ymm11", Register::Ymm11),
    ("ymm12", Register::Ymm12),
    ("ymm13", Register::Ymm13),
    ("ymm14", Register::Ymm14),
    ("ymm15", Register::Ymm15),
    ("zmm0", Register::Zmm0),
    ("zmm1", Register::Zmm1),
    ("zmm2", Register::Zmm2),
    ("zmm3", Register::Zmm3),
    ("zmm4", Register::Zmm4),
    ("zmm5", Register::Zmm5),
    ("zmm6", Register::Zmm6),
    ("zmm7", Register::Zmm7),
    ("zmm8", Register::Zmm8),
    ("zmm9", Register::Zmm9),
    ("zmm10", Register::Zmm10),
    ("zmm11", Register::Zmm11),
    ("zmm12", Register::Zmm12),
    ("zmm13", Register::Zmm13),
    ("zmm14", Register::Zmm14),
    ("zmm15", Register::Zmm15),
    ("nil", Register::None),
];

impl Register {
    /// Canonicalize a register name (decoder spelling or rule literal).
    pub fn from_name(name: &str) -> Option<Register> {
        let lower = name.to_ascii_lowercase();
        NAMES
            .iter()
            .find(|(n, _)| *n == lower)
            .map(|(_, reg)| *reg)
    }

    /// Canonicalize a decoder-reported name; unknown registers map to
    /// `Invalid` rather than failing the run.
    pub fn from_decoder_name(name: &str) -> Register {
        Register::from_name(name).unwrap_or(Register::Invalid)
    }

    pub fn name(&self) -> &'static str {
        NAMES
            .iter()
            .find(|(_, reg)| reg == self)
            .map(|(n, _)| *n)
            .unwrap_or("<invalid>")
    }

    pub fn is_gp64(&self) -> bool {
        matches!(
            self,
            Register::Rax
                | Register::Rcx
                | Register::Rdx
                | Register::Rbx
                | Register::Rsp
                | Register::Rbp
                | Register::Rsi
                | Register::Rdi
                | Register::R8
                | Register::R9
                | Register::R10
                | Register::R11
                | Register::R12
                | Register::R13
                | Register::R14
                | Register::R15
        )
    }

    pub fn is_gp32(&self) -> bool {
        matches!(
            self,
            Register::Eax
                | Register::Ecx
                | Register::Edx
                | Register::Ebx
                | Register::Esp
                | Register::Ebp
                | Register::Esi
                | Register::Edi
                | Register::R8d
                | Register::R9d
                | Register::R10d
                | Register::R11d
                | Register::R12d
                | Register::R13d
                | Register::R14d
                | Register::R15d
        )
    }

    pub fn is_segment(&self) -> bool {
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

    /// Valid as a memory-operand base: none, 64/32-bit gp, or RIP.
    pub fn is_mem_base(&self) -> bool {
        *self == Register::None
            || *self == Register::Rip
            || self.is_gp64()
            || self.is_gp32()
    }

    /// Valid as a memory-operand index: none or 64/32-bit gp except the
    /// stack pointer.
    pub fn is_mem_index(&self) -> bool {
        if matches!(self, Register::Rsp | Register::Esp) {
            return false;
        }
        *self == Register::None || self.is_gp64() || self.is_gp32()
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
