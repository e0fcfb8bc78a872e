// Wed Jan 14 2026 - Alex

pub mod registers;

pub use registers::Register;

use std::collections::BTreeSet;

use capstone::arch::x86::{
    ArchMode, ArchSyntax, X86Insn, X86InsnGroup, X86OperandType,
};
use capstone::arch::{ArchOperand, BuildsCapstone, BuildsCapstoneSyntax};
use capstone::{Capstone, InsnGroupId, InsnId, RegId};

use crate::config::Syntax;
use crate::error::{FrontendError, Result};

/// Longest valid x86-64 instruction encoding.
pub const MAX_INSN_LEN: usize = 15;

pub type Access = u8;
pub const ACCESS_NONE: Access = 0;
pub const ACCESS_READ: Access = 0x1;
pub const ACCESS_WRITE: Access = 0x2;

/// A decoded memory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub segment: Register,
    pub base: Register,
    pub index: Register,
    pub scale: i32,
    pub disp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Imm(i64),
    Reg(Register),
    Mem(MemRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    pub size: u8,
    pub access: Access,
}

/// An owned instruction fact record, extracted once per decode so the
/// matcher never touches decoder internals.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: u64,
    pub size: u8,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub op_str: String,
    pub operands: Vec<Operand>,
    pub is_call: bool,
    pub is_jump: bool,
    pub is_ret: bool,
    pub reads: BTreeSet<Register>,
    pub writes: BTreeSet<Register>,
    /// The decoder reports a bogus memory access for LEA and NOP; the
    /// `.access` fact is zeroed for these.
    pub lea_or_nop: bool,
    /// Undecodable bytes surface as 1-byte data items.
    pub data: bool,
}

impl Instruction {
    /// Full assembly string, `mnemonic op_str`.
    pub fn assembly(&self) -> String {
        if self.op_str.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.op_str)
        }
    }

    pub fn end_address(&self) -> u64 {
        self.address + self.size as u64
    }
}

pub struct Decoder {
    cs: Capstone,
    detail: bool,
}

impl Decoder {
    /// Open a decoder handle.  Detail mode exposes operand structure,
    /// groups, and register access; it is enabled only when some rule
    /// depends on such facts.
    pub fn new(syntax: Syntax, detail: bool) -> Result<Self> {
        let arch_syntax = match syntax {
            Syntax::Att => ArchSyntax::Att,
            Syntax::Intel => ArchSyntax::Intel,
        };
        let cs = Capstone::new()
            .x86()
            .mode(ArchMode::Mode64)
            .syntax(arch_syntax)
            .detail(detail)
            .build()
            .map_err(|e| {
                FrontendError::Decoder(format!(
                    "failed to open decoder handle: {}",
                    e
                ))
            })?;
        Ok(Self { cs, detail })
    }

    pub fn detail(&self) -> bool {
        self.detail
    }

    /// Decode the single instruction at the cursor.  Returns `None` at
    /// end of input; undecodable bytes yield a 1-byte data item so that
    /// the caller can resynchronize.
    pub fn decode_one(&self, code: &[u8], addr: u64) -> Result<Option<Instruction>> {
        if code.is_empty() {
            return Ok(None);
        }
        let window = &code[..code.len().min(MAX_INSN_LEN)];
        let decoded = match self.cs.disasm_count(window, addr, 1) {
            Ok(insns) => insns.iter().next().map(|insn| self.extract(insn)),
            Err(_) => None,
        };
        match decoded {
            Some(insn) => insn.map(Some),
            None => Ok(Some(Instruction {
                address: addr,
                size: 1,
                bytes: vec![code[0]],
                mnemonic: ".byte".to_string(),
                op_str: format!("0x{:02x}", code[0]),
                operands: Vec::new(),
                is_call: false,
                is_jump: false,
                is_ret: false,
                reads: BTreeSet::new(),
                writes: BTreeSet::new(),
                lea_or_nop: false,
                data: true,
            })),
        }
    }

    fn register(&self, reg: RegId) -> Register {
        if reg.0 == 0 {
            return Register::None;
        }
        match self.cs.reg_name(reg) {
            Some(name) => Register::from_decoder_name(&name),
            None => Register::Invalid,
        }
    }

    fn extract(&self, insn: &capstone::Insn) -> Result<Instruction> {
        let mut out = Instruction {
            address: insn.address(),
            size: insn.bytes().len() as u8,
            bytes: insn.bytes().to_vec(),
            mnemonic: insn.mnemonic().unwrap_or("").to_string(),
            op_str: insn.op_str().unwrap_or("").to_string(),
            operands: Vec::new(),
            is_call: false,
            is_jump: false,
            is_ret: false,
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
            lea_or_nop: false,
            data: false,
        };
        if !self.detail {
            return Ok(out);
        }

        let detail = self.cs.insn_detail(insn).map_err(|e| {
            FrontendError::Decoder(format!(
                "failed to get details for instruction at 0x{:x}: {}",
                insn.address(),
                e
            ))
        })?;

        for group in detail.groups() {
            if *group == InsnGroupId(X86InsnGroup::X86_GRP_CALL as u8) {
                out.is_call = true;
            } else if *group == InsnGroupId(X86InsnGroup::X86_GRP_JUMP as u8) {
                out.is_jump = true;
            } else if *group == InsnGroupId(X86InsnGroup::X86_GRP_RET as u8) {
                out.is_ret = true;
            }
        }

        for reg in detail.regs_read() {
            let reg = self.register(*reg);
            if reg != Register::None && reg != Register::Invalid {
                out.reads.insert(reg);
            }
        }
        for reg in detail.regs_write() {
            let reg = self.register(*reg);
            if reg != Register::None && reg != Register::Invalid {
                out.writes.insert(reg);
            }
        }

        out.lea_or_nop = insn.id() == InsnId(X86Insn::X86_INS_LEA as u32)
            || insn.id() == InsnId(X86Insn::X86_INS_NOP as u32);

        for op in detail.arch_detail().operands() {
            let op = match op {
                ArchOperand::X86Operand(op) => op,
                _ => continue,
            };
            let mut access = ACCESS_NONE;
            if let Some(a) = op.access {
                if a.is_readable() {
                    access |= ACCESS_READ;
                }
                if a.is_writable() {
                    access |= ACCESS_WRITE;
                }
            }
            let kind = match op.op_type {
                X86OperandType::Imm(imm) => {
                    // Immediates are always read-only.
                    access = ACCESS_READ;
                    OperandKind::Imm(imm)
                }
                X86OperandType::Reg(reg) => OperandKind::Reg(self.register(reg)),
                X86OperandType::Mem(mem) => {
                    for reg in [mem.base(), mem.index(), mem.segment()] {
                        let reg = self.register(reg);
                        if reg != Register::None && reg != Register::Invalid {
                            out.reads.insert(reg);
                        }
                    }
                    OperandKind::Mem(MemRef {
                        segment: self.register(mem.segment()),
                        base: self.register(mem.base()),
                        index: self.register(mem.index()),
                        scale: mem.scale(),
                        disp: mem.disp(),
                    })
                }
                _ => continue,
            };
            // Register operands contribute to the read/write sets per
            // their access flags.
            if let OperandKind::Reg(reg) = kind {
                if reg != Register::None && reg != Register::Invalid {
                    if access & ACCESS_READ != 0 {
                        out.reads.insert(reg);
                    }
                    if access & ACCESS_WRITE != 0 {
                        out.writes.insert(reg);
                    }
                }
            }
            out.operands.push(Operand {
                kind,
                size: op.size,
                access,
            });
        }

        Ok(out)
    }
}

/// Pull-based instruction stream over a byte window, restartable by
/// constructing a new stream at any `(code, addr)` cursor.
pub struct InsnStream<'a> {
    decoder: &'a Decoder,
    code: &'a [u8],
    pos: usize,
    addr: u64,
}

impl<'a> InsnStream<'a> {
    pub fn new(decoder: &'a Decoder, code: &'a [u8], addr: u64) -> Self {
        Self {
            decoder,
            code,
            pos: 0,
            addr,
        }
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for InsnStream<'a> {
    type Item = Result<Instruction>;

    fn next(&mut self) -> Option<Self::Item> {
        match self
            .decoder
            .decode_one(&self.code[self.pos..], self.addr + self.pos as u64)
        {
            Ok(Some(insn)) => {
                self.pos += insn.size as usize;
                Some(Ok(insn))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
