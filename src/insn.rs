//! The instruction model consumed by the analysis.
//!
//! A disassembler frontend produces these records; the core never decodes
//! bytes itself, with one exception: post/pre-indexed addressing on AArch64
//! is classified from the raw 4-byte encoding, because the operand list
//! does not distinguish it.

use byteorder::{ByteOrder, LittleEndian};

use crate::{arch::Arch, register::Reg, VA};

/// The one classifying value each instruction carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Semantic {
    /// unconditional branch with an immediate target.
    DirectBranch { target: VA },
    /// branch whose target is the value of `register`.
    IndirectJump { register: Reg },
    /// conditional branch; `mnemonic` identifies the predicate
    /// (e.g. "ja", "jbe", "b.ls", "b.hi").
    ControlFlowConditional { mnemonic: String, target: VA },
    Arithmetic,
    /// load or store.
    Memory,
    Move,
    Compare,
    Other,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemOperand {
    pub base:  Option<Reg>,
    pub index: Option<Reg>,
    /// x64 SIB multiplier (1, 2, 4, 8).
    pub scale: u8,
    /// AArch64 extend/shift amount applied to the index register.
    pub shift: u8,
    pub disp:  i64,
}

impl MemOperand {
    pub fn base(base: Reg) -> MemOperand {
        MemOperand {
            base:  Some(base),
            index: None,
            scale: 1,
            shift: 0,
            disp:  0,
        }
    }

    pub fn base_disp(base: Reg, disp: i64) -> MemOperand {
        MemOperand {
            disp,
            ..MemOperand::base(base)
        }
    }

    pub fn base_index(base: Reg, index: Reg) -> MemOperand {
        MemOperand {
            index: Some(index),
            ..MemOperand::base(base)
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    Mem(MemOperand),
}

/// The canonical operand shape of an instruction.
///
/// Engines match on this rather than re-inspecting operand types, so each
/// semantic operation has exactly one case to handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperandsMode {
    None,
    Reg,
    Imm,
    RegReg,
    RegImm,
    RegMem,
    MemReg,
    RegRegReg,
    RegRegImm,
    RegRegMem,
    RegMemImm,
    RegRegMemImm,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assembly {
    pub mnemonic: String,
    pub operands: Vec<Operand>,
}

/// scalar loads/stores whose trailing register operands stand for memory.
const LOAD_STORE_SCALAR: &[&str] = &[
    "ldr", "ldrb", "ldrh", "ldrsb", "ldrsh", "ldrsw", "str", "strb", "strh",
];

/// load/store pair variants.
const LOAD_STORE_PAIR: &[&str] = &["ldp", "stp"];

impl Assembly {
    pub fn new(mnemonic: &str, operands: Vec<Operand>) -> Assembly {
        Assembly {
            mnemonic: mnemonic.to_string(),
            operands,
        }
    }

    pub fn mode(&self) -> OperandsMode {
        use Operand::*;
        match self.operands.as_slice() {
            [] => OperandsMode::None,
            [Reg(_)] => OperandsMode::Reg,
            [Imm(_)] => OperandsMode::Imm,
            [Reg(_), Reg(_)] => OperandsMode::RegReg,
            [Reg(_), Imm(_)] => OperandsMode::RegImm,
            [Reg(_), Mem(_)] => OperandsMode::RegMem,
            [Mem(_), Reg(_)] => OperandsMode::MemReg,
            [Reg(_), Reg(_), Reg(_)] => OperandsMode::RegRegReg,
            [Reg(_), Reg(_), Imm(_)] => OperandsMode::RegRegImm,
            [Reg(_), Reg(_), Mem(_)] => OperandsMode::RegRegMem,
            [Reg(_), Mem(_), Imm(_)] => OperandsMode::RegMemImm,
            [Reg(_), Reg(_), Mem(_), Imm(_)] => OperandsMode::RegRegMemImm,
            _ => OperandsMode::Unknown,
        }
    }

    /// Rewrite raw decoded operand shapes into the canonical form,
    /// so the tree builder sees one case per semantic operation.
    ///
    /// Decoders represent a register acting as a memory base as a plain
    /// register operand:
    ///
    /// ```text
    ///   ldr x1, [x1]        ->  (reg, reg)
    ///   ldr x1, [x2, x3]    ->  (reg, reg, reg)
    ///   ldp x1, x2, [x3]    ->  (reg, reg, reg)
    /// ```
    ///
    /// all of which are special cases of a memory operand. This pass is
    /// idempotent and preserves the architectural reads/writes.
    pub fn canonicalize(&mut self, arch: Arch) {
        if arch != Arch::AArch64 {
            return;
        }

        if LOAD_STORE_SCALAR.contains(&self.mnemonic.as_str()) {
            if let [Operand::Reg(r0), Operand::Reg(base)] = self.operands.as_slice() {
                let (r0, base) = (*r0, *base);
                self.operands = vec![Operand::Reg(r0), Operand::Mem(MemOperand::base(base))];
            } else if let [Operand::Reg(r0), Operand::Reg(base), Operand::Reg(index)] = self.operands.as_slice() {
                let (r0, base, index) = (*r0, *base, *index);
                self.operands = vec![Operand::Reg(r0), Operand::Mem(MemOperand::base_index(base, index))];
            }
        } else if LOAD_STORE_PAIR.contains(&self.mnemonic.as_str()) {
            if let [Operand::Reg(r0), Operand::Reg(r1), Operand::Reg(base)] = self.operands.as_slice() {
                let (r0, r1, base) = (*r0, *r1, *base);
                self.operands = vec![
                    Operand::Reg(r0),
                    Operand::Reg(r1),
                    Operand::Mem(MemOperand::base(base)),
                ];
            }
        } else if self.mnemonic == "movz" {
            // MOV is preferred when the value is in [0, 0xFFFF].
            if let [_, Operand::Imm(imm)] = self.operands.as_slice() {
                if (0..(0x1i64 << 16)).contains(imm) {
                    self.mnemonic = "mov".to_string();
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Instruction {
    pub address:  VA,
    pub bytes:    Vec<u8>,
    pub semantic: Semantic,
    pub assembly: Assembly,
}

impl Instruction {
    pub fn length(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// address of the next sequential instruction.
    pub fn next_address(&self) -> VA {
        self.address + self.length()
    }

    fn raw_encoding(&self) -> Option<u32> {
        if self.bytes.len() == 4 {
            Some(LittleEndian::read_u32(&self.bytes))
        } else {
            None
        }
    }

    /// AArch64 post-indexed addressing, classified from the raw encoding.
    pub fn is_post_index(&self) -> bool {
        let bin = match self.raw_encoding() {
            Some(bin) => bin,
            None => return false,
        };
        if LOAD_STORE_PAIR.contains(&self.assembly.mnemonic.as_str()) {
            (bin & 0x3B80_0000) == 0x2880_0000
        } else if LOAD_STORE_SCALAR.contains(&self.assembly.mnemonic.as_str()) {
            (bin & 0x3B20_0C00) == 0x3800_0400
        } else {
            false
        }
    }

    /// AArch64 pre-indexed addressing, classified from the raw encoding.
    pub fn is_pre_index(&self) -> bool {
        let bin = match self.raw_encoding() {
            Some(bin) => bin,
            None => return false,
        };
        if LOAD_STORE_PAIR.contains(&self.assembly.mnemonic.as_str()) {
            (bin & 0x3B80_0000) == 0x2980_0000
        } else if LOAD_STORE_SCALAR.contains(&self.assembly.mnemonic.as_str()) {
            (bin & 0x3B20_0C00) == 0x3800_0C00
        } else {
            false
        }
    }

    /// the memory access width of a load/store, derived from its mnemonic
    /// and destination register width.
    pub fn access_width(&self) -> u8 {
        match self.assembly.mnemonic.as_str() {
            "ldrb" | "ldrsb" | "strb" => 1,
            "ldrh" | "ldrsh" | "strh" => 2,
            "ldrsw" => 4,
            _ => match self.assembly.operands.first() {
                Some(Operand::Reg(r)) => r.size,
                _ => 8,
            },
        }
    }
}
