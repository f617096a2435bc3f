//! Helpers for building hand-crafted instruction streams in tests.
//!
//! The builders fill the role of a disassembler frontend: they produce the
//! `Function -> Block -> Instruction` hierarchy with the classification and
//! operand shapes a real decoder would, including the raw (pre-canonical)
//! operand forms, so canonicalization is exercised on the way in.

use crate::{
    arch::Arch,
    insn::{Assembly, Instruction, MemOperand, Operand, Semantic},
    module::{Block, Function},
    register::Reg,
    VA,
};

pub use crate::register::{
    aarch64::{w, x},
    x64::{e, r},
};

pub struct FunctionBuilder {
    arch:    Arch,
    address: VA,
    cursor:  VA,
    blocks:  Vec<Block>,
}

impl FunctionBuilder {
    pub fn aarch64(address: VA) -> FunctionBuilder {
        FunctionBuilder {
            arch: Arch::AArch64,
            address,
            cursor: address,
            blocks: vec![],
        }
    }

    pub fn x64(address: VA) -> FunctionBuilder {
        FunctionBuilder {
            arch: Arch::X64,
            address,
            cursor: address,
            blocks: vec![],
        }
    }

    /// append a block at the next sequential address.
    pub fn block<F: FnOnce(&mut BlockBuilder)>(&mut self, f: F) {
        let address = self.cursor;
        self.block_at(address, f);
    }

    /// append a block at an explicit address.
    pub fn block_at<F: FnOnce(&mut BlockBuilder)>(&mut self, address: VA, f: F) {
        let mut builder = BlockBuilder {
            arch:         self.arch,
            cursor:       address,
            instructions: vec![],
        };
        f(&mut builder);
        self.cursor = builder.cursor;
        self.blocks.push(Block {
            address,
            instructions: builder.instructions,
        });
    }

    pub fn build(self) -> Function {
        Function {
            address: self.address,
            name:    format!("sub_{:x}", self.address),
            blocks:  self.blocks,
        }
    }
}

pub struct BlockBuilder {
    arch:         Arch,
    cursor:       VA,
    instructions: Vec<Instruction>,
}

impl BlockBuilder {
    fn push(&mut self, length: u64, semantic: Semantic, mnemonic: &str, operands: Vec<Operand>) {
        self.push_encoded(length, vec![0u8; length as usize], semantic, mnemonic, operands);
    }

    fn push_encoded(
        &mut self,
        length: u64,
        bytes: Vec<u8>,
        semantic: Semantic,
        mnemonic: &str,
        operands: Vec<Operand>,
    ) {
        let mut assembly = Assembly::new(mnemonic, operands);
        assembly.canonicalize(self.arch);
        self.instructions.push(Instruction {
            address: self.cursor,
            bytes,
            semantic,
            assembly,
        });
        self.cursor += length;
    }

    // ------------------------------------------------------------------
    // shared (lengths follow the architecture's usual encodings)
    // ------------------------------------------------------------------

    pub fn mov(&mut self, d: Reg, s: Reg) {
        let length = match self.arch {
            Arch::X64 => 3,
            Arch::AArch64 => 4,
        };
        self.push(length, Semantic::Move, "mov", vec![Operand::Reg(d), Operand::Reg(s)]);
    }

    pub fn mov_imm(&mut self, d: Reg, v: i64) {
        let length = match self.arch {
            Arch::X64 => 5,
            Arch::AArch64 => 4,
        };
        self.push(length, Semantic::Move, "mov", vec![Operand::Reg(d), Operand::Imm(v)]);
    }

    pub fn cmp_imm(&mut self, n: Reg, v: i64) {
        let length = match self.arch {
            Arch::X64 => 3,
            Arch::AArch64 => 4,
        };
        self.push(length, Semantic::Compare, "cmp", vec![Operand::Reg(n), Operand::Imm(v)]);
    }

    pub fn ret(&mut self) {
        let length = match self.arch {
            Arch::X64 => 1,
            Arch::AArch64 => 4,
        };
        self.push(length, Semantic::Other, "ret", vec![]);
    }

    // ------------------------------------------------------------------
    // AArch64
    // ------------------------------------------------------------------

    pub fn adrp(&mut self, d: Reg, page: VA) {
        self.push(4, Semantic::Move, "adrp", vec![Operand::Reg(d), Operand::Imm(page as i64)]);
    }

    pub fn adr(&mut self, d: Reg, address: VA) {
        self.push(4, Semantic::Move, "adr", vec![Operand::Reg(d), Operand::Imm(address as i64)]);
    }

    pub fn add_imm(&mut self, d: Reg, n: Reg, v: i64) {
        self.push(
            4,
            Semantic::Arithmetic,
            "add",
            vec![Operand::Reg(d), Operand::Reg(n), Operand::Imm(v)],
        );
    }

    pub fn add(&mut self, d: Reg, n: Reg, m: Reg) {
        self.push(
            4,
            Semantic::Arithmetic,
            "add",
            vec![Operand::Reg(d), Operand::Reg(n), Operand::Reg(m)],
        );
    }

    /// `add d, n, m, lsl #k`
    pub fn add_shifted(&mut self, d: Reg, n: Reg, m: Reg, k: i64) {
        self.push(
            4,
            Semantic::Arithmetic,
            "add",
            vec![
                Operand::Reg(d),
                Operand::Reg(n),
                Operand::Reg(m),
                Operand::Imm(k),
            ],
        );
    }

    pub fn lsl_imm(&mut self, d: Reg, n: Reg, k: i64) {
        self.push(
            4,
            Semantic::Arithmetic,
            "lsl",
            vec![Operand::Reg(d), Operand::Reg(n), Operand::Imm(k)],
        );
    }

    pub fn b_cond(&mut self, mnemonic: &str, target: VA) {
        self.push(
            4,
            Semantic::ControlFlowConditional {
                mnemonic: mnemonic.to_string(),
                target,
            },
            mnemonic,
            vec![Operand::Imm(target as i64)],
        );
    }

    pub fn cbz(&mut self, n: Reg, target: VA) {
        self.push(
            4,
            Semantic::ControlFlowConditional {
                mnemonic: "cbz".to_string(),
                target,
            },
            "cbz",
            vec![Operand::Reg(n), Operand::Imm(target as i64)],
        );
    }

    pub fn cbnz(&mut self, n: Reg, target: VA) {
        self.push(
            4,
            Semantic::ControlFlowConditional {
                mnemonic: "cbnz".to_string(),
                target,
            },
            "cbnz",
            vec![Operand::Reg(n), Operand::Imm(target as i64)],
        );
    }

    pub fn b(&mut self, target: VA) {
        self.push(4, Semantic::DirectBranch { target }, "b", vec![Operand::Imm(
            target as i64,
        )]);
    }

    pub fn br(&mut self, target: Reg) {
        self.push(4, Semantic::IndirectJump { register: target }, "br", vec![
            Operand::Reg(target),
        ]);
    }

    /// `ldr d, [base, index]`, in the raw decoder shape (three register
    /// operands); canonicalization rewrites it to a memory operand.
    pub fn ldr(&mut self, d: Reg, base: Reg, index: Reg) {
        self.push(4, Semantic::Memory, "ldr", vec![
            Operand::Reg(d),
            Operand::Reg(base),
            Operand::Reg(index),
        ]);
    }

    /// `ldr d, [base, index, uxtw #shift]`
    pub fn ldr_shifted(&mut self, d: Reg, base: Reg, index: Reg, shift: u8) {
        let mem = MemOperand {
            shift,
            ..MemOperand::base_index(base, index)
        };
        self.push(4, Semantic::Memory, "ldr", vec![Operand::Reg(d), Operand::Mem(mem)]);
    }

    /// `ldr d, [base, #disp]`
    pub fn ldr_disp(&mut self, d: Reg, base: Reg, disp: i64) {
        self.push(4, Semantic::Memory, "ldr", vec![
            Operand::Reg(d),
            Operand::Mem(MemOperand::base_disp(base, disp)),
        ]);
    }

    /// `ldrb d, [base, index]`, raw decoder shape.
    pub fn ldrb(&mut self, d: Reg, base: Reg, index: Reg) {
        self.push(4, Semantic::Memory, "ldrb", vec![
            Operand::Reg(d),
            Operand::Reg(base),
            Operand::Reg(index),
        ]);
    }

    /// `ldr d, [base], #imm` (post-indexed), with a faithful raw encoding
    /// so the addressing mode is classified from the bytes.
    pub fn ldr_post(&mut self, d: Reg, base: Reg, imm: i64) {
        self.push_encoded(
            4,
            0xF840_0400u32.to_le_bytes().to_vec(),
            Semantic::Memory,
            "ldr",
            vec![
                Operand::Reg(d),
                Operand::Mem(MemOperand::base(base)),
                Operand::Imm(imm),
            ],
        );
    }

    /// `str s, [base, #disp]`
    pub fn str_disp(&mut self, s: Reg, base: Reg, disp: i64) {
        self.push(4, Semantic::Memory, "str", vec![
            Operand::Reg(s),
            Operand::Mem(MemOperand::base_disp(base, disp)),
        ]);
    }

    // ------------------------------------------------------------------
    // x64
    // ------------------------------------------------------------------

    /// `lea d, [rip + disp]` (7 bytes)
    pub fn lea_rip(&mut self, d: Reg, disp: i64) {
        let mem = MemOperand::base_disp(Reg::new(crate::register::x64::RIP, 8), disp);
        self.push(7, Semantic::Move, "lea", vec![Operand::Reg(d), Operand::Mem(mem)]);
    }

    /// `movsxd d, dword ptr [base + index*scale]` (4 bytes)
    pub fn movsxd_sib(&mut self, d: Reg, base: Reg, index: Reg, scale: u8) {
        let mem = MemOperand {
            scale,
            ..MemOperand::base_index(base, index)
        };
        self.push(4, Semantic::Move, "movsxd", vec![Operand::Reg(d), Operand::Mem(mem)]);
    }

    /// `mov d, [base + disp]` (4 bytes)
    pub fn mov_load(&mut self, d: Reg, base: Reg, disp: i64) {
        self.push(4, Semantic::Move, "mov", vec![
            Operand::Reg(d),
            Operand::Mem(MemOperand::base_disp(base, disp)),
        ]);
    }

    /// `mov [base + disp], s` (4 bytes)
    pub fn mov_store(&mut self, base: Reg, disp: i64, s: Reg) {
        self.push(4, Semantic::Move, "mov", vec![
            Operand::Mem(MemOperand::base_disp(base, disp)),
            Operand::Reg(s),
        ]);
    }

    /// `add d, s` (3 bytes)
    pub fn add_rr(&mut self, d: Reg, s: Reg) {
        self.push(3, Semantic::Arithmetic, "add", vec![Operand::Reg(d), Operand::Reg(s)]);
    }

    /// `jcc target` (2 bytes)
    pub fn jcc(&mut self, mnemonic: &str, target: VA) {
        self.push(
            2,
            Semantic::ControlFlowConditional {
                mnemonic: mnemonic.to_string(),
                target,
            },
            mnemonic,
            vec![Operand::Imm(target as i64)],
        );
    }

    /// `jmp target` (5 bytes)
    pub fn jmp(&mut self, target: VA) {
        self.push(5, Semantic::DirectBranch { target }, "jmp", vec![Operand::Imm(
            target as i64,
        )]);
    }

    /// `jmp reg` (2 bytes)
    pub fn jmp_reg(&mut self, target: Reg) {
        self.push(2, Semantic::IndirectJump { register: target }, "jmp", vec![
            Operand::Reg(target),
        ]);
    }
}
