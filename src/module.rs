//! The decomposed program hierarchy consumed by the analysis:
//! Program -> Module -> Function -> Block -> Instruction.
//!
//! A loader/disassembler frontend builds these; the analysis only reads them.

use anyhow::Result;
use thiserror::Error;

use crate::{arch::Arch, insn::Instruction, insn::Semantic, VA};

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("invalid address: {0:#x}")]
    InvalidAddress(u64),
    #[error("empty block at: {0:#x}")]
    EmptyBlock(u64),
}

#[derive(Clone, Debug)]
pub struct Block {
    pub address:      VA,
    pub instructions: Vec<Instruction>,
}

impl Block {
    /// the block terminator: its last instruction.
    pub fn terminator(&self) -> Result<&Instruction> {
        self.instructions
            .last()
            .ok_or_else(|| ModuleError::EmptyBlock(self.address).into())
    }

    pub fn next_address(&self) -> VA {
        match self.instructions.last() {
            Some(insn) => insn.next_address(),
            None => self.address,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    pub address: VA,
    pub name:    String,
    pub blocks:  Vec<Block>,
}

impl Function {
    pub fn block_at(&self, va: VA) -> Option<&Block> {
        self.blocks.iter().find(|b| b.address == va)
    }

    pub fn block_index_at(&self, va: VA) -> Option<usize> {
        self.blocks.iter().position(|b| b.address == va)
    }

    pub fn contains_indirect_jump(&self) -> bool {
        self.blocks.iter().any(|b| {
            matches!(
                b.instructions.last().map(|i| &i.semantic),
                Some(Semantic::IndirectJump { .. })
            )
        })
    }
}

#[derive(Clone, Debug)]
pub struct Module {
    pub name:      String,
    pub arch:      Arch,
    pub functions: Vec<Function>,
}

#[derive(Clone, Debug, Default)]
pub struct Program {
    pub modules: Vec<Module>,
}
