//! Jump table discovery.
//!
//! Walks the functions of a module, locates indirect jumps, drives the
//! dataflow engine for the module's architecture, and recovers for each
//! jump-table site: the table base address, the element stride, the
//! target-base address where entries are offsets rather than absolute
//! addresses, and the number of valid entries.

use anyhow::Result;
use log::warn;

use crate::{analysis::tree::Expr, arch::Arch, module::Module, VA};

pub mod aarch64;
pub mod x64;

/// Everything recovered about one jump-table site.
///
/// Created only by the detector; immutable after publication.
#[derive(Clone, Debug)]
pub struct JumpTableDescriptor {
    /// address of the owning function.
    pub function: VA,

    /// address of the indirect-jump instruction.
    pub instruction: VA,

    /// table base address.
    pub address: VA,

    /// base the table entries are offsets from, on architectures where
    /// entries are not absolute addresses.
    pub target_base: Option<VA>,

    /// element stride in bytes.
    pub scale: u8,

    /// largest legal index, when recovered.
    pub bound: Option<u64>,

    /// the expression the table is indexed with; diagnostic metadata.
    pub index_expr: Option<Expr>,

    /// the comparison mnemonic the bound was recovered from, for higher
    /// layers that want to reinterpret signedness.
    pub bound_mnemonic: Option<String>,

    /// every base candidate the table-base resolver observed (the first
    /// one is `address`); more than one element means the site was
    /// ambiguous. empty when the base came straight out of the target
    /// expression rather than the resolver.
    pub base_candidates: Vec<VA>,
}

impl JumpTableDescriptor {
    pub fn is_bound_known(&self) -> bool {
        self.bound.is_some()
    }

    /// number of valid entries: `bound + 1` when the bound is known.
    pub fn entries(&self) -> Option<u64> {
        self.bound.map(|b| b + 1)
    }
}

/// The module-wide search: accumulates descriptors per module, in function
/// order then block order.
pub struct JumpTableSearch {
    save_partial_info_tables: bool,
    tables: Vec<JumpTableDescriptor>,
}

impl JumpTableSearch {
    pub fn new(save_partial_info_tables: bool) -> JumpTableSearch {
        JumpTableSearch {
            save_partial_info_tables,
            tables: vec![],
        }
    }

    /// Analyze every function of the module, appending a descriptor for
    /// each recovered jump table. A failure is local to its function: the
    /// function yields no descriptor and analysis proceeds.
    pub fn detect(&mut self, module: &Module) -> Result<()> {
        for function in module.functions.iter() {
            let result = match module.arch {
                Arch::X64 => x64::detect_function(function, self.save_partial_info_tables, &mut self.tables),
                Arch::AArch64 => aarch64::detect_function(function, self.save_partial_info_tables, &mut self.tables),
            };
            if let Err(e) = result {
                warn!("jumptable: {:#x}: analysis failed: {:#}", function.address, e);
            }
        }
        Ok(())
    }

    pub fn descriptors(&self) -> &[JumpTableDescriptor] {
        &self.tables
    }
}
