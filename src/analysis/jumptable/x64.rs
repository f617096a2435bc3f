//! Jump table discovery on x64, driven by the backward slicer.
//!
//! Compilers emit a tight PC-relative idiom here:
//!
//! ```text
//!   lea   rdx, [rip + table]
//!   movsxd rax, dword ptr [rdx + rcx*4]
//!   add   rax, rdx
//!   jmp   rax
//! ```
//!
//! so the jump target tree has the shape
//! `(lea) + ((lea) + (index * 4))`, the inner lea is the table base, and
//! the bound comes from a compare-and-conditional-branch guarding the
//! default case.

use anyhow::Result;
use lazy_static::lazy_static;
use log::{debug, warn};

use crate::{
    analysis::{
        cfg::ControlFlowGraph,
        jumptable::JumpTableDescriptor,
        pattern::{match_tree, Pattern},
        slicing::SlicingSearch,
        tree::{TreeId, TreeNode},
        AnalysisError,
    },
    insn::Semantic,
    module::Function,
    register::x64::EFLAGS,
    util::i64_u64,
    VA,
};

lazy_static! {
    /// `(addr + rip) + ((addr + rip) + (index * 4))`, capturing the inner
    /// lea (the table base) and the index expression.
    static ref PCREL_TARGET_FORM: Pattern = Pattern::addition(
        Pattern::addition(Pattern::address(), Pattern::register_rip()),
        Pattern::addition(
            Pattern::capture(Pattern::addition(Pattern::address(), Pattern::register_rip())),
            Pattern::multiplication(Pattern::capture(Pattern::any()), Pattern::constant_is(4)),
        ),
    );
}

/// the operator a conditional-branch mnemonic expresses over a comparison.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CmpOp {
    Lt,
    Le,
    Ne,
    Eq,
    Ge,
    Gt,
}

impl CmpOp {
    /// logical negation: the fall-through edge expresses this.
    fn negate(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ge => CmpOp::Lt,
            CmpOp::Gt => CmpOp::Le,
        }
    }

    /// operand swap: `c < x` reads as `x > c`.
    fn mirror(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ge => CmpOp::Le,
            CmpOp::Gt => CmpOp::Lt,
        }
    }
}

fn operator_for(mnemonic: &str) -> Result<Option<CmpOp>, AnalysisError> {
    Ok(Some(match mnemonic {
        "ja" => CmpOp::Gt,
        "jae" => CmpOp::Ge,
        "jb" => CmpOp::Lt,
        "jbe" => CmpOp::Le,
        "jne" => CmpOp::Ne,
        "je" => CmpOp::Eq,
        "jg" => CmpOp::Gt,
        "jge" => CmpOp::Ge,
        "jl" => CmpOp::Lt,
        "jle" => CmpOp::Le,
        // sign checks do not express a bound; abandon the whole search.
        "js" => return Ok(None),
        other => return Err(AnalysisError::UnknownMnemonic(other.to_string())),
    }))
}

pub fn detect_function(
    function: &Function,
    save_partial_info_tables: bool,
    tables: &mut Vec<JumpTableDescriptor>,
) -> Result<()> {
    if !function.contains_indirect_jump() {
        return Ok(());
    }

    let cfg = ControlFlowGraph::new(function)?;

    for node in 0..cfg.len() {
        let block = &function.blocks[cfg.get(node).block];
        let terminator = block.terminator()?;
        let register = match &terminator.semantic {
            Semantic::IndirectJump { register } => *register,
            _ => continue,
        };

        debug!("jumptable: {:#x}: indirect jump", terminator.address);
        let search = SlicingSearch::slice_at(function, &cfg, node)?;

        let state = match search.initial_state() {
            Some(state) => state,
            None => continue,
        };
        let tree = match state.reg_tree(register.id) {
            Some(tree) => tree,
            None => continue,
        };
        if matches!(search.arena().get(tree), TreeNode::MultipleParents(_)) {
            warn!(
                "jumptable: {:#x}: not yet implemented: merged jump target",
                terminator.address
            );
            continue;
        }

        let (address, index_expr) = match match_jump_table(&search, tree) {
            Some(found) => found,
            None => continue,
        };
        debug!(
            "jumptable: {:#x}: table at {:#x}, indexed by {}",
            terminator.address,
            address,
            search.arena().display(index_expr)
        );

        let bound = match match_jump_table_bounds(&search, index_expr) {
            Ok(bound) => bound,
            Err(e) => {
                // fatal to this slice only.
                warn!("jumptable: {:#x}: {}", terminator.address, e);
                continue;
            }
        };

        if bound.is_some() || save_partial_info_tables {
            let (bound, bound_mnemonic) = match bound {
                Some((b, mnemonic)) => (Some(b), Some(mnemonic)),
                None => (None, None),
            };
            tables.push(JumpTableDescriptor {
                function: function.address,
                instruction: terminator.address,
                address,
                target_base: None,
                scale: 4,
                bound,
                index_expr: Some(search.arena().export(index_expr)),
                bound_mnemonic,
                base_candidates: vec![],
            });
        }
    }

    Ok(())
}

/// Match the PC-relative table idiom against the jump target tree,
/// yielding the table base address and the index expression.
fn match_jump_table(search: &SlicingSearch, tree: TreeId) -> Option<(VA, TreeId)> {
    let capture = match_tree(search.arena(), &PCREL_TARGET_FORM, tree)?;

    let base = match search.arena().get(capture.get(0)) {
        TreeNode::Addition(l, r) => match (search.arena().get(*l), search.arena().get(*r)) {
            (TreeNode::Address(addr), TreeNode::RegisterRip(rip)) => addr.wrapping_add(*rip),
            _ => return None,
        },
        _ => return None,
    };

    Some((base, capture.get(1)))
}

/// Recover the bound from the comparison states collected along the slice.
///
/// Returns the bound and the mnemonic it came from. The bound is the
/// comparison constant regardless of the mnemonic's signedness; recording
/// the mnemonic lets higher layers reinterpret.
fn match_jump_table_bounds(
    search: &SlicingSearch,
    index_expr: TreeId,
) -> Result<Option<(u64, String)>, AnalysisError> {
    for state in search.conditions() {
        let flags = match state.reg_tree(EFLAGS) {
            Some(flags) => flags,
            None => continue,
        };
        let (left, right) = match search.arena().get(flags) {
            TreeNode::Comparison(l, r) => (*l, *r),
            _ => continue,
        };

        let left_const = matches!(search.arena().get(left), TreeNode::Constant(_));
        let right_value = match search.arena().get(right) {
            TreeNode::Constant(v) => Some(*v),
            _ => None,
        };
        if !left_const && right_value.is_none() {
            continue;
        }

        let mnemonic = match &state.insn.semantic {
            Semantic::ControlFlowConditional { mnemonic, .. } => mnemonic.clone(),
            _ => continue,
        };
        let mut op = match operator_for(&mnemonic)? {
            Some(op) => op,
            None => return Ok(None),
        };

        // normalize the constant onto the right-hand side.
        let (value_side, bound) = if let Some(v) = right_value {
            (left, v)
        } else {
            let v = match search.arena().get(left) {
                TreeNode::Constant(v) => *v,
                _ => continue,
            };
            op = op.mirror();
            (right, v)
        };

        // the fall-through edge expresses the negation.
        if !state.jump_taken {
            op = op.negate();
        }

        debug!(
            "jumptable: {:#x}: comparison of {} against {} ({:?})",
            state.insn.address,
            search.arena().display(value_side),
            bound,
            op
        );

        if value_side == index_expr && (op == CmpOp::Le || op == CmpOp::Lt) {
            let mut bound = i64_u64(bound);
            if op == CmpOp::Lt {
                // convert "<" to "<="
                bound = bound.wrapping_sub(1);
            }
            debug!("jumptable: {:#x}: bounds check found: <= {}", state.insn.address, bound);
            return Ok(Some((bound, mnemonic)));
        }
    }

    Ok(None)
}
