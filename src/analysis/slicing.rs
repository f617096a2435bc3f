//! Backward slicer (the variable-length ISA engine).
//!
//! Started at an indirect jump, the slicer gathers the blocks that can
//! reach the jump and symbolically executes them toward it, building
//! fully-substituted expression trees: reading a register yields its
//! current tree, loads with no matching symbolic store yield the *address*
//! expression (which is the shape the PC-relative idiom pattern consumes),
//! and merge points introduce `MultipleParents`.
//!
//! Along the way it records a condition state for every conditional branch
//! with exactly one edge on a path to the jump: the flags tree at the
//! branch plus which edge (`jump_taken`) lies on that path.

use anyhow::{anyhow, Result};
use fnv::FnvHashMap;
use log::debug;
use smallvec::SmallVec;
use std::collections::BTreeMap;

use crate::{
    analysis::{
        cfg::{reaches, ControlFlowGraph, NodeId, SccOrder},
        tree::{TreeArena, TreeId},
    },
    insn::{Instruction, MemOperand, Operand, Semantic},
    module::Function,
    register::{x64, Reg, RegId},
};

/// the symbolic state snapshotted at an instruction of interest.
#[derive(Debug)]
pub struct SearchState<'a> {
    pub insn: &'a Instruction,
    pub node: NodeId,

    /// for condition states: does the taken edge lie on the path to the
    /// jump? meaningless on the initial state.
    pub jump_taken: bool,

    reg_trees: BTreeMap<RegId, TreeId>,
}

impl<'a> SearchState<'a> {
    pub fn reg_tree(&self, reg: RegId) -> Option<TreeId> {
        self.reg_trees.get(&reg).copied()
    }
}

#[derive(Default, Clone)]
struct SymbolicState {
    regs: BTreeMap<RegId, TreeId>,
    /// symbolic memory: (address tree, value tree), newest last.
    mems: Vec<(TreeId, TreeId)>,
}

pub struct SlicingSearch<'a> {
    arena:          TreeArena,
    initial_state:  Option<SearchState<'a>>,
    condition_list: Vec<SearchState<'a>>,
}

impl<'a> SlicingSearch<'a> {
    pub fn arena(&self) -> &TreeArena {
        &self.arena
    }

    /// the state at the indirect jump the slice was started from.
    pub fn initial_state(&self) -> Option<&SearchState<'a>> {
        self.initial_state.as_ref()
    }

    /// every comparison state that influences a branch on the path.
    pub fn conditions(&self) -> &[SearchState<'a>] {
        &self.condition_list
    }

    pub fn slice_at(function: &'a Function, cfg: &ControlFlowGraph, jump_node: NodeId) -> Result<SlicingSearch<'a>> {
        let jump_insn = function.blocks[cfg.get(jump_node).block].terminator()?;
        if !matches!(jump_insn.semantic, Semantic::IndirectJump { .. }) {
            return Err(anyhow!("slice target at {:#x} is not an indirect jump", jump_insn.address));
        }
        debug!("slicing: {:#x}: slice from indirect jump", jump_insn.address);

        // blocks that can reach the jump; predecessors of a member are
        // members, so merges never see an unknown edge.
        let mut region = vec![false; cfg.len()];
        let mut queue: Vec<NodeId> = vec![jump_node];
        region[jump_node] = true;
        while let Some(v) = queue.pop() {
            for &p in cfg.get(v).reverse_links.iter() {
                if !region[p] {
                    region[p] = true;
                    queue.push(p);
                }
            }
        }

        let mut search = SlicingSearch {
            arena:          TreeArena::new(),
            initial_state:  None,
            condition_list: vec![],
        };

        // execute region blocks toward the jump in condensed topological
        // order; blocks inside a cycle get a single pass.
        let order = SccOrder::new(cfg, 0);
        let mut exits: FnvHashMap<NodeId, SymbolicState> = Default::default();

        for component in order.get() {
            for &node in component.iter() {
                if !region[node] {
                    continue;
                }

                let preds: SmallVec<[SymbolicState; 2]> = cfg
                    .get(node)
                    .reverse_links
                    .iter()
                    .filter_map(|p| exits.get(p))
                    .cloned()
                    .collect();
                let preds_refs: SmallVec<[&SymbolicState; 2]> = preds.iter().collect();
                let mut state = search.merge(&preds_refs);

                let block = &function.blocks[cfg.get(node).block];
                for insn in block.instructions.iter() {
                    if insn.address == jump_insn.address {
                        search.initial_state = Some(SearchState {
                            insn,
                            node,
                            jump_taken: false,
                            reg_trees: state.regs.clone(),
                        });
                    }
                    search.apply(cfg, jump_node, node, insn, &mut state);
                }

                exits.insert(node, state);
            }
        }

        Ok(search)
    }

    fn merge(&mut self, preds: &[&SymbolicState]) -> SymbolicState {
        match preds {
            [] => Default::default(),
            [single] => (*single).clone(),
            _ => {
                let mut merged = SymbolicState::default();

                let mut regs: Vec<RegId> = preds.iter().flat_map(|p| p.regs.keys().copied()).collect();
                regs.sort_unstable();
                regs.dedup();

                for reg in regs {
                    let mut trees: SmallVec<[TreeId; 2]> = Default::default();
                    for p in preds.iter() {
                        if let Some(&t) = p.regs.get(&reg) {
                            if !trees.contains(&t) {
                                trees.push(t);
                            }
                        }
                    }
                    let tree = if trees.len() == 1 {
                        trees[0]
                    } else {
                        self.arena.multiple(trees)
                    };
                    merged.regs.insert(reg, tree);
                }

                // a symbolic store survives the merge only when every
                // incoming path agrees on it.
                for &(addr, value) in preds[0].mems.iter() {
                    if preds[1..].iter().all(|p| p.mems.contains(&(addr, value))) {
                        merged.mems.push((addr, value));
                    }
                }

                merged
            }
        }
    }

    fn read(&mut self, state: &SymbolicState, reg: Reg) -> TreeId {
        match state.regs.get(&reg.id) {
            Some(&t) => t,
            None => self.arena.reg(reg.id),
        }
    }

    /// the address computation of a memory operand, as a tree.
    fn address_expr(&mut self, state: &SymbolicState, mem: &MemOperand, next_addr: u64) -> TreeId {
        if let Some(base) = mem.base {
            if base.id == x64::RIP {
                let disp = self.arena.address(mem.disp as u64);
                let rip = self.arena.rip(next_addr);
                return self.arena.add(disp, rip);
            }
        }

        let base = mem.base.map(|b| self.read(state, b));
        let index = mem.index.map(|i| {
            let t = self.read(state, i);
            if mem.scale > 1 {
                let scale = self.arena.constant(mem.scale as i64);
                self.arena.mul(t, scale)
            } else {
                t
            }
        });

        let mut tree = match (base, index) {
            (Some(b), Some(i)) => self.arena.add(b, i),
            (Some(b), None) => b,
            (None, Some(i)) => i,
            (None, None) => return self.arena.constant(mem.disp),
        };
        if mem.disp != 0 {
            let disp = self.arena.constant(mem.disp);
            tree = self.arena.add(tree, disp);
        }
        tree
    }

    fn apply(
        &mut self,
        cfg: &ControlFlowGraph,
        jump_node: NodeId,
        node: NodeId,
        insn: &'a Instruction,
        state: &mut SymbolicState,
    ) {
        use Operand::*;

        let assembly = &insn.assembly;
        match &insn.semantic {
            Semantic::ControlFlowConditional { target, .. } => {
                // record the condition only when exactly one edge can lead
                // to the jump; otherwise it constrains nothing.
                let taken_reaches = cfg
                    .nodes()
                    .iter()
                    .find(|n| n.address == *target)
                    .map(|n| reaches(cfg, n.id, jump_node))
                    .unwrap_or(false);
                let fallthrough_reaches = cfg
                    .nodes()
                    .iter()
                    .find(|n| n.address == insn.next_address())
                    .map(|n| reaches(cfg, n.id, jump_node))
                    .unwrap_or(false);

                if taken_reaches != fallthrough_reaches {
                    self.condition_list.push(SearchState {
                        insn,
                        node,
                        jump_taken: taken_reaches,
                        reg_trees: state.regs.clone(),
                    });
                }
            }

            Semantic::Compare => {
                if let Some(tree) = match assembly.operands.as_slice() {
                    [Reg(a), Imm(v)] => {
                        let l = self.read(state, *a);
                        let r = self.arena.constant(*v);
                        Some(self.arena.compare(l, r))
                    }
                    [Reg(a), Reg(b)] => {
                        let l = self.read(state, *a);
                        let r = self.read(state, *b);
                        Some(self.arena.compare(l, r))
                    }
                    _ => None,
                } {
                    state.regs.insert(x64::EFLAGS, tree);
                }
            }

            Semantic::Move => match (assembly.mnemonic.as_str(), assembly.operands.as_slice()) {
                ("lea", [Reg(d), Mem(mem)]) => {
                    let t = self.address_expr(state, mem, insn.next_address());
                    state.regs.insert(d.id, t);
                }
                (_, [Reg(d), Imm(v)]) => {
                    let t = self.arena.constant(*v);
                    state.regs.insert(d.id, t);
                }
                (_, [Reg(d), Reg(s)]) => {
                    let t = self.read(state, *s);
                    state.regs.insert(d.id, t);
                }
                (_, [Reg(d), Mem(mem)]) => {
                    // a load: substitute a known symbolic store, otherwise
                    // the value is represented by its address expression.
                    let addr = self.address_expr(state, mem, insn.next_address());
                    let value = state
                        .mems
                        .iter()
                        .rev()
                        .find(|(a, _)| *a == addr)
                        .map(|(_, v)| *v)
                        .unwrap_or(addr);
                    state.regs.insert(d.id, value);
                }
                (_, [Mem(mem), Reg(s)]) => {
                    let addr = self.address_expr(state, mem, insn.next_address());
                    let value = self.read(state, *s);
                    state.mems.retain(|(a, _)| *a != addr);
                    state.mems.push((addr, value));
                }
                _ => {}
            },

            Semantic::Arithmetic => match (assembly.mnemonic.as_str(), assembly.operands.as_slice()) {
                ("add", [Reg(d), Reg(s)]) => {
                    let src = self.read(state, *s);
                    let dst = self.read(state, *d);
                    let t = self.arena.add(src, dst);
                    state.regs.insert(d.id, t);
                }
                ("add", [Reg(d), Imm(v)]) => {
                    let dst = self.read(state, *d);
                    let imm = self.arena.constant(*v);
                    let t = self.arena.add(dst, imm);
                    state.regs.insert(d.id, t);
                }
                ("shl", [Reg(d), Imm(v)]) => {
                    let dst = self.read(state, *d);
                    let imm = self.arena.constant(*v);
                    let t = self.arena.shl(dst, imm);
                    state.regs.insert(d.id, t);
                }
                (_, [Reg(d), ..]) => {
                    // unmodeled: the destination becomes opaque.
                    let t = self.arena.reg(d.id);
                    state.regs.insert(d.id, t);
                }
                _ => {}
            },

            Semantic::DirectBranch { .. } | Semantic::IndirectJump { .. } => {}

            _ => {
                // unmodeled: clobber a register destination, if any.
                if let Some(Reg(d)) = assembly.operands.first() {
                    let t = self.arena.reg(d.id);
                    state.regs.insert(d.id, t);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::tree::TreeNode,
        register::x64::*,
        test::*,
    };

    #[test]
    fn lea_rip_builds_address_plus_rip() {
        let mut f = FunctionBuilder::x64(0x1000);
        f.block(|b| {
            b.lea_rip(r(RDX), 0x2000); // 7 bytes
            b.jmp_reg(r(RDX));
        });
        let f = f.build();
        let cfg = ControlFlowGraph::new(&f).unwrap();
        let search = SlicingSearch::slice_at(&f, &cfg, 0).unwrap();

        let state = search.initial_state().unwrap();
        let tree = state.reg_tree(RDX).unwrap();
        match search.arena().get(tree) {
            TreeNode::Addition(l, r) => {
                assert!(matches!(search.arena().get(*l), TreeNode::Address(0x2000)));
                // rip value is the next instruction
                assert!(matches!(search.arena().get(*r), TreeNode::RegisterRip(0x1007)));
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn loads_substitute_known_stores() {
        let mut f = FunctionBuilder::x64(0x1000);
        f.block(|b| {
            b.mov_imm(r(RAX), 0x42);
            b.mov_store(r(RBP), -8, r(RAX));
            b.mov_load(r(RCX), r(RBP), -8);
            b.jmp_reg(r(RCX));
        });
        let f = f.build();
        let cfg = ControlFlowGraph::new(&f).unwrap();
        let search = SlicingSearch::slice_at(&f, &cfg, 0).unwrap();

        let state = search.initial_state().unwrap();
        let tree = state.reg_tree(RCX).unwrap();
        assert!(matches!(search.arena().get(tree), TreeNode::Constant(0x42)));
    }

    #[test]
    fn conditions_record_the_edge_toward_the_jump() {
        let mut f = FunctionBuilder::x64(0x1000);
        f.block(|b| {
            b.cmp_imm(e(RDI), 7); // 3 bytes
            b.jcc("ja", 0x100a); // 2 bytes
        });
        f.block_at(0x1005, |b| {
            b.jmp_reg(r(RAX)); // 2 bytes
        });
        f.block_at(0x100a, |b| {
            b.ret();
        });
        let f = f.build();
        let cfg = ControlFlowGraph::new(&f).unwrap();
        let search = SlicingSearch::slice_at(&f, &cfg, 1).unwrap();

        assert_eq!(search.conditions().len(), 1);
        let cond = &search.conditions()[0];
        // the fallthrough edge leads to the jump
        assert!(!cond.jump_taken);
        let flags = cond.reg_tree(EFLAGS).unwrap();
        assert!(matches!(search.arena().get(flags), TreeNode::Comparison(..)));
    }

    #[test]
    fn merge_disagreement_introduces_multiple_parents() {
        let mut f = FunctionBuilder::x64(0x1000);
        f.block(|b| {
            b.cmp_imm(e(RDI), 1); // 0x1000, 3 bytes
            b.jcc("je", 0x100f); // 0x1003, 2 bytes
        });
        f.block_at(0x1005, |b| {
            b.mov_imm(r(RAX), 1); // 0x1005, 5 bytes
            b.jmp(0x1014); // 0x100a, 5 bytes
        });
        f.block_at(0x100f, |b| {
            b.mov_imm(r(RAX), 2); // 0x100f, 5 bytes
        });
        f.block_at(0x1014, |b| {
            b.jmp_reg(r(RAX));
        });
        let f = f.build();
        let cfg = ControlFlowGraph::new(&f).unwrap();
        let search = SlicingSearch::slice_at(&f, &cfg, 3).unwrap();

        let state = search.initial_state().unwrap();
        let tree = state.reg_tree(RAX).unwrap();
        assert!(matches!(search.arena().get(tree), TreeNode::MultipleParents(ps) if ps.len() == 2));
    }
}
