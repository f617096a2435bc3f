//! Whole-function use-def analysis (the fixed-width ISA engine).
//!
//! Runs once per function, iterating blocks in condensed SCC order and
//! repeating the blocks of a component until the reaching-definition sets
//! fixpoint. Each instruction gets a state holding:
//!
//!   - `reg_def`  — a shallow symbolic tree per register this instruction
//!                  defines (operands appear as `PhysicalRegister` leaves;
//!                  chaining is carried by the edges, not by substitution),
//!   - `reg_ref`  — for each register read here, the states whose
//!                  definition may reach this read,
//!   - `reg_use`  — for each register defined here, the states that may
//!                  read that definition,
//!   - `mem_def`  — for each register stored here, the symbolic address
//!                  of the store,
//!   - `mem_ref`  — for each register loaded here, the store states whose
//!                  memory definition may be the loaded value.
//!
//! `search_up_def` / `search_down_def` are the navigation primitives the
//! jump-table detector drives over these edges.

use std::collections::BTreeMap;

use anyhow::Result;
use fnv::FnvHashMap;
use log::debug;
use smallvec::SmallVec;

use crate::{
    analysis::{
        cfg::{ControlFlowGraph, NodeId, SccOrder},
        pattern::{match_tree, Pattern, TreeCapture},
        tree::{TreeArena, TreeId, TreeNode},
    },
    insn::{Instruction, MemOperand, Operand, OperandsMode, Semantic},
    module::Function,
    register::{aarch64, Reg, RegId},
};

pub type StateId = usize;

const NO_STATES: &[StateId] = &[];

#[derive(Debug)]
pub struct UseDefState<'a> {
    pub insn: &'a Instruction,
    pub node: NodeId,

    reg_def: BTreeMap<RegId, TreeId>,
    reg_ref: BTreeMap<RegId, SmallVec<[StateId; 2]>>,
    reg_use: BTreeMap<RegId, SmallVec<[StateId; 2]>>,
    mem_def: BTreeMap<RegId, TreeId>,
    mem_ref: BTreeMap<RegId, SmallVec<[StateId; 2]>>,
}

impl<'a> UseDefState<'a> {
    pub fn reg_def(&self, reg: RegId) -> Option<TreeId> {
        self.reg_def.get(&reg).copied()
    }

    pub fn reg_defs(&self) -> impl Iterator<Item = (RegId, TreeId)> + '_ {
        self.reg_def.iter().map(|(&r, &t)| (r, t))
    }

    pub fn reg_ref(&self, reg: RegId) -> &[StateId] {
        self.reg_ref.get(&reg).map(|v| v.as_slice()).unwrap_or(NO_STATES)
    }

    pub fn reg_use(&self, reg: RegId) -> &[StateId] {
        self.reg_use.get(&reg).map(|v| v.as_slice()).unwrap_or(NO_STATES)
    }

    pub fn mem_defs(&self) -> impl Iterator<Item = (RegId, TreeId)> + '_ {
        self.mem_def.iter().map(|(&r, &t)| (r, t))
    }

    pub fn mem_ref(&self, reg: RegId) -> &[StateId] {
        self.mem_ref.get(&reg).map(|v| v.as_slice()).unwrap_or(NO_STATES)
    }
}

pub struct UseDefMap<'a> {
    arena:      TreeArena,
    states:     Vec<UseDefState<'a>>,
    by_address: FnvHashMap<u64, StateId>,
    node_range: Vec<std::ops::Range<StateId>>,
}

impl<'a> UseDefMap<'a> {
    pub fn arena(&self) -> &TreeArena {
        &self.arena
    }

    pub fn state(&self, id: StateId) -> &UseDefState<'a> {
        &self.states[id]
    }

    pub fn state_at(&self, va: u64) -> Option<StateId> {
        self.by_address.get(&va).copied()
    }

    /// the state of a node's terminator instruction.
    pub fn terminator_state(&self, node: NodeId) -> Option<StateId> {
        self.node_range.get(node).and_then(|range| range.clone().last())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// the per-instruction dataflow effect, computed once up front.
#[derive(Default)]
struct Effect {
    uses:   SmallVec<[RegId; 4]>,
    defs:   SmallVec<[(RegId, TreeId); 2]>,
    stores: SmallVec<[(RegId, TreeId); 2]>,
    /// registers whose defined value is loaded from memory.
    loads:  SmallVec<[RegId; 2]>,
}

impl Effect {
    fn use_reg(&mut self, r: Reg) {
        if r.id != aarch64::XZR && !self.uses.contains(&r.id) {
            self.uses.push(r.id);
        }
    }

    fn def_reg(&mut self, r: Reg, tree: TreeId) {
        // writes to the zero register are discarded.
        if r.id != aarch64::XZR {
            self.defs.push((r.id, tree));
        }
    }
}

/// symbolic value of a register read; the zero register reads as zero.
fn reg_leaf(arena: &mut TreeArena, r: Reg) -> TreeId {
    if r.id == aarch64::XZR {
        arena.constant(0)
    } else {
        arena.reg(r.id)
    }
}

/// symbolic address of a memory operand.
fn mem_address_tree(arena: &mut TreeArena, mem: &MemOperand) -> TreeId {
    match (mem.base, mem.index) {
        (Some(base), Some(index)) => {
            let b = reg_leaf(arena, base);
            let i = reg_leaf(arena, index);
            if mem.shift > 0 {
                let k = arena.constant(mem.shift as i64);
                let shifted = arena.shl(i, k);
                arena.add(b, shifted)
            } else {
                arena.add(b, i)
            }
        }
        (Some(base), None) => {
            let b = reg_leaf(arena, base);
            let d = arena.constant(mem.disp);
            arena.add(b, d)
        }
        (None, _) => arena.constant(mem.disp),
    }
}

fn mem_operand_uses(effect: &mut Effect, mem: &MemOperand) {
    if let Some(base) = mem.base {
        effect.use_reg(base);
    }
    if let Some(index) = mem.index {
        effect.use_reg(index);
    }
}

/// writeback of the base register for post/pre-indexed addressing.
fn writeback(arena: &mut TreeArena, effect: &mut Effect, base: Reg, amount: i64) {
    let b = reg_leaf(arena, base);
    let d = arena.constant(amount);
    let t = arena.add(b, d);
    effect.def_reg(base, t);
}

/// everything the instruction reads and writes, as shallow trees.
fn compute_effect(arena: &mut TreeArena, insn: &Instruction) -> Effect {
    use Operand::*;

    let mut effect = Effect::default();
    let asm = &insn.assembly;
    let mnemonic = asm.mnemonic.as_str();

    match &insn.semantic {
        Semantic::IndirectJump { register } => {
            effect.use_reg(*register);
            return effect;
        }
        Semantic::DirectBranch { .. } => return effect,
        Semantic::ControlFlowConditional { .. } => {
            match (mnemonic, asm.operands.as_slice()) {
                // compare-and-branch: no separate compare definition exists,
                // so the branch itself defines the one-time flags slot.
                ("cbz", [Reg(r), ..]) | ("cbnz", [Reg(r), ..]) => {
                    effect.use_reg(*r);
                    let l = reg_leaf(arena, *r);
                    let zero = arena.constant(0);
                    let t = arena.compare(l, zero);
                    effect.defs.push((aarch64::ONETIME_NZCV, t));
                }
                ("tbz", [Reg(r), ..]) | ("tbnz", [Reg(r), ..]) => {
                    effect.use_reg(*r);
                }
                // b.cond consumes the persistent flags.
                _ => {
                    if !effect.uses.contains(&aarch64::NZCV) {
                        effect.uses.push(aarch64::NZCV);
                    }
                }
            }
            return effect;
        }
        _ => {}
    }

    match (mnemonic, asm.operands.as_slice()) {
        ("adrp", [Reg(d), Imm(page)]) | ("adr", [Reg(d), Imm(page)]) => {
            let t = arena.address(*page as u64);
            effect.def_reg(*d, t);
        }

        ("mov", [Reg(d), Imm(v)]) => {
            let t = arena.constant(*v);
            effect.def_reg(*d, t);
        }
        ("mov", [Reg(d), Reg(s)]) | ("sxtw", [Reg(d), Reg(s)]) | ("uxtw", [Reg(d), Reg(s)]) => {
            effect.use_reg(*s);
            let t = reg_leaf(arena, *s);
            effect.def_reg(*d, t);
        }
        ("movz", [Reg(d), Imm(v)]) => {
            let t = arena.constant(*v);
            effect.def_reg(*d, t);
        }

        ("add", [Reg(d), Reg(n), Imm(v)]) => {
            effect.use_reg(*n);
            let l = reg_leaf(arena, *n);
            let r = arena.constant(*v);
            let t = arena.add(l, r);
            effect.def_reg(*d, t);
        }
        ("add", [Reg(d), Reg(n), Reg(m)]) => {
            effect.use_reg(*n);
            effect.use_reg(*m);
            let l = reg_leaf(arena, *n);
            let r = reg_leaf(arena, *m);
            let t = arena.add(l, r);
            effect.def_reg(*d, t);
        }
        // add with a shifted/extended register, e.g. `add x2, x1, x0, lsl #2`
        ("add", [Reg(d), Reg(n), Reg(m), Imm(k)]) => {
            effect.use_reg(*n);
            effect.use_reg(*m);
            let l = reg_leaf(arena, *n);
            let i = reg_leaf(arena, *m);
            let k = arena.constant(*k);
            let shifted = arena.shl(i, k);
            let t = arena.add(l, shifted);
            effect.def_reg(*d, t);
        }
        ("sub", [Reg(d), Reg(n), Imm(v)]) => {
            effect.use_reg(*n);
            let l = reg_leaf(arena, *n);
            let r = arena.constant(-*v);
            let t = arena.add(l, r);
            effect.def_reg(*d, t);
        }

        ("lsl", [Reg(d), Reg(n), Imm(k)]) => {
            effect.use_reg(*n);
            let l = reg_leaf(arena, *n);
            let r = arena.constant(*k);
            let t = arena.shl(l, r);
            effect.def_reg(*d, t);
        }
        ("lsl", [Reg(d), Reg(n), Reg(m)]) => {
            effect.use_reg(*n);
            effect.use_reg(*m);
            let l = reg_leaf(arena, *n);
            let r = reg_leaf(arena, *m);
            let t = arena.shl(l, r);
            effect.def_reg(*d, t);
        }
        ("mul", [Reg(d), Reg(n), Reg(m)]) => {
            effect.use_reg(*n);
            effect.use_reg(*m);
            let l = reg_leaf(arena, *n);
            let r = reg_leaf(arena, *m);
            let t = arena.mul(l, r);
            effect.def_reg(*d, t);
        }

        ("cmp", [Reg(n), Imm(v)]) => {
            effect.use_reg(*n);
            let l = reg_leaf(arena, *n);
            let r = arena.constant(*v);
            let t = arena.compare(l, r);
            effect.defs.push((aarch64::NZCV, t));
        }
        ("cmp", [Reg(n), Reg(m)]) => {
            effect.use_reg(*n);
            effect.use_reg(*m);
            let l = reg_leaf(arena, *n);
            let r = reg_leaf(arena, *m);
            let t = arena.compare(l, r);
            effect.defs.push((aarch64::NZCV, t));
        }
        ("cmn", [Reg(n), Imm(v)]) => {
            effect.use_reg(*n);
            let l = reg_leaf(arena, *n);
            let r = arena.constant(-*v);
            let t = arena.compare(l, r);
            effect.defs.push((aarch64::NZCV, t));
        }

        ("ret", _) => {
            effect.use_reg(aarch64::x(aarch64::X30));
        }

        _ if insn.semantic == Semantic::Memory => {
            compute_memory_effect(arena, insn, &mut effect);
        }

        _ => {
            // unmodeled: the destination becomes opaque, sources are used.
            let mut operands = asm.operands.iter();
            if let Some(Reg(d)) = operands.next() {
                let t = reg_leaf(arena, *d);
                effect.def_reg(*d, t);
            }
            for op in operands {
                match op {
                    Reg(r) => effect.use_reg(*r),
                    Mem(m) => mem_operand_uses(&mut effect, m),
                    Imm(_) => {}
                }
            }
        }
    }

    effect
}

fn compute_memory_effect(arena: &mut TreeArena, insn: &Instruction, effect: &mut Effect) {
    let asm = &insn.assembly;
    let is_store = asm.mnemonic.starts_with("st");
    let width = insn.access_width();

    match asm.mode() {
        OperandsMode::RegMem | OperandsMode::RegMemImm => {
            let (r0, mem, wb) = match asm.operands.as_slice() {
                [Operand::Reg(r0), Operand::Mem(mem)] => (*r0, *mem, None),
                [Operand::Reg(r0), Operand::Mem(mem), Operand::Imm(v)] => (*r0, *mem, Some(*v)),
                _ => return,
            };
            mem_operand_uses(effect, &mem);

            if is_store {
                effect.use_reg(r0);
                let addr = mem_address_tree(arena, &mem);
                effect.stores.push((r0.id, addr));
            } else {
                let addr = mem_address_tree(arena, &mem);
                let t = arena.deref(addr, width);
                effect.def_reg(r0, t);
                effect.loads.push(r0.id);
            }

            if let Some(base) = mem.base {
                if insn.is_post_index() {
                    writeback(arena, effect, base, wb.unwrap_or(0));
                } else if insn.is_pre_index() {
                    writeback(arena, effect, base, mem.disp);
                }
            }
        }

        OperandsMode::RegRegMem | OperandsMode::RegRegMemImm => {
            // load/store pair: the second slot sits one access width above.
            let (r0, r1, mem, wb) = match asm.operands.as_slice() {
                [Operand::Reg(r0), Operand::Reg(r1), Operand::Mem(mem)] => (*r0, *r1, *mem, None),
                [Operand::Reg(r0), Operand::Reg(r1), Operand::Mem(mem), Operand::Imm(v)] => (*r0, *r1, *mem, Some(*v)),
                _ => return,
            };
            mem_operand_uses(effect, &mem);

            let lo = MemOperand {
                disp: mem.disp,
                ..mem
            };
            let hi = MemOperand {
                disp: mem.disp + width as i64,
                ..mem
            };

            if is_store {
                effect.use_reg(r0);
                effect.use_reg(r1);
                let a0 = mem_address_tree(arena, &lo);
                let a1 = mem_address_tree(arena, &hi);
                effect.stores.push((r0.id, a0));
                effect.stores.push((r1.id, a1));
            } else {
                let a0 = mem_address_tree(arena, &lo);
                let t0 = arena.deref(a0, width);
                let a1 = mem_address_tree(arena, &hi);
                let t1 = arena.deref(a1, width);
                effect.def_reg(r0, t0);
                effect.def_reg(r1, t1);
                effect.loads.push(r0.id);
                effect.loads.push(r1.id);
            }

            if let Some(base) = mem.base {
                if insn.is_post_index() {
                    writeback(arena, effect, base, wb.unwrap_or(0));
                } else if insn.is_pre_index() {
                    writeback(arena, effect, base, mem.disp);
                }
            }
        }

        _ => {}
    }
}

type RegReach = BTreeMap<RegId, SmallVec<[StateId; 2]>>;

#[derive(Default, Clone, PartialEq)]
struct Reach {
    regs: RegReach,
    mem:  Vec<StateId>,
}

fn merge_reach<'r>(preds: impl Iterator<Item = &'r Reach>) -> Reach {
    let mut merged = Reach::default();
    for pred in preds {
        for (&reg, defs) in pred.regs.iter() {
            let entry = merged.regs.entry(reg).or_default();
            for &d in defs.iter() {
                if !entry.contains(&d) {
                    entry.push(d);
                }
            }
        }
        for &s in pred.mem.iter() {
            if !merged.mem.contains(&s) {
                merged.mem.push(s);
            }
        }
    }
    for defs in merged.regs.values_mut() {
        defs.sort_unstable();
    }
    merged.mem.sort_unstable();
    merged
}

/// Run the use-def analysis over a function.
pub fn analyze<'a>(function: &'a Function, cfg: &ControlFlowGraph) -> Result<UseDefMap<'a>> {
    let mut arena = TreeArena::new();

    let mut states: Vec<UseDefState<'a>> = vec![];
    let mut by_address: FnvHashMap<u64, StateId> = Default::default();
    let mut node_range: Vec<std::ops::Range<StateId>> = vec![];

    for (node, block) in function.blocks.iter().enumerate() {
        let start = states.len();
        for insn in block.instructions.iter() {
            by_address.insert(insn.address, states.len());
            states.push(UseDefState {
                insn,
                node,
                reg_def: Default::default(),
                reg_ref: Default::default(),
                reg_use: Default::default(),
                mem_def: Default::default(),
                mem_ref: Default::default(),
            });
        }
        node_range.push(start..states.len());
    }

    let effects: Vec<Effect> = states
        .iter()
        .map(|s| compute_effect(&mut arena, s.insn))
        .collect();

    // definitions are flow-insensitive; set them up front.
    for (sid, effect) in effects.iter().enumerate() {
        for &(reg, tree) in effect.defs.iter() {
            states[sid].reg_def.insert(reg, tree);
        }
        for &(reg, addr) in effect.stores.iter() {
            states[sid].mem_def.insert(reg, addr);
        }
    }

    let order = SccOrder::new(cfg, 0);
    let mut exits: Vec<Option<Reach>> = vec![None; cfg.len()];

    for component in order.get() {
        // repeat the component until nothing changes; a singleton without a
        // self-loop converges in one pass.
        let limit = component.len() + 1;
        for _ in 0..limit {
            let mut changed = false;

            for &node in component.iter() {
                let entry = merge_reach(
                    cfg.get(node)
                        .reverse_links
                        .iter()
                        .filter_map(|&p| exits[p].as_ref()),
                );

                let mut current = entry;
                for sid in node_range[node].clone() {
                    let effect = &effects[sid];

                    for &u in effect.uses.iter() {
                        let reaching: SmallVec<[StateId; 2]> =
                            current.regs.get(&u).cloned().unwrap_or_default();
                        for &d in reaching.iter() {
                            let refs = states[sid].reg_ref.entry(u).or_default();
                            if !refs.contains(&d) {
                                refs.push(d);
                            }
                            let uses = states[d].reg_use.entry(u).or_default();
                            if !uses.contains(&sid) {
                                uses.push(sid);
                            }
                        }
                    }

                    for &dst in effect.loads.iter() {
                        let refs = states[sid].mem_ref.entry(dst).or_default();
                        for &store in current.mem.iter() {
                            if !refs.contains(&store) {
                                refs.push(store);
                            }
                        }
                    }

                    for &(reg, _) in effect.defs.iter() {
                        current.regs.insert(reg, SmallVec::from_slice(&[sid]));
                    }

                    if !effect.stores.is_empty() && !current.mem.contains(&sid) {
                        current.mem.push(sid);
                        current.mem.sort_unstable();
                    }
                }

                if exits[node].as_ref() != Some(&current) {
                    exits[node] = Some(current);
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    debug!(
        "usedef: {:#x}: {} states analyzed",
        function.address,
        states.len()
    );

    Ok(UseDefMap {
        arena,
        states,
        by_address,
        node_range,
    })
}

/// From `state`, visit the definitions reaching the read of `reg`; at each
/// definition site, try the pattern against the defined tree and hand
/// matches to `action`. Stops when `action` returns true.
///
/// The reaching sets already see through merges, so every definition on
/// every incoming path is offered exactly once. Walking further up (past a
/// definition) is the caller's business; the base-address and bound parsers
/// recurse explicitly where the idiom calls for it.
pub fn search_up_def<F>(map: &UseDefMap, state: StateId, reg: RegId, pattern: &Pattern, mut action: F)
where
    F: FnMut(StateId, &TreeCapture) -> bool,
{
    for &s in map.state(state).reg_ref(reg) {
        if let Some(def) = map.state(s).reg_def(reg) {
            if let Some(capture) = match_tree(map.arena(), pattern, def) {
                if action(s, &capture) {
                    return;
                }
            }
        }
    }
}

/// From a definition site of `reg`, visit the states that read it and try
/// the pattern against every register those states define. `action`
/// receives the using state and the register whose definition matched.
pub fn search_down_def<F>(map: &UseDefMap, state: StateId, reg: RegId, pattern: &Pattern, mut action: F)
where
    F: FnMut(StateId, RegId, &TreeCapture) -> bool,
{
    for &u in map.state(state).reg_use(reg) {
        for (def_reg, def_tree) in map.state(u).reg_defs() {
            if let Some(capture) = match_tree(map.arena(), pattern, def_tree) {
                if action(u, def_reg, &capture) {
                    return;
                }
            }
        }
    }
}

/// A normalized memory location: base register plus constant offset.
/// Locations that do not fit this shape are not comparable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemLocation {
    pub base:   RegId,
    pub offset: i64,
}

impl MemLocation {
    pub fn parse(arena: &TreeArena, tree: TreeId) -> Option<MemLocation> {
        match arena.get(tree) {
            TreeNode::PhysicalRegister(r) => Some(MemLocation { base: *r, offset: 0 }),
            TreeNode::Addition(l, r) => match (arena.get(*l), arena.get(*r)) {
                (TreeNode::PhysicalRegister(base), TreeNode::Constant(offset)) => Some(MemLocation {
                    base:   *base,
                    offset: *offset,
                }),
                _ => None,
            },
            _ => None,
        }
    }
}
