//! Jump table discovery on AArch64, driven by the use-def analysis.
//!
//! Table entries here are 4-byte offsets from a target base, loaded and
//! added to that base before the `br`:
//!
//! ```text
//!   adrp x1, table_page
//!   add  x1, x1, #table_off
//!   ldr  w2, [x1, w0, uxtw #2]
//!   adr  x3, target_base
//!   add  x2, x3, x2
//!   br   x2
//! ```
//!
//! The detector matches the jump target form, resolves the table base
//! through address literals, page+offset computations, and stack
//! save/reload chains, then recovers the bound from whichever
//! compare-and-branch shape the compiler emitted.

use anyhow::Result;
use lazy_static::lazy_static;
use log::{debug, warn};
use smallvec::SmallVec;

use crate::{
    analysis::{
        cfg::{reverse_reverse_postorder, ControlFlowGraph, NodeId},
        jumptable::JumpTableDescriptor,
        pattern::{match_tree, Pattern, TreeCapture},
        tree::TreeNode,
        usedef::{self, search_down_def, search_up_def, MemLocation, StateId, UseDefMap},
    },
    insn::{Instruction, Semantic},
    module::Function,
    register::{
        aarch64::{NZCV, ONETIME_NZCV},
        RegId,
    },
    util::i64_u64,
    VA,
};

/// recursion guard for the base/bound resolvers; compiler idioms are
/// shallow, anything deeper is a cycle.
const MAX_DEPTH: usize = 32;

lazy_static! {
    /// `base + entry`
    static ref JUMP_TARGET_FORM_1: Pattern = Pattern::addition(
        Pattern::capture(Pattern::physical_register()),
        Pattern::capture(Pattern::physical_register()),
    );

    /// `base + (entry << k)`
    static ref JUMP_TARGET_FORM_2: Pattern = Pattern::addition(
        Pattern::capture(Pattern::physical_register()),
        Pattern::logical_shift_left(
            Pattern::capture(Pattern::physical_register()),
            Pattern::capture(Pattern::constant()),
        ),
    );

    /// `*(base + index)`
    static ref TABLE_ACCESS_FORM_1: Pattern = Pattern::capture(Pattern::dereference(Pattern::addition(
        Pattern::capture(Pattern::physical_register()),
        Pattern::capture(Pattern::physical_register()),
    )));

    /// `*(base + (index << k))`
    static ref TABLE_ACCESS_FORM_2: Pattern = Pattern::capture(Pattern::dereference(Pattern::addition(
        Pattern::capture(Pattern::physical_register()),
        Pattern::logical_shift_left(
            Pattern::capture(Pattern::physical_register()),
            Pattern::capture(Pattern::constant()),
        ),
    )));

    /// an address literal.
    static ref BASE_ADDRESS_FORM: Pattern = Pattern::capture(Pattern::address());

    /// `page + offset`
    static ref COMPUTED_ADDRESS_FORM: Pattern = Pattern::addition(
        Pattern::capture(Pattern::physical_register()),
        Pattern::capture(Pattern::constant()),
    );

    /// a reload of a previously saved base: `*(reg + disp)`
    static ref SAVED_ADDRESS_FORM: Pattern = Pattern::dereference(Pattern::capture(Pattern::addition(
        Pattern::physical_register(),
        Pattern::constant(),
    )));

    /// `reg cmp constant`
    static ref COMPARISON_FORM: Pattern = Pattern::comparison(
        Pattern::capture(Pattern::physical_register()),
        Pattern::capture(Pattern::constant()),
    );

    /// a secondary lookup mapping a wide input to a dense index.
    static ref INDEX_TABLE_ACCESS_FORM: Pattern = Pattern::dereference(Pattern::addition(
        Pattern::capture(Pattern::physical_register()),
        Pattern::capture(Pattern::physical_register()),
    ));

    /// `base + entry-count`
    static ref TABLE_INDEX_FORM: Pattern = Pattern::addition(
        Pattern::capture(Pattern::physical_register()),
        Pattern::capture(Pattern::constant()),
    );
}

/// working notes for one indirect-jump site.
struct JumptableInfo<'c> {
    cfg:       &'c ControlFlowGraph,
    jump_node: NodeId,

    valid:           bool,
    table_base:      VA,
    target_base:     Option<VA>,
    scale:           u8,
    entries:         Option<u64>,
    bound_mnemonic:  Option<String>,
    base_candidates: Vec<VA>,
}

impl<'c> JumptableInfo<'c> {
    fn new(cfg: &'c ControlFlowGraph, jump_node: NodeId) -> JumptableInfo<'c> {
        JumptableInfo {
            cfg,
            jump_node,
            valid: false,
            table_base: 0,
            target_base: None,
            scale: 0,
            entries: None,
            bound_mnemonic: None,
            base_candidates: vec![],
        }
    }
}

fn captured_reg(map: &UseDefMap, capture: &TreeCapture, i: usize) -> Option<RegId> {
    match map.arena().get(capture.get(i)) {
        TreeNode::PhysicalRegister(r) => Some(*r),
        _ => None,
    }
}

fn captured_const(map: &UseDefMap, capture: &TreeCapture, i: usize) -> Option<i64> {
    match map.arena().get(capture.get(i)) {
        TreeNode::Constant(v) => Some(*v),
        _ => None,
    }
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
    let map = usedef::analyze(function, &cfg)?;

    for node in 0..cfg.len() {
        let block = &function.blocks[cfg.get(node).block];
        let terminator = block.terminator()?;
        let register = match &terminator.semantic {
            Semantic::IndirectJump { register } => *register,
            _ => continue,
        };

        debug!("jumptable: {:#x}: indirect jump", terminator.address);
        let jump_state = match map.state_at(terminator.address) {
            Some(state) => state,
            None => continue,
        };

        let mut info = JumptableInfo::new(&cfg, node);

        search_up_def(&map, jump_state, register.id, &JUMP_TARGET_FORM_1, |s, capture| {
            parse_jumptable(&map, s, capture, &mut info)
        });
        if info.valid {
            make_descriptor(function, terminator, &info, save_partial_info_tables, tables);
            continue;
        }

        search_up_def(&map, jump_state, register.id, &JUMP_TARGET_FORM_2, |s, capture| {
            parse_jumptable(&map, s, capture, &mut info)
        });
        if info.valid {
            make_descriptor(function, terminator, &info, save_partial_info_tables, tables);
            continue;
        }

        // the jump register may be loaded straight from a table of
        // absolute entries, with no target-base addition.
        if parse_table_access(&map, jump_state, register.id, &mut info) {
            info.valid = true;
            make_descriptor(function, terminator, &info, save_partial_info_tables, tables);
        }
    }

    Ok(())
}

fn make_descriptor(
    function: &Function,
    instruction: &Instruction,
    info: &JumptableInfo,
    save_partial_info_tables: bool,
    tables: &mut Vec<JumpTableDescriptor>,
) {
    if info.entries.is_none() && !save_partial_info_tables {
        debug!("jumptable: {:#x}: bound unknown, dropping", instruction.address);
        return;
    }

    debug!(
        "jumptable: {:#x}: table at {:#x}, scale {}, entries {:?}",
        instruction.address, info.table_base, info.scale, info.entries
    );
    tables.push(JumpTableDescriptor {
        function:        function.address,
        instruction:     instruction.address,
        address:         info.table_base,
        target_base:     info.target_base,
        scale:           info.scale,
        bound:           info.entries.and_then(|e| e.checked_sub(1)),
        index_expr:      None,
        bound_mnemonic:  info.bound_mnemonic.clone(),
        base_candidates: info.base_candidates.clone(),
    });
}

/// One of the jump-target forms matched: decide which side is the target
/// base and which flows from the table, then fill in the table info.
fn parse_jumptable(map: &UseDefMap, state: StateId, capture: &TreeCapture, info: &mut JumptableInfo) -> bool {
    let reg1 = match captured_reg(map, capture, 0) {
        Some(reg) => reg,
        None => return false,
    };
    let reg2 = match captured_reg(map, capture, 1) {
        Some(reg) => reg,
        None => return false,
    };

    let mut found = false;
    let mut target_base = 0;

    if let Some(&base) = parse_base_address(map, state, reg1, 0).first() {
        debug!("jumptable: left side is the target base");
        target_base = base;
        found = parse_table_access(map, state, reg2, info);
    }
    if !found {
        if let Some(&base) = parse_base_address(map, state, reg2, 0).first() {
            debug!("jumptable: right side is the target base");
            target_base = base;
            found = parse_table_access(map, state, reg1, info);
        }
    }

    if found {
        info.valid = true;
        info.target_base = Some(target_base);
        return true;
    }
    false
}

/// The other side of the jump target must flow from a load out of the
/// table: `*(base + index)` or `*(base + (index << k))`. The base must
/// resolve to an address; the element stride is the load width.
fn parse_table_access(map: &UseDefMap, state: StateId, reg: RegId, info: &mut JumptableInfo) -> bool {
    debug!(
        "jumptable: {:#x}: looking for the table access of register {}",
        map.state(state).insn.address,
        reg
    );

    for form in [&*TABLE_ACCESS_FORM_1, &*TABLE_ACCESS_FORM_2] {
        let mut found = false;
        search_up_def(map, state, reg, form, |s, capture| {
            let base_reg = match captured_reg(map, capture, 1) {
                Some(reg) => reg,
                None => return false,
            };
            let index_reg = match captured_reg(map, capture, 2) {
                Some(reg) => reg,
                None => return false,
            };

            let candidates = parse_base_address(map, s, base_reg, 0);
            let address = match candidates.first() {
                Some(&address) if address != 0 => address,
                _ => return false,
            };
            if candidates.len() > 1 {
                warn!(
                    "jumptable: {:#x}: {} base candidates, considering only the first",
                    map.state(s).insn.address,
                    candidates.len()
                );
            }

            debug!("jumptable: {:#x}: table found at {:#x}", map.state(s).insn.address, address);
            info.table_base = address;
            info.base_candidates = candidates.to_vec();
            info.scale = match map.arena().get(capture.get(0)) {
                TreeNode::Dereference { width, .. } => *width,
                _ => return false,
            };
            found = true;

            parse_bound(map, s, index_reg, info, 0);
            true
        });
        if found {
            return true;
        }
    }
    false
}

/// Resolve a register to the address it holds, trying in turn: an address
/// literal, a page+offset computation, and a reload of a saved address.
/// Every candidate observed is returned, first one wins; empty means the
/// register is not a base.
fn parse_base_address(map: &UseDefMap, state: StateId, reg: RegId, depth: usize) -> SmallVec<[VA; 1]> {
    if depth > MAX_DEPTH {
        return Default::default();
    }
    debug!(
        "jumptable: {:#x}: looking for the base address of register {}",
        map.state(state).insn.address,
        reg
    );

    let mut found: SmallVec<[VA; 1]> = Default::default();
    search_up_def(map, state, reg, &BASE_ADDRESS_FORM, |_, capture| {
        if let TreeNode::Address(addr) = map.arena().get(capture.get(0)) {
            if !found.contains(addr) {
                found.push(*addr);
            }
        }
        false
    });
    if !found.is_empty() {
        return found;
    }

    let computed = parse_computed_address(map, state, reg, depth);
    if !computed.is_empty() {
        return computed;
    }

    parse_saved_address(map, state, reg, depth)
}

/// `add base, page, #offset` over a resolvable page.
fn parse_computed_address(map: &UseDefMap, state: StateId, reg: RegId, depth: usize) -> SmallVec<[VA; 1]> {
    let mut found: SmallVec<[VA; 1]> = Default::default();
    search_up_def(map, state, reg, &COMPUTED_ADDRESS_FORM, |s, capture| {
        let page_reg = match captured_reg(map, capture, 0) {
            Some(reg) => reg,
            None => return false,
        };
        let offset = match captured_const(map, capture, 1) {
            Some(offset) => offset,
            None => return false,
        };

        let pages = parse_base_address(map, s, page_reg, depth + 1);
        if pages.is_empty() {
            return false;
        }
        found = pages.iter().map(|page| page.wrapping_add(i64_u64(offset))).collect();
        true
    });
    found
}

/// The base was spilled and reloaded: find the store that wrote the
/// reloaded slot and resolve the register that was stored.
fn parse_saved_address(map: &UseDefMap, state: StateId, reg: RegId, depth: usize) -> SmallVec<[VA; 1]> {
    let mut found: SmallVec<[VA; 1]> = Default::default();
    search_up_def(map, state, reg, &SAVED_ADDRESS_FORM, |s, capture| {
        let load_loc = match MemLocation::parse(map.arena(), capture.get(0)) {
            Some(loc) => loc,
            None => return false,
        };

        for &store in map.state(s).mem_ref(reg) {
            for (stored_reg, addr) in map.state(store).mem_defs() {
                if MemLocation::parse(map.arena(), addr) == Some(load_loc) {
                    let resolved = parse_base_address(map, store, stored_reg, depth + 1);
                    if !resolved.is_empty() {
                        found = resolved;
                        return true;
                    }
                }
            }
        }
        false
    });
    found
}

/// Recover the number of valid entries for the table indexed by `reg`.
fn parse_bound(map: &UseDefMap, state: StateId, reg: RegId, info: &mut JumptableInfo, depth: usize) -> bool {
    if depth > MAX_DEPTH {
        return false;
    }
    debug!(
        "jumptable: {:#x}: looking for the bound of register {}",
        map.state(state).insn.address,
        reg
    );

    let mut found = false;
    for &s in map.state(state).reg_ref(reg) {
        // look down from the definition for a comparison against a
        // constant; which flags register it lands in tells the shape.
        search_down_def(map, s, reg, &COMPARISON_FORM, |u, def_reg, capture| {
            if def_reg == NZCV {
                if let Some(bound) = captured_const(map, capture, 1) {
                    if get_bound_from_compare(map, u, bound, info) {
                        debug!("jumptable: {:#x}: bound from compare", map.state(u).insn.address);
                        found = true;
                    }
                }
            }
            if def_reg == ONETIME_NZCV {
                if let Some(compared) = captured_reg(map, capture, 0) {
                    if get_bound_from_compare_and_branch(map, u, compared, info) {
                        found = true;
                    }
                }
            }
            found
        });
        if found {
            break;
        }

        if get_bound_from_move(map, s, reg, info, depth) {
            found = true;
            break;
        }
        if get_bound_from_index_table(map, s, reg, info) {
            found = true;
            break;
        }
    }

    // the register entered the function as an argument; the guard sits in
    // an earlier block.
    if !found && map.state(state).reg_ref(reg).is_empty() {
        found = get_bound_from_argument(map, reg, info);
    }

    if found {
        debug!("jumptable: entries = {:?}", info.entries);
    } else {
        debug!("jumptable: no bounding condition found");
    }
    found
}

/// A `cmp reg, #bound` whose flags feed a conditional branch on an edge
/// into the jump's block.
fn get_bound_from_compare(map: &UseDefMap, state: StateId, bound: i64, info: &mut JumptableInfo) -> bool {
    let mut branches: SmallVec<[StateId; 2]> = Default::default();
    for &s in map.state(state).reg_use(NZCV) {
        let node = map.state(s).node;
        if info.cfg.get(node).links.contains(&info.jump_node) {
            branches.push(s);
        }
    }

    for &s in branches.iter() {
        let mnemonic = match &map.state(s).insn.semantic {
            Semantic::ControlFlowConditional { mnemonic, .. } => mnemonic.as_str(),
            _ => continue,
        };
        match mnemonic {
            // equality tests do not express a bound.
            "b.eq" | "b.ne" => continue,
            // unsigned lower-or-same guards the in-range edge.
            "b.ls" => {
                if bound < 0 {
                    continue;
                }
                info.entries = Some(bound as u64 + 1);
                info.bound_mnemonic = Some(mnemonic.to_string());
                return true;
            }
            // unsigned higher: the taken edge is the out-of-range edge.
            "b.hi" => {
                if bound < 0 {
                    continue;
                }
                info.entries = Some(bound as u64 + 1);
                info.bound_mnemonic = Some(mnemonic.to_string());
                return true;
            }
            other => {
                warn!(
                    "jumptable: {:#x}: unknown corresponding branch {}",
                    map.state(s).insn.address,
                    other
                );
            }
        }
    }
    false
}

/// `cbz`/`cbnz` guarding the jump: recognized, bound not recovered.
fn get_bound_from_compare_and_branch(map: &UseDefMap, state: StateId, reg: RegId, info: &mut JumptableInfo) -> bool {
    let node = map.state(state).node;
    if info.cfg.get(node).links.contains(&info.jump_node) {
        warn!(
            "jumptable: {:#x}: compare-and-branch bound not yet implemented (register {})",
            map.state(state).insn.address,
            reg
        );
    }
    false
}

/// The index was copied through another register, possibly with an
/// entry-scaling shift applied; follow it to the guarded register.
fn get_bound_from_move(map: &UseDefMap, state: StateId, reg: RegId, info: &mut JumptableInfo, depth: usize) -> bool {
    let def = match map.state(state).reg_def(reg) {
        Some(def) => def,
        None => return false,
    };
    let src = match map.arena().get(def) {
        TreeNode::PhysicalRegister(src) => *src,
        TreeNode::LogicalShiftLeft(l, r) => {
            match (map.arena().get(*l), map.arena().get(*r)) {
                (TreeNode::PhysicalRegister(src), TreeNode::Constant(_)) => *src,
                _ => return false,
            }
        }
        _ => return false,
    };
    debug!("jumptable: {:#x}: move, following", map.state(state).insn.address);
    parse_bound(map, state, src, info, depth + 1)
}

/// The index is itself loaded from a secondary table that maps a wider
/// input onto a dense small index; the entry count of the outer jump
/// rides on the secondary base computation.
fn get_bound_from_index_table(map: &UseDefMap, state: StateId, reg: RegId, info: &mut JumptableInfo) -> bool {
    let def = match map.state(state).reg_def(reg) {
        Some(def) => def,
        None => return false,
    };
    let capture = match match_tree(map.arena(), &INDEX_TABLE_ACCESS_FORM, def) {
        Some(capture) => capture,
        None => return false,
    };

    debug!(
        "jumptable: {:#x}: index loaded from a secondary table",
        map.state(state).insn.address
    );
    let base_reg = match captured_reg(map, &capture, 0) {
        Some(reg) => reg,
        None => return false,
    };

    let mut found = false;
    search_up_def(map, state, base_reg, &TABLE_INDEX_FORM, |_, capture| {
        if let Some(entries) = captured_const(map, capture, 1) {
            if entries > 0 {
                info.entries = Some(entries as u64);
                found = true;
                return true;
            }
        }
        false
    });
    found
}

/// The index has no definition in this function: it is an argument. Walk
/// the blocks leading to the jump, nearest first, and try each terminator
/// as the guarding comparison.
fn get_bound_from_argument(map: &UseDefMap, reg: RegId, info: &mut JumptableInfo) -> bool {
    let order = reverse_reverse_postorder(info.cfg, info.jump_node);

    let mut found = false;
    for &node in order.iter().skip(1) {
        let last = match map.terminator_state(node) {
            Some(s) => s,
            None => continue,
        };

        search_up_def(map, last, NZCV, &COMPARISON_FORM, |s, capture| {
            match captured_reg(map, capture, 0) {
                Some(compared) if compared == reg => {}
                _ => return false,
            }
            let bound = match captured_const(map, capture, 1) {
                Some(bound) => bound,
                None => return false,
            };
            if get_bound_from_compare(map, s, bound, info) {
                found = true;
                return true;
            }
            false
        });
        if found {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{module::Function, register::aarch64::*, test::*};

    /// the offset-table idiom with an explicit target base:
    ///
    /// ```text
    ///   cmp  w0, #4 ; b.hi default
    ///   adrp x1, #0x10000 ; add x1, x1, #0x48
    ///   ldr  w2, [x1, w0, uxtw #2]
    ///   adrp x3, #0x20000 ; add x3, x3, #0x100
    ///   add  x2, x3, x2
    ///   br   x2
    /// ```
    fn offset_table_function() -> Function {
        let mut f = FunctionBuilder::aarch64(0x1000);
        f.block(|b| {
            b.cmp_imm(w(0), 4); // 0x1000
            b.b_cond("b.hi", 0x1028); // 0x1004
        });
        f.block_at(0x1008, |b| {
            b.adrp(x(1), 0x10000); // 0x1008
            b.add_imm(x(1), x(1), 0x48); // 0x100c
            b.ldr_shifted(w(2), x(1), w(0), 2); // 0x1010
            b.adrp(x(3), 0x20000); // 0x1014
            b.add_imm(x(3), x(3), 0x100); // 0x1018
            b.add(x(2), x(3), x(2)); // 0x101c
            b.br(x(2)); // 0x1020
        });
        f.block_at(0x1028, |b| {
            b.ret();
        });
        f.build()
    }

    #[test]
    fn offset_table_with_target_base() {
        let f = offset_table_function();
        let mut tables = vec![];
        detect_function(&f, false, &mut tables).unwrap();

        assert_eq!(tables.len(), 1);
        let d = &tables[0];
        assert_eq!(d.function, 0x1000);
        assert_eq!(d.instruction, 0x1020);
        assert_eq!(d.address, 0x10048);
        assert_eq!(d.target_base, Some(0x20100));
        assert_eq!(d.scale, 4);
        assert_eq!(d.bound, Some(4));
        assert_eq!(d.entries(), Some(5));
        assert_eq!(d.bound_mnemonic.as_deref(), Some("b.hi"));
        assert_eq!(d.base_candidates, vec![0x10048]);
    }

    #[test]
    fn direct_access_without_target_base() {
        // the jump register is loaded straight out of the table.
        let mut f = FunctionBuilder::aarch64(0x1000);
        f.block(|b| {
            b.cmp_imm(w(0), 4); // 0x1000
            b.b_cond("b.hi", 0x1018); // 0x1004
        });
        f.block_at(0x1008, |b| {
            b.adrp(x(1), 0x10000); // 0x1008
            b.add_imm(x(1), x(1), 0x48); // 0x100c
            b.ldr_shifted(w(2), x(1), w(0), 2); // 0x1010
            b.br(x(2)); // 0x1014
        });
        f.block_at(0x1018, |b| {
            b.ret();
        });
        let f = f.build();

        let mut tables = vec![];
        detect_function(&f, false, &mut tables).unwrap();
        assert_eq!(tables.len(), 1);
        let d = &tables[0];
        assert_eq!(d.address, 0x10048);
        assert_eq!(d.target_base, None);
        assert_eq!(d.scale, 4);
        assert_eq!(d.entries(), Some(5));
    }

    #[test]
    fn separate_shift_uses_access_form_two() {
        // lsl w3, w0, #2 ; ldr w2, [x1, x3] recognizes the shifted form.
        let mut f = FunctionBuilder::aarch64(0x1000);
        f.block(|b| {
            b.cmp_imm(w(0), 4); // 0x1000
            b.b_cond("b.hi", 0x1020); // 0x1004
        });
        f.block_at(0x1008, |b| {
            b.adrp(x(1), 0x10000); // 0x1008
            b.add_imm(x(1), x(1), 0x48); // 0x100c
            b.lsl_imm(w(3), w(0), 2); // 0x1010
            b.ldr(w(2), x(1), x(3)); // 0x1014
            b.br(x(2)); // 0x1018
        });
        f.block_at(0x1020, |b| {
            b.ret();
        });
        let f = f.build();

        let mut tables = vec![];
        detect_function(&f, false, &mut tables).unwrap();
        assert_eq!(tables.len(), 1);
        let d = &tables[0];
        assert_eq!(d.address, 0x10048);
        assert_eq!(d.scale, 4);
        assert_eq!(d.entries(), Some(5));
    }

    #[test]
    fn shifted_target_uses_jump_form_two() {
        // the entry is scaled into the target at the add:
        //   add x2, x3, w2, lsl #2
        let mut f = FunctionBuilder::aarch64(0x1000);
        f.block(|b| {
            b.cmp_imm(w(0), 4); // 0x1000
            b.b_cond("b.hi", 0x1028); // 0x1004
        });
        f.block_at(0x1008, |b| {
            b.adrp(x(1), 0x10000); // 0x1008
            b.add_imm(x(1), x(1), 0x48); // 0x100c
            b.ldr_shifted(w(2), x(1), w(0), 2); // 0x1010
            b.adrp(x(3), 0x20000); // 0x1014
            b.add_imm(x(3), x(3), 0x100); // 0x1018
            b.add_shifted(x(2), x(3), w(2), 2); // 0x101c
            b.br(x(2)); // 0x1020
        });
        f.block_at(0x1028, |b| {
            b.ret();
        });
        let f = f.build();

        let mut tables = vec![];
        detect_function(&f, false, &mut tables).unwrap();
        assert_eq!(tables.len(), 1);
        let d = &tables[0];
        assert_eq!(d.address, 0x10048);
        assert_eq!(d.target_base, Some(0x20100));
        // the element stride is the load width, not the target shift.
        assert_eq!(d.scale, 4);
        assert_eq!(d.entries(), Some(5));
    }

    #[test]
    fn bound_via_ls_guard() {
        // b.ls on the in-range edge instead of b.hi on the default edge.
        let mut f = FunctionBuilder::aarch64(0x1000);
        f.block(|b| {
            b.cmp_imm(w(0), 12); // 0x1000
            b.b_cond("b.ls", 0x100c); // 0x1004, in-range edge
        });
        f.block_at(0x1008, |b| {
            b.ret(); // default
        });
        f.block_at(0x100c, |b| {
            b.adrp(x(1), 0x10000); // 0x100c
            b.add_imm(x(1), x(1), 0x48); // 0x1010
            b.ldr_shifted(w(2), x(1), w(0), 2); // 0x1014
            b.br(x(2)); // 0x1018
        });
        let f = f.build();

        let mut tables = vec![];
        detect_function(&f, false, &mut tables).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].entries(), Some(13));
        assert_eq!(tables[0].bound_mnemonic.as_deref(), Some("b.ls"));
    }

    #[test]
    fn compare_and_branch_yields_partial_info() {
        // the guard is a cbnz: recognized, bound not recovered.
        let mut f = FunctionBuilder::aarch64(0x1000);
        f.block(|b| {
            b.mov(w(4), w(0)); // 0x1000
            b.cbnz(w(4), 0x1020); // 0x1004
        });
        f.block_at(0x1008, |b| {
            b.adrp(x(1), 0x10000); // 0x1008
            b.add_imm(x(1), x(1), 0x48); // 0x100c
            b.ldr_shifted(w(2), x(1), w(4), 2); // 0x1010
            b.br(x(2)); // 0x1014
        });
        f.block_at(0x1020, |b| {
            b.ret();
        });
        let f = f.build();

        let mut dropped = vec![];
        detect_function(&f, false, &mut dropped).unwrap();
        assert!(dropped.is_empty());

        let mut kept = vec![];
        detect_function(&f, true, &mut kept).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].address, 0x10048);
        assert_eq!(kept[0].bound, None);
    }

    #[test]
    fn bound_via_index_table() {
        // the index is itself loaded from a 13-entry mapping table.
        let mut f = FunctionBuilder::aarch64(0x1000);
        f.block(|b| {
            b.adrp(x(6), 0x30000); // 0x1000
            b.add_imm(x(5), x(6), 13); // 0x1004
            b.ldrb(w(4), x(5), x(0)); // 0x1008
            b.adrp(x(1), 0x10000); // 0x100c
            b.add_imm(x(1), x(1), 0x48); // 0x1010
            b.ldr_shifted(w(2), x(1), w(4), 2); // 0x1014
            b.adrp(x(3), 0x20000); // 0x1018
            b.add_imm(x(3), x(3), 0x100); // 0x101c
            b.add(x(2), x(3), x(2)); // 0x1020
            b.br(x(2)); // 0x1024
        });
        let f = f.build();

        let mut tables = vec![];
        detect_function(&f, false, &mut tables).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].entries(), Some(13));
        assert_eq!(tables[0].bound, Some(12));
    }

    #[test]
    fn bound_from_argument_comparison() {
        // the index register is a function argument; the guard dominates
        // the jump from an earlier block.
        let f = offset_table_function();
        // sanity: w0 has no definition inside the function.
        let cfg = ControlFlowGraph::new(&f).unwrap();
        let map = usedef::analyze(&f, &cfg).unwrap();
        let ldr = map.state_at(0x1010).unwrap();
        assert!(map.state(ldr).reg_ref(0).is_empty());

        let mut tables = vec![];
        detect_function(&f, false, &mut tables).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].entries(), Some(5));
    }

    #[test]
    fn saved_and_reloaded_base() {
        // the table base is spilled and reloaded around the access.
        let mut f = FunctionBuilder::aarch64(0x1000);
        f.block(|b| {
            b.cmp_imm(w(0), 4); // 0x1000
            b.b_cond("b.hi", 0x1030); // 0x1004
        });
        f.block_at(0x1008, |b| {
            b.adrp(x(1), 0x10000); // 0x1008
            b.add_imm(x(1), x(1), 0x48); // 0x100c
            b.str_disp(x(1), x(29), 0x10); // 0x1010
            b.mov_imm(x(1), 0); // 0x1014, clobber
            b.ldr_disp(x(5), x(29), 0x10); // 0x1018, reload
            b.ldr_shifted(w(2), x(5), w(0), 2); // 0x101c
            b.br(x(2)); // 0x1020
        });
        f.block_at(0x1030, |b| {
            b.ret();
        });
        let f = f.build();

        let mut tables = vec![];
        detect_function(&f, false, &mut tables).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].address, 0x10048);
        assert_eq!(tables[0].entries(), Some(5));
    }

    #[test]
    fn base_resolution_is_idempotent() {
        let f = offset_table_function();
        let cfg = ControlFlowGraph::new(&f).unwrap();
        let map = usedef::analyze(&f, &cfg).unwrap();
        let ldr = map.state_at(0x1010).unwrap();

        let first = parse_base_address(&map, ldr, 1, 0);
        let second = parse_base_address(&map, ldr, 1, 0);
        assert_eq!(first, second);
        assert_eq!(first.as_slice(), &[0x10048]);
    }
}
