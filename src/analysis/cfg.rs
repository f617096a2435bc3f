//! Per-function control flow graph.
//!
//! One node per basic block, linked by the targets of each block's
//! terminator. Provides the two traversal orders the dataflow engines
//! need: condensed SCC order (forward analysis) and
//! reverse-reverse-postorder from a node (looking backward from a jump).

use anyhow::Result;
use log::debug;
use smallvec::SmallVec;

use crate::{
    insn::Semantic,
    module::{Block, Function},
    VA,
};

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct ControlFlowNode {
    pub id:      NodeId,
    /// index of the backing block in `Function::blocks`.
    pub block:   usize,
    pub address: VA,

    /// successor node ids.
    pub links: SmallVec<[NodeId; 2]>,

    /// predecessor node ids.
    pub reverse_links: SmallVec<[NodeId; 2]>,
}

pub struct ControlFlowGraph {
    nodes: Vec<ControlFlowNode>,
}

fn block_successors(function: &Function, block: &Block) -> Result<SmallVec<[VA; 2]>> {
    let terminator = block.terminator()?;
    Ok(match &terminator.semantic {
        Semantic::DirectBranch { target } => SmallVec::from_slice(&[*target]),
        Semantic::ControlFlowConditional { target, .. } => {
            // taken edge first, then fallthrough.
            SmallVec::from_slice(&[*target, terminator.next_address()])
        }
        Semantic::IndirectJump { .. } => Default::default(),
        _ => {
            // returns do not fall through; anything else flows to the next block.
            if terminator.assembly.mnemonic == "ret" {
                Default::default()
            } else {
                SmallVec::from_slice(&[terminator.next_address()])
            }
        }
    })
}

impl ControlFlowGraph {
    pub fn new(function: &Function) -> Result<ControlFlowGraph> {
        let mut nodes: Vec<ControlFlowNode> = function
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| ControlFlowNode {
                id:            i,
                block:         i,
                address:       b.address,
                links:         Default::default(),
                reverse_links: Default::default(),
            })
            .collect();

        for (i, block) in function.blocks.iter().enumerate() {
            for target in block_successors(function, block)? {
                if let Some(j) = function.block_index_at(target) {
                    nodes[i].links.push(j);
                    nodes[j].reverse_links.push(i);
                } else {
                    // target outside the function (e.g. tail call); not an edge.
                    debug!("cfg: {:#x}: target {:#x} outside function", block.address, target);
                }
            }
        }

        Ok(ControlFlowGraph { nodes })
    }

    pub fn get(&self, id: NodeId) -> &ControlFlowNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[ControlFlowNode] {
        &self.nodes
    }
}

/// Strongly-connected components of the CFG, condensed and topologically
/// ordered. Forward dataflow iterates components in this order, repeating
/// the blocks inside a component until the states fixpoint.
pub struct SccOrder {
    components: Vec<Vec<NodeId>>,
}

impl SccOrder {
    /// Tarjan over the nodes reachable from `entry`.
    pub fn new(cfg: &ControlFlowGraph, entry: NodeId) -> SccOrder {
        let n = cfg.len();
        let mut index = vec![usize::MAX; n];
        let mut lowlink = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<NodeId> = vec![];
        let mut next_index = 0usize;
        let mut components: Vec<Vec<NodeId>> = vec![];

        // iterative tarjan: (node, next-successor-offset)
        let mut work: Vec<(NodeId, usize)> = vec![];
        if entry < n && index[entry] == usize::MAX {
            work.push((entry, 0));
            index[entry] = next_index;
            lowlink[entry] = next_index;
            next_index += 1;
            stack.push(entry);
            on_stack[entry] = true;
        }

        while !work.is_empty() {
            let (v, succ_offset) = {
                let top = work.last_mut().expect("work stack is non-empty");
                let frame = *top;
                top.1 += 1;
                frame
            };
            if succ_offset < cfg.get(v).links.len() {
                let w = cfg.get(v).links[succ_offset];
                if index[w] == usize::MAX {
                    index[w] = next_index;
                    lowlink[w] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    work.push((w, 0));
                } else if on_stack[w] {
                    lowlink[v] = lowlink[v].min(index[w]);
                }
            } else {
                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[v]);
                }
                if lowlink[v] == index[v] {
                    let mut component = vec![];
                    loop {
                        let w = stack.pop().expect("tarjan stack underflow");
                        on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    component.reverse();
                    components.push(component);
                }
            }
        }

        // tarjan emits components in reverse topological order.
        components.reverse();
        SccOrder { components }
    }

    pub fn get(&self) -> &[Vec<NodeId>] {
        &self.components
    }
}

/// The order used when looking backward from a node: a postorder walk of
/// the reverse graph, reversed. The start node comes first, then its
/// predecessors from nearest outward.
pub fn reverse_reverse_postorder(cfg: &ControlFlowGraph, start: NodeId) -> Vec<NodeId> {
    let n = cfg.len();
    let mut visited = vec![false; n];
    let mut postorder: Vec<NodeId> = vec![];

    // iterative DFS over reverse links
    let mut work: Vec<(NodeId, usize)> = vec![(start, 0)];
    visited[start] = true;
    while !work.is_empty() {
        let (v, pred_offset) = {
            let top = work.last_mut().expect("work stack is non-empty");
            let frame = *top;
            top.1 += 1;
            frame
        };
        if pred_offset < cfg.get(v).reverse_links.len() {
            let w = cfg.get(v).reverse_links[pred_offset];
            if !visited[w] {
                visited[w] = true;
                work.push((w, 0));
            }
        } else {
            work.pop();
            postorder.push(v);
        }
    }

    postorder.reverse();
    postorder
}

/// Does any path lead from `from` to `to`?
pub fn reaches(cfg: &ControlFlowGraph, from: NodeId, to: NodeId) -> bool {
    if from == to {
        return true;
    }
    let mut visited = vec![false; cfg.len()];
    let mut queue = vec![from];
    visited[from] = true;
    while let Some(v) = queue.pop() {
        for &w in cfg.get(v).links.iter() {
            if w == to {
                return true;
            }
            if !visited[w] {
                visited[w] = true;
                queue.push(w);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::*;

    // entry -> b1 -> b3
    //   \-> b2 --^
    fn diamond() -> Function {
        let mut f = FunctionBuilder::aarch64(0x1000);
        f.block(|b| {
            b.cmp_imm(w(0), 4);
            b.b_cond("b.hi", 0x1010);
        });
        f.block_at(0x1008, |b| {
            b.mov_imm(w(1), 1);
            b.b(0x1018);
        });
        f.block_at(0x1010, |b| {
            b.mov_imm(w(1), 2);
            b.b(0x1018);
        });
        f.block_at(0x1018, |b| {
            b.ret();
        });
        f.build()
    }

    #[test]
    fn builds_links() {
        let f = diamond();
        let cfg = ControlFlowGraph::new(&f).unwrap();
        assert_eq!(cfg.len(), 4);
        // conditional: taken edge first, then fallthrough
        assert_eq!(cfg.get(0).links.as_slice(), &[2, 1]);
        assert_eq!(cfg.get(3).reverse_links.len(), 2);
        assert!(cfg.get(3).links.is_empty());
    }

    #[test]
    fn scc_order_is_topological() {
        let f = diamond();
        let cfg = ControlFlowGraph::new(&f).unwrap();
        let order = SccOrder::new(&cfg, 0);
        let components = order.get();
        assert_eq!(components.len(), 4);
        assert_eq!(components[0], vec![0]);
        assert_eq!(components[3], vec![3]);
    }

    #[test]
    fn rrpo_starts_at_the_node() {
        let f = diamond();
        let cfg = ControlFlowGraph::new(&f).unwrap();
        let order = reverse_reverse_postorder(&cfg, 3);
        assert_eq!(order[0], 3);
        assert_eq!(*order.last().unwrap(), 0);
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn reachability() {
        let f = diamond();
        let cfg = ControlFlowGraph::new(&f).unwrap();
        assert!(reaches(&cfg, 0, 3));
        assert!(!reaches(&cfg, 3, 0));
    }
}
