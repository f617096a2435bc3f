//! Declarative patterns over expression trees.
//!
//! A pattern is a runtime-composed predicate; matching a pattern against a
//! tree either fails or yields the ordered list of captured subtrees.
//! Matching is deterministic and never mutates the tree; alternatives are
//! tried one after another by the caller, there is no backtracking inside
//! a single pattern.

use smallvec::SmallVec;

use crate::{
    analysis::tree::{NodeKind, TreeArena, TreeId, TreeNode},
    register::RegId,
};

#[derive(Clone, Debug)]
pub enum Pattern {
    /// matches any node.
    Any,
    /// matches a leaf of the given kind.
    Terminal(NodeKind),
    /// matches a constant with exactly this value.
    ConstantIs(i64),
    /// matches a physical register with exactly this id.
    RegisterIs(RegId),
    /// matches a one-child node of the given kind whose child matches.
    Unary(NodeKind, Box<Pattern>),
    /// matches a two-child node of the given kind whose children match.
    Binary(NodeKind, Box<Pattern>, Box<Pattern>),
    /// on success, appends the matched subtree to the capture list.
    /// captures are indexed in pre-order: an outer capture precedes the
    /// captures inside its subpattern.
    Capture(Box<Pattern>),
}

impl Pattern {
    pub fn any() -> Pattern {
        Pattern::Any
    }

    pub fn constant() -> Pattern {
        Pattern::Terminal(NodeKind::Constant)
    }

    pub fn address() -> Pattern {
        Pattern::Terminal(NodeKind::Address)
    }

    pub fn physical_register() -> Pattern {
        Pattern::Terminal(NodeKind::PhysicalRegister)
    }

    pub fn register_rip() -> Pattern {
        Pattern::Terminal(NodeKind::RegisterRip)
    }

    pub fn constant_is(v: i64) -> Pattern {
        Pattern::ConstantIs(v)
    }

    pub fn register_is(r: RegId) -> Pattern {
        Pattern::RegisterIs(r)
    }

    pub fn addition(l: Pattern, r: Pattern) -> Pattern {
        Pattern::Binary(NodeKind::Addition, Box::new(l), Box::new(r))
    }

    pub fn multiplication(l: Pattern, r: Pattern) -> Pattern {
        Pattern::Binary(NodeKind::Multiplication, Box::new(l), Box::new(r))
    }

    pub fn logical_shift_left(l: Pattern, r: Pattern) -> Pattern {
        Pattern::Binary(NodeKind::LogicalShiftLeft, Box::new(l), Box::new(r))
    }

    pub fn comparison(l: Pattern, r: Pattern) -> Pattern {
        Pattern::Binary(NodeKind::Comparison, Box::new(l), Box::new(r))
    }

    pub fn dereference(addr: Pattern) -> Pattern {
        Pattern::Unary(NodeKind::Dereference, Box::new(addr))
    }

    pub fn capture(p: Pattern) -> Pattern {
        Pattern::Capture(Box::new(p))
    }
}

/// the ordered subtrees captured by a successful match.
#[derive(Clone, Debug, Default)]
pub struct TreeCapture {
    nodes: SmallVec<[TreeId; 4]>,
}

impl TreeCapture {
    pub fn get(&self, i: usize) -> TreeId {
        self.nodes[i]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// `match_tree(p, t)` is a pure function of `(p, t)`.
pub fn match_tree(arena: &TreeArena, pattern: &Pattern, tree: TreeId) -> Option<TreeCapture> {
    let mut capture = TreeCapture::default();
    if matches(arena, pattern, tree, &mut capture) {
        Some(capture)
    } else {
        None
    }
}

fn matches(arena: &TreeArena, pattern: &Pattern, tree: TreeId, capture: &mut TreeCapture) -> bool {
    let node = arena.get(tree);
    match pattern {
        Pattern::Any => true,
        Pattern::Terminal(kind) => node.is_terminal() && node.kind() == *kind,
        Pattern::ConstantIs(v) => matches!(node, TreeNode::Constant(c) if c == v),
        Pattern::RegisterIs(r) => matches!(node, TreeNode::PhysicalRegister(reg) if reg == r),
        Pattern::Unary(kind, p) => match node {
            TreeNode::Dereference { addr, .. } if *kind == NodeKind::Dereference => matches(arena, p, *addr, capture),
            _ => false,
        },
        Pattern::Binary(kind, pl, pr) => {
            let (l, r) = match node {
                TreeNode::Addition(l, r) if *kind == NodeKind::Addition => (*l, *r),
                TreeNode::Multiplication(l, r) if *kind == NodeKind::Multiplication => (*l, *r),
                TreeNode::LogicalShiftLeft(l, r) if *kind == NodeKind::LogicalShiftLeft => (*l, *r),
                TreeNode::Comparison(l, r) if *kind == NodeKind::Comparison => (*l, *r),
                _ => return false,
            };
            matches(arena, pl, l, capture) && matches(arena, pr, r, capture)
        }
        Pattern::Capture(p) => {
            // captures are appended in pre-order.
            capture.nodes.push(tree);
            if matches(arena, p, tree, capture) {
                true
            } else {
                capture.nodes.pop();
                false
            }
        }
    }
}
