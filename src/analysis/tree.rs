//! Symbolic expression trees over registers, memory, constants, and
//! address literals.
//!
//! Trees are interned into a per-analysis arena keyed by structural hash:
//! nodes are stored once and addressed by `TreeId`, so structural equality
//! is id equality and shared subtrees cost nothing. Trees are immutable
//! once interned; their lifetime is tied to the arena, which is owned by
//! the engine that produced them. Consumers that need a tree to outlive
//! the analysis export an owned copy.

use std::fmt;

use fnv::FnvHashMap;
use smallvec::SmallVec;

use crate::{register::RegId, VA};

/// handle into a `TreeArena`. equal ids mean structurally equal trees.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreeId(u32);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TreeNode {
    /// integer literal.
    Constant(i64),
    /// absolute code/data address literal.
    Address(VA),
    /// the current symbolic value of an architectural register.
    PhysicalRegister(RegId),
    /// the program counter at the *next* instruction (x64 RIP-relative).
    RegisterRip(VA),
    Addition(TreeId, TreeId),
    Multiplication(TreeId, TreeId),
    LogicalShiftLeft(TreeId, TreeId),
    /// load `width` bytes from the address `addr` evaluates to.
    Dereference { addr: TreeId, width: u8 },
    /// produced by compare instructions, consumed by conditionals.
    Comparison(TreeId, TreeId),
    /// phi-like merge across CFG predecessors.
    MultipleParents(SmallVec<[TreeId; 2]>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Constant,
    Address,
    PhysicalRegister,
    RegisterRip,
    Addition,
    Multiplication,
    LogicalShiftLeft,
    Dereference,
    Comparison,
    MultipleParents,
}

impl TreeNode {
    pub fn kind(&self) -> NodeKind {
        match self {
            TreeNode::Constant(_) => NodeKind::Constant,
            TreeNode::Address(_) => NodeKind::Address,
            TreeNode::PhysicalRegister(_) => NodeKind::PhysicalRegister,
            TreeNode::RegisterRip(_) => NodeKind::RegisterRip,
            TreeNode::Addition(..) => NodeKind::Addition,
            TreeNode::Multiplication(..) => NodeKind::Multiplication,
            TreeNode::LogicalShiftLeft(..) => NodeKind::LogicalShiftLeft,
            TreeNode::Dereference { .. } => NodeKind::Dereference,
            TreeNode::Comparison(..) => NodeKind::Comparison,
            TreeNode::MultipleParents(_) => NodeKind::MultipleParents,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            NodeKind::Constant | NodeKind::Address | NodeKind::PhysicalRegister | NodeKind::RegisterRip
        )
    }
}

/// An owned, standalone copy of a tree, detached from any arena.
///
/// Descriptors carry these so they can outlive the per-function analysis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    Constant(i64),
    Address(VA),
    PhysicalRegister(RegId),
    RegisterRip(VA),
    Addition(Box<Expr>, Box<Expr>),
    Multiplication(Box<Expr>, Box<Expr>),
    LogicalShiftLeft(Box<Expr>, Box<Expr>),
    Dereference { addr: Box<Expr>, width: u8 },
    Comparison(Box<Expr>, Box<Expr>),
    MultipleParents(Vec<Expr>),
}

#[derive(Default)]
pub struct TreeArena {
    nodes:    Vec<TreeNode>,
    interned: FnvHashMap<TreeNode, TreeId>,
}

impl TreeArena {
    pub fn new() -> TreeArena {
        Default::default()
    }

    pub fn intern(&mut self, node: TreeNode) -> TreeId {
        if let Some(&id) = self.interned.get(&node) {
            return id;
        }
        let id = TreeId(self.nodes.len() as u32);
        self.nodes.push(node.clone());
        self.interned.insert(node, id);
        id
    }

    pub fn get(&self, id: TreeId) -> &TreeNode {
        &self.nodes[id.0 as usize]
    }

    pub fn kind(&self, id: TreeId) -> NodeKind {
        self.get(id).kind()
    }

    pub fn constant(&mut self, v: i64) -> TreeId {
        self.intern(TreeNode::Constant(v))
    }

    pub fn address(&mut self, v: VA) -> TreeId {
        self.intern(TreeNode::Address(v))
    }

    pub fn reg(&mut self, r: RegId) -> TreeId {
        self.intern(TreeNode::PhysicalRegister(r))
    }

    pub fn rip(&mut self, v: VA) -> TreeId {
        self.intern(TreeNode::RegisterRip(v))
    }

    pub fn add(&mut self, l: TreeId, r: TreeId) -> TreeId {
        self.intern(TreeNode::Addition(l, r))
    }

    pub fn mul(&mut self, l: TreeId, r: TreeId) -> TreeId {
        self.intern(TreeNode::Multiplication(l, r))
    }

    pub fn shl(&mut self, l: TreeId, r: TreeId) -> TreeId {
        self.intern(TreeNode::LogicalShiftLeft(l, r))
    }

    pub fn deref(&mut self, addr: TreeId, width: u8) -> TreeId {
        self.intern(TreeNode::Dereference { addr, width })
    }

    pub fn compare(&mut self, l: TreeId, r: TreeId) -> TreeId {
        self.intern(TreeNode::Comparison(l, r))
    }

    pub fn multiple(&mut self, parents: SmallVec<[TreeId; 2]>) -> TreeId {
        self.intern(TreeNode::MultipleParents(parents))
    }

    /// export an owned copy of the subtree rooted at `id`.
    pub fn export(&self, id: TreeId) -> Expr {
        match self.get(id) {
            TreeNode::Constant(v) => Expr::Constant(*v),
            TreeNode::Address(v) => Expr::Address(*v),
            TreeNode::PhysicalRegister(r) => Expr::PhysicalRegister(*r),
            TreeNode::RegisterRip(v) => Expr::RegisterRip(*v),
            TreeNode::Addition(l, r) => Expr::Addition(Box::new(self.export(*l)), Box::new(self.export(*r))),
            TreeNode::Multiplication(l, r) => {
                Expr::Multiplication(Box::new(self.export(*l)), Box::new(self.export(*r)))
            }
            TreeNode::LogicalShiftLeft(l, r) => {
                Expr::LogicalShiftLeft(Box::new(self.export(*l)), Box::new(self.export(*r)))
            }
            TreeNode::Dereference { addr, width } => Expr::Dereference {
                addr:  Box::new(self.export(*addr)),
                width: *width,
            },
            TreeNode::Comparison(l, r) => Expr::Comparison(Box::new(self.export(*l)), Box::new(self.export(*r))),
            TreeNode::MultipleParents(ps) => Expr::MultipleParents(ps.iter().map(|p| self.export(*p)).collect()),
        }
    }

    /// diagnostic rendering, e.g. `(+ addr:0x1000 (<< reg:5 const:2))`.
    pub fn display(&self, id: TreeId) -> DisplayTree<'_> {
        DisplayTree { arena: self, id }
    }
}

pub struct DisplayTree<'a> {
    arena: &'a TreeArena,
    id:    TreeId,
}

impl<'a> fmt::Display for DisplayTree<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let a = self.arena;
        match a.get(self.id) {
            TreeNode::Constant(v) => write!(f, "const:{}", v),
            TreeNode::Address(v) => write!(f, "addr:{:#x}", v),
            TreeNode::PhysicalRegister(r) => write!(f, "reg:{}", r),
            TreeNode::RegisterRip(v) => write!(f, "rip:{:#x}", v),
            TreeNode::Addition(l, r) => write!(f, "(+ {} {})", a.display(*l), a.display(*r)),
            TreeNode::Multiplication(l, r) => write!(f, "(* {} {})", a.display(*l), a.display(*r)),
            TreeNode::LogicalShiftLeft(l, r) => write!(f, "(<< {} {})", a.display(*l), a.display(*r)),
            TreeNode::Dereference { addr, width } => write!(f, "(deref{{{}}} {})", width, a.display(*addr)),
            TreeNode::Comparison(l, r) => write!(f, "(cmp {} {})", a.display(*l), a.display(*r)),
            TreeNode::MultipleParents(ps) => {
                write!(f, "(multiple")?;
                for p in ps.iter() {
                    write!(f, " {}", a.display(*p))?;
                }
                write!(f, ")")
            }
        }
    }
}
