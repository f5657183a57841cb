//! Dominator and postdominator trees over the value graph.
//!
//! The graph's edges are operand references: a value's predecessors are its
//! arguments, its successors its users. Producer order is a topological
//! order, which lets the iterative Cooper-Harvey-Kennedy scheme run in a
//! single direction with the two-finger intersection keyed on value ids.

use super::{Prog, ValueId};

/// An immediate-dominator forest; `None` parents hang off the virtual root.
#[derive(Debug, Clone)]
pub struct DomTree {
    idom: Vec<Option<u32>>,
    depth: Vec<u32>,
}

impl DomTree {
    /// Immediate dominator of `v`, or `None` at the virtual root.
    pub fn idom(&self, v: ValueId) -> Option<ValueId> {
        self.idom[v.0 as usize].map(ValueId)
    }

    /// Depth of `v` below the virtual root.
    pub fn depth(&self, v: ValueId) -> u32 {
        self.depth[v.0 as usize]
    }

    /// `true` when `a` dominates `b` (reflexive).
    pub fn dominates(&self, a: ValueId, b: ValueId) -> bool {
        let mut cur = Some(b);
        while let Some(v) = cur {
            if v == a {
                return true;
            }
            cur = self.idom(v);
        }
        false
    }
}

fn build(len: usize, order: impl Iterator<Item = usize> + Clone, preds: &[Vec<u32>]) -> DomTree {
    let mut idom: Vec<Option<u32>> = vec![None; len];
    let mut computed = vec![false; len];

    // Two-finger intersection; `rank` orders nodes so parents precede
    // children along the chosen direction.
    let intersect = |idom: &[Option<u32>], mut a: u32, mut b: u32, forward: bool| -> Option<u32> {
        loop {
            if a == b {
                return Some(a);
            }
            let (lo, hi) = if (a < b) == forward { (a, b) } else { (b, a) };
            match idom[hi as usize] {
                Some(up) => {
                    a = lo;
                    b = up;
                }
                None => return None,
            }
        }
    };

    let forward = {
        let mut it = order.clone();
        let first = it.next();
        let second = it.next();
        match (first, second) {
            (Some(a), Some(b)) => a < b,
            _ => true,
        }
    };

    let mut changed = true;
    while changed {
        changed = false;
        for v in order.clone() {
            let mut new_idom: Option<Option<u32>> = None;
            for &p in &preds[v] {
                if !computed[p as usize] {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => Some(p),
                    Some(None) => None,
                    Some(Some(cur)) => intersect(&idom, cur, p, forward),
                });
            }
            // A node with no predecessors hangs off the virtual root.
            let resolved = new_idom.unwrap_or(None);
            if !computed[v] || idom[v] != resolved {
                idom[v] = resolved;
                computed[v] = true;
                changed = true;
            }
        }
    }

    let mut depth = vec![0u32; len];
    for v in order {
        depth[v] = match idom[v] {
            Some(p) => depth[p as usize] + 1,
            None => 1,
        };
    }
    DomTree { idom, depth }
}

/// Dominators: every path from the sources to `v` passes through its
/// dominators.
pub fn dominators(prog: &Prog) -> DomTree {
    let len = prog.len();
    let preds: Vec<Vec<u32>> = prog
        .values
        .iter()
        .map(|v| v.args.iter().map(|a| a.0).collect())
        .collect();
    build(len, 0..len, &preds)
}

/// Postdominators: every path from `v` to the sink passes through them.
pub fn postdominators(prog: &Prog) -> DomTree {
    let len = prog.len();
    let mut succs: Vec<Vec<u32>> = vec![Vec::new(); len];
    for (i, v) in prog.values.iter().enumerate() {
        for a in &v.args {
            succs[a.0 as usize].push(i as u32);
        }
    }
    build(len, (0..len).rev(), &succs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::{Builder, OpKind, Type};

    fn diamond() -> (Prog, ValueId, ValueId, ValueId, ValueId) {
        // x -> (l, r) -> j; classic diamond, no side edges.
        let mut b = Builder::new();
        let mem = b.init_mem();
        let x = b.push(OpKind::ConstInt(1), vec![], Type::Int);
        let l = b.push(OpKind::ArithImmI(crate::ssa::ArithOp::Add, 1), vec![x], Type::Int);
        let r = b.push(OpKind::ArithImmI(crate::ssa::ArithOp::Mul, 2), vec![x], Type::Int);
        let j = b.push(OpKind::ArithI(crate::ssa::ArithOp::Add), vec![l, r], Type::Int);
        let c = b.push(OpKind::CmpImmI(crate::ssa::CmpOp::Gt, 0), vec![j], Type::Mask);
        b.ret_bool(mem, c);
        (b.finish(), x, l, r, j)
    }

    #[test]
    fn diamond_dominance() {
        let (prog, x, l, r, j) = diamond();
        let dom = dominators(&prog);
        assert!(dom.dominates(x, j));
        assert!(dom.dominates(x, l));
        assert!(!dom.dominates(l, j));
        assert!(!dom.dominates(r, j));
        assert_eq!(dom.idom(j), Some(x));
    }

    #[test]
    fn diamond_postdominance() {
        let (prog, x, l, r, j) = diamond();
        let pdom = postdominators(&prog);
        assert!(pdom.dominates(j, x));
        assert!(pdom.dominates(j, l));
        assert!(pdom.dominates(j, r));
        assert!(!pdom.dominates(l, x));
        assert_eq!(pdom.idom(x), Some(j));
    }

    #[test]
    fn sources_hang_off_the_root() {
        let (prog, x, ..) = diamond();
        let dom = dominators(&prog);
        assert_eq!(dom.idom(x), None);
        assert_eq!(dom.depth(x), 1);
    }
}
