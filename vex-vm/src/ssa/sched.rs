//! Instruction scheduling: a deterministic postorder linearization.
//!
//! Operands are emitted before their users, which also serializes the
//! memory-token chain (tokens are ordinary operands). Memory joins are the
//! one place with real freedom: their inputs are unordered, so the deepest
//! postdominating subtree is scheduled first to retire its live values
//! early. The result is deterministic, so recompiling the same program
//! yields byte-identical code.

use super::{dom, OpKind, Prog, ValueId};

/// Emission order for a program with a sink.
pub fn schedule(prog: &Prog) -> Vec<ValueId> {
    let ret = prog.ret.expect("program has no sink");
    let pdom = dom::postdominators(prog);

    let mut order = Vec::with_capacity(prog.len());
    let mut state = vec![0u8; prog.len()]; // 0 unseen, 1 open, 2 done
    let mut stack: Vec<(ValueId, bool)> = vec![(ret, false)];

    while let Some((v, expanded)) = stack.pop() {
        let idx = v.0 as usize;
        if state[idx] == 2 {
            continue;
        }
        if expanded {
            state[idx] = 2;
            order.push(v);
            continue;
        }
        debug_assert_ne!(state[idx], 1, "value graph has a cycle");
        state[idx] = 1;
        stack.push((v, true));

        let value = prog.value(v);
        let mut args: Vec<ValueId> = value.args.clone();
        if matches!(value.kind, OpKind::MemMerge) {
            // Unordered join: deepest postdominator depth first.
            args.sort_by_key(|a| (pdom.depth(*a), a.0));
        }
        // Reverse so the first argument is expanded first.
        for &a in args.iter().rev() {
            if state[a.0 as usize] == 0 {
                stack.push((a, false));
            }
        }
    }

    debug_assert_eq!(*order.last().expect("nonempty schedule"), ret);
    debug_assert!(verify(prog, &order));
    order
}

/// Every operand is scheduled before its user.
fn verify(prog: &Prog, order: &[ValueId]) -> bool {
    let mut pos = vec![usize::MAX; prog.len()];
    for (i, v) in order.iter().enumerate() {
        pos[v.0 as usize] = i;
    }
    order.iter().all(|&v| {
        prog.value(v)
            .args
            .iter()
            .all(|a| pos[a.0 as usize] < pos[v.0 as usize])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::{ArithOp, Builder, CmpOp, Type};

    #[test]
    fn schedule_is_postorder_and_deterministic() {
        let build = || {
            let mut b = Builder::new();
            let mask = b.row_mask();
            let mem = b.init_mem();
            let x = b.const_int(2);
            let y = b.const_int(3);
            let s = b.push(OpKind::ArithI(ArithOp::Add), vec![x, y, mask], Type::Int);
            let c = b.push(OpKind::CmpImmI(CmpOp::Gt, 4), vec![s, mask], Type::Mask);
            b.ret_bool(mem, c);
            b.finish()
        };
        let p1 = build();
        let p2 = build();
        let s1 = schedule(&p1);
        assert_eq!(s1, schedule(&p2));
        assert_eq!(s1.last(), p1.ret.as_ref());
    }

    #[test]
    fn dead_values_are_not_scheduled() {
        let mut b = Builder::new();
        let mask = b.row_mask();
        let mem = b.init_mem();
        let _dead = b.const_int(42);
        b.ret_bool(mem, mask);
        let prog = b.finish();
        let order = schedule(&prog);
        assert_eq!(order.len(), 3);
    }
}
