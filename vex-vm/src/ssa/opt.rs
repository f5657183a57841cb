//! The SSA optimizer: declarative peephole rules to a fixed point,
//! common-subexpression elimination, and dead-value pruning.
//!
//! Each rule either forwards a value to an existing one or rewrites it into
//! a strictly simpler form (fewer operands, or a constant folded into an
//! immediate), so the worklist terminates.

use hashbrown::HashMap;

use vex_types::Composer;

use super::{ArithOp, OpKind, Prog, Type, ValueId};

#[cfg(test)]
use super::CmpOp;

/// What a rule wants done with a value.
enum Action {
    /// Replace every use with another value.
    Forward(ValueId),
    /// Rewrite the value in place.
    Rewrite(OpKind, Vec<ValueId>),
}

type Rule = (&'static str, fn(&Prog, ValueId) -> Option<Action>);

/// The peephole rule set, applied to a fixed point.
static RULES: &[Rule] = &[
    ("and-identity", rule_and_identity),
    ("and-false", rule_and_false),
    ("and-self", rule_and_self),
    ("and-own-mask", rule_and_own_mask),
    ("or-identity", rule_or_identity),
    ("xor-self", rule_xor_self),
    ("xor-init", rule_xor_init),
    ("fold-imm", rule_fold_imm),
    ("imm-identity", rule_imm_identity),
    ("agg-false-mask", rule_agg_false_mask),
    ("box-const", rule_box_const),
];

fn kind_of(p: &Prog, id: ValueId) -> &OpKind {
    &p.value(id).kind
}

/// The mask operand an op consumes, for kinds where the convention holds.
fn mask_arg(p: &Prog, id: ValueId) -> Option<ValueId> {
    let v = p.value(id);
    match v.kind {
        OpKind::CmpI(_)
        | OpKind::CmpImmI(_, _)
        | OpKind::CmpF(_)
        | OpKind::CmpImmF(_, _)
        | OpKind::CmpEqV
        | OpKind::CmpLitStr(_, _, _)
        | OpKind::TypeIs(_)
        | OpKind::CheckTag(_)
        | OpKind::StrTest(_, _, _)
        | OpKind::Like { .. }
        | OpKind::HashMember(_) => v.args.last().copied(),
        _ => None,
    }
}

// and(init, x) -> x and and(x, init) -> x
fn rule_and_identity(p: &Prog, id: ValueId) -> Option<Action> {
    let v = p.value(id);
    if v.kind != OpKind::MaskAnd {
        return None;
    }
    let (a, b) = (v.args[0], v.args[1]);
    if *kind_of(p, a) == OpKind::KInit {
        return Some(Action::Forward(b));
    }
    if *kind_of(p, b) == OpKind::KInit {
        return Some(Action::Forward(a));
    }
    None
}

// and with a false operand is false
fn rule_and_false(p: &Prog, id: ValueId) -> Option<Action> {
    let v = p.value(id);
    if v.kind != OpKind::MaskAnd {
        return None;
    }
    let (a, b) = (v.args[0], v.args[1]);
    if *kind_of(p, a) == OpKind::KFalse {
        return Some(Action::Forward(a));
    }
    if *kind_of(p, b) == OpKind::KFalse {
        return Some(Action::Forward(b));
    }
    None
}

// and(x, x) -> x
fn rule_and_self(p: &Prog, id: ValueId) -> Option<Action> {
    let v = p.value(id);
    if v.kind == OpKind::MaskAnd && v.args[0] == v.args[1] {
        return Some(Action::Forward(v.args[0]));
    }
    None
}

// and(a, b) where a was computed under mask b -> a
fn rule_and_own_mask(p: &Prog, id: ValueId) -> Option<Action> {
    let v = p.value(id);
    if v.kind != OpKind::MaskAnd {
        return None;
    }
    let (a, b) = (v.args[0], v.args[1]);
    if mask_arg(p, a) == Some(b) {
        return Some(Action::Forward(a));
    }
    if mask_arg(p, b) == Some(a) {
        return Some(Action::Forward(b));
    }
    None
}

// or(false, x) -> x, or(x, false) -> x, or(x, x) -> x
fn rule_or_identity(p: &Prog, id: ValueId) -> Option<Action> {
    let v = p.value(id);
    if v.kind != OpKind::MaskOr {
        return None;
    }
    let (a, b) = (v.args[0], v.args[1]);
    if a == b || *kind_of(p, b) == OpKind::KFalse {
        return Some(Action::Forward(a));
    }
    if *kind_of(p, a) == OpKind::KFalse {
        return Some(Action::Forward(b));
    }
    None
}

// xor(x, x) -> false
fn rule_xor_self(p: &Prog, id: ValueId) -> Option<Action> {
    let v = p.value(id);
    if v.kind == OpKind::MaskXor && v.args[0] == v.args[1] {
        return Some(Action::Rewrite(OpKind::KFalse, vec![]));
    }
    None
}

// xor(x, init) -> andn(x, init): complement under the live lanes
fn rule_xor_init(p: &Prog, id: ValueId) -> Option<Action> {
    let v = p.value(id);
    if v.kind != OpKind::MaskXor {
        return None;
    }
    let (a, b) = (v.args[0], v.args[1]);
    if *kind_of(p, b) == OpKind::KInit {
        return Some(Action::Rewrite(OpKind::MaskAndn, vec![a, b]));
    }
    if *kind_of(p, a) == OpKind::KInit {
        return Some(Action::Rewrite(OpKind::MaskAndn, vec![b, a]));
    }
    None
}

// Fold broadcast constants into immediate-operand forms.
fn rule_fold_imm(p: &Prog, id: ValueId) -> Option<Action> {
    let v = p.value(id);
    match &v.kind {
        OpKind::ArithF(op) => {
            let (a, b, mask) = (v.args[0], v.args[1], v.args[2]);
            if let OpKind::ConstFloat(c) = kind_of(p, b) {
                return Some(Action::Rewrite(OpKind::ArithImmF(*op, *c), vec![a, mask]));
            }
            if commutes(*op) {
                if let OpKind::ConstFloat(c) = kind_of(p, a) {
                    return Some(Action::Rewrite(OpKind::ArithImmF(*op, *c), vec![b, mask]));
                }
            }
            None
        }
        OpKind::ArithI(op) => {
            let (a, b, mask) = (v.args[0], v.args[1], v.args[2]);
            if let OpKind::ConstInt(c) = kind_of(p, b) {
                return Some(Action::Rewrite(OpKind::ArithImmI(*op, *c), vec![a, mask]));
            }
            if commutes(*op) {
                if let OpKind::ConstInt(c) = kind_of(p, a) {
                    return Some(Action::Rewrite(OpKind::ArithImmI(*op, *c), vec![b, mask]));
                }
            }
            None
        }
        OpKind::CmpF(op) => {
            let (a, b, mask) = (v.args[0], v.args[1], v.args[2]);
            if let OpKind::ConstFloat(c) = kind_of(p, b) {
                return Some(Action::Rewrite(OpKind::CmpImmF(*op, *c), vec![a, mask]));
            }
            if let OpKind::ConstFloat(c) = kind_of(p, a) {
                return Some(Action::Rewrite(
                    OpKind::CmpImmF(op.swapped(), *c),
                    vec![b, mask],
                ));
            }
            None
        }
        OpKind::CmpI(op) => {
            let (a, b, mask) = (v.args[0], v.args[1], v.args[2]);
            if let OpKind::ConstInt(c) = kind_of(p, b) {
                return Some(Action::Rewrite(OpKind::CmpImmI(*op, *c), vec![a, mask]));
            }
            if let OpKind::ConstInt(c) = kind_of(p, a) {
                return Some(Action::Rewrite(
                    OpKind::CmpImmI(op.swapped(), *c),
                    vec![b, mask],
                ));
            }
            None
        }
        _ => None,
    }
}

fn commutes(op: ArithOp) -> bool {
    matches!(
        op,
        ArithOp::Add
            | ArithOp::Mul
            | ArithOp::Min
            | ArithOp::Max
            | ArithOp::BitAnd
            | ArithOp::BitOr
            | ArithOp::BitXor
    )
}

// add_imm(x, 0) -> x, mul_imm(x, 1) -> x, and friends
fn rule_imm_identity(p: &Prog, id: ValueId) -> Option<Action> {
    let v = p.value(id);
    let fire = match &v.kind {
        OpKind::ArithImmI(ArithOp::Add, 0)
        | OpKind::ArithImmI(ArithOp::Sub, 0)
        | OpKind::ArithImmI(ArithOp::Mul, 1)
        | OpKind::ArithImmI(ArithOp::BitOr, 0)
        | OpKind::ArithImmI(ArithOp::BitXor, 0)
        | OpKind::ArithImmI(ArithOp::Sll, 0)
        | OpKind::ArithImmI(ArithOp::Srl, 0)
        | OpKind::ArithImmI(ArithOp::Sra, 0) => true,
        OpKind::ArithImmF(op, c) => {
            let c = c.get();
            (matches!(op, ArithOp::Add | ArithOp::Sub) && c == 0.0)
                || (matches!(op, ArithOp::Mul | ArithOp::Div) && c == 1.0)
        }
        _ => false,
    };
    if fire {
        Some(Action::Forward(v.args[0]))
    } else {
        None
    }
}

// An aggregate under an all-false mask is its memory input.
fn rule_agg_false_mask(p: &Prog, id: ValueId) -> Option<Action> {
    let v = p.value(id);
    match v.kind {
        OpKind::Agg(_, _) | OpKind::AggSlot(_, _) => {
            let mask = *v.args.last().expect("aggregates carry a mask");
            if *kind_of(p, mask) == OpKind::KFalse {
                return Some(Action::Forward(v.args[0]));
            }
            None
        }
        _ => None,
    }
}

// Boxing a broadcast constant is a literal reference.
fn rule_box_const(p: &Prog, id: ValueId) -> Option<Action> {
    let v = p.value(id);
    let src = match v.kind {
        OpKind::BoxF | OpKind::BoxI | OpKind::BoxTs => v.args[0],
        _ => return None,
    };
    let mut c = Composer::new();
    match (&v.kind, kind_of(p, src)) {
        (OpKind::BoxF, OpKind::ConstFloat(b)) => c.put_f64(b.get()),
        (OpKind::BoxI, OpKind::ConstInt(i)) => c.put_int(*i),
        (OpKind::BoxTs, OpKind::ConstTs(t)) => c.put_timestamp(*t),
        _ => return None,
    }
    Some(Action::Rewrite(OpKind::LitValue(c.take()), vec![]))
}

/// Optimize a program: peephole to a fixed point, CSE, prune dead values.
///
/// The result is a compacted program whose ids differ from the input's.
pub fn optimize(prog: &Prog) -> Prog {
    let mut p = prog.clone();
    let mut forward: Vec<ValueId> = p.ids().collect();

    fn find(forward: &mut [ValueId], id: ValueId) -> ValueId {
        let mut cur = id;
        while forward[cur.0 as usize] != cur {
            cur = forward[cur.0 as usize];
        }
        // Path compression.
        let mut walk = id;
        while forward[walk.0 as usize] != cur {
            let next = forward[walk.0 as usize];
            forward[walk.0 as usize] = cur;
            walk = next;
        }
        cur
    }

    let mut rounds = 0usize;
    loop {
        let mut changed = false;

        // Canonicalize operands through the forwarding map.
        for id in p.ids() {
            let args: Vec<ValueId> = p.value(id).args.clone();
            let canon: Vec<ValueId> = args.iter().map(|&a| find(&mut forward, a)).collect();
            if canon != args {
                p.value_mut(id).args = canon;
                changed = true;
            }
        }

        // Apply the rule table.
        for id in p.ids() {
            if find(&mut forward, id) != id {
                continue;
            }
            for (name, rule) in RULES {
                match rule(&p, id) {
                    Some(Action::Forward(target)) => {
                        let target = find(&mut forward, target);
                        tracing::trace!(rule = name, from = id.0, to = target.0, "peephole");
                        forward[id.0 as usize] = target;
                        changed = true;
                        break;
                    }
                    Some(Action::Rewrite(kind, args)) => {
                        tracing::trace!(rule = name, at = id.0, "peephole rewrite");
                        let v = p.value_mut(id);
                        v.kind = kind;
                        v.args = args;
                        changed = true;
                        break;
                    }
                    None => {}
                }
            }
        }

        // Value numbering over pure ops.
        let mut seen: HashMap<(OpKind, Vec<ValueId>), ValueId> = HashMap::new();
        for id in p.ids() {
            if find(&mut forward, id) != id {
                continue;
            }
            let v = p.value(id);
            if v.ty == Type::Mem {
                continue;
            }
            let key = (v.kind.clone(), v.args.clone());
            match seen.get(&key) {
                Some(&prior) => {
                    forward[id.0 as usize] = prior;
                    changed = true;
                }
                None => {
                    seen.insert(key, id);
                }
            }
        }

        rounds += 1;
        if !changed || rounds > 64 {
            break;
        }
    }

    // Final canonicalization then reachability prune from the sink.
    for id in p.ids() {
        let canon: Vec<ValueId> = p
            .value(id)
            .args
            .iter()
            .map(|&a| find(&mut forward, a))
            .collect();
        p.value_mut(id).args = canon;
    }
    let ret = find(&mut forward, p.ret.expect("program has no sink"));

    let mut live = vec![false; p.len()];
    let mut stack = vec![ret];
    while let Some(v) = stack.pop() {
        if std::mem::replace(&mut live[v.0 as usize], true) {
            continue;
        }
        stack.extend(p.value(v).args.iter().copied());
    }

    let mut remap: Vec<Option<ValueId>> = vec![None; p.len()];
    let mut out = Prog::default();
    for id in p.ids() {
        if !live[id.0 as usize] {
            continue;
        }
        let v = p.value(id);
        let args = v
            .args
            .iter()
            .map(|a| remap[a.0 as usize].expect("operands precede users"))
            .collect();
        let new_id = out.push(v.kind.clone(), args, v.ty);
        remap[id.0 as usize] = Some(new_id);
    }
    out.ret = Some(remap[ret.0 as usize].expect("sink is live"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::Builder;

    fn count_kind(p: &Prog, f: impl Fn(&OpKind) -> bool) -> usize {
        p.values.iter().filter(|v| f(&v.kind)).count()
    }

    #[test]
    fn identity_arithmetic_erases() {
        // add_imm(mul_imm(a, 1), 0) == a at the IR level.
        let mut b = Builder::new();
        let mask = b.row_mask();
        let mem = b.init_mem();
        let base = b.row_base();
        let field = b.load_field(base, "a", mask);
        let fm = b.mask_of(field);
        let a = b.push(OpKind::ToI64, vec![field, fm], Type::Int);
        let one = b.const_int(1);
        let zero = b.const_int(0);
        let mul = b.push(OpKind::ArithI(ArithOp::Mul), vec![a, one, mask], Type::Int);
        let add = b.push(OpKind::ArithI(ArithOp::Add), vec![mul, zero, mask], Type::Int);
        let cmp = b.push(OpKind::CmpImmI(CmpOp::Gt, 10), vec![add, mask], Type::Mask);
        b.ret_bool(mem, cmp);
        let opt = optimize(&b.finish());

        assert_eq!(count_kind(&opt, |k| matches!(k, OpKind::ArithI(_))), 0);
        assert_eq!(count_kind(&opt, |k| matches!(k, OpKind::ArithImmI(_, _))), 0);
        assert_eq!(count_kind(&opt, |k| matches!(k, OpKind::ConstInt(_))), 0);
        // The compare now consumes the unboxed field directly.
        let cmp = opt
            .values
            .iter()
            .find(|v| matches!(v.kind, OpKind::CmpImmI(CmpOp::Gt, 10)))
            .expect("compare survives");
        assert!(matches!(opt.value(cmp.args[0]).kind, OpKind::ToI64));
    }

    #[test]
    fn mask_identities() {
        let mut b = Builder::new();
        let mask = b.row_mask();
        let mem = b.init_mem();
        let f = b.false_mask();
        let or1 = b.or_mask(f, mask);
        let and1 = b.and_mask(or1, mask);
        let xor = b.xor_mask(and1, and1);
        let or2 = b.or_mask(xor, and1);
        b.ret_bool(mem, or2);
        let opt = optimize(&b.finish());

        // Everything folds down to the entry mask.
        assert_eq!(count_kind(&opt, |k| matches!(k, OpKind::MaskAnd | OpKind::MaskOr | OpKind::MaskXor)), 0);
        let ret = opt.value(opt.ret.unwrap());
        assert_eq!(opt.value(ret.args[1]).kind, OpKind::KInit);
    }

    #[test]
    fn cmp_against_const_becomes_imm_form() {
        let mut b = Builder::new();
        let mask = b.row_mask();
        let mem = b.init_mem();
        let base = b.row_base();
        let field = b.load_field(base, "x", mask);
        let fm = b.mask_of(field);
        let x = b.push(OpKind::ToI64, vec![field, fm], Type::Int);
        let three = b.const_int(3);
        // const < x, so the swapped form is gt.
        let cmp = b.push(OpKind::CmpI(CmpOp::Lt), vec![three, x, mask], Type::Mask);
        b.ret_bool(mem, cmp);
        let opt = optimize(&b.finish());

        assert_eq!(count_kind(&opt, |k| matches!(k, OpKind::CmpI(_))), 0);
        assert_eq!(
            count_kind(&opt, |k| matches!(k, OpKind::CmpImmI(CmpOp::Gt, 3))),
            1
        );
    }

    #[test]
    fn duplicate_subexpressions_collapse() {
        let mut b = Builder::new();
        let mask = b.row_mask();
        let mem = b.init_mem();
        let base = b.row_base();
        // The same predicate built twice, as duplicate FILTER clauses are.
        let mut masks = Vec::new();
        for _ in 0..2 {
            let field = b.load_field(base, "x", mask);
            let fm = b.mask_of(field);
            let x = b.push(OpKind::ToI64, vec![field, fm], Type::Int);
            let cmp = b.push(OpKind::CmpImmI(CmpOp::Gt, 0), vec![x, mask], Type::Mask);
            masks.push(cmp);
        }
        let both = b.and_mask(masks[0], masks[1]);
        b.ret_bool(mem, both);
        let opt = optimize(&b.finish());

        assert_eq!(count_kind(&opt, |k| matches!(k, OpKind::LoadField(_))), 1);
        assert_eq!(count_kind(&opt, |k| matches!(k, OpKind::CmpImmI(_, _))), 1);
        // and(x, x) folded away too.
        assert_eq!(count_kind(&opt, |k| matches!(k, OpKind::MaskAnd)), 0);
    }

    #[test]
    fn aggregates_under_false_masks_vanish() {
        use crate::agg::AggKind;
        let mut b = Builder::new();
        let mask = b.row_mask();
        let mem = b.init_mem();
        let x = b.const_float(1.0);
        let f = b.false_mask();
        let agg = b.push(OpKind::Agg(AggKind::SumF, 0), vec![mem, x, f], Type::Mem);
        let live = b.push(OpKind::Agg(AggKind::Count, 384), vec![agg, mask], Type::Mem);
        b.ret(live);
        let opt = optimize(&b.finish());

        assert_eq!(count_kind(&opt, |k| matches!(k, OpKind::Agg(AggKind::SumF, _))), 0);
        assert_eq!(count_kind(&opt, |k| matches!(k, OpKind::Agg(AggKind::Count, _))), 1);
    }

    #[test]
    fn boxed_constants_become_literals() {
        let mut b = Builder::new();
        let mask = b.row_mask();
        let mem = b.init_mem();
        let c = b.const_float(2.5);
        let boxed = b.push(OpKind::BoxF, vec![c, mask], Type::Value);
        let st = b.store(mem, 0, boxed, mask);
        b.ret(st);
        let opt = optimize(&b.finish());

        assert_eq!(count_kind(&opt, |k| matches!(k, OpKind::BoxF)), 0);
        assert_eq!(count_kind(&opt, |k| matches!(k, OpKind::LitValue(_))), 1);
    }
}
