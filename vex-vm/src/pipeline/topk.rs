//! Bounded ordering: a top-K heap with an adaptive compiled prefilter.
//!
//! The heap keeps the best `limit + offset` records by serialized sort key.
//! Once full, a predicate derived from the current worst record is compiled
//! and run over incoming chunks to drop lanes that cannot possibly enter the
//! heap. The predicate is conservative: lanes it cannot type-check are kept,
//! and any heap replacement invalidates it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use vex_types::{Symtab, SymbolMapping, VmRef};

use super::order::{capture_col, encode_col, OrderKey, OrderSpec, SortColVal};
use super::{remap_record, Chunk, ChunkBuilder, QuerySink, RowConsumer, Runner};
use crate::error::VmResult;
use crate::expr::{compile_projection, Expr, ExprCtx};
use crate::ssa::{Builder, CmpOp, CompiledExpr, OpKind, Prog, ValueId};

/// One record held by the heap.
#[derive(Debug, Clone)]
pub struct TopEntry {
    /// Order-preserving serialized sort key.
    pub key: Vec<u8>,
    /// Encoded record bytes (under the operator's master table).
    pub rec: Vec<u8>,
    /// Decoded key columns, for prefilter compilation.
    pub(crate) cols: Vec<SortColVal>,
}

impl PartialEq for TopEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.rec == other.rec
    }
}

impl Eq for TopEntry {}

impl PartialOrd for TopEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TopEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).then_with(|| self.rec.cmp(&other.rec))
    }
}

/// A bounded max-heap of the best records seen so far.
#[derive(Debug, Clone)]
pub struct TopKHeap {
    cap: usize,
    heap: BinaryHeap<TopEntry>,
}

impl TopKHeap {
    /// Heap bounded to `cap` records.
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            heap: BinaryHeap::with_capacity(cap.saturating_add(1)),
        }
    }

    /// Records currently held.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// `true` when no record is held.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// `true` once the heap reached its bound.
    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.cap
    }

    /// The worst record currently held (the one a newcomer must beat).
    pub fn worst(&self) -> Option<&TopEntry> {
        self.heap.peek()
    }

    /// Offer a record; `true` when it entered the heap.
    ///
    /// A full heap only accepts records strictly better than the worst.
    pub fn insert(&mut self, entry: TopEntry) -> bool {
        if self.cap == 0 {
            return false;
        }
        if !self.is_full() {
            self.heap.push(entry);
            return true;
        }
        let worst = self.heap.peek().expect("full heap is nonempty");
        if entry.cmp(worst) == Ordering::Less {
            self.heap.pop();
            self.heap.push(entry);
            return true;
        }
        false
    }

    /// Drain another heap into this one.
    ///
    /// Set-wise commutative, and merging a heap with a copy of itself is a
    /// no-op (duplicates lose against the incumbent's strictness rule once
    /// the bound is reached).
    pub fn merge(&mut self, other: TopKHeap) {
        for entry in other.heap.into_vec() {
            self.insert(entry);
        }
    }

    /// Ascending records, skipping the first `offset`.
    pub fn into_sorted(self, offset: usize) -> Vec<Vec<u8>> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .skip(offset)
            .map(|e| e.rec)
            .collect()
    }
}

/// The bounded ordering stage.
pub struct TopK {
    keys: Vec<OrderKey>,
    limit: usize,
    offset: usize,
    ssa: Prog,
    shared: Arc<TopKShared>,
}

struct TopKShared {
    next: Arc<dyn QuerySink>,
    state: Mutex<TopKHeap>,
    symtab: Mutex<Symtab>,
    open_writers: Mutex<usize>,
}

impl TopK {
    /// Build from an ordering spec with a limit.
    pub fn new(spec: OrderSpec, next: Arc<dyn QuerySink>) -> VmResult<Self> {
        let (limit, offset) = spec.limit.expect("top-k requires a limit");
        let bindings: Vec<(String, Expr)> = spec
            .keys
            .iter()
            .map(|k| (String::new(), k.expr.clone()))
            .collect();
        let ssa = compile_projection(&bindings)?;
        Ok(Self {
            keys: spec.keys,
            limit,
            offset,
            ssa,
            shared: Arc::new(TopKShared {
                next,
                state: Mutex::new(TopKHeap::new(limit + offset)),
                symtab: Mutex::new(Symtab::new()),
                open_writers: Mutex::new(0),
            }),
        })
    }
}

impl QuerySink for TopK {
    fn open(&self) -> VmResult<Box<dyn RowConsumer + '_>> {
        *self.shared.open_writers.lock().expect("poisoned") += 1;
        Ok(Box::new(TopKWriter {
            op: self,
            expr: CompiledExpr::new(self.ssa.clone()),
            runner: None,
            sig: None,
            symtab: None,
            mapping: None,
            heap: TopKHeap::new(self.limit + self.offset),
            prefilter: None,
            prefilter_fresh: false,
        }))
    }
}

struct TopKWriter<'s> {
    op: &'s TopK,
    expr: CompiledExpr,
    runner: Option<Runner>,
    sig: Option<u64>,
    symtab: Option<Arc<Symtab>>,
    mapping: Option<SymbolMapping>,
    heap: TopKHeap,
    prefilter: Option<Runner>,
    /// `false` once the heap top moved past the compiled predicate.
    prefilter_fresh: bool,
}

impl RowConsumer for TopKWriter<'_> {
    fn symbolize(&mut self, symtab: &Arc<Symtab>) -> VmResult<()> {
        let sig = symtab.signature();
        if self.sig != Some(sig) {
            let program = self.expr.symbolize(symtab)?.clone();
            self.runner = Some(Runner::new(program));
            self.sig = Some(sig);
            self.symtab = Some(Arc::clone(symtab));
            // The predicate embeds symbol ids; a rotated table invalidates it.
            self.prefilter = None;
            self.prefilter_fresh = false;
            let mut master = self.op.shared.symtab.lock().expect("poisoned");
            self.mapping = Some(master.merge(symtab)?);
        }
        Ok(())
    }

    fn write_rows(&mut self, chunk: &Chunk) -> VmResult<()> {
        self.refresh_prefilter()?;

        // Conservative short-circuit over whole lane groups.
        let candidate = match self.prefilter.as_mut() {
            Some(pf) => {
                let mut kept: Vec<VmRef> = Vec::with_capacity(chunk.rows());
                loop {
                    kept.clear();
                    let res = pf.run_chunk(chunk, None, None, |m, _w, g, _| {
                        let mask = m.out_mask();
                        for lane in 0..g.rows {
                            if mask & (1 << lane) != 0 {
                                kept.push(g.delims[lane]);
                            }
                        }
                        Ok(())
                    });
                    match res {
                        Ok(()) => break,
                        Err(e) if e.is_retryable() && pf.grow_scratch() => continue,
                        Err(e) => return Err(e),
                    }
                }
                chunk.with_delims(kept)
            }
            None => chunk.clone(),
        };
        if candidate.rows() == 0 {
            return Ok(());
        }

        let runner = self.runner.as_mut().expect("symbolize before write_rows");
        let mapping = self.mapping.as_ref().expect("symbolize before write_rows");
        let key_count = self.op.keys.len();
        let descs: Vec<bool> = self.op.keys.iter().map(|k| k.desc).collect();
        let snapshot = self.heap.clone();
        loop {
            let heap = &mut self.heap;
            let mut replaced = false;
            let res = runner.run_chunk(&candidate, None, None, |m, w, g, _| {
                for lane in 0..g.rows {
                    let mut key = Vec::new();
                    let mut cols = Vec::with_capacity(key_count);
                    for (j, desc) in descs.iter().enumerate() {
                        let col = capture_col(w, &m.aux(j), lane)?;
                        encode_col(&mut key, &col, *desc);
                        cols.push(col);
                    }
                    let rec = candidate.row(g.base_row + lane);
                    let rec = if mapping.is_identity() {
                        rec.to_vec()
                    } else {
                        remap_record(rec, mapping)?
                    };
                    let was_full = heap.is_full();
                    if heap.insert(TopEntry { key, rec, cols }) && was_full {
                        replaced = true;
                    }
                }
                Ok(())
            });
            match res {
                Ok(()) => {
                    if replaced {
                        self.prefilter_fresh = false;
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() && runner.grow_scratch() => {
                    self.heap = snapshot.clone();
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(self: Box<Self>) -> VmResult<()> {
        {
            let mut shared = self.op.shared.state.lock().expect("poisoned");
            shared.merge(self.heap);
        }
        let remaining = {
            let mut open = self.op.shared.open_writers.lock().expect("poisoned");
            *open -= 1;
            *open
        };
        if remaining == 0 {
            finalize(&self.op.shared, self.op.offset)?;
        }
        Ok(())
    }
}

impl TopKWriter<'_> {
    /// Compile the prefilter from the current heap top, when worthwhile.
    fn refresh_prefilter(&mut self) -> VmResult<()> {
        if !self.heap.is_full() || self.prefilter_fresh {
            return Ok(());
        }
        self.prefilter = None;
        self.prefilter_fresh = true;
        let worst = match self.heap.worst() {
            Some(w) => w,
            None => return Ok(()),
        };
        let Some(prog) = build_prefilter(&self.op.keys, &worst.cols)? else {
            // An unsupported key type skips prefiltering for this cycle.
            return Ok(());
        };
        let symtab = self.symtab.as_ref().expect("symbolize before write_rows");
        let mut expr = CompiledExpr::new(prog);
        let program = expr.symbolize(symtab)?.clone();
        self.prefilter = Some(Runner::new(program));
        Ok(())
    }
}

/// Build the lexicographic "strictly better than the current top" predicate.
///
/// Column-wise: better in column `i` under equality in columns `0..i`.
/// Lanes whose key columns cannot be typed are kept unconditionally, so the
/// predicate never drops a row that could enter the heap.
fn build_prefilter(keys: &[OrderKey], top: &[SortColVal]) -> VmResult<Option<Prog>> {
    // Bail out when there is nothing to compare, or when any column's top
    // value has no typed comparison.
    if keys.is_empty()
        || top.iter().any(|c| {
            matches!(
                c,
                SortColVal::Null | SortColVal::Bool(_) | SortColVal::Other(_)
            )
        })
    {
        return Ok(None);
    }

    let mut b = Builder::new();
    let mem = b.init_mem();
    let mut ctx = ExprCtx::new(&mut b);
    let entry = ctx.entry();

    let mut present = Vec::with_capacity(keys.len());
    let mut better = Vec::with_capacity(keys.len());
    let mut equal = Vec::with_capacity(keys.len());
    for (key, col) in keys.iter().zip(top) {
        let strict = if key.desc { CmpOp::Gt } else { CmpOp::Lt };
        let Some((p, lt, eq)) = column_compare(&mut ctx, &key.expr, col, strict)? else {
            return Ok(None);
        };
        present.push(p);
        better.push(lt);
        equal.push(eq);
    }

    // lex = OR_i (eq_0 & .. & eq_{i-1} & better_i)
    let mut lex: Option<ValueId> = None;
    for i in 0..keys.len() {
        let mut term = better[i];
        for &eq in &equal[..i] {
            term = ctx.b_mut().and_mask(eq, term);
        }
        lex = Some(match lex {
            Some(acc) => ctx.b_mut().or_mask(acc, term),
            None => term,
        });
    }
    let mut keep = lex.expect("at least one sort key");

    // Keep every lane whose key we could not type-check.
    for &p in &present {
        let absent = ctx.b_mut().andn_mask(p, entry);
        keep = ctx.b_mut().or_mask(keep, absent);
    }

    b.ret_bool(mem, keep);
    Ok(Some(b.finish()))
}

/// Typed `(present, strictly-better, equal)` masks for one column.
#[allow(clippy::type_complexity)]
fn column_compare(
    ctx: &mut ExprCtx<'_>,
    expr: &Expr,
    top: &SortColVal,
    strict: CmpOp,
) -> VmResult<Option<(ValueId, ValueId, ValueId)>> {
    match top {
        SortColVal::Int(v) => {
            let (lanes, mask) = ctx.num_int(expr)?;
            let lt = ctx.push_mask(OpKind::CmpImmI(strict, *v), vec![lanes, mask]);
            let eq = ctx.push_mask(OpKind::CmpImmI(CmpOp::Eq, *v), vec![lanes, mask]);
            Ok(Some((mask, lt, eq)))
        }
        SortColVal::Float(v) => {
            let (lanes, mask) = ctx.num_float(expr)?;
            let lt = ctx.push_mask(
                OpKind::CmpImmF(strict, crate::ssa::FBits::new(*v)),
                vec![lanes, mask],
            );
            let eq = ctx.push_mask(
                OpKind::CmpImmF(CmpOp::Eq, crate::ssa::FBits::new(*v)),
                vec![lanes, mask],
            );
            Ok(Some((mask, lt, eq)))
        }
        SortColVal::Ts(v) => {
            let (lanes, mask) = ctx.num_ts(expr)?;
            let lt = ctx.push_mask(OpKind::CmpImmI(strict, *v), vec![lanes, mask]);
            let eq = ctx.push_mask(OpKind::CmpImmI(CmpOp::Eq, *v), vec![lanes, mask]);
            Ok(Some((mask, lt, eq)))
        }
        SortColVal::Str(bytes) => {
            let Ok(s) = std::str::from_utf8(bytes) else {
                return Ok(None);
            };
            let (sv, mask) = ctx.str_value(expr)?;
            let lt = ctx.push_mask(
                OpKind::CmpLitStr(strict, crate::ssa::CaseMode::Sensitive, s.to_owned()),
                vec![sv, mask],
            );
            let eq = ctx.push_mask(
                OpKind::CmpLitStr(CmpOp::Eq, crate::ssa::CaseMode::Sensitive, s.to_owned()),
                vec![sv, mask],
            );
            Ok(Some((mask, lt, eq)))
        }
        SortColVal::Null | SortColVal::Bool(_) | SortColVal::Other(_) => Ok(None),
    }
}

/// Last writer out: emit the merged heap ascending, skipping the offset.
fn finalize(shared: &TopKShared, offset: usize) -> VmResult<()> {
    let symtab = Arc::new(shared.symtab.lock().expect("poisoned").clone());
    let heap = {
        let mut state = shared.state.lock().expect("poisoned");
        std::mem::replace(&mut *state, TopKHeap::new(0))
    };

    let mut consumer = shared.next.open()?;
    consumer.symbolize(&symtab)?;
    let mut builder = ChunkBuilder::new();
    for rec in heap.into_sorted(offset) {
        builder.push_record(&rec)?;
    }
    if builder.rows() > 0 {
        let chunk = builder.finish(symtab);
        consumer.write_rows(&chunk)?;
    }
    consumer.close()
}
