//! The Order operator: multi-chunk sorting with strategy selection.
//!
//! `Order::new` picks one of three strategies: a bounded top-K heap when a
//! limit is present, a single-column fast path when exactly one key and no
//! limit, and the general multi-column sort otherwise. Sort keys are
//! serialized into order-preserving bytes so the comparator is a plain
//! byte compare; descending columns complement their bytes.

use std::sync::{Arc, Mutex};

use vex_types::{read_f64, read_int, read_timestamp, Kind, Symtab, SymbolMapping};

use super::topk::TopK;
use super::{remap_record, Chunk, ChunkBuilder, QuerySink, RowConsumer, Runner};
use crate::consts::SORT_BLOCK_SIZE;
use crate::error::VmResult;
use crate::expr::{compile_projection, Expr};
use crate::interpreter::{AuxOut, VReg};
use crate::memory::Window;
use crate::ssa::{CompiledExpr, Prog};

/// One sort key.
#[derive(Debug, Clone)]
pub struct OrderKey {
    /// Key expression.
    pub expr: Expr,
    /// Sort descending.
    pub desc: bool,
}

/// An ordering request.
#[derive(Debug, Clone)]
pub struct OrderSpec {
    /// Keys, most significant first.
    pub keys: Vec<OrderKey>,
    /// `(limit, offset)` when the query is bounded.
    pub limit: Option<(usize, usize)>,
}

/// A sort-key column value captured for prefilter compilation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SortColVal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Ts(i64),
    Str(Vec<u8>),
    Other(Vec<u8>),
}

/// Decode one lane of a key column from its auxiliary output.
pub(crate) fn capture_col(
    window: &Window<'_>,
    aux: &AuxOut,
    lane: usize,
) -> VmResult<SortColVal> {
    if aux.mask & (1 << lane) == 0 {
        return Ok(SortColVal::Null);
    }
    let vals: &VReg = &aux.vals;
    let desc = vals.typel[lane];
    let kind = desc >> 4;
    if desc & 0x0f == 15 || kind == Kind::Null as u8 {
        return Ok(SortColVal::Null);
    }
    let body = window.bytes(vals.body(lane)).map_err(crate::error::VmError::from)?;
    Ok(match kind {
        k if k == Kind::Bool as u8 => SortColVal::Bool(desc & 0x0f == 1),
        k if k == Kind::Uint as u8 => SortColVal::Int(read_int(Kind::Uint, body)?),
        k if k == Kind::Int as u8 => SortColVal::Int(read_int(Kind::Int, body)?),
        k if k == Kind::Float as u8 => SortColVal::Float(read_f64(body)?),
        k if k == Kind::Timestamp as u8 => SortColVal::Ts(read_timestamp(body)?),
        k if k == Kind::String as u8 => SortColVal::Str(body.to_vec()),
        _ => SortColVal::Other(body.to_vec()),
    })
}

fn key_f64_bytes(v: f64) -> [u8; 8] {
    let b = v.to_bits();
    let m = if b >> 63 == 1 { !b } else { b | 1 << 63 };
    m.to_be_bytes()
}

fn key_i64_bytes(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1 << 63)).to_be_bytes()
}

/// Append one column's order-preserving bytes.
///
/// Numbers carry a fixed-width two-part payload: the rounded double first,
/// so integers and floats interleave, then the exact integer, so distinct
/// integers beyond double precision never collapse to one key.
pub(crate) fn encode_col(out: &mut Vec<u8>, val: &SortColVal, desc: bool) {
    let start = out.len();
    match val {
        SortColVal::Null => out.push(0x01),
        SortColVal::Bool(b) => {
            out.push(0x02);
            out.push(*b as u8);
        }
        SortColVal::Int(v) => {
            out.push(0x03);
            out.extend_from_slice(&key_f64_bytes(*v as f64));
            out.extend_from_slice(&key_i64_bytes(*v));
        }
        SortColVal::Float(v) => {
            out.push(0x03);
            out.extend_from_slice(&key_f64_bytes(*v));
            out.extend_from_slice(&key_i64_bytes(0));
        }
        SortColVal::Ts(v) => {
            out.push(0x04);
            out.extend_from_slice(&key_i64_bytes(*v));
        }
        SortColVal::Str(bytes) | SortColVal::Other(bytes) => {
            out.push(if matches!(val, SortColVal::Str(_)) {
                0x05
            } else {
                0x06
            });
            for &b in bytes {
                out.push(b);
                if b == 0 {
                    out.push(0xff);
                }
            }
            out.push(0);
            out.push(0);
        }
    }
    if desc {
        for b in &mut out[start..] {
            *b = !*b;
        }
    }
}

/// Bump allocator for sort runs: fixed-size blocks, no reuse.
#[derive(Debug, Default)]
pub(crate) struct SortArena {
    blocks: Vec<Vec<u8>>,
}

impl SortArena {
    fn push(&mut self, bytes: &[u8]) -> (u32, u32) {
        let need = bytes.len();
        let fits = self
            .blocks
            .last()
            .map_or(false, |b| b.len() + need <= b.capacity());
        if !fits {
            self.blocks
                .push(Vec::with_capacity(SORT_BLOCK_SIZE.max(need)));
        }
        let block = self.blocks.len() - 1;
        let buf = &mut self.blocks[block];
        let off = buf.len() as u32;
        buf.extend_from_slice(bytes);
        (block as u32, off)
    }

    fn get(&self, block: u32, off: u32, len: u32) -> &[u8] {
        &self.blocks[block as usize][off as usize..(off + len) as usize]
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    key_block: u32,
    key_off: u32,
    key_len: u32,
    rec_block: u32,
    rec_off: u32,
    rec_len: u32,
}

/// Per-record id plus its lone key, for the single-column fast path.
#[derive(Debug, Default)]
struct MixedColumn {
    keys: Vec<(Vec<u8>, u32)>,
    rows: Vec<Vec<u8>>,
}

enum SortState {
    Multi {
        arena: SortArena,
        entries: Vec<Entry>,
    },
    Single(MixedColumn),
}

/// The ordering stage.
pub enum Order {
    /// Unbounded sort.
    Full(FullOrder),
    /// Bounded: top-K heap with prefiltering.
    TopK(TopK),
}

impl Order {
    /// Select a strategy for the spec.
    pub fn new(spec: OrderSpec, next: Arc<dyn QuerySink>) -> VmResult<Self> {
        if spec.limit.is_some() {
            return Ok(Self::TopK(TopK::new(spec, next)?));
        }
        Ok(Self::Full(FullOrder::new(spec, next)?))
    }
}

impl QuerySink for Order {
    fn open(&self) -> VmResult<Box<dyn RowConsumer + '_>> {
        match self {
            Self::Full(op) => op.open(),
            Self::TopK(op) => op.open(),
        }
    }
}

/// Unbounded multi-chunk sort.
pub struct FullOrder {
    ssa: Prog,
    descs: Vec<bool>,
    shared: Arc<SortShared>,
}

struct SortShared {
    next: Arc<dyn QuerySink>,
    state: Mutex<SortState>,
    symtab: Mutex<Symtab>,
    open_writers: Mutex<usize>,
}

impl FullOrder {
    fn new(spec: OrderSpec, next: Arc<dyn QuerySink>) -> VmResult<Self> {
        let bindings: Vec<(String, Expr)> = spec
            .keys
            .iter()
            .map(|k| (String::new(), k.expr.clone()))
            .collect();
        let ssa = compile_projection(&bindings)?;
        let state = if spec.keys.len() == 1 {
            SortState::Single(MixedColumn::default())
        } else {
            SortState::Multi {
                arena: SortArena::default(),
                entries: Vec::new(),
            }
        };
        Ok(Self {
            ssa,
            descs: spec.keys.iter().map(|k| k.desc).collect(),
            shared: Arc::new(SortShared {
                next,
                state: Mutex::new(state),
                symtab: Mutex::new(Symtab::new()),
                open_writers: Mutex::new(0),
            }),
        })
    }
}

impl QuerySink for FullOrder {
    fn open(&self) -> VmResult<Box<dyn RowConsumer + '_>> {
        *self.shared.open_writers.lock().expect("poisoned") += 1;
        Ok(Box::new(FullOrderWriter {
            expr: CompiledExpr::new(self.ssa.clone()),
            runner: None,
            sig: None,
            mapping: None,
            descs: &self.descs,
            rows: Vec::new(),
            shared: &self.shared,
        }))
    }
}

struct FullOrderWriter<'s> {
    expr: CompiledExpr,
    runner: Option<Runner>,
    sig: Option<u64>,
    mapping: Option<SymbolMapping>,
    descs: &'s [bool],
    /// Locally accumulated `(key bytes, record bytes)` pairs.
    rows: Vec<(Vec<u8>, Vec<u8>)>,
    shared: &'s SortShared,
}

impl RowConsumer for FullOrderWriter<'_> {
    fn symbolize(&mut self, symtab: &Arc<Symtab>) -> VmResult<()> {
        let sig = symtab.signature();
        if self.sig != Some(sig) {
            let program = self.expr.symbolize(symtab)?.clone();
            self.runner = Some(Runner::new(program));
            self.sig = Some(sig);
            // Copy-on-merge: extend the master table under its mutex and
            // keep the remapping for this worker's records.
            let mut master = self.shared.symtab.lock().expect("poisoned");
            self.mapping = Some(master.merge(symtab)?);
        }
        Ok(())
    }

    fn write_rows(&mut self, chunk: &Chunk) -> VmResult<()> {
        let runner = self.runner.as_mut().expect("symbolize before write_rows");
        let mapping = self.mapping.as_ref().expect("symbolize before write_rows");
        let descs = self.descs;
        let start = self.rows.len();
        loop {
            self.rows.truncate(start);
            let rows = &mut self.rows;
            let res = runner.run_chunk(chunk, None, None, |m, w, g, _| {
                for lane in 0..g.rows {
                    let mut key = Vec::new();
                    for (j, desc) in descs.iter().enumerate() {
                        let col = capture_col(w, &m.aux(j), lane)?;
                        encode_col(&mut key, &col, *desc);
                    }
                    let rec = chunk.row(g.base_row + lane);
                    let rec = if mapping.is_identity() {
                        rec.to_vec()
                    } else {
                        remap_record(rec, mapping)?
                    };
                    rows.push((key, rec));
                }
                Ok(())
            });
            match res {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && runner.grow_scratch() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn close(self: Box<Self>) -> VmResult<()> {
        {
            let mut state = self.shared.state.lock().expect("poisoned");
            match &mut *state {
                SortState::Multi { arena, entries } => {
                    for (key, rec) in &self.rows {
                        let (key_block, key_off) = arena.push(key);
                        let (rec_block, rec_off) = arena.push(rec);
                        entries.push(Entry {
                            key_block,
                            key_off,
                            key_len: key.len() as u32,
                            rec_block,
                            rec_off,
                            rec_len: rec.len() as u32,
                        });
                    }
                }
                SortState::Single(col) => {
                    for (key, rec) in self.rows {
                        let id = col.rows.len() as u32;
                        col.rows.push(rec);
                        col.keys.push((key, id));
                    }
                }
            }
        }
        let remaining = {
            let mut open = self.shared.open_writers.lock().expect("poisoned");
            *open -= 1;
            *open
        };
        if remaining == 0 {
            finalize(self.shared)?;
        }
        Ok(())
    }
}

/// Last writer out: sort and emit the full run downstream.
fn finalize(shared: &SortShared) -> VmResult<()> {
    const EMIT_BATCH: usize = 1024;

    let symtab = Arc::new(shared.symtab.lock().expect("poisoned").clone());
    let mut state = shared.state.lock().expect("poisoned");
    let mut consumer = shared.next.open()?;
    consumer.symbolize(&symtab)?;

    let mut builder = ChunkBuilder::new();
    match &mut *state {
        SortState::Multi { arena, entries } => {
            entries.sort_by(|a, b| {
                arena
                    .get(a.key_block, a.key_off, a.key_len)
                    .cmp(arena.get(b.key_block, b.key_off, b.key_len))
            });
            for e in entries.iter() {
                builder.push_record(arena.get(e.rec_block, e.rec_off, e.rec_len))?;
                if builder.rows() >= EMIT_BATCH {
                    let chunk = std::mem::take(&mut builder).finish(Arc::clone(&symtab));
                    consumer.write_rows(&chunk)?;
                }
            }
        }
        SortState::Single(col) => {
            col.keys.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, id) in col.keys.iter() {
                builder.push_record(&col.rows[*id as usize])?;
                if builder.rows() >= EMIT_BATCH {
                    let chunk = std::mem::take(&mut builder).finish(Arc::clone(&symtab));
                    consumer.write_rows(&chunk)?;
                }
            }
        }
    }
    if builder.rows() > 0 {
        let chunk = builder.finish(Arc::clone(&symtab));
        consumer.write_rows(&chunk)?;
    }
    consumer.close()
}
