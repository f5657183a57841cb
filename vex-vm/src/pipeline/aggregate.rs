//! The Aggregate operators: shared accumulator state updated under a
//! per-chunk mutex window, with a sticky error checked at close.

use std::sync::{Arc, Mutex};

use itertools::Itertools;
use vex_asm::Fault;
use vex_types::Symtab;

use super::{Chunk, QuerySink, RowConsumer, Runner};
use crate::agg::{AggBuffer, AggValue, GroupedAgg};
use crate::error::{VmError, VmResult};
use crate::expr::{compile_aggregates, compile_grouped, AggSpec, Expr};
use crate::interpreter::grouping::hash128;
use crate::ssa::{CompiledExpr, Prog};

/// Scalar aggregation over the whole stream.
pub struct Aggregate {
    specs: Vec<AggSpec>,
    ssa: Prog,
    shared: Arc<AggShared>,
}

struct AggShared {
    state: Mutex<AggBuffer>,
    sticky: Mutex<Option<Fault>>,
}

impl Aggregate {
    /// Compile the aggregate set.
    pub fn new(specs: Vec<AggSpec>) -> VmResult<Self> {
        let ssa = compile_aggregates(&specs)?;
        let kinds = specs.iter().map(|s| s.kind).collect();
        Ok(Self {
            specs,
            ssa,
            shared: Arc::new(AggShared {
                state: Mutex::new(AggBuffer::new(kinds)),
                sticky: Mutex::new(None),
            }),
        })
    }

    /// Finalized `(label, value)` pairs; fails if any worker faulted.
    pub fn results(&self) -> VmResult<Vec<(String, AggValue)>> {
        if let Some(fault) = *self.shared.sticky.lock().expect("poisoned") {
            return Err(fault.into());
        }
        let state = self.shared.state.lock().expect("poisoned");
        Ok(self
            .specs
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.label.clone(), state.finalize(i)))
            .collect_vec())
    }
}

impl QuerySink for Aggregate {
    fn open(&self) -> VmResult<Box<dyn RowConsumer + '_>> {
        Ok(Box::new(AggWriter {
            expr: CompiledExpr::new(self.ssa.clone()),
            runner: None,
            sig: None,
            shared: &self.shared,
        }))
    }
}

struct AggWriter<'s> {
    expr: CompiledExpr,
    runner: Option<Runner>,
    sig: Option<u64>,
    shared: &'s AggShared,
}

impl RowConsumer for AggWriter<'_> {
    fn symbolize(&mut self, symtab: &Arc<Symtab>) -> VmResult<()> {
        let sig = symtab.signature();
        if self.sig != Some(sig) {
            let program = self.expr.symbolize(symtab)?.clone();
            self.runner = Some(Runner::new(program));
            self.sig = Some(sig);
        }
        Ok(())
    }

    fn write_rows(&mut self, chunk: &Chunk) -> VmResult<()> {
        let runner = self.runner.as_mut().expect("symbolize before write_rows");
        // The mutex window spans one chunk, not one row.
        let mut state = self.shared.state.lock().expect("poisoned");
        let snapshot = state.clone();
        loop {
            let res = runner.run_chunk(chunk, Some(state.bytes_mut()), None, |_, _, _, _| Ok(()));
            match res {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && runner.grow_scratch() => {
                    *state = snapshot.clone();
                    continue;
                }
                Err(e) => {
                    *state = snapshot;
                    if let Some(fault) = e.fault() {
                        self.shared
                            .sticky
                            .lock()
                            .expect("poisoned")
                            .get_or_insert(fault);
                    }
                    return Err(e);
                }
            }
        }
    }

    fn close(self: Box<Self>) -> VmResult<()> {
        if let Some(fault) = *self.shared.sticky.lock().expect("poisoned") {
            return Err(fault.into());
        }
        Ok(())
    }
}

/// One output row of a grouped aggregation.
#[derive(Debug, Clone)]
pub struct GroupRow {
    /// Encoded key values, in group-by order.
    pub keys: Vec<Vec<u8>>,
    /// Finalized aggregates, in spec order.
    pub values: Vec<AggValue>,
}

/// Hash-grouped aggregation.
pub struct GroupAggregate {
    specs: Vec<AggSpec>,
    key_count: usize,
    ssa: Prog,
    shared: Arc<GroupShared>,
}

struct GroupShared {
    state: Mutex<GroupState>,
    sticky: Mutex<Option<Fault>>,
}

#[derive(Clone)]
struct GroupState {
    agg: GroupedAgg,
    /// First-seen encoded key bytes per slot.
    keys: Vec<Option<Vec<Vec<u8>>>>,
}

impl GroupAggregate {
    /// Compile group-by keys plus the aggregate set.
    pub fn new(group_by: Vec<Expr>, specs: Vec<AggSpec>) -> VmResult<Self> {
        let ssa = compile_grouped(&group_by, &specs)?;
        let kinds = specs.iter().map(|s| s.kind).collect();
        Ok(Self {
            key_count: group_by.len(),
            specs,
            ssa,
            shared: Arc::new(GroupShared {
                state: Mutex::new(GroupState {
                    agg: GroupedAgg::new(kinds),
                    keys: Vec::new(),
                }),
                sticky: Mutex::new(None),
            }),
        })
    }

    /// Finalized group rows, in first-seen order.
    pub fn results(&self) -> VmResult<Vec<GroupRow>> {
        if let Some(fault) = *self.shared.sticky.lock().expect("poisoned") {
            return Err(fault.into());
        }
        let state = self.shared.state.lock().expect("poisoned");
        let mut out = Vec::with_capacity(state.agg.table().len());
        for (slot, _) in state.agg.table().iter() {
            let keys = state.keys[slot as usize]
                .clone()
                .unwrap_or_else(|| vec![Vec::new(); self.key_count]);
            let values = (0..self.specs.len())
                .map(|j| state.agg.finalize(slot, j))
                .collect_vec();
            out.push(GroupRow { keys, values });
        }
        Ok(out)
    }
}

impl QuerySink for GroupAggregate {
    fn open(&self) -> VmResult<Box<dyn RowConsumer + '_>> {
        Ok(Box::new(GroupAggWriter {
            expr: CompiledExpr::new(self.ssa.clone()),
            runner: None,
            sig: None,
            key_count: self.key_count,
            shared: &self.shared,
        }))
    }
}

struct GroupAggWriter<'s> {
    expr: CompiledExpr,
    runner: Option<Runner>,
    sig: Option<u64>,
    key_count: usize,
    shared: &'s GroupShared,
}

impl RowConsumer for GroupAggWriter<'_> {
    fn symbolize(&mut self, symtab: &Arc<Symtab>) -> VmResult<()> {
        let sig = symtab.signature();
        if self.sig != Some(sig) {
            let program = self.expr.symbolize(symtab)?.clone();
            self.runner = Some(Runner::new(program));
            self.sig = Some(sig);
        }
        Ok(())
    }

    fn write_rows(&mut self, chunk: &Chunk) -> VmResult<()> {
        let runner = self.runner.as_mut().expect("symbolize before write_rows");
        let key_count = self.key_count;
        let mut state = self.shared.state.lock().expect("poisoned");
        let snapshot = state.clone();
        loop {
            let GroupState { agg, keys } = &mut *state;
            let (table, bank) = agg.split_mut();
            let res = runner.run_chunk(chunk, Some(bank), Some(table), |m, w, g, table| {
                let table = table.expect("group table bound");
                // Record first-seen key bytes for groups this batch created.
                let key_aux: Vec<_> = (0..key_count).map(|j| m.aux(j)).collect();
                let mask = key_aux.iter().fold(!0u16, |acc, a| acc & a.mask);
                for lane in 0..g.rows {
                    if mask & (1 << lane) == 0 {
                        continue;
                    }
                    let mut lane_keys = Vec::with_capacity(key_count);
                    let mut hash = 0u128;
                    for (j, aux) in key_aux.iter().enumerate() {
                        let bytes = w.bytes(aux.vals.lane(lane)).map_err(VmError::from)?;
                        hash = if j == 0 {
                            hash128(bytes, 0)
                        } else {
                            let seed = hash as u64 ^ (hash >> 64) as u64;
                            hash128(bytes, seed)
                        };
                        lane_keys.push(bytes.to_vec());
                    }
                    let slot = table.lookup_or_insert(hash).map_err(VmError::from)? as usize;
                    if keys.len() <= slot {
                        keys.resize(slot + 1, None);
                    }
                    keys[slot].get_or_insert(lane_keys);
                }
                Ok(())
            });
            match res {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && runner.grow_scratch() => {
                    *state = snapshot.clone();
                    continue;
                }
                Err(e) => {
                    *state = snapshot;
                    if let Some(fault) = e.fault() {
                        self.shared
                            .sticky
                            .lock()
                            .expect("poisoned")
                            .get_or_insert(fault);
                    }
                    return Err(e);
                }
            }
        }
    }

    fn close(self: Box<Self>) -> VmResult<()> {
        if let Some(fault) = *self.shared.sticky.lock().expect("poisoned") {
            return Err(fault.into());
        }
        Ok(())
    }
}
