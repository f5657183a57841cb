//! The Count operator: popcount of returned masks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use vex_types::Symtab;

use super::{Chunk, QuerySink, RowConsumer, Runner};
use crate::error::VmResult;
use crate::expr::{compile_filter, Expr};
use crate::ssa::{CompiledExpr, Prog};

/// Terminal row-count sink; atomic when driven in parallel.
pub struct Count {
    ssa: Prog,
    total: AtomicU64,
}

impl Count {
    /// Count rows matching `predicate` (all rows when `None`).
    pub fn new(predicate: Option<&Expr>) -> VmResult<Self> {
        let always = Expr::Bool(true);
        Ok(Self {
            ssa: compile_filter(predicate.unwrap_or(&always))?,
            total: AtomicU64::new(0),
        })
    }

    /// The accumulated count.
    pub fn value(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl QuerySink for Count {
    fn open(&self) -> VmResult<Box<dyn RowConsumer + '_>> {
        Ok(Box::new(CountWriter {
            expr: CompiledExpr::new(self.ssa.clone()),
            runner: None,
            sig: None,
            local: 0,
            total: &self.total,
        }))
    }
}

struct CountWriter<'s> {
    expr: CompiledExpr,
    runner: Option<Runner>,
    sig: Option<u64>,
    local: u64,
    total: &'s AtomicU64,
}

impl RowConsumer for CountWriter<'_> {
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
        loop {
            let mut seen = 0u64;
            let res = runner.run_chunk(chunk, None, None, |m, _w, _g, _| {
                seen += m.out_mask().count_ones() as u64;
                Ok(())
            });
            match res {
                Ok(()) => {
                    self.local += seen;
                    return Ok(());
                }
                Err(e) if e.is_retryable() && runner.grow_scratch() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn close(self: Box<Self>) -> VmResult<()> {
        self.total.fetch_add(self.local, Ordering::Relaxed);
        Ok(())
    }
}
