//! The Where operator: keep rows whose predicate lanes are set.

use std::sync::Arc;

use vex_types::{Symtab, VmRef};

use super::{Chunk, QuerySink, RowConsumer, Runner};
use crate::error::VmResult;
use crate::expr::{compile_filter, Expr};
use crate::ssa::{CompiledExpr, Prog};

/// Filter stage; forwards surviving rows downstream.
pub struct Filter {
    ssa: Prog,
    next: Arc<dyn QuerySink>,
}

impl Filter {
    /// Compile a predicate into a filter stage.
    pub fn new(predicate: &Expr, next: Arc<dyn QuerySink>) -> VmResult<Self> {
        Ok(Self {
            ssa: compile_filter(predicate)?,
            next,
        })
    }
}

impl QuerySink for Filter {
    fn open(&self) -> VmResult<Box<dyn RowConsumer + '_>> {
        Ok(Box::new(FilterWriter {
            expr: CompiledExpr::new(self.ssa.clone()),
            runner: None,
            sig: None,
            inner: self.next.open()?,
        }))
    }
}

struct FilterWriter<'s> {
    expr: CompiledExpr,
    runner: Option<Runner>,
    sig: Option<u64>,
    inner: Box<dyn RowConsumer + 's>,
}

impl RowConsumer for FilterWriter<'_> {
    fn symbolize(&mut self, symtab: &Arc<Symtab>) -> VmResult<()> {
        let sig = symtab.signature();
        if self.sig != Some(sig) {
            let program = self.expr.symbolize(symtab)?.clone();
            self.runner = Some(Runner::new(program));
            self.sig = Some(sig);
        }
        // The filter passes rows through unchanged, symbol table included.
        self.inner.symbolize(symtab)
    }

    fn write_rows(&mut self, chunk: &Chunk) -> VmResult<()> {
        let runner = self.runner.as_mut().expect("symbolize before write_rows");
        let mut kept: Vec<VmRef> = Vec::with_capacity(chunk.rows());
        loop {
            kept.clear();
            let res = runner.run_chunk(chunk, None, None, |m, _w, g, _| {
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
                Err(e) if e.is_retryable() && runner.grow_scratch() => continue,
                Err(e) => return Err(e),
            }
        }
        tracing::trace!(rows = chunk.rows(), kept = kept.len(), "filter chunk");
        let filtered = chunk.with_delims(kept);
        self.inner.write_rows(&filtered)
    }

    fn end_segment(&mut self) -> VmResult<()> {
        self.inner.end_segment()
    }

    fn close(self: Box<Self>) -> VmResult<()> {
        self.inner.close()
    }
}
