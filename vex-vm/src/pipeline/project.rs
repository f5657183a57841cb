//! The Projection operator: evaluate output bindings and re-serialize each
//! row under a dedicated output symbol table.

use std::sync::Arc;

use vex_types::{Composer, Symtab, SymbolId};

use super::{append_lane, Chunk, ChunkBuilder, QuerySink, RowConsumer, Runner};
use crate::error::VmResult;
use crate::expr::{compile_projection, Expr};
use crate::ssa::{CompiledExpr, Prog};

/// Projection stage: `SELECT label: expr, ...`.
pub struct Project {
    ssa: Prog,
    out_symtab: Arc<Symtab>,
    out_syms: Vec<SymbolId>,
    next: Arc<dyn QuerySink>,
}

impl Project {
    /// Compile projection bindings.
    pub fn new(bindings: &[(String, Expr)], next: Arc<dyn QuerySink>) -> VmResult<Self> {
        let ssa = compile_projection(bindings)?;
        let mut out_symtab = Symtab::new();
        let out_syms = bindings
            .iter()
            .map(|(label, _)| out_symtab.intern(label))
            .collect();
        Ok(Self {
            ssa,
            out_symtab: Arc::new(out_symtab),
            out_syms,
            next,
        })
    }
}

impl QuerySink for Project {
    fn open(&self) -> VmResult<Box<dyn RowConsumer + '_>> {
        Ok(Box::new(ProjectWriter {
            expr: CompiledExpr::new(self.ssa.clone()),
            runner: None,
            sig: None,
            out_symtab: Arc::clone(&self.out_symtab),
            out_syms: &self.out_syms,
            inner: self.next.open()?,
        }))
    }
}

struct ProjectWriter<'s> {
    expr: CompiledExpr,
    runner: Option<Runner>,
    sig: Option<u64>,
    out_symtab: Arc<Symtab>,
    out_syms: &'s [SymbolId],
    inner: Box<dyn RowConsumer + 's>,
}

impl RowConsumer for ProjectWriter<'_> {
    fn symbolize(&mut self, symtab: &Arc<Symtab>) -> VmResult<()> {
        let sig = symtab.signature();
        if self.sig != Some(sig) {
            let program = self.expr.symbolize(symtab)?.clone();
            self.runner = Some(Runner::new(program));
            self.sig = Some(sig);
        }
        // Downstream always sees the projection's own symbol table.
        self.inner.symbolize(&self.out_symtab)
    }

    fn write_rows(&mut self, chunk: &Chunk) -> VmResult<()> {
        let runner = self.runner.as_mut().expect("symbolize before write_rows");
        let out_syms = self.out_syms;
        let out = loop {
            let mut builder = ChunkBuilder::new();
            let mut composer = Composer::new();
            let res = runner.run_chunk(chunk, None, None, |m, w, g, _| {
                for lane in 0..g.rows {
                    composer.begin_struct();
                    for (i, &sym) in out_syms.iter().enumerate() {
                        let aux = m.aux(i);
                        if aux.mask & (1 << lane) != 0 {
                            composer.field(sym);
                            append_lane(&mut composer, w, &aux.vals, lane)?;
                        }
                    }
                    composer.end();
                    builder.push_record(&composer.take())?;
                }
                Ok(())
            });
            match res {
                Ok(()) => break builder.finish(Arc::clone(&self.out_symtab)),
                Err(e) if e.is_retryable() && runner.grow_scratch() => continue,
                Err(e) => return Err(e),
            }
        };
        self.inner.write_rows(&out)
    }

    fn end_segment(&mut self) -> VmResult<()> {
        self.inner.end_segment()
    }

    fn close(self: Box<Self>) -> VmResult<()> {
        self.inner.close()
    }
}
