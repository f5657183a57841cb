//! The Cross operator: Cartesian product against a buffered right table.

use std::sync::Arc;

use vex_types::{decode_header, Symtab};

use super::{remap_record, Chunk, ChunkBuilder, QuerySink, RowConsumer};
use crate::error::VmResult;

/// Cross join; the right side is buffered in memory at build time.
pub struct Cross {
    right_rows: Vec<Vec<u8>>,
    right_symtab: Arc<Symtab>,
    next: Arc<dyn QuerySink>,
}

impl Cross {
    /// Buffer the right-side chunks.
    pub fn new(right: &[Chunk], next: Arc<dyn QuerySink>) -> VmResult<Self> {
        let mut symtab = Symtab::new();
        let mut rows = Vec::new();
        for chunk in right {
            let mapping = symtab.merge(chunk.symtab())?;
            for i in 0..chunk.rows() {
                let row = chunk.row(i);
                if mapping.is_identity() {
                    rows.push(row.to_vec());
                } else {
                    rows.push(remap_record(row, &mapping)?);
                }
            }
        }
        Ok(Self {
            right_rows: rows,
            right_symtab: Arc::new(symtab),
            next,
        })
    }
}

impl QuerySink for Cross {
    fn open(&self) -> VmResult<Box<dyn RowConsumer + '_>> {
        Ok(Box::new(CrossWriter {
            op: self,
            merged: None,
            sig: None,
            right_bodies: Vec::new(),
            inner: self.next.open()?,
        }))
    }
}

struct CrossWriter<'s> {
    op: &'s Cross,
    merged: Option<Arc<Symtab>>,
    sig: Option<u64>,
    /// Right rows' struct bodies, remapped into the merged table.
    right_bodies: Vec<Vec<u8>>,
    inner: Box<dyn RowConsumer + 's>,
}

impl RowConsumer for CrossWriter<'_> {
    fn symbolize(&mut self, symtab: &Arc<Symtab>) -> VmResult<()> {
        let sig = symtab.signature();
        if self.sig == Some(sig) {
            return Ok(());
        }
        self.sig = Some(sig);
        let mut merged = symtab.as_ref().clone();
        let mapping = merged.merge(&self.op.right_symtab)?;
        self.right_bodies = self
            .op
            .right_rows
            .iter()
            .map(|row| -> VmResult<Vec<u8>> {
                let row = if mapping.is_identity() {
                    row.clone()
                } else {
                    remap_record(row, &mapping)?
                };
                let header = decode_header(&row)?;
                Ok(row[header.header_len..header.total_len()].to_vec())
            })
            .collect::<VmResult<Vec<_>>>()?;
        let merged = Arc::new(merged);
        self.inner.symbolize(&merged)?;
        self.merged = Some(merged);
        Ok(())
    }

    fn write_rows(&mut self, chunk: &Chunk) -> VmResult<()> {
        let merged = self.merged.clone().expect("symbolize before write_rows");
        let mut builder = ChunkBuilder::new();
        let mut composer = vex_types::Composer::new();
        for i in 0..chunk.rows() {
            let left = chunk.row(i);
            let header = decode_header(left)?;
            let left_body = &left[header.header_len..header.total_len()];
            for right_body in &self.right_bodies {
                composer.begin_struct();
                composer.put_raw(left_body);
                composer.put_raw(right_body);
                composer.end();
                builder.push_record(&composer.take())?;
            }
        }
        self.inner.write_rows(&builder.finish(merged))
    }

    fn end_segment(&mut self) -> VmResult<()> {
        self.inner.end_segment()
    }

    fn close(self: Box<Self>) -> VmResult<()> {
        self.inner.close()
    }
}
