//! A terminal sink that gathers all rows under one merged symbol table.

use std::sync::{Arc, Mutex};

use vex_types::{Symtab, SymbolMapping};

use super::{remap_record, Chunk, QuerySink, RowConsumer};
use crate::error::VmResult;

/// Collects every row it sees; mostly a test and tail-of-pipeline helper.
#[derive(Debug, Default)]
pub struct Collector {
    state: Mutex<CollectorState>,
}

#[derive(Debug, Default)]
struct CollectorState {
    symtab: Symtab,
    rows: Vec<Vec<u8>>,
}

impl Collector {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy of another collector's current contents.
    pub fn copy_of(other: &Collector) -> Self {
        let state = other.state.lock().expect("poisoned");
        Self {
            state: Mutex::new(CollectorState {
                symtab: state.symtab.clone(),
                rows: state.rows.clone(),
            }),
        }
    }

    /// Rows collected so far, re-encoded under the merged table.
    pub fn rows(&self) -> Vec<Vec<u8>> {
        self.state.lock().expect("poisoned").rows.clone()
    }

    /// Number of rows collected.
    pub fn row_count(&self) -> usize {
        self.state.lock().expect("poisoned").rows.len()
    }

    /// The merged symbol table.
    pub fn symtab(&self) -> Symtab {
        self.state.lock().expect("poisoned").symtab.clone()
    }
}

impl QuerySink for Collector {
    fn open(&self) -> VmResult<Box<dyn RowConsumer + '_>> {
        Ok(Box::new(CollectorWriter {
            shared: &self.state,
            mapping: None,
            rows: Vec::new(),
        }))
    }
}

struct CollectorWriter<'s> {
    shared: &'s Mutex<CollectorState>,
    mapping: Option<SymbolMapping>,
    rows: Vec<Vec<u8>>,
}

impl RowConsumer for CollectorWriter<'_> {
    fn symbolize(&mut self, symtab: &Arc<Symtab>) -> VmResult<()> {
        let mut shared = self.shared.lock().expect("poisoned");
        self.mapping = Some(shared.symtab.merge(symtab)?);
        Ok(())
    }

    fn write_rows(&mut self, chunk: &Chunk) -> VmResult<()> {
        let mapping = self.mapping.as_ref().expect("symbolize before write_rows");
        for i in 0..chunk.rows() {
            let row = chunk.row(i);
            if mapping.is_identity() {
                self.rows.push(row.to_vec());
            } else {
                self.rows.push(remap_record(row, mapping)?);
            }
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> VmResult<()> {
        let mut shared = self.shared.lock().expect("poisoned");
        shared.rows.extend(self.rows);
        Ok(())
    }
}
