//! Pipeline operators and the chunked scan driver.
//!
//! A query is a chain of [`QuerySink`]s; each worker thread opens its own
//! [`RowConsumer`] down the whole chain, so per-worker state (compiled
//! programs, machines, scratch) is never shared. Shared operator state
//! (aggregate accumulators, sort runs, heaps) sits behind mutexes and is
//! merged at close.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vex_asm::Fault;
use vex_types::{
    decode_header, Composer, FieldIter, Kind, Symtab, VmRef, LANE_COUNT, LANE_PAD,
};

use crate::consts::{SCRATCH_DEFAULT_CAPACITY, SCRATCH_MAX_CAPACITY, SEGMENT_SIZE};
use crate::error::{VmError, VmResult};
use crate::interpreter::{ExecEnv, Machine, VReg};
use crate::memory::{PageBuf, PagePool, Window};
use crate::program::Program;

mod aggregate;
mod collect;
mod count;
mod cross;
mod filter;
mod order;
mod project;
mod topk;

pub use aggregate::{Aggregate, GroupAggregate, GroupRow};
pub use collect::Collector;
pub use count::Count;
pub use cross::Cross;
pub use filter::Filter;
pub use order::{Order, OrderKey, OrderSpec};
pub use project::Project;
pub use topk::TopKHeap;

/// An immutable batch of rows: encoded record bytes, the symbol table they
/// were encoded under, and one delimiter per row.
#[derive(Debug, Clone)]
pub struct Chunk {
    data: Arc<Vec<u8>>,
    symtab: Arc<Symtab>,
    delims: Vec<VmRef>,
}

impl Chunk {
    /// Assemble a chunk from parts; `data` must already carry lane padding.
    pub fn from_parts(data: Arc<Vec<u8>>, symtab: Arc<Symtab>, delims: Vec<VmRef>) -> Self {
        Self {
            data,
            symtab,
            delims,
        }
    }

    /// The record bytes (padding included).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the record bytes.
    pub fn data_arc(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.data)
    }

    /// The chunk's symbol table.
    pub fn symtab(&self) -> &Arc<Symtab> {
        &self.symtab
    }

    /// Row delimiters.
    pub fn delims(&self) -> &[VmRef] {
        &self.delims
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.delims.len()
    }

    /// A same-data chunk with a subset of rows.
    pub fn with_delims(&self, delims: Vec<VmRef>) -> Self {
        Self {
            data: Arc::clone(&self.data),
            symtab: Arc::clone(&self.symtab),
            delims,
        }
    }

    /// Bytes of one row.
    pub fn row(&self, i: usize) -> &[u8] {
        let r = self.delims[i];
        &self.data[r.offset() as usize..(r.offset() + r.len()) as usize]
    }
}

/// Incremental chunk writer.
#[derive(Debug, Default)]
pub struct ChunkBuilder {
    data: Vec<u8>,
    delims: Vec<VmRef>,
}

impl ChunkBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one encoded record.
    pub fn push_record(&mut self, bytes: &[u8]) -> VmResult<()> {
        let offset = self.data.len();
        if offset + bytes.len() + LANE_PAD > SEGMENT_SIZE {
            return Err(Fault::Oversized.into());
        }
        self.data.extend_from_slice(bytes);
        self.delims
            .push(VmRef::new(offset as u32, bytes.len() as u32));
        Ok(())
    }

    /// Rows pushed so far.
    pub fn rows(&self) -> usize {
        self.delims.len()
    }

    /// Finish under a symbol table, padding the data for lane-wide reads.
    pub fn finish(mut self, symtab: Arc<Symtab>) -> Chunk {
        self.data.extend_from_slice(&[0u8; LANE_PAD]);
        Chunk {
            data: Arc::new(self.data),
            symtab,
            delims: self.delims,
        }
    }
}

/// Cooperative cancellation observed between chunks.
#[derive(Debug, Default, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// `true` once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Per-worker consumer of a row stream.
pub trait RowConsumer: Send {
    /// Bind compiled state to a chunk's symbol table.
    fn symbolize(&mut self, symtab: &Arc<Symtab>) -> VmResult<()>;

    /// Consume one chunk.
    fn write_rows(&mut self, chunk: &Chunk) -> VmResult<()>;

    /// A segment boundary: the producer is done with the current run of
    /// same-table chunks. Stateless consumers ignore it.
    fn end_segment(&mut self) -> VmResult<()> {
        Ok(())
    }

    /// Flush and merge into shared operator state.
    fn close(self: Box<Self>) -> VmResult<()>;
}

/// A pipeline stage; `open` yields one consumer per worker.
pub trait QuerySink: Send + Sync {
    /// Open a thread-local writer.
    fn open(&self) -> VmResult<Box<dyn RowConsumer + '_>>;
}

/// A source that can push its chunks through a sink.
pub trait Table: Send + Sync {
    /// Push every chunk through `sink` using up to `parallelism` workers.
    fn write_chunks(
        &self,
        sink: &dyn QuerySink,
        parallelism: usize,
        cancel: &CancelToken,
    ) -> VmResult<()>;
}

/// An in-memory table of pre-built chunks.
#[derive(Debug, Default)]
pub struct MemTable {
    chunks: Vec<Chunk>,
}

impl MemTable {
    /// Table over the given chunks.
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    /// The chunks.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }
}

impl Table for MemTable {
    fn write_chunks(
        &self,
        sink: &dyn QuerySink,
        parallelism: usize,
        cancel: &CancelToken,
    ) -> VmResult<()> {
        let workers = parallelism.max(1).min(self.chunks.len().max(1));
        let next = AtomicUsize::new(0);
        let failure: Mutex<Option<VmError>> = Mutex::new(None);

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                let next = &next;
                let failure = &failure;
                handles.push(scope.spawn(move || {
                    let run = || -> VmResult<()> {
                        let mut consumer = sink.open()?;
                        loop {
                            if cancel.is_cancelled() {
                                return Err(VmError::Cancelled);
                            }
                            if failure.lock().expect("poisoned").is_some() {
                                break;
                            }
                            let i = next.fetch_add(1, Ordering::Relaxed);
                            let Some(chunk) = self.chunks.get(i) else {
                                break;
                            };
                            consumer.symbolize(chunk.symtab())?;
                            consumer.write_rows(chunk)?;
                        }
                        consumer.end_segment()?;
                        consumer.close()
                    };
                    if let Err(e) = run() {
                        failure.lock().expect("poisoned").get_or_insert(e);
                    }
                }));
            }
            for h in handles {
                if h.join().is_err() {
                    failure
                        .lock()
                        .expect("poisoned")
                        .get_or_insert(VmError::WorkerPanic);
                }
            }
        });

        match failure.into_inner().expect("poisoned").take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// One 16-lane group's context handed to operator callbacks.
pub(crate) struct GroupCtx<'a> {
    /// Delimiters of the rows in this group.
    pub delims: &'a [VmRef],
    /// Rows in this group (≤ 16).
    pub rows: usize,
    /// Index of the first row of the group within the chunk.
    pub base_row: usize,
}

/// A program plus the per-worker execution state to run it over chunks.
pub(crate) struct Runner {
    machine: Machine,
    scratch: PageBuf,
}

impl Runner {
    pub fn new(program: Program) -> Self {
        let capacity = program.scratch_demand().max(SCRATCH_DEFAULT_CAPACITY);
        let scratch = PagePool::global().get(capacity);
        Self {
            machine: Machine::new(program),
            scratch,
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Double the scratch arena; `false` once the ceiling is reached.
    pub fn grow_scratch(&mut self) -> bool {
        let current = self.scratch.len();
        if current >= SCRATCH_MAX_CAPACITY {
            return false;
        }
        self.scratch = PagePool::global().get((current * 2).min(SCRATCH_MAX_CAPACITY));
        true
    }

    /// Run the program over every 16-lane group of a chunk.
    ///
    /// On `MoreScratch` the chunk is abandoned mid-way and the retryable
    /// error surfaces; callers snapshot any cross-group state beforehand.
    pub fn run_chunk(
        &mut self,
        chunk: &Chunk,
        mut agg: Option<&mut Vec<u8>>,
        mut groups: Option<&mut crate::agg::GroupTable>,
        mut per_group: impl FnMut(
            &Machine,
            &Window<'_>,
            GroupCtx<'_>,
            Option<&mut crate::agg::GroupTable>,
        ) -> VmResult<()>,
    ) -> VmResult<()> {
        let literals = self.machine.program().literals_arc();
        let reserve = self.machine.program().scratch_reserve();
        let delims = chunk.delims();

        for (gidx, group) in delims.chunks(LANE_COUNT).enumerate() {
            let (base, mask) = row_base(chunk, group)?;
            let mut window =
                Window::new(chunk.data(), &literals, self.scratch.as_mut_slice(), reserve);
            {
                let mut env = ExecEnv {
                    window: &mut window,
                    agg: agg.as_mut().map(|v| &mut **v),
                    groups: groups.as_mut().map(|g| &mut **g),
                };
                self.machine.run_group(&mut env, &base, mask)?;
            }
            per_group(
                &self.machine,
                &window,
                GroupCtx {
                    delims: group,
                    rows: group.len(),
                    base_row: gidx * LANE_COUNT,
                },
                groups.as_mut().map(|g| &mut **g),
            )?;
        }
        Ok(())
    }
}

/// Build the row-base register for one group of delimiters.
fn row_base(chunk: &Chunk, group: &[VmRef]) -> VmResult<(VReg, u16)> {
    let mut base = VReg::default();
    let mut mask = 0u16;
    for (lane, &delim) in group.iter().enumerate() {
        let bytes = delim
            .slice(chunk.data())
            .ok_or(VmError::from(Fault::CorruptInput))?;
        let header = decode_header(bytes)?;
        if header.kind != Kind::Struct || header.null {
            continue;
        }
        let body = VmRef::new(
            delim.offset() + header.header_len as u32,
            header.body_len as u32,
        );
        base.set_lane(lane, body, bytes[0], 0);
        mask |= 1 << lane;
    }
    Ok((base, mask))
}

/// Append one output lane of a value register to a composer.
///
/// Lanes produced by the string kernels reference raw bytes with their
/// headers stripped; everything else keeps its original encoding.
pub(crate) fn append_lane(
    c: &mut Composer,
    window: &Window<'_>,
    vals: &VReg,
    lane: usize,
) -> VmResult<()> {
    let bytes = window
        .bytes(vals.lane(lane))
        .map_err(VmError::from)?;
    if vals.hlen[lane] > 0 {
        c.put_raw(bytes);
    } else {
        c.put_string_bytes(bytes);
    }
    Ok(())
}

/// Rewrite a record's symbol references through a merge mapping.
///
/// Callers skip the rewrite when the mapping is the identity.
pub(crate) fn remap_record(
    bytes: &[u8],
    mapping: &vex_types::SymbolMapping,
) -> VmResult<Vec<u8>> {
    let mut c = Composer::new();
    remap_value(&mut c, bytes, mapping)?;
    Ok(c.take())
}

fn remap_value(
    c: &mut Composer,
    bytes: &[u8],
    mapping: &vex_types::SymbolMapping,
) -> VmResult<()> {
    let header = decode_header(bytes)?;
    let body = &bytes[header.header_len..header.total_len()];
    match header.kind {
        Kind::Struct if !header.null => {
            c.begin_struct();
            for field in FieldIter::new(body) {
                let (sym, value) = field?;
                c.field(mapping.translate(sym)?);
                remap_value(c, value, mapping)?;
            }
            c.end();
        }
        Kind::List if !header.null => {
            c.begin_list();
            for value in vex_types::ValueIter::new(body) {
                remap_value(c, value?, mapping)?;
            }
            c.end();
        }
        _ => c.put_raw(&bytes[..header.total_len()]),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_builder_pads_and_delimits() {
        let mut st = Symtab::new();
        let sym = st.intern("a");
        let mut c = Composer::new();
        c.begin_struct();
        c.field(sym);
        c.put_uint(1);
        c.end();
        let rec = c.take();

        let mut cb = ChunkBuilder::new();
        cb.push_record(&rec).unwrap();
        cb.push_record(&rec).unwrap();
        let chunk = cb.finish(Arc::new(st));
        assert_eq!(chunk.rows(), 2);
        assert_eq!(chunk.row(0), &rec[..]);
        assert_eq!(chunk.row(1), &rec[..]);
        assert_eq!(chunk.data().len(), rec.len() * 2 + LANE_PAD);
    }

    #[test]
    fn remap_rewrites_nested_symbols() {
        let mut child = Symtab::new();
        let ca = child.intern("a");
        let cb_sym = child.intern("b");

        let mut parent = Symtab::new();
        parent.intern("b");
        let mapping = parent.merge(&child).unwrap();
        assert!(!mapping.is_identity());

        let mut c = Composer::new();
        c.begin_struct();
        c.field(ca);
        c.begin_struct();
        c.field(cb_sym);
        c.put_uint(7);
        c.end();
        c.end();
        let rec = c.take();

        let remapped = remap_record(&rec, &mapping).unwrap();
        let header = decode_header(&remapped).unwrap();
        let fields: Vec<_> = FieldIter::new(&remapped[header.header_len..header.total_len()])
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(fields[0].0, parent.lookup("a").unwrap());
        let inner_h = decode_header(fields[0].1).unwrap();
        let inner: Vec<_> = FieldIter::new(&fields[0].1[inner_h.header_len..])
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(inner[0].0, parent.lookup("b").unwrap());
    }
}
