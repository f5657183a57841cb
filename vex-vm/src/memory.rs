//! VM memory: the segmented reference window and the page pool.
//!
//! Value references are 32-bit window offsets so sixteen of them pack into a
//! single V register. The window is segmented: chunk bytes, interned program
//! literals and the per-execution scratch arena each occupy a fixed 1 GiB
//! span of the offset space, and every access bounds-checks against the
//! segment it names. Buffers handed to the engine are padded with
//! [`PAGE_SLACK`] so unaligned 16-lane reads off the end stay in bounds.

use std::sync::{Arc, Mutex, OnceLock};

use vex_asm::Fault;
use vex_types::VmRef;

use crate::consts::{PAGE_SIZE, PAGE_SLACK, SEGMENT_SIZE};

/// Segments of the reference window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// The current chunk's record bytes.
    Chunk,
    /// The program's interned literal bytes.
    Literals,
    /// The per-execution scratch arena.
    Scratch,
}

impl Segment {
    /// Base window offset of the segment.
    pub const fn base(self) -> u32 {
        match self {
            Self::Chunk => 0,
            Self::Literals => SEGMENT_SIZE as u32,
            Self::Scratch => 2 * SEGMENT_SIZE as u32,
        }
    }

    fn of(offset: u32) -> Self {
        match offset as usize / SEGMENT_SIZE {
            0 => Self::Chunk,
            1 => Self::Literals,
            _ => Self::Scratch,
        }
    }
}

/// Build a window reference into a segment; fails `Oversized` when the
/// byte range does not fit the segment's span.
pub fn segment_ref(seg: Segment, offset: usize, len: usize) -> Result<VmRef, Fault> {
    let end = offset.checked_add(len).ok_or(Fault::Oversized)?;
    if end > SEGMENT_SIZE {
        return Err(Fault::Oversized);
    }
    Ok(VmRef::new(seg.base() + offset as u32, len as u32))
}

/// Pool of zero-cleared, slack-padded page buffers for reuse.
///
/// Buffers of the canonical page size are recycled when dropped; anything
/// larger goes back to the general allocator.
#[derive(Default, Clone)]
pub struct PagePool {
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl PagePool {
    /// The process-wide pool.
    pub fn global() -> &'static PagePool {
        static POOL: OnceLock<PagePool> = OnceLock::new();
        POOL.get_or_init(PagePool::default)
    }

    /// Take a zeroed buffer of at least `len` usable bytes (plus slack).
    pub fn get(&self, len: usize) -> PageBuf {
        let want = len + PAGE_SLACK;
        let mut data = if want <= PAGE_SIZE + PAGE_SLACK {
            let mut pool = self.pool.lock().expect("poisoned");
            pool.pop().unwrap_or_default()
        } else {
            Vec::new()
        };
        data.clear();
        data.resize(want, 0);
        PageBuf {
            data,
            pool: self.clone(),
        }
    }

    /// Drop all pooled buffers.
    pub fn shutdown(&self) {
        self.pool.lock().expect("poisoned").clear();
    }

    fn recycle(&self, mut data: Vec<u8>) {
        if data.capacity() >= PAGE_SIZE + PAGE_SLACK {
            data.clear();
            let mut pool = self.pool.lock().expect("poisoned");
            if pool.len() < 64 {
                pool.push(data);
            }
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.pool.lock().expect("poisoned").len()
    }
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool").finish_non_exhaustive()
    }
}

/// A zeroed buffer originating from a [`PagePool`]; recycled on drop.
#[derive(Debug)]
pub struct PageBuf {
    data: Vec<u8>,
    pool: PagePool,
}

impl PageBuf {
    /// Usable length, slack excluded.
    pub fn len(&self) -> usize {
        self.data.len().saturating_sub(PAGE_SLACK)
    }

    /// `true` when no usable bytes are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The buffer including its slack padding.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view including the slack padding.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PageBuf {
    fn drop(&mut self) {
        self.pool.recycle(std::mem::take(&mut self.data));
    }
}

/// The per-execution view the VM resolves references against.
///
/// Chunk and literal bytes are read-only; the scratch arena is written
/// through a bump cursor that resets to the reserved prefix on every entry.
pub struct Window<'a> {
    chunk: &'a [u8],
    literals: &'a [u8],
    scratch: &'a mut [u8],
    scratch_len: usize,
    scratch_reserve: usize,
}

impl<'a> Window<'a> {
    /// Assemble a window. `scratch` arrives zeroed; its length is the
    /// scratch capacity.
    pub fn new(chunk: &'a [u8], literals: &'a [u8], scratch: &'a mut [u8], reserve: usize) -> Self {
        debug_assert!(reserve <= scratch.len());
        Self {
            chunk,
            literals,
            scratch,
            scratch_len: reserve,
            scratch_reserve: reserve,
        }
    }

    /// Reset the scratch cursor to the reserved prefix.
    pub fn reset_scratch(&mut self) {
        self.scratch_len = self.scratch_reserve;
    }

    /// Current scratch cursor.
    pub fn scratch_len(&self) -> usize {
        self.scratch_len
    }

    /// Resolve a reference to its bytes.
    ///
    /// References into unwritten scratch or past a segment's populated end
    /// are corrupt programs, not memory errors.
    pub fn bytes(&self, r: VmRef) -> Result<&[u8], Fault> {
        let seg = Segment::of(r.offset());
        let off = (r.offset() - seg.base()) as usize;
        let end = off.checked_add(r.len() as usize).ok_or(Fault::CorruptInput)?;
        let backing = match seg {
            Segment::Chunk => self.chunk,
            Segment::Literals => self.literals,
            Segment::Scratch => &self.scratch[..self.scratch_len],
        };
        backing.get(off..end).ok_or(Fault::CorruptInput)
    }

    /// Reserve `n` scratch bytes, returning the window offset of the region.
    ///
    /// Fails with `MoreScratch` when capacity is exhausted; the reserved
    /// prefix is never handed out again, so a failing allocation cannot
    /// clobber it.
    pub fn alloc_scratch(&mut self, n: usize) -> Result<u32, Fault> {
        let start = self.scratch_len;
        let end = start.checked_add(n).ok_or(Fault::MoreScratch)?;
        if end > self.scratch.len().saturating_sub(PAGE_SLACK) {
            return Err(Fault::MoreScratch);
        }
        self.scratch_len = end;
        Ok(Segment::Scratch.base() + start as u32)
    }

    /// Mutable access to a region previously returned by
    /// [`Self::alloc_scratch`].
    pub fn scratch_mut(&mut self, window_off: u32, len: usize) -> &mut [u8] {
        let off = (window_off - Segment::Scratch.base()) as usize;
        &mut self.scratch[off..off + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_buffers_recycle() {
        let pool = PagePool::default();
        let buf = pool.get(PAGE_SIZE);
        assert_eq!(buf.len(), PAGE_SIZE);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        drop(buf);
        assert_eq!(pool.pooled(), 1);

        // Reused buffer comes back zeroed.
        let again = pool.get(100);
        assert_eq!(pool.pooled(), 0);
        assert!(again.as_slice().iter().all(|&b| b == 0));

        // Oversized buffers are not pooled.
        drop(pool.get(4 * PAGE_SIZE));
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn segment_refs_stay_in_bounds() {
        assert!(segment_ref(Segment::Chunk, 0, 10).is_ok());
        assert_eq!(
            segment_ref(Segment::Chunk, SEGMENT_SIZE - 4, 8),
            Err(Fault::Oversized)
        );
        let r = segment_ref(Segment::Literals, 8, 4).unwrap();
        assert_eq!(r.offset(), SEGMENT_SIZE as u32 + 8);
    }

    #[test]
    fn window_resolves_per_segment() {
        let chunk = [1u8; 32];
        let lits = [2u8; 16];
        let mut scratch = vec![0u8; 64 + PAGE_SLACK];
        let mut w = Window::new(&chunk, &lits, &mut scratch, 8);

        let r = segment_ref(Segment::Chunk, 4, 8).unwrap();
        assert_eq!(w.bytes(r).unwrap(), &[1u8; 8][..]);

        let r = segment_ref(Segment::Literals, 0, 16).unwrap();
        assert_eq!(w.bytes(r).unwrap(), &[2u8; 16][..]);

        // Scratch below the cursor resolves, above it does not.
        let off = w.alloc_scratch(8).unwrap();
        w.scratch_mut(off, 8).copy_from_slice(&[7u8; 8]);
        assert_eq!(w.bytes(VmRef::new(off, 8)).unwrap(), &[7u8; 8][..]);
        let beyond = VmRef::new(Segment::Scratch.base() + 60, 4);
        assert_eq!(w.bytes(beyond), Err(Fault::CorruptInput));
    }

    #[test]
    fn scratch_exhaustion_reports_more_scratch() {
        let chunk = [0u8; 0];
        let lits = [0u8; 0];
        let mut scratch = vec![0u8; 32 + PAGE_SLACK];
        let mut w = Window::new(&chunk, &lits, &mut scratch, 4);

        assert!(w.alloc_scratch(28).is_ok());
        assert_eq!(w.alloc_scratch(1), Err(Fault::MoreScratch));
        // The reserved prefix survives the failed allocation.
        w.reset_scratch();
        assert_eq!(w.scratch_len(), 4);
    }
}
