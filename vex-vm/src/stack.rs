//! Slot assignment within a program's virtual value stacks.
//!
//! Two stacks are managed per compilation: the general stack holding K, L,
//! S, V and B registers, and a separate stack for 128-bit hash registers.
//! Offsets are 16-bit, bump allocations are 8-aligned, and freed slots are
//! reused LIFO per size class. Alignment waste from sub-8-byte classes is
//! split back into free slots of that class.

use hashbrown::HashMap;

use vex_asm::RegClass;
use vex_types::StackOffset;

use crate::error::CompileError;

const ALIGN: u32 = 8;

fn class_index(rc: RegClass) -> usize {
    match rc {
        RegClass::K => 0,
        RegClass::L => 1,
        RegClass::S => 2,
        RegClass::V => 3,
        RegClass::B => 4,
        RegClass::H => 5,
    }
}

/// Allocator for one program's value-stack slots.
#[derive(Debug, Default)]
pub struct StackAllocator {
    free: [Vec<StackOffset>; 6],
    reserved: Vec<(u32, u32)>,
    top: u32,
    hash_top: u32,
    by_value: HashMap<u32, StackOffset>,
}

impl StackAllocator {
    /// Fresh allocator with empty stacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a region for an externally provided input.
    ///
    /// Panics if the region was already handed out or reserved; reservations
    /// must happen before any allocation reaches their range.
    pub fn reserve(&mut self, rc: RegClass, offset: StackOffset) {
        assert_ne!(rc, RegClass::H, "hash registers cannot be reserved");
        let start = offset as u32;
        let end = start + rc.size() as u32;
        assert!(
            start >= self.top,
            "reserve of {rc:?} at {offset} overlaps allocated region"
        );
        let at = self.reserved.partition_point(|&(s, _)| s < start);
        let clear = self
            .reserved
            .get(at)
            .map_or(true, |&(s, _)| s >= end)
            && at
                .checked_sub(1)
                .and_then(|i| self.reserved.get(i))
                .map_or(true, |&(_, e)| e <= start);
        assert!(clear, "reserve of {rc:?} at {offset} overlaps a reservation");
        self.reserved.insert(at, (start, end));
    }

    fn bump(&mut self, rc: RegClass) -> Result<StackOffset, CompileError> {
        let size = rc.size() as u32;
        let mut at = (self.top + ALIGN - 1) & !(ALIGN - 1);
        // Skip over reserved regions.
        loop {
            let overlapping = self
                .reserved
                .iter()
                .find(|&&(s, e)| at < e && s < at + size.max(ALIGN));
            match overlapping {
                Some(&(_, e)) => at = (e + ALIGN - 1) & !(ALIGN - 1),
                None => break,
            }
        }
        let took = size.max(ALIGN);
        let end = at + took;
        if end > StackOffset::MAX as u32 + 1 {
            return Err(CompileError::SlotExhausted);
        }
        self.top = end;
        // Alignment waste is recycled as free slots of the same class.
        let mut spare = at + size;
        while spare + size <= end {
            self.free[class_index(rc)].push(spare as StackOffset);
            spare += size;
        }
        Ok(at as StackOffset)
    }

    /// Allocate a slot for a register of class `rc`.
    pub fn alloc(&mut self, rc: RegClass) -> Result<StackOffset, CompileError> {
        if rc == RegClass::H {
            if let Some(slot) = self.free[class_index(rc)].pop() {
                return Ok(slot);
            }
            let at = self.hash_top;
            let end = at + rc.size() as u32;
            if end > StackOffset::MAX as u32 + 1 {
                return Err(CompileError::SlotExhausted);
            }
            self.hash_top = end;
            return Ok(at as StackOffset);
        }
        if let Some(slot) = self.free[class_index(rc)].pop() {
            return Ok(slot);
        }
        self.bump(rc)
    }

    /// Return a slot to its class's free list.
    pub fn free(&mut self, rc: RegClass, slot: StackOffset) {
        self.free[class_index(rc)].push(slot);
    }

    /// Allocate and remember the slot under a value identifier.
    pub fn alloc_value(&mut self, rc: RegClass, id: u32) -> Result<StackOffset, CompileError> {
        let slot = self.alloc(rc)?;
        let prev = self.by_value.insert(id, slot);
        debug_assert!(prev.is_none(), "value {id} allocated twice");
        Ok(slot)
    }

    /// Release the slot recorded for a value identifier.
    pub fn free_value(&mut self, rc: RegClass, id: u32) {
        if let Some(slot) = self.by_value.remove(&id) {
            self.free(rc, slot);
        }
    }

    /// The slot recorded for a value identifier.
    pub fn slot_of(&self, id: u32) -> Option<StackOffset> {
        self.by_value.get(&id).copied()
    }

    /// Bytes of general stack the program needs at runtime.
    pub fn stack_size(&self) -> usize {
        let reserved_end = self.reserved.last().map_or(0, |&(_, e)| e);
        self.top.max(reserved_end) as usize
    }

    /// Bytes of hash stack the program needs at runtime.
    pub fn hash_size(&self) -> usize {
        self.hash_top as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn mask_allocs_split_their_block() {
        let mut a = StackAllocator::new();
        let first = a.alloc(RegClass::K).unwrap();
        assert_eq!(first, 0);
        // The 8-byte block yields three more mask slots before the top moves.
        let next: Vec<_> = (0..3).map(|_| a.alloc(RegClass::K).unwrap()).collect();
        assert_eq!(next, vec![6, 4, 2]);
        assert_eq!(a.stack_size(), 8);
        assert_eq!(a.alloc(RegClass::K).unwrap(), 8);
    }

    #[test]
    fn free_slots_reuse_lifo() {
        let mut a = StackAllocator::new();
        let s0 = a.alloc(RegClass::S).unwrap();
        let s1 = a.alloc(RegClass::S).unwrap();
        a.free(RegClass::S, s0);
        a.free(RegClass::S, s1);
        assert_eq!(a.alloc(RegClass::S).unwrap(), s1);
        assert_eq!(a.alloc(RegClass::S).unwrap(), s0);
    }

    #[test]
    fn reservations_are_skipped() {
        let mut a = StackAllocator::new();
        a.reserve(RegClass::K, 0);
        a.reserve(RegClass::B, 8);
        let v = a.alloc(RegClass::V).unwrap();
        assert!(v as usize >= 8 + RegClass::B.size());
        assert!(a.stack_size() >= v as usize + RegClass::V.size());
    }

    #[test]
    #[should_panic(expected = "overlaps a reservation")]
    fn overlapping_reservations_panic() {
        let mut a = StackAllocator::new();
        a.reserve(RegClass::B, 8);
        a.reserve(RegClass::K, 10);
    }

    #[test]
    fn hash_slots_live_on_their_own_stack() {
        let mut a = StackAllocator::new();
        let h0 = a.alloc(RegClass::H).unwrap();
        let s0 = a.alloc(RegClass::S).unwrap();
        let h1 = a.alloc(RegClass::H).unwrap();
        assert_eq!(h0, 0);
        assert_eq!(s0, 0);
        assert_eq!(h1 as usize, RegClass::H.size());
        assert_eq!(a.hash_size(), 2 * RegClass::H.size());
    }

    #[test]
    fn value_map_round_trips() {
        let mut a = StackAllocator::new();
        let slot = a.alloc_value(RegClass::V, 42).unwrap();
        assert_eq!(a.slot_of(42), Some(slot));
        a.free_value(RegClass::V, 42);
        assert_eq!(a.slot_of(42), None);
        assert_eq!(a.alloc(RegClass::V).unwrap(), slot);
    }

    /// Live slots of one class never alias, whatever the alloc/free order.
    #[quickcheck]
    fn live_slots_never_alias(ops: Vec<u8>) -> bool {
        let mut a = StackAllocator::new();
        let mut live: Vec<(RegClass, StackOffset)> = Vec::new();
        for op in ops {
            let rc = match op % 4 {
                0 => RegClass::K,
                1 => RegClass::S,
                2 => RegClass::V,
                _ => RegClass::B,
            };
            if op & 0x80 != 0 && !live.is_empty() {
                let (rc, slot) = live.swap_remove(op as usize % live.len());
                a.free(rc, slot);
            } else if let Ok(slot) = a.alloc(rc) {
                live.push((rc, slot));
            }
        }
        for (i, &(rc_a, s_a)) in live.iter().enumerate() {
            let a_range = s_a as usize..s_a as usize + rc_a.size();
            for &(rc_b, s_b) in &live[i + 1..] {
                let b_range = s_b as usize..s_b as usize + rc_b.size();
                if a_range.start < b_range.end && b_range.start < a_range.end {
                    return false;
                }
            }
        }
        true
    }
}
