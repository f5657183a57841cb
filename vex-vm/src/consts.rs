//! Engine-wide layout parameters.

use vex_asm::RegClass;

/// Canonical buffer size recycled through the page pool.
pub const PAGE_SIZE: usize = 1 << 20;

/// Trailing padding on every pooled buffer so a full 16-lane read anchored
/// at the last byte stays in bounds.
pub const PAGE_SLACK: usize = 16;

/// Size of one window segment; offsets within a segment fit in 30 bits.
pub const SEGMENT_SIZE: usize = 1 << 30;

/// Default scratch capacity for a fresh execution.
pub const SCRATCH_DEFAULT_CAPACITY: usize = 1 << 16;

/// Hard ceiling for scratch growth when retrying after `MoreScratch`.
pub const SCRATCH_MAX_CAPACITY: usize = SEGMENT_SIZE;

/// Block size of the sort arena's bump allocator.
pub const SORT_BLOCK_SIZE: usize = 1 << 20;

/// Bytes of one aggregation slot: 16 compensation lanes, 16 sum lanes,
/// 16 counter lanes.
pub const AGG_SLOT_SIZE: usize = 16 * 8 * 3;

/// Byte offset of the running-sum lanes within an aggregation slot.
pub const AGG_SUM_OFFSET: usize = 16 * 8;

/// Byte offset of the counter lanes within an aggregation slot.
pub const AGG_COUNT_OFFSET: usize = 16 * 8 * 2;

/// Most groups a single per-slot aggregation bank may hold.
pub const MAX_GROUPS: usize = 1 << 20;

static_assertions::const_assert!(PAGE_SIZE >= 1 << 16);
static_assertions::const_assert!(SEGMENT_SIZE <= u32::MAX as usize);
static_assertions::const_assert_eq!(AGG_SLOT_SIZE % 64, 0);
static_assertions::const_assert_eq!(RegClass::K.size(), 2);
static_assertions::const_assert_eq!(RegClass::S.size(), 128);
static_assertions::const_assert_eq!(RegClass::V.size(), 160);
static_assertions::const_assert_eq!(RegClass::H.size(), 256);
