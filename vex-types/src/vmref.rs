/// A (offset, length) reference to bytes inside the vmm window.
///
/// Offsets are relative to the vmm base, so a reference always fits in a
/// packed `u64` and sixteen of them fill a single V register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VmRef {
    offset: u32,
    len: u32,
}

impl VmRef {
    /// The empty reference; decodes to an empty slice at the vmm base.
    pub const NULL: Self = Self { offset: 0, len: 0 };

    /// Create a reference from its parts.
    pub const fn new(offset: u32, len: u32) -> Self {
        Self { offset, len }
    }

    /// Base-relative byte offset.
    pub const fn offset(self) -> u32 {
        self.offset
    }

    /// Length of the referenced region in bytes.
    pub const fn len(self) -> u32 {
        self.len
    }

    /// `true` when the reference covers no bytes.
    pub const fn is_empty(self) -> bool {
        self.len == 0
    }

    /// Pack into a `u64` with the offset in the low half.
    pub const fn to_u64(self) -> u64 {
        (self.offset as u64) | ((self.len as u64) << 32)
    }

    /// Unpack from the representation produced by [`Self::to_u64`].
    pub const fn from_u64(raw: u64) -> Self {
        Self {
            offset: raw as u32,
            len: (raw >> 32) as u32,
        }
    }

    /// Resolve the reference against the vmm base slice.
    ///
    /// Out-of-window references resolve to `None` rather than panicking so
    /// that corrupt programs degrade into an error instead of a crash.
    pub fn slice(self, base: &[u8]) -> Option<&[u8]> {
        let start = self.offset as usize;
        let end = start.checked_add(self.len as usize)?;
        base.get(start..end)
    }

    /// Advance the reference by `n` bytes, shrinking it accordingly.
    pub const fn skip(self, n: u32) -> Self {
        let n = if n > self.len { self.len } else { n };
        Self {
            offset: self.offset.wrapping_add(n),
            len: self.len - n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_round_trip() {
        let r = VmRef::new(0xdead_beef, 0x1234);
        assert_eq!(VmRef::from_u64(r.to_u64()), r);
        assert_eq!(VmRef::from_u64(VmRef::NULL.to_u64()), VmRef::NULL);
    }

    #[test]
    fn slicing_checks_bounds() {
        let buf = [1u8, 2, 3, 4];
        assert_eq!(VmRef::new(1, 2).slice(&buf), Some(&buf[1..3]));
        assert_eq!(VmRef::new(3, 2).slice(&buf), None);
        assert_eq!(VmRef::new(u32::MAX, 1).slice(&buf), None);
    }

    #[test]
    fn skip_saturates() {
        let r = VmRef::new(10, 4);
        assert_eq!(r.skip(1), VmRef::new(11, 3));
        assert_eq!(r.skip(9), VmRef::new(14, 0));
    }
}
