//! In-memory layout of a shared table region: header, then slot array.
//!
//! Every process attaching to a segment must agree on this layout; the
//! header records what the creator used so an attacher with different
//! generics or expectations is rejected instead of corrupting the slots.

use crate::shareable::Shareable;
use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub(crate) const MAGIC: u64 = 0x5348_4d5f_4854_424c; // "SHM_HTBL"
pub(crate) const LAYOUT_VERSION: u32 = 1;

/// `origin` value marking an empty slot.
pub(crate) const EMPTY: i64 = -1;

/// Region header at offset 0.
///
/// The creator fills the plain fields and the slot array first and stores
/// `magic` last with Release ordering; attachers spin-check `magic` with
/// Acquire before trusting anything else.
#[repr(C)]
pub(crate) struct Header {
    pub magic: AtomicU64,
    pub version: u32,
    pub key_width: u32,
    pub value_width: u32,
    pub slot_width: u32,
    pub capacity: u64,
    pub len: AtomicU64,
}

/// One slot record, stored in place in the mapped region.
///
/// Interleaved AoS layout: every probe needs `origin` and `key` from the
/// same slot, so keeping the fields adjacent favors single-line fetches.
/// `origin == EMPTY` means the slot holds nothing; any other value is the
/// bucket index where the stored key's probe sequence began. `origin` is
/// atomic so a racing reader observes the old or the new occupancy word,
/// never a torn one; `key` and `value` are plain payload published by the
/// `origin` store.
#[repr(C)]
pub(crate) struct Slot<K, V> {
    pub origin: AtomicI64,
    pub key: K,
    pub value: V,
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// Byte offset of slot 0 within the region.
pub(crate) fn slots_offset<K: Shareable, V: Shareable>() -> usize {
    align_up(size_of::<Header>(), align_of::<Slot<K, V>>())
}

/// Minimum region length for a table of `capacity` slots.
pub(crate) fn region_len<K: Shareable, V: Shareable>(capacity: usize) -> usize {
    slots_offset::<K, V>() + capacity * size_of::<Slot<K, V>>()
}

impl Header {
    /// Validates this header against the attaching process's generics and
    /// expectations. Returns the table capacity on success, a description
    /// of the first disagreement otherwise.
    pub(crate) fn check<K: Shareable, V: Shareable>(
        &self,
        mapped_len: usize,
        expected_capacity: Option<usize>,
    ) -> Result<usize, String> {
        if self.magic.load(Ordering::Acquire) != MAGIC {
            return Err("segment is not an initialized shared table".into());
        }
        if self.version != LAYOUT_VERSION {
            return Err(format!(
                "segment uses layout version {}, this build speaks {}",
                self.version, LAYOUT_VERSION
            ));
        }
        if self.key_width as usize != size_of::<K>() {
            return Err(format!(
                "key width is {} bytes in the segment, {} in this process",
                self.key_width,
                size_of::<K>()
            ));
        }
        if self.value_width as usize != size_of::<V>() {
            return Err(format!(
                "value width is {} bytes in the segment, {} in this process",
                self.value_width,
                size_of::<V>()
            ));
        }
        if self.slot_width as usize != size_of::<Slot<K, V>>() {
            return Err(format!(
                "slot width is {} bytes in the segment, {} in this process",
                self.slot_width,
                size_of::<Slot<K, V>>()
            ));
        }
        let capacity = self.capacity as usize;
        if capacity == 0 {
            return Err("segment records a capacity of zero".into());
        }
        if let Some(expected) = expected_capacity {
            if expected != capacity {
                return Err(format!(
                    "segment capacity is {capacity}, this process expected {expected}"
                ));
            }
        }
        if region_len::<K, V>(capacity) > mapped_len {
            return Err(format!(
                "segment of {mapped_len} bytes is too small for capacity {capacity}"
            ));
        }
        Ok(capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for<K: Shareable, V: Shareable>(capacity: u64) -> Header {
        Header {
            magic: AtomicU64::new(MAGIC),
            version: LAYOUT_VERSION,
            key_width: size_of::<K>() as u32,
            value_width: size_of::<V>() as u32,
            slot_width: size_of::<Slot<K, V>>() as u32,
            capacity,
            len: AtomicU64::new(0),
        }
    }

    /// Invariant: slot 0 starts aligned for the slot type and the region
    /// length covers header plus every slot.
    #[test]
    fn offsets_are_aligned_and_sized() {
        let off = slots_offset::<u64, u64>();
        assert_eq!(off % align_of::<Slot<u64, u64>>(), 0);
        assert!(off >= size_of::<Header>());
        assert_eq!(
            region_len::<u64, u64>(10),
            off + 10 * size_of::<Slot<u64, u64>>()
        );

        // narrow payloads still align for the atomic origin
        assert_eq!(slots_offset::<u8, u8>() % align_of::<Slot<u8, u8>>(), 0);
    }

    /// Invariant: every header field that describes the layout is checked,
    /// and the matching header passes.
    #[test]
    fn check_accepts_match_and_names_first_mismatch() {
        let len = region_len::<u64, u32>(8);
        let h = header_for::<u64, u32>(8);
        assert_eq!(h.check::<u64, u32>(len, None), Ok(8));
        assert_eq!(h.check::<u64, u32>(len, Some(8)), Ok(8));

        let mut bad = header_for::<u64, u32>(8);
        bad.magic = AtomicU64::new(0);
        assert!(bad.check::<u64, u32>(len, None).unwrap_err().contains("not an initialized"));

        let mut bad = header_for::<u64, u32>(8);
        bad.version = LAYOUT_VERSION + 1;
        assert!(bad.check::<u64, u32>(len, None).unwrap_err().contains("layout version"));

        // attacher compiled with a different value type
        let h = header_for::<u64, u32>(8);
        assert!(h.check::<u64, u64>(region_len::<u64, u64>(8), None)
            .unwrap_err()
            .contains("value width"));

        let h = header_for::<u64, u32>(8);
        assert!(h.check::<u64, u32>(len, Some(16)).unwrap_err().contains("expected 16"));

        let h = header_for::<u64, u32>(0);
        assert!(h.check::<u64, u32>(len, None).unwrap_err().contains("zero"));

        let h = header_for::<u64, u32>(8);
        assert!(h.check::<u64, u32>(len - 1, None).unwrap_err().contains("too small"));
    }
}
