//! Fixed-width payload contract for slots stored in process-shared memory.

use core::fmt;
use core::hash::BuildHasher;

/// Marker for plain, fixed-width payloads that may live directly inside a
/// shared slot array.
///
/// # Safety
///
/// Implementors must be inert data: no pointers, references, or any other
/// process-local indirection, and readable from any bit pattern another
/// process may have written concurrently. Only values and integer indices
/// cross the process boundary safely; an address from one process is garbage
/// in another.
pub unsafe trait Shareable: Copy + 'static {}

unsafe impl Shareable for u8 {}
unsafe impl Shareable for u16 {}
unsafe impl Shareable for u32 {}
unsafe impl Shareable for u64 {}
unsafe impl Shareable for u128 {}
unsafe impl Shareable for usize {}
unsafe impl Shareable for i8 {}
unsafe impl Shareable for i16 {}
unsafe impl Shareable for i32 {}
unsafe impl Shareable for i64 {}
unsafe impl Shareable for i128 {}
unsafe impl Shareable for isize {}
unsafe impl Shareable for f32 {}
unsafe impl Shareable for f64 {}
unsafe impl Shareable for () {}
unsafe impl<const N: usize> Shareable for [u8; N] {}

/// Bounded byte-string key: up to `N` bytes, zero-padded to a fixed width.
///
/// Two inputs that differ only in trailing NUL bytes compare equal, the
/// usual contract of fixed-width C-string fields.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct FixedBytes<const N: usize>([u8; N]);

impl<const N: usize> FixedBytes<N> {
    /// Builds a key from `bytes`, zero-padding up to `N`. Returns `None` if
    /// the input is longer than `N`.
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > N {
            return None;
        }
        let mut buf = [0u8; N];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self(buf))
    }

    /// The full zero-padded backing array.
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    /// The stored bytes with trailing zero padding stripped.
    pub fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        &self.0[..end]
    }
}

impl<const N: usize> From<[u8; N]> for FixedBytes<N> {
    fn from(buf: [u8; N]) -> Self {
        Self(buf)
    }
}

impl<const N: usize> fmt::Debug for FixedBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedBytes(b\"{}\")", self.trimmed().escape_ascii())
    }
}

unsafe impl<const N: usize> Shareable for FixedBytes<N> {}

/// Deterministic seed-fixed hash-builder, the crate default for `S`.
///
/// Every process attached to the same table must map a key to the same
/// bucket, so the default hasher cannot be per-process randomized the way
/// `std::collections::hash_map::RandomState` is. A custom `S` is part of the
/// attach contract: all processes must configure the same one.
#[derive(Clone)]
pub struct SeededState(ahash::RandomState);

impl SeededState {
    pub fn new() -> Self {
        Self(ahash::RandomState::with_seeds(
            0x9e37_79b9_7f4a_7c15,
            0xf39c_c060_5ced_c834,
            0x1082_276b_f3a2_7251,
            0x7109_87c8_5ea7_5d79,
        ))
    }
}

impl Default for SeededState {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildHasher for SeededState {
    type Hasher = ahash::AHasher;

    fn build_hasher(&self) -> Self::Hasher {
        self.0.build_hasher()
    }
}
