//! shm-hashmap: a fixed-capacity, open-addressing hash table whose slots
//! live in POSIX shared memory, so independent processes can read and
//! mutate the same logical map without a broker process or a network
//! round-trip.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: one flat slot array in a shared segment, with every invariant
//!   kept local to a small layer so each piece can be reasoned about
//!   independently.
//! - Layers:
//!   - segment: POSIX shm plumbing (named `shm_open` objects and anonymous
//!     memfds), page-aligned sizing, RAII mappings, unlink-on-drop for the
//!     creator.
//!   - layout: the byte-level contract all processes agree on: a header
//!     (magic, layout version, widths, capacity, shared length counter)
//!     followed by fixed-width slot records; attach-time validation
//!     rejects any disagreement before it can corrupt data.
//!   - lock: optional cross-process exclusive lock on an agreed lock file,
//!     scoped acquisition with guaranteed release.
//!   - ShmHashMap: the public map: linear probing, backward-shift
//!     deletion, bounded lock-free reads, best-effort iteration.
//!
//! Constraints
//! - Capacity is fixed at creation; the table never grows, shrinks, or
//!   rehashes. A full table fails `set` rather than resizing.
//! - Keys and values are plain fixed-width payloads (`Shareable`): no
//!   pointers or process-local state may enter a slot.
//! - Every attaching process must agree on the segment name, capacity, key
//!   and value widths, hash-builder, and lock path. Widths and capacity
//!   are enforced through the header; the hash-builder and lock path are
//!   documented contract.
//!
//! Concurrency contract
//! - With a configured lock, mutating operations (`set`, `remove`,
//!   `clear`, bulk wrappers) each run as one cross-process critical
//!   section. Without one, the table performs no synchronization and
//!   racing writers can corrupt probe chains; choosing that mode is
//!   explicit in the builder, never a default.
//! - Reads (`get`, `contains_key`, `keys`, `iter`, `len`) never lock.
//!   Slot occupancy is published through an atomic `origin` word, so a
//!   reader racing a writer observes stale or torn *payload* at worst and
//!   every probe is bounded by one full wrap; readers cannot loop
//!   unboundedly or read out of range.
//! - Iteration is best-effort under concurrent mutation (it re-reads a
//!   yielded slot that a concurrent delete shifted a new entry into);
//!   `snapshot` collects a consistent view inside the lock instead.
//!
//! Deletion
//! - Removal never tombstones. The gap is closed by pulling a later entry
//!   of the same probe chain into it (legal only when the gap lies on that
//!   entry's own probe path, judged in circular order), cascading until a
//!   chain tail empties. Lookups therefore stay a single bounded probe for
//!   the table's whole lifetime, regardless of delete traffic.
//!
//! Notes and non-goals
//! - No persistence: segment contents live exactly as long as the shm
//!   object and its mappings.
//! - No linearizable reads; the lock serializes writers only.
//! - Unix-only: POSIX shared memory, memfds, and file locks.

mod layout;
mod lock;
mod segment;
mod shareable;
mod shm_hash_map;
mod shm_hash_map_proptest;

// Public surface
pub use lock::{FileLock, FileLockGuard};
pub use shareable::{FixedBytes, SeededState, Shareable};
pub use shm_hash_map::{Builder, Error, Iter, Keys, ShmHashMap};
