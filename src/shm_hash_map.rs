//! ShmHashMap: a fixed-capacity, open-addressing hash table whose slots
//! live in a shared segment.

use crate::layout::{self, Header, Slot, EMPTY, LAYOUT_VERSION, MAGIC};
use crate::lock::{FileLock, FileLockGuard};
use crate::segment::{Mapping, Segment};
use crate::shareable::{SeededState, Shareable};
use core::hash::{BuildHasher, Hash};
use core::marker::PhantomData;
use core::mem::size_of;
use core::sync::atomic::AtomicI64;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::io;
use std::path::PathBuf;
use std::ptr;
use std::thread;
use std::time::Duration;
use thiserror::Error;

// How long `open_or_create` waits for a racing creator to publish the
// header before giving up.
const INIT_WAIT_MS: u32 = 100;

#[derive(Debug, Error)]
pub enum Error {
    /// `set` scanned every slot without finding the key or a hole. The
    /// table is unchanged; the caller must size capacity up front or evict.
    #[error("table full: all {capacity} slots occupied")]
    CapacityExceeded { capacity: usize },
    /// Construction-time or attach-time configuration disagreement.
    #[error("configuration mismatch: {0}")]
    Config(String),
    /// Shared-memory or lock-file syscall failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A hash table of fixed capacity stored in process-shared memory.
///
/// All slots live in one mapped region; cooperating processes attach to the
/// same segment by name and operate on the same logical map. Collisions are
/// resolved by linear probing, and deletion relocates later entries of the
/// probe chain into the gap instead of leaving a tombstone, so lookups stay
/// a single bounded scan for the table's whole lifetime.
///
/// Mutating operations (`set`, `remove`, `clear`, the bulk wrappers) run
/// inside the configured cross-process lock; without one the table performs
/// no synchronization at all and racing writers can corrupt the probe
/// chains. Read operations never lock: they may observe a mutation halfway
/// through, but every probe is bounded by one full wrap and slot occupancy
/// is published atomically, so a racing reader sees stale data at worst,
/// never an unbounded scan or an out-of-range access.
pub struct ShmHashMap<K, V, S = SeededState> {
    mapping: Mapping,
    // keeps the creator's name registered until drop
    _segment: Segment,
    capacity: usize,
    slots_offset: usize,
    hasher: S,
    lock: Option<FileLock>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> ShmHashMap<K, V>
where
    K: Shareable + Eq + Hash,
    V: Shareable,
{
    pub fn builder() -> Builder<K, V> {
        Builder {
            capacity: None,
            hasher: SeededState::new(),
            sync: None,
            initial: Vec::new(),
        }
    }
}

impl<K, V, S> ShmHashMap<K, V, S>
where
    K: Shareable + Eq + Hash,
    V: Shareable,
    S: BuildHasher + Clone + Default,
{
    fn format_fresh(
        segment: Segment,
        capacity: usize,
        hasher: S,
        lock: Option<FileLock>,
        initial: Vec<(K, V)>,
    ) -> Result<Self, Error> {
        let mapping = segment.map()?;
        let table = Self {
            mapping,
            _segment: segment,
            capacity,
            slots_offset: layout::slots_offset::<K, V>(),
            hasher,
            lock,
            _marker: PhantomData,
        };
        table.format();
        table.insert_pairs(initial)?;
        Ok(table)
    }

    fn attach(
        segment: Segment,
        expected_capacity: Option<usize>,
        hasher: S,
        lock: Option<FileLock>,
        initial: Vec<(K, V)>,
        wait_for_init: bool,
    ) -> Result<Self, Error> {
        if segment.len() < size_of::<Header>() {
            return Err(Error::Config(
                "segment too small to hold a table header".into(),
            ));
        }
        let mapping = segment.map()?;

        // The creator publishes the magic word last; a racing
        // `open_or_create` waits briefly for it.
        let magic = unsafe { &(*mapping.as_ptr().cast::<Header>()).magic };
        let mut waited = 0;
        while magic.load(Acquire) != MAGIC {
            if !wait_for_init || waited >= INIT_WAIT_MS {
                return Err(Error::Config(
                    "segment is not an initialized shared table".into(),
                ));
            }
            thread::sleep(Duration::from_millis(1));
            waited += 1;
        }

        let header = unsafe { &*mapping.as_ptr().cast::<Header>() };
        let capacity = match header.check::<K, V>(mapping.len(), expected_capacity) {
            Ok(capacity) => capacity,
            Err(msg) => {
                #[cfg(feature = "logging")]
                log::warn!("rejecting shared table attach: {msg}");
                return Err(Error::Config(msg));
            }
        };

        let table = Self {
            mapping,
            _segment: segment,
            capacity,
            slots_offset: layout::slots_offset::<K, V>(),
            hasher,
            lock,
            _marker: PhantomData,
        };
        table.insert_pairs(initial)?;
        Ok(table)
    }

    // Writes a fresh header and empty slot array. Plain header fields land
    // first; the magic word publishes them with Release.
    fn format(&self) {
        let hp = self.mapping.as_ptr().cast::<Header>();
        unsafe {
            ptr::addr_of_mut!((*hp).version).write(LAYOUT_VERSION);
            ptr::addr_of_mut!((*hp).key_width).write(size_of::<K>() as u32);
            ptr::addr_of_mut!((*hp).value_width).write(size_of::<V>() as u32);
            ptr::addr_of_mut!((*hp).slot_width).write(size_of::<Slot<K, V>>() as u32);
            ptr::addr_of_mut!((*hp).capacity).write(self.capacity as u64);
        }
        self.header().len.store(0, Relaxed);
        for i in 0..self.capacity {
            self.origin(i).store(EMPTY, Relaxed);
        }
        self.header().magic.store(MAGIC, Release);
    }

    fn header(&self) -> &Header {
        unsafe { &*self.mapping.as_ptr().cast::<Header>() }
    }

    fn slot_ptr(&self, i: usize) -> *mut Slot<K, V> {
        debug_assert!(i < self.capacity);
        unsafe {
            self.mapping
                .as_ptr()
                .add(self.slots_offset)
                .cast::<Slot<K, V>>()
                .add(i)
        }
    }

    fn origin(&self, i: usize) -> &AtomicI64 {
        unsafe { &(*self.slot_ptr(i)).origin }
    }

    fn read_key(&self, i: usize) -> K {
        unsafe { ptr::addr_of!((*self.slot_ptr(i)).key).read() }
    }

    fn read_value(&self, i: usize) -> V {
        unsafe { ptr::addr_of!((*self.slot_ptr(i)).value).read() }
    }

    fn write_pair(&self, i: usize, key: K, value: V) {
        unsafe {
            let slot = self.slot_ptr(i);
            ptr::addr_of_mut!((*slot).key).write(key);
            ptr::addr_of_mut!((*slot).value).write(value);
        }
    }

    fn next_index(&self, i: usize) -> usize {
        if i + 1 == self.capacity {
            0
        } else {
            i + 1
        }
    }

    fn bucket_of(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) % self.capacity as u64) as usize
    }

    // Steps from `from` to `to` along the probe direction, wrapping.
    fn probe_distance(&self, from: usize, to: usize) -> usize {
        (to + self.capacity - from) % self.capacity
    }

    fn write_guard(&self) -> Result<Option<FileLockGuard>, Error> {
        match &self.lock {
            Some(lock) => Ok(Some(lock.acquire()?)),
            None => Ok(None),
        }
    }

    /// Probes for `key`'s occupied slot: start at its bucket, step forward,
    /// give up at the first empty slot or after one full wrap.
    fn find_slot(&self, key: &K) -> Option<usize> {
        let start = self.bucket_of(key);
        let mut i = start;
        while self.origin(i).load(Acquire) != EMPTY {
            if self.read_key(i) == *key {
                return Some(i);
            }
            i = self.next_index(i);
            if i == start {
                return None;
            }
        }
        None
    }

    /// Inserts `key -> value`, overwriting in place if the key is present.
    /// Fails with [`Error::CapacityExceeded`] only when every slot is
    /// occupied by other keys.
    pub fn set(&self, key: K, value: V) -> Result<(), Error> {
        let _guard = self.write_guard()?;
        let start = self.bucket_of(&key);
        let mut i = start;
        while self.origin(i).load(Acquire) != EMPTY {
            if self.read_key(i) == key {
                // same key: overwrite the value, size unchanged
                unsafe { ptr::addr_of_mut!((*self.slot_ptr(i)).value).write(value) };
                return Ok(());
            }
            i = self.next_index(i);
            if i == start {
                return Err(Error::CapacityExceeded {
                    capacity: self.capacity,
                });
            }
        }
        // empty slot: the payload lands before the origin publishes it
        self.write_pair(i, key, value);
        self.origin(i).store(start as i64, Release);
        self.header().len.fetch_add(1, Relaxed);
        Ok(())
    }

    /// Copies out the value stored for `key`, if any. Never locks.
    pub fn get(&self, key: &K) -> Option<V> {
        self.find_slot(key).map(|i| self.read_value(i))
    }

    /// Whether `key` is present. Never locks.
    pub fn contains_key(&self, key: &K) -> bool {
        self.find_slot(key).is_some()
    }

    /// Removes `key`, returning its value, and closes the gap by
    /// backward-shifting later entries of the probe chain.
    pub fn remove(&self, key: &K) -> Result<Option<V>, Error> {
        let _guard = self.write_guard()?;
        let Some(i) = self.find_slot(key) else {
            return Ok(None);
        };
        let value = self.read_value(i);
        self.vacate(i);
        Ok(Some(value))
    }

    // Backward-shift deletion. Instead of tombstoning the gap, pull a later
    // entry of the same probe chain into it, then close the hole that move
    // leaves behind; the loop carries the previous gap as a fence so the
    // scan never walks past where it started.
    //
    // An entry at `j` may legally move into the gap `g` only if `g` lies on
    // its own probe path, i.e. strictly between `origin(j)` and `j` in the
    // circular probe order; the slots between `g` and `j` are known occupied
    // (the scan just walked them), so the relocated key stays reachable.
    fn vacate(&self, mut gap: usize) {
        let mut fence: Option<usize> = None;
        loop {
            let mut last = gap;
            let mut j = self.next_index(gap);
            while j != gap && Some(j) != fence && self.origin(j).load(Acquire) != EMPTY {
                let j_origin = self.origin(j).load(Acquire) as usize;
                if self.probe_distance(j_origin, gap) < self.probe_distance(j_origin, j) {
                    last = j;
                }
                j = self.next_index(j);
            }
            if last == gap || Some(last) == fence {
                // nothing can legally move here: the gap becomes empty
                self.origin(gap).store(EMPTY, Release);
                self.header().len.fetch_sub(1, Relaxed);
                return;
            }
            let key = self.read_key(last);
            let value = self.read_value(last);
            let last_origin = self.origin(last).load(Acquire);
            self.write_pair(gap, key, value);
            self.origin(gap).store(last_origin, Release);
            fence = Some(gap);
            gap = last;
        }
    }

    /// Empties the table in one critical section.
    pub fn clear(&self) -> Result<(), Error> {
        let _guard = self.write_guard()?;
        for i in 0..self.capacity {
            self.origin(i).store(EMPTY, Release);
        }
        self.header().len.store(0, Release);
        Ok(())
    }

    /// Calls [`set`](Self::set) once per pair. Atomic per pair, not across
    /// the batch: a capacity failure leaves earlier pairs inserted.
    pub fn insert_pairs<I>(&self, pairs: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in pairs {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Alias of [`insert_pairs`](Self::insert_pairs) for callers merging a
    /// map-shaped batch.
    pub fn update<I>(&self, pairs: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.insert_pairs(pairs)
    }

    /// Lock-free iteration over the keys currently present.
    ///
    /// Walks slots in physical order and yields at most as many keys as
    /// `len()` reported when the iterator was created. After yielding a
    /// slot, if a concurrent delete backward-shifted a *different* key into
    /// that same slot, the new key is yielded too, within the same bound.
    /// Best-effort under concurrent writers (entries may be missed or seen
    /// twice); exact under exclusive access. For a consistent view use
    /// [`snapshot`](Self::snapshot).
    pub fn keys(&self) -> Keys<'_, K, V, S> {
        Keys(RawWalk::new(self))
    }

    /// Lock-free iteration over `(key, value)` pairs; same contract as
    /// [`keys`](Self::keys), with each value read at yield time.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter(RawWalk::new(self))
    }

    /// Collects every pair inside one critical section. With a configured
    /// lock this is a consistent point-in-time view; without one it is the
    /// same best-effort read as [`iter`](Self::iter).
    pub fn snapshot(&self) -> Result<Vec<(K, V)>, Error> {
        let _guard = self.write_guard()?;
        let mut pairs = Vec::with_capacity(self.len());
        for i in 0..self.capacity {
            if self.origin(i).load(Acquire) != EMPTY {
                pairs.push((self.read_key(i), self.read_value(i)));
            }
        }
        Ok(pairs)
    }

    /// Number of occupied slots, from the shared counter.
    pub fn len(&self) -> usize {
        self.header().len.load(Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The configured cross-process lock, if any.
    pub fn lock(&self) -> Option<&FileLock> {
        self.lock.as_ref()
    }
}

impl<K, V, S> core::fmt::Debug for ShmHashMap<K, V, S>
where
    K: Shareable + Eq + Hash,
    V: Shareable,
    S: BuildHasher + Clone + Default,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShmHashMap")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Construction-time configuration for [`ShmHashMap`].
///
/// Capacity is required for creation, and the synchronization choice is
/// always required: either [`lock_file`](Builder::lock_file) or an explicit
/// [`unsynchronized`](Builder::unsynchronized). An unsynchronized table with
/// multiple writers is a documented corruption risk, so it is never the
/// silent default.
#[derive(Clone)]
pub struct Builder<K, V, S = SeededState> {
    capacity: Option<usize>,
    hasher: S,
    // None = not chosen; Some(None) = explicitly unsynchronized
    sync: Option<Option<FileLock>>,
    initial: Vec<(K, V)>,
}

impl<K, V, S> Builder<K, V, S>
where
    K: Shareable + Eq + Hash,
    V: Shareable,
    S: BuildHasher + Clone + Default,
{
    /// Number of slots, fixed for the table's lifetime. Required for
    /// `create`/`create_anon`/`open_or_create`; for `open` it is validated
    /// against the segment header if given.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Replaces the hash-builder. All attaching processes must configure
    /// the same one; the default [`SeededState`] is deterministic across
    /// processes.
    pub fn hasher<S2>(self, hasher: S2) -> Builder<K, V, S2>
    where
        S2: BuildHasher + Clone + Default,
    {
        Builder {
            capacity: self.capacity,
            hasher,
            sync: self.sync,
            initial: self.initial,
        }
    }

    /// Serializes mutating operations across processes through an
    /// exclusive lock on `path`. All attaching processes must agree on the
    /// path.
    pub fn lock_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.sync = Some(Some(FileLock::new(path)));
        self
    }

    /// Opts out of synchronization entirely: mutating operations take no
    /// lock and concurrent writers race.
    pub fn unsynchronized(mut self) -> Self {
        self.sync = Some(None);
        self
    }

    /// Pairs inserted through the normal `set` path once the table is
    /// ready; more pairs than capacity fail construction with
    /// [`Error::CapacityExceeded`].
    pub fn initial_pairs<I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.initial.extend(pairs);
        self
    }

    fn required_capacity(&self) -> Result<usize, Error> {
        match self.capacity {
            Some(0) => Err(Error::Config("capacity must be at least 1".into())),
            Some(capacity) => Ok(capacity),
            None => Err(Error::Config("capacity is required".into())),
        }
    }

    fn required_sync(&mut self) -> Result<Option<FileLock>, Error> {
        self.sync.take().ok_or_else(|| {
            Error::Config("choose lock_file(..) or unsynchronized() before building".into())
        })
    }

    /// Creates a named segment and formats a fresh table in it. Fails with
    /// `AlreadyExists` if a segment of that name is live.
    pub fn create(mut self, name: &str) -> Result<ShmHashMap<K, V, S>, Error> {
        let capacity = self.required_capacity()?;
        let lock = self.required_sync()?;
        let segment = Segment::create_named(name, layout::region_len::<K, V>(capacity))?;
        #[cfg(feature = "logging")]
        log::debug!("created shared table segment {name:?} with capacity {capacity}");
        ShmHashMap::format_fresh(segment, capacity, self.hasher, lock, self.initial)
    }

    /// Attaches to an existing named segment, validating its header
    /// against this process's generics and expectations.
    pub fn open(mut self, name: &str) -> Result<ShmHashMap<K, V, S>, Error> {
        let lock = self.required_sync()?;
        if let Some(0) = self.capacity {
            return Err(Error::Config("capacity must be at least 1".into()));
        }
        let segment = Segment::open_named(name)?;
        #[cfg(feature = "logging")]
        log::debug!("attached to shared table segment {name:?}");
        ShmHashMap::attach(segment, self.capacity, self.hasher, lock, self.initial, false)
    }

    /// Creates the segment, or attaches if another process got there
    /// first, waiting briefly for a racing creator to finish initializing.
    pub fn open_or_create(self, name: &str) -> Result<ShmHashMap<K, V, S>, Error> {
        let capacity = self.required_capacity()?;
        match self.clone().create(name) {
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                let mut this = self;
                let lock = this.required_sync()?;
                let segment = Segment::open_named(name)?;
                ShmHashMap::attach(
                    segment,
                    Some(capacity),
                    this.hasher,
                    lock,
                    this.initial,
                    true,
                )
            }
            other => other,
        }
    }

    /// Formats a fresh table in an anonymous memfd segment, visible only to
    /// this process and anything that inherits the mapping.
    pub fn create_anon(mut self) -> Result<ShmHashMap<K, V, S>, Error> {
        let capacity = self.required_capacity()?;
        let lock = self.required_sync()?;
        let segment = Segment::create_anon(layout::region_len::<K, V>(capacity))?;
        ShmHashMap::format_fresh(segment, capacity, self.hasher, lock, self.initial)
    }
}

// Shared slot walker behind `Keys` and `Iter`: physical order, bounded by
// the size observed at creation, re-reading a yielded slot that changed
// under a concurrent backward shift.
struct RawWalk<'a, K, V, S> {
    table: &'a ShmHashMap<K, V, S>,
    index: usize,
    yielded: usize,
    bound: usize,
    reread: Option<(usize, K)>,
}

impl<'a, K, V, S> RawWalk<'a, K, V, S>
where
    K: Shareable + Eq + Hash,
    V: Shareable,
    S: BuildHasher + Clone + Default,
{
    fn new(table: &'a ShmHashMap<K, V, S>) -> Self {
        Self {
            table,
            index: 0,
            yielded: 0,
            bound: table.len(),
            reread: None,
        }
    }

    fn next_slot(&mut self) -> Option<(usize, K)> {
        let table = self.table;
        loop {
            if self.yielded >= self.bound {
                return None;
            }
            if let Some((i, previous)) = self.reread.take() {
                if table.origin(i).load(Acquire) != EMPTY {
                    let key = table.read_key(i);
                    if key != previous {
                        // a concurrent delete shifted another entry here
                        self.reread = Some((i, key));
                        self.yielded += 1;
                        return Some((i, key));
                    }
                }
                self.index = i + 1;
                continue;
            }
            if self.index >= table.capacity {
                return None;
            }
            let i = self.index;
            if table.origin(i).load(Acquire) != EMPTY {
                let key = table.read_key(i);
                self.reread = Some((i, key));
                self.yielded += 1;
                return Some((i, key));
            }
            self.index = i + 1;
        }
    }
}

/// Lazy key iterator returned by [`ShmHashMap::keys`]. Not resumable:
/// restart by calling `keys()` again.
pub struct Keys<'a, K, V, S>(RawWalk<'a, K, V, S>);

impl<K, V, S> Iterator for Keys<'_, K, V, S>
where
    K: Shareable + Eq + Hash,
    V: Shareable,
    S: BuildHasher + Clone + Default,
{
    type Item = K;

    fn next(&mut self) -> Option<K> {
        self.0.next_slot().map(|(_, key)| key)
    }
}

/// Lazy pair iterator returned by [`ShmHashMap::iter`].
pub struct Iter<'a, K, V, S>(RawWalk<'a, K, V, S>);

impl<K, V, S> Iterator for Iter<'_, K, V, S>
where
    K: Shareable + Eq + Hash,
    V: Shareable,
    S: BuildHasher + Clone + Default,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        self.0
            .next_slot()
            .map(|(i, key)| (key, self.0.table.read_value(i)))
    }
}
