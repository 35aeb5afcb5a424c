//! The ordered index: a skip list whose readers traverse lock-free under
//! epoch protection while a single writer lock serializes mutation.

use core::{
    cmp,
    fmt::Debug,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use std::sync::Mutex;

use crate::epoch::{EpochManager, Guard, Retired};
use crate::level::{GeometricLevels, LevelGenerator};
use crate::node::{Entry, Head, HEIGHT};

/// Writes between epoch advancement, bounding how much retired garbage can
/// pile up in one epoch.
const RETIRES_PER_COLLECT: usize = 8;

/// Pluggable key ordering policy.
///
/// Equality is `Ordering::Equal`; a separate equality object is not needed.
/// Implement this to index by non-natural orderings (reversed keys,
/// case-insensitive strings, composite keys).
pub trait Comparator<K: ?Sized> {
    fn compare(&self, lhs: &K, rhs: &K) -> cmp::Ordering;
}

/// Natural `Ord` ordering; the default policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    #[inline]
    fn compare(&self, lhs: &K, rhs: &K) -> cmp::Ordering {
        lhs.cmp(rhs)
    }
}

struct WriterState {
    levels: Box<dyn LevelGenerator>,
    retired_since_collect: usize,
}

/// Configuration for a [`SkipList`].
pub struct Builder<K, V, C = NaturalOrder> {
    cmp: C,
    allow_duplicates: bool,
    levels: Box<dyn LevelGenerator>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Builder<K, V, NaturalOrder> {
    fn new() -> Self {
        Builder {
            cmp: NaturalOrder,
            allow_duplicates: false,
            levels: Box::new(GeometricLevels::new()),
            _marker: PhantomData,
        }
    }
}

impl<K, V, C> Builder<K, V, C> {
    /// When enabled, inserting an existing key adds another entry after the
    /// equal-key run instead of replacing the value.
    pub fn allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    /// Replaces the ordering policy.
    pub fn comparator<D>(self, cmp: D) -> Builder<K, V, D> {
        Builder {
            cmp,
            allow_duplicates: self.allow_duplicates,
            levels: self.levels,
            _marker: PhantomData,
        }
    }

    /// Replaces the leveling source, e.g. with a seeded
    /// [`GeometricLevels`] for reproducible layouts.
    pub fn level_generator(mut self, levels: impl LevelGenerator + 'static) -> Self {
        self.levels = Box::new(levels);
        self
    }

    pub fn build(self) -> SkipList<K, V, C> {
        SkipList {
            head: Head::new(),
            height: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            cmp: self.cmp,
            allow_duplicates: self.allow_duplicates,
            epoch: EpochManager::new(),
            writer: Mutex::new(WriterState {
                levels: self.levels,
                retired_since_collect: 0,
            }),
        }
    }
}

/// An ordered map (or multimap) over probabilistically leveled entry
/// chains.
///
/// Level 0 is the complete ascending sequence of live entries; every higher
/// level is an order-preserving subsequence used to skip across ranges.
/// Readers never block: removed entries are handed to the [`EpochManager`]
/// and stay dereferenceable until every traversal that could have observed
/// them has left its epoch.
pub struct SkipList<K, V, C = NaturalOrder> {
    head: NonNull<Head<K, V>>,
    /// Number of populated levels; 0 means the list is empty.
    height: AtomicUsize,
    len: AtomicUsize,
    cmp: C,
    allow_duplicates: bool,
    epoch: EpochManager,
    writer: Mutex<WriterState>,
}

impl<K, V> SkipList<K, V> {
    /// An empty list with natural ordering, duplicates disallowed, and
    /// entropy-seeded leveling.
    pub fn new() -> Self {
        Builder::new().build()
    }

    pub fn builder() -> Builder<K, V> {
        Builder::new()
    }
}

impl<K, V, C> SkipList<K, V, C> {
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn head_entry(&self) -> *mut Entry<K, V> {
        self.head.as_ptr().cast()
    }
}

impl<K, V, C> SkipList<K, V, C>
where
    C: Comparator<K>,
{
    /// Looks up `key` and returns a handle pinning the entry for as long as
    /// it is held. Safe to call concurrently with writers; a lookup racing
    /// an insert of the same key may resolve either way.
    pub fn find(&self, key: &K) -> Option<EntryRef<'_, K, V>> {
        let guard = self.epoch.join();
        let node = self.search(key, &guard)?;

        Some(EntryRef {
            node,
            _guard: guard,
        })
    }

    /// Top-down strictly-less descent; the level-0 successor is the only
    /// candidate for equality.
    fn search(&self, key: &K, _guard: &Guard<'_>) -> Option<NonNull<Entry<K, V>>> {
        let mut curr = self.head_entry();

        unsafe {
            for level in (0..self.height.load(Ordering::Acquire)).rev() {
                loop {
                    let next = (&(*curr).forwards)[level].load(Ordering::Acquire);
                    if next.is_null()
                        || self.cmp.compare(&(*next).key, key) != cmp::Ordering::Less
                    {
                        break;
                    }
                    curr = next;
                }
            }

            let next = (&(*curr).forwards)[0].load(Ordering::Acquire);

            if !next.is_null() && self.cmp.compare(&(*next).key, key) == cmp::Ordering::Equal {
                Some(NonNull::new_unchecked(next))
            } else {
                None
            }
        }
    }

    /// Inserts `key`/`val` and reports success. When duplicates are
    /// disallowed and `key` is already present, the existing entry's value
    /// is replaced and the insert still succeeds; callers wanting strict
    /// rejection pre-check with [`find`](Self::find).
    ///
    /// The replacement is published as a single forward-pointer swap per
    /// level, so concurrent readers observe either the old or the new
    /// value, never a torn one.
    pub fn insert(&self, key: K, val: V) -> bool {
        let _guard = self.epoch.join();
        let mut writer = self.writer.lock().unwrap();

        let height = self.height.load(Ordering::Relaxed);
        let mut updates = [self.head_entry(); HEIGHT];
        let mut curr = self.head_entry();

        unsafe {
            for level in (0..height).rev() {
                loop {
                    let next = (&(*curr).forwards)[level].load(Ordering::Relaxed);
                    if next.is_null() {
                        break;
                    }
                    // Equal keys keep insertion order: a duplicate insert
                    // walks past the whole equal-key run.
                    let advance = match self.cmp.compare(&(*next).key, &key) {
                        cmp::Ordering::Less => true,
                        cmp::Ordering::Equal => self.allow_duplicates,
                        cmp::Ordering::Greater => false,
                    };
                    if !advance {
                        break;
                    }
                    curr = next;
                }
                updates[level] = curr;
            }

            let succ = (&(*curr).forwards)[0].load(Ordering::Relaxed);

            if !self.allow_duplicates
                && !succ.is_null()
                && self.cmp.compare(&(*succ).key, &key) == cmp::Ordering::Equal
            {
                self.replace(succ, key, val, &updates, &mut writer);
                return true;
            }

            let new_height = writer.levels.next_height();

            // Newly exposed levels descend from the head; `updates` already
            // points there.
            if new_height > height {
                self.height.store(new_height, Ordering::Release);
            }

            let entry = Entry::new(key, val, new_height);

            for level in 0..new_height {
                let pred = updates[level];
                (&(*entry).forwards)[level]
                    .store((&(*pred).forwards)[level].load(Ordering::Relaxed), Ordering::Relaxed);
                (&(*pred).forwards)[level].store(entry, Ordering::Release);
            }
        }

        self.len.fetch_add(1, Ordering::Relaxed);

        true
    }

    /// Swaps a fresh entry in place of `old` at every level `old` occupies,
    /// then retires `old`. Readers holding `old` keep a valid view until
    /// their epoch drains.
    unsafe fn replace(
        &self,
        old: *mut Entry<K, V>,
        key: K,
        val: V,
        updates: &[*mut Entry<K, V>; HEIGHT],
        writer: &mut WriterState,
    ) {
        let height = (*old).height();
        let entry = Entry::new(key, val, height);

        for level in 0..height {
            (&(*entry).forwards)[level]
                .store((&(*old).forwards)[level].load(Ordering::Relaxed), Ordering::Relaxed);
        }

        for level in 0..height {
            let pred = updates[level];
            debug_assert!(ptr::eq((&(*pred).forwards)[level].load(Ordering::Relaxed), old));
            (&(*pred).forwards)[level].store(entry, Ordering::Release);
        }

        self.retire_entry(old, writer);
    }

    /// Removes the first entry with `key`. Returns `false` if no such entry
    /// exists; the list is left unchanged.
    pub fn remove(&self, key: &K) -> bool {
        let _guard = self.epoch.join();
        let mut writer = self.writer.lock().unwrap();

        self.unlink_where(key, |_| true, &mut writer)
    }

    /// Removes the first entry with `key` whose value equals `val`. Used to
    /// disambiguate which entry of an equal-key run to drop when duplicates
    /// are allowed.
    pub fn remove_entry(&self, key: &K, val: &V) -> bool
    where
        V: PartialEq,
    {
        let _guard = self.epoch.join();
        let mut writer = self.writer.lock().unwrap();

        self.unlink_where(key, |candidate| candidate == val, &mut writer)
    }

    fn unlink_where<F>(&self, key: &K, matches: F, writer: &mut WriterState) -> bool
    where
        F: Fn(&V) -> bool,
    {
        let height = self.height.load(Ordering::Relaxed);
        let mut updates = [self.head_entry(); HEIGHT];
        let mut curr = self.head_entry();

        unsafe {
            for level in (0..height).rev() {
                loop {
                    let next = (&(*curr).forwards)[level].load(Ordering::Relaxed);
                    if next.is_null()
                        || self.cmp.compare(&(*next).key, key) != cmp::Ordering::Less
                    {
                        break;
                    }
                    curr = next;
                }
                updates[level] = curr;
            }

            // Scan the equal-key run on level 0 for the first value match,
            // remembering the run entries that precede it.
            let mut preceding = Vec::new();
            let mut target = (&(*curr).forwards)[0].load(Ordering::Relaxed);

            loop {
                if target.is_null()
                    || self.cmp.compare(&(*target).key, key) != cmp::Ordering::Equal
                {
                    return false;
                }
                if matches(&(*target).val) {
                    break;
                }
                preceding.push(target);
                updates[0] = target;
                target = (&(*target).forwards)[0].load(Ordering::Relaxed);
            }

            // A later duplicate can be linked at levels the skipped run
            // entries are not, so the strictly-less walk may stop short of
            // the target's true predecessor there. Advance past the run
            // entries known to come before the target.
            if !preceding.is_empty() {
                for level in 1..height {
                    let mut pred = updates[level];
                    loop {
                        let next = (&(*pred).forwards)[level].load(Ordering::Relaxed);
                        if next.is_null()
                            || ptr::eq(next, target)
                            || !preceding.contains(&next)
                        {
                            break;
                        }
                        pred = next;
                    }
                    updates[level] = pred;
                }
            }

            // The target may not be linked above its own height; stop at
            // the first level that no longer points at it.
            for level in 0..height {
                let pred = updates[level];
                if !ptr::eq((&(*pred).forwards)[level].load(Ordering::Relaxed), target) {
                    break;
                }
                (&(*pred).forwards)[level].store(
                    (&(*target).forwards)[level].load(Ordering::Relaxed),
                    Ordering::Release,
                );
            }

            let head = self.head_entry();
            let mut new_height = height;
            while new_height > 0
                && (&(*head).forwards)[new_height - 1]
                    .load(Ordering::Relaxed)
                    .is_null()
            {
                new_height -= 1;
            }
            self.height.store(new_height, Ordering::Release);

            self.len.fetch_sub(1, Ordering::Relaxed);
            self.retire_entry(target, writer);
        }

        true
    }

    /// Hands an unlinked entry to the epoch manager and, on a fixed write
    /// cadence, advances the epoch and collects so the chain stays bounded
    /// under sustained write load.
    fn retire_entry(&self, entry: *mut Entry<K, V>, writer: &mut WriterState) {
        unsafe {
            self.epoch
                .retire(Retired::new(entry.cast(), Entry::<K, V>::drop_erased));
        }

        writer.retired_since_collect += 1;
        if writer.retired_since_collect >= RETIRES_PER_COLLECT {
            writer.retired_since_collect = 0;
            self.epoch.advance();
            self.epoch.collect();
        }
    }

    /// Visits every live entry in level-0 (ascending) order.
    pub fn traverse_with<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        let _guard = self.epoch.join();
        let mut curr = unsafe { (&(*self.head_entry()).forwards)[0].load(Ordering::Acquire) };

        unsafe {
            while !curr.is_null() {
                f(&(*curr).key, &(*curr).val);
                curr = (&(*curr).forwards)[0].load(Ordering::Acquire);
            }
        }
    }

    /// Per-level dump of the chains, top level first. Diagnostic only; not
    /// part of the transactional contract.
    pub fn display(&self) -> String
    where
        K: Debug,
        V: Debug,
    {
        use std::fmt::Write;

        let _guard = self.epoch.join();
        let mut out = String::new();

        for level in (0..self.height.load(Ordering::Acquire)).rev() {
            let _ = write!(out, "level {}: ", level);
            let mut curr = unsafe { (&(*self.head_entry()).forwards)[level].load(Ordering::Acquire) };

            unsafe {
                while !curr.is_null() {
                    let _ = write!(out, "({:?}, {:?}) -> ", (*curr).key, (*curr).val);
                    curr = (&(*curr).forwards)[level].load(Ordering::Acquire);
                }
            }

            out.push_str("nil\n");
        }

        out
    }
}

impl<K, V> Default for SkipList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C> Debug for SkipList<K, V, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkipList")
            .field("len", &self.len())
            .field("height", &self.height.load(Ordering::Relaxed))
            .field("allow_duplicates", &self.allow_duplicates)
            .finish()
    }
}

impl<K, V, C> Drop for SkipList<K, V, C> {
    fn drop(&mut self) {
        let mut curr = unsafe { (&(*self.head_entry()).forwards)[0].load(Ordering::Relaxed) };

        while !curr.is_null() {
            unsafe {
                let next = (&(*curr).forwards)[0].load(Ordering::Relaxed);
                Entry::drop(curr);
                curr = next;
            }
        }

        unsafe { Head::drop(self.head) };

        // Entries retired but not yet collected are freed when `epoch`
        // drops; they were unlinked from the chains above.
    }
}

unsafe impl<K, V, C> Send for SkipList<K, V, C>
where
    K: Send + Sync,
    V: Send + Sync,
    C: Send,
{
}

unsafe impl<K, V, C> Sync for SkipList<K, V, C>
where
    K: Send + Sync,
    V: Send + Sync,
    C: Sync,
{
}

/// Value-bearing handle returned by [`SkipList::find`].
///
/// Holds the reader's epoch open, so the entry stays valid even if a writer
/// unlinks it while the handle is alive.
pub struct EntryRef<'a, K, V> {
    node: NonNull<Entry<K, V>>,
    _guard: Guard<'a>,
}

impl<K, V> EntryRef<'_, K, V> {
    pub fn key(&self) -> &K {
        unsafe { &self.node.as_ref().key }
    }

    pub fn value(&self) -> &V {
        unsafe { &self.node.as_ref().val }
    }
}

impl<K, V> Debug for EntryRef<'_, K, V>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryRef")
            .field("key", self.key())
            .field("value", self.value())
            .finish()
    }
}
