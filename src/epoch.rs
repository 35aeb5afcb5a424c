//! Generational deferred reclamation.
//!
//! Writers unlink entries from the index but must not free them while a
//! concurrent reader may still be traversing them. Instead, every operation
//! joins the current epoch before touching entries and leaves it when done;
//! unlinked allocations are retired into the garbage list of whatever epoch
//! is current at that moment. An epoch's garbage becomes reclaimable only
//! once the epoch has stopped accepting joiners (a newer epoch exists), its
//! last reader has left, and every earlier epoch has already been drained.
//!
//! Reclamation walks the epoch chain strictly from the oldest epoch forward
//! and stops at the first one with active readers: a later epoch's garbage
//! may have been retired by an operation that joined earlier, so draining
//! out of order could free an entry a straggling reader still holds.

use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use std::sync::{Mutex, RwLock};

/// A type-erased allocation awaiting physical destruction.
pub struct Retired {
    ptr: *mut u8,
    drop_fn: unsafe fn(*mut u8),
}

impl Retired {
    /// Wraps a raw allocation and the destructor that will free it.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid until `drop_fn` consumes it, and `drop_fn` must
    /// fully release the allocation exactly once.
    pub unsafe fn new(ptr: *mut u8, drop_fn: unsafe fn(*mut u8)) -> Self {
        Retired { ptr, drop_fn }
    }

    /// Retires an owned box.
    pub fn boxed<T: Send>(value: Box<T>) -> Self {
        unsafe fn drop_box<T>(ptr: *mut u8) {
            drop(Box::from_raw(ptr.cast::<T>()));
        }

        Retired {
            ptr: Box::into_raw(value).cast(),
            drop_fn: drop_box::<T>,
        }
    }

    unsafe fn free(self) {
        (self.drop_fn)(self.ptr);
    }
}

// The skiplist only retires allocations whose contents are Send, enforced by
// its own Send/Sync bounds.
unsafe impl Send for Retired {}

struct EpochNode {
    /// Operations currently executing inside this epoch.
    active_threads: AtomicUsize,
    /// Allocations retired while this epoch was current.
    garbage: Mutex<Vec<Retired>>,
    next: AtomicPtr<EpochNode>,
}

impl EpochNode {
    fn new() -> Self {
        EpochNode {
            active_threads: AtomicUsize::new(0),
            garbage: Mutex::new(Vec::new()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Oldest-first view of the epoch chain. `current` is the tail; new joiners
/// always land there.
struct Chain {
    head: NonNull<EpochNode>,
    current: NonNull<EpochNode>,
}

/// Tracks which operations may still hold references to retired entries.
///
/// The chain lock closes the join/collect race: a joiner increments the
/// current epoch's counter under the read lock, while [`advance`] and
/// [`collect`] hold the write lock, so an epoch can never be freed between a
/// reader loading the current pointer and bumping its counter. Traversal of
/// the index itself never takes the lock.
///
/// [`advance`]: EpochManager::advance
/// [`collect`]: EpochManager::collect
pub struct EpochManager {
    chain: RwLock<Chain>,
}

unsafe impl Send for EpochManager {}
unsafe impl Sync for EpochManager {}

impl EpochManager {
    pub fn new() -> Self {
        let first = NonNull::from(Box::leak(Box::new(EpochNode::new())));

        EpochManager {
            chain: RwLock::new(Chain {
                head: first,
                current: first,
            }),
        }
    }

    /// Joins the current epoch. The returned guard must be held for the
    /// whole traversal; dropping it leaves the epoch.
    pub fn join(&self) -> Guard<'_> {
        let chain = self.chain.read().unwrap();
        let node = chain.current;

        unsafe { node.as_ref() }
            .active_threads
            .fetch_add(1, Ordering::SeqCst);

        Guard {
            node,
            _manager: PhantomData,
        }
    }

    /// Appends an unlinked allocation to the current epoch's garbage list.
    /// The allocation is not freed until [`collect`](Self::collect) proves
    /// no reader can still hold it.
    pub fn retire(&self, garbage: Retired) {
        let chain = self.chain.read().unwrap();

        unsafe { chain.current.as_ref() }
            .garbage
            .lock()
            .unwrap()
            .push(garbage);
    }

    /// Opens a fresh epoch. The previous epoch stops accepting joiners but
    /// keeps its active readers until they finish.
    pub fn advance(&self) {
        let mut chain = self.chain.write().unwrap();
        let node = NonNull::from(Box::leak(Box::new(EpochNode::new())));

        unsafe { chain.current.as_ref() }
            .next
            .store(node.as_ptr(), Ordering::Release);
        chain.current = node;

        #[cfg(feature = "tracing")]
        tracing::trace!("opened new epoch");
    }

    /// Frees the garbage of every fully drained epoch, oldest first, and
    /// unlinks the drained nodes. Stops at the first epoch that still has
    /// active readers, or at the current epoch.
    pub fn collect(&self) {
        let mut chain = self.chain.write().unwrap();
        let mut freed = 0;

        while chain.head != chain.current {
            let head = unsafe { chain.head.as_ref() };

            if head.active_threads.load(Ordering::Acquire) != 0 {
                break;
            }

            // Non-current epochs always have a successor.
            let next = head.next.load(Ordering::Acquire);
            let node = unsafe { *Box::from_raw(chain.head.as_ptr()) };

            for retired in node.garbage.into_inner().unwrap() {
                unsafe { retired.free() };
                freed += 1;
            }

            chain.head = unsafe { NonNull::new_unchecked(next) };
        }

        let _ = freed;
        #[cfg(feature = "tracing")]
        tracing::trace!(freed, "collected drained epochs");
    }

    #[cfg(test)]
    pub(crate) fn epoch_count(&self) -> usize {
        let chain = self.chain.read().unwrap();
        let mut count = 1;
        let mut node = unsafe { chain.head.as_ref() };

        loop {
            let next = node.next.load(Ordering::Acquire);
            if next.is_null() {
                break count;
            }
            count += 1;
            node = unsafe { &*next };
        }
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        // Exclusive access: no guard can outlive the manager, so every
        // epoch is drained and all remaining garbage is safe to free.
        let chain = self.chain.get_mut().unwrap();
        let mut curr = chain.head.as_ptr();

        loop {
            let node = unsafe { *Box::from_raw(curr) };
            let next = node.next.load(Ordering::Relaxed);

            for retired in node.garbage.into_inner().unwrap() {
                unsafe { retired.free() };
            }

            if next.is_null() {
                break;
            }
            curr = next;
        }
    }
}

/// Witness that the holder has joined an epoch.
///
/// Exists for the duration of one index operation; dropping it is the
/// `leave` half of the join/leave pairing, so leaving happens on every exit
/// path.
#[must_use]
pub struct Guard<'a> {
    node: NonNull<EpochNode>,
    _manager: PhantomData<&'a EpochManager>,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        unsafe { self.node.as_ref() }
            .active_threads
            .fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod epoch_test {
    use super::*;

    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct Tracked(Arc<AtomicBool>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Relaxed);
        }
    }

    fn tracked() -> (Retired, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        let retired = Retired::boxed(Box::new(Tracked(dropped.clone())));
        (retired, dropped)
    }

    fn active_of(guard: &Guard<'_>) -> usize {
        unsafe { guard.node.as_ref() }
            .active_threads
            .load(Ordering::SeqCst)
    }

    #[test]
    fn test_join_counts_readers() {
        let epochs = EpochManager::new();

        let first = epochs.join();
        let second = epochs.join();

        assert_eq!(active_of(&first), 2);
        assert_eq!(active_of(&second), 2);

        drop(second);
        assert_eq!(active_of(&first), 1);
    }

    #[test]
    fn test_advance_leaves_old_count_untouched() {
        let epochs = EpochManager::new();

        let old = epochs.join();
        epochs.advance();
        let new = epochs.join();

        assert_eq!(active_of(&old), 1);
        assert_eq!(active_of(&new), 1);
        assert!(old.node != new.node);
    }

    #[test]
    fn test_collect_waits_for_readers() {
        let epochs = EpochManager::new();

        let guard = epochs.join();
        let (retired, dropped) = tracked();
        epochs.retire(retired);

        epochs.advance();
        epochs.collect();

        // The reader that joined before the retire is still inside.
        assert!(!dropped.load(Ordering::Relaxed));

        drop(guard);
        epochs.collect();

        assert!(dropped.load(Ordering::Relaxed));
    }

    #[test]
    fn test_collect_never_skips_an_active_epoch() {
        let epochs = EpochManager::new();

        // Epoch A: one reader pinned, one retired allocation.
        let guard = epochs.join();
        let (retired_a, dropped_a) = tracked();
        epochs.retire(retired_a);

        // Epoch B: fully drained, but behind A in the chain.
        epochs.advance();
        let (retired_b, dropped_b) = tracked();
        epochs.retire(retired_b);

        // Epoch C is current.
        epochs.advance();
        epochs.collect();

        // Nothing may be freed while A still has a reader, B included.
        assert!(!dropped_a.load(Ordering::Relaxed));
        assert!(!dropped_b.load(Ordering::Relaxed));
        assert_eq!(epochs.epoch_count(), 3);

        drop(guard);
        epochs.collect();

        assert!(dropped_a.load(Ordering::Relaxed));
        assert!(dropped_b.load(Ordering::Relaxed));
        assert_eq!(epochs.epoch_count(), 1);
    }

    #[test]
    fn test_current_epoch_is_never_collected() {
        let epochs = EpochManager::new();

        let (retired, dropped) = tracked();
        epochs.retire(retired);
        epochs.collect();

        assert!(!dropped.load(Ordering::Relaxed));
        assert_eq!(epochs.epoch_count(), 1);
    }

    #[test]
    fn test_drop_frees_pending_garbage() {
        let epochs = EpochManager::new();

        let (retired_a, dropped_a) = tracked();
        epochs.retire(retired_a);
        epochs.advance();
        let (retired_b, dropped_b) = tracked();
        epochs.retire(retired_b);

        drop(epochs);

        assert!(dropped_a.load(Ordering::Relaxed));
        assert!(dropped_b.load(Ordering::Relaxed));
    }

    #[test]
    fn test_concurrent_joiners() {
        use std::thread;

        let epochs = Arc::new(EpochManager::new());

        let threads = (0..8)
            .map(|_| {
                let epochs = Arc::clone(&epochs);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        let guard = epochs.join();
                        assert!(active_of(&guard) >= 1);
                    }
                })
            })
            .collect::<Vec<_>>();

        for _ in 0..100 {
            epochs.advance();
            epochs.collect();
        }

        for thread in threads {
            thread.join().unwrap();
        }

        epochs.collect();
        assert_eq!(epochs.epoch_count(), 1);
    }
}
