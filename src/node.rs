use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};

use core::{
    fmt::Debug,
    mem::{self, MaybeUninit},
    ops::Index,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

pub(crate) const HEIGHT_BITS: usize = 5;

/// Maximum number of forward levels any tower may occupy.
pub const HEIGHT: usize = 1 << HEIGHT_BITS;

/// The sentinel at the front of the list. Always of maximum height, never
/// holds a key or value, and is only deallocated when the list itself drops.
///
/// Shares its layout prefix with [`Entry`] so traversals can start from the
/// head without a special case.
#[repr(C)]
pub(crate) struct Head<K, V> {
    key: MaybeUninit<K>,
    val: MaybeUninit<V>,
    height: usize,
    pub(crate) forwards: Tower<K, V>,
}

impl<K, V> Head<K, V> {
    pub(crate) fn new() -> NonNull<Self> {
        // `alloc` aborts on allocation failure, so the pointer is non-null.
        unsafe { NonNull::new_unchecked(Entry::<K, V>::alloc(HEIGHT).cast()) }
    }

    /// Frees the sentinel. The key and value slots were never initialized,
    /// so only the allocation itself is released.
    pub(crate) unsafe fn drop(ptr: NonNull<Self>) {
        Entry::<K, V>::dealloc(ptr.as_ptr().cast());
    }
}

/// Variable-length array of forward pointers trailing an [`Entry`].
///
/// An entry of height `h` owns `h` pointers, allocated in the same block as
/// the entry; `forwards[h]` is the next entry reachable at level `h`. The
/// zero-length array marks where the pointers start; indexing goes through
/// a raw offset since the true length is only known at allocation time.
#[repr(C)]
pub(crate) struct Tower<K, V> {
    pointers: [AtomicPtr<Entry<K, V>>; 0],
}

impl<K, V> Tower<K, V> {
    fn size_of_levels(height: usize) -> usize {
        assert!(height >= 1 && height <= HEIGHT);

        mem::size_of::<AtomicPtr<Entry<K, V>>>() * height
    }
}

impl<K, V> Index<usize> for Tower<K, V> {
    type Output = AtomicPtr<Entry<K, V>>;

    fn index(&self, index: usize) -> &Self::Output {
        unsafe { &*self.pointers.as_ptr().add(index) }
    }
}

/// A leaf of the index: an immutable key, its value, and the forward tower.
///
/// Entries are allocated raw so the tower can be sized to the drawn height
/// rather than the maximum.
#[repr(C)]
pub(crate) struct Entry<K, V> {
    pub(crate) key: K,
    pub(crate) val: V,
    height: usize,
    pub(crate) forwards: Tower<K, V>,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(key: K, val: V, height: usize) -> *mut Self {
        unsafe {
            let entry = Self::alloc(height);

            ptr::write(&mut (*entry).key, key);
            ptr::write(&mut (*entry).val, val);
            entry
        }
    }

    /// Allocates an entry with room for `height` forward pointers, all null.
    /// The key and value slots are left uninitialized.
    pub(crate) unsafe fn alloc(height: usize) -> *mut Self {
        let layout = Self::layout(height);

        let ptr = alloc(layout).cast::<Self>();

        if ptr.is_null() {
            handle_alloc_error(layout);
        }

        ptr::write(&mut (*ptr).height, height);

        ptr::write_bytes((*ptr).forwards.pointers.as_mut_ptr(), 0, height);

        ptr
    }

    pub(crate) unsafe fn dealloc(ptr: *mut Self) {
        let height = (*ptr).height;

        let layout = Self::layout(height);

        dealloc(ptr.cast(), layout);
    }

    unsafe fn layout(height: usize) -> Layout {
        let size = mem::size_of::<Self>() + Tower::<K, V>::size_of_levels(height);

        Layout::from_size_align_unchecked(size, mem::align_of::<Self>())
    }

    /// Drops the key and value in place and frees the allocation.
    pub(crate) unsafe fn drop(ptr: *mut Self) {
        ptr::drop_in_place(&mut (*ptr).key);
        ptr::drop_in_place(&mut (*ptr).val);

        Self::dealloc(ptr);
    }

    /// Type-erased destructor, handed to the epoch manager alongside a
    /// retired entry pointer.
    pub(crate) unsafe fn drop_erased(ptr: *mut u8) {
        Self::drop(ptr.cast());
    }

    pub(crate) fn height(&self) -> usize {
        self.height
    }
}

impl<K, V> Debug for Entry<K, V>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("val", &self.val)
            .field("height", &self.height)
            .field(
                "forwards",
                &(0..self.height).fold(String::new(), |acc, level| {
                    format!("{}{:?}, ", acc, self.forwards[level].load(Ordering::Relaxed))
                }),
            )
            .finish()
    }
}

#[cfg(test)]
mod node_test {
    use super::*;

    #[test]
    fn test_new_entry() {
        let entry = Entry::new(100, "hello", 3);

        unsafe {
            assert_eq!((*entry).key, 100);
            assert_eq!((*entry).val, "hello");
            assert_eq!((*entry).height(), 3);

            for level in 0..3 {
                assert!((&(*entry).forwards)[level].load(Ordering::Relaxed).is_null());
            }

            Entry::drop(entry);
        }
    }

    #[test]
    fn test_entry_links() {
        let first = Entry::new(1, (), 2);
        let second = Entry::new(2, (), 1);

        unsafe {
            (&(*first).forwards)[0].store(second, Ordering::Relaxed);

            assert_eq!((&(*first).forwards)[0].load(Ordering::Relaxed), second);
            assert!((&(*first).forwards)[1].load(Ordering::Relaxed).is_null());

            Entry::drop(second);
            Entry::drop(first);
        }
    }

    #[test]
    fn test_tall_tower_is_addressable() {
        let entry = Entry::new(1u64, (), HEIGHT);
        let other = Entry::new(2u64, (), 1);

        unsafe {
            for level in 0..HEIGHT {
                assert!((&(*entry).forwards)[level].load(Ordering::Relaxed).is_null());
            }

            (&(*entry).forwards)[HEIGHT - 1].store(other, Ordering::Relaxed);
            assert_eq!((&(*entry).forwards)[HEIGHT - 1].load(Ordering::Relaxed), other);
            assert!((&(*entry).forwards)[HEIGHT - 2].load(Ordering::Relaxed).is_null());

            Entry::drop(other);
            Entry::drop(entry);
        }
    }

    #[test]
    fn test_head_is_full_height() {
        let head: NonNull<Head<u64, String>> = Head::new();

        unsafe {
            for level in 0..HEIGHT {
                assert!(head
                    .as_ref()
                    .forwards[level]
                    .load(Ordering::Relaxed)
                    .is_null());
            }

            Head::drop(head);
        }
    }

    #[test]
    fn test_drop_runs_destructors() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        struct Tracked(Arc<AtomicUsize>);

        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let entry = Entry::new(7, Tracked(drops.clone()), 1);

        unsafe { Entry::drop(entry) };

        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
