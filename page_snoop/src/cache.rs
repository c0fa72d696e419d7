//! Fixed-size record of the most recently first-touched pages.
//!
//! The cache is a circular buffer with a single write cursor. The slot under
//! the cursor is the oldest entry; recording a page overwrites it and hands
//! the previous occupant back to the caller so it can be protected again.
//!
//! `record` runs inside the SIGSEGV handler: it only reads and writes the
//! slot array and never allocates.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use crate::buffer::PageBuffer;
use crate::error::TraceError;
use crate::PageRange;

/// A cache slot. `None` is a slot that was never filled; it has the same
/// layout as a zero address, so a zeroed mapping is an empty cache.
pub type Slot = Option<NonZeroUsize>;

#[repr(C)]
#[derive(Debug, Clone)]
pub struct PageCache<S> {
    next_slot: usize,
    slots: S,
}

impl PageCache<Vec<Slot>> {
    pub fn with_capacity(capacity: usize) -> PageCache<Vec<Slot>> {
        PageCache::new(vec![None; capacity])
    }
}

impl<S> PageCache<S>
where
    S: AsRef<[Slot]> + AsMut<[Slot]>,
{
    /// Wrap `slots` as an empty-cursor cache. `slots` must not be empty.
    pub fn new(slots: S) -> PageCache<S> {
        assert!(!slots.as_ref().is_empty(), "page cache needs at least one slot");
        PageCache {
            next_slot: 0,
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.as_ref().len()
    }

    /// Index of the oldest slot, which the next `record` overwrites.
    pub fn next_slot(&self) -> usize {
        self.next_slot
    }

    /// Number of filled slots.
    pub fn len(&self) -> usize {
        self.slots.as_ref().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.as_ref().iter().all(|s| s.is_none())
    }

    pub fn contains(&self, page: usize) -> bool {
        self.slots
            .as_ref()
            .iter()
            .any(|s| s.map(NonZeroUsize::get) == Some(page))
    }

    /// Record a first touch of `page`, returning the evicted page if the
    /// oldest slot was occupied.
    ///
    /// A resident page is left alone: it is read-write and cannot fault
    /// again until evicted, so a repeat only comes from a spurious fault.
    /// This also keeps the page that was just made accessible from being the
    /// one handed back for protection.
    ///
    /// The residency check scans every slot, so each fault costs O(capacity).
    pub fn record(&mut self, page: usize) -> Option<usize> {
        let page = NonZeroUsize::new(page)?;
        if self.contains(page.get()) {
            return None;
        }
        let capacity = self.capacity();
        let slot = &mut self.slots.as_mut()[self.next_slot];
        let evicted = slot.replace(page);
        self.next_slot = (self.next_slot + 1) % capacity;
        evicted.map(NonZeroUsize::get)
    }

    /// Slots from oldest to newest, starting at the cursor.
    pub fn iter(&self) -> impl Iterator<Item = Slot> + '_ {
        let slots = self.slots.as_ref();
        let (newer, older) = slots.split_at(self.next_slot);
        older.iter().chain(newer.iter()).copied()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            slots: self.iter().collect(),
        }
    }
}

/// Copy of the cache contents, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub slots: Vec<Slot>,
}

impl CacheSnapshot {
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Addresses of every slot, empty slots as zero.
    pub fn addresses(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().map(|s| s.map_or(0, NonZeroUsize::get))
    }

    /// Addresses of the filled slots only.
    pub fn pages(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().filter_map(|s| s.map(NonZeroUsize::get))
    }

    pub fn occupied(&self) -> usize {
        self.pages().count()
    }
}

/// Slot storage living in memory the tracer does not own through a `Vec`.
#[derive(Debug)]
pub struct RawSlots {
    ptr: NonNull<Slot>,
    len: usize,
}

impl AsRef<[Slot]> for RawSlots {
    fn as_ref(&self) -> &[Slot] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl AsMut<[Slot]> for RawSlots {
    fn as_mut(&mut self) -> &mut [Slot] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// The cache as the signal handler sees it.
pub type SharedCache = PageCache<RawSlots>;

/// A `SharedCache` and its slots laid out in one dedicated mapping: the
/// header first, the slot array right behind it.
#[derive(Debug)]
pub struct CacheArena {
    buffer: PageBuffer,
    cache: NonNull<SharedCache>,
}

impl CacheArena {
    pub fn new(capacity: usize) -> Result<CacheArena, TraceError> {
        if capacity == 0 {
            return Err(TraceError::ZeroCapacity);
        }
        let slots_offset = align_up(
            std::mem::size_of::<SharedCache>(),
            std::mem::align_of::<Slot>(),
        );
        let len = capacity
            .saturating_mul(std::mem::size_of::<Slot>())
            .saturating_add(slots_offset);
        let buffer = PageBuffer::map(len)?;

        // The mapping is zeroed, which is an all-`None` slot array.
        let cache = unsafe {
            let base = buffer.as_mut_ptr();
            let slots = NonNull::new_unchecked(base.add(slots_offset) as *mut Slot);
            let cache = base as *mut SharedCache;
            cache.write(PageCache::new(RawSlots {
                ptr: slots,
                len: capacity,
            }));
            NonNull::new_unchecked(cache)
        };
        Ok(CacheArena { buffer, cache })
    }

    /// Pointer published to the fault handler.
    pub fn as_ptr(&self) -> *mut SharedCache {
        self.cache.as_ptr()
    }

    /// Pages that must stay accessible while tracing.
    pub fn range(&self) -> PageRange {
        self.buffer.range()
    }

    /// Shared view of the cache.
    ///
    /// Only meaningful while the active handler is not installed; during
    /// tracing the handler mutates the cache behind this reference.
    pub fn cache(&self) -> &SharedCache {
        unsafe { self.cache.as_ref() }
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
