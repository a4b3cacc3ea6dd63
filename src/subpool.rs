//! Subpool allocator: a malloc/realloc/free heap bound to a fixed
//! contiguous byte range.
//!
//! The symmetric heap manager carves user allocations out of its RMA window
//! with one of these. Free-space tracking is delegated to
//! `linked_list_allocator`; every block carries a small header
//! (`{magic, size, align, offset}`) in front of the user pointer so `free`
//! and `realloc` can recover the layout without a side table.
//!
//! Out-of-memory is reported with a null pointer and never escalated; the
//! caller decides whether an empty heap is fatal.

use core::alloc::Layout;
use core::mem;
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;
use spin::Mutex;

use crate::{sh_trace, sh_warn};

/// Marks a live block header.
const BLOCK_MAGIC: u64 = u64::from_be_bytes(*b"SHOALBLK");

/// Default alignment of returned addresses.
pub const DEFAULT_ALIGN: usize = 8;

/// Upper bound on region bytes consumed by free-list bookkeeping
/// (beyond the per-block headers).
pub const BOOKKEEPING_LIMIT: usize = 128 * mem::size_of::<usize>();

#[repr(C)]
struct BlockHeader {
    magic: u64,
    /// User bytes requested.
    size: u64,
    /// Alignment the block was allocated with.
    align: u64,
    /// Distance from the underlying block to the user pointer.
    offset: u64,
}

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

#[derive(Clone, Copy, Debug, Default)]
pub struct SubpoolStats {
    pub allocations: u64,
    pub frees: u64,
    pub peak_used: usize,
}

struct Inner {
    heap: Heap,
    stats: SubpoolStats,
}

/// A heap over `[base, base + size)`. All state lives inside the region or
/// in this handle; destroying the subpool returns the whole range to its
/// owner.
pub struct Subpool {
    inner: Mutex<Inner>,
    base: usize,
    size: usize,
}

impl Subpool {
    /// Bind a heap to the region. Returns `None` when the region is too
    /// small to hold the free-list bookkeeping.
    ///
    /// # Safety contract
    /// `base..base + size` must be valid writable memory owned by the
    /// caller for the lifetime of the subpool.
    pub fn create(base: *mut u8, size: usize) -> Option<Subpool> {
        if base.is_null() || size < BOOKKEEPING_LIMIT {
            return None;
        }
        let mut heap = Heap::empty();
        unsafe { heap.init(base, size) };
        Some(Subpool {
            inner: Mutex::new(Inner {
                heap,
                stats: SubpoolStats::default(),
            }),
            base: base as usize,
            size,
        })
    }

    /// Tear the heap down; returns the number of bytes handed back to the
    /// region owner.
    pub fn destroy(self) -> usize {
        self.size
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        let p = ptr as usize;
        p >= self.base && p < self.base + self.size
    }

    pub fn used(&self) -> usize {
        self.inner.lock().heap.used()
    }

    pub fn free_bytes(&self) -> usize {
        self.inner.lock().heap.free()
    }

    pub fn stats(&self) -> SubpoolStats {
        self.inner.lock().stats
    }

    pub fn malloc(&self, size: usize) -> *mut u8 {
        self.memalign(DEFAULT_ALIGN, size)
    }

    /// Allocate `size` bytes aligned to the power-of-two `align`.
    pub fn memalign(&self, align: usize, size: usize) -> *mut u8 {
        let align = align.max(DEFAULT_ALIGN);
        if !align.is_power_of_two() {
            sh_warn!("memalign: alignment {} is not a power of two", align);
            return ptr::null_mut();
        }
        // The header sits in the gap between the block start and the user
        // pointer; the gap is a multiple of the alignment.
        let offset = align.max(HEADER_SIZE);
        let total = match offset.checked_add(size) {
            Some(t) => t,
            None => return ptr::null_mut(),
        };
        let layout = match Layout::from_size_align(total, align) {
            Ok(l) => l,
            Err(_) => return ptr::null_mut(),
        };

        let mut inner = self.inner.lock();
        let block = match inner.heap.allocate_first_fit(layout) {
            Ok(nn) => nn.as_ptr(),
            Err(_) => {
                sh_trace!("subpool exhausted: {} bytes requested", size);
                return ptr::null_mut();
            }
        };
        inner.stats.allocations += 1;
        let used = inner.heap.used();
        if used > inner.stats.peak_used {
            inner.stats.peak_used = used;
        }
        drop(inner);

        unsafe {
            let user = block.add(offset);
            let header = user.sub(HEADER_SIZE) as *mut BlockHeader;
            header.write(BlockHeader {
                magic: BLOCK_MAGIC,
                size: size as u64,
                align: align as u64,
                offset: offset as u64,
            });
            user
        }
    }

    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if !self.contains(ptr) {
            sh_warn!("free: {:p} is outside the subpool region", ptr);
            return;
        }
        unsafe {
            let header = ptr.sub(HEADER_SIZE) as *mut BlockHeader;
            if (*header).magic != BLOCK_MAGIC {
                sh_warn!("free: {:p} is not a live subpool block", ptr);
                return;
            }
            let offset = (*header).offset as usize;
            let total = offset + (*header).size as usize;
            let align = (*header).align as usize;
            // Kill the magic so a double free is caught above.
            (*header).magic = 0;

            let block = ptr.sub(offset);
            let layout = Layout::from_size_align_unchecked(total, align);
            let mut inner = self.inner.lock();
            inner.heap.deallocate(NonNull::new_unchecked(block), layout);
            inner.stats.frees += 1;
        }
    }

    /// Resize `ptr` to `size` bytes, preserving contents up to the smaller
    /// of the two sizes and the original alignment. On failure the old
    /// block is left untouched and null is returned.
    pub fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(size);
        }
        if !self.contains(ptr) {
            sh_warn!("realloc: {:p} is outside the subpool region", ptr);
            return ptr::null_mut();
        }
        let (old_size, align) = unsafe {
            let header = ptr.sub(HEADER_SIZE) as *const BlockHeader;
            if (*header).magic != BLOCK_MAGIC {
                sh_warn!("realloc: {:p} is not a live subpool block", ptr);
                return ptr::null_mut();
            }
            ((*header).size as usize, (*header).align as usize)
        };

        let fresh = self.memalign(align, size);
        if fresh.is_null() {
            return ptr::null_mut();
        }
        unsafe { ptr::copy_nonoverlapping(ptr, fresh, old_size.min(size)) };
        self.free(ptr);
        fresh
    }
}

// The heap hands out raw pointers but all book-keeping sits behind the
// mutex; the region itself is owned by the symmetric window.
unsafe impl Send for Subpool {}
unsafe impl Sync for Subpool {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::alloc;

    /// Page-aligned scratch region for hosting a subpool.
    struct Arena {
        ptr: *mut u8,
        layout: Layout,
    }

    impl Arena {
        fn new(size: usize) -> Arena {
            let layout = Layout::from_size_align(size, 4096).unwrap();
            let ptr = unsafe { alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Arena { ptr, layout }
        }
    }

    impl Drop for Arena {
        fn drop(&mut self) {
            unsafe { alloc::dealloc(self.ptr, self.layout) };
        }
    }

    #[test]
    fn create_rejects_tiny_regions() {
        let arena = Arena::new(4096);
        assert!(Subpool::create(arena.ptr, 16).is_none());
        assert!(Subpool::create(core::ptr::null_mut(), 4096).is_none());
    }

    #[test]
    fn malloc_free_restores_free_bytes() {
        let arena = Arena::new(1 << 16);
        let pool = Subpool::create(arena.ptr, 1 << 16).unwrap();
        let before = pool.free_bytes();
        let p = pool.malloc(1000);
        assert!(!p.is_null());
        assert!(pool.contains(p));
        assert!(pool.free_bytes() < before);
        pool.free(p);
        assert_eq!(pool.free_bytes(), before);
        assert_eq!(pool.destroy(), 1 << 16);
    }

    #[test]
    fn default_alignment_is_eight() {
        let arena = Arena::new(1 << 16);
        let pool = Subpool::create(arena.ptr, 1 << 16).unwrap();
        for size in [1usize, 3, 8, 17, 100] {
            let p = pool.malloc(size);
            assert!(!p.is_null());
            assert_eq!(p as usize % DEFAULT_ALIGN, 0);
        }
    }

    #[test]
    fn memalign_honors_powers_of_two() {
        let arena = Arena::new(1 << 18);
        let pool = Subpool::create(arena.ptr, 1 << 18).unwrap();
        for align in [8usize, 16, 64, 256, 4096] {
            let p = pool.memalign(align, 100);
            assert!(!p.is_null(), "align {}", align);
            assert_eq!(p as usize % align, 0, "align {}", align);
            pool.free(p);
        }
        assert!(pool.memalign(24, 8).is_null());
    }

    #[test]
    fn exhaustion_returns_null() {
        let arena = Arena::new(1 << 12);
        let pool = Subpool::create(arena.ptr, 1 << 12).unwrap();
        assert!(pool.malloc(1 << 20).is_null());
        // The heap still works afterwards.
        let p = pool.malloc(64);
        assert!(!p.is_null());
    }

    #[test]
    fn realloc_preserves_contents() {
        let arena = Arena::new(1 << 16);
        let pool = Subpool::create(arena.ptr, 1 << 16).unwrap();
        let p = pool.malloc(16);
        unsafe {
            for i in 0..16 {
                p.add(i).write(i as u8);
            }
        }
        let q = pool.realloc(p, 64);
        assert!(!q.is_null());
        unsafe {
            for i in 0..16 {
                assert_eq!(q.add(i).read(), i as u8);
            }
        }
        let r = pool.realloc(q, 4);
        assert!(!r.is_null());
        unsafe {
            for i in 0..4 {
                assert_eq!(r.add(i).read(), i as u8);
            }
        }
        pool.free(r);
    }

    #[test]
    fn free_tolerates_null_and_foreign_pointers() {
        let arena = Arena::new(1 << 14);
        let pool = Subpool::create(arena.ptr, 1 << 14).unwrap();
        pool.free(core::ptr::null_mut());
        let mut local = 0u64;
        pool.free(&mut local as *mut u64 as *mut u8);
        // Double free is swallowed by the magic check.
        let p = pool.malloc(32);
        pool.free(p);
        let frees = pool.stats().frees;
        pool.free(p);
        assert_eq!(pool.stats().frees, frees);
    }

    proptest! {
        #[test]
        fn blocks_never_overlap(requests in prop::collection::vec((1usize..512, 0u32..5), 1..24)) {
            let arena = Arena::new(1 << 18);
            let pool = Subpool::create(arena.ptr, 1 << 18).unwrap();
            let before = pool.free_bytes();
            let mut live: Vec<(usize, usize)> = Vec::new();

            for (size, align_exp) in requests {
                let align = DEFAULT_ALIGN << align_exp;
                let p = pool.memalign(align, size);
                prop_assert!(!p.is_null());
                prop_assert_eq!(p as usize % align, 0);
                prop_assert!(pool.contains(p));
                let last_byte = unsafe { p.add(size.saturating_sub(1)) };
                prop_assert!(pool.contains(last_byte));
                let span = (p as usize, p as usize + size);
                for &(s, e) in &live {
                    prop_assert!(span.1 <= s || span.0 >= e, "blocks overlap");
                }
                live.push(span);
            }

            for (s, _) in &live {
                pool.free(*s as *mut u8);
            }
            prop_assert_eq!(pool.free_bytes(), before);
        }
    }
}
