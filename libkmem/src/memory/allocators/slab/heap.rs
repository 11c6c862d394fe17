//! General purpose allocation on top of a ladder of object caches.

use super::{
    cache::{ObjectCache, SlabPool},
    slab::SlabGeometry,
};
use crate::{
    error::{KernelError, Result},
    memory::{WORD_SIZE, allocators::page_supply::PageSource},
};
use core::ptr::{self, NonNull};
use log::warn;

/// Object sizes served by [`KernelHeap`].
pub const SIZE_CLASSES: [usize; 12] = [8, 16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512];

const CLASS_NAMES: [&str; SIZE_CLASSES.len()] = [
    "kmalloc-8",
    "kmalloc-16",
    "kmalloc-24",
    "kmalloc-32",
    "kmalloc-48",
    "kmalloc-64",
    "kmalloc-96",
    "kmalloc-128",
    "kmalloc-192",
    "kmalloc-256",
    "kmalloc-384",
    "kmalloc-512",
];

/// Largest request the heap serves.
pub const MAX_HEAP_ALLOC: usize = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

/// Each class is aligned to the largest power of two dividing its size.
pub const fn class_align(size: usize) -> usize {
    1 << size.trailing_zeros()
}

/// Index of the first class that holds `size` bytes aligned to `align`.
pub fn class_index(size: usize, align: usize) -> Result<usize> {
    if !align.is_power_of_two() {
        return Err(KernelError::InvalidArgument);
    }

    let size = size.max(WORD_SIZE);

    SIZE_CLASSES
        .iter()
        .position(|&class| class >= size && class_align(class) >= align)
        .ok_or(KernelError::SizeTooLarge)
}

pub struct KernelHeap<P: PageSource> {
    classes: [ObjectCache; SIZE_CLASSES.len()],
    pool: SlabPool<P>,
}

impl<P: PageSource> KernelHeap<P> {
    pub fn new(pages: P) -> Result<Self> {
        let mut geometry = [SlabGeometry::default(); SIZE_CLASSES.len()];

        for (g, &size) in geometry.iter_mut().zip(SIZE_CLASSES.iter()) {
            *g = SlabGeometry::new(size, class_align(size)).ok_or(KernelError::SizeTooLarge)?;
        }

        Ok(Self {
            classes: core::array::from_fn(|i| {
                ObjectCache::with_geometry(CLASS_NAMES[i], geometry[i], None, None)
            }),
            pool: SlabPool::new(pages)?,
        })
    }

    pub fn classes(&self) -> &[ObjectCache] {
        &self.classes
    }

    pub fn pages(&self) -> &P {
        self.pool.pages()
    }

    pub fn pages_mut(&mut self) -> &mut P {
        self.pool.pages_mut()
    }

    /// The class cache currently holding live object `addr`.
    fn owner_of(&self, addr: usize) -> Option<usize> {
        self.classes.iter().position(|cache| cache.owns(addr))
    }

    /// Size of the class holding `ptr`, or `None` if no class does.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.owner_of(ptr.as_ptr() as usize)
            .map(|idx| self.classes[idx].object_size())
    }

    pub fn alloc(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let idx = class_index(size, align)?;

        self.classes[idx].alloc(&mut self.pool)
    }

    pub fn alloc_zeroed(
        &mut self,
        elem_size: usize,
        count: usize,
        align: usize,
    ) -> Result<NonNull<u8>> {
        let size = elem_size
            .checked_mul(count)
            .ok_or(KernelError::SizeTooLarge)?;

        let ptr = self.alloc(size, align)?;

        // SAFETY: The object is at least `size` bytes and was just handed to
        // us.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };

        Ok(ptr)
    }

    /// Moves `ptr` into an object of `new_size` bytes. On failure `ptr` is
    /// left untouched and nothing new stays allocated.
    ///
    /// `ptr` must be a live object: a freed pointer or one into the middle
    /// of an object is rejected with `InvalidArgument`.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after the call succeeds.
    pub unsafe fn realloc(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>> {
        let old = self
            .owner_of(ptr.as_ptr() as usize)
            .ok_or(KernelError::NotFound)?;

        // SAFETY: The owner scan found the slab `ptr` lives in.
        unsafe { self.classes[old].check_live(ptr)? };

        let new = class_index(new_size, align)?;
        let new_ptr = self.classes[new].alloc(&mut self.pool)?;
        let len = self.classes[old].object_size().min(new_size);

        // SAFETY: Both are live slot starts, so they are distinct objects of
        // at least `len` bytes.
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), len) };

        // SAFETY: The caller gives up `ptr`.
        if let Err(e) = unsafe { self.classes[old].free(ptr, &mut self.pool) } {
            // SAFETY: `new_ptr` was never handed out.
            if let Err(e) = unsafe { self.classes[new].free(new_ptr, &mut self.pool) } {
                warn!("kheap: could not undo realloc of {:p}: {e}", ptr.as_ptr());
            }

            return Err(e);
        }

        Ok(new_ptr)
    }

    /// Returns `ptr` to the class it came from. Pointers that no class owns
    /// are logged and ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after the call.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let Some(idx) = self.owner_of(ptr.as_ptr() as usize) else {
            warn!("kheap: free of unknown pointer {:p}", ptr.as_ptr());
            return Ok(());
        };

        // SAFETY: The owner scan found the slab `ptr` lives in.
        unsafe { self.classes[idx].free(ptr, &mut self.pool) }
    }

    /// Allocates from a caller-owned cache, sharing the heap's pages and
    /// free-buffer nodes.
    pub fn cache_alloc(&mut self, cache: &mut ObjectCache) -> Result<NonNull<u8>> {
        cache.alloc(&mut self.pool)
    }

    /// # Safety
    ///
    /// `ptr` must come from [`KernelHeap::cache_alloc`] on the same `cache`
    /// and must not be used after the call succeeds.
    pub unsafe fn cache_free(&mut self, cache: &mut ObjectCache, ptr: NonNull<u8>) -> Result<()> {
        unsafe { cache.free(ptr, &mut self.pool) }
    }

    /// Tears down a caller-owned cache, giving its pages back to the heap's
    /// page source.
    pub fn destroy_cache(&mut self, cache: &mut ObjectCache) -> Result<usize> {
        cache.destroy(&mut self.pool)
    }

    /// Returns every empty slab to the page source. Returns the number of
    /// pages released.
    pub fn reclaim(&mut self) -> usize {
        let mut released = 0;

        for cache in self.classes.iter_mut() {
            released += cache.reap(&mut self.pool);
        }

        // Reaping the classes frees nodes, so the node cache goes last.
        released + self.pool.reap_nodes()
    }
}

#[cfg(feature = "sync")]
mod locked {
    use super::KernelHeap;
    use crate::{
        CpuOps,
        error::{KernelError, Result},
        memory::allocators::page_supply::PageSource,
        sync::spinlock::{SpinLockIrq, SpinLockIrqGuard},
    };
    use core::{
        alloc::{GlobalAlloc, Layout},
        ptr::{self, NonNull},
    };

    /// A [`KernelHeap`] behind an interrupt-disabling spinlock, usable as the
    /// `#[global_allocator]`. Allocations fail (return null) until
    /// [`LockedHeap::init`] is called.
    pub struct LockedHeap<P: PageSource, CPU: CpuOps> {
        inner: SpinLockIrq<Option<KernelHeap<P>>, CPU>,
    }

    impl<P: PageSource, CPU: CpuOps> Default for LockedHeap<P, CPU> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<P: PageSource, CPU: CpuOps> LockedHeap<P, CPU> {
        pub const fn new() -> Self {
            Self {
                inner: SpinLockIrq::new(None),
            }
        }

        /// Installs the heap. Fails with `InvalidArgument` if already done.
        pub fn init(&self, pages: P) -> Result<()> {
            let mut inner = self.inner.lock_save_irq();

            if inner.is_some() {
                return Err(KernelError::InvalidArgument);
            }

            *inner = Some(KernelHeap::new(pages)?);

            Ok(())
        }

        pub fn lock(&self) -> SpinLockIrqGuard<'_, Option<KernelHeap<P>>, CPU> {
            self.inner.lock_save_irq()
        }

        pub fn reclaim(&self) -> usize {
            self.inner
                .lock_save_irq()
                .as_mut()
                .map_or(0, |heap| heap.reclaim())
        }

        fn with_heap<T>(&self, f: impl FnOnce(&mut KernelHeap<P>) -> Result<T>) -> Option<T> {
            // Drop the lock before panicking.
            let res = f(self.inner.lock_save_irq().as_mut()?);

            match res {
                Ok(v) => Some(v),
                Err(e) if e.is_fatal() => panic!("kheap: {e}"),
                Err(_) => None,
            }
        }
    }

    unsafe impl<P: PageSource, CPU: CpuOps> GlobalAlloc for LockedHeap<P, CPU> {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            self.with_heap(|heap| heap.alloc(layout.size(), layout.align()))
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        }

        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            self.with_heap(|heap| heap.alloc_zeroed(layout.size(), 1, layout.align()))
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            if let Some(ptr) = NonNull::new(ptr) {
                // SAFETY: The caller gives up `ptr`.
                self.with_heap(|heap| unsafe { heap.free(ptr) });
            }
        }

        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            let Some(ptr) = NonNull::new(ptr) else {
                return ptr::null_mut();
            };

            // SAFETY: On success the caller no longer uses `ptr`.
            self.with_heap(|heap| unsafe { heap.realloc(ptr, new_size, layout.align()) })
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        }
    }
}

#[cfg(feature = "sync")]
pub use locked::LockedHeap;
