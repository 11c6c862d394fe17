//! Free list of page-sized units feeding the slab layer.
//!
//! Free memory is kept as runs of contiguous pages. The bookkeeping for each
//! run is written into its own first page, so the supply costs no memory
//! beyond the pages it holds. Pages come in at boot (a reserved region, or a
//! block taken from the buddy allocator) and whenever the reclaim path hands
//! back the page of an empty slab.

use super::buddy::{BuddyAllocator, MemoryBlock};
use crate::{
    error::Result,
    memory::{PAGE_SIZE, align_down, align_up, is_aligned},
};
use core::ptr::NonNull;
use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};
use log::trace;

/// A source of single, page-aligned pages.
pub trait PageSource {
    /// Returns exactly one page-aligned page of `PAGE_SIZE` bytes, or `None`
    /// when the source is exhausted.
    fn acquire_page(&mut self) -> Option<NonNull<u8>>;

    /// Gives a page back to the source.
    ///
    /// # Safety
    ///
    /// `page` must have been returned by [`PageSource::acquire_page`] on this
    /// source and must no longer be referenced.
    unsafe fn release_page(&mut self, page: NonNull<u8>);
}

/// Header written at the start of every free run.
struct PageRun {
    link: LinkedListLink,
    /// One past the last byte of the run.
    end: usize,
}

intrusive_adapter!(PageRunAdapter = UnsafeRef<PageRun>: PageRun { link => LinkedListLink });

pub struct PageSupply {
    runs: LinkedList<PageRunAdapter>,
    free_pages: usize,
}

// SAFETY: The runs are memory owned exclusively by the supply; nothing else
// holds references into them.
unsafe impl Send for PageSupply {}

impl Default for PageSupply {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSupply {
    pub fn new() -> Self {
        Self {
            runs: LinkedList::new(PageRunAdapter::new()),
            free_pages: 0,
        }
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    /// # Safety
    ///
    /// `[start, end)` must be page aligned, writable and owned by the supply.
    unsafe fn push_run(&mut self, start: usize, end: usize) {
        let run = start as *mut PageRun;

        unsafe {
            run.write(PageRun {
                link: LinkedListLink::new(),
                end,
            });

            self.runs.push_front(UnsafeRef::from_raw(run));
        }
    }

    /// Adds the whole pages inside `[start, start + len)` to the supply.
    /// Returns the number of pages added.
    ///
    /// # Safety
    ///
    /// The region must be writable, unused by anything else, and stay valid
    /// for as long as the supply (or anyone it hands pages to) uses it.
    pub unsafe fn add_region(&mut self, start: usize, len: usize) -> usize {
        let first = align_up(start, PAGE_SIZE);
        let end = align_down(start + len, PAGE_SIZE);

        if first >= end {
            return 0;
        }

        // SAFETY: The bounds were page aligned above and the caller vouches
        // for the memory.
        unsafe { self.push_run(first, end) };

        let pages = (end - first) / PAGE_SIZE;
        self.free_pages += pages;

        trace!("page supply: added {pages} pages at {first:#x}");

        pages
    }

    /// Takes a block of at least `bytes` from `buddy` and adds its pages to
    /// the supply. The block is owned by the supply from then on.
    pub fn refill_from(
        &mut self,
        buddy: &mut BuddyAllocator<'_>,
        bytes: usize,
    ) -> Result<MemoryBlock> {
        let block = buddy.allocate_block(bytes.max(PAGE_SIZE))?;

        // SAFETY: The buddy allocator handed out exclusive ownership of the
        // block.
        unsafe { self.add_region(block.addr, block.size) };

        Ok(block)
    }

    pub fn acquire_page(&mut self) -> Option<NonNull<u8>> {
        let run = UnsafeRef::into_raw(self.runs.pop_front()?);
        let start = run as usize;

        // SAFETY: Every run on the list was written by `push_run`.
        let end = unsafe { (*run).end };

        if start + PAGE_SIZE < end {
            // SAFETY: The rest of the run is still owned by the supply.
            unsafe { self.push_run(start + PAGE_SIZE, end) };
        }

        self.free_pages -= 1;

        NonNull::new(start as *mut u8)
    }

    /// # Safety
    ///
    /// `page` must be a page-aligned page that is no longer referenced by
    /// anything else.
    pub unsafe fn release_page(&mut self, page: NonNull<u8>) {
        let addr = page.as_ptr() as usize;

        debug_assert!(is_aligned(addr, PAGE_SIZE), "released page is not aligned");

        unsafe { self.push_run(addr, addr + PAGE_SIZE) };

        self.free_pages += 1;
    }
}

impl PageSource for PageSupply {
    fn acquire_page(&mut self) -> Option<NonNull<u8>> {
        PageSupply::acquire_page(self)
    }

    unsafe fn release_page(&mut self, page: NonNull<u8>) {
        unsafe { PageSupply::release_page(self, page) }
    }
}
