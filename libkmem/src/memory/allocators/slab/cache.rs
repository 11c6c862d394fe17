//! Object caches: slabs of same-sized objects.
//!
//! An [`ObjectCache`] keeps its slabs on three lists by occupancy:
//!
//! - `free`: no objects handed out. Kept around so the next allocation does
//!   not need a new page, until [`ObjectCache::reap`] returns them.
//! - `partial`: some objects handed out. Allocation is served from here
//!   first.
//! - `full`: every slot handed out.
//!
//! A slab moves between lists whenever its occupancy changes state, so the
//! list a slab is on always matches its reference count.
//!
//! # Ownership
//!
//! A page becomes the exclusive property of the cache once it has been turned
//! into a slab by [`ObjectCache::init_slab`], and stays so until
//! [`ObjectCache::destroy_slab`] gives it back to the page source. Holding
//! `&mut ObjectCache` therefore means holding exclusive access to every slab
//! header on its lists.

use super::slab::{
    FreeBufNode, ObjectCtor, ObjectDtor, SlabAdapter, SlabGeometry, SlabHeader, SlabRef, SlabState,
};
use crate::{
    error::{KernelError, Result},
    memory::{PAGE_SIZE, WORD_SIZE, align_up, allocators::page_supply::PageSource},
};
use core::{mem, ptr::NonNull};
use intrusive_collections::{LinkedList, UnsafeRef};
use log::{debug, error, trace, warn};

/// Where a cache gets its pages and, for large-object slabs, the nodes that
/// record free buffers.
pub trait SlabBackend: PageSource {
    fn alloc_node(&mut self) -> Result<NonNull<FreeBufNode>>;

    /// # Safety
    ///
    /// `node` must come from [`SlabBackend::alloc_node`] on this backend and
    /// no longer be linked into any slab.
    unsafe fn free_node(&mut self, node: NonNull<FreeBufNode>);
}

/// Occupancy snapshot of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub free_slabs: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    /// Objects currently handed out.
    pub live_objects: usize,
}

impl CacheStats {
    pub fn slabs(&self) -> usize {
        self.free_slabs + self.partial_slabs + self.full_slabs
    }
}

pub struct ObjectCache {
    name: &'static str,
    geometry: SlabGeometry,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
    free: LinkedList<SlabAdapter>,
    partial: LinkedList<SlabAdapter>,
    full: LinkedList<SlabAdapter>,
}

// SAFETY: Slab headers are only reachable through the cache's lists, and the
// cache is only mutated through `&mut self`.
unsafe impl Send for ObjectCache {}

impl ObjectCache {
    /// Creates an empty cache of `object_size` byte objects aligned to
    /// `align`. Both are raised to at least one machine word and the size is
    /// rounded up to a whole number of words.
    ///
    /// Fails with `InvalidArgument` for an alignment that is not a power of
    /// two or exceeds a page, and with `SizeTooLarge` if not even one object
    /// fits in a slab.
    pub fn new(
        name: &'static str,
        object_size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> Result<Self> {
        if !align.is_power_of_two() || align > PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }

        let object_size = align_up(object_size.max(WORD_SIZE), WORD_SIZE);
        let align = align.max(WORD_SIZE);

        let geometry = SlabGeometry::new(object_size, align).ok_or(KernelError::SizeTooLarge)?;

        Ok(Self::with_geometry(name, geometry, ctor, dtor))
    }

    pub(super) fn with_geometry(
        name: &'static str,
        geometry: SlabGeometry,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> Self {
        debug!(
            "slab: cache '{name}': {} byte objects, {} per slab, {} colors{}",
            geometry.object_size,
            geometry.capacity,
            geometry.colors,
            if geometry.large { ", free-list tracked" } else { "" }
        );

        Self {
            name,
            geometry,
            ctor,
            dtor,
            free: LinkedList::new(SlabAdapter::new()),
            partial: LinkedList::new(SlabAdapter::new()),
            full: LinkedList::new(SlabAdapter::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.geometry.object_size
    }

    pub fn align(&self) -> usize {
        self.geometry.align
    }

    pub fn geometry(&self) -> &SlabGeometry {
        &self.geometry
    }

    fn list(&mut self, state: SlabState) -> &mut LinkedList<SlabAdapter> {
        match state {
            SlabState::Free => &mut self.free,
            SlabState::Partial => &mut self.partial,
            SlabState::Full => &mut self.full,
        }
    }

    /// Color for the next slab: one past the color of the most recently
    /// linked slab, wrapping at the number of colors.
    fn next_color(&self) -> usize {
        [&self.free, &self.partial, &self.full]
            .into_iter()
            .find_map(|list| list.front().get())
            .map_or(0, |slab| (slab.color() + 1) % self.geometry.colors)
    }

    /// Moves a slab to the list matching its new state.
    fn relink(&mut self, slab: SlabRef, from: SlabState, to: SlabState) {
        if from == to {
            return;
        }

        // SAFETY: `from` is the state the slab was in, so it is linked on that
        // list.
        let unlinked = unsafe { self.list(from).cursor_mut_from_ptr(slab.as_ptr()) }.remove();

        if let Some(slab) = unlinked {
            self.list(to).push_front(slab);
        }
    }

    /// Turns `page` into an empty slab and links it at the head of the free
    /// list. Runs the constructor over every slot and, for large objects,
    /// records each slot as free with a node from `backend`.
    ///
    /// On failure the page is not linked and still belongs to the caller.
    ///
    /// # Safety
    ///
    /// `page` must be a page of at least the slab span, aligned to it, and
    /// exclusively owned by the caller. Ownership passes to the cache on
    /// success.
    pub unsafe fn init_slab(
        &mut self,
        page: NonNull<u8>,
        backend: &mut impl SlabBackend,
    ) -> Result<SlabRef> {
        let color = self.next_color();

        // SAFETY: The caller hands over the page.
        let slab = unsafe { SlabHeader::init(page, &self.geometry, color) };
        // SAFETY: We just wrote the header and own the page.
        let header = unsafe { slab.header_mut() };

        if let Some(ctor) = self.ctor {
            for idx in 0..header.capacity() {
                ctor(header.slot(idx), self.geometry.object_size);
            }
        }

        if self.geometry.large {
            // Push in reverse so the lowest slot is handed out first.
            for idx in (0..header.capacity()).rev() {
                let node = match backend.alloc_node() {
                    Ok(node) => node,
                    Err(e) => {
                        // SAFETY: Nothing was handed out from the slab.
                        let _ = unsafe {
                            header.teardown(None, 0, |node| backend.free_node(node))
                        };
                        return Err(e);
                    }
                };

                let slot = header.slot(idx);

                // SAFETY: The node is fresh from the backend.
                unsafe { header.push_free_node(node, slot) };
            }
        }

        // SAFETY: The slab is exclusively owned by this cache from now on.
        self.free
            .push_front(unsafe { UnsafeRef::from_raw(slab.as_ptr()) });

        trace!(
            "slab: cache '{}': new slab at {:#x}, color {color}",
            self.name,
            slab.base()
        );

        Ok(slab)
    }

    fn grow(&mut self, backend: &mut impl SlabBackend) -> Result<()> {
        let page = backend.acquire_page().ok_or(KernelError::OutOfMemory)?;

        // SAFETY: The page source gave us the page.
        if let Err(e) = unsafe { self.init_slab(page, backend) } {
            // SAFETY: `init_slab` failed, so the page is still ours.
            unsafe { backend.release_page(page) };
            return Err(e);
        }

        Ok(())
    }

    /// Hands out one object. Partial slabs are preferred over free ones; a
    /// new slab is built only when neither exists.
    pub fn alloc(&mut self, backend: &mut impl SlabBackend) -> Result<NonNull<u8>> {
        if self.partial.is_empty() && self.free.is_empty() {
            self.grow(backend)?;
        }

        let slab = self
            .partial
            .front()
            .get()
            .or_else(|| self.free.front().get())
            .map(SlabRef::from_header)
            .ok_or(KernelError::OutOfMemory)?;

        // SAFETY: We hold `&mut self`, so we have exclusive access to every
        // slab owned by this cache.
        let header = unsafe { slab.header_mut() };
        let before = header.state();

        let (obj, spent) = header.alloc_object().inspect_err(|e| {
            if *e == KernelError::CorruptionDetected {
                error!(
                    "slab: cache '{}': free-buffer list of slab {:#x} is corrupt",
                    self.name,
                    slab.base()
                );
            }
        })?;

        let after = header.state();

        if let Some(node) = spent {
            // SAFETY: The node was just unlinked from the slab.
            unsafe { backend.free_node(node) };
        }

        self.relink(slab, before, after);

        Ok(obj)
    }

    /// Returns an object to the slab it came from. The slab is found by
    /// masking the address down to the slab span.
    ///
    /// Double frees and pointers that are not the start of a slot are
    /// rejected with `InvalidArgument`.
    ///
    /// Large-object slabs need a free-buffer node for every returned object.
    /// If none can be had (the node cache was reaped and the page source is
    /// dry) this fails with `OutOfMemory` before touching the slab: `obj`
    /// stays allocated and the free can be retried once pages come back.
    ///
    /// # Safety
    ///
    /// `obj` must point into a slab page owned by this cache, and must not be
    /// used after the call succeeds.
    pub unsafe fn free(&mut self, obj: NonNull<u8>, backend: &mut impl SlabBackend) -> Result<()> {
        // SAFETY: The caller guarantees `obj` is inside one of our slabs.
        let slab = unsafe { SlabRef::from_object(obj) };
        // SAFETY: As above, and `&mut self` gives us exclusive access.
        let header = unsafe { slab.header_mut() };

        if !header.matches(&self.geometry) {
            warn!(
                "slab: cache '{}': {:p} does not belong to this cache",
                self.name,
                obj.as_ptr()
            );
            return Err(KernelError::InvalidArgument);
        }

        if let Err(e) = header.check_allocated(obj) {
            self.log_bad_free(slab, obj, e);
            return Err(e);
        }

        let before = header.state();

        let node = if header.is_large() {
            Some(backend.alloc_node()?)
        } else {
            None
        };

        // SAFETY: The caller gives up `obj`; `node` is fresh.
        if let Err(e) = unsafe { header.free_object(obj, node) } {
            if let Some(node) = node {
                // SAFETY: The node was never linked.
                unsafe { backend.free_node(node) };
            }

            self.log_bad_free(slab, obj, e);
            return Err(e);
        }

        let after = header.state();
        self.relink(slab, before, after);

        Ok(())
    }

    /// Checks that `obj` is a live object of this cache without changing
    /// anything.
    ///
    /// # Safety
    ///
    /// `obj` must point into a slab page owned by this cache.
    pub unsafe fn check_live(&self, obj: NonNull<u8>) -> Result<()> {
        // SAFETY: The caller guarantees `obj` is inside one of our slabs.
        let slab = unsafe { SlabRef::from_object(obj) };
        // SAFETY: As above; the header is only read.
        let header = unsafe { slab.header() };

        if !header.matches(&self.geometry) {
            return Err(KernelError::InvalidArgument);
        }

        header.check_allocated(obj).map(|_| ())
    }

    fn log_bad_free(&self, slab: SlabRef, obj: NonNull<u8>, e: KernelError) {
        match e {
            KernelError::CorruptionDetected => error!(
                "slab: cache '{}': free-buffer list of slab {:#x} is corrupt",
                self.name,
                slab.base()
            ),
            _ => warn!(
                "slab: cache '{}': bad free of {:p}",
                self.name,
                obj.as_ptr()
            ),
        }
    }

    /// Unlinks a slab, runs the destructor and gives its page back.
    ///
    /// # Safety
    ///
    /// `slab` must belong to this cache and none of its objects may be in
    /// use, now or later.
    pub unsafe fn destroy_slab(&mut self, slab: SlabRef, backend: &mut impl SlabBackend) {
        // SAFETY: The slab is ours, and `&mut self` gives us exclusive access.
        let header = unsafe { slab.header_mut() };
        let state = header.state();

        // SAFETY: The slab is linked on the list for its state.
        unsafe { self.list(state).cursor_mut_from_ptr(slab.as_ptr()) }.remove();

        // SAFETY: The caller guarantees no objects are in use.
        let res = unsafe {
            header.teardown(self.dtor, self.geometry.object_size, |node| {
                backend.free_node(node)
            })
        };

        if res.is_err() {
            error!(
                "slab: cache '{}': free-buffer list of slab {:#x} is corrupt, leaking its nodes",
                self.name,
                slab.base()
            );
        }

        // SAFETY: The slab is unlinked; nothing refers to the page anymore.
        unsafe { backend.release_page(slab.page()) };

        trace!(
            "slab: cache '{}': destroyed slab at {:#x}",
            self.name,
            slab.base()
        );
    }

    /// Destroys every slab on the free list. Returns how many pages were
    /// given back.
    pub fn reap(&mut self, backend: &mut impl SlabBackend) -> usize {
        let mut reaped = 0;

        while let Some(slab) = self.free.front().get().map(SlabRef::from_header) {
            // SAFETY: Slabs on the free list have no objects handed out.
            unsafe { self.destroy_slab(slab, backend) };
            reaped += 1;
        }

        if reaped > 0 {
            debug!("slab: cache '{}': reaped {reaped} slabs", self.name);
        }

        reaped
    }

    /// Tears the cache down. Refuses with `InvalidArgument` while any object
    /// is still handed out.
    pub fn destroy(&mut self, backend: &mut impl SlabBackend) -> Result<usize> {
        if !self.partial.is_empty() || !self.full.is_empty() {
            warn!(
                "slab: cache '{}': destroy with {} objects still live",
                self.name,
                self.stats().live_objects
            );
            return Err(KernelError::InvalidArgument);
        }

        Ok(self.reap(backend))
    }

    /// The state of the slab holding `addr`, if that slab is one of ours.
    pub fn slab_state_of(&self, addr: usize) -> Option<SlabState> {
        [
            (&self.free, SlabState::Free),
            (&self.partial, SlabState::Partial),
            (&self.full, SlabState::Full),
        ]
        .into_iter()
        .find_map(|(list, state)| list.iter().any(|s| s.contains(addr)).then_some(state))
    }

    /// Whether `addr` lies in a slab with live objects. Empty slabs don't
    /// count: nothing handed out can live there.
    pub fn owns(&self, addr: usize) -> bool {
        self.partial
            .iter()
            .chain(self.full.iter())
            .any(|slab| slab.contains(addr))
    }

    pub fn stats(&self) -> CacheStats {
        let live = |list: &LinkedList<SlabAdapter>| list.iter().map(|s| s.ref_count()).sum::<usize>();

        CacheStats {
            free_slabs: self.free.iter().count(),
            partial_slabs: self.partial.iter().count(),
            full_slabs: self.full.iter().count(),
            live_objects: live(&self.partial) + live(&self.full),
        }
    }
}

/// Page source for the node cache itself. Node slabs are bitmap tracked, so
/// they never need nodes of their own.
struct PagesOnly<'a, P>(&'a mut P);

impl<P: PageSource> PageSource for PagesOnly<'_, P> {
    fn acquire_page(&mut self) -> Option<NonNull<u8>> {
        self.0.acquire_page()
    }

    unsafe fn release_page(&mut self, page: NonNull<u8>) {
        unsafe { self.0.release_page(page) }
    }
}

impl<P: PageSource> SlabBackend for PagesOnly<'_, P> {
    fn alloc_node(&mut self) -> Result<NonNull<FreeBufNode>> {
        Err(KernelError::InvalidArgument)
    }

    unsafe fn free_node(&mut self, _node: NonNull<FreeBufNode>) {}
}

const NODE_GEOMETRY: Option<SlabGeometry> =
    SlabGeometry::new(mem::size_of::<FreeBufNode>(), mem::align_of::<FreeBufNode>());

const _: () = assert!(matches!(NODE_GEOMETRY, Some(SlabGeometry { large: false, .. })));

/// A page source together with the cache of free-buffer nodes that
/// large-object slabs draw from.
pub struct SlabPool<P: PageSource> {
    pages: P,
    nodes: ObjectCache,
}

impl<P: PageSource> SlabPool<P> {
    pub fn new(pages: P) -> Result<Self> {
        let geometry = NODE_GEOMETRY.ok_or(KernelError::SizeTooLarge)?;

        Ok(Self {
            pages,
            nodes: ObjectCache::with_geometry("free-buf-node", geometry, None, None),
        })
    }

    pub fn pages(&self) -> &P {
        &self.pages
    }

    pub fn pages_mut(&mut self) -> &mut P {
        &mut self.pages
    }

    pub fn node_cache(&self) -> &ObjectCache {
        &self.nodes
    }

    /// Gives the pages of empty node slabs back to the page source.
    pub fn reap_nodes(&mut self) -> usize {
        self.nodes.reap(&mut PagesOnly(&mut self.pages))
    }
}

impl<P: PageSource> PageSource for SlabPool<P> {
    fn acquire_page(&mut self) -> Option<NonNull<u8>> {
        self.pages.acquire_page()
    }

    unsafe fn release_page(&mut self, page: NonNull<u8>) {
        unsafe { self.pages.release_page(page) }
    }
}

impl<P: PageSource> SlabBackend for SlabPool<P> {
    fn alloc_node(&mut self) -> Result<NonNull<FreeBufNode>> {
        self.nodes
            .alloc(&mut PagesOnly(&mut self.pages))
            .map(NonNull::cast)
    }

    unsafe fn free_node(&mut self, node: NonNull<FreeBufNode>) {
        // SAFETY: Nodes only ever come from `self.nodes`.
        let res = unsafe { self.nodes.free(node.cast(), &mut PagesOnly(&mut self.pages)) };

        if let Err(e) = res {
            error!("slab: failed to recycle free-buffer node {:p}: {e}", node.as_ptr());
        }
    }
}
