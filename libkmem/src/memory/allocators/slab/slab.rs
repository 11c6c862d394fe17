use super::{BITMAP_WORDS, LARGE_OBJECT_THRESHOLD, SLAB_SPAN, SLAB_SPAN_SHIFT};
use crate::{
    bits::first_clear_bit,
    error::{KernelError, Result},
    memory::{PAGE_SIZE, align_up},
};
use core::{mem::size_of, ptr::NonNull};
use intrusive_collections::{LinkedListLink, UnsafeRef, intrusive_adapter};

/// Runs over every slot when a slab is created.
pub type ObjectCtor = fn(NonNull<u8>, usize);

/// Runs over slots when a slab is destroyed.
pub type ObjectDtor = fn(NonNull<u8>, usize);

const SLAB_MAGIC: u32 = 0x51ab_c0de;

/// Describes one free slot of a large-object slab.
///
/// `checksum` is the wrapping negation of the sum of the other two fields, so
/// the wrapping sum of all three is zero for an untouched node. A stray write
/// into a freed node (use-after-free) breaks the sum.
#[repr(C)]
#[derive(Debug)]
pub struct FreeBufNode {
    pub(super) next: Option<NonNull<FreeBufNode>>,
    pub(super) buf: NonNull<u8>,
    pub(super) checksum: usize,
}

impl FreeBufNode {
    pub fn new(next: Option<NonNull<FreeBufNode>>, buf: NonNull<u8>) -> Self {
        let mut node = Self {
            next,
            buf,
            checksum: 0,
        };

        node.checksum = node.field_sum().wrapping_neg();
        node
    }

    fn field_sum(&self) -> usize {
        self.next
            .map_or(0, |n| n.as_ptr() as usize)
            .wrapping_add(self.buf.as_ptr() as usize)
    }

    pub fn is_intact(&self) -> bool {
        self.field_sum().wrapping_add(self.checksum) == 0
    }

    pub fn buf(&self) -> NonNull<u8> {
        self.buf
    }
}

/// How a slab records which of its slots are free. Chosen when the slab is
/// created and never changed afterwards.
#[derive(Debug)]
pub enum Tracking {
    /// One bit per slot, set while the slot is allocated.
    Bitmap([u64; BITMAP_WORDS]),
    /// Singly linked list of the free slots.
    FreeList(Option<NonNull<FreeBufNode>>),
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SlabState {
    Free,
    Partial,
    Full,
}

/// Slot layout shared by all slabs of one cache. Only the color offset
/// differs between them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SlabGeometry {
    pub object_size: usize,
    pub align: usize,
    /// Distance between two consecutive slots.
    pub stride: usize,
    /// Offset of the first slot of a color-0 slab.
    pub header_end: usize,
    pub capacity: usize,
    pub colors: usize,
    pub large: bool,
}

impl SlabGeometry {
    /// Lays out `object_size` byte objects aligned to `align` in a slab, or
    /// `None` if not a single object fits after the header.
    pub const fn new(object_size: usize, align: usize) -> Option<Self> {
        let header_end = align_up(size_of::<SlabHeader>(), align);
        let stride = align_up(object_size, align);

        if header_end + stride > SLAB_SPAN {
            return None;
        }

        let room = SLAB_SPAN - header_end;
        let capacity = room / stride;
        let large = SLAB_SPAN > PAGE_SIZE || object_size > LARGE_OBJECT_THRESHOLD;

        if !large && capacity > BITMAP_WORDS * u64::BITS as usize {
            return None;
        }

        Some(Self {
            object_size,
            align,
            stride,
            header_end,
            capacity,
            // Whatever doesn't fit another object is spent shifting the
            // slots of successive slabs by one alignment unit each.
            colors: 1 + (room % stride) / align,
            large,
        })
    }

    pub fn color_offset(&self, color: usize) -> usize {
        color * self.align
    }
}

/// Bookkeeping written at the base of every slab page.
#[repr(C)]
pub struct SlabHeader {
    link: LinkedListLink,
    magic: u32,
    log2_span: u8,
    pub(super) color: u16,
    ref_count: u16,
    capacity: u16,
    stride: usize,
    first_slot: usize,
    pub(super) tracking: Tracking,
}

intrusive_adapter!(pub SlabAdapter = UnsafeRef<SlabHeader>: SlabHeader { link => LinkedListLink });

fn slot_ptr(addr: usize) -> NonNull<u8> {
    // SAFETY: Slots live past the header of a slab page, which is never the
    // null page.
    unsafe { NonNull::new_unchecked(addr as *mut u8) }
}

/// Claims the lowest clear bit below `capacity`.
fn bitmap_claim(words: &mut [u64; BITMAP_WORDS], capacity: usize) -> Option<usize> {
    for (i, word) in words.iter_mut().enumerate() {
        if let Some(bit) = first_clear_bit(*word) {
            let idx = i * u64::BITS as usize + bit as usize;

            if idx >= capacity {
                return None;
            }

            *word |= 1 << bit;
            return Some(idx);
        }
    }

    None
}

impl SlabHeader {
    /// Writes a fresh, empty header at the base of `page`.
    ///
    /// Free-list slabs start without any nodes; the owning cache pushes one
    /// per slot before the slab is used.
    ///
    /// # Safety
    ///
    /// `page` must be `SLAB_SPAN` bytes, aligned to `SLAB_SPAN`, writable and
    /// exclusively owned by the caller.
    pub(super) unsafe fn init(page: NonNull<u8>, geometry: &SlabGeometry, color: usize) -> SlabRef {
        let header = page.cast::<SlabHeader>();

        let tracking = if geometry.large {
            Tracking::FreeList(None)
        } else {
            Tracking::Bitmap([0; BITMAP_WORDS])
        };

        unsafe {
            header.write(SlabHeader {
                link: LinkedListLink::new(),
                magic: SLAB_MAGIC,
                log2_span: SLAB_SPAN_SHIFT as u8,
                color: color as u16,
                ref_count: 0,
                capacity: geometry.capacity as u16,
                stride: geometry.stride,
                first_slot: page.as_ptr() as usize
                    + geometry.header_end
                    + geometry.color_offset(color),
                tracking,
            });
        }

        SlabRef(header)
    }

    pub fn base(&self) -> usize {
        self as *const Self as usize
    }

    pub fn span(&self) -> usize {
        1 << self.log2_span
    }

    pub fn color(&self) -> usize {
        self.color as usize
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn is_large(&self) -> bool {
        matches!(self.tracking, Tracking::FreeList(_))
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.span()
    }

    pub fn state(&self) -> SlabState {
        if self.ref_count == 0 {
            SlabState::Free
        } else if self.ref_count == self.capacity {
            SlabState::Full
        } else {
            SlabState::Partial
        }
    }

    /// Whether this header was written by a cache with `geometry`.
    pub(super) fn matches(&self, geometry: &SlabGeometry) -> bool {
        self.magic == SLAB_MAGIC
            && self.stride == geometry.stride
            && self.capacity() == geometry.capacity
            && self.is_large() == geometry.large
    }

    pub fn slot(&self, idx: usize) -> NonNull<u8> {
        debug_assert!(idx < self.capacity());
        slot_ptr(self.first_slot + idx * self.stride)
    }

    /// Index of the slot starting exactly at `addr`.
    fn slot_index(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.first_slot)?;

        if offset % self.stride != 0 {
            return None;
        }

        let idx = offset / self.stride;

        (idx < self.capacity()).then_some(idx)
    }

    /// Checks that `obj` is the start of a slot currently handed out,
    /// returning its index.
    pub(super) fn check_allocated(&self, obj: NonNull<u8>) -> Result<usize> {
        if self.ref_count == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let idx = self
            .slot_index(obj.as_ptr() as usize)
            .ok_or(KernelError::InvalidArgument)?;

        match &self.tracking {
            Tracking::Bitmap(words) => {
                let (word, bit) = (idx / u64::BITS as usize, idx % u64::BITS as usize);

                if words[word] & (1 << bit) == 0 {
                    return Err(KernelError::InvalidArgument);
                }
            }
            Tracking::FreeList(head) => {
                let mut cur = *head;

                while let Some(n) = cur {
                    // SAFETY: Nodes on the list are owned by this slab.
                    let n = unsafe { n.as_ref() };

                    if !n.is_intact() {
                        return Err(KernelError::CorruptionDetected);
                    }

                    if n.buf == obj {
                        return Err(KernelError::InvalidArgument);
                    }

                    cur = n.next;
                }
            }
        }

        Ok(idx)
    }

    /// Records slot `buf` as free using `node`. Only meaningful for
    /// free-list slabs that are being populated.
    ///
    /// # Safety
    ///
    /// `node` must point to writable memory for a [`FreeBufNode`] that the
    /// slab can own from now on.
    pub(super) unsafe fn push_free_node(&mut self, node: NonNull<FreeBufNode>, buf: NonNull<u8>) {
        if let Tracking::FreeList(head) = &mut self.tracking {
            unsafe { node.write(FreeBufNode::new(*head, buf)) };
            *head = Some(node);
        }
    }

    /// Claims a free slot: the lowest clear bit for bitmap slabs, the head
    /// of the free list otherwise. For free-list slabs the node that
    /// described the slot is handed back so the caller can recycle it.
    pub(super) fn alloc_object(&mut self) -> Result<(NonNull<u8>, Option<NonNull<FreeBufNode>>)> {
        if self.ref_count == self.capacity {
            return Err(KernelError::OutOfMemory);
        }

        let (first_slot, stride, capacity) = (self.first_slot, self.stride, self.capacity());

        let (obj, spent) = match &mut self.tracking {
            Tracking::Bitmap(words) => {
                let idx = bitmap_claim(words, capacity).ok_or(KernelError::OutOfMemory)?;

                (slot_ptr(first_slot + idx * stride), None)
            }
            Tracking::FreeList(head) => {
                let node = head.ok_or(KernelError::OutOfMemory)?;

                // SAFETY: Nodes on the list are owned by this slab.
                let n = unsafe { node.as_ref() };

                if !n.is_intact() {
                    return Err(KernelError::CorruptionDetected);
                }

                *head = n.next;

                (n.buf, Some(node))
            }
        };

        self.ref_count += 1;

        Ok((obj, spent))
    }

    /// Returns `obj` to the slab. Free-list slabs need `node` to record the
    /// slot; it is left untouched if the call fails.
    ///
    /// # Safety
    ///
    /// `obj` must not be used after this call succeeds, and `node` must point
    /// to writable memory for a [`FreeBufNode`].
    pub(super) unsafe fn free_object(
        &mut self,
        obj: NonNull<u8>,
        node: Option<NonNull<FreeBufNode>>,
    ) -> Result<()> {
        let idx = self.check_allocated(obj)?;

        match &mut self.tracking {
            Tracking::Bitmap(words) => {
                words[idx / u64::BITS as usize] &= !(1 << (idx % u64::BITS as usize));
            }
            Tracking::FreeList(head) => {
                let node = node.ok_or(KernelError::InvalidArgument)?;

                unsafe { node.write(FreeBufNode::new(*head, obj)) };
                *head = Some(node);
            }
        }

        self.ref_count -= 1;

        Ok(())
    }

    /// Runs `dtor` over the slab's objects and hands every free-buffer node
    /// to `release_node`. Bitmap slabs run the destructor on every slot,
    /// free-list slabs on every free buffer.
    ///
    /// # Safety
    ///
    /// No object of the slab may be in use, now or later.
    pub(super) unsafe fn teardown(
        &mut self,
        dtor: Option<ObjectDtor>,
        object_size: usize,
        mut release_node: impl FnMut(NonNull<FreeBufNode>),
    ) -> Result<()> {
        let (first_slot, stride, capacity) = (self.first_slot, self.stride, self.capacity());

        match &mut self.tracking {
            Tracking::Bitmap(_) => {
                if let Some(dtor) = dtor {
                    for idx in 0..capacity {
                        dtor(slot_ptr(first_slot + idx * stride), object_size);
                    }
                }
            }
            Tracking::FreeList(head) => {
                while let Some(node) = *head {
                    // SAFETY: Nodes on the list are owned by this slab.
                    let n = unsafe { node.as_ref() };

                    if !n.is_intact() {
                        return Err(KernelError::CorruptionDetected);
                    }

                    if let Some(dtor) = dtor {
                        dtor(n.buf, object_size);
                    }

                    *head = n.next;
                    release_node(node);
                }
            }
        }

        Ok(())
    }
}

/// Handle to a slab header living at the base of its page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabRef(NonNull<SlabHeader>);

impl SlabRef {
    /// Recovers the slab an object lives in by masking its address down to
    /// the slab span.
    ///
    /// # Safety
    ///
    /// `obj` must point into a page that currently holds a slab header.
    pub unsafe fn from_object(obj: NonNull<u8>) -> Self {
        let base = obj.as_ptr() as usize & !(SLAB_SPAN - 1);

        // SAFETY: The caller guarantees `obj` is inside a slab page, and no
        // slab lives in the null page.
        Self(unsafe { NonNull::new_unchecked(base as *mut SlabHeader) })
    }

    pub(super) fn from_header(header: &SlabHeader) -> Self {
        Self(NonNull::from(header))
    }

    pub fn base(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub(super) fn as_ptr(self) -> *mut SlabHeader {
        self.0.as_ptr()
    }

    pub(super) fn page(self) -> NonNull<u8> {
        self.0.cast()
    }

    /// # Safety
    ///
    /// The caller must have exclusive access to the slab, i.e. hold `&mut`
    /// to the cache that owns it.
    pub(super) unsafe fn header_mut<'a>(self) -> &'a mut SlabHeader {
        unsafe { &mut *self.0.as_ptr() }
    }

    /// # Safety
    ///
    /// The slab header must be initialised and not concurrently mutated.
    pub unsafe fn header<'a>(self) -> &'a SlabHeader {
        unsafe { &*self.0.as_ptr() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::WORD_SIZE, test::TestArena};
    use core::ptr;

    fn page_fixture() -> TestArena {
        TestArena::new(SLAB_SPAN, SLAB_SPAN)
    }

    fn page_of(arena: &TestArena) -> NonNull<u8> {
        NonNull::new(arena.base() as *mut u8).unwrap()
    }

    #[test]
    fn checksum_detects_tampering() {
        let mut buf = [0u8; 16];
        let buf = NonNull::new(buf.as_mut_ptr()).unwrap();

        let mut node = FreeBufNode::new(None, buf);
        assert!(node.is_intact());

        node.next = Some(NonNull::dangling());
        assert!(!node.is_intact());

        let mut node = FreeBufNode::new(Some(NonNull::dangling()), buf);
        assert!(node.is_intact());
        node.checksum ^= 1;
        assert!(!node.is_intact());
    }

    #[test]
    fn geometry_small_objects() {
        let g = SlabGeometry::new(WORD_SIZE, WORD_SIZE).unwrap();
        let header = align_up(size_of::<SlabHeader>(), WORD_SIZE);

        assert!(!g.large);
        assert_eq!(g.header_end, header);
        assert_eq!(g.capacity, (SLAB_SPAN - header) / WORD_SIZE);
        assert!(g.capacity <= BITMAP_WORDS * 64);
        assert_eq!(g.colors, 1);
    }

    #[test]
    fn geometry_large_threshold() {
        assert!(!SlabGeometry::new(LARGE_OBJECT_THRESHOLD, 8).unwrap().large);
        assert!(SlabGeometry::new(LARGE_OBJECT_THRESHOLD + 8, 8).unwrap().large);
    }

    #[test]
    fn geometry_colors_from_leftover() {
        // 384-byte objects: ten fit, with a leftover of a few 8-byte units.
        let g = SlabGeometry::new(384, 8).unwrap();
        let room = SLAB_SPAN - g.header_end;

        assert_eq!(g.capacity, room / 384);
        assert_eq!(g.colors, 1 + (room % 384) / 8);
        assert!(g.colors > 1);
    }

    #[test]
    fn geometry_too_large() {
        assert!(SlabGeometry::new(SLAB_SPAN, 8).is_none());
        assert!(SlabGeometry::new(SLAB_SPAN - 8, 8).is_none());
    }

    #[test]
    fn slab_init_layout() {
        let arena = page_fixture();
        let g = SlabGeometry::new(32, 8).unwrap();

        let slab = unsafe { SlabHeader::init(page_of(&arena), &g, 0) };
        let header = unsafe { slab.header() };

        assert_eq!(slab.base(), arena.base());
        assert_eq!(header.state(), SlabState::Free);
        assert_eq!(header.capacity(), g.capacity);
        assert_eq!(header.span(), SLAB_SPAN);
        assert!(!header.is_large());
        assert_eq!(header.slot(0).as_ptr() as usize, arena.base() + g.header_end);
        assert_eq!(
            header.slot(1).as_ptr() as usize,
            arena.base() + g.header_end + 32
        );
    }

    #[test]
    fn slab_color_shifts_slots() {
        let arena = page_fixture();
        let g = SlabGeometry::new(384, 8).unwrap();

        let slab = unsafe { SlabHeader::init(page_of(&arena), &g, 1) };
        let header = unsafe { slab.header() };

        assert_eq!(header.color(), 1);
        assert_eq!(
            header.slot(0).as_ptr() as usize,
            arena.base() + g.header_end + 8
        );

        // The last slot still fits inside the page.
        let last = header.slot(g.capacity - 1).as_ptr() as usize;
        assert!(last + 384 <= arena.base() + SLAB_SPAN);
    }

    #[test]
    fn bitmap_alloc_free_lowest_first() {
        let arena = page_fixture();
        let g = SlabGeometry::new(64, 8).unwrap();
        let slab = unsafe { SlabHeader::init(page_of(&arena), &g, 0) };
        let header = unsafe { slab.header_mut() };

        let (p1, n1) = header.alloc_object().unwrap();
        let (p2, _) = header.alloc_object().unwrap();
        assert!(n1.is_none());
        assert_eq!(header.state(), SlabState::Partial);
        assert_eq!(unsafe { p1.as_ptr().byte_add(64) }, p2.as_ptr());

        unsafe { header.free_object(p1, None).unwrap() };
        assert_eq!(header.ref_count(), 1);

        // The lowest free slot comes back first.
        let (p3, _) = header.alloc_object().unwrap();
        assert_eq!(p3, p1);

        unsafe {
            header.free_object(p2, None).unwrap();
            header.free_object(p3, None).unwrap();
        }
        assert_eq!(header.state(), SlabState::Free);
    }

    #[test]
    fn bitmap_exhaustion() {
        let arena = page_fixture();
        let g = SlabGeometry::new(256, 8).unwrap();
        let slab = unsafe { SlabHeader::init(page_of(&arena), &g, 0) };
        let header = unsafe { slab.header_mut() };

        let mut ptrs = Vec::new();
        for _ in 0..g.capacity {
            assert_ne!(header.state(), SlabState::Full);
            ptrs.push(header.alloc_object().unwrap().0);
        }

        assert_eq!(header.state(), SlabState::Full);
        assert_eq!(header.alloc_object().err(), Some(KernelError::OutOfMemory));

        let last = ptrs.pop().unwrap();
        unsafe { header.free_object(last, None).unwrap() };
        assert_eq!(header.state(), SlabState::Partial);
        assert_eq!(header.alloc_object().unwrap().0, last);
    }

    #[test]
    fn bitmap_rejects_bad_frees() {
        let arena = page_fixture();
        let g = SlabGeometry::new(64, 8).unwrap();
        let slab = unsafe { SlabHeader::init(page_of(&arena), &g, 0) };
        let header = unsafe { slab.header_mut() };

        let (p1, _) = header.alloc_object().unwrap();
        let (_p2, _) = header.alloc_object().unwrap();

        // Interior pointer.
        let interior = NonNull::new(unsafe { p1.as_ptr().add(8) }).unwrap();
        assert_eq!(
            unsafe { header.free_object(interior, None) },
            Err(KernelError::InvalidArgument)
        );

        unsafe { header.free_object(p1, None).unwrap() };
        assert_eq!(
            unsafe { header.free_object(p1, None) },
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(header.ref_count(), 1);
    }

    #[test]
    fn bitmap_boundary_integrity() {
        let arena = page_fixture();
        let g = SlabGeometry::new(128, 8).unwrap();
        let slab = unsafe { SlabHeader::init(page_of(&arena), &g, 0) };
        let header = unsafe { slab.header_mut() };

        let mut ptrs = Vec::new();
        for i in 0..g.capacity {
            let (p, _) = header.alloc_object().unwrap();
            unsafe { ptr::write_bytes(p.as_ptr(), (i as u8) + 1, 128) };
            ptrs.push((i + 1, p));
        }

        // Writing every object must leave the header alone.
        assert!(header.matches(&g));
        assert_eq!(header.state(), SlabState::Full);

        ptrs.retain(|(i, p)| {
            if i % 2 == 0 {
                unsafe { header.free_object(*p, None).unwrap() };
                false
            } else {
                true
            }
        });

        for (i, p) in ptrs {
            let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 128) };
            assert!(bytes.iter().all(|b| *b == i as u8));
        }
    }

    #[test]
    fn free_list_pop_and_corruption() {
        let arena = page_fixture();
        let g = SlabGeometry::new(1024, 8).unwrap();
        let slab = unsafe { SlabHeader::init(page_of(&arena), &g, 0) };
        let header = unsafe { slab.header_mut() };
        assert!(header.is_large());

        let mut nodes: Vec<FreeBufNode> = Vec::with_capacity(g.capacity + 1);
        let node_ptr = |nodes: &mut Vec<FreeBufNode>, i: usize| unsafe {
            NonNull::new_unchecked(nodes.as_mut_ptr().add(i))
        };

        for idx in (0..g.capacity).rev() {
            let slot = header.slot(idx);
            unsafe { header.push_free_node(node_ptr(&mut nodes, idx), slot) };
        }

        let (p0, spent) = header.alloc_object().unwrap();
        assert_eq!(p0, header.slot(0));
        assert_eq!(spent, Some(node_ptr(&mut nodes, 0)));

        // Scribble over the next node on the list.
        if let Tracking::FreeList(Some(head)) = header.tracking {
            unsafe { (*head.as_ptr()).checksum = 0xdead };
        }

        assert_eq!(
            header.alloc_object().err(),
            Some(KernelError::CorruptionDetected)
        );
        assert_eq!(header.ref_count(), 1);
    }

    #[test]
    fn free_list_rejects_double_free() {
        let arena = page_fixture();
        let g = SlabGeometry::new(1024, 8).unwrap();
        let slab = unsafe { SlabHeader::init(page_of(&arena), &g, 0) };
        let header = unsafe { slab.header_mut() };

        let mut nodes: Vec<FreeBufNode> = Vec::with_capacity(2 * g.capacity);
        let base = nodes.as_mut_ptr();

        for idx in (0..g.capacity).rev() {
            let slot = header.slot(idx);
            unsafe { header.push_free_node(NonNull::new_unchecked(base.add(idx)), slot) };
        }

        let (p0, _) = header.alloc_object().unwrap();
        let spare = unsafe { NonNull::new_unchecked(base.add(g.capacity)) };
        let spare2 = unsafe { NonNull::new_unchecked(base.add(g.capacity + 1)) };

        unsafe { header.free_object(p0, Some(spare)).unwrap() };
        assert_eq!(
            unsafe { header.free_object(p0, Some(spare2)) },
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(header.state(), SlabState::Free);
    }

    #[test]
    fn recover_slab_from_object() {
        let arena = page_fixture();
        let g = SlabGeometry::new(48, 16).unwrap();
        let slab = unsafe { SlabHeader::init(page_of(&arena), &g, 0) };
        let header = unsafe { slab.header_mut() };

        for _ in 0..10 {
            let (p, _) = header.alloc_object().unwrap();
            assert_eq!(p.as_ptr() as usize % 16, 0);

            let owner = unsafe { SlabRef::from_object(p) };
            assert_eq!(owner, slab);
            assert_eq!(owner.base(), arena.base());
        }
    }
}
