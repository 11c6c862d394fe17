//! Binary buddy allocator over a contiguous physical region.
//!
//! The region is viewed as a tree of power-of-two blocks. Order `0` is the
//! smallest block (`min_block_size`), every order above doubles the size. For
//! each order the allocator keeps the indices of its free blocks, where a
//! block's index is its offset from the region base divided by its size. Two
//! blocks of the same order are buddies iff their indices are `2n` and
//! `2n + 1`; together they form block `n` one order up.
//!
//! The allocator never touches the memory it manages. All bookkeeping lives in
//! a caller-supplied metadata slice, sized with [`BuddyAllocator::metadata_len`].

use crate::{
    bits::ceil_log2,
    error::{KernelError, Result},
    memory::{align_down, is_aligned},
};
use log::{debug, warn};

/// Upper bound (exclusive) on the number of orders an allocator can manage.
pub const MAX_ORDERS: usize = 18;

/// Index of a block within its order.
pub type BlockIndex = u32;

/// A block handed out by (or returned to) the buddy allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    pub addr: usize,
    pub size: usize,
}

impl MemoryBlock {
    pub fn new(addr: usize, size: usize) -> Self {
        Self { addr, size }
    }

    pub fn end_address(&self) -> usize {
        self.addr + self.size
    }
}

pub struct BuddyAllocator<'a> {
    base: usize,
    orders: usize,
    log2_min_block: u32,
    free_counts: [usize; MAX_ORDERS],
    /// Free block indices per order. Order `k` can hold up to
    /// `2^(orders - k - 1)` entries, which is every block of that order.
    free_blocks: [&'a mut [BlockIndex]; MAX_ORDERS],
}

impl<'a> BuddyAllocator<'a> {
    /// Returns `(log2(min_block_size), orders)` for a region of `total_size`
    /// bytes.
    fn geometry(total_size: usize, min_block_size: usize) -> Result<(u32, usize)> {
        if total_size == 0 || min_block_size == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let log2_min_block = ceil_log2(min_block_size);
        let log2_span = ceil_log2(total_size);

        if log2_span < log2_min_block {
            return Err(KernelError::InvalidArgument);
        }

        let orders = (log2_span - log2_min_block) as usize + 1;

        if orders >= MAX_ORDERS {
            return Err(KernelError::InvalidArgument);
        }

        Ok((log2_min_block, orders))
    }

    /// Number of [`BlockIndex`] entries the metadata slice passed to
    /// [`BuddyAllocator::new`] must hold.
    pub fn metadata_len(total_size: usize, min_block_size: usize) -> Result<usize> {
        let (_, orders) = Self::geometry(total_size, min_block_size)?;

        Ok((1 << orders) - 1)
    }

    /// Creates an allocator managing `total_size` bytes starting at `base`.
    ///
    /// `min_block_size` is rounded up to a power of two and `base` must be
    /// aligned to it. The managed span is `total_size` rounded up to a power
    /// of two; anything past `total_size` is reserved straight away so it is
    /// never handed out.
    pub fn new(
        base: usize,
        total_size: usize,
        min_block_size: usize,
        metadata: &'a mut [BlockIndex],
    ) -> Result<Self> {
        let (log2_min_block, orders) = Self::geometry(total_size, min_block_size)?;
        let min_block = 1usize << log2_min_block;
        let span = min_block << (orders - 1);

        if !is_aligned(base, min_block) || base.checked_add(span).is_none() {
            return Err(KernelError::InvalidArgument);
        }

        if metadata.len() < (1 << orders) - 1 {
            return Err(KernelError::InvalidArgument);
        }

        let mut free_blocks: [&'a mut [BlockIndex]; MAX_ORDERS] = Default::default();
        let mut rest = metadata;

        // Highest order first: 1 slot, then 2, 4, ...
        for order in (0..orders).rev() {
            let (head, tail) = core::mem::take(&mut rest).split_at_mut(1 << (orders - order - 1));
            free_blocks[order] = head;
            rest = tail;
        }

        let mut allocator = Self {
            base,
            orders,
            log2_min_block,
            free_counts: [0; MAX_ORDERS],
            free_blocks,
        };

        allocator.push_free(orders - 1, 0);

        let usable = align_down(total_size, min_block);

        if usable < span {
            allocator.reserve_tail(usable)?;
        }

        debug!(
            "buddy: managing {usable:#x} bytes at {base:#x} ({orders} orders, {min_block:#x}..={:#x})",
            allocator.max_block_size()
        );

        Ok(allocator)
    }

    /// Reserves every block between `offset` and the end of the span.
    fn reserve_tail(&mut self, mut offset: usize) -> Result<()> {
        let span = self.max_block_size();

        while offset < span {
            let mut order = self.orders - 1;

            while order > 0
                && (!is_aligned(offset, self.block_size(order))
                    || offset + self.block_size(order) > span)
            {
                order -= 1;
            }

            let size = self.block_size(order);
            self.reserve_block(self.base + offset, size)?;
            offset += size;
        }

        Ok(())
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn orders(&self) -> usize {
        self.orders
    }

    pub fn min_block_size(&self) -> usize {
        1 << self.log2_min_block
    }

    pub fn max_block_size(&self) -> usize {
        self.block_size(self.orders - 1)
    }

    pub fn block_size(&self, order: usize) -> usize {
        self.min_block_size() << order
    }

    /// Number of free blocks currently held at `order`.
    pub fn free_blocks_at(&self, order: usize) -> usize {
        self.free_counts[order]
    }

    /// Smallest order whose blocks can hold `size` bytes, clamped to the
    /// orders this allocator manages.
    pub fn block_order(&self, size: usize) -> usize {
        if size <= self.min_block_size() {
            0
        } else if size >= self.max_block_size() {
            self.orders - 1
        } else {
            (ceil_log2(size) - self.log2_min_block) as usize
        }
    }

    fn push_free(&mut self, order: usize, index: BlockIndex) {
        let count = self.free_counts[order];

        debug_assert!(count < self.free_blocks[order].len(), "free list overflow");

        self.free_blocks[order][count] = index;
        self.free_counts[order] = count + 1;
    }

    fn pop_free(&mut self, order: usize) -> BlockIndex {
        self.free_counts[order] -= 1;
        self.free_blocks[order][self.free_counts[order]]
    }

    fn remove_free_at(&mut self, order: usize, pos: usize) {
        let last = self.pop_free(order);

        if pos < self.free_counts[order] {
            self.free_blocks[order][pos] = last;
        }
    }

    fn free_list(&self, order: usize) -> &[BlockIndex] {
        &self.free_blocks[order][..self.free_counts[order]]
    }

    /// Takes a free block of `target` order, splitting a larger one if
    /// needed.
    fn take_free_block(&mut self, target: usize) -> Option<MemoryBlock> {
        let mut order = (target..self.orders).find(|&o| self.free_counts[o] > 0)?;
        let mut index = self.pop_free(order);

        // Halve the block until it has the requested order. The upper half
        // of each split goes back on the free list, we keep the lower one.
        while order > target {
            order -= 1;
            self.push_free(order, 2 * index + 1);
            index *= 2;
        }

        let size = self.block_size(target);

        Some(MemoryBlock::new(self.base + index as usize * size, size))
    }

    /// Allocates a block of at least `size` bytes. The returned block carries
    /// the actual (power-of-two) size.
    pub fn allocate_block(&mut self, size: usize) -> Result<MemoryBlock> {
        if size > self.max_block_size() {
            return Err(KernelError::SizeTooLarge);
        }

        let target = self.block_order(size);

        if let Some(block) = self.take_free_block(target) {
            return Ok(block);
        }

        self.coalesce_blocks();

        self.take_free_block(target).ok_or(KernelError::OutOfMemory)
    }

    /// Maps a block to its `(order, index)`, validating size, alignment and
    /// range.
    fn locate(&self, block: MemoryBlock) -> Result<(usize, BlockIndex)> {
        if block.size < self.min_block_size()
            || block.size > self.max_block_size()
            || !block.size.is_power_of_two()
        {
            return Err(KernelError::InvalidArgument);
        }

        let order = (block.size.ilog2() - self.log2_min_block) as usize;

        let offset = block
            .addr
            .checked_sub(self.base)
            .ok_or(KernelError::InvalidArgument)?;

        if !is_aligned(offset, block.size) {
            return Err(KernelError::InvalidArgument);
        }

        let index = offset / block.size;

        if index >= 1 << (self.orders - 1 - order) {
            return Err(KernelError::InvalidArgument);
        }

        Ok((order, index as BlockIndex))
    }

    /// Whether any free block, of any order, overlaps block `index` of
    /// `order`.
    fn overlaps_free(&self, order: usize, index: BlockIndex) -> bool {
        let start = (index as usize) << order;
        let end = (index as usize + 1) << order;

        (0..self.orders).any(|o| {
            self.free_list(o).iter().any(|&i| {
                let free_start = (i as usize) << o;
                let free_end = (i as usize + 1) << o;

                free_start < end && start < free_end
            })
        })
    }

    /// Returns a block previously obtained from [`Self::allocate_block`] or
    /// [`Self::reserve_block`].
    pub fn free_block(&mut self, block: MemoryBlock) -> Result<()> {
        let (order, index) = self.locate(block)?;

        if self.overlaps_free(order, index) {
            warn!(
                "buddy: rejecting free of {:#x} ({:#x} bytes): already free",
                block.addr, block.size
            );
            return Err(KernelError::InvalidArgument);
        }

        self.push_free(order, index);
        self.coalesce_blocks();

        Ok(())
    }

    /// Merges free buddies into larger blocks.
    ///
    /// Orders are visited from the smallest up, once each. A block merged at
    /// order `k` lands on the list of order `k + 1` before that order is
    /// visited, so it can merge again in the same sweep.
    ///
    /// Returns whether any merge happened.
    pub fn coalesce_blocks(&mut self) -> bool {
        let mut merged = false;

        for order in 0..self.orders {
            let count = self.free_counts[order];
            let (lower, upper) = self.free_blocks.split_at_mut(order + 1);
            let list = &mut lower[order][..count];

            list.sort_unstable();

            let mut kept = 0;
            let mut i = 0;

            while i < count {
                if i + 1 < count && list[i] % 2 == 0 && list[i] + 1 == list[i + 1] {
                    // The top order holds a single block, so a pair can only
                    // show up below it and `upper[0]` is the next order.
                    let parent_count = self.free_counts[order + 1];
                    upper[0][parent_count] = list[i] / 2;
                    self.free_counts[order + 1] = parent_count + 1;

                    merged = true;
                    i += 2;
                } else {
                    list[kept] = list[i];
                    kept += 1;
                    i += 1;
                }
            }

            self.free_counts[order] = kept;
        }

        merged
    }

    /// Total number of bytes on the free lists.
    pub fn free_bytes(&self) -> usize {
        (0..self.orders)
            .map(|order| self.free_counts[order] * self.block_size(order))
            .sum()
    }

    /// Finds the free block containing block `index` of `order`, returning
    /// its order and position on that order's free list.
    fn find_free_container(&self, order: usize, index: BlockIndex) -> Option<(usize, usize)> {
        (order..self.orders).find_map(|o| {
            let ancestor = index >> (o - order);

            self.free_list(o)
                .iter()
                .position(|&i| i == ancestor)
                .map(|pos| (o, pos))
        })
    }

    /// Takes the specific block at `addr` out of the free lists.
    ///
    /// `size` is rounded up to a block size and `addr` must be aligned to
    /// it. Fails if any part of the block is already allocated.
    pub fn reserve_block(&mut self, addr: usize, size: usize) -> Result<MemoryBlock> {
        if size > self.max_block_size() {
            return Err(KernelError::SizeTooLarge);
        }

        let block = MemoryBlock::new(addr, self.block_size(self.block_order(size)));
        let (order, index) = self.locate(block)?;

        let (free_order, pos) = match self.find_free_container(order, index) {
            Some(found) => found,
            None => {
                self.coalesce_blocks();
                self.find_free_container(order, index)
                    .ok_or(KernelError::InvalidArgument)?
            }
        };

        self.remove_free_at(free_order, pos);

        // Split the container down to the requested block, keeping the
        // sibling at each level free.
        let mut o = free_order;
        while o > order {
            o -= 1;
            let on_path = index >> (o - order);
            self.push_free(o, on_path ^ 1);
        }

        Ok(block)
    }
}
