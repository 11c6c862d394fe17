//! Memory allocation building blocks for the kernel.
//!
//! Two cooperating layers live here: a buddy allocator that carves a raw
//! physical region into power-of-two blocks, and a slab layer that turns
//! single pages into caches of fixed-size objects. A size-classed front end
//! ([`memory::allocators::slab::heap::KernelHeap`]) sits on top of the slab
//! layer and is what the rest of the kernel talks to.
#![cfg_attr(not(test), no_std)]

pub mod bits;
pub mod error;
pub mod memory;
#[cfg(feature = "sync")]
pub mod sync;

/// Per-CPU operations the allocator needs from the architecture layer.
pub trait CpuOps: 'static {
    /// Disables all maskable interrupts on the current CPU core, returning the
    /// previous state prior to masking.
    fn disable_interrupts() -> usize;

    /// Restores the interrupt state of the CPU core to the state returned by
    /// [`CpuOps::disable_interrupts`].
    fn restore_interrupt_state(flags: usize);
}

#[cfg(test)]
pub mod test;
