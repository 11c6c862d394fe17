use crate::CpuOps;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

pub struct MockCpuOps;

impl CpuOps for MockCpuOps {
    fn disable_interrupts() -> usize {
        0
    }

    fn restore_interrupt_state(_flags: usize) {}
}

/// Zeroed, aligned host memory standing in for a physical region.
pub struct TestArena {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for TestArena {}
unsafe impl Sync for TestArena {}

impl TestArena {
    pub fn new(size: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(size, align).unwrap();
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("host OOM");

        Self { ptr, layout }
    }

    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.size()
    }
}

impl Drop for TestArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
