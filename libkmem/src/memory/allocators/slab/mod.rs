use crate::memory::{PAGE_SHIFT, PAGE_SIZE, WORD_SIZE};

/// Every slab spans exactly one page; its header sits at the page base.
pub const SLAB_SPAN_SHIFT: usize = PAGE_SHIFT;
pub const SLAB_SPAN: usize = 1 << SLAB_SPAN_SHIFT;

/// Objects larger than this are tracked with a list of checksummed
/// free-buffer nodes instead of an occupancy bitmap.
pub const LARGE_OBJECT_THRESHOLD: usize = PAGE_SIZE / 8;

/// Bitmap words needed to track one-word objects across a whole slab.
pub const BITMAP_WORDS: usize = SLAB_SPAN / WORD_SIZE / u64::BITS as usize;

pub mod cache;
pub mod heap;
#[allow(clippy::module_inception)]
pub mod slab;
