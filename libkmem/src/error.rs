use thiserror::Error;

/// Errors returned by the buddy allocator, the slab caches and the heap front
/// end.
///
/// Everything except [`KernelError::CorruptionDetected`] is an ordinary result
/// the caller is expected to handle. Corruption means memory that is still
/// referenced elsewhere was about to be handed out again; the only safe
/// response is to stop the kernel.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Requested size is too large")]
    SizeTooLarge,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Pointer is not owned by any cache")]
    NotFound,

    #[error("Free-buffer list corruption detected")]
    CorruptionDetected,
}

impl KernelError {
    /// Whether the error signals a broken allocator invariant rather than a
    /// failed request.
    pub fn is_fatal(self) -> bool {
        matches!(self, KernelError::CorruptionDetected)
    }
}

pub type Result<T, E = KernelError> = core::result::Result<T, E>;
