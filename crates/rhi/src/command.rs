//! Command buffer management.
//!
//! [`CommandBuffer`] owns one primary command buffer allocated from the
//! backend's resettable pool. The buffer is reused every time its frame slot
//! comes around: reset, begin, record, end, submit.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use inflight_rhi::command::CommandBuffer;
//! use inflight_rhi::headless::HeadlessBackend;
//!
//! # fn example() -> Result<(), inflight_rhi::RhiError> {
//! let backend = Arc::new(HeadlessBackend::default());
//! let cmd = CommandBuffer::new(backend)?;
//!
//! cmd.reset()?;
//! cmd.begin()?;
//! // ... record rendering commands ...
//! cmd.end()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::trace;

use crate::backend::Backend;
use crate::error::RhiResult;

/// Command buffer wrapper.
///
/// The buffer is returned to the backend's pool on drop. It must not be
/// pending execution at that point.
pub struct CommandBuffer<B: Backend> {
    backend: Arc<B>,
    buffer: B::CommandBuffer,
}

impl<B: Backend> CommandBuffer<B> {
    /// Allocates a new primary command buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn new(backend: Arc<B>) -> RhiResult<Self> {
        let buffer = backend.allocate_command_buffer()?;
        trace!("Allocated command buffer {:?}", buffer);
        Ok(Self { backend, buffer })
    }

    /// Returns the backend command buffer handle.
    #[inline]
    pub fn handle(&self) -> B::CommandBuffer {
        self.buffer
    }

    /// Resets the command buffer to its initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    pub fn reset(&self) -> RhiResult<()> {
        self.backend.reset_command_buffer(self.buffer)
    }

    /// Begins one-time-submit recording.
    ///
    /// # Errors
    ///
    /// Returns an error if beginning fails (e.g., if already recording).
    pub fn begin(&self) -> RhiResult<()> {
        self.backend.begin_command_buffer(self.buffer)
    }

    /// Ends recording; the buffer is then ready for submission.
    ///
    /// # Errors
    ///
    /// Returns an error if ending fails (e.g., if not recording).
    pub fn end(&self) -> RhiResult<()> {
        self.backend.end_command_buffer(self.buffer)
    }
}

impl<B: Backend> Drop for CommandBuffer<B> {
    fn drop(&mut self) {
        self.backend.free_command_buffer(self.buffer);
        trace!("Freed command buffer {:?}", self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;

    #[test]
    fn test_command_buffer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandBuffer<HeadlessBackend>>();
    }

    #[test]
    fn test_record_cycle() {
        let backend = Arc::new(HeadlessBackend::default());
        let cmd = CommandBuffer::new(backend.clone()).expect("allocate");

        for _ in 0..2 {
            cmd.reset().expect("reset");
            cmd.begin().expect("begin");
            cmd.end().expect("end");
        }
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_begin_twice_is_rejected() {
        let backend = Arc::new(HeadlessBackend::default());
        let cmd = CommandBuffer::new(backend.clone()).expect("allocate");

        cmd.begin().expect("first begin");
        assert!(cmd.begin().is_err());
    }
}
