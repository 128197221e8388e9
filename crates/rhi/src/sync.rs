//! Synchronization primitives.
//!
//! This module provides owning wrappers for backend synchronization objects:
//! - [`Semaphore`] - GPU-to-GPU synchronization (between queue operations)
//! - [`Fence`] - GPU-to-CPU synchronization (for host waiting)
//! - [`ImageSync`] - The semaphore pair used for one acquire/submit/present chain
//!
//! # Overview
//!
//! - **Semaphores** order queue operations. Acquisition signals one, the
//!   submission waits on it and signals another, and presentation waits on
//!   the second.
//!
//! - **Fences** let the host know when a submission has completed, which is
//!   what makes it safe to reuse the command buffer that was submitted.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use inflight_rhi::headless::HeadlessBackend;
//! use inflight_rhi::sync::{Fence, Semaphore};
//!
//! # fn example() -> Result<(), inflight_rhi::RhiError> {
//! let backend = Arc::new(HeadlessBackend::default());
//! let image_available = Semaphore::new(backend.clone())?;
//!
//! // Created signaled so the first wait returns immediately
//! let in_flight = Fence::new(backend.clone(), true)?;
//! in_flight.wait(u64::MAX)?;
//! in_flight.reset()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::Backend;
use crate::error::RhiResult;

/// Semaphore wrapper.
///
/// Semaphores are used for GPU-to-GPU synchronization between queue operations.
/// The semaphore is created unsignaled and destroyed on drop; the caller must
/// make sure no pending operation still references it by then.
pub struct Semaphore<B: Backend> {
    backend: Arc<B>,
    semaphore: B::Semaphore,
}

impl<B: Backend> Semaphore<B> {
    /// Creates a new unsignaled semaphore.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(backend: Arc<B>) -> RhiResult<Self> {
        let semaphore = backend.create_semaphore()?;
        trace!("Created semaphore {:?}", semaphore);
        Ok(Self { backend, semaphore })
    }

    /// Returns the backend semaphore handle.
    #[inline]
    pub fn handle(&self) -> B::Semaphore {
        self.semaphore
    }
}

impl<B: Backend> Drop for Semaphore<B> {
    fn drop(&mut self) {
        self.backend.destroy_semaphore(self.semaphore);
        trace!("Destroyed semaphore {:?}", self.semaphore);
    }
}

/// Fence wrapper.
///
/// Fences are used for GPU-to-CPU synchronization, allowing the host to wait
/// for a submission to complete before reusing the resources it referenced.
pub struct Fence<B: Backend> {
    backend: Arc<B>,
    fence: B::Fence,
}

impl<B: Backend> Fence<B> {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `backend` - The backend to create the fence on
    /// * `signaled` - If true, creates the fence in the signaled state.
    ///   This is useful for fences that are waited on before the first
    ///   GPU operation that would signal them.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(backend: Arc<B>, signaled: bool) -> RhiResult<Self> {
        let fence = backend.create_fence(signaled)?;
        trace!(
            "Created fence {:?} ({})",
            fence,
            if signaled { "signaled" } else { "unsignaled" }
        );
        Ok(Self { backend, fence })
    }

    /// Returns the backend fence handle.
    #[inline]
    pub fn handle(&self) -> B::Fence {
        self.fence
    }

    /// Waits for the fence to become signaled.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout in nanoseconds. Use `u64::MAX` for infinite wait.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`](crate::RhiError::Timeout) if the timeout
    /// expires, or another error if the wait fails.
    pub fn wait(&self, timeout: u64) -> RhiResult<()> {
        self.backend.wait_for_fences(&[self.fence], timeout)
    }

    /// Resets the fence to the unsignaled state.
    ///
    /// The fence must not be in use by any queue operation when this is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset operation fails.
    pub fn reset(&self) -> RhiResult<()> {
        self.backend.reset_fences(&[self.fence])
    }

    /// Checks if the fence is currently signaled without blocking.
    ///
    /// Any backend error is reported as "not signaled".
    pub fn is_signaled(&self) -> bool {
        matches!(self.backend.fence_status(self.fence), Ok(true))
    }
}

impl<B: Backend> Drop for Fence<B> {
    fn drop(&mut self) {
        self.backend.destroy_fence(self.fence);
        trace!("Destroyed fence {:?}", self.fence);
    }
}

/// Waits on every fence in one backend call.
///
/// # Errors
///
/// Returns [`RhiError::Timeout`](crate::RhiError::Timeout) if not all fences
/// signal within `timeout` nanoseconds.
pub fn wait_for_all<'a, B, I>(backend: &B, fences: I, timeout: u64) -> RhiResult<()>
where
    B: Backend,
    I: IntoIterator<Item = &'a Fence<B>>,
{
    let handles: Vec<B::Fence> = fences.into_iter().map(Fence::handle).collect();
    if handles.is_empty() {
        return Ok(());
    }
    debug!("Waiting on {} fences", handles.len());
    backend.wait_for_fences(&handles, timeout)
}

/// The semaphore pair for one acquire/submit/present chain.
///
/// ```text
/// acquire ──signals──▶ acquire_semaphore ──waited by──▶ submit
/// submit  ──signals──▶ render_semaphore  ──waited by──▶ present
/// ```
///
/// One `ImageSync` exists per swapchain image. The acquire semaphore is picked
/// by a rotating counter (the image index is unknown until acquisition
/// returns); the render semaphore is picked by the acquired image index, so a
/// semaphore still held by a pending present is never re-signaled.
pub struct ImageSync<B: Backend> {
    acquire_semaphore: Semaphore<B>,
    render_semaphore: Semaphore<B>,
}

impl<B: Backend> ImageSync<B> {
    /// Creates a fresh, unsignaled semaphore pair.
    ///
    /// # Errors
    ///
    /// Returns an error if either semaphore cannot be created.
    pub fn new(backend: Arc<B>) -> RhiResult<Self> {
        let acquire_semaphore = Semaphore::new(backend.clone())?;
        let render_semaphore = Semaphore::new(backend)?;
        Ok(Self {
            acquire_semaphore,
            render_semaphore,
        })
    }

    /// Semaphore signaled when the acquired image is ready to be written.
    #[inline]
    pub fn acquire_semaphore(&self) -> &Semaphore<B> {
        &self.acquire_semaphore
    }

    /// Semaphore signaled when rendering to the image has finished.
    #[inline]
    pub fn render_semaphore(&self) -> &Semaphore<B> {
        &self.render_semaphore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessBackend, HeadlessConfig, HeadlessEvent};
    use crate::RhiError;
    use std::time::Duration;

    fn backend() -> Arc<HeadlessBackend> {
        Arc::new(HeadlessBackend::new(HeadlessConfig {
            gpu_latency: Duration::from_millis(5),
            ..Default::default()
        }))
    }

    #[test]
    fn test_semaphore_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore<HeadlessBackend>>();
    }

    #[test]
    fn test_fence_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Fence<HeadlessBackend>>();
    }

    #[test]
    fn test_image_sync_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ImageSync<HeadlessBackend>>();
    }

    #[test]
    fn test_signaled_fence_wait_returns() {
        let backend = backend();
        let fence = Fence::new(backend.clone(), true).expect("fence");
        assert!(fence.is_signaled());
        fence.wait(0).expect("already signaled");
        fence.reset().expect("reset");
        assert!(!fence.is_signaled());
    }

    #[test]
    fn test_unsignaled_fence_times_out() {
        let backend = backend();
        let fence = Fence::new(backend.clone(), false).expect("fence");
        assert!(matches!(fence.wait(1_000), Err(RhiError::Timeout)));
    }

    #[test]
    fn test_wait_for_all_empty_is_noop() {
        let backend = backend();
        let fences: Vec<Fence<HeadlessBackend>> = Vec::new();
        wait_for_all(backend.as_ref(), &fences, u64::MAX).expect("no fences");
        assert!(backend.events().is_empty());
    }

    #[test]
    fn test_drop_destroys_semaphores() {
        let backend = backend();
        let sync = ImageSync::new(backend.clone()).expect("sync");
        let acquire = sync.acquire_semaphore().handle();
        let render = sync.render_semaphore().handle();
        assert_ne!(acquire, render);
        drop(sync);

        let destroyed: Vec<_> = backend
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HeadlessEvent::SemaphoreDestroyed { semaphore } => Some(semaphore),
                _ => None,
            })
            .collect();
        assert_eq!(destroyed, vec![acquire, render]);
    }
}
