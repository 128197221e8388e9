//! Frame scheduling.
//!
//! This module provides the [`FrameScheduler`], which drives the render loop:
//!
//! - N frame slots bound how far the host may run ahead of the GPU
//! - One semaphore pair per swapchain image links acquire, submit and present
//! - Out-of-date, suboptimal and resized swapchains are rebuilt in place
//!
//! # Overview
//!
//! Two ring counters advance once per presented frame. The slot index walks
//! the N frame slots; the sync index walks the swapchain images and picks the
//! semaphore that acquisition signals. The image index returned by the
//! acquisition picks the semaphore that rendering signals and presentation
//! waits on, so a semaphore is never re-signaled while a present still waits
//! on it even when images come back out of order.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use inflight_core::RendererConfig;
//! use inflight_renderer::{FrameInput, FrameScheduler, NoopRecorder};
//! use inflight_rhi::headless::HeadlessBackend;
//!
//! # fn example() -> Result<(), inflight_rhi::RhiError> {
//! let backend = Arc::new(HeadlessBackend::default());
//! let mut scheduler = FrameScheduler::new(backend, &RendererConfig::default())?;
//!
//! let mut recorder = NoopRecorder;
//! loop {
//!     let resized = false; // from the window system
//!     scheduler.tick(FrameInput { resize_requested: resized }, &mut recorder)?;
//!     # break;
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use ash::vk;
use tracing::{debug, error, info, trace, warn};

use inflight_core::{RendererConfig, Timer};
use inflight_rhi::swapchain::{AcquireResult, PresentStatus, SwapchainPreferences};
use inflight_rhi::sync::wait_for_all;
use inflight_rhi::{Backend, RhiError, RhiResult, SubmitInfo};

use crate::epoch::Epoch;
use crate::frame::{FrameRecorder, FrameSlot, RenderTarget};

/// Where the scheduler is within a frame.
///
/// When `tick` fails the state is left at the phase that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    /// The frame's work is queued; presentation has not been accepted yet.
    Submitted,
    /// The image was handed to the presentation engine and its status is
    /// being acted on.
    Presenting,
    Rebuilding,
}

/// Host input for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInput {
    /// The window was resized since the previous tick. Consumed by the next
    /// rebuild.
    pub resize_requested: bool,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was submitted and queued for presentation.
    Presented {
        image_index: u32,
        slot_index: usize,
        /// The swapchain was rebuilt during this tick.
        rebuilt: bool,
    },
    /// A slot fence or the acquisition timed out. Nothing was changed; call
    /// `tick` again.
    TimedOut,
}

/// Frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub rebuilds: u64,
    pub timeouts: u64,
    pub out_of_date_acquires: u64,
    pub suboptimal_presents: u64,
    /// Host time between the two most recent presented frames.
    pub last_frame_time: Duration,
    pub fps: f32,
}

/// Aborts a wait for a non-zero drawable extent.
///
/// Cloneable and usable from any thread. Once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Drives frames through acquire, record, submit and present.
///
/// # Thread Safety
///
/// A single thread owns the scheduler and calls [`tick`](Self::tick). Only
/// the [`CancelHandle`] is meant to be shared.
pub struct FrameScheduler<B: Backend> {
    backend: Arc<B>,
    config: RendererConfig,
    preferences: SwapchainPreferences,
    wait_stage: vk::PipelineStageFlags,
    /// `None` only after a failed rebuild.
    epoch: Option<Epoch<B>>,
    slots: Vec<FrameSlot<B>>,
    current_slot: usize,
    current_sync: usize,
    generation: u64,
    frame_number: u64,
    resize_pending: bool,
    /// A rebuild was deferred because the slot drain timed out.
    rebuild_pending: bool,
    state: FrameState,
    stats: FrameStats,
    timer: Timer,
    cancel: CancelHandle,
}

impl<B: Backend> FrameScheduler<B> {
    /// Creates the frame slots and the first swapchain epoch.
    ///
    /// Blocks while the drawable extent is zero, like a rebuild does.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or any object cannot
    /// be created.
    pub fn new(backend: Arc<B>, config: &RendererConfig) -> RhiResult<Self> {
        Self::with_cancel_handle(backend, config, CancelHandle::new())
    }

    /// Like [`new`](Self::new), with a caller-provided cancel handle so the
    /// initial extent wait can be aborted too.
    pub fn with_cancel_handle(
        backend: Arc<B>,
        config: &RendererConfig,
        cancel: CancelHandle,
    ) -> RhiResult<Self> {
        config.validate()?;

        let slots = (0..config.frames_in_flight)
            .map(|i| FrameSlot::new(backend.clone(), i))
            .collect::<RhiResult<Vec<_>>>()?;

        let mut scheduler = Self {
            backend,
            config: config.clone(),
            preferences: SwapchainPreferences::from_config(config),
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            epoch: None,
            slots,
            current_slot: 0,
            current_sync: 0,
            generation: 0,
            frame_number: 0,
            resize_pending: false,
            rebuild_pending: false,
            state: FrameState::Idle,
            stats: FrameStats::default(),
            timer: Timer::new(),
            cancel,
        };

        let extent = scheduler.wait_for_drawable_extent()?;
        scheduler.create_epoch(extent)?;

        info!(
            "Frame scheduler created: {} frames in flight, {} swapchain images",
            scheduler.slots.len(),
            scheduler.image_count()
        );
        Ok(scheduler)
    }

    /// Overrides the stage at which a submission waits for its acquired image.
    ///
    /// Defaults to `COLOR_ATTACHMENT_OUTPUT`; a recorder that first touches the
    /// image in a transfer should pass `TRANSFER`.
    pub fn with_wait_stage(mut self, stage: vk::PipelineStageFlags) -> Self {
        self.wait_stage = stage;
        self
    }

    /// Runs one frame.
    ///
    /// # Errors
    ///
    /// Timeouts, out-of-date and suboptimal swapchains are handled here and
    /// never returned as errors. Anything else (device loss, a failed rebuild,
    /// a recorder error, too many consecutive out-of-date acquisitions) is.
    pub fn tick<R>(&mut self, input: FrameInput, recorder: &mut R) -> RhiResult<FrameOutcome>
    where
        R: FrameRecorder<B>,
    {
        if input.resize_requested {
            debug!("Resize requested");
            self.resize_pending = true;
        }

        let mut rebuilt = false;
        let mut out_of_date_restarts = 0;

        if self.rebuild_pending {
            if !self.try_rebuild()? {
                return Ok(FrameOutcome::TimedOut);
            }
            rebuilt = true;
        }

        let (image_index, acquire_semaphore) = loop {
            self.set_state(FrameState::Idle);
            let slot = &self.slots[self.current_slot];
            match slot.fence().wait(self.config.fence_timeout_ns()) {
                Ok(()) => {}
                Err(RhiError::Timeout) => {
                    debug!("Frame slot {} fence wait timed out", self.current_slot);
                    self.stats.timeouts += 1;
                    return Ok(FrameOutcome::TimedOut);
                }
                Err(e) => return Err(e),
            }

            self.set_state(FrameState::Acquiring);
            let (result, acquire_semaphore) = {
                let epoch = self.epoch.as_ref().ok_or_else(missing_epoch)?;
                let semaphore = epoch.image_sync(self.current_sync).acquire_semaphore();
                let result = epoch
                    .swapchain()
                    .acquire_next_image(self.config.acquire_timeout_ns(), semaphore)?;
                (result, semaphore.handle())
            };

            match result {
                AcquireResult::Acquired {
                    image_index,
                    suboptimal,
                } => {
                    if suboptimal {
                        debug!("Acquired image {} from a suboptimal swapchain", image_index);
                    }
                    break (image_index, acquire_semaphore);
                }
                AcquireResult::OutOfDate => {
                    self.stats.out_of_date_acquires += 1;
                    out_of_date_restarts += 1;
                    if out_of_date_restarts > self.config.max_consecutive_rebuilds {
                        return Err(RhiError::SwapchainError(format!(
                            "swapchain still out of date after {} rebuilds",
                            self.config.max_consecutive_rebuilds
                        )));
                    }
                    debug!("Swapchain out of date on acquire, rebuilding");
                    if !self.try_rebuild()? {
                        return Ok(FrameOutcome::TimedOut);
                    }
                    rebuilt = true;
                }
                AcquireResult::TimedOut => {
                    debug!("Image acquisition timed out");
                    self.stats.timeouts += 1;
                    self.set_state(FrameState::Idle);
                    return Ok(FrameOutcome::TimedOut);
                }
            }
        };

        self.set_state(FrameState::Recording);
        let slot_index = self.current_slot;
        {
            let epoch = self.epoch.as_ref().ok_or_else(missing_epoch)?;
            let slot = &self.slots[slot_index];
            let command_buffer = slot.command_buffer();

            slot.fence().reset()?;
            command_buffer.reset()?;
            command_buffer.begin()?;

            let swapchain = epoch.swapchain();
            let target = RenderTarget {
                image_index,
                image: swapchain.image(image_index as usize),
                view: epoch.image_view(image_index as usize).handle(),
                extent: swapchain.extent(),
                format: swapchain.format(),
                slot_index,
                frame_number: self.frame_number,
            };
            recorder.record(self.backend.as_ref(), command_buffer.handle(), &target)?;
            command_buffer.end()?;

            let render_semaphore = epoch.image_sync(image_index as usize).render_semaphore();
            let command_buffers = [command_buffer.handle()];
            let wait_semaphores = [acquire_semaphore];
            let wait_stages = [self.wait_stage];
            let signal_semaphores = [render_semaphore.handle()];
            self.backend.submit(&SubmitInfo {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                wait_stages: &wait_stages,
                signal_semaphores: &signal_semaphores,
                fence: Some(slot.fence().handle()),
            })?;
        }
        self.set_state(FrameState::Submitted);

        let status = {
            let epoch = self.epoch.as_ref().ok_or_else(missing_epoch)?;
            let render_semaphore = epoch.image_sync(image_index as usize).render_semaphore();
            epoch.swapchain().present(image_index, render_semaphore)?
        };
        self.set_state(FrameState::Presenting);

        self.current_sync = (self.current_sync + 1) % self.image_count();
        self.current_slot = (self.current_slot + 1) % self.slots.len();
        self.frame_number += 1;
        self.stats.frames_presented += 1;
        self.stats.last_frame_time = self.timer.tick();
        self.stats.fps = self.timer.fps();

        let rebuild_reason = match status {
            PresentStatus::Optimal if self.resize_pending => Some("resize"),
            PresentStatus::Optimal => None,
            PresentStatus::Suboptimal => {
                self.stats.suboptimal_presents += 1;
                Some("suboptimal present")
            }
            PresentStatus::OutOfDate => Some("out-of-date present"),
        };
        if let Some(reason) = rebuild_reason {
            debug!("Rebuilding after {}", reason);
            rebuilt |= self.try_rebuild()?;
        }

        self.set_state(FrameState::Idle);
        Ok(FrameOutcome::Presented {
            image_index,
            slot_index,
            rebuilt,
        })
    }

    /// Replaces the swapchain epoch.
    ///
    /// Waits for a non-zero drawable extent, drains every frame slot and the
    /// device, destroys the old epoch and creates a new one. The sync index
    /// restarts at 0; the slot index and slot fences are kept.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`] if the slots do not drain within the
    /// fence timeout. Nothing has been destroyed at that point; the rebuild
    /// stays owed and the next [`tick`](Self::tick) retries it. Any other
    /// failure is fatal: the scheduler is left without an epoch when creation
    /// of the new one fails.
    pub fn rebuild(&mut self) -> RhiResult<()> {
        self.set_state(FrameState::Rebuilding);
        info!("Rebuilding swapchain (epoch {})", self.generation);

        let extent = self.wait_for_drawable_extent()?;

        match wait_for_all(
            self.backend.as_ref(),
            self.slots.iter().map(FrameSlot::fence),
            self.config.fence_timeout_ns(),
        ) {
            Ok(()) => {}
            Err(RhiError::Timeout) => {
                debug!("Frame slots still busy, deferring rebuild");
                self.rebuild_pending = true;
                self.stats.timeouts += 1;
                self.set_state(FrameState::Idle);
                return Err(RhiError::Timeout);
            }
            Err(e) => return Err(e),
        }
        self.backend.wait_idle()?;

        self.epoch = None;
        self.create_epoch(extent)?;

        self.current_sync = 0;
        self.resize_pending = false;
        self.rebuild_pending = false;
        self.stats.rebuilds += 1;
        self.set_state(FrameState::Idle);
        Ok(())
    }

    /// Rebuilds, reporting a drain timeout as `false` instead of an error.
    fn try_rebuild(&mut self) -> RhiResult<bool> {
        match self.rebuild() {
            Ok(()) => Ok(true),
            Err(RhiError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn set_state(&mut self, state: FrameState) {
        trace!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn create_epoch(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        let generation = self.generation + 1;
        let epoch = Epoch::new(self.backend.clone(), &self.preferences, extent, generation)?;
        self.generation = generation;
        self.epoch = Some(epoch);
        Ok(())
    }

    /// Polls the host until the drawable extent is non-zero.
    fn wait_for_drawable_extent(&self) -> RhiResult<vk::Extent2D> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            let extent = self.backend.drawable_extent();
            if extent.width > 0 && extent.height > 0 {
                if announced {
                    info!(
                        "Drawable extent is {}x{} again after {:?}",
                        extent.width,
                        extent.height,
                        started.elapsed()
                    );
                }
                return Ok(extent);
            }

            if self.cancel.is_cancelled() {
                warn!("Drawable extent wait cancelled");
                return Err(RhiError::Cancelled);
            }
            let waited = started.elapsed();
            if let Some(max) = self.config.max_extent_wait() {
                if waited >= max {
                    return Err(RhiError::DegenerateExtent { waited });
                }
            }
            if !announced {
                info!("Drawable extent is zero, waiting for the surface to become visible");
                announced = true;
            }
            thread::sleep(self.config.extent_poll_interval());
        }
    }

    #[inline]
    pub fn current_slot_index(&self) -> usize {
        self.current_slot
    }

    #[inline]
    pub fn current_sync_index(&self) -> usize {
        self.current_sync
    }

    /// Number of images in the current swapchain (0 after a failed rebuild).
    pub fn image_count(&self) -> usize {
        self.epoch.as_ref().map_or(0, Epoch::image_count)
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Generation of the current epoch. Starts at 1 and grows by one per rebuild.
    #[inline]
    pub fn epoch_generation(&self) -> u64 {
        self.generation
    }

    /// Extent of the current swapchain.
    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.epoch.as_ref().map(|e| e.swapchain().extent())
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        self.state
    }

    #[inline]
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    #[inline]
    pub fn resize_pending(&self) -> bool {
        self.resize_pending
    }

    /// A rebuild was deferred by a drain timeout and runs on the next tick.
    #[inline]
    pub fn rebuild_pending(&self) -> bool {
        self.rebuild_pending
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}

fn missing_epoch() -> RhiError {
    RhiError::SwapchainError("no swapchain after a failed rebuild".to_string())
}

impl<B: Backend> Drop for FrameScheduler<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            error!("Failed to wait for device idle during drop: {:?}", e);
        }
        info!(
            "Frame scheduler destroyed after {} frames, {} rebuilds",
            self.stats.frames_presented, self.stats.rebuilds
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflight_rhi::headless::HeadlessBackend;

    #[test]
    fn test_cancel_handle_is_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_cancelled());
        clone.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_cancel_handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CancelHandle>();
    }

    #[test]
    fn test_scheduler_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<FrameScheduler<HeadlessBackend>>();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let backend = Arc::new(HeadlessBackend::default());
        let config = RendererConfig {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert!(matches!(
            FrameScheduler::new(backend, &config),
            Err(RhiError::Configuration(_))
        ));
    }

    #[test]
    fn test_initial_state() {
        let backend = Arc::new(HeadlessBackend::default());
        let scheduler = FrameScheduler::new(backend, &RendererConfig::default()).expect("scheduler");

        assert_eq!(scheduler.state(), FrameState::Idle);
        assert_eq!(scheduler.frames_in_flight(), 2);
        assert_eq!(scheduler.image_count(), 3);
        assert_eq!(scheduler.epoch_generation(), 1);
        assert_eq!(scheduler.current_slot_index(), 0);
        assert_eq!(scheduler.current_sync_index(), 0);
        assert_eq!(*scheduler.stats(), FrameStats::default());
    }
}
