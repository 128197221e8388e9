//! In-process simulated GPU.
//!
//! [`HeadlessBackend`] implements [`Backend`] without any driver. Work submitted
//! to its single queue completes after a configurable latency on a serial
//! timeline: a submission starts when the previous one finishes (or now, if
//! the queue is empty) and completes `gpu_latency` later. A fence is only
//! observed signaled once its completion time has passed, so a host that waits
//! on it really does block until then.
//!
//! Everything observable is appended to an ordered event trace
//! ([`HeadlessBackend::events`]). Misuse of the synchronization contract is
//! recorded as a validation violation ([`HeadlessBackend::validation_errors`])
//! and reported to the caller as [`RhiError::Validation`]:
//!
//! - signaling a binary semaphore that is already signaled
//! - waiting on a semaphore nothing will signal
//! - resetting a fence (or command buffer) whose work is still pending
//! - beginning a command buffer that was not reset
//! - destroying an object still referenced by pending work
//! - destroying a swapchain while views of its images are alive
//! - waiting forever on a fence no submission will signal
//!
//! The surface is scriptable: the drawable extent can be changed or given as
//! a sequence, acquisition order can be reversed, and acquire/present results
//! and device loss can be injected.

use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, SubmitInfo, SwapchainDesc};
use crate::error::{RhiError, RhiResult};
use crate::swapchain::{AcquireResult, PresentStatus, SurfaceSupport};

const MIN_IMAGE_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 1,
    height: 1,
};
const MAX_IMAGE_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 16384,
    height: 16384,
};

/// Order in which free swapchain images are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquireOrder {
    /// 0, 1, 2, ... wrapping around.
    #[default]
    Sequential,
    /// n-1, n-2, ... wrapping around.
    Reverse,
}

/// Simulated surface and queue behavior.
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub min_image_count: u32,
    /// 0 means unbounded.
    pub max_image_count: u32,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// Time each submission spends on the queue.
    pub gpu_latency: Duration,
    pub initial_extent: vk::Extent2D,
    /// Report the drawable extent as the surface's current extent. When false
    /// the current extent is undefined (`u32::MAX`) and the caller picks one.
    pub report_current_extent: bool,
    /// Report out-of-date once the drawable extent differs from the swapchain's.
    /// Only applies when the current extent is reported.
    pub invalidate_on_resize: bool,
    pub acquire_order: AcquireOrder,
    /// Maximum number of trace entries kept; older entries are dropped.
    /// `None` keeps everything.
    pub event_capacity: Option<usize>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            min_image_count: 2,
            max_image_count: 8,
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            gpu_latency: Duration::from_millis(1),
            initial_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            report_current_extent: true,
            invalidate_on_resize: true,
            acquire_order: AcquireOrder::Sequential,
            event_capacity: None,
        }
    }
}

/// One entry of the ordered trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadlessEvent {
    FenceCreated {
        fence: vk::Fence,
        signaled: bool,
    },
    FenceDestroyed {
        fence: vk::Fence,
    },
    FenceWait {
        fences: Vec<vk::Fence>,
    },
    /// The host observed the fence's work as complete.
    FenceSignaled {
        fence: vk::Fence,
    },
    FenceReset {
        fence: vk::Fence,
    },
    SemaphoreCreated {
        semaphore: vk::Semaphore,
    },
    SemaphoreDestroyed {
        semaphore: vk::Semaphore,
    },
    CommandBufferReset {
        command_buffer: vk::CommandBuffer,
    },
    CommandBufferBegin {
        command_buffer: vk::CommandBuffer,
    },
    CommandBufferEnd {
        command_buffer: vk::CommandBuffer,
    },
    DrawableExtentQueried {
        extent: vk::Extent2D,
    },
    SwapchainCreated {
        swapchain: vk::SwapchainKHR,
        extent: vk::Extent2D,
        image_count: u32,
        format: vk::Format,
        present_mode: vk::PresentModeKHR,
    },
    SwapchainDestroyed {
        swapchain: vk::SwapchainKHR,
    },
    ImageViewCreated {
        view: vk::ImageView,
        image: vk::Image,
    },
    ImageViewDestroyed {
        view: vk::ImageView,
    },
    Acquire {
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        result: AcquireResult,
    },
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: Option<vk::Fence>,
    },
    Present {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: Vec<vk::Semaphore>,
        status: PresentStatus,
    },
    WaitIdle,
}

/// Number of live objects of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveObjects {
    pub fences: usize,
    pub semaphores: usize,
    pub command_buffers: usize,
    pub swapchains: usize,
    pub image_views: usize,
}

#[derive(Debug, Clone, Copy)]
enum FenceState {
    Unsignaled,
    Signaled,
    Pending { completes_at: Instant },
}

#[derive(Debug, Clone, Copy)]
enum RecordingState {
    Initial,
    Recording,
    Executable,
    Pending { completes_at: Instant },
}

#[derive(Debug, Clone, Copy, Default)]
struct SemaphoreState {
    signaled: bool,
    busy_until: Option<Instant>,
}

#[derive(Debug)]
struct SwapchainState {
    images: Vec<vk::Image>,
    held: Vec<bool>,
    cursor: usize,
    extent: vk::Extent2D,
    busy_until: Option<Instant>,
}

enum WaitTarget {
    Ready,
    Never,
    At(Instant),
}

struct State {
    next_raw: u64,
    fences: HashMap<vk::Fence, FenceState>,
    semaphores: HashMap<vk::Semaphore, SemaphoreState>,
    command_buffers: HashMap<vk::CommandBuffer, RecordingState>,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainState>,
    images: HashMap<vk::Image, vk::SwapchainKHR>,
    views: HashMap<vk::ImageView, vk::Image>,
    queue_tail: Instant,
    drawable: VecDeque<vk::Extent2D>,
    acquire_faults: VecDeque<AcquireResult>,
    present_faults: VecDeque<PresentStatus>,
    device_lost: bool,
    lose_device_on_present: bool,
    events: VecDeque<HeadlessEvent>,
    event_capacity: Option<usize>,
    violations: Vec<String>,
}

impl State {
    fn new(initial_extent: vk::Extent2D, event_capacity: Option<usize>) -> Self {
        Self {
            next_raw: 0,
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            command_buffers: HashMap::new(),
            swapchains: HashMap::new(),
            images: HashMap::new(),
            views: HashMap::new(),
            queue_tail: Instant::now(),
            drawable: VecDeque::from([initial_extent]),
            acquire_faults: VecDeque::new(),
            present_faults: VecDeque::new(),
            device_lost: false,
            lose_device_on_present: false,
            events: VecDeque::new(),
            event_capacity,
            violations: Vec::new(),
        }
    }

    /// Appends to the trace, dropping the oldest entry once the capacity is reached.
    fn push_event(&mut self, event: HeadlessEvent) {
        if let Some(capacity) = self.event_capacity {
            if capacity == 0 {
                return;
            }
            while self.events.len() >= capacity {
                self.events.pop_front();
            }
        }
        self.events.push_back(event);
    }

    fn next_handle<H: vk::Handle>(&mut self) -> H {
        self.next_raw += 1;
        H::from_raw(self.next_raw)
    }

    fn violation(&mut self, message: String) -> RhiError {
        warn!("Validation: {}", message);
        self.violations.push(message.clone());
        RhiError::Validation(message)
    }

    fn check_device(&self) -> RhiResult<()> {
        if self.device_lost {
            Err(RhiError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn current_drawable(&self) -> vk::Extent2D {
        self.drawable.front().copied().unwrap_or_default()
    }

    /// Marks the fence signaled if its work has completed by `now`.
    fn observe_fence(&mut self, fence: vk::Fence, now: Instant) -> Option<bool> {
        let state = self.fences.get(&fence).copied()?;
        match state {
            FenceState::Signaled => Some(true),
            FenceState::Unsignaled => Some(false),
            FenceState::Pending { completes_at } if completes_at <= now => {
                self.fences.insert(fence, FenceState::Signaled);
                self.push_event(HeadlessEvent::FenceSignaled { fence });
                Some(true)
            }
            FenceState::Pending { .. } => Some(false),
        }
    }

    fn settle_command_buffer(
        &mut self,
        command_buffer: vk::CommandBuffer,
        now: Instant,
    ) -> RhiResult<RecordingState> {
        let state = self
            .command_buffers
            .get(&command_buffer)
            .copied()
            .ok_or_else(|| {
                RhiError::InvalidHandle(format!("unknown command buffer {:?}", command_buffer))
            })?;
        let settled = match state {
            RecordingState::Pending { completes_at } if completes_at <= now => {
                RecordingState::Executable
            }
            other => other,
        };
        self.command_buffers.insert(command_buffer, settled);
        Ok(settled)
    }

    fn mark_semaphore_busy(&mut self, semaphore: vk::Semaphore, until: Instant) {
        if let Some(state) = self.semaphores.get_mut(&semaphore) {
            state.busy_until = Some(state.busy_until.map_or(until, |t| t.max(until)));
        }
    }

    /// Whether the surface no longer matches `swapchain`.
    fn is_out_of_date(&self, config: &HeadlessConfig, swapchain: &SwapchainState) -> bool {
        config.invalidate_on_resize
            && config.report_current_extent
            && self.current_drawable() != swapchain.extent
    }
}

/// Simulated GPU, queue and presentation surface.
///
/// Handles are real `ash` handle types with synthetic values, so code written
/// against `HeadlessBackend` has the same shape as code written against
/// [`VulkanBackend`](crate::vulkan::VulkanBackend).
pub struct HeadlessBackend {
    config: HeadlessConfig,
    state: Mutex<State>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl HeadlessBackend {
    pub fn new(config: HeadlessConfig) -> Self {
        info!(
            "Headless backend: {}x{}, latency {:?}, images {}..{}",
            config.initial_extent.width,
            config.initial_extent.height,
            config.gpu_latency,
            config.min_image_count,
            config.max_image_count
        );
        let state = State::new(config.initial_extent, config.event_capacity);
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &HeadlessConfig {
        &self.config
    }

    /// Snapshot of the event trace so far.
    pub fn events(&self) -> Vec<HeadlessEvent> {
        self.state.lock().events.iter().cloned().collect()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Every validation violation recorded so far.
    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state.lock();
        LiveObjects {
            fences: state.fences.len(),
            semaphores: state.semaphores.len(),
            command_buffers: state.command_buffers.len(),
            swapchains: state.swapchains.len(),
            image_views: state.views.len(),
        }
    }

    /// Replaces the drawable extent, as a window resize would.
    pub fn set_drawable_extent(&self, extent: vk::Extent2D) {
        let mut state = self.state.lock();
        state.drawable.clear();
        state.drawable.push_back(extent);
    }

    /// Scripts the drawable extent. The first entry becomes the current extent;
    /// each query returns the current entry and then advances to the next one.
    /// The last entry sticks. An empty script is ignored.
    pub fn script_drawable_extents<I>(&self, extents: I)
    where
        I: IntoIterator<Item = vk::Extent2D>,
    {
        let script: VecDeque<_> = extents.into_iter().collect();
        if script.is_empty() {
            return;
        }
        self.state.lock().drawable = script;
    }

    /// Overrides the result of the next acquisition.
    ///
    /// `Acquired { suboptimal, .. }` performs a normal acquisition and only
    /// forces the suboptimal flag; the index is ignored.
    pub fn push_acquire_result(&self, result: AcquireResult) {
        self.state.lock().acquire_faults.push_back(result);
    }

    /// Overrides the status of the next presentation.
    pub fn push_present_status(&self, status: PresentStatus) {
        self.state.lock().present_faults.push_back(status);
    }

    /// The next presentation loses the device: it and every following queue,
    /// wait or presentation call fail with `DeviceLost`.
    pub fn inject_device_lost_on_present(&self) {
        self.state.lock().lose_device_on_present = true;
    }

    /// Every following queue, wait or presentation call fails with `DeviceLost`.
    pub fn inject_device_lost(&self) {
        warn!("Injecting device loss");
        self.state.lock().device_lost = true;
    }

    fn surface_capabilities(&self, current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        let current_extent = if self.config.report_current_extent {
            current
        } else {
            vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            }
        };
        vk::SurfaceCapabilitiesKHR {
            min_image_count: self.config.min_image_count,
            max_image_count: self.config.max_image_count,
            current_extent,
            min_image_extent: MIN_IMAGE_EXTENT,
            max_image_extent: MAX_IMAGE_EXTENT,
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    fn pick_image(&self, swapchain: &mut SwapchainState) -> Option<u32> {
        let count = swapchain.images.len();
        for step in 0..count {
            let position = (swapchain.cursor + step) % count;
            let index = match self.config.acquire_order {
                AcquireOrder::Sequential => position,
                AcquireOrder::Reverse => count - 1 - position,
            };
            if !swapchain.held[index] {
                swapchain.cursor = (position + 1) % count;
                return Some(index as u32);
            }
        }
        None
    }
}

impl Backend for HeadlessBackend {
    type Fence = vk::Fence;
    type Semaphore = vk::Semaphore;
    type CommandBuffer = vk::CommandBuffer;
    type Swapchain = vk::SwapchainKHR;
    type Image = vk::Image;
    type ImageView = vk::ImageView;

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence: vk::Fence = state.next_handle();
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(fence, initial);
        state.push_event(HeadlessEvent::FenceCreated { fence, signaled });
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some(FenceState::Pending { completes_at }) = state.fences.get(&fence).copied() {
            if completes_at > now {
                state.violation(format!("fence {:?} destroyed while pending", fence));
            }
        }
        state.fences.remove(&fence);
        state.push_event(HeadlessEvent::FenceDestroyed { fence });
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> RhiResult<()> {
        let target = {
            let mut state = self.state.lock();
            state.check_device()?;
            state.push_event(HeadlessEvent::FenceWait {
                fences: fences.to_vec(),
            });

            let mut target = WaitTarget::Ready;
            for &fence in fences {
                match state.fences.get(&fence).copied() {
                    None => {
                        return Err(RhiError::InvalidHandle(format!(
                            "wait on unknown fence {:?}",
                            fence
                        )));
                    }
                    Some(FenceState::Signaled) => {}
                    Some(FenceState::Unsignaled) => target = WaitTarget::Never,
                    Some(FenceState::Pending { completes_at }) => {
                        target = match target {
                            WaitTarget::Ready => WaitTarget::At(completes_at),
                            WaitTarget::At(at) => WaitTarget::At(at.max(completes_at)),
                            WaitTarget::Never => WaitTarget::Never,
                        };
                    }
                }
            }

            if matches!(target, WaitTarget::Never) && timeout == u64::MAX {
                return Err(state.violation(format!(
                    "infinite wait on {:?} with no pending work to signal it",
                    fences
                )));
            }
            target
        };

        let limit = (timeout != u64::MAX).then(|| Duration::from_nanos(timeout));
        match target {
            WaitTarget::Ready => {}
            WaitTarget::Never => {
                if let Some(limit) = limit {
                    thread::sleep(limit);
                }
                return Err(RhiError::Timeout);
            }
            WaitTarget::At(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                if let Some(limit) = limit {
                    if limit < remaining {
                        thread::sleep(limit);
                        return Err(RhiError::Timeout);
                    }
                }
                if !remaining.is_zero() {
                    thread::sleep(remaining);
                }
            }
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        for &fence in fences {
            state.observe_fence(fence, now);
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        let mut state = self.state.lock();
        let now = Instant::now();
        for &fence in fences {
            match state.fences.get(&fence).copied() {
                None => {
                    return Err(RhiError::InvalidHandle(format!(
                        "reset of unknown fence {:?}",
                        fence
                    )));
                }
                Some(FenceState::Pending { completes_at }) if completes_at > now => {
                    return Err(
                        state.violation(format!("fence {:?} reset while its work is pending", fence))
                    );
                }
                Some(_) => {
                    state.fences.insert(fence, FenceState::Unsignaled);
                    state.push_event(HeadlessEvent::FenceReset { fence });
                }
            }
        }
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        let mut state = self.state.lock();
        state.check_device()?;
        state
            .observe_fence(fence, Instant::now())
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown fence {:?}", fence)))
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore: vk::Semaphore = state.next_handle();
        state.semaphores.insert(semaphore, SemaphoreState::default());
        state
            .push_event(HeadlessEvent::SemaphoreCreated { semaphore });
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some(busy_until) = state.semaphores.get(&semaphore).and_then(|s| s.busy_until) {
            if busy_until > now {
                state.violation(format!(
                    "semaphore {:?} destroyed while referenced by pending work",
                    semaphore
                ));
            }
        }
        state.semaphores.remove(&semaphore);
        state
            .push_event(HeadlessEvent::SemaphoreDestroyed { semaphore });
    }

    fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let command_buffer: vk::CommandBuffer = state.next_handle();
        state
            .command_buffers
            .insert(command_buffer, RecordingState::Initial);
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Ok(RecordingState::Pending { .. }) = state.settle_command_buffer(command_buffer, now)
        {
            state.violation(format!(
                "command buffer {:?} freed while pending",
                command_buffer
            ));
        }
        state.command_buffers.remove(&command_buffer);
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let RecordingState::Pending { .. } = state.settle_command_buffer(command_buffer, now)? {
            return Err(state.violation(format!(
                "command buffer {:?} reset while pending",
                command_buffer
            )));
        }
        state
            .command_buffers
            .insert(command_buffer, RecordingState::Initial);
        state
            .push_event(HeadlessEvent::CommandBufferReset { command_buffer });
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.settle_command_buffer(command_buffer, now)? {
            RecordingState::Initial => {
                state
                    .command_buffers
                    .insert(command_buffer, RecordingState::Recording);
                state
                    .push_event(HeadlessEvent::CommandBufferBegin { command_buffer });
                Ok(())
            }
            other => Err(state.violation(format!(
                "command buffer {:?} begun in state {:?} without a reset",
                command_buffer, other
            ))),
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.settle_command_buffer(command_buffer, now)? {
            RecordingState::Recording => {
                state
                    .command_buffers
                    .insert(command_buffer, RecordingState::Executable);
                state
                    .push_event(HeadlessEvent::CommandBufferEnd { command_buffer });
                Ok(())
            }
            other => Err(state.violation(format!(
                "command buffer {:?} ended in state {:?}",
                command_buffer, other
            ))),
        }
    }

    fn surface_support(&self) -> RhiResult<SurfaceSupport> {
        let current = self.state.lock().current_drawable();
        Ok(SurfaceSupport {
            capabilities: self.surface_capabilities(current),
            formats: self.config.formats.clone(),
            present_modes: self.config.present_modes.clone(),
        })
    }

    fn drawable_extent(&self) -> vk::Extent2D {
        let mut state = self.state.lock();
        let extent = state.current_drawable();
        if state.drawable.len() > 1 {
            state.drawable.pop_front();
        }
        state
            .push_event(HeadlessEvent::DrawableExtentQueried { extent });
        extent
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(state.violation(format!(
                "swapchain requested with degenerate extent {}x{}",
                desc.extent.width, desc.extent.height
            )));
        }
        if !self.config.formats.contains(&desc.surface_format) {
            return Err(state.violation(format!(
                "unsupported surface format {:?}",
                desc.surface_format
            )));
        }
        if !self.config.present_modes.contains(&desc.present_mode) {
            return Err(state.violation(format!(
                "unsupported present mode {:?}",
                desc.present_mode
            )));
        }

        let swapchain: vk::SwapchainKHR = state.next_handle();
        let image_count = desc.min_image_count.max(1);
        let images: Vec<vk::Image> = (0..image_count).map(|_| state.next_handle()).collect();
        for &image in &images {
            state.images.insert(image, swapchain);
        }
        state.swapchains.insert(
            swapchain,
            SwapchainState {
                held: vec![false; images.len()],
                images,
                cursor: 0,
                extent: desc.extent,
                busy_until: None,
            },
        );
        state.push_event(HeadlessEvent::SwapchainCreated {
            swapchain,
            extent: desc.extent,
            image_count,
            format: desc.surface_format.format,
            present_mode: desc.present_mode,
        });
        debug!(
            "Headless swapchain {:?}: {}x{}, {} images",
            swapchain, desc.extent.width, desc.extent.height, image_count
        );
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let Some(removed) = state.swapchains.remove(&swapchain) else {
            state.violation(format!("destroy of unknown swapchain {:?}", swapchain));
            return;
        };

        if removed.busy_until.is_some_and(|t| t > now) {
            state.violation(format!(
                "swapchain {:?} destroyed while a present is pending",
                swapchain
            ));
        }
        let live_views = state
            .views
            .values()
            .filter(|&&image| removed.images.contains(&image))
            .count();
        if live_views > 0 {
            state.violation(format!(
                "swapchain {:?} destroyed with {} live image views",
                swapchain, live_views
            ));
        }
        for image in &removed.images {
            state.images.remove(image);
        }
        state
            .push_event(HeadlessEvent::SwapchainDestroyed { swapchain });
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain)
            .map(|s| s.images.clone())
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown swapchain {:?}", swapchain)))
    }

    fn create_image_view(&self, image: vk::Image, _format: vk::Format) -> RhiResult<vk::ImageView> {
        let mut state = self.state.lock();
        if !state.images.contains_key(&image) {
            return Err(RhiError::InvalidHandle(format!(
                "view of unknown image {:?}",
                image
            )));
        }
        let view: vk::ImageView = state.next_handle();
        state.views.insert(view, image);
        state
            .push_event(HeadlessEvent::ImageViewCreated { view, image });
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        state.views.remove(&view);
        state.push_event(HeadlessEvent::ImageViewDestroyed { view });
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> RhiResult<AcquireResult> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check_device()?;

        let mut suboptimal = false;
        let forced = match state.acquire_faults.pop_front() {
            Some(AcquireResult::Acquired {
                suboptimal: flag, ..
            }) => {
                suboptimal = flag;
                None
            }
            other => other,
        };

        let swapchain_state = state
            .swapchains
            .get(&swapchain)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown swapchain {:?}", swapchain)))?;
        let out_of_date = state.is_out_of_date(&self.config, swapchain_state);

        let result = match forced {
            Some(result) => result,
            None if out_of_date => AcquireResult::OutOfDate,
            None => {
                let signaled = state
                    .semaphores
                    .get(&signal)
                    .map(|s| s.signaled)
                    .ok_or_else(|| {
                        RhiError::InvalidHandle(format!("unknown semaphore {:?}", signal))
                    })?;
                if signaled {
                    return Err(state.violation(format!(
                        "acquire signals semaphore {:?} which is already signaled",
                        signal
                    )));
                }

                let picked = match state.swapchains.get_mut(&swapchain) {
                    Some(swapchain_state) => self.pick_image(swapchain_state),
                    None => None,
                };
                match picked {
                    Some(image_index) => {
                        if let Some(swapchain_state) = state.swapchains.get_mut(&swapchain) {
                            swapchain_state.held[image_index as usize] = true;
                        }
                        if let Some(semaphore) = state.semaphores.get_mut(&signal) {
                            semaphore.signaled = true;
                        }
                        AcquireResult::Acquired {
                            image_index,
                            suboptimal,
                        }
                    }
                    None if timeout == u64::MAX => {
                        return Err(state.violation(
                            "infinite acquire with every image held by the application"
                                .to_string(),
                        ));
                    }
                    None => AcquireResult::TimedOut,
                }
            }
        };

        trace!("Acquire on {:?}: {:?}", swapchain, result);
        state.push_event(HeadlessEvent::Acquire {
            swapchain,
            semaphore: signal,
            result,
        });
        Ok(result)
    }

    fn submit(&self, info: &SubmitInfo<'_, Self>) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.check_device()?;
        let now = Instant::now();

        if info.wait_semaphores.len() != info.wait_stages.len() {
            return Err(state.violation(format!(
                "{} wait semaphores with {} wait stages",
                info.wait_semaphores.len(),
                info.wait_stages.len()
            )));
        }
        for &command_buffer in info.command_buffers {
            match state.settle_command_buffer(command_buffer, now)? {
                RecordingState::Executable => {}
                other => {
                    return Err(state.violation(format!(
                        "command buffer {:?} submitted in state {:?}",
                        command_buffer, other
                    )));
                }
            }
        }
        if let Some(fence) = info.fence {
            match state.fences.get(&fence).copied() {
                Some(FenceState::Unsignaled) => {}
                Some(other) => {
                    return Err(state.violation(format!(
                        "submit with fence {:?} in state {:?}",
                        fence, other
                    )));
                }
                None => {
                    return Err(RhiError::InvalidHandle(format!("unknown fence {:?}", fence)));
                }
            }
        }

        let start = now.max(state.queue_tail);
        let completes_at = start + self.config.gpu_latency;
        state.queue_tail = completes_at;

        for &semaphore in info.wait_semaphores {
            match state.semaphores.get(&semaphore).map(|s| s.signaled) {
                Some(true) => {}
                Some(false) => {
                    return Err(state.violation(format!(
                        "submit waits on semaphore {:?} that nothing signals",
                        semaphore
                    )));
                }
                None => {
                    return Err(RhiError::InvalidHandle(format!(
                        "unknown semaphore {:?}",
                        semaphore
                    )));
                }
            }
            if let Some(s) = state.semaphores.get_mut(&semaphore) {
                s.signaled = false;
            }
            state.mark_semaphore_busy(semaphore, completes_at);
        }
        for &semaphore in info.signal_semaphores {
            match state.semaphores.get(&semaphore).map(|s| s.signaled) {
                Some(false) => {}
                Some(true) => {
                    return Err(state.violation(format!(
                        "submit signals semaphore {:?} which is already signaled",
                        semaphore
                    )));
                }
                None => {
                    return Err(RhiError::InvalidHandle(format!(
                        "unknown semaphore {:?}",
                        semaphore
                    )));
                }
            }
            if let Some(s) = state.semaphores.get_mut(&semaphore) {
                s.signaled = true;
            }
            state.mark_semaphore_busy(semaphore, completes_at);
        }
        for &command_buffer in info.command_buffers {
            state
                .command_buffers
                .insert(command_buffer, RecordingState::Pending { completes_at });
        }
        if let Some(fence) = info.fence {
            state
                .fences
                .insert(fence, FenceState::Pending { completes_at });
        }

        state.push_event(HeadlessEvent::Submit {
            command_buffers: info.command_buffers.to_vec(),
            wait_semaphores: info.wait_semaphores.to_vec(),
            signal_semaphores: info.signal_semaphores.to_vec(),
            fence: info.fence,
        });
        Ok(())
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: &[vk::Semaphore],
    ) -> RhiResult<PresentStatus> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.lose_device_on_present {
            warn!("Losing device on present");
            state.device_lost = true;
        }
        state.check_device()?;
        let now = Instant::now();
        let completes_at = now.max(state.queue_tail);

        let swapchain_state = state
            .swapchains
            .get(&swapchain)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown swapchain {:?}", swapchain)))?;
        let out_of_date = state.is_out_of_date(&self.config, swapchain_state);
        let held = swapchain_state
            .held
            .get(image_index as usize)
            .copied()
            .unwrap_or(false);
        if !held {
            return Err(state.violation(format!(
                "present of image {} which the application does not hold",
                image_index
            )));
        }

        for &semaphore in wait {
            match state.semaphores.get(&semaphore).map(|s| s.signaled) {
                Some(true) => {}
                Some(false) => {
                    return Err(state.violation(format!(
                        "present waits on semaphore {:?} that nothing signals",
                        semaphore
                    )));
                }
                None => {
                    return Err(RhiError::InvalidHandle(format!(
                        "unknown semaphore {:?}",
                        semaphore
                    )));
                }
            }
            if let Some(s) = state.semaphores.get_mut(&semaphore) {
                s.signaled = false;
            }
            state.mark_semaphore_busy(semaphore, completes_at);
        }

        if let Some(swapchain_state) = state.swapchains.get_mut(&swapchain) {
            swapchain_state.held[image_index as usize] = false;
            swapchain_state.busy_until = Some(
                swapchain_state
                    .busy_until
                    .map_or(completes_at, |t| t.max(completes_at)),
            );
        }

        let status = match state.present_faults.pop_front() {
            Some(status) => status,
            None if out_of_date => PresentStatus::OutOfDate,
            None => PresentStatus::Optimal,
        };
        trace!("Present {} on {:?}: {:?}", image_index, swapchain, status);
        state.push_event(HeadlessEvent::Present {
            swapchain,
            image_index,
            wait_semaphores: wait.to_vec(),
            status,
        });
        Ok(status)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let tail = {
            let state = self.state.lock();
            state.check_device()?;
            state.queue_tail
        };

        let remaining = tail.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            thread::sleep(remaining);
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        let pending: Vec<vk::Fence> = state
            .fences
            .iter()
            .filter(|(_, s)| matches!(s, FenceState::Pending { .. }))
            .map(|(&f, _)| f)
            .collect();
        for fence in pending {
            state.observe_fence(fence, now);
        }
        state.push_event(HeadlessEvent::WaitIdle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn desc(backend: &HeadlessBackend, image_count: u32) -> SwapchainDesc {
        SwapchainDesc {
            surface_format: backend.config().formats[0],
            present_mode: vk::PresentModeKHR::FIFO,
            extent: extent(1280, 720),
            min_image_count: image_count,
            pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        }
    }

    #[test]
    fn test_backend_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HeadlessBackend>();
    }

    #[test]
    fn test_fence_observed_only_after_latency() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            gpu_latency: Duration::from_millis(20),
            ..Default::default()
        });
        let fence = backend.create_fence(false).expect("fence");
        let cb = backend.allocate_command_buffer().expect("cb");
        backend.begin_command_buffer(cb).expect("begin");
        backend.end_command_buffer(cb).expect("end");

        let start = Instant::now();
        backend
            .submit(&SubmitInfo {
                command_buffers: &[cb],
                wait_semaphores: &[],
                wait_stages: &[],
                signal_semaphores: &[],
                fence: Some(fence),
            })
            .expect("submit");

        assert!(!backend.fence_status(fence).expect("status"));
        backend.wait_for_fences(&[fence], u64::MAX).expect("wait");
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(backend.fence_status(fence).expect("status"));
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            gpu_latency: Duration::from_millis(200),
            ..Default::default()
        });
        let fence = backend.create_fence(false).expect("fence");
        let cb = backend.allocate_command_buffer().expect("cb");
        backend.begin_command_buffer(cb).expect("begin");
        backend.end_command_buffer(cb).expect("end");
        backend
            .submit(&SubmitInfo {
                command_buffers: &[cb],
                wait_semaphores: &[],
                wait_stages: &[],
                signal_semaphores: &[],
                fence: Some(fence),
            })
            .expect("submit");

        let result = backend.wait_for_fences(&[fence], 1_000_000);
        assert!(matches!(result, Err(RhiError::Timeout)));
        assert!(matches!(
            backend.reset_fences(&[fence]),
            Err(RhiError::Validation(_))
        ));

        backend.wait_idle().expect("idle");
        backend.reset_fences(&[fence]).expect("reset after idle");
    }

    #[test]
    fn test_infinite_wait_on_idle_fence_is_a_violation() {
        let backend = HeadlessBackend::default();
        let fence = backend.create_fence(false).expect("fence");
        assert!(matches!(
            backend.wait_for_fences(&[fence], u64::MAX),
            Err(RhiError::Validation(_))
        ));
        assert_eq!(backend.validation_errors().len(), 1);
    }

    #[test]
    fn test_drawable_script_last_entry_sticks() {
        let backend = HeadlessBackend::default();
        backend.script_drawable_extents([extent(0, 0), extent(640, 480)]);

        assert_eq!(backend.drawable_extent(), extent(0, 0));
        assert_eq!(backend.drawable_extent(), extent(640, 480));
        assert_eq!(backend.drawable_extent(), extent(640, 480));

        backend.script_drawable_extents([extent(0, 0), extent(0, 0), extent(800, 600)]);
        assert_eq!(backend.drawable_extent(), extent(0, 0));
        assert_eq!(backend.drawable_extent(), extent(0, 0));
        assert_eq!(backend.drawable_extent(), extent(800, 600));
        assert_eq!(backend.drawable_extent(), extent(800, 600));
    }

    #[test]
    fn test_surface_support_reports_current_extent() {
        let backend = HeadlessBackend::default();
        let support = backend.surface_support().expect("support");
        assert_eq!(support.capabilities.current_extent, extent(1280, 720));

        let backend = HeadlessBackend::new(HeadlessConfig {
            report_current_extent: false,
            ..Default::default()
        });
        let support = backend.surface_support().expect("support");
        assert_eq!(support.capabilities.current_extent.width, u32::MAX);
    }

    #[test]
    fn test_reverse_acquire_order() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            acquire_order: AcquireOrder::Reverse,
            ..Default::default()
        });
        let swapchain = backend.create_swapchain(&desc(&backend, 3)).expect("swapchain");
        let first = backend.create_semaphore().expect("semaphore");
        let second = backend.create_semaphore().expect("semaphore");

        let a = backend
            .acquire_next_image(swapchain, 0, first)
            .expect("acquire");
        let b = backend
            .acquire_next_image(swapchain, 0, second)
            .expect("acquire");
        assert_eq!(
            a,
            AcquireResult::Acquired {
                image_index: 2,
                suboptimal: false
            }
        );
        assert_eq!(
            b,
            AcquireResult::Acquired {
                image_index: 1,
                suboptimal: false
            }
        );
    }

    #[test]
    fn test_resize_makes_swapchain_out_of_date() {
        let backend = HeadlessBackend::default();
        let swapchain = backend.create_swapchain(&desc(&backend, 3)).expect("swapchain");
        let semaphore = backend.create_semaphore().expect("semaphore");

        backend.set_drawable_extent(extent(800, 600));
        let result = backend
            .acquire_next_image(swapchain, 0, semaphore)
            .expect("acquire");
        assert_eq!(result, AcquireResult::OutOfDate);
    }

    #[test]
    fn test_double_signal_is_a_violation() {
        let backend = HeadlessBackend::default();
        let swapchain = backend.create_swapchain(&desc(&backend, 3)).expect("swapchain");
        let semaphore = backend.create_semaphore().expect("semaphore");

        backend
            .acquire_next_image(swapchain, 0, semaphore)
            .expect("first acquire");
        assert!(matches!(
            backend.acquire_next_image(swapchain, 0, semaphore),
            Err(RhiError::Validation(_))
        ));
    }

    #[test]
    fn test_destroying_swapchain_with_live_views_is_a_violation() {
        let backend = HeadlessBackend::default();
        let swapchain = backend.create_swapchain(&desc(&backend, 2)).expect("swapchain");
        let images = backend.swapchain_images(swapchain).expect("images");
        let view = backend
            .create_image_view(images[0], vk::Format::B8G8R8A8_SRGB)
            .expect("view");

        backend.destroy_swapchain(swapchain);
        assert_eq!(backend.validation_errors().len(), 1);

        backend.destroy_image_view(view);
        assert_eq!(backend.live_objects(), LiveObjects::default());
    }

    #[test]
    fn test_injected_device_loss() {
        let backend = HeadlessBackend::default();
        backend.inject_device_lost();
        assert!(matches!(backend.wait_idle(), Err(RhiError::DeviceLost)));
    }

    #[test]
    fn test_event_capacity_keeps_latest_entries() {
        let backend = HeadlessBackend::new(HeadlessConfig {
            event_capacity: Some(3),
            ..Default::default()
        });
        let semaphores: Vec<vk::Semaphore> = (0..5)
            .map(|_| backend.create_semaphore().expect("semaphore"))
            .collect();

        assert_eq!(
            backend.events(),
            semaphores[2..]
                .iter()
                .map(|&semaphore| HeadlessEvent::SemaphoreCreated { semaphore })
                .collect::<Vec<_>>()
        );
        assert_eq!(backend.live_objects().semaphores, 5);
    }
}
