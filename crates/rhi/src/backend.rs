//! Backend capability interface.
//!
//! The frame scheduler never talks to a graphics API directly. Everything it
//! needs (fences, semaphores, command recording, surface queries, swapchain
//! creation, acquisition, submission and presentation) goes through the
//! [`Backend`] trait. Two implementations ship with this crate:
//!
//! - [`VulkanBackend`](crate::vulkan::VulkanBackend) drives a real device via `ash`
//! - [`HeadlessBackend`](crate::headless::HeadlessBackend) simulates a GPU in-process
//!
//! Handles are plain `Copy` values. Ownership and destruction order are managed
//! by the RAII wrappers in [`sync`](crate::sync), [`command`](crate::command),
//! [`image`](crate::image) and [`swapchain`](crate::swapchain), which call the
//! `destroy_*` methods from their `Drop` impls.

use std::fmt::Debug;
use std::hash::Hash;

use ash::vk;

use crate::error::RhiResult;
use crate::swapchain::{AcquireResult, PresentStatus, SurfaceSupport};

/// Marker bounds shared by every backend handle type.
pub trait Handle: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Handle for T where T: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

/// Parameters for swapchain creation, already resolved against surface support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

/// A single queue submission.
///
/// `wait_stages` must have one entry per wait semaphore.
pub struct SubmitInfo<'a, B: Backend> {
    pub command_buffers: &'a [B::CommandBuffer],
    pub wait_semaphores: &'a [B::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [B::Semaphore],
    /// Fence signaled once every command buffer has completed.
    pub fence: Option<B::Fence>,
}

/// Device, queue and surface capabilities consumed by the presentation core.
///
/// Methods take `&self`; implementations use interior mutability where the
/// underlying API requires external synchronization.
pub trait Backend: Sized + Send + Sync + 'static {
    type Fence: Handle;
    type Semaphore: Handle;
    type CommandBuffer: Handle;
    type Swapchain: Handle;
    type Image: Handle;
    type ImageView: Handle;

    /// Creates a fence, optionally already signaled.
    fn create_fence(&self, signaled: bool) -> RhiResult<Self::Fence>;
    fn destroy_fence(&self, fence: Self::Fence);
    /// Blocks until every fence is signaled.
    ///
    /// Returns [`RhiError::Timeout`](crate::RhiError::Timeout) if `timeout`
    /// nanoseconds pass first. `u64::MAX` waits forever.
    fn wait_for_fences(&self, fences: &[Self::Fence], timeout: u64) -> RhiResult<()>;
    fn reset_fences(&self, fences: &[Self::Fence]) -> RhiResult<()>;
    /// Non-blocking signaled check.
    fn fence_status(&self, fence: Self::Fence) -> RhiResult<bool>;

    fn create_semaphore(&self) -> RhiResult<Self::Semaphore>;
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);

    fn allocate_command_buffer(&self) -> RhiResult<Self::CommandBuffer>;
    fn free_command_buffer(&self, command_buffer: Self::CommandBuffer);
    fn reset_command_buffer(&self, command_buffer: Self::CommandBuffer) -> RhiResult<()>;
    fn begin_command_buffer(&self, command_buffer: Self::CommandBuffer) -> RhiResult<()>;
    fn end_command_buffer(&self, command_buffer: Self::CommandBuffer) -> RhiResult<()>;

    /// Current surface capabilities, formats and present modes.
    fn surface_support(&self) -> RhiResult<SurfaceSupport>;
    /// Drawable size as reported by the host window system.
    ///
    /// A zero component means the surface cannot be rendered to (e.g. minimized).
    fn drawable_extent(&self) -> vk::Extent2D;

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<Self::Swapchain>;
    fn destroy_swapchain(&self, swapchain: Self::Swapchain);
    /// Presentable images in presentation order.
    fn swapchain_images(&self, swapchain: Self::Swapchain) -> RhiResult<Vec<Self::Image>>;
    fn create_image_view(&self, image: Self::Image, format: vk::Format)
    -> RhiResult<Self::ImageView>;
    fn destroy_image_view(&self, view: Self::ImageView);

    /// Requests the next presentable image, signaling `signal` once it is usable.
    fn acquire_next_image(
        &self,
        swapchain: Self::Swapchain,
        timeout: u64,
        signal: Self::Semaphore,
    ) -> RhiResult<AcquireResult>;

    fn submit(&self, info: &SubmitInfo<'_, Self>) -> RhiResult<()>;

    /// Queues `image_index` for presentation after every `wait` semaphore.
    fn present(
        &self,
        swapchain: Self::Swapchain,
        image_index: u32,
        wait: &[Self::Semaphore],
    ) -> RhiResult<PresentStatus>;

    /// Blocks until all queues are idle.
    fn wait_idle(&self) -> RhiResult<()>;
}
