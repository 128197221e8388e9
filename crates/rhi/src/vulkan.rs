//! Vulkan backend.
//!
//! [`VulkanBackend`] implements [`Backend`] on top of `ash`. It does not create
//! the instance, device or surface; the host builds those (usually together
//! with its window) and hands them over in a [`VulkanContext`]. The backend
//! owns only what the presentation core allocates: a resettable command pool
//! and the loaders for the surface and swapchain extensions.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use inflight_rhi::vulkan::{VulkanBackend, VulkanContext};
//!
//! # fn example(context: VulkanContext) -> Result<(), inflight_rhi::RhiError> {
//! let backend = Arc::new(VulkanBackend::new(context, || vk::Extent2D {
//!     width: 1280,
//!     height: 720,
//! })?);
//! # Ok(())
//! # }
//! ```

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::backend::{Backend, SubmitInfo, SwapchainDesc};
use crate::error::{RhiError, RhiResult};
use crate::swapchain::{AcquireResult, PresentStatus, SurfaceSupport};

/// Host-created Vulkan objects the backend operates on.
///
/// The backend borrows these; the host must keep them alive until the backend
/// and everything created from it has been dropped.
#[derive(Clone)]
pub struct VulkanContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub surface: vk::SurfaceKHR,
    pub graphics_queue: vk::Queue,
    pub graphics_family: u32,
    pub present_queue: vk::Queue,
    pub present_family: u32,
}

type DrawableExtentFn = dyn Fn() -> vk::Extent2D + Send + Sync;

/// [`Backend`] implementation for a real Vulkan device.
pub struct VulkanBackend {
    context: VulkanContext,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    /// Command pools require external synchronization.
    command_pool: Mutex<vk::CommandPool>,
    /// Serializes queue submission and presentation.
    queue_lock: Mutex<()>,
    drawable_extent: Box<DrawableExtentFn>,
}

impl VulkanBackend {
    /// Creates the backend and its command pool on the graphics family.
    ///
    /// `drawable_extent` reports the window's current framebuffer size in
    /// pixels (zero while minimized).
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new<F>(context: VulkanContext, drawable_extent: F) -> RhiResult<Self>
    where
        F: Fn() -> vk::Extent2D + Send + Sync + 'static,
    {
        let surface_loader = ash::khr::surface::Instance::new(&context.entry, &context.instance);
        let swapchain_loader = ash::khr::swapchain::Device::new(&context.instance, &context.device);

        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(context.graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { context.device.create_command_pool(&create_info, None)? };

        info!(
            "Vulkan backend created (graphics family {}, present family {})",
            context.graphics_family, context.present_family
        );

        Ok(Self {
            context,
            surface_loader,
            swapchain_loader,
            command_pool: Mutex::new(command_pool),
            queue_lock: Mutex::new(()),
            drawable_extent: Box::new(drawable_extent),
        })
    }

    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.context.device
    }

    #[inline]
    pub fn context(&self) -> &VulkanContext {
        &self.context
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.context.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
            self.context
                .device
                .destroy_command_pool(*self.command_pool.get_mut(), None);
        }
        info!("Vulkan backend destroyed");
    }
}

/// Maps the outcome of `vkAcquireNextImageKHR` onto [`AcquireResult`].
pub fn acquire_result_from_vk(result: Result<(u32, bool), vk::Result>) -> RhiResult<AcquireResult> {
    match result {
        Ok((image_index, suboptimal)) => Ok(AcquireResult::Acquired {
            image_index,
            suboptimal,
        }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
        Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(AcquireResult::TimedOut),
        Err(e) => Err(e.into()),
    }
}

/// Maps the outcome of `vkQueuePresentKHR` onto [`PresentStatus`].
pub fn present_status_from_vk(result: Result<bool, vk::Result>) -> RhiResult<PresentStatus> {
    match result {
        Ok(false) => Ok(PresentStatus::Optimal),
        Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => Ok(PresentStatus::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
        Err(e) => Err(e.into()),
    }
}

impl Backend for VulkanBackend {
    type Fence = vk::Fence;
    type Semaphore = vk::Semaphore;
    type CommandBuffer = vk::CommandBuffer;
    type Swapchain = vk::SwapchainKHR;
    type Image = vk::Image;
    type ImageView = vk::ImageView;

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.context.device.create_fence(&create_info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.context.device.destroy_fence(fence, None) };
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: u64) -> RhiResult<()> {
        unsafe { self.context.device.wait_for_fences(fences, true, timeout)? };
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        unsafe { self.context.device.reset_fences(fences)? };
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        Ok(unsafe { self.context.device.get_fence_status(fence)? })
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.context.device.create_semaphore(&create_info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.context.device.destroy_semaphore(semaphore, None) };
    }

    fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer> {
        let pool = self.command_pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.context.device.allocate_command_buffers(&alloc_info)? };
        buffers.into_iter().next().ok_or_else(|| {
            RhiError::InvalidHandle("command buffer allocation returned nothing".to_string())
        })
    }

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        let pool = self.command_pool.lock();
        unsafe {
            self.context
                .device
                .free_command_buffers(*pool, &[command_buffer])
        };
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let _pool = self.command_pool.lock();
        unsafe {
            self.context
                .device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
        }
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let _pool = self.command_pool.lock();
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.context
                .device
                .begin_command_buffer(command_buffer, &begin_info)?;
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let _pool = self.command_pool.lock();
        unsafe { self.context.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn surface_support(&self) -> RhiResult<SurfaceSupport> {
        let physical_device = self.context.physical_device;
        let surface = self.context.surface;
        let (capabilities, formats, present_modes) = unsafe {
            (
                self.surface_loader
                    .get_physical_device_surface_capabilities(physical_device, surface)?,
                self.surface_loader
                    .get_physical_device_surface_formats(physical_device, surface)?,
                self.surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            )
        };

        debug!(
            "Surface support: {} formats, {} present modes",
            formats.len(),
            present_modes.len()
        );

        Ok(SurfaceSupport {
            capabilities,
            formats,
            present_modes,
        })
    }

    fn drawable_extent(&self) -> vk::Extent2D {
        (self.drawable_extent)()
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RhiResult<vk::SwapchainKHR> {
        let graphics_family = self.context.graphics_family;
        let present_family = self.context.present_family;
        let queue_family_indices = [graphics_family, present_family];

        let (sharing_mode, queue_family_indices_slice) = if graphics_family != present_family {
            debug!(
                "Using CONCURRENT sharing mode between graphics ({}) and present ({}) queues",
                graphics_family, present_family
            );
            (vk::SharingMode::CONCURRENT, queue_family_indices.as_slice())
        } else {
            (vk::SharingMode::EXCLUSIVE, &[][..])
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.context.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.surface_format.format)
            .image_color_space(desc.surface_format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(queue_family_indices_slice)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true);

        Ok(unsafe { self.swapchain_loader.create_swapchain(&create_info, None)? })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>> {
        Ok(unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? })
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> RhiResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(color_subresource_range());

        unsafe {
            self.context
                .device
                .create_image_view(&create_info, None)
                .map_err(|e| {
                    RhiError::SwapchainError(format!("Failed to create image view: {:?}", e))
                })
        }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.context.device.destroy_image_view(view, None) };
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> RhiResult<AcquireResult> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, signal, vk::Fence::null())
        };
        acquire_result_from_vk(result)
    }

    fn submit(&self, info: &SubmitInfo<'_, Self>) -> RhiResult<()> {
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(info.wait_semaphores)
            .wait_dst_stage_mask(info.wait_stages)
            .command_buffers(info.command_buffers)
            .signal_semaphores(info.signal_semaphores);

        let _queue = self.queue_lock.lock();
        unsafe {
            self.context.device.queue_submit(
                self.context.graphics_queue,
                &[submit_info],
                info.fence.unwrap_or(vk::Fence::null()),
            )?;
        }
        Ok(())
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: &[vk::Semaphore],
    ) -> RhiResult<PresentStatus> {
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let _queue = self.queue_lock.lock();
        let result = unsafe {
            self.swapchain_loader
                .queue_present(self.context.present_queue, &present_info)
        };
        present_status_from_vk(result)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let _queue = self.queue_lock.lock();
        unsafe { self.context.device.device_wait_idle()? };
        Ok(())
    }
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

/// Records a full-image clear of a swapchain image.
///
/// Transitions `image` from `UNDEFINED` to `TRANSFER_DST_OPTIMAL`, clears it to
/// `color`, and leaves it in `PRESENT_SRC_KHR`. The command buffer must be in
/// the recording state.
pub fn record_clear(
    backend: &VulkanBackend,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    color: [f32; 4],
) {
    let device = backend.device();
    let range = color_subresource_range();

    let to_transfer = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range);

    let to_present = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range);

    let clear_value = vk::ClearColorValue { float32: color };

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );
        device.cmd_clear_color_image(
            command_buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear_value,
            &[range],
        );
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_present],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vulkan_backend_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VulkanBackend>();
    }

    #[test]
    fn test_acquire_result_mapping() {
        assert_eq!(
            acquire_result_from_vk(Ok((2, false))).expect("ok"),
            AcquireResult::Acquired {
                image_index: 2,
                suboptimal: false
            }
        );
        assert_eq!(
            acquire_result_from_vk(Ok((0, true))).expect("ok"),
            AcquireResult::Acquired {
                image_index: 0,
                suboptimal: true
            }
        );
        assert_eq!(
            acquire_result_from_vk(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).expect("ok"),
            AcquireResult::OutOfDate
        );
        assert_eq!(
            acquire_result_from_vk(Err(vk::Result::TIMEOUT)).expect("ok"),
            AcquireResult::TimedOut
        );
        assert_eq!(
            acquire_result_from_vk(Err(vk::Result::NOT_READY)).expect("ok"),
            AcquireResult::TimedOut
        );
        assert!(matches!(
            acquire_result_from_vk(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(RhiError::DeviceLost)
        ));
        assert!(matches!(
            acquire_result_from_vk(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            Err(RhiError::VulkanError(vk::Result::ERROR_SURFACE_LOST_KHR))
        ));
    }

    #[test]
    fn test_present_status_mapping() {
        assert_eq!(
            present_status_from_vk(Ok(false)).expect("ok"),
            PresentStatus::Optimal
        );
        assert_eq!(
            present_status_from_vk(Ok(true)).expect("ok"),
            PresentStatus::Suboptimal
        );
        assert_eq!(
            present_status_from_vk(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).expect("ok"),
            PresentStatus::OutOfDate
        );
        assert!(matches!(
            present_status_from_vk(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(RhiError::DeviceLost)
        ));
    }

    #[test]
    fn test_color_subresource_range() {
        let range = color_subresource_range();
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(range.level_count, 1);
        assert_eq!(range.layer_count, 1);
    }
}
