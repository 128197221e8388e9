//! Per-frame resources and command recording hooks.
//!
//! A [`FrameSlot`] is one of the N sets of host-side frame resources that
//! rotate independently of the swapchain images. Its fence is the only thing
//! the scheduler blocks on before reusing the slot's command buffer.
//!
//! Rendering itself is delegated to a [`FrameRecorder`], which is handed the
//! slot's command buffer (already reset and begun) and the [`RenderTarget`]
//! describing the acquired image.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use inflight_rhi::command::CommandBuffer;
use inflight_rhi::sync::Fence;
use inflight_rhi::vulkan::{VulkanBackend, record_clear};
use inflight_rhi::{Backend, RhiResult};

/// Host-side resources for one frame in flight.
///
/// # Synchronization Flow
///
/// ```text
/// 1. Wait on fence (previous submission from this slot has completed)
/// 2. Acquire swapchain image
/// 3. Reset fence, reset + begin command buffer, record, end
/// 4. Submit command buffer, signaling the fence
/// 5. Present
/// ```
pub struct FrameSlot<B: Backend> {
    index: usize,
    /// Created signaled so the first wait on a fresh slot returns at once.
    fence: Fence<B>,
    command_buffer: CommandBuffer<B>,
}

impl<B: Backend> FrameSlot<B> {
    /// Creates slot `index` with a signaled fence and a fresh command buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if any resource creation fails.
    pub fn new(backend: Arc<B>, index: usize) -> RhiResult<Self> {
        let command_buffer = CommandBuffer::new(backend.clone())?;
        let fence = Fence::new(backend, true)?;
        debug!("Created frame slot {}", index);
        Ok(Self {
            index,
            fence,
            command_buffer,
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn fence(&self) -> &Fence<B> {
        &self.fence
    }

    #[inline]
    pub fn command_buffer(&self) -> &CommandBuffer<B> {
        &self.command_buffer
    }
}

/// The acquired image a frame renders into.
pub struct RenderTarget<B: Backend> {
    /// Index of the image within the current swapchain.
    pub image_index: u32,
    pub image: B::Image,
    pub view: B::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    /// Frame slot whose command buffer is being recorded.
    pub slot_index: usize,
    /// Number of frames presented before this one.
    pub frame_number: u64,
}

impl<B: Backend> fmt::Debug for RenderTarget<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTarget")
            .field("image_index", &self.image_index)
            .field("image", &self.image)
            .field("view", &self.view)
            .field("extent", &self.extent)
            .field("format", &self.format)
            .field("slot_index", &self.slot_index)
            .field("frame_number", &self.frame_number)
            .finish()
    }
}

/// Records the commands of one frame.
///
/// Called with the command buffer in the recording state; the scheduler ends
/// it afterwards. An error aborts the frame and is returned from `tick`.
pub trait FrameRecorder<B: Backend> {
    fn record(
        &mut self,
        backend: &B,
        command_buffer: B::CommandBuffer,
        target: &RenderTarget<B>,
    ) -> RhiResult<()>;
}

impl<B, F> FrameRecorder<B> for F
where
    B: Backend,
    F: FnMut(&B, B::CommandBuffer, &RenderTarget<B>) -> RhiResult<()>,
{
    fn record(
        &mut self,
        backend: &B,
        command_buffer: B::CommandBuffer,
        target: &RenderTarget<B>,
    ) -> RhiResult<()> {
        self(backend, command_buffer, target)
    }
}

/// Records nothing. The submission still orders acquire and present.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl<B: Backend> FrameRecorder<B> for NoopRecorder {
    fn record(&mut self, _: &B, _: B::CommandBuffer, _: &RenderTarget<B>) -> RhiResult<()> {
        Ok(())
    }
}

/// Clears every frame to a solid color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearColor {
    pub color: [f32; 4],
}

impl Default for ClearColor {
    fn default() -> Self {
        Self {
            color: [0.1, 0.1, 0.1, 1.0],
        }
    }
}

impl FrameRecorder<VulkanBackend> for ClearColor {
    fn record(
        &mut self,
        backend: &VulkanBackend,
        command_buffer: vk::CommandBuffer,
        target: &RenderTarget<VulkanBackend>,
    ) -> RhiResult<()> {
        record_clear(backend, command_buffer, target.image, self.color);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflight_rhi::headless::{HeadlessBackend, HeadlessEvent};

    #[test]
    fn test_frame_slot_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<FrameSlot<HeadlessBackend>>();
    }

    #[test]
    fn test_new_slot_fence_is_signaled() {
        let backend = Arc::new(HeadlessBackend::default());
        let slot = FrameSlot::new(backend.clone(), 1).expect("slot");
        assert_eq!(slot.index(), 1);
        assert!(slot.fence().is_signaled());
        assert!(backend.events().contains(&HeadlessEvent::FenceCreated {
            fence: slot.fence().handle(),
            signaled: true,
        }));
    }

    #[test]
    fn test_noop_recorder_succeeds() {
        let backend = HeadlessBackend::default();
        let target = RenderTarget::<HeadlessBackend> {
            image_index: 0,
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            format: vk::Format::B8G8R8A8_SRGB,
            slot_index: 0,
            frame_number: 0,
        };
        let mut recorder = NoopRecorder;
        recorder
            .record(&backend, vk::CommandBuffer::null(), &target)
            .expect("noop");
        assert!(format!("{:?}", target).contains("RenderTarget"));
    }
}
