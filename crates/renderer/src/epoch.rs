//! Swapchain epochs.
//!
//! An [`Epoch`] bundles everything whose lifetime is tied to one swapchain
//! configuration: the swapchain, one view per image and one [`ImageSync`]
//! pair per image. A rebuild drops the whole epoch and creates a new one.
//!
//! Fields drop in declaration order, which is also the required teardown
//! order: sync pairs, then image views, then the swapchain that owns the
//! images.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use inflight_rhi::image::ImageView;
use inflight_rhi::swapchain::{Swapchain, SwapchainPreferences};
use inflight_rhi::sync::ImageSync;
use inflight_rhi::{Backend, RhiResult};

pub struct Epoch<B: Backend> {
    image_syncs: Vec<ImageSync<B>>,
    image_views: Vec<ImageView<B>>,
    swapchain: Swapchain<B>,
    generation: u64,
}

impl<B: Backend> Epoch<B> {
    /// Creates a swapchain for the surface's current capabilities, plus a view
    /// and a fresh semaphore pair for each of its images.
    ///
    /// `fallback_extent` is used when the surface leaves the extent to the
    /// caller.
    ///
    /// # Errors
    ///
    /// Returns an error if any object cannot be created. Objects created
    /// before the failure are destroyed again.
    pub fn new(
        backend: Arc<B>,
        preferences: &SwapchainPreferences,
        fallback_extent: vk::Extent2D,
        generation: u64,
    ) -> RhiResult<Self> {
        let support = backend.surface_support()?;
        let swapchain = Swapchain::new(backend.clone(), &support, preferences, fallback_extent)?;
        let image_views = ImageView::for_images(&backend, swapchain.images(), swapchain.format())?;
        let image_syncs = (0..swapchain.image_count())
            .map(|_| ImageSync::new(backend.clone()))
            .collect::<RhiResult<Vec<_>>>()?;

        info!(
            "Epoch {} created: {}x{}, {} images",
            generation,
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.image_count()
        );

        Ok(Self {
            image_syncs,
            image_views,
            swapchain,
            generation,
        })
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn swapchain(&self) -> &Swapchain<B> {
        &self.swapchain
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.image_syncs.len()
    }

    #[inline]
    pub fn image_sync(&self, index: usize) -> &ImageSync<B> {
        &self.image_syncs[index]
    }

    #[inline]
    pub fn image_view(&self, index: usize) -> &ImageView<B> {
        &self.image_views[index]
    }
}

impl<B: Backend> Drop for Epoch<B> {
    fn drop(&mut self) {
        debug!("Tearing down epoch {}", self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflight_rhi::headless::{HeadlessBackend, HeadlessEvent, LiveObjects};

    fn extent() -> vk::Extent2D {
        vk::Extent2D {
            width: 1280,
            height: 720,
        }
    }

    #[test]
    fn test_epoch_objects_match_image_count() {
        let backend = Arc::new(HeadlessBackend::default());
        let epoch = Epoch::new(backend.clone(), &SwapchainPreferences::default(), extent(), 1)
            .expect("epoch");

        assert_eq!(epoch.generation(), 1);
        assert_eq!(epoch.image_count(), 3);
        assert_eq!(epoch.swapchain().image_count(), 3);
        for i in 0..epoch.image_count() {
            assert_eq!(epoch.image_view(i).image(), epoch.swapchain().image(i));
        }
        assert_eq!(
            backend.live_objects(),
            LiveObjects {
                semaphores: 6,
                swapchains: 1,
                image_views: 3,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_epoch_drop_order() {
        let backend = Arc::new(HeadlessBackend::default());
        let epoch = Epoch::new(backend.clone(), &SwapchainPreferences::default(), extent(), 1)
            .expect("epoch");
        backend.clear_events();
        drop(epoch);

        let teardown: Vec<u8> = backend
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HeadlessEvent::SemaphoreDestroyed { .. } => Some(0),
                HeadlessEvent::ImageViewDestroyed { .. } => Some(1),
                HeadlessEvent::SwapchainDestroyed { .. } => Some(2),
                _ => None,
            })
            .collect();

        assert_eq!(teardown, vec![0, 0, 0, 0, 0, 0, 1, 1, 1, 2]);
        assert!(backend.validation_errors().is_empty());
        assert_eq!(backend.live_objects(), LiveObjects::default());
    }
}
