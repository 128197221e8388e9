//! Image view wrapper.

use std::sync::Arc;

use ash::vk;
use tracing::trace;

use crate::backend::Backend;
use crate::error::RhiResult;

/// A 2D color view over a swapchain image.
///
/// The view is derived from an image it does not own. It must be dropped
/// before the swapchain that owns the image.
pub struct ImageView<B: Backend> {
    backend: Arc<B>,
    view: B::ImageView,
    image: B::Image,
    format: vk::Format,
}

impl<B: Backend> ImageView<B> {
    /// Creates a color view of `image` in `format`.
    ///
    /// # Errors
    ///
    /// Returns an error if view creation fails.
    pub fn new(backend: Arc<B>, image: B::Image, format: vk::Format) -> RhiResult<Self> {
        let view = backend.create_image_view(image, format)?;
        trace!("Created image view {:?} for {:?}", view, image);
        Ok(Self {
            backend,
            view,
            image,
            format,
        })
    }

    /// Creates one view per image, in order.
    ///
    /// Views created before a failure are destroyed again.
    pub fn for_images(
        backend: &Arc<B>,
        images: &[B::Image],
        format: vk::Format,
    ) -> RhiResult<Vec<Self>> {
        images
            .iter()
            .map(|&image| Self::new(backend.clone(), image, format))
            .collect()
    }

    #[inline]
    pub fn handle(&self) -> B::ImageView {
        self.view
    }

    #[inline]
    pub fn image(&self) -> B::Image {
        self.image
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl<B: Backend> Drop for ImageView<B> {
    fn drop(&mut self) {
        self.backend.destroy_image_view(self.view);
        trace!("Destroyed image view {:?}", self.view);
    }
}
