//! Swapchain management.
//!
//! This module handles swapchain configuration, image acquisition, and presentation.
//!
//! # Overview
//!
//! The [`Swapchain`] struct owns the presentable images of one surface
//! configuration. Creation resolves the caller's preferences against what the
//! surface supports:
//! - Image count: `max(requested, min)` clamped into the surface's range
//! - Format: the preferred format in sRGB non-linear space, else the first one offered
//! - Present mode: the preferred mode, else FIFO (always available)
//! - Extent: the surface's current extent, else the fallback clamped to the surface limits
//!
//! Image views are *not* owned here; whoever derives views must drop them
//! before the swapchain.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use inflight_rhi::Backend;
//! use inflight_rhi::headless::HeadlessBackend;
//! use inflight_rhi::swapchain::{Swapchain, SwapchainPreferences};
//! use inflight_rhi::sync::Semaphore;
//!
//! # fn example() -> Result<(), inflight_rhi::RhiError> {
//! let backend = Arc::new(HeadlessBackend::default());
//! let support = backend.surface_support()?;
//! let preferences = SwapchainPreferences::default();
//! let swapchain = Swapchain::new(
//!     backend.clone(),
//!     &support,
//!     &preferences,
//!     vk::Extent2D { width: 800, height: 600 },
//! )?;
//!
//! let image_available = Semaphore::new(backend.clone())?;
//! let result = swapchain.acquire_next_image(u64::MAX, &image_available)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use inflight_core::{FormatPreference, PresentModePreference, RendererConfig};

use crate::backend::{Backend, SwapchainDesc};
use crate::error::{RhiError, RhiResult};
use crate::sync::Semaphore;

/// Surface support details.
///
/// Contains information about what the surface supports for swapchain creation.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    /// Surface capabilities (min/max image count, extents, transforms, etc.)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats (format and color space combinations)
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes (FIFO, MAILBOX, IMMEDIATE, etc.)
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// Checks if the swapchain support is adequate for rendering.
    ///
    /// Returns true if at least one format and one present mode are available.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Caller preferences for swapchain creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPreferences {
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub min_image_count: u32,
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        Self {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            present_mode: vk::PresentModeKHR::MAILBOX,
            min_image_count: 3,
        }
    }
}

impl SwapchainPreferences {
    /// Builds preferences from the renderer configuration.
    pub fn from_config(config: &RendererConfig) -> Self {
        Self {
            format: format_from_preference(config.surface_format),
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            present_mode: present_mode_from_preference(config.present_mode),
            min_image_count: config.min_image_count,
        }
    }
}

/// Maps a configured format preference to its Vulkan format.
pub fn format_from_preference(preference: FormatPreference) -> vk::Format {
    match preference {
        FormatPreference::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        FormatPreference::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        FormatPreference::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        FormatPreference::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
    }
}

/// Maps a configured present mode preference to its Vulkan present mode.
pub fn present_mode_from_preference(preference: PresentModePreference) -> vk::PresentModeKHR {
    match preference {
        PresentModePreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentModePreference::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentModePreference::Fifo => vk::PresentModeKHR::FIFO,
        PresentModePreference::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

/// Outcome of an image acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    /// An image was acquired. `suboptimal` means it is usable but the
    /// configuration has drifted from the surface.
    Acquired { image_index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface and must be rebuilt.
    OutOfDate,
    /// No image became available within the timeout. Retry later.
    TimedOut,
}

/// Outcome of a presentation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    /// Presented, but the swapchain should be rebuilt when convenient.
    Suboptimal,
    /// Not presented; the swapchain must be rebuilt.
    OutOfDate,
}

/// Swapchain wrapper.
///
/// Owns the backend swapchain and the list of its images, which is fixed for
/// the lifetime of this object. Dropping it destroys the backend swapchain and
/// invalidates every image index handed out.
///
/// # Thread Safety
///
/// The swapchain is not meant to be shared. Only the thread driving the frame
/// loop should acquire and present.
pub struct Swapchain<B: Backend> {
    /// Backend that owns the swapchain handle
    backend: Arc<B>,
    /// Swapchain handle
    swapchain: B::Swapchain,
    /// Swapchain images (owned by the swapchain)
    images: Vec<B::Image>,
    /// Swapchain image format
    format: vk::Format,
    /// Swapchain color space
    color_space: vk::ColorSpaceKHR,
    /// Swapchain extent (resolution)
    extent: vk::Extent2D,
    /// Present mode
    present_mode: vk::PresentModeKHR,
}

impl<B: Backend> Swapchain<B> {
    /// Creates a new swapchain from the given surface support.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The surface offers no formats or no present modes
    /// - Swapchain creation fails
    /// - The backend reports zero images
    pub fn new(
        backend: Arc<B>,
        support: &SurfaceSupport,
        preferences: &SwapchainPreferences,
        fallback_extent: vk::Extent2D,
    ) -> RhiResult<Self> {
        if !support.is_adequate() {
            return Err(RhiError::Configuration(format!(
                "Inadequate surface support ({} formats, {} present modes)",
                support.formats.len(),
                support.present_modes.len()
            )));
        }

        let surface_format = choose_surface_format(
            &support.formats,
            preferences.format,
            preferences.color_space,
        )
        .ok_or_else(|| RhiError::Configuration("No surface formats".to_string()))?;
        let present_mode = choose_present_mode(&support.present_modes, preferences.present_mode);
        let extent = choose_extent(&support.capabilities, fallback_extent);
        let image_count = determine_image_count(&support.capabilities, preferences.min_image_count);

        info!(
            "Creating swapchain: {}x{}, format {:?}, color space {:?}, present mode {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            surface_format.color_space,
            present_mode,
            image_count
        );

        let desc = SwapchainDesc {
            surface_format,
            present_mode,
            extent,
            min_image_count: image_count,
            pre_transform: support.capabilities.current_transform,
        };
        let swapchain = backend.create_swapchain(&desc)?;

        let images = match backend.swapchain_images(swapchain) {
            Ok(images) if !images.is_empty() => images,
            Ok(_) => {
                backend.destroy_swapchain(swapchain);
                return Err(RhiError::SwapchainError(
                    "Swapchain created without images".to_string(),
                ));
            }
            Err(e) => {
                backend.destroy_swapchain(swapchain);
                return Err(e);
            }
        };
        info!("Swapchain created with {} images", images.len());

        Ok(Self {
            backend,
            swapchain,
            images,
            format: surface_format.format,
            color_space: surface_format.color_space,
            extent,
            present_mode,
        })
    }

    /// Acquires the next swapchain image for rendering.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout in nanoseconds (`u64::MAX` for infinite)
    /// * `signal` - Semaphore to signal when the image is available
    ///
    /// # Errors
    ///
    /// Out-of-date and timeout are reported through [`AcquireResult`]; only
    /// unrecoverable failures (device loss, ...) are errors.
    pub fn acquire_next_image(
        &self,
        timeout: u64,
        signal: &Semaphore<B>,
    ) -> RhiResult<AcquireResult> {
        self.backend
            .acquire_next_image(self.swapchain, timeout, signal.handle())
    }

    /// Presents `image_index` once `wait` has been signaled.
    ///
    /// # Errors
    ///
    /// Out-of-date and suboptimal are reported through [`PresentStatus`]; only
    /// unrecoverable failures are errors.
    pub fn present(&self, image_index: u32, wait: &Semaphore<B>) -> RhiResult<PresentStatus> {
        if image_index as usize >= self.images.len() {
            return Err(RhiError::InvalidHandle(format!(
                "image index {} out of range for {} swapchain images",
                image_index,
                self.images.len()
            )));
        }
        self.backend
            .present(self.swapchain, image_index, &[wait.handle()])
    }

    /// Returns the swapchain handle.
    #[inline]
    pub fn handle(&self) -> B::Swapchain {
        self.swapchain
    }

    /// Returns the swapchain image format.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Returns the swapchain color space.
    #[inline]
    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.color_space
    }

    /// Returns the swapchain extent (resolution).
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Returns the present mode.
    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Returns the number of swapchain images.
    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Returns the swapchain image at the given index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn image(&self, index: usize) -> B::Image {
        self.images[index]
    }

    /// Returns all swapchain images, in presentation order.
    #[inline]
    pub fn images(&self) -> &[B::Image] {
        &self.images
    }
}

impl<B: Backend> Drop for Swapchain<B> {
    fn drop(&mut self) {
        self.backend.destroy_swapchain(self.swapchain);
        info!(
            "Swapchain destroyed (was {}x{}, {} images)",
            self.extent.width,
            self.extent.height,
            self.images.len()
        );
    }
}

/// Chooses the surface format.
///
/// Prefers `preferred` in `color_space`; otherwise the first available format.
/// Returns `None` only if `formats` is empty.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::Format,
    color_space: vk::ColorSpaceKHR,
) -> Option<vk::SurfaceFormatKHR> {
    let found = formats
        .iter()
        .find(|f| f.format == preferred && f.color_space == color_space);

    if let Some(&format) = found {
        debug!("Selected preferred surface format: {:?} with {:?}", preferred, color_space);
        return Some(format);
    }

    let first = formats.first().copied()?;
    warn!(
        "Preferred format {:?} unavailable, using first available: {:?} with {:?}",
        preferred, first.format, first.color_space
    );
    Some(first)
}

/// Chooses the present mode.
///
/// Uses `preferred` if available, otherwise FIFO, which every surface supports.
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if present_modes.contains(&preferred) {
        debug!("Selected preferred present mode {:?}", preferred);
        return preferred;
    }

    debug!("Present mode {:?} unavailable, using FIFO", preferred);
    vk::PresentModeKHR::FIFO
}

/// Chooses the swapchain extent (resolution).
///
/// If the current extent is not set (width is `u32::MAX`), clamps the fallback
/// size to the surface's min/max extents.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    fallback: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        debug!(
            "Using current surface extent: {}x{}",
            capabilities.current_extent.width, capabilities.current_extent.height
        );
        return capabilities.current_extent;
    }

    let extent = vk::Extent2D {
        width: fallback.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: fallback.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    };

    debug!(
        "Calculated extent: {}x{} (requested: {}x{}, min: {}x{}, max: {}x{})",
        extent.width,
        extent.height,
        fallback.width,
        fallback.height,
        capabilities.min_image_extent.width,
        capabilities.min_image_extent.height,
        capabilities.max_image_extent.width,
        capabilities.max_image_extent.height
    );

    extent
}

/// Determines the number of swapchain images to request.
///
/// `max(requested, min)` clamped into `[min, max]`; a `max_image_count` of 0
/// means there is no upper limit.
pub fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let min = capabilities.min_image_count;
    let preferred = requested.max(min);

    let image_count = if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    };

    debug!(
        "Image count: {} (requested: {}, min: {}, max: {})",
        image_count,
        requested,
        min,
        if capabilities.max_image_count == 0 {
            "unlimited".to_string()
        } else {
            capabilities.max_image_count.to_string()
        }
    );

    image_count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn srgb(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_choose_surface_format_prefers_requested() {
        let formats = vec![
            srgb(vk::Format::R8G8B8A8_UNORM),
            srgb(vk::Format::B8G8R8A8_SRGB),
            srgb(vk::Format::B8G8R8A8_UNORM),
        ];

        let selected = choose_surface_format(
            &formats,
            vk::Format::B8G8R8A8_SRGB,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )
        .expect("non-empty");
        assert_eq!(selected.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(selected.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn test_choose_surface_format_falls_back_to_sole_entry() {
        let only = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };

        for _ in 0..3 {
            let selected = choose_surface_format(
                &[only],
                vk::Format::B8G8R8A8_SRGB,
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            );
            assert_eq!(selected, Some(only));
        }
    }

    #[test]
    fn test_choose_surface_format_requires_color_space_match() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT,
            },
            srgb(vk::Format::R8G8B8A8_SRGB),
        ];

        let selected = choose_surface_format(
            &formats,
            vk::Format::B8G8R8A8_SRGB,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )
        .expect("non-empty");
        assert_eq!(selected, formats[0]);
    }

    #[test]
    fn test_choose_surface_format_empty() {
        assert!(
            choose_surface_format(
                &[],
                vk::Format::B8G8R8A8_SRGB,
                vk::ColorSpaceKHR::SRGB_NONLINEAR
            )
            .is_none()
        );
    }

    #[test]
    fn test_choose_present_mode_prefers_requested() {
        let modes = vec![
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];

        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn test_choose_present_mode_fallback_to_fifo() {
        let modes = vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];

        let selected = choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX);
        assert_eq!(selected, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_choose_extent_uses_current() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        };

        let extent = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        );
        assert_eq!(extent.width, 1920);
        assert_eq!(extent.height, 1080);
    }

    #[test]
    fn test_choose_extent_clamps_to_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 2000,
                height: 2000,
            },
            ..Default::default()
        };

        let extent = choose_extent(&capabilities, vk::Extent2D { width: 3000, height: 50 });
        assert_eq!(extent.width, 2000);
        assert_eq!(extent.height, 100);

        let extent = choose_extent(&capabilities, vk::Extent2D { width: 800, height: 600 });
        assert_eq!(extent.width, 800);
        assert_eq!(extent.height, 600);
    }

    #[test]
    fn test_determine_image_count() {
        // Clamped by max
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 1,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capabilities, 3), 2);

        // Raised to the surface minimum
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 4,
            max_image_count: 8,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capabilities, 3), 4);

        // No max limit
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capabilities, 3), 3);
    }

    #[test]
    fn test_surface_support_is_adequate() {
        let adequate = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(adequate.is_adequate());

        let no_formats = SurfaceSupport {
            formats: vec![],
            ..adequate.clone()
        };
        assert!(!no_formats.is_adequate());

        let no_modes = SurfaceSupport {
            present_modes: vec![],
            ..adequate
        };
        assert!(!no_modes.is_adequate());
    }

    #[test]
    fn test_preferences_from_config() {
        let config = RendererConfig {
            surface_format: FormatPreference::Rgba8Unorm,
            present_mode: PresentModePreference::Immediate,
            min_image_count: 2,
            ..Default::default()
        };
        let prefs = SwapchainPreferences::from_config(&config);
        assert_eq!(prefs.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(prefs.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert_eq!(prefs.present_mode, vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(prefs.min_image_count, 2);
    }

    fn rejects(support: &SurfaceSupport) {
        let backend = Arc::new(crate::headless::HeadlessBackend::default());
        let result = Swapchain::new(
            backend.clone(),
            support,
            &SwapchainPreferences::default(),
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        );
        assert!(matches!(result, Err(RhiError::Configuration(_))));
        assert_eq!(backend.live_objects().swapchains, 0);
        assert_eq!(backend.live_objects().image_views, 0);
    }

    #[test]
    fn test_new_rejects_surface_without_formats() {
        let backend = crate::headless::HeadlessBackend::default();
        let mut support = backend.surface_support().expect("support");
        support.formats.clear();
        rejects(&support);
    }

    #[test]
    fn test_new_rejects_surface_without_present_modes() {
        let backend = crate::headless::HeadlessBackend::default();
        let mut support = backend.surface_support().expect("support");
        support.present_modes.clear();
        rejects(&support);
    }
}
