//! Configuration loaded from TOML.
//!
//! Every field has a default so a partial (or missing) file is valid. Values
//! are validated with [`RendererConfig::validate`] before use.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Upper bound on frames in flight accepted by [`RendererConfig::validate`].
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

/// Preferred surface format. Always paired with the sRGB non-linear color space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatPreference {
    #[default]
    Bgra8Srgb,
    Rgba8Srgb,
    Bgra8Unorm,
    Rgba8Unorm,
}

/// Preferred presentation mode. FIFO is used when the preference is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePreference {
    Immediate,
    #[default]
    Mailbox,
    Fifo,
    FifoRelaxed,
}

/// Frame scheduling and swapchain settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Number of frame slots (CPU frames allowed ahead of the GPU).
    pub frames_in_flight: usize,
    /// Requested minimum swapchain image count before clamping to the surface.
    pub min_image_count: u32,
    pub surface_format: FormatPreference,
    pub present_mode: PresentModePreference,
    /// Image acquisition timeout; `None` waits forever.
    pub acquire_timeout_ms: Option<u64>,
    /// Frame slot fence timeout; `None` waits forever.
    pub fence_timeout_ms: Option<u64>,
    /// Sleep between drawable extent polls while the surface is zero-sized.
    pub extent_poll_interval_ms: u64,
    /// Give up on a zero-sized surface after this long; `None` waits until cancelled.
    pub max_extent_wait_ms: Option<u64>,
    /// Out-of-date acquisitions tolerated within a single frame.
    pub max_consecutive_rebuilds: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            min_image_count: 3,
            surface_format: FormatPreference::default(),
            present_mode: PresentModePreference::default(),
            acquire_timeout_ms: None,
            fence_timeout_ms: None,
            extent_poll_interval_ms: 10,
            max_extent_wait_ms: None,
            max_consecutive_rebuilds: 4,
        }
    }
}

impl RendererConfig {
    /// Checks that every value is usable by the scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(Error::Config(format!(
                "frames_in_flight must be in 1..={}, got {}",
                MAX_FRAMES_IN_FLIGHT, self.frames_in_flight
            )));
        }
        if self.min_image_count == 0 {
            return Err(Error::Config("min_image_count must be at least 1".to_string()));
        }
        if self.extent_poll_interval_ms == 0 {
            return Err(Error::Config(
                "extent_poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.max_consecutive_rebuilds == 0 {
            return Err(Error::Config(
                "max_consecutive_rebuilds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Acquisition timeout in nanoseconds (`u64::MAX` = infinite).
    pub fn acquire_timeout_ns(&self) -> u64 {
        millis_to_timeout_ns(self.acquire_timeout_ms)
    }

    /// Fence wait timeout in nanoseconds (`u64::MAX` = infinite).
    pub fn fence_timeout_ns(&self) -> u64 {
        millis_to_timeout_ns(self.fence_timeout_ms)
    }

    pub fn extent_poll_interval(&self) -> Duration {
        Duration::from_millis(self.extent_poll_interval_ms)
    }

    pub fn max_extent_wait(&self) -> Option<Duration> {
        self.max_extent_wait_ms.map(Duration::from_millis)
    }
}

fn millis_to_timeout_ns(ms: Option<u64>) -> u64 {
    match ms {
        Some(ms) => ms.saturating_mul(1_000_000),
        None => u64::MAX,
    }
}

/// Parses a TOML document into `T`.
pub fn from_toml_str<T: DeserializeOwned>(content: &str) -> Result<T> {
    Ok(toml::from_str(content)?)
}

/// Loads and parses a TOML file.
pub fn load_toml<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let value = from_toml_str(&content)?;
    info!("Loaded configuration from {:?}", path);
    Ok(value)
}

/// Loads a TOML file, falling back to `T::default()` if it is missing or invalid.
pub fn load_or_default<T, P>(path: P) -> T
where
    T: DeserializeOwned + Default + std::fmt::Debug,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.exists() {
        info!("Config file not found at {:?}, using defaults", path);
        return T::default();
    }

    match load_toml(path) {
        Ok(config) => {
            debug!("Config: {:?}", config);
            config
        }
        Err(e) => {
            warn!("Failed to load {:?}: {}. Using defaults.", path, e);
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.min_image_count, 3);
        assert_eq!(config.acquire_timeout_ns(), u64::MAX);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RendererConfig = from_toml_str(
            r#"
            frames_in_flight = 3
            present_mode = "fifo_relaxed"
            acquire_timeout_ms = 250
            "#,
        )
        .expect("valid toml");

        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.present_mode, PresentModePreference::FifoRelaxed);
        assert_eq!(config.surface_format, FormatPreference::Bgra8Srgb);
        assert_eq!(config.acquire_timeout_ns(), 250_000_000);
        assert_eq!(config.fence_timeout_ns(), u64::MAX);
    }

    #[test]
    fn test_unknown_present_mode_rejected() {
        let result: Result<RendererConfig> = from_toml_str(r#"present_mode = "vsync""#);
        assert!(matches!(result, Err(Error::Toml(_))));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = RendererConfig {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RendererConfig {
            frames_in_flight: MAX_FRAMES_IN_FLIGHT + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RendererConfig {
            min_image_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RendererConfig {
            extent_poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config: RendererConfig = load_or_default("definitely/not/here.toml");
        assert_eq!(config, RendererConfig::default());
    }

    #[test]
    fn test_load_toml_reads_file() {
        let path = std::env::temp_dir().join(format!("inflight-config-{}.toml", std::process::id()));
        std::fs::write(&path, "min_image_count = 2\nmax_extent_wait_ms = 1500\n").expect("write");

        let config: RendererConfig = load_toml(&path).expect("load");
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.min_image_count, 2);
        assert_eq!(config.max_extent_wait(), Some(Duration::from_millis(1500)));
    }
}
