//! RHI-specific error types.

use std::time::Duration;

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error not covered by a dedicated variant
    #[error("Vulkan error: {0}")]
    VulkanError(vk::Result),

    /// The logical device was lost
    #[error("Device lost")]
    DeviceLost,

    /// A bounded wait expired before the object was signaled
    #[error("Wait timed out")]
    Timeout,

    /// The surface cannot be configured (no formats, no present modes, bad settings)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// The drawable extent stayed zero for longer than allowed
    #[error("Drawable extent stayed zero for {waited:?}")]
    DegenerateExtent {
        /// How long the extent was polled before giving up.
        waited: Duration,
    },

    /// The host cancelled a blocking operation
    #[error("Operation cancelled by host")]
    Cancelled,

    /// A backend detected misuse of the synchronization contract
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
}

impl From<vk::Result> for RhiError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
            vk::Result::TIMEOUT => RhiError::Timeout,
            other => RhiError::VulkanError(other),
        }
    }
}

impl From<inflight_core::Error> for RhiError {
    fn from(error: inflight_core::Error) -> Self {
        RhiError::Configuration(error.to_string())
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_result_mapping() {
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_DEVICE_LOST),
            RhiError::DeviceLost
        ));
        assert!(matches!(
            RhiError::from(vk::Result::TIMEOUT),
            RhiError::Timeout
        ));
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            RhiError::VulkanError(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
    }

    #[test]
    fn test_core_error_becomes_configuration() {
        let err: RhiError = inflight_core::Error::Config("bad".to_string()).into();
        assert!(matches!(err, RhiError::Configuration(_)));
    }
}
