//! Presentation hardware interface.
//!
//! This crate abstracts the GPU operations the frame scheduler depends on
//! behind the [`Backend`] trait. It provides:
//! - Owning wrappers for fences, semaphores, command buffers and image views
//! - Swapchain configuration, acquisition and presentation
//! - A Vulkan backend built on `ash`
//! - A headless backend that simulates a GPU for tests and demos

mod error;

pub mod backend;
pub mod command;
pub mod headless;
pub mod image;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

pub use backend::{Backend, SubmitInfo, SwapchainDesc};
pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
