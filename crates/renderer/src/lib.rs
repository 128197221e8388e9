//! Frame scheduling on top of the presentation interface.
//!
//! This crate drives the render loop:
//! - Frame slots bounding how far the CPU runs ahead of the GPU
//! - Swapchain epochs with per-image synchronization
//! - Rebuilds on out-of-date, suboptimal and resized surfaces

pub mod epoch;
pub mod frame;
pub mod scheduler;

pub use epoch::Epoch;
pub use frame::{ClearColor, FrameRecorder, FrameSlot, NoopRecorder, RenderTarget};
pub use inflight_core::config::MAX_FRAMES_IN_FLIGHT;
pub use scheduler::{
    CancelHandle, FrameInput, FrameOutcome, FrameScheduler, FrameState, FrameStats,
};
