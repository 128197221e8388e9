//! Inflight - headless frame scheduler driver
//!
//! Runs the frame scheduler against the simulated backend, with scripted
//! window resizes and a minimize, and reports frame statistics.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ash::vk;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use inflight_core::RendererConfig;
use inflight_core::config::load_or_default;
use inflight_renderer::{FrameInput, FrameOutcome, FrameScheduler, NoopRecorder};
use inflight_rhi::headless::{HeadlessBackend, HeadlessConfig, LiveObjects};

const DEFAULT_CONFIG_PATH: &str = "inflight.toml";
const STATS_INTERVAL: u64 = 60;
const EVENT_TRACE_CAPACITY: usize = 4096;

/// Simulated host behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
struct SimulationConfig {
    frames: u64,
    gpu_latency_ms: u64,
    initial_width: u32,
    initial_height: u32,
    /// Resize the window every this many frames.
    resize_every: Option<u64>,
    /// Minimize the window before this frame.
    minimize_at: Option<u64>,
    /// Drawable extent polls that report zero while minimized.
    minimize_polls: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            frames: 240,
            gpu_latency_ms: 4,
            initial_width: 1280,
            initial_height: 720,
            resize_every: Some(60),
            minimize_at: Some(150),
            minimize_polls: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
struct AppConfig {
    log_filter: String,
    renderer: RendererConfig,
    simulation: SimulationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_filter: inflight_core::DEFAULT_LOG_FILTER.to_string(),
            renderer: RendererConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

/// Alternates between the initial size and a slightly larger one.
fn resized_extent(simulation: &SimulationConfig, step: u64) -> vk::Extent2D {
    let grow = if step % 2 == 1 { 160 } else { 0 };
    vk::Extent2D {
        width: simulation.initial_width + grow,
        height: simulation.initial_height + grow * 9 / 16,
    }
}

fn run(config: &AppConfig) -> Result<()> {
    let simulation = &config.simulation;
    let initial = vk::Extent2D {
        width: simulation.initial_width,
        height: simulation.initial_height,
    };
    let backend = Arc::new(HeadlessBackend::new(HeadlessConfig {
        gpu_latency: Duration::from_millis(simulation.gpu_latency_ms),
        initial_extent: initial,
        event_capacity: Some(EVENT_TRACE_CAPACITY),
        ..Default::default()
    }));

    let mut scheduler = FrameScheduler::new(backend.clone(), &config.renderer)
        .context("Failed to create frame scheduler")?;
    let mut recorder = NoopRecorder;
    let mut current = initial;
    let mut resizes = 0;

    for frame in 0..simulation.frames {
        let mut input = FrameInput::default();

        if let Some(every) = simulation.resize_every.filter(|&n| n > 0)
            && frame > 0
            && frame % every == 0
        {
            resizes += 1;
            current = resized_extent(simulation, resizes);
            info!(
                "Frame {}: resizing window to {}x{}",
                frame, current.width, current.height
            );
            backend.set_drawable_extent(current);
            input.resize_requested = true;
        }

        if simulation.minimize_at == Some(frame) {
            info!(
                "Frame {}: minimizing window for {} polls",
                frame, simulation.minimize_polls
            );
            let zero = vk::Extent2D::default();
            let script = std::iter::repeat_n(zero, simulation.minimize_polls.max(1) as usize)
                .chain(std::iter::once(current));
            backend.script_drawable_extents(script);
            input.resize_requested = true;
        }

        match scheduler
            .tick(input, &mut recorder)
            .with_context(|| format!("Frame {} failed", frame))?
        {
            FrameOutcome::Presented {
                image_index,
                slot_index,
                rebuilt,
            } => {
                if rebuilt {
                    info!(
                        "Frame {}: swapchain rebuilt (epoch {})",
                        frame,
                        scheduler.epoch_generation()
                    );
                }
                debug!(
                    "Frame {}: image {} from slot {}",
                    frame, image_index, slot_index
                );
            }
            FrameOutcome::TimedOut => warn!("Frame {}: timed out, retrying next tick", frame),
        }

        if frame > 0 && frame % STATS_INTERVAL == 0 {
            let stats = scheduler.stats();
            info!(
                "Frame {}: {:.1} fps, last frame {:?}, {} rebuilds",
                frame, stats.fps, stats.last_frame_time, stats.rebuilds
            );
        }
    }

    let stats = *scheduler.stats();
    drop(scheduler);

    info!(
        "Presented {} frames: {} rebuilds, {} timeouts, {} out-of-date acquires, {} suboptimal presents, {:.1} fps",
        stats.frames_presented,
        stats.rebuilds,
        stats.timeouts,
        stats.out_of_date_acquires,
        stats.suboptimal_presents,
        stats.fps
    );

    let violations = backend.validation_errors();
    if !violations.is_empty() {
        for violation in &violations {
            warn!("Validation: {}", violation);
        }
        bail!("{} synchronization violations", violations.len());
    }
    let live = backend.live_objects();
    if live != LiveObjects::default() {
        bail!("Objects leaked at shutdown: {:?}", live);
    }

    Ok(())
}

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config: AppConfig = load_or_default(&path);

    inflight_core::init_logging_with(&config.log_filter);
    info!("Starting inflight with config {:?}", path);

    run(&config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_parses_partial_toml() {
        let config: AppConfig = inflight_core::config::from_toml_str(
            r#"
            log_filter = "warn"

            [renderer]
            frames_in_flight = 3

            [simulation]
            frames = 10
            resize_every = 4
            "#,
        )
        .expect("parse");

        assert_eq!(config.log_filter, "warn");
        assert_eq!(config.renderer.frames_in_flight, 3);
        assert_eq!(config.renderer.min_image_count, 3);
        assert_eq!(config.simulation.frames, 10);
        assert_eq!(config.simulation.resize_every, Some(4));
        assert_eq!(config.simulation.minimize_at, Some(150));
    }

    #[test]
    fn test_resized_extent_alternates() {
        let simulation = SimulationConfig::default();
        assert_eq!(resized_extent(&simulation, 1).width, 1440);
        assert_eq!(resized_extent(&simulation, 2).width, 1280);
    }

    #[test]
    fn test_short_run_is_clean() {
        let config = AppConfig {
            simulation: SimulationConfig {
                frames: 24,
                gpu_latency_ms: 1,
                resize_every: Some(7),
                minimize_at: Some(12),
                minimize_polls: 2,
                ..Default::default()
            },
            renderer: RendererConfig {
                extent_poll_interval_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        run(&config).expect("run");
    }
}
