//! Frame timer: per-frame deltas and a windowed frames-per-second figure.

use std::time::{Duration, Instant};

/// Length of the window over which [`Timer::fps`] is averaged.
const DEFAULT_FPS_WINDOW: Duration = Duration::from_millis(500);

/// High-resolution timer for frame pacing statistics.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
    window_start: Instant,
    window_frames: u32,
    window: Duration,
    fps: f32,
}

impl Timer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        Self::with_fps_window(DEFAULT_FPS_WINDOW)
    }

    /// Create a timer whose fps figure is averaged over `window`.
    pub fn with_fps_window(window: Duration) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            window_start: now,
            window_frames: 0,
            window,
            fps: 0.0,
        }
    }

    /// Total elapsed time since the timer was created or reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed time in seconds since the timer was created or reset.
    pub fn elapsed_secs(&self) -> f32 {
        self.elapsed().as_secs_f32()
    }

    /// Marks the end of a frame and returns the time since the previous one.
    ///
    /// Every call counts as one frame towards [`fps`](Self::fps).
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;

        self.window_frames += 1;
        let window_elapsed = now - self.window_start;
        if window_elapsed >= self.window {
            self.fps = self.window_frames as f32 / window_elapsed.as_secs_f32();
            self.window_frames = 0;
            self.window_start = now;
        }

        delta
    }

    /// Frames per second over the last completed window (0 until one completes).
    pub fn fps(&self) -> f32 {
        self.fps
    }

    /// Reset the timer to the current time.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last_tick = now;
        self.window_start = now;
        self.window_frames = 0;
        self.fps = 0.0;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
