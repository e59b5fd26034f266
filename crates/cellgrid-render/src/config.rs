//! Renderer configuration.

use std::time::Duration;

use cellgrid_gpu::FeatureLevel;

use crate::capability::{CapabilityFloor, StreamStrategyKind};
use crate::color::Rgba;

/// Largest number of instances in one draw.
pub const MAX_INSTANCES: usize = 65_536;

/// Default glyph atlas edge length.
pub const ATLAS_DEFAULT_DIMENSION: u32 = 2048;

/// Largest glyph atlas edge length the atlas will grow to.
pub const ATLAS_MAX_DIMENSION: u32 = 4096;

/// Frames the CPU may run ahead of the GPU.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 3;

/// Configuration for a [`Backend`](crate::Backend).
///
/// # Example
///
/// ```
/// use cellgrid_render::{RendererConfig, StreamStrategyKind};
/// use std::time::Duration;
///
/// let config = RendererConfig::default()
///     .with_fence_timeout(Duration::from_millis(500))
///     .with_stream_strategy(StreamStrategyKind::Orphan)
///     .with_subpixel_text(true);
/// assert_eq!(config.batch_capacity, 65_536);
/// ```
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Instances per draw before the batch auto-flushes. Clamped to
    /// `1..=MAX_INSTANCES`.
    pub batch_capacity: usize,
    /// Initial (and post-reset) atlas edge length. Rounded up to a power of two.
    pub atlas_initial_size: u32,
    /// Atlas growth ceiling, further clamped by the device's texture limit.
    pub atlas_max_size: u32,
    /// Per-frame slots for the rotating and persistent stream strategies.
    pub frames_in_flight: usize,
    /// Bound on any CPU wait for the GPU.
    pub fence_timeout: Duration,
    /// Force a stream strategy. Ignored with a warning when the device cannot
    /// support it.
    pub stream_strategy_override: Option<StreamStrategyKind>,
    /// Allow subpixel (RGB) text.
    pub subpixel_text: bool,
    /// Minimum device the renderer will initialize on.
    pub capability_floor: CapabilityFloor,
    /// Clear color behind the grid, straight alpha.
    pub clear_color: Rgba,
    /// Present with vertical sync.
    pub vsync: bool,
    /// Attach debug labels to device objects.
    pub debug_labels: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            batch_capacity: MAX_INSTANCES,
            atlas_initial_size: ATLAS_DEFAULT_DIMENSION,
            atlas_max_size: ATLAS_MAX_DIMENSION,
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            fence_timeout: Duration::from_secs(2),
            stream_strategy_override: None,
            subpixel_text: false,
            capability_floor: CapabilityFloor::default(),
            clear_color: Rgba::BLACK,
            vsync: true,
            debug_labels: cfg!(debug_assertions),
        }
    }
}

impl RendererConfig {
    pub fn with_batch_capacity(mut self, capacity: usize) -> Self {
        self.batch_capacity = capacity;
        self
    }

    pub fn with_atlas_size(mut self, initial: u32, max: u32) -> Self {
        self.atlas_initial_size = initial;
        self.atlas_max_size = max;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_stream_strategy(mut self, kind: StreamStrategyKind) -> Self {
        self.stream_strategy_override = Some(kind);
        self
    }

    pub fn with_subpixel_text(mut self, enabled: bool) -> Self {
        self.subpixel_text = enabled;
        self
    }

    pub fn with_capability_floor(mut self, floor: CapabilityFloor) -> Self {
        self.capability_floor = floor;
        self
    }

    pub fn with_min_feature_level(mut self, level: FeatureLevel) -> Self {
        self.capability_floor.min_level = level;
        self
    }

    pub fn with_clear_color(mut self, color: Rgba) -> Self {
        self.clear_color = color;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub(crate) fn effective_batch_capacity(&self) -> usize {
        self.batch_capacity.clamp(1, MAX_INSTANCES)
    }

    pub(crate) fn effective_frames_in_flight(&self) -> usize {
        self.frames_in_flight.max(1)
    }
}
