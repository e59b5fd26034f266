//! Capability floor checks and one-time strategy selection.
//!
//! Everything feature-dependent is decided here, once, when a
//! [`Backend`](crate::Backend) initializes. The result is a
//! [`ResolvedStrategies`] record; the per-frame path never looks at the
//! [`FeatureSet`] again.

use std::fmt;

use cellgrid_gpu::{Capabilities, FeatureLevel, FeatureSet};

use crate::config::{ATLAS_DEFAULT_DIMENSION, RendererConfig};
use crate::error::{RenderError, RenderResult};

/// Minimum device the renderer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityFloor {
    pub min_level: FeatureLevel,
    /// The glyph atlas needs at least one texture of this edge length.
    pub min_texture_dimension: u32,
}

impl Default for CapabilityFloor {
    fn default() -> Self {
        Self {
            min_level: FeatureLevel::Downlevel,
            min_texture_dimension: ATLAS_DEFAULT_DIMENSION,
        }
    }
}

impl CapabilityFloor {
    /// Fail with [`RenderError::CapabilityFloor`] if `features` is below the floor.
    pub fn check(&self, features: &FeatureSet) -> RenderResult<()> {
        if features.baseline < self.min_level {
            return Err(RenderError::CapabilityFloor {
                reason: format!(
                    "feature level {} is below the required {}",
                    features.baseline, self.min_level
                ),
            });
        }
        if features.max_texture_dimension < self.min_texture_dimension {
            return Err(RenderError::CapabilityFloor {
                reason: format!(
                    "max texture dimension {} is below the required {}",
                    features.max_texture_dimension, self.min_texture_dimension
                ),
            });
        }
        Ok(())
    }
}

/// Instance upload strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStrategyKind {
    /// N backing allocations cycled per frame.
    Rotating,
    /// Re-specify the backing store before every write.
    Orphan,
    /// One mapping for the renderer lifetime, fenced per region.
    Persistent,
}

impl fmt::Display for StreamStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamStrategyKind::Rotating => write!(f, "rotating"),
            StreamStrategyKind::Orphan => write!(f, "orphan"),
            StreamStrategyKind::Persistent => write!(f, "persistent"),
        }
    }
}

/// How glyph pixels reach the atlas texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtlasUploadPath {
    /// One sub-region write per insert.
    Immediate,
    /// Queue inserts and write them in one pass before the first draw.
    Staged,
}

/// How `TextSubpixel` instances blend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubpixelPath {
    /// Subpixel text is off; glyphs are rasterized as grayscale.
    Disabled,
    /// Per-channel weights through dual-source blending.
    DualSource,
    /// RGB coverage collapsed to one channel in the shader.
    GrayscaleFallback,
}

/// Every feature-dependent decision, made once at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedStrategies {
    pub stream: StreamStrategyKind,
    pub atlas_upload: AtlasUploadPath,
    pub subpixel: SubpixelPath,
}

impl fmt::Display for ResolvedStrategies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream={}, atlas={:?}, subpixel={:?}",
            self.stream, self.atlas_upload, self.subpixel
        )
    }
}

fn stream_supported(kind: StreamStrategyKind, features: &FeatureSet, frames: usize) -> bool {
    match kind {
        StreamStrategyKind::Persistent => features.persistent_mapping(),
        StreamStrategyKind::Rotating => frames >= 2,
        StreamStrategyKind::Orphan => true,
    }
}

/// Pick the stream, atlas-upload and subpixel strategies for `features`.
///
/// Unsupported optional capabilities are never an error; a fallback is
/// always available.
pub fn select_strategies(features: &FeatureSet, config: &RendererConfig) -> ResolvedStrategies {
    let frames = config.effective_frames_in_flight();

    let preferred = if features.persistent_mapping() {
        StreamStrategyKind::Persistent
    } else if frames >= 2 && features.baseline == FeatureLevel::Full {
        StreamStrategyKind::Rotating
    } else {
        StreamStrategyKind::Orphan
    };

    let stream = match config.stream_strategy_override {
        Some(kind) if stream_supported(kind, features, frames) => kind,
        Some(kind) => {
            tracing::warn!(
                "Stream strategy override '{}' is not supported by this device, using '{}'",
                kind,
                preferred
            );
            preferred
        }
        None => preferred,
    };

    let atlas_upload = if features
        .capabilities
        .intersects(Capabilities::DIRECT_RESOURCE_ACCESS | Capabilities::PERSISTENT_MAPPING)
    {
        AtlasUploadPath::Immediate
    } else {
        AtlasUploadPath::Staged
    };

    let subpixel = match (config.subpixel_text, features.dual_source_blending()) {
        (false, _) => SubpixelPath::Disabled,
        (true, true) => SubpixelPath::DualSource,
        (true, false) => SubpixelPath::GrayscaleFallback,
    };

    ResolvedStrategies {
        stream,
        atlas_upload,
        subpixel,
    }
}
