//! Device capability snapshot.
//!
//! A [`FeatureSet`] is queried once when a renderer initializes and is never
//! mutated afterwards. Strategy selection reads it; nothing on the per-frame
//! path branches on it directly.

use std::fmt;

use bitflags::bitflags;

/// Coarse API feature level, ordered from least to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureLevel {
    /// GLES3 / WebGL2 class hardware.
    Downlevel,
    /// Compute-capable but not fully WebGPU compliant (GL 4.3, older D3D11).
    Standard,
    /// Fully compliant Vulkan / Metal / D3D12, or the CPU reference device.
    Full,
}

impl fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureLevel::Downlevel => write!(f, "Downlevel"),
            FeatureLevel::Standard => write!(f, "Standard"),
            FeatureLevel::Full => write!(f, "Full"),
        }
    }
}

bitflags! {
    /// Optional device capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// A buffer may stay mapped for the lifetime of the renderer.
        const PERSISTENT_MAPPING = 1 << 0;

        /// Resources can be written without binding them first (DSA-style).
        /// Enables immediate atlas sub-region uploads.
        const DIRECT_RESOURCE_ACCESS = 1 << 1;

        /// Multiple draws from one indirect call.
        const MULTI_DRAW = 1 << 2;

        /// Compute shaders.
        const COMPUTE = 1 << 3;

        /// Dynamically indexed texture arrays.
        const BINDLESS_TEXTURES = 1 << 4;

        /// Debug labels and validation messages.
        const DEBUG_OUTPUT = 1 << 5;

        /// Two fragment outputs feeding the blender. Required for per-channel
        /// subpixel text blending.
        const DUAL_SOURCE_BLENDING = 1 << 6;

        /// GPU timestamp queries.
        const TIMER_QUERY = 1 << 7;
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::empty()
    }
}

/// Immutable capability record for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeatureSet {
    pub baseline: FeatureLevel,
    pub capabilities: Capabilities,
    /// Largest supported width/height of a 2D texture.
    pub max_texture_dimension: u32,
}

impl FeatureSet {
    pub const fn new(
        baseline: FeatureLevel,
        capabilities: Capabilities,
        max_texture_dimension: u32,
    ) -> Self {
        Self {
            baseline,
            capabilities,
            max_texture_dimension,
        }
    }

    /// Check whether every capability in `caps` is present.
    #[inline]
    pub fn supports(&self, caps: Capabilities) -> bool {
        self.capabilities.contains(caps)
    }

    #[inline]
    pub fn persistent_mapping(&self) -> bool {
        self.supports(Capabilities::PERSISTENT_MAPPING)
    }

    #[inline]
    pub fn direct_resource_access(&self) -> bool {
        self.supports(Capabilities::DIRECT_RESOURCE_ACCESS)
    }

    #[inline]
    pub fn dual_source_blending(&self) -> bool {
        self.supports(Capabilities::DUAL_SOURCE_BLENDING)
    }

    /// Same record with `caps` removed. Used to pin a device to a fallback path.
    pub fn without(mut self, caps: Capabilities) -> Self {
        self.capabilities.remove(caps);
        self
    }

    /// Same record with `caps` added.
    pub fn with(mut self, caps: Capabilities) -> Self {
        self.capabilities.insert(caps);
        self
    }
}

impl fmt::Display for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (max texture {}, {:?})",
            self.baseline, self.max_texture_dimension, self.capabilities
        )
    }
}
