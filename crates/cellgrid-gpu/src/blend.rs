//! API-neutral blend configuration.

/// Blend factor applied to the source or destination term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
    /// Second fragment output (dual-source blending).
    Src1,
    /// `1 - src1`, per channel (dual-source blending).
    OneMinusSrc1,
}

impl BlendFactor {
    /// True if the factor reads the second fragment output.
    pub fn uses_dual_source(self) -> bool {
        matches!(self, BlendFactor::Src1 | BlendFactor::OneMinusSrc1)
    }
}

/// Blend equation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Blend function and equation for the color target.
///
/// Color and alpha share the same factors; every preset the renderer uses is
/// symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendConfig {
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
}

impl BlendConfig {
    /// Premultiplied-alpha "over": `src + dst * (1 - src.a)`.
    pub const PREMULTIPLIED: BlendConfig = BlendConfig {
        src: BlendFactor::One,
        dst: BlendFactor::OneMinusSrcAlpha,
        op: BlendOp::Add,
    };

    /// Per-channel weights from the second output: `src + dst * (1 - src1)`.
    pub const DUAL_SOURCE: BlendConfig = BlendConfig {
        src: BlendFactor::One,
        dst: BlendFactor::OneMinusSrc1,
        op: BlendOp::Add,
    };

    /// No blending.
    pub const REPLACE: BlendConfig = BlendConfig {
        src: BlendFactor::One,
        dst: BlendFactor::Zero,
        op: BlendOp::Add,
    };

    pub fn uses_dual_source(&self) -> bool {
        self.src.uses_dual_source() || self.dst.uses_dual_source()
    }
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self::PREMULTIPLIED
    }
}
