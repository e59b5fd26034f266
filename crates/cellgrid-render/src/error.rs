use std::fmt;
use std::time::Duration;

use cellgrid_gpu::DeviceError;

/// Errors returned by the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The device does not meet the configured [`CapabilityFloor`](crate::CapabilityFloor).
    CapabilityFloor { reason: String },
    /// No usable adapter or device could be created.
    ContextCreation(String),
    /// A resource could not be allocated, or the atlas cannot hold one frame's glyphs.
    ResourceExhausted(String),
    /// A fence did not signal within the configured timeout.
    ResourceTimeout { waited: Duration },
    /// The device was lost and could not be recovered within this frame.
    DeviceLost,
    /// Program compilation or linking failed. Fatal.
    ShaderBuild { label: String, diagnostics: String },
    /// The renderer has released its resources.
    Released,
    /// Any other device failure.
    Device(DeviceError),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapabilityFloor { reason } => {
                write!(f, "Device is below the capability floor: {}", reason)
            }
            Self::ContextCreation(msg) => write!(f, "Failed to create graphics context: {}", msg),
            Self::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            Self::ResourceTimeout { waited } => {
                write!(f, "Timed out after {:?} waiting for the GPU", waited)
            }
            Self::DeviceLost => write!(f, "Graphics device lost"),
            Self::ShaderBuild { label, diagnostics } => {
                write!(f, "Failed to build program '{}': {}", label, diagnostics)
            }
            Self::Released => write!(f, "Renderer resources have been released"),
            Self::Device(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DeviceError> for RenderError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Lost => RenderError::DeviceLost,
            DeviceError::ShaderBuild { label, diagnostics } => {
                RenderError::ShaderBuild { label, diagnostics }
            }
            DeviceError::OutOfMemory { what } => RenderError::ResourceExhausted(what),
            other => RenderError::Device(other),
        }
    }
}

/// Result type for renderer operations.
pub type RenderResult<T> = Result<T, RenderError>;
