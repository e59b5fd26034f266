use std::fmt;

/// Errors reported by a [`GraphicsDevice`](crate::GraphicsDevice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device or context was lost (driver reset, removal). Recoverable by
    /// calling `recreate` and rebuilding every resource.
    Lost,
    /// An allocation failed.
    OutOfMemory { what: String },
    /// Program compilation or linking failed.
    ShaderBuild { label: String, diagnostics: String },
    /// A handle that the device does not own (or no longer owns).
    InvalidHandle(&'static str),
    /// The call needs a capability the device does not report.
    Unsupported(&'static str),
    /// Any other API-level failure.
    Backend(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lost => write!(f, "Graphics device lost"),
            Self::OutOfMemory { what } => write!(f, "Out of device memory allocating {}", what),
            Self::ShaderBuild { label, diagnostics } => {
                write!(f, "Failed to build program '{}': {}", label, diagnostics)
            }
            Self::InvalidHandle(kind) => write!(f, "Invalid {} handle", kind),
            Self::Unsupported(what) => write!(f, "Unsupported device operation: {}", what),
            Self::Backend(msg) => write!(f, "Graphics backend error: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;
