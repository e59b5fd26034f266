//! Concrete [`GraphicsDevice`](cellgrid_gpu::GraphicsDevice) implementations.
//!
//! - [`WgpuDevice`] drives Vulkan, Metal, D3D12 or OpenGL through wgpu
//! - [`SoftwareDevice`] rasterizes on the CPU with the same shading function;
//!   it is the reference for pixel tests and the fallback when no adapter exists

mod software;
mod wgpu;

use std::sync::Arc;

use parking_lot::Mutex;

pub use self::software::SoftwareDevice;
pub use self::wgpu::WgpuDevice;

#[derive(Debug, Default)]
struct CapturedFrame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    presents: u64,
}

/// Shared view of the last presented frame.
///
/// Devices move into the renderer, so callers keep a clone of this handle to
/// inspect output afterwards. Pixels are RGBA8, premultiplied, row-major with
/// no padding.
#[derive(Debug, Clone, Default)]
pub struct FrameCapture {
    inner: Arc<Mutex<CapturedFrame>>,
}

impl FrameCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn store(&self, width: u32, height: u32, pixels: Vec<u8>) {
        let mut frame = self.inner.lock();
        frame.width = width;
        frame.height = height;
        frame.pixels = pixels;
        frame.presents += 1;
    }

    pub fn width(&self) -> u32 {
        self.inner.lock().width
    }

    pub fn height(&self) -> u32 {
        self.inner.lock().height
    }

    /// Copy of the whole frame.
    pub fn pixels(&self) -> Vec<u8> {
        self.inner.lock().pixels.clone()
    }

    /// One pixel, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let frame = self.inner.lock();
        if x >= frame.width || y >= frame.height {
            return None;
        }
        let start = ((y * frame.width + x) * 4) as usize;
        let texel = frame.pixels.get(start..start + 4)?;
        Some([texel[0], texel[1], texel[2], texel[3]])
    }

    /// Number of frames presented so far.
    pub fn presents(&self) -> u64 {
        self.inner.lock().presents
    }
}
