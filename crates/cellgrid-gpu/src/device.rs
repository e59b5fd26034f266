//! The object-safe graphics device trait and its descriptor types.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

use crate::{BlendConfig, DeviceResult, FeatureSet};

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident($raw:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($raw);

        impl $name {
            /// Wrap a raw device-side id.
            pub const fn from_raw(raw: $raw) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> $raw {
                self.0
            }
        }
    };
}

handle!(
    /// Opaque buffer handle issued by a device.
    BufferId(u32)
);
handle!(
    /// Opaque 2D texture handle issued by a device.
    TextureId(u32)
);
handle!(
    /// Opaque linked program (pipeline) handle issued by a device.
    ProgramId(u32)
);
handle!(
    /// Opaque CPU/GPU synchronization point.
    FenceId(u64)
);

/// Which low-level graphics API a device drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphicsApi {
    Vulkan,
    Metal,
    Dx12,
    Gl,
    WebGpu,
    /// CPU reference rasterizer.
    Software,
    /// Call-recording test device.
    Mock,
}

impl fmt::Display for GraphicsApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GraphicsApi::Vulkan => "Vulkan",
            GraphicsApi::Metal => "Metal",
            GraphicsApi::Dx12 => "Direct3D 12",
            GraphicsApi::Gl => "OpenGL",
            GraphicsApi::WebGpu => "WebGPU",
            GraphicsApi::Software => "Software",
            GraphicsApi::Mock => "Mock",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// How a buffer will be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Per-instance vertex input.
        const INSTANCE = 1 << 0;
        /// Uniform/constant block storage.
        const UNIFORM = 1 << 1;
        /// Target of `write_buffer`.
        const COPY_DST = 1 << 2;
        /// Mapped once with `map_persistent` and written through `write_mapped`.
        const PERSISTENT = 1 << 3;
    }
}

/// Buffer creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDesc {
    pub const fn new(label: &'static str, size: u64, usage: BufferUsage) -> Self {
        Self { label, size, usage }
    }
}

/// Texel formats the renderer uploads. Both are 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Single-channel coverage.
    R8,
    /// Four channels: subpixel coverage, premultiplied color, or control data.
    Rgba8,
}

impl TextureFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::Rgba8 => 4,
        }
    }
}

/// 2D texture creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

/// Rectangle of texels inside a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Program creation parameters. `source` is WGSL; devices that do not compile
/// shader text still validate the entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramDesc<'a> {
    pub label: &'a str,
    pub source: &'a str,
    pub vertex_entry: &'a str,
    pub fragment_entry: &'a str,
    /// Blend state the program is used with. Devices that bake blending into
    /// the pipeline create a variant per distinct `set_blend` value.
    pub dual_source: bool,
}

/// Constant blocks bound alongside the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformBlock {
    /// Per-frame transform, viewport and cell geometry, clock.
    Frame,
    /// Palette, gamma and effect settings.
    Palette,
}

impl UniformBlock {
    /// Binding slot in group 0.
    pub const fn binding(self) -> u32 {
        match self {
            UniformBlock::Frame => 0,
            UniformBlock::Palette => 1,
        }
    }
}

/// Color target for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTarget {
    pub width: u32,
    pub height: u32,
    /// Premultiplied clear color.
    pub clear: [f32; 4],
}

/// Outcome of a bounded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

/// Health of the underlying context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Ready,
    Lost,
}

/// Graphics API abstraction used by the renderer core.
///
/// Every call happens on the rendering thread that owns the device, so methods
/// take `&mut self`. The trait is object safe; the renderer stores a
/// `Box<dyn GraphicsDevice>` selected at startup.
///
/// # Ordering
///
/// Calls are observed by the GPU in issue order. In particular a
/// `write_texture` or `write_buffer` issued before `draw_instances` is
/// visible to that draw.
///
/// # Device loss
///
/// Any fallible call may return [`DeviceError::Lost`](crate::DeviceError::Lost).
/// After that every handle is invalid; the owner calls [`recreate`](Self::recreate)
/// and rebuilds its resources.
pub trait GraphicsDevice: Send {
    /// The API this device drives.
    fn api(&self) -> GraphicsApi;

    /// Capability snapshot. Stable until `recreate`.
    fn features(&self) -> FeatureSet;

    fn status(&self) -> DeviceStatus;

    // Buffers

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferId>;

    /// Replace the buffer's backing store with a fresh allocation of the same
    /// size. Draws already issued keep reading the old store.
    fn orphan_buffer(&mut self, buffer: BufferId) -> DeviceResult<()>;

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()>;

    /// Map a `PERSISTENT` buffer for the rest of its lifetime.
    fn map_persistent(&mut self, buffer: BufferId) -> DeviceResult<()>;

    /// Write through a persistent mapping. The caller is responsible for
    /// fencing regions that may still be read by the GPU.
    fn write_mapped(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()>;

    fn destroy_buffer(&mut self, buffer: BufferId);

    // Synchronization

    /// Insert a fence after every command issued so far.
    fn insert_fence(&mut self) -> DeviceResult<FenceId>;

    /// Wait until `fence` signals or `timeout` elapses.
    fn wait_fence(&mut self, fence: FenceId, timeout: Duration) -> DeviceResult<FenceStatus>;

    // Textures

    fn create_texture(&mut self, desc: &TextureDesc) -> DeviceResult<TextureId>;

    /// Upload tightly packed rows into `region`.
    fn write_texture(
        &mut self,
        texture: TextureId,
        region: TextureRegion,
        data: &[u8],
        bytes_per_row: u32,
    ) -> DeviceResult<()>;

    /// Copy the `width`×`height` texels at the origin of `src` into `dst`.
    fn copy_texture(
        &mut self,
        src: TextureId,
        dst: TextureId,
        width: u32,
        height: u32,
    ) -> DeviceResult<()>;

    fn destroy_texture(&mut self, texture: TextureId);

    // Programs

    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> DeviceResult<ProgramId>;

    fn destroy_program(&mut self, program: ProgramId);

    // Fixed-function and binding state

    fn set_program(&mut self, program: ProgramId) -> DeviceResult<()>;

    fn bind_texture(&mut self, unit: u32, texture: TextureId) -> DeviceResult<()>;

    fn set_blend(&mut self, blend: BlendConfig) -> DeviceResult<()>;

    fn write_uniforms(&mut self, block: UniformBlock, data: &[u8]) -> DeviceResult<()>;

    // Frame

    /// Start a frame: size the color target and clear it.
    fn begin_frame(&mut self, target: &FrameTarget) -> DeviceResult<()>;

    /// Draw `count` instanced quads whose records start at byte `offset`.
    fn draw_instances(&mut self, buffer: BufferId, offset: u64, count: u32) -> DeviceResult<()>;

    fn present(&mut self) -> DeviceResult<()>;

    // Recovery

    /// Re-acquire the underlying context after loss. Invalidates all handles.
    fn recreate(&mut self) -> DeviceResult<()>;
}
