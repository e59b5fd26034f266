//! Instance-batched cell-grid renderer.
//!
//! Every visible element of a terminal frame (cell backgrounds, glyphs,
//! underline patterns, selection, cursor) becomes one 20-byte
//! [`InstanceRecord`]. Records are streamed to the GPU in large batches and
//! drawn with a single program whose fragment stage branches on a
//! per-instance [`ShadingMode`].
//!
//! # Overview
//!
//! - [`Backend`] - frame orchestration; owns one [`GraphicsDevice`] and one
//!   [`GlyphRasterizer`]
//! - [`GlyphAtlas`] - skyline-packed glyph texture that grows, then resets
//! - [`BufferStreamer`] - persistent, rotating or orphaning instance uploads
//! - [`device::WgpuDevice`] / [`device::SoftwareDevice`] - concrete devices
//!
//! [`GraphicsDevice`]: cellgrid_gpu::GraphicsDevice

pub mod atlas;
pub mod backend;
pub mod batch;
pub mod capability;
pub mod color;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod instance;
pub mod payload;
pub mod shading;
pub mod state_cache;
pub mod streamer;

pub use atlas::{AtlasError, AtlasRegion, AtlasStats, GlyphAtlas};
pub use backend::{Backend, BackendState, FrameStats};
pub use batch::{BatchAssembler, BatchStats, DrawSink, Layer};
pub use capability::{
    AtlasUploadPath, CapabilityFloor, ResolvedStrategies, StreamStrategyKind, SubpixelPath,
    select_strategies,
};
pub use color::Rgba;
pub use config::*;
pub use context::{GraphicsContext, GraphicsContextDescriptor};
pub use error::{RenderError, RenderResult};
pub use instance::{AtlasUnit, InstanceRecord, RenditionScale, ShadingMode};
pub use payload::*;
pub use state_cache::{StateCache, StateCacheStats};
pub use streamer::{BufferStreamer, StreamSlice};
