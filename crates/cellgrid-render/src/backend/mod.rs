//! Frame orchestration over a [`GraphicsDevice`].
//!
//! A [`Backend`] owns one device, one rasterizer and every resource derived
//! from them. Its public contract is three calls: [`Backend::render`],
//! [`Backend::release_resources`] and [`Backend::requires_continuous_redraw`].
//!
//! # Example
//!
//! ```rust
//! use cellgrid_core::geometry::Size;
//! use cellgrid_render::device::SoftwareDevice;
//! use cellgrid_render::{
//!     Backend, FontMetrics, GlyphKey, GlyphRasterizer, RasterizedGlyph, RenderPayload,
//!     RendererConfig,
//! };
//!
//! struct NoGlyphs;
//!
//! impl GlyphRasterizer for NoGlyphs {
//!     fn rasterize(&mut self, _key: GlyphKey, _metrics: &FontMetrics) -> Option<RasterizedGlyph> {
//!         None
//!     }
//! }
//!
//! let device = SoftwareDevice::new();
//! let capture = device.capture();
//! let mut backend =
//!     Backend::new(Box::new(device), Box::new(NoGlyphs), RendererConfig::default()).unwrap();
//!
//! let stats = backend
//!     .render(&RenderPayload::blank(Size::new(90, 36), 10, 2))
//!     .unwrap();
//! assert_eq!(stats.draw_calls, 1);
//! assert_eq!(capture.presents(), 1);
//! ```

mod rows;
mod stats;

use std::fmt;
use std::time::Instant;

use cellgrid_core::profiling::{self, profile_function, profile_scope};
use cellgrid_gpu::{
    BlendConfig, DeviceResult, FeatureSet, FrameTarget, GraphicsDevice, ProgramDesc, ProgramId,
    TextureFormat, UniformBlock,
};

use crate::atlas::{AtlasStats, GlyphAtlas};
use crate::batch::{BatchAssembler, DrawSink, Layer};
use crate::capability::{ResolvedStrategies, SubpixelPath, select_strategies};
use crate::config::RendererConfig;
use crate::error::{RenderError, RenderResult};
use crate::instance::{AtlasUnit, InstanceRecord};
use crate::payload::{EffectFlags, GlyphRasterizer, RenderPayload};
use crate::shading::{self, FrameConstants, PaletteConstants};
use crate::state_cache::StateCache;
use crate::streamer::BufferStreamer;

use self::rows::{AtlasPair, GlyphResolver, PlacementCache, RowCache, WalkError};
pub use self::stats::FrameStats;

/// Lifecycle of a [`Backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendState {
    /// Not yet usable; only observable while `Backend::new` runs.
    Uninitialized,
    /// Idle between frames.
    Ready,
    /// Inside `render`.
    Rendering,
    /// The device was lost and the resources dropped. The next `render`
    /// recreates the device before drawing.
    Lost,
    /// Resources destroyed. Terminal.
    Released,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Device objects created by the init sequence. Rebuilt after device loss.
struct DeviceResources {
    program: ProgramId,
    blend: BlendConfig,
    atlases: AtlasPair,
    streamer: BufferStreamer,
}

impl DeviceResources {
    fn release(mut self, device: &mut dyn GraphicsDevice) {
        self.streamer.release(device);
        self.atlases.coverage.release(device);
        self.atlases.color.release(device);
        device.destroy_program(self.program);
    }

    fn atlas_stats(&self) -> (AtlasStats, AtlasStats) {
        (self.atlases.coverage.stats(), self.atlases.color.stats())
    }
}

/// Hands flushed batches to the device through the streamer.
struct DeviceSink<'a> {
    device: &'a mut dyn GraphicsDevice,
    streamer: &'a mut BufferStreamer,
    draw_calls: u32,
}

impl DrawSink for DeviceSink<'_> {
    fn draw(&mut self, records: &[InstanceRecord]) -> RenderResult<()> {
        let slice = self
            .streamer
            .upload(self.device, bytemuck::cast_slice(records))?;
        self.device
            .draw_instances(slice.buffer, slice.offset, records.len() as u32)?;
        self.streamer.submitted(self.device)?;
        self.draw_calls += 1;
        Ok(())
    }
}

/// Instance-batched cell-grid renderer.
pub struct Backend {
    device: Box<dyn GraphicsDevice>,
    rasterizer: Box<dyn GlyphRasterizer>,
    config: RendererConfig,
    features: FeatureSet,
    strategies: ResolvedStrategies,
    resources: Option<DeviceResources>,
    cache: StateCache,
    assembler: BatchAssembler,
    rows: RowCache,
    placements: PlacementCache,
    font_generation: Option<u64>,
    /// Bumped on every successful init; part of the row cache key.
    epoch: u64,
    state: BackendState,
    clock: Instant,
    /// Atlas generations when the atlas textures were last bound.
    bound_generations: Option<(u64, u64)>,
    continuous_redraw: bool,
    last_stats: FrameStats,
}

impl Backend {
    /// Run the init sequence: capability floor, strategy selection, program
    /// build, atlases and streamer.
    pub fn new(
        device: Box<dyn GraphicsDevice>,
        rasterizer: Box<dyn GlyphRasterizer>,
        config: RendererConfig,
    ) -> RenderResult<Self> {
        let features = device.features();
        let mut backend = Self {
            device,
            rasterizer,
            strategies: select_strategies(&features, &config),
            assembler: BatchAssembler::new(config.effective_batch_capacity()),
            config,
            features,
            resources: None,
            cache: StateCache::new(),
            rows: RowCache::default(),
            placements: PlacementCache::default(),
            font_generation: None,
            epoch: 0,
            state: BackendState::Uninitialized,
            clock: Instant::now(),
            bound_generations: None,
            continuous_redraw: false,
            last_stats: FrameStats::default(),
        };
        backend.initialize()?;
        Ok(backend)
    }

    fn initialize(&mut self) -> RenderResult<()> {
        profile_function!();
        let features = self.device.features();
        self.config.capability_floor.check(&features)?;
        let strategies = select_strategies(&features, &self.config);

        let dual_source = strategies.subpixel == SubpixelPath::DualSource;
        let source = shading::program_source(dual_source);
        let program = self.device.create_program(&ProgramDesc {
            label: "cellgrid",
            source: &source,
            vertex_entry: shading::VERTEX_ENTRY,
            fragment_entry: shading::FRAGMENT_ENTRY,
            dual_source,
        })?;

        let max_atlas = self.config.atlas_max_size.min(features.max_texture_dimension);
        let initial_atlas = self.config.atlas_initial_size.min(max_atlas);
        let atlases = match create_atlases(
            self.device.as_mut(),
            &strategies,
            initial_atlas,
            max_atlas,
        ) {
            Ok(atlases) => atlases,
            Err(err) => {
                self.device.destroy_program(program);
                return Err(err.into());
            }
        };

        self.resources = Some(DeviceResources {
            program,
            blend: if dual_source {
                BlendConfig::DUAL_SOURCE
            } else {
                BlendConfig::PREMULTIPLIED
            },
            atlases,
            streamer: BufferStreamer::new(
                strategies.stream,
                self.config.effective_batch_capacity(),
                self.config.effective_frames_in_flight(),
                self.config.fence_timeout,
            ),
        });
        self.features = features;
        self.strategies = strategies;
        self.cache.reset();
        self.rows.clear();
        self.placements.clear();
        self.font_generation = None;
        self.bound_generations = None;
        self.epoch += 1;
        self.state = BackendState::Ready;

        tracing::info!(
            "Renderer initialized on {} [{}]: {}",
            self.device.api(),
            features,
            strategies
        );
        Ok(())
    }

    /// Draw one frame and present it.
    ///
    /// On device loss the device is recreated, the init sequence re-run and
    /// the frame retried once; a second loss is returned to the caller. If
    /// recovery itself fails the backend stays [`BackendState::Lost`] and the
    /// next call tries again.
    pub fn render(&mut self, payload: &RenderPayload) -> RenderResult<FrameStats> {
        profile_function!();
        profiling::new_frame();
        let result = match self.state {
            BackendState::Released => return Err(RenderError::Released),
            BackendState::Lost => self.recover_and_render(payload),
            _ => match self.render_frame(payload) {
                Err(RenderError::DeviceLost) => {
                    tracing::warn!("Graphics device lost, reinitializing");
                    self.recover_and_render(payload)
                }
                other => other,
            },
        };

        match result {
            Ok(stats) => {
                tracing::debug!("Frame: {}", stats);
                self.last_stats = stats;
                Ok(stats)
            }
            Err(err) => {
                tracing::error!("Frame failed: {}", err);
                self.abandon_frame();
                Err(err)
            }
        }
    }

    fn recover_and_render(&mut self, payload: &RenderPayload) -> RenderResult<FrameStats> {
        self.recover()?;
        self.render_frame(payload).map(|stats| FrameStats {
            recoveries: 1,
            ..stats
        })
    }

    fn recover(&mut self) -> RenderResult<()> {
        self.assembler.discard();
        // Handles from the lost device are meaningless; forget them.
        self.resources = None;
        self.continuous_redraw = false;
        self.state = BackendState::Lost;
        self.device.recreate()?;
        self.initialize()
    }

    fn render_frame(&mut self, payload: &RenderPayload) -> RenderResult<FrameStats> {
        self.state = BackendState::Rendering;
        self.assembler.discard();
        self.assembler.take_stats();
        self.cache.take_stats();

        let Self {
            device,
            rasterizer,
            config,
            strategies,
            resources,
            cache,
            assembler,
            rows,
            placements,
            font_generation,
            epoch,
            clock,
            bound_generations,
            continuous_redraw,
            ..
        } = self;
        let device: &mut dyn GraphicsDevice = device.as_mut();
        // Only a lost device leaves a live backend without resources.
        let resources = resources.as_mut().ok_or(RenderError::DeviceLost)?;
        let settings = &payload.settings;
        let atlas_before = resources.atlas_stats();
        let mut stats = FrameStats::default();

        if font_generation.is_some_and(|generation| generation != settings.font.generation) {
            tracing::debug!("Font generation changed, resetting glyph atlases");
            resources.atlases.coverage.reset(&mut *device)?;
            resources.atlases.color.reset(&mut *device)?;
            placements.clear();
        }
        *font_generation = Some(settings.font.generation);

        if rows.validate(
            payload.viewport,
            settings,
            resources.atlases.generations(),
            *epoch,
        ) {
            tracing::debug!("Row cache invalidated");
        }
        rows.resize(payload.rows.len());

        // Constant blocks
        let columns = payload.rows.iter().map(|row| row.cells.len()).max().unwrap_or(0);
        let frame = FrameConstants::new(
            payload.viewport,
            settings,
            columns,
            payload.rows.len(),
            clock.elapsed().as_secs_f32(),
        );
        let blinking = payload.cursor.as_ref().is_some_and(|cursor| cursor.blinking);
        let palette = PaletteConstants::new(
            settings,
            strategies.subpixel == SubpixelPath::GrayscaleFallback,
            blinking,
        );
        device.write_uniforms(UniformBlock::Frame, bytemuck::bytes_of(&frame))?;
        device.write_uniforms(UniformBlock::Palette, bytemuck::bytes_of(&palette))?;

        // Walk the payload, restarting once per atlas that had to reset.
        let mut resolver = GlyphResolver {
            device: &mut *device,
            rasterizer: rasterizer.as_mut(),
            atlases: &mut resources.atlases,
            placements: &mut *placements,
            subpixel: strategies.subpixel,
            glyphs_inserted: 0,
        };
        let mut reset_units = [false; 2];
        loop {
            match walk_rows(&mut resolver, rows, payload) {
                Ok(rebuilt) => {
                    stats.rows_rebuilt += rebuilt;
                    break;
                }
                Err(WalkError::AtlasFull(unit)) if !reset_units[unit as usize] => {
                    tracing::warn!("{:?} atlas overflowed and was reset, rebuilding rows", unit);
                    reset_units[unit as usize] = true;
                    rows.invalidate();
                }
                Err(WalkError::AtlasFull(unit)) => {
                    return Err(RenderError::ResourceExhausted(format!(
                        "{:?} atlas is still full after a reset",
                        unit
                    )));
                }
                Err(WalkError::Render(err)) => return Err(err),
            }
        }
        stats.glyphs_inserted = resolver.glyphs_inserted;

        resources.atlases.coverage.commit(&mut *device)?;
        resources.atlases.color.commit(&mut *device)?;
        let generations = resources.atlases.generations();
        rows.settle(generations);

        device.begin_frame(&FrameTarget {
            width: payload.viewport.width,
            height: payload.viewport.height,
            clear: config.clear_color.to_premultiplied_array(),
        })?;

        // Replaced atlas textures leave stale handles in the cache.
        if *bound_generations != Some(generations) {
            cache.reset();
            *bound_generations = Some(generations);
        }
        cache.set_program(&mut *device, resources.program)?;
        cache.set_blend(&mut *device, resources.blend)?;
        for (unit, atlas) in [
            (AtlasUnit::Coverage, &resources.atlases.coverage),
            (AtlasUnit::Color, &resources.atlases.color),
        ] {
            let texture = atlas.texture().ok_or(RenderError::Released)?;
            cache.bind_texture(&mut *device, unit as u32, texture)?;
        }

        let selection = rows::selection_layer(&payload.rows, &payload.selection, settings);
        let mut cursor_records = Vec::new();
        if let Some(cursor) = &payload.cursor {
            cursor_records = rows::cursor_layer(&payload.rows, cursor, settings);
            // A blinking cursor is hidden half the time; its glyphs keep their color.
            let blink_active =
                cursor.blinking && settings.effects.contains(EffectFlags::BLINK_CURSOR);
            if let Some(layers) = rows.get(cursor.row).filter(|_| !blink_active) {
                let color = rows::cursor_text_color(&payload.rows, cursor, settings);
                let foreground = rows::cursor_foreground(&cursor_records, &layers.text, color);
                cursor_records.extend(foreground);
            }
        }
        let cursor_animated = blinking
            && cursor_records.iter().any(|record| {
                record
                    .mode()
                    .is_some_and(|mode| mode.is_time_varying(settings.effects))
                    && rows::on_screen(record, payload.viewport)
            });

        let mut sink = DeviceSink {
            device: &mut *device,
            streamer: &mut resources.streamer,
            draw_calls: 0,
        };
        {
            profile_scope!("emit_layers");
            for layer in Layer::ORDER {
                match layer {
                    Layer::Background => {
                        for row in rows.rows() {
                            assembler.extend(&row.background, &mut sink)?;
                        }
                    }
                    Layer::Text => {
                        for row in rows.rows() {
                            assembler.extend(&row.text, &mut sink)?;
                        }
                    }
                    Layer::Decoration => {
                        for row in rows.rows() {
                            assembler.extend(&row.decoration, &mut sink)?;
                        }
                    }
                    Layer::Selection => assembler.extend(&selection, &mut sink)?,
                    Layer::Cursor => assembler.extend(&cursor_records, &mut sink)?,
                }
            }
            assembler.flush(&mut sink)?;
        }
        stats.draw_calls = sink.draw_calls;

        device.present()?;
        resources.streamer.end_frame(&mut *device)?;

        let batch = assembler.take_stats();
        stats.instances = batch.instances;
        stats.flushes = batch.flushes;
        let state = cache.take_stats();
        stats.state_changes = state.applied;
        stats.redundant_state_skips = state.skipped;
        let atlas_after = resources.atlas_stats();
        stats.atlas_grows = (atlas_after.0.grows + atlas_after.1.grows)
            - (atlas_before.0.grows + atlas_before.1.grows);
        stats.atlas_resets = (atlas_after.0.resets + atlas_after.1.resets)
            - (atlas_before.0.resets + atlas_before.1.resets);

        *continuous_redraw = rows.animated(settings.effects) || cursor_animated;

        self.state = BackendState::Ready;
        Ok(stats)
    }

    /// Drop a partially assembled frame without drawing it.
    pub fn abandon_frame(&mut self) {
        self.assembler.discard();
        self.assembler.take_stats();
        self.cache.take_stats();
        if let Some(resources) = self.resources.as_mut() {
            resources.streamer.abandon_frame();
        }
        if self.state == BackendState::Rendering {
            self.state = BackendState::Ready;
        }
    }

    /// Destroy every device object. Idempotent; [`render`](Self::render)
    /// fails with [`RenderError::Released`] afterwards.
    pub fn release_resources(&mut self) {
        if self.state == BackendState::Released {
            return;
        }
        self.assembler.discard();
        if let Some(resources) = self.resources.take() {
            resources.release(self.device.as_mut());
        }
        self.rows.clear();
        self.placements.clear();
        self.cache.reset();
        self.continuous_redraw = false;
        self.state = BackendState::Released;
        tracing::info!("Renderer resources released");
    }

    /// Whether the last frame contained an active time-varying instance
    /// (animated line patterns or a blinking cursor).
    pub fn requires_continuous_redraw(&self) -> bool {
        self.continuous_redraw
    }

    /// Capability snapshot of the current device.
    pub fn feature_set(&self) -> FeatureSet {
        self.features
    }

    pub fn strategies(&self) -> ResolvedStrategies {
        self.strategies
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn last_stats(&self) -> FrameStats {
        self.last_stats
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn device(&self) -> &dyn GraphicsDevice {
        self.device.as_ref()
    }

    /// Glyph keys with a cached placement, including blank glyphs.
    pub fn cached_glyphs(&self) -> usize {
        self.placements.len()
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.release_resources();
    }
}

fn create_atlases(
    device: &mut dyn GraphicsDevice,
    strategies: &ResolvedStrategies,
    initial_size: u32,
    max_size: u32,
) -> DeviceResult<AtlasPair> {
    let mut coverage = GlyphAtlas::new(
        device,
        "Coverage Atlas",
        TextureFormat::R8,
        strategies.atlas_upload,
        initial_size,
        max_size,
    )?;
    match GlyphAtlas::new(
        device,
        "Color Atlas",
        TextureFormat::Rgba8,
        strategies.atlas_upload,
        initial_size,
        max_size,
    ) {
        Ok(color) => Ok(AtlasPair { coverage, color }),
        Err(err) => {
            coverage.release(device);
            Err(err)
        }
    }
}

/// Rebuild dirty and uncached rows. Returns how many were rebuilt.
fn walk_rows(
    resolver: &mut GlyphResolver<'_>,
    rows: &mut RowCache,
    payload: &RenderPayload,
) -> Result<u32, WalkError> {
    profile_scope!("walk_rows");
    let mut rebuilt = 0;
    for (index, row) in payload.rows.iter().enumerate() {
        if rows.needs_build(index, payload.dirty.contains(index)) {
            let layers =
                rows::build_row(resolver, &payload.settings, payload.viewport, index, row)?;
            rows.store(index, layers);
            rebuilt += 1;
        }
    }
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cellgrid_core::geometry::Size;
    use cellgrid_gpu::{Capabilities, FeatureLevel, MockDevice, MockProbe};

    use super::*;
    use crate::capability::{CapabilityFloor, StreamStrategyKind};
    use crate::payload::{
        CursorShape, CursorState, DirtyRegion, EffectFlags, FontMetrics, GlyphContent, GlyphId,
        GlyphKey, RasterizedGlyph, UnderlineStyle,
    };

    /// Solid 4×4 coverage for every glyph.
    struct Boxes;

    impl GlyphRasterizer for Boxes {
        fn rasterize(&mut self, _key: GlyphKey, _metrics: &FontMetrics) -> Option<RasterizedGlyph> {
            Some(RasterizedGlyph {
                width: 4,
                height: 4,
                offset: (1, 2),
                content: GlyphContent::Coverage,
                pixels: vec![0xFF; 16],
            })
        }
    }

    fn mock_backend(config: RendererConfig) -> (Backend, MockProbe) {
        let (device, probe) = MockDevice::new();
        let backend = Backend::new(Box::new(device), Box::new(Boxes), config).unwrap();
        (backend, probe)
    }

    fn payload(columns: usize, rows: usize) -> RenderPayload {
        RenderPayload::blank(Size::new(90, 36), columns, rows)
    }

    fn with_text(mut payload: RenderPayload) -> RenderPayload {
        for (i, cell) in payload.rows[0].cells.iter_mut().enumerate() {
            cell.glyph = Some(GlyphId::new(0, i as u32));
        }
        payload
    }

    #[test]
    fn test_capability_floor_rejects_device() {
        let (device, _probe) = MockDevice::with_features(FeatureSet::new(
            FeatureLevel::Downlevel,
            Capabilities::empty(),
            2048,
        ));
        let config =
            RendererConfig::default().with_capability_floor(CapabilityFloor {
                min_level: FeatureLevel::Full,
                min_texture_dimension: 0,
            });
        let result = Backend::new(Box::new(device), Box::new(Boxes), config);
        assert!(matches!(result, Err(RenderError::CapabilityFloor { .. })));
    }

    #[test]
    fn test_shader_failure_is_fatal() {
        let (device, probe) = MockDevice::new();
        probe.fail_next_program("expected ';'");
        let result = Backend::new(Box::new(device), Box::new(Boxes), RendererConfig::default());
        assert!(matches!(result, Err(RenderError::ShaderBuild { .. })));
        assert_eq!(probe.live_resources(), 0);
    }

    #[test]
    fn test_render_draws_background_once_merged() {
        let (mut backend, probe) = mock_backend(RendererConfig::default());
        let stats = backend.render(&payload(10, 2)).unwrap();

        // Identical backgrounds merge into one record per row.
        assert_eq!(stats.instances, 2);
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(probe.count_presents(), 1);
        assert_eq!(backend.state(), BackendState::Ready);
    }

    #[test]
    fn test_redundant_state_is_skipped() {
        let (mut backend, probe) = mock_backend(RendererConfig::default());
        backend.render(&payload(4, 1)).unwrap();
        backend.render(&payload(4, 1)).unwrap();

        assert_eq!(probe.count_set_program(), 1);
        assert_eq!(probe.count_set_blend(), 1);
        assert_eq!(probe.count_bind_texture(), 2);
        assert!(backend.last_stats().redundant_state_skips >= 4);
    }

    #[test]
    fn test_glyphs_are_inserted_once() {
        let (mut backend, _probe) = mock_backend(RendererConfig::default());
        let frame = with_text(payload(6, 1));

        let first = backend.render(&frame).unwrap();
        assert_eq!(first.glyphs_inserted, 6);
        assert_eq!(first.rows_rebuilt, 1);

        let dirty = RenderPayload {
            dirty: DirtyRegion::All,
            ..frame
        };
        let second = backend.render(&dirty).unwrap();
        assert_eq!(second.glyphs_inserted, 0);
        assert_eq!(second.rows_rebuilt, 1);
        assert_eq!(backend.cached_glyphs(), 6);
    }

    #[test]
    fn test_clean_rows_are_reused() {
        let (mut backend, _probe) = mock_backend(RendererConfig::default());
        let mut frame = payload(4, 3);
        backend.render(&frame).unwrap();

        frame.dirty = DirtyRegion::Rows(1..2);
        let stats = backend.render(&frame).unwrap();
        assert_eq!(stats.rows_rebuilt, 1);
        assert_eq!(stats.instances, 3);
    }

    #[test]
    fn test_font_change_resets_atlases() {
        let (mut backend, _probe) = mock_backend(RendererConfig::default());
        let mut frame = with_text(payload(3, 1));
        backend.render(&frame).unwrap();

        frame.settings.font.generation += 1;
        let stats = backend.render(&frame).unwrap();
        assert_eq!(stats.atlas_resets, 2);
        assert_eq!(stats.glyphs_inserted, 3);
    }

    /// Coverage glyphs for even indices, color glyphs for odd ones.
    struct Mixed;

    impl GlyphRasterizer for Mixed {
        fn rasterize(&mut self, key: GlyphKey, _metrics: &FontMetrics) -> Option<RasterizedGlyph> {
            let (content, bytes) = if key.glyph_index % 2 == 0 {
                (GlyphContent::Coverage, 16)
            } else {
                (GlyphContent::Color, 64)
            };
            Some(RasterizedGlyph {
                width: 4,
                height: 4,
                offset: (0, 0),
                content,
                pixels: vec![0xFF; bytes],
            })
        }
    }

    #[test]
    fn test_each_atlas_may_reset_once_per_frame() {
        let (device, _probe) = MockDevice::new();
        let config = RendererConfig::default().with_atlas_size(16, 16);
        let mut backend = Backend::new(Box::new(device), Box::new(Mixed), config).unwrap();
        let frame = |first: u32| {
            let mut payload = payload(16, 1);
            for (i, cell) in payload.rows[0].cells.iter_mut().enumerate() {
                cell.glyph = Some(GlyphId::new(0, first + i as u32));
            }
            payload
        };

        let stats = backend.render(&frame(0)).unwrap();
        assert_eq!(stats.atlas_resets, 0);

        // Both atlases overflow while walking the same frame.
        let stats = backend.render(&frame(16)).unwrap();
        assert_eq!(stats.atlas_resets, 2);
        assert_eq!(backend.cached_glyphs(), 16);
    }

    #[test]
    fn test_device_loss_recovers_once() {
        let (mut backend, probe) = mock_backend(RendererConfig::default());
        backend.render(&payload(4, 1)).unwrap();

        probe.lose_device();
        let stats = backend.render(&payload(4, 1)).unwrap();
        assert_eq!(stats.recoveries, 1);
        assert_eq!(probe.count(|c| matches!(c, cellgrid_gpu::DeviceCall::Recreate)), 1);
        assert_eq!(backend.state(), BackendState::Ready);
    }

    #[test]
    fn test_fence_timeout_surfaces() {
        let config = RendererConfig::default()
            .with_stream_strategy(StreamStrategyKind::Persistent)
            .with_frames_in_flight(1)
            .with_fence_timeout(Duration::from_millis(5));
        let (mut backend, probe) = mock_backend(config);
        assert_eq!(backend.strategies().stream, StreamStrategyKind::Persistent);
        backend.render(&payload(4, 1)).unwrap();

        probe.set_fences_time_out(true);
        assert!(matches!(
            backend.render(&payload(4, 1)),
            Err(RenderError::ResourceTimeout { .. })
        ));
        assert_eq!(backend.state(), BackendState::Ready);

        probe.set_fences_time_out(false);
        assert!(backend.render(&payload(4, 1)).is_ok());
    }

    #[test]
    fn test_release_is_idempotent() {
        let (mut backend, probe) = mock_backend(RendererConfig::default());
        backend.render(&with_text(payload(4, 1))).unwrap();

        backend.release_resources();
        backend.release_resources();
        assert_eq!(probe.live_resources(), 0);
        assert_eq!(backend.state(), BackendState::Released);
        assert_eq!(backend.render(&payload(4, 1)), Err(RenderError::Released));
    }

    #[test]
    fn test_drop_releases() {
        let (backend, probe) = mock_backend(RendererConfig::default());
        assert!(probe.live_resources() > 0);
        drop(backend);
        assert_eq!(probe.live_resources(), 0);
    }

    #[test]
    fn test_continuous_redraw() {
        let (mut backend, _probe) = mock_backend(RendererConfig::default());
        let mut frame = payload(4, 1);
        frame.rows[0].cells[1].decoration.underline = UnderlineStyle::Curly;

        backend.render(&frame).unwrap();
        assert!(!backend.requires_continuous_redraw());

        frame.settings.effects = EffectFlags::ANIMATE_LINES;
        backend.render(&frame).unwrap();
        assert!(backend.requires_continuous_redraw());

        frame.rows[0].cells[1].decoration.underline = UnderlineStyle::Single;
        frame.settings.effects = EffectFlags::BLINK_CURSOR;
        frame.dirty = DirtyRegion::All;
        frame.cursor = Some(CursorState {
            row: 0,
            col: 0,
            shape: CursorShape::Block,
            color: crate::color::Rgba::WHITE,
            blinking: true,
        });
        backend.render(&frame).unwrap();
        assert!(backend.requires_continuous_redraw());

        frame.cursor = None;
        backend.render(&frame).unwrap();
        assert!(!backend.requires_continuous_redraw());
    }

    #[test]
    fn test_large_frame_splits_batches() {
        let config = RendererConfig::default().with_batch_capacity(64);
        let (mut backend, probe) = mock_backend(config);
        let mut frame = payload(40, 10);
        // Alternate colors so backgrounds do not merge.
        for row in &mut frame.rows {
            for (i, cell) in row.cells.iter_mut().enumerate() {
                if i % 2 == 1 {
                    cell.bg = crate::color::Rgba::RED;
                }
            }
        }

        let stats = backend.render(&frame).unwrap();
        assert_eq!(stats.instances, 400);
        assert_eq!(stats.draw_calls, 7);
        assert_eq!(probe.drawn_instances(), 400);
    }
}
