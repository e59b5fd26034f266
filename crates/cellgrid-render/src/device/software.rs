//! CPU reference device.
//!
//! Every draw runs [`shading::shade`] per covered pixel and blends into an
//! RGBA8 color target exactly as fixed-function hardware would. GPU work is
//! synchronous, so fences are signaled as soon as they are inserted.

use std::time::Duration;

use cellgrid_core::alloc::HashMap;
use cellgrid_gpu::{
    BlendConfig, BlendFactor, BlendOp, BufferDesc, BufferId, BufferUsage, Capabilities,
    DeviceError, DeviceResult, DeviceStatus, FeatureLevel, FeatureSet, FenceId, FenceStatus,
    FrameTarget, GraphicsApi, GraphicsDevice, ProgramDesc, ProgramId, TextureDesc, TextureFormat,
    TextureId, TextureRegion, UniformBlock,
};

use super::FrameCapture;
use crate::instance::{AtlasUnit, InstanceRecord};
use crate::shading::{self, FrameConstants, PaletteConstants, TexelSource};

const MAX_TEXTURE_DIMENSION: u32 = 8192;

struct SoftTexture {
    width: u32,
    height: u32,
    format: TextureFormat,
    data: Vec<u8>,
}

impl SoftTexture {
    fn texel(&self, x: i32, y: i32) -> [f32; 4] {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return [0.0; 4];
        }
        let bpp = self.format.bytes_per_pixel() as usize;
        let start = (y as usize * self.width as usize + x as usize) * bpp;
        match self.format {
            TextureFormat::R8 => [self.data[start] as f32 / 255.0, 0.0, 0.0, 1.0],
            TextureFormat::Rgba8 => {
                let t = &self.data[start..start + 4];
                [
                    t[0] as f32 / 255.0,
                    t[1] as f32 / 255.0,
                    t[2] as f32 / 255.0,
                    t[3] as f32 / 255.0,
                ]
            }
        }
    }
}

struct BoundAtlases<'a> {
    coverage: Option<&'a SoftTexture>,
    color: Option<&'a SoftTexture>,
}

impl TexelSource for BoundAtlases<'_> {
    fn load(&self, unit: AtlasUnit, x: i32, y: i32) -> [f32; 4] {
        let texture = match unit {
            AtlasUnit::Coverage => self.coverage,
            AtlasUnit::Color => self.color,
        };
        texture.map_or([0.0; 4], |t| t.texel(x, y))
    }
}

struct Target {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

/// CPU rasterizer implementing [`GraphicsDevice`].
///
/// # Example
///
/// ```rust
/// use cellgrid_render::device::SoftwareDevice;
///
/// let device = SoftwareDevice::new();
/// let capture = device.capture();
/// assert_eq!(capture.presents(), 0);
/// ```
pub struct SoftwareDevice {
    features: FeatureSet,
    capture: FrameCapture,
    next_id: u32,
    next_fence: u64,
    buffers: HashMap<u32, Vec<u8>>,
    textures: HashMap<u32, SoftTexture>,
    programs: HashMap<u32, bool>,
    program: Option<ProgramId>,
    bound: [Option<TextureId>; 4],
    blend: BlendConfig,
    frame: FrameConstants,
    palette: PaletteConstants,
    target: Option<Target>,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDevice {
    /// Features: `Full` with persistent mapping, direct resource access,
    /// multi-draw and debug output.
    pub fn new() -> Self {
        Self::with_features(FeatureSet::new(
            FeatureLevel::Full,
            Capabilities::PERSISTENT_MAPPING
                | Capabilities::DIRECT_RESOURCE_ACCESS
                | Capabilities::MULTI_DRAW
                | Capabilities::DEBUG_OUTPUT,
            MAX_TEXTURE_DIMENSION,
        ))
    }

    /// Report `features` instead, e.g. to exercise a fallback path or to
    /// enable dual-source blending.
    pub fn with_features(features: FeatureSet) -> Self {
        Self {
            features,
            capture: FrameCapture::new(),
            next_id: 1,
            next_fence: 1,
            buffers: HashMap::default(),
            textures: HashMap::default(),
            programs: HashMap::default(),
            program: None,
            bound: [None; 4],
            blend: BlendConfig::default(),
            frame: FrameConstants::default(),
            palette: PaletteConstants::default(),
            target: None,
        }
    }

    /// Handle to the presented frames.
    pub fn capture(&self) -> FrameCapture {
        self.capture.clone()
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer_mut(&mut self, buffer: BufferId) -> DeviceResult<&mut Vec<u8>> {
        self.buffers
            .get_mut(&buffer.raw())
            .ok_or(DeviceError::InvalidHandle("buffer"))
    }

    fn write(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let store = self.buffer_mut(buffer)?;
        let start = offset as usize;
        let end = start + data.len();
        let dst = store
            .get_mut(start..end)
            .ok_or_else(|| DeviceError::Backend(format!("buffer write {}..{} out of range", start, end)))?;
        dst.copy_from_slice(data);
        Ok(())
    }
}

fn blend_factor(factor: BlendFactor, src: &[f32; 4], src1: &[f32; 4], channel: usize) -> f32 {
    match factor {
        BlendFactor::Zero => 0.0,
        BlendFactor::One => 1.0,
        BlendFactor::SrcAlpha => src[3],
        BlendFactor::OneMinusSrcAlpha => 1.0 - src[3],
        BlendFactor::Src1 => src1[channel],
        BlendFactor::OneMinusSrc1 => 1.0 - src1[channel],
    }
}

fn blend_pixel(config: BlendConfig, src: [f32; 4], src1: [f32; 4], dst: &mut [u8]) {
    for channel in 0..4 {
        let d = dst[channel] as f32 / 255.0;
        let s = src[channel];
        let sf = blend_factor(config.src, &src, &src1, channel);
        let df = blend_factor(config.dst, &src, &src1, channel);
        let out = match config.op {
            BlendOp::Add => s * sf + d * df,
            BlendOp::Subtract => s * sf - d * df,
            BlendOp::ReverseSubtract => d * df - s * sf,
            BlendOp::Min => s.min(d),
            BlendOp::Max => s.max(d),
        };
        dst[channel] = (out.clamp(0.0, 1.0) * 255.0).round() as u8;
    }
}

impl GraphicsDevice for SoftwareDevice {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Software
    }

    fn features(&self) -> FeatureSet {
        self.features
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::Ready
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferId> {
        if desc.usage.contains(BufferUsage::PERSISTENT) && !self.features.persistent_mapping() {
            return Err(DeviceError::Unsupported("persistent mapping"));
        }
        let id = BufferId::from_raw(self.next_id());
        self.buffers.insert(id.raw(), vec![0; desc.size as usize]);
        Ok(id)
    }

    fn orphan_buffer(&mut self, buffer: BufferId) -> DeviceResult<()> {
        // Draws complete synchronously, so the old contents are already consumed.
        self.buffer_mut(buffer).map(|_| ())
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        self.write(buffer, offset, data)
    }

    fn map_persistent(&mut self, buffer: BufferId) -> DeviceResult<()> {
        if !self.features.persistent_mapping() {
            return Err(DeviceError::Unsupported("persistent mapping"));
        }
        self.buffer_mut(buffer).map(|_| ())
    }

    fn write_mapped(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        self.write(buffer, offset, data)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer.raw());
    }

    fn insert_fence(&mut self) -> DeviceResult<FenceId> {
        let id = FenceId::from_raw(self.next_fence);
        self.next_fence += 1;
        Ok(id)
    }

    fn wait_fence(&mut self, fence: FenceId, _timeout: Duration) -> DeviceResult<FenceStatus> {
        if fence.raw() >= self.next_fence {
            return Err(DeviceError::InvalidHandle("fence"));
        }
        Ok(FenceStatus::Signaled)
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> DeviceResult<TextureId> {
        let max = self.features.max_texture_dimension;
        if desc.width > max || desc.height > max {
            return Err(DeviceError::OutOfMemory {
                what: format!("{} ({}x{})", desc.label, desc.width, desc.height),
            });
        }
        let id = TextureId::from_raw(self.next_id());
        let len = desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel() as usize;
        self.textures.insert(
            id.raw(),
            SoftTexture {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                data: vec![0; len],
            },
        );
        Ok(id)
    }

    fn write_texture(
        &mut self,
        texture: TextureId,
        region: TextureRegion,
        data: &[u8],
        bytes_per_row: u32,
    ) -> DeviceResult<()> {
        let tex = self
            .textures
            .get_mut(&texture.raw())
            .ok_or(DeviceError::InvalidHandle("texture"))?;
        if region.x + region.width > tex.width || region.y + region.height > tex.height {
            return Err(DeviceError::Backend("texture write out of bounds".into()));
        }
        let bpp = tex.format.bytes_per_pixel() as usize;
        let row_bytes = region.width as usize * bpp;
        for row in 0..region.height as usize {
            let src_start = row * bytes_per_row as usize;
            let src = data
                .get(src_start..src_start + row_bytes)
                .ok_or_else(|| DeviceError::Backend("texture data too short".into()))?;
            let dst_start =
                ((region.y as usize + row) * tex.width as usize + region.x as usize) * bpp;
            tex.data[dst_start..dst_start + row_bytes].copy_from_slice(src);
        }
        Ok(())
    }

    fn copy_texture(
        &mut self,
        src: TextureId,
        dst: TextureId,
        width: u32,
        height: u32,
    ) -> DeviceResult<()> {
        let (rows, bpp, src_width) = {
            let source = self
                .textures
                .get(&src.raw())
                .ok_or(DeviceError::InvalidHandle("texture"))?;
            let bpp = source.format.bytes_per_pixel() as usize;
            let w = width.min(source.width) as usize;
            let h = height.min(source.height) as usize;
            let rows: Vec<Vec<u8>> = (0..h)
                .map(|y| {
                    let start = y * source.width as usize * bpp;
                    source.data[start..start + w * bpp].to_vec()
                })
                .collect();
            (rows, bpp, w)
        };
        let target = self
            .textures
            .get_mut(&dst.raw())
            .ok_or(DeviceError::InvalidHandle("texture"))?;
        if src_width as u32 > target.width || rows.len() as u32 > target.height {
            return Err(DeviceError::Backend("texture copy out of bounds".into()));
        }
        for (y, row) in rows.iter().enumerate() {
            let start = y * target.width as usize * bpp;
            target.data[start..start + row.len()].copy_from_slice(row);
        }
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture.raw());
        for slot in &mut self.bound {
            if *slot == Some(texture) {
                *slot = None;
            }
        }
    }

    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> DeviceResult<ProgramId> {
        if desc.dual_source && !self.features.dual_source_blending() {
            return Err(DeviceError::Unsupported("dual-source blending"));
        }
        for entry in [desc.vertex_entry, desc.fragment_entry] {
            if !desc.source.contains(&format!("fn {}(", entry)) {
                return Err(DeviceError::ShaderBuild {
                    label: desc.label.to_string(),
                    diagnostics: format!("entry point '{}' not found", entry),
                });
            }
        }
        let id = ProgramId::from_raw(self.next_id());
        self.programs.insert(id.raw(), desc.dual_source);
        tracing::debug!("Software program '{}' created", desc.label);
        Ok(id)
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program.raw());
        if self.program == Some(program) {
            self.program = None;
        }
    }

    fn set_program(&mut self, program: ProgramId) -> DeviceResult<()> {
        if !self.programs.contains_key(&program.raw()) {
            return Err(DeviceError::InvalidHandle("program"));
        }
        self.program = Some(program);
        Ok(())
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureId) -> DeviceResult<()> {
        if !self.textures.contains_key(&texture.raw()) {
            return Err(DeviceError::InvalidHandle("texture"));
        }
        let slot = self
            .bound
            .get_mut(unit as usize)
            .ok_or(DeviceError::Unsupported("texture unit out of range"))?;
        *slot = Some(texture);
        Ok(())
    }

    fn set_blend(&mut self, blend: BlendConfig) -> DeviceResult<()> {
        if blend.uses_dual_source() && !self.features.dual_source_blending() {
            return Err(DeviceError::Unsupported("dual-source blending"));
        }
        self.blend = blend;
        Ok(())
    }

    fn write_uniforms(&mut self, block: UniformBlock, data: &[u8]) -> DeviceResult<()> {
        let invalid = |_| DeviceError::Backend(format!("malformed {:?} uniform block", block));
        match block {
            UniformBlock::Frame => self.frame = bytemuck::try_pod_read_unaligned(data).map_err(invalid)?,
            UniformBlock::Palette => {
                self.palette = bytemuck::try_pod_read_unaligned(data).map_err(invalid)?
            }
        }
        Ok(())
    }

    fn begin_frame(&mut self, target: &FrameTarget) -> DeviceResult<()> {
        let clear = target.clear.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        let count = target.width as usize * target.height as usize;
        let pixels = clear.iter().copied().cycle().take(count * 4).collect();
        self.target = Some(Target {
            width: target.width,
            height: target.height,
            pixels,
        });
        Ok(())
    }

    fn draw_instances(&mut self, buffer: BufferId, offset: u64, count: u32) -> DeviceResult<()> {
        let dual_source = match self.program {
            Some(program) => self.programs.get(&program.raw()).copied().unwrap_or(false),
            None => return Err(DeviceError::Backend("draw without a program".into())),
        };
        let bytes = self
            .buffers
            .get(&buffer.raw())
            .ok_or(DeviceError::InvalidHandle("buffer"))?;
        let mut target = self
            .target
            .take()
            .ok_or_else(|| DeviceError::Backend("draw outside begin_frame/present".into()))?;

        let textures = &self.textures;
        let bound = |unit: AtlasUnit| self.bound[unit as usize].and_then(|id| textures.get(&id.raw()));
        let atlases = BoundAtlases {
            coverage: bound(AtlasUnit::Coverage),
            color: bound(AtlasUnit::Color),
        };

        for i in 0..count as usize {
            let start = offset as usize + i * InstanceRecord::SIZE;
            let Some(record) = bytes.get(start..).and_then(InstanceRecord::from_bytes) else {
                self.target = Some(target);
                return Err(DeviceError::Backend(format!(
                    "instance {} reads past the end of the buffer",
                    i
                )));
            };

            let x0 = (record.position[0] as i32).max(0);
            let y0 = (record.position[1] as i32).max(0);
            let x1 = (record.position[0] as i32 + record.size[0] as i32).min(target.width as i32);
            let y1 = (record.position[1] as i32 + record.size[1] as i32).min(target.height as i32);

            for y in y0..y1 {
                for x in x0..x1 {
                    let fragment = shading::shade(
                        &record,
                        [x as f32 + 0.5, y as f32 + 0.5],
                        &self.frame,
                        &self.palette,
                        &atlases,
                    );
                    let weights = if dual_source {
                        fragment.weights
                    } else {
                        [fragment.color[3]; 4]
                    };
                    let index = (y as usize * target.width as usize + x as usize) * 4;
                    blend_pixel(
                        self.blend,
                        fragment.color,
                        weights,
                        &mut target.pixels[index..index + 4],
                    );
                }
            }
        }

        self.target = Some(target);
        Ok(())
    }

    fn present(&mut self) -> DeviceResult<()> {
        let target = self
            .target
            .take()
            .ok_or_else(|| DeviceError::Backend("present without begin_frame".into()))?;
        self.capture.store(target.width, target.height, target.pixels);
        Ok(())
    }

    fn recreate(&mut self) -> DeviceResult<()> {
        self.buffers.clear();
        self.textures.clear();
        self.programs.clear();
        self.program = None;
        self.bound = [None; 4];
        self.blend = BlendConfig::default();
        self.target = None;
        tracing::info!("Software device recreated");
        Ok(())
    }
}
