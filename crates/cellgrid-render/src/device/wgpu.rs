//! wgpu-backed [`GraphicsDevice`].
//!
//! Rendering goes to an offscreen `Rgba8Unorm` target. Each draw call is one
//! render pass submitted immediately, so buffer writes queued between draws
//! land in submission order and orphaning never races a pending read.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cellgrid_core::alloc::HashMap;
use cellgrid_core::profiling::profile_function;
use cellgrid_gpu::{
    BlendConfig, BlendFactor, BlendOp, BufferDesc, BufferId, BufferUsage, DeviceError,
    DeviceResult, DeviceStatus, FeatureSet, FenceId, FenceStatus, FrameTarget, GraphicsApi,
    GraphicsDevice, ProgramDesc, ProgramId, TextureDesc, TextureFormat, TextureId, TextureRegion,
    UniformBlock,
};

use super::FrameCapture;
use crate::context::{GraphicsContext, GraphicsContextDescriptor};
use crate::error::RenderResult;
use crate::instance::InstanceRecord;
use crate::shading::{FrameConstants, PaletteConstants};
use crate::state_cache::MAX_TEXTURE_UNITS;

const TARGET_FORMAT: ::wgpu::TextureFormat = ::wgpu::TextureFormat::Rgba8Unorm;
/// Texture units the program samples: coverage then color.
const SAMPLED_UNITS: usize = 2;

struct GpuBuffer {
    buffer: ::wgpu::Buffer,
    desc: BufferDesc,
    mapped: bool,
}

struct GpuTexture {
    texture: ::wgpu::Texture,
    view: ::wgpu::TextureView,
}

struct GpuProgram {
    module: ::wgpu::ShaderModule,
    label: String,
    vertex_entry: String,
    fragment_entry: String,
}

struct Target {
    texture: ::wgpu::Texture,
    view: ::wgpu::TextureView,
    width: u32,
    height: u32,
}

/// Bind group layout, pipeline layout, uniform buffers and placeholder
/// textures. Rebuilt with the device on recovery.
struct Shared {
    bind_group_layout: ::wgpu::BindGroupLayout,
    pipeline_layout: ::wgpu::PipelineLayout,
    frame_uniforms: ::wgpu::Buffer,
    palette_uniforms: ::wgpu::Buffer,
    placeholders: [GpuTexture; SAMPLED_UNITS],
}

impl Shared {
    fn new(device: &::wgpu::Device) -> Self {
        let texture_entry = |binding| ::wgpu::BindGroupLayoutEntry {
            binding,
            visibility: ::wgpu::ShaderStages::FRAGMENT,
            ty: ::wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: ::wgpu::TextureViewDimension::D2,
                sample_type: ::wgpu::TextureSampleType::Float { filterable: false },
            },
            count: None,
        };
        let uniform_entry = |binding| ::wgpu::BindGroupLayoutEntry {
            binding,
            visibility: ::wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: ::wgpu::BindingType::Buffer {
                ty: ::wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&::wgpu::BindGroupLayoutDescriptor {
            label: Some("Cell Grid Bind Group Layout"),
            entries: &[
                uniform_entry(UniformBlock::Frame.binding()),
                uniform_entry(UniformBlock::Palette.binding()),
                texture_entry(2),
                texture_entry(3),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&::wgpu::PipelineLayoutDescriptor {
            label: Some("Cell Grid Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let uniform_buffer = |label, size: usize| {
            device.create_buffer(&::wgpu::BufferDescriptor {
                label: Some(label),
                size: size as ::wgpu::BufferAddress,
                usage: ::wgpu::BufferUsages::UNIFORM | ::wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };

        Self {
            bind_group_layout,
            pipeline_layout,
            frame_uniforms: uniform_buffer("Frame Constants", size_of::<FrameConstants>()),
            palette_uniforms: uniform_buffer("Palette Constants", size_of::<PaletteConstants>()),
            placeholders: [
                create_texture(device, "Coverage Placeholder", 1, 1, TextureFormat::R8),
                create_texture(device, "Color Placeholder", 1, 1, TextureFormat::Rgba8),
            ],
        }
    }
}

fn wgpu_format(format: TextureFormat) -> ::wgpu::TextureFormat {
    match format {
        TextureFormat::R8 => ::wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rgba8 => ::wgpu::TextureFormat::Rgba8Unorm,
    }
}

fn create_texture(
    device: &::wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    format: TextureFormat,
) -> GpuTexture {
    let texture = device.create_texture(&::wgpu::TextureDescriptor {
        label: Some(label),
        size: ::wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: ::wgpu::TextureDimension::D2,
        format: wgpu_format(format),
        usage: ::wgpu::TextureUsages::TEXTURE_BINDING
            | ::wgpu::TextureUsages::COPY_DST
            | ::wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&::wgpu::TextureViewDescriptor::default());
    GpuTexture { texture, view }
}

fn blend_factor(factor: BlendFactor) -> ::wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => ::wgpu::BlendFactor::Zero,
        BlendFactor::One => ::wgpu::BlendFactor::One,
        BlendFactor::SrcAlpha => ::wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => ::wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::Src1 => ::wgpu::BlendFactor::Src1,
        BlendFactor::OneMinusSrc1 => ::wgpu::BlendFactor::OneMinusSrc1,
    }
}

/// Convert to a wgpu blend state. Min/max ignore their factors, which wgpu
/// requires to be `One`.
pub fn blend_state(config: BlendConfig) -> ::wgpu::BlendState {
    let component = match config.op {
        BlendOp::Min | BlendOp::Max => ::wgpu::BlendComponent {
            src_factor: ::wgpu::BlendFactor::One,
            dst_factor: ::wgpu::BlendFactor::One,
            operation: if config.op == BlendOp::Min {
                ::wgpu::BlendOperation::Min
            } else {
                ::wgpu::BlendOperation::Max
            },
        },
        op => ::wgpu::BlendComponent {
            src_factor: blend_factor(config.src),
            dst_factor: blend_factor(config.dst),
            operation: match op {
                BlendOp::Subtract => ::wgpu::BlendOperation::Subtract,
                BlendOp::ReverseSubtract => ::wgpu::BlendOperation::ReverseSubtract,
                _ => ::wgpu::BlendOperation::Add,
            },
        },
    };
    ::wgpu::BlendState {
        color: component,
        alpha: component,
    }
}

fn buffer_usages(usage: BufferUsage) -> ::wgpu::BufferUsages {
    let mut usages = ::wgpu::BufferUsages::COPY_DST;
    if usage.contains(BufferUsage::INSTANCE) {
        usages |= ::wgpu::BufferUsages::VERTEX;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        usages |= ::wgpu::BufferUsages::UNIFORM;
    }
    usages
}

/// [`GraphicsDevice`] over a wgpu adapter.
///
/// Persistent mapping is emulated with queue writes when the adapter reports
/// `MAPPABLE_PRIMARY_BUFFERS`; the renderer still fences each region, so the
/// ring discipline is identical to a native mapping.
pub struct WgpuDevice {
    descriptor: GraphicsContextDescriptor,
    context: GraphicsContext,
    features: FeatureSet,
    shared: Shared,
    lost: Arc<AtomicBool>,
    capture: FrameCapture,
    readback: bool,

    next_id: u32,
    next_fence: u64,
    buffers: HashMap<u32, GpuBuffer>,
    textures: HashMap<u32, GpuTexture>,
    programs: HashMap<u32, GpuProgram>,
    pipelines: HashMap<(u32, BlendConfig), ::wgpu::RenderPipeline>,
    bind_groups: HashMap<[Option<u32>; SAMPLED_UNITS], ::wgpu::BindGroup>,
    fences: HashMap<u64, ::wgpu::SubmissionIndex>,

    program: Option<ProgramId>,
    bound: [Option<TextureId>; MAX_TEXTURE_UNITS],
    blend: BlendConfig,
    target: Option<Target>,
    pending_clear: Option<::wgpu::Color>,
}

impl WgpuDevice {
    /// Acquire an adapter and device.
    pub fn new(descriptor: GraphicsContextDescriptor) -> RenderResult<Self> {
        let context = GraphicsContext::new_sync(descriptor.clone())?;
        Ok(Self::from_context(context, descriptor))
    }

    /// Wrap an existing context. `descriptor` is kept for [`recreate`](GraphicsDevice::recreate).
    pub fn from_context(context: GraphicsContext, descriptor: GraphicsContextDescriptor) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        watch_device_loss(&context.device, &lost);
        Self {
            features: context.feature_set(),
            shared: Shared::new(&context.device),
            descriptor,
            context,
            lost,
            capture: FrameCapture::new(),
            readback: false,
            next_id: 1,
            next_fence: 1,
            buffers: HashMap::default(),
            textures: HashMap::default(),
            programs: HashMap::default(),
            pipelines: HashMap::default(),
            bind_groups: HashMap::default(),
            fences: HashMap::default(),
            program: None,
            bound: [None; MAX_TEXTURE_UNITS],
            blend: BlendConfig::default(),
            target: None,
            pending_clear: None,
        }
    }

    /// Copy every presented frame back into [`capture`](Self::capture).
    pub fn with_readback(mut self) -> Self {
        self.readback = true;
        self
    }

    pub fn capture(&self) -> FrameCapture {
        self.capture.clone()
    }

    pub fn context(&self) -> &GraphicsContext {
        &self.context
    }

    /// The offscreen color target of the current frame, if any.
    pub fn target_view(&self) -> Option<&::wgpu::TextureView> {
        self.target.as_ref().map(|t| &t.view)
    }

    pub fn target_texture(&self) -> Option<&::wgpu::Texture> {
        self.target.as_ref().map(|t| &t.texture)
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_lost(&self) -> DeviceResult<()> {
        if self.lost.load(Ordering::Acquire) {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }

    fn buffer(&self, buffer: BufferId) -> DeviceResult<&GpuBuffer> {
        self.buffers
            .get(&buffer.raw())
            .ok_or(DeviceError::InvalidHandle("buffer"))
    }

    fn queue_write(&self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let entry = self.buffer(buffer)?;
        if offset + data.len() as u64 > entry.buffer.size() {
            return Err(DeviceError::Backend(format!(
                "buffer write {}..{} out of range",
                offset,
                offset + data.len() as u64
            )));
        }
        self.context.queue.write_buffer(&entry.buffer, offset, data);
        Ok(())
    }

    fn allocate_buffer(&self, desc: &BufferDesc) -> ::wgpu::Buffer {
        self.context.device.create_buffer(&::wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: desc.size.next_multiple_of(::wgpu::COPY_BUFFER_ALIGNMENT),
            usage: buffer_usages(desc.usage),
            mapped_at_creation: false,
        })
    }

    fn ensure_pipeline(&mut self, program: ProgramId) -> DeviceResult<(u32, BlendConfig)> {
        let key = (program.raw(), self.blend);
        if self.pipelines.contains_key(&key) {
            return Ok(key);
        }
        let entry = self
            .programs
            .get(&program.raw())
            .ok_or(DeviceError::InvalidHandle("program"))?;

        self.context
            .device
            .push_error_scope(::wgpu::ErrorFilter::Validation);
        let pipeline = self
            .context
            .device
            .create_render_pipeline(&::wgpu::RenderPipelineDescriptor {
                label: Some(entry.label.as_str()),
                layout: Some(&self.shared.pipeline_layout),
                vertex: ::wgpu::VertexState {
                    module: &entry.module,
                    entry_point: Some(entry.vertex_entry.as_str()),
                    buffers: &[InstanceRecord::vertex_layout()],
                    compilation_options: ::wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(::wgpu::FragmentState {
                    module: &entry.module,
                    entry_point: Some(entry.fragment_entry.as_str()),
                    targets: &[Some(::wgpu::ColorTargetState {
                        format: TARGET_FORMAT,
                        blend: Some(blend_state(self.blend)),
                        write_mask: ::wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: ::wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: ::wgpu::PrimitiveState {
                    topology: ::wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: ::wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: ::wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: ::wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
        if let Some(error) = pollster::block_on(self.context.device.pop_error_scope()) {
            return Err(DeviceError::ShaderBuild {
                label: entry.label.clone(),
                diagnostics: error.to_string(),
            });
        }

        tracing::debug!("Created pipeline for program {} with {:?}", program.raw(), self.blend);
        self.pipelines.insert(key, pipeline);
        Ok(key)
    }

    fn ensure_bind_group(&mut self) -> [Option<u32>; SAMPLED_UNITS] {
        let key = [
            self.bound[0].map(TextureId::raw),
            self.bound[1].map(TextureId::raw),
        ];
        if !self.bind_groups.contains_key(&key) {
            let view = |unit: usize| {
                key[unit]
                    .and_then(|raw| self.textures.get(&raw))
                    .map_or(&self.shared.placeholders[unit].view, |t| &t.view)
            };
            let bind_group = self
                .context
                .device
                .create_bind_group(&::wgpu::BindGroupDescriptor {
                    label: Some("Cell Grid Bind Group"),
                    layout: &self.shared.bind_group_layout,
                    entries: &[
                        ::wgpu::BindGroupEntry {
                            binding: UniformBlock::Frame.binding(),
                            resource: self.shared.frame_uniforms.as_entire_binding(),
                        },
                        ::wgpu::BindGroupEntry {
                            binding: UniformBlock::Palette.binding(),
                            resource: self.shared.palette_uniforms.as_entire_binding(),
                        },
                        ::wgpu::BindGroupEntry {
                            binding: 2,
                            resource: ::wgpu::BindingResource::TextureView(view(0)),
                        },
                        ::wgpu::BindGroupEntry {
                            binding: 3,
                            resource: ::wgpu::BindingResource::TextureView(view(1)),
                        },
                    ],
                });
            self.bind_groups.insert(key, bind_group);
        }
        key
    }

    /// Run a render pass that only clears, for frames with no draws.
    fn flush_clear(&mut self) {
        let (Some(clear), Some(target)) = (self.pending_clear.take(), self.target.as_ref()) else {
            return;
        };
        let mut encoder = self
            .context
            .device
            .create_command_encoder(&::wgpu::CommandEncoderDescriptor {
                label: Some("Cell Grid Clear"),
            });
        {
            let _pass = encoder.begin_render_pass(&::wgpu::RenderPassDescriptor {
                label: Some("Cell Grid Clear Pass"),
                color_attachments: &[Some(::wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: ::wgpu::Operations {
                        load: ::wgpu::LoadOp::Clear(clear),
                        store: ::wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.context.queue.submit(Some(encoder.finish()));
    }

    /// Copy the target to the CPU, stripping row padding.
    fn read_target(&self) -> DeviceResult<Option<(u32, u32, Vec<u8>)>> {
        let Some(target) = self.target.as_ref() else {
            return Ok(None);
        };
        let bytes_per_pixel = 4;
        let unpadded = target.width * bytes_per_pixel;
        let align = ::wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let bytes_per_row = unpadded.div_ceil(align) * align;

        let staging = self.context.device.create_buffer(&::wgpu::BufferDescriptor {
            label: Some("Cell Grid Readback"),
            size: (bytes_per_row * target.height) as ::wgpu::BufferAddress,
            usage: ::wgpu::BufferUsages::COPY_DST | ::wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .context
            .device
            .create_command_encoder(&::wgpu::CommandEncoderDescriptor {
                label: Some("Cell Grid Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            ::wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: ::wgpu::Origin3d::ZERO,
                aspect: ::wgpu::TextureAspect::All,
            },
            ::wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: ::wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(target.height),
                },
            },
            target.texture.size(),
        );
        self.context.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(::wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.context
            .device
            .poll(::wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(DeviceError::Backend(format!("readback map failed: {}", e))),
            Err(_) => return Err(DeviceError::Lost),
        }

        let data = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((unpadded * target.height) as usize);
        for y in 0..target.height {
            let start = (y * bytes_per_row) as usize;
            pixels.extend_from_slice(&data[start..start + unpadded as usize]);
        }
        drop(data);
        staging.unmap();
        Ok(Some((target.width, target.height, pixels)))
    }

    fn reset_resources(&mut self) {
        self.buffers.clear();
        self.textures.clear();
        self.programs.clear();
        self.pipelines.clear();
        self.bind_groups.clear();
        self.fences.clear();
        self.program = None;
        self.bound = [None; MAX_TEXTURE_UNITS];
        self.blend = BlendConfig::default();
        self.target = None;
        self.pending_clear = None;
    }
}

fn watch_device_loss(device: &::wgpu::Device, lost: &Arc<AtomicBool>) {
    let flag = lost.clone();
    device.set_device_lost_callback(move |reason, message| {
        tracing::error!("GPU device lost ({:?}): {}", reason, message);
        flag.store(true, Ordering::Release);
    });
}

impl GraphicsDevice for WgpuDevice {
    fn api(&self) -> GraphicsApi {
        self.context.api()
    }

    fn features(&self) -> FeatureSet {
        self.features
    }

    fn status(&self) -> DeviceStatus {
        if self.lost.load(Ordering::Acquire) {
            DeviceStatus::Lost
        } else {
            DeviceStatus::Ready
        }
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferId> {
        self.check_lost()?;
        if desc.usage.contains(BufferUsage::PERSISTENT) && !self.features.persistent_mapping() {
            return Err(DeviceError::Unsupported("persistent mapping"));
        }
        if desc.size > self.context.device.limits().max_buffer_size {
            return Err(DeviceError::OutOfMemory {
                what: format!("{} ({} bytes)", desc.label, desc.size),
            });
        }
        let buffer = self.allocate_buffer(desc);
        let id = BufferId::from_raw(self.next_id());
        self.buffers.insert(
            id.raw(),
            GpuBuffer {
                buffer,
                desc: *desc,
                mapped: false,
            },
        );
        Ok(id)
    }

    fn orphan_buffer(&mut self, buffer: BufferId) -> DeviceResult<()> {
        let desc = self.buffer(buffer)?.desc;
        let fresh = self.allocate_buffer(&desc);
        if let Some(entry) = self.buffers.get_mut(&buffer.raw()) {
            // The old allocation stays alive until queued work referencing it retires.
            entry.buffer = fresh;
            entry.mapped = false;
        }
        Ok(())
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        self.check_lost()?;
        self.queue_write(buffer, offset, data)
    }

    fn map_persistent(&mut self, buffer: BufferId) -> DeviceResult<()> {
        if !self.features.persistent_mapping() {
            return Err(DeviceError::Unsupported("persistent mapping"));
        }
        let entry = self
            .buffers
            .get_mut(&buffer.raw())
            .ok_or(DeviceError::InvalidHandle("buffer"))?;
        entry.mapped = true;
        Ok(())
    }

    fn write_mapped(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        self.check_lost()?;
        if !self.buffer(buffer)?.mapped {
            return Err(DeviceError::Backend("buffer is not persistently mapped".into()));
        }
        self.queue_write(buffer, offset, data)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(entry) = self.buffers.remove(&buffer.raw()) {
            entry.buffer.destroy();
        }
    }

    fn insert_fence(&mut self) -> DeviceResult<FenceId> {
        self.check_lost()?;
        let index = self.context.queue.submit(std::iter::empty());
        let id = FenceId::from_raw(self.next_fence);
        self.next_fence += 1;
        self.fences.insert(id.raw(), index);
        Ok(id)
    }

    fn wait_fence(&mut self, fence: FenceId, timeout: Duration) -> DeviceResult<FenceStatus> {
        self.check_lost()?;
        let index = self
            .fences
            .get(&fence.raw())
            .cloned()
            .ok_or(DeviceError::InvalidHandle("fence"))?;
        match self.context.device.poll(::wgpu::PollType::Wait {
            submission_index: Some(index),
            timeout: Some(timeout),
        }) {
            Ok(_) => {
                self.fences.remove(&fence.raw());
                Ok(FenceStatus::Signaled)
            }
            Err(::wgpu::PollError::Timeout) => Ok(FenceStatus::TimedOut),
            Err(e) => Err(DeviceError::Backend(e.to_string())),
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> DeviceResult<TextureId> {
        self.check_lost()?;
        let max = self.features.max_texture_dimension;
        if desc.width > max || desc.height > max {
            return Err(DeviceError::OutOfMemory {
                what: format!("{} ({}x{})", desc.label, desc.width, desc.height),
            });
        }
        let texture = create_texture(
            &self.context.device,
            desc.label,
            desc.width,
            desc.height,
            desc.format,
        );
        let id = TextureId::from_raw(self.next_id());
        self.textures.insert(id.raw(), texture);
        Ok(id)
    }

    fn write_texture(
        &mut self,
        texture: TextureId,
        region: TextureRegion,
        data: &[u8],
        bytes_per_row: u32,
    ) -> DeviceResult<()> {
        self.check_lost()?;
        let entry = self
            .textures
            .get(&texture.raw())
            .ok_or(DeviceError::InvalidHandle("texture"))?;
        let size = entry.texture.size();
        if region.x + region.width > size.width || region.y + region.height > size.height {
            return Err(DeviceError::Backend("texture write out of bounds".into()));
        }
        self.context.queue.write_texture(
            ::wgpu::TexelCopyTextureInfo {
                texture: &entry.texture,
                mip_level: 0,
                origin: ::wgpu::Origin3d {
                    x: region.x,
                    y: region.y,
                    z: 0,
                },
                aspect: ::wgpu::TextureAspect::All,
            },
            data,
            ::wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(region.height),
            },
            ::wgpu::Extent3d {
                width: region.width,
                height: region.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn copy_texture(
        &mut self,
        src: TextureId,
        dst: TextureId,
        width: u32,
        height: u32,
    ) -> DeviceResult<()> {
        self.check_lost()?;
        let source = self
            .textures
            .get(&src.raw())
            .ok_or(DeviceError::InvalidHandle("texture"))?;
        let target = self
            .textures
            .get(&dst.raw())
            .ok_or(DeviceError::InvalidHandle("texture"))?;
        let mut encoder = self
            .context
            .device
            .create_command_encoder(&::wgpu::CommandEncoderDescriptor {
                label: Some("Atlas Copy"),
            });
        encoder.copy_texture_to_texture(
            source.texture.as_image_copy(),
            target.texture.as_image_copy(),
            ::wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.context.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if let Some(entry) = self.textures.remove(&texture.raw()) {
            entry.texture.destroy();
        }
        let raw = Some(texture.raw());
        self.bind_groups.retain(|key, _| !key.contains(&raw));
        for slot in &mut self.bound {
            if *slot == Some(texture) {
                *slot = None;
            }
        }
    }

    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> DeviceResult<ProgramId> {
        self.check_lost()?;
        if desc.dual_source && !self.features.dual_source_blending() {
            return Err(DeviceError::Unsupported("dual-source blending"));
        }

        self.context
            .device
            .push_error_scope(::wgpu::ErrorFilter::Validation);
        let module = self
            .context
            .device
            .create_shader_module(::wgpu::ShaderModuleDescriptor {
                label: Some(desc.label),
                source: ::wgpu::ShaderSource::Wgsl(desc.source.into()),
            });
        if let Some(error) = pollster::block_on(self.context.device.pop_error_scope()) {
            return Err(DeviceError::ShaderBuild {
                label: desc.label.to_string(),
                diagnostics: error.to_string(),
            });
        }

        let id = ProgramId::from_raw(self.next_id());
        self.programs.insert(
            id.raw(),
            GpuProgram {
                module,
                label: desc.label.to_string(),
                vertex_entry: desc.vertex_entry.to_string(),
                fragment_entry: desc.fragment_entry.to_string(),
            },
        );
        tracing::debug!("Created program '{}'", desc.label);
        Ok(id)
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program.raw());
        self.pipelines.retain(|(raw, _), _| *raw != program.raw());
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
        self.check_lost()?;
        let (buffer, expected) = match block {
            UniformBlock::Frame => (&self.shared.frame_uniforms, size_of::<FrameConstants>()),
            UniformBlock::Palette => (&self.shared.palette_uniforms, size_of::<PaletteConstants>()),
        };
        if data.len() != expected {
            return Err(DeviceError::Backend(format!("malformed {:?} uniform block", block)));
        }
        self.context.queue.write_buffer(buffer, 0, data);
        Ok(())
    }

    fn begin_frame(&mut self, target: &FrameTarget) -> DeviceResult<()> {
        self.check_lost()?;
        let width = target.width.max(1);
        let height = target.height.max(1);
        let reuse = self
            .target
            .as_ref()
            .is_some_and(|t| t.width == width && t.height == height);
        if !reuse {
            let texture = self.context.device.create_texture(&::wgpu::TextureDescriptor {
                label: Some("Cell Grid Target"),
                size: ::wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: ::wgpu::TextureDimension::D2,
                format: TARGET_FORMAT,
                usage: ::wgpu::TextureUsages::RENDER_ATTACHMENT
                    | ::wgpu::TextureUsages::TEXTURE_BINDING
                    | ::wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            });
            let view = texture.create_view(&::wgpu::TextureViewDescriptor::default());
            self.target = Some(Target {
                texture,
                view,
                width,
                height,
            });
        }
        let [r, g, b, a] = target.clear.map(f64::from);
        self.pending_clear = Some(::wgpu::Color { r, g, b, a });
        Ok(())
    }

    fn draw_instances(&mut self, buffer: BufferId, offset: u64, count: u32) -> DeviceResult<()> {
        profile_function!();
        self.check_lost()?;
        if count == 0 {
            return Ok(());
        }
        let program = self
            .program
            .ok_or_else(|| DeviceError::Backend("draw without a program".into()))?;
        let pipeline_key = self.ensure_pipeline(program)?;
        let bind_key = self.ensure_bind_group();

        let end = offset + count as u64 * InstanceRecord::SIZE as u64;
        let vertex_buffer = &self.buffer(buffer)?.buffer;
        if end > vertex_buffer.size() {
            return Err(DeviceError::Backend(format!(
                "{} instances read past the end of the buffer",
                count
            )));
        }
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| DeviceError::Backend("draw outside begin_frame/present".into()))?;
        let load = self
            .pending_clear
            .map_or(::wgpu::LoadOp::Load, ::wgpu::LoadOp::Clear);

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&::wgpu::CommandEncoderDescriptor {
                label: Some("Cell Grid Draw"),
            });
        {
            let mut pass = encoder.begin_render_pass(&::wgpu::RenderPassDescriptor {
                label: Some("Cell Grid Pass"),
                color_attachments: &[Some(::wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: ::wgpu::Operations {
                        load,
                        store: ::wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipelines[&pipeline_key]);
            pass.set_bind_group(0, &self.bind_groups[&bind_key], &[]);
            pass.set_vertex_buffer(0, vertex_buffer.slice(offset..end));
            pass.draw(0..6, 0..count);
        }
        self.context.queue.submit(Some(encoder.finish()));
        self.pending_clear = None;
        Ok(())
    }

    fn present(&mut self) -> DeviceResult<()> {
        self.check_lost()?;
        if self.target.is_none() {
            return Err(DeviceError::Backend("present without begin_frame".into()));
        }
        self.flush_clear();
        if self.readback {
            if let Some((width, height, pixels)) = self.read_target()? {
                self.capture.store(width, height, pixels);
            }
        }
        Ok(())
    }

    fn recreate(&mut self) -> DeviceResult<()> {
        self.reset_resources();
        let context = GraphicsContext::new_sync(self.descriptor.clone())
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        self.lost = Arc::new(AtomicBool::new(false));
        watch_device_loss(&context.device, &self.lost);
        self.features = context.feature_set();
        self.shared = Shared::new(&context.device);
        self.context = context;
        tracing::info!("wgpu device recreated: {}", self.features);
        Ok(())
    }
}
