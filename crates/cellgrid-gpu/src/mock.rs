//! Call-recording implementation of [`GraphicsDevice`] for tests.
//!
//! The device moves into the renderer, so tests keep a [`MockProbe`] sharing
//! the same recorded state to make assertions afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{
    BlendConfig, BufferDesc, BufferId, Capabilities, DeviceError, DeviceResult, DeviceStatus,
    FeatureLevel, FeatureSet, FenceId, FenceStatus, FrameTarget, GraphicsApi, GraphicsDevice,
    ProgramDesc, ProgramId, TextureDesc, TextureFormat, TextureId, TextureRegion, UniformBlock,
};

/// A recorded device call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    CreateBuffer { id: BufferId, size: u64 },
    OrphanBuffer { id: BufferId },
    WriteBuffer { id: BufferId, offset: u64, len: usize },
    MapPersistent { id: BufferId },
    WriteMapped { id: BufferId, offset: u64, len: usize },
    DestroyBuffer { id: BufferId },
    InsertFence { id: FenceId },
    WaitFence { id: FenceId },
    CreateTexture { id: TextureId, width: u32, height: u32, format: TextureFormat },
    WriteTexture { id: TextureId, region: TextureRegion },
    CopyTexture { src: TextureId, dst: TextureId },
    DestroyTexture { id: TextureId },
    CreateProgram { id: ProgramId, label: String },
    DestroyProgram { id: ProgramId },
    SetProgram { id: ProgramId },
    BindTexture { unit: u32, id: TextureId },
    SetBlend { blend: BlendConfig },
    WriteUniforms { block: UniformBlock, len: usize },
    BeginFrame { width: u32, height: u32 },
    DrawInstances { buffer: BufferId, offset: u64, count: u32 },
    Present,
    Recreate,
}

/// Bytes visible to one recorded draw.
#[derive(Debug, Clone)]
pub struct DrawCapture {
    pub count: u32,
    /// Buffer contents from the draw offset to the end of the buffer.
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    calls: Vec<DeviceCall>,
    draws: Vec<DrawCapture>,
    features: FeatureSet,
    lost: bool,
    next_id: u32,
    next_fence: u64,
    buffers: HashMap<u32, Vec<u8>>,
    textures: HashMap<u32, (u32, u32)>,
    programs: HashMap<u32, String>,
    fences_time_out: bool,
    program_failure: Option<String>,
    recreate_failure: bool,
}

impl MockState {
    fn new(features: FeatureSet) -> Self {
        Self {
            calls: Vec::new(),
            draws: Vec::new(),
            features,
            lost: false,
            next_id: 1,
            next_fence: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            programs: HashMap::new(),
            fences_time_out: false,
            program_failure: None,
            recreate_failure: false,
        }
    }

    fn alive(&self) -> DeviceResult<()> {
        if self.lost {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer_mut(&mut self, id: BufferId) -> DeviceResult<&mut Vec<u8>> {
        self.buffers
            .get_mut(&id.raw())
            .ok_or(DeviceError::InvalidHandle("buffer"))
    }

    fn write(&mut self, id: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let buffer = self.buffer_mut(id)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > buffer.len() {
            return Err(DeviceError::Backend(format!(
                "write of {} bytes at {} overruns buffer of {}",
                data.len(),
                offset,
                buffer.len()
            )));
        }
        buffer[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// Features reported by a default mock: everything except dual-source
/// blending, at the `Full` level.
pub fn default_mock_features() -> FeatureSet {
    FeatureSet::new(
        FeatureLevel::Full,
        Capabilities::all() - Capabilities::DUAL_SOURCE_BLENDING,
        8192,
    )
}

/// Mock graphics device.
///
/// # Example
///
/// ```rust
/// use cellgrid_gpu::{GraphicsDevice, MockDevice, ProgramDesc};
///
/// let (mut device, probe) = MockDevice::new();
/// let program = device
///     .create_program(&ProgramDesc {
///         label: "cells",
///         source: "fn vs_main() {} fn fs_main() {}",
///         vertex_entry: "vs_main",
///         fragment_entry: "fs_main",
///         dual_source: false,
///     })
///     .unwrap();
/// device.set_program(program).unwrap();
///
/// assert_eq!(probe.count_set_program(), 1);
/// ```
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

/// Shared view of a [`MockDevice`]'s recorded state.
#[derive(Clone)]
pub struct MockProbe {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// Create a mock with [`default_mock_features`].
    pub fn new() -> (Self, MockProbe) {
        Self::with_features(default_mock_features())
    }

    /// Create a mock reporting `features`.
    pub fn with_features(features: FeatureSet) -> (Self, MockProbe) {
        let state = Arc::new(Mutex::new(MockState::new(features)));
        (
            Self {
                state: state.clone(),
            },
            MockProbe { state },
        )
    }
}

impl MockProbe {
    /// Get a copy of all recorded calls.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    /// Count calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&DeviceCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn count_draws(&self) -> usize {
        self.count(|c| matches!(c, DeviceCall::DrawInstances { .. }))
    }

    /// Sum of instance counts over every recorded draw.
    pub fn drawn_instances(&self) -> u64 {
        self.state
            .lock()
            .calls
            .iter()
            .map(|c| match c {
                DeviceCall::DrawInstances { count, .. } => *count as u64,
                _ => 0,
            })
            .sum()
    }

    pub fn count_set_program(&self) -> usize {
        self.count(|c| matches!(c, DeviceCall::SetProgram { .. }))
    }

    pub fn count_bind_texture(&self) -> usize {
        self.count(|c| matches!(c, DeviceCall::BindTexture { .. }))
    }

    pub fn count_set_blend(&self) -> usize {
        self.count(|c| matches!(c, DeviceCall::SetBlend { .. }))
    }

    pub fn count_buffer_writes(&self) -> usize {
        self.count(|c| {
            matches!(
                c,
                DeviceCall::WriteBuffer { .. } | DeviceCall::WriteMapped { .. }
            )
        })
    }

    pub fn count_texture_creates(&self) -> usize {
        self.count(|c| matches!(c, DeviceCall::CreateTexture { .. }))
    }

    pub fn count_presents(&self) -> usize {
        self.count(|c| matches!(c, DeviceCall::Present))
    }

    /// Captured buffer contents for every draw, in issue order.
    pub fn draws(&self) -> Vec<DrawCapture> {
        self.state.lock().draws.clone()
    }

    /// Number of buffers, textures and programs currently alive.
    pub fn live_resources(&self) -> usize {
        let state = self.state.lock();
        state.buffers.len() + state.textures.len() + state.programs.len()
    }

    /// Clear recorded calls (useful between test steps).
    pub fn clear_calls(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.draws.clear();
    }

    /// Get total number of recorded calls.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Simulate a driver reset: every following fallible call fails with
    /// [`DeviceError::Lost`] until `recreate`.
    pub fn lose_device(&self) {
        self.state.lock().lost = true;
    }

    /// Make every fence wait time out.
    pub fn set_fences_time_out(&self, time_out: bool) {
        self.state.lock().fences_time_out = time_out;
    }

    /// Make the next `create_program` fail with `diagnostics`.
    pub fn fail_next_program(&self, diagnostics: &str) {
        self.state.lock().program_failure = Some(diagnostics.to_string());
    }

    /// Make the next `recreate` fail, leaving the device lost.
    pub fn fail_next_recreate(&self) {
        self.state.lock().recreate_failure = true;
    }
}

impl GraphicsDevice for MockDevice {
    fn api(&self) -> GraphicsApi {
        GraphicsApi::Mock
    }

    fn features(&self) -> FeatureSet {
        self.state.lock().features
    }

    fn status(&self) -> DeviceStatus {
        if self.state.lock().lost {
            DeviceStatus::Lost
        } else {
            DeviceStatus::Ready
        }
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferId> {
        let mut state = self.state.lock();
        state.alive()?;
        let id = BufferId::from_raw(state.next_id());
        state.buffers.insert(id.raw(), vec![0; desc.size as usize]);
        state.calls.push(DeviceCall::CreateBuffer {
            id,
            size: desc.size,
        });
        Ok(id)
    }

    fn orphan_buffer(&mut self, buffer: BufferId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        let store = state.buffer_mut(buffer)?;
        let len = store.len();
        *store = vec![0; len];
        state.calls.push(DeviceCall::OrphanBuffer { id: buffer });
        Ok(())
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        state.write(buffer, offset, data)?;
        state.calls.push(DeviceCall::WriteBuffer {
            id: buffer,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn map_persistent(&mut self, buffer: BufferId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        if !state.features.persistent_mapping() {
            return Err(DeviceError::Unsupported("persistent mapping"));
        }
        state.buffer_mut(buffer)?;
        state.calls.push(DeviceCall::MapPersistent { id: buffer });
        Ok(())
    }

    fn write_mapped(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        state.write(buffer, offset, data)?;
        state.calls.push(DeviceCall::WriteMapped {
            id: buffer,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer.raw()).is_some() {
            state.calls.push(DeviceCall::DestroyBuffer { id: buffer });
        }
    }

    fn insert_fence(&mut self) -> DeviceResult<FenceId> {
        let mut state = self.state.lock();
        state.alive()?;
        let id = FenceId::from_raw(state.next_fence);
        state.next_fence += 1;
        state.calls.push(DeviceCall::InsertFence { id });
        Ok(id)
    }

    fn wait_fence(&mut self, fence: FenceId, _timeout: Duration) -> DeviceResult<FenceStatus> {
        let mut state = self.state.lock();
        state.alive()?;
        state.calls.push(DeviceCall::WaitFence { id: fence });
        if state.fences_time_out {
            Ok(FenceStatus::TimedOut)
        } else {
            Ok(FenceStatus::Signaled)
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> DeviceResult<TextureId> {
        let mut state = self.state.lock();
        state.alive()?;
        let id = TextureId::from_raw(state.next_id());
        state.textures.insert(id.raw(), (desc.width, desc.height));
        state.calls.push(DeviceCall::CreateTexture {
            id,
            width: desc.width,
            height: desc.height,
            format: desc.format,
        });
        Ok(id)
    }

    fn write_texture(
        &mut self,
        texture: TextureId,
        region: TextureRegion,
        data: &[u8],
        bytes_per_row: u32,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        let (width, height) = *state
            .textures
            .get(&texture.raw())
            .ok_or(DeviceError::InvalidHandle("texture"))?;
        if region.x + region.width > width || region.y + region.height > height {
            return Err(DeviceError::Backend("texture write out of bounds".into()));
        }
        if (data.len() as u64) < bytes_per_row as u64 * region.height as u64 {
            return Err(DeviceError::Backend("texture data too short".into()));
        }
        state.calls.push(DeviceCall::WriteTexture {
            id: texture,
            region,
        });
        Ok(())
    }

    fn copy_texture(
        &mut self,
        src: TextureId,
        dst: TextureId,
        _width: u32,
        _height: u32,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        if !state.textures.contains_key(&src.raw()) || !state.textures.contains_key(&dst.raw()) {
            return Err(DeviceError::InvalidHandle("texture"));
        }
        state.calls.push(DeviceCall::CopyTexture { src, dst });
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        let mut state = self.state.lock();
        if state.textures.remove(&texture.raw()).is_some() {
            state.calls.push(DeviceCall::DestroyTexture { id: texture });
        }
    }

    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> DeviceResult<ProgramId> {
        let mut state = self.state.lock();
        state.alive()?;
        if let Some(diagnostics) = state.program_failure.take() {
            return Err(DeviceError::ShaderBuild {
                label: desc.label.to_string(),
                diagnostics,
            });
        }
        let id = ProgramId::from_raw(state.next_id());
        state.programs.insert(id.raw(), desc.label.to_string());
        state.calls.push(DeviceCall::CreateProgram {
            id,
            label: desc.label.to_string(),
        });
        Ok(id)
    }

    fn destroy_program(&mut self, program: ProgramId) {
        let mut state = self.state.lock();
        if state.programs.remove(&program.raw()).is_some() {
            state.calls.push(DeviceCall::DestroyProgram { id: program });
        }
    }

    fn set_program(&mut self, program: ProgramId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        if !state.programs.contains_key(&program.raw()) {
            return Err(DeviceError::InvalidHandle("program"));
        }
        state.calls.push(DeviceCall::SetProgram { id: program });
        Ok(())
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        if !state.textures.contains_key(&texture.raw()) {
            return Err(DeviceError::InvalidHandle("texture"));
        }
        state.calls.push(DeviceCall::BindTexture { unit, id: texture });
        Ok(())
    }

    fn set_blend(&mut self, blend: BlendConfig) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        if blend.uses_dual_source() && !state.features.dual_source_blending() {
            return Err(DeviceError::Unsupported("dual-source blending"));
        }
        state.calls.push(DeviceCall::SetBlend { blend });
        Ok(())
    }

    fn write_uniforms(&mut self, block: UniformBlock, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        state.calls.push(DeviceCall::WriteUniforms {
            block,
            len: data.len(),
        });
        Ok(())
    }

    fn begin_frame(&mut self, target: &FrameTarget) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        state.calls.push(DeviceCall::BeginFrame {
            width: target.width,
            height: target.height,
        });
        Ok(())
    }

    fn draw_instances(&mut self, buffer: BufferId, offset: u64, count: u32) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        let bytes = {
            let store = state.buffer_mut(buffer)?;
            store.get(offset as usize..).unwrap_or_default().to_vec()
        };
        state.draws.push(DrawCapture { count, bytes });
        state.calls.push(DeviceCall::DrawInstances {
            buffer,
            offset,
            count,
        });
        Ok(())
    }

    fn present(&mut self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.alive()?;
        state.calls.push(DeviceCall::Present);
        Ok(())
    }

    fn recreate(&mut self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::Recreate);
        if std::mem::take(&mut state.recreate_failure) {
            tracing::debug!("Mock device recreate failed");
            return Err(DeviceError::Lost);
        }
        state.lost = false;
        state.buffers.clear();
        state.textures.clear();
        state.programs.clear();
        tracing::debug!("Mock device recreated");
        Ok(())
    }
}
