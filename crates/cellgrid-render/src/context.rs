//! wgpu adapter/device acquisition and capability probing.

use cellgrid_gpu::{Capabilities, FeatureLevel, FeatureSet, GraphicsApi};

use crate::error::{RenderError, RenderResult};

/// An acquired wgpu adapter, device and queue.
///
/// ```rust,no_run
/// use cellgrid_render::{GraphicsContext, GraphicsContextDescriptor};
///
/// let context = GraphicsContext::new_sync(GraphicsContextDescriptor::default())
///     .expect("no usable GPU adapter");
/// println!("{}", context.feature_set());
/// ```
pub struct GraphicsContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    feature_set: FeatureSet,
}

impl GraphicsContext {
    /// Acquire an adapter and device matching `descriptor`.
    ///
    /// Optional features the renderer can use (dual-source blending, indirect
    /// first instance, timestamp queries, texture arrays) are enabled when the
    /// adapter offers them; missing ones are logged and never an error.
    pub async fn new(descriptor: GraphicsContextDescriptor) -> RenderResult<Self> {
        let mut flags = wgpu::InstanceFlags::default();
        if descriptor.debug {
            flags |= wgpu::InstanceFlags::DEBUG | wgpu::InstanceFlags::VALIDATION;
        }
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: descriptor.backends,
            flags,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: descriptor.power_preference,
                compatible_surface: None,
                force_fallback_adapter: descriptor.force_fallback_adapter,
            })
            .await
            .map_err(|e| RenderError::ContextCreation(format!("no suitable adapter: {}", e)))?;

        let adapter_features = adapter.features();
        let wanted = optional_wgpu_features();
        let enabled = adapter_features & wanted;
        let unavailable = wanted - enabled;
        if !unavailable.is_empty() {
            tracing::warn!(
                "Some optional GPU features are not available: {:?}",
                unavailable
            );
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                required_features: enabled,
                required_limits: descriptor.limits.clone().using_resolution(adapter.limits()),
                label: descriptor.label,
                ..Default::default()
            })
            .await
            .map_err(|e| RenderError::ContextCreation(format!("device request failed: {}", e)))?;

        let info = adapter.get_info();
        let feature_set = feature_set_from_wgpu(
            device.features(),
            &adapter.get_downlevel_capabilities(),
            &device.limits(),
            info.backend,
            descriptor.debug,
        );

        tracing::info!(
            "Created graphics context on {} ({:?}): {}",
            info.name,
            info.backend,
            feature_set
        );

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            feature_set,
        })
    }

    /// Blocking variant of [`new`](Self::new).
    pub fn new_sync(descriptor: GraphicsContextDescriptor) -> RenderResult<Self> {
        pollster::block_on(Self::new(descriptor))
    }

    pub fn info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }

    pub fn feature_set(&self) -> FeatureSet {
        self.feature_set
    }

    pub fn api(&self) -> GraphicsApi {
        graphics_api(self.adapter.get_info().backend)
    }
}

/// Descriptor for configuring graphics context creation.
#[derive(Debug, Clone)]
pub struct GraphicsContextDescriptor {
    /// GPU backends to use
    pub backends: wgpu::Backends,
    /// Power preference for adapter selection
    pub power_preference: wgpu::PowerPreference,
    /// Whether to force fallback adapter
    pub force_fallback_adapter: bool,
    /// Required device limits. Raised to the adapter's texture resolution
    /// limits so the atlas can grow.
    pub limits: wgpu::Limits,
    /// Optional label for debugging
    pub label: Option<&'static str>,
    /// Enable API validation and debug labels.
    pub debug: bool,
}

impl Default for GraphicsContextDescriptor {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::all(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            limits: wgpu::Limits::downlevel_webgl2_defaults(),
            label: Some("cellgrid"),
            debug: cfg!(debug_assertions),
        }
    }
}

impl GraphicsContextDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the power preference.
    pub fn power_preference(mut self, preference: wgpu::PowerPreference) -> Self {
        self.power_preference = preference;
        self
    }

    /// Set the backends to use.
    pub fn backends(mut self, backends: wgpu::Backends) -> Self {
        self.backends = backends;
        self
    }

    /// Set the device limits.
    pub fn limits(mut self, limits: wgpu::Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the debug label.
    pub fn label(mut self, label: &'static str) -> Self {
        self.label = Some(label);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn force_fallback_adapter(mut self, force: bool) -> Self {
        self.force_fallback_adapter = force;
        self
    }
}

/// Features requested whenever the adapter has them.
pub fn optional_wgpu_features() -> wgpu::Features {
    wgpu::Features::DUAL_SOURCE_BLENDING
        | wgpu::Features::INDIRECT_FIRST_INSTANCE
        | wgpu::Features::TIMESTAMP_QUERY
        | wgpu::Features::TEXTURE_BINDING_ARRAY
        | wgpu::Features::SAMPLED_TEXTURE_AND_STORAGE_BUFFER_ARRAY_NON_UNIFORM_INDEXING
        | wgpu::Features::MAPPABLE_PRIMARY_BUFFERS
}

pub fn graphics_api(backend: wgpu::Backend) -> GraphicsApi {
    match backend {
        wgpu::Backend::Vulkan => GraphicsApi::Vulkan,
        wgpu::Backend::Metal => GraphicsApi::Metal,
        wgpu::Backend::Dx12 => GraphicsApi::Dx12,
        wgpu::Backend::Gl => GraphicsApi::Gl,
        wgpu::Backend::BrowserWebGpu => GraphicsApi::WebGpu,
        _ => GraphicsApi::Software,
    }
}

/// Build the renderer's capability record from what a wgpu device reports.
pub fn feature_set_from_wgpu(
    features: wgpu::Features,
    downlevel: &wgpu::DownlevelCapabilities,
    limits: &wgpu::Limits,
    backend: wgpu::Backend,
    debug: bool,
) -> FeatureSet {
    let baseline = if downlevel.is_webgpu_compliant() {
        FeatureLevel::Full
    } else if downlevel.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
        FeatureLevel::Standard
    } else {
        FeatureLevel::Downlevel
    };

    let mut caps = Capabilities::empty();
    if features.contains(wgpu::Features::MAPPABLE_PRIMARY_BUFFERS) {
        caps |= Capabilities::PERSISTENT_MAPPING;
    }
    if backend != wgpu::Backend::Gl {
        caps |= Capabilities::DIRECT_RESOURCE_ACCESS;
    }
    if features.contains(wgpu::Features::INDIRECT_FIRST_INSTANCE)
        && downlevel.flags.contains(wgpu::DownlevelFlags::INDIRECT_EXECUTION)
    {
        caps |= Capabilities::MULTI_DRAW;
    }
    if downlevel.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
        caps |= Capabilities::COMPUTE;
    }
    if features.contains(
        wgpu::Features::TEXTURE_BINDING_ARRAY
            | wgpu::Features::SAMPLED_TEXTURE_AND_STORAGE_BUFFER_ARRAY_NON_UNIFORM_INDEXING,
    ) {
        caps |= Capabilities::BINDLESS_TEXTURES;
    }
    if debug {
        caps |= Capabilities::DEBUG_OUTPUT;
    }
    if features.contains(wgpu::Features::DUAL_SOURCE_BLENDING) {
        caps |= Capabilities::DUAL_SOURCE_BLENDING;
    }
    if features.contains(wgpu::Features::TIMESTAMP_QUERY) {
        caps |= Capabilities::TIMER_QUERY;
    }

    FeatureSet::new(baseline, caps, limits.max_texture_dimension_2d)
}
