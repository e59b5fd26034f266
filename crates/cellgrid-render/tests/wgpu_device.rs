//! Renderer tests on real hardware through wgpu.

use cellgrid_core::geometry::Size;
use cellgrid_render::device::{SoftwareDevice, WgpuDevice};
use cellgrid_render::{
    Backend, CursorShape, CursorState, FontMetrics, GlyphKey, GlyphRasterizer,
    GraphicsContextDescriptor, RasterizedGlyph, RenderPayload, RendererConfig, Rgba,
};

struct NoGlyphs;

impl GlyphRasterizer for NoGlyphs {
    fn rasterize(&mut self, _key: GlyphKey, _metrics: &FontMetrics) -> Option<RasterizedGlyph> {
        None
    }
}

fn payload() -> RenderPayload {
    let mut payload = RenderPayload::blank(Size::new(90, 54), 10, 3);
    for cell in &mut payload.rows[1].cells {
        cell.bg = Rgba::from_hex(0x336699);
    }
    payload.cursor = Some(CursorState {
        row: 2,
        col: 4,
        shape: CursorShape::Block,
        color: Rgba::WHITE,
        blinking: false,
    });
    payload
}

#[test]
#[ignore] // Requires GPU - run with: cargo test --test wgpu_device -- --ignored
fn test_wgpu_backend_renders_frame() {
    let device = match WgpuDevice::new(GraphicsContextDescriptor::default()) {
        Ok(device) => device.with_readback(),
        Err(e) => {
            println!("GPU not available: {:?}", e);
            return;
        }
    };
    let capture = device.capture();
    let mut backend =
        Backend::new(Box::new(device), Box::new(NoGlyphs), RendererConfig::default()).unwrap();

    let stats = backend.render(&payload()).unwrap();
    assert!(stats.draw_calls >= 1);
    assert_eq!(capture.presents(), 1);
    assert_eq!(capture.pixel(40, 40), Some([255, 255, 255, 255]));
}

#[test]
#[ignore] // Requires GPU
fn test_wgpu_matches_software_for_solid_fills() {
    let Ok(device) = WgpuDevice::new(GraphicsContextDescriptor::default()) else {
        return;
    };
    let device = device.with_readback();
    let gpu_capture = device.capture();
    let mut gpu =
        Backend::new(Box::new(device), Box::new(NoGlyphs), RendererConfig::default()).unwrap();

    let software = SoftwareDevice::new();
    let cpu_capture = software.capture();
    let mut cpu =
        Backend::new(Box::new(software), Box::new(NoGlyphs), RendererConfig::default()).unwrap();

    let payload = payload();
    gpu.render(&payload).unwrap();
    cpu.render(&payload).unwrap();

    // Solid fills are exact on every backend.
    for (x, y) in [(4, 4), (45, 27), (40, 40), (85, 50)] {
        assert_eq!(gpu_capture.pixel(x, y), cpu_capture.pixel(x, y), "({x}, {y})");
    }
}

#[test]
#[ignore] // Requires GPU
fn test_wgpu_release_and_drop() {
    let Ok(device) = WgpuDevice::new(GraphicsContextDescriptor::default()) else {
        return;
    };
    let mut backend =
        Backend::new(Box::new(device), Box::new(NoGlyphs), RendererConfig::default()).unwrap();
    backend.render(&payload()).unwrap();
    backend.release_resources();
    backend.release_resources();
    assert!(backend.render(&payload()).is_err());
}
