//! Benchmarks for batch assembly, atlas packing and whole frames.

use cellgrid_core::geometry::Size;
use cellgrid_gpu::{MockDevice, TextureFormat};
use cellgrid_render::{
    AtlasUploadPath, Backend, BatchAssembler, DirtyRegion, DrawSink, FontMetrics, GlyphAtlas,
    GlyphContent, GlyphId, GlyphKey, GlyphMode, GlyphRasterizer, InstanceRecord, RasterizedGlyph,
    RenderPayload, RenderResult, RendererConfig, Rgba, ShadingMode,
};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

struct NullSink;

impl DrawSink for NullSink {
    fn draw(&mut self, records: &[InstanceRecord]) -> RenderResult<()> {
        black_box(records);
        Ok(())
    }
}

struct Squares;

impl GlyphRasterizer for Squares {
    fn rasterize(&mut self, _key: GlyphKey, metrics: &FontMetrics) -> Option<RasterizedGlyph> {
        let width = metrics.cell_size.width as u32 - 2;
        let height = metrics.cell_size.height as u32 - 4;
        Some(RasterizedGlyph {
            width,
            height,
            offset: (1, 2),
            content: GlyphContent::Coverage,
            pixels: vec![0xFF; (width * height) as usize],
        })
    }
}

fn bench_batch_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_assembly");

    for count in [1_000, 10_000, 100_000] {
        let records: Vec<InstanceRecord> = (0..count)
            .map(|i| {
                InstanceRecord::new(ShadingMode::Background, [(i % 300) as i16, 0], [9, 18])
                    .with_color(Rgba::RED)
            })
            .collect();
        group.throughput(Throughput::Elements(count as u64));

        for capacity in [1_024, 65_536] {
            group.bench_with_input(
                BenchmarkId::new(format!("capacity_{}", capacity), count),
                &records,
                |b, records| {
                    let mut batch = BatchAssembler::new(capacity);
                    b.iter(|| {
                        batch.extend(black_box(records), &mut NullSink).unwrap();
                        batch.flush(&mut NullSink).unwrap();
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_atlas_packing(c: &mut Criterion) {
    let mut group = c.benchmark_group("atlas_packing");
    let pixels = vec![0xFF; 16 * 24];

    for glyphs in [256u32, 2048] {
        group.throughput(Throughput::Elements(glyphs as u64));
        group.bench_with_input(BenchmarkId::from_parameter(glyphs), &glyphs, |b, &glyphs| {
            b.iter(|| {
                let (mut device, _probe) = MockDevice::new();
                let mut atlas = GlyphAtlas::new(
                    &mut device,
                    "Bench Atlas",
                    TextureFormat::R8,
                    AtlasUploadPath::Immediate,
                    256,
                    2048,
                )
                .unwrap();
                for index in 0..glyphs {
                    let key = GlyphKey {
                        face: 0,
                        glyph_index: index,
                        mode: GlyphMode::Grayscale,
                    };
                    let (width, height) = (8 + index % 9, 12 + index % 13);
                    black_box(
                        atlas
                            .insert(&mut device, key, &pixels, width, height)
                            .unwrap(),
                    );
                }
            });
        });
    }

    group.finish();
}

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame");

    let (columns, rows) = (200, 60);
    let mut payload = RenderPayload::blank(Size::new(columns * 9, rows * 18), 200, 60);
    for (y, row) in payload.rows.iter_mut().enumerate() {
        for (x, cell) in row.cells.iter_mut().enumerate() {
            cell.glyph = Some(GlyphId::new(0, ((x * 7 + y * 13) % 95) as u32));
        }
    }
    group.throughput(Throughput::Elements((columns * rows) as u64));

    for (name, dirty) in [("full_redraw", DirtyRegion::All), ("cached", DirtyRegion::None)] {
        let frame = RenderPayload {
            dirty,
            ..payload.clone()
        };
        group.bench_function(name, |b| {
            let (device, probe) = MockDevice::new();
            let mut backend =
                Backend::new(Box::new(device), Box::new(Squares), RendererConfig::default())
                    .unwrap();
            backend.render(&payload).unwrap();
            b.iter(|| {
                let stats = backend.render(&frame).unwrap();
                probe.clear_calls();
                black_box(stats)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_batch_assembly, bench_atlas_packing, bench_frame);
criterion_main!(benches);
