//! Per-pixel shading shared by the GPU program and the software device.
//!
//! [`shade`] is the host-side twin of `fs_main` in `shaders/cell.wgsl`. Both
//! branch on the instance's [`ShadingMode`]; keep them in step.

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use static_assertions::const_assert_eq;

use crate::instance::{AtlasUnit, InstanceRecord, ShadingMode};
use crate::payload::{EffectFlags, FrameSettings, ViewportSize};

/// Common WGSL: bindings, instance decoding, vertex stage and the mode branch.
pub const CELL_SHADER: &str = include_str!("shaders/cell.wgsl");
/// Single-output fragment entry point.
pub const FRAGMENT_SINGLE: &str = include_str!("shaders/fragment_single.wgsl");
/// Two-output fragment entry point for dual-source blending.
pub const FRAGMENT_DUAL_SOURCE: &str = include_str!("shaders/fragment_dual.wgsl");

pub const VERTEX_ENTRY: &str = "vs_main";
pub const FRAGMENT_ENTRY: &str = "fs_main";

/// Assemble the program source for the chosen output variant.
pub fn program_source(dual_source: bool) -> String {
    if dual_source {
        format!(
            "enable dual_source_blending;\n{}\n{}",
            CELL_SHADER, FRAGMENT_DUAL_SOURCE
        )
    } else {
        format!("{}\n{}", CELL_SHADER, FRAGMENT_SINGLE)
    }
}

/// Subpixel glyphs collapse to one coverage channel.
pub const FLAG_GRAYSCALE_FALLBACK: u32 = 1 << 0;
pub const FLAG_ANIMATE_LINES: u32 = 1 << 1;
pub const FLAG_BLINK_CURSOR: u32 = 1 << 2;

/// Vertex-stage constants, group 0 binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct FrameConstants {
    /// `(2 / width, -2 / height)`: pixel to clip space.
    pub position_scale: [f32; 2],
    pub viewport_size: [f32; 2],
    pub cell_size: [f32; 2],
    pub cell_count: [f32; 2],
    /// Seconds since the renderer started.
    pub time: f32,
    pub _padding: [f32; 3],
}

const_assert_eq!(std::mem::size_of::<FrameConstants>() % 16, 0);

impl FrameConstants {
    pub fn new(
        viewport: ViewportSize,
        settings: &FrameSettings,
        columns: usize,
        rows: usize,
        time: f32,
    ) -> Self {
        let size = Vec2::new(viewport.width.max(1) as f32, viewport.height.max(1) as f32);
        Self {
            position_scale: (Vec2::new(2.0, -2.0) / size).to_array(),
            viewport_size: size.to_array(),
            cell_size: [
                settings.font.cell_size.width as f32,
                settings.font.cell_size.height as f32,
            ],
            cell_count: [columns as f32, rows as f32],
            time,
            _padding: [0.0; 3],
        }
    }
}

/// Fragment-stage constants, group 0 binding 1.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct PaletteConstants {
    pub background_color: [f32; 4],
    pub cursor_color: [f32; 4],
    pub selection_color: [f32; 4],
    pub gamma_ratios: [f32; 4],
    pub enhanced_contrast: f32,
    pub underline_width: f32,
    pub double_underline_width: f32,
    pub curly_half_height: f32,
    pub shaded_glyph_dot_size: f32,
    pub line_animation_speed: f32,
    pub cursor_blink_period: f32,
    pub flags: u32,
}

const_assert_eq!(std::mem::size_of::<PaletteConstants>(), 96);

impl PaletteConstants {
    /// `grayscale_fallback` is set when subpixel text is on but the device
    /// cannot blend per channel. `blink` reflects whether the current cursor
    /// blinks at all.
    pub fn new(settings: &FrameSettings, grayscale_fallback: bool, blink: bool) -> Self {
        let font = &settings.font;
        let mut flags = 0;
        if grayscale_fallback {
            flags |= FLAG_GRAYSCALE_FALLBACK;
        }
        if settings.effects.contains(EffectFlags::ANIMATE_LINES) {
            flags |= FLAG_ANIMATE_LINES;
        }
        if blink && settings.effects.contains(EffectFlags::BLINK_CURSOR) {
            flags |= FLAG_BLINK_CURSOR;
        }

        let underline_width = font.underline_width.max(1) as f32;
        let (first, second) = font.double_underline_positions;
        let double_underline_width = (second.abs_diff(first) as f32 / 2.0).clamp(1.0, underline_width);

        Self {
            background_color: settings.palette.background.to_premultiplied_array(),
            cursor_color: settings.palette.cursor.to_premultiplied_array(),
            selection_color: settings.palette.selection.to_premultiplied_array(),
            gamma_ratios: gamma_ratios(settings.gamma),
            enhanced_contrast: settings.enhanced_contrast.max(0.0),
            underline_width,
            double_underline_width,
            curly_half_height: font.curly_half_height.max(0.5),
            shaded_glyph_dot_size: (font.cell_size.width as f32 / 8.0).floor().max(1.0),
            line_animation_speed: settings.line_animation_speed,
            cursor_blink_period: settings.cursor_blink_period.max(f32::EPSILON),
            flags,
        }
    }

    fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// Alpha-correction polynomial coefficients for gamma 1.0 to 2.2 in 0.1 steps.
const GAMMA_INCORRECT_TARGET_RATIOS: [[f32; 4]; 13] = [
    [0.0000, 0.0000, 0.0000, 0.0000],
    [0.0166, -0.0807, 0.2227, -0.0751],
    [0.0350, -0.1760, 0.4325, -0.1370],
    [0.0543, -0.2821, 0.6302, -0.1876],
    [0.0739, -0.3963, 0.8167, -0.2287],
    [0.0933, -0.5161, 0.9926, -0.2616],
    [0.1121, -0.6395, 1.1588, -0.2877],
    [0.1300, -0.7649, 1.3159, -0.3080],
    [0.1469, -0.8911, 1.4644, -0.3234],
    [0.1627, -1.0170, 1.6051, -0.3347],
    [0.1773, -1.1420, 1.7385, -0.3426],
    [0.1908, -1.2652, 1.8650, -0.3476],
    [0.2031, -1.3864, 1.9851, -0.3501],
];

/// Gamma ratios for the alpha-correction step, scaled for 8-bit coverage.
pub fn gamma_ratios(gamma: f32) -> [f32; 4] {
    let norm13 = (65536.0 / (255.0 * 255.0) * 4.0) as f32;
    let norm24 = (256.0 / 255.0 * 4.0) as f32;

    let gamma = if gamma.is_finite() { gamma.clamp(1.0, 2.2) } else { 1.0 };
    let index = ((gamma - 1.0) / 0.1).round() as usize;
    let ratios = GAMMA_INCORRECT_TARGET_RATIOS[index.min(12)];

    [
        norm13 * ratios[0] / 4.0,
        norm24 * ratios[1] / 4.0,
        norm13 * ratios[2] / 4.0,
        norm24 * ratios[3] / 4.0,
    ]
}

fn saturate(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

/// Sharpen coverage: `a(k+1) / (ak+1)`.
pub fn enhance_contrast(alpha: f32, k: f32) -> f32 {
    alpha * (k + 1.0) / (alpha * k + 1.0)
}

/// Nudge coverage toward the perceptual target for foreground intensity `f`.
pub fn apply_alpha_correction(a: f32, f: f32, g: [f32; 4]) -> f32 {
    a + a * (1.0 - a) * ((g[0] * f + g[1]) * a + (g[2] * f + g[3]))
}

/// Luma used by the alpha correction.
pub fn color_intensity(rgb: [f32; 3]) -> f32 {
    rgb[0] * 0.25 + rgb[1] * 0.5 + rgb[2] * 0.25
}

/// Reduce contrast enhancement for light text on dark backgrounds.
pub fn light_on_dark_contrast(k: f32, rgb: [f32; 3]) -> f32 {
    let luma = rgb[0] * 0.30 + rgb[1] * 0.59 + rgb[2] * 0.11;
    k * saturate(luma * -4.0 + 3.0)
}

/// Read access to the atlases, as `textureLoad` sees them.
pub trait TexelSource {
    /// Texel `(x, y)` of `unit` with channels in `0.0..=1.0`. R8 textures
    /// return `[r, 0, 0, 1]`. Out-of-range reads return zero.
    fn load(&self, unit: AtlasUnit, x: i32, y: i32) -> [f32; 4];
}

/// Fragment output: premultiplied color, plus the per-channel blend weights
/// consumed by dual-source blending (`color.aaaa` for every mode except
/// subpixel text).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fragment {
    pub color: [f32; 4],
    pub weights: [f32; 4],
}

impl Fragment {
    fn from_color(color: [f32; 4]) -> Self {
        Self {
            color,
            weights: [color[3]; 4],
        }
    }

    fn scaled(color: [f32; 4], coverage: f32) -> Self {
        Self::from_color(color.map(|c| c * coverage))
    }
}

fn straight_rgb(color: [f32; 4]) -> [f32; 3] {
    if color[3] > 0.0 {
        [color[0] / color[3], color[1] / color[3], color[2] / color[3]]
    } else {
        [0.0; 3]
    }
}

fn unpack_color(packed: u32) -> [f32; 4] {
    packed.to_le_bytes().map(|b| b as f32 / 255.0)
}

/// Shade the pixel whose center is `pixel` (framebuffer coordinates, so
/// integer pixel `(x, y)` has center `(x + 0.5, y + 0.5)`) for `record`.
pub fn shade(
    record: &InstanceRecord,
    pixel: [f32; 2],
    frame: &FrameConstants,
    palette: &PaletteConstants,
    texels: &dyn TexelSource,
) -> Fragment {
    let color = unpack_color(record.color);
    let scale = [
        record.rendition_scale[0].max(1) as f32,
        record.rendition_scale[1].max(1) as f32,
    ];
    let local = [
        pixel[0] - record.position[0] as f32,
        pixel[1] - record.position[1] as f32,
    ];
    let texel = |unit: AtlasUnit| {
        texels.load(
            unit,
            record.texcoord[0] as i32 + (local[0] / scale[0]).floor() as i32,
            record.texcoord[1] as i32 + (local[1] / scale[1]).floor() as i32,
        )
    };
    let line_x = if palette.has(FLAG_ANIMATE_LINES) {
        pixel[0] + frame.time * palette.line_animation_speed
    } else {
        pixel[0]
    };

    let Some(mode) = record.mode() else {
        return Fragment::from_color([0.0; 4]);
    };

    match mode {
        ShadingMode::Background | ShadingMode::SolidLine | ShadingMode::FilledRect => {
            Fragment::from_color(color)
        }
        ShadingMode::TextGrayscale => {
            let coverage = texel(AtlasUnit::Coverage)[0];
            Fragment::scaled(color, grayscale_coverage(coverage, color, palette))
        }
        ShadingMode::TextSubpixel => {
            let glyph = texel(AtlasUnit::Color);
            if palette.has(FLAG_GRAYSCALE_FALLBACK) {
                let coverage = (glyph[0] + glyph[1] + glyph[2]) / 3.0;
                return Fragment::scaled(color, grayscale_coverage(coverage, color, palette));
            }
            let rgb = straight_rgb(color);
            let k = light_on_dark_contrast(palette.enhanced_contrast, rgb);
            let mut weights = [0.0; 4];
            for channel in 0..3 {
                let contrasted = enhance_contrast(glyph[channel], k);
                weights[channel] =
                    apply_alpha_correction(contrasted, rgb[channel], palette.gamma_ratios) * color[3];
            }
            weights[3] = weights[0].max(weights[1]).max(weights[2]);
            Fragment {
                color: [
                    rgb[0] * weights[0],
                    rgb[1] * weights[1],
                    rgb[2] * weights[2],
                    weights[3],
                ],
                weights,
            }
        }
        ShadingMode::TextBuiltin => {
            let control = texel(AtlasUnit::Color);
            let dot = palette.shaded_glyph_dot_size.max(1.0);
            let pos = [(pixel[0] / dot).floor(), (pixel[1] / dot).floor()];
            // r stretches the checkerboard horizontally, g inverts it, b fills solid.
            let period_x = control[0] * -0.25 + 0.5;
            let phase = (pos[0] * period_x + pos[1] * 0.5).rem_euclid(1.0);
            let checker = if phase <= 0.0 { control[3] } else { 0.0 };
            let inverted = (control[1] - checker).abs();
            Fragment::scaled(color, control[2].max(inverted))
        }
        ShadingMode::TextPassthrough => Fragment::from_color(texel(AtlasUnit::Color)),
        ShadingMode::DottedLine => {
            let period = 3.0 * palette.underline_width * scale[0];
            let on = (line_x / period).rem_euclid(1.0) < 1.0 / 3.0;
            Fragment::scaled(color, if on { 1.0 } else { 0.0 })
        }
        ShadingMode::DashedLine => {
            let period = 6.0 * palette.underline_width * scale[0];
            let on = (line_x / period).rem_euclid(1.0) < 4.0 / 6.0;
            Fragment::scaled(color, if on { 1.0 } else { 0.0 })
        }
        ShadingMode::CurlyLine => {
            let half_stroke = palette.underline_width * scale[1] * 0.5;
            let half_height = palette.curly_half_height * scale[1];
            let amplitude = (half_height - half_stroke).max(0.0);
            let frequency = std::f32::consts::FRAC_PI_2 / (palette.curly_half_height * scale[0]);
            let wave = (line_x * frequency).sin() * amplitude;
            let distance = (half_height - wave - local[1]).abs();
            Fragment::scaled(color, 1.0 - saturate(distance - half_stroke))
        }
        ShadingMode::Cursor => {
            let visible = !palette.has(FLAG_BLINK_CURSOR)
                || (frame.time / palette.cursor_blink_period).rem_euclid(1.0) < 0.5;
            Fragment::scaled(color, if visible { 1.0 } else { 0.0 })
        }
    }
}

fn grayscale_coverage(coverage: f32, color: [f32; 4], palette: &PaletteConstants) -> f32 {
    let rgb = straight_rgb(color);
    let k = light_on_dark_contrast(palette.enhanced_contrast, rgb);
    let contrasted = enhance_contrast(coverage, k);
    saturate(apply_alpha_correction(contrasted, color_intensity(rgb), palette.gamma_ratios))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Rgba;

    struct NoTexels;

    impl TexelSource for NoTexels {
        fn load(&self, _unit: AtlasUnit, _x: i32, _y: i32) -> [f32; 4] {
            [0.0; 4]
        }
    }

    struct FullCoverage;

    impl TexelSource for FullCoverage {
        fn load(&self, unit: AtlasUnit, _x: i32, _y: i32) -> [f32; 4] {
            match unit {
                AtlasUnit::Coverage => [1.0, 0.0, 0.0, 1.0],
                AtlasUnit::Color => [1.0, 1.0, 1.0, 1.0],
            }
        }
    }

    fn constants() -> (FrameConstants, PaletteConstants) {
        let settings = FrameSettings::default();
        (
            FrameConstants::new(ViewportSize::new(640, 480), &settings, 80, 24, 0.0),
            PaletteConstants::new(&settings, false, false),
        )
    }

    #[test]
    fn test_uniform_block_sizes() {
        assert_eq!(std::mem::size_of::<FrameConstants>(), 48);
        assert_eq!(std::mem::size_of::<PaletteConstants>(), 96);
    }

    #[test]
    fn test_position_scale() {
        let (frame, _) = constants();
        assert_eq!(frame.position_scale, [2.0 / 640.0, -2.0 / 480.0]);
    }

    #[test]
    fn test_gamma_ratios_clamped() {
        assert_eq!(gamma_ratios(0.5), gamma_ratios(1.0));
        assert_eq!(gamma_ratios(3.0), gamma_ratios(2.2));
        assert_eq!(gamma_ratios(1.0), [0.0; 4]);
        assert!(gamma_ratios(1.8)[2] > 0.0);
    }

    #[test]
    fn test_enhance_contrast() {
        assert_eq!(enhance_contrast(0.0, 1.0), 0.0);
        assert!((enhance_contrast(1.0, 1.0) - 1.0).abs() < 1e-6);
        assert!(enhance_contrast(0.5, 1.0) > 0.5);
        assert_eq!(enhance_contrast(0.5, 0.0), 0.5);
    }

    #[test]
    fn test_flat_modes() {
        let (frame, palette) = constants();
        let record = InstanceRecord::new(ShadingMode::FilledRect, [0, 0], [10, 10])
            .with_color(Rgba::RED);
        let out = shade(&record, [5.5, 5.5], &frame, &palette, &NoTexels);
        assert_eq!(out.color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(out.weights, [1.0; 4]);
    }

    #[test]
    fn test_grayscale_full_coverage_is_opaque() {
        let (frame, palette) = constants();
        let record = InstanceRecord::new(ShadingMode::TextGrayscale, [0, 0], [9, 18])
            .with_color(Rgba::WHITE);
        let out = shade(&record, [1.5, 1.5], &frame, &palette, &FullCoverage);
        assert!((out.color[3] - 1.0).abs() < 1e-5);

        let empty = shade(&record, [1.5, 1.5], &frame, &palette, &NoTexels);
        assert_eq!(empty.color[3], 0.0);
    }

    #[test]
    fn test_dotted_line_pattern() {
        let (frame, palette) = constants();
        let record = InstanceRecord::new(ShadingMode::DottedLine, [0, 0], [30, 1])
            .with_color(Rgba::WHITE);
        let lit: Vec<bool> = (0..6)
            .map(|x| shade(&record, [x as f32 + 0.5, 0.5], &frame, &palette, &NoTexels).color[3] > 0.0)
            .collect();
        assert_eq!(lit, [true, false, false, true, false, false]);
    }

    #[test]
    fn test_dashed_line_pattern() {
        let (frame, palette) = constants();
        let record = InstanceRecord::new(ShadingMode::DashedLine, [0, 0], [30, 1])
            .with_color(Rgba::WHITE);
        let lit = (0..6)
            .filter(|x| shade(&record, [*x as f32 + 0.5, 0.5], &frame, &palette, &NoTexels).color[3] > 0.0)
            .count();
        assert_eq!(lit, 4);
    }

    #[test]
    fn test_cursor_blink() {
        let mut settings = FrameSettings::default();
        settings.effects = EffectFlags::BLINK_CURSOR;
        settings.cursor_blink_period = 1.0;
        let palette = PaletteConstants::new(&settings, false, true);
        let record = InstanceRecord::new(ShadingMode::Cursor, [0, 0], [9, 18])
            .with_color(Rgba::WHITE);

        let on = FrameConstants::new(ViewportSize::new(64, 64), &settings, 1, 1, 0.25);
        let off = FrameConstants::new(ViewportSize::new(64, 64), &settings, 1, 1, 0.75);
        assert_eq!(shade(&record, [1.5, 1.5], &on, &palette, &NoTexels).color[3], 1.0);
        assert_eq!(shade(&record, [1.5, 1.5], &off, &palette, &NoTexels).color[3], 0.0);
    }

    #[test]
    fn test_subpixel_weights_per_channel() {
        struct RedOnly;
        impl TexelSource for RedOnly {
            fn load(&self, _unit: AtlasUnit, _x: i32, _y: i32) -> [f32; 4] {
                [1.0, 0.0, 0.0, 1.0]
            }
        }

        let (frame, palette) = constants();
        let record = InstanceRecord::new(ShadingMode::TextSubpixel, [0, 0], [9, 18])
            .with_color(Rgba::WHITE);
        let out = shade(&record, [0.5, 0.5], &frame, &palette, &RedOnly);
        assert!(out.weights[0] > 0.99);
        assert_eq!(out.weights[1], 0.0);
        assert_eq!(out.weights[2], 0.0);
    }

    #[test]
    fn test_program_source_variants() {
        assert!(program_source(true).starts_with("enable dual_source_blending;"));
        assert!(!program_source(false).contains("blend_src"));
        assert!(program_source(false).contains(VERTEX_ENTRY));
    }
}
