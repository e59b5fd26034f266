//! The per-instance wire record shared by the batch assembler, the buffer
//! streamer and the shading program.
//!
//! Field order and widths are a contract with `shaders/cell.wgsl` and with
//! [`InstanceRecord::vertex_layout`]; changing either means changing all
//! three together.

use std::fmt;

use bytemuck::{Pod, Zeroable};
use static_assertions::{assert_eq_align, const_assert_eq};

use crate::color::Rgba;
use crate::payload::EffectFlags;

/// Per-instance shading behavior, read by the fragment stage.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShadingMode {
    Background = 0,
    TextGrayscale = 1,
    TextSubpixel = 2,
    TextBuiltin = 3,
    TextPassthrough = 4,
    DottedLine = 5,
    DashedLine = 6,
    CurlyLine = 7,
    SolidLine = 8,
    Cursor = 9,
    FilledRect = 10,
}

/// Which atlas texture unit a mode samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtlasUnit {
    /// Single-channel coverage atlas, texture unit 0.
    Coverage = 0,
    /// Four-channel atlas, texture unit 1.
    Color = 1,
}

impl ShadingMode {
    pub const ALL: [ShadingMode; 11] = [
        ShadingMode::Background,
        ShadingMode::TextGrayscale,
        ShadingMode::TextSubpixel,
        ShadingMode::TextBuiltin,
        ShadingMode::TextPassthrough,
        ShadingMode::DottedLine,
        ShadingMode::DashedLine,
        ShadingMode::CurlyLine,
        ShadingMode::SolidLine,
        ShadingMode::Cursor,
        ShadingMode::FilledRect,
    ];

    pub const fn from_u16(value: u16) -> Option<Self> {
        if (value as usize) < Self::ALL.len() {
            Some(Self::ALL[value as usize])
        } else {
            None
        }
    }

    pub const fn atlas_unit(self) -> Option<AtlasUnit> {
        match self {
            ShadingMode::TextGrayscale => Some(AtlasUnit::Coverage),
            ShadingMode::TextSubpixel | ShadingMode::TextBuiltin | ShadingMode::TextPassthrough => {
                Some(AtlasUnit::Color)
            }
            _ => None,
        }
    }

    /// True for modes whose pixels depend only on position, size and color.
    pub const fn is_procedural(self) -> bool {
        self.atlas_unit().is_none()
    }

    /// True if the mode's output changes over time under `effects`.
    pub fn is_time_varying(self, effects: EffectFlags) -> bool {
        match self {
            ShadingMode::DottedLine | ShadingMode::DashedLine | ShadingMode::CurlyLine => {
                effects.contains(EffectFlags::ANIMATE_LINES)
            }
            ShadingMode::Cursor => effects.contains(EffectFlags::BLINK_CURSOR),
            _ => false,
        }
    }
}

impl fmt::Display for ShadingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Horizontal/vertical cell-size multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenditionScale {
    pub x: u8,
    pub y: u8,
}

impl RenditionScale {
    pub const SINGLE: RenditionScale = RenditionScale { x: 1, y: 1 };
    pub const WIDE: RenditionScale = RenditionScale { x: 2, y: 1 };
    pub const TALL: RenditionScale = RenditionScale { x: 1, y: 2 };
    pub const LARGE: RenditionScale = RenditionScale { x: 2, y: 2 };
}

impl Default for RenditionScale {
    fn default() -> Self {
        Self::SINGLE
    }
}

/// One drawable quad.
///
/// Memory layout (little-endian, 20 bytes, no padding):
///
/// | offset | field             | vertex format |
/// |--------|-------------------|---------------|
/// | 0      | `shading_mode`    | `Uint16`      |
/// | 2      | `rendition_scale` | `Uint8x2`     |
/// | 4      | `position`        | `Sint16x2`    |
/// | 8      | `size`            | `Uint16x2`    |
/// | 12     | `texcoord`        | `Uint16x2`    |
/// | 16     | `color`           | `Unorm8x4`    |
///
/// `color` is premultiplied RGBA with R in the low byte.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct InstanceRecord {
    pub shading_mode: u16,
    pub rendition_scale: [u8; 2],
    pub position: [i16; 2],
    pub size: [u16; 2],
    pub texcoord: [u16; 2],
    pub color: u32,
}

const_assert_eq!(std::mem::size_of::<InstanceRecord>(), 20);
assert_eq_align!(InstanceRecord, u32);

/// Vertex input location and format of one record field, independent of any
/// graphics API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceAttribute {
    pub location: u32,
    pub offset: u64,
    pub format: wgpu::VertexFormat,
}

/// The record's vertex-input description, field by field.
pub const INSTANCE_ATTRIBUTES: [InstanceAttribute; 6] = [
    InstanceAttribute {
        location: 0,
        offset: 0,
        format: wgpu::VertexFormat::Uint16,
    },
    InstanceAttribute {
        location: 1,
        offset: 2,
        format: wgpu::VertexFormat::Uint8x2,
    },
    InstanceAttribute {
        location: 2,
        offset: 4,
        format: wgpu::VertexFormat::Sint16x2,
    },
    InstanceAttribute {
        location: 3,
        offset: 8,
        format: wgpu::VertexFormat::Uint16x2,
    },
    InstanceAttribute {
        location: 4,
        offset: 12,
        format: wgpu::VertexFormat::Uint16x2,
    },
    InstanceAttribute {
        location: 5,
        offset: 16,
        format: wgpu::VertexFormat::Unorm8x4,
    },
];

impl InstanceRecord {
    /// Size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    const WGPU_ATTRIBUTES: [wgpu::VertexAttribute; 6] = wgpu::vertex_attr_array![
        0 => Uint16,
        1 => Uint8x2,
        2 => Sint16x2,
        3 => Uint16x2,
        4 => Uint16x2,
        5 => Unorm8x4,
    ];

    pub fn new(mode: ShadingMode, position: [i16; 2], size: [u16; 2]) -> Self {
        Self {
            shading_mode: mode as u16,
            rendition_scale: [1, 1],
            position,
            size,
            texcoord: [0, 0],
            color: 0,
        }
    }

    /// Set the color from a straight-alpha value.
    pub fn with_color(mut self, color: Rgba) -> Self {
        self.color = color.pack_premultiplied();
        self
    }

    pub fn with_texcoord(mut self, texcoord: [u16; 2]) -> Self {
        self.texcoord = texcoord;
        self
    }

    pub fn with_rendition(mut self, scale: RenditionScale) -> Self {
        self.rendition_scale = [scale.x, scale.y];
        self
    }

    /// The decoded mode tag, or `None` if the tag is out of range.
    pub fn mode(&self) -> Option<ShadingMode> {
        ShadingMode::from_u16(self.shading_mode)
    }

    pub fn rendition(&self) -> RenditionScale {
        RenditionScale {
            x: self.rendition_scale[0],
            y: self.rendition_scale[1],
        }
    }

    /// Premultiplied color.
    pub fn rgba(&self) -> Rgba {
        Rgba::unpack(self.color)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        bytemuck::cast(*self)
    }

    /// Decode one record from the front of `bytes`. Alignment is not required.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes.get(..Self::SIZE)?).ok()
    }

    /// Per-instance vertex buffer layout matching [`INSTANCE_ATTRIBUTES`].
    pub fn vertex_layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: Self::SIZE as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &Self::WGPU_ATTRIBUTES,
        }
    }
}
