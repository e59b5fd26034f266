/// An 8-bit RGBA color with straight (non-premultiplied) alpha, as supplied by
/// the host.
///
/// ```
/// use cellgrid_render::Rgba;
///
/// let red = Rgba::rgb(0xFF, 0, 0);
/// let from_hex = Rgba::from_hex(0xFF8800);
/// assert_eq!(red.premultiplied(), red);
/// assert_eq!(Rgba::new(255, 255, 255, 128).premultiplied(), Rgba::new(128, 128, 128, 128));
/// ```
///
/// Everything downstream of the payload is premultiplied; the instance record
/// stores [`Rgba::pack_premultiplied`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const WHITE: Rgba = Rgba::rgb(0xFF, 0xFF, 0xFF);
    pub const BLACK: Rgba = Rgba::rgb(0, 0, 0);
    pub const RED: Rgba = Rgba::rgb(0xFF, 0, 0);
    pub const TRANSPARENT: Rgba = Rgba::new(0, 0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Opaque color.
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 0xFF }
    }

    /// Create a color from a 24-bit RGB hex value (e.g. `0xFF8800`).
    pub const fn from_hex(hex: u32) -> Self {
        Self::rgb((hex >> 16) as u8, (hex >> 8) as u8, hex as u8)
    }

    /// Scale RGB by alpha, rounding to nearest.
    pub fn premultiplied(self) -> Self {
        let scale = |c: u8| ((c as u32 * self.a as u32 + 127) / 255) as u8;
        Self {
            r: scale(self.r),
            g: scale(self.g),
            b: scale(self.b),
            a: self.a,
        }
    }

    /// Pack as it appears in memory: R in the low byte, A in the high byte.
    pub const fn pack(self) -> u32 {
        u32::from_le_bytes([self.r, self.g, self.b, self.a])
    }

    pub const fn unpack(packed: u32) -> Self {
        let [r, g, b, a] = packed.to_le_bytes();
        Self { r, g, b, a }
    }

    pub fn pack_premultiplied(self) -> u32 {
        self.premultiplied().pack()
    }

    /// Components in `0.0..=1.0`, premultiplied.
    pub fn to_premultiplied_array(self) -> [f32; 4] {
        let p = self.premultiplied();
        [
            p.r as f32 / 255.0,
            p.g as f32 / 255.0,
            p.b as f32 / 255.0,
            p.a as f32 / 255.0,
        ]
    }

    pub fn to_wgpu(self) -> wgpu::Color {
        let [r, g, b, a] = self.to_premultiplied_array();
        wgpu::Color {
            r: r as f64,
            g: g as f64,
            b: b as f64,
            a: a as f64,
        }
    }
}

impl From<[u8; 4]> for Rgba {
    fn from([r, g, b, a]: [u8; 4]) -> Self {
        Self { r, g, b, a }
    }
}
