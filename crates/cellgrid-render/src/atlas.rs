//! Glyph cache: a growable atlas texture with skyline packing.
//!
//! Entries are never evicted one by one. When the packer cannot place a glyph
//! even after growing the texture once, the whole atlas is reset and the
//! caller re-inserts what the current frame needs.

use std::fmt;

use cellgrid_core::alloc::HashMap;
use cellgrid_core::geometry::Rect;
use cellgrid_gpu::{
    DeviceError, DeviceResult, GraphicsDevice, TextureDesc, TextureFormat, TextureId,
    TextureRegion,
};

use crate::capability::AtlasUploadPath;
use crate::payload::GlyphKey;

/// Texel rectangle of one glyph inside the atlas.
pub type AtlasRegion = Rect<u32>;

/// Why an insert did not produce a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtlasError {
    /// The atlas was full and has been reset. Every previously returned region
    /// is invalid; re-insert the glyph.
    Full,
    /// The glyph exceeds the largest texture the atlas may use.
    GlyphTooLarge { width: u32, height: u32, max: u32 },
    /// `pixels` is shorter than `width * height * bytes_per_pixel`.
    InvalidData { expected: usize, actual: usize },
    Device(DeviceError),
}

impl fmt::Display for AtlasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "Glyph atlas full; atlas was reset"),
            Self::GlyphTooLarge { width, height, max } => write!(
                f,
                "Glyph of {}x{} exceeds the maximum atlas dimension {}",
                width, height, max
            ),
            Self::InvalidData { expected, actual } => write!(
                f,
                "Glyph pixel data too short: expected {} bytes, got {}",
                expected, actual
            ),
            Self::Device(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for AtlasError {}

impl From<DeviceError> for AtlasError {
    fn from(err: DeviceError) -> Self {
        AtlasError::Device(err)
    }
}

/// Cumulative atlas statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtlasStats {
    pub entries: usize,
    pub grows: u32,
    pub resets: u32,
    /// Texels covered by live entries.
    pub used_area: u64,
}

/// Empty texels kept right of and below every glyph.
const PADDING: u32 = 1;

#[derive(Debug, Clone, Copy)]
struct SkylineNode {
    x: u32,
    y: u32,
    width: u32,
}

/// Bottom-left skyline packer.
#[derive(Debug, Clone)]
struct SkylinePacker {
    width: u32,
    height: u32,
    nodes: Vec<SkylineNode>,
}

impl SkylinePacker {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            nodes: vec![SkylineNode { x: 0, y: 0, width }],
        }
    }

    /// Skyline span of a `width`-wide box at `x`: the box plus its right
    /// padding, cut at the atlas edge.
    fn span(&self, x: u32, width: u32) -> u32 {
        (width + PADDING).min(self.width - x)
    }

    /// Lowest y at which a `width`×`height` box fits starting at node `index`.
    fn fit(&self, index: usize, width: u32, height: u32) -> Option<u32> {
        let x = self.nodes[index].x;
        if x + width > self.width {
            return None;
        }
        let mut y = 0;
        let mut remaining = self.span(x, width);
        let mut i = index;
        while remaining > 0 {
            let node = self.nodes.get(i)?;
            y = y.max(node.y);
            if y + height > self.height {
                return None;
            }
            remaining = remaining.saturating_sub(node.width);
            i += 1;
        }
        Some(y)
    }

    /// Place a `width`×`height` box, reserving [`PADDING`] texels to its right
    /// and below.
    fn pack(&mut self, width: u32, height: u32) -> Option<(u32, u32)> {
        // (index, y, x): lowest y wins, then leftmost.
        let mut best: Option<(usize, u32, u32)> = None;
        for index in 0..self.nodes.len() {
            if let Some(y) = self.fit(index, width, height) {
                let x = self.nodes[index].x;
                if best.is_none_or(|(_, by, bx)| y < by || (y == by && x < bx)) {
                    best = Some((index, y, x));
                }
            }
        }
        let (index, y, x) = best?;
        let span = self.span(x, width);

        self.nodes.insert(
            index,
            SkylineNode {
                x,
                y: y + height + PADDING,
                width: span,
            },
        );

        // Trim the nodes now shadowed by the new one.
        let right = x + span;
        let i = index + 1;
        while i < self.nodes.len() {
            let node = &mut self.nodes[i];
            if node.x >= right {
                break;
            }
            let overlap = right - node.x;
            if node.width <= overlap {
                self.nodes.remove(i);
            } else {
                node.x += overlap;
                node.width -= overlap;
                break;
            }
        }

        self.merge();
        Some((x, y))
    }

    fn merge(&mut self) {
        let mut i = 0;
        while i + 1 < self.nodes.len() {
            if self.nodes[i].y == self.nodes[i + 1].y {
                self.nodes[i].width += self.nodes[i + 1].width;
                self.nodes.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Extend the packing area to `width`×`height`, keeping placed boxes.
    fn grow(&mut self, width: u32, height: u32) {
        if width > self.width {
            self.nodes.push(SkylineNode {
                x: self.width,
                y: 0,
                width: width - self.width,
            });
        }
        self.width = width;
        self.height = height;
        self.merge();
    }
}

struct StagedUpload {
    region: AtlasRegion,
    pixels: Vec<u8>,
}

/// Glyph cache keyed by [`GlyphKey`], backed by one square power-of-two texture.
pub struct GlyphAtlas {
    label: &'static str,
    format: TextureFormat,
    upload_path: AtlasUploadPath,
    initial_size: u32,
    max_size: u32,
    size: u32,
    texture: Option<TextureId>,
    packer: SkylinePacker,
    entries: HashMap<GlyphKey, AtlasRegion>,
    staged: Vec<StagedUpload>,
    stats: AtlasStats,
    generation: u64,
}

impl GlyphAtlas {
    /// Create the atlas and its backing texture.
    ///
    /// `initial_size` and `max_size` are rounded up to powers of two; the
    /// initial size never exceeds the maximum.
    pub fn new(
        device: &mut dyn GraphicsDevice,
        label: &'static str,
        format: TextureFormat,
        upload_path: AtlasUploadPath,
        initial_size: u32,
        max_size: u32,
    ) -> DeviceResult<Self> {
        let max_size = max_size.max(1).next_power_of_two();
        let initial_size = initial_size.max(1).next_power_of_two().min(max_size);

        let mut atlas = Self {
            label,
            format,
            upload_path,
            initial_size,
            max_size,
            size: initial_size,
            texture: None,
            packer: SkylinePacker::new(initial_size, initial_size),
            entries: HashMap::default(),
            staged: Vec::new(),
            stats: AtlasStats::default(),
            generation: 0,
        };
        atlas.texture = Some(atlas.create_texture(device, initial_size)?);

        tracing::debug!(
            "Created {} ({}x{}, max {}, {:?} uploads)",
            label,
            initial_size,
            initial_size,
            max_size,
            upload_path
        );
        Ok(atlas)
    }

    fn create_texture(&self, device: &mut dyn GraphicsDevice, size: u32) -> DeviceResult<TextureId> {
        device.create_texture(&TextureDesc {
            label: self.label,
            width: size,
            height: size,
            format: self.format,
        })
    }

    pub fn resolve(&self, key: &GlyphKey) -> Option<AtlasRegion> {
        self.entries.get(key).copied()
    }

    /// Place `pixels` (tightly packed rows) in the atlas under `key`.
    ///
    /// Inserting a key that is already present returns its existing region.
    pub fn insert(
        &mut self,
        device: &mut dyn GraphicsDevice,
        key: GlyphKey,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<AtlasRegion, AtlasError> {
        if let Some(region) = self.entries.get(&key) {
            return Ok(*region);
        }
        if width > self.max_size || height > self.max_size {
            return Err(AtlasError::GlyphTooLarge {
                width,
                height,
                max: self.max_size,
            });
        }
        let expected = width as usize * height as usize * self.format.bytes_per_pixel() as usize;
        if pixels.len() < expected {
            return Err(AtlasError::InvalidData {
                expected,
                actual: pixels.len(),
            });
        }

        let (x, y) = match self.packer.pack(width, height) {
            Some(position) => position,
            None => {
                let packed = if self.size < self.max_size {
                    self.grow(device)?;
                    self.packer.pack(width, height)
                } else {
                    None
                };
                match packed {
                    Some(position) => position,
                    None => {
                        tracing::debug!(
                            "{} full with {} entries, resetting",
                            self.label,
                            self.entries.len()
                        );
                        self.reset(device)?;
                        return Err(AtlasError::Full);
                    }
                }
            }
        };

        let region = AtlasRegion::new(x, y, width, height);
        if width > 0 && height > 0 {
            self.write(device, region, &pixels[..expected])?;
        }
        self.entries.insert(key, region);
        self.stats.entries = self.entries.len();
        self.stats.used_area += region.area();
        Ok(region)
    }

    fn write(
        &mut self,
        device: &mut dyn GraphicsDevice,
        region: AtlasRegion,
        pixels: &[u8],
    ) -> DeviceResult<()> {
        match self.upload_path {
            AtlasUploadPath::Immediate => {
                let texture = self.texture.ok_or(DeviceError::InvalidHandle("texture"))?;
                device.write_texture(
                    texture,
                    to_texture_region(region),
                    pixels,
                    region.width * self.format.bytes_per_pixel(),
                )
            }
            AtlasUploadPath::Staged => {
                self.staged.push(StagedUpload {
                    region,
                    pixels: pixels.to_vec(),
                });
                Ok(())
            }
        }
    }

    /// Double the texture, copying existing texels.
    fn grow(&mut self, device: &mut dyn GraphicsDevice) -> DeviceResult<()> {
        let new_size = (self.size * 2).min(self.max_size);
        let new_texture = self.create_texture(device, new_size)?;
        if let Some(old) = self.texture {
            if let Err(err) = device.copy_texture(old, new_texture, self.size, self.size) {
                device.destroy_texture(new_texture);
                return Err(err);
            }
            device.destroy_texture(old);
        }
        tracing::debug!("{} grew {} -> {}", self.label, self.size, new_size);

        self.texture = Some(new_texture);
        self.packer.grow(new_size, new_size);
        self.size = new_size;
        self.stats.grows += 1;
        self.generation += 1;
        Ok(())
    }

    /// Drop every entry and reallocate the texture at the initial size.
    pub fn reset(&mut self, device: &mut dyn GraphicsDevice) -> DeviceResult<()> {
        if let Some(texture) = self.texture.take() {
            device.destroy_texture(texture);
        }
        self.entries.clear();
        self.staged.clear();
        self.size = self.initial_size;
        self.packer = SkylinePacker::new(self.size, self.size);
        self.stats.entries = 0;
        self.stats.used_area = 0;
        self.stats.resets += 1;
        self.generation += 1;
        self.texture = Some(self.create_texture(device, self.size)?);
        Ok(())
    }

    /// Write queued uploads. Returns how many regions were written. A no-op
    /// on the immediate path.
    pub fn commit(&mut self, device: &mut dyn GraphicsDevice) -> DeviceResult<usize> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let texture = self.texture.ok_or(DeviceError::InvalidHandle("texture"))?;
        let bytes_per_pixel = self.format.bytes_per_pixel();
        let count = self.staged.len();
        for upload in self.staged.drain(..) {
            device.write_texture(
                texture,
                to_texture_region(upload.region),
                &upload.pixels,
                upload.region.width * bytes_per_pixel,
            )?;
        }
        Ok(count)
    }

    /// Destroy the texture. Safe to call more than once.
    pub fn release(&mut self, device: &mut dyn GraphicsDevice) {
        if let Some(texture) = self.texture.take() {
            device.destroy_texture(texture);
        }
        self.entries.clear();
        self.staged.clear();
    }

    /// Current backing texture, `None` after release.
    pub fn texture(&self) -> Option<TextureId> {
        self.texture
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn upload_path(&self) -> AtlasUploadPath {
        self.upload_path
    }

    /// Changes whenever existing regions or the texture handle may have changed.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> AtlasStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_uploads(&self) -> usize {
        self.staged.len()
    }

    /// Every live entry.
    pub fn iter(&self) -> impl Iterator<Item = (&GlyphKey, &AtlasRegion)> {
        self.entries.iter()
    }
}

fn to_texture_region(region: AtlasRegion) -> TextureRegion {
    TextureRegion {
        x: region.x,
        y: region.y,
        width: region.width,
        height: region.height,
    }
}
