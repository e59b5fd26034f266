//! Redundant state-change suppression.

use cellgrid_gpu::{BlendConfig, DeviceResult, GraphicsDevice, ProgramId, TextureId};

/// Texture units tracked by the cache.
pub const MAX_TEXTURE_UNITS: usize = 4;

/// Counters since the last [`StateCache::take_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCacheStats {
    /// Calls forwarded to the device.
    pub applied: u32,
    /// Calls suppressed because the state already matched.
    pub skipped: u32,
}

/// Last state applied through the device. `None` means unknown; the next
/// call for that slot always reaches the device.
#[derive(Debug, Default)]
pub struct StateCache {
    program: Option<ProgramId>,
    textures: [Option<TextureId>; MAX_TEXTURE_UNITS],
    blend: Option<BlendConfig>,
    stats: StateCacheStats,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_program(
        &mut self,
        device: &mut dyn GraphicsDevice,
        program: ProgramId,
    ) -> DeviceResult<()> {
        if self.program == Some(program) {
            self.stats.skipped += 1;
            return Ok(());
        }
        device.set_program(program)?;
        self.program = Some(program);
        self.stats.applied += 1;
        Ok(())
    }

    /// Units outside `0..MAX_TEXTURE_UNITS` are not cached and always forwarded.
    pub fn bind_texture(
        &mut self,
        device: &mut dyn GraphicsDevice,
        unit: u32,
        texture: TextureId,
    ) -> DeviceResult<()> {
        if !self.would_change_texture(unit, texture) {
            self.stats.skipped += 1;
            return Ok(());
        }
        device.bind_texture(unit, texture)?;
        if let Some(slot) = self.textures.get_mut(unit as usize) {
            *slot = Some(texture);
        }
        self.stats.applied += 1;
        Ok(())
    }

    pub fn set_blend(
        &mut self,
        device: &mut dyn GraphicsDevice,
        blend: BlendConfig,
    ) -> DeviceResult<()> {
        if self.blend == Some(blend) {
            self.stats.skipped += 1;
            return Ok(());
        }
        device.set_blend(blend)?;
        self.blend = Some(blend);
        self.stats.applied += 1;
        Ok(())
    }

    /// True if binding `texture` to `unit` would reach the device.
    pub fn would_change_texture(&self, unit: u32, texture: TextureId) -> bool {
        match self.textures.get(unit as usize) {
            Some(bound) => *bound != Some(texture),
            None => true,
        }
    }

    /// Forget everything. Required after device re-init, after an atlas
    /// texture is replaced, and after any state change made outside the cache.
    pub fn reset(&mut self) {
        self.program = None;
        self.textures = [None; MAX_TEXTURE_UNITS];
        self.blend = None;
    }

    pub fn stats(&self) -> StateCacheStats {
        self.stats
    }

    /// Return the counters and zero them.
    pub fn take_stats(&mut self) -> StateCacheStats {
        std::mem::take(&mut self.stats)
    }
}

#[cfg(test)]
mod tests {
    use cellgrid_gpu::{MockDevice, ProgramDesc, TextureDesc, TextureFormat};

    use super::*;

    fn program(device: &mut MockDevice) -> ProgramId {
        device
            .create_program(&ProgramDesc {
                label: "test",
                source: "fn vs_main() {} fn fs_main() {}",
                vertex_entry: "vs_main",
                fragment_entry: "fs_main",
                dual_source: false,
            })
            .unwrap()
    }

    #[test]
    fn test_set_program_twice_issues_one_call() {
        let (mut device, probe) = MockDevice::new();
        let id = program(&mut device);
        let mut cache = StateCache::new();

        cache.set_program(&mut device, id).unwrap();
        cache.set_program(&mut device, id).unwrap();

        assert_eq!(probe.count_set_program(), 1);
        assert_eq!(cache.stats(), StateCacheStats { applied: 1, skipped: 1 });
    }

    #[test]
    fn test_reset_forces_reapply() {
        let (mut device, probe) = MockDevice::new();
        let id = program(&mut device);
        let mut cache = StateCache::new();

        cache.set_program(&mut device, id).unwrap();
        cache.set_blend(&mut device, BlendConfig::PREMULTIPLIED).unwrap();
        cache.reset();
        cache.set_program(&mut device, id).unwrap();
        cache.set_blend(&mut device, BlendConfig::PREMULTIPLIED).unwrap();

        assert_eq!(probe.count_set_program(), 2);
        assert_eq!(probe.count_set_blend(), 2);
    }

    #[test]
    fn test_texture_units_are_independent() {
        let (mut device, probe) = MockDevice::new();
        let desc = TextureDesc {
            label: "atlas",
            width: 64,
            height: 64,
            format: TextureFormat::R8,
        };
        let a = device.create_texture(&desc).unwrap();
        let b = device.create_texture(&desc).unwrap();
        let mut cache = StateCache::new();

        cache.bind_texture(&mut device, 0, a).unwrap();
        cache.bind_texture(&mut device, 1, b).unwrap();
        cache.bind_texture(&mut device, 0, a).unwrap();
        assert!(cache.would_change_texture(0, b));
        assert!(!cache.would_change_texture(1, b));
        assert_eq!(probe.count_bind_texture(), 2);
    }

    #[test]
    fn test_failed_call_leaves_cache_unknown() {
        let (mut device, probe) = MockDevice::new();
        let id = program(&mut device);
        let mut cache = StateCache::new();

        probe.lose_device();
        assert!(cache.set_program(&mut device, id).is_err());
        assert_eq!(cache.stats().applied, 0);
    }
}
