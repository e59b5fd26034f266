use std::fmt;

/// Counters for one [`render`](super::Backend::render) call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Instances drawn.
    pub instances: u64,
    /// Draw calls issued.
    pub draw_calls: u32,
    /// Batch flushes, explicit and implicit.
    pub flushes: u32,
    /// Program, texture and blend changes that reached the device.
    pub state_changes: u32,
    /// State calls suppressed by the cache.
    pub redundant_state_skips: u32,
    /// Glyphs rasterized and placed in an atlas.
    pub glyphs_inserted: u32,
    pub atlas_resets: u32,
    pub atlas_grows: u32,
    /// Rows whose layers were rebuilt rather than reused.
    pub rows_rebuilt: u32,
    /// Device-loss recoveries performed while producing this frame.
    pub recoveries: u32,
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} instances in {} draws ({} flushes), state {} applied / {} skipped, \
             {} glyphs inserted, atlas {} grows / {} resets, {} rows rebuilt",
            self.instances,
            self.draw_calls,
            self.flushes,
            self.state_changes,
            self.redundant_state_skips,
            self.glyphs_inserted,
            self.atlas_grows,
            self.atlas_resets,
            self.rows_rebuilt
        )?;
        if self.recoveries > 0 {
            write!(f, ", {} recoveries", self.recoveries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mentions_recoveries_only_when_present() {
        let mut stats = FrameStats {
            instances: 12,
            draw_calls: 1,
            ..Default::default()
        };
        let text = stats.to_string();
        assert!(text.starts_with("12 instances in 1 draws"));
        assert!(!text.contains("recoveries"));

        stats.recoveries = 1;
        assert!(stats.to_string().ends_with("1 recoveries"));
    }
}
