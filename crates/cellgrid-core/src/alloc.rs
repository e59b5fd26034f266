//! Hash collections used across the renderer.
//!
//! Glyph lookups and pipeline caches sit on the per-frame path, so they use
//! AHash instead of SipHash.

pub use ahash::{AHashMap as HashMap, AHashSet as HashSet, RandomState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashmap_ahash() {
        let mut map = HashMap::new();
        map.insert((1u32, 42u32), "glyph");
        assert_eq!(map.get(&(1, 42)), Some(&"glyph"));
    }

    #[test]
    fn test_hashset_ahash() {
        let mut set = HashSet::new();
        set.insert(7u64);
        assert!(set.contains(&7));
        assert!(!set.contains(&8));
    }
}
