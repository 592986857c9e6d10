//! The page cache: guest code and data bytes the host has handed over, kept
//! per session so concurrent host sessions share them, and mapped into the
//! engine on demand when execution faults on a missing page.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, trace};

use crate::engine::EngineState;
use crate::ir::Address;
use crate::mem::{page_base, PAGE_SIZE};

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache address {0:#x} is not page aligned")]
    Misaligned(Address),

    #[error(
        "range {addr:#x}+{len:#x} overlaps a cached region with permissions {existing:#x} != {requested:#x}"
    )]
    PermissionConflict {
        addr: Address,
        len: u64,
        existing: u64,
        requested: u64,
    },
}

/// One contiguous cached region.
#[derive(Debug, Clone)]
pub struct CachedPage {
    pub bytes: Vec<u8>,
    pub perms: u64,
}

impl CachedPage {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Cached guest bytes, keyed by region start address. Adjacent regions with
/// equal permissions are kept merged.
#[derive(Debug, Default)]
pub struct PageCache {
    regions: BTreeMap<Address, CachedPage>,
}

impl PageCache {
    /// Cache `bytes` at `addr`, merging with any adjacent or overlapping
    /// region of equal permissions. New bytes win where ranges overlap.
    /// Returns the resulting region's start and length.
    pub fn cache_page(
        &mut self,
        addr: Address,
        bytes: &[u8],
        perms: u64,
    ) -> Result<(Address, u64), CacheError> {
        if addr != page_base(addr) {
            return Err(CacheError::Misaligned(addr));
        }
        let len = bytes.len() as u64;
        let end = addr + len;

        // Everything intersecting or exactly adjacent to the new range.
        let neighbors: Vec<Address> = self
            .regions
            .iter()
            .filter(|(&base, region)| base <= end && base + region.size() >= addr)
            .map(|(&base, _)| base)
            .collect();

        for &base in &neighbors {
            let region = &self.regions[&base];
            let intersects = base < end && base + region.size() > addr;
            if region.perms != perms && intersects {
                return Err(CacheError::PermissionConflict {
                    addr,
                    len,
                    existing: region.perms,
                    requested: perms,
                });
            }
        }

        let mut merged_start = addr;
        let mut merged_end = end;
        let mut absorbed = Vec::new();
        for base in neighbors {
            let region = self.regions.remove(&base).unwrap();
            if region.perms == perms {
                merged_start = merged_start.min(base);
                merged_end = merged_end.max(base + region.size());
                absorbed.push((base, region));
            } else {
                // Adjacent but not overlapping; leave it alone.
                self.regions.insert(base, region);
            }
        }

        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        for (base, region) in absorbed {
            let offset = (base - merged_start) as usize;
            merged[offset..offset + region.bytes.len()].copy_from_slice(&region.bytes);
        }
        let offset = (addr - merged_start) as usize;
        merged[offset..offset + bytes.len()].copy_from_slice(bytes);

        trace!(
            "cached {len:#x} bytes at {addr:#x}, region now {merged_start:#x}+{:#x}",
            merged_end - merged_start
        );
        self.regions.insert(
            merged_start,
            CachedPage {
                bytes: merged,
                perms,
            },
        );
        Ok((merged_start, merged_end - merged_start))
    }

    fn region_containing(&self, addr: Address) -> Option<(Address, &CachedPage)> {
        self.regions
            .range(..=addr)
            .next_back()
            .filter(|(&base, region)| addr < base + region.size())
            .map(|(&base, region)| (base, region))
    }

    pub fn in_cache(&self, addr: Address) -> bool {
        self.region_containing(addr).is_some()
    }

    /// Remove exactly one page, splitting the containing region if needed.
    pub fn wipe_page(&mut self, addr: Address) {
        let page = page_base(addr);
        let Some((base, _)) = self.region_containing(page) else {
            return;
        };
        let region = self.regions.remove(&base).unwrap();
        let end = base + region.size();

        if page > base {
            let left = region.bytes[..(page - base) as usize].to_vec();
            self.regions.insert(
                base,
                CachedPage {
                    bytes: left,
                    perms: region.perms,
                },
            );
        }
        let right_start = page + PAGE_SIZE as u64;
        if right_start < end {
            let right = region.bytes[(right_start - base) as usize..].to_vec();
            self.regions.insert(
                right_start,
                CachedPage {
                    bytes: right,
                    perms: region.perms,
                },
            );
        }
        debug!("wiped cached page {page:#x}");
    }

    /// Drop every cached region intersecting `[addr, addr + len)`.
    pub fn uncache_pages_touching_region(&mut self, addr: Address, len: u64) {
        let end = addr.saturating_add(len);
        let victims: Vec<Address> = self
            .regions
            .iter()
            .filter(|(&base, region)| base < end && base + region.size() > addr)
            .map(|(&base, _)| base)
            .collect();
        for base in victims {
            self.regions.remove(&base);
            debug!("uncached region at {base:#x}");
        }
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Map the cached bytes covering `[addr, addr + size)` into the engine,
    /// page by page. Returns true only if the cache fully covers the range.
    pub fn map_cache(&self, state: &mut dyn EngineState, addr: Address, size: u64) -> bool {
        let start = page_base(addr);
        let end = addr.saturating_add(size.max(1));

        let mut page = start;
        while page < end {
            let Some((base, region)) = self.region_containing(page) else {
                return false;
            };
            if base + region.size() < page + PAGE_SIZE as u64 {
                // Region ends inside the page; coverage is partial.
                return false;
            }
            page += PAGE_SIZE as u64;
        }

        let mut page = start;
        while page < end {
            // Coverage was checked above.
            let (base, region) = self.region_containing(page).unwrap();
            let offset = (page - base) as usize;
            let bytes = &region.bytes[offset..offset + PAGE_SIZE];
            if state.map_page(page, region.perms, bytes).is_err() {
                return false;
            }
            trace!("mapped cached page {page:#x} into engine");
            page += PAGE_SIZE as u64;
        }
        true
    }
}

static SESSION_CACHES: OnceLock<Mutex<HashMap<u64, Arc<Mutex<PageCache>>>>> = OnceLock::new();

/// The page cache shared by every controller allocated under `session_key`.
/// Mutating use is single-threaded per session by contract; the lock exists
/// to make the process-global registry sound.
pub fn session_cache(session_key: u64) -> Arc<Mutex<PageCache>> {
    let registry = SESSION_CACHES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut registry = registry.lock().expect("session cache registry poisoned");
    registry
        .entry(session_key)
        .or_insert_with(|| Arc::new(Mutex::new(PageCache::default())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::GuestArch;
    use crate::engine::{AccessError, AccessResult, EngineRegId};

    #[derive(Default)]
    struct MapRecorder {
        mapped: Vec<(Address, u64)>,
    }

    impl EngineState for MapRecorder {
        fn arch(&self) -> GuestArch {
            GuestArch::Amd64
        }

        fn read_register(&self, reg: EngineRegId, _out: &mut [u8]) -> AccessResult<()> {
            Err(AccessError::NoSuchRegister(reg))
        }

        fn write_register(&mut self, reg: EngineRegId, _value: &[u8]) -> AccessResult<()> {
            Err(AccessError::NoSuchRegister(reg))
        }

        fn read_memory(&self, addr: u64, out: &mut [u8]) -> AccessResult<()> {
            Err(AccessError::Unmapped {
                addr,
                size: out.len() as u64,
            })
        }

        fn map_page(&mut self, addr: u64, perms: u64, bytes: &[u8]) -> AccessResult<()> {
            assert_eq!(bytes.len(), PAGE_SIZE);
            self.mapped.push((addr, perms));
            Ok(())
        }
    }

    #[test]
    fn adjacent_regions_with_equal_perms_merge() {
        let mut cache = PageCache::default();
        cache.cache_page(0x1000, &[1; PAGE_SIZE], 5).unwrap();
        let (base, len) = cache.cache_page(0x2000, &[2; PAGE_SIZE], 5).unwrap();
        assert_eq!((base, len), (0x1000, 2 * PAGE_SIZE as u64));
        assert!(cache.in_cache(0x1fff));
        assert!(cache.in_cache(0x2fff));
        assert!(!cache.in_cache(0x3000));
    }

    #[test]
    fn adjacent_regions_with_differing_perms_stay_separate() {
        let mut cache = PageCache::default();
        cache.cache_page(0x1000, &[1; PAGE_SIZE], 5).unwrap();
        let (base, len) = cache.cache_page(0x2000, &[2; PAGE_SIZE], 3).unwrap();
        assert_eq!((base, len), (0x2000, PAGE_SIZE as u64));
    }

    #[test]
    fn overlap_with_differing_perms_is_rejected() {
        let mut cache = PageCache::default();
        cache.cache_page(0x1000, &[1; 2 * PAGE_SIZE], 5).unwrap();
        let err = cache.cache_page(0x1000, &[2; PAGE_SIZE], 7).unwrap_err();
        assert!(matches!(err, CacheError::PermissionConflict { .. }));
        // The original region is untouched.
        assert!(cache.in_cache(0x1000));
    }

    #[test]
    fn misaligned_addresses_are_rejected() {
        let mut cache = PageCache::default();
        assert!(matches!(
            cache.cache_page(0x1004, &[0; PAGE_SIZE], 5),
            Err(CacheError::Misaligned(0x1004))
        ));
    }

    #[test]
    fn uncache_spanning_region_leaves_nothing() {
        let mut cache = PageCache::default();
        cache.cache_page(0x1000, &[1; PAGE_SIZE], 5).unwrap();
        cache.uncache_pages_touching_region(0x1800, 0x10);
        assert!(!cache.in_cache(0x1000));
        assert!(!cache.in_cache(0x1800));
    }

    #[test]
    fn wipe_page_splits_the_region() {
        let mut cache = PageCache::default();
        cache.cache_page(0x1000, &[1; 3 * PAGE_SIZE], 5).unwrap();
        cache.wipe_page(0x2000);
        assert!(cache.in_cache(0x1000));
        assert!(!cache.in_cache(0x2000));
        assert!(cache.in_cache(0x3000));
    }

    #[test]
    fn map_cache_requires_full_coverage() {
        let mut cache = PageCache::default();
        let mut state = MapRecorder::default();
        cache.cache_page(0x1000, &[1; PAGE_SIZE], 5).unwrap();

        assert!(!cache.map_cache(&mut state, 0x1000, 2 * PAGE_SIZE as u64));
        assert!(state.mapped.is_empty());

        assert!(cache.map_cache(&mut state, 0x1000, PAGE_SIZE as u64));
        assert_eq!(state.mapped, vec![(0x1000, 5)]);
    }

    #[test]
    fn session_caches_are_shared_by_key() {
        let a = session_cache(0xdead_0001);
        let b = session_cache(0xdead_0001);
        let c = session_cache(0xdead_0002);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        a.lock()
            .unwrap()
            .cache_page(0x5000, &[0; PAGE_SIZE], 5)
            .unwrap();
        assert!(b.lock().unwrap().in_cache(0x5000));
    }
}
