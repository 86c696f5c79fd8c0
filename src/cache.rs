use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::DEFAULT_EVICTION_LOOKBACK;
use crate::device::{ComputeCapability, DeviceIdentity, PlatformKind};

/// Key identifying which devices can run one compiled binary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KernelSelector {
    /// Nvidia devices of equal compute capability load each other's binaries.
    Compute(ComputeCapability),
    /// Other platforms match on exact device name.
    Name { platform: PlatformKind, name: String },
}

impl KernelSelector {
    pub fn for_device(identity: &DeviceIdentity) -> Self {
        match (identity.platform, identity.compute) {
            (PlatformKind::Nvidia, Some(compute)) => KernelSelector::Compute(compute),
            _ => KernelSelector::Name {
                platform: identity.platform,
                name: identity.name.clone(),
            },
        }
    }
}

#[derive(Debug)]
struct CachedKernel {
    selector: KernelSelector,
    period: u32,
    binary: Arc<[u8]>,
}

/// Process-wide store of compiled search-kernel binaries, shared by every
/// device worker through an `Arc`.
///
/// Two locks with distinct jobs: `entries` linearizes lookups and inserts and
/// is held O(cache size); `build` serializes vendor-compiler invocations
/// process-wide, because the native toolchains are not reliably reentrant
/// across threads. Workers holding `build` must not hold `entries`.
pub struct KernelCache {
    entries: Mutex<Vec<CachedKernel>>,
    build: Mutex<()>,
    /// High-water mark of the most recently requested period.
    latest_period: AtomicU32,
    lookback: u32,
}

impl KernelCache {
    pub fn new(lookback: u32) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            build: Mutex::new(()),
            latest_period: AtomicU32::new(0),
            lookback,
        }
    }

    /// Records that `period` was requested, advancing the high-water mark
    /// eviction is measured against.
    pub fn note_requested(&self, period: u32) {
        self.latest_period.fetch_max(period, Ordering::Relaxed);
    }

    pub fn latest_requested(&self) -> u32 {
        self.latest_period.load(Ordering::Relaxed)
    }

    pub fn lookup(&self, selector: &KernelSelector, period: u32) -> Option<Arc<[u8]>> {
        let entries = lock(&self.entries);
        entries
            .iter()
            .find(|entry| entry.period == period && entry.selector == *selector)
            .map(|entry| Arc::clone(&entry.binary))
    }

    /// Stores a freshly compiled binary. An existing entry for the same
    /// (selector, period) pair is replaced wholesale, keeping the pair
    /// unique.
    pub fn insert(&self, selector: KernelSelector, period: u32, binary: Vec<u8>) {
        let binary: Arc<[u8]> = binary.into();
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries
            .iter_mut()
            .find(|entry| entry.period == period && entry.selector == selector)
        {
            existing.binary = binary;
            return;
        }
        entries.push(CachedKernel {
            selector,
            period,
            binary,
        });
    }

    /// Drops every entry more than `lookback` periods behind the high-water
    /// mark. Removal order does not matter, so stale entries are swapped with
    /// the tail.
    pub fn evict_stale(&self) {
        let latest = self.latest_period.load(Ordering::Relaxed);
        let mut entries = lock(&self.entries);
        let mut index = 0;
        while index < entries.len() {
            if entries[index].period + self.lookback < latest {
                entries.swap_remove(index);
            } else {
                index += 1;
            }
        }
    }

    /// Serializes native kernel compilation; hold the returned guard across
    /// the vendor compiler call.
    pub fn build_guard(&self) -> MutexGuard<'_, ()> {
        lock(&self.build)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KernelCache {
    fn default() -> Self {
        Self::new(DEFAULT_EVICTION_LOOKBACK)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_selector(name: &str) -> KernelSelector {
        KernelSelector::Name {
            platform: PlatformKind::Amd,
            name: name.to_owned(),
        }
    }

    fn compute_selector(major: u32, minor: u32) -> KernelSelector {
        KernelSelector::Compute(ComputeCapability { major, minor })
    }

    #[test]
    fn lookup_misses_other_selectors_and_periods() {
        let cache = KernelCache::default();
        cache.insert(name_selector("gfx1030"), 100, vec![1, 2, 3]);

        assert!(cache.lookup(&name_selector("gfx1030"), 100).is_some());
        assert!(cache.lookup(&name_selector("gfx1030"), 101).is_none());
        assert!(cache.lookup(&name_selector("gfx900"), 100).is_none());
        assert!(cache.lookup(&compute_selector(6, 1), 100).is_none());
    }

    #[test]
    fn insert_replaces_the_same_pair() {
        let cache = KernelCache::default();
        cache.insert(compute_selector(8, 6), 42, vec![1]);
        cache.insert(compute_selector(8, 6), 42, vec![2]);

        assert_eq!(cache.len(), 1);
        let binary = cache.lookup(&compute_selector(8, 6), 42).expect("entry");
        assert_eq!(&binary[..], &[2]);
    }

    #[test]
    fn same_capability_devices_share_a_selector() {
        let a = DeviceIdentity {
            platform: PlatformKind::Nvidia,
            unique_id: "01:00.0".to_owned(),
            name: "GeForce A".to_owned(),
            compute: Some(ComputeCapability { major: 8, minor: 6 }),
            total_memory: 8 << 30,
            max_work_group_size: 1024,
            compute_units: 40,
        };
        let mut b = a.clone();
        b.unique_id = "02:00.0".to_owned();
        b.name = "GeForce B".to_owned();

        assert_eq!(KernelSelector::for_device(&a), KernelSelector::for_device(&b));

        let mut amd = a.clone();
        amd.platform = PlatformKind::Amd;
        amd.compute = None;
        assert_ne!(KernelSelector::for_device(&a), KernelSelector::for_device(&amd));
    }

    #[test]
    fn eviction_keeps_the_lookback_window() {
        let cache = KernelCache::new(2);
        let base = 100;
        for period in base..base + 6 {
            cache.note_requested(period);
            cache.insert(name_selector("gfx1030"), period, vec![period as u8]);
        }
        cache.evict_stale();

        let latest = cache.latest_requested();
        assert_eq!(latest, base + 5);
        for period in base..base + 6 {
            let hit = cache.lookup(&name_selector("gfx1030"), period).is_some();
            assert_eq!(hit, period + 2 >= latest, "period {period}");
        }
    }

    #[test]
    fn eviction_handles_consecutive_stale_entries() {
        let cache = KernelCache::new(2);
        for period in [1, 2, 3, 90, 91, 100] {
            cache.insert(name_selector("gfx1030"), period, vec![0]);
        }
        cache.note_requested(100);
        cache.evict_stale();

        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&name_selector("gfx1030"), 100).is_some());
    }

    #[test]
    fn high_water_mark_is_monotonic() {
        let cache = KernelCache::default();
        cache.note_requested(50);
        cache.note_requested(48);
        assert_eq!(cache.latest_requested(), 50);
    }
}
