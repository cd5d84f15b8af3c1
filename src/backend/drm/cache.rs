//! Bounded LRU mapping imported buffer identities to framebuffers

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use indexmap::IndexMap;
use tracing::trace;

use super::{device::GemHandle, framebuffer::HardwareFramebuffer};

/// Least-recently-used cache of [`HardwareFramebuffer`]s keyed by import identity
///
/// Evicted entries are only dropped from the cache; a frame still on screen
/// keeps its framebuffer alive until it is replaced. Such a framebuffer is
/// still found by [`get`](BufferCache::get), so an identity never maps to two
/// live framebuffers sharing one buffer object.
#[derive(Debug)]
pub struct BufferCache {
    capacity: usize,
    // least recently used first
    entries: IndexMap<GemHandle, Arc<HardwareFramebuffer>>,
    evicted: HashMap<GemHandle, Weak<HardwareFramebuffer>>,
}

impl BufferCache {
    /// Creates a cache holding at most `capacity` framebuffers
    pub fn new(capacity: usize) -> BufferCache {
        BufferCache {
            capacity: capacity.max(1),
            entries: IndexMap::with_capacity(capacity),
            evicted: HashMap::new(),
        }
    }

    /// Maximum amount of entries
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes the capacity, evicting the oldest entries if needed
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            self.evict_oldest();
        }
    }

    /// Amount of cached framebuffers
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a framebuffer and marks it most recently used
    ///
    /// An evicted framebuffer that is still alive is taken back into the cache.
    pub fn get(&mut self, key: GemHandle) -> Option<Arc<HardwareFramebuffer>> {
        if let Some(fb) = self.entries.shift_remove(&key) {
            self.entries.insert(key, fb.clone());
            return Some(fb);
        }
        let fb = self.evicted.remove(&key)?.upgrade()?;
        trace!(gem = ?key, "Reviving framebuffer still in flight");
        self.set(key, fb.clone());
        Some(fb)
    }

    /// Inserts a framebuffer, evicting the least recently used one when full
    ///
    /// An existing entry for the same identity is replaced.
    pub fn set(&mut self, key: GemHandle, fb: Arc<HardwareFramebuffer>) {
        self.evicted.remove(&key);
        if self.entries.shift_remove(&key).is_none() && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(key, fb);
    }

    /// Drops the entry for `key`
    pub fn remove(&mut self, key: GemHandle) -> Option<Arc<HardwareFramebuffer>> {
        let fb = self.entries.shift_remove(&key)?;
        self.track(key, &fb);
        Some(fb)
    }

    /// Drops every entry
    pub fn clear(&mut self) {
        for (key, fb) in std::mem::take(&mut self.entries) {
            self.track(key, &fb);
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((key, fb)) = self.entries.shift_remove_index(0) {
            trace!(gem = ?key, "Evicting framebuffer from cache");
            self.track(key, &fb);
        }
    }

    fn track(&mut self, key: GemHandle, fb: &Arc<HardwareFramebuffer>) {
        self.evicted.retain(|_, weak| weak.strong_count() > 0);
        // the caller's reference is about to go
        if Arc::strong_count(fb) > 1 {
            self.evicted.insert(key, Arc::downgrade(fb));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{
        allocator::{test::buffer, Fourcc},
        drm::{
            device::{test::MockDevice, KmsDevice},
            topology::Topology,
        },
    };

    fn framebuffer(device: &Arc<dyn KmsDevice>, gem: u32) -> Arc<HardwareFramebuffer> {
        let buffer = buffer(8, 8, Fourcc::Xrgb8888);
        Arc::new(HardwareFramebuffer::create(device, GemHandle(gem), &buffer).unwrap())
    }

    #[test]
    fn set_then_get_returns_same_framebuffer() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let mut cache = BufferCache::new(4);

        let fb = framebuffer(&device, 1);
        cache.set(GemHandle(1), fb.clone());
        let hit = cache.get(GemHandle(1)).unwrap();
        assert!(Arc::ptr_eq(&fb, &hit));
        assert!(cache.get(GemHandle(2)).is_none());
        assert_eq!(mock.framebuffers.lock().unwrap().len(), 1);
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let mut cache = BufferCache::new(3);

        for gem in 1..=3 {
            cache.set(GemHandle(gem), framebuffer(&device, gem));
        }
        // touch 1, leaving 2 as the oldest
        assert!(cache.get(GemHandle(1)).is_some());
        cache.set(GemHandle(4), framebuffer(&device, 4));

        assert_eq!(cache.len(), 3);
        assert!(cache.get(GemHandle(2)).is_none());
        for gem in [1, 3, 4] {
            assert!(cache.get(GemHandle(gem)).is_some());
        }
        // the evicted framebuffer was the only reference and got released
        assert_eq!(*mock.closed.lock().unwrap(), vec![GemHandle(2)]);
        assert_eq!(mock.live_framebuffers(), 3);
    }

    #[test]
    fn eviction_keeps_frames_in_flight_alive() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let mut cache = BufferCache::new(1);

        let on_screen = framebuffer(&device, 1);
        cache.set(GemHandle(1), on_screen.clone());
        cache.set(GemHandle(2), framebuffer(&device, 2));
        assert!(cache.get(GemHandle(1)).is_none());
        assert!(mock.removed.lock().unwrap().is_empty());

        drop(on_screen);
        assert_eq!(mock.removed.lock().unwrap().len(), 1);
    }

    #[test]
    fn evicted_framebuffer_in_flight_is_found_again() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let mut cache = BufferCache::new(1);

        let on_screen = framebuffer(&device, 1);
        cache.set(GemHandle(1), on_screen.clone());
        cache.set(GemHandle(2), framebuffer(&device, 2));

        let hit = cache.get(GemHandle(1)).unwrap();
        assert!(Arc::ptr_eq(&on_screen, &hit));
        assert_eq!(cache.len(), 1);
        // taking 1 back evicted 2, which nobody else held
        assert_eq!(*mock.closed.lock().unwrap(), vec![GemHandle(2)]);

        drop(hit);
        drop(on_screen);
        assert!(cache.get(GemHandle(1)).is_some());
        assert!(cache.get(GemHandle(2)).is_none());
    }

    #[test]
    fn released_framebuffers_are_not_revived() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let mut cache = BufferCache::new(1);

        let on_screen = framebuffer(&device, 1);
        cache.set(GemHandle(1), on_screen.clone());
        cache.clear();
        drop(on_screen);

        assert!(cache.get(GemHandle(1)).is_none());
        assert_eq!(*mock.closed.lock().unwrap(), vec![GemHandle(1)]);
    }

    #[test]
    fn replacing_an_identity_keeps_one_entry() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let mut cache = BufferCache::new(2);

        cache.set(GemHandle(1), framebuffer(&device, 1));
        cache.set(GemHandle(2), framebuffer(&device, 2));
        cache.set(GemHandle(1), framebuffer(&device, 1));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(GemHandle(2)).is_some());
    }
}
