//! A generic reference-counted resource cache.
//!
//! `RefCache` keeps at most N resources resident, keyed by a copyable key.
//! Resources are loaded and evicted through a [`CacheSource`], which lets
//! the page cache (load = read page, evict = flush if dirty), the data
//! manager's item cache and the version manager's entry cache share one
//! implementation.
//!
//! Callers own references explicitly: every successful `get` must be paired
//! with a `release`. When the last reference is released the evictor runs
//! and the slot is freed. A `get` for a key that another thread is currently
//! loading waits on a condvar rather than racing a duplicate load.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Pluggable load/evict capabilities for a [`RefCache`].
pub trait CacheSource {
    type Key: Eq + Hash + Copy;
    type Item;

    /// Produces the resource when it is not resident.
    fn load(&self, key: Self::Key) -> Result<Self::Item>;

    /// Invoked when the last reference is released (or at `close`), before
    /// the slot is freed.
    fn evict(&self, key: Self::Key, item: &Self::Item) -> Result<()>;
}

struct Slot<T> {
    value: Arc<T>,
    refs: usize,
}

struct State<K, T> {
    slots: HashMap<K, Slot<T>>,
    loading: HashSet<K>,
}

/// Reference-counted cache with at most `capacity` resident entries
/// (0 = unbounded). In-flight loads count against the capacity.
pub struct RefCache<S: CacheSource> {
    source: S,
    capacity: usize,
    state: Mutex<State<S::Key, S::Item>>,
    loaded: Condvar,
}

impl<S: CacheSource> RefCache<S> {
    pub fn new(source: S, capacity: usize) -> RefCache<S> {
        RefCache {
            source,
            capacity,
            state: Mutex::new(State {
                slots: HashMap::new(),
                loading: HashSet::new(),
            }),
            loaded: Condvar::new(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetches the resource for `key`, loading it if necessary.
    ///
    /// Fails with [`Error::CacheFull`] if the resource is absent and the
    /// cache is at capacity.
    pub fn get(&self, key: S::Key) -> Result<Arc<S::Item>> {
        let mut state = self.state.lock();
        loop {
            if state.loading.contains(&key) {
                self.loaded.wait(&mut state);
                continue;
            }

            if let Some(slot) = state.slots.get_mut(&key) {
                slot.refs += 1;
                return Ok(Arc::clone(&slot.value));
            }

            if self.capacity > 0
                && state.slots.len() + state.loading.len() >= self.capacity
            {
                return Err(Error::CacheFull);
            }

            state.loading.insert(key);
            break;
        }
        drop(state);

        // Load outside the lock; concurrent gets for the same key are parked
        // on the condvar above.
        let loaded = self.source.load(key);

        let mut state = self.state.lock();
        state.loading.remove(&key);
        self.loaded.notify_all();

        match loaded {
            Ok(value) => {
                let value = Arc::new(value);
                state.slots.insert(
                    key,
                    Slot {
                        value: Arc::clone(&value),
                        refs: 1,
                    },
                );
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Drops one reference to `key`; the last release evicts the resource.
    pub fn release(&self, key: S::Key) -> Result<()> {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(&key) else {
            debug_assert!(false, "release of a key that is not resident");
            return Ok(());
        };

        slot.refs -= 1;
        if slot.refs == 0 {
            let slot = state.slots.remove(&key).expect("slot present");
            self.source.evict(key, &slot.value)?;
        }
        Ok(())
    }

    /// Evicts every resident resource, ignoring reference counts.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        let keys: Vec<S::Key> = state.slots.keys().copied().collect();
        for key in keys {
            let slot = state.slots.remove(&key).expect("slot present");
            self.source.evict(key, &slot.value)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn resident(&self) -> usize {
        self.state.lock().slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct CountingSource {
        loads: AtomicUsize,
        evictions: AtomicUsize,
        delay: Option<Duration>,
    }

    impl CountingSource {
        fn new() -> CountingSource {
            CountingSource {
                loads: AtomicUsize::new(0),
                evictions: AtomicUsize::new(0),
                delay: None,
            }
        }
    }

    impl CacheSource for CountingSource {
        type Key = u64;
        type Item = u64;

        fn load(&self, key: u64) -> Result<u64> {
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(key * 10)
        }

        fn evict(&self, _key: u64, _item: &u64) -> Result<()> {
            self.evictions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_get_release_evicts_at_zero() -> Result<()> {
        let cache = RefCache::new(CountingSource::new(), 0);

        let v = cache.get(3)?;
        assert_eq!(*v, 30);
        let _v2 = cache.get(3)?;
        assert_eq!(cache.source().loads.load(Ordering::SeqCst), 1);

        cache.release(3)?;
        assert_eq!(cache.source().evictions.load(Ordering::SeqCst), 0);
        cache.release(3)?;
        assert_eq!(cache.source().evictions.load(Ordering::SeqCst), 1);
        assert_eq!(cache.resident(), 0);

        Ok(())
    }

    #[test]
    fn test_capacity_full_then_release_admits() -> Result<()> {
        let cache = RefCache::new(CountingSource::new(), 2);

        cache.get(1)?;
        cache.get(2)?;
        assert!(matches!(cache.get(3), Err(Error::CacheFull)));

        cache.release(1)?;
        cache.get(3)?;

        Ok(())
    }

    #[test]
    fn test_reload_after_eviction() -> Result<()> {
        let cache = RefCache::new(CountingSource::new(), 0);

        cache.get(5)?;
        cache.release(5)?;
        cache.get(5)?;
        assert_eq!(cache.source().loads.load(Ordering::SeqCst), 2);

        Ok(())
    }

    #[test]
    fn test_close_ignores_refs() -> Result<()> {
        let cache = RefCache::new(CountingSource::new(), 0);

        cache.get(1)?;
        cache.get(2)?;
        cache.close()?;
        assert_eq!(cache.source().evictions.load(Ordering::SeqCst), 2);
        assert_eq!(cache.resident(), 0);

        Ok(())
    }

    #[test]
    fn test_concurrent_gets_load_once() {
        let mut source = CountingSource::new();
        source.delay = Some(Duration::from_millis(20));
        let cache = std::sync::Arc::new(RefCache::new(source, 0));

        let mut handles = vec![];
        for _ in 0..8 {
            let cache = std::sync::Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                let v = cache.get(7).unwrap();
                assert_eq!(*v, 70);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cache.source().loads.load(Ordering::SeqCst), 1);
    }
}
