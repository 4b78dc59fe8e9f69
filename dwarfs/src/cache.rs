//! The bounded cache of decompressed blocks.
//!
//! Keyed by block index, valued by the decompressed block bytes. Two
//! contracts beyond a plain LRU:
//!
//! - **At-most-one concurrent decompression per block.** A thread finding no
//!   entry claims the block and decompresses outside the lock; threads
//!   finding a claimed block wait and share the single result.
//! - **Failures do not poison.** A failed load wakes all waiters with the
//!   error and leaves no entry behind, so a later request retries.
//!
//! Resident bytes are bounded by `max_bytes` with LRU eviction, always
//! keeping the most recently inserted block. Evicted bytes stay alive for
//! readers still holding their [`Arc`], so a block in active use is
//! effectively pinned without extra bookkeeping.
use std::{
    collections::HashSet,
    fmt,
    num::NonZero,
    sync::{Arc, Condvar, Mutex},
};

use lru::LruCache;

pub struct BlockCache {
    max_bytes: usize,
    inner: Mutex<Inner>,
    loaded: Condvar,
}

struct Inner {
    ready: LruCache<u32, Arc<[u8]>>,
    loading: HashSet<u32>,
    total_bytes: usize,
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("BlockCache");
        d.field("max_bytes", &self.max_bytes);
        if let Ok(inner) = self.inner.lock() {
            d.field("resident_blocks", &inner.ready.len())
                .field("resident_bytes", &inner.total_bytes)
                .field("loading", &inner.loading.len());
        }
        d.finish_non_exhaustive()
    }
}

impl BlockCache {
    /// Create a cache bounded to `max_bytes` of decompressed data.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(Inner {
                ready: LruCache::unbounded(),
                loading: HashSet::new(),
                total_bytes: 0,
            }),
            loaded: Condvar::new(),
        }
    }

    /// The configured budget in bytes.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Get the block from cache, or load it via `load` if missing.
    ///
    /// `load` runs outside the cache lock; concurrent requests for the same
    /// block wait for the single in-flight load instead of starting another.
    pub fn get_or_load<E>(
        &self,
        block: u32,
        load: impl FnOnce() -> Result<Vec<u8>, E>,
    ) -> Result<Arc<[u8]>, E> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        loop {
            // `get` promotes the entry to most recently used.
            if let Some(data) = inner.ready.get(&block) {
                log::trace!("block {block}: cache hit");
                return Ok(Arc::clone(data));
            }
            if !inner.loading.contains(&block) {
                break;
            }
            inner = self.loaded.wait(inner).expect("cache lock poisoned");
        }
        inner.loading.insert(block);
        drop(inner);

        log::trace!("block {block}: cache miss, loading");
        let result = load();

        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.loading.remove(&block);
        let ret = match result {
            Ok(data) => {
                let data: Arc<[u8]> = data.into();
                inner.total_bytes += data.len();
                inner.ready.push(block, Arc::clone(&data));
                while inner.total_bytes > self.max_bytes && inner.ready.len() > 1 {
                    let (_, evicted) = inner.ready.pop_lru().expect("not empty");
                    inner.total_bytes -= evicted.len();
                }
                Ok(data)
            }
            // Leave no entry behind so a later request retries.
            Err(err) => Err(err),
        };
        drop(inner);
        self.loaded.notify_all();
        ret
    }

    /// Create a cache sized to hold at least one block of `block_size`.
    pub(crate) fn with_budget(max_bytes: usize, block_size: u32) -> Option<Self> {
        // A cache that cannot hold a single block is a configuration error.
        NonZero::new(max_bytes / block_size.max(1) as usize)?;
        Some(Self::new(max_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn decompresses_once_under_contention() {
        let cache = Arc::new(BlockCache::new(1 << 20));
        let loads = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let (cache, loads) = (Arc::clone(&cache), Arc::clone(&loads));
                std::thread::spawn(move || {
                    cache
                        .get_or_load(7, || {
                            loads.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Ok::<_, ()>(vec![42u8; 128])
                        })
                        .unwrap()
                })
            })
            .collect();
        for t in threads {
            assert_eq!(&t.join().unwrap()[..], &[42u8; 128][..]);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_does_not_poison() {
        let cache = BlockCache::new(1 << 20);
        cache.get_or_load(3, || Err("boom")).unwrap_err();
        let data = cache.get_or_load(3, || Ok::<_, &str>(vec![1, 2, 3])).unwrap();
        assert_eq!(&data[..], &[1, 2, 3]);
    }

    #[test]
    fn eviction_respects_budget() {
        let cache = BlockCache::new(256);
        for block in 0..4u32 {
            cache
                .get_or_load(block, || Ok::<_, ()>(vec![block as u8; 100]))
                .unwrap();
        }
        let inner = cache.inner.lock().unwrap();
        assert!(inner.total_bytes <= 256);
        // The most recent block always stays resident.
        assert!(inner.ready.peek(&3).is_some());
    }

    #[test]
    fn keeps_one_block_even_if_oversized() {
        let cache = BlockCache::new(8);
        cache.get_or_load(0, || Ok::<_, ()>(vec![0u8; 100])).unwrap();
        cache.get_or_load(1, || Ok::<_, ()>(vec![1u8; 100])).unwrap();
        let inner = cache.inner.lock().unwrap();
        assert_eq!(inner.ready.len(), 1);
        assert!(inner.ready.peek(&1).is_some());
    }
}
