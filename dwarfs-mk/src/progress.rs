//! Shared build progress counters.
//!
//! All counters are atomics so scanning, hashing and compression threads
//! bump them without coordination; a reporter may sample them at any time.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A relaxed atomic counter.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub(&self, n: u64) {
        self.0.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn set(&self, n: u64) {
        self.0.store(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.get().fmt(f)
    }
}

/// Counters accumulated over one build.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct Progress {
    /// Regular file entries discovered, hardlinks included.
    pub files_found: Counter,
    pub files_scanned: Counter,
    pub dirs_found: Counter,
    pub dirs_scanned: Counter,
    pub symlinks_found: Counter,
    pub symlinks_scanned: Counter,
    /// Device, fifo and socket entries discovered (after gating).
    pub specials_found: Counter,
    /// Entries that turned out to be additional links to a known inode.
    pub hardlinks: Counter,
    /// Files whose content equals an earlier file's content.
    pub duplicate_files: Counter,
    /// Source errors survived by bookkeeping (unreadable files etc).
    pub errors: Counter,

    /// Bytes of all content as found, hardlinked content counted once,
    /// symlink targets included.
    pub original_size: Counter,
    /// Bytes of hardlinked content beyond the first link.
    pub hardlink_size: Counter,
    /// Bytes of symlink targets.
    pub symlink_size: Counter,
    /// Bytes not stored thanks to whole-file deduplication.
    pub saved_by_deduplication: Counter,
    /// Bytes not stored thanks to rolling-hash segmentation.
    pub saved_by_segmentation: Counter,
    /// Literal bytes that went into blocks.
    pub filesystem_size: Counter,
    /// Bytes of the finished image, headers included.
    pub compressed_size: Counter,

    /// Distinct contents fed to the segmenter.
    pub inodes_written: Counter,
    pub chunk_count: Counter,
    /// Blocks produced by the segmenter.
    pub block_count: Counter,
    /// Block sections written to the image.
    pub blocks_written: Counter,
}

impl Progress {
    /// One-line human summary, for end-of-build logging.
    pub fn summary(&self) -> String {
        format!(
            "{} files ({} duplicates, {} hardlinks), {} dirs, {} symlinks; \
             {} bytes in, {} bytes out, {} errors",
            self.files_found.get(),
            self.duplicate_files.get(),
            self.hardlinks.get(),
            self.dirs_found.get(),
            self.symlinks_found.get(),
            self.original_size.get(),
            self.compressed_size.get(),
            self.errors.get(),
        )
    }
}
