//! Builder for read-only, content-deduplicating, compressed filesystem
//! images.
//!
//! The [`Scanner`] walks a source tree through a pluggable
//! [filesystem backend][fsaccess::FsAccess], deduplicates identical files by
//! content hash, orders the distinct contents, segments them into a shared
//! block stream with a rolling-hash matcher, and writes a self-describing
//! image readable by the `dwarfs` crate.
//!
//! ```no_run
//! use dwarfs_mk::{BlockConfig, Progress, Scanner, ScannerOptions};
//! use dwarfs_mk::fsaccess::OsAccess;
//!
//! # fn work() -> dwarfs_mk::Result<()> {
//! let cfg = BlockConfig::default();
//! let mut options = ScannerOptions::default();
//! options.file_hash_algorithm = Some(dwarfs_mk::HashAlgorithm::Xxh3_128);
//!
//! let fs = OsAccess::new("/some/tree");
//! let out = std::fs::File::create("out.dwarfs")?;
//! let prog = Progress::default();
//! let compression = dwarfs_mk::parse_compression("zstd:level=19")?;
//! Scanner::new(&cfg, &options, &fs).scan(out, compression, &prog, None)?;
//! # Ok(()) }
//! ```
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

mod error;
mod global_data;
mod strings;
mod workers;

pub mod entry;
pub mod fsaccess;
pub mod options;
pub mod order;
pub mod progress;
pub mod scanner;
pub mod segment;
pub mod writer;

pub use error::{Error, Result};
pub use options::{
    parse_compression, BlockConfig, FileOrderMode, HashAlgorithm, ScannerOptions,
};
pub use progress::Progress;
pub use scanner::Scanner;

pub use dwarfs::section::CompressParam;

/// Errors raised by [`Script`] callbacks. Any script failure aborts the
/// build.
pub type ScriptError = Box<dyn std::error::Error + Send + Sync>;

/// User hooks into the scan: entry filtering, attribute transforms, and
/// custom content ordering.
///
/// Filtering and an explicit input file list are mutually exclusive; the
/// builder refuses that combination before starting.
pub trait Script: Sync {
    /// Whether [`Script::filter`] should be consulted.
    fn has_filter(&self) -> bool {
        false
    }

    /// Return `false` to exclude the entry (and, for directories, its whole
    /// subtree).
    fn filter(&self, path: &str, stat: &fsaccess::FileStat) -> Result<bool, ScriptError> {
        let _ = (path, stat);
        Ok(true)
    }

    /// Whether [`Script::transform`] should be applied.
    fn has_transform(&self) -> bool {
        false
    }

    /// Rewrite entry attributes before they are recorded.
    fn transform(&self, path: &str, stat: &mut fsaccess::FileStat) -> Result<(), ScriptError> {
        let _ = (path, stat);
        Ok(())
    }

    /// Reorder contents for [`FileOrderMode::Script`]. The slice may be
    /// permuted freely; it must keep the same elements.
    fn order(&self, candidates: &mut [order::OrderCandidate]) -> Result<(), ScriptError> {
        let _ = candidates;
        Ok(())
    }
}
