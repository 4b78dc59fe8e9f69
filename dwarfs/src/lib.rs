//! Read-only, content-deduplicating, compressed filesystem images.
//!
//! This crate implements the image format and the reader:
//!
//! - [`section`]: the low-level section framing (blocks, metadata, schema).
//! - [`metadata`]: the frozen metadata structures and their schema-directed
//!   binary codec.
//! - [`fs`]: the high-level [`Filesystem`] reader answering POSIX-like
//!   lookups and reconstructing file contents through a bounded block cache.
//!
//! For building images, see the `dwarfs-mk` crate.
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

pub mod cache;
pub mod fs;
pub mod metadata;
pub mod section;
pub mod symtab;

pub use positioned_io;
pub use zerocopy;

pub use fs::{
    DirHandle, Error, FileHandle, Filesystem, FilesystemOptions, InodeId, Result, Stat, StatVfs,
};

/// The (included) minimum supported image format (major, minor) version.
///
/// Version 2.2 images store directory entries inline in the inode table
/// (`entry_table_v2_2`); they are readable but never written.
pub const FORMAT_VERSION_MIN: (u8, u8) = (2, 2);

/// The (included) maximum supported image format (major, minor) version.
/// This is also the version the builder writes.
pub const FORMAT_VERSION_MAX: (u8, u8) = (2, 3);

use std::{cmp::Ordering, ops::Range};

/// Binary search over an index range, for tables that are not materialized
/// as slices (e.g. directory entries resolved through the string table).
fn bisect_range_by<F>(range: Range<usize>, mut f: F) -> Option<usize>
where
    F: FnMut(usize) -> Ordering,
{
    let mut lo = range.start;
    let mut hi = range.end;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match f(mid) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Some(mid),
        }
    }
    None
}
