//! The frozen metadata structures and their binary codec.
//!
//! [`Metadata`] is the single source of truth for the on-disk layout of all
//! inode, directory, name, symlink, chunk and option data. The builder
//! populates it in memory and [freezes][Metadata::to_schema_and_bytes] it
//! into a position-independent byte buffer plus a [`Schema`] descriptor;
//! the reader [parses][Metadata::parse] it back, driven by the schema.
//!
//! The parsed `Metadata` is given as-is: no unpacking of delta-packed tables
//! and no value validation happens here, only binary structure is checked.
//! For validated high-level access use [`Filesystem`][crate::fs::Filesystem].
use std::fmt;

use bstr::BString;
use serde::{Deserialize, Serialize};

mod frozen;
mod schema;

#[cfg(test)]
mod tests;

pub use schema::{Schema, SchemaField, SchemaLayout};

type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised from parsing or serializing schema or metadata.
#[derive(Debug)]
pub struct Error(Box<str>);

impl Error {
    #[cold]
    pub(crate) fn new(msg: impl fmt::Display) -> Self {
        Self(msg.to_string().into_boxed_str())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for Error {}

impl Metadata {
    /// Parse the metadata from its on-disk serialized form
    /// ([`SectionType::METADATA_V2`](crate::section::SectionType::METADATA_V2)),
    /// using the layout defined by the given schema.
    pub fn parse(schema: &Schema, bytes: &[u8]) -> Result<Self> {
        frozen::thaw(schema, bytes).map_err(|err| Error::new(format_args!("failed to parse metadata: {err}")))
    }

    /// Freeze the metadata into a byte buffer plus the schema describing its
    /// layout.
    ///
    /// The written layout is byte-aligned: every stored field occupies a
    /// whole number of bytes, and fields whose value is zero everywhere are
    /// omitted entirely. The reader accepts arbitrary (also bit-packed)
    /// layouts as long as the schema describes them.
    pub fn to_schema_and_bytes(&self) -> Result<(Schema, Vec<u8>)> {
        frozen::freeze(self).map_err(|err| Error::new(format_args!("failed to freeze metadata: {err}")))
    }
}

/// The root metadata structure.
///
/// Field order matters: the position of a field within the struct is its
/// identity in the frozen layout, so fields must never be reordered or
/// removed, only appended.
#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Metadata {
    /// All chunks, grouped per unique file by `chunk_table`.
    pub chunks: Vec<Chunk>,
    /// Per-directory entry ranges, one more than the number of directories.
    /// `directories[i + 1].first_entry - directories[i].first_entry` is the
    /// child count of directory inode `i`.
    pub directories: Vec<Directory>,
    /// All inodes, partitioned by type rank (dir < link < file < device < other).
    pub inodes: Vec<InodeData>,
    /// Chunk list boundaries per unique file, one more than the number of
    /// unique files.
    pub chunk_table: Vec<u32>,
    /// Legacy (v2.2): maps directory entry index to inode index. Unused when
    /// `dir_entries` is present.
    pub entry_table_v2_2: Vec<u32>,
    /// Per symlink inode, an index into the symlink string pool.
    pub symlink_table: Vec<u32>,
    /// Unique owner ids referenced by `InodeData::owner_index`.
    pub uids: Vec<u32>,
    /// Unique group ids referenced by `InodeData::group_index`.
    pub gids: Vec<u32>,
    /// Unique file modes referenced by `InodeData::mode_index`.
    pub modes: Vec<u32>,
    /// Plain entry name table. Empty when `compact_names` is used.
    pub names: Vec<BString>,
    /// Plain symlink target table. Empty when `compact_symlinks` is used.
    pub symlinks: Vec<BString>,
    /// The base all inode timestamps are relative to, in units of
    /// `FsOptions::time_resolution_sec`.
    pub timestamp_base: u64,
    /// The block size in bytes. Always a power of two.
    pub block_size: u32,
    /// Total size of all regular file contents, hardlinked content counted
    /// once.
    pub total_fs_size: u64,
    /// Device ids of device inodes, in inode order.
    pub devices: Option<Vec<u64>>,
    /// Image-wide options.
    pub options: Option<FsOptions>,
    /// All directory entries: the root self-entry first, then the children
    /// of every directory, each run sorted by name. Absent in v2.2 images.
    pub dir_entries: Option<Vec<DirEntry>>,
    /// Maps file inodes in the shared range to unique file ids, optionally
    /// run-length packed (see `FsOptions::packed_shared_files_table`).
    pub shared_files_table: Option<Vec<u32>>,
    /// Total size of hardlinked file contents beyond the first link.
    pub total_hardlink_size: Option<u64>,
    /// Name and version of the creating program.
    pub dwarfs_version: Option<BString>,
    /// Image creation time in seconds since the UNIX epoch.
    pub create_timestamp: Option<u64>,
    /// Packed entry name table, replacing `names`.
    pub compact_names: Option<StringTable>,
    /// Packed symlink target table, replacing `symlinks`.
    pub compact_symlinks: Option<StringTable>,
}

/// A reference to a byte range of a block: the concatenation of a file's
/// chunks is the file's content.
#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Chunk {
    /// The index of the block section holding the data.
    pub block: u32,
    /// Byte offset inside the decompressed block.
    pub offset: u32,
    /// Byte length. `offset + size` never exceeds the block size.
    pub size: u32,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Directory {
    /// The directory entry index of this directory's own entry in its
    /// parent. Zero (and recovered by traversal) when directories are
    /// packed.
    pub parent_entry: u32,
    /// The first directory entry index of this directory's children,
    /// delta-encoded when directories are packed.
    pub first_entry: u32,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InodeData {
    /// Index into `Metadata::modes`.
    pub mode_index: u32,
    /// Index into `Metadata::uids`.
    pub owner_index: u32,
    /// Index into `Metadata::gids`.
    pub group_index: u32,
    /// Access time, relative to `timestamp_base`, in resolution units.
    /// Zero when `mtime_only` is set.
    pub atime_offset: u32,
    /// Modification time, relative to `timestamp_base`, in resolution units.
    pub mtime_offset: u32,
    /// Change time, relative to `timestamp_base`, in resolution units.
    /// Zero when `mtime_only` is set.
    pub ctime_offset: u32,
    /// Legacy (v2.2): index into `Metadata::names`.
    pub name_index_v2_2: u32,
    /// Legacy (v2.2): the inode number of this entry.
    pub inode_v2_2: u32,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DirEntry {
    /// Index into the name table (`names` or `compact_names`).
    pub name_index: u32,
    /// The inode this entry refers to. Hardlinks are entries sharing one
    /// inode.
    pub inode_num: u32,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FsOptions {
    /// Only mtime is stored; atime and ctime read back equal to mtime.
    pub mtime_only: bool,
    /// Timestamp resolution in seconds. Absent means 1.
    pub time_resolution_sec: Option<u32>,
    /// `chunk_table` is delta-encoded.
    pub packed_chunk_table: bool,
    /// `directories.first_entry` is delta-encoded and `parent_entry` elided.
    pub packed_directories: bool,
    /// `shared_files_table` is run-length packed.
    pub packed_shared_files_table: bool,
}

/// A uniquified string table in compact form: one shared buffer plus an
/// index of item boundaries.
#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StringTable {
    /// Concatenated item bytes, possibly symbol-compressed (see `symtab`).
    pub buffer: BString,
    /// The symbol table used to compress `buffer`, see [`crate::symtab`].
    /// Absent if the buffer is stored raw.
    pub symtab: Option<BString>,
    /// Item boundaries. Either absolute end offsets (the last one equals the
    /// buffer length), or per-item lengths when `packed_index` is set.
    pub index: Vec<u32>,
    /// Whether `index` stores per-item lengths instead of absolute offsets.
    pub packed_index: bool,
}
