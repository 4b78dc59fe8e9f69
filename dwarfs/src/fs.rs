//! The high-level filesystem reader.
//!
//! [`Filesystem::new`] scans the image sections, loads schema and metadata,
//! optionally runs the full consistency validation, and precomputes the
//! inode type partition and directory parent links. After that, all
//! operations are read-only and callable from multiple threads; file
//! contents are served through a bounded [block cache][crate::cache] with
//! at-most-one decompression per block.
//!
//! Inodes are dense `u32` numbers partitioned by type:
//! directories, then symlinks, then regular files (unique contents first,
//! then shared duplicates), then devices, then fifos/sockets. The root
//! directory is always inode 0.
use std::{fmt, num::NonZero};

use bstr::BString;
use positioned_io::{ReadAt, Size};

use crate::{
    bisect_range_by,
    cache::BlockCache,
    metadata::{Metadata, Schema, StringTable},
    section::{self, HEADER_SIZE, SectionReader, SectionType},
    symtab,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A dense inode number. The root directory is inode 0.
pub type InodeId = u32;

/// `access` mask bit: readable.
pub const R_OK: u32 = 4;
/// `access` mask bit: writable.
pub const W_OK: u32 = 2;
/// `access` mask bit: executable.
pub const X_OK: u32 = 1;

pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
enum ErrorInner {
    Section(String, Option<section::Error>),
    MissingSection(SectionType),
    DuplicatedSection(SectionType),
    ParseMetadata(crate::metadata::Error),
    Validation(String),

    // Per-operation POSIX-style failures.
    NotFound,
    NotADirectory,
    NotAFile,
    AccessDenied,

    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::Section(msg, Some(err)) => write!(f, "{msg}: {err}"),
            ErrorInner::Section(msg, None) => write!(f, "{msg}"),
            ErrorInner::MissingSection(ty) => write!(f, "missing section {ty:?}"),
            ErrorInner::DuplicatedSection(ty) => write!(f, "duplicated sections {ty:?}"),
            ErrorInner::ParseMetadata(err) => write!(f, "failed to parse metadata: {err}"),
            ErrorInner::Validation(msg) => write!(f, "malformed metadata: {msg}"),
            ErrorInner::NotFound => f.pad("no such file or directory"),
            ErrorInner::NotADirectory => f.pad("not a directory"),
            ErrorInner::NotAFile => f.pad("not a regular file"),
            ErrorInner::AccessDenied => f.pad("permission denied"),
            ErrorInner::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Section(_, Some(err)) => Some(err),
            ErrorInner::ParseMetadata(err) => Some(err),
            ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl Error {
    /// Whether this is a "no such file or directory" operation failure.
    pub fn is_not_found(&self) -> bool {
        matches!(&*self.0, ErrorInner::NotFound)
    }

    /// Whether this is a "permission denied" operation failure.
    pub fn is_access_denied(&self) -> bool {
        matches!(&*self.0, ErrorInner::AccessDenied)
    }
}

trait ResultExt<T> {
    fn context(self, msg: impl fmt::Display) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T, section::Error> {
    #[inline]
    fn context(self, msg: impl fmt::Display) -> Result<T> {
        self.map_err(|err| ErrorInner::Section(msg.to_string(), Some(err)).into())
    }
}

trait CheckExt {
    fn or_invalid(self, msg: impl fmt::Display) -> Result<()>;
}

impl CheckExt for bool {
    #[inline]
    fn or_invalid(self, msg: impl fmt::Display) -> Result<()> {
        if self {
            Ok(())
        } else {
            Err(ErrorInner::Validation(msg.to_string()).into())
        }
    }
}

#[cold]
fn invalid(msg: impl fmt::Display) -> Error {
    ErrorInner::Validation(msg.to_string()).into()
}

/// Reader configuration.
#[derive(Debug, Clone)]
pub struct FilesystemOptions {
    pub block_cache: BlockCacheOptions,
    pub metadata: MetadataOptions,
    /// Upper bound for the decompressed schema section.
    pub schema_size_limit: usize,
    /// Upper bound for the decompressed metadata section.
    pub metadata_size_limit: usize,
}

#[derive(Debug, Clone)]
pub struct BlockCacheOptions {
    /// Total budget of decompressed block bytes kept resident.
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MetadataOptions {
    /// Report hardlink counts from `getattr` instead of a constant 1.
    pub enable_nlink: bool,
    /// Run the full metadata consistency validation on load.
    pub check_consistency: bool,
}

impl Default for FilesystemOptions {
    fn default() -> Self {
        Self {
            block_cache: BlockCacheOptions { max_bytes: 512 << 20 },
            metadata: MetadataOptions::default(),
            schema_size_limit: 1 << 20,
            metadata_size_limit: 16 << 20,
        }
    }
}

/// Attributes of an inode, in the shape of `struct stat`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub st_ino: u32,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: u64,
    pub st_rdev: u64,
    pub st_atime: u64,
    pub st_mtime: u64,
    pub st_ctime: u64,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.st_mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.st_mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.st_mode & S_IFMT == S_IFLNK
    }
}

/// Filesystem totals, in the shape of `struct statvfs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatVfs {
    pub f_bsize: u64,
    pub f_frsize: u64,
    pub f_blocks: u64,
    pub f_files: u64,
    pub f_namemax: u64,
    pub readonly: bool,
}

/// An open directory, see [`Filesystem::opendir`].
#[derive(Debug, Clone, Copy)]
pub struct DirHandle {
    ino: InodeId,
    ent_start: u32,
    ent_end: u32,
}

/// An open regular file, see [`Filesystem::open`].
#[derive(Debug, Clone, Copy)]
pub struct FileHandle {
    ino: InodeId,
    chunk_start: u32,
    chunk_end: u32,
    size: u64,
}

impl FileHandle {
    /// The inode this handle refers to.
    pub fn ino(&self) -> InodeId {
        self.ino
    }

    /// The file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// An entry yielded by [`Filesystem::walk`].
#[derive(Debug, Clone, Copy)]
pub struct WalkEntry<'a> {
    /// Path relative to the root, without a leading slash. Empty for the
    /// root itself.
    pub path: &'a str,
    /// The entry name. Empty for the root.
    pub name: &'a str,
    pub inode: InodeId,
}

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

/// The partition rank of an inode type. Inodes are stored sorted by this.
fn mode_rank(mode: u32) -> u32 {
    match mode & S_IFMT {
        S_IFDIR => 0,
        S_IFLNK => 1,
        S_IFREG => 2,
        S_IFBLK | S_IFCHR => 3,
        _ => 4,
    }
}

/// Precomputed inode partition offsets, see [module docs][self].
#[derive(Debug, Default, Clone, Copy)]
struct InodeTally {
    unique_cnt: u32,
    symlink_start: u32,
    unique_start: u32,
    shared_start: u32,
    device_start: u32,
    ipc_start: u32,
    inode_cnt: u32,
}

/// An unpacked string table: plain per-item storage or one shared buffer
/// with `len + 1` absolute end offsets (leading zero included).
#[derive(Debug)]
enum StringIndex {
    Plain(Vec<BString>),
    Compact { buffer: Vec<u8>, ends: Vec<u32> },
}

impl StringIndex {
    fn len(&self) -> usize {
        match self {
            StringIndex::Plain(items) => items.len(),
            StringIndex::Compact { ends, .. } => ends.len().saturating_sub(1),
        }
    }

    fn get(&self, idx: u32) -> &[u8] {
        match self {
            StringIndex::Plain(items) => &items[idx as usize],
            StringIndex::Compact { buffer, ends } => {
                &buffer[ends[idx as usize] as usize..ends[idx as usize + 1] as usize]
            }
        }
    }

    fn get_str(&self, idx: u32) -> &str {
        std::str::from_utf8(self.get(idx)).expect("validated on load")
    }

    /// Unpack a table: delta-decode a packed index, or decode the buffer
    /// through its symbol table. `max_item_len` is the post-decode cap.
    fn unpack(table: &StringTable, max_item_len: usize, what: &str) -> Result<Self> {
        let mut ends = Vec::with_capacity(table.index.len() + 1);
        if table.packed_index {
            let mut sum = 0u32;
            ends.push(0);
            for &len in &table.index {
                sum = sum
                    .checked_add(len)
                    .ok_or_else(|| invalid(format_args!("{what}: packed index overflow")))?;
                ends.push(sum);
            }
        } else {
            table.index.is_sorted().or_invalid(format_args!("{what}: index is not sorted"))?;
            ends.extend_from_slice(&table.index);
            if ends.is_empty() {
                ends.push(0);
            }
        }
        (*ends.first().expect("nonempty") == 0)
            .or_invalid(format_args!("{what}: index does not start at zero"))?;

        let (buffer, ends) = match &table.symtab {
            None => {
                (*ends.last().expect("nonempty") as usize == table.buffer.len())
                    .or_invalid(format_args!("{what}: index does not span the buffer"))?;
                (table.buffer.to_vec(), ends)
            }
            Some(symtab_bytes) => {
                let decoder = symtab::Decoder::parse_symtab(symtab_bytes)
                    .map_err(|err| invalid(format_args!("{what}: bad symbol table: {err}")))?;
                (*ends.last().expect("nonempty") as usize == table.buffer.len())
                    .or_invalid(format_args!("{what}: index does not span the buffer"))?;
                let mut out_buf = Vec::with_capacity(table.buffer.len() * 2);
                let mut out_ends = Vec::with_capacity(ends.len());
                out_ends.push(0u32);
                let mut item = Vec::new();
                for w in ends.windows(2) {
                    let encoded = &table.buffer[w[0] as usize..w[1] as usize];
                    item.resize(symtab::Decoder::max_decode_len(encoded.len()), 0);
                    let len = decoder
                        .decode_into(encoded, &mut item)
                        .map_err(|err| invalid(format_args!("{what}: decode failed: {err}")))?;
                    out_buf.extend_from_slice(&item[..len]);
                    let pos = u32::try_from(out_buf.len())
                        .map_err(|_| invalid(format_args!("{what}: decoded table too large")))?;
                    out_ends.push(pos);
                }
                (out_buf, out_ends)
            }
        };

        let longest = ends.windows(2).map(|w| w[1].saturating_sub(w[0])).max().unwrap_or(0);
        (longest as usize <= max_item_len)
            .or_invalid(format_args!("{what}: item of {longest} bytes exceeds the cap"))?;

        // Item accessors hand out `&str`.
        std::str::from_utf8(&buffer)
            .ok()
            .map(drop)
            .ok_or_else(|| invalid(format_args!("{what}: non-UTF-8 item")))?;

        Ok(StringIndex::Compact { buffer, ends })
    }
}

/// Max byte length of a name or symlink target. Symbol compression can at
/// worst double the encoded form, so these are twice the nominal limits.
const MAX_NAME_LEN: usize = 512;
const MAX_SYMLINK_LEN: usize = 4096;

pub struct Filesystem<R> {
    rdr: SectionReader<R>,
    /// Offsets of BLOCK sections, indexed by block number.
    block_sections: Vec<u64>,
    meta: Metadata,
    cache: BlockCache,

    names: StringIndex,
    symlinks: StringIndex,
    tally: InodeTally,
    /// Per file inode link counts; only with `enable_nlink`.
    nlink: Option<Vec<u32>>,

    mtime_only: bool,
    time_resolution: NonZero<u32>,
    timestamp_base_scaled: u64,
    block_size: u32,
}

impl<R> fmt::Debug for Filesystem<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filesystem")
            .field("block_sections", &self.block_sections.len())
            .field("inodes", &self.tally.inode_cnt)
            .field("block_size", &self.block_size)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<R: ReadAt + Size> Filesystem<R> {
    /// Open an image with default options.
    pub fn new(rdr: R) -> Result<Self> {
        Self::new_with_options(rdr, &FilesystemOptions::default())
    }

    /// Open an image.
    ///
    /// With [`MetadataOptions::check_consistency`] set, a malformed image
    /// fails here with a message naming the violated invariant; without it,
    /// loading is cheaper but operations on a corrupted image may panic.
    pub fn new_with_options(rdr: R, options: &FilesystemOptions) -> Result<Self> {
        let stream_len = rdr
            .size()?
            .ok_or_else(|| ErrorInner::Section("cannot size the image stream".into(), None))?;
        let rdr = SectionReader::new(rdr);

        let sections = rdr
            .scan_sections(stream_len)
            .context("failed to scan image sections")?;

        let find_unique = |ty: SectionType| -> Result<u64> {
            let mut iter = sections
                .iter()
                .filter_map(|s| (s.section_type == ty).then_some(s.offset));
            let off = iter.next().ok_or(ErrorInner::MissingSection(ty))?;
            if iter.next().is_some() {
                bail!(ErrorInner::DuplicatedSection(ty));
            }
            Ok(off)
        };
        let schema_offset = find_unique(SectionType::METADATA_V2_SCHEMA)?;
        let metadata_offset = find_unique(SectionType::METADATA_V2)?;

        let meta = {
            let (_, raw_schema) = rdr
                .read_section_at(schema_offset, options.schema_size_limit)
                .context("failed to read metadata schema section")?;
            let schema = Schema::parse(&raw_schema).map_err(ErrorInner::ParseMetadata)?;
            let (_, raw_meta) = rdr
                .read_section_at(metadata_offset, options.metadata_size_limit)
                .context("failed to read metadata section")?;
            Metadata::parse(&schema, &raw_meta).map_err(ErrorInner::ParseMetadata)?
        };

        let block_sections = sections
            .iter()
            .filter_map(|s| (s.section_type == SectionType::BLOCK).then_some(s.offset))
            .collect::<Vec<_>>();

        Loader {
            meta,
            num_blocks: block_sections.len() as u32,
            check: options.metadata.check_consistency,
            enable_nlink: options.metadata.enable_nlink,
        }
        .finish(rdr, block_sections, options)
    }
}

/// Metadata unpacking and validation, separated from `Filesystem` proper so
/// the borrow story stays simple.
struct Loader {
    meta: Metadata,
    num_blocks: u32,
    check: bool,
    enable_nlink: bool,
}

impl Loader {
    fn finish<R>(
        mut self,
        rdr: SectionReader<R>,
        block_sections: Vec<u64>,
        options: &FilesystemOptions,
    ) -> Result<Filesystem<R>> {
        // Basic shape guards are unconditional: operations index these
        // tables and a broken image must not be able to cause wild reads.
        self.check_shape()?;
        if self.check {
            self.check_packed_tables()?;
        }
        self.unpack_tables()?;

        let (mtime_only, time_resolution) = match &self.meta.options {
            Some(opts) => (
                opts.mtime_only,
                NonZero::new(opts.time_resolution_sec.unwrap_or(1))
                    .ok_or_else(|| invalid("options.time_resolution_sec is zero"))?,
            ),
            None => (false, NonZero::new(1).expect("nonzero")),
        };
        let timestamp_base_scaled = self
            .meta
            .timestamp_base
            .checked_mul(time_resolution.get().into())
            .ok_or_else(|| invalid("timestamp_base overflow"))?;

        let names = self.unpack_strings(
            &self.meta.names,
            &self.meta.compact_names,
            MAX_NAME_LEN,
            "names",
        )?;
        let symlinks = self.unpack_strings(
            &self.meta.symlinks,
            &self.meta.compact_symlinks,
            MAX_SYMLINK_LEN,
            "symlinks",
        )?;

        let tally = self.classify_inodes()?;
        if self.check {
            self.check_index_ranges(&names, &symlinks)?;
            self.check_chunks()?;
            self.check_partitioning(tally)?;
        }
        self.recover_parent_entries(tally)?;

        let nlink = self.enable_nlink.then(|| self.count_links(tally));

        let block_size = self.meta.block_size;
        (block_size != 0 && block_size.is_power_of_two())
            .or_invalid("block_size is not a power of two")?;
        let cache = BlockCache::with_budget(options.block_cache.max_bytes, block_size)
            .ok_or_else(|| {
                invalid(format_args!(
                    "block size {block_size}B exceeds the cache budget of {}B",
                    options.block_cache.max_bytes,
                ))
            })?;

        Ok(Filesystem {
            rdr,
            block_sections,
            meta: self.meta,
            cache,
            names,
            symlinks,
            tally,
            nlink,
            mtime_only,
            time_resolution,
            timestamp_base_scaled,
            block_size,
        })
    }

    fn is_v2_2(&self) -> bool {
        self.meta.dir_entries.is_none()
    }

    fn num_entries(&self) -> usize {
        match &self.meta.dir_entries {
            Some(ents) => ents.len(),
            None => self.meta.inodes.len(),
        }
    }

    /// Unconditional structural guards: required tables are present and
    /// table cardinalities fit their index widths.
    fn check_shape(&self) -> Result<()> {
        let m = &self.meta;
        (!m.inodes.is_empty()).or_invalid("empty inodes table")?;
        (!m.directories.is_empty()).or_invalid("empty directories table")?;
        (!m.chunk_table.is_empty()).or_invalid("empty chunk_table table")?;
        (!m.modes.is_empty()).or_invalid("empty modes table")?;
        match &m.dir_entries {
            Some(ents) => (!ents.is_empty()).or_invalid("empty dir_entries table")?,
            None => (!m.entry_table_v2_2.is_empty()).or_invalid("empty entry_table_v2_2 table")?,
        }

        (m.modes.len() < u16::MAX as usize).or_invalid("invalid number of modes")?;
        (m.uids.len() < u16::MAX as usize).or_invalid("invalid number of uids")?;
        (m.gids.len() < u16::MAX as usize).or_invalid("invalid number of gids")?;
        for (len, what) in [
            (m.inodes.len(), "inodes"),
            (self.num_entries(), "dir_entries"),
            (m.directories.len(), "directories"),
            (m.chunks.len(), "chunks"),
            (m.chunk_table.len(), "chunk_table"),
        ] {
            (len < u32::MAX as usize).or_invalid(format_args!("invalid number of {what}"))?;
        }
        Ok(())
    }

    /// Delta- and run-length-packed tables, checked on the packed
    /// representation: sums must match the referent table sizes, unpacked
    /// forms must be sorted.
    fn check_packed_tables(&self) -> Result<()> {
        let m = &self.meta;
        let opts = m.options.as_ref();
        let num_entries = self.num_entries();

        if opts.is_some_and(|o| o.packed_directories) {
            m.directories
                .iter()
                .all(|d| d.parent_entry == 0)
                .or_invalid("parent_entry set in packed directories")?;
            let sum = m
                .directories
                .iter()
                .map(|d| u64::from(d.first_entry))
                .sum::<u64>();
            (sum == num_entries as u64)
                .or_invalid("first_entry inconsistency in packed directories")?;
        } else {
            m.directories
                .is_sorted_by_key(|d| d.first_entry)
                .or_invalid("directories.first_entry is not sorted")?;
            for d in &m.directories {
                (d.first_entry as usize <= num_entries)
                    .or_invalid("directories.first_entry out of range")?;
                ((d.parent_entry as usize) < num_entries)
                    .or_invalid("directories.parent_entry out of range")?;
            }
        }

        if opts.is_some_and(|o| o.packed_chunk_table) {
            let sum = m.chunk_table.iter().map(|&c| u64::from(c)).sum::<u64>();
            (sum == m.chunks.len() as u64).or_invalid("packed chunk_table inconsistency")?;
        } else {
            (m.chunk_table.is_sorted() && *m.chunk_table.last().expect("nonempty") as usize == m.chunks.len())
                .or_invalid("chunk_table inconsistency")?;
        }

        if let Some(shared) = &m.shared_files_table {
            if opts.is_some_and(|o| o.packed_shared_files_table) {
                // Every packed run expands to `value + 2 >= 2` members, so
                // nothing to check beyond the expansion overflow below.
            } else {
                shared
                    .is_sorted()
                    .or_invalid("unpacked shared_files_table is not sorted")?;
            }
        }
        Ok(())
    }

    /// Delta-decode and expand packed tables in place.
    fn unpack_tables(&mut self) -> Result<()> {
        let m = &mut self.meta;
        let Some(opts) = m.options.clone() else {
            return Ok(());
        };

        if opts.packed_chunk_table {
            let mut sum = 0u32;
            for c in &mut m.chunk_table {
                sum = sum
                    .checked_add(*c)
                    .ok_or_else(|| invalid("packed chunk_table overflow"))?;
                *c = sum;
            }
        }

        if opts.packed_directories {
            let mut sum = 0u32;
            for d in &mut m.directories {
                sum = sum
                    .checked_add(d.first_entry)
                    .ok_or_else(|| invalid("packed directories.first_entry overflow"))?;
                d.first_entry = sum;
            }
        }

        if let Some(shared) = m
            .shared_files_table
            .as_mut()
            .filter(|_| opts.packed_shared_files_table)
        {
            // Run `i` holds `shared[i] + 2` members, all mapping to group `i`.
            let unpacked_len = shared
                .iter()
                .try_fold(0u64, |sum, &cnt| sum.checked_add(u64::from(cnt) + 2))
                .filter(|&n| n <= m.inodes.len() as u64)
                .ok_or_else(|| invalid("packed shared_files_table expands too far"))?;
            let mut unpacked = Vec::with_capacity(unpacked_len as usize);
            for (group, &cnt) in shared.iter().enumerate() {
                unpacked.extend(std::iter::repeat_n(group as u32, cnt as usize + 2));
            }
            *shared = unpacked;
        }
        Ok(())
    }

    fn unpack_strings(
        &self,
        plain: &[BString],
        compact: &Option<StringTable>,
        max_item_len: usize,
        what: &str,
    ) -> Result<StringIndex> {
        match compact {
            Some(table) => {
                plain
                    .is_empty()
                    .or_invalid(format_args!("both plain and compact {what} tables present"))?;
                StringIndex::unpack(table, max_item_len, what)
            }
            None => {
                for item in plain {
                    (item.len() <= max_item_len)
                        .or_invalid(format_args!("{what}: overlong item"))?;
                    std::str::from_utf8(item)
                        .ok()
                        .ok_or_else(|| invalid(format_args!("{what}: non-UTF-8 item")))?;
                }
                Ok(StringIndex::Plain(plain.to_vec()))
            }
        }
    }

    /// Derive the inode partition from table cardinalities.
    fn classify_inodes(&self) -> Result<InodeTally> {
        let m = &self.meta;
        let dir_cnt = m.directories.len() - 1;
        (dir_cnt >= 1).or_invalid("missing root directory")?;
        let file_store_cnt = (m.chunk_table.len() - 1) as u32;
        let symlink_cnt = m.symlink_table.len() as u32;
        let device_cnt = m.devices.as_ref().map_or(0, |d| d.len()) as u32;
        let shared = m.shared_files_table.as_deref().unwrap_or(&[]);
        let shared_cnt = shared.len() as u32;
        let shared_store_cnt = match shared.last() {
            Some(&max_group) => max_group
                .checked_add(1)
                .ok_or_else(|| invalid("shared_files_table group overflow"))?,
            None => 0,
        };
        let unique_cnt = file_store_cnt
            .checked_sub(shared_store_cnt)
            .ok_or_else(|| invalid("more shared file groups than chunk runs"))?;

        let inode_cnt = m.inodes.len() as u32;
        let symlink_start = dir_cnt as u32;
        let unique_start = symlink_start
            .checked_add(symlink_cnt)
            .ok_or_else(|| invalid("inode ranges overflow"))?;
        let shared_start = unique_start
            .checked_add(unique_cnt)
            .ok_or_else(|| invalid("inode ranges overflow"))?;
        let device_start = shared_start
            .checked_add(shared_cnt)
            .ok_or_else(|| invalid("inode ranges overflow"))?;
        let ipc_start = device_start
            .checked_add(device_cnt)
            .ok_or_else(|| invalid("inode ranges overflow"))?;
        (ipc_start <= inode_cnt).or_invalid("inodes table too short for all ranges")?;

        Ok(InodeTally {
            unique_cnt,
            symlink_start,
            unique_start,
            shared_start,
            device_start,
            ipc_start,
            inode_cnt,
        })
    }

    /// Every stored index stays within the bounds of its referent table,
    /// and the string tables hold exactly the referenced items.
    fn check_index_ranges(&self, names: &StringIndex, symlinks: &StringIndex) -> Result<()> {
        let m = &self.meta;
        let (num_modes, num_uids, num_gids) =
            (m.modes.len() as u32, m.uids.len() as u32, m.gids.len() as u32);

        let mut max_name_index = None::<u32>;
        for ino in &m.inodes {
            (ino.mode_index < num_modes).or_invalid("inodes.mode_index out of range")?;
            (ino.owner_index < num_uids || ino.owner_index == 0)
                .or_invalid("inodes.owner_index out of range")?;
            (ino.group_index < num_gids || ino.group_index == 0)
                .or_invalid("inodes.group_index out of range")?;
            if self.is_v2_2() {
                max_name_index = max_name_index.max(Some(ino.name_index_v2_2));
            }
        }

        let num_inodes = m.inodes.len() as u32;
        match &m.dir_entries {
            Some(ents) => {
                for ent in ents {
                    (ent.inode_num < num_inodes)
                        .or_invalid("dir_entries.inode_num out of range")?;
                }
                // Entry 0 is the root self-link whose name index is unused.
                max_name_index = ents[1..].iter().map(|e| e.name_index).max();
            }
            None => {
                for &ent in &m.entry_table_v2_2 {
                    (ent < num_inodes).or_invalid("entry_table_v2_2 value out of range")?;
                }
            }
        }
        if let Some(max) = max_name_index {
            // Index zero also stands in for "no name" (e.g. the root).
            (max == 0 || (max as usize) < names.len()).or_invalid("name index out of range")?;
        }

        let num_symlink_strings = symlinks.len() as u32;
        for &t in &m.symlink_table {
            (t < num_symlink_strings).or_invalid("symlink_table value out of range")?;
        }
        Ok(())
    }

    /// Every chunk lies inside a block, and chunk runs stay within the
    /// chunks table.
    fn check_chunks(&self) -> Result<()> {
        let m = &self.meta;
        let block_size = m.block_size;
        (block_size != 0 && block_size.is_power_of_two()).or_invalid("invalid block_size")?;
        for c in &m.chunks {
            (c.block < self.num_blocks).or_invalid("chunks.block out of range")?;
            c.offset
                .checked_add(c.size)
                .filter(|&end| c.offset < block_size && end <= block_size)
                .ok_or_else(|| invalid("chunk outside of its block"))?;
        }
        for &c in &m.chunk_table {
            (c as usize <= m.chunks.len()).or_invalid("chunk_table value out of range")?;
        }
        Ok(())
    }

    /// Inodes must be partitioned by type rank; a single rank scan both
    /// verifies this and recovers the partition offsets.
    fn check_partitioning(&self, tally: InodeTally) -> Result<()> {
        let m = &self.meta;
        let rank_of = |inode_idx: usize| -> Result<u32> {
            let ino = &m.inodes[inode_idx];
            Ok(mode_rank(m.modes[ino.mode_index as usize]))
        };

        let mut offsets = [0u32; 6];
        let mut prev_rank = 0u32;
        let count = if self.is_v2_2() {
            self.meta.entry_table_v2_2.len()
        } else {
            self.meta.inodes.len()
        };
        for i in 0..count {
            let rank = if self.is_v2_2() {
                rank_of(self.meta.entry_table_v2_2[i] as usize)?
            } else {
                rank_of(i)?
            };
            (rank >= prev_rank).or_invalid("inodes are not partitioned by type rank")?;
            for r in prev_rank..rank {
                offsets[r as usize + 1] = i as u32;
            }
            prev_rank = rank;
        }
        for r in prev_rank..5 {
            offsets[r as usize + 1] = count as u32;
        }

        (offsets[1] == tally.symlink_start).or_invalid("wrong number of directories")?;
        (offsets[2] == tally.unique_start).or_invalid("wrong number of symlinks")?;
        (offsets[3] == tally.device_start).or_invalid("wrong number of regular files")?;
        (offsets[4] == tally.ipc_start).or_invalid("wrong number of devices")?;
        Ok(())
    }

    /// Recover `parent_entry` by BFS over the children ranges when
    /// directories are stored packed.
    fn recover_parent_entries(&mut self, tally: InodeTally) -> Result<()> {
        if !self
            .meta
            .options
            .as_ref()
            .is_some_and(|o| o.packed_directories)
        {
            return Ok(());
        }
        let num_dirs = tally.symlink_start;
        let entry_inode = |m: &Metadata, ent: usize| -> u32 {
            match &m.dir_entries {
                Some(ents) => ents[ent].inode_num,
                None => m.inodes[ent].inode_v2_2,
            }
        };

        let mut queue = std::collections::VecDeque::from([0u32]);
        while let Some(parent_ent) = queue.pop_front() {
            let p_ino = entry_inode(&self.meta, parent_ent as usize) as usize;
            (p_ino < num_dirs as usize).or_invalid("directory entry out of the dir range")?;
            let start = self.meta.directories[p_ino].first_entry;
            let end = self.meta.directories[p_ino + 1].first_entry;
            (start <= end && end as usize <= self.num_entries())
                .or_invalid("directory children range out of range")?;
            for ent in start..end {
                let child_ino = entry_inode(&self.meta, ent as usize);
                if child_ino < num_dirs {
                    self.meta.directories[child_ino as usize].parent_entry = parent_ent;
                    queue.push_back(ent);
                }
            }
        }
        Ok(())
    }

    /// Count directory entries per file inode for `st_nlink`.
    fn count_links(&self, tally: InodeTally) -> Vec<u32> {
        let file_range = tally.unique_start..tally.device_start;
        let mut counts = vec![0u32; file_range.len()];
        let mut bump = |ino: u32| {
            if file_range.contains(&ino) {
                counts[(ino - file_range.start) as usize] += 1;
            }
        };
        match &self.meta.dir_entries {
            Some(ents) => ents.iter().skip(1).for_each(|e| bump(e.inode_num)),
            None => self
                .meta
                .inodes
                .iter()
                .for_each(|i| bump(i.inode_v2_2)),
        }
        counts
    }
}

//// Operations ////

impl<R> Filesystem<R> {
    /// The root directory inode.
    pub fn root(&self) -> InodeId {
        0
    }

    /// The total number of inodes.
    pub fn inode_count(&self) -> u32 {
        self.tally.inode_cnt
    }

    /// Access the raw parsed metadata (packed tables already unpacked).
    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    /// Serialize the metadata for debugging. With `simple`, only table
    /// cardinalities and options are reported instead of the full contents.
    pub fn metadata_as_json(&self, simple: bool) -> serde_json::Value {
        if simple {
            let m = &self.meta;
            serde_json::json!({
                "inodes": m.inodes.len(),
                "directories": m.directories.len() - 1,
                "dir_entries": m.dir_entries.as_ref().map(Vec::len),
                "chunks": m.chunks.len(),
                "names": self.names.len(),
                "symlinks": self.symlinks.len(),
                "block_size": m.block_size,
                "total_fs_size": m.total_fs_size,
                "options": serde_json::to_value(&m.options).unwrap_or_default(),
                "dwarfs_version": m.dwarfs_version.as_ref().map(|v| v.to_string()),
                "create_timestamp": m.create_timestamp,
            })
        } else {
            serde_json::to_value(&self.meta).unwrap_or_default()
        }
    }

    //// The v2.2 / v2.3 entry view layer. Callers never branch on the
    //// format version outside these accessors.

    fn entry_inode(&self, ent: u32) -> InodeId {
        match &self.meta.dir_entries {
            Some(ents) => ents[ent as usize].inode_num,
            // v2.2: entries are the inode records themselves.
            None => self.meta.inodes[ent as usize].inode_v2_2,
        }
    }

    fn entry_name(&self, ent: u32) -> &str {
        let name_index = match &self.meta.dir_entries {
            Some(ents) => ents[ent as usize].name_index,
            None => self.meta.inodes[ent as usize].name_index_v2_2,
        };
        self.names.get_str(name_index)
    }

    fn inode_data(&self, ino: InodeId) -> &crate::metadata::InodeData {
        let idx = match &self.meta.dir_entries {
            Some(_) => ino,
            None => self.meta.entry_table_v2_2[ino as usize],
        };
        &self.meta.inodes[idx as usize]
    }

    fn is_dir(&self, ino: InodeId) -> bool {
        ino < self.tally.symlink_start
    }

    fn dir_entry_range(&self, ino: InodeId) -> (u32, u32) {
        let dirs = &self.meta.directories;
        (dirs[ino as usize].first_entry, dirs[ino as usize + 1].first_entry)
    }

    fn parent_of(&self, ino: InodeId) -> InodeId {
        if ino == 0 {
            return 0;
        }
        self.entry_inode(self.meta.directories[ino as usize].parent_entry)
    }

    /// The chunk run of a regular file inode, or `None` for other types.
    fn chunk_range(&self, ino: InodeId) -> Option<(u32, u32)> {
        let t = &self.tally;
        let store_idx = if (t.unique_start..t.shared_start).contains(&ino) {
            ino - t.unique_start
        } else if (t.shared_start..t.device_start).contains(&ino) {
            let group = self.meta.shared_files_table.as_ref().expect("validated")
                [(ino - t.shared_start) as usize];
            t.unique_cnt + group
        } else {
            return None;
        };
        let tbl = &self.meta.chunk_table;
        Some((tbl[store_idx as usize], tbl[store_idx as usize + 1]))
    }

    fn file_size(&self, ino: InodeId) -> u64 {
        let Some((start, end)) = self.chunk_range(ino) else {
            return 0;
        };
        self.meta.chunks[start as usize..end as usize]
            .iter()
            .map(|c| u64::from(c.size))
            .sum()
    }

    fn cvt_time(&self, offset: u32) -> u64 {
        self.timestamp_base_scaled + u64::from(offset) * u64::from(self.time_resolution.get())
    }

    //// Lookups ////

    /// Resolve a `/`-separated path to an inode. Leading and duplicated
    /// slashes are ignored; the empty path is the root.
    pub fn find(&self, path: &str) -> Option<InodeId> {
        path.split('/')
            .filter(|seg| !seg.is_empty())
            .try_fold(self.root(), |dir, seg| self.find_at(dir, seg))
    }

    /// Look up `name` inside the directory inode `parent`.
    ///
    /// Children are name-sorted at build time, so this is a binary search
    /// over the child range.
    pub fn find_at(&self, parent: InodeId, name: &str) -> Option<InodeId> {
        if !self.is_dir(parent) {
            return None;
        }
        let (start, end) = self.dir_entry_range(parent);
        let idx = bisect_range_by(start as usize..end as usize, |ent| {
            self.entry_name(ent as u32).cmp(name)
        })?;
        Some(self.entry_inode(idx as u32))
    }

    /// Check that an inode number is valid and return it back.
    pub fn find_inode(&self, ino: InodeId) -> Option<InodeId> {
        (ino < self.tally.inode_cnt).then_some(ino)
    }

    //// Attributes ////

    /// Fill a [`Stat`] for an inode.
    pub fn getattr(&self, ino: InodeId) -> Result<Stat> {
        if ino >= self.tally.inode_cnt {
            bail!(ErrorInner::NotFound);
        }
        let t = &self.tally;
        let data = self.inode_data(ino);
        let mode = self.meta.modes[data.mode_index as usize];

        let st_size = match mode & S_IFMT {
            S_IFREG => self.file_size(ino),
            S_IFLNK => self.link_target(ino).len() as u64,
            S_IFDIR => {
                let (start, end) = self.dir_entry_range(ino);
                u64::from(end - start)
            }
            _ => 0,
        };
        let st_rdev = if (t.device_start..t.ipc_start).contains(&ino) {
            self.meta.devices.as_ref().expect("validated")[(ino - t.device_start) as usize]
        } else {
            0
        };
        let st_nlink = match &self.nlink {
            Some(counts) if (t.unique_start..t.device_start).contains(&ino) => {
                counts[(ino - t.unique_start) as usize]
            }
            _ => 1,
        };

        let st_mtime = self.cvt_time(data.mtime_offset);
        let (st_atime, st_ctime) = if self.mtime_only {
            (st_mtime, st_mtime)
        } else {
            (self.cvt_time(data.atime_offset), self.cvt_time(data.ctime_offset))
        };

        Ok(Stat {
            st_ino: ino,
            st_mode: mode,
            st_nlink,
            st_uid: self.meta.uids.get(data.owner_index as usize).copied().unwrap_or(0),
            st_gid: self.meta.gids.get(data.group_index as usize).copied().unwrap_or(0),
            st_size,
            st_rdev,
            st_atime,
            st_mtime,
            st_ctime,
        })
    }

    fn link_target(&self, ino: InodeId) -> &str {
        let idx = self.meta.symlink_table[(ino - self.tally.symlink_start) as usize];
        self.symlinks.get_str(idx)
    }

    /// Resolve the target of a symlink inode.
    pub fn readlink(&self, ino: InodeId) -> Result<&str> {
        let t = &self.tally;
        if !(t.symlink_start..t.unique_start).contains(&ino) {
            bail!(ErrorInner::NotFound);
        }
        Ok(self.link_target(ino))
    }

    /// POSIX permission check of `mask` (a combination of [`R_OK`],
    /// [`W_OK`], [`X_OK`]) for the given caller uid/gid.
    pub fn access(&self, ino: InodeId, mask: u32, uid: u32, gid: u32) -> Result<()> {
        let st = self.getattr(ino)?;
        let perms = if uid == st.st_uid {
            st.st_mode >> 6
        } else if gid == st.st_gid {
            st.st_mode >> 3
        } else {
            st.st_mode
        };
        if mask & !perms & 0o7 != 0 {
            bail!(ErrorInner::AccessDenied);
        }
        Ok(())
    }

    //// Directories ////

    /// Open a directory inode for iteration.
    pub fn opendir(&self, ino: InodeId) -> Result<DirHandle> {
        if ino >= self.tally.inode_cnt {
            bail!(ErrorInner::NotFound);
        }
        if !self.is_dir(ino) {
            bail!(ErrorInner::NotADirectory);
        }
        let (ent_start, ent_end) = self.dir_entry_range(ino);
        Ok(DirHandle { ino, ent_start, ent_end })
    }

    /// The number of entries [`readdir`][Self::readdir] yields, including
    /// the synthesized `.` and `..`.
    pub fn dirsize(&self, dir: &DirHandle) -> u32 {
        dir.ent_end - dir.ent_start + 2
    }

    /// Read the `i`-th entry of an open directory. Index 0 is `.`, index 1
    /// is `..`, the children follow in name order.
    pub fn readdir(&self, dir: &DirHandle, i: u32) -> Option<(InodeId, &str)> {
        match i {
            0 => Some((dir.ino, ".")),
            1 => Some((self.parent_of(dir.ino), "..")),
            _ => {
                let ent = dir.ent_start.checked_add(i - 2)?;
                (ent < dir.ent_end).then(|| (self.entry_inode(ent), self.entry_name(ent)))
            }
        }
    }

    //// Traversal ////

    /// Depth-first pre-order traversal over all directory entries, the root
    /// first. Children are visited in name order.
    pub fn walk(&self, mut cb: impl FnMut(&WalkEntry<'_>)) {
        cb(&WalkEntry { path: "", name: "", inode: self.root() });
        let mut path = String::new();
        self.walk_dir(self.root(), &mut path, &mut cb);
    }

    fn walk_dir(&self, dir: InodeId, path: &mut String, cb: &mut impl FnMut(&WalkEntry<'_>)) {
        let (start, end) = self.dir_entry_range(dir);
        for ent in start..end {
            let ino = self.entry_inode(ent);
            let name = self.entry_name(ent);
            let saved = path.len();
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(name);
            cb(&WalkEntry { path: &*path, name, inode: ino });
            if self.is_dir(ino) {
                self.walk_dir(ino, path, cb);
            }
            path.truncate(saved);
        }
    }

    /// Traversal in data stream order: regular files are visited in the
    /// order their first bytes appear in the block stream, everything else
    /// keeps the depth-first order and comes first.
    pub fn walk_data_order(&self, mut cb: impl FnMut(&WalkEntry<'_>)) {
        struct Collected {
            path: String,
            name_at: usize,
            inode: InodeId,
            sort_key: (u8, u64, u64, u32),
        }

        let mut entries = Vec::new();
        let mut seq = 0u32;
        self.walk(|ent| {
            let sort_key = match self.chunk_range(ent.inode) {
                Some((start, end)) if start != end => {
                    let c = &self.meta.chunks[start as usize];
                    (1, u64::from(c.block), u64::from(c.offset), seq)
                }
                // Directories, links, specials and empty files keep the
                // walk order, ahead of data-bearing files.
                _ => (0, 0, 0, seq),
            };
            entries.push(Collected {
                path: ent.path.to_owned(),
                name_at: ent.path.len() - ent.name.len(),
                inode: ent.inode,
                sort_key,
            });
            seq += 1;
        });
        entries.sort_by_key(|e| e.sort_key);
        for ent in &entries {
            cb(&WalkEntry {
                path: &ent.path,
                name: &ent.path[ent.name_at..],
                inode: ent.inode,
            });
        }
    }

    //// Totals ////

    /// Fill a [`StatVfs`] with filesystem totals.
    pub fn statvfs(&self) -> StatVfs {
        let hardlink = self.meta.total_hardlink_size.unwrap_or(0);
        StatVfs {
            f_bsize: self.block_size.into(),
            f_frsize: 1,
            // With nlink accounting, hardlinked content counts once.
            f_blocks: if self.nlink.is_some() {
                self.meta.total_fs_size
            } else {
                self.meta.total_fs_size + hardlink
            },
            f_files: self.tally.inode_cnt.into(),
            f_namemax: 255,
            readonly: true,
        }
    }
}

impl<R: ReadAt> Filesystem<R> {
    /// Open a regular file inode for reading.
    pub fn open(&self, ino: InodeId) -> Result<FileHandle> {
        if ino >= self.tally.inode_cnt {
            bail!(ErrorInner::NotFound);
        }
        let Some((chunk_start, chunk_end)) = self.chunk_range(ino) else {
            bail!(ErrorInner::NotAFile);
        };
        Ok(FileHandle {
            ino,
            chunk_start,
            chunk_end,
            size: self.file_size(ino),
        })
    }

    /// Read up to `buf.len()` bytes at `offset` into `buf`, returning the
    /// number of bytes read. Short reads happen only at end of file.
    pub fn read(&self, file: &FileHandle, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut skip = offset;
        let mut filled = 0usize;
        for chunk in &self.meta.chunks[file.chunk_start as usize..file.chunk_end as usize] {
            if filled == buf.len() {
                break;
            }
            let chunk_len = u64::from(chunk.size);
            if skip >= chunk_len {
                skip -= chunk_len;
                continue;
            }
            let block = self.cached_block(chunk.block)?;
            let begin = chunk.offset as usize + skip as usize;
            let end = (chunk.offset + chunk.size) as usize;
            let piece = block.get(begin..end).ok_or_else(|| {
                invalid(format_args!(
                    "block {} has {} bytes but is referenced at {begin}..{end}",
                    chunk.block,
                    block.len(),
                ))
            })?;
            let n = piece.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&piece[..n]);
            filled += n;
            skip = 0;
        }
        Ok(filled)
    }

    /// Read the whole file content into a `Vec`.
    pub fn read_to_vec(&self, file: &FileHandle) -> Result<Vec<u8>> {
        let mut out = vec![
            0u8;
            usize::try_from(file.size).map_err(|_| invalid("file too large for memory"))?
        ];
        let n = self.read(file, &mut out, 0)?;
        out.truncate(n);
        Ok(out)
    }

    /// Get the decompressed bytes of a block through the cache.
    fn cached_block(&self, block: u32) -> Result<std::sync::Arc<[u8]>> {
        let &offset = self
            .block_sections
            .get(block as usize)
            .ok_or_else(|| invalid(format_args!("block {block} out of range")))?;
        self.cache.get_or_load(block, || {
            let header = self
                .rdr
                .read_header_at(offset)
                .context(format_args!("failed to read block {block}"))?;
            header
                .check_type(SectionType::BLOCK)
                .context(format_args!("section for block {block}"))?;
            let mut buf = vec![0u8; self.block_size as usize];
            let len = self
                .rdr
                .read_payload_at_into(&header, offset + HEADER_SIZE, &mut buf)
                .context(format_args!("failed to decompress block {block}"))?;
            buf.truncate(len);
            Ok(buf)
        })
    }
}
