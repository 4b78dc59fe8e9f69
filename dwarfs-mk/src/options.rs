//! Builder configuration.
use std::fmt;

use dwarfs::section::CompressParam;

use crate::error::{ErrorInner, Result};

/// How distinct file contents are ordered before segmentation.
///
/// The order determines the layout of the block stream and therefore how
/// well the segmenter can exploit cross-file similarity. All modes are
/// deterministic, with the path as the final tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileOrderMode {
    /// Keep discovery order.
    #[default]
    None,
    /// Sort by path.
    Path,
    /// Order decided by a [`Script`][crate::Script] callback.
    Script,
    /// Sort by a cheap 32-bit content similarity hash.
    Similarity,
    /// Greedy nearest-neighbour tour over 256-bit locality-sensitive
    /// hashes. Slowest, best locality.
    Nilsimsa,
}

/// Configuration of the segmenter and block layout.
#[derive(Debug, Clone)]
pub struct BlockConfig {
    /// Blocks are `1 << block_size_bits` bytes before compression.
    pub block_size_bits: u32,
    /// The rolling hash window. Zero disables segmentation entirely.
    pub blockhash_window_size: usize,
    /// How many finished blocks stay searchable for matches.
    pub lookback_blocks: u32,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            block_size_bits: 24,
            blockhash_window_size: 64,
            lookback_blocks: 1,
        }
    }
}

impl BlockConfig {
    pub fn block_size(&self) -> usize {
        1usize << self.block_size_bits
    }
}

/// Scanner and metadata options.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct ScannerOptions {
    pub file_order: FileOrderMode,
    /// Content hash used for whole-file deduplication. `None` disables
    /// deduplication: every file becomes its own stored content.
    pub file_hash_algorithm: Option<HashAlgorithm>,
    /// Include block and character devices.
    pub with_devices: bool,
    /// Include fifos and sockets.
    pub with_specials: bool,
    /// Store atime and ctime besides mtime.
    pub keep_all_times: bool,
    /// Timestamp resolution in seconds; values below 2 mean full resolution.
    pub time_resolution_sec: u32,
    /// Force this owner id on every inode.
    pub uid: Option<u32>,
    /// Force this group id on every inode.
    pub gid: Option<u32>,
    /// Force this value for every timestamp.
    pub timestamp: Option<u64>,

    pub pack_chunk_table: bool,
    pub pack_directories: bool,
    pub pack_shared_files_table: bool,
    /// Symbol-compress the names buffer.
    pub pack_names: bool,
    /// Delta-pack the names index.
    pub pack_names_index: bool,
    /// Symbol-compress the symlink targets buffer.
    pub pack_symlinks: bool,
    /// Delta-pack the symlink targets index.
    pub pack_symlinks_index: bool,
    /// Keep symbol compression even when it does not shrink the table.
    pub force_pack_string_tables: bool,
    /// Store names as a plain string list instead of a compact table.
    pub plain_names_table: bool,
    /// Store symlink targets as a plain string list.
    pub plain_symlinks_table: bool,

    /// Drop directories that end up empty after filtering.
    pub remove_empty_dirs: bool,
    /// Do not record the image creation time.
    pub no_create_timestamp: bool,
}

/// Content hash algorithms for file deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Xxh3_128,
    Xxh3_64,
    Sha512,
    Sha256,
}

impl HashAlgorithm {
    /// All algorithm names accepted by [`HashAlgorithm::parse`].
    pub fn available() -> &'static [&'static str] {
        &["xxh3-128", "xxh3-64", "sha512", "sha256"]
    }

    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "xxh3-128" => Self::Xxh3_128,
            "xxh3-64" => Self::Xxh3_64,
            "sha512" => Self::Sha512,
            "sha256" => Self::Sha256,
            _ => bail!(ErrorInner::BadOption(format!("unknown hash algorithm: {name}"))),
        })
    }

    pub fn digest(&self, data: &[u8]) -> Box<[u8]> {
        use sha2::Digest;
        match self {
            Self::Xxh3_128 => Box::new(xxhash_rust::xxh3::xxh3_128(data).to_le_bytes()),
            Self::Xxh3_64 => Box::new(xxhash_rust::xxh3::xxh3_64(data).to_le_bytes()),
            Self::Sha512 => sha2::Sha512::digest(data)[..].into(),
            Self::Sha256 => sha2::Sha256::digest(data)[..].into(),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Xxh3_128 => "xxh3-128",
            Self::Xxh3_64 => "xxh3-64",
            Self::Sha512 => "sha512",
            Self::Sha256 => "sha256",
        })
    }
}

/// Parse a compression specification string.
///
/// Accepted forms: `null`, `lz4`, `lz4hc:level=N`, `zstd:level=N`,
/// `lzma:level=N`. Algorithms behind disabled cargo features are rejected.
pub fn parse_compression(spec: &str) -> Result<CompressParam> {
    let (algo, arg) = match spec.split_once(':') {
        Some((algo, arg)) => (algo, Some(arg)),
        None => (spec, None),
    };
    let level = |key: &str| -> Result<i32> {
        let arg = arg.ok_or_else(|| bad_spec(spec, "missing parameter"))?;
        let (k, v) = arg
            .split_once('=')
            .ok_or_else(|| bad_spec(spec, "expected key=value"))?;
        if k != key {
            bail!(bad_spec(spec, format_args!("unknown parameter {k}")));
        }
        v.parse().map_err(|_| bad_spec(spec, "bad level"))
    };

    match algo {
        "null" => {
            if arg.is_some() {
                bail!(bad_spec(spec, "null takes no parameters"));
            }
            Ok(CompressParam::None)
        }
        #[cfg(feature = "lz4")]
        "lz4" => {
            if arg.is_some() {
                bail!(bad_spec(spec, "lz4 takes no parameters"));
            }
            Ok(CompressParam::Lz4)
        }
        #[cfg(feature = "lz4")]
        "lz4hc" => Ok(CompressParam::Lz4Hc(level("level")?)),
        #[cfg(feature = "zstd")]
        "zstd" => Ok(CompressParam::Zstd(level("level")?)),
        #[cfg(feature = "lzma")]
        "lzma" => {
            let preset = level("level")?;
            let preset =
                u32::try_from(preset).map_err(|_| bad_spec(spec, "bad level"))?;
            Ok(CompressParam::Lzma(preset))
        }
        _ => bail!(bad_spec(spec, "unknown or disabled algorithm")),
    }
}

#[cold]
fn bad_spec(spec: &str, msg: impl fmt::Display) -> crate::Error {
    ErrorInner::BadOption(format!("compression spec {spec:?}: {msg}")).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_specs() {
        assert_eq!(parse_compression("null").unwrap(), CompressParam::None);
        #[cfg(feature = "lz4")]
        {
            assert_eq!(parse_compression("lz4").unwrap(), CompressParam::Lz4);
            assert_eq!(parse_compression("lz4hc:level=4").unwrap(), CompressParam::Lz4Hc(4));
        }
        #[cfg(feature = "zstd")]
        assert_eq!(parse_compression("zstd:level=19").unwrap(), CompressParam::Zstd(19));
        assert!(parse_compression("brotli:quality=2").is_err());
        assert!(parse_compression("zstd:foo=1").is_err());
        assert!(parse_compression("null:level=1").is_err());
    }

    #[test]
    fn hash_algorithms() {
        for name in HashAlgorithm::available() {
            let algo = HashAlgorithm::parse(name).unwrap();
            assert_eq!(algo.to_string(), *name);
            // Digests must be stable and content-determined.
            assert_eq!(algo.digest(b"abc"), algo.digest(b"abc"));
            assert_ne!(algo.digest(b"abc"), algo.digest(b"abd"));
        }
        assert!(HashAlgorithm::parse("crc32").is_err());
    }
}
