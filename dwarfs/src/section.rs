//! The low-level module for accessing sections in a filesystem image.
//!
//! An image is a sequence of sections, each a [`Header`] followed by a
//! maybe-compressed payload. Sections holding file data are called blocks;
//! every block decompresses to exactly the filesystem block size, except the
//! last one which may be shorter. The metadata schema and the frozen metadata
//! are stored in dedicated trailing sections.
//!
//! Readers locate sections by scanning headers front to back, see
//! [`SectionReader::scan_sections`]. Functions returning payloads always
//! validate the fast XXH3 checksum against the header before returning.
use std::{fmt, mem::offset_of};

use positioned_io::ReadAt;
use xxhash_rust::xxh3::Xxh3Default;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, little_endian as le};

type Result<T> = std::result::Result<T, Error>;

/// An error raised from reading, validating, compressing or decompressing
/// sections.
pub struct Error(Box<ErrorInner>);

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
#[non_exhaustive]
enum ErrorInner {
    // Header.
    InvalidMagic([u8; 6]),
    UnsupportedVersion(u8, u8),
    LengthMismatch,
    ChecksumMismatch,
    OffsetOverflow,

    // Payload.
    UnsupportedCompressAlgo(CompressAlgo),
    TypeMismatch {
        expect: SectionType,
        got: SectionType,
    },
    PayloadTooLong {
        limit: usize,
        got: u64,
    },
    Codec(std::io::Error),

    // Section scan.
    MalformedImage(String),
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::InvalidMagic(magic) => {
                write!(f, "invalid section magic: b\"{}\"", magic.escape_ascii())
            }
            ErrorInner::UnsupportedVersion(maj, min) => {
                write!(f, "unsupported image version: {maj}.{min}")
            }
            ErrorInner::LengthMismatch => f.pad("section payload length mismatch"),
            ErrorInner::ChecksumMismatch => f.pad("section checksum mismatch"),
            ErrorInner::OffsetOverflow => f.pad("section offset overflow"),

            ErrorInner::UnsupportedCompressAlgo(algo) => {
                write!(f, "unsupported section compress algorithm {algo:?}")
            }
            ErrorInner::TypeMismatch { expect, got } => {
                write!(f, "section type mismatch, expect {expect:?} but got {got:?}")
            }
            ErrorInner::PayloadTooLong { limit, got } => {
                write!(
                    f,
                    "section payload has {got} bytes, exceeding the limit of {limit} bytes"
                )
            }
            ErrorInner::Codec(err) => write!(f, "failed to (de)compress section payload: {err}"),

            ErrorInner::MalformedImage(msg) => write!(f, "malformed image: {msg}"),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Codec(err) | ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

/// The byte size of a serialized [`Header`].
pub const HEADER_SIZE: u64 = size_of::<Header>() as u64;

/// The section header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(8))]
pub struct Header {
    /// Header magic and format version.
    pub magic_version: MagicVersion,
    /// The "slow" hash digest of SHA-512/256 over the section contents.
    pub slow_hash: [u8; 32],
    /// The "fast" hash digest of XXH3-64 over the section contents.
    pub fast_hash: [u8; 8],
    /// The 0-based index of this section in the image.
    pub section_number: le::U32,
    /// The type of this section.
    pub section_type: SectionType,
    /// The compression algorithm of the section payload.
    pub compress_algo: CompressAlgo,
    /// The length in bytes of the (compressed) payload following.
    pub payload_size: le::U64,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("magic_version", &self.magic_version)
            .field("slow_hash", &format_args!("{:02x?}", self.slow_hash))
            .field("fast_hash", &format_args!("{:02x?}", self.fast_hash))
            .field("section_number", &self.section_number.get())
            .field("section_type", &self.section_type)
            .field("compress_algo", &self.compress_algo)
            .field("payload_size", &self.payload_size.get())
            .finish()
    }
}

impl Header {
    /// Construct a header for `payload`, filling both checksums.
    pub fn new_sealed(
        section_number: u32,
        section_type: SectionType,
        compress_algo: CompressAlgo,
        payload: &[u8],
    ) -> Self {
        let mut header = Header {
            magic_version: MagicVersion::LATEST,
            slow_hash: [0u8; 32],
            fast_hash: [0u8; 8],
            section_number: section_number.into(),
            section_type,
            compress_algo,
            payload_size: (payload.len() as u64).into(),
        };
        header.seal(payload);
        header
    }

    /// Fill both checksum fields from the remaining header bytes and `payload`.
    ///
    /// Each hash covers the header bytes following its own field, then the
    /// payload. `payload_size` must already be set.
    pub fn seal(&mut self, payload: &[u8]) {
        let mut fast = Xxh3Default::new();
        fast.update(&self.as_bytes()[offset_of!(Self, section_number)..]);
        fast.update(payload);
        self.fast_hash = fast.digest().to_le_bytes();

        use sha2::Digest;
        let mut slow = sha2::Sha512_256::new();
        slow.update(&self.as_bytes()[offset_of!(Self, fast_hash)..]);
        slow.update(payload);
        self.slow_hash = slow.finalize().into();
    }

    /// Validate the checksum of header and payload using the "fast" XXH3-64 hash.
    pub fn validate_fast_checksum(&self, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 != self.payload_size.get() {
            bail!(ErrorInner::LengthMismatch);
        }
        let mut h = Xxh3Default::new();
        h.update(&self.as_bytes()[offset_of!(Self, section_number)..]);
        h.update(payload);
        if h.digest() != u64::from_le_bytes(self.fast_hash) {
            bail!(ErrorInner::ChecksumMismatch);
        }
        Ok(())
    }

    /// Validate the checksum of header and payload using the "slow" SHA-512/256 hash.
    pub fn validate_slow_checksum(&self, payload: &[u8]) -> Result<()> {
        use sha2::Digest;

        if payload.len() as u64 != self.payload_size.get() {
            bail!(ErrorInner::LengthMismatch);
        }
        let mut h = sha2::Sha512_256::new();
        h.update(&self.as_bytes()[offset_of!(Self, fast_hash)..]);
        h.update(payload);
        if h.finalize()[..] != self.slow_hash {
            bail!(ErrorInner::ChecksumMismatch);
        }
        Ok(())
    }

    /// Check that this section header has the expected section type.
    pub fn check_type(&self, expect: SectionType) -> Result<()> {
        if self.section_type != expect {
            bail!(ErrorInner::TypeMismatch {
                expect,
                got: self.section_type,
            });
        }
        Ok(())
    }

    fn payload_size_limited(&self, limit: usize) -> Result<usize> {
        let size = self.payload_size.get();
        if let Some(size) = usize::try_from(size).ok().filter(|&n| n <= limit) {
            Ok(size)
        } else {
            bail!(ErrorInner::PayloadTooLong { limit, got: size })
        }
    }
}

/// Section magic and format version.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MagicVersion {
    /// The section magic, matching [`MagicVersion::MAGIC`].
    pub magic: [u8; 6],
    /// The format major version.
    pub major: u8,
    /// The format minor version.
    pub minor: u8,
}

impl fmt::Debug for MagicVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MagicVersion")
            .field("magic", &format_args!("b\"{}\"", self.magic.escape_ascii()))
            .field("major", &self.major)
            .field("minor", &self.minor)
            .finish()
    }
}

impl MagicVersion {
    /// The expected magic.
    pub const MAGIC: [u8; 6] = *b"DWARFS";

    /// The newest supported version, used for all written sections.
    pub const LATEST: Self = MagicVersion {
        magic: Self::MAGIC,
        major: crate::FORMAT_VERSION_MAX.0,
        minor: crate::FORMAT_VERSION_MAX.1,
    };

    /// Validate that the magic matches and the format version is supported.
    pub fn validate(self) -> Result<()> {
        if self.magic != Self::MAGIC {
            bail!(ErrorInner::InvalidMagic(self.magic));
        }
        let ver = (self.major, self.minor);
        if crate::FORMAT_VERSION_MIN <= ver && ver <= crate::FORMAT_VERSION_MAX {
            Ok(())
        } else {
            bail!(ErrorInner::UnsupportedVersion(ver.0, ver.1))
        }
    }
}

/// The type of a section.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(2))]
pub struct SectionType(pub le::U16);

macro_rules! impl_open_enum {
    ($name:ident; $ctor:path; $($(#[$meta:meta])* $variant:ident = $value:expr,)*) => {
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(match *self {
                    $(Self::$variant => stringify!($variant),)*
                    _ => return f
                        .debug_tuple(stringify!($name))
                        .field(&self.0.get())
                        .finish(),
                })
            }
        }

        impl $name {
            $(
                $(#[$meta])*
                pub const $variant: Self = Self($ctor($value));
            )*
        }
    };
}

impl_open_enum! {
    SectionType; le::U16::new;

    /// A block of file data.
    BLOCK = 0,
    /// The schema describing the layout of the frozen metadata,
    /// see [`crate::metadata::Schema`].
    METADATA_V2_SCHEMA = 7,
    /// The frozen metadata, see [`crate::metadata::Metadata`].
    METADATA_V2 = 8,
    /// Image history information. Ignored by this library.
    HISTORY = 10,
}

/// Compression algorithm used for section payloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(2))]
pub struct CompressAlgo(pub le::U16);

impl_open_enum! {
    CompressAlgo; le::U16::new;

    /// Not compressed.
    NONE = 0,
    /// LZMA, aka `.xz` compression. Supported via feature `lzma`.
    LZMA = 1,
    /// Zstandard compression. Supported via feature `zstd`.
    ZSTD = 2,
    /// LZ4 compression. Supported via feature `lz4`.
    LZ4 = 3,
    /// LZ4 in HC (high-compression) mode. Decompresses as normal LZ4.
    /// Supported via feature `lz4`.
    LZ4HC = 4,
    /// Brotli compression. Not supported.
    BROTLI = 5,
    /// FLAC compression. Not supported.
    FLAC = 6,
    /// Rice++ compression. Not supported.
    RICEPP = 7,
}

/// A compression request, parameterized with the codec level.
///
/// See [`compress`] for how a request maps to a [`CompressAlgo`] tag on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CompressParam {
    /// Store payloads uncompressed.
    None,
    /// LZ4, fast mode.
    #[cfg(feature = "lz4")]
    Lz4,
    /// LZ4 high-compression mode with the given level.
    #[cfg(feature = "lz4")]
    Lz4Hc(i32),
    /// Zstandard with the given level.
    #[cfg(feature = "zstd")]
    Zstd(i32),
    /// LZMA with the given preset.
    #[cfg(feature = "lzma")]
    Lzma(u32),
}

/// Compress `data` according to `param`.
///
/// If the compressed form is not strictly smaller than the input, the payload
/// is stored verbatim and tagged [`CompressAlgo::NONE`] instead. An image may
/// therefore carry blocks with mixed compression tags, e.g. when a block of
/// incompressible data is refused by the codec.
pub fn compress(param: CompressParam, data: &[u8]) -> Result<(CompressAlgo, Vec<u8>)> {
    let compressed = match param {
        CompressParam::None => None,
        #[cfg(feature = "lz4")]
        CompressParam::Lz4 => Some(
            lz4::block::compress(data, Some(lz4::block::CompressionMode::DEFAULT), true)
                .map_err(ErrorInner::Codec)?,
        ),
        #[cfg(feature = "lz4")]
        CompressParam::Lz4Hc(level) => Some(
            lz4::block::compress(
                data,
                Some(lz4::block::CompressionMode::HIGHCOMPRESSION(level)),
                true,
            )
            .map_err(ErrorInner::Codec)?,
        ),
        #[cfg(feature = "zstd")]
        CompressParam::Zstd(level) => {
            Some(zstd::bulk::compress(data, level).map_err(ErrorInner::Codec)?)
        }
        #[cfg(feature = "lzma")]
        CompressParam::Lzma(preset) => {
            use std::io::Read;
            let mut out = Vec::new();
            xz2::read::XzEncoder::new(data, preset)
                .read_to_end(&mut out)
                .map_err(ErrorInner::Codec)?;
            Some(out)
        }
    };

    Ok(match compressed {
        Some(out) if out.len() < data.len() => {
            let algo = match param {
                CompressParam::None => unreachable!(),
                #[cfg(feature = "lz4")]
                CompressParam::Lz4 => CompressAlgo::LZ4,
                #[cfg(feature = "lz4")]
                CompressParam::Lz4Hc(_) => CompressAlgo::LZ4HC,
                #[cfg(feature = "zstd")]
                CompressParam::Zstd(_) => CompressAlgo::ZSTD,
                #[cfg(feature = "lzma")]
                CompressParam::Lzma(_) => CompressAlgo::LZMA,
            };
            (algo, out)
        }
        _ => (CompressAlgo::NONE, data.to_vec()),
    })
}

/// An entry of the in-memory section index built by
/// [`SectionReader::scan_sections`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionInfo {
    /// The type of the section.
    pub section_type: SectionType,
    /// The offset of the section header, relative to the start of the image.
    pub offset: u64,
}

/// The wrapper type for reading sections from a random access reader.
///
/// The inner type should implement [`positioned_io::ReadAt`], typically
/// [`std::fs::File`] or a memory-mapped byte slice. No extra buffering is
/// needed: sections are large and the high-level [`Filesystem`][crate::fs]
/// has its own block cache.
pub struct SectionReader<R: ?Sized> {
    /// The offset of the start of the image in `rdr`, added to all operation
    /// offsets.
    image_start: u64,
    rdr: R,
}

impl<R: fmt::Debug + ?Sized> fmt::Debug for SectionReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionReader")
            .field("image_start", &self.image_start)
            .field("rdr", &&self.rdr)
            .finish()
    }
}

impl<R> SectionReader<R> {
    /// Create a new section reader wrapping an existing random access stream.
    pub fn new(rdr: R) -> Self {
        Self::new_with_offset(rdr, 0)
    }

    /// Same as [`Self::new`] but indicates that the image starts at
    /// `image_start` in `rdr` instead of at offset zero.
    pub fn new_with_offset(rdr: R, image_start: u64) -> Self {
        SectionReader { image_start, rdr }
    }
}

impl<R: ?Sized> SectionReader<R> {
    /// Get a reference to the underlying reader.
    #[inline]
    #[must_use]
    pub fn get_ref(&self) -> &R {
        &self.rdr
    }

    /// Retrieve the ownership of the underlying reader.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> R
    where
        R: Sized,
    {
        self.rdr
    }
}

impl<R: ReadAt + ?Sized> SectionReader<R> {
    /// Read a section header at `section_offset`.
    pub fn read_header_at(&self, section_offset: u64) -> Result<Header> {
        let file_offset = self
            .image_start
            .checked_add(section_offset)
            .ok_or(ErrorInner::OffsetOverflow)?;
        let mut header = Header::new_zeroed();
        self.rdr.read_exact_at(file_offset, header.as_mut_bytes())?;
        header.magic_version.validate()?;
        Ok(header)
    }

    /// Read and decompress a full section at `section_offset` into memory.
    pub fn read_section_at(
        &self,
        section_offset: u64,
        payload_size_limit: usize,
    ) -> Result<(Header, Vec<u8>)> {
        let header = self.read_header_at(section_offset)?;
        // The header was read successfully, so this cannot overflow.
        let payload_offset = section_offset + HEADER_SIZE;
        let payload = self.read_payload_at(&header, payload_offset, payload_size_limit)?;
        Ok((header, payload))
    }

    /// Read and decompress the section payload of a given header.
    ///
    /// `payload_offset` is the offset of the bytes following the header,
    /// relative to the start of the image. Both the compressed and the
    /// decompressed size must stay within `payload_size_limit`.
    pub fn read_payload_at(
        &self,
        header: &Header,
        payload_offset: u64,
        payload_size_limit: usize,
    ) -> Result<Vec<u8>> {
        let mut out = vec![0u8; payload_size_limit];
        let len = self.read_payload_at_into(header, payload_offset, &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    /// Same as [`Self::read_payload_at`] but decompresses into `out`,
    /// returning the decompressed length.
    pub fn read_payload_at_into(
        &self,
        header: &Header,
        payload_offset: u64,
        out: &mut [u8],
    ) -> Result<usize> {
        let file_offset = self
            .image_start
            .checked_add(payload_offset)
            .ok_or(ErrorInner::OffsetOverflow)?;

        let compressed_size = header.payload_size_limited(out.len())?;
        let mut raw_buf = vec![0u8; compressed_size];
        self.rdr.read_exact_at(file_offset, &mut raw_buf)?;
        header.validate_fast_checksum(&raw_buf)?;

        match header.compress_algo {
            CompressAlgo::NONE => {
                out[..compressed_size].copy_from_slice(&raw_buf);
                Ok(compressed_size)
            }
            #[cfg(feature = "zstd")]
            CompressAlgo::ZSTD => {
                let len = zstd::bulk::decompress_to_buffer(&raw_buf, out)
                    .map_err(ErrorInner::Codec)?;
                Ok(len)
            }
            #[cfg(feature = "lz4")]
            CompressAlgo::LZ4 | CompressAlgo::LZ4HC => {
                let len = lz4::block::decompress_to_buffer(&raw_buf, None, out)
                    .map_err(ErrorInner::Codec)?;
                Ok(len)
            }
            #[cfg(feature = "lzma")]
            CompressAlgo::LZMA => {
                use std::io::Read;
                let mut decoder = xz2::read::XzDecoder::new(&raw_buf[..]);
                let mut len = 0usize;
                loop {
                    match decoder.read(&mut out[len..]).map_err(ErrorInner::Codec)? {
                        0 => break,
                        n => len += n,
                    }
                    if len == out.len() {
                        // Probe for trailing data beyond the limit.
                        let mut probe = [0u8; 1];
                        if decoder.read(&mut probe).map_err(ErrorInner::Codec)? != 0 {
                            bail!(ErrorInner::PayloadTooLong {
                                limit: out.len(),
                                got: out.len() as u64 + 1,
                            });
                        }
                        break;
                    }
                }
                Ok(len)
            }
            algo => Err(ErrorInner::UnsupportedCompressAlgo(algo).into()),
        }
    }

    /// Build the section index by scanning headers from the start of the
    /// image up to `stream_len` bytes.
    ///
    /// Section numbers must be consecutive from zero, or an error is raised.
    pub fn scan_sections(&self, stream_len: u64) -> Result<Vec<SectionInfo>> {
        let mut sections = Vec::new();
        let mut offset = 0u64;
        let end = stream_len
            .checked_sub(self.image_start)
            .ok_or_else(|| malformed("image offset exceeds stream length"))?;

        while offset < end {
            if end - offset < HEADER_SIZE {
                bail!(malformed(format!(
                    "trailing garbage of {} bytes after the last section",
                    end - offset
                )));
            }
            let header = self.read_header_at(offset)?;
            if header.section_number.get() as usize != sections.len() {
                bail!(malformed(format!(
                    "section at offset {} has number {}, expected {}",
                    offset,
                    header.section_number.get(),
                    sections.len(),
                )));
            }
            sections.push(SectionInfo {
                section_type: header.section_type,
                offset,
            });
            offset = offset
                .checked_add(HEADER_SIZE)
                .and_then(|o| o.checked_add(header.payload_size.get()))
                .ok_or(ErrorInner::OffsetOverflow)?;
        }
        Ok(sections)
    }
}

#[cold]
fn malformed(msg: impl Into<String>) -> Error {
    ErrorInner::MalformedImage(msg.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_section(out: &mut Vec<u8>, number: u32, ty: SectionType, payload: &[u8]) {
        let header = Header::new_sealed(number, ty, CompressAlgo::NONE, payload);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(payload);
    }

    #[test]
    fn scan_and_read_back() {
        let mut img = Vec::new();
        write_section(&mut img, 0, SectionType::BLOCK, b"hello");
        write_section(&mut img, 1, SectionType::METADATA_V2_SCHEMA, b"schema");
        write_section(&mut img, 2, SectionType::METADATA_V2, b"metadata");

        let rdr = SectionReader::new(img.clone());
        let sections = rdr.scan_sections(img.len() as u64).unwrap();
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].section_type, SectionType::BLOCK);
        assert_eq!(sections[2].section_type, SectionType::METADATA_V2);

        let (header, payload) = rdr.read_section_at(sections[1].offset, 64).unwrap();
        header.check_type(SectionType::METADATA_V2_SCHEMA).unwrap();
        header.validate_slow_checksum(&payload).unwrap();
        assert_eq!(payload, b"schema");
    }

    #[test]
    fn checksum_mismatch() {
        let mut img = Vec::new();
        write_section(&mut img, 0, SectionType::BLOCK, b"hello");
        let last = img.len() - 1;
        img[last] ^= 0xFF;

        let rdr = SectionReader::new(img.clone());
        let err = rdr.read_section_at(0, 64).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn numbering_must_be_consecutive() {
        let mut img = Vec::new();
        write_section(&mut img, 1, SectionType::BLOCK, b"hello");
        let rdr = SectionReader::new(img.clone());
        assert!(rdr.scan_sections(img.len() as u64).is_err());
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn compress_fallback_to_none() {
        // A short incompressible payload must be stored verbatim.
        let data: Vec<u8> = (0u32..64).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let (algo, out) = compress(CompressParam::Zstd(3), &data).unwrap();
        if algo == CompressAlgo::NONE {
            assert_eq!(out, data);
        } else {
            assert!(out.len() < data.len());
        }

        // Highly repetitive data must actually compress.
        let data = vec![0x41u8; 1 << 16];
        let (algo, out) = compress(CompressParam::Zstd(3), &data).unwrap();
        assert_eq!(algo, CompressAlgo::ZSTD);
        assert!(out.len() < data.len());
    }
}
