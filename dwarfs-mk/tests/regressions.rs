//! Regression tests for block layout and compression edge cases.
mod common;

use common::{build_image, loremipsum, prng_bytes, MemFs};
use dwarfs::fs::{Filesystem, FilesystemOptions};
use dwarfs::section::{CompressAlgo, SectionReader, SectionType};
use dwarfs_mk::{BlockConfig, HashAlgorithm, Progress, ScannerOptions};

fn reader_options() -> FilesystemOptions {
    let mut opts = FilesystemOptions::default();
    opts.block_cache.max_bytes = 1 << 20;
    opts.metadata.check_consistency = true;
    opts
}

fn base_options() -> ScannerOptions {
    let mut options = ScannerOptions::default();
    options.file_hash_algorithm = Some(HashAlgorithm::Xxh3_128);
    options.no_create_timestamp = true;
    options
}

/// Image size must grow monotonically with file size around a block
/// boundary.
#[test]
fn block_boundary_sizes() {
    let cfg = BlockConfig {
        block_size_bits: 10,
        blockhash_window_size: 12,
        lookback_blocks: 1,
    };

    let mut image_sizes = Vec::new();
    for size in [1023u64, 1024, 1025] {
        let mut mem = MemFs::new();
        mem.add_dir("");
        // Incompressible content, so nothing segments or compresses away.
        mem.add_file_data("test", prng_bytes(size, size as usize));

        let prog = Progress::default();
        let img = build_image(&mem, "null", &cfg, &base_options(), &prog, None, None);
        image_sizes.push(img.len());

        let fs = Filesystem::new_with_options(img, &reader_options()).unwrap();
        let vfs = fs.statvfs();
        assert_eq!(vfs.f_files, 2);
        assert_eq!(vfs.f_blocks, size);

        let fh = fs.open(fs.find("/test").unwrap()).unwrap();
        let mut buf = vec![0u8; size as usize];
        assert_eq!(fs.read(&fh, &mut buf, 0).unwrap(), size as usize);
        assert_eq!(buf, prng_bytes(size, size as usize));
    }
    assert!(image_sizes.is_sorted(), "sizes: {image_sizes:?}");
}

/// One incompressible and one compressible block: the incompressible one
/// must be stored with the NONE tag while the rest compresses normally,
/// and both files must round-trip.
#[cfg(feature = "lz4")]
#[test]
fn mixed_compression_tags() {
    const BLOCK_BITS: u32 = 18;
    const FILE_SIZE: usize = 1 << BLOCK_BITS;

    for compressor in ["null", "lz4", "lz4hc:level=4"] {
        let cfg = BlockConfig {
            block_size_bits: BLOCK_BITS,
            blockhash_window_size: 0,
            lookback_blocks: 1,
        };
        let mut mem = MemFs::new();
        mem.add_dir("");
        mem.add_file_data("random", prng_bytes(42, FILE_SIZE));
        mem.add_file_data("test", loremipsum(FILE_SIZE));

        let prog = Progress::default();
        let img = build_image(&mem, compressor, &cfg, &base_options(), &prog, None, None);

        // Inspect the block section compression tags.
        let rdr = SectionReader::new(img.clone());
        let mut algos = std::collections::HashSet::new();
        for info in rdr.scan_sections(img.len() as u64).unwrap() {
            if info.section_type == SectionType::BLOCK {
                algos.insert(rdr.read_header_at(info.offset).unwrap().compress_algo);
            }
        }
        if compressor == "null" {
            assert_eq!(algos.len(), 1);
        } else {
            assert_eq!(algos.len(), 2, "compressor {compressor}: {algos:?}");
        }
        assert!(algos.contains(&CompressAlgo::NONE));

        let fs = Filesystem::new_with_options(img, &reader_options()).unwrap();
        let vfs = fs.statvfs();
        assert_eq!(vfs.f_files, 3);
        assert_eq!(vfs.f_blocks, 2 * FILE_SIZE as u64);

        for (name, content) in [
            ("random", prng_bytes(42, FILE_SIZE)),
            ("test", loremipsum(FILE_SIZE)),
        ] {
            let fh = fs.open(fs.find(name).unwrap()).unwrap();
            let mut buf = vec![0u8; FILE_SIZE];
            assert_eq!(fs.read(&fh, &mut buf, 0).unwrap(), FILE_SIZE);
            assert_eq!(buf, content, "{name}");
        }
    }
}

/// Decompression failures surface as read errors and do not wedge the
/// cache: corrupting a block payload breaks reads of that block only.
#[cfg(feature = "zstd")]
#[test]
fn corrupted_block_fails_cleanly() {
    let cfg = BlockConfig {
        block_size_bits: 12,
        blockhash_window_size: 0,
        lookback_blocks: 1,
    };
    let mut mem = MemFs::new();
    mem.add_dir("");
    mem.add_file_data("a", loremipsum(4096));

    let prog = Progress::default();
    let mut img = build_image(&mem, "zstd:level=3", &cfg, &base_options(), &prog, None, None);

    // Flip a byte in the first block payload (just past its header).
    let rdr = SectionReader::new(img.clone());
    let sections = rdr.scan_sections(img.len() as u64).unwrap();
    let block = sections
        .iter()
        .find(|s| s.section_type == SectionType::BLOCK)
        .unwrap();
    let payload_at = block.offset as usize + dwarfs::section::HEADER_SIZE as usize;
    img[payload_at] ^= 0xFF;

    let fs = Filesystem::new_with_options(img, &reader_options()).unwrap();
    let fh = fs.open(fs.find("a").unwrap()).unwrap();
    let mut buf = vec![0u8; 4096];
    fs.read(&fh, &mut buf, 0).unwrap_err();
    // And again: the failure must not be cached.
    fs.read(&fh, &mut buf, 0).unwrap_err();
}
