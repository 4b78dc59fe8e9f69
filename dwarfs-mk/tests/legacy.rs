//! Reading legacy (v2.2) images, which have no `dir_entries` table: the
//! inode records double as directory entries, and `entry_table_v2_2`
//! translates inode numbers back to record positions.
//!
//! The builder never writes this layout, so the image is assembled by hand
//! section by section.
use dwarfs::fs::{Filesystem, FilesystemOptions};
use dwarfs::metadata::{Chunk, Directory, InodeData, Metadata};
use dwarfs::section::{CompressAlgo, Header, SectionType};
use dwarfs::zerocopy::IntoBytes;

fn push_section(img: &mut Vec<u8>, number: u32, ty: SectionType, payload: &[u8]) {
    let header = Header::new_sealed(number, ty, CompressAlgo::NONE, payload);
    img.extend_from_slice(header.as_bytes());
    img.extend_from_slice(payload);
}

fn inode(mode_index: u32, name_index: u32, ino: u32) -> InodeData {
    InodeData {
        mode_index,
        owner_index: 0,
        group_index: 0,
        atime_offset: 0,
        mtime_offset: 5,
        ctime_offset: 0,
        name_index_v2_2: name_index,
        inode_v2_2: ino,
    }
}

fn legacy_image() -> Vec<u8> {
    const CONTENT: &[u8] = b"hello world";

    let meta = Metadata {
        chunks: vec![Chunk { block: 0, offset: 0, size: CONTENT.len() as u32 }],
        directories: vec![
            Directory { parent_entry: 0, first_entry: 1 },
            Directory { parent_entry: 0, first_entry: 3 },
        ],
        // Record positions are the entry indexes: the root first, then the
        // root's children in name order.
        inodes: vec![
            inode(0, 0, 0), // root directory
            inode(2, 0, 2), // "a.txt", regular file inode 2
            inode(1, 1, 1), // "b", symlink inode 1
        ],
        chunk_table: vec![0, 1],
        // inode number -> record position.
        entry_table_v2_2: vec![0, 2, 1],
        symlink_table: vec![0],
        uids: vec![1000],
        gids: vec![100],
        modes: vec![0o040755, 0o120777, 0o100644],
        names: vec!["a.txt".into(), "b".into()],
        symlinks: vec!["a.txt".into()],
        timestamp_base: 1000,
        block_size: 1024,
        total_fs_size: CONTENT.len() as u64,
        ..Default::default()
    };

    let (schema, frozen) = meta.to_schema_and_bytes().unwrap();
    let mut img = Vec::new();
    push_section(&mut img, 0, SectionType::BLOCK, CONTENT);
    push_section(&mut img, 1, SectionType::METADATA_V2_SCHEMA, &schema.to_bytes());
    push_section(&mut img, 2, SectionType::METADATA_V2, &frozen);
    img
}

#[test]
fn v2_2_lookups_resolve_through_the_entry_table() {
    let mut opts = FilesystemOptions::default();
    opts.block_cache.max_bytes = 1 << 20;
    opts.metadata.check_consistency = true;

    let fs = Filesystem::new_with_options(legacy_image(), &opts).unwrap();

    let vfs = fs.statvfs();
    assert_eq!(vfs.f_files, 3);
    assert_eq!(vfs.f_blocks, 11);

    // Path lookup binary-searches the legacy record range.
    let file = fs.find("/a.txt").unwrap();
    assert_eq!(file, 2);
    let st = fs.getattr(file).unwrap();
    assert!(st.is_file());
    assert_eq!(st.st_size, 11);
    assert_eq!(st.st_uid, 1000);
    assert_eq!(st.st_mtime, 1005);

    let fh = fs.open(file).unwrap();
    let mut buf = vec![0u8; 11];
    assert_eq!(fs.read(&fh, &mut buf, 0).unwrap(), 11);
    assert_eq!(buf, b"hello world");

    let link = fs.find("/b").unwrap();
    assert_eq!(link, 1);
    assert!(fs.getattr(link).unwrap().is_symlink());
    assert_eq!(fs.readlink(link).unwrap(), "a.txt");

    // Directory iteration synthesizes dot entries over the record range.
    let dir = fs.opendir(fs.root()).unwrap();
    assert_eq!(fs.dirsize(&dir), 4);
    let names: Vec<&str> = (0..4).map(|i| fs.readdir(&dir, i).unwrap().1).collect();
    assert_eq!(names, [".", "..", "a.txt", "b"]);

    let mut paths = Vec::new();
    fs.walk(|e| paths.push(e.path.to_owned()));
    assert_eq!(paths, ["", "a.txt", "b"]);
}

#[test]
fn v2_2_consistency_checks_catch_bad_entry_table() {
    // Same image, but with an entry table value pointing past the records.
    let img = {
        let mut img = legacy_image();
        // Rebuilding is simpler than patching frozen bytes.
        drop(img.drain(..));
        let meta = Metadata {
            chunks: vec![Chunk { block: 0, offset: 0, size: 1 }],
            directories: vec![
                Directory { parent_entry: 0, first_entry: 1 },
                Directory { parent_entry: 0, first_entry: 2 },
            ],
            inodes: vec![inode(0, 0, 0), inode(1, 0, 1)],
            chunk_table: vec![0, 1],
            entry_table_v2_2: vec![0, 9],
            modes: vec![0o040755, 0o100644],
            names: vec!["a".into()],
            block_size: 1024,
            ..Default::default()
        };
        let (schema, frozen) = meta.to_schema_and_bytes().unwrap();
        push_section(&mut img, 0, SectionType::BLOCK, b"x");
        push_section(&mut img, 1, SectionType::METADATA_V2_SCHEMA, &schema.to_bytes());
        push_section(&mut img, 2, SectionType::METADATA_V2, &frozen);
        img
    };

    let mut opts = FilesystemOptions::default();
    opts.metadata.check_consistency = true;
    let err = Filesystem::new_with_options(img, &opts).unwrap_err();
    assert!(err.to_string().contains("entry_table_v2_2"), "{err}");
}
