use super::*;

#[test]
fn freeze_options_only() {
    let mut meta = Metadata::default();
    let opts = meta.options.insert(FsOptions::default());
    opts.mtime_only = true;
    opts.time_resolution_sec = Some(42);

    let (schema, bytes) = meta.to_schema_and_bytes().unwrap();
    assert_eq!(
        bytes,
        [
            1, // options.is_some = true
            1, // options.inner.mtime_only = true
            1, // options.inner.time_resolution_sec.is_some = true
            42, 0, 0, 0, // options.inner.time_resolution_sec.inner = 42
        ]
    );

    let meta2 = Metadata::parse(&schema, &bytes).unwrap();
    assert_eq!(meta, meta2);
}

#[test]
fn freeze_byte_strings() {
    let meta = Metadata {
        dwarfs_version: Some("abc".into()),
        ..Default::default()
    };
    let (schema, bytes) = meta.to_schema_and_bytes().unwrap();
    assert_eq!(
        bytes,
        [
            1, // dwarfs_version.is_some
            9, 0, 0, 0, // dwarfs_version.inner.distance
            3, 0, 0, 0, // dwarfs_version.inner.count
            //// Outlined ////
            b'a', b'b', b'c',
        ]
    );
    let meta2 = Metadata::parse(&schema, &bytes).unwrap();
    assert_eq!(meta, meta2);
}

#[test]
fn freeze_collections() {
    let meta = Metadata {
        chunks: vec![
            Chunk {
                // Always zero in this test, so the field is elided.
                block: 0,
                // Sometimes zero.
                offset: 0,
                // Never zero.
                size: 42,
            },
            Chunk {
                block: 0,
                offset: 100,
                size: 42,
            },
        ],
        // All-zero elements with a non-zero length.
        symlink_table: vec![0, 0, 0],
        ..Default::default()
    };

    let (schema, bytes) = meta.to_schema_and_bytes().unwrap();
    assert_eq!(
        bytes,
        [
            12, 0, 0, 0, // chunks.distance = 12
            2, 0, 0, 0, // chunks.count = 2
            3, 0, 0, 0, // symlink_table.count = 3 (elements elided)
            //// Outlined ////
            0, 0, 0, 0, // chunks[0].offset
            42, 0, 0, 0, // chunks[0].size
            100, 0, 0, 0, // chunks[1].offset
            42, 0, 0, 0, // chunks[1].size
        ]
    );

    let meta2 = Metadata::parse(&schema, &bytes).unwrap();
    assert_eq!(meta, meta2);
}

#[test]
fn roundtrip_representative() {
    // A small but representative image: one dir, one file of two chunks,
    // one symlink, one device, packed string tables.
    let meta = Metadata {
        chunks: vec![
            Chunk { block: 0, offset: 0, size: 4096 },
            Chunk { block: 1, offset: 12, size: 34 },
        ],
        directories: vec![
            Directory { parent_entry: 0, first_entry: 1 },
            Directory { parent_entry: 0, first_entry: 4 },
        ],
        inodes: (0..4)
            .map(|i| InodeData {
                mode_index: i % 2,
                owner_index: 0,
                group_index: 0,
                atime_offset: 0,
                mtime_offset: 40 + i,
                ctime_offset: 0,
                ..Default::default()
            })
            .collect(),
        chunk_table: vec![0, 2],
        symlink_table: vec![0],
        uids: vec![1000],
        gids: vec![100],
        modes: vec![0o40755, 0o100644],
        timestamp_base: 123_456,
        block_size: 1 << 16,
        total_fs_size: 4130,
        devices: Some(vec![259]),
        options: Some(FsOptions {
            mtime_only: true,
            time_resolution_sec: None,
            packed_chunk_table: false,
            packed_directories: false,
            packed_shared_files_table: false,
        }),
        dir_entries: Some(vec![
            DirEntry { name_index: 0, inode_num: 0 },
            DirEntry { name_index: 0, inode_num: 1 },
            DirEntry { name_index: 1, inode_num: 2 },
            DirEntry { name_index: 2, inode_num: 3 },
        ]),
        shared_files_table: None,
        total_hardlink_size: Some(0),
        dwarfs_version: Some("dwarfs-mk test".into()),
        create_timestamp: Some(1_700_000_000),
        compact_names: Some(StringTable {
            buffer: "diratargetdev".into(),
            symtab: None,
            index: vec![3, 1, 6, 3],
            packed_index: true,
        }),
        compact_symlinks: None,
        ..Default::default()
    };

    let (schema, bytes) = meta.to_schema_and_bytes().unwrap();

    // The schema itself must survive its wire encoding.
    let schema2 = Schema::parse(&schema.to_bytes()).unwrap();
    assert_eq!(schema, schema2);

    let meta2 = Metadata::parse(&schema2, &bytes).unwrap();
    assert_eq!(meta, meta2);
}

#[test]
fn thaw_rejects_truncated() {
    let meta = Metadata {
        names: vec!["hello".into(), "world".into()],
        block_size: 4096,
        ..Default::default()
    };
    let (schema, bytes) = meta.to_schema_and_bytes().unwrap();
    assert_eq!(Metadata::parse(&schema, &bytes).unwrap(), meta);

    // Any truncation must be detected, not read out of bounds.
    for cut in 0..bytes.len() {
        assert!(Metadata::parse(&schema, &bytes[..cut]).is_err(), "cut={cut}");
    }
}

#[test]
fn legacy_v2_2_fields_survive() {
    let meta = Metadata {
        inodes: vec![InodeData {
            mode_index: 0,
            name_index_v2_2: 7,
            inode_v2_2: 3,
            ..Default::default()
        }],
        entry_table_v2_2: vec![0, 2, 1],
        modes: vec![0o100644],
        block_size: 4096,
        ..Default::default()
    };
    let (schema, bytes) = meta.to_schema_and_bytes().unwrap();
    let meta2 = Metadata::parse(&schema, &bytes).unwrap();
    assert_eq!(meta2.entry_table_v2_2, vec![0, 2, 1]);
    assert_eq!(meta2.inodes[0].name_index_v2_2, 7);
    assert_eq!(meta2.inodes[0].inode_v2_2, 3);
}
