//! Shared test fixtures: an in-memory filesystem backend and deterministic
//! content generators.
#![allow(dead_code)]
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::Mutex;

use dwarfs_mk::fsaccess::{
    FileStat, FsAccess, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFREG,
};

const LOREM: &[u8] = b"Lorem ipsum dolor sit amet, consectetur adipiscing \
elit, sed do eiusmod tempor incididunt ut labore et dolore magna aliqua. Ut \
enim ad minim veniam, quis nostrud exercitation ullamco laboris nisi ut \
aliquip ex ea commodo consequat. Duis aute irure dolor in reprehenderit in \
voluptate velit esse cillum dolore eu fugiat nulla pariatur. Excepteur sint \
occaecat cupidatat non proident, sunt in culpa qui officia deserunt mollit \
anim id est laborum. ";

/// Deterministic, highly repetitive filler text of exactly `size` bytes.
pub fn loremipsum(size: usize) -> Vec<u8> {
    LOREM.iter().copied().cycle().take(size).collect()
}

/// Build a complete image from a mock tree into memory.
pub fn build_image(
    mem: &MemFs,
    compression: &str,
    cfg: &dwarfs_mk::BlockConfig,
    options: &dwarfs_mk::ScannerOptions,
    prog: &dwarfs_mk::Progress,
    script: Option<&dyn dwarfs_mk::Script>,
    input_list: Option<&[&str]>,
) -> Vec<u8> {
    let compression = dwarfs_mk::parse_compression(compression).unwrap();
    let mut scanner = dwarfs_mk::Scanner::new(cfg, options, mem);
    if let Some(script) = script {
        scanner = scanner.with_script(script);
    }
    scanner
        .scan(Vec::new(), compression, prog, input_list)
        .unwrap()
}

/// Deterministic pseudo-random bytes; essentially incompressible.
pub fn prng_bytes(seed: u64, size: usize) -> Vec<u8> {
    let mut state = seed | 1;
    (0..size)
        .map(|_| {
            // xorshift64*
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            (state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 56) as u8
        })
        .collect()
}

#[derive(Debug, Clone)]
pub enum Content {
    None,
    Lorem,
    Bytes(Vec<u8>),
    Link(String),
}

#[derive(Debug, Clone)]
struct MemEntry {
    stat: FileStat,
    content: Content,
}

/// An in-memory [`FsAccess`] tree. Paths are relative, the empty path is
/// the root.
#[derive(Debug, Default)]
pub struct MemFs {
    entries: BTreeMap<String, MemEntry>,
    access_fail: HashSet<String>,
    next_ino: Mutex<u64>,
}

#[allow(clippy::too_many_arguments)]
pub fn stat(
    ino: u64,
    mode: u32,
    nlink: u32,
    uid: u32,
    gid: u32,
    size: u64,
    rdev: u64,
    times: (u64, u64, u64),
) -> FileStat {
    FileStat {
        ino,
        mode,
        nlink,
        uid,
        gid,
        size,
        rdev,
        atime: times.0,
        mtime: times.1,
        ctime: times.2,
    }
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_ino(&self) -> u64 {
        let mut next = self.next_ino.lock().unwrap();
        *next += 1;
        *next + 1000
    }

    pub fn add(&mut self, path: &str, stat: FileStat, content: Content) {
        self.entries.insert(path.to_owned(), MemEntry { stat, content });
    }

    pub fn add_dir(&mut self, path: &str) {
        let st = stat(self.alloc_ino(), S_IFDIR | 0o777, 1, 1000, 100, 0, 0, (1, 2, 3));
        self.add(path, st, Content::None);
    }

    pub fn add_dir_with(&mut self, path: &str, stat: FileStat) {
        self.add(path, stat, Content::None);
    }

    /// A regular file filled with `size` bytes of lorem ipsum.
    pub fn add_file(&mut self, path: &str, size: u64) {
        let st = stat(self.alloc_ino(), S_IFREG | 0o644, 1, 1000, 100, size, 0, (11, 12, 13));
        self.add(path, st, Content::Lorem);
    }

    pub fn add_file_with(&mut self, path: &str, stat: FileStat) {
        self.add(path, stat, Content::Lorem);
    }

    pub fn add_file_data(&mut self, path: &str, data: Vec<u8>) {
        let st = stat(
            self.alloc_ino(),
            S_IFREG | 0o644,
            1,
            1000,
            100,
            data.len() as u64,
            0,
            (11, 12, 13),
        );
        self.add(path, st, Content::Bytes(data));
    }

    pub fn add_link_with(&mut self, path: &str, stat: FileStat, target: &str) {
        self.add(path, stat, Content::Link(target.to_owned()));
    }

    /// Make `access_read` fail for this path.
    pub fn set_access_fail(&mut self, path: &str) {
        self.access_fail.insert(path.to_owned());
    }

    /// The number of entries, root included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn stat_of(&self, path: &str) -> &FileStat {
        &self.entries[path].stat
    }

    fn lookup(&self, path: &str) -> io::Result<&MemEntry> {
        self.entries
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no entry: {path:?}")))
    }

    /// The canonical S2 test tree: two directories, eight regular files
    /// (one a hardlink, one pair of duplicates, three empties), two
    /// symlinks, two character devices and a fifo.
    pub fn create_test_instance() -> Self {
        let mut mem = Self::new();
        mem.add_dir_with("", stat(1, S_IFDIR | 0o777, 1, 1000, 100, 0, 0, (1, 2, 3)));
        mem.add_file_with(
            "test.pl",
            stat(3, S_IFREG | 0o644, 1, 1000, 100, 0, 0, (1001, 1002, 1003)),
        );
        mem.add_link_with(
            "somelink",
            stat(4, S_IFLNK | 0o777, 1, 1000, 100, 16, 0, (2001, 2002, 2003)),
            "somedir/ipsum.py",
        );
        mem.add_dir_with(
            "somedir",
            stat(5, S_IFDIR | 0o777, 1, 1000, 100, 0, 0, (3001, 3002, 3003)),
        );
        mem.add_file_with(
            "foo.pl",
            stat(6, S_IFREG | 0o600, 2, 1337, 0, 23456, 0, (4001, 4002, 4003)),
        );
        mem.add_file_with(
            "bar.pl",
            stat(6, S_IFREG | 0o600, 2, 1337, 0, 23456, 0, (4001, 4002, 4003)),
        );
        mem.add_file_with(
            "baz.pl",
            stat(16, S_IFREG | 0o600, 1, 1337, 0, 23456, 0, (8001, 8002, 8003)),
        );
        mem.add_file_with(
            "ipsum.txt",
            stat(7, S_IFREG | 0o644, 1, 1000, 100, 2_000_000, 0, (5001, 5002, 5003)),
        );
        mem.add_file_with(
            "empty",
            stat(210, S_IFREG | 0o644, 1, 1337, 0, 0, 0, (8201, 8202, 8203)),
        );
        mem.add_file_with(
            "somedir/ipsum.py",
            stat(9, S_IFREG | 0o644, 1, 1000, 100, 10000, 0, (6001, 6002, 6003)),
        );
        mem.add_link_with(
            "somedir/bad",
            stat(10, S_IFLNK | 0o777, 1, 1000, 100, 6, 0, (7001, 7002, 7003)),
            "../foo",
        );
        mem.add(
            "somedir/pipe",
            stat(12, S_IFIFO | 0o644, 1, 1000, 100, 0, 0, (8001, 8002, 8003)),
            Content::None,
        );
        mem.add(
            "somedir/null",
            stat(13, S_IFCHR | 0o666, 1, 0, 0, 0, 259, (9001, 9002, 9003)),
            Content::None,
        );
        mem.add(
            "somedir/zero",
            stat(
                14,
                S_IFCHR | 0o666,
                1,
                0,
                0,
                0,
                261,
                (4_000_010_001, 4_000_020_002, 4_000_030_003),
            ),
            Content::None,
        );
        mem.add_file_with(
            "somedir/empty",
            stat(212, S_IFREG | 0o644, 1, 0, 0, 0, 0, (8101, 8102, 8103)),
        );
        mem
    }
}

impl FsAccess for MemFs {
    fn lstat(&self, path: &str) -> io::Result<FileStat> {
        Ok(self.lookup(path)?.stat.clone())
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<String>> {
        self.lookup(path)?;
        let names = self
            .entries
            .keys()
            .filter_map(|k| {
                let rest = if path.is_empty() {
                    k.as_str()
                } else {
                    k.strip_prefix(path)?.strip_prefix('/')?
                };
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_owned())
            })
            .collect();
        Ok(names)
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let entry = self.lookup(path)?;
        match &entry.content {
            Content::Lorem => Ok(loremipsum(entry.stat.size as usize)),
            Content::Bytes(data) => Ok(data.clone()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a regular file: {path:?}"),
            )),
        }
    }

    fn read_link(&self, path: &str) -> io::Result<String> {
        match &self.lookup(path)?.content {
            Content::Link(target) => Ok(target.clone()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a symlink: {path:?}"),
            )),
        }
    }

    fn access_read(&self, path: &str) -> io::Result<()> {
        if self.access_fail.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("access denied: {path:?}"),
            ));
        }
        self.lookup(path).map(drop)
    }
}
