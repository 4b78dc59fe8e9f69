//! The filesystem access backend.
//!
//! The scanner only talks to the source tree through [`FsAccess`], so tests
//! drive it with an in-memory tree and the real builder with [`OsAccess`].
//! Paths are `/`-separated and relative to the scan root; the empty path is
//! the root itself.
use std::io;

/// Attributes of a source entry, as returned by [`FsAccess::lstat`].
#[derive(Debug, Clone, Default)]
pub struct FileStat {
    /// Identity of the underlying inode, used for hardlink detection.
    pub ino: u64,
    /// Full mode: file type bits plus permissions.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub rdev: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Random access to the source tree.
///
/// Implementations must be consistent for the duration of one scan: the
/// same path must keep yielding the same attributes and content.
pub trait FsAccess: Sync {
    /// Attributes of the entry at `path`, without following symlinks.
    fn lstat(&self, path: &str) -> io::Result<FileStat>;

    /// Child names of the directory at `path`, without `.` and `..`.
    ///
    /// The order is the submission order of files into the scanner, so it
    /// must be deterministic for reproducible images.
    fn read_dir(&self, path: &str) -> io::Result<Vec<String>>;

    /// The whole content of the regular file at `path`.
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;

    /// The target of the symlink at `path`.
    fn read_link(&self, path: &str) -> io::Result<String>;

    /// Probe whether the file at `path` is readable.
    fn access_read(&self, path: &str) -> io::Result<()>;
}

/// [`FsAccess`] over the real filesystem, rooted at a directory.
#[derive(Debug)]
pub struct OsAccess {
    root: std::path::PathBuf,
}

impl OsAccess {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> std::path::PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

impl FsAccess for OsAccess {
    fn lstat(&self, path: &str) -> io::Result<FileStat> {
        let meta = std::fs::symlink_metadata(self.resolve(path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let cvt_time = |t: i64| u64::try_from(t).unwrap_or(0);
            Ok(FileStat {
                ino: meta.ino(),
                mode: meta.mode(),
                nlink: meta.nlink() as u32,
                uid: meta.uid(),
                gid: meta.gid(),
                size: meta.len(),
                rdev: meta.rdev(),
                atime: cvt_time(meta.atime()),
                mtime: cvt_time(meta.mtime()),
                ctime: cvt_time(meta.ctime()),
            })
        }

        #[cfg(not(unix))]
        {
            let file_type = meta.file_type();
            let mode = if file_type.is_dir() {
                S_IFDIR | 0o755
            } else if file_type.is_symlink() {
                S_IFLNK | 0o777
            } else {
                S_IFREG | 0o644
            };
            let since_epoch = |t: io::Result<std::time::SystemTime>| {
                t.ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_secs())
            };
            Ok(FileStat {
                ino: 0,
                mode,
                nlink: 1,
                uid: 0,
                gid: 0,
                size: meta.len(),
                rdev: 0,
                atime: since_epoch(meta.accessed()),
                mtime: since_epoch(meta.modified()),
                ctime: since_epoch(meta.modified()),
            })
        }
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for ent in std::fs::read_dir(self.resolve(path))? {
            let name = ent?.file_name();
            match name.into_string() {
                Ok(name) => names.push(name),
                Err(name) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("non-UTF-8 file name: {name:?}"),
                    ));
                }
            }
        }
        // Directory enumeration order is OS specific; sort for reproducible
        // images.
        names.sort_unstable();
        Ok(names)
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.resolve(path))
    }

    fn read_link(&self, path: &str) -> io::Result<String> {
        let target = std::fs::read_link(self.resolve(path))?;
        target.into_os_string().into_string().map_err(|target| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("non-UTF-8 symlink target: {target:?}"),
            )
        })
    }

    fn access_read(&self, path: &str) -> io::Result<()> {
        std::fs::File::open(self.resolve(path)).map(drop)
    }
}
