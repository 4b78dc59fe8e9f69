//! Global entry data: the uniquified value tables shared by all inodes.
//!
//! Names, symlink targets, owner/group ids, modes and timestamps all appear
//! in frozen metadata as small indexes into per-image tables. This module
//! gathers the values over the finished entry tree, sorts and deduplicates
//! them, and answers index queries during metadata assembly.
use crate::entry::{EntryKind, EntryTree};
use crate::fsaccess::FileStat;
use crate::options::ScannerOptions;

#[derive(Debug)]
pub struct GlobalEntryData {
    names: Vec<String>,
    symlink_targets: Vec<String>,
    uids: Vec<u32>,
    gids: Vec<u32>,
    modes: Vec<u32>,
    /// Minimum stored timestamp, in resolution units.
    timestamp_base: u64,

    time_resolution: u64,
    uid_override: Option<u32>,
    gid_override: Option<u32>,
    timestamp_override: Option<u64>,
    keep_all_times: bool,
}

impl GlobalEntryData {
    /// Collect and index all unique values over the tree.
    pub fn collect(tree: &EntryTree, options: &ScannerOptions) -> Self {
        let mut this = Self {
            names: Vec::new(),
            symlink_targets: Vec::new(),
            uids: Vec::new(),
            gids: Vec::new(),
            modes: Vec::new(),
            timestamp_base: u64::MAX,
            time_resolution: options.time_resolution_sec.max(1).into(),
            uid_override: options.uid,
            gid_override: options.gid,
            timestamp_override: options.timestamp,
            keep_all_times: options.keep_all_times,
        };

        let mut min_time = u64::MAX;
        tree.walk(|id, entry| {
            if id != tree.root() {
                this.names.push(entry.name.clone());
            }
            if entry.kind == EntryKind::Link {
                this.symlink_targets.push(entry.link_target.clone());
            }
            this.uids.push(this.uid_override.unwrap_or(entry.stat.uid));
            this.gids.push(this.gid_override.unwrap_or(entry.stat.gid));
            this.modes.push(entry.stat.mode);

            for t in this.stored_times(&entry.stat) {
                min_time = min_time.min(t);
            }
        });

        for tbl in [&mut this.names, &mut this.symlink_targets] {
            tbl.sort_unstable();
            tbl.dedup();
        }
        for tbl in [&mut this.uids, &mut this.gids, &mut this.modes] {
            tbl.sort_unstable();
            tbl.dedup();
        }
        this.timestamp_base = if min_time == u64::MAX { 0 } else { min_time };
        this
    }

    /// The timestamps an entry stores, already divided by the resolution.
    fn stored_times(&self, stat: &FileStat) -> impl Iterator<Item = u64> {
        let res = self.time_resolution;
        let over = self.timestamp_override;
        let mtime = over.unwrap_or(stat.mtime) / res;
        let rest = self
            .keep_all_times
            .then(|| [over.unwrap_or(stat.atime) / res, over.unwrap_or(stat.ctime) / res]);
        std::iter::once(mtime).chain(rest.into_iter().flatten())
    }

    pub fn name_index(&self, name: &str) -> u32 {
        lookup_str(&self.names, name)
    }

    pub fn symlink_target_index(&self, target: &str) -> u32 {
        lookup_str(&self.symlink_targets, target)
    }

    pub fn uid_index(&self, stat: &FileStat) -> u32 {
        lookup_u32(&self.uids, self.uid_override.unwrap_or(stat.uid))
    }

    pub fn gid_index(&self, stat: &FileStat) -> u32 {
        lookup_u32(&self.gids, self.gid_override.unwrap_or(stat.gid))
    }

    pub fn mode_index(&self, stat: &FileStat) -> u32 {
        lookup_u32(&self.modes, stat.mode)
    }

    /// Offsets of (atime, mtime, ctime) relative to the base. The first and
    /// last are zero when only mtime is kept.
    pub fn time_offsets(&self, stat: &FileStat) -> (u32, u32, u32) {
        let offset = |t: u64| {
            let t = self.timestamp_override.unwrap_or(t);
            (t / self.time_resolution - self.timestamp_base) as u32
        };
        let mtime = offset(stat.mtime);
        if self.keep_all_times {
            (offset(stat.atime), mtime, offset(stat.ctime))
        } else {
            (0, mtime, 0)
        }
    }

    pub fn timestamp_base(&self) -> u64 {
        self.timestamp_base
    }

    pub fn time_resolution(&self) -> u32 {
        self.time_resolution as u32
    }

    pub fn mtime_only(&self) -> bool {
        !self.keep_all_times
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn symlink_targets(&self) -> &[String] {
        &self.symlink_targets
    }

    pub fn uids(&self) -> Vec<u32> {
        self.uids.clone()
    }

    pub fn gids(&self) -> Vec<u32> {
        self.gids.clone()
    }

    pub fn modes(&self) -> Vec<u32> {
        self.modes.clone()
    }
}

fn lookup_str(tbl: &[String], value: &str) -> u32 {
    tbl.binary_search_by(|probe| probe.as_str().cmp(value))
        .expect("value was collected") as u32
}

fn lookup_u32(tbl: &[u32], value: u32) -> u32 {
    tbl.binary_search(&value).expect("value was collected") as u32
}
