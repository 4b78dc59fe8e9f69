//! The scanner: walks the source tree, deduplicates file contents, assigns
//! inode numbers, runs ordering and segmentation, and assembles the frozen
//! metadata.
//!
//! Inode numbers are handed out partitioned by type: directories first,
//! then symlinks, regular files (distinct contents first, duplicates after),
//! devices, and finally fifos/sockets. The reader relies on exactly this
//! partition.
use std::collections::HashMap;
use std::io::Write;
use std::num::NonZero;

use crossbeam_channel as channel;
use dwarfs::metadata::{self, Metadata};
use dwarfs::section::CompressParam;
use indexmap::IndexMap;

use crate::entry::{EntryId, EntryKind, EntryTree};
use crate::error::{bad_input, ErrorInner, Result};
use crate::fsaccess::FsAccess;
use crate::global_data::GlobalEntryData;
use crate::options::{BlockConfig, FileOrderMode, HashAlgorithm, ScannerOptions};
use crate::order::{order_contents, similarity_hash, nilsimsa_hash, OrderCandidate};
use crate::progress::Progress;
use crate::segment::Segmenter;
use crate::strings::{pack, PackOptions};
use crate::writer::ImageWriter;
use crate::Script;

/// One distinct file content, identified during deduplication.
#[derive(Debug)]
struct Content {
    /// Entry of the first file found with this content.
    rep: EntryId,
    size: u64,
    similarity: u32,
    lsh: [u8; 32],
}

/// The outcome of file deduplication and file inode assignment.
#[derive(Debug)]
struct DedupResult {
    /// Distinct contents, indexed by content id (= chunk table index).
    contents: Vec<Content>,
    /// Per shared file inode, the shared group id, non-decreasing.
    shared_files_table: Vec<u32>,
    first_device_inode: u32,
}

pub struct Scanner<'a> {
    cfg: &'a BlockConfig,
    options: &'a ScannerOptions,
    fs: &'a dyn FsAccess,
    script: Option<&'a dyn Script>,
}

impl std::fmt::Debug for Scanner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("cfg", &self.cfg)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<'a> Scanner<'a> {
    pub fn new(cfg: &'a BlockConfig, options: &'a ScannerOptions, fs: &'a dyn FsAccess) -> Self {
        Self {
            cfg,
            options,
            fs,
            script: None,
        }
    }

    pub fn with_script(mut self, script: &'a dyn Script) -> Self {
        self.script = Some(script);
        self
    }

    /// Scan the source tree (or the explicit `input_list` of paths) and
    /// write a complete image to `out`.
    pub fn scan<W: Write>(
        &self,
        out: W,
        compression: CompressParam,
        prog: &Progress,
        input_list: Option<&[&str]>,
    ) -> Result<W> {
        std::thread::scope(|scope| {
            // Hash workers read and fingerprint file contents while the
            // tree walk continues on this thread.
            let threads = std::thread::available_parallelism()
                .unwrap_or(NonZero::new(1).expect("nonzero"));
            let (job_tx, job_rx) = channel::bounded::<HashJob>(threads.get() * 2);
            let (res_tx, res_rx) = channel::unbounded();
            let spec = JobSpec {
                algo: self.options.file_hash_algorithm,
                similarity: self.options.file_order == FileOrderMode::Similarity,
                nilsimsa: self.options.file_order == FileOrderMode::Nilsimsa,
            };
            for _ in 0..threads.get() {
                let (job_rx, res_tx) = (job_rx.clone(), res_tx.clone());
                let fs = self.fs;
                scope.spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        // A send failure means the build is being torn down.
                        if res_tx.send(job.run(fs, spec)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop((job_rx, res_tx));

            let files = FileScanner {
                spec,
                job_tx: Some(job_tx),
                res_rx,
                records: Vec::new(),
                by_source_ino: HashMap::new(),
            };
            self.scan_inner(out, compression, prog, input_list, files)
        })
    }

    fn scan_inner<W: Write>(
        &self,
        out: W,
        compression: CompressParam,
        prog: &Progress,
        input_list: Option<&[&str]>,
        mut files: FileScanner,
    ) -> Result<W> {
        log::info!("scanning source tree");
        let mut root_stat = self.fs.lstat("")?;
        if EntryKind::of_mode(root_stat.mode) != Some(EntryKind::Dir) {
            bail!(bad_input("the scan root must be a directory"));
        }
        if let Some(script) = self.script.filter(|s| s.has_transform()) {
            script.transform("", &mut root_stat).map_err(ErrorInner::Script)?;
        }
        let mut tree = EntryTree::new(root_stat);
        prog.dirs_found.inc();

        match input_list {
            None => self.scan_tree(&mut tree, &mut files, prog)?,
            Some(list) => self.scan_list(&mut tree, &mut files, prog, list)?,
        }

        if self.options.remove_empty_dirs {
            log::info!("removing empty directories");
            tree.remove_empty_dirs(prog);
        }

        // Sorted exactly once: lookups at read time binary-search on names.
        tree.sort_children();

        log::info!("assigning directory and link inodes");
        let mut dirs = Vec::new();
        let mut links = Vec::new();
        let mut devices = Vec::new();
        let mut others = Vec::new();
        tree.walk(|id, entry| match entry.kind {
            EntryKind::Dir => dirs.push(id),
            EntryKind::Link => links.push(id),
            EntryKind::Device => devices.push(id),
            EntryKind::Other => others.push(id),
            EntryKind::File => {}
        });

        let mut next_ino = 0u32;
        for group in [&dirs, &links] {
            for &id in group.iter() {
                tree.get_mut(id).inode = Some(next_ino);
                next_ino += 1;
            }
        }
        let first_file_inode = next_ino;

        log::info!("waiting for background hashing, finalizing file inodes");
        let dedup = files.finalize(&mut tree, first_file_inode, prog)?;
        next_ino = dedup.first_device_inode;

        log::info!(
            "saved {} / {} bytes in {} duplicate files",
            prog.saved_by_deduplication.get(),
            prog.original_size.get(),
            prog.duplicate_files.get(),
        );

        let mut device_ids = Vec::with_capacity(devices.len());
        for &id in &devices {
            tree.get_mut(id).inode = Some(next_ino);
            next_ino += 1;
            device_ids.push(tree.get(id).stat.rdev);
        }
        for &id in &others {
            tree.get_mut(id).inode = Some(next_ino);
            next_ino += 1;
        }
        let inode_count = next_ino;

        // Hardlinks share the inode of their first occurrence.
        for id in (0..tree.len() as u32).map(EntryId) {
            if let Some(target) = tree.get(id).hardlink_of {
                tree.get_mut(id).inode = tree.get(target).inode;
            }
        }

        log::info!("ordering {} contents", dedup.contents.len());
        let candidates = dedup
            .contents
            .iter()
            .enumerate()
            .map(|(cid, c)| OrderCandidate {
                content_id: cid as u32,
                path: tree.get(c.rep).path.clone(),
                size: c.size,
                similarity: c.similarity,
                lsh: c.lsh,
            })
            .collect();
        let order = order_contents(self.options.file_order, self.script, candidates)?;

        log::info!("segmenting and writing blocks");
        let mut writer = ImageWriter::new(out, compression, prog)?;
        let mut chunk_lists: Vec<Vec<metadata::Chunk>> = Vec::new();
        chunk_lists.resize_with(dedup.contents.len(), Vec::new);
        {
            let mut segmenter = Segmenter::new(self.cfg, &mut writer, prog);
            for cid in order {
                let content = &dedup.contents[cid as usize];
                let data = if content.size == 0 {
                    Vec::new()
                } else {
                    let path = &tree.get(content.rep).path;
                    match self.fs.read_file(path) {
                        Ok(data) => data,
                        Err(err) => {
                            log::error!("cannot read {path:?}: {err}, storing empty");
                            prog.errors.inc();
                            Vec::new()
                        }
                    }
                };
                chunk_lists[cid as usize] = segmenter.add_content(&data)?;
                prog.inodes_written.inc();
            }
            segmenter.finish()?;
        }

        log::info!("building metadata");
        let meta = self.build_metadata(
            &tree,
            &dirs,
            &links,
            device_ids,
            inode_count,
            &dedup,
            chunk_lists,
            prog,
        );
        writer.write_metadata(&meta)?;
        let out = writer.finish()?;

        log::info!("{}", prog.summary());
        Ok(out)
    }

    //// Tree discovery ////

    fn scan_tree(
        &self,
        tree: &mut EntryTree,
        files: &mut FileScanner,
        prog: &Progress,
    ) -> Result<()> {
        let mut queue = std::collections::VecDeque::from([tree.root()]);
        while let Some(dir_id) = queue.pop_front() {
            let dir_path = tree.get(dir_id).path.clone();
            let names = match self.fs.read_dir(&dir_path) {
                Ok(names) => names,
                Err(err) => {
                    log::error!("cannot open directory {dir_path:?}: {err}");
                    prog.errors.inc();
                    continue;
                }
            };

            let mut subdirs = Vec::new();
            for name in names {
                if name == "." || name == ".." {
                    continue;
                }
                if let Some(id) = self.add_entry(tree, files, prog, dir_id, &name)? {
                    if tree.get(id).kind == EntryKind::Dir {
                        subdirs.push(id);
                    }
                }
            }
            // Descend before continuing with siblings.
            for id in subdirs.into_iter().rev() {
                queue.push_front(id);
            }
            prog.dirs_scanned.inc();
        }
        Ok(())
    }

    fn scan_list(
        &self,
        tree: &mut EntryTree,
        files: &mut FileScanner,
        prog: &Progress,
        list: &[&str],
    ) -> Result<()> {
        if self.script.is_some_and(|s| s.has_filter()) {
            bail!(ErrorInner::IncompatibleOptions(
                "filters cannot be used with an input list",
            ));
        }

        let mut dir_cache = HashMap::<String, EntryId>::new();
        dir_cache.insert(String::new(), tree.root());

        for path in list {
            let path = path.trim_matches('/');
            if path.is_empty() {
                continue;
            }
            let (dir_path, name) = match path.rsplit_once('/') {
                Some((dir, name)) => (dir, name),
                None => ("", path),
            };
            let parent = self.ensure_dirs(tree, files, prog, &mut dir_cache, dir_path)?;
            if tree.find_child(parent, name).is_some() {
                continue;
            }
            if self.add_entry(tree, files, prog, parent, name)?.is_none() {
                bail!(bad_input(format_args!("invalid path {path:?}")));
            }
        }
        Ok(())
    }

    /// Resolve (creating as needed) the directory entry for `dir_path`.
    fn ensure_dirs(
        &self,
        tree: &mut EntryTree,
        files: &mut FileScanner,
        prog: &Progress,
        cache: &mut HashMap<String, EntryId>,
        dir_path: &str,
    ) -> Result<EntryId> {
        if let Some(&id) = cache.get(dir_path) {
            return Ok(id);
        }
        let mut current = tree.root();
        for seg in dir_path.split('/') {
            current = match tree.find_child(current, seg) {
                Some(id) => id,
                None => {
                    let id = self
                        .add_entry(tree, files, prog, current, seg)?
                        .ok_or_else(|| bad_input(format_args!("invalid path {dir_path:?}")))?;
                    prog.dirs_scanned.inc();
                    id
                }
            };
            if tree.get(current).kind != EntryKind::Dir {
                bail!(bad_input(format_args!("invalid path {dir_path:?}")));
            }
        }
        cache.insert(dir_path.to_owned(), current);
        Ok(current)
    }

    /// Stat, filter, classify and register a single entry.
    fn add_entry(
        &self,
        tree: &mut EntryTree,
        files: &mut FileScanner,
        prog: &Progress,
        parent: EntryId,
        name: &str,
    ) -> Result<Option<EntryId>> {
        let parent_path = &tree.get(parent).path;
        let path = if parent_path.is_empty() {
            name.to_owned()
        } else {
            format!("{parent_path}/{name}")
        };

        let mut stat = match self.fs.lstat(&path) {
            Ok(stat) => stat,
            Err(err) => {
                log::error!("cannot stat {path:?}: {err}");
                prog.errors.inc();
                return Ok(None);
            }
        };
        let Some(kind) = EntryKind::of_mode(stat.mode) else {
            log::error!("unsupported entry type at {path:?}: mode {:o}", stat.mode);
            prog.errors.inc();
            return Ok(None);
        };

        if let Some(script) = self.script {
            if script.has_filter() && !script.filter(&path, &stat).map_err(ErrorInner::Script)? {
                log::debug!("excluding {path:?}");
                return Ok(None);
            } else if script.has_transform() {
                script.transform(&path, &mut stat).map_err(ErrorInner::Script)?;
            }
        }

        let mut access_failed = false;
        match kind {
            EntryKind::File => {
                if let Err(err) = self.fs.access_read(&path) {
                    log::error!("cannot access {path:?}: {err}, creating empty file");
                    prog.errors.inc();
                    access_failed = true;
                }
            }
            EntryKind::Device if !self.options.with_devices => return Ok(None),
            EntryKind::Other if !self.options.with_specials => return Ok(None),
            _ => {}
        }

        let id = tree.add(parent, name.to_owned(), kind, stat);
        match kind {
            EntryKind::Dir => {
                prog.dirs_found.inc();
            }
            EntryKind::File => {
                if access_failed {
                    tree.get_mut(id).size_override = Some(0);
                }
                prog.files_found.inc();
                files.scan(tree, id, prog);
                prog.files_scanned.inc();
            }
            EntryKind::Link => {
                prog.symlinks_found.inc();
                match self.fs.read_link(&path) {
                    Ok(target) => {
                        prog.original_size.add(target.len() as u64);
                        prog.symlink_size.add(target.len() as u64);
                        tree.get_mut(id).link_target = target;
                    }
                    Err(err) => {
                        log::error!("cannot read symlink {path:?}: {err}");
                        prog.errors.inc();
                    }
                }
                prog.symlinks_scanned.inc();
            }
            EntryKind::Device | EntryKind::Other => {
                prog.specials_found.inc();
            }
        }
        Ok(Some(id))
    }

    //// Metadata assembly ////

    #[allow(clippy::too_many_arguments)]
    fn build_metadata(
        &self,
        tree: &EntryTree,
        dirs: &[EntryId],
        links: &[EntryId],
        device_ids: Vec<u64>,
        inode_count: u32,
        dedup: &DedupResult,
        chunk_lists: Vec<Vec<metadata::Chunk>>,
        prog: &Progress,
    ) -> Metadata {
        let ge = GlobalEntryData::collect(tree, self.options);
        let opts = self.options;
        let mut meta = Metadata::default();

        //// Inodes ////

        meta.inodes = vec![metadata::InodeData::default(); inode_count as usize];
        tree.walk(|_, entry| {
            if entry.hardlink_of.is_some() {
                // Shares the record of its first occurrence.
                return;
            }
            let (atime_offset, mtime_offset, ctime_offset) = ge.time_offsets(&entry.stat);
            meta.inodes[entry.inode() as usize] = metadata::InodeData {
                mode_index: ge.mode_index(&entry.stat),
                owner_index: ge.uid_index(&entry.stat),
                group_index: ge.gid_index(&entry.stat),
                atime_offset,
                mtime_offset,
                ctime_offset,
                ..Default::default()
            };
        });

        //// Directories and entries ////

        // Entry 0 is the root's self-entry; every directory's children
        // follow as one name-sorted run, in directory inode order.
        let mut dir_entries = vec![metadata::DirEntry { name_index: 0, inode_num: 0 }];
        let mut directories = vec![metadata::Directory::default(); dirs.len() + 1];
        let mut self_entry = vec![0u32; dirs.len()];
        for (d_ino, &dir_id) in dirs.iter().enumerate() {
            directories[d_ino].first_entry = dir_entries.len() as u32;
            for &child in &tree.get(dir_id).children {
                let entry = tree.get(child);
                let ent_idx = dir_entries.len() as u32;
                if entry.kind == EntryKind::Dir {
                    // Pre-order numbering guarantees the child's slot is
                    // visited after this point.
                    self_entry[entry.inode() as usize] = ent_idx;
                }
                dir_entries.push(metadata::DirEntry {
                    name_index: ge.name_index(&entry.name),
                    inode_num: entry.inode(),
                });
            }
        }
        directories[dirs.len()].first_entry = dir_entries.len() as u32;
        // Fix up parent links now that all self entries are known.
        for (d_ino, &dir_id) in dirs.iter().enumerate() {
            let parent = tree.get(dir_id).parent;
            directories[d_ino].parent_entry = match parent {
                Some(p) => self_entry[tree.get(p).inode() as usize],
                None => 0,
            };
        }

        if opts.pack_directories {
            let mut last = 0u32;
            for d in &mut directories {
                let delta = d.first_entry - last;
                last = d.first_entry;
                d.first_entry = delta;
                d.parent_entry = 0; // recovered by traversal on load
            }
        }
        meta.directories = directories;
        meta.dir_entries = Some(dir_entries);

        //// Symlinks ////

        meta.symlink_table = links
            .iter()
            .map(|&id| ge.symlink_target_index(&tree.get(id).link_target))
            .collect();

        //// Chunks ////

        let mut chunk_table = Vec::with_capacity(chunk_lists.len() + 1);
        let mut chunks = Vec::new();
        for list in chunk_lists {
            chunk_table.push(chunks.len() as u32);
            chunks.extend(list);
        }
        chunk_table.push(chunks.len() as u32);
        if opts.pack_chunk_table {
            let mut last = 0u32;
            for c in &mut chunk_table {
                let delta = *c - last;
                last = *c;
                *c = delta;
            }
        }
        meta.chunks = chunks;
        meta.chunk_table = chunk_table;

        //// Shared files ////

        if !dedup.shared_files_table.is_empty() {
            let table = if opts.pack_shared_files_table {
                pack_shared_files(&dedup.shared_files_table)
            } else {
                dedup.shared_files_table.clone()
            };
            meta.shared_files_table = Some(table);
        }

        //// String tables ////

        if opts.plain_names_table {
            meta.names = ge.names().iter().map(|s| s.as_str().into()).collect();
        } else {
            meta.compact_names = Some(pack(
                ge.names(),
                PackOptions {
                    pack_data: opts.pack_names,
                    pack_index: opts.pack_names_index,
                    force_pack: opts.force_pack_string_tables,
                },
            ));
        }
        if opts.plain_symlinks_table {
            meta.symlinks = ge.symlink_targets().iter().map(|s| s.as_str().into()).collect();
        } else {
            meta.compact_symlinks = Some(pack(
                ge.symlink_targets(),
                PackOptions {
                    pack_data: opts.pack_symlinks,
                    pack_index: opts.pack_symlinks_index,
                    force_pack: opts.force_pack_string_tables,
                },
            ));
        }

        //// The rest ////

        meta.uids = ge.uids();
        meta.gids = ge.gids();
        meta.modes = ge.modes();
        meta.timestamp_base = ge.timestamp_base();
        meta.block_size = self.cfg.block_size() as u32;
        meta.total_fs_size = prog.original_size.get();
        meta.total_hardlink_size = Some(prog.hardlink_size.get());
        meta.options = Some(metadata::FsOptions {
            mtime_only: ge.mtime_only(),
            time_resolution_sec: (ge.time_resolution() > 1).then(|| ge.time_resolution()),
            packed_chunk_table: opts.pack_chunk_table,
            packed_directories: opts.pack_directories,
            packed_shared_files_table: opts.pack_shared_files_table,
        });
        meta.dwarfs_version = Some(
            concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).into(),
        );
        if !opts.no_create_timestamp {
            meta.create_timestamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs());
        }
        meta
    }
}

/// Run-length pack: group `i` with `n` members becomes element `i` holding
/// `n - 2`. Every group has at least two members by construction.
fn pack_shared_files(table: &[u32]) -> Vec<u32> {
    let mut packed = Vec::new();
    for &group in table {
        if group as usize == packed.len() {
            packed.push(0u32);
        } else {
            debug_assert_eq!(group as usize + 1, packed.len(), "groups are contiguous");
            *packed.last_mut().expect("nonempty") += 1;
        }
    }
    // Stored counts are biased by the minimum group size of two.
    for n in &mut packed {
        *n = n.checked_sub(1).expect("groups have two or more members");
    }
    packed
}

//// File scanning and deduplication ////

#[derive(Debug, Clone, Copy)]
struct JobSpec {
    algo: Option<HashAlgorithm>,
    similarity: bool,
    nilsimsa: bool,
}

impl JobSpec {
    fn is_active(&self) -> bool {
        self.algo.is_some() || self.similarity || self.nilsimsa
    }

    fn fingerprint(&self, data: &[u8]) -> JobOutput {
        JobOutput {
            digest: self.algo.map(|a| a.digest(data)),
            similarity: if self.similarity { similarity_hash(data) } else { 0 },
            lsh: if self.nilsimsa { nilsimsa_hash(data) } else { [0; 32] },
            read_failed: false,
        }
    }
}

struct HashJob {
    record: usize,
    path: String,
}

#[derive(Debug)]
struct JobOutput {
    digest: Option<Box<[u8]>>,
    similarity: u32,
    lsh: [u8; 32],
    read_failed: bool,
}

impl HashJob {
    fn run(self, fs: &dyn FsAccess, spec: JobSpec) -> (usize, JobOutput) {
        let out = match fs.read_file(&self.path) {
            Ok(data) => spec.fingerprint(&data),
            Err(err) => {
                log::error!("cannot read {:?}: {err}, treating as empty", self.path);
                let mut out = spec.fingerprint(b"");
                out.read_failed = true;
                out
            }
        };
        (self.record, out)
    }
}

struct FileScanner {
    spec: JobSpec,
    job_tx: Option<channel::Sender<HashJob>>,
    res_rx: channel::Receiver<(usize, JobOutput)>,
    /// Registered file entries in submission order; ties in deduplication
    /// resolve by this order regardless of hashing completion order.
    records: Vec<EntryId>,
    by_source_ino: HashMap<u64, EntryId>,
}

impl std::fmt::Debug for FileScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileScanner")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl FileScanner {
    /// Register a regular file entry: collapse hardlinks, account sizes,
    /// and dispatch content fingerprinting.
    fn scan(&mut self, tree: &mut EntryTree, id: EntryId, prog: &Progress) {
        let entry = tree.get(id);
        let (ino, nlink, size) = (entry.stat.ino, entry.stat.nlink, entry.size());
        let path = entry.path.clone();

        if nlink > 1 && ino != 0 {
            if let Some(&first) = self.by_source_ino.get(&ino) {
                prog.hardlinks.inc();
                prog.hardlink_size.add(size);
                tree.get_mut(id).hardlink_of = Some(first);
                return;
            }
            self.by_source_ino.insert(ino, id);
        }

        prog.original_size.add(size);
        let record = self.records.len();
        self.records.push(id);

        if self.spec.is_active() && size > 0 {
            self.job_tx
                .as_ref()
                .expect("scanner is not finalized")
                .send(HashJob { record, path })
                .expect("hash workers are alive");
        }
    }

    /// Wait for fingerprinting, group identical contents, and assign file
    /// inode numbers starting at `first_file_inode`.
    fn finalize(
        mut self,
        tree: &mut EntryTree,
        first_file_inode: u32,
        prog: &Progress,
    ) -> Result<DedupResult> {
        // Closing the job channel stops the workers once drained; the
        // result channel then disconnects.
        self.job_tx = None;
        let mut outputs: Vec<Option<JobOutput>> = Vec::new();
        outputs.resize_with(self.records.len(), || None);
        for (record, out) in self.res_rx.iter() {
            if out.read_failed {
                prog.errors.inc();
                tree.get_mut(self.records[record]).size_override = Some(0);
            }
            outputs[record] = Some(out);
        }

        // Group by content. Without a hash algorithm every file is its own
        // content. Insertion order of groups is submission order, which
        // makes the representative choice deterministic.
        #[derive(PartialEq, Eq, Hash)]
        enum Key {
            Digest(Box<[u8]>),
            Unique(usize),
        }
        struct Group {
            members: Vec<EntryId>,
            size: u64,
            similarity: u32,
            lsh: [u8; 32],
        }

        let empty = self.spec.fingerprint(b"");
        let mut groups = IndexMap::<Key, Group>::new();
        for (record, &entry) in self.records.iter().enumerate() {
            let size = tree.get(entry).size();
            let out = outputs[record].take().unwrap_or_else(|| JobOutput {
                digest: empty.digest.clone(),
                similarity: empty.similarity,
                lsh: empty.lsh,
                read_failed: false,
            });
            let key = match (self.spec.algo.is_some(), &out.digest) {
                (true, Some(digest)) => Key::Digest(digest.clone()),
                _ => Key::Unique(record),
            };
            let group = groups.entry(key).or_insert_with(|| Group {
                members: Vec::new(),
                size,
                similarity: out.similarity,
                lsh: out.lsh,
            });
            group.members.push(entry);
        }

        // Contents referenced exactly once get the low content ids and the
        // low file inodes; groups of duplicates follow, their members
        // mapping through the shared files table.
        let mut contents = Vec::with_capacity(groups.len());
        let mut next_ino = first_file_inode;
        for (_, group) in groups.iter().filter(|(_, g)| g.members.len() == 1) {
            contents.push(Content {
                rep: group.members[0],
                size: group.size,
                similarity: group.similarity,
                lsh: group.lsh,
            });
            tree.get_mut(group.members[0]).inode = Some(next_ino);
            next_ino += 1;
        }
        let num_unique = contents.len() as u32;

        let mut shared_files_table = Vec::new();
        for (shared_group, (_, group)) in groups
            .iter()
            .filter(|(_, g)| g.members.len() > 1)
            .enumerate()
        {
            prog.duplicate_files.add(group.members.len() as u64 - 1);
            prog.saved_by_deduplication
                .add(group.size * (group.members.len() as u64 - 1));
            contents.push(Content {
                rep: group.members[0],
                size: group.size,
                similarity: group.similarity,
                lsh: group.lsh,
            });
            for &member in &group.members {
                tree.get_mut(member).inode = Some(next_ino);
                next_ino += 1;
                shared_files_table.push(shared_group as u32);
            }
        }
        debug_assert!(shared_files_table.is_sorted());
        debug_assert_eq!(
            contents.len() as u32 - num_unique,
            shared_files_table.last().map_or(0, |&g| g + 1),
        );

        Ok(DedupResult {
            contents,
            shared_files_table,
            first_device_inode: next_ino,
        })
    }
}
