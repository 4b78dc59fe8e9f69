//! The segmenter: slices an ordered stream of file contents into a shared
//! block stream, reusing byte ranges that repeat across (and within) files.
//!
//! A cyclic-polynomial rolling hash fingerprints every window of the input;
//! an index of window fingerprints over recent blocks supplies match
//! candidates, which are verified bytewise and extended greedily in both
//! directions. Matched ranges become chunks pointing at previously stored
//! bytes; everything else is appended to the current block as literals.
//!
//! The index is shared mutable state, so one segmenter instance processes
//! contents strictly sequentially; parallelism lives in the compression
//! stage behind the [`BlockSink`].
use std::collections::HashMap;

use dwarfs::metadata::Chunk;

use crate::error::Result;
use crate::options::BlockConfig;
use crate::progress::Progress;

/// The rolling hash table, pseudo-random but fixed: images must not depend
/// on process state.
static BYTE_TABLE: [u32; 256] = byte_table();

const fn byte_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    let mut i = 0;
    while i < 256 {
        // splitmix64
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        table[i] = (z >> 32) as u32;
        i += 1;
    }
    table
}

/// A cyclic-polynomial (buzhash) rolling hash over a fixed window.
///
/// Updates are O(1) per byte. Collisions are tolerated: every candidate
/// match is verified bytewise before use.
#[derive(Debug, Clone)]
pub struct RollingHash {
    hash: u32,
    /// Rotation applied to the dropped byte's table value: window size
    /// modulo the hash width.
    drop_rot: u32,
}

impl RollingHash {
    pub fn new(window_size: usize) -> Self {
        Self {
            hash: 0,
            drop_rot: (window_size % 32) as u32,
        }
    }

    pub fn reset(&mut self) {
        self.hash = 0;
    }

    /// Grow the window by one byte; used to prime a fresh window.
    pub fn feed(&mut self, add: u8) {
        self.hash = self.hash.rotate_left(1) ^ BYTE_TABLE[add as usize];
    }

    /// Slide the full window by one byte and return the new fingerprint.
    pub fn update(&mut self, add: u8, drop: u8) -> u32 {
        self.hash = self.hash.rotate_left(1)
            ^ BYTE_TABLE[drop as usize].rotate_left(self.drop_rot)
            ^ BYTE_TABLE[add as usize];
        self.hash
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

/// Consumer of finished blocks, usually the compressing image writer.
pub trait BlockSink {
    fn push_block(&mut self, data: Vec<u8>) -> Result<()>;
}

impl BlockSink for Vec<Vec<u8>> {
    fn push_block(&mut self, data: Vec<u8>) -> Result<()> {
        self.push(data);
        Ok(())
    }
}

/// A block still available for match candidates: the growing current block,
/// or a finished one within the lookback window.
#[derive(Debug)]
struct ActiveBlock {
    idx: u32,
    data: Vec<u8>,
}

pub struct Segmenter<'a> {
    window_size: usize,
    block_size: usize,
    lookback: u32,

    sink: &'a mut dyn BlockSink,
    prog: &'a Progress,

    /// window fingerprint -> positions (block index, offset) of literals.
    index: HashMap<u32, Vec<(u32, u32)>>,
    /// Searchable blocks, the current one last.
    active: Vec<ActiveBlock>,
    next_block_idx: u32,

    /// Start offset of the pending literal run in the current block.
    lit_start: Option<u32>,
    chunks: Vec<Chunk>,
}

impl std::fmt::Debug for Segmenter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segmenter")
            .field("window_size", &self.window_size)
            .field("block_size", &self.block_size)
            .field("next_block_idx", &self.next_block_idx)
            .field("index_buckets", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl<'a> Segmenter<'a> {
    pub fn new(cfg: &BlockConfig, sink: &'a mut dyn BlockSink, prog: &'a Progress) -> Self {
        Self {
            window_size: cfg.blockhash_window_size,
            block_size: cfg.block_size(),
            lookback: cfg.lookback_blocks,
            sink,
            prog,
            index: HashMap::new(),
            active: vec![ActiveBlock { idx: 0, data: Vec::new() }],
            next_block_idx: 1,
            lit_start: None,
            chunks: Vec::new(),
        }
    }

    /// Segment one content and return its chunk list. The concatenation of
    /// the returned chunks reproduces `bytes` exactly.
    pub fn add_content(&mut self, bytes: &[u8]) -> Result<Vec<Chunk>> {
        debug_assert!(self.lit_start.is_none() && self.chunks.is_empty());

        let w = self.window_size;
        if w == 0 || bytes.len() < w {
            self.append_run(bytes)?;
        } else {
            self.scan(bytes)?;
        }

        self.close_literal();
        self.prog.chunk_count.add(self.chunks.len() as u64);
        Ok(std::mem::take(&mut self.chunks))
    }

    /// Flush the final partial block. Must be called exactly once, after
    /// the last content.
    pub fn finish(mut self) -> Result<()> {
        debug_assert!(self.lit_start.is_none());
        let current = self.active.last_mut().expect("current block exists");
        if !current.data.is_empty() {
            let data = std::mem::take(&mut current.data);
            self.prog.block_count.inc();
            self.sink.push_block(data)?;
        }
        Ok(())
    }

    fn scan(&mut self, bytes: &[u8]) -> Result<()> {
        let w = self.window_size;
        let mut rh = RollingHash::new(w);
        for &b in &bytes[..w] {
            rh.feed(b);
        }

        let mut p = 0usize;
        loop {
            if let Some(m) = self.find_match(bytes, p, rh.hash()) {
                self.emit_match(m);
                p += m.fwd_len;
                if p + w > bytes.len() {
                    self.append_run(&bytes[p..])?;
                    return Ok(());
                }
                rh.reset();
                for &b in &bytes[p..p + w] {
                    rh.feed(b);
                }
                continue;
            }

            let pos = self.append_literal(bytes[p])?;
            self.index.entry(rh.hash()).or_default().push(pos);

            if p + w + 1 > bytes.len() {
                // The window cannot slide further; the tail has no
                // fingerprints and goes out as literals.
                self.append_run(&bytes[p + 1..])?;
                return Ok(());
            }
            rh.update(bytes[p + w], bytes[p]);
            p += 1;
        }
    }

    /// Probe the index at `hash` for the longest verified match of
    /// `bytes[p..]`, extended forward and backward.
    fn find_match(&self, bytes: &[u8], p: usize, hash: u32) -> Option<Match> {
        let w = self.window_size;
        let candidates = self.index.get(&hash)?;
        let back_limit = self.pending_literal_len();

        let mut best: Option<Match> = None;
        for &(block_idx, off) in candidates {
            let Some(block) = self.active_block(block_idx) else {
                // Evicted from the lookback window; pruned lazily.
                continue;
            };
            let off = off as usize;
            let avail = block.data.len() - off;
            if avail < w || block.data[off..off + w] != bytes[p..p + w] {
                continue;
            }

            let max_fwd = avail.min(bytes.len() - p);
            let mut fwd_len = w;
            while fwd_len < max_fwd && block.data[off + fwd_len] == bytes[p + fwd_len] {
                fwd_len += 1;
            }

            let max_back = off.min(back_limit);
            let mut back = 0usize;
            while back < max_back && block.data[off - back - 1] == bytes[p - back - 1] {
                back += 1;
            }

            if best.as_ref().is_none_or(|b| fwd_len + back > b.fwd_len + b.back) {
                best = Some(Match { block_idx, off, fwd_len, back });
            }
        }
        best
    }

    /// Close the pending literal (shrunk by the backward extension) and
    /// emit the match chunk.
    fn emit_match(&mut self, m: Match) {
        if m.back > 0 {
            // The backward-extended bytes were already appended as
            // literals; they stay in the block but the chunk now references
            // the match instead.
            let end = {
                let current = self.active.last().expect("current block exists");
                let lit_start = self
                    .lit_start
                    .expect("backward extension implies a pending literal");
                debug_assert!(m.back <= current.data.len() - lit_start as usize);
                current.data.len() - m.back
            };
            self.prog.filesystem_size.sub(m.back as u64);
            self.close_literal_until(end);
        } else {
            self.close_literal();
        }

        let total = (m.back + m.fwd_len) as u32;
        self.chunks.push(Chunk {
            block: m.block_idx,
            offset: (m.off - m.back) as u32,
            size: total,
        });
        self.prog.saved_by_segmentation.add(total.into());
    }

    fn pending_literal_len(&self) -> usize {
        match self.lit_start {
            Some(start) => {
                let current = self.active.last().expect("current block exists");
                current.data.len() - start as usize
            }
            None => 0,
        }
    }

    fn active_block(&self, block_idx: u32) -> Option<&ActiveBlock> {
        let first = self.active.first()?.idx;
        self.active.get(block_idx.checked_sub(first)? as usize)
    }

    /// Append one literal byte, splitting blocks as they fill, and return
    /// the position it landed at.
    fn append_literal(&mut self, byte: u8) -> Result<(u32, u32)> {
        if self.active.last().expect("current block exists").data.len() == self.block_size {
            self.rotate_block()?;
        }
        let current = self.active.last_mut().expect("current block exists");
        let off = current.data.len() as u32;
        if self.lit_start.is_none() {
            self.lit_start = Some(off);
        }
        current.data.push(byte);
        self.prog.filesystem_size.inc();
        Ok((current.idx, off))
    }

    /// Append a run of literal bytes without fingerprinting them.
    fn append_run(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            if self.active.last().expect("current block exists").data.len() == self.block_size {
                self.rotate_block()?;
            }
            let current = self.active.last_mut().expect("current block exists");
            let room = self.block_size - current.data.len();
            let (now, rest) = bytes.split_at(room.min(bytes.len()));
            if self.lit_start.is_none() {
                self.lit_start = Some(current.data.len() as u32);
            }
            current.data.extend_from_slice(now);
            self.prog.filesystem_size.add(now.len() as u64);
            bytes = rest;
        }
        Ok(())
    }

    /// The current block is full: close the pending literal at the block
    /// end, ship the block, open a fresh one and prune the index.
    fn rotate_block(&mut self) -> Result<()> {
        self.close_literal();

        let full = self.active.last().expect("current block exists");
        debug_assert_eq!(full.data.len(), self.block_size);
        self.prog.block_count.inc();
        self.sink.push_block(full.data.clone())?;

        self.active.push(ActiveBlock {
            idx: self.next_block_idx,
            data: Vec::with_capacity(self.block_size),
        });
        self.next_block_idx += 1;

        // Keep the current block plus `lookback` finished ones searchable.
        while self.active.len() > self.lookback as usize + 1 {
            self.active.remove(0);
        }
        let min_idx = self.active.first().expect("nonempty").idx;
        self.index.retain(|_, positions| {
            positions.retain(|&(blk, _)| blk >= min_idx);
            !positions.is_empty()
        });
        Ok(())
    }

    fn close_literal(&mut self) {
        let end = self.active.last().expect("current block exists").data.len();
        self.close_literal_until(end);
    }

    fn close_literal_until(&mut self, end: usize) {
        let Some(start) = self.lit_start.take() else {
            return;
        };
        let current = self.active.last().expect("current block exists");
        let size = end as u32 - start;
        if size > 0 {
            self.chunks.push(Chunk {
                block: current.idx,
                offset: start,
                size,
            });
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Match {
    /// Index of the block holding the match (absolute block number).
    block_idx: u32,
    /// Offset of the verified window within that block.
    off: usize,
    /// Verified length starting at `off` (window included).
    fwd_len: usize,
    /// Verified extension before `off`, into the pending literal.
    back: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_all(cfg: &BlockConfig, contents: &[&[u8]]) -> (Vec<Vec<u8>>, Vec<Vec<Chunk>>, Progress) {
        let prog = Progress::default();
        let mut blocks = Vec::new();
        let mut seg = Segmenter::new(cfg, &mut blocks, &prog);
        let chunk_lists = contents
            .iter()
            .map(|c| seg.add_content(c).unwrap())
            .collect();
        seg.finish().unwrap();
        (blocks, chunk_lists, prog)
    }

    fn reconstruct(blocks: &[Vec<u8>], chunks: &[Chunk]) -> Vec<u8> {
        let mut out = Vec::new();
        for c in chunks {
            let block = &blocks[c.block as usize];
            out.extend_from_slice(&block[c.offset as usize..(c.offset + c.size) as usize]);
        }
        out
    }

    fn check_invariants(cfg: &BlockConfig, blocks: &[Vec<u8>], chunks: &[Chunk]) {
        let block_size = cfg.block_size() as u32;
        for c in chunks {
            assert!(c.offset < block_size);
            assert!(c.offset + c.size <= block_size);
            assert!((c.block as usize) < blocks.len());
        }
    }

    #[test]
    fn rolling_hash_is_a_true_window_hash() {
        let w = 8;
        let data: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(37)).collect();

        let mut rh = RollingHash::new(w);
        for &b in &data[..w] {
            rh.feed(b);
        }
        for p in 1..data.len() - w {
            let rolled = rh.update(data[p + w - 1], data[p - 1]);
            let mut fresh = RollingHash::new(w);
            for &b in &data[p..p + w] {
                fresh.feed(b);
            }
            assert_eq!(rolled, fresh.hash(), "at position {p}");
        }
    }

    #[test]
    fn repeated_content_collapses() {
        let cfg = BlockConfig {
            block_size_bits: 16,
            blockhash_window_size: 10,
            lookback_blocks: 1,
        };
        let paragraph = b"the quick brown fox jumps over the lazy dog. ";
        let mut content = Vec::new();
        for _ in 0..1000 {
            content.extend_from_slice(paragraph);
        }

        let (blocks, chunks, prog) = segment_all(&cfg, &[&content]);
        check_invariants(&cfg, &blocks, &chunks[0]);
        assert_eq!(reconstruct(&blocks, &chunks[0]), content);
        // Nearly everything after the first paragraph must be matched.
        assert!(prog.saved_by_segmentation.get() > content.len() as u64 * 9 / 10);
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn cross_content_matches() {
        let cfg = BlockConfig {
            block_size_bits: 16,
            blockhash_window_size: 12,
            lookback_blocks: 1,
        };
        let a: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let b = a.clone();

        let (blocks, chunks, prog) = segment_all(&cfg, &[&a, &b]);
        assert_eq!(reconstruct(&blocks, &chunks[0]), a);
        assert_eq!(reconstruct(&blocks, &chunks[1]), b);
        // The second content should be (almost) entirely matched.
        assert!(prog.saved_by_segmentation.get() >= b.len() as u64 - 16);
    }

    #[test]
    fn window_zero_disables_matching() {
        let cfg = BlockConfig {
            block_size_bits: 10,
            blockhash_window_size: 0,
            lookback_blocks: 1,
        };
        let content = vec![7u8; 3000];
        let (blocks, chunks, prog) = segment_all(&cfg, &[&content]);
        check_invariants(&cfg, &blocks, &chunks[0]);
        assert_eq!(reconstruct(&blocks, &chunks[0]), content);
        assert_eq!(prog.saved_by_segmentation.get(), 0);
        // 3000 bytes of literals at 1024 per block.
        assert_eq!(chunks[0].len(), 3);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].len(), 1024);
        assert_eq!(blocks[2].len(), 3000 - 2048);
    }

    #[test]
    fn content_at_block_boundary_starts_at_offset_zero() {
        let cfg = BlockConfig {
            block_size_bits: 10,
            blockhash_window_size: 0,
            lookback_blocks: 1,
        };
        let (blocks, chunks, _) = segment_all(&cfg, &[&[0xAAu8; 1024], &[0xBBu8; 10]]);
        // Second content begins exactly at a block boundary.
        assert_eq!(chunks[1], vec![Chunk { block: 1, offset: 0, size: 10 }]);
        assert_eq!(reconstruct(&blocks, &chunks[1]), [0xBBu8; 10]);
    }

    #[test]
    fn sum_of_chunks_equals_input_size() {
        let cfg = BlockConfig {
            block_size_bits: 12,
            blockhash_window_size: 16,
            lookback_blocks: 2,
        };
        // Pseudo-random with embedded repetitions.
        let mut state = 0x1234_5678u32;
        let mut content = Vec::new();
        for i in 0..5 {
            let mut piece: Vec<u8> = (0..2048).map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            }).collect();
            if i % 2 == 1 {
                piece[..1024].copy_from_slice(&content[..1024]);
            }
            content.extend_from_slice(&piece);
        }

        let (blocks, chunks, _) = segment_all(&cfg, &[&content]);
        check_invariants(&cfg, &blocks, &chunks[0]);
        assert_eq!(
            chunks[0].iter().map(|c| u64::from(c.size)).sum::<u64>(),
            content.len() as u64,
        );
        assert_eq!(reconstruct(&blocks, &chunks[0]), content);
    }

    #[test]
    fn empty_content_has_no_chunks() {
        let cfg = BlockConfig::default();
        let (_, chunks, _) = segment_all(&cfg, &[b"", b"x"]);
        assert!(chunks[0].is_empty());
        assert_eq!(chunks[1].len(), 1);
    }

    #[test]
    fn accounting_identity_holds() {
        let cfg = BlockConfig {
            block_size_bits: 14,
            blockhash_window_size: 10,
            lookback_blocks: 1,
        };
        let a = vec![1u8; 5000];
        let b: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 253) as u8).collect();
        let (_, _, prog) = segment_all(&cfg, &[&a, &b]);
        assert_eq!(
            prog.filesystem_size.get() + prog.saved_by_segmentation.get(),
            (a.len() + b.len()) as u64,
        );
    }
}
