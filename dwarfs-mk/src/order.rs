//! Inode ordering: decides the sequence in which distinct file contents are
//! fed to the segmenter, and thereby the layout of the block stream.
//!
//! All modes are deterministic for fixed inputs: ties are broken by the
//! representative path, and the nearest-neighbour tour scans candidates in
//! path order.
use crate::error::{ErrorInner, Result};
use crate::options::FileOrderMode;
use crate::Script;

/// One distinct content to be ordered.
#[derive(Debug, Clone)]
pub struct OrderCandidate {
    /// The distinct-content id, indexing the chunk table.
    pub content_id: u32,
    /// Path of the first file found with this content.
    pub path: String,
    pub size: u64,
    /// 32-bit similarity hash, for [`FileOrderMode::Similarity`].
    pub similarity: u32,
    /// 256-bit locality-sensitive hash, for [`FileOrderMode::Nilsimsa`].
    pub lsh: [u8; 32],
}

/// Order contents according to `mode`, returning the content ids in the
/// order their bytes enter the segmenter.
pub fn order_contents(
    mode: FileOrderMode,
    script: Option<&dyn Script>,
    mut candidates: Vec<OrderCandidate>,
) -> Result<Vec<u32>> {
    match mode {
        FileOrderMode::None => {}
        FileOrderMode::Path => {
            candidates.sort_by(|a, b| a.path.cmp(&b.path));
        }
        FileOrderMode::Similarity => {
            candidates.sort_by(|a, b| {
                (a.similarity, &a.path).cmp(&(b.similarity, &b.path))
            });
        }
        FileOrderMode::Nilsimsa => {
            nearest_neighbour_tour(&mut candidates);
        }
        FileOrderMode::Script => {
            let script = script.ok_or(ErrorInner::IncompatibleOptions(
                "script file order requires a script",
            ))?;
            script
                .order(&mut candidates)
                .map_err(ErrorInner::Script)?;
        }
    }
    Ok(candidates.into_iter().map(|c| c.content_id).collect())
}

/// Greedy tour: start at the lexicographically first path, then repeatedly
/// append the unvisited candidate closest (by hash bit distance) to the
/// last one, ties resolved by path.
fn nearest_neighbour_tour(candidates: &mut Vec<OrderCandidate>) {
    if candidates.len() < 2 {
        return;
    }
    candidates.sort_by(|a, b| a.path.cmp(&b.path));

    let mut rest = std::mem::take(candidates);
    let mut tour = Vec::with_capacity(rest.len());
    tour.push(rest.remove(0));
    while !rest.is_empty() {
        let last = &tour.last().expect("nonempty").lsh;
        let best = rest
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| lsh_distance(last, &c.lsh))
            .map(|(i, _)| i)
            .expect("nonempty");
        tour.push(rest.remove(best));
    }
    *candidates = tour;
}

fn lsh_distance(a: &[u8; 32], b: &[u8; 32]) -> u32 {
    std::iter::zip(a, b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// A cheap 32-bit content similarity hash.
///
/// Built from a quantized byte histogram: contents with a similar byte
/// distribution produce nearby (often equal) values, so sorting by it
/// clusters similar files. Collisions are harmless, they only influence
/// block layout.
pub fn similarity_hash(data: &[u8]) -> u32 {
    let mut histogram = [0u64; 256];
    for &b in data {
        histogram[b as usize] += 1;
    }
    let mut quantized = [0u8; 256];
    for (q, &n) in std::iter::zip(&mut quantized, &histogram) {
        *q = (64 - n.leading_zeros()) as u8;
    }
    xxhash_rust::xxh3::xxh3_64(&quantized) as u32
}

/// A 256-bit locality-sensitive hash in the nilsimsa style.
///
/// Trigrams inside a sliding 5-byte window are mixed into one of 256
/// accumulator buckets; the digest sets bit `i` when bucket `i` exceeds the
/// mean. Hamming distance between digests then approximates content
/// dissimilarity.
pub fn nilsimsa_hash(data: &[u8]) -> [u8; 32] {
    #[inline]
    fn bucket(a: u8, b: u8, c: u8, salt: u8) -> u8 {
        let x = u32::from_le_bytes([a, b, c, salt]).wrapping_mul(0x9E37_79B1);
        (x >> 24) as u8
    }

    let mut acc = [0u64; 256];
    let mut total = 0u64;
    let mut push = |idx: u8| {
        acc[idx as usize] += 1;
        total += 1;
    };
    for w in data.windows(5) {
        // The trigram selection mirrors the classic algorithm: all
        // combinations of the newest byte with two older ones.
        push(bucket(w[4], w[3], w[2], 0));
        push(bucket(w[4], w[3], w[1], 1));
        push(bucket(w[4], w[2], w[1], 2));
        push(bucket(w[4], w[3], w[0], 3));
        push(bucket(w[4], w[2], w[0], 4));
        push(bucket(w[4], w[1], w[0], 5));
        push(bucket(w[0], w[3], w[4], 6));
        push(bucket(w[2], w[0], w[4], 7));
    }
    if total == 0 {
        // Shorter than one window: fall back to byte trigrams over what
        // little there is.
        for (i, &b) in data.iter().enumerate() {
            acc[bucket(b, i as u8, 0, 8) as usize] += 1;
            total += 1;
        }
    }

    let threshold = total / 256;
    let mut digest = [0u8; 32];
    for (i, &n) in acc.iter().enumerate() {
        if n > threshold {
            digest[i / 8] |= 1 << (i % 8);
        }
    }
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u32, path: &str, similarity: u32, lsh_seed: u8) -> OrderCandidate {
        OrderCandidate {
            content_id: id,
            path: path.into(),
            size: 1,
            similarity,
            lsh: [lsh_seed; 32],
        }
    }

    #[test]
    fn path_order_is_lexicographic() {
        let cands = vec![
            candidate(0, "b/x", 0, 0),
            candidate(1, "a/y", 0, 0),
            candidate(2, "a/x", 0, 0),
        ];
        let order = order_contents(FileOrderMode::Path, None, cands).unwrap();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn similarity_ties_break_by_path() {
        let cands = vec![
            candidate(0, "b", 7, 0),
            candidate(1, "a", 7, 0),
            candidate(2, "c", 3, 0),
        ];
        let order = order_contents(FileOrderMode::Similarity, None, cands).unwrap();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn tour_visits_similar_neighbours_first(){
        let cands = vec![
            candidate(0, "a", 0, 0x00),
            candidate(1, "b", 0, 0xFF),
            candidate(2, "c", 0, 0x01),
        ];
        // Start at "a"; 0x01 is much closer to 0x00 than 0xFF.
        let order = order_contents(FileOrderMode::Nilsimsa, None, cands).unwrap();
        assert_eq!(order, vec![0, 2, 1]);
    }

    #[test]
    fn similar_contents_have_close_hashes() {
        let a: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut b = a.clone();
        b[100] ^= 0xA5;
        let c: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2654435761) >> 11) as u8).collect();

        let (ha, hb, hc) = (nilsimsa_hash(&a), nilsimsa_hash(&b), nilsimsa_hash(&c));
        assert!(lsh_distance(&ha, &hb) < lsh_distance(&ha, &hc));

        assert_eq!(similarity_hash(&a), similarity_hash(&a));
    }

    #[test]
    fn hashes_of_tiny_inputs_are_defined() {
        for len in 0..6usize {
            let data = vec![0x42u8; len];
            let _ = nilsimsa_hash(&data);
            let _ = similarity_hash(&data);
        }
    }
}
