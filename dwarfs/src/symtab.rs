//! Symbol-table compression for packed string tables.
//!
//! A symbol table maps up to 255 single-byte codes to short byte sequences
//! (2 to 8 bytes); the code `0xFF` escapes a literal byte. Decoding therefore
//! expands each input byte to at most [`MAX_SYMBOL_LEN`] output bytes, and
//! encoding expands by at most a factor of two (every byte escaped), which is
//! why readers cap compact string items at twice their nominal length limit.
//!
//! The serialized symbol table is `[count: u8]` followed by `count` entries
//! of `[len: u8][len bytes]`.
use std::{collections::HashMap, fmt};

/// The maximum byte length of a single symbol.
pub const MAX_SYMBOL_LEN: usize = 8;

const ESCAPE: u8 = 0xFF;
const MAX_SYMBOLS: usize = 255;

type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised from parsing a symbol table or decoding symbol-compressed
/// data.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The symbol table is truncated or has trailing bytes.
    MalformedSymtab,
    /// A symbol has a length outside `2..=8`.
    InvalidSymbolLen(u8),
    /// The encoded stream references a code not present in the table.
    UnknownCode(u8),
    /// The encoded stream ends in the middle of an escape sequence.
    TruncatedEscape,
    /// The output buffer is too small for the decoded data.
    OutputOverflow,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedSymtab => f.pad("malformed symbol table"),
            Error::InvalidSymbolLen(n) => write!(f, "invalid symbol length {n}"),
            Error::UnknownCode(c) => write!(f, "unknown symbol code {c}"),
            Error::TruncatedEscape => f.pad("truncated escape sequence"),
            Error::OutputOverflow => f.pad("decoded data exceeds the output buffer"),
        }
    }
}

impl std::error::Error for Error {}

/// A parsed symbol table, ready for decoding.
pub struct Decoder {
    /// Symbol bytes, padded; indexed by code.
    symbols: Vec<([u8; MAX_SYMBOL_LEN], u8)>,
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("symbols", &self.symbols.len())
            .finish_non_exhaustive()
    }
}

impl Decoder {
    /// Parse a serialized symbol table.
    pub fn parse_symtab(raw: &[u8]) -> Result<Self> {
        let (&count, mut rest) = raw.split_first().ok_or(Error::MalformedSymtab)?;
        let mut symbols = Vec::with_capacity(count.into());
        for _ in 0..count {
            let (&len, tail) = rest.split_first().ok_or(Error::MalformedSymtab)?;
            if !(2..=MAX_SYMBOL_LEN as u8).contains(&len) {
                return Err(Error::InvalidSymbolLen(len));
            }
            let (sym, tail) = tail
                .split_at_checked(usize::from(len))
                .ok_or(Error::MalformedSymtab)?;
            let mut padded = [0u8; MAX_SYMBOL_LEN];
            padded[..sym.len()].copy_from_slice(sym);
            symbols.push((padded, len));
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(Error::MalformedSymtab);
        }
        Ok(Self { symbols })
    }

    /// An upper bound of the decoded length for `encoded_len` input bytes.
    pub fn max_decode_len(encoded_len: usize) -> usize {
        encoded_len * MAX_SYMBOL_LEN
    }

    /// Decode `input` into `out`, returning the decoded length.
    pub fn decode_into(&self, input: &[u8], out: &mut [u8]) -> Result<usize> {
        let mut pos = 0usize;
        let mut iter = input.iter();
        while let Some(&code) = iter.next() {
            if code == ESCAPE {
                let &lit = iter.next().ok_or(Error::TruncatedEscape)?;
                *out.get_mut(pos).ok_or(Error::OutputOverflow)? = lit;
                pos += 1;
            } else {
                let &(sym, len) = self
                    .symbols
                    .get(usize::from(code))
                    .ok_or(Error::UnknownCode(code))?;
                let len = usize::from(len);
                out.get_mut(pos..pos + len)
                    .ok_or(Error::OutputOverflow)?
                    .copy_from_slice(&sym[..len]);
                pos += len;
            }
        }
        Ok(pos)
    }

    /// Decode `input` into a freshly allocated `Vec`.
    pub fn decode(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = vec![0u8; Self::max_decode_len(input.len())];
        let len = self.decode_into(input, &mut out)?;
        out.truncate(len);
        Ok(out)
    }
}

/// A trained symbol table, ready for encoding.
pub struct Encoder {
    /// Symbol bytes by code, and a longest-match lookup keyed by the bytes.
    symbols: Vec<Vec<u8>>,
    lookup: HashMap<Vec<u8>, u8>,
}

impl fmt::Debug for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encoder")
            .field("symbols", &self.symbols.len())
            .finish_non_exhaustive()
    }
}

impl Encoder {
    /// Train a symbol table over a sample corpus.
    ///
    /// Training is deterministic: candidate substrings are ranked by saved
    /// bytes with ties broken by the symbol bytes themselves, then pruned
    /// to the candidates the greedy encoder actually uses often enough to
    /// pay for their table entry. The heuristic never affects correctness,
    /// only the achieved ratio.
    pub fn train<'a>(corpus: impl IntoIterator<Item = &'a [u8]> + Clone) -> Self {
        let mut counts = HashMap::<&[u8], u64>::new();
        for item in corpus.clone() {
            for len in 2..=MAX_SYMBOL_LEN {
                for gram in item.windows(len) {
                    *counts.entry(gram).or_default() += 1;
                }
            }
        }

        // Each use of a symbol replaces `len` bytes with one code; storing
        // the symbol costs `len + 1` table bytes.
        let table_cost = |len: usize| len as u64 + 1;
        let mut candidates = counts
            .into_iter()
            .filter_map(|(gram, cnt)| {
                let gain = cnt
                    .checked_mul(gram.len() as u64 - 1)?
                    .checked_sub(table_cost(gram.len()))?;
                (cnt >= 2 && gain > 0).then_some((gain, gram))
            })
            .collect::<Vec<_>>();
        candidates.sort_by(|(ga, a), (gb, b)| gb.cmp(ga).then_with(|| a.cmp(b)));
        candidates.truncate(MAX_SYMBOLS);

        let trial = Self::from_symbols(candidates.iter().map(|(_, g)| g.to_vec()).collect());

        // Overlapping candidates shadow each other under greedy
        // longest-match encoding, leaving most of them unused while still
        // paying their table bytes. Encode the corpus once and keep only
        // the symbols that earn their keep.
        let mut used = vec![0u64; trial.symbols.len()];
        let mut encoded = Vec::new();
        for item in corpus {
            encoded.clear();
            trial.encode_into(item, &mut encoded);
            let mut i = 0;
            while i < encoded.len() {
                if encoded[i] == ESCAPE {
                    // Skip the escaped literal; it may collide with a code.
                    i += 2;
                } else {
                    used[usize::from(encoded[i])] += 1;
                    i += 1;
                }
            }
        }

        let kept = trial
            .symbols
            .into_iter()
            .zip(used)
            .filter_map(|(sym, cnt)| {
                (cnt * (sym.len() as u64 - 1) > table_cost(sym.len())).then_some(sym)
            })
            .collect();
        Self::from_symbols(kept)
    }

    fn from_symbols(symbols: Vec<Vec<u8>>) -> Self {
        let lookup = symbols
            .iter()
            .enumerate()
            .map(|(code, sym)| (sym.clone(), code as u8))
            .collect();
        Self { symbols, lookup }
    }

    /// Serialize the symbol table for storage next to the encoded buffer.
    pub fn symtab_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.symbols.len() as u8];
        for sym in &self.symbols {
            out.push(sym.len() as u8);
            out.extend_from_slice(sym);
        }
        out
    }

    /// Encode `input`, appending to `out`. Greedy longest match per position.
    pub fn encode_into(&self, input: &[u8], out: &mut Vec<u8>) {
        let mut pos = 0usize;
        'outer: while pos < input.len() {
            let max_len = MAX_SYMBOL_LEN.min(input.len() - pos);
            for len in (2..=max_len).rev() {
                if let Some(&code) = self.lookup.get(&input[pos..pos + len]) {
                    out.push(code);
                    pos += len;
                    continue 'outer;
                }
            }
            out.push(ESCAPE);
            out.push(input[pos]);
            pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(corpus: &[&[u8]]) -> (usize, usize) {
        let enc = Encoder::train(corpus.iter().copied());
        let dec = Decoder::parse_symtab(&enc.symtab_bytes()).unwrap();
        let (mut raw_len, mut enc_len) = (0, 0);
        for item in corpus {
            let mut encoded = Vec::new();
            enc.encode_into(item, &mut encoded);
            assert!(encoded.len() <= item.len() * 2);
            assert_eq!(dec.decode(&encoded).unwrap(), *item);
            raw_len += item.len();
            enc_len += encoded.len();
        }
        (raw_len, enc_len)
    }

    #[test]
    fn roundtrip_names() {
        let names: Vec<String> = (0..64).map(|i| format!("a_common_prefix.{i:03}.txt")).collect();
        let corpus: Vec<&[u8]> = names.iter().map(|s| s.as_bytes()).collect();
        let (raw, enc) = roundtrip(&corpus);
        // The shared prefix must actually compress.
        assert!(enc < raw, "encoded {enc} >= raw {raw}");
    }

    #[test]
    fn roundtrip_incompressible() {
        // No repeated grams at all: everything is escaped, bounded by 2x.
        let item: Vec<u8> = (0u8..=255).collect();
        roundtrip(&[&item]);
    }

    #[test]
    fn roundtrip_empty_and_binary() {
        roundtrip(&[b"", b"\xFF\xFF\x00", b"\xFF"]);
    }

    #[test]
    fn rejects_malformed_symtab() {
        assert_eq!(Decoder::parse_symtab(&[]).unwrap_err(), Error::MalformedSymtab);
        assert_eq!(
            Decoder::parse_symtab(&[1, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap_err(),
            Error::InvalidSymbolLen(9),
        );
        // Trailing garbage.
        assert_eq!(
            Decoder::parse_symtab(&[1, 2, b'a', b'b', b'!']).unwrap_err(),
            Error::MalformedSymtab,
        );
    }

    #[test]
    fn rejects_malformed_stream() {
        let dec = Decoder::parse_symtab(&[1, 2, b'a', b'b']).unwrap();
        assert_eq!(dec.decode(&[7]).unwrap_err(), Error::UnknownCode(7));
        assert_eq!(dec.decode(&[ESCAPE]).unwrap_err(), Error::TruncatedEscape);
    }
}
