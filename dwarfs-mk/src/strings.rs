//! String table packing.
//!
//! Names and symlink targets are uniquified and stored either as a plain
//! string list or as a compact table: one shared buffer plus an index of
//! item boundaries. The compact index is absolute end offsets by default
//! and per-item lengths when packed; the buffer can additionally be
//! symbol-compressed, falling back to raw storage when the symbol table
//! does not pay for itself (unless forced).
use bstr::BString;
use dwarfs::metadata::StringTable;
use dwarfs::symtab;

#[derive(Debug, Clone, Copy, Default)]
pub struct PackOptions {
    /// Symbol-compress the shared buffer.
    pub pack_data: bool,
    /// Store per-item lengths instead of absolute offsets.
    pub pack_index: bool,
    /// Keep symbol compression even when it does not shrink the buffer.
    pub force_pack: bool,
}

/// Build a compact [`StringTable`] from uniquified items.
pub fn pack(items: &[String], options: PackOptions) -> StringTable {
    let mut out = StringTable::default();

    let raw_len = items.iter().map(String::len).sum::<usize>();
    if options.pack_data {
        let encoder = symtab::Encoder::train(items.iter().map(String::as_bytes));
        let symtab_bytes = encoder.symtab_bytes();
        let mut buffer = Vec::with_capacity(raw_len);
        let mut lens = Vec::with_capacity(items.len());
        for item in items {
            let start = buffer.len();
            encoder.encode_into(item.as_bytes(), &mut buffer);
            lens.push((buffer.len() - start) as u32);
        }
        if options.force_pack || buffer.len() + symtab_bytes.len() < raw_len {
            out.symtab = Some(BString::from(symtab_bytes));
            out.buffer = buffer.into();
            return finish_index(out, &lens, options.pack_index);
        }
        // Not worth it; fall through to raw storage.
    }

    let mut buffer = Vec::with_capacity(raw_len);
    let mut lens = Vec::with_capacity(items.len());
    for item in items {
        buffer.extend_from_slice(item.as_bytes());
        lens.push(item.len() as u32);
    }
    out.buffer = buffer.into();
    finish_index(out, &lens, options.pack_index)
}

fn finish_index(mut out: StringTable, lens: &[u32], pack_index: bool) -> StringTable {
    if pack_index {
        out.packed_index = true;
        out.index = lens.to_vec();
    } else {
        // Absolute end offsets, with the leading zero stored.
        out.index = Vec::with_capacity(lens.len() + 1);
        out.index.push(0);
        let mut sum = 0u32;
        for &len in lens {
            sum += len;
            out.index.push(sum);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Vec<String> {
        (0..40).map(|i| format!("shared_prefix_item_{i:02}")).collect()
    }

    #[test]
    fn absolute_index_shape() {
        let items = items();
        let tbl = pack(&items, PackOptions::default());
        assert!(!tbl.packed_index);
        assert!(tbl.symtab.is_none());
        assert_eq!(tbl.index.len(), items.len() + 1);
        assert_eq!(tbl.index[0], 0);
        assert_eq!(*tbl.index.last().unwrap() as usize, tbl.buffer.len());
        assert!(tbl.index.is_sorted());
    }

    #[test]
    fn packed_index_shape() {
        let items = items();
        let tbl = pack(&items, PackOptions { pack_index: true, ..Default::default() });
        assert!(tbl.packed_index);
        assert_eq!(tbl.index.len(), items.len());
        assert_eq!(
            tbl.index.iter().map(|&n| n as usize).sum::<usize>(),
            tbl.buffer.len(),
        );
    }

    #[test]
    fn symbol_compression_shrinks_redundant_items() {
        let items = items();
        let raw_len = items.iter().map(String::len).sum::<usize>();
        let tbl = pack(
            &items,
            PackOptions { pack_data: true, pack_index: true, force_pack: true },
        );
        let symtab_bytes = tbl.symtab.as_ref().unwrap();
        assert!(tbl.buffer.len() + symtab_bytes.len() < raw_len);

        // The decoder side must reproduce every item.
        let decoder = symtab::Decoder::parse_symtab(symtab_bytes).unwrap();
        let mut pos = 0usize;
        for (item, &len) in std::iter::zip(&items, &tbl.index) {
            let encoded = &tbl.buffer[pos..pos + len as usize];
            assert_eq!(decoder.decode(encoded).unwrap(), item.as_bytes());
            pos += len as usize;
        }
    }

    #[test]
    fn incompressible_data_falls_back_unless_forced() {
        let items: Vec<String> = (0u32..64)
            .map(|i| format!("{:08x}", i.wrapping_mul(0x9E3779B9)))
            .collect();
        let tbl = pack(&items, PackOptions { pack_data: true, ..Default::default() });
        // Either genuinely smaller, or raw without a symbol table.
        if tbl.symtab.is_none() {
            let raw_len = items.iter().map(String::len).sum::<usize>();
            assert_eq!(tbl.buffer.len(), raw_len);
        }
    }
}
