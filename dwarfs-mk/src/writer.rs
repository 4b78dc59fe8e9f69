//! The image writer: frames blocks and metadata into typed sections.
//!
//! Blocks compress on a parallel pool but are written in submission order,
//! so block numbers on the wire equal segmenter emission order. The codec
//! may refuse to compress (payload not smaller); such sections carry the
//! `NONE` tag, which is why one image can mix compression tags.
use std::io::Write;
use std::num::NonZero;

use dwarfs::metadata::Metadata;
use dwarfs::section::{self, CompressAlgo, CompressParam, Header, SectionType};
use dwarfs::zerocopy::IntoBytes;

use crate::error::Result;
use crate::progress::Progress;
use crate::segment::BlockSink;
use crate::workers::OrderedPool;

type CompressResult = std::result::Result<(CompressAlgo, Vec<u8>), dwarfs::section::Error>;

pub struct ImageWriter<'a, W> {
    w: W,
    compression: CompressParam,
    pool: OrderedPool<CompressResult>,
    section_number: u32,
    prog: &'a Progress,
}

impl<W> std::fmt::Debug for ImageWriter<'_, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageWriter")
            .field("compression", &self.compression)
            .field("section_number", &self.section_number)
            .finish_non_exhaustive()
    }
}

impl<'a, W: Write> ImageWriter<'a, W> {
    pub fn new(w: W, compression: CompressParam, prog: &'a Progress) -> Result<Self> {
        let threads = std::thread::available_parallelism()
            .unwrap_or(NonZero::new(1).expect("nonzero"));
        Ok(Self {
            w,
            compression,
            pool: OrderedPool::new("compress", threads)?,
            section_number: 0,
            prog,
        })
    }

    fn write_section(&mut self, ty: SectionType, algo: CompressAlgo, payload: &[u8]) -> Result<()> {
        let header = Header::new_sealed(self.section_number, ty, algo, payload);
        self.w.write_all(header.as_bytes())?;
        self.w.write_all(payload)?;
        self.section_number += 1;
        self.prog
            .compressed_size
            .add(header.as_bytes().len() as u64 + payload.len() as u64);
        Ok(())
    }

    fn write_compressed_blocks(&mut self, ready: Vec<CompressResult>) -> Result<()> {
        for result in ready {
            let (algo, payload) = result?;
            self.write_section(SectionType::BLOCK, algo, &payload)?;
            self.prog.blocks_written.inc();
        }
        Ok(())
    }

    /// Wait for in-flight block compressions and write them out.
    pub fn finish_blocks(&mut self) -> Result<()> {
        let rest = self.pool.finish();
        self.write_compressed_blocks(rest)
    }

    /// Freeze and append the metadata schema and metadata sections.
    /// All blocks must be finished first.
    pub fn write_metadata(&mut self, meta: &Metadata) -> Result<()> {
        self.finish_blocks()?;

        let (schema, frozen) = meta.to_schema_and_bytes()?;
        let schema_bytes = schema.to_bytes();
        let (algo, payload) = section::compress(self.compression, &schema_bytes)?;
        self.write_section(SectionType::METADATA_V2_SCHEMA, algo, &payload)?;
        let (algo, payload) = section::compress(self.compression, &frozen)?;
        self.write_section(SectionType::METADATA_V2, algo, &payload)?;
        Ok(())
    }

    /// Flush and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.finish_blocks()?;
        self.w.flush()?;
        Ok(self.w)
    }
}

impl<W: Write> BlockSink for ImageWriter<'_, W> {
    fn push_block(&mut self, data: Vec<u8>) -> Result<()> {
        let compression = self.compression;
        let ready = self
            .pool
            .submit(move || section::compress(compression, &data));
        self.write_compressed_blocks(ready)
    }
}
