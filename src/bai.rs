//! BAI index construction: one sequential pass over a BAM collecting
//! per-reference bin chunks, the 16 kb linear index, and the mapped/unmapped
//! pseudo-bin, then a flat little-endian serialization.

use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::Write;

use crate::bam::BamReader;
use crate::bam_record::{BamRecord, FLAG_UNMAPPED};
use crate::error::*;

/// BAI file magic.
pub const BAI_MAGIC: &[u8; 4] = b"BAI\x01";
/// The mapped/unmapped summary pseudo-bin id.
pub const PSEUDO_BIN: u32 = 37450;
/// Linear-index window shift (16 kb windows).
pub const LINEAR_SHIFT: u32 = 14;

/// A half-open virtual-offset span of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Virtual offset of the first record's block_size prefix.
    pub beg: u64,
    /// Virtual offset past the last record.
    pub end: u64,
}

/// Index state for one reference.
#[derive(Debug, Default)]
struct RefIndex {
    bins: BTreeMap<u32, Vec<Chunk>>,
    linear: Vec<u64>,
    mapped: u64,
    unmapped: u64,
    first: u64,
    last: u64,
    seen: bool,
}

impl RefIndex {
    fn add_chunk(&mut self, bin: u32, chunk: Chunk) {
        let chunks = self.bins.entry(bin).or_insert_with(Vec::new);
        match chunks.last_mut() {
            Some(last) if chunk.beg <= last.end => {
                last.end = last.end.max(chunk.end);
            },
            _ => chunks.push(chunk),
        }
    }

    fn mark_linear(&mut self, window_beg: usize, window_end: usize, offset: u64) {
        if self.linear.len() <= window_end {
            self.linear.resize(window_end + 1, 0);
        }
        for slot in &mut self.linear[window_beg..=window_end] {
            if *slot == 0 {
                *slot = offset;
            }
        }
    }

    fn note_record(&mut self, start: u64, end: u64, unmapped: bool) {
        if !self.seen {
            self.first = start;
            self.seen = true;
        }
        self.first = self.first.min(start);
        self.last = self.last.max(end);
        if unmapped {
            self.unmapped += 1;
        } else {
            self.mapped += 1;
        }
    }
}

/// A complete in-memory BAI.
pub struct BaiIndex {
    refs: Vec<RefIndex>,
    no_coord: u64,
}

impl BaiIndex {
    /// Build the index with one sequential pass over `reader`.
    pub fn build(reader: &mut BamReader) -> SkaldResult<BaiIndex> {
        let n_ref = reader.header().refs.len();
        let mut refs: Vec<RefIndex> = (0..n_ref).map(|_| RefIndex::default()).collect();
        let mut no_coord = 0u64;

        while let Some(raw) = reader.next_raw()? {
            let record = BamRecord::decode(&raw.bytes)?;
            if record.ref_id >= n_ref as i32 {
                return Err(SkaldError::BamRecord(format!(
                    "refID {} out of bounds ({} references)", record.ref_id, n_ref)));
            }

            if record.ref_id < 0 {
                no_coord += 1;
                continue;
            }

            let entry = &mut refs[record.ref_id as usize];
            entry.note_record(raw.start, raw.end,
                              record.flag & FLAG_UNMAPPED != 0);

            if record.pos < 0 {
                continue;
            }

            entry.add_chunk(record.bin() as u32, Chunk {
                beg: raw.start,
                end: raw.end,
            });

            let pos = record.pos as i64;
            let span = record.ref_span();
            let window_beg = (pos >> LINEAR_SHIFT) as usize;
            let window_end = (pos.max(pos + span - 1) >> LINEAR_SHIFT) as usize;
            entry.mark_linear(window_beg, window_end, raw.start);
        }

        Ok(BaiIndex {
            refs: refs,
            no_coord: no_coord,
        })
    }

    /// Reads that never got a coordinate (refID < 0).
    pub fn reads_without_coordinate(&self) -> u64 {
        self.no_coord
    }

    /// The chunk lists whose bins overlap `[beg, end)` on a reference. Used
    /// for region lookups; the union of the returned chunks covers every
    /// overlapping alignment.
    pub fn chunks_overlapping(&self, ref_id: usize, beg: i64, end: i64) -> Vec<Chunk> {
        let entry = match self.refs.get(ref_id) {
            Some(entry) => entry,
            None => return Vec::new(),
        };

        let mut out = Vec::new();
        for bin in region_bins(beg, end) {
            if let Some(chunks) = entry.bins.get(&bin) {
                out.extend_from_slice(chunks);
            }
        }
        out
    }

    /// Serialize in the flat `.bai` layout.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> SkaldResult<()> {
        writer.write_all(BAI_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.refs.len() as u32)?;

        for entry in &self.refs {
            let n_bins = entry.bins.len() + if entry.seen { 1 } else { 0 };
            writer.write_u32::<LittleEndian>(n_bins as u32)?;

            for (&bin, chunks) in &entry.bins {
                writer.write_u32::<LittleEndian>(bin)?;
                writer.write_u32::<LittleEndian>(chunks.len() as u32)?;
                for chunk in chunks {
                    writer.write_u64::<LittleEndian>(chunk.beg)?;
                    writer.write_u64::<LittleEndian>(chunk.end)?;
                }
            }

            if entry.seen {
                writer.write_u32::<LittleEndian>(PSEUDO_BIN)?;
                writer.write_u32::<LittleEndian>(2)?;
                writer.write_u64::<LittleEndian>(entry.first)?;
                writer.write_u64::<LittleEndian>(entry.last)?;
                writer.write_u64::<LittleEndian>(entry.mapped)?;
                writer.write_u64::<LittleEndian>(entry.unmapped)?;
            }

            writer.write_u32::<LittleEndian>(entry.linear.len() as u32)?;
            for &offset in &entry.linear {
                writer.write_u64::<LittleEndian>(offset)?;
            }
        }

        writer.write_u64::<LittleEndian>(self.no_coord)?;
        Ok(())
    }
}

/// Candidate bins for a region, smallest level first.
fn region_bins(beg: i64, end: i64) -> Vec<u32> {
    let end = end - 1;
    let mut bins = vec![0u32];
    for &(offset, shift) in &[(1u32, 26), (9u32, 23), (73u32, 20),
                              (585u32, 17), (4681u32, 14)] {
        let lo = offset + (beg >> shift) as u32;
        let hi = offset + (end >> shift) as u32;
        for bin in lo..=hi {
            bins.push(bin);
        }
    }
    bins
}
