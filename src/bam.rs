//! BAM file drivers: header and reference dictionary handling over a BGZF
//! stream, with record-at-a-time access in both directions.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::collections::HashMap;

use crate::bam_record::{BamRecord, BAM_MAGIC};
use crate::bgzf::{BlockRead, BlockWrite};
use crate::error::*;

/// Parsed BAM header: the SAM-format text plus the reference dictionary in id
/// order.
#[derive(Debug, Clone)]
pub struct BamHeader {
    /// SAM-format header text.
    pub text: String,
    /// `(name, length)` per reference, in id order.
    pub refs: Vec<(String, u32)>,
}

impl BamHeader {
    /// Name → id lookup for SAM parsing.
    pub fn ref_ids(&self) -> HashMap<String, i32> {
        self.refs.iter()
            .enumerate()
            .map(|(i, &(ref name, _))| (name.clone(), i as i32))
            .collect()
    }
}

/// Split SAM header text out of a SAM file body and derive the reference
/// dictionary from its `@SQ` lines.
pub fn parse_sam_header(sam_text: &str) -> SkaldResult<(Vec<String>, Vec<(String, u32)>)> {
    let mut header_lines = Vec::new();
    let mut refs = Vec::new();

    for line in sam_text.lines() {
        if !line.starts_with('@') {
            break;
        }
        header_lines.push(line.to_string());
        if !line.starts_with("@SQ") {
            continue;
        }

        let mut name: Option<&str> = None;
        let mut len: Option<u32> = None;
        for field in line.split('\t').skip(1) {
            if let Some(sn) = field.strip_prefix("SN:") {
                name = Some(sn);
            } else if let Some(ln) = field.strip_prefix("LN:") {
                len = Some(ln.parse::<u32>().map_err(|_| {
                    SkaldError::SamParse(format!("bad LN in header: {}", line))
                })?);
            }
        }
        match (name, len) {
            (Some(name), Some(len)) => refs.push((name.to_string(), len)),
            _ => {
                return Err(SkaldError::SamParse(format!(
                    "@SQ line missing SN or LN: {}", line)));
            },
        }
    }

    Ok((header_lines, refs))
}

/// One record blob with the virtual offsets bracketing it.
pub struct RawRecord {
    /// Virtual offset of the `block_size` prefix.
    pub start: u64,
    /// Virtual offset just past the record.
    pub end: u64,
    /// Record bytes, without the prefix.
    pub bytes: Vec<u8>,
}

/// Record-at-a-time BAM reader over any BGZF source.
pub struct BamReader {
    src: Box<dyn BlockRead>,
    header: BamHeader,
}

impl BamReader {
    /// Validate the magic and parse the header and reference dictionary.
    pub fn new(mut src: Box<dyn BlockRead>) -> SkaldResult<BamReader> {
        let mut magic = [0u8; 4];
        read_fully(&mut src, &mut magic)?;
        if &magic != BAM_MAGIC {
            return Err(SkaldError::BamRecord("bad BAM magic".to_string()));
        }

        let l_text = read_u32(&mut src)? as usize;
        let mut text = vec![0u8; l_text];
        read_fully(&mut src, &mut text)?;
        let text = String::from_utf8_lossy(&text)
            .trim_end_matches('\0')
            .to_string();

        let n_ref = read_u32(&mut src)? as i32;
        if n_ref < 0 {
            return Err(SkaldError::BamRecord(format!("negative n_ref {}", n_ref)));
        }
        let mut refs = Vec::with_capacity(n_ref as usize);
        for _ in 0..n_ref {
            let l_name = read_u32(&mut src)? as usize;
            if l_name == 0 {
                return Err(SkaldError::BamRecord("reference name length 0".to_string()));
            }
            let mut name = vec![0u8; l_name];
            read_fully(&mut src, &mut name)?;
            name.pop(); // NUL terminator
            let l_ref = read_u32(&mut src)?;
            refs.push((String::from_utf8_lossy(&name).into_owned(), l_ref));
        }

        Ok(BamReader {
            src: src,
            header: BamHeader {
                text: text,
                refs: refs,
            },
        })
    }

    /// The parsed header.
    pub fn header(&self) -> &BamHeader {
        &self.header
    }

    /// Pull the next record blob with its virtual offsets; `None` at EOF.
    pub fn next_raw(&mut self) -> SkaldResult<Option<RawRecord>> {
        let start = self.src.virtual_offset();

        let mut prefix = [0u8; 4];
        let mut filled = 0usize;
        while filled < 4 {
            let n = self.src.read(&mut prefix[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(SkaldError::BamRecord("truncated block_size prefix"
                    .to_string()));
            }
            filled += n;
        }

        let block_size = LittleEndian::read_u32(&prefix) as usize;
        let mut bytes = vec![0u8; block_size];
        read_fully(&mut self.src, &mut bytes)?;

        Ok(Some(RawRecord {
            start: start,
            end: self.src.virtual_offset(),
            bytes: bytes,
        }))
    }

    /// Decode the next record, validating its reference id against the
    /// dictionary; `None` at EOF.
    pub fn next_record(&mut self) -> SkaldResult<Option<BamRecord>> {
        match self.next_raw()? {
            Some(raw) => {
                let record = BamRecord::decode(&raw.bytes)?;
                let n_ref = self.header.refs.len() as i32;
                if record.ref_id >= n_ref || record.ref_id < -1 {
                    return Err(SkaldError::BamRecord(format!(
                        "refID {} out of bounds ({} references)",
                        record.ref_id, n_ref)));
                }
                if record.next_ref_id >= n_ref || record.next_ref_id < -1 {
                    return Err(SkaldError::BamRecord(format!(
                        "next refID {} out of bounds ({} references)",
                        record.next_ref_id, n_ref)));
                }
                Ok(Some(record))
            },
            None => Ok(None),
        }
    }
}

fn read_fully(src: &mut Box<dyn BlockRead>, buf: &mut [u8]) -> SkaldResult<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(SkaldError::BamRecord("unexpected end of BAM stream"
                .to_string()));
        }
        filled += n;
    }
    Ok(())
}

fn read_u32(src: &mut Box<dyn BlockRead>) -> SkaldResult<u32> {
    let mut buf = [0u8; 4];
    read_fully(src, &mut buf)?;
    Ok(LittleEndian::read_u32(&buf))
}

/// Record-at-a-time BAM writer over any BGZF sink.
pub struct BamWriter {
    sink: Box<dyn BlockWrite + Send>,
    refs: Vec<(String, u32)>,
    ref_ids: HashMap<String, i32>,
}

impl BamWriter {
    /// Emit the magic, header text and reference dictionary, then stand by
    /// for records.
    pub fn new(mut sink: Box<dyn BlockWrite + Send>,
               header_lines: &[String],
               refs: Vec<(String, u32)>)
               -> SkaldResult<BamWriter> {
        let mut text = header_lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }

        sink.write_all(BAM_MAGIC)?;
        let mut out = Vec::with_capacity(text.len() + refs.len() * 16 + 8);
        out.write_u32::<LittleEndian>(text.len() as u32).unwrap();
        out.extend_from_slice(text.as_bytes());
        out.write_i32::<LittleEndian>(refs.len() as i32).unwrap();
        for &(ref name, len) in &refs {
            out.write_u32::<LittleEndian>(name.len() as u32 + 1).unwrap();
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            out.write_u32::<LittleEndian>(len).unwrap();
        }
        sink.write_all(&out)?;

        let ref_ids = refs.iter()
            .enumerate()
            .map(|(i, &(ref name, _))| (name.clone(), i as i32))
            .collect();

        Ok(BamWriter {
            sink: sink,
            refs: refs,
            ref_ids: ref_ids,
        })
    }

    /// The name → id lookup matching the emitted dictionary.
    pub fn ref_ids(&self) -> &HashMap<String, i32> {
        &self.ref_ids
    }

    /// The reference dictionary in id order.
    pub fn refs(&self) -> &[(String, u32)] {
        &self.refs
    }

    /// Encode and append one record, `block_size` prefix included.
    pub fn write_record(&mut self, record: &BamRecord) -> SkaldResult<()> {
        if record.ref_id >= self.refs.len() as i32
           || record.next_ref_id >= self.refs.len() as i32 {
            return Err(SkaldError::BamRecord(format!(
                "refID {} out of bounds ({} references)",
                record.ref_id.max(record.next_ref_id), self.refs.len())));
        }

        let bytes = record.encode()?;
        let mut prefix = [0u8; 4];
        LittleEndian::write_u32(&mut prefix, bytes.len() as u32);
        self.sink.write_all(&prefix)?;
        self.sink.write_all(&bytes)?;
        Ok(())
    }

    /// Parse one SAM text line against the dictionary and append it.
    pub fn write_sam_line(&mut self, line: &str) -> SkaldResult<()> {
        let record = BamRecord::from_sam(line, &self.ref_ids)?;
        self.write_record(&record)
    }

    /// Flush pending blocks and emit the BGZF EOF marker.
    pub fn finish(mut self) -> SkaldResult<()> {
        self.sink.finish_blocks()?;
        Ok(())
    }
}
