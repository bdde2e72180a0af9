//! The SAM/BAM record transcoder: binary record encode/decode, 4-bit SEQ
//! packing, packed CIGAR, typed aux tags, and the reg2bin interval binning.
//!
//! Encoded bytes exclude the `block_size` prefix; the BAM driver prepends it
//! as a little-endian u32.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::collections::HashMap;

use crate::error::*;
use crate::util::revcomp;

/// BAM file magic.
pub const BAM_MAGIC: &[u8; 4] = b"BAM\x01";
/// 4-bit SEQ alphabet, nibble value = index.
pub const SEQ_NT16: &[u8; 16] = b"=ACMGRSVTWYHKDBN";
/// CIGAR operator characters, code = index.
pub const CIGAR_CHARS: &[u8; 9] = b"MIDNSHP=X";
/// Bin of reads without a coordinate.
pub const UNMAPPED_BIN: u16 = 4680;
/// Reverse-strand flag.
pub const FLAG_REVERSE: u16 = 0x10;
/// Unmapped flag.
pub const FLAG_UNMAPPED: u16 = 0x4;

/// Standard BAM interval binning.
pub fn reg2bin(beg: i64, end: i64) -> u16 {
    let end = end - 1;
    if beg >> 14 == end >> 14 {
        return (((1 << 15) - 1) / 7 + (beg >> 14)) as u16;
    }
    if beg >> 17 == end >> 17 {
        return (((1 << 12) - 1) / 7 + (beg >> 17)) as u16;
    }
    if beg >> 20 == end >> 20 {
        return (((1 << 9) - 1) / 7 + (beg >> 20)) as u16;
    }
    if beg >> 23 == end >> 23 {
        return (((1 << 6) - 1) / 7 + (beg >> 23)) as u16;
    }
    if beg >> 26 == end >> 26 {
        return (((1 << 3) - 1) / 7 + (beg >> 26)) as u16;
    }
    0
}

/// Reference bases consumed by a CIGAR (M/D/N/=/X).
pub fn ref_span(cigar: &[(u32, u8)]) -> i64 {
    cigar.iter()
        .filter(|&&(_, op)| matches!(op, b'M' | b'D' | b'N' | b'=' | b'X'))
        .map(|&(len, _)| len as i64)
        .sum()
}

fn cigar_code(op: u8) -> SkaldResult<u32> {
    CIGAR_CHARS.iter()
        .position(|&c| c == op)
        .map(|i| i as u32)
        .ok_or_else(|| SkaldError::SamParse(format!("unknown CIGAR op '{}'", op as char)))
}

/// Parse SAM CIGAR text; `*` yields an empty vector.
pub fn parse_cigar(text: &str) -> SkaldResult<Vec<(u32, u8)>> {
    if text == "*" {
        return Ok(Vec::new());
    }
    let mut ops = Vec::new();
    let mut len = 0u32;
    let mut have_len = false;
    for &b in text.as_bytes() {
        if b.is_ascii_digit() {
            len = len.wrapping_mul(10).wrapping_add((b - b'0') as u32);
            have_len = true;
        } else {
            if !have_len {
                return Err(SkaldError::SamParse(format!("bad CIGAR: {}", text)));
            }
            cigar_code(b)?;
            ops.push((len, b));
            len = 0;
            have_len = false;
        }
    }
    if have_len {
        return Err(SkaldError::SamParse(format!("CIGAR ends mid-op: {}", text)));
    }
    Ok(ops)
}

/// Format a CIGAR back to SAM text.
pub fn cigar_text(cigar: &[(u32, u8)]) -> String {
    if cigar.is_empty() {
        return "*".to_string();
    }
    let mut out = String::new();
    for &(len, op) in cigar {
        out.push_str(&len.to_string());
        out.push(op as char);
    }
    out
}

fn nt16(base: u8) -> u8 {
    match SEQ_NT16.iter().position(|&c| c == base.to_ascii_uppercase()) {
        Some(i) => i as u8,
        None => 15,
    }
}

/// Pack ASCII bases into 4-bit codes, high nibble first.
pub fn pack_seq(seq: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; (seq.len() + 1) / 2];
    for (i, &b) in seq.iter().enumerate() {
        let nibble = nt16(b);
        if i % 2 == 0 {
            out[i / 2] = nibble << 4;
        } else {
            out[i / 2] |= nibble;
        }
    }
    out
}

/// Unpack 4-bit codes back into ASCII bases.
pub fn unpack_seq(packed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let byte = packed[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        out.push(SEQ_NT16[nibble as usize]);
    }
    out
}

/// A typed auxiliary tag value.
#[derive(Debug, Clone, PartialEq)]
pub enum AuxValue {
    /// `A`: printable character.
    Char(u8),
    /// Any of `c,C,s,S,i,I`, normalized to i64; the encoder re-picks the
    /// smallest representation.
    Int(i64),
    /// `f`: single-precision float.
    Float(f32),
    /// `Z`: NUL-terminated string.
    Text(String),
    /// `H`: NUL-terminated hex string.
    Hex(String),
    /// `B` with an integer subtype.
    IntArray(u8, Vec<i64>),
    /// `B:f`.
    FloatArray(Vec<f32>),
}

/// One auxiliary tag.
#[derive(Debug, Clone, PartialEq)]
pub struct AuxTag {
    /// Two-character tag name.
    pub tag: [u8; 2],
    /// Typed value.
    pub value: AuxValue,
}

fn int_type(v: i64) -> SkaldResult<u8> {
    if v >= i8::MIN as i64 && v <= i8::MAX as i64 {
        Ok(b'c')
    } else if v >= 0 && v <= u8::MAX as i64 {
        Ok(b'C')
    } else if v >= i16::MIN as i64 && v <= i16::MAX as i64 {
        Ok(b's')
    } else if v >= 0 && v <= u16::MAX as i64 {
        Ok(b'S')
    } else if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
        Ok(b'i')
    } else if v >= 0 && v <= u32::MAX as i64 {
        Ok(b'I')
    } else {
        Err(SkaldError::SamParse(format!("integer tag value {} out of range", v)))
    }
}

fn write_int(out: &mut Vec<u8>, ty: u8, v: i64) -> SkaldResult<()> {
    match ty {
        b'c' => out.write_i8(v as i8).unwrap(),
        b'C' => out.write_u8(v as u8).unwrap(),
        b's' => out.write_i16::<LittleEndian>(v as i16).unwrap(),
        b'S' => out.write_u16::<LittleEndian>(v as u16).unwrap(),
        b'i' => out.write_i32::<LittleEndian>(v as i32).unwrap(),
        b'I' => out.write_u32::<LittleEndian>(v as u32).unwrap(),
        other => {
            return Err(SkaldError::SamParse(format!(
                "unknown integer subtype '{}'", other as char)));
        },
    }
    Ok(())
}

fn int_width(ty: u8) -> SkaldResult<usize> {
    match ty {
        b'c' | b'C' => Ok(1),
        b's' | b'S' => Ok(2),
        b'i' | b'I' => Ok(4),
        other => Err(SkaldError::BamRecord(format!(
            "unknown integer subtype '{}'", other as char))),
    }
}

fn read_int(data: &[u8], ty: u8) -> i64 {
    match ty {
        b'c' => data[0] as i8 as i64,
        b'C' => data[0] as i64,
        b's' => LittleEndian::read_i16(data) as i64,
        b'S' => LittleEndian::read_u16(data) as i64,
        b'i' => LittleEndian::read_i32(data) as i64,
        _ => LittleEndian::read_u32(data) as i64,
    }
}

impl AuxTag {
    /// Append the binary form of this tag.
    pub fn encode(&self, out: &mut Vec<u8>) -> SkaldResult<()> {
        out.extend_from_slice(&self.tag);
        match self.value {
            AuxValue::Char(c) => {
                out.push(b'A');
                out.push(c);
            },
            AuxValue::Int(v) => {
                let ty = int_type(v)?;
                out.push(ty);
                write_int(out, ty, v)?;
            },
            AuxValue::Float(f) => {
                out.push(b'f');
                out.write_f32::<LittleEndian>(f).unwrap();
            },
            AuxValue::Text(ref s) => {
                out.push(b'Z');
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            },
            AuxValue::Hex(ref s) => {
                out.push(b'H');
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            },
            AuxValue::IntArray(subtype, ref values) => {
                out.push(b'B');
                out.push(subtype);
                int_width(subtype)?;
                out.write_u32::<LittleEndian>(values.len() as u32).unwrap();
                for &v in values {
                    write_int(out, subtype, v)?;
                }
            },
            AuxValue::FloatArray(ref values) => {
                out.push(b'B');
                out.push(b'f');
                out.write_u32::<LittleEndian>(values.len() as u32).unwrap();
                for &v in values {
                    out.write_f32::<LittleEndian>(v).unwrap();
                }
            },
        }
        Ok(())
    }

    /// Decode one tag from `data`, returning it and the bytes consumed.
    pub fn decode(data: &[u8]) -> SkaldResult<(AuxTag, usize)> {
        if data.len() < 4 {
            return Err(SkaldError::BamRecord("aux tag too short".to_string()));
        }
        let tag = [data[0], data[1]];
        let ty = data[2];
        let body = &data[3..];

        let (value, used) = match ty {
            b'A' => (AuxValue::Char(body[0]), 1),
            b'c' | b'C' | b's' | b'S' | b'i' | b'I' => {
                let width = int_width(ty)?;
                if body.len() < width {
                    return Err(SkaldError::BamRecord("integer tag truncated".to_string()));
                }
                (AuxValue::Int(read_int(body, ty)), width)
            },
            b'f' => {
                if body.len() < 4 {
                    return Err(SkaldError::BamRecord("float tag truncated".to_string()));
                }
                (AuxValue::Float(LittleEndian::read_f32(body)), 4)
            },
            b'Z' | b'H' => {
                let nul = body.iter().position(|&b| b == 0).ok_or_else(|| {
                    SkaldError::BamRecord("unterminated string tag".to_string())
                })?;
                let text = String::from_utf8_lossy(&body[..nul]).into_owned();
                let value = if ty == b'Z' {
                    AuxValue::Text(text)
                } else {
                    AuxValue::Hex(text)
                };
                (value, nul + 1)
            },
            b'B' => {
                if body.len() < 5 {
                    return Err(SkaldError::BamRecord("array tag truncated".to_string()));
                }
                let subtype = body[0];
                let count = LittleEndian::read_u32(&body[1..5]) as usize;
                let values = &body[5..];
                if subtype == b'f' {
                    if values.len() < count * 4 {
                        return Err(SkaldError::BamRecord("float array truncated"
                            .to_string()));
                    }
                    let mut out = Vec::with_capacity(count);
                    for i in 0..count {
                        out.push(LittleEndian::read_f32(&values[i * 4..]));
                    }
                    (AuxValue::FloatArray(out), 5 + count * 4)
                } else {
                    let width = int_width(subtype)?;
                    if values.len() < count * width {
                        return Err(SkaldError::BamRecord("integer array truncated"
                            .to_string()));
                    }
                    let mut out = Vec::with_capacity(count);
                    for i in 0..count {
                        out.push(read_int(&values[i * width..], subtype));
                    }
                    (AuxValue::IntArray(subtype, out), 5 + count * width)
                }
            },
            other => {
                return Err(SkaldError::BamRecord(format!(
                    "unknown aux type '{}'", other as char)));
            },
        };

        Ok((AuxTag { tag: tag, value: value }, 3 + used))
    }

    /// Parse `TAG:TYPE:VALUE` SAM text.
    pub fn parse(text: &str) -> SkaldResult<AuxTag> {
        let mut parts = text.splitn(3, ':');
        let tag = parts.next().unwrap_or("");
        let ty = parts.next()
            .ok_or_else(|| SkaldError::SamParse(format!("bad tag: {}", text)))?;
        let value = parts.next()
            .ok_or_else(|| SkaldError::SamParse(format!("bad tag: {}", text)))?;
        if tag.len() != 2 {
            return Err(SkaldError::SamParse(format!("bad tag name: {}", text)));
        }
        let tag = [tag.as_bytes()[0], tag.as_bytes()[1]];

        let parsed = match ty {
            "A" => AuxValue::Char(value.as_bytes().first().cloned().unwrap_or(b' ')),
            "i" => AuxValue::Int(value.parse::<i64>()
                .map_err(|_| SkaldError::SamParse(format!("bad int tag: {}", text)))?),
            "f" => AuxValue::Float(value.parse::<f32>()
                .map_err(|_| SkaldError::SamParse(format!("bad float tag: {}", text)))?),
            "Z" => AuxValue::Text(value.to_string()),
            "H" => AuxValue::Hex(value.to_string()),
            "B" => {
                let mut items = value.split(',');
                let subtype = items.next().unwrap_or("");
                if subtype == "f" {
                    let mut values = Vec::new();
                    for item in items {
                        values.push(item.parse::<f32>().map_err(|_| {
                            SkaldError::SamParse(format!("bad array tag: {}", text))
                        })?);
                    }
                    AuxValue::FloatArray(values)
                } else {
                    let sub = subtype.as_bytes().first().cloned().unwrap_or(0);
                    int_width(sub).map_err(|_| {
                        SkaldError::SamParse(format!("bad array subtype: {}", text))
                    })?;
                    let mut values = Vec::new();
                    for item in items {
                        values.push(item.parse::<i64>().map_err(|_| {
                            SkaldError::SamParse(format!("bad array tag: {}", text))
                        })?);
                    }
                    AuxValue::IntArray(sub, values)
                }
            },
            other => {
                return Err(SkaldError::SamParse(format!(
                    "unknown aux type '{}'", other)));
            },
        };

        Ok(AuxTag { tag: tag, value: parsed })
    }

    /// Render back to `TAG:TYPE:VALUE` SAM text.
    pub fn to_text(&self) -> String {
        let tag = format!("{}{}", self.tag[0] as char, self.tag[1] as char);
        match self.value {
            AuxValue::Char(c) => format!("{}:A:{}", tag, c as char),
            AuxValue::Int(v) => format!("{}:i:{}", tag, v),
            AuxValue::Float(f) => format!("{}:f:{}", tag, f),
            AuxValue::Text(ref s) => format!("{}:Z:{}", tag, s),
            AuxValue::Hex(ref s) => format!("{}:H:{}", tag, s),
            AuxValue::IntArray(subtype, ref values) => {
                let mut out = format!("{}:B:{}", tag, subtype as char);
                for v in values {
                    out.push(',');
                    out.push_str(&v.to_string());
                }
                out
            },
            AuxValue::FloatArray(ref values) => {
                let mut out = format!("{}:B:f", tag);
                for v in values {
                    out.push(',');
                    out.push_str(&v.to_string());
                }
                out
            },
        }
    }
}

/// One alignment record in its unpacked, in-memory form.
///
/// SEQ/QUAL orientation follows the source: records parsed from SAM are
/// alignment-oriented, records decoded from BAM bytes are in read
/// orientation (the wire convention for reverse-strand reads).
/// [`BamRecord::encode`] and [`BamRecord::to_sam`] each apply the strand
/// flip for their output convention; [`BamRecord::decode`] never
/// un-reverses.
#[derive(Debug, Clone, PartialEq)]
pub struct BamRecord {
    /// Reference id; -1 when unmapped.
    pub ref_id: i32,
    /// 0-based position; -1 when unmapped.
    pub pos: i32,
    /// Mapping quality (255 = unavailable).
    pub mapq: u8,
    /// FLAG bits.
    pub flag: u16,
    /// Mate reference id; -1 when absent.
    pub next_ref_id: i32,
    /// Mate 0-based position; -1 when absent.
    pub next_pos: i32,
    /// Template length.
    pub tlen: i32,
    /// Read name without the NUL terminator.
    pub name: String,
    /// CIGAR as (length, op char) pairs.
    pub cigar: Vec<(u32, u8)>,
    /// ASCII bases; empty when SEQ is `*`.
    pub seq: Vec<u8>,
    /// Raw phred scores; empty when QUAL is `*`.
    pub qual: Vec<u8>,
    /// Auxiliary tags in order.
    pub tags: Vec<AuxTag>,
}

impl BamRecord {
    /// The bin this record belongs to.
    pub fn bin(&self) -> u16 {
        if self.pos < 0 {
            return UNMAPPED_BIN;
        }
        let span = ref_span(&self.cigar).max(1);
        reg2bin(self.pos as i64, self.pos as i64 + span)
    }

    /// Reference span of this record's CIGAR.
    pub fn ref_span(&self) -> i64 {
        ref_span(&self.cigar)
    }

    /// Flip a reverse-strand record between alignment orientation and read
    /// orientation: SEQ is reverse-complemented, QUAL reversed. The transform
    /// is its own inverse; forward-strand records are untouched.
    /// [`BamRecord::encode`] applies it before packing and
    /// [`BamRecord::to_sam`] before rendering,
    /// so wire bytes carry read orientation while SAM text and records built
    /// from SAM stay alignment-oriented.
    pub fn reorient_strand(&mut self) {
        if self.flag & FLAG_REVERSE != 0 {
            self.seq = revcomp(&self.seq);
            self.qual.reverse();
        }
    }

    /// Encode to the BAM wire form, without the `block_size` prefix.
    /// Reverse-strand records are stored with SEQ reverse-complemented and
    /// QUAL reversed; the record's own fields stay alignment-oriented.
    pub fn encode(&self) -> SkaldResult<Vec<u8>> {
        if self.flag & FLAG_REVERSE != 0 && !self.seq.is_empty() {
            let mut stored = self.clone();
            stored.reorient_strand();
            return stored.encode_packed();
        }
        self.encode_packed()
    }

    /// Pack the fields exactly as they are.
    fn encode_packed(&self) -> SkaldResult<Vec<u8>> {
        if self.name.is_empty() || self.name.len() > 254 {
            return Err(SkaldError::BamRecord(format!(
                "read name length {} out of range", self.name.len())));
        }
        if self.cigar.len() > u16::MAX as usize {
            return Err(SkaldError::BamRecord("too many CIGAR ops".to_string()));
        }
        if !self.qual.is_empty() && self.qual.len() != self.seq.len() {
            return Err(SkaldError::BamRecord(format!(
                "QUAL length {} does not match SEQ length {}",
                self.qual.len(), self.seq.len())));
        }

        let mut out = Vec::with_capacity(
            32 + self.name.len() + 1 + self.cigar.len() * 4
            + (self.seq.len() + 1) / 2 + self.seq.len() + 16);

        out.write_i32::<LittleEndian>(self.ref_id).unwrap();
        out.write_i32::<LittleEndian>(self.pos).unwrap();
        out.write_u8(self.name.len() as u8 + 1).unwrap();
        out.write_u8(self.mapq).unwrap();
        out.write_u16::<LittleEndian>(self.bin()).unwrap();
        out.write_u16::<LittleEndian>(self.cigar.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(self.flag).unwrap();
        out.write_u32::<LittleEndian>(self.seq.len() as u32).unwrap();
        out.write_i32::<LittleEndian>(self.next_ref_id).unwrap();
        out.write_i32::<LittleEndian>(self.next_pos).unwrap();
        out.write_i32::<LittleEndian>(self.tlen).unwrap();

        out.extend_from_slice(self.name.as_bytes());
        out.push(0);

        for &(len, op) in &self.cigar {
            let packed = (len << 4) | cigar_code(op)?;
            out.write_u32::<LittleEndian>(packed).unwrap();
        }

        out.extend_from_slice(&pack_seq(&self.seq));
        if self.qual.is_empty() {
            out.resize(out.len() + self.seq.len(), 0xff);
        } else {
            out.extend_from_slice(&self.qual);
        }

        for tag in &self.tags {
            tag.encode(&mut out)?;
        }

        Ok(out)
    }

    /// Decode a BAM wire record (without the `block_size` prefix).
    pub fn decode(data: &[u8]) -> SkaldResult<BamRecord> {
        if data.len() < 32 {
            return Err(SkaldError::BamRecord(format!(
                "record of {} bytes is shorter than the fixed fields", data.len())));
        }

        let ref_id = LittleEndian::read_i32(&data[0..4]);
        let pos = LittleEndian::read_i32(&data[4..8]);
        let l_read_name = data[8] as usize;
        let mapq = data[9];
        // data[10..12] is the stored bin; recomputed on encode
        let n_cigar_op = LittleEndian::read_u16(&data[12..14]) as usize;
        let flag = LittleEndian::read_u16(&data[14..16]);
        let l_seq = LittleEndian::read_u32(&data[16..20]) as usize;
        let next_ref_id = LittleEndian::read_i32(&data[20..24]);
        let next_pos = LittleEndian::read_i32(&data[24..28]);
        let tlen = LittleEndian::read_i32(&data[28..32]);

        if l_read_name == 0 {
            return Err(SkaldError::BamRecord("read name length is zero".to_string()));
        }

        let mut at = 32usize;
        if data.len() < at + l_read_name {
            return Err(SkaldError::BamRecord("read name exceeds record".to_string()));
        }
        let name_bytes = &data[at..at + l_read_name - 1];
        let name = std::str::from_utf8(name_bytes)?.to_string();
        at += l_read_name;

        if data.len() < at + n_cigar_op * 4 {
            return Err(SkaldError::BamRecord("CIGAR exceeds record".to_string()));
        }
        let mut cigar = Vec::with_capacity(n_cigar_op);
        for i in 0..n_cigar_op {
            let packed = LittleEndian::read_u32(&data[at + i * 4..]);
            let code = (packed & 0xf) as usize;
            if code >= CIGAR_CHARS.len() {
                return Err(SkaldError::BamRecord(format!("bad CIGAR code {}", code)));
            }
            cigar.push((packed >> 4, CIGAR_CHARS[code]));
        }
        at += n_cigar_op * 4;

        let packed_len = (l_seq + 1) / 2;
        if data.len() < at + packed_len + l_seq {
            return Err(SkaldError::BamRecord(
                "SEQ/QUAL exceed record".to_string()));
        }
        let seq = unpack_seq(&data[at..at + packed_len], l_seq);
        at += packed_len;
        let qual_raw = &data[at..at + l_seq];
        let qual = if qual_raw.iter().all(|&q| q == 0xff) {
            Vec::new()
        } else {
            qual_raw.to_vec()
        };
        at += l_seq;

        let mut tags = Vec::new();
        while at < data.len() {
            let (tag, used) = AuxTag::decode(&data[at..])?;
            tags.push(tag);
            at += used;
        }

        Ok(BamRecord {
            ref_id: ref_id,
            pos: pos,
            mapq: mapq,
            flag: flag,
            next_ref_id: next_ref_id,
            next_pos: next_pos,
            tlen: tlen,
            name: name,
            cigar: cigar,
            seq: seq,
            qual: qual,
            tags: tags,
        })
    }

    /// Parse one SAM text line. `ref_ids` maps reference names to their ids.
    pub fn from_sam(line: &str, ref_ids: &HashMap<String, i32>) -> SkaldResult<BamRecord> {
        let fields: Vec<&str> = line.trim_end().split('\t').collect();
        if fields.len() < 11 {
            return Err(SkaldError::SamParse(format!(
                "{} fields in SAM line (needed 11)", fields.len())));
        }

        let lookup = |name: &str| -> SkaldResult<i32> {
            if name == "*" {
                return Ok(-1);
            }
            ref_ids.get(name).cloned().ok_or_else(|| {
                SkaldError::SamParse(format!("unknown reference {}", name))
            })
        };

        let ref_id = lookup(fields[2])?;
        let flag = fields[1].parse::<u16>()
            .map_err(|_| SkaldError::SamParse(format!("bad FLAG: {}", fields[1])))?;
        let pos = fields[3].parse::<i64>()
            .map_err(|_| SkaldError::SamParse(format!("bad POS: {}", fields[3])))? - 1;
        let mapq = fields[4].parse::<u8>()
            .map_err(|_| SkaldError::SamParse(format!("bad MAPQ: {}", fields[4])))?;
        let cigar = parse_cigar(fields[5])?;
        let next_ref_id = if fields[6] == "=" { ref_id } else { lookup(fields[6])? };
        let next_pos = fields[7].parse::<i64>()
            .map_err(|_| SkaldError::SamParse(format!("bad PNEXT: {}", fields[7])))? - 1;
        let tlen = fields[8].parse::<i32>()
            .map_err(|_| SkaldError::SamParse(format!("bad TLEN: {}", fields[8])))?;

        let seq = if fields[9] == "*" {
            Vec::new()
        } else {
            fields[9].as_bytes().to_vec()
        };
        let qual = if fields[10] == "*" {
            Vec::new()
        } else {
            fields[10].bytes().map(|b| b.wrapping_sub(33)).collect()
        };

        let mut tags = Vec::new();
        for field in &fields[11..] {
            tags.push(AuxTag::parse(field)?);
        }

        Ok(BamRecord {
            ref_id: ref_id,
            pos: pos as i32,
            mapq: mapq,
            flag: flag,
            next_ref_id: next_ref_id,
            next_pos: next_pos as i32,
            tlen: tlen,
            name: fields[0].to_string(),
            cigar: cigar,
            seq: seq,
            qual: qual,
            tags: tags,
        })
    }

    /// Render one SAM text line (no trailing newline). `refs` is the
    /// reference dictionary in id order. Decoded records carry wire
    /// (read-orientation) SEQ/QUAL, and SAM text is alignment-oriented, so
    /// reverse-strand records are flipped back before formatting.
    pub fn to_sam(&self, refs: &[(String, u32)]) -> SkaldResult<String> {
        if self.flag & FLAG_REVERSE != 0 && !self.seq.is_empty() {
            let mut aligned = self.clone();
            aligned.reorient_strand();
            return aligned.format_sam(refs);
        }
        self.format_sam(refs)
    }

    /// Format the fields exactly as they are.
    fn format_sam(&self, refs: &[(String, u32)]) -> SkaldResult<String> {
        let rname = |id: i32| -> SkaldResult<String> {
            if id < 0 {
                return Ok("*".to_string());
            }
            refs.get(id as usize)
                .map(|&(ref name, _)| name.clone())
                .ok_or_else(|| SkaldError::BamRecord(format!(
                    "refID {} out of bounds ({} references)", id, refs.len())))
        };

        let rnext = if self.next_ref_id >= 0 && self.next_ref_id == self.ref_id {
            "=".to_string()
        } else {
            rname(self.next_ref_id)?
        };

        let seq = if self.seq.is_empty() {
            "*".to_string()
        } else {
            String::from_utf8_lossy(&self.seq).into_owned()
        };
        let qual = if self.qual.is_empty() {
            "*".to_string()
        } else {
            self.qual.iter().map(|&q| (q + 33) as char).collect()
        };

        let mut line = format!("{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                               self.name,
                               self.flag,
                               rname(self.ref_id)?,
                               self.pos as i64 + 1,
                               self.mapq,
                               cigar_text(&self.cigar),
                               rnext,
                               self.next_pos as i64 + 1,
                               self.tlen,
                               seq,
                               qual);
        for tag in &self.tags {
            line.push('\t');
            line.push_str(&tag.to_text());
        }
        Ok(line)
    }
}
