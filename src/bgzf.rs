//! BGZF block codec: single-threaded reader and writer plus the shared
//! block-level primitives used by the multithreaded variants.
//!
//! A BGZF file is a series of independent gzip members, each at most 64 KiB
//! compressed and uncompressed, carrying a `BC` FEXTRA subfield with the
//! total block length minus one. The payload is raw deflate followed by the
//! CRC32 and ISIZE of the uncompressed bytes. A distinguished 28-byte empty
//! block marks EOF. Virtual offsets pack (compressed block start << 16) |
//! in-block position.

use byteorder::{ByteOrder, LittleEndian};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io::{self, Read, Write};

use crate::error::*;

/// Hard cap on a block, compressed or not.
pub const MAX_BLOCK_SIZE: usize = 65536;
/// Default uncompressed payload cap; leaves headroom so worst-case deflate
/// output still fits in a block.
pub const DEFAULT_BLOCK_SIZE: usize = 0xff00;
/// Fixed gzip header length up to and including the BC subfield.
pub const BLOCK_HEADER_LEN: usize = 18;
/// CRC32 + ISIZE trailer length.
pub const BLOCK_FOOTER_LEN: usize = 8;

/// The distinguished empty block written exactly once, always last.
pub const EOF_BLOCK: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00,
    0x42, 0x43, 0x02, 0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// Pack a compressed block start and an in-block position into a virtual
/// offset.
#[inline]
pub fn virtual_offset(block_start: u64, in_block: usize) -> u64 {
    (block_start << 16) | in_block as u64
}

/// Compress one payload into a complete wire block. Payloads whose deflate
/// output would overflow the block cap are re-compressed stored, which always
/// fits for payloads up to the default block size.
pub fn deflate_wire_block(payload: &[u8], level: u32) -> SkaldResult<Vec<u8>> {
    debug_assert!(payload.len() <= DEFAULT_BLOCK_SIZE);

    let body = deflate_raw(payload, Compression::new(level))?;
    let body = if BLOCK_HEADER_LEN + body.len() + BLOCK_FOOTER_LEN > MAX_BLOCK_SIZE {
        deflate_raw(payload, Compression::none())?
    } else {
        body
    };

    let total = BLOCK_HEADER_LEN + body.len() + BLOCK_FOOTER_LEN;
    if total > MAX_BLOCK_SIZE {
        return Err(SkaldError::Bgzf(format!(
            "block of {} payload bytes will not fit even stored", payload.len())));
    }

    let mut crc = flate2::Crc::new();
    crc.update(payload);

    let mut block = Vec::with_capacity(total);
    block.extend_from_slice(&[0x1f, 0x8b, 0x08, 0x04]); // magic, deflate, FEXTRA
    block.extend_from_slice(&[0, 0, 0, 0]); // MTIME
    block.extend_from_slice(&[0x00, 0xff]); // XFL, OS
    block.extend_from_slice(&[0x06, 0x00]); // XLEN = 6
    block.extend_from_slice(&[b'B', b'C', 0x02, 0x00]); // BC subfield, SLEN = 2
    let mut bsize = [0u8; 2];
    LittleEndian::write_u16(&mut bsize, (total - 1) as u16);
    block.extend_from_slice(&bsize);
    block.extend_from_slice(&body);
    let mut footer = [0u8; 8];
    LittleEndian::write_u32(&mut footer[0..4], crc.sum());
    LittleEndian::write_u32(&mut footer[4..8], payload.len() as u32);
    block.extend_from_slice(&footer);

    Ok(block)
}

fn deflate_raw(payload: &[u8], level: Compression) -> SkaldResult<Vec<u8>> {
    let mut compressor = Compress::new(level, false);
    let mut out = Vec::with_capacity(payload.len() / 2 + 64);

    loop {
        let consumed = compressor.total_in() as usize;
        let status = compressor
            .compress_vec(&payload[consumed..], &mut out, FlushCompress::Finish)
            .map_err(|e| SkaldError::Bgzf(format!("deflate failed: {}", e)))?;
        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => out.reserve(4096),
        }
    }
}

/// Read one whole wire block, or `None` at a clean end of stream.
pub fn read_wire_block<R: Read>(reader: &mut R) -> SkaldResult<Option<Vec<u8>>> {
    let mut header = [0u8; 12];
    let mut filled = 0usize;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(SkaldError::Bgzf("truncated block header".to_string()));
        }
        filled += n;
    }

    if header[0] != 0x1f || header[1] != 0x8b {
        return Err(SkaldError::Bgzf("bad gzip magic".to_string()));
    }
    if header[2] != 0x08 {
        return Err(SkaldError::Bgzf(format!("unexpected compression method {}",
                                            header[2])));
    }
    if header[3] & 0x04 == 0 {
        return Err(SkaldError::Bgzf("FEXTRA flag missing".to_string()));
    }

    let xlen = LittleEndian::read_u16(&header[10..12]) as usize;
    let mut extra = vec![0u8; xlen];
    reader.read_exact(&mut extra)
        .map_err(|_| SkaldError::Bgzf("truncated extra field".to_string()))?;

    let mut bsize: Option<usize> = None;
    let mut i = 0usize;
    while i + 4 <= xlen {
        let slen = LittleEndian::read_u16(&extra[i + 2..i + 4]) as usize;
        if extra[i] == b'B' && extra[i + 1] == b'C' && slen == 2 {
            if i + 6 > xlen {
                return Err(SkaldError::Bgzf("truncated BC subfield".to_string()));
            }
            bsize = Some(LittleEndian::read_u16(&extra[i + 4..i + 6]) as usize + 1);
        }
        i += 4 + slen;
    }
    let total = match bsize {
        Some(t) => t,
        None => return Err(SkaldError::Bgzf("missing BC subfield".to_string())),
    };

    if total > MAX_BLOCK_SIZE || total < 12 + xlen + BLOCK_FOOTER_LEN {
        return Err(SkaldError::Bgzf(format!("implausible BSIZE {}", total)));
    }

    let mut block = Vec::with_capacity(total);
    block.extend_from_slice(&header);
    block.extend_from_slice(&extra);
    let rest = total - 12 - xlen;
    let mut tail = vec![0u8; rest];
    reader.read_exact(&mut tail)
        .map_err(|_| SkaldError::Bgzf("truncated block body".to_string()))?;
    block.extend_from_slice(&tail);

    Ok(Some(block))
}

/// Inflate a wire block's payload, verifying CRC32 and ISIZE.
pub fn inflate_wire_block(block: &[u8]) -> SkaldResult<Vec<u8>> {
    if block.len() < 12 + BLOCK_FOOTER_LEN {
        return Err(SkaldError::Bgzf("block shorter than fixed fields".to_string()));
    }
    let xlen = LittleEndian::read_u16(&block[10..12]) as usize;
    let body_start = 12 + xlen;
    let body_end = block.len() - BLOCK_FOOTER_LEN;
    if body_start > body_end {
        return Err(SkaldError::Bgzf("extra field overruns block".to_string()));
    }

    let expected_crc = LittleEndian::read_u32(&block[body_end..body_end + 4]);
    let expected_isize = LittleEndian::read_u32(&block[body_end + 4..]);

    let body = &block[body_start..body_end];
    if body.is_empty() {
        return if expected_isize == 0 && expected_crc == 0 {
            Ok(Vec::new())
        } else {
            Err(SkaldError::Bgzf("empty deflate body with nonzero ISIZE".to_string()))
        };
    }

    let mut decompressor = Decompress::new(false);
    let mut out = Vec::with_capacity((expected_isize as usize).min(MAX_BLOCK_SIZE));

    loop {
        let consumed = decompressor.total_in() as usize;
        let produced = out.len();
        let status = decompressor
            .decompress_vec(&body[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|e| SkaldError::Bgzf(format!("inflate failed: {}", e)))?;
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if out.len() > MAX_BLOCK_SIZE {
                    return Err(SkaldError::Bgzf("payload exceeds 64 KiB".to_string()));
                }
                let progressed = decompressor.total_in() as usize > consumed
                                 || out.len() > produced;
                if !progressed && out.len() < out.capacity() {
                    return Err(SkaldError::Bgzf("deflate stream stalled".to_string()));
                }
                out.reserve(8192);
            },
        }
    }

    if out.len() as u32 != expected_isize {
        return Err(SkaldError::Bgzf(format!(
            "ISIZE mismatch: expected {}, inflated {}", expected_isize, out.len())));
    }
    let mut crc = flate2::Crc::new();
    crc.update(&out);
    if crc.sum() != expected_crc {
        return Err(SkaldError::Bgzf("CRC32 mismatch".to_string()));
    }

    Ok(out)
}

/// Readers that decode BGZF and can report the current virtual offset.
pub trait BlockRead: Read {
    /// Virtual offset of the next byte this reader will return.
    fn virtual_offset(&self) -> u64;
}

/// Writers that encode BGZF: byte-oriented writes plus an explicit finish
/// that flushes pending data and emits the EOF block exactly once.
pub trait BlockWrite: Write {
    /// Flush pending payload and append the EOF block.
    fn finish_blocks(&mut self) -> io::Result<()>;
}

/// Single-threaded BGZF reader.
pub struct BgzfReader<R: Read> {
    inner: R,
    block: Vec<u8>,
    pos: usize,
    block_start: u64,
    next_offset: u64,
    eof: bool,
}

impl<R: Read> BgzfReader<R> {
    /// Wrap a compressed source.
    pub fn new(inner: R) -> BgzfReader<R> {
        BgzfReader {
            inner: inner,
            block: Vec::new(),
            pos: 0,
            block_start: 0,
            next_offset: 0,
            eof: false,
        }
    }

    /// Decode the next block into the buffer. False at end of stream. Empty
    /// blocks (EOF marker included) yield zero payload bytes and reading
    /// simply continues with the following block.
    fn next_block(&mut self) -> SkaldResult<bool> {
        match read_wire_block(&mut self.inner)? {
            Some(wire) => {
                self.block_start = self.next_offset;
                self.next_offset += wire.len() as u64;
                self.block = inflate_wire_block(&wire)?;
                self.pos = 0;
                Ok(true)
            },
            None => {
                self.eof = true;
                Ok(false)
            },
        }
    }

    /// Pull one byte; `None` at end of stream.
    pub fn read_byte(&mut self) -> SkaldResult<Option<u8>> {
        while self.pos >= self.block.len() {
            if self.eof || !self.next_block()? {
                return Ok(None);
            }
        }
        let b = self.block[self.pos];
        self.pos += 1;
        Ok(Some(b))
    }
}

impl<R: Read> BlockRead for BgzfReader<R> {
    fn virtual_offset(&self) -> u64 {
        virtual_offset(self.block_start, self.pos)
    }
}

impl<R: Read> Read for BgzfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.block.len() {
            if self.eof {
                return Ok(0);
            }
            match self.next_block() {
                Ok(true) => (),
                Ok(false) => return Ok(0),
                Err(e) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData,
                                              e.to_string()));
                },
            }
        }
        let n = buf.len().min(self.block.len() - self.pos);
        buf[..n].copy_from_slice(&self.block[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Single-threaded BGZF writer.
pub struct BgzfWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
    block_size: usize,
    level: u32,
    offset: u64,
    eof_written: bool,
}

impl<W: Write> BgzfWriter<W> {
    /// Wrap a sink with the default block size and level.
    pub fn new(inner: W) -> BgzfWriter<W> {
        BgzfWriter::with_params(inner, DEFAULT_BLOCK_SIZE, 6)
    }

    /// Wrap a sink with an explicit payload cap and deflate level.
    pub fn with_params(inner: W, block_size: usize, level: u32) -> BgzfWriter<W> {
        BgzfWriter {
            inner: inner,
            buf: Vec::with_capacity(block_size),
            block_size: block_size.min(DEFAULT_BLOCK_SIZE).max(1),
            level: level,
            offset: 0,
            eof_written: false,
        }
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let block = deflate_wire_block(&self.buf, self.level)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.inner.write_all(&block)?;
        self.offset += block.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// Virtual offset the next written byte will land at.
    pub fn virtual_offset(&self) -> u64 {
        virtual_offset(self.offset, self.buf.len())
    }

    /// Consume the writer, finishing the stream, and hand the sink back.
    pub fn finish(mut self) -> io::Result<W> {
        self.finish_blocks()?;
        Ok(self.inner)
    }
}

impl<W: Write> BlockWrite for BgzfWriter<W> {
    fn finish_blocks(&mut self) -> io::Result<()> {
        if self.eof_written {
            return Ok(());
        }
        self.flush_block()?;
        self.inner.write_all(&EOF_BLOCK)?;
        self.offset += EOF_BLOCK.len() as u64;
        self.eof_written = true;
        self.inner.flush()
    }
}

impl<W: Write> Write for BgzfWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let room = self.block_size - self.buf.len();
            let take = room.min(remaining.len());
            self.buf.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if self.buf.len() >= self.block_size {
                self.flush_block()?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()?;
        self.inner.flush()
    }
}
