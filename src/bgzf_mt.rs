//! Multithreaded BGZF codec: one I/O producer, a pool of (de)compression
//! workers, and an ordered consumer, coordinated by the ordered queue
//! system. Compressed blocks hit the file in strict input order; the
//! decompressed byte stream is identical to the single-threaded codec's.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::bgzf::{deflate_wire_block, inflate_wire_block, read_wire_block,
                  virtual_offset, BlockRead, BlockWrite, EOF_BLOCK};
use crate::config::BgzfConfig;
use crate::error::*;
use crate::ordered_queue::{Job, JobKind, OrderedQueueSystem};

type ErrorSlot = Arc<Mutex<Option<SkaldError>>>;

fn record_error(slot: &ErrorSlot, error: SkaldError) {
    let mut guard = slot.lock().unwrap();
    if guard.is_none() {
        *guard = Some(error);
    }
}

fn take_error(slot: &ErrorSlot) -> Option<SkaldError> {
    slot.lock().unwrap().take()
}

/// Multithreaded BGZF writer: the caller's writes are chopped into payload
/// blocks, deflated by a worker pool, and written to the sink in order by a
/// dedicated drain thread.
pub struct BgzfWriterMt<W: Write + Send + 'static> {
    queue: Arc<OrderedQueueSystem<Vec<u8>>>,
    error: ErrorSlot,
    workers: Vec<JoinHandle<()>>,
    drainer: Option<JoinHandle<()>>,
    sink_slot: Arc<Mutex<Option<W>>>,
    buf: Vec<u8>,
    block_size: usize,
    next_id: u64,
    finished: bool,
}

impl<W: Write + Send + 'static> BgzfWriterMt<W> {
    /// Spawn the codec threads over `inner`.
    pub fn new(inner: W, cfg: &BgzfConfig) -> BgzfWriterMt<W> {
        let queue: Arc<OrderedQueueSystem<Vec<u8>>> =
            Arc::new(OrderedQueueSystem::new(cfg.queue_capacity, cfg.queue_capacity));
        let error: ErrorSlot = Arc::new(Mutex::new(None));

        let mut workers = Vec::with_capacity(cfg.threads);
        for _ in 0..cfg.threads {
            let queue = queue.clone();
            let error = error.clone();
            let level = cfg.level;
            workers.push(thread::spawn(move || {
                loop {
                    let job = queue.take_input();
                    match job.kind {
                        JobKind::Data(payload) => {
                            match deflate_wire_block(&payload, level) {
                                Ok(block) => {
                                    if !queue.add_output(Job::data(job.id, block)) {
                                        return;
                                    }
                                },
                                Err(e) => {
                                    record_error(&error, e);
                                    queue.cancel();
                                    return;
                                },
                            }
                        },
                        _ => return,
                    }
                }
            }));
        }

        let sink_slot: Arc<Mutex<Option<W>>> = Arc::new(Mutex::new(None));
        let drainer = {
            let queue = queue.clone();
            let error = error.clone();
            let sink_slot = sink_slot.clone();
            thread::spawn(move || {
                let mut sink = inner;
                while let Some(block) = queue.get_output() {
                    if let Err(e) = sink.write_all(&block) {
                        record_error(&error, SkaldError::Io(e));
                        queue.cancel();
                        break;
                    }
                }
                if !queue.is_cancelled() {
                    if let Err(e) = sink.write_all(&EOF_BLOCK).and_then(|_| sink.flush()) {
                        record_error(&error, SkaldError::Io(e));
                    }
                }
                *sink_slot.lock().unwrap() = Some(sink);
            })
        };

        BgzfWriterMt {
            queue: queue,
            error: error,
            workers: workers,
            drainer: Some(drainer),
            sink_slot: sink_slot,
            buf: Vec::with_capacity(cfg.block_size),
            block_size: cfg.block_size,
            next_id: 0,
            finished: false,
        }
    }

    fn submit_block(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let payload = std::mem::replace(&mut self.buf,
                                        Vec::with_capacity(self.block_size));
        let id = self.next_id;
        self.next_id += 1;
        if !self.queue.add_input(Job::data(id, payload)) {
            return Err(self.surface_error());
        }
        Ok(())
    }

    fn surface_error(&self) -> io::Error {
        match take_error(&self.error) {
            Some(e) => io::Error::new(io::ErrorKind::Other, e.to_string()),
            None => io::Error::new(io::ErrorKind::Other,
                                   "BGZF writer stream closed".to_string()),
        }
    }

    /// Finish the stream and hand the sink back.
    pub fn finish(mut self) -> io::Result<W> {
        self.finish_blocks()?;
        match self.sink_slot.lock().unwrap().take() {
            Some(sink) => Ok(sink),
            None => Err(io::Error::new(io::ErrorKind::Other,
                                       "BGZF drain thread lost the sink")),
        }
    }
}

impl<W: Write + Send + 'static> Write for BgzfWriterMt<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let room = self.block_size - self.buf.len();
            let take = room.min(remaining.len());
            self.buf.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if self.buf.len() >= self.block_size {
                self.submit_block()?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.submit_block()
    }
}

impl<W: Write + Send + 'static> BlockWrite for BgzfWriterMt<W> {
    /// Flush pending payload, stop the pool, and wait for the drain thread
    /// to emit the EOF block.
    fn finish_blocks(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.submit_block()?;
        self.queue.poison();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        // the drainer exits once LAST comes off the heap, depositing the sink
        if let Some(drainer) = self.drainer.take() {
            if drainer.join().is_err() {
                return Err(io::Error::new(io::ErrorKind::Other,
                                          "BGZF drain thread panicked"));
            }
        }

        if let Some(e) = take_error(&self.error) {
            return Err(io::Error::new(io::ErrorKind::Other, e.to_string()));
        }
        Ok(())
    }
}

impl<W: Write + Send + 'static> Drop for BgzfWriterMt<W> {
    fn drop(&mut self) {
        if !self.finished {
            self.queue.cancel();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(drainer) = self.drainer.take() {
            let _ = drainer.join();
        }
    }
}

/// Multithreaded BGZF reader: a producer thread splits the compressed stream
/// into wire blocks, workers inflate them, and `read` serves the payloads in
/// order with virtual offsets intact.
pub struct BgzfReaderMt {
    queue: Arc<OrderedQueueSystem<(u64, Vec<u8>)>>,
    error: ErrorSlot,
    producer: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    block: Vec<u8>,
    pos: usize,
    block_start: u64,
    done: bool,
}

impl BgzfReaderMt {
    /// Spawn the codec threads over `inner`.
    pub fn new<R: Read + Send + 'static>(inner: R, cfg: &BgzfConfig) -> BgzfReaderMt {
        let queue: Arc<OrderedQueueSystem<(u64, Vec<u8>)>> =
            Arc::new(OrderedQueueSystem::new(cfg.queue_capacity, cfg.queue_capacity));
        let error: ErrorSlot = Arc::new(Mutex::new(None));

        let producer = {
            let queue = queue.clone();
            let error = error.clone();
            thread::spawn(move || {
                let mut source = inner;
                let mut offset = 0u64;
                let mut id = 0u64;
                loop {
                    match read_wire_block(&mut source) {
                        Ok(Some(wire)) => {
                            let start = offset;
                            offset += wire.len() as u64;
                            if !queue.add_input(Job::data(id, (start, wire))) {
                                return;
                            }
                            id += 1;
                        },
                        Ok(None) => {
                            queue.poison();
                            return;
                        },
                        Err(e) => {
                            record_error(&error, e);
                            queue.poison();
                            return;
                        },
                    }
                }
            })
        };

        let mut workers = Vec::with_capacity(cfg.threads);
        for _ in 0..cfg.threads {
            let queue = queue.clone();
            let error = error.clone();
            workers.push(thread::spawn(move || {
                loop {
                    let job = queue.take_input();
                    match job.kind {
                        JobKind::Data((start, wire)) => {
                            match inflate_wire_block(&wire) {
                                Ok(payload) => {
                                    if !queue.add_output(Job::data(job.id,
                                                                   (start, payload))) {
                                        return;
                                    }
                                },
                                Err(e) => {
                                    record_error(&error, e);
                                    queue.cancel();
                                    return;
                                },
                            }
                        },
                        _ => return,
                    }
                }
            }));
        }

        BgzfReaderMt {
            queue: queue,
            error: error,
            producer: Some(producer),
            workers: workers,
            block: Vec::new(),
            pos: 0,
            block_start: 0,
            done: false,
        }
    }

    fn next_block(&mut self) -> io::Result<bool> {
        match self.queue.get_output() {
            Some((start, payload)) => {
                self.block_start = start;
                self.block = payload;
                self.pos = 0;
                Ok(true)
            },
            None => {
                self.done = true;
                match take_error(&self.error) {
                    Some(e) => Err(io::Error::new(io::ErrorKind::InvalidData,
                                                  e.to_string())),
                    None => Ok(false),
                }
            },
        }
    }
}

impl BlockRead for BgzfReaderMt {
    fn virtual_offset(&self) -> u64 {
        virtual_offset(self.block_start, self.pos)
    }
}

impl Read for BgzfReaderMt {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.block.len() {
            if self.done {
                return Ok(0);
            }
            if !self.next_block()? {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.block.len() - self.pos);
        buf[..n].copy_from_slice(&self.block[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Drop for BgzfReaderMt {
    fn drop(&mut self) {
        self.queue.cancel();
        if let Some(producer) = self.producer.take() {
            let _ = producer.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
