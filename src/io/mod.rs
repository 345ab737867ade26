//! Buffered, cancellable byte streams.
//!
//! A [`BufferedStream`] owns a fixed-size ring buffer filled by one background
//! thread from a [`Source`] (a local file or an HTTP stream). The decoding
//! thread is the single consumer. Every blocking wait on either side is sliced
//! so an [`abort`](BufferedStream::abort) is noticed promptly.

pub mod http;
pub mod source;

use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use thiserror::Error;

pub use http::HttpSource;
pub use source::{FileSource, MemorySource, Source};

const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("cannot open {0}: {1}")]
    Open(String, #[source] io::Error),
    #[error("connection to {0} failed: {1}")]
    Connect(String, String),
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error("unsupported location: {0}")]
    Unsupported(String),
    #[error("stream is not seekable")]
    NotSeekable,
    #[error("seek to {offset} is past the end of the stream ({size} bytes)")]
    OutOfRange { offset: u64, size: u64 },
    #[error("stream aborted")]
    Aborted,
    #[error("read error: {0}")]
    Read(String),
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub buffer_size: usize,
    /// Bytes to buffer before `open` returns for non-seekable sources.
    pub prebuffer: usize,
    pub connect_timeout: Duration,
    /// How long a network source may deliver nothing before the stream fails.
    pub stall_timeout: Duration,
    pub read_chunk: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            buffer_size: 256 * 1024,
            prebuffer: 32 * 1024,
            connect_timeout: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(30),
            read_chunk: 16 * 1024,
        }
    }
}

struct State {
    ring: HeapRb<u8>,
    /// Consumer position in the source.
    pos: u64,
    eof: bool,
    error: Option<String>,
    aborted: bool,
    title: Option<String>,
}

struct Shared {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
    source: Mutex<Box<dyn Source>>,
    mime: Option<String>,
}

impl Shared {
    fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

/// Cloneable control handle onto a stream; lets another thread cancel it or
/// read live stream metadata without touching the consumer side.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl StreamHandle {
    pub fn abort(&self) {
        self.shared.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.state.lock().aborted
    }

    pub fn stream_title(&self) -> Option<String> {
        self.shared.state.lock().title.clone()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.shared.mime.as_deref()
    }
}

pub struct BufferedStream {
    location: String,
    shared: Arc<Shared>,
    fill: Option<JoinHandle<()>>,
    seekable: bool,
    size: Option<u64>,
    mime: Option<String>,
}

impl BufferedStream {
    /// Opens a local path or an `http(s)://` URL and starts filling immediately.
    pub fn open(location: &str, options: &StreamOptions) -> Result<Self, StreamError> {
        if http::is_http_url(location) {
            let source = HttpSource::connect(location, options)?;
            let mut stream = Self::from_source(location, Box::new(source), options)?;
            if options.prebuffer > 0 {
                stream.prebuffer(options.prebuffer)?;
            }
            return Ok(stream);
        }
        if location.contains("://") {
            return Err(StreamError::Unsupported(location.to_string()));
        }
        Self::open_path(location, options)
    }

    pub fn open_path<P: AsRef<Path>>(path: P, options: &StreamOptions) -> Result<Self, StreamError> {
        let path = path.as_ref();
        let location = path.display().to_string();
        let source = FileSource::open(path).map_err(|e| StreamError::Open(location.clone(), e))?;
        Self::from_source(location, Box::new(source), options)
    }

    pub fn from_source(
        location: impl Into<String>,
        source: Box<dyn Source>,
        options: &StreamOptions,
    ) -> Result<Self, StreamError> {
        let location = location.into();
        let seekable = source.is_seekable();
        let size = source.size();
        let mime = source.mime_type();

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                ring: HeapRb::new(options.buffer_size.max(1)),
                pos: 0,
                eof: false,
                error: None,
                aborted: false,
                title: None,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            source: Mutex::new(source),
            mime: mime.clone(),
        });

        let chunk = options.read_chunk.max(1);
        let stall_timeout = options.stall_timeout;
        let fill_shared = shared.clone();
        let fill = thread::Builder::new()
            .name("tapedeck-fill".into())
            .spawn(move || fill_loop(fill_shared, chunk, stall_timeout))
            .map_err(|e| StreamError::Open(location.clone(), e))?;

        debug!("Opened buffered stream {} (seekable: {}, size: {:?})", location, seekable, size);
        Ok(Self {
            location,
            shared,
            fill: Some(fill),
            seekable,
            size,
            mime,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn handle(&self) -> StreamHandle {
        StreamHandle { shared: self.shared.clone() }
    }

    /// Blocks until `buf` is full; returns less only at end of stream or
    /// after an abort.
    pub fn read_buf(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let mut filled = 0;
        let mut state = self.shared.state.lock();
        while filled < buf.len() {
            if state.aborted {
                break;
            }
            if !state.ring.is_empty() {
                let n = state.ring.pop_slice(&mut buf[filled..]);
                filled += n;
                state.pos += n as u64;
                self.shared.writable.notify_one();
                continue;
            }
            if let Some(error) = &state.error {
                if filled == 0 {
                    return Err(StreamError::Read(error.clone()));
                }
                break;
            }
            if state.eof {
                break;
            }
            self.shared.readable.wait_for(&mut state, WAIT_SLICE);
        }
        Ok(filled)
    }

    /// Like `read_buf` but leaves the bytes in the buffer. At most the ring
    /// capacity can be peeked.
    pub fn peek(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let mut state = self.shared.state.lock();
        let want = buf.len().min(state.ring.capacity().get());
        loop {
            if state.aborted {
                return Ok(0);
            }
            if state.ring.occupied_len() >= want || state.eof {
                break;
            }
            if let Some(error) = &state.error {
                if state.ring.is_empty() {
                    return Err(StreamError::Read(error.clone()));
                }
                break;
            }
            self.shared.readable.wait_for(&mut state, WAIT_SLICE);
        }
        let (head, tail) = state.ring.as_slices();
        let n = want.min(head.len() + tail.len());
        let from_head = n.min(head.len());
        buf[..from_head].copy_from_slice(&head[..from_head]);
        buf[from_head..n].copy_from_slice(&tail[..n - from_head]);
        Ok(n)
    }

    /// Waits until `bytes` are buffered, the stream ends, or it is aborted.
    pub fn prebuffer(&mut self, bytes: usize) -> Result<(), StreamError> {
        let mut state = self.shared.state.lock();
        let want = bytes.min(state.ring.capacity().get());
        debug!("Prebuffering {} bytes of {}", want, self.location);
        while state.ring.occupied_len() < want && !state.eof {
            if state.aborted {
                return Err(StreamError::Aborted);
            }
            if let Some(error) = &state.error {
                return Err(StreamError::Read(error.clone()));
            }
            self.shared.readable.wait_for(&mut state, WAIT_SLICE);
        }
        Ok(())
    }

    /// Repositions to an absolute byte offset. Failure leaves the stream as it was.
    pub fn seek_to(&mut self, offset: u64) -> Result<u64, StreamError> {
        if !self.seekable {
            return Err(StreamError::NotSeekable);
        }
        if let Some(size) = self.size {
            if offset > size {
                return Err(StreamError::OutOfRange { offset, size });
            }
        }

        {
            let mut state = self.shared.state.lock();
            if state.aborted {
                return Err(StreamError::Aborted);
            }
            if offset >= state.pos && offset - state.pos <= state.ring.occupied_len() as u64 {
                let skip = (offset - state.pos) as usize;
                state.ring.skip(skip);
                state.pos = offset;
                self.shared.writable.notify_one();
                trace!("Seek to {} served from buffer", offset);
                return Ok(offset);
            }
        }

        let mut source = self.shared.source.lock();
        let mut state = self.shared.state.lock();
        source
            .seek(offset)
            .map_err(|e| StreamError::Read(e.to_string()))?;
        state.ring.clear();
        state.pos = offset;
        state.eof = false;
        state.error = None;
        self.shared.writable.notify_all();
        trace!("Seek to {} restarted fill", offset);
        Ok(offset)
    }

    pub fn tell(&self) -> u64 {
        self.shared.state.lock().pos
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    /// True once everything the source delivered has been consumed.
    pub fn eof(&self) -> bool {
        let state = self.shared.state.lock();
        state.eof && state.ring.is_empty()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    pub fn stream_title(&self) -> Option<String> {
        self.shared.state.lock().title.clone()
    }

    pub fn abort(&self) {
        self.shared.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.state.lock().aborted
    }

    /// Stops the fill thread and waits for it; nothing is written to the
    /// buffer after this returns.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(fill) = self.fill.take() {
            self.shared.abort();
            if fill.join().is_err() {
                warn!("Fill thread of {} panicked", self.location);
            }
            debug!("Closed buffered stream {}", self.location);
        }
    }
}

impl Drop for BufferedStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Read for BufferedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_buf(buf).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl Seek for BufferedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.tell().checked_add_signed(delta),
            SeekFrom::End(delta) => self.size.and_then(|size| size.checked_add_signed(delta)),
        };
        let target = target.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid seek target"))?;
        if target == self.tell() {
            return Ok(target);
        }
        self.seek_to(target).map_err(|e| match e {
            StreamError::NotSeekable => io::Error::new(io::ErrorKind::Unsupported, e),
            other => io::Error::new(io::ErrorKind::InvalidInput, other),
        })
    }
}

fn fill_loop(shared: Arc<Shared>, chunk: usize, stall_timeout: Duration) {
    let mut buf = vec![0u8; chunk];
    let mut idle_since: Option<Instant> = None;
    loop {
        {
            let mut state = shared.state.lock();
            loop {
                if state.aborted {
                    trace!("Fill thread stopping");
                    return;
                }
                if !state.eof && state.error.is_none() && state.ring.vacant_len() > 0 {
                    break;
                }
                shared.writable.wait_for(&mut state, WAIT_SLICE);
            }
        }

        // The source stays locked from choosing the read size until the bytes
        // are stored, so a seek lands either before or after a whole chunk.
        let mut source = shared.source.lock();
        let want = {
            let state = shared.state.lock();
            if state.aborted || state.eof || state.error.is_some() || state.ring.is_full() {
                continue;
            }
            state.ring.vacant_len().min(chunk)
        };
        let result = source.read(&mut buf[..want]);
        let title = source.take_title();

        let mut state = shared.state.lock();
        drop(source);
        if title.is_some() {
            state.title = title;
        }
        match result {
            Ok(0) => {
                trace!("Source reached end of stream");
                state.eof = true;
            }
            Ok(n) => {
                state.ring.push_slice(&buf[..n]);
                idle_since = None;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                let since = *idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() < stall_timeout {
                    continue;
                }
                warn!("Source stalled for {:?}", stall_timeout);
                state.error = Some("source stalled".into());
            }
            Err(e) => {
                warn!("Source read failed: {}", e);
                state.error = Some(e.to_string());
            }
        }
        shared.readable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn small_options() -> StreamOptions {
        StreamOptions {
            buffer_size: 1024,
            read_chunk: 100,
            ..StreamOptions::default()
        }
    }

    /// Never delivers anything; reports `WouldBlock` like an idle socket.
    struct IdleSource;

    impl Source for IdleSource {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(10));
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    #[test]
    fn test_reads_whole_source_through_small_ring() {
        let data = pattern(10_000);
        let mut stream =
            BufferedStream::from_source("mem", Box::new(MemorySource::new(data.clone())), &small_options()).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert!(stream.eof());
        assert_eq!(stream.tell(), 10_000);
    }

    #[test]
    fn test_peek_then_read_sees_same_bytes() {
        let data = pattern(4096);
        let mut stream =
            BufferedStream::from_source("mem", Box::new(MemorySource::new(data.clone())), &small_options()).unwrap();
        let mut head = [0u8; 64];
        assert_eq!(stream.peek(&mut head).unwrap(), 64);
        let mut first = [0u8; 64];
        assert_eq!(stream.read_buf(&mut first).unwrap(), 64);
        assert_eq!(head, first);
        assert_eq!(stream.tell(), 64);
    }

    #[test]
    fn test_seek_restarts_fill_at_offset() {
        let data = pattern(50_000);
        let mut stream =
            BufferedStream::from_source("mem", Box::new(MemorySource::new(data.clone())), &small_options()).unwrap();
        let mut buf = [0u8; 10];
        stream.read_buf(&mut buf).unwrap();

        assert_eq!(stream.seek_to(40_000).unwrap(), 40_000);
        stream.read_buf(&mut buf).unwrap();
        assert_eq!(&buf[..], &data[40_000..40_010]);

        // backwards
        stream.seek_to(5).unwrap();
        stream.read_buf(&mut buf).unwrap();
        assert_eq!(&buf[..], &data[5..15]);
    }

    #[test]
    fn test_peek_across_ring_wrap() {
        let data = pattern(4096);
        let mut stream =
            BufferedStream::from_source("mem", Box::new(MemorySource::new(data.clone())), &small_options()).unwrap();
        let mut skip = [0u8; 1000];
        stream.read_buf(&mut skip).unwrap();
        let mut head = [0u8; 500];
        assert_eq!(stream.peek(&mut head).unwrap(), 500);
        assert_eq!(&head[..], &data[1000..1500]);
        assert_eq!(stream.tell(), 1000);
    }

    #[test]
    fn test_seeks_while_filling_keep_offsets() {
        let data = pattern(2_000_000);
        let options = StreamOptions {
            buffer_size: 1 << 20,
            read_chunk: 64,
            ..StreamOptions::default()
        };
        let mut stream =
            BufferedStream::from_source("mem", Box::new(MemorySource::new(data.clone())), &options).unwrap();
        let mut buf = [0u8; 16];
        for i in 0..200u64 {
            let offset = if i % 2 == 0 { (i * 5) % 1000 } else { 1_500_000 + i * 7 };
            stream.seek_to(offset).unwrap();
            assert_eq!(stream.read_buf(&mut buf).unwrap(), 16);
            let at = offset as usize;
            assert_eq!(&buf[..], &data[at..at + 16], "wrong bytes after seek to {offset}");
        }
    }

    #[test]
    fn test_seek_past_end_fails_and_keeps_position() {
        let data = pattern(2000);
        let mut stream =
            BufferedStream::from_source("mem", Box::new(MemorySource::new(data.clone())), &small_options()).unwrap();
        let mut buf = [0u8; 100];
        stream.read_buf(&mut buf).unwrap();
        assert!(matches!(stream.seek_to(2001), Err(StreamError::OutOfRange { .. })));
        assert_eq!(stream.tell(), 100);
        stream.read_buf(&mut buf).unwrap();
        assert_eq!(&buf[..], &data[100..200]);
    }

    #[test]
    fn test_non_seekable_source_refuses_seek() {
        let mut stream = BufferedStream::from_source("idle", Box::new(IdleSource), &small_options()).unwrap();
        assert!(matches!(stream.seek_to(10), Err(StreamError::NotSeekable)));
        assert_eq!(stream.tell(), 0);
        stream.close();
    }

    #[test]
    fn test_abort_unblocks_pending_read() {
        let mut stream = BufferedStream::from_source("idle", Box::new(IdleSource), &small_options()).unwrap();
        let handle = stream.handle();
        let aborter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            handle.abort();
        });

        let started = Instant::now();
        let mut buf = [0u8; 16];
        let n = stream.read_buf(&mut buf).unwrap();
        assert_eq!(n, 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        aborter.join().unwrap();
        assert!(stream.is_aborted());

        let started = Instant::now();
        stream.close();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_stalled_source_reports_error() {
        let options = StreamOptions {
            stall_timeout: Duration::from_millis(100),
            ..small_options()
        };
        let mut stream = BufferedStream::from_source("idle", Box::new(IdleSource), &options).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(stream.read_buf(&mut buf), Err(StreamError::Read(_))));
    }

    #[test]
    fn test_open_rejects_unknown_scheme() {
        assert!(matches!(
            BufferedStream::open("ftp://host/file.ogg", &StreamOptions::default()),
            Err(StreamError::Unsupported(_))
        ));
        assert!(matches!(
            BufferedStream::open("/definitely/not/here.wav", &StreamOptions::default()),
            Err(StreamError::Open(..))
        ));
    }
}
