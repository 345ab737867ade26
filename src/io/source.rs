use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// A raw byte source driven by the fill thread of a `BufferedStream`.
///
/// `read` must return within a bounded interval: a source with no data yet
/// reports `WouldBlock` or `TimedOut` so the fill thread can notice an abort.
/// `Ok(0)` means end of stream.
pub trait Source: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn seek(&mut self, _offset: u64) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "source is not seekable"))
    }

    fn is_seekable(&self) -> bool {
        false
    }

    fn size(&self) -> Option<u64> {
        None
    }

    fn mime_type(&self) -> Option<String> {
        None
    }

    /// Returns an in-band title update, if one arrived since the last call.
    fn take_title(&mut self) -> Option<String> {
        None
    }
}

pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl Source for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn seek(&mut self, offset: u64) -> io::Result<u64> {
        self.file.seek(SeekFrom::Start(offset))
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

/// In-memory source, mostly useful for probing small headers and for tests.
pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl Source for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> io::Result<u64> {
        self.pos = (offset as usize).min(self.data.len());
        Ok(self.pos as u64)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}
