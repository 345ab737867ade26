//! Where decoded PCM goes.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::audio::{SampleFormat, SoundParams};

/// Consumer of decoded audio.
///
/// `write` may accept fewer bytes than offered when the device is not ready;
/// the caller keeps the rest and retries later.
pub trait AudioSink: Send {
    /// Called before the first write and whenever the parameters change.
    fn reconfigure(&mut self, params: &SoundParams) -> Result<()>;

    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Drops audio queued but not yet played, after a seek.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Finishes output at the end of a track.
    fn drain(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Discards audio, counting it.
#[derive(Debug, Default)]
pub struct NullSink {
    pub bytes: u64,
    pub params: Option<SoundParams>,
}

impl AudioSink for NullSink {
    fn reconfigure(&mut self, params: &SoundParams) -> Result<()> {
        self.params = Some(*params);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.bytes += data.len() as u64;
        Ok(data.len())
    }
}

/// SHA-256 over the raw PCM bytes, for bit-exact comparison of decoder output.
#[derive(Default)]
pub struct ChecksumSink {
    hasher: Sha256,
    bytes: u64,
    params: Option<SoundParams>,
}

impl ChecksumSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn params(&self) -> Option<SoundParams> {
        self.params
    }

    pub fn hex_digest(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

impl AudioSink for ChecksumSink {
    fn reconfigure(&mut self, params: &SoundParams) -> Result<()> {
        self.params = Some(*params);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
        Ok(data.len())
    }
}

const WAV_HEADER_LEN: u64 = 44;

/// Writes a RIFF/WAVE file. Sizes in the header are patched on `drain`.
pub struct WavSink {
    path: PathBuf,
    file: BufWriter<File>,
    params: Option<SoundParams>,
    data_len: u64,
}

impl WavSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            params: None,
            data_len: 0,
        })
    }

    fn write_header(&mut self, params: &SoundParams) -> Result<()> {
        let format_tag: u16 = if params.format == SampleFormat::F32Le { 3 } else { 1 };
        let bits = params.format.bits();
        let block_align = params.bytes_per_frame() as u16;
        let byte_rate = params.bytes_per_second() as u32;
        debug!(
            "Writing WAV: channels={}, bits={}, rate={}",
            params.channels, bits, params.rate
        );

        let file = &mut self.file;
        file.write_all(b"RIFF")?;
        file.write_all(&36u32.to_le_bytes())?;
        file.write_all(b"WAVE")?;

        file.write_all(b"fmt ")?;
        file.write_all(&16u32.to_le_bytes())?;
        file.write_all(&format_tag.to_le_bytes())?;
        file.write_all(&params.channels.to_le_bytes())?;
        file.write_all(&params.rate.to_le_bytes())?;
        file.write_all(&byte_rate.to_le_bytes())?;
        file.write_all(&block_align.to_le_bytes())?;
        file.write_all(&bits.to_le_bytes())?;

        file.write_all(b"data")?;
        file.write_all(&0u32.to_le_bytes())?;
        Ok(())
    }
}

/// Rewrites samples in place into the byte order and signedness WAV expects.
fn to_wav_layout(format: SampleFormat, data: &mut [u8]) {
    match format {
        // WAV stores 8-bit audio unsigned
        SampleFormat::S8 => data.iter_mut().for_each(|b| *b ^= 0x80),
        SampleFormat::S16Be => data.chunks_exact_mut(2).for_each(|s| s.reverse()),
        SampleFormat::S32Be => data.chunks_exact_mut(4).for_each(|s| s.reverse()),
        _ => {}
    }
}

impl AudioSink for WavSink {
    fn reconfigure(&mut self, params: &SoundParams) -> Result<()> {
        match self.params {
            None => {
                self.write_header(params)?;
                self.params = Some(*params);
                Ok(())
            }
            Some(current) if current == *params => Ok(()),
            Some(current) if self.data_len == 0 => {
                // nothing written yet, start the header over
                debug!("WAV output switching from {} to {}", current, params);
                self.file.seek(SeekFrom::Start(0))?;
                self.write_header(params)?;
                self.params = Some(*params);
                Ok(())
            }
            Some(current) => bail!(
                "{}: format changed mid-file from {} to {}",
                self.path.display(),
                current,
                params
            ),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let Some(params) = self.params else {
            bail!("{}: write before the output format is known", self.path.display());
        };
        let mut chunk = data.to_vec();
        to_wav_layout(params.format, &mut chunk);
        self.file.write_all(&chunk)?;
        self.data_len += chunk.len() as u64;
        Ok(data.len())
    }

    fn drain(&mut self) -> Result<()> {
        if self.params.is_none() {
            return Ok(());
        }
        let data_len = u32::try_from(self.data_len).context("WAV data exceeds 4 GiB")?;
        self.file.seek(SeekFrom::Start(4))?;
        self.file.write_all(&(36 + data_len).to_le_bytes())?;
        self.file.seek(SeekFrom::Start(WAV_HEADER_LEN - 4))?;
        self.file.write_all(&data_len.to_le_bytes())?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.flush()?;
        info!("Wrote {} bytes of audio to {}", self.data_len, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_sink_matches_direct_hash() {
        let mut sink = ChecksumSink::new();
        sink.reconfigure(&SoundParams::new(8000, 1, SampleFormat::U8)).unwrap();
        sink.write(b"hello ").unwrap();
        sink.write(b"world").unwrap();
        assert_eq!(sink.bytes(), 11);
        assert_eq!(sink.hex_digest(), hex::encode(Sha256::digest(b"hello world")));
    }

    #[test]
    fn test_wav_sink_readable_by_hound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let mut sink = WavSink::create(&path).unwrap();
        sink.reconfigure(&SoundParams::new(22050, 2, SampleFormat::S16Be)).unwrap();
        // one stereo frame, big-endian: 1 and -2
        sink.write(&[0x00, 0x01, 0xff, 0xfe]).unwrap();
        sink.drain().unwrap();
        drop(sink);

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 22050);
        assert_eq!(reader.spec().channels, 2);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, [1, -2]);
    }

    #[test]
    fn test_wav_sink_rejects_format_change_after_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = WavSink::create(dir.path().join("x.wav")).unwrap();
        sink.reconfigure(&SoundParams::new(8000, 1, SampleFormat::S16Le)).unwrap();
        sink.reconfigure(&SoundParams::new(16000, 1, SampleFormat::S16Le)).unwrap();
        sink.write(&[0, 0]).unwrap();
        assert!(sink.reconfigure(&SoundParams::new(8000, 1, SampleFormat::S16Le)).is_err());
    }
}
