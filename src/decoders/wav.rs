use std::io::BufReader;
use std::path::Path;

use hound::{SampleFormat as HoundFormat, WavReader};
use log::{debug, warn};

use crate::api::{DecoderError, DecoderPlugin, DecoderSession, ErrorSession};
use crate::audio::{FileTags, SampleFormat, SoundParams, TagsSelect};
use crate::io::{BufferedStream, StreamHandle, StreamOptions};

const MIME_TYPES: &[&str] = &["audio/wav", "audio/x-wav", "audio/wave", "audio/vnd.wave"];

/// Uncompressed RIFF/WAVE.
#[derive(Debug, Default)]
pub struct WavPlugin;

impl DecoderPlugin for WavPlugin {
    fn name(&self) -> &str {
        "wav"
    }

    fn description(&self) -> &str {
        "PCM and IEEE float RIFF/WAVE files"
    }

    fn open(&self, path: &Path, options: &StreamOptions) -> Box<dyn DecoderSession> {
        match BufferedStream::open_path(path, options) {
            Ok(stream) => self.open_stream(stream),
            Err(e) => Box::new(ErrorSession::new(DecoderError::fatal(e.to_string()))),
        }
    }

    fn supports_streams(&self) -> bool {
        true
    }

    fn open_stream(&self, stream: BufferedStream) -> Box<dyn DecoderSession> {
        let location = stream.location().to_string();
        match WavSession::new(stream) {
            Ok(session) => {
                debug!("Opened {} as {}", location, session.params);
                Box::new(session)
            }
            Err(e) => {
                warn!("Cannot decode {} as WAV: {}", location, e);
                Box::new(ErrorSession::new(e))
            }
        }
    }

    fn can_decode(&self, stream: &mut BufferedStream) -> bool {
        let mut header = [0u8; 12];
        matches!(stream.peek(&mut header), Ok(12)) && &header[..4] == b"RIFF" && &header[8..] == b"WAVE"
    }

    fn info(&self, path: &Path, select: TagsSelect) -> FileTags {
        let mut tags = FileTags::default();
        if select.time {
            match WavReader::open(path) {
                Ok(reader) => {
                    let rate = reader.spec().sample_rate.max(1) as u64;
                    tags.time = Some(reader.duration() as u64 / rate);
                }
                Err(e) => debug!("No WAV info for {}: {}", path.display(), e),
            }
        }
        tags
    }

    fn our_format_ext(&self, ext: &str) -> bool {
        ext.eq_ignore_ascii_case("wav")
    }

    fn our_mime(&self, mime: &str) -> bool {
        MIME_TYPES.iter().any(|m| m.eq_ignore_ascii_case(mime))
    }
}

struct WavSession {
    reader: WavReader<BufReader<BufferedStream>>,
    params: SoundParams,
    handle: StreamHandle,
    total_frames: u64,
    frames_read: u64,
    error: Option<DecoderError>,
}

impl WavSession {
    fn new(stream: BufferedStream) -> Result<Self, DecoderError> {
        let handle = stream.handle();
        let reader = WavReader::new(BufReader::new(stream)).map_err(|e| DecoderError::fatal(format!("WAV: {e}")))?;
        let spec = reader.spec();
        let format = match (spec.sample_format, spec.bits_per_sample) {
            (HoundFormat::Int, 8) => SampleFormat::U8,
            (HoundFormat::Int, 16) => SampleFormat::S16Le,
            (HoundFormat::Int, 24) => SampleFormat::S24Le,
            (HoundFormat::Int, 32) => SampleFormat::S32Le,
            (HoundFormat::Float, 32) => SampleFormat::F32Le,
            (format, bits) => {
                return Err(DecoderError::fatal(format!("unsupported WAV sample format {format:?}/{bits}")))
            }
        };
        Ok(Self {
            total_frames: reader.duration() as u64,
            params: SoundParams::new(spec.sample_rate, spec.channels, format),
            reader,
            handle,
            frames_read: 0,
            error: None,
        })
    }

    fn read_int(&mut self, out: &mut [u8], samples: usize) -> Result<usize, hound::Error> {
        let format = self.params.format;
        let width = format.bytes_per_sample();
        let mut written = 0;
        for sample in self.reader.samples::<i32>().take(samples) {
            let sample = sample?;
            let slot = &mut out[written..written + width];
            match format {
                // hound hands 8-bit samples back signed
                SampleFormat::U8 => slot[0] = (sample + 128) as u8,
                SampleFormat::S16Le => slot.copy_from_slice(&(sample as i16).to_le_bytes()),
                SampleFormat::S24Le => slot.copy_from_slice(&sample.to_le_bytes()[..3]),
                _ => slot.copy_from_slice(&sample.to_le_bytes()),
            }
            written += width;
        }
        Ok(written)
    }

    fn read_float(&mut self, out: &mut [u8], samples: usize) -> Result<usize, hound::Error> {
        let mut written = 0;
        for sample in self.reader.samples::<f32>().take(samples) {
            out[written..written + 4].copy_from_slice(&sample?.to_le_bytes());
            written += 4;
        }
        Ok(written)
    }
}

impl DecoderSession for WavSession {
    fn decode(&mut self, buf: &mut [u8], params: &mut SoundParams) -> usize {
        self.error = None;
        let frame = self.params.bytes_per_frame();
        let frames = buf.len() / frame;
        let samples = frames * self.params.channels as usize;

        let result = if self.params.format == SampleFormat::F32Le {
            self.read_float(buf, samples)
        } else {
            self.read_int(buf, samples)
        };
        let written = match result {
            Ok(n) => n,
            Err(hound::Error::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("WAV data ends early");
                0
            }
            Err(e) => {
                self.error = Some(DecoderError::fatal(format!("WAV: {e}")));
                0
            }
        };

        // never hand out a partial frame
        let written = written - written % frame;
        self.frames_read += (written / frame) as u64;
        *params = self.params;
        written
    }

    fn seek(&mut self, sec: u64) -> Option<u64> {
        let target = sec.checked_mul(self.params.rate as u64)?;
        if target >= self.total_frames {
            return None;
        }
        match self.reader.seek(target as u32) {
            Ok(()) => {
                self.frames_read = target;
                Some(sec)
            }
            Err(e) => {
                warn!("WAV seek to {}s failed: {}", sec, e);
                None
            }
        }
    }

    fn bitrate(&self) -> Option<u32> {
        Some((self.params.bytes_per_second() * 8 / 1000) as u32)
    }

    fn avg_bitrate(&self) -> Option<u32> {
        self.bitrate()
    }

    fn duration(&self) -> Option<u64> {
        Some(self.total_frames / self.params.rate.max(1) as u64)
    }

    fn error(&self) -> Option<DecoderError> {
        self.error.clone()
    }

    fn format_name(&self) -> Option<String> {
        Some("WAV".into())
    }

    fn stream(&self) -> Option<StreamHandle> {
        Some(self.handle.clone())
    }
}
