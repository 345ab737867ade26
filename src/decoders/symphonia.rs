use std::fs::File;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::ConvertibleSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use symphonia::core::units::{Time, TimeBase};
use symphonia::default::{get_codecs, get_probe};

use crate::api::{DecoderError, DecoderPlugin, DecoderSession, ErrorSession};
use crate::audio::{FileTags, SampleFormat, SoundParams, TagsSelect};
use crate::io::{BufferedStream, StreamHandle, StreamOptions};

const EXTENSIONS: &[&str] = &[
    "flac", "mp3", "mp2", "mp1", "ogg", "oga", "wav", "aif", "aiff", "aifc", "m4a", "mp4", "aac", "alac", "mka",
    "webm", "caf",
];

const MIME_TYPES: &[&str] = &[
    "audio/mpeg",
    "audio/mp3",
    "audio/flac",
    "audio/x-flac",
    "audio/ogg",
    "application/ogg",
    "audio/vorbis",
    "audio/aac",
    "audio/aacp",
    "audio/mp4",
    "audio/x-m4a",
    "audio/wav",
    "audio/x-wav",
    "audio/aiff",
    "audio/x-aiff",
    "audio/webm",
];

/// Every container and codec symphonia was built with.
#[derive(Debug, Default)]
pub struct SymphoniaPlugin;

impl DecoderPlugin for SymphoniaPlugin {
    fn name(&self) -> &str {
        "symphonia"
    }

    fn description(&self) -> &str {
        "FLAC, MP3, Vorbis, AAC, ALAC, WAV and AIFF via symphonia"
    }

    fn open(&self, path: &Path, options: &StreamOptions) -> Box<dyn DecoderSession> {
        match BufferedStream::open_path(path, options) {
            Ok(stream) => open_session(stream),
            Err(e) => Box::new(ErrorSession::new(DecoderError::fatal(e.to_string()))),
        }
    }

    fn supports_streams(&self) -> bool {
        true
    }

    fn open_stream(&self, stream: BufferedStream) -> Box<dyn DecoderSession> {
        open_session(stream)
    }

    fn can_decode(&self, stream: &mut BufferedStream) -> bool {
        let mut header = [0u8; 12];
        match stream.peek(&mut header) {
            Ok(n) => sniff(&header[..n]),
            Err(_) => false,
        }
    }

    fn info(&self, path: &Path, select: TagsSelect) -> FileTags {
        match read_file_tags(path, select) {
            Ok(tags) => tags,
            Err(e) => {
                debug!("No tags for {}: {:#}", path.display(), e);
                FileTags::default()
            }
        }
    }

    fn our_format_ext(&self, ext: &str) -> bool {
        EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }

    fn our_mime(&self, mime: &str) -> bool {
        MIME_TYPES.iter().any(|m| m.eq_ignore_ascii_case(mime))
    }
}

/// Magic-byte check for the containers this backend handles.
fn sniff(header: &[u8]) -> bool {
    let starts = |magic: &[u8]| header.starts_with(magic);
    if starts(b"fLaC") || starts(b"OggS") || starts(b"ID3") || starts(b"caff") || starts(&[0x1a, 0x45, 0xdf, 0xa3])
    {
        return true;
    }
    if header.len() >= 12 {
        let kind = &header[8..12];
        if starts(b"RIFF") && kind == b"WAVE" {
            return true;
        }
        if starts(b"FORM") && (kind == b"AIFF" || kind == b"AIFC") {
            return true;
        }
        if &header[4..8] == b"ftyp" {
            return true;
        }
    }
    // MPEG audio frame sync
    header.len() >= 2 && header[0] == 0xff && header[1] & 0xe0 == 0xe0
}

fn open_session(stream: BufferedStream) -> Box<dyn DecoderSession> {
    let location = stream.location().to_string();
    match SymphoniaSession::new(stream) {
        Ok(session) => {
            info!("Opened {} ({})", location, session.codec);
            Box::new(session)
        }
        Err(e) => {
            warn!("Cannot open {}: {:#}", location, e);
            Box::new(ErrorSession::new(DecoderError::fatal(format!("{e:#}"))))
        }
    }
}

impl MediaSource for BufferedStream {
    fn is_seekable(&self) -> bool {
        BufferedStream::is_seekable(self)
    }

    fn byte_len(&self) -> Option<u64> {
        self.size()
    }
}

fn hint_for(stream: &BufferedStream) -> Hint {
    let mut hint = Hint::new();
    if let Some(ext) = Path::new(stream.location()).extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    if let Some(mime) = stream.mime_type() {
        hint.mime_type(mime);
    }
    hint
}

fn apply_revision(rev: &MetadataRevision, tags: &mut FileTags, comments: bool) {
    for tag in rev.tags() {
        let value = tag.value.to_string();
        match tag.std_key {
            Some(StandardTagKey::TrackTitle) => tags.title = Some(value),
            Some(StandardTagKey::Artist) => tags.artist = Some(value),
            Some(StandardTagKey::Album) => tags.album = Some(value),
            Some(StandardTagKey::TrackNumber) => tags.set("track", value),
            _ if comments => tags.set(&tag.key, value),
            _ => {}
        }
    }
}

fn duration_secs(time_base: Option<TimeBase>, n_frames: Option<u64>, rate: Option<u32>) -> Option<u64> {
    let frames = n_frames?;
    match time_base {
        Some(tb) => Some(tb.calc_time(frames).seconds),
        None => rate.filter(|&r| r > 0).map(|r| frames / r as u64),
    }
}

/// True when second `sec` is at or past the end of a track `n_frames` long.
fn past_end(time_base: Option<TimeBase>, n_frames: Option<u64>, rate: Option<u32>, sec: u64) -> bool {
    let Some(whole) = duration_secs(time_base, n_frames, rate) else {
        return false;
    };
    if sec != whole {
        return sec > whole;
    }
    // same whole second: only the last partial second decides
    let target = match time_base {
        Some(tb) => tb.calc_timestamp(Time::new(sec, 0.0)),
        None => rate.map_or(0, |r| sec * r as u64),
    };
    n_frames.is_some_and(|frames| target >= frames)
}

fn read_file_tags(path: &Path, select: TagsSelect) -> Result<FileTags> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mut probed = get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .context("Failed to probe audio format")?;

    let mut tags = FileTags::default();
    if let Some(rev) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
        apply_revision(rev, &mut tags, select.comments);
    }
    let mut format = probed.format;
    if let Some(rev) = format.metadata().current() {
        apply_revision(rev, &mut tags, select.comments);
    }
    if select.time {
        let track = format.default_track().context("No default track")?;
        let params = &track.codec_params;
        tags.time = duration_secs(params.time_base, params.n_frames, params.sample_rate);
    }
    Ok(tags)
}

struct SymphoniaSession {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    n_frames: Option<u64>,
    rate: Option<u32>,
    duration: Option<u64>,
    byte_len: Option<u64>,
    out_format: SampleFormat,
    params: SoundParams,
    pending: Vec<u8>,
    pending_pos: usize,
    scratch_i16: Option<SampleBuffer<i16>>,
    scratch_i32: Option<SampleBuffer<i32>>,
    scratch_f32: Option<SampleBuffer<f32>>,
    bitrate: Option<u32>,
    error: Option<DecoderError>,
    handle: StreamHandle,
    tags: FileTags,
    tags_changed: bool,
    stream_title: Option<String>,
    codec: String,
}

impl SymphoniaSession {
    fn new(stream: BufferedStream) -> Result<Self> {
        let handle = stream.handle();
        let hint = hint_for(&stream);
        let byte_len = stream.size();
        let mss = MediaSourceStream::new(Box::new(stream), Default::default());

        let mut probed = get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .context("Failed to probe audio format")?;

        let mut tags = FileTags::default();
        if let Some(rev) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            apply_revision(rev, &mut tags, true);
        }
        let mut format = probed.format;
        if let Some(rev) = format.metadata().current() {
            apply_revision(rev, &mut tags, true);
        }

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .context("No supported audio tracks found")?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let decoder = get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .context("Failed to create decoder")?;
        let codec = get_codecs()
            .get_codec(codec_params.codec)
            .map(|d| d.short_name.to_string())
            .unwrap_or_else(|| "unknown".into());

        let out_format = match codec_params.bits_per_sample {
            Some(bits) if bits <= 16 => SampleFormat::S16Le,
            Some(_) => SampleFormat::S32Le,
            None => SampleFormat::F32Le,
        };
        let duration = duration_secs(codec_params.time_base, codec_params.n_frames, codec_params.sample_rate);
        tags.time = duration;

        let params = SoundParams::new(
            codec_params.sample_rate.unwrap_or(0),
            codec_params.channels.map(|c| c.count() as u16).unwrap_or(0),
            out_format,
        );
        debug!("Track {}: codec {}, {}, duration {:?}s", track_id, codec, params, duration);

        Ok(Self {
            format,
            decoder,
            track_id,
            time_base: codec_params.time_base,
            n_frames: codec_params.n_frames,
            rate: codec_params.sample_rate,
            duration,
            byte_len,
            out_format,
            params,
            pending: Vec::new(),
            pending_pos: 0,
            scratch_i16: None,
            scratch_i32: None,
            scratch_f32: None,
            bitrate: None,
            error: None,
            handle,
            tags_changed: !tags.is_empty(),
            tags,
            stream_title: None,
            codec,
        })
    }

    /// Decodes packets until one yields audio. Returns false at end of
    /// stream or after a fatal error.
    fn refill(&mut self) -> bool {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return false,
                Err(SymphoniaError::ResetRequired) => {
                    debug!("Decoder reset required");
                    self.decoder.reset();
                    continue;
                }
                Err(e) => {
                    self.error = Some(DecoderError::fatal(format!("read packet failed: {e}")));
                    return false;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            self.poll_metadata();

            let packet_bytes = packet.buf().len();
            let packet_dur = packet.dur();
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() == 0 {
                        continue;
                    }
                    let spec = *decoded.spec();
                    self.params = SoundParams::new(spec.rate, spec.channels.count() as u16, self.out_format);
                    self.pending.clear();
                    self.pending_pos = 0;
                    match self.out_format {
                        SampleFormat::S16Le => {
                            append_interleaved(&mut self.scratch_i16, decoded, &mut self.pending, |s, out| {
                                out.extend_from_slice(&s.to_le_bytes())
                            })
                        }
                        SampleFormat::S32Le => {
                            append_interleaved(&mut self.scratch_i32, decoded, &mut self.pending, |s, out| {
                                out.extend_from_slice(&s.to_le_bytes())
                            })
                        }
                        _ => append_interleaved(&mut self.scratch_f32, decoded, &mut self.pending, |s, out| {
                            out.extend_from_slice(&s.to_le_bytes())
                        }),
                    }
                    if let Some(tb) = self.time_base {
                        let t = tb.calc_time(packet_dur);
                        let secs = t.seconds as f64 + t.frac;
                        if secs > 0.0 {
                            self.bitrate = Some((packet_bytes as f64 * 8.0 / secs / 1000.0) as u32);
                        }
                    }
                    return true;
                }
                Err(SymphoniaError::DecodeError(msg)) => {
                    debug!("Decode error, skipping packet: {}", msg);
                    self.error = Some(DecoderError::stream(msg));
                    continue;
                }
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return false,
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => {
                    self.error = Some(DecoderError::fatal(format!("decode failed: {e}")));
                    return false;
                }
            }
        }
    }

    fn poll_metadata(&mut self) {
        let mut metadata = self.format.metadata();
        if metadata.is_latest() {
            return;
        }
        if let Some(rev) = metadata.skip_to_latest() {
            apply_revision(rev, &mut self.tags, true);
            self.tags_changed = true;
        }
    }
}

fn append_interleaved<S, F>(slot: &mut Option<SampleBuffer<S>>, decoded: AudioBufferRef<'_>, out: &mut Vec<u8>, encode: F)
where
    S: Sample + ConvertibleSample,
    F: Fn(&S, &mut Vec<u8>),
{
    let needed = decoded.capacity() as u64;
    let realloc = slot.as_ref().map_or(true, |buf| (buf.capacity() as u64) < needed * decoded.spec().channels.count() as u64);
    if realloc {
        *slot = Some(SampleBuffer::<S>::new(needed, *decoded.spec()));
    }
    if let Some(buf) = slot.as_mut() {
        buf.copy_interleaved_ref(decoded);
        for sample in buf.samples() {
            encode(sample, out);
        }
    }
}

impl DecoderSession for SymphoniaSession {
    fn decode(&mut self, buf: &mut [u8], params: &mut SoundParams) -> usize {
        self.error = None;
        if self.pending_pos >= self.pending.len() && !self.refill() {
            return 0;
        }
        let available = &self.pending[self.pending_pos..];
        // whole frames only; a buffer shorter than one frame gets nothing
        let frame = self.params.bytes_per_frame().max(1);
        let n = available.len().min(buf.len()) / frame * frame;
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        *params = self.params;
        n
    }

    fn seek(&mut self, sec: u64) -> Option<u64> {
        if past_end(self.time_base, self.n_frames, self.rate, sec) {
            return None;
        }
        let to = SeekTo::Time { time: Time::new(sec, 0.0), track_id: Some(self.track_id) };
        match self.format.seek(SeekMode::Accurate, to) {
            Ok(seeked) => {
                self.decoder.reset();
                self.pending.clear();
                self.pending_pos = 0;
                let landed = self.time_base.map(|tb| tb.calc_time(seeked.actual_ts).seconds).unwrap_or(sec);
                Some(landed)
            }
            Err(e) => {
                warn!("Seek to {}s failed: {}", sec, e);
                None
            }
        }
    }

    fn bitrate(&self) -> Option<u32> {
        self.bitrate
    }

    fn avg_bitrate(&self) -> Option<u32> {
        let secs = self.duration.filter(|&d| d > 0)?;
        Some((self.byte_len? * 8 / secs / 1000) as u32)
    }

    fn duration(&self) -> Option<u64> {
        self.duration
    }

    fn error(&self) -> Option<DecoderError> {
        self.error.clone()
    }

    fn format_name(&self) -> Option<String> {
        let name = match self.codec.split('_').next() {
            Some("pcm") => "PCM",
            Some("vorbis") => "OGG",
            _ => self.codec.as_str(),
        };
        Some(name.to_ascii_uppercase())
    }

    fn current_tags(&mut self) -> Option<FileTags> {
        let title = self.handle.stream_title();
        if title.is_some() && title != self.stream_title {
            self.stream_title = title.clone();
            self.tags.title = title;
            self.tags_changed = true;
        }
        if !self.tags_changed {
            return None;
        }
        self.tags_changed = false;
        Some(self.tags.clone())
    }

    fn stream(&self) -> Option<StreamHandle> {
        Some(self.handle.clone())
    }
}
