use std::io::{self, Cursor};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hound::{SampleFormat as HoundFormat, WavSpec, WavWriter};
use sha2::{Digest, Sha256};
use tapedeck::api::DecoderPlugin;
use tapedeck::decoders::{SymphoniaPlugin, WavPlugin};
use tapedeck::io::{BufferedStream, Source, StreamOptions};
use tapedeck::player::{playback_channel, PlaybackOutcome, Player, Precache};
use tapedeck::sink::{AudioSink, ChecksumSink, NullSink};
use tapedeck::{PluginRegistry, Session};

const RATE: u32 = 44100;

fn sample(i: u32) -> i16 {
    ((i * 37) % 20000) as i16 - 10000
}

fn mono_spec() -> WavSpec {
    WavSpec { channels: 1, sample_rate: RATE, bits_per_sample: 16, sample_format: HoundFormat::Int }
}

/// Writes `seconds` of mono 16-bit audio; returns the raw PCM it contains.
fn write_fixture(path: &Path, seconds: u32) -> Vec<u8> {
    let mut writer = WavWriter::create(path, mono_spec()).unwrap();
    let mut pcm = Vec::new();
    for i in 0..seconds * RATE {
        writer.write_sample(sample(i)).unwrap();
        pcm.extend_from_slice(&sample(i).to_le_bytes());
    }
    writer.finalize().unwrap();
    pcm
}

fn decode_with(plugin: Arc<dyn DecoderPlugin>, path: &Path, sink: &mut dyn AudioSink) -> PlaybackOutcome {
    let session = Session::open(plugin, path, &StreamOptions::default());
    let (_handle, control) = playback_channel();
    Player::default().play(session, sink, &control)
}

#[test]
fn three_seconds_mono_yields_exact_byte_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("three.wav");
    write_fixture(&path, 3);

    let registry = PluginRegistry::builtin();
    let session = registry.open(path.to_str().unwrap()).unwrap();
    assert_eq!(session.plugin_name(), "wav");
    assert_eq!(session.duration(), Some(3));

    let (_handle, control) = playback_channel();
    let mut sink = NullSink::default();
    assert_eq!(Player::default().play(session, &mut sink, &control), PlaybackOutcome::Completed);
    assert_eq!(sink.bytes, 264_600);
}

#[test]
fn checksum_round_trip_for_each_builtin_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.wav");
    let pcm = write_fixture(&path, 2);
    let expected = hex::encode(Sha256::digest(&pcm));

    let plugins: [Arc<dyn DecoderPlugin>; 2] = [Arc::new(WavPlugin), Arc::new(SymphoniaPlugin)];
    for plugin in plugins {
        let name = plugin.name().to_string();
        let mut sink = ChecksumSink::new();
        assert_eq!(decode_with(plugin, &path, &mut sink), PlaybackOutcome::Completed, "{name}");
        assert_eq!(sink.bytes(), pcm.len() as u64, "{name}");
        assert_eq!(sink.hex_digest(), expected, "{name}");
    }
}

#[test]
fn two_precached_sessions_on_one_path_finish_independently() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.wav");
    let pcm = write_fixture(&path, 1);
    let expected = hex::encode(Sha256::digest(&pcm));
    let location = path.to_str().unwrap().to_string();

    let registry = Arc::new(PluginRegistry::builtin());
    let first = Precache::start(registry.clone(), location.clone(), 4096).unwrap();
    let second = Precache::start(registry, location, 4096).unwrap();
    let tracks = [first.finish().unwrap(), second.finish().unwrap()];

    let players: Vec<_> = tracks
        .into_iter()
        .map(|track| {
            thread::spawn(move || {
                let (_handle, control) = playback_channel();
                let mut sink = ChecksumSink::new();
                let outcome = Player::new(1000).play_precached(track, &mut sink, &control);
                (outcome, sink.hex_digest())
            })
        })
        .collect();
    for player in players {
        let (outcome, digest) = player.join().unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert_eq!(digest, expected);
    }
}

/// Serves its bytes, then never anything again.
struct StallingSource {
    data: Vec<u8>,
    pos: usize,
}

impl Source for StallingSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.data.len() {
            let n = buf.len().min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        thread::sleep(Duration::from_millis(10));
        Err(io::ErrorKind::WouldBlock.into())
    }
}

#[test]
fn stop_unblocks_player_waiting_on_stalled_stream() {
    let mut wav = Cursor::new(Vec::new());
    let mut writer = WavWriter::new(&mut wav, mono_spec()).unwrap();
    for i in 0..RATE {
        writer.write_sample(sample(i)).unwrap();
    }
    writer.finalize().unwrap();
    let mut data = wav.into_inner();
    // header plus a little audio, the rest never arrives
    data.truncate(44 + 16_000);

    let options = StreamOptions { stall_timeout: Duration::from_secs(60), ..StreamOptions::default() };
    let stream = BufferedStream::from_source("stalled.wav", Box::new(StallingSource { data, pos: 0 }), &options).unwrap();
    let session = Session::open_stream(Arc::new(WavPlugin), stream);
    assert!(session.error().is_none());

    let (handle, control) = playback_channel();
    let player = thread::spawn(move || {
        let mut sink = NullSink::default();
        Player::default().play(session, &mut sink, &control)
    });

    thread::sleep(Duration::from_millis(300));
    let stopped_at = Instant::now();
    handle.stop();
    assert_eq!(player.join().unwrap(), PlaybackOutcome::Stopped);
    assert!(stopped_at.elapsed() < Duration::from_secs(2));
}

/// Accepts at most `per_call` bytes, and nothing on every other call.
struct SlowSink {
    per_call: usize,
    calls: usize,
    received: Vec<u8>,
}

impl AudioSink for SlowSink {
    fn reconfigure(&mut self, _params: &tapedeck::audio::SoundParams) -> anyhow::Result<()> {
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        self.calls += 1;
        if self.calls % 2 == 0 {
            return Ok(0);
        }
        let n = data.len().min(self.per_call);
        self.received.extend_from_slice(&data[..n]);
        Ok(n)
    }
}

#[test]
fn backpressure_never_drops_audio() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.wav");
    let mut writer = WavWriter::create(&path, mono_spec()).unwrap();
    let mut pcm = Vec::new();
    for i in 0..2000 {
        writer.write_sample(sample(i)).unwrap();
        pcm.extend_from_slice(&sample(i).to_le_bytes());
    }
    writer.finalize().unwrap();

    let mut sink = SlowSink { per_call: 300, calls: 0, received: Vec::new() };
    assert_eq!(decode_with(Arc::new(WavPlugin), &path, &mut sink), PlaybackOutcome::Completed);
    assert_eq!(sink.received, pcm);
}

#[test]
fn seek_past_the_end_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("two.wav");
    write_fixture(&path, 2);

    for plugin in [Arc::new(WavPlugin) as Arc<dyn DecoderPlugin>, Arc::new(SymphoniaPlugin)] {
        let mut session = Session::open(plugin, &path, &StreamOptions::default());
        assert_eq!(session.seek(2), None);
        assert_eq!(session.seek(1), Some(1));
        session.close();
    }
}

#[test]
fn seek_into_the_last_partial_second_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fraction.wav");
    let spec = WavSpec { sample_rate: 8000, ..mono_spec() };
    let mut writer = WavWriter::create(&path, spec).unwrap();
    for i in 0..20_000 {
        writer.write_sample(sample(i)).unwrap();
    }
    writer.finalize().unwrap();

    for plugin in [Arc::new(WavPlugin) as Arc<dyn DecoderPlugin>, Arc::new(SymphoniaPlugin)] {
        let name = plugin.name().to_string();
        let mut session = Session::open(plugin, &path, &StreamOptions::default());
        assert_eq!(session.duration(), Some(2), "{name}");
        assert_eq!(session.seek(2), Some(2), "{name}");
        assert_eq!(session.seek(3), None, "{name}");

        // the last half second is still there
        let (_handle, control) = playback_channel();
        session.seek(2);
        let mut sink = NullSink::default();
        assert_eq!(Player::default().play(session, &mut sink, &control), PlaybackOutcome::Completed, "{name}");
        assert_eq!(sink.bytes, 8000, "{name}");
    }
}

#[test]
fn http_stream_resolves_by_mime_and_decodes() {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("served.wav");
    let pcm = write_fixture(&path, 1);
    let body = std::fs::read(&path).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(sock.try_clone().unwrap());
        let mut line = String::new();
        while reader.read_line(&mut line).unwrap() > 2 {
            line.clear();
        }
        sock.write_all(b"HTTP/1.0 200 OK\r\nContent-Type: audio/x-wav\r\n\r\n").unwrap();
        sock.write_all(&body).unwrap();
    });

    let registry = PluginRegistry::builtin();
    let session = registry.open(&format!("http://127.0.0.1:{port}/live")).unwrap();
    assert_eq!(session.plugin_name(), "wav");

    let (_handle, control) = playback_channel();
    let mut sink = ChecksumSink::new();
    assert_eq!(Player::default().play(session, &mut sink, &control), PlaybackOutcome::Completed);
    assert_eq!(sink.hex_digest(), hex::encode(Sha256::digest(&pcm)));
    server.join().unwrap();
}
