//! The decode loop: pulls PCM out of a session and pushes it into a sink.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::api::config::DEFAULT_CHUNK_SIZE;
use crate::audio::{FileTags, SoundParams};
use crate::io::StreamHandle;
use crate::registry::PluginRegistry;
use crate::session::Session;
use crate::sink::AudioSink;

/// How long to wait for the sink before offering the same bytes again.
const SINK_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerCommand {
    SeekTo(u64),
    SeekBy(i64),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The decoder reached the end of the stream.
    Completed,
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    FormatChanged(SoundParams),
    /// Whole seconds played.
    Position(u64),
    Bitrate(u32),
    Tags(FileTags),
    StreamError(String),
    Finished(PlaybackOutcome),
}

/// Controls a running [`Player::play`] from another thread.
#[derive(Clone)]
pub struct PlaybackHandle {
    commands: Sender<PlayerCommand>,
    current: Arc<Mutex<Option<StreamHandle>>>,
}

/// The player's end of a [`PlaybackHandle`]. Commands sent before a track
/// starts apply to it; commands still queued when it ends are dropped.
pub struct PlaybackControl {
    commands: Receiver<PlayerCommand>,
    current: Arc<Mutex<Option<StreamHandle>>>,
}

pub fn playback_channel() -> (PlaybackHandle, PlaybackControl) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let current = Arc::new(Mutex::new(None));
    (
        PlaybackHandle { commands: tx, current: current.clone() },
        PlaybackControl { commands: rx, current },
    )
}

impl PlaybackHandle {
    pub fn seek_to(&self, sec: u64) {
        let _ = self.commands.send(PlayerCommand::SeekTo(sec));
    }

    pub fn seek_by(&self, delta: i64) {
        let _ = self.commands.send(PlayerCommand::SeekBy(delta));
    }

    /// Stops the current track. Aborts its stream too, so a decode blocked
    /// on a slow source returns right away.
    pub fn stop(&self) {
        let _ = self.commands.send(PlayerCommand::Stop);
        if let Some(stream) = self.current.lock().as_ref() {
            stream.abort();
        }
    }
}

pub struct Player {
    chunk_size: usize,
    events: Option<Sender<PlayerEvent>>,
}

impl Default for Player {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

struct Progress {
    params: Option<SoundParams>,
    base: u64,
    played: f64,
    reported: Option<u64>,
    bitrate: Option<u32>,
}

impl Progress {
    fn position(&self) -> u64 {
        self.base + self.played as u64
    }
}

enum Flow {
    Continue,
    /// Pending output was made stale by a seek.
    Discard,
    Finish(PlaybackOutcome),
}

impl Player {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size: chunk_size.max(1), events: None }
    }

    pub fn with_events(mut self, events: Sender<PlayerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: PlayerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Plays `session` to the end, until stopped, or until it fails. The
    /// session is closed before returning.
    pub fn play(&self, session: Session, sink: &mut dyn AudioSink, control: &PlaybackControl) -> PlaybackOutcome {
        self.run(session, None, sink, control)
    }

    pub fn play_precached(
        &self,
        track: PrecachedTrack,
        sink: &mut dyn AudioSink,
        control: &PlaybackControl,
    ) -> PlaybackOutcome {
        let PrecachedTrack { session, first, params } = track;
        self.run(session, Some((first, params)), sink, control)
    }

    fn run(
        &self,
        mut session: Session,
        mut pending: Option<(Vec<u8>, SoundParams)>,
        sink: &mut dyn AudioSink,
        control: &PlaybackControl,
    ) -> PlaybackOutcome {
        info!("Playing {} with {}", session.location(), session.plugin_name());
        let stream = session.stream();
        *control.current.lock() = stream.clone();

        let mut progress = Progress { params: None, base: 0, played: 0.0, reported: None, bitrate: None };
        let mut buf = vec![0u8; self.chunk_size];

        let outcome = loop {
            let mut finished = None;
            while let Ok(command) = control.commands.try_recv() {
                match self.apply(command, &mut session, sink, &mut progress) {
                    Flow::Continue => {}
                    Flow::Discard => pending = None,
                    Flow::Finish(outcome) => {
                        finished = Some(outcome);
                        break;
                    }
                }
            }
            if let Some(outcome) = finished {
                break outcome;
            }

            let (len, params) = match pending.take() {
                Some((first, params)) => {
                    if buf.len() < first.len() {
                        buf.resize(first.len(), 0);
                    }
                    buf[..first.len()].copy_from_slice(&first);
                    if let Some(outcome) = self.check_error(&session, first.len(), stream.as_ref()) {
                        break outcome;
                    }
                    (first.len(), params)
                }
                None => {
                    let mut params = SoundParams::default();
                    let n = session.decode(&mut buf, &mut params);
                    if let Some(outcome) = self.check_error(&session, n, stream.as_ref()) {
                        break outcome;
                    }
                    (n, params)
                }
            };
            if len == 0 {
                debug!("End of {}", session.location());
                break PlaybackOutcome::Completed;
            }

            if progress.params != Some(params) {
                if let Err(e) = sink.reconfigure(&params) {
                    break PlaybackOutcome::Failed(format!("{e:#}"));
                }
                info!("Output format {}", params);
                progress.params = Some(params);
                self.emit(PlayerEvent::FormatChanged(params));
            }

            match self.write_all(&buf[..len], sink, &mut session, &mut progress, control) {
                Flow::Continue => {
                    let rate = params.bytes_per_second();
                    if rate > 0 {
                        progress.played += len as f64 / rate as f64;
                    }
                }
                Flow::Discard => {}
                Flow::Finish(outcome) => break outcome,
            }
            self.report(&mut session, &mut progress);
        };

        if outcome == PlaybackOutcome::Completed {
            if let Err(e) = sink.drain() {
                warn!("Can't drain output: {:#}", e);
            }
        }
        *control.current.lock() = None;
        let stale = control.commands.try_iter().count();
        if stale > 0 {
            debug!("Dropped {} commands left for {}", stale, session.location());
        }
        match &outcome {
            PlaybackOutcome::Failed(msg) => warn!("Playback of {} failed: {}", session.location(), msg),
            other => debug!("Playback of {} finished: {:?}", session.location(), other),
        }
        session.close();
        self.emit(PlayerEvent::Finished(outcome.clone()));
        outcome
    }

    /// Classifies the error left by the last `decode`.
    fn check_error(&self, session: &Session, decoded: usize, stream: Option<&StreamHandle>) -> Option<PlaybackOutcome> {
        if stream.is_some_and(StreamHandle::is_aborted) {
            return Some(PlaybackOutcome::Stopped);
        }
        let error = session.error()?;
        if error.is_fatal() {
            return Some(PlaybackOutcome::Failed(error.message));
        }
        if decoded == 0 {
            warn!("Stream error at the end of {}: {}", session.location(), error);
            return Some(PlaybackOutcome::Completed);
        }
        warn!("Stream error in {}: {}", session.location(), error);
        self.emit(PlayerEvent::StreamError(error.message));
        None
    }

    /// Offers `data` to the sink until all of it is accepted. While the sink
    /// is full, waits on the command channel instead of dropping audio.
    fn write_all(
        &self,
        mut data: &[u8],
        sink: &mut dyn AudioSink,
        session: &mut Session,
        progress: &mut Progress,
        control: &PlaybackControl,
    ) -> Flow {
        while !data.is_empty() {
            let written = match sink.write(data) {
                Ok(n) => n.min(data.len()),
                Err(e) => return Flow::Finish(PlaybackOutcome::Failed(format!("{e:#}"))),
            };
            data = &data[written..];
            if data.is_empty() {
                break;
            }
            match control.commands.recv_timeout(SINK_RETRY) {
                Ok(command) => match self.apply(command, session, sink, progress) {
                    Flow::Continue => {}
                    flow => return flow,
                },
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }
        Flow::Continue
    }

    fn apply(
        &self,
        command: PlayerCommand,
        session: &mut Session,
        sink: &mut dyn AudioSink,
        progress: &mut Progress,
    ) -> Flow {
        let target = match command {
            PlayerCommand::Stop => return Flow::Finish(PlaybackOutcome::Stopped),
            PlayerCommand::SeekTo(sec) => sec,
            PlayerCommand::SeekBy(delta) => progress.position().saturating_add_signed(delta),
        };
        match session.seek(target) {
            Some(landed) => {
                debug!("Seeked {} to {}s", session.location(), landed);
                if let Err(e) = sink.flush() {
                    warn!("Can't flush output: {:#}", e);
                }
                progress.base = landed;
                progress.played = 0.0;
                progress.reported = Some(landed);
                self.emit(PlayerEvent::Position(landed));
                Flow::Discard
            }
            None => {
                warn!("Can't seek {} to {}s", session.location(), target);
                Flow::Continue
            }
        }
    }

    fn report(&self, session: &mut Session, progress: &mut Progress) {
        let position = progress.position();
        if progress.reported != Some(position) {
            progress.reported = Some(position);
            self.emit(PlayerEvent::Position(position));
        }
        let bitrate = session.bitrate();
        if bitrate.is_some() && bitrate != progress.bitrate {
            progress.bitrate = bitrate;
            if let Some(kbps) = bitrate {
                self.emit(PlayerEvent::Bitrate(kbps));
            }
        }
        if let Some(tags) = session.current_tags() {
            self.emit(PlayerEvent::Tags(tags));
        }
    }
}

/// A session opened ahead of time with its first chunk already decoded.
pub struct PrecachedTrack {
    session: Session,
    first: Vec<u8>,
    params: SoundParams,
}

impl PrecachedTrack {
    /// Drops the prepared track without playing it.
    pub fn close(self) {
        self.session.close();
    }
}

/// Opens the next track on a background thread while the current one plays.
pub struct Precache {
    location: String,
    thread: JoinHandle<Result<PrecachedTrack>>,
}

impl Precache {
    pub fn start(registry: Arc<PluginRegistry>, location: impl Into<String>, chunk_size: usize) -> Result<Self> {
        let location = location.into();
        let target = location.clone();
        let thread = thread::Builder::new()
            .name("tapedeck-precache".into())
            .spawn(move || precache(&registry, &target, chunk_size.max(1)))
            .context("Failed to spawn precache thread")?;
        Ok(Self { location, thread })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn finish(self) -> Result<PrecachedTrack> {
        self.thread
            .join()
            .map_err(|_| anyhow!("precache thread for {} panicked", self.location))?
    }
}

fn precache(registry: &PluginRegistry, location: &str, chunk_size: usize) -> Result<PrecachedTrack> {
    debug!("Precaching {}", location);
    let mut session = registry.open(location)?;
    let mut first = vec![0u8; chunk_size];
    let mut params = SoundParams::default();
    let n = session.decode(&mut first, &mut params);
    first.truncate(n);
    debug!("Precached {} bytes of {}", n, location);
    Ok(PrecachedTrack { session, first, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DecoderError, DecoderPlugin, DecoderSession};
    use crate::audio::{SampleFormat, TagsSelect};
    use crate::io::StreamOptions;
    use crate::sink::NullSink;
    use std::path::Path;

    /// Plays back a fixed list of decode results.
    #[derive(Clone)]
    struct Script(Vec<(usize, Option<DecoderError>)>);

    struct ScriptSession {
        steps: std::vec::IntoIter<(usize, Option<DecoderError>)>,
        error: Option<DecoderError>,
    }

    impl DecoderPlugin for Script {
        fn name(&self) -> &str {
            "script"
        }

        fn open(&self, _path: &Path, _options: &StreamOptions) -> Box<dyn DecoderSession> {
            Box::new(ScriptSession { steps: self.0.clone().into_iter(), error: None })
        }

        fn info(&self, _path: &Path, _select: TagsSelect) -> FileTags {
            FileTags::default()
        }

        fn our_format_ext(&self, _ext: &str) -> bool {
            true
        }
    }

    impl DecoderSession for ScriptSession {
        fn decode(&mut self, buf: &mut [u8], params: &mut SoundParams) -> usize {
            *params = SoundParams::new(100, 1, SampleFormat::U8);
            let (n, error) = self.steps.next().unwrap_or((0, None));
            self.error = error;
            buf[..n].fill(1);
            n
        }

        fn seek(&mut self, _sec: u64) -> Option<u64> {
            None
        }

        fn duration(&self) -> Option<u64> {
            None
        }

        fn error(&self) -> Option<DecoderError> {
            self.error.clone()
        }
    }

    fn play_script(steps: Vec<(usize, Option<DecoderError>)>) -> (PlaybackOutcome, NullSink, Vec<PlayerEvent>) {
        let session = Session::open(Arc::new(Script(steps)), Path::new("s"), &StreamOptions::default());
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let player = Player::new(64).with_events(events_tx);
        let (_handle, control) = playback_channel();
        let mut sink = NullSink::default();
        let outcome = player.play(session, &mut sink, &control);
        (outcome, sink, events_rx.try_iter().collect())
    }

    #[test]
    fn test_stream_error_with_data_continues() {
        let (outcome, sink, events) = play_script(vec![
            (10, None),
            (10, Some(DecoderError::stream("crc mismatch"))),
            (10, None),
        ]);
        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert_eq!(sink.bytes, 30);
        assert!(events.contains(&PlayerEvent::StreamError("crc mismatch".into())));
        assert_eq!(events.last(), Some(&PlayerEvent::Finished(PlaybackOutcome::Completed)));
    }

    #[test]
    fn test_stream_error_without_data_ends_track() {
        let (outcome, sink, _) = play_script(vec![
            (10, None),
            (0, Some(DecoderError::stream("lost sync"))),
            (10, None),
        ]);
        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert_eq!(sink.bytes, 10);
    }

    #[test]
    fn test_fatal_error_fails_track() {
        let (outcome, sink, _) = play_script(vec![(10, None), (5, Some(DecoderError::fatal("broken")))]);
        assert_eq!(outcome, PlaybackOutcome::Failed("broken".into()));
        assert_eq!(sink.bytes, 10);
    }

    #[test]
    fn test_position_and_format_events() {
        let (_, _, events) = play_script(vec![(50, None), (50, None), (50, None)]);
        assert_eq!(events[0], PlayerEvent::FormatChanged(SoundParams::new(100, 1, SampleFormat::U8)));
        assert!(events.contains(&PlayerEvent::Position(1)));
    }

    #[test]
    fn test_stop_before_first_decode() {
        let session = Session::open(Arc::new(Script(vec![(10, None)])), Path::new("s"), &StreamOptions::default());
        let (handle, control) = playback_channel();
        handle.stop();
        let mut sink = NullSink::default();
        assert_eq!(Player::default().play(session, &mut sink, &control), PlaybackOutcome::Stopped);
        assert_eq!(sink.bytes, 0);
    }

    /// Sends a stop while the track is draining, as a user would just as it ends.
    struct LateStopSink {
        handle: PlaybackHandle,
        bytes: u64,
    }

    impl AudioSink for LateStopSink {
        fn reconfigure(&mut self, _params: &SoundParams) -> Result<()> {
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<usize> {
            self.bytes += data.len() as u64;
            Ok(data.len())
        }

        fn drain(&mut self) -> Result<()> {
            self.handle.stop();
            self.handle.seek_to(3);
            Ok(())
        }
    }

    #[test]
    fn test_commands_left_at_track_end_do_not_reach_next_track() {
        let (handle, control) = playback_channel();
        let mut sink = LateStopSink { handle, bytes: 0 };
        let first = Session::open(Arc::new(Script(vec![(10, None)])), Path::new("a"), &StreamOptions::default());
        assert_eq!(Player::default().play(first, &mut sink, &control), PlaybackOutcome::Completed);

        let second = Session::open(Arc::new(Script(vec![(10, None), (10, None)])), Path::new("b"), &StreamOptions::default());
        assert_eq!(Player::default().play(second, &mut sink, &control), PlaybackOutcome::Completed);
        assert_eq!(sink.bytes, 30);
    }
}
