use std::fmt;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};

use crate::api::{DecoderError, DecoderPlugin, DecoderSession};
use crate::audio::{FileTags, SoundParams};
use crate::io::{BufferedStream, StreamHandle, StreamOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Decoding,
    Seeking,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Closed => "closed",
            SessionState::Opening => "opening",
            SessionState::Open => "open",
            SessionState::Decoding => "decoding",
            SessionState::Seeking => "seeking",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Host side of one decoder session.
///
/// Owns the plugin's session object and keeps the plugin alive for as long
/// as it exists. Consuming `close` makes a second close impossible.
pub struct Session {
    // dropped before `plugin`, whose library may hold the session's code
    inner: Box<dyn DecoderSession>,
    plugin: Arc<dyn DecoderPlugin>,
    location: String,
    state: SessionState,
}

impl Session {
    pub fn open(plugin: Arc<dyn DecoderPlugin>, path: &Path, options: &StreamOptions) -> Self {
        let location = path.display().to_string();
        debug!("Session {} ({}): {}", location, plugin.name(), SessionState::Opening);
        let inner = plugin.open(path, options);
        Self::opened(plugin, location, inner)
    }

    pub fn open_stream(plugin: Arc<dyn DecoderPlugin>, stream: BufferedStream) -> Self {
        let location = stream.location().to_string();
        debug!("Session {} ({}): {}", location, plugin.name(), SessionState::Opening);
        let inner = plugin.open_stream(stream);
        Self::opened(plugin, location, inner)
    }

    fn opened(plugin: Arc<dyn DecoderPlugin>, location: String, inner: Box<dyn DecoderSession>) -> Self {
        let state = match inner.error() {
            Some(e) => {
                warn!("Can't open {} with {}: {}", location, plugin.name(), e);
                SessionState::Error
            }
            None => SessionState::Open,
        };
        Self { inner, plugin, location, state }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn plugin_name(&self) -> &str {
        self.plugin.name()
    }

    /// Decodes the next chunk. Returns 0 at end of stream and always after a
    /// fatal error.
    pub fn decode(&mut self, buf: &mut [u8], params: &mut SoundParams) -> usize {
        if self.state == SessionState::Error {
            return 0;
        }
        let n = self.inner.decode(buf, params);
        self.state = match self.inner.error() {
            Some(e) if e.is_fatal() => SessionState::Error,
            _ => SessionState::Decoding,
        };
        n
    }

    /// Returns the second actually reached. On `None` the position is
    /// unchanged. Whether `sec` is past the end is up to the plugin.
    pub fn seek(&mut self, sec: u64) -> Option<u64> {
        if self.state == SessionState::Error {
            return None;
        }

        let previous = self.state;
        self.state = SessionState::Seeking;
        let landed = self.inner.seek(sec);
        self.state = match (landed, self.inner.error()) {
            (_, Some(e)) if e.is_fatal() => SessionState::Error,
            (Some(_), _) => SessionState::Decoding,
            (None, _) => previous,
        };
        landed
    }

    pub fn bitrate(&self) -> Option<u32> {
        self.inner.bitrate()
    }

    pub fn avg_bitrate(&self) -> Option<u32> {
        self.inner.avg_bitrate()
    }

    pub fn duration(&self) -> Option<u64> {
        self.inner.duration()
    }

    pub fn error(&self) -> Option<DecoderError> {
        self.inner.error()
    }

    pub fn format_name(&self) -> Option<String> {
        self.inner.format_name()
    }

    pub fn current_tags(&mut self) -> Option<FileTags> {
        self.inner.current_tags()
    }

    pub fn stream(&self) -> Option<StreamHandle> {
        self.inner.stream()
    }

    pub fn close(self) {
        let Session { inner, plugin, location, state } = self;
        debug!("Closing {} ({}) in state {}", location, plugin.name(), state);
        inner.close();
        drop(plugin);
    }
}
