use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::audio::{FileTags, SoundParams, TagsSelect};
use crate::io::{BufferedStream, StreamHandle, StreamOptions};

/// Bumped whenever `DecoderPlugin` or `DecoderSession` change shape. A
/// dynamically loaded plugin must report exactly this value.
pub const PLUGIN_API_VERSION: u32 = 1;

pub const API_VERSION_SYMBOL: &[u8] = b"_tapedeck_plugin_api_version";
pub const CREATE_SYMBOL: &[u8] = b"_tapedeck_plugin_create";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderErrorKind {
    /// Damaged data; the decoder resynchronizes and playback may continue.
    Stream,
    /// The session cannot produce more audio.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DecoderError {
    pub kind: DecoderErrorKind,
    pub message: String,
}

impl DecoderError {
    pub fn stream(message: impl Into<String>) -> Self {
        Self { kind: DecoderErrorKind::Stream, message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { kind: DecoderErrorKind::Fatal, message: message.into() }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == DecoderErrorKind::Fatal
    }
}

/// Process-wide capability table of one decoder backend.
///
/// Implementations hold no per-stream state: everything a stream needs lives
/// in the [`DecoderSession`] returned by `open`/`open_stream`, so any number
/// of sessions of the same plugin can run on different threads.
pub trait DecoderPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Opens a local file. Failure is reported through the returned
    /// session's `error()` so the caller can still close it.
    fn open(&self, path: &Path, options: &StreamOptions) -> Box<dyn DecoderSession>;

    fn supports_streams(&self) -> bool {
        false
    }

    /// Opens an already buffered stream; the session takes ownership of it.
    fn open_stream(&self, stream: BufferedStream) -> Box<dyn DecoderSession> {
        drop(stream);
        Box::new(ErrorSession::new(DecoderError::fatal(format!(
            "{} cannot decode streams",
            self.name()
        ))))
    }

    /// Cheap content probe. Must only `peek` so the stream stays usable.
    fn can_decode(&self, _stream: &mut BufferedStream) -> bool {
        false
    }

    fn info(&self, path: &Path, select: TagsSelect) -> FileTags;

    fn our_format_ext(&self, ext: &str) -> bool;

    fn our_mime(&self, _mime: &str) -> bool {
        false
    }
}

/// State of one open stream. Owned by exactly one caller; the host never
/// calls into the same session from two threads at once.
pub trait DecoderSession: Send {
    /// Fills `buf` with PCM and sets `params` to describe it. Returns the
    /// number of bytes written; `0` is end of stream.
    fn decode(&mut self, buf: &mut [u8], params: &mut SoundParams) -> usize;

    /// Returns the position actually reached, or `None` if the seek failed
    /// and the position is unchanged.
    fn seek(&mut self, sec: u64) -> Option<u64>;

    /// Current bitrate in kbps.
    fn bitrate(&self) -> Option<u32> {
        None
    }

    fn avg_bitrate(&self) -> Option<u32> {
        None
    }

    fn duration(&self) -> Option<u64>;

    /// Error left by `open` or by the most recent `decode`/`seek`.
    fn error(&self) -> Option<DecoderError>;

    /// Short format name for display ("WAV", "FLA", ...).
    fn format_name(&self) -> Option<String> {
        None
    }

    /// Tags that changed since the last call (live streams update titles).
    fn current_tags(&mut self) -> Option<FileTags> {
        None
    }

    fn stream(&self) -> Option<StreamHandle> {
        None
    }

    fn close(self: Box<Self>) {}
}

/// A session that failed to open. Plugins return it from `open` so the host
/// can query the error and close it like any other session.
pub struct ErrorSession {
    error: DecoderError,
    stream: Option<BufferedStream>,
}

impl ErrorSession {
    pub fn new(error: DecoderError) -> Self {
        Self { error, stream: None }
    }

    /// Keeps the stream alive until close so its fill thread is joined there.
    pub fn with_stream(error: DecoderError, stream: BufferedStream) -> Self {
        Self { error, stream: Some(stream) }
    }
}

impl DecoderSession for ErrorSession {
    fn decode(&mut self, _buf: &mut [u8], _params: &mut SoundParams) -> usize {
        0
    }

    fn seek(&mut self, _sec: u64) -> Option<u64> {
        None
    }

    fn duration(&self) -> Option<u64> {
        None
    }

    fn error(&self) -> Option<DecoderError> {
        Some(self.error.clone())
    }

    fn stream(&self) -> Option<StreamHandle> {
        self.stream.as_ref().map(BufferedStream::handle)
    }

    fn close(self: Box<Self>) {
        if let Some(stream) = self.stream {
            stream.close();
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadFailure {
    #[error("api version mismatch: plugin={found}, host={expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("missing runtime dependency: {0}")]
    DependencyMissing(String),
    #[error("{0}")]
    Library(String),
}

/// A plugin created from a dynamic library. The library stays loaded for as
/// long as the plugin (or any session holding it) is alive.
pub struct PluginLoader {
    plugin: Box<dyn DecoderPlugin>,
    path: PathBuf,
    _lib: libloading::Library,
}

impl PluginLoader {
    /// # Safety
    /// Runs the library's initializers and its creation entry point. The
    /// library must have been built with `export_decoder_plugin!` against
    /// this crate and the same compiler.
    pub unsafe fn load<P: AsRef<Path>>(path: P) -> Result<Self, LoadFailure> {
        let path = path.as_ref();
        let lib = libloading::Library::new(path).map_err(|e| classify_open_error(&e.to_string()))?;

        let plugin = {
            let version: libloading::Symbol<fn() -> u32> = lib
                .get(API_VERSION_SYMBOL)
                .map_err(|e| LoadFailure::Library(e.to_string()))?;
            let found = version();
            if found != PLUGIN_API_VERSION {
                return Err(LoadFailure::VersionMismatch { found, expected: PLUGIN_API_VERSION });
            }

            let constructor: libloading::Symbol<fn() -> Box<dyn DecoderPlugin>> =
                lib.get(CREATE_SYMBOL).map_err(|e| LoadFailure::Library(e.to_string()))?;
            constructor()
        };

        Ok(Self {
            plugin,
            path: path.to_path_buf(),
            _lib: lib,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn plugin(&self) -> &dyn DecoderPlugin {
        self.plugin.as_ref()
    }
}

impl DecoderPlugin for PluginLoader {
    fn name(&self) -> &str {
        self.plugin.name()
    }

    fn description(&self) -> &str {
        self.plugin.description()
    }

    fn open(&self, path: &Path, options: &StreamOptions) -> Box<dyn DecoderSession> {
        self.plugin.open(path, options)
    }

    fn supports_streams(&self) -> bool {
        self.plugin.supports_streams()
    }

    fn open_stream(&self, stream: BufferedStream) -> Box<dyn DecoderSession> {
        self.plugin.open_stream(stream)
    }

    fn can_decode(&self, stream: &mut BufferedStream) -> bool {
        self.plugin.can_decode(stream)
    }

    fn info(&self, path: &Path, select: TagsSelect) -> FileTags {
        self.plugin.info(path, select)
    }

    fn our_format_ext(&self, ext: &str) -> bool {
        self.plugin.our_format_ext(ext)
    }

    fn our_mime(&self, mime: &str) -> bool {
        self.plugin.our_mime(mime)
    }
}

/// Tells a library whose own dependencies are unresolvable apart from other
/// load failures, using the loader's message (glibc, dyld and Windows wording).
pub(crate) fn classify_open_error(message: &str) -> LoadFailure {
    const MISSING_DEPENDENCY: &[&str] = &[
        "cannot open shared object file",
        "Library not loaded",
        "The specified module could not be found",
        "os error 126",
    ];
    if MISSING_DEPENDENCY.iter().any(|needle| message.contains(needle)) {
        LoadFailure::DependencyMissing(message.to_string())
    } else {
        LoadFailure::Library(message.to_string())
    }
}

/// Exports the entry points a plugin library needs:
///
/// ```ignore
/// tapedeck::export_decoder_plugin!(MyDecoder::default());
/// ```
#[macro_export]
macro_rules! export_decoder_plugin {
    ($constructor:expr) => {
        #[no_mangle]
        pub fn _tapedeck_plugin_api_version() -> u32 {
            $crate::api::PLUGIN_API_VERSION
        }

        #[no_mangle]
        pub fn _tapedeck_plugin_create() -> ::std::boxed::Box<dyn $crate::api::DecoderPlugin> {
            ::std::boxed::Box::new($constructor)
        }
    };
}
