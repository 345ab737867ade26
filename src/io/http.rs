use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, trace};
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use url::Url;

use super::source::Source;
use super::{StreamError, StreamOptions};

const MAX_REDIRECTS: usize = 5;
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Response body moved to its own thread. `read` waits at most
/// `POLL_INTERVAL` and reports `WouldBlock` when nothing arrived.
struct Body {
    chunks: Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    pos: usize,
    closed: Arc<AtomicBool>,
}

impl Body {
    fn spawn(response: Response, chunk: usize) -> io::Result<Self> {
        let (tx, rx) = bounded(8);
        let closed = Arc::new(AtomicBool::new(false));
        let pump_closed = closed.clone();
        thread::Builder::new()
            .name("tapedeck-http".into())
            .spawn(move || pump(response, tx, pump_closed, chunk))?;
        Ok(Self {
            chunks: rx,
            pending: Vec::new(),
            pos: 0,
            closed,
        })
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.pending.len() {
            match self.chunks.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(chunk)) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => return Err(io::ErrorKind::WouldBlock.into()),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Runs until the body ends, fails, or the reader side is dropped. A read
/// timeout only means the server is quiet.
fn pump(mut response: Response, chunks: Sender<io::Result<Vec<u8>>>, closed: Arc<AtomicBool>, chunk: usize) {
    let mut buf = vec![0u8; chunk.max(1)];
    while !closed.load(Ordering::Relaxed) {
        match response.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if chunks.send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = chunks.send(Err(e));
                break;
            }
        }
    }
    trace!("HTTP body reader finished");
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
        || e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout)
}

enum IcyState {
    Audio(usize),
    Length,
    Meta { data: Vec<u8>, need: usize },
}

/// HTTP(S) stream with optional ICY in-band metadata.
pub struct HttpSource {
    body: Body,
    mime: Option<String>,
    size: Option<u64>,
    metaint: Option<usize>,
    icy: IcyState,
    title: Option<String>,
}

impl HttpSource {
    /// Connects, following up to five redirects. The handshake and every
    /// body read are bounded by `connect_timeout`.
    pub fn connect(location: &str, options: &StreamOptions) -> Result<Self, StreamError> {
        let mut url = parse_url(location)?;
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.connect_timeout)
            .redirect(Policy::none())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| StreamError::Connect(location.to_string(), e.to_string()))?;

        for _ in 0..=MAX_REDIRECTS {
            let response = client
                .get(url.clone())
                .header("Icy-MetaData", "1")
                .send()
                .map_err(|e| {
                    if e.is_timeout() {
                        StreamError::Timeout(url.to_string())
                    } else {
                        StreamError::Connect(url.to_string(), e.to_string())
                    }
                })?;

            let status = response.status();
            if status.is_redirection() {
                let next = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| StreamError::Connect(url.to_string(), "redirect without location".into()))?;
                let next = redirect_target(&url, next)?;
                debug!("Redirected from {} to {}", url, next);
                url = next;
                continue;
            }
            if !status.is_success() {
                return Err(StreamError::Connect(url.to_string(), format!("server answered {status}")));
            }

            let headers = response.headers();
            let mime = header(headers, CONTENT_TYPE.as_str())
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());
            let metaint = header(headers, "icy-metaint")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|&v| v > 0);
            let title = header(headers, "icy-name").map(str::to_string);
            let size = response.content_length();
            info!("Connected to {} (mime: {:?}, icy-metaint: {:?})", url, mime, metaint);

            let body = Body::spawn(response, options.read_chunk)
                .map_err(|e| StreamError::Connect(url.to_string(), e.to_string()))?;
            return Ok(Self {
                body,
                mime,
                size,
                metaint,
                icy: IcyState::Audio(metaint.unwrap_or(0)),
                title,
            });
        }
        Err(StreamError::Connect(location.to_string(), "too many redirects".into()))
    }

    fn read_audio(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(metaint) = self.metaint else {
            return self.body.read(buf);
        };
        loop {
            match std::mem::replace(&mut self.icy, IcyState::Length) {
                IcyState::Audio(0) => self.icy = IcyState::Length,
                IcyState::Audio(remaining) => {
                    let want = buf.len().min(remaining);
                    let result = self.body.read(&mut buf[..want]);
                    let n = *result.as_ref().unwrap_or(&0);
                    self.icy = IcyState::Audio(remaining - n);
                    return result;
                }
                IcyState::Length => {
                    let mut len = [0u8; 1];
                    let n = match self.body.read(&mut len) {
                        Ok(n) => n,
                        Err(e) => {
                            self.icy = IcyState::Length;
                            return Err(e);
                        }
                    };
                    if n == 0 {
                        return Ok(0);
                    }
                    let need = len[0] as usize * 16;
                    self.icy = if need == 0 {
                        IcyState::Audio(metaint)
                    } else {
                        IcyState::Meta { data: Vec::with_capacity(need), need }
                    };
                }
                IcyState::Meta { mut data, need } => {
                    let mut chunk = vec![0u8; need - data.len()];
                    let n = match self.body.read(&mut chunk) {
                        Ok(n) => n,
                        Err(e) => {
                            self.icy = IcyState::Meta { data, need };
                            return Err(e);
                        }
                    };
                    if n == 0 {
                        return Ok(0);
                    }
                    data.extend_from_slice(&chunk[..n]);
                    if data.len() < need {
                        self.icy = IcyState::Meta { data, need };
                        continue;
                    }
                    if let Some(title) = parse_stream_title(&data) {
                        debug!("Stream title: {}", title);
                        self.title = Some(title);
                    }
                    self.icy = IcyState::Audio(metaint);
                }
            }
        }
    }
}

impl Source for HttpSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_audio(buf)
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn mime_type(&self) -> Option<String> {
        self.mime.clone()
    }

    fn take_title(&mut self) -> Option<String> {
        self.title.take()
    }
}

/// True for the schemes [`HttpSource`] can open.
pub fn is_http_url(location: &str) -> bool {
    Url::parse(location).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

fn parse_url(location: &str) -> Result<Url, StreamError> {
    let url = Url::parse(location).map_err(|_| StreamError::Unsupported(location.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
        return Err(StreamError::Unsupported(location.to_string()));
    }
    Ok(url)
}

/// Resolves a `Location` header, absolute or relative, against the request URL.
fn redirect_target(base: &Url, location: &str) -> Result<Url, StreamError> {
    let url = base
        .join(location)
        .map_err(|e| StreamError::Connect(base.to_string(), format!("bad redirect to {location}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(StreamError::Unsupported(url.to_string()));
    }
    Ok(url)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn parse_stream_title(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let text = text.trim_end_matches('\0');
    let start = text.find("StreamTitle='")? + "StreamTitle='".len();
    let end = text[start..].find("';").map(|i| start + i).unwrap_or(text.len());
    let title = text[start..end].trim();
    (!title.is_empty()).then(|| title.to_string())
}
