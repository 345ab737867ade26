use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S8,
    S16Le,
    S16Be,
    /// Packed little-endian 24-bit, three bytes per sample.
    S24Le,
    S32Le,
    S32Be,
    F32Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::S8 => 1,
            SampleFormat::S16Le | SampleFormat::S16Be => 2,
            SampleFormat::S24Le => 3,
            SampleFormat::S32Le | SampleFormat::S32Be | SampleFormat::F32Le => 4,
        }
    }

    pub fn bits(self) -> u16 {
        self.bytes_per_sample() as u16 * 8
    }

    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S8 => "s8",
            SampleFormat::S16Le => "s16le",
            SampleFormat::S16Be => "s16be",
            SampleFormat::S24Le => "s24le",
            SampleFormat::S32Le => "s32le",
            SampleFormat::S32Be => "s32be",
            SampleFormat::F32Le => "f32le",
        }
    }
}

/// Describes one chunk of decoded PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoundParams {
    pub rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
}

impl SoundParams {
    pub fn new(rate: u32, channels: u16, format: SampleFormat) -> Self {
        Self { rate, channels, format }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.rate as usize
    }

    /// A zeroed value is what sessions report before their first chunk.
    pub fn is_valid(&self) -> bool {
        self.rate > 0 && self.channels > 0
    }
}

impl Default for SoundParams {
    fn default() -> Self {
        Self { rate: 0, channels: 0, format: SampleFormat::S16Le }
    }
}

impl fmt::Display for SoundParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz {}ch {}", self.rate, self.channels, self.format.name())
    }
}

/// Which parts of [`FileTags`] a static `info` query should fill in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TagsSelect {
    pub comments: bool,
    pub time: bool,
}

impl TagsSelect {
    pub const ALL: TagsSelect = TagsSelect { comments: true, time: true };
    pub const TIME: TagsSelect = TagsSelect { comments: false, time: true };
    pub const COMMENTS: TagsSelect = TagsSelect { comments: true, time: false };
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<u32>,
    /// Duration in seconds.
    pub time: Option<u64>,
    pub comments: BTreeMap<String, String>,
}

impl FileTags {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.track.is_none()
            && self.time.is_none()
            && self.comments.is_empty()
    }

    /// Stores a key/value pair, routing well-known keys to their fields.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match key.to_ascii_lowercase().as_str() {
            "title" => self.title = Some(value),
            "artist" => self.artist = Some(value),
            "album" => self.album = Some(value),
            "track" | "tracknumber" => {
                // "3/12" style numbering is common
                let num = value.split('/').next().unwrap_or_default().trim();
                self.track = num.parse().ok();
            }
            other => {
                self.comments.insert(other.to_string(), value);
            }
        }
    }

    /// Drops the parts `select` did not ask for.
    pub fn filtered(mut self, select: TagsSelect) -> Self {
        if !select.time {
            self.time = None;
        }
        if !select.comments {
            self.comments.clear();
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match key.to_ascii_lowercase().as_str() {
            "title" => self.title.as_deref(),
            "artist" => self.artist.as_deref(),
            "album" => self.album.as_deref(),
            other => self.comments.get(other).map(String::as_str),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sound_params_sizes() {
        let p = SoundParams::new(44100, 2, SampleFormat::S16Le);
        assert_eq!(p.bytes_per_frame(), 4);
        assert_eq!(p.bytes_per_second(), 176400);
        assert_eq!(SoundParams::new(48000, 1, SampleFormat::S24Le).bytes_per_frame(), 3);
        assert!(!SoundParams::default().is_valid());
    }

    #[test]
    fn test_tags_set_routes_known_keys() {
        let mut tags = FileTags::default();
        tags.set("TITLE", "Song");
        tags.set("TrackNumber", "3/12");
        tags.set("genre", "Jazz");
        assert_eq!(tags.title.as_deref(), Some("Song"));
        assert_eq!(tags.track, Some(3));
        assert_eq!(tags.get("genre"), Some("Jazz"));
        assert!(!tags.is_empty());
        assert!(FileTags::default().is_empty());
    }
}
