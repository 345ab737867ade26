use knuffel::Decode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::io::StreamOptions;

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Decode, Debug, Clone, Serialize, Deserialize)]
pub struct TapedeckConfig {
    #[knuffel(child)]
    pub general: Option<GeneralConfig>,
    #[knuffel(child)]
    pub buffer: Option<BufferConfig>,
    #[knuffel(child)]
    pub player: Option<PlayerConfig>,
    #[knuffel(children(name = "prefer"))]
    pub preferences: Vec<Preference>,
    #[knuffel(children(name = "disable"))]
    pub disabled: Vec<Disabled>,
}

#[derive(Decode, Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[knuffel(property)]
    pub plugin_dir: Option<String>,
    #[knuffel(property)]
    pub tags_cache: Option<bool>,
}

#[derive(Decode, Debug, Clone, Default, Serialize, Deserialize)]
pub struct BufferConfig {
    #[knuffel(property)]
    pub size: Option<u64>,
    #[knuffel(property)]
    pub prebuffer: Option<u64>,
    #[knuffel(property)]
    pub connect_timeout_ms: Option<u64>,
    #[knuffel(property)]
    pub stall_timeout_ms: Option<u64>,
}

#[derive(Decode, Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[knuffel(property)]
    pub chunk_size: Option<u64>,
}

/// `prefer "ogg" "vorbis" "symphonia"`: plugin order for one extension.
#[derive(Decode, Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    #[knuffel(argument)]
    pub ext: String,
    #[knuffel(arguments)]
    pub plugins: Vec<String>,
}

#[derive(Decode, Debug, Clone, Serialize, Deserialize)]
pub struct Disabled {
    #[knuffel(argument)]
    pub name: String,
}

impl TapedeckConfig {
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config = knuffel::parse("config.kdl", content)?;
        Ok(config)
    }

    pub fn plugin_dir(&self) -> Option<PathBuf> {
        self.general.as_ref()?.plugin_dir.as_ref().map(PathBuf::from)
    }

    pub fn tags_cache_enabled(&self) -> bool {
        self.general.as_ref().and_then(|g| g.tags_cache).unwrap_or(true)
    }

    pub fn chunk_size(&self) -> usize {
        self.player
            .as_ref()
            .and_then(|p| p.chunk_size)
            .map(|v| v as usize)
            .filter(|&v| v > 0)
            .unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    pub fn stream_options(&self) -> StreamOptions {
        let mut options = StreamOptions::default();
        if let Some(buffer) = &self.buffer {
            if let Some(size) = buffer.size.filter(|&v| v > 0) {
                options.buffer_size = size as usize;
            }
            if let Some(prebuffer) = buffer.prebuffer {
                options.prebuffer = prebuffer as usize;
            }
            if let Some(ms) = buffer.connect_timeout_ms {
                options.connect_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = buffer.stall_timeout_ms {
                options.stall_timeout = Duration::from_millis(ms);
            }
        }
        options
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.iter().any(|d| d.name == name)
    }
}

impl Default for TapedeckConfig {
    fn default() -> Self {
        Self {
            general: Some(GeneralConfig {
                plugin_dir: None,
                tags_cache: Some(true),
            }),
            buffer: None,
            player: None,
            preferences: Vec::new(),
            disabled: Vec::new(),
        }
    }
}
