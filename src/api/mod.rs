pub mod plugin;
pub mod db;
pub mod config;

pub use plugin::{
    DecoderError, DecoderErrorKind, DecoderPlugin, DecoderSession, ErrorSession, LoadFailure, PluginLoader,
    PLUGIN_API_VERSION,
};
pub use db::TagsCache;
pub use config::TapedeckConfig;
