//! Decoder backends compiled into the binary.

pub mod symphonia;
pub mod wav;

use std::path::Path;
use std::sync::Arc;

use crate::api::DecoderPlugin;

pub use self::symphonia::SymphoniaPlugin;
pub use self::wav::WavPlugin;

/// Built-in plugins in their default preference order.
pub fn builtin_plugins() -> Vec<Arc<dyn DecoderPlugin>> {
    vec![Arc::new(WavPlugin), Arc::new(SymphoniaPlugin)]
}

/// Lowercased extension of a path or URL, ignoring any query string.
pub fn extension_of(location: &str) -> Option<String> {
    let location = match location.contains("://") {
        true => location.split(['?', '#']).next().unwrap_or(location),
        false => location,
    };
    Path::new(location)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("/music/Song.FLAC").as_deref(), Some("flac"));
        assert_eq!(extension_of("http://radio.example/live.mp3?sid=1").as_deref(), Some("mp3"));
        assert_eq!(extension_of("/music/noext"), None);
    }

    #[test]
    fn test_builtin_names() {
        let names: Vec<String> = builtin_plugins().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, ["wav", "symphonia"]);
    }
}
