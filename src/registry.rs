//! Plugin discovery and format resolution.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::api::{DecoderPlugin, LoadFailure, PluginLoader, TagsCache, TapedeckConfig};
use crate::audio::{FileTags, TagsSelect};
use crate::decoders::{builtin_plugins, extension_of};
use crate::io::{BufferedStream, StreamOptions};
use crate::session::Session;

/// Content probes only look at the first few bytes.
const PROBE_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginOrigin {
    Builtin,
    Library(PathBuf),
}

impl fmt::Display for PluginOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginOrigin::Builtin => write!(f, "built-in"),
            PluginOrigin::Library(path) => write!(f, "{}", path.display()),
        }
    }
}

pub struct RegisteredPlugin {
    pub plugin: Arc<dyn DecoderPlugin>,
    pub origin: PluginOrigin,
}

impl RegisteredPlugin {
    pub fn name(&self) -> &str {
        self.plugin.name()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded(String),
    VersionMismatch { found: u32, expected: u32 },
    DependencyMissing(String),
    LoadError(String),
    /// Loaded fine but turned off in the configuration.
    Disabled(String),
}

/// What happened to one candidate library during [`PluginRegistry::load_plugins`].
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub path: PathBuf,
    pub outcome: LoadOutcome,
}

/// All known decoder plugins in preference order. Built once at startup and
/// only read afterward, so it is shared between threads behind an `Arc`.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<RegisteredPlugin>,
    preferences: HashMap<String, Vec<String>>,
    disabled: Vec<String>,
    options: StreamOptions,
    tags_cache: Option<TagsCache>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for plugin in builtin_plugins() {
            registry.register(plugin, PluginOrigin::Builtin);
        }
        registry
    }

    /// Applies extension preferences, disabled plugins and buffer settings.
    pub fn configure(&mut self, config: &TapedeckConfig) {
        self.preferences = config
            .preferences
            .iter()
            .map(|p| (p.ext.to_ascii_lowercase(), p.plugins.clone()))
            .collect();
        self.disabled = config.disabled.iter().map(|d| d.name.clone()).collect();
        self.plugins.retain(|p| {
            let keep = !config.is_disabled(p.plugin.name());
            if !keep {
                info!("Plugin {} disabled by configuration", p.plugin.name());
            }
            keep
        });
        self.options = config.stream_options();
    }

    pub fn set_tags_cache(&mut self, cache: TagsCache) {
        self.tags_cache = Some(cache);
    }

    pub fn stream_options(&self) -> &StreamOptions {
        &self.options
    }

    pub fn register(&mut self, plugin: Arc<dyn DecoderPlugin>, origin: PluginOrigin) {
        debug!("Registered plugin {} ({})", plugin.name(), origin);
        self.plugins.push(RegisteredPlugin { plugin, origin });
    }

    pub fn plugins(&self) -> &[RegisteredPlugin] {
        &self.plugins
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn DecoderPlugin>> {
        self.plugins.iter().find(|p| p.name() == name).map(|p| p.plugin.clone())
    }

    /// Loads every dynamic library in `dir`. A library that fails to load is
    /// reported and skipped; nothing here is fatal.
    pub fn load_plugins<P: AsRef<Path>>(&mut self, dir: P) -> Vec<LoadReport> {
        let dir = dir.as_ref();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("No plugin directory {}: {}", dir.display(), e);
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(std::env::consts::DLL_EXTENSION))
            .collect();
        paths.sort();

        let mut reports = Vec::with_capacity(paths.len());
        for path in paths {
            let outcome = self.load_one(&path);
            reports.push(LoadReport { path, outcome });
        }
        reports
    }

    fn load_one(&mut self, path: &Path) -> LoadOutcome {
        // SAFETY: plugin libraries are built with `export_decoder_plugin!`
        // against this crate; the version symbol is checked before creation.
        let loader = match unsafe { PluginLoader::load(path) } {
            Ok(loader) => loader,
            Err(LoadFailure::VersionMismatch { found, expected }) => {
                warn!(
                    "Skipping plugin {}: api version mismatch: plugin={}, host={}",
                    path.display(),
                    found,
                    expected
                );
                return LoadOutcome::VersionMismatch { found, expected };
            }
            Err(LoadFailure::DependencyMissing(msg)) => {
                debug!("Skipping plugin {}: {}", path.display(), msg);
                return LoadOutcome::DependencyMissing(msg);
            }
            Err(LoadFailure::Library(msg)) => {
                warn!("Can't load plugin {}: {}", path.display(), msg);
                return LoadOutcome::LoadError(msg);
            }
        };

        let name = loader.name().to_string();
        if self.disabled.contains(&name) {
            info!("Plugin {} disabled by configuration", name);
            return LoadOutcome::Disabled(name);
        }
        if self.find(&name).is_some() {
            warn!("Skipping plugin {}: {} is already registered", path.display(), name);
            return LoadOutcome::LoadError(format!("duplicate plugin name {name}"));
        }

        info!("Loaded plugin {} from {}", name, path.display());
        self.register(Arc::new(loader), PluginOrigin::Library(path.to_path_buf()));
        LoadOutcome::Loaded(name)
    }

    /// Plugins claiming `ext` or `mime`, configured preferences first.
    fn candidates(&self, ext: Option<&str>, mime: Option<&str>, streams_only: bool) -> Vec<usize> {
        let mut found: Vec<usize> = self
            .plugins
            .iter()
            .enumerate()
            .filter(|(_, p)| !streams_only || p.plugin.supports_streams())
            .filter(|(_, p)| {
                ext.is_some_and(|e| p.plugin.our_format_ext(e)) || mime.is_some_and(|m| p.plugin.our_mime(m))
            })
            .map(|(i, _)| i)
            .collect();

        if let Some(order) = ext.and_then(|e| self.preferences.get(e)) {
            let rank = |i: &usize| {
                order
                    .iter()
                    .position(|name| name == self.plugins[*i].name())
                    .unwrap_or(order.len())
            };
            found.sort_by_key(rank);
        }
        found
    }

    fn select(&self, candidates: &[usize], stream: Option<&mut BufferedStream>, streams_only: bool) -> Option<usize> {
        if let Some(stream) = stream {
            if let Some(&i) = candidates.iter().find(|&&i| self.plugins[i].plugin.can_decode(stream)) {
                return Some(i);
            }
            // content beats a misleading extension
            let other = (0..self.plugins.len())
                .filter(|i| !candidates.contains(i))
                .filter(|&i| !streams_only || self.plugins[i].plugin.supports_streams())
                .find(|&i| self.plugins[i].plugin.can_decode(stream));
            if let Some(i) = other {
                debug!("Content of {} matches plugin {}", stream.location(), self.plugins[i].name());
                return Some(i);
            }
        }
        candidates.first().copied()
    }

    pub fn resolve_path(&self, path: &Path) -> Option<Arc<dyn DecoderPlugin>> {
        let ext = extension_of(&path.to_string_lossy());
        let candidates = self.candidates(ext.as_deref(), None, false);
        let options = StreamOptions { buffer_size: PROBE_BUFFER, ..self.options.clone() };
        let mut probe = match BufferedStream::open_path(path, &options) {
            Ok(stream) => Some(stream),
            Err(e) => {
                debug!("Can't probe {}: {}", path.display(), e);
                None
            }
        };
        let found = self.select(&candidates, probe.as_mut(), false);
        if let Some(stream) = probe {
            stream.close();
        }
        found.map(|i| self.plugins[i].plugin.clone())
    }

    pub fn resolve_stream(&self, stream: &mut BufferedStream) -> Option<Arc<dyn DecoderPlugin>> {
        let ext = extension_of(stream.location());
        let mime = stream.mime_type().map(|m| m.split(';').next().unwrap_or(m).trim().to_string());
        let candidates = self.candidates(ext.as_deref(), mime.as_deref(), true);
        self.select(&candidates, Some(stream), true).map(|i| self.plugins[i].plugin.clone())
    }

    /// Opens a local path or a URL with the plugin that resolves for it.
    pub fn open(&self, location: &str) -> Result<Session> {
        if location.contains("://") {
            let mut stream = BufferedStream::open(location, &self.options)?;
            let plugin = self
                .resolve_stream(&mut stream)
                .with_context(|| format!("No plugin can decode {location}"))?;
            return Ok(Session::open_stream(plugin, stream));
        }
        let path = Path::new(location);
        let plugin = self
            .resolve_path(path)
            .with_context(|| format!("No plugin can decode {}", path.display()))?;
        Ok(Session::open(plugin, path, &self.options))
    }

    /// Static tags for `path`, served from the tags cache when it is fresh.
    pub fn file_info(&self, path: &Path, select: TagsSelect) -> Result<FileTags> {
        if let Some(cache) = &self.tags_cache {
            match cache.get(path) {
                Ok(Some(tags)) => {
                    debug!("Tags cache hit for {}", path.display());
                    return Ok(tags.filtered(select));
                }
                Ok(None) => {}
                Err(e) => warn!("Tags cache lookup failed for {}: {:#}", path.display(), e),
            }
        }

        let plugin = self
            .resolve_path(path)
            .with_context(|| format!("No plugin can read {}", path.display()))?;
        let query = if self.tags_cache.is_some() { TagsSelect::ALL } else { select };
        let tags = plugin.info(path, query);

        if let Some(cache) = &self.tags_cache {
            if let Err(e) = cache.put(path, &tags) {
                warn!("Can't cache tags for {}: {:#}", path.display(), e);
            }
        }
        Ok(tags.filtered(select))
    }
}
