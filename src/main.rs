use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use std::path::PathBuf;
use std::process;
use tapedeck::api::{TagsCache, TapedeckConfig};
use tapedeck::args::{Cli, Commands};
use tapedeck::audio::TagsSelect;
use tapedeck::player::{playback_channel, PlaybackOutcome, Player};
use tapedeck::registry::{LoadOutcome, PluginRegistry};
use tapedeck::sink::{ChecksumSink, NullSink, WavSink};

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        log::error!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let proj_dirs = ProjectDirs::from("org", "tapedeck", "tapedeck")
        .context("Could not determine project directories")?;

    let config = match &cli.config {
        Some(path) => TapedeckConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let path = proj_dirs.config_dir().join("config.kdl");
            if path.exists() {
                TapedeckConfig::load(&path)
                    .with_context(|| format!("Failed to load config from {}", path.display()))?
            } else {
                TapedeckConfig::default()
            }
        }
    };

    let mut registry = PluginRegistry::builtin();
    registry.configure(&config);

    if config.tags_cache_enabled() {
        std::fs::create_dir_all(proj_dirs.data_dir())?;
        let db_path = proj_dirs.data_dir().join("tags.db");
        match TagsCache::open(&db_path) {
            Ok(cache) => registry.set_tags_cache(cache),
            Err(e) => log::warn!("Tags cache at {} unavailable: {:#}", db_path.display(), e),
        }
    }

    let plugin_dir: PathBuf = cli
        .plugin_dir
        .clone()
        .or_else(|| config.plugin_dir())
        .unwrap_or_else(|| proj_dirs.data_dir().join("plugins"));
    let reports = registry.load_plugins(&plugin_dir);

    match cli.command {
        Commands::Plugins => {
            for entry in registry.plugins() {
                println!("{} ({}): {}", entry.name(), entry.origin, entry.plugin.description());
            }
            for report in reports.iter().filter(|r| !matches!(r.outcome, LoadOutcome::Loaded(_))) {
                println!("skipped {}: {:?}", report.path.display(), report.outcome);
            }
        }
        Commands::Info { path } => {
            let tags = registry
                .file_info(&path, TagsSelect::ALL)
                .with_context(|| format!("Failed to read tags from {}", path.display()))?;
            if tags.is_empty() {
                println!("No tags.");
            }
            for (key, value) in [("title", &tags.title), ("artist", &tags.artist), ("album", &tags.album)] {
                if let Some(value) = value {
                    println!("{key}: {value}");
                }
            }
            if let Some(track) = tags.track {
                println!("track: {track}");
            }
            if let Some(time) = tags.time {
                println!("time: {}:{:02}", time / 60, time % 60);
            }
            for (key, value) in &tags.comments {
                println!("{key}: {value}");
            }
        }
        Commands::Decode { input, output, checksum, start } => {
            let session = registry.open(&input)?;
            if let Some(error) = session.error().filter(|e| e.is_fatal()) {
                session.close();
                anyhow::bail!("Can't decode {}: {}", input, error);
            }
            log::info!(
                "{} via {}: {:?}, duration {:?}s",
                input,
                session.plugin_name(),
                session.format_name(),
                session.duration()
            );

            let (handle, control) = playback_channel();
            if let Some(sec) = start {
                handle.seek_to(sec);
            }
            let player = Player::new(config.chunk_size());

            let outcome = if let Some(path) = output {
                let mut sink = WavSink::create(&path)?;
                player.play(session, &mut sink, &control)
            } else if checksum {
                let mut sink = ChecksumSink::new();
                let outcome = player.play(session, &mut sink, &control);
                println!("{}  {} ({} bytes)", sink.hex_digest(), input, sink.bytes());
                outcome
            } else {
                let mut sink = NullSink::default();
                let outcome = player.play(session, &mut sink, &control);
                println!("{}: decoded {} bytes", input, sink.bytes);
                outcome
            };

            if let PlaybackOutcome::Failed(msg) = outcome {
                anyhow::bail!("Decoding {} failed: {}", input, msg);
            }
        }
    }
    Ok(())
}
