use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Console audio decoder with loadable format plugins.")]
pub struct Cli {
    /// KDL configuration file to use instead of the default one.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory scanned for decoder plugin libraries.
    #[arg(long, global = true)]
    pub plugin_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Decode a file or http(s):// stream.
    Decode {
        input: String,
        /// Write the decoded audio to a WAV file.
        #[arg(short, long, conflicts_with = "checksum")]
        output: Option<PathBuf>,
        /// Print the SHA-256 of the decoded PCM.
        #[arg(long)]
        checksum: bool,
        /// Start position in seconds.
        #[arg(long, value_name = "SECS")]
        start: Option<u64>,
    },
    /// Show the tags and duration of a file.
    Info { path: PathBuf },
    /// List the available decoder plugins.
    Plugins,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decode() {
        let cli = Cli::parse_from(["tapedeck", "--plugin-dir", "/tmp/p", "decode", "song.flac", "--checksum", "--start", "12"]);
        assert_eq!(cli.plugin_dir, Some(PathBuf::from("/tmp/p")));
        match cli.command {
            Commands::Decode { input, output, checksum, start } => {
                assert_eq!(input, "song.flac");
                assert!(output.is_none());
                assert!(checksum);
                assert_eq!(start, Some(12));
            }
            _ => panic!("expected decode"),
        }
    }

    #[test]
    fn test_output_conflicts_with_checksum() {
        assert!(Cli::try_parse_from(["tapedeck", "decode", "a.wav", "-o", "b.wav", "--checksum"]).is_err());
    }
}
