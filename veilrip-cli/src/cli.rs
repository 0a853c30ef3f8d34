use std::path::PathBuf;

use clap::Parser;
use veilrip_engine::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "veilrip")]
#[command(
    about = "Fetch the best video and audio of a media identifier over rotating tor circuits \
             and merge them"
)]
#[command(version)]
pub struct Args {
    /// Media identifier to fetch (for example a video id)
    #[arg(value_name = "IDENTIFIER")]
    pub identifier: String,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory receiving the merged file
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Directory in which the track channels are created
    #[arg(long, value_name = "DIR")]
    pub channel_dir: Option<PathBuf>,

    /// Path of the tor binary
    #[arg(long, value_name = "PATH")]
    pub tor_path: Option<String>,

    /// Path of the youtube-dl compatible fetch tool
    #[arg(long, value_name = "PATH")]
    pub fetch_tool: Option<String>,

    /// Path of the ffmpeg binary
    #[arg(long, value_name = "PATH")]
    pub ffmpeg_path: Option<String>,

    /// Container extension of the merged file
    #[arg(long, value_name = "EXT")]
    pub container: Option<String>,

    /// Overwrite an existing output file
    #[arg(long)]
    pub overwrite: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    /// Apply command line overrides on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut EngineConfig) {
        if let Some(dir) = &self.output_dir {
            config.output.output_dir = dir.clone();
        }
        if let Some(dir) = &self.channel_dir {
            config.output.channel_dir = dir.clone();
        }
        if let Some(path) = &self.tor_path {
            config.circuit.binary = path.clone();
        }
        if let Some(path) = &self.fetch_tool {
            config.tools.fetch_tool = path.clone();
        }
        if let Some(path) = &self.ffmpeg_path {
            config.tools.muxer = path.clone();
        }
        if let Some(container) = &self.container {
            config.output.container = container.clone();
        }
        if self.overwrite {
            config.tools.overwrite = true;
        }
    }
}
