use std::path::PathBuf;

use audio_stream::DEFAULT_LATENCY_MS;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "streamer", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decode a local file and stream it to the output device
    Play {
        /// Path to audio file
        path: PathBuf,

        /// Use a specific output device by substring match
        #[arg(long)]
        device: Option<String>,

        /// Audio held by each of the four stream buffers, in milliseconds
        #[arg(long, default_value_t = DEFAULT_LATENCY_MS)]
        latency_ms: u32,

        /// Print state changes as JSON status lines
        #[arg(long)]
        json: bool,
    },
}
