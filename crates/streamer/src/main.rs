//! Streamer: a small CLI that decodes an audio file and plays it through the
//! buffer-ring stream engine on a CPAL output device.
//!
//! ## Pipeline
//! 1. **Decode**: Symphonia decodes the whole file into interleaved `f32` PCM bytes.
//! 2. **Stream**: the engine's worker cycles four latency-sized buffers through the backend.
//! 3. **Output**: the CPAL callback renders queued buffers and reports them processed.

mod cli;
mod config;
mod decode;
mod runtime;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::config::StreamPlayConfig;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,streamer=info")),
        )
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    match args.cmd {
        Some(cli::Command::Play {
            path,
            device,
            latency_ms,
            json,
        }) => runtime::run_play(StreamPlayConfig {
            path,
            device,
            latency_ms,
            json,
        }),
        None => {
            cli::Args::command().print_help()?;
            Ok(())
        }
    }
}
