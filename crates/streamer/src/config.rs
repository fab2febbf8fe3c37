use std::path::PathBuf;

/// Settings for a single `play` run.
#[derive(Clone, Debug)]
pub struct StreamPlayConfig {
    pub path: PathBuf,
    pub device: Option<String>,
    pub latency_ms: u32,
    /// Emit state changes as JSON status lines instead of log records.
    pub json: bool,
}
