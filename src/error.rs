use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the core orchestration layers.
///
/// External-tool failures (git, tmux) are reported through `anyhow` with the
/// tool's own stderr preserved verbatim; this enum covers the cases callers
/// need to match on.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Bad or missing user input: unknown agent, ambiguous target, invalid config.
    #[error("{0}")]
    Input(String),

    /// The session registry exists but cannot be parsed. Never paved over
    /// with an empty mapping.
    #[error("session registry {path} is corrupt: {source}")]
    CorruptRegistry {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Every port in the configured range is taken.
    #[error("no free port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },
}
