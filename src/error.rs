use thiserror::Error;

/// Failures a resolve can surface to the HTTP layer. Probe failures are
/// deliberately absent: they degrade to empty metadata and never fail a
/// resolve.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no playable file in source")]
    UnsupportedInput,

    #[error("remote source returned {0}")]
    UpstreamRemote(u16),

    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}
