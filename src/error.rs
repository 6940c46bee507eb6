use std::path::PathBuf;

/// Boxed error returned by external collaborators such as a publish sink.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Buffered bytes could not be split into frames and were discarded.
    #[error("framing lost; discarded {buffered} buffered bytes (frame limit {expected})")]
    Framing {
        /// Number of bytes discarded
        buffered: usize,
        /// Frame length, or maximum line length, the buffer was checked against
        expected: usize,
    },

    /// A frame's fields could not be parsed.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Device and host clocks diverged beyond the configured threshold.
    #[error("large time difference: drift {drift:.3}s exceeds {threshold:.3}s")]
    Drift { drift: f64, threshold: f64 },

    /// A record could not be packed into its binary layout.
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("publish to {topic} failed")]
    Sink {
        topic: String,
        #[source]
        source: BoxError,
    },

    #[error("storage write to {path:?} failed")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
