//! Crawler and lease-expirer errors (spec.md §7).

#[derive(Debug, thiserror::Error)]
pub enum CrawlerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crawler state file is malformed: {0}")]
    MalformedState(#[from] serde_json::Error),

    #[error("legacy pickle state could not be migrated: {0}")]
    InvalidPickle(String),

    /// Fatal at construction (spec.md §4.H): bad `expiration.mode`, or an
    /// override/cutoff value missing for the selected mode.
    #[error("invalid crawler configuration: {0}")]
    InvalidConfig(String),

    #[error("share container error: {0}")]
    Format(#[from] storage_format::FormatError),
}

pub type Result<T> = std::result::Result<T, CrawlerError>;
