use thiserror::Error;

/// Errors surfaced by the orchestrator core.
///
/// Story-level failures (fetcher/library outcomes) never appear here — those
/// are absorbed into [`crate::outcome::FetcherOutcome`] and the retry
/// pipeline. Only configuration and infrastructure failures that can reach a
/// process boundary are represented.
#[derive(Error, Debug)]
pub enum FetcherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("mailbox error: {0}")]
    Mailbox(String),

    #[error("external process error: {0}")]
    Process(String),

    #[error("library client error: {0}")]
    Library(String),

    #[error("notification dispatch error: {0}")]
    Notification(String),

    #[error("task {0} crashed after exhausting restart attempts")]
    TaskCrashed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FetcherError>;
