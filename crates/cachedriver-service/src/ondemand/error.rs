use thiserror::Error;

/// A failure of a single agent while handling an on-demand request.
///
/// These never escape the coordinator, they are logged and counted per agent.
#[derive(Debug, Error)]
pub enum OnDemandError {
    #[error("no cache registered for provider `{0}`")]
    UnknownProvider(String),
    #[error("failed to talk to the agent scheduler")]
    Lock(#[source] anyhow::Error),
    #[error("agent failed to handle the request")]
    Handle(#[source] anyhow::Error),
    #[error("failed to write the agent result to the cache")]
    CacheWrite(#[source] anyhow::Error),
    #[error("failed to evict deleted items from the cache")]
    Evict(#[source] anyhow::Error),
    /// The agent lock could not be released after data was written.
    ///
    /// Another run of the agent may have written in between, so the cache possibly holds stale
    /// data.
    #[error("failed to release the agent lock after writing, stale data was likely written")]
    StaleWrite(#[source] anyhow::Error),
    #[error("agent panicked: {0}")]
    Panicked(String),
}

impl OnDemandError {
    /// Whether this error signals a possibly corrupted cache partition.
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Self::StaleWrite(_))
    }
}
