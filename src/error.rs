use crate::types::CommunityId;
use std::fmt;
use thiserror::Error;

/// Collaborator error type shared by every store, cache and broker trait.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Step of a registry refresh that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStep {
    /// Community identifier validation.
    Validate,
    /// Remote metadata fetch.
    FetchMetadata,
    /// Remote bulk dataset fetch.
    FetchBulk,
    /// Local table replacement.
    ReplaceLocal,
    /// Copy into the history table.
    ImportHistory,
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validate => "validate",
            Self::FetchMetadata => "fetch-metadata",
            Self::FetchBulk => "fetch-bulk",
            Self::ReplaceLocal => "replace-local",
            Self::ImportHistory => "import-history",
        };
        f.write_str(name)
    }
}

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid session, denylisted address or disabled account.
    #[error("unauthorized")]
    Authentication,
    /// Capability check failed.
    #[error("forbidden")]
    Authorization,
    /// Caller input rejected.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// No reply arrived before the deadline.
    #[error("task {task} timed out after {timeout_ms}ms")]
    UpstreamTimeout { task: String, timeout_ms: u64 },
    /// The worker replied with an error or `success: false`.
    #[error("task {task} failed: {message}")]
    UpstreamApplication { task: String, message: String },
    /// Broker connection or publish failure.
    #[error("broker error: {0}")]
    Broker(#[source] StoreError),
    /// Cache tier or loader failure.
    #[error("cache error: {0}")]
    Cache(#[source] StoreError),
    /// Store error wrapper.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A registry refresh aborted.
    #[error("registry refresh failed at {step}: {source}")]
    Workflow {
        step: WorkflowStep,
        #[source]
        source: Box<Error>,
    },
    /// A refresh for the same community is already running.
    #[error("refresh already running for community {0}")]
    WorkflowBusy(CommunityId),
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl Error {
    /// Wraps an error with the workflow step it aborted.
    pub fn at_step(self, step: WorkflowStep) -> Self {
        Self::Workflow {
            step,
            source: Box::new(self),
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Authentication => 401,
            Self::Authorization => 403,
            Self::Validation(_) | Self::InvalidId(_) => 400,
            Self::UpstreamTimeout { .. } => 504,
            Self::UpstreamApplication { .. } => 502,
            Self::WorkflowBusy(_) => 409,
            Self::Workflow { source, .. } => source.status_code(),
            Self::Broker(_) | Self::Cache(_) | Self::Store(_) | Self::Serialization(_) => 500,
        }
    }

    /// Message safe to show to API clients.
    ///
    /// Authentication failures never reveal which check failed and internal
    /// errors never carry their source chain.
    pub fn public_message(&self) -> String {
        match self {
            Self::Authentication => "unauthorized".to_string(),
            Self::Authorization => "forbidden".to_string(),
            Self::Validation(message) | Self::InvalidId(message) => message.clone(),
            Self::UpstreamTimeout { .. } => "upstream service did not respond in time".to_string(),
            Self::UpstreamApplication { message, .. } => message.clone(),
            Self::WorkflowBusy(_) => self.to_string(),
            Self::Workflow { source, .. } => source.public_message(),
            Self::Broker(_) | Self::Cache(_) | Self::Store(_) | Self::Serialization(_) => {
                "internal error".to_string()
            }
        }
    }
}
