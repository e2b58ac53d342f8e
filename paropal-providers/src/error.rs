use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0} cannot be empty")]
    EmptyIdentifier(&'static str),

    #[error("create instance response missing instance id")]
    MissingInstanceId,

    #[error("block storage already attached: {0}")]
    AlreadyAttached(String),

    #[error("build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request {path} failed: {source}")]
    Http {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned {status}: {body}")]
    Status {
        path: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("decode {path} response: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("parse pagination link {link:?}: {message}")]
    Pagination { link: String, message: String },
}

impl ProviderError {
    pub fn is_already_attached(&self) -> bool {
        matches!(self, ProviderError::AlreadyAttached(_))
    }
}

/// Provider error bodies are free text; this is the only signal we get.
pub fn mentions_already_attached(text: &str) -> bool {
    let t = text.to_lowercase();
    t.contains("already attached") || t.contains("already in use")
}
