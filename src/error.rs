use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while fetching a single URL.
///
/// HTTP-level failures (the server answered with a non-success status) are kept
/// apart from network-level failures (no usable answer at all).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP {status} for {url}")]
    Http { url: String, status: u16 },

    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },
}

impl FetchError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http { status, .. } => *status == 429 || *status >= 500,
            FetchError::Network { .. } => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("could not parse {url}: {message}")]
    Parse { url: String, message: String },

    #[error("render failed for {target}: {message}")]
    Render { target: String, message: String },

    #[error("render timed out after {seconds:.1}s for {target}")]
    RenderTimeout { target: String, seconds: f64 },

    #[error("merge failed: {0}")]
    Merge(String),

    #[error("{message}\n  hint: {remediation}")]
    Configuration { message: String, remediation: String },

    #[error("no pages could be rendered, nothing written to {}", .0.display())]
    NoOutput(PathBuf),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn configuration(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    pub fn render(target: impl Into<String>, message: impl ToString) -> Self {
        Error::Render {
            target: target.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
