//! Core error type and artifact conventions shared across the iastkit workspace.

use thiserror::Error;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Config artifact embedded into the web archive; carries the agent key.
pub const ASOC_CONFIG_FILENAME: &str = "asoc-config.json";
/// Web archive inside the downloaded agent bundle.
pub const WAR_NAME: &str = "Secagent.war";
/// Re-published agent bundle name.
pub const AGENT_ZIP: &str = "IASTAgent.zip";
/// Staging name the raw agent download is written to.
pub const AGENT_TEMP_ZIP: &str = "IASTAgent.temp.zip";

/// Domain error for the provisioning toolkit.
///
/// Transport failures may be retried by the request layer before they
/// surface; schema failures indicate an incompatible API contract and
/// surface immediately.
#[derive(Debug, Error)]
pub enum IastError {
    /// HTTP/transport failure, after any retries were exhausted.
    #[error("{message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },
    /// Response received but its shape did not match the endpoint contract.
    #[error("{endpoint} failed: {detail}")]
    Schema {
        endpoint: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Domain failure that is neither a transport nor a schema problem
    /// (failed report generation, missing tenant defaults, and the like).
    #[error("{0}")]
    Other(String),
}

impl IastError {
    pub fn transport(message: impl Into<String>) -> Self {
        IastError::Transport {
            status: None,
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        IastError::Transport {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        IastError::Other(message.into())
    }

    pub fn schema(endpoint: &'static str, detail: impl Into<String>) -> Self {
        IastError::Schema {
            endpoint,
            detail: detail.into(),
        }
    }

    /// True for HTTP 4xx failures, which lookup endpoints downgrade to
    /// "not found" sentinels instead of propagating.
    pub fn is_client_error(&self) -> bool {
        matches!(self, IastError::Transport { status: Some(s), .. } if (400..500).contains(s))
    }
}

pub type Result<T> = std::result::Result<T, IastError>;
