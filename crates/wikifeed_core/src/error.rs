use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// Structured error reported by the remote API; displays as `info`.
    #[error("{info}")]
    Api { code: String, info: String },
    #[error("write token unavailable: {0}")]
    TokenUnavailable(String),
    #[error("operation did not report success")]
    OperationNotConfirmed,
    #[error("{} of {total} requests failed", .errors.len())]
    Aggregate {
        total: usize,
        errors: Vec<ClientError>,
    },
}

impl ClientError {
    pub(crate) fn decode(what: &'static str, source: serde_json::Error) -> Self {
        Self::Decode { what, source }
    }

    /// API error code, when the remote API produced one.
    pub fn api_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, serde::Deserialize, Default, Clone, PartialEq, Eq)]
pub(crate) struct WireError {
    pub code: Option<String>,
    pub info: Option<String>,
}

impl From<WireError> for ClientError {
    fn from(value: WireError) -> Self {
        Self::Api {
            code: value.code.unwrap_or_else(|| "unknown_error".to_string()),
            info: value.info.unwrap_or_else(|| "unknown info".to_string()),
        }
    }
}
