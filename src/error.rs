use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /* mapped errors */
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    SerdeYaml(#[from] serde_yml::Error),

    #[error(transparent)]
    ConfigError(#[from] config::ConfigError),

    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    TungsteniteError(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error(transparent)]
    OpenSslError(#[from] openssl::error::ErrorStack),

    #[error(transparent)]
    HexError(#[from] hex::FromHexError),

    #[error(transparent)]
    SetLoggerError(#[from] log::SetLoggerError),

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),

    /* neolia errors */
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{context}: HTTP {status} {reason}")]
    HttpStatus {
        context: String,
        status: u16,
        reason: String,
    },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Home Assistant client not connected")]
    NotConnected,

    #[error("Service error: {0}")]
    ServiceError(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ApiError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::TungsteniteError(Box::new(err))
    }
}

impl ApiError {
    #[must_use]
    pub const fn service_error(msg: String) -> Self {
        Self::ServiceError(msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn http_status(context: impl Into<String>, status: reqwest::StatusCode) -> Self {
        Self::HttpStatus {
            context: context.into(),
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
        }
    }

    /// The service was reachable but its answer had the wrong shape.
    #[must_use]
    pub const fn is_payload(&self) -> bool {
        matches!(
            self,
            Self::InvalidFormat(_) | Self::InvalidResponse(_) | Self::SerdeJson(_)
        )
    }

    /// The service could not be reached, or refused the request.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::HttpStatus { .. } | Self::ReqwestError(_) | Self::TungsteniteError(_)
        )
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
