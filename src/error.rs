use std::sync::Arc;

/// Represents a result type for operations in flagswitch.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while selecting, initializing or driving a
/// provider.
///
/// Malformed flag values are never reported as errors: resolver calls fall back to the supplied
/// default instead.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A configuration value required by a provider is absent.
    #[error("missing required configuration value {0}")]
    MissingConfiguration(&'static str),

    /// A configuration value is present but cannot be parsed.
    #[error("invalid value {value:?} for configuration {key}")]
    InvalidConfiguration {
        /// Name of the configuration value.
        key: &'static str,
        /// The rejected value.
        value: String,
    },

    /// Invalid base URL configuration.
    #[error("invalid base url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// A flag document could not be fetched.
    #[error("failed to load {path}: {reason}")]
    DocumentUnavailable {
        /// Document path relative to the documents base.
        path: String,
        /// Human-readable cause, e.g. `HTTP 404 Not Found`.
        reason: String,
    },

    /// A flag document was fetched but is not valid JSON of the expected shape.
    #[error("failed to parse {path}")]
    InvalidDocument {
        /// Document path relative to the documents base.
        path: String,
        /// Underlying parse error.
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// A remote service answered with a non-success status.
    #[error("{service} responded with HTTP {status}")]
    UnexpectedStatus {
        /// Which remote service was called.
        service: &'static str,
        /// HTTP status code.
        status: u16,
    },

    /// A realtime event stream broke mid-connection.
    #[error("realtime stream error: {0}")]
    Stream(String),

    /// The selected provider id is not registered.
    #[error("unknown provider {0:?}")]
    UnknownProvider(String),

    /// The selection prompt finished without a choice.
    #[error("no provider was selected")]
    SelectionCancelled,

    /// A provider registry was built with duplicate ids or without its default provider.
    #[error("invalid provider registry: {0}")]
    InvalidRegistry(String),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// JSON (de)serialization error outside of flag documents.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
