use thiserror::Error;

/// Stable machine-readable error codes, one per [`ConnexError`] variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnexErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    TooManyConnections,
    TooManyConnectionsPerHost,
    PoolAlreadyClosed,
    MaxRedirect,
    MissingRedirectLocation,
    InvalidRedirectLocation,
    Connect,
    RemotelyClosed,
    ClientClosed,
    Cancelled,
    Io,
}

impl ConnexErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::TooManyConnections => "too_many_connections",
            Self::TooManyConnectionsPerHost => "too_many_connections_per_host",
            Self::PoolAlreadyClosed => "pool_already_closed",
            Self::MaxRedirect => "max_redirect",
            Self::MissingRedirectLocation => "missing_redirect_location",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::Connect => "connect",
            Self::RemotelyClosed => "remotely_closed",
            Self::ClientClosed => "client_closed",
            Self::Cancelled => "cancelled",
            Self::Io => "io",
        }
    }
}

/// Error surface of the connection-lifecycle core.
///
/// Admission failures (`TooManyConnections`, `TooManyConnectionsPerHost`)
/// are typed so callers can tell them apart from transport failures:
/// they are never retried automatically. `Connect` wraps the last
/// underlying cause after every resolved address has been attempted.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnexError {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("too many connections: {max}")]
    TooManyConnections { max: usize },
    #[error("too many connections per host: {max}")]
    TooManyConnectionsPerHost { max: usize },
    #[error("connection pool is already closed")]
    PoolAlreadyClosed,
    #[error("maximum redirect reached: {max}")]
    MaxRedirect { max: usize },
    #[error("redirect response {status} is missing a location header")]
    MissingRedirectLocation { status: u16 },
    #[error("invalid redirect location: {location}")]
    InvalidRedirectLocation { location: String },
    #[error("failed to connect to {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection was closed by the remote peer")]
    RemotelyClosed,
    #[error("client is closed")]
    ClientClosed,
    #[error("request was cancelled")]
    Cancelled,
    #[error("i/o error on channel: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },
}

impl ConnexError {
    pub const fn code(&self) -> ConnexErrorCode {
        match self {
            Self::InvalidUri { .. } => ConnexErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ConnexErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ConnexErrorCode::InvalidHeaderValue,
            Self::TooManyConnections { .. } => ConnexErrorCode::TooManyConnections,
            Self::TooManyConnectionsPerHost { .. } => ConnexErrorCode::TooManyConnectionsPerHost,
            Self::PoolAlreadyClosed => ConnexErrorCode::PoolAlreadyClosed,
            Self::MaxRedirect { .. } => ConnexErrorCode::MaxRedirect,
            Self::MissingRedirectLocation { .. } => ConnexErrorCode::MissingRedirectLocation,
            Self::InvalidRedirectLocation { .. } => ConnexErrorCode::InvalidRedirectLocation,
            Self::Connect { .. } => ConnexErrorCode::Connect,
            Self::RemotelyClosed => ConnexErrorCode::RemotelyClosed,
            Self::ClientClosed => ConnexErrorCode::ClientClosed,
            Self::Cancelled => ConnexErrorCode::Cancelled,
            Self::Io { .. } => ConnexErrorCode::Io,
        }
    }

    /// Whether this error is an admission-control rejection. Admission
    /// rejections must not trigger a transparent replay.
    pub const fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Self::TooManyConnections { .. } | Self::TooManyConnectionsPerHost { .. }
        )
    }
}
