use std::fmt;

/// Request-path error taxonomy. Each kind carries its HTTP surface and its
/// routing policy (retryable, breaker impact) in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    UpstreamUnavailable,
    UpstreamFailure,
    UpstreamRateLimited,
    ClientDisconnect,
    BadUpstreamPayload,
    ConfigurationError,
}

impl ErrorKind {
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::UpstreamUnavailable => 503,
            ErrorKind::UpstreamFailure => 502,
            ErrorKind::UpstreamRateLimited => 429,
            ErrorKind::ClientDisconnect => 499,
            ErrorKind::BadUpstreamPayload => 502,
            ErrorKind::ConfigurationError => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::UpstreamFailure => "upstream_failure",
            ErrorKind::UpstreamRateLimited => "upstream_rate_limited",
            ErrorKind::ClientDisconnect => "client_disconnect",
            ErrorKind::BadUpstreamPayload => "bad_upstream_payload",
            ErrorKind::ConfigurationError => "configuration_error",
        }
    }

    /// Whether the coordinator may fail over to another upstream, provided
    /// no byte has been written downstream yet.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::UpstreamFailure | ErrorKind::UpstreamRateLimited
        )
    }
}

#[derive(Debug, Clone)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for GatewayError {}
