/// Canonical error kinds. These are kinds, not type
/// identifiers: several distinct upstream failures can map to the same
/// kind (e.g. any non-2xx from the provider adapter maps to
/// `ProviderAPIError`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    ConfigurationError,
    ProviderApiError,
    ProviderDoRequest,
    ProviderNetworkError,
    ProviderResponseDecode,
    ProviderResponseUnmarshal,
    ProviderResponseHtml,
    ProviderResponseEmpty,
    ProviderRequestTimedOut,
    RequestCancelled,
    UnsupportedOperation,
    ProviderShuttingDown,
    QueueFull,
    RateLimit,
    ContentionExceeded,
}

impl ErrorKind {
    /// Transport/rate-limit kinds the retry executor retries.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ProviderDoRequest | ErrorKind::ProviderNetworkError | ErrorKind::RateLimit
        )
    }

    /// Never retried, never falls back.
    pub fn never_falls_back(self) -> bool {
        matches!(self, ErrorKind::RequestCancelled)
    }
}

/// Extra fields attached to every `RouterError`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ExtraFields {
    pub request_type: Option<String>,
    pub provider: Option<String>,
    pub model_requested: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_request: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<serde_json::Value>,
}

/// The structured error returned to clients: unary calls get exactly one
/// of these; streams deliver one as a terminal chunk.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RouterError {
    pub kind: ErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    pub cause: Option<String>,
    /// `None` is treated as `true`.
    pub allow_fallbacks: Option<bool>,
    /// Set by provider implementations; never retried regardless of kind.
    pub internal: bool,
    pub extra: ExtraFields,
}

impl RouterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
            cause: None,
            allow_fallbacks: None,
            internal: false,
            extra: ExtraFields::default(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn cancelled() -> Self {
        let mut err = Self::new(ErrorKind::RequestCancelled, "request cancelled");
        err.allow_fallbacks = Some(false);
        err
    }

    pub fn with_extra(mut self, extra: ExtraFields) -> Self {
        self.extra = extra;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn allow_fallbacks(&self) -> bool {
        self.allow_fallbacks.unwrap_or(true)
    }

    /// An error is "empty by value" when it carries no status, an empty
    /// message, and no cause — the signal a PostHook uses to mean "this
    /// is not really an error, treat it as recovered". `ErrorKind` has no
    /// unset/default variant, so the kind itself is not part of this
    /// check: a `RouterError` built with `RouterError::new(kind, "")` and
    /// no status/cause reads as empty regardless of `kind`. See
    /// DESIGN.md for why this is left as-is.
    pub fn is_empty_by_value(&self) -> bool {
        self.status_code.is_none() && self.message.is_empty() && self.cause.is_none()
    }
}
