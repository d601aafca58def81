//! A shared `reqwest::Client` plus the status/transport classification
//! that feeds `router-engine`'s retry executor: one cached client per
//! process, built once.

use std::sync::OnceLock;

use router_common::{ErrorKind, RouterError};

static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

pub(crate) fn shared_client() -> reqwest::Client {
    CLIENT
        .get_or_init(|| {
            reqwest::Client::builder()
                .build()
                .expect("failed to build the shared upstream HTTP client")
        })
        .clone()
}

/// Maps a `reqwest::Error` to the router's transport-error kinds.
/// Everything that happens before/while receiving a response (DNS,
/// connect, TLS, timeout) is `ProviderDoRequest`/`ProviderNetworkError`
/// depending on whether it is a timeout.
pub(crate) fn classify_transport_error(provider: &str, err: reqwest::Error) -> RouterError {
    let kind = if err.is_timeout() {
        ErrorKind::ProviderRequestTimedOut
    } else if err.is_connect() {
        ErrorKind::ProviderDoRequest
    } else {
        ErrorKind::ProviderNetworkError
    };
    RouterError::new(kind, format!("{provider}: {err}"))
}

/// A non-2xx response from the upstream: carries the HTTP status and
/// the provider's own error body.
pub(crate) fn api_error(provider: &str, status: u16, body: &str) -> RouterError {
    RouterError::new(ErrorKind::ProviderApiError, format!("{provider}: {body}")).with_status(status)
}

/// A response body that didn't parse as JSON.
pub(crate) fn decode_error(provider: &str, err: impl std::fmt::Display) -> RouterError {
    RouterError::new(
        ErrorKind::ProviderResponseUnmarshal,
        format!("{provider}: failed to decode upstream response: {err}"),
    )
}

pub(crate) fn unsupported(provider: &str, op: router_provider::Op) -> RouterError {
    RouterError::new(
        ErrorKind::UnsupportedOperation,
        format!("{provider} does not implement {op:?}"),
    )
}
