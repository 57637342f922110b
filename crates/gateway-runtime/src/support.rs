//! Shared adapter plumbing: HTTP status and transport classification
//! into the canonical taxonomy, Retry-After parsing, and system-prompt
//! hoisting.

use std::time::Duration;

use gateway_core::{GatewayError, Message, Role};

/// Map an HTTP status + body excerpt into the canonical taxonomy.
pub(crate) fn classify_status(
    provider: &str,
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> GatewayError {
    let excerpt: String = body.chars().take(300).collect();
    match status {
        401 | 403 => GatewayError::Auth(format!("{provider} rejected credentials: {excerpt}")),
        404 => GatewayError::ModelNotFound(format!("{provider}: {excerpt}")),
        400 | 413 | 422 => GatewayError::InvalidRequest(format!("{provider}: {excerpt}")),
        429 => GatewayError::RateLimited {
            message: format!("{provider}: {excerpt}"),
            retry_after,
        },
        500..=599 => GatewayError::Unavailable(format!("{provider} returned {status}: {excerpt}")),
        _ => GatewayError::Unavailable(format!(
            "{provider} returned unexpected status {status}: {excerpt}"
        )),
    }
}

/// Map a reqwest transport error into the canonical taxonomy.
pub(crate) fn classify_transport(provider: &str, err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(format!("{provider}: {err}"))
    } else if err.is_connect() {
        GatewayError::Network(format!("{provider}: connection failed: {err}"))
    } else {
        GatewayError::Network(format!("{provider}: {err}"))
    }
}

/// Map a server-sent-events error into the canonical taxonomy.
/// `StreamEnded` is not an error and must be handled by the caller.
pub(crate) fn classify_sse(provider: &str, err: &reqwest_eventsource::Error) -> GatewayError {
    use reqwest_eventsource::Error as Es;
    match err {
        Es::InvalidStatusCode(status, _) => {
            classify_status(provider, status.as_u16(), "streaming request rejected", None)
        }
        Es::Transport(e) => classify_transport(provider, e),
        other => GatewayError::Network(format!("{provider}: event stream failed: {other}")),
    }
}

/// Parse a Retry-After header value (delta-seconds form only).
pub(crate) fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Hoist the leading system message out of a validated sequence.
/// Returns the system text (if any) and the conversational remainder.
pub(crate) fn split_system(messages: &[Message]) -> (Option<&str>, &[Message]) {
    match messages.first() {
        Some(m) if m.role == Role::System => (Some(m.content.as_str()), &messages[1..]),
        _ => (None, messages),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status("p", 401, "", None).kind(), "auth_error");
        assert_eq!(classify_status("p", 404, "", None).kind(), "model_not_found");
        assert_eq!(classify_status("p", 400, "", None).kind(), "invalid_request");
        assert_eq!(classify_status("p", 429, "", None).kind(), "rate_limited");
        assert_eq!(classify_status("p", 503, "", None).kind(), "unavailable");
    }

    #[test]
    fn retry_after_propagates() {
        let err = classify_status("p", 429, "", Some(Duration::from_secs(7)));
        match err {
            GatewayError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn system_hoisting() {
        let msgs = vec![Message::system("rules"), Message::user("hi")];
        let (system, rest) = split_system(&msgs);
        assert_eq!(system, Some("rules"));
        assert_eq!(rest.len(), 1);

        let msgs = vec![Message::user("hi")];
        let (system, rest) = split_system(&msgs);
        assert!(system.is_none());
        assert_eq!(rest.len(), 1);
    }
}
