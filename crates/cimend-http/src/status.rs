//! HTTP status and transport error classification.

use cimend_core::provider::ProviderError;
use cimend_core::scm::ScmError;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

/// Maximum length of a response body quoted in an error.
const MAX_ERROR_BODY_LEN: usize = 300;

/// Clip a response body for inclusion in an error message.
pub fn clip_body(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY_LEN) {
        Some((idx, _)) => format!("{}... (truncated)", &body[..idx]),
        None => body.to_string(),
    }
}

/// `Retry-After` in seconds, if present and numeric.
pub fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn rate_limit_exhausted(headers: &HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false)
}

/// Map a non-success GitHub response to an [`ScmError`].
pub fn scm_error(status: StatusCode, headers: &HeaderMap, body: &str) -> ScmError {
    let detail = format!("{status}: {}", clip_body(body));
    match status.as_u16() {
        404 => ScmError::NotFound(detail),
        429 => ScmError::RateLimited {
            retry_after_secs: retry_after(headers),
        },
        403 if rate_limit_exhausted(headers) || retry_after(headers).is_some() => {
            ScmError::RateLimited {
                retry_after_secs: retry_after(headers),
            }
        }
        401 | 403 => ScmError::PermissionDenied(detail),
        409 | 422 => ScmError::Conflict(detail),
        s if s >= 500 => ScmError::Transient(detail),
        _ => ScmError::Other(detail),
    }
}

/// Map a transport-level failure to an [`ScmError`].
pub fn scm_transport_error(err: reqwest::Error) -> ScmError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ScmError::Transient(err.to_string())
    } else if err.is_decode() {
        ScmError::Other(format!("unexpected response body: {err}"))
    } else {
        ScmError::Other(err.to_string())
    }
}

/// Map a non-success chat-completions response to a [`ProviderError`].
pub fn provider_error(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
    match status.as_u16() {
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after(headers),
        },
        code => ProviderError::Api {
            status: code,
            message: clip_body(body),
        },
    }
}

/// Map a transport-level failure to a [`ProviderError`].
pub fn provider_transport_error(err: reqwest::Error, limit_ms: u64) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout { limit_ms }
    } else if err.is_decode() {
        ProviderError::MalformedResponse(err.to_string())
    } else {
        ProviderError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_scm_status_mapping() {
        let none = HeaderMap::new();
        let map = |code: u16| scm_error(StatusCode::from_u16(code).unwrap(), &none, "{}");
        assert!(matches!(map(404), ScmError::NotFound(_)));
        assert!(matches!(map(401), ScmError::PermissionDenied(_)));
        assert!(matches!(map(403), ScmError::PermissionDenied(_)));
        assert!(matches!(map(409), ScmError::Conflict(_)));
        assert!(matches!(map(422), ScmError::Conflict(_)));
        assert!(matches!(map(502), ScmError::Transient(_)));
        assert!(matches!(map(400), ScmError::Other(_)));
    }

    #[test]
    fn test_forbidden_with_exhausted_quota_is_rate_limited() {
        let h = headers(&[("x-ratelimit-remaining", "0")]);
        assert_eq!(
            scm_error(StatusCode::FORBIDDEN, &h, "API rate limit exceeded"),
            ScmError::RateLimited {
                retry_after_secs: None
            }
        );

        let h = headers(&[("retry-after", "60")]);
        assert_eq!(
            scm_error(StatusCode::FORBIDDEN, &h, "secondary rate limit"),
            ScmError::RateLimited {
                retry_after_secs: Some(60)
            }
        );
    }

    #[test]
    fn test_provider_status_mapping() {
        let h = headers(&[("retry-after", "7")]);
        assert_eq!(
            provider_error(StatusCode::TOO_MANY_REQUESTS, &h, ""),
            ProviderError::RateLimited {
                retry_after_secs: Some(7)
            }
        );
        let err = provider_error(StatusCode::SERVICE_UNAVAILABLE, &HeaderMap::new(), "overloaded");
        assert!(err.is_transient());
        let err = provider_error(StatusCode::UNAUTHORIZED, &HeaderMap::new(), "bad key");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_clip_body_truncates_long_bodies() {
        let long = "x".repeat(1000);
        let clipped = clip_body(&long);
        assert!(clipped.len() < 400);
        assert!(clipped.ends_with("(truncated)"));
        assert_eq!(clip_body("  short  "), "short");
    }
}
