//! HTTP helpers shared by the front-end and the upstream client

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use http_body_util::{BodyExt, Full, Limited};

use crate::config::LimitsConfig;
use crate::message::Response;
use crate::{GenproxyError, Result};

/// Body type of every response the front-end writes
pub type ProxyBody = Full<Bytes>;

/// Header carrying the fingerprint on playback misses
pub const FINGERPRINT_HEADER: &str = "x-genproxy-fingerprint";

/// Headers that apply to a single connection and are never forwarded
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Create a simple HTTP response
#[must_use]
pub fn create_response(status: StatusCode, body: impl Into<Bytes>) -> hyper::Response<ProxyBody> {
    let mut response = hyper::Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Convert an engine response into a hyper response
#[must_use]
pub fn into_hyper(response: Response) -> hyper::Response<ProxyBody> {
    let mut out = create_response(response.status, response.body);
    *out.headers_mut() = response.headers;
    out
}

/// Create an error response
#[must_use]
pub fn error_response(error: &GenproxyError) -> hyper::Response<ProxyBody> {
    let status = match error {
        GenproxyError::UpstreamUnavailable(_) | GenproxyError::RecordingNotFound(_) => {
            StatusCode::BAD_GATEWAY
        }
        GenproxyError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GenproxyError::DataTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        GenproxyError::TooManyHeaders { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        GenproxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut response = create_response(status, format!("Error: {error}"));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Response for a playback miss under the error policy
#[must_use]
pub fn miss_response(status: StatusCode, fingerprint: &str) -> hyper::Response<ProxyBody> {
    let error = GenproxyError::RecordingNotFound(fingerprint.to_string());
    let mut response = error_response(&error);
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(fingerprint) {
        response.headers_mut().insert(FINGERPRINT_HEADER, value);
    }
    response
}

/// Check header count and declared content length against limits
///
/// # Errors
///
/// Returns `TooManyHeaders` or `DataTooLarge`
pub fn validate_request(headers: &HeaderMap, limits: &LimitsConfig) -> Result<()> {
    if headers.len() > limits.max_headers {
        return Err(GenproxyError::TooManyHeaders {
            count: headers.len(),
            limit: limits.max_headers,
        });
    }

    if let Some(length) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
    {
        if length > limits.max_request_size {
            return Err(GenproxyError::DataTooLarge {
                size: length,
                limit: limits.max_request_size,
            });
        }
    }

    Ok(())
}

/// Read a request body with a size limit
///
/// # Errors
///
/// Returns `DataTooLarge` if the body exceeds `max_size`, or `BadRequest` if
/// reading fails
pub async fn read_body<B>(body: B, max_size: usize) -> Result<Bytes>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, max_size).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<http_body_util::LengthLimitError>() => Err(GenproxyError::DataTooLarge {
            size: max_size.saturating_add(1),
            limit: max_size,
        }),
        Err(e) => Err(GenproxyError::BadRequest(format!("Failed to read body: {e}"))),
    }
}
