//! Transport-level error taxonomy and the response surface the engine
//! observes.
//!
//! The engine never builds HTTP requests itself; it only needs to run
//! a unit of work and, afterwards, see the response's status code and
//! header map. [`ApiResponse`] is that surface. Unlike a raw client
//! response it is returned for *every* HTTP status: usage telemetry
//! rides on throttled and failed responses too, so turning non-2xx
//! into an error before the engine sees the headers would blind it.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use snafu::Snafu;

use crate::Error as CrateError;

/// Provider error codes that mean "rate limited" regardless of the
/// HTTP status they arrive under.
const RATE_LIMIT_ERROR_CODES: [i64; 4] = [4, 17, 32, 613];

/// Errors from the transport adapter itself. Server-side failures are
/// not listed here: those come back as an [`ApiResponse`] and become
/// an error only if the wrapper layer converts them.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    /// The request never completed (network, DNS, connection reset).
    #[snafu(display("HTTP transport error: {source}"))]
    Transport { source: CrateError },

    /// The request was malformed before sending.
    #[snafu(display("Invalid HTTP request: {details}"))]
    InvalidRequest { details: String },

    /// The transport-level timeout elapsed.
    #[snafu(display("HTTP request timed out"))]
    Timeout,

    /// The server answered with a status the wrapper chose to surface
    /// as an error.
    #[snafu(display("HTTP server error response (status {status}): {body}"))]
    ServerError { status: u16, body: String },

    /// Client-side processing failed after the response arrived.
    #[snafu(display("Generic HTTP client error: {source}"))]
    ClientError { source: CrateError },
}

/// One completed HTTP exchange: everything the engine needs to update
/// bucket state and classify the outcome.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: GraphApiError,
}

/// Graph-style error payload: `{"error":{"code":17,...}}`.
#[derive(Debug, Deserialize)]
pub struct GraphApiError {
    pub code: Option<i64>,
    #[serde(default)]
    pub error_subcode: Option<i64>,
    #[serde(default)]
    pub is_transient: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Parses the provider error object out of the body, if present.
    pub fn api_error(&self) -> Option<GraphApiError> {
        serde_json::from_slice::<ApiErrorBody>(&self.body)
            .ok()
            .map(|wrapper| wrapper.error)
    }

    /// Whether this response is a rate-limit rejection: HTTP 429, or a
    /// provider error body carrying one of the documented rate-limit
    /// codes.
    pub fn is_rate_limited(&self) -> bool {
        if self.status == StatusCode::TOO_MANY_REQUESTS {
            return true;
        }
        self.api_error().is_some_and(|error| {
            error
                .code
                .is_some_and(|code| RATE_LIMIT_ERROR_CODES.contains(&code))
        })
    }

    /// Converts a non-success response into the transport error shape,
    /// for wrapper layers that surface HTTP failures as errors.
    pub fn into_error(self) -> HttpError {
        HttpError::ServerError {
            status: self.status.as_u16(),
            body: String::from_utf8_lossy(&self.body).into_owned(),
        }
    }
}

/// Default rate-limit predicate for `execute_with_retry`: recognizes
/// the [`HttpError::ServerError`] shape produced by
/// [`ApiResponse::into_error`] with a 429 status or a rate-limit error
/// code in the body. Callers with their own error types supply their
/// own predicate.
pub fn is_rate_limit_error(error: &CrateError) -> bool {
    let Some(HttpError::ServerError { status, body }) = error.downcast_ref::<HttpError>() else {
        return false;
    };
    if *status == StatusCode::TOO_MANY_REQUESTS.as_u16() {
        return true;
    }
    serde_json::from_str::<ApiErrorBody>(body).is_ok_and(|wrapper| {
        wrapper
            .error
            .code
            .is_some_and(|code| RATE_LIMIT_ERROR_CODES.contains(&code))
    })
}
