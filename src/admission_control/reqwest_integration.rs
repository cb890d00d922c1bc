//! A `tower::Service` wrapper for `reqwest::Client` that surfaces the
//! full telemetry surface of each exchange.
//!
//! The service resolves with [`ApiResponse`] for every HTTP status,
//! 4xx/5xx included, because usage headers arrive on failures too.
//! Only transport-level problems (network, timeout, body read) become
//! errors.

use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::Request as HttpRequest;
use tower::Service;

use super::http::{ApiResponse, HttpError};

/// Accepts `http::Request<Option<Bytes>>` and performs one HTTP call.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<HttpRequest<Option<Bytes>>> for ReqwestTransport {
    type Response = ApiResponse;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, http_request: HttpRequest<Option<Bytes>>) -> Self::Future {
        let (parts, body) = http_request.into_parts();

        let url_str = parts.uri.to_string();
        let url = match reqwest::Url::parse(&url_str) {
            Ok(url) => url,
            Err(parse_err) => {
                let error = HttpError::InvalidRequest {
                    details: format!("Invalid URL '{url_str}': {parse_err}"),
                };
                return Box::pin(async move { Err(error) });
            }
        };

        let mut request_builder = self.client.request(parts.method, url);
        for (header_name, header_value) in parts.headers.iter() {
            request_builder = request_builder.header(header_name, header_value);
        }
        if let Some(body) = body {
            request_builder = request_builder.body(reqwest::Body::from(body));
        }

        let request_future = request_builder.send();
        Box::pin(async move {
            match request_future.await {
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    let body = response.bytes().await.map_err(|e| HttpError::ClientError {
                        source: Box::new(e),
                    })?;

                    if status.is_server_error() || status.as_u16() == 429 {
                        warn!(status = %status, "Server error or rate limited");
                    } else if status.is_client_error() {
                        warn!(status = %status, "Client error response");
                    }

                    Ok(ApiResponse {
                        status,
                        headers,
                        body,
                    })
                }
                Err(e) => {
                    if e.is_timeout() {
                        warn!(error = %e, "Request timed out");
                        Err(HttpError::Timeout)
                    } else if e.is_connect() {
                        error!(error = %e, "Connection error");
                        Err(HttpError::Transport {
                            source: Box::new(e),
                        })
                    } else {
                        error!(error = %e, "Other reqwest error");
                        Err(HttpError::ClientError {
                            source: Box::new(e),
                        })
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relative_uri_is_rejected_before_any_network_io() {
        let mut transport = ReqwestTransport::new();
        let request = HttpRequest::builder()
            .method("GET")
            .uri("/relative/path")
            .body(None)
            .unwrap();
        let error = transport.call(request).await.unwrap_err();
        assert!(matches!(error, HttpError::InvalidRequest { .. }));
    }
}
