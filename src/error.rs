//! Error taxonomy and client-facing error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Placeholder replaced by "<status> <reason>" in the operator error page
pub const STATUS_PLACEHOLDER: &str = "%%STATUS%%";

/// Built-in error page used when no template is configured or it is unusable
pub const BUILTIN_ERROR_PAGE: &str =
    "<!DOCTYPE html><html><head><title>%%STATUS%%</title></head>\
     <body><h1>%%STATUS%%</h1><p>routegate</p></body></html>";

/// Error codes for request-path failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Malformed request, missing or invalid Host header
    ClientProtocol,
    /// ACL rejected the request (Basic-Auth failure)
    Unauthorized,
    /// ACL rejected the request (IP rule)
    Forbidden,
    /// Unknown host or missing ACME token
    NotFound,
    /// DNS, connect, or TLS failure talking to the upstream
    UpstreamUnreachable,
    /// Upstream deadline hit
    UpstreamTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// HTTP status this error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::ClientProtocol => StatusCode::BAD_REQUEST,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::ClientProtocol => "CLIENT_PROTOCOL",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::Forbidden => "FORBIDDEN",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Render the operator error page for a status code.
///
/// The template's `%%STATUS%%` placeholder becomes "<code> <reason>". An
/// empty or placeholder-free template falls back to the built-in page.
pub fn render_error_page(template: &str, status: StatusCode) -> String {
    let reason = status.canonical_reason().unwrap_or("Error");
    let label = format!("{} {}", status.as_u16(), reason);

    let usable = !template.trim().is_empty() && template.contains(STATUS_PLACEHOLDER);
    let chosen = if usable { template } else { BUILTIN_ERROR_PAGE };

    chosen.replace(STATUS_PLACEHOLDER, &label)
}

/// Build an HTML error response from the operator error page template
pub fn error_page_response(
    code: ProxyErrorCode,
    template: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let status = code.status_code();
    let body = render_error_page(template, status);

    Response::builder()
        .status(status)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Build an empty response with extra headers (redirects, auth challenges)
pub fn empty_response(
    status: StatusCode,
    headers: &[(&str, &str)],
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder
        .body(
            Full::new(Bytes::new())
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::ClientProtocol.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::NotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyErrorCode::UpstreamUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::UpstreamTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_render_error_page_substitutes_status() {
        let html = render_error_page("<h1>%%STATUS%%</h1>", StatusCode::BAD_GATEWAY);
        assert_eq!(html, "<h1>502 Bad Gateway</h1>");
    }

    #[test]
    fn test_render_error_page_falls_back_when_empty() {
        let html = render_error_page("", StatusCode::NOT_FOUND);
        assert!(html.contains("404 Not Found"));
        assert!(html.contains("routegate"));
    }

    #[test]
    fn test_render_error_page_falls_back_without_placeholder() {
        let html = render_error_page("<h1>static page</h1>", StatusCode::NOT_FOUND);
        assert!(html.contains("404 Not Found"));
    }

    #[test]
    fn test_error_page_response_headers() {
        let response = error_page_response(ProxyErrorCode::UpstreamTimeout, "");
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "UPSTREAM_TIMEOUT"
        );
    }
}
