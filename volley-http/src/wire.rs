//! HTTP/1.1 wire-size accounting for `data_sent` / `data_received`.
//!
//! Sizes are computed from what we hand to hyper, with Host and Content-Length made explicit,
//! so they are deterministic for a given request.

const CRLF: u64 = 2;

pub(crate) fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
}

pub(crate) fn host_header_value(parsed: &url::Url) -> Option<String> {
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{host}:{port}")),
        None => Some(host.to_string()),
    }
}

fn header_line(name: &[u8], value: &[u8]) -> u64 {
    // "name: value\r\n"
    name.len() as u64 + 2 + value.len() as u64 + CRLF
}

/// Request line + headers + blank line + body. `headers` must already include any implicit
/// headers the client adds.
pub(crate) fn request_bytes(
    method: &http::Method,
    uri: &hyper::Uri,
    headers: &http::HeaderMap,
    body_len: u64,
) -> u64 {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    // "METHOD SP path SP HTTP/1.1 CRLF"
    let line = method.as_str().len() as u64 + 1 + path.len() as u64 + 1 + 8 + CRLF;
    let head: u64 = headers
        .iter()
        .map(|(k, v)| header_line(k.as_str().as_bytes(), v.as_bytes()))
        .sum();
    line + head + CRLF + body_len
}

/// Status line + headers + blank line. The reason phrase is not counted.
pub(crate) fn response_head_bytes(
    version: http::Version,
    status: http::StatusCode,
    headers: &http::HeaderMap,
) -> u64 {
    let version = match version {
        http::Version::HTTP_10 => "HTTP/1.0",
        http::Version::HTTP_2 => "HTTP/2",
        http::Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/1.1",
    };
    let line = version.len() as u64 + 1 + status.as_str().len() as u64 + CRLF;
    let head: u64 = headers
        .iter()
        .map(|(k, v)| header_line(k.as_str().as_bytes(), v.as_bytes()))
        .sum();
    line + head + CRLF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_bytes_counts_line_headers_and_body() {
        let uri: hyper::Uri = "http://localhost:8080/team/get?team_name=a"
            .parse()
            .unwrap_or_else(|e| panic!("{e}"));
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::HOST, http::HeaderValue::from_static("localhost:8080"));

        // "GET /team/get?team_name=a HTTP/1.1\r\n" = 36
        // "host: localhost:8080\r\n" = 22
        // "\r\n" = 2
        assert_eq!(request_bytes(&http::Method::GET, &uri, &headers, 0), 60);
        assert_eq!(request_bytes(&http::Method::GET, &uri, &headers, 10), 70);
    }

    #[test]
    fn response_head_ignores_reason_phrase() {
        let headers = http::HeaderMap::new();
        // "HTTP/1.1 201\r\n\r\n"
        assert_eq!(
            response_head_bytes(http::Version::HTTP_11, http::StatusCode::CREATED, &headers),
            16
        );
    }

    #[test]
    fn host_header_keeps_explicit_port() {
        let parsed = url::Url::parse("http://127.0.0.1:9000/health").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(host_header_value(&parsed).as_deref(), Some("127.0.0.1:9000"));
        let parsed = url::Url::parse("http://example.com:80/").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(host_header_value(&parsed).as_deref(), Some("example.com"));
    }
}
