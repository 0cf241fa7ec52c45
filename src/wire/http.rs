// Minimal HTTP/1.1 codec over any async byte stream.
//
// Both ends of every socket in this system are this crate, which keeps the
// dialect small: Content-Length framing only (no chunked encoding), one
// request in flight at a time, keep-alive by default. Bodies above the
// caller's limit are refused before allocation.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Cap on the request/status line plus all headers.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed http: {0}")]
    Malformed(&'static str),
    #[error("body exceeds limit")]
    TooLarge,
}

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("application/octet-stream")
    }
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

pub fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        206 => "Partial Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Read one request. `Ok(None)` means the peer closed the connection
/// cleanly between requests.
pub async fn read_request<S>(stream: &mut S, max_body: usize) -> Result<Option<Request>, HttpError>
where
    S: AsyncRead + Unpin,
{
    let head = match read_head(stream).await? {
        Some(head) => head,
        None => return Ok(None),
    };
    let mut lines = head.lines();
    let start = lines.next().ok_or(HttpError::Malformed("empty head"))?;
    let mut parts = start.split_whitespace();
    let method = parts
        .next()
        .ok_or(HttpError::Malformed("missing method"))?
        .to_string();
    let target = parts
        .next()
        .ok_or(HttpError::Malformed("missing target"))?
        .to_string();
    let version = parts.next().ok_or(HttpError::Malformed("missing version"))?;
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::Malformed("unsupported version"));
    }

    let headers = parse_headers(lines)?;
    let body = read_body(stream, &headers, max_body).await?;
    Ok(Some(Request {
        method,
        target,
        headers,
        body,
    }))
}

/// Read one response, including its Content-Length body.
pub async fn read_response<S>(stream: &mut S, max_body: usize) -> Result<Response, HttpError>
where
    S: AsyncRead + Unpin,
{
    let head = read_head(stream)
        .await?
        .ok_or(HttpError::Malformed("connection closed before response"))?;
    let mut lines = head.lines();
    let start = lines.next().ok_or(HttpError::Malformed("empty head"))?;
    let mut parts = start.split_whitespace();
    let version = parts.next().ok_or(HttpError::Malformed("missing version"))?;
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::Malformed("unsupported version"));
    }
    let status: u16 = parts
        .next()
        .ok_or(HttpError::Malformed("missing status"))?
        .parse()
        .map_err(|_| HttpError::Malformed("bad status"))?;

    let headers = parse_headers(lines)?;
    let body = read_body(stream, &headers, max_body).await?;
    Ok(Response {
        status,
        headers,
        body,
    })
}

pub async fn write_request<S>(
    stream: &mut S,
    method: &str,
    target: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<(), HttpError>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!("{method} {target} HTTP/1.1\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("content-length: {}\r\n\r\n", body.len()));
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn write_response<S>(
    stream: &mut S,
    status: u16,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<(), HttpError>
where
    S: AsyncWrite + Unpin,
{
    write_response_head(stream, status, headers, body.len() as u64).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Write status line and headers only; the caller streams the body
/// (exactly `content_length` bytes) afterwards.
pub async fn write_response_head<S>(
    stream: &mut S,
    status: u16,
    headers: &[(&str, &str)],
    content_length: u64,
) -> Result<(), HttpError>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {status} {}\r\n", reason(status));
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("content-length: {content_length}\r\n\r\n"));
    stream.write_all(head.as_bytes()).await?;
    Ok(())
}

async fn read_head<S>(stream: &mut S) -> Result<Option<String>, HttpError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(HttpError::Malformed("connection closed mid-head"));
        }
        head.push(byte[0]);
        if head.len() > MAX_HEAD_BYTES {
            return Err(HttpError::Malformed("head too large"));
        }
        if head.ends_with(b"\r\n\r\n") {
            head.truncate(head.len() - 4);
            let text =
                String::from_utf8(head).map_err(|_| HttpError::Malformed("non-utf8 head"))?;
            return Ok(Some(text));
        }
    }
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>, HttpError> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpError::Malformed("bad header line"))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
    Ok(headers)
}

async fn read_body<S>(
    stream: &mut S,
    headers: &[(String, String)],
    max_body: usize,
) -> Result<Vec<u8>, HttpError>
where
    S: AsyncRead + Unpin,
{
    let length: usize = match header(headers, "content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| HttpError::Malformed("bad content-length"))?,
        None => 0,
    };
    if length > max_body {
        return Err(HttpError::TooLarge);
    }
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Parse a `Range` header value into an end-exclusive byte window.
///
/// Only the single-range forms `bytes=a-b`, `bytes=a-`, and `bytes=-n`
/// are understood. `None` means "serve the whole file" (unparseable or
/// unsatisfiable ranges degrade to a full response).
pub fn parse_range(value: &str, size: u64) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;
    if start_str.is_empty() {
        // suffix form: last n bytes
        let n: u64 = end_str.parse().ok()?;
        if n == 0 || size == 0 {
            return None;
        }
        return Some((size.saturating_sub(n), size));
    }
    let start: u64 = start_str.parse().ok()?;
    if start >= size {
        return None;
    }
    let end = if end_str.is_empty() {
        size
    } else {
        let last: u64 = end_str.parse().ok()?;
        if last < start {
            return None;
        }
        (last + 1).min(size)
    };
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_request(
            &mut client,
            "POST",
            "/",
            &[("content-type", "text/plain")],
            b"hello",
        )
        .await
        .unwrap();

        let request = read_request(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.target, "/");
        assert_eq!(request.content_type(), "text/plain");
        assert_eq!(request.body, b"hello");
    }

    #[tokio::test]
    async fn test_response_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_response(&mut server, 201, &[], b"").await.unwrap();

        let response = read_response(&mut client, 1024).await.unwrap();
        assert_eq!(response.status, 201);
        assert!(response.is_success());
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_keepalive_sequential_requests() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        for body in [b"one".as_slice(), b"two".as_slice()] {
            write_request(&mut client, "POST", "/", &[], body).await.unwrap();
        }
        drop(client);

        let first = read_request(&mut server, 1024).await.unwrap().unwrap();
        let second = read_request(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(first.body, b"one");
        assert_eq!(second.body, b"two");
        // Clean close after the last request
        assert!(read_request(&mut server, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_body_limit_enforced() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_request(&mut client, "POST", "/", &[], &[0u8; 512]).await.unwrap();

        let result = read_request(&mut server, 100).await;
        assert!(matches!(result, Err(HttpError::TooLarge)));
    }

    #[tokio::test]
    async fn test_header_lookup_is_case_insensitive() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_request(&mut client, "GET", "/f/x", &[("Range", "bytes=0-9")], b"")
            .await
            .unwrap();
        let request = read_request(&mut server, 0).await.unwrap().unwrap();
        assert_eq!(request.header("range"), Some("bytes=0-9"));
        assert_eq!(request.header("RANGE"), Some("bytes=0-9"));
    }

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("bytes=0-9", 100), Some((0, 10)));
        assert_eq!(parse_range("bytes=90-", 100), Some((90, 100)));
        assert_eq!(parse_range("bytes=-10", 100), Some((90, 100)));
        // Last chunk of an uneven file
        assert_eq!(parse_range("bytes=90-199", 100), Some((90, 100)));
    }

    #[test]
    fn test_parse_range_rejects_unsatisfiable() {
        assert_eq!(parse_range("bytes=100-", 100), None);
        assert_eq!(parse_range("bytes=5-4", 100), None);
        assert_eq!(parse_range("bytes=0-9,20-29", 100), None);
        assert_eq!(parse_range("chunks=0-9", 100), None);
        assert_eq!(parse_range("bytes=-0", 100), None);
    }
}
