//! Wire payload construction.

use ngx_scaffold_core::TestBlock;

const DEFAULT_VERSION: &str = "HTTP/1.1";

/// Bytes to send, one element per separately written piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePayload {
    /// Pieces in send order.
    pub pieces: Vec<Vec<u8>>,
    /// Whether the request method is `HEAD` (the response has no body).
    pub head: bool,
}

impl WirePayload {
    /// All pieces concatenated.
    #[must_use]
    pub fn concat(&self) -> Vec<u8> {
        self.pieces.concat()
    }
}

/// Builds the payload for `block`, or `None` if it sends nothing.
///
/// `raw_request` bypasses all structural building.
#[must_use]
pub fn build(block: &TestBlock) -> Option<WirePayload> {
    if let Some(pieces) = block.raw_request() {
        let head = pieces.first().is_some_and(|p| p.starts_with(b"HEAD "));
        return Some(WirePayload {
            pieces: pieces.to_vec(),
            head,
        });
    }
    let request = block.request()?;
    Some(structured(request, block.more_headers()))
}

/// First line `METHOD URI [VERSION]`, remaining lines the body.
fn structured(request: &[u8], more_headers: &[(String, String)]) -> WirePayload {
    let (line, body) = match request.iter().position(|&b| b == b'\n') {
        Some(i) => (&request[..i], &request[i + 1..]),
        None => (request, &[][..]),
    };
    let line = String::from_utf8_lossy(line);
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("GET");
    let uri = parts.next().unwrap_or("/");
    let version = parts.next().unwrap_or(DEFAULT_VERSION);

    let has = |name: &str| more_headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name));

    let mut head = format!("{method} {uri} {version}\r\n");
    if !has("Host") {
        head.push_str("Host: localhost\r\n");
    }
    if !has("Connection") {
        head.push_str("Connection: close\r\n");
    }
    for (name, value) in more_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !body.is_empty() && !has("Content-Length") && !has("Transfer-Encoding") {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(body);
    WirePayload {
        pieces: vec![bytes],
        head: method.eq_ignore_ascii_case("HEAD"),
    }
}

#[cfg(test)]
mod tests {
    use ngx_scaffold_core::{ParseOptions, parse_suite};

    use super::*;

    fn block(doc: &str) -> TestBlock {
        parse_suite("t.t", doc, &ParseOptions::default())
            .unwrap()
            .suite
            .blocks
            .remove(0)
    }

    fn text(payload: &WirePayload) -> String {
        String::from_utf8(payload.concat()).unwrap()
    }

    #[test]
    fn test_simple_get_gets_default_headers() {
        let payload = build(&block("=== TEST 1\n--- request\nGET /t\n")).unwrap();
        assert_eq!(
            text(&payload),
            "GET /t HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        );
        assert!(!payload.head);
    }

    #[test]
    fn test_body_gets_content_length() {
        let payload = build(&block("=== TEST 1\n--- request\nPOST /t\nhello world\n")).unwrap();
        let t = text(&payload);
        assert!(t.starts_with("POST /t HTTP/1.1\r\n"));
        assert!(t.contains("Content-Length: 11\r\n"));
        assert!(t.ends_with("\r\n\r\nhello world"));
    }

    #[test]
    fn test_more_headers_override_defaults() {
        let payload = build(&block(
            "=== TEST 1\n--- request\nGET /t HTTP/1.0\n--- more_headers\nHost: example.com\nX-Foo: bar\n",
        ))
        .unwrap();
        let t = text(&payload);
        assert!(t.starts_with("GET /t HTTP/1.0\r\n"));
        assert!(t.contains("Host: example.com\r\n"));
        assert!(!t.contains("Host: localhost"));
        assert!(t.contains("X-Foo: bar\r\n"));
    }

    #[test]
    fn test_raw_request_is_sent_verbatim() {
        let payload = build(&block(
            "=== TEST 1\n--- raw_request eval\n[\"GET / HTTP/1.1\\r\\n\", \"\\r\\n\"]\n",
        ))
        .unwrap();
        assert_eq!(payload.pieces.len(), 2);
        assert_eq!(text(&payload), "GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_head_request_flagged() {
        assert!(build(&block("=== TEST 1\n--- request\nHEAD /\n")).unwrap().head);
    }

    #[test]
    fn test_no_request_sections() {
        assert!(build(&block("=== TEST 1\n--- config\n")).is_none());
    }
}
