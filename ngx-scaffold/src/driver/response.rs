//! Best-effort HTTP/1.x response parsing.
//!
//! The parser never fails: it extracts as much structure as the bytes
//! allow and names the first structural problem it finds in a
//! [`WellFormedness`] value. Whether that problem matters is the
//! evaluator's decision.

use std::fmt;

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// The status code or request method forbids a body.
    NoBody,
    /// `Content-Length: n`.
    ContentLength(usize),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// The body runs until the connection closes.
    CloseDelimited,
}

/// Structural problems, in the order the parser looks for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseProblem {
    /// Nothing was received.
    Empty,
    /// The header block never ended with an empty line.
    MissingHeaderTerminator,
    /// The first line is not `HTTP/x.y NNN reason`.
    BadStatusLine(String),
    /// A header line has no colon.
    BadHeaderLine(String),
    /// `Content-Length` is not a number.
    BadContentLength(String),
    /// Fewer body bytes than `Content-Length` announced.
    TruncatedBody {
        /// Announced length
        expected: usize,
        /// Bytes received
        actual: usize,
    },
    /// A chunk size line is not hexadecimal.
    BadChunkSize(String),
    /// The stream ended before the zero-size last chunk and its CRLF.
    MissingLastChunk,
    /// Only an interim `1xx` head arrived.
    MissingFinalResponse,
    /// Bytes follow the end of the framed body.
    TrailingGarbage {
        /// Number of extra bytes
        len: usize,
    },
}

impl fmt::Display for ResponseProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty response"),
            Self::MissingHeaderTerminator => f.write_str("header block not terminated"),
            Self::BadStatusLine(line) => write!(f, "bad status line {line:?}"),
            Self::BadHeaderLine(line) => write!(f, "bad header line {line:?}"),
            Self::BadContentLength(value) => write!(f, "bad Content-Length {value:?}"),
            Self::TruncatedBody { expected, actual } => {
                write!(f, "truncated body: {actual} of {expected} bytes")
            }
            Self::BadChunkSize(line) => write!(f, "bad chunk size {line:?}"),
            Self::MissingLastChunk => f.write_str("chunked body missing last chunk"),
            Self::MissingFinalResponse => f.write_str("interim response without a final response"),
            Self::TrailingGarbage { len } => write!(f, "{len} bytes of trailing garbage"),
        }
    }
}

/// Result of the structural check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WellFormedness {
    /// No problem found.
    WellFormed,
    /// The first problem found.
    Malformed(ResponseProblem),
}

impl WellFormedness {
    /// Whether no problem was found.
    #[must_use]
    pub const fn is_well_formed(&self) -> bool {
        matches!(self, Self::WellFormed)
    }
}

/// Structure recovered from the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// e.g. `HTTP/1.1`
    pub version: String,
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Headers in received order.
    pub headers: Vec<(String, String)>,
    /// Decoded body (chunk framing removed).
    pub body: Vec<u8>,
    /// Sizes of the data chunks received, for chunked bodies.
    pub chunks: Vec<usize>,
    /// Body delimitation.
    pub framing: Framing,
}

impl ParsedResponse {
    /// First value of header `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parses `raw`. `head` marks a response to a `HEAD` request.
///
/// Interim `1xx` heads (other than `101`) are skipped; the final response
/// is the one parsed.
#[must_use]
pub fn parse(raw: &[u8], head: bool) -> (Option<ParsedResponse>, WellFormedness) {
    use WellFormedness::{Malformed, WellFormed};

    if raw.is_empty() {
        return (None, Malformed(ResponseProblem::Empty));
    }

    let mut start = 0;
    loop {
        let (mut parsed, head_len, header_problem) = match parse_head(&raw[start..]) {
            Ok(parts) => parts,
            Err(problem) => return (None, Malformed(problem)),
        };
        let rest = &raw[start + head_len..];
        if is_interim(parsed.status) {
            if rest.is_empty() {
                return (Some(parsed), Malformed(ResponseProblem::MissingFinalResponse));
            }
            start += head_len;
            continue;
        }

        let body_problem = frame_body(&mut parsed, rest, head);
        let verdict = match header_problem.or(body_problem) {
            Some(problem) => Malformed(problem),
            None => WellFormed,
        };
        return (Some(parsed), verdict);
    }
}

/// Whether `raw` holds a response whose framing says it is complete.
///
/// Close-delimited responses are never complete before EOF.
#[must_use]
pub fn is_complete(raw: &[u8], head: bool) -> bool {
    Completion::new(head).update(raw)
}

/// Incremental completeness check over a buffer that only grows.
///
/// Every call resumes where the previous one stopped, so feeding a
/// response read by read costs time linear in its size.
#[derive(Debug, Clone)]
pub struct Completion {
    head: bool,
    progress: Progress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Searching for the end of the head that begins at `start`; bytes
    /// before `scanned` hold no terminator.
    Head { start: usize, scanned: usize },
    /// The body ends at this offset.
    Until(usize),
    /// The next chunk-size line begins here.
    Chunk(usize),
    /// The next trailer line begins here.
    Trailer(usize),
    /// Framed end reached.
    Done,
    /// Only EOF ends this response.
    Eof,
}

impl Completion {
    /// Starts before the first byte.
    #[must_use]
    pub const fn new(head: bool) -> Self {
        Self {
            head,
            progress: Progress::Head { start: 0, scanned: 0 },
        }
    }

    /// Advances over `raw`, which must extend the buffer of earlier calls.
    pub fn update(&mut self, raw: &[u8]) -> bool {
        loop {
            let current = self.progress;
            self.progress = match current {
                Progress::Done => return true,
                Progress::Eof => return false,
                Progress::Until(end) => return raw.len() >= end,
                Progress::Head { start, scanned } => {
                    let Some(found) = find(&raw[scanned..], b"\r\n\r\n") else {
                        // The terminator may straddle two reads.
                        let scanned = raw.len().saturating_sub(3).max(start);
                        self.progress = Progress::Head { start, scanned };
                        return false;
                    };
                    let body = scanned + found + 4;
                    self.after_head(&raw[start..body], body)
                }
                Progress::Chunk(pos) => {
                    let Some(found) = find(&raw[pos..], b"\r\n") else {
                        return false;
                    };
                    let data = pos + found + 2;
                    match chunk_size(&String::from_utf8_lossy(&raw[pos..pos + found])) {
                        None => Progress::Eof,
                        Some(0) => Progress::Trailer(data),
                        Some(size) => match size.checked_add(2).and_then(|n| data.checked_add(n)) {
                            None => Progress::Eof,
                            Some(next) if raw.len() < next => return false,
                            Some(next) if &raw[next - 2..next] == b"\r\n" => Progress::Chunk(next),
                            Some(_) => Progress::Eof,
                        },
                    }
                }
                Progress::Trailer(pos) => {
                    let Some(found) = find(&raw[pos..], b"\r\n") else {
                        return false;
                    };
                    if found == 0 {
                        Progress::Done
                    } else {
                        Progress::Trailer(pos + found + 2)
                    }
                }
            };
        }
    }

    fn after_head(&self, head_bytes: &[u8], body: usize) -> Progress {
        let Ok((parsed, _, None)) = parse_head(head_bytes) else {
            return Progress::Eof;
        };
        if is_interim(parsed.status) {
            return Progress::Head {
                start: body,
                scanned: body,
            };
        }
        match framing_of(&parsed, self.head) {
            Ok(Framing::NoBody) => Progress::Done,
            Ok(Framing::ContentLength(n)) => body.checked_add(n).map_or(Progress::Eof, Progress::Until),
            Ok(Framing::Chunked) => Progress::Chunk(body),
            Ok(Framing::CloseDelimited) | Err(_) => Progress::Eof,
        }
    }
}

/// Status line and headers of the head at the start of `raw`, the head's
/// length including its terminator, and the first bad header line.
fn parse_head(raw: &[u8]) -> Result<(ParsedResponse, usize, Option<ResponseProblem>), ResponseProblem> {
    let Some(header_end) = find(raw, b"\r\n\r\n") else {
        return Err(status_line(first_line(raw))
            .err()
            .unwrap_or(ResponseProblem::MissingHeaderTerminator));
    };

    let head_text = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = head_text.split("\r\n");
    let (version, status, reason) = status_line(lines.next().unwrap_or_default())?;

    let mut headers = Vec::new();
    let mut problem = None;
    for line in lines {
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
            _ => {
                problem.get_or_insert_with(|| ResponseProblem::BadHeaderLine(line.to_string()));
            }
        }
    }

    let parsed = ParsedResponse {
        version,
        status,
        reason,
        headers,
        body: Vec::new(),
        chunks: Vec::new(),
        framing: Framing::CloseDelimited,
    };
    Ok((parsed, header_end + 4, problem))
}

const fn is_interim(status: u16) -> bool {
    status >= 100 && status < 200 && status != 101
}

fn framing_of(parsed: &ParsedResponse, head: bool) -> Result<Framing, ResponseProblem> {
    if head || parsed.status < 200 || parsed.status == 204 || parsed.status == 304 {
        return Ok(Framing::NoBody);
    }
    let chunked = parsed
        .header("Transfer-Encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return Ok(Framing::Chunked);
    }
    match parsed.header("Content-Length") {
        Some(value) => value
            .parse::<usize>()
            .map(Framing::ContentLength)
            .map_err(|_| ResponseProblem::BadContentLength(value.to_string())),
        None => Ok(Framing::CloseDelimited),
    }
}

fn frame_body(parsed: &mut ParsedResponse, rest: &[u8], head: bool) -> Option<ResponseProblem> {
    let framing = match framing_of(parsed, head) {
        Ok(framing) => framing,
        Err(problem) => {
            parsed.body = rest.to_vec();
            return Some(problem);
        }
    };
    parsed.framing = framing;

    match framing {
        Framing::NoBody => (!rest.is_empty()).then_some(ResponseProblem::TrailingGarbage { len: rest.len() }),
        Framing::Chunked => dechunk(parsed, rest),
        Framing::ContentLength(expected) => {
            if rest.len() < expected {
                parsed.body = rest.to_vec();
                return Some(ResponseProblem::TruncatedBody {
                    expected,
                    actual: rest.len(),
                });
            }
            parsed.body = rest[..expected].to_vec();
            let extra = rest.len() - expected;
            (extra > 0).then_some(ResponseProblem::TrailingGarbage { len: extra })
        }
        Framing::CloseDelimited => {
            parsed.body = rest.to_vec();
            None
        }
    }
}

fn chunk_size(line: &str) -> Option<usize> {
    let digits = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(digits, 16).ok()
}

fn dechunk(parsed: &mut ParsedResponse, mut rest: &[u8]) -> Option<ResponseProblem> {
    loop {
        let Some(line_end) = find(rest, b"\r\n") else {
            parsed.body.extend_from_slice(rest);
            return Some(ResponseProblem::MissingLastChunk);
        };
        let line = String::from_utf8_lossy(&rest[..line_end]).into_owned();
        let Some(size) = chunk_size(&line) else {
            return Some(ResponseProblem::BadChunkSize(line));
        };
        rest = &rest[line_end + 2..];

        if size == 0 {
            // Trailer fields, then the final empty line.
            loop {
                let Some(end) = find(rest, b"\r\n") else {
                    return Some(ResponseProblem::MissingLastChunk);
                };
                let is_last = end == 0;
                rest = &rest[end + 2..];
                if is_last {
                    break;
                }
            }
            return (!rest.is_empty()).then_some(ResponseProblem::TrailingGarbage { len: rest.len() });
        }

        let Some(need) = size.checked_add(2) else {
            return Some(ResponseProblem::BadChunkSize(line));
        };
        if rest.len() < need {
            parsed.body.extend_from_slice(&rest[..size.min(rest.len())]);
            return Some(ResponseProblem::MissingLastChunk);
        }
        parsed.body.extend_from_slice(&rest[..size]);
        parsed.chunks.push(size);
        if &rest[size..need] != b"\r\n" {
            return Some(ResponseProblem::BadChunkSize(format!(
                "chunk of {size} bytes not followed by CRLF"
            )));
        }
        rest = &rest[need..];
    }
}

fn status_line(line: &str) -> Result<(String, u16, String), ResponseProblem> {
    let bad = || ResponseProblem::BadStatusLine(line.to_string());
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().filter(|v| v.starts_with("HTTP/")).ok_or_else(bad)?;
    let code = parts.next().ok_or_else(bad)?;
    if code.len() != 3 {
        return Err(bad());
    }
    let status = code.parse::<u16>().map_err(|_| bad())?;
    let reason = parts.next().unwrap_or_default().to_string();
    Ok((version.to_string(), status, reason))
}

fn first_line(raw: &[u8]) -> &str {
    let end = find(raw, b"\r\n").unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).unwrap_or_default()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malformed(raw: &[u8]) -> ResponseProblem {
        match parse(raw, false).1 {
            WellFormedness::Malformed(p) => p,
            WellFormedness::WellFormed => panic!("expected a problem for {raw:?}"),
        }
    }

    #[test]
    fn test_content_length_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\nX-A: b\r\n\r\nhello\n";
        let (parsed, wf) = parse(raw, false);
        let parsed = parsed.unwrap();
        assert!(wf.is_well_formed());
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.reason, "OK");
        assert_eq!(parsed.header("x-a"), Some("b"));
        assert_eq!(parsed.body, b"hello\n");
        assert_eq!(parsed.framing, Framing::ContentLength(6));
        assert!(is_complete(raw, false));
    }

    #[test]
    fn test_chunked_response_is_dechunked() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2;x=y\r\nde\r\n0\r\n\r\n";
        let (parsed, wf) = parse(raw, false);
        let parsed = parsed.unwrap();
        assert!(wf.is_well_formed());
        assert_eq!(parsed.body, b"abcde");
        assert_eq!(parsed.chunks, vec![3, 2]);
        assert!(is_complete(raw, false));
    }

    #[test]
    fn test_truncated_chunked_body_misses_last_chunk() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n";
        assert_eq!(malformed(raw), ResponseProblem::MissingLastChunk);
        assert!(!is_complete(raw, false));

        let mid_chunk = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel";
        assert_eq!(malformed(mid_chunk), ResponseProblem::MissingLastChunk);
    }

    #[test]
    fn test_chunked_with_trailers() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\n0\r\nX-T: 1\r\n\r\n";
        assert!(parse(raw, false).1.is_well_formed());
    }

    #[test]
    fn test_bad_chunk_size() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        assert_eq!(malformed(raw), ResponseProblem::BadChunkSize("zz".to_string()));
    }

    #[test]
    fn test_truncated_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc";
        assert_eq!(
            malformed(raw),
            ResponseProblem::TruncatedBody {
                expected: 10,
                actual: 3
            }
        );
    }

    #[test]
    fn test_trailing_garbage() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nab";
        assert_eq!(malformed(raw), ResponseProblem::TrailingGarbage { len: 1 });
        assert!(is_complete(raw, false));
    }

    #[test]
    fn test_header_problems() {
        assert_eq!(malformed(b""), ResponseProblem::Empty);
        assert_eq!(
            malformed(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n"),
            ResponseProblem::MissingHeaderTerminator
        );
        assert!(matches!(
            malformed(b"garbage\r\n\r\n"),
            ResponseProblem::BadStatusLine(_)
        ));
        assert!(matches!(
            malformed(b"HTTP/1.1 200 OK\r\nno colon here\r\n\r\n"),
            ResponseProblem::BadHeaderLine(_)
        ));
    }

    #[test]
    fn test_close_delimited_is_never_complete() {
        let raw = b"HTTP/1.0 200 OK\r\n\r\nstreaming";
        let (parsed, wf) = parse(raw, false);
        assert!(wf.is_well_formed());
        assert_eq!(parsed.unwrap().body, b"streaming");
        assert!(!is_complete(raw, false));
    }

    #[test]
    fn test_no_body_statuses() {
        let raw = b"HTTP/1.1 304 Not Modified\r\nContent-Length: 100\r\n\r\n";
        let (parsed, wf) = parse(raw, false);
        assert!(wf.is_well_formed());
        assert_eq!(parsed.unwrap().framing, Framing::NoBody);

        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        assert!(parse(head, true).1.is_well_formed());
        assert!(is_complete(head, true));
    }

    #[test]
    fn test_bad_request_from_server() {
        let raw = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let (parsed, wf) = parse(raw, false);
        assert!(wf.is_well_formed());
        assert_eq!(parsed.unwrap().status, 400);
    }

    #[test]
    fn test_oversized_chunk_size_is_bad_not_a_crash() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nab";
        assert_eq!(
            malformed(raw),
            ResponseProblem::BadChunkSize("ffffffffffffffff".to_string())
        );
        assert!(!is_complete(raw, false));
    }

    #[test]
    fn test_bad_content_length_keeps_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: lots\r\n\r\nabc";
        let (parsed, wf) = parse(raw, false);
        assert_eq!(
            wf,
            WellFormedness::Malformed(ResponseProblem::BadContentLength("lots".to_string()))
        );
        assert_eq!(parsed.unwrap().body, b"abc");
        assert!(!is_complete(raw, false));
    }

    #[test]
    fn test_interim_continue_is_skipped() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let (parsed, wf) = parse(raw, false);
        assert!(wf.is_well_formed(), "{wf:?}");
        let parsed = parsed.unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.body, b"ok");
        assert!(is_complete(raw, false));

        let interim_only = b"HTTP/1.1 100 Continue\r\n\r\n";
        assert_eq!(malformed(interim_only), ResponseProblem::MissingFinalResponse);
        assert!(!is_complete(interim_only, false));
    }

    #[test]
    fn test_completion_resumes_across_reads() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n";
        let mut completion = Completion::new(false);
        // One byte at a time, so every boundary (including the head
        // terminator) is split across calls.
        for end in 1..raw.len() {
            assert!(!completion.update(&raw[..end]), "complete early at {end}");
        }
        assert!(completion.update(raw));
    }

    #[test]
    fn test_completion_waits_for_content_length() {
        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\n\r\n".to_vec();
        let mut completion = Completion::new(false);
        assert!(!completion.update(&raw));
        raw.extend(std::iter::repeat_n(b'x', 99_999));
        assert!(!completion.update(&raw));
        raw.push(b'x');
        assert!(completion.update(&raw));
    }
}
