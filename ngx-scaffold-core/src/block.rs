//! Test block data model.
//!
//! A [`TestBlock`] is an immutable, ordered list of typed sections. The
//! section vocabulary is closed: every recognised name maps to one
//! [`Section`] variant carrying its own payload shape, and anything else
//! becomes [`Section::Unknown`] so strictness can be applied as a filter.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;

// ============================================================================
// Raw section values
// ============================================================================

/// How a section payload is interpreted, selected by a header modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpretation {
    /// Payload is taken as written.
    #[default]
    Literal,
    /// Payload is a regular expression (`re` modifier).
    Pattern,
    /// Payload is an escaped-string expression (`eval` modifier).
    Expression,
}

/// A section payload as it appeared in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionValue {
    /// Payload text, one `\n` after every line, blank edges trimmed.
    pub payload: String,
    /// Interpretation mode.
    pub interpretation: Interpretation,
    /// Whether the `chomp` modifier was present.
    pub chomp: bool,
    /// 1-based line of the section header.
    pub line: usize,
}

impl SectionValue {
    /// Returns the payload with `chomp` applied.
    #[must_use]
    pub fn text(&self) -> &str {
        if self.chomp {
            self.payload.strip_suffix('\n').unwrap_or(&self.payload)
        } else {
            &self.payload
        }
    }
}

// ============================================================================
// Section vocabulary
// ============================================================================

/// Names of every recognised section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    MainConfig,
    HttpConfig,
    Config,
    Request,
    RawRequest,
    RawRequestMiddleDelay,
    MoreHeaders,
    ResponseBody,
    ResponseBodyLike,
    ResponseHeaders,
    ErrorCode,
    IgnoreResponse,
    ErrorLog,
    NoErrorLog,
    GrepErrorLog,
    GrepErrorLogOut,
    LogLevel,
    Wait,
    MustDie,
    NoCheckLeak,
    Timeout,
    Abort,
    TcpListen,
    TcpQuery,
    TcpQueryLen,
    TcpReply,
    TcpReplyDelay,
    TcpCloseDelay,
    TcpNoClose,
    TcpShutdown,
    UdpListen,
    UdpQuery,
    UdpReply,
    UdpReplyDelay,
    Only,
    Skip,
    Last,
}

impl SectionKind {
    /// Every recognised section kind.
    pub const ALL: [Self; 37] = [
        Self::MainConfig,
        Self::HttpConfig,
        Self::Config,
        Self::Request,
        Self::RawRequest,
        Self::RawRequestMiddleDelay,
        Self::MoreHeaders,
        Self::ResponseBody,
        Self::ResponseBodyLike,
        Self::ResponseHeaders,
        Self::ErrorCode,
        Self::IgnoreResponse,
        Self::ErrorLog,
        Self::NoErrorLog,
        Self::GrepErrorLog,
        Self::GrepErrorLogOut,
        Self::LogLevel,
        Self::Wait,
        Self::MustDie,
        Self::NoCheckLeak,
        Self::Timeout,
        Self::Abort,
        Self::TcpListen,
        Self::TcpQuery,
        Self::TcpQueryLen,
        Self::TcpReply,
        Self::TcpReplyDelay,
        Self::TcpCloseDelay,
        Self::TcpNoClose,
        Self::TcpShutdown,
        Self::UdpListen,
        Self::UdpQuery,
        Self::UdpReply,
        Self::UdpReplyDelay,
        Self::Only,
        Self::Skip,
        Self::Last,
    ];

    /// The section name as written in documents.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MainConfig => "main_config",
            Self::HttpConfig => "http_config",
            Self::Config => "config",
            Self::Request => "request",
            Self::RawRequest => "raw_request",
            Self::RawRequestMiddleDelay => "raw_request_middle_delay",
            Self::MoreHeaders => "more_headers",
            Self::ResponseBody => "response_body",
            Self::ResponseBodyLike => "response_body_like",
            Self::ResponseHeaders => "response_headers",
            Self::ErrorCode => "error_code",
            Self::IgnoreResponse => "ignore_response",
            Self::ErrorLog => "error_log",
            Self::NoErrorLog => "no_error_log",
            Self::GrepErrorLog => "grep_error_log",
            Self::GrepErrorLogOut => "grep_error_log_out",
            Self::LogLevel => "log_level",
            Self::Wait => "wait",
            Self::MustDie => "must_die",
            Self::NoCheckLeak => "no_check_leak",
            Self::Timeout => "timeout",
            Self::Abort => "abort",
            Self::TcpListen => "tcp_listen",
            Self::TcpQuery => "tcp_query",
            Self::TcpQueryLen => "tcp_query_len",
            Self::TcpReply => "tcp_reply",
            Self::TcpReplyDelay => "tcp_reply_delay",
            Self::TcpCloseDelay => "tcp_close_delay",
            Self::TcpNoClose => "tcp_no_close",
            Self::TcpShutdown => "tcp_shutdown",
            Self::UdpListen => "udp_listen",
            Self::UdpQuery => "udp_query",
            Self::UdpReply => "udp_reply",
            Self::UdpReplyDelay => "udp_reply_delay",
            Self::Only => "ONLY",
            Self::Skip => "SKIP",
            Self::Last => "LAST",
        }
    }

    /// Looks up a section kind by its document name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Whether the section is a bare flag that takes no payload.
    #[must_use]
    pub const fn is_flag(self) -> bool {
        matches!(
            self,
            Self::IgnoreResponse
                | Self::MustDie
                | Self::NoCheckLeak
                | Self::Abort
                | Self::TcpNoClose
                | Self::TcpShutdown
                | Self::Only
                | Self::Skip
                | Self::Last
        )
    }

    /// Returns the closest known section name, if one is similar enough.
    #[must_use]
    pub fn suggest(name: &str) -> Option<&'static str> {
        Self::ALL
            .into_iter()
            .map(|kind| (kind.name(), strsim::jaro_winkler(name, kind.name())))
            .filter(|(_, score)| *score >= 0.85)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| name)
    }
}

impl serde::Serialize for SectionKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Typed payloads
// ============================================================================

/// A compiled regular expression that compares by source text.
#[derive(Debug, Clone)]
pub struct Pattern(pub Regex);

impl Pattern {
    /// The pattern's source text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Pattern {}

/// A log-line expectation: substring or regular-expression search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextMatcher {
    /// Matches when the text contains this substring.
    Literal(String),
    /// Matches when the regex finds a match anywhere in the text.
    Pattern(Pattern),
}

impl TextMatcher {
    /// Whether the matcher finds anything in `haystack`.
    #[must_use]
    pub fn is_match(&self, haystack: &str) -> bool {
        match self {
            Self::Literal(needle) => haystack.contains(needle.as_str()),
            Self::Pattern(pattern) => pattern.0.is_match(haystack),
        }
    }

    /// Every non-overlapping match in `haystack`, in order.
    #[must_use]
    pub fn find_all(&self, haystack: &str) -> Vec<String> {
        match self {
            Self::Literal(needle) if needle.is_empty() => Vec::new(),
            Self::Literal(needle) => haystack
                .matches(needle.as_str())
                .map(str::to_string)
                .collect(),
            Self::Pattern(pattern) => pattern
                .0
                .find_iter(haystack)
                .map(|m| m.as_str().to_string())
                .collect(),
        }
    }

    /// Rendering used in diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Literal(text) => format!("{text:?}"),
            Self::Pattern(pattern) => format!("qr/{}/", pattern.as_str()),
        }
    }
}

/// A byte-payload expectation: exact equality or regex search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyMatcher {
    /// Bytes must be identical.
    Exact(Vec<u8>),
    /// The regex must match somewhere in the (lossily decoded) text.
    Pattern(Pattern),
}

impl BodyMatcher {
    /// Whether `actual` satisfies the expectation.
    #[must_use]
    pub fn matches(&self, actual: &[u8]) -> bool {
        match self {
            Self::Exact(expected) => expected.as_slice() == actual,
            Self::Pattern(pattern) => pattern.0.is_match(&String::from_utf8_lossy(actual)),
        }
    }

    /// Rendering used in diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Exact(bytes) => format!("{:?}", String::from_utf8_lossy(bytes)),
            Self::Pattern(pattern) => format!("qr/{}/", pattern.as_str()),
        }
    }
}

/// A `response_headers` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderExpectation {
    /// `Name: value` must be present with exactly this value.
    Equals {
        /// Header name (compared case-insensitively)
        name: String,
        /// Expected value
        value: String,
    },
    /// `!Name` must not be present.
    Absent {
        /// Header name (compared case-insensitively)
        name: String,
    },
}

/// Address a mock server binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenAddr(pub SocketAddr);

impl FromStr for ListenAddr {
    type Err = String;

    /// Accepts a bare port (bound on `127.0.0.1`) or `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(port) = s.parse::<u16>() {
            return Ok(Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)));
        }
        s.parse::<SocketAddr>()
            .map(Self)
            .map_err(|e| format!("expected a port or host:port, got {s:?} ({e})"))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Section
// ============================================================================

/// A typed section of a test block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    /// Top-level config fragment.
    MainConfig(String),
    /// `http {}`-level config fragment.
    HttpConfig(String),
    /// `server {}`-level config fragment (locations).
    Config(String),
    /// Structured request: request line, then optional body.
    Request(Vec<u8>),
    /// Bytes sent verbatim, one element per separately written piece.
    RawRequest(Vec<Vec<u8>>),
    /// Pause between raw request pieces.
    RawRequestMiddleDelay(Duration),
    /// Extra request headers.
    MoreHeaders(Vec<(String, String)>),
    /// Expected response body.
    ResponseBody(BodyMatcher),
    /// Expected response body pattern (always [`BodyMatcher::Pattern`]).
    ResponseBodyLike(BodyMatcher),
    /// Expected response headers.
    ResponseHeaders(Vec<HeaderExpectation>),
    /// Expected status code.
    ErrorCode(u16),
    /// Skip all response checks and well-formedness validation.
    IgnoreResponse,
    /// Lines that must appear in the log tail.
    ErrorLog(Vec<TextMatcher>),
    /// Lines that must not appear in the log tail.
    NoErrorLog(Vec<TextMatcher>),
    /// Pattern whose matches are collected from the log tail.
    GrepErrorLog(TextMatcher),
    /// Expected collected matches, one per line.
    GrepErrorLogOut(BodyMatcher),
    /// Error log level rendered into the config.
    LogLevel(String),
    /// Extra wait before the log tail is read.
    Wait(Duration),
    /// Server startup is expected to fail.
    MustDie,
    /// Skip the instrumentation report for this block.
    NoCheckLeak,
    /// Client-side timeout override.
    Timeout(Duration),
    /// A client timeout is the expected outcome.
    Abort,
    /// TCP mock listen address.
    TcpListen(ListenAddr),
    /// Expected TCP queries, in order.
    TcpQuery(Vec<BodyMatcher>),
    /// Read exactly this many bytes as the query.
    TcpQueryLen(usize),
    /// TCP reply pieces.
    TcpReply(Vec<Vec<u8>>),
    /// Delay before replying.
    TcpReplyDelay(Duration),
    /// Delay between the last write and closing.
    TcpCloseDelay(Duration),
    /// Keep the connection open after replying.
    TcpNoClose,
    /// Half-close the write side after replying.
    TcpShutdown,
    /// UDP mock listen address.
    UdpListen(ListenAddr),
    /// Expected UDP datagrams, in order.
    UdpQuery(Vec<BodyMatcher>),
    /// UDP reply datagrams, paired with queries.
    UdpReply(Vec<Vec<u8>>),
    /// Delay before each UDP reply.
    UdpReplyDelay(Duration),
    /// Run only blocks marked `ONLY`.
    Only,
    /// Skip this block.
    Skip,
    /// Ignore every block after this one.
    Last,
    /// A section outside the vocabulary.
    Unknown {
        /// Section name as written
        name: String,
        /// Raw payload
        raw: String,
    },
}

impl Section {
    /// The kind of this section, or `None` for [`Section::Unknown`].
    #[must_use]
    pub const fn kind(&self) -> Option<SectionKind> {
        Some(match self {
            Self::MainConfig(_) => SectionKind::MainConfig,
            Self::HttpConfig(_) => SectionKind::HttpConfig,
            Self::Config(_) => SectionKind::Config,
            Self::Request(_) => SectionKind::Request,
            Self::RawRequest(_) => SectionKind::RawRequest,
            Self::RawRequestMiddleDelay(_) => SectionKind::RawRequestMiddleDelay,
            Self::MoreHeaders(_) => SectionKind::MoreHeaders,
            Self::ResponseBody(_) => SectionKind::ResponseBody,
            Self::ResponseBodyLike(_) => SectionKind::ResponseBodyLike,
            Self::ResponseHeaders(_) => SectionKind::ResponseHeaders,
            Self::ErrorCode(_) => SectionKind::ErrorCode,
            Self::IgnoreResponse => SectionKind::IgnoreResponse,
            Self::ErrorLog(_) => SectionKind::ErrorLog,
            Self::NoErrorLog(_) => SectionKind::NoErrorLog,
            Self::GrepErrorLog(_) => SectionKind::GrepErrorLog,
            Self::GrepErrorLogOut(_) => SectionKind::GrepErrorLogOut,
            Self::LogLevel(_) => SectionKind::LogLevel,
            Self::Wait(_) => SectionKind::Wait,
            Self::MustDie => SectionKind::MustDie,
            Self::NoCheckLeak => SectionKind::NoCheckLeak,
            Self::Timeout(_) => SectionKind::Timeout,
            Self::Abort => SectionKind::Abort,
            Self::TcpListen(_) => SectionKind::TcpListen,
            Self::TcpQuery(_) => SectionKind::TcpQuery,
            Self::TcpQueryLen(_) => SectionKind::TcpQueryLen,
            Self::TcpReply(_) => SectionKind::TcpReply,
            Self::TcpReplyDelay(_) => SectionKind::TcpReplyDelay,
            Self::TcpCloseDelay(_) => SectionKind::TcpCloseDelay,
            Self::TcpNoClose => SectionKind::TcpNoClose,
            Self::TcpShutdown => SectionKind::TcpShutdown,
            Self::UdpListen(_) => SectionKind::UdpListen,
            Self::UdpQuery(_) => SectionKind::UdpQuery,
            Self::UdpReply(_) => SectionKind::UdpReply,
            Self::UdpReplyDelay(_) => SectionKind::UdpReplyDelay,
            Self::Only => SectionKind::Only,
            Self::Skip => SectionKind::Skip,
            Self::Last => SectionKind::Last,
            Self::Unknown { .. } => return None,
        })
    }

    /// Whether this is an [`Section::Unknown`] section.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown { .. })
    }
}

/// One section of a block: the raw value and its typed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionEntry {
    /// Section name as written.
    pub name: String,
    /// Raw payload and modifiers.
    pub value: SectionValue,
    /// Typed section.
    pub section: Section,
}

// ============================================================================
// TestBlock
// ============================================================================

/// One declarative test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestBlock {
    ordinal: usize,
    title: String,
    line: usize,
    entries: Vec<SectionEntry>,
}

impl TestBlock {
    pub(crate) const fn new(
        ordinal: usize,
        title: String,
        line: usize,
        entries: Vec<SectionEntry>,
    ) -> Self {
        Self {
            ordinal,
            title,
            line,
            entries,
        }
    }

    /// 1-based position of the block in its document.
    #[must_use]
    pub const fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Title text after `===`.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// 1-based line of the block header.
    #[must_use]
    pub const fn line(&self) -> usize {
        self.line
    }

    /// Title, or `TEST <ordinal>` when the title is empty.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.title.is_empty() {
            format!("TEST {}", self.ordinal)
        } else {
            self.title.clone()
        }
    }

    /// All entries in document order.
    #[must_use]
    pub fn entries(&self) -> &[SectionEntry] {
        &self.entries
    }

    /// All typed sections in document order.
    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.entries.iter().map(|entry| &entry.section)
    }

    /// The section of the given kind, if declared.
    #[must_use]
    pub fn get(&self, kind: SectionKind) -> Option<&Section> {
        self.sections().find(|section| section.kind() == Some(kind))
    }

    /// Whether a section of the given kind is declared.
    #[must_use]
    pub fn has(&self, kind: SectionKind) -> bool {
        self.get(kind).is_some()
    }

    pub(crate) fn without_unknown(mut self) -> Self {
        self.entries.retain(|entry| !entry.section.is_unknown());
        self
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// `main_config` fragment.
    #[must_use]
    pub fn main_config(&self) -> Option<&str> {
        match self.get(SectionKind::MainConfig) {
            Some(Section::MainConfig(text)) => Some(text),
            _ => None,
        }
    }

    /// `http_config` fragment.
    #[must_use]
    pub fn http_config(&self) -> Option<&str> {
        match self.get(SectionKind::HttpConfig) {
            Some(Section::HttpConfig(text)) => Some(text),
            _ => None,
        }
    }

    /// `config` fragment.
    #[must_use]
    pub fn config(&self) -> Option<&str> {
        match self.get(SectionKind::Config) {
            Some(Section::Config(text)) => Some(text),
            _ => None,
        }
    }

    /// `log_level` override.
    #[must_use]
    pub fn log_level(&self) -> Option<&str> {
        match self.get(SectionKind::LogLevel) {
            Some(Section::LogLevel(level)) => Some(level),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Request
    // ------------------------------------------------------------------

    /// Structured request payload.
    #[must_use]
    pub fn request(&self) -> Option<&[u8]> {
        match self.get(SectionKind::Request) {
            Some(Section::Request(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Raw request pieces.
    #[must_use]
    pub fn raw_request(&self) -> Option<&[Vec<u8>]> {
        match self.get(SectionKind::RawRequest) {
            Some(Section::RawRequest(pieces)) => Some(pieces),
            _ => None,
        }
    }

    /// Delay between raw request pieces.
    #[must_use]
    pub fn raw_request_middle_delay(&self) -> Option<Duration> {
        match self.get(SectionKind::RawRequestMiddleDelay) {
            Some(Section::RawRequestMiddleDelay(d)) => Some(*d),
            _ => None,
        }
    }

    /// Extra request headers.
    #[must_use]
    pub fn more_headers(&self) -> &[(String, String)] {
        match self.get(SectionKind::MoreHeaders) {
            Some(Section::MoreHeaders(headers)) => headers,
            _ => &[],
        }
    }

    /// Whether the block sends anything to the server.
    #[must_use]
    pub fn sends_request(&self) -> bool {
        self.has(SectionKind::Request) || self.has(SectionKind::RawRequest)
    }

    // ------------------------------------------------------------------
    // Response
    // ------------------------------------------------------------------

    /// Expected body from either `response_body` or `response_body_like`.
    #[must_use]
    pub fn expected_body(&self) -> Option<&BodyMatcher> {
        self.sections().find_map(|section| match section {
            Section::ResponseBody(m) | Section::ResponseBodyLike(m) => Some(m),
            _ => None,
        })
    }

    /// Expected response headers.
    #[must_use]
    pub fn response_headers(&self) -> &[HeaderExpectation] {
        match self.get(SectionKind::ResponseHeaders) {
            Some(Section::ResponseHeaders(headers)) => headers,
            _ => &[],
        }
    }

    /// Expected status code.
    #[must_use]
    pub fn error_code(&self) -> Option<u16> {
        match self.get(SectionKind::ErrorCode) {
            Some(Section::ErrorCode(code)) => Some(*code),
            _ => None,
        }
    }

    /// `ignore_response` flag.
    #[must_use]
    pub fn ignore_response(&self) -> bool {
        self.has(SectionKind::IgnoreResponse)
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    /// Required log matchers.
    #[must_use]
    pub fn error_log(&self) -> &[TextMatcher] {
        match self.get(SectionKind::ErrorLog) {
            Some(Section::ErrorLog(matchers)) => matchers,
            _ => &[],
        }
    }

    /// Forbidden log matchers.
    #[must_use]
    pub fn no_error_log(&self) -> &[TextMatcher] {
        match self.get(SectionKind::NoErrorLog) {
            Some(Section::NoErrorLog(matchers)) => matchers,
            _ => &[],
        }
    }

    /// `grep_error_log` pattern.
    #[must_use]
    pub fn grep_error_log(&self) -> Option<&TextMatcher> {
        match self.get(SectionKind::GrepErrorLog) {
            Some(Section::GrepErrorLog(matcher)) => Some(matcher),
            _ => None,
        }
    }

    /// `grep_error_log_out` expectation.
    #[must_use]
    pub fn grep_error_log_out(&self) -> Option<&BodyMatcher> {
        match self.get(SectionKind::GrepErrorLogOut) {
            Some(Section::GrepErrorLogOut(matcher)) => Some(matcher),
            _ => None,
        }
    }

    /// Extra wait before reading the log tail.
    #[must_use]
    pub fn wait(&self) -> Option<Duration> {
        match self.get(SectionKind::Wait) {
            Some(Section::Wait(d)) => Some(*d),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle and client flags
    // ------------------------------------------------------------------

    /// `must_die` flag.
    #[must_use]
    pub fn must_die(&self) -> bool {
        self.has(SectionKind::MustDie)
    }

    /// `no_check_leak` flag.
    #[must_use]
    pub fn no_check_leak(&self) -> bool {
        self.has(SectionKind::NoCheckLeak)
    }

    /// Client timeout override.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        match self.get(SectionKind::Timeout) {
            Some(Section::Timeout(d)) => Some(*d),
            _ => None,
        }
    }

    /// `abort` flag.
    #[must_use]
    pub fn abort(&self) -> bool {
        self.has(SectionKind::Abort)
    }

    // ------------------------------------------------------------------
    // Mock listeners
    // ------------------------------------------------------------------

    /// TCP mock address.
    #[must_use]
    pub fn tcp_listen(&self) -> Option<ListenAddr> {
        match self.get(SectionKind::TcpListen) {
            Some(Section::TcpListen(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// Expected TCP queries.
    #[must_use]
    pub fn tcp_query(&self) -> &[BodyMatcher] {
        match self.get(SectionKind::TcpQuery) {
            Some(Section::TcpQuery(queries)) => queries,
            _ => &[],
        }
    }

    /// Fixed TCP query length.
    #[must_use]
    pub fn tcp_query_len(&self) -> Option<usize> {
        match self.get(SectionKind::TcpQueryLen) {
            Some(Section::TcpQueryLen(len)) => Some(*len),
            _ => None,
        }
    }

    /// TCP reply pieces.
    #[must_use]
    pub fn tcp_reply(&self) -> &[Vec<u8>] {
        match self.get(SectionKind::TcpReply) {
            Some(Section::TcpReply(pieces)) => pieces,
            _ => &[],
        }
    }

    /// Delay before the TCP reply.
    #[must_use]
    pub fn tcp_reply_delay(&self) -> Option<Duration> {
        match self.get(SectionKind::TcpReplyDelay) {
            Some(Section::TcpReplyDelay(d)) => Some(*d),
            _ => None,
        }
    }

    /// Delay before closing the TCP connection.
    #[must_use]
    pub fn tcp_close_delay(&self) -> Option<Duration> {
        match self.get(SectionKind::TcpCloseDelay) {
            Some(Section::TcpCloseDelay(d)) => Some(*d),
            _ => None,
        }
    }

    /// `tcp_no_close` flag.
    #[must_use]
    pub fn tcp_no_close(&self) -> bool {
        self.has(SectionKind::TcpNoClose)
    }

    /// `tcp_shutdown` flag.
    #[must_use]
    pub fn tcp_shutdown(&self) -> bool {
        self.has(SectionKind::TcpShutdown)
    }

    /// UDP mock address.
    #[must_use]
    pub fn udp_listen(&self) -> Option<ListenAddr> {
        match self.get(SectionKind::UdpListen) {
            Some(Section::UdpListen(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// Expected UDP datagrams.
    #[must_use]
    pub fn udp_query(&self) -> &[BodyMatcher] {
        match self.get(SectionKind::UdpQuery) {
            Some(Section::UdpQuery(queries)) => queries,
            _ => &[],
        }
    }

    /// UDP reply datagrams.
    #[must_use]
    pub fn udp_reply(&self) -> &[Vec<u8>] {
        match self.get(SectionKind::UdpReply) {
            Some(Section::UdpReply(replies)) => replies,
            _ => &[],
        }
    }

    /// Delay before each UDP reply.
    #[must_use]
    pub fn udp_reply_delay(&self) -> Option<Duration> {
        match self.get(SectionKind::UdpReplyDelay) {
            Some(Section::UdpReplyDelay(d)) => Some(*d),
            _ => None,
        }
    }
}

// ============================================================================
// Suite
// ============================================================================

/// An ordered sequence of blocks parsed from one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suite {
    /// Name of the source document.
    pub source_name: String,
    /// Blocks in document order.
    pub blocks: Vec<TestBlock>,
}

impl Suite {
    /// Blocks to run after applying `ONLY`, `LAST` and `SKIP` markers.
    ///
    /// When any block is marked `ONLY`, only those run. Otherwise blocks
    /// after the first `LAST` are dropped. `SKIP` blocks never run.
    #[must_use]
    pub fn selected(&self) -> Vec<&TestBlock> {
        let only: Vec<&TestBlock> = self
            .blocks
            .iter()
            .filter(|b| b.has(SectionKind::Only))
            .collect();
        let candidates = if only.is_empty() {
            let end = self
                .blocks
                .iter()
                .position(|b| b.has(SectionKind::Last))
                .map_or(self.blocks.len(), |i| i + 1);
            self.blocks[..end].iter().collect()
        } else {
            only
        };
        candidates
            .into_iter()
            .filter(|b| !b.has(SectionKind::Skip))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(section: Section) -> SectionEntry {
        let name = section
            .kind()
            .map_or_else(|| "unknown".to_string(), |k| k.name().to_string());
        SectionEntry {
            name,
            value: SectionValue {
                payload: String::new(),
                interpretation: Interpretation::Literal,
                chomp: false,
                line: 1,
            },
            section,
        }
    }

    fn block(ordinal: usize, sections: Vec<Section>) -> TestBlock {
        TestBlock::new(
            ordinal,
            format!("TEST {ordinal}"),
            ordinal * 10,
            sections.into_iter().map(entry).collect(),
        )
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in SectionKind::ALL {
            assert_eq!(SectionKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(SectionKind::from_name("bogus"), None);
    }

    #[test]
    fn suggest_finds_close_names() {
        assert_eq!(SectionKind::suggest("respone_body"), Some("response_body"));
        assert_eq!(SectionKind::suggest("no_eror_log"), Some("no_error_log"));
        assert_eq!(SectionKind::suggest("zzzzzz"), None);
    }

    #[test]
    fn section_value_chomp() {
        let mut value = SectionValue {
            payload: "ok\n".to_string(),
            interpretation: Interpretation::Literal,
            chomp: false,
            line: 1,
        };
        assert_eq!(value.text(), "ok\n");
        value.chomp = true;
        assert_eq!(value.text(), "ok");
    }

    #[test]
    fn text_matcher_literal_and_pattern() {
        let literal = TextMatcher::Literal("[error]".to_string());
        assert!(literal.is_match("2024/01/01 [error] 1#1: boom"));
        assert!(!literal.is_match("[warn] nothing"));

        let pattern = TextMatcher::Pattern(Pattern(Regex::new(r"counter: \d+").unwrap()));
        assert_eq!(
            pattern.find_all("counter: 1\ncounter: 22\n"),
            vec!["counter: 1".to_string(), "counter: 22".to_string()]
        );
        assert_eq!(pattern.describe(), r"qr/counter: \d+/");
    }

    #[test]
    fn body_matcher_exact_vs_pattern() {
        let exact = BodyMatcher::Exact(b"ok\n".to_vec());
        assert!(exact.matches(b"ok\n"));
        assert!(!exact.matches(b"ok"));

        let pattern = BodyMatcher::Pattern(Pattern(Regex::new("^o").unwrap()));
        assert!(pattern.matches(b"ok"));
    }

    #[test]
    fn listen_addr_parsing() {
        let addr: ListenAddr = "1985".parse().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:1985");
        let addr: ListenAddr = "0.0.0.0:53".parse().unwrap();
        assert_eq!(addr.0.port(), 53);
        assert!("localhost".parse::<ListenAddr>().is_err());
    }

    #[test]
    fn typed_accessors() {
        let b = block(
            1,
            vec![
                Section::Timeout(Duration::from_millis(200)),
                Section::Abort,
                Section::ErrorCode(400),
                Section::TcpReply(vec![b"a".to_vec(), b"b".to_vec()]),
            ],
        );
        assert_eq!(b.timeout(), Some(Duration::from_millis(200)));
        assert!(b.abort());
        assert!(!b.must_die());
        assert_eq!(b.error_code(), Some(400));
        assert_eq!(b.tcp_reply().len(), 2);
        assert!(b.error_log().is_empty());
        assert!(!b.sends_request());
    }

    #[test]
    fn selection_only_wins() {
        let suite = Suite {
            source_name: "t".to_string(),
            blocks: vec![
                block(1, vec![]),
                block(2, vec![Section::Only]),
                block(3, vec![Section::Only, Section::Skip]),
            ],
        };
        let selected: Vec<usize> = suite.selected().iter().map(|b| b.ordinal()).collect();
        assert_eq!(selected, vec![2]);
    }

    #[test]
    fn selection_last_truncates_and_skip_drops() {
        let suite = Suite {
            source_name: "t".to_string(),
            blocks: vec![
                block(1, vec![Section::Skip]),
                block(2, vec![]),
                block(3, vec![Section::Last]),
                block(4, vec![]),
            ],
        };
        let selected: Vec<usize> = suite.selected().iter().map(|b| b.ordinal()).collect();
        assert_eq!(selected, vec![2, 3]);
    }
}
