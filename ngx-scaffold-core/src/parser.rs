//! Test-suite document parser.
//!
//! A document is an optional preamble followed by `__DATA__` and a series
//! of blocks. Each block opens with a `=== title` line and contains
//! `--- name [modifiers] [: inline value]` sections. Parsing stops at an
//! `__END__` line.
//!
//! Parsing is two-phase: the line scanner groups raw sections into pending
//! blocks, then each section is typed against the closed vocabulary in
//! [`SectionKind`]. Unknown sections are always produced and then either
//! rejected or filtered out according to [`Strictness`].

use std::time::Duration;

use indexmap::IndexMap;
use regex::RegexBuilder;

use crate::block::{
    BodyMatcher, HeaderExpectation, Interpretation, ListenAddr, Pattern, Section, SectionEntry,
    SectionKind, SectionValue, Suite, TestBlock, TextMatcher,
};
use crate::error::{ParseError, ParseErrorKind, ParseWarning};
use crate::expr::{self, PatternSource, Value};

/// Size limit for compiled section regexes.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Log levels accepted by `log_level`.
const LOG_LEVELS: &[&str] = &[
    "debug", "info", "notice", "warn", "error", "crit", "alert", "emerg",
];

// ============================================================================
// Options and output
// ============================================================================

/// How unknown section names are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Unknown sections are a parse error.
    #[default]
    Strict,
    /// Unknown sections are dropped with a warning.
    Lenient,
}

/// Parser configuration.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Unknown-section policy.
    pub strictness: Strictness,
    /// Variables substituted as `$NAME` in every payload, longest name first.
    pub variables: IndexMap<String, String>,
}

/// A parsed suite plus any lenient-mode warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutput {
    /// The parsed suite.
    pub suite: Suite,
    /// Non-fatal observations.
    pub warnings: Vec<ParseWarning>,
}

/// Parses a test-suite document.
///
/// # Errors
///
/// Returns a [`ParseError`] carrying the source name and line for the first
/// structural or typing problem found. A document without any block is a
/// [`ParseErrorKind::NoBlocks`] error.
pub fn parse_suite(
    source_name: &str,
    input: &str,
    options: &ParseOptions,
) -> Result<ParseOutput, ParseError> {
    let mut parser = Parser::new(source_name, options);
    for (line_no, line) in data_lines(input) {
        parser.feed(line_no, line)?;
    }
    parser.finish()
}

/// Yields `(line number, line)` for the data part of the document.
fn data_lines(input: &str) -> impl Iterator<Item = (usize, &str)> {
    let lines: Vec<&str> = input.lines().collect();
    let start = lines
        .iter()
        .position(|l| l.trim_end() == "__DATA__")
        .map_or(0, |i| i + 1);
    lines
        .into_iter()
        .enumerate()
        .skip(start)
        .take_while(|(_, l)| l.trim_end() != "__END__")
        .map(|(i, l)| (i + 1, l.strip_suffix('\r').unwrap_or(l)))
}

// ============================================================================
// Line scanner
// ============================================================================

struct PendingSection {
    name: String,
    interpretation: Interpretation,
    chomp: bool,
    inline: Option<String>,
    line: usize,
    body: Vec<String>,
}

impl PendingSection {
    /// Inline value verbatim, or body lines with blank edges trimmed and a
    /// newline after every line.
    fn payload(&self) -> String {
        if let Some(inline) = &self.inline {
            return inline.clone();
        }
        let Some(start) = self.body.iter().position(|l| !l.trim().is_empty()) else {
            return String::new();
        };
        let end = self
            .body
            .iter()
            .rposition(|l| !l.trim().is_empty())
            .unwrap_or(start);
        self.body[start..=end]
            .iter()
            .map(|l| format!("{l}\n"))
            .collect()
    }
}

struct PendingBlock {
    title: String,
    line: usize,
    sections: Vec<PendingSection>,
}

struct Parser<'a> {
    source_name: &'a str,
    options: &'a ParseOptions,
    variables: Vec<(&'a str, &'a str)>,
    blocks: Vec<TestBlock>,
    warnings: Vec<ParseWarning>,
    current: Option<PendingBlock>,
}

fn fail(source_name: &str, block: Option<&str>, line: usize, kind: ParseErrorKind) -> ParseError {
    ParseError {
        source_name: source_name.to_string(),
        line,
        block: block.map(str::to_string),
        kind,
    }
}

impl<'a> Parser<'a> {
    fn new(source_name: &'a str, options: &'a ParseOptions) -> Self {
        let mut variables: Vec<(&str, &str)> = options
            .variables
            .iter()
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        variables.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            source_name,
            options,
            variables,
            blocks: Vec::new(),
            warnings: Vec::new(),
            current: None,
        }
    }

    fn feed(&mut self, line_no: usize, line: &str) -> Result<(), ParseError> {
        if let Some(rest) = line.strip_prefix("===") {
            self.close_block()?;
            self.current = Some(PendingBlock {
                title: rest.trim().to_string(),
                line: line_no,
                sections: Vec::new(),
            });
            return Ok(());
        }

        let source_name = self.source_name;
        // Preamble text before the first block is ignored.
        let Some(block) = self.current.as_mut() else {
            return Ok(());
        };

        if let Some(rest) = line.strip_prefix("---") {
            let section = parse_header(rest, line_no)
                .map_err(|kind| fail(source_name, Some(&block.title), line_no, kind))?;
            if let Some(first) = block.sections.iter().find(|s| s.name == section.name) {
                return Err(fail(
                    source_name,
                    Some(&block.title),
                    line_no,
                    ParseErrorKind::DuplicateSection {
                        name: section.name,
                        first_line: first.line,
                    },
                ));
            }
            block.sections.push(section);
            return Ok(());
        }

        match block.sections.last_mut() {
            Some(section) if section.inline.is_some() => {
                if !line.trim().is_empty() {
                    let kind = invalid(
                        &section.name,
                        "an inline value cannot be followed by payload lines",
                    );
                    return Err(fail(source_name, Some(&block.title), line_no, kind));
                }
            }
            Some(section) => section.body.push(line.to_string()),
            None => {
                let trimmed = line.trim();
                if !trimmed.is_empty() && !trimmed.starts_with('#') {
                    return Err(fail(
                        source_name,
                        Some(&block.title),
                        line_no,
                        ParseErrorKind::ContentOutsideSection(trimmed.to_string()),
                    ));
                }
            }
        }
        Ok(())
    }

    fn close_block(&mut self) -> Result<(), ParseError> {
        let Some(pending) = self.current.take() else {
            return Ok(());
        };
        let source_name = self.source_name;
        let title = pending.title.as_str();

        let mut entries = Vec::with_capacity(pending.sections.len());
        for section in &pending.sections {
            let value = SectionValue {
                payload: self.substitute(&section.payload()),
                interpretation: section.interpretation,
                chomp: section.chomp,
                line: section.line,
            };
            let typed = type_section(&section.name, &value)
                .map_err(|kind| fail(source_name, Some(title), section.line, kind))?;
            entries.push(SectionEntry {
                name: section.name.clone(),
                value,
                section: typed,
            });
        }

        let block = TestBlock::new(
            self.blocks.len() + 1,
            pending.title.clone(),
            pending.line,
            entries,
        );
        validate_block(&block).map_err(|(line, kind)| fail(source_name, Some(title), line, kind))?;

        let unknown: Vec<&SectionEntry> = block
            .entries()
            .iter()
            .filter(|e| e.section.is_unknown())
            .collect();
        if unknown.is_empty() {
            self.blocks.push(block);
            return Ok(());
        }

        match self.options.strictness {
            Strictness::Strict => {
                let first = unknown[0];
                Err(fail(
                    source_name,
                    Some(title),
                    first.value.line,
                    ParseErrorKind::UnknownSection {
                        name: first.name.clone(),
                        suggestion: SectionKind::suggest(&first.name).map(str::to_string),
                    },
                ))
            }
            Strictness::Lenient => {
                for entry in unknown {
                    let hint = SectionKind::suggest(&entry.name)
                        .map_or_else(String::new, |s| format!(" (did you mean '{s}'?)"));
                    self.warnings.push(ParseWarning {
                        line: entry.value.line,
                        message: format!("ignoring unknown section '{}'{hint}", entry.name),
                    });
                }
                self.blocks.push(block.without_unknown());
                Ok(())
            }
        }
    }

    fn finish(mut self) -> Result<ParseOutput, ParseError> {
        self.close_block()?;
        if self.blocks.is_empty() {
            return Err(fail(self.source_name, None, 1, ParseErrorKind::NoBlocks));
        }
        Ok(ParseOutput {
            suite: Suite {
                source_name: self.source_name.to_string(),
                blocks: self.blocks,
            },
            warnings: self.warnings,
        })
    }

    /// Replaces `$NAME` for every known variable in a single left-to-right
    /// pass. Longer names are tried first so a name that prefixes another
    /// never steals its match. Substituted values are not rescanned.
    fn substitute(&self, text: &str) -> String {
        if self.variables.is_empty() || !text.contains('$') {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            match self
                .variables
                .iter()
                .find(|(name, _)| after.starts_with(name))
            {
                Some((name, value)) => {
                    out.push_str(value);
                    rest = &after[name.len()..];
                }
                None => {
                    out.push('$');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn parse_header(rest: &str, line: usize) -> Result<PendingSection, ParseErrorKind> {
    let (head, inline) = match rest.split_once(':') {
        Some((head, value)) => (head, Some(value.trim().to_string())),
        None => (rest, None),
    };
    let mut tokens = head.split_whitespace();
    let name = tokens.next().ok_or(ParseErrorKind::EmptySectionName)?;
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ParseErrorKind::InvalidSectionName(name.to_string()));
    }

    let mut interpretation = Interpretation::Literal;
    let mut chomp = false;
    for token in tokens {
        let next = match token {
            "eval" => Interpretation::Expression,
            "re" => Interpretation::Pattern,
            "chomp" => {
                chomp = true;
                continue;
            }
            other => {
                return Err(ParseErrorKind::UnknownModifier {
                    section: name.to_string(),
                    modifier: other.to_string(),
                });
            }
        };
        if interpretation != Interpretation::Literal && interpretation != next {
            return Err(invalid(name, "modifiers 'eval' and 're' cannot be combined"));
        }
        interpretation = next;
    }

    Ok(PendingSection {
        name: name.to_string(),
        interpretation,
        chomp,
        inline,
        line,
        body: Vec::new(),
    })
}

// ============================================================================
// Section typing
// ============================================================================

fn invalid(section: &str, message: impl Into<String>) -> ParseErrorKind {
    ParseErrorKind::InvalidValue {
        section: section.to_string(),
        message: message.into(),
    }
}

/// Types one section payload according to its name.
fn type_section(name: &str, value: &SectionValue) -> Result<Section, ParseErrorKind> {
    let Some(kind) = SectionKind::from_name(name) else {
        return Ok(Section::Unknown {
            name: name.to_string(),
            raw: value.payload.clone(),
        });
    };

    if kind.is_flag() && !value.payload.trim().is_empty() {
        return Err(invalid(name, "flag sections take no value"));
    }

    let section = match kind {
        SectionKind::IgnoreResponse => Section::IgnoreResponse,
        SectionKind::MustDie => Section::MustDie,
        SectionKind::NoCheckLeak => Section::NoCheckLeak,
        SectionKind::Abort => Section::Abort,
        SectionKind::TcpNoClose => Section::TcpNoClose,
        SectionKind::TcpShutdown => Section::TcpShutdown,
        SectionKind::Only => Section::Only,
        SectionKind::Skip => Section::Skip,
        SectionKind::Last => Section::Last,
        SectionKind::MainConfig => Section::MainConfig(config_text(name, value)?),
        SectionKind::HttpConfig => Section::HttpConfig(config_text(name, value)?),
        SectionKind::Config => Section::Config(config_text(name, value)?),
        SectionKind::Request => {
            let mut bytes = payload_bytes(name, value)?;
            if bytes.last() == Some(&b'\n') {
                bytes.pop();
            }
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Err(invalid(name, "request line is empty"));
            }
            Section::Request(bytes)
        }
        SectionKind::RawRequest => Section::RawRequest(payload_pieces(name, value)?),
        SectionKind::RawRequestMiddleDelay => {
            Section::RawRequestMiddleDelay(duration(name, value)?)
        }
        SectionKind::MoreHeaders => Section::MoreHeaders(header_lines(name, value)?),
        SectionKind::ResponseBody => Section::ResponseBody(body_matcher(name, value)?),
        SectionKind::ResponseBodyLike => {
            let source = pattern_text(name, value)?;
            Section::ResponseBodyLike(BodyMatcher::Pattern(compile(name, &source, true)?))
        }
        SectionKind::ResponseHeaders => {
            Section::ResponseHeaders(header_expectations(name, value)?)
        }
        SectionKind::ErrorCode => {
            let text = value.text().trim();
            let code: u16 = text
                .parse()
                .map_err(|_| invalid(name, format!("expected a status code, got {text:?}")))?;
            if !(100..=999).contains(&code) {
                return Err(invalid(name, format!("status code {code} out of range")));
            }
            Section::ErrorCode(code)
        }
        SectionKind::ErrorLog => Section::ErrorLog(text_matchers(name, value)?),
        SectionKind::NoErrorLog => Section::NoErrorLog(text_matchers(name, value)?),
        SectionKind::GrepErrorLog => Section::GrepErrorLog(grep_matcher(name, value)?),
        SectionKind::GrepErrorLogOut => Section::GrepErrorLogOut(body_matcher(name, value)?),
        SectionKind::LogLevel => {
            let level = value.text().trim();
            if !LOG_LEVELS.contains(&level) {
                return Err(invalid(
                    name,
                    format!("unknown log level {level:?}, expected one of {LOG_LEVELS:?}"),
                ));
            }
            Section::LogLevel(level.to_string())
        }
        SectionKind::Wait => Section::Wait(duration(name, value)?),
        SectionKind::Timeout => Section::Timeout(duration(name, value)?),
        SectionKind::TcpListen => Section::TcpListen(listen_addr(name, value)?),
        SectionKind::TcpQuery => Section::TcpQuery(body_matchers(name, value)?),
        SectionKind::TcpQueryLen => {
            let text = value.text().trim();
            let len: usize = text
                .parse()
                .map_err(|_| invalid(name, format!("expected a byte count, got {text:?}")))?;
            Section::TcpQueryLen(len)
        }
        SectionKind::TcpReply => Section::TcpReply(payload_pieces(name, value)?),
        SectionKind::TcpReplyDelay => Section::TcpReplyDelay(duration(name, value)?),
        SectionKind::TcpCloseDelay => Section::TcpCloseDelay(duration(name, value)?),
        SectionKind::UdpListen => Section::UdpListen(listen_addr(name, value)?),
        SectionKind::UdpQuery => Section::UdpQuery(body_matchers(name, value)?),
        SectionKind::UdpReply => Section::UdpReply(payload_pieces(name, value)?),
        SectionKind::UdpReplyDelay => Section::UdpReplyDelay(duration(name, value)?),
    };
    Ok(section)
}

fn evaluate(name: &str, value: &SectionValue) -> Result<Value, ParseErrorKind> {
    expr::evaluate(value.text()).map_err(|source| ParseErrorKind::Expression {
        section: name.to_string(),
        source,
    })
}

fn compile(name: &str, source: &str, dot_all: bool) -> Result<Pattern, ParseErrorKind> {
    RegexBuilder::new(source)
        .dot_matches_new_line(dot_all)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map(Pattern)
        .map_err(|e| invalid(name, format!("invalid regex: {e}")))
}

fn compile_source(name: &str, source: &PatternSource) -> Result<Pattern, ParseErrorKind> {
    source
        .compile()
        .map(Pattern)
        .map_err(|e| invalid(name, format!("invalid regex: {e}")))
}

fn chomped(text: &str) -> &str {
    text.strip_suffix('\n').unwrap_or(text)
}

fn config_text(name: &str, value: &SectionValue) -> Result<String, ParseErrorKind> {
    let bytes = payload_bytes(name, value)?;
    String::from_utf8(bytes).map_err(|_| invalid(name, "config is not valid UTF-8"))
}

fn payload_bytes(name: &str, value: &SectionValue) -> Result<Vec<u8>, ParseErrorKind> {
    match value.interpretation {
        Interpretation::Expression => match evaluate(name, value)? {
            Value::Bytes(bytes) => Ok(bytes),
            other => Err(invalid(
                name,
                format!("expected a string, got a {}", other.type_name()),
            )),
        },
        Interpretation::Literal | Interpretation::Pattern => Ok(value.text().as_bytes().to_vec()),
    }
}

/// Bytes to be written in pieces; an `eval` list gives one piece per item.
fn payload_pieces(name: &str, value: &SectionValue) -> Result<Vec<Vec<u8>>, ParseErrorKind> {
    if value.interpretation != Interpretation::Expression {
        return Ok(vec![value.text().as_bytes().to_vec()]);
    }
    match evaluate(name, value)? {
        Value::Bytes(bytes) => Ok(vec![bytes]),
        Value::List(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Bytes(bytes) => Ok(bytes),
                other => Err(invalid(
                    name,
                    format!("list items must be strings, got a {}", other.type_name()),
                )),
            })
            .collect(),
        Value::Pattern(_) => Err(invalid(name, "expected a string or list, got a regex")),
    }
}

fn value_to_body_matcher(name: &str, value: Value) -> Result<BodyMatcher, ParseErrorKind> {
    match value {
        Value::Bytes(bytes) => Ok(BodyMatcher::Exact(bytes)),
        Value::Pattern(source) => Ok(BodyMatcher::Pattern(compile_source(name, &source)?)),
        Value::List(_) => Err(invalid(name, "expected a string or regex, got a list")),
    }
}

fn body_matcher(name: &str, value: &SectionValue) -> Result<BodyMatcher, ParseErrorKind> {
    match value.interpretation {
        Interpretation::Expression => value_to_body_matcher(name, evaluate(name, value)?),
        Interpretation::Pattern => Ok(BodyMatcher::Pattern(compile(
            name,
            chomped(value.text()),
            false,
        )?)),
        Interpretation::Literal => Ok(BodyMatcher::Exact(value.text().as_bytes().to_vec())),
    }
}

fn body_matchers(name: &str, value: &SectionValue) -> Result<Vec<BodyMatcher>, ParseErrorKind> {
    if value.interpretation != Interpretation::Expression {
        return Ok(vec![body_matcher(name, value)?]);
    }
    match evaluate(name, value)? {
        Value::List(items) => items
            .into_iter()
            .map(|item| value_to_body_matcher(name, item))
            .collect(),
        single => Ok(vec![value_to_body_matcher(name, single)?]),
    }
}

/// Regex source for `response_body_like`.
fn pattern_text(name: &str, value: &SectionValue) -> Result<String, ParseErrorKind> {
    match value.interpretation {
        Interpretation::Expression => match evaluate(name, value)? {
            Value::Bytes(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Value::Pattern(source) => Ok(source.source),
            Value::List(_) => Err(invalid(name, "expected a regex, got a list")),
        },
        Interpretation::Literal | Interpretation::Pattern => {
            Ok(chomped(value.text()).to_string())
        }
    }
}

fn value_to_text_matcher(name: &str, value: Value) -> Result<TextMatcher, ParseErrorKind> {
    match value {
        Value::Bytes(bytes) => Ok(TextMatcher::Literal(
            String::from_utf8_lossy(&bytes).into_owned(),
        )),
        Value::Pattern(source) => Ok(TextMatcher::Pattern(compile_source(name, &source)?)),
        Value::List(_) => Err(invalid(name, "nested lists are not allowed")),
    }
}

/// One matcher per non-empty line, or per item of an `eval` list.
fn text_matchers(name: &str, value: &SectionValue) -> Result<Vec<TextMatcher>, ParseErrorKind> {
    match value.interpretation {
        Interpretation::Expression => match evaluate(name, value)? {
            Value::List(items) => items
                .into_iter()
                .map(|item| value_to_text_matcher(name, item))
                .collect(),
            single => Ok(vec![value_to_text_matcher(name, single)?]),
        },
        Interpretation::Pattern => value
            .text()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| compile(name, l, false).map(TextMatcher::Pattern))
            .collect(),
        Interpretation::Literal => Ok(value
            .text()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| TextMatcher::Literal(l.to_string()))
            .collect()),
    }
}

fn grep_matcher(name: &str, value: &SectionValue) -> Result<TextMatcher, ParseErrorKind> {
    let matcher = match value.interpretation {
        Interpretation::Expression => value_to_text_matcher(name, evaluate(name, value)?)?,
        Interpretation::Pattern => TextMatcher::Pattern(compile(name, chomped(value.text()), false)?),
        Interpretation::Literal => TextMatcher::Literal(chomped(value.text()).to_string()),
    };
    if matches!(&matcher, TextMatcher::Literal(text) if text.is_empty()) {
        return Err(invalid(name, "pattern is empty"));
    }
    Ok(matcher)
}

fn header_lines(name: &str, value: &SectionValue) -> Result<Vec<(String, String)>, ParseErrorKind> {
    let text = String::from_utf8(payload_bytes(name, value)?)
        .map_err(|_| invalid(name, "headers are not valid UTF-8"))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let (header, val) = l
                .split_once(':')
                .ok_or_else(|| invalid(name, format!("expected 'Name: value', got {l:?}")))?;
            let header = header.trim();
            if header.is_empty() {
                return Err(invalid(name, format!("header name is empty in {l:?}")));
            }
            Ok((header.to_string(), val.trim().to_string()))
        })
        .collect()
}

fn header_expectations(
    name: &str,
    value: &SectionValue,
) -> Result<Vec<HeaderExpectation>, ParseErrorKind> {
    value
        .text()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            if let Some(absent) = l.trim().strip_prefix('!') {
                let absent = absent.trim();
                if absent.is_empty() {
                    return Err(invalid(name, "'!' must be followed by a header name"));
                }
                return Ok(HeaderExpectation::Absent {
                    name: absent.to_string(),
                });
            }
            let (header, val) = l.split_once(':').ok_or_else(|| {
                invalid(name, format!("expected 'Name: value' or '!Name', got {l:?}"))
            })?;
            Ok(HeaderExpectation::Equals {
                name: header.trim().to_string(),
                value: val.trim().to_string(),
            })
        })
        .collect()
}

/// Parses seconds as a float, with optional `ms` or `s` suffix.
fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let (number, scale) = if let Some(n) = text.strip_suffix("ms") {
        (n, 1e-3)
    } else if let Some(n) = text.strip_suffix('s') {
        (n, 1.0)
    } else {
        (text, 1.0)
    };
    let secs: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("expected a duration in seconds, got {text:?}"))?;
    Duration::try_from_secs_f64(secs * scale).map_err(|e| format!("{text:?}: {e}"))
}

fn duration(name: &str, value: &SectionValue) -> Result<Duration, ParseErrorKind> {
    parse_duration(value.text()).map_err(|message| invalid(name, message))
}

fn listen_addr(name: &str, value: &SectionValue) -> Result<ListenAddr, ParseErrorKind> {
    value
        .text()
        .parse()
        .map_err(|message: String| invalid(name, message))
}

// ============================================================================
// Block validation
// ============================================================================

/// Cross-section rules; returns the offending section's line on failure.
fn validate_block(block: &TestBlock) -> Result<(), (usize, ParseErrorKind)> {
    let line_of = |kind: SectionKind| {
        block
            .entries()
            .iter()
            .find(|e| e.section.kind() == Some(kind))
            .map_or(block.line(), |e| e.value.line)
    };
    let exclusive = |a: SectionKind, b: SectionKind| {
        if block.has(a) && block.has(b) {
            Err((
                line_of(b),
                invalid(b.name(), format!("cannot be combined with '{}'", a.name())),
            ))
        } else {
            Ok(())
        }
    };

    exclusive(SectionKind::Request, SectionKind::RawRequest)?;
    exclusive(SectionKind::ResponseBody, SectionKind::ResponseBodyLike)?;

    let pairs = [
        (
            SectionKind::TcpQuery,
            SectionKind::TcpReply,
            block.tcp_query().len(),
            block.tcp_reply().len(),
        ),
        (
            SectionKind::UdpQuery,
            SectionKind::UdpReply,
            block.udp_query().len(),
            block.udp_reply().len(),
        ),
    ];
    for (query, reply, queries, replies) in pairs {
        if queries > 1 && block.has(reply) && replies != queries {
            return Err((
                line_of(reply),
                invalid(
                    reply.name(),
                    format!(
                        "{replies} replies for {queries} '{}' entries; the lists must pair up",
                        query.name()
                    ),
                ),
            ));
        }
    }

    let requires: [(SectionKind, &[SectionKind]); 2] = [
        (
            SectionKind::TcpListen,
            &[
                SectionKind::TcpQuery,
                SectionKind::TcpQueryLen,
                SectionKind::TcpReply,
                SectionKind::TcpReplyDelay,
                SectionKind::TcpCloseDelay,
                SectionKind::TcpNoClose,
                SectionKind::TcpShutdown,
            ],
        ),
        (
            SectionKind::UdpListen,
            &[
                SectionKind::UdpQuery,
                SectionKind::UdpReply,
                SectionKind::UdpReplyDelay,
            ],
        ),
    ];
    for (listen, dependents) in requires {
        if block.has(listen) {
            continue;
        }
        if let Some(dependent) = dependents.iter().find(|k| block.has(**k)) {
            return Err((
                line_of(*dependent),
                invalid(dependent.name(), format!("requires '{}'", listen.name())),
            ));
        }
    }
    Ok(())
}
