//! Escaped-string expressions for `eval` sections.
//!
//! Payloads marked with the `eval` modifier are parsed as a small expression
//! language rather than taken literally. It covers what test authors need to
//! craft exact bytes:
//!
//! - `"..."` strings with escapes (`\r`, `\n`, `\t`, `\0`, `\e`, `\\`, `\"`,
//!   `\$`, `\@`, `\xHH`, `\x{HHHH}`)
//! - `'...'` strings where only `\\` and `\'` are escapes
//! - concatenation with `.` and repetition with `x N`
//! - lists `[a, b, c]`
//! - regular expressions `qr/.../flags` (flags `i`, `m`, `s`, `x`)
//! - `#` comments to end of line

use thiserror::Error;

/// Maximum size a repetition may produce.
pub const MAX_EXPANDED_BYTES: usize = 64 * 1024 * 1024;

/// An expression syntax or evaluation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("at offset {offset}: {message}")]
pub struct ExprError {
    /// Byte offset into the expression source.
    pub offset: usize,
    /// Description of the problem.
    pub message: String,
}

/// The result of evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A byte string.
    Bytes(Vec<u8>),
    /// A regular expression literal, not yet compiled.
    Pattern(PatternSource),
    /// An ordered list of values.
    List(Vec<Value>),
}

impl Value {
    /// Short type name for diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "string",
            Self::Pattern(_) => "regex",
            Self::List(_) => "list",
        }
    }
}

/// Source text and flags of a `qr//` literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSource {
    /// The regular expression body.
    pub source: String,
    /// Flag characters (`i`, `m`, `s`, `x`).
    pub flags: String,
}

impl PatternSource {
    /// Compiles the pattern with its flags applied.
    ///
    /// # Errors
    ///
    /// Returns the regex crate's error if the pattern is invalid.
    pub fn compile(&self) -> Result<regex::Regex, regex::Error> {
        regex::RegexBuilder::new(&self.source)
            .case_insensitive(self.flags.contains('i'))
            .multi_line(self.flags.contains('m'))
            .dot_matches_new_line(self.flags.contains('s'))
            .ignore_whitespace(self.flags.contains('x'))
            .size_limit(1 << 20)
            .build()
    }
}

/// Evaluates an expression source into a [`Value`].
///
/// # Errors
///
/// Returns an [`ExprError`] on syntax errors, type errors (e.g.
/// concatenating a list) or when a repetition exceeds
/// [`MAX_EXPANDED_BYTES`].
pub fn evaluate(source: &str) -> Result<Value, ExprError> {
    let mut cursor = Cursor::new(source);
    cursor.skip_trivia();
    if cursor.at_end() {
        return Err(cursor.error("empty expression"));
    }
    let value = cursor.expression()?;
    cursor.skip_trivia();
    if !cursor.at_end() {
        return Err(cursor.error("unexpected trailing input"));
    }
    Ok(value)
}

// ============================================================================
// Recursive-descent evaluator
// ============================================================================

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError {
            offset: self.pos,
            message: message.into(),
        }
    }

    const fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    /// `expression := repeat ('.' repeat)*`
    fn expression(&mut self) -> Result<Value, ExprError> {
        let mut value = self.repeat()?;
        loop {
            self.skip_trivia();
            if self.peek() != Some('.') {
                return Ok(value);
            }
            let at = self.pos;
            self.bump();
            self.skip_trivia();
            let rhs = self.repeat()?;
            value = match (value, rhs) {
                (Value::Bytes(mut lhs), Value::Bytes(rhs)) => {
                    lhs.extend_from_slice(&rhs);
                    Value::Bytes(lhs)
                }
                (lhs, rhs) => {
                    return Err(ExprError {
                        offset: at,
                        message: format!(
                            "cannot concatenate {} with {}",
                            lhs.type_name(),
                            rhs.type_name()
                        ),
                    });
                }
            };
        }
    }

    /// `repeat := atom ('x' INTEGER)*`
    fn repeat(&mut self) -> Result<Value, ExprError> {
        let mut value = self.atom()?;
        loop {
            let save = self.pos;
            self.skip_trivia();
            if !self.rest().starts_with('x') {
                self.pos = save;
                return Ok(value);
            }
            let after_x = &self.rest()[1..];
            let count_follows = after_x
                .trim_start()
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit());
            if !count_follows {
                self.pos = save;
                return Ok(value);
            }
            let at = self.pos;
            self.bump();
            self.skip_trivia();
            let count = self.integer()?;
            value = repeat_value(value, count).map_err(|message| ExprError {
                offset: at,
                message,
            })?;
        }
    }

    fn integer(&mut self) -> Result<usize, ExprError> {
        let digits: String = self
            .rest()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '_')
            .collect();
        if digits.is_empty() {
            return Err(self.error("expected an integer"));
        }
        let value = digits
            .replace('_', "")
            .parse::<usize>()
            .map_err(|e| self.error(format!("invalid integer: {e}")))?;
        self.pos += digits.len();
        Ok(value)
    }

    fn atom(&mut self) -> Result<Value, ExprError> {
        self.skip_trivia();
        match self.peek() {
            Some('"') => {
                self.bump();
                self.double_quoted().map(Value::Bytes)
            }
            Some('\'') => {
                self.bump();
                self.single_quoted().map(Value::Bytes)
            }
            Some('[') => {
                self.bump();
                self.list()
            }
            Some('(') => {
                self.bump();
                let inner = self.expression()?;
                self.skip_trivia();
                if self.bump() != Some(')') {
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            }
            Some('q') if self.rest().starts_with("qr") => {
                self.pos += 2;
                self.regex_literal()
            }
            Some(c) => Err(self.error(format!("unexpected character {c:?}"))),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn list(&mut self) -> Result<Value, ExprError> {
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some(']') {
                self.bump();
                return Ok(Value::List(items));
            }
            items.push(self.expression()?);
            self.skip_trivia();
            match self.bump() {
                Some(',') => {}
                Some(']') => return Ok(Value::List(items)),
                _ => return Err(self.error("expected ',' or ']' in list")),
            }
        }
    }

    fn double_quoted(&mut self) -> Result<Vec<u8>, ExprError> {
        let mut out = Vec::new();
        let mut utf8 = [0u8; 4];
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated string"));
            };
            match c {
                '"' => return Ok(out),
                '\\' => self.escape(&mut out)?,
                other => out.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes()),
            }
        }
    }

    fn escape(&mut self, out: &mut Vec<u8>) -> Result<(), ExprError> {
        let Some(c) = self.bump() else {
            return Err(self.error("unterminated escape"));
        };
        match c {
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            '0' => out.push(0),
            'e' => out.push(0x1b),
            'a' => out.push(0x07),
            'f' => out.push(0x0c),
            'x' => self.hex_escape(out)?,
            other => {
                let mut utf8 = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes());
            }
        }
        Ok(())
    }

    fn hex_escape(&mut self, out: &mut Vec<u8>) -> Result<(), ExprError> {
        if self.peek() == Some('{') {
            self.bump();
            let end = self
                .rest()
                .find('}')
                .ok_or_else(|| self.error("unterminated \\x{...} escape"))?;
            let hex = &self.rest()[..end];
            let code = u32::from_str_radix(hex, 16)
                .map_err(|_| self.error(format!("invalid hex escape {hex:?}")))?;
            let ch = char::from_u32(code)
                .ok_or_else(|| self.error(format!("invalid code point {code:#x}")))?;
            self.pos += end + 1;
            let mut utf8 = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
            return Ok(());
        }
        let hex: String = self
            .rest()
            .chars()
            .take(2)
            .take_while(char::is_ascii_hexdigit)
            .collect();
        if hex.is_empty() {
            out.push(0);
            return Ok(());
        }
        self.pos += hex.len();
        let byte =
            u8::from_str_radix(&hex, 16).map_err(|_| self.error(format!("invalid hex {hex:?}")))?;
        out.push(byte);
        Ok(())
    }

    fn single_quoted(&mut self) -> Result<Vec<u8>, ExprError> {
        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated string"));
            };
            match c {
                '\'' => return Ok(out.into_bytes()),
                '\\' => match self.peek() {
                    Some(next @ ('\\' | '\'')) => {
                        self.bump();
                        out.push(next);
                    }
                    _ => out.push('\\'),
                },
                other => out.push(other),
            }
        }
    }

    fn regex_literal(&mut self) -> Result<Value, ExprError> {
        let open = self
            .bump()
            .ok_or_else(|| self.error("expected regex delimiter after qr"))?;
        let close = match open {
            '{' => '}',
            '(' => ')',
            '[' => ']',
            '<' => '>',
            c if c.is_alphanumeric() || c.is_whitespace() => {
                return Err(self.error(format!("invalid regex delimiter {c:?}")));
            }
            c => c,
        };
        let mut source = String::new();
        let mut depth = 0usize;
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated regex literal"));
            };
            if c == '\\' {
                match self.bump() {
                    Some(next) if next == close || next == open => source.push(next),
                    Some(next) => {
                        source.push('\\');
                        source.push(next);
                    }
                    None => return Err(self.error("unterminated regex literal")),
                }
                continue;
            }
            if open != close && c == open {
                depth += 1;
            } else if c == close {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            source.push(c);
        }
        let flags: String = self
            .rest()
            .chars()
            .take_while(char::is_ascii_alphabetic)
            .collect();
        if let Some(bad) = flags.chars().find(|c| !matches!(c, 'i' | 'm' | 's' | 'x')) {
            return Err(self.error(format!("unsupported regex flag {bad:?}")));
        }
        self.pos += flags.len();
        let pattern = PatternSource { source, flags };
        pattern
            .compile()
            .map_err(|e| self.error(format!("invalid regex: {e}")))?;
        Ok(Value::Pattern(pattern))
    }
}

fn repeat_value(value: Value, count: usize) -> Result<Value, String> {
    match value {
        Value::Bytes(bytes) => {
            let total = bytes.len().saturating_mul(count);
            if total > MAX_EXPANDED_BYTES {
                return Err(format!(
                    "repetition produces {total} bytes (limit {MAX_EXPANDED_BYTES})"
                ));
            }
            Ok(Value::Bytes(bytes.repeat(count)))
        }
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len().saturating_mul(count));
            for _ in 0..count {
                out.extend(items.iter().cloned());
            }
            Ok(Value::List(out))
        }
        Value::Pattern(_) => Err("cannot repeat a regex".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(src: &str) -> Vec<u8> {
        match evaluate(src).unwrap() {
            Value::Bytes(b) => b,
            other => panic!("expected bytes, got {other:?}"),
        }
    }

    #[test]
    fn double_quoted_escapes() {
        assert_eq!(bytes(r#""GET / HTTP/1.0\r\n\r\n""#), b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(bytes(r#""a\tb\0c""#), b"a\tb\0c");
        assert_eq!(bytes(r#""\x41\x{263A}""#), "A\u{263A}".as_bytes());
        assert_eq!(bytes(r#""\$x \"q\"""#), b"$x \"q\"");
    }

    #[test]
    fn single_quoted_is_raw() {
        assert_eq!(bytes(r"'a\nb'"), b"a\\nb");
        assert_eq!(bytes(r"'it\'s'"), b"it's");
    }

    #[test]
    fn concatenation_and_repetition() {
        assert_eq!(bytes(r#""a" . "b" x 3 . "c""#), b"abbbc");
        assert_eq!(bytes(r#"("ab") x 2"#), b"abab");
        assert_eq!(bytes("\"x\" x 1_000").len(), 1000);
    }

    #[test]
    fn lists_and_comments() {
        let value = evaluate("[\"GET /\", # first piece\n \"\\r\\n\\r\\n\",]").unwrap();
        assert_eq!(
            value,
            Value::List(vec![
                Value::Bytes(b"GET /".to_vec()),
                Value::Bytes(b"\r\n\r\n".to_vec()),
            ])
        );
    }

    #[test]
    fn regex_literal_with_flags() {
        let value = evaluate(r"qr/I am dying!/i").unwrap();
        let Value::Pattern(pattern) = value else {
            panic!("expected a pattern");
        };
        assert_eq!(pattern.flags, "i");
        assert!(pattern.compile().unwrap().is_match("i AM DYING!"));
    }

    #[test]
    fn regex_literal_alternate_delimiters() {
        let Value::Pattern(p) = evaluate(r"qr{a/x{2}}").unwrap() else {
            panic!("expected a pattern");
        };
        assert_eq!(p.source, "a/x{2}");
        let Value::Pattern(p) = evaluate(r"qr/a\/b/").unwrap() else {
            panic!("expected a pattern");
        };
        assert_eq!(p.source, "a/b");
    }

    #[test]
    fn errors_carry_offsets() {
        let err = evaluate("\"abc").unwrap_err();
        assert!(err.message.contains("unterminated"));

        let err = evaluate("[\"a\"] . \"b\"").unwrap_err();
        assert!(err.message.contains("cannot concatenate list"));

        let err = evaluate("qr/(/").unwrap_err();
        assert!(err.message.contains("invalid regex"));

        assert!(evaluate("   ").is_err());
        assert!(evaluate("\"a\" \"b\"").is_err());
    }

    #[test]
    fn repetition_limit_is_enforced() {
        let err = evaluate("\"abcd\" x 100000000").unwrap_err();
        assert!(err.message.contains("limit"));
    }
}
