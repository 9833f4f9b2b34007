//! Core error types for `ngx-scaffold`
//!
//! Parse errors are fatal to a whole suite: block boundaries are structural,
//! so a malformed block means nothing after it can be trusted.

use thiserror::Error;

use crate::expr::ExprError;

// ============================================================================
// Parse Errors
// ============================================================================

/// A fatal error found while parsing a test-suite document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{source_name}:{line}: {kind}")]
pub struct ParseError {
    /// Name of the parsed document (usually its path).
    pub source_name: String,
    /// 1-based line where the problem was detected.
    pub line: usize,
    /// Title of the enclosing block, if any.
    pub block: Option<String>,
    /// What went wrong.
    pub kind: ParseErrorKind,
}

/// The specific reason a document failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    /// The document contains no `===` block headers.
    #[error("no test blocks found")]
    NoBlocks,

    /// Non-blank text appeared inside a block but outside any section.
    #[error("text outside of any section: {0:?}")]
    ContentOutsideSection(String),

    /// A `---` header had no section name.
    #[error("section header without a name")]
    EmptySectionName,

    /// A section name contained characters outside `[A-Za-z0-9_]`.
    #[error("invalid section name '{0}'")]
    InvalidSectionName(String),

    /// The same section was declared twice in one block.
    #[error("duplicate section '{name}' (first declared on line {first_line})")]
    DuplicateSection {
        /// Section name
        name: String,
        /// Line of the first declaration
        first_line: usize,
    },

    /// A section header carried a modifier the parser does not know.
    #[error("unknown modifier '{modifier}' on section '{section}'")]
    UnknownModifier {
        /// Section name
        section: String,
        /// Offending modifier token
        modifier: String,
    },

    /// Strict mode rejected a section outside the vocabulary.
    #[error("unknown section '{name}'{}", suggestion.as_ref().map_or_else(String::new, |s| format!(" (did you mean '{s}'?)")))]
    UnknownSection {
        /// Section name as written
        name: String,
        /// Closest known section name, if any is similar enough
        suggestion: Option<String>,
    },

    /// A section payload failed its type's validation rule.
    #[error("invalid value for section '{section}': {message}")]
    InvalidValue {
        /// Section name
        section: String,
        /// Description of the problem
        message: String,
    },

    /// An `eval` payload is not a valid expression.
    #[error("expression error in section '{section}': {source}")]
    Expression {
        /// Section name
        section: String,
        /// Underlying expression error
        #[source]
        source: ExprError,
    },
}

/// A non-fatal observation made while parsing in lenient mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    /// 1-based line of the observation.
    pub line: usize,
    /// Human-readable message.
    pub message: String,
}

impl std::fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}
