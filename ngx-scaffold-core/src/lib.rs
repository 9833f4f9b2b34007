//! `ngx-scaffold` core: test block model and block parser
//!
//! This crate turns a declarative test-suite document into an ordered
//! sequence of typed [`TestBlock`]s. It performs no I/O: the harness in the
//! `ngx-scaffold` crate reads files and drives the server under test.

pub mod block;
pub mod error;
pub mod expr;
pub mod parser;

pub use block::{
    BodyMatcher, HeaderExpectation, Interpretation, ListenAddr, Pattern, Section, SectionEntry,
    SectionKind, SectionValue, Suite, TestBlock, TextMatcher,
};
pub use error::{ParseError, ParseErrorKind, ParseWarning};
pub use parser::{ParseOptions, ParseOutput, Strictness, parse_suite};
