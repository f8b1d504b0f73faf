//! Structured template errors: an enumerated kind, a source location and
//! optional related locations. The stringified form is
//! `path:line:col: error: <message>`, with the kind's payload fields
//! interpolated into the message.

use itertools::Itertools;
use std::fmt::{self, Display};
use thiserror::Error;
use winnow::error::{ContextError, ParseError, StrContext, StrContextValue};

/// Position of an error within a template source file. Lines and columns are
/// 1-based; an unknown location renders as `0:0`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Everything that can go wrong while loading, parsing or rendering a
/// template. Parse-time and render-time kinds share one enum so a single
/// error type can travel through the whole pipeline.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ErrorKind {
    #[error("Parse error")]
    Unspecified,
    #[error("Unexpected exception occurred during template processing: {reason}")]
    UnexpectedException { reason: String },
    #[error("File not found: '{name}'")]
    FileNotFound { name: String },
    #[error("String expected")]
    ExpectedStringLiteral,
    #[error("Identifier expected")]
    ExpectedIdentifier,
    #[error("']' expected")]
    ExpectedSquareBracket,
    #[error("')' expected")]
    ExpectedRoundBracket,
    #[error("'}}' expected")]
    ExpectedCurlyBracket,
    #[error("{}", format_expected_token(.actual, .expected))]
    ExpectedToken {
        actual: String,
        expected: Vec<String>,
    },
    #[error("Expression expected")]
    ExpectedExpression,
    #[error("Expected end of statement, got '{actual}'")]
    ExpectedEndOfStatement { actual: String },
    #[error("Unexpected token '{token}'")]
    UnexpectedToken { token: String },
    #[error("Unexpected statement '{statement}'")]
    UnexpectedStatement { statement: String },
    #[error("Unexpected comment block begin ('{{#')")]
    UnexpectedCommentBegin,
    #[error("Unexpected comment block end ('#}}')")]
    UnexpectedCommentEnd,
    #[error("Unexpected expression block begin ('{{{{')")]
    UnexpectedExprBegin,
    #[error("Unexpected expression block end ('}}}}')")]
    UnexpectedExprEnd,
    #[error("Unexpected statement block begin ('{{%')")]
    UnexpectedStmtBegin,
    #[error("Unexpected statement block end ('%}}')")]
    UnexpectedStmtEnd,
    #[error("Template '{name}' not found")]
    TemplateNotFound { name: String },
    #[error("Template '{name}' not parsed")]
    TemplateNotParsed { name: String },
    #[error("Invalid type of the value in the particular context{}", format_reason(.reason))]
    InvalidValueType { reason: String },
    #[error("Invalid template name: '{name}'")]
    InvalidTemplateName { name: String },
    #[error("Extension '{extension}' is disabled")]
    ExtensionDisabled { extension: String },
    #[error("Template environment doesn't set")]
    TemplateEnvAbsent,
}

impl ErrorKind {
    /// Attach a source location, producing a full [Error]
    pub fn at(self, location: SourceLocation) -> Error {
        Error {
            kind: self,
            location,
            related: Vec::new(),
        }
    }

    /// Produce an [Error] with no meaningful location. Used for render-time
    /// failures where the failing value is known but its source span is not
    /// tracked.
    pub fn into_error(self) -> Error {
        self.at(SourceLocation::default())
    }

    /// Shorthand for [ErrorKind::InvalidValueType] with a reason message
    pub fn invalid_type(reason: impl Into<String>) -> Self {
        Self::InvalidValueType {
            reason: reason.into(),
        }
    }

    /// Shorthand for [ErrorKind::UnexpectedException]
    pub fn exception(reason: impl Display) -> Self {
        Self::UnexpectedException {
            reason: reason.to_string(),
        }
    }
}

/// `Unexpected token 'x'. Expected: 'a', 'b'`
fn format_expected_token(actual: &str, expected: &[String]) -> String {
    if expected.is_empty() {
        format!("Unexpected token '{actual}'")
    } else {
        format!(
            "Unexpected token '{actual}'. Expected: {}",
            expected.iter().map(|t| format!("'{t}'")).join(", ")
        )
    }
}

fn format_reason(reason: &str) -> String {
    if reason.is_empty() {
        String::new()
    } else {
        format!(": {reason}")
    }
}

/// A structured template error: what went wrong and where. The `Display`
/// form is `path:line:col: error: <message>`.
#[derive(Clone, Debug, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    location: SourceLocation,
    /// Other locations involved in the error, e.g. the statement that opened
    /// an unbalanced block
    related: Vec<SourceLocation>,
}

impl Error {
    pub fn new(kind: ErrorKind, location: SourceLocation) -> Self {
        Self {
            kind,
            location,
            related: Vec::new(),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    pub fn related_locations(&self) -> &[SourceLocation] {
        &self.related
    }

    /// Attach a related source location
    #[must_use]
    pub fn with_related(mut self, location: SourceLocation) -> Self {
        self.related.push(location);
        self
    }

    /// Fill in the location if the error doesn't carry one yet. Render-time
    /// errors are typically created where the file/line isn't known and
    /// located by the statement that triggered them.
    #[must_use]
    pub fn or_located_at(mut self, location: &SourceLocation) -> Self {
        if self.location == SourceLocation::default() {
            self.location = location.clone();
        }
        self
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: error: {}", self.location, self.kind)
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        kind.into_error()
    }
}

/// Map a winnow parse failure onto a structured kind. The grammar attaches
/// [StrContext] entries whose labels match error kinds; the innermost
/// expectation wins, falling back to a plain unexpected-token error on the
/// offending input.
pub(crate) fn from_parse_error(
    error: &ParseError<&str, ContextError>,
) -> ErrorKind {
    // A structured kind raised from within the grammar (unknown filter,
    // argument binding mismatch) passes through unchanged
    if let Some(cause) = error.inner().cause()
        && let Some(kind) = cause.downcast_ref::<ErrorKind>()
    {
        return kind.clone();
    }

    let offset = error.offset();
    let input = error.input();
    let token = input[offset..]
        .split_whitespace()
        .next()
        .unwrap_or("<end of input>")
        .to_owned();

    let mut expected = Vec::new();
    for context in error.inner().context() {
        match context {
            StrContext::Label(label) => match *label {
                "identifier" => return ErrorKind::ExpectedIdentifier,
                "string literal" => return ErrorKind::ExpectedStringLiteral,
                _ => {}
            },
            StrContext::Expected(value) => match value {
                StrContextValue::CharLiteral(']') => {
                    return ErrorKind::ExpectedSquareBracket;
                }
                StrContextValue::CharLiteral(')') => {
                    return ErrorKind::ExpectedRoundBracket;
                }
                StrContextValue::CharLiteral('}') => {
                    return ErrorKind::ExpectedCurlyBracket;
                }
                StrContextValue::CharLiteral(c) => {
                    expected.push(c.to_string());
                }
                StrContextValue::StringLiteral(s) => {
                    expected.push((*s).to_owned());
                }
                StrContextValue::Description(desc) => {
                    if *desc == "expression" {
                        return ErrorKind::ExpectedExpression;
                    }
                    expected.push((*desc).to_owned());
                }
                _ => {}
            },
            _ => {}
        }
    }

    if expected.is_empty() {
        ErrorKind::UnexpectedToken { token }
    } else {
        ErrorKind::ExpectedToken {
            actual: token,
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::not_found(
        ErrorKind::TemplateNotFound { name: "base.j2".into() },
        "tpl.j2:3:7: error: Template 'base.j2' not found"
    )]
    #[case::expected_token(
        ErrorKind::ExpectedToken {
            actual: "endfor".into(),
            expected: vec!["endif".into(), "elif".into()],
        },
        "tpl.j2:3:7: error: Unexpected token 'endfor'. Expected: 'endif', 'elif'"
    )]
    #[case::expected_bracket(
        ErrorKind::ExpectedSquareBracket,
        "tpl.j2:3:7: error: ']' expected"
    )]
    #[case::env_absent(
        ErrorKind::TemplateEnvAbsent,
        "tpl.j2:3:7: error: Template environment doesn't set"
    )]
    fn test_display(#[case] kind: ErrorKind, #[case] expected: &str) {
        let error = kind.at(SourceLocation::new("tpl.j2", 3, 7));
        assert_eq!(error.to_string(), expected);
    }
}
