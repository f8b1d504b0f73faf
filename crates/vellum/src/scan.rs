//! The rough scan: split raw template text into classified blocks using the
//! seven markers (`{{`, `}}`, `{%`, `%}`, `{#`, `#}`, newline), validate
//! marker nesting, track line numbers and apply whitespace control. The
//! fine-grained grammar inside expression/statement blocks is handled by
//! the parser; this pass only finds the block boundaries.

use crate::{
    environment::Settings,
    error::{Error, ErrorKind, SourceLocation},
};
use regex::Regex;
use std::{ops::Range, sync::LazyLock};

/// The marker automaton. Alternation order matters only for bookkeeping;
/// all markers are two characters except the newline.
static MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\{\{)|(\}\})|(\{%)|(%\})|(\{#)|(#\})|(\n)").unwrap()
});

/// Classified block of template source
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BlockKind {
    RawText,
    Expression,
    Statement,
    Comment,
    /// A line whose first non-whitespace character is `#`; the rest of the
    /// line is a statement
    LineStatement,
}

/// One block of the template: for raw text the range covers the text to
/// emit (after whitespace control); for the other kinds it covers the
/// content between the markers (minus any strip sigils)
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TextBlock {
    pub kind: BlockKind,
    pub range: Range<usize>,
}

/// Byte offset → 1-based line/column mapping for error reporting
pub(crate) struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(
            source
                .char_indices()
                .filter(|(_, c)| *c == '\n')
                .map(|(i, _)| i + 1),
        );
        Self { starts }
    }

    pub fn locate(&self, file: &str, offset: usize) -> SourceLocation {
        let line = self
            .starts
            .partition_point(|start| *start <= offset);
        let column = offset - self.starts[line - 1] + 1;
        SourceLocation::new(file, line as u32, column as u32)
    }
}

/// Whitespace-control sigil attached to a marker
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Strip {
    Default,
    /// `-`: strip adjacent whitespace including newlines
    Minus,
    /// `+`: keep adjacent whitespace even when the engine default strips
    Plus,
}

/// A block plus the strip behavior its markers requested
struct PendingBlock {
    kind: BlockKind,
    range: Range<usize>,
    open_strip: Strip,
    close_strip: Strip,
}

pub(crate) fn scan(
    source: &str,
    file: &str,
    settings: &Settings,
) -> Result<Vec<TextBlock>, Error> {
    Scanner::new(source, file, settings).run()
}

struct Scanner<'a> {
    source: &'a str,
    file: &'a str,
    settings: &'a Settings,
    lines: LineIndex,
    blocks: Vec<PendingBlock>,
    kind: BlockKind,
    /// Start offset of the current block's content
    start: usize,
    /// Strip mode of the marker that opened the current block
    open_strip: Strip,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str, file: &'a str, settings: &'a Settings) -> Self {
        Self {
            source,
            file,
            settings,
            lines: LineIndex::new(source),
            blocks: Vec::new(),
            kind: initial_kind(source, 0),
            start: 0,
            open_strip: Strip::Default,
        }
    }

    fn run(mut self) -> Result<Vec<TextBlock>, Error> {
        for m in MARKERS.find_iter(self.source) {
            // Markers that landed before the current content start belong
            // to an already-consumed sigil
            if m.start() < self.start {
                continue;
            }
            match m.as_str() {
                "\n" => self.newline(m.start()),
                "{{" => self.open(m.start(), BlockKind::Expression)?,
                "{%" => self.open(m.start(), BlockKind::Statement)?,
                "{#" => self.open_comment(m.start())?,
                "}}" => self.close(m.start(), BlockKind::Expression)?,
                "%}" => self.close(m.start(), BlockKind::Statement)?,
                "#}" => self.close_comment(m.start())?,
                _ => unreachable!(),
            }
        }
        self.finish()
    }

    fn error(&self, kind: ErrorKind, offset: usize) -> Error {
        kind.at(self.lines.locate(self.file, offset))
    }

    fn newline(&mut self, offset: usize) {
        match self.kind {
            BlockKind::LineStatement => {
                // The line statement ends here; its terminating newline is
                // consumed
                self.push(BlockKind::LineStatement, self.start..offset);
                self.start = offset + 1;
                self.kind = initial_kind(self.source, self.start);
            }
            BlockKind::RawText => {
                // The newline stays in the raw text; peek at the next line
                // to see whether it's a line statement
                if let BlockKind::LineStatement =
                    initial_kind(self.source, offset + 1)
                {
                    self.push(BlockKind::RawText, self.start..offset + 1);
                    self.start = offset + 1;
                    self.kind = BlockKind::LineStatement;
                }
            }
            // Newlines are insignificant inside marker-delimited blocks
            _ => {}
        }
    }

    fn open(
        &mut self,
        offset: usize,
        kind: BlockKind,
    ) -> Result<(), Error> {
        if self.kind != BlockKind::RawText {
            // Opens are opaque inside comments and nested blocks
            return Ok(());
        }
        self.push(BlockKind::RawText, self.start..offset);
        let (strip, content_start) = self.open_sigil(offset + 2);
        self.kind = kind;
        self.start = content_start;
        self.open_strip = strip;
        Ok(())
    }

    fn open_comment(&mut self, offset: usize) -> Result<(), Error> {
        match self.kind {
            BlockKind::RawText => {
                self.push(BlockKind::RawText, self.start..offset);
                let (strip, content_start) = self.open_sigil(offset + 2);
                self.kind = BlockKind::Comment;
                self.start = content_start;
                self.open_strip = strip;
                Ok(())
            }
            // A second comment open inside a comment is part of its text
            BlockKind::Comment => Ok(()),
            _ => Err(self.error(ErrorKind::UnexpectedCommentBegin, offset)),
        }
    }

    fn close(
        &mut self,
        offset: usize,
        kind: BlockKind,
    ) -> Result<(), Error> {
        if self.kind == BlockKind::RawText {
            let error_kind = if kind == BlockKind::Expression {
                ErrorKind::UnexpectedExprEnd
            } else {
                ErrorKind::UnexpectedStmtEnd
            };
            return Err(self.error(error_kind, offset));
        }
        if self.kind != kind || self.quoted_close(offset) {
            // A mismatched close inside another block kind (including a
            // comment) is ordinary content
            return Ok(());
        }
        let (strip, content_end) = self.close_sigil(offset);
        let open_strip = self.open_strip;
        self.finish_block(kind, content_end, open_strip, strip, offset + 2);
        Ok(())
    }

    fn close_comment(&mut self, offset: usize) -> Result<(), Error> {
        match self.kind {
            BlockKind::Comment => {
                let (strip, content_end) = self.close_sigil(offset);
                let open_strip = self.open_strip;
                self.finish_block(
                    BlockKind::Comment,
                    content_end,
                    open_strip,
                    strip,
                    offset + 2,
                );
                Ok(())
            }
            BlockKind::RawText => {
                Err(self.error(ErrorKind::UnexpectedCommentEnd, offset))
            }
            // `#}` inside an expression/statement block is ordinary content
            _ => Ok(()),
        }
    }

    /// A close marker directly preceded by an unescaped quote belongs to a
    /// string literal and does not terminate the block
    fn quoted_close(&self, offset: usize) -> bool {
        let Some(prev) = self.source[..offset].chars().next_back() else {
            return false;
        };
        if prev != '\'' && prev != '"' {
            return false;
        }
        let backslashes = self.source[..offset - prev.len_utf8()]
            .chars()
            .rev()
            .take_while(|c| *c == '\\')
            .count();
        // An unescaped quote means the marker sits inside a string literal
        backslashes % 2 == 0
    }

    /// Consume an optional `-`/`+` after an open marker
    fn open_sigil(&self, after_marker: usize) -> (Strip, usize) {
        match self.source[after_marker..].chars().next() {
            Some('-') => (Strip::Minus, after_marker + 1),
            Some('+') => (Strip::Plus, after_marker + 1),
            _ => (Strip::Default, after_marker),
        }
    }

    /// Recognize an optional `-`/`+` directly before a close marker
    fn close_sigil(&self, marker_start: usize) -> (Strip, usize) {
        if marker_start > self.start {
            match self.source[..marker_start].chars().next_back() {
                Some('-') => return (Strip::Minus, marker_start - 1),
                Some('+') => return (Strip::Plus, marker_start - 1),
                _ => {}
            }
        }
        (Strip::Default, marker_start)
    }

    fn push(&mut self, kind: BlockKind, range: Range<usize>) {
        self.blocks.push(PendingBlock {
            kind,
            range,
            open_strip: Strip::Default,
            close_strip: Strip::Default,
        });
    }

    fn finish_block(
        &mut self,
        kind: BlockKind,
        content_end: usize,
        open_strip: Strip,
        close_strip: Strip,
        after_marker: usize,
    ) {
        self.blocks.push(PendingBlock {
            kind,
            range: self.start..content_end,
            open_strip,
            close_strip,
        });
        self.start = after_marker;
        self.kind = BlockKind::RawText;
        self.open_strip = Strip::Default;
    }

    fn finish(mut self) -> Result<Vec<TextBlock>, Error> {
        match self.kind {
            BlockKind::RawText | BlockKind::LineStatement => {
                let kind = self.kind.clone();
                let end = self.source.len();
                self.blocks.push(PendingBlock {
                    kind,
                    range: self.start..end,
                    open_strip: Strip::Default,
                    close_strip: Strip::Default,
                });
            }
            BlockKind::Expression | BlockKind::Statement
            | BlockKind::Comment => {
                let expected = match self.kind {
                    BlockKind::Expression => "}}",
                    BlockKind::Statement => "%}",
                    _ => "#}",
                };
                return Err(self.error(
                    ErrorKind::ExpectedToken {
                        actual: "<end of input>".into(),
                        expected: vec![expected.into()],
                    },
                    self.source.len(),
                ));
            }
        }
        Ok(self.apply_whitespace_control())
    }

    /// Apply the strip requests recorded on each marker to the adjacent
    /// raw-text blocks, plus the engine's `trim_blocks`/`lstrip_blocks`/
    /// `keep_trailing_newline` defaults
    fn apply_whitespace_control(self) -> Vec<TextBlock> {
        let source = self.source;
        let settings = self.settings;
        let mut result: Vec<TextBlock> = Vec::new();
        // Leading strip carried over from the previous block's close marker
        let mut pending: Option<Strip> = None;
        let mut pending_kind = BlockKind::RawText;

        for block in self.blocks {
            match block.kind {
                BlockKind::RawText => {
                    let mut range = block.range;
                    match pending.take() {
                        Some(Strip::Minus) => {
                            let text = &source[range.clone()];
                            let stripped =
                                text.trim_start_matches(is_space_or_newline);
                            range.start = range.end - stripped.len();
                        }
                        Some(Strip::Default)
                            if settings.trim_blocks
                                && trims_by_default(&pending_kind) =>
                        {
                            // Drop the single newline following the block
                            let text = &source[range.clone()];
                            if let Some(rest) = text.strip_prefix("\r\n") {
                                range.start = range.end - rest.len();
                            } else if let Some(rest) = text.strip_prefix('\n')
                            {
                                range.start = range.end - rest.len();
                            }
                        }
                        _ => {}
                    }
                    if !range.is_empty() {
                        result.push(TextBlock {
                            kind: BlockKind::RawText,
                            range,
                        });
                    }
                }
                kind => {
                    // First adjust the preceding raw text per the open
                    // marker
                    match block.open_strip {
                        Strip::Minus => strip_trailing(&mut result, source),
                        Strip::Default
                            if settings.lstrip_blocks
                                && trims_by_default(&kind) =>
                        {
                            lstrip_trailing(&mut result, source);
                        }
                        _ => {}
                    }
                    pending = Some(block.close_strip);
                    pending_kind = kind.clone();
                    result.push(TextBlock {
                        kind,
                        range: block.range,
                    });
                }
            }
        }

        if !settings.keep_trailing_newline
            && let Some(last) = result.last_mut()
            && last.kind == BlockKind::RawText
        {
            let text = &source[last.range.clone()];
            if let Some(stripped) = text.strip_suffix('\n') {
                let stripped = stripped.strip_suffix('\r').unwrap_or(stripped);
                last.range.end = last.range.start + stripped.len();
            }
            if last.range.is_empty() {
                result.pop();
            }
        }

        result
    }
}

/// The engine defaults (`trim_blocks`/`lstrip_blocks`) apply to statement
/// and comment markers, not expressions
fn trims_by_default(kind: &BlockKind) -> bool {
    matches!(kind, BlockKind::Statement | BlockKind::Comment)
}

fn is_space_or_newline(c: char) -> bool {
    c == ' ' || c == '\t' || c == '\r' || c == '\n'
}

/// Strip all trailing whitespace (including newlines) from the last raw
/// block
fn strip_trailing(result: &mut Vec<TextBlock>, source: &str) {
    if let Some(last) = result.last_mut()
        && last.kind == BlockKind::RawText
    {
        let text = &source[last.range.clone()];
        let stripped = text.trim_end_matches(is_space_or_newline);
        last.range.end = last.range.start + stripped.len();
        if last.range.is_empty() {
            result.pop();
        }
    }
}

/// Strip trailing horizontal whitespace back to the last newline, if the
/// tail of the raw block is whitespace-only since that newline
fn lstrip_trailing(result: &mut Vec<TextBlock>, source: &str) {
    if let Some(last) = result.last_mut()
        && last.kind == BlockKind::RawText
    {
        let text = &source[last.range.clone()];
        let stripped = text.trim_end_matches([' ', '\t']);
        if stripped.is_empty() || stripped.ends_with('\n') {
            last.range.end = last.range.start + stripped.len();
            if last.range.is_empty() {
                result.pop();
            }
        }
    }
}

/// Classify the block starting at `offset`: a line whose first
/// non-whitespace character is `#` is a line statement
fn initial_kind(source: &str, offset: usize) -> BlockKind {
    for c in source[offset..].chars() {
        match c {
            ' ' | '\t' | '\r' => {}
            '#' => {
                // `{#` is handled by the marker automaton; a lone `#`
                // starts a line statement
                return BlockKind::LineStatement;
            }
            _ => break,
        }
    }
    BlockKind::RawText
}
