//! The compiled renderer tree. Each node writes zero or more characters
//! into the output sink when executed against a render context; statement
//! nodes additionally manipulate the scope stack.

mod context;
mod statement;

pub use context::RenderContext;
pub(crate) use context::LoopInterrupt;
pub(crate) use statement::{
    AutoEscapeStatement, BlockStatement, CallStatement, DoStatement,
    FilterBlockStatement, ForStatement, FromImportStatement, IfStatement,
    ImportStatement, IncludeStatement, LoopCore, MacroStatement,
    SelfNamespace, SetBlockStatement, SetStatement, WithStatement,
};

use crate::{
    error::{Error, ErrorKind, SourceLocation},
    expression::Expression,
    value::write_value,
};
use std::{
    fmt::Write,
    ops::Range,
    sync::Arc,
};

/// A node of the compiled template
pub(crate) enum Renderer {
    /// A sequence of children rendered in order
    Composed(Vec<Renderer>),
    /// A byte range of the original source, emitted verbatim. The range
    /// already reflects whitespace control; the source buffer is shared
    /// with the owning template.
    RawText {
        source: Arc<str>,
        range: Range<usize>,
    },
    /// `{{ ... }}`: evaluate and stringify, honoring autoescape
    Expression(ExpressionRenderer),
    For(ForStatement),
    If(IfStatement),
    Set(SetStatement),
    SetBlock(SetBlockStatement),
    With(WithStatement),
    Macro(MacroStatement),
    Call(CallStatement),
    FilterBlock(FilterBlockStatement),
    /// Shared with the template's block table for inheritance resolution
    Block(Arc<BlockStatement>),
    Include(IncludeStatement),
    Import(ImportStatement),
    FromImport(FromImportStatement),
    Do(DoStatement),
    AutoEscape(AutoEscapeStatement),
    Break,
    Continue,
}

impl Renderer {
    pub fn render(
        &self,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        match self {
            Self::Composed(children) => {
                for child in children {
                    child.render(out, context)?;
                    // A break/continue signal aborts the rest of the
                    // sequence; the innermost loop consumes it
                    if context.interrupted() {
                        break;
                    }
                }
                Ok(())
            }
            Self::RawText { source, range } => out
                .write_str(&source[range.clone()])
                .map_err(|error| ErrorKind::exception(error).into_error()),
            Self::Expression(renderer) => renderer.render(out, context),
            Self::For(statement) => statement.render(out, context),
            Self::If(statement) => statement.render(out, context),
            Self::Set(statement) => statement.render(context),
            Self::SetBlock(statement) => statement.render(context),
            Self::With(statement) => statement.render(out, context),
            Self::Macro(statement) => statement.render(context),
            Self::Call(statement) => statement.render(out, context),
            Self::FilterBlock(statement) => statement.render(out, context),
            Self::Block(statement) => {
                BlockStatement::render(statement, out, context)
            }
            Self::Include(statement) => statement.render(out, context),
            Self::Import(statement) => statement.render(context),
            Self::FromImport(statement) => statement.render(context),
            Self::Do(statement) => statement.render(context),
            Self::AutoEscape(statement) => statement.render(out, context),
            Self::Break => {
                context.signal(LoopInterrupt::Break);
                Ok(())
            }
            Self::Continue => {
                context.signal(LoopInterrupt::Continue);
                Ok(())
            }
        }
    }

    /// Execute only the scope-building side of a template's top level:
    /// macro/set/import definitions run, output-producing nodes are
    /// skipped. Used when evaluating a template as a module (`import`) and
    /// for the non-root members of an `extends` chain.
    pub fn render_module(
        &self,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let Self::Composed(children) = self else {
            return Ok(());
        };
        let mut sink = String::new();
        for child in children {
            match child {
                Self::RawText { .. }
                | Self::Expression(_)
                | Self::Block(_) => {}
                other => other.render(&mut sink, context)?,
            }
        }
        Ok(())
    }
}

/// `{{ expression }}`
pub(crate) struct ExpressionRenderer {
    pub expression: Expression,
    pub location: SourceLocation,
}

impl ExpressionRenderer {
    fn render(
        &self,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let value = self
            .expression
            .evaluate(context)
            .map_err(|error| error.or_located_at(&self.location))?;
        write_value(out, &value, context.autoescape())
            .map_err(|error| ErrorKind::exception(error).into_error())
    }
}
