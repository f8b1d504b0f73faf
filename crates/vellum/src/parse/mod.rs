//! The template parser: drives the rough scan, tokenizes each
//! expression/statement block with the fine grammar and folds the blocks
//! into a composed renderer tree using a stack of statement frames.

pub(crate) mod expr;

use crate::{
    environment::{Extension, Settings},
    error::{Error, ErrorKind, SourceLocation, from_parse_error},
    expression::{CallParams, Expression, FilterCall},
    render::{
        AutoEscapeStatement, BlockStatement, CallStatement, DoStatement,
        ExpressionRenderer, FilterBlockStatement, ForStatement,
        FromImportStatement, IfStatement, ImportStatement,
        IncludeStatement, LoopCore, MacroStatement, Renderer,
        SetBlockStatement, SetStatement, WithStatement,
    },
    scan::{BlockKind, LineIndex, TextBlock, scan},
    template::CompiledTemplate,
    value::{ArgSpec, Param},
};
use indexmap::IndexMap;
use std::sync::Arc;
use winnow::{
    ModalResult, Parser,
    ascii::multispace0,
    combinator::{
        alt, cut_err, not, opt, preceded, repeat, separated, terminated,
    },
    error::ContextError,
};

use expr::{full_expression, identifier, keyword, or_expr, ws};

/// Compile template source into its executable form
pub(crate) fn compile(
    source: Arc<str>,
    name: &str,
    settings: &Settings,
) -> Result<CompiledTemplate, Error> {
    let blocks = scan(&source, name, settings)?;
    let parser = TemplateParser {
        source: Arc::clone(&source),
        name: name.to_owned(),
        settings: settings.clone(),
        lines: LineIndex::new(&source),
        frames: vec![Frame {
            data: FrameData::Root,
            current: Vec::new(),
            location: SourceLocation::new(name, 1, 1),
        }],
        blocks: IndexMap::new(),
        extends: None,
        meta: None,
    };
    parser.run(&blocks)
}

/// One open statement on the parse stack
struct Frame {
    data: FrameData,
    /// Renderers accumulated for the branch currently being filled
    current: Vec<Renderer>,
    /// Where the statement was opened, for unbalanced-block errors
    location: SourceLocation,
}

enum FrameData {
    Root,
    For {
        targets: Vec<String>,
        iterable: Expression,
        condition: Option<Expression>,
        recursive: bool,
        /// Filled when `{% else %}` is reached
        main: Option<Vec<Renderer>>,
    },
    If {
        /// Completed branches; the branch being filled lives in
        /// `Frame::current` with its condition below
        branches: Vec<(Option<Expression>, Renderer)>,
        condition: Option<Expression>,
        else_seen: bool,
    },
    SetBlock {
        name: String,
        filters: Vec<FilterCall>,
    },
    With {
        bindings: Vec<(String, Expression)>,
    },
    Macro {
        name: String,
        spec: Arc<ArgSpec>,
    },
    Call {
        caller_spec: Arc<ArgSpec>,
        target: Expression,
        params: CallParams,
    },
    FilterBlock {
        filters: Vec<FilterCall>,
    },
    Block {
        name: String,
        scoped: bool,
    },
    AutoEscape {
        enabled: Expression,
    },
    Meta {
        text: String,
    },
}

impl FrameData {
    /// The statement that closes this frame, for error messages
    fn closer(&self) -> &'static str {
        match self {
            Self::Root => "<end of template>",
            Self::For { .. } => "endfor",
            Self::If { .. } => "endif",
            Self::SetBlock { .. } => "endset",
            Self::With { .. } => "endwith",
            Self::Macro { .. } => "endmacro",
            Self::Call { .. } => "endcall",
            Self::FilterBlock { .. } => "endfilter",
            Self::Block { .. } => "endblock",
            Self::AutoEscape { .. } => "endautoescape",
            Self::Meta { .. } => "endmeta",
        }
    }
}

struct TemplateParser {
    source: Arc<str>,
    name: String,
    settings: Settings,
    lines: LineIndex,
    frames: Vec<Frame>,
    blocks: IndexMap<String, Arc<BlockStatement>>,
    extends: Option<(Expression, SourceLocation)>,
    meta: Option<String>,
}

impl TemplateParser {
    fn run(mut self, blocks: &[TextBlock]) -> Result<CompiledTemplate, Error> {
        let source = Arc::clone(&self.source);
        for block in blocks {
            match block.kind {
                BlockKind::RawText => self.on_raw_text(block)?,
                BlockKind::Expression => self.on_expression(block)?,
                BlockKind::Statement => {
                    let content = &source[block.range.clone()];
                    self.on_statement(content, block.range.start)?;
                }
                BlockKind::LineStatement => {
                    // The range covers the whole line; the statement is
                    // what follows the `#`
                    let content = &source[block.range.clone()];
                    let hash =
                        content.find('#').expect("line statement without #");
                    self.on_statement(
                        &content[hash + 1..],
                        block.range.start + hash + 1,
                    )?;
                }
                BlockKind::Comment => {}
            }
        }

        let frame = self.frames.pop().expect("frame stack is never empty");
        if !self.frames.is_empty() {
            return Err(ErrorKind::ExpectedToken {
                actual: "<end of template>".into(),
                expected: vec![frame.data.closer().into()],
            }
            .at(self.locate(self.source.len()))
            .with_related(frame.location));
        }

        Ok(CompiledTemplate {
            name: self.name,
            source: self.source,
            renderers: Renderer::Composed(frame.current),
            blocks: self.blocks,
            extends: self.extends,
            meta: self.meta,
        })
    }

    fn locate(&self, offset: usize) -> SourceLocation {
        self.lines.locate(&self.name, offset)
    }

    fn append(&mut self, renderer: Renderer) {
        self.frames
            .last_mut()
            .expect("frame stack is never empty")
            .current
            .push(renderer);
    }

    fn on_raw_text(&mut self, block: &TextBlock) -> Result<(), Error> {
        let frame = self.frames.last_mut().expect("frame stack");
        if let FrameData::Meta { text } = &mut frame.data {
            text.push_str(&self.source[block.range.clone()]);
            return Ok(());
        }
        self.append(Renderer::RawText {
            source: Arc::clone(&self.source),
            range: block.range.clone(),
        });
        Ok(())
    }

    fn on_expression(&mut self, block: &TextBlock) -> Result<(), Error> {
        if matches!(
            self.frames.last().expect("frame stack").data,
            FrameData::Meta { .. }
        ) {
            return Err(ErrorKind::UnexpectedExprBegin
                .at(self.locate(block.range.start)));
        }
        let content = &self.source[block.range.clone()];
        let expression =
            expr::parse_expression(content).map_err(|(offset, kind)| {
                kind.at(self.locate(block.range.start + offset))
            })?;
        let location = self.locate(block.range.start);
        self.append(Renderer::Expression(ExpressionRenderer {
            expression,
            location,
        }));
        Ok(())
    }

    fn on_statement(
        &mut self,
        content: &str,
        offset: usize,
    ) -> Result<(), Error> {
        let trimmed = content.trim_start();
        let leading = content.len() - trimmed.len();
        let word_len = trimmed
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(trimmed.len());
        let (word, rest) = trimmed.split_at(word_len);
        // Offset of `rest` within the template source, for error locations
        let rest_offset = offset + leading + word_len;
        let location = self.locate(offset + leading);

        if word.is_empty() {
            return Err(ErrorKind::ExpectedIdentifier.at(location));
        }
        if matches!(
            self.frames.last().expect("frame stack").data,
            FrameData::Meta { .. }
        ) && word != "endmeta"
        {
            return Err(ErrorKind::UnexpectedStatement {
                statement: word.to_owned(),
            }
            .at(location));
        }

        match word {
            "for" => self.open_for(rest, rest_offset, location),
            "if" => self.open_if(rest, rest_offset, location),
            "elif" => self.on_elif(rest, rest_offset, location),
            "else" => self.on_else(location),
            "endif" => self.close_if(location),
            "endfor" => self.close_for(location),
            "set" => self.open_set(rest, rest_offset, location),
            "endset" => self.close_set(location),
            "with" => self.open_with(rest, rest_offset, location),
            "endwith" => self.close_with(location),
            "macro" => self.open_macro(rest, rest_offset, location),
            "endmacro" => self.close_macro(location),
            "call" => self.open_call(rest, rest_offset, location),
            "endcall" => self.close_call(location),
            "filter" => self.open_filter(rest, rest_offset, location),
            "endfilter" => self.close_filter(location),
            "block" => self.open_block(rest, rest_offset, location),
            "endblock" => self.close_block(rest, location),
            "extends" => self.on_extends(rest, rest_offset, location),
            "include" => self.on_include(rest, rest_offset, location),
            "import" => self.on_import(rest, rest_offset, location),
            "from" => self.on_from(rest, rest_offset, location),
            "do" => self.on_do(rest, rest_offset, location),
            "break" | "continue" => self.on_loop_control(word, location),
            "autoescape" => {
                self.open_autoescape(rest, rest_offset, location)
            }
            "endautoescape" => self.close_autoescape(location),
            "meta" => self.open_meta(rest, location),
            "endmeta" => self.close_meta(location),
            other => Err(ErrorKind::UnexpectedStatement {
                statement: other.to_owned(),
            }
            .at(location)),
        }
    }

    /// Run a winnow parser over the remainder of a statement, mapping
    /// failures to located errors. Trailing whitespace before the close
    /// marker is tolerated.
    fn parse_rest<'i, T>(
        &self,
        parser: impl winnow::ModalParser<&'i str, T, ContextError>,
        rest: &'i str,
        rest_offset: usize,
    ) -> Result<T, Error> {
        run_parser(terminated(parser, multispace0), rest).map_err(
            |(offset, kind)| kind.at(self.locate(rest_offset + offset)),
        )
    }

    fn open_frame(&mut self, data: FrameData, location: SourceLocation) {
        self.frames.push(Frame {
            data,
            current: Vec::new(),
            location,
        });
    }

    /// Pop the top frame if `matches` accepts it; otherwise report the
    /// closing statement as unexpected, pointing back at the open frame
    fn close_frame(
        &mut self,
        closer: &str,
        location: &SourceLocation,
        accepts: impl Fn(&FrameData) -> bool,
    ) -> Result<Frame, Error> {
        let top = self.frames.last().expect("frame stack");
        if matches!(top.data, FrameData::Root) || !accepts(&top.data) {
            return Err(ErrorKind::UnexpectedStatement {
                statement: closer.to_owned(),
            }
            .at(location.clone())
            .with_related(top.location.clone()));
        }
        Ok(self.frames.pop().expect("frame stack"))
    }

    fn open_for(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let (targets, iterable, condition, recursive) = self.parse_rest(
            (
                ws(separated(1.., identifier.map(str::to_owned), ws(','))),
                preceded(keyword("in"), cut_err(or_expr)),
                opt(preceded(ws(keyword("if")), cut_err(or_expr))),
                opt(ws(keyword("recursive"))).map(|r| r.is_some()),
            ),
            rest,
            rest_offset,
        )?;
        self.open_frame(
            FrameData::For {
                targets,
                iterable,
                condition,
                recursive,
                main: None,
            },
            location,
        );
        Ok(())
    }

    fn close_for(&mut self, location: SourceLocation) -> Result<(), Error> {
        let frame = self.close_frame("endfor", &location, |data| {
            matches!(data, FrameData::For { .. })
        })?;
        let FrameData::For {
            targets,
            iterable,
            condition,
            recursive,
            main,
        } = frame.data
        else {
            unreachable!()
        };
        let (body, else_body) = match main {
            Some(main) => (main, Some(frame.current)),
            None => (frame.current, None),
        };
        self.append(Renderer::For(ForStatement {
            core: LoopCore {
                targets,
                condition,
                body: Arc::new(Renderer::Composed(body)),
                recursive,
            },
            iterable,
            else_body: else_body
                .map(|body| Arc::new(Renderer::Composed(body))),
            location: frame.location,
        }));
        Ok(())
    }

    fn open_if(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let condition =
            self.parse_rest(ws(full_expression), rest, rest_offset)?;
        self.open_frame(
            FrameData::If {
                branches: Vec::new(),
                condition: Some(condition),
                else_seen: false,
            },
            location,
        );
        Ok(())
    }

    fn on_elif(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let next_condition =
            self.parse_rest(ws(full_expression), rest, rest_offset)?;
        let frame = self.frames.last_mut().expect("frame stack");
        let FrameData::If {
            branches,
            condition,
            else_seen,
        } = &mut frame.data
        else {
            return Err(ErrorKind::UnexpectedStatement {
                statement: "elif".into(),
            }
            .at(location));
        };
        if *else_seen {
            return Err(ErrorKind::UnexpectedStatement {
                statement: "elif".into(),
            }
            .at(location)
            .with_related(frame.location.clone()));
        }
        let finished = std::mem::take(&mut frame.current);
        branches
            .push((condition.take(), Renderer::Composed(finished)));
        *condition = Some(next_condition);
        Ok(())
    }

    /// `else` belongs to the innermost `if` or `for`
    fn on_else(&mut self, location: SourceLocation) -> Result<(), Error> {
        let frame = self.frames.last_mut().expect("frame stack");
        match &mut frame.data {
            FrameData::If {
                branches,
                condition,
                else_seen,
            } => {
                if *else_seen {
                    return Err(ErrorKind::UnexpectedStatement {
                        statement: "else".into(),
                    }
                    .at(location)
                    .with_related(frame.location.clone()));
                }
                let finished = std::mem::take(&mut frame.current);
                branches
                    .push((condition.take(), Renderer::Composed(finished)));
                *else_seen = true;
                Ok(())
            }
            FrameData::For { main, .. } => {
                if main.is_some() {
                    return Err(ErrorKind::UnexpectedStatement {
                        statement: "else".into(),
                    }
                    .at(location)
                    .with_related(frame.location.clone()));
                }
                *main = Some(std::mem::take(&mut frame.current));
                Ok(())
            }
            _ => Err(ErrorKind::UnexpectedStatement {
                statement: "else".into(),
            }
            .at(location)),
        }
    }

    fn close_if(&mut self, location: SourceLocation) -> Result<(), Error> {
        let frame = self.close_frame("endif", &location, |data| {
            matches!(data, FrameData::If { .. })
        })?;
        let FrameData::If {
            mut branches,
            condition,
            else_seen,
        } = frame.data
        else {
            unreachable!()
        };
        let last_condition = if else_seen { None } else { condition };
        branches.push((last_condition, Renderer::Composed(frame.current)));
        self.append(Renderer::If(IfStatement {
            branches,
            location: frame.location,
        }));
        Ok(())
    }

    /// `set a[, b] = expr` inline, or `set name[|filters] %}...{% endset`
    fn open_set(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        enum SetForm {
            Inline(Vec<String>, Expression),
            Block(String, Vec<FilterCall>),
        }

        let form = self.parse_rest(
            alt((
                (
                    ws(separated(
                        1..,
                        identifier.map(str::to_owned),
                        ws(','),
                    )),
                    preceded(
                        terminated('=', not('=')),
                        cut_err(full_expression),
                    ),
                )
                    .map(|(targets, expr)| SetForm::Inline(targets, expr)),
                (
                    ws(identifier.map(str::to_owned)),
                    repeat(
                        0..,
                        preceded(ws('|'), cut_err(expr::filter_call)),
                    ),
                )
                    .map(|(name, filters)| SetForm::Block(name, filters)),
            )),
            rest,
            rest_offset,
        )?;
        match form {
            SetForm::Inline(targets, expression) => {
                self.append(Renderer::Set(SetStatement {
                    targets,
                    expression,
                    location,
                }));
            }
            SetForm::Block(name, filters) => {
                self.open_frame(
                    FrameData::SetBlock { name, filters },
                    location,
                );
            }
        }
        Ok(())
    }

    fn close_set(&mut self, location: SourceLocation) -> Result<(), Error> {
        let frame = self.close_frame("endset", &location, |data| {
            matches!(data, FrameData::SetBlock { .. })
        })?;
        let FrameData::SetBlock { name, filters } = frame.data else {
            unreachable!()
        };
        self.append(Renderer::SetBlock(SetBlockStatement {
            name,
            filters,
            body: Arc::new(Renderer::Composed(frame.current)),
            location: frame.location,
        }));
        Ok(())
    }

    fn open_with(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let bindings = self.parse_rest(
            ws(separated(
                1..,
                (
                    ws(identifier.map(str::to_owned)),
                    preceded('=', cut_err(full_expression)),
                ),
                ws(','),
            )),
            rest,
            rest_offset,
        )?;
        self.open_frame(FrameData::With { bindings }, location);
        Ok(())
    }

    fn close_with(&mut self, location: SourceLocation) -> Result<(), Error> {
        let frame = self.close_frame("endwith", &location, |data| {
            matches!(data, FrameData::With { .. })
        })?;
        let FrameData::With { bindings } = frame.data else {
            unreachable!()
        };
        self.append(Renderer::With(WithStatement {
            bindings,
            body: Arc::new(Renderer::Composed(frame.current)),
            location: frame.location,
        }));
        Ok(())
    }

    fn open_macro(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let (name, params) = self.parse_rest(
            (ws(identifier.map(str::to_owned)), macro_params),
            rest,
            rest_offset,
        )?;
        self.open_frame(
            FrameData::Macro {
                name,
                spec: Arc::new(macro_spec(params)),
            },
            location,
        );
        Ok(())
    }

    fn close_macro(&mut self, location: SourceLocation) -> Result<(), Error> {
        let frame = self.close_frame("endmacro", &location, |data| {
            matches!(data, FrameData::Macro { .. })
        })?;
        let FrameData::Macro { name, spec } = frame.data else {
            unreachable!()
        };
        self.append(Renderer::Macro(MacroStatement {
            name,
            spec,
            body: Arc::new(Renderer::Composed(frame.current)),
            location: frame.location,
        }));
        Ok(())
    }

    /// `call [(params)] callee(args)`
    fn open_call(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let (params, target) = self.parse_rest(
            (opt(macro_params), ws(full_expression)),
            rest,
            rest_offset,
        )?;
        let Expression::Call { callee, params: args } = target else {
            return Err(ErrorKind::ExpectedToken {
                actual: "expression".into(),
                expected: vec!["a call".into()],
            }
            .at(location));
        };
        self.open_frame(
            FrameData::Call {
                caller_spec: Arc::new(macro_spec(
                    params.unwrap_or_default(),
                )),
                target: *callee,
                params: args,
            },
            location,
        );
        Ok(())
    }

    fn close_call(&mut self, location: SourceLocation) -> Result<(), Error> {
        let frame = self.close_frame("endcall", &location, |data| {
            matches!(data, FrameData::Call { .. })
        })?;
        let FrameData::Call {
            caller_spec,
            target,
            params,
        } = frame.data
        else {
            unreachable!()
        };
        self.append(Renderer::Call(CallStatement {
            caller_spec,
            target,
            params,
            body: Arc::new(Renderer::Composed(frame.current)),
            location: frame.location,
        }));
        Ok(())
    }

    fn open_filter(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let filters = self.parse_rest(
            ws(separated(1.., expr::filter_call, ws('|'))),
            rest,
            rest_offset,
        )?;
        self.open_frame(FrameData::FilterBlock { filters }, location);
        Ok(())
    }

    fn close_filter(
        &mut self,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let frame = self.close_frame("endfilter", &location, |data| {
            matches!(data, FrameData::FilterBlock { .. })
        })?;
        let FrameData::FilterBlock { filters } = frame.data else {
            unreachable!()
        };
        self.append(Renderer::FilterBlock(FilterBlockStatement {
            filters,
            body: Arc::new(Renderer::Composed(frame.current)),
            location: frame.location,
        }));
        Ok(())
    }

    fn open_block(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let (name, scoped) = self.parse_rest(
            (
                ws(identifier.map(str::to_owned)),
                opt(ws(keyword("scoped"))).map(|s| s.is_some()),
            ),
            rest,
            rest_offset,
        )?;
        if let Some(existing) = self.blocks.get(&name) {
            return Err(ErrorKind::UnexpectedToken {
                token: name.clone(),
            }
            .at(location)
            .with_related(existing.location.clone()));
        }
        self.open_frame(FrameData::Block { name, scoped }, location);
        Ok(())
    }

    /// `endblock` optionally repeats the block name
    fn close_block(
        &mut self,
        rest: &str,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let frame = self.close_frame("endblock", &location, |data| {
            matches!(data, FrameData::Block { .. })
        })?;
        let FrameData::Block { name, scoped } = frame.data else {
            unreachable!()
        };
        let trailing = rest.trim();
        if !trailing.is_empty() && trailing != name {
            return Err(ErrorKind::ExpectedToken {
                actual: trailing.to_owned(),
                expected: vec![name],
            }
            .at(location)
            .with_related(frame.location));
        }
        let statement = Arc::new(BlockStatement {
            name: name.clone(),
            scoped,
            body: Arc::new(Renderer::Composed(frame.current)),
            location: frame.location,
        });
        self.blocks.insert(name, Arc::clone(&statement));
        self.append(Renderer::Block(statement));
        Ok(())
    }

    fn on_extends(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        if self.frames.len() > 1 {
            return Err(ErrorKind::UnexpectedStatement {
                statement: "extends".into(),
            }
            .at(location));
        }
        if let Some((_, existing)) = &self.extends {
            return Err(ErrorKind::UnexpectedStatement {
                statement: "extends".into(),
            }
            .at(location)
            .with_related(existing.clone()));
        }
        let parent =
            self.parse_rest(ws(full_expression), rest, rest_offset)?;
        self.extends = Some((parent, location));
        Ok(())
    }

    fn on_include(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let (names, ignore_missing, with_context) = self.parse_rest(
            (
                ws(full_expression),
                opt((keyword("ignore"), ws(keyword("missing"))))
                    .map(|o| o.is_some()),
                context_flag,
            ),
            rest,
            rest_offset,
        )?;
        self.append(Renderer::Include(IncludeStatement {
            names,
            ignore_missing,
            with_context: with_context.unwrap_or(true),
            location,
        }));
        Ok(())
    }

    fn on_import(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let (name, alias, with_context) = self.parse_rest(
            (
                ws(full_expression),
                preceded(
                    keyword("as"),
                    cut_err(ws(identifier.map(str::to_owned))),
                ),
                context_flag,
            ),
            rest,
            rest_offset,
        )?;
        self.append(Renderer::Import(ImportStatement {
            name,
            alias,
            with_context: with_context.unwrap_or(false),
            location,
        }));
        Ok(())
    }

    fn on_from(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let (name, names, with_context) = self.parse_rest(
            (
                ws(full_expression),
                preceded(
                    keyword("import"),
                    cut_err(ws(separated::<_, _, Vec<(String, Option<String>)>, _, _, _, _>(
                        1..,
                        (
                            ws(identifier.map(str::to_owned)),
                            opt(preceded(
                                keyword("as"),
                                cut_err(ws(
                                    identifier.map(str::to_owned)
                                )),
                            )),
                        ),
                        ws(','),
                    ))),
                ),
                context_flag,
            ),
            rest,
            rest_offset,
        )?;
        let names = names
            .into_iter()
            .map(|(exported, alias): (String, Option<String>)| {
                let alias = alias.unwrap_or_else(|| exported.clone());
                (exported, alias)
            })
            .collect();
        self.append(Renderer::FromImport(FromImportStatement {
            name,
            names,
            with_context: with_context.unwrap_or(false),
            location,
        }));
        Ok(())
    }

    fn on_do(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        if !self.settings.do_extension {
            return Err(ErrorKind::ExtensionDisabled {
                extension: Extension::Do.name().to_owned(),
            }
            .at(location));
        }
        let expression =
            self.parse_rest(ws(full_expression), rest, rest_offset)?;
        self.append(Renderer::Do(DoStatement {
            expression,
            location,
        }));
        Ok(())
    }

    fn on_loop_control(
        &mut self,
        word: &str,
        location: SourceLocation,
    ) -> Result<(), Error> {
        if !self.settings.loop_controls {
            return Err(ErrorKind::ExtensionDisabled {
                extension: Extension::LoopControls.name().to_owned(),
            }
            .at(location));
        }
        let inside_loop = self
            .frames
            .iter()
            .any(|frame| matches!(frame.data, FrameData::For { .. }));
        if !inside_loop {
            return Err(ErrorKind::UnexpectedStatement {
                statement: word.to_owned(),
            }
            .at(location));
        }
        self.append(if word == "break" {
            Renderer::Break
        } else {
            Renderer::Continue
        });
        Ok(())
    }

    fn open_autoescape(
        &mut self,
        rest: &str,
        rest_offset: usize,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let enabled =
            self.parse_rest(ws(full_expression), rest, rest_offset)?;
        self.open_frame(FrameData::AutoEscape { enabled }, location);
        Ok(())
    }

    fn close_autoescape(
        &mut self,
        location: SourceLocation,
    ) -> Result<(), Error> {
        let frame = self.close_frame("endautoescape", &location, |data| {
            matches!(data, FrameData::AutoEscape { .. })
        })?;
        let FrameData::AutoEscape { enabled } = frame.data else {
            unreachable!()
        };
        self.append(Renderer::AutoEscape(AutoEscapeStatement {
            enabled,
            body: Arc::new(Renderer::Composed(frame.current)),
            location: frame.location,
        }));
        Ok(())
    }

    fn open_meta(
        &mut self,
        rest: &str,
        location: SourceLocation,
    ) -> Result<(), Error> {
        if !rest.trim().is_empty() {
            return Err(ErrorKind::ExpectedEndOfStatement {
                actual: rest.trim().to_owned(),
            }
            .at(location));
        }
        if self.meta.is_some() {
            return Err(ErrorKind::UnexpectedStatement {
                statement: "meta".into(),
            }
            .at(location));
        }
        self.open_frame(
            FrameData::Meta {
                text: String::new(),
            },
            location,
        );
        Ok(())
    }

    fn close_meta(&mut self, location: SourceLocation) -> Result<(), Error> {
        let frame = self.close_frame("endmeta", &location, |data| {
            matches!(data, FrameData::Meta { .. })
        })?;
        let FrameData::Meta { text } = frame.data else {
            unreachable!()
        };
        self.meta = Some(text);
        Ok(())
    }
}

/// `with context` / `without context`, shared by include/import
fn context_flag(input: &mut &str) -> ModalResult<Option<bool>> {
    opt(alt((
        (keyword("with"), ws(keyword("context"))).value(true),
        (keyword("without"), ws(keyword("context"))).value(false),
    )))
    .parse_next(input)
}

/// Macro/call parameter declarations: `(a, b=expr, ...)`
fn macro_params(input: &mut &str) -> ModalResult<Vec<Param>> {
    fn param(input: &mut &str) -> ModalResult<Param> {
        let name = ws(identifier).parse_next(input)?;
        let default = opt(preceded(
            terminated('=', not('=')),
            cut_err(full_expression),
        ))
        .parse_next(input)?;
        Ok(match default {
            Some(default) => Param::with_default_expr(name, default),
            None => Param::required(name),
        })
    }

    preceded(
        '(',
        cut_err(terminated(
            ws(terminated(separated(0.., param, ws(',')), opt(ws(',')))),
            ')',
        )),
    )
    .parse_next(input)
}

/// Macros implicitly collect extra arguments into `varargs`/`kwargs`
fn macro_spec(mut params: Vec<Param>) -> ArgSpec {
    params.push(Param::optional("*args"));
    params.push(Param::optional("**kwargs"));
    ArgSpec::new(params)
}

/// Run a winnow parser over statement content, returning the failure
/// offset and structured kind
fn run_parser<'i, T>(
    mut parser: impl winnow::ModalParser<&'i str, T, ContextError>,
    content: &'i str,
) -> Result<T, (usize, ErrorKind)> {
    parser
        .parse(content)
        .map_err(|error| (error.offset(), from_parse_error(&error)))
}
