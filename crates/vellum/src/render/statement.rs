//! Statement renderers: one struct per statement kind, each owning its
//! parsed pieces and implementing the statement's semantics against the
//! render context.

use crate::{
    environment::Environment,
    error::{Error, ErrorKind, SourceLocation},
    expression::{
        self, CallParams, Expression, FilterCall,
    },
    filters,
    render::{LoopInterrupt, RenderContext, Renderer},
    template::{BlockFrame, CompiledTemplate, Inheritance},
    value::{
        ArgSpec, Callable, CallableKind, Map, MapProvider, ParamDefault,
        Str, Value, ValuesMap, write_value,
    },
};
use std::{
    fmt::Write,
    sync::{Arc, LazyLock},
};
use tracing::trace;

static EMPTY_VALUES: LazyLock<ValuesMap> = LazyLock::new(ValuesMap::new);

/// Unpack a loop/set target list from a single element. Multiple targets
/// require the element to be a sequence of at least that many items;
/// key-value pairs unpack to `(key, value)`.
fn unpack_targets(
    targets: &[String],
    value: Value,
    context: &mut RenderContext<'_>,
) -> Result<(), Error> {
    if let [single] = targets {
        context.set(single.clone(), value);
        return Ok(());
    }
    let items: Vec<Value> = match value {
        Value::KeyValuePair(pair) => {
            vec![Value::String(pair.key.clone().into()), pair.value]
        }
        Value::List(list) => list.to_vec(),
        other => {
            return Err(ErrorKind::invalid_type(format!(
                "cannot unpack '{}' into {} names",
                other.type_name(),
                targets.len()
            ))
            .into_error());
        }
    };
    if items.len() < targets.len() {
        return Err(ErrorKind::invalid_type(format!(
            "expected a sequence of at least {} items, got {}",
            targets.len(),
            items.len()
        ))
        .into_error());
    }
    for (target, item) in targets.iter().zip(items) {
        context.set(target.clone(), item);
    }
    Ok(())
}

/// The pieces of a `for` loop shared between the statement and the
/// `loop(...)` recursion callable
#[derive(Clone)]
pub(crate) struct LoopCore {
    pub targets: Vec<String>,
    pub condition: Option<Expression>,
    pub body: Arc<Renderer>,
    pub recursive: bool,
}

/// `{% for targets in expr [if cond] [recursive] %}...[{% else %}...]{% endfor %}`
pub(crate) struct ForStatement {
    pub core: LoopCore,
    pub iterable: Expression,
    pub else_body: Option<Arc<Renderer>>,
    pub location: SourceLocation,
}

impl ForStatement {
    pub fn render(
        &self,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let located = |error: Error| error.or_located_at(&self.location);
        let value = self.iterable.evaluate(context).map_err(located)?;
        let rendered = run_loop(&self.core, &value, 0, out, context)
            .map_err(located)?;
        if rendered == 0
            && let Some(else_body) = &self.else_body
        {
            else_body.render(out, context)?;
        }
        Ok(())
    }
}

/// Execute one level of a loop. Returns the number of iterations that ran
/// so the caller can decide on the `else` branch.
fn run_loop(
    core: &LoopCore,
    value: &Value,
    depth: usize,
    out: &mut dyn Write,
    context: &mut RenderContext<'_>,
) -> Result<usize, Error> {
    // Collect up-front: the loop map needs the length and lookahead for
    // `last`/`nextitem`
    let all: Vec<Value> = value.try_iterate()
        .map_err(ErrorKind::into_error)?
        .collect();

    // Apply the inline `if` filter with the loop targets bound, so the
    // condition can reference them
    let items = match &core.condition {
        None => all,
        Some(condition) => {
            let mut kept = Vec::with_capacity(all.len());
            for item in all {
                let keep = context.scoped(false, |context| {
                    unpack_targets(&core.targets, item.clone(), context)?;
                    Ok::<_, Error>(condition.evaluate(context)?.truthy())
                })?;
                if keep {
                    kept.push(item);
                }
            }
            kept
        }
    };

    let length = items.len();
    for (index, item) in items.iter().enumerate() {
        let stop = context.scoped(false, |context| {
            unpack_targets(&core.targets, item.clone(), context)?;
            let loop_map = loop_variable(core, &items, index, depth);
            context.set("loop", loop_map);
            core.body.render(out, context)?;
            Ok::<_, Error>(matches!(
                context.take_interrupt(),
                Some(LoopInterrupt::Break)
            ))
        })?;
        if stop {
            break;
        }
    }
    Ok(length)
}

/// Build the per-iteration `loop` variable: a fresh map every iteration so
/// closures capturing it observe the per-iteration values. For recursive
/// loops the value is callable, with the map reachable as attributes.
fn loop_variable(
    core: &LoopCore,
    items: &[Value],
    index: usize,
    depth: usize,
) -> Value {
    let length = items.len();
    let mut vars = ValuesMap::new();
    vars.insert("index".into(), Value::Int(index as i64 + 1));
    vars.insert("index0".into(), Value::Int(index as i64));
    vars.insert(
        "revindex".into(),
        Value::Int((length - index) as i64),
    );
    vars.insert(
        "revindex0".into(),
        Value::Int((length - index - 1) as i64),
    );
    vars.insert("first".into(), Value::Bool(index == 0));
    vars.insert("last".into(), Value::Bool(index + 1 == length));
    vars.insert("length".into(), Value::Int(length as i64));
    vars.insert(
        "previtem".into(),
        if index > 0 {
            items[index - 1].clone()
        } else {
            Value::Empty
        },
    );
    vars.insert(
        "nextitem".into(),
        items.get(index + 1).cloned().unwrap_or_default(),
    );
    vars.insert("depth".into(), Value::Int(depth as i64 + 1));
    vars.insert("depth0".into(), Value::Int(depth as i64));
    vars.insert("cycle".into(), cycle_callable(index).into());

    let map = Map::from_values(vars);
    if core.recursive {
        let core = core.clone();
        Callable::expression(CallableKind::SpecialFunc, move |args, context| {
            let Some(value) = args.positional.first() else {
                return Err(ErrorKind::invalid_type(
                    "recursive loop call takes the child sequence",
                )
                .into_error());
            };
            let mut buffer = String::new();
            run_loop(&core, value, depth + 1, &mut buffer, context)?;
            Ok(Value::safe_string(buffer))
        })
        .with_attrs(map)
        .into()
    } else {
        Value::Map(map)
    }
}

/// `loop.cycle(a, b, ...)`: pick the argument matching the current
/// iteration index
fn cycle_callable(index: usize) -> Callable {
    Callable::expression(CallableKind::SpecialFunc, move |args, _| {
        if args.positional.is_empty() {
            return Ok(Value::Empty);
        }
        Ok(args.positional[index % args.positional.len()].clone())
    })
}

/// `{% if %}` with its `elif`/`else` branches in order; the `else` branch
/// carries no condition
pub(crate) struct IfStatement {
    pub branches: Vec<(Option<Expression>, Renderer)>,
    pub location: SourceLocation,
}

impl IfStatement {
    pub fn render(
        &self,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        for (condition, body) in &self.branches {
            let take = match condition {
                Some(condition) => condition
                    .evaluate(context)
                    .map_err(|error| error.or_located_at(&self.location))?
                    .truthy(),
                None => true,
            };
            if take {
                return body.render(out, context);
            }
        }
        Ok(())
    }
}

/// `{% set a[, b...] = expr %}`
pub(crate) struct SetStatement {
    pub targets: Vec<String>,
    pub expression: Expression,
    pub location: SourceLocation,
}

impl SetStatement {
    pub fn render(
        &self,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let value = self
            .expression
            .evaluate(context)
            .map_err(|error| error.or_located_at(&self.location))?;
        unpack_targets(&self.targets, value, context)
            .map_err(|error| error.or_located_at(&self.location))
    }
}

/// Block form: `{% set name %}...{% endset %}`, rendering the body to a
/// string
pub(crate) struct SetBlockStatement {
    pub name: String,
    pub filters: Vec<FilterCall>,
    pub body: Arc<Renderer>,
    pub location: SourceLocation,
}

impl SetBlockStatement {
    pub fn render(
        &self,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let mut buffer = String::new();
        self.body.render(&mut buffer, context)?;
        let mut value = Value::String(Str::from(buffer));
        for call in &self.filters {
            value = filters::apply(call, value, context)
                .map_err(|error| error.or_located_at(&self.location))?;
        }
        context.set(self.name.clone(), value);
        Ok(())
    }
}

/// `{% with a = expr[, ...] %}`: names live for the body only
pub(crate) struct WithStatement {
    pub bindings: Vec<(String, Expression)>,
    pub body: Arc<Renderer>,
    pub location: SourceLocation,
}

impl WithStatement {
    pub fn render(
        &self,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        context.scoped(false, |context| {
            for (name, expression) in &self.bindings {
                let value = expression
                    .evaluate(context)
                    .map_err(|error| error.or_located_at(&self.location))?;
                context.set(name.clone(), value);
            }
            self.body.render(out, context)
        })
    }
}

/// `{% macro name(params) %}`: defines a callable in the current scope
pub(crate) struct MacroStatement {
    pub name: String,
    pub spec: Arc<ArgSpec>,
    pub body: Arc<Renderer>,
    pub location: SourceLocation,
}

impl MacroStatement {
    pub fn render(
        &self,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let callable = macro_callable(
            CallableKind::Macro,
            self.name.clone(),
            Arc::clone(&self.spec),
            Arc::clone(&self.body),
        );
        context.set(self.name.clone(), callable.into());
        Ok(())
    }
}

/// Build the callable for a macro (or the implicit `caller` of a call
/// block). The body renders behind a scope barrier: it sees its parameters
/// and template-level names but not the caller's locals.
pub(crate) fn macro_callable(
    kind: CallableKind,
    name: String,
    spec: Arc<ArgSpec>,
    body: Arc<Renderer>,
) -> Callable {
    let closure_spec = Arc::clone(&spec);
    Callable::statement(kind, move |args, out, context| {
        let mut args = args.clone();
        let caller = args.keyword.shift_remove("caller");
        let bound =
            expression::bind_call_args(&closure_spec, &args, context)?;
        context.scoped(true, |context| {
            for (param, value) in bound.named() {
                context.set(param.clone(), value.clone());
            }
            // Macro introspection specials
            context.set("name", Value::from(name.clone()));
            context.set(
                "arguments",
                Value::from(
                    closure_spec
                        .params()
                        .iter()
                        .map(|p| Value::from(p.name.clone()))
                        .collect::<Vec<_>>(),
                ),
            );
            context.set(
                "defaults",
                Value::from(
                    closure_spec
                        .params()
                        .iter()
                        .map(|p| match &p.default {
                            Some(ParamDefault::Const(value)) => value.clone(),
                            _ => Value::Empty,
                        })
                        .collect::<Vec<_>>(),
                ),
            );
            context.set("varargs", Value::from(bound.varargs.clone()));
            context.set("kwargs", Value::from(bound.kwargs.clone()));
            if let Some(caller) = caller {
                context.set("caller", caller);
            }
            body.render(out, context)
        })
    })
    .with_spec(spec)
}

/// `{% call [(params)] callee(args) %}body{% endcall %}`: invokes `callee`
/// with an implicit `caller` macro whose body is the call body
pub(crate) struct CallStatement {
    pub caller_spec: Arc<ArgSpec>,
    pub target: Expression,
    pub params: CallParams,
    pub body: Arc<Renderer>,
    pub location: SourceLocation,
}

impl CallStatement {
    pub fn render(
        &self,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let located = |error: Error| error.or_located_at(&self.location);
        let target = self.target.evaluate(context).map_err(located)?;
        let Value::Callable(callable) = target else {
            return Err(located(
                ErrorKind::invalid_type(format!(
                    "'{}' is not callable",
                    target.type_name()
                ))
                .into_error(),
            ));
        };
        let caller = macro_callable(
            CallableKind::SpecialFunc,
            "caller".into(),
            Arc::clone(&self.caller_spec),
            Arc::clone(&self.body),
        );
        let mut args = self.params.evaluate(context).map_err(located)?;
        args.keyword.insert("caller".into(), caller.into());
        callable.call_statement(&args, out, context).map_err(located)
    }
}

/// `{% filter name[|name...] %}body{% endfilter %}`
pub(crate) struct FilterBlockStatement {
    pub filters: Vec<FilterCall>,
    pub body: Arc<Renderer>,
    pub location: SourceLocation,
}

impl FilterBlockStatement {
    pub fn render(
        &self,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let mut buffer = String::new();
        self.body.render(&mut buffer, context)?;
        let mut value = Value::String(Str::from(buffer));
        for call in &self.filters {
            value = filters::apply(call, value, context)
                .map_err(|error| error.or_located_at(&self.location))?;
        }
        write_value(out, &value, context.autoescape())
            .map_err(|error| ErrorKind::exception(error).into_error())
    }
}

/// `{% block name [scoped] %}`. The struct is shared (via `Arc`) between
/// the renderer tree and the template's block table.
pub(crate) struct BlockStatement {
    pub name: String,
    pub scoped: bool,
    pub body: Arc<Renderer>,
    pub location: SourceLocation,
}

impl BlockStatement {
    pub fn render(
        this: &Arc<Self>,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        // The scope rule comes from the declaration site (`this`), even
        // when a derived template supplies the body: `scoped` on the
        // parent's block is what lets an override see the loop variables
        // around the declaration
        let barrier = !this.scoped;
        match &context.inheritance {
            // Not extending: the block renders its own body inline
            None => render_block_impl(this, usize::MAX, barrier, out, context),
            Some(inheritance) => {
                let Some((level, implementation)) =
                    inheritance.resolve(&this.name, usize::MAX)
                else {
                    return render_block_impl(
                        this,
                        usize::MAX,
                        barrier,
                        out,
                        context,
                    );
                };
                render_block_impl(
                    &implementation,
                    level,
                    barrier,
                    out,
                    context,
                )
            }
        }
    }
}

/// Render one implementation of a block. Pushes the (name, level) frame so
/// `super()` knows where it is in the ancestry; a non-scoped block runs
/// behind a scope barrier.
fn render_block_impl(
    block: &Arc<BlockStatement>,
    level: usize,
    barrier: bool,
    out: &mut dyn Write,
    context: &mut RenderContext<'_>,
) -> Result<(), Error> {
    if let Some(inheritance) = &mut context.inheritance {
        inheritance.stack.push(BlockFrame {
            name: block.name.clone(),
            level,
        });
    }
    let result = context.scoped(barrier, |context| {
        context.set("super", super_callable().into());
        block.body.render(out, context)
    });
    if let Some(inheritance) = &mut context.inheritance {
        inheritance.stack.pop();
    }
    result
}

/// `super()`: render the next implementation up the ancestry chain of the
/// block currently being rendered. The level strictly decreases, so the
/// same (template, block) pair is never revisited.
fn super_callable() -> Callable {
    Callable::expression(CallableKind::SpecialFunc, |_, context| {
        let Some(inheritance) = &context.inheritance else {
            return Err(ErrorKind::invalid_type(
                "'super' is only available inside an extended block",
            )
            .into_error());
        };
        let Some(frame) = inheritance.stack.last() else {
            return Err(ErrorKind::invalid_type(
                "'super' is only available inside a block",
            )
            .into_error());
        };
        let Some((level, implementation)) =
            inheritance.resolve(&frame.name, frame.level)
        else {
            return Err(ErrorKind::invalid_type(format!(
                "block '{}' has no parent implementation",
                frame.name
            ))
            .into_error());
        };
        let mut buffer = String::new();
        // No fresh barrier: the parent body renders with the visibility
        // the current block invocation already established
        render_block_impl(&implementation, level, false, &mut buffer, context)?;
        Ok(Value::safe_string(buffer))
    })
}

/// The `self` namespace bound while rendering an `extends` chain:
/// `self.X()` invokes the most-derived implementation of block `X`
pub(crate) struct SelfNamespace {
    names: Vec<String>,
}

impl SelfNamespace {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }
}

impl MapProvider for SelfNamespace {
    fn size(&self) -> usize {
        self.names.len()
    }

    fn contains(&self, key: &str) -> bool {
        self.names.iter().any(|name| name == key)
    }

    fn get(&self, key: &str) -> Option<Value> {
        if !self.contains(key) {
            return None;
        }
        let name = key.to_owned();
        Some(
            Callable::expression(CallableKind::SpecialFunc, move |_, context| {
                let Some(inheritance) = &context.inheritance else {
                    return Err(ErrorKind::invalid_type(
                        "'self' is only available inside an extended template",
                    )
                    .into_error());
                };
                let Some((level, implementation)) =
                    inheritance.resolve(&name, usize::MAX)
                else {
                    return Err(ErrorKind::invalid_type(format!(
                        "no block named '{name}'"
                    ))
                    .into_error());
                };
                let mut buffer = String::new();
                render_block_impl(
                    &implementation,
                    level,
                    !implementation.scoped,
                    &mut buffer,
                    context,
                )?;
                Ok(Value::safe_string(buffer))
            })
            .into(),
        )
    }

    fn keys(&self) -> Vec<String> {
        self.names.clone()
    }
}

/// `{% include expr [ignore missing] [with|without context] %}`
pub(crate) struct IncludeStatement {
    pub names: Expression,
    pub ignore_missing: bool,
    pub with_context: bool,
    pub location: SourceLocation,
}

impl IncludeStatement {
    pub fn render(
        &self,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let located = |error: Error| error.or_located_at(&self.location);
        let env = context.require_env().map_err(located)?;
        let value = self.names.evaluate(context).map_err(located)?;
        let candidates = template_name_list(&value).map_err(located)?;

        for name in &candidates {
            match env.load_compiled(name) {
                Ok(template) => {
                    trace!(name, "rendering included template");
                    return self
                        .render_included(&template, env, out, context)
                        .map_err(located);
                }
                Err(error) if is_not_found(&error) => continue,
                Err(error) => return Err(located(error)),
            }
        }
        if self.ignore_missing {
            Ok(())
        } else {
            Err(located(
                ErrorKind::TemplateNotFound {
                    name: candidates.join(", "),
                }
                .into_error(),
            ))
        }
    }

    fn render_included(
        &self,
        template: &Arc<CompiledTemplate>,
        env: &Environment,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        if self.with_context {
            context.scoped(false, |context| {
                template.render_with_context(out, context)
            })
        } else {
            let mut isolated = RenderContext::new(
                &EMPTY_VALUES,
                Some(env),
                context.autoescape(),
            );
            template.render_with_context(out, &mut isolated)
        }
    }
}

fn is_not_found(error: &Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::TemplateNotFound { .. } | ErrorKind::FileNotFound { .. }
    )
}

/// The target(s) of an include: a single name or a list tried in order
fn template_name_list(value: &Value) -> Result<Vec<String>, Error> {
    match value {
        Value::String(name) => Ok(vec![name.as_str().to_owned()]),
        Value::List(list) => list
            .iter()
            .map(|item| match item {
                Value::String(name) => Ok(name.as_str().to_owned()),
                other => Err(ErrorKind::InvalidTemplateName {
                    name: other.to_string(),
                }
                .into_error()),
            })
            .collect(),
        other => Err(ErrorKind::InvalidTemplateName {
            name: other.to_string(),
        }
        .into_error()),
    }
}

/// `{% import expr as name [with|without context] %}`
pub(crate) struct ImportStatement {
    pub name: Expression,
    pub alias: String,
    pub with_context: bool,
    pub location: SourceLocation,
}

impl ImportStatement {
    pub fn render(
        &self,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let located = |error: Error| error.or_located_at(&self.location);
        let namespace =
            load_module(&self.name, self.with_context, context)
                .map_err(located)?;
        context.set(self.alias.clone(), Value::Map(namespace));
        Ok(())
    }
}

/// `{% from expr import a[, b as c] [with|without context] %}`
pub(crate) struct FromImportStatement {
    pub name: Expression,
    /// (exported name, local alias)
    pub names: Vec<(String, String)>,
    pub with_context: bool,
    pub location: SourceLocation,
}

impl FromImportStatement {
    pub fn render(
        &self,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let located = |error: Error| error.or_located_at(&self.location);
        let namespace =
            load_module(&self.name, self.with_context, context)
                .map_err(located)?;
        for (exported, alias) in &self.names {
            let Some(value) = namespace.get(exported) else {
                return Err(located(
                    ErrorKind::invalid_type(format!(
                        "the imported template exports no '{exported}'"
                    ))
                    .into_error(),
                ));
            };
            context.set(alias.clone(), value);
        }
        Ok(())
    }
}

/// Load a template as a module: run its top-level definitions and expose
/// its macros and top-level sets as a namespace map
fn load_module(
    name: &Expression,
    with_context: bool,
    context: &mut RenderContext<'_>,
) -> Result<Map, Error> {
    let env = context.require_env()?;
    let value = name.evaluate(context)?;
    let Value::String(name) = value else {
        return Err(ErrorKind::InvalidTemplateName {
            name: value.to_string(),
        }
        .into_error());
    };
    let template = env.load_compiled(name.as_str())?;

    let external = if with_context {
        context.external()
    } else {
        &EMPTY_VALUES
    };
    let mut module_context =
        RenderContext::new(external, Some(env), context.autoescape());
    template.renderers.render_module(&mut module_context)?;
    let exports: ValuesMap = module_context
        .template_scope()
        .iter()
        .filter(|(key, _)| !key.starts_with('_'))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Ok(Map::from_values(exports))
}

/// `{% do expr %}`: side effects only
pub(crate) struct DoStatement {
    pub expression: Expression,
    pub location: SourceLocation,
}

impl DoStatement {
    pub fn render(
        &self,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        self.expression
            .evaluate(context)
            .map(drop)
            .map_err(|error| error.or_located_at(&self.location))
    }
}

/// `{% autoescape expr %}...{% endautoescape %}`
pub(crate) struct AutoEscapeStatement {
    pub enabled: Expression,
    pub body: Arc<Renderer>,
    pub location: SourceLocation,
}

impl AutoEscapeStatement {
    pub fn render(
        &self,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let enabled = self
            .enabled
            .evaluate(context)
            .map_err(|error| error.or_located_at(&self.location))?
            .truthy();
        let previous = context.set_autoescape(enabled);
        let result = self.body.render(out, context);
        context.set_autoescape(previous);
        result
    }
}
