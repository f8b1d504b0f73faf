//! Callable values: host-supplied functions, engine specials and template
//! macros, plus the argument schema and binding rules they share with the
//! filter catalog.

use crate::{
    error::{Error, ErrorKind},
    expression::Expression,
    render::RenderContext,
    value::{Value, ValuesMap, write_value},
};
use indexmap::IndexMap;
use std::{
    fmt::{self, Debug, Write},
    sync::Arc,
};

/// Where a callable came from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallableKind {
    /// A function registered globally (e.g. `range`)
    GlobalFunc,
    /// An engine-provided special (`super`, `caller`, `loop.cycle`)
    SpecialFunc,
    /// A template-defined macro
    Macro,
    /// A host-supplied function
    UserCallable,
}

/// Expression-form handler: produces a value
pub type ExpressionCallable = dyn Fn(&CallArgs, &mut RenderContext<'_>) -> Result<Value, Error>
    + Send
    + Sync;

/// Statement-form handler: writes directly into the output stream
pub type StatementCallable = dyn Fn(&CallArgs, &mut dyn Write, &mut RenderContext<'_>) -> Result<(), Error>
    + Send
    + Sync;

#[derive(Clone)]
enum CallableBody {
    Expression(Arc<ExpressionCallable>),
    Statement(Arc<StatementCallable>),
}

/// A callable template value. Cheap to clone; the handler is shared.
#[derive(Clone)]
pub struct Callable {
    kind: CallableKind,
    spec: Option<Arc<ArgSpec>>,
    body: CallableBody,
    /// Attributes reachable by subscript, for callables that double as
    /// namespaces (the recursive `loop` variable)
    attrs: Option<crate::value::Map>,
}

impl Callable {
    pub fn expression(
        kind: CallableKind,
        f: impl Fn(&CallArgs, &mut RenderContext<'_>) -> Result<Value, Error>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            kind,
            spec: None,
            body: CallableBody::Expression(Arc::new(f)),
            attrs: None,
        }
    }

    pub fn statement(
        kind: CallableKind,
        f: impl Fn(
            &CallArgs,
            &mut dyn Write,
            &mut RenderContext<'_>,
        ) -> Result<(), Error>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            kind,
            spec: None,
            body: CallableBody::Statement(Arc::new(f)),
            attrs: None,
        }
    }

    /// Attach the argument schema this callable was declared with
    #[must_use]
    pub fn with_spec(mut self, spec: Arc<ArgSpec>) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Attach an attribute namespace reachable by subscript
    #[must_use]
    pub fn with_attrs(mut self, attrs: crate::value::Map) -> Self {
        self.attrs = Some(attrs);
        self
    }

    /// Look up an attribute on this callable
    pub fn attr(&self, name: &str) -> Option<Value> {
        self.attrs.as_ref().and_then(|attrs| attrs.get(name))
    }

    pub fn kind(&self) -> CallableKind {
        self.kind
    }

    pub fn spec(&self) -> Option<&ArgSpec> {
        self.spec.as_deref()
    }

    /// Invoke in expression position. A statement-form callable renders
    /// into a buffer and yields its output as a safe string.
    pub fn call_expression(
        &self,
        args: &CallArgs,
        context: &mut RenderContext<'_>,
    ) -> Result<Value, Error> {
        match &self.body {
            CallableBody::Expression(f) => f(args, context),
            CallableBody::Statement(f) => {
                let mut buffer = String::new();
                f(args, &mut buffer, context)?;
                Ok(Value::safe_string(buffer))
            }
        }
    }

    /// Invoke in statement position, writing into the output stream
    pub fn call_statement(
        &self,
        args: &CallArgs,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        match &self.body {
            CallableBody::Statement(f) => f(args, out, context),
            CallableBody::Expression(f) => {
                let value = f(args, context)?;
                write_value(out, &value, context.autoescape())
                    .map_err(|error| ErrorKind::exception(error).into_error())
            }
        }
    }
}

impl Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Identity comparison: a callable is only equal to itself
impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        match (&self.body, &other.body) {
            (CallableBody::Expression(a), CallableBody::Expression(b)) => {
                Arc::ptr_eq(a, b)
            }
            (CallableBody::Statement(a), CallableBody::Statement(b)) => {
                Arc::ptr_eq(a, b)
            }
            _ => false,
        }
    }
}

impl From<Callable> for Value {
    fn from(callable: Callable) -> Self {
        Self::Callable(callable)
    }
}

/// Evaluated arguments handed to a callable
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    /// Kept in lexical order so error messages match what the user wrote
    pub keyword: ValuesMap,
}

impl CallArgs {
    pub fn positional(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            keyword: ValuesMap::new(),
        }
    }
}

/// A parameter's fallback when the call site doesn't supply it
#[derive(Clone, Debug)]
pub enum ParamDefault {
    Const(Value),
    /// Evaluated once per call, in the caller's context
    Expr(Arc<Expression>),
}

/// One declared parameter of a callable or filter
#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub mandatory: bool,
    /// A keyword-only parameter never absorbs positional arguments. Needed
    /// by filters like `map`, whose positional arguments all flow into
    /// `*args` while `attribute=`/`default=` stay keyword-addressed.
    pub keyword_only: bool,
    pub default: Option<ParamDefault>,
}

impl Param {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mandatory: true,
            keyword_only: false,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mandatory: false,
            keyword_only: false,
            default: None,
        }
    }

    pub fn keyword(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mandatory: false,
            keyword_only: true,
            default: None,
        }
    }

    pub fn with_default(
        name: impl Into<String>,
        default: impl Into<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            mandatory: false,
            keyword_only: false,
            default: Some(ParamDefault::Const(default.into())),
        }
    }

    pub fn with_default_expr(
        name: impl Into<String>,
        default: Expression,
    ) -> Self {
        Self {
            name: name.into(),
            mandatory: false,
            keyword_only: false,
            default: Some(ParamDefault::Expr(Arc::new(default))),
        }
    }
}

/// The argument schema of a callable: named parameters plus the reserved
/// `*args`/`**kwargs` collectors for extras
#[derive(Clone, Debug, Default)]
pub struct ArgSpec {
    params: Vec<Param>,
    accepts_args: bool,
    accepts_kwargs: bool,
}

impl ArgSpec {
    /// Build a spec from declared parameters. The reserved names `*args`
    /// and `**kwargs` enable the extra-argument collectors instead of
    /// declaring positional slots.
    pub fn new(params: impl IntoIterator<Item = Param>) -> Self {
        let mut spec = Self::default();
        for param in params {
            match param.name.as_str() {
                "*args" => spec.accepts_args = true,
                "**kwargs" => spec.accepts_kwargs = true,
                _ => spec.params.push(param),
            }
        }
        spec
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Bind call-site arguments against the schema. Keyword arguments are
    /// matched first; remaining positional arguments fill remaining slots
    /// in declaration order. Works over any argument payload so the parser
    /// can bind expressions at parse time and the evaluator can bind values
    /// at call time.
    pub fn bind<T>(
        &self,
        positional: Vec<T>,
        keyword: IndexMap<String, T>,
    ) -> Result<ArgBindings<T>, ErrorKind> {
        let mut named: IndexMap<String, Option<T>> = self
            .params
            .iter()
            .map(|param| (param.name.clone(), None))
            .collect();
        let mut kwargs = IndexMap::new();

        for (name, value) in keyword {
            if let Some(slot) = named.get_mut(&name) {
                *slot = Some(value);
            } else if self.accepts_kwargs {
                kwargs.insert(name, value);
            } else {
                return Err(ErrorKind::invalid_type(format!(
                    "unknown keyword argument '{name}'"
                )));
            }
        }

        let mut varargs = Vec::new();
        for value in positional {
            let open_slot = self
                .params
                .iter()
                .zip(named.values_mut())
                .find(|(param, slot)| {
                    !param.keyword_only && slot.is_none()
                })
                .map(|(_, slot)| slot);
            match open_slot {
                Some(slot) => *slot = Some(value),
                None if self.accepts_args => varargs.push(value),
                None => {
                    return Err(ErrorKind::invalid_type(
                        "too many arguments in call",
                    ));
                }
            }
        }

        for param in &self.params {
            if param.mandatory
                && param.default.is_none()
                && named[&param.name].is_none()
            {
                return Err(ErrorKind::invalid_type(format!(
                    "missing required argument '{}'",
                    param.name
                )));
            }
        }

        Ok(ArgBindings {
            named,
            varargs,
            kwargs,
        })
    }

    /// Look up a parameter's declared default
    pub fn default_of(&self, name: &str) -> Option<&ParamDefault> {
        self.params
            .iter()
            .find(|param| param.name == name)?
            .default
            .as_ref()
    }
}

/// The outcome of binding arguments against an [ArgSpec]
#[derive(Clone, Debug)]
pub struct ArgBindings<T> {
    /// One entry per declared parameter, in declaration order. `None`
    /// means the call site didn't supply it and the default applies.
    pub named: IndexMap<String, Option<T>>,
    /// Extra positional arguments captured by `*args`
    pub varargs: Vec<T>,
    /// Extra keyword arguments captured by `**kwargs`
    pub kwargs: IndexMap<String, T>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::indexmap;
    use rstest::rstest;
    use vellum_util::assert_err;

    fn spec() -> ArgSpec {
        ArgSpec::new([
            Param::required("a"),
            Param::with_default("b", 10),
        ])
    }

    #[test]
    fn test_bind_positional() {
        let bindings = spec().bind(vec![1, 2], IndexMap::new()).unwrap();
        assert_eq!(bindings.named["a"], Some(1));
        assert_eq!(bindings.named["b"], Some(2));
    }

    /// Keyword args bind first; positionals fill the remaining slots in
    /// declaration order
    #[test]
    fn test_bind_keyword_first() {
        let bindings = spec()
            .bind(vec![5], indexmap! {"a".to_owned() => 1})
            .unwrap();
        assert_eq!(bindings.named["a"], Some(1));
        assert_eq!(bindings.named["b"], Some(5));
    }

    #[test]
    fn test_bind_default_applies() {
        let bindings = spec().bind(vec![1], IndexMap::new()).unwrap();
        assert_eq!(bindings.named["b"], None);
    }

    #[rstest]
    #[case::missing_required(vec![], "missing required argument 'a'")]
    #[case::too_many(vec![1, 2, 3], "too many arguments")]
    fn test_bind_errors(#[case] positional: Vec<i64>, #[case] message: &str) {
        assert_err!(
            spec()
                .bind(positional, IndexMap::new())
                .map_err(ErrorKind::into_error),
            message
        );
    }

    #[test]
    fn test_bind_collectors() {
        let spec = ArgSpec::new([
            Param::required("a"),
            Param::optional("*args"),
            Param::optional("**kwargs"),
        ]);
        let bindings = spec
            .bind(vec![1, 2, 3], indexmap! {"extra".to_owned() => 4})
            .unwrap();
        assert_eq!(bindings.named["a"], Some(1));
        assert_eq!(bindings.varargs, vec![2, 3]);
        assert_eq!(bindings.kwargs, indexmap! {"extra".to_owned() => 4});
    }

    #[test]
    fn test_bind_unknown_keyword() {
        assert_err!(
            spec()
                .bind(vec![1], indexmap! {"zzz".to_owned() => 1})
                .map_err(ErrorKind::into_error),
            "unknown keyword argument 'zzz'"
        );
    }
}
