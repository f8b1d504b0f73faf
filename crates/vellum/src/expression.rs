//! The expression tree and its evaluator. Expressions are pure: evaluating
//! one yields a [Value] and never writes to the output stream. A single
//! algebraic type covers every node kind so the evaluator and the parser
//! stay exhaustive under `match`.

use crate::{
    error::{Error, ErrorKind},
    filters, testers,
    render::RenderContext,
    value::{
        self, ArgBindings, ArgSpec, CallArgs, List, Map, ParamDefault, Value,
        ValuesMap,
    },
};
use derive_more::Display;
use indexmap::IndexMap;

/// A dynamic piece of a template, evaluated against the render context
#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
    /// A literal value such as `3`, `false`, or `'hello'`
    Constant(Value),
    /// Name lookup through the scope stack
    ValueRef(String),
    /// `x.y` / `x[i]`; the attribute form desugars to a constant string
    /// subscript
    Subscript {
        value: Box<Expression>,
        index: Box<Expression>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    /// `(a, b)`: evaluates to a list
    Tuple(Vec<Expression>),
    /// `[a, b]`
    ListLiteral(Vec<Expression>),
    /// `{'a': 1, b: 2}`; keys are fixed strings per the grammar
    DictLiteral(Vec<(String, Expression)>),
    /// `a if cond else b`; a missing `else` yields `Empty`
    IfExpr {
        then: Box<Expression>,
        condition: Box<Expression>,
        otherwise: Option<Box<Expression>>,
    },
    /// `base | name(args)`
    Filter {
        base: Box<Expression>,
        call: FilterCall,
    },
    /// `base is [not] name(args)`
    Test {
        base: Box<Expression>,
        call: TesterCall,
        negated: bool,
    },
    /// `callee(args)` for macros, globals and user callables
    Call {
        callee: Box<Expression>,
        params: CallParams,
    },
}

impl Expression {
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    /// Evaluate the expression to a value
    pub fn evaluate(
        &self,
        context: &mut RenderContext<'_>,
    ) -> Result<Value, Error> {
        match self {
            Self::Constant(value) => Ok(value.clone()),
            Self::ValueRef(name) => {
                Ok(context.lookup(name).unwrap_or_default())
            }
            Self::Subscript { value, index } => {
                let value = value.evaluate(context)?;
                let index = index.evaluate(context)?;
                value::subscript(&value, &index)
                    .map_err(ErrorKind::into_error)
            }
            Self::Unary { op, expr } => {
                let value = expr.evaluate(context)?;
                value::unary(*op, &value).map_err(ErrorKind::into_error)
            }
            Self::Binary { op, lhs, rhs } => {
                self.evaluate_binary(*op, lhs, rhs, context)
            }
            Self::Tuple(items) | Self::ListLiteral(items) => {
                let values: Vec<Value> = items
                    .iter()
                    .map(|item| item.evaluate(context))
                    .collect::<Result<_, _>>()?;
                Ok(Value::List(List::from_values(values)))
            }
            Self::DictLiteral(entries) => {
                let mut values = ValuesMap::new();
                for (key, expr) in entries {
                    values.insert(key.clone(), expr.evaluate(context)?);
                }
                Ok(Value::Map(Map::from_values(values)))
            }
            Self::IfExpr {
                then,
                condition,
                otherwise,
            } => {
                if condition.evaluate(context)?.truthy() {
                    then.evaluate(context)
                } else {
                    otherwise
                        .as_ref()
                        .map_or(Ok(Value::Empty), |e| e.evaluate(context))
                }
            }
            Self::Filter { base, call } => {
                let base = base.evaluate(context)?;
                filters::apply(call, base, context)
            }
            Self::Test {
                base,
                call,
                negated,
            } => {
                let base = base.evaluate(context)?;
                let result = testers::apply(call, &base, context)?;
                Ok(Value::Bool(result != *negated))
            }
            Self::Call { callee, params } => {
                let target = callee.evaluate(context)?;
                let Value::Callable(callable) = target else {
                    return Err(ErrorKind::invalid_type(format!(
                        "'{}' is not callable",
                        target.type_name()
                    ))
                    .into_error());
                };
                let args = params.evaluate(context)?;
                callable.call_expression(&args, context)
            }
        }
    }

    fn evaluate_binary(
        &self,
        op: BinaryOp,
        lhs: &Expression,
        rhs: &Expression,
        context: &mut RenderContext<'_>,
    ) -> Result<Value, Error> {
        // Short-circuit operators evaluate only as much as needed, and
        // yield the deciding operand like Python does
        match op {
            BinaryOp::And => {
                let left = lhs.evaluate(context)?;
                if left.truthy() {
                    rhs.evaluate(context)
                } else {
                    Ok(left)
                }
            }
            BinaryOp::Or => {
                let left = lhs.evaluate(context)?;
                if left.truthy() {
                    Ok(left)
                } else {
                    rhs.evaluate(context)
                }
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let left = lhs.evaluate(context)?;
                let right = rhs.evaluate(context)?;
                let equal = left == right;
                Ok(Value::Bool(equal == (op == BinaryOp::Eq)))
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let left = lhs.evaluate(context)?;
                let right = rhs.evaluate(context)?;
                let Some(ordering) = value::compare(&left, &right) else {
                    return Err(ErrorKind::invalid_type(format!(
                        "cannot order '{}' and '{}'",
                        left.type_name(),
                        right.type_name()
                    ))
                    .into_error());
                };
                let result = match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    BinaryOp::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
            BinaryOp::In | BinaryOp::NotIn => {
                let left = lhs.evaluate(context)?;
                let right = rhs.evaluate(context)?;
                let found = value::contains(&right, &left)
                    .map_err(ErrorKind::into_error)?;
                Ok(Value::Bool(found == (op == BinaryOp::In)))
            }
            _ => {
                let left = lhs.evaluate(context)?;
                let right = rhs.evaluate(context)?;
                value::arithmetic(op, &left, &right)
                    .map_err(ErrorKind::into_error)
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum UnaryOp {
    #[display("not")]
    Not,
    #[display("-")]
    Neg,
    #[display("+")]
    Pos,
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum BinaryOp {
    #[display("or")]
    Or,
    #[display("and")]
    And,
    #[display("==")]
    Eq,
    #[display("!=")]
    Ne,
    #[display("<")]
    Lt,
    #[display(">")]
    Gt,
    #[display("<=")]
    Le,
    #[display(">=")]
    Ge,
    #[display("in")]
    In,
    #[display("not in")]
    NotIn,
    #[display("~")]
    Concat,
    #[display("+")]
    Add,
    #[display("-")]
    Sub,
    #[display("*")]
    Mul,
    #[display("/")]
    Div,
    #[display("//")]
    FloorDiv,
    #[display("%")]
    Mod,
    #[display("**")]
    Pow,
}

/// Raw call-site arguments, before binding against a schema
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallParams {
    pub positional: Vec<Expression>,
    /// Must preserve lexical order so evaluation order matches it
    pub keyword: IndexMap<String, Expression>,
}

impl CallParams {
    /// Evaluate every argument, positionals first, keywords in lexical
    /// order
    pub fn evaluate(
        &self,
        context: &mut RenderContext<'_>,
    ) -> Result<CallArgs, Error> {
        let positional = self
            .positional
            .iter()
            .map(|expr| expr.evaluate(context))
            .collect::<Result<_, _>>()?;
        let mut keyword = ValuesMap::new();
        for (name, expr) in &self.keyword {
            keyword.insert(name.clone(), expr.evaluate(context)?);
        }
        Ok(CallArgs {
            positional,
            keyword,
        })
    }
}

/// A filter invocation with its arguments already bound against the
/// filter's schema (binding errors are parse errors)
#[derive(Clone, Debug, PartialEq)]
pub struct FilterCall {
    pub name: String,
    pub bindings: ArgBindings<Expression>,
}

impl PartialEq for ArgBindings<Expression> {
    fn eq(&self, other: &Self) -> bool {
        self.named == other.named
            && self.varargs == other.varargs
            && self.kwargs == other.kwargs
    }
}

impl FilterCall {
    /// Bind call arguments against the named filter's schema. Fails on an
    /// unknown filter name or a binding mismatch.
    pub fn new(name: String, params: CallParams) -> Result<Self, ErrorKind> {
        let Some(def) = filters::lookup(&name) else {
            return Err(ErrorKind::UnexpectedToken { token: name });
        };
        let bindings =
            def.spec.bind(params.positional, params.keyword)?;
        Ok(Self { name, bindings })
    }
}

/// A tester invocation, bound like a filter
#[derive(Clone, Debug, PartialEq)]
pub struct TesterCall {
    pub name: String,
    pub bindings: ArgBindings<Expression>,
}

impl TesterCall {
    pub fn new(name: String, params: CallParams) -> Result<Self, ErrorKind> {
        let Some(def) = testers::lookup(&name) else {
            return Err(ErrorKind::UnexpectedToken { token: name });
        };
        let bindings =
            def.spec.bind(params.positional, params.keyword)?;
        Ok(Self { name, bindings })
    }
}

/// Arguments to a filter or tester after evaluation, one slot per declared
/// parameter
#[derive(Debug)]
pub struct EvaluatedArgs {
    named: ValuesMap,
    pub varargs: Vec<Value>,
    pub kwargs: ValuesMap,
}

impl EvaluatedArgs {
    /// Argument value by parameter name. Parameters the call site omitted
    /// hold their default, or `Empty` if none was declared.
    pub fn get(&self, name: &str) -> &Value {
        static EMPTY: Value = Value::Empty;
        self.named.get(name).unwrap_or(&EMPTY)
    }

    /// All named arguments in declaration order
    pub fn named(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.named.iter()
    }
}

/// Evaluate parse-time bindings into concrete argument values, applying
/// declared defaults for omitted parameters. Defaults are evaluated once
/// per call.
pub(crate) fn evaluate_bindings(
    spec: &ArgSpec,
    bindings: &ArgBindings<Expression>,
    context: &mut RenderContext<'_>,
) -> Result<EvaluatedArgs, Error> {
    let mut named = ValuesMap::new();
    for (name, bound) in &bindings.named {
        let value = match bound {
            Some(expr) => expr.evaluate(context)?,
            None => evaluate_default(spec, name, context)?,
        };
        named.insert(name.clone(), value);
    }
    let varargs = bindings
        .varargs
        .iter()
        .map(|expr| expr.evaluate(context))
        .collect::<Result<_, _>>()?;
    let mut kwargs = ValuesMap::new();
    for (name, expr) in &bindings.kwargs {
        kwargs.insert(name.clone(), expr.evaluate(context)?);
    }
    Ok(EvaluatedArgs {
        named,
        varargs,
        kwargs,
    })
}

/// Bind already-evaluated call arguments (a macro or user-callable
/// invocation) against a schema, with defaults for omitted parameters
pub(crate) fn bind_call_args(
    spec: &ArgSpec,
    args: &CallArgs,
    context: &mut RenderContext<'_>,
) -> Result<EvaluatedArgs, Error> {
    let bindings = spec
        .bind(args.positional.clone(), args.keyword.clone())
        .map_err(ErrorKind::into_error)?;
    let mut named = ValuesMap::new();
    for (name, bound) in bindings.named {
        let value = match bound {
            Some(value) => value,
            None => evaluate_default(spec, &name, context)?,
        };
        named.insert(name, value);
    }
    Ok(EvaluatedArgs {
        named,
        varargs: bindings.varargs,
        kwargs: bindings.kwargs,
    })
}

fn evaluate_default(
    spec: &ArgSpec,
    name: &str,
    context: &mut RenderContext<'_>,
) -> Result<Value, Error> {
    match spec.default_of(name) {
        Some(ParamDefault::Const(value)) => Ok(value.clone()),
        Some(ParamDefault::Expr(expr)) => expr.evaluate(context),
        None => Ok(Value::Empty),
    }
}
