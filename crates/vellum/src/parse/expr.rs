//! The expression grammar: recursive descent with one parser function per
//! precedence level. Filters and `is` tests bind at the postfix level,
//! tighter than any binary operator, so `-30 | abs < '20' | int` compares
//! the two filtered operands.

use crate::{
    error::{ErrorKind, from_parse_error},
    expression::{
        BinaryOp, CallParams, Expression, FilterCall, TesterCall, UnaryOp,
    },
    value::Value,
};
use indexmap::IndexMap;
use winnow::{
    ModalParser, ModalResult, Parser,
    ascii::multispace0,
    combinator::{
        alt, cut_err, delimited, fail, not, opt, preceded, repeat,
        separated, terminated,
    },
    error::{ContextError, StrContext, StrContextValue},
    stream::AsChar,
    token::{any, one_of, take_till, take_while},
};

/// Words that can never be referenced as plain variables. Includes the
/// statement keywords so a stray `endfor` inside an expression reads as a
/// syntax error rather than an undefined name.
const RESERVED: &[&str] = &[
    "for", "endfor", "in", "if", "elif", "else", "endif", "or", "and",
    "not", "is", "block", "endblock", "extends", "macro", "endmacro",
    "call", "endcall", "filter", "endfilter", "set", "endset", "include",
    "import", "from", "as", "with", "endwith", "without", "context",
    "scoped", "recursive", "ignore", "missing", "do", "meta", "endmeta",
    "break", "continue", "autoescape", "endautoescape", "true", "True",
    "false", "False", "none", "None",
];

/// Parse a complete expression block's content
pub(crate) fn parse_expression(
    content: &str,
) -> Result<Expression, (usize, ErrorKind)> {
    ws(full_expression)
        .parse(content)
        .map_err(|error| (error.offset(), from_parse_error(&error)))
}

/// The entry rule: a ternary conditional over the boolean grammar.
/// A missing `else` leg yields `Empty` when the condition is false.
pub(crate) fn full_expression(input: &mut &str) -> ModalResult<Expression> {
    let then = or_expr
        .context(ctx_expected("expression"))
        .parse_next(input)?;
    let condition =
        opt(preceded(ws(keyword("if")), cut_err(or_expr))).parse_next(input)?;
    match condition {
        None => Ok(then),
        Some(condition) => {
            let otherwise = opt(preceded(
                ws(keyword("else")),
                cut_err(full_expression),
            ))
            .parse_next(input)?;
            Ok(Expression::IfExpr {
                then: Box::new(then),
                condition: Box::new(condition),
                otherwise: otherwise.map(Box::new),
            })
        }
    }
}

/// The boolean grammar without the trailing ternary. Statement parsers use
/// this where a bare `if` follows the expression (`{% for x in xs if cond %}`).
pub(crate) fn or_expr(input: &mut &str) -> ModalResult<Expression> {
    let first = and_expr.parse_next(input)?;
    let rest: Vec<Expression> =
        repeat(0.., preceded(ws(keyword("or")), cut_err(and_expr)))
            .parse_next(input)?;
    Ok(fold_binary(first, BinaryOp::Or, rest))
}

fn and_expr(input: &mut &str) -> ModalResult<Expression> {
    let first = not_expr.parse_next(input)?;
    let rest: Vec<Expression> =
        repeat(0.., preceded(ws(keyword("and")), cut_err(not_expr)))
            .parse_next(input)?;
    Ok(fold_binary(first, BinaryOp::And, rest))
}

fn not_expr(input: &mut &str) -> ModalResult<Expression> {
    alt((
        preceded(ws(keyword("not")), cut_err(not_expr)).map(|expr| {
            Expression::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            }
        }),
        comparison,
    ))
    .parse_next(input)
}

/// A single (non-chaining) comparison
fn comparison(input: &mut &str) -> ModalResult<Expression> {
    let lhs = concat_expr.parse_next(input)?;
    let op = opt(ws(comparison_op)).parse_next(input)?;
    match op {
        None => Ok(lhs),
        Some(op) => {
            let rhs = cut_err(concat_expr)
                .context(ctx_expected("expression"))
                .parse_next(input)?;
            Ok(Expression::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            })
        }
    }
}

fn comparison_op(input: &mut &str) -> ModalResult<BinaryOp> {
    alt((
        "==".value(BinaryOp::Eq),
        "!=".value(BinaryOp::Ne),
        "<=".value(BinaryOp::Le),
        ">=".value(BinaryOp::Ge),
        "<".value(BinaryOp::Lt),
        ">".value(BinaryOp::Gt),
        keyword("in").value(BinaryOp::In),
        (keyword("not"), multispace0, keyword("in"))
            .value(BinaryOp::NotIn),
    ))
    .parse_next(input)
}

/// String concatenation: `a ~ b`
fn concat_expr(input: &mut &str) -> ModalResult<Expression> {
    let first = add_expr.parse_next(input)?;
    let rest: Vec<Expression> =
        repeat(0.., preceded(ws('~'), cut_err(add_expr))).parse_next(input)?;
    Ok(fold_binary(first, BinaryOp::Concat, rest))
}

fn add_expr(input: &mut &str) -> ModalResult<Expression> {
    let first = mul_expr.parse_next(input)?;
    let rest: Vec<(BinaryOp, Expression)> = repeat(
        0..,
        (
            ws(alt(('+'.value(BinaryOp::Add), '-'.value(BinaryOp::Sub)))),
            cut_err(mul_expr),
        ),
    )
    .parse_next(input)?;
    Ok(fold_binary_ops(first, rest))
}

fn mul_expr(input: &mut &str) -> ModalResult<Expression> {
    let first = pow_expr.parse_next(input)?;
    let rest: Vec<(BinaryOp, Expression)> = repeat(
        0..,
        (
            ws(alt((
                "//".value(BinaryOp::FloorDiv),
                '/'.value(BinaryOp::Div),
                // A lone `*`; `**` belongs to the power level
                terminated('*', not('*')).value(BinaryOp::Mul),
                '%'.value(BinaryOp::Mod),
            ))),
            cut_err(pow_expr),
        ),
    )
    .parse_next(input)?;
    Ok(fold_binary_ops(first, rest))
}

/// Right-associative exponentiation
fn pow_expr(input: &mut &str) -> ModalResult<Expression> {
    let base = unary_expr.parse_next(input)?;
    let exponent =
        opt(preceded(ws("**"), cut_err(pow_expr))).parse_next(input)?;
    Ok(match exponent {
        None => base,
        Some(exponent) => Expression::Binary {
            op: BinaryOp::Pow,
            lhs: Box::new(base),
            rhs: Box::new(exponent),
        },
    })
}

/// Unary sign, then filters/tests. The sign applies before the filters:
/// `-30 | abs` negates first, then filters.
fn unary_expr(input: &mut &str) -> ModalResult<Expression> {
    let base = signed_expr.parse_next(input)?;
    postfix_filters(base, input)
}

fn signed_expr(input: &mut &str) -> ModalResult<Expression> {
    alt((
        preceded(ws('-'), cut_err(signed_expr)).map(|expr| {
            Expression::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            }
        }),
        preceded(ws('+'), cut_err(signed_expr)).map(|expr| {
            Expression::Unary {
                op: UnaryOp::Pos,
                expr: Box::new(expr),
            }
        }),
        postfix_expr,
    ))
    .parse_next(input)
}

/// `base | filter | filter is test`: pipes repeat, a test closes the chain
fn postfix_filters(
    base: Expression,
    input: &mut &str,
) -> ModalResult<Expression> {
    let filters: Vec<FilterCall> =
        repeat(0.., preceded(ws('|'), cut_err(filter_call)))
            .parse_next(input)?;
    let mut expression = filters.into_iter().fold(base, |acc, call| {
        Expression::Filter {
            base: Box::new(acc),
            call,
        }
    });
    if let Some((negated, call)) = opt(preceded(
        ws(keyword("is")),
        cut_err((opt(terminated(keyword("not"), multispace0)), tester_call)),
    ))
    .parse_next(input)?
    {
        expression = Expression::Test {
            base: Box::new(expression),
            call,
            negated: negated.is_some(),
        };
    }
    Ok(expression)
}

/// `name` or `name(args)` after a pipe. Unknown names and argument
/// mismatches are fatal parse errors.
pub(crate) fn filter_call(input: &mut &str) -> ModalResult<FilterCall> {
    (raw_identifier, opt(call_arguments))
        .try_map(|(name, params)| {
            FilterCall::new(name.to_owned(), params.unwrap_or_default())
        })
        .context(ctx_label("filter"))
        .parse_next(input)
}

/// `name` or `name(args)` after `is`. Tester names may be words that are
/// otherwise reserved (`in`, `none`, `true`).
fn tester_call(input: &mut &str) -> ModalResult<TesterCall> {
    (raw_identifier, opt(call_arguments))
        .try_map(|(name, params)| {
            TesterCall::new(name.to_owned(), params.unwrap_or_default())
        })
        .context(ctx_label("tester"))
        .parse_next(input)
}

/// Subscripts and calls: `x.y`, `x[i]`, `f(args)`
fn postfix_expr(input: &mut &str) -> ModalResult<Expression> {
    enum Postfix {
        Attribute(String),
        Index(Expression),
        Call(CallParams),
    }

    let base = ws(primary).parse_next(input)?;
    let postfixes: Vec<Postfix> = repeat(
        0..,
        alt((
            preceded(('.', multispace0), cut_err(identifier))
                .map(|name| Postfix::Attribute(name.to_owned())),
            delimited(
                '[',
                cut_err(ws(full_expression)),
                cut_err(']'.context(ctx_expected_char(']'))),
            )
            .map(Postfix::Index),
            call_arguments.map(Postfix::Call),
        )),
    )
    .parse_next(input)?;

    Ok(postfixes.into_iter().fold(base, |acc, postfix| match postfix {
        Postfix::Attribute(name) => Expression::Subscript {
            value: Box::new(acc),
            index: Box::new(Expression::constant(name)),
        },
        Postfix::Index(index) => Expression::Subscript {
            value: Box::new(acc),
            index: Box::new(index),
        },
        Postfix::Call(params) => Expression::Call {
            callee: Box::new(acc),
            params,
        },
    }))
}

fn primary(input: &mut &str) -> ModalResult<Expression> {
    alt((
        number,
        string_literal.map(Expression::constant),
        paren_or_tuple,
        list_literal,
        dict_literal,
        word_expression,
        fail.context(ctx_expected("expression")),
    ))
    .parse_next(input)
}

/// A bare word: a literal keyword (`true`, `none`), a reserved word
/// (backtracks) or a variable reference
fn word_expression(input: &mut &str) -> ModalResult<Expression> {
    let word = raw_identifier.parse_next(input)?;
    match word {
        "true" | "True" => Ok(Expression::constant(true)),
        "false" | "False" => Ok(Expression::constant(false)),
        "none" | "None" => Ok(Expression::Constant(Value::Empty)),
        word if RESERVED.contains(&word) => fail.parse_next(input),
        word => Ok(Expression::ValueRef(word.to_owned())),
    }
}

/// `(a)` is a parenthesized scalar; `()`, `(a,)` and `(a, b)` are tuples
fn paren_or_tuple(input: &mut &str) -> ModalResult<Expression> {
    preceded(
        '(',
        cut_err(terminated(
            (
                ws(separated(0.., full_expression, ws(','))),
                opt(ws(',')),
            ),
            ')'.context(ctx_expected_char(')')),
        )),
    )
    .map(|(mut items, trailing_comma): (Vec<Expression>, Option<char>)| {
        if items.len() == 1 && trailing_comma.is_none() {
            items.pop().unwrap()
        } else {
            Expression::Tuple(items)
        }
    })
    .context(ctx_label("tuple"))
    .parse_next(input)
}

fn list_literal(input: &mut &str) -> ModalResult<Expression> {
    delimited_list('[', full_expression, ']')
        .map(Expression::ListLiteral)
        .context(ctx_label("list"))
        .parse_next(input)
}

/// `{'a': 1, b = 2}`: keys are strings or identifiers, `:` and `=` are
/// both accepted as the separator
fn dict_literal(input: &mut &str) -> ModalResult<Expression> {
    fn entry(input: &mut &str) -> ModalResult<(String, Expression)> {
        (
            ws(alt((string_value, identifier.map(str::to_owned)))),
            preceded(
                alt((':'.void(), terminated('=', not('=')).void())),
                cut_err(full_expression),
            ),
        )
            .parse_next(input)
    }

    delimited_list('{', entry, '}')
        .map(Expression::DictLiteral)
        .context(ctx_label("dict"))
        .parse_next(input)
}

/// Parse a call argument list: `(expr, name=expr, ...)`
pub(crate) fn call_arguments(input: &mut &str) -> ModalResult<CallParams> {
    enum Argument {
        Position(Expression),
        Keyword(String, Expression),
    }

    fn argument(input: &mut &str) -> ModalResult<Argument> {
        alt((
            // Try the kwarg form first because it's more specific; `a == b`
            // must not parse as a kwarg named `a`
            (
                identifier,
                ws(terminated('=', not('='))),
                full_expression,
            )
                .map(|(name, _, value)| {
                    Argument::Keyword(name.to_owned(), value)
                }),
            full_expression.map(Argument::Position),
        ))
        .parse_next(input)
    }

    let arguments: Vec<Argument> =
        delimited_list('(', argument, ')').parse_next(input)?;

    let mut positional = Vec::new();
    let mut keyword: IndexMap<String, Expression> = IndexMap::new();
    for argument in arguments {
        match argument {
            Argument::Position(expression) => {
                if !keyword.is_empty() {
                    return cut_with(
                        input,
                        ErrorKind::ExpectedToken {
                            actual: "positional argument".into(),
                            expected: vec!["keyword argument".into()],
                        },
                    );
                }
                positional.push(expression);
            }
            Argument::Keyword(name, expression) => {
                if keyword.contains_key(&name) {
                    return cut_with(
                        input,
                        ErrorKind::UnexpectedToken { token: name },
                    );
                }
                keyword.insert(name, expression);
            }
        }
    }
    Ok(CallParams {
        positional,
        keyword,
    })
}

/// Integer or float literal. Integers accept `_` separators; values that
/// overflow a signed 64-bit integer promote to a double.
fn number(input: &mut &str) -> ModalResult<Expression> {
    let text = (
        digits,
        opt(preceded('.', digits)),
        opt((one_of(['e', 'E']), opt(one_of(['+', '-'])), digits)),
    )
        .take()
        .parse_next(input)?;
    boundary(input)?;

    let cleaned = text.replace('_', "");
    let is_float = text.contains(['.', 'e', 'E']);
    if is_float {
        let value: f64 = cleaned.parse().map_err(|_| {
            winnow::error::ErrMode::Backtrack(ContextError::new())
        })?;
        Ok(Expression::constant(Value::Double(value)))
    } else {
        match cleaned.parse::<i64>() {
            Ok(value) => Ok(Expression::constant(Value::Int(value))),
            // Integer overflow: keep the tens-interpreted value as a double
            Err(_) => {
                let value: f64 = cleaned.parse().map_err(|_| {
                    winnow::error::ErrMode::Backtrack(ContextError::new())
                })?;
                Ok(Expression::constant(Value::Double(value)))
            }
        }
    }
}

fn digits<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    (
        one_of(AsChar::is_dec_digit),
        take_while(0.., |c: char| c.is_ascii_digit() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// A quoted string literal as a [Value]
fn string_literal(input: &mut &str) -> ModalResult<Value> {
    string_value.map(Value::from).parse_next(input)
}

/// Single- or double-quoted string. C-style escapes for `\n \r \t \\ \' \"`
/// are decoded; any other `\x` sequence is preserved verbatim.
pub(crate) fn string_value(input: &mut &str) -> ModalResult<String> {
    alt((quoted('\''), quoted('"')))
        .context(ctx_label("string literal"))
        .parse_next(input)
}

fn quoted<'a>(
    quote: char,
) -> impl ModalParser<&'a str, String, ContextError> {
    enum Fragment<'f> {
        Text(&'f str),
        Escape(char),
    }

    let fragment = alt((
        take_till(1.., move |c| c == quote || c == '\\').map(Fragment::Text),
        preceded('\\', any).map(Fragment::Escape),
    ));

    preceded(
        quote,
        // The open quote is unambiguous; an unterminated literal is fatal
        cut_err(terminated(
            repeat(0.., fragment).fold(String::new, move |mut acc, frag| {
                match frag {
                    Fragment::Text(text) => acc.push_str(text),
                    Fragment::Escape('n') => acc.push('\n'),
                    Fragment::Escape('r') => acc.push('\r'),
                    Fragment::Escape('t') => acc.push('\t'),
                    Fragment::Escape(c)
                        if c == '\\' || c == '\'' || c == '"' =>
                    {
                        acc.push(c);
                    }
                    Fragment::Escape(other) => {
                        // Unknown escapes keep their backslash
                        acc.push('\\');
                        acc.push(other);
                    }
                }
                acc
            }),
            quote.context(ctx_expected_char(quote)),
        )),
    )
}

/// An identifier that is not a reserved word
pub(crate) fn identifier<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    let word = raw_identifier
        .context(ctx_label("identifier"))
        .parse_next(input)?;
    if RESERVED.contains(&word) {
        fail.context(ctx_label("identifier")).parse_next(input)
    } else {
        Ok(word)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, reserved or not
pub(crate) fn raw_identifier<'a>(
    input: &mut &'a str,
) -> ModalResult<&'a str> {
    (
        one_of(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Match a keyword with a word boundary, so `information` never matches
/// `in`
pub(crate) fn keyword<'a>(
    word: &'static str,
) -> impl ModalParser<&'a str, &'a str, ContextError> {
    terminated(
        word,
        not(one_of(|c: char| c.is_ascii_alphanumeric() || c == '_')),
    )
}

/// Wrap a parser to allow whitespace on either side of it
pub(crate) fn ws<'a, O, F>(
    parser: F,
) -> impl ModalParser<&'a str, O, ContextError>
where
    F: ModalParser<&'a str, O, ContextError>,
{
    delimited(multispace0, parser, multispace0)
}

/// Detect the end of a token without consuming input, so `1user` isn't a
/// number followed by lingering garbage
fn boundary(input: &mut &str) -> ModalResult<()> {
    match input.chars().next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {
            cut_err(fail).context(ctx_expected("end of token")).parse_next(input)
        }
        _ => Ok(()),
    }
}

/// Create a parser for a comma-separated list with bounding delimiters.
/// Supports an optional trailing comma and whitespace around each element.
fn delimited_list<'a, O, F>(
    open: char,
    parser: F,
    close: char,
) -> impl ModalParser<&'a str, Vec<O>, ContextError>
where
    F: ModalParser<&'a str, O, ContextError>,
{
    preceded(
        open,
        // Delimiters are unambiguous, so once we see the open any error is
        // fatal
        cut_err(terminated(
            ws(terminated(
                separated(0.., parser, ws(',')),
                opt(ws(',')),
            )),
            close.context(ctx_expected_char(close)),
        )),
    )
}

fn ctx_label(label: &'static str) -> StrContext {
    StrContext::Label(label)
}

/// Abort parsing with a structured error kind. The kind travels through
/// winnow as an external cause and resurfaces unchanged in the load error.
fn cut_with<T>(input: &mut &str, kind: ErrorKind) -> ModalResult<T> {
    use winnow::error::{ErrMode, FromExternalError};
    Err(ErrMode::Cut(ContextError::from_external_error(input, kind)))
}

fn ctx_expected(expected: &'static str) -> StrContext {
    StrContext::Expected(StrContextValue::Description(expected))
}

fn ctx_expected_char(expected: char) -> StrContext {
    StrContext::Expected(StrContextValue::CharLiteral(expected))
}

fn fold_binary(
    first: Expression,
    op: BinaryOp,
    rest: Vec<Expression>,
) -> Expression {
    rest.into_iter().fold(first, |lhs, rhs| Expression::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

fn fold_binary_ops(
    first: Expression,
    rest: Vec<(BinaryOp, Expression)>,
) -> Expression {
    rest.into_iter().fold(first, |lhs, (op, rhs)| Expression::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use vellum_util::assert_err;

    fn parse(input: &str) -> Expression {
        parse_expression(input)
            .unwrap_or_else(|(offset, kind)| {
                panic!("parse failed at {offset}: {kind}")
            })
    }

    fn constant(value: impl Into<Value>) -> Expression {
        Expression::constant(value)
    }

    fn field(name: &str) -> Expression {
        Expression::ValueRef(name.to_owned())
    }

    fn binary(op: BinaryOp, lhs: Expression, rhs: Expression) -> Expression {
        Expression::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn subscript(value: Expression, index: Expression) -> Expression {
        Expression::Subscript {
            value: Box::new(value),
            index: Box::new(index),
        }
    }

    #[rstest]
    #[case::int("42", constant(42))]
    #[case::int_separators("1_000_000", constant(1_000_000))]
    #[case::float("3.5", constant(Value::Double(3.5)))]
    #[case::float_exponent("2e3", constant(Value::Double(2000.0)))]
    #[case::int_overflow_promotes(
        "99999999999999999999",
        constant(Value::Double(1e20))
    )]
    #[case::string_single("'hi'", constant("hi"))]
    #[case::string_escapes(r"'a\n\t\'\\'", constant("a\n\t'\\"))]
    #[case::string_unknown_escape(r"'a\q'", constant("a\\q"))]
    #[case::bool_title("True", constant(true))]
    #[case::none("none", Expression::Constant(Value::Empty))]
    #[case::field("user", field("user"))]
    fn test_primary(#[case] input: &str, #[case] expected: Expression) {
        assert_eq!(parse(input), expected);
    }

    #[rstest]
    #[case::precedence(
        "1 + 2 * 3",
        binary(
            BinaryOp::Add,
            constant(1),
            binary(BinaryOp::Mul, constant(2), constant(3)),
        )
    )]
    #[case::pow_right_assoc(
        "2 ** 3 ** 2",
        binary(
            BinaryOp::Pow,
            constant(2),
            binary(BinaryOp::Pow, constant(3), constant(2)),
        )
    )]
    #[case::floor_div(
        "7 // 2",
        binary(BinaryOp::FloorDiv, constant(7), constant(2))
    )]
    #[case::concat_binds_looser_than_add(
        "1 + 2 ~ 'x'",
        binary(
            BinaryOp::Concat,
            binary(BinaryOp::Add, constant(1), constant(2)),
            constant("x"),
        )
    )]
    #[case::not_in(
        "1 not in [1]",
        binary(BinaryOp::NotIn, constant(1), Expression::ListLiteral(vec![constant(1)]))
    )]
    #[case::logic(
        "a or b and not c",
        binary(
            BinaryOp::Or,
            field("a"),
            binary(
                BinaryOp::And,
                field("b"),
                Expression::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(field("c")),
                },
            ),
        )
    )]
    fn test_operators(#[case] input: &str, #[case] expected: Expression) {
        assert_eq!(parse(input), expected);
    }

    #[rstest]
    #[case::scalar_parens("(1)", constant(1))]
    #[case::empty_tuple("()", Expression::Tuple(vec![]))]
    #[case::single_tuple("(1,)", Expression::Tuple(vec![constant(1)]))]
    #[case::pair_tuple(
        "(1, 2)",
        Expression::Tuple(vec![constant(1), constant(2)])
    )]
    #[case::list(
        "[1, 'a']",
        Expression::ListLiteral(vec![constant(1), constant("a")])
    )]
    #[case::dict_colon(
        "{'a': 1}",
        Expression::DictLiteral(vec![("a".into(), constant(1))])
    )]
    #[case::dict_equals_and_ident_key(
        "{b = 2}",
        Expression::DictLiteral(vec![("b".into(), constant(2))])
    )]
    fn test_containers(#[case] input: &str, #[case] expected: Expression) {
        assert_eq!(parse(input), expected);
    }

    #[rstest]
    #[case::attribute("a.b", subscript(field("a"), constant("b")))]
    #[case::chained(
        "a.b.c",
        subscript(subscript(field("a"), constant("b")), constant("c"))
    )]
    #[case::index("a[0]", subscript(field("a"), constant(0)))]
    #[case::index_negative(
        "a[-1]",
        subscript(
            field("a"),
            Expression::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(constant(1)),
            },
        )
    )]
    fn test_subscript(#[case] input: &str, #[case] expected: Expression) {
        assert_eq!(parse(input), expected);
    }

    /// Filters bind tighter than comparison: the two sides are filtered
    /// before the `<` applies
    #[test]
    fn test_filter_precedence() {
        let parsed = parse("-30 | abs < '20' | int");
        let Expression::Binary {
            op: BinaryOp::Lt,
            lhs,
            rhs,
        } = parsed
        else {
            panic!("expected a comparison at the top");
        };
        assert!(
            matches!(*lhs, Expression::Filter { ref call, .. } if call.name == "abs")
        );
        assert!(
            matches!(*rhs, Expression::Filter { ref call, .. } if call.name == "int")
        );
    }

    /// The unary sign applies before the filter
    #[test]
    fn test_unary_before_filter() {
        let parsed = parse("-30 | abs");
        let Expression::Filter { base, .. } = parsed else {
            panic!("expected filter at the top");
        };
        assert!(matches!(
            *base,
            Expression::Unary {
                op: UnaryOp::Neg,
                ..
            }
        ));
    }

    #[test]
    fn test_tester() {
        let parsed = parse("x is divisibleby(3)");
        assert!(matches!(
            parsed,
            Expression::Test {
                ref call,
                negated: false,
                ..
            } if call.name == "divisibleby"
        ));
        let negated = parse("x is not defined");
        assert!(
            matches!(negated, Expression::Test { negated: true, .. })
        );
    }

    #[test]
    fn test_ternary() {
        let parsed = parse("1 if flag else 2");
        assert!(matches!(parsed, Expression::IfExpr { .. }));
    }

    #[rstest]
    #[case::keyword_as_name("endfor", "Expression expected")]
    #[case::empty("", "Expression expected")]
    #[case::incomplete_list("[1, 2", "']' expected")]
    #[case::incomplete_call("f(1", "')' expected")]
    #[case::unterminated_string("'abc", "expected")]
    #[case::lingering_token("1user", "end of token")]
    #[case::unknown_filter("1 | nosuchfilter", "nosuchfilter")]
    #[case::dupe_kwarg("f(a=1, a=2)", "Unexpected token 'a'")]
    #[case::positional_after_kwarg("f(a=1, 2)", "Expected: 'keyword argument'")]
    fn test_errors(#[case] input: &str, #[case] message: &str) {
        let result = parse_expression(input)
            .map_err(|(_, kind)| kind.into_error());
        assert_err!(result, message);
    }
}
