//! The tester catalog: named predicates applied via `is`. Mirrors the
//! filter registry in structure; each entry carries an argument schema
//! bound at parse time.

use crate::{
    error::{Error, ErrorKind},
    expression::{self, EvaluatedArgs, TesterCall},
    render::RenderContext,
    value::{ArgSpec, CallArgs, Param, TryFromValue, Value},
};
use std::{cmp::Ordering, collections::HashMap, sync::LazyLock};

type TesterFn =
    fn(&Value, &EvaluatedArgs, &mut RenderContext<'_>) -> Result<bool, Error>;

/// A registered tester: its argument schema plus the implementation
#[derive(Clone)]
pub(crate) struct TesterDef {
    pub spec: ArgSpec,
    test: TesterFn,
}

/// Look up a tester by (lowercased) name
pub(crate) fn lookup(name: &str) -> Option<&'static TesterDef> {
    TESTERS.get(name.to_lowercase().as_str())
}

/// Apply a parse-time-bound tester call to a value
pub(crate) fn apply(
    call: &TesterCall,
    base: &Value,
    context: &mut RenderContext<'_>,
) -> Result<bool, Error> {
    let def = lookup(&call.name)
        .expect("tester existence was checked at parse time");
    let args =
        expression::evaluate_bindings(&def.spec, &call.bindings, context)?;
    (def.test)(base, &args, context)
}

/// Apply a tester by name with already-evaluated extra arguments. Drives
/// `select('odd')` and friends.
pub(crate) fn apply_named(
    name: &str,
    base: &Value,
    extra: Vec<Value>,
    context: &mut RenderContext<'_>,
) -> Result<bool, Error> {
    let def = lookup(name).ok_or_else(|| {
        ErrorKind::UnexpectedToken {
            token: name.to_owned(),
        }
        .into_error()
    })?;
    let args = expression::bind_call_args(
        &def.spec,
        &CallArgs::positional(extra),
        context,
    )?;
    (def.test)(base, &args, context)
}

macro_rules! registry {
    ($($name:literal $(| $alias:literal)* => $func:ident ($($param:expr),*)),* $(,)?) => {{
        let mut testers: HashMap<&'static str, TesterDef> = HashMap::new();
        $(
            let params: Vec<Param> = vec![$($param),*];
            let def = TesterDef {
                spec: ArgSpec::new(params),
                test: $func,
            };
            $(testers.insert($alias, def.clone());)*
            testers.insert($name, def);
        )*
        testers
    }};
}

static TESTERS: LazyLock<HashMap<&'static str, TesterDef>> =
    LazyLock::new(|| {
        registry! {
            "boolean" => is_boolean(),
            "defined" => is_defined(),
            "divisibleby" => divisibleby(Param::required("num")),
            "eq" | "equalto" => eq(Param::required("other")),
            "even" => is_even(),
            "false" => is_false(),
            "float" => is_float(),
            "ge" => ge(Param::required("other")),
            "greaterthan" | "gt" => gt(Param::required("other")),
            "in" => is_in(Param::required("seq")),
            "integer" => is_integer(),
            "iterable" => is_iterable(),
            "le" => le(Param::required("other")),
            "lessthan" | "lt" => lt(Param::required("other")),
            "lower" => is_lower(),
            "mapping" => is_mapping(),
            "ne" => ne(Param::required("other")),
            "none" => is_none(),
            "number" => is_number(),
            "odd" => is_odd(),
            "sameas" => sameas(Param::required("other")),
            "sequence" => is_sequence(),
            "string" => is_string(),
            "true" => is_true(),
            "undefined" => is_undefined(),
            "upper" => is_upper(),
        }
    });

fn ordering(
    base: &Value,
    other: &Value,
) -> Result<Ordering, Error> {
    base.partial_cmp(other).ok_or_else(|| {
        ErrorKind::invalid_type(format!(
            "cannot order '{}' and '{}'",
            base.type_name(),
            other.type_name()
        ))
        .into_error()
    })
}

fn is_boolean(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(matches!(base, Value::Bool(_)))
}

fn is_defined(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(!base.is_empty())
}

fn is_undefined(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(base.is_empty())
}

fn is_none(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(base.is_empty())
}

fn divisibleby(base: &Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    let value = i64::try_from_value(base.clone())
        .map_err(ErrorKind::into_error)?;
    let num = i64::try_from_value(args.get("num").clone())
        .map_err(ErrorKind::into_error)?;
    if num == 0 {
        return Err(
            ErrorKind::invalid_type("division by zero").into_error()
        );
    }
    Ok(value % num == 0)
}

fn eq(base: &Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(base == args.get("other"))
}

fn ne(base: &Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(base != args.get("other"))
}

fn gt(base: &Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    ordering(base, args.get("other")).map(Ordering::is_gt)
}

fn ge(base: &Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    ordering(base, args.get("other")).map(Ordering::is_ge)
}

fn lt(base: &Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    ordering(base, args.get("other")).map(Ordering::is_lt)
}

fn le(base: &Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    ordering(base, args.get("other")).map(Ordering::is_le)
}

fn is_even(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    let value = i64::try_from_value(base.clone())
        .map_err(ErrorKind::into_error)?;
    Ok(value % 2 == 0)
}

fn is_odd(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    let value = i64::try_from_value(base.clone())
        .map_err(ErrorKind::into_error)?;
    Ok(value % 2 != 0)
}

fn is_false(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(matches!(base, Value::Bool(false)))
}

fn is_true(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(matches!(base, Value::Bool(true)))
}

fn is_float(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(matches!(base, Value::Double(_)))
}

fn is_integer(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(matches!(base, Value::Int(_)))
}

fn is_number(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(matches!(base, Value::Int(_) | Value::Double(_)))
}

fn is_string(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(matches!(base, Value::String(_)))
}

fn is_mapping(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(matches!(base, Value::Map(_)))
}

fn is_sequence(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(matches!(
        base,
        Value::List(_) | Value::Map(_) | Value::String(_)
    ))
}

fn is_iterable(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(base.try_iterate().is_ok())
}

fn is_in(base: &Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    crate::value::contains(args.get("seq"), base)
        .map_err(ErrorKind::into_error)
}

fn is_lower(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    match base {
        Value::String(s) => {
            Ok(!s.chars().any(|c| c.is_uppercase()))
        }
        _ => Ok(false),
    }
}

fn is_upper(base: &Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    match base {
        Value::String(s) => {
            Ok(!s.chars().any(|c| c.is_lowercase()))
        }
        _ => Ok(false),
    }
}

/// Identity comparison. Callables compare by handler identity; everything
/// else falls back to value equality, which is the closest observable
/// notion of "the same object" in a value-semantics engine.
fn sameas(base: &Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<bool, Error> {
    Ok(base == args.get("other"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValuesMap;
    use rstest::rstest;

    fn test_value(base: Value, name: &str, extra: Vec<Value>) -> bool {
        let values = ValuesMap::new();
        let mut context = RenderContext::new(&values, None, false);
        apply_named(name, &base, extra, &mut context)
            .unwrap_or_else(|error| panic!("{name} failed: {error}"))
    }

    #[rstest]
    #[case::defined(Value::Int(1), "defined", vec![], true)]
    #[case::undefined_empty(Value::Empty, "undefined", vec![], true)]
    #[case::none(Value::Empty, "none", vec![], true)]
    #[case::boolean(Value::Bool(true), "boolean", vec![], true)]
    #[case::boolean_not(Value::Int(1), "boolean", vec![], false)]
    #[case::even(Value::Int(4), "even", vec![], true)]
    #[case::odd(Value::Int(3), "odd", vec![], true)]
    #[case::divisible(Value::Int(9), "divisibleby", vec![Value::Int(3)], true)]
    #[case::eq(Value::Int(3), "eq", vec![Value::Int(3)], true)]
    #[case::equalto_alias(Value::Int(3), "equalto", vec![Value::Int(4)], false)]
    #[case::gt(Value::Int(3), "greaterthan", vec![Value::Int(2)], true)]
    #[case::le(Value::Int(2), "le", vec![Value::Int(2)], true)]
    #[case::integer(Value::Int(1), "integer", vec![], true)]
    #[case::float(Value::Double(1.0), "float", vec![], true)]
    #[case::number(Value::Double(1.0), "number", vec![], true)]
    #[case::string(Value::from("x"), "string", vec![], true)]
    #[case::mapping(Value::from(vec![("a", 1)]), "mapping", vec![], true)]
    #[case::sequence(Value::from(vec![1]), "sequence", vec![], true)]
    #[case::iterable_string(Value::from("x"), "iterable", vec![], true)]
    #[case::iterable_int(Value::Int(1), "iterable", vec![], false)]
    #[case::in_list(Value::Int(2), "in", vec![vec![1, 2].into()], true)]
    #[case::lower(Value::from("abc"), "lower", vec![], true)]
    #[case::upper(Value::from("ABC"), "upper", vec![], true)]
    #[case::sameas(Value::from("x"), "sameas", vec!["x".into()], true)]
    fn test_tester(
        #[case] base: Value,
        #[case] name: &str,
        #[case] extra: Vec<Value>,
        #[case] expected: bool,
    ) {
        assert_eq!(test_value(base, name, extra), expected);
    }
}
