//! Operator semantics over [Value]: equality, ordering, arithmetic,
//! subscripting and membership. Kept separate from the enum definition
//! because every evaluator and half the filter catalog goes through these.

use crate::{
    error::ErrorKind,
    expression::{BinaryOp, UnaryOp},
    value::{List, Value},
};
use std::cmp::Ordering;

/// Total equality over all variants. Numeric variants promote to double
/// with epsilon-tolerant comparison; a key-value pair equals the two
/// element list `[key, value]`.
pub(crate) fn value_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Empty, Value::Empty) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Double(a), Value::Double(b)) => double_eq(*a, *b),
        (Value::Int(a), Value::Double(b))
        | (Value::Double(b), Value::Int(a)) => double_eq(*a as f64, *b),
        (Value::String(a), Value::String(b)) => a == b,
        (Value::List(a), Value::List(b)) => a == b,
        (Value::Map(a), Value::Map(b)) => a == b,
        (Value::KeyValuePair(a), Value::KeyValuePair(b)) => a == b,
        (Value::KeyValuePair(pair), Value::List(list))
        | (Value::List(list), Value::KeyValuePair(pair)) => {
            list == &List::from_values(vec![
                pair.key.clone().into(),
                pair.value.clone(),
            ])
        }
        (Value::Callable(a), Value::Callable(b)) => a == b,
        _ => false,
    }
}

fn double_eq(a: f64, b: f64) -> bool {
    let epsilon = f64::EPSILON * a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= epsilon
}

/// Ordering, defined on numeric, string and list values only (lists
/// compare lexicographically, element-wise)
pub(crate) fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Double(a), Value::Double(b)) => compare_doubles(*a, *b),
        (Value::Int(a), Value::Double(b)) => compare_doubles(*a as f64, *b),
        (Value::Double(a), Value::Int(b)) => compare_doubles(*a, *b as f64),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::List(a), Value::List(b)) => {
            let mut left = a.iter();
            let mut right = b.iter();
            loop {
                match (left.next(), right.next()) {
                    (None, None) => return Some(Ordering::Equal),
                    (None, Some(_)) => return Some(Ordering::Less),
                    (Some(_), None) => return Some(Ordering::Greater),
                    (Some(x), Some(y)) => match compare(&x, &y)? {
                        Ordering::Equal => {}
                        other => return Some(other),
                    },
                }
            }
        }
        _ => None,
    }
}

fn compare_doubles(a: f64, b: f64) -> Option<Ordering> {
    if double_eq(a, b) {
        Some(Ordering::Equal)
    } else {
        a.partial_cmp(&b)
    }
}

/// Evaluate an arithmetic/concatenation binary operator. Comparison and
/// the short-circuit logical operators are handled by the evaluator
/// directly.
pub(crate) fn arithmetic(
    op: BinaryOp,
    lhs: &Value,
    rhs: &Value,
) -> Result<Value, ErrorKind> {
    match op {
        BinaryOp::Concat => {
            Ok(Value::String(format!("{lhs}{rhs}").into()))
        }
        BinaryOp::Add => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => {
                Ok(Value::String(format!("{a}{b}").into()))
            }
            (Value::List(a), Value::List(b)) => {
                let mut values = a.to_vec();
                values.extend(b.iter());
                Ok(Value::List(List::from_values(values)))
            }
            _ => numeric(op, lhs, rhs),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::FloorDiv
        | BinaryOp::Mod | BinaryOp::Pow => numeric(op, lhs, rhs),
        _ => Err(ErrorKind::invalid_type(format!(
            "operator '{op}' is not arithmetic"
        ))),
    }
}

fn numeric(
    op: BinaryOp,
    lhs: &Value,
    rhs: &Value,
) -> Result<Value, ErrorKind> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => int_arithmetic(op, *a, *b),
        (Value::Int(a), Value::Double(b)) => {
            double_arithmetic(op, *a as f64, *b)
        }
        (Value::Double(a), Value::Int(b)) => {
            double_arithmetic(op, *a, *b as f64)
        }
        (Value::Double(a), Value::Double(b)) => double_arithmetic(op, *a, *b),
        _ => Err(ErrorKind::invalid_type(format!(
            "cannot apply '{op}' to '{}' and '{}'",
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}

fn int_arithmetic(op: BinaryOp, a: i64, b: i64) -> Result<Value, ErrorKind> {
    let divide_by_zero = || ErrorKind::invalid_type("division by zero");
    match op {
        BinaryOp::Add => Ok(a
            .checked_add(b)
            .map_or_else(|| Value::Double(a as f64 + b as f64), Value::Int)),
        BinaryOp::Sub => Ok(a
            .checked_sub(b)
            .map_or_else(|| Value::Double(a as f64 - b as f64), Value::Int)),
        BinaryOp::Mul => Ok(a
            .checked_mul(b)
            .map_or_else(|| Value::Double(a as f64 * b as f64), Value::Int)),
        // True division always produces a double
        BinaryOp::Div => {
            if b == 0 {
                Err(divide_by_zero())
            } else {
                Ok(Value::Double(a as f64 / b as f64))
            }
        }
        BinaryOp::FloorDiv => {
            if b == 0 {
                return Err(divide_by_zero());
            }
            // Floor semantics: round toward negative infinity
            let quotient = a / b;
            let remainder = a % b;
            if remainder != 0 && (remainder < 0) != (b < 0) {
                Ok(Value::Int(quotient - 1))
            } else {
                Ok(Value::Int(quotient))
            }
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(divide_by_zero());
            }
            // Result sign follows the divisor
            let remainder = a % b;
            if remainder != 0 && (remainder < 0) != (b < 0) {
                Ok(Value::Int(remainder + b))
            } else {
                Ok(Value::Int(remainder))
            }
        }
        BinaryOp::Pow => {
            if let Ok(exponent) = u32::try_from(b) {
                if let Some(result) = a.checked_pow(exponent) {
                    return Ok(Value::Int(result));
                }
            }
            Ok(Value::Double((a as f64).powf(b as f64)))
        }
        _ => unreachable!("non-arithmetic operator {op:?}"),
    }
}

fn double_arithmetic(
    op: BinaryOp,
    a: f64,
    b: f64,
) -> Result<Value, ErrorKind> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(ErrorKind::invalid_type("division by zero"));
            }
            a / b
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Err(ErrorKind::invalid_type("division by zero"));
            }
            (a / b).floor()
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(ErrorKind::invalid_type("division by zero"));
            }
            a.rem_euclid(b)
        }
        BinaryOp::Pow => a.powf(b),
        _ => unreachable!("non-arithmetic operator {op:?}"),
    };
    Ok(Value::Double(result))
}

/// Evaluate a unary operator
pub(crate) fn unary(op: UnaryOp, value: &Value) -> Result<Value, ErrorKind> {
    match (op, value) {
        (UnaryOp::Not, _) => Ok(Value::Bool(!value.truthy())),
        (UnaryOp::Neg, Value::Int(i)) => Ok(Value::Int(-i)),
        (UnaryOp::Neg, Value::Double(d)) => Ok(Value::Double(-d)),
        (UnaryOp::Pos, Value::Int(_) | Value::Double(_)) => {
            Ok(value.clone())
        }
        _ => Err(ErrorKind::invalid_type(format!(
            "cannot apply unary '{op}' to '{}'",
            value.type_name()
        ))),
    }
}

/// Subscript a value: maps by key, lists and strings by index (negative
/// counts from the end), key-value pairs by `key`/`value` name or 0/1
/// position. Unresolvable subscripts yield `Empty`; indexing a sequence
/// that has no indexer is an error.
pub(crate) fn subscript(
    value: &Value,
    key: &Value,
) -> Result<Value, ErrorKind> {
    match (value, key) {
        (Value::Map(map), Value::String(name)) => {
            Ok(map.get(name.as_str()).unwrap_or_default())
        }
        (Value::List(list), Value::Int(idx)) => list.get_item(*idx),
        (Value::String(s), Value::Int(idx)) => {
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let effective = if *idx < 0 { len + idx } else { *idx };
            if (0..len).contains(&effective) {
                Ok(Value::String(
                    chars[effective as usize].to_string().into(),
                ))
            } else {
                Ok(Value::Empty)
            }
        }
        (Value::KeyValuePair(pair), Value::String(name)) => {
            match name.as_str() {
                "key" => Ok(Value::String(pair.key.clone().into())),
                "value" => Ok(pair.value.clone()),
                _ => Ok(Value::Empty),
            }
        }
        (Value::KeyValuePair(pair), Value::Int(idx)) => match idx {
            0 => Ok(Value::String(pair.key.clone().into())),
            1 => Ok(pair.value.clone()),
            _ => Ok(Value::Empty),
        },
        (Value::Callable(callable), Value::String(name)) => {
            Ok(callable.attr(name.as_str()).unwrap_or_default())
        }
        _ => Ok(Value::Empty),
    }
}

/// `needle in haystack` membership: element-of for lists, key-of for maps,
/// substring for strings
pub(crate) fn contains(
    haystack: &Value,
    needle: &Value,
) -> Result<bool, ErrorKind> {
    match haystack {
        Value::List(list) => Ok(list.iter().any(|item| item == *needle)),
        Value::Map(map) => match needle {
            Value::String(key) => Ok(map.contains(key.as_str())),
            _ => Ok(false),
        },
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            _ => Err(ErrorKind::invalid_type(format!(
                "cannot search for '{}' within a string",
                needle.type_name()
            ))),
        },
        _ => Err(ErrorKind::invalid_type(format!(
            "'{}' is not a container",
            haystack.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use vellum_util::assert_err;

    #[rstest]
    #[case::add(BinaryOp::Add, Value::Int(2), Value::Int(3), Value::Int(5))]
    #[case::add_strings(
        BinaryOp::Add,
        Value::from("ab"),
        Value::from("cd"),
        Value::from("abcd")
    )]
    #[case::add_promotes(
        BinaryOp::Add,
        Value::Int(1),
        Value::Double(0.5),
        Value::Double(1.5)
    )]
    #[case::div_is_true_division(
        BinaryOp::Div,
        Value::Int(3),
        Value::Int(2),
        Value::Double(1.5)
    )]
    #[case::floor_div(
        BinaryOp::FloorDiv,
        Value::Int(7),
        Value::Int(2),
        Value::Int(3)
    )]
    #[case::floor_div_negative(
        BinaryOp::FloorDiv,
        Value::Int(-7),
        Value::Int(2),
        Value::Int(-4)
    )]
    #[case::modulo(BinaryOp::Mod, Value::Int(7), Value::Int(3), Value::Int(1))]
    #[case::modulo_sign_follows_divisor(
        BinaryOp::Mod,
        Value::Int(-7),
        Value::Int(3),
        Value::Int(2)
    )]
    #[case::pow(BinaryOp::Pow, Value::Int(2), Value::Int(10), Value::Int(1024))]
    #[case::concat(
        BinaryOp::Concat,
        Value::Int(1),
        Value::from("x"),
        Value::from("1x")
    )]
    fn test_arithmetic(
        #[case] op: BinaryOp,
        #[case] lhs: Value,
        #[case] rhs: Value,
        #[case] expected: Value,
    ) {
        assert_eq!(arithmetic(op, &lhs, &rhs).unwrap(), expected);
    }

    #[test]
    fn test_division_by_zero() {
        assert_err!(
            arithmetic(BinaryOp::Div, &Value::Int(1), &Value::Int(0))
                .map_err(ErrorKind::into_error),
            "division by zero"
        );
    }

    #[rstest]
    #[case::int_lt(Value::Int(1), Value::Int(2), Some(Ordering::Less))]
    #[case::promoted(Value::Int(2), Value::Double(2.0), Some(Ordering::Equal))]
    #[case::strings(
        Value::from("abc"),
        Value::from("abd"),
        Some(Ordering::Less)
    )]
    #[case::lists(
        Value::from(vec![1, 2]),
        Value::from(vec![1, 3]),
        Some(Ordering::Less)
    )]
    #[case::undefined(Value::Bool(true), Value::Bool(false), None)]
    #[case::mixed(Value::Int(1), Value::from("1"), None)]
    fn test_compare(
        #[case] lhs: Value,
        #[case] rhs: Value,
        #[case] expected: Option<Ordering>,
    ) {
        assert_eq!(compare(&lhs, &rhs), expected);
    }

    #[rstest]
    #[case::list(Value::from(vec![1, 2, 3]), Value::Int(2), true)]
    #[case::list_missing(Value::from(vec![1, 2, 3]), Value::Int(9), false)]
    #[case::substring(Value::from("hello"), Value::from("ell"), true)]
    #[case::map_key(
        Value::from(vec![("a", 1)]),
        Value::from("a"),
        true
    )]
    fn test_contains(
        #[case] haystack: Value,
        #[case] needle: Value,
        #[case] expected: bool,
    ) {
        assert_eq!(contains(&haystack, &needle).unwrap(), expected);
    }

    #[rstest]
    #[case::map_hit(Value::from(vec![("a", 1)]), Value::from("a"), Value::Int(1))]
    #[case::map_miss(Value::from(vec![("a", 1)]), Value::from("b"), Value::Empty)]
    #[case::string_index(Value::from("abc"), Value::Int(1), Value::from("b"))]
    #[case::string_negative(Value::from("abc"), Value::Int(-1), Value::from("c"))]
    #[case::unsupported(Value::Int(3), Value::from("x"), Value::Empty)]
    fn test_subscript(
        #[case] value: Value,
        #[case] key: Value,
        #[case] expected: Value,
    ) {
        assert_eq!(subscript(&value, &key).unwrap(), expected);
    }
}
