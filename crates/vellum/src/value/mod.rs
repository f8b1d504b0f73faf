//! The runtime value model. A [Value] is a closed sum over every shape of
//! data a template can observe: scalars, containers behind provider
//! adapters, map-iteration pairs and callables. Pattern matching over the
//! variants is pervasive in the evaluator and the filter catalog, which is
//! why this is an enum rather than a trait hierarchy.

mod callable;
mod list;
mod map;
mod ops;

pub use callable::{
    ArgBindings, ArgSpec, CallArgs, Callable, CallableKind, Param,
    ParamDefault,
};
pub use list::{GeneratorList, List, ListProvider, SubscriptedList};
pub use map::{Map, MapProvider};
pub(crate) use ops::{arithmetic, compare, contains, subscript, unary};

use crate::error::ErrorKind;
use derive_more::Deref;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::fmt::{self, Display, Write};

/// External values handed to a render call, and the shape of each scope
/// frame. Insertion order is preserved so map iteration is stable.
pub type ValuesMap = IndexMap<String, Value>;

/// A runtime template value
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// The undefined value: falsy, equal only to itself, renders as nothing
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(Str),
    List(List),
    Map(Map),
    /// A single item of map iteration
    KeyValuePair(Box<KeyValuePair>),
    Callable(Callable),
}

impl Value {
    /// Build a safe (autoescape-exempt) string value
    pub fn safe_string(text: impl Into<String>) -> Self {
        Self::String(Str::safe(text))
    }

    /// Convert this value to a boolean, according to its truthiness:
    /// `Empty` and empty strings/containers are falsy, zero numbers are
    /// falsy, everything else is truthy (the Python rules).
    pub fn truthy(&self) -> bool {
        match self {
            Self::Empty => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Double(d) => *d != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::List(list) => list.size().map_or_else(
                || list.iter().next().is_some(),
                |size| size != 0,
            ),
            Self::Map(map) => map.size() != 0,
            Self::KeyValuePair(_) | Self::Callable(_) => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Is this a string marked safe for autoescaping purposes?
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::String(s) if s.is_safe())
    }

    /// Name of the variant, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::KeyValuePair(_) => "key-value pair",
            Self::Callable(_) => "callable",
        }
    }

    /// Number of items/characters in the value, if it has a notion of
    /// length. Lazy lists without a known size are counted by enumeration.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::String(s) => Some(s.chars().count()),
            Self::List(list) => {
                list.size().or_else(|| Some(list.iter().count()))
            }
            Self::Map(map) => Some(map.size()),
            Self::KeyValuePair(_) => Some(2),
            _ => None,
        }
    }

    /// Iterate the value as a sequence: lists yield their elements, maps
    /// yield [Value::KeyValuePair] items in insertion order, strings yield
    /// one-character strings. Anything else is not iterable.
    pub fn try_iterate(
        &self,
    ) -> Result<Box<dyn Iterator<Item = Value> + '_>, ErrorKind> {
        match self {
            Self::List(list) => Ok(list.iter()),
            Self::Map(map) => Ok(Box::new(map.iter_pairs().map(Value::from))),
            Self::String(s) => Ok(Box::new(
                s.chars().map(|c| Value::from(c.to_string())),
            )),
            _ => Err(ErrorKind::invalid_type(format!(
                "'{}' is not iterable",
                self.type_name()
            ))),
        }
    }

    /// Convert a JSON value. Total: [Value] is a superset of JSON.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Empty,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::String(s.into()),
            serde_json::Value::Array(values) => Self::List(List::from_values(
                values.into_iter().map(Self::from_json).collect(),
            )),
            serde_json::Value::Object(entries) => Self::Map(Map::from_values(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Self::from_json(value)))
                    .collect(),
            )),
        }
    }
}

/// Equality is defined across all variants; numeric variants promote to
/// double with epsilon-tolerant comparison. A key-value pair compares equal
/// to the two-element list `[key, value]` so map items interoperate with
/// tuple literals.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        ops::value_eq(self, other)
    }
}

/// Ordering is defined on numeric, string and list values only
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        ops::compare(self, other)
    }
}

/// The rendered form of a value: booleans as `true`/`false`, `Empty` as
/// nothing, strings verbatim, containers in their pprint form
impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{}", format_double(*d)),
            Self::String(s) => write!(f, "{s}"),
            _ => fmt_repr(self, f),
        }
    }
}

/// Format a double the way a template user expects: whole values keep a
/// trailing `.0` rather than printing as integers
pub(crate) fn format_double(d: f64) -> String {
    format!("{d:?}")
}

/// The pprint form used inside containers: strings are single-quoted,
/// everything else formats as at top level
fn fmt_repr(value: &Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value {
        Value::Empty => write!(f, "none"),
        Value::String(s) => write!(f, "'{s}'"),
        Value::List(list) => {
            write!(f, "[")?;
            for (i, item) in list.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                fmt_repr(&item, f)?;
            }
            write!(f, "]")
        }
        Value::Map(map) => {
            write!(f, "{{")?;
            for (i, pair) in map.iter_pairs().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "'{}': ", pair.key)?;
                fmt_repr(&pair.value, f)?;
            }
            write!(f, "}}")
        }
        Value::KeyValuePair(pair) => {
            write!(f, "('{}', ", pair.key)?;
            fmt_repr(&pair.value, f)?;
            write!(f, ")")
        }
        Value::Callable(_) => write!(f, "<callable>"),
        other => write!(f, "{other}"),
    }
}

/// Unicode text plus the autoescape "safe" flag. Comparisons, hashing and
/// ordering see only the text; the flag merely routes the value around
/// HTML escaping.
#[derive(Clone, Debug, Default, Deref)]
pub struct Str {
    #[deref]
    text: String,
    safe: bool,
}

impl Str {
    /// Mark text as safe: it will bypass autoescaping when rendered
    pub fn safe(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            safe: true,
        }
    }

    pub fn is_safe(&self) -> bool {
        self.safe
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

impl Display for Str {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl PartialEq for Str {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Str {}

impl PartialOrd for Str {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Str {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.text.cmp(&other.text)
    }
}

impl From<String> for Str {
    fn from(text: String) -> Self {
        Self { text, safe: false }
    }
}

impl From<&str> for Str {
    fn from(text: &str) -> Self {
        text.to_owned().into()
    }
}

/// A single item of map iteration
#[derive(Clone, Debug, PartialEq)]
pub struct KeyValuePair {
    pub key: String,
    pub value: Value,
}

impl From<KeyValuePair> for Value {
    fn from(pair: KeyValuePair) -> Self {
        Self::KeyValuePair(Box::new(pair))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<Str> for Value {
    fn from(value: Str) -> Self {
        Self::String(value)
    }
}

impl From<List> for Value {
    fn from(value: List) -> Self {
        Self::List(value)
    }
}

impl From<Map> for Value {
    fn from(value: Map) -> Self {
        Self::Map(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value.into())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl<T> From<Vec<T>> for Value
where
    Value: From<T>,
{
    fn from(values: Vec<T>) -> Self {
        Self::List(List::from_values(
            values.into_iter().map(Value::from).collect(),
        ))
    }
}

impl<K, V> From<Vec<(K, V)>> for Value
where
    String: From<K>,
    Value: From<V>,
{
    fn from(entries: Vec<(K, V)>) -> Self {
        Self::Map(Map::from_values(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        ))
    }
}

impl From<ValuesMap> for Value {
    fn from(values: ValuesMap) -> Self {
        Self::Map(Map::from_values(values))
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::from_json(value)
    }
}

impl<T> From<Option<T>> for Value
where
    Value: From<T>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Empty, Value::from)
    }
}

/// Serialization drives the `tojson` filter and metadata round-trips.
/// Callables have no JSON form and serialize as null; a key-value pair
/// serializes as the `[key, value]` array, matching its tuple equality.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Empty | Self::Callable(_) => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Double(d) => serializer.serialize_f64(*d),
            Self::String(s) => serializer.serialize_str(s),
            Self::List(list) => {
                let mut seq =
                    serializer.serialize_seq(list.size())?;
                for item in list.iter() {
                    seq.serialize_element(&item)?;
                }
                seq.end()
            }
            Self::Map(map) => {
                let mut entries =
                    serializer.serialize_map(Some(map.size()))?;
                for pair in map.iter_pairs() {
                    entries.serialize_entry(&pair.key, &pair.value)?;
                }
                entries.end()
            }
            Self::KeyValuePair(pair) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(&pair.key)?;
                seq.serialize_element(&pair.value)?;
                seq.end()
            }
        }
    }
}

/// Convert [Value] to a host type fallibly. This is how filter and tester
/// implementations turn their arguments into static types.
pub trait TryFromValue: Sized {
    fn try_from_value(value: Value) -> Result<Self, ErrorKind>;
}

impl TryFromValue for Value {
    fn try_from_value(value: Value) -> Result<Self, ErrorKind> {
        Ok(value)
    }
}

impl TryFromValue for bool {
    fn try_from_value(value: Value) -> Result<Self, ErrorKind> {
        Ok(value.truthy())
    }
}

impl TryFromValue for i64 {
    fn try_from_value(value: Value) -> Result<Self, ErrorKind> {
        match value {
            Value::Int(i) => Ok(i),
            Value::Double(d) if d.fract() == 0.0 => Ok(d as i64),
            other => Err(ErrorKind::invalid_type(format!(
                "expected an integer, got '{}'",
                other.type_name()
            ))),
        }
    }
}

impl TryFromValue for usize {
    fn try_from_value(value: Value) -> Result<Self, ErrorKind> {
        let i = i64::try_from_value(value)?;
        usize::try_from(i).map_err(|_| {
            ErrorKind::invalid_type("expected a non-negative integer")
        })
    }
}

impl TryFromValue for f64 {
    fn try_from_value(value: Value) -> Result<Self, ErrorKind> {
        match value {
            Value::Int(i) => Ok(i as f64),
            Value::Double(d) => Ok(d),
            other => Err(ErrorKind::invalid_type(format!(
                "expected a number, got '{}'",
                other.type_name()
            ))),
        }
    }
}

impl TryFromValue for String {
    fn try_from_value(value: Value) -> Result<Self, ErrorKind> {
        match value {
            Value::String(s) => Ok(s.into_string()),
            Value::Callable(_) => Err(ErrorKind::invalid_type(
                "a callable has no string form",
            )),
            other => Ok(other.to_string()),
        }
    }
}

impl TryFromValue for List {
    fn try_from_value(value: Value) -> Result<Self, ErrorKind> {
        match value {
            Value::List(list) => Ok(list),
            other => Err(ErrorKind::invalid_type(format!(
                "expected a list, got '{}'",
                other.type_name()
            ))),
        }
    }
}

impl TryFromValue for Map {
    fn try_from_value(value: Value) -> Result<Self, ErrorKind> {
        match value {
            Value::Map(map) => Ok(map),
            other => Err(ErrorKind::invalid_type(format!(
                "expected a map, got '{}'",
                other.type_name()
            ))),
        }
    }
}

impl<T: TryFromValue> TryFromValue for Option<T> {
    fn try_from_value(value: Value) -> Result<Self, ErrorKind> {
        if value.is_empty() {
            Ok(None)
        } else {
            T::try_from_value(value).map(Some)
        }
    }
}

impl<T: TryFromValue> TryFromValue for Vec<T> {
    fn try_from_value(value: Value) -> Result<Self, ErrorKind> {
        value.try_iterate()?.map(T::try_from_value).try_collect()
    }
}

/// The pprint/repr form of a value as a string: strings quoted, containers
/// bracketed. Drives the `pprint` filter.
pub(crate) fn repr(value: &Value) -> String {
    struct Repr<'a>(&'a Value);
    impl Display for Repr<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt_repr(self.0, f)
        }
    }
    Repr(value).to_string()
}

/// Escape `& < > " '` for HTML output
pub(crate) fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Write a value into an output sink, escaping it if autoescape is active
/// and the value isn't marked safe
pub(crate) fn write_value(
    out: &mut dyn Write,
    value: &Value,
    autoescape: bool,
) -> fmt::Result {
    if autoescape && !value.is_safe() {
        out.write_str(&escape_html(&value.to_string()))
    } else {
        write!(out, "{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case::empty(Value::Empty, false)]
    #[case::bool_true(Value::Bool(true), true)]
    #[case::int_zero(Value::Int(0), false)]
    #[case::int(Value::Int(-3), true)]
    #[case::double_zero(Value::Double(0.0), false)]
    #[case::string_empty(Value::from(""), false)]
    #[case::string(Value::from("x"), true)]
    #[case::list_empty(Value::from(Vec::<Value>::new()), false)]
    #[case::list(Value::from(vec![1]), true)]
    fn test_truthy(#[case] value: Value, #[case] expected: bool) {
        assert_eq!(value.truthy(), expected);
    }

    #[rstest]
    #[case::int_int(Value::Int(1), Value::Int(1), true)]
    #[case::int_double(Value::Int(1), Value::Double(1.0), true)]
    #[case::int_double_ne(Value::Int(1), Value::Double(1.5), false)]
    #[case::empty_empty(Value::Empty, Value::Empty, true)]
    #[case::empty_other(Value::Empty, Value::Int(0), false)]
    #[case::string(Value::from("a"), Value::from("a"), true)]
    #[case::safe_string(Value::from("a"), Value::safe_string("a"), true)]
    #[case::list(Value::from(vec![1, 2]), Value::from(vec![1, 2]), true)]
    #[case::list_ne(Value::from(vec![1, 2]), Value::from(vec![2, 1]), false)]
    #[case::pair_vs_tuple(
        Value::from(KeyValuePair { key: "a".into(), value: Value::Int(1) }),
        Value::from(vec![Value::from("a"), Value::Int(1)]),
        true
    )]
    fn test_eq(#[case] lhs: Value, #[case] rhs: Value, #[case] expected: bool) {
        assert_eq!(lhs == rhs, expected, "{lhs:?} == {rhs:?}");
        assert_eq!(rhs == lhs, expected, "{rhs:?} == {lhs:?}");
    }

    #[rstest]
    #[case::empty(Value::Empty, "")]
    #[case::bool(Value::Bool(true), "true")]
    #[case::int(Value::Int(-17), "-17")]
    #[case::double_whole(Value::Double(3.0), "3.0")]
    #[case::double(Value::Double(3.5), "3.5")]
    #[case::string(Value::from("plain"), "plain")]
    #[case::list(
        Value::from(vec![Value::Int(1), Value::from("x")]),
        "[1, 'x']"
    )]
    #[case::map(
        Value::from(vec![("a", Value::Int(1)), ("b", Value::from("s"))]),
        "{'a': 1, 'b': 's'}"
    )]
    fn test_display(#[case] value: Value, #[case] expected: &str) {
        assert_eq!(value.to_string(), expected);
    }

    #[rstest]
    #[case::null(json!(null), Value::Empty)]
    #[case::number(json!(42), Value::Int(42))]
    #[case::double(json!(1.25), Value::Double(1.25))]
    #[case::array(json!([1, "a"]), Value::from(vec![Value::Int(1), "a".into()]))]
    #[case::object(
        json!({"k": true}),
        Value::from(vec![("k", Value::Bool(true))])
    )]
    fn test_from_json(#[case] json: serde_json::Value, #[case] expected: Value) {
        assert_eq!(Value::from_json(json), expected);
    }

    #[rstest]
    #[case::plain("nothing to do", "nothing to do")]
    #[case::tags("<b>&'\"</b>", "&lt;b&gt;&amp;&#39;&quot;&lt;/b&gt;")]
    fn test_escape_html(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(escape_html(input), expected);
    }
}
