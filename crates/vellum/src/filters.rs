//! The filter catalog: named transformations applied via `|`. The
//! registry is built once at startup and immutable afterwards; each entry
//! carries the argument schema the parser binds call sites against.

use crate::{
    error::{Error, ErrorKind},
    expression::{self, EvaluatedArgs, FilterCall},
    render::RenderContext,
    testers,
    value::{
        ArgSpec, CallArgs, KeyValuePair, List, Map, Param,
        SubscriptedList, TryFromValue, Value, escape_html, subscript,
    },
};
use itertools::Itertools;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::{cmp::Ordering, collections::HashMap, sync::LazyLock};

type FilterFn =
    fn(Value, &EvaluatedArgs, &mut RenderContext<'_>) -> Result<Value, Error>;

/// A registered filter: its argument schema plus the implementation
#[derive(Clone)]
pub(crate) struct FilterDef {
    pub spec: ArgSpec,
    apply: FilterFn,
}

/// Look up a filter by (lowercased) name
pub(crate) fn lookup(name: &str) -> Option<&'static FilterDef> {
    FILTERS.get(name.to_lowercase().as_str())
}

/// Apply a parse-time-bound filter call to a value
pub(crate) fn apply(
    call: &FilterCall,
    base: Value,
    context: &mut RenderContext<'_>,
) -> Result<Value, Error> {
    let def = lookup(&call.name)
        .expect("filter existence was checked at parse time");
    let args = expression::evaluate_bindings(&def.spec, &call.bindings, context)?;
    (def.apply)(base, &args, context)
}

/// Apply a filter by name with already-evaluated extra arguments. Drives
/// the `map('filtername')` family.
pub(crate) fn apply_named(
    name: &str,
    base: Value,
    extra: Vec<Value>,
    context: &mut RenderContext<'_>,
) -> Result<Value, Error> {
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
    (def.apply)(base, &args, context)
}

macro_rules! registry {
    ($($name:literal $(| $alias:literal)* => $func:ident ($($param:expr),*)),* $(,)?) => {{
        let mut filters: HashMap<&'static str, FilterDef> = HashMap::new();
        $(
            let params: Vec<Param> = vec![$($param),*];
            let def = FilterDef {
                spec: ArgSpec::new(params),
                apply: $func,
            };
            $(filters.insert($alias, def.clone());)*
            filters.insert($name, def);
        )*
        filters
    }};
}

static FILTERS: LazyLock<HashMap<&'static str, FilterDef>> =
    LazyLock::new(|| {
        registry! {
            "abs" => abs(),
            "attr" => attr(Param::required("name")),
            "batch" => batch(
                Param::required("linecount"),
                Param::optional("fill_with")
            ),
            "capitalize" => capitalize(),
            "center" => center(Param::with_default("width", 80)),
            "default" | "d" => default(
                Param::with_default("default_value", ""),
                Param::with_default("boolean", false)
            ),
            "dictsort" => dictsort(
                Param::with_default("case_sensitive", false),
                Param::with_default("by", "key"),
                Param::with_default("reverse", false)
            ),
            "escape" | "e" => escape(),
            "filesizeformat" => filesizeformat(
                Param::with_default("binary", false)
            ),
            "first" => first(),
            "float" => to_float(Param::with_default("default", 0.0)),
            "forceescape" => forceescape(),
            "format" => format_filter(
                Param::optional("*args"),
                Param::optional("**kwargs")
            ),
            "groupby" => groupby(Param::required("attribute")),
            "indent" => indent(
                Param::with_default("width", 4),
                Param::with_default("first", false),
                Param::with_default("blank", false)
            ),
            "int" => to_int(
                Param::with_default("default", 0),
                Param::with_default("base", 10)
            ),
            "items" => items(),
            "join" => join(
                Param::with_default("d", ""),
                Param::optional("attribute")
            ),
            "last" => last(),
            "length" | "count" => length(),
            "list" => to_list_filter(),
            "lower" => lower(),
            "map" => map_filter(
                Param::optional("*args"),
                Param::keyword("attribute"),
                Param::keyword("default")
            ),
            "max" => max_filter(
                Param::with_default("case_sensitive", false),
                Param::optional("attribute")
            ),
            "min" => min_filter(
                Param::with_default("case_sensitive", false),
                Param::optional("attribute")
            ),
            "pprint" => pprint(),
            "random" => random(),
            "reject" => reject(Param::optional("*args")),
            "rejectattr" => rejectattr(Param::optional("*args")),
            "replace" => replace(
                Param::required("old"),
                Param::required("new"),
                Param::optional("count")
            ),
            "reverse" => reverse(),
            "round" => round(
                Param::with_default("precision", 0),
                Param::with_default("method", "common")
            ),
            "safe" => safe(),
            "select" => select(Param::optional("*args")),
            "selectattr" => selectattr(Param::optional("*args")),
            "slice" => slice_filter(
                Param::required("slices"),
                Param::optional("fill_with")
            ),
            "sort" => sort(
                Param::with_default("reverse", false),
                Param::with_default("case_sensitive", false),
                Param::optional("attribute")
            ),
            "string" => to_string_filter(),
            "striptags" => striptags(),
            "sum" => sum(
                Param::optional("attribute"),
                Param::with_default("start", 0)
            ),
            "title" => title(),
            "tojson" => tojson(Param::optional("indent")),
            "trim" => trim(Param::optional("chars")),
            "truncate" => truncate(
                Param::with_default("length", 255),
                Param::with_default("killwords", false),
                Param::with_default("end", "..."),
                Param::with_default("leeway", 5)
            ),
            "unique" => unique(
                Param::with_default("case_sensitive", false),
                Param::optional("attribute")
            ),
            "upper" => upper(),
            "urlencode" => urlencode(),
            "wordcount" => wordcount(),
            "wordwrap" => wordwrap(
                Param::with_default("width", 79),
                Param::with_default("break_long_words", true),
                Param::with_default("wrapstring", "\n")
            ),
            "xmlattr" => xmlattr(Param::with_default("autospace", true)),
        }
    });

// ===== Conversion helpers =====

fn as_sequence(base: &Value) -> Result<Vec<Value>, Error> {
    base.try_iterate()
        .map(Iterator::collect)
        .map_err(ErrorKind::into_error)
}

fn as_string(base: Value) -> Result<String, Error> {
    String::try_from_value(base).map_err(ErrorKind::into_error)
}

fn arg<T: TryFromValue>(args: &EvaluatedArgs, name: &str) -> Result<T, Error> {
    T::try_from_value(args.get(name).clone())
        .map_err(ErrorKind::into_error)
}

/// Project a value through an `attribute=` argument if one was given
fn maybe_project(value: &Value, attribute: &Value) -> Value {
    if attribute.is_empty() {
        value.clone()
    } else {
        subscript(value, attribute).unwrap_or_default()
    }
}

/// Key used for ordering comparisons: optionally projected, optionally
/// case-folded
fn sort_key(value: &Value, attribute: &Value, case_sensitive: bool) -> Value {
    let projected = maybe_project(value, attribute);
    match projected {
        Value::String(s) if !case_sensitive => {
            Value::String(s.as_str().to_lowercase().into())
        }
        other => other,
    }
}

fn compare_keys(a: &Value, b: &Value) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

// ===== Scalar filters =====

fn abs(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    match base {
        Value::Int(i) => Ok(Value::Int(i.abs())),
        Value::Double(d) => Ok(Value::Double(d.abs())),
        other => Err(ErrorKind::invalid_type(format!(
            "abs() needs a number, got '{}'",
            other.type_name()
        ))
        .into_error()),
    }
}

fn attr(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    subscript(&base, args.get("name")).map_err(ErrorKind::into_error)
}

fn capitalize(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let s = as_string(base)?;
    let mut chars = s.chars();
    let capitalized = match chars.next() {
        Some(head) => {
            head.to_uppercase().collect::<String>()
                + &chars.as_str().to_lowercase()
        }
        None => String::new(),
    };
    Ok(capitalized.into())
}

fn center(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let s = as_string(base)?;
    let width: usize = arg(args, "width")?;
    let length = s.chars().count();
    if length >= width {
        return Ok(s.into());
    }
    let total = width - length;
    let left = total / 2;
    Ok(format!(
        "{}{}{}",
        " ".repeat(left),
        s,
        " ".repeat(total - left)
    )
    .into())
}

fn default(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let boolean: bool = arg(args, "boolean")?;
    if base.is_empty() || (boolean && !base.truthy()) {
        Ok(args.get("default_value").clone())
    } else {
        Ok(base)
    }
}

fn escape(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    if base.is_safe() {
        return Ok(base);
    }
    let s = as_string(base)?;
    Ok(Value::safe_string(escape_html(&s)))
}

fn forceescape(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let s = as_string(base)?;
    Ok(Value::safe_string(escape_html(&s)))
}

fn filesizeformat(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let size: f64 = f64::try_from_value(base).map_err(ErrorKind::into_error)?;
    let binary: bool = arg(args, "binary")?;
    let (step, units): (f64, &[&str]) = if binary {
        (1024.0, &["KiB", "MiB", "GiB", "TiB", "PiB"])
    } else {
        (1000.0, &["kB", "MB", "GB", "TB", "PB"])
    };
    if size.abs() < step {
        let bytes = size as i64;
        let suffix = if bytes == 1 { "Byte" } else { "Bytes" };
        return Ok(format!("{bytes} {suffix}").into());
    }
    let mut value = size;
    let mut unit = "";
    for candidate in units.iter().copied() {
        value /= step;
        unit = candidate;
        if value.abs() < step {
            break;
        }
    }
    Ok(format!("{value:.1} {unit}").into())
}

fn to_float(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let converted = match &base {
        Value::Int(i) => Some(*i as f64),
        Value::Double(d) => Some(*d),
        Value::Bool(b) => Some(f64::from(*b)),
        Value::String(s) => s.as_str().trim().parse().ok(),
        _ => None,
    };
    match converted {
        Some(f) => Ok(Value::Double(f)),
        None => Ok(args.get("default").clone()),
    }
}

fn to_int(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let base_radix: i64 = arg(args, "base")?;
    let converted = match &base {
        Value::Int(i) => Some(*i),
        Value::Double(d) => Some(*d as i64),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => {
            let trimmed = s.as_str().trim();
            i64::from_str_radix(
                trimmed.trim_start_matches("0x").trim_start_matches("0b"),
                base_radix as u32,
            )
            .ok()
            .or_else(|| {
                // Fall back through float syntax, like Python int(float(s))
                trimmed.parse::<f64>().ok().map(|f| f as i64)
            })
        }
        _ => None,
    };
    match converted {
        Some(i) => Ok(Value::Int(i)),
        None => Ok(args.get("default").clone()),
    }
}

fn format_filter(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let template = as_string(base)?;
    let mut positional = args.varargs.iter();
    let mut output = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            output.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => output.push('%'),
            Some('s') => {
                let value = positional.next().ok_or_else(|| {
                    ErrorKind::invalid_type(
                        "not enough arguments for format string",
                    )
                    .into_error()
                })?;
                output.push_str(&value.to_string());
            }
            Some('d') => {
                let value = positional.next().cloned().unwrap_or_default();
                let i =
                    i64::try_from_value(value).map_err(ErrorKind::into_error)?;
                output.push_str(&i.to_string());
            }
            Some('f') => {
                let value = positional.next().cloned().unwrap_or_default();
                let f =
                    f64::try_from_value(value).map_err(ErrorKind::into_error)?;
                output.push_str(&format!("{f:.6}"));
            }
            Some(other) => {
                return Err(ErrorKind::invalid_type(format!(
                    "unsupported format directive '%{other}'"
                ))
                .into_error());
            }
            None => output.push('%'),
        }
    }
    Ok(output.into())
}

fn indent(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let s = as_string(base)?;
    let width: usize = arg(args, "width")?;
    let indent_first: bool = arg(args, "first")?;
    let indent_blank: bool = arg(args, "blank")?;
    let pad = " ".repeat(width);
    let indented = s
        .split('\n')
        .enumerate()
        .map(|(i, line)| {
            let skip = (i == 0 && !indent_first)
                || (line.is_empty() && !indent_blank);
            if skip {
                line.to_owned()
            } else {
                format!("{pad}{line}")
            }
        })
        .join("\n");
    Ok(indented.into())
}

fn lower(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    Ok(as_string(base)?.to_lowercase().into())
}

fn upper(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    Ok(as_string(base)?.to_uppercase().into())
}

fn title(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let s = as_string(base)?;
    let mut output = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            if at_word_start {
                output.extend(c.to_uppercase());
            } else {
                output.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            output.push(c);
            at_word_start = true;
        }
    }
    Ok(output.into())
}

fn trim(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let s = as_string(base)?;
    let trimmed = match args.get("chars") {
        Value::Empty => s.trim().to_owned(),
        chars => {
            let set: Vec<char> = chars.to_string().chars().collect();
            s.trim_matches(|c| set.contains(&c)).to_owned()
        }
    };
    Ok(trimmed.into())
}

fn replace(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let s = as_string(base)?;
    let old: String = arg(args, "old")?;
    let new: String = arg(args, "new")?;
    let count: Option<i64> = arg(args, "count")?;
    let replaced = match count {
        Some(count) if count >= 0 => s.replacen(&old, &new, count as usize),
        _ => s.replace(&old, &new),
    };
    Ok(replaced.into())
}

fn truncate(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let s = as_string(base)?;
    let length: usize = arg(args, "length")?;
    let killwords: bool = arg(args, "killwords")?;
    let end: String = arg(args, "end")?;
    let leeway: usize = arg(args, "leeway")?;

    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= length + leeway {
        return Ok(s.into());
    }
    let cut = length.saturating_sub(end.chars().count());
    let head: String = chars[..cut].iter().collect();
    let truncated = if killwords {
        head
    } else {
        match head.rfind(' ') {
            Some(space) => head[..space].to_owned(),
            None => head,
        }
    };
    Ok(format!("{truncated}{end}").into())
}

fn wordcount(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    static WORDS: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\w+").unwrap());
    let s = as_string(base)?;
    Ok(Value::Int(WORDS.find_iter(&s).count() as i64))
}

fn wordwrap(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let s = as_string(base)?;
    let width: usize = arg(args, "width")?;
    let break_long: bool = arg(args, "break_long_words")?;
    let wrapstring: String = arg(args, "wrapstring")?;

    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    for word in s.split_whitespace() {
        let word_len = word.chars().count();
        let current_len = current.chars().count();
        if current.is_empty() {
            current = word.to_owned();
        } else if current_len + 1 + word_len <= width {
            current.push(' ');
            current.push_str(word);
        } else {
            lines.push(std::mem::take(&mut current));
            current = word.to_owned();
        }
        // Hard-split words longer than a whole line
        while break_long && current.chars().count() > width {
            let head: String = current.chars().take(width).collect();
            let tail: String = current.chars().skip(width).collect();
            lines.push(head);
            current = tail;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    Ok(lines.join(&wrapstring).into())
}

fn striptags(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    static TAGS: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
    let s = as_string(base)?;
    let stripped = TAGS.replace_all(&s, "");
    Ok(stripped.split_whitespace().join(" ").into())
}

fn safe(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let s = as_string(base)?;
    Ok(Value::safe_string(s))
}

fn to_string_filter(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    Ok(as_string(base)?.into())
}

fn pprint(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    Ok(crate::value::repr(&base).into())
}

fn round(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let value: f64 = f64::try_from_value(base).map_err(ErrorKind::into_error)?;
    let precision: i64 = arg(args, "precision")?;
    let method: String = arg(args, "method")?;
    let factor = 10f64.powi(precision as i32);
    let scaled = value * factor;
    let rounded = match method.as_str() {
        "common" => scaled.round(),
        "ceil" => scaled.ceil(),
        "floor" => scaled.floor(),
        other => {
            return Err(ErrorKind::invalid_type(format!(
                "unknown rounding method '{other}'"
            ))
            .into_error());
        }
    };
    Ok(Value::Double(rounded / factor))
}

fn urlencode(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    /// Keep the characters Jinja leaves unescaped in path segments
    const QUERY: &AsciiSet = &NON_ALPHANUMERIC
        .remove(b'.')
        .remove(b'-')
        .remove(b'_')
        .remove(b'~')
        .remove(b'/');
    fn encode(s: &str) -> String {
        utf8_percent_encode(s, QUERY).to_string()
    }

    match &base {
        Value::Map(map) => {
            let encoded = map
                .iter_pairs()
                .map(|pair| {
                    format!(
                        "{}={}",
                        encode(&pair.key),
                        encode(&pair.value.to_string())
                    )
                })
                .join("&");
            Ok(encoded.into())
        }
        _ => Ok(encode(&as_string(base)?).into()),
    }
}

// ===== Sequence filters =====

fn first(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    match &base {
        Value::KeyValuePair(pair) => {
            Ok(Value::String(pair.key.clone().into()))
        }
        _ => Ok(as_sequence(&base)?.into_iter().next().unwrap_or_default()),
    }
}

fn last(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    match &base {
        Value::KeyValuePair(pair) => Ok(pair.value.clone()),
        _ => Ok(as_sequence(&base)?.into_iter().next_back().unwrap_or_default()),
    }
}

fn length(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    base.len().map(|len| Value::Int(len as i64)).ok_or_else(|| {
        ErrorKind::invalid_type(format!(
            "'{}' has no length",
            base.type_name()
        ))
        .into_error()
    })
}

fn to_list_filter(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    Ok(Value::List(List::from_values(as_sequence(&base)?)))
}

fn batch(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let linecount: usize = arg(args, "linecount")?;
    if linecount == 0 {
        return Err(
            ErrorKind::invalid_type("batch size must be positive").into_error()
        );
    }
    let fill = args.get("fill_with");
    let items = as_sequence(&base)?;
    let rows = items
        .chunks(linecount)
        .map(|chunk| {
            let mut row = chunk.to_vec();
            if !fill.is_empty() {
                while row.len() < linecount {
                    row.push(fill.clone());
                }
            }
            Value::List(List::from_values(row))
        })
        .collect();
    Ok(Value::List(List::from_values(rows)))
}

fn slice_filter(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let slices: usize = arg(args, "slices")?;
    if slices == 0 {
        return Err(
            ErrorKind::invalid_type("slice count must be positive").into_error()
        );
    }
    let fill = args.get("fill_with");
    let items = as_sequence(&base)?;
    let per_slice = items.len() / slices;
    let with_extra = items.len() % slices;

    let mut result = Vec::with_capacity(slices);
    let mut offset = 0;
    for index in 0..slices {
        let mut size = per_slice;
        if index < with_extra {
            size += 1;
        }
        let mut column: Vec<Value> =
            items[offset..offset + size].to_vec();
        if !fill.is_empty() && index >= with_extra && with_extra > 0 {
            column.push(fill.clone());
        }
        offset += size;
        result.push(Value::List(List::from_values(column)));
    }
    Ok(Value::List(List::from_values(result)))
}

fn join(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let delimiter: String = arg(args, "d")?;
    let attribute = args.get("attribute");
    let joined = as_sequence(&base)?
        .iter()
        .map(|item| maybe_project(item, attribute).to_string())
        .join(&delimiter);
    Ok(joined.into())
}

fn reverse(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    match &base {
        Value::String(s) => {
            Ok(s.chars().rev().collect::<String>().into())
        }
        _ => {
            let mut items = as_sequence(&base)?;
            items.reverse();
            Ok(Value::List(List::from_values(items)))
        }
    }
}

fn sort(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let reverse: bool = arg(args, "reverse")?;
    let case_sensitive: bool = arg(args, "case_sensitive")?;
    let attribute = args.get("attribute");
    let mut items = as_sequence(&base)?;
    items.sort_by(|a, b| {
        let ordering = compare_keys(
            &sort_key(a, attribute, case_sensitive),
            &sort_key(b, attribute, case_sensitive),
        );
        if reverse { ordering.reverse() } else { ordering }
    });
    Ok(Value::List(List::from_values(items)))
}

fn unique(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let case_sensitive: bool = arg(args, "case_sensitive")?;
    let attribute = args.get("attribute");
    let items = as_sequence(&base)?;
    let mut seen: Vec<Value> = Vec::new();
    let mut result = Vec::new();
    for item in items {
        let key = sort_key(&item, attribute, case_sensitive);
        if !seen.contains(&key) {
            seen.push(key);
            result.push(item);
        }
    }
    Ok(Value::List(List::from_values(result)))
}

fn sum(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let attribute = args.get("attribute");
    let start = args.get("start").clone();
    let list = List::try_from_value(base).map_err(ErrorKind::into_error)?;
    let values = if attribute.is_empty() {
        list
    } else {
        // A read-only projected view over the base list
        List::new(SubscriptedList::new(list, attribute.clone()))
    };
    values.iter().try_fold(start, |acc, item| {
        crate::value::arithmetic(
            crate::expression::BinaryOp::Add,
            &acc,
            &item,
        )
        .map_err(ErrorKind::into_error)
    })
}

fn max_filter(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let case_sensitive: bool = arg(args, "case_sensitive")?;
    let attribute = args.get("attribute");
    let items = as_sequence(&base)?;
    Ok(items
        .into_iter()
        .max_by(|a, b| {
            compare_keys(
                &sort_key(a, attribute, case_sensitive),
                &sort_key(b, attribute, case_sensitive),
            )
        })
        .unwrap_or_default())
}

fn min_filter(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let case_sensitive: bool = arg(args, "case_sensitive")?;
    let attribute = args.get("attribute");
    let items = as_sequence(&base)?;
    Ok(items
        .into_iter()
        .min_by(|a, b| {
            compare_keys(
                &sort_key(a, attribute, case_sensitive),
                &sort_key(b, attribute, case_sensitive),
            )
        })
        .unwrap_or_default())
}

fn random(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let items = as_sequence(&base)?;
    if items.is_empty() {
        return Ok(Value::Empty);
    }
    let index = rand::thread_rng().gen_range(0..items.len());
    Ok(items[index].clone())
}

fn groupby(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let attribute = args.get("attribute");
    let items = as_sequence(&base)?;
    // Group adjacent-or-not items while preserving first-seen order
    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
    for item in items {
        let key = maybe_project(&item, attribute);
        match groups.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, members)) => members.push(item),
            None => groups.push((key, vec![item])),
        }
    }
    groups.sort_by(|(a, _), (b, _)| compare_keys(a, b));
    let result = groups
        .into_iter()
        .map(|(grouper, members)| {
            Value::from(vec![
                ("grouper".to_owned(), grouper),
                ("list".to_owned(), Value::List(List::from_values(members))),
            ])
        })
        .collect();
    Ok(Value::List(List::from_values(result)))
}

// ===== Map filters =====

fn items(base: Value, _: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let map = Map::try_from_value(base).map_err(ErrorKind::into_error)?;
    Ok(Value::List(List::from_values(
        map.iter_pairs().map(Value::from).collect(),
    )))
}

fn dictsort(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let case_sensitive: bool = arg(args, "case_sensitive")?;
    let by: String = arg(args, "by")?;
    let reverse: bool = arg(args, "reverse")?;
    let map = Map::try_from_value(base).map_err(ErrorKind::into_error)?;

    let mut pairs: Vec<KeyValuePair> = map.iter_pairs().collect();
    pairs.sort_by(|a, b| {
        let (ka, kb) = match by.as_str() {
            "value" => (a.value.clone(), b.value.clone()),
            _ => (
                Value::String(a.key.clone().into()),
                Value::String(b.key.clone().into()),
            ),
        };
        let ordering = compare_keys(
            &sort_key(&ka, &Value::Empty, case_sensitive),
            &sort_key(&kb, &Value::Empty, case_sensitive),
        );
        if reverse { ordering.reverse() } else { ordering }
    });
    Ok(Value::List(List::from_values(
        pairs.into_iter().map(Value::from).collect(),
    )))
}

fn xmlattr(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let autospace: bool = arg(args, "autospace")?;
    let map = Map::try_from_value(base).map_err(ErrorKind::into_error)?;
    let rendered = map
        .iter_pairs()
        .filter(|pair| !pair.value.is_empty())
        .map(|pair| {
            format!(
                "{}=\"{}\"",
                escape_html(&pair.key),
                escape_html(&pair.value.to_string())
            )
        })
        .join(" ");
    if rendered.is_empty() {
        return Ok(Value::safe_string(""));
    }
    let prefix = if autospace { " " } else { "" };
    Ok(Value::safe_string(format!("{prefix}{rendered}")))
}

// ===== Higher-order filters =====

fn map_filter(base: Value, args: &EvaluatedArgs, context: &mut RenderContext<'_>) -> Result<Value, Error> {
    let attribute = args.get("attribute");
    let items = as_sequence(&base)?;
    if !attribute.is_empty() {
        let fallback = args.get("default");
        let mapped = items
            .iter()
            .map(|item| {
                let projected = maybe_project(item, attribute);
                if projected.is_empty() && !fallback.is_empty() {
                    fallback.clone()
                } else {
                    projected
                }
            })
            .collect();
        return Ok(Value::List(List::from_values(mapped)));
    }

    let mut varargs = args.varargs.clone();
    if varargs.is_empty() {
        return Err(ErrorKind::invalid_type(
            "map() needs a filter name or attribute=",
        )
        .into_error());
    }
    let name = as_string(varargs.remove(0))?;
    let mapped = items
        .into_iter()
        .map(|item| {
            apply_named(&name, item, varargs.clone(), context)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::List(List::from_values(mapped)))
}

/// Shared machinery of select/reject: keep items for which the named
/// tester (default: truthiness) says `keep`
fn filter_by_test(
    base: Value,
    varargs: &[Value],
    keep: bool,
    context: &mut RenderContext<'_>,
) -> Result<Value, Error> {
    let items = as_sequence(&base)?;
    let mut varargs = varargs.to_vec();
    let test = if varargs.is_empty() {
        None
    } else {
        Some(as_string(varargs.remove(0))?)
    };
    let mut result = Vec::new();
    for item in items {
        let passed = match &test {
            None => item.truthy(),
            Some(name) => {
                testers::apply_named(name, &item, varargs.clone(), context)?
            }
        };
        if passed == keep {
            result.push(item);
        }
    }
    Ok(Value::List(List::from_values(result)))
}

fn select(base: Value, args: &EvaluatedArgs, context: &mut RenderContext<'_>) -> Result<Value, Error> {
    filter_by_test(base, &args.varargs, true, context)
}

fn reject(base: Value, args: &EvaluatedArgs, context: &mut RenderContext<'_>) -> Result<Value, Error> {
    filter_by_test(base, &args.varargs, false, context)
}

/// Shared machinery of selectattr/rejectattr: project the attribute first,
/// then test it (default: truthiness)
fn filter_by_attr(
    base: Value,
    varargs: &[Value],
    keep: bool,
    context: &mut RenderContext<'_>,
) -> Result<Value, Error> {
    let items = as_sequence(&base)?;
    let mut varargs = varargs.to_vec();
    if varargs.is_empty() {
        return Err(ErrorKind::invalid_type(
            "selectattr()/rejectattr() need an attribute name",
        )
        .into_error());
    }
    let attribute = varargs.remove(0);
    let test = if varargs.is_empty() {
        None
    } else {
        Some(as_string(varargs.remove(0))?)
    };
    let mut result = Vec::new();
    for item in items {
        let projected = subscript(&item, &attribute)
            .map_err(ErrorKind::into_error)?;
        let passed = match &test {
            None => projected.truthy(),
            Some(name) => testers::apply_named(
                name,
                &projected,
                varargs.clone(),
                context,
            )?,
        };
        if passed == keep {
            result.push(item);
        }
    }
    Ok(Value::List(List::from_values(result)))
}

fn selectattr(base: Value, args: &EvaluatedArgs, context: &mut RenderContext<'_>) -> Result<Value, Error> {
    filter_by_attr(base, &args.varargs, true, context)
}

fn rejectattr(base: Value, args: &EvaluatedArgs, context: &mut RenderContext<'_>) -> Result<Value, Error> {
    filter_by_attr(base, &args.varargs, false, context)
}

// ===== Serialization =====

fn tojson(base: Value, args: &EvaluatedArgs, _: &mut RenderContext<'_>) -> Result<Value, Error> {
    let indent: Option<i64> = arg(args, "indent")?;
    let json = match indent {
        Some(indent) if indent > 0 => {
            let pad = " ".repeat(indent as usize);
            let mut buffer = Vec::new();
            let formatter = serde_json::ser::PrettyFormatter::with_indent(
                pad.as_bytes(),
            );
            let mut serializer = serde_json::Serializer::with_formatter(
                &mut buffer,
                formatter,
            );
            base.serialize(&mut serializer)
                .map_err(|error| ErrorKind::exception(error).into_error())?;
            String::from_utf8(buffer)
                .map_err(|error| ErrorKind::exception(error).into_error())?
        }
        _ => serde_json::to_string(&base)
            .map_err(|error| ErrorKind::exception(error).into_error())?,
    };
    Ok(Value::safe_string(json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValuesMap;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use vellum_util::assert_err;

    fn apply_filter(source_value: Value, name: &str, extra: Vec<Value>) -> Result<Value, Error> {
        let values = ValuesMap::new();
        let mut context = RenderContext::new(&values, None, false);
        apply_named(name, source_value, extra, &mut context)
    }

    fn ok(source_value: Value, name: &str, extra: Vec<Value>) -> Value {
        apply_filter(source_value, name, extra)
            .unwrap_or_else(|error| panic!("{name} failed: {error}"))
    }

    #[rstest]
    #[case::abs_int(Value::Int(-5), "abs", vec![], Value::Int(5))]
    #[case::capitalize("hELLO".into(), "capitalize", vec![], "Hello".into())]
    #[case::center("ab".into(), "center", vec![Value::Int(6)], "  ab  ".into())]
    #[case::default_kept(Value::Int(1), "default", vec![Value::Int(9)], Value::Int(1))]
    #[case::default_used(Value::Empty, "default", vec![Value::Int(9)], Value::Int(9))]
    #[case::first(vec![1, 2, 3].into(), "first", vec![], Value::Int(1))]
    #[case::last(vec![1, 2, 3].into(), "last", vec![], Value::Int(3))]
    #[case::length_string("héllo".into(), "length", vec![], Value::Int(5))]
    #[case::length_list(vec![1, 2].into(), "count", vec![], Value::Int(2))]
    #[case::int_from_string("42".into(), "int", vec![], Value::Int(42))]
    #[case::int_bad_default("x".into(), "int", vec![], Value::Int(0))]
    #[case::float_from_string("2.5".into(), "float", vec![], Value::Double(2.5))]
    #[case::join(
        vec!["a", "b"].into(),
        "join",
        vec![", ".into()],
        "a, b".into()
    )]
    #[case::lower("AbC".into(), "lower", vec![], "abc".into())]
    #[case::upper("abc".into(), "upper", vec![], "ABC".into())]
    #[case::title("over the top".into(), "title", vec![], "Over The Top".into())]
    #[case::trim("  x  ".into(), "trim", vec![], "x".into())]
    #[case::replace(
        "aaa".into(),
        "replace",
        vec!["a".into(), "b".into(), Value::Int(2)],
        "bba".into()
    )]
    #[case::reverse_string("abc".into(), "reverse", vec![], "cba".into())]
    #[case::reverse_list(
        vec![1, 2, 3].into(),
        "reverse",
        vec![],
        vec![3, 2, 1].into()
    )]
    #[case::round(Value::Double(2.345), "round", vec![Value::Int(2)], Value::Double(2.35))]
    #[case::round_floor(
        Value::Double(2.9),
        "round",
        vec![Value::Int(0), "floor".into()],
        Value::Double(2.0)
    )]
    #[case::sum(vec![1, 2, 3].into(), "sum", vec![], Value::Int(6))]
    #[case::max(vec![3, 1, 2].into(), "max", vec![], Value::Int(3))]
    #[case::min(vec![3, 1, 2].into(), "min", vec![], Value::Int(1))]
    #[case::unique(
        vec!["a", "A", "b"].into(),
        "unique",
        vec![],
        vec!["a", "b"].into()
    )]
    #[case::wordcount("two words".into(), "wordcount", vec![], Value::Int(2))]
    #[case::striptags(
        "<b>bold</b>  text".into(),
        "striptags",
        vec![],
        "bold text".into()
    )]
    #[case::urlencode("a b/c".into(), "urlencode", vec![], "a%20b/c".into())]
    #[case::filesize(Value::Int(1_500_000), "filesizeformat", vec![], "1.5 MB".into())]
    #[case::filesize_small(Value::Int(1), "filesizeformat", vec![], "1 Byte".into())]
    #[case::string_roundtrip(Value::Int(-3), "string", vec![], "-3".into())]
    #[case::indent(
        "a\nb".into(),
        "indent",
        vec![Value::Int(2)],
        "a\n  b".into()
    )]
    #[case::truncate(
        "foo bar baz qux quux corge".into(),
        "truncate",
        vec![Value::Int(11)],
        "foo bar...".into()
    )]
    #[case::wordwrap(
        "aa bb cc".into(),
        "wordwrap",
        vec![Value::Int(5)],
        "aa bb\ncc".into()
    )]
    fn test_filter(
        #[case] base: Value,
        #[case] name: &str,
        #[case] extra: Vec<Value>,
        #[case] expected: Value,
    ) {
        assert_eq!(ok(base, name, extra), expected);
    }

    #[test]
    fn test_escape_marks_safe() {
        let escaped = ok("<b>".into(), "escape", vec![]);
        assert!(escaped.is_safe());
        assert_eq!(escaped.to_string(), "&lt;b&gt;");
        // Escaping an already-safe value is a no-op
        let again = ok(escaped, "escape", vec![]);
        assert_eq!(again.to_string(), "&lt;b&gt;");
        // forceescape escapes regardless
        let forced = ok(Value::safe_string("<b>"), "forceescape", vec![]);
        assert_eq!(forced.to_string(), "&lt;b&gt;");
    }

    #[test]
    fn test_batch_and_slice() {
        let items: Value = vec![1, 2, 3, 4, 5].into();
        assert_eq!(
            ok(items.clone(), "batch", vec![Value::Int(2)]),
            Value::from(vec![
                Value::from(vec![1, 2]),
                Value::from(vec![3, 4]),
                Value::from(vec![5]),
            ])
        );
        assert_eq!(
            ok(items, "slice", vec![Value::Int(2)]),
            Value::from(vec![
                Value::from(vec![1, 2, 3]),
                Value::from(vec![4, 5]),
            ])
        );
    }

    #[test]
    fn test_dictsort() {
        let map: Value = vec![("b", 2), ("a", 1), ("C", 3)].into();
        let sorted = ok(map, "dictsort", vec![]);
        let keys: Vec<String> = Vec::<Value>::try_from_value(sorted)
            .unwrap()
            .into_iter()
            .map(|pair| match pair {
                Value::KeyValuePair(pair) => pair.key,
                other => panic!("expected a pair, got {other:?}"),
            })
            .collect();
        assert_eq!(keys, vec!["a", "b", "C"]);
    }

    #[test]
    fn test_sort_with_attribute() {
        let users: Value = vec![
            Value::from(vec![("age", 30)]),
            Value::from(vec![("age", 20)]),
        ]
        .into();
        let sorted = ok(
            users,
            "sort",
            vec![Value::Bool(false), Value::Bool(false), "age".into()],
        );
        let ages: Vec<Value> = Vec::<Value>::try_from_value(sorted)
            .unwrap()
            .into_iter()
            .map(|user| subscript(&user, &"age".into()).unwrap())
            .collect();
        assert_eq!(ages, vec![Value::Int(20), Value::Int(30)]);
    }

    #[test]
    fn test_map_with_filter_name() {
        let items: Value = vec!["a", "b"].into();
        assert_eq!(
            ok(items, "map", vec!["upper".into()]),
            Value::from(vec!["A", "B"])
        );
    }

    #[test]
    fn test_select_reject() {
        let numbers: Value = vec![1, 2, 3, 4].into();
        assert_eq!(
            ok(numbers.clone(), "select", vec!["odd".into()]),
            Value::from(vec![1, 3])
        );
        assert_eq!(
            ok(numbers, "reject", vec!["odd".into()]),
            Value::from(vec![2, 4])
        );
    }

    #[test]
    fn test_selectattr() {
        let users: Value = vec![
            Value::from(vec![("name", Value::from("a")), ("admin", Value::Bool(true))]),
            Value::from(vec![("name", Value::from("b")), ("admin", Value::Bool(false))]),
        ]
        .into();
        let admins = ok(users, "selectattr", vec!["admin".into()]);
        let as_vec = Vec::<Value>::try_from_value(admins).unwrap();
        assert_eq!(as_vec.len(), 1);
    }

    #[test]
    fn test_groupby() {
        let rows: Value = vec![
            Value::from(vec![("city", Value::from("b")), ("n", Value::Int(1))]),
            Value::from(vec![("city", Value::from("a")), ("n", Value::Int(2))]),
            Value::from(vec![("city", Value::from("b")), ("n", Value::Int(3))]),
        ]
        .into();
        let groups = ok(rows, "groupby", vec!["city".into()]);
        let groups = Vec::<Value>::try_from_value(groups).unwrap();
        assert_eq!(groups.len(), 2);
        let Value::Map(first_group) = &groups[0] else {
            panic!("expected a map");
        };
        assert_eq!(first_group.get("grouper"), Some(Value::from("a")));
    }

    #[test]
    fn test_tojson() {
        let value: Value = vec![("a", Value::Int(1))].into();
        let json = ok(value, "tojson", vec![]);
        assert!(json.is_safe());
        assert_eq!(json.to_string(), r#"{"a":1}"#);
    }

    #[test]
    fn test_length_of_number_fails() {
        assert_err!(
            apply_filter(Value::Int(3), "length", vec![]),
            "has no length"
        );
    }

    #[test]
    fn test_unknown_filter() {
        assert_err!(
            apply_filter(Value::Int(3), "zzz", vec![]),
            "Unexpected token 'zzz'"
        );
    }
}
