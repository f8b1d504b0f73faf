//! End-to-end rendering tests: whole templates in, rendered text out.
//! Per-module behavior is covered next to each module; these exercise the
//! pipeline as a user sees it.

use crate::{
    Environment, GeneratorList, List, MapProvider, MemoryFileSystem,
    Template, Value, ValuesMap,
};
use pretty_assertions::assert_eq;
use proptest::proptest;
use rstest::rstest;
use std::sync::Arc;
use vellum_util::{assert_err, assert_matches};

/// Render a standalone template against key/value pairs
fn render(source: &str, values: &[(&str, Value)]) -> String {
    let template = Template::parse(source, None)
        .unwrap_or_else(|error| panic!("parse failed: {error}"));
    let values: ValuesMap = values
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect();
    template
        .render_to_string(&values)
        .unwrap_or_else(|error| panic!("render failed: {error}"))
}

/// An environment backed by an in-memory file set
fn environment(files: &[(&str, &str)]) -> Environment {
    let fs = Arc::new(MemoryFileSystem::new());
    for (name, content) in files {
        fs.add_file(*name, *content);
    }
    let mut env = Environment::new();
    env.add_filesystem_handler("", fs);
    env
}

fn render_in_env(
    files: &[(&str, &str)],
    entry: &str,
    values: &[(&str, Value)],
) -> String {
    let env = environment(files);
    let template = env
        .load(entry)
        .unwrap_or_else(|error| panic!("load failed: {error}"));
    let values: ValuesMap = values
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect();
    template
        .render_to_string(&values)
        .unwrap_or_else(|error| panic!("render failed: {error}"))
}

/// A template with no tags renders byte-for-byte
#[rstest]
#[case::plain("just text, nothing else")]
#[case::trailing_newline("line\n")]
#[case::multiline("a\nb\r\nc\n\n")]
#[case::braces_alone("a { b } c")]
fn test_identity(#[case] source: &str) {
    assert_eq!(render(source, &[]), source);
}

#[rstest]
#[case::expression("{{ 1 + 2 }}", "3")]
#[case::variable("Hello {{ name }}!", "Hello Mike!")]
#[case::attribute("{{ user.name }}", "Mike")]
#[case::index("{{ items[1] }}", "b")]
#[case::negative_index("{{ items[-1] }}", "c")]
#[case::string_index("{{ 'abc'[1] }}", "b")]
#[case::undefined_renders_empty("[{{ missing }}]", "[]")]
#[case::comment("a{# ignored {{ name }} #}b", "ab")]
#[case::concat("{{ 1 ~ '+' ~ 2 }}", "1+2")]
#[case::ternary("{{ 'y' if name == 'Mike' else 'n' }}", "y")]
#[case::ternary_no_else("[{{ 'y' if false }}]", "[]")]
#[case::tuple("{{ (1, 'a') }}", "[1, 'a']")]
#[case::dict("{{ {'k': 1} }}", "{'k': 1}")]
#[case::bool_output("{{ 1 < 2 }}:{{ 1 > 2 }}", "true:false")]
#[case::in_operator("{{ 'el' in 'hello' }}", "true")]
#[case::is_tester("{{ 10 is divisibleby(5) }}", "true")]
#[case::float_output("{{ 6 / 4 }}", "1.5")]
#[case::floor_div("{{ 7 // 2 }}", "3")]
#[case::power("{{ 2 ** 8 }}", "256")]
fn test_expressions(#[case] source: &str, #[case] expected: &str) {
    let values = [
        ("name", Value::from("Mike")),
        ("user", Value::from(vec![("name", "Mike")])),
        ("items", Value::from(vec!["a", "b", "c"])),
    ];
    assert_eq!(render(source, &values), expected);
}

/// Whitespace control: `-` strips adjacent whitespace, `+` preserves it
#[rstest]
#[case::minus("A\n  {%- if true %}B{% endif %}\nC", "AB\nC")]
#[case::plus("A\n  {%+ if true %}B{% endif %}\nC", "A\n  B\nC")]
#[case::expression_markers("A {{- 'B' -}} C", "ABC")]
fn test_whitespace_control(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(render(source, &[]), expected);
}

#[rstest]
#[case::empty_takes_else(
    "{% for x in [] %}{{x}}{% else %}empty{% endfor %}",
    "empty"
)]
#[case::non_empty(
    "{% for x in [1,2,3] %}{{x}}{% endfor %}",
    "123"
)]
#[case::loop_introspection(
    "{% for x in [10,20] %}{{loop.index}}:{{loop.first}}:{{loop.last}} {% endfor %}",
    "1:true:false 2:false:true "
)]
#[case::loop_revindex(
    "{% for x in 'ab' %}{{ loop.revindex }}{% endfor %}",
    "21"
)]
#[case::loop_neighbors(
    "{% for x in [1,2,3] %}[{{ loop.previtem }}<{{ x }}>{{ loop.nextitem }}]{% endfor %}",
    "[<1>2][1<2>3][2<3>]"
)]
#[case::loop_cycle(
    "{% for x in [1,2,3] %}{{ loop.cycle('a', 'b') }}{% endfor %}",
    "aba"
)]
#[case::condition(
    "{% for x in [1,2,3,4] if x % 2 == 0 %}{{x}}{% endfor %}",
    "24"
)]
#[case::unpack_pairs(
    "{% for k, v in {'a': 1, 'b': 2} %}{{k}}={{v}};{% endfor %}",
    "a=1;b=2;"
)]
#[case::unpack_tuples(
    "{% for a, b in [[1,2],[3,4]] %}({{a}},{{b}}){% endfor %}",
    "(1,2)(3,4)"
)]
#[case::nested_loops(
    "{% for x in [1,2] %}{% for y in 'ab' %}{{x}}{{y}} {% endfor %}{% endfor %}",
    "1a 1b 2a 2b "
)]
#[case::iterate_map_single_var(
    "{% for item in {'a': 1} %}{{ item.key }}:{{ item.value }}{% endfor %}",
    "a:1"
)]
fn test_for(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(render(source, &[]), expected);
}

/// A recursive loop re-enters its own body via `loop(children)`
#[test]
fn test_for_recursive() {
    let tree = Value::from(vec![
        Value::from(vec![
            ("name".to_owned(), Value::from("a")),
            (
                "children".to_owned(),
                Value::from(vec![Value::from(vec![
                    ("name".to_owned(), Value::from("b")),
                    ("children".to_owned(), Value::from(Vec::<Value>::new())),
                ])]),
            ),
        ]),
    ]);
    let rendered = render(
        "{% for node in tree recursive %}({{ node.name }}@{{ loop.depth }}{{ loop(node.children) }}){% endfor %}",
        &[("tree", tree)],
    );
    assert_eq!(rendered, "(a@1(b@2))");
}

#[rstest]
#[case::if_true("{% if 1 < 2 %}yes{% endif %}", "yes")]
#[case::if_false("{% if 1 > 2 %}yes{% endif %}", "")]
#[case::elif_chain(
    "{% if x == 1 %}one{% elif x == 2 %}two{% else %}many{% endif %}",
    "two"
)]
#[case::truthiness_empty_list("{% if [] %}y{% else %}n{% endif %}", "n")]
fn test_if(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(render(source, &[("x", Value::Int(2))]), expected);
}

#[rstest]
#[case::set_inline("{% set v = 3 * 4 %}{{ v }}", "12")]
#[case::set_multi("{% set a, b = [1, 2] %}{{ a }}{{ b }}", "12")]
#[case::set_block("{% set v %}literal {{ 1 + 1 }}{% endset %}{{ v }}", "literal 2")]
#[case::set_block_filtered(
    "{% set v | upper %}abc{% endset %}{{ v }}",
    "ABC"
)]
#[case::with_scope(
    "{% with a = 1 %}{{ a }}{% endwith %}[{{ a }}]",
    "1[]"
)]
#[case::with_sequential_bindings(
    "{% with a = 1, b = a + 1 %}{{ b }}{% endwith %}",
    "2"
)]
fn test_set_and_with(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(render(source, &[]), expected);
}

/// `{% set v = E %}{{ v }}` renders the same as `{{ E }}` directly
#[rstest]
#[case::arith("1 + 2 * 3")]
#[case::filtered("'text' | upper")]
#[case::list_literal("[1, 2] | join('-')")]
fn test_set_transparency(#[case] expression: &str) {
    let direct = render(&format!("{{{{ {expression} }}}}"), &[]);
    let via_set = render(
        &format!("{{% set v = {expression} %}}{{{{ v }}}}"),
        &[],
    );
    assert_eq!(direct, via_set);
}

#[rstest]
#[case::basic(
    "{% macro greet(name) %}Hi {{ name }}!{% endmacro %}{{ greet('Ann') }}",
    "Hi Ann!"
)]
#[case::default_arg(
    "{% macro greet(name='world') %}Hi {{ name }}!{% endmacro %}{{ greet() }}",
    "Hi world!"
)]
#[case::keyword_args(
    "{% macro box(w, h=1) %}{{ w }}x{{ h }}{% endmacro %}{{ box(h=2, w=3) }}",
    "3x2"
)]
#[case::introspection(
    "{% macro m(a, b=2) %}{{ name }}:{{ arguments | join(',') }}{% endmacro %}{{ m(1) }}",
    "m:a,b"
)]
#[case::varargs(
    "{% macro m(a) %}{{ a }}+{{ varargs | join(',') }}{% endmacro %}{{ m(1, 2, 3) }}",
    "1+2,3"
)]
#[case::caller(
    "{% macro wrap(tag) %}<{{tag}}>{{ caller() }}</{{tag}}>{% endmacro %}{% call wrap('b') %}hi{% endcall %}",
    "<b>hi</b>"
)]
#[case::call_with_params(
    "{% macro each(items) %}{% for i in items %}{{ caller(i) }}{% endfor %}{% endmacro %}{% call(item) each([1,2]) %}[{{ item }}]{% endcall %}",
    "[1][2]"
)]
fn test_macros(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(render(source, &[]), expected);
}

/// Macro bodies don't see the caller's locals, only template scope and
/// their own parameters
#[test]
fn test_macro_scope_isolation() {
    let rendered = render(
        "{% macro m() %}[{{ hidden }}]{% endmacro %}\
         {% with hidden = 'x' %}{{ m() }}{% endwith %}",
        &[],
    );
    assert_eq!(rendered, "[]");
}

#[rstest]
#[case::chain("{{ 'hello' | upper | replace('L', '!') }}", "HE!!O")]
#[case::precedence_vs_comparison("{{ -30 | abs < '20' | int }}", "false")]
#[case::filter_block(
    "{% filter upper %}shout {{ 'it' }}{% endfilter %}",
    "SHOUT IT"
)]
#[case::filter_block_chain(
    "{% filter trim | lower %}  ABC  {% endfilter %}",
    "abc"
)]
#[case::string_roundtrip("{{ 12345 | string | int }}", "12345")]
#[case::list_roundtrip("{{ 'abc' | list | join('') }}", "abc")]
#[case::length_of_lazy("{{ range(5) | length }}", "5")]
#[case::dictsort_keys(
    "{{ {'b': 1, 'a': 2, 'c': 0} | dictsort | map('first') | join('') }}",
    "abc"
)]
#[case::dictsort_contains(
    "{{ ('a', 2) in ({'b': 1, 'a': 2} | dictsort) }}",
    "true"
)]
fn test_filters_in_templates(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(render(source, &[]), expected);
}

// ===== Inheritance =====

#[test]
fn test_extends_with_super() {
    let rendered = render_in_env(
        &[
            ("p", "[{% block b %}base{% endblock %}]"),
            ("c", "{% extends \"p\" %}{% block b %}child+{{ super() }}{% endblock %}"),
        ],
        "c",
        &[],
    );
    assert_eq!(rendered, "[child+base]");
}

#[test]
fn test_extends_three_levels() {
    let rendered = render_in_env(
        &[
            ("root", "({% block b %}0{% endblock %})"),
            ("mid", "{% extends 'root' %}{% block b %}1>{{ super() }}{% endblock %}"),
            ("leaf", "{% extends 'mid' %}{% block b %}2>{{ super() }}{% endblock %}"),
        ],
        "leaf",
        &[],
    );
    assert_eq!(rendered, "(2>1>0)");
}

/// Only blocks survive from an extending template; other top-level output
/// is dropped
#[test]
fn test_extends_drops_stray_content() {
    let rendered = render_in_env(
        &[
            ("p", "[{% block b %}base{% endblock %}]"),
            ("c", "{% extends 'p' %}IGNORED{% block b %}x{% endblock %}IGNORED"),
        ],
        "c",
        &[],
    );
    assert_eq!(rendered, "[x]");
}

/// A `scoped` block sees the loop variables at its declaration site; a
/// plain block doesn't
#[test]
fn test_block_scoping() {
    let files = [
        (
            "p_scoped",
            "{% for i in [1,2] %}{% block item scoped %}{% endblock %}{% endfor %}",
        ),
        (
            "c_scoped",
            "{% extends 'p_scoped' %}{% block item %}<{{ i }}>{% endblock %}",
        ),
        (
            "p_plain",
            "{% for i in [1,2] %}{% block item %}{% endblock %}{% endfor %}",
        ),
        (
            "c_plain",
            "{% extends 'p_plain' %}{% block item %}<{{ i }}>{% endblock %}",
        ),
    ];
    assert_eq!(render_in_env(&files, "c_scoped", &[]), "<1><2>");
    assert_eq!(render_in_env(&files, "c_plain", &[]), "<><>");
}

/// `self.X()` dispatches to the most-derived implementation of block X
#[test]
fn test_self_dispatch() {
    let rendered = render_in_env(
        &[
            (
                "p",
                "{% block title %}t{% endblock %}:{% block body %}{{ self.title() }}!{% endblock %}",
            ),
            (
                "c",
                "{% extends 'p' %}{% block title %}Override{% endblock %}",
            ),
        ],
        "c",
        &[],
    );
    assert_eq!(rendered, "Override:Override!");
}

/// A block outside any extends chain renders inline
#[test]
fn test_block_inline() {
    assert_eq!(render("a{% block b %}c{% endblock %}d", &[]), "acd");
}

// ===== Include / import =====

#[rstest]
#[case::simple("{% include 'part' %}", "part:Mike")]
#[case::without_context("{% include 'part' without context %}", "part:")]
#[case::first_existing(
    "{% include ['missing', 'part'] %}",
    "part:Mike"
)]
#[case::ignore_missing("a{% include 'missing' ignore missing %}b", "ab")]
fn test_include(#[case] entry_body: &str, #[case] expected: &str) {
    let rendered = render_in_env(
        &[("entry", entry_body), ("part", "part:{{ name }}")],
        "entry",
        &[("name", Value::from("Mike"))],
    );
    assert_eq!(rendered, expected);
}

#[rstest]
#[case::namespace(
    "{% import 'macros' as m %}{{ m.hi('Bob') }}",
    "Hi Bob!"
)]
#[case::from_import(
    "{% from 'macros' import hi %}{{ hi('Ann') }}",
    "Hi Ann!"
)]
#[case::from_import_alias(
    "{% from 'macros' import hi as greet %}{{ greet('Jo') }}",
    "Hi Jo!"
)]
#[case::imported_set(
    "{% import 'macros' as m %}{{ m.version }}",
    "7"
)]
fn test_import(#[case] entry_body: &str, #[case] expected: &str) {
    let rendered = render_in_env(
        &[
            ("entry", entry_body),
            (
                "macros",
                "{% macro hi(n) %}Hi {{ n }}!{% endmacro %}{% set version = 7 %}",
            ),
        ],
        "entry",
        &[],
    );
    assert_eq!(rendered, expected);
}

// ===== Autoescape =====

#[test]
fn test_autoescape() {
    let mut env = environment(&[]);
    env.settings_mut().autoescape = true;
    let template = env
        .template_from_string(
            "{{ payload }}|{{ payload | safe }}|{% autoescape false %}{{ payload }}{% endautoescape %}",
            None,
        )
        .unwrap();
    let mut values = ValuesMap::new();
    values.insert("payload".into(), "<b>".into());
    assert_eq!(
        template.render_to_string(&values).unwrap(),
        "&lt;b&gt;|<b>|<b>"
    );
}

/// `escape` escapes even when autoescape is off
#[test]
fn test_explicit_escape() {
    assert_eq!(render("{{ '<b>' | e }}", &[]), "&lt;b&gt;");
}

// ===== Extensions =====

#[test]
fn test_do_extension() {
    // Disabled by default
    assert_err!(
        Template::parse("{% do 1 %}", None),
        "Extension 'do' is disabled"
    );

    let mut env = environment(&[]);
    env.settings_mut().do_extension = true;
    let template = env
        .template_from_string("a{% do 1 + 1 %}b", None)
        .unwrap();
    assert_eq!(
        template.render_to_string(&ValuesMap::new()).unwrap(),
        "ab"
    );
}

#[test]
fn test_loop_controls() {
    assert_err!(
        Template::parse("{% for x in [1] %}{% break %}{% endfor %}", None),
        "Extension 'loopcontrols' is disabled"
    );

    let mut env = environment(&[]);
    env.settings_mut().loop_controls = true;
    let source = "{% for x in [1,2,3,4] %}\
        {% if x == 3 %}{% break %}{% endif %}{{ x }}\
        {% endfor %}|\
        {% for x in [1,2,3] %}\
        {% if x == 2 %}{% continue %}{% endif %}{{ x }}\
        {% endfor %}";
    let template = env.template_from_string(source, None).unwrap();
    assert_eq!(
        template.render_to_string(&ValuesMap::new()).unwrap(),
        "12|13"
    );
}

// ===== Metadata =====

#[test]
fn test_metadata() {
    let template = Template::parse(
        "a{% meta %}{\"author\": \"me\", \"tags\": [1, 2]}{% endmeta %}b",
        None,
    )
    .unwrap();
    // The meta block is removed from render output
    assert_eq!(
        template.render_to_string(&ValuesMap::new()).unwrap(),
        "ab"
    );
    let meta = template.metadata().unwrap();
    assert_eq!(
        meta,
        Value::from(vec![
            ("author".to_owned(), Value::from("me")),
            ("tags".to_owned(), Value::from(vec![1, 2])),
        ])
    );
}

#[test]
fn test_metadata_absent() {
    let template = Template::parse("no meta here", None).unwrap();
    assert_err!(template.metadata(), "no metadata block");
}

// ===== Line statements =====

#[test]
fn test_line_statement() {
    assert_eq!(render("# set x = 42\n{{ x }}", &[]), "42");
}

// ===== Errors =====

#[rstest]
#[case::unknown_statement(
    "{% frobnicate %}",
    "Unexpected statement 'frobnicate'"
)]
#[case::unbalanced("{% if true %}x", "Expected: 'endif'")]
#[case::mismatched_closer("{% for x in [1] %}{% endif %}", "Unexpected statement 'endif'")]
#[case::stray_else("{% else %}", "Unexpected statement 'else'")]
#[case::marker_mismatch("{% if x #}{% endif %}", "error")]
#[case::bad_expression("{{ 1 + }}", "Expression expected")]
fn test_parse_errors(#[case] source: &str, #[case] message: &str) {
    assert_err!(Template::parse(source, None), message);
}

#[test]
fn test_parse_error_location() {
    let error =
        Template::parse("line 1\n{{ bad + }}", Some("tpl.j2")).unwrap_err();
    let rendered = error.to_string();
    assert!(
        rendered.starts_with("tpl.j2:2:"),
        "unexpected location in: {rendered}"
    );
}

#[test]
fn test_template_not_found() {
    let rendered = render_in_env(&[("entry", "ok")], "entry", &[]);
    assert_eq!(rendered, "ok");

    let env = environment(&[("entry", "{% include 'gone' %}")]);
    let template = env.load("entry").unwrap();
    assert_err!(
        template.render_to_string(&ValuesMap::new()),
        "Template 'gone' not found"
    );
}

#[test]
fn test_env_absent() {
    let template =
        Template::parse("{% include 'other' %}", None).unwrap();
    assert_err!(
        template.render_to_string(&ValuesMap::new()),
        "Template environment doesn't set"
    );
}

#[test]
fn test_render_error_stringifies_with_location() {
    let env = environment(&[("entry", "x\n{% include 'gone' %}")]);
    let template = env.load("entry").unwrap();
    let error = template.render_to_string(&ValuesMap::new()).unwrap_err();
    assert_eq!(
        error.to_string(),
        "entry:2:4: error: Template 'gone' not found"
    );
}

// ===== Provider adapters =====

/// Host data participates through the map provider contract without being
/// copied into engine values
#[test]
fn test_reflected_struct() {
    struct Point {
        x: i64,
        y: i64,
    }

    impl MapProvider for Point {
        fn size(&self) -> usize {
            2
        }

        fn contains(&self, key: &str) -> bool {
            matches!(key, "x" | "y")
        }

        fn get(&self, key: &str) -> Option<Value> {
            match key {
                "x" => Some(Value::Int(self.x)),
                "y" => Some(Value::Int(self.y)),
                _ => None,
            }
        }

        fn keys(&self) -> Vec<String> {
            vec!["x".into(), "y".into()]
        }

        fn extend_lifetime(&self) -> bool {
            true
        }
    }

    let point = crate::Map::new(Point { x: 3, y: 4 });
    let rendered = render(
        "{{ p.x }},{{ p.y }}|{% for pair in p %}{{ pair.key }} {% endfor %}",
        &[("p", Value::Map(point))],
    );
    assert_eq!(rendered, "3,4|x y ");
}

/// A lazily generated sequence iterates once through a loop; its size is
/// unknown up front
#[test]
fn test_lazy_sequence() {
    let lazy = List::new(GeneratorList::new((1..=3).map(Value::Int)));
    assert_eq!(lazy.size(), None);
    let rendered = render(
        "{% for x in xs %}{{ x }}{% endfor %}",
        &[("xs", Value::List(lazy))],
    );
    assert_eq!(rendered, "123");
}

/// Random indexing a sequence with no indexer is an error, never a silent
/// re-enumeration
#[test]
fn test_lazy_sequence_has_no_indexer() {
    let lazy = List::new(GeneratorList::new((1..=3).map(Value::Int)));
    let template = Template::parse("{{ xs[0] }}", None).unwrap();
    let mut values = ValuesMap::new();
    values.insert("xs".into(), Value::List(lazy));
    assert_err!(
        template.render_to_string(&values),
        "does not support indexed access"
    );
}

// ===== Concurrency =====

/// A compiled template is immutable and renders concurrently, each thread
/// with its own context and sink
#[test]
fn test_concurrent_render() {
    let env = environment(&[(
        "entry",
        "{% for i in range(100) %}{{ i }},{% endfor %}",
    )]);
    let template = env.load("entry").unwrap();
    let expected = template.render_to_string(&ValuesMap::new()).unwrap();

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let template = &template;
                let expected = &expected;
                scope.spawn(move || {
                    for _ in 0..10 {
                        let rendered = template
                            .render_to_string(&ValuesMap::new())
                            .unwrap();
                        assert_eq!(&rendered, expected);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    });
}

// ===== Properties =====

proptest! {
    /// Tag-free sources render back byte-for-byte
    #[test]
    fn test_identity_prop(source in "[a-zA-Z0-9 .,:;!\n-]{0,64}") {
        // Guard against generated line statements
        proptest::prop_assume!(
            !source.lines().any(|line| line.trim_start().starts_with('#'))
        );
        let rendered = render(&source, &[]);
        assert_eq!(rendered, source);
    }

    /// Every value equals itself, including across a JSON round trip
    #[test]
    fn test_value_reflexive_prop(json in proptest::arbitrary::any::<i64>()) {
        let value = Value::from_json(serde_json::json!({
            "n": json,
            "s": json.to_string(),
            "list": [json, json],
        }));
        assert_eq!(value, value.clone());
        assert_matches!(value.partial_cmp(&value), None | Some(std::cmp::Ordering::Equal));
    }
}
