/// Assert a result is the `Err` variant whose rendered message contains
/// the given fragment. Engine errors stringify as
/// `path:line:col: error: <message>`, so a fragment can match the message
/// text, the location, or both.
#[macro_export]
macro_rules! assert_err {
    ($e:expr, $msg:expr) => {{
        let msg = $msg;
        let actual = $e.unwrap_err().to_string();
        assert!(
            actual.contains(msg),
            "Expected error containing {msg:?}, got: {actual:?}"
        )
    }};
}

/// Assert a value matches a pattern. The second form additionally
/// evaluates an expression with the pattern's bindings, to extract matched
/// parts or apply follow-up assertions inline.
#[macro_export]
macro_rules! assert_matches {
    ($expr:expr, $pattern:pat $(,)?) => {
        $crate::assert_matches!($expr, $pattern => ());
    };
    ($expr:expr, $pattern:pat => $output:expr $(,)?) => {
        match $expr {
            #[allow(unused_variables)]
            $pattern => $output,
            value => panic!(
                "Value {value:?} does not match {expected}",
                expected = stringify!($pattern),
            ),
        }
    };
}
