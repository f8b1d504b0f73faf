//! The template environment: engine configuration, global values,
//! prefix-routed filesystem handlers and the coalescing template cache.

use crate::{
    error::{Error, ErrorKind},
    fs::FilesystemHandler,
    template::CompiledTemplate,
    value::{Callable, CallableKind, List, Value, ValuesMap},
    Template,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};
use tracing::{debug, trace};
use vellum_util::Mapping;

/// Engine configuration knobs
#[derive(Clone, Debug)]
pub struct Settings {
    /// Drop the first newline after a statement or comment block
    pub trim_blocks: bool,
    /// Strip leading horizontal whitespace from the line a statement
    /// marker sits on
    pub lstrip_blocks: bool,
    /// Preserve the final newline of the template source (on by default,
    /// so a template with no tags round-trips byte for byte)
    pub keep_trailing_newline: bool,
    /// Default autoescape mode for renders
    pub autoescape: bool,
    /// Enable the `{% do %}` statement
    pub do_extension: bool,
    /// Enable `{% break %}` / `{% continue %}`
    pub loop_controls: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            trim_blocks: false,
            lstrip_blocks: false,
            keep_trailing_newline: true,
            autoescape: false,
            do_extension: false,
            loop_controls: false,
        }
    }
}

/// Optional language extensions, addressable by their conventional names
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Extension {
    /// `{% do %}`
    Do,
    /// `{% break %}` / `{% continue %}`
    LoopControls,
}

const EXTENSIONS: Mapping<'static, Extension> = Mapping::new(&[
    (Extension::Do, &["do"]),
    (Extension::LoopControls, &["loopcontrols"]),
]);

impl Extension {
    /// The name the extension is addressed by, as it appears in
    /// configuration and in gate errors
    pub fn name(self) -> &'static str {
        EXTENSIONS.get_label(self)
    }
}

/// Handler invoked with every structured error the environment sees
pub type ErrorHandler = dyn Fn(&Error) + Send + Sync;

/// Cache slot for a template load. The `OnceLock` coalesces concurrent
/// loads of the same name: one thread parses, the rest block on the slot
/// and reuse its result.
type CacheSlot = Arc<OnceLock<Result<Arc<CompiledTemplate>, Error>>>;

struct FsHandler {
    prefix: String,
    handler: Arc<dyn FilesystemHandler>,
}

/// A set of loaded templates with shared configuration. Templates loaded
/// through an environment can reference each other via `extends`,
/// `include` and `import`.
#[derive(Default)]
pub struct Environment {
    settings: Settings,
    globals: ValuesMap,
    handlers: Vec<FsHandler>,
    cache: Mutex<HashMap<String, CacheSlot>>,
    error_handler: Option<Box<ErrorHandler>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Toggle a language extension by name (`"do"`, `"loopcontrols"`).
    /// An unknown name fails with an error listing the valid ones.
    pub fn set_extension(
        &mut self,
        name: &str,
        enabled: bool,
    ) -> Result<(), Error> {
        let Some(extension) = EXTENSIONS.get(name) else {
            return Err(ErrorKind::ExpectedToken {
                actual: name.to_owned(),
                expected: EXTENSIONS
                    .all_labels()
                    .map(str::to_owned)
                    .collect(),
            }
            .into_error());
        };
        match extension {
            Extension::Do => self.settings.do_extension = enabled,
            Extension::LoopControls => {
                self.settings.loop_controls = enabled;
            }
        }
        Ok(())
    }

    /// Register a filesystem handler under a path prefix. Lookups route to
    /// the handler with the longest matching prefix; ties go to the
    /// earliest registration.
    pub fn add_filesystem_handler(
        &mut self,
        prefix: impl Into<String>,
        handler: Arc<dyn FilesystemHandler>,
    ) {
        self.handlers.push(FsHandler {
            prefix: prefix.into(),
            handler,
        });
    }

    /// Register a value visible to every template
    pub fn add_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub(crate) fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Install a hook that receives every structured error raised by
    /// loads and renders through this environment
    pub fn set_error_handler(
        &mut self,
        handler: impl Fn(&Error) + Send + Sync + 'static,
    ) {
        self.error_handler = Some(Box::new(handler));
    }

    pub(crate) fn report_error(&self, error: &Error) {
        if let Some(handler) = &self.error_handler {
            handler(error);
        }
    }

    /// Load a template by name through the filesystem handlers, parsing
    /// and caching it
    pub fn load(&self, name: &str) -> Result<Template<'_>, Error> {
        self.load_compiled(name)
            .map(|inner| Template::bound(inner, self))
            .inspect_err(|error| self.report_error(error))
    }

    /// Parse template source directly against this environment's settings,
    /// without touching the cache
    pub fn template_from_string(
        &self,
        source: impl Into<String>,
        name: Option<&str>,
    ) -> Result<Template<'_>, Error> {
        let name = name.unwrap_or("<string>");
        let source: Arc<str> = source.into().into();
        let compiled = crate::parse::compile(source, name, &self.settings)
            .inspect_err(|error| self.report_error(error))?;
        Ok(Template::bound(Arc::new(compiled), self))
    }

    /// Load and parse, coalescing with concurrent loads of the same name:
    /// at most one parse runs per (name, environment)
    pub(crate) fn load_compiled(
        &self,
        name: &str,
    ) -> Result<Arc<CompiledTemplate>, Error> {
        let slot = {
            let mut cache = self.cache.lock().expect("cache lock poisoned");
            Arc::clone(cache.entry(name.to_owned()).or_default())
        };
        if let Some(cached) = slot.get() {
            debug!(name, "template cache hit");
            return cached.clone();
        }
        slot.get_or_init(|| {
            trace!(name, "loading template");
            self.load_uncached(name)
        })
        .clone()
    }

    fn load_uncached(
        &self,
        name: &str,
    ) -> Result<Arc<CompiledTemplate>, Error> {
        let source = self.open(name)?;
        let compiled =
            crate::parse::compile(source.into(), name, &self.settings)?;
        Ok(Arc::new(compiled))
    }

    /// Route a template name to its filesystem handler: longest matching
    /// prefix first, then registration order. The matched prefix is
    /// stripped before the handler sees the name.
    fn open(&self, name: &str) -> Result<String, Error> {
        let mut candidates: Vec<&FsHandler> = self
            .handlers
            .iter()
            .filter(|handler| name.starts_with(&handler.prefix))
            .collect();
        // Stable sort preserves registration order within a prefix length
        candidates.sort_by_key(|handler| std::cmp::Reverse(handler.prefix.len()));

        for candidate in candidates {
            let local_name = &name[candidate.prefix.len()..];
            if let Some(content) = candidate.handler.open_stream(local_name)
            {
                return Ok(content);
            }
            trace!(
                name,
                prefix = candidate.prefix,
                "filesystem handler had no such template"
            );
        }
        Err(ErrorKind::FileNotFound {
            name: name.to_owned(),
        }
        .into_error())
    }
}

/// Globals available in every template, environment or not
pub(crate) fn builtin_global(name: &str) -> Option<Value> {
    match name {
        "range" => Some(
            Callable::expression(CallableKind::GlobalFunc, |args, _| {
                range_global(args)
            })
            .into(),
        ),
        "dict" => Some(
            Callable::expression(CallableKind::GlobalFunc, |args, _| {
                Ok(Value::from(
                    args.keyword
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<Vec<_>>(),
                ))
            })
            .into(),
        ),
        _ => None,
    }
}

/// `range(stop)`, `range(start, stop)` or `range(start, stop, step)`
fn range_global(
    args: &crate::value::CallArgs,
) -> Result<Value, Error> {
    let int_arg = |index: usize| -> Result<i64, Error> {
        match args.positional.get(index) {
            Some(Value::Int(i)) => Ok(*i),
            Some(other) => Err(ErrorKind::invalid_type(format!(
                "range() takes integers, got '{}'",
                other.type_name()
            ))
            .into_error()),
            None => Err(ErrorKind::invalid_type(
                "range() is missing an argument",
            )
            .into_error()),
        }
    };
    let (start, stop, step) = match args.positional.len() {
        1 => (0, int_arg(0)?, 1),
        2 => (int_arg(0)?, int_arg(1)?, 1),
        3 => (int_arg(0)?, int_arg(1)?, int_arg(2)?),
        _ => {
            return Err(ErrorKind::invalid_type(
                "range() takes 1 to 3 arguments",
            )
            .into_error());
        }
    };
    if step == 0 {
        return Err(
            ErrorKind::invalid_type("range() step cannot be zero").into_error()
        );
    }
    let mut values = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        values.push(Value::Int(current));
        current += step;
    }
    Ok(Value::List(List::from_values(values)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use rstest::rstest;
    use vellum_util::assert_err;

    fn env_with_files(files: &[(&str, &str)]) -> Environment {
        let fs = Arc::new(MemoryFileSystem::new());
        for (name, content) in files {
            fs.add_file(*name, *content);
        }
        let mut env = Environment::new();
        env.add_filesystem_handler("", fs);
        env
    }

    #[test]
    fn test_load_and_cache() {
        let env = env_with_files(&[("greet.j2", "hello {{ name }}")]);
        let first = env.load_compiled("greet.j2").unwrap();
        let second = env.load_compiled("greet.j2").unwrap();
        assert!(Arc::ptr_eq(&first, &second), "expected one parse per name");
    }

    #[test]
    fn test_load_missing() {
        let env = env_with_files(&[]);
        assert_err!(env.load("nope.j2"), "File not found: 'nope.j2'");
    }

    /// The longest matching prefix wins; the prefix is stripped before the
    /// handler sees the name
    #[test]
    fn test_prefix_routing() {
        let general = Arc::new(MemoryFileSystem::new());
        general.add_file("mail/hi.j2", "general");
        let mail = Arc::new(MemoryFileSystem::new());
        mail.add_file("hi.j2", "mail");
        let mut env = Environment::new();
        env.add_filesystem_handler("", general);
        env.add_filesystem_handler("mail/", mail);

        let template = env.load("mail/hi.j2").unwrap();
        assert_eq!(
            template.render_to_string(&ValuesMap::new()).unwrap(),
            "mail"
        );
    }

    /// A handler miss falls through to the next candidate
    #[test]
    fn test_prefix_fallback() {
        let specific = Arc::new(MemoryFileSystem::new());
        let general = Arc::new(MemoryFileSystem::new());
        general.add_file("mail/only.j2", "fallback");
        let mut env = Environment::new();
        env.add_filesystem_handler("mail/", specific);
        env.add_filesystem_handler("", general);

        let template = env.load("mail/only.j2").unwrap();
        assert_eq!(
            template.render_to_string(&ValuesMap::new()).unwrap(),
            "fallback"
        );
    }

    #[test]
    fn test_error_handler_sees_load_errors() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let seen = Arc::new(AtomicUsize::new(0));
        let mut env = env_with_files(&[]);
        let counter = Arc::clone(&seen);
        env.set_error_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let _ = env.load("missing.j2");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_extension_toggle() {
        let mut env = Environment::new();
        env.set_extension("do", true).unwrap();
        assert!(env.settings().do_extension);
        env.set_extension("do", false).unwrap();
        assert!(!env.settings().do_extension);
        // Unknown names list the valid extensions
        assert_err!(
            env.set_extension("bogus", true),
            "Unexpected token 'bogus'. Expected: 'do', 'loopcontrols'"
        );
    }

    #[rstest]
    #[case::stop_only("{{ range(3) }}", "[0, 1, 2]")]
    #[case::start_stop("{{ range(1, 4) }}", "[1, 2, 3]")]
    #[case::step("{{ range(6, 0, -2) }}", "[6, 4, 2]")]
    fn test_range_global(#[case] source: &str, #[case] expected: &str) {
        let template = Template::parse(source, None).unwrap();
        assert_eq!(
            template.render_to_string(&ValuesMap::new()).unwrap(),
            expected
        );
    }
}
