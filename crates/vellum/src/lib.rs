//! A Jinja2-compatible text templating engine. Templates are parsed once
//! into an immutable renderer tree and can then be rendered any number of
//! times (including concurrently) against caller-supplied values.
//!
//! ```
//! use vellum::{Template, ValuesMap};
//!
//! let template = Template::parse("Hello {{ name | upper }}!", None)?;
//! let mut values = ValuesMap::new();
//! values.insert("name".into(), "world".into());
//! assert_eq!(template.render_to_string(&values)?, "Hello WORLD!");
//! # Ok::<(), vellum::Error>(())
//! ```
//!
//! Templates that reference each other (`extends`, `include`, `import`)
//! are loaded through an [Environment], which routes template names to
//! [filesystem handlers](FilesystemHandler) and caches parsed templates.

mod environment;
mod error;
mod expression;
mod filters;
mod fs;
mod parse;
mod render;
mod scan;
mod template;
mod testers;
mod value;

#[cfg(test)]
mod tests;

pub use environment::{Environment, Extension, Settings};
pub use error::{Error, ErrorKind, SourceLocation};
pub use expression::{CallParams, Expression};
pub use fs::{FilesystemHandler, MemoryFileSystem, RealFileSystem};
pub use render::RenderContext;
pub use value::{
    ArgSpec, CallArgs, Callable, CallableKind, GeneratorList, KeyValuePair,
    List, ListProvider, Map, MapProvider, Param, Str, TryFromValue, Value,
    ValuesMap,
};

use crate::template::CompiledTemplate;
use std::{fmt, sync::Arc};
use tracing::error;

/// A compiled template. Parsing happens on construction; the compiled form
/// is immutable, shareable and safe to render from multiple threads, each
/// render with its own values and sink.
#[derive(Clone)]
pub struct Template<'env> {
    inner: Arc<CompiledTemplate>,
    env: Option<&'env Environment>,
}

impl fmt::Debug for Template<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

impl Template<'static> {
    /// Parse a standalone template with default settings. Statements that
    /// load other templates (`extends`, `include`, `import`) will fail at
    /// render time without an environment; use [Environment::load] or
    /// [Environment::template_from_string] for those.
    pub fn parse(
        source: impl Into<String>,
        name: Option<&str>,
    ) -> Result<Self, Error> {
        let name = name.unwrap_or("<string>");
        let source: Arc<str> = source.into().into();
        let compiled =
            parse::compile(source, name, &Settings::default())?;
        Ok(Self {
            inner: Arc::new(compiled),
            env: None,
        })
    }

    /// Read and parse a template file, using the path as its name
    pub fn parse_file(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let source = std::fs::read_to_string(path).map_err(|_| {
            ErrorKind::FileNotFound { name: name.clone() }.into_error()
        })?;
        Self::parse(source, Some(&name))
    }
}

impl<'env> Template<'env> {
    pub(crate) fn bound(
        inner: Arc<CompiledTemplate>,
        env: &'env Environment,
    ) -> Self {
        Self {
            inner,
            env: Some(env),
        }
    }

    /// The name the template was loaded under
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Render into an output sink
    pub fn render<W: fmt::Write>(
        &self,
        out: &mut W,
        values: &ValuesMap,
    ) -> Result<(), Error> {
        let autoescape = self
            .env
            .map_or(false, |env| env.settings().autoescape);
        let mut context = RenderContext::new(values, self.env, autoescape);
        self.inner
            .render_with_context(out, &mut context)
            .inspect_err(|e| {
                error!(template = self.name(), error = %e, "render failed");
                if let Some(env) = self.env {
                    env.report_error(e);
                }
            })
    }

    /// Render to a fresh string
    pub fn render_to_string(
        &self,
        values: &ValuesMap,
    ) -> Result<String, Error> {
        let mut output = String::new();
        self.render(&mut output, values)?;
        Ok(output)
    }

    /// The parsed payload of the template's `{% meta %}` block. Fails if
    /// the template has no metadata block or its content isn't valid JSON.
    pub fn metadata(&self) -> Result<Value, Error> {
        let Some(text) = &self.inner.meta else {
            return Err(ErrorKind::invalid_type(
                "the template has no metadata block",
            )
            .into_error());
        };
        let json: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| ErrorKind::exception(e).into_error())?;
        Ok(Value::from_json(json))
    }
}
