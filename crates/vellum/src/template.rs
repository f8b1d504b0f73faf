//! The compiled template: an immutable renderer tree plus the block table
//! and parent reference that drive inheritance. Compiled templates are
//! shared via `Arc` and safe to render concurrently, each render with its
//! own context and sink.

use crate::{
    error::{Error, ErrorKind, SourceLocation},
    expression::Expression,
    render::{BlockStatement, Renderer, RenderContext},
    value::{Map, Value},
};
use indexmap::IndexMap;
use itertools::Itertools;
use std::{fmt::Write, sync::Arc};
use tracing::trace;

/// Upper bound on the `extends` chain, to catch cyclic inheritance
const MAX_INHERITANCE_DEPTH: usize = 64;

pub(crate) struct CompiledTemplate {
    pub name: String,
    /// The template owns its source for its lifetime; raw-text renderers
    /// hold ranges into this buffer
    pub source: Arc<str>,
    pub renderers: Renderer,
    /// All blocks declared anywhere in the template, by name
    pub blocks: IndexMap<String, Arc<BlockStatement>>,
    /// `{% extends expr %}`, if present
    pub extends: Option<(Expression, SourceLocation)>,
    /// Raw text of the `{% meta %}` block, parsed lazily as JSON
    pub meta: Option<String>,
}

impl CompiledTemplate {
    /// Render against an existing context. Resolves the `extends` chain
    /// first: an extending template runs the root parent's sequence with
    /// every block resolved to its most-derived implementation.
    pub fn render_with_context(
        self: &Arc<Self>,
        out: &mut dyn Write,
        context: &mut RenderContext<'_>,
    ) -> Result<(), Error> {
        let chain = self.inheritance_chain(context)?;
        // The inheritance state is per-template: save whatever an outer
        // render (e.g. an include inside an extended template) had active
        let saved = context.inheritance.take();

        let result = if chain.len() == 1 {
            self.renderers.render(out, context)
        } else {
            trace!(
                template = self.name,
                depth = chain.len(),
                "rendering inheritance chain"
            );
            let block_names: Vec<String> = chain
                .iter()
                .flat_map(|template| template.blocks.keys().cloned())
                .unique()
                .collect();
            context.inheritance = Some(Inheritance {
                chain: chain.clone(),
                stack: Vec::new(),
            });
            context.set_global(
                "self",
                Value::Map(Map::new(crate::render::SelfNamespace::new(
                    block_names,
                ))),
            );
            // Non-root members contribute their top-level definitions
            // (macros, sets, imports) but emit no output of their own
            chain[1..]
                .iter()
                .try_for_each(|template| {
                    template.renderers.render_module(context)
                })
                .and_then(|()| chain[0].renderers.render(out, context))
        };

        context.inheritance = saved;
        result
    }

    /// Walk `extends` references, loading each parent through the
    /// environment. Returns the chain root-first; a template with no
    /// parent yields a single-element chain.
    fn inheritance_chain(
        self: &Arc<Self>,
        context: &mut RenderContext<'_>,
    ) -> Result<Vec<Arc<Self>>, Error> {
        let mut chain = vec![Arc::clone(self)];
        let mut current = Arc::clone(self);
        while let Some((parent_expr, location)) = current.extends.clone() {
            if chain.len() >= MAX_INHERITANCE_DEPTH {
                return Err(ErrorKind::invalid_type(
                    "inheritance chain too deep (cyclic extends?)",
                )
                .into_error()
                .or_located_at(&location));
            }
            let env = context
                .require_env()
                .map_err(|error| error.or_located_at(&location))?;
            let value = parent_expr
                .evaluate(context)
                .map_err(|error| error.or_located_at(&location))?;
            let Value::String(name) = value else {
                return Err(ErrorKind::InvalidTemplateName {
                    name: value.to_string(),
                }
                .at(location));
            };
            let parent = env
                .load_compiled(name.as_str())
                .map_err(|error| error.or_located_at(&location))?;
            chain.push(Arc::clone(&parent));
            current = parent;
        }
        // Root first: rendering starts from the base template
        chain.reverse();
        Ok(chain)
    }
}

/// Active inheritance state of a render: the template chain (root first)
/// and the stack of block invocations, which `super()` walks
pub(crate) struct Inheritance {
    pub chain: Vec<Arc<CompiledTemplate>>,
    pub stack: Vec<BlockFrame>,
}

/// One active block invocation: which block, at which chain level
pub(crate) struct BlockFrame {
    pub name: String,
    pub level: usize,
}

impl Inheritance {
    /// Find the most-derived implementation of `name` strictly below
    /// `below` in the chain. Pass `usize::MAX` for the most-derived
    /// overall.
    pub fn resolve(
        &self,
        name: &str,
        below: usize,
    ) -> Option<(usize, Arc<BlockStatement>)> {
        let limit = below.min(self.chain.len());
        self.chain[..limit]
            .iter()
            .enumerate()
            .rev()
            .find_map(|(level, template)| {
                template
                    .blocks
                    .get(name)
                    .map(|block| (level, Arc::clone(block)))
            })
    }
}
