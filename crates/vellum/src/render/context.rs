//! The render context: a stack of scope frames over the caller-provided
//! external values, plus the autoescape flag, loop-control signal and the
//! active inheritance chain.

use crate::{
    environment::{self, Environment},
    error::{Error, ErrorKind},
    template::Inheritance,
    value::{Value, ValuesMap},
};

/// One level of the name-resolution stack
struct Scope {
    vars: ValuesMap,
    /// A barrier hides every frame between this one and the template scope.
    /// Macro bodies and non-scoped blocks run behind a barrier so they see
    /// their own parameters plus template-level names, but not the caller's
    /// locals.
    barrier: bool,
}

/// Control-flow signal raised by `{% break %}` / `{% continue %}`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum LoopInterrupt {
    Break,
    Continue,
}

/// State of a single render call. Created per render; never shared across
/// threads.
pub struct RenderContext<'a> {
    external: &'a ValuesMap,
    env: Option<&'a Environment>,
    scopes: Vec<Scope>,
    autoescape: bool,
    interrupt: Option<LoopInterrupt>,
    pub(crate) inheritance: Option<Inheritance>,
}

impl<'a> RenderContext<'a> {
    pub fn new(
        external: &'a ValuesMap,
        env: Option<&'a Environment>,
        autoescape: bool,
    ) -> Self {
        Self {
            external,
            env,
            scopes: vec![Scope {
                vars: ValuesMap::new(),
                barrier: false,
            }],
            autoescape,
            interrupt: None,
            inheritance: None,
        }
    }

    /// Look up a name: innermost scope outward (respecting barriers), then
    /// the template scope, the external values, environment globals and
    /// finally the built-in globals
    pub fn lookup(&self, name: &str) -> Option<Value> {
        for (level, scope) in self.scopes.iter().enumerate().rev() {
            if let Some(value) = scope.vars.get(name) {
                return Some(value.clone());
            }
            if scope.barrier && level > 0 {
                // Jump straight to the template scope
                if let Some(value) = self.scopes[0].vars.get(name) {
                    return Some(value.clone());
                }
                break;
            }
        }
        if let Some(value) = self.external.get(name) {
            return Some(value.clone());
        }
        if let Some(value) =
            self.env.and_then(|env| env.global(name))
        {
            return Some(value);
        }
        environment::builtin_global(name)
    }

    /// Bind a name in the innermost scope
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .vars
            .insert(name.into(), value);
    }

    /// Bind a name in the template (bottom) scope, where macro and
    /// top-level `set` definitions live
    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.scopes[0].vars.insert(name.into(), value);
    }

    /// Snapshot of the template scope, used by `import` to build the
    /// namespace of a loaded template
    pub(crate) fn template_scope(&self) -> &ValuesMap {
        &self.scopes[0].vars
    }

    /// The caller-provided external values
    pub(crate) fn external(&self) -> &'a ValuesMap {
        self.external
    }

    /// Run `f` inside a fresh scope frame. The frame is popped when `f`
    /// returns, error or not, keeping enter/exit strictly LIFO.
    pub fn scoped<T>(
        &mut self,
        barrier: bool,
        f: impl FnOnce(&mut Self) -> T,
    ) -> T {
        self.scopes.push(Scope {
            vars: ValuesMap::new(),
            barrier,
        });
        let result = f(self);
        self.scopes.pop();
        result
    }

    pub fn autoescape(&self) -> bool {
        self.autoescape
    }

    /// Switch autoescaping, returning the previous mode so the caller can
    /// restore it
    pub fn set_autoescape(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.autoescape, enabled)
    }

    pub fn env(&self) -> Option<&'a Environment> {
        self.env
    }

    /// The environment, or the error every loading statement raises
    /// without one
    pub fn require_env(&self) -> Result<&'a Environment, Error> {
        self.env
            .ok_or_else(|| ErrorKind::TemplateEnvAbsent.into_error())
    }

    pub(crate) fn signal(&mut self, interrupt: LoopInterrupt) {
        self.interrupt = Some(interrupt);
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.is_some()
    }

    pub(crate) fn take_interrupt(&mut self) -> Option<LoopInterrupt> {
        self.interrupt.take()
    }
}
