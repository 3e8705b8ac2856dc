//! Compiled expressions and the evaluation protocol.

use std::sync::{Arc, Mutex};

use mlua::Function;
use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::sandbox::cancel::{CancelGuard, Context};
use crate::sandbox::instance::Instance;
use crate::sandbox::pool::{checkout, InstancePool};
use crate::value::{Env, Value};

/// Wrap expression text into a chunk that receives its environment as the
/// first argument and yields exactly one value.
///
/// The expression body runs inside a non-vararg function, so `...` is a
/// syntax error. The newline keeps a trailing `--` comment from swallowing
/// the closing parenthesis.
pub(crate) fn wrap_source(source: &str) -> String {
    format!("local _ENV = ... return (function() return ({source}\n) end)()")
}

/// The expression alone, for checking that it does not close the wrapper
/// early and smuggle statements in after it.
pub(crate) fn bare_source(source: &str) -> String {
    format!("return ({source}\n)")
}

/// The chunk materialized in the instance that served the last evaluation.
struct Materialized {
    instance: u64,
    function: Function,
}

struct Inner {
    chunk: String,
    sandboxed: bool,
    hook_interval: u32,
    pool: Arc<dyn InstancePool>,
    cache: Mutex<Option<Materialized>>,
}

/// A compiled expression.
///
/// Cheap to clone and safe to share between threads. Each evaluation checks
/// out an instance from the engine's pool and returns it before the call
/// completes, on every path.
///
/// Evaluating after the engine was closed fails with
/// [`SandboxError::EngineClosed`]; closing the engine while evaluations are
/// still running is a caller error.
#[derive(Clone)]
pub struct CompiledExpr {
    inner: Arc<Inner>,
}

impl CompiledExpr {
    pub(crate) fn new(
        chunk: String,
        sandboxed: bool,
        hook_interval: u32,
        pool: Arc<dyn InstancePool>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                chunk,
                sandboxed,
                hook_interval,
                pool,
                cache: Mutex::new(None),
            }),
        }
    }

    /// Whether this expression runs inside the sandbox.
    pub fn is_sandboxed(&self) -> bool {
        self.inner.sandboxed
    }

    /// Evaluate with the given bindings.
    pub fn eval(&self, env: Option<&Env>) -> Result<Value> {
        let instance = checkout(self.inner.pool.as_ref(), None)?;
        self.run(&instance, env)
    }

    /// Evaluate and apply Lua truthiness to the result.
    pub fn eval_bool(&self, env: Option<&Env>) -> Result<bool> {
        self.eval(env).map(|value| value.is_truthy())
    }

    /// Evaluate under a context. The evaluation is aborted with
    /// [`SandboxError::DeadlineExceeded`] or [`SandboxError::Cancelled`] once
    /// the context is done. Waiting for a pool slot is bounded by the context
    /// as well.
    ///
    /// Slower than [`eval`](Self::eval), since the interpreter runs with a hook.
    pub fn eval_context(&self, ctx: &Context, env: Option<&Env>) -> Result<Value> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let instance = checkout(self.inner.pool.as_ref(), Some(ctx))?;
        let guard = CancelGuard::arm(&instance, ctx, self.inner.hook_interval);
        let result = self.run(&instance, env);

        let interrupted = guard.interrupted();
        drop(guard);
        match ctx.err() {
            Some(err) if interrupted || result.is_err() => {
                debug!(instance = instance.id(), reason = %err, "evaluation cancelled");
                Err(err)
            }
            _ => result,
        }
    }

    /// [`eval_context`](Self::eval_context) with Lua truthiness applied.
    pub fn eval_context_bool(&self, ctx: &Context, env: Option<&Env>) -> Result<bool> {
        self.eval_context(ctx, env).map(|value| value.is_truthy())
    }

    /// Run [`eval_context`](Self::eval_context) on tokio's blocking pool.
    ///
    /// Dropping the returned future cancels the evaluation.
    pub async fn eval_async(&self, ctx: &Context, env: Env) -> Result<Value> {
        let ctx = ctx.child();
        let _cancel_on_drop = ctx.token().clone().drop_guard();
        let expr = self.clone();
        let handle = tokio::task::spawn_blocking(move || expr.eval_context(&ctx, Some(&env)));
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(SandboxError::ExecutionFailed(format!("task panicked: {}", e))),
        }
    }

    fn run(&self, instance: &Instance, env: Option<&Env>) -> Result<Value> {
        let function = self.materialize(instance)?;
        let result = instance.call(&function, env);
        self.remember(instance, function);
        result
    }

    /// Take the cached chunk if it belongs to `instance`, otherwise load it.
    fn materialize(&self, instance: &Instance) -> Result<Function> {
        let cached = self.lock_cache().take();
        match cached {
            Some(cached) if cached.instance == instance.id() => Ok(cached.function),
            _ => instance.materialize(&self.inner.chunk),
        }
    }

    fn remember(&self, instance: &Instance, function: Function) {
        *self.lock_cache() = Some(Materialized {
            instance: instance.id(),
            function,
        });
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, Option<Materialized>> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for CompiledExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledExpr")
            .field("sandboxed", &self.inner.sandboxed)
            .finish_non_exhaustive()
    }
}
