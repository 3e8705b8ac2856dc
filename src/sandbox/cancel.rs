//! Cancellation and deadlines for running evaluations.
//!
//! A [`Context`] carries a cancellation token and an optional deadline. While
//! an evaluation runs under a context, the interpreter hook checks it every
//! few hundred instructions and on every call/return, and aborts the script
//! once the context is done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mlua::{HookTriggers, Lua, Thread, VmState};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SandboxError;
use crate::sandbox::instance::Instance;

/// Cancellation signal for an evaluation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never done unless cancelled explicitly.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// A context that is done once `deadline` passes.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Wrap an existing token, e.g. one shared with other tasks.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Tighten the deadline to at most `timeout` from now.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// A context cancelled together with this one, which can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel this context and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The underlying token, for wiring into other cancellable work.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<SandboxError> {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Some(SandboxError::DeadlineExceeded);
        }
        if self.token.is_cancelled() {
            return Some(SandboxError::Cancelled);
        }
        None
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }
}

/// A context armed on an instance: what the interpreter hook checks.
#[derive(Clone)]
pub struct ArmedHook {
    ctx: Context,
    interval: u32,
    interrupted: Arc<AtomicBool>,
}

impl ArmedHook {
    /// Check `ctx` every `interval` instructions and set `interrupted` when
    /// the script is aborted.
    pub fn new(ctx: &Context, interval: u32, interrupted: Arc<AtomicBool>) -> Self {
        Self {
            ctx: ctx.clone(),
            interval: interval.max(1),
            interrupted,
        }
    }

    fn triggers(&self) -> HookTriggers {
        HookTriggers::new()
            .on_calls()
            .on_returns()
            .every_nth_instruction(self.interval)
    }

    fn callback(
        &self,
    ) -> impl Fn(&Lua, mlua::Debug<'_>) -> mlua::Result<VmState> + Send + Sync + 'static {
        let ctx = self.ctx.clone();
        let interrupted = Arc::clone(&self.interrupted);
        move |_lua, _debug| match ctx.err() {
            Some(err) => {
                if !interrupted.swap(true, Ordering::AcqRel) {
                    debug!(reason = %err, "interrupting evaluation");
                }
                Err(mlua::Error::external(err))
            }
            None => Ok(VmState::Continue),
        }
    }

    /// Point the hook at `thread`. The interpreter runs one hooked thread at
    /// a time, so a resumed coroutine takes the hook over from its caller
    /// and the caller has to take it back once the coroutine stops.
    pub fn install(&self, thread: &Thread) {
        thread.set_hook(self.triggers(), self.callback());
    }
}

/// The hook currently armed on an instance, shared with the sandbox's
/// coroutine wrappers.
#[derive(Clone, Default)]
pub struct HookSlot(Arc<Mutex<Option<ArmedHook>>>);

impl HookSlot {
    /// The hook of the evaluation in progress, if it runs under a context.
    pub fn current(&self) -> Option<ArmedHook> {
        self.lock().clone()
    }

    fn set(&self, armed: Option<ArmedHook>) {
        *self.lock() = armed;
    }

    fn lock(&self) -> MutexGuard<'_, Option<ArmedHook>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Extension trait for attaching a context to an interpreter state.
pub trait ContextHookExt {
    /// Install a hook on the main thread that raises the context's error
    /// once it is done and sets the interrupt flag when it does.
    fn attach_context(&self, armed: &ArmedHook);

    /// Remove the hook.
    fn detach_context(&self);
}

impl ContextHookExt for Lua {
    fn attach_context(&self, armed: &ArmedHook) {
        self.set_hook(armed.triggers(), armed.callback());
    }

    fn detach_context(&self) {
        self.remove_hook();
    }
}

/// Keeps a context attached to a borrowed instance for one evaluation.
///
/// Dropping the guard detaches the hook and clears the interrupt flag, so the
/// instance goes back to the pool without a stale signal.
pub struct CancelGuard<'a> {
    instance: &'a Instance,
}

impl<'a> CancelGuard<'a> {
    /// Attach `ctx` to `instance` until the guard drops.
    pub fn arm(instance: &'a Instance, ctx: &Context, interval: u32) -> Self {
        let interrupted = instance.interrupted();
        interrupted.store(false, Ordering::Release);
        let armed = ArmedHook::new(ctx, interval, Arc::clone(interrupted));
        instance.lua().attach_context(&armed);
        instance.hook_slot().set(Some(armed));
        Self { instance }
    }

    /// Whether the hook aborted the script at least once.
    pub fn interrupted(&self) -> bool {
        self.instance.interrupted().load(Ordering::Acquire)
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        self.instance.hook_slot().set(None);
        self.instance.lua().detach_context();
        self.instance.interrupted().store(false, Ordering::Release);
    }
}
