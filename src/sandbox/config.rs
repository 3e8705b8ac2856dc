//! Engine configuration with builder pattern.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use mlua::{Lua, Table};

use crate::value::Env;

/// Built-in capabilities an expression may use when no allowlist is given.
///
/// String, math, table and basic control-flow primitives. No I/O, no process
/// control, no module loading, no `load`/`dofile`, no metatable access.
pub const DEFAULT_ALLOWED_FUNCTIONS: &str = "
  _VERSION assert error    ipairs   next pairs
  pcall    select tonumber tostring type xpcall
  coroutine.create coroutine.resume coroutine.running coroutine.status
  coroutine.wrap   coroutine.yield  coroutine.isyieldable
  math.abs   math.acos  math.asin math.atan math.ceil  math.cos
  math.deg   math.exp   math.floor math.fmod math.huge math.log
  math.max   math.maxinteger math.min  math.mininteger math.modf
  math.pi    math.rad   math.random math.sin  math.sqrt math.tan
  math.tointeger math.type math.ult
  os.clock os.difftime os.time
  string.byte string.char  string.find  string.format string.gmatch
  string.gsub string.len   string.lower string.match  string.reverse
  string.sub  string.upper
  table.concat table.insert table.remove table.sort table.unpack
  utf8.char utf8.charpattern utf8.codepoint utf8.codes utf8.len utf8.offset
";

/// Default number of pooled interpreter instances.
pub const DEFAULT_POOL_SIZE: usize = 50;

/// Default number of VM instructions between cancellation checks.
pub const DEFAULT_HOOK_INSTRUCTION_INTERVAL: u32 = 1000;

/// Customization hook run once per interpreter instance.
///
/// Receives the sandbox base table, or the true global table when sandboxing
/// is disabled, and runs with full privilege.
pub type EnvFunc = Arc<dyn Fn(&Lua, &Table) -> mlua::Result<()> + Send + Sync>;

/// How interpreter instances are shared between evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// At most `n` instances, each used by one evaluation at a time.
    Bounded(NonZeroUsize),
    /// One instance shared by every evaluation, without isolation.
    Shared,
}

/// Configuration for an [`ExprEngine`](crate::ExprEngine).
#[derive(Clone)]
pub struct EngineConfig {
    /// Whether expressions run inside the allowlisted sandbox.
    pub sandbox: bool,
    /// Pool capacity. Negative selects the shared single instance, zero the default.
    pub pool_size: isize,
    /// Whitespace-separated allowlist of `global` and `module.member` names.
    pub allowed_functions: String,
    /// Optional hook that customizes each instance's environment.
    pub env_func: Option<EnvFunc>,
    /// Maximum interpreter memory in bytes, per instance.
    pub memory_limit: Option<usize>,
    /// VM instructions between cancellation checks while a context is armed.
    pub hook_instruction_interval: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sandbox: true,
            pool_size: DEFAULT_POOL_SIZE as isize,
            allowed_functions: DEFAULT_ALLOWED_FUNCTIONS.to_string(),
            env_func: None,
            memory_limit: None,
            hook_instruction_interval: DEFAULT_HOOK_INSTRUCTION_INTERVAL,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("sandbox", &self.sandbox)
            .field("pool_size", &self.pool_size)
            .field("allowed_functions", &self.allowed_functions)
            .field("env_func", &self.env_func.as_ref().map(|_| "<hook>"))
            .field("memory_limit", &self.memory_limit)
            .field("hook_instruction_interval", &self.hook_instruction_interval)
            .finish()
    }
}

impl EngineConfig {
    /// Create a new builder for EngineConfig.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Resolve `pool_size` into a pool mode. Zero falls back to [`DEFAULT_POOL_SIZE`].
    pub fn pool_mode(&self) -> PoolMode {
        if self.pool_size < 0 {
            return PoolMode::Shared;
        }
        let size = NonZeroUsize::new(self.pool_size as usize)
            .or(NonZeroUsize::new(DEFAULT_POOL_SIZE))
            .unwrap_or(NonZeroUsize::MIN);
        PoolMode::Bounded(size)
    }
}

/// Builder for creating EngineConfig instances.
#[derive(Default, Clone)]
pub struct EngineConfigBuilder {
    disable_sandbox: bool,
    pool_size: Option<isize>,
    allowed_functions: Option<String>,
    env_func: Option<EnvFunc>,
    memory_limit: Option<usize>,
    hook_instruction_interval: Option<u32>,
}

impl EngineConfigBuilder {
    /// Run expressions against the full global environment.
    ///
    /// Bindings passed to an evaluation are written into the instance's
    /// globals and stay there for later evaluations on the same instance.
    pub fn disable_sandbox(mut self) -> Self {
        self.disable_sandbox = true;
        self
    }

    /// Set the pool size. Negative values disable pooling.
    pub fn pool_size(mut self, size: isize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Replace the allowlist.
    pub fn allowed_functions(mut self, list: impl Into<String>) -> Self {
        self.allowed_functions = Some(list.into());
        self
    }

    /// Set the customization hook. Replaces any hook set by [`env`](Self::env).
    pub fn env_func<F>(mut self, f: F) -> Self
    where
        F: Fn(&Lua, &Table) -> mlua::Result<()> + Send + Sync + 'static,
    {
        self.env_func = Some(Arc::new(f));
        self
    }

    /// Install fixed values into every instance's environment.
    /// Replaces any hook set by [`env_func`](Self::env_func).
    pub fn env(self, env: Env) -> Self {
        self.env_func(move |_, table| env.apply(table))
    }

    /// Cap each instance's memory, in bytes.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Set how many VM instructions run between cancellation checks.
    pub fn hook_instruction_interval(mut self, instructions: u32) -> Self {
        self.hook_instruction_interval = Some(instructions.max(1));
        self
    }

    /// Build the EngineConfig.
    pub fn build(self) -> EngineConfig {
        let default = EngineConfig::default();
        EngineConfig {
            sandbox: !self.disable_sandbox,
            pool_size: self.pool_size.unwrap_or(default.pool_size),
            allowed_functions: self.allowed_functions.unwrap_or(default.allowed_functions),
            env_func: self.env_func,
            memory_limit: self.memory_limit.or(default.memory_limit),
            hook_instruction_interval: self
                .hook_instruction_interval
                .unwrap_or(default.hook_instruction_interval),
        }
    }
}
