//! Interpreter instances.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use mlua::{FromLua, Function, Lua};
use tracing::debug;

use crate::error::{Result, SandboxError, CHUNK_NAME};
use crate::sandbox::allowlist::Allowlist;
use crate::sandbox::builder::{HookedCoroutines, Sandbox, SandboxBuilder};
use crate::sandbox::cancel::HookSlot;
use crate::sandbox::config::EngineConfig;
use crate::value::{Env, Value};

/// Where an instance resolves global names.
enum Namespace {
    /// The allowlisted sandbox.
    Sandboxed(Sandbox),
    /// The interpreter's own global table.
    Global,
}

/// One interpreter state together with its namespace.
///
/// An instance is used by one evaluation at a time when it comes from a
/// bounded pool. Its namespace is built once and reused by every evaluation.
pub struct Instance {
    id: u64,
    lua: Lua,
    namespace: Namespace,
    interrupted: Arc<AtomicBool>,
    hooks: HookSlot,
}

impl Instance {
    /// Create an interpreter state and apply the configured namespace.
    pub fn new(id: u64, config: &EngineConfig, allowlist: &Allowlist) -> Result<Self> {
        let lua = Lua::new();
        if let Some(limit) = config.memory_limit {
            lua.set_memory_limit(limit).map_err(|e| {
                SandboxError::RuntimeInit(anyhow::anyhow!("failed to set memory limit: {}", e))
            })?;
        }

        let interrupted = Arc::new(AtomicBool::new(false));
        let hooks = HookSlot::default();
        let namespace = if config.sandbox {
            let sandbox = SandboxBuilder::new(allowlist, Arc::clone(&interrupted), hooks.clone())
                .env_func(config.env_func.as_ref())
                .build(&lua)
                .map_err(|e| {
                    SandboxError::RuntimeInit(anyhow::anyhow!("failed to build sandbox: {}", e))
                })?;
            Namespace::Sandboxed(sandbox)
        } else {
            HookedCoroutines::new(&lua, &interrupted, &hooks)
                .and_then(|coroutines| coroutines.install_globally(&lua))
                .map_err(|e| {
                    SandboxError::RuntimeInit(anyhow::anyhow!("failed to hook coroutines: {}", e))
                })?;
            if let Some(env_func) = &config.env_func {
                env_func(&lua, &lua.globals()).map_err(|e| {
                    SandboxError::RuntimeInit(anyhow::anyhow!("environment hook failed: {}", e))
                })?;
            }
            Namespace::Global
        };

        debug!(instance = id, sandboxed = config.sandbox, "created interpreter instance");
        Ok(Self {
            id,
            lua,
            namespace,
            interrupted,
            hooks,
        })
    }

    /// Pool-assigned id, unique within one engine.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying interpreter state.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn is_sandboxed(&self) -> bool {
        matches!(self.namespace, Namespace::Sandboxed(_))
    }

    pub(crate) fn interrupted(&self) -> &Arc<AtomicBool> {
        &self.interrupted
    }

    pub(crate) fn hook_slot(&self) -> &HookSlot {
        &self.hooks
    }

    /// Load a compiled chunk into this instance.
    pub(crate) fn materialize(&self, chunk: &str) -> Result<Function> {
        self.lua
            .load(chunk)
            .set_name(CHUNK_NAME)
            .into_function()
            .map_err(SandboxError::from_syntax)
    }

    /// Run a materialized chunk. Sandboxed instances get a fresh call
    /// environment; otherwise `env` is merged into the globals and stays there.
    pub(crate) fn call(&self, function: &Function, env: Option<&Env>) -> Result<Value> {
        match &self.namespace {
            Namespace::Sandboxed(sandbox) => sandbox.call(&self.lua, function, env),
            Namespace::Global => {
                let globals = self.lua.globals();
                if let Some(env) = env {
                    env.apply(&globals).map_err(SandboxError::from_lua)?;
                }
                let result = function
                    .call::<mlua::Value>(globals)
                    .map_err(SandboxError::from_lua)?;
                Value::from_lua(result, &self.lua).map_err(SandboxError::from_lua)
            }
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("sandboxed", &self.is_sandboxed())
            .finish()
    }
}
