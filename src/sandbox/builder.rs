//! Construction of the restricted global environment.
//!
//! A [`Sandbox`] is built once per interpreter instance. Its base table holds
//! references to the allowlisted built-ins; modules named in the allowlist are
//! installed as [`ProtectedModule`] views that reject writes. Every evaluation
//! then runs in a fresh call environment whose lookups fall back to the base.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mlua::{FromLua, Function, Lua, MultiValue, Table};
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::sandbox::allowlist::{Allowlist, Capability};
use crate::sandbox::cancel::HookSlot;
use crate::sandbox::config::EnvFunc;
use crate::value::{Env, Value};

/// Wraps a protected-call primitive (`pcall`, `xpcall`, `coroutine.resume`) so
/// that an error caught while the instance is being interrupted is raised again.
const PROTECTED_CALL_GUARD: &str = r#"
local call, interrupted, error = ...
local function check(ok, ...)
  if not ok and interrupted() then
    error((...), 0)
  end
  return ok, ...
end
return function(...)
  return check(call(...))
end
"#;

/// `coroutine.wrap` on top of the hooked `coroutine.resume`, so wrapped
/// coroutines stay under the evaluation's cancellation hook.
const COROUTINE_WRAP: &str = r#"
local create, resume, error = ...
local function unwrap(ok, ...)
  if not ok then
    error((...), 0)
  end
  return ...
end
return function(f)
  local co = create(f)
  return function(...)
    return unwrap(resume(co, ...))
  end
end
"#;

/// Method calls on strings go through this table instead of the full library.
const STRING_METATABLE: &str = "getmetatable('').__index = ...";

const GUARDED_GLOBALS: [&str; 2] = ["pcall", "xpcall"];

/// A module table exposed read-only inside the sandbox.
pub struct ProtectedModule {
    name: String,
    members: Table,
}

impl ProtectedModule {
    pub fn new(name: impl Into<String>, members: Table) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }

    /// Build the view: an empty table whose metatable reads through to the
    /// members and raises on every assignment.
    pub fn into_view(self, lua: &Lua) -> mlua::Result<Table> {
        let name = self.name;
        let reject = lua.create_function(
            move |_, (_, key, _): (Table, mlua::Value, mlua::Value)| -> mlua::Result<()> {
                Err(mlua::Error::RuntimeError(format!(
                    "Can not modify {}.{}. Protected by the sandbox.",
                    name,
                    key_name(&key)
                )))
            },
        )?;

        let meta = lua.create_table()?;
        meta.raw_set("__index", self.members)?;
        meta.raw_set("__newindex", reject)?;
        meta.raw_set("__metatable", false)?;

        let view = lua.create_table()?;
        view.set_metatable(Some(meta));
        Ok(view)
    }
}

fn key_name(key: &mlua::Value) -> String {
    match key {
        mlua::Value::String(s) => s.to_string_lossy().into(),
        mlua::Value::Integer(i) => i.to_string(),
        mlua::Value::Number(n) => n.to_string(),
        other => format!("<{}>", other.type_name()),
    }
}

/// `coroutine.resume` and `coroutine.wrap` replacements that carry the
/// cancellation hook into every resumed coroutine.
pub struct HookedCoroutines {
    pub resume: mlua::Value,
    pub wrap: mlua::Value,
}

impl HookedCoroutines {
    /// Build both from the interpreter's own coroutine library. Either one
    /// is nil when the library lacks what it needs.
    pub fn new(lua: &Lua, interrupted: &Arc<AtomicBool>, hooks: &HookSlot) -> mlua::Result<Self> {
        let library = match lua.globals().raw_get::<mlua::Value>("coroutine")? {
            mlua::Value::Table(library) => library,
            _ => {
                return Ok(Self {
                    resume: mlua::Value::Nil,
                    wrap: mlua::Value::Nil,
                })
            }
        };

        let resume = match library.raw_get::<mlua::Value>("resume")? {
            mlua::Value::Function(resume) => {
                let guard = guard_factory(lua, interrupted)?;
                guard(mlua::Value::Function(hooked_resume(lua, resume, hooks.clone())?))?
            }
            _ => mlua::Value::Nil,
        };
        let wrap = match (library.raw_get::<mlua::Value>("create")?, &resume) {
            (mlua::Value::Function(create), mlua::Value::Function(resume)) => {
                let error: mlua::Value = lua.globals().raw_get("error")?;
                lua.load(COROUTINE_WRAP)
                    .set_name("=coroutine.wrap")
                    .call::<mlua::Value>((create, resume.clone(), error))?
            }
            _ => mlua::Value::Nil,
        };
        Ok(Self { resume, wrap })
    }

    /// Swap the replacements into the interpreter's real coroutine library,
    /// for instances that run without a sandbox.
    pub fn install_globally(self, lua: &Lua) -> mlua::Result<()> {
        if let mlua::Value::Table(library) = lua.globals().raw_get::<mlua::Value>("coroutine")? {
            library.raw_set("resume", self.resume)?;
            library.raw_set("wrap", self.wrap)?;
        }
        Ok(())
    }
}

/// Resume a coroutine with the armed hook moved onto it, and hand the hook
/// back to the resuming thread afterwards.
fn hooked_resume(lua: &Lua, resume: Function, hooks: HookSlot) -> mlua::Result<Function> {
    lua.create_function(move |lua, args: MultiValue| {
        let armed = hooks.current();
        if let (Some(armed), Some(mlua::Value::Thread(thread))) = (&armed, args.iter().next()) {
            armed.install(thread);
        }
        let result = resume.call::<MultiValue>(args);
        if let Some(armed) = &armed {
            armed.install(&lua.current_thread());
        }
        result
    })
}

/// Returns a closure wrapping a protected-call function with the guard.
fn guard_factory(
    lua: &Lua,
    interrupted: &Arc<AtomicBool>,
) -> mlua::Result<impl Fn(mlua::Value) -> mlua::Result<mlua::Value>> {
    let flag = Arc::clone(interrupted);
    let interrupted = lua.create_function(move |_, ()| Ok(flag.load(Ordering::Acquire)))?;
    let error: mlua::Value = lua.globals().raw_get("error")?;
    let wrap = lua.load(PROTECTED_CALL_GUARD).set_name("=guard").into_function()?;

    Ok(move |value: mlua::Value| match value {
        mlua::Value::Function(call) => {
            wrap.call::<mlua::Value>((call, interrupted.clone(), error.clone()))
        }
        other => Ok(other),
    })
}

/// Builds a [`Sandbox`] from an allowlist and an optional customization hook.
pub struct SandboxBuilder<'a> {
    allowlist: &'a Allowlist,
    env_func: Option<&'a EnvFunc>,
    interrupted: Arc<AtomicBool>,
    hooks: HookSlot,
}

impl<'a> SandboxBuilder<'a> {
    /// `interrupted` is the instance flag set while a cancellation is in
    /// progress; `hooks` holds the context armed for the running evaluation.
    pub fn new(allowlist: &'a Allowlist, interrupted: Arc<AtomicBool>, hooks: HookSlot) -> Self {
        Self {
            allowlist,
            env_func: None,
            interrupted,
            hooks,
        }
    }

    /// Hook run once against the finished base table.
    pub fn env_func(mut self, env_func: Option<&'a EnvFunc>) -> Self {
        self.env_func = env_func;
        self
    }

    /// Build the base table in `lua` and restrict the string metatable to
    /// the allowlisted string functions.
    pub fn build(self, lua: &Lua) -> mlua::Result<Sandbox> {
        let globals = lua.globals();
        let base = lua.create_table()?;
        let guard = guard_factory(lua, &self.interrupted)?;
        let coroutines = HookedCoroutines::new(lua, &self.interrupted, &self.hooks)?;

        let mut modules: HashMap<&str, Table> = HashMap::new();
        for entry in self.allowlist.entries() {
            match entry {
                Capability::Global(name) => {
                    let mut value: mlua::Value = globals.raw_get(name.as_str())?;
                    if value.is_nil() {
                        warn!(capability = %name, "allowlisted global does not exist");
                    }
                    if GUARDED_GLOBALS.contains(&name.as_str()) {
                        value = guard(value)?;
                    }
                    base.raw_set(name.as_str(), value)?;
                }
                Capability::Member { module, member } => {
                    let value = match (module.as_str(), member.as_str()) {
                        ("coroutine", "resume") => coroutines.resume.clone(),
                        ("coroutine", "wrap") => coroutines.wrap.clone(),
                        _ => match globals.raw_get::<mlua::Value>(module.as_str())? {
                            mlua::Value::Table(source) => source.raw_get(member.as_str())?,
                            _ => mlua::Value::Nil,
                        },
                    };
                    if value.is_nil() {
                        warn!(module = %module, member = %member, "allowlisted member does not exist");
                    }
                    let members = match modules.get(module.as_str()) {
                        Some(members) => members.clone(),
                        None => {
                            let members = lua.create_table()?;
                            modules.insert(module.as_str(), members.clone());
                            members
                        }
                    };
                    members.raw_set(member.as_str(), value)?;
                }
            }
        }

        let mut string_methods = None;
        for name in self.allowlist.modules() {
            if let Some(members) = modules.remove(name) {
                let view = ProtectedModule::new(name, members).into_view(lua)?;
                if name == "string" {
                    string_methods = Some(view.clone());
                }
                base.raw_set(name, view)?;
            }
        }
        let string_methods = match string_methods {
            Some(view) => view,
            None => lua.create_table()?,
        };
        lua.load(STRING_METATABLE)
            .set_name("=string_metatable")
            .call::<()>(string_methods)?;

        if let Some(env_func) = self.env_func {
            env_func(lua, &base)?;
        }

        let call_meta = lua.create_table()?;
        call_meta.raw_set("__index", base.clone())?;

        debug!(
            capabilities = self.allowlist.len(),
            protected_modules = self.allowlist.modules().len(),
            "sandbox built"
        );
        Ok(Sandbox { base, call_meta })
    }
}

/// The per-instance restricted environment.
pub struct Sandbox {
    base: Table,
    call_meta: Table,
}

impl Sandbox {
    /// The base table every call environment falls back to.
    pub fn base(&self) -> &Table {
        &self.base
    }

    /// Build the environment for one evaluation: the caller's bindings, `_G`
    /// bound to the environment itself, and fallback lookups into the base.
    pub fn call_env(&self, lua: &Lua, env: Option<&Env>) -> mlua::Result<Table> {
        let call_env = lua.create_table()?;
        if let Some(env) = env {
            env.apply(&call_env)?;
        }
        if call_env.raw_get::<mlua::Value>("_G")?.is_nil() {
            call_env.raw_set("_G", call_env.clone())?;
        }
        call_env.set_metatable(Some(self.call_meta.clone()));
        Ok(call_env)
    }

    /// Run a materialized expression chunk inside a fresh call environment.
    pub fn call(&self, lua: &Lua, function: &Function, env: Option<&Env>) -> Result<Value> {
        let call_env = self.call_env(lua, env).map_err(SandboxError::from_lua)?;
        let result = function
            .call::<mlua::Value>(call_env)
            .map_err(SandboxError::from_lua)?;
        Value::from_lua(result, lua).map_err(SandboxError::from_lua)
    }
}
