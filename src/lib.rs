//! # Lua Expression Sandbox
//!
//! Evaluate small, untrusted Lua expressions from a host application, safely
//! and repeatedly.
//!
//! Expressions run on pooled [`mlua`] interpreter instances. Each instance
//! carries a restricted environment built once from an allowlist of built-in
//! capabilities:
//!
//! - **Allowlisted globals**: only the configured built-ins are visible
//! - **Protected modules**: `math`, `string` and friends are read-only views
//! - **Per-call bindings**: caller values shadow the base without touching it
//! - **Bounded pooling**: at most `pool_size` evaluations run at once
//! - **Cancellation**: deadlines and explicit cancels abort running scripts
//!
//! ## Example
//!
//! ```rust,no_run
//! use lua_expr_sandbox_rs::prelude::*;
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     let engine = ExprEngine::new(
//!         EngineConfig::builder()
//!             .pool_size(8)
//!             .env(Env::new().with("hoge", "foo"))
//!             .build(),
//!     )?;
//!
//!     let expr = engine.compile(r#"hoge == "foo" and add(x, y) == 15"#)?;
//!     let env = Env::new()
//!         .with("x", 5)
//!         .with("y", 10)
//!         .with(
//!             "add",
//!             Value::function(|args| {
//!                 let sum = args.iter().filter_map(Value::as_integer).sum::<i64>();
//!                 Ok(Value::Integer(sum))
//!             }),
//!         );
//!
//!     assert!(expr.eval_bool(Some(&env))?);
//!
//!     let ctx = Context::with_timeout(Duration::from_millis(100));
//!     assert!(expr.eval_context_bool(&ctx, Some(&env))?);
//!     Ok(())
//! }
//! ```
//!
//! ## Pool modes
//!
//! A positive pool size bounds the number of instances and blocks callers
//! while all of them are busy. A negative pool size shares one instance
//! between every caller: no queueing, but no isolation either, so only use
//! it from a single thread.

pub mod error;
pub mod prelude;
pub mod sandbox;
pub mod value;

// Re-export main types at crate root for convenience
pub use error::{Result, SandboxError};
pub use sandbox::cancel::Context;
pub use sandbox::config::{
    EngineConfig, EngineConfigBuilder, EnvFunc, PoolMode, DEFAULT_ALLOWED_FUNCTIONS,
    DEFAULT_POOL_SIZE,
};
pub use sandbox::engine::ExprEngine;
pub use sandbox::expr::CompiledExpr;
pub use sandbox::pool::PoolStats;
pub use value::{Env, HostFunction, NativeValue, Value};

/// Re-exported so customization hooks can name interpreter types.
pub use mlua;
