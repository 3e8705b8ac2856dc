//! Prelude module for convenient imports.

pub use crate::error::{Result, SandboxError};
pub use crate::sandbox::{
    cancel::Context,
    config::EngineConfig,
    engine::ExprEngine,
    expr::CompiledExpr,
};
pub use crate::value::{Env, HostFunction, Value};
