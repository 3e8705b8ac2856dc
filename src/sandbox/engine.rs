//! The expression engine: configuration, instance pool and compilation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mlua::{Lua, LuaOptions, StdLib};
use tracing::{debug, info};

use crate::error::{Result, SandboxError, CHUNK_NAME};
use crate::sandbox::allowlist::Allowlist;
use crate::sandbox::config::{EngineConfig, PoolMode};
use crate::sandbox::expr::{bare_source, wrap_source, CompiledExpr};
use crate::sandbox::instance::Instance;
use crate::sandbox::pool::{BoundedPool, InstanceFactory, InstancePool, PoolStats, SharedPool};

/// Compiles expressions and owns the pool that evaluates them.
///
/// Safe to share between threads. Interpreter instances are created on
/// demand, each passed through the sandbox builder once.
pub struct ExprEngine {
    config: Arc<EngineConfig>,
    pool: Arc<dyn InstancePool>,
    compiler: Lua,
    closed: AtomicBool,
}

impl ExprEngine {
    /// Create an engine. With a negative pool size the shared instance is
    /// created right away, so sandbox errors surface here.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let config = Arc::new(config);
        let allowlist = Allowlist::parse(&config.allowed_functions);

        let factory: InstanceFactory = {
            let config = Arc::clone(&config);
            Box::new(move |id| Instance::new(id, &config, &allowlist))
        };
        let pool: Arc<dyn InstancePool> = match config.pool_mode() {
            PoolMode::Bounded(capacity) => Arc::new(BoundedPool::new(capacity, factory)),
            PoolMode::Shared => Arc::new(SharedPool::new(factory)?),
        };

        let compiler = Lua::new_with(StdLib::NONE, LuaOptions::new()).map_err(|e| {
            SandboxError::RuntimeInit(anyhow::anyhow!("failed to create compiler state: {}", e))
        })?;

        debug!(
            sandbox = config.sandbox,
            pool = ?config.pool_mode(),
            "expression engine created"
        );
        Ok(Self {
            config,
            pool,
            compiler,
            closed: AtomicBool::new(false),
        })
    }

    /// Create an engine with the default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compile an expression. Nothing is borrowed from the pool; the result
    /// can be cached and shared freely.
    ///
    /// The source must be a single expression: text that closes the wrapper
    /// and continues with statements is rejected.
    pub fn compile(&self, source: &str) -> Result<CompiledExpr> {
        let chunk = wrap_source(source);
        self.check_syntax(&chunk)?;
        self.check_syntax(&bare_source(source))?;

        Ok(CompiledExpr::new(
            chunk,
            self.config.sandbox,
            self.config.hook_instruction_interval,
            Arc::clone(&self.pool),
        ))
    }

    fn check_syntax(&self, chunk: &str) -> Result<()> {
        self.compiler
            .load(chunk)
            .set_name(CHUNK_NAME)
            .into_function()
            .map(drop)
            .map_err(SandboxError::from_syntax)
    }

    /// Current pool counters.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shut the pool down. Idempotent; also runs on drop.
    ///
    /// Do not close while evaluations are still running: their instances
    /// are discarded when returned and any later evaluation fails with
    /// [`SandboxError::EngineClosed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.shutdown();
        info!("expression engine closed");
    }
}

impl Drop for ExprEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ExprEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExprEngine")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_compile_reports_syntax_errors() {
        let engine = ExprEngine::with_defaults().unwrap();
        let err = engine.compile("1 +").unwrap_err();
        assert!(err.is_compile());
        assert!(!err.to_string().contains("<expr>"));
        assert_eq!(engine.stats().created, 0);
    }

    #[test]
    fn test_compile_rejects_wrapper_escape() {
        let engine = ExprEngine::with_defaults().unwrap();
        for source in [
            "1) end)(), (function() return (2",
            "1) end)() x = 1 local _ = (function() return (2",
        ] {
            assert!(engine.compile(source).unwrap_err().is_compile(), "{source}");
        }
        assert!(engine.compile("...").unwrap_err().is_compile());
    }

    #[test]
    fn test_compile_borrows_nothing() {
        let engine = ExprEngine::with_defaults().unwrap();
        let expr = engine.compile("1 + 1").unwrap();
        assert_eq!(engine.stats().created, 0);
        assert_eq!(expr.eval(None).unwrap(), Value::Integer(2));
        assert_eq!(engine.stats().created, 1);
        assert_eq!(engine.stats().idle, 1);
    }

    #[test]
    fn test_shared_mode_creates_instance_eagerly() {
        let engine = ExprEngine::new(EngineConfig::builder().pool_size(-1).build()).unwrap();
        let stats = engine.stats();
        assert_eq!(stats.capacity, None);
        assert_eq!(stats.created, 1);
    }

    #[test]
    fn test_shared_mode_surfaces_init_errors() {
        let config = EngineConfig::builder()
            .pool_size(-1)
            .env_func(|_, _| Err(mlua::Error::RuntimeError("broken".to_string())))
            .build();
        assert!(matches!(
            ExprEngine::new(config),
            Err(SandboxError::RuntimeInit(_))
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let engine = ExprEngine::with_defaults().unwrap();
        let expr = engine.compile("true").unwrap();
        assert!(expr.eval_bool(None).unwrap());
        engine.close();
        engine.close();
        assert!(engine.is_closed());
        assert!(matches!(expr.eval(None), Err(SandboxError::EngineClosed)));
    }
}
