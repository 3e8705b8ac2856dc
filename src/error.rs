//! Error types for the expression sandbox.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Chunk name given to every compiled expression.
pub(crate) const CHUNK_NAME: &str = "=<expr>";

/// Matches the `<expr>:12: ` prefix Lua puts in front of error messages.
static LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<expr>:-?\d+:\s*").expect("valid location pattern"));

/// Errors that can occur while compiling or evaluating an expression.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The expression text failed to parse.
    #[error("syntax error: {0}")]
    Compile(String),

    /// The expression ran but raised an error.
    #[error("{0}")]
    Runtime(String),

    /// The evaluation context's deadline passed before the evaluation finished.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The evaluation context was cancelled.
    #[error("context canceled")]
    Cancelled,

    /// The interpreter ran out of its configured memory.
    #[error("memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),

    /// A value could not be carried across the host/interpreter boundary.
    #[error("value conversion failed: {0}")]
    Conversion(String),

    /// Failed to create or sandbox an interpreter instance.
    #[error("failed to initialize interpreter: {0}")]
    RuntimeInit(#[source] anyhow::Error),

    /// The engine was closed; no instance can be checked out anymore.
    #[error("engine is closed")]
    EngineClosed,

    /// A background evaluation task failed to complete.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SandboxError {
    /// Check if this error represents a passed deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::DeadlineExceeded)
    }

    /// Check if this error was raised by the evaluation context
    /// (deadline or explicit cancel) rather than by the script.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SandboxError::DeadlineExceeded | SandboxError::Cancelled)
    }

    /// Check if this error represents a script runtime failure.
    pub fn is_runtime(&self) -> bool {
        matches!(self, SandboxError::Runtime(_))
    }

    /// Check if this error represents a syntax error.
    pub fn is_compile(&self) -> bool {
        matches!(self, SandboxError::Compile(_))
    }

    /// Check if this error represents a memory limit exceeded.
    pub fn is_memory_limit(&self) -> bool {
        matches!(self, SandboxError::MemoryLimitExceeded(_))
    }

    /// Convert an error raised while running an expression.
    pub(crate) fn from_lua(err: mlua::Error) -> Self {
        match root_cause(&err) {
            mlua::Error::MemoryError(msg) => SandboxError::MemoryLimitExceeded(msg.clone()),
            mlua::Error::ExternalError(ext) => match ext.downcast_ref::<SandboxError>() {
                Some(SandboxError::DeadlineExceeded) => SandboxError::DeadlineExceeded,
                Some(SandboxError::Cancelled) => SandboxError::Cancelled,
                Some(SandboxError::Conversion(msg)) => SandboxError::Conversion(msg.clone()),
                _ => SandboxError::Runtime(lua_message(&err)),
            },
            _ => SandboxError::Runtime(lua_message(&err)),
        }
    }

    /// Convert an error raised while loading an expression.
    pub(crate) fn from_syntax(err: mlua::Error) -> Self {
        match root_cause(&err) {
            mlua::Error::SyntaxError { message, .. } => {
                SandboxError::Compile(strip_location(message))
            }
            _ => SandboxError::Compile(lua_message(&err)),
        }
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Remove `<expr>:N:` location prefixes from an interpreter message.
pub fn strip_location(message: &str) -> String {
    LOCATION.replace_all(message, "").into_owned()
}

/// Separator mlua puts between a runtime error and its stack traceback.
const TRACEBACK: &str = "\nstack traceback:";

/// Walk through callback and context wrappers to the error that was raised.
fn root_cause(err: &mlua::Error) -> &mlua::Error {
    match err {
        mlua::Error::CallbackError { cause, .. } => root_cause(cause),
        mlua::Error::WithContext { cause, .. } => root_cause(cause),
        other => other,
    }
}

/// Render an interpreter error without tracebacks or location prefixes.
fn lua_message(err: &mlua::Error) -> String {
    let message = match root_cause(err) {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::MemoryError(msg) => msg.clone(),
        mlua::Error::ExternalError(ext) => ext.to_string(),
        other => other.to_string(),
    };
    let message = match message.find(TRACEBACK) {
        Some(at) => &message[..at],
        None => message.as_str(),
    };
    strip_location(message.trim_end())
}
