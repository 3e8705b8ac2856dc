//! Sandbox module containing the engine and its building blocks.

pub mod allowlist;
pub mod builder;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod expr;
pub mod instance;
pub mod pool;
