//! Conversion between host values and interpreter values.
//!
//! [`Value`] is the closed set of kinds that cross the boundary: scalars,
//! strings, sequences, keyed tables (records), host callables and native
//! interpreter values built directly against the instance. Results
//! coming back from the interpreter use the same type, so a value returned by
//! one evaluation can be handed to the next one unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use mlua::{FromLua, IntoLua, Lua, MultiValue};
use serde::Serialize;

use crate::error::{Result, SandboxError};

/// Tables nested deeper than this are rejected when converted to host values.
const MAX_DEPTH: usize = 64;

/// A value exchanged with an expression.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Lua `nil`.
    #[default]
    Nil,
    /// Lua boolean.
    Boolean(bool),
    /// Lua integer subtype.
    Integer(i64),
    /// Lua float subtype.
    Number(f64),
    /// Lua string (lossily decoded as UTF-8 on the way out).
    String(String),
    /// A sequence, mapped to a table with keys `1..=n`.
    Array(Vec<Value>),
    /// Any other table, as key/value pairs.
    Table(Vec<(Value, Value)>),
    /// A host function callable from the expression.
    Function(HostFunction),
    /// An interpreter value passed through as is, e.g. userdata.
    Native(NativeValue),
    /// An interpreter value with no host representation (Lua functions,
    /// coroutines, userdata). Carries the Lua type name.
    Opaque(&'static str),
}

impl Value {
    /// Wrap a host closure so expressions can call it.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Value::Function(HostFunction::new(f))
    }

    /// Pass an interpreter value through unchanged. `build` runs against the
    /// instance serving each evaluation.
    pub fn native<F>(build: F) -> Self
    where
        F: Fn(&Lua) -> mlua::Result<mlua::Value> + Send + Sync + 'static,
    {
        Value::Native(NativeValue(Arc::new(build)))
    }

    /// Build a string-keyed table.
    pub fn record<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Table(
            fields
                .into_iter()
                .map(|(k, v)| (Value::String(k.into()), v.into()))
                .collect(),
        )
    }

    /// Convert any serializable host value, e.g. a struct, into a table.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Value::from)
            .map_err(|e| SandboxError::Conversion(e.to_string()))
    }

    /// Lua truthiness: only `nil` and `false` are false.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view, accepting floats with an exact integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a string key in a table value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Table(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Lua type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) | Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Native(_) => "native",
            Value::Opaque(name) => *name,
        }
    }

    fn from_lua_depth(value: mlua::Value, depth: usize) -> mlua::Result<Self> {
        Ok(match value {
            mlua::Value::Nil => Value::Nil,
            mlua::Value::Boolean(b) => Value::Boolean(b),
            mlua::Value::Integer(i) => Value::Integer(i),
            mlua::Value::Number(n) => Value::Number(n),
            mlua::Value::String(s) => Value::String(s.to_string_lossy().into()),
            mlua::Value::Table(table) => Self::from_table(table, depth)?,
            other => Value::Opaque(other.type_name()),
        })
    }

    fn from_table(table: mlua::Table, depth: usize) -> mlua::Result<Self> {
        if depth >= MAX_DEPTH {
            return Err(mlua::Error::external(SandboxError::Conversion(format!(
                "table nesting deeper than {MAX_DEPTH} levels (cyclic table?)"
            ))));
        }
        let mut entries = Vec::new();
        for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
            let (k, v) = pair?;
            entries.push((
                Self::from_lua_depth(k, depth + 1)?,
                Self::from_lua_depth(v, depth + 1)?,
            ));
        }

        let len = table.raw_len();
        let is_sequence = len > 0
            && entries.len() == len
            && entries
                .iter()
                .all(|(k, _)| matches!(k, Value::Integer(i) if *i >= 1 && *i as usize <= len));
        if !is_sequence {
            return Ok(Value::Table(entries));
        }

        let mut slots: Vec<Value> = vec![Value::Nil; len];
        for (k, v) in entries {
            if let Value::Integer(i) = k {
                slots[i as usize - 1] = v;
            }
        }
        Ok(Value::Array(slots))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Number(b)) | (Value::Number(b), Value::Integer(a)) => {
                *a as f64 == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            other => write!(f, "<{}>", other.type_name()),
        }
    }
}

impl IntoLua for Value {
    fn into_lua(self, lua: &Lua) -> mlua::Result<mlua::Value> {
        Ok(match self {
            Value::Nil => mlua::Value::Nil,
            Value::Boolean(b) => mlua::Value::Boolean(b),
            Value::Integer(i) => mlua::Value::Integer(i),
            Value::Number(n) => mlua::Value::Number(n),
            Value::String(s) => mlua::Value::String(lua.create_string(&s)?),
            Value::Array(items) => {
                let table = lua.create_table_with_capacity(items.len(), 0)?;
                for (i, item) in items.into_iter().enumerate() {
                    table.raw_set(i + 1, item)?;
                }
                mlua::Value::Table(table)
            }
            Value::Table(entries) => {
                let table = lua.create_table_with_capacity(0, entries.len())?;
                for (k, v) in entries {
                    table.raw_set(k, v)?;
                }
                mlua::Value::Table(table)
            }
            Value::Function(func) => mlua::Value::Function(func.into_lua_function(lua)?),
            Value::Native(native) => (native.0)(lua)?,
            Value::Opaque(name) => {
                return Err(mlua::Error::external(SandboxError::Conversion(format!(
                    "a {name} value cannot be passed back into an expression"
                ))))
            }
        })
    }
}

impl FromLua for Value {
    fn from_lua(value: mlua::Value, _lua: &Lua) -> mlua::Result<Self> {
        Self::from_lua_depth(value, 0)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::record(fields),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i.into())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<HostFunction> for Value {
    fn from(func: HostFunction) -> Self {
        Value::Function(func)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Nil)
    }
}

type HostFn = dyn Fn(&[Value]) -> Result<Value> + Send + Sync;

/// A host closure exposed to expressions.
///
/// Arguments arrive bridged to [`Value`]s; an `Err` return is raised as a
/// runtime error inside the expression.
#[derive(Clone)]
pub struct HostFunction(Arc<HostFn>);

impl HostFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Invoke the closure directly from the host.
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        (self.0)(args)
    }

    fn into_lua_function(self, lua: &Lua) -> mlua::Result<mlua::Function> {
        lua.create_function(move |lua, args: MultiValue| {
            let args = args
                .into_iter()
                .map(|arg| Value::from_lua(arg, lua))
                .collect::<mlua::Result<Vec<_>>>()?;
            self.call(&args).map_err(mlua::Error::external)
        })
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostFunction").field(&"<closure>").finish()
    }
}

impl PartialEq for HostFunction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

type NativeFn = dyn Fn(&Lua) -> mlua::Result<mlua::Value> + Send + Sync;

/// Builder of an interpreter value that has no host representation.
#[derive(Clone)]
pub struct NativeValue(Arc<NativeFn>);

impl fmt::Debug for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NativeValue").field(&"<builder>").finish()
    }
}

impl PartialEq for NativeValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Named values supplied to one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Env {
    vars: BTreeMap<String, Value>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.vars.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Copy every entry into `table`.
    pub(crate) fn apply(&self, table: &mlua::Table) -> mlua::Result<()> {
        for (name, value) in &self.vars {
            table.raw_set(name.as_str(), value.clone())?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Env {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Env::new();
        for (k, v) in iter {
            env.insert(k, v);
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness_follows_lua() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(Value::Boolean(true).is_truthy());
        assert!(Value::Integer(0).is_truthy());
        assert!(Value::String(String::new()).is_truthy());
        assert!(Value::Array(vec![]).is_truthy());
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(Value::Integer(3).as_number(), Some(3.0));
        assert_eq!(Value::Number(4.0).as_integer(), Some(4));
        assert_eq!(Value::Number(4.5).as_integer(), None);
        assert_eq!(Value::Integer(15), Value::Number(15.0));
    }

    #[test]
    fn test_from_serialize_struct() {
        #[derive(Serialize)]
        struct User {
            name: String,
            age: u32,
            tags: Vec<String>,
        }

        let user = User {
            name: "alice".to_string(),
            age: 30,
            tags: vec!["admin".to_string()],
        };
        let value = Value::from_serialize(&user).unwrap();
        assert_eq!(value.get("name"), Some(&Value::from("alice")));
        assert_eq!(value.get("age"), Some(&Value::Integer(30)));
        assert_eq!(
            value.get("tags"),
            Some(&Value::Array(vec![Value::from("admin")]))
        );
        assert_eq!(value.get("missing"), None);
    }

    #[test]
    fn test_host_function_identity() {
        let f = HostFunction::new(|_| Ok(Value::Nil));
        let g = f.clone();
        let h = HostFunction::new(|_| Ok(Value::Nil));
        assert_eq!(f, g);
        assert_ne!(f, h);
        assert_eq!(f.call(&[]).unwrap(), Value::Nil);
    }

    #[test]
    fn test_round_trip_through_lua() {
        let lua = Lua::new();
        let original = Value::record([
            ("name", Value::from("bob")),
            ("scores", Value::Array(vec![Value::Integer(1), Value::Integer(2)])),
        ]);
        let lua_value = original.clone().into_lua(&lua).unwrap();
        let back = Value::from_lua(lua_value, &lua).unwrap();
        assert_eq!(back.get("name"), original.get("name"));
        assert_eq!(back.get("scores"), original.get("scores"));
    }

    #[test]
    fn test_cyclic_table_is_rejected() {
        let lua = Lua::new();
        let table: mlua::Table = lua.load("local t = {} t.self = t return t").eval().unwrap();
        let result = Value::from_lua(mlua::Value::Table(table), &lua);
        assert!(result.is_err());
    }

    #[test]
    fn test_lua_function_is_opaque() {
        let lua = Lua::new();
        let func: mlua::Function = lua.load("return function() end").eval().unwrap();
        let value = Value::from_lua(mlua::Value::Function(func), &lua).unwrap();
        assert_eq!(value, Value::Opaque("function"));
        assert!(value.into_lua(&lua).is_err());
    }

    #[test]
    fn test_native_value_passes_through() {
        struct Point {
            x: i64,
            y: i64,
        }

        impl mlua::UserData for Point {
            fn add_methods<M: mlua::UserDataMethods<Self>>(methods: &mut M) {
                methods.add_method("sum", |_, this, ()| Ok(this.x + this.y));
            }
        }

        let lua = Lua::new();
        let point = Value::native(|lua| {
            lua.create_userdata(Point { x: 1, y: 2 })
                .map(mlua::Value::UserData)
        });
        assert_eq!(point.type_name(), "native");
        assert_eq!(point, point.clone());

        let sum: mlua::Function = lua
            .load("local p = ... return p:sum()")
            .into_function()
            .unwrap();
        assert_eq!(sum.call::<i64>(point).unwrap(), 3);
    }

    #[test]
    fn test_env_from_iter() {
        let env: Env = [("x", Value::Integer(5)), ("y", Value::Integer(10))]
            .into_iter()
            .collect();
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("x"), Some(&Value::Integer(5)));
        let env = env.with("hoge", "foo");
        assert_eq!(env.get("hoge"), Some(&Value::from("foo")));
    }
}
