//! Environment-scoped interpreter binding.
//!
//! Each quest owns one [`ScriptEnv`]: an isolated environment table on its
//! own interpreter instance. Loaded scripts write their globals into the
//! environment table; reads fall through to the instance globals so the
//! standard library stays visible. Nothing outside this module touches mlua
//! chunk loading or the registry directly.

use std::fs;
use std::path::Path;
use std::rc::Rc;

use mlua::{Function, Lua, LuaOptions, MultiValue, RegistryKey, StdLib, Table, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("initialising interpreter: {message}")]
    Init { message: String },
    #[error("reading {path}: {message}")]
    Read { path: String, message: String },
    #[error("loading {chunk}: {message}")]
    Load { chunk: String, message: String },
    #[error("calling {entry}: {message}")]
    Call { entry: String, message: String },
}

fn init_err(err: mlua::Error) -> ScriptError {
    ScriptError::Init {
        message: err.to_string(),
    }
}

fn load_err(chunk: &str, err: mlua::Error) -> ScriptError {
    ScriptError::Load {
        chunk: chunk.to_string(),
        message: err.to_string(),
    }
}

fn call_err(entry: &str, err: mlua::Error) -> ScriptError {
    ScriptError::Call {
        entry: entry.to_string(),
        message: err.to_string(),
    }
}

/// One isolated script environment bound to its own interpreter instance.
pub struct ScriptEnv {
    env: RegistryKey,
    lua: Rc<Lua>,
}

impl ScriptEnv {
    pub fn new() -> Result<Self, ScriptError> {
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default()).map_err(init_err)?;
        let env = {
            let table = lua.create_table().map_err(init_err)?;
            let meta = lua.create_table().map_err(init_err)?;
            meta.set("__index", lua.globals()).map_err(init_err)?;
            table.set_metatable(Some(meta));
            lua.create_registry_value(table).map_err(init_err)?
        };
        Ok(ScriptEnv {
            env,
            lua: Rc::new(lua),
        })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    fn env_table(&self) -> mlua::Result<Table<'_>> {
        self.lua.registry_value(&self.env)
    }

    /// Load and execute a source file inside this environment.
    pub fn load_file(&self, path: &Path, chunk_name: &str) -> Result<(), ScriptError> {
        let source = fs::read_to_string(path).map_err(|err| ScriptError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        let env = self
            .env_table()
            .map_err(|err| load_err(chunk_name, err))?;
        self.lua
            .load(&source)
            .set_name(chunk_name)
            .set_environment(env)
            .exec()
            .map_err(|err| load_err(chunk_name, err))
    }

    /// Resolve a function defined in this environment to a stable handle.
    /// Anything that is not a function (including nil) resolves to None.
    pub fn function(&self, name: &str) -> Option<RegistryKey> {
        let env = self.env_table().ok()?;
        match env.get::<_, Value>(name) {
            Ok(Value::Function(func)) => self.lua.create_registry_value(func).ok(),
            _ => None,
        }
    }

    /// Call a previously resolved function. `build` assembles the argument
    /// list against this environment's interpreter instance.
    pub fn call<'a>(
        &'a self,
        key: &RegistryKey,
        entry: &str,
        build: impl FnOnce(&'a Lua) -> mlua::Result<MultiValue<'a>>,
    ) -> Result<(), ScriptError> {
        let func: Function = self
            .lua
            .registry_value(key)
            .map_err(|err| call_err(entry, err))?;
        let args = build(&self.lua).map_err(|err| call_err(entry, err))?;
        func.call::<_, ()>(args).map_err(|err| call_err(entry, err))
    }

    /// Snapshot a plain-data value from the environment. Diagnostic helper;
    /// reference types come back as None.
    pub fn capture_value(&self, name: &str) -> Option<ScriptValue> {
        let env = self.env_table().ok()?;
        let value = env.get::<_, Value>(name).ok()?;
        ScriptValue::capture(&value)
    }
}

/// Plain-data snapshot of a script value, used where arguments must outlive
/// a particular interpreter call (queued thread requests).
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Nil,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl ScriptValue {
    /// Snapshot a Lua value; reference types are not representable.
    pub fn capture(value: &Value) -> Option<Self> {
        match value {
            Value::Nil => Some(ScriptValue::Nil),
            Value::Boolean(flag) => Some(ScriptValue::Bool(*flag)),
            Value::Integer(int) => Some(ScriptValue::Number(*int as f64)),
            Value::Number(number) => Some(ScriptValue::Number(*number)),
            Value::String(text) => text.to_str().ok().map(|text| ScriptValue::Str(text.to_string())),
            _ => None,
        }
    }

    pub fn push<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Value<'lua>> {
        Ok(match self {
            ScriptValue::Nil => Value::Nil,
            ScriptValue::Bool(flag) => Value::Boolean(*flag),
            ScriptValue::Number(number) => Value::Number(*number),
            ScriptValue::Str(text) => Value::String(lua.create_string(text)?),
        })
    }
}

/// Assemble a captured argument list for a call into `lua`.
pub fn push_all<'lua>(lua: &'lua Lua, values: &[ScriptValue]) -> mlua::Result<MultiValue<'lua>> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(value.push(lua)?);
    }
    Ok(MultiValue::from_vec(out))
}
