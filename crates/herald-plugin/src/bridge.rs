//! The capability bridge.
//!
//! A fixed menu of host operations exposed to sandboxed scripts, each
//! independently restrictable per adapter:
//!
//! | Capability      | Lua surface                              |
//! |-----------------|------------------------------------------|
//! | `fs.read`       | `fs.read(path) -> content`               |
//! | `fs.write`      | `fs.write(path, content)`                |
//! | `fs.list`       | `fs.list(path) -> {names...}`            |
//! | `http.get`      | `http.get(url) -> {body, status}`        |
//! | `http.post`     | `http.post(url, body, headers?) -> ...`  |
//! | `json.encode`   | `json.encode(value) -> text`             |
//! | `json.decode`   | `json.decode(text) -> value`             |
//! | `sleep`         | `sleep(seconds)` (global)                |
//! | `log`           | `log(level, message)` (global)           |
//!
//! Module capabilities are reached through a fixed `require` implemented in
//! Rust that resolves only `fs`, `http`, and `json` — there is no dynamic
//! code loading behind it. A blocked capability raises an ordinary Lua
//! error, so scripts can `pcall` around it; the host process never crashes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mlua::{Lua, Table, Value as LuaValue};

use crate::error::{PluginError, Result};
use crate::sandbox::RestrictionSet;
use crate::value::ScriptValue;

/// Timeout for a single bridge HTTP request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Granularity of the cooperative sleep loop; the cancel flag is checked
/// once per slice.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Receives `log(level, message)` calls for the observability stream.
pub type LogSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

// ---------------------------------------------------------------------------
// Shared bridge state
// ---------------------------------------------------------------------------

/// State shared by every capability closure of one adapter.
pub(crate) struct BridgeState {
    /// Adapter name, attached to log lines.
    pub name: String,
    /// Capabilities blocked for this adapter.
    pub restrictions: RestrictionSet,
    /// Cancellation flag, checked at every capability-call boundary.
    pub cancel: Arc<AtomicBool>,
    /// Optional forwarder into the observability event stream.
    pub log_sink: Option<LogSink>,
    /// Blocking HTTP client; the bridge runs on the adapter's own OS thread.
    pub http: reqwest::blocking::Client,
}

impl BridgeState {
    pub fn new(
        name: String,
        restrictions: RestrictionSet,
        log_sink: Option<LogSink>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| PluginError::Load {
                plugin: name.clone(),
                reason: format!("http client: {e}"),
            })?;

        Ok(Self {
            name,
            restrictions,
            cancel,
            log_sink,
            http,
        })
    }

    /// The gate every capability call passes through. Restrictions are
    /// evaluated per call, never cached.
    fn check(&self, capability: &str) -> mlua::Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(mlua::Error::RuntimeError(
                "plugin is shutting down".to_owned(),
            ));
        }
        if self.restrictions.is_restricted(capability) {
            return Err(mlua::Error::RuntimeError(format!(
                "{capability} is restricted for this plugin"
            )));
        }
        Ok(())
    }
}

fn runtime_err(capability: &str, err: impl std::fmt::Display) -> mlua::Error {
    mlua::Error::RuntimeError(format!("{capability}: {err}"))
}

// ---------------------------------------------------------------------------
// Installation
// ---------------------------------------------------------------------------

/// Installs the capability bridge into a sandboxed interpreter.
pub(crate) fn install(lua: &Lua, state: Arc<BridgeState>) -> mlua::Result<()> {
    let modules = lua.create_table()?;
    modules.set("fs", fs_module(lua, &state)?)?;
    modules.set("http", http_module(lua, &state)?)?;
    modules.set("json", json_module(lua, &state)?)?;

    // Fixed require: resolves the capability modules and nothing else.
    let require = {
        let modules = modules.clone();
        lua.create_function(move |_, name: String| {
            modules
                .get::<Option<Table>>(name.as_str())?
                .ok_or_else(|| mlua::Error::RuntimeError(format!("module not found: {name}")))
        })?
    };

    let globals = lua.globals();
    globals.set("require", require)?;
    globals.set("sleep", sleep_fn(lua, &state)?)?;
    globals.set("log", log_fn(lua, &state)?)?;

    Ok(())
}

// ---------------------------------------------------------------------------
// fs module
// ---------------------------------------------------------------------------

fn fs_module(lua: &Lua, state: &Arc<BridgeState>) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let st = Arc::clone(state);
    module.set(
        "read",
        lua.create_function(move |_, path: String| {
            st.check("fs.read")?;
            std::fs::read_to_string(&path).map_err(|e| runtime_err("fs.read", e))
        })?,
    )?;

    let st = Arc::clone(state);
    module.set(
        "write",
        lua.create_function(move |_, (path, content): (String, String)| {
            st.check("fs.write")?;
            std::fs::write(&path, content).map_err(|e| runtime_err("fs.write", e))
        })?,
    )?;

    let st = Arc::clone(state);
    module.set(
        "list",
        lua.create_function(move |lua, path: String| {
            st.check("fs.list")?;
            let entries = std::fs::read_dir(&path).map_err(|e| runtime_err("fs.list", e))?;

            let mut names = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| runtime_err("fs.list", e))?;
                names.push(entry.file_name().to_string_lossy().to_string());
            }
            names.sort();

            let table = lua.create_table()?;
            for (i, name) in names.iter().enumerate() {
                table.raw_set(i + 1, name.as_str())?;
            }
            Ok(table)
        })?,
    )?;

    Ok(module)
}

// ---------------------------------------------------------------------------
// http module
// ---------------------------------------------------------------------------

fn http_module(lua: &Lua, state: &Arc<BridgeState>) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let st = Arc::clone(state);
    module.set(
        "get",
        lua.create_function(move |lua, url: String| {
            st.check("http.get")?;
            let response = st
                .http
                .get(&url)
                .send()
                .map_err(|e| runtime_err("http.get", e))?;
            response_table(lua, response, "http.get")
        })?,
    )?;

    let st = Arc::clone(state);
    module.set(
        "post",
        lua.create_function(
            move |lua, (url, body, headers): (String, String, Option<Table>)| {
                st.check("http.post")?;

                let mut request = st.http.post(&url).body(body);
                if let Some(headers) = headers {
                    for pair in headers.pairs::<String, String>() {
                        let (key, value) = pair?;
                        request = request.header(key, value);
                    }
                }

                let response = request.send().map_err(|e| runtime_err("http.post", e))?;
                response_table(lua, response, "http.post")
            },
        )?,
    )?;

    Ok(module)
}

fn response_table(
    lua: &Lua,
    response: reqwest::blocking::Response,
    capability: &str,
) -> mlua::Result<Table> {
    let status = response.status().as_u16();
    let body = response.text().map_err(|e| runtime_err(capability, e))?;

    let table = lua.create_table()?;
    table.set("body", body)?;
    table.set("status", status)?;
    Ok(table)
}

// ---------------------------------------------------------------------------
// json module
// ---------------------------------------------------------------------------

fn json_module(lua: &Lua, state: &Arc<BridgeState>) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let st = Arc::clone(state);
    module.set(
        "encode",
        lua.create_function(move |_, value: LuaValue| {
            st.check("json.encode")?;
            let script = ScriptValue::from_lua(&value)?;
            serde_json::to_string(&script.to_json()).map_err(|e| runtime_err("json.encode", e))
        })?,
    )?;

    let st = Arc::clone(state);
    module.set(
        "decode",
        lua.create_function(move |lua, text: String| {
            st.check("json.decode")?;
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| runtime_err("json.decode", e))?;
            ScriptValue::from_json(&json).to_lua(lua)
        })?,
    )?;

    Ok(module)
}

// ---------------------------------------------------------------------------
// sleep / log globals
// ---------------------------------------------------------------------------

fn sleep_fn(lua: &Lua, state: &Arc<BridgeState>) -> mlua::Result<mlua::Function> {
    let st = Arc::clone(state);
    lua.create_function(move |_, seconds: f64| {
        st.check("sleep")?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(mlua::Error::RuntimeError(
                "sleep: seconds must be a non-negative number".to_owned(),
            ));
        }

        // Sleep in slices so cancellation interrupts a long delay.
        let mut remaining = Duration::from_secs_f64(seconds);
        while !remaining.is_zero() {
            if st.cancel.load(Ordering::Relaxed) {
                return Err(mlua::Error::RuntimeError(
                    "plugin is shutting down".to_owned(),
                ));
            }
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        Ok(())
    })
}

fn log_fn(lua: &Lua, state: &Arc<BridgeState>) -> mlua::Result<mlua::Function> {
    let st = Arc::clone(state);
    lua.create_function(move |_, (level, message): (String, String)| {
        st.check("log")?;

        let level = match level.as_str() {
            "debug" | "info" | "warn" | "error" => level,
            _ => "info".to_owned(),
        };

        match level.as_str() {
            "debug" => tracing::debug!(plugin = %st.name, "{message}"),
            "warn" => tracing::warn!(plugin = %st.name, "{message}"),
            "error" => tracing::error!(plugin = %st.name, "{message}"),
            _ => tracing::info!(plugin = %st.name, "{message}"),
        }

        if let Some(sink) = &st.log_sink {
            sink(&level, &message);
        }
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
