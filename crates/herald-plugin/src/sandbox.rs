//! The sandboxed Lua interpreter.
//!
//! Each adapter owns one [`Sandbox`]: a Lua 5.4 state built with a minimal
//! library set, the dynamic-load primitives removed, the capability bridge
//! installed, and an instruction-count hook that unwinds the script when the
//! adapter is cancelled. The interpreter is only ever touched by the
//! adapter's own worker thread.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mlua::{Function, HookTriggers, Lua, LuaOptions, StdLib, Value as LuaValue, VmState};

use crate::bridge::{self, BridgeState, LogSink};
use crate::error::{PluginError, Result};
use crate::value::ScriptValue;

/// How often the interpreter hook checks the cancel flag. Frequent enough to
/// interrupt a busy loop promptly, rare enough to stay off profiles.
const HOOK_INSTRUCTION_INTERVAL: u32 = 100_000;

/// Base-library globals that allow loading code at runtime.
const REMOVED_GLOBALS: &[&str] = &["dofile", "loadfile", "load"];

/// `os` members removed from the sandbox. The time-related members
/// (`os.time`, `os.date`, `os.clock`, `os.difftime`) stay.
const REMOVED_OS_MEMBERS: &[&str] = &[
    "execute",
    "exit",
    "getenv",
    "remove",
    "rename",
    "setlocale",
    "tmpname",
];

// ---------------------------------------------------------------------------
// Restriction set
// ---------------------------------------------------------------------------

/// Capability identifiers blocked for one adapter.
///
/// An entry is either a bare module (`"fs"`, blocking every function in that
/// module) or a single function (`"http.post"`). Evaluated per call, never
/// cached.
#[derive(Debug, Clone, Default)]
pub struct RestrictionSet {
    entries: Vec<String>,
}

impl RestrictionSet {
    /// Builds a restriction set from configured identifiers.
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }

    /// Returns true if `capability` (e.g. `"fs.write"`) is blocked: exact
    /// match against an entry, or prefix match against a bare-module entry.
    pub fn is_restricted(&self, capability: &str) -> bool {
        self.entries.iter().any(|entry| {
            entry == capability
                || (!entry.contains('.')
                    && capability
                        .strip_prefix(entry.as_str())
                        .is_some_and(|rest| rest.starts_with('.')))
        })
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// One adapter's isolated interpreter.
pub struct Sandbox {
    lua: Lua,
    state: Arc<BridgeState>,
}

impl Sandbox {
    /// Creates a sandboxed interpreter for the named adapter.
    ///
    /// `cancel` is the adapter's owned cancellation flag: once set, every
    /// capability call and the interpreter hook raise an error that unwinds
    /// whatever the script is doing.
    pub fn new(
        name: &str,
        restrictions: Vec<String>,
        log_sink: Option<LogSink>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        let load_err = |reason: String| PluginError::Load {
            plugin: name.to_owned(),
            reason,
        };

        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::OS,
            LuaOptions::default(),
        )
        .map_err(|e| load_err(e.to_string()))?;

        let state = Arc::new(BridgeState::new(
            name.to_owned(),
            RestrictionSet::new(restrictions),
            log_sink,
            Arc::clone(&cancel),
        )?);

        strip_globals(&lua).map_err(|e| load_err(e.to_string()))?;
        bridge::install(&lua, Arc::clone(&state)).map_err(|e| load_err(e.to_string()))?;

        let hook_cancel = cancel;
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
            move |_lua, _debug| {
                if hook_cancel.load(Ordering::Relaxed) {
                    Err(mlua::Error::RuntimeError(
                        "plugin is shutting down".to_owned(),
                    ))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        Ok(Self { lua, state })
    }

    /// Executes the adapter script once so it can register its entry points.
    ///
    /// Fails if the script cannot be read, does not parse, raises during
    /// execution, or defines neither `subscribe` nor `publish`.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let name = self.state.name.clone();
        let load_err = |reason: String| PluginError::Load {
            plugin: name.clone(),
            reason,
        };

        let source = std::fs::read_to_string(path)
            .map_err(|e| load_err(format!("{}: {e}", path.display())))?;

        self.lua
            .load(&source)
            .set_name(format!("@{}", path.display()))
            .exec()
            .map_err(|e| load_err(e.to_string()))?;

        if !self.has_entry_point("subscribe") && !self.has_entry_point("publish") {
            return Err(load_err(
                "script defines neither a subscribe nor a publish function".to_owned(),
            ));
        }

        Ok(())
    }

    /// Returns true if the script defined the named global as a function.
    pub fn has_entry_point(&self, entry: &str) -> bool {
        matches!(
            self.lua.globals().get::<LuaValue>(entry),
            Ok(LuaValue::Function(_))
        )
    }

    /// Delegates to the adapter's restriction set.
    pub fn is_restricted(&self, capability: &str) -> bool {
        self.state.restrictions.is_restricted(capability)
    }

    /// Runs a Lua snippet inside the sandbox. Used by tests and by the
    /// registry worker for diagnostics.
    pub fn exec(&self, source: &str) -> Result<()> {
        self.lua
            .load(source)
            .exec()
            .map_err(|e| PluginError::from_lua(&self.state.name, e))
    }

    /// Invokes the script's `subscribe(config, emit)` entry point.
    ///
    /// `emit` is handed to the script as a plain function; the script may
    /// call it any number of times over an unbounded lifetime. This call
    /// returns when the script's subscribe function returns or unwinds.
    pub fn call_subscribe(
        &self,
        config: &ScriptValue,
        emit: Box<dyn Fn(String) + Send>,
    ) -> Result<()> {
        let name = &self.state.name;
        let func: Function = self
            .lua
            .globals()
            .get("subscribe")
            .map_err(|_| PluginError::EntryPointMissing {
                plugin: name.clone(),
                entry: "subscribe",
            })?;

        let config = config
            .to_lua(&self.lua)
            .map_err(|e| PluginError::from_lua(name, e))?;
        let emit_fn = self
            .lua
            .create_function(move |_, data: String| {
                emit(data);
                Ok(())
            })
            .map_err(|e| PluginError::from_lua(name, e))?;

        func.call::<()>((config, emit_fn))
            .map_err(|e| PluginError::from_lua(name, e))
    }

    /// Invokes the script's `publish(config, data)` entry point.
    pub fn call_publish(&self, config: &ScriptValue, data: &str) -> Result<()> {
        let name = &self.state.name;
        let func: Function = self
            .lua
            .globals()
            .get("publish")
            .map_err(|_| PluginError::EntryPointMissing {
                plugin: name.clone(),
                entry: "publish",
            })?;

        let config = config
            .to_lua(&self.lua)
            .map_err(|e| PluginError::from_lua(name, e))?;

        func.call::<()>((config, data))
            .map_err(|e| PluginError::from_lua(name, e))
    }
}

/// Removes the dynamic-load primitives and the dangerous `os` members.
fn strip_globals(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();

    for name in REMOVED_GLOBALS {
        globals.raw_set(*name, LuaValue::Nil)?;
    }

    if let Ok(os_table) = globals.get::<mlua::Table>("os") {
        for member in REMOVED_OS_MEMBERS {
            os_table.raw_set(*member, LuaValue::Nil)?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(restrictions: Vec<String>) -> Sandbox {
        Sandbox::new(
            "test",
            restrictions,
            None,
            Arc::new(AtomicBool::new(false)),
        )
        .expect("sandbox should build")
    }

    #[test]
    fn plain_lua_executes() {
        let sb = sandbox(vec![]);
        sb.exec("x = 1 + 1").unwrap();
    }

    #[test]
    fn dangerous_primitives_removed() {
        let sb = sandbox(vec![]);
        assert!(sb.exec(r#"os.execute("echo hi")"#).is_err());
        assert!(sb.exec(r#"io.open("test.txt")"#).is_err());
        assert!(sb.exec("debug.getinfo(1)").is_err());
        assert!(sb.exec(r#"load("return 1")()"#).is_err());
        assert!(sb.exec(r#"dofile("x.lua")"#).is_err());
        assert!(sb.exec(r#"loadfile("x.lua")"#).is_err());
    }

    #[test]
    fn safe_os_members_kept() {
        let sb = sandbox(vec![]);
        sb.exec("t = os.time()").unwrap();
        sb.exec("c = os.clock()").unwrap();
    }

    #[test]
    fn restriction_exact_and_module_match() {
        let set = RestrictionSet::new(vec!["fs".into(), "http.post".into()]);
        assert!(set.is_restricted("fs.read"));
        assert!(set.is_restricted("fs.write"));
        assert!(set.is_restricted("fs"));
        assert!(set.is_restricted("http.post"));
        assert!(!set.is_restricted("http.get"));
        assert!(!set.is_restricted("json.encode"));
    }

    #[test]
    fn restriction_prefix_requires_module_boundary() {
        // "fs" must not block a hypothetical "fsx.read".
        let set = RestrictionSet::new(vec!["fs".into()]);
        assert!(!set.is_restricted("fsx.read"));
    }

    #[test]
    fn empty_restriction_set_blocks_nothing() {
        let set = RestrictionSet::new(vec![]);
        assert!(!set.is_restricted("fs.read"));
        assert!(!set.is_restricted("http.post"));
    }

    #[test]
    fn function_level_entry_does_not_block_module() {
        let set = RestrictionSet::new(vec!["http.post".into()]);
        assert!(!set.is_restricted("http"));
        assert!(!set.is_restricted("http.get"));
    }

    #[test]
    fn load_file_registers_entry_points() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("both.lua");
        std::fs::write(
            &path,
            "function subscribe(config, emit) end\nfunction publish(config, data) end",
        )
        .unwrap();

        let sb = sandbox(vec![]);
        sb.load_file(&path).unwrap();
        assert!(sb.has_entry_point("subscribe"));
        assert!(sb.has_entry_point("publish"));
    }

    #[test]
    fn load_file_rejects_script_without_entry_points() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.lua");
        std::fs::write(&path, "local x = 1").unwrap();

        let sb = sandbox(vec![]);
        let err = sb.load_file(&path).unwrap_err();
        assert!(matches!(err, PluginError::Load { .. }), "got: {err}");
    }

    #[test]
    fn load_file_rejects_syntax_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.lua");
        std::fs::write(&path, "function subscribe(").unwrap();

        let sb = sandbox(vec![]);
        assert!(sb.load_file(&path).is_err());
    }

    #[test]
    fn load_file_rejects_missing_file() {
        let sb = sandbox(vec![]);
        assert!(sb.load_file(Path::new("/nonexistent/plugin.lua")).is_err());
    }

    #[test]
    fn non_function_entry_point_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.lua");
        std::fs::write(&path, r#"subscribe = "not a function""#).unwrap();

        let sb = sandbox(vec![]);
        assert!(sb.load_file(&path).is_err());
    }

    #[test]
    fn cancel_flag_interrupts_busy_loop() {
        let cancel = Arc::new(AtomicBool::new(false));
        let sb = Sandbox::new("busy", vec![], None, Arc::clone(&cancel)).unwrap();

        // Pre-set the flag: the instruction hook fires within the first
        // 100k instructions of the loop and unwinds it.
        cancel.store(true, Ordering::Relaxed);
        let err = sb.exec("while true do end").unwrap_err();
        assert!(err.to_string().contains("shutting down"), "got: {err}");
    }
}
