//! The plugin registry.
//!
//! Owns every loaded adapter. Each adapter gets a dedicated OS worker thread
//! that exclusively owns its [`Sandbox`]; the host talks to it through a
//! command channel (start source / publish / shutdown), so the interpreter
//! is only ever touched by one thread.
//!
//! A source loop runs on the worker thread for as long as the script wants;
//! its `emit` callback hands each datum to the host without waiting for the
//! pipeline. Shutdown sets the adapter's cancel flag (checked at every
//! capability-call boundary and by the interpreter's instruction hook) and
//! detaches the worker; a script that refuses to unwind dies with the
//! process.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, mpsc};

use herald_config::PluginConfig;

use crate::bridge::LogSink;
use crate::error::{PluginError, Result};
use crate::sandbox::Sandbox;
use crate::value::ScriptValue;

// ---------------------------------------------------------------------------
// Worker protocol
// ---------------------------------------------------------------------------

enum Command {
    /// Run the script's `subscribe` entry point until it returns or unwinds.
    StartSource {
        emit: Box<dyn Fn(String) + Send>,
    },
    /// Run the script's `publish` entry point once and report the outcome.
    Publish {
        data: String,
        done: tokio::sync::oneshot::Sender<Result<()>>,
    },
    /// Stop the worker.
    Shutdown,
}

struct PluginHandle {
    commands: mpsc::Sender<Command>,
    cancel: Arc<AtomicBool>,
    has_subscribe: bool,
    has_publish: bool,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Registry of loaded Lua adapters.
#[derive(Default)]
pub struct PluginManager {
    plugins: RwLock<HashMap<String, PluginHandle>>,
    log_sink: Option<LogSink>,
}

impl PluginManager {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry whose adapters forward `log()` calls to `sink`.
    pub fn with_log_sink(sink: LogSink) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            log_sink: Some(sink),
        }
    }

    /// Loads one adapter: spawns its worker thread, which builds the sandbox
    /// and executes the script. On failure the adapter is not registered and
    /// the error describes why — the caller decides whether to continue with
    /// the remaining adapters.
    pub async fn load(&self, definition: &PluginConfig) -> Result<()> {
        let name = definition.name.clone();

        if self.has_plugin(&name) {
            return Err(PluginError::Load {
                plugin: name,
                reason: "a plugin with this name is already loaded".to_owned(),
            });
        }

        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let worker_definition = definition.clone();
        let worker_cancel = Arc::clone(&cancel);
        let worker_sink = self.log_sink.clone();
        std::thread::Builder::new()
            .name(format!("plugin-{name}"))
            .spawn(move || worker(worker_definition, worker_sink, worker_cancel, ready_tx, command_rx))
            .map_err(|e| PluginError::Load {
                plugin: name.clone(),
                reason: format!("failed to spawn worker thread: {e}"),
            })?;

        let (has_subscribe, has_publish) = ready_rx.await.map_err(|_| PluginError::Load {
            plugin: name.clone(),
            reason: "worker exited before reporting readiness".to_owned(),
        })??;

        let handle = PluginHandle {
            commands: command_tx,
            cancel,
            has_subscribe,
            has_publish,
        };

        let mut plugins = self.plugins.write().expect("plugin map lock poisoned");
        if plugins.contains_key(&name) {
            // Lost a load race; stop the fresh worker.
            handle.cancel.store(true, Ordering::Relaxed);
            let _ = handle.commands.send(Command::Shutdown);
            return Err(PluginError::Load {
                plugin: name,
                reason: "a plugin with this name is already loaded".to_owned(),
            });
        }
        plugins.insert(name.clone(), handle);
        drop(plugins);

        tracing::info!(plugin = %name, file = %definition.file, "loaded plugin");
        Ok(())
    }

    /// Returns true if a plugin with the given name is loaded.
    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins
            .read()
            .expect("plugin map lock poisoned")
            .contains_key(name)
    }

    /// Disambiguates a configured destination/source name: adapter vs.
    /// platform topic.
    pub fn is_plugin(&self, name: &str) -> bool {
        self.has_plugin(name)
    }

    /// Names of all loaded plugins, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .plugins
            .read()
            .expect("plugin map lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Starts the adapter's source loop.
    ///
    /// The script's `subscribe(config, emit)` runs on the adapter's worker
    /// thread; each `emit(datum)` invokes `on_event` and returns to the
    /// script immediately, so a slow consumer never stalls the adapter.
    pub fn start_source(
        &self,
        name: &str,
        on_event: impl Fn(String) + Send + 'static,
    ) -> Result<()> {
        let plugins = self.plugins.read().expect("plugin map lock poisoned");
        let handle = plugins.get(name).ok_or_else(|| PluginError::NotFound {
            name: name.to_owned(),
        })?;

        if !handle.has_subscribe {
            return Err(PluginError::EntryPointMissing {
                plugin: name.to_owned(),
                entry: "subscribe",
            });
        }

        handle
            .commands
            .send(Command::StartSource {
                emit: Box::new(on_event),
            })
            .map_err(|_| PluginError::Closed {
                plugin: name.to_owned(),
            })?;

        tracing::info!(plugin = %name, "started plugin source");
        Ok(())
    }

    /// Invokes the adapter's `publish` entry point with one datum and waits
    /// for the outcome. Execution failure propagates to the caller.
    pub async fn publish(&self, name: &str, data: &str) -> Result<()> {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        {
            let plugins = self.plugins.read().expect("plugin map lock poisoned");
            let handle = plugins.get(name).ok_or_else(|| PluginError::NotFound {
                name: name.to_owned(),
            })?;

            if !handle.has_publish {
                return Err(PluginError::EntryPointMissing {
                    plugin: name.to_owned(),
                    entry: "publish",
                });
            }

            handle
                .commands
                .send(Command::Publish {
                    data: data.to_owned(),
                    done: done_tx,
                })
                .map_err(|_| PluginError::Closed {
                    plugin: name.to_owned(),
                })?;
        }

        done_rx.await.map_err(|_| PluginError::Closed {
            plugin: name.to_owned(),
        })?
    }

    /// Shuts down every adapter.
    ///
    /// Sets each cancel flag (unwinding in-flight source loops at their next
    /// capability call or hook check) and detaches the workers; never blocks
    /// on a loop that refuses to yield.
    pub fn close_all(&self) {
        let mut plugins = self.plugins.write().expect("plugin map lock poisoned");
        for (name, handle) in plugins.drain() {
            handle.cancel.store(true, Ordering::Relaxed);
            let _ = handle.commands.send(Command::Shutdown);
            tracing::debug!(plugin = %name, "closed plugin");
        }
    }

    /// Number of loaded plugins.
    pub fn len(&self) -> usize {
        self.plugins.read().expect("plugin map lock poisoned").len()
    }

    /// Returns true if no plugins are loaded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Worker thread
// ---------------------------------------------------------------------------

fn worker(
    definition: PluginConfig,
    log_sink: Option<LogSink>,
    cancel: Arc<AtomicBool>,
    ready: tokio::sync::oneshot::Sender<Result<(bool, bool)>>,
    commands: mpsc::Receiver<Command>,
) {
    let name = definition.name.clone();

    let sandbox = match Sandbox::new(
        &name,
        definition.restrict.clone(),
        log_sink,
        Arc::clone(&cancel),
    ) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = sandbox.load_file(Path::new(&definition.file)) {
        let _ = ready.send(Err(e));
        return;
    }

    let has_subscribe = sandbox.has_entry_point("subscribe");
    let has_publish = sandbox.has_entry_point("publish");
    if ready.send(Ok((has_subscribe, has_publish))).is_err() {
        return;
    }

    let config = ScriptValue::map_from_json(&definition.config);

    while let Ok(command) = commands.recv() {
        match command {
            Command::StartSource { emit } => match sandbox.call_subscribe(&config, emit) {
                Ok(()) => tracing::debug!(plugin = %name, "source loop returned"),
                Err(e) if cancel.load(Ordering::Relaxed) => {
                    tracing::debug!(plugin = %name, error = %e, "source loop interrupted by shutdown");
                }
                Err(e) => tracing::warn!(plugin = %name, error = %e, "source loop failed"),
            },
            Command::Publish { data, done } => {
                let _ = done.send(sandbox.call_publish(&config, &data));
            }
            Command::Shutdown => break,
        }
    }

    tracing::debug!(plugin = %name, "plugin worker stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn write_plugin(dir: &tempfile::TempDir, file: &str, source: &str) -> PluginConfig {
        let path = dir.path().join(file);
        std::fs::write(&path, source).unwrap();
        PluginConfig {
            name: file.trim_end_matches(".lua").to_owned(),
            file: path.display().to_string(),
            restrict: Vec::new(),
            config: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn load_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let definition = write_plugin(
            &dir,
            "test-plugin.lua",
            "function subscribe(config, emit) emit(\"hello from plugin\") end",
        );

        let manager = PluginManager::new();
        manager.load(&definition).await.unwrap();

        assert!(manager.has_plugin("test-plugin"));
        assert!(manager.is_plugin("test-plugin"));
        assert!(!manager.is_plugin("other"));
        assert_eq!(manager.names(), vec!["test-plugin"]);
    }

    #[tokio::test]
    async fn load_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let definition = write_plugin(&dir, "dup.lua", "function publish(c, d) end");

        let manager = PluginManager::new();
        manager.load(&definition).await.unwrap();
        let err = manager.load(&definition).await.unwrap_err();
        assert!(err.to_string().contains("already loaded"), "got: {err}");
    }

    #[tokio::test]
    async fn load_rejects_missing_file() {
        let manager = PluginManager::new();
        let definition = PluginConfig {
            name: "ghost".into(),
            file: "/nonexistent/ghost.lua".into(),
            restrict: Vec::new(),
            config: HashMap::new(),
        };
        assert!(manager.load(&definition).await.is_err());
        assert!(!manager.has_plugin("ghost"));
    }

    #[tokio::test]
    async fn load_rejects_script_without_entry_points() {
        let dir = tempfile::tempdir().unwrap();
        let definition = write_plugin(&dir, "inert.lua", "local x = 1");

        let manager = PluginManager::new();
        let err = manager.load(&definition).await.unwrap_err();
        assert!(matches!(err, PluginError::Load { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn source_delivers_emitted_events() {
        let dir = tempfile::tempdir().unwrap();
        let definition = write_plugin(
            &dir,
            "source.lua",
            "function subscribe(config, emit) emit(\"event-data\") end",
        );

        let manager = PluginManager::new();
        manager.load(&definition).await.unwrap();

        let (tx, rx) = mpsc::channel();
        manager
            .start_source("source", move |data| {
                let _ = tx.send(data);
            })
            .unwrap();

        let received = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("source should emit within the timeout");
        assert_eq!(received, "event-data");
    }

    #[tokio::test]
    async fn source_receives_static_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut definition = write_plugin(
            &dir,
            "configured.lua",
            "function subscribe(config, emit) emit(config.greeting) end",
        );
        definition
            .config
            .insert("greeting".into(), serde_json::json!("hi there"));

        let manager = PluginManager::new();
        manager.load(&definition).await.unwrap();

        let (tx, rx) = mpsc::channel();
        manager
            .start_source("configured", move |data| {
                let _ = tx.send(data);
            })
            .unwrap();

        let received = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "hi there");
    }

    #[tokio::test]
    async fn start_source_requires_subscribe_entry() {
        let dir = tempfile::tempdir().unwrap();
        let definition = write_plugin(&dir, "sink-only.lua", "function publish(c, d) end");

        let manager = PluginManager::new();
        manager.load(&definition).await.unwrap();

        let err = manager.start_source("sink-only", |_| {}).unwrap_err();
        assert!(
            matches!(err, PluginError::EntryPointMissing { entry: "subscribe", .. }),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn publish_invokes_script() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("output.txt");
        let mut definition = write_plugin(
            &dir,
            "dest.lua",
            r#"
function publish(config, data)
    local fs = require("fs")
    fs.write(config.path, data)
end
"#,
        );
        definition.config.insert(
            "path".into(),
            serde_json::json!(out_path.display().to_string()),
        );

        let manager = PluginManager::new();
        manager.load(&definition).await.unwrap();
        manager.publish("dest", "response data").await.unwrap();

        assert_eq!(std::fs::read_to_string(&out_path).unwrap(), "response data");
    }

    #[tokio::test]
    async fn publish_requires_publish_entry() {
        let dir = tempfile::tempdir().unwrap();
        let definition = write_plugin(&dir, "source-only.lua", "function subscribe(c, e) end");

        let manager = PluginManager::new();
        manager.load(&definition).await.unwrap();

        let err = manager.publish("source-only", "data").await.unwrap_err();
        assert!(
            matches!(err, PluginError::EntryPointMissing { entry: "publish", .. }),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn publish_propagates_script_failure() {
        let dir = tempfile::tempdir().unwrap();
        let definition = write_plugin(
            &dir,
            "broken.lua",
            r#"function publish(config, data) error("boom") end"#,
        );

        let manager = PluginManager::new();
        manager.load(&definition).await.unwrap();

        let err = manager.publish("broken", "data").await.unwrap_err();
        assert!(err.to_string().contains("boom"), "got: {err}");
    }

    #[tokio::test]
    async fn publish_blocked_by_restriction_is_permission_error() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("blocked.txt");
        let mut definition = write_plugin(
            &dir,
            "restricted.lua",
            r#"
function publish(config, data)
    local fs = require("fs")
    fs.write(config.path, data)
end
"#,
        );
        definition.restrict = vec!["fs.write".into()];
        definition.config.insert(
            "path".into(),
            serde_json::json!(out_path.display().to_string()),
        );

        let manager = PluginManager::new();
        manager.load(&definition).await.unwrap();

        let err = manager.publish("restricted", "data").await.unwrap_err();
        assert!(
            matches!(err, PluginError::Permission { .. }),
            "got: {err}"
        );
        assert!(!out_path.exists());
    }

    #[tokio::test]
    async fn unknown_plugin_operations_fail() {
        let manager = PluginManager::new();

        assert!(matches!(
            manager.start_source("ghost", |_| {}).unwrap_err(),
            PluginError::NotFound { .. }
        ));
        assert!(matches!(
            manager.publish("ghost", "data").await.unwrap_err(),
            PluginError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn close_all_interrupts_sleeping_source() {
        let dir = tempfile::tempdir().unwrap();
        let definition = write_plugin(
            &dir,
            "loop.lua",
            r#"
function subscribe(config, emit)
    while true do
        sleep(0.05)
    end
end
"#,
        );

        let manager = PluginManager::new();
        manager.load(&definition).await.unwrap();
        manager.start_source("loop", |_| {}).unwrap();

        // Let the loop get going before shutting down.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = Instant::now();
        manager.close_all();
        assert!(manager.is_empty());
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "close_all must not block on a source loop"
        );
    }

    #[tokio::test]
    async fn operations_after_close_fail() {
        let dir = tempfile::tempdir().unwrap();
        let definition = write_plugin(&dir, "short.lua", "function publish(c, d) end");

        let manager = PluginManager::new();
        manager.load(&definition).await.unwrap();
        manager.close_all();

        assert!(matches!(
            manager.publish("short", "data").await.unwrap_err(),
            PluginError::NotFound { .. }
        ));
    }
}
