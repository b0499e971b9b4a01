//! Sandboxed Lua adapters for Herald.
//!
//! An adapter is a Lua script acting as an event source, a destination, or
//! both. This crate provides:
//!
//! - **[`sandbox`]** -- [`Sandbox`] wraps one Lua 5.4 interpreter per adapter
//!   with a minimal library set, no dynamic loading, and cancellation hooks;
//!   [`RestrictionSet`] evaluates `module` / `module.function` denials.
//! - **[`bridge`]** -- the fixed capability menu (fs, http, json, sleep, log)
//!   installed into every sandbox, each capability restrictable per adapter.
//! - **[`value`]** -- [`ScriptValue`], the explicit tagged value type
//!   marshaled at every host/script crossing.
//! - **[`manager`]** -- [`PluginManager`], the registry that owns each
//!   adapter's worker thread and exposes load / start_source / publish /
//!   close_all.
//!
//! Adapter contract:
//!
//! ```lua
//! -- A source, a sink, or both:
//! function subscribe(config, emit)
//!     while true do
//!         emit(poll_something(config))
//!         sleep(config.interval)
//!     end
//! end
//!
//! function publish(config, data)
//!     local fs = require("fs")
//!     fs.write(config.path, data)
//! end
//! ```

pub mod bridge;
pub mod error;
pub mod manager;
pub mod sandbox;
pub mod value;

pub use bridge::LogSink;
pub use error::{PluginError, Result};
pub use manager::PluginManager;
pub use sandbox::{RestrictionSet, Sandbox};
pub use value::ScriptValue;
