//! # TickScript Scripting Host
//!
//! Embeds a JavaScript engine (QuickJS) in a tick-driven server.
//!
//! ## Pieces
//! - [`EngineHost`]: owns the one shared execution context (lazy creation,
//!   reset, generation tracking) and runs scripts against it
//! - [`ModuleResolver`]: synthesizes import targets for built-in
//!   capabilities and resolves user modules
//! - [`AsyncBridge`]: turns host futures into engine promises settled on
//!   the tick thread
//! - [`TickScheduler`]: the queue drained once per tick
//!
//! ## Script Categories
//!
//! ### Bootstrap
//! - Run once at startup
//! - May write the host store through `Bootstrap`
//!
//! ### Server
//! - Long-lived, register handlers through `Events`
//!
//! ### Utility
//! - Invoked by commands, receive `Invocation`
//!
//! ### Module
//! - Importable only

pub mod error;
pub mod tick;
pub mod resolver;
pub mod convert;
pub mod sanitize;
pub mod argv;
pub mod context;
pub mod capabilities;
pub mod bridge;
pub mod host;

pub use argv::{parse_argv, Invocation, ParsedArgs};
pub use bridge::{AsyncBridge, Settlement};
pub use capabilities::{Arity, CapabilityScope, CapabilityTable, API_VERSION};
pub use context::{ContextCell, ContextGuard, EngineConfig, ExecutionContext};
pub use error::{Result, ScriptError, ScriptResult};
pub use host::{Bindings, ContextListener, EngineHost};
pub use resolver::{classify, FileSystem, ModuleResolver, SpecifierKind, StdFileSystem};
pub use tick::{TickCallback, TickQueue, TickScheduler};
