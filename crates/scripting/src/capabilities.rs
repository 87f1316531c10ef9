//! Capability tables
//!
//! A capability is a named object of arity-checked members installed into
//! the execution context. Scripts reach it as a global or by importing the
//! bare built-in module of the same name.
//!
//! | Capability   | Visible to | Members                                      |
//! |--------------|------------|----------------------------------------------|
//! | `Host`       | all        | `apiVersion`, `generation`, `exit()`         |
//! | `Log`        | all        | `debug`, `info`, `warn`, `error`             |
//! | `Data`       | all        | `get`, `set`, `has`, `delete`, `merge`       |
//! | `Store`      | all        | `get`, `has`                                 |
//! | `Scheduler`  | all        | `wait(ticks)`, `tick()`                      |
//! | `Bootstrap`  | bootstrap  | `define(path, value)`, `remove(path)`        |
//! | `Events`     | server     | `on(name, fn)`, `off(name)`                  |
//! | `Invocation` | utility    | `caller`, `argv`, `args` (per call)          |

use crate::bridge::AsyncBridge;
use crate::context::EVENT_SLOT;
use crate::convert::{args_to_data, from_data};
use crate::tick::TickQueue;
use parking_lot::RwLock;
use rquickjs::function::{Constructor, Rest};
use rquickjs::{Array, Ctx, Exception, Function, Object, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tickscript_core::ScriptCategory;
use tickscript_data::{self as data, DataValue};

/// Version of the script-facing API
pub const API_VERSION: i64 = 1;

/// Message carried by the error `Host.exit()` throws
pub const EXIT_MARKER: &str = "tickscript:exit";

/// Error name of the exit signal
pub const EXIT_ERROR_NAME: &str = "GracefulExit";

/// Name of the per-call invocation object given to utility scripts
pub const INVOCATION: &str = "Invocation";

/// Longest wait `Scheduler.wait` accepts, in ticks
pub const MAX_WAIT_TICKS: u64 = u32::MAX as u64;

/// Accepted argument counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    Range(usize, usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, count: usize) -> bool {
        match *self {
            Arity::Exact(n) => count == n,
            Arity::Range(min, max) => (min..=max).contains(&count),
            Arity::AtLeast(min) => count >= min,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{}", n),
            Arity::Range(min, max) => write!(f, "{} to {}", min, max),
            Arity::AtLeast(min) => write!(f, "at least {}", min),
        }
    }
}

/// Which scripts see a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityScope {
    Standard,
    Category(ScriptCategory),
}

/// Member over plain host values
pub type DataFn = Arc<dyn Fn(&[DataValue]) -> Result<DataValue, String> + Send + Sync>;

/// Member that needs the engine itself (callbacks, promises)
pub type EngineFn =
    Arc<dyn for<'js> Fn(&Ctx<'js>, Vec<Value<'js>>) -> rquickjs::Result<Value<'js>> + Send + Sync>;

#[derive(Clone)]
pub enum Member {
    Constant(DataValue),
    Data { arity: Arity, call: DataFn },
    Engine { arity: Arity, call: EngineFn },
}

/// A named, versioned set of members
#[derive(Clone)]
pub struct CapabilityTable {
    name: String,
    scope: CapabilityScope,
    members: Vec<(String, Member)>,
}

impl CapabilityTable {
    pub fn new(name: impl Into<String>, scope: CapabilityScope) -> Self {
        Self {
            name: name.into(),
            scope,
            members: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> CapabilityScope {
        self.scope
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn constant(mut self, name: &str, value: impl Into<DataValue>) -> Self {
        self.members.push((name.to_string(), Member::Constant(value.into())));
        self
    }

    pub fn function<F>(mut self, name: &str, arity: Arity, call: F) -> Self
    where
        F: Fn(&[DataValue]) -> Result<DataValue, String> + Send + Sync + 'static,
    {
        self.members.push((
            name.to_string(),
            Member::Data {
                arity,
                call: Arc::new(call),
            },
        ));
        self
    }

    pub fn engine_function<F>(mut self, name: &str, arity: Arity, call: F) -> Self
    where
        F: for<'js> Fn(&Ctx<'js>, Vec<Value<'js>>) -> rquickjs::Result<Value<'js>> + Send + Sync + 'static,
    {
        self.members.push((
            name.to_string(),
            Member::Engine {
                arity,
                call: Arc::new(call),
            },
        ));
        self
    }

    /// Materialize the table as an engine object
    pub fn build<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
        let object = Object::new(ctx.clone())?;

        for (member, definition) in &self.members {
            let label = format!("{}.{}", self.name, member);
            match definition {
                Member::Constant(value) => object.set(member.as_str(), from_data(ctx, value)?)?,
                Member::Data { arity, call } => {
                    let (arity, call) = (*arity, call.clone());
                    let function = Function::new(
                        ctx.clone(),
                        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                            check_arity(&ctx, &label, arity, args.0.len())?;
                            let values = args_to_data(&args.0)
                                .map_err(|e| Exception::throw_type(&ctx, &format!("{}: {}", label, e)))?;
                            match call(&values) {
                                Ok(result) => from_data(&ctx, &result),
                                Err(message) => Err(Exception::throw_message(&ctx, &format!("{}: {}", label, message))),
                            }
                        },
                    )?
                    .with_name(member.as_str())?;
                    object.set(member.as_str(), function)?;
                }
                Member::Engine { arity, call } => {
                    let (arity, call) = (*arity, call.clone());
                    let function = Function::new(
                        ctx.clone(),
                        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                            check_arity(&ctx, &label, arity, args.0.len())?;
                            call(&ctx, args.0)
                        },
                    )?
                    .with_name(member.as_str())?;
                    object.set(member.as_str(), function)?;
                }
            }
        }

        Ok(object)
    }
}

impl fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityTable")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("members", &self.member_names())
            .finish()
    }
}

fn check_arity(ctx: &Ctx<'_>, label: &str, arity: Arity, count: usize) -> rquickjs::Result<()> {
    if arity.accepts(count) {
        return Ok(());
    }
    Err(Exception::throw_type(
        ctx,
        &format!("{} expects {} argument(s), got {}", label, arity, count),
    ))
}

/// Shared state the standard tables close over
#[derive(Clone)]
pub struct StandardDeps {
    pub generation: u64,
    pub store: Arc<RwLock<DataValue>>,
    pub bridge: AsyncBridge,
    pub queue: Arc<dyn TickQueue>,
    pub exit_requested: Arc<AtomicBool>,
}

/// Names of every built-in the host always provides
pub fn standard_names() -> Vec<&'static str> {
    vec!["Host", "Log", "Data", "Store", "Scheduler", "Bootstrap", "Events", INVOCATION]
}

/// The standard tables for one context
pub fn standard_tables(deps: &StandardDeps) -> Vec<CapabilityTable> {
    vec![
        host_table(deps),
        log_table(),
        data_table(),
        store_table(deps),
        scheduler_table(deps),
        bootstrap_table(deps),
        events_table(),
    ]
}

fn host_table(deps: &StandardDeps) -> CapabilityTable {
    let exit_requested = deps.exit_requested.clone();
    CapabilityTable::new("Host", CapabilityScope::Standard)
        .constant("apiVersion", API_VERSION)
        .constant("generation", deps.generation)
        .engine_function("exit", Arity::Exact(0), move |ctx, _args| {
            exit_requested.store(true, Ordering::Release);
            Err(throw_exit(ctx))
        })
}

/// Throw the error that unwinds a script on `Host.exit()`
fn throw_exit(ctx: &Ctx<'_>) -> rquickjs::Error {
    let built = ctx
        .globals()
        .get::<_, Constructor>("Error")
        .and_then(|error| error.construct::<_, Object>((EXIT_MARKER,)))
        .and_then(|error| {
            error.set("name", EXIT_ERROR_NAME)?;
            Ok(error)
        });
    match built {
        Ok(error) => ctx.throw(error.into_value()),
        Err(e) => e,
    }
}

fn log_table() -> CapabilityTable {
    let mut table = CapabilityTable::new("Log", CapabilityScope::Standard);
    for level in ["debug", "info", "warn", "error"] {
        table = table.function(level, Arity::AtLeast(0), move |args| {
            let line = format_log_line(args);
            match level {
                "debug" => tracing::debug!(target: "script", "{}", line),
                "info" => tracing::info!(target: "script", "{}", line),
                "warn" => tracing::warn!(target: "script", "{}", line),
                _ => tracing::error!(target: "script", "{}", line),
            }
            Ok(DataValue::Null)
        });
    }
    table
}

fn format_log_line(args: &[DataValue]) -> String {
    args.iter().map(DataValue::to_string).collect::<Vec<_>>().join(" ")
}

fn path_arg(args: &[DataValue], index: usize) -> Result<&str, String> {
    args.get(index)
        .and_then(DataValue::as_str)
        .ok_or_else(|| format!("argument {} must be a path string", index + 1))
}

fn data_table() -> CapabilityTable {
    CapabilityTable::new("Data", CapabilityScope::Standard)
        .function("get", Arity::Exact(2), |args| {
            Ok(data::get(&args[0], path_arg(args, 1)?).cloned().unwrap_or_default())
        })
        .function("has", Arity::Exact(2), |args| {
            Ok(DataValue::Bool(data::has(&args[0], path_arg(args, 1)?)))
        })
        .function("set", Arity::Exact(3), |args| {
            data::try_set(&args[0], path_arg(args, 1)?, args[2].clone()).map_err(|e| e.to_string())
        })
        .function("delete", Arity::Exact(2), |args| {
            Ok(data::delete(&args[0], path_arg(args, 1)?))
        })
        .function("merge", Arity::Range(2, 3), |args| {
            let deep = args.get(2).and_then(DataValue::as_bool).unwrap_or(false);
            Ok(data::merge(&args[0], &args[1], deep))
        })
}

fn store_table(deps: &StandardDeps) -> CapabilityTable {
    let (get_store, has_store) = (deps.store.clone(), deps.store.clone());
    CapabilityTable::new("Store", CapabilityScope::Standard)
        .function("get", Arity::Exact(1), move |args| {
            let store = get_store.read();
            Ok(data::get(&store, path_arg(args, 0)?).cloned().unwrap_or_default())
        })
        .function("has", Arity::Exact(1), move |args| {
            Ok(DataValue::Bool(data::has(&has_store.read(), path_arg(args, 0)?)))
        })
}

fn scheduler_table(deps: &StandardDeps) -> CapabilityTable {
    let bridge = deps.bridge.clone();
    let queue = deps.queue.clone();
    CapabilityTable::new("Scheduler", CapabilityScope::Standard)
        .engine_function("wait", Arity::Exact(1), move |ctx, args| {
            let ticks = args[0]
                .as_number()
                .filter(|n| n.fract() == 0.0 && (0.0..=MAX_WAIT_TICKS as f64).contains(n))
                .ok_or_else(|| {
                    let message = format!("Scheduler.wait expects a whole tick count up to {}", MAX_WAIT_TICKS);
                    Exception::throw_range(ctx, &message)
                })?;
            Ok(bridge.delay(ctx, ticks as u64)?.into_value())
        })
        .function("tick", Arity::Exact(0), move |_| {
            Ok(DataValue::from(queue.current_tick()))
        })
}

fn bootstrap_table(deps: &StandardDeps) -> CapabilityTable {
    let (define_store, remove_store) = (deps.store.clone(), deps.store.clone());
    CapabilityTable::new("Bootstrap", CapabilityScope::Category(ScriptCategory::Bootstrap))
        .function("define", Arity::Exact(2), move |args| {
            let path = path_arg(args, 0)?;
            let mut store = define_store.write();
            *store = data::try_set(&store, path, args[1].clone()).map_err(|e| e.to_string())?;
            Ok(DataValue::Null)
        })
        .function("remove", Arity::Exact(1), move |args| {
            let path = path_arg(args, 0)?;
            let mut store = remove_store.write();
            let existed = data::has(&store, path);
            *store = data::delete(&store, path);
            Ok(DataValue::Bool(existed))
        })
}

fn events_table() -> CapabilityTable {
    CapabilityTable::new("Events", CapabilityScope::Category(ScriptCategory::Server))
        .engine_function("on", Arity::Exact(2), |ctx, args| {
            let name = event_name(ctx, &args[0])?;
            if !args[1].is_function() {
                return Err(Exception::throw_type(ctx, "Events.on expects a handler function"));
            }

            let events: Object = ctx.globals().get(EVENT_SLOT)?;
            let handlers = match events.get::<_, Option<Array>>(name.as_str())? {
                Some(handlers) => handlers,
                None => {
                    let handlers = Array::new(ctx.clone())?;
                    events.set(name.as_str(), handlers.clone())?;
                    handlers
                }
            };
            let count = handlers.len();
            handlers.set(count, args[1].clone())?;
            Ok(Value::new_int(ctx.clone(), (count + 1) as i32))
        })
        .engine_function("off", Arity::Exact(1), |ctx, args| {
            let name = event_name(ctx, &args[0])?;
            let events: Object = ctx.globals().get(EVENT_SLOT)?;
            let existed = events.contains_key(name.as_str())?;
            events.remove(name.as_str())?;
            Ok(Value::new_bool(ctx.clone(), existed))
        })
}

fn event_name(ctx: &Ctx<'_>, value: &Value<'_>) -> rquickjs::Result<String> {
    match value.as_string() {
        Some(name) => name.to_string(),
        None => Err(Exception::throw_type(ctx, "event name must be a string")),
    }
}
