//! Engine host
//!
//! [`EngineHost`] owns the single shared execution context and everything
//! that outlives it: the module resolver, the async bridge, the host store
//! and the registered capability tables.

use crate::argv::Invocation;
use crate::bridge::AsyncBridge;
use crate::capabilities::{
    standard_names, standard_tables, CapabilityTable, StandardDeps, EXIT_ERROR_NAME, EXIT_MARKER, INVOCATION,
};
use crate::context::{ContextCell, ContextGuard, EngineConfig, ExecutionContext, EVENT_SLOT};
use crate::convert::{from_data, to_data};
use crate::error::{Result, ScriptError, ScriptResult};
use crate::resolver::{EngineLoader, FileSystem, ModuleResolver, StdFileSystem};
use crate::sanitize::{describe, extract_location, sanitize_message};
use crate::tick::TickQueue;
use parking_lot::{Mutex, RwLock};
use rquickjs::{Array, CatchResultExt, CaughtError, Ctx, Function, Module, Object, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tickscript_core::{ScriptCategory, ScriptHandle, ScriptStatus};
use tickscript_data::DataValue;
use tokio::runtime::Handle;

/// Times `evaluate` refetches a context that a reset retired under it
const MAX_ENTER_ATTEMPTS: usize = 3;

/// Links followed when looking for the exit signal in an error's causes
const MAX_CAUSE_DEPTH: usize = 8;

/// Notified when the shared context is replaced
pub trait ContextListener: Send + Sync {
    /// Any context reference held from before `generation` is stale
    fn context_invalidated(&self, generation: u64);
}

/// Per-call values exposed to one script run
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    pub values: BTreeMap<String, DataValue>,
    pub invocation: Option<Invocation>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn with_invocation(mut self, invocation: Invocation) -> Self {
        self.invocation = Some(invocation);
        self
    }
}

enum Evaluation {
    Finished(DataValue),
    Suspended,
}

/// Owner of the shared execution context
pub struct EngineHost {
    config: EngineConfig,
    cell: Arc<ContextCell>,
    bridge: AsyncBridge,
    resolver: Arc<ModuleResolver>,
    queue: Arc<dyn TickQueue>,
    custom: RwLock<Vec<CapabilityTable>>,
    store: Arc<RwLock<DataValue>>,
    exit_requested: Arc<AtomicBool>,
    listeners: Mutex<Vec<Weak<dyn ContextListener>>>,
    runs: AtomicU64,
    context_runs: AtomicU64,
}

impl EngineHost {
    pub fn new(config: EngineConfig, queue: Arc<dyn TickQueue>, runtime: Handle) -> Self {
        Self::with_filesystem(config, queue, runtime, Arc::new(StdFileSystem))
    }

    /// Create a host whose module loads go through `filesystem`
    pub fn with_filesystem(
        config: EngineConfig,
        queue: Arc<dyn TickQueue>,
        runtime: Handle,
        filesystem: Arc<dyn FileSystem>,
    ) -> Self {
        let cell = Arc::new(ContextCell::new());
        let bridge = AsyncBridge::new(queue.clone(), runtime, Arc::downgrade(&cell));
        let resolver = Arc::new(ModuleResolver::new(config.working_root.clone(), filesystem));
        for name in standard_names() {
            resolver.add_builtin(name);
        }

        Self {
            config,
            cell,
            bridge,
            resolver,
            queue,
            custom: RwLock::new(Vec::new()),
            store: Arc::new(RwLock::new(DataValue::empty_map())),
            exit_requested: Arc::new(AtomicBool::new(false)),
            listeners: Mutex::new(Vec::new()),
            runs: AtomicU64::new(0),
            context_runs: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bridge(&self) -> &AsyncBridge {
        &self.bridge
    }

    pub fn resolver(&self) -> &Arc<ModuleResolver> {
        &self.resolver
    }

    pub fn queue(&self) -> &Arc<dyn TickQueue> {
        &self.queue
    }

    /// Generation of the live (or next) context
    pub fn generation(&self) -> u64 {
        self.cell.generation()
    }

    /// Scripts evaluated since the context was last reset
    pub fn runs_since_reset(&self) -> u64 {
        self.context_runs.load(Ordering::Acquire)
    }

    /// Whether the context has run enough scripts to be recycled
    ///
    /// Every run declares at least one module the engine keeps until the
    /// context goes away, so a long-lived context grows without bound. The
    /// owner is expected to [`reset`](Self::reset) once this turns true.
    pub fn recycle_due(&self) -> bool {
        self.config.recycle_after > 0 && self.runs_since_reset() >= self.config.recycle_after
    }

    /// Live context without creating one
    pub fn current_context(&self) -> Option<Arc<ExecutionContext>> {
        self.cell.current()
    }

    /// Register an additional capability, importable under its name
    ///
    /// Tables are installed when a context is created; registering after
    /// that takes effect on the next [`reset`](Self::reset).
    pub fn register_capability(&self, table: CapabilityTable) -> Result<()> {
        if self.resolver.is_builtin(table.name()) {
            return Err(ScriptError::HostInternal(format!(
                "capability '{}' is already registered",
                table.name()
            )));
        }
        if self.cell.current().is_some() {
            tracing::warn!(
                "Capability '{}' registered after context creation, visible after the next reset",
                table.name()
            );
        }

        self.resolver.add_builtin(table.name());
        self.custom.write().push(table);
        Ok(())
    }

    /// Snapshot of the host store
    pub fn store(&self) -> DataValue {
        self.store.read().clone()
    }

    /// Replace the host store with `f(current)`
    pub fn update_store<F>(&self, f: F)
    where
        F: FnOnce(&DataValue) -> DataValue,
    {
        let mut store = self.store.write();
        *store = f(&store);
    }

    pub fn add_listener(&self, listener: Weak<dyn ContextListener>) {
        self.listeners.lock().push(listener);
    }

    /// Return the live context, creating and populating it if needed
    pub fn get_or_create_context(&self) -> Result<Arc<ExecutionContext>> {
        self.cell.get_or_create(|generation| {
            let context = ExecutionContext::create(
                generation,
                &self.config,
                Some(EngineLoader::new(self.resolver.clone())),
                self.exit_requested.clone(),
            )?;

            let deps = StandardDeps {
                generation,
                store: self.store.clone(),
                bridge: self.bridge.clone(),
                queue: self.queue.clone(),
                exit_requested: self.exit_requested.clone(),
            };
            let mut tables = standard_tables(&deps);
            tables.extend(self.custom.read().iter().cloned());
            context.install_tables(&tables)?;

            tracing::debug!("Installed {} capability tables", tables.len());
            Ok(context)
        })
    }

    /// Tear down the context and tell listeners their references are stale
    ///
    /// Script inventory and the host store are untouched.
    pub fn reset(&self) -> u64 {
        let generation = self.cell.reset();
        self.context_runs.store(0, Ordering::Release);
        let dropped = self.bridge.release_pending();
        tracing::info!(
            "Execution context reset, generation now {} ({} pending promises abandoned)",
            generation,
            dropped
        );

        let listeners: Vec<Arc<dyn ContextListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|listener| listener.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.context_invalidated(generation);
        }

        generation
    }

    /// Run a discovered script
    pub fn execute_script(&self, handle: &ScriptHandle, bindings: &Bindings) -> ScriptResult {
        match handle.status {
            ScriptStatus::Loaded => {}
            status => {
                let state = format!("{:?}", status).to_lowercase();
                let reason = format!("script '{}' is {}", handle.name, state);
                return ScriptResult::error(format!("Cannot run {}", reason), ScriptError::Refused(reason));
            }
        }
        if !handle.category.is_executable() {
            let reason = format!("'{}' is a module and cannot be run directly", handle.name);
            return ScriptResult::error(format!("Cannot run {}", reason), ScriptError::Refused(reason));
        }

        let source = match self.resolver.read_to_string(handle.location()) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!("Cannot read script '{}': {}", handle.name, e);
                return ScriptResult::error(format!("Cannot read script '{}'", handle.name), ScriptError::Io(e));
            }
        };

        self.evaluate(&handle.name, handle.location(), handle.category, &source, bindings)
    }

    /// Run source text as if it were a script at `<working root>/<name>`
    pub fn execute_source(
        &self,
        name: &str,
        category: ScriptCategory,
        source: &str,
        bindings: &Bindings,
    ) -> ScriptResult {
        let location = self.config.working_root.join(name);
        self.evaluate(name, &location, category, source, bindings)
    }

    /// Call every handler server scripts registered for `event`
    ///
    /// Handlers run in registration order. A failing handler is logged and
    /// the rest still run. Returns the number that completed.
    pub fn dispatch_event(&self, event: &str, payload: &DataValue) -> Result<usize> {
        let Some(context) = self.cell.current() else {
            return Ok(0);
        };

        let guard = match context.enter() {
            Ok(guard) => guard,
            Err(ScriptError::Retired(_)) => return Ok(0),
            Err(e) => return Err(e),
        };
        let handled = guard.with(|ctx| -> rquickjs::Result<usize> {
            let events: Object = ctx.globals().get(EVENT_SLOT)?;
            let Some(handlers) = events.get::<_, Option<Array>>(event)? else {
                return Ok(0);
            };

            let invoke = context.helper(&ctx, "invokeAll")?;
            let name = event.to_string();
            let report = Function::new(ctx.clone(), move |message: String| {
                tracing::warn!("Handler for event '{}' failed: {}", name, sanitize_message(&message));
            })?;
            let handled: i32 = invoke.call((handlers, from_data(&ctx, payload)?, report))?;
            Ok(handled.max(0) as usize)
        });
        guard.run_pending_jobs();
        context.clear_exit();

        let handled = handled?;
        tracing::debug!("Event '{}' handled by {} script handler(s)", event, handled);
        Ok(handled)
    }

    fn evaluate(
        &self,
        name: &str,
        location: &Path,
        category: ScriptCategory,
        source: &str,
        bindings: &Bindings,
    ) -> ScriptResult {
        // A reset may retire the context between fetching and entering it
        for _ in 0..MAX_ENTER_ATTEMPTS {
            let context = match self.get_or_create_context() {
                Ok(context) => context,
                Err(e) => return internal_failure(name, e),
            };
            match context.enter() {
                Ok(guard) => return self.run_entered(&context, guard, name, location, category, source, bindings),
                Err(ScriptError::Retired(generation)) => {
                    tracing::debug!("Context generation {} retired before '{}' could run", generation, name);
                }
                Err(e) => return internal_failure(name, e),
            };
        }
        internal_failure(
            name,
            ScriptError::HostInternal("execution context was reset on every attempt to enter it".into()),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn run_entered(
        &self,
        context: &ExecutionContext,
        guard: ContextGuard<'_>,
        name: &str,
        location: &Path,
        category: ScriptCategory,
        source: &str,
        bindings: &Bindings,
    ) -> ScriptResult {
        let run = self.runs.fetch_add(1, Ordering::AcqRel) + 1;
        self.context_runs.fetch_add(1, Ordering::AcqRel);
        self.resolver.advance_epoch();
        context.clear_exit();

        let module_name = format!("{}?run={}", location.display(), run);
        tracing::debug!("Running {} script '{}' as {}", category.as_str(), name, module_name);

        let outcome = guard.with(|ctx| -> Result<Evaluation> {
            context.apply_category(&ctx, category)?;
            install_bindings(context, &ctx, category, bindings)?;

            let evaluated = Module::declare(ctx.clone(), module_name.as_str(), source)
                .and_then(|module| module.eval())
                .and_then(|(module, promise)| match promise.finish::<()>() {
                    Ok(()) => {
                        let value: Value = module.namespace()?.get("default")?;
                        Ok(Some(to_data(&value).map_err(|e| {
                            rquickjs::Error::new_from_js_message("value", "DataValue", e.to_string())
                        })?))
                    }
                    Err(rquickjs::Error::WouldBlock) => {
                        track_completion(context, &ctx, name, promise)?;
                        Ok(None)
                    }
                    Err(e) => Err(e),
                })
                .catch(&ctx);

            match evaluated {
                Ok(Some(value)) => Ok(Evaluation::Finished(value)),
                Ok(None) => Ok(Evaluation::Suspended),
                Err(caught) => Err(classify(context, caught)),
            }
        });
        guard.run_pending_jobs();
        drop(guard);

        match outcome {
            Ok(Evaluation::Finished(value)) => ScriptResult::Success(value),
            Ok(Evaluation::Suspended) => {
                tracing::debug!("Script '{}' suspended on a pending promise", name);
                ScriptResult::Success(DataValue::Null)
            }
            Err(ScriptError::GracefulExit) => {
                tracing::debug!("Script '{}' exited", name);
                ScriptResult::Success(DataValue::Null)
            }
            Err(e) => report_failure(name, e),
        }
    }
}

fn install_bindings<'js>(
    context: &ExecutionContext,
    ctx: &Ctx<'js>,
    category: ScriptCategory,
    bindings: &Bindings,
) -> rquickjs::Result<()> {
    let mut scoped = Vec::with_capacity(bindings.values.len() + 1);
    for (name, value) in &bindings.values {
        scoped.push((name.clone(), from_data(ctx, value)?));
    }
    if category == ScriptCategory::Utility {
        let invocation = bindings
            .invocation
            .clone()
            .unwrap_or_else(|| Invocation::new("", Vec::new()));
        scoped.push((INVOCATION.to_string(), from_data(ctx, &invocation.to_data())?));
    }
    context.install_scoped(ctx, scoped)
}

/// Log a late rejection of a module suspended on top-level await
fn track_completion<'js>(
    context: &ExecutionContext,
    ctx: &Ctx<'js>,
    name: &str,
    promise: rquickjs::Promise<'js>,
) -> rquickjs::Result<()> {
    let track = context.helper(ctx, "trackCompletion")?;
    let script = name.to_string();
    let report = Function::new(ctx.clone(), move |message: String| {
        if message.contains(EXIT_MARKER) {
            tracing::debug!("Script '{}' exited", script);
        } else {
            tracing::warn!("Script '{}' failed after suspending: {}", script, sanitize_message(&message));
        }
    })?;
    track.call((promise, report))
}

fn classify(context: &ExecutionContext, caught: CaughtError<'_>) -> ScriptError {
    match caught {
        CaughtError::Error(e) => ScriptError::HostInternal(e.to_string()),
        CaughtError::Exception(exception) => {
            let message = exception.message().unwrap_or_default();
            let name: Option<String> = exception.as_object().get("name").ok().flatten();
            let location = exception.stack().as_deref().and_then(extract_location);

            if context.exit_requested() && is_exit_signal(exception.as_object()) {
                return ScriptError::GracefulExit;
            }
            if let Some(specifier) = failed_module(&message) {
                return ScriptError::ModuleResolution { specifier, message };
            }
            if name.as_deref() == Some("SyntaxError") {
                return ScriptError::Syntax { message, location };
            }
            ScriptError::Runtime { message, location }
        }
        CaughtError::Value(value) => {
            let thrown_exit = match (value.as_object(), value.as_string()) {
                (Some(object), _) => is_exit_signal(object),
                (None, Some(text)) => text.to_string().is_ok_and(|text| text.contains(EXIT_MARKER)),
                _ => false,
            };
            if context.exit_requested() && thrown_exit {
                return ScriptError::GracefulExit;
            }
            let message = match to_data(&value) {
                Ok(data) => format!("Uncaught {}", data),
                Err(_) => format!("Uncaught {}", value.type_name()),
            };
            ScriptError::Runtime {
                message,
                location: None,
            }
        }
    }
}

/// Whether `error`, or an error on its `cause` chain, is the exit signal
fn is_exit_signal(error: &Object<'_>) -> bool {
    let mut current = Some(error.clone());
    for _ in 0..MAX_CAUSE_DEPTH {
        let Some(error) = current.take() else {
            return false;
        };
        let name: Option<String> = error.get("name").ok().flatten();
        let message: Option<String> = error.get("message").ok().flatten();
        if name.as_deref() == Some(EXIT_ERROR_NAME) || message.is_some_and(|m| m.contains(EXIT_MARKER)) {
            return true;
        }
        current = error.get::<_, Option<Object>>("cause").ok().flatten();
    }
    false
}

/// Specifier named by an engine module resolution or load failure
fn failed_module(message: &str) -> Option<String> {
    let lowered = message.to_ascii_lowercase();
    let is_module_failure = lowered.starts_with("error resolving module")
        || lowered.starts_with("error loading module")
        || lowered.contains("could not load module");
    if !is_module_failure {
        return None;
    }

    let start = message.find('\'')? + 1;
    let end = start + message[start..].find('\'')?;
    Some(message[start..end].to_string())
}

fn report_failure(name: &str, error: ScriptError) -> ScriptResult {
    match &error {
        ScriptError::Syntax { message, location } | ScriptError::Runtime { message, location } => {
            let message = describe(message, location.as_deref());
            tracing::warn!("Script '{}' failed: {}", name, message);
            ScriptResult::error(message, error)
        }
        ScriptError::ModuleResolution { .. } => {
            let message = sanitize_message(&error.to_string());
            tracing::warn!("Script '{}' failed: {}", name, message);
            ScriptResult::error(message, error)
        }
        _ => internal_failure(name, error),
    }
}

fn internal_failure(name: &str, error: ScriptError) -> ScriptResult {
    tracing::error!("Host error while running '{}': {:?}", name, error);
    ScriptResult::error(format!("Internal error while running '{}'", name), error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Arity, CapabilityScope};
    use crate::tick::TickScheduler;
    use serde_json::json;
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        _runtime: tokio::runtime::Runtime,
        dir: tempfile::TempDir,
        queue: Arc<TickScheduler>,
        host: EngineHost,
    }

    fn fixture() -> Fixture {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(TickScheduler::new());
        let config = EngineConfig {
            working_root: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let host = EngineHost::new(config, queue.clone(), runtime.handle().clone());
        Fixture {
            _runtime: runtime,
            dir,
            queue,
            host,
        }
    }

    impl Fixture {
        fn script(&self, relative: &str, category: ScriptCategory, source: &str) -> ScriptHandle {
            let path = self.dir.path().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, source).unwrap();
            ScriptHandle::new(relative, path, category)
        }

        fn run(&self, relative: &str, category: ScriptCategory, source: &str) -> ScriptResult {
            let handle = self.script(relative, category, source);
            self.host.execute_script(&handle, &Bindings::new())
        }
    }

    fn value(result: &ScriptResult) -> serde_json::Value {
        match result {
            ScriptResult::Success(value) => value.to_json(),
            ScriptResult::Error { message, .. } => panic!("script failed: {}", message),
        }
    }

    #[test]
    fn test_default_export_is_result() {
        let fixture = fixture();
        let result = fixture.run("utility/sum.js", ScriptCategory::Utility, "export default [1, 2].map((n) => n * 2);");
        assert_eq!(value(&result), json!([2, 4]));

        let result = fixture.run("utility/none.js", ScriptCategory::Utility, "const x = 1;");
        assert_eq!(value(&result), json!(null));
    }

    #[test]
    fn test_context_is_shared_and_lazy() {
        let fixture = fixture();
        assert!(fixture.host.current_context().is_none());

        fixture.run("server/a.js", ScriptCategory::Server, "globalThis.counter = 1;");
        let result = fixture.run("server/b.js", ScriptCategory::Server, "export default ++globalThis.counter;");
        assert_eq!(value(&result), json!(2));
    }

    #[test]
    fn test_builtin_and_relative_imports() {
        let fixture = fixture();
        fixture.script("lib/math.js", ScriptCategory::Module, "export const double = (n) => n * 2;");
        let result = fixture.run(
            "utility/calc.js",
            ScriptCategory::Utility,
            r#"
            import Data from "Data";
            import { double } from "../lib/math.js";
            export default Data.get({ a: [double(21)] }, "a[0]");
            "#,
        );
        assert_eq!(value(&result), json!(42));
    }

    #[test]
    fn test_missing_module_is_reported() {
        let fixture = fixture();
        let result = fixture.run(
            "utility/broken.js",
            ScriptCategory::Utility,
            "import { x } from './missing.js'; export default x;",
        );
        assert!(!result.is_success());
    }

    #[test]
    fn test_category_capabilities_do_not_leak() {
        let fixture = fixture();
        let result = fixture.run(
            "bootstrap/init.js",
            ScriptCategory::Bootstrap,
            "Bootstrap.define('motd', 'welcome'); export default typeof Events;",
        );
        assert_eq!(value(&result), json!("undefined"));
        assert_eq!(fixture.host.store().to_json(), json!({"motd": "welcome"}));

        let result = fixture.run(
            "server/main.js",
            ScriptCategory::Server,
            "export default [typeof Bootstrap, typeof Events, Store.get('motd')];",
        );
        assert_eq!(value(&result), json!(["undefined", "object", "welcome"]));

        let result = fixture.run(
            "utility/peek.js",
            ScriptCategory::Utility,
            r#"import Bootstrap from "Bootstrap"; export default Bootstrap;"#,
        );
        assert!(!result.is_success());
    }

    #[test]
    fn test_shared_modules_follow_the_running_category() {
        let fixture = fixture();
        fixture.script(
            "lib/boot.js",
            ScriptCategory::Module,
            "import Bootstrap from 'Bootstrap'; export default Bootstrap;",
        );
        let result = fixture.run(
            "bootstrap/first.js",
            ScriptCategory::Bootstrap,
            "import B from '../lib/boot.js'; B.define('a', 1); globalThis.kept = B;",
        );
        assert!(result.is_success());

        let result = fixture.run(
            "server/second.js",
            ScriptCategory::Server,
            "import B from '../lib/boot.js'; B.define('leaked', true);",
        );
        assert!(matches!(result.cause(), Some(ScriptError::ModuleResolution { .. })));

        let result = fixture.run("server/third.js", ScriptCategory::Server, "kept.define('leaked', true);");
        assert!(!result.is_success());
        assert_eq!(fixture.host.store().to_json(), json!({"a": 1}));
    }

    #[test]
    fn test_shared_modules_see_each_invocation() {
        let fixture = fixture();
        fixture.script(
            "lib/who.js",
            ScriptCategory::Module,
            r#"
            import Invocation from "Invocation";
            export const caller = Invocation.caller;
            export const current = () => Invocation.caller;
            "#,
        );
        let handle = fixture.script(
            "utility/who.js",
            ScriptCategory::Utility,
            "import { caller, current } from '../lib/who.js'; export default [caller, current()];",
        );

        for name in ["alice", "bob"] {
            let bindings = Bindings::new().with_invocation(Invocation::new(name, Vec::new()));
            let result = fixture.host.execute_script(&handle, &bindings);
            assert_eq!(value(&result), json!([name, name]));
        }
    }

    #[test]
    fn test_utility_invocation() {
        let fixture = fixture();
        let handle = fixture.script(
            "utility/greet.js",
            ScriptCategory::Utility,
            r#"
            import Invocation from "Invocation";
            export default `${Invocation.caller}:${Invocation.args.positional[0]}:${Invocation.args.flags.loud}`;
            "#,
        );
        let bindings = Bindings::new().with_invocation(Invocation::new("alice", vec!["bob".into(), "--loud".into()]));
        let result = fixture.host.execute_script(&handle, &bindings);
        assert_eq!(value(&result), json!("alice:bob:true"));

        let result = fixture.run("server/check.js", ScriptCategory::Server, "export default typeof Invocation;");
        assert_eq!(value(&result), json!("undefined"));
    }

    #[test]
    fn test_per_call_bindings() {
        let fixture = fixture();
        let bindings = Bindings::new().with("player", json!({"name": "alice"}));
        let result = fixture
            .host
            .execute_source("player.js", ScriptCategory::Server, "export default player.name;", &bindings);
        assert_eq!(value(&result), json!("alice"));

        let result = fixture
            .host
            .execute_source("player.js", ScriptCategory::Server, "export default typeof player;", &Bindings::new());
        assert_eq!(value(&result), json!("undefined"));
    }

    #[test]
    fn test_errors_are_sanitized() {
        let fixture = fixture();
        let result = fixture.run(
            "utility/throw.js",
            ScriptCategory::Utility,
            "throw new Error('cannot read game.Player@1a2b3c4d');",
        );
        let message = result.message().unwrap();
        assert!(message.starts_with("cannot read <Player>"), "{}", message);
        assert!(matches!(result.cause(), Some(ScriptError::Runtime { .. })));

        let result = fixture.run("utility/syntax.js", ScriptCategory::Utility, "export default (;");
        assert!(matches!(result.cause(), Some(ScriptError::Syntax { .. })));
    }

    #[test]
    fn test_graceful_exit_is_success() {
        let fixture = fixture();
        let result = fixture.run("utility/exit.js", ScriptCategory::Utility, "Host.exit(); export default 1;");
        assert_eq!(value(&result), json!(null));

        let result = fixture.run(
            "utility/wrapped.js",
            ScriptCategory::Utility,
            "try { Host.exit(); } catch (e) { const wrapped = new Error('wrapped'); wrapped.cause = e; throw wrapped; }",
        );
        assert_eq!(value(&result), json!(null));

        let result = fixture.run("utility/after.js", ScriptCategory::Utility, "throw new Error('real');");
        assert!(!result.is_success());
    }

    #[test]
    fn test_swallowed_exit_does_not_hide_failures() {
        let fixture = fixture();
        let result = fixture.run(
            "utility/swallow.js",
            ScriptCategory::Utility,
            "try { Host.exit(); } catch (e) {} throw new Error('real failure');",
        );
        assert!(matches!(result.cause(), Some(ScriptError::Runtime { .. })));
        assert!(result.message().unwrap().contains("real failure"));

        let result = fixture.run(
            "utility/thrown.js",
            ScriptCategory::Utility,
            "try { Host.exit(); } catch (e) {} throw 'plain value';",
        );
        assert!(!result.is_success());

        // Without Host.exit() an error dressed up as the signal is a failure
        let result = fixture.run(
            "utility/forged.js",
            ScriptCategory::Utility,
            &format!("const e = new Error('{}'); e.name = '{}'; throw e;", EXIT_MARKER, EXIT_ERROR_NAME),
        );
        assert!(!result.is_success());
    }

    #[test]
    fn test_refused_handles() {
        let fixture = fixture();
        let handle = fixture
            .script("utility/off.js", ScriptCategory::Utility, "export default 1;")
            .with_status(ScriptStatus::Disabled);
        let result = fixture.host.execute_script(&handle, &Bindings::new());
        assert!(matches!(result.cause(), Some(ScriptError::Refused(_))));

        let handle = fixture.script("lib/only.js", ScriptCategory::Module, "export default 1;");
        let result = fixture.host.execute_script(&handle, &Bindings::new());
        assert!(matches!(result.cause(), Some(ScriptError::Refused(_))));
        assert!(fixture.host.current_context().is_none());
    }

    #[test]
    fn test_reset_clears_engine_state_and_notifies() {
        struct Counter(AtomicUsize, AtomicU64);
        impl ContextListener for Counter {
            fn context_invalidated(&self, generation: u64) {
                self.0.fetch_add(1, Ordering::SeqCst);
                self.1.store(generation, Ordering::SeqCst);
            }
        }

        let fixture = fixture();
        let counter = Arc::new(Counter(AtomicUsize::new(0), AtomicU64::new(0)));
        let weak: Weak<dyn ContextListener> = Arc::downgrade(&counter) as Weak<dyn ContextListener>;
        fixture.host.add_listener(weak);

        fixture.run("bootstrap/a.js", ScriptCategory::Bootstrap, "globalThis.leftover = 1; Bootstrap.define('kept', true);");
        let old = fixture.host.current_context().unwrap();
        assert_eq!(fixture.host.runs_since_reset(), 1);
        assert_eq!(fixture.host.reset(), 2);
        assert_eq!(fixture.host.runs_since_reset(), 0);
        assert!(matches!(old.enter(), Err(ScriptError::Retired(1))));
        drop(old);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(counter.1.load(Ordering::SeqCst), 2);

        let result = fixture.run(
            "server/b.js",
            ScriptCategory::Server,
            "export default [typeof leftover, Store.get('kept'), Host.generation];",
        );
        assert_eq!(value(&result), json!(["undefined", true, 2]));
    }

    #[test]
    fn test_dispatch_event() {
        let fixture = fixture();
        fixture.run(
            "server/events.js",
            ScriptCategory::Server,
            r#"
            globalThis.seen = [];
            Events.on("join", (p) => seen.push("first:" + p.name));
            Events.on("join", () => { throw new Error("bad handler"); });
            Events.on("join", (p) => seen.push("third:" + p.name));
            "#,
        );

        let handled = fixture.host.dispatch_event("join", &DataValue::from(json!({"name": "bob"}))).unwrap();
        assert_eq!(handled, 2);
        assert_eq!(fixture.host.dispatch_event("leave", &DataValue::Null).unwrap(), 0);

        let result = fixture.run("server/seen.js", ScriptCategory::Server, "export default seen;");
        assert_eq!(value(&result), json!(["first:bob", "third:bob"]));
    }

    #[test]
    fn test_wait_suspends_and_resumes() {
        let fixture = fixture();
        let result = fixture.run(
            "server/wait.js",
            ScriptCategory::Server,
            "import Scheduler from 'Scheduler'; await Scheduler.wait(1); globalThis.resumed = true;",
        );
        assert_eq!(value(&result), json!(null));

        let check = "export default globalThis.resumed === true;";
        assert_eq!(value(&fixture.run("server/p1.js", ScriptCategory::Server, check)), json!(false));
        fixture.queue.drain();
        assert_eq!(value(&fixture.run("server/p2.js", ScriptCategory::Server, check)), json!(true));
    }

    #[test]
    fn test_custom_capability() {
        let fixture = fixture();
        let world = CapabilityTable::new("World", CapabilityScope::Standard)
            .function("playerCount", Arity::Exact(0), |_| Ok(DataValue::Int(3)));
        fixture.host.register_capability(world.clone()).unwrap();
        assert!(fixture.host.register_capability(world).is_err());

        let result = fixture.run(
            "utility/world.js",
            ScriptCategory::Utility,
            "import World from 'World'; export default World.playerCount();",
        );
        assert_eq!(value(&result), json!(3));
    }

    #[test]
    fn test_failed_module_specifier() {
        assert_eq!(
            failed_module("Error resolving module './x.js' from 'a.js': not found"),
            Some("./x.js".to_string())
        );
        assert_eq!(failed_module("x is not defined"), None);
    }
}
