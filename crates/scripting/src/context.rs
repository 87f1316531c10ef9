//! Execution context lifecycle
//!
//! There is at most one live [`ExecutionContext`]. It is created lazily by
//! [`ContextCell::get_or_create`] and torn down by [`ContextCell::reset`].
//! Engine state is only touched while holding a [`ContextGuard`].

use crate::capabilities::{CapabilityScope, CapabilityTable};
use crate::error::{Result, ScriptError};
use crate::resolver::{EngineLoader, CAPABILITY_SLOT};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rquickjs::{Context, Ctx, Function, Object, Runtime, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tickscript_core::ScriptCategory;

/// Pending promise settlers keyed by correlation id
pub const PENDING_SLOT: &str = "__tickscript_pending";
/// Precompiled helper functions
pub const HELPER_SLOT: &str = "__tickscript_helpers";
/// Category-scoped capability objects, copied in per call
pub const CATEGORY_SLOT: &str = "__tickscript_categories";
/// Event handlers registered by server scripts
pub const EVENT_SLOT: &str = "__tickscript_events";
/// Generation of the context, read back when promises are bridged
pub const GENERATION_SLOT: &str = "__tickscript_generation";

/// Pure helpers compiled once per context
const HELPERS: &[(&str, &str)] = &[
    (
        "trackCompletion",
        "((promise, report) => { promise.then(undefined, (e) => report(e instanceof Error ? e.message : String(e))); })",
    ),
    (
        "invokeAll",
        "((handlers, payload, report) => {
            let handled = 0;
            for (const handler of handlers.slice()) {
                try { handler(payload); handled++; }
                catch (e) { report(e instanceof Error ? e.message : String(e)); }
            }
            return handled;
        })",
    ),
];

/// Engine limits applied to every new runtime
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root for non-relative module specifiers
    pub working_root: PathBuf,
    /// Heap limit in bytes, 0 for none
    pub memory_limit: usize,
    /// Stack limit in bytes, 0 for the engine default
    pub max_stack_size: usize,
    /// Runs after which the context should be recycled, 0 for never
    pub recycle_after: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            working_root: PathBuf::from("scripts"),
            memory_limit: 0,
            max_stack_size: 0,
            recycle_after: 0,
        }
    }
}

/// A capability object installed in a context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub scope: CapabilityScope,
    pub members: Vec<String>,
}

/// The shared engine state scripts run against
pub struct ExecutionContext {
    generation: u64,
    runtime: Runtime,
    context: Context,
    owner: Mutex<()>,
    owner_thread: Mutex<Option<ThreadId>>,
    retired: AtomicBool,
    bindings: RwLock<BTreeMap<String, Binding>>,
    scoped: Mutex<Vec<String>>,
    working_root: PathBuf,
    exit_requested: Arc<AtomicBool>,
}

impl ExecutionContext {
    /// Build a fresh runtime and context and compile the helper cache
    pub fn create(
        generation: u64,
        config: &EngineConfig,
        loader: Option<EngineLoader>,
        exit_requested: Arc<AtomicBool>,
    ) -> Result<Self> {
        let runtime = Runtime::new()?;
        if config.memory_limit > 0 {
            runtime.set_memory_limit(config.memory_limit);
        }
        if config.max_stack_size > 0 {
            runtime.set_max_stack_size(config.max_stack_size);
        }
        if let Some(loader) = loader {
            runtime.set_loader(loader.clone(), loader);
        }

        let context = Context::full(&runtime)?;
        context.with(|ctx| -> rquickjs::Result<()> {
            let globals = ctx.globals();
            for slot in [CAPABILITY_SLOT, PENDING_SLOT, CATEGORY_SLOT, EVENT_SLOT] {
                globals.set(slot, Object::new(ctx.clone())?)?;
            }

            let helpers = Object::new(ctx.clone())?;
            for (name, source) in HELPERS {
                let function: Function = ctx.eval(*source)?;
                helpers.set(*name, function)?;
            }
            globals.set(HELPER_SLOT, helpers)?;
            globals.set(GENERATION_SLOT, generation as f64)?;
            Ok(())
        })?;

        tracing::debug!("Created execution context generation {}", generation);

        Ok(Self {
            generation,
            runtime,
            context,
            owner: Mutex::new(()),
            owner_thread: Mutex::new(None),
            retired: AtomicBool::new(false),
            bindings: RwLock::new(BTreeMap::new()),
            scoped: Mutex::new(Vec::new()),
            working_root: config.working_root.clone(),
            exit_requested,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn working_root(&self) -> &Path {
        &self.working_root
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    pub fn clear_exit(&self) {
        self.exit_requested.store(false, Ordering::Release);
    }

    /// Installed capability names and their members
    pub fn bindings(&self) -> BTreeMap<String, Binding> {
        self.bindings.read().clone()
    }

    /// Whether a reset has taken this context out of service
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Take exclusive ownership of the engine
    ///
    /// Blocks while another thread is evaluating. Entering again from the
    /// thread that already owns the context is an error, and so is entering
    /// a context a reset has retired.
    pub fn enter(&self) -> Result<ContextGuard<'_>> {
        let me = thread::current().id();
        if *self.owner_thread.lock() == Some(me) {
            return Err(ScriptError::HostInternal(
                "execution context is already entered on this thread".into(),
            ));
        }

        let owner = self.owner.lock();
        if self.is_retired() {
            return Err(ScriptError::Retired(self.generation));
        }
        *self.owner_thread.lock() = Some(me);
        Ok(ContextGuard {
            context: self,
            _owner: owner,
        })
    }

    /// Wait for any in-flight evaluation to leave, then refuse new entries
    pub(crate) fn retire(&self) {
        let _owner = self.owner.lock();
        self.retired.store(true, Ordering::Release);
    }

    /// Build every table and place it in its slot
    ///
    /// Standard tables become globals and built-in modules right away.
    /// Category tables are parked in the category slot until
    /// [`apply_category`](Self::apply_category) copies them in.
    pub fn install_tables(&self, tables: &[CapabilityTable]) -> Result<()> {
        let guard = self.enter()?;
        guard.with(|ctx| -> rquickjs::Result<()> {
            let globals = ctx.globals();
            let capabilities: Object = globals.get(CAPABILITY_SLOT)?;
            let categories: Object = globals.get(CATEGORY_SLOT)?;

            for table in tables {
                let object = table.build(&ctx)?;
                match table.scope() {
                    CapabilityScope::Standard => {
                        capabilities.set(table.name(), object.clone())?;
                        globals.set(table.name(), object)?;
                    }
                    CapabilityScope::Category(_) => categories.set(table.name(), object)?,
                }
            }
            Ok(())
        })?;

        let mut bindings = self.bindings.write();
        for table in tables {
            bindings.insert(
                table.name().to_string(),
                Binding {
                    scope: table.scope(),
                    members: table.member_names(),
                },
            );
        }
        Ok(())
    }

    /// Expose the capability sets of `category` and withdraw all others
    pub fn apply_category(&self, ctx: &Ctx<'_>, category: ScriptCategory) -> rquickjs::Result<()> {
        let globals = ctx.globals();
        let capabilities: Object = globals.get(CAPABILITY_SLOT)?;
        let categories: Object = globals.get(CATEGORY_SLOT)?;

        for (name, binding) in self.bindings.read().iter() {
            let CapabilityScope::Category(scope) = binding.scope else {
                continue;
            };
            if scope == category {
                let object: Value = categories.get(name.as_str())?;
                capabilities.set(name.as_str(), object.clone())?;
                globals.set(name.as_str(), object)?;
            } else {
                capabilities.remove(name.as_str())?;
                globals.remove(name.as_str())?;
            }
        }
        Ok(())
    }

    /// Replace the per-call globals left by the previous call
    pub fn install_scoped<'js>(&self, ctx: &Ctx<'js>, values: Vec<(String, Value<'js>)>) -> rquickjs::Result<()> {
        let globals = ctx.globals();
        let capabilities: Object = globals.get(CAPABILITY_SLOT)?;

        let mut scoped = self.scoped.lock();
        for name in scoped.drain(..) {
            capabilities.remove(name.as_str())?;
            globals.remove(name.as_str())?;
        }
        for (name, value) in values {
            capabilities.set(name.as_str(), value.clone())?;
            globals.set(name.as_str(), value)?;
            scoped.push(name);
        }
        Ok(())
    }

    /// A precompiled helper by name
    pub fn helper<'js>(&self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Function<'js>> {
        let helpers: Object = ctx.globals().get(HELPER_SLOT)?;
        helpers.get(name)
    }
}

/// Exclusive, scoped access to a context's engine
pub struct ContextGuard<'a> {
    context: &'a ExecutionContext,
    _owner: MutexGuard<'a, ()>,
}

impl<'a> ContextGuard<'a> {
    pub fn context(&self) -> &'a ExecutionContext {
        self.context
    }

    /// Run `f` against the engine
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R + Send,
        R: Send,
    {
        self.context.context.with(f)
    }

    /// Drive queued engine jobs (promise reactions) to completion
    pub fn run_pending_jobs(&self) -> usize {
        let mut ran = 0;
        while self.context.runtime.is_job_pending() {
            match self.context.runtime.execute_pending_job() {
                Ok(true) => ran += 1,
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!("Pending script job failed: {:?}", e);
                    ran += 1;
                }
            }
        }
        ran
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        *self.context.owner_thread.lock() = None;
    }
}

/// Holder of the one live context
///
/// Reads take only the slot's read lock. Creation and reset serialize on a
/// separate creation lock, so a reset can never interleave with a creation.
pub struct ContextCell {
    slot: RwLock<Option<Arc<ExecutionContext>>>,
    creation: Mutex<()>,
    generation: AtomicU64,
}

impl ContextCell {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
            creation: Mutex::new(()),
            generation: AtomicU64::new(1),
        }
    }

    /// The live context, if one exists
    pub fn current(&self) -> Option<Arc<ExecutionContext>> {
        self.slot.read().clone()
    }

    /// Generation the live (or next) context carries
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Return the live context, creating it with `create` if needed
    pub fn get_or_create<F>(&self, create: F) -> Result<Arc<ExecutionContext>>
    where
        F: FnOnce(u64) -> Result<ExecutionContext>,
    {
        if let Some(context) = self.slot.read().as_ref() {
            return Ok(context.clone());
        }

        let _creation = self.creation.lock();
        if let Some(context) = self.slot.read().as_ref() {
            return Ok(context.clone());
        }

        let generation = self.generation();
        let context = Arc::new(create(generation)?);
        *self.slot.write() = Some(context.clone());
        tracing::info!("Execution context ready (generation {})", generation);
        Ok(context)
    }

    /// Tear down the live context and advance the generation
    ///
    /// Waits for an in-flight evaluation to leave before the old context is
    /// released. Anyone still holding the old context can no longer enter
    /// it. Returns the new generation.
    pub fn reset(&self) -> u64 {
        let _creation = self.creation.lock();
        let retired = self.slot.write().take();
        if let Some(old) = &retired {
            old.retire();
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        drop(retired);
        generation
    }
}

impl Default for ContextCell {
    fn default() -> Self {
        Self::new()
    }
}
