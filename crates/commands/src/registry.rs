//! Command registry
//!
//! Durable home of every [`CommandDescriptor`]. Builders read from here,
//! edit a copy and write it back, so a builder view never owns state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tickscript_scripting::{ContextListener, EngineHost, ExecutionContext};

use crate::builder::CommandBuilder;
use crate::descriptor::CommandDescriptor;
use crate::error::Result;

/// Receiver of registered commands, e.g. a console or a client-side
/// completion tree
///
/// Survives engine resets.
pub trait CommandDispatcher: Send + Sync {
    /// A command was added or changed
    fn publish(&self, descriptor: &CommandDescriptor);

    /// A command was removed
    fn retract(&self, name: &str);
}

#[derive(Default)]
struct CachedContext {
    context: Weak<ExecutionContext>,
    generation: u64,
}

pub struct CommandRegistry {
    host: Arc<EngineHost>,
    commands: DashMap<String, CommandDescriptor>,
    dispatcher: RwLock<Option<Arc<dyn CommandDispatcher>>>,
    cached: Mutex<CachedContext>,
    stale: AtomicBool,
    refreshes: AtomicU64,
}

impl CommandRegistry {
    /// Create a registry and subscribe it to the host's reset notifications
    pub fn new(host: Arc<EngineHost>) -> Arc<Self> {
        let registry = Arc::new(Self {
            host: host.clone(),
            commands: DashMap::new(),
            dispatcher: RwLock::new(None),
            cached: Mutex::new(CachedContext::default()),
            stale: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
        });

        let listener: Weak<dyn ContextListener> = Arc::<Self>::downgrade(&registry);
        host.add_listener(listener);
        registry
    }

    pub fn host(&self) -> &Arc<EngineHost> {
        &self.host
    }

    /// Start building (or keep building) a top-level command
    pub fn command(self: &Arc<Self>, name: &str) -> CommandBuilder {
        let name = name.to_lowercase();
        if !self.commands.contains_key(&name) {
            self.persist(CommandDescriptor::new(name.clone()));
        }
        CommandBuilder::new(self.clone(), name, Vec::new())
    }

    /// Snapshot of a registered command
    pub fn get(&self, name: &str) -> Option<CommandDescriptor> {
        self.commands.get(&name.to_lowercase()).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(&name.to_lowercase())
    }

    /// Registered command names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn unregister(&self, name: &str) -> Option<CommandDescriptor> {
        let (name, descriptor) = self.commands.remove(&name.to_lowercase())?;
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.retract(&name);
        }
        tracing::debug!("Unregistered command '{}'", name);
        Some(descriptor)
    }

    /// Attach the dispatcher and publish everything registered so far
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn CommandDispatcher>) {
        for entry in self.commands.iter() {
            dispatcher.publish(entry.value());
        }
        *self.dispatcher.write() = Some(dispatcher);
    }

    pub fn dispatcher(&self) -> Option<Arc<dyn CommandDispatcher>> {
        self.dispatcher.read().clone()
    }

    /// Copy of the stored descriptor, or a fresh one if absent
    pub(crate) fn working_copy(&self, name: &str) -> CommandDescriptor {
        self.commands
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| CommandDescriptor::new(name))
    }

    /// Store a descriptor under its name and publish it
    pub(crate) fn persist(&self, descriptor: CommandDescriptor) {
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.publish(&descriptor);
        }
        self.commands.insert(descriptor.name.clone(), descriptor);
    }

    /// Whether a reset happened since the cached context was taken
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// The cached context, if it is still alive
    pub fn context(&self) -> Option<Arc<ExecutionContext>> {
        self.cached.lock().context.upgrade()
    }

    /// Generation of the cached context, 0 before the first refresh
    pub fn cached_generation(&self) -> u64 {
        self.cached.lock().generation
    }

    /// How many times the cached context has been refreshed
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Re-read the host's live context, creating it if needed
    pub fn refresh(&self) -> Result<Arc<ExecutionContext>> {
        let context = self.host.get_or_create_context()?;
        {
            let mut cached = self.cached.lock();
            cached.context = Arc::downgrade(&context);
            cached.generation = context.generation();
        }
        self.stale.store(false, Ordering::Release);
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Command registry refreshed to generation {}", context.generation());
        Ok(context)
    }

    /// Refresh only if a reset invalidated the cache
    pub(crate) fn refresh_if_stale(&self) {
        if !self.is_stale() {
            return;
        }
        if let Err(e) = self.refresh() {
            tracing::warn!("Command registry refresh failed: {}", e);
        }
    }

    /// Make sure the cached context is live before an executor runs
    pub(crate) fn ensure_fresh(&self) -> Result<u64> {
        if !self.is_stale() {
            let cached = self.cached.lock();
            if cached.context.strong_count() > 0 {
                return Ok(cached.generation);
            }
        }
        Ok(self.refresh()?.generation())
    }
}

impl ContextListener for CommandRegistry {
    fn context_invalidated(&self, generation: u64) {
        self.stale.store(true, Ordering::Release);
        tracing::debug!(
            "Command registry marked stale ({} commands kept, new generation {})",
            self.commands.len(),
            generation
        );
    }
}
