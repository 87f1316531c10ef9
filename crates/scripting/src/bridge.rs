//! Host futures as engine promises
//!
//! A bridged promise is settled in three hops:
//!
//! 1. The host future runs on the tokio runtime and may finish on any thread.
//! 2. Its completion handler only enqueues a callback on the [`TickQueue`].
//! 3. On the next tick drain the callback enters the context, resolves or
//!    rejects the promise and clears its slot.
//!
//! The resolve/reject pair lives in a hidden engine object keyed by
//! correlation id, so nothing engine-owned ever crosses a thread.

use crate::context::{ContextCell, GENERATION_SLOT, PENDING_SLOT};
use crate::convert::from_data;
use crate::error::ScriptError;
use crate::tick::TickQueue;
use futures::FutureExt;
use rquickjs::function::Constructor;
use rquickjs::{Ctx, Function, Object, Promise, Value};
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tickscript_core::{CorrelationId, IdGenerator};
use tickscript_data::DataValue;
use tokio::runtime::Handle;

/// How a bridged promise ends
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Resolve(DataValue),
    Reject(String),
}

struct BridgeInner {
    ids: IdGenerator,
    queue: Arc<dyn TickQueue>,
    runtime: Handle,
    cell: Weak<ContextCell>,
    settled: AtomicU64,
    dropped: AtomicU64,
}

/// Converts host futures into engine promises
#[derive(Clone)]
pub struct AsyncBridge {
    inner: Arc<BridgeInner>,
}

impl AsyncBridge {
    pub fn new(queue: Arc<dyn TickQueue>, runtime: Handle, cell: Weak<ContextCell>) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                ids: IdGenerator::new(),
                queue,
                runtime,
                cell,
                settled: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Promises created but not yet settled
    pub fn outstanding(&self) -> usize {
        self.inner.ids.outstanding()
    }

    /// Promises settled so far
    pub fn settled(&self) -> u64 {
        self.inner.settled.load(Ordering::Acquire)
    }

    /// Settlements dropped because their context was gone
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Acquire)
    }

    /// Bridge `future` into a promise for the live context
    ///
    /// Must be called while the context is entered. The promise resolves
    /// with the serialized output, or rejects with the failure's underlying
    /// cause when it has one. A panicking future rejects too.
    pub fn bridge<'js, T, F>(&self, ctx: &Ctx<'js>, future: F) -> rquickjs::Result<Promise<'js>>
    where
        T: Serialize + Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (id, generation, promise) = self.register(ctx)?;

        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let settlement = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(output)) => match serde_json::to_value(output) {
                    Ok(json) => Settlement::Resolve(DataValue::from(json)),
                    Err(e) => Settlement::Reject(ScriptError::BridgeConversion(e.to_string()).to_string()),
                },
                Ok(Err(e)) => Settlement::Reject(failure_message(&e)),
                Err(_) => {
                    tracing::error!("Host future for promise {} panicked", id);
                    Settlement::Reject("host operation panicked".to_string())
                }
            };

            let settle = inner.clone();
            inner
                .queue
                .schedule(Box::new(move || settle.settle(id, generation, settlement)));
        });

        Ok(promise)
    }

    /// A promise that resolves once `ticks` ticks have passed
    pub fn delay<'js>(&self, ctx: &Ctx<'js>, ticks: u64) -> rquickjs::Result<Promise<'js>> {
        let (id, generation, promise) = self.register(ctx)?;

        let inner = self.inner.clone();
        self.inner.queue.schedule_after(
            ticks,
            Box::new(move || inner.settle(id, generation, Settlement::Resolve(DataValue::Null))),
        );

        Ok(promise)
    }

    /// Forget every outstanding promise; their settlements will no-op
    pub fn release_pending(&self) -> usize {
        self.inner.ids.release_all()
    }

    fn register<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<(CorrelationId, u64, Promise<'js>)> {
        // The entered context's own generation, not whatever the cell holds now
        let generation = ctx.globals().get::<_, f64>(GENERATION_SLOT)? as u64;

        let (promise, resolve, reject) = ctx.promise()?;
        let id = self.inner.ids.allocate();

        let entry = Object::new(ctx.clone())?;
        entry.set("resolve", resolve)?;
        entry.set("reject", reject)?;
        let pending: Object = ctx.globals().get(PENDING_SLOT)?;
        pending.set(id.to_string(), entry)?;

        tracing::trace!("Bridged promise {} (generation {})", id, generation);
        Ok((id, generation, promise))
    }
}

/// Message a failed host future rejects with
fn failure_message(error: &anyhow::Error) -> String {
    match error.chain().nth(1) {
        Some(cause) => cause.to_string(),
        None => error.to_string(),
    }
}

impl BridgeInner {
    /// Runs on the tick that drains the queued callback
    fn settle(&self, id: CorrelationId, generation: u64, settlement: Settlement) {
        let live = self.cell.upgrade().and_then(|cell| cell.current());
        let context = match live {
            Some(context) if context.generation() == generation => context,
            other => {
                let current = other.map(|c| c.generation()).unwrap_or_default();
                tracing::debug!(
                    "Dropping settlement for promise {}: {}",
                    id,
                    ScriptError::StaleContext {
                        recorded: generation,
                        current,
                    }
                );
                self.ids.release(id);
                self.dropped.fetch_add(1, Ordering::AcqRel);
                return;
            }
        };

        let guard = match context.enter() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::debug!("Dropping settlement for promise {}: {}", id, e);
                self.ids.release(id);
                self.dropped.fetch_add(1, Ordering::AcqRel);
                return;
            }
        };

        let key = id.to_string();
        let outcome = guard.with(|ctx| -> rquickjs::Result<bool> {
            let pending: Object = ctx.globals().get(PENDING_SLOT)?;
            let Some(entry) = pending.get::<_, Option<Object>>(key.as_str())? else {
                return Ok(false);
            };
            pending.remove(key.as_str())?;

            match settlement {
                Settlement::Resolve(value) => match from_data(&ctx, &value) {
                    Ok(value) => entry.get::<_, Function>("resolve")?.call::<_, ()>((value,))?,
                    Err(e) => {
                        let reason = ScriptError::BridgeConversion(e.to_string()).to_string();
                        reject(&ctx, &entry, &reason)?
                    }
                },
                Settlement::Reject(reason) => reject(&ctx, &entry, &reason)?,
            }
            Ok(true)
        });
        guard.run_pending_jobs();
        drop(guard);

        self.ids.release(id);
        match outcome {
            Ok(true) => {
                self.settled.fetch_add(1, Ordering::AcqRel);
            }
            Ok(false) => tracing::debug!("Promise {} was already settled", id),
            Err(e) => tracing::error!("Failed to settle promise {}: {}", id, e),
        }
    }
}

fn reject<'js>(ctx: &Ctx<'js>, entry: &Object<'js>, reason: &str) -> rquickjs::Result<()> {
    let error: Value = ctx
        .globals()
        .get::<_, Constructor>("Error")?
        .construct((reason,))?;
    entry.get::<_, Function>("reject")?.call::<_, ()>((error,))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{EngineConfig, ExecutionContext};
    use crate::tick::TickScheduler;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    struct Fixture {
        _runtime: tokio::runtime::Runtime,
        queue: Arc<TickScheduler>,
        cell: Arc<ContextCell>,
        bridge: AsyncBridge,
    }

    impl Fixture {
        fn new() -> Self {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let queue = Arc::new(TickScheduler::new());
            let cell = Arc::new(ContextCell::new());
            let bridge = AsyncBridge::new(queue.clone(), runtime.handle().clone(), Arc::downgrade(&cell));
            let fixture = Self {
                _runtime: runtime,
                queue,
                cell,
                bridge,
            };
            fixture.context();
            fixture
        }

        fn context(&self) -> Arc<ExecutionContext> {
            self.cell
                .get_or_create(|generation| {
                    ExecutionContext::create(
                        generation,
                        &EngineConfig::default(),
                        None,
                        Arc::new(AtomicBool::new(false)),
                    )
                })
                .unwrap()
        }

        /// Bridge a future and record its outcome in `globalThis.outcome`
        fn bridge<T, F>(&self, future: F)
        where
            T: Serialize + Send + 'static,
            F: Future<Output = anyhow::Result<T>> + Send + 'static,
        {
            let context = self.context();
            let guard = context.enter().unwrap();
            let bridge = self.bridge.clone();
            guard.with(move |ctx| {
                let promise = bridge.bridge(&ctx, future).unwrap();
                ctx.globals().set("promise", promise).unwrap();
                let _: Value = ctx
                    .eval("promise.then((v) => { globalThis.outcome = { value: v } }, (e) => { globalThis.outcome = { error: e.message } })")
                    .unwrap();
            });
        }

        fn outcome(&self) -> serde_json::Value {
            let context = self.context();
            let guard = context.enter().unwrap();
            guard.run_pending_jobs();
            guard.with(|ctx| {
                let value: Value = ctx.eval("globalThis.outcome").unwrap();
                crate::convert::to_data(&value).unwrap().to_json()
            })
        }

        fn wait_for_queue(&self) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.queue.pending() == 0 {
                assert!(Instant::now() < deadline, "future never completed");
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }

    #[test]
    fn test_resolves_only_after_drain() {
        let fixture = Fixture::new();
        fixture.bridge(async { Ok::<_, anyhow::Error>(serde_json::json!({"hp": 42})) });

        fixture.wait_for_queue();
        assert_eq!(fixture.outcome(), serde_json::Value::Null);
        assert_eq!(fixture.bridge.outstanding(), 1);

        assert_eq!(fixture.queue.drain(), 1);
        assert_eq!(fixture.outcome(), serde_json::json!({"value": {"hp": 42}}));
        assert_eq!(fixture.bridge.outstanding(), 0);
        assert_eq!(fixture.bridge.settled(), 1);
    }

    #[test]
    fn test_failure_rejects_with_cause() {
        let fixture = Fixture::new();
        fixture.bridge(async { Err::<(), _>(anyhow::anyhow!("boom")) });
        fixture.wait_for_queue();
        fixture.queue.drain();
        assert_eq!(fixture.outcome(), serde_json::json!({"error": "boom"}));

        let fixture = Fixture::new();
        fixture.bridge(async {
            Err::<(), _>(anyhow::Error::new(std::io::Error::other("disk gone")).context("lookup failed"))
        });
        fixture.wait_for_queue();
        fixture.queue.drain();
        assert_eq!(fixture.outcome(), serde_json::json!({"error": "disk gone"}));
    }

    #[test]
    fn test_panicking_future_rejects() {
        let fixture = Fixture::new();
        fixture.bridge(async {
            let missing: Option<u32> = None;
            Ok::<_, anyhow::Error>(missing.expect("host bug"))
        });
        fixture.wait_for_queue();
        fixture.queue.drain();
        assert_eq!(fixture.outcome(), serde_json::json!({"error": "host operation panicked"}));
        assert_eq!(fixture.bridge.outstanding(), 0);
    }

    #[test]
    fn test_conversion_failure_rejects() {
        let fixture = Fixture::new();
        fixture.bridge(async {
            let mut map = BTreeMap::new();
            map.insert((1, 2), "tuple keys cannot become object keys");
            Ok::<_, anyhow::Error>(map)
        });
        fixture.wait_for_queue();
        fixture.queue.drain();

        let outcome = fixture.outcome();
        let message = outcome["error"].as_str().unwrap();
        assert!(message.starts_with("Failed to convert host result"), "{}", message);
    }

    #[test]
    fn test_settlement_after_reset_is_dropped() {
        let fixture = Fixture::new();
        fixture.bridge(async { Ok::<_, anyhow::Error>(1) });
        fixture.wait_for_queue();

        fixture.cell.reset();
        fixture.bridge.release_pending();
        assert_eq!(fixture.queue.drain(), 1);
        assert_eq!(fixture.bridge.settled(), 0);
        assert_eq!(fixture.bridge.dropped(), 1);

        // The fresh context never saw the promise
        assert_eq!(fixture.outcome(), serde_json::Value::Null);
    }

    #[test]
    fn test_promise_records_entered_generation() {
        let fixture = Fixture::new();
        let _live = fixture.context();
        let detached =
            ExecutionContext::create(7, &EngineConfig::default(), None, Arc::new(AtomicBool::new(false))).unwrap();
        {
            let guard = detached.enter().unwrap();
            let bridge = fixture.bridge.clone();
            guard.with(move |ctx| {
                let _ = bridge.delay(&ctx, 1).unwrap();
            });
        }

        fixture.queue.drain();
        assert_eq!(fixture.bridge.settled(), 0);
        assert_eq!(fixture.bridge.dropped(), 1);
        assert_eq!(fixture.bridge.outstanding(), 0);
    }

    #[test]
    fn test_settlement_that_cannot_enter_is_released() {
        let fixture = Fixture::new();
        let context = fixture.context();
        {
            let guard = context.enter().unwrap();
            let bridge = fixture.bridge.clone();
            guard.with(move |ctx| {
                let _ = bridge.delay(&ctx, 1).unwrap();
            });
        }

        // Draining while this thread owns the context makes the entry fail
        let guard = context.enter().unwrap();
        assert_eq!(fixture.queue.drain(), 1);
        drop(guard);

        assert_eq!(fixture.bridge.outstanding(), 0);
        assert_eq!(fixture.bridge.dropped(), 1);
        assert_eq!(fixture.bridge.settled(), 0);
    }

    #[test]
    fn test_delay_resolves_after_ticks() {
        let fixture = Fixture::new();
        let context = fixture.context();
        {
            let guard = context.enter().unwrap();
            let bridge = fixture.bridge.clone();
            guard.with(move |ctx| {
                let promise = bridge.delay(&ctx, 2).unwrap();
                ctx.globals().set("promise", promise).unwrap();
                let _: Value = ctx.eval("promise.then(() => { globalThis.outcome = 'done' })").unwrap();
            });
        }

        fixture.queue.drain();
        assert_eq!(fixture.outcome(), serde_json::Value::Null);
        fixture.queue.drain();
        assert_eq!(fixture.outcome(), serde_json::json!("done"));
        assert_eq!(fixture.bridge.outstanding(), 0);
    }
}
