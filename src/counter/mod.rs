//! Distributed Counter.
//!
//! Counters live in the internal `__counters` cache as a [`CounterRecord`].
//! Strong counters update through non-commutative functions evaluated at the
//! primary, which makes compare-and-set linearizable and bounds exact. Weak
//! counters replicate each addition as a delta; backups apply it to their own
//! copy, deduplicated by command id, so additions converge in any order.
//!
//! Boundary crossings of strong counters are detected by the primary and
//! broadcast to every member, where counter listeners are invoked.

pub mod state;

use crate::cache::context::NodeContext;
use crate::dispatch::TriangleDispatcher;
use crate::error::{CounterError, Error, Result};
use crate::events::{EntryEvent, EventOrigin, Subscription};
use crate::functions::{decode_value, encode_value, EntryFunction, FunctionResult};
use crate::network::rpc::{CounterNotification, Message};
use crate::types::{EntryKey, EntryMetadata, WriteCommand, WriteKind, WriteResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

pub use state::{CounterOp, CounterRecord, CounterReply, CounterState};

/// Internal cache holding counter records.
pub const COUNTERS_CACHE: &str = "__counters";

/// Internal cache holding counter definitions.
pub const COUNTER_CONFIGS_CACHE: &str = "__counter_configs";

/// Consistency class of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterKind {
    /// Linearizable, optionally bounded.
    Strong,
    /// Eventually consistent, unbounded.
    Weak,
}

impl CounterKind {
    fn name(&self) -> &'static str {
        match self {
            CounterKind::Strong => "strong",
            CounterKind::Weak => "weak",
        }
    }
}

/// Definition of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Consistency class.
    pub kind: CounterKind,
    /// Value at creation and after reset.
    pub initial_value: i64,
    /// Inclusive lower bound (strong only).
    pub lower_bound: Option<i64>,
    /// Inclusive upper bound (strong only).
    pub upper_bound: Option<i64>,
}

impl CounterConfig {
    /// A strong counter.
    pub fn strong(initial_value: i64) -> Self {
        Self {
            kind: CounterKind::Strong,
            initial_value,
            lower_bound: None,
            upper_bound: None,
        }
    }

    /// A weak counter.
    pub fn weak(initial_value: i64) -> Self {
        Self {
            kind: CounterKind::Weak,
            ..Self::strong(initial_value)
        }
    }

    /// Set the lower bound.
    pub fn with_lower_bound(mut self, lower: i64) -> Self {
        self.lower_bound = Some(lower);
        self
    }

    /// Set the upper bound.
    pub fn with_upper_bound(mut self, upper: i64) -> Self {
        self.upper_bound = Some(upper);
        self
    }

    /// Check the definition is coherent.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.kind == CounterKind::Weak
            && (self.lower_bound.is_some() || self.upper_bound.is_some())
        {
            return Err("weak counters are unbounded".to_string());
        }
        if let (Some(lower), Some(upper)) = (self.lower_bound, self.upper_bound) {
            if lower > upper {
                return Err(format!("lower bound {} above upper bound {}", lower, upper));
            }
        }
        if !self.init_record().admits(self.initial_value) {
            return Err(format!(
                "initial value {} outside bounds",
                self.initial_value
            ));
        }
        Ok(())
    }

    /// Record of a fresh or reset counter.
    pub fn init_record(&self) -> CounterRecord {
        CounterRecord {
            value: self.initial_value,
            lower: self.lower_bound,
            upper: self.upper_bound,
        }
    }
}

/// A counter moved into another boundary state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEvent {
    /// Counter name.
    pub name: String,
    /// Value after the update.
    pub value: i64,
    /// State after the update.
    pub state: CounterState,
}

/// Callback for counter events.
pub type CounterListener = Arc<dyn Fn(&CounterEvent) + Send + Sync>;

struct Shared {
    ctx: Arc<NodeContext>,
    dispatcher: Arc<TriangleDispatcher>,
    listeners: DashMap<String, Vec<(u64, CounterListener)>>,
    next_listener: AtomicU64,
}

impl Shared {
    async fn submit(&self, key: &EntryKey, kind: WriteKind) -> Result<WriteResult> {
        let command = WriteCommand::new(self.ctx.next_command_id(), key.cache.clone(), kind);
        self.dispatcher.submit(command, key.clone()).await
    }

    async fn counter_op(&self, key: &EntryKey, op: CounterOp) -> Result<CounterReply> {
        let result = self
            .submit(key, WriteKind::Functional(EntryFunction::Counter(op)))
            .await?;
        match result.function {
            Some(FunctionResult::Counter(reply)) => Ok(reply),
            other => Err(Error::Internal(format!("unexpected counter result {:?}", other))),
        }
    }

    async fn read_value(&self, key: &EntryKey, config: &CounterConfig) -> Result<i64> {
        match self.dispatcher.read(key).await? {
            Some(entry) => Ok(decode_value::<CounterRecord>(&entry)?.value),
            None => Ok(config.initial_value),
        }
    }

    async fn reset(&self, key: &EntryKey, config: &CounterConfig) -> Result<()> {
        self.submit(
            key,
            WriteKind::Put {
                value: encode_value(&config.init_record()),
                metadata: EntryMetadata::default(),
            },
        )
        .await?;
        Ok(())
    }

    /// Invoke local listeners.
    fn deliver(&self, event: &CounterEvent) {
        let listeners: Vec<CounterListener> = match self.listeners.get(&event.name) {
            Some(list) => list.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
        };
        for listener in listeners {
            listener(event);
        }
    }

    /// Deliver an event to every member of the view.
    fn broadcast(&self, event: CounterEvent) {
        let view = self.ctx.monitor.view();
        for member in view.members {
            if member == self.ctx.node_id {
                self.deliver(&event);
                continue;
            }
            let transport = self.ctx.transport.clone();
            let node_id = self.ctx.node_id;
            let msg = Message::CounterNotification(CounterNotification {
                name: event.name.clone(),
                value: event.value,
                state: event.state,
            });
            tokio::spawn(async move {
                if let Err(e) = transport.request(member, msg).await {
                    debug!(node_id, member, error = %e, "Counter notification lost");
                }
            });
        }
    }
}

/// Detect boundary crossings at the primary.
fn on_counter_event(shared: &Weak<Shared>, event: &EntryEvent) {
    if event.origin != EventOrigin::Primary {
        return;
    }
    let (Some(previous), Some(value)) = (&event.previous, &event.value) else {
        return;
    };
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let decode = |bytes: &bytes::Bytes| bincode::deserialize::<CounterRecord>(bytes).ok();
    let (Some(previous), Some(current)) = (decode(previous), decode(value)) else {
        return;
    };
    if previous.state() == current.state() {
        return;
    }

    let counter = CounterEvent {
        name: String::from_utf8_lossy(&event.key.key).into_owned(),
        value: current.value,
        state: current.state(),
    };
    info!(
        node_id = shared.ctx.node_id,
        counter = %counter.name,
        value = counter.value,
        state = ?counter.state,
        "Counter changed boundary state"
    );
    shared.broadcast(counter);
}

/// Counter definitions and handles of one node.
pub struct CounterService {
    shared: Arc<Shared>,
    _subscription: Subscription,
}

impl CounterService {
    /// Create the service and start observing counter updates.
    pub fn new(ctx: Arc<NodeContext>, dispatcher: Arc<TriangleDispatcher>) -> Self {
        let shared = Arc::new(Shared {
            ctx,
            dispatcher,
            listeners: DashMap::new(),
            next_listener: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&shared);
        let subscription = shared.ctx.events.subscribe(
            COUNTERS_CACHE,
            Arc::new(move |event: &EntryEvent| on_counter_event(&weak, event)),
        );
        Self {
            shared,
            _subscription: subscription,
        }
    }

    fn config_key(name: &str) -> EntryKey {
        EntryKey::new(COUNTER_CONFIGS_CACHE, name.as_bytes().to_vec())
    }

    fn counter_key(name: &str) -> EntryKey {
        EntryKey::new(COUNTERS_CACHE, name.as_bytes().to_vec())
    }

    /// Define a counter. Returns `false` if it was already defined.
    pub async fn define_counter(&self, name: &str, config: CounterConfig) -> Result<bool> {
        config.validate().map_err(Error::Config)?;

        let defined = self
            .shared
            .submit(
                &Self::config_key(name),
                WriteKind::Functional(EntryFunction::PutIfAbsent {
                    value: encode_value(&config),
                    metadata: EntryMetadata::default(),
                }),
            )
            .await?;
        let defined = matches!(defined.function, Some(FunctionResult::Inserted(true)));
        if defined {
            // Boundary crossings are measured against the stored record.
            self.shared
                .submit(
                    &Self::counter_key(name),
                    WriteKind::Functional(EntryFunction::PutIfAbsent {
                        value: encode_value(&config.init_record()),
                        metadata: EntryMetadata::default(),
                    }),
                )
                .await?;
        }
        debug!(
            node_id = self.shared.ctx.node_id,
            counter = name,
            kind = config.kind.name(),
            defined,
            "Define counter"
        );
        Ok(defined)
    }

    /// Whether a counter is defined.
    pub async fn is_defined(&self, name: &str) -> Result<bool> {
        Ok(self.shared.dispatcher.read(&Self::config_key(name)).await?.is_some())
    }

    async fn config(&self, name: &str, requested: CounterKind) -> Result<CounterConfig> {
        let entry = self
            .shared
            .dispatcher
            .read(&Self::config_key(name))
            .await?
            .ok_or_else(|| CounterError::Undefined(name.to_string()))?;
        let config: CounterConfig = decode_value(&entry)?;
        if config.kind != requested {
            return Err(CounterError::WrongKind {
                name: name.to_string(),
                actual: config.kind.name(),
                requested: requested.name(),
            }
            .into());
        }
        Ok(config)
    }

    /// Handle on a strong counter.
    pub async fn get_strong(&self, name: &str) -> Result<StrongCounter> {
        let config = self.config(name, CounterKind::Strong).await?;
        Ok(StrongCounter {
            shared: self.shared.clone(),
            name: name.to_string(),
            key: Self::counter_key(name),
            config,
        })
    }

    /// Handle on a weak counter.
    pub async fn get_weak(&self, name: &str) -> Result<WeakCounter> {
        let config = self.config(name, CounterKind::Weak).await?;
        Ok(WeakCounter {
            shared: self.shared.clone(),
            name: name.to_string(),
            key: Self::counter_key(name),
            config,
        })
    }

    /// Remove a counter definition and its value.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let removed = self
            .shared
            .submit(&Self::config_key(name), WriteKind::Remove)
            .await?
            .modified;
        self.shared
            .submit(&Self::counter_key(name), WriteKind::Remove)
            .await?;
        debug!(
            node_id = self.shared.ctx.node_id,
            counter = name,
            removed,
            "Remove counter"
        );
        Ok(removed)
    }

    /// Handle a boundary notification from a counter's primary.
    pub fn handle_notification(&self, notification: CounterNotification) {
        self.shared.deliver(&CounterEvent {
            name: notification.name,
            value: notification.value,
            state: notification.state,
        });
    }
}

impl std::fmt::Debug for CounterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterService")
            .field("node_id", &self.shared.ctx.node_id)
            .field("listened", &self.shared.listeners.len())
            .finish()
    }
}

/// Registration of a counter listener.
pub struct CounterSubscription {
    shared: Arc<Shared>,
    name: String,
    id: u64,
}

impl CounterSubscription {
    /// Remove the listener.
    pub fn cancel(self) {
        if let Some(mut list) = self.shared.listeners.get_mut(&self.name) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for CounterSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterSubscription")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

/// Linearizable, optionally bounded counter.
pub struct StrongCounter {
    shared: Arc<Shared>,
    name: String,
    key: EntryKey,
    config: CounterConfig,
}

impl StrongCounter {
    /// Counter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Counter definition.
    pub fn config(&self) -> CounterConfig {
        self.config
    }

    /// Current value, read at the primary.
    pub async fn get_value(&self) -> Result<i64> {
        self.shared.read_value(&self.key, &self.config).await
    }

    /// Set to `update` if the value is `expected`.
    ///
    /// Fails with [`CounterError::CasFailure`] carrying the current value.
    pub async fn compare_and_set(&self, expected: i64, update: i64) -> Result<()> {
        let previous = self.compare_and_swap(expected, update).await?;
        if previous != expected {
            return Err(CounterError::CasFailure { current: previous }.into());
        }
        Ok(())
    }

    /// Set to `update` if the value is `expected`; returns the value found.
    pub async fn compare_and_swap(&self, expected: i64, update: i64) -> Result<i64> {
        let op = CounterOp::CompareAndSwap {
            expected,
            update,
            init: self.config.init_record(),
        };
        match self.shared.counter_op(&self.key, op).await? {
            CounterReply::Updated { previous, .. } => Ok(previous),
            CounterReply::CasFailed { current } => {
                self.shared.ctx.metrics.cas_failures.inc();
                Ok(current)
            }
            CounterReply::BoundsExceeded { current } => {
                Err(CounterError::BoundsExceeded { current }.into())
            }
        }
    }

    /// Add `delta` and return the new value.
    pub async fn add_and_get(&self, delta: i64) -> Result<i64> {
        let op = CounterOp::Add {
            delta,
            init: self.config.init_record(),
        };
        match self.shared.counter_op(&self.key, op).await? {
            CounterReply::Updated { current, .. } => Ok(current),
            CounterReply::BoundsExceeded { current } | CounterReply::CasFailed { current } => {
                Err(CounterError::BoundsExceeded { current }.into())
            }
        }
    }

    /// Add one and return the new value.
    pub async fn increment_and_get(&self) -> Result<i64> {
        self.add_and_get(1).await
    }

    /// Subtract one and return the new value.
    pub async fn decrement_and_get(&self) -> Result<i64> {
        self.add_and_get(-1).await
    }

    /// Return to the initial value.
    pub async fn reset(&self) -> Result<()> {
        self.shared.reset(&self.key, &self.config).await
    }

    /// Listen for boundary crossings; invoked on every member.
    pub fn add_listener(&self, listener: CounterListener) -> CounterSubscription {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .entry(self.name.clone())
            .or_default()
            .push((id, listener));
        CounterSubscription {
            shared: self.shared.clone(),
            name: self.name.clone(),
            id,
        }
    }
}

impl std::fmt::Debug for StrongCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrongCounter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

/// Eventually consistent counter replicated as deltas.
pub struct WeakCounter {
    shared: Arc<Shared>,
    name: String,
    key: EntryKey,
    config: CounterConfig,
}

impl WeakCounter {
    /// Counter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value, read at the primary.
    pub async fn get_value(&self) -> Result<i64> {
        self.shared.read_value(&self.key, &self.config).await
    }

    /// Add `delta`.
    pub async fn add(&self, delta: i64) -> Result<()> {
        let op = CounterOp::WeakAdd {
            delta,
            init: self.config.init_record(),
        };
        self.shared.counter_op(&self.key, op).await?;
        Ok(())
    }

    /// Add one.
    pub async fn increment(&self) -> Result<()> {
        self.add(1).await
    }

    /// Subtract one.
    pub async fn decrement(&self) -> Result<()> {
        self.add(-1).await
    }

    /// Return to the initial value.
    pub async fn reset(&self) -> Result<()> {
        self.shared.reset(&self.key, &self.config).await
    }
}

impl std::fmt::Debug for WeakCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakCounter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}
