//! Areas: trigger handling, subscribed-message handling and round scheduling
//!
//! An [`Area`] wraps a [`Node`] with two handler tables and a round state
//! machine:
//! - Triggers: named callables invoked remotely through command frames.
//!   `comply` queues a one-shot invocation (demand), `autoloop` a persistent one.
//! - Alterations: callables keyed by `(source, slot)` that are armed when a
//!   matching broadcast arrives. An armed alteration runs once per round no
//!   matter how many messages armed it.
//!
//! [`Area::proceed`] is the only round transition. The event loop calls it
//! whenever input goes quiet, so bursts of traffic collapse into one round.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use super::error::Result;
use super::history::Context;
use super::node::Node;
use super::scheduler::{Round, Sequential, Strategy};
use super::transport::{Inbound, SocketId};
use super::{Address, Interface, RuntimeConfig, Subscription};

/// Keyword parameters of a trigger invocation
pub type Params = Map<String, Value>;

/// Trigger or alteration callable
pub type Handler<S> = Rc<dyn Fn(&mut Area<S>, &Params) -> anyhow::Result<()>>;

/// Pulse, activity and idle callbacks
pub type Hook<S> = Rc<dyn Fn(&mut Area<S>) -> anyhow::Result<()>>;

/// Callback run after every processed broadcast with its source and slot
pub type Observer<S> = Rc<dyn Fn(&mut Area<S>, &str, Option<&str>) -> anyhow::Result<()>>;

/// Key naming the remote procedure in a command frame
pub const TRIGGER_KEY: &str = "trigger";

/// Built-in trigger that stops the event loop
pub const EXIT_TRIGGER: &str = "exit";

/// Identity of an installed callable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(usize);

impl HandlerId {
    /// Installation index
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

type Route = (Option<String>, Option<String>);

/// A node with triggers, alterations and a round scheduler
///
/// `S` is application state owned by the area. Only the event loop touches
/// it, so handlers get plain `&mut` access through [`Area::state_mut`].
pub struct Area<S = ()> {
    node: Node,
    state: S,
    context: Context,
    time: u64,

    timeout: Option<Duration>,
    linger: Duration,
    puller: bool,
    subscriptions: BTreeMap<String, Subscription>,

    callables: Vec<Handler<S>>,
    triggers: HashMap<String, HandlerId>,
    routes: HashMap<Route, HandlerId>,

    demand: BTreeMap<HandlerId, Params>,
    loops: BTreeMap<HandlerId, Params>,
    alterations: BTreeSet<HandlerId>,
    altered: BTreeSet<HandlerId>,

    pulse: Option<Hook<S>>,
    activity: Option<Hook<S>>,
    observer: Option<Observer<S>>,
    idle: Option<Hook<S>>,
    strategy: Rc<dyn Strategy<S>>,
}

impl<S: 'static> Area<S> {
    /// Create an area from the startup configuration
    ///
    /// Sockets are opened later by [`Area::setup`].
    pub fn new(config: &RuntimeConfig, state: S) -> Result<Self> {
        config.validate()?;

        let mut area = Self {
            node: Node::new(config),
            state,
            context: Context::new(config.context_values.clone()),
            time: 1,
            timeout: config.poll_timeout()?,
            linger: config.linger_duration()?,
            puller: config.puller,
            subscriptions: config.subscriptions.clone(),
            callables: Vec::new(),
            triggers: HashMap::new(),
            routes: HashMap::new(),
            demand: BTreeMap::new(),
            loops: BTreeMap::new(),
            alterations: BTreeSet::new(),
            altered: BTreeSet::new(),
            pulse: None,
            activity: None,
            observer: None,
            idle: None,
            strategy: Rc::new(Sequential),
        };

        area.register(EXIT_TRIGGER, |area, _| {
            area.stop();
            Ok(())
        });

        Ok(area)
    }

    /// Bind the command receiver (when enabled) and follow configured sources
    ///
    /// Must be called from within a tokio runtime.
    pub fn setup(&mut self) -> Result<()> {
        if self.puller {
            self.node.bind_commands()?;
        }

        let subscriptions = std::mem::take(&mut self.subscriptions);
        for (source, subscription) in &subscriptions {
            self.subscribe(source, subscription.slots.as_deref(), subscription.buffer_length)?;
        }
        self.subscriptions = subscriptions;
        Ok(())
    }

    /// Follow `source` (every topic when `slots` is `None`) and allocate its history
    pub fn subscribe(&mut self, source: &str, slots: Option<&[String]>, capacity: usize) -> Result<SocketId> {
        let socket = self.node.subscribe(source, slots.unwrap_or(&[]))?;
        self.context.init(source, slots, capacity);
        Ok(socket)
    }

    /// Area name
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Current round, starting at 1
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Application state
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Mutable application state
    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Message history and context values
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Mutable context
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Underlying node
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Resolve an interface address (this area when `name` is `None`)
    pub fn resolve(&self, kind: Interface, name: Option<&str>) -> Result<&Address> {
        self.node.resolve(kind, name)
    }

    // --- trigger sub-protocol ---

    /// Install a callable without naming it
    pub fn install<F>(&mut self, callable: F) -> HandlerId
    where
        F: Fn(&mut Area<S>, &Params) -> anyhow::Result<()> + 'static,
    {
        let id = HandlerId(self.callables.len());
        self.callables.push(Rc::new(callable));
        id
    }

    /// Install `callable` as the trigger `name`; the last registration wins
    pub fn register<F>(&mut self, name: &str, callable: F) -> HandlerId
    where
        F: Fn(&mut Area<S>, &Params) -> anyhow::Result<()> + 'static,
    {
        let id = self.install(callable);
        self.register_id(name, id);
        id
    }

    /// Expose an installed callable as the trigger `name`
    pub fn register_id(&mut self, name: &str, id: HandlerId) {
        if let Some(previous) = self.triggers.insert(name.to_string(), id) {
            tracing::debug!("Trigger '{}' rebound from {} to {}", name, previous, id);
        }
    }

    /// Callable registered for a trigger
    pub fn trigger_id(&self, name: &str) -> Option<HandlerId> {
        self.triggers.get(name).copied()
    }

    /// Queue one invocation of `trigger` for the next round
    ///
    /// Replaces any invocation of the same callable already queued. Unknown
    /// triggers are logged and dropped.
    pub fn comply(&mut self, trigger: &str, params: Params) {
        match self.trigger_id(trigger) {
            Some(id) => {
                tracing::trace!("{} demand {} ({})", self.name(), trigger, id);
                self.demand.insert(id, params);
            }
            None => tracing::warn!("{} has no trigger '{}'; call dropped", self.name(), trigger),
        }
    }

    /// Invoke `trigger` every round with `params` until replaced
    pub fn autoloop(&mut self, trigger: &str, params: Params) {
        match self.trigger_id(trigger) {
            Some(id) => {
                tracing::trace!("{} autoloop {} ({})", self.name(), trigger, id);
                self.loops.insert(id, params);
            }
            None => tracing::warn!("{} has no trigger '{}'; autoloop dropped", self.name(), trigger),
        }
    }

    // --- message sub-protocol ---

    /// Install `callable` for broadcasts from `source` on `slot`
    ///
    /// `None` acts as a wildcard. One callable per key; the last wins.
    pub fn alteration<F>(&mut self, source: Option<&str>, slot: Option<&str>, callable: F) -> HandlerId
    where
        F: Fn(&mut Area<S>, &Params) -> anyhow::Result<()> + 'static,
    {
        let id = self.install(callable);
        self.alteration_id(source, slot, id);
        id
    }

    /// Route `(source, slot)` to an already installed callable
    pub fn alteration_id(&mut self, source: Option<&str>, slot: Option<&str>, id: HandlerId) {
        self.routes
            .insert((source.map(str::to_string), slot.map(str::to_string)), id);
    }

    /// Resolve the alteration for a broadcast: exact, then source-only, then global
    pub fn route(&self, source: &str, slot: Option<&str>) -> Option<HandlerId> {
        let source = Some(source.to_string());
        [
            (source.clone(), slot.map(str::to_string)),
            (source, None),
            (None, None),
        ]
        .iter()
        .find_map(|key| self.routes.get(key).copied())
    }

    /// Record a subscribed broadcast and arm its alteration
    ///
    /// Broadcasts from sources this area never subscribed to are logged and
    /// dropped.
    pub fn process(&mut self, source: &str, message: Value, slot: Option<&str>) {
        if !self.context.is_tracking(source) {
            tracing::warn!("{} is not subscribed to '{}'; message dropped", self.name(), source);
            return;
        }

        self.context.imprint(source, message, slot, self.time);
        if let Some(id) = self.route(source, slot) {
            self.alterations.insert(id);
        }
    }

    /// Process a broadcast, then run the message observer
    pub fn deliver(&mut self, source: &str, message: Value, slot: Option<&str>) -> Result<()> {
        self.process(source, message, slot);
        if let Some(observer) = self.observer.clone() {
            observer(self, source, slot)?;
        }
        Ok(())
    }

    /// Re-arm the alteration for `(source, slot)` for the next round
    pub fn alter(&mut self, source: &str, slot: Option<&str>) {
        match self.route(source, slot) {
            Some(id) => {
                self.altered.insert(id);
            }
            None => tracing::warn!(
                "{} has no alteration for '{}' slot {:?}",
                self.name(),
                source,
                slot
            ),
        }
    }

    // --- round callbacks ---

    /// Callback run at the end of every round
    pub fn on_pulse<F>(&mut self, callback: F)
    where
        F: Fn(&mut Area<S>) -> anyhow::Result<()> + 'static,
    {
        self.pulse = Some(Rc::new(callback));
    }

    /// Callback run after a round that dispatched any work
    pub fn on_activity<F>(&mut self, callback: F)
    where
        F: Fn(&mut Area<S>) -> anyhow::Result<()> + 'static,
    {
        self.activity = Some(Rc::new(callback));
    }

    /// Callback run after every processed broadcast
    pub fn observe<F>(&mut self, callback: F)
    where
        F: Fn(&mut Area<S>, &str, Option<&str>) -> anyhow::Result<()> + 'static,
    {
        self.observer = Some(Rc::new(callback));
    }

    /// Replace the plain [`Area::proceed`] run when input goes quiet
    pub fn on_idle<F>(&mut self, callback: F)
    where
        F: Fn(&mut Area<S>) -> anyhow::Result<()> + 'static,
    {
        self.idle = Some(Rc::new(callback));
    }

    /// Install a custom round strategy
    pub fn set_strategy(&mut self, strategy: impl Strategy<S> + 'static) {
        self.strategy = Rc::new(strategy);
    }

    // --- round state machine ---

    /// Queued one-shot invocations
    pub fn demand(&self) -> &BTreeMap<HandlerId, Params> {
        &self.demand
    }

    /// Persistent invocations
    pub fn loops(&self) -> &BTreeMap<HandlerId, Params> {
        &self.loops
    }

    /// Alterations armed for the next round
    pub fn alterations(&self) -> &BTreeSet<HandlerId> {
        &self.alterations
    }

    /// Run one installed callable
    pub fn invoke(&mut self, handler: HandlerId, params: &Params) -> anyhow::Result<()> {
        let callable = self
            .callables
            .get(handler.0)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} is not installed", handler))?;
        callable(self, params)
    }

    /// Close the current round
    ///
    /// Merges loops into demand (loop wins), folds re-armed alterations in,
    /// dispatches the work through the strategy, runs `activity` if there was
    /// work and `pulse` unconditionally, then advances the round counter.
    /// Callable failures are returned as-is and leave the counter untouched.
    pub fn proceed(&mut self) -> Result<()> {
        let mut looped = BTreeSet::new();
        for (id, params) in &self.loops {
            self.demand.insert(*id, params.clone());
            looped.insert(*id);
        }

        let altered = std::mem::take(&mut self.altered);
        self.alterations.extend(altered.iter().copied());

        if !self.demand.is_empty() || !self.alterations.is_empty() {
            let round = Round {
                demand: std::mem::take(&mut self.demand),
                alterations: std::mem::take(&mut self.alterations),
                looped,
                altered,
            };
            tracing::trace!(
                "{} round {}: {} demanded, {} altered",
                self.name(),
                self.time,
                round.demand.len(),
                round.alterations.len()
            );

            let strategy = Rc::clone(&self.strategy);
            strategy.schedule(self, &round)?;

            if let Some(activity) = self.activity.clone() {
                activity(self)?;
            }
        }

        if let Some(pulse) = self.pulse.clone() {
            pulse(self)?;
        }

        self.time += 1;
        Ok(())
    }

    /// Round boundary reached by input quiescence
    pub fn quiesce(&mut self) -> Result<()> {
        match self.idle.clone() {
            Some(idle) => Ok(idle(self)?),
            None => self.proceed(),
        }
    }

    // --- transport ---

    /// Broadcast `message` on `slot` (the default slot when `None`)
    pub fn publish<T: Serialize + ?Sized>(&mut self, message: &T, slot: Option<&str>) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.node.publish(slot.unwrap_or(""), &payload)
    }

    /// Ask `target` to comply with `name(params)`
    ///
    /// Fire-and-forget: an unknown target name is an error, an unreachable one
    /// is not.
    pub fn trigger(&self, target: &str, name: &str, mut params: Params) -> Result<()> {
        params.insert(TRIGGER_KEY.to_string(), Value::String(name.to_string()));
        let payload = serde_json::to_vec(&params)?;
        self.node.send_command(target, payload)
    }

    // --- event loop ---

    /// Whether the event loop keeps running
    pub fn is_running(&self) -> bool {
        self.node.is_running()
    }

    /// Stop the event loop after its current iteration
    pub fn stop(&mut self) {
        self.node.stop();
    }

    /// Handle one delivery from the node
    pub fn dispatch(&mut self, inbound: Inbound) -> Result<()> {
        match inbound {
            Inbound::Broadcast {
                socket,
                topic,
                payload,
            } => {
                let Some(source) = self.node.source_of(socket).map(str::to_string) else {
                    tracing::warn!("{} dropped a broadcast from unknown {}", self.name(), socket);
                    return Ok(());
                };
                let slot = (!topic.is_empty()).then_some(topic.as_str());
                self.deliver(&source, payload, slot)
            }
            Inbound::Command(command) => {
                self.receive_command(command);
                Ok(())
            }
            Inbound::Interrupt => {
                tracing::info!("{} interrupted", self.name());
                self.stop();
                Ok(())
            }
        }
    }

    fn receive_command(&mut self, command: Value) {
        let Value::Object(mut params) = command else {
            tracing::warn!("{} dropped a command that is not an object", self.name());
            return;
        };

        match params.remove(TRIGGER_KEY) {
            Some(Value::String(trigger)) => self.comply(&trigger, params),
            _ => tracing::warn!("{} dropped a command without a trigger name", self.name()),
        }
    }

    /// One loop iteration: wait for input, drain everything queued, close the round
    ///
    /// A stop request ends the drain early, but the round still closes so
    /// whatever was already processed gets dispatched.
    pub async fn turn(&mut self) -> Result<()> {
        let mut wait = self.timeout;
        while let Some(inbound) = self.node.poll(wait).await {
            self.dispatch(inbound)?;
            if !self.is_running() {
                break;
            }
            wait = Some(Duration::ZERO);
        }
        self.quiesce()
    }

    /// Run the event loop until stopped, then tear the transport down
    ///
    /// A failing callable ends the loop and its error is returned after
    /// teardown.
    pub async fn run(&mut self) -> Result<()> {
        self.node.watch_interrupts();
        tracing::info!("{} running from round {}", self.name(), self.time);

        let mut result = Ok(());
        while self.is_running() {
            if let Err(err) = self.turn().await {
                tracing::error!("{} failed in round {}: {}", self.name(), self.time, err);
                result = Err(err);
                break;
            }
        }

        self.node.shutdown(self.linger).await;
        tracing::info!("{} stopped at round {}", self.name(), self.time);
        result
    }
}
