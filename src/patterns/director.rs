//! Dynamic-membership barrier over harmonic layers
//!
//! Subordinate areas join a layer with the `"add"` trigger and report with a
//! broadcast on the `"status"` slot. A round only closes once every
//! subordinate in the layers ticking this round has reported, so fast layers
//! gate every round while slow layers only gate the rounds they tick in.
//! While the gate stays closed, a turn that hears nothing for its whole
//! timeout repeats the last pulse.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Value, json};

use super::{MAX_LAYERS, harmonics, layer_limit, parse_slot, slot_name};
use crate::runtime::{Area, DEFAULT_CAPACITY, Params, Result, RuntimeConfig};

/// Slot subordinates report readiness on
pub const STATUS_SLOT: &str = "status";

/// Trigger enlisting a subordinate: `{name, slot}`
pub const ADD_TRIGGER: &str = "add";

/// Trigger dismissing a subordinate: `{name}`
pub const REMOVE_TRIGGER: &str = "remove";

/// Barrier bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Director {
    layers: u32,
    members: BTreeMap<u64, BTreeSet<String>>,
    ready: BTreeSet<String>,
    factors: Vec<u64>,
    target: BTreeSet<String>,
    last_slot: Option<String>,
    busy: bool,
}

impl Director {
    /// Empty barrier for round 1
    pub fn new(layers: u32) -> Self {
        let layers = layers.clamp(1, MAX_LAYERS);
        Self {
            layers,
            members: BTreeMap::new(),
            ready: BTreeSet::new(),
            factors: harmonics(1, layers),
            target: BTreeSet::new(),
            last_slot: None,
            busy: false,
        }
    }

    /// Layer limit
    pub fn layers(&self) -> u32 {
        self.layers
    }

    /// Whether `name` is enlisted in any layer
    pub fn is_tracked(&self, name: &str) -> bool {
        self.members.values().any(|names| names.contains(name))
    }

    /// Subordinates of one layer
    pub fn layer(&self, factor: u64) -> Option<&BTreeSet<String>> {
        self.members.get(&factor)
    }

    /// Put `name` into the layer of `factor`, leaving any previous layer
    pub fn enlist(&mut self, name: &str, factor: u64) {
        self.leave_layers(name);
        self.members.entry(factor).or_default().insert(name.to_string());
    }

    /// Remove `name` from the barrier entirely
    pub fn dismiss(&mut self, name: &str) {
        self.leave_layers(name);
        self.ready.remove(name);
        self.target.remove(name);
    }

    fn leave_layers(&mut self, name: &str) {
        for names in self.members.values_mut() {
            names.remove(name);
        }
        self.members.retain(|_, names| !names.is_empty());
    }

    /// Record a status report
    pub fn mark_ready(&mut self, name: &str) {
        self.ready.insert(name.to_string());
    }

    /// Subordinates that reported and were not consumed by a round yet
    pub fn ready(&self) -> &BTreeSet<String> {
        &self.ready
    }

    /// Subordinates gating the current round
    pub fn target(&self) -> &BTreeSet<String> {
        &self.target
    }

    /// Harmonics of the current round
    pub fn factors(&self) -> &[u64] {
        &self.factors
    }

    /// Whether every gating subordinate has reported
    pub fn is_satisfied(&self) -> bool {
        self.target.is_subset(&self.ready)
    }

    /// Consume the reports of the closed round and compute the gate of round `time`
    pub fn retarget(&mut self, time: u64) {
        let satisfied = std::mem::take(&mut self.target);
        self.ready.retain(|name| !satisfied.contains(name));

        self.factors = harmonics(time, self.layers);
        self.target = self
            .factors
            .iter()
            .filter_map(|factor| self.members.get(factor))
            .flatten()
            .cloned()
            .collect();
    }

    /// Slot announcing the current round
    pub fn pulse_slot(&self) -> String {
        slot_name(self.factors.last().copied().unwrap_or(1))
    }

    /// Build a director area
    ///
    /// The layer limit comes from the `layers` context value.
    pub fn build(config: &RuntimeConfig) -> Result<Area<Director>> {
        let mut area = Area::new(config, Director::new(MAX_LAYERS))?;
        let layers = layer_limit(area.context());
        *area.state_mut() = Director::new(layers);

        area.register(ADD_TRIGGER, add);
        area.register(REMOVE_TRIGGER, remove);

        area.observe(|area, source, slot| {
            area.state_mut().busy = true;
            if slot == Some(STATUS_SLOT) && area.state().is_tracked(source) {
                area.state_mut().mark_ready(source);
            }
            if area.state().is_satisfied() {
                advance(area)?;
            }
            Ok(())
        });

        area.on_idle(|area| {
            if area.state().is_satisfied() {
                advance(area)?;
            } else if std::mem::take(&mut area.state_mut().busy) {
                // Only a turn that stayed silent for its whole timeout repeats the pulse.
            } else if let Some(slot) = area.state().last_slot.clone() {
                tracing::debug!(
                    "{} round {} waiting on {:?}",
                    area.name(),
                    area.time(),
                    area.state().target.difference(&area.state().ready).collect::<Vec<_>>()
                );
                area.publish(&json!({}), Some(slot.as_str()))?;
            }
            Ok(())
        });

        area.on_pulse(|area| {
            let slot = area.state().pulse_slot();
            area.publish(&json!({}), Some(slot.as_str()))?;
            let director = area.state_mut();
            director.last_slot = Some(slot);
            director.busy = true;
            Ok(())
        });

        Ok(area)
    }
}

/// Close the round and compute the next gate
pub fn advance(area: &mut Area<Director>) -> Result<()> {
    area.proceed()?;
    let time = area.time();
    area.state_mut().retarget(time);
    tracing::debug!(
        "{} entered round {} gated on {} subordinate(s)",
        area.name(),
        time,
        area.state().target().len()
    );
    Ok(())
}

fn add(area: &mut Area<Director>, params: &Params) -> anyhow::Result<()> {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        tracing::warn!("{} ignored an add without a name", area.name());
        return Ok(());
    };

    let slot = match params.get("slot") {
        Some(Value::String(slot)) => slot.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => {
            tracing::warn!("{} ignored an add for '{}' without a slot", area.name(), name);
            return Ok(());
        }
    };

    let Some(factor) = parse_slot(&slot, area.state().layers()) else {
        tracing::warn!("{} ignored '{}': slot '{}' is not a layer", area.name(), name, slot);
        return Ok(());
    };

    if !area.context().is_tracking(name) {
        area.subscribe(name, Some(&[STATUS_SLOT.to_string()]), DEFAULT_CAPACITY)?;
    }
    area.state_mut().enlist(name, factor);
    tracing::info!("{} enlisted '{}' in layer {}", area.name(), name, slot_name(factor));
    Ok(())
}

fn remove(area: &mut Area<Director>, params: &Params) -> anyhow::Result<()> {
    match params.get("name").and_then(Value::as_str) {
        Some(name) => {
            area.state_mut().dismiss(name);
            tracing::info!("{} dismissed '{}'", area.name(), name);
        }
        None => tracing::warn!("{} ignored a remove without a name", area.name()),
    }
    Ok(())
}
