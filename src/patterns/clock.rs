//! Harmonic heartbeat publisher
//!
//! A clock is a leaf area: it follows nobody and its pulse publishes an empty
//! payload on the slot of the round's largest harmonic. Listeners subscribe to
//! the single slot matching their layer.

use serde_json::json;

use super::{MAX_LAYERS, fundamental, layer_limit, slot_name};
use crate::runtime::{Area, Result, RuntimeConfig};

/// Clock state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    layers: u32,
}

impl Clock {
    /// Clock with the given layer limit
    pub fn new(layers: u32) -> Self {
        Self {
            layers: layers.clamp(1, MAX_LAYERS),
        }
    }

    /// Layer limit
    pub fn layers(&self) -> u32 {
        self.layers
    }

    /// Slot ticked in round `time`
    pub fn slot(&self, time: u64) -> String {
        slot_name(fundamental(time, self.layers))
    }

    /// Build a clock area
    ///
    /// Configured subscriptions are ignored; the layer limit comes from the
    /// `layers` context value.
    pub fn build(config: &RuntimeConfig) -> Result<Area<Clock>> {
        let mut config = config.clone();
        config.subscriptions.clear();

        let mut area = Area::new(&config, Clock::new(MAX_LAYERS))?;
        let layers = layer_limit(area.context());
        *area.state_mut() = Clock::new(layers);

        area.on_pulse(|area| {
            let slot = area.state().slot(area.time());
            tracing::trace!("{} tick {} on '{}'", area.name(), area.time(), slot);
            area.publish(&json!({}), Some(slot.as_str()))?;
            Ok(())
        });

        Ok(area)
    }
}
