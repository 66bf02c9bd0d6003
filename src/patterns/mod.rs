//! Composite patterns built on the [`Area`](crate::runtime::Area) contract
//!
//! Both patterns think in *harmonics*: the power-of-two divisors of the round
//! counter. Round 12 has harmonics 1, 2 and 4, so it ticks the `"04"` layer;
//! participants that only care about slower layers can ignore it.

use serde_json::Value;

use crate::runtime::Context;

pub mod clock;
pub mod director;

pub use clock::Clock;
pub use director::Director;

/// Most harmonic layers a deployment can use
pub const MAX_LAYERS: u32 = 32;

/// Context value overriding the layer limit
pub const LAYERS_KEY: &str = "layers";

/// Power-of-two divisors of `time`, smallest first, bounded by `layers`
pub fn harmonics(time: u64, layers: u32) -> Vec<u64> {
    (0..layers.clamp(1, MAX_LAYERS))
        .map(|exponent| 1u64 << exponent)
        .take_while(|factor| time % factor == 0)
        .collect()
}

/// Largest harmonic of `time`
pub fn fundamental(time: u64, layers: u32) -> u64 {
    harmonics(time, layers).last().copied().unwrap_or(1)
}

/// Slot name of a harmonic: zero-padded to two digits
pub fn slot_name(factor: u64) -> String {
    format!("{:02}", factor)
}

/// Parse a slot name back into a harmonic within the layer limit
pub fn parse_slot(slot: &str, layers: u32) -> Option<u64> {
    let factor: u64 = slot.trim().parse().ok()?;
    (factor.is_power_of_two() && factor.trailing_zeros() < layers.clamp(1, MAX_LAYERS)).then_some(factor)
}

/// Layer limit from the `layers` context value, defaulting to [`MAX_LAYERS`]
pub fn layer_limit(context: &Context) -> u32 {
    context
        .value(LAYERS_KEY)
        .and_then(Value::as_u64)
        .map(|layers| layers.clamp(1, MAX_LAYERS as u64) as u32)
        .unwrap_or(MAX_LAYERS)
}
