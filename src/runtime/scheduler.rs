//! Round scheduling strategies
//!
//! At every round boundary the area hands the work it collected to a
//! [`Strategy`]. The default [`Sequential`] strategy runs every demanded
//! trigger with its parameters, then every armed alteration without any.

use std::collections::{BTreeMap, BTreeSet};

use super::area::{Area, HandlerId, Params};

/// Work collected for one round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Round {
    /// Trigger invocations, loop entries already merged in
    pub demand: BTreeMap<HandlerId, Params>,
    /// Alterations armed by messages or re-armed explicitly
    pub alterations: BTreeSet<HandlerId>,
    /// Demand keys that came from autoloop entries
    pub looped: BTreeSet<HandlerId>,
    /// Alteration keys that were re-armed with `alter`
    pub altered: BTreeSet<HandlerId>,
}

impl Round {
    /// Whether there is anything to run
    pub fn is_empty(&self) -> bool {
        self.demand.is_empty() && self.alterations.is_empty()
    }
}

/// Pluggable round dispatch
pub trait Strategy<S> {
    /// Run the round's callables against the area
    ///
    /// Errors are not recovered: they end the event loop.
    fn schedule(&self, area: &mut Area<S>, round: &Round) -> anyhow::Result<()>;
}

/// Demand first, then alterations, each in registration order
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl<S: 'static> Strategy<S> for Sequential {
    fn schedule(&self, area: &mut Area<S>, round: &Round) -> anyhow::Result<()> {
        for (handler, params) in &round.demand {
            area.invoke(*handler, params)?;
        }

        let empty = Params::new();
        for handler in &round.alterations {
            area.invoke(*handler, &empty)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{AddressBook, RuntimeConfig};
    use serde_json::{Value, json};

    fn area() -> Area<String> {
        Area::new(&RuntimeConfig::new("sched", AddressBook::new()), String::new()).unwrap()
    }

    fn append(tag: &'static str) -> impl Fn(&mut Area<String>, &Params) -> anyhow::Result<()> {
        move |area, params| {
            let suffix = params.get("n").map(Value::to_string).unwrap_or_default();
            area.state_mut().push_str(&format!("{}{};", tag, suffix));
            Ok(())
        }
    }

    #[test]
    fn test_sequential_runs_demand_then_alterations() {
        let mut area = area();
        let first = area.register("first", append("d"));
        let second = area.register("second", append("e"));
        let alteration = area.alteration(Some("A"), None, append("a"));

        let mut round = Round::default();
        round.alterations.insert(alteration);
        round.demand.insert(second, json!({"n": 2}).as_object().cloned().unwrap());
        round.demand.insert(first, Params::new());
        assert!(!round.is_empty());

        Sequential.schedule(&mut area, &round).unwrap();
        assert_eq!(area.state(), "d;e2;a;");
    }

    #[test]
    fn test_sequential_stops_at_first_failure() {
        let mut area = area();
        let boom = area.register("boom", |_, _| anyhow::bail!("boom"));
        let alteration = area.alteration(None, None, append("a"));

        let mut round = Round::default();
        round.demand.insert(boom, Params::new());
        round.alterations.insert(alteration);

        assert!(Sequential.schedule(&mut area, &round).is_err());
        assert!(area.state().is_empty());
        assert!(Round::default().is_empty());
    }
}
