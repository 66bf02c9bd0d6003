//! Integration tests for broadcasts and triggers over loopback sockets
//!
//! Areas are driven one `turn()` at a time from a single task so both ends of
//! a link share the test's runtime.

use agora::patterns::Clock;
use agora::runtime::error::RuntimeError;
use agora::runtime::{Address, AddressBook, Area, Interface, Params, RuntimeConfig, Subscription};
use serde_json::{Value, json};
use std::time::Duration;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn book(names: &[&str]) -> AddressBook {
    let mut book = AddressBook::new();
    for name in names {
        book.insert(name, Interface::Pub, Address::new("127.0.0.1", free_port()));
        book.insert(name, Interface::Rcv, Address::new("127.0.0.1", free_port()));
    }
    book
}

fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => panic!("params must be an object"),
    }
}

#[tokio::test]
async fn test_published_message_lands_in_subscriber_history() {
    let addresses = book(&["A", "B"]);
    let mut a = Area::new(&RuntimeConfig::new("A", addresses.clone()), ()).unwrap();
    let config = RuntimeConfig::new("B", addresses)
        .with_timeout(0.02)
        .with_subscription("A", Subscription::slots(["s"]));
    let mut b = Area::new(&config, ()).unwrap();
    b.setup().unwrap();

    let mut received = None;
    for _ in 0..200 {
        a.publish(&json!({"x": 1}), Some("s")).unwrap();
        a.publish(&json!({"x": 2}), Some("other")).unwrap();
        b.turn().await.unwrap();
        if let Some(entry) = b.context().latest("A", Some("s")) {
            received = Some((entry.clone(), b.time() - 1));
            break;
        }
    }

    let (entry, round) = received.expect("broadcast never arrived");
    assert_eq!(entry, json!({"x": 1, "slot-rcvd": "s", "time-rcvd": round}));

    let buffer = b.context().buffer("A", Some("s")).unwrap();
    assert!(buffer.iter().all(|entry| entry["x"] == json!(1)));
}

#[tokio::test]
async fn test_burst_of_broadcasts_runs_alteration_once() {
    let addresses = book(&["A", "B"]);
    let mut a = Area::new(&RuntimeConfig::new("A", addresses.clone()), ()).unwrap();
    let config = RuntimeConfig::new("B", addresses)
        .with_timeout(0.02)
        .with_subscription("A", Subscription::all());
    let mut b = Area::new(&config, 0usize).unwrap();
    b.alteration(Some("A"), None, |area, _| {
        *area.state_mut() += 1;
        Ok(())
    });
    b.setup().unwrap();

    // Wait for the link, then discard whatever the probe produced.
    for _ in 0..200 {
        a.publish(&json!({"probe": true}), None).unwrap();
        b.turn().await.unwrap();
        if *b.state() > 0 {
            break;
        }
    }
    assert!(*b.state() > 0, "subscriber never attached");
    b.turn().await.unwrap();
    *b.state_mut() = 0;

    for i in 0..10 {
        a.publish(&json!({"i": i}), None).unwrap();
    }
    let before = b.context().buffer("A", None).unwrap().len();
    for _ in 0..50 {
        b.turn().await.unwrap();
        if b.context().buffer("A", None).unwrap().len() >= before + 10 {
            break;
        }
    }

    assert!(b.context().buffer("A", None).unwrap().len() >= before + 10);
    assert!(*b.state() >= 1);
    assert!(*b.state() < 10, "burst was not coalesced");
}

#[tokio::test]
async fn test_trigger_queues_demand_on_target() {
    let addresses = book(&["A", "B"]);
    let a = Area::new(&RuntimeConfig::new("A", addresses.clone()), ()).unwrap();
    let mut b = Area::new(
        &RuntimeConfig::new("B", addresses).with_timeout(0.02),
        Vec::<Value>::new(),
    )
    .unwrap();
    b.register("store", |area, params| {
        area.state_mut().push(Value::Object(params.clone()));
        Ok(())
    });
    b.setup().unwrap();

    a.trigger("B", "store", params(json!({"k": "v"}))).unwrap();
    for _ in 0..200 {
        b.turn().await.unwrap();
        if !b.state().is_empty() {
            break;
        }
    }

    assert_eq!(b.state(), &vec![json!({"k": "v"})]);
}

#[tokio::test]
async fn test_trigger_to_unknown_area_fails_but_unreachable_is_silent() {
    let addresses = book(&["A", "B"]);
    let a = Area::new(&RuntimeConfig::new("A", addresses), ()).unwrap();

    assert!(matches!(
        a.trigger("nobody", "job", Params::new()),
        Err(RuntimeError::UnknownAddress(_))
    ));
    // B never binds its receiver.
    assert!(a.trigger("B", "job", Params::new()).is_ok());
}

#[tokio::test]
async fn test_exit_trigger_ends_run() {
    let addresses = book(&["A", "B"]);
    let a = Area::new(&RuntimeConfig::new("A", addresses.clone()), ()).unwrap();
    let mut b = Area::new(&RuntimeConfig::new("B", addresses).with_timeout(0.02), ()).unwrap();
    b.setup().unwrap();

    a.trigger("B", "exit", Params::new()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), b.run())
        .await
        .expect("area did not exit")
        .unwrap();
    assert!(!b.is_running());
}

#[tokio::test]
async fn test_failing_handler_ends_run_with_error() {
    let addresses = book(&["A", "B"]);
    let a = Area::new(&RuntimeConfig::new("A", addresses.clone()), ()).unwrap();
    let mut b = Area::new(&RuntimeConfig::new("B", addresses).with_timeout(0.02), ()).unwrap();
    b.register("boom", |_, _| anyhow::bail!("boom"));
    b.setup().unwrap();

    a.trigger("B", "boom", Params::new()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), b.run())
        .await
        .expect("area did not fail");
    assert!(matches!(result, Err(RuntimeError::Handler(_))));
}

#[tokio::test]
async fn test_listener_hears_only_its_clock_layer() {
    let addresses = book(&["clock", "listener"]);
    let mut clock = Clock::build(&RuntimeConfig::new("clock", addresses.clone()).with_timeout(0.01)).unwrap();
    clock.setup().unwrap();

    let config = RuntimeConfig::new("listener", addresses)
        .with_timeout(0.01)
        .with_subscription("clock", Subscription::slots(["02"]));
    let mut listener = Area::new(&config, 0usize).unwrap();
    listener.alteration(Some("clock"), Some("02"), |area, _| {
        *area.state_mut() += 1;
        Ok(())
    });
    listener.setup().unwrap();

    for _ in 0..400 {
        clock.turn().await.unwrap();
        listener.turn().await.unwrap();
        if *listener.state() >= 3 {
            break;
        }
    }

    assert!(*listener.state() >= 3);
    let ticks = listener.context().buffer("clock", Some("02")).unwrap();
    assert!(ticks.iter().all(|tick| tick["slot-rcvd"] == json!("02")));
}
