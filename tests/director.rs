//! Integration tests for the director barrier
//!
//! Subordinate status reports are injected with `deliver`, which is the same
//! path the event loop takes for a received broadcast.

use agora::patterns::{Director, MAX_LAYERS, fundamental, slot_name};
use agora::runtime::{Address, AddressBook, Area, Interface, Params, RuntimeConfig, Subscription};
use serde_json::{Value, json};
use std::cell::Cell;

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

fn names(area: &Area<Director>) -> Vec<String> {
    area.state().target().iter().cloned().collect()
}

fn report(director: &mut Area<Director>, name: &str) {
    director.deliver(name, json!({}), Some("status")).unwrap();
}

/// Pulse slots a follower recorded from the director, newest first
fn pulses<S: 'static>(follower: &Area<S>) -> Vec<String> {
    follower
        .context()
        .buffer("director", None)
        .map(|ring| {
            ring.iter()
                .map(|entry| entry["slot-rcvd"].as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn follow_director() -> Subscription {
    Subscription {
        buffer_length: 1000,
        ..Subscription::all()
    }
}

#[tokio::test]
async fn test_barrier_gates_on_ticking_layers() {
    let addresses = book(&["director", "a", "b", "c"]);
    let mut director = Director::build(&RuntimeConfig::new("director", addresses)).unwrap();

    // Empty gate: the first quiescence closes round 1 and runs the add.
    director.comply("add", params(json!({"name": "a", "slot": "01"})));
    director.quiesce().unwrap();
    assert_eq!(director.time(), 2);
    assert_eq!(names(&director), vec!["a"]);

    // Gate not satisfied: quiescence holds the round.
    director.comply("add", params(json!({"name": "b", "slot": "02"})));
    director.quiesce().unwrap();
    assert_eq!(director.time(), 2);

    report(&mut director, "a");
    assert_eq!(director.time(), 3);
    assert_eq!(director.state().factors(), &[1]);
    assert_eq!(names(&director), vec!["a"]);

    director.comply("add", params(json!({"name": "c", "slot": 4})));
    report(&mut director, "a");
    assert_eq!(director.time(), 4);
    assert_eq!(director.state().factors(), &[1, 2, 4]);
    assert_eq!(names(&director), vec!["a", "b", "c"]);

    report(&mut director, "b");
    report(&mut director, "c");
    director.quiesce().unwrap();
    assert_eq!(director.time(), 4);

    report(&mut director, "a");
    assert_eq!(director.time(), 5);
    assert!(director.state().ready().is_empty());
    assert_eq!(names(&director), vec!["a"]);
}

#[tokio::test]
async fn test_reports_from_strangers_do_not_count() {
    let addresses = book(&["director", "a"]);
    let mut director = Director::build(&RuntimeConfig::new("director", addresses)).unwrap();

    director.comply("add", params(json!({"name": "a", "slot": "01"})));
    director.quiesce().unwrap();
    assert_eq!(director.time(), 2);

    report(&mut director, "intruder");
    director.deliver("a", json!({}), Some("other")).unwrap();
    assert_eq!(director.time(), 2);
    assert!(director.state().ready().is_empty());
}

#[tokio::test]
async fn test_invalid_add_is_ignored() {
    let addresses = book(&["director"]);
    let mut director = Director::build(&RuntimeConfig::new("director", addresses)).unwrap();

    director.comply("add", params(json!({"name": "a", "slot": "03"})));
    director.quiesce().unwrap();
    assert!(!director.state().is_tracked("a"));

    director.comply("add", params(json!({"slot": "01"})));
    director.quiesce().unwrap();
    assert_eq!(director.time(), 3);
}

#[tokio::test]
async fn test_remove_releases_the_gate() {
    let addresses = book(&["director", "a"]);
    let mut director = Director::build(&RuntimeConfig::new("director", addresses)).unwrap();

    director.comply("add", params(json!({"name": "a", "slot": "01"})));
    director.quiesce().unwrap();
    assert_eq!(director.time(), 2);

    // Commands wait for the gate like everything else; a report opens it.
    director.comply("remove", params(json!({"name": "a"})));
    report(&mut director, "a");
    assert_eq!(director.time(), 3);
    assert!(director.state().target().is_empty());

    director.quiesce().unwrap();
    assert_eq!(director.time(), 4);
}

#[tokio::test]
async fn test_subordinate_drives_rounds_over_sockets() {
    let addresses = book(&["director", "worker"]);

    let mut director =
        Director::build(&RuntimeConfig::new("director", addresses.clone()).with_timeout(0.01)).unwrap();
    director.setup().unwrap();

    let config = RuntimeConfig::new("worker", addresses)
        .with_timeout(0.01)
        .with_subscription("director", Subscription::all());
    let mut worker = Area::new(&config, ()).unwrap();
    worker.alteration(Some("director"), None, |area, _| {
        area.publish(&json!({"ok": true}), Some("status"))?;
        Ok(())
    });
    worker.setup().unwrap();
    worker
        .trigger("director", "add", params(json!({"name": "worker", "slot": "01"})))
        .unwrap();

    for _ in 0..500 {
        director.turn().await.unwrap();
        worker.turn().await.unwrap();
        if director.time() >= 8 {
            break;
        }
    }

    assert!(director.state().is_tracked("worker"));
    assert!(director.time() >= 8, "director stuck at round {}", director.time());
    assert!(director.context().latest("worker", Some("status")).is_some());
}

#[tokio::test]
async fn test_quiescence_after_an_advance_does_not_repeat_the_pulse() {
    let addresses = book(&["director", "worker", "spy"]);
    let mut director = Director::build(&RuntimeConfig::new("director", addresses.clone())).unwrap();

    let config = RuntimeConfig::new("spy", addresses)
        .with_timeout(0.02)
        .with_subscription("director", follow_director());
    let mut spy = Area::new(&config, ()).unwrap();
    spy.setup().unwrap();

    director.comply("add", params(json!({"name": "worker", "slot": "01"})));
    director.quiesce().unwrap();
    assert_eq!(director.time(), 2);

    // The held round keeps repeating its pulse until the spy is attached.
    for _ in 0..200 {
        director.quiesce().unwrap();
        spy.turn().await.unwrap();
        if !pulses(&spy).is_empty() {
            break;
        }
    }
    assert!(!pulses(&spy).is_empty(), "spy never attached");
    assert_eq!(director.time(), 2);
    for _ in 0..5 {
        spy.turn().await.unwrap();
    }
    let before = pulses(&spy).len();

    // Each report closes a round inside a turn that then goes quiet.
    report(&mut director, "worker");
    director.quiesce().unwrap();
    assert_eq!(director.time(), 3);
    report(&mut director, "worker");
    director.quiesce().unwrap();
    assert_eq!(director.time(), 4);

    for _ in 0..10 {
        spy.turn().await.unwrap();
    }
    let heard = pulses(&spy);
    assert_eq!(heard.len(), before + 2, "pulses: {:?}", heard);
    assert_eq!(&heard[..2], &["01".to_string(), "02".to_string()]);
}

#[tokio::test]
async fn test_director_pulses_once_per_round_under_live_turns() {
    let addresses = book(&["director", "worker"]);
    let mut director =
        Director::build(&RuntimeConfig::new("director", addresses.clone()).with_timeout(0.2)).unwrap();
    director.setup().unwrap();
    director.comply("add", params(json!({"name": "worker", "slot": "01"})));

    let config = RuntimeConfig::new("worker", addresses)
        .with_timeout(0.01)
        .with_subscription("director", follow_director());
    let mut worker = Area::new(&config, 0u64).unwrap();
    worker.alteration(Some("director"), None, |area, _| {
        *area.state_mut() += 1;
        area.publish(&json!({"ok": true}), Some("status"))?;
        Ok(())
    });
    worker.setup().unwrap();

    let done = Cell::new(false);
    let drive_director = async {
        for _ in 0..200 {
            director.turn().await.unwrap();
            if director.time() >= 10 {
                break;
            }
        }
        done.set(true);
    };
    let drive_worker = async {
        while !done.get() {
            worker.turn().await.unwrap();
        }
        for _ in 0..10 {
            worker.turn().await.unwrap();
        }
    };
    tokio::join!(drive_director, drive_worker);

    let time = director.time();
    assert!(time >= 10, "director stuck at round {}", time);

    // Newest first: one pulse per closed round, each on that round's layer.
    let heard = pulses(&worker);
    let expected: Vec<String> = (time - 6..time)
        .rev()
        .map(|round| slot_name(fundamental(round, MAX_LAYERS)))
        .collect();
    assert_eq!(&heard[..6], &expected[..], "pulses: {:?}", heard);

    // Rounds 2.. were each gated on one report from the worker.
    assert!(*worker.state() >= time - 2);
    assert!(director.state().ready().is_empty());
}
