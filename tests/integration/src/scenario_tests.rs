//! End-to-end weather and priority scenarios

use crate::test_utils::{failing, night, observatory_config, Harness};
use chrono::Duration;
use nightwatch_coordinator::{GrantState, PriorityArbiter, PriorityEvent};

#[test]
fn test_weather_failing_set_follows_devices() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut h = Harness::new(observatory_config(), night());
    let dome = h.device("dome");
    let weather = h.device("weather");
    assert!(h.coordinator.status().weather_safe());
    assert!(failing(&h).is_empty());

    h.send(dome, "S dome 2147483648 \"rain\"");
    assert!(!h.coordinator.status().weather_safe());
    assert_eq!(failing(&h), vec!["dome"]);

    h.disconnect(weather);
    assert_eq!(failing(&h), vec!["dome", "weather"]);

    h.disconnect(dome);
    let dome = h.device("dome");
    h.send(dome, "S dome 0");
    assert_eq!(failing(&h), vec!["weather"]);
    assert!(!h.coordinator.status().weather_safe());
}

#[test]
fn test_weather_recovery_clears_reason() {
    let mut h = Harness::new(observatory_config(), night());
    let dome = h.device("dome");
    let weather = h.device("weather");
    let alice = h.client("alice");

    h.send(weather, "S weather 2147483648 \"wind\"");
    assert_eq!(
        h.coordinator.status().weather_reason.as_ref().map(|r| r.device.as_str()),
        Some("weather")
    );
    h.take(alice);

    h.send(weather, "S weather 0");
    assert!(h.coordinator.status().weather_safe());
    assert!(h.coordinator.status().weather_reason.is_none());
    assert!(h.take(alice).contains(&"V weather_safe 1".to_string()));

    // another device going bad names itself
    h.send(dome, "S dome 2147483648 \"hatch\"");
    assert_eq!(
        h.coordinator.status().weather_reason.as_ref().map(|r| r.device.as_str()),
        Some("dome")
    );
}

#[test]
fn test_priority_handover_when_holder_finishes() {
    let t0 = night();
    let mut arbiter = PriorityArbiter::new(std::time::Duration::from_secs(180));
    let (a, b) = (1, 2);

    assert_eq!(
        arbiter.request(a, t0).unwrap(),
        PriorityEvent::Granted { holder: a, epoch: 1 }
    );
    match arbiter.request(b, t0).unwrap() {
        PriorityEvent::RevokeRequested { holder, next, deadline } => {
            assert_eq!((holder, next), (a, b));
            assert_eq!(deadline, t0 + Duration::seconds(180));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let done = t0 + Duration::seconds(10);
    assert_eq!(arbiter.expire(done), None);
    assert_eq!(
        arbiter.holder_finished(a, done).unwrap(),
        PriorityEvent::HandedOver {
            from: a,
            to: b,
            epoch: 2,
            forced: false
        }
    );
    assert_eq!(arbiter.state(), GrantState::Held { holder: b, epoch: 2 });
    assert!(arbiter.forced_cancellations().is_empty());
}

#[test]
fn test_priority_handover_forced_after_grace() {
    let t0 = night();
    let mut arbiter = PriorityArbiter::new(std::time::Duration::from_secs(180));
    let (a, b) = (1, 2);

    arbiter.request(a, t0).unwrap();
    arbiter.request(b, t0).unwrap();

    assert_eq!(arbiter.expire(t0 + Duration::seconds(179)), None);
    assert!(arbiter.is_holder(a));

    let at = t0 + Duration::seconds(180);
    assert_eq!(
        arbiter.expire(at),
        Some(PriorityEvent::HandedOver {
            from: a,
            to: b,
            epoch: 2,
            forced: true
        })
    );
    assert_eq!(arbiter.state(), GrantState::Held { holder: b, epoch: 2 });
    let forced = arbiter.forced_cancellations();
    assert_eq!(forced.len(), 1);
    assert_eq!(forced[0].holder, a);
    assert_eq!(forced[0].epoch, 1);
    assert_eq!(forced[0].at, at);
}

#[test]
fn test_clients_hand_over_priority_cooperatively() {
    let mut h = Harness::new(observatory_config(), night());
    h.device("dome");
    h.device("weather");
    let alice = h.client("alice");
    let bob = h.client("bob");

    h.send(alice, "priority");
    assert!(h.take(alice).contains(&"A priority_granted 1".to_string()));
    h.send(bob, "priority");
    assert!(h.take(alice).iter().any(|l| l.starts_with("A priority_revoke")));

    h.advance(10);
    h.send(alice, "priority_done");
    assert!(h.take(bob).contains(&"A priority_granted 2".to_string()));
    assert!(h.coordinator.priority().is_holder(bob));
    assert!(h.coordinator.priority().forced_cancellations().is_empty());

    // nobody else may jump the queue while bob holds it
    h.send(alice, "priority_release");
    assert!(h.take(alice).iter().any(|l| l.starts_with("-006")));
}

#[test]
fn test_holder_disconnect_forces_handover() {
    let mut h = Harness::new(observatory_config(), night());
    h.device("dome");
    h.device("weather");
    let alice = h.client("alice");
    let bob = h.client("bob");

    h.send(alice, "priority");
    h.send(bob, "priority");
    h.take(bob);

    h.disconnect(alice);
    assert!(h.coordinator.priority().is_holder(bob));
    assert_eq!(h.coordinator.priority().forced_cancellations().len(), 1);
    assert!(h.take(bob).contains(&"A priority_granted 2".to_string()));
}
