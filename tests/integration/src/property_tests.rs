//! Property tests for aggregation, arbitration and sequencing

use crate::test_utils::{night, Harness};
use chrono::{DateTime, Duration, Utc};
use nightwatch_coordinator::registry::DeviceInfo;
use nightwatch_coordinator::{
    Direction, GrantState, OpenCloseSequencer, PeerId, PeerRegistry, PriorityArbiter,
    PriorityEvent, Role, SequencerEvent, StepFailure,
};
use nightwatch_core::status::{
    BAD_WEATHER, BOP_EXPOSURE, BOP_TEL_MOVE, OC_CLOSED, OC_OPENED, STOP_EVERYTHING,
};
use nightwatch_core::{Config, DeviceType, StatusWord};
use proptest::prelude::*;

const DEVICES: [&str; 4] = ["camera", "focuser", "mount", "weather"];

/// Nothing to open, so status traffic never starts a sequence
fn quiet_config() -> Config {
    let mut config = Config::default_config();
    config.observatory.required_devices = DEVICES.iter().map(|d| d.to_string()).collect();
    config.observatory.open_sequence = Vec::new();
    config
        .blocking
        .insert("camera".to_string(), vec!["mount".to_string()]);
    config
}

fn register_bits() -> impl Strategy<Value = u32> {
    prop::sample::select(vec![
        0,
        BAD_WEATHER,
        STOP_EVERYTHING,
        BOP_EXPOSURE,
        BOP_TEL_MOVE,
        BAD_WEATHER | BOP_EXPOSURE,
        STOP_EVERYTHING | BOP_TEL_MOVE,
    ])
}

#[derive(Debug, Clone, Copy)]
enum ArbiterOp {
    Request(PeerId),
    Finished(PeerId),
    Release(PeerId),
    Disconnect(PeerId),
    Wait(i64),
}

fn arbiter_op() -> impl Strategy<Value = ArbiterOp> {
    prop_oneof![
        (1u32..5).prop_map(ArbiterOp::Request),
        (1u32..5).prop_map(ArbiterOp::Finished),
        (1u32..5).prop_map(ArbiterOp::Release),
        (1u32..5).prop_map(ArbiterOp::Disconnect),
        (1i64..120).prop_map(ArbiterOp::Wait),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_weather_safe_iff_no_device_reports_bad_weather(
        bits in prop::collection::vec(register_bits(), DEVICES.len())
    ) {
        let mut h = Harness::new(quiet_config(), night());
        let ids: Vec<PeerId> = DEVICES.iter().map(|d| h.device(d)).collect();
        for ((id, name), value) in ids.iter().zip(DEVICES).zip(&bits) {
            h.send(*id, &format!("S {} {}", name, value));
        }

        let expected: Vec<String> = DEVICES
            .iter()
            .zip(&bits)
            .filter(|(_, b)| *b & BAD_WEATHER != 0)
            .map(|(d, _)| d.to_string())
            .collect();
        let safety = &h.coordinator.status().safety;
        prop_assert_eq!(safety.weather_safe, expected.is_empty());
        prop_assert_eq!(safety.failing.iter().cloned().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn prop_safety_independent_of_report_order(
        bits in prop::collection::vec(register_bits(), DEVICES.len()),
        order in Just((0..DEVICES.len()).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let settle = |sequence: &[usize]| {
            let mut h = Harness::new(quiet_config(), night());
            let mut ids = vec![0; DEVICES.len()];
            for &i in sequence {
                ids[i] = h.device(DEVICES[i]);
            }
            for &i in sequence {
                h.send(ids[i], &format!("S {} {}", DEVICES[i], bits[i]));
            }
            h.coordinator.status().safety.clone()
        };

        let natural: Vec<usize> = (0..DEVICES.len()).collect();
        prop_assert_eq!(settle(&natural), settle(&order));
    }

    #[test]
    fn prop_arbiter_hands_over_one_epoch_at_a_time(
        ops in prop::collection::vec(arbiter_op(), 1..60)
    ) {
        let mut arbiter = PriorityArbiter::new(std::time::Duration::from_secs(180));
        let mut now = night();
        let mut forced = 0;

        for op in ops {
            let before = arbiter.epoch();
            let event = match op {
                ArbiterOp::Request(c) => arbiter.request(c, now).ok(),
                ArbiterOp::Finished(c) => arbiter.holder_finished(c, now).ok(),
                ArbiterOp::Release(c) => arbiter.release(c, now).ok(),
                ArbiterOp::Disconnect(c) => arbiter.disconnect(c, now),
                ArbiterOp::Wait(secs) => {
                    now += Duration::seconds(secs);
                    arbiter.expire(now)
                }
            };

            match event {
                Some(PriorityEvent::Granted { epoch, .. })
                | Some(PriorityEvent::HandedOver { epoch, .. }) => {
                    prop_assert_eq!(epoch, before + 1);
                }
                _ => prop_assert_eq!(arbiter.epoch(), before),
            }
            if matches!(
                event,
                Some(PriorityEvent::HandedOver { forced: true, .. })
                    | Some(PriorityEvent::Revoked { .. })
            ) {
                forced += 1;
            }

            match arbiter.state() {
                GrantState::Unheld => prop_assert_eq!(arbiter.holder(), None),
                GrantState::Held { holder, epoch } => {
                    prop_assert_eq!(epoch, arbiter.epoch());
                    prop_assert!(arbiter.is_holder(holder));
                }
                GrantState::Revoking { holder, next, deadline, .. } => {
                    prop_assert_ne!(holder, next);
                    prop_assert!(deadline > now);
                }
            }
        }
        prop_assert_eq!(arbiter.forced_cancellations().len(), forced);
    }

    #[test]
    fn prop_grace_period_is_exact(grace in 1u64..3600) {
        let t0 = night();
        let mut arbiter = PriorityArbiter::new(std::time::Duration::from_secs(grace));
        arbiter.request(1, t0).unwrap();
        arbiter.request(2, t0).unwrap();

        let just_before = t0 + Duration::seconds(grace as i64 - 1);
        prop_assert_eq!(arbiter.expire(just_before), None);
        prop_assert!(arbiter.is_holder(1));

        let deadline = t0 + Duration::seconds(grace as i64);
        let handed = matches!(
            arbiter.expire(deadline),
            Some(PriorityEvent::HandedOver { from: 1, to: 2, forced: true, .. })
        );
        prop_assert!(handed);
        prop_assert!(arbiter.is_holder(2));
    }
}

fn mounted(registry: &mut PeerRegistry, name: &str, bits: u32, now: DateTime<Utc>) -> PeerId {
    let id = registry.open("127.0.0.1:50000", now);
    registry
        .register(
            id,
            Role::Device,
            name,
            Some(DeviceInfo {
                num: 1,
                device_type: DeviceType::from_code(4),
                host: "localhost".to_string(),
                port: 5555,
            }),
        )
        .unwrap();
    registry.set_status(id, StatusWord(bits));
    id
}

#[test]
fn test_close_skips_a_stuck_device_and_retries_it_next_time() {
    let timeout = 60;
    let t0 = night();
    let mut registry = PeerRegistry::new();
    let dome = mounted(&mut registry, "dome", OC_OPENED, t0);
    let _cover = mounted(&mut registry, "cover", OC_OPENED, t0);
    let telescope = mounted(&mut registry, "telescope", OC_OPENED, t0);
    let mut sequencer = OpenCloseSequencer::new(
        vec!["dome".into(), "cover".into(), "telescope".into()],
        std::time::Duration::from_secs(timeout),
    );

    let events = sequencer.start(Direction::Close, None, &registry, t0);
    assert_eq!(
        events,
        vec![SequencerEvent::Issue {
            device: "telescope".into(),
            direction: Direction::Close
        }]
    );

    let mut now = t0 + Duration::seconds(5);
    registry.set_status(telescope, StatusWord(OC_CLOSED));
    let events = sequencer.on_status_change(&registry, now);
    assert_eq!(sequencer.awaiting(), Some("cover"));
    assert_eq!(events.len(), 1);

    // the cover never answers
    now += Duration::seconds(timeout as i64 - 1);
    assert!(sequencer.on_tick(&registry, now).is_empty());
    now += Duration::seconds(1);
    let events = sequencer.on_tick(&registry, now);
    assert_eq!(
        events,
        vec![
            SequencerEvent::StepFailed {
                device: "cover".into(),
                failure: StepFailure::Timeout
            },
            SequencerEvent::Issue {
                device: "dome".into(),
                direction: Direction::Close
            },
        ]
    );

    now += Duration::seconds(5);
    registry.set_status(dome, StatusWord(OC_CLOSED));
    let events = sequencer.on_status_change(&registry, now);
    assert_eq!(
        events,
        vec![SequencerEvent::Completed {
            direction: Direction::Close,
            failed_close: vec!["cover".into()]
        }]
    );
    assert!(sequencer.is_idle());
    assert!(now - t0 <= Duration::seconds(3 * timeout as i64));

    let events = sequencer.start(Direction::Close, None, &registry, now);
    assert!(sequencer.failed_close().is_empty());
    assert_eq!(
        events,
        vec![SequencerEvent::Issue {
            device: "cover".into(),
            direction: Direction::Close
        }]
    );
}

#[test]
fn test_open_aborts_when_device_disappears() {
    let t0 = night();
    let mut registry = PeerRegistry::new();
    let dome = mounted(&mut registry, "dome", OC_CLOSED, t0);
    mounted(&mut registry, "telescope", OC_CLOSED, t0);
    let mut sequencer = OpenCloseSequencer::new(
        vec!["dome".into(), "telescope".into()],
        std::time::Duration::from_secs(60),
    );

    sequencer.start(Direction::Open, None, &registry, t0);
    assert_eq!(sequencer.awaiting(), Some("dome"));

    registry.deregister(dome);
    let events = sequencer.on_status_change(&registry, t0 + Duration::seconds(3));
    assert_eq!(
        events,
        vec![SequencerEvent::Aborted {
            direction: Direction::Open,
            device: "dome".into(),
            failure: StepFailure::Disconnected
        }]
    );
    assert!(sequencer.is_idle());
}
