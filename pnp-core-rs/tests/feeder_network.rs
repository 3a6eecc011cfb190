//! End-to-end tests: a coordinator and actuator nodes on an in-process bus
//!
//! Every test drives the system through operator text commands, the same
//! way the `pnp-brain` binary does, and checks node-side effects through the
//! simulated servo and the node status channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pnp_core::config::ManualFeedConfig;
use pnp_core::link::MemoryLink;
use pnp_core::{
    ActuatorNode, Coordinator, CoordinatorConfig, CoordinatorHandle, DispatchConfig, Error,
    FeederId, FeederSettings, Link, ManualTrigger, MemoryBus, NodeConfig, NodeHandle, NodeStatus,
    OperationalMode, Packet, Payload, Reply, SimServo, SimTapeSensor,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// Harness
// ============================================================================

struct Hand {
    handle: NodeHandle,
    status: watch::Receiver<NodeStatus>,
    servo: SimServo,
    sensor: SimTapeSensor,
    trigger: ManualTrigger,
    task: JoinHandle<()>,
}

impl Hand {
    fn mode(&self) -> OperationalMode {
        self.status.borrow().snapshot.mode
    }

    async fn wait_mode(&mut self, mode: OperationalMode) {
        tokio::time::timeout(
            Duration::from_secs(3),
            self.status.wait_for(|s| s.snapshot.mode == mode),
        )
        .await
        .expect("mode not reached")
        .expect("node stopped");
    }

    /// Simulate a clean 20 ms button press
    fn press_button(&mut self) -> bool {
        let t0 = Instant::now();
        self.trigger.press(t0);
        self.trigger.release(t0 + Duration::from_millis(20))
    }
}

struct HandSpec {
    feeder: Option<u8>,
    tag: u8,
    settle_ms: u64,
    manual_advance: bool,
    backoff_ms: u64,
}

impl HandSpec {
    fn feeder(feeder: u8, tag: u8) -> Self {
        Self {
            feeder: Some(feeder),
            tag,
            settle_ms: 10,
            manual_advance: false,
            backoff_ms: 2000,
        }
    }
}

fn start_coordinator(bus: &MemoryBus, config: CoordinatorConfig) -> CoordinatorHandle {
    let (link, inbound) = bus.attach();
    let (coordinator, handle) = Coordinator::new(config, Arc::new(link), inbound);
    tokio::spawn(coordinator.run());
    handle
}

fn start_hand(bus: &MemoryBus, spec: HandSpec) -> Hand {
    let (link, inbound) = bus.attach();
    let handle = NodeHandle::new([0x02, 0, 0, 0, 0, spec.tag]);

    let mut config = NodeConfig::new(handle)
        .with_settings(FeederSettings {
            settle_time_ms: spec.settle_ms,
            ..Default::default()
        })
        .with_manual_feed(ManualFeedConfig {
            advance: spec.manual_advance,
            ..Default::default()
        })
        .with_discovery_backoff_max(Duration::from_millis(spec.backoff_ms));
    config.feeder_id = spec.feeder;

    let servo = SimServo::new();
    let sensor = SimTapeSensor::new(true);
    let node = ActuatorNode::new(
        config,
        Arc::new(link),
        inbound,
        Box::new(servo.clone()),
        Arc::new(sensor.clone()),
    );
    let status = node.subscribe();
    let trigger = node.manual_trigger();
    let task = tokio::spawn(node.run());

    Hand {
        handle,
        status,
        servo,
        sensor,
        trigger,
        task,
    }
}

/// Poll `M620` until `feeder` is online at `node`
async fn wait_online(coordinator: &CoordinatorHandle, feeder: u8, node: NodeHandle) {
    let needle = format!("N{} {} ONLINE", feeder, node);
    for _ in 0..150 {
        if coordinator.execute("M620").await.contains(&needle) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never came online", needle);
}

async fn bench(spec: HandSpec) -> (MemoryBus, CoordinatorHandle, Hand) {
    let bus = MemoryBus::new();
    let coordinator = start_coordinator(&bus, CoordinatorConfig::default());
    let feeder = spec.feeder.unwrap_or_default();
    let hand = start_hand(&bus, spec);
    wait_online(&coordinator, feeder, hand.handle).await;
    (bus, coordinator, hand)
}

fn assert_error(reply: &Reply, check: impl Fn(&Error) -> bool) {
    match reply.error_kind() {
        Some(e) if check(e) => {}
        _ => panic!("unexpected reply:\n{}", reply),
    }
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn unregistered_feeder_is_not_registered() {
    let bus = MemoryBus::new();
    let coordinator = start_coordinator(
        &bus,
        CoordinatorConfig::default().with_start_enabled(true),
    );

    let reply = coordinator.execute("M600 N0 F4").await;
    assert_eq!(
        reply.to_string(),
        "error: not registered: N0"
    );
}

#[tokio::test]
async fn disabled_system_blocks_motion() {
    let (_bus, coordinator, mut hand) = bench(HandSpec {
        settle_ms: 80,
        ..HandSpec::feeder(0, 1)
    })
    .await;

    let reply = coordinator.execute("M600 N0 F4").await;
    assert_eq!(reply.error_kind(), Some(&Error::SystemDisabled));
    assert_eq!(hand.mode(), OperationalMode::Idle);
    assert!(hand.servo.history().is_empty());

    assert!(coordinator.execute("M610 S1").await.is_ok());
    let feed = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.execute("M600 N0 F4").await })
    };
    hand.wait_mode(OperationalMode::Feeding).await;

    let reply = feed.await.unwrap();
    assert!(reply.is_ok(), "{}", reply);
    assert_eq!(reply.lines, vec!["N0 fed 4 units".to_string()]);
    assert_eq!(hand.mode(), OperationalMode::Idle);
    assert_eq!(hand.servo.history(), vec![80, 0]);
}

#[tokio::test]
async fn invalid_length_fails_before_motion() {
    let (_bus, coordinator, hand) = bench(HandSpec::feeder(0, 1)).await;
    coordinator.execute("M610 S1").await;

    for line in ["M600 N0 F3", "M600 N0 F0", "M600 N0 F26"] {
        let reply = coordinator.execute(line).await;
        assert_error(&reply, |e| matches!(e, Error::InvalidParameter { .. }));
    }
    assert_eq!(hand.mode(), OperationalMode::Idle);
    assert!(hand.servo.history().is_empty());
}

#[tokio::test]
async fn angle_bounds_are_enforced() {
    let (_bus, coordinator, hand) = bench(HandSpec::feeder(0, 1)).await;
    coordinator.execute("M610 S1").await;

    let reply = coordinator.execute("M280 N0 A200").await;
    assert_error(&reply, |e| matches!(e, Error::InvalidParameter { .. }));
    assert!(hand.servo.history().is_empty());

    let reply = coordinator.execute("M280 N0 A180").await;
    assert!(reply.is_ok(), "{}", reply);
    assert_eq!(hand.servo.last_angle(), Some(180));
    assert_eq!(hand.status.borrow().snapshot.servo_angle, 180);
}

#[tokio::test]
async fn second_command_while_feeding_is_busy() {
    let (_bus, coordinator, mut hand) = bench(HandSpec {
        settle_ms: 150,
        ..HandSpec::feeder(0, 1)
    })
    .await;
    coordinator.execute("M610 S1").await;

    let feed = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.execute("M600 N0 F8").await })
    };
    hand.wait_mode(OperationalMode::Feeding).await;

    assert_error(&coordinator.execute("M600 N0 F4").await, |e| {
        matches!(e, Error::Busy { .. })
    });
    assert_error(&coordinator.execute("M601 N0").await, |e| {
        matches!(e, Error::Busy { .. })
    });

    // Queries still answer mid-feed
    let reply = coordinator.execute("M602 N0").await;
    assert!(reply.contains("mode: feeding"), "{}", reply);

    assert!(feed.await.unwrap().is_ok());
    assert_eq!(hand.servo.history(), vec![80, 0, 80, 0]);
}

#[tokio::test]
async fn retract_returns_servo() {
    let (_bus, coordinator, hand) = bench(HandSpec::feeder(2, 1)).await;
    coordinator.execute("M610 S1").await;

    assert!(coordinator.execute("M600 N2 F2").await.is_ok());
    assert_eq!(hand.servo.last_angle(), Some(40));

    let reply = coordinator.execute("M601 N2").await;
    assert!(reply.is_ok(), "{}", reply);
    assert_eq!(hand.servo.last_angle(), Some(0));
    assert_eq!(hand.mode(), OperationalMode::Idle);
}

#[tokio::test]
async fn settings_update_changes_strokes() {
    let (_bus, coordinator, hand) = bench(HandSpec::feeder(1, 1)).await;
    coordinator.execute("M610 S1").await;

    assert_error(&coordinator.execute("M603 N1 A250").await, |e| {
        matches!(e, Error::InvalidParameter { .. })
    });
    assert!(coordinator.execute("M603 N1 A95 C5 F2").await.is_ok());

    // No F: the node's configured length of 2 is used
    assert!(coordinator.execute("M600 N1").await.is_ok());
    assert_eq!(hand.servo.history(), vec![40]);
    assert!(coordinator.execute("M600 N1").await.is_ok());
    assert_eq!(hand.servo.history(), vec![40, 95, 5]);
}

// ============================================================================
// Feedback
// ============================================================================

#[tokio::test]
async fn missing_tape_faults_until_forced() {
    let (_bus, coordinator, hand) = bench(HandSpec::feeder(4, 1)).await;
    coordinator.execute("M610 S1").await;
    hand.sensor.set_present(false);

    let reply = coordinator.execute("M600 N4 F4").await;
    assert_eq!(reply.error_kind(), Some(&Error::FeedbackFault { error_count: 1 }));
    assert_eq!(hand.mode(), OperationalMode::Faulted);

    let reply = coordinator.execute("M600 N4 F4").await;
    assert_error(&reply, |e| matches!(e, Error::Busy { .. }));
    assert_eq!(hand.status.borrow().snapshot.error_count, 1);

    let reply = coordinator.execute("M600 N4 F4 X1").await;
    assert!(reply.is_ok(), "{}", reply);
    assert_eq!(hand.mode(), OperationalMode::Idle);

    let reply = coordinator.execute("M604 N4").await;
    assert!(reply.contains("feedback: on"), "{}", reply);
    assert!(reply.contains("errors: 1"), "{}", reply);

    let reply = coordinator.execute("M602 N4").await;
    // The refused feed while faulted counts as a failure too
    assert!(reply.contains("feeds: 1 ok, 2 failed"), "{}", reply);
}

#[tokio::test]
async fn disabling_feedback_clears_fault() {
    let (_bus, coordinator, hand) = bench(HandSpec::feeder(4, 1)).await;
    coordinator.execute("M610 S1").await;
    hand.sensor.set_present(false);

    assert!(!coordinator.execute("M600 N4").await.is_ok());
    assert_eq!(hand.mode(), OperationalMode::Faulted);

    assert_error(&coordinator.execute("M605 N4 S3").await, |e| {
        matches!(e, Error::InvalidParameter { .. })
    });
    assert!(coordinator.execute("M605 N4 S0").await.is_ok());
    assert_eq!(hand.mode(), OperationalMode::Idle);

    // Without feedback a feed succeeds with no tape
    assert!(coordinator.execute("M600 N4 F2").await.is_ok());
    assert_eq!(hand.status.borrow().snapshot.error_count, 1);
}

#[tokio::test]
async fn manual_feed_flag_read_then_clear() {
    let (_bus, coordinator, mut hand) = bench(HandSpec::feeder(6, 1)).await;

    assert!(hand.press_button());
    tokio::time::timeout(
        Duration::from_secs(2),
        hand.status.wait_for(|s| s.snapshot.manual_feed_pending),
    )
    .await
    .unwrap()
    .unwrap();

    // Acknowledging reports without clearing
    for _ in 0..2 {
        let reply = coordinator.execute("M607 N6").await;
        assert!(reply.contains("manual feed pending: yes"), "{}", reply);
    }

    assert!(coordinator.execute("M606 N6").await.is_ok());
    let reply = coordinator.execute("M607 N6").await;
    assert!(reply.contains("manual feed pending: no"), "{}", reply);

    // No motion happened
    assert!(hand.servo.history().is_empty());
}

#[tokio::test]
async fn manual_advance_feeds_locally() {
    let (_bus, _coordinator, mut hand) = bench(HandSpec {
        manual_advance: true,
        ..HandSpec::feeder(6, 1)
    })
    .await;

    assert!(hand.press_button());
    hand.wait_mode(OperationalMode::Feeding).await;
    hand.wait_mode(OperationalMode::Idle).await;

    assert_eq!(hand.servo.history(), vec![80, 0]);
    assert!(hand.status.borrow().snapshot.manual_feed_pending);
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn identity_collision_last_writer_wins() {
    let (bus, coordinator, first) = bench(HandSpec {
        backoff_ms: 0,
        ..HandSpec::feeder(3, 0xA1)
    })
    .await;
    coordinator.execute("M610 S1").await;
    // Let the first node's reply to the boot discovery land
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = start_hand(&bus, HandSpec::feeder(3, 0xB2));
    wait_online(&coordinator, 3, second.handle).await;

    let reply = coordinator.execute("status").await;
    assert!(reply.contains("Registered feeders: 1"), "{}", reply);
    assert!(reply.contains("N3 -> 02:00:00:00:00:B2"), "{}", reply);

    assert!(coordinator.execute("M280 N3 A45").await.is_ok());
    assert_eq!(second.servo.last_angle(), Some(45));
    assert!(first.servo.history().is_empty());
}

#[tokio::test]
async fn heartbeat_replies_are_spread_out() {
    let bus = MemoryBus::new();
    let (host, mut heard) = bus.attach();
    let hands: Vec<Hand> = (0..20u8)
        .map(|i| start_hand(&bus, HandSpec::feeder(20 + i, 0x40 + i)))
        .collect();

    let mut booted = 0;
    while booted < hands.len() {
        let packet = tokio::time::timeout(Duration::from_secs(2), heard.recv())
            .await
            .unwrap()
            .unwrap();
        if packet.payload == Payload::Register {
            booted += 1;
        }
    }

    host.send(&Packet::broadcast(Payload::Heartbeat)).unwrap();
    let sent = Instant::now();
    let mut arrivals = Vec::new();
    while arrivals.len() < hands.len() {
        let packet = tokio::time::timeout(Duration::from_secs(2), heard.recv())
            .await
            .unwrap()
            .unwrap();
        if packet.payload == Payload::Register {
            arrivals.push(sent.elapsed());
        }
    }

    let first = arrivals.iter().min().copied().unwrap();
    let last = arrivals.iter().max().copied().unwrap();
    assert!(last <= Duration::from_millis(700), "last reply after {:?}", last);
    assert!(
        last - first >= Duration::from_millis(50),
        "20 replies within {:?}",
        last - first
    );
}

#[tokio::test]
async fn silent_node_goes_stale() {
    let bus = MemoryBus::new();
    let coordinator = start_coordinator(
        &bus,
        CoordinatorConfig::default().with_liveness_timeout(Duration::from_millis(300)),
    );
    let hand = start_hand(&bus, HandSpec::feeder(5, 1));
    wait_online(&coordinator, 5, hand.handle).await;

    hand.task.abort();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let reply = coordinator.execute("M602 N5").await;
    assert_eq!(
        reply.error_kind(),
        Some(&Error::NotRegistered {
            feeder: 5,
            stale: true
        })
    );
    let reply = coordinator.execute("M620").await;
    assert!(reply.contains("N5 02:00:00:00:00:01 OFFLINE"), "{}", reply);
    assert!(reply.contains("Online: 0/1"), "{}", reply);
}

#[tokio::test]
async fn discovery_collects_every_node() {
    let bus = MemoryBus::new();
    let coordinator = start_coordinator(&bus, CoordinatorConfig::default());
    let hands: Vec<Hand> = (0..8u8)
        .map(|i| {
            start_hand(
                &bus,
                HandSpec {
                    backoff_ms: 300,
                    ..HandSpec::feeder(10 + i, 0x10 + i)
                },
            )
        })
        .collect();
    for (i, hand) in hands.iter().enumerate() {
        wait_online(&coordinator, 10 + i as u8, hand.handle).await;
    }

    // Outlast the backoff of replies to the boot discovery
    tokio::time::sleep(Duration::from_millis(400)).await;
    let reply = coordinator.execute("clear_registration").await;
    assert!(reply.contains("Cleared 8 registrations"), "{}", reply);
    assert!(coordinator.execute("M620").await.contains("Online: 0/0"));

    assert!(coordinator.execute("discovery").await.is_ok());
    for (i, hand) in hands.iter().enumerate() {
        wait_online(&coordinator, 10 + i as u8, hand.handle).await;
    }
    assert!(coordinator.execute("M620").await.contains("Online: 8/8"));
}

#[tokio::test]
async fn unassigned_node_gets_identity() {
    let bus = MemoryBus::new();
    let coordinator = start_coordinator(&bus, CoordinatorConfig::default());
    let mut hand = start_hand(
        &bus,
        HandSpec {
            feeder: None,
            ..HandSpec::feeder(0, 0x33)
        },
    );

    let mut listed = false;
    for _ in 0..100 {
        if coordinator.execute("unassigned").await.contains("02:00:00:00:00:33") {
            listed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(listed);

    let reply = coordinator.execute("assign 02:00:00:00:00:33 N9").await;
    assert!(reply.is_ok(), "{}", reply);

    tokio::time::timeout(
        Duration::from_secs(2),
        hand.status.wait_for(|s| s.feeder == FeederId::new(9).ok()),
    )
    .await
    .unwrap()
    .unwrap();
    wait_online(&coordinator, 9, hand.handle).await;
    assert!(coordinator.execute("unassigned").await.contains("Unassigned nodes: 0"));
}

#[tokio::test]
async fn slow_settle_time_extends_feed_timeout() {
    let bus = MemoryBus::new();
    let config = CoordinatorConfig::default()
        .with_start_enabled(true)
        .with_dispatch(DispatchConfig {
            command_timeout_ms: 200,
            feed_timeout_per_unit_ms: 10,
            ..Default::default()
        });
    let coordinator = start_coordinator(&bus, config);
    let hand = start_hand(&bus, HandSpec::feeder(0, 1));
    wait_online(&coordinator, 0, hand.handle).await;

    assert_error(&coordinator.execute("M603 N0 U1500").await, |e| {
        matches!(e, Error::InvalidParameter { .. })
    });
    assert!(coordinator.execute("M603 N0 U100").await.is_ok());

    // 12 strokes at 100 ms outlast the 440 ms length-only allowance
    let started = Instant::now();
    let reply = coordinator.execute("M600 N0 F24").await;
    assert!(reply.is_ok(), "{}", reply);
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert_eq!(hand.servo.history().len(), 12);
    assert!(coordinator.execute("M602 N0").await.contains("feeds: 1 ok, 0 failed"));
}

// ============================================================================
// Unreliable link
// ============================================================================

#[tokio::test]
async fn unanswered_dispatch_times_out_and_frees_slot() {
    let bus = MemoryBus::new();
    let config = CoordinatorConfig::default()
        .with_start_enabled(true)
        .with_dispatch(DispatchConfig {
            command_timeout_ms: 100,
            query_timeout_ms: 50,
            ..Default::default()
        });
    let coordinator = start_coordinator(&bus, config);

    // A registrant that never answers commands
    let (mute, _mute_rx): (MemoryLink, mpsc::Receiver<Packet>) = bus.attach();
    let node = NodeHandle::new([0x02, 0, 0, 0, 0, 0x77]);
    mute.send(&Packet::new(8, node, Payload::Register)).unwrap();
    wait_online(&coordinator, 8, node).await;

    for _ in 0..2 {
        let reply = coordinator.execute("M601 N8").await;
        assert_eq!(reply.error_kind(), Some(&Error::Timeout { after_ms: 100 }));
    }

    // Queries still succeed
    let reply = coordinator.execute("M602 N8").await;
    assert!(reply.contains("state unknown"), "{}", reply);
}

#[tokio::test]
async fn lost_link_falls_back_to_cached_snapshot() {
    let bus = MemoryBus::new();
    let config = CoordinatorConfig::default().with_dispatch(DispatchConfig {
        query_timeout_ms: 100,
        ..Default::default()
    });
    let coordinator = start_coordinator(&bus, config);
    let hand = start_hand(&bus, HandSpec::feeder(7, 1));
    wait_online(&coordinator, 7, hand.handle).await;

    let reply = coordinator.execute("M604 N7").await;
    assert!(reply.contains("tape: loaded"), "{}", reply);
    assert!(!reply.contains("(cached)"));

    bus.set_loss_rate(1.0);
    let reply = coordinator.execute("M604 N7").await;
    assert!(reply.is_ok());
    assert!(reply.contains("(cached)"), "{}", reply);
}
