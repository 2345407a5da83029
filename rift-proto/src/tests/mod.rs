use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use super::*;

mod util;
use util::*;

fn config(system_id: u64, name: &str, level: LevelConfig) -> NodeConfig {
    let mut config = NodeConfig::new(SystemId(system_id), name);
    config.level(level);
    config
}

/// A non-leaf hearing a leaf accepts it and moves to TwoWay
#[test]
fn leaf_acceptance_reaches_two_way() {
    let _guard = subscribe();
    let now = Instant::now();
    let mut node = Node::new(config(0x20, "y", LevelConfig::Value(Level(2)))).unwrap();
    node.start(now);
    let id = node
        .add_interface(InterfaceConfig::new("eth0", LinkId(1)), now)
        .unwrap();

    node.handle_lie(id, lie(0x10, 0, 9), addr(3));
    node.drive(now);

    assert_eq!(node.interface_state(id), Some(LieState::TwoWay));
    let neighbor = node.neighbor(id).unwrap();
    assert_eq!(neighbor.system_id, SystemId(0x10));
    assert_eq!(neighbor.level, Some(Level(0)));
    let events: Vec<LieEvent> = node
        .interface_history(id)
        .unwrap()
        .map(|r| r.event)
        .collect();
    assert!(events.contains(&LieEvent::NewNeighbor));
    assert_eq!(node.interface_stats(id).unwrap().lies_accepted, 1);
}

/// Both ends of a link complete the three-way handshake and start flooding
#[test]
fn three_way_handshake_both_sides() {
    let _guard = subscribe();
    let mut pair = Pair::new(
        config(0x0a, "spine", LevelConfig::Value(Level(1))),
        config(0x0b, "leaf", LevelConfig::Leaf),
    );
    pair.run_for(Duration::from_secs(5));

    assert_eq!(pair.states(), (LieState::ThreeWay, LieState::ThreeWay));
    // each side's outgoing LIEs reflect the other; each side saw it
    let a_n = pair.a.node.neighbor(pair.a.iface).unwrap();
    assert_eq!(a_n.system_id, SystemId(0x0b));
    assert_eq!(
        a_n.reflection,
        Some(NeighborRef {
            originator: SystemId(0x0a),
            link_id: LinkId(1),
        })
    );
    let a_events: Vec<NodeEvent> =
        std::iter::from_fn(|| pair.a.node.poll_event()).collect();
    assert!(a_events.contains(&NodeEvent::FloodingStarted {
        interface: pair.a.iface
    }));
    let b_events: Vec<NodeEvent> =
        std::iter::from_fn(|| pair.b.node.poll_event()).collect();
    assert!(b_events.contains(&NodeEvent::FloodingStarted {
        interface: pair.b.iface
    }));
}

/// An undefined-level node derives HAL - 1 from a top-of-fabric neighbor
/// and then forms the adjacency
#[test]
fn ztp_derives_level_and_adjacency_follows() {
    let _guard = subscribe();
    let mut pair = Pair::new(
        config(0x0a, "tof", LevelConfig::TopOfFabric),
        config(0x0b, "fabric", LevelConfig::Ztp),
    );
    assert_eq!(pair.b.node.level(), None);
    pair.run_for(Duration::from_secs(6));

    assert_eq!(pair.b.node.hal(), Some(TOP_OF_FABRIC_LEVEL));
    assert_eq!(pair.b.node.level(), Some(Level(23)));
    assert_eq!(pair.states(), (LieState::ThreeWay, LieState::ThreeWay));

    let b_events: Vec<NodeEvent> =
        std::iter::from_fn(|| pair.b.node.poll_event()).collect();
    assert!(b_events.contains(&NodeEvent::LevelChanged {
        level: Some(Level(23))
    }));
}

/// The level learned on an interface is poisoned when re-advertised there
#[test]
fn poison_reverse_on_the_learning_interface() {
    let _guard = subscribe();
    let now = Instant::now();
    let mut node = Node::new(config(0x0b, "fabric", LevelConfig::Ztp)).unwrap();
    node.start(now);
    let id = node
        .add_interface(InterfaceConfig::new("eth0", LinkId(1)), now)
        .unwrap();
    while node.poll_transmit().is_some() {}

    node.handle_lie(id, lie(0x0a, 24, 9), addr(3));
    node.drive(now);
    assert_eq!(node.level(), Some(Level(23)));

    node.drive(now + Duration::from_secs(1));
    let out = node.poll_transmit().expect("periodic LIE");
    assert_eq!(out.header.level, Some(Level(23)));
    assert!(out.not_a_ztp_offer);
}

/// Level-3 offers from two three-way neighbors: the lower system id wins
/// the tie and HAT becomes 3
#[test]
fn offer_tie_break_prefers_lower_system_id() {
    let _guard = subscribe();
    let now = Instant::now();
    let my_id = SystemId(0x99);
    let mut node = Node::new(config(0x99, "y", LevelConfig::Ztp)).unwrap();
    node.start(now);
    let if0 = node
        .add_interface(InterfaceConfig::new("eth0", LinkId(1)), now)
        .unwrap();
    let if1 = node
        .add_interface(InterfaceConfig::new("eth1", LinkId(2)), now)
        .unwrap();

    // first exposure sets HAL=3, deriving level 2, after which both
    // neighbors are acceptable
    node.handle_lie(if0, lie(500, 3, 11), addr(3));
    node.handle_lie(if1, lie(100, 3, 12), addr(4));
    node.drive(now);
    assert_eq!(node.level(), Some(Level(2)));

    // the handshake: plain LIE installs the neighbor, reflected LIE
    // confirms us, one more updates the offer with the ThreeWay state
    for (id, sys, link, my_link, host) in [(if0, 500, 11, 1, 3), (if1, 100, 12, 2, 4)] {
        node.handle_lie(id, lie(sys, 3, link), addr(host));
        node.drive(now);
        node.handle_lie(
            id,
            reflecting(lie(sys, 3, link), my_id, LinkId(my_link)),
            addr(host),
        );
        node.drive(now);
        assert_eq!(node.interface_state(id), Some(LieState::ThreeWay));
        node.handle_lie(
            id,
            reflecting(lie(sys, 3, link), my_id, LinkId(my_link)),
            addr(host),
        );
        node.drive(now);
    }

    assert_eq!(node.hat(), Some(Level(3)));
    let best: Vec<_> = node.offers().filter(|o| o.best_three_way).collect();
    assert_eq!(best.len(), 1);
    assert_eq!(best[0].system_id, SystemId(100));
    assert_eq!(best[0].interface, if1);
}

/// Losing the only level source with no southbound adjacency expires the
/// hold-down immediately and purges every offer
#[test]
fn hal_loss_without_southbound_recomputes_immediately() {
    let _guard = subscribe();
    let now = Instant::now();
    let my_id = SystemId(0x99);
    let mut node = Node::new(config(0x99, "y", LevelConfig::Ztp)).unwrap();
    node.start(now);
    let id = node
        .add_interface(InterfaceConfig::new("eth0", LinkId(1)), now)
        .unwrap();

    // bring the single upstream to ThreeWay
    node.handle_lie(id, lie(7, 3, 11), addr(3));
    node.drive(now);
    node.handle_lie(id, lie(7, 3, 11), addr(3));
    node.drive(now);
    node.handle_lie(id, reflecting(lie(7, 3, 11), my_id, LinkId(1)), addr(3));
    node.drive(now);
    assert_eq!(node.interface_state(id), Some(LieState::ThreeWay));
    assert_eq!(node.level(), Some(Level(2)));
    while node.poll_event().is_some() {}

    // silence: three missed ticks expire the hold timer
    node.drive(now + Duration::from_secs(3));

    assert_eq!(node.interface_state(id), Some(LieState::OneWay));
    assert_eq!(node.level(), None);
    assert_eq!(node.hal(), None);
    assert_eq!(node.ztp_state(), ZtpState::UpdatingClients);
    for offer in node.offers() {
        assert!(offer.removed);
        assert_eq!(
            offer.removed_reason,
            Some(OfferRemovalReason::HoldTimeExpired)
        );
        assert!(!offer.best);
    }
    let ztp_events: Vec<ZtpEvent> = node.ztp_history().map(|r| r.event).collect();
    assert!(ztp_events.contains(&ZtpEvent::LostHal));
    assert!(ztp_events.contains(&ZtpEvent::HoldDownExpired));

    let events: Vec<NodeEvent> = std::iter::from_fn(|| node.poll_event()).collect();
    assert!(events.contains(&NodeEvent::FloodingStopped { interface: id }));
    assert!(events.contains(&NodeEvent::LevelChanged { level: None }));
}

/// A chain started by one external event settles before the next external
/// event already in the queue is taken up
#[test]
fn chained_events_preempt_queued_external_events() {
    let _guard = subscribe();
    let now = Instant::now();
    let mut node = Node::new(config(0x20, "y", LevelConfig::Value(Level(2)))).unwrap();
    node.start(now);
    let id = node
        .add_interface(InterfaceConfig::new("eth0", LinkId(1)), now)
        .unwrap();

    // both externally queued before anything runs
    node.handle_lie(id, lie(0x10, 0, 9), addr(3));
    node.notify_corrupt_lie(id);
    node.drive(now);

    let events: Vec<LieEvent> = node
        .interface_history(id)
        .unwrap()
        .map(|r| r.event)
        .collect();
    // NewNeighbor and its SendLie are chained off LieReceived and must both
    // run before the corrupt-LIE notice that was queued earlier
    assert_eq!(
        events,
        vec![
            LieEvent::LieReceived,
            LieEvent::NewNeighbor,
            LieEvent::SendLie,
            LieEvent::LieCorrupt,
        ]
    );
    assert_eq!(node.interface_state(id), Some(LieState::OneWay));
}

/// A neighbor reflecting somebody else tears the adjacency down
#[test]
fn foreign_reflection_means_multiple_neighbors() {
    let _guard = subscribe();
    let now = Instant::now();
    let mut node = Node::new(config(0x20, "y", LevelConfig::Value(Level(2)))).unwrap();
    node.start(now);
    let id = node
        .add_interface(InterfaceConfig::new("eth0", LinkId(1)), now)
        .unwrap();

    node.handle_lie(id, lie(0x10, 0, 9), addr(3));
    node.drive(now);
    assert_eq!(node.interface_state(id), Some(LieState::TwoWay));

    // the neighbor heard some third node, not us
    node.handle_lie(
        id,
        reflecting(lie(0x10, 0, 9), SystemId(0xbad), LinkId(1)),
        addr(3),
    );
    node.drive(now);
    assert_eq!(node.interface_state(id), Some(LieState::OneWay));
    let events: Vec<LieEvent> = node
        .interface_history(id)
        .unwrap()
        .map(|r| r.event)
        .collect();
    assert!(events.contains(&LieEvent::MultipleNeighbors));
}

/// A dropped reflection falls back to TwoWay, not OneWay
#[test]
fn dropped_reflection_returns_to_two_way() {
    let _guard = subscribe();
    let now = Instant::now();
    let my_id = SystemId(0x20);
    let mut node = Node::new(config(0x20, "y", LevelConfig::Value(Level(2)))).unwrap();
    node.start(now);
    let id = node
        .add_interface(InterfaceConfig::new("eth0", LinkId(1)), now)
        .unwrap();

    node.handle_lie(id, lie(0x10, 0, 9), addr(3));
    node.drive(now);
    node.handle_lie(id, reflecting(lie(0x10, 0, 9), my_id, LinkId(1)), addr(3));
    node.drive(now);
    assert_eq!(node.interface_state(id), Some(LieState::ThreeWay));

    let events: Vec<NodeEvent> = std::iter::from_fn(|| node.poll_event()).collect();
    assert!(events.contains(&NodeEvent::FloodingStarted { interface: id }));

    // the neighbor restarted and no longer reflects us
    node.handle_lie(id, lie(0x10, 0, 9), addr(3));
    node.drive(now);
    assert_eq!(node.interface_state(id), Some(LieState::TwoWay));
    assert_matches!(
        node.poll_event(),
        Some(NodeEvent::FloodingStopped { .. })
    );
    // the neighbor is retained; only the reflection was lost
    assert!(node.neighbor(id).is_some());
}

/// Major neighbor changes drop to OneWay; minor ones only replace the record
#[test]
fn neighbor_change_classification() {
    let _guard = subscribe();
    let now = Instant::now();
    let mut node = Node::new(config(0x20, "y", LevelConfig::Value(Level(2)))).unwrap();
    node.start(now);
    let id = node
        .add_interface(InterfaceConfig::new("eth0", LinkId(1)), now)
        .unwrap();

    node.handle_lie(id, lie(0x10, 0, 9), addr(3));
    node.drive(now);
    assert_eq!(node.interface_state(id), Some(LieState::TwoWay));

    // flood port is a minor field: record replaced, state kept
    let mut minor = lie(0x10, 0, 9);
    minor.flood_port = 20002;
    node.handle_lie(id, minor, addr(3));
    node.drive(now);
    assert_eq!(node.interface_state(id), Some(LieState::TwoWay));
    assert_eq!(node.neighbor(id).unwrap().flood_port, 20002);

    // a level change is not
    node.handle_lie(id, lie(0x10, 1, 9), addr(3));
    node.drive(now);
    assert_eq!(node.interface_state(id), Some(LieState::OneWay));
    let events: Vec<LieEvent> = node
        .interface_history(id)
        .unwrap()
        .map(|r| r.event)
        .collect();
    assert!(events.contains(&LieEvent::NeighborChangedMinorFields));
    assert!(events.contains(&LieEvent::NeighborChangedLevel));
    assert!(node.neighbor(id).is_none());
}

/// A new system id on the same interface means multiple neighbors share
/// the link
#[test]
fn neighbor_identity_change_is_multiple_neighbors() {
    let _guard = subscribe();
    let now = Instant::now();
    let mut node = Node::new(config(0x20, "y", LevelConfig::Value(Level(2)))).unwrap();
    node.start(now);
    let id = node
        .add_interface(InterfaceConfig::new("eth0", LinkId(1)), now)
        .unwrap();

    node.handle_lie(id, lie(0x10, 0, 9), addr(3));
    node.drive(now);
    node.handle_lie(id, lie(0x11, 0, 9), addr(3));
    node.drive(now);

    assert_eq!(node.interface_state(id), Some(LieState::OneWay));
    let events: Vec<LieEvent> = node
        .interface_history(id)
        .unwrap()
        .map(|r| r.event)
        .collect();
    assert!(events.contains(&LieEvent::MultipleNeighbors));
}

/// Interface removal withdraws its offer and recomputes the level
#[test]
fn interface_removal_withdraws_offer() {
    let _guard = subscribe();
    let now = Instant::now();
    let mut node = Node::new(config(0x99, "y", LevelConfig::Ztp)).unwrap();
    node.start(now);
    let id = node
        .add_interface(InterfaceConfig::new("eth0", LinkId(1)), now)
        .unwrap();

    node.handle_lie(id, lie(7, 3, 11), addr(3));
    node.drive(now);
    assert_eq!(node.level(), Some(Level(2)));

    node.remove_interface(id, now);
    assert_eq!(node.level(), None);
    let offer = node.offers().next().unwrap();
    assert!(offer.removed);
}
