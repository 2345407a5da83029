use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::*;

/// Install a per-test tracing subscriber so failures print the dispatch log
pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

/// The transport layer's job, minus the wire: turn outgoing field values
/// into the packet the peer would decode
pub(super) fn encode(out: &LieOut) -> LiePacket {
    LiePacket {
        header: out.header.clone(),
        name: out.name.clone(),
        local_link_id: out.local_link_id,
        flood_port: out.flood_port,
        link_mtu: out.link_mtu,
        neighbor: out.neighbor,
        pod: out.pod,
        nonce: out.nonce,
        hold_time: out.hold_time,
        leaf_only: out.leaf_only,
        leaf_to_leaf: out.leaf_to_leaf,
        flood_reduction: out.flood_reduction,
        not_a_ztp_offer: out.not_a_ztp_offer,
        you_are_flood_repeater: out.you_are_flood_repeater,
    }
}

/// A crafted LIE with protocol-default fields
pub(super) fn lie(system_id: u64, level: impl Into<Option<u8>>, link_id: u32) -> LiePacket {
    LiePacket {
        header: Header {
            major_version: PROTOCOL_MAJOR_VERSION,
            minor_version: PROTOCOL_MINOR_VERSION,
            sender: SystemId(system_id),
            level: level.into().map(Level),
        },
        name: None,
        local_link_id: LinkId(link_id),
        flood_port: 10001,
        link_mtu: 1400,
        neighbor: None,
        pod: None,
        nonce: 7,
        hold_time: 3,
        leaf_only: false,
        leaf_to_leaf: false,
        flood_reduction: false,
        not_a_ztp_offer: false,
        you_are_flood_repeater: false,
    }
}

/// The same LIE, now reflecting the receiver back
pub(super) fn reflecting(mut packet: LiePacket, originator: SystemId, link_id: LinkId) -> LiePacket {
    packet.neighbor = Some(NeighborRef {
        originator,
        link_id,
    });
    packet
}

pub(super) fn addr(host: u8) -> SocketAddr {
    SocketAddr::from(([172, 16, 0, host], 914))
}

pub(super) struct TestNode {
    pub(super) node: Node,
    pub(super) iface: InterfaceId,
    pub(super) addr: SocketAddr,
}

/// Two nodes joined by one virtual point-to-point link, driven with
/// virtual time
pub(super) struct Pair {
    pub(super) a: TestNode,
    pub(super) b: TestNode,
    pub(super) time: Instant,
}

impl Pair {
    pub(super) fn new(a: NodeConfig, b: NodeConfig) -> Self {
        let time = Instant::now();
        let mut a = Node::new(a).unwrap();
        let mut b = Node::new(b).unwrap();
        a.start(time);
        b.start(time);
        let a_if = a
            .add_interface(InterfaceConfig::new("eth0", LinkId(1)), time)
            .unwrap();
        let b_if = b
            .add_interface(InterfaceConfig::new("eth0", LinkId(2)), time)
            .unwrap();
        Self {
            a: TestNode {
                node: a,
                iface: a_if,
                addr: addr(1),
            },
            b: TestNode {
                node: b,
                iface: b_if,
                addr: addr(2),
            },
            time,
        }
    }

    /// Deliver every pending LIE in both directions; true if any moved
    fn shuttle(&mut self) -> bool {
        let mut moved = false;
        while let Some(out) = self.a.node.poll_transmit() {
            moved = true;
            self.b
                .node
                .handle_lie(self.b.iface, encode(&out), self.a.addr);
        }
        while let Some(out) = self.b.node.poll_transmit() {
            moved = true;
            self.a
                .node
                .handle_lie(self.a.iface, encode(&out), self.b.addr);
        }
        moved
    }

    fn settle(&mut self) {
        loop {
            self.a.node.drive(self.time);
            self.b.node.drive(self.time);
            if !self.shuttle() {
                return;
            }
        }
    }

    /// Advance virtual time by `duration`, delivering packets and firing
    /// timers as their deadlines come up
    pub(super) fn run_for(&mut self, duration: Duration) {
        let deadline = self.time + duration;
        loop {
            self.settle();
            let next = match (self.a.node.next_timeout(), self.b.node.next_timeout()) {
                (Some(x), Some(y)) => Some(x.min(y)),
                (x, None) => x,
                (None, y) => y,
            };
            match next {
                Some(t) if t <= deadline => self.time = self.time.max(t),
                _ => break,
            }
        }
        self.time = deadline;
        self.settle();
    }

    pub(super) fn states(&self) -> (LieState, LieState) {
        (
            self.a.node.interface_state(self.a.iface).unwrap(),
            self.b.node.interface_state(self.b.iface).unwrap(),
        )
    }
}
