//! Deterministic protocol logic for RIFT neighbor discovery and ZTP
//!
//! rift-proto contains a fully deterministic implementation of the RIFT
//! adjacency (LIE) and zero-touch-provisioning (ZTP) state machines. It
//! contains no networking code and does not get any timestamps from the
//! operating system: every entry point that needs a clock takes `now` as an
//! argument, which makes the whole protocol core drivable with virtual time
//! in tests. Most users will want the synchronous runtime in the `rift`
//! crate instead.
//!
//! The most important type is [`Node`], which owns one ZTP state machine,
//! one adjacency state machine per attached interface, the event queues that
//! sequence delivery between them, and the timer queue that drives periodic
//! LIE transmission and hold-down. Inbound decoded LIEs go in through
//! [`Node::handle_lie`]; outgoing LIE field values come back out through
//! [`Node::poll_transmit`], and signals for external subsystems (flooding
//! start/stop, level changes) through [`Node::poll_event`].

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]
#![cfg_attr(test, allow(dead_code))]

use std::fmt;

mod config;
pub use crate::config::{ConfigError, InterfaceConfig, LevelConfig, NodeConfig};

pub mod fsm;

mod timer;
pub use crate::timer::{TimerQueue, TimerToken};

mod packet;
pub use crate::packet::{Header, LieOut, LiePacket, NeighborRef};

mod lie;
pub use crate::lie::{
    InterfaceStats, LieAction, LieEvent, LieEventData, LieFsm, LieState, Neighbor, RejectReason,
};

mod ztp;
pub use crate::ztp::{
    Offer, OfferRemovalReason, ZtpAction, ZtpEvent, ZtpEventData, ZtpFsm, ZtpState,
};

mod node;
pub use crate::node::{InterfaceId, Node, NodeEvent};

#[cfg(test)]
mod tests;

/// The protocol major version spoken by this implementation
///
/// A received LIE whose major version differs is rejected with
/// `UnacceptableHeader`; minor version differences are ignored.
pub const PROTOCOL_MAJOR_VERSION: u16 = 2;
/// The protocol minor version spoken by this implementation
pub const PROTOCOL_MINOR_VERSION: u16 = 1;

/// The fixed level advertised by leaf nodes
pub const LEAF_LEVEL: Level = Level(0);
/// The fixed level advertised by top-of-fabric nodes
pub const TOP_OF_FABRIC_LEVEL: Level = Level(24);

/// Identifies a node across the whole fabric
///
/// Carried in every LIE header. Zero is reserved as the invalid id; a LIE
/// claiming it is dropped without further processing.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SystemId(pub u64);

impl SystemId {
    /// Whether this id may appear on the wire as a sender
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A node's position in the fat-tree hierarchy
///
/// 0 is the leaf level, [`TOP_OF_FABRIC_LEVEL`] the highest. "Level
/// undefined" is expressed as `Option<Level>`, never as a sentinel value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Level(pub u8);

impl Level {
    /// The level a node derives from a Highest Available Level of `self`
    pub(crate) fn below(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    pub(crate) fn is_leaf(self) -> bool {
        self == LEAF_LEVEL
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one end of a point-to-point link, unique per node
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Point-of-delivery partition tag
///
/// Two neighbors that both advertise a PoD must advertise the same one for
/// the adjacency to form.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PodId(pub u32);

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
