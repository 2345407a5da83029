//! Per-interface neighbor discovery and the three-way handshake
//!
//! One instance per point-to-point interface. The machine starts in OneWay,
//! moves to TwoWay when an acceptable LIE from a new neighbor arrives, and
//! to ThreeWay once the neighbor's LIE reflects this node back (proving
//! bidirectional visibility). Any significant change in what the neighbor
//! advertises drops the adjacency back to OneWay and lets it re-form.
//!
//! Every acceptance decision, positive or negative, is also surfaced to the
//! node's ZTP machine as an [`Offer`], except for LIEs claiming an invalid
//! sender id or this node's own id, which are dropped silently.

use std::fmt;
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::config::InterfaceConfig;
use crate::fsm::{Cause, EventSink, Handler, Machine, Table};
use crate::node::{InterfaceId, LieCtx, NodeEvent};
use crate::packet::{Header, LieOut, LiePacket, NeighborRef};
use crate::ztp::{Offer, OfferRemovalReason};
use crate::{Level, LinkId, PodId, SystemId, PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION};

/// Adjacency states
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum LieState {
    /// No neighbor; periodically advertising ourselves
    OneWay,
    /// We hear a neighbor; waiting for it to hear us
    TwoWay,
    /// The neighbor reflects us back; the adjacency is usable
    ThreeWay,
}

/// Adjacency events
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
#[allow(missing_docs)]
pub enum LieEvent {
    TimerTick,
    LevelChanged,
    LieReceived,
    NewNeighbor,
    ValidReflection,
    NeighborDroppedReflection,
    NeighborChangedLevel,
    NeighborChangedAddress,
    NeighborChangedMinorFields,
    UnacceptableHeader,
    HoldTimeExpired,
    MultipleNeighbors,
    LieCorrupt,
    SendLie,
}

/// Adjacency action identifiers, resolved by the interface
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum LieAction {
    ProcessLie,
    SendLie,
    UpdateLevel,
    CheckHoldTime,
    Cleanup,
    StartFlooding,
    StopFlooding,
}

/// Payload delivered with some adjacency events
#[derive(Debug, Clone)]
pub enum LieEventData {
    /// A decoded LIE and the address it came from (`LieReceived`)
    Packet {
        /// The decoded packet
        lie: LiePacket,
        /// Source address, used to detect neighbor address changes
        source: SocketAddr,
    },
    /// The node's newly derived level (`LevelChanged`)
    Level(Option<Level>),
}

/// Marker for the adjacency machine kind
pub struct LieFsm;

impl Machine for LieFsm {
    type State = LieState;
    type Event = LieEvent;
    type Action = LieAction;
    type Data = LieEventData;

    const NAME: &'static str = "lie";
}

pub(crate) fn table() -> Table<LieFsm> {
    use LieAction as A;
    use LieEvent as E;
    use LieState as S;
    Table::new(S::OneWay)
        .rule(S::OneWay, E::TimerTick, None, &[], &[E::SendLie])
        .rule(S::OneWay, E::LevelChanged, Some(S::OneWay), &[A::UpdateLevel], &[])
        .rule(S::OneWay, E::LieReceived, None, &[A::ProcessLie], &[])
        .rule(S::OneWay, E::NewNeighbor, Some(S::TwoWay), &[], &[E::SendLie])
        .rule(S::OneWay, E::UnacceptableHeader, Some(S::OneWay), &[], &[])
        .rule(S::OneWay, E::HoldTimeExpired, None, &[], &[])
        .rule(S::OneWay, E::MultipleNeighbors, Some(S::OneWay), &[], &[])
        .rule(S::OneWay, E::LieCorrupt, Some(S::OneWay), &[], &[])
        .rule(S::OneWay, E::SendLie, None, &[A::SendLie], &[])
        .rule(S::TwoWay, E::TimerTick, None, &[A::CheckHoldTime], &[E::SendLie])
        .rule(S::TwoWay, E::LevelChanged, Some(S::OneWay), &[A::UpdateLevel], &[])
        .rule(S::TwoWay, E::LieReceived, None, &[A::ProcessLie], &[])
        .rule(S::TwoWay, E::ValidReflection, Some(S::ThreeWay), &[], &[])
        .rule(S::TwoWay, E::NeighborChangedLevel, Some(S::OneWay), &[], &[])
        .rule(S::TwoWay, E::NeighborChangedAddress, Some(S::OneWay), &[], &[])
        .rule(S::TwoWay, E::NeighborChangedMinorFields, None, &[], &[])
        .rule(S::TwoWay, E::UnacceptableHeader, Some(S::OneWay), &[], &[])
        .rule(S::TwoWay, E::HoldTimeExpired, Some(S::OneWay), &[], &[])
        .rule(S::TwoWay, E::MultipleNeighbors, Some(S::OneWay), &[], &[])
        .rule(S::TwoWay, E::LieCorrupt, Some(S::OneWay), &[], &[])
        .rule(S::TwoWay, E::SendLie, None, &[A::SendLie], &[])
        .rule(S::ThreeWay, E::TimerTick, None, &[A::CheckHoldTime], &[E::SendLie])
        .rule(S::ThreeWay, E::LevelChanged, Some(S::OneWay), &[A::UpdateLevel], &[])
        .rule(S::ThreeWay, E::LieReceived, None, &[A::ProcessLie], &[])
        .rule(
            S::ThreeWay,
            E::NeighborDroppedReflection,
            Some(S::TwoWay),
            &[],
            &[],
        )
        .rule(S::ThreeWay, E::NeighborChangedLevel, Some(S::OneWay), &[], &[])
        .rule(
            S::ThreeWay,
            E::NeighborChangedAddress,
            Some(S::OneWay),
            &[],
            &[],
        )
        .rule(S::ThreeWay, E::NeighborChangedMinorFields, None, &[], &[])
        .rule(S::ThreeWay, E::UnacceptableHeader, Some(S::OneWay), &[], &[])
        .rule(S::ThreeWay, E::HoldTimeExpired, Some(S::OneWay), &[], &[])
        .rule(S::ThreeWay, E::MultipleNeighbors, Some(S::OneWay), &[], &[])
        .rule(S::ThreeWay, E::LieCorrupt, Some(S::OneWay), &[], &[])
        .rule(S::ThreeWay, E::SendLie, None, &[A::SendLie], &[])
        .on_entry(S::OneWay, &[A::Cleanup, A::SendLie])
        .on_entry(S::ThreeWay, &[A::StartFlooding])
        .on_exit(S::ThreeWay, &[A::StopFlooding])
}

/// What an interface knows about its current neighbor
///
/// At most one per interface; replaced wholesale on every accepted LIE and
/// cleared on entry to OneWay.
#[derive(Debug, Clone)]
pub struct Neighbor {
    /// The neighbor's system id
    pub system_id: SystemId,
    /// The neighbor's node name, for display
    pub name: Option<String>,
    /// The link id the neighbor advertises for its end of this link
    pub link_id: LinkId,
    /// Who the neighbor reports as its own neighbor, if anyone
    pub reflection: Option<NeighborRef>,
    /// Address the neighbor's LIEs arrive from
    pub address: SocketAddr,
    /// Port the neighbor floods TIEs on
    pub flood_port: u16,
    /// The neighbor's advertised link MTU
    pub link_mtu: u16,
    /// The level the neighbor advertises
    pub level: Option<Level>,
    /// The neighbor's point-of-delivery tag
    pub pod: Option<PodId>,
    /// Ticks without a LIE before the neighbor is declared dead
    pub hold_time: u16,
    /// The neighbor's current nonce
    pub nonce: u64,
    /// The neighbor can only be a leaf
    pub leaf_only: bool,
    /// The neighbor supports leaf-to-leaf adjacencies
    pub leaf_to_leaf: bool,
    /// The neighbor supports flood reduction
    pub flood_reduction: bool,
    /// The neighbor's advertised level is poisoned for ZTP
    pub not_a_ztp_offer: bool,
    /// The neighbor elected us flood repeater
    pub you_are_flood_repeater: bool,
}

impl Neighbor {
    fn from_lie(lie: &LiePacket, address: SocketAddr) -> Self {
        Self {
            system_id: lie.header.sender,
            name: lie.name.clone(),
            link_id: lie.local_link_id,
            reflection: lie.neighbor,
            address,
            flood_port: lie.flood_port,
            link_mtu: lie.link_mtu,
            level: lie.header.level,
            pod: lie.pod,
            hold_time: lie.hold_time,
            nonce: lie.nonce,
            leaf_only: lie.leaf_only,
            leaf_to_leaf: lie.leaf_to_leaf,
            flood_reduction: lie.flood_reduction,
            not_a_ztp_offer: lie.not_a_ztp_offer,
            you_are_flood_repeater: lie.you_are_flood_repeater,
        }
    }
}

/// Why a received LIE was not accepted
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum RejectReason {
    VersionMismatch,
    InvalidSystemId,
    SelfLoop,
    MtuMismatch,
    UndefinedLevel,
    PodMismatch,
    LevelMismatch,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VersionMismatch => "major version mismatch",
            Self::InvalidSystemId => "invalid system id",
            Self::SelfLoop => "own system id",
            Self::MtuMismatch => "MTU mismatch",
            Self::UndefinedLevel => "undefined level",
            Self::PodMismatch => "PoD mismatch",
            Self::LevelMismatch => "level mismatch",
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Verdict {
    Accept,
    Reject {
        reason: RejectReason,
        /// Whether the rejection is still surfaced to ZTP as an offer
        offer: bool,
    },
}

impl Verdict {
    fn reject(reason: RejectReason) -> Self {
        let offer = !matches!(
            reason,
            RejectReason::InvalidSystemId | RejectReason::SelfLoop
        );
        Self::Reject { reason, offer }
    }
}

/// Inputs the acceptance rules depend on, besides the packet itself
pub(crate) struct AcceptanceContext {
    pub(crate) system_id: SystemId,
    pub(crate) level: Option<Level>,
    pub(crate) mtu: u16,
    pub(crate) pod: Option<PodId>,
    pub(crate) leaf_to_leaf: bool,
    pub(crate) hat: Option<Level>,
}

/// The acceptance algorithm, first matching rule wins
pub(crate) fn classify(lie: &LiePacket, local: &AcceptanceContext) -> Verdict {
    use RejectReason::*;
    if lie.header.major_version != PROTOCOL_MAJOR_VERSION {
        return Verdict::reject(VersionMismatch);
    }
    if !lie.header.sender.is_valid() {
        return Verdict::reject(InvalidSystemId);
    }
    if lie.header.sender == local.system_id {
        return Verdict::reject(SelfLoop);
    }
    if lie.link_mtu != local.mtu {
        return Verdict::reject(MtuMismatch);
    }
    let (Some(level), Some(remote)) = (local.level, lie.header.level) else {
        return Verdict::reject(UndefinedLevel);
    };
    if let (Some(ours), Some(theirs)) = (local.pod, lie.pod) {
        if ours != theirs {
            return Verdict::reject(PodMismatch);
        }
    }
    let acceptable =
        // we are a leaf and our three-way ceiling does not exceed the remote
        (level.is_leaf() && local.hat.map_or(true, |hat| hat <= remote))
        // the remote is a leaf below us
        || (!level.is_leaf() && remote.is_leaf())
        // two leaves that both support east-west links
        || (level.is_leaf() && remote.is_leaf() && local.leaf_to_leaf && lie.leaf_to_leaf)
        // adjacent levels in the fabric
        || (!level.is_leaf() && !remote.is_leaf() && level.0.abs_diff(remote.0) <= 1);
    if acceptable {
        Verdict::Accept
    } else {
        Verdict::reject(LevelMismatch)
    }
}

/// Counters kept per interface, introspection only
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct InterfaceStats {
    /// LIEs handed to this interface
    pub lies_received: u64,
    /// Received LIEs that passed the acceptance rules
    pub lies_accepted: u64,
    /// Received LIEs that failed the acceptance rules
    pub lies_rejected: u64,
    /// LIEs produced for transmission
    pub lies_sent: u64,
    /// Times the adjacency dropped back to OneWay with a neighbor installed
    pub adjacency_resets: u64,
}

/// The adjacency data the LIE actions operate on
///
/// Owned by the node's per-interface slot next to the machine instance, so
/// the engine can borrow machine and handler independently.
pub(crate) struct Adjacency {
    pub(crate) id: InterfaceId,
    pub(crate) cfg: InterfaceConfig,
    /// The level this interface currently advertises
    pub(crate) level: Option<Level>,
    pub(crate) neighbor: Option<Neighbor>,
    /// Ticks since the last accepted LIE
    pub(crate) hold_ticks: u32,
    pub(crate) local_nonce: u64,
    /// The neighbor's last seen nonce, reflected in outgoing LIEs
    pub(crate) remote_nonce: u64,
    pub(crate) stats: InterfaceStats,
}

impl Adjacency {
    pub(crate) fn new(
        id: InterfaceId,
        cfg: InterfaceConfig,
        level: Option<Level>,
        nonce: u64,
    ) -> Self {
        Self {
            id,
            cfg,
            level,
            neighbor: None,
            hold_ticks: 0,
            local_nonce: nonce,
            remote_nonce: 0,
            stats: InterfaceStats::default(),
        }
    }

    fn process_lie(&mut self, lie: &LiePacket, source: SocketAddr, ctx: &mut LieCtx<'_>) {
        self.stats.lies_received += 1;
        match classify(lie, &self.acceptance_context(ctx)) {
            Verdict::Accept => self.accept_lie(lie, source, ctx),
            Verdict::Reject { reason, offer } => {
                self.stats.lies_rejected += 1;
                debug!(
                    interface = %self.cfg.name,
                    sender = %lie.header.sender,
                    %reason,
                    "rejected LIE"
                );
                if offer {
                    let offer = self.offer_from(lie, ctx.state());
                    ctx.push_offer(offer);
                }
                if reason == RejectReason::VersionMismatch {
                    ctx.push(LieEvent::UnacceptableHeader);
                }
            }
        }
    }

    fn acceptance_context(&self, ctx: &LieCtx<'_>) -> AcceptanceContext {
        AcceptanceContext {
            system_id: ctx.system_id(),
            level: self.level,
            mtu: self.cfg.mtu,
            pod: self.cfg.pod,
            leaf_to_leaf: ctx.leaf_to_leaf(),
            hat: ctx.hat(),
        }
    }

    fn accept_lie(&mut self, lie: &LiePacket, source: SocketAddr, ctx: &mut LieCtx<'_>) {
        self.stats.lies_accepted += 1;
        self.hold_ticks = 0;
        self.remote_nonce = lie.nonce;
        let offer = self.offer_from(lie, ctx.state());
        ctx.push_offer(offer);

        let fresh = Neighbor::from_lie(lie, source);
        match self.neighbor.take() {
            None => {
                info!(
                    interface = %self.cfg.name,
                    neighbor = %fresh.system_id,
                    level = ?fresh.level,
                    "new neighbor"
                );
                self.neighbor = Some(fresh);
                ctx.push(LieEvent::NewNeighbor);
            }
            Some(current) => {
                let major = if current.system_id != fresh.system_id {
                    Some(LieEvent::MultipleNeighbors)
                } else if current.level != fresh.level {
                    Some(LieEvent::NeighborChangedLevel)
                } else if current.address != fresh.address {
                    Some(LieEvent::NeighborChangedAddress)
                } else {
                    None
                };
                let minor = current.flood_port != fresh.flood_port
                    || current.name != fresh.name
                    || current.link_id != fresh.link_id
                    || current.you_are_flood_repeater != fresh.you_are_flood_repeater;
                self.neighbor = Some(fresh);
                match major {
                    Some(event) => ctx.push(event),
                    None => {
                        if minor {
                            ctx.push(LieEvent::NeighborChangedMinorFields);
                        }
                        self.check_three_way(ctx);
                    }
                }
            }
        }
    }

    /// Evaluate the neighbor's reflection of us against the current state
    fn check_three_way(&mut self, ctx: &mut LieCtx<'_>) {
        let Some(neighbor) = &self.neighbor else {
            return;
        };
        let valid = neighbor
            .reflection
            .map(|r| r.originator == ctx.system_id() && r.link_id == self.cfg.link_id);
        match (ctx.state(), valid) {
            (LieState::OneWay, _) => {}
            (LieState::TwoWay, None) => {}
            (LieState::TwoWay, Some(true)) => ctx.push(LieEvent::ValidReflection),
            (LieState::ThreeWay, Some(true)) => {}
            (LieState::ThreeWay, None) => ctx.push(LieEvent::NeighborDroppedReflection),
            (_, Some(false)) => ctx.push(LieEvent::MultipleNeighbors),
        }
    }

    fn offer_from(&self, lie: &LiePacket, state: LieState) -> Offer {
        Offer {
            interface: self.id,
            interface_name: self.cfg.name.clone(),
            system_id: lie.header.sender,
            level: lie.header.level,
            not_a_ztp_offer: lie.not_a_ztp_offer,
            adjacency_state: state,
            removed: false,
            removed_reason: None,
            best: false,
            best_three_way: false,
        }
    }

    fn send_lie(&mut self, ctx: &mut LieCtx<'_>) {
        // Poison reverse: never re-offer a level to the interface it was
        // learned from
        let poison = match (ctx.offer(), ctx.hal()) {
            (Some(offer), Some(hal)) => !offer.removed && offer.level == Some(hal),
            _ => false,
        };
        let lie = LieOut {
            interface: self.id,
            header: Header {
                major_version: PROTOCOL_MAJOR_VERSION,
                minor_version: PROTOCOL_MINOR_VERSION,
                sender: ctx.system_id(),
                level: self.level,
            },
            name: Some(ctx.node_name().to_owned()),
            local_link_id: self.cfg.link_id,
            flood_port: self.cfg.flood_port,
            link_mtu: self.cfg.mtu,
            neighbor: self.neighbor.as_ref().map(|n| NeighborRef {
                originator: n.system_id,
                link_id: n.link_id,
            }),
            pod: self.cfg.pod,
            nonce: self.local_nonce,
            remote_nonce: self.remote_nonce,
            hold_time: ctx.advertised_hold_time(),
            leaf_only: ctx.leaf_only(),
            leaf_to_leaf: ctx.leaf_to_leaf(),
            flood_reduction: false,
            not_a_ztp_offer: poison,
            you_are_flood_repeater: false,
        };
        ctx.transmit(lie);
        self.stats.lies_sent += 1;
    }

    fn check_hold_time(&mut self, ctx: &mut LieCtx<'_>) {
        let limit = self
            .neighbor
            .as_ref()
            .map(|n| n.hold_time)
            .unwrap_or_else(|| ctx.default_hold_time())
            .max(1);
        self.hold_ticks += 1;
        if self.hold_ticks >= u32::from(limit) {
            ctx.push(LieEvent::HoldTimeExpired);
        }
    }

    fn update_level(&mut self, data: Option<&LieEventData>) {
        if let Some(LieEventData::Level(level)) = data {
            debug!(interface = %self.cfg.name, level = ?level, "advertised level updated");
            self.level = *level;
        }
    }

    /// Entry action for OneWay: forget the neighbor and reset counters
    fn cleanup(&mut self, cause: Option<LieEvent>, ctx: &mut LieCtx<'_>) {
        if let Some(neighbor) = self.neighbor.take() {
            let reason = match cause {
                Some(LieEvent::HoldTimeExpired) => OfferRemovalReason::HoldTimeExpired,
                _ => OfferRemovalReason::LostNeighbor,
            };
            info!(
                interface = %self.cfg.name,
                neighbor = %neighbor.system_id,
                %reason,
                "adjacency down"
            );
            ctx.push_offer(Offer::withdrawn(
                self.id,
                self.cfg.name.clone(),
                neighbor.system_id,
                neighbor.level,
                reason,
            ));
            self.stats.adjacency_resets += 1;
        }
        self.hold_ticks = 0;
        self.remote_nonce = 0;
        self.local_nonce = ctx.fresh_nonce();
    }
}

impl<'a> Handler<LieFsm, LieCtx<'a>> for Adjacency {
    fn invoke(&mut self, action: LieAction, cause: Cause<'_, LieFsm>, ctx: &mut LieCtx<'a>) {
        match action {
            LieAction::ProcessLie => match cause.data {
                Some(LieEventData::Packet { lie, source }) => {
                    self.process_lie(lie, *source, ctx);
                }
                _ => warn!(interface = %self.cfg.name, "LieReceived without a packet"),
            },
            LieAction::SendLie => self.send_lie(ctx),
            LieAction::UpdateLevel => self.update_level(cause.data),
            LieAction::CheckHoldTime => self.check_hold_time(ctx),
            LieAction::Cleanup => self.cleanup(cause.event, ctx),
            LieAction::StartFlooding => {
                info!(interface = %self.cfg.name, "adjacency up");
                ctx.signal(NodeEvent::FloodingStarted { interface: self.id });
            }
            LieAction::StopFlooding => {
                ctx.signal(NodeEvent::FloodingStopped { interface: self.id });
            }
        }
    }
}
