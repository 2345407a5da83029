//! The engine context: queues, timers, and event dispatch
//!
//! A [`Node`] owns one ZTP machine, one adjacency machine per interface, the
//! two event queues that sequence delivery between them, and the timer
//! queue. It performs no I/O: decoded LIEs go in, LIE field sets and signals
//! come out, and [`Node::drive`] runs everything pending to quiescence.
//!
//! Delivery order is the protocol's backbone: any event pushed while an
//! event is being processed (by the same machine or another one its actions
//! reach) goes to the *chained* queue, and the chained queue always drains
//! completely before the next *external* event (inbound packet, timer
//! expiry, configuration change) is considered. A cause-and-effect chain
//! triggered by one external stimulus therefore settles atomically with
//! respect to unrelated stimuli.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slab::Slab;
use tracing::{info, trace};

use crate::config::{ConfigError, InterfaceConfig, LevelConfig, NodeConfig};
use crate::fsm::{EventSink, Fsm, Record, Table};
use crate::lie::{
    self, Adjacency, InterfaceStats, LieEvent, LieEventData, LieFsm, LieState, Neighbor,
};
use crate::packet::{LieOut, LiePacket};
use crate::timer::{TimerQueue, TimerToken};
use crate::ztp::{
    self, Offer, OfferRemovalReason, Ztp, ZtpEvent, ZtpEventData, ZtpFsm, ZtpState,
};
use crate::{Level, SystemId};

/// Identifies one interface of a [`Node`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct InterfaceId(pub(crate) usize);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Signals produced for external subsystems, drained via [`Node::poll_event`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NodeEvent {
    /// An adjacency reached ThreeWay; start the TIE flooding session
    FloodingStarted {
        /// The interface whose adjacency came up
        interface: InterfaceId,
    },
    /// An adjacency left ThreeWay; stop the TIE flooding session
    FloodingStopped {
        /// The interface whose adjacency went down
        interface: InterfaceId,
    },
    /// The node's level changed; re-originate self-describing topology
    LevelChanged {
        /// The new level, if one is currently derived or configured
        level: Option<Level>,
    },
}

/// An event addressed to one machine instance
#[derive(Debug, Clone)]
pub(crate) enum Envelope {
    Lie {
        iface: InterfaceId,
        event: LieEvent,
        data: Option<LieEventData>,
    },
    Ztp {
        event: ZtpEvent,
        data: Option<ZtpEventData>,
    },
}

impl Envelope {
    pub(crate) fn hold_down_expired() -> Self {
        Self::Ztp {
            event: ZtpEvent::HoldDownExpired,
            data: None,
        }
    }
}

/// The external and chained FIFO queues
///
/// Queue selection is explicit: `processing` is set for exactly the
/// duration of a dispatch, and every push made while it is set lands on the
/// chained queue.
#[derive(Default)]
pub(crate) struct EventQueues {
    external: VecDeque<Envelope>,
    chained: VecDeque<Envelope>,
    pub(crate) processing: bool,
}

impl EventQueues {
    pub(crate) fn push(&mut self, envelope: Envelope) {
        if self.processing {
            self.chained.push_back(envelope);
        } else {
            self.external.push_back(envelope);
        }
    }

    /// Chained events always drain before the next external one
    fn pop(&mut self) -> Option<Envelope> {
        self.chained
            .pop_front()
            .or_else(|| self.external.pop_front())
    }
}

/// Mutable engine state every action may touch
pub(crate) struct Effects<'a> {
    pub(crate) now: Instant,
    pub(crate) queues: &'a mut EventQueues,
    pub(crate) transmits: &'a mut VecDeque<LieOut>,
    pub(crate) signals: &'a mut VecDeque<NodeEvent>,
    pub(crate) timers: &'a mut TimerQueue<Envelope>,
    pub(crate) rng: &'a mut StdRng,
}

/// Context handed to adjacency actions
pub(crate) struct LieCtx<'a> {
    iface: InterfaceId,
    state: LieState,
    config: &'a NodeConfig,
    ztp: &'a Ztp,
    pub(crate) fx: Effects<'a>,
}

impl LieCtx<'_> {
    /// The machine's state when the current event was taken up
    pub(crate) fn state(&self) -> LieState {
        self.state
    }

    pub(crate) fn system_id(&self) -> SystemId {
        self.config.system_id
    }

    pub(crate) fn node_name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn advertised_hold_time(&self) -> u16 {
        self.config.advertised_hold_time
    }

    pub(crate) fn default_hold_time(&self) -> u16 {
        self.config.default_hold_time
    }

    pub(crate) fn leaf_only(&self) -> bool {
        matches!(self.config.level, LevelConfig::Leaf)
    }

    pub(crate) fn leaf_to_leaf(&self) -> bool {
        self.config.leaf_to_leaf
    }

    pub(crate) fn hal(&self) -> Option<Level> {
        self.ztp.hal()
    }

    pub(crate) fn hat(&self) -> Option<Level> {
        self.ztp.hat()
    }

    /// The offer most recently received on this interface
    pub(crate) fn offer(&self) -> Option<&Offer> {
        self.ztp.offer(self.iface)
    }

    pub(crate) fn push_offer(&mut self, offer: Offer) {
        self.fx.queues.push(Envelope::Ztp {
            event: ZtpEvent::NeighborOffer,
            data: Some(ZtpEventData::Offer(offer)),
        });
    }

    pub(crate) fn transmit(&mut self, lie: LieOut) {
        self.fx.transmits.push_back(lie);
    }

    pub(crate) fn signal(&mut self, event: NodeEvent) {
        self.fx.signals.push_back(event);
    }

    pub(crate) fn fresh_nonce(&mut self) -> u64 {
        fresh_nonce(self.fx.rng)
    }
}

impl EventSink<LieEvent> for LieCtx<'_> {
    fn push(&mut self, event: LieEvent) {
        self.fx.queues.push(Envelope::Lie {
            iface: self.iface,
            event,
            data: None,
        });
    }
}

/// Context handed to ZTP actions
pub(crate) struct ZtpCtx<'a> {
    config: &'a NodeConfig,
    interfaces: &'a Slab<Interface>,
    pub(crate) fx: Effects<'a>,
}

impl ZtpCtx<'_> {
    pub(crate) fn now(&self) -> Instant {
        self.fx.now
    }

    pub(crate) fn hold_down(&self) -> std::time::Duration {
        self.config.hold_down
    }

    pub(crate) fn interface_ids(&self) -> Vec<InterfaceId> {
        self.interfaces.iter().map(|(k, _)| InterfaceId(k)).collect()
    }

    pub(crate) fn signal(&mut self, event: NodeEvent) {
        self.fx.signals.push_back(event);
    }
}

impl EventSink<ZtpEvent> for ZtpCtx<'_> {
    fn push(&mut self, event: ZtpEvent) {
        self.fx.queues.push(Envelope::Ztp { event, data: None });
    }
}

pub(crate) struct Interface {
    pub(crate) fsm: Fsm<LieFsm>,
    pub(crate) adj: Adjacency,
    tick_timer: TimerToken,
}

/// One RIFT node: the ZTP machine, its interfaces, and the engine that
/// drives them
///
/// Performs no I/O and reads no clocks; see the crate docs for the driving
/// contract. Multiple nodes in one process are fully independent.
pub struct Node {
    config: NodeConfig,
    lie_table: Table<LieFsm>,
    ztp_table: Table<ZtpFsm>,
    interfaces: Slab<Interface>,
    ztp_fsm: Fsm<ZtpFsm>,
    ztp: Ztp,
    queues: EventQueues,
    timers: TimerQueue<Envelope>,
    transmits: VecDeque<LieOut>,
    signals: VecDeque<NodeEvent>,
    /// History sequence numbers, shared by every machine on this node
    seq: u64,
    started: bool,
    rng: StdRng,
}

impl Node {
    /// Create a node; no machine runs until [`start`](Self::start)
    pub fn new(config: NodeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let lie_table = lie::table();
        let ztp_table = ztp::table();
        let ztp_fsm = Fsm::new(&ztp_table, config.history_capacity);
        let ztp = Ztp::new(config.level);
        Ok(Self {
            config,
            lie_table,
            ztp_table,
            interfaces: Slab::new(),
            ztp_fsm,
            ztp,
            queues: EventQueues::default(),
            timers: TimerQueue::new(),
            transmits: VecDeque::new(),
            signals: VecDeque::new(),
            seq: 0,
            started: false,
            rng: StdRng::from_entropy(),
        })
    }

    /// Run every machine's initial entry actions and settle the fallout
    pub fn start(&mut self, now: Instant) {
        if self.started {
            return;
        }
        self.started = true;
        info!(node = %self.config.name, system = %self.config.system_id, "starting");
        {
            let Self {
                config,
                interfaces,
                ztp_fsm,
                ztp,
                queues,
                timers,
                transmits,
                signals,
                rng,
                ztp_table,
                ..
            } = self;
            let mut ctx = ZtpCtx {
                config,
                interfaces,
                fx: Effects {
                    now,
                    queues,
                    transmits,
                    signals,
                    timers,
                    rng,
                },
            };
            ztp_fsm.start(ztp_table, ztp, &mut ctx);
        }
        let keys: Vec<usize> = self.interfaces.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.start_interface(key, now);
        }
        self.drive(now);
    }

    /// Attach a point-to-point interface
    ///
    /// Arms its periodic LIE timer; if the node is already started, the
    /// interface's machine starts (and advertises) immediately.
    pub fn add_interface(
        &mut self,
        cfg: InterfaceConfig,
        now: Instant,
    ) -> Result<InterfaceId, ConfigError> {
        cfg.validate()?;
        for (_, interface) in self.interfaces.iter() {
            if interface.adj.cfg.link_id == cfg.link_id {
                return Err(ConfigError::DuplicateLinkId(cfg.link_id));
            }
            if interface.adj.cfg.name == cfg.name {
                return Err(ConfigError::DuplicateInterfaceName(cfg.name));
            }
        }
        let key = self.interfaces.vacant_key();
        let id = InterfaceId(key);
        let tick_timer = self.timers.insert(
            Envelope::Lie {
                iface: id,
                event: LieEvent::TimerTick,
                data: None,
            },
            now + self.config.lie_interval,
            Some(self.config.lie_interval),
        );
        let nonce = fresh_nonce(&mut self.rng);
        let adj = Adjacency::new(id, cfg, self.ztp.level(), nonce);
        let fsm = Fsm::new(&self.lie_table, self.config.history_capacity);
        info!(node = %self.config.name, interface = %adj.cfg.name, "interface added");
        self.interfaces.insert(Interface {
            fsm,
            adj,
            tick_timer,
        });
        if self.started {
            self.start_interface(key, now);
            self.drive(now);
        }
        Ok(id)
    }

    /// Detach `id`: cancel its timers, withdraw its offer, and signal the
    /// end of any flooding session
    pub fn remove_interface(&mut self, id: InterfaceId, now: Instant) {
        let Some(interface) = self.interfaces.try_remove(id.0) else {
            return;
        };
        self.timers.remove(interface.tick_timer);
        if interface.fsm.state() == LieState::ThreeWay {
            self.signals
                .push_back(NodeEvent::FloodingStopped { interface: id });
        }
        if let Some(offer) = self.ztp.offer(id) {
            let withdrawn = Offer {
                removed: true,
                removed_reason: Some(OfferRemovalReason::InterfaceRemoved),
                best: false,
                best_three_way: false,
                ..offer.clone()
            };
            self.queues.push(Envelope::Ztp {
                event: ZtpEvent::NeighborOffer,
                data: Some(ZtpEventData::Offer(withdrawn)),
            });
        }
        info!(node = %self.config.name, interface = %interface.adj.cfg.name, "interface removed");
        self.drive(now);
    }

    /// Enqueue an inbound decoded LIE for `id`
    ///
    /// Processing happens on the next [`drive`](Self::drive).
    pub fn handle_lie(&mut self, id: InterfaceId, lie: LiePacket, source: SocketAddr) {
        self.queues.push(Envelope::Lie {
            iface: id,
            event: LieEvent::LieReceived,
            data: Some(LieEventData::Packet { lie, source }),
        });
    }

    /// Enqueue notice that the transport failed to decode a packet on `id`
    pub fn notify_corrupt_lie(&mut self, id: InterfaceId) {
        self.queues.push(Envelope::Lie {
            iface: id,
            event: LieEvent::LieCorrupt,
            data: None,
        });
    }

    /// Enqueue a level reconfiguration
    pub fn set_configured_level(&mut self, level: LevelConfig) {
        self.queues.push(Envelope::Ztp {
            event: ZtpEvent::ChangeLocalConfiguredLevel,
            data: Some(ZtpEventData::ConfiguredLevel(level)),
        });
    }

    /// Fire every due timer and drain both queues to quiescence
    ///
    /// Draining events can arm timers already due and firing timers
    /// enqueues events, so both are repeated until neither makes progress.
    pub fn drive(&mut self, now: Instant) {
        loop {
            let mut progressed = false;
            while let Some(envelope) = self.timers.poll(now) {
                progressed = true;
                self.queues.push(envelope);
            }
            while let Some(envelope) = self.queues.pop() {
                progressed = true;
                self.dispatch(envelope, now);
            }
            if !progressed {
                break;
            }
        }
    }

    /// When [`drive`](Self::drive) next has work, if ever
    pub fn next_timeout(&mut self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Take the next outgoing LIE's field values, if any
    pub fn poll_transmit(&mut self) -> Option<LieOut> {
        self.transmits.pop_front()
    }

    /// Take the next signal for external subsystems, if any
    pub fn poll_event(&mut self) -> Option<NodeEvent> {
        self.signals.pop_front()
    }

    fn dispatch(&mut self, envelope: Envelope, now: Instant) {
        self.seq += 1;
        let seq = self.seq;
        self.queues.processing = true;
        let Self {
            config,
            interfaces,
            ztp_fsm,
            ztp,
            queues,
            timers,
            transmits,
            signals,
            rng,
            lie_table,
            ztp_table,
            ..
        } = self;
        match envelope {
            Envelope::Lie { iface, event, data } => match interfaces.get_mut(iface.0) {
                None => trace!(interface = %iface, ?event, "event for removed interface"),
                Some(interface) => {
                    let Interface { fsm, adj, .. } = interface;
                    let mut ctx = LieCtx {
                        iface,
                        state: fsm.state(),
                        config,
                        ztp,
                        fx: Effects {
                            now,
                            queues,
                            transmits,
                            signals,
                            timers,
                            rng,
                        },
                    };
                    fsm.process(lie_table, seq, now, event, data.as_ref(), adj, &mut ctx);
                }
            },
            Envelope::Ztp { event, data } => {
                let mut ctx = ZtpCtx {
                    config,
                    interfaces,
                    fx: Effects {
                        now,
                        queues,
                        transmits,
                        signals,
                        timers,
                        rng,
                    },
                };
                ztp_fsm.process(ztp_table, seq, now, event, data.as_ref(), ztp, &mut ctx);
            }
        }
        self.queues.processing = false;
    }

    fn start_interface(&mut self, key: usize, now: Instant) {
        let Self {
            config,
            interfaces,
            ztp,
            queues,
            timers,
            transmits,
            signals,
            rng,
            lie_table,
            ..
        } = self;
        let Some(interface) = interfaces.get_mut(key) else {
            return;
        };
        let Interface { fsm, adj, .. } = interface;
        let mut ctx = LieCtx {
            iface: InterfaceId(key),
            state: fsm.state(),
            config,
            ztp,
            fx: Effects {
                now,
                queues,
                transmits,
                signals,
                timers,
                rng,
            },
        };
        fsm.start(lie_table, adj, &mut ctx);
    }

    // Introspection, side-effect free; consumed by management front ends.

    /// This node's system id
    pub fn system_id(&self) -> SystemId {
        self.config.system_id
    }

    /// This node's name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The node's current level, derived or configured
    pub fn level(&self) -> Option<Level> {
        self.ztp.level()
    }

    /// The current Highest Available Level
    pub fn hal(&self) -> Option<Level> {
        self.ztp.hal()
    }

    /// The current Highest Adjacency-Three-Way level
    pub fn hat(&self) -> Option<Level> {
        self.ztp.hat()
    }

    /// The ZTP machine's current state
    pub fn ztp_state(&self) -> ZtpState {
        self.ztp_fsm.state()
    }

    /// The ZTP machine's retained transition records, oldest first
    pub fn ztp_history(&self) -> impl Iterator<Item = &Record<ZtpFsm>> {
        self.ztp_fsm.history()
    }

    /// All currently held offers, including removed ones
    pub fn offers(&self) -> impl Iterator<Item = &Offer> {
        self.ztp.offers()
    }

    /// Attached interfaces as `(id, name)` pairs
    pub fn interfaces(&self) -> impl Iterator<Item = (InterfaceId, &str)> {
        self.interfaces
            .iter()
            .map(|(k, i)| (InterfaceId(k), i.adj.cfg.name.as_str()))
    }

    /// The adjacency state of `id`
    pub fn interface_state(&self, id: InterfaceId) -> Option<LieState> {
        self.interfaces.get(id.0).map(|i| i.fsm.state())
    }

    /// The current neighbor on `id`, if one is installed
    pub fn neighbor(&self, id: InterfaceId) -> Option<&Neighbor> {
        self.interfaces.get(id.0)?.adj.neighbor.as_ref()
    }

    /// Counters for `id`
    pub fn interface_stats(&self, id: InterfaceId) -> Option<InterfaceStats> {
        self.interfaces.get(id.0).map(|i| i.adj.stats)
    }

    /// The configuration `id` was attached with, for transport pass-through
    pub fn interface_config(&self, id: InterfaceId) -> Option<&InterfaceConfig> {
        self.interfaces.get(id.0).map(|i| &i.adj.cfg)
    }

    /// The adjacency machine's retained transition records for `id`
    pub fn interface_history(
        &self,
        id: InterfaceId,
    ) -> Option<impl Iterator<Item = &Record<LieFsm>>> {
        self.interfaces.get(id.0).map(|i| i.fsm.history())
    }

    /// The adjacency transition table, for display
    pub fn lie_table(&self) -> &Table<LieFsm> {
        &self.lie_table
    }

    /// The ZTP transition table, for display
    pub fn ztp_table(&self) -> &Table<ZtpFsm> {
        &self.ztp_table
    }
}

pub(crate) fn fresh_nonce(rng: &mut StdRng) -> u64 {
    loop {
        let nonce = rng.gen::<u64>();
        if nonce != 0 {
            return nonce;
        }
    }
}
