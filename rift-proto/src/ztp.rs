//! Zero-touch-provisioning level determination
//!
//! One instance per node. Consumes the offers surfaced by every interface's
//! adjacency machine, selects the Highest Available Level (HAL) and the
//! Highest Adjacency-Three-Way level (HAT), and derives this node's own
//! level as `HAL - 1` when no level is configured. Losing the HAL source is
//! held down while any southbound adjacency still depends on the current
//! level, so the fabric does not ripple on a single flap.

use std::cmp::Ordering;
use std::fmt;

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::config::LevelConfig;
use crate::fsm::{Cause, EventSink, Handler, Machine, Table};
use crate::lie::{LieEvent, LieEventData, LieState};
use crate::node::{Envelope, InterfaceId, NodeEvent, ZtpCtx};
use crate::timer::TimerToken;
use crate::{Level, SystemId};

/// ZTP states
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum ZtpState {
    /// Re-selecting the best offers and recomputing the level
    ComputeBestOffer,
    /// Level source lost; waiting before recomputing
    HoldingDown,
    /// Level published; waiting for offer changes
    UpdatingClients,
}

/// ZTP events
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
#[allow(missing_docs)]
pub enum ZtpEvent {
    ChangeLocalConfiguredLevel,
    NeighborOffer,
    BetterHal,
    BetterHat,
    LostHal,
    LostHat,
    ComputationDone,
    HoldDownExpired,
}

/// ZTP action identifiers, resolved by the node
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum ZtpAction {
    StoreLevel,
    UpdateOrRemoveOffer,
    LevelCompute,
    StartHoldDownOnLostHal,
    PurgeOffers,
    UpdateClients,
}

/// Payload delivered with some ZTP events
#[derive(Debug, Clone)]
pub enum ZtpEventData {
    /// An offer update from an interface (`NeighborOffer`)
    Offer(Offer),
    /// A new level configuration (`ChangeLocalConfiguredLevel`)
    ConfiguredLevel(LevelConfig),
}

/// Marker for the ZTP machine kind
pub struct ZtpFsm;

impl Machine for ZtpFsm {
    type State = ZtpState;
    type Event = ZtpEvent;
    type Action = ZtpAction;
    type Data = ZtpEventData;

    const NAME: &'static str = "ztp";
}

pub(crate) fn table() -> Table<ZtpFsm> {
    use ZtpAction as A;
    use ZtpEvent as E;
    use ZtpState as S;
    Table::new(S::ComputeBestOffer)
        .rule(
            S::ComputeBestOffer,
            E::ChangeLocalConfiguredLevel,
            None,
            &[A::StoreLevel, A::LevelCompute],
            &[],
        )
        .rule(
            S::ComputeBestOffer,
            E::NeighborOffer,
            None,
            &[A::UpdateOrRemoveOffer],
            &[],
        )
        .rule(S::ComputeBestOffer, E::BetterHal, None, &[A::LevelCompute], &[])
        .rule(S::ComputeBestOffer, E::BetterHat, None, &[A::LevelCompute], &[])
        .rule(
            S::ComputeBestOffer,
            E::LostHal,
            Some(S::HoldingDown),
            &[A::StartHoldDownOnLostHal],
            &[],
        )
        .rule(S::ComputeBestOffer, E::LostHat, None, &[A::LevelCompute], &[])
        .rule(
            S::ComputeBestOffer,
            E::ComputationDone,
            Some(S::UpdatingClients),
            &[],
            &[],
        )
        .rule(
            S::UpdatingClients,
            E::ChangeLocalConfiguredLevel,
            Some(S::ComputeBestOffer),
            &[A::StoreLevel],
            &[],
        )
        .rule(
            S::UpdatingClients,
            E::NeighborOffer,
            None,
            &[A::UpdateOrRemoveOffer],
            &[],
        )
        .rule(
            S::UpdatingClients,
            E::BetterHal,
            Some(S::ComputeBestOffer),
            &[],
            &[],
        )
        .rule(
            S::UpdatingClients,
            E::BetterHat,
            Some(S::ComputeBestOffer),
            &[],
            &[],
        )
        .rule(
            S::UpdatingClients,
            E::LostHal,
            Some(S::HoldingDown),
            &[A::StartHoldDownOnLostHal],
            &[],
        )
        .rule(
            S::UpdatingClients,
            E::LostHat,
            Some(S::ComputeBestOffer),
            &[],
            &[],
        )
        // a second queued Better*/Lost* recompute emits a second
        // ComputationDone, which lands here after the first one transitions
        .rule(S::UpdatingClients, E::ComputationDone, None, &[], &[])
        .rule(
            S::HoldingDown,
            E::ChangeLocalConfiguredLevel,
            Some(S::ComputeBestOffer),
            &[A::StoreLevel],
            &[],
        )
        .rule(
            S::HoldingDown,
            E::NeighborOffer,
            None,
            &[A::UpdateOrRemoveOffer],
            &[],
        )
        .rule(S::HoldingDown, E::BetterHal, None, &[], &[])
        .rule(S::HoldingDown, E::BetterHat, None, &[], &[])
        .rule(S::HoldingDown, E::LostHal, None, &[], &[])
        .rule(S::HoldingDown, E::LostHat, None, &[], &[])
        .rule(S::HoldingDown, E::ComputationDone, None, &[], &[])
        .rule(
            S::HoldingDown,
            E::HoldDownExpired,
            Some(S::ComputeBestOffer),
            &[A::PurgeOffers],
            &[],
        )
        .on_entry(S::ComputeBestOffer, &[A::LevelCompute])
        .on_entry(S::UpdatingClients, &[A::UpdateClients])
}

/// Why an offer no longer participates in level selection
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OfferRemovalReason {
    /// The adjacency's hold timer ran out
    HoldTimeExpired,
    /// The adjacency dropped for another reason
    LostNeighbor,
    /// The interface holding the offer was removed
    InterfaceRemoved,
    /// The sender marked its level as not usable for ZTP
    NotAZtpOffer,
    /// The sender advertised no level
    LevelUndefined,
    /// Cleared wholesale when a hold-down expired
    Purged,
}

impl fmt::Display for OfferRemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HoldTimeExpired => "Hold-time expired",
            Self::LostNeighbor => "Lost neighbor",
            Self::InterfaceRemoved => "Interface removed",
            Self::NotAZtpOffer => "Not a ZTP offer",
            Self::LevelUndefined => "Level undefined",
            Self::Purged => "Purged",
        })
    }
}

/// A level offer received on one interface
///
/// Exactly one is held per interface; a newer offer from the same interface
/// overwrites the previous one. Removed offers are kept (flagged) for
/// operator visibility, never deleted.
#[derive(Debug, Clone)]
pub struct Offer {
    /// The interface the offer arrived on
    pub interface: InterfaceId,
    /// That interface's name, for display
    pub interface_name: String,
    /// The offering neighbor
    pub system_id: SystemId,
    /// The level the neighbor advertised
    pub level: Option<Level>,
    /// The neighbor poisoned this offer (level learned from us)
    pub not_a_ztp_offer: bool,
    /// The adjacency state at the time the offer was received
    pub adjacency_state: LieState,
    /// No longer participates in selection
    pub removed: bool,
    /// Why, when `removed` is set
    pub removed_reason: Option<OfferRemovalReason>,
    /// Won the unrestricted (HAL) selection
    pub best: bool,
    /// Won the three-way-only (HAT) selection
    pub best_three_way: bool,
}

impl Offer {
    pub(crate) fn withdrawn(
        interface: InterfaceId,
        interface_name: String,
        system_id: SystemId,
        level: Option<Level>,
        reason: OfferRemovalReason,
    ) -> Self {
        Self {
            interface,
            interface_name,
            system_id,
            level,
            not_a_ztp_offer: false,
            adjacency_state: LieState::OneWay,
            removed: true,
            removed_reason: Some(reason),
            best: false,
            best_three_way: false,
        }
    }

    fn eligible(&self) -> bool {
        !self.removed && !self.not_a_ztp_offer && self.level.is_some()
    }
}

/// Pick the winner among `candidates`: highest level, then lowest system id
///
/// Callers filter for eligibility; every candidate has a defined level.
fn select<'a>(candidates: impl Iterator<Item = &'a Offer>) -> Option<InterfaceId> {
    candidates
        .reduce(|a, b| match a.level.cmp(&b.level) {
            Ordering::Greater => a,
            Ordering::Less => b,
            Ordering::Equal => {
                if a.system_id <= b.system_id {
                    a
                } else {
                    b
                }
            }
        })
        .map(|offer| offer.interface)
}

/// The level-determination data the ZTP actions operate on
pub(crate) struct Ztp {
    configured: LevelConfig,
    offers: FxHashMap<InterfaceId, Offer>,
    hal: Option<Level>,
    hat: Option<Level>,
    level: Option<Level>,
    /// The level the interfaces last heard about
    published: Option<Level>,
    holddown: Option<TimerToken>,
}

impl Ztp {
    pub(crate) fn new(configured: LevelConfig) -> Self {
        let level = configured.fixed_level();
        Self {
            configured,
            offers: FxHashMap::default(),
            hal: None,
            hat: None,
            level,
            published: level,
            holddown: None,
        }
    }

    /// The node's current level
    pub(crate) fn level(&self) -> Option<Level> {
        self.level
    }

    /// The current Highest Available Level
    pub(crate) fn hal(&self) -> Option<Level> {
        self.hal
    }

    /// The current Highest Adjacency-Three-Way level
    pub(crate) fn hat(&self) -> Option<Level> {
        self.hat
    }

    /// The offer most recently received on `interface`, if any
    pub(crate) fn offer(&self, interface: InterfaceId) -> Option<&Offer> {
        self.offers.get(&interface)
    }

    pub(crate) fn offers(&self) -> impl Iterator<Item = &Offer> {
        self.offers.values()
    }

    fn store_level(&mut self, data: Option<&ZtpEventData>) {
        if let Some(ZtpEventData::ConfiguredLevel(configured)) = data {
            info!(configured = ?configured, "level configuration changed");
            self.configured = *configured;
        }
    }

    fn update_or_remove_offer(&mut self, data: Option<&ZtpEventData>, ctx: &mut ZtpCtx<'_>) {
        let Some(ZtpEventData::Offer(offer)) = data else {
            return;
        };
        let mut offer = offer.clone();
        if !offer.removed {
            if offer.not_a_ztp_offer {
                offer.removed = true;
                offer.removed_reason = Some(OfferRemovalReason::NotAZtpOffer);
            } else if offer.level.is_none() {
                offer.removed = true;
                offer.removed_reason = Some(OfferRemovalReason::LevelUndefined);
            }
        }
        debug!(
            interface = %offer.interface_name,
            system = %offer.system_id,
            level = ?offer.level,
            state = ?offer.adjacency_state,
            removed = offer.removed,
            "offer updated"
        );
        self.offers.insert(offer.interface, offer);
        self.refresh_best_flags();
        self.compare_offers(ctx);
    }

    /// Re-run both selections over all offers and re-flag the winners
    fn refresh_best_flags(&mut self) {
        let best = select(self.offers.values().filter(|o| o.eligible()));
        let best_three_way = select(
            self.offers
                .values()
                .filter(|o| o.eligible() && o.adjacency_state == LieState::ThreeWay),
        );
        for offer in self.offers.values_mut() {
            offer.best = best == Some(offer.interface);
            offer.best_three_way = best_three_way == Some(offer.interface);
        }
    }

    fn flagged_level(&self, flag: impl Fn(&Offer) -> bool) -> Option<Level> {
        self.offers.values().find(|o| flag(o)).and_then(|o| o.level)
    }

    /// Compare the freshly flagged winners against the stored HAL/HAT
    ///
    /// Only pushes events; the stored values change in `level_compute`.
    fn compare_offers(&self, ctx: &mut ZtpCtx<'_>) {
        let hal = self.flagged_level(|o| o.best);
        let hat = self.flagged_level(|o| o.best_three_way);
        if hal != self.hal {
            debug!(old = ?self.hal, new = ?hal, "highest available level changed");
            ctx.push(if hal.is_some() {
                ZtpEvent::BetterHal
            } else {
                ZtpEvent::LostHal
            });
        }
        if hat != self.hat {
            debug!(old = ?self.hat, new = ?hat, "highest three-way level changed");
            ctx.push(if hat.is_some() {
                ZtpEvent::BetterHat
            } else {
                ZtpEvent::LostHat
            });
        }
    }

    fn level_compute(&mut self, ctx: &mut ZtpCtx<'_>) {
        self.hal = self.flagged_level(|o| o.best);
        self.hat = self.flagged_level(|o| o.best_three_way);
        self.level = match self.configured {
            LevelConfig::Ztp => self.hal.map(Level::below),
            fixed => fixed.fixed_level(),
        };
        debug!(hal = ?self.hal, hat = ?self.hat, level = ?self.level, "level computed");
        ctx.push(ZtpEvent::ComputationDone);
    }

    fn start_hold_down(&mut self, ctx: &mut ZtpCtx<'_>) {
        // A southbound adjacency is a live offer strictly below our level;
        // it would be orphaned by an immediate recompute
        let southbound = match self.level {
            Some(level) => self
                .offers
                .values()
                .any(|o| !o.removed && o.level.map_or(false, |l| l < level)),
            None => false,
        };
        if southbound {
            let expiry = ctx.now() + ctx.hold_down();
            info!(duration = ?ctx.hold_down(), "lost level source; holding down");
            match self.holddown {
                Some(token) => ctx.fx.timers.reset(token, expiry),
                None => {
                    self.holddown =
                        Some(ctx.fx.timers.insert(Envelope::hold_down_expired(), expiry, None));
                }
            }
        } else {
            info!("lost level source with no southbound adjacency");
            ctx.push(ZtpEvent::HoldDownExpired);
        }
    }

    fn purge_offers(&mut self) {
        for offer in self.offers.values_mut() {
            if !offer.removed {
                debug!(interface = %offer.interface_name, "purging offer");
                offer.removed = true;
                offer.removed_reason = Some(OfferRemovalReason::Purged);
            }
        }
        self.refresh_best_flags();
    }

    fn update_clients(&mut self, ctx: &mut ZtpCtx<'_>) {
        if self.level == self.published {
            return;
        }
        info!(old = ?self.published, new = ?self.level, "node level changed");
        for interface in ctx.interface_ids() {
            ctx.fx.queues.push(Envelope::Lie {
                iface: interface,
                event: LieEvent::LevelChanged,
                data: Some(LieEventData::Level(self.level)),
            });
        }
        ctx.signal(NodeEvent::LevelChanged { level: self.level });
        self.published = self.level;
    }
}

impl<'a> Handler<ZtpFsm, ZtpCtx<'a>> for Ztp {
    fn invoke(&mut self, action: ZtpAction, cause: Cause<'_, ZtpFsm>, ctx: &mut ZtpCtx<'a>) {
        match action {
            ZtpAction::StoreLevel => self.store_level(cause.data),
            ZtpAction::UpdateOrRemoveOffer => self.update_or_remove_offer(cause.data, ctx),
            ZtpAction::LevelCompute => self.level_compute(ctx),
            ZtpAction::StartHoldDownOnLostHal => self.start_hold_down(ctx),
            ZtpAction::PurgeOffers => self.purge_offers(),
            ZtpAction::UpdateClients => self.update_clients(ctx),
        }
    }
}
