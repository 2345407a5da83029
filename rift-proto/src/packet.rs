//! In-memory contract with the (external) wire codec
//!
//! This core owns no wire format. The transport layer decodes datagrams
//! into [`LiePacket`] values and feeds them to [`crate::Node::handle_lie`];
//! outgoing LIEs are produced as [`LieOut`] field sets for the transport to
//! encode and send.

use crate::node::InterfaceId;
use crate::{Level, LinkId, PodId, SystemId};

/// The packet header shared by every RIFT packet kind
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Header {
    /// Protocol major version; a mismatch makes the packet unacceptable
    pub major_version: u16,
    /// Protocol minor version; differences are ignored
    pub minor_version: u16,
    /// The sending node
    pub sender: SystemId,
    /// The level the sender currently advertises
    pub level: Option<Level>,
}

/// A reference to a neighbor, as carried inside a LIE
///
/// A received LIE containing this node's own id and local link id here is a
/// valid reflection: the neighbor demonstrably hears us.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NeighborRef {
    /// The system id the sender believes its neighbor has
    pub originator: SystemId,
    /// The link id the sender believes its neighbor advertised
    pub link_id: LinkId,
}

/// A decoded Link Information Element
#[derive(Debug, Clone)]
pub struct LiePacket {
    /// The packet header
    pub header: Header,
    /// The sender's node name, for display only
    pub name: Option<String>,
    /// The sender's link id on this link
    pub local_link_id: LinkId,
    /// UDP port the sender floods TIEs on
    pub flood_port: u16,
    /// The sender's configured link MTU; both sides must agree
    pub link_mtu: u16,
    /// Reflection of this node, once the sender has heard us
    pub neighbor: Option<NeighborRef>,
    /// The sender's point-of-delivery tag
    pub pod: Option<PodId>,
    /// The sender's current nonce
    pub nonce: u64,
    /// Seconds without a LIE after which the sender may be declared dead
    pub hold_time: u16,
    /// The sender can only be a leaf
    pub leaf_only: bool,
    /// The sender supports leaf-to-leaf adjacencies
    pub leaf_to_leaf: bool,
    /// The sender supports flood reduction
    pub flood_reduction: bool,
    /// The advertised level must not be used for ZTP level derivation
    pub not_a_ztp_offer: bool,
    /// The receiver has been elected flood repeater by the sender
    pub you_are_flood_repeater: bool,
}

/// Field values of an outgoing LIE, ready for the transport to encode
#[derive(Debug, Clone)]
pub struct LieOut {
    /// The interface this LIE leaves through
    pub interface: InterfaceId,
    /// The packet header
    pub header: Header,
    /// This node's name
    pub name: Option<String>,
    /// This interface's link id
    pub local_link_id: LinkId,
    /// UDP port this node floods TIEs on
    pub flood_port: u16,
    /// This interface's configured MTU
    pub link_mtu: u16,
    /// Reflection of the current neighbor, if one is installed
    pub neighbor: Option<NeighborRef>,
    /// This interface's point-of-delivery tag
    pub pod: Option<PodId>,
    /// This interface's current nonce
    pub nonce: u64,
    /// The neighbor's last seen nonce, zero if none
    pub remote_nonce: u64,
    /// Hold time advertised to the neighbor, in ticks
    pub hold_time: u16,
    /// This node can only be a leaf
    pub leaf_only: bool,
    /// This node supports leaf-to-leaf adjacencies
    pub leaf_to_leaf: bool,
    /// This node supports flood reduction
    pub flood_reduction: bool,
    /// Poison reverse: set when the advertised level was learned from the
    /// receiver (see [`crate::Node`] level derivation)
    pub not_a_ztp_offer: bool,
    /// The receiver has been elected flood repeater; always false here, the
    /// flooding subsystem rewrites it
    pub you_are_flood_repeater: bool,
}
