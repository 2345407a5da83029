use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::{Level, LinkId, PodId, SystemId, TOP_OF_FABRIC_LEVEL};

/// How a node's level is determined
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LevelConfig {
    /// Derive the level automatically from received ZTP offers
    Ztp,
    /// Pin the level to a fixed value; disables ZTP derivation
    Value(Level),
    /// Force leaf behavior (level 0, southbound adjacencies only)
    Leaf,
    /// Force top-of-fabric behavior (the highest level)
    TopOfFabric,
}

impl LevelConfig {
    /// The level this configuration pins, if it pins one
    pub fn fixed_level(self) -> Option<Level> {
        match self {
            Self::Ztp => None,
            Self::Value(level) => Some(level),
            Self::Leaf => Some(crate::LEAF_LEVEL),
            Self::TopOfFabric => Some(TOP_OF_FABRIC_LEVEL),
        }
    }
}

/// Parameters governing one node's adjacency and ZTP behavior
///
/// Default values follow the protocol defaults: LIEs are sent every second,
/// a neighbor is declared dead after three missed intervals, and losing the
/// level source is held down for three seconds before recomputing.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub(crate) system_id: SystemId,
    pub(crate) name: String,
    pub(crate) level: LevelConfig,
    pub(crate) leaf_to_leaf: bool,
    pub(crate) lie_interval: Duration,
    pub(crate) default_hold_time: u16,
    pub(crate) advertised_hold_time: u16,
    pub(crate) hold_down: Duration,
    pub(crate) history_capacity: usize,
}

impl NodeConfig {
    /// Create a configuration for the node identified by `system_id`
    pub fn new(system_id: SystemId, name: impl Into<String>) -> Self {
        Self {
            system_id,
            name: name.into(),
            level: LevelConfig::Ztp,
            leaf_to_leaf: false,
            lie_interval: Duration::from_secs(1),
            default_hold_time: 3,
            advertised_hold_time: 3,
            hold_down: Duration::from_secs(3),
            history_capacity: 32,
        }
    }

    /// How this node's level is determined
    pub fn level(&mut self, level: LevelConfig) -> &mut Self {
        self.level = level;
        self
    }

    /// Whether this node supports leaf-to-leaf adjacencies
    ///
    /// Only meaningful on leaves; both sides must advertise support.
    pub fn leaf_to_leaf(&mut self, enabled: bool) -> &mut Self {
        self.leaf_to_leaf = enabled;
        self
    }

    /// Interval between outgoing LIEs, which is also the hold-timer tick
    pub fn lie_interval(&mut self, interval: Duration) -> &mut Self {
        self.lie_interval = interval;
        self
    }

    /// Hold time assumed for neighbors that do not advertise one, in ticks
    pub fn default_hold_time(&mut self, ticks: u16) -> &mut Self {
        self.default_hold_time = ticks;
        self
    }

    /// Hold time advertised to neighbors in outgoing LIEs, in ticks
    pub fn advertised_hold_time(&mut self, ticks: u16) -> &mut Self {
        self.advertised_hold_time = ticks;
        self
    }

    /// How long to keep the derived level after losing its source while a
    /// southbound adjacency still depends on it
    pub fn hold_down(&mut self, duration: Duration) -> &mut Self {
        self.hold_down = duration;
        self
    }

    /// Number of transition records each state machine retains
    pub fn history_capacity(&mut self, records: usize) -> &mut Self {
        self.history_capacity = records;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !self.system_id.is_valid() {
            return Err(ConfigError::InvalidSystemId);
        }
        if let Some(level) = self.level.fixed_level() {
            if level > TOP_OF_FABRIC_LEVEL {
                return Err(ConfigError::LevelOutOfRange(level));
            }
        }
        if self.lie_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.default_hold_time == 0 || self.advertised_hold_time == 0 {
            return Err(ConfigError::ZeroHoldTime);
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::ZeroHistory);
        }
        Ok(())
    }
}

/// Parameters for one point-to-point interface
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub(crate) name: String,
    pub(crate) link_id: LinkId,
    pub(crate) metric: u32,
    pub(crate) mtu: u16,
    pub(crate) pod: Option<PodId>,
    pub(crate) flood_port: u16,
    pub(crate) rx_multicast: Option<SocketAddr>,
    pub(crate) tx_multicast: Option<SocketAddr>,
}

impl InterfaceConfig {
    /// Create a configuration for the interface named `name`
    ///
    /// `link_id` must be unique among this node's interfaces.
    pub fn new(name: impl Into<String>, link_id: LinkId) -> Self {
        Self {
            name: name.into(),
            link_id,
            metric: 1,
            mtu: 1400,
            pod: None,
            flood_port: 0,
            rx_multicast: None,
            tx_multicast: None,
        }
    }

    /// Routing metric of this link; not interpreted by the adjacency core
    pub fn metric(&mut self, metric: u32) -> &mut Self {
        self.metric = metric;
        self
    }

    /// Link MTU; a neighbor advertising a different MTU is rejected
    pub fn mtu(&mut self, mtu: u16) -> &mut Self {
        self.mtu = mtu;
        self
    }

    /// Point-of-delivery tag advertised on this interface
    pub fn pod(&mut self, pod: PodId) -> &mut Self {
        self.pod = Some(pod);
        self
    }

    /// TIE flooding port advertised in outgoing LIEs
    pub fn flood_port(&mut self, port: u16) -> &mut Self {
        self.flood_port = port;
        self
    }

    /// Multicast group this interface listens on; passed through to the
    /// transport layer unmodified
    pub fn rx_multicast(&mut self, addr: SocketAddr) -> &mut Self {
        self.rx_multicast = Some(addr);
        self
    }

    /// Multicast group this interface sends to; passed through to the
    /// transport layer unmodified
    pub fn tx_multicast(&mut self, addr: SocketAddr) -> &mut Self {
        self.tx_multicast = Some(addr);
        self
    }

    /// The interface name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The local link id advertised in outgoing LIEs
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// The configured routing metric
    pub fn get_metric(&self) -> u32 {
        self.metric
    }

    /// The configured link MTU
    pub fn get_mtu(&self) -> u16 {
        self.mtu
    }

    /// The configured point-of-delivery tag, if any
    pub fn get_pod(&self) -> Option<PodId> {
        self.pod
    }

    /// The advertised TIE flooding port
    pub fn get_flood_port(&self) -> u16 {
        self.flood_port
    }

    /// The receive multicast group handed through to the transport
    pub fn get_rx_multicast(&self) -> Option<SocketAddr> {
        self.rx_multicast
    }

    /// The send multicast group handed through to the transport
    pub fn get_tx_multicast(&self) -> Option<SocketAddr> {
        self.tx_multicast
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyInterfaceName);
        }
        if self.mtu == 0 {
            return Err(ConfigError::ZeroMtu);
        }
        Ok(())
    }
}

/// Errors in node or interface parameters
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// The system id is the reserved invalid value
    #[error("system id 0 is reserved")]
    InvalidSystemId,
    /// The configured level exceeds the top-of-fabric level
    #[error("level {0} exceeds the top-of-fabric level")]
    LevelOutOfRange(Level),
    /// The LIE interval must be nonzero
    #[error("LIE interval must be nonzero")]
    ZeroInterval,
    /// Hold times are expressed in ticks and must be nonzero
    #[error("hold time must be at least one tick")]
    ZeroHoldTime,
    /// At least one transition record must be retained
    #[error("history capacity must be nonzero")]
    ZeroHistory,
    /// Interfaces must be named
    #[error("interface name must be nonempty")]
    EmptyInterfaceName,
    /// The interface MTU must be nonzero
    #[error("interface MTU must be nonzero")]
    ZeroMtu,
    /// Another interface on this node already uses the link id
    #[error("link id {0} already in use")]
    DuplicateLinkId(LinkId),
    /// Another interface on this node already uses the name
    #[error("interface name {0:?} already in use")]
    DuplicateInterfaceName(String),
}
