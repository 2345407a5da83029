//! Synchronous runtime for the RIFT adjacency and ZTP state machines
//!
//! This crate drives the deterministic protocol core in `rift-proto` from a
//! single-threaded cooperative loop: readiness multiplexing over registered
//! I/O handles, combined with the core's timer deadlines and event queues.
//! It builds on top of rift-proto, which implements protocol logic
//! independent of any I/O; everything here runs on one thread, and no
//! callback may block.
//!
//! The entry point is the [`Scheduler`]. Transports (the wire codec and its
//! sockets are not part of this crate) implement [`Handle`] to translate
//! readiness into [`proto::Node`] calls and to flush the node's outgoing
//! LIEs and signals.

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

pub use mio;
pub use proto;
pub use proto::{InterfaceConfig, InterfaceId, LevelConfig, Node, NodeConfig, NodeEvent};

mod scheduler;
pub use scheduler::{Error, Handle, Scheduler};
