//! Manager: node registry and round-robin assignment.
//!
//! The manager is the one process clients talk to first. It keeps the set of
//! registered processing nodes and hands them out in strict round-robin
//! order:
//!
//! - [`NodeRegistry`]: append-only node list plus assignment cursor, all
//!   state behind one lock
//! - [`RegistryServiceImpl`]: the gRPC surface (`RegisterNode`,
//!   `AssignNode`)
//! - [`ManagerNode`]: process wiring, runs the tonic server until shutdown
//!
//! Registration is unconditional — no liveness check, no deregistration; a
//! node registered once is eligible for assignment for the lifetime of the
//! manager process.

pub mod registry;
pub mod service;

pub use registry::{NodeEndpoint, NodeRegistry};
pub use service::{ManagerNode, RegistryServiceImpl};
