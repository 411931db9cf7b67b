pub mod cli;
pub mod config;
pub mod core;

// Re-exports
pub use crate::core::errors::{ProvisionError, ProvisionResult};
pub use crate::core::hypervisor::{
    ConnectionFactory, DhcpLease, DomainHandle, HypervisorConnection, VirtualNetwork,
};
pub use crate::core::node::{Node, NodeOptions, NodePhase, NodeRole, Timeouts};
pub use crate::core::pool::{HardwarePool, NodeFailure, PoolReport};
pub use crate::core::ssh::{SshProbe, SshProbeError};
pub use crate::core::volumes::VolumeProvisioner;
