use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("hypervisor connection to {uri} failed: {reason}")]
    Connection { uri: String, reason: String },

    #[error("virtual network {name} not found")]
    NetworkNotFound { name: String },

    #[error("hypervisor operation failed: {0}")]
    Hypervisor(String),

    #[error("required tool not found: {tool}")]
    ToolMissing { tool: String },

    #[error("{tool} failed with status {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: i32,
        stderr: String,
    },

    #[error("node {node}: no DHCP lease after {waited:?}")]
    LeaseTimeout { node: String, waited: Duration },

    #[error("node {node}: ssh on {ip} not reachable after {waited:?}")]
    SshTimeout {
        node: String,
        ip: String,
        waited: Duration,
    },

    #[error("node {node}: {operation} is invalid in phase {phase}")]
    InvalidState {
        node: String,
        operation: &'static str,
        phase: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Result type alias for convenience
pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[cfg(feature = "libvirt")]
impl From<virt::error::Error> for ProvisionError {
    fn from(error: virt::error::Error) -> Self {
        ProvisionError::Hypervisor(error.to_string())
    }
}
