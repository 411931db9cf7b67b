//! Narrow hypervisor capability boundary.
//!
//! The pool and node logic only ever talk to these traits, so everything
//! above the libvirt adapter can run against in-memory fakes. A libvirt
//! connection must not be shared between concurrently booting nodes; the
//! `ConnectionFactory` exists so each boot task opens its own connection
//! instead of borrowing one through a lock.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::errors::ProvisionResult;

/// One row of a virtual network's DHCP lease table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub mac: String,
    pub ipaddr: String,
}

/// Opens hypervisor connections. Called once per boot task.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> ProvisionResult<Box<dyn HypervisorConnection>>;
}

/// A single hypervisor connection, owned by exactly one task.
#[async_trait]
pub trait HypervisorConnection: Send + Sync {
    /// Define a new persistent domain from its XML description.
    async fn define_domain(&self, xml: &str) -> ProvisionResult<Box<dyn DomainHandle>>;

    /// Look up a pre-existing virtual network by name.
    async fn network_by_name(&self, name: &str) -> ProvisionResult<Arc<dyn VirtualNetwork>>;
}

/// Handle to a defined domain.
#[async_trait]
pub trait DomainHandle: Send + Sync {
    async fn start(&self) -> ProvisionResult<()>;

    async fn stop(&self) -> ProvisionResult<()>;

    async fn undefine(&self) -> ProvisionResult<()>;

    /// The domain's current XML description as known to the hypervisor.
    async fn xml_desc(&self) -> ProvisionResult<String>;
}

/// A named virtual network. Lease reads are safe to share across tasks.
#[async_trait]
pub trait VirtualNetwork: Send + Sync {
    fn name(&self) -> &str;

    async fn dhcp_leases(&self) -> ProvisionResult<Vec<DhcpLease>>;
}
