//! Libvirt implementation of the hypervisor boundary.
//!
//! Thin adapter: every method maps to one libvirt call and converts the
//! error. No libvirt type crosses this module's boundary.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::network::Network;

use crate::core::errors::{ProvisionError, ProvisionResult};
use crate::core::hypervisor::{
    ConnectionFactory, DhcpLease, DomainHandle, HypervisorConnection, VirtualNetwork,
};

/// Opens a fresh libvirt connection per call.
pub struct LibvirtFactory {
    uri: String,
}

impl LibvirtFactory {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl ConnectionFactory for LibvirtFactory {
    async fn connect(&self) -> ProvisionResult<Box<dyn HypervisorConnection>> {
        let conn = Connect::open(&self.uri).map_err(|e| ProvisionError::Connection {
            uri: self.uri.clone(),
            reason: e.to_string(),
        })?;
        debug!(uri = %self.uri, "opened libvirt connection");
        Ok(Box::new(LibvirtConnection { conn }))
    }
}

pub struct LibvirtConnection {
    conn: Connect,
}

#[async_trait]
impl HypervisorConnection for LibvirtConnection {
    async fn define_domain(&self, xml: &str) -> ProvisionResult<Box<dyn DomainHandle>> {
        let domain = Domain::define_xml(&self.conn, xml)?;
        info!(domain = %domain.get_name().unwrap_or_default(), "defined domain");
        Ok(Box::new(LibvirtDomain { domain }))
    }

    async fn network_by_name(&self, name: &str) -> ProvisionResult<Arc<dyn VirtualNetwork>> {
        let network =
            Network::lookup_by_name(&self.conn, name).map_err(|_| ProvisionError::NetworkNotFound {
                name: name.to_string(),
            })?;
        Ok(Arc::new(LibvirtNetwork {
            name: name.to_string(),
            network,
        }))
    }
}

pub struct LibvirtDomain {
    domain: Domain,
}

#[async_trait]
impl DomainHandle for LibvirtDomain {
    async fn start(&self) -> ProvisionResult<()> {
        self.domain.create()?;
        Ok(())
    }

    async fn stop(&self) -> ProvisionResult<()> {
        self.domain.destroy()?;
        Ok(())
    }

    async fn undefine(&self) -> ProvisionResult<()> {
        self.domain.undefine()?;
        Ok(())
    }

    async fn xml_desc(&self) -> ProvisionResult<String> {
        Ok(self.domain.get_xml_desc(0)?)
    }
}

pub struct LibvirtNetwork {
    name: String,
    network: Network,
}

#[async_trait]
impl VirtualNetwork for LibvirtNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dhcp_leases(&self) -> ProvisionResult<Vec<DhcpLease>> {
        let leases = self.network.get_dhcp_leases()?;
        Ok(leases
            .into_iter()
            .map(|l| DhcpLease {
                mac: l.mac,
                ipaddr: l.ipaddr,
            })
            .collect())
    }
}
