//! Hardware pool: concurrent node creation and aggregation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::core::errors::{ProvisionError, ProvisionResult};
use crate::core::hypervisor::{ConnectionFactory, VirtualNetwork};
use crate::core::node::{Node, NodeOptions, NodeReport, NodeRole};
use crate::core::ssh::SshProbe;

/// A node that did not reach `Running`, with the originating error.
#[derive(Debug)]
pub struct NodeFailure {
    pub name: String,
    pub error: ProvisionError,
}

#[derive(Debug, Serialize)]
pub struct PoolReport {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub nodes: Vec<NodeReport>,
}

/// Owns the long-lived hypervisor connection, the virtual network and all
/// nodes created during one run.
pub struct HardwarePool {
    factory: Arc<dyn ConnectionFactory>,
    network: Arc<dyn VirtualNetwork>,
    probe: Arc<dyn SshProbe>,
    opts: NodeOptions,
    run_id: String,
    cancel: CancellationToken,
    nodes: BTreeMap<String, Node>,
}

impl HardwarePool {
    /// Open the pool-level connection and validate that the configured
    /// virtual network exists. Fatal if it does not.
    pub async fn new(
        factory: Arc<dyn ConnectionFactory>,
        network_name: &str,
        probe: Arc<dyn SshProbe>,
        opts: NodeOptions,
    ) -> ProvisionResult<Self> {
        let conn = factory.connect().await?;
        let network = conn.network_by_name(network_name).await?;
        info!(network = %network.name(), "using virtual network");

        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Ok(Self {
            factory,
            network,
            probe,
            opts,
            run_id,
            cancel: CancellationToken::new(),
            nodes: BTreeMap::new(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Token that aborts in-flight readiness waits when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Boot `masters + workers` nodes concurrently, each on its own fresh
    /// hypervisor connection. Blocks until every boot finished; successes
    /// are registered into the pool, failures are returned per node. A
    /// failing node never cancels its siblings.
    pub async fn boot_nodes(
        &mut self,
        masters: u32,
        workers: u32,
        offset: u32,
    ) -> Vec<NodeFailure> {
        let mut planned: Vec<(String, NodeRole, Vec<String>)> = Vec::new();
        for c in 0..masters {
            let index = offset + c;
            let mut tags = vec!["master".to_string()];
            if index == 0 {
                tags.push("first_master".to_string());
            }
            planned.push((
                format!("{}-master-{}", self.run_id, index),
                NodeRole::Master,
                tags,
            ));
        }
        for c in 0..workers {
            planned.push((
                format!("{}-worker-{}", self.run_id, offset + c),
                NodeRole::Worker,
                vec!["worker".to_string()],
            ));
        }

        info!(
            masters,
            workers,
            run_id = %self.run_id,
            "booting {} nodes",
            planned.len()
        );

        let mut handles: Vec<(String, JoinHandle<ProvisionResult<Node>>)> = Vec::new();
        for (name, role, tags) in planned {
            let factory = Arc::clone(&self.factory);
            let network = Arc::clone(&self.network);
            let probe = Arc::clone(&self.probe);
            let opts = self.opts.clone();
            let cancel = self.cancel.child_token();
            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                // Fresh connection per task; a shared one is not safe for
                // concurrent domain operations.
                let conn = factory.connect().await?;
                let mut node = Node::new(task_name, role, tags, conn, network, probe, opts, cancel);
                node.boot().await?;
                Ok(node)
            });
            handles.push((name, handle));
        }

        let mut failures = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(node)) => {
                    self.nodes.insert(node.name().to_string(), node);
                }
                Ok(Err(error)) => {
                    error!(node = %name, %error, "node did not become ready");
                    failures.push(NodeFailure { name, error });
                }
                Err(join_err) => {
                    error!(node = %name, error = %join_err, "boot task aborted");
                    failures.push(NodeFailure {
                        name,
                        error: ProvisionError::Hypervisor(format!(
                            "boot task aborted: {join_err}"
                        )),
                    });
                }
            }
        }
        failures
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The master tagged `first_master`, if it booted.
    pub fn first_master(&self) -> Option<&Node> {
        self.nodes.values().find(|n| n.has_tag("first_master"))
    }

    pub fn report(&self) -> PoolReport {
        PoolReport {
            run_id: self.run_id.clone(),
            created_at: Utc::now(),
            nodes: self.nodes.values().map(Node::report).collect(),
        }
    }

    /// Tear down every running node. Nodes that fail to destroy are
    /// reported and left registered.
    pub async fn destroy_all(&mut self) -> Vec<NodeFailure> {
        let mut failures = Vec::new();
        let names: Vec<String> = self.nodes.keys().cloned().collect();
        for name in names {
            let Some(mut node) = self.nodes.remove(&name) else {
                continue;
            };
            if let Err(error) = node.destroy().await {
                error!(node = %name, %error, "destroy failed");
                self.nodes.insert(name.clone(), node);
                failures.push(NodeFailure { name, error });
            }
        }
        failures
    }
}
