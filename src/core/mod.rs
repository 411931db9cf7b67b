pub mod domain_xml;
pub mod errors;
pub mod hypervisor;
#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod node;
pub mod pool;
pub mod retry;
pub mod ssh;
pub mod volumes;

pub use self::errors::{ProvisionError, ProvisionResult};
pub use self::node::{Node, NodeOptions, NodePhase, NodeRole, Timeouts};
pub use self::pool::{HardwarePool, NodeFailure};
