use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::config::Node;
use crate::error::Result;
use crate::types::Labels;

pub mod docker;
pub use docker::DockerConnector;

/// One event delivered by the runtime's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Object type, e.g. `container`.
    pub kind: String,
    pub status: String,
    pub id: String,
}

/// The parts of an inspected container the daemon cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub name: String,
    pub labels: Labels,
}

/// Client for one container runtime host.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Ids of the currently running containers.
    async fn list_running(&self) -> Result<Vec<String>>;

    async fn inspect(&self, id: &str) -> Result<ContainerDetails>;

    /// Subscribe to the event stream.  The stream is infinite until the
    /// transport fails and cannot be restarted; call again for a new one.
    fn events(&self, statuses: &[String]) -> BoxStream<'static, Result<RuntimeEvent>>;
}

/// Builds a runtime client for a node.  Called from inside the node's
/// worker so a broken endpoint only takes that worker down.
pub trait RuntimeConnector: Send + Sync {
    fn connect(&self, node: &Node) -> Result<Arc<dyn ContainerRuntime>>;
}
