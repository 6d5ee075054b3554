use super::{ContainerDetails, ContainerRuntime, RuntimeConnector, RuntimeEvent};
use crate::config::Node;
use crate::error::{Error, Result};
use crate::types::Labels;
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::errors::Error as DockerError;
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::future;
use futures_util::stream::{BoxStream, StreamExt};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// Connects to remote Docker engines over mutual TLS.
pub struct DockerConnector;

impl RuntimeConnector for DockerConnector {
    fn connect(&self, node: &Node) -> Result<Arc<dyn ContainerRuntime>> {
        let addr = format!("https://{}:{}", node.id, node.port);
        debug!("Connecting to Docker engine at {}", addr);
        let docker = Docker::connect_with_ssl(
            &addr,
            &node.tls.key,
            &node.tls.crt,
            &node.tls.ca,
            node.timeout.as_secs(),
            API_DEFAULT_VERSION,
        )?;
        Ok(Arc::new(DockerRuntime { docker }))
    }
}

pub struct DockerRuntime {
    docker: Docker,
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<String>> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails> {
        let detail = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let name = detail
            .name
            .or(detail.id)
            .unwrap_or_else(|| id.to_string())
            .trim_start_matches('/')
            .to_string();
        let labels: Labels = detail
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default()
            .into_iter()
            .collect();

        Ok(ContainerDetails { name, labels })
    }

    fn events(&self, statuses: &[String]) -> BoxStream<'static, Result<RuntimeEvent>> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert("event".to_string(), statuses.to_vec());
        let opts = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        self.docker
            .events(Some(opts))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(event) => {
                        let kind = event.typ.map(|t| t.to_string()).unwrap_or_default();
                        let status = event.action.unwrap_or_default();
                        let id = event.actor.and_then(|a| a.id).unwrap_or_default();
                        if id.is_empty() {
                            None
                        } else {
                            Some(Ok(RuntimeEvent { kind, status, id }))
                        }
                    }
                    // Unparseable chunks are dropped, the stream carries on.
                    Err(DockerError::JsonDataError { .. }) | Err(DockerError::JsonSerdeError { .. }) => None,
                    Err(e) => Some(Err(Error::from(e))),
                })
            })
            .boxed()
    }
}
