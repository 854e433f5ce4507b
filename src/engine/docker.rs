//! Docker/Podman-backed engine client.
//!
//! Implements [`EngineClient`] over the bollard API. Engine records are
//! passed through as raw JSON so the rest of the crate stays independent of
//! the bollard model types.

use crate::engine::{
    ByteStream, CreateOptions, EngineClient, EngineError, LogsOptions, RemoveOptions, Result,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{HostConfig, PortBinding};
use futures::stream::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Engine client backed by a Docker or Podman daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Arc<Docker>,
}

impl DockerEngine {
    /// Connect to the local daemon (Unix socket, named pipe, or
    /// `DOCKER_HOST`) and verify the connection with a ping.
    ///
    /// # Errors
    ///
    /// Returns an error if no daemon is reachable.
    pub async fn connect() -> Result<Self> {
        debug!("connecting to container engine via local defaults");
        let docker = Docker::connect_with_local_defaults().map_err(classify)?;
        docker.ping().await.map_err(classify)?;
        info!("connected to container engine");
        Ok(Self {
            docker: Arc::new(docker),
        })
    }
}

/// Classify a bollard error into the convoy taxonomy: 404 is not-found,
/// other 4xx are permanent rejections, everything else (5xx, transport,
/// timeouts) is transient.
fn classify(err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => EngineError::NotFound(message),
            400..=499 => EngineError::Invalid(message),
            _ => EngineError::Api(message),
        },
        other => EngineError::Api(other.to_string()),
    }
}

fn to_raw<T: serde::Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| EngineError::Api(format!("unencodable engine payload: {e}")))
}

#[async_trait]
impl EngineClient for DockerEngine {
    async fn list_containers(
        &self,
        all: bool,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<Value>> {
        let summaries = self
            .docker
            .list_containers(Some(bollard::container::ListContainersOptions {
                all,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(classify)?;
        summaries.into_iter().map(to_raw).collect()
    }

    async fn inspect_container(&self, id: &str) -> Result<Value> {
        let inspect = self
            .docker
            .inspect_container(id, None::<bollard::container::InspectContainerOptions>)
            .await
            .map_err(classify)?;
        to_raw(inspect)
    }

    async fn create_container(&self, name: &str, options: &CreateOptions) -> Result<String> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = options
            .exposed_ports
            .iter()
            .map(|port| (port.clone(), HashMap::new()))
            .collect();

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = options
            .port_bindings
            .iter()
            .map(|(port, (host_ip, host_port))| {
                (
                    port.clone(),
                    Some(vec![PortBinding {
                        host_ip: Some(host_ip.clone()),
                        host_port: Some(host_port.clone()),
                    }]),
                )
            })
            .collect();

        let host_config = HostConfig {
            binds: (!options.binds.is_empty()).then(|| options.binds.clone()),
            links: (!options.links.is_empty()).then(|| options.links.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        };

        let config = bollard::container::Config {
            image: Some(options.image.clone()),
            cmd: options.cmd.clone(),
            entrypoint: options.entrypoint.clone(),
            env: (!options.env.is_empty()).then(|| options.env.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            labels: (!options.labels.is_empty()).then(|| options.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        debug!(container = name, image = %options.image, "creating container");
        let response = self
            .docker
            .create_container(
                Some(bollard::container::CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(classify)?;
        info!(container = name, id = %response.id, "created container");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<bollard::container::StartContainerOptions<String>>)
            .await
            .map_err(classify)
    }

    async fn stop_container(&self, id: &str, timeout: Option<i64>) -> Result<()> {
        self.docker
            .stop_container(
                id,
                timeout.map(|t| bollard::container::StopContainerOptions { t }),
            )
            .await
            .map_err(classify)
    }

    async fn kill_container(&self, id: &str, signal: Option<&str>) -> Result<()> {
        self.docker
            .kill_container(
                id,
                signal.map(|signal| bollard::container::KillContainerOptions { signal }),
            )
            .await
            .map_err(classify)
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        self.docker
            .restart_container(id, None::<bollard::container::RestartContainerOptions>)
            .await
            .map_err(classify)
    }

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(bollard::container::RemoveContainerOptions {
                    force: options.force,
                    v: options.volumes,
                    ..Default::default()
                }),
            )
            .await
            .map_err(classify)
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<bollard::container::WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error; it is still a
            // successful wait from the caller's point of view.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(classify(err)),
            None => Err(EngineError::Api(format!(
                "wait stream for {id} ended without a status"
            ))),
        }
    }

    async fn logs(&self, id: &str, options: LogsOptions) -> Result<ByteStream> {
        let stream = self.docker.logs(
            id,
            Some(bollard::container::LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: options.follow,
                timestamps: options.timestamps,
                tail: options
                    .tail
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "all".to_string()),
                ..Default::default()
            }),
        );
        Ok(Box::pin(stream.map(|item| {
            item.map(|log| log.into_bytes().to_vec()).map_err(classify)
        })))
    }

    async fn attach(&self, id: &str) -> Result<ByteStream> {
        let results = self
            .docker
            .attach_container(
                id,
                Some(bollard::container::AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(classify)?;
        Ok(Box::pin(results.output.map(|item| {
            item.map(|log| log.into_bytes().to_vec()).map_err(classify)
        })))
    }
}
