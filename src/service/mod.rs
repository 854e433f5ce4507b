//! Per-service replica reconciliation.
//!
//! A [`Service`] owns the declared configuration for one named application
//! component and converges the engine's actual containers for it toward the
//! desired replica count. Reconciliation is convergent, not
//! create-every-time: an existing container whose stored configuration hash
//! still matches is reused (started if stopped), one that drifted is
//! recreated in place with the same ordinal, missing ordinals are created,
//! and excess ordinals are removed highest-first.
//!
//! One-off containers (ad-hoc `run` executions) carry a distinct name
//! segment and label, never count toward the replica set, and are never
//! recreated by a later `up`.

use crate::container::{Container, ContainerName};
use crate::engine::{CreateOptions, EngineClient, EngineError, RemoveOptions, RetryPolicy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Label carrying the owning project name.
pub const LABEL_PROJECT: &str = "convoy.project";
/// Label carrying the owning service name.
pub const LABEL_SERVICE: &str = "convoy.service";
/// Label marking ad-hoc run containers.
pub const LABEL_ONE_OFF: &str = "convoy.oneoff";
/// Label storing the configuration hash the container was created from.
pub const LABEL_CONFIG_HASH: &str = "convoy.config-hash";

/// Seconds the engine gives a container to stop before killing it.
const DEFAULT_STOP_TIMEOUT: i64 = 10;

/// Service-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("service {service}: invalid port specification {spec:?}")]
    InvalidPort { service: String, spec: String },
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// How `up` treats existing containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvergePolicy {
    /// Recreate containers whose stored configuration drifted (default).
    #[default]
    Recreate,
    /// Always reuse existing containers, drift or not.
    NoRecreate,
    /// Recreate every container regardless of drift.
    ForceRecreate,
}

/// A command line, either a shell-style string or an explicit token list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    List(Vec<String>),
}

impl CommandLine {
    /// Tokens of the command. The shell form is split on whitespace; no
    /// quoting support.
    pub fn tokens(&self) -> Vec<String> {
        match self {
            CommandLine::Shell(line) => line.split_whitespace().map(str::to_string).collect(),
            CommandLine::List(tokens) => tokens.clone(),
        }
    }
}

/// Environment declarations, either a map or a `KEY=VALUE` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    Map(BTreeMap<String, String>),
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Map(BTreeMap::new())
    }
}

impl Environment {
    /// Ordered `(key, value)` pairs; list entries split once on `=`.
    pub fn pairs(&self) -> BTreeMap<String, String> {
        match self {
            Environment::Map(map) => map.clone(),
            Environment::List(entries) => entries
                .iter()
                .map(|entry| match entry.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (entry.clone(), String::new()),
                })
                .collect(),
        }
    }
}

/// Declared configuration for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub image: String,
    #[serde(default)]
    pub command: Option<CommandLine>,
    #[serde(default)]
    pub entrypoint: Option<CommandLine>,
    /// Port specs: `PRIVATE[/proto]`, `HOST:PRIVATE`, or `IP:HOST:PRIVATE`.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Volume specs: `HOST:/path[:mode]` or a bare container path.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: Environment,
    /// Dependency declarations: `SERVICE` or `SERVICE:alias`.
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

fn default_replicas() -> usize {
    1
}

impl ServiceConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: None,
            entrypoint: None,
            ports: Vec::new(),
            volumes: Vec::new(),
            environment: Environment::default(),
            links: Vec::new(),
            replicas: 1,
        }
    }

    /// Declared links as `(service, alias)` pairs; the alias defaults to
    /// the service name.
    pub fn parsed_links(&self) -> Vec<(String, String)> {
        self.links
            .iter()
            .map(|link| match link.split_once(':') {
                Some((service, alias)) => (service.to_string(), alias.to_string()),
                None => (link.clone(), link.clone()),
            })
            .collect()
    }

    /// Hash of the declared options, stored on created containers and
    /// compared on `up` to decide reuse versus recreate. Resolved link
    /// endpoints are deliberately excluded so a recreated dependency does
    /// not cascade recreation through dependents.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::json!({
            "image": self.image,
            "entrypoint": self.entrypoint.as_ref().map(CommandLine::tokens),
            "command": self.command.as_ref().map(CommandLine::tokens),
            "ports": self.ports,
            "volumes": self.volumes,
            "environment": self.environment.pairs(),
            "links": self.links,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A named, declaratively configured application component, possibly
/// replicated.
pub struct Service {
    name: String,
    project: String,
    engine: Arc<dyn EngineClient>,
    retry: RetryPolicy,
    config: ServiceConfig,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("project", &self.project)
            .field("retry", &self.retry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Service {
    pub fn new(
        project: impl Into<String>,
        name: impl Into<String>,
        config: ServiceConfig,
        engine: Arc<dyn EngineClient>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            project: project.into(),
            engine,
            retry,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Containers currently backing this service, sorted by ordinal.
    ///
    /// `stopped` includes non-running containers; `one_off` selects the
    /// ad-hoc run containers instead of the managed replica set. Membership
    /// is decided by decoding the engine name.
    pub async fn containers(&self, stopped: bool, one_off: bool) -> Result<Vec<Container>> {
        let records = self
            .engine
            .list_containers(stopped, HashMap::new())
            .await?;
        let mut containers: Vec<Container> = records
            .iter()
            .filter_map(|record| {
                Container::from_list_entry(self.engine.clone(), self.retry.clone(), record)
            })
            .filter(|container| {
                container
                    .parsed_name()
                    .is_some_and(|n| n.belongs_to(&self.project, &self.name) && n.one_off == one_off)
            })
            .collect();
        containers.sort_by_key(|c| c.parsed_name().map(|n| n.ordinal).unwrap_or(usize::MAX));
        Ok(containers)
    }

    /// Bring the replica set to `desired` containers.
    ///
    /// `links` are the already-resolved `(container_name, alias)` pairs for
    /// this service's dependencies, wired into every container created here.
    /// Returns the containers backing the service afterwards, by ordinal.
    pub async fn converge(
        &self,
        desired: usize,
        policy: ConvergePolicy,
        links: &[(String, String)],
    ) -> Result<Vec<Container>> {
        let mut existing: BTreeMap<usize, Container> = BTreeMap::new();
        for container in self.containers(true, false).await? {
            if let Some(parsed) = container.parsed_name() {
                existing.insert(parsed.ordinal, container);
            }
        }

        debug!(
            service = %self.name,
            existing = existing.len(),
            desired,
            ?policy,
            "reconciling replica set"
        );

        let current_hash = self.config.content_hash();
        let mut converged = Vec::new();

        for ordinal in 1..=desired {
            match existing.remove(&ordinal) {
                Some(mut container) => {
                    let recreate = match policy {
                        ConvergePolicy::ForceRecreate => true,
                        ConvergePolicy::NoRecreate => false,
                        ConvergePolicy::Recreate => {
                            container.config_hash().await?.as_deref()
                                != Some(current_hash.as_str())
                        }
                    };
                    if recreate {
                        info!(
                            service = %self.name,
                            container = %container.name(),
                            "configuration changed, recreating"
                        );
                        self.discard(&container).await?;
                        converged.push(self.create_and_start(ordinal, links).await?);
                    } else {
                        if !container.is_running().await? {
                            info!(container = %container.name(), "starting existing container");
                            container.start().await?;
                        }
                        converged.push(container);
                    }
                }
                None => converged.push(self.create_and_start(ordinal, links).await?),
            }
        }

        // Excess replicas go highest ordinal first.
        for (_, container) in existing.iter().rev() {
            info!(container = %container.name(), "scaling down, removing");
            self.discard(container).await?;
        }

        Ok(converged)
    }

    /// Create exactly one ad-hoc container, start it, and hand it back for
    /// the caller to wait on and reap. Never counts toward the replica set.
    pub async fn run_one_off(
        &self,
        command: &[String],
        links: &[(String, String)],
    ) -> Result<Container> {
        let next = self
            .containers(true, true)
            .await?
            .iter()
            .filter_map(Container::parsed_name)
            .map(|n| n.ordinal)
            .max()
            .unwrap_or(0)
            + 1;
        let name = ContainerName::one_off(&self.project, &self.name, next);

        let mut options = self.create_options(true, links)?;
        if !command.is_empty() {
            options.cmd = Some(command.to_vec());
        }

        info!(container = %name, "running one-off container");
        let container = Container::create(
            self.engine.clone(),
            self.retry.clone(),
            &name,
            &options,
        )
        .await?;
        container.start().await?;
        Ok(container)
    }

    /// Start every stopped replica.
    pub async fn start(&self) -> Result<()> {
        for mut container in self.containers(true, false).await? {
            if !container.is_running().await? {
                container.start().await?;
            }
        }
        Ok(())
    }

    /// Stop every running replica.
    pub async fn stop(&self) -> Result<()> {
        for container in self.containers(false, false).await? {
            container.stop(Some(DEFAULT_STOP_TIMEOUT)).await?;
        }
        Ok(())
    }

    /// Kill every running replica.
    pub async fn kill(&self) -> Result<()> {
        for container in self.containers(false, false).await? {
            container.kill(None).await?;
        }
        Ok(())
    }

    /// Restart every running replica.
    pub async fn restart(&self) -> Result<()> {
        for container in self.containers(false, false).await? {
            container.restart().await?;
        }
        Ok(())
    }

    /// Remove stopped containers; `one_off` selects the ad-hoc set.
    pub async fn remove_stopped(&self, one_off: bool) -> Result<()> {
        for mut container in self.containers(true, one_off).await? {
            if !container.is_running().await? {
                info!(container = %container.name(), "removing stopped container");
                container
                    .remove(RemoveOptions {
                        force: false,
                        volumes: true,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn create_and_start(
        &self,
        ordinal: usize,
        links: &[(String, String)],
    ) -> Result<Container> {
        let name = ContainerName::new(&self.project, &self.name, ordinal);
        let options = self.create_options(false, links)?;
        info!(container = %name, image = %self.config.image, "creating container");
        let container = Container::create(
            self.engine.clone(),
            self.retry.clone(),
            &name,
            &options,
        )
        .await?;
        container.start().await?;
        Ok(container)
    }

    /// Stop (tolerating already-stopped) and remove one container.
    async fn discard(&self, container: &Container) -> Result<()> {
        if let Err(err) = container.stop(Some(DEFAULT_STOP_TIMEOUT)).await {
            warn!(container = %container.name(), "stop before removal failed: {err}");
        }
        container
            .remove(RemoveOptions {
                force: true,
                volumes: true,
            })
            .await?;
        Ok(())
    }

    /// Engine create options for one container of this service.
    fn create_options(&self, one_off: bool, links: &[(String, String)]) -> Result<CreateOptions> {
        let mut options = CreateOptions {
            image: self.config.image.clone(),
            cmd: self.config.command.as_ref().map(CommandLine::tokens),
            entrypoint: self.config.entrypoint.as_ref().map(CommandLine::tokens),
            env: self
                .config
                .environment
                .pairs()
                .into_iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
            binds: self
                .config
                .volumes
                .iter()
                .filter(|spec| spec.contains(':'))
                .cloned()
                .collect(),
            links: links
                .iter()
                .map(|(container, alias)| format!("{container}:{alias}"))
                .collect(),
            ..Default::default()
        };

        for spec in &self.config.ports {
            let (private, binding) = self.parse_port(spec)?;
            options.exposed_ports.push(private.clone());
            if let Some(binding) = binding {
                options.port_bindings.insert(private, binding);
            }
        }

        options
            .labels
            .insert(LABEL_PROJECT.to_string(), self.project.clone());
        options
            .labels
            .insert(LABEL_SERVICE.to_string(), self.name.clone());
        if one_off {
            options
                .labels
                .insert(LABEL_ONE_OFF.to_string(), "true".to_string());
        } else {
            options.labels.insert(
                LABEL_CONFIG_HASH.to_string(),
                self.config.content_hash(),
            );
        }

        Ok(options)
    }

    /// Split a port spec into the private `port/proto` key and an optional
    /// `(host_ip, host_port)` binding.
    fn parse_port(&self, spec: &str) -> Result<(String, Option<(String, String)>)> {
        let invalid = || ServiceError::InvalidPort {
            service: self.name.clone(),
            spec: spec.to_string(),
        };

        let with_proto = |port: &str| {
            if port.contains('/') {
                port.to_string()
            } else {
                format!("{port}/tcp")
            }
        };

        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [private] if !private.is_empty() => Ok((with_proto(private), None)),
            [host, private] if !host.is_empty() && !private.is_empty() => Ok((
                with_proto(private),
                Some(("0.0.0.0".to_string(), host.to_string())),
            )),
            [ip, host, private] if !ip.is_empty() && !host.is_empty() && !private.is_empty() => {
                Ok((
                    with_proto(private),
                    Some((ip.to_string(), host.to_string())),
                ))
            }
            _ => Err(invalid()),
        }
    }
}
