//! Lazily-inspected view over one engine-reported container.
//!
//! A [`Container`] is an identity (the engine-assigned id, immutable once
//! constructed) plus a raw state record. The record starts out partial when
//! the view is built from a list entry and transparently upgrades to the
//! full inspection payload on first access to any state-derived field. The
//! two states are an explicit [`Inspection`] variant rather than a mutable
//! flag so the transition is a single, obvious place.
//!
//! Mutating operations delegate to the engine client: start, stop, kill
//! and remove through the retry policy, restart and wait directly (restart
//! may legitimately race a mid-transition container, and wait blocks rather
//! than failing transiently). None of them refresh the cached record;
//! callers [`refresh`](Container::refresh) to observe post-operation state.

mod name;

pub use name::ContainerName;

use crate::engine::{
    ByteStream, CreateOptions, EngineClient, LogsOptions, RemoveOptions, Result, RetryPolicy,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Number of id characters shown in human-readable output.
const SHORT_ID_LEN: usize = 10;

/// A volume binding as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Path inside the container.
    pub path: String,
    /// `rw`, `ro`, or empty when the engine reports no read-write metadata.
    pub mode: String,
    /// Host source path.
    pub host: String,
}

/// Raw state, either the engine's partial list record or the full
/// inspection payload.
#[derive(Debug, Clone)]
enum Inspection {
    Partial(Value),
    Full(Value),
}

/// View over one remote container.
#[derive(Clone)]
pub struct Container {
    engine: Arc<dyn EngineClient>,
    retry: RetryPolicy,
    id: String,
    state: Inspection,
}

impl Container {
    /// Build a partial view from one entry of the engine's list payload.
    ///
    /// Keeps only id, image, and the name with exactly two path segments
    /// (link aliases show up as extra three-segment names). Returns `None`
    /// for records without an id.
    pub fn from_list_entry(
        engine: Arc<dyn EngineClient>,
        retry: RetryPolicy,
        record: &Value,
    ) -> Option<Self> {
        let id = record.get("Id")?.as_str()?.to_string();
        let mut partial = serde_json::Map::new();
        partial.insert("Id".to_string(), Value::String(id.clone()));
        if let Some(image) = record.get("Image").cloned() {
            partial.insert("Image".to_string(), image);
        }
        if let Some(names) = record.get("Names").and_then(Value::as_array) {
            for raw in names.iter().filter_map(Value::as_str) {
                if raw.split('/').count() == 2 {
                    partial.insert("Name".to_string(), Value::String(raw.to_string()));
                }
            }
        }
        Some(Self {
            engine,
            retry,
            id,
            state: Inspection::Partial(Value::Object(partial)),
        })
    }

    /// Build a fully-inspected view from a container id.
    pub async fn from_id(
        engine: Arc<dyn EngineClient>,
        retry: RetryPolicy,
        id: &str,
    ) -> Result<Self> {
        let record = engine.inspect_container(id).await?;
        Ok(Self {
            engine,
            retry,
            id: id.to_string(),
            state: Inspection::Full(record),
        })
    }

    /// Create a container on the engine and return its view.
    ///
    /// The engine's create call returns only an id; one inspect populates
    /// the initial state.
    pub async fn create(
        engine: Arc<dyn EngineClient>,
        retry: RetryPolicy,
        name: &ContainerName,
        options: &CreateOptions,
    ) -> Result<Self> {
        let id = engine.create_container(&name.to_string(), options).await?;
        debug!(container = %name, id = %id, "created container");
        Self::from_id(engine, retry, &id).await
    }

    /// The engine-assigned id. Never changes after construction.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// First ten characters of the id. Display only, never used for
    /// lookup or equality.
    pub fn short_id(&self) -> &str {
        self.id.get(..SHORT_ID_LEN).unwrap_or(&self.id)
    }

    /// The declared name, leading slash stripped. Empty for records the
    /// engine reported without a name.
    pub fn name(&self) -> String {
        self.record()
            .get("Name")
            .and_then(Value::as_str)
            .map(|n| n.strip_prefix('/').unwrap_or(n).to_string())
            .unwrap_or_default()
    }

    /// The structured key decoded from the declared name, if it follows the
    /// convoy convention.
    pub fn parsed_name(&self) -> Option<ContainerName> {
        ContainerName::parse(&self.name())
    }

    /// The name with the project prefix stripped, e.g. `db_1`.
    pub fn name_without_project(&self) -> String {
        self.parsed_name()
            .map(|n| n.without_project())
            .unwrap_or_else(|| self.name())
    }

    /// The image reference the container was created from.
    pub fn image(&self) -> String {
        self.record()
            .get("Image")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn record(&self) -> &Value {
        match &self.state {
            Inspection::Partial(record) | Inspection::Full(record) => record,
        }
    }

    /// Upgrade a partial record to the full inspection payload. Idempotent;
    /// at most one inspect per view.
    async fn ensure_inspected(&mut self) -> Result<()> {
        if let Inspection::Partial(_) = self.state {
            debug!(id = %self.short_id(), "inspecting partially-known container");
            let record = self.engine.inspect_container(&self.id).await?;
            self.state = Inspection::Full(record);
        }
        Ok(())
    }

    /// Re-fetch the full inspection record, discarding cached state.
    pub async fn refresh(&mut self) -> Result<()> {
        let record = self.engine.inspect_container(&self.id).await?;
        self.state = Inspection::Full(record);
        Ok(())
    }

    /// Look up a dot-separated path into the raw state, inspecting on
    /// demand first. A missing segment yields `None`, never an error.
    pub async fn get(&mut self, key: &str) -> Result<Option<Value>> {
        self.ensure_inspected().await?;
        let mut current = self.record();
        for segment in key.split('.') {
            match current.get(segment) {
                Some(value) => current = value,
                None => return Ok(None),
            }
        }
        Ok(Some(current.clone()))
    }

    /// Whether the engine reports the container running.
    pub async fn is_running(&mut self) -> Result<bool> {
        Ok(self
            .get("State.Running")
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// The exit code of a stopped container.
    pub async fn exit_code(&mut self) -> Result<i64> {
        Ok(self
            .get("State.ExitCode")
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }

    /// `Up` for a running container, `Exit <code>` otherwise.
    pub async fn human_readable_state(&mut self) -> Result<String> {
        if self.is_running().await? {
            Ok("Up".to_string())
        } else {
            Ok(format!("Exit {}", self.exit_code().await?))
        }
    }

    /// Entrypoint tokens followed by command tokens, space-joined.
    pub async fn human_readable_command(&mut self) -> Result<String> {
        let mut tokens = Vec::new();
        for key in ["Config.Entrypoint", "Config.Cmd"] {
            if let Some(Value::Array(items)) = self.get(key).await? {
                tokens.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
            }
        }
        Ok(tokens.join(" "))
    }

    /// The engine's port map, private `port/protocol` to host bindings.
    pub async fn ports(&mut self) -> Result<serde_json::Map<String, Value>> {
        Ok(self
            .get("NetworkSettings.Ports")
            .await?
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default())
    }

    /// Each private port rendered `host_ip:host_port->private` when a host
    /// mapping exists, else just the private port. Sorted by private port.
    pub async fn human_readable_ports(&mut self) -> Result<String> {
        let ports = self.ports().await?;
        let mut keys: Vec<&String> = ports.keys().collect();
        keys.sort();
        let rendered: Vec<String> = keys
            .into_iter()
            .map(|private| match first_binding(&ports[private]) {
                Some((ip, port)) => format!("{ip}:{port}->{private}"),
                None => private.clone(),
            })
            .collect();
        Ok(rendered.join(", "))
    }

    /// The `host_ip:host_port` binding for a declared private port, or
    /// `None` when the port is unmapped or undeclared.
    pub async fn get_local_port(&mut self, port: u16, protocol: &str) -> Result<Option<String>> {
        let ports = self.ports().await?;
        Ok(ports
            .get(&format!("{port}/{protocol}"))
            .and_then(first_binding)
            .map(|(ip, host_port)| format!("{ip}:{host_port}")))
    }

    /// Environment variables, split once on the first `=`.
    pub async fn environment(&mut self) -> Result<HashMap<String, String>> {
        let mut env = HashMap::new();
        if let Some(Value::Array(declarations)) = self.get("Config.Env").await? {
            for declaration in declarations.iter().filter_map(Value::as_str) {
                match declaration.split_once('=') {
                    Some((key, value)) => env.insert(key.to_string(), value.to_string()),
                    None => env.insert(declaration.to_string(), String::new()),
                };
            }
        }
        Ok(env)
    }

    /// Declared volume paths with host sources and read/write modes,
    /// sorted by container path.
    pub async fn volumes(&mut self) -> Result<Vec<Volume>> {
        let declared = self
            .get("Volumes")
            .await?
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        let rw = self
            .get("VolumesRW")
            .await?
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        let mut volumes: Vec<Volume> = declared
            .iter()
            .map(|(path, host)| Volume {
                path: path.clone(),
                mode: match rw.get(path).and_then(Value::as_bool) {
                    None => String::new(),
                    Some(true) => "rw".to_string(),
                    Some(false) => "ro".to_string(),
                },
                host: host.as_str().unwrap_or_default().to_string(),
            })
            .collect();
        volumes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(volumes)
    }

    /// Labels stored on the container at creation time.
    pub async fn labels(&mut self) -> Result<HashMap<String, String>> {
        let mut labels = HashMap::new();
        if let Some(Value::Object(map)) = self.get("Config.Labels").await? {
            for (key, value) in map {
                if let Some(value) = value.as_str() {
                    labels.insert(key, value.to_string());
                }
            }
        }
        Ok(labels)
    }

    /// The configuration hash stored on the container at creation time.
    /// Reconciliation compares it against the currently declared
    /// configuration to decide reuse versus recreate.
    pub async fn config_hash(&mut self) -> Result<Option<String>> {
        Ok(self.labels().await?.remove(crate::service::LABEL_CONFIG_HASH))
    }

    /// Whether the container was created by an ad-hoc `run`.
    pub async fn is_one_off(&mut self) -> Result<bool> {
        Ok(self
            .labels()
            .await?
            .get(crate::service::LABEL_ONE_OFF)
            .is_some_and(|v| v == "true"))
    }

    /// Start the container. Retried on transient engine failures.
    pub async fn start(&self) -> Result<()> {
        self.retry
            .run(|| self.engine.start_container(&self.id))
            .await
    }

    /// Stop the container. Retried on transient engine failures.
    pub async fn stop(&self, timeout: Option<i64>) -> Result<()> {
        self.retry
            .run(|| self.engine.stop_container(&self.id, timeout))
            .await
    }

    /// Kill the container. Retried on transient engine failures.
    pub async fn kill(&self, signal: Option<&str>) -> Result<()> {
        self.retry
            .run(|| self.engine.kill_container(&self.id, signal))
            .await
    }

    /// Remove the container. Retried on transient engine failures. The view
    /// is stale afterwards and must not be reused.
    pub async fn remove(&self, options: RemoveOptions) -> Result<()> {
        self.retry
            .run(|| self.engine.remove_container(&self.id, options))
            .await
    }

    /// Restart the container. Not retried: a restart may legitimately be
    /// issued mid-transition, and retries could race the engine.
    pub async fn restart(&self) -> Result<()> {
        self.engine.restart_container(&self.id).await
    }

    /// Block until the container exits; returns the exit code. Not retried:
    /// the wait is consumed by the remote side once issued.
    pub async fn wait(&self) -> Result<i64> {
        self.engine.wait_container(&self.id).await
    }

    /// Stream container logs.
    pub async fn logs(&self, options: LogsOptions) -> Result<ByteStream> {
        self.engine.logs(&self.id, options).await
    }

    /// Attach to the container's output.
    pub async fn attach(&self) -> Result<ByteStream> {
        self.engine.attach(&self.id).await
    }
}

fn first_binding(bindings: &Value) -> Option<(String, String)> {
    let first = bindings.as_array()?.first()?;
    Some((
        first.get("HostIp")?.as_str()?.to_string(),
        first.get("HostPort")?.as_str()?.to_string(),
    ))
}

impl PartialEq for Container {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Container {}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}
