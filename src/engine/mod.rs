//! Container engine API boundary.
//!
//! Everything convoy knows about the remote engine goes through the
//! [`EngineClient`] trait: listing and inspecting containers, creating and
//! starting them, streaming logs, and so on. The production implementation
//! ([`DockerEngine`]) talks to a Docker/Podman daemon via the bollard API;
//! tests drive the same trait with an in-memory engine.
//!
//! Engine failures are classified into transient and permanent kinds so that
//! the [`RetryPolicy`] can retry only the failures worth retrying.

mod docker;
mod retry;

pub use docker::DockerEngine;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;

/// Engine API errors, classified for retry purposes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Transient engine/API failure (timeout, transport error, 5xx,
    /// temporary lock conflict). Safe to retry.
    #[error("engine API error: {0}")]
    Api(String),

    /// The referenced container does not exist. Never retried.
    #[error("no such container: {0}")]
    NotFound(String),

    /// The engine rejected the request as invalid. Never retried.
    #[error("engine rejected request: {0}")]
    Invalid(String),
}

impl EngineError {
    /// Whether the failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Api(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// A stream of raw output chunks from the engine (logs, attach).
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Options for creating a container.
///
/// Mirrors the subset of the engine's create payload that convoy drives:
/// image, process, environment, port and volume wiring, link aliases, and
/// labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOptions {
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    /// `KEY=VALUE` declarations.
    pub env: Vec<String>,
    /// Exposed private ports, `port/protocol` form (e.g. `8000/tcp`).
    pub exposed_ports: Vec<String>,
    /// Host bindings keyed by private `port/protocol`, value `(host_ip, host_port)`.
    pub port_bindings: HashMap<String, (String, String)>,
    /// Volume binds, `host:/container/path[:mode]` or a bare container path.
    pub binds: Vec<String>,
    /// Link aliases, `container_name:alias` form.
    pub links: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Options for removing a container.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Kill a running container instead of failing.
    pub force: bool,
    /// Remove anonymous volumes along with the container.
    pub volumes: bool,
}

/// Options for streaming container logs.
#[derive(Debug, Clone, Default)]
pub struct LogsOptions {
    pub follow: bool,
    /// Number of trailing lines, or all when `None`.
    pub tail: Option<usize>,
    pub timestamps: bool,
}

/// Client interface to the remote container engine.
///
/// List records are partial (the engine's list payload); inspect records are
/// complete. Both are raw JSON mirroring the engine schema; the
/// [`Container`](crate::container::Container) view is responsible for typed
/// access. Every method may fail with a transient or permanent
/// [`EngineError`]; callers decide what to retry via [`RetryPolicy`].
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// List containers, optionally including stopped ones, filtered by
    /// engine-side filters (e.g. `label`). Returns partial records.
    async fn list_containers(
        &self,
        all: bool,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<Value>>;

    /// Fetch the complete inspection record for one container.
    async fn inspect_container(&self, id: &str) -> Result<Value>;

    /// Create a container. The engine returns only the new id; callers
    /// inspect to obtain initial state.
    async fn create_container(&self, name: &str, options: &CreateOptions) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container, giving it `timeout` seconds before the engine kills it.
    async fn stop_container(&self, id: &str, timeout: Option<i64>) -> Result<()>;

    async fn kill_container(&self, id: &str, signal: Option<&str>) -> Result<()>;

    async fn restart_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> Result<()>;

    /// Block until the container exits; returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// Stream container logs.
    async fn logs(&self, id: &str, options: LogsOptions) -> Result<ByteStream>;

    /// Attach to a running container's output.
    async fn attach(&self, id: &str) -> Result<ByteStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(EngineError::Api("socket timeout".into()).is_transient());
        assert!(!EngineError::NotFound("abc123".into()).is_transient());
        assert!(!EngineError::Invalid("bad port spec".into()).is_transient());
    }
}
