//! In-memory container engine for orchestration tests.
//!
//! Implements [`EngineClient`] over a mutex-guarded container table and
//! mirrors the wire shapes of the real engine's list and inspect payloads.
//! Tests can inject queued failures per operation and read back an
//! operation log to assert ordering.

use async_trait::async_trait;
use convoy::engine::{
    ByteStream, CreateOptions, EngineClient, EngineError, LogsOptions, RemoveOptions, Result,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct MockContainer {
    id: String,
    name: String,
    options: CreateOptions,
    running: bool,
    exit_code: i64,
}

#[derive(Default)]
struct State {
    containers: Vec<MockContainer>,
    next_id: u64,
    failures: HashMap<String, Vec<EngineError>>,
    ops: Vec<String>,
}

pub struct MockEngine {
    state: Mutex<State>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
        })
    }

    /// Queue `times` copies of `err` to be returned by the next calls to
    /// `op` (one of `create`, `start`, `stop`, `kill`, `remove`).
    pub fn fail_next(&self, op: &str, err: EngineError, times: usize) {
        let mut state = self.state.lock().unwrap();
        state
            .failures
            .entry(op.to_string())
            .or_default()
            .extend(std::iter::repeat_n(err, times));
    }

    /// Names of all containers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .containers
            .iter()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// The id of the named container, if it exists.
    pub fn id_of(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id.clone())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .any(|c| c.name == name && c.running)
    }

    /// The create options the named container was created with.
    pub fn created_options(&self, name: &str) -> Option<CreateOptions> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.options.clone())
    }

    /// Every engine call so far, as `"<op> <container name>"` entries.
    pub fn op_log(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    fn take_failure(state: &mut State, op: &str) -> Result<()> {
        if let Some(err) = state.failures.get_mut(op).and_then(Vec::pop) {
            state.ops.push(format!("{op} <injected failure>"));
            return Err(err);
        }
        Ok(())
    }

    fn position(state: &State, id: &str) -> Result<usize> {
        state
            .containers
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    fn log(state: &mut State, op: &str, index: usize) {
        let name = state.containers[index].name.clone();
        state.ops.push(format!("{op} {name}"));
    }

    fn inspect_record(container: &MockContainer) -> Value {
        let options = &container.options;
        let ports: serde_json::Map<String, Value> = options
            .exposed_ports
            .iter()
            .map(|private| {
                let binding = options.port_bindings.get(private).map(|(ip, port)| {
                    json!([{ "HostIp": ip, "HostPort": port }])
                });
                (private.clone(), binding.unwrap_or(Value::Null))
            })
            .collect();

        let mut volumes = serde_json::Map::new();
        let mut volumes_rw = serde_json::Map::new();
        for bind in &options.binds {
            let parts: Vec<&str> = bind.split(':').collect();
            if let [host, path, rest @ ..] = parts.as_slice() {
                let read_only = rest.first().is_some_and(|mode| *mode == "ro");
                volumes.insert((*path).to_string(), json!(host));
                volumes_rw.insert((*path).to_string(), json!(!read_only));
            }
        }

        json!({
            "Id": container.id,
            "Name": format!("/{}", container.name),
            "Image": options.image,
            "Config": {
                "Image": options.image,
                "Cmd": options.cmd,
                "Entrypoint": options.entrypoint,
                "Env": options.env,
                "Labels": options.labels,
            },
            "State": {
                "Running": container.running,
                "ExitCode": container.exit_code,
            },
            "NetworkSettings": { "Ports": ports },
            "Volumes": volumes,
            "VolumesRW": volumes_rw,
        })
    }
}

#[async_trait]
impl EngineClient for MockEngine {
    async fn list_containers(
        &self,
        all: bool,
        _filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<Value>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.running)
            .map(|c| {
                json!({
                    "Id": c.id,
                    "Image": c.options.image,
                    "Names": [format!("/{}", c.name)],
                })
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<Value> {
        let state = self.state.lock().unwrap();
        let index = Self::position(&state, id)?;
        Ok(Self::inspect_record(&state.containers[index]))
    }

    async fn create_container(&self, name: &str, options: &CreateOptions) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "create")?;
        if state.containers.iter().any(|c| c.name == name) {
            return Err(EngineError::Invalid(format!(
                "container name {name:?} already in use"
            )));
        }
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.containers.push(MockContainer {
            id: id.clone(),
            name: name.to_string(),
            options: options.clone(),
            running: false,
            exit_code: 0,
        });
        state.ops.push(format!("create {name}"));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "start")?;
        let index = Self::position(&state, id)?;
        state.containers[index].running = true;
        Self::log(&mut state, "start", index);
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Option<i64>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "stop")?;
        let index = Self::position(&state, id)?;
        state.containers[index].running = false;
        Self::log(&mut state, "stop", index);
        Ok(())
    }

    async fn kill_container(&self, id: &str, _signal: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "kill")?;
        let index = Self::position(&state, id)?;
        state.containers[index].running = false;
        state.containers[index].exit_code = 137;
        Self::log(&mut state, "kill", index);
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let index = Self::position(&state, id)?;
        state.containers[index].running = true;
        Self::log(&mut state, "restart", index);
        Ok(())
    }

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "remove")?;
        let index = Self::position(&state, id)?;
        if state.containers[index].running && !options.force {
            return Err(EngineError::Invalid(format!(
                "cannot remove running container {id}"
            )));
        }
        Self::log(&mut state, "remove", index);
        state.containers.remove(index);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        let index = Self::position(&state, id)?;
        state.containers[index].running = false;
        Self::log(&mut state, "wait", index);
        Ok(state.containers[index].exit_code)
    }

    async fn logs(&self, id: &str, _options: LogsOptions) -> Result<ByteStream> {
        let state = self.state.lock().unwrap();
        Self::position(&state, id)?;
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn attach(&self, id: &str) -> Result<ByteStream> {
        let state = self.state.lock().unwrap();
        Self::position(&state, id)?;
        Ok(Box::pin(futures::stream::empty()))
    }
}
