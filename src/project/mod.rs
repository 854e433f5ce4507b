//! Multi-service orchestration for one named application.
//!
//! A [`Project`] owns the ordered set of services and runs the cross-service
//! operations: dependency-ordered `up`, per-service scaling, fleet-wide
//! start/stop/kill/restart, stopped-container reaping, and one-off runs.
//!
//! Configuration problems (duplicate service names, links to unknown
//! services, dependency cycles) are rejected when the project is built,
//! before any engine call is made.

use crate::container::Container;
use crate::engine::{EngineClient, EngineError, RetryPolicy};
use crate::service::{ConvergePolicy, Service, ServiceConfig, ServiceError};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Project-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("no such service: {0}")]
    NoSuchService(String),

    #[error("duplicate service name: {0}")]
    DuplicateService(String),

    #[error("service {service:?} links to unknown service {target:?}")]
    UnknownLink { service: String, target: String },

    #[error("dependency cycle among services: {0}")]
    DependencyCycle(String),
}

/// Result type for project operations.
pub type Result<T> = std::result::Result<T, ProjectError>;

/// Options for [`Project::up`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UpOptions {
    /// Leave containers running in the background (consumed by the CLI;
    /// convergence itself is identical either way).
    pub detach: bool,
    /// Skip starting, discovering, and linking dependency services.
    pub no_deps: bool,
    pub policy: ConvergePolicy,
}

/// The full multi-service application, uniquely named.
pub struct Project {
    name: String,
    services: Vec<Service>,
    engine: Arc<dyn EngineClient>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.name)
            .field("services", &self.services)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Project {
    /// Build a project from `(service name, config)` pairs in declaration
    /// order. Rejects duplicate names, unknown link targets, and dependency
    /// cycles before touching the engine.
    pub fn from_config(
        name: impl Into<String>,
        services: Vec<(String, ServiceConfig)>,
        engine: Arc<dyn EngineClient>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let name = name.into();

        let mut seen = HashSet::new();
        for (service_name, config) in &services {
            if !seen.insert(service_name.clone()) {
                return Err(ProjectError::DuplicateService(service_name.clone()));
            }
            for (target, _) in config.parsed_links() {
                if !services.iter().any(|(n, _)| *n == target) {
                    return Err(ProjectError::UnknownLink {
                        service: service_name.clone(),
                        target,
                    });
                }
            }
        }

        let project = Self {
            services: services
                .into_iter()
                .map(|(service_name, config)| {
                    Service::new(&name, service_name, config, engine.clone(), retry.clone())
                })
                .collect(),
            name,
            engine,
            retry,
        };

        // Surfaces dependency cycles at construction time.
        project.ordered(&[], true)?;

        Ok(project)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Look up a service by name.
    pub fn get_service(&self, name: &str) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| ProjectError::NoSuchService(name.to_string()))
    }

    /// Services in dependency order, restricted to `selected` (all when
    /// empty) plus, when `include_deps`, their transitive dependencies.
    /// Ties between independent services fall back to declaration order.
    fn ordered(&self, selected: &[String], include_deps: bool) -> Result<Vec<&Service>> {
        let mut wanted: HashSet<String> = if selected.is_empty() {
            self.services.iter().map(|s| s.name().to_string()).collect()
        } else {
            let mut set = HashSet::new();
            for name in selected {
                self.get_service(name)?;
                set.insert(name.clone());
            }
            set
        };

        if include_deps {
            let mut frontier: Vec<String> = wanted.iter().cloned().collect();
            while let Some(name) = frontier.pop() {
                for (dep, _) in self.get_service(&name)?.config().parsed_links() {
                    if wanted.insert(dep.clone()) {
                        frontier.push(dep);
                    }
                }
            }
        }

        // Kahn's algorithm, scanning in declaration order for determinism.
        let mut emitted: Vec<&Service> = Vec::new();
        let mut done: HashSet<&str> = HashSet::new();
        while emitted.len() < wanted.len() {
            let mut progressed = false;
            for service in &self.services {
                if !wanted.contains(service.name()) || done.contains(service.name()) {
                    continue;
                }
                let ready = service
                    .config()
                    .parsed_links()
                    .iter()
                    .all(|(dep, _)| !wanted.contains(dep) || done.contains(dep.as_str()));
                if ready {
                    done.insert(service.name());
                    emitted.push(service);
                    progressed = true;
                }
            }
            if !progressed {
                let stuck: Vec<&str> = self
                    .services
                    .iter()
                    .map(|s| s.name())
                    .filter(|n| wanted.contains(*n) && !done.contains(n))
                    .collect();
                return Err(ProjectError::DependencyCycle(stuck.join(", ")));
            }
        }
        Ok(emitted)
    }

    /// Resolve the link aliases for one service from its dependencies'
    /// currently running containers. Each running dependency container
    /// contributes three aliases: the declared alias (or service name), the
    /// full container name, and the name without the project prefix.
    async fn resolve_links(&self, service: &Service) -> Result<Vec<(String, String)>> {
        let mut links = Vec::new();
        for (dep, alias) in service.config().parsed_links() {
            let dep_service = self.get_service(&dep)?;
            for container in dep_service.containers(false, false).await? {
                let name = container.name();
                links.push((name.clone(), alias.clone()));
                links.push((name.clone(), name.clone()));
                links.push((name.clone(), container.name_without_project()));
            }
        }
        Ok(links)
    }

    /// Converge the selected services (all when empty) in dependency order.
    ///
    /// A failing service halts only its dependents: services that do not
    /// depend on it still converge, nothing already converged is rolled
    /// back, and the first failure is returned after the sweep.
    pub async fn up(&self, selected: &[String], options: UpOptions) -> Result<Vec<Container>> {
        let ordered = self.ordered(selected, !options.no_deps)?;
        info!(
            project = %self.name,
            services = ordered.len(),
            "bringing services up"
        );

        let mut failed: HashSet<String> = HashSet::new();
        let mut first_error: Option<ProjectError> = None;
        let mut converged = Vec::new();

        for service in ordered {
            let blocked = service
                .config()
                .parsed_links()
                .iter()
                .any(|(dep, _)| failed.contains(dep));
            if blocked {
                warn!(
                    service = %service.name(),
                    "skipping, a dependency failed to converge"
                );
                failed.insert(service.name().to_string());
                continue;
            }

            let outcome = async {
                let links = if options.no_deps {
                    Vec::new()
                } else {
                    self.resolve_links(service).await?
                };
                service
                    .converge(service.config().replicas, options.policy, &links)
                    .await
                    .map_err(ProjectError::from)
            }
            .await;

            match outcome {
                Ok(containers) => converged.extend(containers),
                Err(err) => {
                    error!(service = %service.name(), "convergence failed: {err}");
                    failed.insert(service.name().to_string());
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(converged),
        }
    }

    /// Apply replica counts per named service. Does not activate
    /// dependencies; link aliases are resolved from whatever dependency
    /// containers already run.
    pub async fn scale(&self, targets: &[(String, usize)]) -> Result<Vec<Container>> {
        let mut result = Vec::new();
        for (name, count) in targets {
            let service = self.get_service(name)?;
            info!(service = %name, replicas = count, "scaling");
            let links = self.resolve_links(service).await?;
            result.extend(
                service
                    .converge(*count, ConvergePolicy::default(), &links)
                    .await?,
            );
        }
        Ok(result)
    }

    /// Start stopped containers, dependency order.
    pub async fn start(&self, selected: &[String]) -> Result<()> {
        for service in self.ordered(selected, false)? {
            service.start().await?;
        }
        Ok(())
    }

    /// Stop running containers, reverse dependency order.
    pub async fn stop(&self, selected: &[String]) -> Result<()> {
        for service in self.ordered(selected, false)?.into_iter().rev() {
            service.stop().await?;
        }
        Ok(())
    }

    /// Kill running containers, reverse dependency order.
    pub async fn kill(&self, selected: &[String]) -> Result<()> {
        for service in self.ordered(selected, false)?.into_iter().rev() {
            service.kill().await?;
        }
        Ok(())
    }

    /// Restart running containers, dependency order.
    pub async fn restart(&self, selected: &[String]) -> Result<()> {
        for service in self.ordered(selected, false)? {
            service.restart().await?;
        }
        Ok(())
    }

    /// Remove stopped containers across the selected services.
    pub async fn remove_stopped(&self, selected: &[String], one_off: bool) -> Result<()> {
        for service in self.ordered(selected, false)? {
            service.remove_stopped(one_off).await?;
        }
        Ok(())
    }

    /// All containers backing the selected services, declaration order.
    pub async fn containers(
        &self,
        selected: &[String],
        stopped: bool,
        one_off: bool,
    ) -> Result<Vec<Container>> {
        for name in selected {
            self.get_service(name)?;
        }
        let mut containers = Vec::new();
        for service in &self.services {
            if selected.is_empty() || selected.iter().any(|n| n == service.name()) {
                containers.extend(service.containers(stopped, one_off).await?);
            }
        }
        Ok(containers)
    }

    /// Execute a one-off container for `service`, starting its dependencies
    /// first unless `no_deps`. Existing running dependency containers are
    /// reused, never recreated.
    pub async fn run(
        &self,
        service_name: &str,
        command: &[String],
        no_deps: bool,
    ) -> Result<Container> {
        let service = self.get_service(service_name)?;

        let links = if no_deps {
            Vec::new()
        } else {
            for dep in self.ordered(&[service_name.to_string()], true)? {
                if dep.name() == service_name {
                    continue;
                }
                debug!(service = %dep.name(), "ensuring dependency before one-off run");
                let dep_links = self.resolve_links(dep).await?;
                dep.converge(
                    dep.config().replicas,
                    ConvergePolicy::NoRecreate,
                    &dep_links,
                )
                .await?;
            }
            self.resolve_links(service).await?
        };

        Ok(service.run_one_off(command, &links).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        ByteStream, CreateOptions, EngineClient, LogsOptions, RemoveOptions,
        Result as EngineResult,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;

    /// Engine that refuses every call; configuration errors must surface
    /// before anything reaches the engine.
    struct UnreachableEngine;

    #[async_trait]
    impl EngineClient for UnreachableEngine {
        async fn list_containers(
            &self,
            _all: bool,
            _filters: HashMap<String, Vec<String>>,
        ) -> EngineResult<Vec<Value>> {
            panic!("engine called during configuration validation")
        }

        async fn inspect_container(&self, _id: &str) -> EngineResult<Value> {
            panic!("engine called during configuration validation")
        }

        async fn create_container(
            &self,
            _name: &str,
            _options: &CreateOptions,
        ) -> EngineResult<String> {
            panic!("engine called during configuration validation")
        }

        async fn start_container(&self, _id: &str) -> EngineResult<()> {
            panic!("engine called during configuration validation")
        }

        async fn stop_container(&self, _id: &str, _timeout: Option<i64>) -> EngineResult<()> {
            panic!("engine called during configuration validation")
        }

        async fn kill_container(&self, _id: &str, _signal: Option<&str>) -> EngineResult<()> {
            panic!("engine called during configuration validation")
        }

        async fn restart_container(&self, _id: &str) -> EngineResult<()> {
            panic!("engine called during configuration validation")
        }

        async fn remove_container(
            &self,
            _id: &str,
            _options: RemoveOptions,
        ) -> EngineResult<()> {
            panic!("engine called during configuration validation")
        }

        async fn wait_container(&self, _id: &str) -> EngineResult<i64> {
            panic!("engine called during configuration validation")
        }

        async fn logs(&self, _id: &str, _options: LogsOptions) -> EngineResult<ByteStream> {
            panic!("engine called during configuration validation")
        }

        async fn attach(&self, _id: &str) -> EngineResult<ByteStream> {
            panic!("engine called during configuration validation")
        }
    }

    fn project(services: Vec<(&str, Vec<&str>)>) -> Result<Project> {
        let services = services
            .into_iter()
            .map(|(name, links)| {
                let mut config = ServiceConfig::new("busybox:latest");
                config.links = links.into_iter().map(str::to_string).collect();
                (name.to_string(), config)
            })
            .collect();
        Project::from_config(
            "test",
            services,
            Arc::new(UnreachableEngine),
            RetryPolicy::default(),
        )
    }

    #[test]
    fn orders_services_by_dependency_then_declaration() {
        let p = project(vec![
            ("web", vec!["db"]),
            ("db", vec!["volume"]),
            ("volume", vec![]),
        ])
        .unwrap();
        let order: Vec<&str> = p.ordered(&[], true).unwrap().iter().map(|s| s.name()).collect();
        assert_eq!(order, vec!["volume", "db", "web"]);
    }

    #[test]
    fn independent_services_keep_declaration_order() {
        let p = project(vec![("b", vec![]), ("a", vec![]), ("c", vec![])]).unwrap();
        let order: Vec<&str> = p.ordered(&[], true).unwrap().iter().map(|s| s.name()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn selection_pulls_in_transitive_dependencies() {
        let p = project(vec![
            ("console", vec!["web"]),
            ("web", vec!["db"]),
            ("db", vec![]),
            ("cache", vec![]),
        ])
        .unwrap();
        let order: Vec<&str> = p
            .ordered(&["console".to_string()], true)
            .unwrap()
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(order, vec!["db", "web", "console"]);
    }

    #[test]
    fn selection_without_deps_stays_restricted() {
        let p = project(vec![("web", vec!["db"]), ("db", vec![])]).unwrap();
        let order: Vec<&str> = p
            .ordered(&["web".to_string()], false)
            .unwrap()
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(order, vec!["web"]);
    }

    #[test]
    fn rejects_dependency_cycles_at_construction() {
        let err = project(vec![("a", vec!["b"]), ("b", vec!["a"])]).unwrap_err();
        assert!(matches!(err, ProjectError::DependencyCycle(_)));
    }

    #[test]
    fn rejects_self_links() {
        let err = project(vec![("a", vec!["a"])]).unwrap_err();
        assert!(matches!(err, ProjectError::DependencyCycle(_)));
    }

    #[test]
    fn rejects_duplicate_service_names() {
        let err = project(vec![("a", vec![]), ("a", vec![])]).unwrap_err();
        assert!(matches!(err, ProjectError::DuplicateService(name) if name == "a"));
    }

    #[test]
    fn rejects_links_to_unknown_services() {
        let err = project(vec![("web", vec!["ghost"])]).unwrap_err();
        assert!(
            matches!(err, ProjectError::UnknownLink { service, target }
                if service == "web" && target == "ghost")
        );
    }

    #[test]
    fn unknown_selection_is_reported() {
        let p = project(vec![("web", vec![])]).unwrap();
        let err = p.ordered(&["nope".to_string()], true).unwrap_err();
        assert!(matches!(err, ProjectError::NoSuchService(name) if name == "nope"));
    }
}
