//! convoy: declarative multi-container orchestration over a remote
//! container engine.
//!
//! A project file declares named services (image, command, ports, volumes,
//! environment, links, replicas). [`Project`] converges the engine's actual
//! containers toward that declaration: containers whose stored configuration
//! still matches are reused, drifted ones are recreated in place, and
//! services come up in dependency order.
//!
//! The engine is reached exclusively through [`engine::EngineClient`], so
//! the orchestration core is testable without a daemon.

pub mod cli;
pub mod config;
pub mod container;
pub mod engine;
pub mod project;
pub mod service;

pub use container::{Container, ContainerName, Volume};
pub use engine::{
    CreateOptions, DockerEngine, EngineClient, EngineError, LogsOptions, RemoveOptions,
    RetryPolicy,
};
pub use project::{Project, ProjectError, UpOptions};
pub use service::{ConvergePolicy, Service, ServiceConfig, ServiceError};
