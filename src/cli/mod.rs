//! Command-line interface.
//!
//! Thin layer over [`Project`]: parse arguments, load the project file,
//! connect to the engine, dispatch, and render output. Every subcommand
//! resolves to an exit code so the binary can propagate container exit
//! statuses (`run` in the foreground exits with the container's code).

use crate::config;
use crate::container::Container;
use crate::engine::{DockerEngine, LogsOptions, RetryPolicy};
use crate::project::{Project, UpOptions};
use crate::service::ConvergePolicy;
use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use futures::stream::select_all;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "convoy", version, about = "Declarative multi-container orchestration")]
pub struct Cli {
    /// Project file.
    #[arg(short = 'f', long = "file", default_value = config::DEFAULT_CONFIG_FILE)]
    pub file: PathBuf,

    /// Project name. Defaults to the sanitized name of the project file's
    /// directory.
    #[arg(short = 'p', long = "project-name")]
    pub project_name: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create and start services, in dependency order.
    Up {
        /// Run in the background instead of streaming logs.
        #[arg(short = 'd', long)]
        detach: bool,
        /// Do not start linked services.
        #[arg(long)]
        no_deps: bool,
        /// Reuse existing containers even if their configuration changed.
        #[arg(long, conflicts_with = "force_recreate")]
        no_recreate: bool,
        /// Recreate every container, changed or not.
        #[arg(long)]
        force_recreate: bool,
        /// Services to bring up (all when empty).
        services: Vec<String>,
    },

    /// List project containers.
    Ps {
        /// Only print container ids.
        #[arg(short = 'q', long)]
        quiet: bool,
        /// Include stopped containers.
        #[arg(short = 'a', long)]
        all: bool,
        services: Vec<String>,
    },

    /// Set the replica count of services, e.g. `convoy scale web=3 worker=2`.
    Scale {
        /// `SERVICE=REPLICAS` pairs.
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Start existing stopped containers.
    Start { services: Vec<String> },

    /// Stop running containers without removing them.
    Stop { services: Vec<String> },

    /// Restart running containers.
    Restart { services: Vec<String> },

    /// Force-stop running containers.
    Kill { services: Vec<String> },

    /// Remove stopped containers.
    Rm {
        /// Remove one-off run containers instead of service replicas.
        #[arg(long)]
        one_off: bool,
        services: Vec<String>,
    },

    /// Run a one-off command against a service's configuration.
    Run {
        /// Do not start linked services.
        #[arg(long)]
        no_deps: bool,
        /// Print the container name and return instead of waiting.
        #[arg(short = 'd', long)]
        detach: bool,
        service: String,
        /// Command override (the service's default when empty).
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Stream container logs.
    Logs {
        /// Keep following output as it is produced.
        #[arg(short = 'f', long)]
        follow: bool,
        /// Number of trailing lines to show.
        #[arg(long)]
        tail: Option<usize>,
        services: Vec<String>,
    },

    /// Print the host binding for a service's private port.
    Port {
        service: String,
        /// Private (container-side) port.
        port: u16,
        #[arg(long, default_value = "tcp")]
        protocol: String,
        /// Which replica to query, 1-based.
        #[arg(long, default_value_t = 1)]
        index: usize,
    },
}

/// Run one parsed invocation to completion. Returns the process exit code.
pub async fn execute(cli: Cli) -> anyhow::Result<i32> {
    let services = config::load_file(&cli.file)
        .with_context(|| format!("loading project file {}", cli.file.display()))?;

    let project_name = match cli.project_name {
        Some(name) => name,
        None => {
            let dir = cli
                .file
                .canonicalize()
                .with_context(|| format!("resolving {}", cli.file.display()))?
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default();
            config::project_name_from_dir(&dir)
        }
    };

    let engine = Arc::new(DockerEngine::connect().await?);
    let retry = RetryPolicy::from_env();
    let project = Project::from_config(project_name, services, engine, retry)?;

    match cli.command {
        Command::Up {
            detach,
            no_deps,
            no_recreate,
            force_recreate,
            services,
        } => {
            let policy = if force_recreate {
                ConvergePolicy::ForceRecreate
            } else if no_recreate {
                ConvergePolicy::NoRecreate
            } else {
                ConvergePolicy::Recreate
            };
            let containers = project
                .up(
                    &services,
                    UpOptions {
                        detach,
                        no_deps,
                        policy,
                    },
                )
                .await?;
            for container in &containers {
                println!("{}", container.name());
            }
            if !detach {
                stream_logs(
                    containers,
                    LogsOptions {
                        follow: true,
                        ..Default::default()
                    },
                )
                .await?;
            }
            Ok(0)
        }

        Command::Ps {
            quiet,
            all,
            services,
        } => {
            let containers = project.containers(&services, all, false).await?;
            print_ps(containers, quiet).await
        }

        Command::Scale { targets } => {
            let targets = targets
                .iter()
                .map(|spec| parse_scale_target(spec))
                .collect::<anyhow::Result<Vec<_>>>()?;
            project.scale(&targets).await?;
            Ok(0)
        }

        Command::Start { services } => {
            project.start(&services).await?;
            Ok(0)
        }

        Command::Stop { services } => {
            project.stop(&services).await?;
            Ok(0)
        }

        Command::Restart { services } => {
            project.restart(&services).await?;
            Ok(0)
        }

        Command::Kill { services } => {
            project.kill(&services).await?;
            Ok(0)
        }

        Command::Rm { one_off, services } => {
            project.remove_stopped(&services, one_off).await?;
            Ok(0)
        }

        Command::Run {
            no_deps,
            detach,
            service,
            command,
        } => {
            let container = project.run(&service, &command, no_deps).await?;
            if detach {
                println!("{}", container.name());
                return Ok(0);
            }
            let code = container.wait().await?;
            stream_logs(
                vec![container],
                LogsOptions {
                    follow: false,
                    ..Default::default()
                },
            )
            .await?;
            Ok(code.clamp(0, 255) as i32)
        }

        Command::Logs {
            follow,
            tail,
            services,
        } => {
            let containers = project.containers(&services, true, false).await?;
            stream_logs(
                containers,
                LogsOptions {
                    follow,
                    tail,
                    ..Default::default()
                },
            )
            .await?;
            Ok(0)
        }

        Command::Port {
            service,
            port,
            protocol,
            index,
        } => {
            let containers = project
                .containers(std::slice::from_ref(&service), false, false)
                .await?;
            let Some(container) = containers.into_iter().nth(index.saturating_sub(1)) else {
                bail!("no running container #{index} for service {service:?}");
            };
            let mut container = container;
            match container.get_local_port(port, &protocol).await? {
                Some(binding) => println!("{binding}"),
                None => bail!("port {port}/{protocol} of {service:?} is not bound on the host"),
            }
            Ok(0)
        }
    }
}

/// `SERVICE=REPLICAS` argument for `scale`.
fn parse_scale_target(spec: &str) -> anyhow::Result<(String, usize)> {
    let Some((service, count)) = spec.split_once('=') else {
        bail!("scale targets look like SERVICE=REPLICAS, got {spec:?}");
    };
    let count: usize = count
        .parse()
        .with_context(|| format!("invalid replica count in {spec:?}"))?;
    Ok((service.to_string(), count))
}

/// Merge log streams from multiple containers onto stdout, each line
/// prefixed with the container's project-less name.
async fn stream_logs(containers: Vec<Container>, options: LogsOptions) -> anyhow::Result<()> {
    if containers.is_empty() {
        return Ok(());
    }
    info!(containers = containers.len(), "streaming logs");

    let mut tagged = Vec::new();
    for container in &containers {
        let prefix = container.name_without_project();
        let stream = container.logs(options.clone()).await?;
        tagged.push(stream.map(move |chunk| (prefix.clone(), chunk)));
    }

    let mut merged = select_all(tagged);
    while let Some((prefix, chunk)) = merged.next().await {
        let bytes = chunk?;
        for line in String::from_utf8_lossy(&bytes).lines() {
            println!("{prefix} | {line}");
        }
    }
    Ok(())
}

async fn print_ps(containers: Vec<Container>, quiet: bool) -> anyhow::Result<i32> {
    if quiet {
        for container in &containers {
            println!("{}", container.id());
        }
        return Ok(0);
    }
    println!(
        "{:<24} {:<32} {:<12} {}",
        "NAME", "COMMAND", "STATE", "PORTS"
    );
    for mut container in containers {
        let name = container.name();
        let command = container.human_readable_command().await?;
        let state = container.human_readable_state().await?;
        let ports = container.human_readable_ports().await?;
        println!("{name:<24} {command:<32} {state:<12} {ports}");
    }
    Ok(0)
}
