use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{ContainerInspectResponse, ContainerSummary, HostConfig, PortBinding},
};
use futures_util::stream::StreamExt;

use super::{
    runtime::ContainerRuntime,
    types::{ContainerConfig, ContainerError, ContainerResult, RuntimeContainer, SERVICE_ENV_PATH},
};

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
    stop_grace_secs: i64,
}

impl DockerRuntime {
    pub fn connect() -> ContainerResult<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::runtime("connect", "docker", e))?;
        Ok(Self {
            client,
            stop_grace_secs: 10,
        })
    }

    async fn pull_image_if_missing(&self, image: &str) -> Result<(), BollardError> {
        if self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(%image, "pulling image");
        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(msg) = stream.next().await {
            let info = msg?;
            if let Some(status) = info.status {
                tracing::debug!(%image, %status, "pull progress");
            }
        }

        tracing::info!(%image, "image pulled");
        Ok(())
    }
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn is_not_found(err: &BollardError) -> bool {
    status_code(err) == Some(404)
}

fn container_port_key(port: u16) -> String {
    format!("{port}/tcp")
}

fn build_container_config(config: &ContainerConfig) -> Config<String> {
    let published = config.published_ports();

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = published
        .iter()
        .map(|(container_port, host_port)| {
            (
                container_port_key(*container_port),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            )
        })
        .collect();

    let exposed_ports: HashMap<String, HashMap<(), ()>> = published
        .iter()
        .map(|(container_port, _)| (container_port_key(*container_port), HashMap::new()))
        .collect();

    let binds = config
        .env_file
        .as_ref()
        .map(|path| vec![format!("{}:{SERVICE_ENV_PATH}", path.display())]);

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        binds,
        privileged: Some(config.privileged),
        auto_remove: Some(config.auto_remove),
        ..Default::default()
    };

    Config {
        image: Some(config.image.clone()),
        env: Some(config.env.clone()),
        labels: Some(config.labels.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn parse_port_key(key: &str) -> Option<u16> {
    key.split('/').next()?.parse().ok()
}

fn from_summary(summary: ContainerSummary) -> Option<RuntimeContainer> {
    let name = summary
        .names
        .as_ref()?
        .first()?
        .trim_start_matches('/')
        .to_string();
    let published = summary
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|port| Some((port.private_port, port.public_port?)))
        .collect();
    let running = summary
        .status
        .as_deref()
        .is_some_and(|status| status.starts_with("Up"));

    Some(RuntimeContainer {
        id: summary.id,
        name,
        image: summary.image,
        running,
        status: summary.status,
        started_at: None,
        created: summary.created,
        published,
    })
}

fn from_inspect(response: ContainerInspectResponse, fallback_name: &str) -> RuntimeContainer {
    let name = response
        .name
        .as_deref()
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_else(|| fallback_name.to_string());
    let state = response.state.unwrap_or_default();

    let mut published = HashMap::new();
    let ports = response
        .network_settings
        .and_then(|settings| settings.ports)
        .unwrap_or_default();
    for (key, bindings) in ports {
        let Some(container_port) = parse_port_key(&key) else {
            continue;
        };
        let host_port = bindings
            .unwrap_or_default()
            .into_iter()
            .find_map(|binding| binding.host_port?.parse::<u16>().ok());
        if let Some(host_port) = host_port {
            published.insert(container_port, host_port);
        }
    }

    RuntimeContainer {
        id: response.id,
        name,
        image: response.config.and_then(|config| config.image),
        running: state.running.unwrap_or(false),
        status: state.status.map(|status| status.to_string()),
        started_at: state.started_at,
        created: None,
        published,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_and_start(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let launch_failed = |reason: String| ContainerError::LaunchFailed {
            config: Box::new(config.clone()),
            reason,
        };

        self.pull_image_if_missing(&config.image)
            .await
            .map_err(|e| launch_failed(format!("image pull failed: {e}")))?;

        let options = Some(CreateContainerOptions {
            name: config.name.clone(),
            ..Default::default()
        });

        let created = self
            .client
            .create_container(options, build_container_config(config))
            .await
            .map_err(|e| launch_failed(format!("create failed: {e}")))?;
        tracing::debug!(container = %config.name, id = %created.id, "container created");

        if let Err(e) = self
            .client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // a created but never started container still owns the name
            if let Err(cleanup) = self.stop_and_remove(&created.id).await {
                tracing::warn!(container = %config.name, error = %cleanup, "could not remove container that failed to start");
            }
            return Err(launch_failed(format!("start failed: {e}")));
        }

        tracing::info!(
            container = %config.name,
            control_port = config.ports.control,
            adb_port = config.ports.adb,
            "container started"
        );
        Ok(created.id)
    }

    async fn list(&self, prefix: &str) -> ContainerResult<Vec<RuntimeContainer>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![prefix.to_string()])]),
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| ContainerError::runtime("list", prefix, e))?;

        Ok(summaries
            .into_iter()
            .filter_map(from_summary)
            .filter(|container| container.name.starts_with(prefix))
            .collect())
    }

    async fn inspect(&self, name: &str) -> ContainerResult<Option<RuntimeContainer>> {
        match self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(Some(from_inspect(response, name))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(ContainerError::runtime("inspect", name, e)),
        }
    }

    async fn stop_and_remove(&self, name: &str) -> ContainerResult<bool> {
        let stopped = match self
            .client
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: self.stop_grace_secs,
                }),
            )
            .await
        {
            Ok(()) => true,
            Err(e) if is_not_found(&e) => false,
            Err(e) => {
                // 304 means already stopped, anything else still gets a forced removal
                tracing::debug!(container = %name, error = %e, "stop failed, forcing removal");
                status_code(&e) == Some(304)
            }
        };

        match self
            .client
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(true),
            // auto-removed after stop, or removal already in progress
            Err(e) if is_not_found(&e) || status_code(&e) == Some(409) => Ok(stopped),
            Err(e) => Err(ContainerError::runtime("remove", name, e)),
        }
    }

    async fn exec(&self, name: &str, command: &str, detach: bool) -> ContainerResult<i64> {
        let exec = self
            .client
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(vec![
                        "/bin/bash".to_string(),
                        "-c".to_string(),
                        command.to_string(),
                    ]),
                    attach_stdout: Some(!detach),
                    attach_stderr: Some(!detach),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    ContainerError::NotFound(name.to_string())
                } else {
                    ContainerError::runtime("exec", name, e)
                }
            })?;

        let started = self
            .client
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| ContainerError::runtime("exec", name, e))?;

        match started {
            StartExecResults::Detached => return Ok(0),
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(log) => tracing::trace!(container = %name, output = %log, "exec output"),
                        Err(e) => {
                            tracing::debug!(container = %name, error = %e, "exec output stream ended");
                            break;
                        }
                    }
                }
            }
        }

        let inspected = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ContainerError::runtime("exec", name, e))?;
        Ok(inspected.exit_code.unwrap_or(0))
    }

    async fn ping(&self) -> ContainerResult<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| ContainerError::runtime("ping", "docker", e))
    }
}
