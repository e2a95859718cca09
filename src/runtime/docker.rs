//! [`ContainerRuntime`] backed by the Docker Engine API (bollard).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding};
use futures::stream::{BoxStream, StreamExt};

use crate::error::{BoxError, Result};
use crate::runtime::{ContainerRuntime, ContainerSpec, LogChunk, PullProgress, RuntimeError};

/// Connect to the local Docker daemon.
///
/// Tries bollard's defaults first (`DOCKER_HOST` or `/var/run/docker.sock`),
/// then the rootless socket under `$XDG_RUNTIME_DIR` and the Docker Desktop
/// socket under `~/.docker/run`.
pub async fn connect_docker() -> Result<Docker> {
    let mut last_error = String::from("no Docker socket found");

    match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.ping().await {
            Ok(_) => return Ok(docker),
            Err(e) => last_error = e.to_string(),
        },
        Err(e) => last_error = e.to_string(),
    }

    #[cfg(unix)]
    for socket in fallback_sockets() {
        if !std::path::Path::new(&socket).exists() {
            continue;
        }
        tracing::debug!("Trying Docker socket {}", socket);
        match Docker::connect_with_socket(&socket, 120, bollard::API_DEFAULT_VERSION) {
            Ok(docker) => match docker.ping().await {
                Ok(_) => return Ok(docker),
                Err(e) => last_error = e.to_string(),
            },
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(BoxError::DockerNotAvailable { reason: last_error })
}

#[cfg(unix)]
fn fallback_sockets() -> Vec<String> {
    let mut sockets = Vec::new();
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        sockets.push(format!("{}/docker.sock", dir));
    }
    if let Ok(home) = std::env::var("HOME") {
        sockets.push(format!("{}/.docker/run/docker.sock", home));
    }
    sockets
}

fn map_docker_error(e: DockerError) -> RuntimeError {
    match e {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code: 304,
            message,
        } => RuntimeError::NotModified(message),
        other => RuntimeError::Api(other.to_string()),
    }
}

/// Docker Engine client.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect to the local daemon with [`connect_docker`].
    pub async fn connect() -> Result<Self> {
        Ok(Self::new(connect_docker().await?))
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            spec.container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                // An empty host port asks Docker for an ephemeral one.
                host_port: Some(match spec.host_port {
                    0 => String::new(),
                    port => port.to_string(),
                }),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(spec.container_port.clone(), HashMap::new());

        let mounts = spec.bind_mount.as_ref().map(|(source, target)| {
            vec![Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(source.to_string_lossy().to_string()),
                target: Some(target.clone()),
                read_only: Some(true),
                ..Default::default()
            }]
        });

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts,
            // Docker removes the container once it stops
            auto_remove: Some(true),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> std::result::Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), Self::container_config(spec))
            .await
            .map_err(map_docker_error)?;

        for warning in &response.warnings {
            tracing::warn!("Docker warning for {}: {}", spec.name, warning);
        }

        Ok(response.id)
    }

    fn pull_image(
        &self,
        image: &str,
    ) -> BoxStream<'static, std::result::Result<PullProgress, RuntimeError>> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        self.docker
            .create_image(Some(options), None, None)
            .map(|event| match event {
                Ok(info) => match info.error {
                    Some(error) => Err(RuntimeError::Api(error)),
                    None => Ok(PullProgress {
                        id: info.id,
                        status: info.status,
                        progress: info.progress,
                    }),
                },
                Err(e) => Err(map_docker_error(e)),
            })
            .boxed()
    }

    async fn start_container(&self, id: &str) -> std::result::Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_docker_error)
    }

    async fn host_port(
        &self,
        id: &str,
        container_port: &str,
    ) -> std::result::Result<Option<String>, RuntimeError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_docker_error)?;

        let port = info
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(container_port))
            .flatten()
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .filter(|port| !port.is_empty());

        Ok(port)
    }

    fn logs(&self, id: &str) -> BoxStream<'static, std::result::Result<LogChunk, RuntimeError>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        self.docker
            .logs(id, Some(options))
            .filter_map(|frame| async move {
                match frame {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(LogChunk::Stdout(message)))
                    }
                    Ok(LogOutput::StdErr { message }) => Some(Ok(LogChunk::Stderr(message))),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(map_docker_error(e))),
                }
            })
            .boxed()
    }

    async fn stop_container(
        &self,
        id: &str,
        grace: Duration,
    ) -> std::result::Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(map_docker_error)
    }

    async fn wait_removed(&self, id: &str) -> std::result::Result<(), RuntimeError> {
        let options = WaitContainerOptions {
            condition: "removed".to_string(),
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        while let Some(result) = stream.next().await {
            match result {
                Ok(_) => {}
                // A non-zero exit status still means the container is gone.
                Err(DockerError::DockerContainerWaitError { code, .. }) => {
                    tracing::debug!("Container {} exited with status {}", id, code);
                }
                Err(e) => return Err(map_docker_error(e)),
            }
        }

        Ok(())
    }

    async fn remove_container(&self, id: &str) -> std::result::Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_docker_error)
    }

    async fn list_labeled(
        &self,
        key: &str,
        value: &str,
    ) -> std::result::Result<Vec<String>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}={}", key, value)]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_docker_error)?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}
