//! MySQL container lifecycle.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::config::BoxConfig;
use crate::error::{BoxError, Result};
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::script::SCRIPT_MOUNT_TARGET;

/// The server port inside the container.
pub const MYSQL_PORT: &str = "3306/tcp";

/// Label attached to every container so orphans can be found and removed.
pub const DISCOVERY_LABEL: (&str, &str) = ("dev.mysqlbox.managed", "1");

/// Grace period given to mysqld before Docker kills it.
pub const STOP_GRACE: Duration = Duration::from_secs(60);

/// Arguments passed to mysqld.
const MYSQLD_ARGS: &[&str] = &[
    "--general-log=1",
    "--general-log-file=/var/lib/mysql/general-log.log",
];

/// Build the container spec for a (defaulted) box configuration.
pub fn container_spec(config: &BoxConfig, script: Option<&Path>) -> ContainerSpec {
    let mut env = vec![format!("MYSQL_DATABASE={}", config.database)];
    match config.root_password() {
        Some(password) => env.push(format!("MYSQL_ROOT_PASSWORD={}", password)),
        None => env.push("MYSQL_ALLOW_EMPTY_PASSWORD=1".to_string()),
    }

    ContainerSpec {
        name: config.container_name.clone(),
        image: config.image.clone(),
        env,
        cmd: MYSQLD_ARGS.iter().map(|s| s.to_string()).collect(),
        container_port: MYSQL_PORT.to_string(),
        host_port: config.port,
        labels: HashMap::from([(DISCOVERY_LABEL.0.to_string(), DISCOVERY_LABEL.1.to_string())]),
        bind_mount: script.map(|path| (path.to_path_buf(), SCRIPT_MOUNT_TARGET.to_string())),
    }
}

/// Creates, starts, inspects and stops MySQL containers.
#[derive(Clone)]
pub struct ContainerController {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerController {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Create the container, pulling the image once if it is missing.
    pub async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let creation_failed = |e: RuntimeError| BoxError::ContainerCreationFailed {
            name: spec.name.clone(),
            reason: e.to_string(),
        };

        match self.runtime.create_container(spec).await {
            Ok(id) => {
                tracing::debug!("Created container {} ({})", spec.name, id);
                Ok(id)
            }
            Err(e) if e.is_not_found() => {
                tracing::info!("Image '{}' not found locally", spec.image);
                self.pull_image(&spec.image).await?;

                let id = self
                    .runtime
                    .create_container(spec)
                    .await
                    .map_err(creation_failed)?;
                tracing::debug!("Created container {} ({})", spec.name, id);
                Ok(id)
            }
            Err(e) => Err(creation_failed(e)),
        }
    }

    /// Pull an image, streaming progress to the log.
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        if image.is_empty() {
            return Err(BoxError::ImagePullFailed {
                image: String::new(),
                reason: "image is blank".to_string(),
            });
        }

        tracing::info!("Pulling image: {}", image);

        let mut stream = self.runtime.pull_image(image);
        while let Some(event) = stream.next().await {
            match event {
                Ok(progress) => tracing::debug!("Pull {}: {}", image, progress),
                Err(e) => {
                    return Err(BoxError::ImagePullFailed {
                        image: image.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!("Pulled image: {}", image);
        Ok(())
    }

    pub async fn start(&self, id: &str, name: &str) -> Result<()> {
        self.runtime
            .start_container(id)
            .await
            .map_err(|e| BoxError::ContainerStartFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!("Started container: {}", name);
        Ok(())
    }

    /// Host port bound to the server's 3306.
    pub async fn resolve_port(&self, id: &str) -> Result<u16> {
        let port_failed = |reason: String| BoxError::PortResolutionFailed {
            id: id.to_string(),
            reason,
        };

        let port = self
            .runtime
            .host_port(id, MYSQL_PORT)
            .await
            .map_err(|e| port_failed(e.to_string()))?
            .ok_or_else(|| port_failed("no port bindings".to_string()))?;

        port.parse()
            .map_err(|e| port_failed(format!("invalid host port '{}': {}", port, e)))
    }

    /// Stop the container and wait until Docker has removed it.
    pub async fn stop(&self, id: &str) -> Result<()> {
        match self.runtime.stop_container(id, STOP_GRACE).await {
            Ok(()) => {}
            Err(RuntimeError::NotModified(_)) | Err(RuntimeError::NotFound(_)) => {
                tracing::debug!("Container {} was already stopped", id);
            }
            Err(e) => {
                return Err(BoxError::ContainerStopFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        self.wait_removed(id).await
    }

    /// Wait for removal; a container that no longer exists counts as removed.
    pub async fn wait_removed(&self, id: &str) -> Result<()> {
        match self.runtime.wait_removed(id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!("Container {} already removed", id);
                Ok(())
            }
            Err(e) => Err(BoxError::RemovalWaitFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Force-remove a container that never became a running box.
    pub async fn discard(&self, id: &str) -> Result<()> {
        match self.runtime.remove_container(id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(BoxError::ContainerRemovalFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Remove every container carrying the discovery label. Returns the IDs
    /// that were removed.
    pub async fn prune(&self) -> Result<Vec<String>> {
        let (key, value) = DISCOVERY_LABEL;
        let ids = self
            .runtime
            .list_labeled(key, value)
            .await
            .map_err(|e| BoxError::ContainerListFailed {
                label: format!("{}={}", key, value),
                reason: e.to_string(),
            })?;

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            match self.discard(&id).await {
                Ok(()) => {
                    tracing::info!("Removed orphaned container {}", id);
                    removed.push(id);
                }
                Err(e) => tracing::warn!("Failed to remove container {}: {}", id, e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;
    use secrecy::SecretString;

    use super::*;
    use crate::testing::{FakeRuntime, RuntimeCall};

    fn defaulted(config: BoxConfig) -> BoxConfig {
        let mut config = config;
        config.apply_defaults();
        config
    }

    #[test]
    fn test_spec_without_password_allows_empty() {
        let config = defaulted(BoxConfig::default());
        let spec = container_spec(&config, None);

        assert_eq!(
            spec.env,
            vec![
                "MYSQL_DATABASE=testing".to_string(),
                "MYSQL_ALLOW_EMPTY_PASSWORD=1".to_string()
            ]
        );
        assert_eq!(spec.container_port, "3306/tcp");
        assert_eq!(spec.host_port, 0);
        assert_eq!(spec.labels.get("dev.mysqlbox.managed").map(String::as_str), Some("1"));
        assert!(spec.bind_mount.is_none());
    }

    #[test]
    fn test_spec_with_password_and_script() {
        let config = defaulted(BoxConfig {
            root_password: Some(SecretString::from("root_pass".to_string())),
            database: "shop".to_string(),
            port: 3307,
            ..Default::default()
        });
        let spec = container_spec(&config, Some(Path::new("/tmp/schema-x.sql")));

        assert_eq!(
            spec.env,
            vec![
                "MYSQL_DATABASE=shop".to_string(),
                "MYSQL_ROOT_PASSWORD=root_pass".to_string()
            ]
        );
        assert_eq!(spec.host_port, 3307);
        assert_eq!(
            spec.bind_mount,
            Some((
                PathBuf::from("/tmp/schema-x.sql"),
                "/docker-entrypoint-initdb.d/schema.sql".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_create_pulls_missing_image_once() {
        let runtime = Arc::new(FakeRuntime::new().with_missing_image());
        let controller = ContainerController::new(runtime.clone());
        let spec = container_spec(&defaulted(BoxConfig::default()), None);

        let id = controller.create(&spec).await.unwrap();

        assert!(!id.is_empty());
        assert_eq!(
            runtime.calls(),
            vec![
                RuntimeCall::Create,
                RuntimeCall::Pull("mysql:8".to_string()),
                RuntimeCall::Create,
            ]
        );
    }

    #[tokio::test]
    async fn test_create_fails_after_single_retry() {
        let runtime = Arc::new(FakeRuntime::new().with_image_never_available());
        let controller = ContainerController::new(runtime.clone());
        let spec = container_spec(&defaulted(BoxConfig::default()), None);

        let err = controller.create(&spec).await.unwrap_err();

        assert!(matches!(err, BoxError::ContainerCreationFailed { .. }));
        let pulls = runtime
            .calls()
            .into_iter()
            .filter(|c| matches!(c, RuntimeCall::Pull(_)))
            .count();
        assert_eq!(pulls, 1);
    }

    #[tokio::test]
    async fn test_create_other_failure_does_not_pull() {
        let runtime = Arc::new(
            FakeRuntime::new().with_create_error(RuntimeError::Api("conflict".to_string())),
        );
        let controller = ContainerController::new(runtime.clone());
        let spec = container_spec(&defaulted(BoxConfig::default()), None);

        let err = controller.create(&spec).await.unwrap_err();

        assert!(err.to_string().contains("conflict"));
        assert_eq!(runtime.calls(), vec![RuntimeCall::Create]);
    }

    #[tokio::test]
    async fn test_pull_failure_is_reported() {
        let runtime = Arc::new(FakeRuntime::new().with_missing_image().with_pull_error("denied"));
        let controller = ContainerController::new(runtime);
        let spec = container_spec(&defaulted(BoxConfig::default()), None);

        let err = controller.create(&spec).await.unwrap_err();
        assert!(matches!(err, BoxError::ImagePullFailed { ref reason, .. } if reason == "denied"));
    }

    #[tokio::test]
    async fn test_resolve_port() {
        let runtime = Arc::new(FakeRuntime::new().with_host_port("49153"));
        let controller = ContainerController::new(runtime);
        assert_eq!(controller.resolve_port("abc").await.unwrap(), 49153);
    }

    #[tokio::test]
    async fn test_resolve_port_without_binding() {
        let runtime = Arc::new(FakeRuntime::new().without_host_port());
        let controller = ContainerController::new(runtime);

        let err = controller.resolve_port("abc").await.unwrap_err();
        assert!(
            matches!(err, BoxError::PortResolutionFailed { ref reason, .. } if reason == "no port bindings")
        );
    }

    #[tokio::test]
    async fn test_stop_tolerates_already_removed() {
        let runtime = Arc::new(FakeRuntime::new().with_wait_error(RuntimeError::NotFound(
            "No such container".to_string(),
        )));
        let controller = ContainerController::new(runtime.clone());

        controller.stop("abc").await.unwrap();
        assert_eq!(
            runtime.calls(),
            vec![
                RuntimeCall::Stop("abc".to_string(), STOP_GRACE),
                RuntimeCall::WaitRemoved("abc".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_surfaces_wait_errors() {
        let runtime = Arc::new(
            FakeRuntime::new().with_wait_error(RuntimeError::Api("daemon gone".to_string())),
        );
        let controller = ContainerController::new(runtime);

        let err = controller.stop("abc").await.unwrap_err();
        assert!(matches!(err, BoxError::RemovalWaitFailed { .. }));
    }

    #[tokio::test]
    async fn test_stop_failure_skips_wait() {
        let runtime = Arc::new(
            FakeRuntime::new().with_stop_error(RuntimeError::Api("permission denied".to_string())),
        );
        let controller = ContainerController::new(runtime.clone());

        let err = controller.stop("abc").await.unwrap_err();
        assert!(matches!(err, BoxError::ContainerStopFailed { .. }));
        assert_eq!(
            runtime.calls(),
            vec![RuntimeCall::Stop("abc".to_string(), STOP_GRACE)]
        );
    }

    #[tokio::test]
    async fn test_prune_removes_labeled_containers() {
        let runtime = Arc::new(FakeRuntime::new());
        let controller = ContainerController::new(runtime.clone());
        let spec = container_spec(&defaulted(BoxConfig::default()), None);
        let first = controller.create(&spec).await.unwrap();
        let second = controller.create(&spec).await.unwrap();

        let mut removed = controller.prune().await.unwrap();
        removed.sort();
        let mut expected = vec![first, second];
        expected.sort();

        assert_eq!(removed, expected);
        assert!(runtime.containers().is_empty());
    }

    #[tokio::test]
    async fn test_discard_failure_is_a_removal_error() {
        let runtime = Arc::new(
            FakeRuntime::new().with_remove_error(RuntimeError::Api("device busy".to_string())),
        );
        let controller = ContainerController::new(runtime);

        let err = controller.discard("abc").await.unwrap_err();
        assert!(matches!(err, BoxError::ContainerRemovalFailed { ref id, .. } if id == "abc"));
    }

    #[tokio::test]
    async fn test_prune_listing_failure() {
        let runtime = Arc::new(
            FakeRuntime::new().with_list_error(RuntimeError::Api("filter rejected".to_string())),
        );
        let controller = ContainerController::new(runtime);

        let err = controller.prune().await.unwrap_err();
        match err {
            BoxError::ContainerListFailed { label, reason } => {
                assert_eq!(label, format!("{}={}", DISCOVERY_LABEL.0, DISCOVERY_LABEL.1));
                assert!(reason.contains("filter rejected"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
