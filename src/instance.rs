//! The running MySQL box and its possibly-absent handle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::mysql::MySqlPool;

use crate::cleaner::{CleanReport, TableCleaner};
use crate::config::BoxConfig;
use crate::connection::{ConnectionManager, DriverLog};
use crate::container::{ContainerController, container_spec};
use crate::error::{BoxError, Result};
use crate::logs::{LogMultiplexer, LogSinks};
use crate::readiness::ReadinessPoller;
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::script::{ScriptArtifact, ScriptPayload};

/// How long `stop` waits for pooled connections to be released.
const POOL_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A MySQL server running in a Docker container.
///
/// A `MySqlBox` only exists once the server accepts connections. Call
/// [`stop`](Self::stop) when done; dropping it without stopping leaves the
/// container running.
///
/// ```rust,no_run
/// # async fn demo() -> mysqlbox::Result<()> {
/// use mysqlbox::{BoxConfig, MySqlBox};
///
/// let mysql = MySqlBox::start(BoxConfig::default()).await?;
/// sqlx::query("CREATE TABLE users (id INT)").execute(mysql.pool()).await.ok();
/// mysql.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct MySqlBox {
    controller: ContainerController,
    container_id: String,
    container_name: String,
    connection: ConnectionManager,
    dsn: String,
    pool: MySqlPool,
    keep_tables: HashSet<String>,
    logs: Option<LogMultiplexer>,
    script: Option<ScriptArtifact>,
    stopped: bool,
}

impl MySqlBox {
    /// Start a box on the local Docker daemon.
    pub async fn start(config: BoxConfig) -> Result<Self> {
        let runtime = DockerRuntime::connect().await?;
        Self::start_with_runtime(config, Arc::new(runtime)).await
    }

    /// Start a box on the given container runtime.
    pub async fn start_with_runtime(
        config: BoxConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        Self::start_with(config, runtime, ReadinessPoller::default()).await
    }

    pub(crate) async fn start_with(
        mut config: BoxConfig,
        runtime: Arc<dyn ContainerRuntime>,
        poller: ReadinessPoller,
    ) -> Result<Self> {
        config.apply_defaults();
        let name = config.container_name.clone();
        tracing::info!("Starting MySQL box '{}' from {}", name, config.image);

        let mut script = config
            .initial_sql
            .as_ref()
            .map(ScriptPayload::materialize)
            .transpose()?;
        let spec = container_spec(&config, script.as_ref().and_then(ScriptArtifact::path));
        let controller = ContainerController::new(runtime);

        let id = match controller.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                delete_script(&mut script);
                return Err(e);
            }
        };

        if let Err(e) = controller.start(&id, &name).await {
            if let Err(cleanup) = controller.discard(&id).await {
                tracing::warn!("Failed to remove container '{}': {}", name, cleanup);
            }
            delete_script(&mut script);
            return Err(e);
        }

        let sinks = LogSinks::new(config.stdout.take(), config.stderr.take());
        let (logs, mut exited) = LogMultiplexer::spawn(
            controller.runtime().logs(&id),
            sinks,
            config.logged_errors.clone(),
        );

        let driver_log = config.driver_log.clone().unwrap_or_default();
        let connected = async {
            let port = controller.resolve_port(&id).await?;
            let connection = ConnectionManager::new(
                port,
                config.database.clone(),
                config.root_password(),
                driver_log,
            );
            let dsn = connection.dsn(connection.database())?;
            let pool = connection.open_pool(connection.database());

            tracing::debug!("Waiting for MySQL on {}", connection.addr());
            if let Err(e) = poller.wait_ready(&connection, &mut exited, &name).await {
                pool.close().await;
                return Err(e);
            }
            Ok((connection, dsn, pool))
        }
        .await;

        match connected {
            Ok((connection, dsn, pool)) => {
                tracing::info!("MySQL box '{}' ready at {}", name, connection.addr());
                Ok(Self {
                    controller,
                    container_id: id,
                    container_name: name,
                    connection,
                    dsn,
                    pool,
                    keep_tables: config.keep_tables.iter().cloned().collect(),
                    logs: Some(logs),
                    script,
                    stopped: false,
                })
            }
            Err(e) => {
                tracing::warn!("MySQL box '{}' failed to start: {}", name, e);
                logs.begin_shutdown();
                if let Err(cleanup) = controller.stop(&id).await {
                    tracing::warn!("Failed to stop container '{}': {}", name, cleanup);
                }
                if let Err(cleanup) = logs.shutdown().await {
                    tracing::warn!("Container '{}' log stream failed: {}", name, cleanup);
                }
                delete_script(&mut script);
                Err(e)
            }
        }
    }

    /// DSN of the default database.
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    /// Pool connected to the default database.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    pub fn port(&self) -> u16 {
        self.connection.port()
    }

    /// `127.0.0.1:<port>`.
    pub fn addr(&self) -> String {
        self.connection.addr()
    }

    pub fn root_password(&self) -> Option<&str> {
        self.connection.root_password()
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn database(&self) -> &str {
        self.connection.database()
    }

    pub fn driver_log(&self) -> &DriverLog {
        self.connection.driver_log()
    }

    /// Whether the container's log stream has ended, i.e. the container
    /// is gone.
    pub fn has_exited(&self) -> bool {
        self.logs.as_ref().is_some_and(LogMultiplexer::is_finished)
    }

    /// Pool and DSN for another database on this server.
    pub fn connect_db(&self, name: &str) -> Result<(MySqlPool, String)> {
        self.connection.connect_db(name)
    }

    /// Truncate every table of the default database except the configured
    /// keep-tables. Returns the truncated tables.
    pub async fn clean_all_tables(&self) -> Result<Vec<String>> {
        self.cleaner().clean_all().await
    }

    /// Truncate exactly `names`, even keep-tables. Failures are logged and
    /// reported in the returned [`CleanReport`].
    pub async fn clean_tables<S: AsRef<str>>(&self, names: &[S]) -> CleanReport {
        self.cleaner().clean_tables(names).await
    }

    fn cleaner(&self) -> TableCleaner<'_> {
        TableCleaner::new(&self.pool, self.connection.database(), &self.keep_tables)
    }

    /// Stop the server and release everything the box holds.
    ///
    /// Every step runs even if an earlier one fails; the first error is
    /// returned.
    pub async fn stop(mut self) -> Result<()> {
        self.stopped = true;
        tracing::info!("Stopping MySQL box '{}'", self.container_name);

        let logs = self.logs.take();
        if let Some(logs) = &logs {
            logs.begin_shutdown();
        }

        let mut first_error = None;
        if let Err(e) = self.controller.stop(&self.container_id).await {
            tracing::warn!("Failed to stop container '{}': {}", self.container_name, e);
            first_error = Some(e);
        }

        // Connections still checked out by the caller keep close() pending
        // until they are dropped. The pool is marked closed either way.
        if tokio::time::timeout(POOL_CLOSE_TIMEOUT, self.pool.close())
            .await
            .is_err()
        {
            tracing::warn!(
                "Pool of MySQL box '{}' still has connections in use after {:?}",
                self.container_name,
                POOL_CLOSE_TIMEOUT
            );
        }

        if let Some(logs) = logs {
            match logs.shutdown().await {
                Ok(end) => tracing::debug!("Log stream finished: {:?}", end),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        delete_script(&mut self.script);

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Stopped MySQL box '{}'", self.container_name);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for MySqlBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlBox")
            .field("container_name", &self.container_name)
            .field("container_id", &self.container_id)
            .field("addr", &self.connection.addr())
            .field("database", &self.connection.database())
            .finish()
    }
}

impl Drop for MySqlBox {
    fn drop(&mut self) {
        if !self.stopped {
            tracing::warn!(
                "MySqlBox '{}' dropped without stop(), container may remain running",
                self.container_name
            );
        }
    }
}

fn delete_script(script: &mut Option<ScriptArtifact>) {
    if let Some(mut artifact) = script.take() {
        artifact.delete();
    }
}

/// A box that may or may not be running.
///
/// Every operation on an empty handle fails with
/// [`BoxError::InstanceAbsent`].
#[derive(Debug, Default)]
pub struct BoxHandle {
    instance: Option<MySqlBox>,
}

impl BoxHandle {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start a box on the local Docker daemon.
    pub async fn start(config: BoxConfig) -> Result<Self> {
        Ok(Self::from(MySqlBox::start(config).await?))
    }

    pub fn is_running(&self) -> bool {
        self.instance.is_some()
    }

    pub fn get(&self) -> Result<&MySqlBox> {
        self.instance.as_ref().ok_or(BoxError::InstanceAbsent)
    }

    pub fn into_inner(self) -> Option<MySqlBox> {
        self.instance
    }

    pub fn dsn(&self) -> Result<&str> {
        Ok(self.get()?.dsn())
    }

    pub fn pool(&self) -> Result<&MySqlPool> {
        Ok(self.get()?.pool())
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self.get()?.port())
    }

    pub fn addr(&self) -> Result<String> {
        Ok(self.get()?.addr())
    }

    pub fn root_password(&self) -> Result<Option<&str>> {
        Ok(self.get()?.root_password())
    }

    pub fn container_name(&self) -> Result<&str> {
        Ok(self.get()?.container_name())
    }

    pub fn database(&self) -> Result<&str> {
        Ok(self.get()?.database())
    }

    pub fn connect_db(&self, name: &str) -> Result<(MySqlPool, String)> {
        self.get()?.connect_db(name)
    }

    pub async fn clean_all_tables(&self) -> Result<Vec<String>> {
        self.get()?.clean_all_tables().await
    }

    pub async fn clean_tables<S: AsRef<str>>(&self, names: &[S]) -> Result<CleanReport> {
        Ok(self.get()?.clean_tables(names).await)
    }

    /// Stop the box, leaving the handle empty.
    pub async fn stop(&mut self) -> Result<()> {
        self.instance
            .take()
            .ok_or(BoxError::InstanceAbsent)?
            .stop()
            .await
    }
}

impl From<MySqlBox> for BoxHandle {
    fn from(instance: MySqlBox) -> Self {
        Self {
            instance: Some(instance),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::logs::{ErrorLog, SharedBuffer};
    use crate::runtime::RuntimeError;
    use crate::testing::{FakeRuntime, RuntimeCall};

    const MISSING_TABLE: &str =
        "ERROR 1146 (42S02) at line 2: Table 'testing.sales' doesn't exist";

    fn quick_poller() -> ReadinessPoller {
        ReadinessPoller::new()
            .with_interval(Duration::from_millis(20))
            .with_deadline(Duration::from_millis(200))
            .with_probe_timeout(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_start_failure_discards_container() {
        let runtime = Arc::new(
            FakeRuntime::new().with_start_error(RuntimeError::Api("no space left".to_string())),
        );

        let err = MySqlBox::start_with_runtime(BoxConfig::default(), runtime.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, BoxError::ContainerStartFailed { .. }));
        assert!(runtime.containers().is_empty());
        assert!(
            runtime
                .calls()
                .iter()
                .any(|c| matches!(c, RuntimeCall::Remove(_)))
        );
    }

    #[tokio::test]
    async fn test_creation_failure_is_returned() {
        let runtime = Arc::new(FakeRuntime::new().with_image_never_available());
        let config = BoxConfig {
            initial_sql: Some(ScriptPayload::from_bytes("CREATE TABLE t (id INT);")),
            ..Default::default()
        };

        let err = MySqlBox::start_with_runtime(config, runtime.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, BoxError::ContainerCreationFailed { .. }));
        assert!(runtime.created_specs().is_empty());
        assert!(
            !runtime
                .calls()
                .iter()
                .any(|c| matches!(c, RuntimeCall::Start(_)))
        );
    }

    #[tokio::test]
    async fn test_exited_early_collects_errors_and_cleans_up() {
        let errors = ErrorLog::new();
        let stdout = SharedBuffer::new();
        // Nothing listens on port 1, so every probe fails until the exit.
        let runtime = Arc::new(
            FakeRuntime::new()
                .with_host_port("1")
                .with_logs(
                    vec![
                        FakeRuntime::stdout("Initializing database files\n"),
                        FakeRuntime::stderr(&format!("{}\n", MISSING_TABLE)),
                    ],
                    false,
                ),
        );
        let config = BoxConfig {
            initial_sql: Some(ScriptPayload::from_bytes(
                "CREATE TABLE users (id INT);\nINSERT INTO sales VALUES (1);\n",
            )),
            stdout: Some(stdout.sink()),
            logged_errors: Some(errors.clone()),
            ..Default::default()
        };

        let err = MySqlBox::start_with_runtime(config, runtime.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, BoxError::ExitedEarly { .. }));
        assert_eq!(errors.lines(), vec![MISSING_TABLE.to_string()]);
        assert_eq!(stdout.to_string_lossy(), "Initializing database files\n");
        assert!(runtime.containers().is_empty());

        let specs = runtime.created_specs();
        let (script_path, target) = specs[0].bind_mount.clone().unwrap();
        assert_eq!(target, "/docker-entrypoint-initdb.d/schema.sql");
        assert!(!script_path.exists());
    }

    #[tokio::test]
    async fn test_timeout_stops_container() {
        let runtime = Arc::new(FakeRuntime::new().with_host_port("1"));
        let driver_log = DriverLog::new();
        let config = BoxConfig {
            driver_log: Some(driver_log.clone()),
            ..Default::default()
        };

        let err = MySqlBox::start_with(config, runtime.clone(), quick_poller())
            .await
            .unwrap_err();

        assert!(matches!(err, BoxError::ConnectTimeout { .. }));
        assert!(runtime.containers().is_empty());
        assert!(
            runtime
                .calls()
                .iter()
                .any(|c| matches!(c, RuntimeCall::Stop(_, _)))
        );
        assert!(!driver_log.is_empty());
    }

    #[tokio::test]
    async fn test_missing_port_binding_stops_container() {
        let runtime = Arc::new(FakeRuntime::new().without_host_port());

        let err = MySqlBox::start_with(BoxConfig::default(), runtime.clone(), quick_poller())
            .await
            .unwrap_err();

        assert!(matches!(err, BoxError::PortResolutionFailed { .. }));
        assert!(runtime.containers().is_empty());
    }

    #[tokio::test]
    async fn test_stop_with_connection_in_use() {
        // Accepts connections but never sends a handshake, so a checkout
        // stays in flight for as long as the test wants.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            let _ = accepted_tx.send(());
            std::future::pending::<()>().await;
        });

        let runtime = Arc::new(FakeRuntime::new());
        let mut config = BoxConfig {
            initial_sql: Some(ScriptPayload::from_bytes("CREATE TABLE t (id INT);")),
            ..Default::default()
        };
        config.apply_defaults();
        let script = config
            .initial_sql
            .as_ref()
            .map(ScriptPayload::materialize)
            .transpose()
            .unwrap();
        let script_path = script.as_ref().and_then(ScriptArtifact::path_buf).unwrap();

        let controller = ContainerController::new(runtime.clone());
        let spec = container_spec(&config, script.as_ref().and_then(ScriptArtifact::path));
        let id = controller.create(&spec).await.unwrap();
        controller.start(&id, &config.container_name).await.unwrap();

        let connection =
            ConnectionManager::new(port, config.database.clone(), None, DriverLog::new());
        let mysql = MySqlBox {
            controller,
            container_id: id,
            container_name: config.container_name.clone(),
            dsn: connection.dsn(connection.database()).unwrap(),
            pool: connection.open_pool(connection.database()),
            connection,
            keep_tables: HashSet::new(),
            logs: None,
            script,
            stopped: false,
        };

        let pool = mysql.pool().clone();
        let checkout = tokio::spawn(async move { pool.acquire().await });
        accepted_rx.await.unwrap();

        tokio::time::timeout(Duration::from_secs(15), mysql.stop())
            .await
            .expect("stop must not wait for the checked-out connection")
            .unwrap();

        assert!(runtime.containers().is_empty());
        assert!(!script_path.exists());
        checkout.abort();
    }

    #[tokio::test]
    async fn test_empty_handle_operations_fail() {
        let mut handle = BoxHandle::empty();

        assert!(!handle.is_running());
        assert!(matches!(handle.dsn(), Err(BoxError::InstanceAbsent)));
        assert!(matches!(handle.pool(), Err(BoxError::InstanceAbsent)));
        assert!(matches!(handle.port(), Err(BoxError::InstanceAbsent)));
        assert!(matches!(handle.addr(), Err(BoxError::InstanceAbsent)));
        assert!(matches!(handle.root_password(), Err(BoxError::InstanceAbsent)));
        assert!(matches!(handle.container_name(), Err(BoxError::InstanceAbsent)));
        assert!(matches!(handle.database(), Err(BoxError::InstanceAbsent)));
        assert!(matches!(handle.connect_db("other"), Err(BoxError::InstanceAbsent)));
        assert!(matches!(
            handle.clean_all_tables().await,
            Err(BoxError::InstanceAbsent)
        ));
        assert!(matches!(
            handle.clean_tables(&["users"]).await,
            Err(BoxError::InstanceAbsent)
        ));
        assert!(matches!(handle.stop().await, Err(BoxError::InstanceAbsent)));
        assert!(handle.into_inner().is_none());
    }
}
