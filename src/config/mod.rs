//! Box configuration.

mod helpers;

use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{optional_env, parse_list, parse_optional_env};
use crate::connection::DriverLog;
use crate::error::ConfigError;
use crate::logs::{ErrorLog, LogSink};
use crate::script::ScriptPayload;

/// Image used when none is configured.
pub const DEFAULT_IMAGE: &str = "mysql:8";

/// Database created when none is configured.
pub const DEFAULT_DATABASE: &str = "testing";

/// Prefix of generated container names.
pub const CONTAINER_NAME_PREFIX: &str = "mysqlbox-";

/// Settings for a MySQL box.
///
/// Blank fields are filled by [`BoxConfig::apply_defaults`] when the box
/// starts; after that the configuration is read-only.
///
/// ```rust,no_run
/// use mysqlbox::{BoxConfig, ErrorLog, ScriptPayload};
///
/// let errors = ErrorLog::new();
/// let config = BoxConfig {
///     initial_sql: Some(ScriptPayload::from_bytes("CREATE TABLE users (id INT);")),
///     keep_tables: vec!["categories".to_string()],
///     logged_errors: Some(errors.clone()),
///     ..Default::default()
/// };
/// ```
#[derive(Default)]
pub struct BoxConfig {
    /// Container name. Generated as `mysqlbox-<random>` when blank.
    pub container_name: String,
    /// Docker image. Defaults to `mysql:8`.
    pub image: String,
    /// Database to create. Defaults to `testing`.
    pub database: String,
    /// Password of the MySQL root user. `None` allows an empty password.
    pub root_password: Option<SecretString>,
    /// Host port bound to the server's 3306 (0 = let Docker choose).
    pub port: u16,
    /// Script run by the server on first boot.
    pub initial_sql: Option<ScriptPayload>,
    /// Tables never truncated by `clean_all_tables`.
    pub keep_tables: Vec<String>,
    /// Destination of the container's stdout.
    pub stdout: Option<LogSink>,
    /// Destination of the container's stderr.
    pub stderr: Option<LogSink>,
    /// Collector for `ERROR` lines printed on the container's stderr.
    pub logged_errors: Option<ErrorLog>,
    /// Buffer receiving database driver diagnostics. A fresh one is used
    /// when unset.
    pub driver_log: Option<DriverLog>,
}

impl BoxConfig {
    /// Build a configuration from `MYSQLBOX_*` environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `MYSQLBOX_IMAGE` | `image` |
    /// | `MYSQLBOX_CONTAINER_NAME` | `container_name` |
    /// | `MYSQLBOX_DATABASE` | `database` |
    /// | `MYSQLBOX_ROOT_PASSWORD` | `root_password` |
    /// | `MYSQLBOX_PORT` | `port` |
    /// | `MYSQLBOX_KEEP_TABLES` | `keep_tables` (comma separated) |
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            container_name: optional_env("MYSQLBOX_CONTAINER_NAME")?.unwrap_or_default(),
            image: optional_env("MYSQLBOX_IMAGE")?.unwrap_or_default(),
            database: optional_env("MYSQLBOX_DATABASE")?.unwrap_or_default(),
            root_password: optional_env("MYSQLBOX_ROOT_PASSWORD")?.map(SecretString::from),
            port: parse_optional_env("MYSQLBOX_PORT", 0)?,
            keep_tables: optional_env("MYSQLBOX_KEEP_TABLES")?
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            ..Default::default()
        })
    }

    /// Fill blank fields with their defaults.
    pub fn apply_defaults(&mut self) {
        if self.image.is_empty() {
            self.image = DEFAULT_IMAGE.to_string();
        }
        if self.database.is_empty() {
            self.database = DEFAULT_DATABASE.to_string();
        }
        if self.container_name.is_empty() {
            self.container_name = generate_container_name();
        }
    }

    /// The root password, if one is set and non-empty.
    pub fn root_password(&self) -> Option<&str> {
        self.root_password
            .as_ref()
            .map(|p| p.expose_secret())
            .filter(|p| !p.is_empty())
    }
}

impl std::fmt::Debug for BoxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxConfig")
            .field("container_name", &self.container_name)
            .field("image", &self.image)
            .field("database", &self.database)
            .field("root_password", &self.root_password.as_ref().map(|_| "[REDACTED]"))
            .field("port", &self.port)
            .field("initial_sql", &self.initial_sql)
            .field("keep_tables", &self.keep_tables)
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("logged_errors", &self.logged_errors.is_some())
            .field("driver_log", &self.driver_log.is_some())
            .finish()
    }
}

fn generate_container_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", CONTAINER_NAME_PREFIX, &id[..12])
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_apply_defaults_fills_blanks() {
        let mut config = BoxConfig::default();
        config.apply_defaults();

        assert_eq!(config.image, "mysql:8");
        assert_eq!(config.database, "testing");
        assert!(config.container_name.starts_with("mysqlbox-"));
        assert_eq!(config.container_name.len(), "mysqlbox-".len() + 12);
        assert_eq!(config.port, 0);
    }

    #[test]
    fn test_apply_defaults_keeps_explicit_values() {
        let mut config = BoxConfig {
            container_name: "my-db".to_string(),
            image: "mysql:8.0.36".to_string(),
            database: "shop".to_string(),
            port: 13306,
            ..Default::default()
        };
        config.apply_defaults();

        assert_eq!(config.container_name, "my-db");
        assert_eq!(config.image, "mysql:8.0.36");
        assert_eq!(config.database, "shop");
        assert_eq!(config.port, 13306);
    }

    #[test]
    fn test_generated_names_are_unique() {
        assert_ne!(generate_container_name(), generate_container_name());
    }

    #[test]
    fn test_empty_root_password_is_none() {
        let config = BoxConfig {
            root_password: Some(SecretString::from(String::new())),
            ..Default::default()
        };
        assert_eq!(config.root_password(), None);

        let config = BoxConfig {
            root_password: Some(SecretString::from("s3cret".to_string())),
            ..Default::default()
        };
        assert_eq!(config.root_password(), Some("s3cret"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = BoxConfig {
            root_password: Some(SecretString::from("s3cret".to_string())),
            ..Default::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("[REDACTED]"));
    }

    /// Serializes env-mutating tests to prevent parallel races.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: [&str; 6] = [
        "MYSQLBOX_IMAGE",
        "MYSQLBOX_CONTAINER_NAME",
        "MYSQLBOX_DATABASE",
        "MYSQLBOX_ROOT_PASSWORD",
        "MYSQLBOX_PORT",
        "MYSQLBOX_KEEP_TABLES",
    ];

    fn clear_box_env() {
        // SAFETY: Only called under ENV_MUTEX in tests.
        unsafe {
            for key in ENV_KEYS {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_from_env_unset_and_blank_fall_back() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_box_env();

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("MYSQLBOX_DATABASE", "   ");
            std::env::set_var("MYSQLBOX_PORT", "");
        }

        let mut config = BoxConfig::from_env().expect("resolve should succeed");
        clear_box_env();

        assert_eq!(config.port, 0);
        assert!(config.root_password.is_none());
        assert!(config.keep_tables.is_empty());

        config.apply_defaults();
        assert_eq!(config.image, DEFAULT_IMAGE);
        assert_eq!(config.database, DEFAULT_DATABASE);
        assert!(config.container_name.starts_with(CONTAINER_NAME_PREFIX));
    }

    #[test]
    fn test_from_env_reads_values() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_box_env();

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("MYSQLBOX_IMAGE", "mysql:8.0.36");
            std::env::set_var("MYSQLBOX_DATABASE", "shop");
            std::env::set_var("MYSQLBOX_ROOT_PASSWORD", "s3cret");
            std::env::set_var("MYSQLBOX_PORT", " 3307 ");
            std::env::set_var("MYSQLBOX_KEEP_TABLES", "categories, countries,,");
        }

        let config = BoxConfig::from_env().expect("resolve should succeed");
        clear_box_env();

        assert_eq!(config.image, "mysql:8.0.36");
        assert_eq!(config.database, "shop");
        assert_eq!(config.root_password(), Some("s3cret"));
        assert_eq!(config.port, 3307);
        assert_eq!(
            config.keep_tables,
            vec!["categories".to_string(), "countries".to_string()]
        );
    }

    #[test]
    fn test_from_env_invalid_port() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_box_env();

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("MYSQLBOX_PORT", "not-a-port");
        }

        let result = BoxConfig::from_env();
        clear_box_env();

        match result {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "MYSQLBOX_PORT"),
            other => panic!("expected invalid MYSQLBOX_PORT, got {:?}", other),
        }
    }
}
