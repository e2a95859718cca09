//! Disposable MySQL servers in Docker containers, for integration tests.
//!
//! A [`MySqlBox`] is a MySQL server started in a throwaway container:
//!
//! - the image is pulled on demand and the container is labelled so
//!   orphans can be pruned
//! - an optional initial SQL script is mounted and run by the server on
//!   first boot
//! - startup waits until the server accepts connections, and fails fast if
//!   the container exits first (typically a broken script)
//! - container stdout/stderr can be captured, and `ERROR` lines on stderr
//!   are collected into an [`ErrorLog`]
//! - tables can be truncated between tests, keeping reference tables intact
//!
//! ```rust,no_run
//! # async fn demo() -> mysqlbox::Result<()> {
//! use mysqlbox::{BoxConfig, MySqlBox, ScriptPayload};
//!
//! let mysql = MySqlBox::start(BoxConfig {
//!     initial_sql: Some(ScriptPayload::from_file("tests/testdata/schema.sql")?),
//!     keep_tables: vec!["categories".to_string()],
//!     ..Default::default()
//! })
//! .await?;
//!
//! // ... run tests against mysql.pool() or mysql.dsn() ...
//! mysql.clean_all_tables().await?;
//!
//! mysql.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod cleaner;
pub mod cli;
pub mod config;
pub mod connection;
pub mod container;
pub mod error;
pub mod instance;
pub mod logs;
pub mod readiness;
pub mod runtime;
pub mod script;
pub mod testing;

pub use cleaner::CleanReport;
pub use config::BoxConfig;
pub use connection::DriverLog;
pub use error::{BoxError, ConfigError, Result};
pub use instance::{BoxHandle, MySqlBox};
pub use logs::{ErrorLog, LogSink, SharedBuffer};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use script::ScriptPayload;
