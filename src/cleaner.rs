//! Table truncation between tests.

use std::collections::HashSet;

use sqlx::mysql::MySqlPool;

use crate::error::{BoxError, Result};

const LIST_TABLES_SQL: &str = "SELECT CAST(table_name AS CHAR) FROM information_schema.tables \
     WHERE table_schema = ? AND table_type = 'BASE TABLE' ORDER BY table_name";

/// Quote an identifier with backticks, doubling any embedded backtick.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// The tables from `all` that are not in `excluded`, in their original order.
pub fn tables_to_clean(all: Vec<String>, excluded: &HashSet<String>) -> Vec<String> {
    all.into_iter().filter(|t| !excluded.contains(t)).collect()
}

/// Outcome of a best-effort [`TableCleaner::clean_tables`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    /// Tables that were truncated.
    pub truncated: Vec<String>,
    /// Tables that could not be truncated, with the reason.
    pub failed: Vec<(String, String)>,
}

impl CleanReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Truncates tables of one database.
pub struct TableCleaner<'a> {
    pool: &'a MySqlPool,
    database: &'a str,
    excluded: &'a HashSet<String>,
}

impl<'a> TableCleaner<'a> {
    pub fn new(pool: &'a MySqlPool, database: &'a str, excluded: &'a HashSet<String>) -> Self {
        Self {
            pool,
            database,
            excluded,
        }
    }

    /// Current base tables of the database, read fresh from the catalog.
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(LIST_TABLES_SQL)
            .bind(self.database)
            .fetch_all(self.pool)
            .await
            .map_err(|e| BoxError::TableCatalog {
                reason: e.to_string(),
            })
    }

    /// Truncate every table not in the exclusion set. Stops at the first
    /// failure. Returns the truncated tables.
    pub async fn clean_all(&self) -> Result<Vec<String>> {
        let tables = tables_to_clean(self.list_tables().await?, self.excluded);

        for table in &tables {
            self.truncate(table).await?;
        }

        tracing::debug!(
            "Truncated {} table(s) in '{}'",
            tables.len(),
            self.database
        );
        Ok(tables)
    }

    /// Truncate exactly the named tables, ignoring the exclusion set.
    /// Failures are logged and reported, never returned.
    pub async fn clean_tables<S: AsRef<str>>(&self, names: &[S]) -> CleanReport {
        let mut report = CleanReport::default();

        for name in names.iter().map(AsRef::as_ref) {
            match self.truncate(name).await {
                Ok(()) => report.truncated.push(name.to_string()),
                Err(e) => {
                    tracing::warn!("Could not clean table '{}': {}", name, e);
                    report.failed.push((name.to_string(), e.to_string()));
                }
            }
        }

        report
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        let statement = format!("TRUNCATE TABLE {}", quote_identifier(table));
        sqlx::query(&statement)
            .execute(self.pool)
            .await
            .map(|_| ())
            .map_err(|e| BoxError::TruncateFailed {
                table: table.to_string(),
                reason: e.to_string(),
            })
    }
}
