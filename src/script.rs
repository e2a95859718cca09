//! Initial SQL script payloads and the temp file they are bound from.
//!
//! The MySQL image runs every `*.sql` file found in
//! `/docker-entrypoint-initdb.d` against the configured database on first
//! boot. A [`ScriptPayload`] is materialized once into a [`ScriptArtifact`]
//! on the host, which is then bind-mounted read-only into that directory.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempPath};

use crate::error::{BoxError, Result};

/// Path inside the container where the script artifact is mounted.
pub const SCRIPT_MOUNT_TARGET: &str = "/docker-entrypoint-initdb.d/schema.sql";

/// SQL executed by the server when the container initializes.
#[derive(Clone, PartialEq, Eq)]
pub struct ScriptPayload {
    bytes: Vec<u8>,
}

impl ScriptPayload {
    /// Use an in-memory buffer as the script.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Read the whole script from a reader.
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| BoxError::Script {
                reason: format!("failed to read script: {}", e),
            })?;
        Ok(Self { bytes })
    }

    /// Read the whole script from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| BoxError::Script {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Write the script to a fresh temp file that the container can read.
    pub fn materialize(&self) -> Result<ScriptArtifact> {
        let mut file = tempfile::Builder::new()
            .prefix("schema-")
            .suffix(".sql")
            .tempfile()
            .map_err(|e| BoxError::Script {
                reason: format!("failed to create temp file: {}", e),
            })?;

        write_all(&mut file, &self.bytes)?;

        // The entrypoint reads init scripts as the unprivileged mysql user.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644))?;
        }

        let path = file.into_temp_path();
        tracing::debug!("Wrote initial script to {}", path.display());

        Ok(ScriptArtifact { path: Some(path) })
    }
}

impl std::fmt::Debug for ScriptPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptPayload")
            .field("len", &self.bytes.len())
            .finish()
    }
}

fn write_all(file: &mut NamedTempFile, bytes: &[u8]) -> Result<()> {
    file.write_all(bytes)
        .and_then(|_| file.flush())
        .map_err(|e| BoxError::Script {
            reason: format!("failed to write temp file: {}", e),
        })
}

/// A script written to the host filesystem.
///
/// The file is deleted exactly once: by [`ScriptArtifact::delete`] or, if
/// that is never called, when the artifact is dropped.
#[derive(Debug)]
pub struct ScriptArtifact {
    path: Option<TempPath>,
}

impl ScriptArtifact {
    /// Host path of the file, if it still exists.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn path_buf(&self) -> Option<PathBuf> {
        self.path().map(Path::to_path_buf)
    }

    /// Delete the file now. Later calls are no-ops.
    pub fn delete(&mut self) {
        if let Some(path) = self.path.take() {
            let shown = path.display().to_string();
            if let Err(e) = path.close() {
                tracing::warn!("Failed to delete script artifact {}: {}", shown, e);
            } else {
                tracing::debug!("Deleted script artifact {}", shown);
            }
        }
    }
}
