use super::{app_dir, PersistedConnection};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONNECTION_FILE: &str = "connection.toml";

/// Reads and writes the broker endpoint that survives restarts
#[derive(Clone, Debug)]
pub struct ConnectionStore {
    path: PathBuf,
}

impl ConnectionStore {
    /// Store inside the per-user application directory
    pub fn default_location() -> Self {
        Self::in_dir(app_dir())
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CONNECTION_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the saved endpoint; `None` when nothing was saved yet
    pub async fn load(&self) -> Result<Option<PersistedConnection>> {
        if !tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| eyre!("Failed to check if connection file exists: {}", e))?
        {
            debug!("No saved connection at {}", self.path.display());
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| eyre!("Failed to read connection file: {}", e))?;

        let connection = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse connection file: {}", e))?;
        Ok(Some(connection))
    }

    /// Like [`ConnectionStore::load`], but falls back to `None` on any error
    pub async fn load_or_warn(&self) -> Option<PersistedConnection> {
        match self.load().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Ignoring saved connection: {}", e);
                None
            }
        }
    }

    pub async fn save(&self, connection: &PersistedConnection) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(connection)
            .map_err(|e| eyre!("Failed to serialize connection: {}", e))?;

        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| eyre!("Failed to write connection file: {}", e))?;

        info!(
            "Saved connection {}:{} to {}",
            connection.host,
            connection.port,
            self.path.display()
        );
        Ok(())
    }
}
