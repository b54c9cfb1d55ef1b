use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use vigil_core::{RegistryDocument, RegistryStore, ServerEntry, UserRegistry};

/// Name given to a server migrated from the legacy single-server layout.
const LEGACY_ENTRY_NAME: &str = "default";

/// Whole-document JSON store. Callers serialize load -> mutate -> save
/// through the registry manager's lock; this type does plain file IO.
pub struct JsonRegistryStore {
    path: PathBuf,
}

impl JsonRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Accepts both persisted layouts: the canonical multi-server registry and
/// the legacy flat single-server value, which is migrated on load and never
/// written back in its old form.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRegistry {
    Multi(UserRegistry),
    Legacy {
        server_ip: String,
        secret_key: String,
    },
}

impl From<StoredRegistry> for UserRegistry {
    fn from(stored: StoredRegistry) -> Self {
        match stored {
            StoredRegistry::Multi(registry) => registry,
            StoredRegistry::Legacy {
                server_ip,
                secret_key,
            } => {
                let mut registry = UserRegistry::default();
                registry.servers.insert(
                    LEGACY_ENTRY_NAME.to_string(),
                    ServerEntry {
                        address: server_ip,
                        secret: secret_key,
                    },
                );
                registry.active_server = Some(LEGACY_ENTRY_NAME.to_string());
                registry
            }
        }
    }
}

#[async_trait]
impl RegistryStore for JsonRegistryStore {
    async fn load(&self) -> Result<RegistryDocument> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "registry file absent, starting empty");
                return Ok(RegistryDocument::new());
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read registry file {}", self.path.display())
                });
            }
        };

        match serde_json::from_slice::<std::collections::BTreeMap<String, StoredRegistry>>(&bytes)
        {
            Ok(stored) => Ok(stored
                .into_iter()
                .map(|(user_id, registry)| (user_id, registry.into()))
                .collect()),
            Err(err) => {
                // Cold-start tolerance: an unparsable document behaves like a
                // missing one. The broken file is replaced on the next save.
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "registry file unparsable, starting empty"
                );
                Ok(RegistryDocument::new())
            }
        }
    }

    async fn save(&self, document: &RegistryDocument) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(document).context("failed to serialize registry")?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create registry directory {}", parent.display())
                })?;
            }
        }
        tokio::fs::write(&self.path, bytes)
            .await
            .with_context(|| format!("failed to write registry file {}", self.path.display()))?;
        Ok(())
    }
}
