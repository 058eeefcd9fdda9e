//! Restart-persistent storage for the last usage snapshot
//!
//! The session manager stores every snapshot it receives and loads the last
//! one once at construction, so a restarted process can show a usage picture
//! before its first network call completes. Loading is best effort: a
//! missing or unreadable cache is simply "no snapshot".
//!
//! `FileUsageCache` writes with temp-file + rename so a crash mid-write never
//! leaves a torn file, and serializes writers behind a tokio Mutex.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::usage::ProxyUsage;

/// Persistence boundary for the last known usage snapshot.
pub trait UsageCache: Send + Sync {
    /// Last stored snapshot, if any. Never fails; unreadable means `None`.
    fn load_usage_info(&self) -> Pin<Box<dyn Future<Output = Option<ProxyUsage>> + Send + '_>>;

    /// Replace the stored snapshot.
    fn store_usage_info<'a>(
        &'a self,
        usage: &'a ProxyUsage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Forget the stored snapshot.
    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// JSON file holding a single `ProxyUsage`.
pub struct FileUsageCache {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileUsageCache {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Option<ProxyUsage> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no cached usage");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read usage cache");
                return None;
            }
        };

        match serde_json::from_str::<ProxyUsage>(&contents) {
            Ok(usage) => {
                info!(
                    path = %self.path.display(),
                    remaining = usage.remaining,
                    max = usage.max,
                    "loaded cached usage"
                );
                Some(usage)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring corrupt usage cache");
                None
            }
        }
    }

    async fn store(&self, usage: &ProxyUsage) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.path, usage).await
    }

    async fn remove(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "cleared usage cache");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(format!("removing usage cache: {e}"))),
        }
    }
}

impl UsageCache for FileUsageCache {
    fn load_usage_info(&self) -> Pin<Box<dyn Future<Output = Option<ProxyUsage>> + Send + '_>> {
        Box::pin(self.load())
    }

    fn store_usage_info<'a>(
        &'a self,
        usage: &'a ProxyUsage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.store(usage))
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.remove())
    }
}

/// In-process cache. Used when persistence is disabled, and in tests.
#[derive(Default)]
pub struct MemoryUsageCache {
    slot: Mutex<Option<ProxyUsage>>,
}

impl MemoryUsageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded cache, as if a previous process had stored `usage`.
    pub fn with_usage(usage: ProxyUsage) -> Self {
        Self {
            slot: Mutex::new(Some(usage)),
        }
    }
}

impl UsageCache for MemoryUsageCache {
    fn load_usage_info(&self) -> Pin<Box<dyn Future<Output = Option<ProxyUsage>> + Send + '_>> {
        Box::pin(async move { self.slot.lock().await.clone() })
    }

    fn store_usage_info<'a>(
        &'a self,
        usage: &'a ProxyUsage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            *self.slot.lock().await = Some(usage.clone());
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.slot.lock().await = None;
            Ok(())
        })
    }
}

/// Write the snapshot atomically with owner-only permissions.
async fn write_atomic(path: &Path, usage: &ProxyUsage) -> Result<()> {
    let json = serde_json::to_string_pretty(usage)
        .map_err(|e| Error::CacheParse(format!("serializing usage: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("usage cache path has no parent directory".into()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating usage cache directory: {e}")))?;

    let tmp_path = dir.join(format!(".usage.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp usage file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting usage file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp usage file: {e}")))?;

    debug!(path = %path.display(), remaining = usage.remaining, "persisted usage");
    Ok(())
}
