//! Kernel tunables (`/proc/sys`, `/sys`) changed on behalf of a recipe.
//!
//! The first value seen for each path is remembered so `restore` can put it
//! back when the controller tears the machine down.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SysconfigError {
    #[error("option path {0} is not absolute or leaves the root")]
    BadPath(String),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct SystemConfig {
    root: PathBuf,
    originals: Mutex<BTreeMap<String, String>>,
}

impl SystemConfig {
    /// Options are resolved below `root` (`/` on a real machine).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            originals: Mutex::new(BTreeMap::new()),
        }
    }

    fn resolve(&self, option: &str) -> Result<PathBuf, SysconfigError> {
        let path = Path::new(option);
        let clean = path.is_absolute()
            && path
                .components()
                .all(|c| matches!(c, Component::RootDir | Component::Normal(_)));
        if !clean {
            return Err(SysconfigError::BadPath(option.to_string()));
        }
        Ok(self.root.join(option.trim_start_matches('/')))
    }

    pub async fn get_option(&self, option: &str) -> Result<String, SysconfigError> {
        let path = self.resolve(option)?;
        let value = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SysconfigError::Io {
                path: option.to_string(),
                source,
            })?;
        Ok(value.trim().to_string())
    }

    /// Write `value` to `option`. Unless `persistent`, the value found before
    /// the first change is recorded for [`SystemConfig::restore`].
    pub async fn set_option(
        &self,
        option: &str,
        value: &str,
        persistent: bool,
    ) -> Result<(), SysconfigError> {
        let path = self.resolve(option)?;
        let previous = self.get_option(option).await?;
        tokio::fs::write(&path, value)
            .await
            .map_err(|source| SysconfigError::Io {
                path: option.to_string(),
                source,
            })?;
        info!(option, value, persistent, "system option set");

        if !persistent {
            self.originals
                .lock()
                .await
                .entry(option.to_string())
                .or_insert(previous);
        }
        Ok(())
    }

    /// Write every remembered original back. Failures are logged and the
    /// remaining options are still restored.
    pub async fn restore(&self) {
        let originals = std::mem::take(&mut *self.originals.lock().await);
        for (option, value) in originals {
            let result = match self.resolve(&option) {
                Ok(path) => tokio::fs::write(&path, &value).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(()) => info!(option = %option, value = %value, "system option restored"),
                Err(e) => warn!(option = %option, error = %e, "failed to restore system option"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "netlab-sysconfig-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("proc/sys/net/ipv4")).unwrap();
        std::fs::write(dir.join("proc/sys/net/ipv4/ip_forward"), "0\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn restore_writes_first_seen_value() {
        let root = temp_root("restore");
        let cfg = SystemConfig::new(&root);
        let opt = "/proc/sys/net/ipv4/ip_forward";

        cfg.set_option(opt, "1", false).await.unwrap();
        cfg.set_option(opt, "2", false).await.unwrap();
        assert_eq!(cfg.get_option(opt).await.unwrap(), "2");

        cfg.restore().await;
        assert_eq!(cfg.get_option(opt).await.unwrap(), "0");
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn persistent_values_survive_restore() {
        let root = temp_root("persistent");
        let cfg = SystemConfig::new(&root);
        let opt = "/proc/sys/net/ipv4/ip_forward";

        cfg.set_option(opt, "1", true).await.unwrap();
        cfg.restore().await;
        assert_eq!(cfg.get_option(opt).await.unwrap(), "1");
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn paths_stay_under_root() {
        let cfg = SystemConfig::new("/nonexistent");
        assert!(matches!(
            cfg.set_option("/proc/../etc/passwd", "x", false).await,
            Err(SysconfigError::BadPath(_))
        ));
        assert!(matches!(
            cfg.get_option("relative/path").await,
            Err(SysconfigError::BadPath(_))
        ));
    }
}
