//! Shared pieces of the `tftpd` and `tftp` command line tools

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tftp::{DirStore, TransferConfig};
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Build a transfer policy from command line values
pub fn transfer_config(timeout_secs: f64, retries: usize) -> Result<TransferConfig> {
    if retries == 0 {
        anyhow::bail!("Retry count must be at least 1");
    }
    let timeout = Duration::try_from_secs_f64(timeout_secs)
        .ok()
        .filter(|t| !t.is_zero())
        .with_context(|| format!("Invalid timeout: {}", timeout_secs))?;

    Ok(TransferConfig {
        timeout,
        max_retries: retries,
    })
}

/// Split a local path into a store over its directory and the file name within it
pub fn local_store(path: &Path) -> Result<(DirStore, String)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid local file name: {}", path.display()))?
        .to_string();

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };

    Ok((DirStore::new(dir), name))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_transfer_config_from_cli() {
        let config = transfer_config(0.5, 3).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.max_retries, 3);

        assert!(transfer_config(0.0, 3).is_err());
        assert!(transfer_config(-1.0, 3).is_err());
        assert!(transfer_config(5.0, 0).is_err());
    }

    #[test]
    fn test_local_store_split() {
        let (store, name) = local_store(Path::new("/tmp/downloads/boot.img")).unwrap();
        assert_eq!(store.root(), Path::new("/tmp/downloads"));
        assert_eq!(name, "boot.img");

        let (store, name) = local_store(Path::new("boot.img")).unwrap();
        assert_eq!(store.root(), PathBuf::from(".").as_path());
        assert_eq!(name, "boot.img");

        assert!(local_store(Path::new("/")).is_err());
    }
}
