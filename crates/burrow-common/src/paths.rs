//! Standard filesystem paths for Burrow.

use std::path::PathBuf;

use once_cell::sync::Lazy;

use crate::error::BurrowResult;

/// Default root directory for Burrow data.
pub static BURROW_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("BURROW_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/burrow"))
});

/// Default runtime directory for Burrow.
pub static BURROW_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("BURROW_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/burrow"))
});

/// Standard paths used by the Burrow engine.
#[derive(Debug, Clone)]
pub struct BurrowPaths {
    /// Root data directory (default: /var/lib/burrow).
    pub root: PathBuf,
    /// Runtime directory (default: /run/burrow).
    pub runtime: PathBuf,
}

impl BurrowPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Scratch directory for per-container network state (logs, sockets).
    #[must_use]
    pub fn network_tmp(&self) -> PathBuf {
        self.runtime.join("net")
    }

    /// Log file capturing a container's namespace-helper output.
    #[must_use]
    pub fn helper_log(&self, id: &str) -> PathBuf {
        self.network_tmp().join(format!("slirp4netns-{id}.log"))
    }

    /// Control socket exposed by a container's namespace helper.
    #[must_use]
    pub fn helper_api_socket(&self, id: &str) -> PathBuf {
        self.network_tmp().join(format!("{id}.net"))
    }

    /// Log file capturing a container's port-forwarder output.
    #[must_use]
    pub fn portfwd_log(&self, id: &str) -> PathBuf {
        self.network_tmp().join(format!("portfwd-{id}.log"))
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> BurrowResult<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.runtime)?;
        std::fs::create_dir_all(self.network_tmp())?;
        Ok(())
    }
}

impl Default for BurrowPaths {
    fn default() -> Self {
        Self {
            root: BURROW_ROOT.clone(),
            runtime: BURROW_RUNTIME_DIR.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = BurrowPaths::with_root("/tmp/burrow-test");
        assert_eq!(paths.runtime, PathBuf::from("/tmp/burrow-test/run"));
        assert_eq!(
            paths.network_tmp(),
            PathBuf::from("/tmp/burrow-test/run/net")
        );
    }

    #[test]
    fn helper_paths_keyed_by_container() {
        let paths = BurrowPaths::with_root("/tmp/burrow-test");
        assert_eq!(
            paths.helper_log("abc123"),
            PathBuf::from("/tmp/burrow-test/run/net/slirp4netns-abc123.log")
        );
        assert_eq!(
            paths.helper_api_socket("abc123"),
            PathBuf::from("/tmp/burrow-test/run/net/abc123.net")
        );
        assert_eq!(
            paths.portfwd_log("abc123"),
            PathBuf::from("/tmp/burrow-test/run/net/portfwd-abc123.log")
        );
    }
}
