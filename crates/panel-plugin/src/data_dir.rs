//! Startup arguments and the per-plugin data directory.
//!
//! The panel launches a plugin as `<binary> [panel-addr] [data-base]`. The
//! data directory is `<data-base>/<plugin-id>_data`, or `<plugin-id>_data`
//! relative to the working directory when no base is given. Plugins keep
//! their own config document there as `config.json`.

use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;

/// File name of the plugin's config document inside its data directory.
pub const CONFIG_FILE: &str = "config.json";

/// Arguments the panel passes on launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupArgs {
    pub panel_addr: String,
    pub data_base: Option<PathBuf>,
}

impl StartupArgs {
    /// Parse positional arguments, skipping the program name.
    pub fn from_args<I, S>(args: I, default_addr: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut positional = args.into_iter().map(Into::into).skip(1);
        let panel_addr = positional.next().filter(|a| !a.is_empty()).unwrap_or_else(|| default_addr.to_string());
        let data_base = positional.next().filter(|b| !b.is_empty()).map(PathBuf::from);
        Self { panel_addr, data_base }
    }

    /// Parse the process arguments.
    pub fn from_env(default_addr: &str) -> Self {
        Self::from_args(std::env::args(), default_addr)
    }
}

/// A plugin's private data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn resolve(plugin_id: &str, base: Option<&Path>) -> Self {
        let name = format!("{plugin_id}_data");
        let root = match base {
            Some(base) => base.join(name),
            None => PathBuf::from(name),
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `file` inside the data directory.
    pub fn path(&self, file: impl AsRef<Path>) -> PathBuf {
        self.root.join(file)
    }

    /// Create the directory if missing. Failure is logged and reported but
    /// never fatal to the plugin.
    pub fn ensure(&self) -> bool {
        match std::fs::create_dir_all(&self.root) {
            Ok(()) => {
                debug!(path = %self.root.display(), "data directory ready");
                true
            }
            Err(e) => {
                warn!(path = %self.root.display(), error = %e, "failed to create data directory");
                false
            }
        }
    }

    /// Write `config` as pretty-printed JSON to `config.json`.
    pub fn save_config<T: Serialize>(&self, config: &T) -> Result<()> {
        let path = self.path(CONFIG_FILE);
        let bytes = serde_json::to_vec_pretty(config).map_err(|source| Error::ConfigFormat {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, bytes).map_err(|source| Error::ConfigIo { path, source })
    }

    /// Read `config.json` back. A missing file is an I/O error.
    pub fn load_config<T: DeserializeOwned>(&self) -> Result<T> {
        let path = self.path(CONFIG_FILE);
        let bytes = std::fs::read(&path).map_err(|source| Error::ConfigIo {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| Error::ConfigFormat { path, source })
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct QuotaConfig {
        max_servers: u32,
        owners: Vec<String>,
    }

    #[test]
    fn args_fall_back_to_default_address() {
        let args = StartupArgs::from_args(["plugin"], "127.0.0.1:50051");
        assert_eq!(args.panel_addr, "127.0.0.1:50051");
        assert_eq!(args.data_base, None);
    }

    #[test]
    fn args_override_address_and_base() {
        let args = StartupArgs::from_args(["plugin", "10.0.0.5:7000", "/srv/plugins"], "127.0.0.1:50051");
        assert_eq!(args.panel_addr, "10.0.0.5:7000");
        assert_eq!(args.data_base.as_deref(), Some(Path::new("/srv/plugins")));
    }

    #[test]
    fn data_dir_is_named_after_plugin() {
        assert_eq!(DataDir::resolve("quota", None).root(), Path::new("quota_data"));
        let dir = DataDir::resolve("quota", Some(Path::new("/srv")));
        assert_eq!(dir.root(), Path::new("/srv/quota_data"));
        assert_eq!(dir.path("state.db"), Path::new("/srv/quota_data/state.db"));
    }

    #[test]
    fn config_survives_a_save_and_load() {
        let base = tempfile::tempdir().expect("tempdir");
        let dir = DataDir::resolve("quota", Some(base.path()));
        assert!(dir.ensure());
        assert!(dir.root().is_dir());

        let config = QuotaConfig {
            max_servers: 4,
            owners: vec!["alice".into()],
        };
        dir.save_config(&config).expect("save");
        let text = std::fs::read_to_string(dir.path(CONFIG_FILE)).expect("read back");
        assert!(text.contains('\n'), "config should be pretty-printed");
        assert_eq!(dir.load_config::<QuotaConfig>().expect("load"), config);
    }

    #[test]
    fn missing_config_is_an_io_error() {
        let base = tempfile::tempdir().expect("tempdir");
        let dir = DataDir::resolve("quota", Some(base.path()));
        dir.ensure();
        let err = dir.load_config::<QuotaConfig>().expect_err("missing");
        assert!(matches!(err, Error::ConfigIo { .. }));
    }

    #[test]
    fn malformed_config_is_a_format_error() {
        let base = tempfile::tempdir().expect("tempdir");
        let dir = DataDir::resolve("quota", Some(base.path()));
        dir.ensure();
        std::fs::write(dir.path(CONFIG_FILE), "{ not json").expect("write");
        let err = dir.load_config::<QuotaConfig>().expect_err("malformed");
        assert!(matches!(err, Error::ConfigFormat { .. }));
    }

    #[test]
    fn ensure_reports_failure_without_panicking() {
        let base = tempfile::tempdir().expect("tempdir");
        let blocker = base.path().join("file");
        std::fs::write(&blocker, "x").expect("write");
        assert!(!DataDir::resolve("quota", Some(&blocker)).ensure());
    }
}
