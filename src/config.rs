//! Storage location configuration
//!
//! Resolves which backend to use and where it keeps its data from
//! environment variables, falling back to locations under the platform
//! config directory.

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info};

use crate::constants::config::*;
use crate::persistence::{FileNamespace, FlatKvBackend, PersistenceBackend, TreeBackend};

/// Durable storage format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Single XML document shared by all paths
    #[default]
    Xml,
    /// One node directory per path
    Flat,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "xml" | "tree" => Ok(BackendKind::Xml),
            "flat" => Ok(BackendKind::Flat),
            other => bail!("unknown backend '{other}' (expected xml or flat)"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Xml => write!(f, "xml"),
            BackendKind::Flat => write!(f, "flat"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Document used by the XML backend
    pub xml_file: PathBuf,
    /// Root directory of the flat backend's node tree
    pub node_root: PathBuf,
    /// Node path loaded and stored by the CLI
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = Self::base_dir();
        Self {
            backend: BackendKind::default(),
            xml_file: base.join(XML_FILENAME),
            node_root: base.join(NODES_DIR),
            path: DEFAULT_PATH.to_string(),
        }
    }
}

impl StorageConfig {
    fn base_dir() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(APP_DIR);
        path
    }

    /// Defaults overridden by `PREFSTORE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(backend) = lookup(ENV_BACKEND) {
            config.backend = backend
                .parse()
                .with_context(|| format!("invalid {ENV_BACKEND}"))?;
        }
        if let Some(file) = lookup(ENV_FILE).filter(|s| !s.is_empty()) {
            config.xml_file = PathBuf::from(file);
        }
        if let Some(root) = lookup(ENV_ROOT).filter(|s| !s.is_empty()) {
            config.node_root = PathBuf::from(root);
        }
        if let Some(path) = lookup(ENV_PATH).filter(|s| !s.is_empty()) {
            config.path = path;
        }

        debug!(config = ?config, "Resolved storage config");
        Ok(config)
    }

    /// Apply command-line overrides on top of the resolved values
    pub fn with_overrides(
        mut self,
        backend: Option<BackendKind>,
        xml_file: Option<PathBuf>,
        node_root: Option<PathBuf>,
        path: Option<String>,
    ) -> Self {
        if let Some(backend) = backend {
            self.backend = backend;
        }
        if let Some(xml_file) = xml_file {
            self.xml_file = xml_file;
        }
        if let Some(node_root) = node_root {
            self.node_root = node_root;
        }
        if let Some(path) = path {
            self.path = path;
        }
        self
    }

    pub fn open_backend(&self) -> Box<dyn PersistenceBackend> {
        match self.backend {
            BackendKind::Xml => {
                info!(file = %self.xml_file.display(), "Using XML preferences file");
                Box::new(TreeBackend::new(&self.xml_file))
            }
            BackendKind::Flat => {
                info!(root = %self.node_root.display(), "Using flat preferences namespace");
                Box::new(FlatKvBackend::new(FileNamespace::new(&self.node_root)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = StorageConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.backend, BackendKind::Xml);
        assert_eq!(config.path, DEFAULT_PATH);
        assert!(config.xml_file.ends_with("prefstore/preferences.xml"));
        assert!(config.node_root.ends_with("prefstore/nodes"));
    }

    #[test]
    fn test_environment_overrides() {
        let config = StorageConfig::from_lookup(lookup_from(&[
            (ENV_BACKEND, "FLAT"),
            (ENV_FILE, "/tmp/p.xml"),
            (ENV_ROOT, "/tmp/nodes"),
            (ENV_PATH, "com/example/app"),
        ]))
        .unwrap();

        assert_eq!(config.backend, BackendKind::Flat);
        assert_eq!(config.xml_file, PathBuf::from("/tmp/p.xml"));
        assert_eq!(config.node_root, PathBuf::from("/tmp/nodes"));
        assert_eq!(config.path, "com/example/app");
    }

    #[test]
    fn test_empty_values_keep_defaults() {
        let config = StorageConfig::from_lookup(lookup_from(&[(ENV_PATH, ""), (ENV_FILE, "")])).unwrap();
        assert_eq!(config.path, DEFAULT_PATH);
        assert!(config.xml_file.ends_with(XML_FILENAME));
    }

    #[test]
    fn test_unknown_backend_is_an_error() {
        let err = StorageConfig::from_lookup(lookup_from(&[(ENV_BACKEND, "registry")])).unwrap_err();
        assert!(format!("{err:#}").contains("registry"));
    }

    #[test]
    fn test_cli_overrides_win() {
        let config = StorageConfig::from_lookup(lookup_from(&[(ENV_PATH, "from-env")]))
            .unwrap()
            .with_overrides(Some(BackendKind::Flat), None, Some(PathBuf::from("/n")), Some("cli".into()));
        assert_eq!(config.backend, BackendKind::Flat);
        assert_eq!(config.node_root, PathBuf::from("/n"));
        assert_eq!(config.path, "cli");
    }

    #[test]
    fn test_open_backend_kind() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: BackendKind::Flat,
            xml_file: dir.path().join("p.xml"),
            node_root: dir.path().join("nodes"),
            path: "app".into(),
        };
        assert_eq!(config.open_backend().name(), "flat");

        let xml = StorageConfig { backend: BackendKind::Xml, ..config };
        assert_eq!(xml.open_backend().name(), "tree");
    }
}
