use serde::Deserialize;
use std::{
    fs::File,
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneMode {
    /// Clone from the host process with libgit2.
    Native,
    /// Clone from inside a throwaway container as the workspace user.
    Container,
}

impl Default for CloneMode {
    fn default() -> Self {
        CloneMode::Native
    }
}

/// Per-call repository transport settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Depth used for branch clones. Zero means full history.
    pub shallow_depth: u32,
    pub skip_tls_verify: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            shallow_depth: 1,
            skip_tls_verify: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub server_config_folder: PathBuf,
    /// Defaults to `<server_config_folder>/projects` when unset.
    pub base_path: Option<PathBuf>,
    pub local_container_registry_server: String,
    pub builder_image: String,
    pub default_project_user: String,
    pub workspace_user: String,
    pub runtime_dir: PathBuf,
    pub clone_mode: CloneMode,
    pub transport: TransportConfig,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            server_config_folder: dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("devbuild"),
            base_path: None,
            local_container_registry_server: "localhost:5000".into(),
            builder_image: "daytonaio/workspace-project".into(),
            default_project_user: "daytona".into(),
            workspace_user: "daytona".into(),
            runtime_dir: PathBuf::from("/tmp"),
            clone_mode: CloneMode::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl BuilderConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<BuilderConfig> {
        let path = path.as_ref();
        let file = File::open(path)?;

        serde_yaml::from_reader(file).map_err(|source| Error::Config {
            path: path.to_owned(),
            source,
        })
    }

    pub fn base_path(&self) -> PathBuf {
        self.base_path
            .clone()
            .unwrap_or_else(|| self.server_config_folder.join("projects"))
    }

    pub fn builds_path(&self) -> PathBuf {
        self.server_config_folder.join("builds")
    }

    pub fn logs_path(&self) -> PathBuf {
        self.server_config_folder.join("logs")
    }
}
