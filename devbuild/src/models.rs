use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap as Map, fmt, path::PathBuf};

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub workspace_id: String,
    pub repository: Repository,
    pub build: BuildConfig,
}

#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct Repository {
    pub url: String,
    pub branch: Option<String>,
    /// Pinned commit. When it equals `branch` the branch name aliases a commit.
    pub sha: Option<String>,
}

impl Repository {
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref().filter(|branch| !branch.is_empty())
    }

    pub fn sha(&self) -> Option<&str> {
        self.sha.as_deref().filter(|sha| !sha.is_empty())
    }

    pub fn should_checkout_sha(&self) -> bool {
        match (self.branch(), self.sha()) {
            (Some(branch), Some(sha)) => branch == sha,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum BuildConfig {
    Unset,
    Devcontainer { file_path: PathBuf },
    Image { image: String },
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig::Unset
    }
}

#[derive(Clone)]
pub struct GitProviderConfig {
    pub username: String,
    pub token: String,
}

impl fmt::Debug for GitProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitProviderConfig")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, Default, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageName(pub String);

impl ImageName {
    /// Splits `registry:port/repo:tag` into repository and tag, defaulting the
    /// tag to `latest`. A colon before the last slash belongs to the registry.
    pub fn split_tag(&self) -> (&str, &str) {
        let name = self.0.as_str();
        let slash = name.rfind('/').map(|index| index + 1).unwrap_or(0);

        match name[slash..].rfind(':') {
            Some(colon) => (&name[..slash + colon], &name[slash + colon + 1..]),
            None => (name, "latest"),
        }
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerId(pub String);

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct BuildId(pub String);

impl BuildId {
    pub fn generate() -> BuildId {
        BuildId(hex::encode(rand::random::<[u8; 6]>()))
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct Image {
    pub id: ImageId,
    pub labels: Map<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: ImageName,
    pub entrypoint: Vec<String>,
    pub binds: Vec<String>,
    pub network_mode: Option<String>,
    pub privileged: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub user: Option<String>,
    pub env: Map<String, String>,
}

impl ExecSpec {
    pub fn new<I, S>(cmd: I) -> ExecSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecSpec {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> ExecSpec {
        self.user = Some(user.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl ToString) -> ExecSpec {
        self.env.insert(key.into(), value.to_string());
        self
    }

    pub fn program(&self) -> &str {
        self.cmd.first().map(String::as_str).unwrap_or("<empty>")
    }

    pub fn env_list(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ExecId(pub String);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: i64,
}

pub struct AttachedExec {
    pub id: ExecId,
    pub lines: crate::services::LineStream,
}

/// Credentials sent along with an image push.
#[derive(Clone, Debug)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server: String,
}

impl RegistryAuth {
    /// The runtime rejects a push without an auth header, so something must
    /// always be sent even when the registry is unauthenticated.
    pub fn placeholder(server: &str) -> RegistryAuth {
        RegistryAuth {
            username: "empty".into(),
            password: "empty".into(),
            server: server.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildResult {
    pub user: String,
    pub image_name: ImageName,
    pub project_volume_path: PathBuf,
}

pub const OUTCOME_SUCCESS: &str = "success";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub outcome: String,
    pub image_name: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl From<&BuildResult> for BuildRecord {
    fn from(result: &BuildResult) -> Self {
        BuildRecord {
            outcome: OUTCOME_SUCCESS.into(),
            image_name: vec![result.image_name.0.clone()],
            user: Some(result.user.clone()),
        }
    }
}
