use std::{io::Write, path::Path};
use tokio_util::sync::CancellationToken;

use crate::{
    config::TransportConfig,
    error::Result,
    logger::ProjectLogger,
    models::{
        AttachedExec, BuildId, BuildResult, ContainerId, ContainerSpec, ExecId, ExecOutput,
        ExecSpec, GitProviderConfig, Image, ImageName, RegistryAuth, Repository,
    },
};

/// Blocking iterator over the lines of a live output stream.
pub type LineStream = Box<dyn Iterator<Item = Result<String>> + Send>;

pub trait ContainerBackend: Send {
    fn pull_image(&mut self, name: &ImageName, logger: &mut dyn Write) -> Result<()>;

    fn inspect_image(&mut self, name: &ImageName) -> Result<Image>;

    fn tag_image(&mut self, source: &ImageName, target: &ImageName) -> Result<()>;

    fn push_image(
        &mut self,
        name: &ImageName,
        auth: &RegistryAuth,
        logger: &mut dyn Write,
    ) -> Result<()>;

    fn create_container(&mut self, spec: ContainerSpec) -> Result<ContainerId>;

    fn start_container(&mut self, name: &str) -> Result<()>;

    /// Removing a container that does not exist is not an error.
    fn remove_container(&mut self, name: &str, force: bool) -> Result<()>;

    /// Runs a command to completion. A non-zero exit code is returned as
    /// `Error::ExecFailed` carrying the command's output.
    fn exec_sync(&mut self, container: &str, exec: &ExecSpec) -> Result<ExecOutput>;

    /// Starts a command and hands back its combined output as it is produced.
    fn exec_attached(&mut self, container: &str, exec: &ExecSpec) -> Result<AttachedExec>;

    fn exec_exit_code(&mut self, exec: &ExecId) -> Result<i64>;

    fn logs(&mut self, container: &str) -> Result<LineStream>;

    fn try_clone(&self) -> Result<Box<dyn ContainerBackend>>;

    /// A connection to the same runtime whose calls and streams give up when
    /// `cancel` fires, in place of this backend's token.
    fn with_cancel(&self, cancel: CancellationToken) -> Result<Box<dyn ContainerBackend>>;

    /// Connects to a runtime listening on `socket`, sharing this backend's
    /// cancellation.
    fn connect_nested(&self, socket: &Path) -> Result<Box<dyn ContainerBackend>>;
}

pub trait RepositoryCloner: Send {
    fn clone_repository(
        &mut self,
        repository: &Repository,
        destination: &Path,
        credentials: Option<&GitProviderConfig>,
        transport: &TransportConfig,
        logger: &ProjectLogger,
    ) -> Result<()>;
}

/// Source of the UID/GID that bind-mounted files should end up owned by.
pub trait IdentitySource: Send {
    fn uid_gid(&self) -> Result<(u32, u32)>;
}

pub trait LoggerFactory: Send {
    fn project_logger(&self, workspace_id: &str, project_name: &str) -> Result<ProjectLogger>;
}

pub trait Builder: Send {
    fn build_id(&self) -> &BuildId;

    fn build(&mut self) -> Result<BuildResult>;

    fn publish(&mut self) -> Result<()>;

    /// Releases everything the builder created. Safe to call repeatedly.
    fn clean_up(&mut self) -> Result<()>;
}
