use log::{info, warn};
use std::{fs, io, path::Path};
use tokio_util::sync::CancellationToken;

use crate::{
    config::TransportConfig,
    error::{Error, Result},
    git::{clone_command, render_command},
    logger::ProjectLogger,
    models::{BuildId, ContainerSpec, ExecSpec, GitProviderConfig, ImageName, Repository},
    ownership::{reconcile, OwnershipRequest},
    relay::Relay,
    services::{ContainerBackend, IdentitySource, RepositoryCloner},
};

const WORKDIR: &str = "/workdir";

/// Clones inside a throwaway container, as an account whose UID/GID has been
/// remapped to the operator's, so the checkout is owned by the operator on
/// the host.
pub struct ContainerCloner {
    backend: Box<dyn ContainerBackend>,
    identity: Box<dyn IdentitySource>,
    image: ImageName,
    workspace_user: String,
    cancel: CancellationToken,
}

impl ContainerCloner {
    pub fn new(
        backend: Box<dyn ContainerBackend>,
        identity: Box<dyn IdentitySource>,
        image: ImageName,
        workspace_user: String,
        cancel: CancellationToken,
    ) -> ContainerCloner {
        ContainerCloner {
            backend,
            identity,
            image,
            workspace_user,
            cancel,
        }
    }

    fn clone_in(
        &mut self,
        container: &str,
        command: &[String],
        logger: &ProjectLogger,
    ) -> Result<()> {
        let (uid, gid) = self.identity.uid_gid()?;

        let user = if (uid, gid) == (0, 0) {
            "root".to_owned()
        } else {
            let request = OwnershipRequest {
                remote_user: self.workspace_user.clone(),
                uid,
                gid,
            };
            reconcile(self.backend.as_mut(), container, &request, logger)?;
            self.workspace_user.clone()
        };

        info!("Cloning in {} as {}", container, user);
        let exec = ExecSpec::new(vec!["sh".to_owned(), "-c".to_owned(), render_command(command)?])
            .user(user);
        let output = self.backend.exec_sync(container, &exec)?;

        for line in output.output.lines() {
            logger.line(line)?;
        }

        Ok(())
    }

    fn relay_logs(&self, container: &str, logger: &ProjectLogger) -> Result<Relay> {
        let cancel = self.cancel.child_token();
        let mut backend = self.backend.with_cancel(cancel.clone())?;
        let container = container.to_owned();

        let relay = Relay::spawn(
            format!("logs-{}", container),
            cancel,
            logger.clone(),
            move || backend.logs(&container).map(Some),
        )?;

        Ok(relay)
    }
}

impl RepositoryCloner for ContainerCloner {
    fn clone_repository(
        &mut self,
        repository: &Repository,
        destination: &Path,
        credentials: Option<&GitProviderConfig>,
        transport: &TransportConfig,
        logger: &ProjectLogger,
    ) -> Result<()> {
        let (parent, name) = match (destination.parent(), destination.file_name()) {
            (Some(parent), Some(name)) => (parent, name),
            _ => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot clone into {:?}", destination),
                )))
            }
        };

        self.backend.pull_image(&self.image, &mut logger.clone())?;
        fs::create_dir_all(parent)?;

        let target = format!("{}/{}", WORKDIR, name.to_string_lossy());
        let command = clone_command(repository, &target, credentials, transport);

        let container = format!("git-clone-{}", BuildId::generate());
        self.backend.create_container(ContainerSpec {
            name: container.clone(),
            image: self.image.clone(),
            entrypoint: vec!["sleep".into(), "infinity".into()],
            binds: vec![format!("{}:{}", parent.display(), WORKDIR)],
            ..Default::default()
        })?;

        let mut relay = None;
        let result = self.backend.start_container(&container).and_then(|()| {
            relay = Some(self.relay_logs(&container, logger)?);
            self.clone_in(&container, &command, logger)
        });

        // Teardown outlives a cancelled clone.
        let removed = self
            .backend
            .with_cancel(CancellationToken::new())
            .and_then(|mut backend| backend.remove_container(&container, true));
        if let Err(err) = &removed {
            warn!("Failed to remove {}: {}", container, err);
        }

        if let Some(relay) = relay {
            relay.stop();
        }

        result.and(removed)
    }
}
