use log::{error, info};
use std::{fs, io, path::{Path, PathBuf}};

use crate::{
    error::Result,
    hasher::ConfigHash,
    logger::ProjectLogger,
    models::{BuildId, BuildRecord, BuildResult, Project},
    services::Builder,
    store::BuildStore,
};

pub mod devcontainer;
pub mod image;

pub use devcontainer::DevcontainerBuilder;
pub use image::ImageBuilder;

/// What every builder is handed by the factory.
pub struct BuildContext {
    pub id: BuildId,
    pub project: Project,
    /// The cloned working tree, owned by the builder.
    pub project_dir: PathBuf,
    pub logger: ProjectLogger,
}

/// Owns a builder until its resources are released. Dropping an unreleased
/// lease cleans up, so an early return cannot leak a builder container.
pub struct BuilderLease {
    builder: Box<dyn Builder>,
    store: BuildStore,
    hash: ConfigHash,
    released: bool,
}

impl BuilderLease {
    pub fn new(builder: Box<dyn Builder>, store: BuildStore, hash: ConfigHash) -> BuilderLease {
        BuilderLease {
            builder,
            store,
            hash,
            released: false,
        }
    }

    pub fn build_id(&self) -> &BuildId {
        self.builder.build_id()
    }

    /// Runs the build and records its result under the config hash.
    pub fn build(&mut self) -> Result<BuildResult> {
        let result = self.builder.build()?;

        let path = self.store.save(&self.hash, &BuildRecord::from(&result))?;
        info!("Build {} recorded at {:?}", self.build_id(), path);

        Ok(result)
    }

    pub fn publish(&mut self) -> Result<()> {
        self.builder.publish()
    }

    /// Releases the builder's resources. Once this succeeds further calls do
    /// nothing; after a failure it can be retried.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        self.builder.clean_up()?;
        self.released = true;
        Ok(())
    }
}

impl Drop for BuilderLease {
    fn drop(&mut self) {
        if let Err(err) = self.cleanup() {
            error!("Failed to clean up build {}: {}", self.build_id(), err);
        }
    }
}

/// Removes a directory tree, treating a missing one as already removed.
pub(crate) fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}
