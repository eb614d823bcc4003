use log::info;

use super::{remove_tree, BuildContext};
use crate::{
    error::Result,
    models::{BuildId, BuildResult, ImageName},
    services::Builder,
};

/// Uses a pre-built image as is. Nothing runs in the container runtime.
pub struct ImageBuilder {
    context: BuildContext,
    image: ImageName,
    user: String,
}

impl ImageBuilder {
    pub fn new(context: BuildContext, image: ImageName, user: String) -> ImageBuilder {
        ImageBuilder {
            context,
            image,
            user,
        }
    }
}

impl Builder for ImageBuilder {
    fn build_id(&self) -> &BuildId {
        &self.context.id
    }

    fn build(&mut self) -> Result<BuildResult> {
        info!(
            "Using image {} for {}/{}",
            self.image, self.context.project.workspace_id, self.context.project.name
        );
        self.context
            .logger
            .line(&format!("Using pre-built image {}", self.image))?;

        Ok(BuildResult {
            user: self.user.clone(),
            image_name: self.image.clone(),
            project_volume_path: self.context.project_dir.clone(),
        })
    }

    fn publish(&mut self) -> Result<()> {
        Ok(())
    }

    fn clean_up(&mut self) -> Result<()> {
        remove_tree(&self.context.project_dir)
    }
}
