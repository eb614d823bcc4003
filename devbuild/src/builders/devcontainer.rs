use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::BTreeMap as Map,
    fs,
    path::{Path, PathBuf},
};
use tokio_util::sync::CancellationToken;

use super::{remove_tree, BuildContext};
use crate::{
    config::BuilderConfig,
    error::{Error, Result},
    models::{
        BuildId, BuildResult, ContainerSpec, ExecSpec, ImageName, RegistryAuth, OUTCOME_SUCCESS,
    },
    relay::Relay,
    services::{Builder, ContainerBackend},
};

const PROJECT_MOUNT: &str = "/project";
const SOCKET_MOUNT: &str = "/tmp/docker";
const METADATA_LABEL: &str = "devcontainer.metadata";

/// The structured record the devcontainer CLI prints when it finishes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutcome {
    pub outcome: String,
    #[serde(default)]
    pub image_name: Vec<String>,
}

/// Builds a devcontainer inside a privileged builder container that runs its
/// own Docker daemon, then tags the result for the local registry.
pub struct DevcontainerBuilder {
    context: BuildContext,
    /// Devcontainer file, relative to the project root.
    config_file: PathBuf,
    builder_image: ImageName,
    registry: String,
    runtime_dir: PathBuf,
    backend: Box<dyn ContainerBackend>,
    nested: Option<Box<dyn ContainerBackend>>,
    relays: Vec<Relay>,
    cancel: CancellationToken,
    image_name: Option<ImageName>,
}

impl DevcontainerBuilder {
    pub fn new(
        context: BuildContext,
        config_file: PathBuf,
        config: &BuilderConfig,
        backend: Box<dyn ContainerBackend>,
        cancel: CancellationToken,
    ) -> DevcontainerBuilder {
        let runtime_dir = config.runtime_dir.join(&context.id.0);

        DevcontainerBuilder {
            context,
            config_file,
            builder_image: ImageName(config.builder_image.clone()),
            registry: config.local_container_registry_server.clone(),
            runtime_dir,
            backend,
            nested: None,
            relays: Vec::new(),
            cancel,
            image_name: None,
        }
    }

    /// Host directory mounted at `/tmp/docker`, where the nested daemon
    /// puts its socket.
    fn socket_dir(&self) -> PathBuf {
        self.runtime_dir.join("docker")
    }

    fn start_builder_container(&mut self) -> Result<()> {
        self.backend
            .pull_image(&self.builder_image, &mut self.context.logger.clone())?;

        let socket_dir = self.socket_dir();
        fs::create_dir_all(&socket_dir)?;

        let id = self.backend.create_container(ContainerSpec {
            name: self.context.id.0.clone(),
            image: self.builder_image.clone(),
            entrypoint: vec!["sleep".into(), "infinity".into()],
            binds: vec![
                format!("{}:{}", self.context.project_dir.display(), PROJECT_MOUNT),
                format!("{}:{}", socket_dir.display(), SOCKET_MOUNT),
            ],
            network_mode: Some("host".into()),
            privileged: true,
        })?;
        info!("Builder container {} created as {}", self.context.id, id.0);

        self.backend.start_container(&self.context.id.0)
    }

    /// Launches dockerd without waiting for it; the build tool's own
    /// connection attempts absorb its startup.
    fn start_nested_runtime(&mut self) -> Result<()> {
        let exec = ExecSpec::new(vec![
            "dockerd".to_owned(),
            "-H".to_owned(),
            format!("unix://{}/docker.sock", SOCKET_MOUNT),
            "-H".to_owned(),
            "unix:///var/run/docker.sock".to_owned(),
            "--insecure-registry".to_owned(),
            self.registry.clone(),
        ]);

        // The output stream has to end when the relay is stopped, even if
        // dockerd never exits.
        let relay_cancel = self.cancel.child_token();
        let attached = self
            .backend
            .with_cancel(relay_cancel.clone())?
            .exec_attached(&self.context.id.0, &exec)?;
        debug!("dockerd started as {}", attached.id.0);

        let mut output = Some(attached.lines);
        let relay = Relay::spawn(
            format!("dockerd-{}", self.context.id),
            relay_cancel,
            self.context.logger.clone(),
            move || Ok(output.take()),
        )?;
        self.relays.push(relay);

        Ok(())
    }

    fn build_command(&self) -> Vec<String> {
        let mut command = vec![
            "devcontainer".to_owned(),
            "build".to_owned(),
            "--workspace-folder".to_owned(),
            PROJECT_MOUNT.to_owned(),
        ];

        if !self.config_file.as_os_str().is_empty() {
            command.push("--config".into());
            command.push(
                Path::new(PROJECT_MOUNT)
                    .join(&self.config_file)
                    .to_string_lossy()
                    .into_owned(),
            );
        }

        command
    }

    fn run_build_tool(&mut self) -> Result<ImageName> {
        let exec = ExecSpec::new(self.build_command());
        let attached = self.backend.exec_attached(&self.context.id.0, &exec)?;

        let mut outcome = None;
        for line in attached.lines {
            let line = line?;
            self.context.logger.line(&line)?;

            if let Some(parsed) = parse_outcome_line(&line)? {
                outcome = Some(parsed);
            }
        }

        let exit_code = self.backend.exec_exit_code(&attached.id)?;
        evaluate_outcome(outcome, exit_code)
    }

    fn nested(&mut self) -> Result<&mut Box<dyn ContainerBackend>> {
        if self.nested.is_none() {
            let socket = self.socket_dir().join("docker.sock");
            self.nested = Some(self.backend.connect_nested(&socket)?);
        }

        match self.nested.as_mut() {
            Some(nested) => Ok(nested),
            None => Err(Error::ProtocolViolation("nested runtime unavailable".into())),
        }
    }

    fn tag_image(&mut self, built: &ImageName) -> Result<ImageName> {
        // TODO: tag with the repository commit instead of latest.
        let target = ImageName(format!("{}/p-{}:latest", self.registry, self.context.id));

        self.nested()?.tag_image(built, &target)?;
        self.image_name = Some(target.clone());

        Ok(target)
    }
}

impl Builder for DevcontainerBuilder {
    fn build_id(&self) -> &BuildId {
        &self.context.id
    }

    fn build(&mut self) -> Result<BuildResult> {
        info!(
            "Building {}/{} as {}",
            self.context.project.workspace_id,
            self.context.project.name,
            self.context.id
        );

        self.start_builder_container()?;
        self.start_nested_runtime()?;

        let built = self.run_build_tool()?;
        let image_name = self.tag_image(&built)?;

        let image = self.nested()?.inspect_image(&image_name)?;
        debug!("{} is {}", image_name, image.id.0);
        let user = extract_remote_user(&image.labels)?;

        Ok(BuildResult {
            user,
            image_name,
            project_volume_path: self.context.project_dir.clone(),
        })
    }

    fn publish(&mut self) -> Result<()> {
        let image_name = self
            .image_name
            .clone()
            .ok_or_else(|| Error::ProtocolViolation("nothing has been built to publish".into()))?;

        // TODO: look up the registry's credentials in the container registry
        // store; the runtime rejects a push that carries no auth at all.
        let auth = RegistryAuth::placeholder(&self.registry);
        let mut logger = self.context.logger.clone();

        self.nested()?.push_image(&image_name, &auth, &mut logger)
    }

    fn clean_up(&mut self) -> Result<()> {
        let mut first_error = None;
        let mut keep = |result: Result<()>| {
            if let Err(err) = result {
                warn!("cleanup: {}", err);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        };

        self.nested = None;

        // Teardown outlives a cancelled build.
        keep(
            self.backend
                .with_cancel(CancellationToken::new())
                .and_then(|mut backend| backend.remove_container(&self.context.id.0, true)),
        );

        for relay in self.relays.drain(..) {
            relay.stop();
        }

        keep(remove_tree(&self.context.project_dir));
        keep(remove_tree(&self.runtime_dir));

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Parses the outcome record out of a build tool output line, if the line
/// carries one. The record may be surrounded by other text.
pub fn parse_outcome_line(line: &str) -> Result<Option<BuildOutcome>> {
    if !line.contains(r#"{"outcome""#) {
        return Ok(None);
    }

    let json = match (line.find('{'), line.rfind('}')) {
        (Some(start), Some(end)) if start < end => &line[start..=end],
        _ => line,
    };

    serde_json::from_str(json)
        .map(Some)
        .map_err(|source| Error::MalformedOutcome {
            line: line.to_owned(),
            source,
        })
}

/// A build succeeded only if the tool said so and exited with zero.
pub fn evaluate_outcome(outcome: Option<BuildOutcome>, exit_code: i64) -> Result<ImageName> {
    let outcome = match outcome {
        Some(outcome) if outcome.outcome == OUTCOME_SUCCESS && exit_code == 0 => outcome,
        outcome => {
            return Err(Error::BuildFailed {
                outcome: outcome.map(|outcome| outcome.outcome),
                exit_code,
            })
        }
    };

    match outcome.image_name.into_iter().next() {
        Some(image) if !image.is_empty() => Ok(ImageName(image)),
        _ => Err(Error::ProtocolViolation(
            "build outcome does not name an image".into(),
        )),
    }
}

/// Finds the first non-empty `remoteUser` in the image's devcontainer
/// metadata label.
pub fn extract_remote_user(labels: &Map<String, String>) -> Result<String> {
    let metadata = labels.get(METADATA_LABEL).ok_or_else(|| {
        Error::ProtocolViolation(format!("image has no {} label", METADATA_LABEL))
    })?;

    let entries: Vec<Value> = serde_json::from_str(metadata).map_err(|err| {
        Error::ProtocolViolation(format!("{} is not a JSON array: {}", METADATA_LABEL, err))
    })?;

    entries
        .iter()
        .filter_map(|entry| entry.get("remoteUser").and_then(Value::as_str))
        .find(|user| !user.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| {
            Error::ProtocolViolation(format!("no remoteUser in {} label", METADATA_LABEL))
        })
}
