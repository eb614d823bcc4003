use bollard::{
    auth::DockerCredentials,
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions,
    },
    errors::Error as DockerError,
    exec::{CreateExecOptions, StartExecResults},
    image::{CreateImageOptions, PushImageOptions, TagImageOptions},
    models::HostConfig,
    Docker, API_DEFAULT_VERSION,
};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use log::{debug, info};
use std::{
    future::Future,
    io::{self, Write},
    path::Path,
    sync::Arc,
    thread,
    time::Duration,
};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    models::{
        AttachedExec, ContainerId, ContainerSpec, ExecId, ExecOutput, ExecSpec, Image, ImageId,
        ImageName, RegistryAuth,
    },
    services::{ContainerBackend, LineStream},
};

const SOCKET_TIMEOUT_SECS: u64 = 120;
const EXEC_INSPECT_ATTEMPTS: u32 = 50;
const EXEC_INSPECT_DELAY: Duration = Duration::from_millis(100);

/// Docker Engine API client. Calls block the caller on a runtime shared by
/// every connection derived from the first one, and give up with
/// `Error::Cancelled` once the cancellation token fires.
pub struct DockerBackend {
    docker: Docker,
    runtime: Arc<Runtime>,
    cancel: CancellationToken,
}

impl DockerBackend {
    pub fn connect(cancel: CancellationToken) -> Result<DockerBackend> {
        let runtime = Arc::new(runtime()?);

        let docker = {
            let _guard = runtime.enter();
            Docker::connect_with_local_defaults()?
        };

        let mut backend = DockerBackend {
            docker,
            runtime,
            cancel,
        };
        backend.docker = backend.block_on(backend.docker.clone().negotiate_version())?;

        Ok(backend)
    }

    fn block_on<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T, DockerError>>,
    {
        let cancel = self.cancel.clone();
        self.runtime.block_on(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = future => result.map_err(Error::from),
            }
        })
    }

    fn next_item<S, T>(&self, stream: &mut S) -> Result<Option<T>>
    where
        S: Stream<Item = Result<T, DockerError>> + Unpin,
    {
        next_item(&self.runtime, &self.cancel, stream)
    }

    fn lines(&self, stream: BoxStream<'static, Result<LogOutput, DockerError>>) -> OutputLines {
        OutputLines {
            runtime: self.runtime.clone(),
            cancel: self.cancel.clone(),
            stream,
            buffer: LineBuffer::default(),
            finished: false,
        }
    }
}

fn runtime() -> Result<Runtime> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("devbuild-docker")
        .enable_all()
        .build()?;

    Ok(runtime)
}

fn next_item<S, T>(runtime: &Runtime, cancel: &CancellationToken, stream: &mut S) -> Result<Option<T>>
where
    S: Stream<Item = Result<T, DockerError>> + Unpin,
{
    runtime.block_on(async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            item = stream.next() => item.transpose().map_err(Error::from),
        }
    })
}

fn progress_line(
    status: Option<&str>,
    progress: Option<&str>,
    id: Option<&str>,
) -> Option<String> {
    let status = status.filter(|status| !status.is_empty())?;
    let mut line = String::new();

    if let Some(id) = id.filter(|id| !id.is_empty()) {
        line.push_str(id);
        line.push_str(": ");
    }
    line.push_str(status);
    if let Some(progress) = progress.filter(|progress| !progress.is_empty()) {
        line.push(' ');
        line.push_str(progress);
    }

    Some(line)
}

impl ContainerBackend for DockerBackend {
    fn pull_image(&mut self, name: &ImageName, logger: &mut dyn Write) -> Result<()> {
        let (repository, tag) = name.split_tag();
        let options = CreateImageOptions {
            from_image: repository.to_owned(),
            tag: tag.to_owned(),
            ..Default::default()
        };

        info!("pulling image {}", name);
        let mut stream = Box::pin(self.docker.create_image(Some(options), None, None));

        while let Some(info) = self.next_item(&mut stream)? {
            if let Some(message) = info.error {
                return Err(Error::Daemon {
                    operation: "pull",
                    message,
                });
            }

            if let Some(line) = progress_line(
                info.status.as_deref(),
                info.progress.as_deref(),
                info.id.as_deref(),
            ) {
                writeln!(logger, "{}", line)?;
            }
        }

        Ok(())
    }

    fn inspect_image(&mut self, name: &ImageName) -> Result<Image> {
        let inspect = self.block_on(self.docker.inspect_image(&name.0))?;

        let labels = inspect
            .config
            .and_then(|config| config.labels)
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();

        Ok(Image {
            id: ImageId(inspect.id.unwrap_or_default()),
            labels,
        })
    }

    fn tag_image(&mut self, source: &ImageName, target: &ImageName) -> Result<()> {
        let (repository, tag) = target.split_tag();
        let options = TagImageOptions {
            repo: repository.to_owned(),
            tag: tag.to_owned(),
        };

        debug!("tagging {} as {}", source, target);
        self.block_on(self.docker.tag_image(&source.0, Some(options)))
    }

    fn push_image(
        &mut self,
        name: &ImageName,
        auth: &RegistryAuth,
        logger: &mut dyn Write,
    ) -> Result<()> {
        let (repository, tag) = name.split_tag();
        let options = PushImageOptions {
            tag: tag.to_owned(),
        };
        let credentials = DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            serveraddress: Some(auth.server.clone()),
            ..Default::default()
        };

        info!("pushing image {}", name);
        let mut stream = Box::pin(self.docker.push_image(
            repository,
            Some(options),
            Some(credentials),
        ));

        while let Some(info) = self.next_item(&mut stream)? {
            if let Some(message) = info.error {
                return Err(Error::Daemon {
                    operation: "push",
                    message,
                });
            }

            if let Some(line) = progress_line(info.status.as_deref(), info.progress.as_deref(), None)
            {
                writeln!(logger, "{}", line)?;
            }
        }

        Ok(())
    }

    fn create_container(&mut self, spec: ContainerSpec) -> Result<ContainerId> {
        let host_config = HostConfig {
            binds: Some(spec.binds),
            network_mode: spec.network_mode,
            privileged: Some(spec.privileged),
            ..Default::default()
        };

        let entrypoint = if spec.entrypoint.is_empty() {
            None
        } else {
            Some(spec.entrypoint)
        };

        let config = Config {
            image: Some(spec.image.0),
            entrypoint,
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let reply = self.block_on(self.docker.create_container(Some(options), config))?;
        debug!("created container {} ({})", spec.name, reply.id);

        Ok(ContainerId(reply.id))
    }

    fn start_container(&mut self, name: &str) -> Result<()> {
        self.block_on(
            self.docker
                .start_container(name, None::<StartContainerOptions<String>>),
        )
    }

    fn remove_container(&mut self, name: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        match self.block_on(self.docker.remove_container(name, Some(options))) {
            Err(Error::ControlPlane(DockerError::DockerResponseServerError {
                status_code: 404,
                ..
            })) => {
                debug!("container {} already removed", name);
                Ok(())
            }
            result => result,
        }
    }

    fn exec_sync(&mut self, container: &str, exec: &ExecSpec) -> Result<ExecOutput> {
        let attached = self.exec_attached(container, exec)?;

        let mut output = String::new();
        for line in attached.lines {
            output.push_str(&line?);
            output.push('\n');
        }

        let exit_code = self.exec_exit_code(&attached.id)?;
        if exit_code != 0 {
            return Err(Error::ExecFailed {
                command: exec.program().to_owned(),
                exit_code,
                output,
            });
        }

        Ok(ExecOutput { output, exit_code })
    }

    fn exec_attached(&mut self, container: &str, exec: &ExecSpec) -> Result<AttachedExec> {
        let env = if exec.env.is_empty() {
            None
        } else {
            Some(exec.env_list())
        };

        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(exec.cmd.clone()),
            env,
            user: exec.user.clone(),
            ..Default::default()
        };

        let created = self.block_on(self.docker.create_exec(container, options))?;
        debug!("created exec {} for {} in {}", created.id, exec.program(), container);

        match self.block_on(self.docker.start_exec(&created.id, None))? {
            StartExecResults::Attached { output, .. } => Ok(AttachedExec {
                id: ExecId(created.id),
                lines: Box::new(self.lines(output)),
            }),
            StartExecResults::Detached => Err(Error::ProtocolViolation(format!(
                "exec {} started detached although output was requested",
                created.id
            ))),
        }
    }

    fn exec_exit_code(&mut self, exec: &ExecId) -> Result<i64> {
        // The output stream can close a moment before the runtime records
        // the exit code.
        for _ in 0..EXEC_INSPECT_ATTEMPTS {
            let inspect = self.block_on(self.docker.inspect_exec(&exec.0))?;

            if inspect.running != Some(true) {
                return inspect.exit_code.ok_or_else(|| {
                    Error::ProtocolViolation(format!("exec {} finished without an exit code", exec.0))
                });
            }

            thread::sleep(EXEC_INSPECT_DELAY);
        }

        Err(Error::ProtocolViolation(format!(
            "exec {} still running after its output closed",
            exec.0
        )))
    }

    fn logs(&mut self, container: &str) -> Result<LineStream> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".into(),
            ..Default::default()
        };

        let stream = self.docker.logs(container, Some(options)).boxed();
        Ok(Box::new(self.lines(stream)))
    }

    fn try_clone(&self) -> Result<Box<dyn ContainerBackend>> {
        self.with_cancel(self.cancel.clone())
    }

    fn with_cancel(&self, cancel: CancellationToken) -> Result<Box<dyn ContainerBackend>> {
        Ok(Box::new(DockerBackend {
            docker: self.docker.clone(),
            runtime: self.runtime.clone(),
            cancel,
        }))
    }

    fn connect_nested(&self, socket: &Path) -> Result<Box<dyn ContainerBackend>> {
        let socket = socket.to_str().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("socket path {:?} is not valid utf-8", socket),
            )
        })?;

        let docker = {
            let _guard = self.runtime.enter();
            Docker::connect_with_unix(socket, SOCKET_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        };

        let mut backend = DockerBackend {
            docker,
            runtime: self.runtime.clone(),
            cancel: self.cancel.clone(),
        };
        backend.docker = backend.block_on(backend.docker.clone().negotiate_version())?;

        Ok(Box::new(backend))
    }
}

/// Raw output bytes waiting for their newline. Lines are decoded only once
/// complete, so a character split across chunks survives intact.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.bytes.iter().position(|byte| *byte == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=newline).collect();
        Some(decode(&line))
    }

    /// Whatever is left once the stream has closed.
    fn rest(&mut self) -> Option<String> {
        if self.bytes.is_empty() {
            return None;
        }
        Some(decode(&std::mem::take(&mut self.bytes)))
    }

    fn clear(&mut self) {
        self.bytes.clear();
    }
}

fn decode(line: &[u8]) -> String {
    String::from_utf8_lossy(line)
        .trim_end_matches(&['\n', '\r'][..])
        .to_owned()
}

/// Splits a multiplexed runtime stream into lines. Partial lines are held
/// until their newline arrives or the stream closes.
struct OutputLines {
    runtime: Arc<Runtime>,
    cancel: CancellationToken,
    stream: BoxStream<'static, Result<LogOutput, DockerError>>,
    buffer: LineBuffer,
    finished: bool,
}

impl Iterator for OutputLines {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Result<String>> {
        loop {
            if let Some(line) = self.buffer.next_line() {
                return Some(Ok(line));
            }

            if self.finished {
                return self.buffer.rest().map(Ok);
            }

            match next_item(&self.runtime, &self.cancel, &mut self.stream) {
                Ok(Some(output)) => self.buffer.push(&output.into_bytes()),
                Ok(None) => self.finished = true,
                Err(err) => {
                    self.finished = true;
                    self.buffer.clear();
                    return Some(Err(err));
                }
            }
        }
    }
}
