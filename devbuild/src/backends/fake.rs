use std::{
    collections::BTreeMap as Map,
    io::Write,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    models::{
        AttachedExec, ContainerId, ContainerSpec, ExecId, ExecOutput, ExecSpec, Image, ImageId,
        ImageName, RegistryAuth,
    },
    services::{ContainerBackend, LineStream},
};

#[derive(Clone, Debug)]
pub struct ScriptedExec {
    pub lines: Vec<String>,
    pub exit_code: i64,
}

#[derive(Default)]
pub struct FakeState {
    pub calls: Vec<String>,
    pub execs: Vec<ExecSpec>,
    scripted: Vec<(String, ScriptedExec)>,
    hanging: Vec<String>,
    failed_removals: usize,
    exit_codes: Map<String, i64>,
    pub image_labels: Map<String, String>,
    pub files: Map<String, String>,
    pub containers: Vec<String>,
    pub tags: Vec<(String, String)>,
}

/// In-memory runtime. Clones, nested connections included, share one state
/// so tests can inspect every call a pipeline made. Like the real backend,
/// calls fail with `Error::Cancelled` once the backend's token fires.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
    cancel: CancellationToken,
}

impl FakeBackend {
    pub fn new() -> FakeBackend {
        FakeBackend::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Replies to any exec whose command line contains `needle`.
    pub fn script(&self, needle: &str, lines: &[&str], exit_code: i64) {
        self.state().scripted.push((
            needle.to_owned(),
            ScriptedExec {
                lines: lines.iter().map(|line| line.to_string()).collect(),
                exit_code,
            },
        ));
    }

    /// Output streams of execs and logs whose call contains `needle` block
    /// until the reading backend is cancelled.
    pub fn hang(&self, needle: &str) {
        self.state().hanging.push(needle.to_owned());
    }

    /// The next `count` removals fail.
    pub fn fail_removals(&self, count: usize) {
        self.state().failed_removals = count;
    }

    /// A handle on the same state, bound to `cancel`.
    pub fn cancelled_by(&self, cancel: CancellationToken) -> FakeBackend {
        FakeBackend {
            state: self.state.clone(),
            cancel,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn record(&self, call: String) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.state().calls.push(call);
        Ok(())
    }

    fn output(&self, call: &str, lines: Vec<String>) -> LineStream {
        let hangs = self
            .state()
            .hanging
            .iter()
            .any(|needle| call.contains(needle.as_str()));
        if !hangs {
            return Box::new(lines.into_iter().map(Ok::<String, Error>));
        }

        let cancel = self.cancel.clone();
        let mut done = false;
        Box::new(std::iter::from_fn(move || {
            if done {
                return None;
            }
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(10));
            }
            done = true;
            Some(Err(Error::Cancelled))
        }))
    }

    fn run(&self, container: &str, exec: &ExecSpec) -> Result<(ExecId, ScriptedExec)> {
        let command = exec.cmd.join(" ");
        self.record(format!("exec {} {}", container, command))?;

        let mut state = self.state();
        state.execs.push(exec.clone());

        let scripted = state
            .scripted
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, scripted)| scripted.clone())
            .or_else(|| match exec.cmd.as_slice() {
                [cat, path] if cat == "cat" => state.files.get(path).map(|contents| ScriptedExec {
                    lines: contents.lines().map(str::to_owned).collect(),
                    exit_code: 0,
                }),
                _ => None,
            })
            .unwrap_or(ScriptedExec {
                lines: Vec::new(),
                exit_code: 0,
            });

        let id = format!("exec-{}", state.execs.len());
        state.exit_codes.insert(id.clone(), scripted.exit_code);

        Ok((ExecId(id), scripted))
    }
}

impl ContainerBackend for FakeBackend {
    fn pull_image(&mut self, name: &ImageName, logger: &mut dyn Write) -> Result<()> {
        self.record(format!("pull {}", name))?;
        writeln!(logger, "pulled {}", name)?;
        Ok(())
    }

    fn inspect_image(&mut self, name: &ImageName) -> Result<Image> {
        self.record(format!("inspect {}", name))?;
        Ok(Image {
            id: ImageId(format!("sha256:{}", name)),
            labels: self.state().image_labels.clone(),
        })
    }

    fn tag_image(&mut self, source: &ImageName, target: &ImageName) -> Result<()> {
        self.record(format!("tag {} {}", source, target))?;
        self.state()
            .tags
            .push((source.0.clone(), target.0.clone()));
        Ok(())
    }

    fn push_image(
        &mut self,
        name: &ImageName,
        auth: &RegistryAuth,
        logger: &mut dyn Write,
    ) -> Result<()> {
        self.record(format!("push {} as {}", name, auth.username))?;
        writeln!(logger, "pushed {}", name)?;
        Ok(())
    }

    fn create_container(&mut self, spec: ContainerSpec) -> Result<ContainerId> {
        self.record(format!("create {} {}", spec.name, spec.binds.join(",")))?;
        self.state().containers.push(spec.name.clone());
        Ok(ContainerId(format!("id-{}", spec.name)))
    }

    fn start_container(&mut self, name: &str) -> Result<()> {
        self.record(format!("start {}", name))?;
        Ok(())
    }

    fn remove_container(&mut self, name: &str, force: bool) -> Result<()> {
        self.record(format!("remove {} force={}", name, force))?;

        let mut state = self.state();
        if state.failed_removals > 0 {
            state.failed_removals -= 1;
            return Err(Error::Daemon {
                operation: "remove",
                message: format!("container {} is stuck", name),
            });
        }
        state.containers.retain(|container| container != name);
        Ok(())
    }

    fn exec_sync(&mut self, container: &str, exec: &ExecSpec) -> Result<ExecOutput> {
        let (_, scripted) = self.run(container, exec)?;
        let output = scripted
            .lines
            .iter()
            .map(|line| format!("{}\n", line))
            .collect::<String>();

        if scripted.exit_code != 0 {
            return Err(Error::ExecFailed {
                command: exec.program().to_owned(),
                exit_code: scripted.exit_code,
                output,
            });
        }

        Ok(ExecOutput {
            output,
            exit_code: scripted.exit_code,
        })
    }

    fn exec_attached(&mut self, container: &str, exec: &ExecSpec) -> Result<AttachedExec> {
        let (id, scripted) = self.run(container, exec)?;
        let call = format!("exec {} {}", container, exec.cmd.join(" "));
        Ok(AttachedExec {
            id,
            lines: self.output(&call, scripted.lines),
        })
    }

    fn exec_exit_code(&mut self, exec: &ExecId) -> Result<i64> {
        self.state()
            .exit_codes
            .get(&exec.0)
            .copied()
            .ok_or_else(|| Error::ProtocolViolation(format!("unknown exec {}", exec.0)))
    }

    fn logs(&mut self, container: &str) -> Result<LineStream> {
        let call = format!("logs {}", container);
        self.record(call.clone())?;
        Ok(self.output(&call, Vec::new()))
    }

    fn try_clone(&self) -> Result<Box<dyn ContainerBackend>> {
        Ok(Box::new(self.clone()))
    }

    fn with_cancel(&self, cancel: CancellationToken) -> Result<Box<dyn ContainerBackend>> {
        Ok(Box::new(self.cancelled_by(cancel)))
    }

    fn connect_nested(&self, socket: &Path) -> Result<Box<dyn ContainerBackend>> {
        self.record(format!("connect {}", socket.display()))?;
        Ok(Box::new(self.clone()))
    }
}
