use anyhow::{bail, Context, Result};
use crossterm::{
    cursor,
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use log::{info, warn};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    io::{stdout, Write},
    path::PathBuf,
    thread,
};
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

use backends::DockerBackend;
use config::{BuilderConfig, CloneMode};
use factory::{BuilderFactory, FactoryOutcome};
use git::GitService;
use hasher::config_hash;
use identity::{LocalIdentity, SshIdentity};
use logger::FileLoggerFactory;
use models::{BuildConfig, BuildRecord, GitProviderConfig, ImageName, Project, Repository};
use provision::ContainerCloner;
use services::{ContainerBackend, IdentitySource};
use store::BuildStore;

mod backends;
mod builders;
mod config;
mod error;
mod factory;
mod git;
mod hasher;
mod identity;
mod logger;
mod models;
mod ownership;
mod provision;
mod relay;
mod services;
mod store;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "devbuild",
    about = "Builds workspace project images from devcontainer configurations."
)]
struct Opt {
    #[structopt(short, long, parse(from_os_str))]
    /// YAML file with builder settings.
    config: Option<PathBuf>,

    #[structopt(short, long)]
    /// Echo the project log to stdout.
    verbose: bool,

    #[structopt(long)]
    /// Take the UID/GID for container clones from this SSH destination.
    ssh: Option<String>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Clones a project and builds its image, unless an identical build exists.
    Build {
        #[structopt(flatten)]
        project: ProjectArgs,

        #[structopt(long, requires = "token")]
        username: Option<String>,

        #[structopt(long, requires = "username")]
        token: Option<String>,

        #[structopt(long)]
        /// Push the built image to the local registry.
        publish: bool,
    },
    /// Prints the recorded build for a project, if there is one.
    Check {
        #[structopt(flatten)]
        project: ProjectArgs,
    },
}

#[derive(Debug, StructOpt)]
struct ProjectArgs {
    #[structopt(long)]
    workspace: String,

    #[structopt(long)]
    name: String,

    #[structopt(long)]
    repository: String,

    #[structopt(long)]
    branch: Option<String>,

    #[structopt(long)]
    sha: Option<String>,

    #[structopt(long, parse(from_os_str), conflicts_with = "image")]
    /// Devcontainer file, relative to the repository root.
    devcontainer: Option<PathBuf>,

    #[structopt(long)]
    /// Pre-built image to use when the repository has no devcontainer.
    image: Option<String>,
}

impl ProjectArgs {
    fn into_project(self) -> Project {
        let build = match (self.devcontainer, self.image) {
            (Some(file_path), _) => BuildConfig::Devcontainer { file_path },
            (None, Some(image)) => BuildConfig::Image { image },
            (None, None) => BuildConfig::Unset,
        };

        Project {
            name: self.name,
            workspace_id: self.workspace,
            repository: Repository {
                url: self.repository,
                branch: self.branch,
                sha: self.sha,
            },
            build,
        }
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init_custom_env("DEVBUILD_LOG");

    let opt = Opt::from_args();

    let config = match &opt.config {
        Some(path) => BuilderConfig::load(path)
            .with_context(|| format!("Couldn't load config file {:?}.", path))?,
        None => BuilderConfig::default(),
    };
    info!("using config {:?}", config);

    match opt.command {
        Command::Check { project } => check(&config, project.into_project()),
        Command::Build {
            project,
            username,
            token,
            publish,
        } => {
            let credentials = match (username, token) {
                (Some(username), Some(token)) => Some(GitProviderConfig { username, token }),
                (None, None) => None,
                _ => bail!("--username and --token must be given together."),
            };

            let identity: Box<dyn IdentitySource> = match opt.ssh {
                Some(destination) => Box::new(SshIdentity { destination }),
                None => Box::new(LocalIdentity),
            };

            let cancel = CancellationToken::new();
            watch_signals(cancel.clone())?;

            let options = BuildOptions {
                credentials,
                identity,
                publish,
                verbose: opt.verbose,
            };
            build(config, project.into_project(), options, cancel)
        }
    }
}

fn check(config: &BuilderConfig, project: Project) -> Result<()> {
    let store = BuildStore::new(config.builds_path());

    match store.load(&config_hash(&project))? {
        Some(record) => print_record(&mut stdout(), &record)?,
        None => println!("No build recorded for {}/{}.", project.workspace_id, project.name),
    }

    Ok(())
}

struct BuildOptions {
    credentials: Option<GitProviderConfig>,
    identity: Box<dyn IdentitySource>,
    publish: bool,
    verbose: bool,
}

fn build(
    config: BuilderConfig,
    project: Project,
    options: BuildOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stdout = stdout();

    let backend = DockerBackend::connect(cancel.clone())
        .context("Couldn't connect to the container runtime.")?;
    info!("connected to the container runtime");

    let loggers = FileLoggerFactory::new(config.logs_path(), options.verbose);

    let mut factory = match config.clone_mode {
        CloneMode::Native => {
            BuilderFactory::init(config.clone(), backend, GitService, loggers, cancel)
        }
        CloneMode::Container => {
            let cloner = ContainerCloner::new(
                backend.try_clone()?,
                options.identity,
                ImageName(config.builder_image.clone()),
                config.workspace_user.clone(),
                cancel.clone(),
            );
            BuilderFactory::init(config.clone(), backend, cloner, loggers, cancel)
        }
    };

    let label = format!("Preparing {}/{}", project.workspace_id, project.name);
    let outcome = stage(&mut stdout, options.verbose, &label, || {
        factory.create(&project, options.credentials.as_ref())
    })?;

    let mut lease = match outcome {
        FactoryOutcome::Cached(record) => return print_record(&mut stdout, &record),
        FactoryOutcome::Build(lease) => lease,
    };

    let label = format!("Building {}", lease.build_id());
    let built = stage(&mut stdout, options.verbose, &label, || lease.build());

    let published = match (&built, options.publish) {
        (Ok(result), true) => {
            let label = format!("Publishing {}", result.image_name);
            stage(&mut stdout, options.verbose, &label, || lease.publish())
        }
        _ => Ok(()),
    };

    let label = format!("Cleaning up {}", lease.build_id());
    let cleaned = stage(&mut stdout, options.verbose, &label, || lease.cleanup());

    let result = built?;
    published?;
    cleaned?;

    print_record(&mut stdout, &BuildRecord::from(&result))?;
    stdout
        .queue(style::Print(format!(
            "Project volume: {}\n",
            result.project_volume_path.display()
        )))?
        .flush()?;

    Ok(())
}

/// Runs one step of a build, printing `label ...` and then its status.
fn stage<T>(
    stdout: &mut impl Write,
    verbose: bool,
    label: &str,
    step: impl FnOnce() -> error::Result<T>,
) -> Result<T> {
    stdout
        .queue(style::Print(format!("{} ...\n", label)))?
        .flush()?;

    let result = step();

    let status = match &result {
        Ok(_) => "done".green().bold(),
        Err(_) => "failed".red().bold(),
    };

    // The project log may have been echoed below the label.
    if verbose {
        stdout
            .queue(style::Print(format!("{} ... ", label)))?
            .queue(style::PrintStyledContent(status))?
            .queue(style::Print("\n"))?;
    } else {
        stdout
            .queue(cursor::SavePosition)?
            .queue(cursor::MoveToPreviousLine(1))?
            .queue(cursor::MoveRight(label.len() as u16 + 5))?
            .queue(style::PrintStyledContent(status))?
            .queue(cursor::RestorePosition)?;
    }
    stdout.flush()?;

    Ok(result?)
}

fn print_record(stdout: &mut impl Write, record: &BuildRecord) -> Result<()> {
    stdout
        .queue(style::PrintStyledContent("Image: ".cyan().bold()))?
        .queue(style::Print(format!("{}\n", record.image_name.join(", "))))?;

    if let Some(user) = &record.user {
        stdout
            .queue(style::PrintStyledContent("Remote user: ".cyan().bold()))?
            .queue(style::Print(format!("{}\n", user)))?;
    }

    stdout.flush()?;
    Ok(())
}

/// Cancels `cancel` on the first SIGINT or SIGTERM. Blocking calls then fail
/// and the build lease releases its container on the way out.
fn watch_signals(cancel: CancellationToken) -> Result<()> {
    let mut signals = Signals::new(&[SIGINT, SIGTERM])?;

    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                warn!("received signal {}, cancelling", signal);
                cancel.cancel();
            }
        })?;

    Ok(())
}
