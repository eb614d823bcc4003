use log::{info, warn};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::{
    builders::{remove_tree, BuildContext, BuilderLease, DevcontainerBuilder, ImageBuilder},
    config::BuilderConfig,
    error::{Error, Result},
    git::repository_exists,
    hasher::{config_hash, ConfigHash},
    models::{BuildConfig, BuildId, BuildRecord, GitProviderConfig, ImageName, Project},
    services::{Builder, ContainerBackend, LoggerFactory, RepositoryCloner},
    store::BuildStore,
};

const DEVCONTAINER_LOCATIONS: [&str; 2] = [".devcontainer/devcontainer.json", ".devcontainer.json"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Devcontainer file, relative to the project root.
    Devcontainer(PathBuf),
    Image(ImageName),
}

pub enum FactoryOutcome {
    /// A previous build for the same inputs. Nothing was cloned or started.
    Cached(BuildRecord),
    Build(BuilderLease),
}

pub struct BuilderFactory {
    config: BuilderConfig,
    backend: Box<dyn ContainerBackend>,
    cloner: Box<dyn RepositoryCloner>,
    loggers: Box<dyn LoggerFactory>,
    store: BuildStore,
    cancel: CancellationToken,
}

impl BuilderFactory {
    pub fn init<B, C, L>(
        config: BuilderConfig,
        backend: B,
        cloner: C,
        loggers: L,
        cancel: CancellationToken,
    ) -> BuilderFactory
    where
        B: 'static + ContainerBackend,
        C: 'static + RepositoryCloner,
        L: 'static + LoggerFactory,
    {
        let store = BuildStore::new(config.builds_path());

        BuilderFactory {
            config,
            backend: Box::new(backend),
            cloner: Box::new(cloner),
            loggers: Box::new(loggers),
            store,
            cancel,
        }
    }

    pub fn check_existing_build(&self, project: &Project) -> Result<Option<BuildRecord>> {
        self.store.load(&config_hash(project))
    }

    /// Resolves a project to a cached build or to a builder over a fresh
    /// clone. The builder has not run yet.
    pub fn create(
        &mut self,
        project: &Project,
        credentials: Option<&GitProviderConfig>,
    ) -> Result<FactoryOutcome> {
        if let Some(record) = self.check_existing_build(project)? {
            info!("Found build for {}/{}", project.workspace_id, project.name);
            return Ok(FactoryOutcome::Cached(record));
        }

        let hash = config_hash(project);

        let project_dir = self.project_dir(&hash);
        remove_tree(&project_dir)?;

        let logger = self
            .loggers
            .project_logger(&project.workspace_id, &project.name)?;

        let strategy = self
            .cloner
            .clone_repository(
                &project.repository,
                &project_dir,
                credentials,
                &self.config.transport,
                &logger,
            )
            .and_then(|()| match repository_exists(&project_dir)? {
                true => detect_strategy(&project_dir, &project.build),
                false => Err(Error::ProtocolViolation(format!(
                    "clone finished but {:?} holds no repository",
                    project_dir
                ))),
            });

        let strategy = match strategy {
            Ok(strategy) => strategy,
            Err(err) => {
                if let Err(cleanup) = remove_tree(&project_dir) {
                    warn!("Failed to remove {:?}: {}", project_dir, cleanup);
                }
                return Err(err);
            }
        };

        let context = BuildContext {
            id: BuildId::generate(),
            project: project.clone(),
            project_dir,
            logger,
        };
        info!("Build {} uses {:?}", context.id, strategy);

        let builder: Box<dyn Builder> = match strategy {
            Strategy::Devcontainer(config_file) => Box::new(DevcontainerBuilder::new(
                context,
                config_file,
                &self.config,
                self.backend.try_clone()?,
                self.cancel.clone(),
            )),
            Strategy::Image(image) => Box::new(ImageBuilder::new(
                context,
                image,
                self.config.default_project_user.clone(),
            )),
        };

        Ok(FactoryOutcome::Build(BuilderLease::new(
            builder,
            self.store.clone(),
            hash,
        )))
    }

    fn project_dir(&self, hash: &ConfigHash) -> PathBuf {
        self.config
            .base_path()
            .join(hash.to_string())
            .join("project")
    }
}

/// Picks a build strategy for a cloned project. A devcontainer file wins over
/// an image; a declared devcontainer path is used only if it exists.
pub fn detect_strategy(project_dir: &Path, build: &BuildConfig) -> Result<Strategy> {
    if let BuildConfig::Devcontainer { file_path } = build {
        if project_dir.join(file_path).is_file() {
            return Ok(Strategy::Devcontainer(file_path.clone()));
        }
        warn!("{:?} not found in {:?}", file_path, project_dir);
    }

    for location in DEVCONTAINER_LOCATIONS.iter() {
        if project_dir.join(location).is_file() {
            return Ok(Strategy::Devcontainer(PathBuf::from(location)));
        }
    }

    match build {
        BuildConfig::Image { image } if !image.trim().is_empty() => {
            Ok(Strategy::Image(ImageName(image.trim().to_owned())))
        }
        _ => Err(Error::UnknownStrategy(project_dir.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::fake::FakeBackend,
        config::TransportConfig,
        logger::{FileLoggerFactory, ProjectLogger},
        models::Repository,
    };
    use std::{
        fs,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use tempfile::TempDir;

    const OUTCOME_LINE: &str = r#"{"outcome":"success","imageName":["vsc-api-4f3c:latest"]}"#;

    /// Writes a fixed tree instead of cloning.
    #[derive(Clone, Default)]
    struct FixtureCloner {
        files: Vec<(&'static str, &'static str)>,
        clones: Arc<AtomicUsize>,
    }

    impl RepositoryCloner for FixtureCloner {
        fn clone_repository(
            &mut self,
            _repository: &Repository,
            destination: &Path,
            _credentials: Option<&GitProviderConfig>,
            _transport: &TransportConfig,
            logger: &ProjectLogger,
        ) -> Result<()> {
            self.clones.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(destination.join(".git"))?;

            for (path, contents) in self.files.iter() {
                let path = destination.join(path);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, contents)?;
            }

            logger.line("cloned fixture")?;
            Ok(())
        }
    }

    struct Fixture {
        root: TempDir,
        backend: FakeBackend,
        cloner: FixtureCloner,
    }

    impl Fixture {
        fn new(files: Vec<(&'static str, &'static str)>) -> Fixture {
            Fixture {
                root: tempfile::tempdir().unwrap(),
                backend: FakeBackend::new(),
                cloner: FixtureCloner {
                    files,
                    ..Default::default()
                },
            }
        }

        fn config(&self) -> BuilderConfig {
            BuilderConfig {
                server_config_folder: self.root.path().join("config"),
                runtime_dir: self.root.path().join("run"),
                ..Default::default()
            }
        }

        fn factory(&self) -> BuilderFactory {
            let config = self.config();
            let loggers = FileLoggerFactory::new(config.logs_path(), false);

            BuilderFactory::init(
                config,
                self.backend.clone(),
                self.cloner.clone(),
                loggers,
                CancellationToken::new(),
            )
        }

        fn clones(&self) -> usize {
            self.cloner.clones.load(Ordering::SeqCst)
        }
    }

    fn project(build: BuildConfig) -> Project {
        Project {
            name: "api".into(),
            workspace_id: "ws".into(),
            repository: Repository {
                url: "https://github.com/daytonaio/sample.git".into(),
                branch: Some("main".into()),
                sha: None,
            },
            build,
        }
    }

    fn lease(outcome: FactoryOutcome) -> BuilderLease {
        match outcome {
            FactoryOutcome::Build(lease) => lease,
            FactoryOutcome::Cached(record) => panic!("unexpected cache hit: {:?}", record),
        }
    }

    #[test]
    fn detects_conventional_devcontainer_locations() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            detect_strategy(dir.path(), &BuildConfig::Unset),
            Err(Error::UnknownStrategy(_))
        ));

        fs::write(dir.path().join(".devcontainer.json"), "{}").unwrap();
        assert_eq!(
            detect_strategy(dir.path(), &BuildConfig::Unset).unwrap(),
            Strategy::Devcontainer(PathBuf::from(".devcontainer.json"))
        );

        fs::create_dir(dir.path().join(".devcontainer")).unwrap();
        fs::write(dir.path().join(".devcontainer/devcontainer.json"), "{}").unwrap();
        assert_eq!(
            detect_strategy(dir.path(), &BuildConfig::Unset).unwrap(),
            Strategy::Devcontainer(PathBuf::from(".devcontainer/devcontainer.json"))
        );
    }

    #[test]
    fn declared_devcontainer_path_is_honoured_when_present() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("env/python")).unwrap();
        fs::write(dir.path().join("env/python/devcontainer.json"), "{}").unwrap();
        fs::write(dir.path().join(".devcontainer.json"), "{}").unwrap();

        let declared = BuildConfig::Devcontainer {
            file_path: PathBuf::from("env/python/devcontainer.json"),
        };
        assert_eq!(
            detect_strategy(dir.path(), &declared).unwrap(),
            Strategy::Devcontainer(PathBuf::from("env/python/devcontainer.json"))
        );

        let missing = BuildConfig::Devcontainer {
            file_path: PathBuf::from("env/go/devcontainer.json"),
        };
        assert_eq!(
            detect_strategy(dir.path(), &missing).unwrap(),
            Strategy::Devcontainer(PathBuf::from(".devcontainer.json"))
        );
    }

    #[test]
    fn image_is_used_only_without_devcontainer() {
        let dir = tempfile::tempdir().unwrap();
        let image = BuildConfig::Image {
            image: " ubuntu:22.04 ".into(),
        };

        assert_eq!(
            detect_strategy(dir.path(), &image).unwrap(),
            Strategy::Image(ImageName("ubuntu:22.04".into()))
        );

        fs::write(dir.path().join(".devcontainer.json"), "{}").unwrap();
        assert_eq!(
            detect_strategy(dir.path(), &image).unwrap(),
            Strategy::Devcontainer(PathBuf::from(".devcontainer.json"))
        );
    }

    #[test]
    fn second_request_is_served_from_cache() {
        let fixture = Fixture::new(vec![(".devcontainer/devcontainer.json", "{}")]);
        fixture.backend.script("devcontainer build", &[OUTCOME_LINE], 0);
        fixture
            .backend
            .state()
            .image_labels
            .insert("devcontainer.metadata".into(), r#"[{"remoteUser":"vscode"}]"#.into());

        let project = project(BuildConfig::Unset);
        let mut factory = fixture.factory();
        assert_eq!(factory.check_existing_build(&project).unwrap(), None);

        let mut lease = lease(factory.create(&project, None).unwrap());
        let result = lease.build().unwrap();
        lease.cleanup().unwrap();
        drop(lease);

        let calls = fixture.backend.calls().len();
        let clones = fixture.clones();

        match factory.create(&project, None).unwrap() {
            FactoryOutcome::Cached(record) => {
                assert_eq!(record.outcome, "success");
                assert_eq!(record.image_name, vec![result.image_name.0.clone()]);
                assert_eq!(record.user.as_deref(), Some("vscode"));
            }
            FactoryOutcome::Build(_) => panic!("expected a cache hit"),
        }

        assert_eq!(fixture.backend.calls().len(), calls);
        assert_eq!(fixture.clones(), clones);
        assert!(factory.check_existing_build(&project).unwrap().is_some());
    }

    #[test]
    fn stale_working_tree_is_purged_before_cloning() {
        let fixture = Fixture::new(vec![(".devcontainer.json", "{}")]);
        let project = project(BuildConfig::Unset);

        let stale = fixture
            .config()
            .base_path()
            .join(config_hash(&project).to_string())
            .join("project")
            .join("stale.txt");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, "left over").unwrap();

        let lease = lease(fixture.factory().create(&project, None).unwrap());

        assert!(!stale.exists());
        assert!(stale.with_file_name(".devcontainer.json").is_file());
        assert!(fixture.backend.calls().is_empty());
        drop(lease);
    }

    #[test]
    fn image_projects_get_an_image_builder() {
        let fixture = Fixture::new(vec![("README.md", "hello")]);
        let project = project(BuildConfig::Image {
            image: "mcr.microsoft.com/devcontainers/base:ubuntu".into(),
        });

        let mut lease = lease(fixture.factory().create(&project, None).unwrap());
        let result = lease.build().unwrap();

        assert_eq!(result.user, "daytona");
        assert_eq!(
            result.image_name,
            ImageName("mcr.microsoft.com/devcontainers/base:ubuntu".into())
        );
        assert!(fixture.backend.calls().is_empty());

        lease.cleanup().unwrap();
        assert!(!result.project_volume_path.exists());
    }

    #[test]
    fn unknown_strategy_removes_the_clone() {
        let fixture = Fixture::new(vec![("README.md", "hello")]);
        let project = project(BuildConfig::Unset);

        match fixture.factory().create(&project, None) {
            Err(Error::UnknownStrategy(dir)) => assert!(!dir.exists()),
            Err(err) => panic!("unexpected error: {}", err),
            Ok(_) => panic!("expected an error"),
        }
    }
}
