use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    CertificateCheckStatus, Cred, Direction, FetchOptions, Remote, RemoteCallbacks,
    Repository as GitRepository,
};
use log::{debug, info};
use std::{
    borrow::Cow,
    fs, io,
    io::Write,
    path::Path,
};

use crate::{
    config::TransportConfig,
    error::{Error, Result},
    logger::ProjectLogger,
    models::{GitProviderConfig, Repository},
    services::RepositoryCloner,
};

/// Clones repositories from the host process with libgit2.
#[derive(Default)]
pub struct GitService;

impl RepositoryCloner for GitService {
    fn clone_repository(
        &mut self,
        repository: &Repository,
        destination: &Path,
        credentials: Option<&GitProviderConfig>,
        transport: &TransportConfig,
        logger: &ProjectLogger,
    ) -> Result<()> {
        info!("Cloning {} into {:?}", repository.url, destination);

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let url = match credentials {
            Some(credentials) => embed_credentials(&repository.url, credentials),
            None => repository.url.clone(),
        };

        // Only the requested branch is fetched, or the remote's default
        // branch at full depth when none was requested.
        let branch = match repository.branch() {
            Some(branch) => branch.to_owned(),
            None => default_branch(&url, credentials, transport, logger)?,
        };

        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(callbacks(credentials, transport, logger));
        if repository.branch().is_some() && transport.shallow_depth > 0 {
            fetch.depth(transport.shallow_depth as i32);
        }

        let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch);
        let mut builder = RepoBuilder::new();
        builder
            .branch(&branch)
            .remote_create(move |repo, name, url| repo.remote_with_fetch(name, url, &refspec));

        let repo = builder.fetch_options(fetch).clone(&url, destination)?;

        if credentials.is_some() {
            repo.remote_set_url("origin", &repository.url)?;
        }

        if repository.should_checkout_sha() {
            if let Some(sha) = repository.sha() {
                checkout_detached(&repo, sha)?;
            }
        }

        Ok(())
    }
}

fn callbacks<'a>(
    credentials: Option<&'a GitProviderConfig>,
    transport: &TransportConfig,
    logger: &ProjectLogger,
) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();

    if transport.skip_tls_verify {
        callbacks.certificate_check(|_, host| {
            debug!("Skipping certificate check for {}", host);
            Ok(CertificateCheckStatus::CertificateOk)
        });
    }

    if let Some(credentials) = credentials {
        // libgit2 keeps asking for as long as the server rejects us.
        let mut offered = false;
        callbacks.credentials(move |_, _, _| {
            if offered {
                return Err(git2::Error::from_str("credentials rejected"));
            }
            offered = true;
            Cred::userpass_plaintext(&credentials.username, &credentials.token)
        });
    }

    let mut progress = logger.clone();
    callbacks.sideband_progress(move |data| progress.write_all(data).is_ok());

    callbacks
}

fn default_branch(
    url: &str,
    credentials: Option<&GitProviderConfig>,
    transport: &TransportConfig,
    logger: &ProjectLogger,
) -> Result<String> {
    let mut remote = Remote::create_detached(url)?;
    let connection = remote.connect_auth(
        Direction::Fetch,
        Some(callbacks(credentials, transport, logger)),
        None,
    )?;

    let head = connection.default_branch()?;
    let head = head
        .as_str()
        .ok_or_else(|| Error::ProtocolViolation("remote HEAD is not valid utf-8".into()))?;
    debug!("remote HEAD is {}", head);

    Ok(head.strip_prefix("refs/heads/").unwrap_or(head).to_owned())
}

fn checkout_detached(repo: &GitRepository, sha: &str) -> Result<()> {
    let object = repo.revparse_single(sha)?;
    repo.checkout_tree(&object, Some(CheckoutBuilder::new().force()))?;
    repo.set_head_detached(object.id())?;
    Ok(())
}

/// Rewrites a repository URL into `https://<user>:<token>@<host>/<path>`.
pub fn embed_credentials(url: &str, credentials: &GitProviderConfig) -> String {
    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    format!(
        "https://{}:{}@{}",
        urlencoding::encode(&credentials.username),
        urlencoding::encode(&credentials.token),
        stripped
    )
}

/// The shell equivalent of [`GitService::clone_repository`], for running the
/// clone inside a container. Words are returned unquoted; see
/// [`render_command`].
pub fn clone_command(
    repository: &Repository,
    destination: &str,
    credentials: Option<&GitProviderConfig>,
    transport: &TransportConfig,
) -> Vec<String> {
    let mut command: Vec<String> = vec!["git".into(), "clone".into(), "--single-branch".into()];

    if let Some(branch) = repository.branch() {
        if transport.shallow_depth > 0 {
            command.push("--depth".into());
            command.push(transport.shallow_depth.to_string());
        }
        command.push("--branch".into());
        command.push(branch.into());
    }

    if transport.skip_tls_verify {
        command.push("-c".into());
        command.push("http.sslVerify=false".into());
    }

    command.push(match credentials {
        Some(credentials) => embed_credentials(&repository.url, credentials),
        None => repository.url.clone(),
    });
    command.push(destination.into());

    if repository.should_checkout_sha() {
        if let Some(sha) = repository.sha() {
            command.extend(
                ["&&", "cd", destination, "&&", "git", "checkout", sha]
                    .iter()
                    .map(|word| word.to_string()),
            );
        }
    }

    command
}

/// Joins a command into one `sh -c` string, quoting every word except `&&`.
pub fn render_command(command: &[String]) -> Result<String> {
    let words = command
        .iter()
        .map(|word| {
            if word == "&&" {
                Ok(Cow::from(word.as_str()))
            } else {
                shlex::try_quote(word).map_err(|err| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("cannot quote {:?}: {}", word, err),
                    ))
                })
            }
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(words.join(" "))
}

pub fn repository_exists(directory: &Path) -> Result<bool> {
    match fs::metadata(directory.join(".git")) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}
