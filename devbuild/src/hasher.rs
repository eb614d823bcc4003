use std::{fmt, path::Component};

use crate::models::{BuildConfig, Project};

/// A sink for build inputs. Every field is length-prefixed so neighbouring
/// fields cannot run into each other, and the encoding does not depend on
/// the toolchain the way `std::hash::Hash` output does.
pub trait DigestHasher {
    fn update_bytes(&mut self, bytes: &[u8]);

    fn tag(&mut self, tag: u8) {
        self.update_bytes(&[tag]);
    }

    fn field(&mut self, value: &str) {
        self.update_bytes(&(value.len() as u64).to_le_bytes());
        self.update_bytes(value.as_bytes());
    }

    fn optional(&mut self, value: Option<&str>) {
        match value {
            None => self.tag(0),
            Some(value) => {
                self.tag(1);
                self.field(value);
            }
        }
    }
}

impl DigestHasher for blake3::Hasher {
    fn update_bytes(&mut self, bytes: &[u8]) {
        self.update(bytes);
    }
}

impl DigestHasher for Vec<u8> {
    fn update_bytes(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ConfigHash(pub String);

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The build-relevant slice of a project. Names and workspace ids are left
/// out so renaming a project keeps its cached build.
struct BuildInputs<'a> {
    url: &'a str,
    branch: Option<&'a str>,
    sha: Option<&'a str>,
    build: NormalizedBuild<'a>,
}

enum NormalizedBuild<'a> {
    Unset,
    Devcontainer(String),
    Image(&'a str),
}

impl BuildInputs<'_> {
    fn write<H: DigestHasher>(&self, hasher: &mut H) {
        hasher.field(self.url);
        hasher.optional(self.branch);
        hasher.optional(self.sha);

        match &self.build {
            NormalizedBuild::Unset => hasher.tag(0),
            NormalizedBuild::Devcontainer(path) => {
                hasher.tag(1);
                hasher.field(path);
            }
            NormalizedBuild::Image(image) => {
                hasher.tag(2);
                hasher.field(image);
            }
        }
    }
}

fn normalize_build(build: &BuildConfig) -> NormalizedBuild<'_> {
    match build {
        BuildConfig::Unset => NormalizedBuild::Unset,
        BuildConfig::Devcontainer { file_path } => NormalizedBuild::Devcontainer(
            file_path
                .components()
                .filter(|component| *component != Component::CurDir)
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
        ),
        BuildConfig::Image { image } => NormalizedBuild::Image(image.trim()),
    }
}

fn build_inputs(project: &Project) -> BuildInputs<'_> {
    let repository = &project.repository;
    BuildInputs {
        url: repository.url.trim(),
        branch: repository.branch().map(str::trim),
        sha: repository.sha().map(str::trim),
        build: normalize_build(&project.build),
    }
}

pub fn config_hash(project: &Project) -> ConfigHash {
    let mut hasher = blake3::Hasher::new();
    build_inputs(project).write(&mut hasher);
    ConfigHash(hasher.finalize().to_hex().to_string())
}
