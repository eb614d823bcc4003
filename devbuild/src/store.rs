use log::debug;
use std::{
    fs::{self, File},
    io::{self, BufReader, Write},
    path::PathBuf,
};
use tempfile::NamedTempFile;

use crate::{
    error::{Error, Result},
    hasher::ConfigHash,
    models::BuildRecord,
};

/// Build records addressed by config hash, at `<root>/<hash>/build.json`.
#[derive(Clone, Debug)]
pub struct BuildStore {
    root: PathBuf,
}

impl BuildStore {
    pub fn new(root: PathBuf) -> BuildStore {
        BuildStore { root }
    }

    pub fn record_path(&self, hash: &ConfigHash) -> PathBuf {
        self.root.join(hash.to_string()).join("build.json")
    }

    pub fn load(&self, hash: &ConfigHash) -> Result<Option<BuildRecord>> {
        let path = self.record_path(hash);

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        serde_json::from_reader(BufReader::new(file))
            .map(Some)
            .map_err(|source| Error::Record { path, source })
    }

    /// Writes the record through a temporary file so readers never see a
    /// partial one.
    pub fn save(&self, hash: &ConfigHash, record: &BuildRecord) -> Result<PathBuf> {
        let path = self.record_path(hash);
        let dir = self.root.join(hash.to_string());
        fs::create_dir_all(&dir)?;

        let mut file = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut file, record).map_err(|source| Error::Record {
            path: path.clone(),
            source,
        })?;
        file.flush()?;
        file.persist(&path).map_err(|err| err.error)?;

        debug!("Saved build record {:?}", path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hasher::config_hash,
        models::{BuildConfig, Project, Repository},
    };

    fn hash() -> ConfigHash {
        config_hash(&Project {
            name: "api".into(),
            workspace_id: "ws".into(),
            repository: Repository {
                url: "https://github.com/daytonaio/sample.git".into(),
                branch: None,
                sha: None,
            },
            build: BuildConfig::Unset,
        })
    }

    #[test]
    fn missing_record_is_a_miss() {
        let root = tempfile::tempdir().unwrap();
        let store = BuildStore::new(root.path().to_owned());

        assert_eq!(store.load(&hash()).unwrap(), None);
    }

    #[test]
    fn saved_record_loads_back() {
        let root = tempfile::tempdir().unwrap();
        let store = BuildStore::new(root.path().to_owned());
        let record = BuildRecord {
            outcome: "success".into(),
            image_name: vec!["localhost:5000/p-0123456789ab:latest".into()],
            user: Some("vscode".into()),
        };

        let path = store.save(&hash(), &record).unwrap();

        assert_eq!(path, root.path().join(hash().to_string()).join("build.json"));
        assert_eq!(store.load(&hash()).unwrap(), Some(record));
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn corrupt_record_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let store = BuildStore::new(root.path().to_owned());
        let path = store.record_path(&hash());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{\"outcome\":").unwrap();

        match store.load(&hash()) {
            Err(Error::Record { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
