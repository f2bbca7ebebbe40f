//! Versioned on-disk records of managed processes (`pids/<name>.pid`).
//!
//! Records let a fresh supervisor rediscover processes started by an earlier
//! run. They are bookkeeping only: liveness is always re-verified with a
//! signal probe before a record is trusted. The directory is assumed to be
//! owned by a single supervisor instance; there is no cross-process locking.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const RECORD_VERSION: u32 = 1;
const RECORD_EXTENSION: &str = "pid";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt process record {}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable twin of a managed process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub version: u32,
    pub pid: u32,
    pub log_file: PathBuf,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl ProcessRecord {
    pub fn new(
        pid: u32,
        log_file: PathBuf,
        command: PathBuf,
        args: Vec<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            pid,
            log_file,
            command,
            args,
            started_at,
        }
    }
}

/// Directory of `<name>.pid` records.
#[derive(Debug, Clone)]
pub struct PidStore {
    dir: PathBuf,
}

impl PidStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{RECORD_EXTENSION}"))
    }

    pub fn ensure_dir(&self) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(|source| PersistenceError::Io {
            path: self.dir.clone(),
            source,
        })
    }

    /// Overwrite the record for `name`.
    pub fn save(&self, name: &str, record: &ProcessRecord) -> Result<(), PersistenceError> {
        self.ensure_dir()?;
        let path = self.path_for(name);
        let payload = serde_json::to_vec_pretty(record).map_err(|source| {
            PersistenceError::Corrupt {
                path: path.clone(),
                source,
            }
        })?;
        fs::write(&path, payload).map_err(|source| PersistenceError::Io { path, source })
    }

    /// Read the record for `name`; a missing file is `Ok(None)`.
    pub fn load(&self, name: &str) -> Result<Option<ProcessRecord>, PersistenceError> {
        let path = self.path_for(name);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| PersistenceError::Corrupt { path, source })
    }

    /// Delete the record for `name`; deleting a missing record is not an error.
    pub fn remove(&self, name: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PersistenceError::Io { path, source }),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }

    /// Names of every record currently on disk, sorted.
    pub fn names(&self) -> Result<Vec<String>, PersistenceError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut names = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(pid: u32) -> ProcessRecord {
        ProcessRecord::new(
            pid,
            PathBuf::from("/tmp/logs/api.log"),
            PathBuf::from("/opt/api/bin/api"),
            vec!["--config".to_string(), "/tmp/configs/api.yaml".to_string()],
            Utc::now(),
        )
    }

    #[test]
    fn record_uses_documented_field_names() {
        let json = serde_json::to_value(sample(42)).expect("serialize");
        for key in ["version", "pid", "logFile", "command", "args", "startedAt"] {
            assert!(json.get(key).is_some(), "missing {key} in {json}");
        }
        assert_eq!(json["version"], RECORD_VERSION);
    }

    #[test]
    fn newer_versions_with_extra_fields_still_parse() {
        let raw = r#"{
            "version": 7,
            "pid": 99,
            "logFile": "/x/logs/web.log",
            "command": "/x/bin/web",
            "args": [],
            "startedAt": "2026-01-02T03:04:05Z",
            "cgroup": "devstack.slice"
        }"#;
        let record: ProcessRecord = serde_json::from_str(raw).expect("forward compatible");
        assert_eq!(record.version, 7);
        assert_eq!(record.pid, 99);
    }

    #[test]
    fn save_overwrites_and_remove_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let store = PidStore::new(dir.path().join("pids"));

        store.save("api", &sample(1)).expect("save");
        store.save("api", &sample(2)).expect("overwrite");
        assert_eq!(store.load("api").expect("load").map(|r| r.pid), Some(2));

        store.remove("api").expect("remove");
        store.remove("api").expect("remove again");
        assert!(store.load("api").expect("load").is_none());
    }

    #[test]
    fn corrupt_records_are_reported() {
        let dir = TempDir::new().expect("tempdir");
        let store = PidStore::new(dir.path());
        fs::write(store.path_for("broken"), "{not json").expect("write");

        let err = store.load("broken").expect_err("corrupt");
        assert!(matches!(err, PersistenceError::Corrupt { .. }));
    }

    #[test]
    fn names_skips_foreign_files() {
        let dir = TempDir::new().expect("tempdir");
        let store = PidStore::new(dir.path());
        store.save("web", &sample(3)).expect("save");
        store.save("api", &sample(4)).expect("save");
        fs::write(dir.path().join("notes.txt"), "hi").expect("write");

        assert_eq!(store.names().expect("names"), ["api", "web"]);
    }

    #[test]
    fn missing_directory_has_no_names() {
        let dir = TempDir::new().expect("tempdir");
        let store = PidStore::new(dir.path().join("nope"));
        assert!(store.names().expect("names").is_empty());
    }
}
