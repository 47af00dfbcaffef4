//! 설정 디렉토리 하나를 감싸는 JSON 파일 저장소
//!
//! 쓰기는 임시 파일에 쓴 뒤 rename 하므로, 다른 프로세스가 반쯤 쓰인
//! 설정 파일을 읽는 일이 없습니다.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "tandem";
const PROJECT_DIR: &str = ".tandem";

/// Where a settings directory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    /// `<config_dir>/tandem`
    Global,
    /// `<project>/.tandem`
    Project,
}

#[derive(Debug, Clone)]
pub struct JsonStore {
    scope: ConfigScope,
    dir: PathBuf,
}

impl JsonStore {
    pub fn global() -> Result<Self> {
        let base = dirs::config_dir()
            .ok_or_else(|| Error::Config("no user config directory on this platform".into()))?;
        Ok(Self {
            scope: ConfigScope::Global,
            dir: base.join(APP_DIR),
        })
    }

    pub fn project(root: impl AsRef<Path>) -> Self {
        Self {
            scope: ConfigScope::Project,
            dir: root.as_ref().join(PROJECT_DIR),
        }
    }

    pub fn current_project() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("working directory unavailable: {}", e)))?;
        Ok(Self::project(cwd))
    }

    pub fn scope(&self) -> ConfigScope {
        self.scope
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// `None` only when the file is absent; unreadable or malformed files are errors
    pub fn load_optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.file_path(name);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Config(format!("read {}: {}", path.display(), e)));
            }
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| Error::Config(format!("parse {}: {}", path.display(), e)))
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.load_optional(name)?.ok_or_else(|| {
            Error::NotFound(format!("config file {}", self.file_path(name).display()))
        })
    }

    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Config(format!("create {}: {}", self.dir.display(), e)))?;

        let path = self.file_path(name);
        let tmp = self.dir.join(format!(".{}.tmp", name));
        let mut body = serde_json::to_vec_pretty(value)?;
        body.push(b'\n');

        std::fs::write(&tmp, &body)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|e| {
                let _ = std::fs::remove_file(&tmp);
                Error::Config(format!("write {}: {}", path.display(), e))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::project(dir.path());
        assert_eq!(store.scope(), ConfigScope::Project);

        let missing: Option<serde_json::Value> = store.load_optional("absent.json").unwrap();
        assert!(missing.is_none());
        assert!(matches!(
            store.load::<serde_json::Value>("absent.json"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_save_replaces_atomically() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::project(dir.path());

        let mut limits = BTreeMap::new();
        limits.insert("capacity".to_string(), 8u32);
        store.save("limits.json", &limits).unwrap();
        limits.insert("capacity".to_string(), 2u32);
        store.save("limits.json", &limits).unwrap();

        let loaded: BTreeMap<String, u32> = store.load("limits.json").unwrap();
        assert_eq!(loaded["capacity"], 2);
        assert!(!store.dir().join(".limits.json.tmp").exists());
        assert!(store.dir().ends_with(".tandem"));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::project(dir.path());
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.file_path("bad.json"), "{ not json").unwrap();

        let err = store.load_optional::<serde_json::Value>("bad.json").unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
