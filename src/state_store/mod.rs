//! Persists enough of the router's deployment state to reconstruct services
//! on restart without a fresh deploy: service names, hosts, path mounts,
//! target addresses, and pause state. Health is re-established by the normal
//! probe loop, not persisted — a target is assumed healthy on restore only
//! long enough for the first probe to confirm or refute it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedTarget {
    pub addr: String,
    pub scheme: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPauseState {
    pub paused: bool,
    pub stopped: bool,
    pub stop_message: String,
}

impl Default for PersistedPauseState {
    fn default() -> Self {
        Self {
            paused: false,
            stopped: false,
            stop_message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedService {
    pub name: String,
    pub hosts: Vec<String>,
    pub paths: Vec<String>,
    pub writer_targets: Vec<PersistedTarget>,
    pub reader_targets: Vec<PersistedTarget>,
    pub strip_path_prefix: bool,
    pub tls_enabled: bool,
    pub tls_disable_redirect: bool,
    pub pause_state: PersistedPauseState,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedRouterState {
    pub services: Vec<PersistedService>,
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> std::io::Result<PersistedRouterState>;
    fn save(&self, state: &PersistedRouterState) -> std::io::Result<()>;
}

/// Writes the full state as pretty JSON to a single file on every save,
/// via a write-to-temp-then-rename so a crash mid-write never leaves a
/// truncated state file behind.
pub struct FileStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> std::io::Result<PersistedRouterState> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedRouterState::default()),
            Err(e) => Err(e),
        }
    }

    fn save(&self, state: &PersistedRouterState) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let serialized = serde_json::to_string_pretty(state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp_path = tmp_path_for(&self.path);
        std::fs::write(&tmp_path, serialized)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_empty_state() {
        let store = FileStateStore::new("/tmp/relayd-state-store-test-missing.json");
        let state = store.load().unwrap();
        assert!(state.services.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = std::env::temp_dir().join(format!("relayd-state-{}.json", std::process::id()));
        let store = FileStateStore::new(&path);
        let state = PersistedRouterState {
            services: vec![PersistedService {
                name: "web".to_string(),
                hosts: vec!["example.com".to_string()],
                paths: vec!["/".to_string()],
                writer_targets: vec![PersistedTarget {
                    addr: "127.0.0.1:3000".to_string(),
                    scheme: "http".to_string(),
                }],
                reader_targets: vec![],
                strip_path_prefix: false,
                tls_enabled: false,
                tls_disable_redirect: false,
                pause_state: PersistedPauseState::default(),
            }],
        };
        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.services.len(), 1);
        assert_eq!(loaded.services[0].name, "web");
        let _ = std::fs::remove_file(&path);
    }
}
