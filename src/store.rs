//! Monitored apps and mock responses managed through the control API.
//!
//! Each store is a JSON array on disk, loaded once at startup and rewritten
//! in full after every change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredApp {
    pub bundle_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub decrypt_traffic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockResponse {
    #[serde(default)]
    pub id: String,
    pub method: String,
    pub host: String,
    pub path: String,
    #[serde(default)]
    pub is_regex: bool,
    pub status_code: u16,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub is_active: bool,
}

/// Missing or malformed files start the store empty.
fn load_list<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            debug!(path = %path.display(), "Nothing to load: {}", e);
            return Vec::new();
        }
    };
    serde_json::from_str(&content).unwrap_or_else(|e| {
        warn!(path = %path.display(), "Ignoring malformed store file: {}", e);
        Vec::new()
    })
}

fn save_list<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let json = serde_json::to_string_pretty(items)?;
    fs::write(path, json).map_err(|e| Error::store(format!("Failed to write {}: {}", path.display(), e)))
}

pub struct AppStore {
    path: PathBuf,
    apps: RwLock<BTreeMap<String, MonitoredApp>>,
}

impl AppStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let apps = load_list::<MonitoredApp>(&path)
            .into_iter()
            .map(|app| (app.bundle_id.clone(), app))
            .collect();
        AppStore {
            path,
            apps: RwLock::new(apps),
        }
    }

    /// Insert or replace by bundle id.
    pub fn add(&self, app: MonitoredApp) -> Result<()> {
        if app.bundle_id.is_empty() {
            return Err(Error::invalid_request("bundle_id is required"));
        }
        let mut apps = self.apps.write().unwrap_or_else(PoisonError::into_inner);
        apps.insert(app.bundle_id.clone(), app);
        self.save(&apps)
    }

    /// Returns whether an app was removed.
    pub fn remove(&self, bundle_id: &str) -> Result<bool> {
        let mut apps = self.apps.write().unwrap_or_else(PoisonError::into_inner);
        let removed = apps.remove(bundle_id).is_some();
        self.save(&apps)?;
        Ok(removed)
    }

    pub fn get(&self, bundle_id: &str) -> Option<MonitoredApp> {
        self.apps.read().unwrap_or_else(PoisonError::into_inner).get(bundle_id).cloned()
    }

    pub fn list(&self) -> Vec<MonitoredApp> {
        self.apps.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    fn save(&self, apps: &BTreeMap<String, MonitoredApp>) -> Result<()> {
        save_list(&self.path, &apps.values().collect::<Vec<_>>())
    }
}

pub struct MockStore {
    path: PathBuf,
    mocks: RwLock<Vec<MockResponse>>,
}

impl MockStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mocks = load_list(&path);
        MockStore {
            path,
            mocks: RwLock::new(mocks),
        }
    }

    /// Store a mock, assigning a fresh id when it has none. A mock with an
    /// existing id replaces the old one in place. Returns the stored mock.
    pub fn add(&self, mut mock: MockResponse) -> Result<MockResponse> {
        if mock.id.is_empty() {
            mock.id = Uuid::new_v4().to_string();
        }
        let mut mocks = self.mocks.write().unwrap_or_else(PoisonError::into_inner);
        match mocks.iter_mut().find(|m| m.id == mock.id) {
            Some(existing) => *existing = mock.clone(),
            None => mocks.push(mock.clone()),
        }
        save_list(&self.path, &mocks)?;
        Ok(mock)
    }

    /// Returns whether a mock was removed; the file is only rewritten if so.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut mocks = self.mocks.write().unwrap_or_else(PoisonError::into_inner);
        let before = mocks.len();
        mocks.retain(|m| m.id != id);
        if mocks.len() == before {
            return Ok(false);
        }
        save_list(&self.path, &mocks)?;
        Ok(true)
    }

    pub fn list(&self) -> Vec<MockResponse> {
        self.mocks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
