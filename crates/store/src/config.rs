//! Configuration store
//!
//! One YAML file on disk. Saves go through a temp file and an atomic
//! rename; bind-mounted single files refuse the rename with `EBUSY`, in
//! which case the file is rewritten in place. Updates deep-merge a partial
//! payload over the current document.

use avocado_core::config::AppConfig;
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;

pub struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

fn deep_merge(base: &mut Value, updates: &Value) {
    match (base, updates) {
        (Value::Object(base_map), Value::Object(update_map)) => {
            for (key, value) in update_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, updates) => *base = updates.clone(),
    }
}

fn is_rename_refused(error: &std::io::Error) -> bool {
    error.kind() == ErrorKind::ResourceBusy || error.raw_os_error() == Some(16)
}

impl ConfigStore {
    /// Open the store, writing a default configuration on first touch.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = ConfigStore {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        };
        if !store.path.exists() {
            store.save(&AppConfig::default())?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn yaml_error(&self, source: serde_yaml::Error) -> StoreError {
        StoreError::Yaml {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn read_unlocked(&self) -> Result<AppConfig, StoreError> {
        let text = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        let config: AppConfig = serde_yaml::from_str(&text).map_err(|e| self.yaml_error(e))?;
        Ok(config.normalized())
    }

    fn write_unlocked(&self, config: &AppConfig) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }
        let rendered = serde_yaml::to_string(config).map_err(|e| self.yaml_error(e))?;
        let tmp_path = self.path.with_extension("yaml.tmp");
        fs::write(&tmp_path, &rendered).map_err(|e| self.io_error(e))?;
        match fs::rename(&tmp_path, &self.path) {
            Ok(()) => Ok(()),
            Err(error) if is_rename_refused(&error) => {
                debug!(path = %self.path.display(), "rename refused, rewriting in place");
                fs::write(&self.path, &rendered).map_err(|e| self.io_error(e))?;
                let _ = fs::remove_file(&tmp_path);
                Ok(())
            }
            Err(error) => Err(self.io_error(error)),
        }
    }

    /// Load and normalize the current configuration.
    pub fn load(&self) -> Result<AppConfig, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_unlocked()
    }

    /// Persist a full configuration.
    pub fn save(&self, config: &AppConfig) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_unlocked(config)
    }

    /// Deep-merge a partial payload over the stored document and persist.
    pub fn update(&self, payload: &Value) -> Result<AppConfig, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.read_unlocked()?;
        let mut merged = serde_json::to_value(&current)
            .map_err(|e| StoreError::InvalidPayload(e.to_string()))?;
        deep_merge(&mut merged, payload);
        let config: AppConfig = serde_json::from_value::<AppConfig>(merged)
            .map_err(|e| StoreError::InvalidPayload(e.to_string()))?
            .normalized();
        self.write_unlocked(&config)?;
        Ok(config)
    }

    /// JSON view of the configuration with secrets replaced by `***`.
    pub fn masked(&self) -> Result<Value, StoreError> {
        let config = self.load()?;
        let mut value = serde_json::to_value(&config).unwrap_or(Value::Null);
        if let Some(password) = value.pointer_mut("/caldav/password") {
            if password.as_str().map(|p| !p.is_empty()).unwrap_or(false) {
                *password = Value::String("***".to_string());
            }
        }
        if let Some(api_key) = value.pointer_mut("/ai/api_key") {
            if api_key.as_str().map(|k| !k.is_empty()).unwrap_or(false) {
                *api_key = Value::String("***".to_string());
            }
        }
        Ok(value)
    }
}
