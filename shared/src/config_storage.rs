//! Configuration storage for named run profiles.
//!
//! A profile is any serde-serializable settings struct stored as pretty JSON.
//! All config is stored in ~/.plate_align/ by default.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid profile JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid profile name '{0}'")]
    InvalidName(String),

    #[error("HOME not set")]
    NoHome,
}

/// Configuration storage manager for saved profiles.
///
/// Manages loading and saving of profile files from a centralized
/// directory (defaults to ~/.plate_align/).
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    /// Root directory for all configuration (e.g., ~/.plate_align)
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Create a new config storage with default path (~/.plate_align)
    pub fn new() -> Result<Self, ConfigStorageError> {
        let home = std::env::var("HOME").map_err(|_| ConfigStorageError::NoHome)?;
        let root_path = PathBuf::from(home).join(".plate_align");
        Ok(Self { root_path })
    }

    /// Create a new config storage with custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    /// Get the root configuration path
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn profiles_dir(&self) -> PathBuf {
        self.root_path.join("profiles")
    }

    fn profile_path(&self, name: &str) -> Result<PathBuf, ConfigStorageError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(ConfigStorageError::InvalidName(name.to_string()));
        }
        Ok(self.profiles_dir().join(format!("{name}.json")))
    }

    /// Load a named profile.
    ///
    /// Returns None if no profile with that name exists.
    /// Returns Some(Err) if the file exists but cannot be loaded.
    pub fn load_profile<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Option<Result<T, ConfigStorageError>> {
        let path = match self.profile_path(name) {
            Ok(path) => path,
            Err(e) => return Some(Err(e)),
        };

        if !path.exists() {
            return None;
        }

        Some(
            std::fs::read_to_string(&path)
                .map_err(ConfigStorageError::from)
                .and_then(|text| serde_json::from_str(&text).map_err(ConfigStorageError::from)),
        )
    }

    /// Save a named profile, replacing any previous one.
    ///
    /// Creates the profiles directory if it doesn't exist.
    /// Returns the path where the profile was saved.
    pub fn save_profile<T: Serialize>(
        &self,
        name: &str,
        profile: &T,
    ) -> Result<PathBuf, ConfigStorageError> {
        let path = self.profile_path(name)?;
        std::fs::create_dir_all(self.profiles_dir())?;
        let json = serde_json::to_string_pretty(profile)?;
        std::fs::write(&path, json)?;
        log::info!("Saved profile '{}' to {}", name, path.display());
        Ok(path)
    }

    /// List all profile names available in storage, sorted.
    pub fn list_profiles(&self) -> Result<Vec<String>, ConfigStorageError> {
        let dir = self.profiles_dir();

        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a named profile.
    ///
    /// Returns Ok(true) if the file was deleted, Ok(false) if it didn't exist.
    pub fn delete_profile(&self, name: &str) -> Result<bool, ConfigStorageError> {
        let path = self.profile_path(name)?;

        if !path.exists() {
            return Ok(false);
        }

        std::fs::remove_file(path)?;
        Ok(true)
    }
}
