//! User preferences with file locking.
//!
//! Preferences override the engine's timing defaults and remember the last-used
//! parameters per exercise. The engine reads them when a workout is loaded or a set
//! is started by the user, and writes them only from the set-completion hook.

use crate::types::{WorkoutParameters, WorkoutSetup};
use crate::{Error, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct UserPreferences {
    #[serde(default)]
    pub countdown_secs: Option<u32>,

    #[serde(default)]
    pub autoplay: Option<bool>,

    #[serde(default)]
    pub summary_hold_secs: Option<u32>,

    #[serde(default)]
    pub skip_summary_in_routine: Option<bool>,

    #[serde(default)]
    pub just_lift_defaults: Option<WorkoutParameters>,

    /// Last-used parameters keyed by exercise id
    #[serde(default)]
    pub exercise_defaults: BTreeMap<String, WorkoutParameters>,
}

impl UserPreferences {
    /// Saved parameters for an exercise; `None` selects the just-lift defaults
    pub fn defaults_for(&self, exercise_id: Option<&str>) -> Option<&WorkoutParameters> {
        match exercise_id {
            Some(id) => self.exercise_defaults.get(id),
            None => self.just_lift_defaults.as_ref(),
        }
    }

    pub fn remember(&mut self, exercise_id: Option<&str>, params: &WorkoutParameters) {
        match exercise_id {
            Some(id) => {
                self.exercise_defaults.insert(id.to_string(), params.clone());
            }
            None => self.just_lift_defaults = Some(params.clone()),
        }
    }

    /// Parameters for a new just-lift session, starting from the saved defaults
    pub fn just_lift_params(&self, fallback_weight_kg: f32) -> WorkoutParameters {
        match &self.just_lift_defaults {
            Some(saved) => WorkoutParameters {
                just_lift: true,
                auto_start: true,
                target_reps: 0,
                warmup_reps: 0,
                ..saved.clone()
            },
            None => WorkoutParameters::just_lift(fallback_weight_kg),
        }
    }

    /// Setup to load, with the last-used weight of a single exercise taking the
    /// place of the template weight
    pub fn apply_saved_defaults(&self, setup: WorkoutSetup) -> WorkoutSetup {
        match setup {
            WorkoutSetup::Single { exercise, mut params } => {
                if let Some(saved) = self.defaults_for(Some(&exercise.id)) {
                    tracing::info!(
                        "Starting {} at last-used {:.1} kg",
                        exercise.id,
                        saved.weight_per_cable_kg
                    );
                    params.weight_per_cable_kg = saved.weight_per_cable_kg;
                }
                WorkoutSetup::Single { exercise, params }
            }
            other => other,
        }
    }

    /// Load preferences from a file with shared locking
    ///
    /// Returns defaults if the file doesn't exist.
    /// If the file is corrupted, logs a warning and returns defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No preferences file found, using defaults");
            return Ok(Self::default());
        }

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    "Unable to open preferences {:?}: {}. Using defaults.",
                    path,
                    e
                );
                return Ok(Self::default());
            }
        };

        if let Err(e) = file.lock_shared() {
            tracing::warn!(
                "Unable to lock preferences {:?}: {}. Using defaults.",
                path,
                e
            );
            return Ok(Self::default());
        }

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        if let Err(e) = reader.read_to_string(&mut contents) {
            let _ = file.unlock();
            tracing::warn!(
                "Failed to read preferences {:?}: {}. Using defaults.",
                path,
                e
            );
            return Ok(Self::default());
        }

        file.unlock()?;

        match serde_json::from_str::<UserPreferences>(&contents) {
            Ok(prefs) => {
                tracing::debug!("Loaded preferences from {:?}", path);
                Ok(prefs)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to parse preferences {:?}: {}. Using defaults.",
                    path,
                    e
                );
                Ok(Self::default())
            }
        }
    }

    /// Save preferences atomically: temp file, fsync, rename over the original
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "preferences path missing parent")
        })?;
        std::fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string_pretty(self)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved preferences to {:?}", path);
        Ok(())
    }

    /// Load, modify and save back
    pub fn update<F>(path: &Path, f: F) -> Result<Self>
    where
        F: FnOnce(&mut UserPreferences) -> Result<()>,
    {
        let mut prefs = Self::load(path)?;
        f(&mut prefs)?;
        prefs.save(path)?;
        Ok(prefs)
    }
}

/// Preference access the engine depends on
pub trait Preferences: Send + Sync {
    fn load(&self) -> Result<UserPreferences>;

    /// Remember the parameters of a finished set; `None` is the just-lift slot
    fn save_defaults(&self, exercise_id: Option<&str>, params: &WorkoutParameters) -> Result<()>;
}

/// JSON preferences file in the data directory
pub struct PreferencesStore {
    path: PathBuf,
}

impl PreferencesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `preferences.json` inside `data_dir`
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("preferences.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Preferences for PreferencesStore {
    fn load(&self) -> Result<UserPreferences> {
        UserPreferences::load(&self.path)
    }

    fn save_defaults(&self, exercise_id: Option<&str>, params: &WorkoutParameters) -> Result<()> {
        UserPreferences::update(&self.path, |prefs| {
            prefs.remember(exercise_id, params);
            Ok(())
        })?;
        Ok(())
    }
}

/// Process-local preferences, for tests and dry runs
#[derive(Default)]
pub struct MemoryPreferences {
    inner: Mutex<UserPreferences>,
}

impl MemoryPreferences {
    pub fn new(prefs: UserPreferences) -> Self {
        Self {
            inner: Mutex::new(prefs),
        }
    }
}

impl Preferences for MemoryPreferences {
    fn load(&self) -> Result<UserPreferences> {
        self.inner
            .lock()
            .map(|p| p.clone())
            .map_err(|_| Error::Other("preferences lock poisoned".into()))
    }

    fn save_defaults(&self, exercise_id: Option<&str>, params: &WorkoutParameters) -> Result<()> {
        let mut prefs = self
            .inner
            .lock()
            .map_err(|_| Error::Other("preferences lock poisoned".into()))?;
        prefs.remember(exercise_id, params);
        Ok(())
    }
}
