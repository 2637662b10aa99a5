// SPDX-License-Identifier: GPL-3.0-only
//! Storage for display configurations and settings
//!
//! The controller only talks to [`ConfigStore`]. [`JsonFileStore`] writes two
//! pretty-printed JSON documents into the config directory, [`MemoryStore`]
//! keeps everything in process for `--ephemeral` runs and tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::{GlassConfig, Settings};
use crate::error::Result;

pub const APP_DIR: &str = "looking-glass";
const CONFIGS_FILE: &str = "glass_configs.json";
const SETTINGS_FILE: &str = "settings.json";

pub trait ConfigStore: Send {
    /// Stored display entries, in editor order
    fn load(&self) -> Result<Vec<GlassConfig>>;

    fn save(&mut self, configs: &[GlassConfig]) -> Result<()>;

    fn load_settings(&self) -> Result<Settings>;

    fn save_settings(&mut self, settings: &Settings) -> Result<()>;
}

/// JSON documents under `<config dir>/looking-glass/`
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted in the platform config directory
    pub fn in_config_dir() -> Self {
        let dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, file: &str, contents: String) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(file);
        // Write then rename so a crash never leaves a truncated document
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;
        debug!("Wrote {:?}", path);
        Ok(())
    }

    fn read(&self, file: &str) -> Result<Option<String>> {
        let path = self.dir.join(file);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("{:?} not found, using defaults", path);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<Vec<GlassConfig>> {
        let mut configs: Vec<GlassConfig> = match self.read(CONFIGS_FILE)? {
            Some(contents) => serde_json::from_str(&contents)?,
            None => Vec::new(),
        };
        for config in &mut configs {
            config.display_config.normalize();
        }
        info!("Loaded {} display configuration(s)", configs.len());
        Ok(configs)
    }

    fn save(&mut self, configs: &[GlassConfig]) -> Result<()> {
        self.write(CONFIGS_FILE, serde_json::to_string_pretty(configs)?)
    }

    fn load_settings(&self) -> Result<Settings> {
        let settings: Settings = match self.read(SETTINGS_FILE)? {
            Some(contents) => serde_json::from_str(&contents)?,
            None => Settings::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn save_settings(&mut self, settings: &Settings) -> Result<()> {
        self.write(SETTINGS_FILE, serde_json::to_string_pretty(settings)?)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    configs: Vec<GlassConfig>,
    settings: Settings,
    saves: usize,
}

/// In-process store; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new(configs: Vec<GlassConfig>, settings: Settings) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                configs,
                settings,
                saves: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave the plain data half written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of `save` calls so far
    #[cfg(test)]
    pub fn saves(&self) -> usize {
        self.lock().saves
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<Vec<GlassConfig>> {
        Ok(self.lock().configs.clone())
    }

    fn save(&mut self, configs: &[GlassConfig]) -> Result<()> {
        let mut state = self.lock();
        state.configs = configs.to_vec();
        state.saves += 1;
        Ok(())
    }

    fn load_settings(&self) -> Result<Settings> {
        Ok(self.lock().settings.clone())
    }

    fn save_settings(&mut self, settings: &Settings) -> Result<()> {
        self.lock().settings = settings.clone();
        Ok(())
    }
}
