use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::DEFAULT_BUFFER_SIZE;
use crate::diagnostics;
use crate::streaming::{EndpointKind, DEFAULT_WS_URL};

const APP_DIR_NAME: &str = "micstream";
const SETTINGS_FILE_NAME: &str = "settings.json";

pub const ENV_WS_URL: &str = "MICSTREAM_WS_URL";
pub const ENV_TOKEN_URL: &str = "MICSTREAM_TOKEN_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    /// Streaming endpoint. Saved after the first successful connect.
    pub ws_url: String,

    /// How the endpoint is spoken to (`raw` PCM sink or `transcription`).
    pub endpoint: EndpointKind,

    /// Samples per streamed frame.
    pub buffer_size: usize,

    /// Requested capture rate; the device default is used when absent.
    pub sample_rate: Option<u32>,

    pub connect_timeout_ms: u64,

    /// Diagnostics entries kept in memory.
    pub log_capacity: usize,

    pub render_fps: u32,

    /// Server endpoint that mints stream tokens for transcription endpoints.
    pub token_url: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            endpoint: EndpointKind::Raw,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sample_rate: None,
            connect_timeout_ms: 5000,
            log_capacity: diagnostics::DEFAULT_CAPACITY,
            render_fps: 60,
            token_url: None,
        }
    }
}

impl AppSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Apply `MICSTREAM_*` environment overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Empty values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty(ENV_WS_URL) {
            log::debug!("Settings: {} overrides wsUrl", ENV_WS_URL);
            self.ws_url = url;
        }
        if let Some(url) = non_empty(ENV_TOKEN_URL) {
            log::debug!("Settings: {} overrides tokenUrl", ENV_TOKEN_URL);
            self.token_url = Some(url);
        }
        self
    }
}

/// Settings file location plus load/save.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config_dir>/micstream/settings.json`
    pub fn default_location() -> Result<Self, String> {
        let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
        Ok(Self::new(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable files yield defaults.
    pub fn load(&self) -> AppSettings {
        let path = &self.path;
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Settings: failed to parse {:?}: {}", path, e);
                    AppSettings::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
            Err(e) => {
                log::warn!("Settings: failed to read {:?}: {}", path, e);
                AppSettings::default()
            }
        }
    }

    pub fn save(&self, settings: &AppSettings) -> Result<(), String> {
        let path = &self.path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
        }

        let contents = serde_json::to_string_pretty(settings)
            .map_err(|e| format!("Serialize settings: {}", e))?;

        // Temp file in the same directory, then rename over the target
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &contents)
            .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

        // rename() does not replace an existing file on Windows
        if cfg!(windows) && path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(format!("Remove existing settings file {:?}: {}", path, e));
                }
            }
        }

        std::fs::rename(&tmp_path, path)
            .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
        Ok(())
    }

    /// Load, modify, save.
    pub fn update(&self, change: impl FnOnce(&mut AppSettings)) -> Result<AppSettings, String> {
        let mut settings = self.load();
        change(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }

    /// Persist `url` as the endpoint, leaving other settings untouched.
    pub fn save_ws_url(&self, url: &str) -> Result<(), String> {
        if self.load().ws_url == url {
            return Ok(());
        }
        self.update(|s| s.ws_url = url.to_string()).map(|_| {
            log::info!("Settings: saved wsUrl {}", url);
        })
    }
}
