use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::SettingsError;

pub const SETTINGS_FILE: &str = "finance.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub backend_url: String,
    pub anon_key: String,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:54321".into(),
            anon_key: String::new(),
            request_timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parses the backend url, normalized to end with `/` so relative
    /// endpoint paths join under it.
    pub fn validate(&self) -> Result<Url, SettingsError> {
        let raw = self.backend_url.trim();
        let mut url = Url::parse(raw).map_err(|source| SettingsError::InvalidUrl {
            url: raw.to_string(),
            source,
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SettingsError::UnsupportedScheme(url.scheme().to_string()));
        }
        if self.anon_key.trim().is_empty() {
            return Err(SettingsError::MissingAnonKey);
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    backend_url: Option<String>,
    anon_key: Option<String>,
    request_timeout_secs: Option<u64>,
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the settings file, then environment overrides.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.backend_url {
                    settings.backend_url = v;
                }
                if let Some(v) = file_cfg.anon_key {
                    settings.anon_key = v;
                }
                if let Some(v) = file_cfg.request_timeout_secs {
                    settings.request_timeout_secs = v;
                }
            }
            Err(err) => warn!(path = %path.display(), error = %err, "ignoring malformed settings file"),
        }
    }

    if let Some(v) = env("SUPABASE_URL") {
        settings.backend_url = v;
    }
    if let Some(v) = env("APP__BACKEND_URL") {
        settings.backend_url = v;
    }

    if let Some(v) = env("SUPABASE_ANON_KEY") {
        settings.anon_key = v;
    }
    if let Some(v) = env("APP__ANON_KEY") {
        settings.anon_key = v;
    }

    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = parsed;
        }
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
