use crate::models::ManagerSettings;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// File name of the user settings inside the config directory.
pub const SETTINGS_FILENAME: &str = "settings.yaml";

/// Prefix of environment variables overriding settings (`NIOH3MM_MOCK_PATCHER=true`).
pub const ENV_PREFIX: &str = "NIOH3MM";

/// Configuration manager for loading and saving `settings.yaml`.
///
/// Loading layers the YAML file under `NIOH3MM_*` environment variables;
/// saving only ever writes the YAML file.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    settings_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager, creating `config_dir` when missing.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            settings_path: config_dir.join(SETTINGS_FILENAME),
            config_dir,
        })
    }

    /// Platform config directory (`%APPDATA%/nioh3-modmanager`, `~/.config/nioh3-modmanager`).
    pub fn default_dir() -> Option<Utf8PathBuf> {
        dirs::config_dir()
            .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
            .map(|dir| dir.join(crate::APP_NAME))
    }

    /// Load settings from the file and the environment.
    ///
    /// # Returns
    /// The merged settings, or defaults if neither source sets anything
    pub fn load_settings(&self) -> Result<ManagerSettings> {
        self.load_settings_with_env(None)
    }

    /// [`load_settings`](Self::load_settings) reading `NIOH3MM_*` values from
    /// `env` instead of the process environment when given.
    pub fn load_settings_with_env(
        &self,
        env: Option<config::Map<String, String>>,
    ) -> Result<ManagerSettings> {
        if !self.settings_path.exists() {
            tracing::warn!(
                "Settings file not found at {}, using defaults",
                self.settings_path
            );
        }

        let settings: ManagerSettings = config::Config::builder()
            .add_source(
                config::File::new(self.settings_path.as_str(), config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .with_context(|| format!("Failed to read settings: {}", self.settings_path))?
            .try_deserialize()
            .with_context(|| format!("Failed to parse settings: {}", self.settings_path))?;

        tracing::info!("Loaded settings from {}", self.settings_path);
        Ok(settings)
    }

    /// Save the settings file.
    pub fn save_settings(&self, settings: &ManagerSettings) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(settings).context("Failed to serialize settings to YAML")?;

        fs::write(&self.settings_path, yaml_string)
            .with_context(|| format!("Failed to write settings: {}", self.settings_path))?;

        tracing::info!("Saved settings to {}", self.settings_path);
        Ok(())
    }

    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn settings_path(&self) -> &Utf8Path {
        &self.settings_path
    }
}
