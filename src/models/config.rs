use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// User settings from `settings.yaml`, overridable through `NIOH3MM_*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Folder holding downloaded mod archives and the legacy manifest.
    #[serde(default)]
    pub mods_dir: Option<Utf8PathBuf>,

    /// The game's `package/` directory.
    #[serde(default)]
    pub game_package_dir: Option<Utf8PathBuf>,

    /// Seconds before a hanging yumia run is treated as failed.
    #[serde(default = "default_patcher_timeout")]
    pub patcher_timeout_secs: u64,

    /// Use the simulated patcher instead of running the yumia executable.
    #[serde(default)]
    pub mock_patcher: bool,

    #[serde(default)]
    pub debug_mode: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            mods_dir: None,
            game_package_dir: None,
            patcher_timeout_secs: default_patcher_timeout(),
            mock_patcher: false,
            debug_mode: false,
        }
    }
}

impl ManagerSettings {
    pub fn patcher_timeout(&self) -> Duration {
        Duration::from_secs(self.patcher_timeout_secs)
    }

    /// Configured downloads folder, falling back to the user's download directory.
    pub fn resolved_mods_dir(&self) -> Option<Utf8PathBuf> {
        self.mods_dir.clone().or_else(|| {
            dirs::download_dir().and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        })
    }
}

fn default_patcher_timeout() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = ManagerSettings::default();
        assert_eq!(settings.patcher_timeout_secs, 300);
        assert_eq!(settings.patcher_timeout(), Duration::from_secs(300));
        assert!(!settings.mock_patcher);
        assert!(settings.game_package_dir.is_none());
    }

    #[test]
    fn test_explicit_mods_dir_wins() {
        let settings = ManagerSettings {
            mods_dir: Some(Utf8PathBuf::from("/tmp/mods")),
            ..Default::default()
        };
        assert_eq!(settings.resolved_mods_dir(), Some(Utf8PathBuf::from("/tmp/mods")));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let settings: ManagerSettings =
            serde_yaml_ng::from_str("game_package_dir: /games/nioh3/package\n").unwrap();
        assert_eq!(settings.patcher_timeout_secs, 300);
        assert_eq!(
            settings.game_package_dir,
            Some(Utf8PathBuf::from("/games/nioh3/package"))
        );
    }
}
