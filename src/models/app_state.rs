use camino::Utf8PathBuf;
use std::collections::BTreeSet;
use std::time::Duration;

/// Maximum number of mutating operations (install, uninstall, migrate, prune)
/// that may run at once.
///
/// **IMPORTANT:** This is hardcoded to 1. Every mutating operation performs a
/// load-modify-save cycle on the state files and may run the yumia patcher,
/// which rewrites `root.rdb` in place; two overlapping operations would corrupt
/// both. [`crate::ModManager`] enforces it with a `tokio::sync::Semaphore` and
/// reports `Busy` instead of queueing.
pub const MAX_CONCURRENT_OPERATIONS: usize = 1;

/// Kind of mutating operation currently holding the operation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Install,
    Uninstall,
    Migrate,
    Prune,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Uninstall => "uninstall",
            OperationKind::Migrate => "migrate",
            OperationKind::Prune => "prune",
        }
    }
}

/// Observable runtime state of the manager.
///
/// Wrapped in `Arc<RwLock<AppState>>` by [`crate::state::StateManager`]; never
/// mutate it directly, go through [`update()`](crate::state::StateManager::update)
/// so change events are emitted.
#[derive(Clone, Debug)]
pub struct AppState {
    // Configuration paths
    pub mods_dir: Option<Utf8PathBuf>,
    pub game_package_dir: Option<Utf8PathBuf>,

    // Runtime state
    pub is_busy: bool,
    pub current_operation: Option<OperationKind>,
    pub operation_detail: String,
    pub cancel_requested: bool,

    // Progress of the current operation (files written, mods staged, ...)
    pub progress: usize,
    pub total_steps: usize,

    // Install counts as of the last state load or mutation
    pub yumia_installed: usize,
    pub loose_installed: usize,
    pub broken_mods: BTreeSet<String>,

    // Result of the last finished operation
    pub last_error: Option<String>,

    // Settings
    pub patcher_timeout: Duration,
    pub mock_patcher: bool,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            mods_dir: None,
            game_package_dir: None,

            is_busy: false,
            current_operation: None,
            operation_detail: String::new(),
            cancel_requested: false,

            progress: 0,
            total_steps: 0,

            yumia_installed: 0,
            loose_installed: 0,
            broken_mods: BTreeSet::new(),

            last_error: None,

            patcher_timeout: Duration::from_secs(300),
            mock_patcher: false,
        }
    }
}

impl AppState {
    /// Both the downloads folder and the game package directory are known.
    pub fn is_fully_configured(&self) -> bool {
        self.mods_dir.is_some() && self.game_package_dir.is_some()
    }

    pub fn installed_total(&self) -> usize {
        self.yumia_installed + self.loose_installed
    }

    /// Clear per-operation fields at the start or end of an operation.
    pub fn reset_operation(&mut self) {
        self.current_operation = None;
        self.operation_detail.clear();
        self.cancel_requested = false;
        self.progress = 0;
        self.total_steps = 0;
    }

    /// Short progress text, empty when idle.
    pub fn progress_summary(&self) -> String {
        match self.current_operation {
            None => String::new(),
            Some(op) if self.total_steps > 0 => format!(
                "{}: {}/{} {}",
                op.as_str(),
                self.progress,
                self.total_steps,
                self.operation_detail
            )
            .trim_end()
            .to_string(),
            Some(op) => format!("{}: {}", op.as_str(), self.operation_detail)
                .trim_end()
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_idle() {
        let state = AppState::default();
        assert!(!state.is_busy);
        assert!(!state.is_fully_configured());
        assert_eq!(state.progress_summary(), "");
        assert_eq!(MAX_CONCURRENT_OPERATIONS, 1);
    }

    #[test]
    fn test_progress_summary() {
        let mut state = AppState {
            current_operation: Some(OperationKind::Install),
            total_steps: 4,
            progress: 2,
            operation_detail: "writing files".to_string(),
            ..Default::default()
        };
        assert_eq!(state.progress_summary(), "install: 2/4 writing files");

        state.reset_operation();
        assert_eq!(state.progress_summary(), "");
        assert_eq!(state.total_steps, 0);
    }

    #[test]
    fn test_fully_configured() {
        let state = AppState {
            mods_dir: Some("/mods".into()),
            game_package_dir: Some("/game/package".into()),
            ..Default::default()
        };
        assert!(state.is_fully_configured());
    }
}
