// State management module
//
// StateManager wraps AppState with thread-safe access using Arc<RwLock<T>> and
// emits change events so a presentation layer can follow long operations.

use crate::models::{AppState, ManagerSettings, OperationKind};
use camino::Utf8PathBuf;
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Change events emitted when state is modified
///
/// These events notify interested parties (a UI, the CLI progress output)
/// about state changes without requiring them to poll.
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// Downloads folder or package directory changed
    ConfigurationChanged {
        is_fully_configured: bool,
    },

    /// A mutating operation took the operation slot
    OperationStarted {
        operation: OperationKind,
    },

    /// The running operation released the operation slot
    OperationFinished {
        operation: OperationKind,
        success: bool,
    },

    /// Progress inside the running operation
    ProgressUpdated {
        current: usize,
        total: usize,
        detail: String,
    },

    /// The user asked the running operation to stop
    CancelRequested,

    /// Number of recorded installs per backend changed
    InstallCountsChanged {
        yumia: usize,
        loose: usize,
    },

    /// Records whose files are missing on disk
    DriftDetected {
        broken: Vec<String>,
    },

    /// Settings have been updated
    SettingsChanged,

    /// State has been reset
    StateReset,
}

/// Thread-safe state manager with event emission
///
/// - Provides thread-safe access to [`AppState`] via `Arc<RwLock<T>>`
/// - Detects state changes and emits [`StateChange`] events
/// - Carries the cancellation flag checked between file writes
///
/// Always go through [`update()`](Self::update) (or one of the convenience
/// methods) for mutations so subscribers see every transition.
pub struct StateManager {
    state: Arc<RwLock<AppState>>,
    state_tx: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a new StateManager with default state and a 100 event buffer
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(RwLock::new(AppState::default())),
            state_tx,
        }
    }

    /// Clone of the current state
    pub fn snapshot(&self) -> AppState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Execute a function with read access to the state
    ///
    /// ```ignore
    /// let busy = state_manager.read(|state| state.is_busy);
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&AppState) -> R,
    {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Update the state and emit change events
    ///
    /// Captures the old state, applies `update_fn`, diffs the two and sends
    /// one event per detected change. Returns the emitted events.
    pub fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut AppState),
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let old_state = state.clone();

        update_fn(&mut state);

        let changes = self.detect_changes(&old_state, &state);
        for change in &changes {
            // No subscribers is fine
            let _ = self.state_tx.send(change.clone());
        }

        changes
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn detect_changes(&self, old: &AppState, new: &AppState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if old.mods_dir != new.mods_dir || old.game_package_dir != new.game_package_dir {
            changes.push(StateChange::ConfigurationChanged {
                is_fully_configured: new.is_fully_configured(),
            });
        }

        if old.is_busy != new.is_busy {
            if new.is_busy {
                if let Some(operation) = new.current_operation {
                    changes.push(StateChange::OperationStarted { operation });
                }
            } else if let Some(operation) = old.current_operation {
                changes.push(StateChange::OperationFinished {
                    operation,
                    success: new.last_error.is_none(),
                });
            }
        }

        if new.is_busy
            && (old.progress != new.progress
                || old.total_steps != new.total_steps
                || old.operation_detail != new.operation_detail)
        {
            changes.push(StateChange::ProgressUpdated {
                current: new.progress,
                total: new.total_steps,
                detail: new.operation_detail.clone(),
            });
        }

        if !old.cancel_requested && new.cancel_requested {
            changes.push(StateChange::CancelRequested);
        }

        if old.yumia_installed != new.yumia_installed || old.loose_installed != new.loose_installed {
            changes.push(StateChange::InstallCountsChanged {
                yumia: new.yumia_installed,
                loose: new.loose_installed,
            });
        }

        if old.broken_mods != new.broken_mods && !new.broken_mods.is_empty() {
            changes.push(StateChange::DriftDetected {
                broken: new.broken_mods.iter().cloned().collect(),
            });
        }

        if old.patcher_timeout != new.patcher_timeout || old.mock_patcher != new.mock_patcher {
            changes.push(StateChange::SettingsChanged);
        }

        changes
    }

    // Convenience methods for common state updates

    /// Set both configured folders
    pub fn set_paths(
        &self,
        mods_dir: Option<Utf8PathBuf>,
        game_package_dir: Option<Utf8PathBuf>,
    ) -> Vec<StateChange> {
        self.update(|state| {
            state.mods_dir = mods_dir;
            state.game_package_dir = game_package_dir;
        })
    }

    /// Mark the start of a mutating operation
    pub fn begin_operation(&self, operation: OperationKind, detail: &str) -> Vec<StateChange> {
        self.update(|state| {
            state.reset_operation();
            state.is_busy = true;
            state.current_operation = Some(operation);
            state.operation_detail = detail.to_string();
            state.last_error = None;
        })
    }

    pub fn set_total_steps(&self, total: usize) -> Vec<StateChange> {
        self.update(|state| {
            state.total_steps = total;
            state.progress = 0;
        })
    }

    /// One step of the running operation done
    pub fn advance(&self, detail: impl Into<String>) -> Vec<StateChange> {
        let detail = detail.into();
        self.update(|state| {
            state.progress += 1;
            state.operation_detail = detail;
        })
    }

    /// Release the operation, recording the error if it failed
    pub fn finish_operation(&self, error: Option<String>) -> Vec<StateChange> {
        self.update(|state| {
            state.last_error = error;
            state.is_busy = false;
        });
        // Per-operation fields are cleared in a second update so the
        // finish event above still knows which operation ended.
        self.update(|state| state.reset_operation())
    }

    /// Ask the running operation to stop at its next checkpoint
    pub fn request_cancel(&self) -> Vec<StateChange> {
        self.update(|state| {
            if state.is_busy {
                state.cancel_requested = true;
            }
        })
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.read(|state| state.cancel_requested)
    }

    pub fn set_install_counts(&self, yumia: usize, loose: usize) -> Vec<StateChange> {
        self.update(|state| {
            state.yumia_installed = yumia;
            state.loose_installed = loose;
        })
    }

    pub fn set_broken_mods(&self, broken: BTreeSet<String>) -> Vec<StateChange> {
        self.update(|state| state.broken_mods = broken)
    }

    /// Reset runtime fields, keeping configuration and settings
    pub fn reset_operation_state(&self) -> Vec<StateChange> {
        let mut changes = self.update(|state| {
            state.reset_operation();
            state.is_busy = false;
            state.last_error = None;
        });

        let reset_event = StateChange::StateReset;
        let _ = self.state_tx.send(reset_event.clone());
        changes.push(reset_event);

        changes
    }

    /// Populate paths and settings from `settings.yaml`
    pub fn load_from_settings(&self, settings: &ManagerSettings) -> Vec<StateChange> {
        self.update(|state| {
            state.mods_dir = settings.resolved_mods_dir();
            state.game_package_dir = settings.game_package_dir.clone();
            state.patcher_timeout = settings.patcher_timeout();
            state.mock_patcher = settings.mock_patcher;

            tracing::info!(
                "Loaded settings: mods_dir={:?}, package_dir={:?}, timeout={}s, mock_patcher={}",
                state.mods_dir,
                state.game_package_dir,
                settings.patcher_timeout_secs,
                state.mock_patcher
            );
        })
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
        }
    }
}
