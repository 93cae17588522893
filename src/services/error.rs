use camino::Utf8PathBuf;
use std::io;
use thiserror::Error;

use super::archive::ArchiveError;
use super::classifier::ClassifyError;
use super::convert::ConvertError;
use super::migration::MigrationError;
use super::patcher::PatchError;
use super::selection::SelectionError;
use super::store::StoreError;

/// Errors surfaced at the operation boundary (install, uninstall, migrate, ...).
///
/// Every variant that a user can act on carries a concrete next step through
/// [`ManagerError::next_step`].
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    UnsupportedArchive(#[from] ClassifyError),

    #[error("install blocked by {} conflicting path(s): {}", paths.len(), paths.join(", "))]
    Conflict { paths: Vec<String> },

    #[error("file operation failed on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error("patcher failed: {0}")]
    Patch(#[from] PatchError),

    #[error("RDB backup missing: {0}")]
    BackupMissing(Utf8PathBuf),

    #[error("source archive for {mod_id} no longer exists at {path}")]
    SourceMissing { mod_id: String, path: Utf8PathBuf },

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("no install backend is available")]
    Blocked { next_step: String },

    #[error("this selection cannot be installed with the {backend} backend")]
    BackendMismatch {
        backend: crate::models::Backend,
        next_step: String,
    },

    #[error("another operation is already running")]
    Busy,

    #[error("operation cancelled")]
    Cancelled,

    #[error("a mod from {0} is already installed")]
    AlreadyInstalled(String),

    #[error("no installed mod found for {0}")]
    NotInstalled(String),

    #[error(transparent)]
    InvalidSelection(#[from] SelectionError),

    #[error(transparent)]
    State(#[from] StoreError),
}

impl ManagerError {
    pub fn io(path: impl Into<Utf8PathBuf>, source: io::Error) -> Self {
        ManagerError::Io {
            path: path.into(),
            source,
        }
    }

    /// Actionable guidance for the presentation layer.
    pub fn next_step(&self) -> Option<String> {
        match self {
            ManagerError::UnsupportedArchive(_) => Some(
                "This archive has no recognised mod layout. Check that it contains a package/ folder, \
                 .fdata/.yumiamod.json files, hashed loose files or a nioh3modmanifest.json."
                    .to_string(),
            ),
            ManagerError::Conflict { .. } => Some(
                "Uninstall the conflicting mod(s) or choose a different option, then try again."
                    .to_string(),
            ),
            ManagerError::Io { .. } | ManagerError::Archive(_) => Some(
                "Check that the game folder is writable and the archive is not damaged, then retry."
                    .to_string(),
            ),
            ManagerError::Convert(ConvertError::Collision { .. }) => Some(
                "The selected options produce the same loose file twice. Select fewer options."
                    .to_string(),
            ),
            ManagerError::Convert(_) => None,
            ManagerError::Patch(PatchError::ExecutableMissing(_)) => Some(
                "Place yumia_mod_insert_into_rdb.exe in the game's package folder.".to_string(),
            ),
            ManagerError::Patch(_) => Some(
                "The yumia patcher failed and the install was rolled back. Verify game files via Steam if the game no longer starts."
                    .to_string(),
            ),
            ManagerError::BackupMissing(_) => Some(
                "Verify game file integrity via Steam to restore root.rdb/root.rdx, then retry."
                    .to_string(),
            ),
            ManagerError::SourceMissing { .. } => Some(
                "Put the original archive back into the downloads folder, or uninstall the mod."
                    .to_string(),
            ),
            ManagerError::Migration(err) => err.next_step(),
            ManagerError::Blocked { next_step } => Some(next_step.clone()),
            ManagerError::BackendMismatch { next_step, .. } => Some(next_step.clone()),
            ManagerError::Busy => Some("Wait for the current operation to finish.".to_string()),
            ManagerError::AlreadyInstalled(_) => {
                Some("Uninstall the existing copy first.".to_string())
            }
            ManagerError::InvalidSelection(_) => {
                Some("Choose one of the options offered by the archive.".to_string())
            }
            ManagerError::Cancelled | ManagerError::NotInstalled(_) | ManagerError::State(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_carries_next_step() {
        let err = ManagerError::Blocked {
            next_step: "Install LooseFileLoader".to_string(),
        };
        assert_eq!(err.next_step().as_deref(), Some("Install LooseFileLoader"));
    }

    #[test]
    fn test_conflict_message_lists_paths() {
        let err = ManagerError::Conflict {
            paths: vec!["package/a.fdata".to_string(), "package/b.fdata".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 conflicting"));
        assert!(msg.contains("package/b.fdata"));
        assert!(err.next_step().is_some());
    }
}
