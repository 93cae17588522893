//! Services module - the mod management core.
//!
//! Everything here is framework-agnostic: no terminal output, no presentation
//! decisions, only structured results and [`ManagerError`]s that carry a next
//! step for the user.
//!
//! # Components
//!
//! - [`classifier`]: maps an archive's entry listing to an [`ArchiveLayout`](crate::models::ArchiveLayout)
//!   (manifest → legacy Yumia → root Yumia pair → direct loose, first match wins)
//! - [`selection`]: validates a user [`Selection`](crate::models::Selection) against a layout
//! - [`conflicts`]: compares planned outputs with recorded installs and the disk
//! - [`store`]: the authoritative state file, its legacy Yumia-only projection and backfill
//! - [`environment`] / [`router`]: backend prerequisites and the pure routing decision
//! - [`engine`]: install and uninstall with rollback, plus patcher invocation
//! - [`migration`]: the all-or-nothing Yumia → loose conversion of every install
//! - [`archive`], [`fdata`], [`convert`], [`patcher`], [`fs_txn`]: the plumbing underneath
//!
//! # Install flow
//!
//! 1. [`environment::probe`] and the current [`PackageState`](crate::models::PackageState)
//!    feed [`router::resolve_backend`]
//! 2. The archive is listed and classified; the chosen selection is resolved
//! 3. Candidate outputs go through the [`ConflictDetector`] before anything is written
//! 4. Files are written through a [`FileTransaction`]; Yumia installs then run the patcher
//! 5. The record is saved last, mirrored into the legacy file for Yumia installs

pub mod archive;
pub mod classifier;
pub mod conflicts;
pub mod convert;
pub mod engine;
pub mod environment;
pub mod error;
pub mod fdata;
pub mod fs_txn;
pub mod migration;
pub mod patcher;
pub mod router;
pub mod selection;
pub mod store;

pub use archive::{ArchiveError, ArchiveSource, is_supported_archive, open_archive};
pub use classifier::{ClassifyError, classify};
pub use conflicts::{CandidateSet, ConflictDetector, YumiaCandidate};
pub use convert::{ConvertError, LooseFile, convert_to_loose};
pub use engine::{EngineContext, InstallRequest, RemovalReport, UninstallOutcome};
pub use environment::{ManagerPaths, probe};
pub use error::ManagerError;
pub use fs_txn::FileTransaction;
pub use migration::{MigrationError, MigrationResult, MigrationSource, SkippedMod};
pub use patcher::{PatchError, PatchReport, Patcher, SimulatedPatcher, YumiaPatcher};
pub use router::{RouteDecision, resolve_backend};
pub use selection::{ResolvedSelection, SelectionError};
pub use store::{DriftReport, SharedState, StateStore, StoreError};
