//! Data models for the mod manager.
//!
//! - [`InstalledMod`] / [`PackageState`] / [`LegacyState`]: persisted install records
//! - [`ArchiveOption`] / [`ArchiveLayout`]: what the classifier found inside an archive
//! - [`ModManifest`]: optional `nioh3modmanifest.json` descriptor
//! - [`EnvironmentStatus`]: backend prerequisites found on disk
//! - [`ManagerSettings`]: user settings from `settings.yaml`
//! - [`AppState`]: observable runtime state held by [`StateManager`](crate::state::StateManager)

pub mod app_state;
pub mod archive;
pub mod config;
pub mod environment;
pub mod manifest;
pub mod record;

pub use app_state::{AppState, MAX_CONCURRENT_OPERATIONS, OperationKind};
pub use archive::{
    ArchiveLayout, ArchiveOption, Backend, DEFAULT_OPTION_LABEL, DirectLooseLayout, EntryPair,
    FeatureGroup, ManifestLayout, ScannedArchive,
};
pub use config::ManagerSettings;
pub use environment::{EnvironmentReport, EnvironmentStatus};
pub use manifest::{MANIFEST_FILENAME, ManifestError, ManifestFeature, ModManifest};
pub use record::{
    InstalledMod, LegacyRecord, LegacyState, PACKAGE_PREFIX, PackageState, STATE_SCHEMA_VERSION,
    Selection, legacy_projection, strip_package_prefix,
};
