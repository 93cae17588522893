//! The operation boundary used by the CLI (or any other front end).
//!
//! [`ModManager`] owns the configured paths, the in-memory install records and
//! the single operation slot. Queries (`get_environment_status`,
//! `resolve_install_backend`, `scan_archives`, ...) never take the slot;
//! mutating calls (`install`, `uninstall`, `migrate_all_yumia_to_loose`,
//! `prune_broken`) fail with [`ManagerError::Busy`] while another one runs.

use camino::Utf8Path;
use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::metrics::Metrics;
use crate::models::{
    Backend, EnvironmentReport, InstalledMod, MAX_CONCURRENT_OPERATIONS, OperationKind,
    PackageState, ScannedArchive, Selection,
};
use crate::services::archive::{self, ArchiveSource};
use crate::services::engine::{self, EngineContext, InstallRequest, RemovalReport};
use crate::services::environment::{ManagerPaths, probe};
use crate::services::migration::{self, MigrationResult, MigrationSource};
use crate::services::router::{RouteDecision, resolve_backend};
use crate::services::store::{self, BackfillSource, DriftReport, SharedState, StateStore};
use crate::services::{ManagerError, Patcher, classifier};
use crate::state::StateManager;

/// Releases the operation slot and reports the outcome to the state manager.
///
/// Dropping it without [`finish`](Self::finish) (the operation future was
/// dropped) records the operation as cancelled.
struct OperationGuard<'a> {
    _permit: SemaphorePermit<'a>,
    events: &'a StateManager,
    finished: bool,
}

impl OperationGuard<'_> {
    fn finish<T>(mut self, result: &Result<T, ManagerError>) {
        self.finished = true;
        let error = result.as_ref().err().map(|e| match e.next_step() {
            Some(step) => format!("{e}. {step}"),
            None => e.to_string(),
        });
        self.events.finish_operation(error);
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.events
                .finish_operation(Some(ManagerError::Cancelled.to_string()));
        }
    }
}

pub struct ModManager {
    paths: ManagerPaths,
    shared: SharedState,
    patcher: Arc<dyn Patcher>,
    events: Arc<StateManager>,
    metrics: Arc<Metrics>,
    operation_slot: Semaphore,
}

impl ModManager {
    /// Manager with no records loaded; call [`load_state`](Self::load_state) next.
    pub fn new(paths: ManagerPaths, patcher: Arc<dyn Patcher>) -> Self {
        let store = StateStore::new(&paths.package_dir, &paths.mods_dir);
        Self {
            shared: SharedState::new(store, PackageState::default()),
            paths,
            patcher,
            events: Arc::new(StateManager::new()),
            metrics: Arc::new(Metrics::new()),
            operation_slot: Semaphore::new(MAX_CONCURRENT_OPERATIONS),
        }
    }

    pub fn with_state_manager(mut self, events: Arc<StateManager>) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn paths(&self) -> &ManagerPaths {
        &self.paths
    }

    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Copy of the current install records.
    pub fn installed(&self) -> PackageState {
        self.shared.snapshot()
    }

    pub fn is_busy(&self) -> bool {
        self.operation_slot.available_permits() == 0
    }

    fn begin(&self, kind: OperationKind, detail: &str) -> Result<OperationGuard<'_>, ManagerError> {
        let permit = self
            .operation_slot
            .try_acquire()
            .map_err(|_| ManagerError::Busy)?;
        self.events.begin_operation(kind, detail);
        tracing::info!("Starting {} ({})", kind.as_str(), detail);
        Ok(OperationGuard {
            _permit: permit,
            events: &self.events,
            finished: false,
        })
    }

    fn context<'a>(&'a self, env: &'a crate::models::EnvironmentStatus) -> EngineContext<'a> {
        EngineContext {
            paths: &self.paths,
            env,
            patcher: self.patcher.as_ref(),
            state: &self.shared,
            events: &self.events,
            metrics: &self.metrics,
        }
    }

    fn refresh_counts(&self) {
        let (yumia, loose) = self.shared.read(|state| {
            (
                state.by_backend(Backend::Yumia).count(),
                state.by_backend(Backend::Loose).count(),
            )
        });
        self.events.set_install_counts(yumia, loose);
    }

    /// Load the authoritative state (backfilling it from the legacy file when
    /// absent) and check every record against the disk.
    ///
    /// Missing files mark a record broken; they never fail the load.
    pub fn load_state(&self) -> Result<DriftReport, ManagerError> {
        let store = self.shared.store();
        let state = match store.load()? {
            Some(state) => state,
            None => {
                let legacy = store.load_legacy();
                if legacy.is_empty() {
                    PackageState::default()
                } else {
                    let state = store::backfill(
                        &legacy,
                        &self.paths.mods_dir,
                        &self.paths.game_root,
                        |name| self.backfill_source(name),
                    );
                    store.save(&state)?;
                    self.metrics.record_state_save();
                    state
                }
            }
        };
        tracing::info!("Loaded {} install record(s)", state.records.len());
        self.shared.replace(state);
        self.refresh_counts();
        Ok(self.verify())
    }

    fn backfill_source(&self, archive_filename: &str) -> Option<BackfillSource> {
        let archive_path = self.paths.mods_dir.join(archive_filename);
        if !archive_path.is_file() {
            return None;
        }
        let layout = match read_archive(&archive_path) {
            Ok((_, scanned)) => scanned.layout.ok(),
            Err(e) => {
                tracing::warn!("Could not inspect {} for backfill: {}", archive_path, e);
                None
            }
        };
        Some(BackfillSource {
            archive_path,
            layout,
        })
    }

    /// Re-check tracked files and publish the broken set.
    pub fn verify(&self) -> DriftReport {
        let report = self
            .shared
            .read(|state| store::verify(state, &self.paths.game_root));
        self.events
            .set_broken_mods(report.broken.keys().cloned().collect());
        report
    }

    pub fn broken_mods(&self) -> BTreeSet<String> {
        self.events.read(|state| state.broken_mods.clone())
    }

    pub fn get_environment_status(&self) -> EnvironmentReport {
        let status = probe(&self.paths.package_dir);
        let (has_yumia, has_loose, decision) = self.shared.read(|state| {
            (
                state.has_backend(Backend::Yumia),
                state.has_backend(Backend::Loose),
                resolve_backend(&status, state),
            )
        });
        let active_backend = if has_yumia {
            Some(Backend::Yumia)
        } else if has_loose {
            Some(Backend::Loose)
        } else {
            None
        };
        EnvironmentReport {
            mods_dir_exists: self.paths.mods_dir.is_dir(),
            active_backend,
            has_active_yumia_mods: has_yumia,
            has_active_loose_mods: has_loose,
            can_install: decision.backend().is_some(),
            can_migrate: has_yumia && status.loose_ready(),
            status,
        }
    }

    pub fn resolve_install_backend(&self) -> RouteDecision {
        let env = probe(&self.paths.package_dir);
        self.shared.read(|state| resolve_backend(&env, state))
    }

    /// Every supported archive in the downloads folder, sorted by file name.
    ///
    /// Archives that cannot be opened are logged and left out; archives with
    /// no recognised layout are listed with their classification error.
    pub fn scan_archives(&self) -> Result<Vec<ScannedArchive>, ManagerError> {
        let read_dir = fs::read_dir(&self.paths.mods_dir)
            .map_err(|e| ManagerError::io(&self.paths.mods_dir, e))?;
        let mut paths: Vec<_> = read_dir
            .flatten()
            .filter_map(|entry| camino::Utf8PathBuf::from_path_buf(entry.path()).ok())
            .filter(|path| path.is_file() && archive::is_supported_archive(path))
            .collect();
        paths.sort_by_key(|path| path.file_name().map(str::to_lowercase));

        let mut scanned = Vec::with_capacity(paths.len());
        for path in paths {
            match read_archive(&path) {
                Ok((_, archive)) => scanned.push(archive),
                Err(e) => tracing::warn!("Skipping unreadable archive {}: {}", path, e),
            }
        }
        tracing::info!("Scanned {} archive(s) in {}", scanned.len(), self.paths.mods_dir);
        Ok(scanned)
    }

    pub fn inspect_archive(&self, path: &Utf8Path) -> Result<ScannedArchive, ManagerError> {
        read_archive(path).map(|(_, scanned)| scanned)
    }

    /// Install `selection` from the archive at `archive_path` with the routed backend.
    pub async fn install(
        &self,
        archive_path: &Utf8Path,
        selection: &Selection,
    ) -> Result<InstalledMod, ManagerError> {
        let guard = self.begin(OperationKind::Install, archive_path.as_str())?;
        let result = self.install_inner(archive_path, selection).await;
        guard.finish(&result);
        self.refresh_counts();
        result
    }

    async fn install_inner(
        &self,
        archive_path: &Utf8Path,
        selection: &Selection,
    ) -> Result<InstalledMod, ManagerError> {
        let env = probe(&self.paths.package_dir);
        let backend = match self.shared.read(|state| resolve_backend(&env, state)) {
            RouteDecision::Yumia => Backend::Yumia,
            RouteDecision::Loose => Backend::Loose,
            RouteDecision::Blocked { next_step } => {
                return Err(ManagerError::Blocked { next_step });
            }
        };

        let (mut archive, scanned) = read_archive(archive_path)?;
        let layout = scanned.layout?;
        let ctx = self.context(&env);
        engine::install(
            &ctx,
            InstallRequest {
                mod_id: scanned.file_name,
                display_name: scanned.display_name,
                archive: archive.as_mut(),
                layout: &layout,
                selection,
                backend,
            },
        )
        .await
    }

    pub async fn uninstall(&self, mod_id: &str) -> Result<RemovalReport, ManagerError> {
        let guard = self.begin(OperationKind::Uninstall, mod_id)?;
        let env = probe(&self.paths.package_dir);
        let result = engine::uninstall(&self.context(&env), mod_id).await;
        guard.finish(&result);
        self.refresh_counts();
        if result.is_ok() {
            self.verify();
        }
        result
    }

    /// Drop every record that [`verify`](Self::verify) reports as broken,
    /// deleting whatever of its files remains.
    pub async fn prune_broken(&self) -> Result<RemovalReport, ManagerError> {
        let guard = self.begin(OperationKind::Prune, "broken records")?;
        let broken: Vec<String> = self.verify().broken.into_keys().collect();
        let env = probe(&self.paths.package_dir);
        let result = engine::remove_records(&self.context(&env), &broken, false).await;
        guard.finish(&result);
        self.refresh_counts();
        self.verify();
        result
    }

    /// Convert every Yumia install to loose files in one transaction.
    pub async fn migrate_all_yumia_to_loose(&self) -> Result<MigrationResult, ManagerError> {
        let guard = self.begin(OperationKind::Migrate, "yumia -> loose")?;
        let env = probe(&self.paths.package_dir);
        let result = migration::migrate_all_yumia_to_loose(&self.context(&env), |rec| {
            let (archive, scanned) = read_archive(&rec.source_archive_path)?;
            Ok(MigrationSource {
                archive,
                layout: scanned.layout?,
                display_name: scanned.display_name,
            })
        })
        .await;
        guard.finish(&result);
        self.refresh_counts();
        if result.is_ok() {
            self.verify();
        }
        result
    }
}

/// Open, list and classify an archive.
fn read_archive(path: &Utf8Path) -> Result<(Box<dyn ArchiveSource>, ScannedArchive), ManagerError> {
    let mut source = archive::open_archive(path)?;
    let (entries, manifest) = archive::list_with_manifest(source.as_mut())?;
    let layout = classifier::classify(&entries, manifest.as_deref());

    let file_name = path.file_name().unwrap_or(path.as_str()).to_string();
    let display_name = layout
        .as_ref()
        .ok()
        .and_then(|layout| layout.manifest())
        .and_then(|manifest| manifest.mod_name.clone())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| path.file_stem().unwrap_or(&file_name).to_string());

    if let Err(e) = &layout {
        tracing::debug!("{} is not installable: {}", file_name, e);
    }
    Ok((
        source,
        ScannedArchive {
            path: path.to_owned(),
            file_name,
            display_name,
            entries,
            layout,
        },
    ))
}
