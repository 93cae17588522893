//! Install and uninstall procedures for both backends.
//!
//! Every mutation goes through a [`FileTransaction`]; the record is written
//! last, so an install either leaves its files plus exactly one record or
//! nothing at all. The caller holds the operation slot for the whole call.

use camino::Utf8Path;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use crate::metrics::Metrics;
use crate::models::{
    ArchiveLayout, Backend, EnvironmentStatus, InstalledMod, PACKAGE_PREFIX, PackageState,
    Selection,
};
use crate::state::StateManager;

use super::archive::ArchiveSource;
use super::classifier::{is_sidecar, is_yumia_payload};
use super::conflicts::{CandidateSet, ConflictDetector, YumiaCandidate};
use super::convert::{ConvertError, convert_to_loose, sanitize_mod_dir_name, sha256_hex};
use super::environment::{LOOSE_MODS_DIR, ManagerPaths};
use super::error::ManagerError;
use super::fdata::YumiaSidecar;
use super::fs_txn::{FileTransaction, remove_empty_dirs};
use super::patcher::{PatchError, PatchReport, Patcher, verify_backups};
use super::router::loose_only_next_step;
use super::selection::{self, ResolvedSelection};
use super::store::SharedState;

/// Everything an operation needs besides its own arguments.
pub struct EngineContext<'a> {
    pub paths: &'a ManagerPaths,
    pub env: &'a EnvironmentStatus,
    pub patcher: &'a dyn Patcher,
    pub state: &'a SharedState,
    pub events: &'a StateManager,
    pub metrics: &'a Metrics,
}

impl EngineContext<'_> {
    pub(crate) fn check_cancel(&self) -> Result<(), ManagerError> {
        if self.events.is_cancel_requested() {
            tracing::info!("Cancellation requested, unwinding");
            Err(ManagerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Snapshot the state files so a failed save can be undone with the rest.
    fn protect_state_files(&self, txn: &mut FileTransaction) -> Result<(), ManagerError> {
        let store = self.state.store();
        for path in [store.state_path(), store.legacy_path()] {
            txn.protect(path).map_err(|e| ManagerError::io(path, e))?;
        }
        Ok(())
    }
}

pub struct InstallRequest<'a> {
    pub mod_id: String,
    /// Manifest `mod_name` or archive stem, used for the loose folder name.
    pub display_name: String,
    pub archive: &'a mut dyn ArchiveSource,
    pub layout: &'a ArchiveLayout,
    pub selection: &'a Selection,
    pub backend: Backend,
}

/// Run the patcher and check that it left both backups behind.
pub async fn run_patcher(ctx: &EngineContext<'_>) -> Result<PatchReport, PatchError> {
    let start = Instant::now();
    let result = match ctx.patcher.apply(&ctx.paths.package_dir).await {
        Ok(report) => verify_backups(&ctx.paths.package_dir).map(|()| report),
        Err(e) => Err(e),
    };
    ctx.metrics.record_patcher_run(start.elapsed(), result.is_ok());
    if let Err(e) = &result {
        tracing::error!("Patcher failed: {}", e);
    }
    result
}

fn abort(ctx: &EngineContext<'_>, txn: FileTransaction, err: ManagerError) -> ManagerError {
    let count = txn.len();
    let failures = txn.rollback();
    if failures.is_empty() {
        tracing::warn!("Rolled back {} change(s) after: {}", count, err);
    } else {
        tracing::error!(
            "Rollback after '{}' left {} path(s) unrestored",
            err,
            failures.len()
        );
    }
    ctx.metrics.record_install(false);
    err
}

/// Install one archive selection with the given backend.
pub async fn install(
    ctx: &EngineContext<'_>,
    req: InstallRequest<'_>,
) -> Result<InstalledMod, ManagerError> {
    if ctx.state.read(|state| state.contains(&req.mod_id)) {
        return Err(ManagerError::AlreadyInstalled(req.mod_id));
    }
    let resolved = selection::resolve(req.layout, req.selection)?;
    tracing::info!(
        "Installing {} [{}] with {} backend ({} entries)",
        req.mod_id,
        resolved.summary,
        req.backend,
        resolved.entries.len()
    );

    match req.backend {
        Backend::Yumia => install_yumia(ctx, req, resolved).await,
        Backend::Loose => install_loose(ctx, req, resolved).await,
    }
}

async fn install_yumia(
    ctx: &EngineContext<'_>,
    req: InstallRequest<'_>,
    resolved: ResolvedSelection,
) -> Result<InstalledMod, ManagerError> {
    if matches!(req.layout, ArchiveLayout::DirectLoose(_)) || resolved.contains_loose_payloads() {
        return Err(ManagerError::BackendMismatch {
            backend: Backend::Yumia,
            next_step: ctx
                .state
                .read(|state| loose_only_next_step(ctx.env, state)),
        });
    }

    let mut planned = Vec::new();
    for pair in resolved
        .entries
        .iter()
        .filter(|pair| is_yumia_payload(&pair.archive_path))
    {
        let data = req.archive.read_entry(&pair.archive_path)?;
        let name_hashes = if is_sidecar(&pair.archive_path) {
            match YumiaSidecar::parse(&data) {
                Ok(sidecar) => sidecar.name_hashes().clone(),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable sidecar {}: {}", pair.archive_path, e);
                    Default::default()
                }
            }
        } else {
            Default::default()
        };
        let candidate = YumiaCandidate {
            path: format!("{PACKAGE_PREFIX}{}", pair.install_path),
            digest: sha256_hex(&data),
            name_hashes,
        };
        planned.push((candidate, data));
    }
    if planned.is_empty() {
        return Err(ConvertError::NoPayloads.into());
    }

    let candidates: Vec<YumiaCandidate> = planned.iter().map(|(c, _)| c.clone()).collect();
    let current = ctx.state.snapshot();
    let conflicts = ConflictDetector::new(&ctx.paths.game_root).detect(
        &CandidateSet::Yumia(candidates),
        &current,
        None,
    );
    if !conflicts.is_empty() {
        ctx.metrics.record_conflict();
        return Err(ManagerError::Conflict {
            paths: conflicts.into_iter().collect(),
        });
    }

    ctx.events.set_total_steps(planned.len() + 1);
    let mut txn = FileTransaction::new().with_cleanup_root(&ctx.paths.package_dir);
    // The patcher rewrites these in place and creates the backups on first run.
    for (core, backup) in ctx.paths.rdb_backup_pairs() {
        for path in [core, backup] {
            if let Err(e) = txn.protect(&path) {
                return Err(abort(ctx, txn, ManagerError::io(path, e)));
            }
        }
    }
    if let Err(e) = ctx.protect_state_files(&mut txn) {
        return Err(abort(ctx, txn, e));
    }

    let mut file_digests = BTreeMap::new();
    let mut installed_files = Vec::with_capacity(planned.len());
    for (candidate, data) in &planned {
        if let Err(e) = ctx.check_cancel() {
            return Err(abort(ctx, txn, e));
        }
        let dest = ctx.paths.resolve(&candidate.path);
        if let Err(e) = txn.write(&dest, data) {
            return Err(abort(ctx, txn, ManagerError::io(dest, e)));
        }
        tracing::debug!("Wrote {}", candidate.path);
        ctx.events.advance(candidate.path.clone());
        installed_files.push(candidate.path.clone());
        file_digests.insert(candidate.path.clone(), candidate.digest.clone());
    }

    if let Err(e) = ctx.check_cancel() {
        return Err(abort(ctx, txn, e));
    }
    ctx.events.advance("running yumia");
    if let Err(e) = run_patcher(ctx).await {
        return Err(abort(ctx, txn, e.into()));
    }

    let record = InstalledMod {
        mod_id: req.mod_id.clone(),
        backend: Backend::Yumia,
        source_archive_path: req.archive.path().to_owned(),
        selected_options: resolved.selection,
        option_summary: resolved.summary,
        installed_files,
        loose_mod_dir: None,
        file_digests,
        installed_at: Utc::now(),
    };
    commit_record(ctx, txn, current, record)
}

async fn install_loose(
    ctx: &EngineContext<'_>,
    req: InstallRequest<'_>,
    resolved: ResolvedSelection,
) -> Result<InstalledMod, ManagerError> {
    let files = convert_to_loose(req.archive, &resolved.entries)?;
    if files.is_empty() {
        return Err(ConvertError::NoPayloads.into());
    }

    let mod_dir = format!("{LOOSE_MODS_DIR}/{}", sanitize_mod_dir_name(&req.display_name));
    let current = ctx.state.snapshot();
    let candidates = CandidateSet::Loose {
        mod_dir: mod_dir.clone(),
        filenames: files.iter().map(|f| f.filename.clone()).collect(),
    };
    let conflicts = ConflictDetector::new(&ctx.paths.game_root).detect(&candidates, &current, None);
    if !conflicts.is_empty() {
        ctx.metrics.record_conflict();
        return Err(ManagerError::Conflict {
            paths: conflicts.into_iter().collect(),
        });
    }

    ctx.events.set_total_steps(files.len());
    let mut txn = FileTransaction::new().with_cleanup_root(ctx.paths.loose_root());
    if let Err(e) = ctx.protect_state_files(&mut txn) {
        return Err(abort(ctx, txn, e));
    }

    let mut installed_files = Vec::with_capacity(files.len());
    for file in &files {
        if let Err(e) = ctx.check_cancel() {
            return Err(abort(ctx, txn, e));
        }
        let rel = format!("{mod_dir}/{}", file.filename);
        let dest = ctx.paths.resolve(&rel);
        if let Err(e) = txn.write(&dest, &file.data) {
            return Err(abort(ctx, txn, ManagerError::io(dest, e)));
        }
        tracing::debug!("Wrote {} (from {})", rel, file.source);
        ctx.events.advance(rel.clone());
        installed_files.push(rel);
    }

    let record = InstalledMod {
        mod_id: req.mod_id.clone(),
        backend: Backend::Loose,
        source_archive_path: req.archive.path().to_owned(),
        selected_options: resolved.selection,
        option_summary: resolved.summary,
        installed_files,
        loose_mod_dir: Some(mod_dir),
        file_digests: BTreeMap::new(),
        installed_at: Utc::now(),
    };
    commit_record(ctx, txn, current, record)
}

fn commit_record(
    ctx: &EngineContext<'_>,
    txn: FileTransaction,
    mut next: PackageState,
    record: InstalledMod,
) -> Result<InstalledMod, ManagerError> {
    next.insert(record.clone());
    if let Err(e) = ctx.state.commit(next) {
        return Err(abort(ctx, txn, e.into()));
    }
    txn.commit();
    ctx.metrics.record_state_save();
    ctx.metrics.record_install(true);
    tracing::info!(
        "Installed {} ({} file(s), {} backend)",
        record.mod_id,
        record.installed_files.len(),
        record.backend
    );
    Ok(record)
}

/// What happened to one removed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallOutcome {
    pub mod_id: String,
    pub backend: Backend,
    pub removed_files: usize,
    /// Tracked files that were already gone.
    pub missing_files: Vec<String>,
    /// Files left in place because a remaining record still lists them.
    pub kept_files: Vec<String>,
}

/// Result of removing one or more records in a single transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub removed: Vec<UninstallOutcome>,
    /// `root.rdb`/`root.rdx` were copied back from their backups.
    pub rdb_restored: bool,
    /// The patcher was re-run for the Yumia mods that remain.
    pub reapplied: bool,
    /// The re-run failed; the removal itself still stands.
    pub reapply_error: Option<String>,
}

/// Uninstall one record.
pub async fn uninstall(ctx: &EngineContext<'_>, mod_id: &str) -> Result<RemovalReport, ManagerError> {
    if !ctx.state.read(|state| state.contains(mod_id)) {
        return Err(ManagerError::NotInstalled(mod_id.to_string()));
    }
    remove_records(ctx, &[mod_id.to_string()], true).await
}

/// Remove the given records and whatever of their files still exists.
///
/// With `require_backups`, a missing `.original` backup aborts before
/// anything is deleted. Without it (pruning broken records) the RDB restore is
/// skipped with a warning instead.
pub async fn remove_records(
    ctx: &EngineContext<'_>,
    mod_ids: &[String],
    require_backups: bool,
) -> Result<RemovalReport, ManagerError> {
    let current = ctx.state.snapshot();
    let records: Vec<InstalledMod> = mod_ids
        .iter()
        .filter_map(|id| current.get(id).cloned())
        .collect();
    if records.is_empty() {
        return Ok(RemovalReport::default());
    }

    let touches_yumia = records.iter().any(|rec| rec.backend == Backend::Yumia);
    let missing_backup = if touches_yumia {
        ctx.paths.missing_backup()
    } else {
        None
    };
    if let Some(backup) = &missing_backup {
        if require_backups {
            return Err(ManagerError::BackupMissing(backup.clone()));
        }
        tracing::warn!("{} is missing, root.rdb/root.rdx will not be restored", backup);
    }

    ctx.events
        .set_total_steps(records.iter().map(|rec| rec.installed_files.len()).sum());
    let mut txn = FileTransaction::new();
    ctx.protect_state_files(&mut txn)?;

    let mut next = current;
    for rec in &records {
        next.remove(&rec.mod_id);
    }
    let still_owned: HashSet<String> = next
        .records
        .values()
        .flat_map(|rec| rec.installed_files.iter().map(|f| f.to_lowercase()))
        .collect();

    let mut report = RemovalReport::default();
    for rec in &records {
        let mut outcome = UninstallOutcome {
            mod_id: rec.mod_id.clone(),
            backend: rec.backend,
            removed_files: 0,
            missing_files: Vec::new(),
            kept_files: Vec::new(),
        };
        for rel in &rec.installed_files {
            if still_owned.contains(&rel.to_lowercase()) {
                tracing::warn!("{} is still tracked by another mod, leaving it in place", rel);
                outcome.kept_files.push(rel.clone());
                ctx.events.advance(rel.clone());
                continue;
            }
            let path = ctx.paths.resolve(rel);
            match txn.remove(&path) {
                Ok(true) => outcome.removed_files += 1,
                Ok(false) => outcome.missing_files.push(rel.clone()),
                Err(e) => return Err(rollback_removal(txn, ManagerError::io(path, e))),
            }
            ctx.events.advance(rel.clone());
        }
        if !outcome.missing_files.is_empty() {
            tracing::warn!(
                "{}: {} tracked file(s) were already missing",
                rec.mod_id,
                outcome.missing_files.len()
            );
        }
        report.removed.push(outcome);
    }

    if touches_yumia && missing_backup.is_none() {
        for (core, backup) in ctx.paths.rdb_backup_pairs() {
            if let Err(e) = txn.copy(&backup, &core) {
                return Err(rollback_removal(txn, ManagerError::io(core, e)));
            }
            tracing::info!("Restored {} from {}", core, backup);
        }
        report.rdb_restored = true;
    }

    let yumia_remaining = next.has_backend(Backend::Yumia);
    if let Err(e) = ctx.state.commit(next) {
        return Err(rollback_removal(txn, e.into()));
    }
    txn.commit();
    ctx.metrics.record_state_save();

    for rec in &records {
        ctx.metrics.record_uninstall();
        prune_record_dirs(ctx.paths, rec);
        tracing::info!("Uninstalled {} ({} backend)", rec.mod_id, rec.backend);
    }

    if touches_yumia && yumia_remaining {
        match run_patcher(ctx).await {
            Ok(_) => report.reapplied = true,
            Err(e) => {
                tracing::warn!("Remaining Yumia mods could not be re-applied: {}", e);
                report.reapply_error = Some(e.to_string());
            }
        }
    }
    Ok(report)
}

fn rollback_removal(txn: FileTransaction, err: ManagerError) -> ManagerError {
    let failures = txn.rollback();
    if !failures.is_empty() {
        tracing::error!("Rollback after '{}' left {} path(s) unrestored", err, failures.len());
    }
    err
}

/// Drop directories a removed record leaves empty.
fn prune_record_dirs(paths: &ManagerPaths, rec: &InstalledMod) {
    match rec.backend {
        Backend::Loose => {
            let loose_root = paths.loose_root();
            let dirs = rec
                .loose_mod_dir
                .iter()
                .map(|dir| paths.resolve(dir))
                .chain(parent_dirs(paths, rec));
            for dir in dirs {
                remove_empty_dirs(&dir, &loose_root);
            }
        }
        Backend::Yumia => {
            for dir in parent_dirs(paths, rec) {
                remove_empty_dirs(&dir, &paths.package_dir);
            }
        }
    }
}

fn parent_dirs<'a>(
    paths: &'a ManagerPaths,
    rec: &'a InstalledMod,
) -> impl Iterator<Item = camino::Utf8PathBuf> + 'a {
    rec.installed_files
        .iter()
        .filter_map(move |rel| paths.resolve(rel).parent().map(Utf8Path::to_owned))
}
