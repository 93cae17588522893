//! Global Yumia → loose migration.
//!
//! Every Yumia record is planned first (archive reopened, selection resolved,
//! payloads converted and checked against the whole batch). Converted files are
//! staged under `<game_root>/.nioh3mm-staging/` and only then moved into
//! `mods/`. Yumia payloads are moved into the staging area rather than deleted,
//! the vanilla RDB is restored last, and the state save closes the transaction.
//! Any failure in the commit phase moves everything back.

use camino::{Utf8Path, Utf8PathBuf};
use std::collections::HashSet;
use std::fs;
use thiserror::Error;

use crate::models::{ArchiveLayout, Backend, InstalledMod, PackageState};

use super::archive::ArchiveSource;
use super::conflicts::{CandidateSet, ConflictDetector};
use super::convert::{LooseFile, convert_to_loose, sanitize_mod_dir_name};
use super::engine::{EngineContext, run_patcher};
use super::environment::LOOSE_MODS_DIR;
use super::error::ManagerError;
use super::fs_txn::{FileTransaction, remove_empty_dirs};
use super::selection;

/// Name of the side directory used while a migration is in flight.
pub const STAGING_DIR_NAME: &str = ".nioh3mm-staging";

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("LooseFileLoader is not fully installed (missing: {})", missing.join(", "))]
    LooseNotReady { missing: Vec<String> },

    #[error("cannot plan migration of {mod_id}: {reason}")]
    Plan { mod_id: String, reason: String },

    #[error("staging converted files failed: {reason}")]
    Staging { reason: String },

    #[error("migration failed while {step} and was rolled back: {reason}")]
    RolledBack { step: &'static str, reason: String },

    #[error(
        "migration failed while {step} ({reason}); rollback could not restore {}",
        rollback_errors.join(", ")
    )]
    PartiallyCommitted {
        step: &'static str,
        reason: String,
        rollback_errors: Vec<String>,
    },
}

impl MigrationError {
    pub fn next_step(&self) -> Option<String> {
        let step = match self {
            MigrationError::LooseNotReady { .. } => {
                "Install the DLL loader and LooseFileLoader into the game folder, then migrate."
                    .to_string()
            }
            MigrationError::Plan { mod_id, .. } => format!(
                "Check that the archive for {mod_id} is intact, or uninstall {mod_id}, then migrate again."
            ),
            MigrationError::Staging { .. } => {
                "Nothing was changed. Make sure the game folder is writable and has free space, then migrate again."
                    .to_string()
            }
            MigrationError::RolledBack { .. } => {
                "Nothing was changed. Fix the reported problem and migrate again.".to_string()
            }
            MigrationError::PartiallyCommitted { .. } => {
                "The game folder may be inconsistent. Verify game files via Steam, then check the mods folder and run verify."
                    .to_string()
            }
        };
        Some(step)
    }
}

/// A mod left on the Yumia backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedMod {
    pub mod_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationResult {
    pub converted: usize,
    pub skipped: usize,
    pub migrated_ids: Vec<String>,
    pub skipped_mods: Vec<SkippedMod>,
    /// Problems that did not undo the migration (e.g. a failed re-patch).
    pub warnings: Vec<String>,
}

/// An archive reopened for migration.
pub struct MigrationSource {
    pub archive: Box<dyn ArchiveSource>,
    pub layout: ArchiveLayout,
    pub display_name: String,
}

struct PlannedMod {
    record: InstalledMod,
    mod_dir: String,
    files: Vec<LooseFile>,
}

impl PlannedMod {
    fn loose_paths(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|file| format!("{}/{}", self.mod_dir, file.filename))
            .collect()
    }
}

/// Move every Yumia install to the loose backend in one transaction.
///
/// `open` reopens a record's archive; it is only called for records whose
/// archive still exists.
pub async fn migrate_all_yumia_to_loose<F>(
    ctx: &EngineContext<'_>,
    mut open: F,
) -> Result<MigrationResult, ManagerError>
where
    F: FnMut(&InstalledMod) -> Result<MigrationSource, ManagerError>,
{
    let current = ctx.state.snapshot();
    let yumia: Vec<InstalledMod> = current.by_backend(Backend::Yumia).cloned().collect();
    if yumia.is_empty() {
        tracing::info!("No Yumia installs to migrate");
        if ctx.state.store().legacy_path().exists() {
            // Saving drops the legacy file when it has nothing left to mirror.
            ctx.state.commit(current)?;
            ctx.metrics.record_state_save();
        }
        ctx.metrics.record_migration(0);
        return Ok(MigrationResult::default());
    }

    if !ctx.env.loose_ready() {
        return Err(MigrationError::LooseNotReady {
            missing: ctx
                .env
                .missing_loose_prerequisites()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
        .into());
    }
    if let Some(backup) = ctx.paths.missing_backup() {
        return Err(ManagerError::BackupMissing(backup));
    }

    tracing::info!("Migrating {} Yumia install(s) to loose files", yumia.len());
    ctx.events.set_total_steps(yumia.len() + 4);

    let mut result = MigrationResult::default();
    let mut plans = Vec::new();
    for record in yumia {
        ctx.check_cancel()?;
        if !record.source_archive_path.is_file() {
            let err = ManagerError::SourceMissing {
                mod_id: record.mod_id.clone(),
                path: record.source_archive_path.clone(),
            };
            tracing::warn!("Skipping {}: {}", record.mod_id, err);
            result.skipped_mods.push(SkippedMod {
                mod_id: record.mod_id.clone(),
                reason: err.to_string(),
            });
            ctx.events.advance(format!("skipped {}", record.mod_id));
            continue;
        }
        let plan = plan_mod(&mut open, record)?;
        ctx.events.advance(format!("planned {}", plan.record.mod_id));
        plans.push(plan);
    }
    result.skipped = result.skipped_mods.len();

    if plans.is_empty() {
        tracing::warn!("No Yumia install could be migrated");
        return Ok(result);
    }

    check_batch_conflicts(ctx, &current, &plans)?;

    let staging = ctx.paths.game_root.join(STAGING_DIR_NAME);
    let staged = stage(&staging, &plans).inspect_err(|_| discard_staging(&staging))?;
    ctx.events.advance("staged converted files");

    // Last point where abandoning the migration is allowed.
    if let Err(e) = ctx.check_cancel() {
        discard_staging(&staging);
        return Err(e);
    }

    let next = match commit(ctx, &current, &plans, &staged, &staging) {
        Ok(next) => next,
        Err(e) => {
            // Unrestored payloads may still sit in the staging area.
            if !matches!(
                e,
                ManagerError::Migration(MigrationError::PartiallyCommitted { .. })
            ) {
                discard_staging(&staging);
            }
            return Err(e);
        }
    };
    discard_staging(&staging);

    for plan in &plans {
        for rel in &plan.record.installed_files {
            if let Some(parent) = ctx.paths.resolve(rel).parent() {
                remove_empty_dirs(parent, &ctx.paths.package_dir);
            }
        }
        result.migrated_ids.push(plan.record.mod_id.clone());
    }
    result.converted = plans.len();

    if next.has_backend(Backend::Yumia) {
        ctx.events.advance("re-applying remaining Yumia mods");
        if let Err(e) = run_patcher(ctx).await {
            result
                .warnings
                .push(format!("Remaining Yumia mods could not be re-applied: {e}"));
        }
    }

    ctx.metrics.record_migration(result.converted);
    tracing::info!(
        "Migration finished: {} converted, {} skipped",
        result.converted,
        result.skipped
    );
    Ok(result)
}

fn plan_mod<F>(open: &mut F, record: InstalledMod) -> Result<PlannedMod, ManagerError>
where
    F: FnMut(&InstalledMod) -> Result<MigrationSource, ManagerError>,
{
    let plan_err = |reason: String| MigrationError::Plan {
        mod_id: record.mod_id.clone(),
        reason,
    };
    let mut source = open(&record).map_err(|e| plan_err(e.to_string()))?;
    let resolved = selection::resolve(&source.layout, &record.selected_options)
        .map_err(|e| plan_err(e.to_string()))?;
    let files = convert_to_loose(source.archive.as_mut(), &resolved.entries)
        .map_err(|e| plan_err(e.to_string()))?;
    if files.is_empty() {
        return Err(plan_err("selection has no convertible payloads".to_string()).into());
    }
    let mod_dir = format!(
        "{LOOSE_MODS_DIR}/{}",
        sanitize_mod_dir_name(&source.display_name)
    );
    tracing::debug!(
        "Planned {} -> {} ({} loose file(s))",
        record.mod_id,
        mod_dir,
        files.len()
    );
    Ok(PlannedMod {
        record,
        mod_dir,
        files,
    })
}

/// Check each planned mod against existing loose installs and the mods
/// planned before it in the same batch.
fn check_batch_conflicts(
    ctx: &EngineContext<'_>,
    current: &PackageState,
    plans: &[PlannedMod],
) -> Result<(), ManagerError> {
    let detector = ConflictDetector::new(&ctx.paths.game_root);
    let mut view = current.clone();
    for plan in plans {
        view.remove(&plan.record.mod_id);
    }

    let mut conflicts = std::collections::BTreeSet::new();
    for plan in plans {
        let candidates = CandidateSet::Loose {
            mod_dir: plan.mod_dir.clone(),
            filenames: plan.files.iter().map(|f| f.filename.clone()).collect(),
        };
        conflicts.extend(detector.detect(&candidates, &view, None));
        view.insert(migrated_record(plan));
    }

    if conflicts.is_empty() {
        Ok(())
    } else {
        ctx.metrics.record_conflict();
        Err(ManagerError::Conflict {
            paths: conflicts.into_iter().collect(),
        })
    }
}

fn migrated_record(plan: &PlannedMod) -> InstalledMod {
    InstalledMod {
        backend: Backend::Loose,
        installed_files: plan.loose_paths(),
        loose_mod_dir: Some(plan.mod_dir.clone()),
        file_digests: Default::default(),
        ..plan.record.clone()
    }
}

/// Write every converted file below `staging`, one folder per mod.
///
/// Returns `(staged path, game-root-relative destination)` pairs.
fn stage(
    staging: &Utf8Path,
    plans: &[PlannedMod],
) -> Result<Vec<(Utf8PathBuf, String)>, MigrationError> {
    let stage_err = |path: &Utf8Path, e: std::io::Error| MigrationError::Staging {
        reason: format!("{path}: {e}"),
    };
    if staging.exists() {
        tracing::warn!("Removing leftover staging directory {}", staging);
        fs::remove_dir_all(staging).map_err(|e| stage_err(staging, e))?;
    }

    let mut staged = Vec::new();
    for (index, plan) in plans.iter().enumerate() {
        let dir = staging.join(format!(
            "{index:03}-{}",
            sanitize_mod_dir_name(&plan.record.mod_id)
        ));
        fs::create_dir_all(&dir).map_err(|e| stage_err(&dir, e))?;
        for (file, rel) in plan.files.iter().zip(plan.loose_paths()) {
            let path = dir.join(&file.filename);
            fs::write(&path, &file.data).map_err(|e| stage_err(&path, e))?;
            staged.push((path, rel));
        }
    }

    // Everything must be on disk with its full size before the commit starts.
    for ((path, _), file) in staged.iter().zip(plans.iter().flat_map(|p| p.files.iter())) {
        let len = fs::metadata(path).map_err(|e| stage_err(path, e))?.len();
        if len != file.data.len() as u64 {
            return Err(MigrationError::Staging {
                reason: format!("{path} is {len} bytes, expected {}", file.data.len()),
            });
        }
    }
    tracing::info!("Staged {} loose file(s) in {}", staged.len(), staging);
    Ok(staged)
}

fn discard_staging(staging: &Utf8Path) {
    if staging.exists() {
        if let Err(e) = fs::remove_dir_all(staging) {
            tracing::warn!("Could not remove staging directory {}: {}", staging, e);
        }
    }
}

/// Steps 4-8: move staged files live, move Yumia payloads aside, restore the
/// vanilla RDB and save the rewritten records.
fn commit(
    ctx: &EngineContext<'_>,
    current: &PackageState,
    plans: &[PlannedMod],
    staged: &[(Utf8PathBuf, String)],
    staging: &Utf8Path,
) -> Result<PackageState, ManagerError> {
    let mut txn = FileTransaction::new()
        .with_cleanup_root(ctx.paths.loose_root())
        .with_cleanup_root(&ctx.paths.package_dir);

    let fail = |txn: FileTransaction, step: &'static str, reason: String| -> ManagerError {
        tracing::error!("Migration failed while {}: {}", step, reason);
        let failures = txn.rollback();
        if failures.is_empty() {
            MigrationError::RolledBack { step, reason }.into()
        } else {
            MigrationError::PartiallyCommitted {
                step,
                reason,
                rollback_errors: failures
                    .into_iter()
                    .map(|(path, e)| format!("{path} ({e})"))
                    .collect(),
            }
            .into()
        }
    };

    for (src, rel) in staged {
        let dest = ctx.paths.resolve(rel);
        if let Err(e) = txn.move_file(src, &dest) {
            return Err(fail(txn, "committing loose files", format!("{dest}: {e}")));
        }
    }
    ctx.events.advance("committed loose files");

    // Payloads a skipped mod also lists stay where they are.
    let migrating: HashSet<&str> = plans.iter().map(|p| p.record.mod_id.as_str()).collect();
    let still_owned: HashSet<String> = current
        .records
        .values()
        .filter(|rec| !migrating.contains(rec.mod_id.as_str()))
        .flat_map(|rec| rec.installed_files.iter().map(|f| f.to_lowercase()))
        .collect();

    let removed_dir = staging.join("removed");
    for plan in plans {
        for rel in &plan.record.installed_files {
            if still_owned.contains(&rel.to_lowercase()) {
                continue;
            }
            let path = ctx.paths.resolve(rel);
            if !path.is_file() {
                tracing::warn!("{} was already missing", rel);
                continue;
            }
            if let Err(e) = txn.move_file(&path, &removed_dir.join(rel)) {
                return Err(fail(txn, "removing Yumia payloads", format!("{path}: {e}")));
            }
        }
    }
    ctx.events.advance("removed Yumia payloads");

    for (core, backup) in ctx.paths.rdb_backup_pairs() {
        if let Err(e) = txn.copy(&backup, &core) {
            return Err(fail(txn, "restoring vanilla RDB", format!("{core}: {e}")));
        }
    }
    ctx.events.advance("restored vanilla RDB");

    let store = ctx.state.store();
    for path in [store.state_path(), store.legacy_path()] {
        if let Err(e) = txn.protect(path) {
            return Err(fail(txn, "saving install state", format!("{path}: {e}")));
        }
    }
    let mut next = current.clone();
    for plan in plans {
        next.insert(migrated_record(plan));
    }
    if let Err(e) = ctx.state.commit(next.clone()) {
        return Err(fail(txn, "saving install state", e.to_string()));
    }
    txn.commit();
    ctx.metrics.record_state_save();
    tracing::info!("Migration committed for {} mod(s)", plans.len());
    Ok(next)
}
