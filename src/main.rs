//! nioh3mm - command-line front end for the Nioh 3 mod manager
//!
//! The binary initializes, in order:
//! - Logging (daily rolling file, optional stderr mirror with `--verbose`, JSON with `--log-json`)
//! - Settings from `settings.yaml` + `NIOH3MM_*` variables, then CLI flags on top
//! - [`StateManager`] and [`Metrics`], shared with the [`ModManager`]
//! - The install records (backfilled from the legacy manifest when needed)
//!
//! Ctrl-C asks the running operation to stop: installs roll back, a migration
//! stops before it starts committing.

use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use nioh3_modmanager::logging::{LogConfig, init_logging};
use nioh3_modmanager::models::{ArchiveLayout, DEFAULT_OPTION_LABEL, ScannedArchive};
use nioh3_modmanager::services::RouteDecision;
use nioh3_modmanager::services::environment::ManagerPaths;
use nioh3_modmanager::services::patcher::patcher_for;
use nioh3_modmanager::{
    APP_NAME, ConfigManager, ManagerError, ManagerSettings, Metrics, ModManager, Selection,
    StateManager, VERSION,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "nioh3mm")]
#[command(author, version, about = "Backend-aware mod manager for Nioh 3")]
struct Cli {
    /// Directory holding settings.yaml
    #[arg(long, global = true)]
    config_dir: Option<Utf8PathBuf>,

    /// Downloads folder with mod archives
    #[arg(long, global = true)]
    mods_dir: Option<Utf8PathBuf>,

    /// The game's package/ directory
    #[arg(long, global = true)]
    package_dir: Option<Utf8PathBuf>,

    /// Simulate the yumia patcher instead of running it
    #[arg(long, global = true)]
    mock_yumia: bool,

    /// Debug-level logging
    #[arg(long, global = true)]
    debug: bool,

    /// Mirror log output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write the log file as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend prerequisites and installed mods
    Status,
    /// List archives in the downloads folder and what they offer
    Scan,
    /// Install a mod archive
    Install {
        /// Archive path, or a file name inside the downloads folder
        archive: Utf8PathBuf,
        /// Variant to install (legacy Yumia options, single loose option)
        #[arg(long, conflicts_with_all = ["component", "feature"])]
        option: Option<String>,
        /// Loose component to include (repeatable)
        #[arg(long, conflicts_with = "feature")]
        component: Vec<String>,
        /// Manifest feature choice as Feature=Choice, or Feature=none to skip (repeatable)
        #[arg(long)]
        feature: Vec<String>,
    },
    /// Uninstall a mod by its archive file name
    Uninstall { mod_id: String },
    /// Convert every Yumia install to LooseFileLoader files
    Migrate,
    /// Check tracked files against the disk
    Verify {
        /// Remove records whose files are missing
        #[arg(long)]
        prune: bool,
    },
    /// Save the given folder and patcher flags to settings.yaml
    Configure {
        /// Seconds before a hanging yumia run is treated as failed
        #[arg(long)]
        patcher_timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_dir = match &cli.config_dir {
        Some(dir) => dir.clone(),
        None => ConfigManager::default_dir().context("Could not determine a config directory")?,
    };
    let config_manager = ConfigManager::new(&config_dir)?;
    let mut settings = config_manager.load_settings()?;
    apply_flags(&mut settings, &cli);

    let _guard = init_logging(&LogConfig {
        debug: cli.debug || settings.debug_mode,
        console: cli.verbose,
        json: cli.log_json,
        ..LogConfig::in_config_dir(&config_dir)
    })?;
    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    if let Commands::Configure { patcher_timeout } = &cli.command {
        if let Some(secs) = patcher_timeout {
            settings.patcher_timeout_secs = *secs;
        }
        config_manager.save_settings(&settings)?;
        println!("Saved settings to {}", config_manager.settings_path());
        return Ok(());
    }

    let state_manager = Arc::new(StateManager::new());
    let metrics = Arc::new(Metrics::new());
    state_manager.load_from_settings(&settings);

    let Some(mods_dir) = settings.resolved_mods_dir() else {
        bail!("No downloads folder configured; pass --mods-dir or run `nioh3mm configure --mods-dir <dir>`");
    };
    let Some(package_dir) = settings.game_package_dir.clone() else {
        bail!("No game package folder configured; pass --package-dir or run `nioh3mm configure --package-dir <dir>`");
    };

    let paths = ManagerPaths::new(mods_dir, package_dir);
    let patcher = patcher_for(&settings, &paths.package_dir);
    let manager = ModManager::new(paths, patcher)
        .with_state_manager(Arc::clone(&state_manager))
        .with_metrics(Arc::clone(&metrics));

    let drift = manager.load_state().map_err(report)?;
    for (mod_id, missing) in &drift.broken {
        eprintln!("warning: {mod_id} is broken ({} tracked file(s) missing)", missing.len());
    }

    let cancel_listener = {
        let state_manager = Arc::clone(&state_manager);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::warn!("Interrupt received, requesting cancellation");
            state_manager.request_cancel();
            if !state_manager.read(|s| s.is_busy) || tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        })
    };

    let result = run(&manager, cli.command).await;
    cancel_listener.abort();

    metrics.log_summary();
    tracing::info!("Shutdown complete");
    result
}

fn apply_flags(settings: &mut ManagerSettings, cli: &Cli) {
    if let Some(dir) = &cli.mods_dir {
        settings.mods_dir = Some(dir.clone());
    }
    if let Some(dir) = &cli.package_dir {
        settings.game_package_dir = Some(dir.clone());
    }
    if cli.mock_yumia {
        settings.mock_patcher = true;
    }
    if cli.debug {
        settings.debug_mode = true;
    }
}

/// Print the error with its next step and hand it to anyhow.
fn report(err: ManagerError) -> anyhow::Error {
    if let Some(step) = err.next_step() {
        eprintln!("error: {err}");
        eprintln!("  next step: {step}");
    }
    anyhow::Error::new(err)
}

async fn run(manager: &ModManager, command: Commands) -> Result<()> {
    match command {
        Commands::Status => print_status(manager),
        Commands::Scan => {
            for archive in manager.scan_archives().map_err(report)? {
                print_archive(&archive);
            }
        }
        Commands::Install {
            archive,
            option,
            component,
            feature,
        } => {
            let path = if archive.is_file() {
                archive
            } else {
                manager.paths().mods_dir.join(&archive)
            };
            let scanned = manager.inspect_archive(&path).map_err(report)?;
            let selection = build_selection(&scanned, option, component, feature)?;
            let record = manager.install(&path, &selection).await.map_err(report)?;
            println!(
                "Installed {} [{}] with the {} backend ({} file(s))",
                record.mod_id,
                record.option_summary,
                record.backend,
                record.installed_files.len()
            );
        }
        Commands::Uninstall { mod_id } => {
            let removal = manager.uninstall(&mod_id).await.map_err(report)?;
            for outcome in &removal.removed {
                println!(
                    "Uninstalled {} ({} file(s) removed, {} already missing)",
                    outcome.mod_id,
                    outcome.removed_files,
                    outcome.missing_files.len()
                );
                for kept in &outcome.kept_files {
                    println!("  kept {kept} (still used by another mod)");
                }
            }
            if removal.rdb_restored {
                println!("Restored root.rdb/root.rdx from backups");
            }
            if let Some(err) = removal.reapply_error {
                eprintln!("warning: remaining Yumia mods could not be re-applied: {err}");
            }
        }
        Commands::Migrate => {
            let result = manager.migrate_all_yumia_to_loose().await.map_err(report)?;
            println!(
                "Migrated {} mod(s) to LooseFileLoader, skipped {}",
                result.converted, result.skipped
            );
            for skipped in &result.skipped_mods {
                println!("  skipped {}: {}", skipped.mod_id, skipped.reason);
            }
            for warning in &result.warnings {
                eprintln!("warning: {warning}");
            }
        }
        Commands::Verify { prune } => {
            let drift = manager.verify();
            if drift.is_clean() {
                println!("All tracked files are present");
            } else {
                for (mod_id, missing) in &drift.broken {
                    println!("{mod_id}: {} missing", missing.len());
                    for rel in missing {
                        println!("  {rel}");
                    }
                }
                if prune {
                    let removed = manager.prune_broken().await.map_err(report)?;
                    println!("Pruned {} broken record(s)", removed.removed.len());
                }
            }
        }
        Commands::Configure { .. } => {}
    }
    Ok(())
}

fn print_status(manager: &ModManager) {
    let report = manager.get_environment_status();
    let status = &report.status;
    println!("Game root:      {}", status.game_root);
    println!("Package folder: {}", status.package_dir);
    println!("yumia patcher:  {}", present(status.yumia_executable_present));
    println!("DLL loader:     {}", present(status.dll_loader_present));
    println!(
        "LooseFileLoader: dll {}, ini {}",
        present(status.loose_plugin_dll_present),
        present(status.loose_plugin_ini_present)
    );
    println!("RDB backups:    {}", present(status.rdb_backups_present));

    match manager.resolve_install_backend() {
        RouteDecision::Blocked { next_step } => println!("Installs:       blocked ({next_step})"),
        decision => println!(
            "Installs use:   {}",
            decision.backend().map(|b| b.as_str()).unwrap_or("-")
        ),
    }
    if report.can_migrate {
        println!("Yumia installs can be migrated to LooseFileLoader (nioh3mm migrate)");
    }

    let installed = manager.installed();
    let broken = manager.broken_mods();
    println!("\n{} installed mod(s)", installed.records.len());
    for rec in installed.records.values() {
        let flag = if broken.contains(&rec.mod_id) { " [broken]" } else { "" };
        println!(
            "  {} [{}] {} - {} file(s){}",
            rec.mod_id,
            rec.backend,
            rec.option_summary,
            rec.installed_files.len(),
            flag
        );
    }
}

fn present(flag: bool) -> &'static str {
    if flag { "found" } else { "missing" }
}

fn print_archive(archive: &ScannedArchive) {
    match &archive.layout {
        Err(e) => println!("{} (unsupported: {e})", archive.file_name),
        Ok(layout) => {
            println!("{} - {} [{}]", archive.file_name, archive.display_name, layout.kind_name());
            for option in layout.options() {
                let feature = option
                    .feature_name
                    .as_deref()
                    .map(|name| format!("{name}: "))
                    .unwrap_or_default();
                println!(
                    "  {feature}{} ({}, {} file(s){})",
                    option.label,
                    option.kind,
                    option.files.len(),
                    if option.optional { ", optional" } else { "" }
                );
            }
        }
    }
}

/// Selection from the flags, or the archive's default when none are given.
fn build_selection(
    archive: &ScannedArchive,
    option: Option<String>,
    components: Vec<String>,
    features: Vec<String>,
) -> Result<Selection> {
    if let Some(name) = option {
        return Ok(Selection::variant(name));
    }
    if !components.is_empty() {
        return Ok(Selection::Components { names: components });
    }
    if !features.is_empty() {
        let mut choices = IndexMap::new();
        for spec in features {
            let Some((feature, choice)) = spec.split_once('=') else {
                bail!("--feature expects Feature=Choice, got {spec:?}");
            };
            let choice = match choice.trim() {
                "" | "none" | "skip" => None,
                choice => Some(choice.to_string()),
            };
            choices.insert(feature.trim().to_string(), choice);
        }
        return Ok(Selection::Features { choices });
    }

    let layout = archive
        .layout
        .as_ref()
        .map_err(|e| anyhow::anyhow!("{}: {e}", archive.file_name))?;
    Ok(match layout {
        ArchiveLayout::LegacyYumia(options) => Selection::variant(
            options
                .first()
                .map(|o| o.label.clone())
                .unwrap_or_else(|| DEFAULT_OPTION_LABEL.to_string()),
        ),
        ArchiveLayout::DirectLoose(loose) if loose.multi_select => Selection::Components {
            names: loose.components.iter().map(|c| c.label.clone()).collect(),
        },
        ArchiveLayout::DirectLoose(_) => Selection::variant(DEFAULT_OPTION_LABEL),
        ArchiveLayout::Manifest(manifest) => Selection::Features {
            choices: manifest
                .features
                .iter()
                .map(|f| (f.name.clone(), f.choices.first().map(|c| c.label.clone())))
                .collect(),
        },
    })
}
