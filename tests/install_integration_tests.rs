//! End-to-end install and uninstall through `ModManager`.
//!
//! Every test builds a throwaway game folder, writes real zip archives into
//! the downloads folder and checks the disk afterwards.

mod common;

use async_trait::async_trait;
use camino::Utf8Path;
use common::*;
use mockall::mock;
use nioh3_modmanager::models::{InstalledMod, Selection};
use nioh3_modmanager::services::router::RouteDecision;
use nioh3_modmanager::services::store::{LEGACY_FILENAME, STATE_FILENAME};
use nioh3_modmanager::services::{PatchError, PatchReport, Patcher, StateStore};
use nioh3_modmanager::{Backend, ManagerError};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::Ordering;

mock! {
    pub Yumia {}

    #[async_trait]
    impl Patcher for Yumia {
        async fn apply(&self, package_dir: &Utf8Path) -> Result<PatchReport, PatchError>;
    }
}

fn default_variant() -> Selection {
    Selection::variant("(default)")
}

#[tokio::test]
async fn test_yumia_install_writes_payloads_and_both_state_files() {
    let game = GameFixture::new().with_yumia();
    let manager = game.manager();
    let archive = game.zip("Armor.zip", &as_entries(&legacy_entries("armor", 0x1111_0001, b"armor")));

    assert_eq!(manager.resolve_install_backend(), RouteDecision::Yumia);
    let record = manager.install(&archive, &default_variant()).await.unwrap();

    assert_eq!(record.mod_id, "Armor.zip");
    assert_eq!(record.backend, Backend::Yumia);
    assert_eq!(
        record.installed_files,
        vec!["package/armor.fdata", "package/armor.yumiamod.json"]
    );
    assert_eq!(record.file_digests.len(), 2);
    assert!(game.game_file("package/armor.fdata").is_file());

    // The simulated patcher creates the backups on first run.
    assert!(game.paths.package_dir.join("root.rdb.original").is_file());
    assert!(game.paths.package_dir.join(STATE_FILENAME).is_file());

    let legacy: serde_json::Value =
        serde_json::from_slice(&fs::read(game.paths.mods_dir.join(LEGACY_FILENAME)).unwrap()).unwrap();
    assert_eq!(legacy["Armor.zip"]["archive_filename"], "Armor.zip");
    assert_eq!(legacy["Armor.zip"]["installed_files"][0], "armor.fdata");

    let counts = manager.state_manager().read(|s| (s.yumia_installed, s.loose_installed));
    assert_eq!(counts, (1, 0));
}

#[tokio::test]
async fn test_yumia_uninstall_restores_core_rdb() {
    let game = GameFixture::new().with_yumia();
    let manager = game.manager();
    let archive = game.zip("Armor.zip", &as_entries(&legacy_entries("armor", 0x1111_0001, b"armor")));
    manager.install(&archive, &default_variant()).await.unwrap();

    // Stand in for what the real tool does to the core files.
    fs::write(game.paths.package_dir.join("root.rdb"), b"patched").unwrap();

    let report = manager.uninstall("Armor.zip").await.unwrap();
    assert!(report.rdb_restored);
    assert!(!report.reapplied);
    assert_eq!(report.removed[0].removed_files, 2);

    assert!(!game.game_file("package/armor.fdata").exists());
    assert_eq!(game.read_core(), (ORIGINAL_RDB.to_vec(), ORIGINAL_RDX.to_vec()));
    assert!(manager.installed().records.is_empty());
    // Nothing Yumia left, so the legacy file goes away.
    assert!(!game.paths.mods_dir.join(LEGACY_FILENAME).exists());
}

#[tokio::test]
async fn test_loose_ready_game_unpacks_yumia_archive() {
    let game = GameFixture::new().with_yumia().with_loose_loader();
    let manager = game.manager();
    let archive = game.zip("Armor.zip", &as_entries(&legacy_entries("armor", 0x1111_0001, b"armor")));

    assert_eq!(manager.resolve_install_backend(), RouteDecision::Loose);
    let record = manager.install(&archive, &default_variant()).await.unwrap();

    let expected = format!("mods/Armor/{}", loose_name(0x1111_0001));
    assert_eq!(record.backend, Backend::Loose);
    assert_eq!(record.loose_mod_dir.as_deref(), Some("mods/Armor"));
    assert_eq!(record.installed_files, vec![expected.clone()]);
    assert_eq!(fs::read(game.game_file(&expected)).unwrap(), b"armor");

    // The Yumia side stays untouched.
    assert!(!game.game_file("package/armor.fdata").exists());
    assert!(!game.paths.package_dir.join("root.rdb.original").exists());
    assert!(!game.paths.mods_dir.join(LEGACY_FILENAME).exists());
}

#[tokio::test]
async fn test_existing_yumia_install_keeps_routing_sticky() {
    let game = GameFixture::new().with_yumia();
    let manager = game.manager();
    let first = game.zip("Armor.zip", &as_entries(&legacy_entries("armor", 0x1111_0001, b"armor")));
    manager.install(&first, &default_variant()).await.unwrap();

    // Installing LooseFileLoader later does not switch backends on its own.
    let game = game.with_loose_loader();
    assert_eq!(manager.resolve_install_backend(), RouteDecision::Yumia);

    let status = manager.get_environment_status();
    assert!(status.can_migrate);
    assert_eq!(status.active_backend, Some(Backend::Yumia));

    let second = game.zip("Helmet.zip", &as_entries(&legacy_entries("helmet", 0x2222_0001, b"helm")));
    let record = manager.install(&second, &default_variant()).await.unwrap();
    assert_eq!(record.backend, Backend::Yumia);
}

#[tokio::test]
async fn test_loose_only_archive_is_rejected_on_yumia() {
    let game = GameFixture::new().with_yumia();
    let manager = game.manager();
    let archive = game.zip("Hair.zip", &[("0x0000ABCD.g1t", b"hair".to_vec())]);

    let err = manager.install(&archive, &default_variant()).await.unwrap_err();
    let ManagerError::BackendMismatch { backend, next_step } = &err else {
        panic!("expected backend mismatch, got {err:?}");
    };
    assert_eq!(*backend, Backend::Yumia);
    assert!(next_step.contains("LooseFileLoader"));
    assert!(manager.installed().records.is_empty());
    assert!(manager.state_manager().read(|s| s.last_error.is_some()));
}

#[tokio::test]
async fn test_blocked_environment_writes_nothing() {
    let game = GameFixture::new();
    let manager = game.manager();
    let archive = game.zip("Armor.zip", &as_entries(&legacy_entries("armor", 0x1111_0001, b"armor")));

    let err = manager.install(&archive, &default_variant()).await.unwrap_err();
    assert!(matches!(err, ManagerError::Blocked { .. }));
    assert!(err.next_step().unwrap().contains("yumia_mod_insert_into_rdb.exe"));
    assert!(!game.game_file("package/armor.fdata").exists());
    assert!(!game.paths.package_dir.join(STATE_FILENAME).exists());
}

#[tokio::test]
async fn test_yumia_asset_overlap_is_a_conflict() {
    let game = GameFixture::new().with_yumia();
    let manager = game.manager();
    let first = game.zip("Armor.zip", &as_entries(&legacy_entries("armor", 0x1111_0001, b"armor")));
    manager.install(&first, &default_variant()).await.unwrap();

    // Different file name, same replaced asset.
    let second = game.zip(
        "ArmorAlt.zip",
        &as_entries(&legacy_entries("armor_alt", 0x1111_0001, b"other armor")),
    );
    let err = manager.install(&second, &default_variant()).await.unwrap_err();

    let ManagerError::Conflict { paths } = &err else {
        panic!("expected conflict, got {err:?}");
    };
    assert!(paths.contains(&"package/armor_alt.yumiamod.json".to_string()));
    assert!(!game.game_file("package/armor_alt.fdata").exists());
    assert_eq!(manager.installed().records.len(), 1);
    assert_eq!(manager.metrics().conflicts_detected.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_identical_yumia_file_owned_by_another_mod_is_a_conflict() {
    let game = GameFixture::new().with_yumia();
    let manager = game.manager();
    let shared = fdata(0x3333_0001, b"shared texture");
    let first = game.zip(
        "A.zip",
        &[
            ("package/shared.fdata", shared.clone()),
            ("package/a.yumiamod.json", sidecar(&[0x4444_0001])),
        ],
    );
    let second = game.zip(
        "B.zip",
        &[
            ("package/shared.fdata", shared),
            ("package/b.yumiamod.json", sidecar(&[0x5555_0001])),
        ],
    );
    manager.install(&first, &default_variant()).await.unwrap();

    let err = manager.install(&second, &default_variant()).await.unwrap_err();
    let ManagerError::Conflict { paths } = &err else {
        panic!("expected conflict, got {err:?}");
    };
    assert_eq!(paths, &vec!["package/shared.fdata".to_string()]);
    assert!(!game.game_file("package/b.yumiamod.json").exists());

    // Removing the only owner still removes the file.
    manager.uninstall("A.zip").await.unwrap();
    assert!(!game.game_file("package/shared.fdata").exists());
    assert!(manager.broken_mods().is_empty());
}

#[tokio::test]
async fn test_uninstall_keeps_files_another_record_still_lists() {
    let game = GameFixture::new().with_yumia();
    {
        let manager = game.manager();
        let archive = game.zip("A.zip", &as_entries(&legacy_entries("shared", 0x3333_0001, b"shared")));
        manager.install(&archive, &default_variant()).await.unwrap();
    }

    // State carried over from an older build where two mods shared the files.
    let store = StateStore::new(&game.paths.package_dir, &game.paths.mods_dir);
    let mut state = store.load().unwrap().unwrap();
    let twin = InstalledMod {
        mod_id: "B.zip".to_string(),
        ..state.get("A.zip").cloned().unwrap()
    };
    state.insert(twin);
    store.save(&state).unwrap();

    let manager = game.manager();
    let report = manager.uninstall("A.zip").await.unwrap();

    assert_eq!(report.removed[0].removed_files, 0);
    assert_eq!(
        report.removed[0].kept_files,
        vec!["package/shared.fdata", "package/shared.yumiamod.json"]
    );
    assert!(game.game_file("package/shared.fdata").is_file());
    assert!(manager.installed().contains("B.zip"));
    assert!(manager.broken_mods().is_empty());
}

#[tokio::test]
async fn test_yumia_uninstall_reapplies_remaining_mods() {
    let game = GameFixture::new().with_yumia();
    let manager = game.manager();
    for (stem, hash) in [("armor", 0x1111_0001), ("helmet", 0x2222_0001)] {
        let archive = game.zip(
            &format!("{stem}.zip"),
            &as_entries(&legacy_entries(stem, hash, stem.as_bytes())),
        );
        manager.install(&archive, &default_variant()).await.unwrap();
    }
    assert_eq!(manager.metrics().patcher_runs.load(Ordering::Relaxed), 2);

    let report = manager.uninstall("armor.zip").await.unwrap();

    assert!(report.rdb_restored);
    assert!(report.reapplied);
    assert!(report.reapply_error.is_none());
    assert_eq!(manager.metrics().patcher_runs.load(Ordering::Relaxed), 3);
    assert!(!game.game_file("package/armor.fdata").exists());
    assert!(game.game_file("package/helmet.fdata").is_file());

    let state = manager.installed();
    assert!(!state.contains("armor.zip"));
    assert_eq!(state.get("helmet.zip").unwrap().backend, Backend::Yumia);
    let legacy = fs::read_to_string(game.paths.mods_dir.join(LEGACY_FILENAME)).unwrap();
    assert!(legacy.contains("helmet.zip"));
    assert!(!legacy.contains("armor.zip"));
}

#[tokio::test]
async fn test_failed_file_write_rolls_back_install() {
    let game = GameFixture::new().with_loose_loader();
    let manager = game.manager();
    let archive = game.zip(
        "Hair.zip",
        &[
            ("0x00000001.g1t", b"front".to_vec()),
            ("0x00000002.g1t", b"back".to_vec()),
            ("0x0000FFFF.g1t", b"tail".to_vec()),
        ],
    );
    // A directory sits where the last file has to go.
    let blocker = game.game_file("mods/Hair/0x0000FFFF.g1t");
    fs::create_dir_all(&blocker).unwrap();

    let err = manager.install(&archive, &default_variant()).await.unwrap_err();
    let ManagerError::Io { path, .. } = &err else {
        panic!("expected io error, got {err:?}");
    };
    assert_eq!(path, &blocker);

    assert!(!game.game_file("mods/Hair/0x00000001.g1t").exists());
    assert!(!game.game_file("mods/Hair/0x00000002.g1t").exists());
    assert!(blocker.is_dir());
    assert!(manager.installed().records.is_empty());
    assert!(!game.paths.package_dir.join(STATE_FILENAME).exists());
    assert_eq!(manager.metrics().installs_failed.load(Ordering::Relaxed), 1);
    assert!(!manager.is_busy());
}

#[tokio::test]
async fn test_wrapped_loose_archive_does_not_conflict_with_itself() {
    let game = GameFixture::new().with_loose_loader();
    let manager = game.manager();
    let archive = game.zip(
        "Wrapped.zip",
        &[
            ("0x00000001.g1t", b"common".to_vec()),
            ("Wrapped/0x00000001.g1t", b"common".to_vec()),
            ("Wrapped/0x00000002.g1t", b"extra".to_vec()),
        ],
    );

    let record = manager.install(&archive, &default_variant()).await.unwrap();

    assert_eq!(
        record.installed_files,
        vec!["mods/Wrapped/0x00000001.g1t", "mods/Wrapped/0x00000002.g1t"]
    );
    assert_eq!(manager.metrics().conflicts_detected.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_loose_filename_overlap_is_a_conflict() {
    let game = GameFixture::new().with_loose_loader();
    let manager = game.manager();
    let first = game.zip("Hair.zip", &[("0x0000ABCD.g1t", b"hair".to_vec())]);
    manager.install(&first, &default_variant()).await.unwrap();

    let second = game.zip("HairAlt.zip", &[("0x0000abcd.g1t", b"other hair".to_vec())]);
    let err = manager.install(&second, &default_variant()).await.unwrap_err();
    assert!(matches!(err, ManagerError::Conflict { .. }));
    assert!(!game.game_file("mods/HairAlt").exists());
}

#[tokio::test]
async fn test_reinstall_requires_uninstall() {
    let game = GameFixture::new().with_loose_loader();
    let manager = game.manager();
    let archive = game.zip("Hair.zip", &[("0x0000ABCD.g1t", b"hair".to_vec())]);
    manager.install(&archive, &default_variant()).await.unwrap();

    let err = manager.install(&archive, &default_variant()).await.unwrap_err();
    assert!(matches!(err, ManagerError::AlreadyInstalled(id) if id == "Hair.zip"));
}

#[tokio::test]
async fn test_patcher_failure_rolls_back_everything() {
    let game = GameFixture::new().with_yumia();
    // Backups from an earlier successful run.
    fs::write(game.paths.package_dir.join("root.rdb.original"), ORIGINAL_RDB).unwrap();
    fs::write(game.paths.package_dir.join("root.rdx.original"), ORIGINAL_RDX).unwrap();

    let mut patcher = MockYumia::new();
    patcher.expect_apply().times(1).returning(|package_dir| {
        // Half-done run: the tool already touched the core file.
        fs::write(package_dir.join("root.rdb"), b"half patched").unwrap();
        Err(PatchError::ExitCode {
            code: 3,
            output: "rdb write failed".to_string(),
        })
    });
    let manager = game.manager_with(Arc::new(patcher));
    let archive = game.zip("Armor.zip", &as_entries(&legacy_entries("armor", 0x1111_0001, b"armor")));

    let err = manager.install(&archive, &default_variant()).await.unwrap_err();
    assert!(matches!(err, ManagerError::Patch(PatchError::ExitCode { code: 3, .. })));

    assert!(!game.game_file("package/armor.fdata").exists());
    assert!(!game.game_file("package/armor.yumiamod.json").exists());
    assert_eq!(game.read_core(), (ORIGINAL_RDB.to_vec(), ORIGINAL_RDX.to_vec()));
    assert!(manager.installed().records.is_empty());
    assert!(!game.paths.package_dir.join(STATE_FILENAME).exists());
    assert_eq!(manager.metrics().patcher_failures.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_manifest_features_select_files() {
    let game = GameFixture::new().with_loose_loader();
    let manager = game.manager();
    let manifest = br#"{
        "mod_manager_version": "1.0",
        "mod_name": "Outfits",
        "common_files_dir": "common",
        "features": [
            {"name": "Color", "directory": "color"},
            {"name": "Extras", "directory": "extras", "optional": true}
        ]
    }"#;
    let archive = game.zip(
        "outfits_v2.zip",
        &[
            ("nioh3modmanifest.json", manifest.to_vec()),
            ("common/0x00000001.g1t", b"base".to_vec()),
            ("color/Red/0x00000002.g1t", b"red".to_vec()),
            ("color/Blue/0x00000002.g1t", b"blue".to_vec()),
            ("extras/Cape/0x00000003.g1t", b"cape".to_vec()),
        ],
    );

    let scanned = manager.inspect_archive(&archive).unwrap();
    assert_eq!(scanned.display_name, "Outfits");

    let mut choices = indexmap::IndexMap::new();
    choices.insert("Color".to_string(), Some("Blue".to_string()));
    choices.insert("Extras".to_string(), None);
    let record = manager
        .install(&archive, &Selection::Features { choices })
        .await
        .unwrap();

    assert_eq!(record.loose_mod_dir.as_deref(), Some("mods/Outfits"));
    assert_eq!(
        fs::read(game.game_file("mods/Outfits/0x00000002.g1t")).unwrap(),
        b"blue"
    );
    assert!(game.game_file("mods/Outfits/0x00000001.g1t").is_file());
    assert!(!game.game_file("mods/Outfits/0x00000003.g1t").exists());
}

#[tokio::test]
async fn test_state_survives_restart_and_reports_drift() {
    let game = GameFixture::new().with_loose_loader();
    {
        let manager = game.manager();
        let archive = game.zip("Hair.zip", &[("0x0000ABCD.g1t", b"hair".to_vec())]);
        manager.install(&archive, &default_variant()).await.unwrap();
    }

    fs::remove_file(game.game_file("mods/Hair/0x0000ABCD.g1t")).unwrap();

    let manager = game.manager();
    assert!(manager.installed().contains("Hair.zip"));
    assert!(manager.broken_mods().contains("Hair.zip"));

    let report = manager.prune_broken().await.unwrap();
    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.removed[0].missing_files.len(), 1);
    assert!(manager.installed().records.is_empty());
    assert!(manager.broken_mods().is_empty());
}

#[tokio::test]
async fn test_missing_state_file_is_backfilled_from_legacy() {
    let game = GameFixture::new().with_yumia();
    {
        let manager = game.manager();
        let archive = game.zip("Armor.zip", &as_entries(&legacy_entries("armor", 0x1111_0001, b"armor")));
        manager.install(&archive, &default_variant()).await.unwrap();
    }

    // An older build only knew the legacy file.
    fs::remove_file(game.paths.package_dir.join(STATE_FILENAME)).unwrap();

    let manager = game.manager();
    let record = manager.installed().get("Armor.zip").cloned().unwrap();
    assert_eq!(record.backend, Backend::Yumia);
    assert_eq!(record.selected_options, default_variant());
    assert_eq!(
        record.installed_files,
        vec!["package/armor.fdata", "package/armor.yumiamod.json"]
    );
    assert_eq!(record.file_digests.len(), 2);
    assert!(game.paths.package_dir.join(STATE_FILENAME).is_file());
}

#[test]
fn test_scan_lists_supported_archives_sorted() {
    let game = GameFixture::new();
    game.zip("b_mod.zip", &[("0x0000ABCD.g1t", b"b".to_vec())]);
    game.zip("A_mod.zip", &as_entries(&legacy_entries("a", 1, b"a")));
    game.zip("junk.zip", &[("readme.txt", b"hello".to_vec())]);
    fs::write(game.paths.mods_dir.join("notes.txt"), b"not an archive").unwrap();

    let manager = game.manager();
    let scanned = manager.scan_archives().unwrap();
    let names: Vec<&str> = scanned.iter().map(|s| s.file_name.as_str()).collect();
    assert_eq!(names, vec!["A_mod.zip", "b_mod.zip", "junk.zip"]);
    assert!(scanned[0].is_supported());
    assert!(!scanned[2].is_supported());
}
