use super::*;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use frameset_core::{ContentHash, Manifest};
use serde_json::json;
use tempfile::TempDir;
use tracing_test::traced_test;

use crate::lock::write_or_remove;
use crate::transactions::{current_unix_timestamp, process_alive, update_transaction_status};
use crate::update::{classify, ResolvedFileView};

struct Fixture {
    _dir: TempDir,
    source: PathBuf,
    layout: TargetLayout,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("source");
    let target = dir.path().join("target");
    fs::create_dir_all(&target).expect("target dir");
    write_sources(&source, "1");
    Fixture {
        source,
        layout: TargetLayout::new(target),
        _dir: dir,
    }
}

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dir");
    }
    fs::write(path, contents).expect("write file");
}

fn read_file(path: &Path) -> String {
    fs::read_to_string(path).expect("read file")
}

fn write_sources(source: &Path, revision: &str) {
    write_file(&source.join("core/README.md"), &format!("# Kit r{revision}\n"));
    write_file(&source.join("core/GUIDE.md"), &format!("guide r{revision}\n"));
    write_file(&source.join("commands/build.md"), "build the project\n");
    write_file(&source.join("commands/nested/test.md"), "run the tests\n");
    write_file(
        &source.join("settings/settings.json"),
        "{\n  \"theme\": \"dark\",\n  \"features\": {\n    \"a\": true\n  }\n}\n",
    );
}

fn kit_manifest(version: &str) -> Manifest {
    Manifest::from_toml_str(&format!(
        r#"
name = "kit"
version = "{version}"

[[components]]
name = "core"
source = "core"
target = "."
patterns = ["*.md"]

[[components]]
name = "commands"
source = "commands"
target = "commands/kit"
patterns = ["**/*.md"]
depends_on = ["core"]

[[components]]
name = "settings"
source = "settings"
target = "."
patterns = ["settings.json"]
merge = ["settings.json"]
"#
    ))
    .expect("manifest should parse")
}

fn environment(layout: &TargetLayout) -> EnvironmentReport {
    EnvironmentReport {
        platform: "test".to_string(),
        target: layout.root().to_path_buf(),
        writable: true,
        free_bytes: None,
        existing_installation: read_metadata(layout).expect("metadata should be readable"),
    }
}

fn sequential() -> EngineConfig {
    EngineConfig {
        parallel_copies: false,
        ..EngineConfig::default()
    }
}

fn fail_at(seq: u64) -> BeforeEffect {
    Arc::new(move |current: u64, _action: &Action| {
        if current == seq {
            Err(anyhow!("injected failure at action #{seq}"))
        } else {
            Ok(())
        }
    })
}

/// Regular files below `root`, relative, skipping the engine state directory.
fn user_tree(root: &Path) -> Vec<PathBuf> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
        for entry in fs::read_dir(dir).expect("read dir") {
            let entry = entry.expect("dir entry");
            let path = entry.path();
            let rel = path.strip_prefix(root).expect("relative").to_path_buf();
            if rel == Path::new(STATE_DIR_NAME) {
                continue;
            }
            if path.is_dir() {
                out.push(rel.join(""));
                walk(root, &path, out);
            } else {
                out.push(rel);
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

fn install_kit(fixture: &Fixture, version: &str) -> InstallResult {
    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    install(
        &engine,
        &kit_manifest(version),
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions::default(),
    )
    .expect("install should succeed")
}

fn run_update(
    engine: &TransactionEngine,
    fixture: &Fixture,
    version: &str,
    options: UpdateOptions,
) -> Result<UpdateResult, EngineError> {
    let existing = require_metadata(&fixture.layout).expect("installed metadata");
    update(
        engine,
        &kit_manifest(version),
        &fixture.source,
        &existing,
        &environment(&fixture.layout),
        options,
    )
}

fn journal_reverts(layout: &TargetLayout, txid: &str) -> Vec<u64> {
    read_journal(layout, txid)
        .expect("journal should be readable")
        .into_iter()
        .filter_map(|record| match record {
            JournalRecord::Reverted { seq } => Some(seq),
            _ => None,
        })
        .collect()
}

#[test]
fn fresh_install_of_three_components_verifies_clean() {
    let fixture = fixture();
    let result = install_kit(&fixture, "1.0.0");
    let layout = &fixture.layout;

    let txid = result.txid.clone().expect("install must run a transaction");
    assert_eq!(result.installed_files.len(), 5);
    assert!(result.conflicts.is_empty());
    assert!(result.skipped.is_empty());
    assert_eq!(read_file(&layout.resolve(Path::new("README.md"))), "# Kit r1\n");
    assert_eq!(
        read_file(&layout.resolve(Path::new("commands/kit/nested/test.md"))),
        "run the tests\n"
    );

    let metadata = require_metadata(layout).expect("metadata must be written");
    assert_eq!(metadata.version.to_string(), "1.0.0");
    assert_eq!(metadata.files.len(), 5);
    assert!(metadata.components.values().all(|state| state.enabled));
    assert_eq!(metadata.components.len(), 3);
    assert_eq!(metadata.transaction_history.len(), 1);
    assert_eq!(metadata.transaction_history[0].txid, txid);
    assert_eq!(metadata.transaction_history[0].status, TransactionStatus::Committed);
    let readme = metadata.record(Path::new("README.md")).expect("readme record");
    assert_eq!(readme.component, "core");
    assert!(!readme.user_modified);
    assert_eq!(readme.content_hash, ContentHash::of_bytes(b"# Kit r1\n"));

    let report = verify_installation(layout, &metadata).expect("verify should run");
    assert!(report.is_clean());
    assert_eq!(report.checked, 5);

    let tx = read_transaction_metadata(layout, &txid)
        .expect("transaction metadata readable")
        .expect("transaction metadata present");
    assert_eq!(tx.status, TransactionStatus::Committed);
    assert_eq!(tx.operation, Operation::Install);
    assert!(!layout.transaction_staging_path(&txid).exists());
    assert!(read_lock(layout).expect("lock readable").is_none());
}

#[test]
fn reinstall_of_same_version_is_a_no_op() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let before = require_metadata(&fixture.layout).expect("metadata");

    let again = install_kit(&fixture, "1.0.0");
    assert!(again.txid.is_none());
    assert!(again.plan.is_empty());
    assert_eq!(again.already_present.len(), 5);
    assert_eq!(require_metadata(&fixture.layout).expect("metadata"), before);
    assert_eq!(list_transactions(&fixture.layout).expect("list").len(), 1);
}

#[test]
fn install_leaves_differing_files_unless_forced() {
    let fixture = fixture();
    let readme = fixture.layout.resolve(Path::new("README.md"));
    write_file(&readme, "my own readme\n");

    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let result = install(
        &engine,
        &kit_manifest("1.0.0"),
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions::default(),
    )
    .expect("install should succeed");
    assert_eq!(result.conflicts, vec![PathBuf::from("README.md")]);
    assert_eq!(read_file(&readme), "my own readme\n");
    let metadata = require_metadata(&fixture.layout).expect("metadata");
    assert!(metadata.record(Path::new("README.md")).is_none());

    let forced = install(
        &engine,
        &kit_manifest("1.0.0"),
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions {
            force: true,
            ..InstallOptions::default()
        },
    )
    .expect("forced install should succeed");
    assert!(forced.conflicts.is_empty());
    assert_eq!(read_file(&readme), "# Kit r1\n");
}

#[test]
fn failed_install_restores_target_at_every_failure_point() {
    let planning = fixture();
    let planning_engine = TransactionEngine::new(planning.layout.clone(), EngineConfig::default());
    let dry_run = install(
        &planning_engine,
        &kit_manifest("1.0.0"),
        &planning.source,
        &environment(&planning.layout),
        InstallOptions {
            dry_run: true,
            ..InstallOptions::default()
        },
    )
    .expect("dry run should succeed");
    // every planned path plus the metadata write
    let total = dry_run.plan.len() as u64 + 1;

    for failing in 0..total {
        let fixture = fixture();
        write_file(&fixture.layout.resolve(Path::new("notes.txt")), "keep me\n");
        let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default())
            .with_before_effect(fail_at(failing));

        let err = install(
            &engine,
            &kit_manifest("1.0.0"),
            &fixture.source,
            &environment(&fixture.layout),
            InstallOptions::default(),
        )
        .expect_err("injected failure must abort the install");
        let txid = match &err {
            EngineError::Action { error, .. } => error.txid.clone(),
            EngineError::Commit(err) => err.txid.clone(),
            other => panic!("unexpected error at action #{failing}: {other}"),
        };

        assert_eq!(
            user_tree(fixture.layout.root()),
            vec![PathBuf::from("notes.txt")],
            "failure at action #{failing} left changes behind"
        );
        assert!(!fixture.layout.metadata_path().exists());
        let tx = read_transaction_metadata(&fixture.layout, &txid)
            .expect("transaction metadata readable")
            .expect("transaction metadata present");
        assert_eq!(tx.status, TransactionStatus::RolledBack);
        assert!(read_lock(&fixture.layout).expect("lock readable").is_none());
    }

    let fixture = fixture();
    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default())
        .with_before_effect(fail_at(total));
    install(
        &engine,
        &kit_manifest("1.0.0"),
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions::default(),
    )
    .expect("a hook past the last action never fires");
}

#[test]
fn rollback_reverts_in_reverse_execution_order() {
    let fixture = fixture();
    let engine =
        TransactionEngine::new(fixture.layout.clone(), sequential()).with_before_effect(fail_at(5));

    let err = install(
        &engine,
        &kit_manifest("1.0.0"),
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions::default(),
    )
    .expect_err("injected failure must abort the install");
    let EngineError::Action { error, rollback } = err else {
        panic!("expected an action failure");
    };
    assert_eq!(error.seq, Some(5));
    assert_eq!(error.component.as_deref(), Some("commands"));
    assert_eq!(rollback.reverted, 6);
    assert_eq!(journal_reverts(&fixture.layout, &error.txid), vec![5, 4, 3, 2, 1, 0]);
}

#[test]
fn update_failure_mid_batch_restores_earlier_updates() {
    let fixture = fixture();
    let docs = fixture.source.join("docs");
    for index in 0..10 {
        write_file(&docs.join(format!("doc{index:02}.md")), &format!("doc {index} v1\n"));
    }
    let manifest = |version: &str| {
        Manifest::from_toml_str(&format!(
            r#"
name = "docs"
version = "{version}"

[[components]]
name = "docs"
source = "docs"
target = "docs"
patterns = ["*.md"]
"#
        ))
        .expect("manifest should parse")
    };

    let engine = TransactionEngine::new(fixture.layout.clone(), sequential());
    install(
        &engine,
        &manifest("1.0.0"),
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions::default(),
    )
    .expect("install should succeed");

    for index in 0..10 {
        write_file(&docs.join(format!("doc{index:02}.md")), &format!("doc {index} v2\n"));
    }
    let updates = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&updates);
    let hook: BeforeEffect = Arc::new(move |_seq: u64, action: &Action| {
        if matches!(action, Action::Update { .. }) && counter.fetch_add(1, Ordering::SeqCst) == 4 {
            return Err(anyhow!("disk went away"));
        }
        Ok(())
    });
    let engine = TransactionEngine::new(fixture.layout.clone(), sequential()).with_before_effect(hook);
    let existing = require_metadata(&fixture.layout).expect("metadata");
    let err = update(
        &engine,
        &manifest("2.0.0"),
        &fixture.source,
        &existing,
        &environment(&fixture.layout),
        UpdateOptions::default(),
    )
    .expect_err("fifth update must fail");
    assert!(matches!(err, EngineError::Action { .. }));
    assert_eq!(updates.load(Ordering::SeqCst), 5);

    for index in 0..10 {
        let path = fixture.layout.resolve(&PathBuf::from(format!("docs/doc{index:02}.md")));
        assert_eq!(read_file(&path), format!("doc {index} v1\n"));
    }
    assert!(!fixture.layout.backups_dir().exists());
    let metadata = require_metadata(&fixture.layout).expect("metadata");
    assert_eq!(metadata, existing);
}

#[test]
fn update_preserves_modified_files_and_backs_up_replaced_ones() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let readme = fixture.layout.resolve(Path::new("README.md"));
    write_file(&readme, "# Kit, my notes\n");
    write_sources(&fixture.source, "2");

    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let result =
        run_update(&engine, &fixture, "2.0.0", UpdateOptions::default()).expect("update");

    assert!(result.txid.is_some());
    assert_eq!(result.from_version.to_string(), "1.0.0");
    assert_eq!(result.to_version.to_string(), "2.0.0");
    assert_eq!(result.preserved_files, vec![PathBuf::from("README.md")]);
    assert_eq!(result.updated_files, vec![PathBuf::from("GUIDE.md")]);
    assert_eq!(read_file(&readme), "# Kit, my notes\n");
    assert_eq!(
        read_file(&fixture.layout.resolve(Path::new("GUIDE.md"))),
        "guide r2\n"
    );

    let backup = result.backup_path.expect("replaced files are backed up");
    assert!(backup.starts_with(fixture.layout.backups_dir()));
    assert_eq!(read_file(&backup.join("GUIDE.md")), "guide r1\n");
    assert!(!backup.join("README.md").exists());

    let metadata = require_metadata(&fixture.layout).expect("metadata");
    assert_eq!(metadata.version.to_string(), "2.0.0");
    assert!(metadata.record(Path::new("README.md")).expect("readme").user_modified);
    assert_eq!(metadata.transaction_history.len(), 2);
}

#[test]
fn update_merges_user_config_with_new_keys() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let settings = fixture.layout.resolve(Path::new("settings.json"));
    write_file(
        &settings,
        "{\"theme\": \"light\", \"features\": {\"a\": false}}\n",
    );
    write_file(
        &fixture.source.join("settings/settings.json"),
        "{\"theme\": \"dark\", \"features\": {\"a\": true, \"b\": true}, \"telemetry\": false}\n",
    );

    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let result = run_update(
        &engine,
        &fixture,
        "1.1.0",
        UpdateOptions {
            merge_config: true,
            ..UpdateOptions::default()
        },
    )
    .expect("update");

    assert_eq!(result.merged_files, vec![PathBuf::from("settings.json")]);
    let merged: serde_json::Value =
        serde_json::from_str(&read_file(&settings)).expect("merged config is JSON");
    assert_eq!(
        merged,
        json!({"theme": "light", "features": {"a": false, "b": true}, "telemetry": false})
    );

    let backup = result.backup_path.expect("merged files are backed up");
    assert_eq!(
        read_file(&backup.join("settings.json")),
        "{\"theme\": \"light\", \"features\": {\"a\": false}}\n"
    );
    let metadata = require_metadata(&fixture.layout).expect("metadata");
    assert!(metadata.record(Path::new("settings.json")).expect("record").user_modified);
}

#[test]
fn update_with_preserve_all_skips_merges() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let settings = fixture.layout.resolve(Path::new("settings.json"));
    write_file(&settings, "{\"theme\": \"light\"}\n");
    write_file(
        &fixture.source.join("settings/settings.json"),
        "{\"theme\": \"dark\", \"telemetry\": false}\n",
    );

    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let result = run_update(
        &engine,
        &fixture,
        "1.1.0",
        UpdateOptions {
            preserve_all: true,
            ..UpdateOptions::default()
        },
    )
    .expect("update");
    assert_eq!(result.preserved_files, vec![PathBuf::from("settings.json")]);
    assert!(result.merged_files.is_empty());
    assert_eq!(read_file(&settings), "{\"theme\": \"light\"}\n");
}

#[test]
fn update_removes_dropped_files_but_preserves_edited_ones() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let build = fixture.layout.resolve(Path::new("commands/kit/build.md"));
    write_file(&build, "build it my way\n");
    fs::remove_file(fixture.source.join("commands/build.md")).expect("drop build.md");
    fs::remove_dir_all(fixture.source.join("commands/nested")).expect("drop nested");
    write_file(&fixture.source.join("commands/lint.md"), "lint the code\n");

    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let result =
        run_update(&engine, &fixture, "2.0.0", UpdateOptions::default()).expect("update");

    assert_eq!(
        result.deleted_files,
        vec![PathBuf::from("commands/kit/nested/test.md")]
    );
    assert_eq!(result.created_files, vec![PathBuf::from("commands/kit/lint.md")]);
    assert!(result
        .preserved_files
        .contains(&PathBuf::from("commands/kit/build.md")));
    assert_eq!(read_file(&build), "build it my way\n");
    assert!(!fixture.layout.resolve(Path::new("commands/kit/nested")).exists());

    let backup = result.backup_path.expect("deleted files are backed up");
    assert_eq!(
        read_file(&backup.join("commands/kit/nested/test.md")),
        "run the tests\n"
    );
    let metadata = require_metadata(&fixture.layout).expect("metadata");
    assert!(metadata
        .record(Path::new("commands/kit/nested/test.md"))
        .is_none());
    assert!(metadata.record(Path::new("commands/kit/build.md")).is_some());
}

#[test]
fn unchanged_update_is_a_no_op() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let result =
        run_update(&engine, &fixture, "1.0.0", UpdateOptions::default()).expect("update");
    assert!(result.txid.is_none());
    assert!(result.plan.is_empty());
    assert!(result.backup_path.is_none());
    assert_eq!(result.unchanged_files.len(), 5);
}

#[test]
fn transaction_history_is_capped() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let engine = TransactionEngine::new(
        fixture.layout.clone(),
        EngineConfig {
            history_limit: 2,
            ..EngineConfig::default()
        },
    );
    let mut last = None;
    for version in ["1.1.0", "1.2.0", "1.3.0"] {
        let result =
            run_update(&engine, &fixture, version, UpdateOptions::default()).expect("update");
        last = result.txid;
    }
    let metadata = require_metadata(&fixture.layout).expect("metadata");
    assert_eq!(metadata.version.to_string(), "1.3.0");
    assert_eq!(metadata.transaction_history.len(), 2);
    assert_eq!(
        metadata.transaction_history.last().map(|summary| summary.txid.clone()),
        last
    );
}

fn transaction_files(layout: &TargetLayout, extension: &str) -> usize {
    fs::read_dir(layout.transactions_dir())
        .expect("transactions dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|ext| ext.to_str()) == Some(extension))
        .count()
}

#[test]
fn finished_transactions_beyond_history_limit_are_pruned() {
    let fixture = fixture();
    let config = EngineConfig {
        history_limit: 2,
        ..sequential()
    };
    let engine = TransactionEngine::new(fixture.layout.clone(), config.clone());
    install(
        &engine,
        &kit_manifest("1.0.0"),
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions::default(),
    )
    .expect("install");
    for version in ["1.1.0", "1.2.0", "1.3.0", "1.4.0", "1.5.0"] {
        run_update(&engine, &fixture, version, UpdateOptions::default()).expect("update");
    }
    assert_eq!(transaction_files(&fixture.layout, "json"), 2);
    assert_eq!(transaction_files(&fixture.layout, "journal"), 2);

    let failing = TransactionEngine::new(fixture.layout.clone(), config).with_before_effect(fail_at(0));
    run_update(&failing, &fixture, "1.6.0", UpdateOptions::default())
        .expect_err("injected failure");
    assert_eq!(transaction_files(&fixture.layout, "json"), 2);
    assert_eq!(transaction_files(&fixture.layout, "journal"), 2);
    let statuses = list_transactions(&fixture.layout)
        .expect("transactions")
        .into_iter()
        .map(|metadata| metadata.status)
        .collect::<Vec<_>>();
    assert_eq!(
        statuses,
        vec![TransactionStatus::Committed, TransactionStatus::RolledBack]
    );
    let staging = fs::read_dir(fixture.layout.transactions_staging_dir())
        .expect("staging dir")
        .count();
    assert_eq!(staging, 0);
}

#[test]
fn classify_update_decisions() {
    let shipped = ContentHash::of_bytes(b"new");
    let installed = ContentHash::of_bytes(b"old");
    let edited = ContentHash::of_bytes(b"edited");
    let record = InstalledFileRecord {
        path: PathBuf::from("a.md"),
        content_hash: installed.clone(),
        size: 3,
        mtime_unix: 0,
        component: "core".to_string(),
        user_modified: false,
    };
    let plain = ResolvedFileView {
        hash: &shipped,
        merge: false,
    };
    let mergeable = ResolvedFileView {
        hash: &shipped,
        merge: true,
    };
    let defaults = UpdateOptions::default();
    let force = UpdateOptions {
        force: true,
        ..UpdateOptions::default()
    };
    let preserve_all = UpdateOptions {
        preserve_all: true,
        ..UpdateOptions::default()
    };

    let on_disk = |hash: &ContentHash| DiskState::File(hash.clone());
    assert_eq!(
        classify(Some(&plain), Some(&record), &DiskState::Missing, &defaults),
        FileDecision::Create
    );
    assert_eq!(
        classify(Some(&plain), Some(&record), &on_disk(&installed), &defaults),
        FileDecision::Update
    );
    assert_eq!(
        classify(Some(&plain), Some(&record), &on_disk(&shipped), &defaults),
        FileDecision::Unchanged
    );
    assert_eq!(
        classify(Some(&plain), None, &on_disk(&shipped), &defaults),
        FileDecision::Adopt
    );
    assert_eq!(
        classify(Some(&plain), Some(&record), &on_disk(&edited), &defaults),
        FileDecision::Preserve
    );
    assert_eq!(
        classify(Some(&plain), Some(&record), &on_disk(&edited), &force),
        FileDecision::Update
    );
    assert_eq!(
        classify(Some(&mergeable), Some(&record), &on_disk(&edited), &defaults),
        FileDecision::Merge
    );
    assert_eq!(
        classify(Some(&mergeable), Some(&record), &on_disk(&edited), &preserve_all),
        FileDecision::Preserve
    );
    let force_and_preserve_all = UpdateOptions {
        force: true,
        preserve_all: true,
        ..UpdateOptions::default()
    };
    assert_eq!(
        classify(Some(&plain), Some(&record), &on_disk(&edited), &force_and_preserve_all),
        FileDecision::Preserve
    );
    assert_eq!(
        classify(Some(&plain), Some(&record), &on_disk(&installed), &force_and_preserve_all),
        FileDecision::Update
    );
    assert_eq!(
        classify(None, Some(&record), &on_disk(&edited), &force_and_preserve_all),
        FileDecision::Preserve
    );
    assert_eq!(
        classify(Some(&plain), None, &on_disk(&edited), &defaults),
        FileDecision::Preserve
    );
    assert_eq!(
        classify(Some(&plain), Some(&record), &DiskState::NotAFile, &force),
        FileDecision::Preserve
    );

    assert_eq!(
        classify(None, Some(&record), &on_disk(&installed), &defaults),
        FileDecision::Delete
    );
    assert_eq!(
        classify(None, Some(&record), &on_disk(&edited), &defaults),
        FileDecision::Preserve
    );
    assert_eq!(
        classify(None, Some(&record), &on_disk(&edited), &force),
        FileDecision::Delete
    );
    assert_eq!(
        classify(None, Some(&record), &on_disk(&installed), &preserve_all),
        FileDecision::Preserve
    );
    assert_eq!(
        classify(None, Some(&record), &DiskState::Missing, &defaults),
        FileDecision::Forget
    );
}

#[test]
fn missing_required_component_fails_before_any_change() {
    let fixture = fixture();
    fs::remove_dir_all(fixture.source.join("commands")).expect("remove commands source");
    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());

    let err = install(
        &engine,
        &kit_manifest("1.0.0"),
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions::default(),
    )
    .expect_err("missing required component must fail");
    match err {
        EngineError::MissingDependency { component, .. } => assert_eq!(component, "commands"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(user_tree(fixture.layout.root()).is_empty());
    assert!(!fixture.layout.state_dir().exists());
}

#[test]
fn missing_optional_component_is_skipped() {
    let fixture = fixture();
    let manifest = Manifest::from_toml_str(
        r#"
name = "kit"
version = "1.0.0"

[[components]]
name = "core"
source = "core"
target = "."
patterns = ["*.md"]

[[components]]
name = "extras"
required = false
source = "extras"
target = "extras"
patterns = ["*.md"]

[[components]]
name = "addons"
required = false
source = "core"
target = "addons"
patterns = ["*.md"]
depends_on = ["extras"]
"#,
    )
    .expect("manifest should parse");
    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());

    let result = install(
        &engine,
        &manifest,
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions::default(),
    )
    .expect("optional components must not fail the install");
    let skipped = result
        .skipped
        .iter()
        .map(|skipped| skipped.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(skipped, vec!["extras", "addons"]);
    assert_eq!(result.installed_files.len(), 2);

    let metadata = require_metadata(&fixture.layout).expect("metadata");
    assert!(metadata.components["core"].enabled);
    assert!(!metadata.components["extras"].enabled);
    assert!(!fixture.layout.resolve(Path::new("addons")).exists());
}

#[test]
fn failing_optional_component_is_undone_and_skipped() {
    let fixture = fixture();
    write_file(&fixture.source.join("extras/one.md"), "one\n");
    write_file(&fixture.source.join("extras/two.md"), "two\n");
    let manifest = Manifest::from_toml_str(
        r#"
name = "kit"
version = "1.0.0"

[[components]]
name = "core"
source = "core"
target = "."
patterns = ["*.md"]

[[components]]
name = "extras"
required = false
source = "extras"
target = "extras"
patterns = ["*.md"]
"#,
    )
    .expect("manifest should parse");
    let hook: BeforeEffect = Arc::new(|_seq: u64, action: &Action| {
        if action.path() == Path::new("extras/two.md") {
            return Err(anyhow!("cannot write extras"));
        }
        Ok(())
    });
    let engine =
        TransactionEngine::new(fixture.layout.clone(), EngineConfig::default()).with_before_effect(hook);

    let result = install(
        &engine,
        &manifest,
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions::default(),
    )
    .expect("optional failure must not fail the install");
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(result.skipped[0].name, "extras");
    assert!(!fixture.layout.resolve(Path::new("extras/one.md")).exists());
    assert!(!fixture.layout.resolve(Path::new("extras/two.md")).exists());
    assert!(fixture.layout.resolve(Path::new("README.md")).exists());

    let metadata = require_metadata(&fixture.layout).expect("metadata");
    assert!(!metadata.components["extras"].enabled);
    assert!(metadata.files.iter().all(|record| record.component == "core"));
}

#[test]
fn dry_run_leaves_target_untouched() {
    let fixture = fixture();
    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let result = install(
        &engine,
        &kit_manifest("1.0.0"),
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions {
            dry_run: true,
            ..InstallOptions::default()
        },
    )
    .expect("dry run should succeed");

    assert!(result.dry_run);
    assert!(result.txid.is_none());
    assert_eq!(result.plan.len(), 8);
    assert!(matches!(result.plan[0], Action::CreateDirectory { .. }));
    assert!(user_tree(fixture.layout.root()).is_empty());
    assert!(!fixture.layout.state_dir().exists());
}

#[test]
fn uninstall_dry_run_lists_removals_only() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let before = user_tree(fixture.layout.root());
    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let metadata = require_metadata(&fixture.layout).expect("metadata");

    let result = uninstall(
        &engine,
        &metadata,
        UninstallOptions {
            dry_run: true,
            ..UninstallOptions::default()
        },
    )
    .expect("dry run should succeed");
    assert_eq!(result.removed_files.len(), 5);
    assert!(result.txid.is_none());
    assert_eq!(user_tree(fixture.layout.root()), before);
    assert!(fixture.layout.metadata_path().exists());
}

#[test]
fn interrupt_cancels_and_rolls_back() {
    let fixture = fixture();
    let interrupt = Interrupt::new();
    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default())
        .with_interrupt(interrupt.clone());
    interrupt.request();

    let err = install(
        &engine,
        &kit_manifest("1.0.0"),
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions::default(),
    )
    .expect_err("interrupted install must fail");
    match err {
        EngineError::Cancelled { txid, rollback } => {
            assert_eq!(rollback.reverted, 0);
            let tx = read_transaction_metadata(&fixture.layout, &txid)
                .expect("readable")
                .expect("present");
            assert_eq!(tx.status, TransactionStatus::RolledBack);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(user_tree(fixture.layout.root()).is_empty());
}

#[test]
fn uninstall_moves_edited_files_to_backup() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let readme = fixture.layout.resolve(Path::new("README.md"));
    write_file(&readme, "# Kit, edited by hand\n");

    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let metadata = require_metadata(&fixture.layout).expect("metadata");
    let result = uninstall(&engine, &metadata, UninstallOptions::default()).expect("uninstall");

    assert!(result.txid.is_some());
    assert_eq!(result.removed_files.len(), 5);
    assert_eq!(result.preserved_files.len(), 1);
    let preserved = &result.preserved_files[0];
    assert_eq!(preserved.original, PathBuf::from("README.md"));
    assert_eq!(read_file(&preserved.backup), "# Kit, edited by hand\n");
    assert!(preserved
        .backup
        .starts_with(result.preservation_path.as_ref().expect("preservation path")));

    assert!(!readme.exists());
    assert!(!fixture.layout.state_dir().exists());
    let remaining = fs::read_dir(fixture.layout.root())
        .expect("read target")
        .map(|entry| entry.expect("entry").file_name())
        .collect::<Vec<_>>();
    assert_eq!(remaining, vec![std::ffi::OsString::from(BACKUPS_DIR_NAME)]);
}

#[test]
fn uninstall_can_keep_edited_files_in_place() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let readme = fixture.layout.resolve(Path::new("README.md"));
    write_file(&readme, "# Kit, edited by hand\n");

    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let metadata = require_metadata(&fixture.layout).expect("metadata");
    let result = uninstall(
        &engine,
        &metadata,
        UninstallOptions {
            preserve_customizations: false,
            ..UninstallOptions::default()
        },
    )
    .expect("uninstall");
    assert_eq!(result.kept_files, vec![PathBuf::from("README.md")]);
    assert!(result.preservation_path.is_none());
    assert_eq!(read_file(&readme), "# Kit, edited by hand\n");
    assert!(!fixture.layout.backups_dir().exists());
}

#[test]
fn purge_requires_matching_confirmation() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let readme = fixture.layout.resolve(Path::new("README.md"));
    write_file(&readme, "# Kit, edited by hand\n");

    assert_eq!(PurgeToken::expected_answer(&fixture.layout), "target");
    let err = PurgeToken::confirm(&fixture.layout, "yes").expect_err("wrong answer");
    assert!(matches!(err, EngineError::PurgeNotConfirmed { expected } if expected == "target"));

    let other = TargetLayout::new(fixture.layout.root().join("elsewhere"));
    let foreign = PurgeToken::confirm(&other, "elsewhere").expect("token for another root");
    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let metadata = require_metadata(&fixture.layout).expect("metadata");
    let err = uninstall(
        &engine,
        &metadata,
        UninstallOptions {
            purge: Some(foreign),
            ..UninstallOptions::default()
        },
    )
    .expect_err("token for another root must be refused");
    assert!(matches!(err, EngineError::PurgeNotConfirmed { .. }));

    let token = PurgeToken::confirm(&fixture.layout, " target\n").expect("confirmed");
    let result = uninstall(
        &engine,
        &metadata,
        UninstallOptions {
            purge: Some(token),
            ..UninstallOptions::default()
        },
    )
    .expect("purge");
    assert!(result.preserved_files.is_empty());
    assert!(!readme.exists());
    assert!(user_tree(fixture.layout.root()).is_empty());
}

#[test]
fn uninstall_refuses_tracked_paths_outside_the_root() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let outside = fixture.layout.root().parent().expect("parent").join("victim.txt");
    write_file(&outside, "not yours\n");

    let mut metadata = require_metadata(&fixture.layout).expect("metadata");
    metadata.upsert_record(InstalledFileRecord {
        path: PathBuf::from("../victim.txt"),
        content_hash: ContentHash::of_bytes(b"not yours\n"),
        size: 10,
        mtime_unix: 0,
        component: "core".to_string(),
        user_modified: false,
    });

    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let result = uninstall(&engine, &metadata, UninstallOptions::default()).expect("uninstall");
    assert_eq!(result.refused_paths, vec![PathBuf::from("../victim.txt")]);
    assert_eq!(read_file(&outside), "not yours\n");
}

#[test]
fn unsafe_action_paths_are_rejected() {
    let fixture = fixture();
    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let mut tx = engine.begin(Operation::Install).expect("begin");
    let err = engine
        .execute(
            &mut tx,
            Action::Create {
                path: PathBuf::from("../escape.txt"),
                content: ContentSource::Inline {
                    text: "x".to_string(),
                },
                mode: None,
            },
        )
        .expect_err("parent traversal must be rejected");
    assert_eq!(err.kind, ActionErrorKind::UnsafePath);
    assert!(tx.entries().is_empty());
    engine.rollback(tx).expect("empty rollback");
    assert!(!fixture
        .layout
        .root()
        .parent()
        .expect("parent")
        .join("escape.txt")
        .exists());
}

#[test]
#[traced_test]
fn stale_lock_from_dead_process_is_cleared() {
    let fixture = fixture();
    fixture.layout.ensure_state_dirs().expect("state dirs");
    let stale = LockMetadata {
        version: 1,
        pid: 999_999_999,
        txid: "tx-0-999999999-0".to_string(),
        operation: "install".to_string(),
        acquired_at_unix: current_unix_timestamp().expect("now"),
    };
    fs::write(
        fixture.layout.lock_path(),
        serde_json::to_vec(&stale).expect("serialize lock"),
    )
    .expect("write lock");

    let result = install_kit(&fixture, "1.0.0");
    assert!(result.txid.is_some());
    assert!(logs_contain("clearing stale lock"));
    assert!(read_lock(&fixture.layout).expect("lock readable").is_none());
}

#[test]
fn live_lock_blocks_a_second_transaction() {
    let fixture = fixture();
    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let tx = engine.begin(Operation::Install).expect("first begin");

    let err = engine
        .begin(Operation::Update)
        .expect_err("second begin must see the lock");
    match &err {
        EngineError::LockHeld(held) => {
            assert_eq!(held.pid, std::process::id());
            assert_eq!(held.txid, tx.id());
            assert_eq!(held.operation, "install");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.remediation().contains("wait for pid"));

    engine.rollback(tx).expect("rollback");
    let tx = engine.begin(Operation::Update).expect("lock is free again");
    engine.rollback(tx).expect("rollback");
}

#[test]
fn expired_lock_is_cleared_even_with_live_owner() {
    let fixture = fixture();
    fixture.layout.ensure_state_dirs().expect("state dirs");
    let old = LockMetadata {
        version: 1,
        pid: std::process::id(),
        txid: "tx-old".to_string(),
        operation: "update".to_string(),
        acquired_at_unix: 0,
    };
    fs::write(
        fixture.layout.lock_path(),
        serde_json::to_vec(&old).expect("serialize lock"),
    )
    .expect("write lock");

    let engine = TransactionEngine::new(
        fixture.layout.clone(),
        EngineConfig {
            lock_stale_after: Duration::from_secs(60),
            ..EngineConfig::default()
        },
    );
    let tx = engine.begin(Operation::Install).expect("expired lock is replaced");
    let holder = read_lock(&fixture.layout).expect("readable").expect("held");
    assert_eq!(holder.txid, tx.id());
    engine.rollback(tx).expect("rollback");
}

#[test]
fn abandoned_transaction_is_rolled_back_on_next_begin() {
    let fixture = fixture();
    let engine = TransactionEngine::new(fixture.layout.clone(), sequential());
    let mut tx = engine.begin(Operation::Install).expect("begin");
    let txid = tx.id().to_string();
    engine
        .execute(
            &mut tx,
            Action::Create {
                path: PathBuf::from("a.md"),
                content: ContentSource::Inline {
                    text: "a\n".to_string(),
                },
                mode: None,
            },
        )
        .expect("create");
    // process dies: the lock goes away, the journal stays
    drop(tx);
    assert!(fixture.layout.resolve(Path::new("a.md")).exists());

    let next = engine.begin(Operation::Install).expect("begin after crash");
    assert_eq!(next.recovered().len(), 1);
    let report = &next.recovered()[0];
    assert_eq!(report.txid, txid);
    assert_eq!(report.previous_status, TransactionStatus::Pending);
    assert_eq!(report.reverted, 1);
    assert!(!fixture.layout.resolve(Path::new("a.md")).exists());
    engine.rollback(next).expect("rollback");
}

#[test]
fn interrupted_rollback_resumes_with_remaining_entries() {
    let fixture = fixture();
    let notes = fixture.layout.resolve(Path::new("notes.md"));
    write_file(&notes, "mine\n");
    let engine = TransactionEngine::new(fixture.layout.clone(), sequential());

    let mut tx = engine.begin(Operation::Update).expect("begin");
    let txid = tx.id().to_string();
    let inline = |text: &str| ContentSource::Inline {
        text: text.to_string(),
    };
    engine
        .execute(
            &mut tx,
            Action::Update {
                path: PathBuf::from("notes.md"),
                content: inline("theirs\n"),
                mode: None,
            },
        )
        .expect("update notes");
    engine
        .execute(&mut tx, Action::CreateDirectory { path: PathBuf::from("docs") })
        .expect("create docs");
    engine
        .execute(
            &mut tx,
            Action::Create {
                path: PathBuf::from("docs/a.md"),
                content: inline("a\n"),
                mode: None,
            },
        )
        .expect("create a");
    let checkpoint = engine.checkpoint(&tx);
    engine
        .execute(
            &mut tx,
            Action::Create {
                path: PathBuf::from("docs/b.md"),
                content: inline("b\n"),
                mode: None,
            },
        )
        .expect("create b");

    // the rollback got as far as the last action before the process died
    let partial = engine.rollback_to(&mut tx, checkpoint).expect("partial rollback");
    assert_eq!(partial.reverted, 1);
    update_transaction_status(&fixture.layout, &txid, TransactionStatus::RollingBack, Vec::new())
        .expect("mark rolling back");
    drop(tx);
    let mut journal = fs::OpenOptions::new()
        .append(true)
        .open(fixture.layout.transaction_journal_path(&txid))
        .expect("open journal");
    std::io::Write::write_all(&mut journal, b"{\"event\":\"rever").expect("torn write");
    drop(journal);

    let reports = engine.recover().expect("recover");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].previous_status, TransactionStatus::RollingBack);
    assert_eq!(reports[0].reverted, 3);
    assert!(reports[0].unrestored.is_empty());

    assert_eq!(read_file(&notes), "mine\n");
    assert!(!fixture.layout.resolve(Path::new("docs")).exists());
    assert_eq!(journal_reverts(&fixture.layout, &txid), vec![3, 2, 1, 0]);
    let metadata = read_transaction_metadata(&fixture.layout, &txid)
        .expect("readable")
        .expect("present");
    assert_eq!(metadata.status, TransactionStatus::RolledBack);
    assert!(!fixture.layout.transaction_staging_path(&txid).exists());

    assert!(engine.recover().expect("second recover").is_empty());
}

#[test]
fn unrestorable_rollback_is_reported_and_retried_once() {
    let fixture = fixture();
    let notes = fixture.layout.resolve(Path::new("notes.md"));
    write_file(&notes, "mine\n");
    let engine = TransactionEngine::new(fixture.layout.clone(), sequential());

    let mut tx = engine.begin(Operation::Update).expect("begin");
    let txid = tx.id().to_string();
    engine
        .execute(
            &mut tx,
            Action::Update {
                path: PathBuf::from("notes.md"),
                content: ContentSource::Inline {
                    text: "theirs\n".to_string(),
                },
                mode: None,
            },
        )
        .expect("update notes");
    fs::remove_dir_all(fixture.layout.transaction_staging_path(&txid).join("blobs"))
        .expect("lose snapshot blobs");

    let err = engine.rollback(tx).expect_err("rollback cannot restore notes");
    assert_eq!(err.unrestored.len(), 1);
    assert_eq!(err.unrestored[0].path, PathBuf::from("notes.md"));
    let metadata = read_transaction_metadata(&fixture.layout, &txid)
        .expect("readable")
        .expect("present");
    assert_eq!(metadata.status, TransactionStatus::Failed);
    assert_eq!(metadata.unrestored, vec![PathBuf::from("notes.md")]);
    assert!(fixture.layout.transaction_staging_path(&txid).exists());
    assert!(read_lock(&fixture.layout).expect("readable").is_none());

    let reports = engine.recover().expect("recover");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].previous_status, TransactionStatus::Failed);
    assert_eq!(reports[0].unrestored.len(), 1);
    let metadata = read_transaction_metadata(&fixture.layout, &txid)
        .expect("readable")
        .expect("present");
    assert_eq!(metadata.status, TransactionStatus::RolledBack);
    assert_eq!(metadata.unrestored, vec![PathBuf::from("notes.md")]);
    assert!(engine.recover().expect("second recover").is_empty());
}

#[test]
fn recover_without_state_dir_is_empty() {
    let fixture = fixture();
    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    assert!(engine.recover().expect("recover").is_empty());
    assert!(!fixture.layout.state_dir().exists());
}

#[test]
fn verify_reports_missing_and_modified_files() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    fs::remove_file(fixture.layout.resolve(Path::new("GUIDE.md"))).expect("remove guide");
    write_file(&fixture.layout.resolve(Path::new("README.md")), "changed\n");

    let metadata = require_metadata(&fixture.layout).expect("metadata");
    let report = verify_installation(&fixture.layout, &metadata).expect("verify");
    assert_eq!(report.missing, vec![PathBuf::from("GUIDE.md")]);
    assert_eq!(report.modified, vec![PathBuf::from("README.md")]);
    let err = report.into_result().expect_err("missing files fail verification");
    assert_eq!(err.missing.len(), 1);

    write_file(&fixture.layout.resolve(Path::new("GUIDE.md")), "guide r1\n");
    let report = verify_installation(&fixture.layout, &metadata).expect("verify");
    assert!(!report.is_clean());
    report.into_result().expect("local edits alone pass");
}

#[test]
fn corrupted_metadata_is_reported() {
    let fixture = fixture();
    fixture.layout.ensure_state_dirs().expect("state dirs");
    fs::write(fixture.layout.metadata_path(), "{ not json").expect("write metadata");
    let err = read_metadata(&fixture.layout).expect_err("garbage must fail");
    assert!(matches!(err, EngineError::Corrupted { .. }));

    let manifest = kit_manifest("1.0.0");
    let mut metadata = InstallationMetadata::new(&manifest, 1);
    metadata.schema_version = METADATA_SCHEMA_VERSION + 1;
    fs::write(
        fixture.layout.metadata_path(),
        serde_json::to_vec(&metadata).expect("serialize"),
    )
    .expect("write metadata");
    let err = read_metadata(&fixture.layout).expect_err("future schema must fail");
    match err {
        EngineError::Corrupted { reason, .. } => assert!(reason.contains("schema version")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn require_metadata_without_installation() {
    let fixture = fixture();
    let err = require_metadata(&fixture.layout).expect_err("nothing installed");
    assert!(matches!(err, EngineError::NotInstalled { .. }));
}

#[test]
fn preflight_checks_writability_and_space() {
    let fixture = fixture();
    let mut report = environment(&fixture.layout);
    report.free_bytes = Some(1024);
    report.preflight(Some(512)).expect("enough space");
    report.preflight(None).expect("no requirement");

    let err = report.preflight(Some(4096)).expect_err("not enough space");
    assert!(matches!(
        err,
        EngineError::InsufficientSpace {
            required: 4096,
            available: 1024
        }
    ));

    report.writable = false;
    let err = report.preflight(None).expect_err("read-only target");
    assert!(matches!(err, EngineError::PermissionDenied { .. }));
}

#[test]
fn probe_reports_writable_target() {
    let fixture = fixture();
    let report = probe_environment(&fixture.layout).expect("probe");
    assert!(report.writable);
    assert!(report.existing_installation.is_none());
    assert_eq!(report.target, fixture.layout.root());

    install_kit(&fixture, "1.0.0");
    let report = probe_environment_with_timeout(&fixture.layout, Duration::from_secs(30))
        .expect("probe");
    assert_eq!(
        report
            .existing_installation
            .map(|metadata| metadata.version.to_string()),
        Some("1.0.0".to_string())
    );
}

#[test]
fn merge_json_keeps_user_values() {
    let user = json!({"theme": "light", "features": {"a": false}, "list": [1]});
    let incoming = json!({"theme": "dark", "features": {"a": true, "b": true}, "list": [2], "new": 1});

    assert_eq!(
        merge_json(&user, &incoming, MergeMode::Deep),
        json!({"theme": "light", "features": {"a": false, "b": true}, "list": [1], "new": 1})
    );
    assert_eq!(
        merge_json(&user, &incoming, MergeMode::Shallow),
        json!({"theme": "light", "features": {"a": false}, "list": [1], "new": 1})
    );
    assert!(merge_config_text("not json", "{}", MergeMode::Deep).is_err());
}

#[test]
fn inverse_follows_prior_state() {
    let hash = ContentHash::of_bytes(b"old");
    let create = Action::Create {
        path: PathBuf::from("a"),
        content: ContentSource::Inline {
            text: String::new(),
        },
        mode: None,
    };
    assert_eq!(create.inverse(&PriorState::Absent), Inverse::Remove);
    assert_eq!(
        create.inverse(&PriorState::File {
            hash: hash.clone(),
            size: 3,
            mode: Some(0o644),
        }),
        Inverse::RestoreFile {
            hash,
            mode: Some(0o644)
        }
    );

    let mkdir = Action::CreateDirectory {
        path: PathBuf::from("d"),
    };
    assert_eq!(mkdir.inverse(&PriorState::Absent), Inverse::RemoveEmptyDirectory);
    assert_eq!(
        mkdir.inverse(&PriorState::Directory { mode: None }),
        Inverse::Nothing
    );
    let delete = Action::Delete {
        path: PathBuf::from("gone"),
    };
    assert_eq!(delete.inverse(&PriorState::Absent), Inverse::Nothing);
}

#[test]
fn target_layout_paths() {
    let layout = TargetLayout::new("/opt/kit");
    assert_eq!(layout.lock_path(), PathBuf::from("/opt/kit/.frameset/lock"));
    assert_eq!(
        layout.metadata_path(),
        PathBuf::from("/opt/kit/.frameset/metadata.json")
    );
    assert_eq!(
        layout.transaction_journal_path("tx-1"),
        PathBuf::from("/opt/kit/.frameset/transactions/tx-1.journal")
    );
    assert!(layout.is_reserved(Path::new(".frameset/metadata.json")));
    assert!(layout.is_reserved(Path::new("./.frameset-backups/x")));
    assert!(!layout.is_reserved(Path::new("docs/.frameset")));
}

#[test]
fn process_liveness_comes_from_the_process_table() {
    assert!(process_alive(std::process::id()));
    assert!(!process_alive(999_999_999));

    #[cfg(unix)]
    {
        // init is alive and usually owned by another user
        assert!(process_alive(1));

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        assert!(process_alive(child.id()));
        child.kill().expect("kill sleep");
        child.wait().expect("reap sleep");
        assert!(!process_alive(child.id()));
    }
}

#[test]
fn failed_lock_write_leaves_no_lock_behind() {
    let fixture = fixture();
    fixture.layout.ensure_state_dirs().expect("state dirs");
    let lock_path = fixture.layout.lock_path();
    fs::write(&lock_path, "").expect("create empty lock");

    let err = write_or_remove(&lock_path, || {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"))
    })
    .expect_err("write must fail");
    assert!(format!("{err:#}").contains("failed to write lock file"));
    assert!(!lock_path.exists());

    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let tx = engine
        .begin(Operation::Install)
        .expect("target must not stay locked");
    engine.rollback(tx).expect("rollback");
}

#[test]
#[traced_test]
fn optional_component_that_cannot_be_undone_aborts_the_update() {
    let fixture = fixture();
    write_file(&fixture.source.join("extras/one.md"), "one r1\n");
    write_file(&fixture.source.join("extras/two.md"), "two r1\n");
    let manifest = |version: &str| {
        Manifest::from_toml_str(&format!(
            r#"
name = "kit"
version = "{version}"

[[components]]
name = "core"
source = "core"
target = "."
patterns = ["*.md"]

[[components]]
name = "extras"
required = false
source = "extras"
target = "extras"
patterns = ["*.md"]
"#
        ))
        .expect("manifest should parse")
    };
    let engine = TransactionEngine::new(fixture.layout.clone(), sequential());
    install(
        &engine,
        &manifest("1.0.0"),
        &fixture.source,
        &environment(&fixture.layout),
        InstallOptions::default(),
    )
    .expect("install");

    write_file(&fixture.source.join("extras/one.md"), "one r2\n");
    write_file(&fixture.source.join("extras/two.md"), "two r2\n");
    let staging = fixture.layout.transactions_staging_dir();
    let hook: BeforeEffect = Arc::new(move |_seq: u64, action: &Action| {
        if action.path() != Path::new("extras/two.md") {
            return Ok(());
        }
        for entry in fs::read_dir(&staging)? {
            let blobs = entry?.path().join("blobs");
            if blobs.exists() {
                fs::remove_dir_all(&blobs)?;
            }
        }
        Err(anyhow!("cannot write extras"))
    });
    let failing =
        TransactionEngine::new(fixture.layout.clone(), sequential()).with_before_effect(hook);
    let existing = require_metadata(&fixture.layout).expect("metadata");
    let err = update(
        &failing,
        &manifest("1.1.0"),
        &fixture.source,
        &existing,
        &environment(&fixture.layout),
        UpdateOptions::default(),
    )
    .expect_err("an optional component that cannot be undone fails the update");

    match err {
        EngineError::Rollback { rollback, .. } => {
            assert!(rollback
                .unrestored
                .iter()
                .any(|item| item.path == Path::new("extras/one.md")));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(logs_contain("could not undo optional component"));
}

#[cfg(unix)]
#[test]
fn actions_through_symlinked_directories_are_rejected() {
    let fixture = fixture();
    let outside = fixture.layout.root().parent().expect("parent").join("outside");
    fs::create_dir_all(&outside).expect("outside dir");
    std::os::unix::fs::symlink(&outside, fixture.layout.resolve(Path::new("docs")))
        .expect("symlink docs");

    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let mut tx = engine.begin(Operation::Install).expect("begin");
    let err = engine
        .execute(
            &mut tx,
            Action::Create {
                path: PathBuf::from("docs/escape.md"),
                content: ContentSource::Inline {
                    text: "x".to_string(),
                },
                mode: None,
            },
        )
        .expect_err("symlinked parent must be rejected");
    assert_eq!(err.kind, ActionErrorKind::UnsafePath);
    assert!(tx.entries().is_empty());
    engine.rollback(tx).expect("empty rollback");
    assert!(!outside.join("escape.md").exists());
}

#[cfg(unix)]
#[test]
fn uninstall_refuses_tracked_files_behind_a_symlink() {
    let fixture = fixture();
    install_kit(&fixture, "1.0.0");
    let commands = fixture.layout.resolve(Path::new("commands"));
    let outside = fixture.layout.root().parent().expect("parent").join("moved-commands");
    fs::rename(&commands, &outside).expect("move commands out");
    std::os::unix::fs::symlink(&outside, &commands).expect("symlink commands");

    let engine = TransactionEngine::new(fixture.layout.clone(), EngineConfig::default());
    let metadata = require_metadata(&fixture.layout).expect("metadata");
    let result =
        uninstall(&engine, &metadata, UninstallOptions::default()).expect("uninstall");

    assert!(result
        .refused_paths
        .contains(&PathBuf::from("commands/kit/build.md")));
    assert_eq!(read_file(&outside.join("kit/build.md")), "build the project\n");
    assert!(!fixture.layout.resolve(Path::new("README.md")).exists());
}
