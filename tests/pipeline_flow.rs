//! End-to-end pipeline runs against stub convert/train commands.
//!
//! The external tools are replaced by command templates that create (or
//! deliberately fail to create) the files the real tools would produce, so
//! the stage machine, skip logic and postcondition checks are exercised for
//! real without COLMAP or a GPU.

use std::fs;
use std::path::Path;

use tokio::sync::watch;

use recon_processor::config::ToolConfig;
use recon_processor::jobs::layout::{DataDirs, JobLayout};
use recon_processor::jobs::registry::{JobRegistry, JobState};
use recon_processor::jobs::status::{read_status, Stage, StatusRead};
use recon_processor::jobs::{pipeline, TrainerMode};

fn data_dirs(base: &Path) -> DataDirs {
    DataDirs {
        upload_dir: base.join("uploads"),
        output_dir: base.join("outputs"),
        log_dir: base.join("logs"),
    }
}

/// Tool config whose commands are plain shell, run from an existing cwd.
fn stub_tools(base: &Path, convert_cmd: &str, train_cmd: &str) -> ToolConfig {
    let tool_dir = base.join("tools");
    fs::create_dir_all(&tool_dir).unwrap();
    ToolConfig {
        gaussian_dir: tool_dir.clone(),
        trainer_dir: tool_dir,
        python_exe: "python".to_string(),
        convert_cmd: Some(convert_cmd.to_string()),
        train_cmd: Some(train_cmd.to_string()),
    }
}

fn seed_images(layout: &JobLayout, count: usize) {
    layout.ensure_dirs().unwrap();
    for i in 0..count {
        fs::write(layout.input_dir.join(format!("img_{i:03}.jpg")), b"jpg").unwrap();
    }
}

/// Stub SfM: produces the canonical reconstruction layout.
const GOOD_CONVERT: &str = "mkdir -p {dataset}/sparse/0 {dataset}/images && touch {dataset}/sparse/0/cameras.bin";
/// Stub trainer: produces one checkpoint with a result file.
const GOOD_TRAIN: &str =
    "mkdir -p {out}/point_cloud/iteration_30000 && touch {out}/point_cloud/iteration_30000/point_cloud.ply && echo done";

#[tokio::test]
async fn full_run_reaches_done() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = data_dirs(tmp.path());
    let layout = JobLayout::new(&dirs, "scene_01");
    seed_images(&layout, 20);
    let tools = stub_tools(tmp.path(), GOOD_CONVERT, GOOD_TRAIN);
    let (_tx, rx) = watch::channel(false);

    let outcome = pipeline::run(&layout, &tools, TrainerMode::Mini, rx).await;

    assert_eq!(outcome.stage, Stage::Done);
    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.command.contains("point_cloud"));

    // Terminal status record on disk.
    match read_status(&layout.status_file) {
        StatusRead::Record(r) => {
            assert_eq!(r.stage, Stage::Done);
            assert_eq!(r.exit_code, Some(0));
        }
        other => panic!("unexpected status: {other:?}"),
    }

    // Both stages logged into the one append-only file.
    let log = fs::read_to_string(&layout.log_file).unwrap();
    assert!(log.contains("==== CONVERT ===="));
    assert!(log.contains("==== TRAIN ===="));
    assert!(log.contains("EXIT_CODE: 0"));

    // The registry reconciles the finished job purely from disk.
    let registry = JobRegistry::new(dirs);
    let listed = registry.list();
    let entry = listed.iter().find(|v| v.job_id == "scene_01").unwrap();
    assert_eq!(entry.state, JobState::Done);
}

#[tokio::test]
async fn empty_input_fails_precheck_without_spawning() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = JobLayout::new(&data_dirs(tmp.path()), "empty");
    layout.ensure_dirs().unwrap();
    // Stub commands would create a marker if they ever ran.
    let tools = stub_tools(tmp.path(), "touch /tmp/convert_ran_empty", "touch /tmp/train_ran_empty");
    let (_tx, rx) = watch::channel(false);

    let outcome = pipeline::run(&layout, &tools, TrainerMode::Mini, rx).await;

    assert_eq!(outcome.stage, Stage::PrecheckFailed);
    assert_eq!(outcome.exit_code, 1);
    assert!(!layout.log_file.exists());
}

#[tokio::test]
async fn existing_reconstruction_skips_convert() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = JobLayout::new(&data_dirs(tmp.path()), "resume");
    seed_images(&layout, 3);
    // Pre-seed a valid canonical reconstruction.
    fs::create_dir_all(layout.dataset_root.join("sparse/0")).unwrap();
    // A convert command that would fail loudly if invoked.
    let tools = stub_tools(tmp.path(), "exit 97", GOOD_TRAIN);

    for _ in 0..2 {
        let (_tx, rx) = watch::channel(false);
        let outcome = pipeline::run(&layout, &tools, TrainerMode::Mini, rx).await;
        assert_eq!(outcome.stage, Stage::Done);
    }

    // Training ran, convert never did.
    let log = fs::read_to_string(&layout.log_file).unwrap();
    assert!(log.contains("==== TRAIN ===="));
    assert!(!log.contains("==== CONVERT ===="));
}

#[tokio::test]
async fn stray_sparse_tree_is_adopted_then_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = JobLayout::new(&data_dirs(tmp.path()), "unpacked");
    seed_images(&layout, 3);
    // As if a dataset zip unpacked its reconstruction somewhere else.
    fs::create_dir_all(layout.input_dir.join("bundle/sparse/0")).unwrap();
    fs::write(
        layout.input_dir.join("bundle/sparse/0/points3D.bin"),
        b"pts",
    )
    .unwrap();
    let tools = stub_tools(tmp.path(), "exit 97", GOOD_TRAIN);
    let (_tx, rx) = watch::channel(false);

    let outcome = pipeline::run(&layout, &tools, TrainerMode::Mini, rx).await;

    assert_eq!(outcome.stage, Stage::Done);
    assert!(layout
        .dataset_root
        .join("sparse/0/points3D.bin")
        .is_file());
}

#[tokio::test]
async fn lying_exit_code_fails_convert_postcondition() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = JobLayout::new(&data_dirs(tmp.path()), "liar");
    seed_images(&layout, 3);
    // Exits 0 but produces nothing.
    let tools = stub_tools(tmp.path(), "true", GOOD_TRAIN);
    let (_tx, rx) = watch::channel(false);

    let outcome = pipeline::run(&layout, &tools, TrainerMode::Mini, rx).await;

    assert_eq!(outcome.stage, Stage::ConvertFailed);
    assert_eq!(outcome.exit_code, 1);
    match read_status(&layout.status_file) {
        StatusRead::Record(r) => {
            assert_eq!(r.stage, Stage::ConvertFailed);
            assert!(r.message.unwrap().contains("no reconstruction"));
        }
        other => panic!("unexpected status: {other:?}"),
    }
}

#[tokio::test]
async fn convert_failure_propagates_exit_code() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = JobLayout::new(&data_dirs(tmp.path()), "badconvert");
    seed_images(&layout, 3);
    let tools = stub_tools(tmp.path(), "echo colmap blew up >&2; exit 3", GOOD_TRAIN);
    let (_tx, rx) = watch::channel(false);

    let outcome = pipeline::run(&layout, &tools, TrainerMode::Mini, rx).await;

    assert_eq!(outcome.stage, Stage::ConvertFailed);
    assert_eq!(outcome.exit_code, 3);
    let log = fs::read_to_string(&layout.log_file).unwrap();
    assert!(log.contains("colmap blew up"));
    assert!(log.contains("EXIT_CODE: 3"));
}

#[tokio::test]
async fn train_without_checkpoint_fails_postcondition() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = JobLayout::new(&data_dirs(tmp.path()), "nockpt");
    seed_images(&layout, 3);
    // Train exits 0 but writes no checkpoint.
    let tools = stub_tools(tmp.path(), GOOD_CONVERT, "echo training; true");
    let (_tx, rx) = watch::channel(false);

    let outcome = pipeline::run(&layout, &tools, TrainerMode::Mini, rx).await;

    assert_eq!(outcome.stage, Stage::TrainFailed);
    assert_eq!(outcome.exit_code, 1);
}

#[tokio::test]
async fn train_failure_propagates_exit_code() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = JobLayout::new(&data_dirs(tmp.path()), "badtrain");
    seed_images(&layout, 3);
    let tools = stub_tools(tmp.path(), GOOD_CONVERT, "exit 9");
    let (_tx, rx) = watch::channel(false);

    let outcome = pipeline::run(&layout, &tools, TrainerMode::Mini, rx).await;

    assert_eq!(outcome.stage, Stage::TrainFailed);
    assert_eq!(outcome.exit_code, 9);

    // Failed jobs stay listed, with the log intact for diagnosis.
    let registry = JobRegistry::new(data_dirs(tmp.path()));
    let view = registry.view("badtrain").unwrap();
    assert_eq!(view.state, JobState::Failed);
    assert!(layout.log_file.is_file());
}

#[tokio::test]
async fn launch_failure_is_reported_not_conflated() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = data_dirs(tmp.path());
    let layout = JobLayout::new(&dirs, "nolaunch");
    seed_images(&layout, 3);
    // cwd points at a directory that does not exist, so spawn itself fails.
    let tools = ToolConfig {
        gaussian_dir: tmp.path().join("missing-tooldir"),
        trainer_dir: tmp.path().join("missing-tooldir"),
        python_exe: "python".to_string(),
        convert_cmd: Some("true".to_string()),
        train_cmd: Some("true".to_string()),
    };
    let (_tx, rx) = watch::channel(false);

    let outcome = pipeline::run(&layout, &tools, TrainerMode::Mini, rx).await;

    assert_eq!(outcome.stage, Stage::ConvertFailed);
    assert_eq!(outcome.exit_code, -1);
    match read_status(&layout.status_file) {
        StatusRead::Record(r) => {
            assert!(r.message.unwrap().contains("failed to launch"));
        }
        other => panic!("unexpected status: {other:?}"),
    }
}
