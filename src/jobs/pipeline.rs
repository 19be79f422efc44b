use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::ToolConfig;

use super::artifacts;
use super::layout::JobLayout;
use super::status::{write_status, Stage, StatusRecord};

/// Which training program the train stage invokes.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrainerMode {
    /// gaussian-splatting `train.py`
    Standard,
    /// mini-splatting2 `msv2/train.py` with the fast config
    #[default]
    Mini,
}

impl TrainerMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "standard" => Some(TrainerMode::Standard),
            "mini" => Some(TrainerMode::Mini),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrainerMode::Standard => "standard",
            TrainerMode::Mini => "mini",
        }
    }
}

/// Result of one pipeline run, consumed by the job registry.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Terminal stage: `Done`, `Cancelled` or one of the `*Failed` states.
    pub stage: Stage,
    pub exit_code: i32,
    /// The exact command line of the last stage that ran (or was attempted).
    pub command: String,
}

impl PipelineOutcome {
    fn failed(stage: Stage, exit_code: i32, command: &str) -> Self {
        PipelineOutcome {
            stage,
            exit_code,
            command: command.to_string(),
        }
    }
}

/// Quote a path for interpolation into a bash command line.
fn shq(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

/// Build the conversion (SfM) command and its working directory.
fn convert_command(tools: &ToolConfig, dataset_root: &Path) -> (String, PathBuf) {
    let cmd = match &tools.convert_cmd {
        Some(template) => template
            .replace("{py}", &tools.python_exe)
            .replace("{dataset}", &shq(dataset_root))
            .replace("{gs}", &shq(&tools.gaussian_dir)),
        None => format!("{} convert.py -s {}", tools.python_exe, shq(dataset_root)),
    };
    (cmd, tools.gaussian_dir.clone())
}

/// Build the training command and its working directory for `mode`.
fn train_command(
    tools: &ToolConfig,
    mode: TrainerMode,
    dataset_root: &Path,
    out_dir: &Path,
) -> (String, PathBuf) {
    if let Some(template) = &tools.train_cmd {
        let cmd = template
            .replace("{py}", &tools.python_exe)
            .replace("{dataset}", &shq(dataset_root))
            .replace("{out}", &shq(out_dir));
        return (cmd, tools.gaussian_dir.clone());
    }
    match mode {
        TrainerMode::Standard => (
            format!(
                "{} train.py -s {} -m {}",
                tools.python_exe,
                shq(dataset_root),
                shq(out_dir)
            ),
            tools.gaussian_dir.clone(),
        ),
        TrainerMode::Mini => (
            format!(
                "{} msv2/train.py -s {} -m {} --imp_metric outdoor --config_path ./config/fast",
                tools.python_exe,
                shq(dataset_root),
                shq(out_dir)
            ),
            tools.trainer_dir.clone(),
        ),
    }
}

/// Persist a status record; a write failure here must not abort the stage.
fn persist(status_file: &Path, record: &StatusRecord) {
    if let Err(e) = write_status(status_file, record) {
        warn!(path = %status_file.display(), error = %e, "failed to persist status");
    }
}

/// The record written instead of running the SfM command when a usable
/// reconstruction already exists: the stage counts as fully complete.
fn convert_skip_record() -> StatusRecord {
    StatusRecord {
        stage: Stage::Convert,
        message: Some("skipped - existing data".to_string()),
        progress: Some(100),
        exit_code: None,
    }
}

fn dir_is_empty(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

/// Search the dataset tree for a sparse reconstruction left by a previous
/// (possibly partial) run or shipped inside an uploaded zip, and relocate it
/// into the canonical `sparse/` location. Entries already present in the
/// canonical tree are kept, not overwritten.
fn adopt_existing_sparse(layout: &JobLayout) -> std::io::Result<()> {
    let canonical = layout.sparse_dir();
    let Some(found) = find_sparse_dir(&layout.dataset_root, &canonical, 0) else {
        return Ok(());
    };
    info!(
        found = %found.display(),
        canonical = %canonical.display(),
        "relocating pre-existing sparse reconstruction"
    );
    fs::create_dir_all(&canonical)?;
    for entry in fs::read_dir(&found)? {
        let entry = entry?;
        let target = canonical.join(entry.file_name());
        if target.exists() {
            continue;
        }
        fs::rename(entry.path(), target)?;
    }
    Ok(())
}

fn find_sparse_dir(dir: &Path, canonical: &Path, depth: u32) -> Option<PathBuf> {
    // Zip uploads nest at most a few levels deep.
    if depth > 4 || dir == canonical {
        return None;
    }
    for entry in fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if entry.file_name() == "sparse" && path != *canonical && path.join("0").is_dir() {
            return Some(path);
        }
        if let Some(found) = find_sparse_dir(&path, canonical, depth + 1) {
            return Some(found);
        }
    }
    None
}

/// Drive the stage state machine for one job: precheck, conversion (SfM)
/// and training, persisting a status record at every transition.
///
/// All stage-level failures are converted into a terminal outcome here; the
/// caller never sees an error for a job that merely failed.
pub async fn run(
    layout: &JobLayout,
    tools: &ToolConfig,
    mode: TrainerMode,
    mut cancel: watch::Receiver<bool>,
) -> PipelineOutcome {
    let status_file = layout.status_file.clone();
    persist(&status_file, &StatusRecord::running(Stage::Init, "preparing"));

    // Precheck: refuse to spawn anything without input images.
    if !layout.input_dir.is_dir() || dir_is_empty(&layout.input_dir) {
        let mut record = StatusRecord::terminal(Stage::PrecheckFailed, 1);
        record.message = Some("input directory is missing or empty".to_string());
        persist(&status_file, &record);
        return PipelineOutcome::failed(Stage::PrecheckFailed, 1, "");
    }

    if *cancel.borrow() {
        return cancelled(&status_file, "");
    }

    // Convert (SfM) stage, skipped when a usable reconstruction exists.
    let (convert_cmd, convert_cwd) = convert_command(tools, &layout.dataset_root);
    if let Err(e) = adopt_existing_sparse(layout) {
        warn!(job_id = %layout.job_id, error = %e, "sparse relocation failed, continuing");
    }
    if layout.sparse_zero().is_dir() {
        info!(job_id = %layout.job_id, "sparse reconstruction present, skipping convert");
        persist(&status_file, &convert_skip_record());
    } else {
        persist(&status_file, &StatusRecord::running(Stage::Convert, "Running COLMAP"));
        match super::process::run_logged(
            &convert_cmd,
            Some(&convert_cwd),
            &layout.log_file,
            "CONVERT",
            &mut cancel,
        )
        .await
        {
            Ok(code) => {
                // Exit code 0 alone is not trusted: the convert wrapper is
                // known to swallow inner failures.
                let produced =
                    layout.sparse_zero().is_dir() && layout.undistorted_dir().is_dir();
                if code != 0 || !produced {
                    let exit_code = if code != 0 { code } else { 1 };
                    let mut record = StatusRecord::terminal(Stage::ConvertFailed, exit_code);
                    if code == 0 {
                        record.message =
                            Some("convert exited 0 but produced no reconstruction".to_string());
                    }
                    persist(&status_file, &record);
                    return PipelineOutcome::failed(Stage::ConvertFailed, exit_code, &convert_cmd);
                }
            }
            Err(e) => {
                error!(job_id = %layout.job_id, error = %e, "convert stage did not run");
                let mut record = StatusRecord::terminal(Stage::ConvertFailed, -1);
                record.message = Some(e.to_string());
                persist(&status_file, &record);
                return PipelineOutcome::failed(Stage::ConvertFailed, -1, &convert_cmd);
            }
        }
    }

    if *cancel.borrow() {
        return cancelled(&status_file, &convert_cmd);
    }

    // Train stage.
    let (train_cmd, train_cwd) = train_command(tools, mode, &layout.dataset_root, &layout.output_dir);
    persist(&status_file, &StatusRecord::running(Stage::Train, "Training scene"));
    match super::process::run_logged(
        &train_cmd,
        Some(&train_cwd),
        &layout.log_file,
        "TRAIN",
        &mut cancel,
    )
    .await
    {
        Ok(code) => {
            // Same postcondition discipline as convert: require an actual
            // checkpoint, not just a clean exit.
            let produced = artifacts::locate(&layout.output_dir).point_cloud.is_some();
            if code == 0 && produced {
                persist(
                    &status_file,
                    &StatusRecord {
                        stage: Stage::Done,
                        message: None,
                        progress: Some(100),
                        exit_code: Some(0),
                    },
                );
                info!(job_id = %layout.job_id, "pipeline complete");
                PipelineOutcome {
                    stage: Stage::Done,
                    exit_code: 0,
                    command: train_cmd,
                }
            } else {
                let exit_code = if code != 0 { code } else { 1 };
                let mut record = StatusRecord::terminal(Stage::TrainFailed, exit_code);
                if code == 0 {
                    record.message = Some("train exited 0 but produced no checkpoint".to_string());
                }
                persist(&status_file, &record);
                PipelineOutcome::failed(Stage::TrainFailed, exit_code, &train_cmd)
            }
        }
        Err(e) => {
            error!(job_id = %layout.job_id, error = %e, "train stage did not run");
            let mut record = StatusRecord::terminal(Stage::TrainFailed, -1);
            record.message = Some(e.to_string());
            persist(&status_file, &record);
            PipelineOutcome::failed(Stage::TrainFailed, -1, &train_cmd)
        }
    }
}

fn cancelled(status_file: &Path, command: &str) -> PipelineOutcome {
    let mut record = StatusRecord::terminal(Stage::Cancelled, -1);
    record.message = Some("cancelled".to_string());
    persist(status_file, &record);
    PipelineOutcome::failed(Stage::Cancelled, -1, command)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools() -> ToolConfig {
        ToolConfig {
            gaussian_dir: PathBuf::from("/opt/gaussian-splatting"),
            trainer_dir: PathBuf::from("/opt/mini-splatting2"),
            python_exe: "python".to_string(),
            convert_cmd: None,
            train_cmd: None,
        }
    }

    #[test]
    fn default_convert_command_targets_dataset() {
        let (cmd, cwd) = convert_command(&tools(), Path::new("/data/uploads/j1"));
        assert_eq!(cmd, "python convert.py -s '/data/uploads/j1'");
        assert_eq!(cwd, PathBuf::from("/opt/gaussian-splatting"));
    }

    #[test]
    fn template_placeholders_are_substituted() {
        let mut t = tools();
        t.convert_cmd = Some("{py} run.py --in {dataset} --tools {gs}".to_string());
        let (cmd, _) = convert_command(&t, Path::new("/d/j1"));
        assert_eq!(cmd, "python run.py --in '/d/j1' --tools '/opt/gaussian-splatting'");
    }

    #[test]
    fn train_command_varies_by_mode() {
        let (standard, cwd) =
            train_command(&tools(), TrainerMode::Standard, Path::new("/d/j1"), Path::new("/o/j1"));
        assert!(standard.starts_with("python train.py"));
        assert_eq!(cwd, PathBuf::from("/opt/gaussian-splatting"));

        let (mini, cwd) =
            train_command(&tools(), TrainerMode::Mini, Path::new("/d/j1"), Path::new("/o/j1"));
        assert!(mini.contains("msv2/train.py"));
        assert!(mini.contains("--config_path ./config/fast"));
        assert_eq!(cwd, PathBuf::from("/opt/mini-splatting2"));
    }

    #[test]
    fn quoting_survives_spaces() {
        let (cmd, _) = convert_command(&tools(), Path::new("/data/my scene"));
        assert!(cmd.contains("'/data/my scene'"));
    }

    #[test]
    fn skipped_convert_counts_as_fully_complete() {
        let record = convert_skip_record();
        assert_eq!(record.stage, Stage::Convert);
        assert_eq!(record.progress, Some(100));
        assert!(record.message.unwrap().contains("skipped"));
        assert_eq!(record.exit_code, None);
    }

    #[test]
    fn adopts_stray_sparse_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = crate::jobs::layout::DataDirs {
            upload_dir: tmp.path().join("uploads"),
            output_dir: tmp.path().join("outputs"),
            log_dir: tmp.path().join("logs"),
        };
        let layout = JobLayout::new(&dirs, "j1");
        layout.ensure_dirs().unwrap();
        // A zip upload that unpacked into input/extracted/sparse/0
        let stray = layout.input_dir.join("extracted/sparse/0");
        fs::create_dir_all(&stray).unwrap();
        fs::write(stray.join("cameras.bin"), b"bin").unwrap();

        adopt_existing_sparse(&layout).unwrap();
        assert!(layout.sparse_zero().is_dir());
        assert!(layout.sparse_zero().join("cameras.bin").is_file());
    }

    #[test]
    fn adoption_keeps_existing_canonical_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = crate::jobs::layout::DataDirs {
            upload_dir: tmp.path().join("uploads"),
            output_dir: tmp.path().join("outputs"),
            log_dir: tmp.path().join("logs"),
        };
        let layout = JobLayout::new(&dirs, "j1");
        layout.ensure_dirs().unwrap();
        fs::create_dir_all(layout.sparse_zero()).unwrap();
        fs::write(layout.sparse_zero().join("keep.bin"), b"old").unwrap();

        let stray = layout.work_dir.join("sparse/0");
        fs::create_dir_all(&stray).unwrap();
        fs::write(stray.join("keep.bin"), b"new").unwrap();

        adopt_existing_sparse(&layout).unwrap();
        // Canonical "0" already existed, so the stray one is left alone.
        assert_eq!(
            fs::read(layout.sparse_zero().join("keep.bin")).unwrap(),
            b"old"
        );
    }
}
