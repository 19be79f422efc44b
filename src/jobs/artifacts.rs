use std::fs;
use std::path::{Path, PathBuf};

/// Result file name inside each checkpoint directory.
const POINT_CLOUD_FILE: &str = "point_cloud.ply";
/// Container of checkpoint directories under the output tree.
const CHECKPOINT_CONTAINER: &str = "point_cloud";
/// Optional camera-parameters result at the output root.
const CAMERAS_FILE: &str = "cameras.json";

/// Resolved result paths for one job. Fields are `None` while the job has
/// not produced the corresponding file yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobArtifacts {
    pub point_cloud: Option<PathBuf>,
    pub cameras: Option<PathBuf>,
}

/// Scan `output_dir` for the pipeline's expected result files.
///
/// When several `iteration_<N>` checkpoints exist, the numerically highest
/// one wins. Absence of any artifact is an expected state (the job may still
/// be running) and yields `None`, never an error.
pub fn locate(output_dir: &Path) -> JobArtifacts {
    let cameras = output_dir.join(CAMERAS_FILE);
    JobArtifacts {
        point_cloud: latest_checkpoint(&output_dir.join(CHECKPOINT_CONTAINER)),
        cameras: cameras.is_file().then_some(cameras),
    }
}

fn latest_checkpoint(container: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(container).ok()?;
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(iter) = name
            .to_str()
            .and_then(|n| n.strip_prefix("iteration_"))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        let ply = path.join(POINT_CLOUD_FILE);
        if !ply.is_file() {
            continue;
        }
        if best.as_ref().map_or(true, |(n, _)| iter > *n) {
            best = Some((iter, ply));
        }
    }
    best.map(|(_, path)| path)
}
